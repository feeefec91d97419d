//! Disassembly listings
//!
//! Pairs every bytecode instruction with the machine instructions emitted for
//! it, using the compiler's instruction-offset table.

use super::compiler::CompiledFunction;
use super::isa::{decode, MachineInstr};
use super::CompileError;
use crate::bytecode::{Instruction, ManagedFunction};
use crate::memory::MemoryManager;
use crate::types::TypeProvider;
use std::fmt;

/// Machine code of one bytecode instruction
#[derive(Debug, Clone, PartialEq)]
pub struct DisassemblyLine {
    pub index: usize,
    pub instruction: Instruction,
    pub native_offset: u32,
    /// Decoded machine instructions with their offsets; empty for unreachable code
    pub code: Vec<(u32, MachineInstr)>,
}

/// Listing of a compiled function
#[derive(Debug, Clone, PartialEq)]
pub struct Disassembly {
    pub signature: String,
    pub entry: u64,
    pub prologue: Vec<(u32, MachineInstr)>,
    pub lines: Vec<DisassemblyLine>,
}

fn decode_range(bytes: &[u8], start: u32, end: u32) -> Result<Vec<(u32, MachineInstr)>, CompileError> {
    let mut out = Vec::new();
    let mut offset = start;
    while offset < end {
        let (instruction, len) = decode(&bytes[offset as usize..end as usize])?;
        out.push((offset, instruction));
        offset += len as u32;
    }
    Ok(out)
}

/// Decode the code of `compiled` back out of its code page
pub fn disassemble(
    compiled: &CompiledFunction,
    function: &ManagedFunction,
    types: &TypeProvider,
    memory: &MemoryManager,
) -> Result<Disassembly, CompileError> {
    let bytes = memory.read(compiled.entry, compiled.size)?;
    let prologue = decode_range(bytes, 0, compiled.prologue_size())?;

    let mut lines = Vec::with_capacity(function.instructions().len());
    for (index, &instruction) in function.instructions().iter().enumerate() {
        let Some(range) = compiled.instruction_range(index) else {
            break;
        };
        lines.push(DisassemblyLine {
            index,
            instruction,
            native_offset: range.start,
            code: decode_range(bytes, range.start, range.end)?,
        });
    }

    Ok(Disassembly {
        signature: function.definition().signature(types),
        entry: compiled.entry,
        prologue,
        lines,
    })
}

impl fmt::Display for Disassembly {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "; {} @ {:#x}", self.signature, self.entry)?;
        for (offset, machine) in &self.prologue {
            writeln!(f, "           {:04x}  {}", offset, machine)?;
        }
        for line in &self.lines {
            writeln!(f, "{:04}  {}", line.index, line.instruction)?;
            for (offset, machine) in &line.code {
                writeln!(f, "           {:04x}  {}", offset, machine)?;
            }
        }
        Ok(())
    }
}
