//! Instruction buffer

use super::isa::MachineInstr;
use super::CompileError;

/// Growable buffer of encoded machine instructions
///
/// Code is assembled here first and copied to its code page once its size
/// is known; branch operands are patched in the buffer.
#[derive(Debug, Default)]
pub struct Assembler {
    code: Vec<u8>,
}

impl Assembler {
    pub fn new() -> Self {
        Self { code: Vec::new() }
    }

    /// Append an instruction, returning its offset
    pub fn emit(&mut self, instruction: MachineInstr) -> usize {
        let offset = self.code.len();
        instruction.encode(&mut self.code);
        offset
    }

    /// Offset of the next instruction
    #[inline]
    pub fn position(&self) -> usize {
        self.code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    pub fn bytes(&self) -> &[u8] {
        &self.code
    }

    pub fn patch_i32(&mut self, at: usize, value: i32) -> Result<(), CompileError> {
        self.patch(at, &value.to_le_bytes())
    }

    pub fn patch_u64(&mut self, at: usize, value: u64) -> Result<(), CompileError> {
        self.patch(at, &value.to_le_bytes())
    }

    fn patch(&mut self, at: usize, bytes: &[u8]) -> Result<(), CompileError> {
        self.code
            .get_mut(at..at + bytes.len())
            .ok_or(CompileError::PatchOutOfRange(at))?
            .copy_from_slice(bytes);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jit::isa::{decode, JUMP_PATCH_OFFSET};

    #[test]
    fn test_emit_and_patch() {
        let mut asm = Assembler::new();
        assert!(asm.is_empty());
        let first = asm.emit(MachineInstr::PushImm(1));
        let jump = asm.emit(MachineInstr::Jump(0));
        assert_eq!(first, 0);
        assert_eq!(jump, MachineInstr::PushImm(1).encoded_len());

        asm.patch_i32(jump + JUMP_PATCH_OFFSET, -7).unwrap();
        let (decoded, _) = decode(&asm.bytes()[jump..]).unwrap();
        assert_eq!(decoded, MachineInstr::Jump(-7));
    }

    #[test]
    fn test_patch_outside_buffer() {
        let mut asm = Assembler::new();
        asm.emit(MachineInstr::Pop);
        assert!(matches!(
            asm.patch_u64(0, 1),
            Err(CompileError::PatchOutOfRange(0))
        ));
    }
}
