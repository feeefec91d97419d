//! JIT compilation
//!
//! Verified bytecode functions are lowered one at a time into machine
//! instructions written to code pages from the [`MemoryManager`]. Forward
//! branches are patched once the whole function is laid out; calls between
//! functions are patched when the load unit is linked. Nothing runs until
//! every patch is in and the pages have been made executable.
//!
//! - [`isa`]: machine instruction set, encoder and decoder
//! - `compiler`: per-function lowering with the fixed frame layout
//! - `code_cache`: compiled functions and call resolution
//! - `engine`: compile, link and finalize a load unit
//! - `disasm`: listings driven by the instruction-offset table
//!
//! [`MemoryManager`]: crate::memory::MemoryManager

pub mod isa;

mod assembler;
mod code_cache;
mod compiler;
mod disasm;
mod engine;

pub use assembler::Assembler;
pub use code_cache::CodeCache;
pub use compiler::{
    compile_function, CallMode, CompileContext, CompiledFunction, PatchWidth, UnresolvedBranch,
    UnresolvedCall,
};
pub use disasm::{disassemble, Disassembly, DisassemblyLine};
pub use engine::JitEngine;

use crate::bytecode::FunctionId;
use crate::memory::MemoryError;
use isa::DecodeError;

/// Error during compilation or linking
#[derive(Debug, thiserror::Error)]
pub enum CompileError {
    #[error(transparent)]
    Memory(#[from] MemoryError),

    #[error("unknown function {0:?}")]
    UnknownFunction(FunctionId),

    /// Compilation needs the verifier's operand-type snapshots
    #[error("function {0} has not been verified")]
    NotVerified(String),

    #[error("native routine {0} has no compiled body")]
    NativeFunction(String),

    #[error("function {0} has more arguments or locals than a frame can hold")]
    FrameTooLarge(String),

    #[error("type #{0} has no load/store width")]
    UnsupportedWidth(u32),

    /// A call whose callee was never compiled
    #[error("call from {caller:?} to {callee:?} cannot be resolved")]
    UnresolvedCall {
        caller: FunctionId,
        callee: FunctionId,
    },

    #[error("call at {patch_address:#x} cannot reach {target:#x} with a rel32 operand")]
    CallOutOfRange { patch_address: u64, target: u64 },

    #[error("branch at native offset {0:#x} cannot reach its target")]
    BranchOutOfRange(usize),

    #[error("patch at offset {0:#x} lies outside the emitted code")]
    PatchOutOfRange(usize),

    /// Pages were about to be sealed with patches outstanding
    #[error("{0} call sites are still unpatched")]
    Unpatched(usize),

    #[error("cannot decode emitted code: {0}")]
    Decode(#[from] DecodeError),
}
