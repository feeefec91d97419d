//! Kestrel engine
//!
//! A managed execution runtime for a stack-based bytecode language:
//! - Type system (primitive, class and array descriptors with frozen layouts)
//! - Bytecode boundary types and the verifier contract
//! - Paged memory manager for executable and read-only memory
//! - JIT compiler with a fixed, GC-legible stack frame ABI
//! - Single-generation heap and a stack-walking mark-sweep collector
//! - The `Vm` facade that loads a unit, links it and runs `main`

#![warn(rust_2018_idioms)]
#![allow(clippy::new_without_default)]

#[cfg(not(unix))]
compile_error!("kestrel-engine commits pages through POSIX mmap and only supports unix targets");

pub mod bytecode;
pub mod handle;
pub mod jit;
pub mod memory;
pub mod types;
pub mod vm;

pub use bytecode::{
    FunctionBuilder, FunctionDefinition, FunctionId, Instruction, ManagedFunction, NativeRoutine,
};
pub use handle::{Handle, SlotTable};
pub use types::{BaseType, ClassMetadata, PrimitiveType, TypeId, TypeProvider};
pub use vm::{RuntimeConfig, TrapKind, Vm, VmError};
