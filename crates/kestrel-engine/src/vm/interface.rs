//! Runtime interface
//!
//! Everything compiled code needs from the runtime: code and constant fetch,
//! native stack and heap access, and the callbacks for allocation, collection,
//! call-stack bookkeeping, diagnostics and traps. The machine reaches the VM
//! only through this trait, through an explicit context rather than any
//! global state.

use super::error::{TrapKind, VmError};
use crate::bytecode::NativeRoutine;
use crate::jit::isa::Width;

pub trait RuntimeInterface {
    /// Executable bytes starting at `address`
    fn fetch(&self, address: u64) -> Result<&[u8], VmError>;

    /// 32-bit constant from a read-only page
    fn read_constant(&self, address: u64) -> Result<u32, VmError>;

    /// Highest native stack address; the initial stack pointer
    fn stack_top(&self) -> u64;

    /// Lowest usable native stack address
    fn stack_limit(&self) -> u64;

    fn read_slot(&self, address: u64) -> Result<u64, VmError>;

    fn write_slot(&mut self, address: u64, value: u64) -> Result<(), VmError>;

    /// Heap load; Byte zero-extends, Dword sign-extends
    fn load(&self, address: u64, width: Width) -> Result<u64, VmError>;

    /// Heap store of the low `width` bytes of `value`
    fn store(&mut self, address: u64, width: Width, value: u64) -> Result<(), VmError>;

    /// `CreateArray(arrayTypeId, length)`
    fn create_array(&mut self, array_type: u32, length: i32) -> Result<u64, VmError>;

    /// `CreateClass(classTypeId)`
    fn create_class(&mut self, class_type: u32) -> Result<u64, VmError>;

    /// `GarbageCollect(basePointer, functionId, instructionIndex)`
    fn garbage_collect(
        &mut self,
        base_pointer: u64,
        function: u64,
        instruction: u32,
    ) -> Result<(), VmError>;

    /// Write the active frames, innermost first
    fn print_call_stack(
        &mut self,
        base_pointer: u64,
        function: u64,
        instruction: u32,
    ) -> Result<(), VmError>;

    /// Run a routine reached through its reserved call address
    fn call_native(&mut self, routine: NativeRoutine, arguments: &[u64]) -> Result<(), VmError>;

    /// Record a call from `function` at call site `instruction`
    fn push_call_frame(&mut self, function: u64, instruction: u32) -> Result<(), VmError>;

    fn pop_call_frame(&mut self) -> Result<(), VmError>;

    /// Report a fatal trap and build the error that stops execution
    fn trap(&mut self, kind: TrapKind, message: String) -> VmError;
}
