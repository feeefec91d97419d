//! Frame layout ABI
//!
//! ```text
//!   higher addresses
//!   [bp + 16 + 8*(A-1-i)]   caller-pushed argument i (last argument lowest)
//!   [bp + 8]                return address
//!   [bp]                    saved caller bp
//!   [bp - 8*(1+i)]          argument i
//!   [bp - 8*(1+A+j)]        local j
//!   [bp - 8*(1+A+L+k)]      operand k (0 = deepest)
//!   lower addresses
//! ```
//!
//! Only the argument and local counts vary between functions.

use super::NativeStack;
use crate::bytecode::{FunctionId, ManagedFunction};
use crate::types::TypeId;

/// Size of every stack slot
pub const SLOT_SIZE: u64 = 8;

/// Offset of the return address from bp
pub const RETURN_ADDRESS_OFFSET: i32 = 8;

/// Offset of the lowest caller-pushed argument from bp
pub const CALLER_ARGUMENTS_OFFSET: i32 = 16;

#[inline]
fn below(slots: usize) -> i32 {
    -((SLOT_SIZE as i32) * (1 + slots as i32))
}

/// bp-relative offset of argument `index`
#[inline]
pub fn argument_offset(index: usize) -> i32 {
    below(index)
}

/// bp-relative offset of local `index`
#[inline]
pub fn local_offset(arguments: usize, index: usize) -> i32 {
    below(arguments + index)
}

/// bp-relative offset of operand-stack slot `index`
#[inline]
pub fn operand_offset(arguments: usize, locals: usize, index: usize) -> i32 {
    below(arguments + locals + index)
}

/// bp-relative offset of caller-pushed argument `index`
#[inline]
pub fn caller_argument_offset(arguments: usize, index: usize) -> i32 {
    CALLER_ARGUMENTS_OFFSET + (SLOT_SIZE as i32) * (arguments - 1 - index) as i32
}

#[inline]
pub(crate) fn slot_address(base_pointer: u64, offset: i32) -> u64 {
    base_pointer.wrapping_add_signed(offset as i64)
}

/// Which part of a frame a slot belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotKind {
    Argument,
    Local,
    Operand,
}

/// One live slot of a frame together with its static type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameSlot {
    pub kind: SlotKind,
    pub index: usize,
    pub ty: TypeId,
    pub address: u64,
    pub value: u64,
}

/// A frame seen through its base pointer, function and current instruction
pub struct StackFrame<'a> {
    pub base_pointer: u64,
    pub function_id: FunctionId,
    pub function: &'a ManagedFunction,
    pub instruction: usize,
}

impl<'a> StackFrame<'a> {
    /// Every argument, local and live operand slot, in that order
    ///
    /// Returns the address of the first slot that lies outside the stack.
    pub fn slots(&self, stack: &NativeStack) -> Result<Vec<FrameSlot>, u64> {
        let arguments = self.function.argument_count();
        let locals = self.function.local_count();
        let parameter_types = &self.function.definition().parameters;

        let mut slots = Vec::with_capacity(arguments + locals);
        let mut read = |kind: SlotKind, index: usize, ty: TypeId, offset: i32| -> Result<(), u64> {
            let address = slot_address(self.base_pointer, offset);
            let value = stack.read(address).ok_or(address)?;
            slots.push(FrameSlot {
                kind,
                index,
                ty,
                address,
                value,
            });
            Ok(())
        };

        for (i, &ty) in parameter_types.iter().enumerate() {
            read(SlotKind::Argument, i, ty, argument_offset(i))?;
        }
        for (j, &ty) in self.function.locals().iter().enumerate() {
            read(SlotKind::Local, j, ty, local_offset(arguments, j))?;
        }
        for (k, &ty) in self.function.operand_types(self.instruction).iter().enumerate() {
            read(SlotKind::Operand, k, ty, operand_offset(arguments, locals, k))?;
        }
        Ok(slots)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offsets() {
        assert_eq!(argument_offset(0), -8);
        assert_eq!(argument_offset(2), -24);
        assert_eq!(local_offset(2, 0), -24);
        assert_eq!(local_offset(2, 1), -32);
        assert_eq!(operand_offset(2, 2, 0), -40);
        assert_eq!(caller_argument_offset(3, 2), 16);
        assert_eq!(caller_argument_offset(3, 0), 32);
    }

    #[test]
    fn test_regions_are_disjoint_and_contiguous() {
        let (a, l) = (3, 4);
        let mut offsets: Vec<i32> = (0..a).map(argument_offset).collect();
        offsets.extend((0..l).map(|j| local_offset(a, j)));
        offsets.extend((0..5).map(|k| operand_offset(a, l, k)));
        for pair in offsets.windows(2) {
            assert_eq!(pair[0] - pair[1], SLOT_SIZE as i32);
        }
    }
}
