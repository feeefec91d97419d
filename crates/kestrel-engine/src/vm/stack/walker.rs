//! Stack walker

use super::{CallStack, CallStackError, FrameSlot, NativeStack, StackFrame};
use crate::bytecode::{FunctionId, ManagedFunction};
use crate::handle::SlotTable;

/// Identity of the frame a walk starts from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameRef {
    pub base_pointer: u64,
    pub function: FunctionId,
    pub instruction: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WalkError {
    #[error("frame refers to unknown function {0:?}")]
    StaleFunction(FunctionId),
    #[error("frame slot at {0:#x} lies outside the native stack")]
    SlotOutOfRange(u64),
    #[error(transparent)]
    CallStack(#[from] CallStackError),
}

/// Enumerates active frames innermost first
///
/// The walk is an iterative loop bounded by the call stack's length, which
/// itself never exceeds its fixed capacity.
pub struct StackWalker<'a> {
    stack: &'a NativeStack,
    call_stack: &'a CallStack,
    functions: &'a SlotTable<ManagedFunction>,
}

impl<'a> StackWalker<'a> {
    pub fn new(
        stack: &'a NativeStack,
        call_stack: &'a CallStack,
        functions: &'a SlotTable<ManagedFunction>,
    ) -> Self {
        Self {
            stack,
            call_stack,
            functions,
        }
    }

    fn frame(&self, base_pointer: u64, function: FunctionId, instruction: usize) -> Result<StackFrame<'a>, WalkError> {
        let managed = self
            .functions
            .get(function)
            .ok_or(WalkError::StaleFunction(function))?;
        Ok(StackFrame {
            base_pointer,
            function_id: function,
            function: managed,
            instruction,
        })
    }

    /// The starting frame followed by one frame per call-stack entry
    pub fn frames(&self, start: FrameRef) -> Result<Vec<StackFrame<'a>>, WalkError> {
        let entries = self.call_stack.get_entries(start.base_pointer, self.stack)?;
        let mut frames = Vec::with_capacity(entries.len() + 1);
        frames.push(self.frame(start.base_pointer, start.function, start.instruction)?);
        for (base_pointer, entry) in entries {
            frames.push(self.frame(base_pointer, entry.function, entry.instruction as usize)?);
        }
        Ok(frames)
    }

    /// Call `visitor` for every live slot of every frame; returns the frame count
    pub fn visit<F>(&self, start: FrameRef, mut visitor: F) -> Result<usize, WalkError>
    where
        F: FnMut(&StackFrame<'a>, &FrameSlot),
    {
        let frames = self.frames(start)?;
        for frame in &frames {
            let slots = frame.slots(self.stack).map_err(WalkError::SlotOutOfRange)?;
            for slot in &slots {
                visitor(frame, slot);
            }
        }
        Ok(frames.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::{verify, FunctionDefinition, Instruction};
    use crate::types::TypeProvider;
    use crate::vm::stack::frame::{argument_offset, local_offset, operand_offset, slot_address};
    use crate::vm::stack::{CallStackEntry, SlotKind};

    #[test]
    fn test_walk_visits_current_frame_operands_then_callers() {
        let mut types = TypeProvider::new();
        let int = types.int();
        let node = types.create_class("Node", vec![]).unwrap();
        let mut functions = SlotTable::new();

        // callee(Node) -> Int, suspended at instruction 2 with [Node, Int] on its stack
        let mut callee = crate::bytecode::ManagedFunction::declared(FunctionDefinition::new(
            "callee",
            vec![node],
            int,
        ));
        callee.set_body(
            vec![int],
            vec![
                Instruction::LoadArgument(0),
                Instruction::LoadInt(1),
                Instruction::Pop,
                Instruction::Pop,
                Instruction::LoadLocal(0),
                Instruction::Return,
            ],
        );
        let callee = functions.insert(callee);
        let snapshots = verify(functions.get(callee).unwrap(), &types, &functions).unwrap();
        functions.get_mut(callee).unwrap().set_operand_types(snapshots);

        let mut caller = crate::bytecode::ManagedFunction::declared(FunctionDefinition::new(
            "caller",
            vec![],
            int,
        ));
        caller.set_body(
            vec![],
            vec![
                Instruction::NewObject(node),
                Instruction::Call(callee),
                Instruction::Return,
            ],
        );
        let caller = functions.insert(caller);
        let snapshots = verify(functions.get(caller).unwrap(), &types, &functions).unwrap();
        functions.get_mut(caller).unwrap().set_operand_types(snapshots);

        let mut stack = NativeStack::new(4096).unwrap();
        let caller_bp = stack.top() - 16;
        stack.write(caller_bp, 0).unwrap();
        stack.write(slot_address(caller_bp, operand_offset(0, 0, 0)), 0x1000).unwrap();
        let callee_bp = slot_address(caller_bp, operand_offset(0, 0, 0)) - 16;
        stack.write(callee_bp, caller_bp).unwrap();
        stack.write(slot_address(callee_bp, argument_offset(0)), 0x1000).unwrap();
        stack.write(slot_address(callee_bp, local_offset(1, 0)), 5).unwrap();
        stack.write(slot_address(callee_bp, operand_offset(1, 1, 0)), 0x1000).unwrap();
        stack.write(slot_address(callee_bp, operand_offset(1, 1, 1)), 1).unwrap();

        let mut calls = CallStack::new(4).unwrap();
        calls
            .push(CallStackEntry {
                function: caller,
                instruction: 1,
            })
            .unwrap();

        let walker = StackWalker::new(&stack, &calls, &functions);
        let mut seen = Vec::new();
        let frames = walker
            .visit(
                FrameRef {
                    base_pointer: callee_bp,
                    function: callee,
                    instruction: 2,
                },
                |frame, slot| seen.push((frame.function.name().to_string(), slot.kind, slot.ty, slot.value)),
            )
            .unwrap();

        assert_eq!(frames, 2);
        assert_eq!(
            seen,
            vec![
                ("callee".to_string(), SlotKind::Argument, node, 0x1000),
                ("callee".to_string(), SlotKind::Local, int, 5),
                ("callee".to_string(), SlotKind::Operand, node, 0x1000),
                ("callee".to_string(), SlotKind::Operand, int, 1),
                ("caller".to_string(), SlotKind::Operand, node, 0x1000),
            ]
        );
    }

    #[test]
    fn test_stale_function() {
        let types = TypeProvider::new();
        let mut functions: SlotTable<crate::bytecode::ManagedFunction> = SlotTable::new();
        let id = functions.insert(crate::bytecode::ManagedFunction::declared(FunctionDefinition::new(
            "gone",
            vec![],
            types.void(),
        )));
        functions.remove(id);

        let stack = NativeStack::new(4096).unwrap();
        let calls = CallStack::new(1).unwrap();
        let walker = StackWalker::new(&stack, &calls, &functions);
        let start = FrameRef {
            base_pointer: stack.top() - 8,
            function: id,
            instruction: 0,
        };
        assert_eq!(walker.frames(start).err(), Some(WalkError::StaleFunction(id)));
    }
}
