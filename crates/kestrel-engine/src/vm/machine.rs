//! Machine
//!
//! Executes compiled code straight out of the sealed code pages. Four
//! registers are kept: `rip`, `rsp`, `rbp` and `rax`. Frames on the native
//! stack follow the layout in [`crate::vm::stack::frame`], which is what lets
//! the collector decode them.

use super::error::{TrapKind, VmError};
use super::interface::RuntimeInterface;
use crate::bytecode::Condition;
use crate::jit::isa::{
    decode, native_routine_at, ArithOp, CompareKind, MachineInstr, NumericKind, Width,
};
use crate::vm::gc::ARRAY_LENGTH_SIZE;
use crate::vm::stack::frame::{caller_argument_offset, slot_address, SLOT_SIZE};

/// Return address that stops the machine
pub const HALT_ADDRESS: u64 = 0;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Registers {
    pub rip: u64,
    pub rsp: u64,
    pub rbp: u64,
    pub rax: u64,
}

#[inline]
fn int(value: u64) -> i32 {
    value as u32 as i32
}

#[inline]
fn from_int(value: i32) -> u64 {
    value as i64 as u64
}

#[inline]
fn float(value: u64) -> f32 {
    f32::from_bits(value as u32)
}

#[inline]
fn from_float(value: f32) -> u64 {
    value.to_bits() as u64
}

#[inline]
fn from_bool(value: bool) -> u64 {
    value as u64
}

/// Interpreter for the machine instruction set
pub struct Machine<'c, C: RuntimeInterface> {
    ctx: &'c mut C,
    regs: Registers,
    /// Address of the instruction being executed
    current: u64,
}

impl<'c, C: RuntimeInterface> Machine<'c, C> {
    pub fn new(ctx: &'c mut C) -> Self {
        let top = ctx.stack_top();
        Self {
            ctx,
            regs: Registers {
                rip: HALT_ADDRESS,
                rsp: top,
                rbp: 0,
                rax: 0,
            },
            current: HALT_ADDRESS,
        }
    }

    pub fn registers(&self) -> Registers {
        self.regs
    }

    /// Call the function at `entry` with `arguments` and run until it returns
    ///
    /// Returns `rax`, which holds the result of non-void functions.
    pub fn run(&mut self, entry: u64, arguments: &[u64]) -> Result<u64, VmError> {
        self.regs = Registers {
            rip: entry,
            rsp: self.ctx.stack_top(),
            rbp: 0,
            rax: 0,
        };
        for &argument in arguments {
            self.push(argument)?;
        }
        self.push(HALT_ADDRESS)?;

        while self.regs.rip != HALT_ADDRESS {
            self.step()?;
        }
        Ok(self.regs.rax)
    }

    fn fault(&self, reason: impl Into<String>) -> VmError {
        VmError::Fault {
            address: self.current,
            reason: reason.into(),
        }
    }

    fn trap(&mut self, kind: TrapKind, message: String) -> VmError {
        self.ctx.trap(kind, message)
    }

    fn push(&mut self, value: u64) -> Result<(), VmError> {
        let rsp = self.regs.rsp.wrapping_sub(SLOT_SIZE);
        if rsp < self.ctx.stack_limit() || rsp > self.regs.rsp {
            let message = format!("native stack exhausted at {:#x}", rsp);
            return Err(self.trap(TrapKind::StackOverflow, message));
        }
        self.ctx.write_slot(rsp, value)?;
        self.regs.rsp = rsp;
        Ok(())
    }

    fn pop(&mut self) -> Result<u64, VmError> {
        if self.regs.rsp >= self.ctx.stack_top() {
            return Err(self.fault("pop from an empty stack"));
        }
        let value = self.ctx.read_slot(self.regs.rsp)?;
        self.regs.rsp += SLOT_SIZE;
        Ok(value)
    }

    fn peek(&self, depth: u16) -> Result<u64, VmError> {
        self.ctx
            .read_slot(self.regs.rsp + depth as u64 * SLOT_SIZE)
    }

    fn pop_object(&mut self, access: &str) -> Result<u64, VmError> {
        let object = self.pop()?;
        if object == 0 {
            return Err(self.trap(TrapKind::NullReference, format!("{} through null", access)));
        }
        Ok(object)
    }

    /// Address of element `index` after checking it against the array length
    fn element_address(&mut self, array: u64, index: i32, width: Width) -> Result<u64, VmError> {
        let length = int(self.ctx.load(array, Width::Dword)?);
        if index < 0 || index >= length {
            let message = format!("index {} outside array of length {}", index, length);
            return Err(self.trap(TrapKind::ArrayOutOfBounds, message));
        }
        Ok(array + ARRAY_LENGTH_SIZE as u64 + index as u64 * width.bytes())
    }

    fn step(&mut self) -> Result<(), VmError> {
        self.current = self.regs.rip;
        let (instruction, len) = match decode(self.ctx.fetch(self.current)?) {
            Ok(decoded) => decoded,
            Err(e) => return Err(self.fault(e.to_string())),
        };
        let next = self.current + len as u64;
        self.regs.rip = next;

        match instruction {
            MachineInstr::Enter { arguments, locals } => {
                self.push(self.regs.rbp)?;
                self.regs.rbp = self.regs.rsp;
                let arguments = arguments as usize;
                for i in 0..arguments {
                    let address = slot_address(self.regs.rbp, caller_argument_offset(arguments, i));
                    let value = self.ctx.read_slot(address)?;
                    self.push(value)?;
                }
                for _ in 0..locals {
                    self.push(0)?;
                }
            }
            MachineInstr::Leave => {
                self.regs.rsp = self.regs.rbp;
                self.regs.rbp = self.pop()?;
            }
            MachineInstr::Ret { pop_slots } => {
                let return_address = self.pop()?;
                self.regs.rsp += pop_slots as u64 * SLOT_SIZE;
                self.regs.rip = return_address;
            }
            MachineInstr::PushImm(value) => self.push(value as u64)?,
            MachineInstr::PushConst32(address) => {
                let bits = self.ctx.read_constant(address)?;
                self.push(bits as u64)?;
            }
            MachineInstr::LoadSlot(disp) => {
                let value = self.ctx.read_slot(slot_address(self.regs.rbp, disp))?;
                self.push(value)?;
            }
            MachineInstr::StoreSlot(disp) => {
                let value = self.pop()?;
                self.ctx.write_slot(slot_address(self.regs.rbp, disp), value)?;
            }
            MachineInstr::Pop => {
                self.pop()?;
            }
            MachineInstr::Dup => {
                let value = self.peek(0)?;
                self.push(value)?;
            }
            MachineInstr::PushRax => self.push(self.regs.rax)?,
            MachineInstr::PopRax => self.regs.rax = self.pop()?,
            MachineInstr::Arith { kind, op } => {
                let right = self.pop()?;
                let left = self.pop()?;
                let result = match kind {
                    NumericKind::Int => {
                        let (l, r) = (int(left), int(right));
                        from_int(match op {
                            ArithOp::Add => l.wrapping_add(r),
                            ArithOp::Sub => l.wrapping_sub(r),
                            ArithOp::Mul => l.wrapping_mul(r),
                            ArithOp::Div => {
                                if r == 0 {
                                    let message = format!("{} / 0", l);
                                    return Err(self.trap(TrapKind::DivideByZero, message));
                                }
                                l.wrapping_div(r)
                            }
                        })
                    }
                    NumericKind::Float => {
                        let (l, r) = (float(left), float(right));
                        from_float(match op {
                            ArithOp::Add => l + r,
                            ArithOp::Sub => l - r,
                            ArithOp::Mul => l * r,
                            ArithOp::Div => l / r,
                        })
                    }
                };
                self.push(result)?;
            }
            MachineInstr::And => {
                let right = self.pop()?;
                let left = self.pop()?;
                self.push(from_bool(left != 0 && right != 0))?;
            }
            MachineInstr::Or => {
                let right = self.pop()?;
                let left = self.pop()?;
                self.push(from_bool(left != 0 || right != 0))?;
            }
            MachineInstr::Not => {
                let value = self.pop()?;
                self.push(from_bool(value == 0))?;
            }
            MachineInstr::IntToFloat => {
                let value = self.pop()?;
                self.push(from_float(int(value) as f32))?;
            }
            MachineInstr::FloatToInt => {
                let value = self.pop()?;
                self.push(from_int(float(value) as i32))?;
            }
            MachineInstr::Compare { kind, condition } => {
                let right = self.pop()?;
                let left = self.pop()?;
                self.push(from_bool(compare(kind, condition, left, right)))?;
            }
            MachineInstr::Jump(rel) => {
                self.regs.rip = next.wrapping_add_signed(rel as i64);
            }
            MachineInstr::JumpIf {
                kind,
                condition,
                rel,
            } => {
                let right = self.pop()?;
                let left = self.pop()?;
                if compare(kind, condition, left, right) {
                    self.regs.rip = next.wrapping_add_signed(rel as i64);
                }
            }
            MachineInstr::CallRelative(rel) => {
                self.push(next)?;
                self.regs.rip = next.wrapping_add_signed(rel as i64);
            }
            MachineInstr::CallAbsolute(address) => match native_routine_at(address) {
                Some(routine) => {
                    let mut arguments = vec![0u64; routine.arity()];
                    for slot in arguments.iter_mut().rev() {
                        *slot = self.pop()?;
                    }
                    self.ctx.call_native(routine, &arguments)?;
                }
                None => {
                    self.push(next)?;
                    self.regs.rip = address;
                }
            },
            MachineInstr::NullCheck { depth } => {
                if self.peek(depth)? == 0 {
                    let message = "instance call through null".to_string();
                    return Err(self.trap(TrapKind::NullReference, message));
                }
            }
            MachineInstr::NewObject(class) => {
                let object = self.ctx.create_class(class)?;
                self.push(object)?;
            }
            MachineInstr::NewArray(array) => {
                let length = int(self.pop()?);
                let object = self.ctx.create_array(array, length)?;
                self.push(object)?;
            }
            MachineInstr::LoadField { width, offset } => {
                let object = self.pop_object("field load")?;
                let value = self.ctx.load(object + offset as u64, width)?;
                self.push(value)?;
            }
            MachineInstr::StoreField { width, offset } => {
                let value = self.pop()?;
                let object = self.pop_object("field store")?;
                self.ctx.store(object + offset as u64, width, value)?;
            }
            MachineInstr::LoadElement(width) => {
                let index = int(self.pop()?);
                let array = self.pop_object("element load")?;
                let address = self.element_address(array, index, width)?;
                let value = self.ctx.load(address, width)?;
                self.push(value)?;
            }
            MachineInstr::StoreElement(width) => {
                let value = self.pop()?;
                let index = int(self.pop()?);
                let array = self.pop_object("element store")?;
                let address = self.element_address(array, index, width)?;
                self.ctx.store(address, width, value)?;
            }
            MachineInstr::ArrayLength => {
                let array = self.pop_object("array length")?;
                let length = self.ctx.load(array, Width::Dword)?;
                self.push(length)?;
            }
            MachineInstr::PushFrame {
                function,
                instruction,
            } => self.ctx.push_call_frame(function, instruction)?,
            MachineInstr::PopFrame => self.ctx.pop_call_frame()?,
            MachineInstr::Collect {
                function,
                instruction,
            } => {
                let base_pointer = self.regs.rbp;
                self.ctx.garbage_collect(base_pointer, function, instruction)?;
            }
            MachineInstr::PrintCallStack {
                function,
                instruction,
            } => {
                let base_pointer = self.regs.rbp;
                self.ctx.print_call_stack(base_pointer, function, instruction)?;
            }
        }
        Ok(())
    }
}

fn compare(kind: CompareKind, condition: Condition, left: u64, right: u64) -> bool {
    match kind {
        CompareKind::Int => condition.evaluate(int(left), int(right)),
        CompareKind::Float => condition.evaluate(float(left), float(right)),
        CompareKind::Reference => condition.evaluate(left, right),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::NativeRoutine;
    use crate::jit::isa::native_routine_address;
    use crate::vm::error::Trap;
    use crate::vm::stack::frame::{argument_offset, local_offset};
    use crate::vm::stack::NativeStack;

    const CODE_BASE: u64 = 0x10_0000;

    /// Code held in a plain buffer, a real native stack and no heap
    struct Harness {
        code: Vec<u8>,
        stack: NativeStack,
        printed: Vec<u64>,
        frames: Vec<(u64, u32)>,
    }

    impl Harness {
        fn new(program: &[MachineInstr]) -> Self {
            let mut code = Vec::new();
            for instruction in program {
                instruction.encode(&mut code);
            }
            Self {
                code,
                stack: NativeStack::new(4096).unwrap(),
                printed: Vec::new(),
                frames: Vec::new(),
            }
        }

        fn run(&mut self, entry_offset: usize) -> Result<u64, VmError> {
            Machine::new(self).run(CODE_BASE + entry_offset as u64, &[])
        }
    }

    fn unsupported() -> VmError {
        VmError::Fault {
            address: 0,
            reason: "unsupported".to_string(),
        }
    }

    impl RuntimeInterface for Harness {
        fn fetch(&self, address: u64) -> Result<&[u8], VmError> {
            let offset = address.checked_sub(CODE_BASE).ok_or_else(unsupported)? as usize;
            self.code.get(offset..).ok_or_else(unsupported)
        }
        fn read_constant(&self, _: u64) -> Result<u32, VmError> {
            Err(unsupported())
        }
        fn stack_top(&self) -> u64 {
            self.stack.top()
        }
        fn stack_limit(&self) -> u64 {
            self.stack.limit()
        }
        fn read_slot(&self, address: u64) -> Result<u64, VmError> {
            self.stack.read(address).ok_or_else(unsupported)
        }
        fn write_slot(&mut self, address: u64, value: u64) -> Result<(), VmError> {
            self.stack.write(address, value).ok_or_else(unsupported)
        }
        fn load(&self, _: u64, _: Width) -> Result<u64, VmError> {
            Err(unsupported())
        }
        fn store(&mut self, _: u64, _: Width, _: u64) -> Result<(), VmError> {
            Err(unsupported())
        }
        fn create_array(&mut self, _: u32, _: i32) -> Result<u64, VmError> {
            Err(unsupported())
        }
        fn create_class(&mut self, _: u32) -> Result<u64, VmError> {
            Err(unsupported())
        }
        fn garbage_collect(&mut self, _: u64, _: u64, _: u32) -> Result<(), VmError> {
            Err(unsupported())
        }
        fn print_call_stack(&mut self, _: u64, _: u64, _: u32) -> Result<(), VmError> {
            Err(unsupported())
        }
        fn call_native(&mut self, routine: NativeRoutine, arguments: &[u64]) -> Result<(), VmError> {
            assert_eq!(routine, NativeRoutine::PrintInt);
            self.printed.extend_from_slice(arguments);
            Ok(())
        }
        fn push_call_frame(&mut self, function: u64, instruction: u32) -> Result<(), VmError> {
            self.frames.push((function, instruction));
            Ok(())
        }
        fn pop_call_frame(&mut self) -> Result<(), VmError> {
            self.frames.pop().map(|_| ()).ok_or_else(unsupported)
        }
        fn trap(&mut self, kind: TrapKind, message: String) -> VmError {
            VmError::Trap(Trap { kind, message })
        }
    }

    fn size(program: &[MachineInstr]) -> usize {
        program.iter().map(MachineInstr::encoded_len).sum()
    }

    #[test]
    fn test_arithmetic_and_return() {
        let mut harness = Harness::new(&[
            MachineInstr::Enter { arguments: 0, locals: 0 },
            MachineInstr::PushImm(6),
            MachineInstr::PushImm(7),
            MachineInstr::Arith { kind: NumericKind::Int, op: ArithOp::Mul },
            MachineInstr::PopRax,
            MachineInstr::Leave,
            MachineInstr::Ret { pop_slots: 0 },
        ]);
        assert_eq!(harness.run(0).unwrap(), 42);
    }

    #[test]
    fn test_call_copies_arguments_and_pops_them() {
        let callee = [
            MachineInstr::Enter { arguments: 2, locals: 1 },
            MachineInstr::LoadSlot(argument_offset(0)),
            MachineInstr::LoadSlot(argument_offset(1)),
            MachineInstr::Arith { kind: NumericKind::Int, op: ArithOp::Sub },
            MachineInstr::StoreSlot(local_offset(2, 0)),
            MachineInstr::LoadSlot(local_offset(2, 0)),
            MachineInstr::PopRax,
            MachineInstr::Leave,
            MachineInstr::Ret { pop_slots: 2 },
        ];
        let prefix = [
            MachineInstr::Enter { arguments: 0, locals: 0 },
            MachineInstr::PushImm(10),
            MachineInstr::PushImm(3),
            MachineInstr::PushFrame { function: 1, instruction: 2 },
            MachineInstr::CallRelative(0),
        ];
        let call_end = size(&callee) + size(&prefix);
        let mut program = callee.to_vec();
        program.extend_from_slice(&prefix[..4]);
        program.push(MachineInstr::CallRelative(-(call_end as i32)));
        program.extend_from_slice(&[
            MachineInstr::PopFrame,
            MachineInstr::PushRax,
            MachineInstr::PopRax,
            MachineInstr::Leave,
            MachineInstr::Ret { pop_slots: 0 },
        ]);

        let mut harness = Harness::new(&program);
        let top = harness.stack.top();
        let mut machine = Machine::new(&mut harness);
        assert_eq!(machine.run(CODE_BASE + size(&callee) as u64, &[]).unwrap(), 7);
        // HALT return address popped, nothing left behind
        assert_eq!(machine.registers().rsp, top);
        assert!(harness.frames.is_empty());
    }

    #[test]
    fn test_conditional_jump() {
        // rax = (3 < 5) ? 1 : 2
        let taken = [
            MachineInstr::PushImm(1),
            MachineInstr::PopRax,
            MachineInstr::Ret { pop_slots: 0 },
        ];
        let fallthrough = [
            MachineInstr::PushImm(2),
            MachineInstr::PopRax,
            MachineInstr::Ret { pop_slots: 0 },
        ];
        let mut program = vec![
            MachineInstr::PushImm(3),
            MachineInstr::PushImm(5),
            MachineInstr::JumpIf {
                kind: CompareKind::Int,
                condition: Condition::LessThan,
                rel: size(&fallthrough) as i32,
            },
        ];
        program.extend_from_slice(&fallthrough);
        program.extend_from_slice(&taken);
        assert_eq!(Harness::new(&program).run(0).unwrap(), 1);
    }

    #[test]
    fn test_divide_by_zero_traps() {
        let mut harness = Harness::new(&[
            MachineInstr::PushImm(1),
            MachineInstr::PushImm(0),
            MachineInstr::Arith { kind: NumericKind::Int, op: ArithOp::Div },
        ]);
        let err = harness.run(0).unwrap_err();
        assert_eq!(err.trap_kind(), Some(TrapKind::DivideByZero));
    }

    #[test]
    fn test_unbounded_recursion_overflows_native_stack() {
        let enter = MachineInstr::Enter { arguments: 0, locals: 0 };
        let call_end = enter.encoded_len() + MachineInstr::CallRelative(0).encoded_len();
        let mut harness = Harness::new(&[enter, MachineInstr::CallRelative(-(call_end as i32))]);
        let err = harness.run(0).unwrap_err();
        assert_eq!(err.trap_kind(), Some(TrapKind::StackOverflow));
    }

    #[test]
    fn test_native_routine_call_pops_its_arguments() {
        let mut harness = Harness::new(&[
            MachineInstr::PushImm(99),
            MachineInstr::PushImm(-5),
            MachineInstr::CallAbsolute(native_routine_address(NativeRoutine::PrintInt)),
            MachineInstr::PopRax,
            MachineInstr::Ret { pop_slots: 0 },
        ]);
        assert_eq!(harness.run(0).unwrap(), 99);
        assert_eq!(harness.printed, vec![(-5i64) as u64]);
    }

    #[test]
    fn test_null_check() {
        let mut harness = Harness::new(&[
            MachineInstr::PushImm(0),
            MachineInstr::PushImm(1),
            MachineInstr::NullCheck { depth: 1 },
        ]);
        let err = harness.run(0).unwrap_err();
        assert_eq!(err.trap_kind(), Some(TrapKind::NullReference));
    }

    #[test]
    fn test_float_conversion_saturates() {
        let mut harness = Harness::new(&[
            MachineInstr::PushImm(from_float(1e20) as i64),
            MachineInstr::FloatToInt,
            MachineInstr::PopRax,
            MachineInstr::Ret { pop_slots: 0 },
        ]);
        assert_eq!(int(harness.run(0).unwrap()), i32::MAX);
    }
}
