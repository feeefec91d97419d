//! Machine instruction set
//!
//! A compact x86-64-flavoured stack-machine encoding: one opcode byte followed
//! by little-endian operands. Relative jumps and calls are measured from the
//! end of the instruction. Each patchable operand sits at a fixed offset inside
//! its instruction so the compiler can leave a placeholder and fill it later.

use crate::bytecode::{Condition, NativeRoutine};
use std::fmt;

/// First address of the reserved native-routine range
///
/// Lies in the non-canonical upper half, so no code page can ever be mapped
/// there.
pub const NATIVE_ROUTINE_BASE: u64 = 0xFFFF_8000_0000_0000;

const NATIVE_ROUTINE_STRIDE: u64 = 16;

/// Call address of a native routine
pub fn native_routine_address(routine: NativeRoutine) -> u64 {
    NATIVE_ROUTINE_BASE + routine.index() as u64 * NATIVE_ROUTINE_STRIDE
}

/// Native routine called at `address`, if any
pub fn native_routine_at(address: u64) -> Option<NativeRoutine> {
    let offset = address.checked_sub(NATIVE_ROUTINE_BASE)?;
    if offset % NATIVE_ROUTINE_STRIDE != 0 {
        return None;
    }
    NativeRoutine::from_index((offset / NATIVE_ROUTINE_STRIDE) as usize)
}

/// Operand interpretation for arithmetic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NumericKind {
    Int,
    Float,
}

/// Operand interpretation for comparisons
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareKind {
    /// Low 32 bits as i32 (Int and Bool)
    Int,
    /// Low 32 bits as f32
    Float,
    /// Full 64-bit address
    Reference,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
}

/// Memory access width
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Width {
    /// 1 byte, zero-extended
    Byte,
    /// 4 bytes, sign-extended
    Dword,
    /// 8 bytes
    Qword,
}

impl Width {
    pub fn bytes(self) -> u64 {
        match self {
            Width::Byte => 1,
            Width::Dword => 4,
            Width::Qword => 8,
        }
    }

    /// Width for a value of `size` bytes at rest
    pub fn for_size(size: usize) -> Option<Self> {
        match size {
            1 => Some(Width::Byte),
            4 => Some(Width::Dword),
            8 => Some(Width::Qword),
            _ => None,
        }
    }
}

/// A decoded machine instruction
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MachineInstr {
    /// Prologue: push rbp, rbp = rsp, copy arguments, zero locals
    Enter { arguments: u16, locals: u16 },
    /// rsp = rbp, pop rbp
    Leave,
    /// Pop the return address, drop `pop_slots` caller-pushed arguments
    Ret { pop_slots: u16 },
    PushImm(i64),
    /// Push the f32 stored at a read-only address
    PushConst32(u64),
    /// Push `[rbp + disp]`
    LoadSlot(i32),
    /// Pop into `[rbp + disp]`
    StoreSlot(i32),
    Pop,
    Dup,
    PushRax,
    PopRax,
    Arith { kind: NumericKind, op: ArithOp },
    And,
    Or,
    Not,
    IntToFloat,
    FloatToInt,
    Compare { kind: CompareKind, condition: Condition },
    Jump(i32),
    JumpIf { kind: CompareKind, condition: Condition, rel: i32 },
    CallRelative(i32),
    CallAbsolute(u64),
    /// Trap if the slot `depth` below the top of stack is null
    NullCheck { depth: u16 },
    NewObject(u32),
    NewArray(u32),
    LoadField { width: Width, offset: u32 },
    StoreField { width: Width, offset: u32 },
    LoadElement(Width),
    StoreElement(Width),
    ArrayLength,
    /// Push a call-stack entry for the current function and call site
    PushFrame { function: u64, instruction: u32 },
    PopFrame,
    Collect { function: u64, instruction: u32 },
    PrintCallStack { function: u64, instruction: u32 },
}

mod op {
    pub const ENTER: u8 = 0x01;
    pub const LEAVE: u8 = 0x02;
    pub const RET: u8 = 0x03;
    pub const PUSH_IMM: u8 = 0x04;
    pub const PUSH_CONST32: u8 = 0x05;
    pub const LOAD_SLOT: u8 = 0x06;
    pub const STORE_SLOT: u8 = 0x07;
    pub const POP: u8 = 0x08;
    pub const DUP: u8 = 0x09;
    pub const PUSH_RAX: u8 = 0x0A;
    pub const POP_RAX: u8 = 0x0B;
    pub const ARITH: u8 = 0x10;
    pub const AND: u8 = 0x11;
    pub const OR: u8 = 0x12;
    pub const NOT: u8 = 0x13;
    pub const INT_TO_FLOAT: u8 = 0x14;
    pub const FLOAT_TO_INT: u8 = 0x15;
    pub const COMPARE: u8 = 0x16;
    pub const JUMP: u8 = 0x20;
    pub const JUMP_IF: u8 = 0x21;
    pub const CALL_RELATIVE: u8 = 0x22;
    pub const CALL_ABSOLUTE: u8 = 0x23;
    pub const NULL_CHECK: u8 = 0x24;
    pub const NEW_OBJECT: u8 = 0x30;
    pub const NEW_ARRAY: u8 = 0x31;
    pub const LOAD_FIELD: u8 = 0x32;
    pub const STORE_FIELD: u8 = 0x33;
    pub const LOAD_ELEMENT: u8 = 0x34;
    pub const STORE_ELEMENT: u8 = 0x35;
    pub const ARRAY_LENGTH: u8 = 0x36;
    pub const PUSH_FRAME: u8 = 0x40;
    pub const POP_FRAME: u8 = 0x41;
    pub const COLLECT: u8 = 0x42;
    pub const PRINT_CALL_STACK: u8 = 0x43;
}

/// Offset of the rel32 operand inside `Jump`
pub const JUMP_PATCH_OFFSET: usize = 1;
/// Offset of the rel32 operand inside `JumpIf`
pub const JUMP_IF_PATCH_OFFSET: usize = 3;
/// Offset of the operand inside `CallRelative` and `CallAbsolute`
pub const CALL_PATCH_OFFSET: usize = 1;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("invalid opcode byte {0:#04x}")]
    InvalidOpcode(u8),
    #[error("invalid operand byte {byte:#04x} for opcode {opcode:#04x}")]
    InvalidOperand { opcode: u8, byte: u8 },
    #[error("instruction truncated")]
    Truncated,
}

fn numeric_kind_byte(kind: NumericKind) -> u8 {
    match kind {
        NumericKind::Int => 0,
        NumericKind::Float => 1,
    }
}

fn compare_kind_byte(kind: CompareKind) -> u8 {
    match kind {
        CompareKind::Int => 0,
        CompareKind::Float => 1,
        CompareKind::Reference => 2,
    }
}

fn arith_op_byte(op: ArithOp) -> u8 {
    match op {
        ArithOp::Add => 0,
        ArithOp::Sub => 1,
        ArithOp::Mul => 2,
        ArithOp::Div => 3,
    }
}

fn width_byte(width: Width) -> u8 {
    match width {
        Width::Byte => 1,
        Width::Dword => 4,
        Width::Qword => 8,
    }
}

impl MachineInstr {
    /// Append the encoding to `out`
    pub fn encode(&self, out: &mut Vec<u8>) {
        match *self {
            MachineInstr::Enter { arguments, locals } => {
                out.push(op::ENTER);
                out.extend_from_slice(&arguments.to_le_bytes());
                out.extend_from_slice(&locals.to_le_bytes());
            }
            MachineInstr::Leave => out.push(op::LEAVE),
            MachineInstr::Ret { pop_slots } => {
                out.push(op::RET);
                out.extend_from_slice(&pop_slots.to_le_bytes());
            }
            MachineInstr::PushImm(value) => {
                out.push(op::PUSH_IMM);
                out.extend_from_slice(&value.to_le_bytes());
            }
            MachineInstr::PushConst32(address) => {
                out.push(op::PUSH_CONST32);
                out.extend_from_slice(&address.to_le_bytes());
            }
            MachineInstr::LoadSlot(disp) => {
                out.push(op::LOAD_SLOT);
                out.extend_from_slice(&disp.to_le_bytes());
            }
            MachineInstr::StoreSlot(disp) => {
                out.push(op::STORE_SLOT);
                out.extend_from_slice(&disp.to_le_bytes());
            }
            MachineInstr::Pop => out.push(op::POP),
            MachineInstr::Dup => out.push(op::DUP),
            MachineInstr::PushRax => out.push(op::PUSH_RAX),
            MachineInstr::PopRax => out.push(op::POP_RAX),
            MachineInstr::Arith { kind, op: arith } => {
                out.extend_from_slice(&[op::ARITH, numeric_kind_byte(kind), arith_op_byte(arith)]);
            }
            MachineInstr::And => out.push(op::AND),
            MachineInstr::Or => out.push(op::OR),
            MachineInstr::Not => out.push(op::NOT),
            MachineInstr::IntToFloat => out.push(op::INT_TO_FLOAT),
            MachineInstr::FloatToInt => out.push(op::FLOAT_TO_INT),
            MachineInstr::Compare { kind, condition } => {
                out.extend_from_slice(&[op::COMPARE, compare_kind_byte(kind), condition.to_u8()]);
            }
            MachineInstr::Jump(rel) => {
                out.push(op::JUMP);
                out.extend_from_slice(&rel.to_le_bytes());
            }
            MachineInstr::JumpIf { kind, condition, rel } => {
                out.extend_from_slice(&[op::JUMP_IF, compare_kind_byte(kind), condition.to_u8()]);
                out.extend_from_slice(&rel.to_le_bytes());
            }
            MachineInstr::CallRelative(rel) => {
                out.push(op::CALL_RELATIVE);
                out.extend_from_slice(&rel.to_le_bytes());
            }
            MachineInstr::CallAbsolute(address) => {
                out.push(op::CALL_ABSOLUTE);
                out.extend_from_slice(&address.to_le_bytes());
            }
            MachineInstr::NullCheck { depth } => {
                out.push(op::NULL_CHECK);
                out.extend_from_slice(&depth.to_le_bytes());
            }
            MachineInstr::NewObject(ty) => {
                out.push(op::NEW_OBJECT);
                out.extend_from_slice(&ty.to_le_bytes());
            }
            MachineInstr::NewArray(ty) => {
                out.push(op::NEW_ARRAY);
                out.extend_from_slice(&ty.to_le_bytes());
            }
            MachineInstr::LoadField { width, offset } => {
                out.extend_from_slice(&[op::LOAD_FIELD, width_byte(width)]);
                out.extend_from_slice(&offset.to_le_bytes());
            }
            MachineInstr::StoreField { width, offset } => {
                out.extend_from_slice(&[op::STORE_FIELD, width_byte(width)]);
                out.extend_from_slice(&offset.to_le_bytes());
            }
            MachineInstr::LoadElement(width) => out.extend_from_slice(&[op::LOAD_ELEMENT, width_byte(width)]),
            MachineInstr::StoreElement(width) => out.extend_from_slice(&[op::STORE_ELEMENT, width_byte(width)]),
            MachineInstr::ArrayLength => out.push(op::ARRAY_LENGTH),
            MachineInstr::PushFrame { function, instruction } => {
                encode_site(out, op::PUSH_FRAME, function, instruction)
            }
            MachineInstr::PopFrame => out.push(op::POP_FRAME),
            MachineInstr::Collect { function, instruction } => {
                encode_site(out, op::COLLECT, function, instruction)
            }
            MachineInstr::PrintCallStack { function, instruction } => {
                encode_site(out, op::PRINT_CALL_STACK, function, instruction)
            }
        }
    }

    /// Encoded length in bytes
    pub fn encoded_len(&self) -> usize {
        let mut buffer = Vec::with_capacity(16);
        self.encode(&mut buffer);
        buffer.len()
    }
}

fn encode_site(out: &mut Vec<u8>, opcode: u8, function: u64, instruction: u32) {
    out.push(opcode);
    out.extend_from_slice(&function.to_le_bytes());
    out.extend_from_slice(&instruction.to_le_bytes());
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take<const N: usize>(&mut self) -> Result<[u8; N], DecodeError> {
        let slice = self
            .bytes
            .get(self.pos..self.pos + N)
            .ok_or(DecodeError::Truncated)?;
        self.pos += N;
        let mut out = [0u8; N];
        out.copy_from_slice(slice);
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take::<1>()?[0])
    }

    fn u16(&mut self) -> Result<u16, DecodeError> {
        Ok(u16::from_le_bytes(self.take()?))
    }

    fn u32(&mut self) -> Result<u32, DecodeError> {
        Ok(u32::from_le_bytes(self.take()?))
    }

    fn i32(&mut self) -> Result<i32, DecodeError> {
        Ok(i32::from_le_bytes(self.take()?))
    }

    fn u64(&mut self) -> Result<u64, DecodeError> {
        Ok(u64::from_le_bytes(self.take()?))
    }

    fn numeric_kind(&mut self, opcode: u8) -> Result<NumericKind, DecodeError> {
        match self.u8()? {
            0 => Ok(NumericKind::Int),
            1 => Ok(NumericKind::Float),
            byte => Err(DecodeError::InvalidOperand { opcode, byte }),
        }
    }

    fn compare_kind(&mut self, opcode: u8) -> Result<CompareKind, DecodeError> {
        match self.u8()? {
            0 => Ok(CompareKind::Int),
            1 => Ok(CompareKind::Float),
            2 => Ok(CompareKind::Reference),
            byte => Err(DecodeError::InvalidOperand { opcode, byte }),
        }
    }

    fn arith_op(&mut self, opcode: u8) -> Result<ArithOp, DecodeError> {
        match self.u8()? {
            0 => Ok(ArithOp::Add),
            1 => Ok(ArithOp::Sub),
            2 => Ok(ArithOp::Mul),
            3 => Ok(ArithOp::Div),
            byte => Err(DecodeError::InvalidOperand { opcode, byte }),
        }
    }

    fn condition(&mut self, opcode: u8) -> Result<Condition, DecodeError> {
        let byte = self.u8()?;
        Condition::from_u8(byte).ok_or(DecodeError::InvalidOperand { opcode, byte })
    }

    fn width(&mut self, opcode: u8) -> Result<Width, DecodeError> {
        let byte = self.u8()?;
        Width::for_size(byte as usize).ok_or(DecodeError::InvalidOperand { opcode, byte })
    }
}

/// Decode the instruction at the start of `bytes`, returning it and its length
pub fn decode(bytes: &[u8]) -> Result<(MachineInstr, usize), DecodeError> {
    let mut r = Reader { bytes, pos: 0 };
    let opcode = r.u8()?;
    let instr = match opcode {
        op::ENTER => MachineInstr::Enter {
            arguments: r.u16()?,
            locals: r.u16()?,
        },
        op::LEAVE => MachineInstr::Leave,
        op::RET => MachineInstr::Ret { pop_slots: r.u16()? },
        op::PUSH_IMM => MachineInstr::PushImm(r.u64()? as i64),
        op::PUSH_CONST32 => MachineInstr::PushConst32(r.u64()?),
        op::LOAD_SLOT => MachineInstr::LoadSlot(r.i32()?),
        op::STORE_SLOT => MachineInstr::StoreSlot(r.i32()?),
        op::POP => MachineInstr::Pop,
        op::DUP => MachineInstr::Dup,
        op::PUSH_RAX => MachineInstr::PushRax,
        op::POP_RAX => MachineInstr::PopRax,
        op::ARITH => MachineInstr::Arith {
            kind: r.numeric_kind(opcode)?,
            op: r.arith_op(opcode)?,
        },
        op::AND => MachineInstr::And,
        op::OR => MachineInstr::Or,
        op::NOT => MachineInstr::Not,
        op::INT_TO_FLOAT => MachineInstr::IntToFloat,
        op::FLOAT_TO_INT => MachineInstr::FloatToInt,
        op::COMPARE => MachineInstr::Compare {
            kind: r.compare_kind(opcode)?,
            condition: r.condition(opcode)?,
        },
        op::JUMP => MachineInstr::Jump(r.i32()?),
        op::JUMP_IF => MachineInstr::JumpIf {
            kind: r.compare_kind(opcode)?,
            condition: r.condition(opcode)?,
            rel: r.i32()?,
        },
        op::CALL_RELATIVE => MachineInstr::CallRelative(r.i32()?),
        op::CALL_ABSOLUTE => MachineInstr::CallAbsolute(r.u64()?),
        op::NULL_CHECK => MachineInstr::NullCheck { depth: r.u16()? },
        op::NEW_OBJECT => MachineInstr::NewObject(r.u32()?),
        op::NEW_ARRAY => MachineInstr::NewArray(r.u32()?),
        op::LOAD_FIELD => MachineInstr::LoadField {
            width: r.width(opcode)?,
            offset: r.u32()?,
        },
        op::STORE_FIELD => MachineInstr::StoreField {
            width: r.width(opcode)?,
            offset: r.u32()?,
        },
        op::LOAD_ELEMENT => MachineInstr::LoadElement(r.width(opcode)?),
        op::STORE_ELEMENT => MachineInstr::StoreElement(r.width(opcode)?),
        op::ARRAY_LENGTH => MachineInstr::ArrayLength,
        op::PUSH_FRAME => MachineInstr::PushFrame {
            function: r.u64()?,
            instruction: r.u32()?,
        },
        op::POP_FRAME => MachineInstr::PopFrame,
        op::COLLECT => MachineInstr::Collect {
            function: r.u64()?,
            instruction: r.u32()?,
        },
        op::PRINT_CALL_STACK => MachineInstr::PrintCallStack {
            function: r.u64()?,
            instruction: r.u32()?,
        },
        byte => return Err(DecodeError::InvalidOpcode(byte)),
    };
    Ok((instr, r.pos))
}

fn slot(f: &mut fmt::Formatter<'_>, disp: i32) -> fmt::Result {
    if disp < 0 {
        write!(f, "[rbp-{}]", -(disp as i64))
    } else {
        write!(f, "[rbp+{}]", disp)
    }
}

impl fmt::Display for MachineInstr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            MachineInstr::Enter { arguments, locals } => write!(f, "enter {}, {}", arguments, locals),
            MachineInstr::Leave => f.write_str("leave"),
            MachineInstr::Ret { pop_slots } => write!(f, "ret {}", pop_slots as u32 * 8),
            MachineInstr::PushImm(value) => write!(f, "push {}", value),
            MachineInstr::PushConst32(address) => write!(f, "push dword [{:#x}]", address),
            MachineInstr::LoadSlot(disp) => {
                f.write_str("push qword ")?;
                slot(f, disp)
            }
            MachineInstr::StoreSlot(disp) => {
                f.write_str("pop qword ")?;
                slot(f, disp)
            }
            MachineInstr::Pop => f.write_str("add rsp, 8"),
            MachineInstr::Dup => f.write_str("push qword [rsp]"),
            MachineInstr::PushRax => f.write_str("push rax"),
            MachineInstr::PopRax => f.write_str("pop rax"),
            MachineInstr::Arith { kind, op } => {
                let name = match op {
                    ArithOp::Add => "add",
                    ArithOp::Sub => "sub",
                    ArithOp::Mul => "mul",
                    ArithOp::Div => "div",
                };
                let suffix = match kind {
                    NumericKind::Int => "i32",
                    NumericKind::Float => "f32",
                };
                write!(f, "{}.{}", name, suffix)
            }
            MachineInstr::And => f.write_str("and"),
            MachineInstr::Or => f.write_str("or"),
            MachineInstr::Not => f.write_str("not"),
            MachineInstr::IntToFloat => f.write_str("cvtsi2ss"),
            MachineInstr::FloatToInt => f.write_str("cvttss2si"),
            MachineInstr::Compare { kind, condition } => {
                write!(f, "set{}.{:?}", condition.suffix(), kind)
            }
            MachineInstr::Jump(rel) => write!(f, "jmp {:+}", rel),
            MachineInstr::JumpIf { kind, condition, rel } => {
                write!(f, "j{}.{:?} {:+}", condition.suffix(), kind, rel)
            }
            MachineInstr::CallRelative(rel) => write!(f, "call {:+}", rel),
            MachineInstr::CallAbsolute(address) => match native_routine_at(address) {
                Some(routine) => write!(f, "call {:#x} <{}>", address, routine.name()),
                None => write!(f, "call {:#x}", address),
            },
            MachineInstr::NullCheck { depth } => write!(f, "nullcheck [rsp+{}]", depth as u32 * 8),
            MachineInstr::NewObject(ty) => write!(f, "call CreateClass #{}", ty),
            MachineInstr::NewArray(ty) => write!(f, "call CreateArray #{}", ty),
            MachineInstr::LoadField { width, offset } => write!(f, "ldfld.{:?} +{}", width, offset),
            MachineInstr::StoreField { width, offset } => write!(f, "stfld.{:?} +{}", width, offset),
            MachineInstr::LoadElement(width) => write!(f, "ldelem.{:?}", width),
            MachineInstr::StoreElement(width) => write!(f, "stelem.{:?}", width),
            MachineInstr::ArrayLength => f.write_str("ldlen"),
            MachineInstr::PushFrame { function, instruction } => {
                write!(f, "pushframe fn:{:#x}, {}", function, instruction)
            }
            MachineInstr::PopFrame => f.write_str("popframe"),
            MachineInstr::Collect { function, instruction } => {
                write!(f, "call GarbageCollect fn:{:#x}, {}", function, instruction)
            }
            MachineInstr::PrintCallStack { function, instruction } => {
                write!(f, "call PrintCallStack fn:{:#x}, {}", function, instruction)
            }
        }
    }
}
