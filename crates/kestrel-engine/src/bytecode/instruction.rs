//! Bytecode instructions

use super::FunctionId;
use crate::types::TypeId;
use std::fmt;

/// A resolved field operand
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FieldRef {
    /// Owning class
    pub class: TypeId,
    /// Position in the class's declaration order
    pub index: usize,
    /// Byte offset from the start of the object data
    pub offset: u32,
    /// Field type
    pub ty: TypeId,
}

/// Comparison condition shared by compare and conditional-branch instructions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Condition {
    Equal,
    NotEqual,
    GreaterThan,
    GreaterThanOrEqual,
    LessThan,
    LessThanOrEqual,
}

impl Condition {
    /// Equal/NotEqual apply to every type, the rest only to numbers
    pub fn is_ordering(self) -> bool {
        !matches!(self, Condition::Equal | Condition::NotEqual)
    }

    /// Apply the condition to two values
    #[inline]
    pub fn evaluate<T: PartialOrd>(self, left: T, right: T) -> bool {
        match self {
            Condition::Equal => left == right,
            Condition::NotEqual => left != right,
            Condition::GreaterThan => left > right,
            Condition::GreaterThanOrEqual => left >= right,
            Condition::LessThan => left < right,
            Condition::LessThanOrEqual => left <= right,
        }
    }

    pub fn to_u8(self) -> u8 {
        match self {
            Condition::Equal => 0,
            Condition::NotEqual => 1,
            Condition::GreaterThan => 2,
            Condition::GreaterThanOrEqual => 3,
            Condition::LessThan => 4,
            Condition::LessThanOrEqual => 5,
        }
    }

    pub fn from_u8(byte: u8) -> Option<Self> {
        Some(match byte {
            0 => Condition::Equal,
            1 => Condition::NotEqual,
            2 => Condition::GreaterThan,
            3 => Condition::GreaterThanOrEqual,
            4 => Condition::LessThan,
            5 => Condition::LessThanOrEqual,
            _ => return None,
        })
    }

    /// Suffix used in mnemonics
    pub fn suffix(self) -> &'static str {
        match self {
            Condition::Equal => "eq",
            Condition::NotEqual => "ne",
            Condition::GreaterThan => "gt",
            Condition::GreaterThanOrEqual => "ge",
            Condition::LessThan => "lt",
            Condition::LessThanOrEqual => "le",
        }
    }
}

/// One opcode plus at most one resolved operand
///
/// Branch targets are instruction indices. Array instructions carry the
/// array type, object instructions the class type.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Instruction {
    Nop,
    Pop,
    Duplicate,

    LoadInt(i32),
    LoadFloat(f32),
    LoadTrue,
    LoadFalse,
    LoadNull(TypeId),

    LoadLocal(u16),
    StoreLocal(u16),
    LoadArgument(u16),

    Add,
    Sub,
    Mul,
    Div,
    And,
    Or,
    Not,
    ConvertIntToFloat,
    ConvertFloatToInt,

    CompareEqual,
    CompareNotEqual,
    CompareGreaterThan,
    CompareGreaterThanOrEqual,
    CompareLessThan,
    CompareLessThanOrEqual,

    Branch(usize),
    BranchEqual(usize),
    BranchNotEqual(usize),
    BranchGreaterThan(usize),
    BranchGreaterThanOrEqual(usize),
    BranchLessThan(usize),
    BranchLessThanOrEqual(usize),

    Call(FunctionId),
    CallInstance(FunctionId),
    Return,

    NewArray(TypeId),
    LoadElement(TypeId),
    StoreElement(TypeId),
    LoadArrayLength,

    NewObject(TypeId),
    LoadField(FieldRef),
    StoreField(FieldRef),
}

impl Instruction {
    /// Branch target, for branch instructions
    pub fn branch_target(&self) -> Option<usize> {
        match *self {
            Instruction::Branch(target)
            | Instruction::BranchEqual(target)
            | Instruction::BranchNotEqual(target)
            | Instruction::BranchGreaterThan(target)
            | Instruction::BranchGreaterThanOrEqual(target)
            | Instruction::BranchLessThan(target)
            | Instruction::BranchLessThanOrEqual(target) => Some(target),
            _ => None,
        }
    }

    /// Condition of a compare or conditional branch
    pub fn condition(&self) -> Option<Condition> {
        Some(match self {
            Instruction::CompareEqual | Instruction::BranchEqual(_) => Condition::Equal,
            Instruction::CompareNotEqual | Instruction::BranchNotEqual(_) => Condition::NotEqual,
            Instruction::CompareGreaterThan | Instruction::BranchGreaterThan(_) => {
                Condition::GreaterThan
            }
            Instruction::CompareGreaterThanOrEqual | Instruction::BranchGreaterThanOrEqual(_) => {
                Condition::GreaterThanOrEqual
            }
            Instruction::CompareLessThan | Instruction::BranchLessThan(_) => Condition::LessThan,
            Instruction::CompareLessThanOrEqual | Instruction::BranchLessThanOrEqual(_) => {
                Condition::LessThanOrEqual
            }
            _ => return None,
        })
    }

    /// Whether control never falls through to the next instruction
    pub fn ends_block(&self) -> bool {
        matches!(self, Instruction::Branch(_) | Instruction::Return)
    }

    /// Textual opcode name
    pub fn mnemonic(&self) -> &'static str {
        match self {
            Instruction::Nop => "nop",
            Instruction::Pop => "pop",
            Instruction::Duplicate => "dup",
            Instruction::LoadInt(_) => "ldc.i4",
            Instruction::LoadFloat(_) => "ldc.r4",
            Instruction::LoadTrue => "ldtrue",
            Instruction::LoadFalse => "ldfalse",
            Instruction::LoadNull(_) => "ldnull",
            Instruction::LoadLocal(_) => "ldloc",
            Instruction::StoreLocal(_) => "stloc",
            Instruction::LoadArgument(_) => "ldarg",
            Instruction::Add => "add",
            Instruction::Sub => "sub",
            Instruction::Mul => "mul",
            Instruction::Div => "div",
            Instruction::And => "and",
            Instruction::Or => "or",
            Instruction::Not => "not",
            Instruction::ConvertIntToFloat => "conv.r4",
            Instruction::ConvertFloatToInt => "conv.i4",
            Instruction::CompareEqual => "cmpeq",
            Instruction::CompareNotEqual => "cmpne",
            Instruction::CompareGreaterThan => "cmpgt",
            Instruction::CompareGreaterThanOrEqual => "cmpge",
            Instruction::CompareLessThan => "cmplt",
            Instruction::CompareLessThanOrEqual => "cmple",
            Instruction::Branch(_) => "br",
            Instruction::BranchEqual(_) => "beq",
            Instruction::BranchNotEqual(_) => "bne",
            Instruction::BranchGreaterThan(_) => "bgt",
            Instruction::BranchGreaterThanOrEqual(_) => "bge",
            Instruction::BranchLessThan(_) => "blt",
            Instruction::BranchLessThanOrEqual(_) => "ble",
            Instruction::Call(_) => "call",
            Instruction::CallInstance(_) => "callinst",
            Instruction::Return => "ret",
            Instruction::NewArray(_) => "newarr",
            Instruction::LoadElement(_) => "ldelem",
            Instruction::StoreElement(_) => "stelem",
            Instruction::LoadArrayLength => "ldlen",
            Instruction::NewObject(_) => "newobj",
            Instruction::LoadField(_) => "ldfield",
            Instruction::StoreField(_) => "stfield",
        }
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = self.mnemonic();
        match self {
            Instruction::LoadInt(value) => write!(f, "{} {}", name, value),
            Instruction::LoadFloat(value) => write!(f, "{} {}", name, value),
            Instruction::LoadNull(ty)
            | Instruction::NewArray(ty)
            | Instruction::LoadElement(ty)
            | Instruction::StoreElement(ty)
            | Instruction::NewObject(ty) => write!(f, "{} #{}", name, ty.as_u32()),
            Instruction::LoadLocal(index)
            | Instruction::StoreLocal(index)
            | Instruction::LoadArgument(index) => write!(f, "{} {}", name, index),
            Instruction::Call(function) | Instruction::CallInstance(function) => {
                write!(f, "{} fn#{}", name, function.index())
            }
            Instruction::LoadField(field) | Instruction::StoreField(field) => {
                write!(f, "{} #{}[{}]+{}", name, field.class.as_u32(), field.index, field.offset)
            }
            _ => match self.branch_target() {
                Some(target) => write!(f, "{} {:04}", name, target),
                None => f.write_str(name),
            },
        }
    }
}
