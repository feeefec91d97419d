//! Bytecode verifier
//!
//! Abstract interpretation over the instruction stream. A function either is
//! rejected, or gets the static type of every evaluation-stack slot before
//! every reachable instruction. Those snapshots are what lets the collector
//! classify the operand slots of a native frame as references or scalars.

use super::{FunctionId, Instruction, ManagedFunction};
use crate::handle::SlotTable;
use crate::types::{BaseType, PrimitiveType, TypeId, TypeProvider};

/// Why a function was rejected
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VerifyErrorKind {
    #[error("function has no instructions")]
    EmptyBody,
    #[error("evaluation stack underflow")]
    StackUnderflow,
    #[error("expected {expected}, found {found}")]
    TypeMismatch { expected: String, found: String },
    #[error("operation is not defined for {0}")]
    UnsupportedOperand(String),
    #[error("local {0} is not declared")]
    BadLocal(u16),
    #[error("argument {0} is not declared")]
    BadArgument(u16),
    #[error("local {0} has type Void")]
    VoidLocal(usize),
    #[error("unresolved function reference")]
    UnresolvedFunction,
    #[error("unresolved type reference #{0}")]
    UnresolvedType(u32),
    #[error("field #{index} does not match the layout of {class}")]
    UnresolvedField { class: String, index: usize },
    #[error("branch target {0} is out of range")]
    BranchOutOfRange(usize),
    #[error("stack shape differs where control flow merges: {existing:?} vs {incoming:?}")]
    StackMismatch { existing: Vec<String>, incoming: Vec<String> },
    #[error("control falls off the end of the function")]
    FallsOffEnd,
    #[error("constructors must return Void")]
    ConstructorReturnType,
    #[error("member functions must take their class as first parameter")]
    MissingReceiver,
    #[error("instance call target is not an instance method")]
    NotAnInstanceMethod,
}

/// A rejected function
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("verification of {function} failed at instruction {index}: {kind}")]
pub struct VerifyError {
    pub function: String,
    pub index: usize,
    pub kind: VerifyErrorKind,
}

/// Snapshot table: `None` marks unreachable instructions
pub type OperandTypes = Vec<Option<Vec<TypeId>>>;

/// Verify `function`, returning its per-instruction operand-type snapshots
pub fn verify(
    function: &ManagedFunction,
    types: &TypeProvider,
    functions: &SlotTable<ManagedFunction>,
) -> Result<OperandTypes, VerifyError> {
    Verifier {
        function,
        types,
        functions,
    }
    .run()
}

struct Verifier<'a> {
    function: &'a ManagedFunction,
    types: &'a TypeProvider,
    functions: &'a SlotTable<ManagedFunction>,
}

/// Evaluation stack during abstract interpretation
struct Stack<'v, 'a> {
    verifier: &'v Verifier<'a>,
    slots: Vec<TypeId>,
}

impl Stack<'_, '_> {
    fn pop(&mut self) -> Result<TypeId, VerifyErrorKind> {
        self.slots.pop().ok_or(VerifyErrorKind::StackUnderflow)
    }

    fn pop_expect(&mut self, expected: TypeId) -> Result<(), VerifyErrorKind> {
        let found = self.pop()?;
        self.verifier.expect(expected, found)
    }

    /// Pop two operands of the same type
    fn pop_pair(&mut self) -> Result<TypeId, VerifyErrorKind> {
        let right = self.pop()?;
        let left = self.pop()?;
        self.verifier.expect(left, right)?;
        Ok(left)
    }

    fn push(&mut self, ty: TypeId) {
        self.slots.push(ty);
    }
}

impl<'a> Verifier<'a> {
    fn error(&self, index: usize, kind: VerifyErrorKind) -> VerifyError {
        VerifyError {
            function: self.function.definition().signature(self.types),
            index,
            kind,
        }
    }

    fn run(&self) -> Result<OperandTypes, VerifyError> {
        self.check_definition().map_err(|kind| self.error(0, kind))?;

        let instructions = self.function.instructions();
        if instructions.is_empty() {
            return Err(self.error(0, VerifyErrorKind::EmptyBody));
        }

        let mut states: OperandTypes = vec![None; instructions.len()];
        states[0] = Some(Vec::new());
        let mut worklist = vec![0usize];

        while let Some(index) = worklist.pop() {
            let entry = states[index].clone().unwrap_or_default();
            let mut stack = Stack {
                verifier: self,
                slots: entry,
            };
            let instruction = &instructions[index];
            self.step(instruction, &mut stack)
                .map_err(|kind| self.error(index, kind))?;

            let mut successors = Vec::with_capacity(2);
            if let Some(target) = instruction.branch_target() {
                if target >= instructions.len() {
                    return Err(self.error(index, VerifyErrorKind::BranchOutOfRange(target)));
                }
                successors.push(target);
            }
            if !instruction.ends_block() {
                if index + 1 >= instructions.len() {
                    return Err(self.error(index, VerifyErrorKind::FallsOffEnd));
                }
                successors.push(index + 1);
            }

            for successor in successors {
                match &states[successor] {
                    None => {
                        states[successor] = Some(stack.slots.clone());
                        worklist.push(successor);
                    }
                    Some(existing) if *existing == stack.slots => {}
                    Some(existing) => {
                        let kind = VerifyErrorKind::StackMismatch {
                            existing: self.names(existing),
                            incoming: self.names(&stack.slots),
                        };
                        return Err(self.error(successor, kind));
                    }
                }
            }
        }

        Ok(states)
    }

    fn check_definition(&self) -> Result<(), VerifyErrorKind> {
        let definition = self.function.definition();
        for &ty in definition.parameters.iter().chain(self.function.locals()) {
            self.resolve(ty)?;
        }
        self.resolve(definition.return_type)?;
        if let Some(position) = self
            .function
            .locals()
            .iter()
            .position(|&ty| ty == self.types.void())
        {
            return Err(VerifyErrorKind::VoidLocal(position));
        }
        if let Some(class) = definition.class {
            if definition.parameters.first() != Some(&class) {
                return Err(VerifyErrorKind::MissingReceiver);
            }
        }
        if definition.constructor && definition.return_type != self.types.void() {
            return Err(VerifyErrorKind::ConstructorReturnType);
        }
        Ok(())
    }

    fn resolve(&self, ty: TypeId) -> Result<&'a BaseType, VerifyErrorKind> {
        self.types
            .try_get(ty)
            .ok_or(VerifyErrorKind::UnresolvedType(ty.as_u32()))
    }

    fn callee(&self, id: FunctionId) -> Result<&'a ManagedFunction, VerifyErrorKind> {
        self.functions.get(id).ok_or(VerifyErrorKind::UnresolvedFunction)
    }

    fn names(&self, slots: &[TypeId]) -> Vec<String> {
        slots.iter().map(|&ty| self.types.name(ty).to_string()).collect()
    }

    fn expect(&self, expected: TypeId, found: TypeId) -> Result<(), VerifyErrorKind> {
        if expected == found {
            Ok(())
        } else {
            Err(VerifyErrorKind::TypeMismatch {
                expected: self.types.name(expected).to_string(),
                found: self.types.name(found).to_string(),
            })
        }
    }

    fn unsupported(&self, ty: TypeId) -> VerifyErrorKind {
        VerifyErrorKind::UnsupportedOperand(self.types.name(ty).to_string())
    }

    fn is_numeric(&self, ty: TypeId) -> bool {
        matches!(
            self.types.try_get(ty).and_then(BaseType::as_primitive),
            Some(PrimitiveType::Int | PrimitiveType::Float)
        )
    }

    fn array_element(&self, array: TypeId) -> Result<TypeId, VerifyErrorKind> {
        self.types
            .element_type(array)
            .ok_or_else(|| self.unsupported(array))
    }

    fn step(&self, instruction: &Instruction, stack: &mut Stack<'_, 'a>) -> Result<(), VerifyErrorKind> {
        let types = self.types;
        match *instruction {
            Instruction::Nop => {}
            Instruction::Pop => {
                stack.pop()?;
            }
            Instruction::Duplicate => {
                let top = stack.pop()?;
                stack.push(top);
                stack.push(top);
            }
            Instruction::LoadInt(_) => stack.push(types.int()),
            Instruction::LoadFloat(_) => stack.push(types.float()),
            Instruction::LoadTrue | Instruction::LoadFalse => stack.push(types.bool()),
            Instruction::LoadNull(ty) => {
                if !self.resolve(ty)?.is_reference() {
                    return Err(self.unsupported(ty));
                }
                stack.push(ty);
            }
            Instruction::LoadLocal(index) => {
                let ty = *self
                    .function
                    .locals()
                    .get(index as usize)
                    .ok_or(VerifyErrorKind::BadLocal(index))?;
                stack.push(ty);
            }
            Instruction::StoreLocal(index) => {
                let ty = *self
                    .function
                    .locals()
                    .get(index as usize)
                    .ok_or(VerifyErrorKind::BadLocal(index))?;
                stack.pop_expect(ty)?;
            }
            Instruction::LoadArgument(index) => {
                let ty = *self
                    .function
                    .definition()
                    .parameters
                    .get(index as usize)
                    .ok_or(VerifyErrorKind::BadArgument(index))?;
                stack.push(ty);
            }
            Instruction::Add | Instruction::Sub | Instruction::Mul | Instruction::Div => {
                let ty = stack.pop_pair()?;
                if !self.is_numeric(ty) {
                    return Err(self.unsupported(ty));
                }
                stack.push(ty);
            }
            Instruction::And | Instruction::Or => {
                let ty = stack.pop_pair()?;
                self.expect(types.bool(), ty)?;
                stack.push(ty);
            }
            Instruction::Not => {
                stack.pop_expect(types.bool())?;
                stack.push(types.bool());
            }
            Instruction::ConvertIntToFloat => {
                stack.pop_expect(types.int())?;
                stack.push(types.float());
            }
            Instruction::ConvertFloatToInt => {
                stack.pop_expect(types.float())?;
                stack.push(types.int());
            }
            Instruction::CompareEqual
            | Instruction::CompareNotEqual
            | Instruction::CompareGreaterThan
            | Instruction::CompareGreaterThanOrEqual
            | Instruction::CompareLessThan
            | Instruction::CompareLessThanOrEqual
            | Instruction::BranchEqual(_)
            | Instruction::BranchNotEqual(_)
            | Instruction::BranchGreaterThan(_)
            | Instruction::BranchGreaterThanOrEqual(_)
            | Instruction::BranchLessThan(_)
            | Instruction::BranchLessThanOrEqual(_) => {
                let ty = stack.pop_pair()?;
                let ordering = instruction.condition().is_some_and(|c| c.is_ordering());
                if (ordering && !self.is_numeric(ty)) || ty == types.void() {
                    return Err(self.unsupported(ty));
                }
                if instruction.branch_target().is_none() {
                    stack.push(types.bool());
                }
            }
            Instruction::Branch(_) => {}
            Instruction::Call(id) => {
                let callee = self.callee(id)?;
                self.call(callee, stack)?;
            }
            Instruction::CallInstance(id) => {
                let callee = self.callee(id)?;
                let definition = callee.definition();
                match definition.class {
                    Some(class) if definition.parameters.first() == Some(&class) => {}
                    _ => return Err(VerifyErrorKind::NotAnInstanceMethod),
                }
                self.call(callee, stack)?;
            }
            Instruction::Return => {
                let return_type = self.function.definition().return_type;
                if return_type != types.void() {
                    stack.pop_expect(return_type)?;
                }
            }
            Instruction::NewArray(array) => {
                self.resolve(array)?;
                self.array_element(array)?;
                stack.pop_expect(types.int())?;
                stack.push(array);
            }
            Instruction::LoadElement(array) => {
                self.resolve(array)?;
                let element = self.array_element(array)?;
                stack.pop_expect(types.int())?;
                stack.pop_expect(array)?;
                stack.push(element);
            }
            Instruction::StoreElement(array) => {
                self.resolve(array)?;
                let element = self.array_element(array)?;
                stack.pop_expect(element)?;
                stack.pop_expect(types.int())?;
                stack.pop_expect(array)?;
            }
            Instruction::LoadArrayLength => {
                let array = stack.pop()?;
                if !self.resolve(array)?.is_array() {
                    return Err(self.unsupported(array));
                }
                stack.push(types.int());
            }
            Instruction::NewObject(class) => {
                if types.class_metadata(class).is_none() {
                    return Err(VerifyErrorKind::UnresolvedType(class.as_u32()));
                }
                stack.push(class);
            }
            Instruction::LoadField(field) => {
                self.check_field(field)?;
                stack.pop_expect(field.class)?;
                stack.push(field.ty);
            }
            Instruction::StoreField(field) => {
                self.check_field(field)?;
                stack.pop_expect(field.ty)?;
                stack.pop_expect(field.class)?;
            }
        }
        Ok(())
    }

    fn call(&self, callee: &ManagedFunction, stack: &mut Stack<'_, 'a>) -> Result<(), VerifyErrorKind> {
        let definition = callee.definition();
        for &ty in definition.parameters.iter().chain([&definition.return_type]) {
            self.resolve(ty)?;
        }
        for &parameter in definition.parameters.iter().rev() {
            stack.pop_expect(parameter)?;
        }
        if definition.return_type != self.types.void() {
            stack.push(definition.return_type);
        }
        Ok(())
    }

    fn check_field(&self, field: super::FieldRef) -> Result<(), VerifyErrorKind> {
        let mismatch = || VerifyErrorKind::UnresolvedField {
            class: self
                .types
                .try_get(field.class)
                .map(|_| self.types.name(field.class).to_string())
                .unwrap_or_default(),
            index: field.index,
        };
        let metadata = self.types.class_metadata(field.class).ok_or_else(mismatch)?;
        let resolved = metadata.fields().get(field.index).ok_or_else(mismatch)?;
        if resolved.layout_offset() != field.offset || resolved.ty() != field.ty {
            return Err(mismatch());
        }
        Ok(())
    }
}
