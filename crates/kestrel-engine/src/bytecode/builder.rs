//! Instruction stream builder with forward labels

use super::Instruction;
use crate::types::TypeId;

/// A branch target that may be bound after it is referenced
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Label(usize);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BuildError {
    #[error("label {0} is referenced but never bound")]
    UnboundLabel(usize),
}

/// Locals and instructions of a function, ready to hand to the VM
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionBody {
    pub locals: Vec<TypeId>,
    pub instructions: Vec<Instruction>,
}

struct PendingBranch {
    at: usize,
    label: Label,
    make: fn(usize) -> Instruction,
}

/// Assembles an instruction stream
///
/// ```ignore
/// let mut b = FunctionBuilder::new();
/// let done = b.label();
/// b.emit(Instruction::LoadArgument(0));
/// b.emit(Instruction::LoadInt(0));
/// b.emit_branch(Instruction::BranchEqual, done);
/// ...
/// b.bind(done);
/// ```
#[derive(Default)]
pub struct FunctionBuilder {
    locals: Vec<TypeId>,
    instructions: Vec<Instruction>,
    labels: Vec<Option<usize>>,
    pending: Vec<PendingBranch>,
}

impl FunctionBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a local, returning its index
    pub fn local(&mut self, ty: TypeId) -> u16 {
        self.locals.push(ty);
        (self.locals.len() - 1) as u16
    }

    /// Create an unbound label
    pub fn label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() - 1)
    }

    /// Bind a label to the next emitted instruction
    pub fn bind(&mut self, label: Label) {
        self.labels[label.0] = Some(self.instructions.len());
    }

    /// Append an instruction, returning its index
    pub fn emit(&mut self, instruction: Instruction) -> usize {
        self.instructions.push(instruction);
        self.instructions.len() - 1
    }

    /// Append a branch to `label`, e.g. `emit_branch(Instruction::BranchLessThan, top)`
    pub fn emit_branch(&mut self, make: fn(usize) -> Instruction, label: Label) -> usize {
        let at = self.emit(make(0));
        self.pending.push(PendingBranch { at, label, make });
        at
    }

    /// Index the next instruction will get
    pub fn position(&self) -> usize {
        self.instructions.len()
    }

    /// Resolve labels and produce the body
    pub fn finish(mut self) -> Result<FunctionBody, BuildError> {
        for branch in &self.pending {
            let target = self.labels[branch.label.0].ok_or(BuildError::UnboundLabel(branch.label.0))?;
            self.instructions[branch.at] = (branch.make)(target);
        }
        Ok(FunctionBody {
            locals: self.locals,
            instructions: self.instructions,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_and_backward_labels() {
        let mut b = FunctionBuilder::new();
        let top = b.label();
        let done = b.label();
        b.bind(top);
        b.emit(Instruction::LoadInt(1));
        b.emit(Instruction::LoadInt(2));
        b.emit_branch(Instruction::BranchLessThan, done);
        b.emit_branch(Instruction::Branch, top);
        b.bind(done);
        b.emit(Instruction::Return);

        let body = b.finish().unwrap();
        assert_eq!(body.instructions[2], Instruction::BranchLessThan(4));
        assert_eq!(body.instructions[3], Instruction::Branch(0));
    }

    #[test]
    fn test_unbound_label() {
        let mut b = FunctionBuilder::new();
        let nowhere = b.label();
        b.emit_branch(Instruction::Branch, nowhere);
        assert_eq!(b.finish().unwrap_err(), BuildError::UnboundLabel(0));
    }

    #[test]
    fn test_locals() {
        let types = crate::types::TypeProvider::new();
        let mut b = FunctionBuilder::new();
        assert_eq!(b.local(types.int()), 0);
        assert_eq!(b.local(types.float()), 1);
        b.emit(Instruction::Return);
        let body = b.finish().unwrap();
        assert_eq!(body.locals, vec![types.int(), types.float()]);
    }
}
