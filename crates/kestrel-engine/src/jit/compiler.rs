//! Per-function compiler
//!
//! Lowers one verified function to machine instructions. Every function gets
//! the same frame shape: `Enter` copies the caller-pushed arguments below the
//! base pointer and zeroes the locals, and the evaluation stack grows below
//! them. The machine stack therefore mirrors the verifier's operand-type
//! snapshot at every instruction boundary, which is what the collector
//! relies on to find roots.

use super::assembler::Assembler;
use super::isa::{
    ArithOp, CompareKind, MachineInstr, NumericKind, Width, CALL_PATCH_OFFSET,
    JUMP_IF_PATCH_OFFSET, JUMP_PATCH_OFFSET,
};
use super::CompileError;
use crate::bytecode::{FunctionId, Instruction, ManagedFunction, NativeRoutine};
use crate::handle::SlotTable;
use crate::memory::MemoryManager;
use crate::types::{PrimitiveType, TypeId, TypeProvider};
use crate::vm::stack::frame::{argument_offset, local_offset};
use std::ops::Range;

/// How a call site addresses its callee
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallMode {
    /// 64-bit absolute target
    Absolute,
    /// 32-bit displacement from the end of the call instruction
    Relative,
}

impl CallMode {
    pub fn width(self) -> PatchWidth {
        match self {
            CallMode::Absolute => PatchWidth::Abs64,
            CallMode::Relative => PatchWidth::Rel32,
        }
    }
}

/// Size of a patched operand
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchWidth {
    Rel32,
    Abs64,
}

/// A branch waiting for its target's native offset
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnresolvedBranch {
    /// Offset of the operand within the function
    pub patch_offset: usize,
    /// Offset the displacement is measured from
    pub next_instruction: usize,
    /// Bytecode index of the target
    pub target: usize,
    pub width: PatchWidth,
}

/// A call waiting for its callee's entry point
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnresolvedCall {
    pub caller: FunctionId,
    pub callee: FunctionId,
    /// Address of the operand to patch
    pub patch_address: u64,
    /// Address a relative displacement is measured from
    pub next_instruction: u64,
    pub mode: CallMode,
}

/// Code for one function
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledFunction {
    pub function: FunctionId,
    pub entry: u64,
    pub size: usize,
    /// Native offset of the first machine instruction of each bytecode instruction
    pub instruction_offsets: Vec<u32>,
}

impl CompiledFunction {
    pub fn native_offset(&self, index: usize) -> Option<u32> {
        self.instruction_offsets.get(index).copied()
    }

    /// Address of the code for bytecode instruction `index`
    pub fn address_of(&self, index: usize) -> Option<u64> {
        self.native_offset(index).map(|offset| self.entry + offset as u64)
    }

    /// Native offsets covered by bytecode instruction `index`
    pub fn instruction_range(&self, index: usize) -> Option<Range<u32>> {
        let start = self.native_offset(index)?;
        let end = self
            .native_offset(index + 1)
            .unwrap_or(self.size as u32);
        Some(start..end)
    }

    /// Offset of the first instruction's code; everything before it is the prologue
    pub fn prologue_size(&self) -> u32 {
        self.native_offset(0).unwrap_or(self.size as u32)
    }

    pub fn contains(&self, address: u64) -> bool {
        address >= self.entry && address < self.entry + self.size as u64
    }
}

/// What the compiler reads and where it writes
pub struct CompileContext<'a> {
    pub memory: &'a mut MemoryManager,
    pub types: &'a TypeProvider,
    pub functions: &'a SlotTable<ManagedFunction>,
}

struct PendingCall {
    operand: usize,
    next: usize,
    callee: FunctionId,
    mode: CallMode,
}

/// Compile `id`, returning its code and the calls it still needs patched
///
/// A self-recursive call is resolved on the spot; every other call is left
/// to the linker.
pub fn compile_function(
    ctx: &mut CompileContext<'_>,
    id: FunctionId,
) -> Result<(CompiledFunction, Vec<UnresolvedCall>), CompileError> {
    let functions = ctx.functions;
    let types = ctx.types;
    let function = functions.get(id).ok_or(CompileError::UnknownFunction(id))?;
    if function.is_native() {
        return Err(CompileError::NativeFunction(function.definition().signature(types)));
    }
    if !function.is_verified() {
        return Err(CompileError::NotVerified(function.definition().signature(types)));
    }

    FunctionCompiler {
        memory: &mut *ctx.memory,
        types,
        functions,
        id,
        function,
        asm: Assembler::new(),
        offsets: Vec::with_capacity(function.instructions().len()),
        branches: Vec::new(),
        calls: Vec::new(),
    }
    .compile()
}

struct FunctionCompiler<'c, 'a> {
    memory: &'c mut MemoryManager,
    types: &'a TypeProvider,
    functions: &'a SlotTable<ManagedFunction>,
    id: FunctionId,
    function: &'a ManagedFunction,
    asm: Assembler,
    offsets: Vec<u32>,
    branches: Vec<UnresolvedBranch>,
    calls: Vec<PendingCall>,
}

impl FunctionCompiler<'_, '_> {
    fn too_large(&self) -> CompileError {
        CompileError::FrameTooLarge(self.function.definition().signature(self.types))
    }

    fn compile(mut self) -> Result<(CompiledFunction, Vec<UnresolvedCall>), CompileError> {
        let arguments = u16::try_from(self.function.argument_count()).map_err(|_| self.too_large())?;
        let locals = u16::try_from(self.function.local_count()).map_err(|_| self.too_large())?;
        self.asm.emit(MachineInstr::Enter { arguments, locals });

        let function = self.function;
        for (index, instruction) in function.instructions().iter().enumerate() {
            self.offsets.push(self.asm.position() as u32);
            // unreachable code is never entered; its offset is that of the next instruction
            if !function.is_reachable(index) {
                continue;
            }
            self.lower(index, instruction)?;
        }

        for branch in &self.branches {
            let target = *self
                .offsets
                .get(branch.target)
                .ok_or(CompileError::BranchOutOfRange(branch.patch_offset))?;
            let rel = i32::try_from(target as i64 - branch.next_instruction as i64)
                .map_err(|_| CompileError::BranchOutOfRange(branch.patch_offset))?;
            self.asm.patch_i32(branch.patch_offset, rel)?;
        }

        let size = self.asm.position();
        let entry = self.memory.allocate_code(size)?;

        let mut unresolved = Vec::new();
        for call in &self.calls {
            if call.mode == CallMode::Relative && call.callee == self.id {
                let rel = i32::try_from(call.next).map_err(|_| CompileError::CallOutOfRange {
                    patch_address: entry + call.operand as u64,
                    target: entry,
                })?;
                self.asm.patch_i32(call.operand, -rel)?;
            } else {
                unresolved.push(UnresolvedCall {
                    caller: self.id,
                    callee: call.callee,
                    patch_address: entry + call.operand as u64,
                    next_instruction: entry + call.next as u64,
                    mode: call.mode,
                });
            }
        }
        self.memory.write_code(entry, self.asm.bytes())?;

        tracing::trace!(
            function = %self.function.definition().signature(self.types),
            entry,
            size,
            pending_calls = unresolved.len(),
            "function compiled"
        );

        Ok((
            CompiledFunction {
                function: self.id,
                entry,
                size,
                instruction_offsets: self.offsets,
            },
            unresolved,
        ))
    }

    fn emit(&mut self, instruction: MachineInstr) -> usize {
        self.asm.emit(instruction)
    }

    fn is_float(&self, ty: Option<TypeId>) -> bool {
        matches!(
            ty.and_then(|ty| self.types.try_get(ty))
                .and_then(|base| base.as_primitive()),
            Some(PrimitiveType::Float)
        )
    }

    fn numeric_kind(&self, ty: Option<TypeId>) -> NumericKind {
        if self.is_float(ty) {
            NumericKind::Float
        } else {
            NumericKind::Int
        }
    }

    fn compare_kind(&self, ty: Option<TypeId>) -> CompareKind {
        match ty {
            Some(ty) if self.types.is_reference(ty) => CompareKind::Reference,
            _ if self.is_float(ty) => CompareKind::Float,
            _ => CompareKind::Int,
        }
    }

    fn width(&self, ty: TypeId) -> Result<Width, CompileError> {
        Width::for_size(self.types.size_of(ty)).ok_or(CompileError::UnsupportedWidth(ty.as_u32()))
    }

    fn element_width(&self, array: TypeId) -> Result<Width, CompileError> {
        let element = self
            .types
            .element_type(array)
            .ok_or(CompileError::UnsupportedWidth(array.as_u32()))?;
        self.width(element)
    }

    fn branch(&mut self, at: usize, operand: usize, target: usize) {
        self.branches.push(UnresolvedBranch {
            patch_offset: at + operand,
            next_instruction: self.asm.position(),
            target,
            width: PatchWidth::Rel32,
        });
    }

    fn lower(&mut self, index: usize, instruction: &Instruction) -> Result<(), CompileError> {
        let arguments = self.function.argument_count();
        let top = self.function.operand_types(index).last().copied();

        if let Some(condition) = instruction.condition() {
            let kind = self.compare_kind(top);
            match instruction.branch_target() {
                Some(target) => {
                    let at = self.emit(MachineInstr::JumpIf {
                        kind,
                        condition,
                        rel: 0,
                    });
                    self.branch(at, JUMP_IF_PATCH_OFFSET, target);
                }
                None => {
                    self.emit(MachineInstr::Compare { kind, condition });
                }
            }
            return Ok(());
        }

        match *instruction {
            Instruction::Nop => {}
            Instruction::Pop => {
                self.emit(MachineInstr::Pop);
            }
            Instruction::Duplicate => {
                self.emit(MachineInstr::Dup);
            }
            Instruction::LoadInt(value) => {
                self.emit(MachineInstr::PushImm(value as i64));
            }
            Instruction::LoadFloat(value) => {
                let address = self.memory.allocate_read_only_f32(value)?;
                self.emit(MachineInstr::PushConst32(address));
            }
            Instruction::LoadTrue => {
                self.emit(MachineInstr::PushImm(1));
            }
            Instruction::LoadFalse | Instruction::LoadNull(_) => {
                self.emit(MachineInstr::PushImm(0));
            }
            Instruction::LoadLocal(n) => {
                self.emit(MachineInstr::LoadSlot(local_offset(arguments, n as usize)));
            }
            Instruction::StoreLocal(n) => {
                self.emit(MachineInstr::StoreSlot(local_offset(arguments, n as usize)));
            }
            Instruction::LoadArgument(n) => {
                self.emit(MachineInstr::LoadSlot(argument_offset(n as usize)));
            }
            Instruction::Add | Instruction::Sub | Instruction::Mul | Instruction::Div => {
                let op = match instruction {
                    Instruction::Add => ArithOp::Add,
                    Instruction::Sub => ArithOp::Sub,
                    Instruction::Mul => ArithOp::Mul,
                    _ => ArithOp::Div,
                };
                let kind = self.numeric_kind(top);
                self.emit(MachineInstr::Arith { kind, op });
            }
            Instruction::And => {
                self.emit(MachineInstr::And);
            }
            Instruction::Or => {
                self.emit(MachineInstr::Or);
            }
            Instruction::Not => {
                self.emit(MachineInstr::Not);
            }
            Instruction::ConvertIntToFloat => {
                self.emit(MachineInstr::IntToFloat);
            }
            Instruction::ConvertFloatToInt => {
                self.emit(MachineInstr::FloatToInt);
            }
            Instruction::Branch(target) => {
                let at = self.emit(MachineInstr::Jump(0));
                self.branch(at, JUMP_PATCH_OFFSET, target);
            }
            Instruction::Call(callee) => self.call(index, callee, false)?,
            Instruction::CallInstance(callee) => self.call(index, callee, true)?,
            Instruction::Return => {
                if self.function.definition().return_type != self.types.void() {
                    self.emit(MachineInstr::PopRax);
                }
                self.emit(MachineInstr::Leave);
                self.emit(MachineInstr::Ret {
                    pop_slots: arguments as u16,
                });
            }
            Instruction::NewArray(array) => {
                self.emit(MachineInstr::NewArray(array.as_u32()));
            }
            Instruction::LoadElement(array) => {
                let width = self.element_width(array)?;
                self.emit(MachineInstr::LoadElement(width));
            }
            Instruction::StoreElement(array) => {
                let width = self.element_width(array)?;
                self.emit(MachineInstr::StoreElement(width));
            }
            Instruction::LoadArrayLength => {
                self.emit(MachineInstr::ArrayLength);
            }
            Instruction::NewObject(class) => {
                self.emit(MachineInstr::NewObject(class.as_u32()));
            }
            Instruction::LoadField(field) => {
                let width = self.width(field.ty)?;
                self.emit(MachineInstr::LoadField {
                    width,
                    offset: field.offset,
                });
            }
            Instruction::StoreField(field) => {
                let width = self.width(field.ty)?;
                self.emit(MachineInstr::StoreField {
                    width,
                    offset: field.offset,
                });
            }
            // lowered above
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
            | Instruction::BranchLessThanOrEqual(_) => {}
        }
        Ok(())
    }

    fn call(&mut self, index: usize, callee_id: FunctionId, instance: bool) -> Result<(), CompileError> {
        let functions = self.functions;
        let callee = functions
            .get(callee_id)
            .ok_or(CompileError::UnknownFunction(callee_id))?;
        let function = self.id.to_bits();
        let instruction = index as u32;

        match callee.native_routine() {
            Some(NativeRoutine::GarbageCollect) => {
                self.emit(MachineInstr::Collect {
                    function,
                    instruction,
                });
                return Ok(());
            }
            Some(NativeRoutine::PrintCallStack) => {
                self.emit(MachineInstr::PrintCallStack {
                    function,
                    instruction,
                });
                return Ok(());
            }
            Some(_) => {
                let at = self.emit(MachineInstr::CallAbsolute(0));
                self.calls.push(PendingCall {
                    operand: at + CALL_PATCH_OFFSET,
                    next: self.asm.position(),
                    callee: callee_id,
                    mode: CallMode::Absolute,
                });
                return Ok(());
            }
            None => {}
        }

        if instance {
            let depth = callee.argument_count().saturating_sub(1);
            let depth = u16::try_from(depth).map_err(|_| self.too_large())?;
            self.emit(MachineInstr::NullCheck { depth });
        }
        self.emit(MachineInstr::PushFrame {
            function,
            instruction,
        });
        let mode = if callee_id == self.id {
            CallMode::Relative
        } else {
            CallMode::Absolute
        };
        let at = match mode {
            CallMode::Relative => self.emit(MachineInstr::CallRelative(0)),
            CallMode::Absolute => self.emit(MachineInstr::CallAbsolute(0)),
        };
        self.calls.push(PendingCall {
            operand: at + CALL_PATCH_OFFSET,
            next: self.asm.position(),
            callee: callee_id,
            mode,
        });
        self.emit(MachineInstr::PopFrame);
        if callee.definition().return_type != self.types.void() {
            self.emit(MachineInstr::PushRax);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::{verify, FunctionBuilder, FunctionDefinition};
    use crate::jit::isa::decode;

    struct Unit {
        types: TypeProvider,
        functions: SlotTable<ManagedFunction>,
        memory: MemoryManager,
    }

    impl Unit {
        fn new() -> Self {
            Self {
                types: TypeProvider::new(),
                functions: SlotTable::new(),
                memory: MemoryManager::new(4096),
            }
        }

        fn declare(&mut self, definition: FunctionDefinition) -> FunctionId {
            self.functions.insert(ManagedFunction::declared(definition))
        }

        fn define(&mut self, id: FunctionId, builder: FunctionBuilder) {
            let body = builder.finish().unwrap();
            let function = self.functions.get_mut(id).unwrap();
            function.set_body(body.locals, body.instructions);
            let snapshots = verify(self.functions.get(id).unwrap(), &self.types, &self.functions).unwrap();
            self.functions.get_mut(id).unwrap().set_operand_types(snapshots);
        }

        fn compile(&mut self, id: FunctionId) -> (CompiledFunction, Vec<UnresolvedCall>) {
            let mut ctx = CompileContext {
                memory: &mut self.memory,
                types: &self.types,
                functions: &self.functions,
            };
            compile_function(&mut ctx, id).unwrap()
        }

        /// Decode the code of bytecode instruction `index`
        fn machine_code(&self, compiled: &CompiledFunction, index: usize) -> Vec<MachineInstr> {
            let range = compiled.instruction_range(index).unwrap();
            let bytes = self
                .memory
                .read(compiled.entry + range.start as u64, (range.end - range.start) as usize)
                .unwrap();
            let mut out = Vec::new();
            let mut pos = 0;
            while pos < bytes.len() {
                let (instruction, len) = decode(&bytes[pos..]).unwrap();
                out.push(instruction);
                pos += len;
            }
            out
        }
    }

    #[test]
    fn test_prologue_and_epilogue_follow_frame_layout() {
        let mut unit = Unit::new();
        let int = unit.types.int();
        let id = unit.declare(FunctionDefinition::new("first", vec![int, int], int));
        let mut b = FunctionBuilder::new();
        let tmp = b.local(int);
        b.emit(Instruction::LoadArgument(1));
        b.emit(Instruction::StoreLocal(tmp));
        b.emit(Instruction::LoadLocal(tmp));
        b.emit(Instruction::Return);
        unit.define(id, b);

        let (compiled, calls) = unit.compile(id);
        assert!(calls.is_empty());
        assert_eq!(compiled.instruction_offsets.len(), 4);
        assert_eq!(
            compiled.prologue_size() as usize,
            MachineInstr::Enter { arguments: 2, locals: 1 }.encoded_len()
        );
        assert_eq!(unit.machine_code(&compiled, 0), vec![MachineInstr::LoadSlot(-16)]);
        assert_eq!(unit.machine_code(&compiled, 1), vec![MachineInstr::StoreSlot(-24)]);
        assert_eq!(
            unit.machine_code(&compiled, 3),
            vec![
                MachineInstr::PopRax,
                MachineInstr::Leave,
                MachineInstr::Ret { pop_slots: 2 }
            ]
        );
    }

    #[test]
    fn test_branches_are_patched_to_target_offsets() {
        let mut unit = Unit::new();
        let int = unit.types.int();
        let id = unit.declare(FunctionDefinition::new("max", vec![int, int], int));
        let mut b = FunctionBuilder::new();
        let second = b.label();
        b.emit(Instruction::LoadArgument(0));
        b.emit(Instruction::LoadArgument(1));
        b.emit_branch(Instruction::BranchLessThan, second);
        b.emit(Instruction::LoadArgument(0));
        b.emit(Instruction::Return);
        b.bind(second);
        b.emit(Instruction::LoadArgument(1));
        b.emit(Instruction::Return);
        unit.define(id, b);

        let (compiled, _) = unit.compile(id);
        let branch = unit.machine_code(&compiled, 2);
        let MachineInstr::JumpIf { kind, rel, .. } = branch[0] else {
            panic!("expected a conditional jump, got {:?}", branch);
        };
        assert_eq!(kind, CompareKind::Int);
        let next = compiled.instruction_offsets[3] as i64;
        assert_eq!(next + rel as i64, compiled.instruction_offsets[5] as i64);
    }

    #[test]
    fn test_unreachable_code_emits_nothing() {
        let mut unit = Unit::new();
        let int = unit.types.int();
        let id = unit.declare(FunctionDefinition::new("f", vec![], int));
        let mut b = FunctionBuilder::new();
        b.emit(Instruction::LoadInt(1));
        b.emit(Instruction::Return);
        b.emit(Instruction::LoadInt(2));
        b.emit(Instruction::Return);
        unit.define(id, b);

        let (compiled, _) = unit.compile(id);
        assert_eq!(compiled.instruction_offsets[2], compiled.instruction_offsets[3]);
        assert_eq!(compiled.instruction_offsets[3] as usize, compiled.size);
    }

    #[test]
    fn test_calls_are_deferred_except_self_recursion() {
        let mut unit = Unit::new();
        let int = unit.types.int();
        let helper = unit.declare(FunctionDefinition::new("helper", vec![], int));
        let id = unit.declare(FunctionDefinition::new("f", vec![int], int));
        let mut b = FunctionBuilder::new();
        b.emit(Instruction::LoadInt(1));
        b.emit(Instruction::Return);
        unit.define(helper, b);

        let mut b = FunctionBuilder::new();
        b.emit(Instruction::Call(helper));
        b.emit(Instruction::Call(id));
        b.emit(Instruction::Return);
        unit.define(id, b);

        let (compiled, calls) = unit.compile(id);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].callee, helper);
        assert_eq!(calls[0].mode, CallMode::Absolute);
        assert_eq!(calls[0].mode.width(), PatchWidth::Abs64);
        assert!(compiled.contains(calls[0].patch_address));

        let recursive = unit.machine_code(&compiled, 1);
        assert_eq!(
            recursive[0],
            MachineInstr::PushFrame {
                function: id.to_bits(),
                instruction: 1
            }
        );
        let MachineInstr::CallRelative(rel) = recursive[1] else {
            panic!("expected a relative call, got {:?}", recursive);
        };
        let call_end = compiled.instruction_offsets[1] as i64
            + (recursive[0].encoded_len() + recursive[1].encoded_len()) as i64;
        assert_eq!(call_end + rel as i64, 0);
        assert_eq!(recursive[2], MachineInstr::PopFrame);
        assert_eq!(recursive[3], MachineInstr::PushRax);
    }

    #[test]
    fn test_float_constants_and_kinds() {
        let mut unit = Unit::new();
        let bool_ = unit.types.bool();
        let id = unit.declare(FunctionDefinition::new("f", vec![], bool_));
        let mut b = FunctionBuilder::new();
        b.emit(Instruction::LoadFloat(1.5));
        b.emit(Instruction::LoadFloat(1.5));
        b.emit(Instruction::Add);
        b.emit(Instruction::LoadFloat(3.0));
        b.emit(Instruction::CompareEqual);
        b.emit(Instruction::Return);
        unit.define(id, b);

        let (compiled, _) = unit.compile(id);
        assert_eq!(unit.machine_code(&compiled, 0), unit.machine_code(&compiled, 1));
        assert_eq!(
            unit.machine_code(&compiled, 2),
            vec![MachineInstr::Arith {
                kind: NumericKind::Float,
                op: ArithOp::Add
            }]
        );
        let MachineInstr::Compare { kind, .. } = unit.machine_code(&compiled, 4)[0] else {
            panic!("expected a compare");
        };
        assert_eq!(kind, CompareKind::Float);
    }

    #[test]
    fn test_unverified_function_is_rejected() {
        let mut unit = Unit::new();
        let void = unit.types.void();
        let id = unit.declare(FunctionDefinition::new("f", vec![], void));
        unit.functions
            .get_mut(id)
            .unwrap()
            .set_body(vec![], vec![Instruction::Return]);
        let mut ctx = CompileContext {
            memory: &mut unit.memory,
            types: &unit.types,
            functions: &unit.functions,
        };
        assert!(matches!(
            compile_function(&mut ctx, id),
            Err(CompileError::NotVerified(_))
        ));
    }
}
