//! Function descriptors

use super::Instruction;
use crate::handle::Handle;
use crate::types::{TypeId, TypeProvider};

/// Identifier of a function owned by a VM
pub type FunctionId = Handle<ManagedFunction>;

/// Signature and ownership of a function
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionDefinition {
    pub name: String,
    pub parameters: Vec<TypeId>,
    pub return_type: TypeId,
    /// Owning class, for methods and constructors
    pub class: Option<TypeId>,
    pub constructor: bool,
}

impl FunctionDefinition {
    /// A free function
    pub fn new(name: impl Into<String>, parameters: Vec<TypeId>, return_type: TypeId) -> Self {
        Self {
            name: name.into(),
            parameters,
            return_type,
            class: None,
            constructor: false,
        }
    }

    /// An instance method; the receiver becomes the first parameter
    pub fn method(
        class: TypeId,
        name: impl Into<String>,
        parameters: Vec<TypeId>,
        return_type: TypeId,
    ) -> Self {
        let mut all = Vec::with_capacity(parameters.len() + 1);
        all.push(class);
        all.extend(parameters);
        Self {
            name: name.into(),
            parameters: all,
            return_type,
            class: Some(class),
            constructor: false,
        }
    }

    /// A constructor; returns Void and takes the receiver first
    pub fn constructor(class: TypeId, parameters: Vec<TypeId>, void: TypeId) -> Self {
        Self {
            constructor: true,
            ..Self::method(class, ".constructor", parameters, void)
        }
    }

    /// Whether the function is a method or constructor of a class
    pub fn is_member(&self) -> bool {
        self.class.is_some()
    }

    /// Qualified name plus parameter types, e.g. `Point::scale(Point Int)`
    ///
    /// Two functions with the same signature cannot coexist in a VM.
    pub fn signature(&self, types: &TypeProvider) -> String {
        let params: Vec<&str> = self.parameters.iter().map(|&ty| types.name(ty)).collect();
        match self.class {
            Some(class) => format!("{}::{}({})", types.name(class), self.name, params.join(" ")),
            None => format!("{}({})", self.name, params.join(" ")),
        }
    }
}

/// Functions supplied by the runtime instead of bytecode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NativeRoutine {
    /// `std.gc.collect()`
    GarbageCollect,
    /// `std.print_call_stack()`
    PrintCallStack,
    /// `std.println(Int)`
    PrintInt,
    /// `std.println(Float)`
    PrintFloat,
    /// `std.println(Bool)`
    PrintBool,
}

impl NativeRoutine {
    pub const ALL: [NativeRoutine; 5] = [
        NativeRoutine::GarbageCollect,
        NativeRoutine::PrintCallStack,
        NativeRoutine::PrintInt,
        NativeRoutine::PrintFloat,
        NativeRoutine::PrintBool,
    ];

    /// Stable index, used to place the routine's call address
    pub fn index(self) -> usize {
        match self {
            NativeRoutine::GarbageCollect => 0,
            NativeRoutine::PrintCallStack => 1,
            NativeRoutine::PrintInt => 2,
            NativeRoutine::PrintFloat => 3,
            NativeRoutine::PrintBool => 4,
        }
    }

    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    /// Name under which the routine is declared
    pub fn name(self) -> &'static str {
        match self {
            NativeRoutine::GarbageCollect => "std.gc.collect",
            NativeRoutine::PrintCallStack => "std.print_call_stack",
            NativeRoutine::PrintInt | NativeRoutine::PrintFloat | NativeRoutine::PrintBool => {
                "std.println"
            }
        }
    }

    /// Definition registered for the routine
    pub fn definition(self, types: &TypeProvider) -> FunctionDefinition {
        let parameters = match self {
            NativeRoutine::GarbageCollect | NativeRoutine::PrintCallStack => vec![],
            NativeRoutine::PrintInt => vec![types.int()],
            NativeRoutine::PrintFloat => vec![types.float()],
            NativeRoutine::PrintBool => vec![types.bool()],
        };
        FunctionDefinition::new(self.name(), parameters, types.void())
    }

    /// Number of machine slots the routine consumes
    pub fn arity(self) -> usize {
        match self {
            NativeRoutine::GarbageCollect | NativeRoutine::PrintCallStack => 0,
            _ => 1,
        }
    }
}

/// A function known to the VM: declared, then given a body (or backed by a
/// native routine), then verified
#[derive(Debug)]
pub struct ManagedFunction {
    definition: FunctionDefinition,
    locals: Vec<TypeId>,
    instructions: Vec<Instruction>,
    /// Operand-stack types before each instruction; `None` for unreachable ones
    operand_types: Vec<Option<Vec<TypeId>>>,
    native: Option<NativeRoutine>,
    defined: bool,
}

impl ManagedFunction {
    /// A declared function without a body yet
    pub fn declared(definition: FunctionDefinition) -> Self {
        Self {
            definition,
            locals: Vec::new(),
            instructions: Vec::new(),
            operand_types: Vec::new(),
            native: None,
            defined: false,
        }
    }

    /// A function implemented by the runtime
    pub fn native(definition: FunctionDefinition, routine: NativeRoutine) -> Self {
        Self {
            native: Some(routine),
            defined: true,
            ..Self::declared(definition)
        }
    }

    pub fn definition(&self) -> &FunctionDefinition {
        &self.definition
    }

    pub fn name(&self) -> &str {
        &self.definition.name
    }

    pub fn locals(&self) -> &[TypeId] {
        &self.locals
    }

    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }

    pub fn argument_count(&self) -> usize {
        self.definition.parameters.len()
    }

    pub fn local_count(&self) -> usize {
        self.locals.len()
    }

    pub fn native_routine(&self) -> Option<NativeRoutine> {
        self.native
    }

    pub fn is_native(&self) -> bool {
        self.native.is_some()
    }

    /// Whether a body (or native routine) has been supplied
    pub fn is_defined(&self) -> bool {
        self.defined
    }

    /// Whether the operand-type snapshots are present
    pub fn is_verified(&self) -> bool {
        self.native.is_some() || (!self.instructions.is_empty() && !self.operand_types.is_empty())
    }

    /// Types on the evaluation stack before instruction `index`, deepest first
    ///
    /// Empty for unreachable instructions.
    pub fn operand_types(&self, index: usize) -> &[TypeId] {
        self.operand_types
            .get(index)
            .and_then(|types| types.as_deref())
            .unwrap_or(&[])
    }

    /// Whether instruction `index` can ever execute
    pub fn is_reachable(&self, index: usize) -> bool {
        matches!(self.operand_types.get(index), Some(Some(_)))
    }

    pub(crate) fn set_body(&mut self, locals: Vec<TypeId>, instructions: Vec<Instruction>) {
        self.locals = locals;
        self.instructions = instructions;
        self.operand_types.clear();
        self.defined = true;
    }

    pub(crate) fn set_operand_types(&mut self, operand_types: Vec<Option<Vec<TypeId>>>) {
        self.operand_types = operand_types;
    }
}
