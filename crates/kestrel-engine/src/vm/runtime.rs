//! The VM facade and the execution context compiled code runs against

use super::config::RuntimeConfig;
use super::error::{LoadError, Trap, TrapKind, VmError, VmResult};
use super::gc::{AllocationError, GarbageCollector, GcOptions, RootSet};
use super::interface::RuntimeInterface;
use super::machine::Machine;
use super::stack::{CallStack, CallStackEntry, CallStackError, FrameRef, NativeStack, StackWalker};
use crate::bytecode::{
    verify, FunctionBody, FunctionDefinition, FunctionId, Instruction, ManagedFunction,
    NativeRoutine,
};
use crate::handle::SlotTable;
use crate::jit::isa::Width;
use crate::jit::{disassemble, CompileContext, CompiledFunction, Disassembly, JitEngine};
use crate::memory::MemoryManager;
use crate::types::{TypeId, TypeProvider};
use crate::vm::defaults::DEFAULT_CODE_PAGE_SIZE;
use rustc_hash::FxHashMap;
use std::cell::RefCell;
use std::io::{self, Write};
use std::rc::Rc;

/// Ids of the routines every VM declares
#[derive(Debug, Clone, Copy)]
pub struct Builtins {
    /// `std.gc.collect()`
    pub collect: FunctionId,
    /// `std.print_call_stack()`
    pub print_call_stack: FunctionId,
    /// `std.println(Int)`
    pub print_int: FunctionId,
    /// `std.println(Float)`
    pub print_float: FunctionId,
    /// `std.println(Bool)`
    pub print_bool: FunctionId,
}

impl Builtins {
    /// The `std.println` overload for `ty`
    pub fn println(&self, types: &TypeProvider, ty: TypeId) -> Option<FunctionId> {
        if ty == types.int() {
            Some(self.print_int)
        } else if ty == types.float() {
            Some(self.print_float)
        } else if ty == types.bool() {
            Some(self.print_bool)
        } else {
            None
        }
    }
}

/// Cloneable in-memory output sink
#[derive(Debug, Clone, Default)]
pub struct CapturedOutput(Rc<RefCell<Vec<u8>>>);

impl CapturedOutput {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything written so far
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.borrow()).into_owned()
    }

    /// Written lines
    pub fn lines(&self) -> Vec<String> {
        self.contents().lines().map(str::to_string).collect()
    }
}

impl Write for CapturedOutput {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.borrow_mut().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// One virtual machine: a single load unit, heap, native stack and call stack
pub struct Vm {
    config: RuntimeConfig,
    types: TypeProvider,
    functions: SlotTable<ManagedFunction>,
    /// Signature → function, for duplicate detection and lookup
    signatures: FxHashMap<String, FunctionId>,
    builtins: Builtins,
    memory: MemoryManager,
    jit: JitEngine,
    gc: GarbageCollector,
    stack: NativeStack,
    call_stack: CallStack,
    output: Box<dyn Write>,
    main: Option<FunctionId>,
    loaded: bool,
}

impl Vm {
    /// Create a VM; commits the heap, native stack and call stack up front
    pub fn new(config: RuntimeConfig) -> VmResult<Self> {
        config.validate()?;
        let types = TypeProvider::new();
        let mut functions = SlotTable::new();
        let mut signatures = FxHashMap::default();

        let mut declare = |routine: NativeRoutine| {
            let definition = routine.definition(&types);
            let signature = definition.signature(&types);
            let id = functions.insert(ManagedFunction::native(definition, routine));
            signatures.insert(signature, id);
            id
        };
        let builtins = Builtins {
            collect: declare(NativeRoutine::GarbageCollect),
            print_call_stack: declare(NativeRoutine::PrintCallStack),
            print_int: declare(NativeRoutine::PrintInt),
            print_float: declare(NativeRoutine::PrintFloat),
            print_bool: declare(NativeRoutine::PrintBool),
        };

        let gc = GarbageCollector::new(config.heap_size, GcOptions::from(&config))?;
        let stack = NativeStack::new(config.stack_size)?;
        let call_stack = CallStack::new(config.call_stack_capacity)?;

        tracing::debug!(
            heap_size = gc.heap().capacity(),
            stack_size = stack.region().size(),
            call_stack_capacity = call_stack.capacity(),
            "vm created"
        );

        Ok(Self {
            config,
            types,
            functions,
            signatures,
            builtins,
            memory: MemoryManager::new(DEFAULT_CODE_PAGE_SIZE),
            jit: JitEngine::new(),
            gc,
            stack,
            call_stack,
            output: Box::new(io::stdout()),
            main: None,
            loaded: false,
        })
    }

    /// Where `std.println` and `std.print_call_stack` write
    pub fn set_output(&mut self, output: impl Write + 'static) {
        self.output = Box::new(output);
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn types(&self) -> &TypeProvider {
        &self.types
    }

    /// Declare classes and arrays through this before defining functions
    pub fn types_mut(&mut self) -> &mut TypeProvider {
        &mut self.types
    }

    pub fn builtins(&self) -> &Builtins {
        &self.builtins
    }

    pub fn function(&self, id: FunctionId) -> Option<&ManagedFunction> {
        self.functions.get(id)
    }

    pub fn function_by_signature(&self, signature: &str) -> Option<FunctionId> {
        self.signatures.get(signature).copied()
    }

    /// Declare a function; its body is supplied by [`Vm::define_function`]
    pub fn declare_function(&mut self, definition: FunctionDefinition) -> VmResult<FunctionId> {
        if self.loaded {
            return Err(LoadError::AlreadyLoaded.into());
        }
        let referenced = definition.parameters.iter().chain([&definition.return_type]);
        for &ty in referenced.chain(definition.class.as_ref()) {
            self.types.resolve(ty)?;
        }
        let signature = definition.signature(&self.types);
        if self.signatures.contains_key(&signature) {
            return Err(LoadError::DuplicateFunction(signature).into());
        }
        let is_main = definition.name == "main" && !definition.is_member();
        if is_main && (!definition.parameters.is_empty() || definition.return_type != self.types.int()) {
            let shown = format!("{} -> {}", signature, self.types.name(definition.return_type));
            return Err(LoadError::MalformedMain(shown).into());
        }

        let id = self.functions.insert(ManagedFunction::declared(definition));
        self.signatures.insert(signature, id);
        if is_main {
            self.main = Some(id);
        }
        Ok(id)
    }

    /// Give a declared function its locals and instructions
    pub fn define_function(&mut self, id: FunctionId, body: FunctionBody) -> VmResult<()> {
        if self.loaded {
            return Err(LoadError::AlreadyLoaded.into());
        }
        let types = &self.types;
        let function = self
            .functions
            .get_mut(id)
            .ok_or(LoadError::UnknownFunction)?;
        if function.is_native() {
            return Err(LoadError::NativeBody(function.definition().signature(types)).into());
        }
        if function.is_defined() {
            return Err(LoadError::BodyAlreadyDefined(function.definition().signature(types)).into());
        }
        function.set_body(body.locals, body.instructions);
        Ok(())
    }

    /// Declare and define in one step
    pub fn add_function(&mut self, definition: FunctionDefinition, body: FunctionBody) -> VmResult<FunctionId> {
        let id = self.declare_function(definition)?;
        self.define_function(id, body)?;
        Ok(id)
    }

    fn signature(&self, id: FunctionId) -> String {
        self.functions
            .get(id)
            .map(|function| function.definition().signature(&self.types))
            .unwrap_or_else(|| format!("{:?}", id))
    }

    /// Verify, compile and link every defined function, then seal the code pages
    pub fn load(&mut self) -> VmResult<()> {
        if self.loaded {
            return Err(LoadError::AlreadyLoaded.into());
        }

        let unit: Vec<FunctionId> = self
            .functions
            .iter()
            .filter(|(_, function)| !function.is_native() && function.is_defined())
            .map(|(id, _)| id)
            .collect();

        for &id in &unit {
            let Some(function) = self.functions.get(id) else {
                continue;
            };
            for instruction in function.instructions() {
                let (Instruction::Call(callee) | Instruction::CallInstance(callee)) = *instruction else {
                    continue;
                };
                let resolved = self.functions.get(callee).is_some_and(ManagedFunction::is_defined);
                if !resolved {
                    return Err(LoadError::UnresolvedCallee {
                        caller: self.signature(id),
                        callee: self.signature(callee),
                    }
                    .into());
                }
            }
        }

        for &id in &unit {
            let Some(function) = self.functions.get(id) else {
                continue;
            };
            let snapshots = verify(function, &self.types, &self.functions)?;
            if let Some(function) = self.functions.get_mut(id) {
                function.set_operand_types(snapshots);
            }
        }

        let mut ctx = CompileContext {
            memory: &mut self.memory,
            types: &self.types,
            functions: &self.functions,
        };
        for &id in &unit {
            self.jit.compile(&mut ctx, id)?;
        }
        self.jit.link(&mut self.memory, &self.functions)?;
        self.jit.finalize(&mut self.memory)?;
        self.loaded = true;

        tracing::debug!(functions = unit.len(), "load unit ready");
        Ok(())
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    /// Run `main` and return its result
    pub fn run_main(&mut self) -> VmResult<i32> {
        let main = self.main.ok_or(LoadError::MissingMain)?;
        let result = self.invoke(main, &[])?;
        Ok(result as u32 as i32)
    }

    /// Call a compiled function with raw slot arguments; returns `rax`
    pub fn invoke(&mut self, id: FunctionId, arguments: &[u64]) -> VmResult<u64> {
        if !self.loaded {
            return Err(LoadError::NotLoaded.into());
        }
        let function = self.functions.get(id).ok_or(LoadError::UnknownFunction)?;
        if function.argument_count() != arguments.len() {
            return Err(LoadError::ArgumentCount {
                function: function.definition().signature(&self.types),
                expected: function.argument_count(),
                found: arguments.len(),
            }
            .into());
        }
        let entry = self.jit.entry(id).ok_or(LoadError::UnknownFunction)?;

        self.call_stack.clear();
        let mut ctx = ExecutionContext {
            config: &self.config,
            types: &self.types,
            functions: &self.functions,
            memory: &self.memory,
            gc: &mut self.gc,
            stack: &mut self.stack,
            call_stack: &mut self.call_stack,
            output: &mut *self.output,
        };
        let result = Machine::new(&mut ctx).run(entry, arguments);
        self.call_stack.clear();
        self.output.flush()?;
        result
    }

    pub fn gc(&self) -> &GarbageCollector {
        &self.gc
    }

    pub fn memory(&self) -> &MemoryManager {
        &self.memory
    }

    pub fn call_stack(&self) -> &CallStack {
        &self.call_stack
    }

    pub fn compiled(&self, id: FunctionId) -> Option<&CompiledFunction> {
        self.jit.compiled(id)
    }

    /// Listing of a compiled function
    pub fn disassemble(&self, id: FunctionId) -> VmResult<Disassembly> {
        let function = self.functions.get(id).ok_or(LoadError::UnknownFunction)?;
        let compiled = self.jit.compiled(id).ok_or(LoadError::NotLoaded)?;
        Ok(disassemble(compiled, function, &self.types, &self.memory)?)
    }
}

/// The runtime side of a running invocation
struct ExecutionContext<'v> {
    config: &'v RuntimeConfig,
    types: &'v TypeProvider,
    functions: &'v SlotTable<ManagedFunction>,
    memory: &'v MemoryManager,
    gc: &'v mut GarbageCollector,
    stack: &'v mut NativeStack,
    call_stack: &'v mut CallStack,
    output: &'v mut dyn Write,
}

impl ExecutionContext<'_> {
    fn fault(address: u64, reason: &str) -> VmError {
        VmError::Fault {
            address,
            reason: reason.to_string(),
        }
    }

    fn type_id(raw: u32) -> Result<TypeId, VmError> {
        TypeId::from_u32(raw).ok_or_else(|| Self::fault(raw as u64, "type id 0 in machine code"))
    }

    fn allocation_failed(&mut self, error: AllocationError) -> VmError {
        match error {
            AllocationError::HeapExhausted {
                requested,
                available,
            } => {
                tracing::error!(requested, available, "heap exhausted");
                VmError::HeapExhausted {
                    requested,
                    available,
                }
            }
            AllocationError::InvalidLength(length) => {
                self.trap(TrapKind::InvalidArrayCreation, format!("array length {}", length))
            }
            other => VmError::Fault {
                address: 0,
                reason: other.to_string(),
            },
        }
    }

    fn start_frame(base_pointer: u64, function: u64, instruction: u32) -> FrameRef {
        FrameRef {
            base_pointer,
            function: FunctionId::from_bits(function),
            instruction: instruction as usize,
        }
    }
}

impl RuntimeInterface for ExecutionContext<'_> {
    fn fetch(&self, address: u64) -> Result<&[u8], VmError> {
        Ok(self.memory.fetch(address)?)
    }

    fn read_constant(&self, address: u64) -> Result<u32, VmError> {
        Ok(self.memory.read_f32(address)?.to_bits())
    }

    fn stack_top(&self) -> u64 {
        self.stack.top()
    }

    fn stack_limit(&self) -> u64 {
        self.stack.limit()
    }

    fn read_slot(&self, address: u64) -> Result<u64, VmError> {
        self.stack
            .read(address)
            .ok_or_else(|| Self::fault(address, "stack read outside the native stack"))
    }

    fn write_slot(&mut self, address: u64, value: u64) -> Result<(), VmError> {
        self.stack
            .write(address, value)
            .ok_or_else(|| Self::fault(address, "stack write outside the native stack"))
    }

    fn load(&self, address: u64, width: Width) -> Result<u64, VmError> {
        let region = self.gc.heap().region();
        let value = match width {
            Width::Byte => region.read_u8(address).map(u64::from),
            Width::Dword => region.read_u32(address).map(|v| v as i32 as i64 as u64),
            Width::Qword => region.read_u64(address),
        };
        value.ok_or_else(|| Self::fault(address, "heap read outside the heap"))
    }

    fn store(&mut self, address: u64, width: Width, value: u64) -> Result<(), VmError> {
        let region = self.gc.heap_mut().region_mut();
        let written = match width {
            Width::Byte => region.write_u8(address, value as u8),
            Width::Dword => region.write_u32(address, value as u32),
            Width::Qword => region.write_u64(address, value),
        };
        written.ok_or_else(|| Self::fault(address, "heap write outside the heap"))
    }

    fn create_array(&mut self, array_type: u32, length: i32) -> Result<u64, VmError> {
        let array = Self::type_id(array_type)?;
        if length < 0 {
            let message = format!("cannot create {} with length {}", self.types.name(array), length);
            return Err(self.trap(TrapKind::InvalidArrayCreation, message));
        }
        match self.gc.new_array(self.types, array, length as i64) {
            Ok(address) => Ok(address),
            Err(e) => Err(self.allocation_failed(e)),
        }
    }

    fn create_class(&mut self, class_type: u32) -> Result<u64, VmError> {
        let class = Self::type_id(class_type)?;
        match self.gc.new_class(self.types, class) {
            Ok(address) => Ok(address),
            Err(e) => Err(self.allocation_failed(e)),
        }
    }

    fn garbage_collect(&mut self, base_pointer: u64, function: u64, instruction: u32) -> Result<(), VmError> {
        let start = Self::start_frame(base_pointer, function, instruction);
        let types = self.types;
        let print = self.config.print_stack_frame;
        let mut roots = RootSet::new();

        let walker = StackWalker::new(&*self.stack, &*self.call_stack, self.functions);
        let frames = walker.visit(start, |frame, slot| {
            let is_reference = types.is_reference(slot.ty);
            if is_reference {
                roots.add_stack_root(slot.value);
            }
            if print {
                tracing::info!(
                    target: "kestrel::gc",
                    "{} @{:04} {:?} {}: {} = {:#x}{}",
                    frame.function.name(),
                    frame.instruction,
                    slot.kind,
                    slot.index,
                    types.name(slot.ty),
                    slot.value,
                    if is_reference { " (root)" } else { "" }
                );
            }
        })?;

        let report = self.gc.collect(types, &roots)?;
        tracing::debug!(
            frames,
            roots = report.roots,
            freed = report.deallocated.len(),
            "collection requested by compiled code"
        );
        Ok(())
    }

    fn print_call_stack(&mut self, base_pointer: u64, function: u64, instruction: u32) -> Result<(), VmError> {
        let start = Self::start_frame(base_pointer, function, instruction);
        let walker = StackWalker::new(&*self.stack, &*self.call_stack, self.functions);
        for frame in walker.frames(start)? {
            writeln!(
                self.output,
                "  at {} [{:04}]",
                frame.function.definition().signature(self.types),
                frame.instruction
            )?;
        }
        Ok(())
    }

    fn call_native(&mut self, routine: NativeRoutine, arguments: &[u64]) -> Result<(), VmError> {
        let value = arguments.first().copied();
        match (routine, value) {
            (NativeRoutine::PrintInt, Some(value)) => writeln!(self.output, "{}", value as u32 as i32)?,
            (NativeRoutine::PrintFloat, Some(value)) => {
                writeln!(self.output, "{}", f32::from_bits(value as u32))?
            }
            (NativeRoutine::PrintBool, Some(value)) => writeln!(self.output, "{}", value != 0)?,
            _ => {
                return Err(Self::fault(
                    0,
                    &format!("{} cannot be called through its routine address", routine.name()),
                ))
            }
        }
        Ok(())
    }

    fn push_call_frame(&mut self, function: u64, instruction: u32) -> Result<(), VmError> {
        let entry = CallStackEntry {
            function: FunctionId::from_bits(function),
            instruction,
        };
        match self.call_stack.push(entry) {
            Ok(()) => Ok(()),
            Err(CallStackError::Overflow { capacity }) => {
                let message = format!("call depth exceeds {} frames", capacity);
                Err(self.trap(TrapKind::StackOverflow, message))
            }
            Err(e) => Err(Self::fault(0, &e.to_string())),
        }
    }

    fn pop_call_frame(&mut self) -> Result<(), VmError> {
        self.call_stack
            .pop()
            .map(|_| ())
            .map_err(|e| Self::fault(0, &e.to_string()))
    }

    fn trap(&mut self, kind: TrapKind, message: String) -> VmError {
        tracing::error!(%kind, "{}", message);
        VmError::Trap(Trap { kind, message })
    }
}
