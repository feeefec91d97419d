//! Top-level JIT engine: compiles a load unit, links its calls and seals the
//! code pages.

use super::code_cache::CodeCache;
use super::compiler::{compile_function, CompileContext, CompiledFunction};
use super::CompileError;
use crate::bytecode::{FunctionId, ManagedFunction};
use crate::handle::SlotTable;
use crate::memory::MemoryManager;

/// Compilation state of one load unit
///
/// Functions are compiled one by one, then [`JitEngine::link`] patches
/// every call and [`JitEngine::finalize`] makes the pages executable.
/// Finalizing with calls still unpatched is refused.
#[derive(Debug, Default)]
pub struct JitEngine {
    cache: CodeCache,
    finalized: bool,
}

impl JitEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compile one verified function, returning its entry point
    pub fn compile(&mut self, ctx: &mut CompileContext<'_>, function: FunctionId) -> Result<u64, CompileError> {
        let (compiled, calls) = compile_function(ctx, function)?;
        let entry = compiled.entry;
        self.cache.insert(compiled, calls);
        Ok(entry)
    }

    /// Resolve every outstanding call; returns the number of sites patched
    pub fn link(
        &mut self,
        memory: &mut MemoryManager,
        functions: &SlotTable<ManagedFunction>,
    ) -> Result<usize, CompileError> {
        let patched = self.cache.resolve(memory, functions)?;
        tracing::debug!(
            functions = self.cache.entry_count(),
            code_size = self.cache.total_size(),
            patched,
            "load unit linked"
        );
        Ok(patched)
    }

    /// Seal the code pages
    pub fn finalize(&mut self, memory: &mut MemoryManager) -> Result<(), CompileError> {
        let pending = self.cache.pending_calls().len();
        if pending > 0 {
            return Err(CompileError::Unpatched(pending));
        }
        memory.make_executable()?;
        self.finalized = true;
        Ok(())
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    pub fn entry(&self, function: FunctionId) -> Option<u64> {
        self.cache.entry(function)
    }

    pub fn compiled(&self, function: FunctionId) -> Option<&CompiledFunction> {
        self.cache.get(function)
    }

    pub fn cache(&self) -> &CodeCache {
        &self.cache
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::{verify, FunctionDefinition, Instruction};
    use crate::types::TypeProvider;

    fn define(
        functions: &mut SlotTable<ManagedFunction>,
        definition: FunctionDefinition,
        instructions: Vec<Instruction>,
    ) -> FunctionId {
        let id = functions.insert(ManagedFunction::declared(definition));
        functions.get_mut(id).unwrap().set_body(vec![], instructions);
        id
    }

    fn verify_all(functions: &mut SlotTable<ManagedFunction>, types: &TypeProvider, ids: &[FunctionId]) {
        for &id in ids {
            let snapshots = verify(functions.get(id).unwrap(), types, functions).unwrap();
            functions.get_mut(id).unwrap().set_operand_types(snapshots);
        }
    }

    #[test]
    fn test_finalize_refuses_unpatched_calls() {
        let types = TypeProvider::new();
        let void = types.void();
        let mut functions = SlotTable::new();
        let callee = define(
            &mut functions,
            FunctionDefinition::new("callee", vec![], void),
            vec![Instruction::Return],
        );
        let caller = define(
            &mut functions,
            FunctionDefinition::new("caller", vec![], void),
            vec![Instruction::Call(callee), Instruction::Return],
        );
        verify_all(&mut functions, &types, &[callee, caller]);

        let mut memory = MemoryManager::new(4096);
        let mut engine = JitEngine::new();
        let mut ctx = CompileContext {
            memory: &mut memory,
            types: &types,
            functions: &functions,
        };
        engine.compile(&mut ctx, caller).unwrap();
        assert!(matches!(
            engine.finalize(&mut memory),
            Err(CompileError::Unpatched(1))
        ));
        assert!(!memory.is_executable());

        // linking before the callee exists fails and keeps the site pending
        assert!(engine.link(&mut memory, &functions).is_err());

        let mut ctx = CompileContext {
            memory: &mut memory,
            types: &types,
            functions: &functions,
        };
        engine.compile(&mut ctx, callee).unwrap();
        assert_eq!(engine.link(&mut memory, &functions).unwrap(), 1);
        engine.finalize(&mut memory).unwrap();
        assert!(engine.is_finalized());
        assert!(memory.is_executable());
        assert!(engine.entry(caller).is_some());
    }

    #[test]
    fn test_no_compilation_after_finalize() {
        let types = TypeProvider::new();
        let mut functions = SlotTable::new();
        let f = define(
            &mut functions,
            FunctionDefinition::new("f", vec![], types.void()),
            vec![Instruction::Return],
        );
        verify_all(&mut functions, &types, &[f]);

        let mut memory = MemoryManager::new(4096);
        let mut engine = JitEngine::new();
        engine.finalize(&mut memory).unwrap();
        let mut ctx = CompileContext {
            memory: &mut memory,
            types: &types,
            functions: &functions,
        };
        assert!(matches!(
            engine.compile(&mut ctx, f),
            Err(CompileError::Memory(crate::memory::MemoryError::Sealed))
        ));
    }
}
