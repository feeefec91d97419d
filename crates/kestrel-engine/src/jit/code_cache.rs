//! Code cache for JIT-compiled functions
//!
//! Stores compiled code indexed by function id together with the call sites
//! still waiting for their callee's address. Linking patches those sites in
//! place; it must finish before the code pages are sealed.

use super::compiler::{CallMode, CompiledFunction, UnresolvedCall};
use super::isa::native_routine_address;
use super::CompileError;
use crate::bytecode::{FunctionId, ManagedFunction};
use crate::handle::SlotTable;
use crate::memory::MemoryManager;
use rustc_hash::FxHashMap;

/// Compiled functions of one load unit
#[derive(Debug, Default)]
pub struct CodeCache {
    /// Function id → compiled code
    entries: FxHashMap<FunctionId, CompiledFunction>,
    /// Call sites not yet patched
    pending: Vec<UnresolvedCall>,
    /// Total size of all cached code
    total_code_size: usize,
}

impl CodeCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert compiled code for a function along with its unresolved calls
    pub fn insert(&mut self, compiled: CompiledFunction, calls: Vec<UnresolvedCall>) {
        // Remove old entry size if replacing
        if let Some(old) = self.entries.remove(&compiled.function) {
            self.total_code_size -= old.size;
            self.pending.retain(|call| call.caller != old.function);
        }
        self.total_code_size += compiled.size;
        self.pending.extend(calls);
        self.entries.insert(compiled.function, compiled);
    }

    pub fn get(&self, function: FunctionId) -> Option<&CompiledFunction> {
        self.entries.get(&function)
    }

    /// Entry point of a compiled function
    pub fn entry(&self, function: FunctionId) -> Option<u64> {
        self.entries.get(&function).map(|compiled| compiled.entry)
    }

    pub fn contains(&self, function: FunctionId) -> bool {
        self.entries.contains_key(&function)
    }

    /// Compiled function whose code contains `address`
    pub fn find(&self, address: u64) -> Option<&CompiledFunction> {
        self.entries.values().find(|compiled| compiled.contains(address))
    }

    /// Total size of cached code
    pub fn total_size(&self) -> usize {
        self.total_code_size
    }

    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    pub fn pending_calls(&self) -> &[UnresolvedCall] {
        &self.pending
    }

    /// Where a call to `callee` lands: a native routine's reserved address or
    /// a compiled entry point
    fn target(&self, functions: &SlotTable<ManagedFunction>, call: &UnresolvedCall) -> Option<u64> {
        match functions.get(call.callee)?.native_routine() {
            Some(routine) => Some(native_routine_address(routine)),
            None => self.entry(call.callee),
        }
    }

    /// Patch every pending call site whose callee is known
    ///
    /// Returns the number of sites patched. Fails on the first call whose
    /// callee has no code; that call and the ones after it stay pending.
    pub fn resolve(
        &mut self,
        memory: &mut MemoryManager,
        functions: &SlotTable<ManagedFunction>,
    ) -> Result<usize, CompileError> {
        let pending = std::mem::take(&mut self.pending);
        let mut patched = 0;

        for (position, call) in pending.iter().enumerate() {
            let Some(target) = self.target(functions, call) else {
                self.pending.extend_from_slice(&pending[position..]);
                return Err(CompileError::UnresolvedCall {
                    caller: call.caller,
                    callee: call.callee,
                });
            };
            let result = match call.mode {
                CallMode::Absolute => memory.write_code(call.patch_address, &target.to_le_bytes()),
                CallMode::Relative => {
                    let rel = i32::try_from(target as i64 - call.next_instruction as i64);
                    let Ok(rel) = rel else {
                        self.pending.extend_from_slice(&pending[position..]);
                        return Err(CompileError::CallOutOfRange {
                            patch_address: call.patch_address,
                            target,
                        });
                    };
                    memory.write_code(call.patch_address, &rel.to_le_bytes())
                }
            };
            if let Err(e) = result {
                self.pending.extend_from_slice(&pending[position..]);
                return Err(e.into());
            }
            patched += 1;
        }

        Ok(patched)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::{FunctionDefinition, NativeRoutine};
    use crate::jit::isa::{decode, MachineInstr, CALL_PATCH_OFFSET};
    use crate::types::TypeProvider;

    fn compiled(function: FunctionId, entry: u64, size: usize) -> CompiledFunction {
        CompiledFunction {
            function,
            entry,
            size,
            instruction_offsets: vec![0],
        }
    }

    #[test]
    fn test_insert_and_replace() {
        let types = TypeProvider::new();
        let mut functions = SlotTable::new();
        let f = functions.insert(ManagedFunction::declared(FunctionDefinition::new(
            "f",
            vec![],
            types.void(),
        )));

        let mut cache = CodeCache::new();
        assert!(!cache.contains(f));
        cache.insert(compiled(f, 0x1000, 100), vec![]);
        assert!(cache.contains(f));
        assert_eq!(cache.total_size(), 100);
        assert_eq!(cache.entry(f), Some(0x1000));
        assert_eq!(cache.find(0x1063).map(|c| c.function), Some(f));
        assert!(cache.find(0x1064).is_none());

        // Replace with larger code
        cache.insert(compiled(f, 0x2000, 200), vec![]);
        assert_eq!(cache.total_size(), 200);
        assert_eq!(cache.entry_count(), 1);
    }

    #[test]
    fn test_resolve_patches_native_and_managed_calls() {
        let types = TypeProvider::new();
        let mut functions = SlotTable::new();
        let println = functions.insert(ManagedFunction::native(
            NativeRoutine::PrintInt.definition(&types),
            NativeRoutine::PrintInt,
        ));
        let callee = functions.insert(ManagedFunction::declared(FunctionDefinition::new(
            "callee",
            vec![],
            types.void(),
        )));
        let caller = functions.insert(ManagedFunction::declared(FunctionDefinition::new(
            "caller",
            vec![],
            types.void(),
        )));

        let mut memory = MemoryManager::new(4096);
        let mut code = Vec::new();
        MachineInstr::CallAbsolute(0).encode(&mut code);
        MachineInstr::CallRelative(0).encode(&mut code);
        let base = memory.allocate_code(code.len()).unwrap();
        memory.write_code(base, &code).unwrap();
        let second = base + MachineInstr::CallAbsolute(0).encoded_len() as u64;

        let mut cache = CodeCache::new();
        cache.insert(compiled(callee, base + 0x100, 1), vec![]);
        cache.insert(
            compiled(caller, base, code.len()),
            vec![
                UnresolvedCall {
                    caller,
                    callee: println,
                    patch_address: base + CALL_PATCH_OFFSET as u64,
                    next_instruction: second,
                    mode: CallMode::Absolute,
                },
                UnresolvedCall {
                    caller,
                    callee,
                    patch_address: second + CALL_PATCH_OFFSET as u64,
                    next_instruction: base + code.len() as u64,
                    mode: CallMode::Relative,
                },
            ],
        );

        assert_eq!(cache.resolve(&mut memory, &functions).unwrap(), 2);
        assert!(cache.pending_calls().is_empty());

        let bytes = memory.read(base, code.len()).unwrap();
        let (first, len) = decode(bytes).unwrap();
        assert_eq!(
            first,
            MachineInstr::CallAbsolute(native_routine_address(NativeRoutine::PrintInt))
        );
        let (relative, _) = decode(&bytes[len..]).unwrap();
        let expected = (base + 0x100) as i64 - (base + code.len() as u64) as i64;
        assert_eq!(relative, MachineInstr::CallRelative(expected as i32));
    }

    #[test]
    fn test_missing_callee_stays_pending() {
        let types = TypeProvider::new();
        let mut functions = SlotTable::new();
        let missing = functions.insert(ManagedFunction::declared(FunctionDefinition::new(
            "missing",
            vec![],
            types.void(),
        )));
        let caller = functions.insert(ManagedFunction::declared(FunctionDefinition::new(
            "caller",
            vec![],
            types.void(),
        )));
        let mut memory = MemoryManager::new(4096);
        let mut cache = CodeCache::new();
        cache.insert(
            compiled(caller, 0, 16),
            vec![UnresolvedCall {
                caller,
                callee: missing,
                patch_address: 1,
                next_instruction: 9,
                mode: CallMode::Absolute,
            }],
        );
        let err = cache.resolve(&mut memory, &functions).unwrap_err();
        assert!(matches!(err, CompileError::UnresolvedCall { callee, .. } if callee == missing));
        assert_eq!(cache.pending_calls().len(), 1);
    }
}
