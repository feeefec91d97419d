//! Call-stack side table
//!
//! A fixed-capacity region recording, per active call, the calling function
//! and the instruction index of the call site. The slot at offset 0 holds the
//! address of the next free entry. Which native frame an entry belongs to is
//! not stored here: it follows from the saved base-pointer chain.

use super::NativeStack;
use crate::bytecode::FunctionId;
use crate::memory::{MemoryError, Region};

const TOP_OFFSET: u64 = 0;
const ENTRIES_OFFSET: u64 = 8;

/// Bytes per entry: function (8), instruction (4), padding (4)
pub const ENTRY_SIZE: u64 = 16;

/// One active call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallStackEntry {
    /// Function whose frame is suspended at the call
    pub function: FunctionId,
    /// Instruction index of the call site
    pub instruction: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CallStackError {
    #[error("call stack overflow (capacity {capacity})")]
    Overflow { capacity: usize },
    #[error("call stack underflow")]
    Underflow,
    #[error("base pointer chain is broken at {base_pointer:#x}")]
    BrokenChain { base_pointer: u64 },
    #[error("call stack entry at {0:#x} is outside the call stack region")]
    Unwritable(u64),
}

pub struct CallStack {
    region: Region,
    capacity: usize,
}

impl CallStack {
    pub fn new(capacity: usize) -> Result<Self, MemoryError> {
        let mut region = Region::commit((ENTRIES_OFFSET + ENTRY_SIZE * capacity as u64) as usize)?;
        let base = region.base();
        region
            .write_u64(base + TOP_OFFSET, base + ENTRIES_OFFSET)
            .ok_or(MemoryError::Unmapped(base))?;
        Ok(Self { region, capacity })
    }

    fn entries_base(&self) -> u64 {
        self.region.base() + ENTRIES_OFFSET
    }

    fn top(&self) -> u64 {
        self.region
            .read_u64(self.region.base() + TOP_OFFSET)
            .unwrap_or_else(|| self.entries_base())
    }

    fn set_top(&mut self, top: u64) {
        let base = self.region.base();
        // the top slot is always inside the region
        let _ = self.region.write_u64(base + TOP_OFFSET, top);
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        ((self.top() - self.entries_base()) / ENTRY_SIZE) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn push(&mut self, entry: CallStackEntry) -> Result<(), CallStackError> {
        if self.len() >= self.capacity {
            return Err(CallStackError::Overflow {
                capacity: self.capacity,
            });
        }
        let top = self.top();
        self.region
            .write_u64(top, entry.function.to_bits())
            .and_then(|()| self.region.write_u32(top + 8, entry.instruction))
            .ok_or(CallStackError::Unwritable(top))?;
        self.set_top(top + ENTRY_SIZE);
        Ok(())
    }

    pub fn pop(&mut self) -> Result<CallStackEntry, CallStackError> {
        let entry = self.entry(0).ok_or(CallStackError::Underflow)?;
        let top = self.top();
        self.set_top(top - ENTRY_SIZE);
        Ok(entry)
    }

    /// Entry `depth` positions below the top (0 = most recent)
    pub fn entry(&self, depth: usize) -> Option<CallStackEntry> {
        if depth >= self.len() {
            return None;
        }
        let address = self.top() - ENTRY_SIZE * (depth as u64 + 1);
        Some(CallStackEntry {
            function: FunctionId::from_bits(self.region.read_u64(address)?),
            instruction: self.region.read_u32(address + 8)?,
        })
    }

    /// All entries, most recent first
    pub fn entries(&self) -> Vec<CallStackEntry> {
        (0..self.len()).filter_map(|depth| self.entry(depth)).collect()
    }

    pub fn clear(&mut self) {
        let base = self.entries_base();
        self.set_top(base);
    }

    /// Pair every entry with the base pointer of the frame it describes
    ///
    /// The entry `n` positions from the top belongs to the frame reached by
    /// following the saved base-pointer chain `n + 1` hops from
    /// `base_pointer`.
    pub fn get_entries(
        &self,
        base_pointer: u64,
        stack: &NativeStack,
    ) -> Result<Vec<(u64, CallStackEntry)>, CallStackError> {
        let len = self.len();
        let mut out = Vec::with_capacity(len);
        let mut bp = base_pointer;
        for depth in 0..len {
            bp = stack
                .read(bp)
                .ok_or(CallStackError::BrokenChain { base_pointer: bp })?;
            let entry = self.entry(depth).ok_or(CallStackError::Underflow)?;
            out.push((bp, entry));
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(raw: u64, instruction: u32) -> CallStackEntry {
        CallStackEntry {
            function: FunctionId::from_bits(raw),
            instruction,
        }
    }

    #[test]
    fn test_push_pop() {
        let mut calls = CallStack::new(4).unwrap();
        assert!(calls.is_empty());
        calls.push(entry(1, 10)).unwrap();
        calls.push(entry(2, 20)).unwrap();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls.entries(), vec![entry(2, 20), entry(1, 10)]);
        assert_eq!(calls.pop().unwrap(), entry(2, 20));
        assert_eq!(calls.pop().unwrap(), entry(1, 10));
        assert_eq!(calls.pop(), Err(CallStackError::Underflow));
    }

    #[test]
    fn test_capacity_is_fixed() {
        let mut calls = CallStack::new(2).unwrap();
        calls.push(entry(1, 0)).unwrap();
        calls.push(entry(1, 1)).unwrap();
        assert_eq!(
            calls.push(entry(1, 2)),
            Err(CallStackError::Overflow { capacity: 2 })
        );
        calls.clear();
        assert!(calls.is_empty());
    }

    #[test]
    fn test_get_entries_follows_base_pointer_chain() {
        let mut stack = NativeStack::new(4096).unwrap();
        let outer = stack.top() - 8;
        let middle = outer - 64;
        let inner = middle - 64;
        stack.write(outer, 0).unwrap();
        stack.write(middle, outer).unwrap();
        stack.write(inner, middle).unwrap();

        let mut calls = CallStack::new(8).unwrap();
        calls.push(entry(1, 4)).unwrap(); // outer called middle at 4
        calls.push(entry(2, 7)).unwrap(); // middle called inner at 7

        let pairs = calls.get_entries(inner, &stack).unwrap();
        assert_eq!(pairs, vec![(middle, entry(2, 7)), (outer, entry(1, 4))]);
    }

    #[test]
    fn test_broken_chain() {
        let stack = NativeStack::new(4096).unwrap();
        let mut calls = CallStack::new(8).unwrap();
        calls.push(entry(1, 0)).unwrap();
        assert_eq!(
            calls.get_entries(8, &stack),
            Err(CallStackError::BrokenChain { base_pointer: 8 })
        );
    }
}
