//! GC root tracking
//!
//! Roots are the reference values found in the argument, local and operand
//! slots of every active frame at the moment a collection starts.

/// Root set for one collection
#[derive(Debug, Default)]
pub struct RootSet {
    /// Object addresses held by stack slots
    stack_roots: Vec<u64>,
}

impl RootSet {
    pub fn new() -> Self {
        Self {
            stack_roots: Vec::new(),
        }
    }

    /// Add the value of a reference-typed slot; null is not traced
    pub fn add_stack_root(&mut self, address: u64) {
        if address != 0 {
            self.stack_roots.push(address);
        }
    }

    pub fn clear(&mut self) {
        self.stack_roots.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = u64> + '_ {
        self.stack_roots.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.stack_roots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stack_roots.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_is_ignored() {
        let mut roots = RootSet::new();
        roots.add_stack_root(0);
        assert!(roots.is_empty());
        roots.add_stack_root(0x1000);
        roots.add_stack_root(0x1000);
        assert_eq!(roots.len(), 2);
        assert_eq!(roots.iter().collect::<Vec<_>>(), vec![0x1000, 0x1000]);
        roots.clear();
        assert!(roots.is_empty());
    }
}
