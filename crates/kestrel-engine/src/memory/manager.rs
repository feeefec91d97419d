//! Code and read-only constant allocation

use super::{sys, MemoryError, Page, Protection};
use rustc_hash::FxHashMap;

/// Alignment of every code allocation
const CODE_ALIGNMENT: usize = 16;

/// Size of one read-only constant slot
const CONSTANT_SLOT: usize = 4;

/// Bump allocator over a growing set of pages
struct PagePool {
    pages: Vec<Page>,
    /// Offset of the next free byte in the last page
    cursor: usize,
    min_page_size: usize,
}

impl PagePool {
    fn new(min_page_size: usize) -> Self {
        Self {
            pages: Vec::new(),
            cursor: 0,
            min_page_size,
        }
    }

    /// Reserve `size` bytes inside a single page
    fn allocate(&mut self, size: usize, alignment: usize) -> Result<u64, MemoryError> {
        let aligned = self.cursor.next_multiple_of(alignment);
        let fits = self
            .pages
            .last()
            .is_some_and(|page| aligned + size <= page.size());
        let offset = if fits {
            aligned
        } else {
            self.pages.push(Page::commit(size.max(self.min_page_size))?);
            0
        };
        self.cursor = offset + size;
        // last() is Some: either it fit or a page was just pushed
        let base = self.pages.last().map(Page::base).unwrap_or_default();
        Ok(base + offset as u64)
    }

    fn page_mut(&mut self, address: u64) -> Option<&mut Page> {
        self.pages.iter_mut().find(|page| page.contains(address))
    }

    fn page(&self, address: u64) -> Option<&Page> {
        self.pages.iter().find(|page| page.contains(address))
    }

    fn protect_all(&mut self, protection: Protection) -> Result<(), MemoryError> {
        for page in &mut self.pages {
            page.protect(protection)?;
        }
        Ok(())
    }
}

/// Supplies code pages and read-only constant pages to the JIT
///
/// Two-phase lifecycle: while writable, code is allocated, written and
/// patched; [`MemoryManager::make_executable`] then flips every code page to
/// read+execute and every constant page to read-only, after which nothing
/// more can be allocated or written. Dropping the manager unmaps every page.
pub struct MemoryManager {
    code: PagePool,
    read_only: PagePool,
    /// f32 bit pattern -> constant address
    float_constants: FxHashMap<u32, u64>,
    executable: bool,
}

impl MemoryManager {
    /// Create a manager whose code pages are at least `code_page_size` bytes
    pub fn new(code_page_size: usize) -> Self {
        Self {
            code: PagePool::new(code_page_size),
            read_only: PagePool::new(sys::page_size()),
            float_constants: FxHashMap::default(),
            executable: false,
        }
    }

    /// Commit a standalone read-write page of at least `min_size` bytes
    pub fn create_page(&self, min_size: usize) -> Result<Page, MemoryError> {
        Page::commit(min_size)
    }

    /// Reserve `size` bytes of code space, 16-byte aligned, never spanning pages
    pub fn allocate_code(&mut self, size: usize) -> Result<u64, MemoryError> {
        if self.executable {
            return Err(MemoryError::Sealed);
        }
        self.code.allocate(size, CODE_ALIGNMENT)
    }

    /// Copy `bytes` into previously allocated code space
    pub fn write_code(&mut self, address: u64, bytes: &[u8]) -> Result<(), MemoryError> {
        if self.executable {
            return Err(MemoryError::Sealed);
        }
        self.code
            .page_mut(address)
            .ok_or(MemoryError::Unmapped(address))?
            .write(address, bytes)
    }

    /// Address of a read-only copy of `value`; equal values share one slot
    pub fn allocate_read_only_f32(&mut self, value: f32) -> Result<u64, MemoryError> {
        let bits = value.to_bits();
        if let Some(&address) = self.float_constants.get(&bits) {
            return Ok(address);
        }
        if self.executable {
            return Err(MemoryError::Sealed);
        }
        let address = self.read_only.allocate(CONSTANT_SLOT, CONSTANT_SLOT)?;
        self.read_only
            .page_mut(address)
            .ok_or(MemoryError::Unmapped(address))?
            .write(address, &bits.to_le_bytes())?;
        self.float_constants.insert(bits, address);
        Ok(address)
    }

    /// Seal the manager: code pages become read+execute, constant pages read-only
    ///
    /// One-way and whole-manager; a second call is an error.
    pub fn make_executable(&mut self) -> Result<(), MemoryError> {
        if self.executable {
            return Err(MemoryError::Sealed);
        }
        self.code.protect_all(Protection::ReadExecute)?;
        self.read_only.protect_all(Protection::ReadOnly)?;
        self.executable = true;
        tracing::debug!(
            code_pages = self.code.pages.len(),
            read_only_pages = self.read_only.pages.len(),
            "pages made executable"
        );
        Ok(())
    }

    pub fn is_executable(&self) -> bool {
        self.executable
    }

    /// Code bytes from `address` to the end of its page, for execution
    pub fn fetch(&self, address: u64) -> Result<&[u8], MemoryError> {
        if !self.executable {
            return Err(MemoryError::NotExecutable);
        }
        self.code
            .page(address)
            .and_then(|page| page.tail(address))
            .ok_or(MemoryError::Unmapped(address))
    }

    /// Read `len` bytes of code or constant memory, in either phase
    pub fn read(&self, address: u64, len: usize) -> Result<&[u8], MemoryError> {
        self.code
            .page(address)
            .or_else(|| self.read_only.page(address))
            .and_then(|page| page.region().slice(address, len))
            .ok_or(MemoryError::Unmapped(address))
    }

    /// Load a float constant
    pub fn read_f32(&self, address: u64) -> Result<f32, MemoryError> {
        self.read_only
            .page(address)
            .and_then(|page| page.region().read_u32(address))
            .map(f32::from_bits)
            .ok_or(MemoryError::Unmapped(address))
    }

    /// Whether `address` lies in a code page
    pub fn is_code(&self, address: u64) -> bool {
        self.code.page(address).is_some()
    }

    pub fn code_pages(&self) -> &[Page] {
        &self.code.pages
    }

    pub fn read_only_pages(&self) -> &[Page] {
        &self.read_only.pages
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_allocations_are_aligned_and_disjoint() {
        let mut memory = MemoryManager::new(4096);
        let a = memory.allocate_code(10).unwrap();
        let b = memory.allocate_code(10).unwrap();
        assert_eq!(a % 16, 0);
        assert_eq!(b % 16, 0);
        assert!(b >= a + 10);
        assert_eq!(memory.code_pages().len(), 1);
    }

    #[test]
    fn test_allocation_never_spans_pages() {
        let page = sys::page_size();
        let mut memory = MemoryManager::new(page);
        let first = memory.allocate_code(page - 8).unwrap();
        let second = memory.allocate_code(64).unwrap();
        assert_eq!(memory.code_pages().len(), 2);
        assert_eq!(second, memory.code_pages()[1].base());
        assert_ne!(first, second);
    }

    #[test]
    fn test_oversized_allocation_gets_its_own_page() {
        let page = sys::page_size();
        let mut memory = MemoryManager::new(page);
        let address = memory.allocate_code(3 * page).unwrap();
        assert!(memory.code_pages()[0].size() >= 3 * page);
        assert_eq!(address, memory.code_pages()[0].base());
    }

    #[test]
    fn test_float_constants_are_deduplicated() {
        let mut memory = MemoryManager::new(4096);
        let a = memory.allocate_read_only_f32(1.5).unwrap();
        let b = memory.allocate_read_only_f32(2.5).unwrap();
        let c = memory.allocate_read_only_f32(1.5).unwrap();
        assert_eq!(a, c);
        assert_ne!(a, b);
        assert_eq!(memory.read_f32(b).unwrap(), 2.5);
    }

    #[test]
    fn test_make_executable_seals_everything() {
        let mut memory = MemoryManager::new(4096);
        let code = memory.allocate_code(4).unwrap();
        memory.write_code(code, &[1, 2, 3, 4]).unwrap();
        let constant = memory.allocate_read_only_f32(3.0).unwrap();

        assert!(matches!(memory.fetch(code), Err(MemoryError::NotExecutable)));
        memory.make_executable().unwrap();

        assert!(memory.is_executable());
        assert_eq!(&memory.fetch(code).unwrap()[..4], &[1, 2, 3, 4]);
        assert_eq!(memory.read_f32(constant).unwrap(), 3.0);
        assert!(memory
            .code_pages()
            .iter()
            .all(|page| page.protection() == Protection::ReadExecute));
        assert!(memory
            .read_only_pages()
            .iter()
            .all(|page| page.protection() == Protection::ReadOnly));

        assert!(matches!(memory.allocate_code(4), Err(MemoryError::Sealed)));
        assert!(matches!(memory.write_code(code, &[0]), Err(MemoryError::Sealed)));
        assert!(matches!(memory.allocate_read_only_f32(9.0), Err(MemoryError::Sealed)));
        assert!(matches!(memory.make_executable(), Err(MemoryError::Sealed)));
        // existing constants are still served
        assert_eq!(memory.allocate_read_only_f32(3.0).unwrap(), constant);
    }

    #[test]
    fn test_unmapped_addresses() {
        let mut memory = MemoryManager::new(4096);
        memory.allocate_code(8).unwrap();
        memory.make_executable().unwrap();
        assert!(matches!(memory.fetch(8), Err(MemoryError::Unmapped(8))));
        assert!(matches!(memory.read_f32(8), Err(MemoryError::Unmapped(8))));
    }

    #[test]
    fn test_create_page() {
        let memory = MemoryManager::new(4096);
        let page = memory.create_page(sys::page_size() + 1).unwrap();
        assert_eq!(page.size(), 2 * sys::page_size());
        assert_eq!(page.protection(), Protection::ReadWrite);
    }
}
