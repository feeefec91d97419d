//! Managed heap
//!
//! A single committed region with a monotonically advancing free pointer.
//! Objects are never moved; dead objects stay in place as tombstones.

use super::collector::GcError;
use super::header::{
    GcInfo, ObjectHeader, ARRAY_LENGTH_SIZE, DEAD_SENTINEL, HEADER_SIZE, MAX_OBJECT_SIZE,
    MIN_DATA_SIZE,
};
use crate::memory::{MemoryError, Region};
use crate::types::{BaseType, TypeId, TypeProvider};

/// A live object found by a heap walk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapObject {
    /// Data address; what references hold
    pub address: u64,
    pub type_id: TypeId,
    pub gc_info: GcInfo,
    /// Total allocation size, header included
    pub size: usize,
}

/// Data bytes of an instance of a class whose fields take `fields_size` bytes
pub(crate) fn class_data_size(fields_size: usize) -> usize {
    fields_size.max(MIN_DATA_SIZE)
}

/// Data bytes of an array of `length` elements of `element_size` bytes
pub(crate) fn array_data_size(element_size: usize, length: usize) -> Option<usize> {
    element_size
        .checked_mul(length)?
        .checked_add(ARRAY_LENGTH_SIZE)
}

/// Header plus padded data, or `None` past [`MAX_OBJECT_SIZE`]
pub(crate) fn object_total_size(data_size: usize) -> Option<usize> {
    let total = HEADER_SIZE.checked_add(data_size.max(MIN_DATA_SIZE))?;
    (total <= MAX_OBJECT_SIZE).then_some(total)
}

/// Bump-allocated object arena
pub struct ManagedHeap {
    region: Region,
    /// Header address of the next allocation
    next: u64,
}

impl ManagedHeap {
    /// Commit a heap of at least `size` bytes
    pub fn new(size: usize) -> Result<Self, MemoryError> {
        let region = Region::commit(size)?;
        let next = region.base();
        Ok(Self { region, next })
    }

    /// Reserve and zero-fill a header plus `data_size` bytes
    ///
    /// Returns the data address, or `None` when the request does not fit in
    /// the remaining space or exceeds [`MAX_OBJECT_SIZE`].
    pub fn allocate(&mut self, data_size: usize) -> Option<u64> {
        let total = object_total_size(data_size)?;
        if total > self.available() {
            return None;
        }
        let start = self.next;
        self.region.fill(start, total, 0)?;
        self.next = start + total as u64;
        Some(start + HEADER_SIZE as u64)
    }

    pub fn base(&self) -> u64 {
        self.region.base()
    }

    /// Current free pointer
    pub fn next(&self) -> u64 {
        self.next
    }

    pub fn capacity(&self) -> usize {
        self.region.size()
    }

    /// Bytes handed out so far, tombstones included
    pub fn used(&self) -> usize {
        (self.next - self.region.base()) as usize
    }

    pub fn available(&self) -> usize {
        self.capacity() - self.used()
    }

    /// Whether `address` could be the data address of an allocated object
    pub fn contains(&self, address: u64) -> bool {
        address >= self.base() + HEADER_SIZE as u64 && address < self.next
    }

    pub fn region(&self) -> &Region {
        &self.region
    }

    pub(crate) fn region_mut(&mut self) -> &mut Region {
        &mut self.region
    }

    pub fn header(&self, data: u64) -> Option<ObjectHeader> {
        ObjectHeader::read(&self.region, data)
    }

    pub(crate) fn set_header(&mut self, data: u64, header: ObjectHeader) -> Option<()> {
        header.write(&mut self.region, data)
    }

    pub(crate) fn set_gc_info(&mut self, data: u64, gc_info: GcInfo) -> Option<()> {
        let mut header = self.header(data)?;
        header.gc_info = gc_info;
        self.set_header(data, header)
    }

    /// Total size of the live object at `data`, derived from its type
    pub fn object_size(&self, types: &TypeProvider, type_id: TypeId, data: u64) -> Option<usize> {
        let data_size = match types.try_get(type_id)? {
            BaseType::Class(class) => class_data_size(class.metadata()?.size() as usize),
            BaseType::Array(array) => {
                let length = self.region.read_u32(data)? as i32;
                let length = usize::try_from(length).ok()?;
                array_data_size(types.size_of(array.element()), length)?
            }
            BaseType::Primitive(_) => return None,
        };
        object_total_size(data_size)
    }

    /// Overwrite a dead object with a tombstone recording its total size
    pub(crate) fn tombstone(&mut self, data: u64, total_size: usize) -> Option<()> {
        let recorded = u32::try_from(total_size).ok()?;
        let data_size = total_size.checked_sub(HEADER_SIZE)?;
        self.region.fill(data, data_size, 0)?;
        self.region.write_u32(data, recorded)?;
        self.set_header(
            data,
            ObjectHeader {
                type_id: 0,
                gc_info: GcInfo::from_byte(DEAD_SENTINEL),
            },
        )
    }

    /// Walk every live object from the start of the heap to the free pointer
    ///
    /// Tombstones are stepped over using the size stored in them, without
    /// consulting type information.
    pub fn visit_objects<F>(&self, types: &TypeProvider, mut visitor: F) -> Result<(), GcError>
    where
        F: FnMut(HeapObject),
    {
        let mut cursor = self.base();
        while cursor < self.next {
            let data = cursor + HEADER_SIZE as u64;
            let header = self.header(data).ok_or(GcError::CorruptHeap(cursor))?;
            let size = if header.is_tombstone() {
                self.region
                    .read_u32(data)
                    .map(|size| size as usize)
                    .filter(|&size| size >= HEADER_SIZE + MIN_DATA_SIZE)
                    .ok_or(GcError::CorruptHeap(cursor))?
            } else {
                let type_id = TypeId::from_u32(header.type_id).ok_or(GcError::CorruptHeap(cursor))?;
                let size = self
                    .object_size(types, type_id, data)
                    .ok_or(GcError::CorruptHeap(cursor))?;
                visitor(HeapObject {
                    address: data,
                    type_id,
                    gc_info: header.gc_info,
                    size,
                });
                size
            };
            cursor += size as u64;
        }
        Ok(())
    }

    /// Discard every allocation
    pub fn reset(&mut self) {
        let base = self.base();
        let used = self.used();
        let _ = self.region.fill(base, used, 0);
        self.next = base;
    }
}
