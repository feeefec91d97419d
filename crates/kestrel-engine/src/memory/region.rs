//! Committed address ranges

use super::{sys, MemoryError, Protection};
use std::ptr::NonNull;

/// A committed, page-aligned mapping
///
/// Accessors take absolute addresses and return `None` when the access
/// would leave the mapping.
pub struct Region {
    ptr: NonNull<u8>,
    size: usize,
}

impl Region {
    /// Commit at least `min_size` bytes of zeroed read-write memory
    pub fn commit(min_size: usize) -> Result<Self, MemoryError> {
        let size = sys::round_to_pages(min_size);
        let ptr = sys::map(size).map_err(|source| MemoryError::CommitFailed { size, source })?;
        Ok(Self { ptr, size })
    }

    /// Lowest address
    #[inline]
    pub fn base(&self) -> u64 {
        self.ptr.as_ptr() as u64
    }

    /// One past the highest address
    #[inline]
    pub fn end(&self) -> u64 {
        self.base() + self.size as u64
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Whether `[address, address + len)` lies inside the mapping
    #[inline]
    pub fn contains(&self, address: u64, len: usize) -> bool {
        self.offset(address, len).is_some()
    }

    #[inline]
    fn offset(&self, address: u64, len: usize) -> Option<usize> {
        let offset = address.checked_sub(self.base())? as usize;
        (offset.checked_add(len)? <= self.size).then_some(offset)
    }

    pub fn bytes(&self) -> &[u8] {
        // SAFETY: the mapping is readable in every protection mode used here
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.size) }
    }

    /// Mutable view; callers must only write while the mapping is read-write
    pub(crate) fn bytes_mut(&mut self) -> &mut [u8] {
        // SAFETY: exclusive borrow of a live mapping
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.size) }
    }

    /// Slice starting at `address`
    pub fn slice(&self, address: u64, len: usize) -> Option<&[u8]> {
        let offset = self.offset(address, len)?;
        Some(&self.bytes()[offset..offset + len])
    }

    pub fn read_u8(&self, address: u64) -> Option<u8> {
        self.slice(address, 1).map(|bytes| bytes[0])
    }

    pub fn read_u32(&self, address: u64) -> Option<u32> {
        let bytes = self.slice(address, 4)?;
        Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn read_u64(&self, address: u64) -> Option<u64> {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(self.slice(address, 8)?);
        Some(u64::from_le_bytes(raw))
    }

    /// Copy `data` to `address`
    pub(crate) fn write(&mut self, address: u64, data: &[u8]) -> Option<()> {
        let offset = self.offset(address, data.len())?;
        self.bytes_mut()[offset..offset + data.len()].copy_from_slice(data);
        Some(())
    }

    pub(crate) fn write_u8(&mut self, address: u64, value: u8) -> Option<()> {
        self.write(address, &[value])
    }

    pub(crate) fn write_u32(&mut self, address: u64, value: u32) -> Option<()> {
        self.write(address, &value.to_le_bytes())
    }

    pub(crate) fn write_u64(&mut self, address: u64, value: u64) -> Option<()> {
        self.write(address, &value.to_le_bytes())
    }

    /// Fill `[address, address + len)` with `byte`
    pub(crate) fn fill(&mut self, address: u64, len: usize, byte: u8) -> Option<()> {
        let offset = self.offset(address, len)?;
        self.bytes_mut()[offset..offset + len].fill(byte);
        Some(())
    }

    pub(crate) fn protect(&self, protection: Protection) -> Result<(), MemoryError> {
        sys::protect(self.ptr, self.size, protection)
            .map_err(|source| MemoryError::ProtectFailed { protection, source })
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        if let Err(err) = sys::unmap(self.ptr, self.size) {
            tracing::warn!(base = self.base(), size = self.size, error = %err, "munmap failed");
        }
    }
}

impl std::fmt::Debug for Region {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Region")
            .field("base", &format_args!("{:#x}", self.base()))
            .field("size", &self.size)
            .finish()
    }
}
