//! Pages with tracked protection

use super::{MemoryError, Region};

/// Access mode of a page
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protection {
    ReadWrite,
    ReadOnly,
    ReadExecute,
}

/// A region whose protection mode is tracked, so writes to a sealed page are
/// refused instead of faulting
#[derive(Debug)]
pub struct Page {
    region: Region,
    protection: Protection,
}

impl Page {
    /// Commit a fresh read-write page of at least `min_size` bytes
    pub fn commit(min_size: usize) -> Result<Self, MemoryError> {
        Ok(Self {
            region: Region::commit(min_size)?,
            protection: Protection::ReadWrite,
        })
    }

    pub fn base(&self) -> u64 {
        self.region.base()
    }

    pub fn end(&self) -> u64 {
        self.region.end()
    }

    pub fn size(&self) -> usize {
        self.region.size()
    }

    pub fn protection(&self) -> Protection {
        self.protection
    }

    pub fn contains(&self, address: u64) -> bool {
        self.region.contains(address, 1)
    }

    /// Read view from `address` to the end of the page
    pub fn tail(&self, address: u64) -> Option<&[u8]> {
        let len = self.end().checked_sub(address)? as usize;
        self.region.slice(address, len)
    }

    pub fn region(&self) -> &Region {
        &self.region
    }

    /// Write `data` at `address`; only allowed while read-write
    pub fn write(&mut self, address: u64, data: &[u8]) -> Result<(), MemoryError> {
        if self.protection != Protection::ReadWrite {
            return Err(MemoryError::WriteDenied(self.base()));
        }
        self.region
            .write(address, data)
            .ok_or(MemoryError::Unmapped(address))
    }

    /// Change the access mode
    pub fn protect(&mut self, protection: Protection) -> Result<(), MemoryError> {
        if protection != self.protection {
            self.region.protect(protection)?;
            self.protection = protection;
        }
        Ok(())
    }
}
