//! Native stack region

use crate::memory::{MemoryError, Region};

/// The region compiled frames live in; grows downward from [`NativeStack::top`]
pub struct NativeStack {
    region: Region,
}

impl NativeStack {
    pub fn new(size: usize) -> Result<Self, MemoryError> {
        Ok(Self {
            region: Region::commit(size)?,
        })
    }

    /// Initial stack pointer
    pub fn top(&self) -> u64 {
        self.region.end()
    }

    /// Lowest usable address; pushing below it overflows
    pub fn limit(&self) -> u64 {
        self.region.base()
    }

    pub fn contains(&self, address: u64, len: usize) -> bool {
        self.region.contains(address, len)
    }

    pub fn region(&self) -> &Region {
        &self.region
    }

    pub(crate) fn region_mut(&mut self) -> &mut Region {
        &mut self.region
    }

    /// Read one slot
    pub fn read(&self, address: u64) -> Option<u64> {
        self.region.read_u64(address)
    }

    /// Write one slot
    pub fn write(&mut self, address: u64, value: u64) -> Option<()> {
        self.region.write_u64(address, value)
    }
}
