//! Object header
//!
//! Every heap allocation starts with a header followed by the object data.
//! References point at the data, so the header sits just below them.
//!
//! ```text
//! ┌───────────────────────────┐
//! │ type id   (u32, LE)       │  data - 5
//! │ gc info   (u8)            │  data - 1
//! ├───────────────────────────┤
//! │ data                      │  <- reference
//! └───────────────────────────┘
//! ```
//!
//! `gc info` packs the mark bit (bit 0) and a 7-bit saturating survival
//! count. A swept object is tombstoned: its type id is zeroed, its gc info
//! becomes [`DEAD_SENTINEL`] and the first four data bytes hold the total
//! size of the allocation so the heap walk can step over it.

use crate::memory::Region;

/// Header bytes before the data
pub const HEADER_SIZE: usize = 5;

/// Offset of the type id from the data address
pub const TYPE_ID_OFFSET: u64 = 5;

/// Offset of the gc info byte from the data address
pub const GC_INFO_OFFSET: u64 = 1;

/// Gc info value of a tombstone
///
/// 0xFF is also "marked, survived 127 times"; a tombstone is identified by
/// this byte together with a zero type id, which no live object has.
pub const DEAD_SENTINEL: u8 = 0xFF;

/// Survival count saturates here
pub const MAX_SURVIVAL_COUNT: u8 = 127;

/// Every object has room for a tombstone's size field
pub const MIN_DATA_SIZE: usize = 4;

/// Largest object, header included; a tombstone records its size in 4 bytes
pub const MAX_OBJECT_SIZE: usize = u32::MAX as usize;

/// Arrays store their length in the first data bytes
pub const ARRAY_LENGTH_SIZE: usize = 4;

/// Mark bit and survival count
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GcInfo(u8);

impl GcInfo {
    #[inline]
    pub fn from_byte(byte: u8) -> Self {
        GcInfo(byte)
    }

    #[inline]
    pub fn to_byte(self) -> u8 {
        self.0
    }

    #[inline]
    pub fn is_marked(self) -> bool {
        self.0 & 1 != 0
    }

    #[inline]
    pub fn marked(self) -> Self {
        GcInfo(self.0 | 1)
    }

    #[inline]
    pub fn unmarked(self) -> Self {
        GcInfo(self.0 & !1)
    }

    /// Number of collections survived
    #[inline]
    pub fn survival_count(self) -> u8 {
        self.0 >> 1
    }

    /// Count one more survived collection, saturating
    #[inline]
    pub fn survived(self) -> Self {
        let count = (self.survival_count() + 1).min(MAX_SURVIVAL_COUNT);
        GcInfo((count << 1) | (self.0 & 1))
    }
}

/// Decoded header of the object at a data address
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectHeader {
    /// Raw type id; 0 only in tombstones
    pub type_id: u32,
    pub gc_info: GcInfo,
}

impl ObjectHeader {
    /// Read the header of the object whose data starts at `data`
    pub fn read(region: &Region, data: u64) -> Option<Self> {
        let start = data.checked_sub(TYPE_ID_OFFSET)?;
        Some(Self {
            type_id: region.read_u32(start)?,
            gc_info: GcInfo::from_byte(region.read_u8(data - GC_INFO_OFFSET)?),
        })
    }

    /// Write the header of the object whose data starts at `data`
    pub(crate) fn write(self, region: &mut Region, data: u64) -> Option<()> {
        let start = data.checked_sub(TYPE_ID_OFFSET)?;
        region.write_u32(start, self.type_id)?;
        region.write_u8(data - GC_INFO_OFFSET, self.gc_info.to_byte())
    }

    pub fn is_tombstone(self) -> bool {
        self.type_id == 0 && self.gc_info.to_byte() == DEAD_SENTINEL
    }
}
