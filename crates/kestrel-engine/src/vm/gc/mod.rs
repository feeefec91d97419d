//! Garbage collection
//!
//! One non-moving generation: a bump-allocated heap whose objects carry a
//! 5-byte header, and a stop-the-world mark-sweep collector whose roots come
//! from walking the native frames of compiled code.

mod collector;
mod header;
mod heap;
mod roots;

pub use collector::{
    AllocationError, AllocationLog, CollectionReport, Deallocation, GarbageCollector, GcError,
    GcOptions, GcStats,
};
pub use header::{
    GcInfo, ObjectHeader, ARRAY_LENGTH_SIZE, DEAD_SENTINEL, HEADER_SIZE, MAX_OBJECT_SIZE,
    MAX_SURVIVAL_COUNT, MIN_DATA_SIZE,
};
pub use heap::{HeapObject, ManagedHeap};
pub use roots::RootSet;
