//! Mark-sweep garbage collector
//!
//! Collection is synchronous and explicit: it runs when compiled code calls
//! the collect routine, never in response to a failed allocation.

use super::header::{GcInfo, ObjectHeader, ARRAY_LENGTH_SIZE};
use super::heap::{array_data_size, class_data_size, ManagedHeap};
use super::roots::RootSet;
use crate::memory::MemoryError;
use crate::types::{BaseType, TypeId, TypeProvider, REFERENCE_SIZE};
use crate::vm::RuntimeConfig;
use std::time::{Duration, Instant};

/// Garbage collector statistics
#[derive(Debug, Clone)]
pub struct GcStats {
    /// Total number of collections
    pub collections: usize,

    /// Total objects freed
    pub objects_freed: usize,

    /// Total bytes freed
    pub bytes_freed: usize,

    /// Objects allocated since the heap was created
    pub objects_allocated: usize,

    /// Total pause time across all collections
    pub total_pause_time: Duration,

    /// Last collection duration
    pub last_pause_time: Duration,

    /// Average pause time
    pub avg_pause_time: Duration,

    /// Maximum pause time
    pub max_pause_time: Duration,

    /// Minimum pause time
    pub min_pause_time: Duration,

    /// Objects marked in last collection
    pub last_marked_count: usize,

    /// Objects freed in last collection
    pub last_freed_count: usize,

    /// Bytes freed in last collection
    pub last_freed_bytes: usize,

    /// Live objects after last collection
    pub live_objects: usize,

    /// Live bytes after last collection
    pub live_bytes: usize,
}

impl Default for GcStats {
    fn default() -> Self {
        Self {
            collections: 0,
            objects_freed: 0,
            bytes_freed: 0,
            objects_allocated: 0,
            total_pause_time: Duration::ZERO,
            last_pause_time: Duration::ZERO,
            avg_pause_time: Duration::ZERO,
            max_pause_time: Duration::ZERO,
            min_pause_time: Duration::ZERO,
            last_marked_count: 0,
            last_freed_count: 0,
            last_freed_bytes: 0,
            live_objects: 0,
            live_bytes: 0,
        }
    }
}

impl GcStats {
    /// Update statistics after a collection
    fn update(&mut self, report: &CollectionReport) {
        let pause_time = report.pause;
        self.collections += 1;
        self.objects_freed += report.deallocated.len();
        self.bytes_freed += report.freed_bytes;
        self.total_pause_time += pause_time;
        self.last_pause_time = pause_time;

        self.avg_pause_time = self.total_pause_time / self.collections as u32;

        if pause_time > self.max_pause_time {
            self.max_pause_time = pause_time;
        }
        if self.collections == 1 || pause_time < self.min_pause_time {
            self.min_pause_time = pause_time;
        }

        self.last_marked_count = report.marked;
        self.last_freed_count = report.deallocated.len();
        self.last_freed_bytes = report.freed_bytes;
        self.live_objects = report.live_objects;
        self.live_bytes = report.live_bytes;
    }

    /// Fraction of the objects seen by the last collection that survived it
    pub fn survival_rate(&self) -> f64 {
        let seen = self.live_objects + self.last_freed_count;
        if seen == 0 {
            return 0.0;
        }
        self.live_objects as f64 / seen as f64
    }
}

/// Diagnostic switches; none of them changes what gets collected
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GcOptions {
    /// Record every allocation address in the [`AllocationLog`]
    pub log_allocation: bool,
    /// Record every deallocation in the [`AllocationLog`]
    pub log_deallocation: bool,
    /// Emit a tracing event per allocation
    pub print_allocation: bool,
    /// Emit a tracing event per deallocation
    pub print_deallocation: bool,
}

impl From<&RuntimeConfig> for GcOptions {
    fn from(config: &RuntimeConfig) -> Self {
        Self {
            log_allocation: config.log_allocation,
            log_deallocation: config.log_deallocation,
            print_allocation: config.print_allocation,
            print_deallocation: config.print_deallocation,
        }
    }
}

/// An object swept by a collection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deallocation {
    /// 1-based collection number
    pub collection: usize,
    pub address: u64,
}

/// In-memory allocation and deallocation records
#[derive(Debug, Default)]
pub struct AllocationLog {
    allocations: Vec<u64>,
    deallocations: Vec<Deallocation>,
}

impl AllocationLog {
    pub fn allocations(&self) -> &[u64] {
        &self.allocations
    }

    pub fn deallocations(&self) -> &[Deallocation] {
        &self.deallocations
    }

    /// Addresses freed by collection number `collection`
    pub fn deallocated_in(&self, collection: usize) -> Vec<u64> {
        self.deallocations
            .iter()
            .filter(|d| d.collection == collection)
            .map(|d| d.address)
            .collect()
    }

    pub fn clear(&mut self) {
        self.allocations.clear();
        self.deallocations.clear();
    }
}

/// Outcome of one collection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionReport {
    /// 1-based collection number
    pub collection: usize,
    /// Non-null reference slots found on the stack
    pub roots: usize,
    /// Objects marked reachable
    pub marked: usize,
    /// Data addresses of swept objects, in heap order
    pub deallocated: Vec<u64>,
    pub freed_bytes: usize,
    pub live_objects: usize,
    pub live_bytes: usize,
    pub pause: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GcError {
    #[error("reference {0:#x} does not point at a live heap object")]
    InvalidReference(u64),
    #[error("heap is corrupt at {0:#x}")]
    CorruptHeap(u64),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AllocationError {
    #[error("heap exhausted: requested {requested} bytes, {available} available")]
    HeapExhausted { requested: usize, available: usize },
    #[error("invalid array length {0}")]
    InvalidLength(i64),
    #[error("type #{0} is not a defined class")]
    NotAClass(u32),
    #[error("type #{0} is not an array type")]
    NotAnArray(u32),
    #[error("object at {0:#x} could not be initialized")]
    Uninitialized(u64),
}

/// Single-generation mark-sweep collector
pub struct GarbageCollector {
    heap: ManagedHeap,
    stats: GcStats,
    log: AllocationLog,
    options: GcOptions,
}

impl GarbageCollector {
    /// Create a collector over a fresh heap of `heap_size` bytes
    pub fn new(heap_size: usize, options: GcOptions) -> Result<Self, MemoryError> {
        Ok(Self {
            heap: ManagedHeap::new(heap_size)?,
            stats: GcStats::default(),
            log: AllocationLog::default(),
            options,
        })
    }

    pub fn heap(&self) -> &ManagedHeap {
        &self.heap
    }

    pub(crate) fn heap_mut(&mut self) -> &mut ManagedHeap {
        &mut self.heap
    }

    pub fn stats(&self) -> &GcStats {
        &self.stats
    }

    pub fn log(&self) -> &AllocationLog {
        &self.log
    }

    pub fn options(&self) -> GcOptions {
        self.options
    }

    /// Allocate a zeroed instance of `class`
    pub fn new_class(&mut self, types: &TypeProvider, class: TypeId) -> Result<u64, AllocationError> {
        let metadata = types
            .class_metadata(class)
            .ok_or(AllocationError::NotAClass(class.as_u32()))?;
        let data_size = class_data_size(metadata.size() as usize);
        self.allocate(types, class, data_size)
    }

    /// Allocate a zeroed array of `length` elements
    pub fn new_array(
        &mut self,
        types: &TypeProvider,
        array: TypeId,
        length: i64,
    ) -> Result<u64, AllocationError> {
        let element = types
            .element_type(array)
            .ok_or(AllocationError::NotAnArray(array.as_u32()))?;
        let count = usize::try_from(length)
            .ok()
            .filter(|&count| i32::try_from(count).is_ok())
            .ok_or(AllocationError::InvalidLength(length))?;
        let data_size = array_data_size(types.size_of(element), count).ok_or(
            AllocationError::HeapExhausted {
                requested: usize::MAX,
                available: self.heap.available(),
            },
        )?;
        let data = self.allocate(types, array, data_size)?;
        self.heap
            .region_mut()
            .write_u32(data, count as u32)
            .ok_or(AllocationError::Uninitialized(data))?;
        Ok(data)
    }

    fn allocate(
        &mut self,
        types: &TypeProvider,
        type_id: TypeId,
        data_size: usize,
    ) -> Result<u64, AllocationError> {
        let data = self
            .heap
            .allocate(data_size)
            .ok_or(AllocationError::HeapExhausted {
                requested: data_size,
                available: self.heap.available(),
            })?;
        self.heap
            .set_header(
                data,
                ObjectHeader {
                    type_id: type_id.as_u32(),
                    gc_info: GcInfo::default(),
                },
            )
            .ok_or(AllocationError::Uninitialized(data))?;
        self.stats.objects_allocated += 1;

        if self.options.log_allocation {
            self.log.allocations.push(data);
        }
        if self.options.print_allocation {
            tracing::info!(target: "kestrel::gc", "allocated {} at {:#x} ({} data bytes)", types.name(type_id), data, data_size);
        }
        Ok(data)
    }

    /// Run a full collection from `roots`
    pub fn collect(&mut self, types: &TypeProvider, roots: &RootSet) -> Result<CollectionReport, GcError> {
        let start = Instant::now();
        let collection = self.stats.collections + 1;

        // Mark phase
        let marked = self.mark(types, roots)?;

        // Sweep phase
        let mut report = self.sweep(types, collection)?;
        report.roots = roots.len();
        report.marked = marked;
        report.pause = start.elapsed();

        self.stats.update(&report);
        tracing::debug!(
            collection,
            roots = report.roots,
            marked,
            freed = report.deallocated.len(),
            freed_bytes = report.freed_bytes,
            live_objects = report.live_objects,
            pause_us = report.pause.as_micros() as u64,
            "collection finished"
        );
        Ok(report)
    }

    /// Mark everything reachable from the roots; returns the number of objects marked
    ///
    /// Iterative; an already-marked object is skipped, so shared and cyclic
    /// structures are visited once.
    fn mark(&mut self, types: &TypeProvider, roots: &RootSet) -> Result<usize, GcError> {
        let mut worklist: Vec<u64> = roots.iter().collect();
        let mut marked = 0;

        while let Some(address) = worklist.pop() {
            if !self.heap.contains(address) {
                return Err(GcError::InvalidReference(address));
            }
            let header = self
                .heap
                .header(address)
                .ok_or(GcError::InvalidReference(address))?;
            if header.is_tombstone() {
                return Err(GcError::InvalidReference(address));
            }
            if header.gc_info.is_marked() {
                continue;
            }
            self.heap
                .set_gc_info(address, header.gc_info.marked())
                .ok_or(GcError::InvalidReference(address))?;
            marked += 1;

            let type_id = TypeId::from_u32(header.type_id).ok_or(GcError::InvalidReference(address))?;
            self.push_children(types, type_id, address, &mut worklist)?;
        }

        Ok(marked)
    }

    fn push_children(
        &self,
        types: &TypeProvider,
        type_id: TypeId,
        address: u64,
        worklist: &mut Vec<u64>,
    ) -> Result<(), GcError> {
        let region = self.heap.region();
        let mut trace = |slot: u64| -> Result<(), GcError> {
            let value = region.read_u64(slot).ok_or(GcError::CorruptHeap(slot))?;
            if value != 0 {
                worklist.push(value);
            }
            Ok(())
        };

        match types.try_get(type_id) {
            Some(BaseType::Class(class)) => {
                if let Some(metadata) = class.metadata() {
                    for field in metadata.reference_fields() {
                        trace(address + field.layout_offset() as u64)?;
                    }
                }
            }
            Some(BaseType::Array(array)) if types.is_reference(array.element()) => {
                let length = region.read_u32(address).ok_or(GcError::CorruptHeap(address))?;
                let elements = address + ARRAY_LENGTH_SIZE as u64;
                for index in 0..length as u64 {
                    trace(elements + index * REFERENCE_SIZE as u64)?;
                }
            }
            Some(_) => {}
            None => return Err(GcError::CorruptHeap(address)),
        }
        Ok(())
    }

    /// Unmark survivors, tombstone everything else
    fn sweep(&mut self, types: &TypeProvider, collection: usize) -> Result<CollectionReport, GcError> {
        let mut objects = Vec::new();
        self.heap.visit_objects(types, |object| objects.push(object))?;

        let mut report = CollectionReport {
            collection,
            roots: 0,
            marked: 0,
            deallocated: Vec::new(),
            freed_bytes: 0,
            live_objects: 0,
            live_bytes: 0,
            pause: Duration::ZERO,
        };

        for object in objects {
            if object.gc_info.is_marked() {
                self.heap
                    .set_gc_info(object.address, object.gc_info.unmarked().survived())
                    .ok_or(GcError::CorruptHeap(object.address))?;
                report.live_objects += 1;
                report.live_bytes += object.size;
                continue;
            }

            self.heap
                .tombstone(object.address, object.size)
                .ok_or(GcError::CorruptHeap(object.address))?;
            report.deallocated.push(object.address);
            report.freed_bytes += object.size;

            if self.options.log_deallocation {
                self.log.deallocations.push(Deallocation {
                    collection,
                    address: object.address,
                });
            }
            if self.options.print_deallocation {
                tracing::info!(target: "kestrel::gc", "deallocated {} at {:#x}", types.name(object.type_id), object.address);
            }
        }

        Ok(report)
    }
}
