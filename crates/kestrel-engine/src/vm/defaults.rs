//! Default constants for VM configuration.

/// Default size of the managed heap in bytes (16 MB).
pub const DEFAULT_HEAP_SIZE: usize = 16 * 1024 * 1024;

/// Default size of the native stack compiled frames run on (1 MB).
pub const DEFAULT_STACK_SIZE: usize = 1024 * 1024;

/// Default number of call-stack entries; deeper call chains trap with a stack overflow.
pub const DEFAULT_CALL_STACK_CAPACITY: usize = 4096;

/// Minimum size of each code page the JIT allocates from (64 KB).
pub const DEFAULT_CODE_PAGE_SIZE: usize = 64 * 1024;
