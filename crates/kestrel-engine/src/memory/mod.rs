//! Paged memory
//!
//! OS pages committed through `mmap`, the protection transitions JIT code
//! needs, and the memory manager that bump-allocates code and read-only
//! constants for a load unit.
//!
//! Addresses handed out here are plain 64-bit values. Every access goes back
//! through the owning [`Region`], which bounds-checks it against the mapping.

mod manager;
mod page;
mod region;
mod sys;

pub use manager::MemoryManager;
pub use page::{Page, Protection};
pub use region::Region;
pub use sys::page_size;

/// Memory manager failures
#[derive(Debug, thiserror::Error)]
pub enum MemoryError {
    #[error("failed to commit {size} bytes: {source}")]
    CommitFailed {
        size: usize,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to change page protection to {protection:?}: {source}")]
    ProtectFailed {
        protection: Protection,
        #[source]
        source: std::io::Error,
    },
    #[error("code pages are sealed; no further code can be allocated or patched")]
    Sealed,
    #[error("code pages have not been made executable yet")]
    NotExecutable,
    #[error("address {0:#x} is not mapped by this manager")]
    Unmapped(u64),
    #[error("page at {0:#x} is not writable")]
    WriteDenied(u64),
}
