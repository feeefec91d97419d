//! Thin wrappers over the POSIX mapping calls

use super::Protection;
use once_cell::sync::Lazy;
use std::io;
use std::ptr::NonNull;

static PAGE_SIZE: Lazy<usize> = Lazy::new(|| {
    // SAFETY: sysconf has no preconditions
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 {
        size as usize
    } else {
        4096
    }
});

/// Platform page granularity
pub fn page_size() -> usize {
    *PAGE_SIZE
}

/// Round `size` up to whole pages, at least one
pub(crate) fn round_to_pages(size: usize) -> usize {
    let page = page_size();
    size.max(1).div_ceil(page) * page
}

fn native_protection(protection: Protection) -> libc::c_int {
    match protection {
        Protection::ReadWrite => libc::PROT_READ | libc::PROT_WRITE,
        Protection::ReadOnly => libc::PROT_READ,
        Protection::ReadExecute => libc::PROT_READ | libc::PROT_EXEC,
    }
}

/// Map `len` bytes of zeroed, private, read-write memory
pub(crate) fn map(len: usize) -> io::Result<NonNull<u8>> {
    // SAFETY: anonymous private mapping at a kernel-chosen address
    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_ANON | libc::MAP_PRIVATE,
            -1,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        return Err(io::Error::last_os_error());
    }
    NonNull::new(ptr as *mut u8).ok_or_else(|| io::Error::from(io::ErrorKind::OutOfMemory))
}

/// Change the protection of a mapping created by [`map`]
pub(crate) fn protect(ptr: NonNull<u8>, len: usize, protection: Protection) -> io::Result<()> {
    // SAFETY: ptr/len describe a live mapping owned by the caller
    let rc = unsafe { libc::mprotect(ptr.as_ptr() as *mut libc::c_void, len, native_protection(protection)) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Release a mapping created by [`map`]
pub(crate) fn unmap(ptr: NonNull<u8>, len: usize) -> io::Result<()> {
    // SAFETY: ptr/len describe a live mapping that is not used afterwards
    let rc = unsafe { libc::munmap(ptr.as_ptr() as *mut libc::c_void, len) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
