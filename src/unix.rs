//! Anonymous memory mappings from the OS.

use core::ptr::{null_mut, NonNull};

use errno::Errno;

use crate::allocators::BackingStore;
use crate::error::MapError;

// Round up value to the nearest multiple of increment
pub(crate) fn round_up(value: usize, increment: usize) -> Option<usize> {
    if value == 0 {
        return Some(0);
    }
    increment.checked_mul((value - 1) / increment + 1)
}

unsafe fn mmap_anon(len: usize) -> Result<NonNull<u8>, MapError> {
    let ptr = libc::mmap(
        // Address we want the memory at. We don't care, so null it is.
        null_mut(),
        len,
        libc::PROT_READ | libc::PROT_WRITE,
        // MAP_ANON: no file behind it. MAP_PRIVATE: not shared with any other
        // process.
        libc::MAP_ANON | libc::MAP_PRIVATE,
        -1,
        0,
    );

    if ptr == libc::MAP_FAILED {
        return Err(MapError::Os(errno::errno()));
    }

    NonNull::new(ptr as *mut u8).ok_or(MapError::Os(Errno(libc::ENOMEM)))
}

unsafe fn munmap(ptr: *mut u8, len: usize) {
    if len > 0 {
        libc::munmap(ptr as *mut libc::c_void, len);
    }
}

/// `MmapStore` maps private anonymous memory straight from the kernel.
///
/// The kernel picks addresses with page alignment only. Stronger alignments are
/// first attempted natively (the kernel often hands back well aligned regions
/// for large requests); if that misses, the mapping is retried with `align`
/// extra bytes and the misaligned head and tail are unmapped again.
pub struct MmapStore {
    page_size: usize,
}

impl MmapStore {
    pub fn new() -> Self {
        MmapStore {
            page_size: sysconf::page::pagesize(),
        }
    }
}

impl Default for MmapStore {
    fn default() -> Self {
        Self::new()
    }
}

impl BackingStore for MmapStore {
    unsafe fn map(&self, size: usize, align: usize) -> Result<NonNull<u8>, MapError> {
        debug_assert!(align.is_power_of_two());
        let len = round_up(size, self.page_size).ok_or(MapError::Os(Errno(libc::ENOMEM)))?;
        if len == 0 {
            return Err(MapError::Os(Errno(libc::EINVAL)));
        }

        let ptr = mmap_anon(len)?;
        if align <= self.page_size || (ptr.as_ptr() as usize) % align == 0 {
            return Ok(ptr);
        }
        munmap(ptr.as_ptr(), len);

        let padded = len
            .checked_add(align)
            .ok_or(MapError::Os(Errno(libc::ENOMEM)))?;
        let base = mmap_anon(padded)?.as_ptr();
        let head = (align - (base as usize) % align) % align;
        let tail = padded - head - len;
        munmap(base, head);
        munmap(base.add(head + len), tail);

        Ok(NonNull::new_unchecked(base.add(head)))
    }

    unsafe fn unmap(&self, ptr: NonNull<u8>, size: usize) {
        // Mappings were made with the same rounding, so this covers all of it.
        let len = round_up(size, self.page_size).unwrap_or(size);
        munmap(ptr.as_ptr(), len);
    }

    fn page_size(&self) -> usize {
        self.page_size
    }
}
