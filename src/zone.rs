//! Zones: size-aligned slabs of equal chunks for one size class.
//!
//! A zone is a `ZONE_SIZE` mapping aligned to `ZONE_SIZE`, so the zone owning any
//! chunk is found by masking the chunk's address. The zone keeps all of its
//! bookkeeping in its own leading pages:
//!
//! ```text
//! +-------------+-----------------+----------------+---------+---------+---
//! | ZoneHeader  | u16 slot links  | allocation map | (pad to | chunk 0 | chunk 1 ...
//! |             | one per chunk   | one bit/chunk  |  page)  |         |
//! +-------------+-----------------+----------------+---------+---------+---
//! ```
//!
//! Chunks themselves carry no header and no free-list pointer: a free chunk is
//! recorded by its index in the per-page free-slot lists, which are threaded
//! through the link array. Chunks are handed out from the lowest page that has
//! a free slot, then from the bump cursor that walks never-touched memory.
//!
//! All mutating operations require the caller to hold the lock of the zone's
//! size class.

use core::mem::size_of;
use core::ptr::{null_mut, NonNull};
use core::sync::atomic::{AtomicPtr, Ordering};

use static_assertions::const_assert;

use crate::error::fatal;
use crate::size_class::{class_size, MIN_CHUNK, ZONE_LIMIT, ZONE_PAGE};

/// Size and alignment of every zone.
pub const ZONE_SIZE: usize = 64 * 1024;
const ZONE_MASK: usize = ZONE_SIZE - 1;
const ZONE_PAGES: usize = ZONE_SIZE / ZONE_PAGE;

/// Number of free zones the zone cache can hold, whatever the retention.
pub const ZONE_CACHE_SLOTS: usize = 32;

const ZONE_MAGIC: u32 = 0x7a6f_6e65;
// Written over the magic of a zone that is cached or being unmapped, so late
// frees into it are caught.
const DEAD_MAGIC: u32 = 0x6465_6164;
const NO_CHUNK: u16 = u16::MAX;

const_assert!(ZONE_SIZE.is_power_of_two());
const_assert!(ZONE_SIZE % ZONE_PAGE == 0);
// Chunk indices and the "no chunk" marker must fit the u16 links.
const_assert!(ZONE_SIZE / MIN_CHUNK < NO_CHUNK as usize);
// Even the largest class gets several chunks out of a zone.
const_assert!(ZONE_LIMIT * 2 < ZONE_SIZE);

#[repr(C)]
struct ZoneHeader {
    magic: u32,
    class: u32,
    heap_id: usize,
    chunk_size: usize,
    chunk_offset: usize,
    max_chunks: u32,
    free_chunks: u32,
    // Chunks at or beyond this index have never been handed out.
    bump: u32,
    // No page below this one has a free slot.
    first_page: u32,
    next: *mut ZoneHeader,
    prev: *mut ZoneHeader,
    page_heads: [u16; ZONE_PAGES],
}

const_assert!(size_of::<ZoneHeader>() % 8 == 0);

fn align8(n: usize) -> usize {
    (n + 7) & !7
}

fn bitmap_words(chunks: usize) -> usize {
    (chunks + 63) / 64
}

/// How chunks of one size class are laid out in a zone.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Geometry {
    pub chunk_size: usize,
    pub chunking: usize,
    /// Offset of chunk 0 from the zone base; always a multiple of `ZONE_PAGE`.
    pub chunk_offset: usize,
    pub max_chunks: usize,
}

impl Geometry {
    fn links_offset() -> usize {
        size_of::<ZoneHeader>()
    }

    fn bitmap_offset(chunks: usize) -> usize {
        Self::links_offset() + align8(chunks * size_of::<u16>())
    }

    fn metadata_end(chunks: usize) -> usize {
        Self::bitmap_offset(chunks) + bitmap_words(chunks) * size_of::<u64>()
    }

    /// Compute the layout for size class `index`.
    ///
    /// The metadata grows with the chunk count and the chunk area must start on a
    /// page: take the first page boundary whose leftover chunks' metadata fits
    /// in front of it.
    pub fn for_class(index: usize) -> Geometry {
        let (chunk_size, chunking) = class_size(index);
        let mut offset = ZONE_PAGE;
        loop {
            let chunks = (ZONE_SIZE - offset) / chunk_size;
            if Self::metadata_end(chunks) <= offset {
                return Geometry {
                    chunk_size,
                    chunking,
                    chunk_offset: offset,
                    max_chunks: chunks,
                };
            }
            offset += ZONE_PAGE;
        }
    }
}

/// What freeing a chunk did to its zone.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Freed {
    /// The zone had no free chunk before, and must go back on its class list.
    pub was_full: bool,
    /// Every chunk of the zone is now free.
    pub now_empty: bool,
}

/// A handle to a zone header. Copying the handle does not copy the zone.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Zone(NonNull<ZoneHeader>);

impl Zone {
    /// Write a fresh header over the zone at `base`.
    ///
    /// # Safety
    ///
    /// `base` must be `ZONE_SIZE` bytes of writable memory aligned to
    /// `ZONE_SIZE`, owned by the caller and not reachable by any live pointer.
    pub unsafe fn init(base: NonNull<u8>, heap_id: usize, class: usize, geo: &Geometry) -> Zone {
        debug_assert_eq!(base.as_ptr() as usize & ZONE_MASK, 0);
        let header = base.cast::<ZoneHeader>();
        header.as_ptr().write(ZoneHeader {
            magic: ZONE_MAGIC,
            class: class as u32,
            heap_id,
            chunk_size: geo.chunk_size,
            chunk_offset: geo.chunk_offset,
            max_chunks: geo.max_chunks as u32,
            free_chunks: geo.max_chunks as u32,
            bump: 0,
            first_page: ZONE_PAGES as u32,
            next: null_mut(),
            prev: null_mut(),
            page_heads: [NO_CHUNK; ZONE_PAGES],
        });
        let zone = Zone(header);
        // Recycled zones carry the previous owner's map.
        zone.bitmap(geo.max_chunks)
            .write_bytes(0, bitmap_words(geo.max_chunks));
        zone
    }

    /// The zone that would own `ptr`, found by masking. Nothing is read.
    pub fn containing(ptr: *const u8) -> Option<Zone> {
        NonNull::new((ptr as usize & !ZONE_MASK) as *mut ZoneHeader).map(Zone)
    }

    pub fn base(self) -> NonNull<u8> {
        self.0.cast()
    }

    fn header(self) -> *mut ZoneHeader {
        self.0.as_ptr()
    }

    fn links(self) -> *mut u16 {
        unsafe { (self.header() as *mut u8).add(Geometry::links_offset()) as *mut u16 }
    }

    fn bitmap(self, max_chunks: usize) -> *mut u64 {
        unsafe { (self.header() as *mut u8).add(Geometry::bitmap_offset(max_chunks)) as *mut u64 }
    }

    /// Abort unless this is a live zone of heap `heap_id`.
    ///
    /// # Safety
    ///
    /// The zone's first page must be mapped.
    pub unsafe fn verify(self, heap_id: usize, ptr: *const u8) {
        let h = &*self.header();
        if h.magic != ZONE_MAGIC {
            fatal("free of a pointer outside any live zone", ptr as usize);
        }
        if h.heap_id != heap_id {
            fatal("pointer belongs to another heap", ptr as usize);
        }
    }

    /// Mark the zone dead before it is cached or unmapped.
    pub unsafe fn retire(self) {
        (*self.header()).magic = DEAD_MAGIC;
    }

    pub unsafe fn class(self) -> usize {
        (*self.header()).class as usize
    }

    pub unsafe fn chunk_size(self) -> usize {
        (*self.header()).chunk_size
    }

    pub unsafe fn free_chunks(self) -> usize {
        (*self.header()).free_chunks as usize
    }

    fn chunk_ptr(self, h: &ZoneHeader, idx: usize) -> NonNull<u8> {
        unsafe {
            NonNull::new_unchecked(
                (self.header() as *mut u8).add(h.chunk_offset + idx * h.chunk_size),
            )
        }
    }

    #[cfg(feature = "integrity")]
    unsafe fn mark(bitmap: *mut u64, idx: usize, allocated: bool, addr: usize) {
        let word = bitmap.add(idx / 64);
        let bit = 1u64 << (idx % 64);
        let was_allocated = *word & bit != 0;
        if was_allocated == allocated {
            if allocated {
                fatal("chunk handed out twice", addr);
            }
            fatal("double free", addr);
        }
        *word ^= bit;
    }

    #[cfg(not(feature = "integrity"))]
    unsafe fn mark(_bitmap: *mut u64, _idx: usize, _allocated: bool, _addr: usize) {}

    /// Take one chunk, preferring recycled chunks on the lowest page.
    pub unsafe fn alloc_chunk(self) -> Option<NonNull<u8>> {
        let h = &mut *self.header();
        if h.free_chunks == 0 {
            return None;
        }

        let links = self.links();
        let mut page = h.first_page as usize;
        let mut found = None;
        while page < ZONE_PAGES {
            let head = h.page_heads[page];
            if head != NO_CHUNK {
                h.page_heads[page] = *links.add(head as usize);
                found = Some(head as usize);
                break;
            }
            page += 1;
        }
        h.first_page = page as u32;

        let idx = match found {
            Some(idx) => idx,
            None => {
                if h.bump >= h.max_chunks {
                    fatal("zone free count disagrees with its free lists", self.header() as usize);
                }
                h.bump += 1;
                (h.bump - 1) as usize
            }
        };

        h.free_chunks -= 1;
        let ptr = self.chunk_ptr(h, idx);
        Self::mark(
            self.bitmap(h.max_chunks as usize),
            idx,
            true,
            ptr.as_ptr() as usize,
        );
        Some(ptr)
    }

    /// Return `ptr` to this zone.
    pub unsafe fn free_chunk(self, ptr: *mut u8) -> Freed {
        let h = &mut *self.header();
        let start = self.header() as usize + h.chunk_offset;
        let off = (ptr as usize).wrapping_sub(start);
        if (ptr as usize) < start || off % h.chunk_size != 0 || off / h.chunk_size >= h.bump as usize
        {
            fatal("pointer is not a chunk of its zone", ptr as usize);
        }
        let idx = off / h.chunk_size;
        Self::mark(self.bitmap(h.max_chunks as usize), idx, false, ptr as usize);

        let page = (h.chunk_offset + off) / ZONE_PAGE;
        *self.links().add(idx) = h.page_heads[page];
        h.page_heads[page] = idx as u16;
        if (page as u32) < h.first_page {
            h.first_page = page as u32;
        }

        let was_full = h.free_chunks == 0;
        h.free_chunks += 1;
        if h.free_chunks > h.max_chunks {
            fatal("zone free count overflow", ptr as usize);
        }
        Freed {
            was_full,
            now_empty: h.free_chunks == h.max_chunks,
        }
    }

    /// Whether the header and free-slot lists agree with each other.
    pub unsafe fn is_consistent(self, heap_id: usize) -> bool {
        let h = &*self.header();
        if h.magic != ZONE_MAGIC || h.heap_id != heap_id {
            return false;
        }
        if h.free_chunks > h.max_chunks || h.bump > h.max_chunks {
            return false;
        }

        let links = self.links();
        let mut listed = 0usize;
        for (page, &head) in h.page_heads.iter().enumerate() {
            if head != NO_CHUNK && (page as u32) < h.first_page {
                return false;
            }
            let mut idx = head;
            while idx != NO_CHUNK {
                let chunk_page = (h.chunk_offset + idx as usize * h.chunk_size) / ZONE_PAGE;
                if idx as u32 >= h.bump || chunk_page != page {
                    return false;
                }
                listed += 1;
                if listed > h.max_chunks as usize {
                    // A cycle.
                    return false;
                }
                idx = *links.add(idx as usize);
            }
        }
        listed + (h.max_chunks - h.bump) as usize == h.free_chunks as usize
    }
}

/// An intrusive, doubly linked list of the zones of one class that have at
/// least one free chunk.
pub struct ZoneList {
    head: *mut ZoneHeader,
    len: usize,
}

// The list is only reached through its class lock.
unsafe impl Send for ZoneList {}

impl ZoneList {
    pub const fn new() -> Self {
        ZoneList {
            head: null_mut(),
            len: 0,
        }
    }

    pub fn first(&self) -> Option<Zone> {
        NonNull::new(self.head).map(Zone)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub unsafe fn push(&mut self, zone: Zone) {
        let h = zone.header();
        (*h).prev = null_mut();
        (*h).next = self.head;
        if !self.head.is_null() {
            (*self.head).prev = h;
        }
        self.head = h;
        self.len += 1;
    }

    pub unsafe fn remove(&mut self, zone: Zone) {
        let h = zone.header();
        let (prev, next) = ((*h).prev, (*h).next);
        if prev.is_null() {
            self.head = next;
        } else {
            (*prev).next = next;
        }
        if !next.is_null() {
            (*next).prev = prev;
        }
        (*h).prev = null_mut();
        (*h).next = null_mut();
        self.len -= 1;
    }

    pub fn iter(&self) -> impl Iterator<Item = Zone> + '_ {
        let mut cur = self.head;
        core::iter::from_fn(move || {
            let zone = NonNull::new(cur).map(Zone)?;
            cur = unsafe { (*cur).next };
            Some(zone)
        })
    }
}

/// Whole free zones kept for reuse by any size class.
///
/// Slots are claimed and emptied with compare-exchange only, so releasing or
/// reusing a zone never takes a lock.
pub struct ZoneCache {
    slots: [AtomicPtr<u8>; ZONE_CACHE_SLOTS],
}

impl ZoneCache {
    pub fn new() -> Self {
        ZoneCache {
            slots: core::array::from_fn(|_| AtomicPtr::new(null_mut())),
        }
    }

    /// Cache `base` in one of the first `limit` slots. Fails when they are all
    /// taken.
    pub fn put(&self, base: NonNull<u8>, limit: usize) -> bool {
        for slot in self.slots.iter().take(limit) {
            if slot
                .compare_exchange(null_mut(), base.as_ptr(), Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return true;
            }
        }
        false
    }

    pub fn take(&self) -> Option<NonNull<u8>> {
        for slot in self.slots.iter() {
            let mut cur = slot.load(Ordering::Acquire);
            while !cur.is_null() {
                match slot.compare_exchange_weak(cur, null_mut(), Ordering::AcqRel, Ordering::Acquire)
                {
                    Ok(_) => return NonNull::new(cur),
                    Err(actual) => cur = actual,
                }
            }
        }
        None
    }

    pub fn len(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| !s.load(Ordering::Relaxed).is_null())
            .count()
    }
}
