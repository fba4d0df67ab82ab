//! The heap: all shared state of one allocator instance.
//!
//! A `Heap` owns, per size class, the list of zones with free chunks and the
//! magazine depot; plus the cache of free zones, the table of large
//! allocations, and a few counters. Every operation comes in two flavours:
//! through a thread's magazines (see `LocalCache` and the process allocator),
//! or straight to the zones under the class lock.
//!
//! Locks are only held for list surgery. The backing store is never called
//! with a lock held.

use core::cell::Cell;
use core::mem::size_of;
use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicUsize, Ordering};

use spin::Mutex;

use crate::allocators::BackingStore;
use crate::error::{fatal, AllocError};
use crate::large::{LargeRecord, LargeTable};
use crate::magazine::{
    rounds_for, Depot, Magazine, MagazinePair, MagazinePtr, ThreadMagazines, MAX_ROUNDS,
};
use crate::options::Options;
use crate::size_class::{class_size, is_large, zone_index, MIN_CHUNK, NZONES};
use crate::unix::round_up;
use crate::zone::{Geometry, Zone, ZoneCache, ZoneList, ZONE_CACHE_SLOTS, ZONE_SIZE};

static NEXT_HEAP_ID: AtomicUsize = AtomicUsize::new(1);

#[repr(align(64))]
struct Sentinel(u8);

static ZERO_LENGTH: Sentinel = Sentinel(0);

/// The pointer handed out for zero-byte requests.
///
/// It is never null, never a real allocation, and freeing it does nothing.
pub fn zero_length_ptr() -> NonNull<u8> {
    NonNull::from(&ZERO_LENGTH.0)
}

fn is_sentinel(ptr: *const u8) -> bool {
    ptr == &ZERO_LENGTH.0 as *const u8
}

thread_local! {
    static IN_LOG: Cell<bool> = const { Cell::new(false) };
}

// Run `f` unless this thread is already logging: the logger may allocate, and
// those allocations must not log again.
pub(crate) fn log_once(f: impl FnOnce()) {
    let entered = IN_LOG.try_with(|l| !l.replace(true)).unwrap_or(false);
    if entered {
        f();
        let _ = IN_LOG.try_with(|l| l.set(false));
    }
}

macro_rules! heap_trace {
    ($heap:expr, $($arg:tt)+) => {
        if $heap.options.trace {
            $crate::heap::log_once(|| log::trace!($($arg)+));
        }
    };
}

macro_rules! heap_debug {
    ($heap:expr, $($arg:tt)+) => {
        if $heap.options.trace {
            $crate::heap::log_once(|| log::debug!($($arg)+));
        }
    };
}

/// Problems found by walking a heap's zones.
#[derive(Default, Debug)]
pub struct Validity {
    /// Zones whose header or free-slot lists are inconsistent.
    ///
    /// This indicates corruption.
    pub bad_zones: usize,
    /// Zones on a class list that belong to another class, or have no free
    /// chunk.
    pub misfiled_zones: usize,
}

impl Validity {
    /// Returns a boolean - a simple check if all cases are 0
    pub fn is_valid(&self) -> bool {
        self.bad_zones == 0 && self.misfiled_zones == 0
    }
}

impl From<Validity> for bool {
    fn from(v: Validity) -> bool {
        v.is_valid()
    }
}

#[derive(Default, Debug)]
pub struct Stats {
    /// Bytes currently mapped from the backing store.
    pub mapped: usize,
    /// Highest value `mapped` has reached.
    pub peak_mapped: usize,
    /// Zones holding at least one chunk that is allocated or cached.
    pub zones: usize,
    /// Free zones kept for reuse.
    pub cached_zones: usize,
    /// Zones with some free chunks, on their class lists.
    pub partial_zones: usize,
    /// Free chunks in those zones.
    pub free_chunks: usize,
    pub large_count: usize,
    pub large_bytes: usize,
    pub depot_full: usize,
    pub depot_empty: usize,
}

struct ClassState {
    zones: Mutex<ZoneList>,
    geometry: Geometry,
    // Capacity of this class's magazines.
    rounds: usize,
    depot: Depot,
}

/// One allocator instance: size-class zones, depots, zone cache and large
/// allocation table, all drawing memory from a single backing store.
///
/// Heaps are independent: a pointer must be freed to the heap that allocated
/// it, which is checked.
pub struct Heap<S: BackingStore> {
    id: usize,
    store: S,
    options: Options,
    classes: [ClassState; NZONES],
    magazine_class: usize,
    record_class: usize,
    zone_cache: ZoneCache,
    large: LargeTable,
    // Every zone this heap ever mapped lies in [zone_lo, zone_hi).
    zone_lo: AtomicUsize,
    zone_hi: AtomicUsize,
    mapped: AtomicUsize,
    peak_mapped: AtomicUsize,
    zones: AtomicUsize,
}

impl<S: BackingStore> Heap<S> {
    pub fn new(store: S, options: Options) -> Self {
        Heap {
            id: NEXT_HEAP_ID.fetch_add(1, Ordering::Relaxed),
            store,
            options,
            classes: core::array::from_fn(|index| {
                let geometry = Geometry::for_class(index);
                ClassState {
                    zones: Mutex::new(ZoneList::new()),
                    geometry,
                    rounds: rounds_for(geometry.chunk_size),
                    depot: Depot::new(),
                }
            }),
            magazine_class: zone_index(size_of::<Magazine>()).index,
            record_class: zone_index(size_of::<LargeRecord>()).index,
            zone_cache: ZoneCache::new(),
            large: LargeTable::new(),
            zone_lo: AtomicUsize::new(usize::MAX),
            zone_hi: AtomicUsize::new(0),
            mapped: AtomicUsize::new(0),
            peak_mapped: AtomicUsize::new(0),
            zones: AtomicUsize::new(0),
        }
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    fn use_cache<'a>(
        &self,
        cache: Option<&'a mut ThreadMagazines>,
    ) -> Option<&'a mut ThreadMagazines> {
        cache.filter(|_| self.options.thread_cache)
    }

    ////////////////////////////////////////////////////////////
    // Backing store and zone bookkeeping

    fn note_mapped(&self, len: usize) {
        let now = self.mapped.fetch_add(len, Ordering::Relaxed) + len;
        self.peak_mapped.fetch_max(now, Ordering::Relaxed);
    }

    fn note_unmapped(&self, len: usize) {
        self.mapped.fetch_sub(len, Ordering::Relaxed);
    }

    /// Get a zone for `class`: a cached one if there is one, else a new mapping.
    fn new_zone(&self, class: usize) -> Result<Zone, AllocError> {
        let base = match self.zone_cache.take() {
            Some(base) => base,
            None => {
                let base = unsafe { self.store.map(ZONE_SIZE, ZONE_SIZE)? };
                let addr = base.as_ptr() as usize;
                self.note_mapped(ZONE_SIZE);
                self.zone_lo.fetch_min(addr, Ordering::AcqRel);
                self.zone_hi.fetch_max(addr + ZONE_SIZE, Ordering::AcqRel);
                heap_debug!(self, "heap {}: mapped zone {:p}", self.id, base);
                base
            }
        };
        self.zones.fetch_add(1, Ordering::Relaxed);
        let geometry = &self.classes[class].geometry;
        Ok(unsafe { Zone::init(base, self.id, class, geometry) })
    }

    /// Retire an empty zone, caching it if the cache has room.
    fn release_zone(&self, zone: Zone) {
        unsafe { zone.retire() };
        self.zones.fetch_sub(1, Ordering::Relaxed);
        let limit = self.options.retained().min(ZONE_CACHE_SLOTS);
        if self.zone_cache.put(zone.base(), limit) {
            heap_trace!(self, "heap {}: cached zone {:p}", self.id, zone.base());
            return;
        }
        unsafe { self.store.unmap(zone.base(), ZONE_SIZE) };
        self.note_unmapped(ZONE_SIZE);
        heap_debug!(self, "heap {}: unmapped zone {:p}", self.id, zone.base());
    }

    /// The live zone of this heap that holds `ptr`, if `ptr` is in the range
    /// of zone addresses at all. Aborts if the zone is dead or foreign.
    unsafe fn owner(&self, ptr: *const u8) -> Option<Zone> {
        let addr = ptr as usize;
        if addr < self.zone_lo.load(Ordering::Acquire) || addr >= self.zone_hi.load(Ordering::Acquire)
        {
            return None;
        }
        let zone = Zone::containing(ptr)?;
        zone.verify(self.id, ptr);
        Some(zone)
    }

    unsafe fn owner_or_abort(&self, ptr: *const u8) -> Zone {
        match self.owner(ptr) {
            Some(zone) => zone,
            None => fatal("pointer was not allocated by this heap", ptr as usize),
        }
    }

    /// Fill `out` with up to `out.len()` chunks of `class`. Returns how many
    /// were taken; at least one unless the backing store failed.
    fn zone_alloc_batch(&self, class: usize, out: &mut [*mut u8]) -> Result<usize, AllocError> {
        let state = &self.classes[class];
        loop {
            let mut n = 0;
            {
                let mut zones = state.zones.lock();
                while n < out.len() {
                    let zone = match zones.first() {
                        Some(zone) => zone,
                        None => break,
                    };
                    match unsafe { zone.alloc_chunk() } {
                        Some(ptr) => {
                            out[n] = ptr.as_ptr();
                            n += 1;
                        }
                        None => fatal("full zone on the free list", zone.base().as_ptr() as usize),
                    }
                    if unsafe { zone.free_chunks() } == 0 {
                        unsafe { zones.remove(zone) };
                    }
                }
            }
            if n > 0 {
                return Ok(n);
            }

            let zone = self.new_zone(class)?;
            unsafe { state.zones.lock().push(zone) };
        }
    }

    fn zone_alloc(&self, class: usize) -> Result<NonNull<u8>, AllocError> {
        let mut slot = [ptr::null_mut()];
        self.zone_alloc_batch(class, &mut slot)?;
        NonNull::new(slot[0]).ok_or(AllocError::OutOfMemory)
    }

    /// Return chunks of `class` to their zones, releasing zones that become
    /// empty.
    fn zone_free_batch(&self, class: usize, ptrs: &[*mut u8]) {
        let state = &self.classes[class];
        for batch in ptrs.chunks(MAX_ROUNDS) {
            let mut empty = [None; MAX_ROUNDS];
            let mut nempty = 0;
            {
                let mut zones = state.zones.lock();
                for &ptr in batch {
                    let zone = match Zone::containing(ptr) {
                        Some(zone) => zone,
                        None => fatal("free of a null chunk", 0),
                    };
                    debug_assert_eq!(unsafe { zone.class() }, class);
                    let freed = unsafe { zone.free_chunk(ptr) };
                    if freed.now_empty {
                        if !freed.was_full {
                            unsafe { zones.remove(zone) };
                        }
                        empty[nempty] = Some(zone);
                        nempty += 1;
                    } else if freed.was_full {
                        unsafe { zones.push(zone) };
                    }
                }
            }
            for zone in empty[..nempty].iter().flatten() {
                self.release_zone(*zone);
            }
        }
    }

    ////////////////////////////////////////////////////////////
    // Magazines

    fn new_magazine(&self, class: usize) -> Option<MagazinePtr> {
        let mem = self.zone_alloc(self.magazine_class).ok()?;
        Some(unsafe { Magazine::init(mem, self.classes[class].rounds) })
    }

    fn free_magazine(&self, mag: MagazinePtr) {
        self.zone_free_batch(self.magazine_class, &[mag.as_ptr() as *mut u8]);
    }

    /// An empty magazine for `class`: the thread's spare, one from the depot,
    /// or a new one.
    fn empty_magazine(&self, class: usize, mags: &mut ThreadMagazines) -> Option<MagazinePtr> {
        if let Some(spare) = mags.take_spare() {
            return Some(unsafe { Magazine::init(spare.cast(), self.classes[class].rounds) });
        }
        if let Some(mag) = self.classes[class].depot.take_empty() {
            return Some(mag);
        }
        self.new_magazine(class)
    }

    /// Keep an empty magazine as the thread's spare, or free it.
    fn stash_magazine(&self, mag: MagazinePtr, mags: &mut ThreadMagazines) {
        if let Some(extra) = mags.set_spare(mag) {
            self.free_magazine(extra);
        }
    }

    /// Return every round of `mag` to the zones.
    fn drain_magazine(&self, class: usize, mag: MagazinePtr) {
        let rounds = unsafe { &mut *mag.as_ptr() }.drain();
        if !rounds.is_empty() {
            self.zone_free_batch(class, rounds);
        }
    }

    fn magazine_alloc(
        &self,
        class: usize,
        mags: &mut ThreadMagazines,
    ) -> Result<NonNull<u8>, AllocError> {
        let mut pair = *mags.pair(class);
        let res = self.magazine_alloc_pair(class, &mut pair, mags);
        *mags.pair(class) = pair;
        res
    }

    fn magazine_alloc_pair(
        &self,
        class: usize,
        pair: &mut MagazinePair,
        mags: &mut ThreadMagazines,
    ) -> Result<NonNull<u8>, AllocError> {
        if let Some(ptr) = unsafe { pair.alloc() } {
            return Ok(ptr);
        }

        // Both magazines are empty: trade the previous one for a full one.
        let state = &self.classes[class];
        if let Some((full, surplus)) = state.depot.trade_for_full(pair.previous, self.options.retained())
        {
            pair.previous = pair.loaded;
            pair.loaded = Some(full);
            if let Some(mag) = surplus {
                self.stash_magazine(mag, mags);
            }
            if let Some(ptr) = unsafe { pair.alloc() } {
                return Ok(ptr);
            }
        }

        // The depot had nothing either: fill the loaded magazine from the zones.
        if pair.loaded.is_none() {
            pair.loaded = pair.previous.take().or_else(|| self.empty_magazine(class, mags));
        }
        let mut mag = match pair.loaded {
            Some(mag) => mag,
            None => return self.zone_alloc(class),
        };
        let mag = unsafe { mag.as_mut() };
        let target = mag.fill_target();
        let slots = mag.spare_slots();
        let want = target.min(slots.len());
        let got = self.zone_alloc_batch(class, &mut slots[..want])?;
        mag.add_rounds(got);

        if !mags.has_spare() {
            if let Some(spare) = self.new_magazine(class) {
                mags.set_spare(spare);
            }
        }
        heap_trace!(self, "heap {}: class {} magazine refilled with {}", self.id, class, got);
        mag.pop().ok_or(AllocError::OutOfMemory)
    }

    fn magazine_free(&self, class: usize, ptr: NonNull<u8>, mags: &mut ThreadMagazines) {
        let mut pair = *mags.pair(class);
        self.magazine_free_pair(class, ptr, &mut pair, mags);
        *mags.pair(class) = pair;
    }

    fn magazine_free_pair(
        &self,
        class: usize,
        ptr: NonNull<u8>,
        pair: &mut MagazinePair,
        mags: &mut ThreadMagazines,
    ) {
        #[cfg(feature = "integrity")]
        {
            if unsafe { pair.holds_on_top(ptr) } {
                fatal("double free", ptr.as_ptr() as usize);
            }
        }
        if unsafe { pair.free(ptr) } {
            return;
        }

        // Both magazines are full: trade the previous one for an empty one.
        let fresh = match pair.previous {
            Some(prev) => {
                let trade = self.classes[class]
                    .depot
                    .trade_for_empty(prev, self.options.retained());
                match (trade.empty, trade.rejected) {
                    (empty, None) => empty,
                    (None, Some(full)) => {
                        self.drain_magazine(class, full);
                        Some(full)
                    }
                    (Some(empty), Some(full)) => {
                        self.drain_magazine(class, full);
                        self.stash_magazine(full, mags);
                        Some(empty)
                    }
                }
            }
            None => None,
        };
        pair.previous = pair.loaded;
        pair.loaded = fresh.or_else(|| self.empty_magazine(class, mags));

        let pushed = match pair.loaded {
            Some(mut mag) => unsafe { mag.as_mut().push(ptr) },
            None => false,
        };
        if !pushed {
            self.zone_free_batch(class, &[ptr.as_ptr()]);
        }
    }

    /// Return everything a thread has cached to the zones, and free its
    /// magazines.
    pub(crate) fn drain_thread(&self, mags: &mut ThreadMagazines) {
        for (class, mag) in mags.take_all() {
            if let Some(class) = class {
                self.drain_magazine(class, mag);
            }
            self.free_magazine(mag);
        }
        heap_trace!(self, "heap {}: drained thread cache", self.id);
    }

    ////////////////////////////////////////////////////////////
    // Large allocations

    /// Mapping length for a large request of `size` bytes.
    ///
    /// Lengths that are a multiple of two pages get one more page, so that
    /// consecutive large blocks do not all start on the same cache sets.
    fn large_len(&self, size: usize) -> Option<usize> {
        let page = self.store.page_size();
        let len = round_up(size, page)?;
        if len % (2 * page) == 0 {
            len.checked_add(page)
        } else {
            Some(len)
        }
    }

    fn large_alloc(&self, size: usize, align: usize) -> Result<NonNull<u8>, AllocError> {
        let len = self.large_len(size).ok_or(AllocError::OutOfMemory)?;
        let mem = self.zone_alloc(self.record_class)?;
        let base = match unsafe { self.store.map(len, align.max(self.store.page_size())) } {
            Ok(base) => base,
            Err(e) => {
                self.zone_free_batch(self.record_class, &[mem.as_ptr()]);
                heap_debug!(self, "heap {}: large map of {} failed: {}", self.id, len, e);
                return Err(e.into());
            }
        };
        self.note_mapped(len);
        unsafe {
            let rec = LargeRecord::write(mem, base.as_ptr() as usize, len);
            self.large.insert(rec);
        }
        heap_debug!(self, "heap {}: mapped large {:p} len {}", self.id, base, len);
        Ok(base)
    }

    fn large_release(&self, rec: NonNull<LargeRecord>) {
        let (base, len) = unsafe { (rec.as_ref().base, rec.as_ref().len) };
        unsafe { self.store.unmap(NonNull::new_unchecked(base as *mut u8), len) };
        self.note_unmapped(len);
        self.zone_free_batch(self.record_class, &[rec.as_ptr() as *mut u8]);
        heap_debug!(self, "heap {}: unmapped large {:#x} len {}", self.id, base, len);
    }

    ////////////////////////////////////////////////////////////
    // Operations

    fn alloc_inner(
        &self,
        size: usize,
        zeroed: bool,
        cache: Option<&mut ThreadMagazines>,
    ) -> Result<NonNull<u8>, AllocError> {
        if size == 0 {
            return Ok(zero_length_ptr());
        }
        if is_large(size) {
            // Fresh mappings are zero already.
            return self.large_alloc(size, 1);
        }

        let class = zone_index(size).index;
        let ptr = match self.use_cache(cache) {
            Some(mags) => self.magazine_alloc(class, mags)?,
            None => self.zone_alloc(class)?,
        };
        if zeroed || self.options.zero_all {
            unsafe { ptr.as_ptr().write_bytes(0, size) };
        }
        Ok(ptr)
    }

    pub(crate) fn allocate_with(
        &self,
        size: usize,
        cache: Option<&mut ThreadMagazines>,
    ) -> Result<NonNull<u8>, AllocError> {
        let res = self.alloc_inner(size, false, cache);
        heap_trace!(self, "heap {}: allocate({}) = {:?}", self.id, size, res);
        res
    }

    pub(crate) fn allocate_zeroed_with(
        &self,
        count: usize,
        size: usize,
        cache: Option<&mut ThreadMagazines>,
    ) -> Result<NonNull<u8>, AllocError> {
        let total = count.checked_mul(size).ok_or(AllocError::OutOfMemory)?;
        let res = self.alloc_inner(total, true, cache);
        heap_trace!(self, "heap {}: allocate_zeroed({}, {}) = {:?}", self.id, count, size, res);
        res
    }

    pub(crate) unsafe fn deallocate_with(&self, ptr: *mut u8, cache: Option<&mut ThreadMagazines>) {
        heap_trace!(self, "heap {}: deallocate({:p})", self.id, ptr);
        let nn = match NonNull::new(ptr) {
            Some(nn) if !is_sentinel(ptr) => nn,
            _ => return,
        };
        if let Some(rec) = self.large.remove(ptr as usize) {
            self.large_release(rec);
            return;
        }

        let zone = self.owner_or_abort(ptr);
        let class = zone.class();
        match self.use_cache(cache) {
            Some(mags) => self.magazine_free(class, nn, mags),
            None => self.zone_free_batch(class, &[ptr]),
        }
    }

    pub(crate) unsafe fn reallocate_with(
        &self,
        ptr: *mut u8,
        size: usize,
        mut cache: Option<&mut ThreadMagazines>,
    ) -> Result<NonNull<u8>, AllocError> {
        if ptr.is_null() || is_sentinel(ptr) {
            return self.allocate_with(size, cache);
        }
        if size == 0 {
            self.deallocate_with(ptr, cache);
            return Ok(zero_length_ptr());
        }

        let old_len = match self.large.lookup(ptr as usize) {
            Some(len) => {
                if is_large(size) && self.large_len(size) == Some(len) {
                    return Ok(NonNull::new_unchecked(ptr));
                }
                len
            }
            None => {
                let zone = self.owner_or_abort(ptr);
                let chunk = zone.chunk_size();
                if !is_large(size) && zone_index(size).index == zone.class() {
                    if self.options.zero_all && size < chunk {
                        ptr.add(size).write_bytes(0, chunk - size);
                    }
                    return Ok(NonNull::new_unchecked(ptr));
                }
                chunk
            }
        };

        let new = self.alloc_inner(size, false, cache.as_deref_mut())?;
        ptr::copy_nonoverlapping(ptr, new.as_ptr(), old_len.min(size));
        self.deallocate_with(ptr, cache);
        heap_trace!(self, "heap {}: reallocate({:p}, {}) = {:p}", self.id, ptr, size, new);
        Ok(new)
    }

    pub(crate) fn allocate_aligned_with(
        &self,
        align: usize,
        size: usize,
        cache: Option<&mut ThreadMagazines>,
    ) -> Result<NonNull<u8>, AllocError> {
        if !align.is_power_of_two() || align < size_of::<usize>() {
            return Err(AllocError::InvalidArgument);
        }
        let size = size.max(1);
        let page = self.store.page_size();
        let res = if align > page {
            self.large_alloc(size, align)
        } else {
            let rounded = round_up(size, align).ok_or(AllocError::OutOfMemory)?;
            self.alloc_inner(self.aligned_size(rounded, align), false, cache)
        };
        heap_trace!(self, "heap {}: allocate_aligned({}, {}) = {:?}", self.id, align, size, res);
        res
    }

    // A request size whose chunks are all aligned to `align` (at most a page).
    //
    // Chunks start on a page, so every chunk of a class whose size is a
    // multiple of `align` is aligned to `align`.
    fn aligned_size(&self, size: usize, align: usize) -> usize {
        if size.is_power_of_two() || is_large(size) || align <= MIN_CHUNK {
            return size;
        }
        let first = zone_index(size).index;
        for index in first..NZONES {
            let (class_bytes, _) = class_size(index);
            if class_bytes % align == 0 && class_bytes >= size {
                return class_bytes;
            }
        }
        size.checked_next_power_of_two().unwrap_or(size)
    }

    pub(crate) unsafe fn usable_size_of(&self, ptr: *const u8) -> usize {
        if ptr.is_null() || is_sentinel(ptr) {
            return 0;
        }
        if let Some(len) = self.large.lookup(ptr as usize) {
            return len;
        }
        self.owner_or_abort(ptr).chunk_size()
    }

    /// Allocate `size` bytes.
    ///
    /// A `size` of 0 returns [`zero_length_ptr`](fn.zero_length_ptr.html).
    pub fn allocate(&self, size: usize) -> Result<NonNull<u8>, AllocError> {
        self.allocate_with(size, None)
    }

    /// Allocate `count * size` zeroed bytes, failing if the product overflows.
    pub fn allocate_zeroed(&self, count: usize, size: usize) -> Result<NonNull<u8>, AllocError> {
        self.allocate_zeroed_with(count, size, None)
    }

    /// Resize an allocation, moving it if its size class changes.
    ///
    /// # Safety
    ///
    /// `ptr` must be null, the zero-length pointer, or a live allocation of
    /// this heap. On success `ptr` must no longer be used.
    pub unsafe fn reallocate(&self, ptr: *mut u8, size: usize) -> Result<NonNull<u8>, AllocError> {
        self.reallocate_with(ptr, size, None)
    }

    /// Free an allocation. Null and the zero-length pointer are ignored.
    ///
    /// # Safety
    ///
    /// `ptr` must be null, the zero-length pointer, or a live allocation of
    /// this heap.
    pub unsafe fn deallocate(&self, ptr: *mut u8) {
        self.deallocate_with(ptr, None)
    }

    /// Allocate `size` bytes aligned to `align`, which must be a power of two
    /// no smaller than a pointer.
    pub fn allocate_aligned(&self, align: usize, size: usize) -> Result<NonNull<u8>, AllocError> {
        self.allocate_aligned_with(align, size, None)
    }

    /// How many bytes the allocation at `ptr` can hold.
    ///
    /// # Safety
    ///
    /// As for `deallocate`.
    pub unsafe fn usable_size(&self, ptr: *const u8) -> usize {
        self.usable_size_of(ptr)
    }

    /// Get statistics on this heap, and verify the zones with free chunks.
    pub fn stats(&self) -> (Validity, Stats) {
        let mut validity = Validity::default();
        let mut stats = Stats {
            mapped: self.mapped.load(Ordering::Relaxed),
            peak_mapped: self.peak_mapped.load(Ordering::Relaxed),
            zones: self.zones.load(Ordering::Relaxed),
            cached_zones: self.zone_cache.len(),
            ..Stats::default()
        };

        for (index, state) in self.classes.iter().enumerate() {
            {
                let zones = state.zones.lock();
                stats.partial_zones += zones.len();
                for zone in zones.iter() {
                    unsafe {
                        if !zone.is_consistent(self.id) {
                            validity.bad_zones += 1;
                            continue;
                        }
                        if zone.class() != index || zone.free_chunks() == 0 {
                            validity.misfiled_zones += 1;
                        }
                        stats.free_chunks += zone.free_chunks();
                    }
                }
            }
            let (full, empty) = state.depot.counts();
            stats.depot_full += full;
            stats.depot_empty += empty;
        }

        let (count, bytes) = self.large.totals();
        stats.large_count = count;
        stats.large_bytes = bytes;
        (validity, stats)
    }

    /// Take every lock of the heap, ahead of `fork`.
    pub fn prefork(&self) {
        for state in self.classes.iter() {
            core::mem::forget(state.zones.lock());
            state.depot.lock_for_fork();
        }
        self.large.lock_for_fork();
    }

    /// Release the locks taken by `prefork`, in the parent.
    ///
    /// # Safety
    ///
    /// Must follow a `prefork` on this heap by the same thread.
    pub unsafe fn postfork_parent(&self) {
        self.unlock_all();
    }

    /// Release the locks taken by `prefork`, in the child. Only the forking
    /// thread exists in the child, so the heap is consistent again.
    ///
    /// # Safety
    ///
    /// Must follow a `prefork` on this heap by the thread that forked.
    pub unsafe fn postfork_child(&self) {
        self.unlock_all();
    }

    unsafe fn unlock_all(&self) {
        self.large.unlock_after_fork();
        for state in self.classes.iter() {
            state.depot.unlock_after_fork();
            state.zones.force_unlock();
        }
    }
}

impl<S: BackingStore> Drop for Heap<S> {
    fn drop(&mut self) {
        for (class, state) in self.classes.iter().enumerate() {
            while let Some(mag) = state.depot.take_full().or_else(|| state.depot.take_empty()) {
                self.drain_magazine(class, mag);
                self.free_magazine(mag);
            }
        }

        self.large.drain(|rec| {
            let (base, len) = unsafe { (rec.as_ref().base, rec.as_ref().len) };
            unsafe { self.store.unmap(NonNull::new_unchecked(base as *mut u8), len) };
            self.note_unmapped(len);
        });

        for state in self.classes.iter() {
            let mut zones = state.zones.lock();
            while let Some(zone) = zones.first() {
                unsafe {
                    zones.remove(zone);
                    zone.retire();
                    self.store.unmap(zone.base(), ZONE_SIZE);
                }
                self.note_unmapped(ZONE_SIZE);
                self.zones.fetch_sub(1, Ordering::Relaxed);
            }
        }
        while let Some(base) = self.zone_cache.take() {
            unsafe { self.store.unmap(base, ZONE_SIZE) };
            self.note_unmapped(ZONE_SIZE);
        }

        let leaked = self.zones.load(Ordering::Relaxed);
        if leaked > 0 {
            heap_debug!(self, "heap {}: leaking {} zones still in use", self.id, leaked);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::allocators::ToyStore;
    use crate::size_class::ZONE_LIMIT;
    use test_log::test;

    fn toy_heap(options: Options) -> Heap<ToyStore> {
        Heap::new(ToyStore::default(), options)
    }

    #[test]
    fn test_zero_length() {
        let heap = toy_heap(Options::DEFAULT);
        let a = heap.allocate(0).unwrap();
        let b = heap.allocate(0).unwrap();
        assert_eq!(a, b);
        assert_eq!(a, zero_length_ptr());
        unsafe {
            assert_eq!(heap.usable_size(a.as_ptr()), 0);
            heap.deallocate(a.as_ptr());
            heap.deallocate(ptr::null_mut());
        }
        assert_eq!(heap.allocate_zeroed(0, 10).unwrap(), zero_length_ptr());
        assert_eq!(heap.stats().1.mapped, 0);
    }

    #[test]
    fn test_large_len() {
        let heap = toy_heap(Options::DEFAULT);
        assert_eq!(heap.store().page_size(), 4096);
        // Three pages: odd, kept.
        assert_eq!(heap.large_len(12288), Some(12288));
        // Four pages: one more for colouring.
        assert_eq!(heap.large_len(16384), Some(20480));
        assert_eq!(heap.large_len(16385), Some(20480));
        assert_eq!(heap.large_len(usize::MAX), None);
    }

    #[test]
    fn test_aligned_size() {
        let heap = toy_heap(Options::DEFAULT);
        assert_eq!(heap.aligned_size(1024, 64), 1024);
        assert_eq!(heap.aligned_size(4608, 512), 4608);
        assert_eq!(heap.aligned_size(3072, 256), 3072);
        assert_eq!(heap.aligned_size(1536, 256), 1536);
        assert_eq!(heap.aligned_size(1536, 512), 1536);
        assert_eq!(heap.aligned_size(6144, 2048), 6144);
        assert_eq!(heap.aligned_size(48, 16), 48);
        assert_eq!(heap.aligned_size(80, 16), 80);
        // 1600 is in the band chunked by 128: the next class is 1664.
        assert_eq!(heap.aligned_size(1600, 64), 1664);
        assert_eq!(heap.aligned_size(24, 8), 24);
    }

    #[test]
    fn test_small_alignments_waste_nothing() {
        let heap = toy_heap(Options::DEFAULT);
        for &(align, size, usable) in &[(16usize, 48usize, 48usize), (16, 80, 80), (512, 1536, 1536)] {
            let mut ptrs = vec![];
            // Enough to reach chunks past the first page of a zone.
            for _ in 0..100 {
                let p = heap.allocate_aligned(align, size).unwrap();
                assert_eq!(p.as_ptr() as usize % align, 0, "align {} size {}", align, size);
                assert_eq!(unsafe { heap.usable_size(p.as_ptr()) }, usable);
                ptrs.push(p);
            }
            for p in ptrs {
                unsafe { heap.deallocate(p.as_ptr()) };
            }
        }
    }

    #[test]
    fn test_class_chunk_reuse_without_cache() {
        let heap = toy_heap(Options::DEFAULT.thread_cache(false));
        let a = heap.allocate(40).unwrap();
        let b = heap.allocate(40).unwrap();
        unsafe {
            assert_eq!(heap.usable_size(a.as_ptr()), 40);
            heap.deallocate(a.as_ptr());
            let c = heap.allocate(40).unwrap();
            assert_eq!(c, a);
            heap.deallocate(b.as_ptr());
            heap.deallocate(c.as_ptr());
        }
        let (validity, stats) = heap.stats();
        assert!(validity.is_valid());
        assert_eq!(stats.zones, 0);
        assert_eq!(stats.cached_zones, 1);
        assert_eq!(stats.mapped, ZONE_SIZE);
    }

    #[test]
    fn test_large_round_trip() {
        let heap = toy_heap(Options::DEFAULT);
        let p = heap.allocate(ZONE_LIMIT).unwrap();
        assert_eq!(p.as_ptr() as usize % 4096, 0);
        let (_, stats) = heap.stats();
        assert_eq!(stats.large_count, 1);
        assert_eq!(stats.large_bytes, ZONE_LIMIT + 4096);
        unsafe {
            assert_eq!(heap.usable_size(p.as_ptr()), ZONE_LIMIT + 4096);
            // Same mapping length: stays put.
            assert_eq!(heap.reallocate(p.as_ptr(), ZONE_LIMIT + 100).unwrap(), p);
            heap.deallocate(p.as_ptr());
        }
        let (validity, stats) = heap.stats();
        assert!(validity.is_valid());
        assert_eq!(stats.large_count, 0);
        // Only the zone holding the (now freed) record may remain, cached.
        assert_eq!(stats.mapped, stats.cached_zones * ZONE_SIZE);
    }

    #[test]
    fn test_out_of_memory() {
        let heap = Heap::new(ToyStore::new(4 * ZONE_SIZE), Options::DEFAULT);
        assert_eq!(
            heap.allocate(8 * ZONE_SIZE).unwrap_err(),
            AllocError::OutOfMemory
        );
        assert_eq!(
            heap.allocate_zeroed(usize::MAX / 2, 3).unwrap_err(),
            AllocError::OutOfMemory
        );
        // Still usable.
        let p = heap.allocate(100).unwrap();
        unsafe { heap.deallocate(p.as_ptr()) };
        assert!(heap.stats().0.is_valid());
    }

    #[test]
    fn test_invalid_alignment() {
        let heap = toy_heap(Options::DEFAULT);
        for &align in &[0usize, 1, 2, 4, 3, 24] {
            assert_eq!(
                heap.allocate_aligned(align, 16).unwrap_err(),
                AllocError::InvalidArgument,
                "align {}",
                align
            );
        }
    }

    #[test]
    fn test_zero_all() {
        let heap = toy_heap(Options::DEFAULT.zero_all(true).thread_cache(false));
        let p = heap.allocate(64).unwrap();
        unsafe {
            p.as_ptr().write_bytes(0xff, 64);
            heap.deallocate(p.as_ptr());
            let q = heap.allocate(64).unwrap();
            assert_eq!(q, p);
            assert!((0..64).all(|i| *q.as_ptr().add(i) == 0));

            // Shrinking in place clears the tail.
            q.as_ptr().write_bytes(0xff, 64);
            let r = heap.reallocate(q.as_ptr(), 60).unwrap();
            assert_eq!(r, q);
            assert!((60..64).all(|i| *r.as_ptr().add(i) == 0));
            heap.deallocate(r.as_ptr());
        }
    }

    #[test]
    fn test_fork_hooks() {
        let heap = toy_heap(Options::DEFAULT);
        let p = heap.allocate(200).unwrap();
        let big = heap.allocate(ZONE_LIMIT * 2).unwrap();

        heap.prefork();
        let pid = unsafe { libc::fork() };
        assert!(pid >= 0);
        if pid == 0 {
            // Child: only this thread survived, and every lock is ours.
            unsafe {
                heap.postfork_child();
                heap.deallocate(p.as_ptr());
                heap.deallocate(big.as_ptr());
                let ok = heap.allocate(200).is_ok() && heap.stats().0.is_valid();
                libc::_exit(if ok { 0 } else { 1 });
            }
        }
        unsafe { heap.postfork_parent() };

        let mut status = 0;
        unsafe {
            assert_eq!(libc::waitpid(pid, &mut status, 0), pid);
            assert!(libc::WIFEXITED(status));
            assert_eq!(libc::WEXITSTATUS(status), 0);
        }

        // The parent's heap is untouched and unlocked.
        unsafe {
            heap.deallocate(p.as_ptr());
            heap.deallocate(big.as_ptr());
        }
        assert_eq!(heap.stats().1.large_count, 0);
    }

    #[test]
    fn test_drop_unmaps_everything() {
        let store = ToyStore::default();
        {
            let heap = Heap::new(&store, Options::DEFAULT);
            let mut ptrs = vec![];
            for i in 0..500 {
                ptrs.push(heap.allocate(1 + i * 37).unwrap());
            }
            for p in ptrs.iter().step_by(2) {
                unsafe { heap.deallocate(p.as_ptr()) };
            }
            assert!(store.mapped() > 0);
        }
        // Zones that were full when the heap went away stay mapped.
        let (maps, unmaps) = (store.maps(), store.unmaps());
        assert!(unmaps <= maps);
        assert!(unmaps > 0);
    }
}
