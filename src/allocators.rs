//! Allocator front ends, and the seam to the memory they draw from.
//!
//! ## Basic Types
//!
//! ### [`BackingStore`](trait.BackingStore.html)
//!
//! `BackingStore` is a small trait over the calls to the OS that map and unmap
//! memory. Every byte a heap hands out comes through it.
//!
//! ### [`ToyStore`](struct.ToyStore.html)
//!
//! `ToyStore` is a backing store with a fixed budget, counting what it maps. It
//! is mainly useful for testing.
//!
//! ### [`LocalCache`](struct.LocalCache.html)
//!
//! A `LocalCache` is one thread's set of magazines for a given
//! [`Heap`](../heap/struct.Heap.html). Allocating and freeing through it takes
//! no locks most of the time. Dropping it drains the magazines back to the heap.
//!
//! ### [`SlabAllocator`](struct.SlabAllocator.html)
//!
//! `SlabAllocator` is the process-wide heap, with a magazine cache per thread,
//! usable as the `#[global_allocator]`. The same heap is behind the C-style
//! functions [`malloc`](fn.malloc.html), [`free`](fn.free.html) and friends.

use core::alloc::{GlobalAlloc, Layout};
use core::cell::{Cell, UnsafeCell};
use core::mem::MaybeUninit;
use core::ptr::{self, null_mut, NonNull};
use core::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

use errno::{set_errno, Errno};
use libc::{c_int, c_void};
use spin::Mutex;

use crate::error::{fatal, AllocError, MapError};
use crate::heap::{Heap, Stats, Validity};
use crate::magazine::ThreadMagazines;
use crate::options::Options;
use crate::size_class::MIN_CHUNK;
use crate::unix::{round_up, MmapStore};

/// Where a heap gets its memory.
///
/// Implementations must be `Sync`: a heap calls its store from any thread.
pub trait BackingStore: Sync {
    /// Map at least `size` bytes aligned to `align`, a power of two.
    ///
    /// # Safety
    ///
    /// For this to function properly with a `Heap`, the memory returned must be
    /// readable, writable, filled with zeroes, and untracked by any other Rust
    /// code until it is passed back to `unmap`.
    unsafe fn map(&self, size: usize, align: usize) -> Result<NonNull<u8>, MapError>;

    /// Release a mapping.
    ///
    /// # Safety
    ///
    /// `ptr` and `size` must be exactly what was passed to and returned from a
    /// previous `map`, and nothing may use the memory afterwards.
    unsafe fn unmap(&self, ptr: NonNull<u8>, size: usize);

    /// The granularity of mappings.
    fn page_size(&self) -> usize;
}

impl<T: BackingStore + ?Sized> BackingStore for &T {
    unsafe fn map(&self, size: usize, align: usize) -> Result<NonNull<u8>, MapError> {
        (**self).map(size, align)
    }

    unsafe fn unmap(&self, ptr: NonNull<u8>, size: usize) {
        (**self).unmap(ptr, size)
    }

    fn page_size(&self) -> usize {
        (**self).page_size()
    }
}

/// A store that maps real memory, but only up to a budget, and keeps count.
pub struct ToyStore {
    inner: MmapStore,
    pub budget: usize,
    mapped: AtomicUsize,
    maps: AtomicUsize,
    unmaps: AtomicUsize,
}

impl ToyStore {
    pub fn new(budget: usize) -> Self {
        ToyStore {
            inner: MmapStore::new(),
            budget,
            mapped: AtomicUsize::new(0),
            maps: AtomicUsize::new(0),
            unmaps: AtomicUsize::new(0),
        }
    }

    /// Bytes currently mapped.
    pub fn mapped(&self) -> usize {
        self.mapped.load(Ordering::Relaxed)
    }

    /// Number of `map` calls that succeeded.
    pub fn maps(&self) -> usize {
        self.maps.load(Ordering::Relaxed)
    }

    pub fn unmaps(&self) -> usize {
        self.unmaps.load(Ordering::Relaxed)
    }

    fn charge(&self, size: usize) -> Option<usize> {
        round_up(size, self.inner.page_size())
    }
}

impl Default for ToyStore {
    fn default() -> Self {
        ToyStore::new(64 * 1024 * 1024)
    }
}

impl BackingStore for ToyStore {
    unsafe fn map(&self, size: usize, align: usize) -> Result<NonNull<u8>, MapError> {
        let len = self.charge(size).ok_or(MapError::Exhausted)?;
        let before = self.mapped.fetch_add(len, Ordering::Relaxed);
        if before.checked_add(len).map_or(true, |after| after > self.budget) {
            self.mapped.fetch_sub(len, Ordering::Relaxed);
            return Err(MapError::Exhausted);
        }
        match self.inner.map(size, align) {
            Ok(ptr) => {
                self.maps.fetch_add(1, Ordering::Relaxed);
                Ok(ptr)
            }
            Err(e) => {
                self.mapped.fetch_sub(len, Ordering::Relaxed);
                Err(e)
            }
        }
    }

    unsafe fn unmap(&self, ptr: NonNull<u8>, size: usize) {
        self.inner.unmap(ptr, size);
        if let Some(len) = self.charge(size) {
            self.mapped.fetch_sub(len, Ordering::Relaxed);
        }
        self.unmaps.fetch_add(1, Ordering::Relaxed);
    }

    fn page_size(&self) -> usize {
        self.inner.page_size()
    }
}

/// One thread's magazines for a heap.
///
/// A `LocalCache` cannot leave its thread. Chunks allocated through it may be
/// freed anywhere: through another thread's cache, or the heap directly.
pub struct LocalCache<'h, S: BackingStore> {
    heap: &'h Heap<S>,
    mags: ThreadMagazines,
}

impl<'h, S: BackingStore> LocalCache<'h, S> {
    pub fn new(heap: &'h Heap<S>) -> Self {
        LocalCache {
            heap,
            mags: ThreadMagazines::new(),
        }
    }

    pub fn heap(&self) -> &'h Heap<S> {
        self.heap
    }

    pub fn allocate(&mut self, size: usize) -> Result<NonNull<u8>, AllocError> {
        self.heap.allocate_with(size, Some(&mut self.mags))
    }

    pub fn allocate_zeroed(&mut self, count: usize, size: usize) -> Result<NonNull<u8>, AllocError> {
        self.heap
            .allocate_zeroed_with(count, size, Some(&mut self.mags))
    }

    /// # Safety
    ///
    /// See [`Heap::reallocate`](../heap/struct.Heap.html#method.reallocate).
    pub unsafe fn reallocate(&mut self, ptr: *mut u8, size: usize) -> Result<NonNull<u8>, AllocError> {
        self.heap.reallocate_with(ptr, size, Some(&mut self.mags))
    }

    /// # Safety
    ///
    /// See [`Heap::deallocate`](../heap/struct.Heap.html#method.deallocate).
    pub unsafe fn deallocate(&mut self, ptr: *mut u8) {
        self.heap.deallocate_with(ptr, Some(&mut self.mags))
    }

    pub fn allocate_aligned(&mut self, align: usize, size: usize) -> Result<NonNull<u8>, AllocError> {
        self.heap
            .allocate_aligned_with(align, size, Some(&mut self.mags))
    }

    /// Return every cached chunk to the heap now.
    pub fn drain(&mut self) {
        self.heap.drain_thread(&mut self.mags);
    }
}

impl<'h, S: BackingStore> Drop for LocalCache<'h, S> {
    fn drop(&mut self) {
        self.drain();
    }
}

/// A heap created on first use, for use in a `static`.
pub struct GenericAllocator<S: BackingStore> {
    // Values:
    // - 0: Untouched
    // - 1: Initialization in progress
    // - 2: Initialized
    init: AtomicU8,
    // Read once, when the heap is created.
    options: Mutex<Options>,
    heap: UnsafeCell<MaybeUninit<Heap<S>>>,
}

// The heap is only written once, before `init` becomes 2, and only read after.
unsafe impl<S: BackingStore> Sync for GenericAllocator<S> {}

impl<S: BackingStore> GenericAllocator<S> {
    pub const fn new() -> Self {
        GenericAllocator {
            init: AtomicU8::new(0),
            options: Mutex::new(Options::DEFAULT),
            heap: UnsafeCell::new(MaybeUninit::uninit()),
        }
    }
}

impl<S: BackingStore + Default> Default for GenericAllocator<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: BackingStore + Default> GenericAllocator<S> {
    /// Set the options the heap will be created with. Returns false, changing
    /// nothing, if the heap already exists.
    pub fn configure(&self, options: Options) -> bool {
        if self.init.load(Ordering::SeqCst) != 0 {
            return false;
        }
        *self.options.lock() = options;
        // Lost the race with the first allocation.
        self.init.load(Ordering::SeqCst) == 0
    }

    /// The heap, if something already created it.
    pub fn get_if_initialized(&self) -> Option<&Heap<S>> {
        if self.init.load(Ordering::SeqCst) == 2 {
            Some(unsafe { (*self.heap.get()).assume_init_ref() })
        } else {
            None
        }
    }

    /// Get the heap, creating it on first use.
    pub fn get(&self) -> &Heap<S> {
        // The plan:
        // - If initializing hasn't yet started (0):
        //   - Mark it as initializing (1), then initialize, then mark it as fully initialized (2)
        // - If it has started but not completed (1):
        //   - Enter a spin loop until it is fully initialized (2)
        // - If it finished initializing (2):
        //   - Continue
        //
        // Creating the heap maps nothing and allocates nothing, so no
        // allocation can recurse into here while the state is 1.
        let state = self
            .init
            .compare_exchange(0, 1, Ordering::SeqCst, Ordering::SeqCst);

        match state {
            Err(2) => {}
            Ok(0) => {
                let options = *self.options.lock();
                unsafe { (*self.heap.get()).write(Heap::new(S::default(), options)) };
                self.init.store(2, Ordering::SeqCst);
            }
            Err(1) => loop {
                core::hint::spin_loop();
                match self.init.load(Ordering::SeqCst) {
                    1 => continue,
                    2 => break,
                    state => fatal("unexpected allocator state", state as usize),
                }
            },
            Ok(v) | Err(v) => fatal("unexpected allocator state", v as usize),
        }

        unsafe { (*self.heap.get()).assume_init_ref() }
    }

    pub fn stats(&self) -> (Validity, Stats) {
        self.get().stats()
    }
}

////////////////////////////////////////////////////////////
// The process heap

static PROCESS: GenericAllocator<MmapStore> = GenericAllocator::new();

struct ThreadCache {
    // Set while this thread is inside the allocator; nested calls (from the
    // logger, say) go straight to the zones.
    busy: Cell<bool>,
    mags: UnsafeCell<ThreadMagazines>,
}

impl Drop for ThreadCache {
    fn drop(&mut self) {
        if let Some(heap) = PROCESS.get_if_initialized() {
            heap.drain_thread(self.mags.get_mut());
        }
    }
}

thread_local! {
    static THREAD: ThreadCache = const {
        ThreadCache {
            busy: Cell::new(false),
            mags: UnsafeCell::new(ThreadMagazines::new()),
        }
    };
}

/// Run `f` with this thread's magazines, or with none if they are in use or
/// already torn down.
fn with_magazines<R>(f: impl FnOnce(Option<&mut ThreadMagazines>) -> R) -> R {
    let cache = THREAD
        .try_with(|t| {
            if t.busy.replace(true) {
                None
            } else {
                Some(t as *const ThreadCache)
            }
        })
        .ok()
        .flatten();

    match cache {
        Some(t) => {
            // The cache outlives this call: its destructor runs on this
            // thread, and not while we are in here.
            let t = unsafe { &*t };
            let res = f(Some(unsafe { &mut *t.mags.get() }));
            t.busy.set(false);
            res
        }
        None => f(None),
    }
}

fn process_heap() -> &'static Heap<MmapStore> {
    PROCESS.get()
}

/// Set the options for the process heap. Only effective before its first
/// allocation; returns whether they were taken.
pub fn configure(options: Options) -> bool {
    PROCESS.configure(options)
}

/// Return the calling thread's cached chunks to the process heap now, rather
/// than when the thread exits.
pub fn thread_exit() {
    if let Some(heap) = PROCESS.get_if_initialized() {
        with_magazines(|mags| {
            if let Some(mags) = mags {
                heap.drain_thread(mags);
            }
        });
    }
}

/// Quiesce the process heap before `fork`.
pub fn prefork() {
    process_heap().prefork();
}

/// Resume the process heap in the parent after `fork`.
///
/// # Safety
///
/// Must follow `prefork` on the same thread.
pub unsafe fn postfork_parent() {
    process_heap().postfork_parent();
}

/// Reset the process heap in the child after `fork`.
///
/// # Safety
///
/// Must follow `prefork` on the thread that forked.
pub unsafe fn postfork_child() {
    process_heap().postfork_child();
}

/// The process heap, with a magazine cache for each thread.
///
/// ```no_run
/// use zonealloc::SlabAllocator;
///
/// #[global_allocator]
/// static ALLOCATOR: SlabAllocator = SlabAllocator::new();
/// ```
#[derive(Default)]
pub struct SlabAllocator;

impl SlabAllocator {
    pub const fn new() -> Self {
        SlabAllocator
    }

    pub fn stats(&self) -> (Validity, Stats) {
        PROCESS.stats()
    }

    fn alloc_layout(layout: Layout, zeroed: bool) -> *mut u8 {
        let heap = process_heap();
        let res = with_magazines(|mags| {
            if layout.align() <= MIN_CHUNK {
                if zeroed {
                    heap.allocate_zeroed_with(1, layout.size(), mags)
                } else {
                    heap.allocate_with(layout.size(), mags)
                }
            } else {
                heap.allocate_aligned_with(layout.align(), layout.size(), mags)
                    .map(|ptr| {
                        if zeroed {
                            unsafe { ptr.as_ptr().write_bytes(0, layout.size()) };
                        }
                        ptr
                    })
            }
        });
        res.map_or(null_mut(), NonNull::as_ptr)
    }
}

unsafe impl GlobalAlloc for SlabAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        Self::alloc_layout(layout, false)
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        Self::alloc_layout(layout, true)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        let heap = process_heap();
        with_magazines(|mags| heap.deallocate_with(ptr, mags))
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        if layout.align() > MIN_CHUNK {
            // Moving may lose the alignment; do it by hand.
            let new_layout = Layout::from_size_align_unchecked(new_size, layout.align());
            let new = self.alloc(new_layout);
            if !new.is_null() {
                ptr::copy_nonoverlapping(ptr, new, layout.size().min(new_size));
                self.dealloc(ptr, layout);
            }
            return new;
        }
        let heap = process_heap();
        with_magazines(|mags| heap.reallocate_with(ptr, new_size, mags))
            .map_or(null_mut(), NonNull::as_ptr)
    }
}

////////////////////////////////////////////////////////////
// C conventions: null and errno on failure

fn c_result(res: Result<NonNull<u8>, AllocError>) -> *mut c_void {
    match res {
        Ok(ptr) => ptr.as_ptr() as *mut c_void,
        Err(e) => {
            set_errno(Errno(e.errno()));
            null_mut()
        }
    }
}

/// Allocate `size` bytes; null with `errno` set to `ENOMEM` on failure.
pub extern "C" fn malloc(size: usize) -> *mut c_void {
    let heap = process_heap();
    c_result(with_magazines(|mags| heap.allocate_with(size, mags)))
}

/// Allocate `count * size` zeroed bytes; null with `ENOMEM` on failure or
/// overflow.
pub extern "C" fn calloc(count: usize, size: usize) -> *mut c_void {
    let heap = process_heap();
    c_result(with_magazines(|mags| heap.allocate_zeroed_with(count, size, mags)))
}

/// # Safety
///
/// `ptr` must be null or returned by one of these functions and not yet freed.
pub unsafe extern "C" fn realloc(ptr: *mut c_void, size: usize) -> *mut c_void {
    let heap = process_heap();
    c_result(with_magazines(|mags| {
        heap.reallocate_with(ptr as *mut u8, size, mags)
    }))
}

/// # Safety
///
/// `ptr` must be null or returned by one of these functions and not yet freed.
pub unsafe extern "C" fn free(ptr: *mut c_void) {
    if ptr.is_null() {
        return;
    }
    let heap = process_heap();
    with_magazines(|mags| heap.deallocate_with(ptr as *mut u8, mags))
}

/// Allocate `size` bytes aligned to `align` into `*out`. Returns 0, `EINVAL`
/// for a bad alignment, or `ENOMEM`; `errno` is left alone.
///
/// # Safety
///
/// `out` must be valid for a pointer write.
pub unsafe extern "C" fn posix_memalign(out: *mut *mut c_void, align: usize, size: usize) -> c_int {
    let heap = process_heap();
    match with_magazines(|mags| heap.allocate_aligned_with(align, size, mags)) {
        Ok(ptr) => {
            *out = ptr.as_ptr() as *mut c_void;
            0
        }
        Err(e) => e.errno(),
    }
}

/// # Safety
///
/// `ptr` must be null or a live allocation from these functions.
pub unsafe extern "C" fn malloc_usable_size(ptr: *mut c_void) -> usize {
    if ptr.is_null() {
        return 0;
    }
    process_heap().usable_size_of(ptr as *const u8)
}

#[cfg(test)]
mod tests {
    use super::*;

    use test_log::test;

    fn heap(options: Options) -> Heap<ToyStore> {
        Heap::new(ToyStore::default(), options)
    }

    #[test]
    fn test_toy_store_budget() {
        let store = ToyStore::new(128 * 1024);
        unsafe {
            let a = store.map(64 * 1024, 64 * 1024).unwrap();
            let b = store.map(64 * 1024, 64 * 1024).unwrap();
            assert_eq!(store.mapped(), 128 * 1024);
            assert_eq!(store.map(1, 1), Err(MapError::Exhausted));
            store.unmap(a, 64 * 1024);
            assert_eq!(store.mapped(), 64 * 1024);
            let c = store.map(100, 1).unwrap();
            store.unmap(b, 64 * 1024);
            store.unmap(c, 100);
        }
        assert_eq!(store.mapped(), 0);
        assert_eq!(store.maps(), 3);
        assert_eq!(store.unmaps(), 3);
    }

    #[test]
    fn test_local_cache_lifo() {
        let heap = heap(Options::DEFAULT);
        let mut cache = LocalCache::new(&heap);
        unsafe {
            let a = cache.allocate(40).unwrap();
            let b = cache.allocate(40).unwrap();
            assert_ne!(a, b);
            cache.deallocate(a.as_ptr());
            let c = cache.allocate(40).unwrap();
            assert_eq!(c, a);
            cache.deallocate(b.as_ptr());
            cache.deallocate(c.as_ptr());
        }
        drop(cache);

        let (validity, stats) = heap.stats();
        assert!(validity.is_valid());
        assert_eq!(stats.large_count, 0);
    }

    #[test]
    fn test_drained_cache_returns_everything() {
        let heap = heap(Options::DEFAULT.retention(0));
        {
            let mut cache = LocalCache::new(&heap);
            let ptrs: Vec<_> = (0..1000).map(|i| cache.allocate(16 + i % 300).unwrap()).collect();
            for p in ptrs {
                unsafe { cache.deallocate(p.as_ptr()) };
            }
        }
        // With no retention and the cache drained, no zone stays mapped.
        let (validity, stats) = heap.stats();
        assert!(validity.is_valid(), "{:?}", validity);
        assert_eq!(stats.zones, 0, "{:?}", stats);
        assert_eq!(stats.mapped, 0, "{:?}", stats);
        assert_eq!(heap.store().mapped(), 0);
    }

    #[test]
    fn test_uncached_when_disabled() {
        let heap = heap(Options::DEFAULT.thread_cache(false));
        let mut cache = LocalCache::new(&heap);
        let a = cache.allocate(100).unwrap();
        unsafe { cache.deallocate(a.as_ptr()) };
        let (_, stats) = heap.stats();
        // Went straight back to its zone, which was then released.
        assert_eq!(stats.zones, 0);
        assert_eq!(stats.depot_full + stats.depot_empty, 0);
    }

    #[test]
    fn test_generic_allocator_configure() {
        let alloc: GenericAllocator<ToyStore> = GenericAllocator::new();
        assert!(alloc.get_if_initialized().is_none());
        assert!(alloc.configure(Options::DEFAULT.zero_all(true)));
        let heap = alloc.get();
        assert!(heap.options().zero_all);
        assert!(!alloc.configure(Options::DEFAULT));
        assert!(alloc.get_if_initialized().is_some());
        let (validity, _) = alloc.stats();
        assert!(validity.is_valid());
    }

    #[test]
    fn test_c_functions() {
        unsafe {
            let p = malloc(100);
            assert!(!p.is_null());
            assert!(malloc_usable_size(p) >= 100);
            let p = realloc(p, 5000);
            assert!(!p.is_null());
            free(p);

            let z = calloc(10, 10) as *mut u8;
            assert!((0..100).all(|i| *z.add(i) == 0));
            free(z as *mut c_void);

            assert!(calloc(usize::MAX, 2).is_null());
            assert_eq!(errno::errno().0, libc::ENOMEM);

            let mut out = null_mut();
            assert_eq!(posix_memalign(&mut out, 3, 16), libc::EINVAL);
            assert_eq!(posix_memalign(&mut out, 4, 16), libc::EINVAL);
            assert_eq!(posix_memalign(&mut out, 256, 16), 0);
            assert_eq!(out as usize % 256, 0);
            free(out);

            let zero = malloc(0);
            assert!(!zero.is_null());
            assert_eq!(malloc_usable_size(zero), 0);
            free(zero);
            free(null_mut());
        }
        thread_exit();
    }
}
