//! The table of large allocations.
//!
//! Large allocations are mapped straight from the backing store and have no zone
//! to find them through, so each one is recorded here, keyed by its address.
//! The table is split into shards, each with its own spin lock; a lookup in a
//! shard with no records returns without taking the lock, which keeps frees of
//! zone chunks (the common case) cheap.

use core::ptr::{null_mut, NonNull};
use core::sync::atomic::{AtomicPtr, Ordering};

use spin::Mutex;

/// Number of shards in a `LargeTable`.
pub const LARGE_SHARDS: usize = 1024;

/// One large allocation. Records live in zone chunks of the heap that owns
/// them.
#[repr(C)]
pub struct LargeRecord {
    pub base: usize,
    pub len: usize,
    next: *mut LargeRecord,
}

impl LargeRecord {
    /// Write a record into the raw memory at `mem`.
    ///
    /// # Safety
    ///
    /// `mem` must be valid for writes of a `LargeRecord` and suitably aligned.
    pub unsafe fn write(mem: NonNull<u8>, base: usize, len: usize) -> NonNull<LargeRecord> {
        let rec = mem.cast::<LargeRecord>();
        rec.as_ptr().write(LargeRecord {
            base,
            len,
            next: null_mut(),
        });
        rec
    }
}

struct Shard {
    lock: Mutex<()>,
    // Only written with `lock` held.
    head: AtomicPtr<LargeRecord>,
}

fn shard_index(addr: usize) -> usize {
    ((addr >> 12) ^ (addr >> 22)) % LARGE_SHARDS
}

pub struct LargeTable {
    shards: [Shard; LARGE_SHARDS],
}

impl LargeTable {
    pub fn new() -> Self {
        LargeTable {
            shards: core::array::from_fn(|_| Shard {
                lock: Mutex::new(()),
                head: AtomicPtr::new(null_mut()),
            }),
        }
    }

    /// Record a new large allocation.
    ///
    /// # Safety
    ///
    /// `rec` must be a valid record not already in any table, and its base
    /// must not be recorded yet.
    pub unsafe fn insert(&self, rec: NonNull<LargeRecord>) {
        let shard = &self.shards[shard_index(rec.as_ref().base)];
        let _guard = shard.lock.lock();
        (*rec.as_ptr()).next = shard.head.load(Ordering::Relaxed);
        shard.head.store(rec.as_ptr(), Ordering::Release);
    }

    /// The mapped length of the large allocation at `addr`, if there is one.
    pub fn lookup(&self, addr: usize) -> Option<usize> {
        let shard = &self.shards[shard_index(addr)];
        if shard.head.load(Ordering::Acquire).is_null() {
            return None;
        }
        let _guard = shard.lock.lock();
        let mut cur = shard.head.load(Ordering::Relaxed);
        while let Some(rec) = NonNull::new(cur) {
            let rec = unsafe { rec.as_ref() };
            if rec.base == addr {
                return Some(rec.len);
            }
            cur = rec.next;
        }
        None
    }

    /// Unlink and return the record for `addr`, if there is one.
    pub fn remove(&self, addr: usize) -> Option<NonNull<LargeRecord>> {
        let shard = &self.shards[shard_index(addr)];
        if shard.head.load(Ordering::Acquire).is_null() {
            return None;
        }
        let _guard = shard.lock.lock();
        let mut prev: *mut LargeRecord = null_mut();
        let mut cur = shard.head.load(Ordering::Relaxed);
        while let Some(rec) = NonNull::new(cur) {
            let next = unsafe { rec.as_ref().next };
            if unsafe { rec.as_ref().base } == addr {
                if prev.is_null() {
                    shard.head.store(next, Ordering::Release);
                } else {
                    unsafe { (*prev).next = next };
                }
                unsafe { (*rec.as_ptr()).next = null_mut() };
                return Some(rec);
            }
            prev = cur;
            cur = next;
        }
        None
    }

    /// `(count, bytes)` of all recorded allocations.
    pub fn totals(&self) -> (usize, usize) {
        let mut count = 0;
        let mut bytes = 0;
        for shard in self.shards.iter() {
            if shard.head.load(Ordering::Acquire).is_null() {
                continue;
            }
            let _guard = shard.lock.lock();
            let mut cur = shard.head.load(Ordering::Relaxed);
            while let Some(rec) = NonNull::new(cur) {
                let rec = unsafe { rec.as_ref() };
                count += 1;
                bytes += rec.len;
                cur = rec.next;
            }
        }
        (count, bytes)
    }

    /// Unlink every record, handing each to `f`.
    pub fn drain(&self, mut f: impl FnMut(NonNull<LargeRecord>)) {
        for shard in self.shards.iter() {
            let _guard = shard.lock.lock();
            let mut cur = shard.head.swap(null_mut(), Ordering::AcqRel);
            while let Some(rec) = NonNull::new(cur) {
                cur = unsafe { rec.as_ref().next };
                f(rec);
            }
        }
    }

    pub(crate) fn lock_for_fork(&self) {
        for shard in self.shards.iter() {
            core::mem::forget(shard.lock.lock());
        }
    }

    /// # Safety
    ///
    /// Only after `lock_for_fork`, by the same thread or its forked child.
    pub(crate) unsafe fn unlock_after_fork(&self) {
        for shard in self.shards.iter() {
            shard.lock.force_unlock();
        }
    }
}
