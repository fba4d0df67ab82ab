//! Magazines, magazine pairs and the depot.
//!
//! A magazine is a small stack of free chunk pointers of one size class. Each
//! thread owns two magazines per class, "loaded" and "previous", and allocates
//! and frees through them without any locking. Only when both are empty (on
//! allocation) or both are full (on free) does a thread visit the class's
//! depot, where whole magazines are traded under a short spin lock.
//!
//! Magazines themselves live in zone chunks and are linked into the depot lists
//! through their `next` field.

use core::mem::{size_of, swap};
use core::ptr::{null_mut, NonNull};

use spin::Mutex;
use static_assertions::const_assert;

use crate::size_class::{NZONES, ZONE_LIMIT};

/// Most rounds a magazine of any class can hold.
pub const MAX_ROUNDS: usize = 64;
const MIN_ROUNDS: usize = 4;
// Classes get as many rounds as fit this many bytes of chunks, within bounds.
const MAGAZINE_BYTES: usize = 32 * 1024;

/// Initial burst factor of a new magazine: its first refill from the zones asks
/// for `capacity / BURST_INIT` chunks.
pub const BURST_INIT: usize = 4;

#[repr(C)]
pub struct Magazine {
    rounds: usize,
    capacity: usize,
    burst: usize,
    next: *mut Magazine,
    objects: [*mut u8; MAX_ROUNDS],
}

// A magazine must fit in a zone chunk.
const_assert!(size_of::<Magazine>() < ZONE_LIMIT);

/// Rounds per magazine for chunks of `chunk_size` bytes.
pub fn rounds_for(chunk_size: usize) -> usize {
    (MAGAZINE_BYTES / chunk_size).max(MIN_ROUNDS).min(MAX_ROUNDS)
}

pub type MagazinePtr = NonNull<Magazine>;

impl Magazine {
    /// Build an empty magazine in the raw memory at `ptr`.
    ///
    /// # Safety
    ///
    /// `ptr` must be valid for writes of `size_of::<Magazine>()` bytes and
    /// suitably aligned.
    pub unsafe fn init(ptr: NonNull<u8>, capacity: usize) -> MagazinePtr {
        debug_assert!(capacity > 0 && capacity <= MAX_ROUNDS);
        let mag = ptr.cast::<Magazine>();
        mag.as_ptr().write(Magazine {
            rounds: 0,
            capacity,
            burst: BURST_INIT,
            next: null_mut(),
            objects: [null_mut(); MAX_ROUNDS],
        });
        mag
    }

    pub fn is_empty(&self) -> bool {
        self.rounds == 0
    }

    pub fn is_full(&self) -> bool {
        self.rounds >= self.capacity
    }

    pub fn pop(&mut self) -> Option<NonNull<u8>> {
        if self.rounds == 0 {
            return None;
        }
        self.rounds -= 1;
        NonNull::new(self.objects[self.rounds])
    }

    pub fn push(&mut self, ptr: NonNull<u8>) -> bool {
        if self.is_full() {
            return false;
        }
        self.objects[self.rounds] = ptr.as_ptr();
        self.rounds += 1;
        true
    }

    /// The round the next `pop` would return.
    pub fn top(&self) -> Option<*mut u8> {
        self.rounds.checked_sub(1).map(|i| self.objects[i])
    }

    /// Empty the magazine, returning the rounds it held.
    pub fn drain(&mut self) -> &[*mut u8] {
        let n = self.rounds;
        self.rounds = 0;
        &self.objects[..n]
    }

    /// How many chunks the next refill from the zones should fetch.
    ///
    /// A new magazine starts with a fraction of its capacity; every refill
    /// raises the fraction until the burst factor reaches 1.
    pub fn fill_target(&mut self) -> usize {
        let target = (self.capacity / self.burst).max(1);
        if self.burst > 1 {
            self.burst -= 1;
        }
        target
    }

    /// The unused slots, to be filled by the caller before `add_rounds`.
    pub fn spare_slots(&mut self) -> &mut [*mut u8] {
        let cap = self.capacity;
        &mut self.objects[self.rounds..cap]
    }

    pub fn add_rounds(&mut self, n: usize) {
        debug_assert!(self.rounds + n <= self.capacity);
        self.rounds += n;
    }
}

/// A thread's two magazines for one size class.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct MagazinePair {
    pub loaded: Option<MagazinePtr>,
    pub previous: Option<MagazinePtr>,
}

impl MagazinePair {
    pub const EMPTY: MagazinePair = MagazinePair {
        loaded: None,
        previous: None,
    };

    /// Pop from the loaded magazine, swapping in the previous one if it has
    /// rounds and the loaded one does not.
    ///
    /// # Safety
    ///
    /// Both magazines must be valid and owned by the calling thread.
    pub unsafe fn alloc(&mut self) -> Option<NonNull<u8>> {
        if let Some(mut mag) = self.loaded {
            if let Some(ptr) = mag.as_mut().pop() {
                return Some(ptr);
            }
        }
        match self.previous {
            Some(prev) if !prev.as_ref().is_empty() => {
                swap(&mut self.loaded, &mut self.previous);
                self.loaded.and_then(|mut mag| mag.as_mut().pop())
            }
            _ => None,
        }
    }

    /// Whether `ptr` is the round on top of either magazine, which means it
    /// was just freed already.
    ///
    /// # Safety
    ///
    /// Both magazines must be valid and owned by the calling thread.
    pub unsafe fn holds_on_top(&self, ptr: NonNull<u8>) -> bool {
        [self.loaded, self.previous]
            .iter()
            .flatten()
            .any(|mag| mag.as_ref().top() == Some(ptr.as_ptr()))
    }

    /// Push onto the loaded magazine, swapping in the previous one if it has
    /// room and the loaded one does not.
    ///
    /// # Safety
    ///
    /// Both magazines must be valid and owned by the calling thread.
    pub unsafe fn free(&mut self, ptr: NonNull<u8>) -> bool {
        if let Some(mut mag) = self.loaded {
            if mag.as_mut().push(ptr) {
                return true;
            }
        }
        match self.previous {
            Some(prev) if !prev.as_ref().is_full() => {
                swap(&mut self.loaded, &mut self.previous);
                match self.loaded {
                    Some(mut mag) => mag.as_mut().push(ptr),
                    None => false,
                }
            }
            _ => false,
        }
    }
}

/// Everything one thread caches: a magazine pair per class, plus one spare
/// empty magazine so the free path rarely has to allocate a magazine.
pub struct ThreadMagazines {
    pairs: [MagazinePair; NZONES],
    spare: Option<MagazinePtr>,
}

impl ThreadMagazines {
    pub const fn new() -> Self {
        ThreadMagazines {
            pairs: [MagazinePair::EMPTY; NZONES],
            spare: None,
        }
    }

    pub fn pair(&mut self, class: usize) -> &mut MagazinePair {
        &mut self.pairs[class]
    }

    pub fn take_spare(&mut self) -> Option<MagazinePtr> {
        self.spare.take()
    }

    pub fn has_spare(&self) -> bool {
        self.spare.is_some()
    }

    /// Keep `mag` as the spare; hands it back if there already is one.
    pub fn set_spare(&mut self, mag: MagazinePtr) -> Option<MagazinePtr> {
        if self.spare.is_some() {
            return Some(mag);
        }
        self.spare = Some(mag);
        None
    }

    /// Detach every magazine this thread holds, as `(class, magazine)` pairs.
    /// The spare is reported with class `None`.
    pub fn take_all(&mut self) -> impl Iterator<Item = (Option<usize>, MagazinePtr)> {
        let pairs = core::mem::replace(&mut self.pairs, [MagazinePair::EMPTY; NZONES]);
        let spare = self.spare.take();
        pairs
            .iter()
            .copied()
            .enumerate()
            .flat_map(|(class, pair)| {
                pair.loaded
                    .into_iter()
                    .chain(pair.previous)
                    .map(move |mag| (Some(class), mag))
            })
            .chain(spare.map(|mag| (None, mag)))
            .collect::<MagazineBatch>()
    }
}

/// A fixed-size collection of magazines, so draining a thread needs no heap
/// allocation.
pub struct MagazineBatch {
    items: [(Option<usize>, Option<MagazinePtr>); 2 * NZONES + 1],
    len: usize,
    pos: usize,
}

impl core::iter::FromIterator<(Option<usize>, MagazinePtr)> for MagazineBatch {
    fn from_iter<I: IntoIterator<Item = (Option<usize>, MagazinePtr)>>(iter: I) -> Self {
        let mut batch = MagazineBatch {
            items: [(None, None); 2 * NZONES + 1],
            len: 0,
            pos: 0,
        };
        for (class, mag) in iter {
            batch.items[batch.len] = (class, Some(mag));
            batch.len += 1;
        }
        batch
    }
}

impl Iterator for MagazineBatch {
    type Item = (Option<usize>, MagazinePtr);

    fn next(&mut self) -> Option<Self::Item> {
        while self.pos < self.len {
            let (class, mag) = self.items[self.pos];
            self.pos += 1;
            if let Some(mag) = mag {
                return Some((class, mag));
            }
        }
        None
    }
}

struct DepotLists {
    full: *mut Magazine,
    nfull: usize,
    empty: *mut Magazine,
    nempty: usize,
}

// The lists are only reached through the depot lock.
unsafe impl Send for DepotLists {}

unsafe fn push_list(head: &mut *mut Magazine, count: &mut usize, mag: MagazinePtr) {
    (*mag.as_ptr()).next = *head;
    *head = mag.as_ptr();
    *count += 1;
}

unsafe fn pop_list(head: &mut *mut Magazine, count: &mut usize) -> Option<MagazinePtr> {
    let mag = NonNull::new(*head)?;
    *head = (*mag.as_ptr()).next;
    (*mag.as_ptr()).next = null_mut();
    *count -= 1;
    Some(mag)
}

/// The result of trading a full magazine at the depot.
#[derive(Debug, Default)]
pub struct EmptyTrade {
    /// An empty magazine from the depot, if it had one.
    pub empty: Option<MagazinePtr>,
    /// The full magazine handed back because the depot already holds as many
    /// as it may.
    pub rejected: Option<MagazinePtr>,
}

/// The per-class exchange of full and empty magazines between threads.
pub struct Depot {
    lists: Mutex<DepotLists>,
}

impl Depot {
    pub const fn new() -> Self {
        Depot {
            lists: Mutex::new(DepotLists {
                full: null_mut(),
                nfull: 0,
                empty: null_mut(),
                nempty: 0,
            }),
        }
    }

    /// Take a full magazine, leaving `empty` (if any) in exchange.
    ///
    /// Returns `None`, and takes nothing, if the depot has no full magazine.
    /// Otherwise returns the full magazine, and `empty` again if the depot
    /// already holds `limit` empties.
    pub fn trade_for_full(
        &self,
        empty: Option<MagazinePtr>,
        limit: usize,
    ) -> Option<(MagazinePtr, Option<MagazinePtr>)> {
        let mut lists = self.lists.lock();
        let lists = &mut *lists;
        let full = unsafe { pop_list(&mut lists.full, &mut lists.nfull)? };
        let surplus = match empty {
            Some(mag) if lists.nempty < limit => {
                unsafe { push_list(&mut lists.empty, &mut lists.nempty, mag) };
                None
            }
            other => other,
        };
        Some((full, surplus))
    }

    /// Leave `full` in the depot and take an empty magazine if one is there.
    pub fn trade_for_empty(&self, full: MagazinePtr, limit: usize) -> EmptyTrade {
        let mut lists = self.lists.lock();
        let lists = &mut *lists;
        let rejected = if lists.nfull < limit {
            unsafe { push_list(&mut lists.full, &mut lists.nfull, full) };
            None
        } else {
            Some(full)
        };
        let empty = unsafe { pop_list(&mut lists.empty, &mut lists.nempty) };
        EmptyTrade { empty, rejected }
    }

    pub fn take_empty(&self) -> Option<MagazinePtr> {
        let mut lists = self.lists.lock();
        let lists = &mut *lists;
        unsafe { pop_list(&mut lists.empty, &mut lists.nempty) }
    }

    pub fn take_full(&self) -> Option<MagazinePtr> {
        let mut lists = self.lists.lock();
        let lists = &mut *lists;
        unsafe { pop_list(&mut lists.full, &mut lists.nfull) }
    }

    /// `(full, empty)` magazine counts.
    pub fn counts(&self) -> (usize, usize) {
        let lists = self.lists.lock();
        (lists.nfull, lists.nempty)
    }

    pub(crate) fn lock_for_fork(&self) {
        core::mem::forget(self.lists.lock());
    }

    /// # Safety
    ///
    /// Only after `lock_for_fork`, by the same thread or its forked child.
    pub(crate) unsafe fn unlock_after_fork(&self) {
        self.lists.force_unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::alloc::{alloc, dealloc, Layout};

    use test_log::test;

    fn new_magazine(capacity: usize) -> MagazinePtr {
        let ptr = NonNull::new(unsafe { alloc(Layout::new::<Magazine>()) }).unwrap();
        unsafe { Magazine::init(ptr, capacity) }
    }

    fn release(mag: MagazinePtr) {
        unsafe { dealloc(mag.as_ptr() as *mut u8, Layout::new::<Magazine>()) };
    }

    fn fake(n: usize) -> NonNull<u8> {
        NonNull::new((n * 64) as *mut u8).unwrap()
    }

    #[test]
    fn test_rounds_for() {
        assert_eq!(rounds_for(8), MAX_ROUNDS);
        assert_eq!(rounds_for(1024), 32);
        assert_eq!(rounds_for(ZONE_LIMIT), MIN_ROUNDS);
    }

    #[test]
    fn test_magazine_lifo() {
        let mut mag = new_magazine(3);
        unsafe {
            let m = mag.as_mut();
            assert!(m.is_empty());
            assert!(m.push(fake(1)));
            assert!(m.push(fake(2)));
            assert!(m.push(fake(3)));
            assert!(m.is_full());
            assert!(!m.push(fake(4)));
            assert_eq!(m.pop(), Some(fake(3)));
            assert_eq!(m.pop(), Some(fake(2)));
            assert_eq!(m.drain(), &[fake(1).as_ptr()]);
            assert_eq!(m.pop(), None);
        }
        release(mag);
    }

    #[test]
    fn test_fill_target_ramps_up() {
        let mut mag = new_magazine(64);
        let m = unsafe { mag.as_mut() };
        let targets: Vec<_> = (0..6).map(|_| m.fill_target()).collect();
        assert_eq!(targets, vec![16, 21, 32, 64, 64, 64]);

        assert_eq!(m.spare_slots().len(), 64);
        m.spare_slots()[0] = fake(9).as_ptr();
        m.add_rounds(1);
        assert_eq!(m.spare_slots().len(), 63);
        assert_eq!(m.pop(), Some(fake(9)));
        release(mag);
    }

    #[test]
    fn test_pair_swaps() {
        let loaded = new_magazine(2);
        let previous = new_magazine(2);
        let mut pair = MagazinePair {
            loaded: Some(loaded),
            previous: Some(previous),
        };
        unsafe {
            // Fill both magazines.
            for i in 1..=4 {
                assert!(pair.free(fake(i)));
            }
            assert_eq!(pair.loaded, Some(previous));
            assert!(!pair.free(fake(5)));

            // Drain both.
            let mut got = vec![];
            while let Some(p) = pair.alloc() {
                got.push(p);
            }
            assert_eq!(got, vec![fake(4), fake(3), fake(2), fake(1)]);
        }
        release(loaded);
        release(previous);
    }

    #[test]
    fn test_empty_pair() {
        let mut pair = MagazinePair::EMPTY;
        unsafe {
            assert_eq!(pair.alloc(), None);
            assert!(!pair.free(fake(1)));
        }
    }

    #[test]
    fn test_depot_trades() {
        let depot = Depot::new();
        let full = new_magazine(1);
        let empty = new_magazine(1);
        unsafe { full.as_ptr().as_mut().unwrap().push(fake(1)) };

        // Nothing to trade for yet; the caller keeps its empty.
        assert!(depot.trade_for_full(Some(empty), 4).is_none());

        let trade = depot.trade_for_empty(full, 4);
        assert!(trade.empty.is_none());
        assert!(trade.rejected.is_none());
        assert_eq!(depot.counts(), (1, 0));

        let (got, surplus) = depot.trade_for_full(Some(empty), 4).unwrap();
        assert_eq!(got, full);
        assert!(surplus.is_none());
        assert_eq!(depot.counts(), (0, 1));
        assert_eq!(depot.take_empty(), Some(empty));
        assert_eq!(depot.take_empty(), None);

        depot.trade_for_empty(full, 4);
        assert_eq!(depot.take_full(), Some(full));
        assert_eq!(depot.take_full(), None);
        assert_eq!(depot.counts(), (0, 0));

        release(full);
        release(empty);
    }

    #[test]
    fn test_depot_limits() {
        let depot = Depot::new();
        let a = new_magazine(1);
        let b = new_magazine(1);

        let trade = depot.trade_for_empty(a, 0);
        assert_eq!(trade.rejected, Some(a));
        assert_eq!(depot.counts(), (0, 0));

        depot.trade_for_empty(a, 1);
        let (got, surplus) = depot.trade_for_full(Some(b), 0).unwrap();
        assert_eq!(got, a);
        assert_eq!(surplus, Some(b));
        assert_eq!(depot.counts(), (0, 0));

        release(a);
        release(b);
    }

    #[test]
    fn test_thread_magazines_take_all() {
        let mut mags = ThreadMagazines::new();
        let a = new_magazine(1);
        let b = new_magazine(1);
        let c = new_magazine(1);
        mags.pair(3).loaded = Some(a);
        mags.pair(7).previous = Some(b);
        assert_eq!(mags.set_spare(c), None);
        assert_eq!(mags.set_spare(a), Some(a));
        assert!(mags.has_spare());

        let all: Vec<_> = mags.take_all().collect();
        assert_eq!(all, vec![(Some(3), a), (Some(7), b), (None, c)]);
        assert!(!mags.has_spare());
        assert_eq!(*mags.pair(3), MagazinePair::EMPTY);

        release(a);
        release(b);
        release(c);
    }
}
