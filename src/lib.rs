//! A zone allocator with per-thread magazines.
//!
//! Small and medium requests (below [`ZONE_LIMIT`](constant.ZONE_LIMIT.html))
//! are rounded to one of [`NZONES`](constant.NZONES.html) size classes and
//! carved out of 64 KiB zones, each holding equal chunks of one class. Each
//! thread keeps a pair of magazines (small stacks of free chunks) per class,
//! so most allocations and frees touch no lock at all; magazines circulate
//! between threads through a per-class depot. Larger requests are mapped
//! straight from the OS and recorded in a sharded table.
//!
//! ```
//! use zonealloc::{Heap, LocalCache, Options, ToyStore};
//!
//! let heap = Heap::new(ToyStore::default(), Options::DEFAULT);
//! let mut cache = LocalCache::new(&heap);
//! let p = cache.allocate(40).unwrap();
//! unsafe { cache.deallocate(p.as_ptr()) };
//! ```
//!
//! To use it for the whole program:
//!
//! ```no_run
//! #[global_allocator]
//! static ALLOCATOR: zonealloc::SlabAllocator = zonealloc::SlabAllocator::new();
//! ```

pub mod allocators;
mod error;
pub mod heap;
mod large;
mod magazine;
mod options;
mod size_class;
mod unix;
mod zone;

pub use crate::allocators::{
    calloc, configure, free, malloc, malloc_usable_size, posix_memalign, postfork_child,
    postfork_parent, prefork, realloc, thread_exit, BackingStore, GenericAllocator, LocalCache,
    SlabAllocator, ToyStore,
};
pub use crate::error::{AllocError, MapError};
pub use crate::heap::{zero_length_ptr, Heap, Stats, Validity};
pub use crate::options::Options;
pub use crate::size_class::{is_large, zone_index, SizeClass, NZONES, ZONE_LIMIT, ZONE_PAGE};
pub use crate::unix::MmapStore;
pub use crate::zone::ZONE_SIZE;
