//! Size classes for zone allocations.
//!
//! Small requests are rounded up to 8-byte multiples. Each time the request size
//! doubles past 128 bytes the chunking granularity doubles too, which keeps the
//! worst-case internal waste of every band under 1/8th of the chunk.
//!
//! | request        | chunking | classes |
//! |----------------|----------|---------|
//! | 1 - 127        | 8        | 0 - 15  |
//! | 128 - 255      | 16       | 15 - 23 |
//! | 256 - 511      | 32       | 23 - 31 |
//! | 512 - 1023     | 64       | 31 - 39 |
//! | 1024 - 2047    | 128      | 39 - 47 |
//! | 2048 - 4095    | 256      | 47 - 55 |
//! | 4096 - 8191    | 512      | 55 - 63 |
//! | 8192 - 16383   | 1024     | 63 - 71 |
//!
//! The first class of each band is shared with the last rounded size of the band
//! below it, so a given rounded size always maps to the same class.

/// Zone pages are the granularity of per-page free lists and large-object routing.
pub const ZONE_PAGE: usize = 4096;

/// Requests of this size or larger never come from a zone.
pub const ZONE_LIMIT: usize = 16 * 1024;

/// Number of zone size classes.
pub const NZONES: usize = 72;

/// Smallest chunk handed out by a zone.
pub const MIN_CHUNK: usize = 8;

/// The result of classifying a request.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct SizeClass {
    /// The request rounded up to the chunk size of its class.
    pub size: usize,
    /// Granularity of the band the class belongs to. Every chunk of the class is
    /// aligned to at least this many bytes.
    pub chunking: usize,
    /// Zero-based class index, `< NZONES`.
    pub index: usize,
}

/// Whether a request bypasses the zones and is mapped directly.
///
/// Exact page multiples beyond two pages would waste most of a zone's tail, so
/// they are mapped directly too.
pub fn is_large(size: usize) -> bool {
    size >= ZONE_LIMIT || (size % ZONE_PAGE == 0 && size > ZONE_PAGE * 2)
}

#[inline]
fn class(n: usize, chunking: usize, base: usize) -> SizeClass {
    let size = (n + chunking - 1) & !(chunking - 1);
    SizeClass {
        size,
        chunking,
        index: size / chunking + base,
    }
}

/// Classify a request of `size` bytes.
///
/// # Panics
///
/// Panics if `size >= ZONE_LIMIT`; those requests must be routed to the large
/// path before reaching the zones.
pub fn zone_index(size: usize) -> SizeClass {
    let n = size.max(1);
    if n < 128 {
        let size = (n + 7) & !7;
        return SizeClass {
            size,
            chunking: 8,
            index: size / 8 - 1,
        };
    }
    if n < 256 {
        return class(n, 16, 7);
    }
    if n < 512 {
        return class(n, 32, 15);
    }
    if n < 1024 {
        return class(n, 64, 23);
    }
    if n < 2048 {
        return class(n, 128, 31);
    }
    if n < 4096 {
        return class(n, 256, 39);
    }
    if n < 8192 {
        return class(n, 512, 47);
    }
    if n < ZONE_LIMIT {
        return class(n, 1024, 55);
    }
    panic!("{} bytes is too large for a zone", size);
}

/// The chunk size and chunking of class `index`.
///
/// Classes on a band edge report the chunking of the band their exact size
/// starts. This is the inverse of [`zone_index`]: `zone_index(class_size(i).0).index == i`.
pub fn class_size(index: usize) -> (usize, usize) {
    match index {
        0..=14 => ((index + 1) * 8, 8),
        15..=22 => ((index - 7) * 16, 16),
        23..=30 => ((index - 15) * 32, 32),
        31..=38 => ((index - 23) * 64, 64),
        39..=46 => ((index - 31) * 128, 128),
        47..=54 => ((index - 39) * 256, 256),
        55..=62 => ((index - 47) * 512, 512),
        63..=71 => ((index - 55) * 1024, 1024),
        _ => panic!("size class {} out of range", index),
    }
}
