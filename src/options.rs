//! Tuning flags, read once when a heap is created.

/// Allocator tuning.
///
/// ```
/// use zonealloc::Options;
///
/// let opts = Options::DEFAULT.zero_all(true).retention(0);
/// assert!(opts.zero_all);
/// assert!(opts.thread_cache);
/// ```
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Options {
    /// Log every allocator operation at `trace` level.
    pub trace: bool,
    /// Zero every allocation, not just `allocate_zeroed`.
    pub zero_all: bool,
    /// Cache freed chunks in per-thread magazines.
    pub thread_cache: bool,
    /// How much freed memory to keep around. The zone cache and each depot hold
    /// up to `4 * retention` entries; 0 returns everything as soon as possible.
    pub retention: usize,
}

impl Options {
    pub const DEFAULT: Options = Options {
        trace: false,
        zero_all: false,
        thread_cache: true,
        retention: 2,
    };

    pub const fn trace(mut self, on: bool) -> Self {
        self.trace = on;
        self
    }

    pub const fn zero_all(mut self, on: bool) -> Self {
        self.zero_all = on;
        self
    }

    pub const fn thread_cache(mut self, on: bool) -> Self {
        self.thread_cache = on;
        self
    }

    pub const fn retention(mut self, retention: usize) -> Self {
        self.retention = retention;
        self
    }

    /// Upper bound on cached zones, full magazines and empty magazines.
    pub(crate) fn retained(&self) -> usize {
        self.retention.saturating_mul(4)
    }
}

impl Default for Options {
    fn default() -> Self {
        Options::DEFAULT
    }
}
