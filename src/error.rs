//! Errors reported by the allocator, and the fatal path for heap corruption.

use core::fmt;

use errno::Errno;

/// An allocation request that could not be satisfied.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AllocError {
    /// The backing store refused to map more memory.
    OutOfMemory,
    /// The alignment was not a power of two, or smaller than a pointer.
    InvalidArgument,
}

impl AllocError {
    /// The C `errno` value for this error.
    pub fn errno(self) -> i32 {
        match self {
            AllocError::OutOfMemory => libc::ENOMEM,
            AllocError::InvalidArgument => libc::EINVAL,
        }
    }
}

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllocError::OutOfMemory => write!(f, "out of memory"),
            AllocError::InvalidArgument => write!(f, "invalid alignment"),
        }
    }
}

impl std::error::Error for AllocError {}

/// A backing store failed to map memory.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MapError {
    /// The OS refused the mapping.
    Os(Errno),
    /// The store's own budget is spent.
    Exhausted,
}

impl fmt::Display for MapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MapError::Os(e) => write!(f, "mmap failed: {}", e),
            MapError::Exhausted => write!(f, "backing store budget exhausted"),
        }
    }
}

impl std::error::Error for MapError {}

impl From<MapError> for AllocError {
    fn from(_: MapError) -> Self {
        AllocError::OutOfMemory
    }
}

/// Report heap corruption and abort.
///
/// Nothing here may allocate: the heap is in an unknown state. The message and
/// the offending address are written straight to stderr.
#[cold]
pub(crate) fn fatal(msg: &str, addr: usize) -> ! {
    let addr = addr as u64;
    let mut buf = [0u8; 2 + 16];
    buf[0] = b'0';
    buf[1] = b'x';
    for (i, b) in buf[2..].iter_mut().enumerate() {
        let nibble = (addr >> ((15 - i) * 4)) & 0xf;
        *b = b"0123456789abcdef"[nibble as usize];
    }

    let parts: [&[u8]; 5] = [b"zonealloc: ", msg.as_bytes(), b" at ", &buf, b"\n"];
    for part in parts.iter() {
        unsafe {
            libc::write(2, part.as_ptr() as *const libc::c_void, part.len());
        }
    }
    std::process::abort()
}

#[cfg(test)]
mod tests {
    use super::*;

    use test_log::test;

    #[test]
    fn test_errno_codes() {
        assert_eq!(AllocError::OutOfMemory.errno(), libc::ENOMEM);
        assert_eq!(AllocError::InvalidArgument.errno(), libc::EINVAL);
        let err: AllocError = MapError::Os(Errno(libc::ENOMEM)).into();
        assert_eq!(err, AllocError::OutOfMemory);
        assert_eq!(AllocError::from(MapError::Exhausted), AllocError::OutOfMemory);
    }

    #[test]
    fn test_display() {
        assert_eq!(AllocError::OutOfMemory.to_string(), "out of memory");
        assert_eq!(
            MapError::Exhausted.to_string(),
            "backing store budget exhausted"
        );
    }
}
