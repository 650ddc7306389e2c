//! Error types for the one part of this allocator that can fail
//! without the process's memory being corrupt: virtual memory
//! reservation.  Everything else that would normally be an "error" is
//! instead an invariant violation, and goes through `fatal!` below.
use std::fmt;

/// A failed call into the OS's virtual memory primitives.
#[derive(Debug, Clone, Copy)]
pub struct VmError {
    pub(crate) call: &'static str,
    pub(crate) errno: i32,
}

impl VmError {
    pub(crate) fn new(call: &'static str) -> Self {
        VmError {
            call,
            errno: unsafe { *libc::__errno_location() },
        }
    }
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} failed, errno {}", self.call, self.errno)
    }
}

impl std::error::Error for VmError {}

/// The one heap-level error this allocator can propagate instead of
/// aborting: the OS refused to hand us more address space before we
/// mutated any shared state.
#[derive(Debug)]
pub enum HeapError {
    Reservation(VmError),
}

impl fmt::Display for HeapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HeapError::Reservation(e) => write!(f, "heap reservation failed: {}", e),
        }
    }
}

impl std::error::Error for HeapError {}

impl From<VmError> for HeapError {
    fn from(e: VmError) -> Self {
        HeapError::Reservation(e)
    }
}

/// Logs `$($arg)*` at `error` level, then aborts the process.  Used
/// for every invariant this allocator cannot recover from: a
/// corrupted boundary tag, a double free caught by the debug maps, an
/// address that does not belong to any known chunk.
macro_rules! fatal {
    ($($arg:tt)*) => {{
        log::error!($($arg)*);
        std::process::abort();
    }};
}

pub(crate) use fatal;
