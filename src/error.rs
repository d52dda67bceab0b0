//! Crate-wide error type for Rampart's *recoverable* failure paths.
//!
//! Fatal conditions (double free, canary corruption, invalid free,
//! ...) never appear here: they go through [`fatal`] and abort the
//! process directly, matching the two-tier error model described in
//! the design this crate implements (safety violations are attacks or
//! latent bugs; resource exhaustion is a normal outcome).
use std::fmt;

/// Recoverable allocator failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// A metadata array, the region table, or the page provider
    /// itself ran out of room.
    OutOfMemory,
    /// `posix_memalign`/`aligned_alloc` received a bad alignment.
    InvalidAlignment,
    /// `calloc`'s `count * size` overflowed `usize`.
    SizeOverflow,
    /// The page provider reported this raw errno.
    Provider(i32),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::OutOfMemory => write!(f, "out of memory"),
            Error::InvalidAlignment => write!(f, "invalid alignment"),
            Error::SizeOverflow => write!(f, "size overflow"),
            Error::Provider(errno) => write!(f, "page provider failed (errno {})", errno),
        }
    }
}

impl std::error::Error for Error {}

impl From<i32> for Error {
    fn from(errno: i32) -> Self {
        Error::Provider(errno)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Aborts the process after logging full context about a broken
/// safety invariant.
///
/// This is the only way fatal conditions are reported: there is no
/// `Result` path for them, by design. Every call site should pass
/// enough context to reconstruct what went wrong from the log line
/// alone.
#[cold]
#[inline(never)]
pub(crate) fn fatal(reason: &str) -> ! {
    log::error!("rampart: fatal: {}", reason);
    // `log` may have no installed backend (this crate never installs
    // one itself); make sure the diagnostic reaches somewhere even
    // then.
    eprintln!("rampart: fatal: {}", reason);
    std::process::abort();
}
