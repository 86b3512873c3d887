//! Errors reported by `pagecarve`'s public entry points.
//!
//! The core never panics on a caller-visible failure: contract
//! violations and resource exhaustion are always returned as `Error`,
//! reserving `panic!`/`expect` for violations of this crate's own
//! bookkeeping invariants.
use std::sync::Mutex;

/// The three kinds of failure this crate can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// A contract violation: bad address, bad flag combination,
    /// unaligned pointer, a `remap` range that doesn't correspond
    /// exactly to an allocated entry, an unsupported middle-trim, etc.
    InvalidArgument,
    /// No free block of sufficient order exists.
    OutOfMemory,
    /// Unable to acquire the initial chunk, or to allocate the
    /// bookkeeping tables backing it.
    EnvironmentFailure,
}

lazy_static::lazy_static! {
    // Process-wide, mirroring errno's single-slot, last-write-wins shape.
    static ref LAST_ERROR: Mutex<Option<Error>> = Mutex::new(None);
}

/// Records `err` as the most recent failure. Called by every fallible
/// public entry point right before it returns `Err`.
pub(crate) fn set_last_error(err: Error) {
    *LAST_ERROR.lock().unwrap() = Some(err);
}

/// Returns the most recently recorded failure, if any.
///
/// Exposed so C callers (who only get a sentinel return value) can
/// recover the reason, the same way callers fall back to `errno`.
pub fn last_error() -> Option<Error> {
    *LAST_ERROR.lock().unwrap()
}

impl Error {
    /// A small, stable numeric encoding for the `extern "C"` boundary.
    /// Values loosely track the POSIX errno this condition would map
    /// to (`EINVAL`, `ENOMEM`), without depending on libc's constants.
    pub fn as_raw(self) -> i32 {
        match self {
            Error::InvalidArgument => 22,
            Error::OutOfMemory => 12,
            Error::EnvironmentFailure => 19,
        }
    }
}

/// Convenience: record `err` and return it, for use at the tail of a
/// fallible function (`return fail(Error::InvalidArgument)`).
pub(crate) fn fail<T>(err: Error) -> Result<T, Error> {
    set_last_error(err);
    Err(err)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn records_last_error() {
        set_last_error(Error::OutOfMemory);
        assert_eq!(last_error(), Some(Error::OutOfMemory));
        set_last_error(Error::InvalidArgument);
        assert_eq!(last_error(), Some(Error::InvalidArgument));
    }
}
