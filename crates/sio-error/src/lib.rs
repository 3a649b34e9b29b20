#![forbid(unsafe_code)]
//! Error types for the storage I/O core.
//!
//! # Error Taxonomy
//!
//! Every crate in the workspace returns [`SioError`]. There is no
//! crate-private error type that leaks through a public signature; the
//! scheduler, the allocator, the tree store and the journal all speak the
//! same vocabulary so callers can route on variants without conversion.
//!
//! | Variant | Raised by | errno |
//! |---------|-----------|-------|
//! | `InvalidArgument` | priority above 31, zero-length allocation, malformed request | `EINVAL` |
//! | `AlreadyExists` | `stream_open` on an id that is open or still draining | `EEXIST` |
//! | `NotFound` | unknown stream, commit or object | `ENOENT` |
//! | `Interrupted` | a `Cx` checkpoint tripped mid-operation | `EINTR` |
//! | `Canceled` | scheduler shutdown in progress, dequeue on a stopped scheduler | `ECANCELED` |
//! | `ShouldWait` | non-blocking dequeue with nothing ready | `EAGAIN` |
//! | `BadState` | API called in the wrong scheduler state | `EBUSY` |
//! | `NoSpace` | allocator exhausted and growth refused | `ENOSPC` |
//! | `OutOfRange` | bit index past the end of the pool | `ERANGE` |
//! | `Corruption` | bad allocator metadata, double free | `EIO` |
//! | `Internal` | invariant violation, cancelled merge | `EIO` |
//! | `Io` | underlying device failure | raw os error or `EIO` |
//!
//! ## Propagation
//!
//! Nothing in the core retries. A recoverable "not yet" condition
//! (`ShouldWait`) is an ordinary return value; I/O failures travel up
//! unchanged for the filesystem layer to decide on retry or backoff.

use thiserror::Error;

/// Unified error type for all storage I/O core operations.
#[derive(Debug, Error)]
pub enum SioError {
    /// Operating system I/O error (wraps `std::io::Error`).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Caller passed a value outside the accepted domain.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Identifier is already in use.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Stream, commit, key or object not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Operation was interrupted through its cancellation context.
    #[error("operation interrupted")]
    Interrupted,

    /// Scheduler is shutting down or stopped.
    #[error("operation canceled")]
    Canceled,

    /// Nothing is ready and the caller asked not to block.
    #[error("no operation ready")]
    ShouldWait,

    /// API used in a state that does not allow it.
    #[error("bad state: {0}")]
    BadState(String),

    /// Pool exhausted and could not be grown.
    #[error("no space left in pool")]
    NoSpace,

    /// Allocation unit index outside the pool.
    #[error("unit {index} out of range (pool size {total})")]
    OutOfRange { index: u64, total: u64 },

    /// Persisted allocator state is inconsistent.
    #[error("corrupt allocator state at unit {unit}: {detail}")]
    Corruption { unit: u64, detail: String },

    /// Unexpected invariant violation.
    #[error("internal error: {0}")]
    Internal(String),
}

impl SioError {
    /// Convert this error into a POSIX errno.
    ///
    /// The mapping is exhaustive, so adding a variant is a compile error
    /// until its errno is assigned.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::InvalidArgument(_) => libc::EINVAL,
            Self::AlreadyExists(_) => libc::EEXIST,
            Self::NotFound(_) => libc::ENOENT,
            Self::Interrupted => libc::EINTR,
            Self::Canceled => libc::ECANCELED,
            Self::ShouldWait => libc::EAGAIN,
            Self::BadState(_) => libc::EBUSY,
            Self::NoSpace => libc::ENOSPC,
            Self::OutOfRange { .. } => libc::ERANGE,
            Self::Corruption { .. } | Self::Internal(_) => libc::EIO,
        }
    }

    /// Whether the error only means "try again later".
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::ShouldWait | Self::Interrupted)
    }
}

/// Result alias using `SioError`.
pub type Result<T> = std::result::Result<T, SioError>;
