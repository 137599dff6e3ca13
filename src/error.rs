//! Error types for store operations.

use std::fmt;

/// Errors that can occur in the storage engine.
///
/// Contract violations (a second read queued on one disk session, I/O
/// submitted after a close was requested) are programmer errors and are
/// asserted against rather than surfaced here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreError {
    /// No disk slot or file could be allocated for a swap-out attempt.
    /// Terminal for that attempt; not retried.
    AllocationFailed,

    /// A read, write, open, or close failed in the disk backend.
    /// The disk session is abandoned and the entry falls back to
    /// memory-only or is released.
    DiskError,

    /// The disk ran out of space while committing an object.
    /// The owning swap directory marks itself full.
    NoSpaceLeft,

    /// The requested key is not present in any tier.
    NotFound,

    /// On-disk metadata or a swap log record failed validation.
    Corrupt,
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AllocationFailed => write!(f, "disk slot allocation failed"),
            Self::DiskError => write!(f, "disk I/O error"),
            Self::NoSpaceLeft => write!(f, "no space left on swap directory"),
            Self::NotFound => write!(f, "key not found"),
            Self::Corrupt => write!(f, "corrupt on-disk data"),
        }
    }
}

impl std::error::Error for StoreError {}

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;
