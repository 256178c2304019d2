//! Error types for surfacekit.

use crate::id::BufferId;
use thiserror::Error;

/// Result type alias using surfacekit's Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for surfacekit operations.
///
/// Every public operation reports failure through this type; internal helpers
/// (slot probing, plane calculation) signal absence with `Option` or zeroed
/// values instead.
#[derive(Error, Debug)]
pub enum Error {
    /// A required input was missing, zero-sized, out of range, or inconsistent.
    #[error("bad argument: {0}")]
    BadArgument(String),

    /// No buffer is known under the given id or token.
    #[error("not found: {0}")]
    NotFound(String),

    /// The caller is not the owning process, or presented a stale token.
    #[error("not allowed: {0}")]
    NotAllowed(String),

    /// The buffer lock is held by another thread.
    #[error("buffer is busy")]
    Busy,

    /// The calling thread already holds the buffer lock.
    #[error("buffer is already locked by this thread")]
    AlreadyLocked,

    /// Unlock was requested for a lock that is not held in that mode.
    #[error("buffer is not locked")]
    NotLocked,

    /// Unregistration was attempted while other references remain.
    #[error("buffer {id} is still in use (global use count {global_use})")]
    InUse {
        /// The buffer that could not be released.
        id: BufferId,
        /// Global use count observed at the time of the attempt.
        global_use: u32,
    },

    /// The buffer's contents were discarded while it was volatile.
    #[error("buffer contents were purged")]
    Purged,

    /// Another live registry entry already uses this id.
    #[error("buffer id {0} is already registered")]
    AlreadyRegistered(BufferId),

    /// Memory or table capacity was exhausted.
    #[error("out of memory: {0}")]
    OutOfMemory(String),

    /// A shared-memory region has an unexpected layout or header.
    #[error("invalid shared region: {0}")]
    InvalidRegion(String),

    /// System call error (via rustix).
    #[error("system error: {0}")]
    System(#[from] rustix::io::Errno),
}
