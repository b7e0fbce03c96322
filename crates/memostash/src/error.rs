use std::io;

use thiserror::Error;

/// Shorthand for results produced throughout this crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The error taxonomy of the memoization pipeline.
///
/// Only configuration and lifecycle misuse surface synchronously from the
/// call site. Per-key computation failures are captured by the worker that
/// ran them and reported through [`status`](crate::Memoized::status) and
/// [`wait`](crate::Memoized::wait) instead, so one bad key never aborts
/// other queued or in-flight work.
#[derive(Debug, Error)]
pub enum Error {
    /// No committed entry exists for the requested key.
    ///
    /// This is an internal miss signal: default-mode calls convert it into
    /// [`Outcome::Pending`](crate::Outcome::Pending) and never raise it.
    #[error("not found")]
    NotFound,

    /// A committed entry exists but could not be deserialized.
    ///
    /// This is surfaced rather than treated as a miss, as silently
    /// recomputing would mask storage corruption.
    #[error("corrupt cache entry: {0}")]
    Corrupt(String),

    /// Invalid configuration, such as a bad pool sizing or a refused
    /// overwrite.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A lifecycle method was invoked out of order, such as starting an
    /// already-running pool.
    #[error("invalid lifecycle state: {0}")]
    State(String),

    /// The wrapped computation panicked.
    ///
    /// Captured per key by the worker that ran it; the pool keeps running.
    #[error("computation failed: {0}")]
    Compute(String),

    /// The type is already routed through an instance cache.
    ///
    /// Caching the same constructor twice would make the recorded key
    /// ambiguous between the two identities. Introduce a dedicated wrapper
    /// type with its own registration instead.
    #[error("`{0}` is already registered with an instance cache")]
    AlreadyRegistered(String),

    /// A value could not be serialized.
    #[error("serialization failed: {0}")]
    Serializer(String),

    /// An underlying filesystem operation failed.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// Whether this is the internal miss signal.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound)
    }
}
