//! Error taxonomy for the whole crate.
//!
//! Limiters return `Ok(bool)` for the accept/reject decision and only error
//! on storage failures. Queues signal `Full` and `Stopped` distinctly so
//! callers can tell structural rejection from shutdown.

/// Crate-wide error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Transient storage failure (connection refused, timeout, server busy).
    /// Safe to retry with backoff.
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    /// Permanent storage failure: malformed data under a key, a broken
    /// script, a type mismatch. Retrying will not help.
    #[error("storage data corrupt: {0}")]
    StorageCorrupt(String),

    /// The storage backend cannot run server-side scripts.
    #[error("scripting not supported by this storage backend")]
    ScriptsUnsupported,

    /// `put` on a queue that is at `max_size`.
    #[error("queue is full")]
    QueueFull,

    /// Operation on a queue that is draining or stopped.
    #[error("queue is stopped")]
    QueueStopped,

    /// A limiter denied the request and the caller asked for fail-fast.
    #[error("rate limited")]
    Rejected,

    /// Caller-initiated abort, or the other side of a completion handle
    /// went away before producing a result.
    #[error("operation cancelled")]
    Cancelled,

    /// Fast rejection while a circuit breaker is open.
    #[error("circuit breaker is open")]
    CircuitOpen,

    /// A retry budget ran out; carries the last underlying error.
    #[error("retries exhausted after {attempts} attempts: {source}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: Box<Error>,
    },

    /// A submitted task or handler failed.
    #[error("task failed: {0}")]
    Task(String),
}

impl From<redis::RedisError> for Error {
    fn from(err: redis::RedisError) -> Self {
        // IO-level and server-busy failures are worth retrying; everything
        // else (parse errors, script errors, type errors) is permanent.
        if err.is_io_error() || err.is_timeout() || err.is_connection_refusal() {
            Error::StorageUnavailable(err.to_string())
        } else {
            Error::StorageCorrupt(err.to_string())
        }
    }
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;
