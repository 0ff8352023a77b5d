use thiserror::Error;

/// Errors surfaced across the public buffer-manager API.
///
/// `Restart` is intentionally absent from this enum: per the optimistic
/// concurrency protocol, a restart is normal control flow internal to a
/// single operation (resolve, allocate, eviction) and must never escape to
/// a caller. See [`crate::buffer::latch::Restart`].
#[derive(Error, Debug)]
pub enum BufferError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("device page id space exhausted: {0}")]
    DeviceExhausted(String),

    #[error("page {0} failed magic/checksum verification on read")]
    Corrupt(u64),

    #[error("fatal invariant violation: {0}")]
    Fatal(String),
}

pub type Result<T> = std::result::Result<T, BufferError>;
