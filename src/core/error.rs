//! Error types for the object cache

use thiserror::Error;

/// Main error type for the cache
#[derive(Debug, Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Format error: {0}")]
    Format(String),

    #[error("Corrupt cache record: {0}")]
    CorruptRecord(#[from] RecordError),

    #[error("Cache id mismatch for region {region}")]
    CacheIdMismatch { region: String },

    #[error("Material override error: {0}")]
    Material(#[from] MaterialError),

    #[error("Settings error: {0}")]
    Settings(String),

    #[error("Object cache is read-only")]
    ReadOnly,
}

/// Why a single on-disk entry record was rejected
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RecordError {
    #[error("record header truncated")]
    TruncatedHeader,

    #[error("payload size {0} outside (0, {max}]", max = crate::entry::MAX_PAYLOAD_SIZE)]
    BadPayloadSize(u32),

    #[error("record has a null local id")]
    NullLocalId,

    #[error("payload truncated: expected {expected} bytes, got {got}")]
    TruncatedPayload { expected: usize, got: usize },
}

/// Why a serialized material override was rejected as a whole
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MaterialError {
    #[error("missing field `{0}`")]
    MissingField(&'static str),

    #[error("invalid face lists for local id {0}")]
    InvalidSides(u32),
}
