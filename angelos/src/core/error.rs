use thiserror::Error;

/// Core error type for the angelos task dispatch engine.
///
/// Wraps `serde_json` failures with `#[source]` so the chain stays
/// intact for callers that walk it.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Serialization failed when encoding a value to JSON.
    #[error("serialization failed: {0}")]
    Serialization(#[source] serde_json::Error),

    /// Deserialization failed when decoding JSON to a value.
    #[error("deserialization failed: {0}")]
    Deserialization(#[source] serde_json::Error),

    /// An unknown task state string was encountered during parsing.
    #[error("invalid task state: {0}")]
    InvalidState(String),
}

pub type CoreError = Error;

pub type Result<T> = std::result::Result<T, Error>;
