use crate::core::CoreError;
use thiserror::Error;

/// Storage layer error type for the angelos task dispatch engine.
///
/// Infrastructure failures are split by component so callers can tell a
/// broker outage from a result-store outage.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StorageError {
    /// The message channel could not accept or hand out a message.
    #[error("message channel unavailable: {0}")]
    ChannelUnavailable(String),

    /// The result store could not be read or written.
    #[error("result store unavailable: {0}")]
    StoreUnavailable(String),

    /// A message pulled from the channel could not be decoded.
    #[error("malformed message: {0}")]
    MalformedMessage(String),

    /// A core serialization or deserialization error occurred.
    #[error("core error: {0}")]
    Core(#[from] CoreError),

    /// A caller passed a value the backend cannot represent.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// An acknowledgement referenced a delivery the channel does not track.
    #[error("unknown delivery: {0}")]
    UnknownDelivery(String),
}

pub type Result<T> = std::result::Result<T, StorageError>;
