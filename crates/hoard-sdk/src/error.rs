use hoard_protocol::{ErrorCode, ProtocolError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SdkError {
    /// The store answered with an error status.
    #[error("{code}: {message}")]
    Remote { code: ErrorCode, message: String },

    #[error("unexpected response: {0}")]
    UnexpectedResponse(&'static str),

    #[error("store closed the connection")]
    Disconnected,

    #[error("arena mismatch: expected {expected} bytes, mapped {actual}")]
    ArenaMismatch { expected: u64, actual: u64 },

    #[error("region {offset}+{len} out of bounds")]
    OutOfBounds { offset: u64, len: u64 },

    #[error("region at offset {0} is read-only")]
    ReadOnly(u64),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type SdkResult<T> = Result<T, SdkError>;

impl SdkError {
    /// The store's status code, for errors the store reported.
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            Self::Remote { code, .. } => Some(*code),
            _ => None,
        }
    }
}
