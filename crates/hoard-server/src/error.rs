use hoard_protocol::{ErrorCode, ProtocolError};
use hoard_store::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("transfer failed ({code}): {reason}")]
    Transfer { code: ErrorCode, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type ServerResult<T> = Result<T, ServerError>;

impl ServerError {
    pub fn transfer(code: ErrorCode, reason: impl Into<String>) -> Self {
        Self::Transfer {
            code,
            reason: reason.into(),
        }
    }

    /// The status reported to a client for this failure.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Store(e) => store_error_code(e),
            Self::Protocol(e) => protocol_error_code(e),
            Self::Transfer { code, .. } => *code,
            Self::Io(_) => ErrorCode::ConnectionError,
            Self::Config(_) => ErrorCode::Internal,
        }
    }
}

pub fn store_error_code(err: &StoreError) -> ErrorCode {
    match err {
        StoreError::InvalidId(_) => ErrorCode::InvalidId,
        StoreError::ObjectExists(_) => ErrorCode::ObjectExists,
        StoreError::NotFound(_) => ErrorCode::NotFound,
        StoreError::AlreadySealed(_) => ErrorCode::AlreadySealed,
        StoreError::NotSealed(_) => ErrorCode::NotSealed,
        // The receiving transfer holds the object until it seals or aborts.
        StoreError::StillReferenced { .. } | StoreError::Receiving(_) => {
            ErrorCode::StillReferenced
        }
        StoreError::NotReferenced(_) => ErrorCode::NotReferenced,
        StoreError::OutOfMemory { .. } => ErrorCode::OutOfMemory,
        StoreError::Timeout(_) => ErrorCode::Timeout,
        StoreError::OutOfBounds { .. } => ErrorCode::Protocol,
        StoreError::Alloc(_) | StoreError::Io(_) => ErrorCode::Internal,
    }
}

pub fn protocol_error_code(err: &ProtocolError) -> ErrorCode {
    match err {
        ProtocolError::InvalidId(_) => ErrorCode::InvalidId,
        ProtocolError::Io(_) => ErrorCode::ConnectionError,
        _ => ErrorCode::Protocol,
    }
}
