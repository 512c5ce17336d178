use hoard_types::TypeError;
use thiserror::Error;

/// Errors from encoding, decoding or moving Hoard frames.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The tag byte does not match the decoded message.
    #[error("frame tagged {found} carries a message tagged {expected}")]
    TagMismatch { expected: u8, found: u8 },

    #[error("frame of {size} bytes exceeds the {max}-byte limit")]
    MessageTooLarge { size: usize, max: usize },

    /// Truncated or otherwise malformed framing.
    #[error("malformed frame: {0}")]
    Framing(String),

    #[error("client speaks protocol version {remote}, server speaks {local}")]
    VersionMismatch { local: u32, remote: u32 },

    #[error("cannot encode message: {0}")]
    Encode(String),

    /// The frame was intact but its payload did not decode.
    #[error("cannot decode message: {0}")]
    Decode(String),

    #[error("invalid object id: {0}")]
    InvalidId(#[from] TypeError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type ProtocolResult<T> = Result<T, ProtocolError>;
