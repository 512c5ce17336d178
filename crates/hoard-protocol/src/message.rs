use std::fmt;
use std::net::IpAddr;

use hoard_types::{ObjectHandle, ObjectId};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::ProtocolResult;

pub const PROTOCOL_VERSION: u32 = 1;
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// A message that can be carried in a frame.
pub trait Message: Serialize + DeserializeOwned {
    /// One-byte tag written in front of the payload.
    fn type_tag(&self) -> u8;

    fn type_name(&self) -> &'static str;
}

/// Client to server requests.
///
/// Object ids travel as raw byte strings and are validated on arrival so
/// that a wrong length is reported as [`ErrorCode::InvalidId`] rather than
/// as a decoding failure.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Request {
    Connect { version: u32 },
    Create { id: Vec<u8>, data_size: u64, metadata: Vec<u8> },
    /// `timeout_ms: None` uses the server default; `Some(0)` never waits.
    Get { id: Vec<u8>, timeout_ms: Option<u64> },
    Contains { id: Vec<u8> },
    Seal { id: Vec<u8> },
    Release { id: Vec<u8> },
    Delete { id: Vec<u8> },
    Subscribe,
    Transfer { addr: IpAddr, port: u16, id: Vec<u8> },
}

/// Server to client responses.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Response {
    Connected { version: u32, arena_path: String, arena_size: u64 },
    Created(ObjectHandle),
    Object(ObjectHandle),
    Contains { present: bool, sealed: bool },
    Ok,
    Subscribed,
    Error { code: ErrorCode, message: String },
}

impl Response {
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Error {
            code,
            message: message.into(),
        }
    }
}

/// Status codes carried in [`Response::Error`] and in transfer
/// acknowledgements. Zero is reserved for success on the transfer stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ErrorCode {
    InvalidId = 1,
    ObjectExists = 2,
    NotFound = 3,
    AlreadySealed = 4,
    NotSealed = 5,
    StillReferenced = 6,
    NotReferenced = 7,
    OutOfMemory = 8,
    Timeout = 9,
    ConnectionError = 10,
    Protocol = 11,
    Internal = 12,
}

impl ErrorCode {
    pub const ALL: [ErrorCode; 12] = [
        Self::InvalidId,
        Self::ObjectExists,
        Self::NotFound,
        Self::AlreadySealed,
        Self::NotSealed,
        Self::StillReferenced,
        Self::NotReferenced,
        Self::OutOfMemory,
        Self::Timeout,
        Self::ConnectionError,
        Self::Protocol,
        Self::Internal,
    ];

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.as_u8() == value)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::InvalidId => "invalid-id",
            Self::ObjectExists => "object-exists",
            Self::NotFound => "not-found",
            Self::AlreadySealed => "already-sealed",
            Self::NotSealed => "not-sealed",
            Self::StillReferenced => "still-referenced",
            Self::NotReferenced => "not-referenced",
            Self::OutOfMemory => "out-of-memory",
            Self::Timeout => "timeout",
            Self::ConnectionError => "connection-error",
            Self::Protocol => "protocol",
            Self::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Validate a raw id from the wire.
pub fn parse_id(raw: &[u8]) -> ProtocolResult<ObjectId> {
    Ok(ObjectId::from_slice(raw)?)
}

impl Message for Request {
    fn type_tag(&self) -> u8 {
        match self {
            Self::Connect { .. } => 1,
            Self::Create { .. } => 2,
            Self::Get { .. } => 3,
            Self::Contains { .. } => 4,
            Self::Seal { .. } => 5,
            Self::Release { .. } => 6,
            Self::Delete { .. } => 7,
            Self::Subscribe => 8,
            Self::Transfer { .. } => 9,
        }
    }

    fn type_name(&self) -> &'static str {
        match self {
            Self::Connect { .. } => "Connect",
            Self::Create { .. } => "Create",
            Self::Get { .. } => "Get",
            Self::Contains { .. } => "Contains",
            Self::Seal { .. } => "Seal",
            Self::Release { .. } => "Release",
            Self::Delete { .. } => "Delete",
            Self::Subscribe => "Subscribe",
            Self::Transfer { .. } => "Transfer",
        }
    }
}

impl Message for Response {
    fn type_tag(&self) -> u8 {
        match self {
            Self::Connected { .. } => 129,
            Self::Created(_) => 130,
            Self::Object(_) => 131,
            Self::Contains { .. } => 132,
            Self::Ok => 133,
            Self::Subscribed => 134,
            Self::Error { .. } => 255,
        }
    }

    fn type_name(&self) -> &'static str {
        match self {
            Self::Connected { .. } => "Connected",
            Self::Created(_) => "Created",
            Self::Object(_) => "Object",
            Self::Contains { .. } => "Contains",
            Self::Ok => "Ok",
            Self::Subscribed => "Subscribed",
            Self::Error { .. } => "Error",
        }
    }
}
