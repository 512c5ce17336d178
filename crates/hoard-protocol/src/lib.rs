//! Wire protocol for the Hoard object store.
//!
//! Three byte formats travel between processes:
//!
//! - request/response frames on the local client socket ([`FrameCodec`],
//!   [`FrameReader`])
//! - fixed 20-byte object id records on a subscribed connection
//!   ([`stream`])
//! - the object stream between two stores ([`TransferHeader`])
//!
//! Payload bytes never travel in frames; clients read and write them through
//! their own mapping of the arena.

pub mod codec;
pub mod error;
pub mod message;
pub mod stream;
pub mod transfer;

pub use codec::{write_message, FrameCodec, FrameReader};
pub use error::{ProtocolError, ProtocolResult};
pub use message::{
    parse_id, ErrorCode, Message, Request, Response, MAX_MESSAGE_SIZE, PROTOCOL_VERSION,
};
pub use stream::{read_notification, write_notification, NOTIFICATION_LEN};
pub use transfer::{
    ack_byte, parse_ack, read_ack, write_ack, TransferHeader, ACK_OK, TRANSFER_HEADER_LEN,
};
