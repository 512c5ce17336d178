//! Client library for the Hoard object store.
//!
//! A [`StoreClient`] speaks the request protocol over the store's Unix
//! socket and maps the store's arena file, so object bytes are written and
//! read in place rather than copied through the socket.

pub mod client;
pub mod error;
pub mod notifications;

pub use client::StoreClient;
pub use error::{SdkError, SdkResult};
pub use notifications::Notifications;

pub use hoard_protocol::ErrorCode;
pub use hoard_types::{MappedRegion, ObjectHandle, ObjectId, ObjectState};
