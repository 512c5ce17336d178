//! Foundation types for the Hoard shared-memory object store.
//!
//! Every other Hoard crate depends on `hoard-types`. The types here are the
//! vocabulary shared by the server, the wire protocol, and clients.
//!
//! # Key Types
//!
//! - [`ObjectId`]: fixed 20-byte opaque key for a stored object
//! - [`ObjectState`]: lifecycle of an object (`Created` → `Sealed`)
//! - [`MappedRegion`]: offset/length capability into the shared arena
//! - [`ObjectHandle`]: the data and metadata regions of one object

pub mod error;
pub mod handle;
pub mod object;

pub use error::TypeError;
pub use handle::{MappedRegion, ObjectHandle};
pub use object::{ObjectId, ObjectState, OBJECT_ID_SIZE};
