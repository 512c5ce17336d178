use hoard_types::{ObjectId, TypeError};

use crate::alloc::AllocError;

/// Errors from object store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The caller supplied a malformed object id.
    #[error("invalid object id: {0}")]
    InvalidId(#[from] TypeError),

    /// A live object with this id already exists.
    #[error("object already exists: {0}")]
    ObjectExists(ObjectId),

    /// No live object with this id.
    #[error("object not found: {0}")]
    NotFound(ObjectId),

    /// The object was sealed before.
    #[error("object already sealed: {0}")]
    AlreadySealed(ObjectId),

    /// The object is being filled by an inbound transfer.
    #[error("object is still being received: {0}")]
    Receiving(ObjectId),

    /// The operation needs a sealed object.
    #[error("object not sealed: {0}")]
    NotSealed(ObjectId),

    /// Delete refused because the object is still mapped by clients.
    #[error("object {id} still referenced ({ref_count} references)")]
    StillReferenced { id: ObjectId, ref_count: u32 },

    /// Release without a matching get.
    #[error("object not referenced: {0}")]
    NotReferenced(ObjectId),

    /// Neither free space nor eviction could satisfy the request.
    #[error("out of memory: requested {requested} bytes, {free} of {capacity} free")]
    OutOfMemory {
        requested: u64,
        free: u64,
        capacity: u64,
    },

    /// A blocking get gave up before the object was sealed.
    #[error("timed out waiting for {0} to be sealed")]
    Timeout(ObjectId),

    /// A region access fell outside the arena or the target region.
    #[error("region {offset}+{len} out of bounds")]
    OutOfBounds { offset: u64, len: u64 },

    /// Free-list bookkeeping was violated.
    #[error("allocator error: {0}")]
    Alloc(#[from] AllocError),

    /// I/O error creating or mapping the arena.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;
