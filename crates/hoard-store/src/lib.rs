//! Shared-memory object storage for Hoard.
//!
//! This crate owns everything the server keeps about objects: the arena the
//! payloads live in, the allocator that carves it up, the object table that
//! tracks each object's lifecycle, and the seal notification fan-out.
//!
//! # Components
//!
//! - [`Arena`] -- the fixed-size, file-backed shared mapping
//! - [`Allocator`] -- first-fit free list with coalescing on release
//! - [`ObjectTable`] -- id → record map plus the LRU eviction queue
//! - [`SubscriberRegistry`] -- bounded per-subscriber notification queues
//! - [`ObjectStore`] -- the single store context tying them together
//!
//! # Design Rules
//!
//! 1. One coarse lock serializes every table, allocator and waiter mutation.
//! 2. A sealed object's bytes are never rewritten; only deletion or eviction
//!    hands its range back to the allocator.
//! 3. Objects with outstanding references are never evicted.
//! 4. Allocation failure is reported as `OutOfMemory`, never retried.
//! 5. Seal publishes notifications and wakes waiters in the same critical
//!    section as the state change.

pub mod alloc;
pub mod arena;
pub mod error;
pub mod notify;
pub mod store;
pub mod table;

pub use alloc::{AllocError, AllocResult, Allocator, ALIGNMENT};
pub use arena::Arena;
pub use error::{StoreError, StoreResult};
pub use notify::{NotificationStream, SubscriberRegistry};
pub use store::{
    default_arena_dir, ObjectStore, StoreConfig, StoreStats, DEFAULT_ARENA_SIZE,
    DEFAULT_NOTIFICATION_CAPACITY,
};
pub use table::{ObjectRecord, ObjectTable};
