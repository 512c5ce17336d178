//! Store server for Hoard.
//!
//! Accepts clients on a Unix socket and runs one session task per
//! connection against a single shared [`ObjectStore`](hoard_store::ObjectStore).
//! When a manager address is configured it also listens for objects pushed
//! by peer stores over TCP.

pub mod config;
pub mod context;
pub mod error;
pub mod server;
pub mod session;
pub mod transfer;

pub use config::ServerConfig;
pub use context::ServerContext;
pub use error::{ServerError, ServerResult};
pub use server::StoreServer;
