use std::sync::Arc;
use std::time::Duration;

use hoard_store::ObjectStore;

use crate::config::ServerConfig;
use crate::transfer::PeerConnections;

/// State shared by every connection handler and transfer task.
#[derive(Debug)]
pub struct ServerContext {
    pub store: Arc<ObjectStore>,
    pub get_timeout: Duration,
    pub transfer_timeout: Duration,
    /// Longest a subscriber may leave a batch of notifications unread.
    pub write_timeout: Duration,
    pub peers: PeerConnections,
}

impl ServerContext {
    pub fn new(store: Arc<ObjectStore>, config: &ServerConfig) -> Self {
        Self {
            store,
            get_timeout: config.get_timeout(),
            transfer_timeout: config.transfer_timeout(),
            write_timeout: config.write_timeout(),
            peers: PeerConnections::default(),
        }
    }
}
