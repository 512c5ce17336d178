use std::future::Future;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use hoard_store::ObjectStore;
use tokio::net::{TcpListener, UnixListener};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::config::ServerConfig;
use crate::context::ServerContext;
use crate::error::ServerResult;
use crate::session::serve_connection;
use crate::transfer::serve_transfers;

/// A bound, ready-to-run store server.
///
/// Binding creates the arena and both listeners, so a successfully bound
/// server can report its socket and transfer addresses before `run`.
pub struct StoreServer {
    config: ServerConfig,
    ctx: Arc<ServerContext>,
    listener: UnixListener,
    transfer_listener: Option<TcpListener>,
}

impl StoreServer {
    pub async fn bind(config: ServerConfig) -> ServerResult<Self> {
        config.validate()?;
        let store = Arc::new(ObjectStore::open(&config.store_config())?);
        let ctx = Arc::new(ServerContext::new(store, &config));

        // A socket file left behind by a previous run blocks the bind.
        if config.socket_path.exists() {
            warn!(path = %config.socket_path.display(), "removing stale socket");
            std::fs::remove_file(&config.socket_path)?;
        }
        let listener = UnixListener::bind(&config.socket_path)?;

        let transfer_listener = match config.transfer_addr() {
            Some(addr) => Some(TcpListener::bind(addr).await?),
            None => None,
        };

        info!(
            socket = %config.socket_path.display(),
            arena = %ctx.store.arena_path().display(),
            arena_size = config.arena_size,
            "store server bound"
        );
        Ok(Self {
            config,
            ctx,
            listener,
            transfer_listener,
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<ObjectStore> {
        &self.ctx.store
    }

    pub fn socket_path(&self) -> &Path {
        &self.config.socket_path
    }

    /// Bound address of the transfer listener, if one is running.
    pub fn transfer_addr(&self) -> Option<SocketAddr> {
        self.transfer_listener
            .as_ref()
            .and_then(|l| l.local_addr().ok())
    }

    /// Serve until the process is killed.
    pub async fn run(self) -> ServerResult<()> {
        self.run_until(std::future::pending()).await
    }

    /// Serve until `shutdown` completes, then close every connection and
    /// remove the socket file.
    pub async fn run_until<F>(self, shutdown: F) -> ServerResult<()>
    where
        F: Future<Output = ()>,
    {
        let limiter = Arc::new(Semaphore::new(self.config.max_connections));
        let mut sessions = JoinSet::new();

        let transfers = self.transfer_listener.map(|listener| {
            if let Ok(addr) = listener.local_addr() {
                info!(addr = %addr, "transfer listener started");
            }
            tokio::spawn(serve_transfers(listener, Arc::clone(&self.ctx)))
        });

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                Some(_) = sessions.join_next(), if !sessions.is_empty() => {}
                accepted = self.listener.accept() => {
                    let stream = match accepted {
                        Ok((stream, _)) => stream,
                        Err(e) => {
                            warn!(error = %e, "accept failed");
                            continue;
                        }
                    };
                    let Ok(permit) = Arc::clone(&limiter).try_acquire_owned() else {
                        warn!(limit = self.config.max_connections, "connection limit reached, refusing client");
                        continue;
                    };
                    let ctx = Arc::clone(&self.ctx);
                    sessions.spawn(async move {
                        serve_connection(stream, ctx).await;
                        drop(permit);
                    });
                }
            }
        }

        info!("store server shutting down");
        if let Some(task) = transfers {
            task.abort();
            // Dropping the listener task aborts its transfer connections.
            let _ = task.await;
        }
        sessions.shutdown().await;
        if let Err(e) = std::fs::remove_file(&self.config.socket_path) {
            warn!(error = %e, "failed to remove socket file");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use hoard_protocol::{write_message, FrameReader, Request, Response};
    use tokio::net::UnixStream;

    fn config(dir: &tempfile::TempDir) -> ServerConfig {
        ServerConfig {
            socket_path: dir.path().join("hoard.sock"),
            arena_size: 1 << 16,
            arena_dir: dir.path().to_path_buf(),
            ..ServerConfig::default()
        }
    }

    async fn call(stream: &mut UnixStream, request: Request) -> Response {
        write_message(stream, &request).await.unwrap();
        let mut reader = FrameReader::new(stream);
        reader.next().await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn bind_rejects_invalid_config() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = config(&dir);
        c.arena_size = 0;
        assert!(StoreServer::bind(c).await.is_err());
    }

    #[tokio::test]
    async fn serves_clients_and_cleans_up_socket() {
        let dir = tempfile::tempdir().unwrap();
        let server = StoreServer::bind(config(&dir)).await.unwrap();
        let socket = server.socket_path().to_path_buf();
        let arena = server.store().arena_path().to_path_buf();
        assert!(server.transfer_addr().is_none());

        let (stop, stopped) = tokio::sync::oneshot::channel::<()>();
        let task = tokio::spawn(server.run_until(async {
            let _ = stopped.await;
        }));

        let mut stream = UnixStream::connect(&socket).await.unwrap();
        let response = call(&mut stream, Request::Connect { version: hoard_protocol::PROTOCOL_VERSION }).await;
        assert!(matches!(response, Response::Connected { arena_size: 65536, .. }));

        stop.send(()).unwrap();
        task.await.unwrap().unwrap();
        assert!(!socket.exists());
        // The arena file goes away with the last reference to the store.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!arena.exists());
    }

    #[tokio::test]
    async fn stale_socket_file_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let c = config(&dir);
        std::fs::write(&c.socket_path, b"").unwrap();
        let server = StoreServer::bind(c).await.unwrap();
        assert!(server.socket_path().exists());
    }

    #[tokio::test]
    async fn transfer_listener_only_when_configured() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = config(&dir);
        c.manager_addr = Some("127.0.0.1".parse().unwrap());
        c.manager_port = Some(0);
        let server = StoreServer::bind(c).await.unwrap();
        let addr = server.transfer_addr().unwrap();
        assert!(addr.ip().is_loopback());
        assert_ne!(addr.port(), 0);
    }
}
