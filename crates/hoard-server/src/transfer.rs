//! Moving sealed objects between stores.
//!
//! The sending side pins the object with a reference, streams header,
//! metadata and payload to the peer's transfer listener, and waits for the
//! one-byte acknowledgement. Outbound connections are cached per peer and
//! carry one transfer at a time. The receiving side materializes each
//! incoming object as a new unsealed record and seals it only once every
//! declared byte has arrived.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use hoard_protocol::{read_ack, write_ack, ErrorCode, TransferHeader};
use hoard_store::ObjectStore;
use hoard_types::ObjectId;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::context::ServerContext;
use crate::error::{store_error_code, ServerError, ServerResult};

/// Payload bytes copied per arena access.
pub const CHUNK_SIZE: usize = 64 * 1024;

/// Pause after a failed accept before trying again.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

type PeerSlot = Arc<Mutex<Option<TcpStream>>>;

/// Open transfer connections, one per peer.
#[derive(Debug, Default)]
pub struct PeerConnections {
    slots: Mutex<HashMap<SocketAddr, PeerSlot>>,
}

impl PeerConnections {
    async fn slot(&self, peer: SocketAddr) -> PeerSlot {
        Arc::clone(self.slots.lock().await.entry(peer).or_default())
    }
}

/// Send one sealed object to the transfer listener at `peer`.
pub async fn send_object(
    ctx: &ServerContext,
    peer: SocketAddr,
    id: ObjectId,
) -> ServerResult<()> {
    let store = &ctx.store;
    store.try_get(&id)?;

    let outcome = tokio::time::timeout(ctx.transfer_timeout, push_to_peer(ctx, peer, id)).await;

    if let Err(e) = store.release(&id) {
        warn!(id = %id, error = %e, "failed to unpin transferred object");
    }

    match outcome {
        Ok(Ok(size)) => {
            info!(id = %id, peer = %peer, size, "object transferred");
            Ok(())
        }
        Ok(Err(e)) => {
            warn!(id = %id, peer = %peer, error = %e, "transfer failed");
            Err(e)
        }
        Err(_) => Err(ServerError::transfer(
            ErrorCode::ConnectionError,
            format!("transfer of {id} to {peer} timed out"),
        )),
    }
}

/// Push over the cached connection to `peer`, opening one if there is none
/// or the cached one turns out to be dead.
///
/// The connection is taken out of its slot for the duration of the push, so
/// a push cut short by the timeout drops it instead of leaving a half
/// written object on a reused stream.
async fn push_to_peer(ctx: &ServerContext, peer: SocketAddr, id: ObjectId) -> ServerResult<u64> {
    let slot = ctx.peers.slot(peer).await;
    let mut cached = slot.lock().await;

    if let Some(mut conn) = cached.take() {
        let result = push_object(&ctx.store, &mut conn, id).await;
        if !connection_failed(&result) {
            if keeps_connection(&result) {
                *cached = Some(conn);
            }
            return result;
        }
        debug!(peer = %peer, "cached transfer connection failed, reconnecting");
    }

    let mut conn = TcpStream::connect(peer).await?;
    debug!(peer = %peer, "transfer connection opened");
    let result = push_object(&ctx.store, &mut conn, id).await;
    if keeps_connection(&result) {
        *cached = Some(conn);
    }
    result
}

/// Whether the stream is still positioned between objects.
fn keeps_connection(result: &ServerResult<u64>) -> bool {
    matches!(result, Ok(_) | Err(ServerError::Transfer { .. }))
}

fn connection_failed(result: &ServerResult<u64>) -> bool {
    matches!(result, Err(ServerError::Io(_) | ServerError::Protocol(_)))
}

/// Write one pinned object to `conn` and wait for its acknowledgement.
/// Returns the payload size.
pub async fn push_object<W>(
    store: &ObjectStore,
    conn: &mut W,
    id: ObjectId,
) -> ServerResult<u64>
where
    W: AsyncRead + AsyncWrite + Unpin,
{
    let metadata = store.read_metadata(&id)?;
    let payload_len = store
        .record(&id)
        .map(|r| r.data_size)
        .ok_or(hoard_store::StoreError::NotFound(id))?;
    let header = TransferHeader {
        id,
        metadata_len: metadata.len() as u64,
        payload_len,
    };
    header.write_to(conn).await?;
    conn.write_all(&metadata).await?;

    let mut chunk = vec![0u8; CHUNK_SIZE.min(payload_len as usize)];
    let mut sent = 0u64;
    while sent < payload_len {
        let n = chunk.len().min((payload_len - sent) as usize);
        store.read_data(&id, sent, &mut chunk[..n])?;
        conn.write_all(&chunk[..n]).await?;
        sent += n as u64;
    }
    conn.flush().await?;

    match read_ack(conn).await? {
        Ok(()) => Ok(payload_len),
        Err(code) => Err(ServerError::transfer(code, format!("peer rejected {id}"))),
    }
}

/// Accept transfer connections until the task is aborted. Aborting it also
/// aborts every connection it accepted.
pub async fn serve_transfers(listener: TcpListener, ctx: Arc<ServerContext>) {
    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
            accepted = listener.accept() => {
                let (conn, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!(error = %e, "transfer accept failed");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                        continue;
                    }
                };
                let ctx = Arc::clone(&ctx);
                connections.spawn(async move {
                    match receive_objects(conn, &ctx).await {
                        Ok(count) => debug!(peer = %peer, count, "transfer connection closed"),
                        Err(e) => warn!(peer = %peer, error = %e, "transfer connection failed"),
                    }
                });
            }
        }
    }
}

/// Receive objects from `conn` until the sender closes it. Returns how many
/// were sealed.
pub async fn receive_objects<S>(mut conn: S, ctx: &ServerContext) -> ServerResult<usize>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut received = 0;
    while let Some(header) = TransferHeader::read_from(&mut conn).await? {
        let outcome = match tokio::time::timeout(
            ctx.transfer_timeout,
            receive_one(&mut conn, &ctx.store, header),
        )
        .await
        {
            Ok(outcome) => outcome?,
            Err(_) => {
                return Err(ServerError::transfer(
                    ErrorCode::ConnectionError,
                    format!("receiving {} timed out", header.id),
                ))
            }
        };
        if outcome.is_ok() {
            received += 1;
        }
        write_ack(&mut conn, outcome).await?;
    }
    Ok(received)
}

/// Receive the body of one object.
///
/// An `Err` means the stream itself broke and the connection is unusable.
/// `Ok(Err(code))` means the object was refused but its bytes were consumed,
/// so the connection can carry the next one.
async fn receive_one<R>(
    conn: &mut R,
    store: &ObjectStore,
    header: TransferHeader,
) -> ServerResult<Result<(), ErrorCode>>
where
    R: AsyncRead + Unpin,
{
    let mut metadata = vec![0u8; header.metadata_len as usize];
    conn.read_exact(&mut metadata).await?;

    if let Err(e) = store.create_incoming(header.id, header.payload_len, &metadata) {
        warn!(id = %header.id, error = %e, "refusing incoming object");
        skip(conn, header.payload_len).await?;
        return Ok(Err(store_error_code(&e)));
    }
    let mut incoming = Incoming {
        store,
        id: header.id,
        armed: true,
    };

    let mut chunk = vec![0u8; CHUNK_SIZE.min(header.payload_len as usize)];
    let mut received = 0u64;
    while received < header.payload_len {
        let want = chunk.len().min((header.payload_len - received) as usize);
        let n = conn.read(&mut chunk[..want]).await?;
        if n == 0 {
            return Err(ServerError::transfer(
                ErrorCode::ConnectionError,
                format!(
                    "stream for {} ended after {received} of {} bytes",
                    header.id, header.payload_len
                ),
            ));
        }
        store.write_data(&header.id, received, &chunk[..n])?;
        received += n as u64;
    }

    store.seal_incoming(&header.id)?;
    incoming.armed = false;
    info!(id = %header.id, size = header.payload_len, "object received");
    Ok(Ok(()))
}

/// Discard `len` bytes of a refused object.
async fn skip<R>(conn: &mut R, len: u64) -> ServerResult<()>
where
    R: AsyncRead + Unpin,
{
    let copied = tokio::io::copy(&mut conn.take(len), &mut tokio::io::sink()).await?;
    if copied < len {
        return Err(ServerError::transfer(
            ErrorCode::ConnectionError,
            format!("stream ended after {copied} of {len} skipped bytes"),
        ));
    }
    Ok(())
}

/// An object being received. Dropped while armed, it aborts the unsealed
/// record so no partial object stays visible.
struct Incoming<'a> {
    store: &'a ObjectStore,
    id: ObjectId,
    armed: bool,
}

impl Drop for Incoming<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        match self.store.abort(&self.id) {
            Ok(()) => info!(id = %self.id, "aborted partial incoming object"),
            Err(e) => warn!(id = %self.id, error = %e, "could not abort incoming object"),
        }
    }
}
