use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use hoard_protocol::{
    parse_id, write_message, write_notification, ErrorCode, FrameReader, Message, ProtocolError,
    Request, Response, PROTOCOL_VERSION,
};
use hoard_store::StoreResult;
use hoard_types::{ObjectHandle, ObjectId};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tracing::{debug, info, warn};

use crate::context::ServerContext;
use crate::error::{store_error_code, ServerError, ServerResult};
use crate::transfer;

static NEXT_SESSION: AtomicU64 = AtomicU64::new(1);

/// Serve one client connection until it closes.
///
/// Requests are answered strictly in arrival order. References taken by
/// `Get` belong to the session and are given back when it ends, however it
/// ends.
pub async fn serve_connection<S>(stream: S, ctx: Arc<ServerContext>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let id = NEXT_SESSION.fetch_add(1, Ordering::Relaxed);
    let (reader, writer) = tokio::io::split(stream);
    let mut session = Session {
        id,
        ctx,
        reader: FrameReader::new(reader),
        writer,
        held: HashMap::new(),
    };
    debug!(session = id, "client connected");

    match session.run().await {
        Ok(()) => debug!(session = id, "client disconnected"),
        Err(e) => warn!(session = id, error = %e, "session ended with error"),
    }
    session.close();
}

/// What interrupted a blocking `Get`.
enum GetEvent {
    Done(StoreResult<ObjectHandle>),
    Input(Result<usize, ProtocolError>),
}

struct Session<S> {
    id: u64,
    ctx: Arc<ServerContext>,
    reader: FrameReader<ReadHalf<S>>,
    writer: WriteHalf<S>,
    /// References this client holds, per object.
    held: HashMap<ObjectId, u32>,
}

impl<S> Session<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn run(&mut self) -> ServerResult<()> {
        loop {
            let request = match self.reader.next::<Request>().await {
                Ok(Some(request)) => request,
                Ok(None) => return Ok(()),
                Err(e @ ProtocolError::Decode(_)) => {
                    // The frame was intact; tell the client before hanging up.
                    let response = Response::error(ErrorCode::Protocol, e.to_string());
                    write_message(&mut self.writer, &response).await?;
                    return Err(e.into());
                }
                Err(e) => return Err(e.into()),
            };
            debug!(session = self.id, request = request.type_name(), "request");

            if let Request::Subscribe = request {
                return self.stream_notifications().await;
            }
            match self.dispatch(request).await {
                Some(response) => write_message(&mut self.writer, &response).await?,
                None => return Ok(()),
            }
        }
    }

    /// Handle one request. `None` means the client went away mid-request.
    async fn dispatch(&mut self, request: Request) -> Option<Response> {
        let store = Arc::clone(&self.ctx.store);
        let response = match request {
            Request::Connect { version } => {
                if version != PROTOCOL_VERSION {
                    let e = ProtocolError::VersionMismatch {
                        local: PROTOCOL_VERSION,
                        remote: version,
                    };
                    return Some(Response::error(ErrorCode::Protocol, e.to_string()));
                }
                Response::Connected {
                    version: PROTOCOL_VERSION,
                    arena_path: store.arena_path().display().to_string(),
                    arena_size: store.arena_size(),
                }
            }
            Request::Create {
                id,
                data_size,
                metadata,
            } => match parse_id(&id) {
                Ok(id) => respond(store.create(id, data_size, &metadata).map(Response::Created)),
                Err(e) => invalid_id(e),
            },
            Request::Get { id, timeout_ms } => match parse_id(&id) {
                Ok(id) => {
                    let timeout = timeout_ms
                        .map(Duration::from_millis)
                        .unwrap_or(self.ctx.get_timeout);
                    return self.get(id, timeout).await;
                }
                Err(e) => invalid_id(e),
            },
            Request::Contains { id } => match parse_id(&id) {
                Ok(id) => {
                    let state = store.object_state(&id);
                    Response::Contains {
                        present: state.is_some(),
                        sealed: state.is_some_and(|s| s.is_sealed()),
                    }
                }
                Err(e) => invalid_id(e),
            },
            Request::Seal { id } => match parse_id(&id) {
                Ok(id) => respond(store.seal(&id).map(|()| Response::Ok)),
                Err(e) => invalid_id(e),
            },
            Request::Release { id } => match parse_id(&id) {
                Ok(id) => self.release(id),
                Err(e) => invalid_id(e),
            },
            Request::Delete { id } => match parse_id(&id) {
                Ok(id) => respond(store.delete(&id).map(|()| Response::Ok)),
                Err(e) => invalid_id(e),
            },
            Request::Transfer { addr, port, id } => match parse_id(&id) {
                Ok(id) => {
                    let peer = SocketAddr::new(addr, port);
                    match transfer::send_object(&self.ctx, peer, id).await {
                        Ok(()) => Response::Ok,
                        Err(e) => server_error(e),
                    }
                }
                Err(e) => invalid_id(e),
            },
            Request::Subscribe => Response::error(ErrorCode::Protocol, "unexpected subscribe"),
        };
        Some(response)
    }

    /// Wait for `id`, watching the socket so a vanished client cancels the
    /// wait instead of pinning the object.
    async fn get(&mut self, id: ObjectId, timeout: Duration) -> Option<Response> {
        let store = Arc::clone(&self.ctx.store);
        let wait = store.get(id, timeout);
        tokio::pin!(wait);

        loop {
            let event = tokio::select! {
                result = &mut wait => GetEvent::Done(result),
                read = self.reader.fill() => GetEvent::Input(read),
            };
            match event {
                GetEvent::Done(Ok(handle)) => {
                    *self.held.entry(id).or_default() += 1;
                    return Some(Response::Object(handle));
                }
                GetEvent::Done(Err(e)) => return Some(store_error(&e)),
                // Pipelined requests stay buffered until this one completes.
                GetEvent::Input(Ok(n)) if n > 0 => continue,
                GetEvent::Input(Ok(_)) => {
                    debug!(session = self.id, id = %id, "client left during get");
                    return None;
                }
                GetEvent::Input(Err(e)) => {
                    warn!(session = self.id, id = %id, error = %e, "dropping client during get");
                    return None;
                }
            }
        }
    }

    fn release(&mut self, id: ObjectId) -> Response {
        let Some(count) = self.held.get_mut(&id) else {
            return Response::error(
                ErrorCode::NotReferenced,
                format!("object not referenced by this client: {id}"),
            );
        };
        *count -= 1;
        if *count == 0 {
            self.held.remove(&id);
        }
        respond(self.ctx.store.release(&id).map(|()| Response::Ok))
    }

    /// Turn the connection into a one-way stream of sealed ids.
    ///
    /// The stream is closed when the store drops this subscriber, when a
    /// batch stays unwritten past `write_timeout`, or when the client sends
    /// anything.
    async fn stream_notifications(&mut self) -> ServerResult<()> {
        if self.reader.buffered() > 0 {
            return Err(ProtocolError::Framing("request pipelined after subscribe".into()).into());
        }
        let mut notifications = self.ctx.store.subscribe();
        write_message(&mut self.writer, &Response::Subscribed).await?;
        info!(session = self.id, "subscriber attached");

        let mut batch = Vec::new();
        loop {
            tokio::select! {
                next = notifications.recv() => {
                    let Some(id) = next else {
                        warn!(session = self.id, "subscriber fell behind, closing stream");
                        return Ok(());
                    };
                    batch.clear();
                    batch.push(id);
                    while let Ok(id) = notifications.try_recv() {
                        batch.push(id);
                    }
                    let write = write_batch(&mut self.writer, &batch);
                    match tokio::time::timeout(self.ctx.write_timeout, write).await {
                        Ok(written) => written?,
                        Err(_) => {
                            warn!(session = self.id, pending = batch.len(), "subscriber stopped reading, closing stream");
                            return Ok(());
                        }
                    }
                }
                read = self.reader.fill() => {
                    return match read {
                        Ok(0) => Ok(()),
                        Ok(_) => Err(ProtocolError::Framing("input on a subscribed connection".into()).into()),
                        Err(e) => Err(e.into()),
                    };
                }
            }
        }
    }

    /// Give back every reference this client still holds.
    fn close(&mut self) {
        let mut released = 0u32;
        for (id, count) in self.held.drain() {
            for _ in 0..count {
                match self.ctx.store.release(&id) {
                    Ok(()) => released += 1,
                    Err(e) => warn!(session = self.id, id = %id, error = %e, "release on close failed"),
                }
            }
        }
        if released > 0 {
            debug!(session = self.id, released, "released references on close");
        }
    }
}

async fn write_batch<W>(writer: &mut W, ids: &[ObjectId]) -> ServerResult<()>
where
    W: AsyncWrite + Unpin,
{
    for id in ids {
        write_notification(writer, id).await?;
    }
    writer.flush().await?;
    Ok(())
}

fn respond(result: StoreResult<Response>) -> Response {
    result.unwrap_or_else(|e| store_error(&e))
}

fn store_error(err: &hoard_store::StoreError) -> Response {
    Response::error(store_error_code(err), err.to_string())
}

fn server_error(err: ServerError) -> Response {
    Response::error(err.code(), err.to_string())
}

fn invalid_id(err: ProtocolError) -> Response {
    Response::error(ErrorCode::InvalidId, err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use hoard_protocol::codec::MAX_BUFFERED;
    use hoard_protocol::{read_notification, FrameReader, MAX_MESSAGE_SIZE};
    use hoard_store::{ObjectStore, StoreConfig};
    use tokio::io::DuplexStream;

    struct Harness {
        _dir: tempfile::TempDir,
        ctx: Arc<ServerContext>,
    }

    impl Harness {
        fn new() -> Self {
            Self::with_notification_capacity(16)
        }

        fn with_notification_capacity(notification_capacity: usize) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let store = ObjectStore::open(&StoreConfig {
                arena_size: 1 << 16,
                arena_dir: dir.path().to_path_buf(),
                notification_capacity,
            })
            .unwrap();
            let ctx = Arc::new(ServerContext {
                store: Arc::new(store),
                get_timeout: Duration::from_secs(5),
                transfer_timeout: Duration::from_secs(5),
                write_timeout: Duration::from_millis(100),
                peers: Default::default(),
            });
            Self { _dir: dir, ctx }
        }

        fn connect(&self) -> Client {
            self.connect_with_buffer(4096)
        }

        fn connect_with_buffer(&self, size: usize) -> Client {
            let (client, server) = tokio::io::duplex(size);
            let session = tokio::spawn(serve_connection(server, Arc::clone(&self.ctx)));
            let (reader, writer) = tokio::io::split(client);
            Client {
                reader: FrameReader::new(reader),
                writer,
                session,
            }
        }

        fn seal(&self, n: u8) {
            self.ctx.store.create(id(n), 1, b"").unwrap();
            self.ctx.store.seal(&id(n)).unwrap();
        }
    }

    struct Client {
        reader: FrameReader<ReadHalf<DuplexStream>>,
        writer: WriteHalf<DuplexStream>,
        session: tokio::task::JoinHandle<()>,
    }

    impl Client {
        async fn send(&mut self, request: Request) {
            write_message(&mut self.writer, &request).await.unwrap();
        }

        async fn recv(&mut self) -> Response {
            self.reader.next().await.unwrap().unwrap()
        }

        async fn call(&mut self, request: Request) -> Response {
            self.send(request).await;
            self.recv().await
        }
    }

    fn raw(n: u8) -> Vec<u8> {
        vec![n; 20]
    }

    fn id(n: u8) -> ObjectId {
        ObjectId::from_raw([n; 20])
    }

    fn error_code(response: Response) -> ErrorCode {
        match response {
            Response::Error { code, .. } => code,
            other => panic!("expected error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn connect_reports_arena() {
        let h = Harness::new();
        let mut c = h.connect();
        match c.call(Request::Connect { version: PROTOCOL_VERSION }).await {
            Response::Connected { arena_size, arena_path, .. } => {
                assert_eq!(arena_size, 1 << 16);
                assert_eq!(arena_path, h.ctx.store.arena_path().display().to_string());
            }
            other => panic!("unexpected {other:?}"),
        }
        let mismatch = c.call(Request::Connect { version: 99 }).await;
        assert_eq!(error_code(mismatch), ErrorCode::Protocol);
    }

    #[tokio::test]
    async fn create_seal_get_release() {
        let h = Harness::new();
        let mut c = h.connect();

        let created = c
            .call(Request::Create { id: raw(1), data_size: 8, metadata: b"m".to_vec() })
            .await;
        assert!(matches!(created, Response::Created(handle) if handle.data.writable));
        assert_eq!(
            c.call(Request::Contains { id: raw(1) }).await,
            Response::Contains { present: true, sealed: false }
        );
        assert_eq!(c.call(Request::Seal { id: raw(1) }).await, Response::Ok);
        assert_eq!(
            c.call(Request::Contains { id: raw(1) }).await,
            Response::Contains { present: true, sealed: true }
        );

        let got = c.call(Request::Get { id: raw(1), timeout_ms: Some(0) }).await;
        assert!(matches!(got, Response::Object(handle) if !handle.data.writable));
        assert_eq!(h.ctx.store.record(&id(1)).unwrap().ref_count, 1);

        assert_eq!(c.call(Request::Release { id: raw(1) }).await, Response::Ok);
        assert_eq!(
            error_code(c.call(Request::Release { id: raw(1) }).await),
            ErrorCode::NotReferenced
        );
        assert_eq!(c.call(Request::Delete { id: raw(1) }).await, Response::Ok);
        assert_eq!(
            c.call(Request::Contains { id: raw(1) }).await,
            Response::Contains { present: false, sealed: false }
        );
    }

    #[tokio::test]
    async fn malformed_ids_are_rejected_per_request() {
        let h = Harness::new();
        let mut c = h.connect();
        for request in [
            Request::Create { id: vec![1; 19], data_size: 1, metadata: vec![] },
            Request::Get { id: vec![], timeout_ms: None },
            Request::Contains { id: vec![0; 21] },
            Request::Seal { id: vec![0; 4] },
            Request::Delete { id: vec![0; 4] },
        ] {
            assert_eq!(error_code(c.call(request).await), ErrorCode::InvalidId);
        }
        // The connection is still usable.
        assert!(matches!(
            c.call(Request::Contains { id: raw(1) }).await,
            Response::Contains { present: false, .. }
        ));
    }

    #[tokio::test]
    async fn errors_are_reported_not_fatal() {
        let h = Harness::new();
        let mut c = h.connect();
        assert_eq!(
            error_code(c.call(Request::Seal { id: raw(1) }).await),
            ErrorCode::NotFound
        );
        c.call(Request::Create { id: raw(1), data_size: 1, metadata: vec![] }).await;
        assert_eq!(
            error_code(c.call(Request::Create { id: raw(1), data_size: 1, metadata: vec![] }).await),
            ErrorCode::ObjectExists
        );
        c.call(Request::Seal { id: raw(1) }).await;
        assert_eq!(
            error_code(c.call(Request::Seal { id: raw(1) }).await),
            ErrorCode::AlreadySealed
        );
        assert_eq!(
            error_code(c.call(Request::Create { id: raw(2), data_size: 1 << 20, metadata: vec![] }).await),
            ErrorCode::OutOfMemory
        );
    }

    #[tokio::test]
    async fn get_waits_for_seal_from_another_client() {
        let h = Harness::new();
        let mut writer = h.connect();
        let mut reader = h.connect();

        writer
            .call(Request::Create { id: raw(5), data_size: 4, metadata: vec![] })
            .await;
        reader.send(Request::Get { id: raw(5), timeout_ms: None }).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(h.ctx.store.stats().waiters, 1);

        writer.call(Request::Seal { id: raw(5) }).await;
        assert!(matches!(reader.recv().await, Response::Object(_)));
    }

    #[tokio::test]
    async fn get_timeout_is_reported() {
        let h = Harness::new();
        let mut c = h.connect();
        let response = c.call(Request::Get { id: raw(9), timeout_ms: Some(20) }).await;
        assert_eq!(error_code(response), ErrorCode::Timeout);
    }

    #[tokio::test]
    async fn requests_behind_a_waiting_get_are_answered_in_order() {
        let h = Harness::new();
        let mut c = h.connect();
        let mut sealer = h.connect();
        c.call(Request::Create { id: raw(1), data_size: 1, metadata: vec![] }).await;

        c.send(Request::Get { id: raw(1), timeout_ms: None }).await;
        c.send(Request::Contains { id: raw(2) }).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        sealer.call(Request::Seal { id: raw(1) }).await;

        assert!(matches!(c.recv().await, Response::Object(_)));
        assert!(matches!(c.recv().await, Response::Contains { present: false, .. }));
    }

    #[tokio::test]
    async fn disconnect_releases_references_and_waits() {
        let h = Harness::new();
        let mut c = h.connect();
        c.call(Request::Create { id: raw(1), data_size: 1, metadata: vec![] }).await;
        c.call(Request::Seal { id: raw(1) }).await;
        c.call(Request::Get { id: raw(1), timeout_ms: None }).await;
        c.call(Request::Get { id: raw(1), timeout_ms: None }).await;
        c.send(Request::Get { id: raw(2), timeout_ms: None }).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(h.ctx.store.record(&id(1)).unwrap().ref_count, 2);
        assert_eq!(h.ctx.store.stats().waiters, 1);

        drop(c);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.ctx.store.record(&id(1)).unwrap().ref_count, 0);
        assert_eq!(h.ctx.store.stats().waiters, 0);
    }

    #[tokio::test]
    async fn subscriber_receives_seals_in_order() {
        let h = Harness::new();
        let mut sub = h.connect();
        assert_eq!(sub.call(Request::Subscribe).await, Response::Subscribed);

        let mut c = h.connect();
        for n in [7u8, 3, 5] {
            c.call(Request::Create { id: raw(n), data_size: 1, metadata: vec![] }).await;
            c.call(Request::Seal { id: raw(n) }).await;
        }

        assert_eq!(sub.reader.buffered(), 0);
        let mut stream = sub.reader.into_inner();
        for n in [7u8, 3, 5] {
            assert_eq!(read_notification(&mut stream).await.unwrap(), Some(id(n)));
        }
    }

    #[tokio::test]
    async fn stalled_subscriber_session_is_closed() {
        let h = Harness::with_notification_capacity(4);
        let mut sub = h.connect_with_buffer(64);
        assert_eq!(sub.call(Request::Subscribe).await, Response::Subscribed);

        // Seals never wait on the subscriber.
        for n in 1..=50u8 {
            h.seal(n);
        }
        assert_eq!(h.ctx.store.stats().subscribers, 0);

        // The client is still connected but never reads again.
        tokio::time::timeout(Duration::from_secs(2), &mut sub.session)
            .await
            .expect("session should end")
            .unwrap();
        drop(sub);
    }

    #[tokio::test]
    async fn input_after_subscribe_closes_the_session() {
        let h = Harness::new();
        let mut sub = h.connect();
        assert_eq!(sub.call(Request::Subscribe).await, Response::Subscribed);

        sub.writer.write_all(&[0xAA; 1024]).await.unwrap();
        tokio::time::timeout(Duration::from_secs(2), &mut sub.session)
            .await
            .expect("session should end")
            .unwrap();
        assert_eq!(h.ctx.store.stats().subscribers, 0);
    }

    #[tokio::test]
    async fn request_pipelined_behind_subscribe_is_refused() {
        let h = Harness::new();
        let mut sub = h.connect();
        sub.send(Request::Subscribe).await;
        sub.send(Request::Contains { id: raw(1) }).await;
        tokio::time::timeout(Duration::from_secs(2), &mut sub.session)
            .await
            .expect("session should end")
            .unwrap();
        assert_eq!(h.ctx.store.stats().subscribers, 0);
    }

    #[tokio::test]
    async fn unbounded_input_behind_a_waiting_get_drops_the_client() {
        let h = Harness::new();
        let mut c = h.connect();
        c.send(Request::Get { id: raw(1), timeout_ms: Some(60_000) }).await;

        // A frame header announcing a maximal payload, then far more than that.
        let mut header = ((MAX_MESSAGE_SIZE + 1) as u32).to_be_bytes().to_vec();
        header.push(Request::Subscribe.type_tag());
        let flood = tokio::spawn(async move {
            let junk = vec![0u8; 64 * 1024];
            c.writer.write_all(&header).await?;
            for _ in 0..(MAX_BUFFERED / junk.len() + 8) {
                c.writer.write_all(&junk).await?;
            }
            Ok::<_, std::io::Error>(c)
        });

        // The session gives up once it holds a frame's worth of unread input.
        let ended = tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                if h.ctx.store.stats().waiters == 0 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(ended.is_ok());
        let _ = flood.await;
    }
}
