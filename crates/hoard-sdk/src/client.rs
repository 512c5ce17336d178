use std::fs::OpenOptions;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use hoard_protocol::{write_message, FrameReader, Message, Request, Response, PROTOCOL_VERSION};
use hoard_types::{MappedRegion, ObjectHandle, ObjectId, ObjectState};
use memmap2::MmapMut;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tracing::debug;

use crate::error::{SdkError, SdkResult};
use crate::notifications::Notifications;

/// A connection to a store plus a mapping of its arena.
pub struct StoreClient {
    reader: FrameReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    arena: MmapMut,
    arena_path: PathBuf,
}

impl StoreClient {
    /// Connect to the store listening on `socket` and map its arena.
    pub async fn connect(socket: impl AsRef<Path>) -> SdkResult<Self> {
        let stream = UnixStream::connect(socket.as_ref()).await?;
        let (read, write) = stream.into_split();
        let mut reader = FrameReader::new(read);
        let mut writer = write;

        write_message(&mut writer, &Request::Connect { version: PROTOCOL_VERSION }).await?;
        let (arena_path, arena_size) = match reader.next::<Response>().await? {
            Some(Response::Connected {
                arena_path,
                arena_size,
                ..
            }) => (PathBuf::from(arena_path), arena_size),
            Some(Response::Error { code, message }) => {
                return Err(SdkError::Remote { code, message })
            }
            Some(other) => return Err(SdkError::UnexpectedResponse(other.type_name())),
            None => return Err(SdkError::Disconnected),
        };

        let file = OpenOptions::new().read(true).write(true).open(&arena_path)?;
        // SAFETY: the arena file has a fixed length for the store's
        // lifetime. The store only hands out disjoint ranges, and every
        // access below goes through bounds-checked slices of the mapping.
        let arena = unsafe { MmapMut::map_mut(&file)? };
        if arena.len() as u64 != arena_size {
            return Err(SdkError::ArenaMismatch {
                expected: arena_size,
                actual: arena.len() as u64,
            });
        }

        debug!(arena = %arena_path.display(), arena_size, "connected to store");
        Ok(Self {
            reader,
            writer,
            arena,
            arena_path,
        })
    }

    pub fn arena_path(&self) -> &Path {
        &self.arena_path
    }

    /// Send a request and wait for its response. Error responses become
    /// [`SdkError::Remote`].
    pub async fn call(&mut self, request: Request) -> SdkResult<Response> {
        write_message(&mut self.writer, &request).await?;
        match self.reader.next::<Response>().await? {
            Some(Response::Error { code, message }) => Err(SdkError::Remote { code, message }),
            Some(response) => Ok(response),
            None => Err(SdkError::Disconnected),
        }
    }

    /// Allocate an unsealed object. Its data region is writable through
    /// [`write`](Self::write) until it is sealed.
    pub async fn create(
        &mut self,
        id: ObjectId,
        data_size: u64,
        metadata: &[u8],
    ) -> SdkResult<ObjectHandle> {
        let request = Request::Create {
            id: id.as_bytes().to_vec(),
            data_size,
            metadata: metadata.to_vec(),
        };
        match self.call(request).await? {
            Response::Created(handle) => Ok(handle),
            other => Err(SdkError::UnexpectedResponse(other.type_name())),
        }
    }

    /// Copy `bytes` into a writable region starting at byte `at`.
    pub fn write(&mut self, region: MappedRegion, at: u64, bytes: &[u8]) -> SdkResult<()> {
        if !region.writable {
            return Err(SdkError::ReadOnly(region.offset));
        }
        if !region.contains_span(at, bytes.len() as u64) {
            return Err(SdkError::OutOfBounds {
                offset: region.offset.saturating_add(at),
                len: bytes.len() as u64,
            });
        }
        let span = MappedRegion::writable(region.offset + at, bytes.len() as u64);
        let range = self.range(span)?;
        self.arena[range].copy_from_slice(bytes);
        Ok(())
    }

    /// Borrow the bytes of a region.
    pub fn read(&self, region: MappedRegion) -> SdkResult<&[u8]> {
        let range = self.range(region)?;
        Ok(&self.arena[range])
    }

    pub async fn seal(&mut self, id: ObjectId) -> SdkResult<()> {
        self.expect_ok(Request::Seal {
            id: id.as_bytes().to_vec(),
        })
        .await
    }

    /// Take a reference on a sealed object, waiting for it to be sealed.
    /// `None` uses the store's default timeout.
    pub async fn get(
        &mut self,
        id: ObjectId,
        timeout: Option<Duration>,
    ) -> SdkResult<ObjectHandle> {
        let request = Request::Get {
            id: id.as_bytes().to_vec(),
            timeout_ms: timeout.map(|t| t.as_millis().min(u64::MAX as u128) as u64),
        };
        match self.call(request).await? {
            Response::Object(handle) => Ok(handle),
            other => Err(SdkError::UnexpectedResponse(other.type_name())),
        }
    }

    /// Whether the object exists, sealed or not.
    pub async fn contains(&mut self, id: ObjectId) -> SdkResult<bool> {
        Ok(self.status(id).await?.is_some())
    }

    pub async fn status(&mut self, id: ObjectId) -> SdkResult<Option<ObjectState>> {
        let request = Request::Contains {
            id: id.as_bytes().to_vec(),
        };
        match self.call(request).await? {
            Response::Contains { present: false, .. } => Ok(None),
            Response::Contains { sealed: true, .. } => Ok(Some(ObjectState::Sealed)),
            Response::Contains { .. } => Ok(Some(ObjectState::Created)),
            other => Err(SdkError::UnexpectedResponse(other.type_name())),
        }
    }

    /// Drop a reference taken by [`get`](Self::get).
    pub async fn release(&mut self, id: ObjectId) -> SdkResult<()> {
        self.expect_ok(Request::Release {
            id: id.as_bytes().to_vec(),
        })
        .await
    }

    pub async fn delete(&mut self, id: ObjectId) -> SdkResult<()> {
        self.expect_ok(Request::Delete {
            id: id.as_bytes().to_vec(),
        })
        .await
    }

    /// Ask the store to push a sealed object to the peer store listening
    /// for transfers at `peer`.
    pub async fn transfer(&mut self, peer: SocketAddr, id: ObjectId) -> SdkResult<()> {
        self.expect_ok(Request::Transfer {
            addr: peer.ip(),
            port: peer.port(),
            id: id.as_bytes().to_vec(),
        })
        .await
    }

    /// Create, fill and seal an object in one go.
    pub async fn put(&mut self, id: ObjectId, data: &[u8], metadata: &[u8]) -> SdkResult<()> {
        let handle = self.create(id, data.len() as u64, metadata).await?;
        self.write(handle.data, 0, data)?;
        self.seal(id).await
    }

    /// Copy out an object's data and metadata, holding a reference only
    /// while copying.
    pub async fn fetch(
        &mut self,
        id: ObjectId,
        timeout: Option<Duration>,
    ) -> SdkResult<(Vec<u8>, Vec<u8>)> {
        let handle = self.get(id, timeout).await?;
        let copied = self.copy_out(&handle);
        self.release(id).await?;
        copied
    }

    fn copy_out(&self, handle: &ObjectHandle) -> SdkResult<(Vec<u8>, Vec<u8>)> {
        let data = self.read(handle.data)?.to_vec();
        let metadata = self.read(handle.metadata)?.to_vec();
        Ok((data, metadata))
    }

    /// Turn this connection into a seal notification stream.
    pub async fn subscribe(mut self) -> SdkResult<Notifications> {
        match self.call(Request::Subscribe).await? {
            Response::Subscribed => Ok(Notifications::new(self.reader, self.writer)),
            other => Err(SdkError::UnexpectedResponse(other.type_name())),
        }
    }

    async fn expect_ok(&mut self, request: Request) -> SdkResult<()> {
        match self.call(request).await? {
            Response::Ok => Ok(()),
            other => Err(SdkError::UnexpectedResponse(other.type_name())),
        }
    }

    fn range(&self, region: MappedRegion) -> SdkResult<std::ops::Range<usize>> {
        region
            .as_range()
            .filter(|r| r.end <= self.arena.len())
            .ok_or(SdkError::OutOfBounds {
                offset: region.offset,
                len: region.len,
            })
    }
}

impl std::fmt::Debug for StoreClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreClient")
            .field("arena_path", &self.arena_path)
            .field("arena_size", &self.arena.len())
            .finish()
    }
}
