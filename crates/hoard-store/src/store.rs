use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use hoard_types::{ObjectHandle, ObjectId, ObjectState};
use tokio::sync::oneshot;
use tracing::{debug, info};

use crate::alloc::{AllocError, Allocator};
use crate::arena::Arena;
use crate::error::{StoreError, StoreResult};
use crate::notify::{NotificationStream, SubscriberRegistry};
use crate::table::{ObjectRecord, ObjectTable};

/// Default arena size: 1 GiB.
pub const DEFAULT_ARENA_SIZE: u64 = 1024 * 1024 * 1024;

/// Default per-subscriber notification queue length.
pub const DEFAULT_NOTIFICATION_CAPACITY: usize = 1024;

/// Configuration for an [`ObjectStore`].
#[derive(Clone, Debug)]
pub struct StoreConfig {
    /// Total bytes of the shared arena. Fixed for the store's lifetime.
    pub arena_size: u64,
    /// Directory the arena file is created in.
    pub arena_dir: PathBuf,
    /// Bounded queue length of each notification subscriber.
    pub notification_capacity: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            arena_size: DEFAULT_ARENA_SIZE,
            arena_dir: default_arena_dir(),
            notification_capacity: DEFAULT_NOTIFICATION_CAPACITY,
        }
    }
}

/// `/dev/shm` when available, otherwise the system temp directory.
pub fn default_arena_dir() -> PathBuf {
    let shm = Path::new("/dev/shm");
    if shm.is_dir() {
        shm.to_path_buf()
    } else {
        std::env::temp_dir()
    }
}

/// Point-in-time counters describing the store.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub capacity: u64,
    pub allocated: u64,
    pub free: u64,
    pub objects: usize,
    pub sealed: usize,
    pub evictable: usize,
    pub evictions: u64,
    pub subscribers: usize,
    pub waiters: usize,
}

/// A `get` parked until its object is sealed.
struct Waiter {
    token: u64,
    sender: oneshot::Sender<ObjectHandle>,
}

/// Everything guarded by the store lock.
struct StoreState {
    arena: Arena,
    alloc: Allocator,
    table: ObjectTable,
    waiters: HashMap<ObjectId, Vec<Waiter>>,
    subscribers: SubscriberRegistry,
    next_token: u64,
    evictions: u64,
}

impl StoreState {
    /// Reserve `size` bytes, evicting LRU objects until the request fits.
    /// Returns the offset and the block size actually taken.
    fn reserve(&mut self, size: u64) -> StoreResult<(u64, u64)> {
        let capacity = self.alloc.capacity();
        let block = Allocator::block_size(size).filter(|b| *b <= capacity);
        let Some(block) = block else {
            return Err(self.out_of_memory(size));
        };

        loop {
            match self.alloc.reserve(block) {
                Ok(offset) => return Ok((offset, block)),
                Err(AllocError::OutOfMemory { .. }) => {}
                Err(e) => return Err(e.into()),
            }
            let Some(victim) = self.table.oldest_evictable() else {
                return Err(self.out_of_memory(size));
            };
            self.evict(&victim)?;
        }
    }

    fn evict(&mut self, id: &ObjectId) -> StoreResult<()> {
        if let Some(record) = self.table.remove(id) {
            self.alloc.release(record.data_offset, record.block_size)?;
            self.evictions += 1;
            info!(id = %id, size = record.block_size, "evicted object");
        }
        Ok(())
    }

    fn remove(&mut self, id: &ObjectId) -> StoreResult<ObjectRecord> {
        let record = self.table.remove(id).ok_or(StoreError::NotFound(*id))?;
        self.alloc.release(record.data_offset, record.block_size)?;
        Ok(record)
    }

    fn out_of_memory(&self, requested: u64) -> StoreError {
        StoreError::OutOfMemory {
            requested,
            free: self.alloc.free_bytes(),
            capacity: self.alloc.capacity(),
        }
    }

    fn park(&mut self, id: ObjectId) -> (u64, oneshot::Receiver<ObjectHandle>) {
        let (sender, receiver) = oneshot::channel();
        self.next_token += 1;
        let token = self.next_token;
        self.waiters
            .entry(id)
            .or_default()
            .push(Waiter { token, sender });
        (token, receiver)
    }

    fn cancel_waiter(&mut self, id: &ObjectId, token: u64) {
        if let Some(list) = self.waiters.get_mut(id) {
            list.retain(|w| w.token != token);
            if list.is_empty() {
                self.waiters.remove(id);
            }
        }
    }

    /// Look up a live record in the wanted state.
    fn record_in(&self, id: &ObjectId, want: ObjectState) -> StoreResult<&ObjectRecord> {
        let record = self.table.get(id).ok_or(StoreError::NotFound(*id))?;
        match (want, record.state) {
            (ObjectState::Created, ObjectState::Sealed) => Err(StoreError::AlreadySealed(*id)),
            (ObjectState::Sealed, ObjectState::Created) => Err(StoreError::NotSealed(*id)),
            _ => Ok(record),
        }
    }
}

/// The store context: one arena, one allocator, one object table.
///
/// Created once at process start and shared (behind an `Arc`) with every
/// connection handler. All mutations happen under a single lock so that
/// eviction decisions, seals and waiter wake-ups observe one consistent
/// state. The lock is never held across an `.await`.
pub struct ObjectStore {
    state: Mutex<StoreState>,
    arena_path: PathBuf,
    arena_size: u64,
}

impl ObjectStore {
    /// Create the arena and an empty table.
    pub fn open(config: &StoreConfig) -> StoreResult<Self> {
        let arena = Arena::create(&config.arena_dir, config.arena_size)?;
        let arena_path = arena.path().to_path_buf();
        let state = StoreState {
            alloc: Allocator::new(arena.capacity()),
            arena,
            table: ObjectTable::new(),
            waiters: HashMap::new(),
            subscribers: SubscriberRegistry::new(config.notification_capacity),
            next_token: 0,
            evictions: 0,
        };
        Ok(Self {
            state: Mutex::new(state),
            arena_path,
            arena_size: config.arena_size,
        })
    }

    fn state(&self) -> MutexGuard<'_, StoreState> {
        // Every critical section leaves the state consistent before it can
        // panic, so a poisoned lock is still usable.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Path of the arena file clients map.
    pub fn arena_path(&self) -> &Path {
        &self.arena_path
    }

    /// Size of the arena file in bytes.
    pub fn arena_size(&self) -> u64 {
        self.arena_size
    }

    /// Allocate an unsealed object and copy `metadata` in after its data.
    ///
    /// Evicts least-recently-used sealed, unreferenced objects if the arena
    /// is full. The returned data region is writable.
    pub fn create(
        &self,
        id: ObjectId,
        data_size: u64,
        metadata: &[u8],
    ) -> StoreResult<ObjectHandle> {
        self.insert_new(id, data_size, metadata, false)
    }

    /// Like [`create`](Self::create), for an object arriving over a
    /// transfer. Until [`seal_incoming`](Self::seal_incoming) or
    /// [`abort`](Self::abort), clients cannot seal or delete it.
    pub fn create_incoming(
        &self,
        id: ObjectId,
        data_size: u64,
        metadata: &[u8],
    ) -> StoreResult<ObjectHandle> {
        self.insert_new(id, data_size, metadata, true)
    }

    fn insert_new(
        &self,
        id: ObjectId,
        data_size: u64,
        metadata: &[u8],
        receiving: bool,
    ) -> StoreResult<ObjectHandle> {
        let metadata_size = metadata.len() as u64;
        let mut state = self.state();
        if state.table.contains(&id) {
            return Err(StoreError::ObjectExists(id));
        }
        let total = data_size
            .checked_add(metadata_size)
            .ok_or_else(|| state.out_of_memory(u64::MAX))?;
        let (offset, block) = state.reserve(total)?;

        let mut record = ObjectRecord::new(id, offset, data_size, metadata_size, block);
        record.receiving = receiving;
        if let Err(e) = state.arena.write(record.metadata_offset, metadata) {
            state.alloc.release(offset, block)?;
            return Err(e);
        }
        let handle = record.handle();
        state.table.insert(record)?;

        debug!(id = %id, data_size, metadata_size, offset, receiving, "object created");
        Ok(handle)
    }

    /// Seal an object, notify subscribers and complete every parked `get`.
    pub fn seal(&self, id: &ObjectId) -> StoreResult<()> {
        self.seal_as(id, false)
    }

    /// Seal an object created with [`create_incoming`](Self::create_incoming).
    pub fn seal_incoming(&self, id: &ObjectId) -> StoreResult<()> {
        self.seal_as(id, true)
    }

    fn seal_as(&self, id: &ObjectId, receiver: bool) -> StoreResult<()> {
        let mut state = self.state();
        if !receiver && state.table.get(id).is_some_and(|r| r.receiving) {
            return Err(StoreError::Receiving(*id));
        }
        let handle = state.table.seal(id)?;
        state.subscribers.publish(*id);

        let mut woken = 0usize;
        if let Some(waiters) = state.waiters.remove(id) {
            for waiter in waiters {
                // A waiter whose receiver is gone takes no reference.
                if waiter.sender.send(handle).is_ok() {
                    state.table.acquire(id)?;
                    woken += 1;
                }
            }
        }

        debug!(id = %id, woken, "object sealed");
        Ok(())
    }

    /// Whether a live object (sealed or not) exists.
    pub fn contains(&self, id: &ObjectId) -> bool {
        self.state().table.contains(id)
    }

    /// Lifecycle state of a live object.
    pub fn object_state(&self, id: &ObjectId) -> Option<ObjectState> {
        self.state().table.get(id).map(|r| r.state)
    }

    /// A copy of the record for a live object.
    pub fn record(&self, id: &ObjectId) -> Option<ObjectRecord> {
        self.state().table.get(id).cloned()
    }

    /// Take a reference on a sealed object without waiting.
    pub fn try_get(&self, id: &ObjectId) -> StoreResult<ObjectHandle> {
        self.state().table.acquire(id)
    }

    /// Take a reference on an object, waiting up to `timeout` for it to be
    /// created and sealed.
    ///
    /// A zero timeout never parks. The returned future is cancel-safe:
    /// dropping it withdraws the wait and returns any reference a racing
    /// seal handed it.
    pub async fn get(&self, id: ObjectId, timeout: Duration) -> StoreResult<ObjectHandle> {
        let mut pending = {
            let mut state = self.state();
            match state.table.acquire(&id) {
                Ok(handle) => return Ok(handle),
                Err(StoreError::NotFound(_) | StoreError::NotSealed(_)) => {}
                Err(e) => return Err(e),
            }
            if timeout.is_zero() {
                return Err(StoreError::Timeout(id));
            }
            let (token, receiver) = state.park(id);
            PendingGet {
                store: self,
                id,
                token,
                receiver,
                settled: false,
            }
        };
        pending.wait(timeout).await
    }

    /// Drop one reference taken by `get`.
    pub fn release(&self, id: &ObjectId) -> StoreResult<()> {
        let remaining = self.state().table.release(id)?;
        debug!(id = %id, remaining, "reference released");
        Ok(())
    }

    /// Delete an unreferenced object and free its space.
    pub fn delete(&self, id: &ObjectId) -> StoreResult<()> {
        let mut state = self.state();
        let record = state.table.get(id).ok_or(StoreError::NotFound(*id))?;
        if record.receiving {
            return Err(StoreError::Receiving(*id));
        }
        let ref_count = record.ref_count;
        if ref_count > 0 {
            return Err(StoreError::StillReferenced { id: *id, ref_count });
        }
        let record = state.remove(id)?;
        debug!(id = %id, size = record.block_size, "object deleted");
        Ok(())
    }

    /// Discard an unsealed object, e.g. after an interrupted transfer.
    pub fn abort(&self, id: &ObjectId) -> StoreResult<()> {
        let mut state = self.state();
        state.record_in(id, ObjectState::Created)?;
        state.remove(id)?;
        debug!(id = %id, "unsealed object aborted");
        Ok(())
    }

    /// Open a seal notification stream.
    pub fn subscribe(&self) -> NotificationStream {
        self.state().subscribers.subscribe()
    }

    /// Objects that would be evicted, in order, to free `needed` bytes.
    pub fn evict_candidates(&self, needed: u64) -> Vec<ObjectId> {
        let needed = Allocator::block_size(needed).unwrap_or(u64::MAX);
        self.state().table.eviction_candidates(needed)
    }

    /// Write into the data of an unsealed object at byte offset `at`.
    pub fn write_data(&self, id: &ObjectId, at: u64, bytes: &[u8]) -> StoreResult<()> {
        let mut state = self.state();
        let region = state.record_in(id, ObjectState::Created)?.handle().data;
        if !region.contains_span(at, bytes.len() as u64) {
            return Err(StoreError::OutOfBounds {
                offset: region.offset + at,
                len: bytes.len() as u64,
            });
        }
        state.arena.write(region.offset + at, bytes)
    }

    /// Copy `out.len()` bytes of a sealed object's data starting at `at`.
    pub fn read_data(&self, id: &ObjectId, at: u64, out: &mut [u8]) -> StoreResult<()> {
        let state = self.state();
        let region = state.record_in(id, ObjectState::Sealed)?.handle().data;
        if !region.contains_span(at, out.len() as u64) {
            return Err(StoreError::OutOfBounds {
                offset: region.offset + at,
                len: out.len() as u64,
            });
        }
        out.copy_from_slice(state.arena.read(region.offset + at, out.len() as u64)?);
        Ok(())
    }

    /// Copy the metadata of a live object.
    pub fn read_metadata(&self, id: &ObjectId) -> StoreResult<Vec<u8>> {
        let state = self.state();
        let record = state.table.get(id).ok_or(StoreError::NotFound(*id))?;
        Ok(state.arena.slice(record.handle().metadata)?.to_vec())
    }

    pub fn stats(&self) -> StoreStats {
        let state = self.state();
        StoreStats {
            capacity: state.alloc.capacity(),
            allocated: state.alloc.allocated_bytes(),
            free: state.alloc.free_bytes(),
            objects: state.table.len(),
            sealed: state.table.sealed_count(),
            evictable: state.table.evictable_count(),
            evictions: state.evictions,
            subscribers: state.subscribers.len(),
            waiters: state.waiters.values().map(Vec::len).sum(),
        }
    }
}

impl std::fmt::Debug for ObjectStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectStore")
            .field("arena_path", &self.arena_path)
            .field("arena_size", &self.arena_size)
            .finish()
    }
}

/// A registered wait for one object.
///
/// Dropping it unsettled removes the waiter and gives back a reference
/// that a concurrent seal may already have taken on its behalf.
struct PendingGet<'a> {
    store: &'a ObjectStore,
    id: ObjectId,
    token: u64,
    receiver: oneshot::Receiver<ObjectHandle>,
    settled: bool,
}

impl PendingGet<'_> {
    async fn wait(&mut self, timeout: Duration) -> StoreResult<ObjectHandle> {
        let outcome = tokio::time::timeout(timeout, &mut self.receiver).await;
        self.settled = true;
        match outcome {
            Ok(Ok(handle)) => Ok(handle),
            Ok(Err(_)) => Err(StoreError::NotFound(self.id)),
            Err(_) => {
                let mut state = self.store.state();
                state.cancel_waiter(&self.id, self.token);
                // A seal may have completed us between the timer and the lock.
                self.receiver
                    .try_recv()
                    .map_err(|_| StoreError::Timeout(self.id))
            }
        }
    }
}

impl Drop for PendingGet<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let mut state = self.store.state();
        state.cancel_waiter(&self.id, self.token);
        if self.receiver.try_recv().is_ok() {
            let _ = state.table.release(&self.id);
        }
    }
}
