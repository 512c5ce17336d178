use std::collections::{BTreeSet, HashMap};

use hoard_types::{MappedRegion, ObjectHandle, ObjectId, ObjectState};

use crate::error::{StoreError, StoreResult};

/// Everything the store knows about one live object.
///
/// Data and metadata share a single allocation: the data range starts at
/// `data_offset` and the metadata follows it directly. `block_size` is the
/// aligned size that was reserved and must be handed back on removal.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectRecord {
    pub id: ObjectId,
    pub state: ObjectState,
    pub data_offset: u64,
    pub data_size: u64,
    pub metadata_offset: u64,
    pub metadata_size: u64,
    pub block_size: u64,
    pub ref_count: u32,
    /// Tick of the last seal or last release; orders the eviction queue.
    pub last_used: u64,
    /// Filled by an inbound transfer; clients may not seal or delete it.
    pub receiving: bool,
}

impl ObjectRecord {
    /// A freshly created, unsealed record at `offset`.
    pub fn new(
        id: ObjectId,
        offset: u64,
        data_size: u64,
        metadata_size: u64,
        block_size: u64,
    ) -> Self {
        Self {
            id,
            state: ObjectState::Created,
            data_offset: offset,
            data_size,
            metadata_offset: offset + data_size,
            metadata_size,
            block_size,
            ref_count: 0,
            last_used: 0,
            receiving: false,
        }
    }

    /// The regions of this object. The data region is writable only while
    /// the object is unsealed; metadata is never writable.
    pub fn handle(&self) -> ObjectHandle {
        let data = match self.state {
            ObjectState::Created => MappedRegion::writable(self.data_offset, self.data_size),
            ObjectState::Sealed => MappedRegion::read_only(self.data_offset, self.data_size),
        };
        ObjectHandle {
            id: self.id,
            data,
            metadata: MappedRegion::read_only(self.metadata_offset, self.metadata_size),
        }
    }

    /// Sealed and unreferenced.
    pub fn is_evictable(&self) -> bool {
        self.state.is_sealed() && self.ref_count == 0
    }
}

/// Map from object id to record, plus the LRU eviction queue.
///
/// The queue holds exactly the evictable records, keyed by
/// `(last_used, id)`. Ticks come from a per-table counter and are unique, so
/// the order is total and deterministic.
#[derive(Debug, Default)]
pub struct ObjectTable {
    records: HashMap<ObjectId, ObjectRecord>,
    lru: BTreeSet<(u64, ObjectId)>,
    clock: u64,
}

impl ObjectTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, id: &ObjectId) -> Option<&ObjectRecord> {
        self.records.get(id)
    }

    pub fn contains(&self, id: &ObjectId) -> bool {
        self.records.contains_key(id)
    }

    /// Insert a new record. Fails if the id is already live.
    pub fn insert(&mut self, record: ObjectRecord) -> StoreResult<()> {
        if self.records.contains_key(&record.id) {
            return Err(StoreError::ObjectExists(record.id));
        }
        self.records.insert(record.id, record);
        Ok(())
    }

    /// Transition a record to sealed and return its read-only handle.
    pub fn seal(&mut self, id: &ObjectId) -> StoreResult<ObjectHandle> {
        let tick = self.tick();
        let record = self
            .records
            .get_mut(id)
            .ok_or(StoreError::NotFound(*id))?;
        if record.state.is_sealed() {
            return Err(StoreError::AlreadySealed(*id));
        }
        record.state = ObjectState::Sealed;
        record.receiving = false;
        record.last_used = tick;
        if record.is_evictable() {
            self.lru.insert((tick, *id));
        }
        Ok(record.handle())
    }

    /// Take one reference on a sealed object.
    pub fn acquire(&mut self, id: &ObjectId) -> StoreResult<ObjectHandle> {
        let record = self
            .records
            .get_mut(id)
            .ok_or(StoreError::NotFound(*id))?;
        if !record.state.is_sealed() {
            return Err(StoreError::NotSealed(*id));
        }
        if record.ref_count == 0 {
            self.lru.remove(&(record.last_used, *id));
        }
        record.ref_count += 1;
        Ok(record.handle())
    }

    /// Drop one reference; returns the remaining count.
    ///
    /// An object whose count reaches zero rejoins the eviction queue as the
    /// most recently used entry.
    pub fn release(&mut self, id: &ObjectId) -> StoreResult<u32> {
        let tick = self.tick();
        let record = self
            .records
            .get_mut(id)
            .ok_or(StoreError::NotFound(*id))?;
        if record.ref_count == 0 {
            return Err(StoreError::NotReferenced(*id));
        }
        record.ref_count -= 1;
        if record.ref_count == 0 {
            record.last_used = tick;
            self.lru.insert((tick, *id));
        }
        Ok(record.ref_count)
    }

    /// Remove a record unconditionally.
    pub fn remove(&mut self, id: &ObjectId) -> Option<ObjectRecord> {
        let record = self.records.remove(id)?;
        self.lru.remove(&(record.last_used, *id));
        Some(record)
    }

    /// The least recently used evictable object.
    pub fn oldest_evictable(&self) -> Option<ObjectId> {
        self.lru.iter().next().map(|(_, id)| *id)
    }

    /// Evictable objects in LRU order, as many as needed to cover
    /// `needed` bytes of allocation (or all of them if that is not enough).
    pub fn eviction_candidates(&self, needed: u64) -> Vec<ObjectId> {
        let mut covered = 0u64;
        let mut out = Vec::new();
        for (_, id) in &self.lru {
            if covered >= needed {
                break;
            }
            if let Some(record) = self.records.get(id) {
                covered = covered.saturating_add(record.block_size);
                out.push(*id);
            }
        }
        out
    }

    pub fn evictable_count(&self) -> usize {
        self.lru.len()
    }

    pub fn sealed_count(&self) -> usize {
        self.records
            .values()
            .filter(|r| r.state.is_sealed())
            .count()
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: u8) -> ObjectId {
        ObjectId::from_raw([n; 20])
    }

    fn record(n: u8, offset: u64) -> ObjectRecord {
        ObjectRecord::new(id(n), offset, 100, 4, 128)
    }

    #[test]
    fn insert_rejects_duplicates() {
        let mut table = ObjectTable::new();
        table.insert(record(1, 0)).unwrap();
        assert!(matches!(
            table.insert(record(1, 128)),
            Err(StoreError::ObjectExists(x)) if x == id(1)
        ));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn record_layout_puts_metadata_after_data() {
        let r = record(1, 256);
        let h = r.handle();
        assert_eq!(h.data, MappedRegion::writable(256, 100));
        assert_eq!(h.metadata, MappedRegion::read_only(356, 4));
    }

    #[test]
    fn seal_transitions_once() {
        let mut table = ObjectTable::new();
        table.insert(record(1, 0)).unwrap();
        let handle = table.seal(&id(1)).unwrap();
        assert!(!handle.data.writable);
        assert!(matches!(
            table.seal(&id(1)),
            Err(StoreError::AlreadySealed(_))
        ));
        assert!(matches!(table.seal(&id(2)), Err(StoreError::NotFound(_))));
    }

    #[test]
    fn only_sealed_unreferenced_objects_are_evictable() {
        let mut table = ObjectTable::new();
        table.insert(record(1, 0)).unwrap();
        assert_eq!(table.evictable_count(), 0);

        table.seal(&id(1)).unwrap();
        assert_eq!(table.oldest_evictable(), Some(id(1)));

        table.acquire(&id(1)).unwrap();
        table.acquire(&id(1)).unwrap();
        assert_eq!(table.oldest_evictable(), None);

        assert_eq!(table.release(&id(1)).unwrap(), 1);
        assert_eq!(table.oldest_evictable(), None);
        assert_eq!(table.release(&id(1)).unwrap(), 0);
        assert_eq!(table.oldest_evictable(), Some(id(1)));
    }

    #[test]
    fn acquire_requires_sealed() {
        let mut table = ObjectTable::new();
        table.insert(record(1, 0)).unwrap();
        assert!(matches!(
            table.acquire(&id(1)),
            Err(StoreError::NotSealed(_))
        ));
        assert!(matches!(
            table.acquire(&id(9)),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn release_without_reference_fails() {
        let mut table = ObjectTable::new();
        table.insert(record(1, 0)).unwrap();
        table.seal(&id(1)).unwrap();
        assert!(matches!(
            table.release(&id(1)),
            Err(StoreError::NotReferenced(_))
        ));
    }

    #[test]
    fn lru_order_follows_seal_then_release() {
        let mut table = ObjectTable::new();
        for n in 1..=3 {
            table.insert(record(n, u64::from(n) * 128)).unwrap();
            table.seal(&id(n)).unwrap();
        }
        assert_eq!(table.eviction_candidates(u64::MAX), vec![id(1), id(2), id(3)]);

        // Touching the oldest moves it to the back.
        table.acquire(&id(1)).unwrap();
        table.release(&id(1)).unwrap();
        assert_eq!(table.eviction_candidates(u64::MAX), vec![id(2), id(3), id(1)]);
    }

    #[test]
    fn eviction_candidates_stop_once_enough_is_covered() {
        let mut table = ObjectTable::new();
        for n in 1..=4 {
            table.insert(record(n, u64::from(n) * 128)).unwrap();
            table.seal(&id(n)).unwrap();
        }
        assert_eq!(table.eviction_candidates(0), Vec::<ObjectId>::new());
        assert_eq!(table.eviction_candidates(128), vec![id(1)]);
        assert_eq!(table.eviction_candidates(129), vec![id(1), id(2)]);
    }

    #[test]
    fn remove_clears_queue_entry() {
        let mut table = ObjectTable::new();
        table.insert(record(1, 0)).unwrap();
        table.seal(&id(1)).unwrap();
        let removed = table.remove(&id(1)).unwrap();
        assert_eq!(removed.block_size, 128);
        assert_eq!(table.evictable_count(), 0);
        assert!(table.remove(&id(1)).is_none());
        assert!(table.is_empty());
    }

    #[test]
    fn sealed_count_tracks_state() {
        let mut table = ObjectTable::new();
        table.insert(record(1, 0)).unwrap();
        table.insert(record(2, 128)).unwrap();
        table.seal(&id(2)).unwrap();
        assert_eq!(table.sealed_count(), 1);
        assert!(table.contains(&id(1)));
        assert_eq!(table.get(&id(2)).unwrap().state, ObjectState::Sealed);
    }
}
