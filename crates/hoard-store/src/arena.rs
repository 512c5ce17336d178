use std::io;
use std::path::Path;

use hoard_types::MappedRegion;
use memmap2::MmapMut;
use tempfile::NamedTempFile;
use tracing::info;

use crate::error::{StoreError, StoreResult};

/// The fixed-size shared memory region backing every object payload.
///
/// The arena is a file created in a shared-memory directory (normally
/// `/dev/shm`) and mapped `MAP_SHARED`, so client processes that map the
/// same path see the same bytes. The file is removed when the arena is
/// dropped; it never grows or shrinks while mapped.
pub struct Arena {
    file: NamedTempFile,
    map: MmapMut,
    capacity: u64,
}

impl Arena {
    /// Create and map a new arena of `capacity` bytes inside `dir`.
    pub fn create(dir: &Path, capacity: u64) -> StoreResult<Self> {
        if capacity == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "arena size must be non-zero",
            )
            .into());
        }
        let file = tempfile::Builder::new()
            .prefix("hoard-arena-")
            .tempfile_in(dir)?;
        file.as_file().set_len(capacity)?;

        // SAFETY: the file was just created by this process with a fixed
        // length that is never changed while mapped. Other processes may map
        // and write it; the store only hands out disjoint ranges, and torn
        // reads by a misbehaving client cannot violate memory safety here
        // because all access goes through bounds-checked byte slices.
        let map = unsafe { MmapMut::map_mut(file.as_file())? };

        info!(path = %file.path().display(), capacity, "arena mapped");
        Ok(Self {
            file,
            map,
            capacity,
        })
    }

    /// Path clients open to map the arena.
    pub fn path(&self) -> &Path {
        self.file.path()
    }

    /// Size of the mapping in bytes.
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Copy `bytes` into the arena starting at `offset`.
    pub fn write(&mut self, offset: u64, bytes: &[u8]) -> StoreResult<()> {
        let range = self.range(offset, bytes.len() as u64)?;
        self.map[range].copy_from_slice(bytes);
        Ok(())
    }

    /// Borrow `len` bytes starting at `offset`.
    pub fn read(&self, offset: u64, len: u64) -> StoreResult<&[u8]> {
        let range = self.range(offset, len)?;
        Ok(&self.map[range])
    }

    /// Borrow the bytes covered by a region.
    pub fn slice(&self, region: MappedRegion) -> StoreResult<&[u8]> {
        self.read(region.offset, region.len)
    }

    fn range(&self, offset: u64, len: u64) -> StoreResult<std::ops::Range<usize>> {
        MappedRegion::read_only(offset, len)
            .as_range()
            .filter(|r| r.end as u64 <= self.capacity)
            .ok_or(StoreError::OutOfBounds { offset, len })
    }
}

impl std::fmt::Debug for Arena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Arena")
            .field("path", &self.file.path())
            .field("capacity", &self.capacity)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let mut arena = Arena::create(dir.path(), 4096).unwrap();
        arena.write(100, b"hello").unwrap();
        assert_eq!(arena.read(100, 5).unwrap(), b"hello");
        assert_eq!(
            arena.slice(MappedRegion::read_only(100, 5)).unwrap(),
            b"hello"
        );
    }

    #[test]
    fn backing_file_has_arena_size() {
        let dir = tempfile::tempdir().unwrap();
        let arena = Arena::create(dir.path(), 8192).unwrap();
        let len = std::fs::metadata(arena.path()).unwrap().len();
        assert_eq!(len, 8192);
        assert!(arena.path().starts_with(dir.path()));
    }

    #[test]
    fn writes_are_visible_through_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut arena = Arena::create(dir.path(), 4096).unwrap();
        arena.write(10, b"shared").unwrap();
        arena.map.flush().unwrap();
        let contents = std::fs::read(arena.path()).unwrap();
        assert_eq!(&contents[10..16], b"shared");
    }

    #[test]
    fn out_of_bounds_access_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut arena = Arena::create(dir.path(), 128).unwrap();
        assert!(matches!(
            arena.write(120, &[0u8; 16]),
            Err(StoreError::OutOfBounds { offset: 120, len: 16 })
        ));
        assert!(arena.read(u64::MAX, 2).is_err());
        assert!(arena.read(128, 0).is_ok());
    }

    #[test]
    fn zero_capacity_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            Arena::create(dir.path(), 0),
            Err(StoreError::Io(_))
        ));
    }

    #[test]
    fn file_is_removed_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let arena = Arena::create(dir.path(), 64).unwrap();
        let path = arena.path().to_path_buf();
        drop(arena);
        assert!(!path.exists());
    }
}
