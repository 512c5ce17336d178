use std::ops::Range;

use serde::{Deserialize, Serialize};

use crate::object::ObjectId;

/// A capability-like reference to a byte range of the shared arena.
///
/// Clients never receive raw addresses. They resolve `offset..offset + len`
/// against their own mapping of the arena file. `writable` is only set on
/// the data region of an object that has been created but not yet sealed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MappedRegion {
    pub offset: u64,
    pub len: u64,
    pub writable: bool,
}

impl MappedRegion {
    pub fn read_only(offset: u64, len: u64) -> Self {
        Self {
            offset,
            len,
            writable: false,
        }
    }

    pub fn writable(offset: u64, len: u64) -> Self {
        Self {
            offset,
            len,
            writable: true,
        }
    }

    /// The same range with write access dropped.
    pub fn to_read_only(self) -> Self {
        Self {
            writable: false,
            ..self
        }
    }

    /// One past the last byte of the region.
    pub fn end(&self) -> u64 {
        self.offset + self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The region as a `usize` range, or `None` if it does not fit in
    /// this platform's address space.
    pub fn as_range(&self) -> Option<Range<usize>> {
        let start = usize::try_from(self.offset).ok()?;
        let end = usize::try_from(self.offset.checked_add(self.len)?).ok()?;
        Some(start..end)
    }

    /// Returns `true` if `[at, at + n)` lies inside this region.
    pub fn contains_span(&self, at: u64, n: u64) -> bool {
        at.checked_add(n).is_some_and(|end| end <= self.len)
    }
}

/// The two regions that make up a stored object.
///
/// Data and metadata are independently sized; metadata is placed
/// immediately after the data in the arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectHandle {
    pub id: ObjectId,
    pub data: MappedRegion,
    pub metadata: MappedRegion,
}

impl ObjectHandle {
    /// Total bytes covered by data and metadata.
    pub fn total_len(&self) -> u64 {
        self.data.len + self.metadata.len
    }

    /// The same handle with write access dropped on both regions.
    pub fn to_read_only(self) -> Self {
        Self {
            data: self.data.to_read_only(),
            metadata: self.metadata.to_read_only(),
            ..self
        }
    }
}
