use std::collections::BTreeMap;

/// Every block handed out starts and ends on this boundary.
pub const ALIGNMENT: u64 = 64;

/// Errors from the arena allocator.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AllocError {
    /// No single free range is large enough.
    #[error("no free range of {requested} bytes ({free} bytes free, largest range {largest})")]
    OutOfMemory {
        requested: u64,
        free: u64,
        largest: u64,
    },

    /// A released range overlaps space that is already free.
    #[error("release of {offset}+{size} overlaps free space")]
    DoubleFree { offset: u64, size: u64 },

    /// A released range is misaligned or extends past the arena.
    #[error("range {offset}+{size} lies outside the {capacity}-byte arena")]
    OutOfRange {
        offset: u64,
        size: u64,
        capacity: u64,
    },

    /// The requested size cannot be rounded up without overflowing.
    #[error("size {0} overflows the arena")]
    SizeOverflow(u64),
}

/// Result alias for allocator operations.
pub type AllocResult<T> = Result<T, AllocError>;

/// First-fit allocator over a fixed-size arena.
///
/// Free ranges are kept in an offset-ordered map so that a release can find
/// its physical neighbours and merge with them. There is no compaction:
/// enough total free space split across ranges still fails with
/// [`AllocError::OutOfMemory`].
#[derive(Debug, Clone)]
pub struct Allocator {
    capacity: u64,
    /// offset -> length of each free range. Ranges never touch or overlap.
    free: BTreeMap<u64, u64>,
    free_bytes: u64,
}

impl Allocator {
    /// Create an allocator for an arena of `capacity` bytes.
    ///
    /// A trailing remainder smaller than [`ALIGNMENT`] is never handed out.
    pub fn new(capacity: u64) -> Self {
        let capacity = capacity - capacity % ALIGNMENT;
        let mut free = BTreeMap::new();
        if capacity > 0 {
            free.insert(0, capacity);
        }
        Self {
            capacity,
            free,
            free_bytes: capacity,
        }
    }

    /// The block size actually consumed by a request of `len` bytes.
    ///
    /// Zero-length requests still take one aligned block so that every live
    /// allocation has a distinct offset.
    pub fn block_size(len: u64) -> Option<u64> {
        let len = len.max(1);
        len.checked_add(ALIGNMENT - 1)
            .map(|padded| padded - padded % ALIGNMENT)
    }

    /// Reserve a block of at least `size` bytes and return its offset.
    pub fn reserve(&mut self, size: u64) -> AllocResult<u64> {
        let size = Self::block_size(size).ok_or(AllocError::SizeOverflow(size))?;
        let found = self
            .free
            .iter()
            .find(|(_, &len)| len >= size)
            .map(|(&offset, &len)| (offset, len));

        let Some((offset, len)) = found else {
            return Err(AllocError::OutOfMemory {
                requested: size,
                free: self.free_bytes,
                largest: self.largest_free(),
            });
        };

        self.free.remove(&offset);
        if len > size {
            self.free.insert(offset + size, len - size);
        }
        self.free_bytes -= size;
        Ok(offset)
    }

    /// Return a block previously obtained from [`reserve`](Self::reserve).
    ///
    /// `size` is the size originally requested (or its block size); it is
    /// rounded the same way. The block is merged with adjacent free ranges.
    pub fn release(&mut self, offset: u64, size: u64) -> AllocResult<()> {
        let size = Self::block_size(size).ok_or(AllocError::SizeOverflow(size))?;
        let end = offset.checked_add(size).ok_or(AllocError::SizeOverflow(size))?;
        if offset % ALIGNMENT != 0 || end > self.capacity {
            return Err(AllocError::OutOfRange {
                offset,
                size,
                capacity: self.capacity,
            });
        }

        let prev = self
            .free
            .range(..=offset)
            .next_back()
            .map(|(&o, &l)| (o, l));
        if let Some((p, plen)) = prev {
            if p + plen > offset {
                return Err(AllocError::DoubleFree { offset, size });
            }
        }
        let next = self.free.range(offset..).next().map(|(&o, &l)| (o, l));
        if let Some((n, _)) = next {
            if n < end {
                return Err(AllocError::DoubleFree { offset, size });
            }
        }

        let mut start = offset;
        let mut len = size;
        if let Some((p, plen)) = prev {
            if p + plen == offset {
                self.free.remove(&p);
                start = p;
                len += plen;
            }
        }
        if let Some((n, nlen)) = next {
            if n == end {
                self.free.remove(&n);
                len += nlen;
            }
        }
        self.free.insert(start, len);
        self.free_bytes += size;
        Ok(())
    }

    /// Usable capacity in bytes.
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Total free bytes across all ranges.
    pub fn free_bytes(&self) -> u64 {
        self.free_bytes
    }

    /// Bytes currently handed out.
    pub fn allocated_bytes(&self) -> u64 {
        self.capacity - self.free_bytes
    }

    /// Length of the largest free range.
    pub fn largest_free(&self) -> u64 {
        self.free.values().copied().max().unwrap_or(0)
    }

    /// Number of disjoint free ranges.
    pub fn fragment_count(&self) -> usize {
        self.free.len()
    }

    /// Returns `true` if a request of `size` bytes would succeed right now.
    pub fn can_fit(&self, size: u64) -> bool {
        Self::block_size(size).is_some_and(|size| self.largest_free() >= size)
    }
}
