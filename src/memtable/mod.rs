//! # Memtable Module
//!
//! The mutable, in-memory write buffer of the storage engine (§4.1/§4.6).
//!
//! ## Design Invariants
//!
//! - A key maps to at most one value at a time: writes are last-writer-wins,
//!   with no per-key versioning (there are no deletes or MVCC in this
//!   engine, per the system's scope).
//! - Every mutation is appended to the WAL *before* being applied in memory.
//! - `scan` and `iter_for_flush` return keys in ascending order.
//!
//! ## Flush Semantics
//!
//! - `iter_for_flush` returns every `(key, value)` pair currently held, in
//!   key order — sufficient for the SSTable builder to consume directly.
//! - Flush iteration does not mutate or clear in-memory state; the caller
//!   (the engine) is responsible for retiring the memtable once its SSTable
//!   has been durably written.
//!
//! ## Frozen Memtable
//!
//! - A `FrozenMemtable` is read-only.
//! - It retains ownership of the WAL to guarantee durability until its data
//!   has been persisted to an SSTable.

#[cfg(test)]
mod tests;

use std::{
    collections::BTreeMap,
    path::Path,
    sync::{Arc, RwLock},
};

use crate::record::Record;
use crate::wal::{Wal, WalError};
use thiserror::Error;
use tracing::{error, info, trace};

/// Errors returned by [`Memtable`] operations.
#[derive(Debug, Error)]
pub enum MemtableError {
    /// Underlying WAL I/O failure.
    #[error("WAL error: {0}")]
    Wal(#[from] WalError),

    /// Write buffer limit reached; a flush is required before further writes.
    #[error("flush required")]
    FlushRequired,

    /// Internal invariant violation or poisoned lock.
    #[error("internal error: {0}")]
    Internal(String),
}

/// The mutable, in-memory write buffer of the storage engine.
///
/// Internally an ordered `BTreeMap<Vec<u8>, Vec<u8>>`. Writers acquire an
/// exclusive lock; readers may proceed concurrently.
pub struct Memtable {
    inner: Arc<RwLock<MemtableInner>>,

    /// Associated write-ahead log for durability.
    wal: Wal<Record>,
}

struct MemtableInner {
    /// Key -> value. Last write for a key wins; there is no versioning.
    map: BTreeMap<Vec<u8>, Vec<u8>>,

    /// Approximate in-memory footprint, in bytes, of `map`.
    approximate_size: usize,

    /// Configured maximum buffer size before flush is required.
    write_buffer_size: usize,
}

impl Memtable {
    /// Creates a brand-new, empty [`Memtable`] backed by a freshly created
    /// write-ahead log at `wal_path`. Fails if a WAL already exists there.
    pub fn create<P: AsRef<Path>>(
        wal_path: P,
        max_record_size: Option<u32>,
        write_buffer_size: usize,
    ) -> Result<Self, MemtableError> {
        info!(path = %wal_path.as_ref().display(), "creating empty memtable");

        let wal = Wal::create(&wal_path, max_record_size)?;

        Ok(Self {
            inner: Arc::new(RwLock::new(MemtableInner {
                map: BTreeMap::new(),
                approximate_size: 0,
                write_buffer_size,
            })),
            wal,
        })
    }

    /// Reconstructs a [`Memtable`] from an existing write-ahead log at
    /// `wal_path`, replaying its records to rebuild in-memory state.
    ///
    /// The WAL is opened read-only: a memtable reconstructed this way is
    /// treated as immutable, and further writes to it are undefined.
    pub fn new<P: AsRef<Path>>(
        wal_path: P,
        write_buffer_size: usize,
    ) -> Result<Self, MemtableError> {
        info!(path = %wal_path.as_ref().display(), "initializing memtable with WAL replay");

        let wal = Wal::open(&wal_path)?;

        let mut map = BTreeMap::new();
        let mut approximate_size = 0usize;

        for record in wal.replay_iter()? {
            let record: Record = record?;
            approximate_size += entry_size(&record.key, &record.value);
            map.insert(record.key, record.value);
        }

        info!(keys = map.len(), "memtable initialized from WAL replay");

        Ok(Self {
            inner: Arc::new(RwLock::new(MemtableInner {
                map,
                approximate_size,
                write_buffer_size,
            })),
            wal,
        })
    }

    /// Inserts or updates a key with a new value.
    ///
    /// The mutation is appended to the WAL first, then applied in memory.
    /// Fails with [`MemtableError::FlushRequired`] if applying the write
    /// would exceed the configured write-buffer size.
    pub fn put(&self, key: Vec<u8>, value: Vec<u8>) -> Result<(), MemtableError> {
        trace!(key = %HexKey(&key), "memtable put");

        let added_size = entry_size(&key, &value);
        let record = Record::new(key.clone(), value.clone());

        let mut guard = self.inner.write().map_err(|_| {
            error!("memtable lock poisoned during put");
            MemtableError::Internal("lock poisoned".into())
        })?;

        // Monotonically increasing: over-counts on updates, which is fine.
        let projected = guard.approximate_size + added_size;
        if projected > guard.write_buffer_size {
            return Err(MemtableError::FlushRequired);
        }

        self.wal.append(&record)?;

        guard.approximate_size = projected;
        guard.map.insert(key, value);

        Ok(())
    }

    /// Retrieves the current value for `key`, if present.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, MemtableError> {
        let guard = self.inner.read().map_err(|_| {
            error!("memtable lock poisoned during get");
            MemtableError::Internal("lock poisoned".into())
        })?;
        Ok(guard.map.get(key).cloned())
    }

    /// Performs an ordered range scan over `[start, end]` (inclusive).
    pub fn scan(
        &self,
        start: &[u8],
        end: &[u8],
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, MemtableError> {
        let guard = self.inner.read().map_err(|_| {
            error!("memtable lock poisoned during scan");
            MemtableError::Internal("lock poisoned".into())
        })?;

        if start > end {
            return Ok(Vec::new());
        }

        Ok(guard
            .map
            .range(start.to_vec()..=end.to_vec())
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    /// Returns a logical snapshot of every `(key, value)` pair, in key
    /// order, suitable for flushing into an SSTable. Does not mutate
    /// in-memory state.
    pub fn iter_for_flush(&self) -> Result<Vec<(Vec<u8>, Vec<u8>)>, MemtableError> {
        let guard = self.inner.read().map_err(|_| {
            error!("memtable lock poisoned during iter_for_flush");
            MemtableError::Internal("lock poisoned".into())
        })?;
        Ok(guard
            .map
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    /// Approximate in-memory footprint in bytes.
    pub fn approximate_size(&self) -> Result<usize, MemtableError> {
        let guard = self.inner.read().map_err(|_| {
            error!("memtable lock poisoned during approximate_size");
            MemtableError::Internal("lock poisoned".into())
        })?;
        Ok(guard.approximate_size)
    }

    /// The path of the memtable's backing WAL file.
    pub fn wal_path(&self) -> &Path {
        self.wal.path()
    }

    /// Converts this mutable memtable into an immutable [`FrozenMemtable`].
    pub fn freeze(self) -> FrozenMemtable {
        FrozenMemtable::new(self)
    }
}

/// An immutable, read-only view of a memtable, awaiting flush to an
/// SSTable. Retains ownership of the WAL so the data stays durable until
/// the flush completes.
pub struct FrozenMemtable {
    memtable: Memtable,
}

impl FrozenMemtable {
    fn new(memtable: Memtable) -> Self {
        Self { memtable }
    }

    /// Retrieves the current value for `key`, if present.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, MemtableError> {
        self.memtable.get(key)
    }

    /// Performs an ordered range scan over `[start, end]`.
    pub fn scan(
        &self,
        start: &[u8],
        end: &[u8],
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, MemtableError> {
        self.memtable.scan(start, end)
    }

    /// Returns every `(key, value)` pair, in key order, for flushing.
    pub fn iter_for_flush(&self) -> Result<Vec<(Vec<u8>, Vec<u8>)>, MemtableError> {
        self.memtable.iter_for_flush()
    }

    /// The path of the frozen memtable's backing WAL file, retained so the
    /// engine can delete it once the flush is durable.
    pub fn wal_path(&self) -> &Path {
        self.memtable.wal_path()
    }
}

fn entry_size(key: &[u8], value: &[u8]) -> usize {
    key.len() + value.len()
}

struct HexKey<'a>(&'a [u8]);

impl std::fmt::Display for HexKey<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.0.len() <= 32 {
            for byte in self.0 {
                write!(f, "{byte:02x}")?;
            }
        } else {
            for byte in &self.0[..16] {
                write!(f, "{byte:02x}")?;
            }
            write!(f, "...[{} bytes]", self.0.len())?;
        }
        Ok(())
    }
}
