//! # LSM engine (C11)
//!
//! The top-level store: owns the active memtable, the chain of immutable
//! memtables awaiting flush, the per-level SSTable deques, and the manifest
//! that durably records how those deques were built. See §4.8/§5 for the
//! exact state machine and concurrency model this module implements.
//!
//! ## State representation
//!
//! `levels[0]` holds the overlapping, recently flushed level-0 SSTables;
//! `levels[1..]` hold the disjoint, size-ratio-bounded runs of levels
//! `1..nb_levels-1`. This single array mirrors exactly what
//! [`crate::manifest::Manifest::reconstruct_sstables`] already returns, so
//! recovery installs it directly with no re-indexing.
//!
//! ## Concurrency
//!
//! Two locks per engine: `state_mutex` serializes freeze/flush/compaction
//! orchestration (at most one such operation runs at a time), while `state`
//! is a reader/writer lock guarding the in-memory fields themselves so that
//! concurrent `get`/`scan` calls never block on each other.

#[cfg(test)]
mod tests;

use std::collections::VecDeque;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use thiserror::Error;
use tracing::{debug, info, trace, warn};

use crate::iter::{ConcatenatingIterator, MergingIterator, RecordIter};
use crate::manifest::{Manifest, ManifestConfig, ManifestError};
use crate::memtable::{FrozenMemtable, Memtable, MemtableError};
use crate::record::Record;
use crate::sstable::{SSTable, SSTableBuilder, SSTableError};
use crate::wal::new_wal_path;

const MANIFEST_FILE_NAME: &str = "manifest.txt";

/// Errors returned by [`Engine`] operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Manifest creation, opening, or replay failed.
    #[error("manifest error: {0}")]
    Manifest(#[from] ManifestError),

    /// A manifest append failed; the engine refuses further mutations.
    #[error("manifest write failed, engine is now read-only: {0}")]
    ManifestWriteFailed(ManifestError),

    /// Memtable operation failed.
    #[error("memtable error: {0}")]
    Memtable(#[from] MemtableError),

    /// SSTable build or read failed.
    #[error("sstable error: {0}")]
    SSTable(#[from] SSTableError),

    /// Underlying I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A write could not be durably appended to the active WAL; in-memory
    /// state was not modified.
    #[error("write failed: {0}")]
    WriteFailed(String),

    /// `scan` was called with `upper < lower`.
    #[error("invalid scan range: lower > upper")]
    RangeInvalid,

    /// A prior manifest write failure put the engine into read-only mode.
    #[error("engine is read-only after a manifest write failure")]
    ReadOnly,

    /// Internal invariant violation or poisoned lock.
    #[error("internal error: {0}")]
    Internal(String),
}

fn poisoned<T>(_: PoisonError<T>) -> EngineError {
    EngineError::Internal("lock poisoned".into())
}

/// Engine configuration, stored verbatim in the manifest header and
/// immutable for the lifetime of a store.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EngineConfig {
    /// Total number of levels, including level 0.
    pub nb_levels: i32,
    /// Size ratio threshold between adjacent levels that triggers
    /// compaction (`|level L| >= levels_ratio * |level L+1|`, by total
    /// on-disk bytes).
    pub levels_ratio: f64,
    /// Number of level-0 SSTables that triggers `force_compaction_l0`.
    pub max_l0_sstables: i32,
    /// Target size, in bytes, of a single SSTable (and the active
    /// memtable's freeze threshold).
    pub max_sstable_size: i32,
    /// Target size, in bytes, of a single data block.
    pub block_size: i32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            nb_levels: 6,
            levels_ratio: 0.1,
            max_l0_sstables: 10,
            max_sstable_size: 256 * 1024 * 1024,
            block_size: 64 * 1024,
        }
    }
}

impl EngineConfig {
    fn to_manifest_config(self) -> ManifestConfig {
        ManifestConfig {
            nb_levels: self.nb_levels,
            levels_ratio: self.levels_ratio,
            max_l0_sstables: self.max_l0_sstables,
            max_sstable_size: self.max_sstable_size,
            block_size: self.block_size,
        }
    }
}

impl From<ManifestConfig> for EngineConfig {
    fn from(config: ManifestConfig) -> Self {
        Self {
            nb_levels: config.nb_levels,
            levels_ratio: config.levels_ratio,
            max_l0_sstables: config.max_l0_sstables,
            max_sstable_size: config.max_sstable_size,
            block_size: config.block_size,
        }
    }
}

struct EngineState {
    active: Memtable,
    /// Newest at the front.
    immutable: VecDeque<FrozenMemtable>,
    /// `levels[0]` is L0 (overlapping); `levels[1..]` are disjoint. Within
    /// each deque, newest at the front.
    levels: Vec<VecDeque<Arc<SSTable>>>,
}

/// The embeddable, ordered key-value store.
pub struct Engine {
    directory: PathBuf,
    manifest: Manifest,
    config: EngineConfig,
    state_mutex: Mutex<()>,
    state: RwLock<EngineState>,
    read_only: AtomicBool,
}

impl Engine {
    /// Creates a brand-new store rooted at `directory` (created if
    /// missing), with a fresh manifest, WAL, and empty levels.
    pub fn create<P: AsRef<Path>>(config: EngineConfig, directory: P) -> Result<Self, EngineError> {
        let directory = directory.as_ref().to_path_buf();
        fs::create_dir_all(&directory)?;

        let manifest = Manifest::create(
            directory.join(MANIFEST_FILE_NAME),
            config.to_manifest_config(),
        )?;

        let wal_path = new_wal_path(&directory);
        let active = Memtable::create(&wal_path, None, usize::MAX)?;

        let levels = (0..config.nb_levels as usize)
            .map(|_| VecDeque::new())
            .collect();

        info!(directory = %directory.display(), "engine created");

        Ok(Self {
            directory,
            manifest,
            config,
            state_mutex: Mutex::new(()),
            state: RwLock::new(EngineState {
                active,
                immutable: VecDeque::new(),
                levels,
            }),
            read_only: AtomicBool::new(false),
        })
    }

    /// Opens an existing store at `directory`: replays the manifest to
    /// reconstruct `levels`, rebuilds any un-flushed memtables from
    /// leftover WAL files (oldest to newest, newest at the head of
    /// `immutable`), and installs a fresh, empty active memtable.
    pub fn open<P: AsRef<Path>>(directory: P) -> Result<Self, EngineError> {
        let directory = directory.as_ref().to_path_buf();
        let manifest = Manifest::open(directory.join(MANIFEST_FILE_NAME))?;
        let config = EngineConfig::from(manifest.config());
        let levels = manifest.reconstruct_sstables(&directory)?;

        let mut immutable = VecDeque::new();
        for (_, wal_path) in collect_wal_entries(&directory)? {
            let memtable = Memtable::new(&wal_path, usize::MAX)?;
            immutable.push_front(memtable.freeze());
        }

        let active_wal_path = new_wal_path(&directory);
        let active = Memtable::create(&active_wal_path, None, usize::MAX)?;

        info!(
            directory = %directory.display(),
            recovered_memtables = immutable.len(),
            "engine opened"
        );

        Ok(Self {
            directory,
            manifest,
            config,
            state_mutex: Mutex::new(()),
            state: RwLock::new(EngineState {
                active,
                immutable,
                levels,
            }),
            read_only: AtomicBool::new(false),
        })
    }

    /// The store's configuration.
    pub fn config(&self) -> EngineConfig {
        self.config
    }

    /// The directory this store is rooted at.
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    fn ensure_writable(&self) -> Result<(), EngineError> {
        if self.read_only.load(Ordering::Acquire) {
            return Err(EngineError::ReadOnly);
        }
        Ok(())
    }

    fn append_manifest_flush(&self, path: String) -> Result<(), EngineError> {
        self.manifest.append_flush(path).map_err(|e| {
            self.read_only.store(true, Ordering::Release);
            EngineError::ManifestWriteFailed(e)
        })
    }

    fn append_manifest_compaction(
        &self,
        level: u8,
        inputs: Vec<String>,
        outputs: Vec<String>,
    ) -> Result<(), EngineError> {
        self.manifest
            .append_compaction(level, inputs, outputs)
            .map_err(|e| {
                self.read_only.store(true, Ordering::Release);
                EngineError::ManifestWriteFailed(e)
            })
    }

    /// Freezes the active memtable, if non-empty, then flushes every
    /// immutable memtable to disk in order (oldest first).
    pub fn close(&self) -> Result<(), EngineError> {
        {
            let _lock = self.state_mutex.lock().map_err(poisoned)?;
            let active_size = {
                let guard = self.state.read().map_err(poisoned)?;
                guard.active.approximate_size()?
            };
            if active_size > 0 {
                self.freeze_locked()?;
            }
        }
        while self.flush_next_immutable_memtable()? {}
        info!(directory = %self.directory.display(), "engine closed");
        Ok(())
    }

    /// Inserts or updates `key` with `value`.
    pub fn put(&self, key: Vec<u8>, value: Vec<u8>) -> Result<(), EngineError> {
        self.ensure_writable()?;
        trace!(key_len = key.len(), "engine put");

        {
            let guard = self.state.read().map_err(poisoned)?;
            match guard.active.put(key, value) {
                Ok(()) => {}
                Err(MemtableError::Wal(e)) => {
                    return Err(EngineError::WriteFailed(e.to_string()));
                }
                Err(e) => return Err(e.into()),
            }
        }

        self.try_freeze()?;
        Ok(())
    }

    /// Retrieves the current value for `key`, if present. Walks the active
    /// memtable, then immutable memtables newest to oldest, then L0
    /// newest to oldest, then levels `1..N-1`.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, EngineError> {
        let guard = self.state.read().map_err(poisoned)?;

        if let Some(value) = guard.active.get(key)? {
            return Ok(Some(value));
        }
        for memtable in &guard.immutable {
            if let Some(value) = memtable.get(key)? {
                return Ok(Some(value));
            }
        }
        for table in &guard.levels[0] {
            if let Some(value) = table.get(key)? {
                return Ok(Some(value));
            }
        }
        for level in &guard.levels[1..] {
            for table in level {
                if table.key_in_range(key) {
                    return Ok(table.get(key)?);
                }
            }
        }
        Ok(None)
    }

    /// Returns every `(key, value)` pair with key in `[lower, upper]`, in
    /// ascending key order, newest write winning on duplicates.
    pub fn scan(
        &self,
        lower: &[u8],
        upper: &[u8],
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, EngineError> {
        if lower > upper {
            return Err(EngineError::RangeInvalid);
        }

        let guard = self.state.read().map_err(poisoned)?;
        let mut sources: Vec<RecordIter> = Vec::new();

        let active_pairs = guard.active.scan(lower, upper)?;
        sources.push(Box::new(
            active_pairs.into_iter().map(|(k, v)| Record::new(k, v)),
        ));

        for memtable in &guard.immutable {
            let pairs = memtable.scan(lower, upper)?;
            sources.push(Box::new(pairs.into_iter().map(|(k, v)| Record::new(k, v))));
        }

        for table in &guard.levels[0] {
            if table.range_overlaps(lower, upper) {
                sources.push(Box::new(table.scan(lower, upper)?));
            }
        }

        for level in &guard.levels[1..] {
            let mut candidates: Vec<&Arc<SSTable>> = level
                .iter()
                .filter(|t| t.range_overlaps(lower, upper))
                .collect();
            candidates.sort_by(|a, b| a.first_key().cmp(b.first_key()));

            let mut level_sources: Vec<RecordIter> = Vec::with_capacity(candidates.len());
            for table in candidates {
                level_sources.push(Box::new(table.scan(lower, upper)?));
            }
            if !level_sources.is_empty() {
                sources.push(Box::new(ConcatenatingIterator::new(level_sources)));
            }
        }

        drop(guard);

        let merged = MergingIterator::new(sources);
        Ok(merged.map(|r| (r.key, r.value)).collect())
    }

    fn try_freeze(&self) -> Result<(), EngineError> {
        let threshold = self.config.max_sstable_size as usize;

        let size = {
            let guard = self.state.read().map_err(poisoned)?;
            guard.active.approximate_size()?
        };
        if size < threshold {
            return Ok(());
        }

        let _lock = self.state_mutex.lock().map_err(poisoned)?;
        let size = {
            let guard = self.state.read().map_err(poisoned)?;
            guard.active.approximate_size()?
        };
        if size < threshold {
            return Ok(());
        }
        self.freeze_locked()
    }

    /// Assumes the caller already holds `state_mutex`.
    fn freeze_locked(&self) -> Result<(), EngineError> {
        let wal_path = new_wal_path(&self.directory);
        let new_active = Memtable::create(&wal_path, None, usize::MAX)?;

        let mut guard = self.state.write().map_err(poisoned)?;
        let old_active = std::mem::replace(&mut guard.active, new_active);
        guard.immutable.push_front(old_active.freeze());
        debug!(immutable = guard.immutable.len(), "memtable frozen");
        Ok(())
    }

    /// Flushes the oldest immutable memtable to a new level-0 SSTable, if
    /// any is pending. Returns `false` if there was nothing to flush.
    pub fn flush_next_immutable_memtable(&self) -> Result<bool, EngineError> {
        self.ensure_writable()?;
        let _lock = self.state_mutex.lock().map_err(poisoned)?;

        let snapshot = {
            let guard = self.state.read().map_err(poisoned)?;
            guard
                .immutable
                .back()
                .map(|mt| (mt.iter_for_flush(), mt.wal_path().to_path_buf()))
        };
        let Some((pairs, wal_path)) = snapshot else {
            return Ok(false);
        };
        let pairs = pairs?;

        let sst_path = new_sstable_path(&self.directory);
        let mut builder = SSTableBuilder::new(
            self.config.max_sstable_size as usize,
            self.config.block_size as usize,
        );
        for (key, value) in pairs {
            builder.add(&key, &value)?;
        }
        let table = Arc::new(builder.build(&sst_path)?);

        {
            let mut guard = self.state.write().map_err(poisoned)?;
            guard.immutable.pop_back();
            guard.levels[0].push_front(Arc::clone(&table));
        }

        self.append_manifest_flush(file_name_of(&sst_path))?;

        if let Err(e) = fs::remove_file(&wal_path) {
            warn!(path = %wal_path.display(), error = %e, "failed to delete flushed memtable's WAL");
        }

        info!(path = %sst_path.display(), "flushed immutable memtable");

        drop(_lock);
        self.try_compact()?;
        Ok(true)
    }

    /// Compacts all of level 0 into level 1, if level 0 is non-empty.
    pub fn force_compaction_l0(&self) -> Result<bool, EngineError> {
        self.run_compaction(0)
    }

    /// Compacts all of level `level` (`>= 1`) into `min(level + 1, N - 1)`,
    /// if that level is non-empty.
    pub fn force_compaction_level(&self, level: usize) -> Result<bool, EngineError> {
        if level == 0 {
            return Err(EngineError::Internal(
                "use force_compaction_l0 for level 0".into(),
            ));
        }
        if level >= self.config.nb_levels as usize {
            return Err(EngineError::Internal(format!(
                "level {level} is out of range"
            )));
        }
        self.run_compaction(level)
    }

    fn run_compaction(&self, level: usize) -> Result<bool, EngineError> {
        self.ensure_writable()?;
        let _lock = self.state_mutex.lock().map_err(poisoned)?;

        let inputs: Vec<Arc<SSTable>> = {
            let guard = self.state.read().map_err(poisoned)?;
            guard.levels[level].iter().cloned().collect()
        };
        if inputs.is_empty() {
            return Ok(false);
        }

        let merged: Box<dyn Iterator<Item = Record>> = if level == 0 {
            let mut sources: Vec<RecordIter> = Vec::with_capacity(inputs.len());
            for table in &inputs {
                sources.push(Box::new(table.iter()?));
            }
            Box::new(MergingIterator::new(sources))
        } else {
            let mut ordered = inputs.clone();
            ordered.sort_by(|a, b| a.first_key().cmp(b.first_key()));
            let mut sources: Vec<RecordIter> = Vec::with_capacity(ordered.len());
            for table in &ordered {
                sources.push(Box::new(table.iter()?));
            }
            Box::new(ConcatenatingIterator::new(sources))
        };

        let outputs = self.build_sstables_from(merged)?;
        let dest = (level + 1).min(self.config.nb_levels as usize - 1);

        {
            let mut guard = self.state.write().map_err(poisoned)?;
            let input_paths: Vec<PathBuf> = inputs.iter().map(|t| t.path().to_path_buf()).collect();
            guard.levels[level].retain(|t| !input_paths.iter().any(|p| p == t.path()));
            for table in outputs.iter().rev() {
                guard.levels[dest].push_front(Arc::clone(table));
            }
        }

        let input_names = inputs.iter().map(|t| file_name_of(t.path())).collect();
        let output_names = outputs.iter().map(|t| file_name_of(t.path())).collect();
        self.append_manifest_compaction(level as u8, input_names, output_names)?;

        info!(level, inputs = inputs.len(), outputs = outputs.len(), "compaction finished");
        Ok(true)
    }

    fn build_sstables_from(
        &self,
        mut records: Box<dyn Iterator<Item = Record>>,
    ) -> Result<Vec<Arc<SSTable>>, EngineError> {
        let sstable_size = self.config.max_sstable_size as usize;
        let block_size = self.config.block_size as usize;

        let mut outputs = Vec::new();
        let mut builder = SSTableBuilder::new(sstable_size, block_size);

        for record in records.by_ref() {
            builder.add(&record.key, &record.value)?;
            if builder.bytes_written() >= sstable_size {
                let path = new_sstable_path(&self.directory);
                outputs.push(Arc::new(builder.build(&path)?));
                builder = SSTableBuilder::new(sstable_size, block_size);
            }
        }
        if !builder.is_empty() {
            let path = new_sstable_path(&self.directory);
            outputs.push(Arc::new(builder.build(&path)?));
        }

        Ok(outputs)
    }

    /// Triggers `force_compaction_l0` if level 0 has grown past
    /// `max_l0_sstables`, then cascades through levels `1..N-2`,
    /// compacting any level whose on-disk size has grown past
    /// `levels_ratio` of the next level's.
    fn try_compact(&self) -> Result<(), EngineError> {
        let l0_len = {
            let guard = self.state.read().map_err(poisoned)?;
            guard.levels[0].len()
        };
        if l0_len >= self.config.max_l0_sstables as usize {
            self.force_compaction_l0()?;
        }

        let nb_levels = self.config.nb_levels as usize;
        for level in 1..nb_levels.saturating_sub(1) {
            let (level_size, next_size) = {
                let guard = self.state.read().map_err(poisoned)?;
                (
                    level_size_bytes(&guard.levels[level]),
                    level_size_bytes(&guard.levels[level + 1]),
                )
            };
            if level_size > 0 && level_size as f64 >= self.config.levels_ratio * next_size as f64 {
                self.run_compaction(level)?;
            }
        }

        Ok(())
    }
}

fn level_size_bytes(level: &VecDeque<Arc<SSTable>>) -> u64 {
    level
        .iter()
        .map(|t| fs::metadata(t.path()).map(|m| m.len()).unwrap_or(0))
        .sum()
}

fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn current_timestamp_us() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system clock before UNIX epoch")
        .as_micros() as u64
}

fn new_sstable_path(dir: &Path) -> PathBuf {
    let mut created_at_us = current_timestamp_us();
    let mut path = dir.join(format!("{created_at_us}.sst"));
    while path.exists() {
        created_at_us += 1;
        path = dir.join(format!("{created_at_us}.sst"));
    }
    path
}

/// Finds every `{timestamp_us}.wal` file directly under `dir`, returning
/// `(timestamp, path)` pairs sorted oldest first.
fn collect_wal_entries(dir: &Path) -> Result<Vec<(u64, PathBuf)>, EngineError> {
    let mut entries = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let Some(ts_str) = name.strip_suffix(".wal") else {
            continue;
        };
        if let Ok(ts) = ts_str.parse::<u64>() {
            entries.push((ts, path));
        }
    }
    entries.sort_by_key(|(ts, _)| *ts);
    Ok(entries)
}
