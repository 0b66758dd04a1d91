//! SSTable builder (C6) — streams records into data blocks and emits a
//! complete SSTable file.
//!
//! Records must be added in sorted key order (callers — the memtable flush
//! path and the compaction path — already produce sorted, deduplicated
//! streams). `add` tries the current data block first; when the block
//! refuses a record, the block is finalized, its meta block recorded, and a
//! fresh block is started before retrying. The file is written to a
//! temporary path and atomically renamed into place so a reader never
//! observes a partially written SSTable.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::block::DataBlockBuilder;
use crate::bloom::BloomFilter;

use super::{MetaBlock, SSTable, SSTableError};

/// Default Bloom filter false-positive rate, per §6.
pub const DEFAULT_BLOOM_FP_RATE: f64 = 0.001;

/// Accumulates records into data blocks and, on [`SSTableBuilder::build`],
/// writes out a complete SSTable file.
pub struct SSTableBuilder {
    block_size: usize,
    sstable_size: usize,
    current_block: DataBlockBuilder,
    finished_blocks: Vec<(Vec<u8>, MetaBlock)>,
    data_bytes_written: usize,
    keys_seen: Vec<Vec<u8>>,
}

impl SSTableBuilder {
    /// Creates a builder targeting `block_size`-byte data blocks, intended
    /// to stop accepting new blocks once the in-progress buffer reaches
    /// `sstable_size` bytes (checked by the caller between `add` calls).
    pub fn new(sstable_size: usize, block_size: usize) -> Self {
        Self {
            block_size,
            sstable_size,
            current_block: DataBlockBuilder::new(block_size),
            finished_blocks: Vec::new(),
            data_bytes_written: 0,
            keys_seen: Vec::new(),
        }
    }

    /// The configured target SSTable size in bytes.
    pub fn sstable_size(&self) -> usize {
        self.sstable_size
    }

    /// The number of data bytes already rolled into finished blocks (does
    /// not include the in-progress block).
    pub fn bytes_written(&self) -> usize {
        self.data_bytes_written
    }

    /// Returns `true` if no record has been added yet.
    pub fn is_empty(&self) -> bool {
        self.finished_blocks.is_empty() && self.current_block.is_empty()
    }

    /// Adds a record, rolling the current data block over to a fresh one as
    /// needed.
    pub fn add(&mut self, key: &[u8], value: &[u8]) -> Result<(), SSTableError> {
        if self.current_block.add(key, value)? {
            self.keys_seen.push(key.to_vec());
            return Ok(());
        }

        self.finish_block();

        if !self.current_block.add(key, value)? {
            // A single record that doesn't fit into a fresh, empty block is
            // reported as BlockError::Overflow by add() itself, so this
            // branch only reachable if add() returned Ok(false) again,
            // which cannot happen against an empty builder.
            return Err(SSTableError::Malformed(
                "record rejected by an empty data block".into(),
            ));
        }
        self.keys_seen.push(key.to_vec());
        Ok(())
    }

    /// Finalizes the in-progress block, if non-empty, recording its meta
    /// block. Idempotent on an already-empty tail.
    pub fn finish_block(&mut self) {
        if self.current_block.is_empty() {
            return;
        }
        let target_size = self.block_size;
        let finished = std::mem::replace(&mut self.current_block, DataBlockBuilder::new(target_size));

        let first_key = finished.first_key().map(|k| k.to_vec()).unwrap_or_default();
        let last_key = finished.last_key().map(|k| k.to_vec()).unwrap_or_default();
        let block = finished.finish();
        let encoded = block.encode();

        let meta = MetaBlock {
            first_key,
            last_key,
            offset: self.data_bytes_written as i32,
        };
        self.data_bytes_written += encoded.len();
        self.finished_blocks.push((encoded, meta));
    }

    /// Finalizes the builder and writes the complete SSTable file to
    /// `path`, returning an open handle to it.
    ///
    /// Fails with [`SSTableError::PathExists`] if `path` already exists.
    pub fn build<P: AsRef<Path>>(mut self, path: P) -> Result<SSTable, SSTableError> {
        let path = path.as_ref();
        if path.exists() {
            return Err(SSTableError::PathExists(path.to_path_buf()));
        }
        if self.is_empty() {
            return Err(SSTableError::Malformed(
                "cannot build an sstable with zero records".into(),
            ));
        }

        self.finish_block();

        let mut out = Vec::with_capacity(self.data_bytes_written + 4096);
        let mut meta_section = Vec::new();

        for (block_bytes, _) in &self.finished_blocks {
            out.extend_from_slice(block_bytes);
        }
        for (_, meta) in &self.finished_blocks {
            meta.encode_to(&mut meta_section)?;
        }

        let meta_offset = out.len() as i32;
        out.extend_from_slice(&meta_section);

        let bloom_offset = out.len() as i32;
        let bloom = BloomFilter::from_keys(self.keys_seen.iter(), DEFAULT_BLOOM_FP_RATE)?;
        out.extend_from_slice(&bloom.encode()?);

        out.extend_from_slice(&meta_offset.to_le_bytes());
        out.extend_from_slice(&bloom_offset.to_le_bytes());

        let tmp_path = tmp_path_for(path);
        fs::write(&tmp_path, &out)?;
        fs::rename(&tmp_path, path)?;

        info!(
            path = %path.display(),
            blocks = self.finished_blocks.len(),
            keys = self.keys_seen.len(),
            bytes = out.len(),
            "built sstable"
        );

        SSTable::open(path)
    }
}

fn tmp_path_for(path: &Path) -> PathBuf {
    let mut tmp = path.as_os_str().to_os_string();
    tmp.push(".tmp");
    PathBuf::from(tmp)
}
