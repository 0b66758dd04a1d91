//! SSTable file (C5) — an immutable, durable file packaging data blocks,
//! meta blocks, a Bloom filter, and a footer.
//!
//! On-disk layout: `[DB_1 … DB_n] ‖ [MB_1 … MB_n] ‖ BloomFilter ‖
//! meta_offset(i32 LE) ‖ bloom_offset(i32 LE)`. Reads are served via a
//! memory-mapped view of the file so that point lookups and scans never
//! buffer more than the blocks they actually touch.

pub mod builder;
pub mod iterator;

#[cfg(test)]
mod tests;

use std::fs::File;
use std::path::{Path, PathBuf};

use memmap2::Mmap;
use thiserror::Error;
use tracing::{debug, trace};

use crate::block::{BlockError, DataBlock};
use crate::bloom::{BloomError, BloomFilter};

pub use builder::SSTableBuilder;
pub use iterator::SSTableIterator;

/// Errors raised while building, opening, or reading an [`SSTable`].
#[derive(Debug, Error)]
pub enum SSTableError {
    /// `build()` was asked to write to a path that already exists.
    #[error("path already exists: {0}")]
    PathExists(PathBuf),

    /// `open()` was asked to read a path that does not exist.
    #[error("path does not exist: {0}")]
    PathMissing(PathBuf),

    /// The file's footer, meta blocks, or bloom section failed to decode.
    #[error("malformed sstable: {0}")]
    Malformed(String),

    /// `scan()` was called with `upper < lower`.
    #[error("invalid scan range: lower > upper")]
    RangeInvalid,

    /// Underlying I/O failure.
    #[error("sstable I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A data block failed to decode.
    #[error(transparent)]
    Block(#[from] BlockError),

    /// The Bloom filter section failed to decode.
    #[error(transparent)]
    Bloom(#[from] BloomError),
}

/// A meta block: a per-data-block descriptor (C4).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetaBlock {
    /// First (smallest) key in the owning data block.
    pub first_key: Vec<u8>,
    /// Last (largest) key in the owning data block.
    pub last_key: Vec<u8>,
    /// Byte offset of the owning data block within the SSTable file.
    pub offset: i32,
}

impl MetaBlock {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), SSTableError> {
        let first_key_len = u16::try_from(self.first_key.len())
            .map_err(|_| SSTableError::Malformed("first_key too long for meta block".into()))?;
        let last_key_len = u16::try_from(self.last_key.len())
            .map_err(|_| SSTableError::Malformed("last_key too long for meta block".into()))?;

        buf.extend_from_slice(&first_key_len.to_le_bytes());
        buf.extend_from_slice(&self.first_key);
        buf.extend_from_slice(&last_key_len.to_le_bytes());
        buf.extend_from_slice(&self.last_key);
        buf.extend_from_slice(&self.offset.to_le_bytes());
        Ok(())
    }

    /// Decodes a single meta block from the start of `buf`, returning it and
    /// the number of bytes consumed.
    fn decode(buf: &[u8]) -> Result<(Self, usize), SSTableError> {
        if buf.len() < 2 {
            return Err(SSTableError::Malformed("truncated meta block".into()));
        }
        let first_key_len = u16::from_le_bytes([buf[0], buf[1]]) as usize;
        let mut pos = 2;
        if buf.len() < pos + first_key_len {
            return Err(SSTableError::Malformed("truncated meta block first_key".into()));
        }
        let first_key = buf[pos..pos + first_key_len].to_vec();
        pos += first_key_len;

        if buf.len() < pos + 2 {
            return Err(SSTableError::Malformed("truncated meta block".into()));
        }
        let last_key_len = u16::from_le_bytes([buf[pos], buf[pos + 1]]) as usize;
        pos += 2;
        if buf.len() < pos + last_key_len {
            return Err(SSTableError::Malformed("truncated meta block last_key".into()));
        }
        let last_key = buf[pos..pos + last_key_len].to_vec();
        pos += last_key_len;

        if buf.len() < pos + 4 {
            return Err(SSTableError::Malformed("truncated meta block offset".into()));
        }
        let offset = i32::from_le_bytes([buf[pos], buf[pos + 1], buf[pos + 2], buf[pos + 3]]);
        pos += 4;

        Ok((
            MetaBlock {
                first_key,
                last_key,
                offset,
            },
            pos,
        ))
    }
}

/// An immutable, on-disk sorted string table.
///
/// The handle owns the file's memory map and the decoded meta-block index
/// and Bloom filter; data blocks are decoded lazily, on demand, from the
/// map.
pub struct SSTable {
    path: PathBuf,
    mmap: Mmap,
    meta_blocks: Vec<MetaBlock>,
    meta_block_offset: i32,
    bloom_filter: BloomFilter,
    first_key: Vec<u8>,
    last_key: Vec<u8>,
}

impl PartialEq for SSTable {
    fn eq(&self, other: &Self) -> bool {
        self.path == other.path
            && self.meta_blocks == other.meta_blocks
            && self.meta_block_offset == other.meta_block_offset
            && self.bloom_filter == other.bloom_filter
            && self.first_key == other.first_key
            && self.last_key == other.last_key
    }
}

impl SSTable {
    /// Opens an existing SSTable file, decoding its footer, meta blocks, and
    /// Bloom filter. Data blocks are not loaded eagerly.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, SSTableError> {
        let path = path.as_ref().to_path_buf();
        if !path.exists() {
            return Err(SSTableError::PathMissing(path));
        }

        let file = File::open(&path)?;
        // SAFETY: the file is exclusively owned by this handle for reads and
        // is never mutated while mapped (SSTables are immutable once built).
        let mmap = unsafe { Mmap::map(&file)? };

        if mmap.len() < 8 {
            return Err(SSTableError::Malformed("file shorter than footer".into()));
        }

        let footer_start = mmap.len() - 8;
        let meta_offset = i32::from_le_bytes(mmap[footer_start..footer_start + 4].try_into()?);
        let bloom_offset =
            i32::from_le_bytes(mmap[footer_start + 4..footer_start + 8].try_into()?);

        if meta_offset < 0 || bloom_offset < 0 || bloom_offset as usize > footer_start {
            return Err(SSTableError::Malformed("corrupt footer offsets".into()));
        }

        let meta_offset_usize = meta_offset as usize;
        let bloom_offset_usize = bloom_offset as usize;

        if meta_offset_usize > bloom_offset_usize {
            return Err(SSTableError::Malformed(
                "meta_offset past bloom_offset".into(),
            ));
        }

        let mut meta_blocks = Vec::new();
        let mut cursor = meta_offset_usize;
        while cursor < bloom_offset_usize {
            let (mb, consumed) = MetaBlock::decode(&mmap[cursor..bloom_offset_usize])?;
            cursor += consumed;
            meta_blocks.push(mb);
        }

        for pair in meta_blocks.windows(2) {
            if pair[0].last_key >= pair[1].first_key {
                return Err(SSTableError::Malformed(
                    "meta blocks are not strictly ordered".into(),
                ));
            }
        }

        let bloom_filter = BloomFilter::decode(&mmap[bloom_offset_usize..footer_start])?;

        let first_key = meta_blocks
            .first()
            .map(|mb| mb.first_key.clone())
            .unwrap_or_default();
        let last_key = meta_blocks
            .last()
            .map(|mb| mb.last_key.clone())
            .unwrap_or_default();

        debug!(path = %path.display(), blocks = meta_blocks.len(), "opened sstable");

        Ok(Self {
            path,
            mmap,
            meta_blocks,
            meta_block_offset: meta_offset,
            bloom_filter,
            first_key,
            last_key,
        })
    }

    /// The file path backing this handle.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The smallest key present in this table.
    pub fn first_key(&self) -> &[u8] {
        &self.first_key
    }

    /// The largest key present in this table.
    pub fn last_key(&self) -> &[u8] {
        &self.last_key
    }

    /// Whether `key` falls within `[first_key, last_key]`.
    pub fn key_in_range(&self, key: &[u8]) -> bool {
        !self.meta_blocks.is_empty()
            && key >= self.first_key.as_slice()
            && key <= self.last_key.as_slice()
    }

    /// Whether this table's range overlaps `[lower, upper]`.
    pub fn range_overlaps(&self, lower: &[u8], upper: &[u8]) -> bool {
        !self.meta_blocks.is_empty()
            && self.first_key.as_slice() <= upper
            && lower <= self.last_key.as_slice()
    }

    /// Finds the index of the meta block whose range contains `key`, if any.
    pub fn find_block_id(&self, key: &[u8]) -> Option<usize> {
        if self.meta_blocks.is_empty() {
            return None;
        }
        let mut lo = 0usize;
        let mut hi = self.meta_blocks.len();
        while lo < hi {
            let mid = (lo + hi) / 2;
            if self.meta_blocks[mid].last_key.as_slice() < key {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        if lo < self.meta_blocks.len()
            && self.meta_blocks[lo].first_key.as_slice() <= key
            && key <= self.meta_blocks[lo].last_key.as_slice()
        {
            Some(lo)
        } else {
            None
        }
    }

    fn block_byte_range(&self, idx: usize) -> (usize, usize) {
        let start = self.meta_blocks[idx].offset as usize;
        let end = if idx + 1 < self.meta_blocks.len() {
            self.meta_blocks[idx + 1].offset as usize
        } else {
            self.meta_block_offset as usize
        };
        (start, end)
    }

    fn read_data_block(&self, idx: usize) -> Result<DataBlock, SSTableError> {
        let (start, end) = self.block_byte_range(idx);
        if end > self.mmap.len() || start > end {
            return Err(SSTableError::Malformed("block range out of bounds".into()));
        }
        Ok(DataBlock::decode(&self.mmap[start..end])?)
    }

    /// Looks up `key`, consulting the Bloom filter before touching the
    /// block index.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, SSTableError> {
        if !self.bloom_filter.may_contain(key) {
            trace!(path = %self.path.display(), "bloom filter rejected key");
            return Ok(None);
        }
        let Some(block_id) = self.find_block_id(key) else {
            return Ok(None);
        };
        let block = self.read_data_block(block_id)?;
        Ok(block.get(key)?)
    }

    /// Number of data blocks in this table.
    pub fn block_count(&self) -> usize {
        self.meta_blocks.len()
    }

    /// Returns the meta block at `idx`.
    pub fn meta_block(&self, idx: usize) -> &MetaBlock {
        &self.meta_blocks[idx]
    }

    /// Returns an iterator over every record in the table, in key order.
    pub fn iter(self: &std::sync::Arc<Self>) -> Result<SSTableIterator, SSTableError> {
        SSTableIterator::new(std::sync::Arc::clone(self))
    }

    /// Returns an iterator over the records whose key lies in
    /// `[lower, upper]`.
    pub fn scan(
        self: &std::sync::Arc<Self>,
        lower: &[u8],
        upper: &[u8],
    ) -> Result<SSTableIterator, SSTableError> {
        SSTableIterator::bounded(
            std::sync::Arc::clone(self),
            Some(lower.to_vec()),
            Some(upper.to_vec()),
        )
    }
}

impl From<std::array::TryFromSliceError> for SSTableError {
    fn from(_: std::array::TryFromSliceError) -> Self {
        SSTableError::Malformed("footer slice conversion failed".into())
    }
}
