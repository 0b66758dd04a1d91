//! Data block (C3) — a fixed-budget, ordered batch of records with an
//! in-block offset index.
//!
//! Wire format: `record_1 ‖ record_2 ‖ … ‖ record_n ‖ offset_1(u16 LE) ‖ … ‖
//! offset_n(u16 LE) ‖ n(u16 LE)`. Offsets are byte offsets into the leading
//! record run, strictly increasing; record keys at those offsets are
//! non-decreasing.


use thiserror::Error;

use crate::record::{Record, RecordError};

/// Errors raised while building or reading a [`DataBlock`].
#[derive(Debug, Error)]
pub enum BlockError {
    /// A single record alone exceeds the block's target size; rolling over
    /// to a fresh block cannot help.
    #[error("record of {record_len} bytes exceeds block target size {target_size}")]
    Overflow {
        /// Size of the offending record once encoded.
        record_len: usize,
        /// The block's configured target size.
        target_size: usize,
    },

    /// The block bytes were truncated or otherwise malformed.
    #[error("malformed data block: {0}")]
    Malformed(String),

    /// A record inside the block failed to decode.
    #[error(transparent)]
    Record(#[from] RecordError),
}

/// Accumulates records into a single [`DataBlock`], rejecting records once
/// the block's target size would be exceeded.
pub struct DataBlockBuilder {
    target_size: usize,
    records: Vec<u8>,
    offsets: Vec<u16>,
    first_key: Option<Vec<u8>>,
    last_key: Option<Vec<u8>>,
}

impl DataBlockBuilder {
    /// Creates a new builder with the given target block size in bytes.
    pub fn new(target_size: usize) -> Self {
        Self {
            target_size,
            records: Vec::new(),
            offsets: Vec::new(),
            first_key: None,
            last_key: None,
        }
    }

    /// Returns `true` if no record has been added yet.
    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    /// The first key added to this block, if any.
    pub fn first_key(&self) -> Option<&[u8]> {
        self.first_key.as_deref()
    }

    /// The last key added to this block, if any.
    pub fn last_key(&self) -> Option<&[u8]> {
        self.last_key.as_deref()
    }

    /// Attempts to add a record.
    ///
    /// Returns `Ok(true)` if the record was added, `Ok(false)` if it would
    /// push the block past its target size and the caller should finish
    /// this block and retry on a fresh one. Returns
    /// [`BlockError::Overflow`] if the record alone exceeds the target size
    /// (no rollover can help, since even an empty block would overflow).
    pub fn add(&mut self, key: &[u8], value: &[u8]) -> Result<bool, BlockError> {
        let record = Record::new(key.to_vec(), value.to_vec());
        let record_bytes = record.encode()?;

        let projected_footer = (self.offsets.len() + 1) * 2 + 2;
        let projected_size = self.records.len() + record_bytes.len() + projected_footer;

        if projected_size > self.target_size {
            if self.offsets.is_empty() {
                return Err(BlockError::Overflow {
                    record_len: record_bytes.len(),
                    target_size: self.target_size,
                });
            }
            return Ok(false);
        }

        let offset = u16::try_from(self.records.len()).map_err(|_| {
            BlockError::Malformed("data block exceeded 64KiB offset addressing".into())
        })?;

        self.offsets.push(offset);
        self.records.extend_from_slice(&record_bytes);

        if self.first_key.is_none() {
            self.first_key = Some(key.to_vec());
        }
        self.last_key = Some(key.to_vec());

        Ok(true)
    }

    /// Finalizes the builder into an immutable [`DataBlock`].
    pub fn finish(self) -> DataBlock {
        DataBlock {
            records: self.records,
            offsets: self.offsets,
        }
    }
}

/// An immutable, already-built data block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataBlock {
    records: Vec<u8>,
    offsets: Vec<u16>,
}

impl DataBlock {
    /// Encodes the full on-disk representation of this block: the record
    /// run followed by the offset footer.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.records.len() + self.offsets.len() * 2 + 2);
        buf.extend_from_slice(&self.records);
        for offset in &self.offsets {
            buf.extend_from_slice(&offset.to_le_bytes());
        }
        buf.extend_from_slice(&(self.offsets.len() as u16).to_le_bytes());
        buf
    }

    /// Decodes a data block from bytes spanning exactly one block (i.e. the
    /// caller has already sliced `[MB_i.offset, MB_{i+1}.offset)` out of the
    /// SSTable file).
    pub fn decode(buf: &[u8]) -> Result<Self, BlockError> {
        if buf.len() < 2 {
            return Err(BlockError::Malformed("block shorter than footer".into()));
        }
        let n = u16::from_le_bytes([buf[buf.len() - 2], buf[buf.len() - 1]]) as usize;

        let footer_len = n * 2 + 2;
        if buf.len() < footer_len {
            return Err(BlockError::Malformed("block footer truncated".into()));
        }

        let offsets_start = buf.len() - footer_len;
        let mut offsets = Vec::with_capacity(n);
        for i in 0..n {
            let at = offsets_start + i * 2;
            offsets.push(u16::from_le_bytes([buf[at], buf[at + 1]]));
        }

        let records = buf[..offsets_start].to_vec();

        Ok(Self { records, offsets })
    }

    /// Number of records in this block.
    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    /// Returns `true` if the block holds no records.
    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    fn record_at(&self, offset: u16) -> Result<Record, BlockError> {
        let (record, _) = Record::decode(&self.records[offset as usize..])?;
        Ok(record)
    }

    /// Decodes the `idx`-th record (in key order) of this block. Used by
    /// callers that track their own cursor across an owned `DataBlock`
    /// rather than borrowing a [`DataBlockIter`].
    pub(crate) fn record_at_index(&self, idx: usize) -> Result<Record, BlockError> {
        self.record_at(self.offsets[idx])
    }

    /// Looks up `key` via linear scan, returning its value if present.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, BlockError> {
        for offset in &self.offsets {
            let record = self.record_at(*offset)?;
            if record.key == key {
                return Ok(Some(record.value));
            }
        }
        Ok(None)
    }

    /// Iterates every record in the block, in insertion (key) order.
    pub fn iter(&self) -> DataBlockIter<'_> {
        DataBlockIter {
            block: self,
            lower: None,
            upper: None,
            pos: 0,
        }
    }

    /// Iterates records whose key lies in `[lower, upper]`, positioning via
    /// binary search over the offset index.
    pub fn range(&self, lower: &[u8], upper: &[u8]) -> Result<DataBlockIter<'_>, BlockError> {
        let mut lo = 0usize;
        let mut hi = self.offsets.len();
        while lo < hi {
            let mid = (lo + hi) / 2;
            let record = self.record_at(self.offsets[mid])?;
            if record.key.as_slice() < lower {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }

        Ok(DataBlockIter {
            block: self,
            lower: Some(lower.to_vec()),
            upper: Some(upper.to_vec()),
            pos: lo,
        })
    }

    /// The key of the first record in the block, if any.
    pub fn first_key(&self) -> Option<Vec<u8>> {
        self.offsets
            .first()
            .and_then(|o| self.record_at(*o).ok())
            .map(|r| r.key)
    }

    /// The key of the last record in the block, if any.
    pub fn last_key(&self) -> Option<Vec<u8>> {
        self.offsets
            .last()
            .and_then(|o| self.record_at(*o).ok())
            .map(|r| r.key)
    }
}

/// Iterator over the records of a [`DataBlock`], optionally bounded by
/// `[lower, upper]`.
pub struct DataBlockIter<'a> {
    block: &'a DataBlock,
    lower: Option<Vec<u8>>,
    upper: Option<Vec<u8>>,
    pos: usize,
}

impl Iterator for DataBlockIter<'_> {
    type Item = Record;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.block.offsets.len() {
            return None;
        }
        let record = self.block.record_at(self.block.offsets[self.pos]).ok()?;

        if let Some(upper) = &self.upper {
            if record.key.as_slice() > upper.as_slice() {
                self.pos = self.block.offsets.len();
                return None;
            }
        }
        if let Some(lower) = &self.lower {
            if record.key.as_slice() < lower.as_slice() {
                // shouldn't happen given range() positions correctly, but
                // guard against misuse of next() before range-seeking.
                self.pos += 1;
                return self.next();
            }
        }

        self.pos += 1;
        Some(record)
    }
}
