//! SSTable iterator (C9) — composes per-block record streams into a single
//! ordered iterator over one SSTable, optionally bounded by `[lower, upper]`.

use std::sync::Arc;

use crate::block::DataBlock;
use crate::record::Record;

use super::{SSTable, SSTableError};

/// Iterates an [`SSTable`]'s records in key order, optionally bounded by
/// `[lower, upper]`. Blocks whose range lies entirely outside the bound are
/// skipped without being decoded.
pub struct SSTableIterator {
    table: Arc<SSTable>,
    lower: Option<Vec<u8>>,
    upper: Option<Vec<u8>>,
    next_block: usize,
    current: Option<(DataBlock, usize)>,
}

impl SSTableIterator {
    /// Builds an iterator over the full table.
    pub fn new(table: Arc<SSTable>) -> Result<Self, SSTableError> {
        Self::bounded(table, None, None)
    }

    /// Builds an iterator bounded by `[lower, upper]`, both inclusive.
    pub fn bounded(
        table: Arc<SSTable>,
        lower: Option<Vec<u8>>,
        upper: Option<Vec<u8>>,
    ) -> Result<Self, SSTableError> {
        if let (Some(lo), Some(hi)) = (&lower, &upper) {
            if lo > hi {
                return Err(SSTableError::RangeInvalid);
            }
        }

        let next_block = match &lower {
            Some(lo) => first_overlapping_block(&table, lo, upper.as_deref()),
            None => 0,
        };

        Ok(Self {
            table,
            lower,
            upper,
            next_block,
            current: None,
        })
    }

    /// Loads the next block (skipping ones entirely below `lower`), starting
    /// at `idx`. Returns `true` if a block was loaded, `false` if the table
    /// (or the bounded range) is exhausted.
    fn load_block(&mut self, idx: usize) -> Result<bool, SSTableError> {
        let mut idx = idx;
        loop {
            if idx >= self.table.block_count() {
                self.next_block = idx;
                return Ok(false);
            }
            let mb = self.table.meta_block(idx);
            if let Some(upper) = &self.upper {
                if mb.first_key.as_slice() > upper.as_slice() {
                    self.next_block = self.table.block_count();
                    return Ok(false);
                }
            }
            if let Some(lower) = &self.lower {
                if mb.last_key.as_slice() < lower.as_slice() {
                    idx += 1;
                    continue;
                }
            }
            let block = self.table.read_data_block(idx)?;
            self.current = Some((block, 0));
            self.next_block = idx + 1;
            return Ok(true);
        }
    }

    fn next_in_current(&mut self) -> Option<Record> {
        let (block, pos) = self.current.as_mut()?;
        while *pos < block.len() {
            let record = block.record_at_index(*pos).ok()?;
            *pos += 1;

            if let Some(upper) = &self.upper {
                if record.key.as_slice() > upper.as_slice() {
                    *pos = block.len();
                    return None;
                }
            }
            if let Some(lower) = &self.lower {
                if record.key.as_slice() < lower.as_slice() {
                    continue;
                }
            }
            return Some(record);
        }
        None
    }
}

fn first_overlapping_block(table: &SSTable, lower: &[u8], upper: Option<&[u8]>) -> usize {
    if let Some(id) = table.find_block_id(lower) {
        return id;
    }
    for idx in 0..table.block_count() {
        let mb = table.meta_block(idx);
        if mb.last_key.as_slice() >= lower {
            if let Some(upper) = upper {
                if mb.first_key.as_slice() > upper {
                    return table.block_count();
                }
            }
            return idx;
        }
    }
    table.block_count()
}

impl Iterator for SSTableIterator {
    type Item = Record;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.current.is_some() {
                if let Some(record) = self.next_in_current() {
                    return Some(record);
                }
                self.current = None;
            }

            match self.load_block(self.next_block) {
                Ok(true) => continue,
                Ok(false) | Err(_) => return None,
            }
        }
    }
}
