//! Record codec — the self-delimited `(key, value)` wire format shared by
//! every durable structure in this crate (memtables, WALs, data blocks,
//! SSTables).
//!
//! Wire format: `key_len(u32 LE) ‖ key ‖ value_len(u32 LE) ‖ value`. This is
//! exactly the `[u32 len][bytes]` encoding [`crate::encoding`] already gives
//! `Vec<u8>`, so a record is simply two length-prefixed byte strings back to
//! back.


use thiserror::Error;

use crate::encoding::{Decode, Encode, EncodingError};

/// Errors raised while encoding or decoding a [`Record`].
#[derive(Debug, Error)]
pub enum RecordError {
    /// The buffer did not contain a complete, well-formed record.
    #[error("malformed record: {0}")]
    Malformed(#[from] EncodingError),
}

/// A single ordered key/value pair.
///
/// Equality is by `(key, value)`; ordering (via [`Ord`]) is by `key` alone,
/// matching the spec's definition of "duplicate" as equal keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// The record's key.
    pub key: Vec<u8>,
    /// The record's value.
    pub value: Vec<u8>,
}

impl Record {
    /// Builds a new record from owned key/value bytes.
    pub fn new(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    /// Encodes this record as `key_len ‖ key ‖ value_len ‖ value`.
    pub fn encode(&self) -> Result<Vec<u8>, RecordError> {
        let mut buf = Vec::with_capacity(8 + self.key.len() + self.value.len());
        self.key.encode_to(&mut buf)?;
        self.value.encode_to(&mut buf)?;
        Ok(buf)
    }

    /// Decodes a record from the start of `buf`, returning the record and the
    /// number of bytes consumed.
    ///
    /// Fails with [`RecordError::Malformed`] if the declared key/value
    /// lengths exceed the buffer.
    pub fn decode(buf: &[u8]) -> Result<(Self, usize), RecordError> {
        let (key, key_consumed) = Vec::<u8>::decode_from(buf)?;
        let (value, value_consumed) = Vec::<u8>::decode_from(&buf[key_consumed..])?;
        Ok((Record { key, value }, key_consumed + value_consumed))
    }

    /// The encoded size in bytes, without actually encoding.
    pub fn encoded_len(&self) -> usize {
        4 + self.key.len() + 4 + self.value.len()
    }
}

impl Encode for Record {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.key.encode_to(buf)?;
        self.value.encode_to(buf)?;
        Ok(())
    }
}

impl Decode for Record {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (key, key_consumed) = Vec::<u8>::decode_from(buf)?;
        let (value, value_consumed) = Vec::<u8>::decode_from(&buf[key_consumed..])?;
        Ok((Record { key, value }, key_consumed + value_consumed))
    }
}

impl PartialOrd for Record {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Record {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.key.cmp(&other.key)
    }
}
