//! Bloom filter (C2) — a probabilistic set over keys used to short-circuit
//! negative SSTable lookups.
//!
//! Wire format: `bits[nb_bytes] ‖ k(u8)`. Hashing and bit layout are
//! delegated to the `bloomfilter` crate; `bits` is whatever
//! `Bloom::as_slice()` returns and round-trips through `Bloom::from_slice()`,
//! and `k` is tracked alongside it purely so [`BloomFilter::nb_hash_functions`]
//! has something to report.


use bloomfilter::Bloom;
use thiserror::Error;

use crate::encoding::{Decode, Encode, EncodingError};

/// Errors raised while building or decoding a [`BloomFilter`].
#[derive(Debug, Error)]
pub enum BloomError {
    /// The encoded buffer was truncated or otherwise malformed.
    #[error("malformed bloom filter: {0}")]
    Malformed(#[from] EncodingError),

    /// The `bloomfilter` crate rejected the requested parameters, or the
    /// stored bit buffer could not be reconstructed into a filter.
    #[error("bloom filter construction failed: {0}")]
    Construct(String),
}

/// A Bloom filter over a fixed-size bit array, backed by `bloomfilter::Bloom`.
pub struct BloomFilter {
    inner: Bloom<Vec<u8>>,
    k: u8,
}

impl std::fmt::Debug for BloomFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BloomFilter")
            .field("nb_bytes", &self.nb_bytes())
            .field("k", &self.k)
            .finish()
    }
}

impl BloomFilter {
    /// Builds a filter sized for `keys` targeting the given false-positive
    /// rate, then inserts every key.
    ///
    /// Uses the standard formula `k = -log2(p)` for the number of hash
    /// functions at the optimal bits-per-key ratio, tracked locally since
    /// it is reported via [`BloomFilter::nb_hash_functions`] but is not
    /// itself part of `bloomfilter::Bloom`'s raw bit buffer.
    pub fn from_keys<I, K>(keys: I, fp_rate: f64) -> Result<Self, BloomError>
    where
        I: IntoIterator<Item = K>,
        K: AsRef<[u8]>,
    {
        let keys: Vec<Vec<u8>> = keys.into_iter().map(|k| k.as_ref().to_vec()).collect();
        let fp_rate = fp_rate.clamp(1e-6, 0.5);

        let mut inner = Bloom::new_for_fp_rate(keys.len().max(1), fp_rate)
            .map_err(|e| BloomError::Construct(e.to_string()))?;
        for key in &keys {
            inner.set(key);
        }

        let k = (-fp_rate.log2()).round().clamp(1.0, 30.0) as u8;
        Ok(Self { inner, k })
    }

    /// Inserts a key into the filter.
    pub fn add(&mut self, key: &[u8]) {
        self.inner.set(&key.to_vec());
    }

    /// Returns `true` if `key` may be present; `false` means it is
    /// definitely absent.
    pub fn may_contain(&self, key: &[u8]) -> bool {
        self.inner.check(&key.to_vec())
    }

    /// Number of hash functions used by this filter.
    pub fn nb_hash_functions(&self) -> u8 {
        self.k
    }

    /// Number of bytes of bit storage.
    pub fn nb_bytes(&self) -> usize {
        self.inner.as_slice().len()
    }

    /// Encodes this filter as `bits[nb_bytes] ‖ k(u8)`.
    pub fn encode(&self) -> Result<Vec<u8>, BloomError> {
        let mut buf = Vec::with_capacity(self.nb_bytes() + 1);
        self.encode_to(&mut buf)?;
        Ok(buf)
    }

    /// Decodes a filter from a byte slice spanning exactly the Bloom
    /// section of an SSTable file (`bits ‖ k`, no length prefix — the
    /// caller is expected to know the section's bounds from the SSTable
    /// footer).
    pub fn decode(buf: &[u8]) -> Result<Self, BloomError> {
        if buf.is_empty() {
            return Err(BloomError::Malformed(EncodingError::UnexpectedEof {
                needed: 1,
                available: 0,
            }));
        }
        let (bits, k) = buf.split_at(buf.len() - 1);
        let inner = Bloom::from_slice(bits).map_err(|e| BloomError::Construct(e.to_string()))?;
        Ok(Self { inner, k: k[0] })
    }
}

impl PartialEq for BloomFilter {
    fn eq(&self, other: &Self) -> bool {
        self.k == other.k && self.inner.as_slice() == other.inner.as_slice()
    }
}

impl Eq for BloomFilter {}

impl Encode for BloomFilter {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        buf.extend_from_slice(self.inner.as_slice());
        buf.push(self.k);
        Ok(())
    }
}
