//! # Manifest Component (C10)
//!
//! The append-only, durable record of the engine's level structure:
//! immutable configuration plus every Flush and Compaction event that has
//! ever been applied. Replaying the manifest from the start reconstructs
//! `(l0, levels)` exactly — memtables are never reflected here, since their
//! durability is carried entirely by their own WALs.
//!
//! ## On-disk layout
//!
//! ```text
//! Header ‖ Record*
//! ```
//!
//! `Header` is fixed-width: `nb_levels(i32) ‖ levels_ratio(f64) ‖
//! max_l0_sstables(i32) ‖ max_sstable_size(i32) ‖ block_size(i32)`, written
//! once at creation and never rewritten. Each `Record` is tagged by a
//! single byte: `0 = Flush`, `1 = Compaction`. Unlike the WAL, manifest
//! records carry no length prefix or checksum of their own — each variant
//! is self-describing (see [`ManifestRecord`]).

#[cfg(test)]
mod tests;

use std::{
    collections::VecDeque,
    fs::{File, OpenOptions},
    io::{self, Read, Seek, Write},
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use thiserror::Error;
use tracing::info;

use crate::encoding::{Decode, Encode, EncodingError};
use crate::sstable::{SSTable, SSTableError};

/// Errors returned by manifest operations.
#[derive(Debug, Error)]
pub enum ManifestError {
    /// `create()` was asked to write to a path that already exists.
    #[error("manifest path already exists: {0}")]
    PathExists(PathBuf),

    /// `open()` was asked to read a path that does not exist.
    #[error("manifest path does not exist: {0}")]
    PathMissing(PathBuf),

    /// Underlying I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Encoding / decoding error.
    #[error("encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// The manifest file's header or record stream is malformed.
    #[error("malformed manifest: {0}")]
    Malformed(String),

    /// Replay referenced an SSTable that no longer exists on disk or fails
    /// to decode cleanly.
    #[error("manifest inconsistent: {0}")]
    Inconsistent(String),

    /// Internal invariant violation or poisoned lock.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Immutable configuration stored in the manifest header.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ManifestConfig {
    /// Total number of levels, including level 0.
    pub nb_levels: i32,
    /// Size ratio threshold between adjacent levels that triggers
    /// compaction (`|level L| >= levels_ratio * |level L+1|`).
    pub levels_ratio: f64,
    /// Number of level-0 SSTables that triggers `force_compaction_l0`.
    pub max_l0_sstables: i32,
    /// Target size, in bytes, of a single SSTable.
    pub max_sstable_size: i32,
    /// Target size, in bytes, of a single data block.
    pub block_size: i32,
}

impl ManifestConfig {
    const ENCODED_SIZE: usize = 4 + 8 + 4 + 4 + 4;

    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.nb_levels.encode_to(buf)?;
        self.levels_ratio.encode_to(buf)?;
        self.max_l0_sstables.encode_to(buf)?;
        self.max_sstable_size.encode_to(buf)?;
        self.block_size.encode_to(buf)?;
        Ok(())
    }

    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut offset = 0;
        let (nb_levels, n) = i32::decode_from(&buf[offset..])?;
        offset += n;
        let (levels_ratio, n) = f64::decode_from(&buf[offset..])?;
        offset += n;
        let (max_l0_sstables, n) = i32::decode_from(&buf[offset..])?;
        offset += n;
        let (max_sstable_size, n) = i32::decode_from(&buf[offset..])?;
        offset += n;
        let (block_size, n) = i32::decode_from(&buf[offset..])?;
        offset += n;
        Ok((
            Self {
                nb_levels,
                levels_ratio,
                max_l0_sstables,
                max_sstable_size,
                block_size,
            },
            offset,
        ))
    }
}

/// A reference to an SSTable file by its path relative to the engine's data
/// directory. Wire format: `path_len(1B) ‖ path_bytes`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestSstable {
    pub path: String,
}

impl ManifestSstable {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), ManifestError> {
        let len = u8::try_from(self.path.len())
            .map_err(|_| ManifestError::Malformed("sstable path too long for manifest".into()))?;
        buf.push(len);
        buf.extend_from_slice(self.path.as_bytes());
        Ok(())
    }

    fn decode_from(buf: &[u8]) -> Result<(Self, usize), ManifestError> {
        if buf.is_empty() {
            return Err(ManifestError::Malformed("truncated sstable entry".into()));
        }
        let len = buf[0] as usize;
        if buf.len() < 1 + len {
            return Err(ManifestError::Malformed(
                "truncated sstable entry path".into(),
            ));
        }
        let path = String::from_utf8(buf[1..1 + len].to_vec())
            .map_err(|_| ManifestError::Malformed("sstable path is not valid UTF-8".into()))?;
        Ok((Self { path }, 1 + len))
    }
}

/// A single durable manifest event.
#[derive(Debug, Clone, PartialEq)]
pub enum ManifestRecord {
    /// An immutable memtable was flushed into a new level-0 SSTable.
    Flush { sstable: ManifestSstable },

    /// A compaction at `level` replaced `inputs` with `outputs`.
    Compaction {
        level: u8,
        inputs: Vec<ManifestSstable>,
        outputs: Vec<ManifestSstable>,
    },
}

const TAG_FLUSH: u8 = 0;
const TAG_COMPACTION: u8 = 1;

impl ManifestRecord {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), ManifestError> {
        match self {
            ManifestRecord::Flush { sstable } => {
                let mut entry = Vec::new();
                sstable.encode_to(&mut entry)?;
                let size = u8::try_from(entry.len())
                    .map_err(|_| ManifestError::Malformed("flush entry too large".into()))?;
                buf.push(TAG_FLUSH);
                buf.push(size);
                buf.extend_from_slice(&entry);
            }
            ManifestRecord::Compaction {
                level,
                inputs,
                outputs,
            } => {
                let mut in_bytes = Vec::new();
                for entry in inputs {
                    entry.encode_to(&mut in_bytes)?;
                }
                let mut out_bytes = Vec::new();
                for entry in outputs {
                    entry.encode_to(&mut out_bytes)?;
                }
                let in_size = u16::try_from(in_bytes.len())
                    .map_err(|_| ManifestError::Malformed("compaction inputs too large".into()))?;
                let out_size = u16::try_from(out_bytes.len()).map_err(|_| {
                    ManifestError::Malformed("compaction outputs too large".into())
                })?;

                buf.push(TAG_COMPACTION);
                buf.push(*level);
                buf.extend_from_slice(&in_size.to_le_bytes());
                buf.extend_from_slice(&out_size.to_le_bytes());
                buf.extend_from_slice(&in_bytes);
                buf.extend_from_slice(&out_bytes);
            }
        }
        Ok(())
    }

    fn decode_from(buf: &[u8]) -> Result<(Self, usize), ManifestError> {
        if buf.is_empty() {
            return Err(ManifestError::Malformed("truncated record tag".into()));
        }
        match buf[0] {
            TAG_FLUSH => {
                if buf.len() < 2 {
                    return Err(ManifestError::Malformed("truncated flush record".into()));
                }
                let size = buf[1] as usize;
                if buf.len() < 2 + size {
                    return Err(ManifestError::Malformed(
                        "truncated flush record body".into(),
                    ));
                }
                let (sstable, _) = ManifestSstable::decode_from(&buf[2..2 + size])?;
                Ok((ManifestRecord::Flush { sstable }, 2 + size))
            }
            TAG_COMPACTION => {
                if buf.len() < 6 {
                    return Err(ManifestError::Malformed(
                        "truncated compaction record".into(),
                    ));
                }
                let level = buf[1];
                let in_size = u16::from_le_bytes([buf[2], buf[3]]) as usize;
                let out_size = u16::from_le_bytes([buf[4], buf[5]]) as usize;
                let body_start = 6;
                if buf.len() < body_start + in_size + out_size {
                    return Err(ManifestError::Malformed(
                        "truncated compaction record body".into(),
                    ));
                }

                let inputs = decode_entries(&buf[body_start..body_start + in_size])?;
                let outputs = decode_entries(
                    &buf[body_start + in_size..body_start + in_size + out_size],
                )?;

                Ok((
                    ManifestRecord::Compaction {
                        level,
                        inputs,
                        outputs,
                    },
                    body_start + in_size + out_size,
                ))
            }
            other => Err(ManifestError::Malformed(format!(
                "unknown manifest record tag {other}"
            ))),
        }
    }
}

fn decode_entries(mut buf: &[u8]) -> Result<Vec<ManifestSstable>, ManifestError> {
    let mut entries = Vec::new();
    while !buf.is_empty() {
        let (entry, consumed) = ManifestSstable::decode_from(buf)?;
        entries.push(entry);
        buf = &buf[consumed..];
    }
    Ok(entries)
}

/// Persistent, append-only log of the engine's level structure.
pub struct Manifest {
    path: PathBuf,
    file: Mutex<File>,
    config: ManifestConfig,
}

impl Manifest {
    /// Creates a brand-new manifest file at `path`, writing the header.
    /// Fails with [`ManifestError::PathExists`] if `path` already exists.
    pub fn create<P: AsRef<Path>>(path: P, config: ManifestConfig) -> Result<Self, ManifestError> {
        let path = path.as_ref().to_path_buf();
        if path.exists() {
            return Err(ManifestError::PathExists(path));
        }

        let mut header_bytes = Vec::with_capacity(ManifestConfig::ENCODED_SIZE);
        config.encode_to(&mut header_bytes)?;

        let mut file = OpenOptions::new()
            .create_new(true)
            .read(true)
            .append(true)
            .open(&path)?;
        file.write_all(&header_bytes)?;
        file.sync_all()?;

        info!(path = %path.display(), "manifest created");

        Ok(Self {
            path,
            file: Mutex::new(file),
            config,
        })
    }

    /// Opens an existing manifest file at `path`, reading its header.
    /// Fails with [`ManifestError::PathMissing`] if `path` does not exist.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, ManifestError> {
        let path = path.as_ref().to_path_buf();
        if !path.exists() {
            return Err(ManifestError::PathMissing(path));
        }

        let mut file = OpenOptions::new().read(true).append(true).open(&path)?;

        let mut header_bytes = vec![0u8; ManifestConfig::ENCODED_SIZE];
        file.read_exact(&mut header_bytes)
            .map_err(|_| ManifestError::Malformed("truncated manifest header".into()))?;
        let (config, _) = ManifestConfig::decode_from(&header_bytes)?;

        info!(path = %path.display(), "manifest opened");

        Ok(Self {
            path,
            file: Mutex::new(file),
            config,
        })
    }

    /// The manifest's immutable configuration.
    pub fn config(&self) -> ManifestConfig {
        self.config
    }

    /// The manifest file's path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn append(&self, record: &ManifestRecord) -> Result<(), ManifestError> {
        let mut bytes = Vec::new();
        record.encode_to(&mut bytes)?;

        let mut guard = self
            .file
            .lock()
            .map_err(|_| ManifestError::Internal("mutex poisoned".into()))?;
        guard.write_all(&bytes)?;
        guard.sync_all()?;
        Ok(())
    }

    /// Appends a Flush event recording a newly built level-0 SSTable.
    pub fn append_flush(&self, path: String) -> Result<(), ManifestError> {
        self.append(&ManifestRecord::Flush {
            sstable: ManifestSstable { path },
        })
    }

    /// Appends a Compaction event at `level`, replacing `inputs` with
    /// `outputs`.
    pub fn append_compaction(
        &self,
        level: u8,
        inputs: Vec<String>,
        outputs: Vec<String>,
    ) -> Result<(), ManifestError> {
        self.append(&ManifestRecord::Compaction {
            level,
            inputs: inputs.into_iter().map(|path| ManifestSstable { path }).collect(),
            outputs: outputs
                .into_iter()
                .map(|path| ManifestSstable { path })
                .collect(),
        })
    }

    /// Reads every record from the manifest, in order.
    fn read_records(&self) -> Result<Vec<ManifestRecord>, ManifestError> {
        let mut guard = self
            .file
            .lock()
            .map_err(|_| ManifestError::Internal("mutex poisoned".into()))?;

        let mut bytes = Vec::new();
        guard.rewind()?;
        guard.read_to_end(&mut bytes)?;

        if bytes.len() < ManifestConfig::ENCODED_SIZE {
            return Err(ManifestError::Malformed("truncated manifest header".into()));
        }

        let mut cursor = ManifestConfig::ENCODED_SIZE;
        let mut records = Vec::new();
        while cursor < bytes.len() {
            let (record, consumed) = ManifestRecord::decode_from(&bytes[cursor..])?;
            cursor += consumed;
            records.push(record);
        }
        Ok(records)
    }

    /// Replays every record, reconstructing level 0 and levels `1..N-1` as
    /// opened [`SSTable`] handles, per §4.7's replay algorithm. SSTable
    /// paths are resolved relative to `dir`.
    ///
    /// Fails with [`ManifestError::Inconsistent`] if a referenced SSTable
    /// no longer exists on disk or fails to decode.
    pub fn reconstruct_sstables(
        &self,
        dir: &Path,
    ) -> Result<Vec<VecDeque<Arc<SSTable>>>, ManifestError> {
        let nb_levels = usize::try_from(self.config.nb_levels)
            .map_err(|_| ManifestError::Malformed("nb_levels must be non-negative".into()))?;
        let mut levels: Vec<VecDeque<Arc<SSTable>>> = (0..nb_levels).map(|_| VecDeque::new()).collect();

        for record in self.read_records()? {
            match record {
                ManifestRecord::Flush { sstable } => {
                    let table = open_referenced(dir, &sstable.path)?;
                    levels[0].push_front(table);
                }
                ManifestRecord::Compaction {
                    level,
                    inputs,
                    outputs,
                } => {
                    let level = level as usize;
                    if level >= levels.len() {
                        return Err(ManifestError::Inconsistent(format!(
                            "compaction references out-of-range level {level}"
                        )));
                    }

                    let input_paths: Vec<PathBuf> =
                        inputs.iter().map(|e| dir.join(&e.path)).collect();
                    levels[level].retain(|t| !input_paths.iter().any(|p| p == t.path()));

                    let dest = (level + 1).min(levels.len() - 1);
                    for entry in outputs.into_iter().rev() {
                        let table = open_referenced(dir, &entry.path)?;
                        levels[dest].push_front(table);
                    }
                }
            }
        }

        Ok(levels)
    }
}

fn open_referenced(dir: &Path, rel_path: &str) -> Result<Arc<SSTable>, ManifestError> {
    let full_path = dir.join(rel_path);
    match SSTable::open(&full_path) {
        Ok(table) => Ok(Arc::new(table)),
        Err(SSTableError::PathMissing(_)) => Err(ManifestError::Inconsistent(format!(
            "sstable referenced by manifest is missing: {}",
            full_path.display()
        ))),
        Err(e) => Err(ManifestError::Inconsistent(format!(
            "sstable referenced by manifest failed to decode: {} ({e})",
            full_path.display()
        ))),
    }
}
