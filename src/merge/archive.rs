//! ZIP packaging of generated documents.
//!
//! The writer targets either an in-memory buffer or a file inside a per-run
//! temporary directory. Both produce identical bytes; the staged variant just
//! keeps large runs out of memory.

use std::fmt;
use std::fs::{self, File};
use std::io::{Cursor, Seek, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use log::debug;
use serde::{Deserialize, Serialize};
use tempfile::TempDir;
use thiserror::Error;
use zip::result::ZipError;
use zip::ZipWriter;

use super::renderer::entry_options;

const STAGED_ARCHIVE_FILE: &str = "documents.zip";

/// Errors raised by the archive target.
#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("archive storage I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("archive encoding failed: {0}")]
    Zip(#[from] ZipError),
    #[error("archive content would exceed the {limit} byte limit")]
    LimitExceeded { limit: u64 },
}

/// Where the archive is assembled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArchiveStaging {
    #[default]
    Memory,
    Disk,
}

impl FromStr for ArchiveStaging {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "memory" | "mem" => Ok(Self::Memory),
            "disk" | "file" => Ok(Self::Disk),
            other => Err(format!("expected 'memory' or 'disk', got '{other}'")),
        }
    }
}

impl fmt::Display for ArchiveStaging {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Memory => write!(f, "memory"),
            Self::Disk => write!(f, "disk"),
        }
    }
}

enum Target {
    Memory(ZipWriter<Cursor<Vec<u8>>>),
    Disk {
        dir: TempDir,
        path: PathBuf,
        writer: ZipWriter<File>,
    },
}

/// Streams payloads into a ZIP archive.
pub struct ArchiveWriter {
    target: Target,
    entries: Vec<String>,
    /// Cap on the summed size of the entry payloads.
    limit: Option<u64>,
    written: u64,
}

impl ArchiveWriter {
    pub fn open(staging: ArchiveStaging) -> Result<Self, ArchiveError> {
        let target = match staging {
            ArchiveStaging::Memory => Target::Memory(ZipWriter::new(Cursor::new(Vec::new()))),
            ArchiveStaging::Disk => {
                let dir = tempfile::Builder::new().prefix("docmerge-run-").tempdir()?;
                let path = dir.path().join(STAGED_ARCHIVE_FILE);
                let file = File::create(&path)?;
                debug!("staging archive at {}", path.display());
                Target::Disk {
                    dir,
                    path,
                    writer: ZipWriter::new(file),
                }
            }
        };

        Ok(Self {
            target,
            entries: Vec::new(),
            limit: None,
            written: 0,
        })
    }

    /// Refuse entries once their payloads would add up to more than `limit` bytes.
    pub fn with_limit(mut self, limit: Option<u64>) -> Self {
        self.limit = limit;
        self
    }

    /// Append one entry. Entry names must be unique; callers guarantee this.
    pub fn add(&mut self, entry_name: &str, payload: &[u8]) -> Result<(), ArchiveError> {
        let size = payload.len() as u64;
        if let Some(limit) = self.limit {
            if self.written.saturating_add(size) > limit {
                return Err(ArchiveError::LimitExceeded { limit });
            }
        }

        match &mut self.target {
            Target::Memory(writer) => write_entry(writer, entry_name, payload)?,
            Target::Disk { writer, .. } => write_entry(writer, entry_name, payload)?,
        }
        self.entries.push(entry_name.to_string());
        self.written += size;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Write the central directory and hand the archive over.
    pub fn finalize(self) -> Result<ArchiveBlob, ArchiveError> {
        let storage = match self.target {
            Target::Memory(writer) => BlobStorage::Memory(writer.finish()?.into_inner()),
            Target::Disk { dir, path, writer } => {
                let mut file = writer.finish()?;
                file.flush()?;
                file.sync_all()?;
                BlobStorage::Staged { _dir: dir, path }
            }
        };

        Ok(ArchiveBlob {
            entries: self.entries,
            storage,
        })
    }
}

fn write_entry<W: Write + Seek>(
    writer: &mut ZipWriter<W>,
    entry_name: &str,
    payload: &[u8],
) -> Result<(), ArchiveError> {
    writer.start_file(entry_name, entry_options())?;
    writer.write_all(payload)?;
    Ok(())
}

enum BlobStorage {
    Memory(Vec<u8>),
    /// The directory guard removes the staged file when the blob is dropped.
    Staged { _dir: TempDir, path: PathBuf },
}

/// A finalized archive.
pub struct ArchiveBlob {
    entries: Vec<String>,
    storage: BlobStorage,
}

impl ArchiveBlob {
    pub fn entries(&self) -> &[String] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// In-memory bytes, when the archive was not staged on disk.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match &self.storage {
            BlobStorage::Memory(bytes) => Some(bytes),
            BlobStorage::Staged { .. } => None,
        }
    }

    /// Location of the staged archive file, if any.
    pub fn staged_path(&self) -> Option<&Path> {
        match &self.storage {
            BlobStorage::Memory(_) => None,
            BlobStorage::Staged { path, .. } => Some(path),
        }
    }

    /// Full archive contents regardless of where they live.
    pub fn to_bytes(&self) -> Result<Vec<u8>, ArchiveError> {
        match &self.storage {
            BlobStorage::Memory(bytes) => Ok(bytes.clone()),
            BlobStorage::Staged { path, .. } => Ok(fs::read(path)?),
        }
    }
}

impl fmt::Debug for ArchiveBlob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArchiveBlob")
            .field("entries", &self.entries.len())
            .field("staged_path", &self.staged_path())
            .finish()
    }
}
