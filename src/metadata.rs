//! Persisted restart history, one JSON document per service identity.
//!
//! Each invocation opens `<dir>/<key>.meta`, takes a non-blocking exclusive
//! `flock` on it and keeps the handle (and so the lock) until the process
//! exits or execs. Writes truncate in place; a torn write is picked up as
//! corruption by the next reader and treated as an empty history.

use chrono::{DateTime, Utc};
use fs2::FileExt;
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

static UNSAFE_KEY_CHARS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^a-zA-Z0-9\-]").unwrap());

/// Replace every character outside `[a-zA-Z0-9-]` with `_`.
pub fn sanitize_key(key: &str) -> String {
    UNSAFE_KEY_CHARS.replace_all(key, "_").into_owned()
}

/// On-disk document: `{"Restarts": [...]}` plus any fields written by newer
/// versions, which are carried through unchanged.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    #[serde(rename = "Restarts", default, deserialize_with = "null_as_empty")]
    pub restarts: Vec<DateTime<Utc>>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<Vec<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<Vec<DateTime<Utc>>>::deserialize(deserializer).map(Option::unwrap_or_default)
}

/// Result of decoding raw file contents.
#[derive(Debug)]
enum Decoded {
    /// Nothing but whitespace: first invocation for this identity.
    Fresh,
    Valid(Metadata),
    Corrupt(serde_json::Error),
}

/// Decode the first JSON value in `bytes`; anything after it is ignored.
fn decode(bytes: &[u8]) -> Decoded {
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Decoded::Fresh;
    }
    match serde_json::Deserializer::from_slice(bytes)
        .into_iter::<Metadata>()
        .next()
    {
        Some(Ok(metadata)) => Decoded::Valid(metadata),
        Some(Err(e)) => Decoded::Corrupt(e),
        None => Decoded::Fresh,
    }
}

/// Decode leniently: corruption degrades to an empty history with a warning.
fn decode_or_empty(bytes: &[u8], path: &Path) -> Metadata {
    match decode(bytes) {
        Decoded::Valid(metadata) => metadata,
        Decoded::Fresh => {
            tracing::debug!(path = %path.display(), "no restart history yet");
            Metadata::default()
        }
        Decoded::Corrupt(e) => {
            tracing::warn!(
                error = %e,
                path = %path.display(),
                "metadata corrupted, ignoring"
            );
            Metadata::default()
        }
    }
}

/// Locates metadata documents inside one directory.
#[derive(Debug, Clone)]
pub struct MetadataStore {
    dir: PathBuf,
}

impl MetadataStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Path of the document for `key`.
    pub fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.meta", sanitize_key(key)))
    }

    /// Open (creating if needed) the document for `key` and take the
    /// exclusive lock without blocking.
    ///
    /// Fails with [`StoreError::LockContended`] if another process holds it.
    pub fn open(&self, key: &str) -> Result<MetadataHandle, StoreError> {
        std::fs::create_dir_all(&self.dir).map_err(|e| StoreError::CreateDir {
            path: self.dir.clone(),
            source: e,
        })?;

        let path = self.path_for(key);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .mode(0o644)
            .open(&path)
            .map_err(|e| StoreError::Open {
                path: path.clone(),
                source: e,
            })?;

        FileExt::try_lock_exclusive(&file).map_err(|e| lock_error(&path, e))?;
        tracing::debug!(path = %path.display(), "acquired metadata lock");

        Ok(MetadataHandle { file, path })
    }

    /// Read the history for `key` under a shared lock, without creating
    /// anything. A missing document reads as empty.
    pub fn peek(&self, key: &str) -> Result<Metadata, StoreError> {
        let path = self.path_for(key);
        let mut file = match File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Metadata::default()),
            Err(e) => {
                return Err(StoreError::Open {
                    path: path.clone(),
                    source: e,
                })
            }
        };
        FileExt::try_lock_shared(&file).map_err(|e| lock_error(&path, e))?;

        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes).map_err(|e| StoreError::Read {
            path: path.clone(),
            source: e,
        })?;
        Ok(decode_or_empty(&bytes, &path))
    }
}

fn lock_error(path: &Path, e: std::io::Error) -> StoreError {
    if e.raw_os_error() == fs2::lock_contended_error().raw_os_error()
        || e.kind() == std::io::ErrorKind::WouldBlock
    {
        StoreError::LockContended {
            path: path.to_path_buf(),
        }
    } else {
        StoreError::Lock {
            path: path.to_path_buf(),
            source: e,
        }
    }
}

/// An open, exclusively locked metadata document.
///
/// The lock lives as long as the handle; it is never released early.
#[derive(Debug)]
pub struct MetadataHandle {
    file: File,
    path: PathBuf,
}

impl MetadataHandle {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the current history. Never fails: unreadable or corrupted
    /// contents are logged and yield an empty history.
    pub fn load(&mut self) -> Metadata {
        let mut bytes = Vec::new();
        let read = self
            .file
            .seek(SeekFrom::Start(0))
            .and_then(|_| self.file.read_to_end(&mut bytes));
        if let Err(e) = read {
            tracing::warn!(
                error = %e,
                path = %self.path.display(),
                "failed to read metadata, ignoring"
            );
            return Metadata::default();
        }
        decode_or_empty(&bytes, &self.path)
    }

    /// Replace the document with `metadata`: truncate, rewind, write.
    ///
    /// Not atomic. Must be called on the handle returned by
    /// [`MetadataStore::open`], which still holds the lock.
    pub fn store(&mut self, metadata: &Metadata) -> Result<(), StoreError> {
        let mut encoded =
            serde_json::to_vec(metadata).map_err(|e| StoreError::Encode { source: e })?;
        encoded.push(b'\n');

        let write_err = |e: std::io::Error| StoreError::Write {
            path: self.path.clone(),
            source: e,
        };
        self.file.set_len(0).map_err(write_err)?;
        self.file.seek(SeekFrom::Start(0)).map_err(write_err)?;
        self.file.write_all(&encoded).map_err(write_err)?;
        self.file.flush().map_err(write_err)?;

        tracing::debug!(
            path = %self.path.display(),
            restarts = metadata.restarts.len(),
            "metadata written"
        );
        Ok(())
    }
}

/// Errors from opening, locking or writing a metadata document.
#[derive(Debug)]
pub enum StoreError {
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },
    Open {
        path: PathBuf,
        source: std::io::Error,
    },
    /// Another invocation for the same identity holds the lock.
    LockContended { path: PathBuf },
    Lock {
        path: PathBuf,
        source: std::io::Error,
    },
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Encode { source: serde_json::Error },
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::CreateDir { path, source } => write!(
                f,
                "failed to create metadata dir {}: {}",
                path.display(),
                source
            ),
            StoreError::Open { path, source } => {
                write!(f, "failed to open metadata {}: {}", path.display(), source)
            }
            StoreError::LockContended { path } => write!(
                f,
                "metadata {} is locked by another invocation",
                path.display()
            ),
            StoreError::Lock { path, source } => {
                write!(f, "failed to lock metadata {}: {}", path.display(), source)
            }
            StoreError::Read { path, source } => {
                write!(f, "failed to read metadata {}: {}", path.display(), source)
            }
            StoreError::Encode { source } => write!(f, "failed to encode metadata: {}", source),
            StoreError::Write { path, source } => {
                write!(f, "could not write metadata {}: {}", path.display(), source)
            }
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StoreError::CreateDir { source, .. } => Some(source),
            StoreError::Open { source, .. } => Some(source),
            StoreError::LockContended { .. } => None,
            StoreError::Lock { source, .. } => Some(source),
            StoreError::Read { source, .. } => Some(source),
            StoreError::Encode { source } => Some(source),
            StoreError::Write { source, .. } => Some(source),
        }
    }
}
