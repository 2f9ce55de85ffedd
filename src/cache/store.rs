//! On-disk entry store.
//!
//! Every entry is a payload file plus a metadata sidecar under
//! `entries/<prefix>/`; a top-level `index.json` snapshot carries the full
//! metadata set across restarts. All writes go through a temp file in the
//! destination directory, an fsync, and a rename, so a crash leaves either
//! the previous entry or the new one, never a torn file.

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use bytes::Bytes;
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, warn};

use super::entry::{EntryMeta, PayloadEncoding};

/// Version of the snapshot format. A mismatch is treated as an empty cache.
pub const SCHEMA_VERSION: u32 = 1;

const SNAPSHOT_FILE: &str = "index.json";
const ENTRIES_DIR: &str = "entries";
const META_EXT: &str = "meta";
const BODY_EXT: &str = "body";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("metadata encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Serialize, Deserialize)]
struct Snapshot {
    schema_version: u32,
    entries: Vec<EntryMeta>,
}

/// Disk-backed persistence for cache entries.
pub struct Store {
    root: PathBuf,
    gzip_min_bytes: usize,
}

impl Store {
    /// Open (and create if needed) a store rooted at `root`.
    pub fn open(root: impl Into<PathBuf>, gzip_min_bytes: usize) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(root.join(ENTRIES_DIR))?;
        Ok(Self {
            root,
            gzip_min_bytes,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Persist a payload and its metadata, returning the metadata with the
    /// final encoding and sizes filled in. The payload lands before the
    /// sidecar so metadata never points at a missing body.
    pub fn put(&self, mut meta: EntryMeta, payload: &[u8]) -> Result<EntryMeta, StoreError> {
        let dir = self.entry_dir(&meta.key);
        fs::create_dir_all(&dir)?;

        meta.payload_size_raw = payload.len() as u64;
        let stored: Bytes = if should_compress(&meta.content_type, payload.len(), self.gzip_min_bytes)
        {
            meta.payload_encoding = PayloadEncoding::Gzip;
            gzip(payload)?.into()
        } else {
            meta.payload_encoding = PayloadEncoding::Identity;
            Bytes::copy_from_slice(payload)
        };
        meta.payload_size_stored = stored.len() as u64;

        write_atomic(&dir, &self.body_path(&meta.key), &stored)?;
        write_atomic(&dir, &self.meta_path(&meta.key), &serde_json::to_vec(&meta)?)?;

        debug!(
            target = "statio::cache::store",
            key = %meta.key,
            encoding = ?meta.payload_encoding,
            raw = meta.payload_size_raw,
            stored = meta.payload_size_stored,
            "entry persisted"
        );

        Ok(meta)
    }

    /// Open the payload for an entry; the reader yields decompressed bytes.
    pub fn get(&self, meta: &EntryMeta) -> Result<PayloadReader, StoreError> {
        let file = File::open(self.body_path(&meta.key))?;
        Ok(match meta.payload_encoding {
            PayloadEncoding::Identity => PayloadReader::Plain(file),
            PayloadEncoding::Gzip => PayloadReader::Gzip(Box::new(GzDecoder::new(file))),
        })
    }

    /// Read the full decompressed payload, verifying it against the recorded
    /// raw size. A mismatch means the entry is corrupt.
    pub fn read_payload(&self, meta: &EntryMeta) -> Result<Bytes, StoreError> {
        let mut reader = self.get(meta)?;
        let mut payload = Vec::with_capacity(meta.payload_size_raw as usize);
        reader.read_to_end(&mut payload)?;

        if payload.len() as u64 != meta.payload_size_raw {
            return Err(StoreError::Io(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "payload size mismatch for `{}`: expected {}, read {}",
                    meta.key,
                    meta.payload_size_raw,
                    payload.len()
                ),
            )));
        }

        Ok(payload.into())
    }

    /// Remove an entry's files. Missing files are not an error.
    pub fn delete(&self, key: &str) -> Result<(), StoreError> {
        remove_if_present(&self.body_path(key))?;
        remove_if_present(&self.meta_path(key))?;
        Ok(())
    }

    /// Remove every entry and the snapshot.
    pub fn clear(&self) -> Result<(), StoreError> {
        let entries = self.root.join(ENTRIES_DIR);
        if entries.exists() {
            fs::remove_dir_all(&entries)?;
        }
        remove_if_present(&self.root.join(SNAPSHOT_FILE))?;
        fs::create_dir_all(entries)?;
        Ok(())
    }

    /// Write the metadata snapshot atomically.
    pub fn snapshot(&self, entries: Vec<EntryMeta>) -> Result<(), StoreError> {
        let snapshot = Snapshot {
            schema_version: SCHEMA_VERSION,
            entries,
        };
        write_atomic(
            &self.root,
            &self.root.join(SNAPSHOT_FILE),
            &serde_json::to_vec_pretty(&snapshot)?,
        )?;
        Ok(())
    }

    /// Load entry metadata from disk.
    ///
    /// Prefers the snapshot; a missing snapshot falls back to scanning the
    /// `.meta` sidecars. Entries whose body file is gone are dropped, corrupt
    /// sidecars are deleted, and `revalidating` never survives a restart.
    pub fn load(&self) -> Result<Vec<EntryMeta>, StoreError> {
        let snapshot_path = self.root.join(SNAPSHOT_FILE);
        let mut entries = match fs::read(&snapshot_path) {
            Ok(bytes) => match serde_json::from_slice::<Snapshot>(&bytes) {
                Ok(snapshot) if snapshot.schema_version == SCHEMA_VERSION => snapshot.entries,
                Ok(snapshot) => {
                    warn!(
                        target = "statio::cache::store",
                        found = snapshot.schema_version,
                        expected = SCHEMA_VERSION,
                        "snapshot schema mismatch; starting with an empty cache"
                    );
                    return Ok(Vec::new());
                }
                Err(err) => {
                    warn!(
                        target = "statio::cache::store",
                        error = %err,
                        "snapshot unreadable; rebuilding from sidecars"
                    );
                    self.scan_sidecars()
                }
            },
            Err(err) if err.kind() == io::ErrorKind::NotFound => self.scan_sidecars(),
            Err(err) => return Err(err.into()),
        };

        entries.retain(|meta| {
            let present = self.body_path(&meta.key).is_file();
            if !present {
                warn!(
                    target = "statio::cache::store",
                    key = %meta.key,
                    "dropping entry with missing payload"
                );
                let _ = self.delete(&meta.key);
            }
            present
        });

        for meta in &mut entries {
            meta.revalidating = false;
        }

        Ok(entries)
    }

    fn scan_sidecars(&self) -> Vec<EntryMeta> {
        let mut entries = Vec::new();
        let Ok(prefixes) = fs::read_dir(self.root.join(ENTRIES_DIR)) else {
            return entries;
        };

        for prefix in prefixes.flatten() {
            let Ok(files) = fs::read_dir(prefix.path()) else {
                continue;
            };
            for file in files.flatten() {
                let path = file.path();
                if path.extension().and_then(|ext| ext.to_str()) != Some(META_EXT) {
                    continue;
                }
                match fs::read(&path).map_err(StoreError::from).and_then(|bytes| {
                    serde_json::from_slice::<EntryMeta>(&bytes).map_err(StoreError::from)
                }) {
                    Ok(meta) => entries.push(meta),
                    Err(err) => {
                        warn!(
                            target = "statio::cache::store",
                            path = %path.display(),
                            error = %err,
                            "removing corrupt sidecar"
                        );
                        let _ = fs::remove_file(&path);
                        let _ = fs::remove_file(path.with_extension(BODY_EXT));
                    }
                }
            }
        }

        entries
    }

    fn entry_dir(&self, key: &str) -> PathBuf {
        let prefix = key.get(..2).unwrap_or("00");
        self.root.join(ENTRIES_DIR).join(prefix)
    }

    fn body_path(&self, key: &str) -> PathBuf {
        self.entry_dir(key).join(format!("{key}.{BODY_EXT}"))
    }

    fn meta_path(&self, key: &str) -> PathBuf {
        self.entry_dir(key).join(format!("{key}.{META_EXT}"))
    }
}

/// Streaming payload reader; decompresses gzip-framed entries on the fly.
pub enum PayloadReader {
    Plain(File),
    Gzip(Box<GzDecoder<File>>),
}

impl Read for PayloadReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Plain(file) => file.read(buf),
            Self::Gzip(decoder) => decoder.read(buf),
        }
    }
}

fn write_atomic(dir: &Path, dest: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(dest).map_err(|err| StoreError::Io(err.error))?;
    Ok(())
}

fn gzip(payload: &[u8]) -> io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(payload)?;
    encoder.finish()
}

fn should_compress(content_type: &str, raw_len: usize, min_bytes: usize) -> bool {
    raw_len >= min_bytes && is_textual(content_type)
}

fn is_textual(content_type: &str) -> bool {
    let mime = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();

    mime.starts_with("text/")
        || mime == "application/json"
        || mime == "application/xml"
        || mime == "application/javascript"
        || mime.ends_with("+json")
        || mime.ends_with("+xml")
}

fn remove_if_present(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}
