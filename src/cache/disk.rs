use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use log::debug;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;

use crate::cache::key::{cache_key, CacheKeyParams};

pub(crate) const DATA_EXTENSION: &str = "bin";
pub(crate) const META_EXTENSION: &str = "json";
pub(crate) const TMP_EXTENSION: &str = "tmp";

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Cache IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Cache metadata error: {0}")]
    Metadata(#[from] serde_json::Error),
}

/// A transformed image as stored in and served from the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub buffer: Vec<u8>,
    pub content_type: String,
    pub max_age: u64,
    pub etag: Option<String>,
}

/// Sidecar written next to every data file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct EntryMetadata {
    pub content_type: String,
    pub max_age: u64,
    pub etag: Option<String>,
    pub size: u64,
    pub stored_at: DateTime<Utc>,
}

/// Persistent cache of transformed images, one data file plus one JSON
/// sidecar per key, sharded by the first two hex digits of the key.
///
/// Entries are never expired here. Size bounds are enforced out of band by
/// [`crate::cache::prune_to_size`].
pub struct DiskCache {
    cache_dir: PathBuf,
}

impl DiskCache {
    /// Does not touch the filesystem; directories are created on first write.
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
        }
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    fn entry_paths(&self, key: &str) -> (PathBuf, PathBuf) {
        let shard = self.cache_dir.join(&key[..2]);
        (
            shard.join(format!("{}.{}", key, DATA_EXTENSION)),
            shard.join(format!("{}.{}", key, META_EXTENSION)),
        )
    }

    /// Look up the entry for `params`. A cold or missing cache directory is
    /// a miss, not an error.
    pub async fn get(&self, params: &CacheKeyParams) -> Result<Option<CacheEntry>, CacheError> {
        let key = cache_key(params);
        let (data_path, meta_path) = self.entry_paths(&key);

        let raw_meta = match fs::read(&meta_path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let meta: EntryMetadata = serde_json::from_slice(&raw_meta)?;

        let buffer = match fs::read(&data_path).await {
            Ok(buffer) => buffer,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("Cache entry {} has metadata but no data file", key);
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        // A concurrent overwrite can pair new data with old metadata
        if buffer.len() as u64 != meta.size {
            debug!(
                "Cache entry {} size mismatch ({} on disk, {} recorded)",
                key,
                buffer.len(),
                meta.size
            );
            return Ok(None);
        }

        Ok(Some(CacheEntry {
            buffer,
            content_type: meta.content_type,
            max_age: meta.max_age,
            etag: meta.etag,
        }))
    }

    /// Store `entry` for `params`, replacing any previous entry.
    pub async fn set(&self, params: &CacheKeyParams, entry: &CacheEntry) -> Result<(), CacheError> {
        self.write_entry(&cache_key(params), entry, Utc::now()).await
    }

    /// Delete the entry for `params`. Returns whether anything was removed.
    pub async fn remove(&self, params: &CacheKeyParams) -> Result<bool, CacheError> {
        let key = cache_key(params);
        let (data_path, meta_path) = self.entry_paths(&key);

        let mut removed = false;
        for path in [meta_path, data_path] {
            match fs::remove_file(&path).await {
                Ok(()) => removed = true,
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(removed)
    }

    pub(crate) async fn write_entry(
        &self,
        key: &str,
        entry: &CacheEntry,
        stored_at: DateTime<Utc>,
    ) -> Result<(), CacheError> {
        let (data_path, meta_path) = self.entry_paths(key);

        if let Some(shard) = data_path.parent() {
            fs::create_dir_all(shard).await?;
        }

        let meta = EntryMetadata {
            content_type: entry.content_type.clone(),
            max_age: entry.max_age,
            etag: entry.etag.clone(),
            size: entry.buffer.len() as u64,
            stored_at,
        };

        // Data first so that visible metadata always has its data file
        write_atomic(&data_path, &entry.buffer).await?;
        write_atomic(&meta_path, &serde_json::to_vec(&meta)?).await?;

        Ok(())
    }
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), CacheError> {
    let tmp = tmp_path(path);

    if let Err(e) = fs::write(&tmp, bytes).await {
        let _ = fs::remove_file(&tmp).await;
        return Err(e.into());
    }
    if let Err(e) = fs::rename(&tmp, path).await {
        let _ = fs::remove_file(&tmp).await;
        return Err(e.into());
    }

    Ok(())
}

// Unique per writer so concurrent sets of one key never share a temp file
fn tmp_path(path: &Path) -> PathBuf {
    let n = TMP_COUNTER.fetch_add(1, Ordering::Relaxed);
    let mut name = path.as_os_str().to_owned();
    name.push(format!(".{}.{}.{}", std::process::id(), n, TMP_EXTENSION));
    PathBuf::from(name)
}
