use std::collections::HashSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use rocket::fairing::AdHoc;
use tokio::fs;

use crate::cache::disk::{CacheError, EntryMetadata, DATA_EXTENSION, META_EXTENSION, TMP_EXTENSION};

// Temp files younger than this may belong to a write in progress
const STALE_TMP_AGE: Duration = Duration::from_secs(10 * 60);

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PruneReport {
    pub removed_entries: usize,
    pub removed_bytes: u64,
    pub remaining_bytes: u64,
}

struct StoredEntry {
    key: String,
    data_path: PathBuf,
    meta_path: PathBuf,
    size: u64,
    stored_at: DateTime<Utc>,
}

/// Remove the oldest entries until the data files fit in `max_bytes`.
///
/// Entries with unreadable metadata are removed first. Stale temp files
/// and data files whose metadata was never written are deleted along the
/// way.
pub async fn prune_to_size(cache_dir: &Path, max_bytes: u64) -> Result<PruneReport, CacheError> {
    let mut entries = Vec::new();
    let mut data_files = Vec::new();

    let mut shards = match fs::read_dir(cache_dir).await {
        Ok(shards) => shards,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(PruneReport::default()),
        Err(e) => return Err(e.into()),
    };

    while let Some(shard) = shards.next_entry().await? {
        if !shard.file_type().await?.is_dir() {
            continue;
        }

        let mut files = fs::read_dir(shard.path()).await?;
        while let Some(file) = files.next_entry().await? {
            let path = file.path();
            match path.extension().and_then(|e| e.to_str()) {
                Some(ext) if ext == TMP_EXTENSION => remove_if_stale(&path).await?,
                Some(ext) if ext == META_EXTENSION => {
                    entries.push(load_entry(&path).await?);
                }
                Some(ext) if ext == DATA_EXTENSION => data_files.push(path),
                _ => {}
            }
        }
    }

    // Oldest first, key as a stable tie-break
    entries.sort_by(|a, b| a.stored_at.cmp(&b.stored_at).then_with(|| a.key.cmp(&b.key)));

    let mut report = PruneReport {
        remaining_bytes: entries.iter().map(|e| e.size).sum(),
        ..PruneReport::default()
    };

    // Data files without metadata are unreachable once their writer is gone
    let referenced: HashSet<&Path> = entries.iter().map(|e| e.data_path.as_path()).collect();
    for path in data_files.iter().filter(|p| !referenced.contains(p.as_path())) {
        let Some((size, age)) = file_size_and_age(path).await? else {
            continue;
        };
        if age >= STALE_TMP_AGE {
            remove_quietly(path).await?;
            debug!("Removed orphaned cache data {:?} ({} bytes)", path, size);
            report.removed_entries += 1;
            report.removed_bytes += size;
        } else {
            report.remaining_bytes += size;
        }
    }

    for entry in entries {
        if report.remaining_bytes <= max_bytes {
            break;
        }

        // Metadata goes first so readers see a clean miss
        remove_quietly(&entry.meta_path).await?;
        remove_quietly(&entry.data_path).await?;

        debug!("Pruned cache entry {} ({} bytes)", entry.key, entry.size);
        report.removed_entries += 1;
        report.removed_bytes += entry.size;
        report.remaining_bytes -= entry.size;
    }

    Ok(report)
}

async fn load_entry(meta_path: &Path) -> Result<StoredEntry, CacheError> {
    let key = meta_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let data_path = meta_path.with_extension(DATA_EXTENSION);

    let size = match fs::metadata(&data_path).await {
        Ok(meta) => meta.len(),
        Err(e) if e.kind() == ErrorKind::NotFound => 0,
        Err(e) => return Err(e.into()),
    };

    let stored_at = match fs::read(meta_path).await {
        Ok(raw) => match serde_json::from_slice::<EntryMetadata>(&raw) {
            Ok(meta) => meta.stored_at,
            Err(e) => {
                warn!("Unreadable cache metadata {:?}: {}", meta_path, e);
                DateTime::<Utc>::MIN_UTC
            }
        },
        Err(e) if e.kind() == ErrorKind::NotFound => DateTime::<Utc>::MIN_UTC,
        Err(e) => return Err(e.into()),
    };

    Ok(StoredEntry {
        key,
        data_path,
        meta_path: meta_path.to_path_buf(),
        size,
        stored_at,
    })
}

async fn file_size_and_age(path: &Path) -> Result<Option<(u64, Duration)>, CacheError> {
    let meta = match fs::metadata(path).await {
        Ok(meta) => meta,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let age = SystemTime::now()
        .duration_since(meta.modified()?)
        .unwrap_or_default();
    Ok(Some((meta.len(), age)))
}

async fn remove_if_stale(path: &Path) -> Result<(), CacheError> {
    if let Some((_, age)) = file_size_and_age(path).await? {
        if age >= STALE_TMP_AGE {
            debug!("Removing stale temp file {:?}", path);
            remove_quietly(path).await?;
        }
    }
    Ok(())
}

async fn remove_quietly(path: &Path) -> Result<(), CacheError> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Liftoff fairing that prunes the cache directory on a fixed interval.
pub fn pruner_fairing(cache_dir: PathBuf, max_bytes: u64, interval: Duration) -> AdHoc {
    AdHoc::on_liftoff("Cache pruner", move |_| {
        let cache_dir = cache_dir.clone();
        Box::pin(async move {
            info!(
                "Cache pruning enabled: {} MB limit, every {}s",
                max_bytes / (1024 * 1024),
                interval.as_secs()
            );

            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                loop {
                    ticker.tick().await;
                    match prune_to_size(&cache_dir, max_bytes).await {
                        Ok(report) if report.removed_entries > 0 => info!(
                            "Pruned {} cache entries ({} bytes), {} bytes remain",
                            report.removed_entries, report.removed_bytes, report.remaining_bytes
                        ),
                        Ok(report) => debug!(
                            "Cache within limit ({} bytes)",
                            report.remaining_bytes
                        ),
                        Err(e) => warn!("Cache pruning failed: {}", e),
                    }
                }
            });
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::disk::{CacheEntry, DiskCache};
    use chrono::TimeZone;
    use rocket::figment::Figment;
    use rocket::local::asynchronous::Client;
    use tempfile::tempdir;

    fn entry(size: usize) -> CacheEntry {
        CacheEntry {
            buffer: vec![7u8; size],
            content_type: "image/png".to_string(),
            max_age: 60,
            etag: None,
        }
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn backdate(path: &Path) {
        std::fs::File::options()
            .write(true)
            .open(path)
            .unwrap()
            .set_modified(SystemTime::now() - Duration::from_secs(3600))
            .unwrap();
    }

    #[tokio::test]
    async fn missing_directory_prunes_nothing() {
        let dir = tempdir().unwrap();
        let report = prune_to_size(&dir.path().join("absent"), 0).await.unwrap();
        assert_eq!(report, PruneReport::default());
    }

    #[tokio::test]
    async fn removes_oldest_entries_first() {
        let dir = tempdir().unwrap();
        let cache = DiskCache::new(dir.path());

        let keys = ["aa01", "bb02", "cc03"];
        for (i, key) in keys.iter().enumerate() {
            cache.write_entry(key, &entry(100), at(i as i64)).await.unwrap();
        }

        let report = prune_to_size(dir.path(), 250).await.unwrap();

        assert_eq!(report.removed_entries, 1);
        assert_eq!(report.removed_bytes, 100);
        assert_eq!(report.remaining_bytes, 200);
        assert!(!dir.path().join("aa").join("aa01.json").exists());
        assert!(!dir.path().join("aa").join("aa01.bin").exists());
        assert!(dir.path().join("bb").join("bb02.bin").exists());
        assert!(dir.path().join("cc").join("cc03.bin").exists());
    }

    #[tokio::test]
    async fn within_limit_is_untouched() {
        let dir = tempdir().unwrap();
        let cache = DiskCache::new(dir.path());
        cache.write_entry("aa01", &entry(100), at(0)).await.unwrap();

        let report = prune_to_size(dir.path(), 1000).await.unwrap();

        assert_eq!(report.removed_entries, 0);
        assert_eq!(report.remaining_bytes, 100);
    }

    #[tokio::test]
    async fn fresh_temp_files_are_kept() {
        let dir = tempdir().unwrap();
        let shard = dir.path().join("aa");
        std::fs::create_dir_all(&shard).unwrap();
        let tmp = shard.join("aa01.bin.1.0.tmp");
        std::fs::write(&tmp, b"in flight").unwrap();

        prune_to_size(dir.path(), 0).await.unwrap();

        assert!(tmp.exists());
    }

    #[tokio::test]
    async fn stale_temp_files_are_removed() {
        let dir = tempdir().unwrap();
        let shard = dir.path().join("aa");
        std::fs::create_dir_all(&shard).unwrap();
        let tmp = shard.join("aa01.bin.1.0.tmp");
        std::fs::write(&tmp, b"abandoned").unwrap();
        backdate(&tmp);

        prune_to_size(dir.path(), 0).await.unwrap();

        assert!(!tmp.exists());
    }

    #[tokio::test]
    async fn orphaned_data_files_are_counted_and_removed() {
        let dir = tempdir().unwrap();
        let cache = DiskCache::new(dir.path());
        cache.write_entry("aa01", &entry(1000), at(0)).await.unwrap();
        cache.write_entry("bb02", &entry(100), at(1)).await.unwrap();

        let orphan = dir.path().join("aa").join("aa01.bin");
        std::fs::remove_file(dir.path().join("aa").join("aa01.json")).unwrap();
        backdate(&orphan);

        let report = prune_to_size(dir.path(), 500).await.unwrap();

        assert_eq!(report.removed_entries, 1);
        assert_eq!(report.removed_bytes, 1000);
        assert_eq!(report.remaining_bytes, 100);
        assert!(!orphan.exists());
        assert!(dir.path().join("bb").join("bb02.bin").exists());
    }

    #[tokio::test]
    async fn fresh_orphans_count_toward_the_limit() {
        let dir = tempdir().unwrap();
        let cache = DiskCache::new(dir.path());
        cache.write_entry("aa01", &entry(100), at(0)).await.unwrap();
        cache.write_entry("bb02", &entry(300), at(1)).await.unwrap();
        std::fs::remove_file(dir.path().join("bb").join("bb02.json")).unwrap();

        // bb02 may still be mid-write, so it stays but its bytes push aa01 out
        let report = prune_to_size(dir.path(), 350).await.unwrap();

        assert_eq!(report.removed_entries, 1);
        assert_eq!(report.removed_bytes, 100);
        assert_eq!(report.remaining_bytes, 300);
        assert!(dir.path().join("bb").join("bb02.bin").exists());
        assert!(!dir.path().join("aa").join("aa01.bin").exists());
    }

    #[rocket::async_test]
    async fn fairing_prunes_after_liftoff() {
        let dir = tempdir().unwrap();
        let cache = DiskCache::new(dir.path());
        cache.write_entry("aa01", &entry(100), at(0)).await.unwrap();
        cache.write_entry("bb02", &entry(100), at(1)).await.unwrap();

        let rocket = rocket::custom(Figment::from(rocket::Config::debug_default())).attach(
            pruner_fairing(dir.path().to_path_buf(), 150, Duration::from_millis(20)),
        );
        let _client = Client::tracked(rocket).await.unwrap();

        let oldest = dir.path().join("aa").join("aa01.bin");
        for _ in 0..100 {
            if !oldest.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        assert!(!oldest.exists());
        assert!(dir.path().join("bb").join("bb02.bin").exists());
    }
}
