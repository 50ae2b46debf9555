//! Cache storage trait and the filesystem store.

use crate::archiver::{create_archive, extract_archive};
use crate::keys::{matches_prefix, sanitize_key};
use crate::types::{CacheEntry, CacheRestoreRequest, CacheSaveRequest, RestoreResult, SaveResult};
use async_trait::async_trait;
use chrono::Utc;
use conveyor_core::spans::cache_span;
use conveyor_core::{CacheEntryId, Error, Result};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tokio::sync::Mutex;
use tracing::{Instrument, debug, info, warn};

const META_SUFFIX: &str = ".meta.json";

/// Trait for cache storage backends.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Restore the best entry for the request's keys, in priority order.
    async fn restore(&self, request: &CacheRestoreRequest) -> Result<RestoreResult>;

    /// Save the request's paths under its key, replacing any previous entry.
    async fn save(&self, request: &CacheSaveRequest) -> Result<SaveResult>;

    /// Check if an entry with exactly this key exists.
    async fn exists(&self, key: &str) -> Result<bool>;

    /// Delete an entry. Returns whether it existed.
    async fn delete(&self, key: &str) -> Result<bool>;

    /// List entries whose key starts with `prefix`, newest first.
    async fn list(&self, prefix: &str) -> Result<Vec<CacheEntry>>;
}

/// Filesystem-backed cache store.
///
/// Each entry is a blob `<root>/<sanitized key>.<entry id>.<ext>` with a JSON
/// sidecar `<root>/<sanitized key>.meta.json` naming it. Renaming the sidecar
/// into place commits a save, so the last writer per key wins and the sidecar
/// always describes the blob it points at.
pub struct FilesystemStore {
    root_dir: PathBuf,
    commit: Mutex<()>,
}

impl FilesystemStore {
    pub fn new(root_dir: impl Into<PathBuf>) -> Self {
        Self {
            root_dir: root_dir.into(),
            commit: Mutex::new(()),
        }
    }

    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    fn meta_path(&self, key: &str) -> PathBuf {
        self.root_dir
            .join(format!("{}{}", sanitize_key(key), META_SUFFIX))
    }

    fn blob_path(&self, entry: &CacheEntry) -> PathBuf {
        self.root_dir.join(format!(
            "{}.{}.{}",
            sanitize_key(&entry.key),
            entry.id,
            entry.compression.extension()
        ))
    }

    fn temp_path(&self) -> PathBuf {
        self.root_dir.join(format!(".tmp-{}", CacheEntryId::new()))
    }

    async fn read_entry(&self, key: &str) -> Result<Option<CacheEntry>> {
        match tokio::fs::read(self.meta_path(key)).await {
            Ok(bytes) => {
                let entry: CacheEntry = serde_json::from_slice(&bytes)?;
                Ok((entry.key == key).then_some(entry))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn extract(&self, entry: &CacheEntry, request: &CacheRestoreRequest) -> Result<u64> {
        let blob = self.blob_path(entry);
        let roots = request.roots.clone();
        let compression = entry.compression;

        tokio::task::spawn_blocking(move || {
            let file = std::fs::File::open(&blob)?;
            extract_archive(std::io::BufReader::new(file), &roots, compression)
        })
        .await
        .map_err(|e| Error::Internal(format!("Cache extract task failed: {}", e)))?
    }

    async fn restore_entry(&self, request: &CacheRestoreRequest) -> Result<RestoreResult> {
        let start = Instant::now();

        for key in &request.keys {
            let (entry, exact) = match self.read_entry(key).await? {
                Some(entry) => (Some(entry), true),
                None => (self.list(key).await?.into_iter().next(), false),
            };

            let Some(entry) = entry else {
                debug!(key = %key, "Cache key missed");
                continue;
            };

            let files = match self.extract(&entry, request).await {
                Ok(files) => files,
                // A concurrent save replaced the entry after it was read.
                Err(Error::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                    warn!(key = %key, matched = %entry.key, "Cache blob replaced during restore");
                    continue;
                }
                Err(e) => return Err(e),
            };
            info!(
                key = %key,
                matched = %entry.key,
                exact,
                files,
                size_bytes = entry.size_bytes,
                "Cache restored"
            );
            return Ok(RestoreResult {
                entry: Some(entry),
                matched_key: Some(key.clone()),
                exact_match: exact,
                duration_ms: start.elapsed().as_millis() as u64,
            });
        }

        info!(keys = ?request.keys, "Cache miss");
        Ok(RestoreResult {
            entry: None,
            matched_key: None,
            exact_match: false,
            duration_ms: start.elapsed().as_millis() as u64,
        })
    }

    async fn save_entry(&self, request: &CacheSaveRequest) -> Result<SaveResult> {
        let start = Instant::now();

        tokio::fs::create_dir_all(&self.root_dir).await?;

        let temp = self.temp_path();
        let blob_temp = temp.clone();
        let paths = request.paths.clone();
        let roots = request.roots.clone();
        let compression = request.compression;

        let (summary, size_bytes, checksum) = tokio::task::spawn_blocking(move || {
            let file = std::fs::File::create(&blob_temp)?;
            let summary =
                create_archive(std::io::BufWriter::new(file), &paths, &roots, compression)?;

            let mut hasher = Sha256::new();
            let mut blob = std::fs::File::open(&blob_temp)?;
            let size_bytes = std::io::copy(&mut blob, &mut hasher)?;
            Ok::<_, Error>((summary, size_bytes, hex::encode(hasher.finalize())))
        })
        .await
        .map_err(|e| Error::Internal(format!("Cache archive task failed: {}", e)))??;

        if summary.archived.is_empty() {
            warn!(key = %request.key, missing = ?summary.missing, "No cache paths exist, skipping save");
            tokio::fs::remove_file(&temp).await?;
            return Ok(SaveResult {
                entry: None,
                missing_paths: summary.missing,
                duration_ms: start.elapsed().as_millis() as u64,
            });
        }

        let entry = CacheEntry {
            id: CacheEntryId::new(),
            key: request.key.clone(),
            size_bytes,
            created_at: Utc::now(),
            compression,
            checksum,
            paths: summary.archived,
        };

        let meta_temp = self.temp_path();
        tokio::fs::write(&meta_temp, serde_json::to_vec_pretty(&entry)?).await?;
        tokio::fs::rename(&temp, self.blob_path(&entry)).await?;

        {
            let _commit = self.commit.lock().await;
            let previous = self.read_entry(&request.key).await.ok().flatten();
            tokio::fs::rename(&meta_temp, self.meta_path(&entry.key)).await?;
            if let Some(previous) = previous {
                remove_blob(&self.blob_path(&previous)).await?;
            }
        }

        if !summary.missing.is_empty() {
            warn!(key = %entry.key, missing = ?summary.missing, "Some cache paths do not exist");
        }
        info!(key = %entry.key, size_bytes, "Cache saved");

        Ok(SaveResult {
            entry: Some(entry),
            missing_paths: summary.missing,
            duration_ms: start.elapsed().as_millis() as u64,
        })
    }
}

#[async_trait]
impl CacheStore for FilesystemStore {
    async fn restore(&self, request: &CacheRestoreRequest) -> Result<RestoreResult> {
        let key = request.keys.first().map_or("", String::as_str);
        self.restore_entry(request)
            .instrument(cache_span("restore", key))
            .await
    }

    async fn save(&self, request: &CacheSaveRequest) -> Result<SaveResult> {
        self.save_entry(request)
            .instrument(cache_span("save", &request.key))
            .await
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.read_entry(key).await?.is_some())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let Some(entry) = self.read_entry(key).await? else {
            return Ok(false);
        };
        tokio::fs::remove_file(self.meta_path(key)).await?;
        remove_blob(&self.blob_path(&entry)).await?;
        debug!(key = %key, "Cache entry deleted");
        Ok(true)
    }

    async fn list(&self, prefix: &str) -> Result<Vec<CacheEntry>> {
        if !self.root_dir.exists() {
            return Ok(vec![]);
        }

        let mut entries = vec![];
        let mut read_dir = tokio::fs::read_dir(&self.root_dir).await?;

        while let Some(dir_entry) = read_dir.next_entry().await? {
            let name = dir_entry.file_name().to_string_lossy().to_string();
            if !name.ends_with(META_SUFFIX) {
                continue;
            }

            let bytes = tokio::fs::read(dir_entry.path()).await?;
            match serde_json::from_slice::<CacheEntry>(&bytes) {
                Ok(entry) if matches_prefix(&entry.key, prefix) => entries.push(entry),
                Ok(_) => {}
                Err(e) => warn!(file = %name, error = %e, "Skipping unreadable cache metadata"),
            }
        }

        entries.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.key.cmp(&a.key))
        });

        Ok(entries)
    }
}

async fn remove_blob(path: &Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
        _ => Ok(()),
    }
}
