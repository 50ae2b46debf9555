//! Cache types and requests.

use chrono::{DateTime, Utc};
use conveyor_core::{CacheEntryId, Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};

/// Compression algorithm.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CompressionType {
    None,
    #[default]
    Zstd,
    Gzip,
}

impl CompressionType {
    /// File extension of a blob using this compression.
    pub fn extension(&self) -> &'static str {
        match self {
            CompressionType::None => "tar",
            CompressionType::Zstd => "tar.zst",
            CompressionType::Gzip => "tar.gz",
        }
    }
}

/// The directories cache paths are resolved against.
///
/// Archive entries are stored relative to one of three roots so a blob saved
/// from one job's sandbox restores into another's:
/// `home/` for paths under the home directory (or starting with `~`),
/// `work/` for relative paths and `root/` for any other absolute path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathRoots {
    pub work_dir: PathBuf,
    pub home_dir: PathBuf,
}

const HOME_ROOT: &str = "home";
const WORK_ROOT: &str = "work";
const FS_ROOT: &str = "root";

impl PathRoots {
    pub fn new(work_dir: impl Into<PathBuf>, home_dir: impl Into<PathBuf>) -> Self {
        Self {
            work_dir: work_dir.into(),
            home_dir: home_dir.into(),
        }
    }

    /// Roots where home and working directory coincide.
    pub fn single(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        Self::new(dir.clone(), dir)
    }

    /// Expand `~` and resolve relative paths against the working directory.
    pub fn expand(&self, path: &str) -> PathBuf {
        if path == "~" {
            self.home_dir.clone()
        } else if let Some(rest) = path.strip_prefix("~/") {
            self.home_dir.join(rest)
        } else {
            self.work_dir.join(path)
        }
    }

    /// Resolve a user-supplied path to its location on disk and its archive entry name.
    pub fn resolve(&self, path: &str) -> Result<(PathBuf, PathBuf)> {
        let disk = self.expand(path);
        if disk.components().any(|c| c == Component::ParentDir) {
            return Err(Error::Cache(format!("path `{path}` must not contain `..`")));
        }

        let entry = if let Ok(rest) = disk.strip_prefix(&self.home_dir) {
            Path::new(HOME_ROOT).join(rest)
        } else if let Ok(rest) = disk.strip_prefix(&self.work_dir) {
            Path::new(WORK_ROOT).join(rest)
        } else {
            let rest: PathBuf = disk
                .components()
                .filter(|c| matches!(c, Component::Normal(_)))
                .collect();
            Path::new(FS_ROOT).join(rest)
        };

        Ok((disk, entry))
    }

    /// Map an archive entry name back onto disk. Returns `None` for entries
    /// outside the known roots or that try to escape them.
    pub fn locate(&self, entry: &Path) -> Option<PathBuf> {
        self.split(entry).map(|(base, relative)| base.join(relative))
    }

    /// Split an archive entry name into the root directory it restores under
    /// and its normalised path below that root.
    pub fn split(&self, entry: &Path) -> Option<(PathBuf, PathBuf)> {
        let mut components = entry.components();
        let base = match components.next()? {
            Component::Normal(root) if root == HOME_ROOT => self.home_dir.clone(),
            Component::Normal(root) if root == WORK_ROOT => self.work_dir.clone(),
            Component::Normal(root) if root == FS_ROOT => PathBuf::from("/"),
            _ => return None,
        };

        let mut relative = PathBuf::new();
        for component in components {
            match component {
                Component::Normal(part) => relative.push(part),
                Component::CurDir => {}
                Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
            }
        }
        Some((base, relative))
    }
}

/// A stored cache entry, persisted as a JSON sidecar next to its blob.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub id: CacheEntryId,
    /// Rendered cache key.
    pub key: String,
    /// Blob size in bytes.
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
    pub compression: CompressionType,
    /// SHA-256 of the blob, hex encoded.
    pub checksum: String,
    /// The paths that were saved, as written in the config.
    pub paths: Vec<String>,
}

/// Request to save a cache entry.
#[derive(Debug, Clone)]
pub struct CacheSaveRequest {
    pub key: String,
    pub paths: Vec<String>,
    pub roots: PathRoots,
    pub compression: CompressionType,
}

impl CacheSaveRequest {
    pub fn new(key: impl Into<String>, paths: Vec<String>, roots: PathRoots) -> Self {
        Self {
            key: key.into(),
            paths,
            roots,
            compression: CompressionType::default(),
        }
    }

    pub fn with_compression(mut self, compression: CompressionType) -> Self {
        self.compression = compression;
        self
    }
}

/// Request to restore a cache entry.
#[derive(Debug, Clone)]
pub struct CacheRestoreRequest {
    /// Keys in priority order. Each is tried as an exact key, then as a prefix.
    pub keys: Vec<String>,
    pub roots: PathRoots,
}

impl CacheRestoreRequest {
    pub fn new(keys: Vec<String>, roots: PathRoots) -> Self {
        Self { keys, roots }
    }
}

/// Result of a cache restore operation.
#[derive(Debug, Clone)]
pub struct RestoreResult {
    /// The matched cache entry, if any.
    pub entry: Option<CacheEntry>,
    /// The requested key that produced the hit.
    pub matched_key: Option<String>,
    /// Whether the entry's key equals the requested key.
    pub exact_match: bool,
    pub duration_ms: u64,
}

impl RestoreResult {
    pub fn is_hit(&self) -> bool {
        self.entry.is_some()
    }
}

/// Result of a cache save operation.
#[derive(Debug, Clone)]
pub struct SaveResult {
    /// The saved entry, or `None` when none of the paths existed.
    pub entry: Option<CacheEntry>,
    pub missing_paths: Vec<String>,
    pub duration_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roots() -> PathRoots {
        PathRoots::new("/sandbox/home/fun", "/sandbox/home")
    }

    #[test]
    fn test_resolve_entries() {
        let roots = roots();

        let (disk, entry) = roots.resolve("~/fun/docker/images/").unwrap();
        assert_eq!(disk, PathBuf::from("/sandbox/home/fun/docker/images/"));
        assert_eq!(entry, PathBuf::from("home/fun/docker/images"));

        let (disk, entry) = roots.resolve("node_modules").unwrap();
        assert_eq!(disk, PathBuf::from("/sandbox/home/fun/node_modules"));
        assert_eq!(entry, PathBuf::from("home/fun/node_modules"));

        let (_, entry) = roots.resolve("/opt/tools").unwrap();
        assert_eq!(entry, PathBuf::from("root/opt/tools"));

        assert!(roots.resolve("../outside").is_err());
    }

    #[test]
    fn test_work_root_when_outside_home() {
        let roots = PathRoots::new("/builds/app", "/sandbox/home");
        let (_, entry) = roots.resolve("target").unwrap();
        assert_eq!(entry, PathBuf::from("work/target"));
        assert_eq!(
            roots.locate(&entry),
            Some(PathBuf::from("/builds/app/target"))
        );
    }

    #[test]
    fn test_locate_rejects_escapes() {
        let roots = roots();
        assert_eq!(
            roots.locate(Path::new("home/fun/a.tar")),
            Some(PathBuf::from("/sandbox/home/fun/a.tar"))
        );
        assert_eq!(roots.locate(Path::new("home/../../etc/passwd")), None);
        assert_eq!(roots.locate(Path::new("elsewhere/file")), None);
        assert_eq!(roots.locate(Path::new("/etc/passwd")), None);
    }

    #[test]
    fn test_extensions() {
        assert_eq!(CompressionType::Zstd.extension(), "tar.zst");
        assert_eq!(CompressionType::Gzip.extension(), "tar.gz");
        assert_eq!(CompressionType::None.extension(), "tar");
    }
}
