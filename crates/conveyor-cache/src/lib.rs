//! Revision-keyed build cache for Conveyor.
//!
//! Jobs snapshot paths into compressed tar blobs addressed by rendered cache
//! keys, and later jobs restore them by exact key or key prefix.

pub mod archiver;
pub mod keys;
pub mod provider;
pub mod types;

pub use keys::{KeyContext, matches_prefix, render_key, sanitize_key};
pub use provider::{CacheStore, FilesystemStore};
pub use types::{
    CacheEntry, CacheRestoreRequest, CacheSaveRequest, CompressionType, PathRoots, RestoreResult,
    SaveResult,
};
