//! Tar archiving of cache paths.

use crate::types::{CompressionType, PathRoots};
use conveyor_core::{Error, Result};
use std::io::{Read, Write};
use std::path::Path;
use tracing::debug;

/// Which requested paths made it into an archive.
#[derive(Debug, Default, Clone)]
pub struct ArchiveSummary {
    pub archived: Vec<String>,
    pub missing: Vec<String>,
}

/// Create an archive from paths.
pub fn create_archive<W: Write>(
    writer: W,
    paths: &[String],
    roots: &PathRoots,
    compression: CompressionType,
) -> Result<ArchiveSummary> {
    match compression {
        CompressionType::Zstd => {
            let encoder = zstd::stream::write::Encoder::new(writer, 3)
                .map_err(|e| Error::Cache(format!("Zstd init failed: {}", e)))?;
            let (encoder, summary) = pack(encoder, paths, roots)?;
            encoder
                .finish()
                .map_err(|e| Error::Cache(format!("Zstd finish failed: {}", e)))?;
            Ok(summary)
        }
        CompressionType::Gzip => {
            let encoder = flate2::write::GzEncoder::new(writer, flate2::Compression::default());
            let (encoder, summary) = pack(encoder, paths, roots)?;
            encoder
                .finish()
                .map_err(|e| Error::Cache(format!("Gzip finish failed: {}", e)))?;
            Ok(summary)
        }
        CompressionType::None => {
            let (mut writer, summary) = pack(writer, paths, roots)?;
            writer.flush()?;
            Ok(summary)
        }
    }
}

fn pack<W: Write>(writer: W, paths: &[String], roots: &PathRoots) -> Result<(W, ArchiveSummary)> {
    let mut builder = tar::Builder::new(writer);
    builder.follow_symlinks(false);
    let mut summary = ArchiveSummary::default();

    for path in paths {
        let (disk, name) = roots.resolve(path)?;
        let Ok(metadata) = std::fs::symlink_metadata(&disk) else {
            summary.missing.push(path.clone());
            continue;
        };

        if metadata.is_dir() {
            builder
                .append_dir_all(&name, &disk)
                .map_err(|e| Error::Cache(format!("Failed to pack dir {}: {}", path, e)))?;
        } else {
            builder
                .append_path_with_name(&disk, &name)
                .map_err(|e| Error::Cache(format!("Failed to pack file {}: {}", path, e)))?;
        }
        debug!(path = %path, entry = %name.display(), "Archived cache path");
        summary.archived.push(path.clone());
    }

    let writer = builder
        .into_inner()
        .map_err(|e| Error::Cache(format!("Failed to finish tar: {}", e)))?;
    Ok((writer, summary))
}

/// Extract an archive, mapping each entry back onto `roots`.
///
/// Returns the number of entries written. Fails without writing further
/// entries if one would land outside its root.
pub fn extract_archive<R: Read>(
    reader: R,
    roots: &PathRoots,
    compression: CompressionType,
) -> Result<u64> {
    match compression {
        CompressionType::Zstd => {
            let decoder = zstd::stream::read::Decoder::new(reader)
                .map_err(|e| Error::Cache(format!("Failed to create decoder: {}", e)))?;
            unpack(decoder, roots)
        }
        CompressionType::Gzip => unpack(flate2::read::GzDecoder::new(reader), roots),
        CompressionType::None => unpack(reader, roots),
    }
}

fn unpack<R: Read>(reader: R, roots: &PathRoots) -> Result<u64> {
    let mut archive = tar::Archive::new(reader);
    archive.set_preserve_permissions(true);
    let mut count = 0;

    let entries = archive
        .entries()
        .map_err(|e| Error::Cache(format!("Failed to read archive: {}", e)))?;
    for entry in entries {
        let mut entry = entry.map_err(|e| Error::Cache(format!("Corrupt archive entry: {}", e)))?;
        let name = entry
            .path()
            .map_err(|e| Error::Cache(format!("Invalid entry path: {}", e)))?
            .into_owned();
        let escapes = || Error::Cache(format!("archive entry `{}` escapes its target", name.display()));

        let entry_type = entry.header().entry_type();
        if entry_type.is_hard_link() {
            return Err(Error::Cache(format!(
                "archive entry `{}` is a hard link",
                name.display()
            )));
        }

        let (base, relative) = roots.split(&name).ok_or_else(escapes)?;
        if through_symlink(&base, &relative, entry_type.is_dir()) {
            return Err(escapes());
        }
        let dest = base.join(&relative);

        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        entry
            .unpack(&dest)
            .map_err(|e| Error::Cache(format!("Failed to unpack {}: {}", name.display(), e)))?;
        count += 1;
    }

    Ok(count)
}

/// Whether writing `relative` under `base` would pass through a symlink.
/// Symlinks above `base` are not considered. The final component only
/// counts for directories, since files and links replace whatever is there.
fn through_symlink(base: &Path, relative: &Path, is_dir: bool) -> bool {
    let mut current = base.to_path_buf();
    let mut parts = relative.components().peekable();
    while let Some(part) = parts.next() {
        current.push(part);
        if parts.peek().is_none() && !is_dir {
            break;
        }
        if std::fs::symlink_metadata(&current).is_ok_and(|meta| meta.file_type().is_symlink()) {
            return true;
        }
    }
    false
}
