//! The `checkout` step: copy the source tree into the sandbox.

use conveyor_core::{Error, Result};
use std::path::Path;
use tracing::debug;

/// Copy `source` (including `.git`) into `dest`, returning the bytes copied.
///
/// `skip` names a directory inside `source` to leave out, such as the
/// workspace root when it lives in the source tree.
pub fn checkout(source: &Path, dest: &Path, skip: Option<&Path>) -> Result<u64> {
    if !source.is_dir() {
        return Err(Error::Sandbox(format!(
            "Source directory {} does not exist",
            source.display()
        )));
    }
    let bytes = copy_tree(source, dest, skip)?;
    debug!(source = %source.display(), dest = %dest.display(), bytes, "Checked out source");
    Ok(bytes)
}

/// Recursively copy a file or directory. Symlinks are recreated, not followed.
pub(crate) fn copy_tree(src: &Path, dest: &Path, skip: Option<&Path>) -> Result<u64> {
    if skip.is_some_and(|skip| src == skip) {
        return Ok(0);
    }

    let metadata = std::fs::symlink_metadata(src)?;
    if metadata.file_type().is_symlink() {
        let target = std::fs::read_link(src)?;
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if dest.symlink_metadata().is_ok() {
            std::fs::remove_file(dest)?;
        }
        std::os::unix::fs::symlink(&target, dest)?;
        return Ok(0);
    }

    if metadata.is_file() {
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        return Ok(std::fs::copy(src, dest)?);
    }

    std::fs::create_dir_all(dest)?;
    let mut total = 0;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        total += copy_tree(&entry.path(), &dest.join(entry.file_name()), skip)?;
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_checkout_copies_git_dir() {
        let src = TempDir::new().unwrap();
        fs::create_dir_all(src.path().join(".git/refs")).unwrap();
        fs::write(src.path().join(".git/HEAD"), b"ref: refs/heads/master\n").unwrap();
        fs::create_dir_all(src.path().join("docker")).unwrap();
        fs::write(src.path().join("docker/Dockerfile"), b"FROM python:3.6").unwrap();

        let dest = TempDir::new().unwrap();
        let target = dest.path().join("fun");
        let bytes = checkout(src.path(), &target, None).unwrap();

        assert_eq!(bytes, 23 + 15);
        assert!(target.join(".git/refs").is_dir());
        assert_eq!(
            fs::read_to_string(target.join("docker/Dockerfile")).unwrap(),
            "FROM python:3.6"
        );
    }

    #[test]
    fn test_checkout_skips_nested_workspace() {
        let src = TempDir::new().unwrap();
        fs::write(src.path().join("setup.py"), b"").unwrap();
        fs::create_dir_all(src.path().join(".conveyor/workspaces")).unwrap();
        fs::write(src.path().join(".conveyor/workspaces/junk"), b"junk").unwrap();

        let dest = TempDir::new().unwrap();
        let skip = src.path().join(".conveyor");
        checkout(src.path(), dest.path(), Some(&skip)).unwrap();

        assert!(dest.path().join("setup.py").exists());
        assert!(!dest.path().join(".conveyor").exists());
    }

    #[test]
    fn test_checkout_missing_source() {
        let dest = TempDir::new().unwrap();
        let err = checkout(Path::new("/nonexistent/source"), dest.path(), None).unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }
}
