//! The `store_artifacts` step.

use crate::checkout::copy_tree;
use conveyor_core::ids::RunId;
use conveyor_core::{Error, Result};
use std::path::{Component, Path, PathBuf};

/// Where one job's artifacts are kept: `<root>/<run>/<job>/`.
pub fn job_artifacts_dir(artifacts_root: &Path, run_id: &RunId, job: &str) -> PathBuf {
    artifacts_root.join(run_id.to_string()).join(job)
}

/// Copy `source` to `destination` under `dir`. Returns the final path and
/// bytes copied, or `None` when `source` does not exist.
pub fn store_artifact(
    source: &Path,
    dir: &Path,
    destination: &str,
) -> Result<Option<(PathBuf, u64)>> {
    let relative = Path::new(destination.trim_start_matches('/'));
    if relative
        .components()
        .any(|c| matches!(c, Component::ParentDir | Component::Prefix(_)))
    {
        return Err(Error::Sandbox(format!(
            "artifact destination `{destination}` escapes the artifacts directory"
        )));
    }
    if source.symlink_metadata().is_err() {
        return Ok(None);
    }

    let target = dir.join(relative);
    let bytes = copy_tree(source, &target, None)?;
    Ok(Some((target, bytes)))
}

/// Default destination for a `store_artifacts` path: its final component.
pub fn default_destination(path: &str) -> String {
    Path::new(path.trim_end_matches('/'))
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "artifacts".to_string())
}
