//! Per-job sandbox directories.

use conveyor_cache::PathRoots;
use conveyor_core::ids::RunId;
use conveyor_core::{Error, Result};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Working directory used when a job sets none.
pub const DEFAULT_WORKING_DIRECTORY: &str = "~/project";

/// An isolated directory tree for one job: `<workspace>/<run>/<job>/` with a
/// private `home/` that stands in for `~`.
#[derive(Debug, Clone)]
pub struct Sandbox {
    root: PathBuf,
    home: PathBuf,
    working_dir: PathBuf,
}

impl Sandbox {
    pub fn create(
        workspace_root: &Path,
        run_id: &RunId,
        job: &str,
        working_directory: Option<&str>,
    ) -> Result<Self> {
        let root = Self::root_for(workspace_root, run_id, job);
        let home = root.join("home");
        std::fs::create_dir_all(&home).map_err(|e| {
            Error::Sandbox(format!("Failed to create {}: {}", home.display(), e))
        })?;

        let working_dir = expand_home(
            working_directory.unwrap_or(DEFAULT_WORKING_DIRECTORY),
            &home,
            &home,
        );
        std::fs::create_dir_all(&working_dir).map_err(|e| {
            Error::Sandbox(format!("Failed to create {}: {}", working_dir.display(), e))
        })?;

        debug!(root = %root.display(), working_dir = %working_dir.display(), "Sandbox ready");
        Ok(Self {
            root,
            home,
            working_dir,
        })
    }

    /// Where `create` places the sandbox, without touching the filesystem.
    pub fn root_for(workspace_root: &Path, run_id: &RunId, job: &str) -> PathBuf {
        workspace_root
            .join(run_id.to_string())
            .join(sanitize_component(job))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn home(&self) -> &Path {
        &self.home
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    /// Roots cache paths resolve against.
    pub fn roots(&self) -> PathRoots {
        PathRoots::new(&self.working_dir, &self.home)
    }

    /// Resolve a step path: `~` is the sandbox home, relative paths start at
    /// the working directory.
    pub fn expand(&self, path: &str) -> PathBuf {
        expand_home(path, &self.home, &self.working_dir)
    }

    pub fn cleanup(&self) -> Result<()> {
        std::fs::remove_dir_all(&self.root).map_err(|e| {
            Error::Sandbox(format!("Failed to remove {}: {}", self.root.display(), e))
        })
    }
}

fn expand_home(path: &str, home: &Path, relative_to: &Path) -> PathBuf {
    if path == "~" {
        home.to_path_buf()
    } else if let Some(rest) = path.strip_prefix("~/") {
        home.join(rest)
    } else {
        relative_to.join(path)
    }
}

fn sanitize_component(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            '/' | '\\' | ':' => '_',
            c if c.is_whitespace() => '_',
            _ => c,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_layout_and_default_working_dir() {
        let ws = TempDir::new().unwrap();
        let run = RunId::new();
        let sandbox = Sandbox::create(ws.path(), &run, "test-back", None).unwrap();

        assert_eq!(sandbox.root(), ws.path().join(run.to_string()).join("test-back"));
        assert_eq!(sandbox.home(), sandbox.root().join("home"));
        assert_eq!(sandbox.working_dir(), sandbox.home().join("project"));
        assert!(sandbox.working_dir().is_dir());
    }

    #[test]
    fn test_tilde_working_directory() {
        let ws = TempDir::new().unwrap();
        let sandbox = Sandbox::create(ws.path(), &RunId::new(), "build", Some("~/fun")).unwrap();
        assert_eq!(sandbox.working_dir(), sandbox.home().join("fun"));

        assert_eq!(sandbox.expand("~/fun/docker/images/"), sandbox.home().join("fun/docker/images/"));
        assert_eq!(sandbox.expand("reports"), sandbox.working_dir().join("reports"));
        assert_eq!(sandbox.expand("/tmp/x"), PathBuf::from("/tmp/x"));
    }

    #[test]
    fn test_jobs_are_isolated() {
        let ws = TempDir::new().unwrap();
        let run = RunId::new();
        let a = Sandbox::create(ws.path(), &run, "build", None).unwrap();
        let b = Sandbox::create(ws.path(), &run, "build-alpine", None).unwrap();
        assert_ne!(a.home(), b.home());

        std::fs::write(a.working_dir().join("f"), b"x").unwrap();
        assert!(!b.working_dir().join("f").exists());
    }

    #[test]
    fn test_root_for_matches_created_root() {
        let ws = TempDir::new().unwrap();
        let run = RunId::new();
        let root = Sandbox::root_for(ws.path(), &run, "build alpine");
        assert!(!root.exists());

        let sandbox = Sandbox::create(ws.path(), &run, "build alpine", None).unwrap();
        assert_eq!(sandbox.root(), root);
    }

    #[test]
    fn test_cleanup() {
        let ws = TempDir::new().unwrap();
        let sandbox = Sandbox::create(ws.path(), &RunId::new(), "a/b", None).unwrap();
        assert!(sandbox.root().ends_with("a_b"));
        sandbox.cleanup().unwrap();
        assert!(!sandbox.root().exists());
    }
}
