//! Reading the revision and branch of a local checkout.

use anyhow::{Context, Result, bail};
use std::path::Path;
use tokio::process::Command;

async fn rev_parse(dir: &Path, args: &[&str]) -> Result<String> {
    let output = Command::new("git")
        .arg("rev-parse")
        .args(args)
        .current_dir(dir)
        .output()
        .await
        .context("Failed to run git")?;

    if !output.status.success() {
        bail!(
            "git rev-parse {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// `git rev-parse HEAD`.
pub async fn head_revision(dir: &Path) -> Result<String> {
    rev_parse(dir, &["HEAD"]).await
}

/// `git rev-parse --abbrev-ref HEAD`. A detached HEAD is an error.
pub async fn current_branch(dir: &Path) -> Result<String> {
    let branch = rev_parse(dir, &["--abbrev-ref", "HEAD"]).await?;
    if branch == "HEAD" {
        bail!("HEAD is detached; pass --branch or --tag");
    }
    Ok(branch)
}
