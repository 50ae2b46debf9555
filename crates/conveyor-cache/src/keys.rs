//! Cache key templates.
//!
//! Keys are written with `{{ ... }}` expressions that are rendered when the
//! step runs:
//!
//! | expression | value |
//! |---|---|
//! | `{{ .Revision }}` | commit SHA of the trigger |
//! | `{{ .Branch }}` | branch name, empty for tag pushes |
//! | `{{ .Tag }}` | tag name, empty for branch pushes |
//! | `{{ .Environment.NAME }}` | job environment variable, empty if unset |
//! | `{{ checksum "path" }}` | SHA-256 hex of a file |
//! | `{{ epoch }}` | current Unix time in seconds |
//! | `{{ arch }}` | host OS and architecture |

use crate::types::PathRoots;
use conveyor_core::trigger::TriggerEvent;
use conveyor_core::{Error, Result};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Values available to key templates.
pub struct KeyContext<'a> {
    pub trigger: &'a TriggerEvent,
    pub environment: &'a BTreeMap<String, String>,
    pub roots: &'a PathRoots,
}

/// Render a key template.
pub fn render_key(template: &str, ctx: &KeyContext<'_>) -> Result<String> {
    let mut rendered = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        rendered.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after
            .find("}}")
            .ok_or_else(|| Error::Template(format!("unclosed `{{{{` in `{template}`")))?;
        rendered.push_str(&render_expression(after[..end].trim(), ctx)?);
        rest = &after[end + 2..];
    }
    rendered.push_str(rest);

    Ok(rendered)
}

fn render_expression(expr: &str, ctx: &KeyContext<'_>) -> Result<String> {
    match expr {
        ".Revision" => return Ok(ctx.trigger.revision.clone()),
        ".Branch" => return Ok(ctx.trigger.branch().unwrap_or_default().to_string()),
        ".Tag" => return Ok(ctx.trigger.tag().unwrap_or_default().to_string()),
        "epoch" => return Ok(chrono::Utc::now().timestamp().to_string()),
        "arch" => {
            return Ok(format!(
                "{}-{}",
                std::env::consts::OS,
                std::env::consts::ARCH
            ));
        }
        _ => {}
    }

    if let Some(name) = expr.strip_prefix(".Environment.") {
        return Ok(ctx.environment.get(name).cloned().unwrap_or_default());
    }

    if let Some(path) = checksum_argument(expr) {
        return file_checksum(path, ctx.roots);
    }

    Err(Error::Template(format!("unknown expression `{expr}`")))
}

// `checksum "path"`
fn checksum_argument(expr: &str) -> Option<&str> {
    let arg = expr.strip_prefix("checksum")?;
    if !arg.starts_with(char::is_whitespace) {
        return None;
    }
    arg.trim()
        .strip_prefix('"')?
        .strip_suffix('"')
        .filter(|path| !path.is_empty() && !path.contains('"'))
}

fn file_checksum(path: &str, roots: &PathRoots) -> Result<String> {
    let disk = roots.expand(path);
    let contents = std::fs::read(&disk)
        .map_err(|e| Error::Template(format!("checksum of `{path}` failed: {e}")))?;
    Ok(hex::encode(Sha256::digest(&contents)))
}

/// Check if a key matches a prefix pattern.
pub fn matches_prefix(key: &str, prefix: &str) -> bool {
    key.starts_with(prefix)
}

/// Sanitize a key for use in filenames.
pub fn sanitize_key(key: &str) -> String {
    key.chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_whitespace() => '_',
            _ => c,
        })
        .collect()
}
