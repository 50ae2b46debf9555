//! Trigger events: the branch or tag push a workflow runs for.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// The git ref a trigger event was raised for.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", content = "name", rename_all = "snake_case")]
pub enum GitRef {
    Branch(String),
    Tag(String),
}

impl GitRef {
    pub fn branch(name: impl Into<String>) -> Self {
        GitRef::Branch(name.into())
    }

    pub fn tag(name: impl Into<String>) -> Self {
        GitRef::Tag(name.into())
    }

    pub fn name(&self) -> &str {
        match self {
            GitRef::Branch(name) | GitRef::Tag(name) => name,
        }
    }

    pub fn is_tag(&self) -> bool {
        matches!(self, GitRef::Tag(_))
    }
}

impl fmt::Display for GitRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GitRef::Branch(name) => write!(f, "branch {name}"),
            GitRef::Tag(name) => write!(f, "tag {name}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct TriggerEvent {
    pub git_ref: GitRef,
    /// Commit SHA the event points at.
    pub revision: String,
    /// Extra variables exported to every job.
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
}

impl TriggerEvent {
    pub fn new(git_ref: GitRef, revision: impl Into<String>) -> Self {
        Self {
            git_ref,
            revision: revision.into(),
            environment: BTreeMap::new(),
        }
    }

    pub fn branch_push(branch: impl Into<String>, revision: impl Into<String>) -> Self {
        Self::new(GitRef::branch(branch), revision)
    }

    pub fn tag_push(tag: impl Into<String>, revision: impl Into<String>) -> Self {
        Self::new(GitRef::tag(tag), revision)
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.insert(key.into(), value.into());
        self
    }

    pub fn branch(&self) -> Option<&str> {
        match &self.git_ref {
            GitRef::Branch(name) => Some(name),
            GitRef::Tag(_) => None,
        }
    }

    pub fn tag(&self) -> Option<&str> {
        match &self.git_ref {
            GitRef::Tag(name) => Some(name),
            GitRef::Branch(_) => None,
        }
    }

    /// First 7 characters of the revision, for display.
    pub fn short_revision(&self) -> &str {
        let end = self
            .revision
            .char_indices()
            .nth(7)
            .map(|(i, _)| i)
            .unwrap_or(self.revision.len());
        &self.revision[..end]
    }
}
