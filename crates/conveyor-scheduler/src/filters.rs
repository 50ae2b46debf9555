//! Branch and tag filter predicates.

use conveyor_core::config::{FilterRule, Filters};
use conveyor_core::trigger::GitRef;
use regex::Regex;

/// A single filter pattern.
///
/// `/re/` is a regular expression that must match the whole ref name; any
/// other string matches only itself.
#[derive(Debug, Clone)]
pub enum Pattern {
    Exact(String),
    Regex(Regex),
}

impl Pattern {
    pub fn parse(raw: &str) -> Result<Self, regex::Error> {
        match raw
            .strip_prefix('/')
            .and_then(|rest| rest.strip_suffix('/'))
        {
            Some(inner) if raw.len() >= 2 => {
                Ok(Pattern::Regex(Regex::new(&format!("^(?:{inner})$"))?))
            }
            _ => Ok(Pattern::Exact(raw.to_string())),
        }
    }

    pub fn matches(&self, name: &str) -> bool {
        match self {
            Pattern::Exact(exact) => exact == name,
            Pattern::Regex(re) => re.is_match(name),
        }
    }
}

#[derive(Debug, Clone, Default)]
struct RuleMatcher {
    only: Vec<Pattern>,
    ignore: Vec<Pattern>,
}

impl RuleMatcher {
    fn compile(rule: &FilterRule) -> Result<Self, InvalidPattern> {
        let compile_all = |patterns: &[String]| {
            patterns
                .iter()
                .map(|raw| {
                    Pattern::parse(raw).map_err(|e| InvalidPattern {
                        pattern: raw.clone(),
                        reason: e.to_string(),
                    })
                })
                .collect::<Result<Vec<_>, _>>()
        };

        Ok(Self {
            only: compile_all(&rule.only)?,
            ignore: compile_all(&rule.ignore)?,
        })
    }

    fn matches(&self, name: &str) -> bool {
        let included = self.only.is_empty() || self.only.iter().any(|p| p.matches(name));
        included && !self.ignore.iter().any(|p| p.matches(name))
    }
}

/// A filter pattern that failed to compile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidPattern {
    pub pattern: String,
    pub reason: String,
}

/// Compiled filters deciding whether a job runs for a git ref.
///
/// Branch pushes run every job without a `branches` rule. Tag pushes run
/// only jobs that carry a `tags` rule.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    branches: Option<RuleMatcher>,
    tags: Option<RuleMatcher>,
}

impl JobFilter {
    pub fn compile(filters: Option<&Filters>) -> Result<Self, InvalidPattern> {
        let Some(filters) = filters else {
            return Ok(Self::default());
        };

        Ok(Self {
            branches: filters.branches.as_ref().map(RuleMatcher::compile).transpose()?,
            tags: filters.tags.as_ref().map(RuleMatcher::compile).transpose()?,
        })
    }

    pub fn matches(&self, git_ref: &GitRef) -> bool {
        match git_ref {
            GitRef::Branch(name) => self.branches.as_ref().is_none_or(|rule| rule.matches(name)),
            GitRef::Tag(name) => self.tags.as_ref().is_some_and(|rule| rule.matches(name)),
        }
    }

    /// Whether the job can run on any tag push at all.
    pub fn has_tag_rule(&self) -> bool {
        self.tags.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter(filters: Filters) -> JobFilter {
        JobFilter::compile(Some(&filters)).unwrap()
    }

    #[test]
    fn test_pattern_forms() {
        assert!(Pattern::parse("master").unwrap().matches("master"));
        assert!(!Pattern::parse("master").unwrap().matches("master-2"));

        let re = Pattern::parse("/^v.*/").unwrap();
        assert!(re.matches("v1.2.0"));
        assert!(!re.matches("release-v1"));

        // Regexes must match the whole name.
        let partial = Pattern::parse("/v1/").unwrap();
        assert!(partial.matches("v1"));
        assert!(!partial.matches("v1.0"));

        assert!(matches!(Pattern::parse("/").unwrap(), Pattern::Exact(_)));
        assert!(Pattern::parse("/[/").is_err());
    }

    #[test]
    fn test_no_filters() {
        let f = JobFilter::compile(None).unwrap();
        assert!(f.matches(&GitRef::branch("master")));
        assert!(f.matches(&GitRef::branch("feature/x")));
        assert!(!f.matches(&GitRef::tag("v1.0.0")));
        assert!(!f.has_tag_rule());
    }

    #[test]
    fn test_branch_only_and_ignore() {
        let f = filter(Filters::default().branches(FilterRule::only(["master", "/release-.*/"])));
        assert!(f.matches(&GitRef::branch("master")));
        assert!(f.matches(&GitRef::branch("release-1.0")));
        assert!(!f.matches(&GitRef::branch("feature")));

        let f = filter(Filters::default().branches(FilterRule::ignore(["/wip-.*/"])));
        assert!(f.matches(&GitRef::branch("master")));
        assert!(!f.matches(&GitRef::branch("wip-thing")));
    }

    #[test]
    fn test_hub_filter() {
        let f = filter(
            Filters::default()
                .branches(FilterRule::ignore(["/.*/"]))
                .tags(FilterRule::only(["/^v.*/"])),
        );
        assert!(!f.matches(&GitRef::branch("master")));
        assert!(!f.matches(&GitRef::branch("v1-branch")));
        assert!(f.matches(&GitRef::tag("v1.0.0")));
        assert!(!f.matches(&GitRef::tag("1.0.0")));
        assert!(f.has_tag_rule());
    }

    #[test]
    fn test_tags_rule_does_not_restrict_branches() {
        let f = filter(Filters::default().tags(FilterRule::only(["/.*/"])));
        assert!(f.matches(&GitRef::branch("anything")));
        assert!(f.matches(&GitRef::tag("anything")));
    }

    #[test]
    fn test_invalid_pattern_reported() {
        let err = JobFilter::compile(Some(
            &Filters::default().tags(FilterRule::only(["/(unclosed/"])),
        ))
        .unwrap_err();
        assert_eq!(err.pattern, "/(unclosed/");
    }
}
