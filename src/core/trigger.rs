//! Trigger evaluation - decides whether a repository event starts a pipeline

use crate::core::config::{TriggerConfig, TriggersConfig};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Kind of repository event
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Push,
    PullRequest,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Push => "push",
            EventKind::PullRequest => "pull_request",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "push" => Ok(EventKind::Push),
            "pull_request" | "pull-request" => Ok(EventKind::PullRequest),
            other => Err(format!("Unknown event kind: {}", other)),
        }
    }
}

/// An incoming repository event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryEvent {
    pub kind: EventKind,
    /// `refs/heads/<branch>`, `refs/tags/<tag>`, or a bare branch name
    pub git_ref: String,
}

/// A ref split into its namespace
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefName<'a> {
    Branch(&'a str),
    Tag(&'a str),
}

impl RepositoryEvent {
    pub fn new(kind: EventKind, git_ref: impl Into<String>) -> Self {
        Self {
            kind,
            git_ref: git_ref.into(),
        }
    }

    pub fn ref_name(&self) -> RefName<'_> {
        if let Some(tag) = self.git_ref.strip_prefix("refs/tags/") {
            RefName::Tag(tag)
        } else if let Some(branch) = self.git_ref.strip_prefix("refs/heads/") {
            RefName::Branch(branch)
        } else {
            RefName::Branch(&self.git_ref)
        }
    }
}

/// Errors raised while compiling trigger patterns
#[derive(Debug, Error)]
pub enum PatternError {
    #[error("empty ref pattern")]
    Empty,

    #[error("invalid ref pattern '{pattern}': {reason}")]
    Invalid { pattern: String, reason: String },
}

/// A compiled branch/tag glob
///
/// `*` matches within one path segment, `**` across segments, `?` one
/// non-separator character, `[...]` a character class (`[!...]` negated).
#[derive(Debug, Clone)]
pub struct GlobPattern {
    source: String,
    regex: Regex,
}

impl GlobPattern {
    pub fn new(pattern: &str) -> Result<Self, PatternError> {
        if pattern.is_empty() {
            return Err(PatternError::Empty);
        }
        let translated = glob_to_regex(pattern)?;
        let regex = Regex::new(&translated).map_err(|e| PatternError::Invalid {
            pattern: pattern.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self {
            source: pattern.to_string(),
            regex,
        })
    }

    pub fn matches(&self, name: &str) -> bool {
        self.regex.is_match(name)
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }
}

fn glob_to_regex(pattern: &str) -> Result<String, PatternError> {
    let chars: Vec<char> = pattern.chars().collect();
    let mut out = String::from("^");
    let mut i = 0;

    while i < chars.len() {
        match chars[i] {
            '*' if chars.get(i + 1) == Some(&'*') => {
                out.push_str(".*");
                i += 2;
            }
            '*' => {
                out.push_str("[^/]*");
                i += 1;
            }
            '?' => {
                out.push_str("[^/]");
                i += 1;
            }
            '[' => {
                let mut j = i + 1;
                let mut class = String::from("[");
                if matches!(chars.get(j), Some('!') | Some('^')) {
                    class.push('^');
                    j += 1;
                }
                let body_start = j;
                while j < chars.len() && (chars[j] != ']' || j == body_start) {
                    // Keep regex set operators (`&&`, `--`, `~~`) literal
                    let doubled_dash = chars[j] == '-'
                        && (chars.get(j + 1) == Some(&'-') || (j > body_start && chars[j - 1] == '-'));
                    if matches!(chars[j], '\\' | '[' | '&' | '~') || doubled_dash {
                        class.push('\\');
                    }
                    class.push(chars[j]);
                    j += 1;
                }
                if j >= chars.len() {
                    return Err(PatternError::Invalid {
                        pattern: pattern.to_string(),
                        reason: "unclosed character class".to_string(),
                    });
                }
                class.push(']');
                out.push_str(&class);
                i = j + 1;
            }
            c => {
                out.push_str(&regex::escape(&c.to_string()));
                i += 1;
            }
        }
    }

    out.push('$');
    Ok(out)
}

/// Branch and tag filters for one event kind
#[derive(Debug, Clone, Default)]
pub struct TriggerRule {
    pub branches: Vec<GlobPattern>,
    pub tags: Vec<GlobPattern>,
}

impl TriggerRule {
    fn from_config(config: &TriggerConfig) -> Result<Self, PatternError> {
        Ok(Self {
            branches: config
                .branches
                .iter()
                .map(|p| GlobPattern::new(p))
                .collect::<Result<_, _>>()?,
            tags: config
                .tags
                .iter()
                .map(|p| GlobPattern::new(p))
                .collect::<Result<_, _>>()?,
        })
    }

    fn matches(&self, name: RefName<'_>) -> bool {
        if self.branches.is_empty() && self.tags.is_empty() {
            return true;
        }
        match name {
            RefName::Branch(branch) => self.branches.iter().any(|p| p.matches(branch)),
            RefName::Tag(tag) => self.tags.iter().any(|p| p.matches(tag)),
        }
    }
}

/// The trigger set of a pipeline
#[derive(Debug, Clone, Default)]
pub struct Triggers {
    rules: BTreeMap<EventKind, TriggerRule>,
}

impl Triggers {
    /// Compile trigger configuration; malformed patterns are rejected here
    pub fn from_config(config: &TriggersConfig) -> Result<Self, PatternError> {
        let rules = match config {
            TriggersConfig::Kinds(kinds) => kinds
                .iter()
                .map(|kind| (*kind, TriggerRule::default()))
                .collect(),
            TriggersConfig::Rules(rules) => rules
                .iter()
                .map(|(kind, rule)| -> Result<(EventKind, TriggerRule), PatternError> {
                    let rule = match rule {
                        Some(rule) => TriggerRule::from_config(rule)?,
                        None => TriggerRule::default(),
                    };
                    Ok((*kind, rule))
                })
                .collect::<Result<_, PatternError>>()?,
        };
        Ok(Self { rules })
    }

    /// Whether the event should start the pipeline
    pub fn matches(&self, event: &RepositoryEvent) -> bool {
        self.rules
            .get(&event.kind)
            .is_some_and(|rule| rule.matches(event.ref_name()))
    }

    /// Declared event kinds
    pub fn kinds(&self) -> Vec<EventKind> {
        self.rules.keys().copied().collect()
    }
}
