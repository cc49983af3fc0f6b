//! Trigger expression types and their evaluation

use regex::Regex;
use std::fmt;

use crate::domain::Changeset;

/// How values or condition groups are combined
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Logical {
    And,
    Or,
}

impl fmt::Display for Logical {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Logical::And => f.write_str("and"),
            Logical::Or => f.write_str("or"),
        }
    }
}

/// What a condition group is matched against
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConditionKind {
    Branch,
    Text,
    Filepath,
}

impl fmt::Display for ConditionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConditionKind::Branch => f.write_str("branch"),
            ConditionKind::Text => f.write_str("text"),
            ConditionKind::Filepath => f.write_str("filepath"),
        }
    }
}

/// One condition group
///
/// A group with a single value has no logical; it behaves like `Or`.
#[derive(Debug, Clone)]
pub enum Condition {
    /// Branch name must fully match the patterns
    Branch {
        patterns: Vec<Regex>,
        logical: Option<Logical>,
    },
    /// Values must appear in at least one commit message
    Text {
        values: Vec<String>,
        logical: Option<Logical>,
    },
    /// Values must appear in at least one changed file path
    Filepath {
        values: Vec<String>,
        logical: Option<Logical>,
    },
}

impl Condition {
    pub fn kind(&self) -> ConditionKind {
        match self {
            Condition::Branch { .. } => ConditionKind::Branch,
            Condition::Text { .. } => ConditionKind::Text,
            Condition::Filepath { .. } => ConditionKind::Filepath,
        }
    }

    pub fn matches(&self, changes: &Changeset) -> bool {
        match self {
            Condition::Branch { patterns, logical } => {
                combine(*logical, patterns.iter(), |re| re.is_match(&changes.branch))
            }
            Condition::Text { values, logical } => combine(*logical, values.iter(), |v| {
                contained_in(v, &changes.commit_texts)
            }),
            Condition::Filepath { values, logical } => combine(*logical, values.iter(), |v| {
                contained_in(v, &changes.files_changed)
            }),
        }
    }
}

/// A parsed trigger expression
#[derive(Debug, Clone)]
pub struct Directive {
    pub conditions: Vec<Condition>,
    pub logical: Option<Logical>,
}

impl Directive {
    pub fn matches(&self, changes: &Changeset) -> bool {
        combine(self.logical, self.conditions.iter(), |c| c.matches(changes))
    }
}

fn combine<T>(
    logical: Option<Logical>,
    mut items: impl Iterator<Item = T>,
    pred: impl FnMut(T) -> bool,
) -> bool {
    match logical {
        Some(Logical::And) => items.all(pred),
        Some(Logical::Or) | None => items.any(pred),
    }
}

fn contained_in(value: &str, haystack: &[String]) -> bool {
    haystack.iter().any(|entry| entry.contains(value))
}
