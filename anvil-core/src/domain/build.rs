//! Build task domain types

use serde::{Deserialize, Serialize};

use crate::trigger::{self, TriggerError};

/// Immutable description of one build
///
/// Created when a request is dequeued; read-only for the lifetime of the build.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildTask {
    /// Opaque build identifier (the commit revision), used as the lookup key everywhere
    pub build_id: String,
    /// Source location identifier, e.g. "account/repo"
    pub repo: String,
    /// URL the codebase is cloned from
    pub clone_url: String,
    /// Content revision checked out before stages run
    pub revision: String,
    pub branch: String,
    pub trigger: TriggerReason,
    pub definition: BuildDefinition,
    #[serde(default)]
    pub changeset: Changeset,
    #[serde(default)]
    pub pull_request: Option<PullRequest>,
}

impl BuildTask {
    /// Account portion of the source location ("account/repo" -> "account")
    pub fn account(&self) -> &str {
        self.repo.split('/').next().unwrap_or(&self.repo)
    }

    /// Changeset that stage triggers are evaluated against, on the task's branch
    pub fn changes(&self) -> Changeset {
        Changeset {
            branch: self.branch.clone(),
            ..self.changeset.clone()
        }
    }
}

/// Why a build was started
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerReason {
    Manual,
    PullRequest,
    Poll,
}

/// Parsed build definition
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BuildDefinition {
    /// Image used by the container backend
    #[serde(default)]
    pub image: Option<String>,
    /// `NAME=value` assignments visible to every command of the build
    #[serde(default)]
    pub env: Vec<String>,
    /// Optional binaries staged during preflight
    #[serde(default)]
    pub tools: Vec<String>,
    pub stages: Vec<Stage>,
}

/// One named unit of user script
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stage {
    pub name: String,
    pub script: Vec<String>,
    #[serde(default)]
    pub env: Vec<String>,
    #[serde(default)]
    pub trigger: Option<StageTrigger>,
}

impl Stage {
    /// Creates a stage with no env and no trigger
    pub fn new(name: impl Into<String>, script: Vec<String>) -> Self {
        Self {
            name: name.into(),
            script,
            env: Vec::new(),
            trigger: None,
        }
    }

    /// Evaluates the stage trigger against a changeset
    ///
    /// Stages without a trigger always run.
    pub fn should_run(&self, changes: &Changeset) -> Result<bool, TriggerError> {
        match &self.trigger {
            Some(trigger) => trigger.evaluate(changes),
            None => Ok(true),
        }
    }
}

/// Stage trigger predicate
///
/// `branches` is the legacy allow-list form. When `condition` is present it
/// entirely supersedes the allow-list.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StageTrigger {
    #[serde(default)]
    pub branches: Vec<String>,
    #[serde(default)]
    pub condition: Option<String>,
}

impl StageTrigger {
    pub fn evaluate(&self, changes: &Changeset) -> Result<bool, TriggerError> {
        if let Some(condition) = &self.condition {
            let directive = trigger::parse(condition)?;
            return Ok(directive.matches(changes));
        }

        if self.branches.is_empty() {
            return Ok(true);
        }

        Ok(self.branches.iter().any(|b| *b == changes.branch))
    }
}

/// What changed in the revision being built
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Changeset {
    #[serde(default)]
    pub branch: String,
    #[serde(default)]
    pub commit_texts: Vec<String>,
    #[serde(default)]
    pub files_changed: Vec<String>,
}

/// Pull request a build was triggered by
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullRequest {
    pub id: String,
    /// Endpoint the postflight comment is posted to
    pub comment_url: String,
    #[serde(default)]
    pub token: Option<String>,
}
