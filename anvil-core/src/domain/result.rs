//! Stage result and build summary domain types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::BuildTask;

/// Outcome status of one phase or stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum StageStatus {
    Pass,
    Fail,
    Skip,
}

impl StageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageStatus::Pass => "PASS",
            StageStatus::Fail => "FAIL",
            StageStatus::Skip => "SKIP",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PASS" => Some(StageStatus::Pass),
            "FAIL" => Some(StageStatus::Fail),
            "SKIP" => Some(StageStatus::Skip),
            _ => None,
        }
    }
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Untimed outcome of a phase, as reported by a backend or a preflight step
///
/// The pipeline stamps it with timing to produce a [`StageResult`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseResult {
    pub stage: String,
    pub status: StageStatus,
    pub error: Option<String>,
    pub messages: Vec<String>,
}

impl PhaseResult {
    pub fn pass(stage: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            status: StageStatus::Pass,
            error: None,
            messages: vec![message.into()],
        }
    }

    pub fn fail(
        stage: impl Into<String>,
        message: impl Into<String>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            stage: stage.into(),
            status: StageStatus::Fail,
            error: Some(error.into()),
            messages: vec![message.into()],
        }
    }

    pub fn skip(stage: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            status: StageStatus::Skip,
            error: None,
            messages: vec![message.into()],
        }
    }

    pub fn is_fail(&self) -> bool {
        self.status == StageStatus::Fail
    }
}

/// Persisted outcome of one phase or stage
///
/// Written exactly once and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageResult {
    pub build_id: String,
    pub stage: String,
    pub status: StageStatus,
    pub error: Option<String>,
    pub messages: Vec<String>,
    pub start_time: DateTime<Utc>,
    /// Duration in seconds
    pub duration: f64,
}

impl StageResult {
    /// Stamps a phase result with its start time, measuring duration until now
    pub fn from_phase(build_id: &str, phase: PhaseResult, start_time: DateTime<Utc>) -> Self {
        Self {
            build_id: build_id.to_string(),
            stage: phase.stage,
            status: phase.status,
            error: phase.error,
            messages: phase.messages,
            start_time,
            duration: elapsed_secs(start_time),
        }
    }
}

/// Summary record of a whole build
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildSummary {
    pub build_id: String,
    pub repo: String,
    pub branch: String,
    pub revision: String,
    pub queued_at: DateTime<Utc>,
    pub failed: bool,
    /// Total duration in seconds, set once when the build finishes
    pub duration: Option<f64>,
}

impl BuildSummary {
    /// Fresh summary for a build that was just dequeued
    pub fn queued(task: &BuildTask) -> Self {
        Self {
            build_id: task.build_id.clone(),
            repo: task.repo.clone(),
            branch: task.branch.clone(),
            revision: task.revision.clone(),
            queued_at: Utc::now(),
            failed: false,
            duration: None,
        }
    }
}

/// Seconds elapsed since `since`, clamped at zero
pub fn elapsed_secs(since: DateTime<Utc>) -> f64 {
    let elapsed = Utc::now().signed_duration_since(since);
    (elapsed.num_milliseconds().max(0) as f64) / 1000.0
}
