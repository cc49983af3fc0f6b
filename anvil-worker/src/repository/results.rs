//! Durable result store
//!
//! Stage results, build summaries and the full output of finished builds.

use anvil_core::domain::{BuildSummary, StageResult};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;

use super::StoreError;
use crate::sync::lock;

/// Complete output of a finished build
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildOutput {
    /// Newline-joined output lines
    pub content: Vec<u8>,
    /// Whether the build was cancelled before it could finish
    pub cancelled: bool,
}

/// Repository trait for build results
///
/// Each individual write is all-or-nothing.
#[async_trait]
pub trait ResultStore: Send + Sync {
    /// Creates (or resets) the summary record when a build is dequeued
    async fn start_summary(&self, summary: &BuildSummary) -> Result<(), StoreError>;

    /// Appends one stage result
    async fn add_stage_detail(&self, result: &StageResult) -> Result<(), StoreError>;

    /// Stage results of a build, in the order they were written
    async fn retrieve_stage_detail(&self, build_id: &str) -> Result<Vec<StageResult>, StoreError>;

    /// Marks the build finished
    ///
    /// # Arguments
    /// * `failed` - Whether any phase or stage failed
    /// * `duration` - Total build duration in seconds
    /// * `build_id` - The build to update
    async fn update_summary(
        &self,
        failed: bool,
        duration: f64,
        build_id: &str,
    ) -> Result<(), StoreError>;

    async fn retrieve_summary(&self, build_id: &str) -> Result<BuildSummary, StoreError>;

    /// Stores the complete output of a build
    async fn add_output(&self, build_id: &str, output: &BuildOutput) -> Result<(), StoreError>;

    async fn retrieve_output(&self, build_id: &str) -> Result<BuildOutput, StoreError>;
}

#[derive(Default)]
struct Tables {
    summaries: HashMap<String, BuildSummary>,
    stages: HashMap<String, Vec<StageResult>>,
    outputs: HashMap<String, BuildOutput>,
}

/// In-memory implementation of ResultStore
///
/// Used when no database is configured, and by tests.
#[derive(Default)]
pub struct InMemoryResultStore {
    tables: Mutex<Tables>,
}

impl InMemoryResultStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ResultStore for InMemoryResultStore {
    async fn start_summary(&self, summary: &BuildSummary) -> Result<(), StoreError> {
        let mut tables = lock(&self.tables);
        tables.stages.remove(&summary.build_id);
        tables.outputs.remove(&summary.build_id);
        tables
            .summaries
            .insert(summary.build_id.clone(), summary.clone());
        Ok(())
    }

    async fn add_stage_detail(&self, result: &StageResult) -> Result<(), StoreError> {
        lock(&self.tables)
            .stages
            .entry(result.build_id.clone())
            .or_default()
            .push(result.clone());
        Ok(())
    }

    async fn retrieve_stage_detail(&self, build_id: &str) -> Result<Vec<StageResult>, StoreError> {
        Ok(lock(&self.tables)
            .stages
            .get(build_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn update_summary(
        &self,
        failed: bool,
        duration: f64,
        build_id: &str,
    ) -> Result<(), StoreError> {
        let mut tables = lock(&self.tables);
        let summary = tables
            .summaries
            .get_mut(build_id)
            .ok_or_else(|| StoreError::NotFound(build_id.to_string()))?;
        summary.failed = failed;
        summary.duration = Some(duration);
        Ok(())
    }

    async fn retrieve_summary(&self, build_id: &str) -> Result<BuildSummary, StoreError> {
        lock(&self.tables)
            .summaries
            .get(build_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(build_id.to_string()))
    }

    async fn add_output(&self, build_id: &str, output: &BuildOutput) -> Result<(), StoreError> {
        lock(&self.tables)
            .outputs
            .insert(build_id.to_string(), output.clone());
        Ok(())
    }

    async fn retrieve_output(&self, build_id: &str) -> Result<BuildOutput, StoreError> {
        lock(&self.tables)
            .outputs
            .get(build_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(build_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anvil_core::domain::StageStatus;
    use chrono::Utc;

    fn summary(id: &str) -> BuildSummary {
        BuildSummary {
            build_id: id.to_string(),
            repo: "acct/repo".to_string(),
            branch: "master".to_string(),
            revision: id.to_string(),
            queued_at: Utc::now(),
            failed: false,
            duration: None,
        }
    }

    fn stage(id: &str, name: &str) -> StageResult {
        StageResult {
            build_id: id.to_string(),
            stage: name.to_string(),
            status: StageStatus::Pass,
            error: None,
            messages: vec![],
            start_time: Utc::now(),
            duration: 0.1,
        }
    }

    #[tokio::test]
    async fn test_stage_details_keep_write_order() {
        let store = InMemoryResultStore::new();
        store.start_summary(&summary("b1")).await.unwrap();
        for name in ["init", "setup", "preflight", "build"] {
            store.add_stage_detail(&stage("b1", name)).await.unwrap();
        }

        let stages: Vec<String> = store
            .retrieve_stage_detail("b1")
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.stage)
            .collect();
        assert_eq!(stages, vec!["init", "setup", "preflight", "build"]);
    }

    #[tokio::test]
    async fn test_update_missing_summary_is_not_found() {
        let store = InMemoryResultStore::new();
        let err = store.update_summary(true, 1.0, "nope").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_restart_resets_previous_run() {
        let store = InMemoryResultStore::new();
        store.start_summary(&summary("b1")).await.unwrap();
        store.add_stage_detail(&stage("b1", "init")).await.unwrap();
        let old = BuildOutput {
            content: b"old".to_vec(),
            cancelled: false,
        };
        store.add_output("b1", &old).await.unwrap();
        store.update_summary(true, 3.0, "b1").await.unwrap();

        store.start_summary(&summary("b1")).await.unwrap();
        assert!(store.retrieve_stage_detail("b1").await.unwrap().is_empty());
        assert!(store.retrieve_output("b1").await.is_err());
        assert!(!store.retrieve_summary("b1").await.unwrap().failed);
    }
}
