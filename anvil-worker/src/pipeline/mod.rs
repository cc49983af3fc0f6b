//! Build pipeline
//!
//! Drives one build through its phases:
//!
//! ```text
//! INIT -> SETUP -> PREFLIGHT -> STAGES -> summary -> POSTFLIGHT
//! ```
//!
//! Every phase's result is persisted before the next one starts. A FAIL ends
//! the run; the summary is then written once and the backend is released on
//! every exit path once Setup has allocated it.

mod integration;
mod postflight;
mod preflight;

pub use integration::{Integration, SshKeyIntegration};
pub use postflight::{PostflightHook, PullRequestCommenter, WebhookNotifier};

use anvil_core::domain::{BuildSummary, BuildTask, PhaseResult, StageResult, elapsed_secs};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::backend::scripts::Workspace;
use crate::backend::{Backend, BackendProvider};
use crate::config::Config;
use crate::logmux::{LogMux, SealReason};
use crate::repository::{CredentialStore, ResultStore, StoreError};
use crate::valet::{ExecutionContext, RegistryError, Valet};

pub const INIT: &str = "init";
pub const SETUP: &str = "setup";

/// Message recorded for stages whose trigger does not match
pub const SKIP_MESSAGE: &str = "skipping because the current changeset does not meet the trigger conditions";

/// Failures that abort a pipeline instead of being recorded as a result
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("could not register build: {0}")]
    Registry(#[from] RegistryError),

    #[error("could not persist build state: {0}")]
    Store(#[from] StoreError),
}

/// Runs builds end to end
pub struct Launcher {
    service_port: u16,
    loopback_ip: String,
    workspace: Workspace,
    valet: Arc<Valet>,
    mux: Arc<LogMux>,
    results: Arc<dyn ResultStore>,
    credentials: Arc<dyn CredentialStore>,
    provider: Arc<dyn BackendProvider>,
    integrations: Vec<Arc<dyn Integration>>,
    hooks: Vec<Arc<dyn PostflightHook>>,
}

impl Launcher {
    pub fn new(
        config: &Config,
        valet: Arc<Valet>,
        mux: Arc<LogMux>,
        credentials: Arc<dyn CredentialStore>,
        provider: Arc<dyn BackendProvider>,
    ) -> Self {
        Self {
            service_port: config.service_port,
            loopback_ip: config.loopback_ip.clone(),
            workspace: Workspace::new(config.workspace_prefix.clone()),
            results: Arc::clone(valet.results()),
            valet,
            mux,
            credentials,
            provider,
            integrations: vec![Arc::new(SshKeyIntegration)],
            hooks: Vec::new(),
        }
    }

    pub fn with_hook(mut self, hook: Arc<dyn PostflightHook>) -> Self {
        self.hooks.push(hook);
        self
    }

    /// Runs one build to completion
    ///
    /// # Arguments
    /// * `task` - The dequeued build
    ///
    /// # Returns
    /// Whether the build failed. Phase and stage failures are recorded in the
    /// result store; only registration and persistence failures are errors.
    pub async fn run_build(&self, task: &BuildTask) -> Result<bool, PipelineError> {
        let build_id = task.build_id.as_str();
        let ctx = self.valet.register(build_id).await?;

        let log = self.mux.open(build_id);
        let mut backend = self.provider.create(build_id, log, ctx.token());
        info!(
            build_id,
            repo = %task.repo,
            branch = %task.branch,
            backend = ?backend.kind(),
            "Starting build"
        );
        let mut backend_id = None;

        let outcome = self.drive(&ctx, task, backend.as_mut(), &mut backend_id).await;
        self.release(&ctx, backend.as_mut(), backend_id.as_deref()).await;

        match &outcome {
            Ok(failed) => info!(build_id, failed, "Build finished"),
            Err(e) => error!(build_id, "Build aborted: {}", e),
        }
        outcome
    }

    async fn drive(
        &self,
        ctx: &ExecutionContext,
        task: &BuildTask,
        backend: &mut dyn Backend,
        backend_id: &mut Option<String>,
    ) -> Result<bool, PipelineError> {
        let build_id = task.build_id.as_str();
        let summary = BuildSummary::queued(task);
        let queued_at = summary.queued_at;
        self.results.start_summary(&summary).await?;

        let start = Utc::now();
        let init = backend.init(build_id).await;
        if self.record(ctx, init, start).await? {
            return self.conclude(ctx, task, true, queued_at).await;
        }

        self.valet.record_stage(build_id, SETUP).await?;
        let start = Utc::now();
        let (setup, id) = backend.setup(task, self.service_port).await;
        if !id.is_empty() {
            self.valet.record_backend(build_id, &id).await?;
            *backend_id = Some(id);
        }
        if self.record(ctx, setup, start).await? {
            return self.conclude(ctx, task, true, queued_at).await;
        }

        backend.set_global_env(task.definition.env.clone());

        self.valet.record_stage(build_id, preflight::PREFLIGHT).await?;
        let start = Utc::now();
        let preflight = self.preflight(task, backend).await;
        if self.record(ctx, preflight, start).await? {
            return self.conclude(ctx, task, true, queued_at).await;
        }

        let failed = self.run_stages(ctx, task, backend).await?;
        self.conclude(ctx, task, failed, queued_at).await
    }

    /// Runs user stages in order until one fails
    async fn run_stages(
        &self,
        ctx: &ExecutionContext,
        task: &BuildTask,
        backend: &mut dyn Backend,
    ) -> Result<bool, PipelineError> {
        let build_id = task.build_id.as_str();
        let changes = task.changes();

        for stage in &task.definition.stages {
            let start = Utc::now();
            match stage.should_run(&changes) {
                Ok(true) => {}
                Ok(false) => {
                    debug!(build_id, stage = %stage.name, "Skipping stage");
                    self.record(ctx, PhaseResult::skip(&stage.name, SKIP_MESSAGE), start)
                        .await?;
                    continue;
                }
                Err(e) => {
                    let invalid = PhaseResult::fail(
                        &stage.name,
                        format!("invalid trigger for {} stage", stage.name),
                        e.to_string(),
                    );
                    self.record(ctx, invalid, start).await?;
                    return Ok(true);
                }
            }

            self.valet.record_stage(build_id, &stage.name).await?;
            let start = Utc::now();
            let result = backend.execute(stage, build_id).await;
            if self.record(ctx, result, start).await? {
                return Ok(true);
            }
        }

        Ok(false)
    }

    /// Persists a phase result; returns `true` if it failed
    ///
    /// Once the build is interrupted nothing is persisted and the pipeline
    /// is told to stop, since recovery has already recorded the stage.
    async fn record(
        &self,
        ctx: &ExecutionContext,
        phase: PhaseResult,
        start: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let build_id = ctx.build_id();
        if ctx.is_interrupted() {
            debug!(build_id, stage = %phase.stage, "Build interrupted, result left to recovery");
            return Ok(true);
        }

        let failed = phase.is_fail();
        if failed {
            warn!(build_id, stage = %phase.stage, error = ?phase.error, "Phase failed");
        }
        self.results
            .add_stage_detail(&StageResult::from_phase(build_id, phase, start))
            .await?;
        Ok(failed)
    }

    /// Writes the summary once, then runs postflight hooks
    ///
    /// An interrupted build's summary belongs to recovery, so neither the
    /// summary nor the hooks are touched.
    async fn conclude(
        &self,
        ctx: &ExecutionContext,
        task: &BuildTask,
        failed: bool,
        queued_at: DateTime<Utc>,
    ) -> Result<bool, PipelineError> {
        let build_id = task.build_id.as_str();
        if ctx.is_interrupted() {
            debug!(build_id, "Build interrupted, summary left to recovery");
            return Ok(true);
        }

        self.results
            .update_summary(failed, elapsed_secs(queued_at), build_id)
            .await?;

        if !self.hooks.is_empty() {
            match self.results.retrieve_summary(build_id).await {
                Ok(summary) => self.postflight(task, &summary).await,
                Err(e) => warn!(build_id, "Skipping postflight, summary unavailable: {}", e),
            }
        }
        Ok(failed)
    }

    async fn postflight(&self, task: &BuildTask, summary: &BuildSummary) {
        for hook in &self.hooks {
            if let Err(e) = hook.run(task, summary).await {
                warn!(build_id = %task.build_id, hook = hook.name(), "Postflight hook failed: {:#}", e);
            }
        }
    }

    /// Releases everything the build holds, on every exit path
    async fn release(&self, ctx: &ExecutionContext, backend: &mut dyn Backend, backend_id: Option<&str>) {
        let build_id = ctx.build_id();

        if let Some(id) = backend_id {
            if let Err(e) = self.valet.teardown(ctx, id).await {
                warn!(build_id, backend_id = id, "Backend teardown failed: {}", e);
            }
        }
        if let Err(e) = backend.close().await {
            warn!(build_id, "Failed to close backend: {}", e);
        }

        let reason = if ctx.is_cancelled() {
            SealReason::Cancelled
        } else {
            SealReason::Completed
        };
        if let Err(e) = self.mux.finish(build_id, reason, self.results.as_ref()).await {
            error!(build_id, "Failed to store build output: {}", e);
        }

        if let Err(e) = self.valet.unregister(build_id).await {
            warn!(build_id, "Failed to unregister build: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::CANCELLED_ERROR;
    use crate::repository::{
        Credential, CredentialKind, InMemoryCoordinationStore, InMemoryResultStore,
        StaticCredentialStore,
    };
    use crate::testutil::{CountingCleaner, FakeProvider, FakeScript, task};
    use crate::valet::Interrupt;
    use anvil_core::domain::{Stage, StageStatus, StageTrigger};
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Hook that records the summary it saw, then fails
    #[derive(Default)]
    struct FailingHook {
        seen: Mutex<Vec<BuildSummary>>,
    }

    #[async_trait]
    impl PostflightHook for FailingHook {
        fn name(&self) -> &str {
            "failing"
        }

        async fn run(&self, _task: &BuildTask, summary: &BuildSummary) -> anyhow::Result<()> {
            self.seen.lock().unwrap().push(summary.clone());
            anyhow::bail!("notification endpoint unreachable")
        }
    }

    struct Harness {
        launcher: Arc<Launcher>,
        results: Arc<InMemoryResultStore>,
        provider: Arc<FakeProvider>,
        cleaner: Arc<CountingCleaner>,
        valet: Arc<Valet>,
        mux: Arc<LogMux>,
    }

    fn harness(script: FakeScript, credentials: Vec<Credential>) -> Harness {
        harness_with_hooks(script, credentials, Vec::new())
    }

    fn harness_with_hooks(
        script: FakeScript,
        credentials: Vec<Credential>,
        hooks: Vec<Arc<dyn PostflightHook>>,
    ) -> Harness {
        let results = Arc::new(InMemoryResultStore::new());
        let cleaner = Arc::new(CountingCleaner::default());
        let valet = Arc::new(Valet::new(
            "w1",
            Arc::new(InMemoryCoordinationStore::new()),
            results.clone(),
            cleaner.clone(),
        ));
        let mux = Arc::new(LogMux::new(Duration::from_millis(10)));
        let provider = Arc::new(FakeProvider::new(script, cleaner.clone()));
        let config = Config::default();

        let launcher = hooks.into_iter().fold(
            Launcher::new(
                &config,
                Arc::clone(&valet),
                Arc::clone(&mux),
                Arc::new(StaticCredentialStore::new(credentials)),
                provider.clone(),
            ),
            Launcher::with_hook,
        );

        Harness {
            launcher: Arc::new(launcher),
            results,
            provider,
            cleaner,
            valet,
            mux,
        }
    }

    fn stages(names: &[&str]) -> Vec<Stage> {
        names
            .iter()
            .map(|n| Stage::new(*n, vec![format!("echo {}", n)]))
            .collect()
    }

    async fn stage_names(results: &InMemoryResultStore, build_id: &str) -> Vec<(String, StageStatus)> {
        results
            .retrieve_stage_detail(build_id)
            .await
            .unwrap()
            .into_iter()
            .map(|r| (r.stage, r.status))
            .collect()
    }

    #[tokio::test]
    async fn test_successful_build_records_every_phase() {
        let h = harness(FakeScript::default(), Vec::new());
        let task = task("abc123", stages(&["build", "test"]));

        let failed = h.launcher.run_build(&task).await.unwrap();
        assert!(!failed);

        assert_eq!(
            stage_names(&h.results, "abc123").await,
            vec![
                ("init".to_string(), StageStatus::Pass),
                ("setup".to_string(), StageStatus::Pass),
                ("preflight".to_string(), StageStatus::Pass),
                ("build".to_string(), StageStatus::Pass),
                ("test".to_string(), StageStatus::Pass),
            ]
        );

        let summary = h.results.retrieve_summary("abc123").await.unwrap();
        assert!(!summary.failed);
        assert!(summary.duration.is_some());

        assert_eq!(h.cleaner.calls(), vec!["backend-abc123".to_string()]);
        assert_eq!(h.provider.calls().closes(), 1);
        assert!(!h.valet.is_active("abc123"));
        assert!(h.mux.get("abc123").is_none());
    }

    #[tokio::test]
    async fn test_untriggered_stage_is_skipped_without_backend_call() {
        let h = harness(FakeScript::default(), Vec::new());
        let mut task = task("abc123", stages(&["deploy"]));
        task.branch = "boogaloo".to_string();
        task.definition.stages[0].trigger = Some(StageTrigger {
            branches: ["apple", "banana", "quartz", "vibranium"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            condition: None,
        });

        assert!(!h.launcher.run_build(&task).await.unwrap());

        let details = h.results.retrieve_stage_detail("abc123").await.unwrap();
        let deploy = details.last().unwrap();
        assert_eq!(deploy.stage, "deploy");
        assert_eq!(deploy.status, StageStatus::Skip);
        assert!(deploy.messages[0].contains(SKIP_MESSAGE));
        assert!(h.provider.calls().executed().is_empty());
    }

    #[tokio::test]
    async fn test_setup_failure_stops_before_preflight() {
        let script = FakeScript {
            fail_setup: Some("could not create container".to_string()),
            ..Default::default()
        };
        let h = harness(script, Vec::new());
        let task = task("abc123", stages(&["build"]));

        assert!(h.launcher.run_build(&task).await.unwrap());

        let details = h.results.retrieve_stage_detail("abc123").await.unwrap();
        assert_eq!(details.len(), 2);
        assert_eq!(details[1].stage, "setup");
        assert_eq!(details[1].status, StageStatus::Fail);
        assert_eq!(details[1].error.as_deref(), Some("could not create container"));
        assert!(h.provider.calls().integrations().is_empty());
        assert!(h.provider.calls().executed().is_empty());
        assert!(h.results.retrieve_summary("abc123").await.unwrap().failed);

        // the handle was allocated, so teardown is still owed
        assert_eq!(h.cleaner.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_init_failure_owes_no_teardown() {
        let script = FakeScript {
            fail_init: true,
            ..Default::default()
        };
        let h = harness(script, Vec::new());
        let task = task("abc123", stages(&["build"]));

        assert!(h.launcher.run_build(&task).await.unwrap());
        assert_eq!(stage_names(&h.results, "abc123").await.len(), 1);
        assert!(h.cleaner.calls().is_empty());
    }

    #[tokio::test]
    async fn test_failed_stage_leaves_rest_unrecorded() {
        let script = FakeScript {
            fail_stages: vec!["test".to_string()],
            ..Default::default()
        };
        let h = harness(script, Vec::new());
        let task = task("abc123", stages(&["build", "test", "deploy"]));

        assert!(h.launcher.run_build(&task).await.unwrap());

        let names: Vec<String> = stage_names(&h.results, "abc123")
            .await
            .into_iter()
            .map(|(n, _)| n)
            .collect();
        assert_eq!(names, vec!["init", "setup", "preflight", "build", "test"]);
        assert_eq!(h.provider.calls().executed(), vec!["build", "test"]);
        assert!(h.results.retrieve_summary("abc123").await.unwrap().failed);
    }

    #[tokio::test]
    async fn test_missing_credentials_pass_with_note() {
        let h = harness(FakeScript::default(), Vec::new());
        let task = task("abc123", stages(&["build"]));

        assert!(!h.launcher.run_build(&task).await.unwrap());

        let details = h.results.retrieve_stage_detail("abc123").await.unwrap();
        let preflight = &details[2];
        assert_eq!(preflight.status, StageStatus::Pass);
        assert!(preflight.messages.iter().any(|m| m.starts_with("no env vars for acme")));
        assert!(preflight.messages.contains(
            &"no integration data found for ssh keyfile integration so assuming integration not necessary"
                .to_string()
        ));
    }

    #[tokio::test]
    async fn test_env_secrets_become_global_env() {
        let creds = vec![Credential {
            account: "acme".to_string(),
            kind: CredentialKind::Env,
            identifier: "API_TOKEN".to_string(),
            secret: "s3cret".to_string(),
        }];
        let h = harness(FakeScript::default(), creds);
        let mut task = task("abc123", stages(&["build"]));
        task.definition.env = vec!["CI=true".to_string()];

        h.launcher.run_build(&task).await.unwrap();

        let env = h.provider.calls().global_env();
        assert!(env.contains(&"CI=true".to_string()));
        assert!(env.contains(&"API_TOKEN=s3cret".to_string()));
    }

    #[tokio::test]
    async fn test_ssh_keys_are_scoped_to_the_build() {
        let creds = vec![Credential {
            account: "acme".to_string(),
            kind: CredentialKind::Ssh,
            identifier: "DEPLOY_KEY".to_string(),
            secret: "key".to_string(),
        }];
        let h = harness(FakeScript::default(), creds);
        let task = task("abc123", stages(&["build"]));

        assert!(!h.launcher.run_build(&task).await.unwrap());

        assert!(
            h.provider
                .calls()
                .integrations()
                .contains(&"preflight | ssh keyfile integration".to_string())
        );
        let secrets = Workspace::new(Config::default().workspace_prefix).secrets_dir("abc123");
        assert!(
            h.provider
                .calls()
                .global_env()
                .contains(&format!("GIT_SSH_COMMAND=ssh -F {}/config", secrets))
        );
    }

    #[tokio::test]
    async fn test_binary_failure_is_downgraded() {
        let script = FakeScript {
            fail_integrations: vec!["preflight | kubectl".to_string()],
            ..Default::default()
        };
        let h = harness(script, Vec::new());
        let mut task = task("abc123", stages(&["build"]));
        task.definition.tools = vec!["kubectl".to_string()];

        assert!(!h.launcher.run_build(&task).await.unwrap());

        let details = h.results.retrieve_stage_detail("abc123").await.unwrap();
        assert_eq!(details[2].status, StageStatus::Pass);
        assert!(
            details[2]
                .messages
                .contains(&"could not download kubectl, continuing without it".to_string())
        );
    }

    #[tokio::test]
    async fn test_codebase_failure_fails_preflight() {
        let script = FakeScript {
            fail_integrations: vec!["preflight | codebase".to_string()],
            ..Default::default()
        };
        let h = harness(script, Vec::new());
        let task = task("abc123", stages(&["build"]));

        assert!(h.launcher.run_build(&task).await.unwrap());

        let details = h.results.retrieve_stage_detail("abc123").await.unwrap();
        assert_eq!(details.len(), 3);
        assert_eq!(details[2].stage, "preflight");
        assert_eq!(details[2].status, StageStatus::Fail);
        assert!(h.provider.calls().executed().is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_build_is_rejected() {
        let script = FakeScript {
            hang_stages: vec!["build".to_string()],
            ..Default::default()
        };
        let h = harness(script, Vec::new());
        let task = task("abc123", stages(&["build"]));

        let running = {
            let launcher = Arc::clone(&h.launcher);
            let task = task.clone();
            tokio::spawn(async move { launcher.run_build(&task).await })
        };
        while h.provider.calls().executed().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let err = h.launcher.run_build(&task).await.unwrap_err();
        assert!(matches!(err, PipelineError::Registry(RegistryError::AlreadyRegistered(_))));

        h.valet.kill("abc123").unwrap();
        running.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_kill_racing_recovery_tears_down_once() {
        let script = FakeScript {
            hang_stages: vec!["build".to_string()],
            ..Default::default()
        };
        let h = harness(script, Vec::new());
        let task = task("abc123", stages(&["build"]));

        let running = {
            let launcher = Arc::clone(&h.launcher);
            let task = task.clone();
            tokio::spawn(async move { launcher.run_build(&task).await })
        };
        while h.provider.calls().executed().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        h.valet.kill("abc").unwrap();
        h.valet
            .handle_interrupt(&Interrupt::Signal("SIGTERM".to_string()))
            .await;

        assert!(running.await.unwrap().unwrap());
        assert_eq!(h.cleaner.calls(), vec!["backend-abc123".to_string()]);

        let details = h.results.retrieve_stage_detail("abc123").await.unwrap();
        let build: Vec<_> = details.iter().filter(|d| d.stage == "build").collect();
        assert_eq!(build.len(), 1);
        assert_eq!(
            build[0].error.as_deref(),
            Some("An interrupt of type SIGTERM occurred!")
        );
        let output = h.results.retrieve_output("abc123").await.unwrap();
        assert!(!output.content.is_empty());
        assert!(output.cancelled);
    }

    #[tokio::test]
    async fn test_interrupted_stage_is_recorded_once() {
        let script = FakeScript {
            hang_stages: vec!["build".to_string()],
            ..Default::default()
        };
        let h = harness(script, Vec::new());
        let task = task("abc123", stages(&["build", "test"]));

        let running = {
            let launcher = Arc::clone(&h.launcher);
            let task = task.clone();
            tokio::spawn(async move { launcher.run_build(&task).await })
        };
        while h.provider.calls().executed().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let report = h
            .valet
            .handle_interrupt(&Interrupt::Signal("SIGTERM".to_string()))
            .await;
        assert_eq!(report.builds, 1);
        assert!(running.await.unwrap().unwrap());

        let details = h.results.retrieve_stage_detail("abc123").await.unwrap();
        let names: Vec<&str> = details.iter().map(|d| d.stage.as_str()).collect();
        assert_eq!(names, vec!["init", "setup", "preflight", "build"]);
        assert_eq!(
            details[3].error.as_deref(),
            Some("An interrupt of type SIGTERM occurred!")
        );
        assert!(
            !details
                .iter()
                .any(|d| d.error.as_deref() == Some(CANCELLED_ERROR))
        );
        assert!(h.results.retrieve_summary("abc123").await.unwrap().failed);
        assert_eq!(h.cleaner.calls(), vec!["backend-abc123".to_string()]);
    }

    #[tokio::test]
    async fn test_rebuild_of_same_revision_tears_down_each_run() {
        let h = harness(FakeScript::default(), Vec::new());
        let task = task("abc123", stages(&["build"]));

        assert!(!h.launcher.run_build(&task).await.unwrap());
        assert!(!h.launcher.run_build(&task).await.unwrap());

        assert_eq!(
            h.cleaner.calls(),
            vec!["backend-abc123".to_string(), "backend-abc123".to_string()]
        );
        assert_eq!(h.provider.calls().closes(), 2);
    }

    #[tokio::test]
    async fn test_failing_postflight_keeps_build_outcome() {
        let hook = Arc::new(FailingHook::default());
        let h = harness_with_hooks(
            FakeScript::default(),
            Vec::new(),
            vec![hook.clone() as Arc<dyn PostflightHook>],
        );
        let task = task("abc123", stages(&["build"]));

        assert!(!h.launcher.run_build(&task).await.unwrap());

        let summary = h.results.retrieve_summary("abc123").await.unwrap();
        assert!(!summary.failed);
        assert!(summary.duration.is_some());

        // hooks see the summary that was already written
        let seen = hook.seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert!(seen[0].duration.is_some());
        assert!(!seen[0].failed);
    }
}
