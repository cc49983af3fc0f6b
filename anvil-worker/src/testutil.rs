//! Shared test doubles

use anvil_core::domain::{
    BuildDefinition, BuildSummary, BuildTask, Changeset, PhaseResult, Stage, TriggerReason,
};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::backend::{Backend, BackendError, BackendProvider, CANCELLED_ERROR, Cleaner};
use crate::config::BackendKind;
use crate::logmux::LogWriter;
use crate::sync::lock;

pub fn task(build_id: &str, stages: Vec<Stage>) -> BuildTask {
    BuildTask {
        build_id: build_id.to_string(),
        repo: "acme/widgets".to_string(),
        clone_url: "https://git.example.com/acme/widgets.git".to_string(),
        revision: build_id.to_string(),
        branch: "main".to_string(),
        trigger: TriggerReason::Manual,
        definition: BuildDefinition {
            stages,
            ..Default::default()
        },
        changeset: Changeset::default(),
        pull_request: None,
    }
}

pub fn summary(build_id: &str) -> BuildSummary {
    BuildSummary::queued(&task(build_id, Vec::new()))
}

/// Records every backend id it is asked to clean up
#[derive(Default)]
pub struct CountingCleaner {
    calls: Mutex<Vec<String>>,
    fail_next: AtomicBool,
}

impl CountingCleaner {
    pub fn calls(&self) -> Vec<String> {
        lock(&self.calls).clone()
    }

    /// Makes the next cleanup attempt fail after recording it
    pub fn fail_next(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl Cleaner for CountingCleaner {
    async fn cleanup(&self, backend_id: &str) -> Result<(), BackendError> {
        // Yield so concurrent callers actually overlap
        tokio::task::yield_now().await;
        lock(&self.calls).push(backend_id.to_string());
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(BackendError::Failed {
                program: "cleanup".to_string(),
                status: "exit status: 1".to_string(),
                stderr: format!("could not remove {}", backend_id),
            });
        }
        Ok(())
    }
}

/// How a [`FakeBackend`] behaves
#[derive(Debug, Clone, Default)]
pub struct FakeScript {
    pub fail_init: bool,
    pub fail_setup: Option<String>,
    /// Stages that exit non-zero
    pub fail_stages: Vec<String>,
    /// Stages that block until cancelled
    pub hang_stages: Vec<String>,
    /// Integration stage names that fail
    pub fail_integrations: Vec<String>,
    /// Stages that panic
    pub panic_stages: Vec<String>,
}

/// Calls observed across every backend a provider created
#[derive(Default)]
pub struct FakeCalls {
    executed: Mutex<Vec<String>>,
    integrations: Mutex<Vec<String>>,
    global_env: Mutex<Vec<String>>,
    closes: Mutex<usize>,
}

impl FakeCalls {
    pub fn executed(&self) -> Vec<String> {
        lock(&self.executed).clone()
    }

    pub fn integrations(&self) -> Vec<String> {
        lock(&self.integrations).clone()
    }

    pub fn global_env(&self) -> Vec<String> {
        lock(&self.global_env).clone()
    }

    pub fn closes(&self) -> usize {
        *lock(&self.closes)
    }
}

pub struct FakeBackend {
    build_id: String,
    log: LogWriter,
    cancel: CancellationToken,
    script: FakeScript,
    calls: Arc<FakeCalls>,
}

#[async_trait]
impl Backend for FakeBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Local
    }

    async fn init(&mut self, _build_id: &str) -> PhaseResult {
        if self.script.fail_init {
            return PhaseResult::fail("init", "backend not ready", "fake init failure");
        }
        PhaseResult::pass("init", "fake backend ready")
    }

    async fn setup(&mut self, _task: &BuildTask, _service_port: u16) -> (PhaseResult, String) {
        let id = format!("backend-{}", self.build_id);
        let result = match &self.script.fail_setup {
            Some(err) => PhaseResult::fail("setup", "setup failed", err.clone()),
            None => PhaseResult::pass("setup", "fake backend set up"),
        };
        (result, id)
    }

    fn set_global_env(&mut self, vars: Vec<String>) {
        *lock(&self.calls.global_env) = vars;
    }

    fn add_global_envs(&mut self, vars: Vec<String>) {
        lock(&self.calls.global_env).extend(vars);
    }

    async fn execute(&mut self, stage: &Stage, _commit: &str) -> PhaseResult {
        lock(&self.calls.executed).push(stage.name.clone());
        self.log
            .write_line(format!("{} | running", stage.name.to_uppercase()));

        if self.script.panic_stages.contains(&stage.name) {
            panic!("fake backend fault in {}", stage.name);
        }
        if self.script.hang_stages.contains(&stage.name) {
            self.cancel.cancelled().await;
            return PhaseResult::fail(&stage.name, "stage cancelled", CANCELLED_ERROR);
        }
        if self.script.fail_stages.contains(&stage.name) {
            return PhaseResult::fail(&stage.name, "stage failed", "exit code 1");
        }
        PhaseResult::pass(&stage.name, format!("completed {} stage", stage.name))
    }

    async fn execute_integration(&mut self, stage: &Stage) -> PhaseResult {
        lock(&self.calls.integrations).push(stage.name.clone());
        if self.script.fail_integrations.contains(&stage.name) {
            return PhaseResult::fail(&stage.name, "integration failed", "exit code 1");
        }
        PhaseResult::pass(&stage.name, format!("completed {}", stage.name))
    }

    async fn close(&mut self) -> Result<(), BackendError> {
        *lock(&self.calls.closes) += 1;
        Ok(())
    }
}

pub struct FakeProvider {
    script: FakeScript,
    calls: Arc<FakeCalls>,
    cleaner: Arc<CountingCleaner>,
}

impl FakeProvider {
    pub fn new(script: FakeScript, cleaner: Arc<CountingCleaner>) -> Self {
        Self {
            script,
            calls: Arc::new(FakeCalls::default()),
            cleaner,
        }
    }

    pub fn calls(&self) -> Arc<FakeCalls> {
        Arc::clone(&self.calls)
    }
}

impl BackendProvider for FakeProvider {
    fn create(&self, build_id: &str, log: LogWriter, cancel: CancellationToken) -> Box<dyn Backend> {
        Box::new(FakeBackend {
            build_id: build_id.to_string(),
            log,
            cancel,
            script: self.script.clone(),
            calls: Arc::clone(&self.calls),
        })
    }

    fn cleaner(&self) -> Arc<dyn Cleaner> {
        self.cleaner.clone()
    }
}
