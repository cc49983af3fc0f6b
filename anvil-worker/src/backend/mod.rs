//! Execution backends
//!
//! A backend runs a build's command sets in one execution environment:
//! a fresh container, a remote shell over ssh, or a local subprocess. All
//! three implement the same [`Backend`] contract and report every failure,
//! including transport failures, as a FAIL [`PhaseResult`] rather than an
//! error.
//!
//! Backend handles outlive the backend value itself (a container keeps
//! running after a crash), so teardown goes through a separate [`Cleaner`]
//! keyed by the backend id that Setup returned.

mod container;
mod local;
mod process;
pub mod scripts;
mod ssh;

pub use container::{ContainerBackend, ContainerCleaner};
pub use local::{LocalBackend, LocalCleaner};
pub use process::{CANCELLED_ERROR, RunError};
pub use ssh::{SshBackend, SshCleaner};

use anvil_core::domain::{BuildTask, PhaseResult, Stage};
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::config::{BackendKind, Config, SshTarget};
use crate::logmux::LogWriter;
use scripts::{Workspace, parse_env};

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("could not run {program}: {source}")]
    Command {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} failed ({status}): {stderr}")]
    Failed {
        program: String,
        status: String,
        stderr: String,
    },
}

/// Contract shared by every execution backend
#[async_trait]
pub trait Backend: Send {
    fn kind(&self) -> BackendKind;

    /// Cheap readiness check
    async fn init(&mut self, build_id: &str) -> PhaseResult;

    /// Allocates the backend handle and unpacks the bootstrap payload
    ///
    /// # Arguments
    /// * `task` - The build being set up
    /// * `service_port` - Port of the bootstrap file server
    ///
    /// # Returns
    /// The phase result and the backend id used for teardown. The id is
    /// returned whenever a handle was allocated, even if a later step failed.
    async fn setup(&mut self, task: &BuildTask, service_port: u16) -> (PhaseResult, String);

    /// Replaces the environment visible to every later command
    fn set_global_env(&mut self, vars: Vec<String>);

    /// Adds to the environment visible to every later command
    fn add_global_envs(&mut self, vars: Vec<String>);

    /// Runs a stage's script inside the checkout for `commit`
    async fn execute(&mut self, stage: &Stage, commit: &str) -> PhaseResult;

    /// Runs a stage's script without changing directory first
    async fn execute_integration(&mut self, stage: &Stage) -> PhaseResult;

    /// Releases any standing connection; safe to call more than once
    async fn close(&mut self) -> Result<(), BackendError>;
}

/// Tears down a backend handle by id
#[async_trait]
pub trait Cleaner: Send + Sync {
    async fn cleanup(&self, backend_id: &str) -> Result<(), BackendError>;
}

/// Creates one backend per build
pub trait BackendProvider: Send + Sync {
    fn create(&self, build_id: &str, log: LogWriter, cancel: CancellationToken) -> Box<dyn Backend>;

    fn cleaner(&self) -> Arc<dyn Cleaner>;
}

/// Where builds of this node run
enum Target {
    Container { runtime: String, default_image: String },
    Ssh(SshTarget),
    Local,
}

/// Builds the backend selected by configuration
pub struct BackendFactory {
    target: Target,
    workspace: Workspace,
    loopback_ip: String,
}

impl BackendFactory {
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let target = match config.backend {
            BackendKind::Container => Target::Container {
                runtime: config.container_runtime.clone(),
                default_image: config.default_image.clone(),
            },
            BackendKind::Ssh => match &config.ssh {
                Some(ssh) => Target::Ssh(ssh.clone()),
                None => anyhow::bail!("ssh backend selected without an ssh target"),
            },
            BackendKind::Local => Target::Local,
        };

        Ok(Self {
            target,
            workspace: Workspace::new(config.workspace_prefix.clone()),
            loopback_ip: config.loopback_ip.clone(),
        })
    }
}

impl BackendProvider for BackendFactory {
    fn create(&self, build_id: &str, log: LogWriter, cancel: CancellationToken) -> Box<dyn Backend> {
        let io = BuildIo {
            build_id: build_id.to_string(),
            log,
            cancel,
        };
        let workspace = self.workspace.clone();
        let loopback_ip = self.loopback_ip.clone();

        match &self.target {
            Target::Container {
                runtime,
                default_image,
            } => Box::new(ContainerBackend::new(
                io,
                runtime.clone(),
                default_image.clone(),
                workspace,
                loopback_ip,
            )),
            Target::Ssh(ssh) => Box::new(SshBackend::new(io, ssh.clone(), workspace, loopback_ip)),
            Target::Local => Box::new(LocalBackend::new(io, workspace, loopback_ip)),
        }
    }

    fn cleaner(&self) -> Arc<dyn Cleaner> {
        match &self.target {
            Target::Container { runtime, .. } => Arc::new(ContainerCleaner::new(runtime.clone())),
            Target::Ssh(ssh) => Arc::new(SshCleaner::new(ssh.clone(), self.workspace.clone())),
            Target::Local => Arc::new(LocalCleaner::new(self.workspace.clone())),
        }
    }
}

/// Per-build handles every backend carries
pub struct BuildIo {
    pub build_id: String,
    pub log: LogWriter,
    pub cancel: CancellationToken,
}

/// Converts a command outcome into a stage result
pub(crate) fn stage_outcome(stage: &str, result: Result<(), RunError>) -> PhaseResult {
    match result {
        Ok(()) => PhaseResult::pass(stage, format!("completed {} stage \u{2713}", stage)),
        Err(e) => PhaseResult::fail(
            stage,
            format!("failed to complete {} stage \u{2717}", stage),
            e.to_string(),
        ),
    }
}

/// Global env followed by stage env; later assignments win
pub(crate) fn command_env(global: &[String], stage: &[String]) -> Vec<(String, String)> {
    let mut env = parse_env(global);
    env.extend(parse_env(stage));
    env
}
