//! Local subprocess backend
//!
//! Runs every command as a `/bin/sh` child of the worker process. There is
//! no standing connection; the backend handle is the build's directory
//! under the workspace prefix.

use anvil_core::domain::{BuildTask, PhaseResult, Stage};
use async_trait::async_trait;
use std::path::Path;
use tokio::process::Command;
use tracing::{debug, info};

use super::process::run_streaming;
use super::scripts::{Workspace, cd_and_run, download_bootstrap, shell_argv, stage_label};
use super::{Backend, BackendError, BuildIo, Cleaner, command_env, stage_outcome};
use crate::config::BackendKind;

pub struct LocalBackend {
    io: BuildIo,
    workspace: Workspace,
    loopback_ip: String,
    global_env: Vec<String>,
}

impl LocalBackend {
    pub fn new(io: BuildIo, workspace: Workspace, loopback_ip: String) -> Self {
        Self {
            io,
            workspace,
            loopback_ip,
            global_env: Vec::new(),
        }
    }

    async fn run(&self, stage: &str, cmds: Vec<String>, stage_env: &[String]) -> PhaseResult {
        let argv = shell_argv(&cmds);
        let mut cmd = Command::new(&argv[0]);
        cmd.args(&argv[1..])
            .envs(command_env(&self.global_env, stage_env));

        let result = run_streaming(cmd, &stage_label(stage), &self.io.log, &self.io.cancel).await;
        stage_outcome(stage, result)
    }
}

#[async_trait]
impl Backend for LocalBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Local
    }

    async fn init(&mut self, build_id: &str) -> PhaseResult {
        debug!(build_id, "Local backend ready");
        PhaseResult::pass("init", "local backend ready")
    }

    async fn setup(&mut self, task: &BuildTask, service_port: u16) -> (PhaseResult, String) {
        let anvil_dir = self.workspace.anvil_dir();
        self.io.log.write_line(format!(
            "{}preparing local workspace at {}",
            stage_label("setup"),
            anvil_dir
        ));

        let script = download_bootstrap(&self.loopback_ip, service_port, &anvil_dir);
        let result = self.run("setup", script, &[]).await;
        let backend_id = task.build_id.clone();

        if result.is_fail() {
            let error = result.error.unwrap_or_default();
            return (
                PhaseResult::fail("setup", "could not prepare local workspace", error),
                backend_id,
            );
        }

        info!(build_id = %task.build_id, "Local workspace prepared");
        (
            PhaseResult::pass("setup", "local workspace prepared \u{2713}"),
            backend_id,
        )
    }

    fn set_global_env(&mut self, vars: Vec<String>) {
        self.global_env = vars;
    }

    fn add_global_envs(&mut self, vars: Vec<String>) {
        self.global_env.extend(vars);
    }

    async fn execute(&mut self, stage: &Stage, commit: &str) -> PhaseResult {
        let cmds = cd_and_run(&self.workspace.clone_dir(commit), &stage.script);
        self.run(&stage.name, cmds, &stage.env).await
    }

    async fn execute_integration(&mut self, stage: &Stage) -> PhaseResult {
        self.run(&stage.name, stage.script.clone(), &stage.env).await
    }

    async fn close(&mut self) -> Result<(), BackendError> {
        Ok(())
    }
}

/// Removes a build's local checkout and credential files
pub struct LocalCleaner {
    workspace: Workspace,
}

impl LocalCleaner {
    pub fn new(workspace: Workspace) -> Self {
        Self { workspace }
    }
}

#[async_trait]
impl Cleaner for LocalCleaner {
    async fn cleanup(&self, backend_id: &str) -> Result<(), BackendError> {
        let dirs = [
            self.workspace.clone_dir(backend_id),
            self.workspace.secrets_dir(backend_id),
        ];
        for dir in dirs {
            if !Path::new(&dir).exists() {
                continue;
            }

            tokio::fs::remove_dir_all(&dir)
                .await
                .map_err(|source| BackendError::Command {
                    program: format!("remove {}", dir),
                    source,
                })?;
            info!(backend_id, "Removed local build directory {}", dir);
        }
        Ok(())
    }
}
