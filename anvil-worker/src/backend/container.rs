//! Container backend
//!
//! Each build gets a fresh container kept alive with `sleep infinity`;
//! every command is a `<runtime> exec` into it. The backend handle is the
//! container id.

use anvil_core::domain::{BuildTask, PhaseResult, Stage};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, error, info, warn};

use super::process::run_streaming;
use super::scripts::{Workspace, cd_and_run, download_bootstrap, shell_argv, stage_label};
use super::{Backend, BackendError, BuildIo, Cleaner, command_env, stage_outcome};
use crate::config::BackendKind;

pub struct ContainerBackend {
    io: BuildIo,
    runtime: String,
    default_image: String,
    workspace: Workspace,
    loopback_ip: String,
    global_env: Vec<String>,
    container_id: Option<String>,
}

impl ContainerBackend {
    pub fn new(
        io: BuildIo,
        runtime: String,
        default_image: String,
        workspace: Workspace,
        loopback_ip: String,
    ) -> Self {
        Self {
            io,
            runtime,
            default_image,
            workspace,
            loopback_ip,
            global_env: Vec::new(),
            container_id: None,
        }
    }

    /// Runs a command list inside the build container
    async fn exec(&self, stage: &str, cmds: Vec<String>, stage_env: &[String]) -> PhaseResult {
        let Some(container_id) = &self.container_id else {
            return PhaseResult::fail(
                stage,
                format!("failed to complete {} stage \u{2717}", stage),
                "no container has been set up for this build",
            );
        };

        let env = command_env(&self.global_env, stage_env);
        let mut cmd = Command::new(&self.runtime);
        cmd.args(exec_args(container_id, &env, &shell_argv(&cmds)));

        let result = run_streaming(cmd, &stage_label(stage), &self.io.log, &self.io.cancel).await;
        stage_outcome(stage, result)
    }
}

/// Arguments for `<runtime> run` that start an idle build container
fn run_args(name: &str, image: &str) -> Vec<String> {
    [
        "run",
        "-d",
        "--name",
        name,
        "--entrypoint",
        "/bin/sh",
        image,
        "-c",
        "sleep infinity",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

/// Arguments for `<runtime> exec` with env flags
fn exec_args(container_id: &str, env: &[(String, String)], argv: &[String]) -> Vec<String> {
    let mut args = vec!["exec".to_string()];
    for (name, value) in env {
        args.push("-e".to_string());
        args.push(format!("{}={}", name, value));
    }
    args.push(container_id.to_string());
    args.extend(argv.iter().cloned());
    args
}

/// Container name for a build: `anvil-<build prefix>-<random suffix>`
fn container_name(build_id: &str) -> String {
    let safe: String = build_id
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .take(12)
        .collect();
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("anvil-{}-{}", safe, &suffix[..8])
}

#[async_trait]
impl Backend for ContainerBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Container
    }

    async fn init(&mut self, build_id: &str) -> PhaseResult {
        debug!(build_id, runtime = %self.runtime, "Container backend ready");
        PhaseResult::pass("init", "container backend ready")
    }

    async fn setup(&mut self, task: &BuildTask, service_port: u16) -> (PhaseResult, String) {
        let label = stage_label("setup");
        let image = task
            .definition
            .image
            .clone()
            .unwrap_or_else(|| self.default_image.clone());

        self.io
            .log
            .write_line(format!("{}pulling image {}", label, image));
        let mut pull = Command::new(&self.runtime);
        pull.arg("pull").arg(&image);
        if let Err(e) = run_streaming(pull, &label, &self.io.log, &self.io.cancel).await {
            error!(build_id = %task.build_id, "Failed to pull image {}: {}", image, e);
            return (
                PhaseResult::fail("setup", format!("could not pull image {}", image), e.to_string()),
                String::new(),
            );
        }

        let name = container_name(&task.build_id);
        let created = Command::new(&self.runtime)
            .args(run_args(&name, &image))
            .output()
            .await;

        let output = match created {
            Ok(output) if output.status.success() => output,
            Ok(output) => {
                let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
                error!(build_id = %task.build_id, "Failed to start container: {}", stderr);
                return (
                    PhaseResult::fail("setup", "could not create container", stderr),
                    String::new(),
                );
            }
            Err(e) => {
                error!(build_id = %task.build_id, "Failed to execute {} run: {}", self.runtime, e);
                return (
                    PhaseResult::fail("setup", "could not create container", e.to_string()),
                    String::new(),
                );
            }
        };

        let container_id = String::from_utf8_lossy(&output.stdout).trim().to_string();
        info!(build_id = %task.build_id, container_id = %container_id, "Container {} started", name);
        self.container_id = Some(container_id.clone());
        self.io.log.write_line(format!(
            "{}created container {}",
            label,
            &container_id[..container_id.len().min(12)]
        ));

        let script = download_bootstrap(&self.loopback_ip, service_port, &self.workspace.anvil_dir());
        let bootstrap = self.exec("setup", script, &[]).await;
        if bootstrap.is_fail() {
            let error = bootstrap.error.unwrap_or_default();
            return (
                PhaseResult::fail("setup", "could not download bootstrap files", error),
                container_id,
            );
        }

        (
            PhaseResult::pass("setup", format!("created container from {} \u{2713}", image)),
            container_id,
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
        self.exec(&stage.name, cmds, &stage.env).await
    }

    async fn execute_integration(&mut self, stage: &Stage) -> PhaseResult {
        self.exec(&stage.name, stage.script.clone(), &stage.env).await
    }

    async fn close(&mut self) -> Result<(), BackendError> {
        // The runtime CLI holds no connection between commands
        Ok(())
    }
}

/// Force-removes build containers
pub struct ContainerCleaner {
    runtime: String,
}

impl ContainerCleaner {
    pub fn new(runtime: String) -> Self {
        Self { runtime }
    }
}

#[async_trait]
impl Cleaner for ContainerCleaner {
    async fn cleanup(&self, backend_id: &str) -> Result<(), BackendError> {
        info!(backend_id, "Removing container");

        let output = Command::new(&self.runtime)
            .arg("rm")
            .arg("-f")
            .arg(backend_id)
            .output()
            .await
            .map_err(|source| BackendError::Command {
                program: self.runtime.clone(),
                source,
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            warn!(backend_id, "Failed to remove container: {}", stderr);
            return Err(BackendError::Failed {
                program: format!("{} rm", self.runtime),
                status: output.status.to_string(),
                stderr,
            });
        }

        debug!(backend_id, "Container removed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logmux::LogWriter;
    use anvil_core::domain::StageStatus;
    use tokio_util::sync::CancellationToken;

    #[test]
    fn test_run_args_keep_container_idle() {
        let args = run_args("anvil-abc-1234", "alpine:3");
        assert_eq!(
            args,
            vec![
                "run", "-d", "--name", "anvil-abc-1234", "--entrypoint", "/bin/sh", "alpine:3",
                "-c", "sleep infinity"
            ]
        );
    }

    #[test]
    fn test_exec_args_carry_env() {
        let env = vec![("A".to_string(), "1".to_string())];
        let argv = shell_argv(&["make".to_string()]);
        assert_eq!(
            exec_args("cid", &env, &argv),
            vec!["exec", "-e", "A=1", "cid", "/bin/sh", "-c", "make"]
        );
    }

    #[test]
    fn test_container_name() {
        let name = container_name("3f2a/9b!c0ffee1234567890");
        assert!(name.starts_with("anvil-3f2a9bc0ffee-"));
        assert_eq!(name.len(), "anvil-3f2a9bc0ffee-".len() + 8);
    }

    #[tokio::test]
    async fn test_exec_without_setup_fails() {
        let (log, _buffer) = LogWriter::detached("b1");
        let io = BuildIo {
            build_id: "b1".to_string(),
            log,
            cancel: CancellationToken::new(),
        };
        let mut backend = ContainerBackend::new(
            io,
            "docker".to_string(),
            "alpine".to_string(),
            Workspace::new(""),
            "172.17.0.1".to_string(),
        );

        let stage = Stage::new("build", vec!["make".to_string()]);
        let result = backend.execute(&stage, "b1").await;
        assert_eq!(result.status, StageStatus::Fail);
        assert!(backend.close().await.is_ok());
        assert!(backend.close().await.is_ok());
    }

    #[tokio::test]
    async fn test_setup_with_missing_runtime_is_transport_failure() {
        let (log, _buffer) = LogWriter::detached("b1");
        let io = BuildIo {
            build_id: "b1".to_string(),
            log,
            cancel: CancellationToken::new(),
        };
        let mut backend = ContainerBackend::new(
            io,
            "/no/such/container-runtime".to_string(),
            "alpine".to_string(),
            Workspace::new(""),
            "172.17.0.1".to_string(),
        );
        let task: BuildTask = serde_json::from_value(serde_json::json!({
            "build_id": "b1",
            "repo": "acct/repo",
            "clone_url": "https://example.com/acct/repo.git",
            "revision": "b1",
            "branch": "master",
            "trigger": "manual",
            "definition": { "stages": [] }
        }))
        .unwrap();

        let (result, backend_id) = backend.setup(&task, 9091).await;
        assert_eq!(result.status, StageStatus::Fail);
        assert!(backend_id.is_empty());
    }
}
