//! Remote shell backend
//!
//! Commands run on a remote host through the system `ssh` client. Init opens
//! a master connection that every later command multiplexes over; Close
//! tears it down. The backend handle is the build's directory on the host.

use anvil_core::domain::{BuildTask, PhaseResult, Stage};
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::process::run_streaming;
use super::scripts::{
    Workspace, cd_and_run, download_bootstrap, join_commands, shell_quote, stage_label,
};
use super::{Backend, BackendError, BuildIo, Cleaner, command_env, stage_outcome};
use crate::config::{BackendKind, SshTarget};

pub struct SshBackend {
    io: BuildIo,
    target: SshTarget,
    workspace: Workspace,
    loopback_ip: String,
    global_env: Vec<String>,
    control_path: PathBuf,
    connected: bool,
}

impl SshBackend {
    pub fn new(io: BuildIo, target: SshTarget, workspace: Workspace, loopback_ip: String) -> Self {
        let control_path =
            std::env::temp_dir().join(format!("anvil-ssh-{}.sock", uuid::Uuid::new_v4().simple()));
        Self {
            io,
            target,
            workspace,
            loopback_ip,
            global_env: Vec::new(),
            control_path,
            connected: false,
        }
    }

    fn control_option(&self) -> String {
        format!("ControlPath={}", self.control_path.display())
    }

    async fn run(&self, stage: &str, cmds: Vec<String>, stage_env: &[String]) -> PhaseResult {
        let env = command_env(&self.global_env, stage_env);
        let mut cmd = Command::new("ssh");
        cmd.args(base_args(&self.target))
            .arg("-o")
            .arg(self.control_option())
            .arg(destination(&self.target))
            .arg("--")
            .arg(remote_command(&env, &cmds));

        let result = run_streaming(cmd, &stage_label(stage), &self.io.log, &self.io.cancel).await;
        stage_outcome(stage, result)
    }
}

/// Options shared by every ssh invocation
fn base_args(target: &SshTarget) -> Vec<String> {
    let mut args: Vec<String> = [
        "-o",
        "BatchMode=yes",
        "-o",
        "StrictHostKeyChecking=no",
        "-p",
    ]
    .into_iter()
    .map(String::from)
    .collect();
    args.push(target.port.to_string());

    if let Some(key) = &target.key_file {
        args.push("-i".to_string());
        args.push(key.display().to_string());
    }
    args
}

fn destination(target: &SshTarget) -> String {
    format!("{}@{}", target.user, target.host)
}

/// Remote command line: `env NAME=value ... /bin/sh -c '<cmds>'`
fn remote_command(env: &[(String, String)], cmds: &[String]) -> String {
    let mut parts = vec!["env".to_string()];
    for (name, value) in env {
        parts.push(shell_quote(&format!("{}={}", name, value)));
    }
    parts.push("/bin/sh".to_string());
    parts.push("-c".to_string());
    parts.push(shell_quote(&join_commands(cmds)));
    parts.join(" ")
}

#[async_trait]
impl Backend for SshBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Ssh
    }

    async fn init(&mut self, build_id: &str) -> PhaseResult {
        let dest = destination(&self.target);

        // -f backgrounds the master after auth; its pipes must not be captured
        let status = Command::new("ssh")
            .args(base_args(&self.target))
            .arg("-o")
            .arg(self.control_option())
            .args(["-o", "ControlPersist=yes", "-M", "-N", "-f"])
            .arg(&dest)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;

        match status {
            Ok(status) if status.success() => {
                self.connected = true;
                debug!(build_id, "Opened ssh connection to {}", dest);
                PhaseResult::pass("init", format!("connected to {}", dest))
            }
            Ok(status) => PhaseResult::fail(
                "init",
                format!("could not connect to {}", dest),
                format!("ssh exited with {}", status),
            ),
            Err(e) => PhaseResult::fail(
                "init",
                format!("could not connect to {}", dest),
                e.to_string(),
            ),
        }
    }

    async fn setup(&mut self, task: &BuildTask, service_port: u16) -> (PhaseResult, String) {
        let script = download_bootstrap(&self.loopback_ip, service_port, &self.workspace.anvil_dir());
        let result = self.run("setup", script, &[]).await;
        let backend_id = task.build_id.clone();

        if result.is_fail() {
            let error = result.error.unwrap_or_default();
            return (
                PhaseResult::fail("setup", "could not prepare remote workspace", error),
                backend_id,
            );
        }

        info!(build_id = %task.build_id, host = %self.target.host, "Remote workspace prepared");
        (
            PhaseResult::pass(
                "setup",
                format!("prepared workspace on {} \u{2713}", self.target.host),
            ),
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
        if !self.connected {
            return Ok(());
        }
        self.connected = false;

        let output = Command::new("ssh")
            .arg("-o")
            .arg(self.control_option())
            .args(["-O", "exit"])
            .arg(destination(&self.target))
            .output()
            .await
            .map_err(|source| BackendError::Command {
                program: "ssh".to_string(),
                source,
            })?;

        if !output.status.success() {
            return Err(BackendError::Failed {
                program: "ssh -O exit".to_string(),
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }
}

/// Removes a build's directory on the remote host
pub struct SshCleaner {
    target: SshTarget,
    workspace: Workspace,
}

impl SshCleaner {
    pub fn new(target: SshTarget, workspace: Workspace) -> Self {
        Self { target, workspace }
    }
}

#[async_trait]
impl Cleaner for SshCleaner {
    async fn cleanup(&self, backend_id: &str) -> Result<(), BackendError> {
        let dir = self.workspace.clone_dir(backend_id);
        let secrets = self.workspace.secrets_dir(backend_id);
        let output = Command::new("ssh")
            .args(base_args(&self.target))
            .arg(destination(&self.target))
            .arg("--")
            .arg(format!("rm -rf {} {}", shell_quote(&dir), shell_quote(&secrets)))
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|source| BackendError::Command {
                program: "ssh".to_string(),
                source,
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            warn!(backend_id, "Failed to remove remote directory {}: {}", dir, stderr);
            return Err(BackendError::Failed {
                program: "ssh rm".to_string(),
                status: output.status.to_string(),
                stderr,
            });
        }

        info!(backend_id, host = %self.target.host, "Removed remote build directory");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logmux::LogWriter;
    use tokio_util::sync::CancellationToken;

    fn target() -> SshTarget {
        SshTarget {
            host: "build-host".to_string(),
            port: 2222,
            user: "ci".to_string(),
            key_file: Some(PathBuf::from("/keys/id_ed25519")),
        }
    }

    #[test]
    fn test_base_args() {
        let args = base_args(&target());
        assert_eq!(
            args,
            vec![
                "-o",
                "BatchMode=yes",
                "-o",
                "StrictHostKeyChecking=no",
                "-p",
                "2222",
                "-i",
                "/keys/id_ed25519"
            ]
        );
        assert_eq!(destination(&target()), "ci@build-host");
    }

    #[test]
    fn test_remote_command_quotes_env_and_script() {
        let env = vec![("MSG".to_string(), "hello world".to_string())];
        let cmds = vec!["cd /tmp/anvil/b1".to_string(), "echo $MSG".to_string()];
        assert_eq!(
            remote_command(&env, &cmds),
            "env 'MSG=hello world' /bin/sh -c 'cd /tmp/anvil/b1 && echo $MSG'"
        );
    }

    #[tokio::test]
    async fn test_close_without_connection_is_noop() {
        let (log, _buffer) = LogWriter::detached("b1");
        let io = BuildIo {
            build_id: "b1".to_string(),
            log,
            cancel: CancellationToken::new(),
        };
        let mut backend = SshBackend::new(io, target(), Workspace::new("/tmp/anvil"), "10.0.0.5".to_string());
        assert!(backend.close().await.is_ok());
        assert!(backend.close().await.is_ok());
    }
}
