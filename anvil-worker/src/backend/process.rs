//! Streaming subprocess execution
//!
//! Runs one command, drains stdout and stderr concurrently into the build's
//! log writer, and stops early when the build is cancelled.

use std::process::{ExitStatus, Stdio};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::logmux::LogWriter;

/// Error text a cancelled command reports
pub const CANCELLED_ERROR: &str = "build cancelled by user";

#[derive(Debug, Error)]
pub enum RunError {
    /// Transport failure: the command could not be started
    #[error("could not start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed waiting on {program}: {source}")]
    Wait {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// Command ran and exited non-zero
    #[error("exit code {}", exit_code(.0))]
    Exit(ExitStatus),

    #[error("build cancelled by user")]
    Cancelled,
}

fn exit_code(status: &ExitStatus) -> String {
    status
        .code()
        .map(|c| c.to_string())
        .unwrap_or_else(|| "unknown (terminated by signal)".to_string())
}

/// Runs `cmd` to completion, streaming its output with `label` on every line
///
/// The child runs in its own process group so cancellation can stop
/// everything it spawned.
pub async fn run_streaming(
    mut cmd: Command,
    label: &str,
    log: &LogWriter,
    cancel: &CancellationToken,
) -> Result<(), RunError> {
    let program = cmd.as_std().get_program().to_string_lossy().to_string();

    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    cmd.process_group(0);

    if cancel.is_cancelled() {
        return Err(RunError::Cancelled);
    }

    let mut child = cmd.spawn().map_err(|source| RunError::Spawn {
        program: program.clone(),
        source,
    })?;

    let mut drains: Vec<JoinHandle<()>> = Vec::with_capacity(2);
    if let Some(stdout) = child.stdout.take() {
        drains.push(tokio::spawn(drain(stdout, label.to_string(), log.clone())));
    }
    if let Some(stderr) = child.stderr.take() {
        drains.push(tokio::spawn(drain(stderr, label.to_string(), log.clone())));
    }

    let status = tokio::select! {
        status = child.wait() => status,
        _ = cancel.cancelled() => {
            debug!(build_id = log.build_id(), program = %program, "Cancelling running command");
            kill_group(child.id()).await;
            if let Err(e) = child.kill().await {
                warn!("Failed to kill {}: {}", program, e);
            }
            for drain in drains {
                drain.abort();
            }
            return Err(RunError::Cancelled);
        }
    };

    for drain in drains {
        if let Err(e) = drain.await {
            warn!("Output drain for {} ended abnormally: {}", program, e);
        }
    }

    let status = status.map_err(|source| RunError::Wait { program, source })?;
    if status.success() {
        Ok(())
    } else {
        Err(RunError::Exit(status))
    }
}

#[cfg(unix)]
async fn kill_group(pid: Option<u32>) {
    let Some(pid) = pid else { return };
    let result = Command::new("kill")
        .arg("-KILL")
        .arg("--")
        .arg(format!("-{}", pid))
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await;
    if let Err(e) = result {
        debug!("Could not signal process group {}: {}", pid, e);
    }
}

#[cfg(not(unix))]
async fn kill_group(_pid: Option<u32>) {}

/// Copies lines from one pipe into the log
///
/// A read error ends the drain with one sentinel line instead of an error.
async fn drain<R: AsyncRead + Unpin>(reader: R, label: String, log: LogWriter) {
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();

    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => return,
            Ok(_) => {
                while matches!(buf.last(), Some(b'\n' | b'\r')) {
                    buf.pop();
                }
                let mut line = Vec::with_capacity(label.len() + buf.len());
                line.extend_from_slice(label.as_bytes());
                line.extend_from_slice(&buf);
                log.write_line(line);
            }
            Err(e) => {
                let stage = label.trim_end_matches(" | ");
                log.write_line(format!(
                    "BY THE WAY SOMETHING WENT WRONG SCANNING {} OUTPUT: {}",
                    stage, e
                ));
                return;
            }
        }
    }
}
