//! Preflight sub-phases
//!
//! ENV_SECRETS, BINARIES, INTEGRATIONS and CODEBASE run in that order. Their
//! messages are merged into a single `preflight` result, and the first
//! failing sub-phase ends the merge.

use anvil_core::domain::{BuildTask, PhaseResult, Stage, StageStatus};
use tracing::{debug, warn};

use super::Launcher;
use crate::backend::Backend;
use crate::backend::scripts;
use crate::repository::CredentialKind;

pub const PREFLIGHT: &str = "preflight";

const CHECK: &str = "\u{2713}";
const CROSS: &str = "\u{2717}";

fn substage(name: &str) -> String {
    format!("{} | {}", PREFLIGHT, name)
}

/// Accumulates sub-phase messages into the parent preflight result
struct Merged {
    result: PhaseResult,
}

impl Merged {
    fn new() -> Self {
        Self {
            result: PhaseResult {
                stage: PREFLIGHT.to_string(),
                status: StageStatus::Pass,
                error: None,
                messages: Vec::new(),
            },
        }
    }

    /// Folds one sub-phase in; returns `true` if the preflight must stop
    fn absorb(&mut self, sub: PhaseResult) -> bool {
        self.result.messages.extend(sub.messages);
        if sub.status == StageStatus::Fail {
            self.result.status = StageStatus::Fail;
            self.result.error = sub.error;
            return true;
        }
        false
    }
}

impl Launcher {
    /// Runs every preflight sub-phase against the backend
    pub(super) async fn preflight(&self, task: &BuildTask, backend: &mut dyn Backend) -> PhaseResult {
        let mut merged = Merged::new();

        if merged.absorb(self.env_secrets(task, backend).await) {
            return merged.result;
        }
        if merged.absorb(self.binaries(task, backend).await) {
            return merged.result;
        }
        if merged.absorb(self.integrations(task, backend).await) {
            return merged.result;
        }
        merged.absorb(self.codebase(task, backend).await);
        merged.result
    }

    async fn env_secrets(&self, task: &BuildTask, backend: &mut dyn Backend) -> PhaseResult {
        let stage = substage("env secrets");
        let account = task.account();

        match self.credentials.lookup(CredentialKind::Env, account).await {
            Ok(creds) => {
                let vars = creds
                    .into_iter()
                    .map(|c| format!("{}={}", c.identifier, c.secret))
                    .collect();
                backend.add_global_envs(vars);
                PhaseResult::pass(stage, format!("successfully set env secrets {}", CHECK))
            }
            Err(e) if e.is_absent() => {
                PhaseResult::pass(stage, format!("no env vars for {} {}", account, CHECK))
            }
            Err(e) => PhaseResult::fail(
                stage,
                format!("could not get env secrets {}", CROSS),
                e.to_string(),
            ),
        }
    }

    /// Downloads each tool the build definition asks for
    ///
    /// A tool that cannot be fetched is reported and skipped; it never fails
    /// the build.
    async fn binaries(&self, task: &BuildTask, backend: &mut dyn Backend) -> PhaseResult {
        let stage = substage("binaries");
        let mut messages = Vec::new();

        for tool in &task.definition.tools {
            let script = scripts::download_binary(
                &self.loopback_ip,
                self.service_port,
                tool,
                &self.workspace.bin_dir(),
            );
            let download = Stage::new(substage(tool), script);
            let result = backend.execute_integration(&download).await;

            if result.is_fail() {
                warn!(
                    build_id = %task.build_id,
                    tool = %tool,
                    error = ?result.error,
                    "Binary download failed, continuing without it"
                );
                messages.push(format!("could not download {}, continuing without it", tool));
            } else {
                messages.push(format!("downloaded {} {}", tool, CHECK));
            }
        }

        messages.push(format!("completed download binaries setup stage {}", CHECK));
        PhaseResult {
            stage,
            status: StageStatus::Pass,
            error: None,
            messages,
        }
    }

    async fn integrations(&self, task: &BuildTask, backend: &mut dyn Backend) -> PhaseResult {
        let stage = substage("integrations");
        let account = task.account();
        let mut messages = Vec::new();

        for integ in &self.integrations {
            if !integ.is_relevant(&task.definition) {
                debug!(integration = integ.name(), "Integration not relevant");
                continue;
            }

            let creds = match self.credentials.lookup(integ.kind(), account).await {
                Ok(creds) => creds,
                Err(e) if e.is_absent() => {
                    messages.push(format!(
                        "no integration data found for {} so assuming integration not necessary",
                        integ.name()
                    ));
                    continue;
                }
                Err(e) => {
                    messages.push(format!("integration failed for {} {}", integ.name(), CROSS));
                    return failed(stage, messages, e.to_string());
                }
            };

            let dir = self.workspace.secrets_dir(&task.build_id);
            let rendered = match integ.render(&substage(integ.name()), &dir, &creds) {
                Ok(rendered) => rendered,
                Err(e) => {
                    messages.push(format!("integration failed for {} {}", integ.name(), CROSS));
                    return failed(stage, messages, format!("{:#}", e));
                }
            };

            let result = backend.execute_integration(&rendered.stage).await;
            messages.extend(result.messages);
            if result.status == StageStatus::Fail {
                return failed(stage, messages, result.error.unwrap_or_default());
            }
            backend.add_global_envs(rendered.exports);
        }

        messages.push(format!("completed integration util setup stage {}", CHECK));
        PhaseResult {
            stage,
            status: StageStatus::Pass,
            error: None,
            messages,
        }
    }

    /// Clones the repository and checks out the build revision
    async fn codebase(&self, task: &BuildTask, backend: &mut dyn Backend) -> PhaseResult {
        let script = scripts::download_codebase(
            &task.clone_url,
            &task.revision,
            &self.workspace.clone_dir(&task.build_id),
        );
        let download = Stage::new(substage("codebase"), script);

        let mut result = backend.execute_integration(&download).await;
        result
            .messages
            .insert(0, "attempting to download codebase...".to_string());
        result
    }
}

fn failed(stage: String, messages: Vec<String>, error: String) -> PhaseResult {
    PhaseResult {
        stage,
        status: StageStatus::Fail,
        error: Some(error),
        messages,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_stops_at_first_failure() {
        let mut merged = Merged::new();
        assert!(!merged.absorb(PhaseResult::pass("a", "one")));
        assert!(merged.absorb(PhaseResult::fail("b", "two", "boom")));

        assert_eq!(merged.result.stage, PREFLIGHT);
        assert_eq!(merged.result.status, StageStatus::Fail);
        assert_eq!(merged.result.error.as_deref(), Some("boom"));
        assert_eq!(merged.result.messages, vec!["one", "two"]);
    }
}
