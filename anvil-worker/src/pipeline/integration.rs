//! Preflight integrations
//!
//! An integration turns an account's credentials into a short script run on
//! the backend before any user stage, e.g. writing ssh key files. Files go
//! to a per-build directory that the backend cleaner removes with the rest
//! of the build, never to the worker's own home directory.

use anvil_core::domain::{BuildDefinition, Stage};

use crate::backend::scripts::shell_quote;
use crate::repository::{Credential, CredentialKind};

/// Script an integration runs, plus the env it leaves for later stages
#[derive(Debug, Clone)]
pub struct Rendered {
    pub stage: Stage,
    /// `NAME=value` pairs added to the build's global env on success
    pub exports: Vec<String>,
}

/// Credential-driven setup step
pub trait Integration: Send + Sync {
    /// Human readable name, used in result messages
    fn name(&self) -> &str;

    /// Kind of credential this integration consumes
    fn kind(&self) -> CredentialKind;

    fn is_relevant(&self, definition: &BuildDefinition) -> bool;

    /// Builds the stage that applies the credentials on the backend
    ///
    /// # Arguments
    /// * `stage_name` - Name the rendered stage runs under
    /// * `dir` - Build-scoped directory the integration may write to
    /// * `credentials` - Every credential of [`Integration::kind`] for the account
    fn render(&self, stage_name: &str, dir: &str, credentials: &[Credential]) -> anyhow::Result<Rendered>;
}

/// Writes every ssh credential to `<dir>/<identifier>` and points git at a
/// matching ssh config
///
/// Key material travels as environment variables named after the identifier
/// and is never embedded in the script itself.
#[derive(Debug, Default)]
pub struct SshKeyIntegration;

impl Integration for SshKeyIntegration {
    fn name(&self) -> &str {
        "ssh keyfile integration"
    }

    fn kind(&self) -> CredentialKind {
        CredentialKind::Ssh
    }

    fn is_relevant(&self, _definition: &BuildDefinition) -> bool {
        true
    }

    fn render(&self, stage_name: &str, dir: &str, credentials: &[Credential]) -> anyhow::Result<Rendered> {
        let quoted_dir = shell_quote(dir);
        let mut script = vec![format!("mkdir -p {dir} && chmod 700 {dir}", dir = quoted_dir)];
        let mut env = Vec::with_capacity(credentials.len());
        let mut config = vec![
            "Host *".to_string(),
            "  StrictHostKeyChecking no".to_string(),
            "  UserKnownHostsFile /dev/null".to_string(),
        ];

        for cred in credentials {
            if !is_env_name(&cred.identifier) {
                anyhow::bail!(
                    "ssh credential identifier '{}' is not a valid file and variable name",
                    cred.identifier
                );
            }
            let key_file = shell_quote(&format!("{}/{}", dir, cred.identifier));
            env.push(format!("{}={}", cred.identifier, cred.secret));
            script.push(format!(
                "printf '%s\\n' \"${{{id}}}\" > {file} && chmod 600 {file}",
                id = cred.identifier,
                file = key_file
            ));
            config.push(format!("  IdentityFile {}/{}", dir, cred.identifier));
        }

        let config_file = format!("{}/config", dir);
        let lines: Vec<String> = config.iter().map(|l| shell_quote(l)).collect();
        script.push(format!(
            "printf '%s\\n' {} > {}",
            lines.join(" "),
            shell_quote(&config_file)
        ));

        let mut stage = Stage::new(stage_name, script);
        stage.env = env;
        Ok(Rendered {
            stage,
            exports: vec![format!("GIT_SSH_COMMAND=ssh -F {}", shell_quote(&config_file))],
        })
    }
}

fn is_env_name(s: &str) -> bool {
    let mut chars = s.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
