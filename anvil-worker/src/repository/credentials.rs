//! Credential store
//!
//! Secrets are looked up by kind and account. Absence of credentials is a
//! distinct error so the pipeline can downgrade it to a passing note.

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use thiserror::Error;

/// Kind of credential
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialKind {
    /// `NAME=value` pairs injected as build environment
    Env,
    /// Private key files written to `~/.ssh`
    Ssh,
}

impl fmt::Display for CredentialKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CredentialKind::Env => f.write_str("env"),
            CredentialKind::Ssh => f.write_str("ssh"),
        }
    }
}

/// One stored secret
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credential {
    pub account: String,
    pub kind: CredentialKind,
    /// Env var name, or key file name for ssh credentials
    pub identifier: String,
    pub secret: String,
}

#[derive(Debug, Error)]
pub enum CredentialError {
    /// Nothing is configured for the account
    #[error("no credentials for account {account}")]
    NoCreds {
        account: String,
        kind: CredentialKind,
    },

    #[error("credential store unavailable: {0}")]
    Unavailable(String),
}

impl CredentialError {
    pub fn is_absent(&self) -> bool {
        matches!(self, Self::NoCreds { .. })
    }
}

/// Repository trait for credential lookups
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Credentials of `kind` configured for `account`
    ///
    /// Returns [`CredentialError::NoCreds`] rather than an empty list.
    async fn lookup(
        &self,
        kind: CredentialKind,
        account: &str,
    ) -> Result<Vec<Credential>, CredentialError>;
}

/// In-memory implementation of CredentialStore
#[derive(Debug, Default)]
pub struct StaticCredentialStore {
    credentials: Vec<Credential>,
}

impl StaticCredentialStore {
    pub fn new(credentials: Vec<Credential>) -> Self {
        Self { credentials }
    }

    /// Loads credentials from a JSON array on disk
    pub async fn from_file(path: &Path) -> anyhow::Result<Self> {
        let raw = tokio::fs::read(path)
            .await
            .with_context(|| format!("Failed to read credentials file {}", path.display()))?;
        let credentials: Vec<Credential> =
            serde_json::from_slice(&raw).context("Failed to parse credentials file")?;
        Ok(Self::new(credentials))
    }
}

#[async_trait]
impl CredentialStore for StaticCredentialStore {
    async fn lookup(
        &self,
        kind: CredentialKind,
        account: &str,
    ) -> Result<Vec<Credential>, CredentialError> {
        let found: Vec<Credential> = self
            .credentials
            .iter()
            .filter(|c| c.kind == kind && c.account == account)
            .cloned()
            .collect();

        if found.is_empty() {
            return Err(CredentialError::NoCreds {
                account: account.to_string(),
                kind,
            });
        }
        Ok(found)
    }
}
