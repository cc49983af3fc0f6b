//! Postflight hooks
//!
//! Run after the summary is written. Every hook is best-effort: failures are
//! logged by the launcher and never change the build outcome.

use anvil_core::domain::{BuildSummary, BuildTask, TriggerReason};
use anyhow::Context;
use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;

#[async_trait]
pub trait PostflightHook: Send + Sync {
    fn name(&self) -> &str;

    async fn run(&self, task: &BuildTask, summary: &BuildSummary) -> anyhow::Result<()>;
}

/// POSTs the finished build summary to a fixed URL
pub struct WebhookNotifier {
    client: Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            url: url.into(),
        }
    }
}

#[async_trait]
impl PostflightHook for WebhookNotifier {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn run(&self, _task: &BuildTask, summary: &BuildSummary) -> anyhow::Result<()> {
        self.client
            .post(&self.url)
            .json(summary)
            .send()
            .await
            .context("Failed to reach webhook")?
            .error_for_status()
            .context("Webhook rejected build summary")?;
        Ok(())
    }
}

#[derive(Debug, Serialize)]
struct Comment {
    body: String,
}

/// Comments the build result on the pull request that triggered it
#[derive(Default)]
pub struct PullRequestCommenter {
    client: Client,
}

impl PullRequestCommenter {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Comment text for a finished build
pub fn comment_body(summary: &BuildSummary) -> String {
    let verdict = if summary.failed { "FAILED" } else { "PASSED" };
    let duration = summary
        .duration
        .map(|d| format!(" in {:.1}s", d))
        .unwrap_or_default();
    format!(
        "Build {} of {} {} on branch {}{}",
        summary.build_id, summary.repo, verdict, summary.branch, duration
    )
}

#[async_trait]
impl PostflightHook for PullRequestCommenter {
    fn name(&self) -> &str {
        "pull request comment"
    }

    async fn run(&self, task: &BuildTask, summary: &BuildSummary) -> anyhow::Result<()> {
        if task.trigger != TriggerReason::PullRequest {
            return Ok(());
        }
        let Some(pr) = &task.pull_request else {
            anyhow::bail!("build was triggered by a pull request but carries no pull request data");
        };

        let mut request = self.client.post(&pr.comment_url).json(&Comment {
            body: comment_body(summary),
        });
        if let Some(token) = &pr.token {
            request = request.bearer_auth(token);
        }

        request
            .send()
            .await
            .context("Failed to reach pull request comment url")?
            .error_for_status()
            .with_context(|| format!("Comment rejected for pull request {}", pr.id))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{summary, task};

    #[test]
    fn test_comment_body() {
        let mut s = summary("abc123");
        s.failed = true;
        s.duration = Some(12.34);
        assert_eq!(
            comment_body(&s),
            "Build abc123 of acme/widgets FAILED on branch main in 12.3s"
        );
    }

    #[tokio::test]
    async fn test_commenter_ignores_other_triggers() {
        let task = task("abc123", Vec::new());
        let hook = PullRequestCommenter::new();
        assert!(hook.run(&task, &summary("abc123")).await.is_ok());
    }

    #[tokio::test]
    async fn test_commenter_requires_pull_request_data() {
        let mut task = task("abc123", Vec::new());
        task.trigger = TriggerReason::PullRequest;
        let hook = PullRequestCommenter::new();
        assert!(hook.run(&task, &summary("abc123")).await.is_err());
    }
}
