//! Interrupt and fault recovery
//!
//! Runs when the node is going down with builds still in flight, either
//! because of a termination signal or because a build worker panicked.

use anvil_core::domain::{StageResult, StageStatus, elapsed_secs};
use chrono::Utc;
use std::fmt;
use tracing::{debug, error, info, warn};

use super::Valet;
use super::keys::{self, BuildRuntime};
use crate::repository::StoreError;

/// Why the node is shutting down
#[derive(Debug, Clone)]
pub enum Interrupt {
    /// Process termination signal, e.g. `SIGTERM`
    Signal(String),
    /// Panic inside a build worker
    Fault { reason: String, backtrace: String },
}

impl Interrupt {
    pub fn kind(&self) -> &str {
        match self {
            Interrupt::Signal(name) => name,
            Interrupt::Fault { .. } => "panic",
        }
    }

    /// Message stored against every interrupted build
    pub fn diagnostic(&self) -> String {
        match self {
            Interrupt::Signal(name) => format!(
                "the worker received {} and shut down while this build was running",
                name
            ),
            Interrupt::Fault { reason, backtrace } => {
                format!("the worker crashed: {}\n{}", reason, backtrace)
            }
        }
    }
}

impl fmt::Display for Interrupt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "An interrupt of type {} occurred!", self.kind())
    }
}

/// Outcome of one recovery run
#[derive(Debug, Default)]
pub struct RecoveryReport {
    pub builds: usize,
    pub torn_down: usize,
    pub errors: Vec<String>,
}

impl RecoveryReport {
    fn record(&mut self, context: &str, err: impl fmt::Display) {
        error!("Recovery step '{}' failed: {}", context, err);
        self.errors.push(format!("{}: {}", context, err));
    }
}

impl Valet {
    /// Builds this node owns according to the coordination store
    pub async fn runtimes(&self) -> Result<Vec<BuildRuntime>, StoreError> {
        let entries = self
            .coordination
            .get_prefix(&keys::worker_builds(&self.worker_id))
            .await?;
        Ok(keys::parse_runtimes(&self.worker_id, entries))
    }

    /// Records the interrupt for every owned build, tears their backends
    /// down and removes the node from the coordination store
    ///
    /// Builds are flagged as interrupted before they are cancelled, so the
    /// interrupt record written here is the only result their current stage
    /// gets. Every step is attempted even if an earlier one failed; failures
    /// are collected in the report. Builds are signalled done at the end so
    /// that [`Valet::wait_all_done`] returns once recovery is over.
    pub async fn handle_interrupt(&self, interrupt: &Interrupt) -> RecoveryReport {
        let mut report = RecoveryReport::default();
        error!(worker_id = %self.worker_id, "{}", interrupt);

        self.interrupt_all();

        let runtimes = match self.runtimes().await {
            Ok(runtimes) => runtimes,
            Err(e) => {
                report.record("enumerate builds", e);
                Vec::new()
            }
        };
        report.builds = runtimes.len();

        for runtime in &runtimes {
            if let Err(e) = self.store_interrupt(runtime, interrupt).await {
                report.record(&format!("store interrupt for {}", runtime.build_id), e);
            }
        }

        for runtime in &runtimes {
            let Some(backend_id) = &runtime.backend_id else {
                continue;
            };
            let Some(ctx) = self.context(&runtime.build_id) else {
                // Unregistered builds were torn down by their own run
                debug!(build_id = %runtime.build_id, "Build already released");
                continue;
            };
            match self.teardown(&ctx, backend_id).await {
                Ok(true) => report.torn_down += 1,
                Ok(false) => {}
                Err(e) => report.record(&format!("teardown {}", backend_id), e),
            }
        }

        for runtime in &runtimes {
            if let Err(e) = self.coordination.delete(&keys::build_map(&runtime.build_id)).await {
                report.record(&format!("unmap {}", runtime.build_id), e);
            }
        }

        if let Err(e) = self.deregister_node().await {
            report.record("deregister node", e);
        }

        self.call_done_for_everything();

        info!(
            builds = report.builds,
            torn_down = report.torn_down,
            errors = report.errors.len(),
            "Interrupt recovery finished"
        );
        report
    }

    /// Appends a failed stage for the interrupt and marks the summary failed
    async fn store_interrupt(
        &self,
        runtime: &BuildRuntime,
        interrupt: &Interrupt,
    ) -> Result<(), StoreError> {
        let start_time = runtime.stage_start.unwrap_or_else(Utc::now);
        let result = StageResult {
            build_id: runtime.build_id.clone(),
            stage: runtime
                .current_stage
                .clone()
                .unwrap_or_else(|| "unknown".to_string()),
            status: StageStatus::Fail,
            error: Some(interrupt.to_string()),
            messages: vec![interrupt.diagnostic()],
            start_time,
            duration: elapsed_secs(start_time),
        };
        self.results.add_stage_detail(&result).await?;

        let duration = match self.results.retrieve_summary(&runtime.build_id).await {
            Ok(summary) => elapsed_secs(summary.queued_at),
            Err(e) if e.is_not_found() => {
                warn!(build_id = %runtime.build_id, "No summary to mark as interrupted");
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        self.results
            .update_summary(true, duration, &runtime.build_id)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::{
        CoordinationStore, InMemoryCoordinationStore, InMemoryResultStore, ResultStore,
    };
    use crate::testutil::{CountingCleaner, summary};
    use std::sync::Arc;

    struct Fixture {
        valet: Valet,
        coordination: Arc<InMemoryCoordinationStore>,
        results: Arc<InMemoryResultStore>,
        cleaner: Arc<CountingCleaner>,
    }

    fn fixture() -> Fixture {
        let coordination = Arc::new(InMemoryCoordinationStore::new());
        let results = Arc::new(InMemoryResultStore::new());
        let cleaner = Arc::new(CountingCleaner::default());
        let valet = Valet::new("w1", coordination.clone(), results.clone(), cleaner.clone());
        Fixture {
            valet,
            coordination,
            results,
            cleaner,
        }
    }

    #[tokio::test]
    async fn test_signal_recovery_marks_builds_failed() {
        let f = fixture();
        f.coordination
            .put(&keys::worker_location("w1"), b"10.0.0.1:9090")
            .await
            .unwrap();

        for id in ["a1", "b2"] {
            f.results.start_summary(&summary(id)).await.unwrap();
            f.valet.register(id).await.unwrap();
            f.valet.record_stage(id, "build").await.unwrap();
        }
        f.valet.record_backend("a1", "cid-a").await.unwrap();
        f.valet.record_backend("b2", "cid-b").await.unwrap();

        let report = f
            .valet
            .handle_interrupt(&Interrupt::Signal("SIGTERM".to_string()))
            .await;

        assert_eq!(report.builds, 2);
        assert_eq!(report.torn_down, 2);
        assert!(report.errors.is_empty());

        for id in ["a1", "b2"] {
            let stages = f.results.retrieve_stage_detail(id).await.unwrap();
            assert_eq!(stages.len(), 1);
            assert_eq!(stages[0].stage, "build");
            assert_eq!(stages[0].status, StageStatus::Fail);
            assert_eq!(
                stages[0].error.as_deref(),
                Some("An interrupt of type SIGTERM occurred!")
            );
            assert!(f.results.retrieve_summary(id).await.unwrap().failed);
        }

        let mut cleaned = f.cleaner.calls();
        cleaned.sort();
        assert_eq!(cleaned, vec!["cid-a".to_string(), "cid-b".to_string()]);
        assert!(f.coordination.get_prefix("anvil/").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_recovery_cancels_and_releases_builds() {
        let f = fixture();
        f.results.start_summary(&summary("a1")).await.unwrap();
        let ctx = f.valet.register("a1").await.unwrap();

        f.valet
            .handle_interrupt(&Interrupt::Fault {
                reason: "boom".to_string(),
                backtrace: String::new(),
            })
            .await;

        assert!(ctx.is_cancelled());
        assert!(ctx.is_interrupted());
        tokio::time::timeout(std::time::Duration::from_secs(1), f.valet.wait_all_done())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_recovery_skips_backend_already_torn_down() {
        let f = fixture();
        f.results.start_summary(&summary("a1")).await.unwrap();
        let ctx = f.valet.register("a1").await.unwrap();
        f.valet.record_backend("a1", "cid-a").await.unwrap();
        assert!(f.valet.teardown(&ctx, "cid-a").await.unwrap());

        let report = f
            .valet
            .handle_interrupt(&Interrupt::Signal("SIGINT".to_string()))
            .await;

        assert_eq!(report.torn_down, 0);
        assert_eq!(f.cleaner.calls().len(), 1);
    }

    #[test]
    fn test_fault_diagnostic_carries_backtrace() {
        let interrupt = Interrupt::Fault {
            reason: "index out of bounds".to_string(),
            backtrace: "frame 0".to_string(),
        };
        assert_eq!(interrupt.to_string(), "An interrupt of type panic occurred!");
        assert!(interrupt.diagnostic().contains("index out of bounds"));
        assert!(interrupt.diagnostic().contains("frame 0"));
    }
}
