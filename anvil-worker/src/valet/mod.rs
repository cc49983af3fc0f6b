//! Build registry
//!
//! The [`Valet`] tracks every in-flight build on this node. It owns each
//! build's [`ExecutionContext`], mirrors runtime state into the coordination
//! store so other nodes can find the build, routes kill requests and makes
//! sure every backend is torn down exactly once.

mod context;
pub mod keys;
mod recovery;

pub use context::ExecutionContext;
pub use recovery::Interrupt;

use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{debug, info};

use crate::backend::{BackendError, Cleaner};
use crate::repository::{CoordinationStore, ResultStore, StoreError};
use crate::sync::lock;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("build {0} is already running on this node")]
    AlreadyRegistered(String),

    #[error("no active build found for {0}, it may already be complete")]
    AlreadyComplete(String),

    #[error("build id {partial} matches more than one active build: {}", .matches.join(", "))]
    Ambiguous {
        partial: String,
        matches: Vec<String>,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub struct Valet {
    worker_id: String,
    coordination: Arc<dyn CoordinationStore>,
    results: Arc<dyn ResultStore>,
    cleaner: Arc<dyn Cleaner>,
    contexts: Mutex<HashMap<String, Arc<ExecutionContext>>>,
}

impl Valet {
    pub fn new(
        worker_id: impl Into<String>,
        coordination: Arc<dyn CoordinationStore>,
        results: Arc<dyn ResultStore>,
        cleaner: Arc<dyn Cleaner>,
    ) -> Self {
        Self {
            worker_id: worker_id.into(),
            coordination,
            results,
            cleaner,
            contexts: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn results(&self) -> &Arc<dyn ResultStore> {
        &self.results
    }

    /// Advertises this node in the coordination store
    pub async fn register_node(&self, location: &str) -> Result<(), StoreError> {
        self.coordination
            .put(&keys::worker_location(&self.worker_id), location.as_bytes())
            .await?;
        info!(worker_id = %self.worker_id, location, "Registered node");
        Ok(())
    }

    /// Removes this node and everything it owns from the coordination store
    pub async fn deregister_node(&self) -> Result<(), StoreError> {
        self.coordination
            .delete_prefix(&keys::worker_builds(&self.worker_id))
            .await?;
        self.coordination
            .delete_prefix(&keys::worker_prefix(&self.worker_id))
            .await?;
        info!(worker_id = %self.worker_id, "Deregistered node");
        Ok(())
    }

    /// Creates the execution context for a new build
    ///
    /// # Arguments
    /// * `build_id` - Identifier of the build about to start
    ///
    /// # Returns
    /// The context the pipeline runs under, or `AlreadyRegistered` if the
    /// same build is already active on this node
    pub async fn register(&self, build_id: &str) -> Result<Arc<ExecutionContext>, RegistryError> {
        let ctx = {
            let mut contexts = lock(&self.contexts);
            if contexts.contains_key(build_id) {
                return Err(RegistryError::AlreadyRegistered(build_id.to_string()));
            }
            let ctx = Arc::new(ExecutionContext::new(build_id.to_string()));
            contexts.insert(build_id.to_string(), Arc::clone(&ctx));
            ctx
        };

        if let Err(e) = self.publish_registration(build_id).await {
            lock(&self.contexts).remove(build_id);
            return Err(e.into());
        }

        debug!(build_id, "Registered build");
        Ok(ctx)
    }

    async fn publish_registration(&self, build_id: &str) -> Result<(), StoreError> {
        self.coordination
            .put(&keys::build_map(build_id), self.worker_id.as_bytes())
            .await?;
        self.record_stage(build_id, "init").await
    }

    /// Records the backend handle a build must be torn down with
    pub async fn record_backend(&self, build_id: &str, backend_id: &str) -> Result<(), StoreError> {
        let key = keys::build_field(&self.worker_id, build_id, keys::BACKEND_ID);
        self.coordination.put(&key, backend_id.as_bytes()).await
    }

    /// Records which stage a build is in and when it started
    pub async fn record_stage(&self, build_id: &str, stage: &str) -> Result<(), StoreError> {
        let stage_key = keys::build_field(&self.worker_id, build_id, keys::CURRENT_STAGE);
        let start_key = keys::build_field(&self.worker_id, build_id, keys::STAGE_START);
        self.coordination.put(&stage_key, stage.as_bytes()).await?;
        self.coordination
            .put(&start_key, Utc::now().to_rfc3339().as_bytes())
            .await
    }

    /// Tears down the backend of one build run
    ///
    /// Concurrent callers for the same run wait for each other, and only a
    /// successful cleanup marks the run as torn down, so a failed attempt
    /// can be retried.
    ///
    /// # Returns
    /// `true` if this call performed the teardown, `false` if it had
    /// already been done for this run
    pub async fn teardown(
        &self,
        ctx: &ExecutionContext,
        backend_id: &str,
    ) -> Result<bool, BackendError> {
        if backend_id.is_empty() {
            return Ok(false);
        }

        let mut torn_down = ctx.teardown_guard().await;
        if *torn_down {
            return Ok(false);
        }

        self.cleaner.cleanup(backend_id).await?;
        *torn_down = true;
        info!(build_id = %ctx.build_id(), backend_id, "Tore down backend");
        Ok(true)
    }

    /// Removes a finished build and wakes anyone waiting for it
    pub async fn unregister(&self, build_id: &str) -> Result<(), StoreError> {
        let ctx = lock(&self.contexts).remove(build_id);
        if let Some(ctx) = &ctx {
            ctx.signal_done();
        }

        self.coordination.delete(&keys::build_map(build_id)).await?;
        self.coordination
            .delete_prefix(&keys::build_prefix(&self.worker_id, build_id))
            .await?;
        debug!(build_id, "Unregistered build");
        Ok(())
    }

    /// Cancels an active build
    ///
    /// `partial` may be a full build id or a unique prefix of one. Nothing
    /// is changed when no active build matches.
    pub fn kill(&self, partial: &str) -> Result<Arc<ExecutionContext>, RegistryError> {
        let ctx = self.resolve(partial)?;
        ctx.cancel();
        info!(build_id = %ctx.build_id(), "Cancelled build");
        Ok(ctx)
    }

    /// Finds the context for a full id or a unique id prefix
    pub fn resolve(&self, partial: &str) -> Result<Arc<ExecutionContext>, RegistryError> {
        let contexts = lock(&self.contexts);
        if let Some(ctx) = contexts.get(partial) {
            return Ok(Arc::clone(ctx));
        }

        let mut matches: Vec<&Arc<ExecutionContext>> = if partial.is_empty() {
            Vec::new()
        } else {
            contexts
                .iter()
                .filter(|(id, _)| id.starts_with(partial))
                .map(|(_, ctx)| ctx)
                .collect()
        };

        match matches.len() {
            0 => Err(RegistryError::AlreadyComplete(partial.to_string())),
            1 => Ok(Arc::clone(matches.remove(0))),
            _ => {
                let mut ids: Vec<String> =
                    matches.iter().map(|c| c.build_id().to_string()).collect();
                ids.sort();
                Err(RegistryError::Ambiguous {
                    partial: partial.to_string(),
                    matches: ids,
                })
            }
        }
    }

    pub fn is_active(&self, build_id: &str) -> bool {
        lock(&self.contexts).contains_key(build_id)
    }

    /// Ids of every build currently registered, sorted
    pub fn active_builds(&self) -> Vec<String> {
        let mut ids: Vec<String> = lock(&self.contexts).keys().cloned().collect();
        ids.sort();
        ids
    }

    fn snapshot(&self) -> Vec<Arc<ExecutionContext>> {
        lock(&self.contexts).values().cloned().collect()
    }

    fn context(&self, build_id: &str) -> Option<Arc<ExecutionContext>> {
        lock(&self.contexts).get(build_id).cloned()
    }

    /// Interrupts every registered build; from here on recovery owns their
    /// results
    pub fn interrupt_all(&self) {
        for ctx in self.snapshot() {
            ctx.interrupt();
        }
    }

    /// Signals completion on every registered build
    pub fn call_done_for_everything(&self) {
        for ctx in self.snapshot() {
            ctx.signal_done();
        }
    }

    /// Waits for every registered build to signal completion
    pub async fn wait_all_done(&self) {
        for ctx in self.snapshot() {
            ctx.wait_done().await;
        }
    }
}
