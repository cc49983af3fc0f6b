//! Build dispatcher
//!
//! Drains the build queue and runs each build on its own task, bounded by
//! a semaphore. The spawned task is the fault boundary: a panic inside a
//! build runs full interrupt recovery and then ends the process.

use anvil_core::domain::BuildTask;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, mpsc};
use tokio::task::{JoinError, JoinHandle};
use tracing::{error, info, warn};

use super::fault;
use crate::pipeline::Launcher;
use crate::sync::lock;
use crate::valet::{Interrupt, Valet};

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("build queue is full")]
    Full,

    #[error("build queue is closed")]
    Closed,

    #[error("build {0} is already queued or running")]
    Duplicate(String),
}

/// Build ids accepted by the queue whose run has not finished yet
type Pending = Arc<Mutex<HashSet<String>>>;

/// Submission side of the build queue
#[derive(Clone)]
pub struct BuildQueue {
    tx: mpsc::Sender<BuildTask>,
    pending: Pending,
}

/// Receiving side of the build queue, drained by a [`Dispatcher`]
pub struct QueueReceiver {
    rx: mpsc::Receiver<BuildTask>,
    pending: Pending,
}

impl QueueReceiver {
    pub async fn recv(&mut self) -> Option<BuildTask> {
        self.rx.recv().await
    }
}

impl BuildQueue {
    /// Creates the queue and the receiver a [`Dispatcher`] drains
    pub fn channel(capacity: usize) -> (Self, QueueReceiver) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let pending = Pending::default();
        (
            Self {
                tx,
                pending: Arc::clone(&pending),
            },
            QueueReceiver { rx, pending },
        )
    }

    /// Enqueues a build without waiting for room
    ///
    /// A build id is refused while an earlier submission of it is still
    /// queued or running.
    pub fn submit(&self, task: BuildTask) -> Result<(), QueueError> {
        let mut pending = lock(&self.pending);
        if pending.contains(&task.build_id) {
            return Err(QueueError::Duplicate(task.build_id));
        }

        let build_id = task.build_id.clone();
        self.tx.try_send(task).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => QueueError::Full,
            mpsc::error::TrySendError::Closed(_) => QueueError::Closed,
        })?;
        pending.insert(build_id);
        Ok(())
    }
}

pub struct Dispatcher {
    launcher: Arc<Launcher>,
    valet: Arc<Valet>,
    semaphore: Arc<Semaphore>,
    queue: QueueReceiver,
    exit_on_fault: bool,
}

impl Dispatcher {
    /// Creates a dispatcher draining `queue`
    ///
    /// # Arguments
    /// * `max_parallel` - Builds allowed to run at once
    /// * `queue` - Receiver from [`BuildQueue::channel`]
    pub fn new(
        launcher: Arc<Launcher>,
        valet: Arc<Valet>,
        max_parallel: usize,
        queue: QueueReceiver,
    ) -> Self {
        Self {
            launcher,
            valet,
            semaphore: Arc::new(Semaphore::new(max_parallel.max(1))),
            queue,
            exit_on_fault: true,
        }
    }

    /// Keeps the process alive after a build panics
    #[cfg(test)]
    fn without_exit(mut self) -> Self {
        self.exit_on_fault = false;
        self
    }

    /// Runs until every [`BuildQueue`] handle is dropped
    pub async fn run(mut self) {
        info!(
            "Dispatcher started ({} parallel builds)",
            self.semaphore.available_permits()
        );

        while let Some(task) = self.queue.recv().await {
            let permit = match Arc::clone(&self.semaphore).acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };
            self.spawn_build(task, permit);
        }

        info!("Build queue closed, dispatcher stopping");
    }

    fn spawn_build(&self, task: BuildTask, permit: OwnedSemaphorePermit) -> JoinHandle<()> {
        let launcher = Arc::clone(&self.launcher);
        let valet = Arc::clone(&self.valet);
        let pending = Arc::clone(&self.queue.pending);
        let exit_on_fault = self.exit_on_fault;

        tokio::spawn(async move {
            let build_id = task.build_id.clone();
            let worker = tokio::spawn(async move {
                // Permit is released when the build ends
                let _permit = permit;
                launcher.run_build(&task).await
            });

            let outcome = worker.await;
            lock(&pending).remove(&build_id);

            match outcome {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => error!(build_id = %build_id, "Build did not complete: {}", e),
                Err(e) if e.is_panic() => {
                    recover_from_fault(&valet, &build_id, e).await;
                    if exit_on_fault {
                        std::process::exit(1);
                    }
                }
                Err(e) => warn!(build_id = %build_id, "Build task was cancelled: {}", e),
            }
        })
    }
}

async fn recover_from_fault(valet: &Valet, build_id: &str, err: JoinError) {
    let payload = err.into_panic();
    let reason = format!(
        "build {} panicked: {}",
        build_id,
        fault::panic_message(payload.as_ref())
    );
    error!("{}", reason);

    let interrupt = Interrupt::Fault {
        reason,
        backtrace: fault::take_backtrace(),
    };
    let report = valet.handle_interrupt(&interrupt).await;
    if !report.errors.is_empty() {
        error!("Recovery after fault left {} error(s)", report.errors.len());
    }
}
