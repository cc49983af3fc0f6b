//! Log multiplexer
//!
//! One [`LogBuffer`] per in-flight build, written by that build's pipeline
//! through a [`LogWriter`] and drained by any number of pumps. When the build
//! finishes the buffer is sealed, flushed to the result store and evicted;
//! pumps that arrive later replay the stored output instead.

mod buffer;
mod pump;

pub use buffer::{LogBuffer, SealReason};
pub use pump::{LineSink, PumpError, SinkError, pump};

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, warn};

use crate::repository::{BuildOutput, ResultStore, StoreError};
use crate::sync::lock;

/// Write handle to one build's buffer
#[derive(Clone)]
pub struct LogWriter {
    build_id: String,
    buffer: Arc<LogBuffer>,
}

impl LogWriter {
    pub fn build_id(&self) -> &str {
        &self.build_id
    }

    /// Appends one line of output
    pub fn write_line(&self, line: impl Into<Vec<u8>>) {
        if self.buffer.append(line.into()).is_err() {
            warn!(build_id = %self.build_id, "Dropped output line written after seal");
        }
    }

    /// Writer backed by a detached buffer, for tests
    #[cfg(test)]
    pub fn detached(build_id: &str) -> (Self, Arc<LogBuffer>) {
        let buffer = Arc::new(LogBuffer::new());
        let writer = Self {
            build_id: build_id.to_string(),
            buffer: Arc::clone(&buffer),
        };
        (writer, buffer)
    }
}

/// Table of live build buffers
pub struct LogMux {
    buffers: Mutex<HashMap<String, Arc<LogBuffer>>>,
    poll_interval: Duration,
}

impl LogMux {
    pub fn new(poll_interval: Duration) -> Self {
        Self {
            buffers: Mutex::new(HashMap::new()),
            poll_interval,
        }
    }

    /// Creates the buffer for a build and returns its writer
    ///
    /// A sealed buffer left over from an earlier run of the same build is
    /// replaced.
    pub fn open(&self, build_id: &str) -> LogWriter {
        let buffer = Arc::new(LogBuffer::new());
        let previous = lock(&self.buffers).insert(build_id.to_string(), Arc::clone(&buffer));

        if let Some(previous) = previous {
            if !previous.is_sealed() {
                warn!(build_id, "Replaced an unsealed log buffer");
                previous.seal(SealReason::Cancelled);
            }
        }

        LogWriter {
            build_id: build_id.to_string(),
            buffer,
        }
    }

    /// Live buffer of a build, if it has not been evicted yet
    pub fn get(&self, build_id: &str) -> Option<Arc<LogBuffer>> {
        lock(&self.buffers).get(build_id).cloned()
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Seals a build's buffer, flushes it to durable storage, then evicts it
    ///
    /// The buffer is evicted even when the flush fails, so the error is
    /// returned for the caller to report.
    pub async fn finish(
        &self,
        build_id: &str,
        reason: SealReason,
        store: &dyn ResultStore,
    ) -> Result<(), StoreError> {
        let Some(buffer) = self.get(build_id) else {
            return Ok(());
        };

        buffer.seal(reason);
        let output = BuildOutput {
            content: buffer.contents(),
            cancelled: reason == SealReason::Cancelled,
        };
        let flushed = store.add_output(build_id, &output).await;

        {
            let mut buffers = lock(&self.buffers);
            if buffers
                .get(build_id)
                .is_some_and(|current| Arc::ptr_eq(current, &buffer))
            {
                buffers.remove(build_id);
            }
        }

        debug!(build_id, lines = buffer.len(), "Log buffer sealed and evicted");
        flushed
    }
}
