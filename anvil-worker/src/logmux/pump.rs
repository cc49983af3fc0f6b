//! Log pumps
//!
//! A pump drains one build's output toward one viewer. It reads a live
//! buffer at its own offset until the buffer is sealed, or replays the stored
//! output of a build that has already been evicted.

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

use super::{LogBuffer, LogMux, SealReason};
use crate::repository::{ResultStore, StoreError};

/// Message sent to a viewer whose build was killed
pub const CANCELLED_MESSAGE: &str = "build cancelled";

/// Errors raised by a viewer transport
#[derive(Debug, Error)]
pub enum SinkError {
    /// The viewer went away
    #[error("consumer disconnected")]
    Disconnected,

    #[error("transport error: {0}")]
    Transport(String),
}

#[derive(Debug, Error)]
pub enum PumpError {
    /// The viewer disconnected before the stream finished
    #[error("cancelled by consumer")]
    CancelledByConsumer,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("could not retrieve persisted build output: {0}")]
    Storage(#[from] StoreError),
}

impl From<SinkError> for PumpError {
    fn from(err: SinkError) -> Self {
        match err {
            SinkError::Disconnected => PumpError::CancelledByConsumer,
            SinkError::Transport(msg) => PumpError::Transport(msg),
        }
    }
}

/// Viewer side of a log stream
///
/// Carries one output line per message, an error line, and a close signal.
#[async_trait]
pub trait LineSink: Send {
    async fn send_line(&mut self, line: &[u8]) -> Result<(), SinkError>;

    async fn send_error(&mut self, message: &str) -> Result<(), SinkError>;

    async fn close(&mut self) -> Result<(), SinkError>;
}

/// Streams a build's output into `sink`, then closes it
///
/// # Returns
/// The number of lines delivered.
///
/// # Errors
/// [`PumpError::CancelledByConsumer`] when the viewer disconnects. The
/// writer and every other pump are unaffected.
pub async fn pump(
    mux: &LogMux,
    store: &dyn ResultStore,
    build_id: &str,
    sink: &mut dyn LineSink,
) -> Result<usize, PumpError> {
    let delivered = match mux.get(build_id) {
        Some(buffer) => stream_buffer(buffer, mux, sink).await?,
        None => stream_storage(store, build_id, sink).await?,
    };

    sink.close().await?;
    debug!(build_id, delivered, "Log pump completed");
    Ok(delivered)
}

async fn stream_buffer(
    buffer: Arc<LogBuffer>,
    mux: &LogMux,
    sink: &mut dyn LineSink,
) -> Result<usize, PumpError> {
    let mut version = buffer.subscribe();
    let mut offset = 0;

    loop {
        version.borrow_and_update();
        let (lines, sealed) = buffer.read_from(offset);

        for line in &lines {
            sink.send_line(line).await?;
        }
        offset += lines.len();

        match sealed {
            Some(SealReason::Completed) => return Ok(offset),
            Some(SealReason::Cancelled) => {
                sink.send_error(CANCELLED_MESSAGE).await?;
                return Ok(offset);
            }
            None => {}
        }

        tokio::select! {
            _ = version.changed() => {}
            _ = tokio::time::sleep(mux.poll_interval()) => {}
        }
    }
}

async fn stream_storage(
    store: &dyn ResultStore,
    build_id: &str,
    sink: &mut dyn LineSink,
) -> Result<usize, PumpError> {
    let output = match store.retrieve_output(build_id).await {
        Ok(output) => output,
        Err(e) => {
            warn!(build_id, "Could not retrieve persisted output: {}", e);
            sink.send_error(&format!("could not retrieve persisted output for {}", build_id))
                .await?;
            return Err(e.into());
        }
    };

    let mut delivered = 0;
    if !output.content.is_empty() {
        for line in output.content.split(|b| *b == b'\n') {
            sink.send_line(line).await?;
            delivered += 1;
        }
    }

    if output.cancelled {
        sink.send_error(CANCELLED_MESSAGE).await?;
    }
    Ok(delivered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::InMemoryResultStore;
    use std::time::Duration;

    #[derive(Default)]
    struct VecSink {
        lines: Vec<Vec<u8>>,
        errors: Vec<String>,
        closed: bool,
    }

    #[async_trait]
    impl LineSink for VecSink {
        async fn send_line(&mut self, line: &[u8]) -> Result<(), SinkError> {
            self.lines.push(line.to_vec());
            Ok(())
        }

        async fn send_error(&mut self, message: &str) -> Result<(), SinkError> {
            self.errors.push(message.to_string());
            Ok(())
        }

        async fn close(&mut self) -> Result<(), SinkError> {
            self.closed = true;
            Ok(())
        }
    }

    /// Disconnects after accepting `remaining` lines
    struct LeavingSink {
        remaining: usize,
    }

    #[async_trait]
    impl LineSink for LeavingSink {
        async fn send_line(&mut self, _line: &[u8]) -> Result<(), SinkError> {
            if self.remaining == 0 {
                return Err(SinkError::Disconnected);
            }
            self.remaining -= 1;
            Ok(())
        }

        async fn send_error(&mut self, _message: &str) -> Result<(), SinkError> {
            Err(SinkError::Disconnected)
        }

        async fn close(&mut self) -> Result<(), SinkError> {
            Ok(())
        }
    }

    fn expected(n: usize) -> Vec<Vec<u8>> {
        (0..n).map(|i| format!("line {}", i).into_bytes()).collect()
    }

    #[tokio::test]
    async fn test_pumps_before_during_and_after_seal_see_every_line() {
        const N: usize = 200;
        let mux = Arc::new(LogMux::new(Duration::from_millis(5)));
        let store = Arc::new(InMemoryResultStore::new());
        let writer = mux.open("b1");

        let spawn_pump = |mux: Arc<LogMux>, store: Arc<InMemoryResultStore>| {
            tokio::spawn(async move {
                let mut sink = VecSink::default();
                pump(&mux, store.as_ref(), "b1", &mut sink).await.unwrap();
                sink
            })
        };

        let early = spawn_pump(Arc::clone(&mux), Arc::clone(&store));

        let writer_task = tokio::spawn(async move {
            for i in 0..N {
                writer.write_line(format!("line {}", i));
                if i % 50 == 0 {
                    tokio::task::yield_now().await;
                }
            }
        });
        let during = spawn_pump(Arc::clone(&mux), Arc::clone(&store));

        writer_task.await.unwrap();
        mux.finish("b1", SealReason::Completed, store.as_ref())
            .await
            .unwrap();

        let late = spawn_pump(Arc::clone(&mux), Arc::clone(&store));

        for handle in [early, during, late] {
            let sink = handle.await.unwrap();
            assert_eq!(sink.lines, expected(N));
            assert!(sink.errors.is_empty());
            assert!(sink.closed);
        }
    }

    #[tokio::test]
    async fn test_disconnect_is_cancelled_by_consumer() {
        let mux = LogMux::new(Duration::from_millis(5));
        let store = InMemoryResultStore::new();
        let writer = mux.open("b1");
        for i in 0..10 {
            writer.write_line(format!("line {}", i));
        }

        let mut leaving = LeavingSink { remaining: 3 };
        let err = pump(&mux, &store, "b1", &mut leaving).await.unwrap_err();
        assert!(matches!(err, PumpError::CancelledByConsumer));

        // The writer and other pumps carry on
        writer.write_line("after disconnect");
        mux.finish("b1", SealReason::Completed, &store).await.unwrap();
        let mut sink = VecSink::default();
        assert_eq!(pump(&mux, &store, "b1", &mut sink).await.unwrap(), 11);
    }

    #[tokio::test]
    async fn test_cancelled_build_ends_with_cancel_message() {
        let mux = LogMux::new(Duration::from_millis(5));
        let store = InMemoryResultStore::new();
        let writer = mux.open("b1");
        writer.write_line("working");

        let buffer = mux.get("b1").unwrap();
        buffer.seal(SealReason::Cancelled);

        let mut sink = VecSink::default();
        pump(&mux, &store, "b1", &mut sink).await.unwrap();
        assert_eq!(sink.lines, vec![b"working".to_vec()]);
        assert_eq!(sink.errors, vec![CANCELLED_MESSAGE.to_string()]);
    }

    #[tokio::test]
    async fn test_cancelled_build_replayed_from_storage_ends_with_cancel_message() {
        let mux = LogMux::new(Duration::from_millis(5));
        let store = InMemoryResultStore::new();
        let writer = mux.open("b1");
        writer.write_line("working");
        mux.finish("b1", SealReason::Cancelled, &store).await.unwrap();
        assert!(mux.get("b1").is_none());

        let mut sink = VecSink::default();
        assert_eq!(pump(&mux, &store, "b1", &mut sink).await.unwrap(), 1);
        assert_eq!(sink.lines, vec![b"working".to_vec()]);
        assert_eq!(sink.errors, vec![CANCELLED_MESSAGE.to_string()]);
        assert!(sink.closed);
    }

    #[tokio::test]
    async fn test_missing_output_reports_error_line() {
        let mux = LogMux::new(Duration::from_millis(5));
        let store = InMemoryResultStore::new();

        let mut sink = VecSink::default();
        let err = pump(&mux, &store, "never-ran", &mut sink).await.unwrap_err();
        assert!(matches!(err, PumpError::Storage(_)));
        assert_eq!(sink.errors.len(), 1);
    }
}
