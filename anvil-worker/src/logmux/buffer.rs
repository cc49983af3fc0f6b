//! Per-build append-only log buffer

use std::sync::Mutex;
use thiserror::Error;
use tokio::sync::watch;

use crate::sync::lock;

/// How a sealed buffer ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SealReason {
    Completed,
    Cancelled,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("log buffer is sealed")]
pub struct Sealed;

#[derive(Default)]
struct Inner {
    lines: Vec<Vec<u8>>,
    sealed: Option<SealReason>,
}

/// Ordered byte lines of one build plus a terminal seal
///
/// Appends and the seal take the same lock, so a reader that observes the
/// seal has already seen every line that will ever exist.
pub struct LogBuffer {
    inner: Mutex<Inner>,
    /// Bumped on every append and on seal; pumps wait on it
    version: watch::Sender<u64>,
}

impl LogBuffer {
    pub fn new() -> Self {
        let (version, _) = watch::channel(0);
        Self {
            inner: Mutex::new(Inner::default()),
            version,
        }
    }

    /// Appends one line
    ///
    /// # Errors
    /// Returns [`Sealed`] once the buffer has been sealed.
    pub fn append(&self, line: Vec<u8>) -> Result<(), Sealed> {
        {
            let mut inner = lock(&self.inner);
            if inner.sealed.is_some() {
                return Err(Sealed);
            }
            inner.lines.push(line);
        }
        self.version.send_modify(|v| *v += 1);
        Ok(())
    }

    /// Seals the buffer; returns false if it was already sealed
    pub fn seal(&self, reason: SealReason) -> bool {
        {
            let mut inner = lock(&self.inner);
            if inner.sealed.is_some() {
                return false;
            }
            inner.sealed = Some(reason);
        }
        self.version.send_modify(|v| *v += 1);
        true
    }

    /// Lines from `offset` onwards, together with the seal state at read time
    pub fn read_from(&self, offset: usize) -> (Vec<Vec<u8>>, Option<SealReason>) {
        let inner = lock(&self.inner);
        let lines = inner.lines.get(offset..).map(<[_]>::to_vec).unwrap_or_default();
        (lines, inner.sealed)
    }

    pub fn len(&self) -> usize {
        lock(&self.inner).lines.len()
    }

    pub fn is_sealed(&self) -> bool {
        lock(&self.inner).sealed.is_some()
    }

    /// Whole buffer joined with newlines, as persisted to durable storage
    pub fn contents(&self) -> Vec<u8> {
        lock(&self.inner).lines.join(&b'\n')
    }

    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.version.subscribe()
    }
}

impl Default for LogBuffer {
    fn default() -> Self {
        Self::new()
    }
}
