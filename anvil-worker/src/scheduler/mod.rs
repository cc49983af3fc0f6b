//! Build scheduling
//!
//! Accepted builds wait on a bounded queue until the [`Dispatcher`] has a
//! free slot, then run on their own task.

mod dispatcher;
pub mod fault;

pub use dispatcher::{BuildQueue, Dispatcher, QueueError, QueueReceiver};
