//! Core domain types
//!
//! These types describe one build end-to-end. They are produced when a build
//! request is dequeued, read by the pipeline while it runs, and persisted by
//! the result store.

pub mod build;
pub mod result;

pub use build::{BuildDefinition, BuildTask, Changeset, PullRequest, Stage, StageTrigger, TriggerReason};
pub use result::{BuildSummary, PhaseResult, StageResult, StageStatus, elapsed_secs};
