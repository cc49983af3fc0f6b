//! Anvil Core
//!
//! Core types shared by the Anvil build executor.
//!
//! This crate contains:
//! - Domain types: build tasks, stages, stage results and build summaries
//! - Trigger language: the expression form that gates whether a stage runs

pub mod domain;
pub mod trigger;
