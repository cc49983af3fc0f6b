//! Repository layer
//!
//! Adapters for the external stores the executor consumes as opaque services:
//! the durable result store, the distributed coordination store, and the
//! credential store.
//!
//! All repositories are trait-based so the pipeline and registry can be
//! exercised against in-memory implementations.

mod consul;
mod coordination;
mod credentials;
mod error;
mod postgres;
mod results;

// Re-export traits
pub use coordination::CoordinationStore;
pub use credentials::CredentialStore;
pub use results::ResultStore;

// Re-export implementations
pub use consul::ConsulStore;
pub use coordination::InMemoryCoordinationStore;
pub use credentials::StaticCredentialStore;
pub use postgres::PgResultStore;
pub use results::{BuildOutput, InMemoryResultStore};

pub use credentials::{Credential, CredentialKind};
pub use error::StoreError;
