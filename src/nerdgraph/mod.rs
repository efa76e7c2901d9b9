//! NerdGraph (GraphQL) client used to run NRQL against a monitoring account
//!
//! One network round trip per attempt; transient failures are retried through
//! the [`retry`] decorator before being surfaced as typed errors.

pub mod client;
pub mod retry;
pub mod types;

pub use client::{ClientHealth, NerdGraphClient, NrqlExecutor};
pub use types::{DiagnosticMessage, PerformanceStats, QueryMetadata, QueryResult};
