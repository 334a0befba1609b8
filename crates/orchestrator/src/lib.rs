//! Generation task orchestration.
//!
//! Ties the credit ledger, the task registry, and the provider adapters
//! together: debit, register, submit, poll or accept callbacks, and settle
//! every task exactly once with a refund on any failure.

pub mod backoff;
pub mod config;
pub mod error;
pub mod ledger;
pub mod lifecycle;
pub mod orchestrator;
pub mod registry;
pub mod routing;
pub mod worker;

pub use error::OrchestratorError;
pub use orchestrator::Orchestrator;
