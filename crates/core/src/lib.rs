//! Domain types shared by every MV Studio crate.
//!
//! This crate does no I/O. It defines the error vocabulary, the billable
//! operation kinds and their cost table, the provider and task-state enums,
//! and opaque task identifiers.

pub mod credits;
pub mod error;
pub mod ids;
pub mod task;
pub mod types;
