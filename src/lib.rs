//! # reliq
//!
//! Reliability overlay for an at-least-once background job queue:
//! content-based deduplication, lock-backed uniqueness guarantees,
//! conflict resolution at enqueue time, and detection of jobs that were
//! scheduled but never executed.
//!
//! The execution transport, the distributed lock backend, and the
//! recurring-job registrar are consumed as capabilities; this crate only
//! guarantees that duplicate logical executions sharing a digest are
//! deduplicated or serialized according to the chosen policies.

pub mod clock;
pub mod config;
pub mod conflict;
pub mod digest;
pub mod error;
pub mod lock;
pub mod manager;
pub mod memory;
pub mod missed;
pub mod model;
pub mod registry;
pub mod repository;
pub mod transport;
pub mod uniqueness;
