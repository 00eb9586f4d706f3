//! Read-side view of the note/branch graph.
//!
//! # Responsibility
//! - Validate proposed branch insertions without side effects.
//! - Load consistent point-in-time snapshots for export and replica checks.
//!
//! # Invariants
//! - Nothing in this module writes to storage.

pub mod invariants;
pub mod snapshot;
