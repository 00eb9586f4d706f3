//! Change-log replication between instances.
//!
//! # Responsibility
//! - Expose `records_since` / `apply_incoming` to transports.
//! - Drive pull/push rounds with resumable per-peer cursors.
//!
//! # Invariants
//! - The network lives behind `SyncTransport`; nothing here opens sockets.

pub mod change_log;
pub mod runner;
