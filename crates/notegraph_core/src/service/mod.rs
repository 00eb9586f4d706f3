//! Core use-case services.
//!
//! # Responsibility
//! - Orchestrate entity store calls into graph-level operations.
//! - Keep CLI and sync layers decoupled from storage details.

pub mod clipboard;
pub mod file_service;
pub mod protection;
pub mod relocation;
