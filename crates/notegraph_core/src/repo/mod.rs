//! Repository layer abstractions and persistence implementations.
//!
//! # Responsibility
//! - Define the entity store contract used by graph services.
//! - Isolate SQLite query details from relocation, protection, and sync.
//!
//! # Invariants
//! - Every entity write and its change-log record commit in one atomic unit.
//! - Repository APIs return semantic errors (`NotFound`) in addition to DB
//!   transport errors.

pub(crate) mod change_log_repo;
pub mod entity_store;
pub(crate) mod options_repo;
mod schema;
pub(crate) mod sync_cursor_repo;
pub(crate) mod write_scope;
