//! Note graph domain model.
//!
//! # Responsibility
//! - Define the plain records persisted by the entity store: notes, branches,
//!   attributes, and change-log records.
//! - Keep placement (branches) separate from content (notes).
//!
//! # Invariants
//! - A note carries no parent pointer; every placement is a `Branch`.
//! - Entity ids are opaque strings and never reused for another entity.

pub mod attribute;
pub mod branch;
pub mod change;
pub mod note;

mod codec;

use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Generates a fresh opaque entity id.
pub fn new_entity_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Wall clock in epoch milliseconds.
pub fn now_epoch_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as i64)
        .unwrap_or(0)
}
