//! Branch domain model.
//!
//! # Responsibility
//! - Bind one note under one parent note, carrying per-placement prefix and
//!   sibling order.
//!
//! # Invariants
//! - `branch_id` is derived from `(parent_note_id, note_id)`, so at most one
//!   branch exists per pair. Re-parenting therefore replaces the branch.
//! - Note ids never contain `_`, so a branch id maps back to exactly one pair.
//! - `note_position` is unique among siblings; gaps are allowed.

use super::note::{is_valid_note_id, NoteId};
use super::now_epoch_ms;
use serde::{Deserialize, Serialize};

/// Stable branch identifier.
pub type BranchId = String;

/// Distance between freshly allocated sibling positions.
pub const NOTE_POSITION_STEP: i64 = 10;

/// Derives the branch id for a note placed under a parent.
pub fn branch_id_for(parent_note_id: &str, note_id: &str) -> BranchId {
    format!("{parent_note_id}_{note_id}")
}

/// Placement edge from parent note to child note.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Branch {
    pub branch_id: BranchId,
    pub note_id: NoteId,
    pub parent_note_id: NoteId,
    /// Display string shown before the note title under this parent only.
    pub prefix: Option<String>,
    pub note_position: i64,
    /// Logical timestamp of the last committed change, assigned by the store.
    pub date_modified: i64,
}

impl Branch {
    pub fn new(
        note_id: impl Into<NoteId>,
        parent_note_id: impl Into<NoteId>,
        note_position: i64,
    ) -> Self {
        let note_id = note_id.into();
        let parent_note_id = parent_note_id.into();
        Self {
            branch_id: branch_id_for(&parent_note_id, &note_id),
            note_id,
            parent_note_id,
            prefix: None,
            note_position,
            date_modified: now_epoch_ms(),
        }
    }

    /// Whether both note ids are valid and `branch_id` matches the pair.
    pub fn has_consistent_id(&self) -> bool {
        is_valid_note_id(&self.note_id)
            && is_valid_note_id(&self.parent_note_id)
            && self.branch_id == branch_id_for(&self.parent_note_id, &self.note_id)
    }

    /// Copy of this placement under another parent, keeping the prefix.
    pub fn reparented(&self, parent_note_id: &str, note_position: i64) -> Self {
        let mut branch = Self::new(self.note_id.clone(), parent_note_id, note_position);
        branch.prefix = self.prefix.clone();
        branch
    }
}
