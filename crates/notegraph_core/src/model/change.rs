//! Change-log record model.
//!
//! # Responsibility
//! - Describe one committed mutation of a note, branch, or attribute.
//! - Carry the entity state at commit time so replicas can replay it.
//!
//! # Invariants
//! - Deletions are new tombstone records (`is_erased = true`, no payload).
//! - Record identity and precedence never change after append. The payload
//!   of a note record may be rewritten to that note's later protected state.
//! - `(source_id, origin_sequence_id)` identifies a change across replicas.

use super::attribute::Attribute;
use super::branch::Branch;
use super::note::Note;
use serde::{Deserialize, Serialize};

/// Per-instance monotonic change sequence number.
pub type SequenceId = i64;

/// Entity family a change applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityName {
    Note,
    Branch,
    Attribute,
}

impl EntityName {
    /// Storage representation used in `entity_changes.entity_name`.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Note => "note",
            Self::Branch => "branch",
            Self::Attribute => "attribute",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "note" => Some(Self::Note),
            "branch" => Some(Self::Branch),
            "attribute" => Some(Self::Attribute),
            _ => None,
        }
    }
}

/// Full entity state for upserts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityRow {
    Note(Note),
    Branch(Branch),
    Attribute(Attribute),
}

impl EntityRow {
    pub fn entity_name(&self) -> EntityName {
        match self {
            Self::Note(_) => EntityName::Note,
            Self::Branch(_) => EntityName::Branch,
            Self::Attribute(_) => EntityName::Attribute,
        }
    }

    pub fn entity_id(&self) -> &str {
        match self {
            Self::Note(note) => &note.note_id,
            Self::Branch(branch) => &branch.branch_id,
            Self::Attribute(attribute) => &attribute.attribute_id,
        }
    }

    pub(crate) fn set_date_modified(&mut self, timestamp: i64) {
        match self {
            Self::Note(note) => note.date_modified = timestamp,
            Self::Branch(branch) => branch.date_modified = timestamp,
            Self::Attribute(attribute) => attribute.date_modified = timestamp,
        }
    }
}

/// One appended change-log entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeLogRecord {
    /// Local sequence number on the instance that serves this record.
    pub sequence_id: SequenceId,
    pub entity_name: EntityName,
    pub entity_id: String,
    /// Instance that originated the change.
    pub source_id: String,
    /// Sequence number assigned by the originating instance.
    pub origin_sequence_id: SequenceId,
    /// Logical clock value in epoch milliseconds.
    pub timestamp: i64,
    pub is_erased: bool,
    /// Entity state at commit time; `None` for tombstones.
    pub payload: Option<EntityRow>,
}

impl ChangeLogRecord {
    /// Last-write-wins ordering key: later timestamp first, then higher source id.
    pub fn precedence(&self) -> (i64, &str) {
        (self.timestamp, self.source_id.as_str())
    }
}
