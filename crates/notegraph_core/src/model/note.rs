//! Note domain model.
//!
//! # Responsibility
//! - Define the content-bearing record, independent of tree placement.
//!
//! # Invariants
//! - `note_id` is immutable for the lifetime of the note.
//! - When `is_protected` is true, `title` holds base64 ciphertext and
//!   `content` holds nonce-prefixed ciphertext; plaintext is never stored.
//! - `NoteType::Search` notes never own children through relocation.

use super::codec::base64_bytes;
use super::{new_entity_id, now_epoch_ms};
use serde::{Deserialize, Serialize};

/// Stable note identifier.
pub type NoteId = String;

/// Id of the single distinguished root note seeded by migrations.
pub const ROOT_NOTE_ID: &str = "root";

/// Whether `note_id` can be stored: non-empty and free of `_`, which joins
/// the two halves of a branch id.
pub fn is_valid_note_id(note_id: &str) -> bool {
    !note_id.is_empty() && !note_id.contains('_')
}

/// Note content kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoteType {
    Text,
    Code,
    File,
    Image,
    /// Saved query; a virtual node that cannot be a relocation target.
    Search,
    RelationMap,
    Render,
}

impl NoteType {
    /// Storage representation used in `notes.type`.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Code => "code",
            Self::File => "file",
            Self::Image => "image",
            Self::Search => "search",
            Self::RelationMap => "relation_map",
            Self::Render => "render",
        }
    }

    /// Parses the storage representation.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "text" => Some(Self::Text),
            "code" => Some(Self::Code),
            "file" => Some(Self::File),
            "image" => Some(Self::Image),
            "search" => Some(Self::Search),
            "relation_map" => Some(Self::RelationMap),
            "render" => Some(Self::Render),
            _ => None,
        }
    }

    /// Whether relocation may place children under a note of this type.
    pub fn accepts_children(self) -> bool {
        self != Self::Search
    }
}

/// Content record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Note {
    pub note_id: NoteId,
    pub title: String,
    #[serde(with = "base64_bytes")]
    pub content: Vec<u8>,
    #[serde(rename = "type")]
    pub note_type: NoteType,
    pub mime: String,
    pub is_protected: bool,
    /// Epoch ms creation timestamp.
    pub date_created: i64,
    /// Logical timestamp of the last committed change, assigned by the store.
    pub date_modified: i64,
}

impl Note {
    /// Creates an unprotected note with a generated id.
    pub fn new(
        title: impl Into<String>,
        content: impl Into<Vec<u8>>,
        note_type: NoteType,
        mime: impl Into<String>,
    ) -> Self {
        Self::with_id(new_entity_id(), title, content, note_type, mime)
    }

    /// Creates an unprotected note with a caller-provided id.
    ///
    /// Used by import paths and tests where identity already exists. The
    /// store refuses ids rejected by [`is_valid_note_id`].
    pub fn with_id(
        note_id: impl Into<NoteId>,
        title: impl Into<String>,
        content: impl Into<Vec<u8>>,
        note_type: NoteType,
        mime: impl Into<String>,
    ) -> Self {
        let now = now_epoch_ms();
        Self {
            note_id: note_id.into(),
            title: title.into(),
            content: content.into(),
            note_type,
            mime: mime.into(),
            is_protected: false,
            date_created: now,
            date_modified: now,
        }
    }

    pub fn is_root(&self) -> bool {
        self.note_id == ROOT_NOTE_ID
    }
}
