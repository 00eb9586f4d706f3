//! Attribute domain model.
//!
//! Attributes are opaque to the graph core except for the file labels
//! written by the upload path.

use super::note::NoteId;
use super::{new_entity_id, now_epoch_ms};
use serde::{Deserialize, Serialize};

/// Stable attribute identifier.
pub type AttributeId = String;

/// Label holding the uploaded file's original name.
pub const LABEL_ORIGINAL_FILE_NAME: &str = "originalFileName";
/// Label holding the uploaded file's size in bytes.
pub const LABEL_FILE_SIZE: &str = "fileSize";

/// Name/value pair owned by one note.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attribute {
    pub attribute_id: AttributeId,
    pub note_id: NoteId,
    pub name: String,
    pub value: String,
    pub is_inheritable: bool,
    pub date_modified: i64,
}

impl Attribute {
    /// Creates a non-inheritable label with a generated id.
    pub fn label(note_id: impl Into<NoteId>, name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            attribute_id: new_entity_id(),
            note_id: note_id.into(),
            name: name.into(),
            value: value.into(),
            is_inheritable: false,
            date_modified: now_epoch_ms(),
        }
    }
}
