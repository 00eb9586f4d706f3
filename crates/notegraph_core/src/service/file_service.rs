//! File upload and download on top of the relocation engine.
//!
//! # Invariants
//! - An upload writes the file note, its branch, and both file labels in
//!   one atomic unit; the labels never exist without the note.
//! - Protected file content is only returned while a session is live.

use crate::graph::invariants::GraphView;
use crate::model::attribute::{Attribute, LABEL_FILE_SIZE, LABEL_ORIGINAL_FILE_NAME};
use crate::model::branch::Branch;
use crate::model::change::EntityName;
use crate::model::note::{Note, NoteType};
use crate::protect::crypto::{decrypt_bytes, decrypt_title, CryptoError};
use crate::protect::session::ProtectedSessionProvider;
use crate::repo::entity_store::{EntityStore, StoreError};
use crate::service::relocation::{NewNote, Placement, RelocationError, RelocationService};
use log::{info, warn};
use std::error::Error;
use std::fmt::{Display, Formatter};

const DEFAULT_FILE_MIME: &str = "application/octet-stream";

#[derive(Debug)]
pub enum FileError {
    NotFound { entity: EntityName, id: String },
    InvalidFileName,
    SessionUnavailable,
    /// Placement rejected by the relocation engine.
    Rejected(RelocationError),
    Crypto(CryptoError),
    Storage(StoreError),
}

impl FileError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "not_found",
            Self::InvalidFileName => "invalid_file_name",
            Self::SessionUnavailable => "session_unavailable",
            Self::Rejected(err) => err.code(),
            Self::Crypto(_) => "crypto_failed",
            Self::Storage(_) => "storage_failed",
        }
    }
}

impl Display for FileError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound { entity, id } => write!(f, "{} not found: {id}", entity.as_str()),
            Self::InvalidFileName => write!(f, "file name must not be blank"),
            Self::SessionUnavailable => write!(f, "protected session is not available"),
            Self::Rejected(err) => write!(f, "{err}"),
            Self::Crypto(err) => write!(f, "{err}"),
            Self::Storage(err) => write!(f, "{err}"),
        }
    }
}

impl Error for FileError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Rejected(err) => Some(err),
            Self::Crypto(err) => Some(err),
            Self::Storage(err) => Some(err),
            _ => None,
        }
    }
}

impl From<StoreError> for FileError {
    fn from(value: StoreError) -> Self {
        match value {
            StoreError::NotFound { entity, id } => Self::NotFound { entity, id },
            other => Self::Storage(other),
        }
    }
}

impl From<RelocationError> for FileError {
    fn from(value: RelocationError) -> Self {
        match value {
            RelocationError::NotFound { entity, id } => Self::NotFound { entity, id },
            RelocationError::SessionUnavailable => Self::SessionUnavailable,
            RelocationError::Crypto(err) => Self::Crypto(err),
            RelocationError::Storage(err) => Self::Storage(err),
            other => Self::Rejected(other),
        }
    }
}

impl From<CryptoError> for FileError {
    fn from(value: CryptoError) -> Self {
        Self::Crypto(value)
    }
}

/// Entities written by one upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadedFile {
    pub note: Note,
    pub branch: Branch,
    pub attributes: Vec<Attribute>,
}

/// Plaintext file ready to hand to a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDownload {
    pub file_name: String,
    pub mime: String,
    pub content: Vec<u8>,
}

/// Stores `bytes` as a new file note appended under `parent_note_id`.
pub fn upload_file<S: EntityStore + GraphView>(
    service: &RelocationService<S>,
    parent_note_id: &str,
    original_name: &str,
    bytes: Vec<u8>,
    mime: &str,
) -> Result<UploadedFile, FileError> {
    let file_name = original_name.trim();
    if file_name.is_empty() {
        return Err(FileError::InvalidFileName);
    }
    let mime = match mime.trim() {
        "" => DEFAULT_FILE_MIME,
        value => value,
    };
    let file_size = bytes.len();

    let store = service.store();
    let result = store.atomically::<_, FileError, _>(|| {
        let created = service.create_note(
            NewNote::new(file_name, bytes, NoteType::File, mime),
            Placement::Into(parent_note_id.to_string()),
        )?;

        let mut attributes = Vec::with_capacity(2);
        for label in [
            Attribute::label(&created.note.note_id, LABEL_ORIGINAL_FILE_NAME, file_name),
            Attribute::label(&created.note.note_id, LABEL_FILE_SIZE, file_size.to_string()),
        ] {
            let attribute_id = label.attribute_id.clone();
            store.put_attribute(label)?;
            attributes.push(
                store
                    .get_attribute(&attribute_id)?
                    .ok_or_else(|| StoreError::not_found(EntityName::Attribute, &attribute_id))?,
            );
        }

        Ok(UploadedFile {
            note: created.note,
            branch: created.branch,
            attributes,
        })
    });

    match &result {
        Ok(uploaded) => info!(
            "event=file_upload module=service status=ok note_id={} size_bytes={}",
            uploaded.note.note_id, file_size
        ),
        Err(err) => warn!(
            "event=file_upload module=service status=error error_code={}",
            err.code()
        ),
    }
    result
}

/// Returns the stored file name, mime, and plaintext content of a note.
///
/// The name comes from the `originalFileName` label, falling back to the
/// note title.
pub fn download_file<S: EntityStore>(
    store: &S,
    note_id: &str,
    session: Option<&dyn ProtectedSessionProvider>,
) -> Result<FileDownload, FileError> {
    let note = store
        .get_note(note_id)?
        .ok_or_else(|| StoreError::not_found(EntityName::Note, note_id))?;
    let label = store
        .note_attributes(note_id)?
        .into_iter()
        .find(|attribute| attribute.name == LABEL_ORIGINAL_FILE_NAME)
        .map(|attribute| attribute.value);

    let (title, content) = if note.is_protected {
        let key = session
            .ok_or(FileError::SessionUnavailable)?
            .current_key()
            .map_err(|_| FileError::SessionUnavailable)?;
        (
            decrypt_title(&key, &note.title)?,
            decrypt_bytes(&key, &note.content)?,
        )
    } else {
        (note.title, note.content)
    };

    Ok(FileDownload {
        file_name: label.unwrap_or(title),
        mime: note.mime,
        content,
    })
}
