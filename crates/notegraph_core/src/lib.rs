//! Core domain logic for the note graph.
//! This crate is the single source of truth for graph invariants.

pub mod config;
pub mod db;
pub mod graph;
pub mod logging;
pub mod model;
pub mod protect;
pub mod repo;
pub mod service;
pub mod sync;

pub use config::{ConfigError, CoreConfig};
pub use db::{open_db, open_db_in_memory, DbError, DbResult};
pub use graph::invariants::{
    can_insert_branch, AncestorClosure, GraphView, InvariantViolation,
};
pub use graph::snapshot::GraphSnapshot;
pub use logging::{
    default_log_level, init_logging, init_logging_from_config, logging_status, LogTarget,
    LoggingError,
};
pub use model::attribute::{Attribute, AttributeId};
pub use model::branch::{branch_id_for, Branch, BranchId, NOTE_POSITION_STEP};
pub use model::change::{ChangeLogRecord, EntityName, EntityRow, SequenceId};
pub use model::note::{is_valid_note_id, Note, NoteId, NoteType, ROOT_NOTE_ID};
pub use protect::crypto::{CryptoError, DataKey};
pub use protect::session::{
    change_password, is_password_set, setup_password, ProtectedSessionProvider, SessionError,
    SessionManager,
};
pub use repo::entity_store::{EntityStore, SqliteEntityStore, StoreError, StoreResult};
pub use repo::sync_cursor_repo::SyncCursor;
pub use service::clipboard::{Clipboard, ClipboardMode, PasteOutcome};
pub use service::file_service::{download_file, upload_file, FileDownload, FileError, UploadedFile};
pub use service::protection::{ProtectionError, ProtectionService, ProtectionSummary};
pub use service::relocation::{
    CloneOutcome, CreatedNote, DeleteSummary, NewNote, Placement, RelocationError,
    RelocationService,
};
pub use sync::change_log::{ApplyOutcome, ChangeLog, ChangeLogError};
pub use sync::runner::{
    CancelFlag, SyncError, SyncReport, SyncRunner, SyncTransport, TransportError,
};

/// Minimal health-check API for early integration.
pub fn ping() -> &'static str {
    "pong"
}

/// Returns the core crate version.
pub fn core_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    use super::{core_version, ping};

    #[test]
    fn ping_returns_pong() {
        assert_eq!(ping(), "pong");
    }

    #[test]
    fn version_is_not_empty() {
        assert!(!core_version().is_empty());
    }
}
