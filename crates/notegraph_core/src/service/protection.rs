//! Protection toggler: encrypt or decrypt every note under a subtree root.
//!
//! # Invariants
//! - The session is checked before the first read; without a live key
//!   nothing is touched.
//! - Each reachable note is visited once even when several branch paths
//!   lead to it.
//! - Notes already in the requested state are skipped and produce no record.

use crate::model::change::EntityName;
use crate::model::note::NoteId;
use crate::protect::crypto::CryptoError;
use crate::protect::session::{ProtectedSessionProvider, SessionError};
use crate::protect::{open_note, seal_note};
use crate::repo::entity_store::{EntityStore, StoreError};
use log::{info, warn};
use std::collections::{HashSet, VecDeque};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug)]
pub enum ProtectionError {
    NotFound(NoteId),
    SessionUnavailable,
    Crypto(CryptoError),
    Storage(StoreError),
}

impl ProtectionError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::SessionUnavailable => "session_unavailable",
            Self::Crypto(_) => "crypto_failed",
            Self::Storage(_) => "storage_failed",
        }
    }
}

impl Display for ProtectionError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound(id) => write!(f, "note not found: {id}"),
            Self::SessionUnavailable => write!(f, "protected session is not available"),
            Self::Crypto(err) => write!(f, "{err}"),
            Self::Storage(err) => write!(f, "{err}"),
        }
    }
}

impl Error for ProtectionError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Crypto(err) => Some(err),
            Self::Storage(err) => Some(err),
            _ => None,
        }
    }
}

impl From<StoreError> for ProtectionError {
    fn from(value: StoreError) -> Self {
        match value {
            StoreError::NotFound {
                entity: EntityName::Note,
                id,
            } => Self::NotFound(id),
            other => Self::Storage(other),
        }
    }
}

impl From<CryptoError> for ProtectionError {
    fn from(value: CryptoError) -> Self {
        Self::Crypto(value)
    }
}

impl From<SessionError> for ProtectionError {
    fn from(value: SessionError) -> Self {
        match value {
            SessionError::Crypto(err) => Self::Crypto(err),
            SessionError::Storage(err) => err.into(),
            _ => Self::SessionUnavailable,
        }
    }
}

/// Counts from one subtree walk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProtectionSummary {
    /// Distinct notes reached from the root, root included.
    pub visited: usize,
    /// Notes rewritten because their state differed.
    pub changed: usize,
}

pub struct ProtectionService<S: EntityStore> {
    store: S,
    session: Arc<dyn ProtectedSessionProvider>,
}

impl<S: EntityStore> ProtectionService<S> {
    pub fn new(store: S, session: Arc<dyn ProtectedSessionProvider>) -> Self {
        Self { store, session }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Sets `is_protected = protect` on every note reachable from `root_note_id`.
    ///
    /// Breadth-first over child branches; runs as one atomic unit.
    pub fn protect_subtree(
        &self,
        root_note_id: &str,
        protect: bool,
    ) -> Result<ProtectionSummary, ProtectionError> {
        let started_at = Instant::now();
        let result = self.walk(root_note_id, protect);
        match &result {
            Ok(summary) => info!(
                "event=protect_subtree module=service status=ok protect={} visited={} changed={} duration_ms={}",
                protect,
                summary.visited,
                summary.changed,
                started_at.elapsed().as_millis()
            ),
            Err(err) => warn!(
                "event=protect_subtree module=service status=error protect={} duration_ms={} error_code={}",
                protect,
                started_at.elapsed().as_millis(),
                err.code()
            ),
        }
        result
    }

    fn walk(&self, root_note_id: &str, protect: bool) -> Result<ProtectionSummary, ProtectionError> {
        let key = self.session.current_key()?;

        self.store.atomically::<_, ProtectionError, _>(|| {
            if self.store.get_note(root_note_id)?.is_none() {
                return Err(ProtectionError::NotFound(root_note_id.to_string()));
            }

            let mut summary = ProtectionSummary::default();
            let mut visited = HashSet::new();
            let mut queue = VecDeque::new();
            visited.insert(root_note_id.to_string());
            queue.push_back(root_note_id.to_string());

            while let Some(note_id) = queue.pop_front() {
                summary.visited += 1;
                let mut note = self
                    .store
                    .get_note(&note_id)?
                    .ok_or_else(|| ProtectionError::NotFound(note_id.clone()))?;

                if note.is_protected != protect {
                    if protect {
                        seal_note(&mut note, &key)?;
                    } else {
                        open_note(&mut note, &key)?;
                    }
                    self.store.put_note(note)?;
                    summary.changed += 1;
                }

                for branch in self.store.child_branches(&note_id)? {
                    if visited.insert(branch.note_id.clone()) {
                        queue.push_back(branch.note_id);
                    }
                }
            }
            Ok(summary)
        })
    }
}
