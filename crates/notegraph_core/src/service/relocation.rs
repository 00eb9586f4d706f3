//! Relocation engine: create, move, clone, delete, and reorder placements.
//!
//! # Responsibility
//! - Turn client operations into branch/note/attribute writes on an
//!   `EntityStore`, one change-log record per touched entity.
//! - Consult the invariant checker before any write.
//!
//! # Invariants
//! - Every operation runs inside one store write scope: it fully commits or
//!   leaves no trace. Validation reads happen inside the same scope, so no
//!   concurrent writer can renumber a sibling set between check and write.
//! - Sibling positions stay pairwise distinct under every parent.
//! - The root note is never given a parent and never deleted.

use crate::graph::invariants::{
    can_insert_branch, check_against_closure, AncestorClosure, GraphView, InvariantViolation,
};
use crate::model::attribute::Attribute;
use crate::model::branch::{branch_id_for, Branch, BranchId, NOTE_POSITION_STEP};
use crate::model::change::EntityName;
use crate::model::note::{Note, NoteId, NoteType, ROOT_NOTE_ID};
use crate::protect::crypto::{decrypt_title, CryptoError, DataKey};
use crate::protect::seal_note;
use crate::protect::session::{ProtectedSessionProvider, SessionError};
use crate::repo::entity_store::{EntityStore, StoreError};
use log::{info, warn};
use std::collections::HashSet;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::Arc;
use std::time::Instant;

/// Errors from relocation operations.
#[derive(Debug)]
pub enum RelocationError {
    /// Referenced note or branch does not exist.
    NotFound { entity: EntityName, id: String },
    /// Proposed placement breaks a graph invariant; nothing was written.
    Invariant(InvariantViolation),
    /// The root note cannot be moved or deleted.
    RootNotRelocatable,
    /// A branch was asked to move relative to itself.
    InvalidTarget(BranchId),
    /// Operation touches protected data without a live session.
    SessionUnavailable,
    Crypto(CryptoError),
    /// Durable write failed; nothing was committed.
    Storage(StoreError),
}

impl RelocationError {
    /// Stable machine code for logs.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "not_found",
            Self::Invariant(violation) => violation.code(),
            Self::RootNotRelocatable => "root_not_relocatable",
            Self::InvalidTarget(_) => "invalid_target",
            Self::SessionUnavailable => "session_unavailable",
            Self::Crypto(_) => "crypto_failed",
            Self::Storage(_) => "storage_failed",
        }
    }
}

impl Display for RelocationError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound { entity, id } => write!(f, "{} not found: {id}", entity.as_str()),
            Self::Invariant(violation) => write!(f, "{violation}"),
            Self::RootNotRelocatable => write!(f, "root note cannot be moved or deleted"),
            Self::InvalidTarget(id) => write!(f, "branch {id} cannot be placed relative to itself"),
            Self::SessionUnavailable => write!(f, "protected session is not available"),
            Self::Crypto(err) => write!(f, "{err}"),
            Self::Storage(err) => write!(f, "{err}"),
        }
    }
}

impl Error for RelocationError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Invariant(violation) => Some(violation),
            Self::Crypto(err) => Some(err),
            Self::Storage(err) => Some(err),
            _ => None,
        }
    }
}

impl From<StoreError> for RelocationError {
    fn from(value: StoreError) -> Self {
        match value {
            StoreError::NotFound { entity, id } => Self::NotFound { entity, id },
            other => Self::Storage(other),
        }
    }
}

impl From<InvariantViolation> for RelocationError {
    fn from(value: InvariantViolation) -> Self {
        Self::Invariant(value)
    }
}

impl From<CryptoError> for RelocationError {
    fn from(value: CryptoError) -> Self {
        Self::Crypto(value)
    }
}

impl From<SessionError> for RelocationError {
    fn from(value: SessionError) -> Self {
        match value {
            SessionError::Crypto(err) => Self::Crypto(err),
            SessionError::Storage(err) => err.into(),
            _ => Self::SessionUnavailable,
        }
    }
}

/// Where a new placement goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Placement {
    /// Last child of the note.
    Into(NoteId),
    /// Right after the branch, under the same parent.
    After(BranchId),
}

/// Input for [`RelocationService::create_note`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewNote {
    pub title: String,
    pub content: Vec<u8>,
    pub note_type: NoteType,
    pub mime: String,
    pub is_protected: bool,
}

impl NewNote {
    pub fn new(
        title: impl Into<String>,
        content: impl Into<Vec<u8>>,
        note_type: NoteType,
        mime: impl Into<String>,
    ) -> Self {
        Self {
            title: title.into(),
            content: content.into(),
            note_type,
            mime: mime.into(),
            is_protected: false,
        }
    }

    pub fn text(title: impl Into<String>) -> Self {
        Self::new(title, Vec::new(), NoteType::Text, "text/html")
    }

    pub fn protected(mut self, is_protected: bool) -> Self {
        self.is_protected = is_protected;
        self
    }
}

/// Note and branch written by `create_note`, in stored form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedNote {
    pub note: Note,
    pub branch: Branch,
}

/// Result of a clone request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloneOutcome {
    /// A new branch was written.
    Cloned(Branch),
    /// The note already sits under that parent; nothing was written.
    AlreadyPresent(Branch),
}

impl CloneOutcome {
    pub fn branch(&self) -> &Branch {
        match self {
            Self::Cloned(branch) | Self::AlreadyPresent(branch) => branch,
        }
    }
}

/// What a cascading delete removed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeleteSummary {
    pub deleted_branches: Vec<BranchId>,
    pub deleted_notes: Vec<NoteId>,
    pub deleted_attributes: usize,
}

/// Relocation use-case facade over an entity store.
pub struct RelocationService<S: EntityStore + GraphView> {
    store: S,
    session: Option<Arc<dyn ProtectedSessionProvider>>,
}

impl<S: EntityStore + GraphView> RelocationService<S> {
    /// Creates a service that rejects anything needing the protected session.
    pub fn new(store: S) -> Self {
        Self {
            store,
            session: None,
        }
    }

    pub fn with_session(store: S, session: Arc<dyn ProtectedSessionProvider>) -> Self {
        Self {
            store,
            session: Some(session),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Creates a note and its first branch in one atomic unit.
    ///
    /// Protected notes are encrypted before the first write.
    pub fn create_note(
        &self,
        new_note: NewNote,
        placement: Placement,
    ) -> Result<CreatedNote, RelocationError> {
        let started_at = Instant::now();
        let result = self.store.atomically::<_, RelocationError, _>(|| {
            let key = if new_note.is_protected {
                Some(self.require_key()?)
            } else {
                None
            };

            let mut note = Note::new(
                new_note.title,
                new_note.content,
                new_note.note_type,
                new_note.mime,
            );
            let (parent_note_id, after) = match &placement {
                Placement::Into(parent_note_id) => (parent_note_id.clone(), None),
                Placement::After(branch_id) => {
                    let after = self.load_branch(branch_id)?;
                    (after.parent_note_id.clone(), Some(after))
                }
            };
            if let Err(violation) = can_insert_branch(&self.store, &note.note_id, &parent_note_id)? {
                return Err(violation.into());
            }

            if let Some(key) = key.as_ref() {
                seal_note(&mut note, key)?;
            }
            let position = match after.as_ref() {
                Some(after) => self.make_room_after(after, None)?,
                None => self.next_child_position(&parent_note_id)?,
            };

            let branch_id = branch_id_for(&parent_note_id, &note.note_id);
            let note_id = note.note_id.clone();
            self.store.put_note(note)?;
            self.store
                .put_branch(Branch::new(note_id.clone(), parent_note_id, position))?;
            Ok(CreatedNote {
                note: self.load_note(&note_id)?,
                branch: self.load_branch(&branch_id)?,
            })
        });
        finish("create_note", started_at, result)
    }

    /// Moves branches to sit right after `after_branch_id`, in the given order.
    ///
    /// All-or-nothing: any rejected branch aborts the whole move.
    pub fn move_after_node(
        &self,
        branch_ids: &[BranchId],
        after_branch_id: &str,
    ) -> Result<Vec<Branch>, RelocationError> {
        let started_at = Instant::now();
        let result = self.store.atomically::<_, RelocationError, _>(|| {
            let target = self.load_branch(after_branch_id)?;
            let moving = self.load_moving_branches(branch_ids)?;
            if moving.iter().any(|branch| branch.branch_id == target.branch_id) {
                return Err(RelocationError::InvalidTarget(target.branch_id.clone()));
            }
            self.validate_new_parent(&moving, &target.parent_note_id)?;

            let mut previous = target;
            let mut placed = Vec::with_capacity(moving.len());
            for branch in moving {
                let position = self.make_room_after(&previous, Some(&branch.branch_id))?;
                let moved = self.relocate(branch, &previous.parent_note_id, position)?;
                previous = moved.clone();
                placed.push(moved);
            }
            Ok(placed)
        });
        finish("move_after_node", started_at, result)
    }

    /// Moves branches to the end of `target_note_id`'s children.
    ///
    /// Branches already under the target keep their position.
    pub fn move_to_node(
        &self,
        branch_ids: &[BranchId],
        target_note_id: &str,
    ) -> Result<Vec<Branch>, RelocationError> {
        let started_at = Instant::now();
        let result = self.store.atomically::<_, RelocationError, _>(|| {
            self.load_note(target_note_id)?;
            let moving = self.load_moving_branches(branch_ids)?;
            self.validate_new_parent(&moving, target_note_id)?;

            let mut placed = Vec::with_capacity(moving.len());
            for branch in moving {
                if branch.parent_note_id == target_note_id {
                    placed.push(branch);
                    continue;
                }
                let position = self.next_child_position(target_note_id)?;
                placed.push(self.relocate(branch, target_note_id, position)?);
            }
            Ok(placed)
        });
        finish("move_to_node", started_at, result)
    }

    /// Adds a branch for an existing note at the end of `parent_note_id`.
    pub fn clone_note_to(
        &self,
        note_id: &str,
        parent_note_id: &str,
    ) -> Result<CloneOutcome, RelocationError> {
        let started_at = Instant::now();
        let result = self.store.atomically::<_, RelocationError, _>(|| {
            self.clone_with(note_id, parent_note_id, |service| {
                service.next_child_position(parent_note_id)
            })
        });
        finish("clone_note_to", started_at, result)
    }

    /// Adds a branch for an existing note right after `after_branch_id`.
    pub fn clone_note_after(
        &self,
        note_id: &str,
        after_branch_id: &str,
    ) -> Result<CloneOutcome, RelocationError> {
        let started_at = Instant::now();
        let result = self.store.atomically::<_, RelocationError, _>(|| {
            let after = self.load_branch(after_branch_id)?;
            self.clone_with(note_id, &after.parent_note_id, |service| {
                service.make_room_after(&after, None)
            })
        });
        finish("clone_note_after", started_at, result)
    }

    /// Clones each note under `parent_note_id` independently.
    ///
    /// One note's failure neither aborts nor rolls back the others.
    pub fn clone_notes_to(
        &self,
        note_ids: &[NoteId],
        parent_note_id: &str,
    ) -> Vec<Result<CloneOutcome, RelocationError>> {
        note_ids
            .iter()
            .map(|note_id| self.clone_note_to(note_id, parent_note_id))
            .collect()
    }

    /// Removes branches; a note losing its last branch is deleted together
    /// with its attributes and, recursively, its own child branches.
    pub fn delete_nodes(&self, branch_ids: &[BranchId]) -> Result<DeleteSummary, RelocationError> {
        let started_at = Instant::now();
        let result = self.store.atomically::<_, RelocationError, _>(|| {
            let targets = self.load_moving_branches(branch_ids)?;
            for branch in &targets {
                if self.store.note_type(&branch.parent_note_id)? == Some(NoteType::Search) {
                    return Err(
                        InvariantViolation::ParentIsSearchNote(branch.parent_note_id.clone())
                            .into(),
                    );
                }
            }

            let mut summary = DeleteSummary::default();
            for branch in &targets {
                self.delete_placement(branch, &mut summary)?;
            }
            Ok(summary)
        });
        finish("delete_nodes", started_at, result)
    }

    /// Renumbers the children of `parent_note_id` by case-insensitive title.
    ///
    /// Equal titles keep their previous relative order. Only branches whose
    /// position changes are written, so a second run writes nothing.
    /// Returns how many branches were repositioned.
    pub fn sort_alphabetically(&self, parent_note_id: &str) -> Result<usize, RelocationError> {
        let started_at = Instant::now();
        let result = self.store.atomically::<_, RelocationError, _>(|| {
            self.load_note(parent_note_id)?;
            let mut key: Option<DataKey> = None;
            let mut keyed = Vec::new();
            for branch in self.store.child_branches(parent_note_id)? {
                let note = self.load_note(&branch.note_id)?;
                let title = if note.is_protected {
                    if key.is_none() {
                        key = Some(self.require_key()?);
                    }
                    let key = key.as_ref().ok_or(RelocationError::SessionUnavailable)?;
                    decrypt_title(key, &note.title)?
                } else {
                    note.title
                };
                keyed.push((title.to_lowercase(), branch));
            }
            keyed.sort_by(|left, right| left.0.cmp(&right.0));

            let mut changed = 0;
            for (index, (_, mut branch)) in keyed.into_iter().enumerate() {
                let position = (index as i64 + 1) * NOTE_POSITION_STEP;
                if branch.note_position != position {
                    branch.note_position = position;
                    self.store.put_branch(branch)?;
                    changed += 1;
                }
            }
            Ok(changed)
        });
        finish("sort_alphabetically", started_at, result)
    }

    /// Sets or clears (blank input) the display prefix of one placement.
    pub fn set_branch_prefix(
        &self,
        branch_id: &str,
        prefix: Option<&str>,
    ) -> Result<Branch, RelocationError> {
        let started_at = Instant::now();
        let result = self.store.atomically::<_, RelocationError, _>(|| {
            let mut branch = self.load_branch(branch_id)?;
            if self.store.note_type(&branch.parent_note_id)? == Some(NoteType::Search) {
                return Err(
                    InvariantViolation::ParentIsSearchNote(branch.parent_note_id.clone()).into(),
                );
            }
            branch.prefix = prefix
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map(str::to_string);
            self.store.put_branch(branch)?;
            self.load_branch(branch_id)
        });
        finish("set_branch_prefix", started_at, result)
    }

    fn clone_with(
        &self,
        note_id: &str,
        parent_note_id: &str,
        position: impl FnOnce(&Self) -> Result<i64, RelocationError>,
    ) -> Result<CloneOutcome, RelocationError> {
        self.load_note(note_id)?;
        match can_insert_branch(&self.store, note_id, parent_note_id)? {
            Ok(()) => {
                let position = position(self)?;
                let branch = Branch::new(note_id, parent_note_id, position);
                let branch_id = branch.branch_id.clone();
                self.store.put_branch(branch)?;
                Ok(CloneOutcome::Cloned(self.load_branch(&branch_id)?))
            }
            Err(InvariantViolation::DuplicateBranch { .. }) => {
                let existing = self
                    .store
                    .find_branch(note_id, parent_note_id)?
                    .ok_or_else(|| StoreError::not_found(EntityName::Branch, note_id))?;
                Ok(CloneOutcome::AlreadyPresent(existing))
            }
            Err(violation) => Err(violation.into()),
        }
    }

    /// Loads branches in request order, dropping repeated ids.
    fn load_moving_branches(&self, branch_ids: &[BranchId]) -> Result<Vec<Branch>, RelocationError> {
        let mut seen = HashSet::new();
        let mut branches = Vec::with_capacity(branch_ids.len());
        for branch_id in branch_ids {
            if !seen.insert(branch_id.as_str()) {
                continue;
            }
            let branch = self.load_branch(branch_id)?;
            if branch.note_id == ROOT_NOTE_ID {
                return Err(RelocationError::RootNotRelocatable);
            }
            branches.push(branch);
        }
        Ok(branches)
    }

    /// Checks every branch that changes parent against one parent closure.
    fn validate_new_parent(
        &self,
        moving: &[Branch],
        parent_note_id: &str,
    ) -> Result<(), RelocationError> {
        if self.store.note_type(parent_note_id)? == Some(NoteType::Search) {
            return Err(InvariantViolation::ParentIsSearchNote(parent_note_id.to_string()).into());
        }

        let closure = AncestorClosure::compute(&self.store, parent_note_id)?;
        let mut placed = HashSet::new();
        for branch in moving {
            if !placed.insert(branch.note_id.as_str()) {
                return Err(InvariantViolation::DuplicateBranch {
                    note_id: branch.note_id.clone(),
                    parent_note_id: parent_note_id.to_string(),
                }
                .into());
            }
            if branch.parent_note_id == parent_note_id {
                continue;
            }
            if let Err(violation) = check_against_closure(&self.store, &closure, &branch.note_id)? {
                return Err(violation.into());
            }
        }
        Ok(())
    }

    /// Writes `branch` at `position` under `parent_note_id`.
    ///
    /// Branch ids derive from the pair, so a parent change replaces the
    /// branch (keeping its prefix) instead of updating it.
    fn relocate(
        &self,
        mut branch: Branch,
        parent_note_id: &str,
        position: i64,
    ) -> Result<Branch, RelocationError> {
        if branch.parent_note_id == parent_note_id {
            branch.note_position = position;
            let branch_id = branch.branch_id.clone();
            self.store.put_branch(branch)?;
            return self.load_branch(&branch_id);
        }

        // New placement first: the note keeps a parent at every point of the log.
        let moved = branch.reparented(parent_note_id, position);
        let moved_id = moved.branch_id.clone();
        self.store.put_branch(moved)?;
        self.store.delete(EntityName::Branch, &branch.branch_id)?;
        self.load_branch(&moved_id)
    }

    /// Frees the slot right after `after` and returns its position.
    ///
    /// When a sibling already sits within one step, every following sibling
    /// shifts by one step. `skip` names a branch being moved, which does not
    /// count as occupying anything.
    fn make_room_after(&self, after: &Branch, skip: Option<&str>) -> Result<i64, RelocationError> {
        let position = after.note_position + NOTE_POSITION_STEP;
        let following = self
            .store
            .child_branches(&after.parent_note_id)?
            .into_iter()
            .filter(|sibling| Some(sibling.branch_id.as_str()) != skip)
            .filter(|sibling| sibling.branch_id != after.branch_id)
            .filter(|sibling| sibling.note_position > after.note_position)
            .collect::<Vec<_>>();

        if following
            .iter()
            .any(|sibling| sibling.note_position <= position)
        {
            for mut sibling in following {
                sibling.note_position += NOTE_POSITION_STEP;
                self.store.put_branch(sibling)?;
            }
        }
        Ok(position)
    }

    fn next_child_position(&self, parent_note_id: &str) -> Result<i64, RelocationError> {
        let last = self
            .store
            .child_branches(parent_note_id)?
            .iter()
            .map(|branch| branch.note_position)
            .max()
            .unwrap_or(0);
        Ok(last + NOTE_POSITION_STEP)
    }

    /// Deletes `branch`, first cascading into its note when this is the
    /// note's last placement.
    ///
    /// Tombstones are written children first and each note before its last
    /// branch, so a replica replaying them never sees a live note without a
    /// parent.
    fn delete_placement(
        &self,
        branch: &Branch,
        summary: &mut DeleteSummary,
    ) -> Result<(), RelocationError> {
        if self.store.get_branch(&branch.branch_id)?.is_none() {
            return Ok(());
        }
        let last_placement = self
            .store
            .parent_branches(&branch.note_id)?
            .iter()
            .all(|parent| parent.branch_id == branch.branch_id);
        if last_placement {
            summary.deleted_notes.push(branch.note_id.clone());
            for child in self.store.child_branches(&branch.note_id)? {
                self.delete_placement(&child, summary)?;
            }
            summary.deleted_attributes += self.delete_attributes(&branch.note_id)?;
            self.store.delete(EntityName::Note, &branch.note_id)?;
        }
        self.store.delete(EntityName::Branch, &branch.branch_id)?;
        summary.deleted_branches.push(branch.branch_id.clone());
        Ok(())
    }

    fn delete_attributes(&self, note_id: &str) -> Result<usize, RelocationError> {
        let attributes: Vec<Attribute> = self.store.note_attributes(note_id)?;
        for attribute in &attributes {
            self.store
                .delete(EntityName::Attribute, &attribute.attribute_id)?;
        }
        Ok(attributes.len())
    }

    fn require_key(&self) -> Result<DataKey, RelocationError> {
        match self.session.as_ref() {
            Some(session) => Ok(session.current_key()?),
            None => Err(RelocationError::SessionUnavailable),
        }
    }

    fn load_note(&self, note_id: &str) -> Result<Note, RelocationError> {
        self.store
            .get_note(note_id)?
            .ok_or_else(|| StoreError::not_found(EntityName::Note, note_id).into())
    }

    fn load_branch(&self, branch_id: &str) -> Result<Branch, RelocationError> {
        self.store
            .get_branch(branch_id)?
            .ok_or_else(|| StoreError::not_found(EntityName::Branch, branch_id).into())
    }
}

fn finish<T>(
    op: &'static str,
    started_at: Instant,
    result: Result<T, RelocationError>,
) -> Result<T, RelocationError> {
    match &result {
        Ok(_) => info!(
            "event=relocation module=service op={op} status=ok duration_ms={}",
            started_at.elapsed().as_millis()
        ),
        Err(err) => warn!(
            "event=relocation module=service op={op} status=error duration_ms={} error_code={}",
            started_at.elapsed().as_millis(),
            err.code()
        ),
    }
    result
}
