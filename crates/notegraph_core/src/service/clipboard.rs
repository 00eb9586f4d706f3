//! Cut/copy clipboard for one user session.
//!
//! Nothing here is persisted or change-logged. Copy holds note ids and pastes
//! as clones; cut holds branch ids and pastes as moves.

use crate::graph::invariants::GraphView;
use crate::model::branch::{Branch, BranchId};
use crate::model::note::NoteId;
use crate::repo::entity_store::EntityStore;
use crate::service::relocation::{CloneOutcome, RelocationError, RelocationService};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClipboardMode {
    /// Ids are note ids; paste creates clones and keeps the clipboard.
    Copy,
    /// Ids are branch ids; paste moves them and clears the clipboard.
    Cut,
}

/// Result of a paste.
#[derive(Debug)]
pub enum PasteOutcome {
    /// Clipboard was empty; nothing happened.
    Empty,
    Moved(Vec<Branch>),
    /// One entry per copied note, in clipboard order.
    Cloned(Vec<Result<CloneOutcome, RelocationError>>),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Clipboard {
    entry: Option<(ClipboardMode, Vec<String>)>,
}

impl Clipboard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn copy(&mut self, note_ids: Vec<NoteId>) {
        self.set(ClipboardMode::Copy, note_ids);
    }

    pub fn cut(&mut self, branch_ids: Vec<BranchId>) {
        self.set(ClipboardMode::Cut, branch_ids);
    }

    pub fn clear(&mut self) {
        self.entry = None;
    }

    pub fn mode(&self) -> Option<ClipboardMode> {
        self.entry.as_ref().map(|(mode, _)| *mode)
    }

    pub fn ids(&self) -> &[String] {
        self.entry.as_ref().map_or(&[][..], |(_, ids)| ids.as_slice())
    }

    pub fn is_empty(&self) -> bool {
        self.entry.is_none()
    }

    /// Pastes right after `after_branch_id`, preserving clipboard order.
    pub fn paste_after<S: EntityStore + GraphView>(
        &mut self,
        service: &RelocationService<S>,
        after_branch_id: &str,
    ) -> Result<PasteOutcome, RelocationError> {
        match self.entry.as_ref() {
            None => Ok(PasteOutcome::Empty),
            Some((ClipboardMode::Cut, branch_ids)) => {
                let moved = service.move_after_node(branch_ids, after_branch_id)?;
                self.clear();
                Ok(PasteOutcome::Moved(moved))
            }
            Some((ClipboardMode::Copy, note_ids)) => {
                let mut anchor = after_branch_id.to_string();
                let mut outcomes = Vec::with_capacity(note_ids.len());
                for note_id in note_ids {
                    let outcome = service.clone_note_after(note_id, &anchor);
                    if let Ok(CloneOutcome::Cloned(branch)) = &outcome {
                        anchor = branch.branch_id.clone();
                    }
                    outcomes.push(outcome);
                }
                Ok(PasteOutcome::Cloned(outcomes))
            }
        }
    }

    /// Pastes as the last children of `parent_note_id`.
    pub fn paste_into<S: EntityStore + GraphView>(
        &mut self,
        service: &RelocationService<S>,
        parent_note_id: &str,
    ) -> Result<PasteOutcome, RelocationError> {
        match self.entry.as_ref() {
            None => Ok(PasteOutcome::Empty),
            Some((ClipboardMode::Cut, branch_ids)) => {
                let moved = service.move_to_node(branch_ids, parent_note_id)?;
                self.clear();
                Ok(PasteOutcome::Moved(moved))
            }
            Some((ClipboardMode::Copy, note_ids)) => Ok(PasteOutcome::Cloned(
                service.clone_notes_to(note_ids, parent_note_id),
            )),
        }
    }

    fn set(&mut self, mode: ClipboardMode, ids: Vec<String>) {
        self.entry = if ids.is_empty() {
            None
        } else {
            Some((mode, ids))
        };
    }
}
