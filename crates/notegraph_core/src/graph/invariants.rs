//! Graph invariant checker.
//!
//! # Responsibility
//! - Decide whether a branch `(note_id -> parent_note_id)` may be inserted.
//!
//! # Invariants
//! - Pure: consults a `GraphView`, never writes.
//! - Cycle detection explores every ancestor path of the parent, since a
//!   note may be reachable from the root along several branches.
//! - The root note never receives a parent branch.

use crate::model::note::{NoteId, NoteType, ROOT_NOTE_ID};
use crate::repo::entity_store::{StoreError, StoreResult};
use crate::model::change::EntityName;
use std::collections::{HashSet, VecDeque};
use std::error::Error;
use std::fmt::{Display, Formatter};

/// Read-only adjacency queries the checker needs.
pub trait GraphView {
    /// Type of an existing note, `None` when the note is absent.
    fn note_type(&self, note_id: &str) -> StoreResult<Option<NoteType>>;
    /// Parents of `note_id` across all of its branches.
    fn parent_note_ids(&self, note_id: &str) -> StoreResult<Vec<NoteId>>;
    fn has_branch(&self, note_id: &str, parent_note_id: &str) -> StoreResult<bool>;
}

/// Rejection reasons for a proposed branch insertion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvariantViolation {
    /// The pair is already bound by a branch.
    DuplicateBranch {
        note_id: NoteId,
        parent_note_id: NoteId,
    },
    /// The note is the parent itself or one of its ancestors.
    WouldCreateCycle {
        note_id: NoteId,
        parent_note_id: NoteId,
    },
    /// Search notes cannot own children.
    ParentIsSearchNote(NoteId),
    /// The root note cannot be placed under another note.
    RootCannotHaveParent,
}

impl InvariantViolation {
    /// Stable machine code for logs and API envelopes.
    pub fn code(&self) -> &'static str {
        match self {
            Self::DuplicateBranch { .. } => "duplicate_branch",
            Self::WouldCreateCycle { .. } => "would_create_cycle",
            Self::ParentIsSearchNote(_) => "parent_is_search_note",
            Self::RootCannotHaveParent => "root_cannot_have_parent",
        }
    }
}

impl Display for InvariantViolation {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DuplicateBranch {
                note_id,
                parent_note_id,
            } => write!(f, "note {note_id} is already placed under {parent_note_id}"),
            Self::WouldCreateCycle {
                note_id,
                parent_note_id,
            } => write!(
                f,
                "placing note {note_id} under {parent_note_id} would create a cycle"
            ),
            Self::ParentIsSearchNote(id) => write!(f, "search note {id} cannot own children"),
            Self::RootCannotHaveParent => write!(f, "root note cannot have a parent"),
        }
    }
}

impl Error for InvariantViolation {}

/// Verdict of one check: `Ok(())` or the first violated invariant.
pub type Verdict = Result<(), InvariantViolation>;

/// Every note from which `origin` is reachable, `origin` included.
///
/// Computing it once lets a batch check many children against the same
/// parent. It stays valid while the batch only re-parents notes that are not
/// in the closure, which is exactly what passing checks guarantee.
#[derive(Debug, Clone)]
pub struct AncestorClosure {
    origin: NoteId,
    ancestors: HashSet<NoteId>,
}

impl AncestorClosure {
    /// Walks all parent branches upward from `origin`, breadth first.
    pub fn compute<V: GraphView + ?Sized>(view: &V, origin: &str) -> StoreResult<Self> {
        let mut ancestors = HashSet::new();
        let mut queue = VecDeque::new();
        ancestors.insert(origin.to_string());
        queue.push_back(origin.to_string());

        while let Some(current) = queue.pop_front() {
            for parent in view.parent_note_ids(&current)? {
                if ancestors.insert(parent.clone()) {
                    queue.push_back(parent);
                }
            }
        }

        Ok(Self {
            origin: origin.to_string(),
            ancestors,
        })
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    pub fn contains(&self, note_id: &str) -> bool {
        self.ancestors.contains(note_id)
    }

    pub fn len(&self) -> usize {
        self.ancestors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ancestors.is_empty()
    }
}

/// Checks inserting a branch for `note_id` under `parent_note_id`.
///
/// # Errors
/// - `StoreError::NotFound` when the parent note does not exist.
pub fn can_insert_branch<V: GraphView + ?Sized>(
    view: &V,
    note_id: &str,
    parent_note_id: &str,
) -> StoreResult<Verdict> {
    let closure = AncestorClosure::compute(view, parent_note_id)?;
    check_against_closure(view, &closure, note_id)
}

/// Same as [`can_insert_branch`], reusing a precomputed parent closure.
pub fn check_against_closure<V: GraphView + ?Sized>(
    view: &V,
    parent_closure: &AncestorClosure,
    note_id: &str,
) -> StoreResult<Verdict> {
    let parent_note_id = parent_closure.origin();
    if note_id == ROOT_NOTE_ID {
        return Ok(Err(InvariantViolation::RootCannotHaveParent));
    }

    let parent_type = view
        .note_type(parent_note_id)?
        .ok_or_else(|| StoreError::not_found(EntityName::Note, parent_note_id))?;
    if !parent_type.accepts_children() {
        return Ok(Err(InvariantViolation::ParentIsSearchNote(
            parent_note_id.to_string(),
        )));
    }

    if view.has_branch(note_id, parent_note_id)? {
        return Ok(Err(InvariantViolation::DuplicateBranch {
            note_id: note_id.to_string(),
            parent_note_id: parent_note_id.to_string(),
        }));
    }

    if parent_closure.contains(note_id) {
        return Ok(Err(InvariantViolation::WouldCreateCycle {
            note_id: note_id.to_string(),
            parent_note_id: parent_note_id.to_string(),
        }));
    }

    Ok(Ok(()))
}

#[cfg(test)]
mod tests {
    use super::{can_insert_branch, AncestorClosure, InvariantViolation};
    use crate::graph::snapshot::GraphSnapshot;
    use crate::model::branch::Branch;
    use crate::model::note::{Note, NoteType};

    fn note(id: &str, kind: NoteType) -> Note {
        Note::with_id(id, id, Vec::new(), kind, "text/html")
    }

    // root -> a -> b -> c, and root -> x -> c (c has two parents)
    fn diamond() -> GraphSnapshot {
        GraphSnapshot::from_parts(
            vec![
                note("root", NoteType::Text),
                note("a", NoteType::Text),
                note("b", NoteType::Text),
                note("c", NoteType::Text),
                note("x", NoteType::Text),
                note("s", NoteType::Search),
            ],
            vec![
                Branch::new("a", "root", 10),
                Branch::new("b", "a", 10),
                Branch::new("c", "b", 10),
                Branch::new("x", "root", 20),
                Branch::new("c", "x", 10),
                Branch::new("s", "root", 30),
            ],
            Vec::new(),
        )
    }

    #[test]
    fn closure_follows_every_parent_path() {
        let graph = diamond();
        let closure = AncestorClosure::compute(&graph, "c").unwrap();
        for id in ["c", "b", "a", "x", "root"] {
            assert!(closure.contains(id), "{id} should be an ancestor of c");
        }
        assert!(!closure.contains("s"));
    }

    #[test]
    fn rejects_cycle_reachable_through_second_parent() {
        let graph = diamond();
        let verdict = can_insert_branch(&graph, "x", "c").unwrap();
        assert_eq!(
            verdict,
            Err(InvariantViolation::WouldCreateCycle {
                note_id: "x".to_string(),
                parent_note_id: "c".to_string(),
            })
        );
    }

    #[test]
    fn rejects_self_parenting() {
        let graph = diamond();
        let verdict = can_insert_branch(&graph, "a", "a").unwrap();
        assert!(matches!(
            verdict,
            Err(InvariantViolation::WouldCreateCycle { .. })
        ));
    }

    #[test]
    fn rejects_duplicate_search_parent_and_root_child() {
        let graph = diamond();
        assert!(matches!(
            can_insert_branch(&graph, "c", "b").unwrap(),
            Err(InvariantViolation::DuplicateBranch { .. })
        ));
        assert_eq!(
            can_insert_branch(&graph, "a", "s").unwrap(),
            Err(InvariantViolation::ParentIsSearchNote("s".to_string()))
        );
        assert_eq!(
            can_insert_branch(&graph, "root", "a").unwrap(),
            Err(InvariantViolation::RootCannotHaveParent)
        );
    }

    #[test]
    fn accepts_clone_into_unrelated_subtree() {
        let graph = diamond();
        assert_eq!(can_insert_branch(&graph, "b", "x").unwrap(), Ok(()));
    }

    #[test]
    fn missing_parent_is_not_found() {
        let graph = diamond();
        assert!(can_insert_branch(&graph, "a", "ghost").is_err());
    }
}
