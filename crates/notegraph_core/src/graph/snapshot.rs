//! In-memory, point-in-time copy of the note graph.
//!
//! # Responsibility
//! - Serve export-style subtree reads that never observe a relocation half
//!   way through.
//! - Back invariant checks in tests and compare replicas for isomorphism.
//!
//! # Invariants
//! - Adjacency indexes (by parent, by note) always mirror `branches`.

use crate::graph::invariants::GraphView;
use crate::model::attribute::{Attribute, AttributeId};
use crate::model::branch::{Branch, BranchId};
use crate::model::note::{Note, NoteId, NoteType};
use crate::repo::entity_store::{
    load_all_attributes, load_all_branches, load_all_notes, StoreError, StoreResult,
};
use crate::repo::write_scope::with_read_snapshot;
use rusqlite::Connection;
use std::collections::{BTreeMap, BTreeSet, VecDeque};

/// Notes, branches, and attributes as of one committed state.
#[derive(Debug, Clone, Default)]
pub struct GraphSnapshot {
    notes: BTreeMap<NoteId, Note>,
    branches: BTreeMap<BranchId, Branch>,
    attributes: BTreeMap<AttributeId, Attribute>,
    children_by_parent: BTreeMap<NoteId, BTreeSet<BranchId>>,
    parents_by_note: BTreeMap<NoteId, BTreeSet<NoteId>>,
}

impl GraphSnapshot {
    /// Reads the whole graph inside one read transaction.
    pub fn load(conn: &Connection) -> StoreResult<Self> {
        with_read_snapshot::<_, StoreError, _>(conn, || {
            Ok(Self::from_parts(
                load_all_notes(conn)?,
                load_all_branches(conn)?,
                load_all_attributes(conn)?,
            ))
        })
    }

    pub fn from_parts(
        notes: impl IntoIterator<Item = Note>,
        branches: impl IntoIterator<Item = Branch>,
        attributes: impl IntoIterator<Item = Attribute>,
    ) -> Self {
        let mut snapshot = Self {
            notes: notes
                .into_iter()
                .map(|note| (note.note_id.clone(), note))
                .collect(),
            attributes: attributes
                .into_iter()
                .map(|attribute| (attribute.attribute_id.clone(), attribute))
                .collect(),
            ..Self::default()
        };
        for branch in branches {
            snapshot.insert_branch(branch);
        }
        snapshot
    }

    /// Adds or replaces a branch, keeping the adjacency indexes current.
    pub fn insert_branch(&mut self, branch: Branch) {
        self.children_by_parent
            .entry(branch.parent_note_id.clone())
            .or_default()
            .insert(branch.branch_id.clone());
        self.parents_by_note
            .entry(branch.note_id.clone())
            .or_default()
            .insert(branch.parent_note_id.clone());
        self.branches.insert(branch.branch_id.clone(), branch);
    }

    pub fn note(&self, note_id: &str) -> Option<&Note> {
        self.notes.get(note_id)
    }

    pub fn branch(&self, branch_id: &str) -> Option<&Branch> {
        self.branches.get(branch_id)
    }

    pub fn notes(&self) -> impl Iterator<Item = &Note> {
        self.notes.values()
    }

    pub fn branches(&self) -> impl Iterator<Item = &Branch> {
        self.branches.values()
    }

    pub fn attributes(&self) -> impl Iterator<Item = &Attribute> {
        self.attributes.values()
    }

    /// Attributes owned by `note_id`, ordered by id.
    pub fn note_attributes(&self, note_id: &str) -> Vec<&Attribute> {
        self.attributes
            .values()
            .filter(|attribute| attribute.note_id == note_id)
            .collect()
    }

    /// Child branches of `parent_note_id` in sibling order.
    pub fn children(&self, parent_note_id: &str) -> Vec<&Branch> {
        let mut children = self
            .children_by_parent
            .get(parent_note_id)
            .into_iter()
            .flatten()
            .filter_map(|branch_id| self.branches.get(branch_id))
            .collect::<Vec<_>>();
        children.sort_by(|left, right| {
            left.note_position
                .cmp(&right.note_position)
                .then_with(|| left.branch_id.cmp(&right.branch_id))
        });
        children
    }

    /// Everything reachable from `root_note_id` through branches.
    ///
    /// Branches leading into the root from above are not part of the result.
    /// Returns an empty snapshot when the root note is absent.
    pub fn subtree(&self, root_note_id: &str) -> Self {
        let Some(root) = self.notes.get(root_note_id) else {
            return Self::default();
        };

        let mut visited = BTreeSet::new();
        let mut queue = VecDeque::new();
        let mut notes = vec![root.clone()];
        let mut branches = Vec::new();
        visited.insert(root_note_id.to_string());
        queue.push_back(root_note_id.to_string());

        while let Some(current) = queue.pop_front() {
            for branch in self.children(&current) {
                branches.push(branch.clone());
                if visited.insert(branch.note_id.clone()) {
                    if let Some(note) = self.notes.get(&branch.note_id) {
                        notes.push(note.clone());
                    }
                    queue.push_back(branch.note_id.clone());
                }
            }
        }

        let attributes = self
            .attributes
            .values()
            .filter(|attribute| visited.contains(&attribute.note_id))
            .cloned()
            .collect::<Vec<_>>();
        Self::from_parts(notes, branches, attributes)
    }

    pub fn note_count(&self) -> usize {
        self.notes.len()
    }

    pub fn branch_count(&self) -> usize {
        self.branches.len()
    }
}

impl PartialEq for GraphSnapshot {
    fn eq(&self, other: &Self) -> bool {
        self.notes == other.notes
            && self.branches == other.branches
            && self.attributes == other.attributes
    }
}

impl Eq for GraphSnapshot {}

impl GraphView for GraphSnapshot {
    fn note_type(&self, note_id: &str) -> StoreResult<Option<NoteType>> {
        Ok(self.notes.get(note_id).map(|note| note.note_type))
    }

    fn parent_note_ids(&self, note_id: &str) -> StoreResult<Vec<NoteId>> {
        Ok(self
            .parents_by_note
            .get(note_id)
            .map(|parents| parents.iter().cloned().collect())
            .unwrap_or_default())
    }

    fn has_branch(&self, note_id: &str, parent_note_id: &str) -> StoreResult<bool> {
        Ok(self
            .parents_by_note
            .get(note_id)
            .is_some_and(|parents| parents.contains(parent_note_id)))
    }
}

#[cfg(test)]
mod tests {
    use super::GraphSnapshot;
    use crate::model::attribute::Attribute;
    use crate::model::branch::Branch;
    use crate::model::note::{Note, NoteType};

    fn text(id: &str) -> Note {
        Note::with_id(id, id.to_uppercase(), Vec::new(), NoteType::Text, "text/html")
    }

    fn sample() -> GraphSnapshot {
        GraphSnapshot::from_parts(
            ["root", "a", "b", "c", "d"].map(text),
            vec![
                Branch::new("a", "root", 20),
                Branch::new("d", "root", 10),
                Branch::new("b", "a", 10),
                Branch::new("c", "b", 10),
                Branch::new("c", "a", 20),
            ],
            vec![Attribute::label("c", "color", "red"), Attribute::label("d", "k", "v")],
        )
    }

    #[test]
    fn children_are_listed_in_position_order() {
        let snapshot = sample();
        let ids = snapshot
            .children("root")
            .into_iter()
            .map(|branch| branch.note_id.as_str())
            .collect::<Vec<_>>();
        assert_eq!(ids, vec!["d", "a"]);
    }

    #[test]
    fn subtree_keeps_shared_note_once_with_both_branches() {
        let subtree = sample().subtree("a");
        assert_eq!(subtree.note_count(), 3);
        assert_eq!(subtree.branch_count(), 3);
        assert_eq!(subtree.note_attributes("c").len(), 1);
        assert!(subtree.note("d").is_none());
        assert!(subtree.branch("root_a").is_none());
    }

    #[test]
    fn subtree_of_missing_root_is_empty() {
        assert_eq!(sample().subtree("ghost"), GraphSnapshot::default());
    }
}
