//! Change log contracts consumed by sync transports.
//!
//! # Responsibility
//! - Serve local records in sequence order, restartable from any id.
//! - Apply remote records with last-write-wins resolution.
//!
//! # Invariants
//! - An incoming record is applied at most once, keyed by
//!   `(source_id, origin_sequence_id)`; echoes of local records are ignored.
//! - An incoming record loses against any local record for the same entity
//!   with a greater or equal `(timestamp, source_id)`.
//! - Entity write and record append commit together.
//! - A branch tombstone removes only that branch. Cascades arrive as their
//!   own tombstones from the originating instance, in sequence order.
//! - A branch that would close a cycle competes with the branches on that
//!   cycle: the one with the lowest `(timestamp, source_id, branch_id)`
//!   loses, so every replica drops the same one.
//! - Applying a record never leaves a live non-root note without a parent;
//!   such a note gets its most recent valid placement back (or the end of
//!   the root) through a logged local write.

use crate::graph::invariants::{AncestorClosure, GraphView, InvariantViolation};
use crate::model::branch::{branch_id_for, Branch, BranchId, NOTE_POSITION_STEP};
use crate::model::change::{ChangeLogRecord, EntityName, EntityRow, SequenceId};
use crate::model::note::{is_valid_note_id, NoteId, NoteType, ROOT_NOTE_ID};
use crate::repo::change_log_repo::{self, RecordDraft};
use crate::repo::entity_store::{
    erase_row, upsert_row, EntityStore, SqliteEntityStore, StoreError, StoreResult,
};
use crate::repo::write_scope::with_write_scope;
use log::{debug, info};
use rusqlite::Connection;
use std::collections::{HashSet, VecDeque};
use std::error::Error;
use std::fmt::{Display, Formatter};

pub type ChangeLogResult<T> = Result<T, ChangeLogError>;

#[derive(Debug)]
pub enum ChangeLogError {
    /// Record is internally inconsistent (payload missing or mismatched).
    InvalidRecord(String),
    Storage(StoreError),
}

impl Display for ChangeLogError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidRecord(message) => write!(f, "invalid change record: {message}"),
            Self::Storage(err) => write!(f, "{err}"),
        }
    }
}

impl Error for ChangeLogError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::InvalidRecord(_) => None,
            Self::Storage(err) => Some(err),
        }
    }
}

impl From<StoreError> for ChangeLogError {
    fn from(value: StoreError) -> Self {
        Self::Storage(value)
    }
}

impl From<rusqlite::Error> for ChangeLogError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Storage(value.into())
    }
}

/// What `apply_incoming` did with a record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Entity written and record appended locally.
    Applied,
    /// Record was already applied, or originated here.
    Duplicate,
    /// A newer local change for the entity wins.
    Stale,
    /// Applying would break a graph invariant and the record lost; it is not
    /// logged.
    Rejected(InvariantViolation),
    /// The branch joins a note erased here; it is not logged.
    Dangling,
}

impl ApplyOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Applied => "applied",
            Self::Duplicate => "duplicate",
            Self::Stale => "stale",
            Self::Rejected(_) => "rejected",
            Self::Dangling => "dangling",
        }
    }
}

/// Change log bound to one connection.
pub struct ChangeLog<'conn> {
    store: SqliteEntityStore<'conn>,
}

impl<'conn> ChangeLog<'conn> {
    pub fn try_new(conn: &'conn Connection) -> ChangeLogResult<Self> {
        Ok(Self {
            store: SqliteEntityStore::try_new(conn)?,
        })
    }

    pub fn connection(&self) -> &'conn Connection {
        self.store.connection()
    }

    /// Identifier of this instance.
    pub fn source_id(&self) -> &str {
        self.store.source_id()
    }

    /// Highest local sequence id, `0` for an empty log.
    pub fn last_sequence_id(&self) -> ChangeLogResult<SequenceId> {
        Ok(change_log_repo::last_sequence_id(self.connection())?)
    }

    /// Every record after `after`, ascending.
    pub fn records_since(&self, after: SequenceId) -> ChangeLogResult<Vec<ChangeLogRecord>> {
        Ok(change_log_repo::records_since(self.connection(), after, None)?)
    }

    /// At most `limit` records after `after`, ascending.
    pub fn records_page(
        &self,
        after: SequenceId,
        limit: u32,
    ) -> ChangeLogResult<Vec<ChangeLogRecord>> {
        Ok(change_log_repo::records_since(
            self.connection(),
            after,
            Some(limit),
        )?)
    }

    /// Applies one remote record atomically.
    pub fn apply_incoming(&self, record: &ChangeLogRecord) -> ChangeLogResult<ApplyOutcome> {
        validate_record(record)?;
        let conn = self.connection();

        let outcome = with_write_scope::<_, ChangeLogError, _>(conn, || {
            if record.source_id == self.source_id()
                || change_log_repo::contains_origin(
                    conn,
                    &record.source_id,
                    record.origin_sequence_id,
                )?
            {
                return Ok(ApplyOutcome::Duplicate);
            }

            change_log_repo::observe_timestamp(conn, record.timestamp)?;
            if let Some((timestamp, source_id)) =
                change_log_repo::latest_precedence(conn, record.entity_name, &record.entity_id)?
            {
                if (timestamp, source_id.as_str()) >= record.precedence() {
                    return Ok(ApplyOutcome::Stale);
                }
            }

            match record.payload.as_ref() {
                Some(EntityRow::Branch(branch)) => return self.apply_branch(record, branch),
                Some(row) => {
                    upsert_row(conn, row)?;
                    self.append_incoming(record)?;
                }
                None => {
                    let unparented = self.erase_incoming(record.entity_name, &record.entity_id)?;
                    self.append_incoming(record)?;
                    for note_id in unparented {
                        self.restore_placement(&note_id)?;
                    }
                }
            }
            Ok(ApplyOutcome::Applied)
        })?;

        debug!(
            "event=change_apply module=sync status=ok outcome={} entity={} source_id={} origin_sequence_id={}",
            outcome.as_str(),
            record.entity_name.as_str(),
            record.source_id,
            record.origin_sequence_id
        );
        Ok(outcome)
    }

    fn append_incoming(&self, record: &ChangeLogRecord) -> ChangeLogResult<SequenceId> {
        Ok(change_log_repo::append_record(
            self.connection(),
            &RecordDraft {
                entity_name: record.entity_name,
                entity_id: &record.entity_id,
                source_id: &record.source_id,
                origin_sequence_id: Some(record.origin_sequence_id),
                timestamp: record.timestamp,
                is_erased: record.is_erased,
                payload: record.payload.as_ref(),
            },
        )?)
    }

    /// Writes an incoming branch. Only brand-new pairs can close a cycle or
    /// dangle; an existing branch id already binds the same live pair.
    fn apply_branch(
        &self,
        record: &ChangeLogRecord,
        branch: &Branch,
    ) -> ChangeLogResult<ApplyOutcome> {
        let mut displaced = Vec::new();
        if self.store.get_branch(&branch.branch_id)?.is_none() {
            if branch.note_id == ROOT_NOTE_ID {
                return Ok(ApplyOutcome::Rejected(
                    InvariantViolation::RootCannotHaveParent,
                ));
            }
            if self.store.note_type(&branch.note_id)?.is_none() {
                return Ok(ApplyOutcome::Dangling);
            }
            if self.store.note_type(&branch.parent_note_id)?.is_none() {
                self.restore_placement(&branch.note_id)?;
                return Ok(ApplyOutcome::Dangling);
            }
            match self.resolve_cycle(branch, record)? {
                CycleResolution::Insert(losers) => displaced = losers,
                CycleResolution::Lose(violation) => {
                    self.restore_placement(&branch.note_id)?;
                    return Ok(ApplyOutcome::Rejected(violation));
                }
            }
        }

        for loser in &displaced {
            self.store.delete(EntityName::Branch, &loser.branch_id)?;
            info!(
                "event=cycle_break module=sync status=ok dropped_branch_id={} winner_branch_id={} source_id={}",
                loser.branch_id, branch.branch_id, record.source_id
            );
        }
        upsert_row(self.connection(), &EntityRow::Branch(branch.clone()))?;
        self.append_incoming(record)?;
        self.repair_sibling_positions(branch, &record.source_id)?;
        for loser in displaced {
            self.restore_placement(&loser.note_id)?;
        }
        Ok(ApplyOutcome::Applied)
    }

    /// Decides which branches on the cycles `incoming` would close give way.
    ///
    /// Repeatedly takes the lowest-ranked branch across all closed cycles;
    /// `incoming` loses as soon as it is that branch. Nothing is written.
    fn resolve_cycle(
        &self,
        incoming: &Branch,
        record: &ChangeLogRecord,
    ) -> ChangeLogResult<CycleResolution> {
        let violation = || InvariantViolation::WouldCreateCycle {
            note_id: incoming.note_id.clone(),
            parent_note_id: incoming.parent_note_id.clone(),
        };
        if incoming.note_id == incoming.parent_note_id {
            return Ok(CycleResolution::Lose(violation()));
        }

        let incoming_rank: BranchRank = (
            record.timestamp,
            record.source_id.clone(),
            incoming.branch_id.clone(),
        );
        let mut displaced: Vec<Branch> = Vec::new();
        loop {
            let cycle = self.cycle_branches(incoming, &displaced)?;
            if cycle.is_empty() {
                return Ok(CycleResolution::Insert(displaced));
            }
            let mut weakest: Option<(BranchRank, Branch)> = None;
            for branch in cycle {
                let rank = self.rank(&branch)?;
                if weakest.as_ref().map_or(true, |(lowest, _)| rank < *lowest) {
                    weakest = Some((rank, branch));
                }
            }
            match weakest {
                Some((rank, branch)) if rank < incoming_rank => displaced.push(branch),
                _ => return Ok(CycleResolution::Lose(violation())),
            }
        }
    }

    /// Live branches on a path from `incoming.note_id` down to its new
    /// parent, ignoring `displaced`. Empty when no cycle would close.
    fn cycle_branches(&self, incoming: &Branch, displaced: &[Branch]) -> ChangeLogResult<Vec<Branch>> {
        let removed = displaced
            .iter()
            .map(|branch| branch.branch_id.as_str())
            .collect::<HashSet<_>>();
        let view = WithoutBranches {
            inner: &self.store,
            removed: &removed,
        };
        let closure = AncestorClosure::compute(&view, &incoming.parent_note_id)?;
        if !closure.contains(&incoming.note_id) {
            return Ok(Vec::new());
        }

        // Every ancestor of the new parent reachable from the note lies on a cycle.
        let mut on_cycle = Vec::new();
        let mut visited = HashSet::from([incoming.note_id.clone()]);
        let mut queue = VecDeque::from([incoming.note_id.clone()]);
        while let Some(current) = queue.pop_front() {
            for child in self.store.child_branches(&current)? {
                if removed.contains(child.branch_id.as_str()) || !closure.contains(&child.note_id)
                {
                    continue;
                }
                if visited.insert(child.note_id.clone()) {
                    queue.push_back(child.note_id.clone());
                }
                on_cycle.push(child);
            }
        }
        Ok(on_cycle)
    }

    fn rank(&self, branch: &Branch) -> ChangeLogResult<BranchRank> {
        let (timestamp, source_id) = change_log_repo::latest_precedence(
            self.connection(),
            EntityName::Branch,
            &branch.branch_id,
        )?
        .unwrap_or((i64::MIN, String::new()));
        Ok((timestamp, source_id, branch.branch_id.clone()))
    }

    /// Gives a live note without parents a placement again: its most recent
    /// logged placement that is still valid here, else the end of the root.
    fn restore_placement(&self, note_id: &str) -> ChangeLogResult<()> {
        if note_id == ROOT_NOTE_ID
            || self.store.note_type(note_id)?.is_none()
            || !self.store.parent_branches(note_id)?.is_empty()
        {
            return Ok(());
        }

        let mut previous_placement = None;
        for previous in change_log_repo::branch_history(self.connection(), note_id)? {
            let accepts = self
                .store
                .note_type(&previous.parent_note_id)?
                .is_some_and(NoteType::accepts_children);
            if accepts
                && !AncestorClosure::compute(&self.store, &previous.parent_note_id)?
                    .contains(note_id)
            {
                previous_placement = Some(previous);
                break;
            }
        }

        let restored = match previous_placement {
            Some(previous) => {
                let position =
                    self.free_position(&previous.parent_note_id, previous.note_position)?;
                previous.reparented(&previous.parent_note_id, position)
            }
            None => {
                let position = self.free_position(ROOT_NOTE_ID, i64::MIN)?;
                Branch::new(note_id, ROOT_NOTE_ID, position)
            }
        };
        info!(
            "event=placement_restore module=sync status=ok note_id={} parent_note_id={}",
            note_id, restored.parent_note_id
        );
        self.store.put_branch(restored)?;
        Ok(())
    }

    /// `wanted` when no child of `parent_note_id` sits there, else one step
    /// past the last child.
    fn free_position(&self, parent_note_id: &str, wanted: i64) -> ChangeLogResult<i64> {
        let siblings = self.store.child_branches(parent_note_id)?;
        if wanted != i64::MIN && siblings.iter().all(|sibling| sibling.note_position != wanted) {
            return Ok(wanted);
        }
        let last = siblings
            .iter()
            .map(|sibling| sibling.note_position)
            .max()
            .unwrap_or(0);
        Ok(last + NOTE_POSITION_STEP)
    }

    /// Erases the target row. Erasing a note also drops attributes and
    /// branches still pointing at it, without logging, so no dangling
    /// references survive.
    ///
    /// Returns notes that may have lost their last parent.
    fn erase_incoming(&self, entity: EntityName, id: &str) -> ChangeLogResult<Vec<NoteId>> {
        let conn = self.connection();
        let mut unparented = Vec::new();
        match entity {
            EntityName::Note => {
                for attribute in self.store.note_attributes(id)? {
                    erase_row(conn, EntityName::Attribute, &attribute.attribute_id)?;
                }
                let parents = self.store.parent_branches(id)?;
                let children = self.store.child_branches(id)?;
                for branch in parents.iter().chain(&children) {
                    erase_row(conn, EntityName::Branch, &branch.branch_id)?;
                }
                unparented.extend(children.into_iter().map(|branch| branch.note_id));
            }
            EntityName::Branch => {
                if let Some(branch) = self.store.get_branch(id)? {
                    unparented.push(branch.note_id);
                }
            }
            EntityName::Attribute => {}
        }
        erase_row(conn, entity, id)?;
        Ok(unparented)
    }

    /// Resolves a position collision between `incoming` and a sibling last
    /// written by another instance: the branch with the smallest id keeps
    /// the slot, every other one moves to the end. Both replicas pick the
    /// same branch to move.
    ///
    /// Collisions among branches last written by the record's own source are
    /// left alone: one instance never commits colliding positions, so its
    /// later records resolve them.
    fn repair_sibling_positions(&self, incoming: &Branch, source_id: &str) -> ChangeLogResult<()> {
        let conn = self.connection();
        let siblings = self.store.child_branches(&incoming.parent_note_id)?;
        let mut colliding = siblings
            .iter()
            .filter(|sibling| sibling.note_position == incoming.note_position)
            .cloned()
            .collect::<Vec<_>>();
        if colliding.len() < 2 {
            return Ok(());
        }

        let mut foreign = false;
        for sibling in &colliding {
            if sibling.branch_id == incoming.branch_id {
                continue;
            }
            let writer =
                change_log_repo::latest_precedence(conn, EntityName::Branch, &sibling.branch_id)?;
            if writer.map_or(true, |(_, writer)| writer != source_id) {
                foreign = true;
                break;
            }
        }
        if !foreign {
            return Ok(());
        }

        colliding.sort_by(|left, right| left.branch_id.cmp(&right.branch_id));
        let mut last = siblings
            .iter()
            .map(|sibling| sibling.note_position)
            .max()
            .unwrap_or(0);
        for mut branch in colliding.into_iter().skip(1) {
            last += NOTE_POSITION_STEP;
            branch.note_position = last;
            self.store.put_branch(branch)?;
        }
        Ok(())
    }
}

/// `(timestamp, source_id, branch_id)` of a branch's winning record.
type BranchRank = (i64, String, BranchId);

enum CycleResolution {
    /// Insert after deleting these branches (possibly none).
    Insert(Vec<Branch>),
    Lose(InvariantViolation),
}

/// Graph view with some branches treated as already deleted.
struct WithoutBranches<'a, V> {
    inner: &'a V,
    removed: &'a HashSet<&'a str>,
}

impl<V: GraphView> GraphView for WithoutBranches<'_, V> {
    fn note_type(&self, note_id: &str) -> StoreResult<Option<NoteType>> {
        self.inner.note_type(note_id)
    }

    fn parent_note_ids(&self, note_id: &str) -> StoreResult<Vec<NoteId>> {
        Ok(self
            .inner
            .parent_note_ids(note_id)?
            .into_iter()
            .filter(|parent| !self.removed.contains(branch_id_for(parent, note_id).as_str()))
            .collect())
    }

    fn has_branch(&self, note_id: &str, parent_note_id: &str) -> StoreResult<bool> {
        Ok(self.inner.has_branch(note_id, parent_note_id)?
            && !self
                .removed
                .contains(branch_id_for(parent_note_id, note_id).as_str()))
    }
}

fn validate_record(record: &ChangeLogRecord) -> ChangeLogResult<()> {
    match (&record.payload, record.is_erased) {
        (None, true) => Ok(()),
        (Some(_), true) => Err(ChangeLogError::InvalidRecord(format!(
            "tombstone for {} {} carries a payload",
            record.entity_name.as_str(),
            record.entity_id
        ))),
        (None, false) => Err(ChangeLogError::InvalidRecord(format!(
            "upsert for {} {} has no payload",
            record.entity_name.as_str(),
            record.entity_id
        ))),
        (Some(row), false) => {
            if row.entity_name() != record.entity_name || row.entity_id() != record.entity_id {
                return Err(ChangeLogError::InvalidRecord(format!(
                    "payload {} {} does not match record {} {}",
                    row.entity_name().as_str(),
                    row.entity_id(),
                    record.entity_name.as_str(),
                    record.entity_id
                )));
            }
            match row {
                EntityRow::Note(note) if !is_valid_note_id(&note.note_id) => {
                    Err(ChangeLogError::InvalidRecord(format!(
                        "note id `{}` is empty or contains `_`",
                        note.note_id
                    )))
                }
                EntityRow::Branch(branch) if !branch.has_consistent_id() => {
                    Err(ChangeLogError::InvalidRecord(format!(
                        "branch id {} does not match a valid pair",
                        branch.branch_id
                    )))
                }
                _ => Ok(()),
            }
        }
    }
}
