//! Entity store contract and SQLite implementation.
//!
//! # Responsibility
//! - Provide keyed CRUD over notes, branches, and attributes.
//! - Append exactly one change-log record per `put`/`delete`, atomically
//!   with the entity write.
//! - Serve adjacency reads (children by parent, branches by note) for the
//!   relocation engine and invariant checker.
//!
//! # Invariants
//! - The store holds no relocation logic; it never cascades.
//! - Reads on the same connection always observe prior writes.
//! - Child listing is deterministic: `note_position ASC, branch_id ASC`.

use crate::db::DbError;
use crate::graph::invariants::GraphView;
use crate::model::attribute::Attribute;
use crate::model::branch::{branch_id_for, Branch};
use crate::model::change::{EntityName, EntityRow, SequenceId};
use crate::model::note::{is_valid_note_id, Note, NoteId, NoteType};
use crate::repo::change_log_repo::{self, RecordDraft};
use crate::repo::schema::{ensure_connection_ready, TableSpec};
use crate::repo::write_scope::with_write_scope;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::error::Error;
use std::fmt::{Display, Formatter};

const NOTE_SELECT_SQL: &str = "SELECT
    note_id,
    title,
    content,
    type,
    mime,
    is_protected,
    date_created,
    date_modified
FROM notes";

const BRANCH_SELECT_SQL: &str = "SELECT
    branch_id,
    note_id,
    parent_note_id,
    prefix,
    note_position,
    date_modified
FROM branches";

const ATTRIBUTE_SELECT_SQL: &str = "SELECT
    attribute_id,
    note_id,
    name,
    value,
    is_inheritable,
    date_modified
FROM attributes";

const REQUIRED_TABLES: &[TableSpec] = &[
    TableSpec {
        table: "notes",
        columns: &[
            "note_id",
            "title",
            "content",
            "type",
            "mime",
            "is_protected",
            "date_created",
            "date_modified",
        ],
    },
    TableSpec {
        table: "branches",
        columns: &[
            "branch_id",
            "note_id",
            "parent_note_id",
            "prefix",
            "note_position",
            "date_modified",
        ],
    },
    TableSpec {
        table: "attributes",
        columns: &[
            "attribute_id",
            "note_id",
            "name",
            "value",
            "is_inheritable",
            "date_modified",
        ],
    },
    TableSpec {
        table: "entity_changes",
        columns: &[
            "sequence_id",
            "entity_name",
            "entity_id",
            "source_id",
            "origin_sequence_id",
            "timestamp",
            "is_erased",
            "payload",
        ],
    },
    TableSpec {
        table: "instance_meta",
        columns: &["key", "value"],
    },
];

/// Result type used by entity store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors from entity store operations.
#[derive(Debug)]
pub enum StoreError {
    /// Underlying SQLite/bootstrap error.
    Db(DbError),
    /// Referenced entity does not exist.
    NotFound { entity: EntityName, id: String },
    /// Connection schema is not at the expected migrated version.
    UninitializedConnection {
        expected_version: u32,
        actual_version: u32,
    },
    /// Required table is missing.
    MissingRequiredTable(&'static str),
    /// Required column is missing from expected table.
    MissingRequiredColumn {
        table: &'static str,
        column: &'static str,
    },
    /// Persisted or supplied data cannot be converted to a valid model.
    InvalidData(String),
}

impl StoreError {
    pub(crate) fn not_found(entity: EntityName, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            id: id.into(),
        }
    }
}

impl Display for StoreError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Db(err) => write!(f, "{err}"),
            Self::NotFound { entity, id } => write!(f, "{} not found: {id}", entity.as_str()),
            Self::UninitializedConnection {
                expected_version,
                actual_version,
            } => write!(
                f,
                "entity store requires schema version {expected_version}, got {actual_version}"
            ),
            Self::MissingRequiredTable(table) => {
                write!(f, "entity store requires table `{table}`")
            }
            Self::MissingRequiredColumn { table, column } => write!(
                f,
                "entity store requires column `{column}` in table `{table}`"
            ),
            Self::InvalidData(message) => write!(f, "invalid entity data: {message}"),
        }
    }
}

impl Error for StoreError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Db(err) => Some(err),
            _ => None,
        }
    }
}

impl From<DbError> for StoreError {
    fn from(value: DbError) -> Self {
        Self::Db(value)
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Db(DbError::Sqlite(value))
    }
}

/// Durable keyed storage for graph entities.
pub trait EntityStore {
    /// Identifier of the writing instance stamped on every local record.
    fn source_id(&self) -> &str;
    fn get_note(&self, note_id: &str) -> StoreResult<Option<Note>>;
    fn get_branch(&self, branch_id: &str) -> StoreResult<Option<Branch>>;
    fn get_attribute(&self, attribute_id: &str) -> StoreResult<Option<Attribute>>;
    /// Upserts one entity and appends its change record; returns the record's sequence id.
    fn put(&self, row: EntityRow) -> StoreResult<SequenceId>;
    /// Removes one entity and appends a tombstone; returns the tombstone's sequence id.
    fn delete(&self, entity: EntityName, id: &str) -> StoreResult<SequenceId>;
    /// Branches whose parent is `parent_note_id`, in sibling order.
    fn child_branches(&self, parent_note_id: &str) -> StoreResult<Vec<Branch>>;
    /// Branches placing `note_id` somewhere in the tree.
    fn parent_branches(&self, note_id: &str) -> StoreResult<Vec<Branch>>;
    fn note_attributes(&self, note_id: &str) -> StoreResult<Vec<Attribute>>;
    /// Runs `f` so that every write inside it commits together or not at all.
    fn atomically<T, E, F>(&self, f: F) -> Result<T, E>
    where
        E: From<StoreError>,
        F: FnOnce() -> Result<T, E>;

    /// Loads any entity by name, failing with `NotFound` when absent.
    fn get(&self, entity: EntityName, id: &str) -> StoreResult<EntityRow> {
        let row = match entity {
            EntityName::Note => self.get_note(id)?.map(EntityRow::Note),
            EntityName::Branch => self.get_branch(id)?.map(EntityRow::Branch),
            EntityName::Attribute => self.get_attribute(id)?.map(EntityRow::Attribute),
        };
        row.ok_or_else(|| StoreError::not_found(entity, id))
    }

    fn put_note(&self, note: Note) -> StoreResult<SequenceId> {
        self.put(EntityRow::Note(note))
    }

    fn put_branch(&self, branch: Branch) -> StoreResult<SequenceId> {
        self.put(EntityRow::Branch(branch))
    }

    fn put_attribute(&self, attribute: Attribute) -> StoreResult<SequenceId> {
        self.put(EntityRow::Attribute(attribute))
    }

    /// Branch binding `note_id` under `parent_note_id`, if any.
    fn find_branch(&self, note_id: &str, parent_note_id: &str) -> StoreResult<Option<Branch>> {
        self.get_branch(&branch_id_for(parent_note_id, note_id))
    }
}

/// SQLite-backed entity store bound to one connection.
pub struct SqliteEntityStore<'conn> {
    conn: &'conn Connection,
    source_id: String,
}

impl<'conn> SqliteEntityStore<'conn> {
    /// Creates store from migrated connection.
    pub fn try_new(conn: &'conn Connection) -> StoreResult<Self> {
        ensure_connection_ready(conn, REQUIRED_TABLES)?;
        let source_id = change_log_repo::local_source_id(conn)?;
        Ok(Self { conn, source_id })
    }

    pub fn connection(&self) -> &'conn Connection {
        self.conn
    }
}

impl EntityStore for SqliteEntityStore<'_> {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn get_note(&self, note_id: &str) -> StoreResult<Option<Note>> {
        load_note(self.conn, note_id)
    }

    fn get_branch(&self, branch_id: &str) -> StoreResult<Option<Branch>> {
        load_branch(self.conn, branch_id)
    }

    fn get_attribute(&self, attribute_id: &str) -> StoreResult<Option<Attribute>> {
        let mut stmt = self
            .conn
            .prepare(&format!("{ATTRIBUTE_SELECT_SQL} WHERE attribute_id = ?1;"))?;
        let mut rows = stmt.query([attribute_id])?;
        if let Some(row) = rows.next()? {
            return Ok(Some(parse_attribute_row(row)?));
        }
        Ok(None)
    }

    fn put(&self, mut row: EntityRow) -> StoreResult<SequenceId> {
        with_write_scope(self.conn, || {
            let timestamp = change_log_repo::next_timestamp(self.conn)?;
            row.set_date_modified(timestamp);
            upsert_row(self.conn, &row)?;
            change_log_repo::append_record(
                self.conn,
                &RecordDraft {
                    entity_name: row.entity_name(),
                    entity_id: row.entity_id(),
                    source_id: &self.source_id,
                    origin_sequence_id: None,
                    timestamp,
                    is_erased: false,
                    payload: Some(&row),
                },
            )
        })
    }

    fn delete(&self, entity: EntityName, id: &str) -> StoreResult<SequenceId> {
        with_write_scope(self.conn, || {
            if !erase_row(self.conn, entity, id)? {
                return Err(StoreError::not_found(entity, id));
            }
            let timestamp = change_log_repo::next_timestamp(self.conn)?;
            change_log_repo::append_record(
                self.conn,
                &RecordDraft {
                    entity_name: entity,
                    entity_id: id,
                    source_id: &self.source_id,
                    origin_sequence_id: None,
                    timestamp,
                    is_erased: true,
                    payload: None,
                },
            )
        })
    }

    fn child_branches(&self, parent_note_id: &str) -> StoreResult<Vec<Branch>> {
        query_branches(
            self.conn,
            &format!(
                "{BRANCH_SELECT_SQL}
                 WHERE parent_note_id = ?1
                 ORDER BY note_position ASC, branch_id ASC;"
            ),
            parent_note_id,
        )
    }

    fn parent_branches(&self, note_id: &str) -> StoreResult<Vec<Branch>> {
        query_branches(
            self.conn,
            &format!(
                "{BRANCH_SELECT_SQL}
                 WHERE note_id = ?1
                 ORDER BY parent_note_id ASC;"
            ),
            note_id,
        )
    }

    fn note_attributes(&self, note_id: &str) -> StoreResult<Vec<Attribute>> {
        let mut stmt = self.conn.prepare(&format!(
            "{ATTRIBUTE_SELECT_SQL}
             WHERE note_id = ?1
             ORDER BY name ASC, attribute_id ASC;"
        ))?;
        let mut rows = stmt.query([note_id])?;
        let mut items = Vec::new();
        while let Some(row) = rows.next()? {
            items.push(parse_attribute_row(row)?);
        }
        Ok(items)
    }

    fn atomically<T, E, F>(&self, f: F) -> Result<T, E>
    where
        E: From<StoreError>,
        F: FnOnce() -> Result<T, E>,
    {
        with_write_scope(self.conn, f)
    }
}

impl GraphView for SqliteEntityStore<'_> {
    fn note_type(&self, note_id: &str) -> StoreResult<Option<NoteType>> {
        let value: Option<String> = self
            .conn
            .query_row(
                "SELECT type FROM notes WHERE note_id = ?1;",
                [note_id],
                |row| row.get(0),
            )
            .optional()?;
        value
            .map(|text| {
                NoteType::parse(&text).ok_or_else(|| {
                    StoreError::InvalidData(format!("invalid note type `{text}` in notes.type"))
                })
            })
            .transpose()
    }

    fn parent_note_ids(&self, note_id: &str) -> StoreResult<Vec<NoteId>> {
        let mut stmt = self
            .conn
            .prepare("SELECT parent_note_id FROM branches WHERE note_id = ?1;")?;
        let mut rows = stmt.query([note_id])?;
        let mut ids = Vec::new();
        while let Some(row) = rows.next()? {
            ids.push(row.get(0)?);
        }
        Ok(ids)
    }

    fn has_branch(&self, note_id: &str, parent_note_id: &str) -> StoreResult<bool> {
        Ok(self.find_branch(note_id, parent_note_id)?.is_some())
    }
}

/// Writes entity state verbatim, keeping the supplied `date_modified`.
pub(crate) fn upsert_row(conn: &Connection, row: &EntityRow) -> StoreResult<()> {
    match row {
        EntityRow::Note(note) => {
            if !is_valid_note_id(&note.note_id) {
                return Err(StoreError::InvalidData(format!(
                    "note id `{}` must be non-empty and must not contain `_`",
                    note.note_id
                )));
            }
            conn.execute(
                "INSERT INTO notes (
                    note_id,
                    title,
                    content,
                    type,
                    mime,
                    is_protected,
                    date_created,
                    date_modified
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                ON CONFLICT(note_id) DO UPDATE SET
                    title = excluded.title,
                    content = excluded.content,
                    type = excluded.type,
                    mime = excluded.mime,
                    is_protected = excluded.is_protected,
                    date_created = excluded.date_created,
                    date_modified = excluded.date_modified;",
                params![
                    note.note_id.as_str(),
                    note.title.as_str(),
                    note.content.as_slice(),
                    note.note_type.as_str(),
                    note.mime.as_str(),
                    bool_to_int(note.is_protected),
                    note.date_created,
                    note.date_modified,
                ],
            )?;
        }
        EntityRow::Branch(branch) => {
            if !branch.has_consistent_id() {
                return Err(StoreError::InvalidData(format!(
                    "branch id `{}` does not match a valid pair ({}, {})",
                    branch.branch_id, branch.parent_note_id, branch.note_id
                )));
            }
            conn.execute(
                "INSERT INTO branches (
                    branch_id,
                    note_id,
                    parent_note_id,
                    prefix,
                    note_position,
                    date_modified
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                ON CONFLICT(branch_id) DO UPDATE SET
                    prefix = excluded.prefix,
                    note_position = excluded.note_position,
                    date_modified = excluded.date_modified;",
                params![
                    branch.branch_id.as_str(),
                    branch.note_id.as_str(),
                    branch.parent_note_id.as_str(),
                    branch.prefix.as_deref(),
                    branch.note_position,
                    branch.date_modified,
                ],
            )?;
        }
        EntityRow::Attribute(attribute) => {
            conn.execute(
                "INSERT INTO attributes (
                    attribute_id,
                    note_id,
                    name,
                    value,
                    is_inheritable,
                    date_modified
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                ON CONFLICT(attribute_id) DO UPDATE SET
                    note_id = excluded.note_id,
                    name = excluded.name,
                    value = excluded.value,
                    is_inheritable = excluded.is_inheritable,
                    date_modified = excluded.date_modified;",
                params![
                    attribute.attribute_id.as_str(),
                    attribute.note_id.as_str(),
                    attribute.name.as_str(),
                    attribute.value.as_str(),
                    bool_to_int(attribute.is_inheritable),
                    attribute.date_modified,
                ],
            )?;
        }
    }
    Ok(())
}

/// Removes one entity row without logging. Returns whether a row existed.
pub(crate) fn erase_row(conn: &Connection, entity: EntityName, id: &str) -> StoreResult<bool> {
    let sql = match entity {
        EntityName::Note => "DELETE FROM notes WHERE note_id = ?1;",
        EntityName::Branch => "DELETE FROM branches WHERE branch_id = ?1;",
        EntityName::Attribute => "DELETE FROM attributes WHERE attribute_id = ?1;",
    };
    Ok(conn.execute(sql, [id])? > 0)
}

pub(crate) fn load_note(conn: &Connection, note_id: &str) -> StoreResult<Option<Note>> {
    let mut stmt = conn.prepare(&format!("{NOTE_SELECT_SQL} WHERE note_id = ?1;"))?;
    let mut rows = stmt.query([note_id])?;
    if let Some(row) = rows.next()? {
        return Ok(Some(parse_note_row(row)?));
    }
    Ok(None)
}

pub(crate) fn load_branch(conn: &Connection, branch_id: &str) -> StoreResult<Option<Branch>> {
    let mut stmt = conn.prepare(&format!("{BRANCH_SELECT_SQL} WHERE branch_id = ?1;"))?;
    let mut rows = stmt.query([branch_id])?;
    if let Some(row) = rows.next()? {
        return Ok(Some(parse_branch_row(row)?));
    }
    Ok(None)
}

pub(crate) fn load_all_notes(conn: &Connection) -> StoreResult<Vec<Note>> {
    let mut stmt = conn.prepare(&format!("{NOTE_SELECT_SQL} ORDER BY note_id ASC;"))?;
    let mut rows = stmt.query([])?;
    let mut items = Vec::new();
    while let Some(row) = rows.next()? {
        items.push(parse_note_row(row)?);
    }
    Ok(items)
}

pub(crate) fn load_all_branches(conn: &Connection) -> StoreResult<Vec<Branch>> {
    let mut stmt = conn.prepare(&format!(
        "{BRANCH_SELECT_SQL} ORDER BY parent_note_id ASC, note_position ASC, branch_id ASC;"
    ))?;
    let mut rows = stmt.query([])?;
    let mut items = Vec::new();
    while let Some(row) = rows.next()? {
        items.push(parse_branch_row(row)?);
    }
    Ok(items)
}

pub(crate) fn load_all_attributes(conn: &Connection) -> StoreResult<Vec<Attribute>> {
    let mut stmt = conn.prepare(&format!("{ATTRIBUTE_SELECT_SQL} ORDER BY attribute_id ASC;"))?;
    let mut rows = stmt.query([])?;
    let mut items = Vec::new();
    while let Some(row) = rows.next()? {
        items.push(parse_attribute_row(row)?);
    }
    Ok(items)
}

fn query_branches(conn: &Connection, sql: &str, key: &str) -> StoreResult<Vec<Branch>> {
    let mut stmt = conn.prepare(sql)?;
    let mut rows = stmt.query([key])?;
    let mut items = Vec::new();
    while let Some(row) = rows.next()? {
        items.push(parse_branch_row(row)?);
    }
    Ok(items)
}

fn parse_note_row(row: &Row<'_>) -> StoreResult<Note> {
    let type_text: String = row.get("type")?;
    let note_type = NoteType::parse(&type_text).ok_or_else(|| {
        StoreError::InvalidData(format!("invalid note type `{type_text}` in notes.type"))
    })?;

    Ok(Note {
        note_id: row.get("note_id")?,
        title: row.get("title")?,
        content: row.get("content")?,
        note_type,
        mime: row.get("mime")?,
        is_protected: parse_flag(row.get("is_protected")?, "notes.is_protected")?,
        date_created: row.get("date_created")?,
        date_modified: row.get("date_modified")?,
    })
}

fn parse_branch_row(row: &Row<'_>) -> StoreResult<Branch> {
    Ok(Branch {
        branch_id: row.get("branch_id")?,
        note_id: row.get("note_id")?,
        parent_note_id: row.get("parent_note_id")?,
        prefix: row.get("prefix")?,
        note_position: row.get("note_position")?,
        date_modified: row.get("date_modified")?,
    })
}

fn parse_attribute_row(row: &Row<'_>) -> StoreResult<Attribute> {
    Ok(Attribute {
        attribute_id: row.get("attribute_id")?,
        note_id: row.get("note_id")?,
        name: row.get("name")?,
        value: row.get("value")?,
        is_inheritable: parse_flag(row.get("is_inheritable")?, "attributes.is_inheritable")?,
        date_modified: row.get("date_modified")?,
    })
}

pub(crate) fn parse_flag(value: i64, column: &'static str) -> StoreResult<bool> {
    match value {
        0 => Ok(false),
        1 => Ok(true),
        other => Err(StoreError::InvalidData(format!(
            "invalid flag value `{other}` in {column}"
        ))),
    }
}

pub(crate) fn bool_to_int(value: bool) -> i64 {
    if value {
        1
    } else {
        0
    }
}
