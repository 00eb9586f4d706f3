//! SQL access for the append-only change log and the instance clock.
//!
//! # Invariants
//! - `entity_changes` rows are never deleted. Two follow-up updates exist:
//!   stamping `origin_sequence_id` on a local record, and rewriting earlier
//!   payloads of a note once it is logged as protected.
//! - Once a protected note state is appended, no payload for that note holds
//!   its plaintext.
//! - `sequence_id` comes from `AUTOINCREMENT` and is never reused.
//! - The logical clock only moves forward.

use crate::model::branch::Branch;
use crate::model::change::{ChangeLogRecord, EntityName, EntityRow, SequenceId};
use crate::model::now_epoch_ms;
use crate::repo::entity_store::{bool_to_int, parse_flag, StoreError, StoreResult};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::HashSet;

const RECORD_SELECT_SQL: &str = "SELECT
    sequence_id,
    entity_name,
    entity_id,
    source_id,
    origin_sequence_id,
    timestamp,
    is_erased,
    payload
FROM entity_changes";

/// Record fields supplied by the writer; the sequence id is assigned on insert.
pub(crate) struct RecordDraft<'a> {
    pub entity_name: EntityName,
    pub entity_id: &'a str,
    pub source_id: &'a str,
    /// `None` for local writes: the new sequence id is used.
    pub origin_sequence_id: Option<SequenceId>,
    pub timestamp: i64,
    pub is_erased: bool,
    pub payload: Option<&'a EntityRow>,
}

/// Appends one record and returns its local sequence id.
pub(crate) fn append_record(conn: &Connection, draft: &RecordDraft<'_>) -> StoreResult<SequenceId> {
    let payload = draft
        .payload
        .map(serde_json::to_string)
        .transpose()
        .map_err(|err| StoreError::InvalidData(format!("change payload encode failed: {err}")))?;

    conn.execute(
        "INSERT INTO entity_changes (
            entity_name,
            entity_id,
            source_id,
            origin_sequence_id,
            timestamp,
            is_erased,
            payload
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7);",
        params![
            draft.entity_name.as_str(),
            draft.entity_id,
            draft.source_id,
            draft.origin_sequence_id,
            draft.timestamp,
            bool_to_int(draft.is_erased),
            payload,
        ],
    )?;
    let sequence_id = conn.last_insert_rowid();

    if let (Some(EntityRow::Note(note)), Some(payload)) = (draft.payload, payload.as_deref()) {
        if note.is_protected {
            redact_note_payloads(conn, &note.note_id, payload)?;
        }
    }

    if draft.origin_sequence_id.is_none() {
        conn.execute(
            "UPDATE entity_changes
             SET origin_sequence_id = sequence_id
             WHERE sequence_id = ?1;",
            [sequence_id],
        )?;
    }
    Ok(sequence_id)
}

/// Replaces every logged payload of `note_id` with the protected `payload`,
/// so no earlier plaintext title or content stays in the log. Replays stay
/// valid: each record still carries a full row.
fn redact_note_payloads(conn: &Connection, note_id: &str, payload: &str) -> StoreResult<()> {
    conn.execute(
        "UPDATE entity_changes
         SET payload = ?2
         WHERE entity_name = 'note'
           AND entity_id = ?1
           AND payload IS NOT NULL
           AND payload <> ?2;",
        params![note_id, payload],
    )?;
    Ok(())
}

/// Placements ever logged for `note_id`, most recent first: the last live
/// state of each branch, including branches erased since.
pub(crate) fn branch_history(conn: &Connection, note_id: &str) -> StoreResult<Vec<Branch>> {
    let mut stmt = conn.prepare(&format!(
        "{RECORD_SELECT_SQL}
         WHERE entity_name = 'branch'
           AND is_erased = 0
           AND json_extract(payload, '$.branch.note_id') = ?1
         ORDER BY timestamp DESC, source_id DESC;"
    ))?;
    let mut rows = stmt.query([note_id])?;
    let mut seen = HashSet::new();
    let mut branches = Vec::new();
    while let Some(row) = rows.next()? {
        let record = parse_record_row(row)?;
        if !seen.insert(record.entity_id.clone()) {
            continue;
        }
        if let Some(EntityRow::Branch(branch)) = record.payload {
            branches.push(branch);
        }
    }
    Ok(branches)
}

/// Records with `sequence_id > after`, ascending. `limit = None` means all.
pub(crate) fn records_since(
    conn: &Connection,
    after: SequenceId,
    limit: Option<u32>,
) -> StoreResult<Vec<ChangeLogRecord>> {
    let mut stmt = conn.prepare(&format!(
        "{RECORD_SELECT_SQL}
         WHERE sequence_id > ?1
         ORDER BY sequence_id ASC
         LIMIT ?2;"
    ))?;
    let limit = limit.map_or(-1, i64::from);
    let mut rows = stmt.query(params![after, limit])?;
    let mut records = Vec::new();
    while let Some(row) = rows.next()? {
        records.push(parse_record_row(row)?);
    }
    Ok(records)
}

/// Winning `(timestamp, source_id)` among local records for one entity.
pub(crate) fn latest_precedence(
    conn: &Connection,
    entity_name: EntityName,
    entity_id: &str,
) -> StoreResult<Option<(i64, String)>> {
    let value = conn
        .query_row(
            "SELECT timestamp, source_id
             FROM entity_changes
             WHERE entity_name = ?1
               AND entity_id = ?2
             ORDER BY timestamp DESC, source_id DESC
             LIMIT 1;",
            params![entity_name.as_str(), entity_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;
    Ok(value)
}

/// Whether a change from `source_id` with `origin_sequence_id` is already logged.
pub(crate) fn contains_origin(
    conn: &Connection,
    source_id: &str,
    origin_sequence_id: SequenceId,
) -> StoreResult<bool> {
    let exists: i64 = conn.query_row(
        "SELECT EXISTS(
            SELECT 1
            FROM entity_changes
            WHERE source_id = ?1
              AND origin_sequence_id = ?2
        );",
        params![source_id, origin_sequence_id],
        |row| row.get(0),
    )?;
    Ok(exists == 1)
}

pub(crate) fn last_sequence_id(conn: &Connection) -> StoreResult<SequenceId> {
    let value = conn.query_row(
        "SELECT COALESCE(MAX(sequence_id), 0) FROM entity_changes;",
        [],
        |row| row.get(0),
    )?;
    Ok(value)
}

pub(crate) fn local_source_id(conn: &Connection) -> StoreResult<String> {
    conn.query_row(
        "SELECT value FROM instance_meta WHERE key = 'source_id';",
        [],
        |row| row.get(0),
    )
    .optional()?
    .ok_or_else(|| StoreError::InvalidData("instance_meta.source_id is missing".to_string()))
}

/// Allocates the next local timestamp: wall clock, but strictly after the
/// last timestamp this instance issued or observed.
pub(crate) fn next_timestamp(conn: &Connection) -> StoreResult<i64> {
    let next = current_clock(conn)?.saturating_add(1).max(now_epoch_ms());
    store_clock(conn, next)?;
    Ok(next)
}

/// Advances the clock past a timestamp seen on an incoming record.
pub(crate) fn observe_timestamp(conn: &Connection, timestamp: i64) -> StoreResult<()> {
    if timestamp > current_clock(conn)? {
        store_clock(conn, timestamp)?;
    }
    Ok(())
}

fn current_clock(conn: &Connection) -> StoreResult<i64> {
    let text: String = conn
        .query_row(
            "SELECT value FROM instance_meta WHERE key = 'clock_ms';",
            [],
            |row| row.get(0),
        )
        .optional()?
        .unwrap_or_else(|| "0".to_string());
    text.parse::<i64>()
        .map_err(|_| StoreError::InvalidData(format!("invalid clock value `{text}` in instance_meta")))
}

fn store_clock(conn: &Connection, value: i64) -> StoreResult<()> {
    conn.execute(
        "INSERT INTO instance_meta (key, value) VALUES ('clock_ms', ?1)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value;",
        [value.to_string()],
    )?;
    Ok(())
}

fn parse_record_row(row: &Row<'_>) -> StoreResult<ChangeLogRecord> {
    let sequence_id: SequenceId = row.get("sequence_id")?;
    let name_text: String = row.get("entity_name")?;
    let entity_name = EntityName::parse(&name_text).ok_or_else(|| {
        StoreError::InvalidData(format!(
            "invalid entity name `{name_text}` in entity_changes.entity_name"
        ))
    })?;
    let payload = row
        .get::<_, Option<String>>("payload")?
        .map(|text| serde_json::from_str::<EntityRow>(&text))
        .transpose()
        .map_err(|err| {
            StoreError::InvalidData(format!(
                "invalid payload for change {sequence_id}: {err}"
            ))
        })?;

    Ok(ChangeLogRecord {
        sequence_id,
        entity_name,
        entity_id: row.get("entity_id")?,
        source_id: row.get("source_id")?,
        origin_sequence_id: row
            .get::<_, Option<SequenceId>>("origin_sequence_id")?
            .unwrap_or(sequence_id),
        timestamp: row.get("timestamp")?,
        is_erased: parse_flag(row.get("is_erased")?, "entity_changes.is_erased")?,
        payload,
    })
}
