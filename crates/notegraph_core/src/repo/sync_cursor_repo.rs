//! Persisted per-peer sync progress.
//!
//! # Invariants
//! - `last_pulled` is the remote sequence id of the last record applied
//!   locally; `last_pushed` is the local sequence id last accepted by the peer.
//! - Cursors only move forward.

use crate::model::change::SequenceId;
use crate::repo::entity_store::StoreResult;
use rusqlite::{params, Connection, OptionalExtension};

/// Progress of replication with one peer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncCursor {
    pub last_pulled: SequenceId,
    pub last_pushed: SequenceId,
}

pub(crate) fn load_cursor(conn: &Connection, peer_id: &str) -> StoreResult<SyncCursor> {
    let cursor = conn
        .query_row(
            "SELECT last_pulled, last_pushed FROM sync_cursors WHERE peer_id = ?1;",
            [peer_id],
            |row| {
                Ok(SyncCursor {
                    last_pulled: row.get(0)?,
                    last_pushed: row.get(1)?,
                })
            },
        )
        .optional()?;
    Ok(cursor.unwrap_or_default())
}

pub(crate) fn save_pulled(conn: &Connection, peer_id: &str, value: SequenceId) -> StoreResult<()> {
    conn.execute(
        "INSERT INTO sync_cursors (peer_id, last_pulled) VALUES (?1, ?2)
         ON CONFLICT(peer_id) DO UPDATE SET
            last_pulled = MAX(last_pulled, excluded.last_pulled),
            updated_at = (strftime('%s', 'now') * 1000);",
        params![peer_id, value],
    )?;
    Ok(())
}

pub(crate) fn save_pushed(conn: &Connection, peer_id: &str, value: SequenceId) -> StoreResult<()> {
    conn.execute(
        "INSERT INTO sync_cursors (peer_id, last_pushed) VALUES (?1, ?2)
         ON CONFLICT(peer_id) DO UPDATE SET
            last_pushed = MAX(last_pushed, excluded.last_pushed),
            updated_at = (strftime('%s', 'now') * 1000);",
        params![peer_id, value],
    )?;
    Ok(())
}
