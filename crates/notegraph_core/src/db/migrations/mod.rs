//! Embedded schema migrations for the note graph store.
//!
//! # Responsibility
//! - Keep the ordered list of SQL steps compiled into the binary.
//! - Bring a connection up to the latest step inside one transaction.
//!
//! # Invariants
//! - Step versions are strictly increasing; `PRAGMA user_version` holds the
//!   last applied one.
//! - Step 1 seeds the root note. Every open re-checks that it still exists,
//!   because the graph has no meaning without it.

use crate::db::{DbError, DbResult};
use crate::model::note::ROOT_NOTE_ID;
use log::info;
use rusqlite::{Connection, OptionalExtension};

#[derive(Debug, Clone, Copy)]
struct Step {
    version: u32,
    name: &'static str,
    sql: &'static str,
}

const STEPS: &[Step] = &[
    Step {
        version: 1,
        name: "graph",
        sql: include_str!("0001_graph.sql"),
    },
    Step {
        version: 2,
        name: "change_log",
        sql: include_str!("0002_change_log.sql"),
    },
    Step {
        version: 3,
        name: "sync_options",
        sql: include_str!("0003_sync_options.sql"),
    },
];

/// Highest schema version this binary can open.
pub fn latest_version() -> u32 {
    STEPS.last().map_or(0, |step| step.version)
}

/// Applies every step newer than the connection's version, then checks that
/// the root note is present.
pub fn apply_migrations(conn: &mut Connection) -> DbResult<()> {
    let from_version = schema_version(conn)?;
    let latest = latest_version();
    if from_version > latest {
        return Err(DbError::UnsupportedSchemaVersion {
            db_version: from_version,
            latest_supported: latest,
        });
    }

    if from_version < latest {
        let tx = conn.transaction()?;
        for step in STEPS.iter().filter(|step| step.version > from_version) {
            tx.execute_batch(step.sql)?;
            tx.pragma_update(None, "user_version", step.version)?;
            info!(
                "event=db_migrate_step module=db status=ok version={} name={}",
                step.version, step.name
            );
        }
        tx.commit()?;
        info!(
            "event=db_migrate module=db status=ok from_version={from_version} to_version={latest}"
        );
    }

    ensure_root_note(conn)
}

/// Reads the schema version recorded on the connection.
pub fn schema_version(conn: &Connection) -> DbResult<u32> {
    Ok(conn.pragma_query_value(None, "user_version", |row| row.get::<_, u32>(0))?)
}

fn ensure_root_note(conn: &Connection) -> DbResult<()> {
    let found = conn
        .query_row(
            "SELECT 1 FROM notes WHERE note_id = ?1;",
            [ROOT_NOTE_ID],
            |row| row.get::<_, i64>(0),
        )
        .optional()?;
    match found {
        Some(_) => Ok(()),
        None => Err(DbError::MissingRootNote),
    }
}
