//! Instance-local options storage. Options are never change-logged.

use crate::repo::entity_store::StoreResult;
use rusqlite::{Connection, OptionalExtension};

pub(crate) fn get_option(conn: &Connection, name: &str) -> StoreResult<Option<String>> {
    let value = conn
        .query_row(
            "SELECT value FROM options WHERE name = ?1;",
            [name],
            |row| row.get(0),
        )
        .optional()?;
    Ok(value)
}

pub(crate) fn set_option(conn: &Connection, name: &str, value: &str) -> StoreResult<()> {
    conn.execute(
        "INSERT INTO options (name, value) VALUES (?1, ?2)
         ON CONFLICT(name) DO UPDATE SET
            value = excluded.value,
            updated_at = (strftime('%s', 'now') * 1000);",
        [name, value],
    )?;
    Ok(())
}
