//! Schema readiness checks shared by SQLite repositories.

use crate::db::migrations::{latest_version, schema_version};
use crate::repo::entity_store::{StoreError, StoreResult};
use rusqlite::Connection;
use std::collections::HashSet;

/// Table and the columns a repository relies on.
pub(crate) struct TableSpec {
    pub table: &'static str,
    pub columns: &'static [&'static str],
}

/// Rejects connections that are not migrated to the latest version or lack a
/// table/column named in `specs`.
pub(crate) fn ensure_connection_ready(conn: &Connection, specs: &[TableSpec]) -> StoreResult<()> {
    let expected_version = latest_version();
    let actual_version = schema_version(conn)?;
    if actual_version != expected_version {
        return Err(StoreError::UninitializedConnection {
            expected_version,
            actual_version,
        });
    }

    for spec in specs {
        let present = column_names(conn, spec.table)?;
        // table_info yields no rows for an unknown table.
        if present.is_empty() {
            return Err(StoreError::MissingRequiredTable(spec.table));
        }
        if let Some(&column) = spec
            .columns
            .iter()
            .find(|column| !present.contains(**column))
        {
            return Err(StoreError::MissingRequiredColumn {
                table: spec.table,
                column,
            });
        }
    }
    Ok(())
}

fn column_names(conn: &Connection, table: &str) -> StoreResult<HashSet<String>> {
    let mut stmt = conn.prepare("SELECT name FROM pragma_table_info(?1);")?;
    let names = stmt
        .query_map([table], |row| row.get::<_, String>(0))?
        .collect::<Result<HashSet<_>, _>>()?;
    Ok(names)
}
