//! Atomic write scopes over one SQLite connection.
//!
//! The outermost scope opens an IMMEDIATE transaction so concurrent writers
//! on other connections serialize behind it; nested scopes become savepoints
//! so a failing inner step rolls back without leaking partial state.

use crate::repo::entity_store::StoreError;
use log::warn;
use rusqlite::{Connection, Transaction, TransactionBehavior};

const SAVEPOINT_NAME: &str = "graph_write";

/// Runs `f` atomically: all of its writes commit, or none do.
pub(crate) fn with_write_scope<T, E, F>(conn: &Connection, f: F) -> Result<T, E>
where
    E: From<StoreError>,
    F: FnOnce() -> Result<T, E>,
{
    if conn.is_autocommit() {
        let tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate)
            .map_err(|err| E::from(StoreError::from(err)))?;
        // Dropping `tx` on the error path rolls back.
        let value = f()?;
        tx.commit().map_err(|err| E::from(StoreError::from(err)))?;
        return Ok(value);
    }

    conn.execute_batch(&format!("SAVEPOINT {SAVEPOINT_NAME};"))
        .map_err(|err| E::from(StoreError::from(err)))?;
    match f() {
        Ok(value) => {
            conn.execute_batch(&format!("RELEASE {SAVEPOINT_NAME};"))
                .map_err(|err| E::from(StoreError::from(err)))?;
            Ok(value)
        }
        Err(err) => {
            // The caller's error wins; the outer transaction still rolls back.
            if let Err(rollback_err) = conn.execute_batch(&format!(
                "ROLLBACK TO {SAVEPOINT_NAME}; RELEASE {SAVEPOINT_NAME};"
            )) {
                warn!(
                    "event=write_scope_rollback module=repo status=error error_code=savepoint_rollback_failed error={}",
                    rollback_err
                );
            }
            Err(err)
        }
    }
}

/// Runs read-only `f` inside one read transaction so it observes a single
/// committed snapshot.
pub(crate) fn with_read_snapshot<T, E, F>(conn: &Connection, f: F) -> Result<T, E>
where
    E: From<StoreError>,
    F: FnOnce() -> Result<T, E>,
{
    if !conn.is_autocommit() {
        return f();
    }
    let tx = Transaction::new_unchecked(conn, TransactionBehavior::Deferred)
        .map_err(|err| E::from(StoreError::from(err)))?;
    let value = f()?;
    tx.commit().map_err(|err| E::from(StoreError::from(err)))?;
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::with_write_scope;
    use crate::db::open_db_in_memory;
    use crate::repo::entity_store::StoreError;

    fn count_options(conn: &rusqlite::Connection) -> i64 {
        conn.query_row("SELECT COUNT(*) FROM options;", [], |row| row.get(0))
            .unwrap()
    }

    #[test]
    fn failing_nested_scope_rolls_back_outer_writes() {
        let conn = open_db_in_memory().unwrap();

        let result: Result<(), StoreError> = with_write_scope(&conn, || {
            conn.execute("INSERT INTO options (name, value) VALUES ('a', '1');", [])?;
            with_write_scope(&conn, || {
                conn.execute("INSERT INTO options (name, value) VALUES ('b', '2');", [])?;
                Err(StoreError::InvalidData("boom".to_string()))
            })
        });

        assert!(result.is_err());
        assert_eq!(count_options(&conn), 0);
        assert!(conn.is_autocommit());
    }

    #[test]
    fn failed_savepoint_rollback_keeps_the_inner_error() {
        let conn = open_db_in_memory().unwrap();

        let result: Result<(), StoreError> = with_write_scope(&conn, || {
            conn.execute("INSERT INTO options (name, value) VALUES ('a', '1');", [])?;
            with_write_scope(&conn, || {
                // Leaves nothing for the scope to roll back to.
                conn.execute_batch("RELEASE graph_write;")?;
                Err(StoreError::InvalidData("boom".to_string()))
            })
        });

        assert!(matches!(result, Err(StoreError::InvalidData(ref message)) if message == "boom"));
        assert_eq!(count_options(&conn), 0);
        assert!(conn.is_autocommit());
    }

    #[test]
    fn nested_scopes_commit_together() {
        let conn = open_db_in_memory().unwrap();

        let result: Result<(), StoreError> = with_write_scope(&conn, || {
            conn.execute("INSERT INTO options (name, value) VALUES ('a', '1');", [])?;
            with_write_scope(&conn, || {
                conn.execute("INSERT INTO options (name, value) VALUES ('b', '2');", [])?;
                Ok(())
            })
        });

        result.unwrap();
        assert_eq!(count_options(&conn), 2);
    }
}
