//! Local database schema and migrations.

use rusqlite::Connection;

/// Run all pending migrations.
pub fn migrate(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS outcome_records (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            item_path TEXT NOT NULL,
            output_path TEXT,
            started_at TEXT NOT NULL,
            finished_at TEXT NOT NULL,
            duration_ms INTEGER NOT NULL,
            status TEXT NOT NULL,
            error_message TEXT,
            batch_id TEXT NOT NULL,
            node_id TEXT,
            process_id TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_outcome_records_started ON outcome_records(started_at);
        CREATE INDEX IF NOT EXISTS idx_outcome_records_status ON outcome_records(status);",
    )?;

    // Tables created before host identity was recorded lack these columns.
    for column in ["node_id", "process_id"] {
        if !has_column(conn, "outcome_records", column)? {
            conn.execute(
                &format!("ALTER TABLE outcome_records ADD COLUMN {} TEXT", column),
                [],
            )?;
        }
    }

    conn.execute(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_outcome_records_batch_item
         ON outcome_records(batch_id, item_path)",
        [],
    )?;

    Ok(())
}

fn has_column(conn: &Connection, table: &str, column: &str) -> rusqlite::Result<bool> {
    let count: i64 = conn.query_row(
        "SELECT count(*) FROM pragma_table_info(?1) WHERE name = ?2",
        rusqlite::params![table, column],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_sql(conn: &Connection) -> String {
        conn.query_row(
            "SELECT group_concat(sql, ';') FROM sqlite_master WHERE tbl_name = 'outcome_records'",
            [],
            |row| row.get(0),
        )
        .unwrap()
    }

    #[test]
    fn test_migrate_creates_table() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM outcome_records", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn test_migrate_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();
        let before = table_sql(&conn);
        migrate(&conn).unwrap();
        assert_eq!(before, table_sql(&conn));
    }

    #[test]
    fn test_migrate_adds_identity_columns_to_old_tables() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE outcome_records (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                item_path TEXT NOT NULL,
                output_path TEXT,
                started_at TEXT NOT NULL,
                finished_at TEXT NOT NULL,
                duration_ms INTEGER NOT NULL,
                status TEXT NOT NULL,
                error_message TEXT,
                batch_id TEXT NOT NULL
            );",
        )
        .unwrap();

        migrate(&conn).unwrap();

        assert!(has_column(&conn, "outcome_records", "node_id").unwrap());
        assert!(has_column(&conn, "outcome_records", "process_id").unwrap());
    }
}
