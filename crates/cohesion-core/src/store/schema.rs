//! SQLite schema DDL and migration framework.

use rusqlite::Connection;
use tracing::{info, warn};

use crate::errors::CohesionResult;

/// Current schema version. Migrations run from whatever the DB currently
/// reports up to this value.
pub const SCHEMA_VERSION: i32 = 2;

/// Baseline DDL, safe to replay on an initialised database.
pub const SCHEMA_STATEMENTS: &[&str] = &[
    // ── tables ──────────────────────────────────────────────────────────
    "CREATE TABLE IF NOT EXISTS meta (
        key TEXT PRIMARY KEY,
        value TEXT
    );",
    "CREATE TABLE IF NOT EXISTS migration_history (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        from_version INTEGER NOT NULL,
        to_version INTEGER NOT NULL,
        status TEXT NOT NULL,
        error_message TEXT,
        created_at TEXT DEFAULT CURRENT_TIMESTAMP
    );",
    "CREATE TABLE IF NOT EXISTS files (
        path TEXT PRIMARY KEY
    );",
    // status: NULL until executed, then 'resolved' or 'failed'.
    "CREATE TABLE IF NOT EXISTS imports (
        code_str TEXT PRIMARY KEY,
        status TEXT,
        error_message TEXT
    );",
    "CREATE TABLE IF NOT EXISTS definitions (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        type TEXT NOT NULL,
        name TEXT NOT NULL,
        start_no INTEGER NOT NULL,
        end_no INTEGER NOT NULL,
        filename_path TEXT NOT NULL REFERENCES files(path)
    );",
    "CREATE TABLE IF NOT EXISTS filenames_to_imports (
        filename_path TEXT NOT NULL REFERENCES files(path),
        import_code_str TEXT NOT NULL REFERENCES imports(code_str),
        UNIQUE(filename_path, import_code_str)
    );",
    "CREATE TABLE IF NOT EXISTS definitions_to_imports (
        definition_id INTEGER NOT NULL REFERENCES definitions(id),
        import_code_str TEXT NOT NULL REFERENCES imports(code_str),
        UNIQUE(definition_id, import_code_str)
    );",
    "CREATE TABLE IF NOT EXISTS import_data (
        root TEXT NOT NULL,
        module TEXT NOT NULL,
        path TEXT,
        version TEXT,
        code_str TEXT NOT NULL REFERENCES imports(code_str),
        UNIQUE(module, code_str)
    );",
    // ── indexes ─────────────────────────────────────────────────────────
    "CREATE INDEX IF NOT EXISTS idx_definitions_file ON definitions(filename_path);",
    "CREATE INDEX IF NOT EXISTS idx_import_data_code ON import_data(code_str);",
    "CREATE INDEX IF NOT EXISTS idx_import_data_module ON import_data(module);",
];

// ─── Migrations ─────────────────────────────────────────────────────────────

/// One upgrade step: the version it produces and the change that gets there.
#[derive(Clone, Copy)]
pub struct Migration {
    pub target: i32,
    pub name: &'static str,
    pub apply: fn(&Connection) -> CohesionResult<()>,
}

/// Ordered by `target`. Steps must tolerate a database whose baseline DDL
/// already has their change.
pub const MIGRATIONS: &[Migration] = &[Migration {
    target: 2,
    name: "add_resolution_status",
    apply: add_resolution_status,
}];

/// Bring the stored schema up to [`SCHEMA_VERSION`].
pub fn migrate_schema(conn: &mut Connection) -> CohesionResult<()> {
    run_migrations(conn, MIGRATIONS)
}

/// Apply every step above the stored version, each inside its own savepoint.
/// A failing step is rolled back, logged to `migration_history` and returned.
fn run_migrations(conn: &mut Connection, steps: &[Migration]) -> CohesionResult<()> {
    let mut current = get_schema_version(conn);
    for step in steps {
        if step.target <= current {
            continue;
        }
        let outcome = {
            let sp = conn.savepoint()?;
            let outcome = (step.apply)(&sp)
                .and_then(|()| set_schema_version(&sp, step.target))
                .and_then(|()| record_migration_step(&sp, current, step.target, "success", None));
            if outcome.is_ok() {
                sp.commit()?;
            }
            // Dropping an uncommitted savepoint rolls it back.
            outcome
        };
        if let Err(e) = outcome {
            warn!("Schema migration {} ({current} -> {}) failed: {e}", step.name, step.target);
            record_migration_step(conn, current, step.target, "failed", Some(&e.to_string()))?;
            return Err(e);
        }
        info!("Schema migrated {current} -> {} ({})", step.target, step.name);
        current = step.target;
    }
    Ok(())
}

/// Stored schema version; 0 when the key is absent or unparseable.
pub fn get_schema_version(conn: &Connection) -> i32 {
    conn.query_row(
        "SELECT value FROM meta WHERE key = 'schema_version';",
        [],
        |row| row.get::<_, String>(0),
    )
    .ok()
    .and_then(|v| v.parse().ok())
    .unwrap_or(0)
}

fn set_schema_version(conn: &Connection, version: i32) -> CohesionResult<()> {
    conn.execute(
        "INSERT INTO meta(key, value) VALUES('schema_version', ?1) \
         ON CONFLICT(key) DO UPDATE SET value = excluded.value;",
        [version.to_string()],
    )?;
    Ok(())
}

fn record_migration_step(
    conn: &Connection,
    from: i32,
    to: i32,
    status: &str,
    error: Option<&str>,
) -> CohesionResult<()> {
    conn.execute(
        "INSERT INTO migration_history(from_version, to_version, status, error_message) \
         VALUES (?1, ?2, ?3, ?4);",
        rusqlite::params![from, to, status, error],
    )?;
    Ok(())
}

fn column_names(conn: &Connection, table: &str) -> CohesionResult<Vec<String>> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table});"))?;
    let names = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(names)
}

/// v1 -> v2: v1 `imports` held only `code_str`, so every node was retried on
/// each scan. Existing rows keep a NULL status and are resolved once more.
fn add_resolution_status(conn: &Connection) -> CohesionResult<()> {
    let columns = column_names(conn, "imports")?;
    for (column, ddl) in [
        ("status", "ALTER TABLE imports ADD COLUMN status TEXT;"),
        ("error_message", "ALTER TABLE imports ADD COLUMN error_message TEXT;"),
    ] {
        if !columns.iter().any(|c| c == column) {
            conn.execute_batch(ddl)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::CohesionError;

    fn apply_ddl(conn: &Connection) {
        for stmt in SCHEMA_STATEMENTS {
            conn.execute_batch(stmt).unwrap();
        }
    }

    fn fresh() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("PRAGMA foreign_keys = ON;").unwrap();
        apply_ddl(&conn);
        conn
    }

    /// A v1 store: `imports` without resolution status, one node recorded.
    fn legacy_v1() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE meta (key TEXT PRIMARY KEY, value TEXT);
             INSERT INTO meta(key, value) VALUES('schema_version', '1');
             CREATE TABLE imports (code_str TEXT PRIMARY KEY);
             INSERT INTO imports(code_str) VALUES('import numpy');",
        )
        .unwrap();
        apply_ddl(&conn);
        conn
    }

    fn history(conn: &Connection) -> Vec<(i32, i32, String)> {
        let mut stmt = conn
            .prepare("SELECT from_version, to_version, status FROM migration_history ORDER BY id;")
            .unwrap();
        stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))
            .unwrap()
            .collect::<Result<Vec<_>, _>>()
            .unwrap()
    }

    #[test]
    fn test_migrate_fresh_database() {
        let mut conn = fresh();
        migrate_schema(&mut conn).unwrap();
        assert_eq!(get_schema_version(&conn), SCHEMA_VERSION);
        assert_eq!(history(&conn), vec![(0, 2, "success".to_string())]);
    }

    #[test]
    fn test_migrate_idempotent() {
        let mut conn = fresh();
        migrate_schema(&mut conn).unwrap();
        migrate_schema(&mut conn).unwrap();
        assert_eq!(get_schema_version(&conn), SCHEMA_VERSION);
        assert_eq!(history(&conn).len(), 1);
    }

    #[test]
    fn test_v1_store_gains_resolution_status() {
        let mut conn = legacy_v1();
        assert!(!column_names(&conn, "imports").unwrap().contains(&"status".to_string()));

        migrate_schema(&mut conn).unwrap();
        let columns = column_names(&conn, "imports").unwrap();
        assert!(columns.contains(&"status".to_string()));
        assert!(columns.contains(&"error_message".to_string()));
        assert_eq!(get_schema_version(&conn), 2);
        assert_eq!(history(&conn), vec![(1, 2, "success".to_string())]);

        let status: Option<String> = conn
            .query_row("SELECT status FROM imports WHERE code_str = 'import numpy';", [], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(status, None);
    }

    #[test]
    fn test_failed_step_rolls_back() {
        fn half_done(conn: &Connection) -> CohesionResult<()> {
            conn.execute_batch("CREATE TABLE scratch (x INTEGER);")?;
            Err(CohesionError::Config("boom".to_string()))
        }
        let steps = [
            Migration { target: 2, name: "add_resolution_status", apply: add_resolution_status },
            Migration { target: 3, name: "half_done", apply: half_done },
        ];
        let mut conn = legacy_v1();
        assert!(run_migrations(&mut conn, &steps).is_err());

        assert_eq!(get_schema_version(&conn), 2);
        let scratch: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE name = 'scratch';",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(scratch, 0);
        assert_eq!(
            history(&conn),
            vec![(1, 2, "success".to_string()), (2, 3, "failed".to_string())]
        );
    }

    #[test]
    fn test_module_index_created() {
        let conn = fresh();
        let found: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master \
                 WHERE type = 'index' AND name = 'idx_import_data_module';",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(found, 1);
    }
}
