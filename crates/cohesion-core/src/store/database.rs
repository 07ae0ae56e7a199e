//! SQLite graph store.
//!
//! Each public method opens its own connection, so a `Database` is just a
//! path and can be shared freely between threads.

use std::path::{Path, PathBuf};

use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use crate::errors::{CohesionError, CohesionResult};
use crate::indexer::scanner::ScanResult;
use crate::models::{
    DefinitionKind, DefinitionRecord, ResolutionOutcome, ResolutionStatus, TransitiveImportRecord,
};
use crate::store::schema;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Expand a leading `~` to the user's home directory.
fn expand_tilde(path: &str) -> PathBuf {
    if path == "~" || path.starts_with("~/") {
        if let Some(home) = std::env::var_os("HOME") {
            let mut expanded = PathBuf::from(home);
            if path.len() > 2 {
                expanded.push(&path[2..]);
            }
            return expanded;
        }
    }
    PathBuf::from(path)
}

fn resolve_path(path: &Path) -> CohesionResult<PathBuf> {
    let expanded = expand_tilde(&path.to_string_lossy());
    if expanded.is_absolute() {
        Ok(expanded)
    } else {
        Ok(std::env::current_dir()?.join(expanded))
    }
}

fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

fn import_record_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<TransitiveImportRecord> {
    Ok(TransitiveImportRecord {
        root: row.get(0)?,
        module: row.get(1)?,
        path: row.get(2)?,
        version: row.get(3)?,
        code_str: row.get(4)?,
    })
}

type DefinitionRow = (i64, String, String, i64, i64, String);

fn definition_from_row(row: DefinitionRow) -> CohesionResult<DefinitionRecord> {
    let (id, kind, name, start_line, end_line, file_path) = row;
    Ok(DefinitionRecord {
        id,
        kind: kind.parse::<DefinitionKind>()?,
        name,
        start_line,
        end_line,
        file_path,
    })
}

/// What one file contributed to the store.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FileIngest {
    /// Import nodes seen for the first time anywhere in the codebase.
    pub new_imports: Vec<String>,
    pub definition_ids: Vec<i64>,
}

// ---------------------------------------------------------------------------
// Database
// ---------------------------------------------------------------------------

#[derive(Clone, Debug)]
pub struct Database {
    db_path: PathBuf,
}

impl Database {
    /// Create a handle; `~` is expanded and parent directories are created.
    pub fn new(db_path: impl AsRef<Path>) -> CohesionResult<Self> {
        let resolved = resolve_path(db_path.as_ref())?;
        if let Some(parent) = resolved.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(Self { db_path: resolved })
    }

    /// Create a handle and initialise its schema.
    pub fn open(db_path: impl AsRef<Path>) -> CohesionResult<Self> {
        let db = Self::new(db_path)?;
        db.init_schema()?;
        Ok(db)
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// Open a new connection with foreign keys enforced.
    pub fn connect(&self) -> CohesionResult<Connection> {
        let conn = Connection::open(&self.db_path)?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        Ok(conn)
    }

    // -----------------------------------------------------------------------
    // Schema / meta
    // -----------------------------------------------------------------------

    /// Enable WAL, create all tables and indexes, then run pending migrations.
    pub fn init_schema(&self) -> CohesionResult<()> {
        let mut conn = self.connect()?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        for stmt in schema::SCHEMA_STATEMENTS {
            conn.execute_batch(stmt)?;
        }
        schema::migrate_schema(&mut conn)?;
        Ok(())
    }

    pub fn get_meta(&self, key: &str) -> CohesionResult<Option<String>> {
        let conn = self.connect()?;
        let value = conn
            .query_row(
                "SELECT value FROM meta WHERE key = ?1 LIMIT 1;",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    pub fn set_meta(&self, key: &str, value: &str) -> CohesionResult<()> {
        let conn = self.connect()?;
        conn.execute(
            "INSERT INTO meta(key, value) VALUES(?1, ?2) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value;",
            params![key, value],
        )?;
        Ok(())
    }

    /// Copy the database to `destination` with the SQLite backup API.
    pub fn backup_to(&self, destination: &Path) -> CohesionResult<PathBuf> {
        let resolved = resolve_path(destination)?;
        if let Some(parent) = resolved.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let src_conn = self.connect()?;
        let mut dst_conn = Connection::open(&resolved)?;
        let backup = rusqlite::backup::Backup::new(&src_conn, &mut dst_conn)?;
        backup.run_to_completion(100, std::time::Duration::from_millis(10), None)?;
        Ok(resolved)
    }

    // -----------------------------------------------------------------------
    // Entity inserts
    // -----------------------------------------------------------------------

    fn insert_file_conn(conn: &Connection, path: &str) -> CohesionResult<()> {
        match conn.execute("INSERT INTO files(path) VALUES (?1);", params![path]) {
            Ok(_) => Ok(()),
            Err(e) if is_constraint_violation(&e) => Err(CohesionError::Duplicate {
                kind: "file",
                identity: path.to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    /// Record a file; a path already recorded is rejected as a duplicate.
    pub fn insert_file(&self, path: &str) -> CohesionResult<()> {
        let conn = self.connect()?;
        Self::insert_file_conn(&conn, path)
    }

    /// Record an import node; an already-known node is rejected as a duplicate.
    pub fn insert_import(&self, code_str: &str) -> CohesionResult<()> {
        let conn = self.connect()?;
        match conn.execute("INSERT INTO imports(code_str) VALUES (?1);", params![code_str]) {
            Ok(_) => Ok(()),
            Err(e) if is_constraint_violation(&e) => Err(CohesionError::Duplicate {
                kind: "import",
                identity: code_str.to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    /// Record an import node unless known; true when it was new.
    pub fn register_import(&self, code_str: &str) -> CohesionResult<bool> {
        match self.insert_import(code_str) {
            Ok(()) => Ok(true),
            Err(e) if e.is_duplicate() => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub fn insert_definition(
        &self,
        kind: DefinitionKind,
        name: &str,
        start_line: i64,
        end_line: i64,
        file_path: &str,
    ) -> CohesionResult<i64> {
        let conn = self.connect()?;
        conn.execute(
            "INSERT INTO definitions(type, name, start_no, end_no, filename_path) \
             VALUES (?1, ?2, ?3, ?4, ?5);",
            params![kind.as_str(), name, start_line, end_line, file_path],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn insert_file_import_edge(&self, file_path: &str, code_str: &str) -> CohesionResult<()> {
        let conn = self.connect()?;
        conn.execute(
            "INSERT OR IGNORE INTO filenames_to_imports(filename_path, import_code_str) \
             VALUES (?1, ?2);",
            params![file_path, code_str],
        )?;
        Ok(())
    }

    pub fn insert_definition_import_edge(&self, definition_id: i64, code_str: &str) -> CohesionResult<()> {
        let conn = self.connect()?;
        conn.execute(
            "INSERT OR IGNORE INTO definitions_to_imports(definition_id, import_code_str) \
             VALUES (?1, ?2);",
            params![definition_id, code_str],
        )?;
        Ok(())
    }

    /// Persist one file's scan in a single transaction: the file row, its
    /// import nodes, both edge kinds and its definitions.
    ///
    /// A file already recorded rolls everything back and returns
    /// [`CohesionError::Duplicate`].
    pub fn record_file_scan(&self, scan: &ScanResult) -> CohesionResult<FileIngest> {
        let mut conn = self.connect()?;
        let tx = conn.transaction()?;
        Self::insert_file_conn(&tx, &scan.file_path)?;

        let mut ingest = FileIngest::default();
        for code in scan.import_nodes() {
            let added = tx.execute(
                "INSERT OR IGNORE INTO imports(code_str) VALUES (?1);",
                params![code],
            )?;
            tx.execute(
                "INSERT OR IGNORE INTO filenames_to_imports(filename_path, import_code_str) \
                 VALUES (?1, ?2);",
                params![scan.file_path, code],
            )?;
            if added > 0 {
                ingest.new_imports.push(code);
            }
        }

        for def in &scan.definitions {
            tx.execute(
                "INSERT INTO definitions(type, name, start_no, end_no, filename_path) \
                 VALUES (?1, ?2, ?3, ?4, ?5);",
                params![
                    def.kind.as_str(),
                    def.name,
                    def.start_line,
                    def.end_line,
                    scan.file_path
                ],
            )?;
            let id = tx.last_insert_rowid();
            for code in &def.used_imports {
                tx.execute(
                    "INSERT OR IGNORE INTO definitions_to_imports(definition_id, import_code_str) \
                     VALUES (?1, ?2);",
                    params![id, code],
                )?;
            }
            ingest.definition_ids.push(id);
        }

        tx.commit()?;
        debug!(
            "Stored {}: {} definitions, {} new import nodes",
            scan.file_path,
            ingest.definition_ids.len(),
            ingest.new_imports.len()
        );
        Ok(ingest)
    }

    // -----------------------------------------------------------------------
    // Resolution state
    // -----------------------------------------------------------------------

    /// `None` while the node has not been executed yet.
    pub fn import_status(&self, code_str: &str) -> CohesionResult<Option<ResolutionStatus>> {
        let conn = self.connect()?;
        let status: Option<Option<String>> = conn
            .query_row(
                "SELECT status FROM imports WHERE code_str = ?1;",
                params![code_str],
                |row| row.get(0),
            )
            .optional()?;
        match status {
            None => Err(CohesionError::NotFound(format!("import node {code_str:?}"))),
            Some(status) => Ok(status.as_deref().and_then(ResolutionStatus::parse)),
        }
    }

    /// Import nodes never executed, in insertion order.
    pub fn pending_imports(&self) -> CohesionResult<Vec<String>> {
        let conn = self.connect()?;
        let mut stmt =
            conn.prepare("SELECT code_str FROM imports WHERE status IS NULL ORDER BY rowid;")?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        Ok(rows.collect::<Result<Vec<String>, _>>()?)
    }

    /// Persist the outcome of executing one node. Records are insert-or-ignore
    /// and the status is written only while still pending.
    ///
    /// Returns the number of transitive records added.
    pub fn record_resolution(&self, code_str: &str, outcome: &ResolutionOutcome) -> CohesionResult<usize> {
        let mut conn = self.connect()?;
        let tx = conn.transaction()?;
        let known: Option<i64> = tx
            .query_row(
                "SELECT 1 FROM imports WHERE code_str = ?1;",
                params![code_str],
                |row| row.get(0),
            )
            .optional()?;
        if known.is_none() {
            return Err(CohesionError::NotFound(format!("import node {code_str:?}")));
        }

        let mut added = 0;
        for record in outcome.records() {
            added += tx.execute(
                "INSERT OR IGNORE INTO import_data(root, module, path, version, code_str) \
                 VALUES (?1, ?2, ?3, ?4, ?5);",
                params![
                    record.root,
                    record.module,
                    record.path,
                    record.version,
                    code_str
                ],
            )?;
        }
        let error_message = match outcome {
            ResolutionOutcome::Failed(message) => Some(message.as_str()),
            ResolutionOutcome::Resolved(_) => None,
        };
        tx.execute(
            "UPDATE imports SET status = ?2, error_message = ?3 \
             WHERE code_str = ?1 AND status IS NULL;",
            params![code_str, outcome.status().as_str(), error_message],
        )?;
        tx.commit()?;
        Ok(added)
    }

    /// The persisted outcome of a node, or `None` while pending.
    pub fn stored_outcome(&self, code_str: &str) -> CohesionResult<Option<ResolutionOutcome>> {
        let conn = self.connect()?;
        let row: Option<(Option<String>, Option<String>)> = conn
            .query_row(
                "SELECT status, error_message FROM imports WHERE code_str = ?1;",
                params![code_str],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let Some((status, error_message)) = row else {
            return Err(CohesionError::NotFound(format!("import node {code_str:?}")));
        };
        match status.as_deref().and_then(ResolutionStatus::parse) {
            None => Ok(None),
            Some(ResolutionStatus::Failed) => {
                Ok(Some(ResolutionOutcome::Failed(error_message.unwrap_or_default())))
            }
            Some(ResolutionStatus::Resolved) => {
                Ok(Some(ResolutionOutcome::Resolved(self.records_for_import(code_str)?)))
            }
        }
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    /// Transitive records of one import node, ordered by module name.
    pub fn records_for_import(&self, code_str: &str) -> CohesionResult<Vec<TransitiveImportRecord>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            "SELECT root, module, path, version, code_str FROM import_data \
             WHERE code_str = ?1 ORDER BY module;",
        )?;
        let rows = stmt.query_map(params![code_str], import_record_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Resolved file of a qualified module name, from any node that loaded it.
    pub fn path_for_module(&self, module: &str) -> CohesionResult<Option<String>> {
        let conn = self.connect()?;
        let path = conn
            .query_row(
                "SELECT path FROM import_data \
                 WHERE module = ?1 AND path IS NOT NULL ORDER BY rowid LIMIT 1;",
                params![module],
                |row| row.get(0),
            )
            .optional()?;
        Ok(path)
    }

    pub fn files(&self) -> CohesionResult<Vec<String>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare("SELECT path FROM files ORDER BY path;")?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        Ok(rows.collect::<Result<Vec<String>, _>>()?)
    }

    pub fn imports(&self) -> CohesionResult<Vec<String>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare("SELECT code_str FROM imports ORDER BY rowid;")?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        Ok(rows.collect::<Result<Vec<String>, _>>()?)
    }

    pub fn definitions(&self) -> CohesionResult<Vec<DefinitionRecord>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            "SELECT id, type, name, start_no, end_no, filename_path \
             FROM definitions ORDER BY id;",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                ))
            })?
            .collect::<Result<Vec<DefinitionRow>, _>>()?;
        rows.into_iter().map(definition_from_row).collect()
    }

    /// `(file_path, code_str)` pairs.
    pub fn file_import_edges(&self) -> CohesionResult<Vec<(String, String)>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            "SELECT filename_path, import_code_str FROM filenames_to_imports ORDER BY rowid;",
        )?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// `(definition_id, code_str)` pairs.
    pub fn definition_import_edges(&self) -> CohesionResult<Vec<(i64, String)>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            "SELECT definition_id, import_code_str FROM definitions_to_imports ORDER BY rowid;",
        )?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn import_data(&self) -> CohesionResult<Vec<TransitiveImportRecord>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            "SELECT root, module, path, version, code_str FROM import_data \
             ORDER BY code_str, module;",
        )?;
        let rows = stmt.query_map([], import_record_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
