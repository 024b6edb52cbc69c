//! `SQLite`-backed implementation of [`CheckpointStore`].
//!
//! Uses a single `Mutex<Connection>`. Schema revisions are applied in
//! order at connect time, tracked in a `schema_version` table.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use hqexport_types::checkpoint::{CheckpointRecord, PaginationMode};
use rusqlite::{params_from_iter, types::Value, Connection, Row};

use crate::error::{self, StateError};
use crate::store::{CheckpointScope, CheckpointStore, COLUMNS};

/// Schema revisions, applied in order. The version table records how
/// far a given database has been migrated.
const MIGRATIONS: &[&str] = &[
    // v1: base table
    r#"CREATE TABLE commcare_export_runs (
        id TEXT PRIMARY KEY,
        query_file_name TEXT,
        query_file_md5 TEXT NOT NULL,
        data_source TEXT,
        table_name TEXT,
        project TEXT NOT NULL,
        commcare_host TEXT NOT NULL,
        "key" TEXT,
        since_param TEXT,
        last_doc_id TEXT,
        time_of_run TEXT NOT NULL,
        "final" INTEGER NOT NULL DEFAULT 0
    )"#,
    // v2: persisted pagination strategy
    r#"ALTER TABLE commcare_export_runs ADD COLUMN pagination_mode TEXT"#,
    // v3: opaque cursor token
    r#"ALTER TABLE commcare_export_runs ADD COLUMN cursor TEXT"#,
];

/// `SQLite`-backed checkpoint storage.
///
/// Create with [`SqliteCheckpointStore::open`] for file-backed
/// persistence or [`SqliteCheckpointStore::in_memory`] for tests.
pub struct SqliteCheckpointStore {
    conn: Mutex<Connection>,
}

impl SqliteCheckpointStore {
    /// Open or create a checkpoint database at `path`.
    pub fn open(path: &Path) -> error::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Create an in-memory store (for testing).
    pub fn in_memory() -> error::Result<Self> {
        let conn = Connection::open_in_memory()?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock_conn(&self) -> error::Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StateError::LockPoisoned)
    }
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<CheckpointRecord> {
    let mode: Option<String> = row.get(8)?;
    Ok(CheckpointRecord {
        id: row.get(0)?,
        query_file_name: row.get(1)?,
        query_file_md5: row.get(2)?,
        data_source: row.get(3)?,
        table_name: row.get(4)?,
        project: row.get(5)?,
        commcare_host: row.get(6)?,
        key: row.get(7)?,
        // rows written before the mode column existed are legacy
        // date-windowed pulls
        pagination_mode: mode
            .as_deref()
            .and_then(PaginationMode::parse)
            .unwrap_or(PaginationMode::DateModified),
        since_param: row.get(9)?,
        last_doc_id: row.get(10)?,
        cursor: row.get(11)?,
        time_of_run: row.get(12)?,
        is_final: row.get(13)?,
    })
}

fn opt_text(v: &Option<String>) -> Value {
    v.as_ref()
        .map_or(Value::Null, |s| Value::Text(s.clone()))
}

fn record_params(record: &CheckpointRecord) -> Vec<Value> {
    vec![
        Value::Text(record.id.clone()),
        opt_text(&record.query_file_name),
        Value::Text(record.query_file_md5.clone()),
        opt_text(&record.data_source),
        opt_text(&record.table_name),
        Value::Text(record.project.clone()),
        Value::Text(record.commcare_host.clone()),
        opt_text(&record.key),
        Value::Text(record.pagination_mode.as_str().to_owned()),
        opt_text(&record.since_param),
        opt_text(&record.last_doc_id),
        opt_text(&record.cursor),
        Value::Text(record.time_of_run.clone()),
        Value::Integer(i64::from(record.is_final)),
    ]
}

/// WHERE clause for a scope, appending its params to `params`.
fn scope_clause(
    scope: &CheckpointScope,
    table_names: &[String],
    params: &mut Vec<Value>,
) -> String {
    let mut clause = String::from(
        "query_file_md5 = ? AND project = ? AND commcare_host = ? AND \"key\" IS ?",
    );
    params.push(Value::Text(scope.query_file_md5.clone()));
    params.push(Value::Text(scope.project.clone()));
    params.push(Value::Text(scope.commcare_host.clone()));
    params.push(opt_text(&scope.key));
    if !table_names.is_empty() {
        let placeholders = vec!["?"; table_names.len()].join(", ");
        clause.push_str(&format!(" AND table_name IN ({placeholders})"));
        for name in table_names {
            params.push(Value::Text(name.clone()));
        }
    }
    clause
}

impl CheckpointStore for SqliteCheckpointStore {
    fn migrate(&self) -> error::Result<()> {
        let conn = self.lock_conn()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL)",
        )?;
        let current: i64 = conn
            .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_version", [], |r| {
                r.get(0)
            })?;
        for (i, migration) in MIGRATIONS.iter().enumerate() {
            let version = i as i64 + 1;
            if version <= current {
                continue;
            }
            conn.execute_batch(migration)?;
            conn.execute("INSERT INTO schema_version (version) VALUES (?1)", [version])?;
            tracing::debug!(version, "applied checkpoint schema migration");
        }
        Ok(())
    }

    fn insert(&self, record: &CheckpointRecord) -> error::Result<()> {
        let conn = self.lock_conn()?;
        let sql = format!(
            "INSERT INTO commcare_export_runs ({COLUMNS}) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
        );
        conn.execute(&sql, params_from_iter(record_params(record)))?;
        Ok(())
    }

    fn update(&self, record: &CheckpointRecord) -> error::Result<()> {
        let conn = self.lock_conn()?;
        let mut params = record_params(record);
        params.rotate_left(1); // id moves to the WHERE position
        conn.execute(
            "UPDATE commcare_export_runs SET \
                query_file_name = ?, query_file_md5 = ?, data_source = ?, \
                table_name = ?, project = ?, commcare_host = ?, \"key\" = ?, \
                pagination_mode = ?, since_param = ?, last_doc_id = ?, \
                cursor = ?, time_of_run = ?, \"final\" = ? \
             WHERE id = ?",
            params_from_iter(params),
        )?;
        Ok(())
    }

    fn delete_non_final(
        &self,
        scope: &CheckpointScope,
        table_names: &[String],
    ) -> error::Result<()> {
        let conn = self.lock_conn()?;
        let mut params = Vec::new();
        let clause = scope_clause(scope, table_names, &mut params);
        let sql = format!(
            "DELETE FROM commcare_export_runs WHERE {clause} AND \"final\" = 0"
        );
        conn.execute(&sql, params_from_iter(params))?;
        Ok(())
    }

    fn latest(
        &self,
        scope: &CheckpointScope,
        table_names: &[String],
    ) -> error::Result<Option<CheckpointRecord>> {
        let conn = self.lock_conn()?;
        let mut params = Vec::new();
        let clause = scope_clause(scope, table_names, &mut params);
        let sql = format!(
            "SELECT {COLUMNS} FROM commcare_export_runs WHERE {clause} \
             ORDER BY time_of_run DESC LIMIT 1"
        );
        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query_map(params_from_iter(params), record_from_row)?;
        rows.next().transpose().map_err(StateError::from)
    }

    fn list(&self, limit: u32) -> error::Result<Vec<CheckpointRecord>> {
        let conn = self.lock_conn()?;
        let sql = format!(
            "SELECT {COLUMNS} FROM commcare_export_runs \
             ORDER BY time_of_run DESC LIMIT ?"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([i64::from(limit)], record_from_row)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(StateError::from)
    }
}
