//! `PostgreSQL`-backed implementation of [`CheckpointStore`].
//!
//! Uses the sync `postgres` crate with a single `Mutex<Client>`. The
//! `postgres` crate manages its own internal tokio runtime, so this
//! works from any thread.

use std::sync::{Mutex, MutexGuard};

use hqexport_types::checkpoint::{CheckpointRecord, PaginationMode};
use postgres::types::ToSql;
use postgres::{Client, NoTls, Row};

use crate::error::{self, StateError};
use crate::store::{CheckpointScope, CheckpointStore, COLUMNS};

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
        "final" BOOLEAN NOT NULL DEFAULT FALSE
    )"#,
    // v2: persisted pagination strategy
    r#"ALTER TABLE commcare_export_runs ADD COLUMN pagination_mode TEXT"#,
    // v3: opaque cursor token
    r#"ALTER TABLE commcare_export_runs ADD COLUMN cursor TEXT"#,
];

/// `PostgreSQL`-backed checkpoint storage.
pub struct PostgresCheckpointStore {
    client: Mutex<Client>,
}

impl PostgresCheckpointStore {
    /// Connect to the database named by a `postgresql://` URL.
    pub fn connect(url: &str) -> error::Result<Self> {
        let client = Client::connect(url, NoTls)?;
        Ok(Self {
            client: Mutex::new(client),
        })
    }

    fn lock_client(&self) -> error::Result<MutexGuard<'_, Client>> {
        self.client.lock().map_err(|_| StateError::LockPoisoned)
    }
}

fn record_from_row(row: &Row) -> CheckpointRecord {
    let mode: Option<String> = row.get(8);
    CheckpointRecord {
        id: row.get(0),
        query_file_name: row.get(1),
        query_file_md5: row.get(2),
        data_source: row.get(3),
        table_name: row.get(4),
        project: row.get(5),
        commcare_host: row.get(6),
        key: row.get(7),
        pagination_mode: mode
            .as_deref()
            .and_then(PaginationMode::parse)
            .unwrap_or(PaginationMode::DateModified),
        since_param: row.get(9),
        last_doc_id: row.get(10),
        cursor: row.get(11),
        time_of_run: row.get(12),
        is_final: row.get(13),
    }
}

/// WHERE clause for a scope with `$n` placeholders starting at
/// `params.len() + 1`.
fn scope_clause<'a>(
    scope: &'a CheckpointScope,
    table_names: &'a [String],
    params: &mut Vec<&'a (dyn ToSql + Sync)>,
) -> String {
    params.push(&scope.query_file_md5);
    params.push(&scope.project);
    params.push(&scope.commcare_host);
    params.push(&scope.key);
    let mut clause = format!(
        "query_file_md5 = ${} AND project = ${} AND commcare_host = ${} \
         AND \"key\" IS NOT DISTINCT FROM ${}",
        params.len() - 3,
        params.len() - 2,
        params.len() - 1,
        params.len(),
    );
    if !table_names.is_empty() {
        let mut placeholders = Vec::with_capacity(table_names.len());
        for name in table_names {
            params.push(name);
            placeholders.push(format!("${}", params.len()));
        }
        clause.push_str(&format!(" AND table_name IN ({})", placeholders.join(", ")));
    }
    clause
}

fn record_params(record: &CheckpointRecord) -> (String, Vec<&(dyn ToSql + Sync)>) {
    let mode = record.pagination_mode.as_str();
    // mode is 'static so the reference outlives the call
    let params: Vec<&(dyn ToSql + Sync)> = vec![
        &record.id,
        &record.query_file_name,
        &record.query_file_md5,
        &record.data_source,
        &record.table_name,
        &record.project,
        &record.commcare_host,
        &record.key,
        mode_ref(mode),
        &record.since_param,
        &record.last_doc_id,
        &record.cursor,
        &record.time_of_run,
        &record.is_final,
    ];
    let placeholders = (1..=params.len())
        .map(|n| format!("${n}"))
        .collect::<Vec<_>>()
        .join(", ");
    (placeholders, params)
}

fn mode_ref(mode: &'static str) -> &'static (dyn ToSql + Sync) {
    match mode {
        "date_indexed" => &"date_indexed",
        "date_modified" => &"date_modified",
        "cursor" => &"cursor",
        _ => &"offset",
    }
}

impl CheckpointStore for PostgresCheckpointStore {
    fn migrate(&self) -> error::Result<()> {
        let mut client = self.lock_client()?;
        client.batch_execute(
            "CREATE TABLE IF NOT EXISTS schema_version (version BIGINT NOT NULL)",
        )?;
        let row = client.query_one("SELECT COALESCE(MAX(version), 0) FROM schema_version", &[])?;
        let current: i64 = row.get(0);
        for (i, migration) in MIGRATIONS.iter().enumerate() {
            let version = i as i64 + 1;
            if version <= current {
                continue;
            }
            client.batch_execute(migration)?;
            client.execute("INSERT INTO schema_version (version) VALUES ($1)", &[&version])?;
            tracing::debug!(version, "applied checkpoint schema migration");
        }
        Ok(())
    }

    fn insert(&self, record: &CheckpointRecord) -> error::Result<()> {
        let mut client = self.lock_client()?;
        let (placeholders, params) = record_params(record);
        let sql = format!("INSERT INTO commcare_export_runs ({COLUMNS}) VALUES ({placeholders})");
        client.execute(&sql, &params)?;
        Ok(())
    }

    fn update(&self, record: &CheckpointRecord) -> error::Result<()> {
        let mut client = self.lock_client()?;
        let (_, params) = record_params(record);
        client.execute(
            "UPDATE commcare_export_runs SET \
                query_file_name = $2, query_file_md5 = $3, data_source = $4, \
                table_name = $5, project = $6, commcare_host = $7, \"key\" = $8, \
                pagination_mode = $9, since_param = $10, last_doc_id = $11, \
                cursor = $12, time_of_run = $13, \"final\" = $14 \
             WHERE id = $1",
            &params,
        )?;
        Ok(())
    }

    fn delete_non_final(
        &self,
        scope: &CheckpointScope,
        table_names: &[String],
    ) -> error::Result<()> {
        let mut client = self.lock_client()?;
        let mut params = Vec::new();
        let clause = scope_clause(scope, table_names, &mut params);
        let sql =
            format!("DELETE FROM commcare_export_runs WHERE {clause} AND \"final\" = FALSE");
        client.execute(&sql, &params)?;
        Ok(())
    }

    fn latest(
        &self,
        scope: &CheckpointScope,
        table_names: &[String],
    ) -> error::Result<Option<CheckpointRecord>> {
        let mut client = self.lock_client()?;
        let mut params = Vec::new();
        let clause = scope_clause(scope, table_names, &mut params);
        let sql = format!(
            "SELECT {COLUMNS} FROM commcare_export_runs WHERE {clause} \
             ORDER BY time_of_run DESC LIMIT 1"
        );
        let rows = client.query(&sql, &params)?;
        Ok(rows.first().map(record_from_row))
    }

    fn list(&self, limit: u32) -> error::Result<Vec<CheckpointRecord>> {
        let mut client = self.lock_client()?;
        let limit = i64::from(limit);
        let sql = format!(
            "SELECT {COLUMNS} FROM commcare_export_runs \
             ORDER BY time_of_run DESC LIMIT $1"
        );
        let rows = client.query(&sql, &[&limit])?;
        Ok(rows.iter().map(record_from_row).collect())
    }
}
