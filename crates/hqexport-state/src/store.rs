//! Checkpoint store trait definition.
//!
//! [`CheckpointStore`] defines the durable storage contract for the
//! `commcare_export_runs` table. Model types live in
//! [`hqexport_types::checkpoint`].

use hqexport_types::checkpoint::CheckpointRecord;

use crate::error;

/// Identifies whose progress a checkpoint row records: one query
/// against one project on one host, plus the optional operator key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointScope {
    pub query_file_name: Option<String>,
    pub query_file_md5: String,
    pub key: Option<String>,
    pub project: String,
    pub commcare_host: String,
}

/// Storage contract for checkpoint rows.
pub trait CheckpointStore {
    /// Bring the `commcare_export_runs` schema up to the current
    /// revision, creating it if absent. Idempotent.
    fn migrate(&self) -> error::Result<()>;

    /// Append one checkpoint row.
    fn insert(&self, record: &CheckpointRecord) -> error::Result<()>;

    /// Rewrite an existing row by id.
    fn update(&self, record: &CheckpointRecord) -> error::Result<()>;

    /// Delete every non-final row for the scope. With `table_names`,
    /// only rows for those tables are touched.
    fn delete_non_final(&self, scope: &CheckpointScope, table_names: &[String])
        -> error::Result<()>;

    /// Most recent row for the scope, restricted to `table_names`
    /// when non-empty.
    ///
    /// Returns `Ok(None)` when nothing has been persisted yet.
    fn latest(
        &self,
        scope: &CheckpointScope,
        table_names: &[String],
    ) -> error::Result<Option<CheckpointRecord>>;

    /// Most recent rows across all scopes, newest first.
    fn list(&self, limit: u32) -> error::Result<Vec<CheckpointRecord>>;
}

/// Column order shared by both backends.
pub(crate) const COLUMNS: &str = "id, query_file_name, query_file_md5, data_source, table_name, \
     project, commcare_host, \"key\", pagination_mode, since_param, \
     last_doc_id, cursor, time_of_run, \"final\"";
