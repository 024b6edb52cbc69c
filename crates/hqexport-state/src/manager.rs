//! Checkpoint manager: the per-dataset view over the store.
//!
//! One manager instance is scoped to a query/project/host (plus the
//! optional operator key). `for_dataset` narrows it to one data
//! source and the destination tables it feeds; the client's page
//! callback then records batches through it.

use std::cell::RefCell;
use std::rc::Rc;

use chrono::Utc;
use hqexport_types::checkpoint::{CheckpointRecord, PaginationMode, PaginationState};
use uuid::Uuid;

use crate::error;
use crate::store::{CheckpointScope, CheckpointStore};

/// Timestamp format for `time_of_run`. Microseconds keep rows within
/// the same second ordered.
const RUN_TIME_FMT: &str = "%Y-%m-%dT%H:%M:%S%.6f";

pub struct CheckpointManager {
    store: Rc<dyn CheckpointStore>,
    scope: CheckpointScope,
    data_source: RefCell<Option<String>>,
    table_names: Vec<String>,
    last_state: RefCell<Option<PaginationState>>,
}

impl CheckpointManager {
    pub fn new(store: Rc<dyn CheckpointStore>, scope: CheckpointScope) -> error::Result<Self> {
        store.migrate()?;
        Ok(Self {
            store,
            scope,
            data_source: RefCell::new(None),
            table_names: Vec::new(),
            last_state: RefCell::new(None),
        })
    }

    /// Narrow this manager to one dataset: the remote collection it
    /// pulls from and the destination tables it writes.
    #[must_use]
    pub fn for_dataset(&self, data_source: Option<&str>, table_names: Vec<String>) -> Self {
        Self {
            store: self.store.clone(),
            scope: self.scope.clone(),
            data_source: RefCell::new(data_source.map(ToOwned::to_owned)),
            table_names,
            last_state: RefCell::new(None),
        }
    }

    pub fn set_data_source(&self, data_source: &str) {
        *self.data_source.borrow_mut() = Some(data_source.to_owned());
    }

    #[must_use]
    pub fn data_source(&self) -> Option<String> {
        self.data_source.borrow().clone()
    }

    #[must_use]
    pub fn table_names(&self) -> &[String] {
        &self.table_names
    }

    /// `true` once this manager has recorded progress or been tied to
    /// a data source; only such managers get a final checkpoint.
    #[must_use]
    pub fn used(&self) -> bool {
        self.data_source.borrow().is_some() || self.last_state.borrow().is_some()
    }

    /// Most recent checkpoint for this dataset's tables.
    pub fn get_last_checkpoint(&self) -> error::Result<Option<CheckpointRecord>> {
        self.store.latest(&self.scope, &self.table_names)
    }

    /// Latest checkpoint per destination table.
    pub fn get_latest_checkpoints(&self) -> error::Result<Vec<CheckpointRecord>> {
        let mut out = Vec::with_capacity(self.table_names.len());
        for table in &self.table_names {
            if let Some(rec) = self
                .store
                .latest(&self.scope, std::slice::from_ref(table))?
            {
                out.push(rec);
            }
        }
        Ok(out)
    }

    /// Insert one checkpoint row per bound table. A final checkpoint
    /// collapses the scope: all non-final rows for these tables are
    /// deleted after the final rows land.
    pub fn set_checkpoint(
        &self,
        since: Option<&str>,
        pagination_mode: PaginationMode,
        is_final: bool,
        doc_id: Option<&str>,
        cursor: Option<&str>,
    ) -> error::Result<()> {
        let time_of_run = Utc::now().format(RUN_TIME_FMT).to_string();
        let tables: Vec<Option<String>> = if self.table_names.is_empty() {
            vec![None]
        } else {
            self.table_names.iter().cloned().map(Some).collect()
        };
        for table_name in tables {
            let record = CheckpointRecord {
                id: Uuid::new_v4().to_string(),
                query_file_name: self.scope.query_file_name.clone(),
                query_file_md5: self.scope.query_file_md5.clone(),
                data_source: self.data_source.borrow().clone(),
                table_name,
                project: self.scope.project.clone(),
                commcare_host: self.scope.commcare_host.clone(),
                key: self.scope.key.clone(),
                pagination_mode,
                since_param: since.map(ToOwned::to_owned),
                last_doc_id: doc_id.map(ToOwned::to_owned),
                cursor: cursor.map(ToOwned::to_owned),
                time_of_run: time_of_run.clone(),
                is_final,
            };
            self.store.insert(&record)?;
        }
        if is_final {
            self.store.delete_non_final(&self.scope, &self.table_names)?;
        }
        Ok(())
    }

    /// Record one page of progress as a non-final checkpoint.
    pub fn record_batch(
        &self,
        state: &PaginationState,
        pagination_mode: PaginationMode,
    ) -> error::Result<()> {
        *self.last_state.borrow_mut() = Some(state.clone());
        tracing::debug!(
            since = state.since.as_deref().unwrap_or(""),
            last_doc_id = state.last_doc_id.as_deref().unwrap_or(""),
            "writing batch checkpoint"
        );
        self.set_checkpoint(
            state.since.as_deref(),
            pagination_mode,
            false,
            state.last_doc_id.as_deref(),
            state.cursor.as_deref(),
        )
    }

    /// Write the final checkpoint for a completed dataset. When no
    /// batch recorded a timestamp, `fallback_since` (the run start
    /// time) is used so the next run picks up from here.
    pub fn finalize(
        &self,
        pagination_mode: PaginationMode,
        fallback_since: &str,
    ) -> error::Result<()> {
        let state = self.last_state.borrow().clone().unwrap_or_default();
        let since = state.since.as_deref().unwrap_or(fallback_since);
        self.set_checkpoint(
            Some(since),
            pagination_mode,
            true,
            state.last_doc_id.as_deref(),
            state.cursor.as_deref(),
        )
    }

    /// Read-only listing, newest first.
    pub fn list_checkpoints(&self, limit: u32) -> error::Result<Vec<CheckpointRecord>> {
        self.store.list(limit)
    }

    /// Rewrite one row (operator tooling).
    pub fn update_checkpoint(&self, record: &CheckpointRecord) -> error::Result<()> {
        self.store.update(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sqlite::SqliteCheckpointStore;

    fn manager() -> CheckpointManager {
        let store = Rc::new(SqliteCheckpointStore::in_memory().unwrap());
        let scope = CheckpointScope {
            query_file_name: Some("query.json".into()),
            query_file_md5: "abc123".into(),
            key: None,
            project: "demo".into(),
            commcare_host: "https://www.commcarehq.org".into(),
        };
        CheckpointManager::new(store, scope).unwrap()
    }

    fn state(since: &str, doc: &str) -> PaginationState {
        PaginationState {
            since: Some(since.into()),
            cursor: None,
            last_doc_id: Some(doc.into()),
        }
    }

    #[test]
    fn final_checkpoint_collapses_non_finals() {
        let m = manager().for_dataset(Some("form"), vec!["forms".into()]);
        for (since, doc) in [
            ("2017-01-01T00:00:00", "doc 1"),
            ("2017-01-02T00:00:00", "doc 2"),
            ("2017-01-03T00:00:00", "doc 3"),
        ] {
            m.record_batch(&state(since, doc), PaginationMode::DateIndexed)
                .unwrap();
        }
        m.finalize(PaginationMode::DateIndexed, "2017-01-04T00:00:00")
            .unwrap();

        let rows = m.list_checkpoints(10).unwrap();
        assert_eq!(rows.len(), 1);
        assert!(rows[0].is_final);
        assert_eq!(rows[0].since_param.as_deref(), Some("2017-01-03T00:00:00"));
        assert_eq!(rows[0].last_doc_id.as_deref(), Some("doc 3"));
    }

    #[test]
    fn final_since_is_at_least_the_last_non_final() {
        let m = manager().for_dataset(Some("form"), vec!["forms".into()]);
        m.record_batch(
            &state("2017-01-01T00:00:00", "doc 1"),
            PaginationMode::DateIndexed,
        )
        .unwrap();
        m.finalize(PaginationMode::DateIndexed, "2016-01-01T00:00:00")
            .unwrap();
        let latest = m.get_last_checkpoint().unwrap().unwrap();
        assert!(latest.since_param.as_deref() >= Some("2017-01-01T00:00:00"));
    }

    #[test]
    fn fallback_since_used_when_no_batches_ran() {
        let m = manager().for_dataset(Some("user"), vec!["users".into()]);
        m.finalize(PaginationMode::Offset, "2017-06-01T12:00:00")
            .unwrap();
        let latest = m.get_last_checkpoint().unwrap().unwrap();
        assert_eq!(latest.since_param.as_deref(), Some("2017-06-01T12:00:00"));
        assert_eq!(latest.pagination_mode, PaginationMode::Offset);
    }

    #[test]
    fn one_row_per_bound_table() {
        let m = manager().for_dataset(Some("form"), vec!["forms".into(), "repeats".into()]);
        m.record_batch(
            &state("2017-01-01T00:00:00", "doc 1"),
            PaginationMode::DateIndexed,
        )
        .unwrap();
        let rows = m.list_checkpoints(10).unwrap();
        assert_eq!(rows.len(), 2);
        let mut tables: Vec<_> = rows.iter().filter_map(|r| r.table_name.clone()).collect();
        tables.sort();
        assert_eq!(tables, vec!["forms", "repeats"]);
    }

    #[test]
    fn resume_reads_the_latest_non_final() {
        let m = manager().for_dataset(Some("form"), vec!["forms".into()]);
        m.record_batch(
            &state("2012-04-24T05:13:01", "doc 2"),
            PaginationMode::DateIndexed,
        )
        .unwrap();

        // a fresh manager for the same scope sees the in-flight row
        let m2 = m.for_dataset(Some("form"), vec!["forms".into()]);
        let resumed = m2.get_last_checkpoint().unwrap().unwrap();
        assert!(!resumed.is_final);
        assert_eq!(resumed.since_param.as_deref(), Some("2012-04-24T05:13:01"));
        assert_eq!(resumed.pagination_mode, PaginationMode::DateIndexed);
    }

    #[test]
    fn latest_checkpoints_are_per_table() {
        let m = manager().for_dataset(Some("form"), vec!["a".into(), "b".into()]);
        m.record_batch(
            &state("2017-01-01T00:00:00", "doc 1"),
            PaginationMode::DateIndexed,
        )
        .unwrap();
        let per_table = m.get_latest_checkpoints().unwrap();
        assert_eq!(per_table.len(), 2);
    }

    #[test]
    fn unused_manager_reports_not_used() {
        let m = manager().for_dataset(None, vec!["t".into()]);
        assert!(!m.used());
        m.set_data_source("case");
        assert!(m.used());
    }
}
