//! The export run: wire query, client, checkpoints, and writer
//! together; evaluate each dataset; finalize checkpoints.

use std::cell::RefCell;
use std::rc::Rc;

use chrono::Utc;

use hqexport_client::CommCareHqClient;
use hqexport_query::{eval, standard_env, Expr};
use hqexport_state::{CheckpointManager, CheckpointScope, CheckpointStore};
use hqexport_types::checkpoint::format_since;
use hqexport_types::writer::TableWriter;

use crate::bindings::{session_bindings, Session};
use crate::error::ExportError;
use crate::query_file::QueryFile;

/// Collaborators and options for one export run.
pub struct ExportRun {
    pub client: Rc<CommCareHqClient>,
    pub base_url: String,
    pub project: String,
    /// Checkpoint store, usually the destination database itself.
    /// Runs without one (JSON output) pull everything every time.
    pub store: Option<Rc<dyn CheckpointStore>>,
    pub writer: Rc<RefCell<dyn TableWriter>>,
    pub since: Option<String>,
    pub until: Option<String>,
    pub start_over: bool,
    pub batch_size: Option<u64>,
    pub checkpoint_key: Option<String>,
}

/// What happened, per dataset.
#[derive(Debug, Default)]
pub struct RunSummary {
    pub datasets: usize,
    /// Operator-readable messages for datasets that aborted. Their
    /// non-final checkpoints are retained so the next run resumes.
    pub failures: Vec<String>,
}

impl RunSummary {
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Run every dataset of `query`. A top-level `List` is one dataset
/// per item; anything else is a single dataset. Datasets are
/// independent: a failure in one aborts it but the rest still run.
pub fn run_export(query: &QueryFile, run: &ExportRun) -> Result<RunSummary, ExportError> {
    let run_start = format_since(Utc::now().naive_utc());

    let root_manager = match &run.store {
        Some(store) => {
            let scope = CheckpointScope {
                query_file_name: query.name.clone(),
                query_file_md5: query.md5.clone(),
                key: run.checkpoint_key.clone(),
                project: run.project.clone(),
                commcare_host: run.base_url.clone(),
            };
            Some(Rc::new(CheckpointManager::new(store.clone(), scope)?))
        }
        None => None,
    };

    let datasets: Vec<Expr> = match &query.expr {
        Expr::List(items) => items.clone(),
        other => vec![other.clone()],
    };

    let mut summary = RunSummary {
        datasets: datasets.len(),
        ..RunSummary::default()
    };

    for (idx, dataset) in datasets.iter().enumerate() {
        let registry = Rc::new(RefCell::new(Vec::new()));
        let session = Rc::new(Session {
            client: run.client.clone(),
            base_url: run.base_url.clone(),
            root_manager: root_manager.clone(),
            registry: registry.clone(),
            since_override: run.since.clone(),
            until: run.until.clone(),
            start_over: run.start_over,
            batch_size: run.batch_size,
        });
        let default_manager = root_manager
            .as_ref()
            .map(|root| Rc::new(root.for_dataset(None, dataset.emitted_tables())));

        let bindings = session_bindings(&session, default_manager.as_ref());
        let env = standard_env(bindings, run.writer.clone());

        match eval(dataset, &env) {
            Ok(_) => {
                if let Err(e) = finalize_dataset(&session, &run_start) {
                    tracing::error!(dataset = idx, error = %e, "could not finalize checkpoints");
                    summary.failures.push(format!("dataset {idx}: {e}"));
                }
            }
            Err(e) => {
                tracing::error!(dataset = idx, error = %e, "dataset aborted");
                summary.failures.push(format!("dataset {idx}: {e}"));
            }
        }
    }

    run.writer.borrow_mut().close()?;
    Ok(summary)
}

/// Write final checkpoints for every manager the dataset actually
/// used. Managers that never saw a batch get the run start time, so
/// the next run picks up from here.
fn finalize_dataset(session: &Session, run_start: &str) -> Result<(), ExportError> {
    for entry in session.registry.borrow().iter() {
        if entry.manager.used() {
            entry.manager.finalize(entry.mode.get(), run_start)?;
        }
    }
    Ok(())
}
