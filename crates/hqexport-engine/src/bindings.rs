//! Ambient bindings the orchestrator injects into the query
//! environment: the paginated data source, the checkpoint manager
//! factory, and the base URL used by the URL-building helpers.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;

use hqexport_client::{
    date_field, default_pagination_mode, paginator_for, CheckpointCallback, CommCareHqClient,
};
use hqexport_query::{Env, EvalError, RestartableSeq, SeqIter, Value};
use hqexport_state::CheckpointManager;
use hqexport_types::checkpoint::{PaginationMode, PaginationState};

/// One checkpoint manager in play during a dataset, with the
/// pagination mode its data source settled on. The mode is needed
/// again at finalization time.
pub struct ManagerEntry {
    pub manager: Rc<CheckpointManager>,
    pub mode: Cell<PaginationMode>,
}

pub type ManagerRegistry = Rc<RefCell<Vec<ManagerEntry>>>;

/// Everything a dataset evaluation needs from the orchestrator.
pub struct Session {
    pub client: Rc<CommCareHqClient>,
    pub base_url: String,
    /// Scope-level manager; datasets derive table-bound managers
    /// from it. Absent when the destination has no checkpoint store.
    pub root_manager: Option<Rc<CheckpointManager>>,
    pub registry: ManagerRegistry,
    pub since_override: Option<String>,
    pub until: Option<String>,
    pub start_over: bool,
    pub batch_size: Option<u64>,
}

impl Session {
    fn register(&self, manager: &Rc<CheckpointManager>) {
        self.registry.borrow_mut().push(ManagerEntry {
            manager: manager.clone(),
            mode: Cell::new(PaginationMode::DateIndexed),
        });
    }

    fn set_mode(&self, manager: &Rc<CheckpointManager>, mode: PaginationMode) {
        for entry in self.registry.borrow().iter() {
            if Rc::ptr_eq(&entry.manager, manager) {
                entry.mode.set(mode);
                return;
            }
        }
    }
}

/// Build the name→value map for one dataset evaluation.
pub fn session_bindings(
    session: &Rc<Session>,
    default_manager: Option<&Rc<CheckpointManager>>,
) -> HashMap<String, Value> {
    let mut bindings = HashMap::new();
    bindings.insert(
        "commcarehq_base_url".to_owned(),
        Value::string(session.base_url.clone()),
    );
    if let Some(mgr) = default_manager {
        session.register(mgr);
        bindings.insert(
            "checkpoint_manager".to_owned(),
            Value::Extern(mgr.clone() as Rc<dyn Any>),
        );
    }

    let s = session.clone();
    bindings.insert(
        "api_data".to_owned(),
        Value::Fn(
            "api_data".to_owned(),
            Rc::new(move |env, args| api_data(&s, env, args)),
        ),
    );

    let s = session.clone();
    bindings.insert(
        "get_checkpoint_manager".to_owned(),
        Value::Fn(
            "get_checkpoint_manager".to_owned(),
            Rc::new(move |_env, args| get_checkpoint_manager(&s, args)),
        ),
    );

    bindings
}

fn str_arg(args: &[Value], idx: usize, func: &str) -> Result<String, EvalError> {
    match args.get(idx) {
        Some(Value::Json(serde_json::Value::String(s))) => Ok(s.clone()),
        other => Err(EvalError::Type(format!(
            "{func} expects a string at argument {idx}, got {}",
            other.map_or_else(|| "nothing".to_owned(), |v| format!("{v:?}"))
        ))),
    }
}

fn manager_from_value(value: &Value) -> Option<Rc<CheckpointManager>> {
    match value {
        Value::Extern(obj) => obj.clone().downcast::<CheckpointManager>().ok(),
        _ => None,
    }
}

/// `api_data(resource, checkpoint_manager?, filters?)`: a restartable
/// stream of records from one list resource, checkpointing after
/// every productive page.
fn api_data(session: &Rc<Session>, env: &Env, args: &[Value]) -> Result<Value, EvalError> {
    let resource = str_arg(args, 0, "api_data")?;

    // explicit manager argument, else the ambient dataset manager
    let manager = args
        .get(1)
        .and_then(manager_from_value)
        .or_else(|| env.lookup("checkpoint_manager").ok().and_then(|v| manager_from_value(&v)));
    if let Some(mgr) = &manager {
        mgr.set_data_source(&resource);
    }

    let (mode, since, cursor) = resolve_resume(session, &resource, manager.as_deref())?;
    if let Some(mgr) = &manager {
        session.set_mode(mgr, mode);
    }

    let mut extra_params = filter_params(args.get(2))?;
    if let Some(until) = &session.until {
        if let Some(field) = date_field(&resource, mode) {
            extra_params.push((format!("{}_end", field.field), until.clone()));
        }
    }

    tracing::info!(
        resource = %resource,
        mode = %mode,
        since = since.as_deref().unwrap_or(""),
        "opening data source"
    );

    let session = session.clone();
    let producer = move || -> SeqIter {
        let paginator = paginator_for(
            &resource,
            mode,
            since.clone(),
            cursor.clone(),
            session.batch_size,
        );
        let checkpoint: CheckpointCallback = match manager.clone() {
            Some(mgr) => Box::new(move |state: &PaginationState| {
                mgr.record_batch(state, mode).map_err(anyhow::Error::new)?;
                Ok(())
            }),
            None => Box::new(|_| Ok(())),
        };
        let records = session
            .client
            .iterate(&resource, paginator, extra_params.clone(), checkpoint);
        Box::new(records.map(|item| match item {
            Ok(record) => Ok(Value::Json(record)),
            Err(e) => Err(EvalError::External(e.to_string())),
        }))
    };
    Ok(Value::Seq(RestartableSeq::new(producer)))
}

/// Resume rules: an explicit `--since` or `--start-over` wins and
/// uses the current default mode; otherwise the last checkpoint's
/// mode and position are preserved, legacy modes included.
fn resolve_resume(
    session: &Session,
    resource: &str,
    manager: Option<&CheckpointManager>,
) -> Result<(PaginationMode, Option<String>, Option<String>), EvalError> {
    let default_mode = default_pagination_mode(resource);
    if session.start_over || session.since_override.is_some() {
        return Ok((default_mode, session.since_override.clone(), None));
    }
    if let Some(mgr) = manager {
        if let Some(rec) = mgr
            .get_last_checkpoint()
            .map_err(|e| EvalError::External(e.to_string()))?
        {
            tracing::info!(
                since = rec.since_param.as_deref().unwrap_or(""),
                mode = %rec.pagination_mode,
                "resuming from checkpoint"
            );
            let (since, cursor) = if rec.pagination_mode == PaginationMode::Cursor {
                (None, rec.cursor)
            } else {
                (rec.since_param, None)
            };
            return Ok((rec.pagination_mode, since, cursor));
        }
    }
    Ok((default_mode, None, None))
}

fn filter_params(arg: Option<&Value>) -> Result<Vec<(String, String)>, EvalError> {
    let Some(value) = arg else {
        return Ok(Vec::new());
    };
    match value {
        Value::Json(serde_json::Value::Null) => Ok(Vec::new()),
        Value::Json(serde_json::Value::Object(map)) => Ok(map
            .iter()
            .map(|(k, v)| {
                let rendered = match v {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                (k.clone(), rendered)
            })
            .collect()),
        other => Err(EvalError::Type(format!(
            "api_data filters must be an object, got {other:?}"
        ))),
    }
}

/// `get_checkpoint_manager([table, ...])`: a manager bound to the
/// destination tables one data source feeds. Returns null when the
/// run has no checkpoint store.
fn get_checkpoint_manager(session: &Rc<Session>, args: &[Value]) -> Result<Value, EvalError> {
    let tables = match args.first() {
        Some(value) => match value.clone().into_json()? {
            serde_json::Value::Array(items) => items
                .into_iter()
                .map(|item| match item {
                    serde_json::Value::String(s) => Ok(s),
                    other => Err(EvalError::Type(format!(
                        "get_checkpoint_manager expects table names, got {other}"
                    ))),
                })
                .collect::<Result<Vec<_>, _>>()?,
            serde_json::Value::String(s) => vec![s],
            other => {
                return Err(EvalError::Type(format!(
                    "get_checkpoint_manager expects a list of table names, got {other}"
                )))
            }
        },
        None => Vec::new(),
    };

    let Some(root) = &session.root_manager else {
        return Ok(Value::null());
    };
    let manager = Rc::new(root.for_dataset(None, tables));
    session.register(&manager);
    Ok(Value::Extern(manager as Rc<dyn Any>))
}
