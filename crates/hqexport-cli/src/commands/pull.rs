//! The `pull` command: run one export end to end.

use std::cell::RefCell;
use std::path::Path;
use std::process::ExitCode;
use std::rc::Rc;
use std::str::FromStr;

use clap::Args;

use hqexport_client::{Auth, CommCareHqClient, ReqwestFetcher};
use hqexport_engine::{run_export, ExportError, ExportRun, OutputFormat, QueryFile};
use hqexport_state::{CheckpointStore, PostgresCheckpointStore, SqliteCheckpointStore};
use hqexport_types::writer::TableWriter;
use hqexport_writer::{InMemoryWriter, PostgresSqlBackend, SqlTableWriter, SqliteSqlBackend};

const USER_AGENT: &str = concat!("hqexport/", env!("CARGO_PKG_VERSION"));

#[derive(Args)]
pub struct PullArgs {
    /// Project space to pull from
    #[arg(long)]
    pub project: String,

    /// Query file path, or inline query JSON
    #[arg(long)]
    pub query: String,

    /// Output format: json or sql
    #[arg(long, default_value = "json")]
    pub output_format: String,

    /// Output file, SQLite path, or postgresql:// URL. JSON output
    /// prints to stdout when omitted.
    #[arg(long)]
    pub output: Option<String>,

    #[arg(long)]
    pub username: Option<String>,

    #[arg(long, env = "COMMCARE_HQ_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,

    #[arg(long, env = "COMMCARE_HQ_API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,

    /// Authentication scheme: basic, apikey, or bearer. Inferred from
    /// the supplied credentials when omitted.
    #[arg(long)]
    pub auth_mode: Option<String>,

    /// Pull records changed on or after this timestamp, overriding
    /// any checkpoint
    #[arg(long)]
    pub since: Option<String>,

    /// Pull records changed before this timestamp
    #[arg(long)]
    pub until: Option<String>,

    /// Ignore checkpoints and pull everything
    #[arg(long)]
    pub start_over: bool,

    /// Records per page / rows per write batch
    #[arg(long)]
    pub batch_size: Option<u64>,

    /// Extra key separating checkpoints of otherwise identical runs
    #[arg(long)]
    pub checkpoint_key: Option<String>,

    #[arg(long, default_value = "https://www.commcarehq.org")]
    pub commcare_hq: String,

    /// Fail on column type conflicts instead of widening
    #[arg(long)]
    pub strict_types: bool,
}

pub fn execute(args: &PullArgs) -> Result<ExitCode, ExportError> {
    let format = OutputFormat::from_str(&args.output_format)?;
    let query = load_query(&args.query)?;
    let client = build_client(args)?;

    let (writer, memory, store) = build_destination(args, format)?;

    let run = ExportRun {
        client,
        base_url: args.commcare_hq.trim_end_matches('/').to_owned(),
        project: args.project.clone(),
        store,
        writer,
        since: args.since.clone(),
        until: args.until.clone(),
        start_over: args.start_over,
        batch_size: args.batch_size,
        checkpoint_key: args.checkpoint_key.clone(),
    };

    let summary = run_export(&query, &run)?;

    if let Some(memory) = memory {
        let doc = serde_json::to_string_pretty(&memory.borrow().to_json())
            .map_err(|e| ExportError::Other(e.into()))?;
        match &args.output {
            Some(path) => std::fs::write(path, doc)?,
            None => println!("{doc}"),
        }
    }

    if summary.is_success() {
        tracing::info!(datasets = summary.datasets, "export complete");
        Ok(ExitCode::SUCCESS)
    } else {
        for failure in &summary.failures {
            tracing::error!("{failure}");
        }
        Ok(ExitCode::from(1))
    }
}

fn load_query(query: &str) -> Result<QueryFile, ExportError> {
    let path = Path::new(query);
    if path.exists() {
        QueryFile::load(path)
    } else if query.trim_start().starts_with('{') {
        QueryFile::from_inline(query)
    } else {
        Err(ExportError::Config(format!(
            "query file '{query}' does not exist"
        )))
    }
}

fn build_client(args: &PullArgs) -> Result<Rc<CommCareHqClient>, ExportError> {
    let auth = match args.auth_mode.as_deref() {
        Some("basic") => match (&args.username, &args.password) {
            (Some(username), Some(password)) => Auth::Basic {
                username: username.clone(),
                password: password.clone(),
            },
            _ => {
                return Err(ExportError::Config(
                    "basic auth requires --username and --password".to_owned(),
                ))
            }
        },
        Some("apikey") => match (&args.username, &args.api_key) {
            (Some(username), Some(key)) => Auth::ApiKey {
                username: username.clone(),
                key: key.clone(),
            },
            _ => {
                return Err(ExportError::Config(
                    "apikey auth requires --username and --api-key".to_owned(),
                ))
            }
        },
        Some("bearer") => match &args.api_key {
            Some(token) => Auth::Bearer {
                token: token.clone(),
            },
            None => {
                return Err(ExportError::Config(
                    "bearer auth requires the token in --api-key".to_owned(),
                ))
            }
        },
        Some(other) => {
            return Err(ExportError::Config(format!(
                "unknown auth mode '{other}' (expected basic, apikey, or bearer)"
            )))
        }
        None => match (&args.username, &args.api_key, &args.password) {
            (Some(username), Some(key), _) => Auth::ApiKey {
                username: username.clone(),
                key: key.clone(),
            },
            (Some(username), None, Some(password)) => Auth::Basic {
                username: username.clone(),
                password: password.clone(),
            },
            _ => {
                return Err(ExportError::Config(
                    "credentials required: --username with --api-key or --password \
                     (or the COMMCARE_HQ_API_KEY / COMMCARE_HQ_PASSWORD environment variables)"
                        .to_owned(),
                ))
            }
        },
    };
    let fetcher = ReqwestFetcher::new(auth, USER_AGENT)?;
    Ok(Rc::new(CommCareHqClient::new(
        Rc::new(fetcher),
        &args.commcare_hq,
        &args.project,
    )))
}

type Destination = (
    Rc<RefCell<dyn TableWriter>>,
    Option<Rc<RefCell<InMemoryWriter>>>,
    Option<Rc<dyn CheckpointStore>>,
);

/// JSON output buffers in memory with no checkpoint store; SQL
/// output lands rows and checkpoints in the same database.
fn build_destination(args: &PullArgs, format: OutputFormat) -> Result<Destination, ExportError> {
    match format {
        OutputFormat::Json => {
            let memory = Rc::new(RefCell::new(InMemoryWriter::new()));
            Ok((memory.clone(), Some(memory), None))
        }
        OutputFormat::Sql => {
            let url = args.output.as_deref().ok_or_else(|| {
                ExportError::Config("--output is required for sql output".to_owned())
            })?;
            let batch = args.batch_size.unwrap_or(0) as usize;
            if url.starts_with("postgres://") || url.starts_with("postgresql://") {
                let backend = PostgresSqlBackend::connect(url)?;
                let mut writer =
                    SqlTableWriter::new(backend).with_strict_types(args.strict_types);
                if batch > 0 {
                    writer = writer.with_batch_size(batch);
                }
                let store = Rc::new(PostgresCheckpointStore::connect(url)?);
                Ok((
                    Rc::new(RefCell::new(writer)),
                    None,
                    Some(store as Rc<dyn CheckpointStore>),
                ))
            } else {
                let backend = SqliteSqlBackend::open(url)?;
                let mut writer =
                    SqlTableWriter::new(backend).with_strict_types(args.strict_types);
                if batch > 0 {
                    writer = writer.with_batch_size(batch);
                }
                let store = Rc::new(SqliteCheckpointStore::open(std::path::Path::new(url))?);
                Ok((
                    Rc::new(RefCell::new(writer)),
                    None,
                    Some(store as Rc<dyn CheckpointStore>),
                ))
            }
        }
    }
}
