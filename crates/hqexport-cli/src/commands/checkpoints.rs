//! The `checkpoints` command: show recorded progress.

use std::process::ExitCode;

use hqexport_engine::ExportError;
use hqexport_state::{CheckpointStore, PostgresCheckpointStore, SqliteCheckpointStore};

pub fn execute(output: &str, limit: u32) -> Result<ExitCode, ExportError> {
    let store: Box<dyn CheckpointStore> =
        if output.starts_with("postgres://") || output.starts_with("postgresql://") {
            Box::new(PostgresCheckpointStore::connect(output)?)
        } else {
            Box::new(SqliteCheckpointStore::open(std::path::Path::new(output))?)
        };
    store.migrate()?;

    let rows = store.list(limit)?;
    if rows.is_empty() {
        println!("no checkpoints recorded");
        return Ok(ExitCode::SUCCESS);
    }

    println!(
        "{:<28} {:<20} {:<14} {:<22} {:<6} {}",
        "time of run", "table", "mode", "since", "final", "last doc id"
    );
    for row in rows {
        println!(
            "{:<28} {:<20} {:<14} {:<22} {:<6} {}",
            row.time_of_run,
            row.table_name.as_deref().unwrap_or("-"),
            row.pagination_mode,
            row.since_param.as_deref().unwrap_or("-"),
            if row.is_final { "yes" } else { "no" },
            row.last_doc_id.as_deref().unwrap_or("-"),
        );
    }
    Ok(ExitCode::SUCCESS)
}
