mod commands;
mod logging;

use std::process::ExitCode;

use clap::{Parser, Subcommand};

use commands::pull::PullArgs;

#[derive(Parser)]
#[command(
    name = "hqexport",
    version,
    about = "Export CommCare HQ data into relational tables"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Pull data described by a query file into the destination
    Pull(PullArgs),
    /// List recorded checkpoints in a destination database
    Checkpoints {
        /// Destination database (SQLite path or postgresql:// URL)
        #[arg(long)]
        output: String,
        /// Newest rows to show
        #[arg(long, default_value_t = 20)]
        limit: u32,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    logging::init(&cli.log_level);

    let result = match cli.command {
        Commands::Pull(args) => commands::pull::execute(&args),
        Commands::Checkpoints { output, limit } => commands::checkpoints::execute(&output, limit),
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = %e, "export failed");
            ExitCode::from(u8::try_from(e.exit_code()).unwrap_or(1))
        }
    }
}
