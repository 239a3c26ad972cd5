use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use proxytap::{
    capture::{CaptureError, CaptureService, resolve_id},
    config::Config,
    logging,
    projection::Projection,
};

#[derive(Debug, Parser)]
#[command(name = "proxytap")]
struct Cli {
    /// Path to config TOML.
    #[arg(long, global = true, default_value = "proxytap.toml")]
    config: PathBuf,
    /// Override the configured log level.
    #[arg(long, global = true)]
    log_level: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print request logs matching a filter, most recent first, as JSON
    /// lines.
    Query {
        /// Search filter, e.g. `method:POST url:/login`.
        #[arg(long, default_value = "")]
        filter: String,
    },
    /// Print a single request log by id.
    Show { id: String },
    /// Delete every request log from the store.
    Wipe,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = Config::from_path(&cli.config)?;
    logging::init(config.logging.as_ref(), cli.log_level.as_deref())?;

    let service = CaptureService::open(&config)?;
    let cancel = CancellationToken::new();

    match cli.command {
        Command::Query { filter } => {
            let logs = service
                .find_all(&filter, &Projection::full(), &cancel)
                .await?;
            for log in &logs {
                println!("{}", serde_json::to_string(log)?);
            }
        }
        Command::Show { id } => {
            let id = resolve_id(&id)?;
            match service.find_by_id(id, &Projection::full(), &cancel).await {
                Ok(log) => println!("{}", serde_json::to_string_pretty(&log)?),
                Err(CaptureError::NotFound) => {
                    eprintln!("request log {id} not found");
                    std::process::exit(1);
                }
                Err(err) => return Err(err.into()),
            }
        }
        Command::Wipe => {
            service.wipe(&cancel).await?;
            eprintln!("store wiped");
        }
    }

    Ok(())
}
