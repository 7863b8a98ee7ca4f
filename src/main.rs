use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use netdeploy::config::{LogFormat, RunnerKind, StorageBackend};

mod cmd;

#[derive(Parser)]
#[command(name = "netdeploy")]
#[command(version, about = "Deployment session orchestrator")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Console log format (pretty or json). Overrides logging.format.
    #[arg(long, global = true)]
    pub log_format: Option<LogFormat>,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    /// Config file. Defaults to .netdeploy/config.toml in the project directory.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the HTTP/WebSocket server
    Serve {
        /// Port to serve on
        #[arg(short, long)]
        port: Option<u16>,

        /// Database path (sqlite storage)
        #[arg(long)]
        db_path: Option<PathBuf>,

        /// Bind all interfaces and allow cross-origin requests
        #[arg(long)]
        dev: bool,

        /// Storage backend (memory or sqlite)
        #[arg(long)]
        storage: Option<StorageBackend>,

        /// Workload runner kind (process or scripted)
        #[arg(long)]
        runner: Option<RunnerKind>,

        /// Runner executable for the process runner
        #[arg(long)]
        runner_cmd: Option<String>,
    },
    /// Create the database schema and exit
    InitDb {
        #[arg(long)]
        db_path: Option<PathBuf>,
    },
    /// Show the stored status of a deployment
    Status {
        /// Deployment name
        name: String,

        #[arg(long)]
        db_path: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    let config = cmd::load_config(&project_dir, cli.config.as_deref())?;
    let _log_guard = netdeploy::logging::init_logging(
        cli.log_format.unwrap_or(config.logging.format),
        cli.verbose,
        config.logging.dir.as_deref(),
    )?;

    match cli.command {
        Commands::Serve {
            port,
            db_path,
            dev,
            storage,
            runner,
            runner_cmd,
        } => {
            let overrides = cmd::ServeOverrides {
                port,
                db_path,
                dev,
                storage,
                runner,
                runner_cmd,
            };
            cmd::cmd_serve(config, overrides).await?;
        }
        Commands::InitDb { db_path } => {
            cmd::cmd_init_db(&db_path.unwrap_or(config.storage.db_path))?;
        }
        Commands::Status { name, db_path } => {
            cmd::cmd_status(&db_path.unwrap_or(config.storage.db_path), &name)?;
        }
    }

    Ok(())
}
