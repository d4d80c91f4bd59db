use anyhow::Result;
use clap::{Parser, Subcommand};
use sdlc::config::Config;
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

mod cmd;

#[derive(Parser)]
#[command(name = "sdlc")]
#[command(version, about = "Multi-repo SDLC pipeline driven by Claude agents")]
pub struct Cli {
    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to the SQLite database (overrides SDLC_DB)
    #[arg(long, global = true)]
    pub db: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the dashboard API and WebSocket server
    Serve {
        /// Port to listen on (overrides PORT)
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Create a new run from a manifest
    Init {
        /// Manifest file listing the PRD and repositories
        #[arg(default_value = "manifest.yaml")]
        manifest: PathBuf,
    },
    /// Run the pipeline from the current phase until the next approval gate
    Run,
    /// Run a single phase of the latest run
    Phase {
        /// Phase name (design, bootstrap, planning, tracking, executing)
        name: String,
        /// Phase parameter as key=value (repeatable)
        #[arg(long = "param", value_parser = cmd::run::parse_param)]
        params: Vec<(String, String)>,
    },
    /// Approve the pending gate and continue the pipeline
    Approve,
    /// Show the state of the latest run
    Status,
    /// List all runs in the database
    Runs,
}

fn init_tracing(verbose: bool) -> WorkerGuard {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let (writer, guard) = tracing_appender::non_blocking(std::io::stderr());
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_target(false)
        .init();
    guard
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let _guard = init_tracing(cli.verbose);

    let port = match &cli.command {
        Commands::Serve { port } => *port,
        _ => None,
    };
    let config = Config::from_env().with_overrides(port, cli.db.clone());

    match &cli.command {
        Commands::Serve { .. } => cmd::cmd_serve(config).await?,
        Commands::Init { manifest } => cmd::cmd_init(&config, manifest).await?,
        Commands::Run => cmd::cmd_run(&config).await?,
        Commands::Phase { name, params } => {
            cmd::cmd_phase(&config, name, params.clone()).await?
        }
        Commands::Approve => cmd::cmd_approve(&config).await?,
        Commands::Status => cmd::cmd_status(&config).await?,
        Commands::Runs => cmd::cmd_runs(&config).await?,
    }

    Ok(())
}
