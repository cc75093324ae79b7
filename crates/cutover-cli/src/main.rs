use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod commands;

use commands::deploy::DeployArgs;
use commands::GlobalOpts;

#[derive(Parser)]
#[command(
    name = "cutover",
    about = "cutover — blue-green, rolling, and canary rollouts with automatic rollback",
    version,
    propagate_version = true,
)]
struct Cli {
    /// Path to cutover.toml (default: $CUTOVER_CONFIG, then ./cutover.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// State directory (default: $CUTOVER_STATE_DIR, then [state].dir, then .cutover)
    #[arg(long, global = true)]
    state_dir: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Roll out a new version of a service.
    ///
    /// Exit status: 0 succeeded, 2 rolled back, 3 rollback failed,
    /// 4 invalid plan, 5 rollout already in progress, 1 anything else.
    Deploy(DeployArgs),
    /// Show the active rollout, or the stable environment when idle.
    Status {
        service: String,
        /// Output format: text or json
        #[arg(short, long, default_value = "text")]
        format: String,
    },
    /// List finished rollouts, newest first.
    History {
        service: String,
        #[arg(short, long, default_value = "10")]
        limit: usize,
        /// Output format: text or json
        #[arg(short, long, default_value = "text")]
        format: String,
    },
    /// Roll back a rollout left unfinished by a crashed process.
    Recover {
        service: String,
        /// Output format: text or json
        #[arg(short, long, default_value = "text")]
        format: String,
    },
    /// Validate a plan and print the steps it resolves to.
    Plan {
        /// blue-green, rolling, or canary
        strategy: String,
        /// Traffic percentages (default: from cutover.toml)
        percents: Vec<u32>,
        /// Pause between steps, e.g. 30s
        #[arg(long)]
        pause: Option<String>,
        /// Replica count used to show per-step scaling
        #[arg(long)]
        replicas: Option<u32>,
        /// Output format: text or json
        #[arg(short, long, default_value = "text")]
        format: String,
    },
    /// Serve the read-only status API.
    Serve {
        #[arg(long, default_value = "8480")]
        port: u16,
    },
    /// Write a cutover.toml scaffold.
    Init {
        #[arg(short, long, default_value = ".")]
        path: String,
        /// Service name to put in [service]
        #[arg(long)]
        service: String,
        /// Overwrite an existing cutover.toml
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("cutover=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match run(cli).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::from(commands::error_code(&e))
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<u8> {
    let globals = GlobalOpts {
        config: cli.config,
        state_dir: cli.state_dir,
    };

    match cli.command {
        Commands::Deploy(args) => commands::deploy::deploy(&globals, args).await,
        Commands::Status { service, format } => {
            commands::status::status(&globals, &service, &format).map(|()| 0)
        }
        Commands::History {
            service,
            limit,
            format,
        } => commands::status::history(&globals, &service, limit, &format).map(|()| 0),
        Commands::Recover { service, format } => {
            commands::recover::recover(&globals, &service, &format).await
        }
        Commands::Plan {
            strategy,
            percents,
            pause,
            replicas,
            format,
        } => commands::plan::plan(
            &globals,
            &strategy,
            &percents,
            pause.as_deref(),
            replicas,
            &format,
        )
        .map(|()| 0),
        Commands::Serve { port } => commands::serve::serve(&globals, port).await.map(|()| 0),
        Commands::Init {
            path,
            service,
            force,
        } => commands::init::init(&path, &service, force).map(|()| 0),
    }
}
