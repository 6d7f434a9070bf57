mod client;
mod cmd;
mod output;

use clap::{Parser, Subcommand};
use cmd::{config::ConfigSubcommand, workflow::WorkflowSubcommand};
use idp_core::config::EngineMode;
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "idp",
    about = "Track and drive cluster and namespace provisioning workflows",
    version,
    propagate_version = true
)]
struct Cli {
    /// Config file (default: ./idp.yaml if present)
    #[arg(long, global = true, env = "IDP_CONFIG")]
    config: Option<PathBuf>,

    /// Base URL of a running `idp serve`
    #[arg(long, global = true, env = "IDP_URL", default_value = "http://localhost:8080")]
    url: String,

    /// Output as JSON
    #[arg(long, global = true, short = 'j')]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the API server and the remote workflow mirror
    Serve {
        /// Port to listen on
        #[arg(long, env = "IDP_PORT", default_value = "8080")]
        port: u16,

        /// Execution engine, overriding engine.mode in the config
        #[arg(long, env = "IDP_ENGINE")]
        engine: Option<EngineMode>,
    },

    /// Create, inspect, abort and retry workflows
    Workflow {
        #[command(subcommand)]
        subcommand: WorkflowSubcommand,
    },

    /// Show the node-pool table
    NodePools,

    /// Inspect and validate configuration
    Config {
        #[command(subcommand)]
        subcommand: ConfigSubcommand,
    },
}

fn main() {
    let cli = Cli::parse();

    let default_level = match &cli.command {
        Commands::Serve { .. } => tracing::Level::INFO,
        _ => tracing::Level::WARN,
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(default_level.into()),
        )
        .with_target(false)
        .init();

    let config = cli.config.as_deref();
    let result = match cli.command {
        Commands::Serve { port, engine } => cmd::serve::run(config, port, engine),
        Commands::Workflow { subcommand } => cmd::workflow::run(&cli.url, subcommand, cli.json),
        Commands::NodePools => cmd::node_pools::run(config, cli.json),
        Commands::Config { subcommand } => cmd::config::run(config, subcommand, cli.json),
    };

    if let Err(e) = result {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}
