use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

use autobuild::config::Settings;
use autobuild::server::start_server;

#[derive(Parser)]
#[command(name = "autobuild", version, about = "Autonomous feature-build orchestrator")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Start the orchestrator server
    Serve {
        /// Port to listen on (overrides config)
        #[arg(long)]
        port: Option<u16>,

        /// Directory containing autobuild.toml
        #[arg(long, default_value = ".")]
        config_dir: PathBuf,

        /// Bind on all interfaces and allow cross-origin requests
        #[arg(long)]
        dev: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Some(Command::Serve { port, config_dir, dev }) => {
            let mut settings = Settings::load(&config_dir)?;
            if let Some(port) = port {
                settings.port = port;
            }
            start_server(settings, dev).await
        }
        None => {
            let settings = Settings::load(&PathBuf::from("."))?;
            start_server(settings, false).await
        }
    }
}
