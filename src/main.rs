use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};

mod cmd;

#[derive(Parser)]
#[command(name = "quadro")]
#[command(version, about = "Kanban boards, tickets and per-project field schemas over HTTP")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to quadro.toml (defaults to .quadro/quadro.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the HTTP and WebSocket server
    Serve {
        /// Port to serve on
        #[arg(short, long)]
        port: Option<u16>,

        /// Address to bind
        #[arg(long)]
        host: Option<String>,

        /// SQLite database path
        #[arg(long)]
        db_path: Option<PathBuf>,

        /// Enable permissive CORS for a locally served front-end
        #[arg(long)]
        dev: bool,
    },
    /// Create the database and a default config file
    Init {
        /// SQLite database path
        #[arg(long)]
        db_path: Option<PathBuf>,
    },
    /// Validate the configuration and print warnings
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env file is fine.
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| quadro::config::default_config_path(Path::new(".")));

    match cli.command {
        Commands::Serve {
            port,
            host,
            db_path,
            dev,
        } => {
            let mut config = cmd::load_config(&config_path)?;
            quadro::logging::init(&config.logging, cli.verbose)?;
            if let Some(port) = port {
                config.server.port = port;
            }
            if let Some(host) = host {
                config.server.host = host;
            }
            if let Some(db_path) = db_path {
                config.storage.db_path = db_path;
            }
            if dev {
                config.server.dev_mode = true;
            }
            cmd::cmd_serve(config).await?;
        }
        Commands::Init { db_path } => cmd::cmd_init(&config_path, db_path)?,
        Commands::CheckConfig => cmd::cmd_check_config(&config_path)?,
    }

    Ok(())
}
