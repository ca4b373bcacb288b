use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use dockhand::config::DockhandConfig;
use dockhand::updater::PruneMode;

mod cmd;

#[derive(Parser)]
#[command(name = "dockhand")]
#[command(version, about = "Control plane for a fleet of Docker host agents")]
pub struct Cli {
    /// Path to dockhand.toml (defaults to ./dockhand.toml when present)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Database path. Overrides config and DOCKHAND_DB_PATH.
    #[arg(long, global = true)]
    pub db_path: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the HTTP control plane
    Serve {
        /// Port to serve on
        #[arg(short, long)]
        port: Option<u16>,

        /// Initialize database only (don't start server)
        #[arg(long)]
        init: bool,

        /// Enable dev mode (permissive CORS, bind 0.0.0.0)
        #[arg(long)]
        dev: bool,
    },
    /// List registered agents with their effective status
    Agents,
    /// Show or change auto-update settings
    Settings {
        #[arg(long)]
        auto_update: Option<bool>,

        /// Minutes between update runs
        #[arg(long)]
        interval: Option<i64>,

        /// none, dangling or all
        #[arg(long)]
        prune_mode: Option<PruneMode>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let mut config = DockhandConfig::load_or_default(cli.config.as_deref())?;
    config.apply_env()?;
    if let Some(db_path) = &cli.db_path {
        config.server.db_path = db_path.clone();
    }

    let _log_guard = dockhand::logging::init(&config.log)?;

    match cli.command {
        Commands::Serve { port, init, dev } => {
            if let Some(port) = port {
                config.server.port = port;
            }
            if dev {
                config.server.dev_mode = true;
                config.server.host = "0.0.0.0".to_string();
            }
            cmd::cmd_serve(config, init).await?;
        }
        Commands::Agents => cmd::cmd_agents(&config.server.db_path).await?,
        Commands::Settings {
            auto_update,
            interval,
            prune_mode,
        } => {
            let patch = dockhand::updater::SettingsPatch {
                auto_update,
                auto_update_interval: interval,
                prune_mode,
            };
            cmd::cmd_settings(&config.server.db_path, patch).await?;
        }
    }

    Ok(())
}
