//! cutoverd: the Cutover daemon.
//!
//! Single binary that assembles the deployment controller:
//! - Deployment store (redb)
//! - Task set manager over the in-process platform
//! - Traffic router
//! - Health prober
//! - Controller + reconcile sweeper
//! - REST API
//!
//! # Usage
//!
//! ```text
//! cutoverd serve --config /etc/cutover/cutover.toml --listen 0.0.0.0:8480
//! cutoverd config --config /etc/cutover/cutover.toml
//! ```

mod standalone;

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use cutover_core::CutoverConfig;

const DEFAULT_FILTER: &str = "info,cutoverd=debug,cutover=debug";

#[derive(Parser)]
#[command(name = "cutoverd", about = "Cutover blue/green deployment controller")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the controller and its API.
    Serve {
        /// Path to cutover.toml. Defaults apply when omitted.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Address for the API server (overrides `server.listen`).
        #[arg(long)]
        listen: Option<SocketAddr>,

        /// Directory for the deployment store (overrides `store.data_dir`).
        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// Emit logs as JSON lines.
        #[arg(long)]
        log_json: bool,
    },

    /// Print the effective configuration and exit.
    Config {
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Serve {
            config,
            listen,
            data_dir,
            log_json,
        } => {
            init_tracing(log_json);
            let mut config = load_config(config.as_deref())?;
            if let Some(listen) = listen {
                config.server.listen = listen;
            }
            if let Some(data_dir) = data_dir {
                config.store.data_dir = data_dir;
            }
            standalone::run(config).await
        }
        Command::Config { config } => {
            let config = load_config(config.as_deref())?;
            print!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

fn init_tracing(json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<CutoverConfig> {
    let config = match path {
        Some(path) => CutoverConfig::from_file(path)?,
        None => CutoverConfig::default(),
    };
    Ok(config)
}
