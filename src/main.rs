use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod cmd;

#[derive(Parser)]
#[command(name = "stepwright")]
#[command(version, about = "Live editing sessions for multi-step web form automation")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    /// Path to the config file. Defaults to .stepwright/stepwright.toml in the project dir.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the editing server and expiry sweeper
    Serve {
        /// Port to serve on (overrides config)
        #[arg(short, long)]
        port: Option<u16>,

        /// Address to bind (overrides config)
        #[arg(long)]
        host: Option<String>,

        /// Database path (overrides config)
        #[arg(long)]
        db_path: Option<PathBuf>,

        /// Automation engine base URL (overrides config)
        #[arg(long, env = "STEPWRIGHT_ENGINE_URL")]
        engine_url: Option<String>,

        /// Enable dev mode (CORS permissive for a local editor UI)
        #[arg(long)]
        dev: bool,
    },
    /// Create the database and apply migrations, then exit
    InitDb {
        /// Database path (overrides config)
        #[arg(long)]
        db_path: Option<PathBuf>,
    },
    /// Cancel expired editing sessions once, then exit
    Sweep,
    /// Check a correction set JSON file for dependency and field-order problems
    Validate {
        /// Path to the correction set
        file: PathBuf,
    },
    /// View, validate or create configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Initialize a default stepwright.toml file
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    // `config init` must work before any config file exists.
    if let Commands::Config { command } = &cli.command {
        return cmd::cmd_config(&project_dir, cli.config.as_deref(), command.clone());
    }

    let config = cmd::load_config(&project_dir, cli.config.as_deref())?;
    let level = if cli.verbose { "debug" } else { "info" };
    stepwright::telemetry::init_tracing(&config.logging, level)?;

    match &cli.command {
        Commands::Serve {
            port,
            host,
            db_path,
            engine_url,
            dev,
        } => {
            let overrides = cmd::ServeOverrides {
                port: *port,
                host: host.clone(),
                db_path: db_path.clone(),
                engine_url: engine_url.clone(),
                dev: *dev,
            };
            cmd::cmd_serve(&project_dir, config, overrides).await?;
        }
        Commands::InitDb { db_path } => {
            cmd::cmd_init_db(&project_dir, &config, db_path.as_deref())?;
        }
        Commands::Sweep => cmd::cmd_sweep(&project_dir, &config).await?,
        Commands::Validate { file } => cmd::cmd_validate(file)?,
        Commands::Config { .. } => {}
    }

    Ok(())
}
