//! Editing server commands: `stepwright serve` and `stepwright init-db`.

use anyhow::Result;
use std::path::{Path, PathBuf};

use stepwright::config::StepwrightConfig;
use stepwright::editing::db::EditingDb;
use stepwright::editing::server::{ServerConfig, start_server};

use super::resolve_path;

/// Command-line values that win over the config file.
pub struct ServeOverrides {
    pub port: Option<u16>,
    pub host: Option<String>,
    pub db_path: Option<PathBuf>,
    pub engine_url: Option<String>,
    pub dev: bool,
}

pub async fn cmd_serve(
    project_dir: &Path,
    config: StepwrightConfig,
    overrides: ServeOverrides,
) -> Result<()> {
    for warning in config.validate() {
        tracing::warn!("{}", warning);
    }

    let mut server = ServerConfig::from(&config);
    if let Some(port) = overrides.port {
        server.port = port;
    }
    if let Some(host) = overrides.host {
        server.host = host;
    }
    if let Some(url) = overrides.engine_url {
        server.engine_url = url;
    }
    if overrides.dev {
        server.dev_mode = true;
    }
    let db_path = overrides.db_path.unwrap_or(server.db_path);
    server.db_path = resolve_path(project_dir, &db_path);

    println!(
        "{} on http://{}:{} (engine: {})",
        console::style("Stepwright editing server").bold().cyan(),
        server.host,
        server.port,
        server.engine_url
    );
    start_server(server).await
}

pub fn cmd_init_db(project_dir: &Path, config: &StepwrightConfig, db_path: Option<&Path>) -> Result<()> {
    let db_path = resolve_path(project_dir, db_path.unwrap_or(&config.server.db_path));
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    EditingDb::new(&db_path)?;
    println!("Editing database initialized at {}", db_path.display());
    Ok(())
}
