//! One-shot expiry sweep: `stepwright sweep`.

use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;

use stepwright::config::StepwrightConfig;
use stepwright::editing::db::{DbHandle, EditingDb};
use stepwright::editing::lifecycle::SessionManager;
use stepwright::editing::remote::HttpAutomationEngine;
use stepwright::editing::sweeper::ExpirySweeper;

use super::resolve_path;

pub async fn cmd_sweep(project_dir: &Path, config: &StepwrightConfig) -> Result<()> {
    let db_path = resolve_path(project_dir, &config.server.db_path);
    if !db_path.exists() {
        anyhow::bail!(
            "No database at {}. Run 'stepwright init-db' or 'stepwright serve' first.",
            db_path.display()
        );
    }

    let settings = config.session_settings();
    let db = EditingDb::new(&db_path).context("Failed to open editing database")?;
    let engine = HttpAutomationEngine::new(&config.engine.base_url, settings.command_timeout)?;
    let (events, _) = tokio::sync::broadcast::channel(16);
    let sessions = SessionManager::new(DbHandle::new(db), Arc::new(engine), events, settings);

    let swept = ExpirySweeper::new(sessions)
        .sweep_once(chrono::Utc::now())
        .await?;
    if swept == 0 {
        println!("No expired editing sessions.");
    } else {
        println!(
            "{} {} expired editing session(s).",
            console::style("Cancelled").yellow(),
            swept
        );
    }
    Ok(())
}
