//! CLI command implementations.
//!
//! | Module     | Commands handled          |
//! |------------|---------------------------|
//! | `serve`    | `Serve`, `InitDb`         |
//! | `sweep`    | `Sweep`                   |
//! | `validate` | `Validate`                |
//! | `config`   | `Config`                  |

pub mod config;
pub mod serve;
pub mod sweep;
pub mod validate;

use anyhow::Result;
use std::path::{Path, PathBuf};
use stepwright::config::StepwrightConfig;

pub use config::cmd_config;
pub use serve::{ServeOverrides, cmd_init_db, cmd_serve};
pub use sweep::cmd_sweep;
pub use validate::cmd_validate;

/// Load the config file (explicit path or the project default), then apply
/// environment overrides.
pub fn load_config(project_dir: &Path, explicit: Option<&Path>) -> Result<StepwrightConfig> {
    let mut config = match explicit {
        Some(path) => StepwrightConfig::load(path)?,
        None => StepwrightConfig::load_or_default(project_dir)?,
    };
    config.apply_env_overrides();
    Ok(config)
}

/// Relative paths in config are relative to the project directory.
pub fn resolve_path(project_dir: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        project_dir.join(path)
    }
}
