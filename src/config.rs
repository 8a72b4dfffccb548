//! Configuration for stepwright, read from `.stepwright/stepwright.toml`.
//!
//! Layered: file, then environment, then CLI flags. A missing file means
//! defaults.
//!
//! ```toml
//! [server]
//! host = "127.0.0.1"
//! port = 3141
//! db_path = ".stepwright/stepwright.db"
//! dev_mode = false
//!
//! [engine]
//! base_url = "http://127.0.0.1:8001"
//! open_timeout_secs = 60
//! command_timeout_secs = 30
//! login_timeout_secs = 3600
//! callback_key = "shared-secret"
//!
//! [session]
//! ttl_minutes = 30
//! sweep_interval_secs = 60
//!
//! [sealing]
//! key = "<base64 32-byte key>"
//!
//! [logging]
//! json = false
//! dir = ".stepwright/logs"
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::editing::lifecycle::SessionSettings;

pub const CONFIG_DIR: &str = ".stepwright";
pub const CONFIG_FILE: &str = "stepwright.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    /// Permissive CORS for a locally served editor UI.
    #[serde(default)]
    pub dev_mode: bool,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    3141
}

fn default_db_path() -> PathBuf {
    PathBuf::from(CONFIG_DIR).join("stepwright.db")
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            db_path: default_db_path(),
            dev_mode: false,
        }
    }
}

/// Remote automation engine connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSection {
    #[serde(default = "default_engine_url")]
    pub base_url: String,
    #[serde(default = "default_open_timeout")]
    pub open_timeout_secs: u64,
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,
    #[serde(default = "default_login_timeout")]
    pub login_timeout_secs: u64,
    /// Shared secret the engine presents when pushing field events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback_key: Option<String>,
}

fn default_engine_url() -> String {
    "http://127.0.0.1:8001".to_string()
}

fn default_open_timeout() -> u64 {
    60
}

fn default_command_timeout() -> u64 {
    30
}

fn default_login_timeout() -> u64 {
    3600
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            base_url: default_engine_url(),
            open_timeout_secs: default_open_timeout(),
            command_timeout_secs: default_command_timeout(),
            login_timeout_secs: default_login_timeout(),
            callback_key: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSection {
    #[serde(default = "default_ttl_minutes")]
    pub ttl_minutes: u32,
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

fn default_ttl_minutes() -> u32 {
    30
}

fn default_sweep_interval() -> u64 {
    60
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            ttl_minutes: default_ttl_minutes(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SealingSection {
    /// Base64-encoded 32-byte key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingSection {
    #[serde(default)]
    pub json: bool,
    /// Directory for daily-rolling log files. Console only when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dir: Option<PathBuf>,
}

/// Contents of `stepwright.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StepwrightConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub engine: EngineSection,
    #[serde(default)]
    pub session: SessionSection,
    #[serde(default)]
    pub sealing: SealingSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

impl StepwrightConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse stepwright.toml")
    }

    /// Load from `<project_dir>/.stepwright/stepwright.toml`, or defaults
    /// when the file does not exist.
    pub fn load_or_default(project_dir: &Path) -> Result<Self> {
        let path = Self::default_path(project_dir);
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn default_path(project_dir: &Path) -> PathBuf {
        project_dir.join(CONFIG_DIR).join(CONFIG_FILE)
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }
        let content =
            toml::to_string_pretty(self).context("Failed to serialize stepwright.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Apply `STEPWRIGHT_*` overrides from the process environment.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|name| std::env::var(name).ok());
    }

    /// Apply overrides from an arbitrary lookup. Empty values are ignored.
    pub fn apply_overrides_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        if let Some(url) = get("STEPWRIGHT_ENGINE_URL") {
            self.engine.base_url = url;
        }
        if let Some(key) = get("STEPWRIGHT_SEAL_KEY") {
            self.sealing.key = Some(key);
        }
        if let Some(key) = get("STEPWRIGHT_CALLBACK_KEY") {
            self.engine.callback_key = Some(key);
        }
        if let Some(port) = get("STEPWRIGHT_PORT") {
            match port.trim().parse() {
                Ok(p) => self.server.port = p,
                Err(_) => tracing::warn!(value = %port, "ignoring invalid STEPWRIGHT_PORT"),
            }
        }
    }

    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            ttl: chrono::Duration::minutes(i64::from(self.session.ttl_minutes)),
            open_timeout: Duration::from_secs(self.engine.open_timeout_secs),
            command_timeout: Duration::from_secs(self.engine.command_timeout_secs),
            login_timeout: Duration::from_secs(self.engine.login_timeout_secs),
        }
    }

    /// Human-readable warnings; an empty list means the config is usable.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.sealing.key.is_none() {
            warnings.push(
                "No sealing key configured: confirming drafts with sensitive values will fail"
                    .to_string(),
            );
        }
        if self.engine.callback_key.is_none() {
            warnings.push(
                "No engine callback_key configured: engine field events will be rejected"
                    .to_string(),
            );
        }
        if self.session.ttl_minutes == 0 {
            warnings.push("session.ttl_minutes is 0: sessions expire immediately".to_string());
        }
        if self.session.sweep_interval_secs == 0 {
            warnings.push("session.sweep_interval_secs must be greater than 0".to_string());
        }
        for (name, value) in [
            ("open_timeout_secs", self.engine.open_timeout_secs),
            ("command_timeout_secs", self.engine.command_timeout_secs),
            ("login_timeout_secs", self.engine.login_timeout_secs),
        ] {
            if value == 0 {
                warnings.push(format!("engine.{} is 0: every call will time out", name));
            }
        }
        if !self.engine.base_url.starts_with("http://") && !self.engine.base_url.starts_with("https://") {
            warnings.push(format!(
                "engine.base_url '{}' should start with http:// or https://",
                self.engine.base_url
            ));
        }

        warnings
    }
}
