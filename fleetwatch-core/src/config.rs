//! Configuration system for fleetwatch.
//!
//! Uses `figment` for layered configuration: defaults -> config file -> environment -> CLI args.
//! Configuration is loaded from `~/.config/fleetwatch/config.toml` and/or
//! `.fleetwatch/config.toml` in the workspace directory.

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;

/// Top-level configuration for a fleetwatch instance.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetConfig {
    pub summary: SummaryConfig,
    pub store: StoreConfig,
    pub gateway: GatewayConfig,
}

impl FleetConfig {
    /// Reject configurations the engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.summary.validate()
    }
}

/// Configuration for the summary cache-and-refresh engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SummaryConfig {
    /// Administrative switch; when false every read fails with `ServiceDisabled`.
    pub enabled: bool,
    /// Model identifier passed to the model command.
    pub model: String,
    /// Executable used for the isolated model call.
    pub model_command: String,
    /// How long a cached summary is served as fresh.
    pub cache_ttl_secs: u64,
    /// Period of the background sweep.
    pub refresh_interval_secs: u64,
    /// Agents active within this window are refreshed by the sweep.
    pub active_window_secs: u64,
    /// Maximum transcript lines forwarded to the model.
    pub max_transcript_lines: usize,
    /// Ceiling on concurrent model calls across all agents.
    pub max_concurrent: usize,
    /// Cache size past which the oldest idle entry is evicted.
    pub max_cache_entries: usize,
    /// Hard timeout for a single model call.
    pub call_timeout_secs: u64,
    /// Base directory holding one transcript directory per project.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transcript_base_path: Option<PathBuf>,
}

impl Default for SummaryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            model: "haiku".to_string(),
            model_command: "claude".to_string(),
            cache_ttl_secs: 30,
            refresh_interval_secs: 45,
            active_window_secs: 30 * 60,
            max_transcript_lines: 200,
            max_concurrent: 3,
            max_cache_entries: 100,
            call_timeout_secs: 30,
            transcript_base_path: None,
        }
    }
}

impl SummaryConfig {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }

    pub fn active_window(&self) -> Duration {
        Duration::from_secs(self.active_window_secs)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    /// Resolve the transcript base directory, falling back to `~/.claude/projects`.
    pub fn resolved_transcript_base(&self) -> PathBuf {
        if let Some(ref path) = self.transcript_base_path {
            return path.clone();
        }
        directories::BaseDirs::new()
            .map(|dirs| dirs.home_dir().join(".claude").join("projects"))
            .unwrap_or_else(|| PathBuf::from(".claude").join("projects"))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let checks: [(bool, &str); 7] = [
            (self.cache_ttl_secs == 0, "summary.cache_ttl_secs must be > 0"),
            (
                self.refresh_interval_secs == 0,
                "summary.refresh_interval_secs must be > 0",
            ),
            (
                self.max_transcript_lines == 0,
                "summary.max_transcript_lines must be > 0",
            ),
            (self.max_concurrent == 0, "summary.max_concurrent must be > 0"),
            (
                self.max_cache_entries == 0,
                "summary.max_cache_entries must be > 0",
            ),
            (
                self.call_timeout_secs == 0,
                "summary.call_timeout_secs must be > 0",
            ),
            (self.model.trim().is_empty(), "summary.model must not be empty"),
        ];
        match checks.iter().find(|(failed, _)| *failed) {
            Some((_, message)) => Err(ConfigError::Invalid {
                message: (*message).to_string(),
            }),
            None => Ok(()),
        }
    }
}

/// Configuration for the persistent summary/agent store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// SQLite database file. Defaults to the project data directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_path: Option<PathBuf>,
}

impl StoreConfig {
    pub fn resolved_database_path(&self) -> PathBuf {
        if let Some(ref path) = self.database_path {
            return path.clone();
        }
        project_dirs()
            .map(|d| d.data_dir().join("fleetwatch.db"))
            .unwrap_or_else(|| PathBuf::from("fleetwatch.db"))
    }
}

/// Configuration for the HTTP gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 18800,
        }
    }
}

impl GatewayConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Platform project directories for fleetwatch (config, data, logs).
pub fn project_dirs() -> Option<directories::ProjectDirs> {
    directories::ProjectDirs::from("dev", "fleetwatch", "fleetwatch")
}

/// Load configuration from layered sources.
///
/// Priority (highest to lowest):
/// 1. Explicit overrides (passed as argument)
/// 2. Environment variables (prefixed with `FLEETWATCH_`)
/// 3. An explicit config file, or the workspace-local `.fleetwatch/config.toml`
/// 4. User config (`~/.config/fleetwatch/config.toml`)
/// 5. Built-in defaults
pub fn load_config(
    workspace: Option<&Path>,
    config_file: Option<&Path>,
    overrides: Option<&FleetConfig>,
) -> Result<FleetConfig, Box<figment::Error>> {
    let mut figment = Figment::from(Serialized::defaults(FleetConfig::default()));

    if let Some(dirs) = project_dirs() {
        let user_config = dirs.config_dir().join("config.toml");
        if user_config.exists() {
            figment = figment.merge(Toml::file(&user_config));
        }
    }

    if let Some(ws) = workspace {
        let ws_config = ws.join(".fleetwatch").join("config.toml");
        if ws_config.exists() {
            figment = figment.merge(Toml::file(&ws_config));
        }
    }

    if let Some(file) = config_file {
        figment = figment.merge(Toml::file(file));
    }

    // FLEETWATCH_SUMMARY__CACHE_TTL_SECS, FLEETWATCH_GATEWAY__PORT, ...
    figment = figment.merge(Env::prefixed("FLEETWATCH_").split("__"));

    if let Some(overrides) = overrides {
        figment = figment.merge(Serialized::defaults(overrides));
    }

    figment.extract().map_err(Box::new)
}

/// [`load_config`] followed by [`FleetConfig::validate`], with both failure
/// kinds reported as [`FleetError::Config`](crate::FleetError::Config).
pub fn load_validated_config(
    workspace: Option<&Path>,
    config_file: Option<&Path>,
) -> crate::Result<FleetConfig> {
    let config = load_config(workspace, config_file, None).map_err(|e| ConfigError::ParseError {
        message: e.to_string(),
    })?;
    config.validate()?;
    Ok(config)
}
