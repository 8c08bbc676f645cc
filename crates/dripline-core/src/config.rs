//! Dripline configuration system.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{DriplineError, Result};

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DriplineConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub driver: DriverConfig,
    #[serde(default)]
    pub migration: MigrationConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
}

impl DriplineConfig {
    /// Load config from the default path (~/.dripline/config.toml).
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default().with_env_overrides())
        }
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| DriplineError::Config(format!("Failed to read config: {e}")))?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| DriplineError::Config(format!("Failed to parse config: {e}")))?;
        Ok(config.with_env_overrides())
    }

    /// Save config to the default path.
    pub fn save(&self) -> Result<()> {
        let path = Self::default_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| DriplineError::Config(format!("Failed to serialize config: {e}")))?;
        std::fs::write(&path, content)?;
        Ok(())
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Get the Dripline home directory.
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".dripline")
    }

    fn with_env_overrides(mut self) -> Self {
        if let Ok(url) = std::env::var("DRIPLINE_WEBHOOK_URL") {
            if !url.is_empty() {
                self.dispatch.webhook_url = Some(url);
            }
        }
        self
    }
}

/// Expand `~` in a configured path.
pub fn expand_path(p: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(p).to_string())
}

/// SQLite store location.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

fn default_db_path() -> String { "~/.dripline/dripline.db".into() }

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self { path: default_db_path() }
    }
}

/// Due-instance driver tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverConfig {
    /// Seconds between ticks in `run` mode.
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    /// Max instances pulled per tick.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Max instances processed concurrently.
    #[serde(default = "default_lead_concurrency")]
    pub lead_concurrency: usize,
    /// Wall-clock budget per tick.
    #[serde(default = "default_driver_budget_secs")]
    pub budget_secs: u64,
    /// A task left in `sending` longer than this goes back to the outbox.
    #[serde(default = "default_sending_timeout_secs")]
    pub sending_timeout_secs: i64,
}

fn default_interval_secs() -> u64 { 300 }
fn default_batch_size() -> usize { 200 }
fn default_lead_concurrency() -> usize { 8 }
fn default_driver_budget_secs() -> u64 { 240 }
fn default_sending_timeout_secs() -> i64 { 900 }

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            batch_size: default_batch_size(),
            lead_concurrency: default_lead_concurrency(),
            budget_secs: default_driver_budget_secs(),
            sending_timeout_secs: default_sending_timeout_secs(),
        }
    }
}

/// Migration / renumbering batch tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationConfig {
    /// Workspaces migrated in parallel. Kept below `lead_concurrency`.
    #[serde(default = "default_workspace_concurrency")]
    pub workspace_concurrency: usize,
    #[serde(default = "default_lead_concurrency")]
    pub lead_concurrency: usize,
    /// Floor applied to recomputed due-dates that land in the past.
    #[serde(default = "default_due_buffer_secs")]
    pub due_buffer_secs: i64,
    #[serde(default = "default_artifact_dir")]
    pub artifact_dir: String,
    #[serde(default = "default_migration_budget_secs")]
    pub budget_secs: u64,
}

fn default_workspace_concurrency() -> usize { 2 }
fn default_due_buffer_secs() -> i64 { 300 }
fn default_artifact_dir() -> String { "~/.dripline/rollbacks".into() }
fn default_migration_budget_secs() -> u64 { 600 }

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            workspace_concurrency: default_workspace_concurrency(),
            lead_concurrency: default_lead_concurrency(),
            due_buffer_secs: default_due_buffer_secs(),
            artifact_dir: default_artifact_dir(),
            budget_secs: default_migration_budget_secs(),
        }
    }
}

/// Outbound delivery. With no webhook the dispatcher only logs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    #[serde(default)]
    pub webhook_url: Option<String>,
    #[serde(default = "default_dispatch_timeout")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub headers: Vec<(String, String)>,
}

fn default_dispatch_timeout() -> u64 { 10 }

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            webhook_url: None,
            timeout_secs: default_dispatch_timeout(),
            headers: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_toml() {
        let config: DriplineConfig = toml::from_str("").unwrap();
        assert_eq!(config.driver.interval_secs, 300);
        assert_eq!(config.driver.sending_timeout_secs, 900);
        assert_eq!(config.migration.workspace_concurrency, 2);
        assert!(config.migration.workspace_concurrency < config.migration.lead_concurrency);
        assert!(config.dispatch.webhook_url.is_none());
    }

    #[test]
    fn test_partial_section_override() {
        let config: DriplineConfig = toml::from_str(
            r#"
            [driver]
            batch_size = 50

            [migration]
            due_buffer_secs = 60
            "#,
        )
        .unwrap();
        assert_eq!(config.driver.batch_size, 50);
        assert_eq!(config.driver.lead_concurrency, 8);
        assert_eq!(config.migration.due_buffer_secs, 60);
        assert_eq!(config.migration.artifact_dir, "~/.dripline/rollbacks");
    }

    #[test]
    fn test_load_from_file() {
        let dir = std::env::temp_dir().join("dripline-config-test");
        std::fs::create_dir_all(&dir).ok();
        let path = dir.join("config.toml");
        std::fs::write(&path, "[database]\npath = \"/tmp/drip.db\"\n").unwrap();
        let config = DriplineConfig::load_from(&path).unwrap();
        assert_eq!(config.database.path, "/tmp/drip.db");
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_bad_toml_is_config_error() {
        let dir = std::env::temp_dir().join("dripline-config-bad");
        std::fs::create_dir_all(&dir).ok();
        let path = dir.join("config.toml");
        std::fs::write(&path, "[driver\n").unwrap();
        let err = DriplineConfig::load_from(&path).unwrap_err();
        assert!(matches!(err, DriplineError::Config(_)));
        std::fs::remove_dir_all(&dir).ok();
    }
}
