use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON5 parse error: {0}")]
    Json5(#[from] json5::Error),
    #[error("Config directory not found")]
    NoDirFound,
}

/// Heartbeat configuration: the synthetic half-hourly check-in schedule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Whether the heartbeat fires at all.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Destination chat for heartbeat triggers. 0 disables the heartbeat.
    #[serde(default)]
    pub chat_id: i64,
    /// Prompt delivered on each heartbeat run.
    #[serde(default = "default_heartbeat_prompt")]
    pub prompt: String,
}

fn default_true() -> bool {
    true
}

fn default_heartbeat_prompt() -> String {
    "Heartbeat check-in: look over recent conversations, open reminders, and \
     the local time. Reach out only if there is a concrete, useful reason to \
     message the user right now; otherwise stay silent."
        .to_string()
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            chat_id: 0,
            prompt: default_heartbeat_prompt(),
        }
    }
}

/// Top-level minder configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MinderConfig {
    /// Base directory for all persisted state (jobs, heartbeat, logs).
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Default IANA timezone applied to cron jobs without an explicit zone.
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
}

fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .map(|h| h.join(".minder"))
        .unwrap_or_else(|| PathBuf::from(".minder"))
}

fn default_timezone() -> String {
    "UTC".to_string()
}

impl Default for MinderConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            timezone: default_timezone(),
            heartbeat: HeartbeatConfig::default(),
        }
    }
}

impl MinderConfig {
    /// Path of the job store file.
    pub fn jobs_path(&self) -> PathBuf {
        self.data_dir.join("scheduler").join("jobs.json")
    }

    /// Path of the heartbeat state file.
    pub fn heartbeat_path(&self) -> PathBuf {
        self.data_dir.join("scheduler").join("heartbeat.json")
    }

    /// Directory for the append-only event log.
    pub fn logs_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }
}

/// Resolve the minder config directory (~/.minder/).
pub fn config_dir() -> Result<PathBuf, ConfigError> {
    dirs::home_dir()
        .map(|h| h.join(".minder"))
        .ok_or(ConfigError::NoDirFound)
}

/// Resolve the config file path (~/.minder/config.json5).
pub fn config_file_path() -> Result<PathBuf, ConfigError> {
    Ok(config_dir()?.join("config.json5"))
}

/// Load configuration from the default path, falling back to defaults.
pub fn load_config() -> Result<MinderConfig, ConfigError> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    let path = config_file_path()?;
    load_config_from(&path)
}

/// Load configuration from a specific path, falling back to defaults if not found.
pub fn load_config_from(path: &Path) -> Result<MinderConfig, ConfigError> {
    if !path.exists() {
        tracing::debug!("Config file not found at {}, using defaults", path.display());
        return Ok(MinderConfig::default());
    }

    let content = std::fs::read_to_string(path)?;
    let config: MinderConfig = json5::from_str(&content)?;
    Ok(config)
}

/// Ensure the config directory exists.
pub fn ensure_config_dir() -> Result<PathBuf, ConfigError> {
    let dir = config_dir()?;
    if !dir.exists() {
        std::fs::create_dir_all(&dir)?;
    }
    Ok(dir)
}

/// Save configuration to the default path.
pub fn save_config(config: &MinderConfig) -> Result<(), ConfigError> {
    let dir = ensure_config_dir()?;
    let path = dir.join("config.json5");
    let content = serde_json::to_string_pretty(config)
        .map_err(|e| ConfigError::Io(std::io::Error::other(e)))?;
    std::fs::write(path, content)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_when_file_missing() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config_from(&dir.path().join("nope.json5")).unwrap();
        assert_eq!(config.timezone, "UTC");
        assert!(config.heartbeat.enabled);
        assert_eq!(config.heartbeat.chat_id, 0);
        assert!(!config.heartbeat.prompt.is_empty());
    }

    #[test]
    fn test_load_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json5");
        std::fs::write(
            &path,
            r#"{
                // comments are allowed in json5
                data_dir: "/tmp/minder-test",
                timezone: "Europe/Vienna",
                heartbeat: { enabled: false, chat_id: 77 },
            }"#,
        )
        .unwrap();
        let config = load_config_from(&path).unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/tmp/minder-test"));
        assert_eq!(config.timezone, "Europe/Vienna");
        assert!(!config.heartbeat.enabled);
        assert_eq!(config.heartbeat.chat_id, 77);
        // Unset fields keep their defaults.
        assert!(!config.heartbeat.prompt.is_empty());
    }

    #[test]
    fn test_derived_paths() {
        let config = MinderConfig {
            data_dir: PathBuf::from("/data/minder"),
            ..Default::default()
        };
        assert_eq!(
            config.jobs_path(),
            PathBuf::from("/data/minder/scheduler/jobs.json")
        );
        assert_eq!(
            config.heartbeat_path(),
            PathBuf::from("/data/minder/scheduler/heartbeat.json")
        );
        assert_eq!(config.logs_dir(), PathBuf::from("/data/minder/logs"));
    }
}
