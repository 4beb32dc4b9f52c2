use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::core::bluetooth::constants::{
    COMMAND_TIMEOUT_MS, CONNECT_RETRY_DELAY_MS, MAX_CONNECT_RETRIES,
};
use crate::utils::ensure_directory_exists;

pub const CONFIG_FILE_NAME: &str = "link_config.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// How long a command waits for its response before failing, in milliseconds.
    pub command_timeout_ms: u64,

    /// Connection attempts made by `connect_with_reconnect` and by each
    /// automatic reconnect before giving up.
    pub max_connect_retries: u32,

    /// Pause between connection attempts, in milliseconds. Zero retries immediately.
    pub connect_retry_delay_ms: u64,

    /// Advertisements weaker than this are ignored while scanning.
    pub min_rssi: Option<i16>,
}

impl Default for LinkConfig {
    fn default() -> Self {
        LinkConfig {
            command_timeout_ms: COMMAND_TIMEOUT_MS,
            max_connect_retries: MAX_CONNECT_RETRIES,
            connect_retry_delay_ms: CONNECT_RETRY_DELAY_MS,
            min_rssi: None,
        }
    }
}

impl LinkConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn connect_retry_delay(&self) -> Duration {
        Duration::from_millis(self.connect_retry_delay_ms)
    }

    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn with_connect_retries(mut self, max_retries: u32, delay: Duration) -> Self {
        self.max_connect_retries = max_retries;
        self.connect_retry_delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Loads the config from a JSON file, falling back to defaults when it is missing.
    pub async fn load_config(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            warn!("Config file not found at {:?}, using default.", path);
            return Ok(Self::default());
        }

        let config_json = fs::read_to_string(path).await?;
        let config: Self = serde_json::from_str(&config_json)?;

        info!("Config loaded from {:?}", path);
        Ok(config)
    }

    /// Saves the config as pretty JSON, creating the parent directory if needed.
    pub async fn save_config(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(dir) = path.parent() {
            ensure_directory_exists(dir).await?;
        }

        let config_json = match serde_json::to_string_pretty(self) {
            Ok(json) => json,
            Err(e) => {
                error!("Failed to serialize link config to JSON: {}", e);
                return Err(e.into());
            }
        };

        fs::write(path, config_json).await?;

        info!("Link config saved to {:?}.", path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_dir(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("pixels-dice-{}-{}", name, std::process::id()))
    }

    #[test]
    fn test_defaults() {
        let config = LinkConfig::default();
        assert_eq!(config.command_timeout(), Duration::from_secs(10));
        assert_eq!(config.max_connect_retries, 5);
        assert_eq!(config.connect_retry_delay(), Duration::ZERO);
        assert_eq!(config.min_rssi, None);
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let config: LinkConfig =
            serde_json::from_str(r#"{ "command_timeout_ms": 250, "min_rssi": -80 }"#).unwrap();
        assert_eq!(config.command_timeout(), Duration::from_millis(250));
        assert_eq!(config.min_rssi, Some(-80));
        assert_eq!(config.max_connect_retries, MAX_CONNECT_RETRIES);
    }

    #[tokio::test]
    async fn test_save_then_load() {
        let dir = scratch_dir("save");
        let path = dir.join("nested").join(CONFIG_FILE_NAME);
        let config = LinkConfig::default()
            .with_command_timeout(Duration::from_millis(1500))
            .with_connect_retries(2, Duration::from_millis(100));

        config.save_config(&path).await.unwrap();
        let loaded = LinkConfig::load_config(&path).await.unwrap();

        assert_eq!(loaded, config);
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn test_missing_file_gives_default() {
        let path = scratch_dir("missing").join(CONFIG_FILE_NAME);
        let loaded = LinkConfig::load_config(&path).await.unwrap();
        assert_eq!(loaded, LinkConfig::default());
    }
}
