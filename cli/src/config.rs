// Configuration management for the BLECTF CLI
//
// Cross-platform config stored in:
// - macOS: ~/.config/blectf/config.json
// - Linux: ~/.config/blectf/config.json
// - Windows: %APPDATA%\blectf\config.json

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Name the peripheral advertises under
    pub device_name: String,

    /// Payload served by password characteristic reads
    pub password: String,

    /// Seconds between flag fragment notifications
    pub notify_interval_secs: u64,

    /// Rotating flag messages; empty disables rotation
    pub flag_messages: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            device_name: blectf_core::DEFAULT_DEVICE_NAME.to_string(),
            password: blectf_core::DEFAULT_PASSWORD.to_string(),
            notify_interval_secs: blectf_core::DEFAULT_NOTIFY_INTERVAL.as_secs(),
            flag_messages: blectf_core::default_flag_messages(),
        }
    }
}

impl Config {
    /// Get the config directory path (cross-platform)
    pub fn config_dir() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to determine config directory")?
            .join("blectf");

        // Create directory if it doesn't exist
        std::fs::create_dir_all(&config_dir).context("Failed to create config directory")?;

        Ok(config_dir)
    }

    /// Get the config file path
    pub fn config_file() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.json"))
    }

    /// Load config from file, or create default if not exists
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_file()?)
    }

    fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path).context("Failed to read config file")?;
            let config: Config =
                serde_json::from_str(&contents).context("Failed to parse config file")?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save_to(path)?;
            Ok(config)
        }
    }

    /// Save config to file
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_file()?)
    }

    fn save_to(&self, path: &Path) -> Result<()> {
        let contents =
            serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, contents).context("Failed to write config file")?;
        Ok(())
    }

    /// Add a rotating flag message
    pub fn add_flag_message(&mut self, message: String) -> Result<()> {
        self.flag_messages.push(message);
        self.save()
    }

    /// Remove a flag message by 1-based position
    pub fn remove_flag_message(&mut self, index: usize) -> Result<String> {
        if index == 0 || index > self.flag_messages.len() {
            anyhow::bail!("No flag message at position {}", index);
        }
        let removed = self.flag_messages.remove(index - 1);
        self.save()?;
        Ok(removed)
    }

    /// Set a config value
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "device_name" => {
                if value.is_empty() {
                    anyhow::bail!("Device name must not be empty");
                }
                self.device_name = value.to_string();
            }
            "password" => {
                if value.is_empty() {
                    anyhow::bail!("Password must not be empty");
                }
                self.password = value.to_string();
            }
            "notify_interval_secs" => {
                self.notify_interval_secs =
                    value.parse().context("Invalid number of seconds")?;
            }
            _ => anyhow::bail!("Unknown config key: {}", key),
        }
        self.save()?;
        Ok(())
    }

    /// Get a config value
    pub fn get(&self, key: &str) -> Option<String> {
        match key {
            "device_name" => Some(self.device_name.clone()),
            "password" => Some(self.password.clone()),
            "notify_interval_secs" => Some(self.notify_interval_secs.to_string()),
            _ => None,
        }
    }

    /// List all config values
    pub fn list(&self) -> Vec<(String, String)> {
        vec![
            ("device_name".to_string(), self.device_name.clone()),
            ("password".to_string(), self.password.clone()),
            (
                "notify_interval_secs".to_string(),
                format!("{}s", self.notify_interval_secs),
            ),
            (
                "flag_messages".to_string(),
                self.flag_messages.len().to_string(),
            ),
        ]
    }

    /// Build the server configuration this file describes
    pub fn to_server_config(&self) -> Result<blectf_core::ServerConfig> {
        let config = blectf_core::ServerConfig::default()
            .with_device_name(self.device_name.clone())
            .with_password(self.password.clone())
            .with_flag_messages(self.flag_messages.clone())
            .with_notify_interval(Duration::from_secs(self.notify_interval_secs));
        config
            .validate()
            .context("Invalid server configuration")?;
        Ok(config)
    }
}
