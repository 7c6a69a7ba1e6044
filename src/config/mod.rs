//! Configuration module

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Listen address for the public endpoint
    pub listen: String,

    /// Listen port
    pub port: u16,

    /// Whether clients reach the router over HTTPS (changes scheme,
    /// default-port stripping and cookie Secure flag; TLS itself is
    /// terminated in front of the router)
    pub secure: bool,

    /// Host that serves the login form and issues session cookies
    #[serde(rename = "system-hostname")]
    pub system_hostname: String,

    /// Default landing host after login when no return URL is supplied.
    /// Falls back to the system hostname.
    #[serde(rename = "shell-hostname")]
    pub shell_hostname: Option<String>,

    /// Directory containing installed applications
    #[serde(rename = "apps-dir")]
    pub apps_dir: PathBuf,

    /// Runtime directory holding per-application socket directories
    #[serde(rename = "run-dir")]
    pub run_dir: PathBuf,

    /// SQLite database filename
    pub database: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            listen: "127.0.0.1".to_string(),
            port: 8080,
            secure: false,
            system_hostname: String::new(),
            shell_hostname: None,
            apps_dir: PathBuf::from("apps"),
            run_dir: PathBuf::from("run"),
            database: PathBuf::from("config.db"),
        }
    }
}

impl Config {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from string
    pub fn from_str(content: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.system_hostname.is_empty() {
            return Err(Error::config("system-hostname must be set"));
        }
        if self.listen.is_empty() {
            return Err(Error::config("listen address must be set"));
        }
        Ok(())
    }

    /// The host users land on after login when no return URL is given
    pub fn shell_hostname(&self) -> &str {
        self.shell_hostname
            .as_deref()
            .unwrap_or(&self.system_hostname)
    }
}
