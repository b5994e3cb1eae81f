//! Configuration management for AMAN.
//!
//! Loads configuration from ${AMAN_HOME}/config.toml with sensible defaults.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Environment variable overriding `base_url`.
pub const BASE_URL_ENV: &str = "AMAN_BASE_URL";

/// Default configuration template for `config init`.
///
/// This is embedded from default_config.toml at compile time.
fn default_config_template() -> &'static str {
    include_str!("../default_config.toml")
}

pub mod paths {
    //! Path resolution for AMAN configuration and data directories.
    //!
    //! AMAN_HOME resolution order:
    //! 1. AMAN_HOME environment variable (if set)
    //! 2. ~/.config/aman (default)
    //! 3. ./.aman when no home directory can be determined

    use std::path::PathBuf;

    pub const HOME_ENV: &str = "AMAN_HOME";

    /// Returns the AMAN home directory.
    pub fn aman_home() -> PathBuf {
        if let Ok(home) = std::env::var(HOME_ENV)
            && !home.trim().is_empty()
        {
            return PathBuf::from(home);
        }

        dirs::home_dir()
            .map(|h| h.join(".config").join("aman"))
            .unwrap_or_else(|| PathBuf::from(".aman"))
    }

    /// Returns the path to the config.toml file.
    pub fn config_path() -> PathBuf {
        aman_home().join("config.toml")
    }

    /// Default directory of the durable session store.
    pub fn data_dir() -> PathBuf {
        aman_home().join("data")
    }

    pub fn logs_dir() -> PathBuf {
        aman_home().join("logs")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Root URL of the inference service.
    pub base_url: String,
    /// Model used until one is picked and saved.
    pub default_model: String,
    /// Override for the durable store directory.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,
    /// Connect timeout in seconds; 0 disables it.
    pub request_timeout_secs: u64,
}

impl Config {
    pub const DEFAULT_BASE_URL: &str = "http://localhost:8000";
    pub const DEFAULT_MODEL: &str = "llama3";
    const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 10;

    /// Loads configuration from the default config path.
    ///
    /// # Errors
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load() -> Result<Self> {
        Self::load_from(&paths::config_path())
    }

    /// Loads configuration from a specific path.
    /// Returns defaults if file doesn't exist.
    ///
    /// # Errors
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = fs::read_to_string(path)
                .with_context(|| format!("Failed to read config from {}", path.display()))?;
            toml::from_str(&contents)
                .with_context(|| format!("Failed to parse config from {}", path.display()))
        } else {
            Ok(Config::default())
        }
    }

    /// Resolves the service URL with precedence: env > config > default.
    ///
    /// # Errors
    /// Returns an error if the chosen URL does not parse.
    pub fn resolved_base_url(&self) -> Result<String> {
        let env_url = std::env::var(BASE_URL_ENV).ok();
        resolve_base_url(env_url.as_deref(), &self.base_url)
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        if self.request_timeout_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(self.request_timeout_secs))
        }
    }

    /// Directory of the durable session store.
    pub fn data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(paths::data_dir)
    }

    /// Creates a default config file at the given path.
    ///
    /// # Errors
    /// Returns an error if the file already exists or cannot be written.
    pub fn init(path: &Path) -> Result<()> {
        if path.exists() {
            anyhow::bail!("Config file already exists at {}", path.display());
        }

        Self::write_config(path, default_config_template())
    }

    /// Writes config content to a file, creating parent directories as needed.
    /// Uses atomic write (temp file + rename) to prevent corruption.
    fn write_config(path: &Path, content: &str) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory {}", parent.display()))?;
        }

        let tmp_path = path.with_extension("toml.tmp");
        fs::write(&tmp_path, content)
            .with_context(|| format!("Failed to write config to {}", tmp_path.display()))?;
        fs::rename(&tmp_path, path).with_context(|| {
            format!(
                "Failed to rename {} to {}",
                tmp_path.display(),
                path.display()
            )
        })?;

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_url: Self::DEFAULT_BASE_URL.to_string(),
            default_model: Self::DEFAULT_MODEL.to_string(),
            data_dir: None,
            request_timeout_secs: Self::DEFAULT_REQUEST_TIMEOUT_SECS,
        }
    }
}

fn resolve_base_url(env_url: Option<&str>, config_url: &str) -> Result<String> {
    let chosen = [env_url, Some(config_url)]
        .into_iter()
        .flatten()
        .map(str::trim)
        .find(|url| !url.is_empty())
        .unwrap_or(Config::DEFAULT_BASE_URL);

    url::Url::parse(chosen).with_context(|| format!("Invalid base URL: {chosen}"))?;
    Ok(chosen.trim_end_matches('/').to_string())
}
