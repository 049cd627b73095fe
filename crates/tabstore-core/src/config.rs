//! Application configuration
//!
//! Configuration is loaded from:
//! 1. Default values
//! 2. Config file (~/.config/tabstore/config.toml)
//! 3. Environment variables (TABSTORE_* prefix)
//!
//! Environment variables take precedence over config file values.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Environment variable prefix
const ENV_PREFIX: &str = "TABSTORE";

/// Default cap on listing pages
pub const DEFAULT_MAX_PAGES: usize = 100;

/// Default request timeout in seconds
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Application configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Base URL (and scheme) of the CKAN instance
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Dataset whose resources make up the bucket list (optional)
    #[serde(default)]
    pub dataset_id: Option<String>,

    /// API key, or `env:NAME` to read it from a variable at request time
    #[serde(default)]
    pub api_key: Option<String>,

    /// Maximum number of pages fetched when listing buckets
    #[serde(default = "default_max_pages")]
    pub max_pages: usize,

    /// HTTP request timeout
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            dataset_id: None,
            api_key: None,
            max_pages: DEFAULT_MAX_PAGES,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
        }
    }
}

impl Config {
    /// Load configuration from default location and environment
    ///
    /// Order of precedence (highest to lowest):
    /// 1. Environment variables (TABSTORE_BASE_URL, TABSTORE_DATASET_ID, ...)
    /// 2. Config file (~/.config/tabstore/config.toml or TABSTORE_CONFIG)
    /// 3. Default values
    pub fn load() -> Result<Self> {
        Self::load_from_path(&Self::config_file_path())
    }

    /// Load configuration, preferring an explicit file path when given
    pub fn load_with_cli_override(path: Option<&PathBuf>) -> Result<Self> {
        match path {
            Some(path) => Self::load_from_path(path),
            None => Self::load(),
        }
    }

    /// Load configuration from a specific path
    ///
    /// Environment variables are still applied as overrides.
    /// If the file doesn't exist, defaults are used.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {:?}", path))?;
            toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {:?}", path))?
        } else {
            Self::default()
        };

        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Load configuration from a TOML string (useful for testing)
    pub fn load_from_str(toml_content: &str) -> Result<Self> {
        let mut config: Config =
            toml::from_str(toml_content).context("Failed to parse config TOML")?;
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(val) = std::env::var(format!("{}_BASE_URL", ENV_PREFIX)) {
            self.base_url = val;
        }

        // Empty string clears the optional values
        if let Ok(val) = std::env::var(format!("{}_DATASET_ID", ENV_PREFIX)) {
            self.dataset_id = if val.is_empty() { None } else { Some(val) };
        }
        if let Ok(val) = std::env::var(format!("{}_API_KEY", ENV_PREFIX)) {
            self.api_key = if val.is_empty() { None } else { Some(val) };
        }

        if let Ok(val) = std::env::var(format!("{}_MAX_PAGES", ENV_PREFIX)) {
            self.max_pages = val
                .parse()
                .with_context(|| format!("Invalid {}_MAX_PAGES: {:?}", ENV_PREFIX, val))?;
        }
        if let Ok(val) = std::env::var(format!("{}_TIMEOUT_SECS", ENV_PREFIX)) {
            self.timeout_secs = val
                .parse()
                .with_context(|| format!("Invalid {}_TIMEOUT_SECS: {:?}", ENV_PREFIX, val))?;
        }

        Ok(())
    }

    /// Save configuration to a specific file
    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {:?}", path))?;
        Ok(())
    }

    /// Get the config file path
    ///
    /// Can be overridden with TABSTORE_CONFIG environment variable
    pub fn config_file_path() -> PathBuf {
        if let Ok(path) = std::env::var(format!("{}_CONFIG", ENV_PREFIX)) {
            return PathBuf::from(path);
        }

        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("tabstore")
            .join("config.toml")
    }
}

fn default_base_url() -> String {
    "http://localhost:5000".to_string()
}

fn default_max_pages() -> usize {
    DEFAULT_MAX_PAGES
}

fn default_timeout_secs() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;

    // Mutex to serialize tests that touch environment variables
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    /// Guard that locks env access and saves/restores env vars
    struct EnvGuard<'a> {
        _lock: std::sync::MutexGuard<'a, ()>,
        saved: Vec<(String, Option<String>)>,
    }

    impl<'a> EnvGuard<'a> {
        fn new(vars: &[&str]) -> Self {
            let lock = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
            let saved = vars
                .iter()
                .map(|&name| (name.to_string(), env::var(name).ok()))
                .collect();
            for name in vars {
                env::remove_var(name);
            }
            Self { _lock: lock, saved }
        }
    }

    impl Drop for EnvGuard<'_> {
        fn drop(&mut self) {
            for (name, value) in &self.saved {
                match value {
                    Some(v) => env::set_var(name, v),
                    None => env::remove_var(name),
                }
            }
        }
    }

    const ENV_VARS: &[&str] = &[
        "TABSTORE_BASE_URL",
        "TABSTORE_DATASET_ID",
        "TABSTORE_API_KEY",
        "TABSTORE_MAX_PAGES",
        "TABSTORE_TIMEOUT_SECS",
    ];

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.base_url, "http://localhost:5000");
        assert!(config.dataset_id.is_none());
        assert!(config.api_key.is_none());
        assert_eq!(config.max_pages, 100);
    }

    #[test]
    fn test_env_override_base_url() {
        let _guard = EnvGuard::new(ENV_VARS);

        let mut config = Config::default();

        env::set_var("TABSTORE_BASE_URL", "https://demo.ckan.org");
        config.apply_env_overrides().unwrap();

        assert_eq!(config.base_url, "https://demo.ckan.org");
    }

    #[test]
    fn test_env_override_dataset_id() {
        let _guard = EnvGuard::new(ENV_VARS);

        let mut config = Config::default();

        env::set_var("TABSTORE_DATASET_ID", "my-dataset-id");
        config.apply_env_overrides().unwrap();
        assert_eq!(config.dataset_id, Some("my-dataset-id".to_string()));

        // Empty string clears it
        env::set_var("TABSTORE_DATASET_ID", "");
        config.apply_env_overrides().unwrap();
        assert!(config.dataset_id.is_none());
    }

    #[test]
    fn test_env_override_max_pages() {
        let _guard = EnvGuard::new(ENV_VARS);

        let mut config = Config::default();

        env::set_var("TABSTORE_MAX_PAGES", "10");
        config.apply_env_overrides().unwrap();
        assert_eq!(config.max_pages, 10);

        env::set_var("TABSTORE_MAX_PAGES", "lots");
        assert!(config.apply_env_overrides().is_err());
    }

    #[test]
    fn test_load_from_str() {
        let _guard = EnvGuard::new(ENV_VARS);

        let toml = r#"
            base_url = "https://demo.ckan.org"
            dataset_id = "test-dataset-010203"
            api_key = "env:CKAN_API_KEY"
        "#;

        let config = Config::load_from_str(toml).unwrap();
        assert_eq!(config.base_url, "https://demo.ckan.org");
        assert_eq!(config.dataset_id.as_deref(), Some("test-dataset-010203"));
        assert_eq!(config.api_key.as_deref(), Some("env:CKAN_API_KEY"));
        assert_eq!(config.timeout_secs, DEFAULT_TIMEOUT_SECS);
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let _guard = EnvGuard::new(ENV_VARS);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let config = Config {
            base_url: "https://demo.ckan.org".to_string(),
            dataset_id: Some("my-dataset-id".to_string()),
            api_key: None,
            max_pages: 5,
            timeout_secs: 10,
        };
        config.save_to_path(&path).unwrap();

        let loaded = Config::load_from_path(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_load_from_path_missing_file() {
        let _guard = EnvGuard::new(ENV_VARS);

        let path = PathBuf::from("/nonexistent/config.toml");
        let config = Config::load_from_path(&path).unwrap();
        // Should return defaults when file doesn't exist
        assert_eq!(config, Config::default());
    }
}
