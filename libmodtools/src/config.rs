//! Configuration management for modtools

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{ConfigError, Result};

pub const DEFAULT_SERVICE: &str = "https://bsky.social";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub database: DatabaseConfig,
    pub bluesky: BlueskyConfig,
    #[serde(default)]
    pub credentials: CredentialsConfig,
    #[serde(default)]
    pub sync: SyncConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlueskyConfig {
    pub handle: String,
    #[serde(default = "default_service")]
    pub service: String,
    /// List used by `add_likes_to_be_processed` when no `--list` is given
    #[serde(default)]
    pub default_list: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// OS keyring, with the environment variable taking precedence
    #[default]
    Keyring,
    /// Environment variable only
    Env,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CredentialsConfig {
    #[serde(default)]
    pub storage: StorageBackend,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// in_flight actions older than this are reclaimed as pending
    #[serde(default = "default_in_flight_timeout")]
    pub in_flight_timeout: String,
    /// Longest rate-limit backoff the drain will sleep through
    #[serde(default = "default_max_backoff")]
    pub max_backoff: String,
    #[serde(default = "default_max_network_retries")]
    pub max_network_retries: u32,
    /// Client-side budget; 0 disables it
    #[serde(default = "default_additions_per_hour")]
    pub additions_per_hour: u32,
    /// Reject enqueue of an already pending pair instead of merging
    #[serde(default)]
    pub reject_duplicate_pending: bool,
    #[serde(default = "default_true")]
    pub check_existing_members: bool,
    /// DIDs or handles that are never added to a list
    #[serde(default)]
    pub protected: Vec<String>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            in_flight_timeout: default_in_flight_timeout(),
            max_backoff: default_max_backoff(),
            max_network_retries: default_max_network_retries(),
            additions_per_hour: default_additions_per_hour(),
            reject_duplicate_pending: false,
            check_existing_members: true,
            protected: Vec::new(),
        }
    }
}

impl SyncConfig {
    pub fn in_flight_timeout(&self) -> Result<Duration> {
        parse_duration_field("sync.in_flight_timeout", &self.in_flight_timeout)
    }

    pub fn max_backoff(&self) -> Result<Duration> {
        parse_duration_field("sync.max_backoff", &self.max_backoff)
    }
}

fn default_service() -> String {
    DEFAULT_SERVICE.to_string()
}

fn default_in_flight_timeout() -> String {
    "10m".to_string()
}

fn default_max_backoff() -> String {
    "1h".to_string()
}

fn default_max_network_retries() -> u32 {
    3
}

fn default_additions_per_hour() -> u32 {
    1500
}

fn default_true() -> bool {
    true
}

fn parse_duration_field(field: &str, value: &str) -> Result<Duration> {
    humantime::parse_duration(value).map_err(|e| {
        ConfigError::InvalidValue {
            field: field.to_string(),
            reason: format!("'{}' is not a duration ({})", value, e),
        }
        .into()
    })
}

impl Config {
    /// Load configuration from the default location
    pub fn load() -> Result<Self> {
        let config_path = resolve_config_path()?;
        Self::load_from_path(&config_path)
    }

    /// Load configuration from a specific path
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::ReadError)?;
        let mut config: Config = toml::from_str(&content).map_err(ConfigError::ParseError)?;

        if let Ok(db_path) = std::env::var("MODTOOLS_DB_PATH") {
            config.database.path = db_path;
        }

        config.validate()?;
        Ok(config)
    }

    /// Check values that serde cannot
    pub fn validate(&self) -> Result<()> {
        if self.bluesky.handle.trim().is_empty() {
            return Err(ConfigError::MissingField("bluesky.handle".to_string()).into());
        }
        if self.database.path.trim().is_empty() {
            return Err(ConfigError::MissingField("database.path".to_string()).into());
        }
        self.sync.in_flight_timeout()?;
        self.sync.max_backoff()?;
        Ok(())
    }
}

/// Resolve the configuration file path following XDG Base Directory conventions
pub fn resolve_config_path() -> Result<PathBuf> {
    if let Ok(path) = std::env::var("MODTOOLS_CONFIG") {
        return Ok(PathBuf::from(shellexpand::tilde(&path).to_string()));
    }

    let config_dir = dirs::config_dir()
        .ok_or_else(|| ConfigError::MissingField("config directory".to_string()))?;

    Ok(config_dir.join("modtools").join("config.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::TempDir;

    fn write_config(dir: &TempDir, content: &str) -> PathBuf {
        let path = dir.path().join("config.toml");
        std::fs::write(&path, content).unwrap();
        path
    }

    #[test]
    #[serial]
    fn test_minimal_config_uses_defaults() {
        std::env::remove_var("MODTOOLS_DB_PATH");
        let dir = TempDir::new().unwrap();
        let path = write_config(
            &dir,
            r#"
[database]
path = "/tmp/actions.db"

[bluesky]
handle = "me.bsky.social"
"#,
        );

        let config = Config::load_from_path(&path).unwrap();
        assert_eq!(config.bluesky.service, DEFAULT_SERVICE);
        assert_eq!(config.bluesky.default_list, None);
        assert_eq!(config.credentials.storage, StorageBackend::Keyring);
        assert_eq!(config.sync.in_flight_timeout().unwrap(), Duration::from_secs(600));
        assert_eq!(config.sync.max_backoff().unwrap(), Duration::from_secs(3600));
        assert_eq!(config.sync.max_network_retries, 3);
        assert_eq!(config.sync.additions_per_hour, 1500);
        assert!(!config.sync.reject_duplicate_pending);
        assert!(config.sync.check_existing_members);
        assert!(config.sync.protected.is_empty());
    }

    #[test]
    #[serial]
    fn test_full_config() {
        std::env::remove_var("MODTOOLS_DB_PATH");
        let dir = TempDir::new().unwrap();
        let path = write_config(
            &dir,
            r#"
[database]
path = "/tmp/actions.db"

[bluesky]
handle = "me.bsky.social"
service = "https://pds.example.com"
default_list = "https://bsky.app/profile/me.bsky.social/lists/3kabc"

[credentials]
storage = "env"

[sync]
in_flight_timeout = "30s"
max_backoff = "5m"
max_network_retries = 1
additions_per_hour = 0
reject_duplicate_pending = true
check_existing_members = false
protected = ["did:plc:friend", "pal.bsky.social"]
"#,
        );

        let config = Config::load_from_path(&path).unwrap();
        assert_eq!(config.bluesky.service, "https://pds.example.com");
        assert_eq!(config.credentials.storage, StorageBackend::Env);
        assert_eq!(config.sync.in_flight_timeout().unwrap(), Duration::from_secs(30));
        assert_eq!(config.sync.max_backoff().unwrap(), Duration::from_secs(300));
        assert!(config.sync.reject_duplicate_pending);
        assert!(!config.sync.check_existing_members);
        assert_eq!(config.sync.protected.len(), 2);
    }

    #[test]
    #[serial]
    fn test_db_path_env_override() {
        let dir = TempDir::new().unwrap();
        let path = write_config(
            &dir,
            r#"
[database]
path = "/tmp/actions.db"

[bluesky]
handle = "me.bsky.social"
"#,
        );

        std::env::set_var("MODTOOLS_DB_PATH", "/tmp/override.db");
        let config = Config::load_from_path(&path);
        std::env::remove_var("MODTOOLS_DB_PATH");

        assert_eq!(config.unwrap().database.path, "/tmp/override.db");
    }

    #[test]
    #[serial]
    fn test_invalid_duration_is_rejected() {
        std::env::remove_var("MODTOOLS_DB_PATH");
        let dir = TempDir::new().unwrap();
        let path = write_config(
            &dir,
            r#"
[database]
path = "/tmp/actions.db"

[bluesky]
handle = "me.bsky.social"

[sync]
max_backoff = "forever"
"#,
        );

        let err = Config::load_from_path(&path).unwrap_err();
        assert!(err.to_string().contains("sync.max_backoff"));
    }

    #[test]
    #[serial]
    fn test_empty_handle_is_rejected() {
        std::env::remove_var("MODTOOLS_DB_PATH");
        let dir = TempDir::new().unwrap();
        let path = write_config(
            &dir,
            r#"
[database]
path = "/tmp/actions.db"

[bluesky]
handle = ""
"#,
        );

        let err = Config::load_from_path(&path).unwrap_err();
        assert!(err.to_string().contains("bluesky.handle"));
    }

    #[test]
    fn test_missing_file() {
        let err = Config::load_from_path(Path::new("/nonexistent/modtools/config.toml")).unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }

    #[test]
    #[serial]
    fn test_resolve_config_path_from_env() {
        std::env::set_var("MODTOOLS_CONFIG", "/tmp/custom/config.toml");
        let path = resolve_config_path().unwrap();
        std::env::remove_var("MODTOOLS_CONFIG");
        assert_eq!(path, PathBuf::from("/tmp/custom/config.toml"));
    }
}
