//! Configuration structs with sensible defaults and RON persistence.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// File name of the config inside its directory.
pub const CONFIG_FILE_NAME: &str = "config.ron";

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Transport settings.
    pub network: NetworkConfig,
    /// Online service login and readiness.
    pub service: ServiceConfig,
    /// Local content cache.
    pub content: ContentConfig,
    /// Debug/development settings.
    pub debug: DebugConfig,
}

/// Transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address clients connect to.
    pub service_address: String,
    /// Port clients connect to.
    pub service_port: u16,
    /// Port the server listens on.
    pub listen_port: u16,
    /// Accept IPv6 as well as IPv4 clients.
    pub dual_stack: bool,
    /// Maximum concurrent clients (server only).
    pub max_connections: usize,
    /// Disable Nagle's algorithm.
    pub tcp_nodelay: bool,
    /// Idle seconds before TCP keepalive probes start.
    pub keepalive_idle_seconds: u64,
    /// Bytes requested per socket read.
    pub read_buffer_size: usize,
}

/// Online service configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServiceConfig {
    /// Developer API key sent on login.
    pub api_key: String,
    /// Project to work on.
    pub project_name: String,
    /// Wait for content readiness when content is cached locally (ms).
    pub ready_timeout_cached_ms: u64,
    /// Wait for content readiness without a local cache (ms).
    pub ready_timeout_uncached_ms: u64,
    /// User name the development server reports for every login.
    pub host_user_name: String,
}

/// Local content cache configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ContentConfig {
    /// Directory holding downloaded content files.
    pub directory: PathBuf,
    /// Name of the metadata index inside `directory`.
    pub metadata_file: String,
}

/// Debug/development configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DebugConfig {
    /// Log level override (e.g., "debug", "info", "warn").
    pub log_level: String,
    /// Also write JSON logs to the log directory.
    pub log_to_file: bool,
}

// --- Default implementations ---

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            service_address: "127.0.0.1".to_string(),
            service_port: 800,
            listen_port: 800,
            dual_stack: false,
            max_connections: 256,
            tcp_nodelay: true,
            keepalive_idle_seconds: 60,
            read_buffer_size: 4096,
        }
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            project_name: String::new(),
            ready_timeout_cached_ms: 5_000,
            ready_timeout_uncached_ms: 30_000,
            host_user_name: "TestUser".to_string(),
        }
    }
}

impl Default for ContentConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("Content"),
            metadata_file: "ContentMetaData.ron".to_string(),
        }
    }
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_to_file: cfg!(debug_assertions),
        }
    }
}

impl ServiceConfig {
    /// Readiness timeout with local content.
    pub fn ready_timeout_cached(&self) -> Duration {
        Duration::from_millis(self.ready_timeout_cached_ms)
    }

    /// Readiness timeout without local content.
    pub fn ready_timeout_uncached(&self) -> Duration {
        Duration::from_millis(self.ready_timeout_uncached_ms)
    }
}

impl NetworkConfig {
    /// Keepalive idle time.
    pub fn keepalive_idle(&self) -> Duration {
        Duration::from_secs(self.keepalive_idle_seconds)
    }
}

// --- Load / Save / Reload / Validate ---

impl Config {
    /// Load config from the given directory, or create a default config file.
    pub fn load_or_create(config_dir: &Path) -> Result<Self, ConfigError> {
        let config_path = config_dir.join(CONFIG_FILE_NAME);

        if config_path.exists() {
            let contents = std::fs::read_to_string(&config_path).map_err(ConfigError::ReadError)?;
            let config: Config = ron::from_str(&contents).map_err(ConfigError::ParseError)?;
            log::info!("Loaded config from {}", config_path.display());
            Ok(config)
        } else {
            let config = Config::default();
            config.save(config_dir)?;
            log::info!("Created default config at {}", config_path.display());
            Ok(config)
        }
    }

    /// Save config to the given directory as `config.ron`.
    pub fn save(&self, config_dir: &Path) -> Result<(), ConfigError> {
        std::fs::create_dir_all(config_dir).map_err(ConfigError::WriteError)?;

        let config_path = config_dir.join(CONFIG_FILE_NAME);
        let pretty = ron::ser::PrettyConfig::new()
            .depth_limit(3)
            .separate_tuple_members(true)
            .enumerate_arrays(false);

        let serialized =
            ron::ser::to_string_pretty(self, pretty).map_err(ConfigError::SerializeError)?;

        std::fs::write(&config_path, serialized).map_err(ConfigError::WriteError)?;
        Ok(())
    }

    /// Hot-reload: returns `Some(new_config)` if the file changed, `None` otherwise.
    pub fn reload(&self, config_dir: &Path) -> Result<Option<Self>, ConfigError> {
        let config_path = config_dir.join(CONFIG_FILE_NAME);
        let contents = std::fs::read_to_string(&config_path).map_err(ConfigError::ReadError)?;
        let new_config: Config = ron::from_str(&contents).map_err(ConfigError::ParseError)?;

        if &new_config != self {
            log::info!("Config reloaded with changes");
            Ok(Some(new_config))
        } else {
            Ok(None)
        }
    }

    /// Reject values the network layer cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.network.max_connections == 0 {
            return Err(ConfigError::Invalid {
                field: "network.max_connections",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.network.read_buffer_size == 0 {
            return Err(ConfigError::Invalid {
                field: "network.read_buffer_size",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.content.metadata_file.is_empty() {
            return Err(ConfigError::Invalid {
                field: "content.metadata_file",
                reason: "must not be empty".to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_serializes() {
        let config = Config::default();
        let ron_str =
            ron::ser::to_string_pretty(&config, ron::ser::PrettyConfig::new().depth_limit(3))
                .unwrap();
        assert!(ron_str.contains("listen_port: 800"));
        assert!(ron_str.contains("max_connections: 256"));
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.network.service_address, "127.0.0.1");
        assert_eq!(config.service.ready_timeout_cached(), Duration::from_secs(5));
        assert_eq!(config.service.ready_timeout_uncached(), Duration::from_secs(30));
        assert_eq!(config.content.directory, PathBuf::from("Content"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_missing_section_uses_default() {
        let ron_str = "(network: (listen_port: 9000))";
        let config: Config = ron::from_str(ron_str).unwrap();
        assert_eq!(config.network.listen_port, 9000);
        assert_eq!(config.network.max_connections, 256);
        assert_eq!(config.service, ServiceConfig::default());
    }

    #[test]
    fn test_extra_field_ignored() {
        let result: Result<Config, _> = ron::from_str("(future_setting: true)");
        assert!(result.is_ok());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.service.api_key = "secret".to_string();
        config.service.project_name = "Breakout".to_string();
        config.network.service_address = "10.0.0.1".to_string();

        config.save(dir.path()).unwrap();
        let loaded = Config::load_or_create(dir.path()).unwrap();
        assert_eq!(config, loaded);
    }

    #[test]
    fn test_load_or_create_writes_default_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_or_create(dir.path()).unwrap();
        assert_eq!(config, Config::default());
        assert!(dir.path().join(CONFIG_FILE_NAME).exists());
    }

    #[test]
    fn test_reload_detects_changes() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::default();
        config.save(dir.path()).unwrap();

        let mut modified = config.clone();
        modified.network.listen_port = 8080;
        modified.save(dir.path()).unwrap();

        let result = config.reload(dir.path()).unwrap();
        assert_eq!(result.map(|c| c.network.listen_port), Some(8080));
    }

    #[test]
    fn test_reload_no_changes() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::default();
        config.save(dir.path()).unwrap();
        assert!(config.reload(dir.path()).unwrap().is_none());
    }

    #[test]
    fn test_invalid_ron_produces_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE_NAME), "{{not valid}}").unwrap();
        let result = Config::load_or_create(dir.path());
        assert!(matches!(result, Err(ConfigError::ParseError(_))));
    }

    #[test]
    fn test_validate_rejects_zero_connections() {
        let mut config = Config::default();
        config.network.max_connections = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid {
                field: "network.max_connections",
                ..
            })
        ));
    }
}
