use std::env;
use std::path::PathBuf;
use std::time::Duration;

use watchsync_collab::{EngineConfig, ServerConfig};

/// Server configuration loaded from environment variables
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Server host (default: 0.0.0.0)
    pub host: String,
    /// Server port (default: 3000)
    pub port: u16,
    /// RocksDB directory; unset keeps everything in memory
    pub storage_path: Option<PathBuf>,
    /// Delay before a playback snapshot is written (default: 5000)
    pub persist_debounce_ms: u64,
    /// Drift that triggers a correction, in seconds (default: 3)
    pub drift_threshold_secs: f64,
    /// WebSocket ping interval (default: 10)
    pub heartbeat_secs: u64,
    /// Per-room fan-out buffer (default: 256)
    pub broadcast_capacity: usize,
    /// JSON file with `users` and `rooms` to load at startup
    pub seed_file: Option<PathBuf>,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration through an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = EngineConfig::default();

        let host = lookup("HOST").unwrap_or_else(|| "0.0.0.0".to_string());
        let port = parse(&lookup, "PORT", 3000)?;
        let storage_path = lookup("STORAGE_PATH")
            .filter(|s| !s.trim().is_empty())
            .map(PathBuf::from);
        let persist_debounce_ms = parse(
            &lookup,
            "PERSIST_DEBOUNCE_MS",
            defaults.persist_debounce.as_millis() as u64,
        )?;
        let drift_threshold_secs =
            parse(&lookup, "DRIFT_THRESHOLD_SECS", defaults.drift_threshold_secs)?;
        if !drift_threshold_secs.is_finite() || drift_threshold_secs <= 0.0 {
            return Err(ConfigError::Invalid {
                key: "DRIFT_THRESHOLD_SECS",
                value: drift_threshold_secs.to_string(),
            });
        }
        let heartbeat_secs = parse(&lookup, "HEARTBEAT_SECS", ServerConfig::default().heartbeat_interval_secs)?;
        let broadcast_capacity = parse(&lookup, "BROADCAST_CAPACITY", defaults.broadcast_capacity)?;
        let seed_file = lookup("SEED_FILE")
            .filter(|s| !s.trim().is_empty())
            .map(PathBuf::from);

        Ok(Config {
            host,
            port,
            storage_path,
            persist_debounce_ms,
            drift_threshold_secs,
            heartbeat_secs,
            broadcast_capacity,
            seed_file,
        })
    }

    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            persist_debounce: Duration::from_millis(self.persist_debounce_ms),
            drift_threshold_secs: self.drift_threshold_secs,
            broadcast_capacity: self.broadcast_capacity,
            ..EngineConfig::default()
        }
    }

    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            bind_addr: self.server_addr(),
            heartbeat_interval_secs: self.heartbeat_secs,
        }
    }
}

fn parse<F, T>(lookup: &F, key: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match lookup(key) {
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { key, value }),
        None => Ok(default),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: '{value}'")]
    Invalid { key: &'static str, value: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(pairs: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = load(&[]).unwrap();
        assert_eq!(config.server_addr(), "0.0.0.0:3000");
        assert_eq!(config.storage_path, None);
        assert_eq!(config.persist_debounce_ms, 5000);
        assert_eq!(config.drift_threshold_secs, 3.0);
        assert_eq!(config.heartbeat_secs, 10);
        assert_eq!(config.broadcast_capacity, 256);
        assert_eq!(config.seed_file, None);
    }

    #[test]
    fn test_overrides_flow_into_engine_and_server() {
        let config = load(&[
            ("HOST", "127.0.0.1"),
            ("PORT", "8080"),
            ("STORAGE_PATH", "/var/lib/watchsync"),
            ("PERSIST_DEBOUNCE_MS", "250"),
            ("DRIFT_THRESHOLD_SECS", "1.5"),
            ("HEARTBEAT_SECS", "30"),
        ])
        .unwrap();

        assert_eq!(config.storage_path, Some(PathBuf::from("/var/lib/watchsync")));
        let engine = config.engine_config();
        assert_eq!(engine.persist_debounce, Duration::from_millis(250));
        assert_eq!(engine.drift_threshold_secs, 1.5);
        assert_eq!(engine.history_limit, 50);

        let server = config.server_config();
        assert_eq!(server.bind_addr, "127.0.0.1:8080");
        assert_eq!(server.heartbeat_interval_secs, 30);
    }

    #[test]
    fn test_invalid_port() {
        let err = load(&[("PORT", "eighty")]).unwrap_err();
        assert_eq!(err.to_string(), "invalid value for PORT: 'eighty'");
    }

    #[test]
    fn test_non_positive_drift_rejected() {
        assert!(load(&[("DRIFT_THRESHOLD_SECS", "0")]).is_err());
        assert!(load(&[("DRIFT_THRESHOLD_SECS", "-2")]).is_err());
    }

    #[test]
    fn test_blank_storage_path_means_memory() {
        let config = load(&[("STORAGE_PATH", "  ")]).unwrap();
        assert_eq!(config.storage_path, None);
    }
}
