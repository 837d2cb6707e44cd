//! Configuration loading

use anyhow::Result;
use lanwatch_discovery::{LanConfig, SystemInterfacesConfig};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub discovery: LanConfig,
    #[serde(default)]
    pub interfaces: SystemInterfacesConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// How long `--list-once` collects replies before printing
    #[serde(default = "default_list_wait")]
    pub list_wait_secs: u64,
    /// Print device changes as JSON lines instead of log records
    #[serde(default)]
    pub json_events: bool,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            list_wait_secs: default_list_wait(),
            json_events: false,
        }
    }
}

fn default_list_wait() -> u64 {
    10
}

/// Load configuration from file
pub fn load_config(path: &Path) -> Result<Config> {
    if path.exists() {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        info!(path = %path.display(), "Loaded configuration");
        Ok(config)
    } else {
        info!(
            path = %path.display(),
            "Configuration file not found, using defaults"
        );
        Ok(Config::default())
    }
}

/// Save default configuration to file
pub fn save_default_config(path: &Path) -> Result<()> {
    let config = Config {
        discovery: LanConfig {
            interfaces: vec!["eth0".to_string()],
            ..LanConfig::default()
        },
        ..Config::default()
    };

    let content = toml::to_string_pretty(&config)?;
    std::fs::write(path, content)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.daemon.list_wait_secs, 10);
        assert!(config.discovery.interfaces.is_empty());
        assert_eq!(config.discovery.port, 54321);
        assert_eq!(config.interfaces.poll_interval_secs, 5);
    }

    #[test]
    fn test_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lanwatch.toml");
        std::fs::write(
            &path,
            r#"
[discovery]
interfaces = ["wlan0"]
keepalive_timeout_ms = 30000

[interfaces]
ignore_prefixes = ["lo"]
"#,
        )
        .unwrap();

        let config = load_config(&path).unwrap();
        assert_eq!(config.discovery.interfaces, vec!["wlan0".to_string()]);
        assert_eq!(config.discovery.keepalive_timeout(), Duration::from_secs(30));
        assert_eq!(config.discovery.probe_interval_min(), Duration::from_secs(5));
        assert_eq!(config.interfaces.ignore_prefixes, vec!["lo".to_string()]);
        assert!(!config.daemon.json_events);
    }

    #[test]
    fn test_saved_default_loads_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lanwatch.toml");
        save_default_config(&path).unwrap();

        let config = load_config(&path).unwrap();
        assert_eq!(config.discovery.interfaces, vec!["eth0".to_string()]);
        assert_eq!(config.discovery.virtual_id, None);
    }

    #[test]
    fn test_invalid_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lanwatch.toml");
        std::fs::write(&path, "[discovery]\nport = \"not a port\"\n").unwrap();
        assert!(load_config(&path).is_err());
    }
}
