//! Discovery engine configuration

use lanwatch_core::OT_PORT;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Engine configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LanConfig {
    /// Interfaces to run discovery on (e.g., ["eth0", "wlan0"])
    #[serde(default)]
    pub interfaces: Vec<String>,
    /// UDP port devices answer on
    #[serde(default = "default_port")]
    pub port: u16,
    /// Identity embedded in outbound probes (random when unset). Written as
    /// a string so the full u64 range survives TOML's signed integers;
    /// integers and `0x` hex strings are accepted too.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "virtual_id_serde"
    )]
    pub virtual_id: Option<u64>,
    /// First scan interval in milliseconds
    #[serde(default = "default_probe_interval_min")]
    pub probe_interval_min_ms: u64,
    /// Scan interval cap in milliseconds
    #[serde(default = "default_probe_interval_max")]
    pub probe_interval_max_ms: u64,
    /// Upper bound of the random delay before the first scan
    #[serde(default = "default_startup_jitter")]
    pub startup_jitter_ms: u64,
    /// Time without keep-alive before a device goes offline
    #[serde(default = "default_keepalive_timeout")]
    pub keepalive_timeout_ms: u64,
}

impl Default for LanConfig {
    fn default() -> Self {
        Self {
            interfaces: Vec::new(),
            port: default_port(),
            virtual_id: None,
            probe_interval_min_ms: default_probe_interval_min(),
            probe_interval_max_ms: default_probe_interval_max(),
            startup_jitter_ms: default_startup_jitter(),
            keepalive_timeout_ms: default_keepalive_timeout(),
        }
    }
}

impl LanConfig {
    pub fn probe_interval_min(&self) -> Duration {
        Duration::from_millis(self.probe_interval_min_ms)
    }

    pub fn probe_interval_max(&self) -> Duration {
        Duration::from_millis(self.probe_interval_max_ms)
    }

    pub fn startup_jitter(&self) -> Duration {
        Duration::from_millis(self.startup_jitter_ms)
    }

    pub fn keepalive_timeout(&self) -> Duration {
        Duration::from_millis(self.keepalive_timeout_ms)
    }
}

fn default_port() -> u16 {
    OT_PORT
}

fn default_probe_interval_min() -> u64 {
    5_000
}

fn default_probe_interval_max() -> u64 {
    45_000
}

fn default_startup_jitter() -> u64 {
    3_000
}

fn default_keepalive_timeout() -> u64 {
    100_000
}

mod virtual_id_serde {
    use serde::{Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Number(u64),
        Text(String),
    }

    pub fn serialize<S>(id: &Option<u64>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match id {
            Some(id) => serializer.serialize_str(&id.to_string()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let text = match Option::<Repr>::deserialize(deserializer)? {
            None => return Ok(None),
            Some(Repr::Number(id)) => return Ok(Some(id)),
            Some(Repr::Text(text)) => text,
        };
        let parsed = match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
            Some(hex) => u64::from_str_radix(hex, 16),
            None => text.parse(),
        };
        parsed
            .map(Some)
            .map_err(|e| serde::de::Error::custom(format!("invalid virtual_id {text:?}: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = LanConfig::default();
        assert_eq!(config.port, 54321);
        assert_eq!(config.probe_interval_min(), Duration::from_secs(5));
        assert_eq!(config.probe_interval_max(), Duration::from_secs(45));
        assert_eq!(config.startup_jitter(), Duration::from_secs(3));
        assert_eq!(config.keepalive_timeout(), Duration::from_secs(100));
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: LanConfig = toml::from_str(
            r#"
interfaces = ["eth0"]
virtual_id = 42
"#,
        )
        .unwrap();
        assert_eq!(config.interfaces, vec!["eth0".to_string()]);
        assert_eq!(config.virtual_id, Some(42));
        assert_eq!(config.port, 54321);
        assert_eq!(config.keepalive_timeout_ms, 100_000);
    }

    #[test]
    fn test_virtual_id_full_range() {
        let config: LanConfig = toml::from_str(r#"virtual_id = "18446744073709551615""#).unwrap();
        assert_eq!(config.virtual_id, Some(u64::MAX));

        let config: LanConfig = toml::from_str(r#"virtual_id = "0x8000000000000001""#).unwrap();
        assert_eq!(config.virtual_id, Some(0x8000_0000_0000_0001));

        let saved = toml::to_string(&config).unwrap();
        assert!(saved.contains(r#"virtual_id = "9223372036854775809""#));
        let loaded: LanConfig = toml::from_str(&saved).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_virtual_id_unset_or_invalid() {
        let saved = toml::to_string(&LanConfig::default()).unwrap();
        assert!(!saved.contains("virtual_id"));
        assert_eq!(toml::from_str::<LanConfig>(&saved).unwrap().virtual_id, None);

        assert!(toml::from_str::<LanConfig>(r#"virtual_id = "nope""#).is_err());
        assert!(toml::from_str::<LanConfig>("virtual_id = -1").is_err());
    }
}
