//! On-disk configuration schema (spec.md §6 "Config schema").
//!
//! Loading a config file is, strictly, an external collaborator (spec.md
//! §1), but a runnable daemon still needs a typed representation of it and
//! something to parse it with -- following `zfs2s3`'s
//! `Config::try_from(&str)` pattern (other_examples) rather than hand
//! rolling a key=value reader.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

fn default_property_namespace() -> String {
    "zrepd".to_string()
}

fn default_dataset_type() -> String {
    "filesystem,volume".to_string()
}

fn default_snapshot_name_template() -> String {
    "backup_%UNIXTIME%".to_string()
}

fn default_send_routines() -> usize {
    3
}

fn default_maximum_concurrent_receives() -> usize {
    4
}

fn default_stop_sending_before_delete() -> Duration {
    Duration::from_secs(24 * 60 * 60)
}

fn default_maximum_send_time() -> Duration {
    Duration::from_secs(12 * 60 * 60)
}

fn default_maximum_remote_cache_age() -> Duration {
    Duration::from_secs(2 * 60 * 60)
}

fn default_send_progress_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_retention_grace() -> Duration {
    Duration::from_secs(5 * 60)
}

/// Server-side gating of which client-requested behaviors are honored,
/// spec.md §6.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Permissions {
    pub allow_speed_override: bool,
    pub allow_non_raw: bool,
    pub allow_include_properties: bool,
    pub allow_destroy_filesystems: bool,
    pub allow_destroy_snapshots: bool,
}

impl Default for Permissions {
    fn default() -> Self {
        Self {
            allow_speed_override: false,
            allow_non_raw: true,
            allow_include_properties: true,
            allow_destroy_filesystems: false,
            allow_destroy_snapshots: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub parent_dataset: String,
    #[serde(default = "default_dataset_type")]
    pub dataset_type: String,
    #[serde(default = "default_property_namespace")]
    pub property_namespace: String,
    pub http_headers: HashMap<String, String>,
    #[serde(default = "default_snapshot_name_template")]
    pub snapshot_name_template: String,

    pub enable_snapshot_create: bool,
    pub enable_snapshot_send: bool,
    pub enable_snapshot_mark: bool,
    pub enable_snapshot_prune: bool,
    pub enable_snapshot_mark_remote: bool,

    #[serde(default = "default_send_routines")]
    pub send_routines: usize,
    pub send_raw: bool,
    pub send_resumable: bool,
    pub send_include_properties: Vec<String>,
    pub send_copy_properties: Vec<String>,
    pub send_set_properties: HashMap<String, String>,
    pub send_compression_level: Option<String>,
    pub send_speed_bytes_per_second: Option<u64>,

    #[serde(with = "humantime_serde", default = "default_send_progress_interval")]
    pub send_progress_event_interval: Duration,
    #[serde(with = "humantime_serde", default = "default_maximum_send_time")]
    pub maximum_send_time: Duration,
    #[serde(with = "humantime_serde", default = "default_maximum_remote_cache_age")]
    pub maximum_remote_snapshot_cache_age: Duration,
    #[serde(with = "humantime_serde", default = "default_stop_sending_before_delete")]
    pub stop_sending_before_delete: Duration,
    #[serde(with = "humantime_serde", default = "default_retention_grace")]
    pub retention_grace_period: Duration,

    pub permissions: Permissions,
    #[serde(default = "default_maximum_concurrent_receives")]
    pub maximum_concurrent_receives: usize,

    pub authentication_tokens: Vec<String>,
    pub path_prefix: Option<String>,
    pub listen_address: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            parent_dataset: String::new(),
            dataset_type: default_dataset_type(),
            property_namespace: default_property_namespace(),
            http_headers: HashMap::new(),
            snapshot_name_template: default_snapshot_name_template(),
            enable_snapshot_create: true,
            enable_snapshot_send: true,
            enable_snapshot_mark: true,
            enable_snapshot_prune: true,
            enable_snapshot_mark_remote: false,
            send_routines: default_send_routines(),
            send_raw: false,
            send_resumable: true,
            send_include_properties: Vec::new(),
            send_copy_properties: Vec::new(),
            send_set_properties: HashMap::new(),
            send_compression_level: None,
            send_speed_bytes_per_second: None,
            send_progress_event_interval: default_send_progress_interval(),
            maximum_send_time: default_maximum_send_time(),
            maximum_remote_snapshot_cache_age: default_maximum_remote_cache_age(),
            stop_sending_before_delete: default_stop_sending_before_delete(),
            retention_grace_period: default_retention_grace(),
            permissions: Permissions::default(),
            maximum_concurrent_receives: default_maximum_concurrent_receives(),
            authentication_tokens: Vec::new(),
            path_prefix: None,
            listen_address: "0.0.0.0:8989".to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not parse config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

impl TryFrom<&str> for Config {
    type Error = ConfigError;

    fn try_from(contents: &str) -> Result<Self, Self::Error> {
        let config: Config = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }
}

impl Config {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.send_routines == 0 {
            return Err(ConfigError::Invalid(
                "send_routines must be at least 1".to_string(),
            ));
        }
        if self.maximum_send_time.is_zero() {
            return Err(ConfigError::Invalid(
                "maximum_send_time must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_config() {
        let toml = r#"
            parent_dataset = "tank/backups"
            listen_address = "127.0.0.1:8989"
        "#;
        let config = Config::try_from(toml).unwrap();
        assert_eq!(config.parent_dataset, "tank/backups");
        assert_eq!(config.send_routines, 3);
        assert!(config.enable_snapshot_create);
    }

    #[test]
    fn rejects_zero_send_routines() {
        let toml = r#"
            parent_dataset = "tank/backups"
            send_routines = 0
        "#;
        assert!(Config::try_from(toml).is_err());
    }

    #[test]
    fn loads_config_written_to_disk() {
        use std::io::Write;

        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
            parent_dataset = "tank/backups"
            listen_address = "127.0.0.1:8989"
            maximum_send_time = "6h"
            "#
        )
        .unwrap();

        let contents = std::fs::read_to_string(file.path()).unwrap();
        let config = Config::try_from(contents.as_str()).unwrap();
        assert_eq!(config.maximum_send_time, Duration::from_secs(6 * 60 * 60));
    }
}
