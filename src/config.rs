use log::{info, warn};
use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use crate::models::{AggregationPolicy, DeviceAddress};

pub const DEFAULT_CONFIG_PATH: &str = "/home/ruuvi/Ruuvitag/ruuvitags.json";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("address {0} is configured more than once")]
    DuplicateAddress(String),
    #[error("invalid value '{value}' for {key}")]
    InvalidSetting { key: String, value: String },
}

#[derive(Debug, Deserialize)]
struct TagFile {
    config: Vec<TagEntry>,
}

#[derive(Debug, Deserialize)]
struct TagEntry {
    mac: String,
    name: String,
}

/// Mapping of configured RuuviTags, normalized address -> logical name.
#[derive(Debug, Clone, Default)]
pub struct SensorConfig {
    pub tags: HashMap<DeviceAddress, String>,
}

impl SensorConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        info!("Loading tag configuration from {}", path.display());

        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_json(&content).map_err(|e| match e {
            ConfigError::Parse { source, .. } => ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            },
            other => other,
        })?;

        if config.tags.is_empty() {
            warn!("No RuuviTag sensors configured in {}", path.display());
        }
        Ok(config)
    }

    pub fn from_json(content: &str) -> Result<Self, ConfigError> {
        let file: TagFile = serde_json::from_str(content).map_err(|source| ConfigError::Parse {
            path: PathBuf::new(),
            source,
        })?;

        let mut tags = HashMap::new();
        for entry in file.config {
            let address = DeviceAddress::new(&entry.mac);
            if tags.insert(address, entry.name).is_some() {
                return Err(ConfigError::DuplicateAddress(entry.mac));
            }
        }
        Ok(SensorConfig { tags })
    }

    pub fn name_of(&self, address: &DeviceAddress) -> Option<&str> {
        self.tags.get(address).map(String::as_str)
    }
}

/// Runtime settings read from the environment (and `.env`).
#[derive(Debug, Clone)]
pub struct Settings {
    pub scan_duration: Duration,
    pub scan_retries: u32,
    pub aggregation: AggregationPolicy,
    pub interface: String,
    pub use_sudo: bool,
    pub batch_dir: PathBuf,
    pub log_dir: PathBuf,
    pub log_retention: usize,
    pub fail_on_emission_error: bool,
    pub sender_path: PathBuf,
    pub agent_config: PathBuf,
    pub hostname: Option<String>,
    pub namespace: String,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            scan_duration: Duration::from_secs(20),
            scan_retries: 2,
            aggregation: AggregationPolicy::Latest,
            interface: "hci0".to_string(),
            use_sudo: true,
            batch_dir: PathBuf::from("/tmp"),
            log_dir: PathBuf::from("/tmp"),
            log_retention: 7,
            fail_on_emission_error: false,
            sender_path: PathBuf::from("/usr/bin/zabbix_sender"),
            agent_config: PathBuf::from("/etc/zabbix/zabbix_agent2.conf"),
            hostname: None,
            namespace: "ruuvitag".to_string(),
        }
    }
}

impl Settings {
    /// Expects `.env` to have been loaded already.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build settings from an arbitrary key lookup; unset keys keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Settings::default();
        let text = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        Ok(Settings {
            scan_duration: Duration::from_secs(parse_or(
                &lookup,
                "RUUVI_SCAN_DURATION_SECS",
                defaults.scan_duration.as_secs(),
            )?),
            scan_retries: parse_or(&lookup, "RUUVI_SCAN_RETRIES", defaults.scan_retries)?,
            aggregation: parse_or(&lookup, "RUUVI_AGGREGATION", defaults.aggregation)?,
            interface: text("RUUVI_BT_INTERFACE").unwrap_or(defaults.interface),
            use_sudo: parse_flag(&lookup, "RUUVI_USE_SUDO", defaults.use_sudo)?,
            batch_dir: text("RUUVI_BATCH_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.batch_dir),
            log_dir: text("RUUVI_LOG_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.log_dir),
            log_retention: parse_or(&lookup, "RUUVI_LOG_RETENTION", defaults.log_retention)?,
            fail_on_emission_error: parse_flag(
                &lookup,
                "RUUVI_FAIL_ON_EMISSION_ERROR",
                defaults.fail_on_emission_error,
            )?,
            sender_path: text("ZABBIX_SENDER")
                .map(PathBuf::from)
                .unwrap_or(defaults.sender_path),
            agent_config: text("ZABBIX_AGENT_CONFIG")
                .map(PathBuf::from)
                .unwrap_or(defaults.agent_config),
            hostname: text("ZABBIX_HOSTNAME"),
            namespace: text("ZABBIX_NAMESPACE").unwrap_or(defaults.namespace),
        })
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(key) {
        Some(value) if !value.trim().is_empty() => {
            value
                .trim()
                .parse()
                .map_err(|_| ConfigError::InvalidSetting {
                    key: key.to_string(),
                    value,
                })
        }
        _ => Ok(default),
    }
}

fn parse_flag<F>(lookup: &F, key: &str, default: bool) -> Result<bool, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(value) => match value.trim().to_ascii_lowercase().as_str() {
            "" => Ok(default),
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::InvalidSetting {
                key: key.to_string(),
                value,
            }),
        },
        None => Ok(default),
    }
}
