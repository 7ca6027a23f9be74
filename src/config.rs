// Provisioner configuration
//
// Timeouts and file locations, read from a TOML file. Every field has a
// default so a missing or partial file still yields a working config.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("Invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ProvisionerConfig {
    #[serde(default = "default_scan_timeout_secs")]
    pub scan_timeout_secs: u64,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_negotiate_timeout_secs")]
    pub negotiate_timeout_secs: u64,
    #[serde(default = "default_ack_timeout_secs")]
    pub ack_timeout_secs: u64,
    #[serde(default = "default_query_timeout_secs")]
    pub query_timeout_secs: u64,
    #[serde(default = "default_query_retries")]
    pub query_retries: u8,
    /// Name prefix used by the CLI when scanning for radars without an
    /// explicit filter.
    #[serde(default = "default_radar_name_filter")]
    pub radar_name_filter: String,
    #[serde(default)]
    pub storage_path: Option<PathBuf>,
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
}

fn default_scan_timeout_secs() -> u64 {
    10
}
fn default_connect_timeout_secs() -> u64 {
    15
}
fn default_negotiate_timeout_secs() -> u64 {
    10
}
fn default_ack_timeout_secs() -> u64 {
    10
}
fn default_query_timeout_secs() -> u64 {
    5
}
fn default_query_retries() -> u8 {
    1
}
pub(crate) fn default_radar_name_filter() -> String {
    "TSBLU".to_string()
}

impl Default for ProvisionerConfig {
    fn default() -> Self {
        Self {
            scan_timeout_secs: default_scan_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            negotiate_timeout_secs: default_negotiate_timeout_secs(),
            ack_timeout_secs: default_ack_timeout_secs(),
            query_timeout_secs: default_query_timeout_secs(),
            query_retries: default_query_retries(),
            radar_name_filter: default_radar_name_filter(),
            storage_path: None,
            log_dir: None,
        }
    }
}

/// Resolved timeouts handed to each adapter.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Timeouts {
    pub scan: Duration,
    pub connect: Duration,
    pub negotiate: Duration,
    pub ack: Duration,
    pub query: Duration,
    pub query_retries: u8,
}

impl Default for Timeouts {
    fn default() -> Self {
        ProvisionerConfig::default().timeouts()
    }
}

impl ProvisionerConfig {
    /// `<config dir>/wisefido-ble/config.toml`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("wisefido-ble").join("config.toml"))
    }

    pub fn from_toml_str(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Load from `path`. A missing file gives the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        tlog!("[config] Loaded {}", path.display());
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let zero = [
            ("scan_timeout_secs", self.scan_timeout_secs),
            ("connect_timeout_secs", self.connect_timeout_secs),
            ("negotiate_timeout_secs", self.negotiate_timeout_secs),
            ("ack_timeout_secs", self.ack_timeout_secs),
            ("query_timeout_secs", self.query_timeout_secs),
        ]
        .into_iter()
        .find(|(_, v)| *v == 0);
        if let Some((name, _)) = zero {
            return Err(ConfigError::Invalid(format!("{name} must be greater than zero")));
        }
        Ok(())
    }

    pub fn timeouts(&self) -> Timeouts {
        Timeouts {
            scan: Duration::from_secs(self.scan_timeout_secs),
            connect: Duration::from_secs(self.connect_timeout_secs),
            negotiate: Duration::from_secs(self.negotiate_timeout_secs),
            ack: Duration::from_secs(self.ack_timeout_secs),
            query: Duration::from_secs(self.query_timeout_secs),
            query_retries: self.query_retries,
        }
    }

    /// Storage file location: the configured path, else the platform default.
    pub fn resolved_storage_path(&self) -> Option<PathBuf> {
        self.storage_path
            .clone()
            .or_else(crate::storage::ConfigStorage::default_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let t = Timeouts::default();
        assert_eq!(t.scan, Duration::from_secs(10));
        assert_eq!(t.connect, Duration::from_secs(15));
        assert_eq!(t.query, Duration::from_secs(5));
        assert_eq!(t.query_retries, 1);
        assert_eq!(ProvisionerConfig::default().radar_name_filter, "TSBLU");
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = ProvisionerConfig::from_toml_str("ack_timeout_secs = 3\nquery_retries = 0\n").unwrap();
        assert_eq!(config.ack_timeout_secs, 3);
        assert_eq!(config.query_retries, 0);
        assert_eq!(config.connect_timeout_secs, 15);
        assert!(config.storage_path.is_none());
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let config = ProvisionerConfig::from_toml_str("scan_timeout_secs = 0").unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_load_missing_and_bad_files() {
        let dir = std::env::temp_dir().join(format!("wisefido-config-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();

        let missing = dir.join("missing.toml");
        assert_eq!(ProvisionerConfig::load(&missing).unwrap(), ProvisionerConfig::default());

        let bad = dir.join("bad.toml");
        std::fs::write(&bad, "scan_timeout_secs = \"soon\"").unwrap();
        assert!(matches!(ProvisionerConfig::load(&bad), Err(ConfigError::Parse { .. })));

        let _ = std::fs::remove_dir_all(&dir);
    }
}
