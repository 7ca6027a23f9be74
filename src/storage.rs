// Configuration history storage
//
// Small JSON key/value file remembering what the user entered last: recent
// server endpoints, recent WiFi networks, the radar name filter and the
// selected filter type. Writes are atomic (temp file, then rename).

use crate::filter::FilterType;
use crate::models::{ServerProtocol, DEFAULT_SERVER_PORT, DEFAULT_SERVER_PROTOCOL};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use thiserror::Error;

/// Entries kept per history list.
pub const MAX_HISTORY: usize = 5;

const KEY_SERVER_CONFIGS: &str = "server_configs";
const KEY_WIFI_CONFIGS: &str = "wifi_configs";
const KEY_RADAR_DEVICE_NAME: &str = "radar_device_name";
const KEY_FILTER_TYPE: &str = "filter_type";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Failed to access storage file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Corrupt storage file {path}: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("Failed to encode storage: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("Storage lock poisoned")]
    Poisoned,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfigEntry {
    pub address: String,
    pub port: u16,
    pub protocol: ServerProtocol,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WifiConfigEntry {
    pub ssid: String,
    #[serde(default)]
    pub password: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreData {
    #[serde(flatten)]
    entries: HashMap<String, serde_json::Value>,
}

pub struct ConfigStorage {
    path: PathBuf,
    data: RwLock<StoreData>,
}

impl ConfigStorage {
    /// `<config dir>/wisefido-ble/storage.json`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("wisefido-ble").join("storage.json"))
    }

    /// Open the store at `path`, creating its directory. A missing file is
    /// an empty store.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let path = path.into();
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).map_err(|source| StorageError::Io {
                path: dir.to_path_buf(),
                source,
            })?;
        }
        let data = load_from_disk(&path)?;
        Ok(Self {
            path,
            data: RwLock::new(data),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    // ---- server history -----------------------------------------------------

    /// Remember a server endpoint. Blank addresses are ignored; a zero port
    /// or missing protocol falls back to the defaults.
    pub fn save_server_config(
        &self,
        address: &str,
        port: u16,
        protocol: Option<ServerProtocol>,
    ) -> Result<(), StorageError> {
        let address = address.trim();
        if address.is_empty() {
            return Ok(());
        }
        let entry = ServerConfigEntry {
            address: address.to_string(),
            port: if port == 0 { DEFAULT_SERVER_PORT } else { port },
            protocol: protocol.unwrap_or(DEFAULT_SERVER_PROTOCOL),
        };
        let mut history = self.server_configs();
        push_recent(&mut history, entry, |a, b| a == b);
        self.set(KEY_SERVER_CONFIGS, serde_json::to_value(&history)?)
    }

    /// Most recent first.
    pub fn server_configs(&self) -> Vec<ServerConfigEntry> {
        self.get_as(KEY_SERVER_CONFIGS).unwrap_or_default()
    }

    // ---- WiFi history -------------------------------------------------------

    /// Remember a WiFi network. Saving an SSID again replaces its password.
    pub fn save_wifi_config(&self, ssid: &str, password: Option<&str>) -> Result<(), StorageError> {
        if ssid.trim().is_empty() {
            return Ok(());
        }
        let entry = WifiConfigEntry {
            ssid: ssid.to_string(),
            password: password.filter(|p| !p.is_empty()).map(str::to_string),
        };
        let mut history = self.wifi_configs();
        push_recent(&mut history, entry, |a, b| a.ssid == b.ssid);
        self.set(KEY_WIFI_CONFIGS, serde_json::to_value(&history)?)
    }

    pub fn wifi_configs(&self) -> Vec<WifiConfigEntry> {
        self.get_as(KEY_WIFI_CONFIGS).unwrap_or_default()
    }

    // ---- scan preferences ---------------------------------------------------

    pub fn save_radar_device_name(&self, name: &str) -> Result<(), StorageError> {
        let name = name.trim();
        if name.is_empty() {
            return self.delete(KEY_RADAR_DEVICE_NAME);
        }
        self.set(KEY_RADAR_DEVICE_NAME, serde_json::Value::String(name.to_string()))
    }

    pub fn radar_device_name(&self) -> String {
        self.get_as(KEY_RADAR_DEVICE_NAME)
            .unwrap_or_else(crate::config::default_radar_name_filter)
    }

    pub fn save_filter_type(&self, filter_type: FilterType) -> Result<(), StorageError> {
        self.set(KEY_FILTER_TYPE, serde_json::to_value(filter_type)?)
    }

    pub fn filter_type(&self) -> FilterType {
        self.get_as(KEY_FILTER_TYPE).unwrap_or_default()
    }

    // ---- key/value ----------------------------------------------------------

    fn get_as<T: for<'de> Deserialize<'de>>(&self, key: &str) -> Option<T> {
        let value = self.data.read().ok()?.entries.get(key).cloned()?;
        match serde_json::from_value(value) {
            Ok(v) => Some(v),
            Err(e) => {
                tlog!("[storage] Ignoring unreadable value for {key}: {e}");
                None
            }
        }
    }

    fn set(&self, key: &str, value: serde_json::Value) -> Result<(), StorageError> {
        let json = {
            let mut data = self.data.write().map_err(|_| StorageError::Poisoned)?;
            data.entries.insert(key.to_string(), value);
            serde_json::to_string_pretty(&*data)?
        };
        self.write_atomic(&json)
    }

    fn delete(&self, key: &str) -> Result<(), StorageError> {
        let json = {
            let mut data = self.data.write().map_err(|_| StorageError::Poisoned)?;
            if data.entries.remove(key).is_none() {
                return Ok(());
            }
            serde_json::to_string_pretty(&*data)?
        };
        self.write_atomic(&json)
    }

    fn write_atomic(&self, json: &str) -> Result<(), StorageError> {
        let temp_path = self.path.with_extension("json.tmp");
        let io_err = |source| StorageError::Io {
            path: self.path.clone(),
            source,
        };
        fs::write(&temp_path, json).map_err(io_err)?;
        fs::rename(&temp_path, &self.path).map_err(io_err)?;
        Ok(())
    }
}

fn load_from_disk(path: &Path) -> Result<StoreData, StorageError> {
    if !path.exists() {
        return Ok(StoreData::default());
    }
    let content = fs::read_to_string(path).map_err(|source| StorageError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&content).map_err(|source| StorageError::Corrupt {
        path: path.to_path_buf(),
        source,
    })
}

/// Insert at the front, drop any older duplicate, cap the length.
fn push_recent<T>(history: &mut Vec<T>, entry: T, same: impl Fn(&T, &T) -> bool) {
    history.retain(|e| !same(e, &entry));
    history.insert(0, entry);
    history.truncate(MAX_HISTORY);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_store(name: &str) -> (PathBuf, ConfigStorage) {
        let dir = std::env::temp_dir().join(format!("wisefido-storage-{}-{name}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        let path = dir.join("storage.json");
        let store = ConfigStorage::open(&path).unwrap();
        (dir, store)
    }

    #[test]
    fn test_defaults_when_empty() {
        let (dir, store) = temp_store("defaults");
        assert!(store.server_configs().is_empty());
        assert!(store.wifi_configs().is_empty());
        assert_eq!(store.radar_device_name(), "TSBLU");
        assert_eq!(store.filter_type(), FilterType::DeviceName);
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn test_server_history_dedup_and_cap() {
        let (dir, store) = temp_store("server");
        for i in 0..7u16 {
            store.save_server_config("10.0.0.1", 9000 + i, Some(ServerProtocol::Udp)).unwrap();
        }
        store.save_server_config("10.0.0.1", 9003, Some(ServerProtocol::Udp)).unwrap();
        let history = store.server_configs();
        assert_eq!(history.len(), MAX_HISTORY);
        assert_eq!(history[0].port, 9003);
        assert_eq!(history.iter().filter(|e| e.port == 9003).count(), 1);

        store.save_server_config("host", 0, None).unwrap();
        let latest = &store.server_configs()[0];
        assert_eq!(latest.port, DEFAULT_SERVER_PORT);
        assert_eq!(latest.protocol, ServerProtocol::Tcp);
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn test_wifi_history_replaces_password() {
        let (dir, store) = temp_store("wifi");
        store.save_wifi_config("Home", Some("old")).unwrap();
        store.save_wifi_config("Office", None).unwrap();
        store.save_wifi_config("Home", Some("new")).unwrap();
        store.save_wifi_config("  ", Some("ignored")).unwrap();

        let history = store.wifi_configs();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].ssid, "Home");
        assert_eq!(history[0].password.as_deref(), Some("new"));
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn test_survives_reopen() {
        let (dir, store) = temp_store("reopen");
        store.save_radar_device_name("RX").unwrap();
        store.save_filter_type(FilterType::Mac).unwrap();
        let path = store.path().to_path_buf();
        drop(store);

        let reopened = ConfigStorage::open(&path).unwrap();
        assert_eq!(reopened.radar_device_name(), "RX");
        assert_eq!(reopened.filter_type(), FilterType::Mac);

        reopened.save_radar_device_name("").unwrap();
        assert_eq!(reopened.radar_device_name(), "TSBLU");
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn test_corrupt_file_is_reported() {
        let (dir, store) = temp_store("corrupt");
        let path = store.path().to_path_buf();
        fs::write(&path, "{not json").unwrap();
        assert!(matches!(ConfigStorage::open(&path), Err(StorageError::Corrupt { .. })));
        let _ = fs::remove_dir_all(dir);
    }
}
