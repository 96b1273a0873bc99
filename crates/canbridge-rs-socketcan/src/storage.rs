//! File-backed persistence: the device registry (`devices.json`), the
//! per-device schema cache and the gateway settings.

use canbridge_rs::{ConfigStorage, DeviceRecord, GatewayError, GatewaySettings, RegistryStorage};
use log::{debug, info};
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Registry store rooted in one directory: `devices.json` plus one
/// `<serial_word3:x>.json` schema document per device.
pub struct FileRegistryStorage {
    root: PathBuf,
}

impl FileRegistryStorage {
    pub fn new(root: impl AsRef<Path>) -> Self {
        FileRegistryStorage {
            root: root.as_ref().to_path_buf(),
        }
    }

    fn devices_path(&self) -> PathBuf {
        self.root.join("devices.json")
    }

    fn schema_path(&self, key: u32) -> PathBuf {
        self.root.join(format!("{:x}.json", key))
    }
}

impl RegistryStorage for FileRegistryStorage {
    fn load(&mut self) -> Result<BTreeMap<String, DeviceRecord>, GatewayError> {
        let path = self.devices_path();
        if !path.exists() {
            debug!("no device registry at {:?}, starting empty", path);
            return Ok(BTreeMap::new());
        }
        let text =
            fs::read_to_string(&path).map_err(|_| GatewayError::Storage("registry unreadable"))?;
        let value: Value = serde_json::from_str(&text)
            .map_err(|_| GatewayError::Storage("registry is not valid JSON"))?;
        let devices = value
            .get("devices")
            .cloned()
            .ok_or(GatewayError::Storage("registry has no devices key"))?;
        serde_json::from_value(devices)
            .map_err(|_| GatewayError::Storage("registry rows malformed"))
    }

    fn save(&mut self, devices: &BTreeMap<String, DeviceRecord>) -> Result<(), GatewayError> {
        let document = json!({ "devices": devices });
        fs::write(self.devices_path(), document.to_string())
            .map_err(|_| GatewayError::Storage("registry not written"))
    }

    fn load_schema(&mut self, key: u32) -> Result<Option<Vec<u8>>, GatewayError> {
        match fs::read(self.schema_path(key)) {
            Ok(document) => Ok(Some(document)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(_) => Err(GatewayError::Storage("schema cache unreadable")),
        }
    }

    fn store_schema(&mut self, key: u32, document: &[u8]) -> Result<(), GatewayError> {
        fs::write(self.schema_path(key), document)
            .map_err(|_| GatewayError::Storage("schema cache not written"))
    }
}

/// Settings store, one JSON file.
pub struct FileConfigStorage {
    path: PathBuf,
}

impl FileConfigStorage {
    pub fn new(path: impl AsRef<Path>) -> Self {
        FileConfigStorage {
            path: path.as_ref().to_path_buf(),
        }
    }
}

impl ConfigStorage for FileConfigStorage {
    fn load(&mut self) -> Result<GatewaySettings, GatewayError> {
        if !self.path.exists() {
            info!("no settings at {:?}, using defaults", self.path);
            return Ok(GatewaySettings::default());
        }
        let text = fs::read_to_string(&self.path)
            .map_err(|_| GatewayError::Storage("settings unreadable"))?;
        let settings: GatewaySettings = serde_json::from_str(&text)
            .map_err(|_| GatewayError::Storage("settings malformed"))?;
        Ok(settings.normalized())
    }

    fn save(&mut self, settings: &GatewaySettings) -> Result<(), GatewayError> {
        let text = serde_json::to_string_pretty(settings)
            .map_err(|_| GatewayError::Storage("settings not serializable"))?;
        fs::write(&self.path, text).map_err(|_| GatewayError::Storage("settings not written"))
    }
}
