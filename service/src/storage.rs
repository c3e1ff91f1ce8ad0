//! Persistent adapter and bond records.
//!
//! Everything is stored as pretty JSON files under the configured storage
//! directory and read back synchronously on the service loop. Binary keys
//! are hex-encoded strings in the files.

use std::fs::{create_dir_all, File};
use std::io::{Read, Result, Write};
use std::path::PathBuf;

use log::{info, warn};
use serde_json::{json, Value};

use bt_sal::adapter::{RemoteDeviceProperties, RemoteLeDeviceProperties};
use bt_sal::types::{BleAddrType, BtIoCapability, BtScanMode, RawAddress};
use num_traits::cast::{FromPrimitive, ToPrimitive};

const ADAPTER_INFO_FILE: &str = "adapter_info.json";
const BONDED_DEVICE_FILE: &str = "bonded_devices.json";
const LE_BONDED_DEVICE_FILE: &str = "le_bonded_devices.json";
const WHITELIST_FILE: &str = "whitelist.json";

#[derive(Debug, Clone)]
pub struct AdapterStorage {
    pub name: String,
    pub class_of_device: u32,
    pub io_capability: BtIoCapability,
    pub scan_mode: BtScanMode,
    pub bondable: bool,
}

impl Default for AdapterStorage {
    fn default() -> Self {
        AdapterStorage {
            name: String::from("bluetooth"),
            class_of_device: 0,
            io_capability: BtIoCapability::DisplayYesNo,
            scan_mode: BtScanMode::None,
            bondable: true,
        }
    }
}

pub struct Storage {
    dir: PathBuf,
}

fn hex_encode(data: &[u8]) -> String {
    data.iter().map(|b| format!("{:02x}", b)).collect()
}

fn hex_decode<const N: usize>(raw: &str) -> Option<[u8; N]> {
    if raw.len() != N * 2 {
        return None;
    }
    let mut out = [0u8; N];
    for i in 0..N {
        out[i] = u8::from_str_radix(&raw[i * 2..i * 2 + 2], 16).ok()?;
    }
    Some(out)
}

impl Storage {
    pub fn new<P: Into<PathBuf>>(dir: P) -> Self {
        Storage { dir: dir.into() }
    }

    fn read_json(&self, file: &str) -> Option<Value> {
        let mut contents = String::new();
        File::open(self.dir.join(file)).ok()?.read_to_string(&mut contents).ok()?;
        serde_json::from_str::<Value>(contents.as_str()).ok()
    }

    fn write_json(&self, file: &str, value: &Value) -> Result<()> {
        create_dir_all(&self.dir)?;
        let mut f = File::create(self.dir.join(file))?;
        f.write_all(serde_json::to_string_pretty(value).unwrap_or_default().as_bytes())
    }

    pub fn load_adapter_info(&self) -> AdapterStorage {
        let defaults = AdapterStorage::default();
        let json = match self.read_json(ADAPTER_INFO_FILE) {
            Some(v) => v,
            None => {
                info!("Storage: no adapter info, using defaults");
                return defaults;
            }
        };

        AdapterStorage {
            name: json
                .get("name")
                .and_then(|v| v.as_str())
                .map(String::from)
                .unwrap_or(defaults.name),
            class_of_device: json
                .get("class_of_device")
                .and_then(|v| v.as_u64())
                .map(|v| v as u32)
                .unwrap_or(defaults.class_of_device),
            io_capability: json
                .get("io_capability")
                .and_then(|v| v.as_u64())
                .and_then(BtIoCapability::from_u64)
                .unwrap_or(defaults.io_capability),
            scan_mode: json
                .get("scan_mode")
                .and_then(|v| v.as_u64())
                .and_then(BtScanMode::from_u64)
                .unwrap_or(defaults.scan_mode),
            bondable: json.get("bondable").and_then(|v| v.as_bool()).unwrap_or(defaults.bondable),
        }
    }

    pub fn save_adapter_info(&self, info: &AdapterStorage) {
        let value = json!({
            "name": info.name,
            "class_of_device": info.class_of_device,
            "io_capability": info.io_capability.to_u64(),
            "scan_mode": info.scan_mode.to_u64(),
            "bondable": info.bondable,
        });
        if let Err(e) = self.write_json(ADAPTER_INFO_FILE, &value) {
            warn!("Storage: failed to write adapter info: {}", e);
        }
    }

    pub fn load_bonded_devices(&self) -> Vec<RemoteDeviceProperties> {
        let json = match self.read_json(BONDED_DEVICE_FILE) {
            Some(v) => v,
            None => return Vec::new(),
        };

        json.as_array()
            .map(|entries| entries.iter().filter_map(parse_bonded_device).collect())
            .unwrap_or_default()
    }

    pub fn save_bonded_devices(&self, devices: &[RemoteDeviceProperties]) {
        let value = Value::Array(
            devices
                .iter()
                .map(|d| {
                    json!({
                        "addr": d.addr.to_string(),
                        "name": d.name,
                        "alias": d.alias,
                        "class_of_device": d.class_of_device,
                        "device_type": d.device_type,
                        "link_key": hex_encode(&d.link_key),
                        "link_key_type": d.link_key_type,
                    })
                })
                .collect(),
        );
        if let Err(e) = self.write_json(BONDED_DEVICE_FILE, &value) {
            warn!("Storage: failed to write bonded devices: {}", e);
        }
    }

    pub fn load_le_bonded_devices(&self) -> Vec<RemoteLeDeviceProperties> {
        self.load_le_devices(LE_BONDED_DEVICE_FILE)
    }

    pub fn save_le_bonded_devices(&self, devices: &[RemoteLeDeviceProperties]) {
        self.save_le_devices(LE_BONDED_DEVICE_FILE, devices)
    }

    pub fn load_whitelist(&self) -> Vec<RemoteLeDeviceProperties> {
        self.load_le_devices(WHITELIST_FILE)
    }

    pub fn save_whitelist(&self, devices: &[RemoteLeDeviceProperties]) {
        self.save_le_devices(WHITELIST_FILE, devices)
    }

    fn load_le_devices(&self, file: &str) -> Vec<RemoteLeDeviceProperties> {
        let json = match self.read_json(file) {
            Some(v) => v,
            None => return Vec::new(),
        };

        json.as_array()
            .map(|entries| entries.iter().filter_map(parse_le_device).collect())
            .unwrap_or_default()
    }

    fn save_le_devices(&self, file: &str, devices: &[RemoteLeDeviceProperties]) {
        let value = Value::Array(
            devices
                .iter()
                .map(|d| {
                    json!({
                        "addr": d.addr.to_string(),
                        "addr_type": d.addr_type.to_u64(),
                        "smp_key": hex_encode(&d.smp_key),
                    })
                })
                .collect(),
        );
        if let Err(e) = self.write_json(file, &value) {
            warn!("Storage: failed to write {}: {}", file, e);
        }
    }
}

fn parse_bonded_device(value: &Value) -> Option<RemoteDeviceProperties> {
    Some(RemoteDeviceProperties {
        addr: RawAddress::from_string(value.get("addr")?.as_str()?)?,
        name: value.get("name")?.as_str()?.into(),
        alias: value.get("alias").and_then(|v| v.as_str()).unwrap_or_default().into(),
        class_of_device: value.get("class_of_device")?.as_u64()? as u32,
        device_type: value.get("device_type")?.as_u64()? as u32,
        link_key: hex_decode(value.get("link_key")?.as_str()?)?,
        link_key_type: value.get("link_key_type")?.as_u64()? as u32,
    })
}

fn parse_le_device(value: &Value) -> Option<RemoteLeDeviceProperties> {
    Some(RemoteLeDeviceProperties {
        addr: RawAddress::from_string(value.get("addr")?.as_str()?)?,
        addr_type: value
            .get("addr_type")
            .and_then(|v| v.as_u64())
            .and_then(BleAddrType::from_u64)
            .unwrap_or(BleAddrType::Public),
        smp_key: hex_decode(value.get("smp_key")?.as_str()?)?,
    })
}
