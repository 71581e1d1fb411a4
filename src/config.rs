//! Persisted per-device settings
//!
//! The store holds one JSON document:
//!
//! ```json
//! {
//!   "device": "[00000001] Generic RTL2832U #0",
//!   "devices": {
//!     "[00000001] Generic RTL2832U #0": { "sampleRate": 2400000, "gain": 12, ... }
//!   }
//! }
//! ```
//!
//! All access goes through [`ConfigStore::transaction`], a scoped
//! read-modify-write under the store's lock. The document is written back
//! only when the transaction changed it.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::driver::DirectSampling;
use crate::error::{Error, Result};
use crate::session::{AgcClock, AgcMode, ControlMode};

/// Settings remembered for one device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DeviceSettings {
    pub sample_rate: u32,
    pub direct_sampling: DirectSampling,
    pub ppm: i32,
    #[serde(rename = "biasT")]
    pub bias_tee: bool,
    pub offset_tuning: bool,
    pub rtl_agc: bool,
    /// Index into the ascending gain table
    pub gain: usize,
    pub control_mode: ControlMode,
    pub agc_mode: AgcMode,
    pub lna_gain: u8,
    pub mixer_gain: u8,
    pub vga_gain: u8,
    /// R82xx filter steps, absent while the chip default is kept
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter_bw: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lpf_cutoff: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lpnf_cutoff: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hpf_cutoff: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agc_clock: Option<AgcClock>,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            sample_rate: 2_400_000,
            direct_sampling: DirectSampling::Disabled,
            ppm: 0,
            bias_tee: false,
            offset_tuning: false,
            rtl_agc: false,
            gain: 0,
            control_mode: ControlMode::Basic,
            agc_mode: AgcMode::Hardware,
            lna_gain: 0,
            mixer_gain: 0,
            vga_gain: 0,
            filter_bw: None,
            lpf_cutoff: None,
            lpnf_cutoff: None,
            hpf_cutoff: None,
            agc_clock: None,
        }
    }
}

/// The whole persisted document
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    /// Display name of the last selected device
    pub device: String,
    pub devices: BTreeMap<String, DeviceSettings>,
}

/// Shared handle on the persisted configuration
pub struct ConfigStore {
    path: Option<PathBuf>,
    doc: Mutex<SourceConfig>,
}

impl ConfigStore {
    /// Load the document at `path`. A missing file yields the default
    /// document, which is written on the first change.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let doc = match fs::read_to_string(&path) {
            Ok(text) => serde_json::from_str(&text)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No configuration at {}, using defaults", path.display());
                SourceConfig::default()
            }
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path: Some(path),
            doc: Mutex::new(doc),
        })
    }

    /// A store that is never written to disk
    pub fn in_memory() -> Self {
        Self {
            path: None,
            doc: Mutex::new(SourceConfig::default()),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Run `f` on the document under the store lock and save if it changed
    pub fn transaction<R>(&self, f: impl FnOnce(&mut SourceConfig) -> R) -> Result<R> {
        let mut doc = self.lock();
        let before = doc.clone();
        let result = f(&mut doc);
        if *doc != before {
            self.save(&doc)?;
        }
        Ok(result)
    }

    /// Copy of the current document
    pub fn snapshot(&self) -> SourceConfig {
        self.lock().clone()
    }

    /// Settings of `device`, creating the entry with defaults if missing
    pub fn device_settings(&self, device: &str) -> Result<DeviceSettings> {
        self.transaction(|doc| doc.devices.entry(device.to_string()).or_default().clone())
    }

    /// Apply `f` to the stored settings of `device`
    pub fn update_device(&self, device: &str, f: impl FnOnce(&mut DeviceSettings)) -> Result<()> {
        self.transaction(|doc| f(doc.devices.entry(device.to_string()).or_default()))
    }

    fn save(&self, doc: &SourceConfig) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let text = serde_json::to_string_pretty(doc)?;
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir)?;
        }
        fs::write(path, text).map_err(|e| {
            warn!("Failed to save configuration to {}: {}", path.display(), e);
            Error::Config(format!("cannot write {}: {}", path.display(), e))
        })
    }

    fn lock(&self) -> MutexGuard<'_, SourceConfig> {
        self.doc.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_loads_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::load(dir.path().join("rtl_sdr_config.json")).unwrap();
        assert_eq!(store.snapshot(), SourceConfig::default());
    }

    #[test]
    fn unchanged_transaction_does_not_write() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rtl_sdr_config.json");
        let store = ConfigStore::load(&path).unwrap();

        let device = store.transaction(|doc| doc.device.clone()).unwrap();
        assert!(device.is_empty());
        assert!(!path.exists());
    }

    #[test]
    fn changes_round_trip_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("rtl_sdr_config.json");
        let store = ConfigStore::load(&path).unwrap();

        store
            .update_device("dongle", |s| {
                s.sample_rate = 1_024_000;
                s.bias_tee = true;
                s.gain = 7;
            })
            .unwrap();

        let reloaded = ConfigStore::load(&path).unwrap();
        let settings = reloaded.device_settings("dongle").unwrap();
        assert_eq!(settings.sample_rate, 1_024_000);
        assert!(settings.bias_tee);
        assert_eq!(settings.gain, 7);
    }

    #[test]
    fn keys_are_camel_case_and_partial_documents_fill_defaults() {
        let json = r#"{ "devices": { "d": { "sampleRate": 250000, "biasT": true } } }"#;
        let doc: SourceConfig = serde_json::from_str(json).unwrap();
        let settings = &doc.devices["d"];
        assert_eq!(settings.sample_rate, 250_000);
        assert!(settings.bias_tee);
        assert_eq!(settings.ppm, 0);
        assert_eq!(settings.control_mode, ControlMode::Basic);

        let text = serde_json::to_string(&DeviceSettings::default()).unwrap();
        assert!(text.contains("\"offsetTuning\""));
        assert!(text.contains("\"rtlAgc\""));
    }

    #[test]
    fn filter_steps_are_stored_only_when_set() {
        let text = serde_json::to_string(&DeviceSettings::default()).unwrap();
        assert!(!text.contains("lpfCutoff"));
        assert!(!text.contains("agcClock"));

        let json = r#"{ "filterBw": 6, "lpnfCutoff": 2, "agcClock": "20ms" }"#;
        let settings: DeviceSettings = serde_json::from_str(json).unwrap();
        assert_eq!(settings.filter_bw, Some(6));
        assert_eq!(settings.lpnf_cutoff, Some(2));
        assert_eq!(settings.hpf_cutoff, None);
        assert_eq!(settings.agc_clock, Some(AgcClock::Ms20));
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        fs::write(&path, "{ not json").unwrap();
        assert!(matches!(ConfigStore::load(&path), Err(Error::Json(_))));
    }

    #[test]
    fn in_memory_store_never_touches_disk() {
        let store = ConfigStore::in_memory();
        store.update_device("x", |s| s.ppm = 12).unwrap();
        assert_eq!(store.device_settings("x").unwrap().ppm, 12);
        assert!(store.path().is_none());
    }
}
