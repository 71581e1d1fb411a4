//! Top-level I/Q source
//!
//! [`RtlSdrSource`] ties the registry, the persisted configuration and a
//! [`DeviceSession`] together: selecting a device loads its settings and
//! opens it, `start`/`stop` drive acquisition and samples are read from
//! [`reader`](RtlSdrSource::reader).

use std::sync::Arc;

use num_complex::Complex;
use parking_lot::{Mutex, MutexGuard};
use tracing::{error, info, warn};

use crate::config::ConfigStore;
use crate::driver::RtlDriver;
use crate::error::{Error, Result};
use crate::registry::{DeviceDescriptor, DeviceRegistry};
use crate::session::{DeviceSession, TuneReport};
use crate::stream::{SampleStream, StreamReader};

pub struct RtlSdrSource {
    config: Arc<ConfigStore>,
    registry: Mutex<DeviceRegistry>,
    session: DeviceSession,
}

impl RtlSdrSource {
    pub fn new(driver: Arc<dyn RtlDriver>, config: Arc<ConfigStore>) -> Self {
        Self::with_stream(driver, config, Arc::new(SampleStream::default()))
    }

    pub fn with_stream(
        driver: Arc<dyn RtlDriver>,
        config: Arc<ConfigStore>,
        stream: Arc<SampleStream<Complex<f32>>>,
    ) -> Self {
        Self {
            registry: Mutex::new(DeviceRegistry::new(Arc::clone(&driver))),
            session: DeviceSession::new(driver, Arc::clone(&config), stream),
            config,
        }
    }

    pub fn session(&self) -> &DeviceSession {
        &self.session
    }

    pub fn config(&self) -> &Arc<ConfigStore> {
        &self.config
    }

    /// Re-enumerate attached devices
    pub fn refresh(&self) -> Vec<DeviceDescriptor> {
        self.registry().refresh().to_vec()
    }

    /// Devices found by the last refresh
    pub fn devices(&self) -> Vec<DeviceDescriptor> {
        self.registry().devices().to_vec()
    }

    /// Currently selected device
    pub fn selected(&self) -> Option<DeviceDescriptor> {
        self.session.descriptor()
    }

    /// Select the first device. `Ok(None)` when nothing is attached, in
    /// which case the previous device is released and nothing is selected.
    pub fn select_first(&self) -> Result<Option<DeviceDescriptor>> {
        let first = self.registry().first().cloned();
        match first {
            Some(descriptor) => self.select(&descriptor).map(|()| Some(descriptor)),
            None => {
                self.deselect();
                Ok(None)
            }
        }
    }

    /// Select by display name, falling back to the first device when the
    /// name is unknown
    pub fn select_by_name(&self, name: &str) -> Result<Option<DeviceDescriptor>> {
        let found = self.registry().resolve_by_name(name).cloned();
        match found {
            Some(descriptor) => self.select(&descriptor).map(|()| Some(descriptor)),
            None => {
                if !name.is_empty() {
                    warn!("Device '{}' not found, selecting the first device", name);
                }
                self.select_first()
            }
        }
    }

    /// Select the device remembered in the configuration
    pub fn select_saved(&self) -> Result<Option<DeviceDescriptor>> {
        let name = self.config.snapshot().device;
        self.select_by_name(&name)
    }

    /// Select by position in the last refresh
    pub fn select_by_index(&self, position: usize) -> Result<DeviceDescriptor> {
        let descriptor = self
            .registry()
            .get(position)
            .cloned()
            .ok_or_else(|| Error::DeviceNotFound(format!("device #{position}")))?;
        self.select(&descriptor)?;
        Ok(descriptor)
    }

    /// Load the settings stored for `descriptor`, remember it as the last
    /// selected device and open it
    fn select(&self, descriptor: &DeviceDescriptor) -> Result<()> {
        let name = descriptor.display_name.as_str();
        let settings = self.config.transaction(|doc| {
            doc.device = name.to_string();
            doc.devices.entry(name.to_string()).or_default().clone()
        })?;

        self.session.close();
        self.session.load_settings(name, &settings);
        if let Err(e) = self.session.open(descriptor) {
            error!("Could not select '{}': {}", name, e);
            self.session.deselect();
            return Err(e);
        }
        info!("Selected '{}'", name);
        Ok(())
    }

    fn deselect(&self) {
        self.session.close();
        self.session.deselect();
    }

    /// Start acquisition; returns the transfer size in bytes
    pub fn start(&self) -> Result<u32> {
        self.session.start()
    }

    pub fn stop(&self) {
        self.session.stop();
    }

    pub fn is_running(&self) -> bool {
        self.session.is_running()
    }

    pub fn tune(&self, freq: u32) -> TuneReport {
        self.session.tune(freq)
    }

    /// Consumer handle on the sample stream
    pub fn reader(&self) -> StreamReader<Complex<f32>> {
        self.session.stream().reader()
    }

    fn registry(&self) -> MutexGuard<'_, DeviceRegistry> {
        self.registry.lock()
    }
}
