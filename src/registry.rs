//! Device registry
//!
//! Enumerates attached dongles through an [`RtlDriver`] and gives each one
//! a display name of the form `"[<serial>] <name> #<index>"`. The list is
//! rebuilt wholesale on every [`refresh`](DeviceRegistry::refresh).

use std::sync::Arc;

use tracing::{debug, info};

use crate::driver::{RTL_SDR_USB_IDS, RtlDriver};

/// Serial shown for devices that do not report one
pub const NO_SERIAL: &str = "No Serial";

/// Name of the descriptor synthesized on platforms without enumeration
pub const PROBED_DEVICE_NAME: &str = "RTL-SDR Dongle USB";

/// One attachable device as of the last refresh
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDescriptor {
    /// Driver index to open
    pub index: usize,
    /// Reported serial, or [`NO_SERIAL`]
    pub serial: String,
    pub display_name: String,
}

pub struct DeviceRegistry {
    driver: Arc<dyn RtlDriver>,
    devices: Vec<DeviceDescriptor>,
}

impl DeviceRegistry {
    pub fn new(driver: Arc<dyn RtlDriver>) -> Self {
        Self {
            driver,
            devices: Vec::new(),
        }
    }

    /// Query the driver for attached devices.
    ///
    /// Without an enumeration API the known USB IDs are probed and at most
    /// one descriptor is synthesized. Zero devices is an empty list.
    pub fn refresh(&mut self) -> &[DeviceDescriptor] {
        self.devices.clear();

        if self.driver.supports_enumeration() {
            for index in 0..self.driver.device_count() {
                let name = self.driver.device_name(index);
                let serial = self
                    .driver
                    .device_serial(index)
                    .filter(|s| !s.is_empty())
                    .unwrap_or_else(|| NO_SERIAL.to_string());
                let display_name = format!("[{serial}] {name} #{index}");
                debug!("Found device {}", display_name);
                self.devices.push(DeviceDescriptor {
                    index,
                    serial,
                    display_name,
                });
            }
        } else if let Some((vid, pid)) = self.driver.probe(RTL_SDR_USB_IDS) {
            debug!("Probed device {:04x}:{:04x}", vid, pid);
            self.devices.push(DeviceDescriptor {
                index: 0,
                serial: NO_SERIAL.to_string(),
                display_name: PROBED_DEVICE_NAME.to_string(),
            });
        }

        info!("Found {} RTL-SDR device(s)", self.devices.len());
        &self.devices
    }

    /// Devices found by the last refresh
    pub fn devices(&self) -> &[DeviceDescriptor] {
        &self.devices
    }

    /// Exact display-name match against the last refresh
    pub fn resolve_by_name(&self, name: &str) -> Option<&DeviceDescriptor> {
        self.devices.iter().find(|d| d.display_name == name)
    }

    pub fn first(&self) -> Option<&DeviceDescriptor> {
        self.devices.first()
    }

    pub fn get(&self, position: usize) -> Option<&DeviceDescriptor> {
        self.devices.get(position)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockDeviceSpec, MockDriver};

    #[test]
    fn display_names_carry_serial_and_index() {
        let driver = MockDriver::new(vec![
            MockDeviceSpec::new("Generic RTL2832U OEM").with_serial("00000001"),
            MockDeviceSpec::new("Generic RTL2832U OEM"),
        ]);
        let mut registry = DeviceRegistry::new(Arc::new(driver));
        let names: Vec<_> = registry
            .refresh()
            .iter()
            .map(|d| d.display_name.clone())
            .collect();
        assert_eq!(
            names,
            [
                "[00000001] Generic RTL2832U OEM #0",
                "[No Serial] Generic RTL2832U OEM #1",
            ]
        );
    }

    #[test]
    fn identical_dongles_stay_distinct() {
        let driver = MockDriver::new(vec![
            MockDeviceSpec::new("dongle").with_serial("1"),
            MockDeviceSpec::new("dongle").with_serial("1"),
        ]);
        let mut registry = DeviceRegistry::new(Arc::new(driver));
        registry.refresh();
        let a = registry.resolve_by_name("[1] dongle #0").unwrap();
        let b = registry.resolve_by_name("[1] dongle #1").unwrap();
        assert_ne!(a.index, b.index);
    }

    #[test]
    fn empty_driver_gives_empty_list() {
        let mut registry = DeviceRegistry::new(Arc::new(MockDriver::empty()));
        assert!(registry.refresh().is_empty());
        assert!(registry.first().is_none());
        assert!(registry.resolve_by_name("anything").is_none());
    }

    #[test]
    fn probe_only_platform_synthesizes_one_descriptor() {
        let driver = MockDriver::probe_only(Some(MockDeviceSpec::new("dongle")));
        let mut registry = DeviceRegistry::new(Arc::new(driver));
        let devices = registry.refresh();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].display_name, PROBED_DEVICE_NAME);

        let mut none = DeviceRegistry::new(Arc::new(MockDriver::probe_only(None)));
        assert!(none.refresh().is_empty());
    }

    #[test]
    fn refresh_rebuilds_the_list() {
        let mut registry = DeviceRegistry::new(Arc::new(MockDriver::new(vec![
            MockDeviceSpec::new("dongle"),
        ])));
        registry.refresh();
        registry.refresh();
        assert_eq!(registry.devices().len(), 1);
    }
}
