//! RTL-SDR hardware backend
//! (requires the `rtlsdr` feature)
//!
//! Devices are enumerated with `rusb` against [`RTL_SDR_USB_IDS`] and
//! opened through the `rtl_sdr_rs` crate. `rtl_sdr_rs` only offers
//! synchronous bulk reads, so [`RtlDevice::read_async`] is a `read_sync`
//! loop that checks a cancel flag between transfers.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Mutex, MutexGuard};
use rtl_sdr_rs::{DirectSampleMode, RtlSdr, TunerGain};
use rusb::{Context, UsbContext};
use tracing::{debug, trace};

use crate::driver::{
    DirectSampling, R820T_GAINS, RTL_SDR_USB_IDS, ReadCallback, RtlDevice, RtlDriver,
    TunerGainMode, TunerType,
};
use crate::error::{Error, Result};

/// USB strings of one attached dongle
#[derive(Debug, Clone, PartialEq)]
pub struct UsbDeviceInfo {
    pub vendor_id: u16,
    pub product_id: u16,
    pub manufacturer: String,
    pub product: String,
    pub serial: Option<String>,
}

fn is_known_device(vid: u16, pid: u16) -> bool {
    RTL_SDR_USB_IDS.iter().any(|&(v, p)| v == vid && p == pid)
}

/// List attached RTL2832U dongles in bus order
pub fn enumerate_devices() -> Result<Vec<UsbDeviceInfo>> {
    let context = Context::new()?;
    let mut found = Vec::new();

    for device in context.devices()?.iter() {
        let Ok(desc) = device.device_descriptor() else {
            continue;
        };
        if !is_known_device(desc.vendor_id(), desc.product_id()) {
            continue;
        }

        let mut info = UsbDeviceInfo {
            vendor_id: desc.vendor_id(),
            product_id: desc.product_id(),
            manufacturer: format!("VID:{:04x}", desc.vendor_id()),
            product: format!("PID:{:04x}", desc.product_id()),
            serial: None,
        };

        // strings need an open handle; without permissions keep placeholders
        if let Ok(handle) = device.open() {
            if let Some(s) = desc
                .manufacturer_string_index()
                .and_then(|idx| handle.read_string_descriptor_ascii(idx).ok())
            {
                info.manufacturer = s;
            }
            if let Some(s) = desc
                .product_string_index()
                .and_then(|idx| handle.read_string_descriptor_ascii(idx).ok())
            {
                info.product = s;
            }
            info.serial = desc
                .serial_number_string_index()
                .and_then(|idx| handle.read_string_descriptor_ascii(idx).ok());
        }

        found.push(info);
    }

    Ok(found)
}

/// Driver over the USB bus
#[derive(Default)]
pub struct RtlSdrDriver {
    devices: Mutex<Vec<UsbDeviceInfo>>,
}

impl RtlSdrDriver {
    pub fn new() -> Self {
        Self::default()
    }

    fn devices(&self) -> MutexGuard<'_, Vec<UsbDeviceInfo>> {
        self.devices.lock()
    }
}

impl RtlDriver for RtlSdrDriver {
    fn device_count(&self) -> usize {
        let devices = enumerate_devices().unwrap_or_else(|e| {
            debug!("USB enumeration failed: {}", e);
            Vec::new()
        });
        let count = devices.len();
        *self.devices() = devices;
        count
    }

    fn device_name(&self, index: usize) -> String {
        self.devices()
            .get(index)
            .map(|d| format!("{} {}", d.manufacturer, d.product))
            .unwrap_or_default()
    }

    fn device_serial(&self, index: usize) -> Option<String> {
        self.devices().get(index).and_then(|d| d.serial.clone())
    }

    fn probe(&self, ids: &[(u16, u16)]) -> Option<(u16, u16)> {
        let context = Context::new().ok()?;
        let devices = context.devices().ok()?;
        devices.iter().find_map(|device| {
            let desc = device.device_descriptor().ok()?;
            let id = (desc.vendor_id(), desc.product_id());
            ids.contains(&id).then_some(id)
        })
    }

    fn open(&self, index: usize) -> Result<Arc<dyn RtlDevice>> {
        let rtl = RtlSdr::open_with_index(index).map_err(|e| {
            let message = format!("RTL-SDR #{index}: {e}");
            if index >= self.devices().len() {
                Error::DeviceNotFound(message)
            } else {
                Error::DeviceBusy(message)
            }
        })?;
        debug!("Opened RTL-SDR #{}", index);
        Ok(Arc::new(RtlSdrDevice {
            rtl: Mutex::new(rtl),
            cancel: AtomicBool::new(false),
        }))
    }
}

/// An opened dongle. The USB handle is released when this is dropped.
pub struct RtlSdrDevice {
    rtl: Mutex<RtlSdr>,
    cancel: AtomicBool,
}

impl RtlSdrDevice {
    fn rtl(&self) -> MutexGuard<'_, RtlSdr> {
        self.rtl.lock()
    }
}

impl RtlDevice for RtlSdrDevice {
    fn tuner_type(&self) -> TunerType {
        // rtl_sdr_rs drives R820T/R828D tuners without naming which
        TunerType::Unknown
    }

    fn tuner_gains(&self) -> Result<Vec<i32>> {
        Ok(R820T_GAINS.to_vec())
    }

    fn set_sample_rate(&self, rate: u32) -> Result<()> {
        Ok(self.rtl().set_sample_rate(rate)?)
    }

    fn set_center_freq(&self, freq: u32) -> Result<()> {
        Ok(self.rtl().set_center_freq(freq)?)
    }

    fn center_freq(&self) -> u32 {
        self.rtl().get_center_freq()
    }

    fn set_freq_correction(&self, ppm: i32) -> Result<()> {
        Ok(self.rtl().set_freq_correction(ppm)?)
    }

    fn set_tuner_bandwidth(&self, bandwidth: u32) -> Result<()> {
        Ok(self.rtl().set_tuner_bandwidth(bandwidth)?)
    }

    fn set_direct_sampling(&self, mode: DirectSampling) -> Result<()> {
        let mode = match mode {
            DirectSampling::Disabled => DirectSampleMode::Off,
            DirectSampling::IBranch => DirectSampleMode::On,
            DirectSampling::QBranch => DirectSampleMode::OnSwap,
        };
        Ok(self.rtl().set_direct_sampling(mode)?)
    }

    fn set_bias_tee(&self, on: bool) -> Result<()> {
        Ok(self.rtl().set_bias_tee(on)?)
    }

    fn set_agc_mode(&self, _on: bool) -> Result<()> {
        Err(Error::Unsupported("RTL2832U digital AGC"))
    }

    fn set_offset_tuning(&self, _on: bool) -> Result<()> {
        Err(Error::Unsupported("offset tuning"))
    }

    fn set_tuner_gain_mode(&self, mode: TunerGainMode) -> Result<()> {
        match mode {
            TunerGainMode::HardwareAgc => Ok(self.rtl().set_tuner_gain(TunerGain::Auto)?),
            // takes effect with the next set_tuner_gain
            TunerGainMode::Manual => Ok(()),
            TunerGainMode::SoftwareAgc => Err(Error::Unsupported("software AGC")),
        }
    }

    fn set_tuner_gain(&self, gain: i32) -> Result<()> {
        Ok(self.rtl().set_tuner_gain(TunerGain::Manual(gain))?)
    }

    fn set_tuner_gain_index(&self, _index: u8) -> Result<()> {
        Err(Error::Unsupported("tuner gain index"))
    }

    fn write_tuner_register(&self, _address: u8, _mask: u8, _value: u8) -> Result<()> {
        Err(Error::Unsupported("tuner register write"))
    }

    fn read_tuner_register(&self, _address: u8) -> Result<u8> {
        Err(Error::Unsupported("tuner register read"))
    }

    fn reset_buffer(&self) -> Result<()> {
        Ok(self.rtl().reset_buffer()?)
    }

    fn read_async(&self, callback: &mut ReadCallback<'_>, buf_len: u32) -> Result<()> {
        // a cancel left over from the previous read must not end this one
        self.cancel.store(false, Ordering::SeqCst);
        let mut buf = vec![0u8; buf_len as usize];
        loop {
            if self.cancel.load(Ordering::SeqCst) {
                break Ok(());
            }
            let read = self.rtl().read_sync(&mut buf);
            match read {
                Ok(0) => break Ok(()),
                Ok(n) => {
                    trace!("Bulk read of {} bytes", n);
                    callback(&buf[..n]);
                }
                Err(e) => break Err(e.into()),
            }
        }
    }

    fn cancel_async(&self) -> Result<()> {
        self.cancel.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_ids_include_generic_dongles() {
        assert!(is_known_device(0x0bda, 0x2832));
        assert!(is_known_device(0x0bda, 0x2838));
        assert!(!is_known_device(0x1d50, 0x60a1));
    }
}
