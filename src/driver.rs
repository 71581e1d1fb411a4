//! Device driver boundary
//!
//! The crate never talks to USB directly. Everything it needs from an
//! RTL2832U dongle goes through the two traits below: [`RtlDriver`] for
//! enumeration and opening, [`RtlDevice`] for an opened handle. Both are
//! synchronous; each call either succeeds or returns an [`Error`](crate::Error).
//!
//! An opened device is shared between the control surface and the
//! acquisition thread (which sits inside [`RtlDevice::read_async`]), so all
//! methods take `&self` and implementations provide their own interior
//! synchronization. Dropping the last reference releases the device.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// USB vendor/product IDs of known RTL2832U based dongles.
///
/// Used for enumeration filtering and for probing on platforms that do
/// not provide a device list.
pub const RTL_SDR_USB_IDS: &[(u16, u16)] = &[
    (0x0bda, 0x2832), // Generic RTL2832U
    (0x0bda, 0x2838), // Generic RTL2832U OEM
    (0x0413, 0x6680), // DigitalNow Quad DVB-T PCI-E card
    (0x0413, 0x6f0f), // Leadtek WinFast DTV Dongle mini D
    (0x0458, 0x707f), // Genius TVGo DVB-T03 USB dongle (Ver. B)
    (0x0ccd, 0x00a9), // Terratec Cinergy T Stick Black (rev 1)
    (0x0ccd, 0x00b3), // Terratec NOXON DAB/DAB+ USB dongle (rev 1)
    (0x0ccd, 0x00d3), // Terratec Cinergy T Stick RC (Rev.3)
    (0x0ccd, 0x00e0), // Terratec NOXON DAB/DAB+ USB dongle (rev 2)
    (0x185b, 0x0620), // Compro Videomate U620F
    (0x1b80, 0xd393), // GIGABYTE GT-U7300
    (0x1b80, 0xd3a4), // Twintech UT-40
    (0x1d19, 0x1101), // Dexatek DK DVB-T Dongle (Logilink VG0002A)
    (0x1d19, 0x1102), // Dexatek DK DVB-T Dongle (MSI DigiVox mini II V3.0)
    (0x1f4d, 0xb803), // GTek T803
    (0x1f4d, 0xc803), // Lifeview LV5TDeluxe
    (0x1f4d, 0xd286), // MyGica TD312
    (0x1f4d, 0xd803), // PROlectrix DV107669
];

/// Gain steps of the R820T/R828D tuners in tenths of dB, ascending
pub const R820T_GAINS: [i32; 29] = [
    0, 9, 14, 27, 37, 77, 87, 125, 144, 157, 166, 197, 207, 229, 254, 280, 297, 328, 338, 364,
    372, 386, 402, 421, 434, 439, 445, 480, 496,
];

/// Direct sampling mode of the RTL2832U ADC
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DirectSampling {
    /// Normal operation through the tuner
    #[default]
    Disabled,
    /// RF fed into the I branch ADC
    IBranch,
    /// RF fed into the Q branch ADC
    QBranch,
}

impl DirectSampling {
    /// Numeric mode as used by librtlsdr (0, 1, 2)
    pub fn code(self) -> i32 {
        match self {
            DirectSampling::Disabled => 0,
            DirectSampling::IBranch => 1,
            DirectSampling::QBranch => 2,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(DirectSampling::Disabled),
            1 => Some(DirectSampling::IBranch),
            2 => Some(DirectSampling::QBranch),
            _ => None,
        }
    }
}

/// Tuner gain mode register value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunerGainMode {
    /// Tuner hardware AGC (mode 0)
    HardwareAgc,
    /// Gain set from the gain table (mode 1)
    Manual,
    /// Software AGC in the driver (mode 2)
    SoftwareAgc,
}

impl TunerGainMode {
    pub fn code(self) -> i32 {
        match self {
            TunerGainMode::HardwareAgc => 0,
            TunerGainMode::Manual => 1,
            TunerGainMode::SoftwareAgc => 2,
        }
    }
}

/// Tuner chip found behind the RTL2832U
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TunerType {
    #[default]
    Unknown,
    E4000,
    Fc0012,
    Fc0013,
    Fc2580,
    R820T,
    R828D,
}

impl TunerType {
    /// R820T/R828D tuners expose the LNA/mixer registers used by the
    /// Basic/Manual/AGC control modes.
    pub fn has_r82xx_registers(self) -> bool {
        matches!(self, TunerType::R820T | TunerType::R828D)
    }
}

/// Callback invoked by [`RtlDevice::read_async`] once per completed
/// transfer with the raw interleaved unsigned 8-bit I/Q bytes.
pub type ReadCallback<'a> = dyn FnMut(&[u8]) + Send + 'a;

/// Enumeration and open side of a driver
pub trait RtlDriver: Send + Sync {
    /// Number of attached devices. Zero on probe-only platforms.
    fn device_count(&self) -> usize;

    /// Product name of the device at `index`
    fn device_name(&self, index: usize) -> String;

    /// USB serial string of the device at `index`, if readable
    fn device_serial(&self, index: usize) -> Option<String>;

    /// Whether [`device_count`](Self::device_count) reflects the attached
    /// hardware. Platforms without a device list return false and are
    /// probed with [`probe`](Self::probe) instead.
    fn supports_enumeration(&self) -> bool {
        true
    }

    /// Look for any device with one of the given (VID, PID) pairs
    fn probe(&self, _ids: &[(u16, u16)]) -> Option<(u16, u16)> {
        None
    }

    /// Open the device at `index` for exclusive use.
    ///
    /// Fails with [`Error::DeviceNotFound`](crate::Error::DeviceNotFound) or
    /// [`Error::DeviceBusy`](crate::Error::DeviceBusy).
    fn open(&self, index: usize) -> Result<Arc<dyn RtlDevice>>;
}

/// An opened RTL-SDR device
pub trait RtlDevice: Send + Sync {
    fn tuner_type(&self) -> TunerType;

    /// Supported tuner gains in tenths of dB, in driver order
    fn tuner_gains(&self) -> Result<Vec<i32>>;

    fn set_sample_rate(&self, rate: u32) -> Result<()>;

    fn set_center_freq(&self, freq: u32) -> Result<()>;

    /// Frequency the hardware is actually tuned to
    fn center_freq(&self) -> u32;

    fn set_freq_correction(&self, ppm: i32) -> Result<()>;

    /// Tuner IF bandwidth in Hz, 0 for automatic
    fn set_tuner_bandwidth(&self, bandwidth: u32) -> Result<()>;

    fn set_direct_sampling(&self, mode: DirectSampling) -> Result<()>;

    fn set_bias_tee(&self, on: bool) -> Result<()>;

    /// RTL2832U digital AGC
    fn set_agc_mode(&self, on: bool) -> Result<()>;

    fn set_offset_tuning(&self, on: bool) -> Result<()>;

    fn set_tuner_gain_mode(&self, mode: TunerGainMode) -> Result<()>;

    /// Tuner gain in tenths of dB, one of [`tuner_gains`](Self::tuner_gains)
    fn set_tuner_gain(&self, gain: i32) -> Result<()>;

    /// VGA gain index (0..=15)
    fn set_tuner_gain_index(&self, index: u8) -> Result<()>;

    /// Read-modify-write of a tuner I2C register: bits in `mask` take `value`
    fn write_tuner_register(&self, address: u8, mask: u8, value: u8) -> Result<()>;

    fn read_tuner_register(&self, address: u8) -> Result<u8>;

    /// Clear the device's internal sample FIFO
    fn reset_buffer(&self) -> Result<()>;

    /// Stream transfers of `buf_len` bytes into `callback` until
    /// [`cancel_async`](Self::cancel_async) is called. Blocks the caller for
    /// the whole acquisition. Returns an error without invoking the callback
    /// if the read cannot be registered.
    fn read_async(&self, callback: &mut ReadCallback<'_>, buf_len: u32) -> Result<()>;

    /// Make a running [`read_async`](Self::read_async) return. A cancel
    /// issued while no read runs must not end the next one.
    fn cancel_async(&self) -> Result<()>;
}
