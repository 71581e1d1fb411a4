#![doc = include_str!("../README.md")]

pub mod config;
pub mod convert;
pub mod driver;
pub mod error;
pub mod mock;
pub mod registry;
#[cfg(feature = "rtlsdr")]
pub mod rtlsdr;
pub mod session;
pub mod source;
pub mod stream;
pub mod worker;

pub use config::{ConfigStore, DeviceSettings, SourceConfig};
pub use convert::convert_cu8;
pub use driver::{DirectSampling, RtlDevice, RtlDriver, TunerGainMode, TunerType};
pub use error::{Error, Result};
pub use registry::{DeviceDescriptor, DeviceRegistry};
pub use session::{
    AgcClock, AgcMode, ControlMode, DeviceSession, GainReadback, SessionPhase, TuneReport,
    TunerFilter, TunerParams,
};
pub use source::RtlSdrSource;
pub use stream::{AsyncSampleReader, SampleStream, StreamReader, StreamWriter};
pub use worker::{AcquisitionWorker, transfer_size};

/// Sample rates offered for selection, in Hz
pub const SAMPLE_RATES: [u32; 11] = [
    250_000, 1_024_000, 1_536_000, 1_792_000, 1_920_000, 2_048_000, 2_160_000, 2_400_000,
    2_560_000, 2_880_000, 3_200_000,
];
