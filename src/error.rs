//! Error handling for the rtlsdr-source library
//!
//! A single error type covers device lookup and open failures, acquisition
//! lifecycle preconditions, register writes and configuration persistence.

use std::io;

use thiserror::Error;

/// A specialized Result type for rtlsdr-source operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for rtlsdr-source operations
#[derive(Debug, Error)]
pub enum Error {
    /// No device matches the requested index or name
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// The device exists but could not be claimed
    #[error("Device busy: {0}")]
    DeviceBusy(String),

    /// `start()` was called while acquisition is already running
    #[error("Acquisition is already running")]
    AlreadyRunning,

    /// `start()` was called without an open device
    #[error("No device selected")]
    NoDeviceSelected,

    /// A tuner or demodulator register write was rejected by the driver
    #[error("Register write failed ({op}): {reason}")]
    RegisterWrite { op: &'static str, reason: String },

    /// A parameter was outside the range the device accepts
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// The backend has no way to perform this operation
    #[error("Unsupported operation: {0}")]
    Unsupported(&'static str),

    /// Generic driver failure (read registration, enumeration, ...)
    #[error("Driver error: {0}")]
    Driver(String),

    /// Malformed or unusable persisted configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O error (configuration file, thread spawn, ...)
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// JSON (de)serialization of the configuration document
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// RTL-SDR specific error (requires "rtlsdr" feature)
    #[cfg(feature = "rtlsdr")]
    #[error("RTL-SDR error: {0}")]
    RtlSdr(rtl_sdr_rs::error::RtlsdrError),

    /// USB enumeration error (requires "rtlsdr" feature)
    #[cfg(feature = "rtlsdr")]
    #[error("USB error: {0}")]
    Usb(#[from] rusb::Error),
}

#[cfg(feature = "rtlsdr")]
impl From<rtl_sdr_rs::error::RtlsdrError> for Error {
    fn from(err: rtl_sdr_rs::error::RtlsdrError) -> Self {
        Error::RtlSdr(err)
    }
}

// Helper constructors for common error scenarios

impl Error {
    /// Create a driver error with a custom message
    pub fn driver<S: Into<String>>(msg: S) -> Self {
        Error::Driver(msg.into())
    }

    /// Create an invalid parameter error with a custom message
    pub fn invalid<S: Into<String>>(msg: S) -> Self {
        Error::InvalidParameter(msg.into())
    }

    /// Wrap a failed driver call as a register write failure
    pub fn register_write(op: &'static str, err: Error) -> Self {
        match err {
            Error::RegisterWrite { .. } => err,
            other => Error::RegisterWrite {
                op,
                reason: other.to_string(),
            },
        }
    }
}
