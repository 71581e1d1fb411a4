//! Capture I/Q buffers from an RTL-SDR dongle and print their power
//!
//! # Usage Examples
//!
//! ## List attached devices
//! ```bash
//! rtlsdr_capture --list
//! ```
//!
//! ## Capture 20 buffers at 433.92 MHz
//! ```bash
//! rtlsdr_capture -f 433.92M -s 1.024M -g 20 -n 20
//! ```
//!
//! ## Loopback backend (no hardware)
//! ```bash
//! rtlsdr_capture --mock -f 100M
//! ```

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use clap::{ArgAction, Parser};
use futures::StreamExt;
use num_complex::Complex;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use rtlsdr_source::mock::{MockDeviceSpec, MockDriver};
use rtlsdr_source::{ConfigStore, Error, RtlDriver, RtlSdrSource, SAMPLE_RATES};

#[derive(Debug, Clone, Copy)]
struct Frequency(u32);

impl FromStr for Frequency {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (digits, scale) = if let Some(stripped) = s.strip_suffix('G') {
            (stripped, 1e9)
        } else if let Some(stripped) = s.strip_suffix('M') {
            (stripped, 1e6)
        } else if let Some(stripped) = s.strip_suffix('k') {
            (stripped, 1e3)
        } else {
            (s, 1.0)
        };
        let val: f64 = digits
            .trim()
            .parse()
            .map_err(|_| format!("Invalid frequency '{s}'"))?;
        let hz = (val * scale).round();
        if !(0.0..=u32::MAX as f64).contains(&hz) {
            return Err(format!("Frequency out of range '{s}'"));
        }
        Ok(Frequency(hz as u32))
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Capture I/Q samples from an RTL-SDR dongle", long_about = None)]
struct Args {
    /// List attached devices and exit
    #[arg(long, default_value_t = false)]
    list: bool,

    /// Device display name (defaults to the last used, then the first one)
    #[arg(short, long)]
    device: Option<String>,

    /// Use the in-memory loopback backend instead of USB hardware
    #[arg(long, default_value_t = false)]
    mock: bool,

    /// Center frequency in Hz (accepts k/M/G suffix, e.g. 105.1M)
    #[arg(short = 'f', long, value_parser = Frequency::from_str, default_value = "100M")]
    center_freq: Frequency,

    /// Sample rate in Hz (accepts k/M suffix)
    #[arg(short, long, value_parser = Frequency::from_str)]
    sample_rate: Option<Frequency>,

    /// Index into the tuner gain table
    #[arg(short, long)]
    gain: Option<usize>,

    /// Frequency correction in ppm
    #[arg(long, allow_hyphen_values = true)]
    ppm: Option<i32>,

    /// Power an active antenna through the coax
    #[arg(long)]
    bias_tee: Option<bool>,

    /// Number of buffers to capture
    #[arg(short = 'n', long, default_value_t = 10)]
    buffers: usize,

    /// Settings file (in-memory settings if omitted)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Verbosity level (-v=info, -vv=debug, -vvv=trace), overridden by RUST_LOG
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,
}

fn driver(args: &Args) -> rtlsdr_source::Result<Arc<dyn RtlDriver>> {
    if args.mock {
        return Ok(Arc::new(MockDriver::new(vec![
            MockDeviceSpec::new("Generic RTL2832U OEM").with_serial("00000001"),
            MockDeviceSpec::new("Generic RTL2832U OEM").with_serial("00000002"),
        ])));
    }
    #[cfg(feature = "rtlsdr")]
    {
        Ok(Arc::new(rtlsdr_source::rtlsdr::RtlSdrDriver::new()))
    }
    #[cfg(not(feature = "rtlsdr"))]
    {
        Err(Error::Unsupported(
            "USB hardware; rebuild with --features rtlsdr or pass --mock",
        ))
    }
}

fn mean_power_db(samples: &[Complex<f32>]) -> f32 {
    if samples.is_empty() {
        return f32::NEG_INFINITY;
    }
    let power = samples.iter().map(|s| s.norm_sqr()).sum::<f32>() / samples.len() as f32;
    10.0 * power.log10()
}

#[tokio::main]
async fn main() -> rtlsdr_source::Result<()> {
    let args = Args::parse();

    let default_level = match args.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .try_init();

    let config = match &args.config {
        Some(path) => ConfigStore::load(path)?,
        None => ConfigStore::in_memory(),
    };
    let source = RtlSdrSource::new(driver(&args)?, Arc::new(config));

    let devices = source.refresh();
    if args.list {
        if devices.is_empty() {
            println!("No RTL-SDR device found");
        }
        for (position, device) in devices.iter().enumerate() {
            println!("{position}: {}", device.display_name);
        }
        return Ok(());
    }

    let selected = match &args.device {
        Some(name) => source.select_by_name(name)?,
        None => source.select_saved()?,
    };
    let Some(device) = selected else {
        return Err(Error::NoDeviceSelected);
    };
    println!("Using {}", device.display_name);

    let session = source.session();
    if let Some(Frequency(rate)) = args.sample_rate {
        if !SAMPLE_RATES.contains(&rate) {
            warn!("{} Hz is not a standard rate", rate);
        }
        session.set_sample_rate(rate)?;
    }
    if let Some(ppm) = args.ppm {
        session.set_ppm(ppm)?;
    }
    if let Some(gain) = args.gain {
        session.set_gain_index(gain)?;
    }
    if let Some(on) = args.bias_tee {
        session.set_bias_tee(on)?;
    }

    let report = source.tune(args.center_freq.0);
    if !report.converged {
        warn!("Tuned to {} Hz instead of {} Hz", report.actual, report.requested);
    }

    let params = session.params();
    let transfer = source.start()?;
    info!(
        "Streaming {} Hz at {} Hz, {} byte transfers",
        report.actual, params.sample_rate, transfer
    );

    let mut samples = source.reader().into_async(4)?;
    let mut captured = 0;
    while captured < args.buffers {
        let Some(buffer) = samples.next().await else {
            break;
        };
        captured += 1;
        println!(
            "{:>4}: {:>6} samples, {:>7.2} dBFS",
            captured,
            buffer.len(),
            mean_power_db(&buffer)
        );
    }

    source.stop();
    session.stream().stop_reader();
    Ok(())
}
