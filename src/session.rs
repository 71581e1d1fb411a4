//! Device session
//!
//! A [`DeviceSession`] owns the opened device handle together with every
//! tunable parameter. Parameters can be set at any time: while the device
//! is open they are written to the hardware immediately, otherwise they
//! are kept and applied on the next [`open`](DeviceSession::open).
//!
//! All hardware writes from the control side happen under the session's
//! mutation lock, so a multi-register change (a control mode switch for
//! instance) is never interleaved with another writer or with a close.
//! The lock is never held while waiting on the acquisition thread.

use std::sync::Arc;

use num_complex::Complex;
use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::SAMPLE_RATES;
use crate::config::{ConfigStore, DeviceSettings};
use crate::driver::{DirectSampling, RtlDevice, RtlDriver, TunerGainMode, TunerType};
use crate::error::{Error, Result};
use crate::registry::DeviceDescriptor;
use crate::stream::SampleStream;
use crate::worker::AcquisitionWorker;

/// Maximum number of frequency writes in [`DeviceSession::tune`]
pub const TUNE_ATTEMPTS: u32 = 10;

/// Largest accepted frequency correction
pub const MAX_PPM: i32 = 1_000;

/// Largest LNA / mixer / VGA gain step
pub const MAX_GAIN_STEP: u8 = 15;

/// Largest R82xx filter step
pub const MAX_FILTER_STEP: u8 = 15;

// R82xx tuner registers driven by the control modes
const LNA_GAIN_REG: u8 = 0x05;
const MIXER_GAIN_REG: u8 = 0x07;
const AUTO_GAIN_BIT: u8 = 0x10;
const GAIN_STEP_MASK: u8 = 0x0F;

// R82xx filter, AGC clock and gain status registers
const FILTER_BW_REG: u8 = 0x0A;
const HPF_REG: u8 = 0x0B;
const AGC_CLOCK_REG: u8 = 0x1A;
const AGC_CLOCK_MASK: u8 = 0x30;
const LPF_REG: u8 = 0x1B;
const GAIN_STATUS_REG: u8 = 0x03;

/// Sample rates the RTL2832U resampler accepts
pub fn is_valid_sample_rate(rate: u32) -> bool {
    (225_001..=300_000).contains(&rate) || (900_001..=3_200_000).contains(&rate)
}

/// Lifecycle of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Closed,
    Opening,
    Open,
    Closing,
}

/// How the tuner gain is controlled
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlMode {
    /// Single gain slider over the tuner gain table
    #[default]
    Basic,
    /// Individual LNA / mixer / VGA steps
    Manual,
    /// Tuner or driver AGC
    Agc,
}

/// Which AGC drives the tuner in [`ControlMode::Agc`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgcMode {
    #[default]
    Hardware,
    Software,
}

impl AgcMode {
    fn gain_mode(self) -> TunerGainMode {
        match self {
            AgcMode::Hardware => TunerGainMode::HardwareAgc,
            AgcMode::Software => TunerGainMode::SoftwareAgc,
        }
    }
}

/// R82xx AGC clock period
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum AgcClock {
    #[serde(rename = "300ms")]
    Ms300,
    #[default]
    #[serde(rename = "80ms")]
    Ms80,
    #[serde(rename = "20ms")]
    Ms20,
}

impl AgcClock {
    /// Value for the clock field of the AGC clock register
    fn register_bits(self) -> u8 {
        let id = match self {
            AgcClock::Ms300 => 0,
            AgcClock::Ms80 => 1,
            AgcClock::Ms20 => 2,
        };
        (id + 1) << 4
    }
}

/// R82xx IF filter controls, each a step in `0..=MAX_FILTER_STEP`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunerFilter {
    /// IF filter bandwidth
    Bandwidth,
    LowPassCutoff,
    /// Low-pass notch cutoff
    LowPassNotchCutoff,
    HighPassCutoff,
}

impl TunerFilter {
    pub const ALL: [TunerFilter; 4] = [
        TunerFilter::Bandwidth,
        TunerFilter::LowPassCutoff,
        TunerFilter::LowPassNotchCutoff,
        TunerFilter::HighPassCutoff,
    ];

    fn op(self) -> &'static str {
        match self {
            TunerFilter::Bandwidth => "set_filter_bandwidth",
            TunerFilter::LowPassCutoff => "set_lpf_cutoff",
            TunerFilter::LowPassNotchCutoff => "set_lpnf_cutoff",
            TunerFilter::HighPassCutoff => "set_hpf_cutoff",
        }
    }

    /// `(address, mask, value)` programming `step`. Cutoffs count down
    /// from the register's point of view.
    fn register_write(self, step: u8) -> (u8, u8, u8) {
        let step = step.min(MAX_FILTER_STEP);
        match self {
            TunerFilter::Bandwidth => (FILTER_BW_REG, 0x0F, step),
            TunerFilter::LowPassCutoff => (LPF_REG, 0x0F, MAX_FILTER_STEP - step),
            TunerFilter::LowPassNotchCutoff => (LPF_REG, 0xF0, (MAX_FILTER_STEP - step) << 4),
            TunerFilter::HighPassCutoff => (HPF_REG, 0x0F, MAX_FILTER_STEP - step),
        }
    }

    fn get(self, p: &TunerParams) -> Option<u8> {
        match self {
            TunerFilter::Bandwidth => p.filter_bw,
            TunerFilter::LowPassCutoff => p.lpf_cutoff,
            TunerFilter::LowPassNotchCutoff => p.lpnf_cutoff,
            TunerFilter::HighPassCutoff => p.hpf_cutoff,
        }
    }

    fn slot(self, p: &mut TunerParams) -> &mut Option<u8> {
        match self {
            TunerFilter::Bandwidth => &mut p.filter_bw,
            TunerFilter::LowPassCutoff => &mut p.lpf_cutoff,
            TunerFilter::LowPassNotchCutoff => &mut p.lpnf_cutoff,
            TunerFilter::HighPassCutoff => &mut p.hpf_cutoff,
        }
    }
}

/// LNA and mixer steps the tuner currently runs at
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GainReadback {
    pub lna: u8,
    pub mixer: u8,
}

impl GainReadback {
    fn from_status(value: u8) -> Self {
        Self {
            lna: value & GAIN_STEP_MASK,
            mixer: (value & 0xF0) >> 4,
        }
    }
}

/// Every tunable parameter of a session
#[derive(Debug, Clone, PartialEq)]
pub struct TunerParams {
    pub sample_rate: u32,
    pub center_freq: u32,
    pub ppm: i32,
    /// Index into the ascending gain table
    pub gain_index: usize,
    pub direct_sampling: DirectSampling,
    pub bias_tee: bool,
    pub offset_tuning: bool,
    /// RTL2832U digital AGC
    pub rtl_agc: bool,
    pub control_mode: ControlMode,
    pub agc_mode: AgcMode,
    pub lna_gain: u8,
    pub mixer_gain: u8,
    pub vga_gain: u8,
    /// R82xx filter steps; `None` leaves the chip default untouched
    pub filter_bw: Option<u8>,
    pub lpf_cutoff: Option<u8>,
    pub lpnf_cutoff: Option<u8>,
    pub hpf_cutoff: Option<u8>,
    pub agc_clock: Option<AgcClock>,
}

impl Default for TunerParams {
    fn default() -> Self {
        Self {
            sample_rate: 2_400_000,
            center_freq: 100_000_000,
            ppm: 0,
            gain_index: 0,
            direct_sampling: DirectSampling::Disabled,
            bias_tee: false,
            offset_tuning: false,
            rtl_agc: false,
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

impl TunerParams {
    /// Take over persisted settings.
    ///
    /// A sample rate outside [`SAMPLE_RATES`] is ignored. Direct sampling
    /// always comes back disabled whatever was stored.
    pub fn load(&mut self, settings: &DeviceSettings) {
        if SAMPLE_RATES.contains(&settings.sample_rate) {
            self.sample_rate = settings.sample_rate;
        } else {
            warn!(
                "Ignoring stored sample rate {} Hz, keeping {} Hz",
                settings.sample_rate, self.sample_rate
            );
        }
        self.direct_sampling = DirectSampling::Disabled;
        self.ppm = settings.ppm.clamp(-MAX_PPM, MAX_PPM);
        self.bias_tee = settings.bias_tee;
        self.offset_tuning = settings.offset_tuning;
        self.rtl_agc = settings.rtl_agc;
        self.gain_index = settings.gain;
        self.control_mode = settings.control_mode;
        self.agc_mode = settings.agc_mode;
        self.lna_gain = settings.lna_gain.min(MAX_GAIN_STEP);
        self.mixer_gain = settings.mixer_gain.min(MAX_GAIN_STEP);
        self.vga_gain = settings.vga_gain.min(MAX_GAIN_STEP);
        let step = |s: Option<u8>| s.map(|s| s.min(MAX_FILTER_STEP));
        self.filter_bw = step(settings.filter_bw);
        self.lpf_cutoff = step(settings.lpf_cutoff);
        self.lpnf_cutoff = step(settings.lpnf_cutoff);
        self.hpf_cutoff = step(settings.hpf_cutoff);
        self.agc_clock = settings.agc_clock;
    }

    /// Write the persisted subset into `settings`
    pub fn store(&self, settings: &mut DeviceSettings) {
        settings.sample_rate = self.sample_rate;
        settings.direct_sampling = self.direct_sampling;
        settings.ppm = self.ppm;
        settings.bias_tee = self.bias_tee;
        settings.offset_tuning = self.offset_tuning;
        settings.rtl_agc = self.rtl_agc;
        settings.gain = self.gain_index;
        settings.control_mode = self.control_mode;
        settings.agc_mode = self.agc_mode;
        settings.lna_gain = self.lna_gain;
        settings.mixer_gain = self.mixer_gain;
        settings.vga_gain = self.vga_gain;
        settings.filter_bw = self.filter_bw;
        settings.lpf_cutoff = self.lpf_cutoff;
        settings.lpnf_cutoff = self.lpnf_cutoff;
        settings.hpf_cutoff = self.hpf_cutoff;
        settings.agc_clock = self.agc_clock;
    }
}

/// Outcome of [`DeviceSession::tune`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TuneReport {
    pub requested: u32,
    /// Frequency last read back from the hardware (the request itself when
    /// no device is open)
    pub actual: u32,
    /// Frequency writes issued, 0 when no device is open
    pub attempts: u32,
    pub converged: bool,
}

impl TuneReport {
    /// More than one retry was needed, or the hardware never agreed
    pub fn reconciliation_warning(&self) -> bool {
        !self.converged || self.attempts > 2
    }
}

struct OpenDevice {
    handle: Arc<dyn RtlDevice>,
    descriptor: DeviceDescriptor,
    tuner: TunerType,
}

struct SessionInner {
    phase: SessionPhase,
    device: Option<OpenDevice>,
    params: TunerParams,
    gain_table: Vec<i32>,
    /// Configuration key of the selected device
    selected: Option<String>,
}

/// An RTL-SDR device session with its acquisition worker
pub struct DeviceSession {
    driver: Arc<dyn RtlDriver>,
    config: Arc<ConfigStore>,
    inner: Mutex<SessionInner>,
    worker: AcquisitionWorker,
}

impl DeviceSession {
    pub fn new(
        driver: Arc<dyn RtlDriver>,
        config: Arc<ConfigStore>,
        stream: Arc<SampleStream<Complex<f32>>>,
    ) -> Self {
        Self {
            driver,
            config,
            inner: Mutex::new(SessionInner {
                phase: SessionPhase::Closed,
                device: None,
                params: TunerParams::default(),
                gain_table: Vec::new(),
                selected: None,
            }),
            worker: AcquisitionWorker::new(stream),
        }
    }

    pub fn phase(&self) -> SessionPhase {
        self.lock().phase
    }

    pub fn is_open(&self) -> bool {
        self.phase() == SessionPhase::Open
    }

    pub fn params(&self) -> TunerParams {
        self.lock().params.clone()
    }

    /// Ascending tuner gains (tenths of dB) of the last opened device
    pub fn gain_table(&self) -> Vec<i32> {
        self.lock().gain_table.clone()
    }

    /// Currently selected gain in tenths of dB
    pub fn gain(&self) -> Option<i32> {
        let inner = self.lock();
        inner.gain_table.get(inner.params.gain_index).copied()
    }

    pub fn descriptor(&self) -> Option<DeviceDescriptor> {
        self.lock().device.as_ref().map(|d| d.descriptor.clone())
    }

    pub fn tuner_type(&self) -> Option<TunerType> {
        self.lock().device.as_ref().map(|d| d.tuner)
    }

    pub fn stream(&self) -> &Arc<SampleStream<Complex<f32>>> {
        self.worker.stream()
    }

    pub fn config(&self) -> &Arc<ConfigStore> {
        &self.config
    }

    /// Load persisted settings for the device known as `name` and make
    /// later changes write back under that name. Nothing is sent to the
    /// hardware until the next open.
    pub fn load_settings(&self, name: &str, settings: &DeviceSettings) {
        let mut inner = self.lock();
        inner.params.load(settings);
        inner.selected = Some(name.to_string());
        debug!("Loaded settings for '{}': {:?}", name, inner.params);
    }

    /// Forget the selected device name; later changes are not persisted
    pub fn deselect(&self) {
        self.lock().selected = None;
    }

    /// Open the device described by `descriptor`.
    ///
    /// Reads and sorts the gain table, re-clamps the gain index and applies
    /// every stored parameter. On failure the session stays closed.
    /// Opening the device that is already open does nothing.
    pub fn open(&self, descriptor: &DeviceDescriptor) -> Result<()> {
        if self.descriptor().as_ref() == Some(descriptor) {
            return Ok(());
        }
        self.close();

        let mut inner = self.lock();
        inner.phase = SessionPhase::Opening;
        let handle = match self.driver.open(descriptor.index) {
            Ok(handle) => handle,
            Err(e) => {
                inner.phase = SessionPhase::Closed;
                error!("Could not open '{}': {}", descriptor.display_name, e);
                return Err(e);
            }
        };

        let tuner = handle.tuner_type();
        let mut gains = handle.tuner_gains().unwrap_or_else(|e| {
            warn!("Could not read tuner gains: {}", e);
            Vec::new()
        });
        gains.sort_unstable();
        inner.gain_table = gains;
        let max_index = inner.gain_table.len().saturating_sub(1);
        inner.params.gain_index = inner.params.gain_index.min(max_index);

        apply_all(handle.as_ref(), &inner.params, &inner.gain_table, tuner);

        inner.device = Some(OpenDevice {
            handle,
            descriptor: descriptor.clone(),
            tuner,
        });
        inner.phase = SessionPhase::Open;
        info!(
            "Opened '{}' ({:?} tuner, {} gains)",
            descriptor.display_name,
            tuner,
            inner.gain_table.len()
        );
        Ok(())
    }

    /// Stop acquisition and release the device. Does nothing when closed.
    pub fn close(&self) {
        {
            let mut inner = self.lock();
            if inner.phase != SessionPhase::Open {
                return;
            }
            inner.phase = SessionPhase::Closing;
        }

        // cancels the pending read and joins the acquisition thread
        self.worker.stop();

        let device = {
            let mut inner = self.lock();
            inner.phase = SessionPhase::Closed;
            inner.device.take()
        };
        if let Some(device) = device {
            info!("Closed '{}'", device.descriptor.display_name);
        }
    }

    /// Start acquisition on the open device.
    ///
    /// Returns the transfer size in bytes. Fails with
    /// [`Error::AlreadyRunning`] or [`Error::NoDeviceSelected`].
    pub fn start(&self) -> Result<u32> {
        if self.worker.is_running() {
            return Err(Error::AlreadyRunning);
        }
        let (handle, sample_rate) = {
            let inner = self.lock();
            match (inner.phase, inner.device.as_ref()) {
                (SessionPhase::Open, Some(device)) => {
                    (Arc::clone(&device.handle), inner.params.sample_rate)
                }
                _ => {
                    error!("No device selected");
                    return Err(Error::NoDeviceSelected);
                }
            }
        };
        self.worker.start(handle, sample_rate)
    }

    /// Stop acquisition; the device stays open
    pub fn stop(&self) {
        self.worker.stop();
    }

    pub fn is_running(&self) -> bool {
        self.worker.is_running()
    }

    /// Transfer size of the running acquisition in bytes
    pub fn transfer_size(&self) -> Option<u32> {
        self.worker.transfer_size()
    }

    pub fn set_sample_rate(&self, rate: u32) -> Result<()> {
        if !is_valid_sample_rate(rate) {
            return Err(Error::invalid(format!("sample rate {rate} Hz")));
        }
        self.update(
            "set_sample_rate",
            |p| p.sample_rate = rate,
            |dev, _, _, _| dev.set_sample_rate(rate),
        )
    }

    /// Set the center frequency with a single write, without read-back
    pub fn set_frequency(&self, freq: u32) -> Result<()> {
        if freq == 0 {
            return Err(Error::invalid("center frequency 0 Hz"));
        }
        self.update(
            "set_center_freq",
            |p| p.center_freq = freq,
            |dev, _, _, _| dev.set_center_freq(freq),
        )
    }

    pub fn set_ppm(&self, ppm: i32) -> Result<()> {
        if !(-MAX_PPM..=MAX_PPM).contains(&ppm) {
            return Err(Error::invalid(format!("frequency correction {ppm} ppm")));
        }
        self.update(
            "set_freq_correction",
            |p| p.ppm = ppm,
            |dev, _, _, _| dev.set_freq_correction(ppm),
        )
    }

    /// Select an entry of the ascending gain table
    pub fn set_gain_index(&self, index: usize) -> Result<()> {
        // a closed session keeps the last table; the index is clamped on open
        let table_len = {
            let inner = self.lock();
            match inner.phase {
                SessionPhase::Open => inner.gain_table.len(),
                _ => 0,
            }
        };
        if table_len > 0 && index >= table_len {
            return Err(Error::invalid(format!(
                "gain index {index} (table has {table_len} entries)"
            )));
        }
        self.update(
            "set_tuner_gain",
            |p| p.gain_index = index,
            |dev, p, gains, _| match gains.get(p.gain_index) {
                Some(&gain) => dev.set_tuner_gain(gain),
                None => Ok(()),
            },
        )
    }

    pub fn set_direct_sampling(&self, mode: DirectSampling) -> Result<()> {
        self.update(
            "set_direct_sampling",
            |p| p.direct_sampling = mode,
            |dev, p, gains, _| {
                dev.set_direct_sampling(mode)?;
                if mode == DirectSampling::Disabled {
                    restore_tuner_path(dev, p, gains)?;
                }
                Ok(())
            },
        )
    }

    pub fn set_bias_tee(&self, on: bool) -> Result<()> {
        self.update(
            "set_bias_tee",
            |p| p.bias_tee = on,
            |dev, _, _, _| dev.set_bias_tee(on),
        )
    }

    pub fn set_offset_tuning(&self, on: bool) -> Result<()> {
        self.update(
            "set_offset_tuning",
            |p| p.offset_tuning = on,
            |dev, _, _, _| dev.set_offset_tuning(on),
        )
    }

    /// RTL2832U digital AGC
    pub fn set_agc(&self, on: bool) -> Result<()> {
        self.update(
            "set_agc_mode",
            |p| p.rtl_agc = on,
            |dev, _, _, _| dev.set_agc_mode(on),
        )
    }

    /// Switch control mode and reprogram the gain registers for it
    pub fn set_control_mode(&self, mode: ControlMode) -> Result<()> {
        self.update(
            "set_control_mode",
            |p| p.control_mode = mode,
            |dev, p, gains, tuner| apply_control_mode(dev, p, gains, tuner),
        )
    }

    /// Choose hardware or software AGC; applied now if in AGC mode
    pub fn set_agc_mode(&self, agc_mode: AgcMode) -> Result<()> {
        self.update(
            "set_tuner_gain_mode",
            |p| p.agc_mode = agc_mode,
            |dev, p, _, _| {
                if p.control_mode == ControlMode::Agc {
                    dev.set_tuner_gain_mode(agc_mode.gain_mode())?;
                }
                Ok(())
            },
        )
    }

    /// LNA, mixer and VGA steps (0..=15); applied now if in manual mode
    pub fn set_manual_gains(&self, lna: u8, mixer: u8, vga: u8) -> Result<()> {
        if lna > MAX_GAIN_STEP || mixer > MAX_GAIN_STEP || vga > MAX_GAIN_STEP {
            return Err(Error::invalid(format!(
                "manual gains lna={lna} mixer={mixer} vga={vga}"
            )));
        }
        self.update(
            "set_manual_gains",
            |p| {
                p.lna_gain = lna;
                p.mixer_gain = mixer;
                p.vga_gain = vga;
            },
            |dev, p, _, tuner| {
                if p.control_mode != ControlMode::Manual {
                    return Ok(());
                }
                if tuner.has_r82xx_registers() {
                    dev.write_tuner_register(LNA_GAIN_REG, GAIN_STEP_MASK, lna)?;
                    dev.write_tuner_register(MIXER_GAIN_REG, GAIN_STEP_MASK, mixer)?;
                }
                dev.set_tuner_gain_index(vga)
            },
        )
    }

    /// Program one R82xx filter step (0..=15). Other tuners only keep the
    /// value.
    pub fn set_tuner_filter(&self, filter: TunerFilter, step: u8) -> Result<()> {
        if step > MAX_FILTER_STEP {
            return Err(Error::invalid(format!("{filter:?} step {step}")));
        }
        self.update(
            filter.op(),
            |p| *filter.slot(p) = Some(step),
            |dev, _, _, tuner| {
                if tuner.has_r82xx_registers() {
                    let (address, mask, value) = filter.register_write(step);
                    dev.write_tuner_register(address, mask, value)?;
                }
                Ok(())
            },
        )
    }

    /// R82xx AGC clock period
    pub fn set_agc_clock(&self, clock: AgcClock) -> Result<()> {
        self.update(
            "set_agc_clock",
            |p| p.agc_clock = Some(clock),
            |dev, _, _, tuner| {
                if tuner.has_r82xx_registers() {
                    write_agc_clock(dev, clock)?;
                }
                Ok(())
            },
        )
    }

    /// Read the LNA and mixer steps back from the tuner, useful to watch
    /// what the tuner AGC settled on
    pub fn read_gains(&self) -> Result<GainReadback> {
        let inner = self.lock();
        let device = match (inner.phase, inner.device.as_ref()) {
            (SessionPhase::Open, Some(device)) => device,
            _ => return Err(Error::NoDeviceSelected),
        };
        if !device.tuner.has_r82xx_registers() {
            return Err(Error::Unsupported("gain readback"));
        }
        let status = device.handle.read_tuner_register(GAIN_STATUS_REG)?;
        Ok(GainReadback::from_status(status))
    }

    /// Tune to `freq`, reading the frequency back and rewriting it while the
    /// hardware reports something else, at most [`TUNE_ATTEMPTS`] writes.
    ///
    /// Never fails: the report carries whatever the hardware settled on.
    pub fn tune(&self, freq: u32) -> TuneReport {
        let mut inner = self.lock();
        inner.params.center_freq = freq;

        let Some(device) = inner.device.as_ref().filter(|_| inner.phase == SessionPhase::Open)
        else {
            info!("Tune: {} Hz (applied on open)", freq);
            return TuneReport {
                requested: freq,
                actual: freq,
                attempts: 0,
                converged: true,
            };
        };

        let mut actual = 0;
        let mut attempts = 0;
        while attempts < TUNE_ATTEMPTS {
            attempts += 1;
            if let Err(e) = device.handle.set_center_freq(freq) {
                warn!("Frequency write failed: {}", e);
            }
            actual = device.handle.center_freq();
            if actual == freq {
                break;
            }
        }

        let report = TuneReport {
            requested: freq,
            actual,
            attempts,
            converged: actual == freq,
        };
        if report.reconciliation_warning() {
            warn!(
                "RTL-SDR took {} attempts to tune to {} Hz (reads back {} Hz)",
                attempts, freq, actual
            );
        }
        info!("Tune: {} Hz", actual);
        report
    }

    /// Mutate the parameters, write them to the device if open, and persist
    /// them for the selected device. A failed write keeps the new value.
    fn update(
        &self,
        op: &'static str,
        mutate: impl FnOnce(&mut TunerParams),
        apply: impl FnOnce(&dyn RtlDevice, &TunerParams, &[i32], TunerType) -> Result<()>,
    ) -> Result<()> {
        let (result, selected, params) = {
            let mut inner = self.lock();
            mutate(&mut inner.params);
            let result = match (inner.phase, inner.device.as_ref()) {
                (SessionPhase::Open, Some(device)) => apply(
                    device.handle.as_ref(),
                    &inner.params,
                    &inner.gain_table,
                    device.tuner,
                )
                .map_err(|e| Error::register_write(op, e)),
                _ => Ok(()),
            };
            (result, inner.selected.clone(), inner.params.clone())
        };

        if let Err(e) = &result {
            warn!("{}", e);
        }
        if let Some(name) = selected {
            if let Err(e) = self.config.update_device(&name, |s| params.store(s)) {
                warn!("Failed to persist settings for '{}': {}", name, e);
            }
        }
        result
    }

    fn lock(&self) -> MutexGuard<'_, SessionInner> {
        self.inner.lock()
    }
}

impl Drop for DeviceSession {
    fn drop(&mut self) {
        self.close();
    }
}

/// Program every stored parameter into a freshly opened device. Failures
/// are logged and the remaining parameters still applied.
fn apply_all(dev: &dyn RtlDevice, p: &TunerParams, gains: &[i32], tuner: TunerType) {
    let gain = gains.get(p.gain_index).copied();
    let steps: [(&str, Result<()>); 10] = [
        ("set_sample_rate", dev.set_sample_rate(p.sample_rate)),
        ("set_center_freq", dev.set_center_freq(p.center_freq)),
        ("set_freq_correction", dev.set_freq_correction(p.ppm)),
        ("set_tuner_bandwidth", dev.set_tuner_bandwidth(0)),
        ("set_direct_sampling", dev.set_direct_sampling(p.direct_sampling)),
        ("set_bias_tee", dev.set_bias_tee(p.bias_tee)),
        ("set_agc_mode", dev.set_agc_mode(p.rtl_agc)),
        ("set_tuner_gain_mode", dev.set_tuner_gain_mode(TunerGainMode::Manual)),
        ("set_tuner_gain", gain.map_or(Ok(()), |g| dev.set_tuner_gain(g))),
        ("set_offset_tuning", dev.set_offset_tuning(p.offset_tuning)),
    ];
    for (op, result) in steps {
        if let Err(e) = result {
            warn!("{}", Error::register_write(op, e));
        }
    }
    if let Err(e) = apply_control_mode(dev, p, gains, tuner) {
        warn!("{}", Error::register_write("set_control_mode", e));
    }
    if tuner.has_r82xx_registers() {
        apply_filters(dev, p);
    }
}

/// Stored R82xx filter steps and AGC clock; unset ones are left alone
fn apply_filters(dev: &dyn RtlDevice, p: &TunerParams) {
    for filter in TunerFilter::ALL {
        if let Some(step) = filter.get(p) {
            let (address, mask, value) = filter.register_write(step);
            if let Err(e) = dev.write_tuner_register(address, mask, value) {
                warn!("{}", Error::register_write(filter.op(), e));
            }
        }
    }
    if let Some(clock) = p.agc_clock {
        if let Err(e) = write_agc_clock(dev, clock) {
            warn!("{}", Error::register_write("set_agc_clock", e));
        }
    }
}

fn write_agc_clock(dev: &dyn RtlDevice, clock: AgcClock) -> Result<()> {
    dev.write_tuner_register(AGC_CLOCK_REG, AGC_CLOCK_MASK, clock.register_bits())
}

/// Gain mode plus LNA/mixer auto-manual registers for the control mode
fn apply_control_mode(
    dev: &dyn RtlDevice,
    p: &TunerParams,
    gains: &[i32],
    tuner: TunerType,
) -> Result<()> {
    let r82xx = tuner.has_r82xx_registers();
    if !r82xx {
        debug!("{:?} tuner has no LNA/mixer gain registers", tuner);
    }
    let set_gain = |dev: &dyn RtlDevice| match gains.get(p.gain_index) {
        Some(&gain) => dev.set_tuner_gain(gain),
        None => Ok(()),
    };

    match p.control_mode {
        ControlMode::Basic => {
            dev.set_tuner_gain_mode(TunerGainMode::Manual)?;
            set_gain(dev)?;
            if r82xx {
                dev.write_tuner_register(LNA_GAIN_REG, AUTO_GAIN_BIT, 0)?;
                dev.write_tuner_register(MIXER_GAIN_REG, AUTO_GAIN_BIT, AUTO_GAIN_BIT)?;
            }
        }
        ControlMode::Manual => {
            dev.set_tuner_gain_mode(TunerGainMode::Manual)?;
            set_gain(dev)?;
            if r82xx {
                dev.write_tuner_register(LNA_GAIN_REG, AUTO_GAIN_BIT, AUTO_GAIN_BIT)?;
                dev.write_tuner_register(MIXER_GAIN_REG, AUTO_GAIN_BIT, 0)?;
                dev.write_tuner_register(LNA_GAIN_REG, GAIN_STEP_MASK, p.lna_gain)?;
                dev.write_tuner_register(MIXER_GAIN_REG, GAIN_STEP_MASK, p.mixer_gain)?;
            }
            dev.set_tuner_gain_index(p.vga_gain)?;
        }
        ControlMode::Agc => {
            set_gain(dev)?;
            if r82xx {
                dev.write_tuner_register(LNA_GAIN_REG, AUTO_GAIN_BIT, 0)?;
                dev.write_tuner_register(MIXER_GAIN_REG, AUTO_GAIN_BIT, AUTO_GAIN_BIT)?;
            }
            dev.set_tuner_gain_mode(p.agc_mode.gain_mode())?;
        }
    }
    Ok(())
}

/// Leaving direct sampling leaves the tuner gains in a stale state;
/// cycle the mode and re-apply AGC and gain.
fn restore_tuner_path(dev: &dyn RtlDevice, p: &TunerParams, gains: &[i32]) -> Result<()> {
    dev.set_direct_sampling(DirectSampling::IBranch)?;
    dev.set_direct_sampling(DirectSampling::Disabled)?;
    dev.set_agc_mode(p.rtl_agc)?;
    let gain_mode = match p.control_mode {
        ControlMode::Agc => p.agc_mode.gain_mode(),
        _ => TunerGainMode::Manual,
    };
    dev.set_tuner_gain_mode(gain_mode)?;
    if let Some(&gain) = gains.get(p.gain_index) {
        dev.set_tuner_gain(gain)?;
    }
    Ok(())
}
