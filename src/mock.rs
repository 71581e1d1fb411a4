//! In-memory loopback backend
//!
//! [`MockDriver`] implements the driver contract without hardware. Each
//! device is scripted by a [`MockDeviceSpec`] (gain table, tuning quirk,
//! transfer payload, failure injection) and records every call it receives
//! so callers can check what reached the "hardware". Asynchronous reads
//! deliver the payload at a fixed pace until cancelled.

use std::f32::consts::PI;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, MutexGuard};
use tracing::debug;

use crate::driver::{
    DirectSampling, R820T_GAINS, ReadCallback, RtlDevice, RtlDriver, TunerGainMode, TunerType,
};
use crate::error::{Error, Result};

/// A driver call as seen by a mock device
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockCall {
    SetSampleRate(u32),
    SetCenterFreq(u32),
    SetFreqCorrection(i32),
    SetTunerBandwidth(u32),
    SetDirectSampling(DirectSampling),
    SetBiasTee(bool),
    SetAgcMode(bool),
    SetOffsetTuning(bool),
    SetTunerGainMode(TunerGainMode),
    SetTunerGain(i32),
    SetTunerGainIndex(u8),
    WriteTunerRegister { address: u8, mask: u8, value: u8 },
    ResetBuffer,
    ReadAsync(u32),
    CancelAsync,
}

/// How the mock echoes a center frequency write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TuneQuirk {
    /// Reads back exactly what was written
    Exact,
    /// Always reads back the written value plus an offset
    Offset(i32),
    /// Reads back one Hz off until the given number of writes happened
    SettleAfter(u32),
}

/// Scripted behaviour of one mock device
#[derive(Debug, Clone)]
pub struct MockDeviceSpec {
    pub name: String,
    pub serial: Option<String>,
    pub tuner: TunerType,
    pub gains: Vec<i32>,
    pub tune_quirk: TuneQuirk,
    /// Bytes repeated to fill every transfer
    pub payload: Vec<u8>,
    /// Pause between transfers
    pub transfer_interval: Duration,
    pub busy: bool,
    /// Make `read_async` fail after the given delay without delivering
    pub fail_read_async: Option<Duration>,
    pub fail_register_writes: bool,
}

impl MockDeviceSpec {
    pub fn new<S: Into<String>>(name: S) -> Self {
        let mut gains = R820T_GAINS.to_vec();
        // drivers make no ordering promise
        gains.rotate_left(11);
        Self {
            name: name.into(),
            serial: None,
            tuner: TunerType::R820T,
            gains,
            tune_quirk: TuneQuirk::Exact,
            payload: tone_cu8(8),
            transfer_interval: Duration::from_millis(2),
            busy: false,
            fail_read_async: None,
            fail_register_writes: false,
        }
    }

    pub fn with_serial<S: Into<String>>(mut self, serial: S) -> Self {
        self.serial = Some(serial.into());
        self
    }

    pub fn with_gains(mut self, gains: Vec<i32>) -> Self {
        self.gains = gains;
        self
    }

    pub fn with_tuner(mut self, tuner: TunerType) -> Self {
        self.tuner = tuner;
        self
    }

    pub fn with_tune_quirk(mut self, quirk: TuneQuirk) -> Self {
        self.tune_quirk = quirk;
        self
    }

    pub fn with_payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_transfer_interval(mut self, interval: Duration) -> Self {
        self.transfer_interval = interval;
        self
    }

    pub fn busy(mut self) -> Self {
        self.busy = true;
        self
    }

    pub fn failing_read_async(self) -> Self {
        self.failing_read_async_after(Duration::ZERO)
    }

    /// Fail the read registration only once `delay` has passed
    pub fn failing_read_async_after(mut self, delay: Duration) -> Self {
        self.fail_read_async = Some(delay);
        self
    }

    pub fn failing_register_writes(mut self) -> Self {
        self.fail_register_writes = true;
        self
    }
}

/// One period of a full-scale complex tone, as unsigned 8-bit I/Q
pub fn tone_cu8(period: usize) -> Vec<u8> {
    let period = period.max(1);
    (0..period)
        .flat_map(|n| {
            let phase = 2.0 * PI * n as f32 / period as f32;
            [
                (127.5 + 127.0 * phase.cos()) as u8,
                (127.5 + 127.0 * phase.sin()) as u8,
            ]
        })
        .collect()
}

struct MockState {
    calls: Vec<MockCall>,
    center_freq: u32,
    freq_writes: u32,
    registers: [u8; 32],
}

/// A scripted device. Shared between the driver (for inspection) and the
/// handle returned by [`RtlDriver::open`].
pub struct MockDevice {
    spec: Mutex<MockDeviceSpec>,
    state: Mutex<MockState>,
    cancel: AtomicBool,
    open: AtomicBool,
    opens: AtomicUsize,
}

impl MockDevice {
    fn new(spec: MockDeviceSpec) -> Self {
        Self {
            spec: Mutex::new(spec),
            state: Mutex::new(MockState {
                calls: Vec::new(),
                center_freq: 0,
                freq_writes: 0,
                registers: [0; 32],
            }),
            cancel: AtomicBool::new(false),
            open: AtomicBool::new(false),
            opens: AtomicUsize::new(0),
        }
    }

    /// Every call received so far, oldest first
    pub fn calls(&self) -> Vec<MockCall> {
        self.state().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state().calls.clear();
    }

    /// Number of recorded calls matching `pred`
    pub fn count_calls(&self, pred: impl Fn(&MockCall) -> bool) -> usize {
        self.state().calls.iter().filter(|call| pred(call)).count()
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// How many times the device was opened
    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    /// Number of center frequency writes
    pub fn freq_writes(&self) -> u32 {
        self.state().freq_writes
    }

    pub fn register(&self, address: u8) -> u8 {
        self.state().registers[address as usize % 32]
    }

    /// Overwrite a tuner register as the chip would
    pub fn set_register(&self, address: u8, value: u8) {
        self.state().registers[address as usize % 32] = value;
    }

    /// Replace the gain table reported on the next open
    pub fn set_gains(&self, gains: Vec<i32>) {
        self.spec().gains = gains;
    }

    pub fn set_busy(&self, busy: bool) {
        self.spec().busy = busy;
    }

    fn spec(&self) -> MutexGuard<'_, MockDeviceSpec> {
        self.spec.lock()
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock()
    }

    fn record(&self, call: MockCall) -> Result<()> {
        self.state().calls.push(call);
        if self.spec().fail_register_writes {
            return Err(Error::driver("control transfer failed"));
        }
        Ok(())
    }
}

/// Driver over a fixed set of mock devices
pub struct MockDriver {
    devices: Vec<Arc<MockDevice>>,
    enumerates: bool,
}

impl MockDriver {
    pub fn new(specs: Vec<MockDeviceSpec>) -> Self {
        Self {
            devices: specs.into_iter().map(|s| Arc::new(MockDevice::new(s))).collect(),
            enumerates: true,
        }
    }

    /// A driver with nothing attached
    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    /// A driver on a platform without device enumeration. `spec`, if any,
    /// is the single device found by probing.
    pub fn probe_only(spec: Option<MockDeviceSpec>) -> Self {
        Self {
            enumerates: false,
            ..Self::new(spec.into_iter().collect())
        }
    }

    /// Inspection handle of the device at `index`
    pub fn device(&self, index: usize) -> Option<Arc<MockDevice>> {
        self.devices.get(index).cloned()
    }
}

impl RtlDriver for MockDriver {
    fn device_count(&self) -> usize {
        if self.enumerates { self.devices.len() } else { 0 }
    }

    fn device_name(&self, index: usize) -> String {
        self.devices
            .get(index)
            .map(|d| d.spec().name.clone())
            .unwrap_or_default()
    }

    fn device_serial(&self, index: usize) -> Option<String> {
        self.devices.get(index).and_then(|d| d.spec().serial.clone())
    }

    fn supports_enumeration(&self) -> bool {
        self.enumerates
    }

    fn probe(&self, ids: &[(u16, u16)]) -> Option<(u16, u16)> {
        if self.devices.is_empty() {
            None
        } else {
            ids.first().copied()
        }
    }

    fn open(&self, index: usize) -> Result<Arc<dyn RtlDevice>> {
        let device = self
            .devices
            .get(index)
            .ok_or_else(|| Error::DeviceNotFound(format!("mock device #{index}")))?;
        if device.spec().busy || device.open.swap(true, Ordering::SeqCst) {
            return Err(Error::DeviceBusy(format!("mock device #{index}")));
        }
        device.opens.fetch_add(1, Ordering::SeqCst);
        debug!("Opened mock device #{}", index);
        Ok(Arc::new(MockHandle {
            device: Arc::clone(device),
        }))
    }
}

/// Exclusive handle on a mock device; releases it when dropped
struct MockHandle {
    device: Arc<MockDevice>,
}

impl Drop for MockHandle {
    fn drop(&mut self) {
        self.device.open.store(false, Ordering::SeqCst);
    }
}

impl RtlDevice for MockHandle {
    fn tuner_type(&self) -> TunerType {
        self.device.spec().tuner
    }

    fn tuner_gains(&self) -> Result<Vec<i32>> {
        Ok(self.device.spec().gains.clone())
    }

    fn set_sample_rate(&self, rate: u32) -> Result<()> {
        self.device.record(MockCall::SetSampleRate(rate))
    }

    fn set_center_freq(&self, freq: u32) -> Result<()> {
        let quirk = self.device.spec().tune_quirk;
        {
            let mut state = self.device.state();
            state.calls.push(MockCall::SetCenterFreq(freq));
            state.freq_writes += 1;
            state.center_freq = match quirk {
                TuneQuirk::Exact => freq,
                TuneQuirk::Offset(offset) => freq.saturating_add_signed(offset),
                TuneQuirk::SettleAfter(n) if state.freq_writes >= n => freq,
                TuneQuirk::SettleAfter(_) => freq.saturating_add(1),
            };
        }
        if self.device.spec().fail_register_writes {
            return Err(Error::driver("control transfer failed"));
        }
        Ok(())
    }

    fn center_freq(&self) -> u32 {
        self.device.state().center_freq
    }

    fn set_freq_correction(&self, ppm: i32) -> Result<()> {
        self.device.record(MockCall::SetFreqCorrection(ppm))
    }

    fn set_tuner_bandwidth(&self, bandwidth: u32) -> Result<()> {
        self.device.record(MockCall::SetTunerBandwidth(bandwidth))
    }

    fn set_direct_sampling(&self, mode: DirectSampling) -> Result<()> {
        self.device.record(MockCall::SetDirectSampling(mode))
    }

    fn set_bias_tee(&self, on: bool) -> Result<()> {
        self.device.record(MockCall::SetBiasTee(on))
    }

    fn set_agc_mode(&self, on: bool) -> Result<()> {
        self.device.record(MockCall::SetAgcMode(on))
    }

    fn set_offset_tuning(&self, on: bool) -> Result<()> {
        self.device.record(MockCall::SetOffsetTuning(on))
    }

    fn set_tuner_gain_mode(&self, mode: TunerGainMode) -> Result<()> {
        self.device.record(MockCall::SetTunerGainMode(mode))
    }

    fn set_tuner_gain(&self, gain: i32) -> Result<()> {
        self.device.record(MockCall::SetTunerGain(gain))
    }

    fn set_tuner_gain_index(&self, index: u8) -> Result<()> {
        self.device.record(MockCall::SetTunerGainIndex(index))
    }

    fn write_tuner_register(&self, address: u8, mask: u8, value: u8) -> Result<()> {
        self.device.record(MockCall::WriteTunerRegister {
            address,
            mask,
            value,
        })?;
        let mut state = self.device.state();
        let reg = &mut state.registers[address as usize % 32];
        *reg = (*reg & !mask) | (value & mask);
        Ok(())
    }

    fn read_tuner_register(&self, address: u8) -> Result<u8> {
        Ok(self.device.register(address))
    }

    fn reset_buffer(&self) -> Result<()> {
        self.device.state().calls.push(MockCall::ResetBuffer);
        Ok(())
    }

    fn read_async(&self, callback: &mut ReadCallback<'_>, buf_len: u32) -> Result<()> {
        self.device.state().calls.push(MockCall::ReadAsync(buf_len));
        // a cancel left over from the previous read must not end this one
        self.device.cancel.store(false, Ordering::SeqCst);
        let (payload, interval, fail) = {
            let spec = self.device.spec();
            (spec.payload.clone(), spec.transfer_interval, spec.fail_read_async)
        };
        if let Some(delay) = fail {
            let deadline = Instant::now() + delay;
            while Instant::now() < deadline && !self.device.cancel.load(Ordering::SeqCst) {
                std::thread::sleep(Duration::from_millis(1));
            }
            return Err(Error::driver("failed to submit bulk transfer"));
        }

        let chunk: Vec<u8> = if payload.is_empty() {
            vec![0; buf_len as usize]
        } else {
            payload.iter().copied().cycle().take(buf_len as usize).collect()
        };
        while !self.device.cancel.load(Ordering::SeqCst) {
            callback(&chunk);
            std::thread::sleep(interval);
        }
        Ok(())
    }

    fn cancel_async(&self) -> Result<()> {
        self.device.state().calls.push(MockCall::CancelAsync);
        self.device.cancel.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_is_exclusive_until_handle_drops() {
        let driver = MockDriver::new(vec![MockDeviceSpec::new("Generic RTL2832U")]);
        let handle = driver.open(0).unwrap();
        assert!(matches!(driver.open(0), Err(Error::DeviceBusy(_))));

        drop(handle);
        assert!(!driver.device(0).unwrap().is_open());
        assert!(driver.open(0).is_ok());
        assert_eq!(driver.device(0).unwrap().open_count(), 2);
    }

    #[test]
    fn open_out_of_range_is_not_found() {
        let driver = MockDriver::empty();
        assert!(matches!(driver.open(0), Err(Error::DeviceNotFound(_))));
    }

    #[test]
    fn register_writes_respect_mask() {
        let driver = MockDriver::new(vec![MockDeviceSpec::new("dongle")]);
        let handle = driver.open(0).unwrap();
        handle.write_tuner_register(0x05, 0x0F, 0xFA).unwrap();
        handle.write_tuner_register(0x05, 0x10, 0x10).unwrap();
        assert_eq!(handle.read_tuner_register(0x05).unwrap(), 0x1A);
    }

    #[test]
    fn cancel_before_read_does_not_end_next_read() {
        let spec = MockDeviceSpec::new("dongle").with_transfer_interval(Duration::ZERO);
        let driver = MockDriver::new(vec![spec]);
        let handle = driver.open(0).unwrap();
        handle.cancel_async().unwrap();

        let mut delivered = 0;
        let mut callback = |_: &[u8]| {
            delivered += 1;
            if delivered == 3 {
                let _ = handle.cancel_async();
            }
        };
        handle.read_async(&mut callback, 512).unwrap();
        assert_eq!(delivered, 3);
    }

    #[test]
    fn offset_quirk_never_echoes() {
        let spec = MockDeviceSpec::new("dongle").with_tune_quirk(TuneQuirk::Offset(-3));
        let driver = MockDriver::new(vec![spec]);
        let handle = driver.open(0).unwrap();
        handle.set_center_freq(100_000_000).unwrap();
        assert_eq!(handle.center_freq(), 99_999_997);
    }

    #[test]
    fn tone_is_interleaved_pairs() {
        let tone = tone_cu8(4);
        assert_eq!(tone.len(), 8);
        assert_eq!(tone[0], 254);
        assert_eq!(tone[1], 127);
    }
}
