//! Acquisition worker
//!
//! Runs the driver's blocking asynchronous read on a dedicated thread,
//! converts each delivered transfer into complex samples and publishes it
//! on the [`SampleStream`]. The worker is the only writer of that stream.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam::channel::{self, RecvTimeoutError, SendError, Sender};
use num_complex::Complex;
use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, error, info, trace, warn};

use crate::convert::convert_cu8;
use crate::driver::RtlDevice;
use crate::error::{Error, Result};
use crate::stream::SampleStream;

/// Target number of transfer callbacks per second
pub const CALLBACKS_PER_SECOND: u32 = 200;

/// USB bulk transfer granularity in bytes
pub const TRANSFER_GRANULARITY: u32 = 512;

/// How long `start` waits for the read registration to fail before it
/// treats the acquisition as running
const REGISTRATION_GRACE: Duration = Duration::from_millis(250);

/// Transfer size in bytes for a sample rate: the rate divided into
/// [`CALLBACKS_PER_SECOND`] chunks, rounded to a whole number of
/// [`TRANSFER_GRANULARITY`] blocks (at least one block).
pub fn transfer_size(sample_rate: u32) -> u32 {
    let blocks = (sample_rate as f64 / (CALLBACKS_PER_SECOND * TRANSFER_GRANULARITY) as f64)
        .round() as u32;
    blocks.max(1) * TRANSFER_GRANULARITY
}

struct AcquisitionState {
    device: Arc<dyn RtlDevice>,
    thread: JoinHandle<()>,
    transfer_size: u32,
    cancel_requested: Arc<AtomicBool>,
    /// Cleared by the thread when the read returns
    alive: Arc<AtomicBool>,
}

impl AcquisitionState {
    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }
}

/// Owns the acquisition thread for one session
pub struct AcquisitionWorker {
    stream: Arc<SampleStream<Complex<f32>>>,
    state: Mutex<Option<AcquisitionState>>,
}

impl AcquisitionWorker {
    pub fn new(stream: Arc<SampleStream<Complex<f32>>>) -> Self {
        Self {
            stream,
            state: Mutex::new(None),
        }
    }

    pub fn stream(&self) -> &Arc<SampleStream<Complex<f32>>> {
        &self.stream
    }

    /// True while the acquisition thread is still reading. An acquisition
    /// whose read failed after `start` returned is not running.
    pub fn is_running(&self) -> bool {
        self.lock().as_ref().is_some_and(AcquisitionState::is_alive)
    }

    /// Transfer size of the running acquisition
    pub fn transfer_size(&self) -> Option<u32> {
        self.lock()
            .as_ref()
            .filter(|state| state.is_alive())
            .map(|state| state.transfer_size)
    }

    /// Start streaming from `device` at `sample_rate`.
    ///
    /// Returns the transfer size in bytes. Fails with
    /// [`Error::AlreadyRunning`] if a previous start was not stopped, or
    /// with the driver's error if the buffer reset or read registration
    /// fails, in which case no thread is left behind.
    pub fn start(&self, device: Arc<dyn RtlDevice>, sample_rate: u32) -> Result<u32> {
        let mut state = self.lock();
        match state.take() {
            Some(running) if running.is_alive() => {
                *state = Some(running);
                return Err(Error::AlreadyRunning);
            }
            Some(dead) => {
                debug!("Reaping acquisition thread that ended on its own");
                if dead.thread.join().is_err() {
                    error!("Acquisition thread panicked");
                }
            }
            None => {}
        }

        let size = transfer_size(sample_rate);
        let cancel_requested = Arc::new(AtomicBool::new(false));
        let alive = Arc::new(AtomicBool::new(true));
        let (tx_init, rx_init) = channel::bounded::<Result<()>>(1);

        let thread = {
            let device = Arc::clone(&device);
            let stream = Arc::clone(&self.stream);
            let cancel_requested = Arc::clone(&cancel_requested);
            let alive = Arc::clone(&alive);
            std::thread::Builder::new()
                .name("rtlsdr-acquisition".into())
                .spawn(move || {
                    run(device, stream, size, cancel_requested, tx_init);
                    alive.store(false, Ordering::SeqCst);
                })?
        };

        match rx_init.recv_timeout(REGISTRATION_GRACE) {
            Ok(Ok(())) | Err(RecvTimeoutError::Timeout) => {}
            Ok(Err(e)) => {
                let _ = thread.join();
                error!("Failed to start acquisition: {}", e);
                return Err(e);
            }
            Err(RecvTimeoutError::Disconnected) => {
                let _ = thread.join();
                error!("Acquisition thread exited during start");
                return Err(Error::driver("acquisition thread exited during start"));
            }
        }

        info!(
            "Acquisition started: {} Hz, {} byte transfers",
            sample_rate, size
        );
        *state = Some(AcquisitionState {
            device,
            thread,
            transfer_size: size,
            cancel_requested,
            alive,
        });
        Ok(size)
    }

    /// Stop streaming and wait for the acquisition thread to exit.
    ///
    /// Does nothing if not running. On return the device is no longer
    /// referenced by the worker.
    pub fn stop(&self) {
        let mut state = self.lock();
        let Some(acquisition) = state.take() else {
            return;
        };

        acquisition.cancel_requested.store(true, Ordering::SeqCst);
        self.stream.stop_writer();
        if acquisition.is_alive() {
            if let Err(e) = acquisition.device.cancel_async() {
                warn!("Failed to cancel asynchronous read: {}", e);
            }
        }
        if acquisition.thread.join().is_err() {
            error!("Acquisition thread panicked");
        }
        self.stream.clear_write_stop();
        info!("Acquisition stopped");
    }

    fn lock(&self) -> MutexGuard<'_, Option<AcquisitionState>> {
        self.state.lock()
    }
}

impl Drop for AcquisitionWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Hand a start-up failure to `start`, or log it if `start` already
/// stopped waiting
fn report_failure(tx: Sender<Result<()>>, e: Error) {
    if let Err(SendError(Err(e))) = tx.send(Err(e)) {
        error!("Asynchronous read failed after start: {}", e);
    }
}

fn run(
    device: Arc<dyn RtlDevice>,
    stream: Arc<SampleStream<Complex<f32>>>,
    size: u32,
    cancel_requested: Arc<AtomicBool>,
    tx_init: Sender<Result<()>>,
) {
    if let Err(e) = device.reset_buffer() {
        report_failure(tx_init, e);
        return;
    }

    let mut init = Some(tx_init);
    let mut writer = stream.writer();
    let mut transfers: u64 = 0;

    let mut callback = |raw: &[u8]| {
        if let Some(tx) = init.take() {
            let _ = tx.send(Ok(()));
        }
        // a cancel that raced the registration is re-issued from inside
        if cancel_requested.load(Ordering::SeqCst) {
            let _ = device.cancel_async();
            return;
        }
        let dst = writer.buffer(raw.len() / 2);
        let count = convert_cu8(&raw[..dst.len() * 2], dst);
        transfers += 1;
        if !writer.swap(count) {
            trace!("Stream stopped, dropped {} samples", count);
        }
    };

    let result = device.read_async(&mut callback, size);
    match result {
        Ok(()) => debug!("Asynchronous read returned after {} transfers", transfers),
        Err(e) => match init.take() {
            Some(tx) => report_failure(tx, e),
            None => error!("Asynchronous read failed: {}", e),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transfer_size_matches_rounding_law() {
        assert_eq!(transfer_size(250_000), 1024);
        assert_eq!(transfer_size(1_024_000), 5120);
        assert_eq!(transfer_size(2_048_000), 10240);
        assert_eq!(transfer_size(2_400_000), 11776);
        assert_eq!(transfer_size(3_200_000), 15872);
    }

    #[test]
    fn transfer_size_is_block_aligned_and_non_zero() {
        for rate in [1, 1_000, 51_199, 225_001, 900_001, 2_880_000] {
            let size = transfer_size(rate);
            assert!(size >= TRANSFER_GRANULARITY);
            assert_eq!(size % TRANSFER_GRANULARITY, 0);
        }
    }

    #[test]
    fn transfer_size_is_deterministic() {
        assert_eq!(transfer_size(1_920_000), transfer_size(1_920_000));
    }
}
