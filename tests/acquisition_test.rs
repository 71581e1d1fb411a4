//! Integration tests for acquisition lifecycle and sample delivery

mod helpers;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use approx::assert_relative_eq;
use num_complex::Complex;
use rtlsdr_source::mock::{MockCall, MockDeviceSpec};
use rtlsdr_source::{Error, SessionPhase, convert_cu8, transfer_size};

#[test]
fn test_samples_follow_conversion_law() {
    let payload = helpers::generate_dc_signal_cu8(1, 200, 60);
    let (_, source) = helpers::selected_dongle(MockDeviceSpec::new("dongle").with_payload(payload));
    source.session().set_sample_rate(250_000).unwrap();

    let mut reader = source.reader();
    assert_eq!(source.start().unwrap(), 1024);

    let samples = helpers::next_buffer(&mut reader);
    assert_eq!(samples.len(), 512);
    for s in &samples {
        assert_relative_eq!(s.re, 0.567_187_5, epsilon = 1e-6);
        assert_relative_eq!(s.im, -0.526_562_5, epsilon = 1e-6);
    }
    source.stop();
}

#[test]
fn test_sine_payload_is_delivered_unchanged() {
    // 64 samples divide the 5120-byte transfer evenly
    let payload = helpers::generate_sine_wave_cu8(1_000.0, 64_000, 64);
    let (_, source) = helpers::selected_dongle(
        MockDeviceSpec::new("dongle").with_payload(payload.clone()),
    );
    source.session().set_sample_rate(1_024_000).unwrap();

    let mut reader = source.reader();
    source.start().unwrap();
    let samples = helpers::next_buffer(&mut reader);
    source.stop();

    let raw: Vec<u8> = payload.iter().copied().cycle().take(5120).collect();
    let mut expected = vec![Complex::<f32>::default(); 2560];
    assert_eq!(convert_cu8(&raw, &mut expected), 2560);
    assert_eq!(samples, expected);
}

#[test]
fn test_restart_uses_same_transfer_size() {
    let (driver, source) = helpers::selected_dongle(MockDeviceSpec::new("dongle"));
    source.session().set_sample_rate(2_048_000).unwrap();

    let first = source.start().unwrap();
    source.stop();
    let second = source.start().unwrap();
    source.stop();

    assert_eq!(first, transfer_size(2_048_000));
    assert_eq!(first, second);
    let reads = driver
        .device(0)
        .unwrap()
        .count_calls(|c| *c == MockCall::ReadAsync(first));
    assert_eq!(reads, 2);
}

#[test]
fn test_start_twice_is_rejected() {
    let (_, source) = helpers::selected_dongle(MockDeviceSpec::new("dongle"));
    source.start().unwrap();
    assert!(matches!(source.start(), Err(Error::AlreadyRunning)));
    source.stop();
    source.stop();
    assert!(!source.is_running());
}

#[test]
fn test_stop_with_idle_consumer_returns() {
    let (_, source) = helpers::selected_dongle(MockDeviceSpec::new("dongle"));
    source.start().unwrap();
    // nobody reads: the producer ends up blocked waiting for a free slot
    thread::sleep(Duration::from_millis(50));
    source.stop();
    assert!(!source.is_running());
}

#[test]
fn test_close_while_running_releases_device() {
    let (driver, source) = helpers::selected_dongle(MockDeviceSpec::new("dongle"));
    let mut reader = source.reader();
    source.start().unwrap();
    helpers::next_buffer(&mut reader);

    source.session().close();
    assert_eq!(source.session().phase(), SessionPhase::Closed);
    assert!(!source.is_running());
    assert!(!driver.device(0).unwrap().is_open());

    source.session().close();
    assert_eq!(source.session().phase(), SessionPhase::Closed);
}

#[test]
fn test_parameter_changes_during_acquisition() {
    let (driver, source) = helpers::selected_dongle(MockDeviceSpec::new("dongle"));
    let mut reader = source.reader();
    source.start().unwrap();

    for index in [3, 10, 28] {
        source.session().set_gain_index(index).unwrap();
        helpers::next_buffer(&mut reader);
    }
    source.tune(162_000_000);
    helpers::next_buffer(&mut reader);
    source.stop();

    let device = driver.device(0).unwrap();
    assert!(device.calls().contains(&MockCall::SetTunerGain(496)));
    assert!(device.calls().contains(&MockCall::SetCenterFreq(162_000_000)));
}

#[test]
fn test_read_registration_failure_leaves_worker_stopped() {
    let (_, source) =
        helpers::selected_dongle(MockDeviceSpec::new("dongle").failing_read_async());
    assert!(matches!(source.start(), Err(Error::Driver(_))));
    assert!(!source.is_running());
    assert!(source.session().is_open());
}

#[test]
fn test_rapid_stop_start_keeps_streaming() {
    let (driver, source) = helpers::selected_dongle(
        MockDeviceSpec::new("dongle").with_transfer_interval(Duration::ZERO),
    );
    let mut reader = source.reader();

    for _ in 0..50 {
        source.start().unwrap();
        helpers::next_buffer(&mut reader);
        assert!(source.is_running());
        source.stop();
        assert!(!source.is_running());
        // leftovers from this run must not count for the next one
        while reader.read_timeout(Duration::ZERO).is_some() {}
    }

    let reads = driver
        .device(0)
        .unwrap()
        .count_calls(|c| matches!(c, MockCall::ReadAsync(_)));
    assert_eq!(reads, 50);
}

#[test]
fn test_no_register_writes_after_close() {
    let (driver, source) = helpers::selected_dongle(MockDeviceSpec::new("dongle"));
    let source = Arc::new(source);
    let device = driver.device(0).unwrap();
    source.start().unwrap();

    let done = Arc::new(AtomicBool::new(false));
    let setter = {
        let source = Arc::clone(&source);
        let done = Arc::clone(&done);
        thread::spawn(move || {
            let mut step = 0;
            while !done.load(Ordering::SeqCst) {
                let session = source.session();
                let _ = session.set_ppm(step % 50);
                let _ = session.set_gain_index(step as usize % 29);
                let _ = session.set_bias_tee(step % 2 == 0);
                step += 1;
            }
        })
    };

    thread::sleep(Duration::from_millis(30));
    source.session().close();
    let calls_at_close = device.calls().len();
    thread::sleep(Duration::from_millis(30));
    done.store(true, Ordering::SeqCst);
    setter.join().unwrap();

    assert_eq!(device.calls().len(), calls_at_close);
    assert!(!device.is_open());
    assert!(!source.is_running());
    assert_eq!(source.session().phase(), SessionPhase::Closed);
}

#[test]
fn test_late_read_failure_stops_worker() {
    // fails after start has stopped waiting for the registration
    let (_, source) = helpers::selected_dongle(
        MockDeviceSpec::new("dongle").failing_read_async_after(Duration::from_millis(400)),
    );
    source.start().unwrap();

    thread::sleep(Duration::from_millis(700));
    assert!(!source.is_running());
    assert_eq!(source.session().transfer_size(), None);

    // the dead acquisition does not block a new start
    source.start().unwrap();
    source.stop();
    assert!(!source.is_running());
}

#[test]
fn test_start_without_device() {
    let (_, source) = helpers::mock_source(Vec::new());
    assert!(source.refresh().is_empty());
    assert_eq!(source.select_first().unwrap(), None);
    assert!(matches!(source.start(), Err(Error::NoDeviceSelected)));
}
