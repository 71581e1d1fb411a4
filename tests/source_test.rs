//! Integration tests for device selection, tuning and persisted settings

mod helpers;

use rtlsdr_source::mock::{MockCall, MockDeviceSpec, TuneQuirk};
use rtlsdr_source::session::TUNE_ATTEMPTS;
use rtlsdr_source::{ConfigStore, ControlMode, DirectSampling, Error, SessionPhase};

#[test]
fn test_select_by_name_falls_back_to_first() {
    let (_, source) = helpers::mock_source(vec![
        MockDeviceSpec::new("dongle").with_serial("A"),
        MockDeviceSpec::new("dongle").with_serial("B"),
    ]);

    let chosen = source.select_by_name("[B] dongle #1").unwrap().unwrap();
    assert_eq!(chosen.index, 1);

    let fallback = source.select_by_name("[C] dongle #7").unwrap().unwrap();
    assert_eq!(fallback.index, 0);
    assert_eq!(source.selected(), Some(fallback));
}

#[test]
fn test_switching_devices_releases_previous() {
    let (driver, source) = helpers::mock_source(vec![
        MockDeviceSpec::new("dongle"),
        MockDeviceSpec::new("dongle"),
    ]);
    source.select_by_index(0).unwrap();
    source.select_by_index(1).unwrap();

    assert!(!driver.device(0).unwrap().is_open());
    assert!(driver.device(1).unwrap().is_open());
    assert!(matches!(
        source.select_by_index(2),
        Err(Error::DeviceNotFound(_))
    ));
}

#[test]
fn test_busy_device_stays_unselected() {
    let (_, source) = helpers::mock_source(vec![MockDeviceSpec::new("dongle").busy()]);
    assert!(matches!(source.select_first(), Err(Error::DeviceBusy(_))));
    assert_eq!(source.session().phase(), SessionPhase::Closed);
    assert!(matches!(source.start(), Err(Error::NoDeviceSelected)));
}

#[test]
fn test_tune_gives_up_after_bounded_attempts() {
    let (driver, source) = helpers::selected_dongle(
        MockDeviceSpec::new("dongle").with_tune_quirk(TuneQuirk::Offset(-2)),
    );
    let device = driver.device(0).unwrap();
    let before = device.freq_writes();

    let report = source.tune(1_090_000_000);
    assert_eq!(report.attempts, TUNE_ATTEMPTS);
    assert!(!report.converged);
    assert_eq!(report.actual, 1_089_999_998);
    assert!(report.reconciliation_warning());
    assert_eq!(device.freq_writes() - before, TUNE_ATTEMPTS);
}

#[test]
fn test_tune_exact_hardware_needs_one_write() {
    let (driver, source) = helpers::selected_dongle(MockDeviceSpec::new("dongle"));
    let report = source.tune(433_920_000);
    assert_eq!(report.attempts, 1);
    assert!(report.converged);
    assert!(!report.reconciliation_warning());
    assert_eq!(
        driver.device(0).unwrap().calls().last(),
        Some(&MockCall::SetCenterFreq(433_920_000))
    );
}

#[test]
fn test_gain_index_clamped_when_table_shrinks() {
    let (driver, source) = helpers::selected_dongle(MockDeviceSpec::new("dongle"));
    source.session().set_gain_index(20).unwrap();

    source.session().close();
    driver.device(0).unwrap().set_gains(vec![40, 0, 30, 10, 20]);
    source.select_first().unwrap();

    let session = source.session();
    assert_eq!(session.gain_table(), vec![0, 10, 20, 30, 40]);
    assert_eq!(session.params().gain_index, 4);
    assert_eq!(session.gain(), Some(40));
}

#[test]
fn test_empty_gain_table_opens() {
    let (_, source) =
        helpers::selected_dongle(MockDeviceSpec::new("dongle").with_gains(Vec::new()));
    assert!(source.session().is_open());
    assert_eq!(source.session().params().gain_index, 0);
    assert_eq!(source.session().gain(), None);
}

#[test]
fn test_settings_persist_across_sources() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("rtl_sdr_config.json");
    let specs = || vec![MockDeviceSpec::new("dongle").with_serial("0042")];

    {
        let config = ConfigStore::load(&path).unwrap();
        let (_, source) = helpers::mock_source_with_config(specs(), config);
        source.select_first().unwrap();
        let session = source.session();
        session.set_sample_rate(1_024_000).unwrap();
        session.set_ppm(-3).unwrap();
        session.set_bias_tee(true).unwrap();
        session.set_control_mode(ControlMode::Manual).unwrap();
        session.set_direct_sampling(DirectSampling::QBranch).unwrap();
    }

    let stored = ConfigStore::load(&path).unwrap().snapshot();
    assert_eq!(stored.device, "[0042] dongle #0");
    let settings = &stored.devices["[0042] dongle #0"];
    assert_eq!(settings.sample_rate, 1_024_000);
    assert_eq!(settings.ppm, -3);
    assert!(settings.bias_tee);
    assert_eq!(settings.direct_sampling, DirectSampling::QBranch);

    let config = ConfigStore::load(&path).unwrap();
    let (driver, source) = helpers::mock_source_with_config(specs(), config);
    source.select_saved().unwrap().unwrap();
    let params = source.session().params();
    assert_eq!(params.sample_rate, 1_024_000);
    assert_eq!(params.ppm, -3);
    assert_eq!(params.control_mode, ControlMode::Manual);
    assert_eq!(params.direct_sampling, DirectSampling::Disabled);

    let calls = driver.device(0).unwrap().calls();
    assert!(calls.contains(&MockCall::SetSampleRate(1_024_000)));
    assert!(calls.contains(&MockCall::SetDirectSampling(DirectSampling::Disabled)));
}

#[test]
fn test_non_standard_stored_rate_is_ignored() {
    let config = ConfigStore::in_memory();
    config
        .update_device("[No Serial] dongle #0", |s| s.sample_rate = 3_000_000)
        .unwrap();
    let (_, source) =
        helpers::mock_source_with_config(vec![MockDeviceSpec::new("dongle")], config);
    source.select_first().unwrap();
    assert_eq!(source.session().params().sample_rate, 2_400_000);
}
