//! Test helpers: synthetic Cu8 payloads and mock-backed sources
#![allow(dead_code)]

use std::f32::consts::PI;
use std::sync::Arc;
use std::time::Duration;

use num_complex::Complex;
use rtlsdr_source::mock::{MockDeviceSpec, MockDriver};
use rtlsdr_source::{ConfigStore, RtlSdrSource, StreamReader};

/// Complex sine wave as interleaved unsigned 8-bit I/Q bytes
///
/// # Arguments
/// * `frequency` - Frequency in Hz
/// * `sample_rate` - Sample rate in Hz
/// * `num_samples` - Number of samples to generate
pub fn generate_sine_wave_cu8(frequency: f32, sample_rate: u32, num_samples: usize) -> Vec<u8> {
    let angular_freq = 2.0 * PI * frequency / sample_rate as f32;
    (0..num_samples)
        .flat_map(|n| {
            let phase = angular_freq * n as f32;
            [
                ((phase.cos() + 1.0) * 127.5) as u8,
                ((phase.sin() + 1.0) * 127.5) as u8,
            ]
        })
        .collect()
}

/// Constant I/Q bytes
pub fn generate_dc_signal_cu8(num_samples: usize, i_byte: u8, q_byte: u8) -> Vec<u8> {
    [i_byte, q_byte].repeat(num_samples)
}

/// A source over mock devices with an in-memory configuration
pub fn mock_source(specs: Vec<MockDeviceSpec>) -> (Arc<MockDriver>, RtlSdrSource) {
    mock_source_with_config(specs, ConfigStore::in_memory())
}

pub fn mock_source_with_config(
    specs: Vec<MockDeviceSpec>,
    config: ConfigStore,
) -> (Arc<MockDriver>, RtlSdrSource) {
    let driver = Arc::new(MockDriver::new(specs));
    let source = RtlSdrSource::new(driver.clone(), Arc::new(config));
    source.refresh();
    (driver, source)
}

/// A single selected mock dongle
pub fn selected_dongle(spec: MockDeviceSpec) -> (Arc<MockDriver>, RtlSdrSource) {
    let (driver, source) = mock_source(vec![spec]);
    source
        .select_first()
        .expect("select failed")
        .expect("no device");
    (driver, source)
}

/// Next published buffer, failing the test after two seconds
pub fn next_buffer(reader: &mut StreamReader<Complex<f32>>) -> Vec<Complex<f32>> {
    reader
        .read_timeout(Duration::from_secs(2))
        .expect("no samples within 2 s")
        .to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_sine_wave_cu8_length() {
        let samples = generate_sine_wave_cu8(1000.0, 96000, 100);
        assert_eq!(samples.len(), 200); // 100 samples * 2 bytes per sample
    }

    #[test]
    fn test_generate_dc_signal_cu8() {
        let samples = generate_dc_signal_cu8(50, 200, 60);
        assert_eq!(samples.len(), 100);
        assert!(samples.chunks(2).all(|pair| pair == [200, 60]));
    }
}
