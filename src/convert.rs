//! Unsigned 8-bit interleaved I/Q to complex float conversion

use num_complex::Complex;

/// ADC mid-scale. Slightly below 127.5 to cancel the RTL2832U DC bias.
pub const CU8_DC_OFFSET: f64 = 127.4;

/// Full-scale divisor
pub const CU8_SCALE: f64 = 128.0;

/// Convert interleaved `I, Q, I, Q, ...` bytes into complex samples.
///
/// Writes `src.len() / 2` samples into the front of `dst` and returns that
/// count. A trailing odd byte is ignored. The arithmetic is done in `f64`
/// and rounded once to `f32` so consumers get bit-identical values.
///
/// # Panics
///
/// Panics if `dst` holds fewer than `src.len() / 2` samples.
pub fn convert_cu8(src: &[u8], dst: &mut [Complex<f32>]) -> usize {
    let count = src.len() / 2;
    for (out, pair) in dst[..count].iter_mut().zip(src.chunks_exact(2)) {
        *out = Complex::new(normalize(pair[0]), normalize(pair[1]));
    }
    count
}

#[inline]
fn normalize(byte: u8) -> f32 {
    ((byte as f64 - CU8_DC_OFFSET) / CU8_SCALE) as f32
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_reference_values() {
        let src = [127u8, 127, 0, 255];
        let mut dst = [Complex::new(0.0f32, 0.0); 2];

        assert_eq!(convert_cu8(&src, &mut dst), 2);

        assert_relative_eq!(dst[0].re, -0.003125, epsilon = 1e-7);
        assert_relative_eq!(dst[0].im, -0.003125, epsilon = 1e-7);
        assert_relative_eq!(dst[1].re, -0.9953125, epsilon = 1e-7);
        assert_relative_eq!(dst[1].im, 0.996875, epsilon = 1e-7);
    }

    #[test]
    fn test_bit_exact_against_double_arithmetic() {
        let src: Vec<u8> = (0..=255u8).flat_map(|b| [b, 255 - b]).collect();
        let mut dst = vec![Complex::new(0.0f32, 0.0); 256];

        convert_cu8(&src, &mut dst);

        for (b, sample) in dst.iter().enumerate() {
            let expected_re = ((b as f64 - 127.4) / 128.0) as f32;
            let expected_im = (((255 - b) as f64 - 127.4) / 128.0) as f32;
            assert_eq!(sample.re.to_bits(), expected_re.to_bits());
            assert_eq!(sample.im.to_bits(), expected_im.to_bits());
        }
    }

    #[test]
    fn test_odd_trailing_byte_ignored() {
        let src = [128u8, 128, 7];
        let mut dst = [Complex::new(9.0f32, 9.0); 2];

        assert_eq!(convert_cu8(&src, &mut dst), 1);
        assert_relative_eq!(dst[0].re, 0.6 / 128.0, epsilon = 1e-7);
        // untouched beyond the converted count
        assert_eq!(dst[1], Complex::new(9.0, 9.0));
    }

    #[test]
    fn test_empty_input() {
        let mut dst: [Complex<f32>; 0] = [];
        assert_eq!(convert_cu8(&[], &mut dst), 0);
    }
}
