//! Onset detection for calibration clicks.

use serde::Serialize;

pub const DEFAULT_THRESHOLD_RATIO: f64 = 0.6;

/// First strong onset in a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Transient {
    /// Sample index of the onset
    pub index: usize,
    /// Absolute peak of the whole stream
    pub peak: u32,
}

/// Index of the first sample whose magnitude reaches `ratio` of the stream's
/// absolute peak. A silent (or empty) stream reports index 0.
///
/// Magnitudes are taken in `i32` so `i16::MIN` counts as 32768.
pub fn detect_transient(samples: &[i16], ratio: f64) -> Transient {
    let peak = samples
        .iter()
        .map(|&s| (s as i32).unsigned_abs())
        .max()
        .unwrap_or(0);

    if peak == 0 {
        return Transient { index: 0, peak };
    }

    // absorb the rounding of ratio * peak so a sample exactly on the
    // threshold still counts; magnitudes are integers, so nothing below slips in
    let threshold = ratio * peak as f64 - f64::EPSILON * peak as f64;
    let index = samples
        .iter()
        .position(|&s| (s as i32).unsigned_abs() as f64 >= threshold)
        .unwrap_or(0);

    Transient { index, peak }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_finds_first_sample_over_threshold() {
        let samples = [0, 10, -200, 500, 1000, 300];
        let transient = detect_transient(&samples, 0.6);
        assert_eq!(transient.peak, 1000);
        assert_eq!(transient.index, 4);

        // 0.5 * 1000 = 500 is reached at index 3
        assert_eq!(detect_transient(&samples, 0.5).index, 3);
    }

    #[test]
    fn test_negative_peak_counts() {
        let samples = [0, 0, -30000, 100];
        assert_eq!(detect_transient(&samples, 0.6).index, 2);
    }

    #[test]
    fn test_i16_min_does_not_overflow() {
        let samples = [0, 20000, i16::MIN];
        let transient = detect_transient(&samples, 0.6);
        assert_eq!(transient.peak, 32768);
        // 0.6 * 32768 = 19660.8
        assert_eq!(transient.index, 1);
    }

    #[test]
    fn test_sample_on_threshold_counts() {
        assert_eq!(
            detect_transient(&[0, 600, 0, 1000], DEFAULT_THRESHOLD_RATIO).index,
            1
        );
        assert_eq!(detect_transient(&[0, 599, 0, 1000], DEFAULT_THRESHOLD_RATIO).index, 3);
        assert_eq!(detect_transient(&[-18, 30], DEFAULT_THRESHOLD_RATIO).index, 0);
        assert_eq!(detect_transient(&[7, 0, -10], 0.7).index, 0);
    }

    #[test]
    fn test_silence_reports_zero() {
        assert_eq!(detect_transient(&[0; 64], 0.6).index, 0);
        assert_eq!(detect_transient(&[], 0.6), Transient { index: 0, peak: 0 });
    }
}
