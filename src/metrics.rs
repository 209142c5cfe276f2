//! Filtered timing statistics and derived throughput/bandwidth.

use serde::Serialize;

use crate::error::{BenchError, Result};

/// Bytes per element of the benchmarked arrays (`f32`).
pub const ELEMENT_BYTES: usize = std::mem::size_of::<f32>();

/// Arrays touched per element by the elementwise kernel: two reads, one write.
pub const KERNEL_ARRAYS: usize = 3;

/// Arrays touched per element by a device-to-host copy.
pub const TRANSFER_ARRAYS: usize = 1;

/// Mean and population standard deviation over the 20th..80th percentile
/// window of a sorted sample set, in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct FilteredStatistic {
    pub mean: f64,
    pub stddev: f64,
    /// Samples inside the window.
    pub used: usize,
    /// Samples recorded.
    pub total: usize,
}

impl FilteredStatistic {
    pub fn from_laps(laps: &[f64]) -> Result<Self> {
        if laps.is_empty() {
            return Err(BenchError::NoSamples);
        }
        let mut sorted = laps.to_vec();
        sorted.sort_by(f64::total_cmp);

        let total = sorted.len();
        let from = total * 20 / 100;
        let window = &sorted[from..total - from];

        let used = window.len();
        let mean = window.iter().sum::<f64>() / used as f64;
        let variance = window.iter().map(|t| (t - mean).powi(2)).sum::<f64>() / used as f64;
        Ok(Self {
            mean,
            stddev: variance.sqrt(),
            used,
            total,
        })
    }
}

/// Timing statistic plus the figures derived from it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BenchmarkResult {
    pub time: FilteredStatistic,
    /// Elements per second, in units of 10^9.
    pub throughput_gops: f64,
    /// Bytes moved per second, in units of 2^30.
    pub bandwidth_gib_s: f64,
}

impl BenchmarkResult {
    /// Derive figures for `elements` items touching `arrays` arrays of
    /// [`ELEMENT_BYTES`] each per sample.
    pub fn from_laps(laps: &[f64], elements: usize, arrays: usize) -> Result<Self> {
        let time = FilteredStatistic::from_laps(laps)?;
        let elements = elements as f64;
        let (throughput_gops, bandwidth_gib_s) = if time.mean > 0.0 {
            (
                elements / time.mean / 1e9,
                (arrays * ELEMENT_BYTES) as f64 * elements / time.mean / (1u64 << 30) as f64,
            )
        } else {
            (f64::INFINITY, f64::INFINITY)
        };
        Ok(Self {
            time,
            throughput_gops,
            bandwidth_gib_s,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_drops_outliers() {
        let laps = [9.0, 1.0, 2.0, 2.0, 2.0, 2.0, 2.0, 2.0, 2.0, 0.1];
        let stat = FilteredStatistic::from_laps(&laps).unwrap();
        assert_eq!(stat.total, 10);
        assert_eq!(stat.used, 6);
        assert_eq!(stat.mean, 2.0);
        assert_eq!(stat.stddev, 0.0);
    }

    #[test]
    fn test_window_is_smaller_than_sample_set_from_five() {
        for r in 5..40 {
            let laps: Vec<f64> = (0..r).map(|i| ((i * 7919) % 31) as f64 + 0.5).collect();
            let stat = FilteredStatistic::from_laps(&laps).unwrap();
            let min = laps.iter().copied().fold(f64::INFINITY, f64::min);
            let max = laps.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            assert!(stat.used < r, "r={r}");
            assert!(stat.mean >= min && stat.mean <= max, "r={r}");
        }
    }

    #[test]
    fn test_small_sample_sets_use_everything() {
        let stat = FilteredStatistic::from_laps(&[1.0, 3.0]).unwrap();
        assert_eq!(stat.used, 2);
        assert_eq!(stat.mean, 2.0);
        assert_eq!(stat.stddev, 1.0);
    }

    #[test]
    fn test_empty_laps_fail() {
        assert!(matches!(
            FilteredStatistic::from_laps(&[]),
            Err(BenchError::NoSamples)
        ));
    }

    #[test]
    fn test_kernel_and_transfer_figures() {
        let laps = [0.5; 5];
        let kernel = BenchmarkResult::from_laps(&laps, 1 << 28, KERNEL_ARRAYS).unwrap();
        // 2^28 elements in 0.5s
        assert!((kernel.throughput_gops - (1u64 << 28) as f64 / 0.5 / 1e9).abs() < 1e-9);
        // 3 arrays * 4 bytes * 2^28 = 3 GiB per 0.5s
        assert!((kernel.bandwidth_gib_s - 6.0).abs() < 1e-9);

        let transfer = BenchmarkResult::from_laps(&laps, 1 << 28, TRANSFER_ARRAYS).unwrap();
        assert!((transfer.bandwidth_gib_s - 2.0).abs() < 1e-9);
    }
}
