//! Host reference computation and exact result comparison.

use tracing::{debug, warn};

use crate::error::{BenchError, Result};
use crate::timer::Stopwatch;

/// `a[i] + b[i]` computed on the host, repeated `repetitions` times (at least
/// once) for timing comparison. Returns the result and the per-repetition laps.
pub fn host_aplusb(a: &[f32], b: &[f32], repetitions: usize) -> (Vec<f32>, Vec<f64>) {
    let mut out = vec![0.0f32; a.len().min(b.len())];
    let mut stopwatch = Stopwatch::start();
    for _ in 0..repetitions.max(1) {
        for ((dst, x), y) in out.iter_mut().zip(a).zip(b) {
            *dst = x + y;
        }
        stopwatch.lap();
    }
    debug!(elements = out.len(), repetitions, "host reference computed");
    (out, stopwatch.into_laps())
}

/// Require bitwise-equal values at every index.
pub fn verify(device: &[f32], host: &[f32]) -> Result<()> {
    if device.len() != host.len() {
        return Err(BenchError::InvalidConfig(format!(
            "device produced {} element(s), host reference has {}",
            device.len(),
            host.len()
        )));
    }

    let mut mismatches = device
        .iter()
        .zip(host)
        .enumerate()
        .filter(|(_, (d, h))| d.to_bits() != h.to_bits());

    let Some((index, (&device_value, &host_value))) = mismatches.next() else {
        debug!(elements = host.len(), "device results match host reference");
        return Ok(());
    };
    let count = 1 + mismatches.count();
    warn!(index, count, "device results differ from host reference");
    Err(BenchError::ResultMismatch {
        index,
        device: device_value,
        host: host_value,
        mismatches: count,
    })
}
