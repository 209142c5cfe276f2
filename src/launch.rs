//! Kernel dispatch and timed repetition.

use tracing::{debug, info};

use crate::cl_check;
use crate::error::{BenchError, Result};
use crate::session::{bytes_f32, Owned, ResourceSession};
use crate::timer::Stopwatch;

/// Smallest multiple of `work_group_size` that covers `elements`.
///
/// Items past `elements` are padding; the kernel bounds-checks them.
pub fn global_work_size(elements: usize, work_group_size: usize) -> Result<usize> {
    if elements == 0 || work_group_size == 0 {
        return Err(BenchError::InvalidConfig(format!(
            "element count ({elements}) and work-group size ({work_group_size}) must be positive"
        )));
    }
    elements
        .div_ceil(work_group_size)
        .checked_mul(work_group_size)
        .ok_or_else(|| {
            BenchError::InvalidConfig(format!(
                "grid for {elements} elements with work-group size {work_group_size} overflows"
            ))
        })
}

/// Dispatch the session kernel `repetitions` times, timing each dispatch from
/// enqueue to completion. Any failure aborts the run; no partial sample set
/// is returned.
pub fn launch(session: &ResourceSession<'_>, work_group_size: usize, repetitions: usize) -> Result<Vec<f64>> {
    let global_size = global_work_size(session.elements(), work_group_size)?;
    let rt = session.runtime();
    info!(
        elements = session.elements(),
        work_group_size,
        global_size,
        repetitions,
        "launching kernel"
    );

    let mut stopwatch = Stopwatch::start();
    for iteration in 0..repetitions {
        stopwatch.reset_lap();
        let event = Owned::new(
            rt,
            cl_check!(rt.enqueue_kernel(session.queue(), session.kernel(), global_size, work_group_size))?,
        );
        cl_check!(rt.wait_event(event.get()))?;
        let elapsed = stopwatch.lap();
        event.release()?;
        debug!(iteration, elapsed_us = elapsed.as_micros() as u64, "kernel dispatch complete");
    }
    Ok(stopwatch.into_laps())
}

/// Time `repetitions` blocking device-to-host copies of the output buffer
/// into one preallocated host buffer. Returns the laps together with the
/// last copy.
pub fn measure_transfer(session: &ResourceSession<'_>, repetitions: usize) -> Result<(Vec<f64>, Vec<f32>)> {
    let mut bytes = vec![0u8; session.output_bytes()];
    let mut stopwatch = Stopwatch::start();
    for _ in 0..repetitions {
        stopwatch.reset_lap();
        session.read_output_into(&mut bytes)?;
        stopwatch.lap();
    }
    if repetitions == 0 {
        session.read_output_into(&mut bytes)?;
    }
    debug!(repetitions, "device-to-host transfer measured");
    Ok((stopwatch.into_laps(), bytes_f32(&bytes)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::enumerate;
    use crate::runtime::host::{Call, HostRuntime, ObjectKind};
    use crate::runtime::status;
    use crate::session::SessionOptions;
    use crate::source::{KernelSource, DEFAULT_KERNEL_PATH};
    use std::path::Path;
    use std::time::Duration;

    #[test]
    fn test_grid_is_rounded_up_to_work_group_multiple() {
        assert_eq!(global_work_size(100_000_000, 128).unwrap(), 100_000_064);
        assert_eq!(global_work_size(128, 128).unwrap(), 128);
        assert_eq!(global_work_size(1, 128).unwrap(), 128);
        assert_eq!(global_work_size(129, 128).unwrap(), 256);
        assert_eq!(global_work_size(7, 1).unwrap(), 7);
    }

    #[test]
    fn test_grid_rejects_zero() {
        assert!(global_work_size(0, 128).is_err());
        assert!(global_work_size(10, 0).is_err());
    }

    fn with_session<F: FnOnce(&HostRuntime, &ResourceSession<'_>)>(rt: &HostRuntime, body: F) {
        let dev = enumerate(rt).unwrap().devices.remove(0);
        let source = KernelSource::load(Path::new(DEFAULT_KERNEL_PATH)).unwrap();
        let a: Vec<f32> = (0..300).map(|i| i as f32).collect();
        let b: Vec<f32> = (0..300).map(|i| (2 * i) as f32).collect();
        let session = ResourceSession::create(rt, &dev, &source, &a, &b, &SessionOptions::default()).unwrap();
        body(rt, &session);
        session.close().unwrap();
    }

    #[test]
    fn test_launch_records_one_lap_per_repetition() {
        let rt = HostRuntime::new();
        with_session(&rt, |rt, session| {
            let laps = launch(session, 128, 7).unwrap();
            assert_eq!(laps.len(), 7);
            assert_eq!(rt.live_objects_of(ObjectKind::Event), 0);
            let (transfer, output) = measure_transfer(session, 3).unwrap();
            assert_eq!(transfer.len(), 3);
            assert_eq!(output[299], 897.0);
        });
        assert_eq!(rt.live_objects(), 0);
    }

    #[test]
    fn test_dispatch_lap_covers_enqueue_to_completion_only() {
        let rt = HostRuntime::new();
        with_session(&rt, |rt, session| {
            let latency = Duration::from_millis(40);
            rt.inject_latency(Call::ReleaseEvent, latency);
            let laps = launch(session, 128, 3).unwrap();
            assert!(laps.iter().all(|&t| t < latency.as_secs_f64()), "{laps:?}");

            rt.inject_latency(Call::ReleaseEvent, Duration::ZERO);
            rt.inject_latency(Call::WaitEvent, latency);
            let laps = launch(session, 128, 3).unwrap();
            assert!(laps.iter().all(|&t| t >= latency.as_secs_f64()), "{laps:?}");
        });
    }

    #[test]
    fn test_transfer_without_repetitions_still_copies() {
        let rt = HostRuntime::new();
        with_session(&rt, |_, session| {
            launch(session, 64, 1).unwrap();
            let (laps, output) = measure_transfer(session, 0).unwrap();
            assert!(laps.is_empty());
            assert_eq!(output.len(), 300);
            assert_eq!(output[10], 30.0);
        });
    }

    #[test]
    fn test_transfer_lap_covers_copy_only() {
        let rt = HostRuntime::new();
        with_session(&rt, |rt, session| {
            launch(session, 64, 1).unwrap();
            let latency = Duration::from_millis(20);
            rt.inject_latency(Call::ReadBuffer, latency);
            let (laps, output) = measure_transfer(session, 3).unwrap();
            assert_eq!(laps.len(), 3);
            assert!(laps.iter().all(|&t| t >= latency.as_secs_f64()), "{laps:?}");
            assert_eq!(output[299], 897.0);
        });
    }

    #[test]
    fn test_failed_dispatch_aborts_run() {
        let rt = HostRuntime::new();
        with_session(&rt, |rt, session| {
            rt.inject_fault_after(Call::EnqueueKernel, 2, status::OUT_OF_RESOURCES);
            let err = launch(session, 128, 5).unwrap_err();
            assert!(matches!(
                err,
                BenchError::Accelerator {
                    code: status::OUT_OF_RESOURCES,
                    ..
                }
            ));
            rt.clear_faults();
        });
    }

    #[test]
    fn test_failed_wait_still_releases_event() {
        let rt = HostRuntime::new();
        with_session(&rt, |rt, session| {
            rt.inject_fault(Call::WaitEvent, status::INVALID_EVENT);
            assert!(launch(session, 64, 2).is_err());
            assert_eq!(rt.live_objects_of(ObjectKind::Event), 0);
            rt.clear_faults();
        });
    }
}
