//! Lap stopwatch for repeated measurements.

use std::time::{Duration, Instant};

/// Records the elapsed time of consecutive laps, in seconds.
#[derive(Debug, Clone)]
pub struct Stopwatch {
    lap_start: Instant,
    laps: Vec<f64>,
}

impl Default for Stopwatch {
    fn default() -> Self {
        Self::start()
    }
}

impl Stopwatch {
    pub fn start() -> Self {
        Self {
            lap_start: Instant::now(),
            laps: Vec::new(),
        }
    }

    /// Drop recorded laps and begin a new first lap now.
    pub fn restart(&mut self) {
        self.laps.clear();
        self.lap_start = Instant::now();
    }

    /// Close the current lap and start the next one. Returns the lap length.
    pub fn lap(&mut self) -> Duration {
        let now = Instant::now();
        let elapsed = now.duration_since(self.lap_start);
        self.laps.push(elapsed.as_secs_f64());
        self.lap_start = now;
        elapsed
    }

    /// Start the current lap now without recording anything, so work done
    /// since the previous lap is left out of the next one.
    pub fn reset_lap(&mut self) {
        self.lap_start = Instant::now();
    }

    pub fn laps(&self) -> &[f64] {
        &self.laps
    }

    pub fn into_laps(self) -> Vec<f64> {
        self.laps
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_laps_are_recorded_in_order() {
        let mut sw = Stopwatch::start();
        std::thread::sleep(Duration::from_millis(5));
        let first = sw.lap();
        sw.lap();
        assert_eq!(sw.laps().len(), 2);
        assert!(first >= Duration::from_millis(5));
        assert!(sw.laps()[0] >= 0.005);
    }

    #[test]
    fn test_reset_lap_excludes_earlier_work() {
        let mut sw = Stopwatch::start();
        sw.lap();
        std::thread::sleep(Duration::from_millis(30));
        sw.reset_lap();
        let lap = sw.lap();
        assert_eq!(sw.laps().len(), 2);
        assert!(lap < Duration::from_millis(30), "{lap:?}");
    }

    #[test]
    fn test_restart_clears_laps() {
        let mut sw = Stopwatch::start();
        sw.lap();
        sw.restart();
        assert!(sw.laps().is_empty());
        sw.lap();
        assert_eq!(sw.into_laps().len(), 1);
    }
}
