//! Throughput sampling for progress reporting.

use std::time::{Duration, Instant};

/// Minimum window between samples.
pub const SAMPLE_INTERVAL: Duration = Duration::from_millis(500);

/// Bytes per second, sampled no more often than `SAMPLE_INTERVAL`.
#[derive(Debug, Clone)]
pub struct ThroughputMeter {
    window_start: Instant,
    window_bytes: u64,
    last_bps: u64,
}

impl ThroughputMeter {
    pub fn new(now: Instant) -> Self {
        Self {
            window_start: now,
            window_bytes: 0,
            last_bps: 0,
        }
    }

    /// Count `bytes` moved. Returns a fresh sample when the window has closed.
    pub fn record(&mut self, bytes: u64, now: Instant) -> Option<u64> {
        self.window_bytes += bytes;
        let elapsed = now.saturating_duration_since(self.window_start);
        if elapsed < SAMPLE_INTERVAL {
            return None;
        }
        self.last_bps = (self.window_bytes as f64 / elapsed.as_secs_f64()) as u64;
        self.window_start = now;
        self.window_bytes = 0;
        Some(self.last_bps)
    }

    pub fn bytes_per_sec(&self) -> u64 {
        self.last_bps
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_sample_inside_window() {
        let t0 = Instant::now();
        let mut m = ThroughputMeter::new(t0);
        assert!(m.record(1000, t0 + Duration::from_millis(100)).is_none());
        assert_eq!(m.bytes_per_sec(), 0);
    }

    #[test]
    fn sample_after_window() {
        let t0 = Instant::now();
        let mut m = ThroughputMeter::new(t0);
        m.record(500_000, t0 + Duration::from_millis(200));
        let bps = m.record(500_000, t0 + Duration::from_secs(1)).unwrap();
        assert_eq!(bps, 1_000_000);
        assert!(m.record(10, t0 + Duration::from_millis(1100)).is_none());
    }
}
