//! Loop counters and frame-rate measurement.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crossbeam::utils::CachePadded;
use ringbuf::traits::{Consumer, Observer, RingBuffer};
use ringbuf::HeapRb;

/// Counters written by exactly one loop thread, read by anyone.
#[derive(Debug, Default)]
pub struct LoopCounters {
    iterations: CachePadded<AtomicU64>,
    published: CachePadded<AtomicU64>,
    idle: CachePadded<AtomicU64>,
    failures: CachePadded<AtomicU64>,
    /// f64 bits
    rate_hz: CachePadded<AtomicU64>,
}

/// Point-in-time copy of [`LoopCounters`]
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LoopStats {
    pub iterations: u64,
    pub published: u64,
    pub idle: u64,
    pub failures: u64,
    pub rate_hz: f64,
}

impl LoopCounters {
    pub fn record_iteration(&self) {
        self.iterations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_published(&self) {
        self.published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_idle(&self) {
        self.idle.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_rate(&self, hz: f64) {
        self.rate_hz.store(hz.to_bits(), Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> LoopStats {
        LoopStats {
            iterations: self.iterations.load(Ordering::Relaxed),
            published: self.published.load(Ordering::Relaxed),
            idle: self.idle.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            rate_hz: f64::from_bits(self.rate_hz.load(Ordering::Relaxed)),
        }
    }
}

/// One set of counters per loop thread
#[derive(Debug, Default)]
pub struct PipelineCounters {
    pub capture: LoopCounters,
    pub detection: LoopCounters,
    pub extrinsics: LoopCounters,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PipelineStats {
    pub capture: LoopStats,
    pub detection: LoopStats,
    pub extrinsics: LoopStats,
}

impl PipelineCounters {
    pub fn snapshot(&self) -> PipelineStats {
        PipelineStats {
            capture: self.capture.snapshot(),
            detection: self.detection.snapshot(),
            extrinsics: self.extrinsics.snapshot(),
        }
    }
}

/// Events per second over the last N ticks.
pub struct FpsMeter {
    window: HeapRb<Instant>,
    last: Option<Instant>,
}

impl FpsMeter {
    pub fn new(capacity: usize) -> Self {
        Self {
            window: HeapRb::new(capacity.max(2)),
            last: None,
        }
    }

    /// Record a tick, returning the interval since the previous one.
    pub fn tick(&mut self, now: Instant) -> Option<Duration> {
        self.window.push_overwrite(now);
        let since = self.last.map(|prev| now.saturating_duration_since(prev));
        self.last = Some(now);
        since
    }

    pub fn fps(&self) -> f64 {
        let n = self.window.occupied_len();
        let (Some(first), Some(last)) = (self.window.iter().next(), self.last) else {
            return 0.0;
        };
        let span = last.saturating_duration_since(*first).as_secs_f64();
        if n < 2 || span <= 0.0 {
            return 0.0;
        }
        (n - 1) as f64 / span
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fps_over_window() {
        let mut meter = FpsMeter::new(4);
        let t0 = Instant::now();
        assert_eq!(meter.fps(), 0.0);
        assert_eq!(meter.tick(t0), None);
        assert_eq!(meter.fps(), 0.0);

        for i in 1..10u64 {
            let dt = meter.tick(t0 + Duration::from_millis(100 * i));
            assert_eq!(dt, Some(Duration::from_millis(100)));
        }
        // Only the last 4 ticks count: 3 intervals over 300 ms
        assert!((meter.fps() - 10.0).abs() < 1e-9);
    }

    #[test]
    fn counters_snapshot() {
        let counters = PipelineCounters::default();
        counters.capture.record_iteration();
        counters.capture.record_iteration();
        counters.capture.record_published();
        counters.detection.record_failure();
        counters.capture.set_rate(29.5);

        let stats = counters.snapshot();
        assert_eq!(stats.capture.iterations, 2);
        assert_eq!(stats.capture.published, 1);
        assert_eq!(stats.detection.failures, 1);
        assert_eq!(stats.capture.rate_hz, 29.5);
        assert_eq!(stats.extrinsics, LoopStats::default());
    }
}
