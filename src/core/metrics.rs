//! Service metrics
//!
//! Lock-free counters for the job pipeline plus a small amount of guarded
//! state for the merge-lock wait histogram and the rolling synthesis mean
//! that drives the soft timeout.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Point-in-time view of all counters
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub total_jobs: u64,
    pub total_segments: u64,
    pub total_chars: u64,
    pub total_duration_ms: f64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub error_segments: u64,
    pub segment_retries: u64,
    pub segment_retry_caps: u64,
    pub fallback_segments: u64,
    pub soft_timeouts: u64,
    pub merge_lock_waits: u64,
    pub merge_lock_wait_ms: f64,
    pub merge_lock_wait_max_ms: f64,
    pub synth_mean_ms: f64,
}

impl MetricsSnapshot {
    pub fn cache_hit_rate(&self) -> f64 {
        let denom = self.cache_hits + self.cache_misses;
        if denom == 0 {
            0.0
        } else {
            self.cache_hits as f64 / denom as f64
        }
    }

    pub fn error_rate(&self) -> f64 {
        if self.total_segments == 0 {
            0.0
        } else {
            self.error_segments as f64 / self.total_segments as f64
        }
    }

    pub fn avg_chars_per_sec(&self) -> f64 {
        if self.total_duration_ms <= 0.0 {
            0.0
        } else {
            self.total_chars as f64 / (self.total_duration_ms / 1000.0)
        }
    }
}

#[derive(Default)]
struct MergeWaitStats {
    count: u64,
    total_ms: f64,
    max_ms: f64,
}

#[derive(Default)]
struct RollingSynth {
    total_ms: f64,
    count: u64,
}

/// Process-wide metrics collector
#[derive(Default)]
pub struct ServiceMetrics {
    total_jobs: AtomicU64,
    total_segments: AtomicU64,
    total_chars: AtomicU64,
    total_duration_ms: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    error_segments: AtomicU64,
    segment_retries: AtomicU64,
    segment_retry_caps: AtomicU64,
    fallback_segments: AtomicU64,
    soft_timeouts: AtomicU64,
    merge_waits: Mutex<MergeWaitStats>,
    synth: Mutex<RollingSynth>,
}

impl ServiceMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one finished job
    pub fn record_job(
        &self,
        total_segments: u64,
        total_chars: u64,
        duration_ms: f64,
        cache_hits: u64,
        cache_misses: u64,
        error_segments: u64,
    ) {
        self.total_jobs.fetch_add(1, Ordering::Relaxed);
        self.total_segments.fetch_add(total_segments, Ordering::Relaxed);
        self.total_chars.fetch_add(total_chars, Ordering::Relaxed);
        self.total_duration_ms
            .fetch_add(duration_ms.max(0.0) as u64, Ordering::Relaxed);
        self.cache_hits.fetch_add(cache_hits, Ordering::Relaxed);
        self.cache_misses.fetch_add(cache_misses, Ordering::Relaxed);
        self.error_segments.fetch_add(error_segments, Ordering::Relaxed);
    }

    pub fn record_segment_retry(&self) {
        self.segment_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retry_cap(&self) {
        self.segment_retry_caps.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fallback_usage(&self) {
        self.fallback_segments.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_soft_timeout(&self) {
        self.soft_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a merge-lock wait; zero-wait acquisitions are not contention
    pub fn record_merge_lock_wait(&self, wait_ms: f64) {
        if wait_ms <= 0.0 {
            return;
        }
        let mut stats = self.merge_waits.lock().expect("metrics lock");
        stats.count += 1;
        stats.total_ms += wait_ms;
        if wait_ms > stats.max_ms {
            stats.max_ms = wait_ms;
        }
    }

    /// Feed the rolling synthesis mean
    pub fn record_synth_ms(&self, synth_ms: f64) {
        let mut synth = self.synth.lock().expect("metrics lock");
        synth.total_ms += synth_ms.max(0.0);
        synth.count += 1;
    }

    /// Rolling mean of synthesis time, 0 before the first sample
    pub fn synth_mean_ms(&self) -> f64 {
        let synth = self.synth.lock().expect("metrics lock");
        if synth.count == 0 {
            0.0
        } else {
            synth.total_ms / synth.count as f64
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let synth_mean_ms = self.synth_mean_ms();
        let merge = self.merge_waits.lock().expect("metrics lock");
        MetricsSnapshot {
            total_jobs: self.total_jobs.load(Ordering::Relaxed),
            total_segments: self.total_segments.load(Ordering::Relaxed),
            total_chars: self.total_chars.load(Ordering::Relaxed),
            total_duration_ms: self.total_duration_ms.load(Ordering::Relaxed) as f64,
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            error_segments: self.error_segments.load(Ordering::Relaxed),
            segment_retries: self.segment_retries.load(Ordering::Relaxed),
            segment_retry_caps: self.segment_retry_caps.load(Ordering::Relaxed),
            fallback_segments: self.fallback_segments.load(Ordering::Relaxed),
            soft_timeouts: self.soft_timeouts.load(Ordering::Relaxed),
            merge_lock_waits: merge.count,
            merge_lock_wait_ms: merge.total_ms,
            merge_lock_wait_max_ms: merge.max_ms,
            synth_mean_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_job_accumulates() {
        let metrics = ServiceMetrics::new();
        metrics.record_job(4, 1200, 2000.0, 1, 3, 1);
        metrics.record_job(2, 300, 1000.0, 2, 0, 0);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.total_jobs, 2);
        assert_eq!(snapshot.total_segments, 6);
        assert_eq!(snapshot.cache_hits, 3);
        assert_eq!(snapshot.error_segments, 1);
        assert!((snapshot.avg_chars_per_sec() - 500.0).abs() < 1.0);
    }

    #[test]
    fn test_rates() {
        let metrics = ServiceMetrics::new();
        metrics.record_job(10, 0, 0.0, 3, 1, 2);
        let snapshot = metrics.snapshot();
        assert!((snapshot.cache_hit_rate() - 0.75).abs() < f64::EPSILON);
        assert!((snapshot.error_rate() - 0.2).abs() < f64::EPSILON);
    }

    #[test]
    fn test_merge_wait_tracking() {
        let metrics = ServiceMetrics::new();
        metrics.record_merge_lock_wait(0.0);
        metrics.record_merge_lock_wait(12.0);
        metrics.record_merge_lock_wait(5.0);
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.merge_lock_waits, 2);
        assert_eq!(snapshot.merge_lock_wait_max_ms, 12.0);
        assert_eq!(snapshot.merge_lock_wait_ms, 17.0);
    }

    #[test]
    fn test_synth_rolling_mean() {
        let metrics = ServiceMetrics::new();
        assert_eq!(metrics.synth_mean_ms(), 0.0);
        metrics.record_synth_ms(100.0);
        metrics.record_synth_ms(300.0);
        assert!((metrics.synth_mean_ms() - 200.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_empty_snapshot_rates_are_zero() {
        let snapshot = ServiceMetrics::new().snapshot();
        assert_eq!(snapshot.cache_hit_rate(), 0.0);
        assert_eq!(snapshot.error_rate(), 0.0);
        assert_eq!(snapshot.avg_chars_per_sec(), 0.0);
    }
}
