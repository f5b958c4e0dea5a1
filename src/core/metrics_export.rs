//! Metrics exposition
//!
//! Renders the service metrics snapshot in Prometheus text format for the
//! metrics endpoint.

use super::metrics::MetricsSnapshot;

/// Prometheus text-format exporter
pub struct PrometheusExporter {
    prefix: String,
}

impl PrometheusExporter {
    pub fn new() -> Self {
        Self {
            prefix: "tts".to_string(),
        }
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Render the snapshot plus live gauges
    pub fn export(
        &self,
        snapshot: &MetricsSnapshot,
        queue_len: usize,
        workers_online: usize,
        active_jobs: i64,
    ) -> String {
        let mut out = String::new();

        self.counter(&mut out, "jobs_total", "Finished jobs", snapshot.total_jobs);
        self.counter(
            &mut out,
            "segments_total",
            "Processed segments",
            snapshot.total_segments,
        );
        self.counter(
            &mut out,
            "chars_total",
            "Characters synthesized",
            snapshot.total_chars,
        );
        self.counter(
            &mut out,
            "cache_hits_total",
            "Segment cache hits",
            snapshot.cache_hits,
        );
        self.counter(
            &mut out,
            "cache_misses_total",
            "Segment cache misses",
            snapshot.cache_misses,
        );
        self.counter(
            &mut out,
            "segment_errors_total",
            "Segments finishing in error",
            snapshot.error_segments,
        );
        self.counter(
            &mut out,
            "segment_retries_total",
            "Segment retry attempts",
            snapshot.segment_retries,
        );
        self.counter(
            &mut out,
            "segment_retry_caps_total",
            "Segments hitting the retry cap",
            snapshot.segment_retry_caps,
        );
        self.counter(
            &mut out,
            "fallback_model_total",
            "Segments synthesized on the fallback model",
            snapshot.fallback_segments,
        );
        self.counter(
            &mut out,
            "synth_soft_timeouts_total",
            "Synthesis calls exceeding the soft timeout",
            snapshot.soft_timeouts,
        );
        self.counter(
            &mut out,
            "merge_lock_waits_total",
            "Merge lock acquisitions that had to wait",
            snapshot.merge_lock_waits,
        );

        self.gauge(
            &mut out,
            "merge_lock_wait_ms_max",
            "Longest merge lock wait in milliseconds",
            snapshot.merge_lock_wait_max_ms,
        );
        self.gauge(
            &mut out,
            "cache_hit_rate",
            "Segment cache hit rate",
            snapshot.cache_hit_rate(),
        );
        self.gauge(
            &mut out,
            "synth_mean_ms",
            "Rolling mean synthesis time in milliseconds",
            snapshot.synth_mean_ms,
        );
        self.gauge(&mut out, "queue_len", "Queued jobs", queue_len as f64);
        self.gauge(
            &mut out,
            "workers_online",
            "Workers with a live heartbeat",
            workers_online as f64,
        );
        self.gauge(&mut out, "active_jobs", "Jobs holding an active slot", active_jobs as f64);

        out
    }

    fn counter(&self, out: &mut String, name: &str, help: &str, value: u64) {
        let metric = format!("{}_{}", self.prefix, name);
        out.push_str(&format!("# HELP {} {}\n", metric, help));
        out.push_str(&format!("# TYPE {} counter\n", metric));
        out.push_str(&format!("{} {}\n", metric, value));
    }

    fn gauge(&self, out: &mut String, name: &str, help: &str, value: f64) {
        let metric = format!("{}_{}", self.prefix, name);
        out.push_str(&format!("# HELP {} {}\n", metric, help));
        out.push_str(&format!("# TYPE {} gauge\n", metric));
        out.push_str(&format!("{} {:.6}\n", metric, value));
    }
}

impl Default for PrometheusExporter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::metrics::ServiceMetrics;

    #[test]
    fn test_export_contains_counters_and_gauges() {
        let metrics = ServiceMetrics::new();
        metrics.record_job(3, 900, 1500.0, 1, 2, 0);
        metrics.record_merge_lock_wait(25.0);

        let text = PrometheusExporter::new().export(&metrics.snapshot(), 2, 1, 4);
        assert!(text.contains("# TYPE tts_jobs_total counter"));
        assert!(text.contains("tts_jobs_total 1"));
        assert!(text.contains("tts_segments_total 3"));
        assert!(text.contains("tts_queue_len 2.000000"));
        assert!(text.contains("tts_workers_online 1.000000"));
        assert!(text.contains("tts_merge_lock_waits_total 1"));
    }

    #[test]
    fn test_prefix_override() {
        let metrics = ServiceMetrics::new();
        let text = PrometheusExporter::new()
            .with_prefix("svc")
            .export(&metrics.snapshot(), 0, 0, 0);
        assert!(text.contains("svc_jobs_total 0"));
        assert!(!text.contains("tts_jobs_total"));
    }
}
