//! Per-run latency tracking using HDR Histogram.
//!
//! Every load-test run owns one [`RunSummary`]. Each probe's total duration
//! is recorded in microseconds (1μs to 60s, 3 significant digits) and the
//! summary is published once when the run ends.

use hdrhistogram::Histogram;
use serde::Serialize;
use tracing::warn;

use crate::request_timer::ResponseRecord;

const MAX_LATENCY_US: u64 = 60_000_000;

/// Percentile statistics for a set of latency measurements, in milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PercentileStats {
    pub count: u64,
    pub min_ms: f64,
    pub max_ms: f64,
    pub mean_ms: f64,
    pub p50_ms: f64,
    pub p90_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
    #[serde(rename = "p99_9Ms")]
    pub p99_9_ms: f64,
}

impl PercentileStats {
    /// Format statistics as a human-readable string.
    pub fn format(&self) -> String {
        format!(
            "count={}, min={:.2}ms, max={:.2}ms, mean={:.2}ms, p50={:.2}ms, p90={:.2}ms, p95={:.2}ms, p99={:.2}ms, p99.9={:.2}ms",
            self.count,
            self.min_ms,
            self.max_ms,
            self.mean_ms,
            self.p50_ms,
            self.p90_ms,
            self.p95_ms,
            self.p99_ms,
            self.p99_9_ms,
        )
    }
}

fn us_to_ms(us: u64) -> f64 {
    us as f64 / 1000.0
}

/// Latency histogram for one run.
pub struct LatencyTracker {
    histogram: Option<Histogram<u64>>,
}

impl LatencyTracker {
    pub fn new() -> Self {
        let histogram = match Histogram::new_with_bounds(1, MAX_LATENCY_US, 3) {
            Ok(h) => Some(h),
            Err(e) => {
                warn!(error = %e, "Failed to create latency histogram; percentiles disabled");
                None
            }
        };
        Self { histogram }
    }

    /// Record a latency in fractional milliseconds.
    pub fn record_ms(&mut self, latency_ms: f64) {
        let latency_us = (latency_ms * 1000.0).round().max(0.0) as u64;
        self.record_us(latency_us);
    }

    pub fn record_us(&mut self, latency_us: u64) {
        let Some(hist) = self.histogram.as_mut() else {
            return;
        };
        let clamped = latency_us.clamp(1, MAX_LATENCY_US);
        if let Err(e) = hist.record(clamped) {
            warn!(
                latency_us = latency_us,
                error = %e,
                "Failed to record latency in histogram"
            );
        }
    }

    /// Current statistics, or `None` before the first sample.
    pub fn stats(&self) -> Option<PercentileStats> {
        let hist = self.histogram.as_ref()?;
        if hist.is_empty() {
            return None;
        }
        Some(PercentileStats {
            count: hist.len(),
            min_ms: us_to_ms(hist.min()),
            max_ms: us_to_ms(hist.max()),
            mean_ms: hist.mean() / 1000.0,
            p50_ms: us_to_ms(hist.value_at_quantile(0.50)),
            p90_ms: us_to_ms(hist.value_at_quantile(0.90)),
            p95_ms: us_to_ms(hist.value_at_quantile(0.95)),
            p99_ms: us_to_ms(hist.value_at_quantile(0.99)),
            p99_9_ms: us_to_ms(hist.value_at_quantile(0.999)),
        })
    }
}

impl Default for LatencyTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// End-of-run report published on the run's summary topic.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SummaryReport {
    pub id: String,
    pub agent_id: String,
    pub uuid: Option<String>,
    /// Completed passes over the request list.
    pub iterations: u64,
    /// A pass was cut short by a halt after sending some of its requests.
    pub partial_pass: bool,
    pub requests: u64,
    pub errors: u64,
    pub halted: bool,
    pub latency: Option<PercentileStats>,
}

/// Counters and latencies accumulated over one run.
#[derive(Default)]
pub struct RunSummary {
    iterations: u64,
    pass_requests: u64,
    requests: u64,
    errors: u64,
    latency: LatencyTracker,
}

impl RunSummary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a completed pass over the run's request list.
    pub fn finish_iteration(&mut self) {
        self.iterations += 1;
        self.pass_requests = 0;
    }

    /// Fold in one probe result. Failed probes count as errors and their
    /// latency is still recorded.
    pub fn record(&mut self, record: &ResponseRecord) {
        self.requests += 1;
        self.pass_requests += 1;
        if record.error.is_some() {
            self.errors += 1;
        }
        self.latency.record_ms(record.timing_phases.total);
    }

    pub fn report(&self, id: &str, agent_id: &str, uuid: Option<&str>, halted: bool) -> SummaryReport {
        SummaryReport {
            id: id.to_string(),
            agent_id: agent_id.to_string(),
            uuid: uuid.map(str::to_string),
            iterations: self.iterations,
            partial_pass: self.pass_requests > 0,
            requests: self.requests,
            errors: self.errors,
            halted,
            latency: self.latency.stats(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracker_basic() {
        let mut tracker = LatencyTracker::new();
        for i in 1..=5 {
            tracker.record_ms(i as f64 * 10.0);
        }

        let stats = tracker.stats().expect("Should have stats");
        assert_eq!(stats.count, 5);
        assert_eq!(stats.min_ms, 10.0);

        // HDR histogram buckets values; allow a small rounding margin.
        assert!(
            stats.max_ms >= 50.0 && stats.max_ms <= 50.1,
            "max should be ~50ms but was {}",
            stats.max_ms
        );
    }

    #[test]
    fn stats_format_lists_every_percentile() {
        let mut tracker = LatencyTracker::new();
        tracker.record_ms(10.0);
        let line = tracker.stats().unwrap().format();
        assert!(line.starts_with("count=1, min=10.00ms"), "{}", line);
        assert!(line.contains("p99.9=10.00ms"), "{}", line);
    }

    #[test]
    fn unfinished_pass_is_flagged() {
        let mut summary = RunSummary::new();
        summary.record(&ResponseRecord::default());
        summary.finish_iteration();
        summary.record(&ResponseRecord::default());

        let report = summary.report("r1", "a1", Some("u1"), true);
        assert_eq!(report.iterations, 1);
        assert_eq!(report.requests, 2);
        assert!(report.partial_pass);
    }

    #[test]
    fn tracker_empty() {
        assert!(LatencyTracker::new().stats().is_none());
    }

    #[test]
    fn sub_microsecond_latency_is_clamped() {
        let mut tracker = LatencyTracker::new();
        tracker.record_ms(0.0);
        let stats = tracker.stats().unwrap();
        assert_eq!(stats.count, 1);
        assert_eq!(stats.min_ms, 0.001);
    }

    #[test]
    fn summary_counts_errors_and_iterations() {
        let mut summary = RunSummary::new();
        let mut ok = ResponseRecord::default();
        ok.timing_phases.total = 12.0;
        let mut failed = ResponseRecord::default();
        failed.error = Some("connection refused".to_string());
        failed.timing_phases.total = 1.0;

        summary.record(&ok);
        summary.record(&failed);
        summary.finish_iteration();

        let report = summary.report("r1", "a1", Some("u1"), true);
        assert_eq!(report.iterations, 1);
        assert!(!report.partial_pass);
        assert_eq!(report.requests, 2);
        assert_eq!(report.errors, 1);
        assert!(report.halted);
        assert_eq!(report.latency.unwrap().count, 2);

        let json = serde_json::to_value(summary.report("r1", "a1", None, false)).unwrap();
        assert_eq!(json["agentId"], "a1");
        assert!(json["uuid"].is_null());
        assert_eq!(json["partialPass"], false);
        assert!(json["latency"]["p99_9Ms"].is_number());
    }
}
