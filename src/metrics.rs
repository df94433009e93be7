//! Prometheus metrics for the forwarding engine.
//!
//! Mirrors the teacher's cardinality-safety discipline: labels are built from
//! a small closed set of `&'static str`s (never raw request/user input), and
//! externally-timed durations are validated before being recorded so a clock
//! glitch can't poison a histogram with NaN or negative buckets.

use prometheus::{CounterVec, Gauge, HistogramVec, IntCounter, Opts, Registry};
use std::sync::Arc;

use crate::error::ErrorKind;

pub struct Metrics {
    registry: Arc<Registry>,
    requests_total: CounterVec,
    forward_duration: HistogramVec,
    retry_decisions_total: CounterVec,
    suspension_queue_depth: Gauge,
    suspension_rejected_total: IntCounter,
    usage_events_dropped_total: IntCounter,
    bus_events_dropped_total: IntCounter,
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Arc::new(Registry::new());

        let requests_total = CounterVec::new(
            Opts::new("requests_total", "Total forwarded requests by final status"),
            &["status"],
        )?;

        let forward_duration = HistogramVec::new(
            prometheus::HistogramOpts::new(
                "forward_duration_seconds",
                "Time from request entry to terminal status",
            )
            .buckets(vec![0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0, 300.0]),
            &["status"],
        )?;

        let retry_decisions_total = CounterVec::new(
            Opts::new("retry_decisions_total", "Retry policy decisions by kind and outcome"),
            &["error_kind", "decision"],
        )?;

        let suspension_queue_depth = Gauge::new(
            "suspension_queue_depth",
            "Current number of requests waiting in the suspension queue",
        )?;

        let suspension_rejected_total = IntCounter::new(
            "suspension_rejected_total",
            "Requests rejected because the suspension queue was at capacity",
        )?;

        let usage_events_dropped_total = IntCounter::new(
            "usage_events_dropped_total",
            "Usage events dropped because the tracker's buffered channel was full",
        )?;

        let bus_events_dropped_total = IntCounter::new(
            "bus_events_dropped_total",
            "Event bus messages dropped by rate-limiting or a slow subscriber",
        )?;

        registry.register(Box::new(requests_total.clone()))?;
        registry.register(Box::new(forward_duration.clone()))?;
        registry.register(Box::new(retry_decisions_total.clone()))?;
        registry.register(Box::new(suspension_queue_depth.clone()))?;
        registry.register(Box::new(suspension_rejected_total.clone()))?;
        registry.register(Box::new(usage_events_dropped_total.clone()))?;
        registry.register(Box::new(bus_events_dropped_total.clone()))?;

        Ok(Self {
            registry,
            requests_total,
            forward_duration,
            retry_decisions_total,
            suspension_queue_depth,
            suspension_rejected_total,
            usage_events_dropped_total,
            bus_events_dropped_total,
        })
    }

    pub fn record_request(&self, status: &'static str) {
        self.requests_total.with_label_values(&[status]).inc();
    }

    /// Rejects NaN/Infinity/negative durations rather than letting them
    /// silently corrupt a histogram bucket.
    pub fn record_forward_duration(&self, status: &'static str, seconds: f64) -> Result<(), prometheus::Error> {
        if !seconds.is_finite() || seconds < 0.0 {
            return Err(prometheus::Error::Msg(format!(
                "refusing to record non-finite/negative duration {seconds} for status {status}"
            )));
        }
        self.forward_duration.with_label_values(&[status]).observe(seconds);
        Ok(())
    }

    pub fn record_retry_decision(&self, kind: ErrorKind, decision: &'static str) {
        self.retry_decisions_total
            .with_label_values(&[kind.as_str(), decision])
            .inc();
    }

    pub fn set_suspension_queue_depth(&self, depth: usize) {
        self.suspension_queue_depth.set(depth as f64);
    }

    pub fn suspension_rejected(&self) {
        self.suspension_rejected_total.inc();
    }

    pub fn usage_event_dropped(&self) {
        self.usage_events_dropped_total.inc();
    }

    pub fn bus_event_dropped(&self) {
        self.bus_events_dropped_total.inc();
    }

    pub fn gather(&self) -> Result<String, prometheus::Error> {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(format!("non-utf8 metrics output: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_registers_without_error() {
        let metrics = Metrics::new().unwrap();
        assert!(metrics.gather().unwrap().contains("requests_total"));
    }

    #[test]
    fn record_request_increments_by_status() {
        let metrics = Metrics::new().unwrap();
        metrics.record_request("completed");
        metrics.record_request("completed");
        metrics.record_request("timeout");
        let output = metrics.gather().unwrap();
        assert!(output.contains(r#"status="completed""#));
        assert!(output.contains(r#"status="timeout""#));
    }

    #[test]
    fn rejects_nan_duration() {
        let metrics = Metrics::new().unwrap();
        assert!(metrics.record_forward_duration("completed", f64::NAN).is_err());
    }

    #[test]
    fn rejects_negative_duration() {
        let metrics = Metrics::new().unwrap();
        assert!(metrics.record_forward_duration("completed", -1.0).is_err());
    }

    #[test]
    fn accepts_finite_nonnegative_duration() {
        let metrics = Metrics::new().unwrap();
        assert!(metrics.record_forward_duration("completed", 0.25).is_ok());
    }

    #[test]
    fn suspension_queue_depth_is_gauge_not_counter() {
        let metrics = Metrics::new().unwrap();
        metrics.set_suspension_queue_depth(5);
        metrics.set_suspension_queue_depth(2);
        let output = metrics.gather().unwrap();
        assert!(output.contains("suspension_queue_depth 2"));
    }

    #[test]
    fn dropped_event_counters_are_independent() {
        let metrics = Metrics::new().unwrap();
        metrics.usage_event_dropped();
        metrics.bus_event_dropped();
        metrics.bus_event_dropped();
        let output = metrics.gather().unwrap();
        assert!(output.contains("usage_events_dropped_total 1"));
        assert!(output.contains("bus_events_dropped_total 2"));
    }
}
