//! Metrics capability and its Prometheus backed default.
//!
//! The middleware only ever talks to the [`Metrics`] trait. The default
//! [`PrometheusMetrics`] records through the `metrics` facade into a local
//! (not process-global) Prometheus recorder, so several services or tests
//! can live in one process without fighting over the global recorder.
//!
//! Names are `{namespace}_{subsystem}_{name}`:
//! - `requests_total` (counter): labels `route`, `status`
//! - `request_duration_seconds` (histogram): label `route`

use std::sync::Arc;
use std::time::Duration;

use metrics::{Histogram, Label};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle, PrometheusRecorder};

use crate::error::Error;

/// Latency buckets in seconds, tuned for typical web request latencies.
pub const DEFAULT_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// A histogram registered once at composition time and observed per dispatch.
pub trait HistogramHandle: Send + Sync {
    fn record_time_elapsed(&self, elapsed: Duration);
}

/// Counters and histograms keyed by subsystem, name and labels.
///
/// Implementations must be internally thread-safe: one instance is shared by
/// every listener and every composed handler.
pub trait Metrics: Send + Sync {
    fn count(&self, subsystem: &str, name: &str) {
        self.count_labels(subsystem, name, &[]);
    }

    fn count_labels(&self, subsystem: &str, name: &str, labels: &[(&str, &str)]);

    /// Registers a histogram labelled with `route`. Bucket boundaries are
    /// configuration of the backend, not of the individual histogram.
    fn add_histogram(&self, subsystem: &str, route: &str) -> Arc<dyn HistogramHandle>;

    /// Current state in the backend's exposition format.
    fn render(&self) -> String;
}

/// [`Metrics`] on top of a local Prometheus recorder.
pub struct PrometheusMetrics {
    namespace: String,
    recorder: PrometheusRecorder,
    handle: PrometheusHandle,
}

impl PrometheusMetrics {
    pub fn new(namespace: &str, buckets: &[f64]) -> Result<Self, Error> {
        let recorder = PrometheusBuilder::new().set_buckets(buckets)?.build_recorder();
        let handle = recorder.handle();

        Ok(Self { namespace: sanitize(namespace), recorder, handle })
    }

    fn metric_name(&self, subsystem: &str, name: &str) -> String {
        format!("{}_{}_{}", self.namespace, sanitize(subsystem), sanitize(name))
    }
}

impl Metrics for PrometheusMetrics {
    fn count_labels(&self, subsystem: &str, name: &str, labels: &[(&str, &str)]) {
        let name = self.metric_name(subsystem, name);
        let labels: Vec<Label> = labels
            .iter()
            .map(|(k, v)| Label::new(k.to_string(), v.to_string()))
            .collect();

        metrics::with_local_recorder(&self.recorder, || {
            metrics::counter!(name, labels).increment(1);
        });
    }

    fn add_histogram(&self, subsystem: &str, route: &str) -> Arc<dyn HistogramHandle> {
        let name = self.metric_name(subsystem, "request_duration_seconds");
        let route = route.to_owned();

        let histogram = metrics::with_local_recorder(&self.recorder, || {
            metrics::histogram!(name, "route" => route)
        });

        Arc::new(PrometheusHistogram(histogram))
    }

    fn render(&self) -> String {
        self.handle.render()
    }
}

struct PrometheusHistogram(Histogram);

impl HistogramHandle for PrometheusHistogram {
    fn record_time_elapsed(&self, elapsed: Duration) {
        self.0.record(elapsed.as_secs_f64());
    }
}

/// Prometheus names allow `[a-zA-Z0-9_:]`; everything else becomes `_`.
fn sanitize(raw: &str) -> String {
    raw.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == ':' { c } else { '_' })
        .collect()
}
