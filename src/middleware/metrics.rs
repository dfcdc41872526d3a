//! Request counter and latency histogram layers.
//!
//! Both catch a panic from the layers they wrap: it is logged at error level
//! and answered with 500, so the dispatch is still recorded exactly once and
//! the fault never reaches the connection.

use std::sync::Arc;
use std::time::Instant;

use super::{Route, contain, guarded};
use crate::handler::{BoxFuture, BoxedHandler, ErasedHandler};
use crate::log::Logger;
use crate::metrics::{HistogramHandle, Metrics};
use crate::request::{Params, Request};
use crate::response::ResponseWriter;

/// Counts every dispatch as `requests_total{route, status}`.
///
/// A panic is counted with the status it is answered with: 500, unless the
/// handler wrote one before panicking.
pub(super) struct Counter {
    pub(super) inner: BoxedHandler,
    pub(super) route: Route,
    pub(super) metrics: Arc<dyn Metrics>,
    pub(super) log: Arc<dyn Logger>,
}

impl ErasedHandler for Counter {
    fn call(&self, w: ResponseWriter, req: Request, params: Params) -> BoxFuture {
        let inner = Arc::clone(&self.inner);
        let route = self.route.clone();
        let metrics = Arc::clone(&self.metrics);
        let log = Arc::clone(&self.log);

        Box::pin(async move {
            if let Err(panic) = guarded(inner, w.clone(), req, params).await {
                contain("Counter", &route, log.as_ref(), &w, panic);
            }

            let status = w.status();
            metrics.count_labels(
                &route.subsystem,
                "requests_total",
                &[("route", &*route.name), ("status", status.as_str())],
            );
        })
    }
}

/// Records the inner dispatch latency, panics included.
pub(super) struct Histogram {
    pub(super) inner: BoxedHandler,
    pub(super) route: Route,
    pub(super) histogram: Arc<dyn HistogramHandle>,
    pub(super) log: Arc<dyn Logger>,
}

impl ErasedHandler for Histogram {
    fn call(&self, w: ResponseWriter, req: Request, params: Params) -> BoxFuture {
        let inner = Arc::clone(&self.inner);
        let route = self.route.clone();
        let histogram = Arc::clone(&self.histogram);
        let log = Arc::clone(&self.log);

        Box::pin(async move {
            let start = Instant::now();
            let outcome = guarded(inner, w.clone(), req, params).await;
            histogram.record_time_elapsed(start.elapsed());

            if let Err(panic) = outcome {
                contain("Histogram", &route, log.as_ref(), &w, panic);
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use http::{Method, StatusCode};
    use tracing::Level;

    use super::*;
    use crate::handler::Handler;
    use crate::test_utils::{RecordingLogger, RecordingMetrics};

    fn route() -> Route {
        Route { subsystem: "public".into(), name: "ping".into() }
    }

    #[tokio::test]
    async fn counter_labels_with_written_status() {
        let metrics = RecordingMetrics::new();
        let counter = Counter {
            inner: (|w: ResponseWriter, _req: Request, _params: Params| async move {
                w.write_header(StatusCode::IM_A_TEAPOT);
            })
            .into_boxed_handler(),
            route: route(),
            metrics: metrics.clone(),
            log: RecordingLogger::new(),
        };

        counter
            .call(ResponseWriter::new(), Request::new(Method::GET, "/ping"), Params::default())
            .await;

        let counts = metrics.counts();
        assert_eq!(counts.len(), 1);
        let (subsystem, name, labels) = &counts[0];
        assert_eq!(subsystem, "public");
        assert_eq!(name, "requests_total");
        assert_eq!(
            labels,
            &vec![("route".to_owned(), "ping".to_owned()), ("status".to_owned(), "418".to_owned())]
        );
    }

    #[tokio::test]
    async fn counter_keeps_status_written_before_panic() {
        let log = RecordingLogger::new();
        let metrics = RecordingMetrics::new();
        let counter: BoxedHandler = Arc::new(Counter {
            inner: (|w: ResponseWriter, _req: Request, _params: Params| async move {
                w.write_header(StatusCode::BAD_GATEWAY);
                panic!("after writing");
            })
            .into_boxed_handler(),
            route: route(),
            metrics: metrics.clone(),
            log: log.clone(),
        });

        let w = ResponseWriter::new();
        let outcome =
            guarded(counter, w.clone(), Request::new(Method::GET, "/"), Params::default()).await;

        assert!(outcome.is_ok());
        assert_eq!(w.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(log.count(Level::ERROR), 1);
        assert!(metrics.counts()[0].2.contains(&("status".to_owned(), "502".to_owned())));
    }

    #[tokio::test]
    async fn histogram_records_once_per_dispatch() {
        let metrics = RecordingMetrics::new();
        let histogram = Histogram {
            inner: (|_w: ResponseWriter, _req: Request, _params: Params| async {
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            })
            .into_boxed_handler(),
            route: route(),
            histogram: metrics.add_histogram("public", "ping"),
            log: RecordingLogger::new(),
        };

        for _ in 0..3 {
            histogram
                .call(ResponseWriter::new(), Request::new(Method::GET, "/"), Params::default())
                .await;
        }

        assert_eq!(metrics.histogram_count(), 1);
        assert_eq!(metrics.observations(), 3);
    }

    #[tokio::test]
    async fn histogram_times_and_contains_a_panic() {
        let log = RecordingLogger::new();
        let metrics = RecordingMetrics::new();
        let histogram: BoxedHandler = Arc::new(Histogram {
            inner: (|_w: ResponseWriter, _req: Request, _params: Params| async move {
                panic!("whoa");
            })
            .into_boxed_handler(),
            route: route(),
            histogram: metrics.add_histogram("public", "ping"),
            log: log.clone(),
        });

        let w = ResponseWriter::new();
        let outcome =
            guarded(histogram, w.clone(), Request::new(Method::GET, "/"), Params::default()).await;

        assert!(outcome.is_ok());
        assert_eq!(w.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(metrics.observations(), 1);
        assert_eq!(log.count(Level::ERROR), 1);
        assert!(log.messages(Level::ERROR)[0].contains("public/ping panicked: whoa"));
    }
}
