//! Middleware pipeline.
//!
//! A route is registered with an ordered chain of [`Middleware`] kinds.
//! [`Pipeline::compose`] wraps the base handler once per entry, innermost
//! last, so the chain `[A, B]` yields `A(B(handler))`: `A` runs first before
//! dispatch and observes the outcome last.
//!
//! ```text
//! [PanicRecovery, RequestLogging, Counter]
//!
//! PanicRecovery ─▶ RequestLogging ─▶ Counter ─▶ handler
//!        ◀──────────────◀───────────────◀──────────┘
//! ```
//!
//! `RequestLogging` logs a panic unwinding through it and lets it continue
//! outward. `PanicRecovery`, `Counter` and `Histogram` stop it: the fault is
//! logged at error level and answered with 500 unless a status was already
//! written, so the innermost of them handles it and the layers outside see
//! an ordinary 500.
//!
//! An [`Middleware::Unknown`] kind never fails registration: it is logged as
//! a warning and the handler is passed through unwrapped.

mod headers;
mod logging;
mod metrics;
mod recovery;

use std::convert::Infallible;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::str::FromStr;
use std::sync::Arc;

use futures_util::FutureExt;

use crate::handler::BoxedHandler;
use crate::log::Logger;
use crate::metrics::Metrics;
use crate::request::{Params, Request};
use crate::response::ResponseWriter;

pub use headers::CorsOptions;

/// A cross-cutting behaviour applied around a route handler.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Middleware {
    /// Catches a handler panic, logs it and answers 500 if nothing was written.
    PanicRecovery,
    /// Logs entry, exit and elapsed time.
    RequestLogging,
    /// Sets `Cache-Control`, `Pragma` and `Expires` so nothing is cached.
    NoCaching,
    /// Sets `Access-Control-Allow-Origin` / `-Methods` from [`CorsOptions`].
    Cors,
    /// Counts each dispatch, labelled by route and final status.
    Counter,
    /// Records dispatch latency, labelled by route.
    Histogram,
    /// Anything else, typically from misconfiguration. Composes as a no-op.
    Unknown(String),
}

impl Middleware {
    /// The chain applied to every built-in service-management route.
    pub fn defaults() -> Vec<Middleware> {
        vec![Middleware::PanicRecovery, Middleware::RequestLogging, Middleware::NoCaching]
    }
}

/// Parses a configured name (case-insensitive, `-`/`_` ignored). Never fails:
/// unrecognised names become [`Middleware::Unknown`].
impl FromStr for Middleware {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let key: String = s
            .chars()
            .filter(|c| *c != '-' && *c != '_')
            .map(|c| c.to_ascii_lowercase())
            .collect();

        Ok(match key.as_str() {
            "panicrecovery" | "panicto500" => Self::PanicRecovery,
            "requestlogging" => Self::RequestLogging,
            "nocaching" => Self::NoCaching,
            "cors" => Self::Cors,
            "counter" => Self::Counter,
            "histogram" => Self::Histogram,
            _ => Self::Unknown(s.to_owned()),
        })
    }
}

/// Numeric codes as used by configuration files: `1..=6`, anything else
/// (including `0`) is unknown.
impl From<u8> for Middleware {
    fn from(code: u8) -> Self {
        match code {
            1 => Self::PanicRecovery,
            2 => Self::RequestLogging,
            3 => Self::NoCaching,
            4 => Self::Cors,
            5 => Self::Counter,
            6 => Self::Histogram,
            other => Self::Unknown(other.to_string()),
        }
    }
}

impl fmt::Display for Middleware {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PanicRecovery => f.write_str("PanicRecovery"),
            Self::RequestLogging => f.write_str("RequestLogging"),
            Self::NoCaching => f.write_str("NoCaching"),
            Self::Cors => f.write_str("CORS"),
            Self::Counter => f.write_str("Counter"),
            Self::Histogram => f.write_str("Histogram"),
            Self::Unknown(raw) => write!(f, "Unknown({raw})"),
        }
    }
}

/// Builds composed handlers. Cheap to clone; shared by all route tables.
#[derive(Clone)]
pub struct Pipeline {
    log: Arc<dyn Logger>,
    metrics: Arc<dyn Metrics>,
    cors: Arc<headers::CorsPolicy>,
}

impl Pipeline {
    pub fn new(log: Arc<dyn Logger>, metrics: Arc<dyn Metrics>, cors: &CorsOptions) -> Self {
        let cors = Arc::new(headers::CorsPolicy::new(cors, log.as_ref()));
        Self { log, metrics, cors }
    }

    /// Wraps `handler` with every middleware in `chain`, first entry outermost.
    /// An empty chain returns `handler` as-is; duplicates wrap again.
    pub fn compose(
        &self,
        subsystem: &str,
        name: &str,
        chain: &[Middleware],
        handler: BoxedHandler,
    ) -> BoxedHandler {
        chain
            .iter()
            .rev()
            .fold(handler, |inner, middleware| self.wrap(subsystem, name, middleware, inner))
    }

    /// Wraps `inner` with a single middleware.
    pub fn wrap(
        &self,
        subsystem: &str,
        name: &str,
        middleware: &Middleware,
        inner: BoxedHandler,
    ) -> BoxedHandler {
        let route = Route { subsystem: subsystem.into(), name: name.into() };

        match middleware {
            Middleware::PanicRecovery => Arc::new(recovery::PanicRecovery {
                inner,
                route,
                log: Arc::clone(&self.log),
            }),
            Middleware::RequestLogging => Arc::new(logging::RequestLogging {
                inner,
                route,
                log: Arc::clone(&self.log),
            }),
            Middleware::NoCaching => Arc::new(headers::NoCaching { inner }),
            Middleware::Cors => Arc::new(headers::Cors {
                inner,
                policy: Arc::clone(&self.cors),
            }),
            Middleware::Counter => Arc::new(metrics::Counter {
                inner,
                route,
                metrics: Arc::clone(&self.metrics),
                log: Arc::clone(&self.log),
            }),
            Middleware::Histogram => Arc::new(metrics::Histogram {
                histogram: self.metrics.add_histogram(subsystem, name),
                inner,
                route,
                log: Arc::clone(&self.log),
            }),
            Middleware::Unknown(kind) => {
                self.log.warn(
                    "Middleware",
                    format_args!("unknown middleware {kind:?} on route {subsystem}/{name}, handler left unwrapped"),
                );
                inner
            }
        }
    }
}

/// Identity of the route a layer wraps, for logs and metric labels.
#[derive(Clone)]
pub(crate) struct Route {
    pub(crate) subsystem: Arc<str>,
    pub(crate) name: Arc<str>,
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.subsystem, self.name)
    }
}

/// Runs `inner` and catches a panic instead of unwinding.
///
/// The call itself happens inside the guarded future, so a handler that
/// panics before returning its future is caught too.
pub(crate) async fn guarded(
    inner: BoxedHandler,
    w: ResponseWriter,
    req: Request,
    params: Params,
) -> std::thread::Result<()> {
    AssertUnwindSafe(async move { inner.call(w, req, params).await })
        .catch_unwind()
        .await
}

/// Settles a caught panic: logs it at error level under `layer` and writes
/// 500. A status the handler already wrote is kept.
pub(crate) fn contain(
    layer: &str,
    route: &Route,
    log: &dyn Logger,
    w: &ResponseWriter,
    panic: Box<dyn std::any::Any + Send>,
) {
    log.error(layer, format_args!("route {route} panicked: {}", panic_message(&*panic)));
    w.write_header(http::StatusCode::INTERNAL_SERVER_ERROR);
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}
