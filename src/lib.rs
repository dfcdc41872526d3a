//! # service-foundation
//!
//! Bootstrap for HTTP microservices. One [`Service`] runs three listeners,
//! wraps every handler in an ordered middleware chain and shuts down exactly
//! once, whatever asks it to.
//!
//! | Server | Port | Built-in routes |
//! |---|---|---|
//! | public | `HTTPPORT` (8080) | `/`, `/service/version`, `/service/liveness`, `/service/readiness`, your routes |
//! | readiness | `HTTPPORT + 1` | `/`, `/service/liveness`, `/service/readiness` |
//! | internal | `HTTPPORT + 2` | `/`, `/health_check`, `/healthz`, `/metrics`, `/quit` |
//!
//! ## Shutdown
//!
//! The first of these wins, every later one is ignored:
//!
//! - a listener stops on its own (bind failure, serve error), exit code `1`
//! - the `cancel` future passed to [`Service::run`] resolves, exit code `0`
//! - SIGTERM / Ctrl-C, exit code `0`
//! - `GET /quit` on the internal server, exit code `0`
//!
//! All listeners then stop accepting, drain in-flight requests up to
//! `SERVER_TIMEOUT_SECS`, the optional shutdown callback runs and the exit
//! function is called.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use http::StatusCode;
//! use service_foundation::{Middleware, Params, Request, ResponseWriter, Service};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), service_foundation::Error> {
//!     let mut service = Service::new("orders", &["GET", "POST"], None)?;
//!
//!     service.add_route(
//!         "order",
//!         &["/orders/{id}"],
//!         &["GET"],
//!         &[Middleware::PanicRecovery, Middleware::Counter, Middleware::Histogram],
//!         get_order,
//!     );
//!
//!     // Runs until SIGTERM, Ctrl-C or /quit, then exits the process.
//!     service.run(std::future::pending()).await;
//!     Ok(())
//! }
//!
//! async fn get_order(w: ResponseWriter, _req: Request, params: Params) {
//!     let id = params.get("id").unwrap_or("unknown");
//!     w.json(StatusCode::OK, format!(r#"{{"id":"{id}"}}"#));
//! }
//! ```

mod config;
mod error;
mod handler;
mod health;
mod log;
mod metrics;
mod request;
mod response;
mod router;
mod server;
mod service;
mod shutdown;
mod version;

pub mod middleware;

#[cfg(test)]
mod test_utils;

pub use config::ServiceConfig;
pub use error::Error;
pub use handler::Handler;
pub use health::{AlwaysReady, ServiceStateReader};
pub use log::{Logger, TracingLogger, init_logging};
pub use metrics::{DEFAULT_BUCKETS, HistogramHandle, Metrics, PrometheusMetrics};
pub use middleware::{CorsOptions, Middleware, Pipeline};
pub use request::{Params, Request};
pub use response::ResponseWriter;
pub use router::{RouteTable, Router};
pub use server::Listener;
pub use service::{BoundService, INTERNAL, PUBLIC, READINESS, Service, ServiceGlobals, ServiceOptions};
pub use shutdown::{
    BoxError, Coordinator, ExitFn, ExitSequence, ListenerExit, ShutdownFn, ShutdownState,
    StopReceiver, Trigger, os_signal, process_exit,
};
pub use version::{BuildVersion, VersionBuilder};
