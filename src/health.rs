//! Built-in service-management handlers.
//!
//! | Route | Path | Server(s) |
//! |---|---|---|
//! | root | `/` | all |
//! | liveness | `/service/liveness` | readiness, public |
//! | readiness | `/service/readiness` | readiness, public |
//! | health | `/health_check`, `/healthz` | internal |
//! | version | `/service/version` | public |
//! | metrics | `/metrics` | internal |
//! | quit | `/quit` | internal |
//!
//! Probes answer `200 ok` or `503`, based on a [`ServiceStateReader`]. Plug in
//! your own reader to gate readiness on dependencies (database connections,
//! downstream services, warm-up).

use std::sync::Arc;

use http::header::CONTENT_TYPE;
use http::{HeaderValue, StatusCode};

use crate::handler::{BoxedHandler, Handler};
use crate::metrics::Metrics;
use crate::request::{Params, Request};
use crate::response::ResponseWriter;
use crate::shutdown::{ShutdownState, Trigger};
use crate::version::VersionBuilder;

const PROMETHEUS_TEXT: &str = "text/plain; version=0.0.4";

/// Answers the orchestrator's probe questions.
pub trait ServiceStateReader: Send + Sync {
    /// Failure means restart the process.
    fn is_live(&self) -> bool;
    /// Failure means take the instance out of load balancing.
    fn is_ready(&self) -> bool;
    fn is_healthy(&self) -> bool;
}

/// Default [`ServiceStateReader`]: if the process can answer HTTP at all, it
/// is live, ready and healthy.
#[derive(Clone, Copy, Debug, Default)]
pub struct AlwaysReady;

impl ServiceStateReader for AlwaysReady {
    fn is_live(&self) -> bool {
        true
    }

    fn is_ready(&self) -> bool {
        true
    }

    fn is_healthy(&self) -> bool {
        true
    }
}

fn probe(w: &ResponseWriter, ok: bool) {
    if ok {
        w.text(StatusCode::OK, "ok");
    } else {
        w.write_header(StatusCode::SERVICE_UNAVAILABLE);
    }
}

pub(crate) fn root(app_name: Arc<str>) -> BoxedHandler {
    (move |w: ResponseWriter, _req: Request, _params: Params| {
        let app_name = Arc::clone(&app_name);
        async move { w.text(StatusCode::OK, &*app_name) }
    })
    .into_boxed_handler()
}

pub(crate) fn liveness(state: Arc<dyn ServiceStateReader>) -> BoxedHandler {
    (move |w: ResponseWriter, _req: Request, _params: Params| {
        let ok = state.is_live();
        async move { probe(&w, ok) }
    })
    .into_boxed_handler()
}

pub(crate) fn readiness(state: Arc<dyn ServiceStateReader>) -> BoxedHandler {
    (move |w: ResponseWriter, _req: Request, _params: Params| {
        let ok = state.is_ready();
        async move { probe(&w, ok) }
    })
    .into_boxed_handler()
}

pub(crate) fn health(state: Arc<dyn ServiceStateReader>) -> BoxedHandler {
    (move |w: ResponseWriter, _req: Request, _params: Params| {
        let ok = state.is_healthy();
        async move { probe(&w, ok) }
    })
    .into_boxed_handler()
}

/// Serves the build version as JSON.
pub(crate) fn version(builder: Arc<dyn VersionBuilder>) -> BoxedHandler {
    (move |w: ResponseWriter, _req: Request, _params: Params| {
        let version = builder.version();
        async move {
            match serde_json::to_vec(&version) {
                Ok(body) => w.json(StatusCode::OK, body),
                Err(_) => w.write_header(StatusCode::INTERNAL_SERVER_ERROR),
            }
        }
    })
    .into_boxed_handler()
}

/// Serves the metrics backend's exposition text.
pub(crate) fn metrics(metrics: Arc<dyn Metrics>) -> BoxedHandler {
    (move |w: ResponseWriter, _req: Request, _params: Params| {
        let body = metrics.render();
        async move {
            w.set_header(CONTENT_TYPE, HeaderValue::from_static(PROMETHEUS_TEXT));
            w.write_header(StatusCode::OK);
            w.write(body);
        }
    })
    .into_boxed_handler()
}

/// Requests a graceful shutdown. Answers before the listeners stop, so the
/// caller sees the response.
pub(crate) fn quit(state: Arc<ShutdownState>) -> BoxedHandler {
    (move |w: ResponseWriter, _req: Request, _params: Params| {
        state.trigger(Trigger::Quit);
        async move { w.text(StatusCode::OK, "quitting") }
    })
    .into_boxed_handler()
}
