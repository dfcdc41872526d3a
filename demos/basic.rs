//! Minimal service: JSON endpoints on the public server, the built-in
//! probes, metrics and quit endpoints on the other two.
//!
//! Run with:
//!   HTTPPORT=3000 LOG_MINFILTER=Info cargo run --example basic
//!
//! Try:
//!   curl http://localhost:3000/users/42
//!   curl -X POST http://localhost:3000/users -d '{"name":"alice"}'
//!   curl http://localhost:3000/boom                # recovered, 500
//!   curl http://localhost:3000/service/version
//!   curl http://localhost:3001/service/readiness
//!   curl http://localhost:3002/metrics
//!   curl http://localhost:3002/quit                # graceful shutdown

use std::sync::Arc;

use http::StatusCode;
use service_foundation::{
    BoxError, Logger, Middleware, Params, Request, ResponseWriter, Service, ShutdownFn,
};

#[tokio::main]
async fn main() -> Result<(), service_foundation::Error> {
    let shutdown: ShutdownFn = Arc::new(|log: &dyn Logger| -> Result<(), BoxError> {
        log.info("Demo", format_args!("closing connections"));
        Ok(())
    });

    let mut service = Service::new("demo", &["GET", "POST"], Some(shutdown))?;

    let observed = [
        Middleware::PanicRecovery,
        Middleware::RequestLogging,
        Middleware::Cors,
        Middleware::Counter,
        Middleware::Histogram,
    ];
    service.add_route("get_user", &["/users/{id}"], &["GET"], &observed, get_user);
    service.add_route("create_user", &["/users"], &["POST"], &observed, create_user);
    service.add_route("boom", &["/boom"], &["GET"], &observed, boom);

    // Exits the process once a shutdown trigger fires.
    service.run(std::future::pending()).await;
    Ok(())
}

// GET /users/{id}
async fn get_user(w: ResponseWriter, _req: Request, params: Params) {
    let id = params.get("id").unwrap_or("unknown");
    w.json(StatusCode::OK, format!(r#"{{"id":"{id}","name":"alice"}}"#));
}

// POST /users
//
// req.body() is the raw bytes; parse with serde_json::from_slice or similar.
async fn create_user(w: ResponseWriter, req: Request, _params: Params) {
    if req.body().is_empty() {
        w.write_header(StatusCode::BAD_REQUEST);
        return;
    }
    w.set_header(http::header::LOCATION, http::HeaderValue::from_static("/users/99"));
    w.json(StatusCode::CREATED, r#"{"id":"99","name":"new_user"}"#);
}

async fn boom(_w: ResponseWriter, _req: Request, _params: Params) {
    panic!("demo handler fault");
}
