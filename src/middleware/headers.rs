//! Response header layers: cache suppression and CORS.

use std::sync::Arc;

use http::HeaderValue;
use http::header::{
    ACCESS_CONTROL_ALLOW_METHODS, ACCESS_CONTROL_ALLOW_ORIGIN, CACHE_CONTROL, EXPIRES, PRAGMA,
    VARY,
};

use crate::handler::{BoxFuture, BoxedHandler, ErasedHandler};
use crate::log::Logger;
use crate::request::{Params, Request};
use crate::response::ResponseWriter;

/// Tells clients and intermediaries not to cache the response. Applied
/// unconditionally, before dispatch.
pub(super) struct NoCaching {
    pub(super) inner: BoxedHandler,
}

impl ErasedHandler for NoCaching {
    fn call(&self, w: ResponseWriter, req: Request, params: Params) -> BoxFuture {
        w.set_header(CACHE_CONTROL, HeaderValue::from_static("no-cache, no-store, must-revalidate"));
        w.set_header(PRAGMA, HeaderValue::from_static("no-cache"));
        w.set_header(EXPIRES, HeaderValue::from_static("0"));
        self.inner.call(w, req, params)
    }
}

/// Allow-lists for the `CORS` middleware.
#[derive(Clone, Debug)]
pub struct CorsOptions {
    /// Origins allowed to read responses; `"*"` allows any.
    pub allowed_origins: Vec<String>,
    /// Methods advertised in `Access-Control-Allow-Methods`.
    pub allowed_methods: Vec<String>,
}

impl Default for CorsOptions {
    fn default() -> Self {
        Self {
            allowed_origins: vec!["*".into()],
            allowed_methods: vec!["GET".into()],
        }
    }
}

/// [`CorsOptions`] resolved once into header values.
pub(super) struct CorsPolicy {
    any_origin: bool,
    origins: Vec<String>,
    methods: Option<HeaderValue>,
}

impl CorsPolicy {
    pub(super) fn new(options: &CorsOptions, log: &dyn Logger) -> Self {
        let methods = if options.allowed_methods.is_empty() {
            None
        } else {
            let joined = options.allowed_methods.join(", ");
            match HeaderValue::from_str(&joined) {
                Ok(v) => Some(v),
                Err(_) => {
                    log.warn("CORS", format_args!("ignoring unusable allowed methods {joined:?}"));
                    None
                }
            }
        };

        Self {
            any_origin: options.allowed_origins.iter().any(|o| o == "*"),
            origins: options.allowed_origins.clone(),
            methods,
        }
    }

    fn allow_origin(&self, request_origin: Option<&str>) -> Option<HeaderValue> {
        if self.any_origin {
            return Some(HeaderValue::from_static("*"));
        }
        let origin = request_origin?;
        self.origins
            .iter()
            .find(|allowed| allowed.eq_ignore_ascii_case(origin))
            .and_then(|allowed| HeaderValue::from_str(allowed).ok())
    }
}

/// Sets CORS response headers before dispatch. Preflight requests are not
/// short-circuited; an `OPTIONS` route must be registered like any other.
pub(super) struct Cors {
    pub(super) inner: BoxedHandler,
    pub(super) policy: Arc<CorsPolicy>,
}

impl ErasedHandler for Cors {
    fn call(&self, w: ResponseWriter, req: Request, params: Params) -> BoxFuture {
        if let Some(origin) = self.policy.allow_origin(req.header("origin")) {
            w.set_header(ACCESS_CONTROL_ALLOW_ORIGIN, origin);
            if !self.policy.any_origin {
                w.set_header(VARY, HeaderValue::from_static("Origin"));
            }
        }
        if let Some(methods) = &self.policy.methods {
            w.set_header(ACCESS_CONTROL_ALLOW_METHODS, methods.clone());
        }
        self.inner.call(w, req, params)
    }
}
