//! Route registration and radix-tree dispatch.
//!
//! Registration and dispatch are two types. A [`RouteTable`] collects
//! `(method, path) → composed handler` entries while the service is being
//! set up, and it is the only place where registration faults are resolved.
//! [`RouteTable::into_router`] then freezes it into a [`Router`]: one
//! `matchit` tree per method, O(path-length) lookup, never mutated again.

use std::collections::HashMap;
use std::sync::Arc;

use http::Method;
use matchit::Router as MatchitRouter;

use crate::handler::BoxedHandler;
use crate::log::Logger;
use crate::middleware::{Middleware, Pipeline};
use crate::request::Params;

/// Methods used by every built-in route.
pub const GET_METHODS: &[&str] = &["GET"];

struct Entry {
    name: String,
    handler: BoxedHandler,
}

/// Mutable registry for one logical server (public, readiness, internal).
pub struct RouteTable {
    subsystem: &'static str,
    log: Arc<dyn Logger>,
    entries: HashMap<(Method, String), Entry>,
    // Registration order, so the frozen trees are built deterministically.
    order: Vec<(Method, String)>,
}

impl RouteTable {
    pub fn new(subsystem: &'static str, log: Arc<dyn Logger>) -> Self {
        Self { subsystem, log, entries: HashMap::new(), order: Vec::new() }
    }

    pub fn subsystem(&self) -> &'static str {
        self.subsystem
    }

    /// Number of distinct `(method, path)` pairs registered.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Composes `handler` with `chain` once per `(path, method)` pair and
    /// records the result.
    ///
    /// Never fails. Unparseable methods are skipped with a warning; a pair
    /// that is already registered is overwritten with a warning.
    pub fn register(
        &mut self,
        pipeline: &Pipeline,
        name: &str,
        paths: &[&str],
        methods: &[&str],
        chain: &[Middleware],
        handler: BoxedHandler,
    ) {
        for path in paths {
            for raw in methods {
                let method = match Method::from_bytes(raw.trim().to_ascii_uppercase().as_bytes()) {
                    Ok(m) => m,
                    Err(_) => {
                        self.log.warn(
                            "AddRoute",
                            format_args!("route {}/{name}: skipping invalid method {raw:?}", self.subsystem),
                        );
                        continue;
                    }
                };

                let composed = pipeline.compose(self.subsystem, name, chain, Arc::clone(&handler));
                let key = (method, (*path).to_owned());
                let entry = Entry { name: name.to_owned(), handler: composed };

                match self.entries.insert(key.clone(), entry) {
                    Some(previous) => self.log.warn(
                        "AddRoute",
                        format_args!(
                            "{} {} {path} registered by {:?} is replaced by {name:?}",
                            self.subsystem, key.0, previous.name
                        ),
                    ),
                    None => self.order.push(key),
                }
            }
        }
    }

    /// Freezes the table into the immutable dispatch structure.
    pub fn into_router(self) -> Router {
        let mut routes: HashMap<Method, MatchitRouter<BoxedHandler>> = HashMap::new();
        let mut entries = self.entries;

        for (method, path) in self.order {
            let Some(entry) = entries.remove(&(method.clone(), path.clone())) else {
                continue;
            };
            if let Err(e) = routes.entry(method.clone()).or_default().insert(path.as_str(), entry.handler) {
                self.log.warn(
                    "AddRoute",
                    format_args!("{} {method} {path} ({}) not routable: {e}", self.subsystem, entry.name),
                );
            }
        }

        Router { routes }
    }
}

/// Immutable dispatch table: one radix tree per HTTP method.
///
/// Shared read-only by every connection of a listener; needs no locking.
pub struct Router {
    routes: HashMap<Method, MatchitRouter<BoxedHandler>>,
}

impl Router {
    /// Resolves a request to its composed handler and path parameters.
    pub fn lookup(&self, method: &Method, path: &str) -> Option<(BoxedHandler, Params)> {
        let tree = self.routes.get(method)?;
        let matched = tree.at(path).ok()?;
        let handler = Arc::clone(matched.value);
        let params = matched.params.iter().collect();
        Some((handler, params))
    }
}
