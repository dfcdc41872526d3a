//! Handler trait and type erasure.
//!
//! # How handlers are stored
//!
//! A route table holds handlers of *different* concrete types, and every
//! middleware wraps "some handler" without knowing which. Both needs are met
//! by a trait object: every handler, user-written or middleware-composed,
//! ends up as a [`BoxedHandler`] = `Arc<dyn ErasedHandler>`.
//!
//! ```text
//! async fn ping(w, req, params) { … }             ← user writes this
//!        ↓ service.add_route("ping", …, ping)
//! ping.into_boxed_handler()                       ← Handler blanket impl
//!        ↓
//! Arc::new(FnHandler(ping))                       ← heap-allocated wrapper
//!        ↓  pipeline.compose(…)
//! Arc::new(Counter { inner, … })                  ← middleware wraps the Arc
//!        ↓  stored in the router
//! handler.call(w, req, params) at request time    ← one vtable call per layer
//! ```
//!
//! A handler signals failure only by panicking; it never returns an error.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::request::{Params, Request};
use crate::response::ResponseWriter;

/// A heap-allocated, type-erased future that completes when the handler is
/// done writing.
pub type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Dispatch interface shared by user handlers and middleware layers.
///
/// `#[doc(hidden)] pub` because it appears in the public `Handler` trait's
/// `into_boxed_handler` method and in [`Pipeline::compose`](crate::Pipeline::compose).
#[doc(hidden)]
pub trait ErasedHandler {
    fn call(&self, w: ResponseWriter, req: Request, params: Params) -> BoxFuture;
}

/// A type-erased handler shared across concurrent requests.
#[doc(hidden)]
pub type BoxedHandler = Arc<dyn ErasedHandler + Send + Sync + 'static>;

/// Implemented for every valid route handler.
///
/// Satisfied automatically for any function or closure shaped like:
///
/// ```text
/// async fn name(w: ResponseWriter, req: Request, params: Params)
/// ```
///
/// The trait is sealed: only the blanket impl below can satisfy it.
pub trait Handler: private::Sealed + Send + Sync + 'static {
    #[doc(hidden)]
    fn into_boxed_handler(self) -> BoxedHandler;
}

mod private {
    pub trait Sealed {}
}

impl<F, Fut> private::Sealed for F
where
    F: Fn(ResponseWriter, Request, Params) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
}

impl<F, Fut> Handler for F
where
    F: Fn(ResponseWriter, Request, Params) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    fn into_boxed_handler(self) -> BoxedHandler {
        Arc::new(FnHandler(self))
    }
}

/// Bridges a concrete handler `F` into the trait-object world.
struct FnHandler<F>(F);

impl<F, Fut> ErasedHandler for FnHandler<F>
where
    F: Fn(ResponseWriter, Request, Params) -> Fut + Send + Sync,
    Fut: Future<Output = ()> + Send + 'static,
{
    fn call(&self, w: ResponseWriter, req: Request, params: Params) -> BoxFuture {
        Box::pin((self.0)(w, req, params))
    }
}
