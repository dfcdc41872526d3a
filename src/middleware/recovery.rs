//! Outermost panic guard.

use std::sync::Arc;

use super::{Route, contain, guarded};
use crate::handler::{BoxFuture, BoxedHandler, ErasedHandler};
use crate::log::Logger;
use crate::request::{Params, Request};
use crate::response::ResponseWriter;

/// Stops a panic from escaping the handler. A single faulty request must
/// never take down the connection, let alone the process.
pub(super) struct PanicRecovery {
    pub(super) inner: BoxedHandler,
    pub(super) route: Route,
    pub(super) log: Arc<dyn Logger>,
}

impl ErasedHandler for PanicRecovery {
    fn call(&self, w: ResponseWriter, req: Request, params: Params) -> BoxFuture {
        let inner = Arc::clone(&self.inner);
        let route = self.route.clone();
        let log = Arc::clone(&self.log);

        Box::pin(async move {
            if let Err(panic) = guarded(inner, w.clone(), req, params).await {
                contain("PanicRecovery", &route, log.as_ref(), &w, panic);
            }
        })
    }
}
