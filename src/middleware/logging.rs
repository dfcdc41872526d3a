//! Access logging.

use std::sync::Arc;
use std::time::Instant;

use super::{Route, guarded};
use crate::handler::{BoxFuture, BoxedHandler, ErasedHandler};
use crate::log::Logger;
use crate::request::{Params, Request};
use crate::response::ResponseWriter;

/// Logs entry and exit of every dispatch at info level.
pub(super) struct RequestLogging {
    pub(super) inner: BoxedHandler,
    pub(super) route: Route,
    pub(super) log: Arc<dyn Logger>,
}

impl ErasedHandler for RequestLogging {
    fn call(&self, w: ResponseWriter, req: Request, params: Params) -> BoxFuture {
        let inner = Arc::clone(&self.inner);
        let route = self.route.clone();
        let log = Arc::clone(&self.log);

        Box::pin(async move {
            let method = req.method().clone();
            let path = req.path().to_owned();
            log.info("RequestLogging", format_args!("{method} {path} -> {route}"));

            let start = Instant::now();
            let outcome = guarded(inner, w.clone(), req, params).await;
            let elapsed = start.elapsed();

            match outcome {
                Ok(()) => log.info(
                    "RequestLogging",
                    format_args!("{method} {path} <- {route} {} in {elapsed:?}", w.status().as_u16()),
                ),
                Err(panic) => {
                    log.info(
                        "RequestLogging",
                        format_args!("{method} {path} <- {route} panicked after {elapsed:?}"),
                    );
                    std::panic::resume_unwind(panic);
                }
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
    use crate::test_utils::RecordingLogger;

    fn logging(log: &Arc<RecordingLogger>, inner: BoxedHandler) -> BoxedHandler {
        Arc::new(RequestLogging {
            inner,
            route: Route { subsystem: "public".into(), name: "ping".into() },
            log: log.clone(),
        })
    }

    #[tokio::test]
    async fn logs_entry_and_exit_with_status() {
        let log = RecordingLogger::new();
        let layer = logging(
            &log,
            (|w: ResponseWriter, _req: Request, _params: Params| async move {
                w.text(StatusCode::CREATED, "made");
            })
            .into_boxed_handler(),
        );

        layer
            .call(ResponseWriter::new(), Request::new(Method::POST, "/ping"), Params::default())
            .await;

        let lines = log.messages(Level::INFO);
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("POST /ping -> public/ping"), "{}", lines[0]);
        assert!(lines[1].contains("POST /ping <- public/ping 201 in"), "{}", lines[1]);
        assert_eq!(log.count(Level::ERROR), 0);
    }

    #[tokio::test]
    async fn panic_is_logged_and_rethrown() {
        let log = RecordingLogger::new();
        let layer = logging(
            &log,
            (|_w: ResponseWriter, _req: Request, _params: Params| async move {
                panic!("whoa");
            })
            .into_boxed_handler(),
        );

        let outcome =
            guarded(layer, ResponseWriter::new(), Request::new(Method::GET, "/ping"), Params::default())
                .await;

        assert!(outcome.is_err());
        let lines = log.messages(Level::INFO);
        assert_eq!(lines.len(), 2);
        assert!(lines[1].contains("panicked after"), "{}", lines[1]);
    }
}
