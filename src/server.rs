//! HTTP listener and graceful close.
//!
//! # Graceful close
//!
//! A [`Listener`] serves until the stop-request signal fires, then:
//! 1. Immediately stops `listener.accept()`; no new connections are made.
//! 2. Asks every open connection to finish its in-flight request and close.
//! 3. Waits at most `drain_timeout` for them, then aborts the stragglers.
//! 4. Returns from [`Listener::serve`].
//!
//! A failed `accept` does not end the loop unless the socket itself is
//! broken: a connection dropped while queued is skipped, and running out of
//! file descriptors backs off from 5 ms up to 1 s before retrying. Any other
//! accept error closes the listener, which then returns it as [`Error::Io`].
//!
//! The stop signal is a `watch` channel, so every listener observes it no
//! matter when it subscribed, and each listener closes only itself, once.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::StatusCode;
use http_body_util::{BodyExt, Full};
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use tokio::net::TcpListener;
use tokio::task::JoinSet;

use crate::error::Error;
use crate::log::Logger;
use crate::request::Request;
use crate::response::ResponseWriter;
use crate::router::Router;
use crate::shutdown::{StopReceiver, stopped};

/// One bound HTTP listener for one logical server.
pub struct Listener {
    subsystem: &'static str,
    listener: TcpListener,
    addr: SocketAddr,
    log: Arc<dyn Logger>,
}

impl Listener {
    /// Binds `addr`. Port `0` picks a free port; see [`Listener::local_addr`].
    pub async fn bind(
        subsystem: &'static str,
        addr: SocketAddr,
        log: Arc<dyn Logger>,
    ) -> Result<Self, Error> {
        let listener = TcpListener::bind(addr).await?;
        let addr = listener.local_addr()?;
        Ok(Self { subsystem, listener, addr, log })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn subsystem(&self) -> &'static str {
        self.subsystem
    }

    /// Accepts connections and dispatches them through `router` until `stop`
    /// fires, then drains for at most `drain_timeout`.
    pub async fn serve(
        self,
        router: Router,
        mut stop: StopReceiver,
        drain_timeout: Duration,
    ) -> Result<(), Error> {
        let Self { subsystem, listener, addr, log } = self;

        // Wrap router in Arc so it can be shared across concurrent connection
        // tasks without copying the routing table.
        let router = Arc::new(router);

        log.info("Listener", format_args!("{subsystem} listening on {addr}"));

        // JoinSet tracks every spawned connection task so they can be drained.
        let mut tasks = JoinSet::new();

        let mut backoff = ACCEPT_BACKOFF_FLOOR;
        let mut fault = None;

        loop {
            let accepted = tokio::select! {
                // Check stop first so a shutdown immediately stops accepting,
                // even if more connections are queued.
                biased;

                trigger = stopped(&mut stop) => {
                    log.info(
                        "Listener",
                        format_args!("{subsystem} stopping ({trigger}), draining {} connection(s)", tasks.len()),
                    );
                    break;
                }

                res = listener.accept() => res,

                // Reap finished connection tasks so the JoinSet does not grow
                // without bound on long-running servers.
                Some(_) = tasks.join_next(), if !tasks.is_empty() => continue,
            };

            let (stream, peer) = match accepted {
                Ok(v) => {
                    backoff = ACCEPT_BACKOFF_FLOOR;
                    v
                }
                Err(e) => match AcceptFault::of(&e) {
                    AcceptFault::Connection => {
                        log.debug("Listener", format_args!("{subsystem} accept dropped a connection: {e}"));
                        continue;
                    }
                    AcceptFault::Exhausted => {
                        log.warn(
                            "Listener",
                            format_args!("{subsystem} accept error: {e}, retrying in {backoff:?}"),
                        );
                        tokio::select! {
                            biased;
                            _ = stopped(&mut stop) => {}
                            () = tokio::time::sleep(backoff) => {}
                        }
                        backoff = next_backoff(backoff);
                        continue;
                    }
                    AcceptFault::Fatal => {
                        log.error("Listener", format_args!("{subsystem} accept failed: {e}"));
                        fault = Some(e);
                        break;
                    }
                },
            };

            let router = Arc::clone(&router);
            let log = Arc::clone(&log);
            let mut stop = stop.clone();
            let io = TokioIo::new(stream);

            tasks.spawn(async move {
                // Called once per request on the connection.
                let svc = service_fn(move |req| {
                    let router = Arc::clone(&router);
                    async move { dispatch(router, req).await }
                });

                // `auto::Builder` handles both HTTP/1.1 and HTTP/2.
                let builder = ConnBuilder::new(TokioExecutor::new());
                let conn = builder.serve_connection(io, svc);
                tokio::pin!(conn);

                let res = tokio::select! {
                    res = conn.as_mut() => res,
                    _ = stopped(&mut stop) => {
                        conn.as_mut().graceful_shutdown();
                        conn.await
                    }
                };
                if let Err(e) = res {
                    log.debug("Listener", format_args!("{subsystem} connection {peer} error: {e}"));
                }
            });
        }

        // The listening socket closes here; in-flight connections keep going.
        drop(listener);

        let drained = tokio::time::timeout(drain_timeout, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;

        if drained.is_err() {
            log.warn(
                "Listener",
                format_args!(
                    "{subsystem} drain deadline of {drain_timeout:?} passed, aborting {} connection(s)",
                    tasks.len()
                ),
            );
            tasks.shutdown().await;
        }

        match fault {
            Some(e) => Err(Error::Io(e)),
            None => {
                log.info("Listener", format_args!("{subsystem} stopped"));
                Ok(())
            }
        }
    }
}

const ACCEPT_BACKOFF_FLOOR: Duration = Duration::from_millis(5);
const ACCEPT_BACKOFF_CEILING: Duration = Duration::from_secs(1);

fn next_backoff(current: Duration) -> Duration {
    (current * 2).min(ACCEPT_BACKOFF_CEILING)
}

/// What a failed `accept` means for the listener.
#[derive(Debug, PartialEq, Eq)]
enum AcceptFault {
    /// One pending connection went away before it was accepted. Skip it.
    Connection,
    /// Out of file descriptors or buffers. Wait and retry.
    Exhausted,
    /// The listening socket itself is broken. Stop serving.
    Fatal,
}

impl AcceptFault {
    fn of(e: &std::io::Error) -> Self {
        use std::io::ErrorKind;

        match e.kind() {
            ErrorKind::ConnectionAborted
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionRefused
            | ErrorKind::Interrupted
            | ErrorKind::WouldBlock
            | ErrorKind::TimedOut => return Self::Connection,
            ErrorKind::OutOfMemory => return Self::Exhausted,
            _ => {}
        }

        match e.raw_os_error() {
            #[cfg(unix)]
            Some(libc::EMFILE | libc::ENFILE | libc::ENOBUFS | libc::ENOMEM) => Self::Exhausted,
            _ => Self::Fatal,
        }
    }
}

/// Routes one request and produces one response.
///
/// The error type is [`Infallible`]: every failure becomes a status code
/// (404, 400, or whatever the middleware decides), so hyper never sees one.
async fn dispatch(
    router: Arc<Router>,
    req: hyper::Request<hyper::body::Incoming>,
) -> Result<http::Response<Full<Bytes>>, Infallible> {
    let (parts, body) = req.into_parts();

    let Some((handler, params)) = router.lookup(&parts.method, parts.uri.path()) else {
        return Ok(status_only(StatusCode::NOT_FOUND));
    };

    let body = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(_) => return Ok(status_only(StatusCode::BAD_REQUEST)),
    };

    let w = ResponseWriter::new();
    handler.call(w.clone(), Request::from_parts(parts, body), params).await;

    Ok(w.into_response())
}

fn status_only(status: StatusCode) -> http::Response<Full<Bytes>> {
    let mut res = http::Response::new(Full::new(Bytes::new()));
    *res.status_mut() = status;
    res
}
