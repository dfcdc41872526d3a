//! Unified error type.

use thiserror::Error;

/// The error type returned by the crate's fallible constructors and by a
/// listener that stops on its own.
///
/// Application-level failures (404, 500, etc.) are written to the
/// [`ResponseWriter`](crate::ResponseWriter), not returned as `Error`s.
/// Route registration and [`Service::run`](crate::Service::run) never fail
/// either: their faults are logged and resolved internally.
#[derive(Debug, Error)]
pub enum Error {
    /// Binding a port, accepting a connection or serving it failed.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    /// A listener task ended without returning, typically by panicking.
    #[error("listener task: {0}")]
    ListenerTask(#[from] tokio::task::JoinError),

    /// The environment-driven configuration could not be parsed.
    #[error("config: {0}")]
    Config(#[from] clap::Error),

    /// The Prometheus recorder rejected its configuration.
    #[error("metrics: {0}")]
    Metrics(#[from] metrics_exporter_prometheus::BuildError),
}
