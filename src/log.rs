//! Logger capability and its `tracing` backed default.
//!
//! Every component that logs receives an `Arc<dyn Logger>` at construction.
//! The default [`TracingLogger`] turns each call into a `tracing` event with
//! the call's `tag` attached as a structured field, so whatever subscriber
//! the process installs decides formatting and sinks.

use std::fmt;

use tracing::Level;
use tracing_subscriber::EnvFilter;

/// Structured, levelled logging keyed by a short tag (usually the component
/// or operation that is logging, e.g. `"PanicRecovery"`).
pub trait Logger: Send + Sync {
    fn log(&self, level: Level, tag: &str, message: fmt::Arguments<'_>);

    fn debug(&self, tag: &str, message: fmt::Arguments<'_>) {
        self.log(Level::DEBUG, tag, message);
    }

    fn info(&self, tag: &str, message: fmt::Arguments<'_>) {
        self.log(Level::INFO, tag, message);
    }

    fn warn(&self, tag: &str, message: fmt::Arguments<'_>) {
        self.log(Level::WARN, tag, message);
    }

    fn error(&self, tag: &str, message: fmt::Arguments<'_>) {
        self.log(Level::ERROR, tag, message);
    }
}

/// Forwards to the `tracing` macros.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingLogger;

impl Logger for TracingLogger {
    fn log(&self, level: Level, tag: &str, message: fmt::Arguments<'_>) {
        // The tracing macros need the level as a constant.
        match level {
            Level::ERROR => tracing::error!(tag, "{message}"),
            Level::WARN => tracing::warn!(tag, "{message}"),
            Level::INFO => tracing::info!(tag, "{message}"),
            Level::DEBUG => tracing::debug!(tag, "{message}"),
            Level::TRACE => tracing::trace!(tag, "{message}"),
        }
    }
}

/// Maps a minimum-level name (`Debug`, `Info`, `Warning`, `Error`, any case)
/// to an `EnvFilter` directive. Unrecognised names fall back to `warn`.
pub fn filter_directive(min_filter: &str) -> &'static str {
    match min_filter.trim().to_ascii_lowercase().as_str() {
        "trace" => "trace",
        "debug" => "debug",
        "info" | "information" => "info",
        "error" | "fatal" => "error",
        _ => "warn",
    }
}

/// Installs a global fmt subscriber filtered at `min_filter`.
///
/// `RUST_LOG` takes precedence when set. Calling this more than once (or
/// after the host application installed its own subscriber) is harmless:
/// the first subscriber stays in place.
pub fn init_logging(min_filter: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter_directive(min_filter)));

    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
