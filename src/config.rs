//! Environment-driven service configuration.
//!
//! ```bash
//! HTTPPORT=9000 CORS_ORIGINS=https://a.example,https://b.example \
//!   LOG_MINFILTER=Info ./my-service
//! ```
//!
//! The public server listens on `HTTPPORT`, the readiness server on
//! `HTTPPORT + 1` and the internal server on `HTTPPORT + 2`.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use clap::Parser;

use crate::error::Error;

#[derive(Debug, Clone, Parser)]
#[command(about = "Service foundation settings")]
pub struct ServiceConfig {
    /// Public port; readiness and internal use the next two.
    #[arg(long, default_value = "8080", env = "HTTPPORT")]
    pub port: u16,

    #[arg(long, default_value = "0.0.0.0", env = "HTTPHOST")]
    pub host: IpAddr,

    /// Comma separated; `*` allows any origin.
    #[arg(long = "cors-origins", default_value = "*", value_delimiter = ',', env = "CORS_ORIGINS")]
    pub cors_origins: Vec<String>,

    /// `Debug`, `Info`, `Warning` or `Error`.
    #[arg(long = "log-min-filter", default_value = "Warning", env = "LOG_MINFILTER")]
    pub log_min_filter: String,

    #[arg(long = "app-name", env = "APP_NAME")]
    pub app_name: Option<String>,

    #[arg(long = "server-name", env = "SERVER_NAME")]
    pub server_name: Option<String>,

    #[arg(long = "deploy-environment", default_value = "UNKNOWN", env = "DEPLOY_ENVIRONMENT")]
    pub deploy_environment: String,

    /// Drain deadline for each listener, in seconds.
    #[arg(long = "server-timeout-secs", default_value = "20", env = "SERVER_TIMEOUT_SECS")]
    pub server_timeout_secs: u64,

    /// Fallback for the app and server names.
    #[arg(skip)]
    pub service_name: String,
}

impl ServiceConfig {
    /// Reads the environment only; the process arguments are ignored so the
    /// host binary keeps its own command line.
    pub fn from_env(name: &str) -> Result<Self, Error> {
        Self::from_args(name, std::iter::empty::<String>())
    }

    /// Parses `args` on top of the environment. Mostly useful for tests.
    pub fn from_args<I, T>(name: &str, args: I) -> Result<Self, Error>
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        let argv = std::iter::once(name.to_owned()).chain(args.into_iter().map(Into::into));
        let mut config = Self::try_parse_from(argv)?;
        config.service_name = name.to_owned();
        Ok(config)
    }

    pub fn app_name(&self) -> &str {
        self.app_name.as_deref().unwrap_or(&self.service_name)
    }

    pub fn server_name(&self) -> &str {
        self.server_name.as_deref().unwrap_or(&self.service_name)
    }

    pub fn public_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    pub fn readiness_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port.saturating_add(1))
    }

    pub fn internal_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port.saturating_add(2))
    }

    pub fn server_timeout(&self) -> Duration {
        Duration::from_secs(self.server_timeout_secs)
    }
}
