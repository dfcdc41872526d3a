//! The service: three route tables, three listeners, one shutdown.
//!
//! ```text
//!   Service::new / with_options      built-in routes registered
//!          │
//!   add_route(...)                   custom routes, public server only
//!          │
//!   bind()  ─▶ BoundService          ports bound (failures are remembered)
//!          │
//!   run(cancel) ─▶ exit code         listeners spawned, Coordinator waits
//! ```

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::config::ServiceConfig;
use crate::error::Error;
use crate::handler::Handler;
use crate::health::{self, AlwaysReady, ServiceStateReader};
use crate::log::{Logger, TracingLogger, init_logging};
use crate::metrics::{DEFAULT_BUCKETS, Metrics, PrometheusMetrics};
use crate::middleware::{CorsOptions, Middleware, Pipeline};
use crate::router::{GET_METHODS, RouteTable};
use crate::server::Listener;
use crate::shutdown::{
    Coordinator, ExitFn, ExitSequence, ListenerExit, ShutdownFn, ShutdownState, os_signal,
    process_exit,
};
use crate::version::{BuildVersion, VersionBuilder};

pub const PUBLIC: &str = "public";
pub const READINESS: &str = "readiness";
pub const INTERNAL: &str = "internal";

/// Extra time the coordinator grants the listeners beyond their own drain
/// deadline before it exits without them.
const ACK_GRACE: Duration = Duration::from_secs(1);

/// Basic service properties.
#[derive(Clone, Debug)]
pub struct ServiceGlobals {
    pub app_name: String,
    pub server_name: String,
    pub deploy_environment: String,
    pub version_number: String,
}

/// Everything a [`Service`] is built from. Every collaborator is a public
/// field, so any of them can be replaced before [`Service::with_options`].
pub struct ServiceOptions {
    pub globals: ServiceGlobals,
    pub public_addr: SocketAddr,
    pub readiness_addr: SocketAddr,
    pub internal_addr: SocketAddr,
    /// Drain deadline of each listener.
    pub server_timeout: Duration,
    pub log: Arc<dyn Logger>,
    pub metrics: Arc<dyn Metrics>,
    pub cors: CorsOptions,
    /// Chain applied to every built-in route.
    pub default_middlewares: Vec<Middleware>,
    pub version: Arc<dyn VersionBuilder>,
    pub state_reader: Arc<dyn ServiceStateReader>,
    pub shutdown_fn: Option<ShutdownFn>,
    pub exit_fn: ExitFn,
}

impl ServiceOptions {
    /// Default collaborators for `config`: `tracing` logging (installed
    /// here), a Prometheus recorder namespaced by the service name, the
    /// build version, an always-ready state reader and `process::exit`.
    pub fn from_config(
        config: &ServiceConfig,
        allowed_methods: &[&str],
        shutdown_fn: Option<ShutdownFn>,
    ) -> Result<Self, Error> {
        init_logging(&config.log_min_filter);

        let metrics = PrometheusMetrics::new(&config.service_name, DEFAULT_BUCKETS)?;
        let version = BuildVersion::from_build_env();

        Ok(Self {
            globals: ServiceGlobals {
                app_name: config.app_name().to_owned(),
                server_name: config.server_name().to_owned(),
                deploy_environment: config.deploy_environment.clone(),
                version_number: version.version_number.clone(),
            },
            public_addr: config.public_addr(),
            readiness_addr: config.readiness_addr(),
            internal_addr: config.internal_addr(),
            server_timeout: config.server_timeout(),
            log: Arc::new(TracingLogger),
            metrics: Arc::new(metrics),
            cors: CorsOptions {
                allowed_origins: config.cors_origins.clone(),
                allowed_methods: allowed_methods.iter().map(|m| (*m).to_owned()).collect(),
            },
            default_middlewares: Middleware::defaults(),
            version: Arc::new(version),
            state_reader: Arc::new(AlwaysReady),
            shutdown_fn,
            exit_fn: process_exit(),
        })
    }
}

/// A configured service that has not started yet.
pub struct Service {
    globals: ServiceGlobals,
    addrs: [(&'static str, SocketAddr); 3],
    server_timeout: Duration,
    log: Arc<dyn Logger>,
    version: Arc<dyn VersionBuilder>,
    pipeline: Pipeline,
    state: Arc<ShutdownState>,
    shutdown_fn: Option<ShutdownFn>,
    exit_fn: ExitFn,
    public: RouteTable,
    readiness: RouteTable,
    internal: RouteTable,
}

impl Service {
    /// A service configured from the environment (see [`ServiceConfig`]).
    ///
    /// `allowed_methods` is advertised by the `CORS` middleware.
    pub fn new(
        name: &str,
        allowed_methods: &[&str],
        shutdown_fn: Option<ShutdownFn>,
    ) -> Result<Self, Error> {
        let config = ServiceConfig::from_env(name)?;
        Ok(Self::with_options(ServiceOptions::from_config(&config, allowed_methods, shutdown_fn)?))
    }

    pub fn with_options(options: ServiceOptions) -> Self {
        let ServiceOptions {
            globals,
            public_addr,
            readiness_addr,
            internal_addr,
            server_timeout,
            log,
            metrics,
            cors,
            default_middlewares,
            version,
            state_reader,
            shutdown_fn,
            exit_fn,
        } = options;

        let pipeline = Pipeline::new(Arc::clone(&log), Arc::clone(&metrics), &cors);
        let state = ShutdownState::new();
        let app_name: Arc<str> = globals.app_name.as_str().into();
        let chain = default_middlewares.as_slice();

        let mut readiness = RouteTable::new(READINESS, Arc::clone(&log));
        readiness.register(&pipeline, "root", &["/"], GET_METHODS, chain, health::root(Arc::clone(&app_name)));
        readiness.register(&pipeline, "liveness", &["/service/liveness"], GET_METHODS, chain, health::liveness(Arc::clone(&state_reader)));
        readiness.register(&pipeline, "readiness", &["/service/readiness"], GET_METHODS, chain, health::readiness(Arc::clone(&state_reader)));

        let mut internal = RouteTable::new(INTERNAL, Arc::clone(&log));
        internal.register(&pipeline, "root", &["/"], GET_METHODS, chain, health::root(Arc::clone(&app_name)));
        internal.register(&pipeline, "health_check", &["/health_check", "/healthz"], GET_METHODS, chain, health::health(Arc::clone(&state_reader)));
        internal.register(&pipeline, "metrics", &["/metrics"], GET_METHODS, chain, health::metrics(Arc::clone(&metrics)));
        internal.register(&pipeline, "quit", &["/quit"], GET_METHODS, chain, health::quit(Arc::clone(&state)));

        let mut public = RouteTable::new(PUBLIC, Arc::clone(&log));
        public.register(&pipeline, "root", &["/"], GET_METHODS, chain, health::root(app_name));
        public.register(&pipeline, "version", &["/service/version"], GET_METHODS, chain, health::version(Arc::clone(&version)));
        public.register(&pipeline, "liveness", &["/service/liveness"], GET_METHODS, chain, health::liveness(Arc::clone(&state_reader)));
        public.register(&pipeline, "readiness", &["/service/readiness"], GET_METHODS, chain, health::readiness(state_reader));

        Self {
            globals,
            addrs: [(READINESS, readiness_addr), (INTERNAL, internal_addr), (PUBLIC, public_addr)],
            server_timeout,
            log,
            version,
            pipeline,
            state,
            shutdown_fn,
            exit_fn,
            public,
            readiness,
            internal,
        }
    }

    pub fn globals(&self) -> &ServiceGlobals {
        &self.globals
    }

    /// Registers `handler` on the public server for every `paths` × `methods`
    /// pair, wrapped in `chain` (first entry outermost). The built-in default
    /// chain is not added.
    ///
    /// Never fails: invalid methods are skipped and duplicate pairs replace
    /// the earlier registration, each with a warning.
    pub fn add_route(
        &mut self,
        name: &str,
        paths: &[&str],
        methods: &[&str],
        chain: &[Middleware],
        handler: impl Handler,
    ) {
        self.public.register(&self.pipeline, name, paths, methods, chain, handler.into_boxed_handler());
    }

    /// The shutdown guard this service obeys. Triggering it stops the
    /// service exactly like the `/quit` endpoint does.
    pub fn shutdown_state(&self) -> Arc<ShutdownState> {
        Arc::clone(&self.state)
    }

    /// Binds all three ports. A port that cannot be bound is not an error
    /// here: [`BoundService::run`] reports it as a listener that exited.
    pub async fn bind(self) -> BoundService {
        let Self {
            globals,
            addrs,
            server_timeout,
            log,
            version,
            state,
            shutdown_fn,
            exit_fn,
            public,
            readiness,
            internal,
            ..
        } = self;

        let mut listeners = Vec::with_capacity(3);
        let mut failed = Vec::new();

        for ((subsystem, addr), table) in addrs.into_iter().zip([readiness, internal, public]) {
            match Listener::bind(subsystem, addr, Arc::clone(&log)).await {
                Ok(listener) => listeners.push((listener, table)),
                Err(e) => failed.push(ListenerExit { subsystem, result: Err(e) }),
            }
        }

        BoundService {
            globals,
            server_timeout,
            log,
            version,
            state,
            shutdown_fn,
            exit_fn,
            listeners,
            failed,
        }
    }

    /// Binds, serves and shuts down. See [`BoundService::run`].
    pub async fn run<C>(self, cancel: C) -> i32
    where
        C: Future<Output = ()>,
    {
        self.bind().await.run(cancel).await
    }
}

/// A service whose ports are bound but not yet served.
pub struct BoundService {
    globals: ServiceGlobals,
    server_timeout: Duration,
    log: Arc<dyn Logger>,
    version: Arc<dyn VersionBuilder>,
    state: Arc<ShutdownState>,
    shutdown_fn: Option<ShutdownFn>,
    exit_fn: ExitFn,
    listeners: Vec<(Listener, RouteTable)>,
    failed: Vec<ListenerExit>,
}

impl BoundService {
    /// Address actually bound for `subsystem` (useful with port `0`).
    pub fn local_addr(&self, subsystem: &str) -> Option<SocketAddr> {
        self.listeners
            .iter()
            .find(|(l, _)| l.subsystem() == subsystem)
            .map(|(l, _)| l.local_addr())
    }

    pub fn shutdown_state(&self) -> Arc<ShutdownState> {
        Arc::clone(&self.state)
    }

    /// Serves until the first of: a listener exits, `cancel` resolves,
    /// SIGTERM/SIGINT arrives, or the shutdown state is triggered (e.g. by
    /// `/quit`). Then stops every listener, runs the exit sequence and
    /// returns the exit code it passed to the exit function.
    pub async fn run<C>(self, cancel: C) -> i32
    where
        C: Future<Output = ()>,
    {
        let Self {
            globals,
            server_timeout,
            log,
            version,
            state,
            shutdown_fn,
            exit_fn,
            listeners,
            failed,
        } = self;

        log.info("Service", format_args!("{}: {}", globals.app_name, version.to_line()));

        let cohort = listeners.len() + failed.len();
        let (exits_tx, exits_rx) = mpsc::channel(cohort.max(1));
        for exit in failed {
            // Capacity covers the whole cohort.
            let _ = exits_tx.try_send(exit);
        }

        for (listener, table) in listeners {
            log.info(
                "Service",
                format_args!("{} {} running on {}", globals.app_name, listener.subsystem(), listener.local_addr()),
            );

            let stop = state.subscribe();
            let tx = exits_tx.clone();
            let subsystem = listener.subsystem();
            let serve = listener.serve(table.into_router(), stop, server_timeout);
            tokio::spawn(ListenerExit::report(subsystem, serve, tx));
        }
        drop(exits_tx);

        let exit = ExitSequence::new(Arc::clone(&log), shutdown_fn, exit_fn);
        let coordinator =
            Coordinator::new(state, exit, Arc::clone(&log), cohort, server_timeout + ACK_GRACE);

        coordinator.run(exits_rx, cancel, os_signal(log)).await
    }
}
