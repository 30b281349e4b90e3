//! Gateway server

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum_server::tls_rustls::RustlsConfig;
use futures::future::BoxFuture;
use hyper_util::rt::TokioTimer;
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio::signal;
use tokio::sync::{oneshot, watch};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::auth::{AuthState, CredentialValidator};
use super::dispatch::Dispatcher;
use super::router::{AppState, create_router};
use super::shutdown::ShutdownCoordinator;
use super::streaming::{SessionManager, spawn_heartbeat};
use crate::config::{Config, TlsConfig};
use crate::failsafe::{Clock, LockoutLimiter, RequestThrottle};
use crate::health::{HealthProbe, HealthReporter};
use crate::security::mask_value;
use crate::tool::{ServerInfoTool, ToolDescriptor, ToolRegistryBuilder};
use crate::{Error, Result};

/// Lifecycle of the listener
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    /// Not accepting connections
    Stopped,
    /// Binding the listener
    Starting,
    /// Accepting connections
    Listening,
    /// Shutdown in progress; no new connections
    Draining,
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Listening => "listening",
            Self::Draining => "draining",
        };
        f.write_str(s)
    }
}

/// MCP gateway server
pub struct Gateway {
    config: Config,
    tools: ToolRegistryBuilder,
    health: HealthReporter,
    clock: Option<Arc<dyn Clock>>,
    started_at: Instant,
}

impl Gateway {
    /// Create a gateway with the built-in `server_info` tool registered
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if the configuration is invalid.
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let started_at = Instant::now();
        let mut tools = ToolRegistryBuilder::new();
        tools.register(ServerInfoTool::descriptor(started_at))?;

        Ok(Self {
            config,
            tools,
            health: HealthReporter::new(),
            clock: None,
            started_at,
        })
    }

    /// Register a tool
    ///
    /// # Errors
    ///
    /// Returns `Error::DuplicateTool` if the name is taken.
    pub fn register_tool(mut self, tool: ToolDescriptor) -> Result<Self> {
        self.tools.register(tool)?;
        Ok(self)
    }

    /// Register several tools
    ///
    /// # Errors
    ///
    /// Returns `Error::DuplicateTool` on the first name that is taken.
    pub fn with_tools(mut self, tools: impl IntoIterator<Item = ToolDescriptor>) -> Result<Self> {
        for tool in tools {
            self.tools.register(tool)?;
        }
        Ok(self)
    }

    /// Add a dependency probe reported by `/status`
    #[must_use]
    pub fn with_health_probe(mut self, probe: Arc<dyn HealthProbe>) -> Self {
        self.health = self.health.with_probe(probe);
        self
    }

    /// Drive the lockout limiter from `clock` instead of the monotonic clock
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Run until Ctrl+C or SIGTERM, then shut down within the grace period
    ///
    /// # Errors
    ///
    /// Returns an error if the listener cannot start or fails while serving.
    pub async fn run(self) -> Result<()> {
        let handle = self.start().await?;
        shutdown_signal().await;
        handle.shutdown().await
    }

    /// Bind the listener and start serving in the background
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` for a missing secret or bad host,
    /// `Error::Tls` for unreadable certificates and `Error::Bind` if the
    /// address cannot be bound.
    pub async fn start(self) -> Result<GatewayHandle> {
        let Self {
            config,
            tools,
            health,
            clock,
            started_at,
        } = self;

        let secret = config.auth.resolve_bearer_token().unwrap_or_default();
        let validator = CredentialValidator::new(&secret)?;
        if config.auth.bearer_token.as_deref() == Some("auto") {
            eprintln!("Auto-generated bearer token: {secret}");
            info!(
                token = %mask_value(&secret),
                "Auto-generated bearer token (printed once to stderr)"
            );
        }

        let addr = SocketAddr::new(
            config
                .server
                .host
                .parse()
                .map_err(|e| Error::Config(format!("Invalid host: {e}")))?,
            config.server.port,
        );

        let tls = if config.tls.enabled {
            Some(load_tls(&config.tls)?)
        } else {
            None
        };

        let limiter = Arc::new(match clock {
            Some(clock) => LockoutLimiter::with_clock(&config.rate_limit, clock),
            None => LockoutLimiter::new(&config.rate_limit),
        });
        let throttle = Arc::new(RequestThrottle::new(&config.rate_limit));
        let auth = Arc::new(AuthState::new(
            validator,
            Arc::clone(&limiter),
            Arc::clone(&throttle),
            &config.auth,
        ));

        let root = CancellationToken::new();
        let sessions = Arc::new(SessionManager::new(root.clone(), config.streaming.buffer_size));
        let registry = Arc::new(tools.build());
        let dispatcher = Arc::new(Dispatcher::new(registry, config.server.production));
        let invocations = dispatcher.tracker().clone();

        let app_state = Arc::new(AppState {
            sessions: Arc::clone(&sessions),
            dispatcher: Arc::clone(&dispatcher),
            health,
            shutdown: root.clone(),
            started_at,
            production: config.server.production,
        });
        let app = create_router(app_state, auth, &config.server)
            .into_make_service_with_connect_info::<SocketAddr>();

        let (state_tx, state_rx) = watch::channel(ServerState::Starting);
        let handle = axum_server::Handle::new();
        let header_read_timeout = config.server.header_read_timeout;
        let scheme = if tls.is_some() { "https" } else { "http" };

        let serve: BoxFuture<'static, io::Result<()>> = match tls {
            Some(tls) => {
                let mut server = axum_server::bind_rustls(addr, RustlsConfig::from_config(tls))
                    .handle(handle.clone());
                server
                    .http_builder()
                    .http1()
                    .timer(TokioTimer::new())
                    .header_read_timeout(header_read_timeout);
                Box::pin(server.serve(app))
            }
            None => {
                let mut server = axum_server::bind(addr).handle(handle.clone());
                server
                    .http_builder()
                    .http1()
                    .timer(TokioTimer::new())
                    .header_read_timeout(header_read_timeout);
                Box::pin(server.serve(app))
            }
        };
        let mut serve_task = tokio::spawn(serve);

        let bound = tokio::select! {
            listening = handle.listening() => listening,
            exited = &mut serve_task => return Err(bind_error(addr, exited)),
        };
        let Some(local_addr) = bound else {
            return Err(bind_error(addr, serve_task.await));
        };
        state_tx.send_replace(ServerState::Listening);

        let (stop_tx, stop_rx) = oneshot::channel::<Duration>();
        tokio::spawn(async move {
            if let Ok(grace) = stop_rx.await {
                handle.graceful_shutdown(Some(grace));
            }
        });

        let background = CancellationToken::new();
        let heartbeat = spawn_heartbeat(
            Arc::clone(&sessions),
            config.streaming.heartbeat_interval,
            background.clone(),
        );
        let maintenance = spawn_maintenance(
            Arc::clone(&limiter),
            Arc::clone(&throttle),
            Arc::clone(&sessions),
            &config,
            background.clone(),
        );

        print_banner(&config, scheme, local_addr, dispatcher.registry().len());

        let coordinator = ShutdownCoordinator::new(
            background,
            vec![heartbeat, maintenance],
            root,
            Arc::clone(&sessions),
            stop_tx,
            invocations,
            serve_task,
            state_tx,
        );

        Ok(GatewayHandle {
            local_addr,
            scheme,
            grace: config.shutdown.grace_period,
            state: state_rx,
            sessions,
            limiter,
            dispatcher,
            coordinator,
        })
    }
}

/// A running gateway
#[derive(Debug)]
pub struct GatewayHandle {
    local_addr: SocketAddr,
    scheme: &'static str,
    grace: Duration,
    state: watch::Receiver<ServerState>,
    sessions: Arc<SessionManager>,
    limiter: Arc<LockoutLimiter>,
    dispatcher: Arc<Dispatcher>,
    coordinator: ShutdownCoordinator,
}

impl GatewayHandle {
    /// Address the listener is bound to
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Base URL, e.g. `http://127.0.0.1:8443`
    #[must_use]
    pub fn base_url(&self) -> String {
        format!("{}://{}", self.scheme, self.local_addr)
    }

    /// Current listener state
    #[must_use]
    pub fn state(&self) -> ServerState {
        *self.state.borrow()
    }

    /// Receiver notified on every state change
    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<ServerState> {
        self.state.clone()
    }

    /// Live sessions
    #[must_use]
    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    /// Failed-authentication lockout limiter
    #[must_use]
    pub fn limiter(&self) -> &Arc<LockoutLimiter> {
        &self.limiter
    }

    /// Tool invocations currently running
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.dispatcher.in_flight()
    }

    /// Whether the listener has stopped on its own
    #[must_use]
    pub fn listener_finished(&self) -> bool {
        self.coordinator.listener_finished()
    }

    /// Shut down within the configured grace period
    ///
    /// # Errors
    ///
    /// Returns an error if the listener failed while serving.
    pub async fn shutdown(self) -> Result<()> {
        let grace = self.grace;
        self.shutdown_with(grace).await
    }

    /// Shut down within `grace`
    ///
    /// # Errors
    ///
    /// Returns an error if the listener failed while serving.
    pub async fn shutdown_with(self, grace: Duration) -> Result<()> {
        self.coordinator.shutdown(grace).await
    }
}

fn bind_error(addr: SocketAddr, exited: std::result::Result<io::Result<()>, JoinError>) -> Error {
    let source = match exited {
        Ok(Err(e)) => e,
        Ok(Ok(())) => io::Error::other("listener exited before binding"),
        Err(e) => io::Error::other(e.to_string()),
    };
    Error::Bind {
        addr: addr.to_string(),
        source,
    }
}

/// Load the certificate chain and key into a server config advertising
/// HTTP/2 and HTTP/1.1
fn load_tls(tls: &TlsConfig) -> Result<Arc<rustls::ServerConfig>> {
    let certs = CertificateDer::pem_file_iter(&tls.cert_file)
        .map_err(|e| Error::Tls(format!("{}: {e}", tls.cert_file)))?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::Tls(format!("{}: {e}", tls.cert_file)))?;
    if certs.is_empty() {
        return Err(Error::Tls(format!("{}: no certificates found", tls.cert_file)));
    }
    let key = PrivateKeyDer::from_pem_file(&tls.key_file)
        .map_err(|e| Error::Tls(format!("{}: {e}", tls.key_file)))?;

    let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
    let mut server_config = rustls::ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| Error::Tls(e.to_string()))?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| Error::Tls(e.to_string()))?;
    server_config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

    Ok(Arc::new(server_config))
}

/// Periodic housekeeping: expired lockout entries, idle throttle keys and
/// idle sessions
fn spawn_maintenance(
    limiter: Arc<LockoutLimiter>,
    throttle: Arc<RequestThrottle>,
    sessions: Arc<SessionManager>,
    config: &Config,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    let every = config.rate_limit.sweep_interval;
    let idle_timeout = config.server.idle_timeout;

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let swept = limiter.sweep();
                    throttle.retain_recent();
                    let reaped = sessions.reap_idle(idle_timeout);
                    if swept > 0 || reaped > 0 {
                        debug!(lockout_entries = swept, sessions = reaped, "Maintenance sweep");
                    }
                }
            }
        }
        debug!("Maintenance task stopped");
    })
}

fn print_banner(config: &Config, scheme: &str, addr: SocketAddr, tools: usize) {
    let endpoint = format!("{scheme}://{addr}{}", config.server.mcp_path);
    info!("============================================================");
    info!("TOOLGATE v{}", env!("CARGO_PKG_VERSION"));
    info!("============================================================");
    info!(%addr, tls = config.tls.enabled, "Listening");
    info!(tools, "Tools registered");
    info!("  MCP endpoint: {endpoint}");
    info!("  Health:       {scheme}://{addr}/health");
    info!("  Status:       {scheme}://{addr}/status");
    info!(
        max_attempts = config.rate_limit.max_attempts,
        lockout_secs = config.rate_limit.lockout.as_secs(),
        "Failed-auth lockout enabled"
    );
    info!(
        interval_secs = config.streaming.heartbeat_interval.as_secs(),
        "Heartbeats on GET {}", config.server.mcp_path
    );
    info!("Client config:");
    info!(
        r#"  {{"url": "{endpoint}", "headers": {{"Authorization": "Bearer <token>"}}}}"#
    );
    info!("============================================================");
}

/// Resolve on Ctrl+C or SIGTERM
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
}
