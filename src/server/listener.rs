//! Broker listener and lifecycle
//!
//! Handles the TCP accept loop and spawns one session per connection.
//!
//! ```text
//!   Created ──serve()──► Starting ──listener bound──► Running
//!                            │                           │ shutdown()
//!                            │ bind failed               ▼
//!                            └──────────────────────► Draining ──► Stopped
//! ```

use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Semaphore};
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::auth::Authenticator;
use crate::error::{BrokerError, Result};
use crate::registry::SubscriptionRegistry;
use crate::server::config::BrokerConfig;
use crate::server::connection::Connection;
use crate::stats::{install_recorder, MetricsServer};

/// Pause after the first failed accept; doubles per consecutive failure
const ACCEPT_BACKOFF_MIN: Duration = Duration::from_millis(10);
const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(1);

/// Delay before retrying after `failures` consecutive accept errors
fn accept_backoff(failures: u32) -> Duration {
    let shift = failures.saturating_sub(1).min(16);
    ACCEPT_BACKOFF_MIN
        .saturating_mul(1 << shift)
        .min(ACCEPT_BACKOFF_MAX)
}

/// Broker lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerState {
    /// Constructed, `serve` not yet called
    Created,
    /// Metrics and listener are being set up
    Starting,
    /// Accepting connections
    Running,
    /// Listener closed, waiting for sessions to finish
    Draining,
    /// Terminal
    Stopped,
}

impl BrokerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BrokerState::Created => "created",
            BrokerState::Starting => "starting",
            BrokerState::Running => "running",
            BrokerState::Draining => "draining",
            BrokerState::Stopped => "stopped",
        }
    }
}

impl fmt::Display for BrokerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// hpfeeds broker
///
/// `serve` may be called once. Share the broker behind an `Arc` to call
/// [`started`](Self::started) and [`shutdown`](Self::shutdown) from other
/// tasks while it runs.
pub struct Broker {
    config: Arc<BrokerConfig>,
    registry: Arc<SubscriptionRegistry>,
    prebound: Mutex<Option<std::net::TcpListener>>,
    state: watch::Sender<BrokerState>,
    local_addr: OnceLock<SocketAddr>,
    metrics_addr: OnceLock<SocketAddr>,
    shutdown: CancellationToken,
    next_session_id: AtomicU64,
    connection_semaphore: Option<Arc<Semaphore>>,
    tls: Option<TlsAcceptor>,
}

impl Broker {
    /// Create a broker that listens on `config.bind`
    pub fn new(config: BrokerConfig, auth: Arc<dyn Authenticator>) -> Self {
        let connection_semaphore = if config.max_connections > 0 {
            Some(Arc::new(Semaphore::new(config.max_connections)))
        } else {
            None
        };

        let (state, _) = watch::channel(BrokerState::Created);

        Self {
            config: Arc::new(config),
            registry: Arc::new(SubscriptionRegistry::new(auth)),
            prebound: Mutex::new(None),
            state,
            local_addr: OnceLock::new(),
            metrics_addr: OnceLock::new(),
            shutdown: CancellationToken::new(),
            next_session_id: AtomicU64::new(1),
            connection_semaphore,
            tls: None,
        }
    }

    /// Create a broker that serves on an already bound listener
    ///
    /// `config.bind` is ignored.
    pub fn with_listener(
        config: BrokerConfig,
        auth: Arc<dyn Authenticator>,
        listener: std::net::TcpListener,
    ) -> Self {
        let broker = Self::new(config, auth);
        *broker.prebound.lock() = Some(listener);
        broker
    }

    /// Serve clients over TLS
    ///
    /// Every accepted socket completes a TLS handshake with `acceptor` before
    /// the hpfeeds session starts. The handshake shares `auth_timeout`.
    pub fn with_tls(mut self, acceptor: TlsAcceptor) -> Self {
        self.tls = Some(acceptor);
        self
    }

    /// Get a reference to the subscription registry
    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// Current lifecycle state
    pub fn state(&self) -> BrokerState {
        *self.state.borrow()
    }

    /// Watch lifecycle transitions
    pub fn subscribe_state(&self) -> watch::Receiver<BrokerState> {
        self.state.subscribe()
    }

    /// Token that stops the broker when cancelled
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Ask a running broker to drain and stop
    ///
    /// Idempotent. Calling it before `serve` makes `serve` stop as soon as the
    /// listener is up.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Address the listener is bound to, once running
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr.get().copied()
    }

    /// Address of the metrics server, if one was started
    pub fn metrics_addr(&self) -> Option<SocketAddr> {
        self.metrics_addr.get().copied()
    }

    /// Wait until the broker is listening
    ///
    /// Resolves with the bound address, or with [`BrokerError::NotStarted`]
    /// if `serve` failed before the listener came up.
    pub async fn started(&self) -> Result<SocketAddr> {
        let mut rx = self.state.subscribe();
        let _ = rx
            .wait_for(|state| !matches!(state, BrokerState::Created | BrokerState::Starting))
            .await;
        self.local_addr().ok_or(BrokerError::NotStarted)
    }

    /// Run the broker until [`shutdown`](Self::shutdown) is called
    ///
    /// Returns after the listener is closed, sessions have drained (or the
    /// drain timeout expired), and the metrics server has stopped.
    pub async fn serve(&self) -> Result<()> {
        let claimed = self.state.send_if_modified(|state| {
            if *state == BrokerState::Created {
                *state = BrokerState::Starting;
                true
            } else {
                false
            }
        });
        if !claimed {
            return Err(BrokerError::InvalidState(self.state().as_str()));
        }

        let guard = ServeGuard {
            state: &self.state,
            sessions: CancellationToken::new(),
            metrics: CancellationToken::new(),
        };

        let metrics = self.start_metrics(guard.metrics.clone()).await;

        let listener = match self.open_listener().await {
            Ok(listener) => listener,
            Err(e) => {
                tracing::error!(error = %e, "Failed to open listener");
                if let Some(server) = metrics {
                    server.stop().await;
                }
                return Err(e);
            }
        };
        let local_addr = listener.local_addr()?;
        let _ = self.local_addr.set(local_addr);

        self.state.send_replace(BrokerState::Running);
        tracing::info!(addr = %local_addr, name = %self.config.name, "hpfeeds broker listening");

        let sessions = TaskTracker::new();

        tokio::select! {
            _ = self.shutdown.cancelled() => {
                tracing::info!("Shutdown requested");
            }
            _ = self.accept_loop(&listener, &sessions, &guard.sessions) => {}
        }

        self.state.send_replace(BrokerState::Draining);
        drop(listener);

        guard.sessions.cancel();
        sessions.close();
        tracing::debug!(sessions = sessions.len(), "Draining sessions");

        if tokio::time::timeout(self.config.drain_timeout, sessions.wait())
            .await
            .is_err()
        {
            tracing::warn!(
                remaining = sessions.len(),
                timeout_ms = self.config.drain_timeout.as_millis() as u64,
                "Drain timed out"
            );
        }

        if let Some(server) = metrics {
            server.stop().await;
        }
        self.registry.close().await;

        tracing::info!(addr = %local_addr, "hpfeeds broker stopped");
        Ok(())
    }

    /// Run the broker until `signal` completes, then drain and stop
    pub async fn run_until<F>(&self, signal: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let serve = self.serve();
        tokio::pin!(serve);

        tokio::select! {
            result = &mut serve => return result,
            _ = signal => {
                tracing::info!("Shutdown signal received");
                self.shutdown();
            }
        }

        serve.await
    }

    /// Start the metrics server if one is configured
    ///
    /// Failures are logged and the broker continues without metrics.
    async fn start_metrics(&self, token: CancellationToken) -> Option<MetricsServer> {
        if !self.config.metrics.is_configured() {
            return None;
        }

        let handle = install_recorder()?;

        let addr = match self.config.metrics.resolve().await {
            Ok(addr) => addr,
            Err(e) => {
                tracing::warn!(
                    endpoint = %self.config.metrics,
                    error = %e,
                    "Invalid metrics endpoint, metrics disabled"
                );
                return None;
            }
        };

        match MetricsServer::start(addr, handle, self.state.subscribe(), token).await {
            Ok(server) => {
                let _ = self.metrics_addr.set(server.local_addr());
                Some(server)
            }
            Err(e) => {
                tracing::warn!(addr = %addr, error = %e, "Failed to start metrics server");
                None
            }
        }
    }

    async fn open_listener(&self) -> Result<TcpListener> {
        let prebound = self.prebound.lock().take();
        if let Some(listener) = prebound {
            let addr = listener
                .local_addr()
                .map_or_else(|_| "<pre-bound>".to_string(), |a| a.to_string());
            let bind_failure = |source: std::io::Error| BrokerError::BindFailure {
                addr: addr.clone(),
                source,
            };
            listener.set_nonblocking(true).map_err(bind_failure)?;
            return TcpListener::from_std(listener).map_err(bind_failure);
        }

        if !self.config.bind.is_configured() {
            return Err(BrokerError::invalid_config(
                "no listen endpoint or pre-bound listener",
            ));
        }

        let addr = self.config.bind.resolve().await?;
        TcpListener::bind(addr)
            .await
            .map_err(|source| BrokerError::BindFailure {
                addr: addr.to_string(),
                source,
            })
    }

    async fn accept_loop(
        &self,
        listener: &TcpListener,
        sessions: &TaskTracker,
        session_token: &CancellationToken,
    ) {
        let mut failures = 0u32;
        loop {
            match listener.accept().await {
                Ok((socket, peer_addr)) => {
                    failures = 0;
                    self.handle_connection(socket, peer_addr, sessions, session_token);
                }
                Err(e) => {
                    failures = failures.saturating_add(1);
                    let delay = accept_backoff(failures);
                    tracing::error!(
                        error = %e,
                        failures = failures,
                        retry_ms = delay.as_millis() as u64,
                        "Failed to accept connection"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    fn handle_connection(
        &self,
        socket: TcpStream,
        peer_addr: SocketAddr,
        sessions: &TaskTracker,
        session_token: &CancellationToken,
    ) {
        // Check connection limit
        let permit = if let Some(ref sem) = self.connection_semaphore {
            match sem.clone().try_acquire_owned() {
                Ok(permit) => Some(permit),
                Err(_) => {
                    tracing::warn!(peer = %peer_addr, "Connection rejected: limit reached");
                    return;
                }
            }
        } else {
            None
        };

        let session_id = self.next_session_id.fetch_add(1, Ordering::Relaxed);

        tracing::debug!(
            session_id = session_id,
            peer = %peer_addr,
            "New connection"
        );

        if self.config.tcp_nodelay {
            if let Err(e) = socket.set_nodelay(true) {
                tracing::error!(error = %e, "Failed to configure socket");
                return;
            }
        }

        let config = Arc::clone(&self.config);
        let registry = Arc::clone(&self.registry);
        let shutdown = session_token.child_token();
        let tls = self.tls.clone();

        sessions.spawn(async move {
            let _permit = permit;

            let result = match tls {
                Some(acceptor) => {
                    let stream =
                        accept_tls(&acceptor, socket, session_id, config.auth_timeout, &shutdown).await;
                    match stream {
                        Some(stream) => {
                            Connection::new(session_id, stream, peer_addr, config, registry, shutdown)
                                .run()
                                .await
                        }
                        None => Ok(()),
                    }
                }
                None => {
                    Connection::new(session_id, socket, peer_addr, config, registry, shutdown)
                        .run()
                        .await
                }
            };

            if let Err(e) = result {
                tracing::debug!(
                    session_id = session_id,
                    error = %e,
                    "Connection error"
                );
            }

            tracing::debug!(session_id = session_id, "Connection closed");
        });
    }
}

/// Complete the server side of a TLS handshake
///
/// Returns `None` if the handshake fails, times out, or the broker shuts down
/// first.
async fn accept_tls(
    acceptor: &TlsAcceptor,
    socket: TcpStream,
    session_id: u64,
    timeout: Duration,
    shutdown: &CancellationToken,
) -> Option<TlsStream<TcpStream>> {
    let result = tokio::select! {
        _ = shutdown.cancelled() => return None,
        result = tokio::time::timeout(timeout, acceptor.accept(socket)) => result,
    };

    match result {
        Ok(Ok(stream)) => Some(stream),
        Ok(Err(e)) => {
            tracing::debug!(session_id = session_id, error = %e, "TLS handshake failed");
            None
        }
        Err(_) => {
            tracing::debug!(session_id = session_id, "TLS handshake timed out");
            None
        }
    }
}

/// Marks the broker stopped when `serve` returns or is dropped
///
/// Cancelling the tokens here also stops sessions and the metrics server if
/// the `serve` future is dropped mid-run.
struct ServeGuard<'a> {
    state: &'a watch::Sender<BrokerState>,
    sessions: CancellationToken,
    metrics: CancellationToken,
}

impl Drop for ServeGuard<'_> {
    fn drop(&mut self) {
        self.sessions.cancel();
        self.metrics.cancel();
        self.state.send_replace(BrokerState::Stopped);
    }
}
