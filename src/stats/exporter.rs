//! Prometheus exposition server
//!
//! Serves `/metrics`, `/live` and `/ready` over HTTP. The recorder is installed
//! globally once per process; every broker in the process shares it.

use std::net::SocketAddr;
use std::sync::OnceLock;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::server::BrokerState;

static METRICS_HANDLE: OnceLock<Option<PrometheusHandle>> = OnceLock::new();

/// Install the global Prometheus recorder, or return the one already installed
///
/// Returns `None` if another recorder was installed by someone else; metrics
/// are then only visible to that recorder.
pub fn install_recorder() -> Option<PrometheusHandle> {
    METRICS_HANDLE
        .get_or_init(|| match PrometheusBuilder::new().install_recorder() {
            Ok(handle) => {
                tracing::info!("Prometheus metrics recorder installed");
                Some(handle)
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to install metrics recorder");
                None
            }
        })
        .clone()
}

#[derive(Clone)]
struct ExporterState {
    handle: PrometheusHandle,
    broker_state: watch::Receiver<BrokerState>,
}

fn router(state: ExporterState) -> Router {
    Router::new()
        .route("/metrics", get(render_metrics))
        .route("/live", get(|| async { "ok" }))
        .route("/ready", get(ready))
        .with_state(state)
}

async fn render_metrics(State(state): State<ExporterState>) -> String {
    state.handle.render()
}

async fn ready(State(state): State<ExporterState>) -> (StatusCode, &'static str) {
    if *state.broker_state.borrow() == BrokerState::Running {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ready")
    }
}

/// A running metrics HTTP server
pub struct MetricsServer {
    local_addr: SocketAddr,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl MetricsServer {
    /// Bind `addr` and start serving in a background task
    ///
    /// The server stops when `shutdown` is cancelled or [`stop`](Self::stop)
    /// is called.
    pub async fn start(
        addr: SocketAddr,
        handle: PrometheusHandle,
        broker_state: watch::Receiver<BrokerState>,
        shutdown: CancellationToken,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let app = router(ExporterState {
            handle,
            broker_state,
        });

        let token = shutdown.clone();
        let task = tokio::spawn(async move {
            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move { token.cancelled().await })
                .await;
            if let Err(e) = result {
                tracing::warn!(error = %e, "Metrics server exited");
            }
        });

        tracing::info!(addr = %local_addr, "Metrics server listening");

        Ok(Self {
            local_addr,
            shutdown,
            task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop serving and wait for the server task to finish
    pub async fn stop(self) {
        self.shutdown.cancel();
        if let Err(e) = self.task.await {
            tracing::warn!(error = %e, "Metrics server task failed");
        }
        tracing::debug!(addr = %self.local_addr, "Metrics server stopped");
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    use super::*;

    async fn http_get(addr: SocketAddr, path: &str) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let request = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        response
    }

    fn local_handle() -> PrometheusHandle {
        PrometheusBuilder::new().build_recorder().handle()
    }

    #[tokio::test]
    async fn test_endpoints_respond() {
        let (state_tx, state_rx) = watch::channel(BrokerState::Starting);
        let server = MetricsServer::start(
            "127.0.0.1:0".parse().unwrap(),
            local_handle(),
            state_rx,
            CancellationToken::new(),
        )
        .await
        .unwrap();
        let addr = server.local_addr();

        let live = http_get(addr, "/live").await;
        assert!(live.starts_with("HTTP/1.1 200"));
        assert!(live.ends_with("ok"));

        let metrics = http_get(addr, "/metrics").await;
        assert!(metrics.starts_with("HTTP/1.1 200"));

        let ready = http_get(addr, "/ready").await;
        assert!(ready.starts_with("HTTP/1.1 503"));

        state_tx.send_replace(BrokerState::Running);
        let ready = http_get(addr, "/ready").await;
        assert!(ready.starts_with("HTTP/1.1 200"));

        server.stop().await;
    }

    #[tokio::test]
    async fn test_stop_releases_port() {
        let (_state_tx, state_rx) = watch::channel(BrokerState::Running);
        let token = CancellationToken::new();
        let server = MetricsServer::start(
            "127.0.0.1:0".parse().unwrap(),
            local_handle(),
            state_rx,
            token.clone(),
        )
        .await
        .unwrap();
        let addr = server.local_addr();

        server.stop().await;
        assert!(token.is_cancelled());
        assert!(TcpStream::connect(addr).await.is_err());
    }
}
