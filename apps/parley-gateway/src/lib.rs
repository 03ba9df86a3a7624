pub mod config;
pub mod router;
pub mod websocket;

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::info;

pub use config::{Cli, GatewayConfig, ServerConfig};
pub use router::PeerRouter;
pub use websocket::AppState;

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/ws", get(websocket::websocket_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

/// Serves the gateway on `listener` until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, config: GatewayConfig, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let router = PeerRouter::with_request_ttl(config.request_ttl);
    serve_with_router(listener, router, config, shutdown).await
}

async fn serve_with_router<F>(
    listener: TcpListener,
    router: PeerRouter,
    config: GatewayConfig,
    shutdown: F,
) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let state = Arc::new(AppState { router, config });
    let app = build_router(state).into_make_service_with_connect_info::<SocketAddr>();
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .context("gateway server exited with error")
}

/// A gateway running on a background task, bound to an ephemeral local port.
pub struct RunningGateway {
    pub addr: SocketAddr,
    router: PeerRouter,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<Result<()>>,
}

impl RunningGateway {
    pub fn ws_url(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }

    /// Peer requests still waiting for an answer.
    pub fn pending_requests(&self) -> usize {
        self.router.pending_count()
    }

    pub async fn shutdown(mut self) -> Result<()> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        (&mut self.task).await.context("gateway task panicked")?
    }
}

impl Drop for RunningGateway {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

pub async fn spawn_local(config: GatewayConfig) -> Result<RunningGateway> {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .context("failed to bind gateway listener")?;
    let addr = listener.local_addr().context("listener has no address")?;
    let (tx, rx) = oneshot::channel::<()>();
    let router = PeerRouter::with_request_ttl(config.request_ttl);
    let task = tokio::spawn(serve_with_router(listener, router.clone(), config, async move {
        let _ = rx.await;
    }));
    info!(target = "gateway", %addr, "gateway listening");
    Ok(RunningGateway {
        addr,
        router,
        shutdown: Some(tx),
        task,
    })
}
