use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, State};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use harvest_core::ids::UserId;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::gateway::QueryGateway;
use crate::registry::ConnectionRegistry;
use crate::socket;

/// Server configuration.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub max_send_queue: usize,
    pub send_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub client_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8000,
            max_send_queue: 256,
            send_timeout: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(30),
            client_timeout: Duration::from_secs(90),
        }
    }
}

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<ConnectionRegistry>,
    pub gateway: Arc<QueryGateway>,
    pub config: Arc<ServerConfig>,
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws/{user_id}", get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Bind and start serving. The listener stops accepting when `shutdown`
/// is cancelled; open sockets are closed through the registry.
pub async fn start(
    config: ServerConfig,
    gateway: Arc<QueryGateway>,
    shutdown: CancellationToken,
) -> Result<ServerHandle, std::io::Error> {
    let registry = Arc::clone(gateway.registry());
    let config = Arc::new(config);

    let sweeper = start_idle_sweep(
        Arc::clone(&registry),
        config.heartbeat_interval,
        config.client_timeout,
        shutdown.clone(),
    );

    let state = AppState {
        registry,
        gateway,
        config: Arc::clone(&config),
    };
    let router = build_router(state);

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let local_addr = listener.local_addr()?;

    info!(addr = %local_addr, "gateway listening");

    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router)
            .with_graceful_shutdown(shutdown.cancelled_owned())
            .await
        {
            error!(error = %e, "server error");
        }
    });

    Ok(ServerHandle {
        port: local_addr.port(),
        server,
        sweeper,
    })
}

/// Handle returned by `start()`. Keeps background tasks alive.
pub struct ServerHandle {
    pub port: u16,
    server: JoinHandle<()>,
    sweeper: JoinHandle<()>,
}

impl ServerHandle {
    /// Background tasks to await at shutdown.
    pub fn into_tasks(self) -> Vec<JoinHandle<()>> {
        vec![self.server, self.sweeper]
    }
}

/// WebSocket upgrade handler. The path segment is the identity handed over
/// by the auth layer in front of this service.
async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(user_id): Path<String>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    let user_id = UserId::from_raw(user_id);
    ws.on_upgrade(move |socket| socket::serve_socket(socket, user_id, state))
}

/// Health check HTTP endpoint.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let invoker = state.gateway.invoker();
    let ready = state.gateway.pipeline_ready();
    let body = serde_json::json!({
        "status": if ready { "healthy" } else { "degraded" },
        "pipelineReady": ready,
        "connections": state.registry.count(),
        "workers": invoker.workers(),
        "availableWorkers": invoker.available_workers(),
        "abandoned": invoker.abandoned(),
        "inFlight": state.gateway.in_flight(),
        "timestamp": chrono::Utc::now().to_rfc3339(),
    });

    let status = if ready {
        axum::http::StatusCode::OK
    } else {
        axum::http::StatusCode::SERVICE_UNAVAILABLE
    };
    (status, axum::Json(body))
}

/// Periodically drop connections that stopped answering pings.
fn start_idle_sweep(
    registry: Arc<ConnectionRegistry>,
    interval: Duration,
    max_idle: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let removed = registry.sweep_idle(max_idle).await;
                    if removed > 0 {
                        info!(removed, "idle connection sweep");
                    }
                }
                () = shutdown.cancelled() => break,
            }
        }
    })
}
