//! Connection handlers for Beacon server.
//!
//! This module handles the connection lifecycle. Each inbound message is
//! handled on its own task, so replies from concurrent handlers share the
//! connection's write guard.

use crate::config::{Config, StoreBackend};
use crate::metrics::{self, ConnectionMetricsGuard};
use crate::relay::Relay;
use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, State,
    },
    http::{header, HeaderMap, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use beacon_core::{ElasticsearchStore, EventIndex, IndexStore, MemoryStore};
use beacon_protocol::{FrameType, RelayMessage};
use beacon_transport::{ClientConnection, RequestInfo, TransportError};
use futures_util::StreamExt;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

const NOSTR_JSON: &str = "application/nostr+json";

/// Shared server state.
pub struct AppState {
    /// Message handling.
    pub relay: Relay,
    /// Server configuration.
    pub config: Config,
    slots: Arc<Semaphore>,
}

impl AppState {
    /// Create app state around an initialized index.
    #[must_use]
    pub fn new(config: Config, index: Arc<EventIndex>) -> Self {
        Self {
            relay: Relay::new(index, &config.relay),
            slots: Arc::new(Semaphore::new(config.limits.max_connections)),
            config,
        }
    }

    /// Connect the configured store and initialize the index.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unreachable or the index schema conflicts.
    pub async fn connect(config: Config) -> Result<Self> {
        let store: Arc<dyn IndexStore> = match config.index.backend {
            StoreBackend::Elasticsearch => Arc::new(
                ElasticsearchStore::new(&config.index.url, config.index.request_timeout())
                    .context("Failed to build store client")?,
            ),
            StoreBackend::Memory => Arc::new(MemoryStore::new()),
        };
        info!(backend = store.name(), url = %config.index.url, "Connecting event index");

        let index = EventIndex::init(store, config.index.index.clone())
            .await
            .context("Failed to initialize event index")?;
        Ok(Self::new(config, Arc::new(index)))
    }

    /// Number of connections currently open.
    #[must_use]
    pub fn active_connections(&self) -> usize {
        self.config.limits.max_connections - self.slots.available_permits()
    }
}

/// Build the HTTP router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(root_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

/// Run the HTTP/WebSocket server until interrupted.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    let addr = config.bind_addr()?;
    let state = Arc::new(AppState::connect(config).await?);
    let app = router(state.clone());

    let listener = TcpListener::bind(addr).await?;
    info!("Beacon relay listening on ws://{}", addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    info!("Flushing event index");
    state.relay.index().close().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown requested");
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let stats = state.relay.index().stats();
    axum::Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "connections": state.active_connections(),
        "index": {
            "name": state.relay.index().index_name(),
            "added": stats.num_added,
            "indexed": stats.num_indexed,
            "deleted": stats.num_deleted,
            "failed": stats.num_failed,
            "requests": stats.num_requests,
        }
    }))
}

/// Relay information document (NIP-11).
fn relay_info(config: &Config) -> Response {
    (
        [(header::CONTENT_TYPE, NOSTR_JSON)],
        serde_json::json!({
            "name": config.relay.name,
            "software": "beacon",
            "version": env!("CARGO_PKG_VERSION"),
            "supported_nips": [1, 9, 11, 42],
            "limitation": {
                "max_message_length": config.limits.max_message_size,
                "auth_required": config.relay.auth_required,
            }
        })
        .to_string(),
    )
        .into_response()
}

/// WebSocket upgrade, or the relay information document.
async fn root_handler(
    ws: Option<WebSocketUpgrade>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    uri: Uri,
    headers: HeaderMap,
    State(state): State<Arc<AppState>>,
) -> Response {
    let Some(ws) = ws else {
        let wants_info = headers
            .get(header::ACCEPT)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.contains(NOSTR_JSON));
        if wants_info {
            return relay_info(&state.config);
        }
        return (StatusCode::OK, "Please use a Nostr client to connect.").into_response();
    };

    let Ok(permit) = state.slots.clone().try_acquire_owned() else {
        warn!(peer = %addr, "Connection limit reached");
        metrics::record_rejected_connection();
        return (StatusCode::SERVICE_UNAVAILABLE, "connection limit reached").into_response();
    };

    let request = RequestInfo::new(uri, headers, Some(addr));
    ws.max_message_size(state.config.limits.max_message_size)
        .on_upgrade(move |socket| handle_websocket(socket, request, state, permit))
}

/// Handle a WebSocket connection.
async fn handle_websocket(
    socket: WebSocket,
    request: RequestInfo,
    state: Arc<AppState>,
    _permit: OwnedSemaphorePermit,
) {
    let _metrics_guard = ConnectionMetricsGuard::new();

    let (sink, mut receiver) = socket.split();
    let conn = Arc::new(ClientConnection::new(sink, request));
    debug!(conn_id = %conn.id(), client_ip = ?conn.request().client_ip(), "WebSocket connected");

    if let Err(e) = conn.write_json(&RelayMessage::auth(conn.challenge())).await {
        warn!(conn_id = %conn.id(), error = %e, "Failed to send auth challenge");
        return;
    }

    let mut handlers: JoinSet<Result<(), TransportError>> = JoinSet::new();

    loop {
        tokio::select! {
            Some(done) = handlers.join_next() => {
                match done {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        debug!(conn_id = %conn.id(), error = %e, "Reply failed, closing connection");
                        metrics::record_error("write");
                        break;
                    }
                    Err(e) => {
                        error!(conn_id = %conn.id(), error = %e, "Message handler failed");
                        metrics::record_error("handler");
                    }
                }
            }

            msg = receiver.next() => {
                let data = match msg {
                    Some(Ok(Message::Text(text))) => text.into_bytes(),
                    Some(Ok(Message::Binary(data))) => data,
                    Some(Ok(Message::Ping(data))) => {
                        if conn.write_message(FrameType::Pong, data).await.is_err() {
                            break;
                        }
                        continue;
                    }
                    Some(Ok(Message::Pong(_))) => continue,
                    Some(Ok(Message::Close(_))) => {
                        debug!(conn_id = %conn.id(), "Received close frame");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(conn_id = %conn.id(), error = %e, "WebSocket error");
                        metrics::record_error("websocket");
                        break;
                    }
                    None => {
                        debug!(conn_id = %conn.id(), "WebSocket stream ended");
                        break;
                    }
                };

                metrics::record_message(data.len(), "inbound");
                let state = state.clone();
                let conn = conn.clone();
                handlers.spawn(async move { state.relay.handle_message(&conn, &data).await });
            }
        }
    }

    // In-flight writes still resolve; their replies go nowhere.
    handlers.detach_all();
    debug!(conn_id = %conn.id(), "WebSocket disconnected");
}
