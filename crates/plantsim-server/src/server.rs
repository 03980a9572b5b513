use std::sync::Arc;

use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;

use plantsim_core::ids::SessionId;
use plantsim_runtime::manager::SessionOrchestrator;
use plantsim_store::Database;
use plantsim_telemetry::TelemetryGuard;

use crate::client::{self, ClientId, ClientRegistry};
use crate::event_bridge;
use crate::handlers::HandlerState;
use crate::rpc::{RpcRequest, RpcResponse};

/// Server configuration.
pub struct ServerConfig {
    pub port: u16,
    pub max_send_queue: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 9210,
            max_send_queue: 256,
        }
    }
}

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub handler_state: Arc<HandlerState>,
    pub client_registry: Arc<ClientRegistry>,
    pub message_tx: mpsc::Sender<(ClientId, String)>,
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
}

/// Create and start the server. Returns a handle to shut it down.
pub async fn start(
    config: ServerConfig,
    db: Database,
    orchestrator: Arc<dyn SessionOrchestrator>,
    telemetry: Option<Arc<TelemetryGuard>>,
) -> Result<ServerHandle, std::io::Error> {
    let client_registry = Arc::new(ClientRegistry::new(config.max_send_queue));

    // Bridge the pool's event bus onto WebSocket clients
    let bridge_handle =
        event_bridge::create_bridge(Arc::clone(&client_registry), orchestrator.subscribe_events());

    let (msg_tx, msg_rx) = mpsc::channel::<(ClientId, String)>(1024);

    let mut handler_state = HandlerState::new(orchestrator, db);
    if let Some(telemetry) = telemetry {
        handler_state = handler_state.with_telemetry(telemetry);
    }
    let handler_state = Arc::new(handler_state);

    let app_state = AppState {
        handler_state: Arc::clone(&handler_state),
        client_registry: Arc::clone(&client_registry),
        message_tx: msg_tx,
    };

    let rpc_handle = tokio::spawn(process_rpc_messages(
        msg_rx,
        handler_state,
        Arc::clone(&client_registry),
    ));

    let router = build_router(app_state);
    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let local_addr = listener.local_addr()?;

    tracing::info!(port = local_addr.port(), "plantsim server started");

    let shutdown = CancellationToken::new();
    let shutdown_for_axum = shutdown.clone();
    let server_task = tokio::spawn(async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                shutdown_for_axum.cancelled().await;
            })
            .await
            .ok();
    });

    Ok(ServerHandle {
        port: local_addr.port(),
        shutdown,
        server: server_task,
        bridge: bridge_handle,
        rpc: rpc_handle,
    })
}

/// Handle returned by `start()` — keeps background tasks alive.
///
/// Call `shutdown()` to signal the server to stop accepting new connections,
/// then `drain()` to wait for in-flight work to complete.
pub struct ServerHandle {
    pub port: u16,
    shutdown: CancellationToken,
    server: tokio::task::JoinHandle<()>,
    bridge: tokio::task::JoinHandle<()>,
    rpc: tokio::task::JoinHandle<()>,
}

impl ServerHandle {
    /// Signal the server to stop accepting new connections.
    pub fn shutdown(&self) {
        tracing::info!("server shutdown initiated");
        self.shutdown.cancel();
    }

    /// Wait for all server tasks to complete after shutdown.
    pub async fn drain(self) {
        let _ = self.server.await;
        // RPC processor exits when the message channel closes
        let _ = self.rpc.await;
        self.bridge.abort();
        let _ = self.bridge.await;
        tracing::debug!("server tasks drained");
    }
}

/// WebSocket upgrade handler.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Handle a new WebSocket connection.
async fn handle_socket(socket: WebSocket, state: AppState) {
    let (client_id, queue) = state.client_registry.register();
    tracing::info!(client_id = %client_id, "websocket client connected");

    client::handle_ws_connection(
        socket,
        client_id,
        queue,
        state.client_registry,
        state.message_tx,
    )
    .await;
}

/// Health check HTTP endpoint.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let resp = crate::handlers::dispatch(
        &state.handler_state,
        "health",
        &serde_json::json!({}),
        None,
    )
    .await;

    let status = if resp.success {
        axum::http::StatusCode::OK
    } else {
        axum::http::StatusCode::SERVICE_UNAVAILABLE
    };

    (status, axum::Json(resp.result.unwrap_or_default()))
}

/// Process incoming RPC messages from WebSocket clients.
async fn process_rpc_messages(
    mut rx: mpsc::Receiver<(ClientId, String)>,
    state: Arc<HandlerState>,
    registry: Arc<ClientRegistry>,
) {
    while let Some((client_id, raw_message)) = rx.recv().await {
        let request: RpcRequest = match serde_json::from_str(&raw_message) {
            Ok(req) => req,
            Err(_) => {
                let resp = RpcResponse::parse_error();
                if let Ok(json) = serde_json::to_string(&resp) {
                    registry.send_to(&client_id, json);
                }
                continue;
            }
        };

        let params = request.params.unwrap_or(serde_json::json!({}));
        let response =
            crate::handlers::dispatch(&state, &request.method, &params, request.id).await;

        // Auto-subscribe the client to the session it just touched, so pool
        // events start flowing without a separate subscribe call.
        if response.success {
            let session_id = params
                .get("session_id")
                .and_then(|v| v.as_str())
                .map(str::to_string)
                .or_else(|| {
                    response.result.as_ref().and_then(|r| {
                        r.get("session")
                            .and_then(|s| s.get("id"))
                            .and_then(|v| v.as_str())
                            .map(str::to_string)
                    })
                });
            if let Some(sid) = session_id {
                registry.set_session(&client_id, SessionId::from_raw(sid));
            }
        }

        if let Ok(json) = serde_json::to_string(&response) {
            registry.send_to(&client_id, json);
        }
    }
}
