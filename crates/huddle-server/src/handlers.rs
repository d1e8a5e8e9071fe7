//! Connection handlers for Huddle server.
//!
//! This module handles the connection lifecycle and the HTTP side channel.

use crate::config::Config;
use crate::metrics::{self, ConnectionMetricsGuard};
use anyhow::Result;
use axum::{
    extract::{
        ws::{WebSocket, WebSocketUpgrade},
        State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use huddle_core::{
    CommandHandler, ConnectionRegistry, DeliveryBus, DeliveryWorker, EntityStore, ErrorHook,
    FrameOutcome,
};
use huddle_protocol::validate_name;
use huddle_transport::{websocket, ConnectionId, FrameStream, TransportError};
use serde::Deserialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

/// Shared server state.
pub struct AppState {
    /// Rooms and sessions.
    pub store: Arc<EntityStore>,
    /// Live connection sinks.
    pub registry: Arc<ConnectionRegistry>,
    /// Applies inbound events.
    pub handler: CommandHandler,
    /// Server configuration.
    pub config: Config,
    /// Reserved connection slots, counted against `limits.max_connections`.
    active: Arc<AtomicUsize>,
}

/// A reserved place under the connection limit, released on drop.
struct ConnectionSlot {
    active: Arc<AtomicUsize>,
}

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::AcqRel);
    }
}

impl AppState {
    /// Create app state and spawn its delivery worker.
    ///
    /// Must be called from within a Tokio runtime.
    #[must_use]
    pub fn start(config: Config) -> Arc<Self> {
        let store = Arc::new(EntityStore::new());
        let registry = Arc::new(ConnectionRegistry::new());
        let (bus, queue) = DeliveryBus::new();

        let on_error: ErrorHook = Arc::new(metrics::record_error);
        let handler = CommandHandler::new(store.clone(), bus)
            .with_error_hook(on_error)
            .with_max_frame_size(config.limits.max_message_size);

        let worker = DeliveryWorker::new(queue, store.clone(), registry.clone());
        tokio::spawn(worker.run_with(metrics::record_delivery));

        Arc::new(Self {
            store,
            registry,
            handler,
            config,
            active: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Take a connection slot, or `None` at the limit.
    fn try_reserve(&self) -> Option<ConnectionSlot> {
        let max = self.config.limits.max_connections;
        self.active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < max).then_some(n + 1)
            })
            .ok()?;
        Some(ConnectionSlot {
            active: self.active.clone(),
        })
    }
}

/// Build the HTTP router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route(&state.config.transport.websocket_path, get(ws_handler))
        .route("/rooms", get(list_rooms_handler).post(create_room_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

/// Run the HTTP/WebSocket server.
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
    let listener = TcpListener::bind(addr).await?;

    info!("Huddle server listening on {}", addr);
    info!(
        "WebSocket endpoint: ws://{}{}",
        addr, config.transport.websocket_path
    );

    serve(listener, AppState::start(config)).await
}

/// Serve the router on an already-bound listener.
///
/// # Errors
///
/// Returns an error if the server fails.
pub async fn serve(listener: TcpListener, state: Arc<AppState>) -> Result<()> {
    axum::serve(listener, router(state)).await?;
    Ok(())
}

/// Health check handler.
async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Snapshot of every room and its member names.
async fn list_rooms_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.store.snapshot())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateRoomBody {
    room_name: String,
}

fn message(status: StatusCode, text: impl Into<String>) -> Response {
    let body = serde_json::json!({ "message": text.into() });
    (status, Json(body)).into_response()
}

/// Create an empty room out of band.
async fn create_room_handler(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreateRoomBody>,
) -> Response {
    if let Err(reason) = validate_name(&body.room_name) {
        return message(StatusCode::BAD_REQUEST, format!("roomName: {reason}"));
    }

    let created = state.store.lock().create_room(&body.room_name).map(|_| ());
    match created {
        Ok(()) => {
            metrics::set_active_rooms(state.store.stats().room_count);
            message(StatusCode::CREATED, "Room created")
        }
        Err(e) => {
            debug!(error = %e, "Room creation rejected");
            message(StatusCode::CONFLICT, "Room already exists")
        }
    }
}

/// WebSocket upgrade handler.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    // The slot is held until the read loop ends
    let Some(slot) = state.try_reserve() else {
        warn!(
            limit = state.config.limits.max_connections,
            "Connection limit reached, refusing upgrade"
        );
        metrics::record_refused();
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    };

    ws.on_upgrade(move |socket| handle_websocket(socket, state, slot))
}

/// Handle a WebSocket connection.
async fn handle_websocket(socket: WebSocket, state: Arc<AppState>, _slot: ConnectionSlot) {
    let _metrics_guard = ConnectionMetricsGuard::new();
    let id = ConnectionId::generate();

    let (sink, mut stream) = websocket::split(socket, state.config.limits.max_message_size);
    state.registry.register(id, Arc::new(sink));
    debug!(connection = %id, "WebSocket connected");

    loop {
        let outcome = match stream.recv().await {
            Ok(Some(frame)) => {
                metrics::record_frame();
                let outcome = state.handler.handle_frame(&frame, id);
                metrics::set_active_rooms(state.store.stats().room_count);
                outcome
            }
            Ok(None) => break,
            Err(TransportError::Protocol(e)) => state.handler.reject_frame(&e, id),
            Err(e) => {
                warn!(connection = %id, error = %e, "WebSocket error");
                break;
            }
        };

        if outcome == FrameOutcome::Close {
            debug!(connection = %id, "Closing unreadable stream");
            break;
        }
    }

    // Seats stay in their rooms so the client can reconnect by token
    state.handler.bus().disconnect(id);
    debug!(connection = %id, "WebSocket disconnected");
}
