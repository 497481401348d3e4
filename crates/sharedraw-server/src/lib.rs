//! Sharedraw relay server.
//!
//! Holds the authoritative state of each room, persists every shape
//! mutation through a [`RoomStore`], and relays protocol frames between the
//! clients of a room.
//!
//! ## Protocol
//!
//! Frames are the JSON envelopes of `sharedraw_core::sync`:
//! ```json
//! { "type": "join", "roomId": "room-id", "userId": "u1", "data": { "name": "Ada", "color": "#f00" } }
//! { "type": "command", "roomId": "room-id", "data": { "operation": { "command": "add-shape", "shape": {} } } }
//! { "type": "cursor", "data": { "x": 100, "y": 200 } }
//! ```
//! A joining client receives `init_sync` with the full room state. Relayed
//! frames are never echoed to their sender.

pub mod config;
pub mod context;
pub mod store;
pub mod ws;

pub use config::ServerConfig;
pub use context::{ServerContext, ServerError, ServerResult};
pub use store::{MemoryRoomStore, OperationRecord, RoomRecord, RoomStore, StoreError, StoredShape};

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    routing::get,
};
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::warn;

/// Build the HTTP router for a server context.
pub fn app(ctx: Arc<ServerContext>) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/ws", get(ws::ws_handler))
        .route("/health", get(health))
        .route("/rooms/{id}", get(room))
        .route("/rooms/{id}/operations", get(operations))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(ctx)
}

/// Index page
async fn index() -> &'static str {
    "Sharedraw Relay Server - Connect via WebSocket at /ws"
}

/// Health check
async fn health() -> &'static str {
    "ok"
}

/// Persisted room record.
async fn room(
    Path(id): Path<String>,
    State(ctx): State<Arc<ServerContext>>,
) -> Result<Json<RoomRecord>, StatusCode> {
    match ctx.store().get_room(&id).await {
        Ok(Some(record)) => Ok(Json(record)),
        Ok(None) => Err(StatusCode::NOT_FOUND),
        Err(e) => {
            warn!("Cannot load room {}: {}", id, e);
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

/// Newest operation records of a room, oldest first.
async fn operations(
    Path(id): Path<String>,
    State(ctx): State<Arc<ServerContext>>,
) -> Result<Json<Vec<OperationRecord>>, StatusCode> {
    let limit = ctx.config().history_limit;
    ctx.store().get_operations(&id, limit).await.map(Json).map_err(|e| {
        warn!("Cannot load operations for {}: {}", id, e);
        StatusCode::INTERNAL_SERVER_ERROR
    })
}
