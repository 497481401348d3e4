//! WebSocket endpoint: one task per connection.

use crate::context::{Relay, ServerContext, ServerError, ServerResult};
use axum::{
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt, stream::SplitSink};
use sharedraw_core::sync::{Envelope, JoinData, MessageType, UserInfo};
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// WebSocket upgrade handler
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(ctx): State<Arc<ServerContext>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, ctx))
}

/// Per-connection protocol state.
struct Connection {
    /// Id used until the client names itself in a `join`.
    user_id: String,
    room: Option<String>,
    room_rx: Option<broadcast::Receiver<Relay>>,
}

/// What the socket loop should do after handling a client frame.
enum Reply {
    None,
    Send(String),
}

impl Connection {
    fn new() -> Self {
        Self {
            user_id: Uuid::new_v4().to_string(),
            room: None,
            room_rx: None,
        }
    }

    async fn handle_text(&mut self, ctx: &ServerContext, text: &str) -> ServerResult<Reply> {
        let envelope = Envelope::from_json(text)?;
        match envelope.kind {
            MessageType::Join => self.join(ctx, envelope).await,
            MessageType::Leave => {
                self.leave(ctx).await?;
                Ok(Reply::None)
            }
            MessageType::Command => {
                let Some(room) = &self.room else {
                    debug!("Command from {} outside a room", self.user_id);
                    return Ok(Reply::None);
                };
                let version = ctx.command(room, &self.user_id, envelope).await?;
                debug!("Room {} at version {}", room, version);
                Ok(Reply::None)
            }
            MessageType::Cursor | MessageType::Selection | MessageType::Lock | MessageType::Unlock => {
                if let Some(room) = &self.room {
                    ctx.relay(room, &self.user_id, envelope)?;
                }
                Ok(Reply::None)
            }
            MessageType::InitSync => {
                debug!("Ignoring init_sync from client {}", self.user_id);
                Ok(Reply::None)
            }
        }
    }

    async fn join(&mut self, ctx: &ServerContext, envelope: Envelope) -> ServerResult<Reply> {
        let room_id = envelope.room_id.clone().ok_or(ServerError::MissingRoom)?;
        self.leave(ctx).await?;
        if let Some(user_id) = envelope.user_id.clone().filter(|id| !id.is_empty()) {
            self.user_id = user_id;
        }
        let data: JoinData = match envelope.data {
            Some(_) => envelope.parse_data()?,
            None => JoinData::default(),
        };
        let user = UserInfo {
            user_id: self.user_id.clone(),
            name: data.name.unwrap_or_else(|| "Anonymous".to_string()),
            color: data.color.unwrap_or_default(),
            joined_at: None,
        };

        let joined = ctx.join(&room_id, user).await?;
        self.room = Some(room_id);
        self.room_rx = Some(joined.rx);
        Ok(Reply::Send(joined.init_sync))
    }

    async fn leave(&mut self, ctx: &ServerContext) -> ServerResult<()> {
        self.room_rx = None;
        if let Some(room) = self.room.take() {
            ctx.leave(&room, &self.user_id).await?;
        }
        Ok(())
    }
}

async fn send_text(sender: &mut SplitSink<WebSocket, Message>, text: String) -> bool {
    sender.send(Message::Text(text.into())).await.is_ok()
}

/// Handle a WebSocket connection
async fn handle_socket(socket: WebSocket, ctx: Arc<ServerContext>) {
    let mut conn = Connection::new();
    info!("New connection: {}", conn.user_id);

    let (mut sender, mut receiver) = socket.split();

    loop {
        tokio::select! {
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        match conn.handle_text(&ctx, text.as_str()).await {
                            Ok(Reply::Send(frame)) => {
                                if !send_text(&mut sender, frame).await {
                                    break;
                                }
                            }
                            Ok(Reply::None) => {}
                            Err(e) => warn!("Dropping message from {}: {}", conn.user_id, e),
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {} // Ignore binary and ping/pong
                    Some(Err(e)) => {
                        warn!("WebSocket error for {}: {}", conn.user_id, e);
                        break;
                    }
                }
            }

            msg = async {
                match &mut conn.room_rx {
                    Some(rx) => Some(rx.recv().await),
                    // No room joined, just wait forever
                    None => std::future::pending().await,
                }
            } => {
                match msg {
                    Some(Ok((from, frame))) => {
                        // Don't echo back to sender
                        if from != conn.user_id && !send_text(&mut sender, frame).await {
                            break;
                        }
                    }
                    Some(Err(RecvError::Lagged(skipped))) => {
                        warn!("Connection {} lagged, {} frames skipped", conn.user_id, skipped);
                    }
                    Some(Err(RecvError::Closed)) | None => {
                        conn.room_rx = None;
                    }
                }
            }
        }
    }

    // Cleanup on disconnect
    if let Err(e) = conn.leave(&ctx).await {
        warn!("Cleanup failed for {}: {}", conn.user_id, e);
    }
    info!("Connection closed: {}", conn.user_id);
}
