//! Shared server state passed to every connection handler.
//!
//! [`ServerContext`] owns the room store and the connection registry: one
//! broadcast channel per live room plus the set of users connected to it.
//! Relayed frames carry the sender's user id so each connection can skip
//! its own frames.

use crate::config::ServerConfig;
use crate::store::{OperationRecord, RoomStore, StoreError, StoredShape};
use chrono::Utc;
use dashmap::DashMap;
use sharedraw_core::shapes::{ShapeError, merge_fields, shape_from_json};
use sharedraw_core::sync::{
    CommandData, CommandPayload, Envelope, InitSyncData, MessageType, SyncError, UserInfo,
};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info};

/// A frame on a room channel: `(sender user id, serialized envelope)`.
pub type Relay = (String, String);

/// Errors while handling a client frame.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
    #[error("Protocol error: {0}")]
    Sync(#[from] SyncError),
    #[error("Rejected shape: {0}")]
    Shape(#[from] ShapeError),
    #[error("Message has no room")]
    MissingRoom,
}

pub type ServerResult<T> = Result<T, ServerError>;

/// Live connections of one room.
struct Room {
    tx: broadcast::Sender<Relay>,
    /// Open connections per user id.
    users: HashMap<String, usize>,
}

impl Room {
    fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            tx,
            users: HashMap::new(),
        }
    }

    fn connect(&mut self, user_id: &str) {
        *self.users.entry(user_id.to_string()).or_default() += 1;
    }

    /// Drop one connection. True when it was the user's last.
    fn disconnect(&mut self, user_id: &str) -> bool {
        match self.users.get_mut(user_id) {
            Some(count) if *count > 1 => {
                *count -= 1;
                false
            }
            Some(_) => {
                self.users.remove(user_id);
                true
            }
            None => false,
        }
    }
}

/// Result of a successful join.
pub struct Joined {
    pub rx: broadcast::Receiver<Relay>,
    /// `init_sync` frame for the joining client.
    pub init_sync: String,
}

/// Explicitly constructed server state.
pub struct ServerContext {
    store: Arc<dyn RoomStore>,
    rooms: DashMap<String, Room>,
    config: ServerConfig,
}

impl ServerContext {
    pub fn new(store: Arc<dyn RoomStore>, config: ServerConfig) -> Self {
        Self {
            store,
            rooms: DashMap::new(),
            config,
        }
    }

    pub fn store(&self) -> &Arc<dyn RoomStore> {
        &self.store
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Ids of users with a live connection to `room_id`.
    pub fn live_users(&self, room_id: &str) -> HashSet<String> {
        self.rooms
            .get(room_id)
            .map(|room| room.users.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Add `user` to a room and build its `init_sync`. The room is created
    /// on first join. Everyone else in the room is told about the joiner.
    pub async fn join(&self, room_id: &str, mut user: UserInfo) -> ServerResult<Joined> {
        // Subscribe before reading the snapshot so no later frame is missed.
        let rx = {
            let mut room = self
                .rooms
                .entry(room_id.to_string())
                .or_insert_with(|| Room::new(self.config.channel_capacity));
            room.connect(&user.user_id);
            room.tx.subscribe()
        };

        self.store.create_room(room_id, room_id).await?;
        user.joined_at = Some(Utc::now().to_rfc3339());
        self.store.add_user(room_id, user.clone()).await?;
        let record = self
            .store
            .get_room(room_id)
            .await?
            .ok_or_else(|| StoreError::RoomNotFound(room_id.to_string()))?;

        let live = self.live_users(room_id);
        let data = InitSyncData {
            shapes: record.wire_shapes(),
            users: record
                .users
                .into_iter()
                .filter(|u| u.user_id != user.user_id && live.contains(&u.user_id))
                .collect(),
            version: record.version,
        };
        let init_sync = Envelope::new(MessageType::InitSync)
            .with_room(room_id)
            .with_user(&user.user_id)
            .with_data(&data)?
            .to_json()?;

        let announce = Envelope::new(MessageType::Join)
            .with_room(room_id)
            .with_user(&user.user_id)
            .with_data(&user)?;
        self.broadcast(room_id, &user.user_id, &announce)?;

        info!(
            "User {} joined room {} ({} shapes, version {})",
            user.user_id,
            room_id,
            data.shapes.len(),
            data.version
        );
        Ok(Joined { rx, init_sync })
    }

    /// Close one of a user's connections to a room. When it was the last,
    /// the user is removed from the record and the others are told.
    pub async fn leave(&self, room_id: &str, user_id: &str) -> ServerResult<()> {
        let last = match self.rooms.get_mut(room_id) {
            Some(mut room) => room.disconnect(user_id),
            None => false,
        };
        self.rooms.remove_if(room_id, |_, room| room.users.is_empty());
        if !last {
            debug!("User {} still connected to room {}", user_id, room_id);
            return Ok(());
        }

        match self.store.remove_user(room_id, user_id).await {
            Ok(_) | Err(StoreError::RoomNotFound(_)) => {}
            Err(err) => return Err(err.into()),
        }
        let envelope = Envelope::new(MessageType::Leave)
            .with_room(room_id)
            .with_user(user_id);
        self.broadcast(room_id, user_id, &envelope)?;
        info!("User {} left room {}", user_id, room_id);
        Ok(())
    }

    /// Persist a command, log it, and relay it to the room.
    ///
    /// Commands that would leave a shape invalid are rejected before the
    /// record is touched and are not relayed. Returns the room version
    /// after the command.
    pub async fn command(&self, room_id: &str, user_id: &str, envelope: Envelope) -> ServerResult<u64> {
        let data: CommandData = envelope.parse_data()?;
        let payload = data.operation;
        let mut version = self.persist(room_id, &payload).await?;

        let record = OperationRecord {
            room_id: room_id.to_string(),
            user_id: user_id.to_string(),
            kind: payload.name().to_string(),
            data: serde_json::to_value(&payload).map_err(SyncError::from)?,
            timestamp: Utc::now(),
        };
        self.store.save_operation(record).await?;

        if version.is_none() {
            version = self.store.get_room(room_id).await?.map(|r| r.version);
        }
        self.relay(room_id, user_id, envelope)?;
        Ok(version.unwrap_or_default())
    }

    /// Apply a payload to the room record. `None` when nothing changed.
    async fn persist(&self, room_id: &str, payload: &CommandPayload) -> ServerResult<Option<u64>> {
        match payload {
            CommandPayload::AddShape { shape } => {
                shape_from_json(shape)?;
                let stored = StoredShape::from_wire(shape.clone())?;
                Ok(Some(self.store.add_shape(room_id, stored).await?))
            }
            CommandPayload::DeleteShape { .. } => {
                let mut version = None;
                for id in payload.target_ids() {
                    match self.store.delete_shape(room_id, id.as_str()).await {
                        Ok(v) => version = Some(v),
                        Err(StoreError::ShapeNotFound(_)) => {
                            debug!("Delete of unknown shape {} in room {}", id, room_id);
                        }
                        Err(err) => return Err(err.into()),
                    }
                }
                Ok(version)
            }
            CommandPayload::UpdateShape { shape_id, fields }
            | CommandPayload::MoveShape { shape_id, fields }
            | CommandPayload::ResizeShape { shape_id, fields }
            | CommandPayload::RotateShape { shape_id, fields } => {
                let record = self
                    .store
                    .get_room(room_id)
                    .await?
                    .ok_or_else(|| StoreError::RoomNotFound(room_id.to_string()))?;
                let mut current = record
                    .find_shape(shape_id)
                    .ok_or_else(|| StoreError::ShapeNotFound(shape_id.clone()))?;
                merge_fields(&mut current, fields);
                shape_from_json(&current)?;
                let version = self
                    .store
                    .update_shape(room_id, shape_id, fields.clone())
                    .await?;
                Ok(Some(version))
            }
        }
    }

    /// Relay a frame to the room without persisting it. The envelope is
    /// stamped with the room and the sender's user id.
    pub fn relay(&self, room_id: &str, user_id: &str, mut envelope: Envelope) -> ServerResult<()> {
        envelope.room_id = Some(room_id.to_string());
        envelope.user_id = Some(user_id.to_string());
        if envelope.timestamp.is_none() {
            envelope.timestamp = Some(Utc::now().timestamp_millis());
        }
        self.broadcast(room_id, user_id, &envelope)
    }

    fn broadcast(&self, room_id: &str, from: &str, envelope: &Envelope) -> ServerResult<()> {
        let frame = envelope.to_json()?;
        if let Some(room) = self.rooms.get(room_id) {
            // No receivers is not an error.
            let _ = room.tx.send((from.to_string(), frame));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryRoomStore;
    use serde_json::json;
    use tokio::sync::broadcast::error::TryRecvError;

    fn context() -> ServerContext {
        ServerContext::new(Arc::new(MemoryRoomStore::new()), ServerConfig::default())
    }

    fn user(id: &str) -> UserInfo {
        UserInfo {
            user_id: id.to_string(),
            name: id.to_string(),
            color: "#ff0000".to_string(),
            joined_at: None,
        }
    }

    fn command(operation: serde_json::Value) -> Envelope {
        let text = json!({"type": "command", "data": {"operation": operation}}).to_string();
        Envelope::from_json(&text).unwrap()
    }

    fn rect(id: &str, x: f64) -> serde_json::Value {
        json!({"id": id, "type": "Rect", "x": x, "y": 0, "width": 10, "height": 10})
    }

    /// Next relayed frame not sent by `me`.
    async fn recv_other(joined: &mut Joined, me: &str) -> (String, String) {
        loop {
            let (from, frame) = joined.rx.recv().await.unwrap();
            if from != me {
                return (from, frame);
            }
        }
    }

    fn drain(joined: &mut Joined) {
        while joined.rx.try_recv().is_ok() {}
    }

    fn init_data(joined: &Joined) -> InitSyncData {
        Envelope::from_json(&joined.init_sync)
            .unwrap()
            .parse_data()
            .unwrap()
    }

    #[tokio::test]
    async fn test_joiner_gets_every_persisted_shape() {
        let ctx = context();
        ctx.store().create_room("r", "r").await.unwrap();
        for i in 0..4 {
            let stored = StoredShape::from_wire(rect(&format!("s{i}"), i as f64)).unwrap();
            ctx.store().add_shape("r", stored).await.unwrap();
        }

        let joined = ctx.join("r", user("alice")).await.unwrap();
        let data = init_data(&joined);
        assert_eq!(data.shapes.len(), 4);
        assert_eq!(data.version, 4);
        assert!(data.users.is_empty());
    }

    #[tokio::test]
    async fn test_join_announced_to_others_only() {
        let ctx = context();
        let mut alice = ctx.join("r", user("alice")).await.unwrap();
        let bob = ctx.join("r", user("bob")).await.unwrap();

        let (from, frame) = recv_other(&mut alice, "alice").await;
        assert_eq!(from, "bob");
        let env = Envelope::from_json(&frame).unwrap();
        assert_eq!(env.kind, MessageType::Join);
        let info: UserInfo = env.parse_data().unwrap();
        assert_eq!(info.name, "bob");

        let users = init_data(&bob).users;
        assert_eq!(users.len(), 1);
        assert_eq!(users[0].user_id, "alice");
    }

    #[tokio::test]
    async fn test_command_persisted_and_relayed() {
        let ctx = context();
        let mut alice = ctx.join("r", user("alice")).await.unwrap();
        ctx.join("r", user("bob")).await.unwrap();
        drain(&mut alice);

        let version = ctx
            .command("r", "bob", command(json!({"command": "add-shape", "shape": rect("a", 100.0)})))
            .await
            .unwrap();
        assert_eq!(version, 1);

        let (from, frame) = recv_other(&mut alice, "alice").await;
        assert_eq!(from, "bob");
        let env = Envelope::from_json(&frame).unwrap();
        assert_eq!(env.user_id.as_deref(), Some("bob"));
        assert_eq!(env.room_id.as_deref(), Some("r"));

        let ops = ctx.store().get_operations("r", 10).await.unwrap();
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].kind, "add-shape");
    }

    #[tokio::test]
    async fn test_invalid_update_rejected_without_relay() {
        let ctx = context();
        let mut alice = ctx.join("r", user("alice")).await.unwrap();
        ctx.command("r", "alice", command(json!({"command": "add-shape", "shape": rect("a", 0.0)})))
            .await
            .unwrap();
        drain(&mut alice);

        let bad = command(json!({"command": "resize-shape", "shapeId": "a", "width": "wide"}));
        assert!(matches!(ctx.command("r", "alice", bad).await, Err(ServerError::Shape(_))));
        let unknown = command(json!({"command": "add-shape", "shape": {"id": "h", "type": "Hexagon"}}));
        assert!(ctx.command("r", "alice", unknown).await.is_err());

        let room = ctx.store().get_room("r").await.unwrap().unwrap();
        assert_eq!(room.version, 1);
        assert_eq!(room.find_shape("a").unwrap()["width"], 10);
        assert!(matches!(alice.rx.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test]
    async fn test_duplicate_add_rejected_without_relay() {
        let ctx = context();
        let mut alice = ctx.join("r", user("alice")).await.unwrap();
        let group = json!({"id": "g", "type": "Group", "children": [rect("a", 0.0)]});
        ctx.command("r", "alice", command(json!({"command": "add-shape", "shape": group})))
            .await
            .unwrap();
        drain(&mut alice);

        for shape in [rect("g", 50.0), rect("a", 50.0)] {
            let dup = command(json!({"command": "add-shape", "shape": shape}));
            assert!(matches!(
                ctx.command("r", "alice", dup).await,
                Err(ServerError::Store(StoreError::DuplicateShape(_)))
            ));
        }

        let room = ctx.store().get_room("r").await.unwrap().unwrap();
        assert_eq!(room.version, 1);
        assert_eq!(room.shapes.len(), 1);
        assert_eq!(ctx.store().get_operations("r", 10).await.unwrap().len(), 1);
        assert!(matches!(alice.rx.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test]
    async fn test_move_and_delete_update_record() {
        let ctx = context();
        ctx.join("r", user("alice")).await.unwrap();
        ctx.command("r", "alice", command(json!({"command": "add-shape", "shape": rect("a", 0.0)})))
            .await
            .unwrap();

        let moved = command(json!({"command": "move-shape", "shapeId": "a", "x": 30, "y": 15}));
        assert_eq!(ctx.command("r", "alice", moved).await.unwrap(), 2);
        let room = ctx.store().get_room("r").await.unwrap().unwrap();
        assert_eq!(room.find_shape("a").unwrap()["x"], 30);

        let delete = command(json!({"command": "delete-shape", "shapeIds": ["a", "ghost"]}));
        assert_eq!(ctx.command("r", "alice", delete).await.unwrap(), 3);
        let room = ctx.store().get_room("r").await.unwrap().unwrap();
        assert!(room.shapes.is_empty());
    }

    #[tokio::test]
    async fn test_leave_updates_record_and_registry() {
        let ctx = context();
        let mut alice = ctx.join("r", user("alice")).await.unwrap();
        ctx.join("r", user("bob")).await.unwrap();
        drain(&mut alice);

        ctx.leave("r", "bob").await.unwrap();
        let (_, frame) = recv_other(&mut alice, "alice").await;
        let env = Envelope::from_json(&frame).unwrap();
        assert_eq!(env.kind, MessageType::Leave);
        assert_eq!(env.user_id.as_deref(), Some("bob"));

        let room = ctx.store().get_room("r").await.unwrap().unwrap();
        assert_eq!(room.users.len(), 1);
        assert_eq!(ctx.live_users("r").len(), 1);

        ctx.leave("r", "alice").await.unwrap();
        assert!(ctx.live_users("r").is_empty());
    }

    #[tokio::test]
    async fn test_same_user_on_two_connections() {
        let ctx = context();
        let mut alice = ctx.join("r", user("alice")).await.unwrap();
        ctx.join("r", user("bob")).await.unwrap();
        ctx.join("r", user("bob")).await.unwrap();
        drain(&mut alice);

        ctx.leave("r", "bob").await.unwrap();
        assert!(ctx.live_users("r").contains("bob"));
        let room = ctx.store().get_room("r").await.unwrap().unwrap();
        assert!(room.users.iter().any(|u| u.user_id == "bob"));
        assert!(matches!(alice.rx.try_recv(), Err(TryRecvError::Empty)));

        ctx.leave("r", "bob").await.unwrap();
        assert!(!ctx.live_users("r").contains("bob"));
        let (_, frame) = recv_other(&mut alice, "alice").await;
        assert_eq!(Envelope::from_json(&frame).unwrap().kind, MessageType::Leave);
    }

    #[tokio::test]
    async fn test_presence_relayed_not_persisted() {
        let ctx = context();
        let mut alice = ctx.join("r", user("alice")).await.unwrap();
        let cursor = Envelope::from_json(r#"{"type":"cursor","data":{"x":1,"y":2}}"#).unwrap();
        ctx.relay("r", "bob", cursor).unwrap();

        let (from, frame) = recv_other(&mut alice, "alice").await;
        assert_eq!(from, "bob");
        assert_eq!(Envelope::from_json(&frame).unwrap().kind, MessageType::Cursor);
        assert_eq!(ctx.store().get_room("r").await.unwrap().unwrap().version, 0);
    }
}
