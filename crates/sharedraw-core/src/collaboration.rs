//! Client side of the room protocol.
//!
//! [`CollaborationManager`] owns this client's identity, the room it is in,
//! the queue of outgoing frames and a presence table of the other
//! participants. It never touches the scene: inbound frames are turned into
//! [`SyncEvent`]s for the session to act on.
//!
//! Outgoing frames are dropped, not queued, while the connection is down.
//! After a reconnect the caller joins again and the fresh `init_sync`
//! replaces whatever was missed.

use crate::config::EditorConfig;
use crate::sync::{
    CommandData, CommandPayload, ConnectionState, CursorData, Envelope, InitSyncData, JoinData,
    LockData, MessageType, SelectionData, SyncError, SyncEvent, SyncResult, UserInfo,
};
use kurbo::Point;
use std::collections::{BTreeSet, HashMap, VecDeque};
use uuid::Uuid;

/// What is known about another participant. Advisory only.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteUser {
    pub info: UserInfo,
    pub cursor: Option<Point>,
    pub selection: Vec<String>,
    pub locks: BTreeSet<String>,
}

impl RemoteUser {
    fn new(info: UserInfo) -> Self {
        Self {
            info,
            cursor: None,
            selection: Vec::new(),
            locks: BTreeSet::new(),
        }
    }
}

/// Manages room membership and the outgoing frame queue.
#[derive(Debug)]
pub struct CollaborationManager {
    user_id: String,
    name: String,
    color: String,
    /// Room requested by the last `join_room`.
    room_id: Option<String>,
    /// Set once the server's `init_sync` arrived.
    joined: bool,
    state: ConnectionState,
    /// Room version reported by the last `init_sync`.
    version: u64,
    outgoing: VecDeque<String>,
    max_pending: usize,
    users: HashMap<String, RemoteUser>,
}

impl CollaborationManager {
    /// Create a manager with a fresh user id.
    pub fn new() -> Self {
        Self::with_identity(Uuid::new_v4().to_string(), "Anonymous", "#3b82f6")
    }

    pub fn with_identity(
        user_id: impl Into<String>,
        name: impl Into<String>,
        color: impl Into<String>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            name: name.into(),
            color: color.into(),
            room_id: None,
            joined: false,
            state: ConnectionState::Disconnected,
            version: 0,
            outgoing: VecDeque::new(),
            max_pending: EditorConfig::default().max_pending_outgoing,
            users: HashMap::new(),
        }
    }

    pub fn apply_config(&mut self, config: &EditorConfig) {
        self.max_pending = config.max_pending_outgoing.max(1);
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn color(&self) -> &str {
        &self.color
    }

    pub fn room_id(&self) -> Option<&str> {
        self.room_id.as_deref()
    }

    pub fn is_joined(&self) -> bool {
        self.joined
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// Record the transport's state. Losing the connection also loses the
    /// room membership and everything known about other participants.
    pub fn set_connection_state(&mut self, state: ConnectionState) {
        if self.state != state {
            log::info!("Connection state {:?} -> {:?}", self.state, state);
        }
        self.state = state;
        if matches!(
            state,
            ConnectionState::Disconnected | ConnectionState::Error
        ) {
            self.joined = false;
            self.users.clear();
            self.outgoing.clear();
        }
    }

    fn is_online(&self) -> bool {
        matches!(
            self.state,
            ConnectionState::Connecting | ConnectionState::Connected
        )
    }

    fn envelope(&self, kind: MessageType) -> Envelope {
        let env = Envelope::new(kind).with_user(self.user_id.clone());
        match &self.room_id {
            Some(room) => env.with_room(room.clone()),
            None => env,
        }
    }

    fn queue(&mut self, envelope: SyncResult<Envelope>) -> bool {
        if !self.is_online() {
            log::debug!("Dropping outgoing message while {:?}", self.state);
            return false;
        }
        let text = match envelope.and_then(|env| env.to_json()) {
            Ok(text) => text,
            Err(err) => {
                log::error!("Failed to encode outgoing message: {err}");
                return false;
            }
        };
        if self.outgoing.len() >= self.max_pending {
            log::warn!("Outgoing queue full, dropping oldest message");
            self.outgoing.pop_front();
        }
        self.outgoing.push_back(text);
        true
    }

    /// Ask to join a room. The room is joined once `init_sync` arrives.
    pub fn join_room(&mut self, room_id: &str) -> bool {
        self.room_id = Some(room_id.to_string());
        self.joined = false;
        self.users.clear();
        let data = JoinData {
            name: Some(self.name.clone()),
            color: Some(self.color.clone()),
        };
        let envelope = self.envelope(MessageType::Join).with_data(&data);
        self.queue(envelope)
    }

    /// Leave the current room, if any.
    pub fn leave_room(&mut self) {
        if self.room_id.is_none() {
            return;
        }
        let envelope = Ok(self.envelope(MessageType::Leave));
        self.queue(envelope);
        self.room_id = None;
        self.joined = false;
        self.users.clear();
    }

    /// Queue a command for broadcast. Returns false when it was dropped
    /// because the client is not in a room.
    pub fn send_command(&mut self, payload: CommandPayload) -> bool {
        if !self.joined {
            log::debug!("Not in a room, dropping {} broadcast", payload.name());
            return false;
        }
        let envelope = self
            .envelope(MessageType::Command)
            .with_data(&CommandData { operation: payload });
        self.queue(envelope)
    }

    fn send_presence<T: serde::Serialize>(&mut self, kind: MessageType, data: &T) -> bool {
        if !self.joined {
            return false;
        }
        let envelope = self.envelope(kind).with_data(data);
        self.queue(envelope)
    }

    pub fn set_cursor(&mut self, x: f64, y: f64) -> bool {
        self.send_presence(MessageType::Cursor, &CursorData { x, y })
    }

    pub fn set_selection(&mut self, shape_ids: Vec<String>) -> bool {
        self.send_presence(MessageType::Selection, &SelectionData { shape_ids })
    }

    /// Announce an advisory lock. Nothing enforces it.
    pub fn lock_shape(&mut self, shape_id: &str) -> bool {
        let data = LockData {
            shape_id: shape_id.to_string(),
        };
        self.send_presence(MessageType::Lock, &data)
    }

    pub fn unlock_shape(&mut self, shape_id: &str) -> bool {
        let data = LockData {
            shape_id: shape_id.to_string(),
        };
        self.send_presence(MessageType::Unlock, &data)
    }

    /// Take pending outgoing frames (drains the queue).
    pub fn take_outgoing(&mut self) -> Vec<String> {
        self.outgoing.drain(..).collect()
    }

    pub fn has_outgoing(&self) -> bool {
        !self.outgoing.is_empty()
    }

    // --- Presence ---

    pub fn users(&self) -> impl Iterator<Item = &RemoteUser> {
        self.users.values()
    }

    pub fn remote_user(&self, user_id: &str) -> Option<&RemoteUser> {
        self.users.get(user_id)
    }

    /// Participant currently announcing a lock on the shape.
    pub fn lock_holder(&self, shape_id: &str) -> Option<&str> {
        self.users
            .values()
            .find(|u| u.locks.contains(shape_id))
            .map(|u| u.info.user_id.as_str())
    }

    fn presence_mut(&mut self, user_id: &str) -> &mut RemoteUser {
        self.users
            .entry(user_id.to_string())
            .or_insert_with(|| {
                RemoteUser::new(UserInfo {
                    user_id: user_id.to_string(),
                    name: String::new(),
                    color: String::new(),
                    joined_at: None,
                })
            })
    }

    // --- Inbound ---

    /// Decode one inbound frame. Frames this client sent itself and frames
    /// for another room yield `Ok(None)`.
    pub fn handle_message(&mut self, text: &str) -> SyncResult<Option<SyncEvent>> {
        let envelope = Envelope::from_json(text)?;

        if let (Some(ours), Some(theirs)) = (&self.room_id, &envelope.room_id) {
            if ours != theirs {
                log::debug!("Ignoring message for room {theirs}");
                return Ok(None);
            }
        }
        let from_self = envelope.user_id.as_deref() == Some(self.user_id.as_str());

        match envelope.kind {
            MessageType::InitSync => {
                let data: InitSyncData = envelope.parse_data()?;
                let room_id = envelope
                    .room_id
                    .or_else(|| self.room_id.clone())
                    .ok_or_else(|| SyncError::Malformed("init_sync without room".into()))?;
                self.room_id = Some(room_id.clone());
                self.joined = true;
                self.version = data.version;
                self.users = data
                    .users
                    .iter()
                    .filter(|u| u.user_id != self.user_id)
                    .map(|u| (u.user_id.clone(), RemoteUser::new(u.clone())))
                    .collect();
                log::info!(
                    "Joined room {room_id} with {} shapes and {} other users",
                    data.shapes.len(),
                    self.users.len()
                );
                Ok(Some(SyncEvent::Joined {
                    room_id,
                    shapes: data.shapes,
                    users: data.users,
                    version: data.version,
                }))
            }
            _ if from_self => Ok(None),
            MessageType::Join => {
                let user_id = require_user(&envelope)?;
                let data: JoinData = envelope
                    .data
                    .clone()
                    .map(serde_json::from_value)
                    .transpose()?
                    .unwrap_or_default();
                let info = UserInfo {
                    user_id: user_id.clone(),
                    name: data.name.unwrap_or_default(),
                    color: data.color.unwrap_or_default(),
                    joined_at: None,
                };
                self.users.insert(user_id, RemoteUser::new(info.clone()));
                Ok(Some(SyncEvent::UserJoined(info)))
            }
            MessageType::Leave => {
                let user_id = require_user(&envelope)?;
                self.users.remove(&user_id);
                Ok(Some(SyncEvent::UserLeft { user_id }))
            }
            MessageType::Command => {
                let data: CommandData = envelope.parse_data()?;
                Ok(Some(SyncEvent::RemoteCommand {
                    user_id: envelope.user_id,
                    payload: data.operation,
                }))
            }
            MessageType::Cursor => {
                let user_id = require_user(&envelope)?;
                let CursorData { x, y } = envelope.parse_data()?;
                self.presence_mut(&user_id).cursor = Some(Point::new(x, y));
                Ok(Some(SyncEvent::Cursor { user_id, x, y }))
            }
            MessageType::Selection => {
                let user_id = require_user(&envelope)?;
                let SelectionData { shape_ids } = envelope.parse_data()?;
                self.presence_mut(&user_id).selection = shape_ids.clone();
                Ok(Some(SyncEvent::Selection { user_id, shape_ids }))
            }
            MessageType::Lock => {
                let user_id = require_user(&envelope)?;
                let LockData { shape_id } = envelope.parse_data()?;
                self.presence_mut(&user_id).locks.insert(shape_id.clone());
                Ok(Some(SyncEvent::Lock { user_id, shape_id }))
            }
            MessageType::Unlock => {
                let user_id = require_user(&envelope)?;
                let LockData { shape_id } = envelope.parse_data()?;
                self.presence_mut(&user_id).locks.remove(&shape_id);
                Ok(Some(SyncEvent::Unlock { user_id, shape_id }))
            }
        }
    }
}

impl Default for CollaborationManager {
    fn default() -> Self {
        Self::new()
    }
}

fn require_user(envelope: &Envelope) -> SyncResult<String> {
    envelope
        .user_id
        .clone()
        .ok_or_else(|| SyncError::Malformed(format!("{:?} message without userId", envelope.kind)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shapes::ShapeId;
    use serde_json::json;

    fn joined_manager() -> CollaborationManager {
        let mut manager = CollaborationManager::with_identity("me", "Me", "#ff0000");
        manager.set_connection_state(ConnectionState::Connected);
        manager.join_room("room-1");
        let init = json!({
            "type": "init_sync",
            "roomId": "room-1",
            "data": {
                "shapes": [],
                "users": [
                    {"userId": "me", "name": "Me", "color": "#ff0000"},
                    {"userId": "bob", "name": "Bob", "color": "#00ff00"}
                ],
                "version": 3
            }
        });
        manager.handle_message(&init.to_string()).unwrap();
        manager.take_outgoing();
        manager
    }

    #[test]
    fn test_join_queues_envelope() {
        let mut manager = CollaborationManager::with_identity("me", "Me", "#ff0000");
        manager.set_connection_state(ConnectionState::Connecting);
        assert!(manager.join_room("room-1"));
        let out = manager.take_outgoing();
        assert_eq!(out.len(), 1);
        let env = Envelope::from_json(&out[0]).unwrap();
        assert_eq!(env.kind, MessageType::Join);
        assert_eq!(env.room_id.as_deref(), Some("room-1"));
        assert_eq!(env.user_id.as_deref(), Some("me"));
        let data: JoinData = env.parse_data().unwrap();
        assert_eq!(data.name.as_deref(), Some("Me"));
        assert!(!manager.is_joined());
    }

    #[test]
    fn test_init_sync_joins_and_lists_others() {
        let manager = joined_manager();
        assert!(manager.is_joined());
        assert_eq!(manager.version(), 3);
        assert_eq!(manager.users().count(), 1);
        assert_eq!(manager.remote_user("bob").unwrap().info.name, "Bob");
    }

    #[test]
    fn test_messages_dropped_while_disconnected() {
        let mut manager = CollaborationManager::with_identity("me", "Me", "#ff0000");
        assert!(!manager.join_room("room-1"));
        assert!(!manager.has_outgoing());

        let mut manager = joined_manager();
        manager.set_connection_state(ConnectionState::Disconnected);
        assert!(!manager.is_joined());
        assert!(!manager.send_command(CommandPayload::delete(&[ShapeId::from("a")])));
        assert!(!manager.set_cursor(1.0, 2.0));
        assert!(!manager.has_outgoing());
    }

    #[test]
    fn test_commands_need_a_joined_room() {
        let mut manager = CollaborationManager::with_identity("me", "Me", "#ff0000");
        manager.set_connection_state(ConnectionState::Connected);
        manager.join_room("room-1");
        manager.take_outgoing();
        assert!(!manager.send_command(CommandPayload::delete(&[ShapeId::from("a")])));

        let mut manager = joined_manager();
        assert!(manager.send_command(CommandPayload::delete(&[ShapeId::from("a")])));
        let env = Envelope::from_json(&manager.take_outgoing()[0]).unwrap();
        assert_eq!(env.kind, MessageType::Command);
        let data: CommandData = env.parse_data().unwrap();
        assert_eq!(data.operation.name(), "delete-shape");
    }

    #[test]
    fn test_own_commands_are_ignored() {
        let mut manager = joined_manager();
        let own = json!({
            "type": "command", "roomId": "room-1", "userId": "me",
            "data": {"operation": {"command": "delete-shape", "shapeId": "a"}}
        });
        assert_eq!(manager.handle_message(&own.to_string()).unwrap(), None);

        let theirs = json!({
            "type": "command", "roomId": "room-1", "userId": "bob",
            "data": {"operation": {"command": "delete-shape", "shapeId": "a"}}
        });
        match manager.handle_message(&theirs.to_string()).unwrap() {
            Some(SyncEvent::RemoteCommand { user_id, payload }) => {
                assert_eq!(user_id.as_deref(), Some("bob"));
                assert_eq!(payload.target_ids(), vec![ShapeId::from("a")]);
            }
            other => panic!("Unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_presence_table() {
        let mut manager = joined_manager();
        let frames = [
            json!({"type": "join", "roomId": "room-1", "userId": "carol",
                   "data": {"name": "Carol", "color": "#0000ff"}}),
            json!({"type": "cursor", "roomId": "room-1", "userId": "carol",
                   "data": {"x": 4.0, "y": 5.0}}),
            json!({"type": "lock", "roomId": "room-1", "userId": "carol",
                   "data": {"shapeId": "s1"}}),
            json!({"type": "selection", "roomId": "room-1", "userId": "carol",
                   "data": {"shapeIds": ["s1", "s2"]}}),
        ];
        for frame in &frames {
            assert!(manager.handle_message(&frame.to_string()).unwrap().is_some());
        }
        let carol = manager.remote_user("carol").unwrap();
        assert_eq!(carol.info.name, "Carol");
        assert_eq!(carol.cursor, Some(Point::new(4.0, 5.0)));
        assert_eq!(carol.selection, vec!["s1".to_string(), "s2".to_string()]);
        assert_eq!(manager.lock_holder("s1"), Some("carol"));

        let unlock = json!({"type": "unlock", "roomId": "room-1", "userId": "carol",
                            "data": {"shapeId": "s1"}});
        manager.handle_message(&unlock.to_string()).unwrap();
        assert_eq!(manager.lock_holder("s1"), None);

        let leave = json!({"type": "leave", "roomId": "room-1", "userId": "carol"});
        assert_eq!(
            manager.handle_message(&leave.to_string()).unwrap(),
            Some(SyncEvent::UserLeft {
                user_id: "carol".into()
            })
        );
        assert!(manager.remote_user("carol").is_none());
    }

    #[test]
    fn test_malformed_frames_are_errors() {
        let mut manager = joined_manager();
        assert!(manager.handle_message("{").is_err());
        let no_user = json!({"type": "cursor", "roomId": "room-1", "data": {"x": 1, "y": 2}});
        assert!(matches!(
            manager.handle_message(&no_user.to_string()),
            Err(SyncError::Malformed(_))
        ));
        let bad_op = json!({"type": "command", "roomId": "room-1", "userId": "bob",
                            "data": {"operation": {"command": "explode"}}});
        assert!(manager.handle_message(&bad_op.to_string()).is_err());
    }

    #[test]
    fn test_other_room_ignored() {
        let mut manager = joined_manager();
        let frame = json!({"type": "leave", "roomId": "room-2", "userId": "bob"});
        assert_eq!(manager.handle_message(&frame.to_string()).unwrap(), None);
        assert!(manager.remote_user("bob").is_some());
    }

    #[test]
    fn test_queue_is_bounded() {
        let mut manager = joined_manager();
        manager.apply_config(&EditorConfig {
            max_pending_outgoing: 2,
            ..EditorConfig::default()
        });
        for i in 0..3 {
            manager.set_cursor(i as f64, 0.0);
        }
        let out = manager.take_outgoing();
        assert_eq!(out.len(), 2);
        let last: CursorData = Envelope::from_json(&out[1]).unwrap().parse_data().unwrap();
        assert_eq!(last.x, 2.0);
    }
}
