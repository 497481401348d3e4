//! Wire protocol shared by clients and the relay server.
//!
//! Every frame is one JSON [`Envelope`]:
//! `{type, roomId?, userId?, timestamp?, data?}`. Command envelopes carry a
//! [`CommandPayload`] under `data.operation`; the payload is the minimal
//! network form of a mutation, independent of the in-process command object.

use crate::scene::{Scene, SceneError};
use crate::shapes::{ShapeError, ShapeId, ShapeSnapshot, merge_fields, shape_from_json};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Synchronization errors.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Malformed message: {0}")]
    Malformed(String),
    #[error("Invalid shape: {0}")]
    Shape(#[from] ShapeError),
    #[error("Cannot apply to scene: {0}")]
    Scene(#[from] SceneError),
    #[error("Not joined to a room")]
    NotJoined,
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Malformed(err.to_string())
    }
}

pub type SyncResult<T> = Result<T, SyncError>;

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Envelope type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Join,
    Leave,
    Command,
    Cursor,
    Selection,
    Lock,
    Unlock,
    InitSync,
}

/// One protocol frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: MessageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl Envelope {
    pub fn new(kind: MessageType) -> Self {
        Self {
            kind,
            room_id: None,
            user_id: None,
            timestamp: Some(now_millis()),
            data: None,
        }
    }

    pub fn with_room(mut self, room_id: impl Into<String>) -> Self {
        self.room_id = Some(room_id.into());
        self
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_data<T: Serialize>(mut self, data: &T) -> SyncResult<Self> {
        self.data = Some(serde_json::to_value(data)?);
        Ok(self)
    }

    /// Command envelope wrapping a payload under `data.operation`.
    pub fn command(payload: CommandPayload) -> SyncResult<Self> {
        Self::new(MessageType::Command).with_data(&CommandData { operation: payload })
    }

    pub fn to_json(&self) -> SyncResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(text: &str) -> SyncResult<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Decode `data` into a typed body.
    pub fn parse_data<T: serde::de::DeserializeOwned>(&self) -> SyncResult<T> {
        let data = self
            .data
            .clone()
            .ok_or_else(|| SyncError::Malformed(format!("{:?} envelope without data", self.kind)))?;
        Ok(serde_json::from_value(data)?)
    }
}

/// Body of a client `join`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
}

/// A participant as listed in room records and `init_sync`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserInfo {
    pub user_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub color: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub joined_at: Option<String>,
}

/// Body of `init_sync`: the authoritative room state for a joiner.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitSyncData {
    pub shapes: Vec<Value>,
    /// Every other participant currently in the room.
    pub users: Vec<UserInfo>,
    #[serde(default)]
    pub version: u64,
}

/// Body of a `command` envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandData {
    pub operation: CommandPayload,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CursorData {
    pub x: f64,
    pub y: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectionData {
    pub shape_ids: Vec<String>,
}

/// Body of `lock` / `unlock`. Locks are advisory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockData {
    pub shape_id: String,
}

/// Network form of a mutation, tagged by `command`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "kebab-case")]
pub enum CommandPayload {
    AddShape {
        shape: Value,
    },
    #[serde(alias = "remove-shape")]
    DeleteShape {
        #[serde(rename = "shapeId", default, skip_serializing_if = "Option::is_none")]
        shape_id: Option<String>,
        #[serde(rename = "shapeIds", default, skip_serializing_if = "Vec::is_empty")]
        shape_ids: Vec<String>,
    },
    UpdateShape {
        #[serde(rename = "shapeId")]
        shape_id: String,
        #[serde(flatten)]
        fields: Map<String, Value>,
    },
    MoveShape {
        #[serde(rename = "shapeId")]
        shape_id: String,
        #[serde(flatten)]
        fields: Map<String, Value>,
    },
    ResizeShape {
        #[serde(rename = "shapeId")]
        shape_id: String,
        #[serde(flatten)]
        fields: Map<String, Value>,
    },
    RotateShape {
        #[serde(rename = "shapeId")]
        shape_id: String,
        #[serde(flatten)]
        fields: Map<String, Value>,
    },
}

/// Which update variant a field change travels as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateKind {
    Update,
    Move,
    Resize,
    Rotate,
}

/// Wire fields of a shape, without its identity keys.
pub fn shape_fields(snapshot: &ShapeSnapshot) -> Map<String, Value> {
    match snapshot.to_json() {
        Value::Object(mut map) => {
            map.remove("id");
            map.remove("type");
            map
        }
        _ => Map::new(),
    }
}

impl CommandPayload {
    pub fn add(snapshot: &ShapeSnapshot) -> Self {
        CommandPayload::AddShape {
            shape: snapshot.to_json(),
        }
    }

    pub fn delete(ids: &[ShapeId]) -> Self {
        match ids {
            [single] => CommandPayload::DeleteShape {
                shape_id: Some(single.to_string()),
                shape_ids: Vec::new(),
            },
            _ => CommandPayload::DeleteShape {
                shape_id: None,
                shape_ids: ids.iter().map(ToString::to_string).collect(),
            },
        }
    }

    pub fn update(kind: UpdateKind, id: &ShapeId, fields: Map<String, Value>) -> Self {
        let shape_id = id.to_string();
        match kind {
            UpdateKind::Update => CommandPayload::UpdateShape { shape_id, fields },
            UpdateKind::Move => CommandPayload::MoveShape { shape_id, fields },
            UpdateKind::Resize => CommandPayload::ResizeShape { shape_id, fields },
            UpdateKind::Rotate => CommandPayload::RotateShape { shape_id, fields },
        }
    }

    /// Wire name of the payload kind.
    pub fn name(&self) -> &'static str {
        match self {
            CommandPayload::AddShape { .. } => "add-shape",
            CommandPayload::DeleteShape { .. } => "delete-shape",
            CommandPayload::UpdateShape { .. } => "update-shape",
            CommandPayload::MoveShape { .. } => "move-shape",
            CommandPayload::ResizeShape { .. } => "resize-shape",
            CommandPayload::RotateShape { .. } => "rotate-shape",
        }
    }

    /// Ids of every shape the payload touches. For `add-shape` this is the
    /// id inside the shape JSON, if present.
    pub fn target_ids(&self) -> Vec<ShapeId> {
        match self {
            CommandPayload::AddShape { shape } => shape
                .get("id")
                .and_then(Value::as_str)
                .map(|id| vec![ShapeId::from(id)])
                .unwrap_or_default(),
            CommandPayload::DeleteShape {
                shape_id,
                shape_ids,
            } => shape_id
                .iter()
                .chain(shape_ids.iter())
                .map(|id| ShapeId::from(id.as_str()))
                .collect(),
            CommandPayload::UpdateShape { shape_id, .. }
            | CommandPayload::MoveShape { shape_id, .. }
            | CommandPayload::ResizeShape { shape_id, .. }
            | CommandPayload::RotateShape { shape_id, .. } => {
                vec![ShapeId::from(shape_id.as_str())]
            }
        }
    }
}

/// Apply a payload to a scene without touching the command log.
///
/// Each shape is updated atomically: a field change is merged into the
/// shape's current wire form and rebuilt through the factory, so malformed
/// fields leave the shape untouched. Deleting an id that is not present is
/// skipped. Returns the ids that changed.
pub fn apply_payload(scene: &mut Scene, payload: &CommandPayload) -> SyncResult<Vec<ShapeId>> {
    match payload {
        CommandPayload::AddShape { shape } => {
            let snapshot = shape_from_json(shape)?;
            Ok(vec![scene.insert_tree(snapshot)?])
        }
        CommandPayload::DeleteShape { .. } => {
            let mut removed = Vec::new();
            for id in payload.target_ids() {
                match scene.remove_shape(&id) {
                    Ok(_) => removed.push(id),
                    Err(SceneError::NotFound(_)) => {
                        log::debug!("Delete of unknown shape {id} ignored");
                    }
                    Err(err) => return Err(err.into()),
                }
            }
            Ok(removed)
        }
        CommandPayload::UpdateShape { shape_id, fields }
        | CommandPayload::MoveShape { shape_id, fields }
        | CommandPayload::ResizeShape { shape_id, fields }
        | CommandPayload::RotateShape { shape_id, fields } => {
            let id = ShapeId::from(shape_id.as_str());
            let mut value = scene.snapshot_tree(&id)?.to_json();
            merge_fields(&mut value, fields);
            let snapshot = shape_from_json(&value)?;
            scene.replace_tree(snapshot)?;
            Ok(vec![id])
        }
    }
}

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

/// Events produced from inbound traffic.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// Connected to server
    Connected,
    /// Disconnected from server
    Disconnected,
    /// Authoritative room state received after joining.
    Joined {
        room_id: String,
        shapes: Vec<Value>,
        users: Vec<UserInfo>,
        version: u64,
    },
    /// Another participant joined.
    UserJoined(UserInfo),
    /// A participant left.
    UserLeft { user_id: String },
    /// A mutation made by another participant.
    RemoteCommand {
        user_id: Option<String>,
        payload: CommandPayload,
    },
    Cursor { user_id: String, x: f64, y: f64 },
    Selection { user_id: String, shape_ids: Vec<String> },
    Lock { user_id: String, shape_id: String },
    Unlock { user_id: String, shape_id: String },
    /// Error occurred
    Error { message: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shapes::Shape;
    use serde_json::json;

    #[test]
    fn test_envelope_roundtrip() {
        let env = Envelope::new(MessageType::InitSync)
            .with_room("room-1")
            .with_user("u1");
        let json = env.to_json().unwrap();
        assert!(json.contains(r#""type":"init_sync""#));
        assert!(json.contains(r#""roomId":"room-1""#));
        assert!(!json.contains("data"));
        assert_eq!(Envelope::from_json(&json).unwrap(), env);
    }

    #[test]
    fn test_unknown_envelope_type_is_malformed() {
        let err = Envelope::from_json(r#"{"type":"teleport"}"#).unwrap_err();
        assert!(matches!(err, SyncError::Malformed(_)));
        assert!(Envelope::from_json("not json").is_err());
    }

    #[test]
    fn test_command_payload_wire_format() {
        let payload: CommandPayload = serde_json::from_value(json!({
            "command": "move-shape", "shapeId": "s1", "x": 10.0, "y": 5.0
        }))
        .unwrap();
        match &payload {
            CommandPayload::MoveShape { shape_id, fields } => {
                assert_eq!(shape_id, "s1");
                assert_eq!(fields.len(), 2);
                assert_eq!(fields["x"], 10.0);
            }
            other => panic!("Wrong payload: {other:?}"),
        }
        let back = serde_json::to_value(&payload).unwrap();
        assert_eq!(back["command"], "move-shape");
        assert_eq!(back["shapeId"], "s1");
    }

    #[test]
    fn test_remove_shape_alias() {
        let payload: CommandPayload = serde_json::from_value(json!({
            "command": "remove-shape", "shapeIds": ["a", "b"]
        }))
        .unwrap();
        assert_eq!(
            payload.target_ids(),
            vec![ShapeId::from("a"), ShapeId::from("b")]
        );
        assert_eq!(payload.name(), "delete-shape");
    }

    #[test]
    fn test_command_envelope_nests_operation() {
        let env = Envelope::command(CommandPayload::delete(&["x".into()])).unwrap();
        let value: Value = serde_json::from_str(&env.to_json().unwrap()).unwrap();
        assert_eq!(value["data"]["operation"]["command"], "delete-shape");
        assert_eq!(value["data"]["operation"]["shapeId"], "x");
        let data: CommandData = env.parse_data().unwrap();
        assert_eq!(data.operation, CommandPayload::delete(&["x".into()]));
    }

    #[test]
    fn test_apply_add_update_delete() {
        let mut scene = Scene::new();
        let add = CommandPayload::AddShape {
            shape: json!({"id": "r", "type": "Rect", "x": 1, "y": 2, "width": 3, "height": 4}),
        };
        assert_eq!(apply_payload(&mut scene, &add).unwrap(), vec![ShapeId::from("r")]);

        let mut fields = Map::new();
        fields.insert("x".into(), json!(50.0));
        let update = CommandPayload::update(UpdateKind::Move, &"r".into(), fields);
        apply_payload(&mut scene, &update).unwrap();
        let shape = scene.get(&"r".into()).unwrap();
        assert_eq!(shape.transform.x, 50.0);
        assert_eq!(shape.transform.y, 2.0);

        let delete = CommandPayload::delete(&["r".into(), "missing".into()]);
        assert_eq!(apply_payload(&mut scene, &delete).unwrap(), vec![ShapeId::from("r")]);
        assert!(scene.is_empty());
    }

    #[test]
    fn test_malformed_update_leaves_shape_untouched() {
        let mut scene = Scene::new();
        let id = scene.add_shape(Shape::rect(0.0, 0.0, 10.0, 10.0)).unwrap();
        let before = scene.snapshot_tree(&id).unwrap();

        let mut fields = Map::new();
        fields.insert("x".into(), json!(99.0));
        fields.insert("width".into(), json!("wide"));
        let update = CommandPayload::update(UpdateKind::Resize, &id, fields);
        assert!(matches!(
            apply_payload(&mut scene, &update),
            Err(SyncError::Shape(_))
        ));
        assert_eq!(scene.snapshot_tree(&id).unwrap(), before);

        let add_unknown = CommandPayload::AddShape {
            shape: json!({"id": "z", "type": "Star"}),
        };
        assert!(apply_payload(&mut scene, &add_unknown).is_err());
        assert_eq!(scene.len(), 1);
    }
}
