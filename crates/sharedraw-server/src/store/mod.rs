//! Persistence façade for room records and the operation log.

mod memory;

pub use memory::MemoryRoomStore;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sharedraw_core::shapes::merge_fields;
use sharedraw_core::sync::UserInfo;
use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Room not found: {0}")]
    RoomNotFound(String),
    #[error("Shape not found: {0}")]
    ShapeNotFound(String),
    #[error("Shape id already in use: {0}")]
    DuplicateShape(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Lock error: {0}")]
    Lock(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Boxed future for store operations.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// One top-level shape in a room record. `data` holds the full wire JSON,
/// group members nested under `data.children`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredShape {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub data: Value,
}

impl StoredShape {
    /// Wrap a shape's wire JSON. The `id` and `type` keys are required.
    pub fn from_wire(shape: Value) -> StoreResult<Self> {
        let field = |key: &str| {
            shape
                .get(key)
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| StoreError::Serialization(format!("shape without {key}")))
        };
        Ok(Self {
            id: field("id")?,
            kind: field("type")?,
            data: shape,
        })
    }

    /// Wire JSON as sent to clients.
    pub fn to_wire(&self) -> Value {
        let mut value = self.data.clone();
        if let Some(map) = value.as_object_mut() {
            map.insert("id".into(), Value::String(self.id.clone()));
            map.insert("type".into(), Value::String(self.kind.clone()));
        }
        value
    }
}

/// Persisted state of a room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomRecord {
    pub room_id: String,
    pub name: String,
    /// Top-level shapes in insertion order.
    pub shapes: Vec<StoredShape>,
    pub users: Vec<UserInfo>,
    /// Bumped by every shape mutation.
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RoomRecord {
    pub fn new(room_id: impl Into<String>, name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            room_id: room_id.into(),
            name: name.into(),
            shapes: Vec::new(),
            users: Vec::new(),
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Wire JSON of a shape anywhere in the room, group members included.
    pub fn find_shape(&self, shape_id: &str) -> Option<Value> {
        self.shapes.iter().find_map(|stored| {
            if stored.id == shape_id {
                Some(stored.to_wire())
            } else {
                find_nested(&stored.data, shape_id).cloned()
            }
        })
    }

    pub fn wire_shapes(&self) -> Vec<Value> {
        self.shapes.iter().map(StoredShape::to_wire).collect()
    }

    /// Append a top-level shape. Fails if any id in its subtree is already
    /// in the room or repeats within the subtree.
    pub(crate) fn insert_shape(&mut self, shape: StoredShape) -> StoreResult<()> {
        let wire = shape.to_wire();
        let mut ids = Vec::new();
        collect_ids(&wire, &mut ids);
        let mut seen = HashSet::new();
        for id in ids {
            if !seen.insert(id) || self.find_shape(id).is_some() {
                return Err(StoreError::DuplicateShape(id.to_string()));
            }
        }
        self.shapes.push(shape);
        self.touch();
        Ok(())
    }

    pub(crate) fn merge_shape(&mut self, shape_id: &str, fields: &Map<String, Value>) -> StoreResult<()> {
        let target = self.shapes.iter_mut().find_map(|stored| {
            if stored.id == shape_id {
                Some(&mut stored.data)
            } else {
                find_nested_mut(&mut stored.data, shape_id)
            }
        });
        let target = target.ok_or_else(|| StoreError::ShapeNotFound(shape_id.to_string()))?;
        merge_fields(target, fields);
        self.touch();
        Ok(())
    }

    pub(crate) fn remove_shape(&mut self, shape_id: &str) -> StoreResult<()> {
        if let Some(pos) = self.shapes.iter().position(|s| s.id == shape_id) {
            self.shapes.remove(pos);
        } else if !self.shapes.iter_mut().any(|s| remove_nested(&mut s.data, shape_id)) {
            return Err(StoreError::ShapeNotFound(shape_id.to_string()));
        }
        self.touch();
        Ok(())
    }

    fn touch(&mut self) {
        self.version += 1;
        self.updated_at = Utc::now();
    }
}

fn collect_ids<'a>(value: &'a Value, out: &mut Vec<&'a str>) {
    if let Some(id) = value.get("id").and_then(Value::as_str) {
        out.push(id);
    }
    for child in children(value) {
        collect_ids(child, out);
    }
}

fn children(value: &Value) -> &[Value] {
    value
        .get("children")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[])
}

fn has_id(value: &Value, shape_id: &str) -> bool {
    value.get("id").and_then(Value::as_str) == Some(shape_id)
}

fn find_nested<'a>(value: &'a Value, shape_id: &str) -> Option<&'a Value> {
    children(value).iter().find_map(|child| {
        if has_id(child, shape_id) {
            Some(child)
        } else {
            find_nested(child, shape_id)
        }
    })
}

fn find_nested_mut<'a>(value: &'a mut Value, shape_id: &str) -> Option<&'a mut Value> {
    let children = value.get_mut("children")?.as_array_mut()?;
    for child in children {
        if has_id(child, shape_id) {
            return Some(child);
        }
        if let Some(found) = find_nested_mut(child, shape_id) {
            return Some(found);
        }
    }
    None
}

fn remove_nested(value: &mut Value, shape_id: &str) -> bool {
    let Some(children) = value.get_mut("children").and_then(Value::as_array_mut) else {
        return false;
    };
    if let Some(pos) = children.iter().position(|c| has_id(c, shape_id)) {
        children.remove(pos);
        return true;
    }
    children.iter_mut().any(|c| remove_nested(c, shape_id))
}

/// Append-only audit entry for one relayed command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationRecord {
    pub room_id: String,
    pub user_id: String,
    /// Command name, such as `add-shape`.
    #[serde(rename = "type")]
    pub kind: String,
    pub data: Value,
    pub timestamp: DateTime<Utc>,
}

/// Room persistence backend.
///
/// Shape mutations bump the room version and return the new value.
/// Concurrent calls are applied in arrival order; each call is atomic.
pub trait RoomStore: Send + Sync {
    /// Load a room, or `None` if it was never created.
    fn get_room(&self, room_id: &str) -> BoxFuture<'_, StoreResult<Option<RoomRecord>>>;

    /// Create a room, or return the existing one unchanged.
    fn create_room(&self, room_id: &str, name: &str) -> BoxFuture<'_, StoreResult<RoomRecord>>;

    /// Append a top-level shape. Ids already in the room are rejected with
    /// `DuplicateShape`, group members included.
    fn add_shape(&self, room_id: &str, shape: StoredShape) -> BoxFuture<'_, StoreResult<u64>>;

    /// Merge wire fields into a shape, nested group members included.
    fn update_shape(
        &self,
        room_id: &str,
        shape_id: &str,
        fields: Map<String, Value>,
    ) -> BoxFuture<'_, StoreResult<u64>>;

    /// Remove a shape and, for groups, its members.
    fn delete_shape(&self, room_id: &str, shape_id: &str) -> BoxFuture<'_, StoreResult<u64>>;

    /// Add a user to the room's list, replacing an entry with the same id.
    fn add_user(&self, room_id: &str, user: UserInfo) -> BoxFuture<'_, StoreResult<()>>;

    /// Remove a user. Returns whether the user was listed.
    fn remove_user(&self, room_id: &str, user_id: &str) -> BoxFuture<'_, StoreResult<bool>>;

    fn save_operation(&self, operation: OperationRecord) -> BoxFuture<'_, StoreResult<()>>;

    /// The newest `limit` operations of a room, oldest first.
    fn get_operations(
        &self,
        room_id: &str,
        limit: usize,
    ) -> BoxFuture<'_, StoreResult<Vec<OperationRecord>>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn group_room() -> RoomRecord {
        let mut room = RoomRecord::new("r", "Room");
        room.insert_shape(
            StoredShape::from_wire(json!({
                "id": "g", "type": "Group", "x": 0, "y": 0,
                "children": [
                    {"id": "a", "type": "Rect", "x": 0, "y": 0, "width": 1, "height": 1},
                    {"id": "b", "type": "Circle", "x": 5, "y": 5, "radius": 1}
                ]
            }))
            .unwrap(),
        )
        .unwrap();
        room
    }

    #[test]
    fn test_from_wire_requires_identity() {
        assert!(StoredShape::from_wire(json!({"type": "Rect"})).is_err());
        let stored = StoredShape::from_wire(json!({"id": "r", "type": "Rect"})).unwrap();
        assert_eq!(stored.kind, "Rect");
        assert_eq!(stored.to_wire()["id"], "r");
    }

    #[test]
    fn test_nested_find_update_remove() {
        let mut room = group_room();
        assert_eq!(room.version, 1);
        assert_eq!(room.find_shape("b").unwrap()["radius"], 1);

        let fields: Map<String, Value> = json!({"radius": 4, "id": "zzz"})
            .as_object()
            .cloned()
            .unwrap();
        room.merge_shape("b", &fields).unwrap();
        let b = room.find_shape("b").unwrap();
        assert_eq!(b["radius"], 4);
        assert_eq!(b["id"], "b");

        room.remove_shape("a").unwrap();
        assert!(room.find_shape("a").is_none());
        assert_eq!(room.shapes.len(), 1);
        assert_eq!(room.version, 3);
        assert!(matches!(room.remove_shape("a"), Err(StoreError::ShapeNotFound(_))));
    }

    #[test]
    fn test_insert_rejects_duplicate_ids() {
        let mut room = group_room();
        let top = StoredShape::from_wire(json!({"id": "g", "type": "Rect"})).unwrap();
        assert!(matches!(room.insert_shape(top), Err(StoreError::DuplicateShape(id)) if id == "g"));
        let nested = StoredShape::from_wire(json!({"id": "a", "type": "Rect"})).unwrap();
        assert!(matches!(room.insert_shape(nested), Err(StoreError::DuplicateShape(id)) if id == "a"));
        let carries_member = StoredShape::from_wire(json!({
            "id": "h", "type": "Group", "children": [{"id": "b", "type": "Circle"}]
        }))
        .unwrap();
        assert!(room.insert_shape(carries_member).is_err());
        let repeats = StoredShape::from_wire(json!({
            "id": "k", "type": "Group",
            "children": [{"id": "k2", "type": "Rect"}, {"id": "k2", "type": "Rect"}]
        }))
        .unwrap();
        assert!(room.insert_shape(repeats).is_err());
        assert_eq!(room.version, 1);

        room.insert_shape(StoredShape::from_wire(json!({"id": "x", "type": "Rect"})).unwrap())
            .unwrap();
        let ids: Vec<&str> = room.shapes.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["g", "x"]);
        assert_eq!(room.version, 2);
    }

    #[test]
    fn test_record_json_is_camel_case() {
        let room = RoomRecord::new("r", "Room");
        let value = serde_json::to_value(&room).unwrap();
        assert_eq!(value["roomId"], "r");
        assert!(value.get("createdAt").is_some());
        assert!(value.get("updatedAt").is_some());
    }
}
