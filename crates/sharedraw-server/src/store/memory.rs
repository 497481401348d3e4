//! In-memory room store.

use super::{BoxFuture, OperationRecord, RoomRecord, RoomStore, StoreError, StoreResult, StoredShape};
use chrono::Utc;
use serde_json::{Map, Value};
use sharedraw_core::sync::UserInfo;
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

/// Store that keeps everything in process memory. State is lost on exit.
#[derive(Default)]
pub struct MemoryRoomStore {
    rooms: RwLock<HashMap<String, RoomRecord>>,
    operations: RwLock<HashMap<String, Vec<OperationRecord>>>,
}

impl MemoryRoomStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` against a room under the write lock.
    fn with_room<T>(
        &self,
        room_id: &str,
        f: impl FnOnce(&mut RoomRecord) -> StoreResult<T>,
    ) -> StoreResult<T> {
        let mut rooms = self.rooms.write().map_err(lock_error)?;
        let room = rooms
            .get_mut(room_id)
            .ok_or_else(|| StoreError::RoomNotFound(room_id.to_string()))?;
        f(room)
    }
}

fn lock_error<T>(err: PoisonError<T>) -> StoreError {
    StoreError::Lock(err.to_string())
}

impl RoomStore for MemoryRoomStore {
    fn get_room(&self, room_id: &str) -> BoxFuture<'_, StoreResult<Option<RoomRecord>>> {
        let room_id = room_id.to_string();
        Box::pin(async move {
            let rooms = self.rooms.read().map_err(lock_error)?;
            Ok(rooms.get(&room_id).cloned())
        })
    }

    fn create_room(&self, room_id: &str, name: &str) -> BoxFuture<'_, StoreResult<RoomRecord>> {
        let room_id = room_id.to_string();
        let name = name.to_string();
        Box::pin(async move {
            let mut rooms = self.rooms.write().map_err(lock_error)?;
            let room = rooms
                .entry(room_id.clone())
                .or_insert_with(|| RoomRecord::new(room_id, name));
            Ok(room.clone())
        })
    }

    fn add_shape(&self, room_id: &str, shape: StoredShape) -> BoxFuture<'_, StoreResult<u64>> {
        let room_id = room_id.to_string();
        Box::pin(async move {
            self.with_room(&room_id, |room| {
                room.insert_shape(shape)?;
                Ok(room.version)
            })
        })
    }

    fn update_shape(
        &self,
        room_id: &str,
        shape_id: &str,
        fields: Map<String, Value>,
    ) -> BoxFuture<'_, StoreResult<u64>> {
        let room_id = room_id.to_string();
        let shape_id = shape_id.to_string();
        Box::pin(async move {
            self.with_room(&room_id, |room| {
                room.merge_shape(&shape_id, &fields)?;
                Ok(room.version)
            })
        })
    }

    fn delete_shape(&self, room_id: &str, shape_id: &str) -> BoxFuture<'_, StoreResult<u64>> {
        let room_id = room_id.to_string();
        let shape_id = shape_id.to_string();
        Box::pin(async move {
            self.with_room(&room_id, |room| {
                room.remove_shape(&shape_id)?;
                Ok(room.version)
            })
        })
    }

    fn add_user(&self, room_id: &str, user: UserInfo) -> BoxFuture<'_, StoreResult<()>> {
        let room_id = room_id.to_string();
        Box::pin(async move {
            self.with_room(&room_id, |room| {
                room.users.retain(|u| u.user_id != user.user_id);
                room.users.push(user);
                room.updated_at = Utc::now();
                Ok(())
            })
        })
    }

    fn remove_user(&self, room_id: &str, user_id: &str) -> BoxFuture<'_, StoreResult<bool>> {
        let room_id = room_id.to_string();
        let user_id = user_id.to_string();
        Box::pin(async move {
            self.with_room(&room_id, |room| {
                let before = room.users.len();
                room.users.retain(|u| u.user_id != user_id);
                let removed = room.users.len() != before;
                if removed {
                    room.updated_at = Utc::now();
                }
                Ok(removed)
            })
        })
    }

    fn save_operation(&self, operation: OperationRecord) -> BoxFuture<'_, StoreResult<()>> {
        Box::pin(async move {
            let mut operations = self.operations.write().map_err(lock_error)?;
            operations
                .entry(operation.room_id.clone())
                .or_default()
                .push(operation);
            Ok(())
        })
    }

    fn get_operations(
        &self,
        room_id: &str,
        limit: usize,
    ) -> BoxFuture<'_, StoreResult<Vec<OperationRecord>>> {
        let room_id = room_id.to_string();
        Box::pin(async move {
            let operations = self.operations.read().map_err(lock_error)?;
            let log = operations.get(&room_id).map(Vec::as_slice).unwrap_or(&[]);
            let start = log.len().saturating_sub(limit);
            Ok(log[start..].to_vec())
        })
    }
}
