//! Editor session: the scene, its command log and the room connection.
//!
//! Every mutation enters through one of two doors, tagged by [`Origin`].
//! Local mutations go through the command log, so they are undoable, and
//! their payloads are queued for broadcast. Remote mutations are applied to
//! the scene directly; they are never logged and never broadcast again.

use crate::camera::Camera;
use crate::collaboration::CollaborationManager;
use crate::command::{Command, CommandManager, CommandResult};
use crate::config::EditorConfig;
use crate::scene::Scene;
use crate::shapes::{ShapeId, shape_from_json};
use crate::sync::{CommandPayload, ConnectionState, SyncEvent, SyncResult, apply_payload};
use crate::transport::{NativeWebSocket, TransportEvent};
use serde_json::Value;

/// Where a mutation came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Origin {
    Local,
    /// Applied on behalf of another participant.
    Remote(String),
}

/// One client's editing state.
#[derive(Debug)]
pub struct EditorSession {
    scene: Scene,
    commands: CommandManager,
    collab: CollaborationManager,
    pub camera: Camera,
    config: EditorConfig,
}

impl Default for EditorSession {
    fn default() -> Self {
        Self::new(EditorConfig::default())
    }
}

impl EditorSession {
    pub fn new(config: EditorConfig) -> Self {
        Self::with_collaboration(config, CollaborationManager::new())
    }

    pub fn with_collaboration(config: EditorConfig, mut collab: CollaborationManager) -> Self {
        collab.apply_config(&config);
        Self {
            scene: Scene::from_config(&config),
            commands: CommandManager::from_config(&config),
            collab,
            camera: Camera::new(),
            config,
        }
    }

    pub fn scene(&self) -> &Scene {
        &self.scene
    }

    /// Direct scene access for tools that mutate shapes in place. Such edits
    /// are neither undoable nor broadcast, and the spatial index does not see
    /// them until [`Scene::mark_index_dirty`] is called.
    pub fn scene_mut(&mut self) -> &mut Scene {
        &mut self.scene
    }

    pub fn commands(&self) -> &CommandManager {
        &self.commands
    }

    pub fn collab(&self) -> &CollaborationManager {
        &self.collab
    }

    pub fn collab_mut(&mut self) -> &mut CollaborationManager {
        &mut self.collab
    }

    pub fn config(&self) -> &EditorConfig {
        &self.config
    }

    // --- Local mutations ---

    /// Execute a local command: log it and broadcast its effect.
    pub fn execute(&mut self, command: Box<dyn Command>) -> CommandResult<()> {
        let payloads = self.commands.execute(command, &mut self.scene)?;
        self.broadcast(payloads);
        Ok(())
    }

    pub fn undo(&mut self) -> CommandResult<()> {
        let payloads = self.commands.undo(&mut self.scene)?;
        self.broadcast(payloads);
        Ok(())
    }

    pub fn redo(&mut self) -> CommandResult<()> {
        let payloads = self.commands.redo(&mut self.scene)?;
        self.broadcast(payloads);
        Ok(())
    }

    /// End the current drag so the next command is a separate undo step.
    pub fn end_gesture(&mut self) {
        self.commands.break_merge();
    }

    fn broadcast(&mut self, payloads: Vec<CommandPayload>) {
        for payload in payloads {
            self.collab.send_command(payload);
        }
    }

    /// Apply a payload outside the command log. Local payloads are
    /// broadcast; remote ones are not.
    pub fn apply(&mut self, payload: CommandPayload, origin: Origin) -> SyncResult<Vec<ShapeId>> {
        let changed = apply_payload(&mut self.scene, &payload)?;
        match origin {
            Origin::Local => {
                self.collab.send_command(payload);
            }
            Origin::Remote(user_id) => {
                log::debug!("Applied {} from {user_id}", payload.name());
            }
        }
        Ok(changed)
    }

    // --- Room ---

    pub fn join_room(&mut self, room_id: &str) -> bool {
        self.collab.join_room(room_id)
    }

    pub fn leave_room(&mut self) {
        self.collab.leave_room();
    }

    /// Frames waiting to be written to the transport.
    pub fn take_outgoing(&mut self) -> Vec<String> {
        self.collab.take_outgoing()
    }

    /// Handle one inbound frame. Malformed frames and commands that cannot
    /// be applied are logged and dropped, leaving the scene untouched.
    pub fn receive(&mut self, text: &str) -> Option<SyncEvent> {
        let event = match self.collab.handle_message(text) {
            Ok(Some(event)) => event,
            Ok(None) => return None,
            Err(err) => {
                log::warn!("Dropping malformed message: {err}");
                return None;
            }
        };
        self.handle_event(event)
    }

    fn handle_event(&mut self, event: SyncEvent) -> Option<SyncEvent> {
        match &event {
            SyncEvent::Joined { shapes, .. } => self.load_room(shapes),
            SyncEvent::RemoteCommand { user_id, payload } => {
                let origin = Origin::Remote(user_id.clone().unwrap_or_default());
                if let Err(err) = self.apply(payload.clone(), origin) {
                    log::warn!("Dropping remote {}: {err}", payload.name());
                    return None;
                }
            }
            _ => {}
        }
        Some(event)
    }

    /// Replace the scene with the authoritative room state. Local history
    /// refers to the old scene, so it is cleared.
    fn load_room(&mut self, shapes: &[Value]) {
        self.scene.clear();
        self.commands.clear();
        for value in shapes {
            let result = shape_from_json(value)
                .map_err(|e| e.to_string())
                .and_then(|snapshot| self.scene.insert_tree(snapshot).map_err(|e| e.to_string()));
            if let Err(err) = result {
                log::warn!("Skipping shape in init_sync: {err}");
            }
        }
    }

    // --- Transport ---

    /// Exchange frames with a transport: feed received frames in and write
    /// queued frames out. Call once per frame.
    pub fn pump(&mut self, socket: &mut NativeWebSocket) -> Vec<SyncEvent> {
        let mut events = Vec::new();
        for event in socket.poll_events() {
            match event {
                TransportEvent::Connected => {
                    self.collab.set_connection_state(ConnectionState::Connected);
                    events.push(SyncEvent::Connected);
                }
                TransportEvent::Disconnected => {
                    self.collab.set_connection_state(ConnectionState::Disconnected);
                    events.push(SyncEvent::Disconnected);
                }
                TransportEvent::Error(message) => {
                    self.collab.set_connection_state(ConnectionState::Error);
                    events.push(SyncEvent::Error { message });
                }
                TransportEvent::Message(text) => events.extend(self.receive(&text)),
            }
        }
        for frame in self.collab.take_outgoing() {
            if let Err(err) = socket.send(&frame) {
                log::debug!("Dropping outgoing message: {err}");
            }
        }
        events
    }

    /// Connect a transport and mark the collaboration layer as connecting,
    /// so a following `join_room` is queued.
    pub fn connect(&mut self, socket: &mut NativeWebSocket, url: &str) -> bool {
        match socket.connect(url) {
            Ok(()) => {
                self.collab.set_connection_state(ConnectionState::Connecting);
                true
            }
            Err(err) => {
                log::warn!("Cannot connect to {url}: {err}");
                false
            }
        }
    }
}
