use super::{Command, CommandResult};
use crate::config::EditorConfig;
use crate::scene::Scene;
use crate::sync::CommandPayload;
use std::collections::VecDeque;

/// Default undo history depth.
pub const DEFAULT_HISTORY_CAPACITY: usize = 100;

/// Undo/redo log of executed commands.
///
/// Every mutating call returns the payloads that describe its effect, for
/// the caller to broadcast. Remote payloads never pass through here, so undo
/// only ever reverts local actions.
///
/// Every execute, undo and redo marks the scene's spatial index dirty, so
/// queries after a command, including in-place moves, see the new geometry.
/// Only edits made directly through [`Scene::get_mut`] can leave the index
/// stale.
#[derive(Debug)]
pub struct CommandManager {
    undo_stack: VecDeque<Box<dyn Command>>,
    redo_stack: Vec<Box<dyn Command>>,
    capacity: usize,
    /// Whether the next command may fold into the top of the undo stack.
    merge_open: bool,
}

impl Default for CommandManager {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandManager {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_HISTORY_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            undo_stack: VecDeque::with_capacity(capacity),
            redo_stack: Vec::new(),
            capacity,
            merge_open: false,
        }
    }

    pub fn from_config(config: &EditorConfig) -> Self {
        Self::with_capacity(config.history_capacity)
    }

    /// Run a command and record it. On failure nothing is recorded and the
    /// redo stack is kept.
    pub fn execute(
        &mut self,
        mut command: Box<dyn Command>,
        scene: &mut Scene,
    ) -> CommandResult<Vec<CommandPayload>> {
        command.execute(scene)?;
        scene.mark_index_dirty();
        let payloads = command.payloads(scene);
        log::debug!("Executed {}", command.name());

        self.redo_stack.clear();
        if self.merge_open {
            if let Some(top) = self.undo_stack.back_mut() {
                if top.can_merge(command.as_ref()) {
                    top.merge(command.as_ref());
                    return Ok(payloads);
                }
            }
        }
        self.undo_stack.push_back(command);
        while self.undo_stack.len() > self.capacity {
            if let Some(dropped) = self.undo_stack.pop_front() {
                log::trace!("History full, dropped {}", dropped.name());
            }
        }
        self.merge_open = true;
        Ok(payloads)
    }

    /// Revert the most recent command. A no-op on an empty history. A command
    /// whose undo fails (typically because a remote edit removed its target)
    /// is discarded.
    pub fn undo(&mut self, scene: &mut Scene) -> CommandResult<Vec<CommandPayload>> {
        self.merge_open = false;
        let Some(mut command) = self.undo_stack.pop_back() else {
            return Ok(Vec::new());
        };
        if let Err(err) = command.undo(scene) {
            log::warn!("Undo of {} failed: {err}", command.name());
            scene.mark_index_dirty();
            return Err(err);
        }
        scene.mark_index_dirty();
        let payloads = command.inverse_payloads(scene);
        self.redo_stack.push(command);
        Ok(payloads)
    }

    /// Re-apply the most recently undone command.
    pub fn redo(&mut self, scene: &mut Scene) -> CommandResult<Vec<CommandPayload>> {
        self.merge_open = false;
        let Some(mut command) = self.redo_stack.pop() else {
            return Ok(Vec::new());
        };
        if let Err(err) = command.execute(scene) {
            log::warn!("Redo of {} failed: {err}", command.name());
            scene.mark_index_dirty();
            return Err(err);
        }
        scene.mark_index_dirty();
        let payloads = command.payloads(scene);
        self.undo_stack.push_back(command);
        Ok(payloads)
    }

    /// End the current gesture; the next command starts a new undo step.
    pub fn break_merge(&mut self) {
        self.merge_open = false;
    }

    pub fn can_undo(&self) -> bool {
        !self.undo_stack.is_empty()
    }

    pub fn can_redo(&self) -> bool {
        !self.redo_stack.is_empty()
    }

    pub fn undo_depth(&self) -> usize {
        self.undo_stack.len()
    }

    pub fn redo_depth(&self) -> usize {
        self.redo_stack.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Name of the command the next undo would revert.
    pub fn undo_name(&self) -> Option<&str> {
        self.undo_stack.back().map(|c| c.name())
    }

    pub fn redo_name(&self) -> Option<&str> {
        self.redo_stack.last().map(|c| c.name())
    }

    pub fn clear(&mut self) {
        self.undo_stack.clear();
        self.redo_stack.clear();
        self.merge_open = false;
    }
}
