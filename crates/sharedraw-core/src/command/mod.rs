//! Reversible scene mutations and the undo/redo log.
//!
//! A [`Command`] mutates the scene in `execute` and reverts exactly that
//! mutation in `undo`. It only touches the scene for the duration of one call.
//! Commands that cross the network also describe their effect as
//! [`CommandPayload`]s, so the session can broadcast what happened without
//! serializing the command object itself.

mod edit;
mod grouping;
mod manager;
mod movement;

pub use edit::{AddShape, ModifyShape, RemoveShapes, SetZIndex};
pub use grouping::{GroupShapes, UngroupShape};
pub use manager::{CommandManager, DEFAULT_HISTORY_CAPACITY};
pub use movement::MoveShapes;

use crate::scene::{Placement, Scene, SceneError};
use crate::shapes::ShapeId;
use crate::sync::CommandPayload;
use std::any::Any;
use std::fmt;
use thiserror::Error;

/// Command errors.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CommandError {
    #[error(transparent)]
    Scene(#[from] SceneError),
    /// The command's target is gone, usually removed by another participant.
    #[error("Shape {0} no longer exists")]
    Stale(ShapeId),
}

pub type CommandResult<T> = Result<T, CommandError>;

/// A reversible mutation of the scene.
pub trait Command: fmt::Debug {
    /// Apply the mutation. Called again on redo.
    fn execute(&mut self, scene: &mut Scene) -> CommandResult<()>;

    /// Revert the mutation applied by the last `execute`.
    fn undo(&mut self, scene: &mut Scene) -> CommandResult<()>;

    /// Human-readable name for menus.
    fn name(&self) -> &str;

    /// Whether `other`, executed right after this command, can be folded
    /// into it as a single undo step.
    fn can_merge(&self, _other: &dyn Command) -> bool {
        false
    }

    /// Fold `other` into this command. Only called after `can_merge`.
    fn merge(&mut self, _other: &dyn Command) {}

    fn as_any(&self) -> &dyn Any;

    /// Network description of the state after `execute`.
    fn payloads(&self, scene: &Scene) -> Vec<CommandPayload>;

    /// Network description of the state after `undo`.
    fn inverse_payloads(&self, scene: &Scene) -> Vec<CommandPayload>;
}

/// Fail with `Stale` unless every id is present.
fn ensure_present<'a>(
    scene: &Scene,
    ids: impl IntoIterator<Item = &'a ShapeId>,
) -> CommandResult<()> {
    for id in ids {
        if !scene.contains(id) {
            return Err(CommandError::Stale(id.clone()));
        }
    }
    Ok(())
}

/// Move a shape back to a recorded slot after a reorder.
fn return_to(scene: &mut Scene, id: &ShapeId, placement: &Placement) -> CommandResult<()> {
    if scene.placement_of(id)? != *placement {
        let (snapshot, _) = scene.take_tree(id)?;
        scene.restore_tree(snapshot, placement)?;
    }
    Ok(())
}
