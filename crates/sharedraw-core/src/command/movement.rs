use super::{Command, CommandResult, ensure_present};
use crate::scene::Scene;
use crate::shapes::ShapeId;
use crate::sync::{CommandPayload, UpdateKind};
use kurbo::Vec2;
use serde_json::{Map, json};
use std::any::Any;

/// Translate shapes by a delta in their parent's space.
///
/// Consecutive moves of the same selection merge into one undo step, so a
/// drag is undone as a whole.
#[derive(Debug, Clone)]
pub struct MoveShapes {
    ids: Vec<ShapeId>,
    delta: Vec2,
}

impl MoveShapes {
    pub fn new(ids: Vec<ShapeId>, delta: Vec2) -> Self {
        let mut unique: Vec<ShapeId> = Vec::with_capacity(ids.len());
        for id in ids {
            if !unique.contains(&id) {
                unique.push(id);
            }
        }
        Self { ids: unique, delta }
    }

    pub fn ids(&self) -> &[ShapeId] {
        &self.ids
    }

    pub fn delta(&self) -> Vec2 {
        self.delta
    }

    fn translate(&self, scene: &mut Scene, delta: Vec2) -> CommandResult<()> {
        ensure_present(scene, &self.ids)?;
        for id in &self.ids {
            if let Some(shape) = scene.get_mut(id) {
                shape.transform.translate(delta);
            }
        }
        scene.mark_index_dirty();
        Ok(())
    }

    fn same_selection(&self, other: &MoveShapes) -> bool {
        self.ids.len() == other.ids.len() && self.ids.iter().all(|id| other.ids.contains(id))
    }

    /// Absolute positions, so a late or repeated message cannot drift.
    fn position_payloads(&self, scene: &Scene) -> Vec<CommandPayload> {
        self.ids
            .iter()
            .filter_map(|id| {
                let shape = scene.get(id)?;
                let mut fields = Map::new();
                fields.insert("x".into(), json!(shape.transform.x));
                fields.insert("y".into(), json!(shape.transform.y));
                Some(CommandPayload::update(UpdateKind::Move, id, fields))
            })
            .collect()
    }
}

impl Command for MoveShapes {
    fn execute(&mut self, scene: &mut Scene) -> CommandResult<()> {
        self.translate(scene, self.delta)
    }

    fn undo(&mut self, scene: &mut Scene) -> CommandResult<()> {
        self.translate(scene, -self.delta)
    }

    fn name(&self) -> &str {
        "Move"
    }

    fn can_merge(&self, other: &dyn Command) -> bool {
        other
            .as_any()
            .downcast_ref::<MoveShapes>()
            .is_some_and(|o| self.same_selection(o))
    }

    fn merge(&mut self, other: &dyn Command) {
        if let Some(other) = other.as_any().downcast_ref::<MoveShapes>() {
            self.delta += other.delta;
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn payloads(&self, scene: &Scene) -> Vec<CommandPayload> {
        self.position_payloads(scene)
    }

    fn inverse_payloads(&self, scene: &Scene) -> Vec<CommandPayload> {
        self.position_payloads(scene)
    }
}
