use super::{Command, CommandError, CommandResult, ensure_present, return_to};
use crate::scene::{Placement, Scene};
use crate::shapes::{Shape, ShapeId, ShapeSnapshot};
use crate::sync::{CommandPayload, UpdateKind, shape_fields};
use serde_json::{Map, Value, json};
use std::any::Any;

/// Add a shape (or a group with its members).
#[derive(Debug, Clone)]
pub struct AddShape {
    id: ShapeId,
    /// The subtree while it is not in the scene.
    snapshot: Option<ShapeSnapshot>,
    placement: Placement,
}

impl AddShape {
    pub fn new(shape: Shape) -> Self {
        Self::tree(ShapeSnapshot::leaf(shape))
    }

    pub fn tree(snapshot: ShapeSnapshot) -> Self {
        Self {
            id: snapshot.id().clone(),
            snapshot: Some(snapshot),
            placement: Placement::top(),
        }
    }

    pub fn id(&self) -> &ShapeId {
        &self.id
    }
}

impl Command for AddShape {
    fn execute(&mut self, scene: &mut Scene) -> CommandResult<()> {
        let Some(snapshot) = self.snapshot.take() else {
            return Err(CommandError::Stale(self.id.clone()));
        };
        if let Err(err) = scene.restore_tree(snapshot.clone(), &self.placement) {
            self.snapshot = Some(snapshot);
            return Err(err.into());
        }
        Ok(())
    }

    fn undo(&mut self, scene: &mut Scene) -> CommandResult<()> {
        ensure_present(scene, [&self.id])?;
        let (snapshot, placement) = scene.take_tree(&self.id)?;
        self.snapshot = Some(snapshot);
        self.placement = placement;
        Ok(())
    }

    fn name(&self) -> &str {
        "Add Shape"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn payloads(&self, scene: &Scene) -> Vec<CommandPayload> {
        scene
            .snapshot_tree(&self.id)
            .map(|s| vec![CommandPayload::add(&s)])
            .unwrap_or_default()
    }

    fn inverse_payloads(&self, _scene: &Scene) -> Vec<CommandPayload> {
        vec![CommandPayload::delete(std::slice::from_ref(&self.id))]
    }
}

/// Remove one or more shapes with their subtrees.
#[derive(Debug, Clone)]
pub struct RemoveShapes {
    ids: Vec<ShapeId>,
    /// Removed subtrees in removal order, with where they were.
    removed: Vec<(ShapeSnapshot, Placement)>,
}

impl RemoveShapes {
    pub fn new(ids: Vec<ShapeId>) -> Self {
        let mut unique: Vec<ShapeId> = Vec::with_capacity(ids.len());
        for id in ids {
            if !unique.contains(&id) {
                unique.push(id);
            }
        }
        Self {
            ids: unique,
            removed: Vec::new(),
        }
    }

    pub fn ids(&self) -> &[ShapeId] {
        &self.ids
    }

    fn restore_removed(&mut self, scene: &mut Scene) -> CommandResult<()> {
        while let Some((snapshot, placement)) = self.removed.pop() {
            scene.restore_tree(snapshot, &placement)?;
        }
        Ok(())
    }
}

impl Command for RemoveShapes {
    fn execute(&mut self, scene: &mut Scene) -> CommandResult<()> {
        ensure_present(scene, &self.ids)?;
        self.removed.clear();
        let ids = self.ids.clone();
        for id in &ids {
            // Already removed together with an ancestor listed earlier.
            if !scene.contains(id) {
                continue;
            }
            match scene.take_tree(id) {
                Ok(entry) => self.removed.push(entry),
                Err(err) => {
                    self.restore_removed(scene)?;
                    return Err(err.into());
                }
            }
        }
        Ok(())
    }

    fn undo(&mut self, scene: &mut Scene) -> CommandResult<()> {
        // Reverse removal order puts every shape back in its slot.
        self.restore_removed(scene)
    }

    fn name(&self) -> &str {
        "Delete"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn payloads(&self, _scene: &Scene) -> Vec<CommandPayload> {
        let ids: Vec<ShapeId> = self.removed.iter().map(|(s, _)| s.id().clone()).collect();
        vec![CommandPayload::delete(&ids)]
    }

    fn inverse_payloads(&self, scene: &Scene) -> Vec<CommandPayload> {
        // Restored top-level shapes are re-added; a restored group member is
        // sent as a full update of its top-level ancestor.
        let mut seen: Vec<ShapeId> = Vec::new();
        let mut payloads = Vec::new();
        for id in &self.ids {
            let root = scene
                .ancestors(id)
                .ok()
                .and_then(|chain| chain.into_iter().next())
                .unwrap_or_else(|| id.clone());
            if seen.contains(&root) {
                continue;
            }
            let Ok(snapshot) = scene.snapshot_tree(&root) else {
                continue;
            };
            if self.removed.iter().any(|(s, _)| s.id() == &root) {
                payloads.push(CommandPayload::add(&snapshot));
            } else {
                payloads.push(CommandPayload::update(
                    UpdateKind::Update,
                    &root,
                    shape_fields(&snapshot),
                ));
            }
            seen.push(root);
        }
        payloads
    }
}

/// Replace a shape's state with an edited version: resize, rotate, restyle,
/// or any other field change. Keeps both versions.
#[derive(Debug, Clone)]
pub struct ModifyShape {
    before: ShapeSnapshot,
    after: ShapeSnapshot,
    kind: UpdateKind,
    placement: Option<Placement>,
}

impl ModifyShape {
    pub fn new(before: ShapeSnapshot, after: ShapeSnapshot) -> Self {
        Self {
            before,
            after,
            kind: UpdateKind::Update,
            placement: None,
        }
    }

    /// Capture the current state of `id` and an edited copy of it.
    pub fn capture(
        scene: &Scene,
        id: &ShapeId,
        edit: impl FnOnce(&mut Shape),
    ) -> CommandResult<Self> {
        let before = scene.snapshot_tree(id)?;
        let mut after = before.clone();
        edit(&mut after.shape);
        Ok(Self::new(before, after))
    }

    /// Broadcast as `resize-shape`. Consecutive resizes of one shape merge.
    pub fn as_resize(mut self) -> Self {
        self.kind = UpdateKind::Resize;
        self
    }

    /// Broadcast as `rotate-shape`. Consecutive rotations of one shape merge.
    pub fn as_rotate(mut self) -> Self {
        self.kind = UpdateKind::Rotate;
        self
    }

    pub fn id(&self) -> &ShapeId {
        self.before.id()
    }

    fn state_payload(&self, scene: &Scene) -> Vec<CommandPayload> {
        scene
            .snapshot_tree(self.id())
            .map(|s| vec![CommandPayload::update(self.kind, self.id(), shape_fields(&s))])
            .unwrap_or_default()
    }
}

impl Command for ModifyShape {
    fn execute(&mut self, scene: &mut Scene) -> CommandResult<()> {
        ensure_present(scene, [self.id()])?;
        self.placement = Some(scene.placement_of(self.id())?);
        scene.replace_tree(self.after.clone())?;
        Ok(())
    }

    fn undo(&mut self, scene: &mut Scene) -> CommandResult<()> {
        ensure_present(scene, [self.id()])?;
        scene.replace_tree(self.before.clone())?;
        if let Some(placement) = &self.placement {
            return_to(scene, self.before.id(), placement)?;
        }
        Ok(())
    }

    fn name(&self) -> &str {
        match self.kind {
            UpdateKind::Resize => "Resize",
            UpdateKind::Rotate => "Rotate",
            UpdateKind::Update | UpdateKind::Move => "Edit Shape",
        }
    }

    fn can_merge(&self, other: &dyn Command) -> bool {
        matches!(self.kind, UpdateKind::Resize | UpdateKind::Rotate)
            && other
                .as_any()
                .downcast_ref::<ModifyShape>()
                .is_some_and(|o| o.kind == self.kind && o.id() == self.id())
    }

    fn merge(&mut self, other: &dyn Command) {
        if let Some(other) = other.as_any().downcast_ref::<ModifyShape>() {
            self.after = other.after.clone();
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn payloads(&self, scene: &Scene) -> Vec<CommandPayload> {
        self.state_payload(scene)
    }

    fn inverse_payloads(&self, scene: &Scene) -> Vec<CommandPayload> {
        self.state_payload(scene)
    }
}

/// Change a shape's paint-order key.
#[derive(Debug, Clone)]
pub struct SetZIndex {
    id: ShapeId,
    z_index: i32,
    previous: Option<(i32, Placement)>,
}

impl SetZIndex {
    pub fn new(id: ShapeId, z_index: i32) -> Self {
        Self {
            id,
            z_index,
            previous: None,
        }
    }

    pub fn bring_to_front(scene: &Scene, id: &ShapeId) -> CommandResult<Self> {
        Ok(Self::new(id.clone(), scene.front_z_index(id)?))
    }

    pub fn send_to_back(scene: &Scene, id: &ShapeId) -> CommandResult<Self> {
        Ok(Self::new(id.clone(), scene.back_z_index(id)?))
    }

    fn state_payload(&self, scene: &Scene) -> Vec<CommandPayload> {
        let Some(shape) = scene.get(&self.id) else {
            return Vec::new();
        };
        let mut fields = Map::new();
        fields.insert("zIndex".into(), json!(shape.z_index));
        vec![CommandPayload::update(UpdateKind::Update, &self.id, fields)]
    }
}

impl Command for SetZIndex {
    fn execute(&mut self, scene: &mut Scene) -> CommandResult<()> {
        ensure_present(scene, [&self.id])?;
        let placement = scene.placement_of(&self.id)?;
        let previous = scene.set_z_index(&self.id, self.z_index)?;
        self.previous = Some((previous, placement));
        Ok(())
    }

    fn undo(&mut self, scene: &mut Scene) -> CommandResult<()> {
        ensure_present(scene, [&self.id])?;
        if let Some((previous, placement)) = &self.previous {
            scene.set_z_index(&self.id, *previous)?;
            return_to(scene, &self.id, placement)?;
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "Reorder"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn payloads(&self, scene: &Scene) -> Vec<CommandPayload> {
        self.state_payload(scene)
    }

    fn inverse_payloads(&self, scene: &Scene) -> Vec<CommandPayload> {
        self.state_payload(scene)
    }
}
