use super::{Command, CommandResult, ensure_present};
use crate::scene::{Placement, Scene};
use crate::shapes::{ShapeId, ShapeSnapshot};
use crate::sync::CommandPayload;
use std::any::Any;

/// Wrap top-level shapes in a new group.
#[derive(Debug, Clone)]
pub struct GroupShapes {
    ids: Vec<ShapeId>,
    group_id: ShapeId,
    /// Members as they were before grouping, by ascending root position.
    members: Vec<(ShapeSnapshot, Placement)>,
}

impl GroupShapes {
    pub fn new(ids: Vec<ShapeId>) -> Self {
        Self::with_group_id(ids, ShapeId::new())
    }

    pub fn with_group_id(ids: Vec<ShapeId>, group_id: ShapeId) -> Self {
        Self {
            ids,
            group_id,
            members: Vec::new(),
        }
    }

    pub fn group_id(&self) -> &ShapeId {
        &self.group_id
    }
}

impl Command for GroupShapes {
    fn execute(&mut self, scene: &mut Scene) -> CommandResult<()> {
        ensure_present(scene, &self.ids)?;
        let mut members = Vec::with_capacity(self.ids.len());
        for id in &self.ids {
            if members.iter().any(|(s, _): &(ShapeSnapshot, Placement)| s.id() == id) {
                continue;
            }
            members.push((scene.snapshot_tree(id)?, scene.placement_of(id)?));
        }
        members.sort_by_key(|(_, placement)| placement.position);

        scene.group_shapes(&self.ids, self.group_id.clone())?;
        self.members = members;
        Ok(())
    }

    fn undo(&mut self, scene: &mut Scene) -> CommandResult<()> {
        ensure_present(scene, [&self.group_id])?;
        scene.take_tree(&self.group_id)?;
        // Ascending positions land every member back in its own slot.
        for (snapshot, placement) in &self.members {
            scene.restore_tree(snapshot.clone(), placement)?;
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "Group"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn payloads(&self, scene: &Scene) -> Vec<CommandPayload> {
        let ids: Vec<ShapeId> = self.members.iter().map(|(s, _)| s.id().clone()).collect();
        let mut payloads = vec![CommandPayload::delete(&ids)];
        if let Ok(group) = scene.snapshot_tree(&self.group_id) {
            payloads.push(CommandPayload::add(&group));
        }
        payloads
    }

    fn inverse_payloads(&self, scene: &Scene) -> Vec<CommandPayload> {
        let mut payloads = vec![CommandPayload::delete(std::slice::from_ref(&self.group_id))];
        payloads.extend(
            self.members
                .iter()
                .filter_map(|(s, _)| scene.snapshot_tree(s.id()).ok())
                .map(|s| CommandPayload::add(&s)),
        );
        payloads
    }
}

/// Dissolve a top-level group into its members.
#[derive(Debug, Clone)]
pub struct UngroupShape {
    group_id: ShapeId,
    before: Option<(ShapeSnapshot, Placement)>,
    child_ids: Vec<ShapeId>,
}

impl UngroupShape {
    pub fn new(group_id: ShapeId) -> Self {
        Self {
            group_id,
            before: None,
            child_ids: Vec::new(),
        }
    }

    /// Former members, filled in by `execute`.
    pub fn child_ids(&self) -> &[ShapeId] {
        &self.child_ids
    }
}

impl Command for UngroupShape {
    fn execute(&mut self, scene: &mut Scene) -> CommandResult<()> {
        ensure_present(scene, [&self.group_id])?;
        let snapshot = scene.snapshot_tree(&self.group_id)?;
        let placement = scene.placement_of(&self.group_id)?;
        self.child_ids = scene.ungroup(&self.group_id)?;
        self.before = Some((snapshot, placement));
        Ok(())
    }

    fn undo(&mut self, scene: &mut Scene) -> CommandResult<()> {
        let Some((snapshot, placement)) = self.before.clone() else {
            return Ok(());
        };
        ensure_present(scene, &self.child_ids)?;
        for id in &self.child_ids {
            scene.take_tree(id)?;
        }
        scene.restore_tree(snapshot, &placement)?;
        Ok(())
    }

    fn name(&self) -> &str {
        "Ungroup"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn payloads(&self, scene: &Scene) -> Vec<CommandPayload> {
        let mut payloads = vec![CommandPayload::delete(std::slice::from_ref(&self.group_id))];
        payloads.extend(
            self.child_ids
                .iter()
                .filter_map(|id| scene.snapshot_tree(id).ok())
                .map(|s| CommandPayload::add(&s)),
        );
        payloads
    }

    fn inverse_payloads(&self, scene: &Scene) -> Vec<CommandPayload> {
        let mut payloads = vec![CommandPayload::delete(&self.child_ids)];
        if let Ok(group) = scene.snapshot_tree(&self.group_id) {
            payloads.push(CommandPayload::add(&group));
        }
        payloads
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shapes::{LocalTransform, Shape};

    fn scene_with_rects(count: usize) -> (Scene, Vec<ShapeId>) {
        let mut scene = Scene::new();
        let ids = (0..count)
            .map(|i| {
                scene
                    .add_shape(Shape::rect(i as f64 * 20.0, 0.0, 10.0, 10.0))
                    .unwrap()
            })
            .collect();
        (scene, ids)
    }

    #[test]
    fn test_group_and_undo() {
        let (mut scene, ids) = scene_with_rects(4);
        let before = scene.snapshot_all();
        let mut cmd =
            GroupShapes::with_group_id(vec![ids[2].clone(), ids[0].clone()], "g".into());

        cmd.execute(&mut scene).unwrap();
        assert_eq!(scene.roots().len(), 3);
        assert_eq!(scene.get(&ids[0]).unwrap().parent(), Some(&"g".into()));
        assert_eq!(
            scene.get(&"g".into()).unwrap().as_group().unwrap().children(),
            &[ids[0].clone(), ids[2].clone()]
        );

        cmd.undo(&mut scene).unwrap();
        assert!(!scene.contains(&"g".into()));
        assert_eq!(scene.snapshot_all(), before);

        cmd.execute(&mut scene).unwrap();
        assert!(scene.contains(&"g".into()));
    }

    #[test]
    fn test_group_payloads() {
        let (mut scene, ids) = scene_with_rects(2);
        let mut cmd = GroupShapes::with_group_id(ids.clone(), "g".into());
        cmd.execute(&mut scene).unwrap();

        let payloads = cmd.payloads(&scene);
        assert_eq!(payloads.len(), 2);
        assert_eq!(payloads[0].target_ids(), ids);
        match &payloads[1] {
            CommandPayload::AddShape { shape } => {
                assert_eq!(shape["type"], "Group");
                assert_eq!(shape["children"].as_array().unwrap().len(), 2);
            }
            other => panic!("Wrong payload: {other:?}"),
        }
    }

    #[test]
    fn test_ungroup_and_undo() {
        let (mut scene, ids) = scene_with_rects(3);
        scene
            .group_shapes(&[ids[0].clone(), ids[1].clone()], "g".into())
            .unwrap();
        if let Some(group) = scene.get_mut(&"g".into()) {
            group.transform = LocalTransform::at(5.0, 7.0);
        }
        let before = scene.snapshot_all();

        let mut cmd = UngroupShape::new("g".into());
        cmd.execute(&mut scene).unwrap();
        assert!(!scene.contains(&"g".into()));
        assert_eq!(cmd.child_ids(), &[ids[0].clone(), ids[1].clone()]);
        let t = scene.get(&ids[1]).unwrap().transform;
        assert!((t.x - 25.0).abs() < 1e-9);
        assert!((t.y - 7.0).abs() < 1e-9);

        cmd.undo(&mut scene).unwrap();
        assert_eq!(scene.snapshot_all(), before);
    }

    #[test]
    fn test_ungroup_payloads() {
        let (mut scene, ids) = scene_with_rects(2);
        scene.group_shapes(&ids, "g".into()).unwrap();
        let mut cmd = UngroupShape::new("g".into());
        cmd.execute(&mut scene).unwrap();

        let payloads = cmd.payloads(&scene);
        assert_eq!(payloads.len(), 3);
        assert_eq!(payloads[0].target_ids(), vec![ShapeId::from("g")]);
        assert_eq!(payloads[1].name(), "add-shape");

        let inverse = {
            cmd.undo(&mut scene).unwrap();
            cmd.inverse_payloads(&scene)
        };
        assert_eq!(inverse[0].target_ids(), ids);
        assert_eq!(inverse[1].name(), "add-shape");
    }
}
