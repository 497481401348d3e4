//! Scene container: shape arena, paint order, group hierarchy and the
//! spatial index façade.
//!
//! Shapes live in a map keyed by id. Top-level shapes are listed in `order`,
//! groups list their children; both lists are kept stably sorted by z-index,
//! so shapes with equal keys paint in insertion order.
//!
//! The spatial index covers top-level shapes. It is rebuilt lazily before a
//! query whenever it has been marked dirty. Adding, removing, reparenting and
//! commands mark it dirty; mutating a shape in place through [`Scene::get_mut`]
//! does not, and queries keep answering from the old geometry until
//! [`Scene::mark_index_dirty`] is called.

use crate::config::EditorConfig;
use crate::geometry::{Aabb, GeometryError, compose, try_invert};
use crate::shapes::{Group, LocalTransform, Shape, ShapeId, ShapeKind, ShapeSnapshot};
use crate::spatial::{DEFAULT_CAPACITY, DEFAULT_MAX_DEPTH, SpatialIndex};
use kurbo::{Affine, Point};
use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet};
use thiserror::Error;

/// Default hit radius added around every shape's geometry.
pub const DEFAULT_HIT_TOLERANCE: f64 = 2.0;

/// Scene errors.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SceneError {
    #[error("Shape not found: {0}")]
    NotFound(ShapeId),
    #[error("Shape id already in use: {0}")]
    DuplicateId(ShapeId),
    #[error("Shape is not a group: {0}")]
    NotAGroup(ShapeId),
    #[error("Shape is not top-level: {0}")]
    NotTopLevel(ShapeId),
    #[error("Adding {child} to {group} would create a cycle")]
    Cycle { group: ShapeId, child: ShapeId },
    #[error("Cannot group an empty selection")]
    NothingToGroup,
    #[error("Transform of {0} cannot be expressed without skew")]
    Skewed(ShapeId),
    #[error(transparent)]
    Geometry(#[from] GeometryError),
}

/// Result type for scene operations.
pub type SceneResult<T> = Result<T, SceneError>;

/// Where a shape sits: its container and index within it.
///
/// `position` is clamped on restore, so `usize::MAX` means "on top".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placement {
    pub parent: Option<ShapeId>,
    pub position: usize,
}

impl Placement {
    /// Top of the root list.
    pub fn top() -> Self {
        Self {
            parent: None,
            position: usize::MAX,
        }
    }

    pub fn in_group(group: ShapeId) -> Self {
        Self {
            parent: Some(group),
            position: usize::MAX,
        }
    }
}

/// The shape arena and its derived structures.
#[derive(Debug)]
pub struct Scene {
    shapes: HashMap<ShapeId, Shape>,
    order: Vec<ShapeId>,
    index: RefCell<SpatialIndex<ShapeId>>,
    index_dirty: Cell<bool>,
    /// Local bounds of groups.
    bounds_cache: RefCell<HashMap<ShapeId, Aabb>>,
    hit_tolerance: f64,
}

impl Default for Scene {
    fn default() -> Self {
        Self::new()
    }
}

impl Scene {
    pub fn new() -> Self {
        Self::with_settings(DEFAULT_CAPACITY, DEFAULT_MAX_DEPTH, DEFAULT_HIT_TOLERANCE)
    }

    pub fn from_config(config: &EditorConfig) -> Self {
        Self::with_settings(
            config.index_capacity,
            config.index_max_depth,
            config.hit_tolerance,
        )
    }

    pub fn with_settings(index_capacity: usize, index_max_depth: usize, hit_tolerance: f64) -> Self {
        Self {
            shapes: HashMap::new(),
            order: Vec::new(),
            index: RefCell::new(SpatialIndex::new(Aabb::ZERO, index_capacity, index_max_depth)),
            index_dirty: Cell::new(true),
            bounds_cache: RefCell::new(HashMap::new()),
            hit_tolerance,
        }
    }

    pub fn hit_tolerance(&self) -> f64 {
        self.hit_tolerance
    }

    pub fn set_hit_tolerance(&mut self, tolerance: f64) {
        self.hit_tolerance = tolerance.max(0.0);
        self.mark_index_dirty();
    }

    /// Number of shapes, including group members.
    pub fn len(&self) -> usize {
        self.shapes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shapes.is_empty()
    }

    pub fn contains(&self, id: &ShapeId) -> bool {
        self.shapes.contains_key(id)
    }

    /// Top-level shape ids, back to front.
    pub fn roots(&self) -> &[ShapeId] {
        &self.order
    }

    /// Top-level shapes, back to front.
    pub fn shapes_ordered(&self) -> impl Iterator<Item = &Shape> {
        self.order.iter().filter_map(|id| self.shapes.get(id))
    }

    /// All shapes, in no particular order.
    pub fn iter(&self) -> impl Iterator<Item = &Shape> {
        self.shapes.values()
    }

    pub fn get(&self, id: &ShapeId) -> Option<&Shape> {
        self.shapes.get(id)
    }

    /// Mutable access to a shape.
    ///
    /// Cached group bounds above the shape are invalidated. The spatial index
    /// is not: call [`Scene::mark_index_dirty`] after changing geometry.
    pub fn get_mut(&mut self, id: &ShapeId) -> Option<&mut Shape> {
        if !self.shapes.contains_key(id) {
            return None;
        }
        self.invalidate_bounds(id);
        self.shapes.get_mut(id)
    }

    fn shape(&self, id: &ShapeId) -> SceneResult<&Shape> {
        self.shapes
            .get(id)
            .ok_or_else(|| SceneError::NotFound(id.clone()))
    }

    // --- membership -------------------------------------------------------

    /// Add a single shape on top of the root list.
    ///
    /// A group added this way starts empty; use [`Scene::insert_tree`] to add
    /// a group together with its members.
    pub fn add_shape(&mut self, shape: Shape) -> SceneResult<ShapeId> {
        self.restore_tree(ShapeSnapshot::leaf(shape), &Placement::top())
    }

    /// Add a shape subtree on top of the root list.
    pub fn insert_tree(&mut self, snapshot: ShapeSnapshot) -> SceneResult<ShapeId> {
        self.restore_tree(snapshot, &Placement::top())
    }

    /// Insert a subtree at a placement. Fails without side effects when any id
    /// in the subtree is already present or the target parent is not a group.
    pub fn restore_tree(
        &mut self,
        snapshot: ShapeSnapshot,
        placement: &Placement,
    ) -> SceneResult<ShapeId> {
        let mut seen = HashSet::new();
        for id in snapshot.all_ids() {
            if self.shapes.contains_key(&id) || !seen.insert(id.clone()) {
                return Err(SceneError::DuplicateId(id));
            }
        }
        if let Some(parent) = &placement.parent {
            if !self.shape(parent)?.is_group() {
                return Err(SceneError::NotAGroup(parent.clone()));
            }
        }

        let root_id = snapshot.id().clone();
        self.insert_subtree(snapshot, placement.parent.clone());
        match &placement.parent {
            None => {
                let pos = placement.position.min(self.order.len());
                self.order.insert(pos, root_id.clone());
                self.resort_roots();
            }
            Some(parent) => {
                if let Some(group) = self.shapes.get_mut(parent).and_then(Shape::as_group_mut) {
                    let pos = placement.position.min(group.children.len());
                    group.children.insert(pos, root_id.clone());
                }
                self.resort_children(parent);
                self.invalidate_bounds(parent);
            }
        }
        self.mark_index_dirty();
        Ok(root_id)
    }

    fn insert_subtree(&mut self, snapshot: ShapeSnapshot, parent: Option<ShapeId>) {
        let ShapeSnapshot { mut shape, children } = snapshot;
        shape.parent = parent;
        let id = shape.id.clone();
        let is_group = match &mut shape.kind {
            ShapeKind::Group(group) => {
                group.children = children.iter().map(|c| c.id().clone()).collect();
                true
            }
            _ => false,
        };
        self.shapes.insert(id.clone(), shape);
        if is_group {
            for child in children {
                self.insert_subtree(child, Some(id.clone()));
            }
            self.resort_children(&id);
        }
    }

    /// Remove a shape and its whole subtree, detaching it from its parent.
    pub fn remove_shape(&mut self, id: &ShapeId) -> SceneResult<ShapeSnapshot> {
        self.take_tree(id).map(|(snapshot, _)| snapshot)
    }

    /// Remove a subtree and report where it was, so it can be restored.
    pub fn take_tree(&mut self, id: &ShapeId) -> SceneResult<(ShapeSnapshot, Placement)> {
        let parent = self.shape(id)?.parent.clone();
        let position = match &parent {
            None => {
                let pos = self.order.iter().position(|x| x == id);
                if let Some(pos) = pos {
                    self.order.remove(pos);
                }
                pos.unwrap_or(self.order.len())
            }
            Some(parent_id) => {
                self.invalidate_bounds(parent_id);
                self.shapes
                    .get_mut(parent_id)
                    .and_then(Shape::as_group_mut)
                    .and_then(|group| group.remove(id))
                    .unwrap_or(0)
            }
        };
        let snapshot = self.extract_subtree(id)?;
        self.mark_index_dirty();
        Ok((snapshot, Placement { parent, position }))
    }

    fn extract_subtree(&mut self, id: &ShapeId) -> SceneResult<ShapeSnapshot> {
        let mut shape = self
            .shapes
            .remove(id)
            .ok_or_else(|| SceneError::NotFound(id.clone()))?;
        self.bounds_cache.borrow_mut().remove(id);
        shape.parent = None;
        let child_ids = shape.as_group().map(|g| g.children.clone()).unwrap_or_default();
        let mut children = Vec::with_capacity(child_ids.len());
        for child in &child_ids {
            children.push(self.extract_subtree(child)?);
        }
        Ok(ShapeSnapshot { shape, children })
    }

    /// Clone a shape and its subtree.
    pub fn snapshot_tree(&self, id: &ShapeId) -> SceneResult<ShapeSnapshot> {
        let mut shape = self.shape(id)?.clone();
        shape.parent = None;
        let children = match shape.as_group() {
            Some(group) => group
                .children()
                .iter()
                .map(|child| self.snapshot_tree(child))
                .collect::<SceneResult<Vec<_>>>()?,
            None => Vec::new(),
        };
        Ok(ShapeSnapshot { shape, children })
    }

    /// Every top-level subtree, back to front.
    pub fn snapshot_all(&self) -> Vec<ShapeSnapshot> {
        self.order
            .iter()
            .filter_map(|id| self.snapshot_tree(id).ok())
            .collect()
    }

    /// Where a shape currently sits.
    pub fn placement_of(&self, id: &ShapeId) -> SceneResult<Placement> {
        let parent = self.shape(id)?.parent.clone();
        let position = match &parent {
            None => self.order.iter().position(|x| x == id),
            Some(parent_id) => self
                .shape(parent_id)?
                .as_group()
                .and_then(|g| g.children().iter().position(|x| x == id)),
        }
        .unwrap_or(0);
        Ok(Placement { parent, position })
    }

    /// Swap an existing subtree for a new version with the same root id,
    /// keeping its placement. Returns the previous version. On failure the
    /// scene is left unchanged.
    pub fn replace_tree(&mut self, snapshot: ShapeSnapshot) -> SceneResult<ShapeSnapshot> {
        let id = snapshot.id().clone();
        let (old, placement) = self.take_tree(&id)?;
        if let Err(err) = self.restore_tree(snapshot, &placement) {
            self.restore_tree(old, &placement)?;
            return Err(err);
        }
        Ok(old)
    }

    /// Remove every shape.
    pub fn clear(&mut self) {
        self.shapes.clear();
        self.order.clear();
        self.bounds_cache.borrow_mut().clear();
        self.mark_index_dirty();
    }

    // --- hierarchy ----------------------------------------------------------

    /// Ids from the top-level ancestor down to the direct parent.
    pub fn ancestors(&self, id: &ShapeId) -> SceneResult<Vec<ShapeId>> {
        let mut chain = Vec::new();
        let mut current = self.shape(id)?.parent.clone();
        while let Some(parent) = current {
            if chain.contains(&parent) || chain.len() > self.shapes.len() {
                break;
            }
            current = self.shape(&parent)?.parent.clone();
            chain.push(parent);
        }
        chain.reverse();
        Ok(chain)
    }

    /// Move `child` (with its subtree) into `group`, on top of its members.
    /// The child's local transform is kept as-is, now relative to the group.
    pub fn add_child(&mut self, group: &ShapeId, child: &ShapeId) -> SceneResult<()> {
        if group == child {
            return Err(SceneError::Cycle {
                group: group.clone(),
                child: child.clone(),
            });
        }
        if !self.shape(group)?.is_group() {
            return Err(SceneError::NotAGroup(group.clone()));
        }
        self.shape(child)?;
        if self.ancestors(group)?.contains(child) {
            return Err(SceneError::Cycle {
                group: group.clone(),
                child: child.clone(),
            });
        }
        let (snapshot, _) = self.take_tree(child)?;
        self.restore_tree(snapshot, &Placement::in_group(group.clone()))?;
        Ok(())
    }

    /// Detach `child` from `group` and put it on top of the root list.
    /// Returns its former position within the group.
    pub fn detach_child(&mut self, group: &ShapeId, child: &ShapeId) -> SceneResult<usize> {
        if self.shape(child)?.parent.as_ref() != Some(group) {
            return Err(SceneError::NotFound(child.clone()));
        }
        let (snapshot, placement) = self.take_tree(child)?;
        self.restore_tree(snapshot, &Placement::top())?;
        Ok(placement.position)
    }

    /// Composition of every ancestor's local transform with the shape's own.
    pub fn world_transform(&self, id: &ShapeId) -> SceneResult<Affine> {
        let mut transform = Affine::IDENTITY;
        for ancestor in self.ancestors(id)? {
            transform = compose(transform, self.shape(&ancestor)?.local_affine());
        }
        Ok(compose(transform, self.shape(id)?.local_affine()))
    }

    fn parent_world_transform(&self, id: &ShapeId) -> SceneResult<Affine> {
        match &self.shape(id)?.parent {
            Some(parent) => self.world_transform(parent),
            None => Ok(Affine::IDENTITY),
        }
    }

    fn invalidate_bounds(&self, id: &ShapeId) {
        let mut cache = self.bounds_cache.borrow_mut();
        cache.remove(id);
        let mut current = self.shapes.get(id).and_then(|s| s.parent.clone());
        let mut steps = 0;
        while let Some(parent) = current {
            cache.remove(&parent);
            steps += 1;
            if steps > self.shapes.len() {
                break;
            }
            current = self.shapes.get(&parent).and_then(|s| s.parent.clone());
        }
    }

    // --- bounds -------------------------------------------------------------

    /// Local-space bounding box. For groups, the union of the children's
    /// transformed boxes (cached until a member changes).
    pub fn local_bounds(&self, id: &ShapeId) -> SceneResult<Aabb> {
        let shape = self.shape(id)?;
        let Some(group) = shape.as_group() else {
            return Ok(shape.geometry().map(|g| g.bounds()).unwrap_or(Aabb::ZERO));
        };
        let cached = self.bounds_cache.borrow().get(id).copied();
        if let Some(bounds) = cached {
            return Ok(bounds);
        }
        let mut acc: Option<Aabb> = None;
        for child_id in group.children() {
            let child = self.shape(child_id)?;
            let bounds = self.local_bounds(child_id)?.transform(child.local_affine());
            acc = Some(acc.map_or(bounds, |a| a.union(&bounds)));
        }
        let bounds = acc.unwrap_or(Aabb::ZERO);
        self.bounds_cache.borrow_mut().insert(id.clone(), bounds);
        Ok(bounds)
    }

    /// World-space bounding box: the four local corners transformed.
    pub fn world_bounds(&self, id: &ShapeId) -> SceneResult<Aabb> {
        Ok(self.local_bounds(id)?.transform(self.world_transform(id)?))
    }

    /// Local box enclosing every point that can hit the shape.
    fn hit_bounds(&self, id: &ShapeId) -> SceneResult<Aabb> {
        let shape = self.shape(id)?;
        match &shape.kind {
            ShapeKind::Group(group) => {
                let mut acc: Option<Aabb> = None;
                for child_id in group.children() {
                    let child = self.shape(child_id)?;
                    let bounds = self.hit_bounds(child_id)?.transform(child.local_affine());
                    acc = Some(acc.map_or(bounds, |a| a.union(&bounds)));
                }
                Ok(acc.unwrap_or(Aabb::ZERO))
            }
            _ => {
                let reach = self.hit_tolerance + shape.style.half_stroke();
                let bounds = shape.geometry().map(|g| g.bounds()).unwrap_or(Aabb::ZERO);
                Ok(bounds.inflate(reach, reach))
            }
        }
    }

    /// Union of every top-level shape's world bounds.
    pub fn bounds(&self) -> Option<Aabb> {
        self.order
            .iter()
            .filter_map(|id| self.world_bounds(id).ok())
            .reduce(|a, b| a.union(&b))
    }

    // --- spatial index ------------------------------------------------------

    pub fn mark_index_dirty(&self) {
        self.index_dirty.set(true);
    }

    pub fn is_index_dirty(&self) -> bool {
        self.index_dirty.get()
    }

    /// Rebuild the index from current geometry.
    pub fn rebuild_index(&self) {
        let entries: Vec<(ShapeId, Aabb)> = self
            .order
            .iter()
            .filter_map(|id| {
                let shape = self.shapes.get(id)?;
                let bounds = self.hit_bounds(id).ok()?.transform(shape.local_affine());
                Some((id.clone(), bounds))
            })
            .collect();
        let region = entries
            .iter()
            .map(|(_, b)| *b)
            .reduce(|a, b| a.union(&b))
            .unwrap_or(Aabb::ZERO);

        let mut index = self.index.borrow_mut();
        index.reset(region.inflate(1.0, 1.0));
        for (id, bounds) in entries {
            index.insert(id, bounds);
        }
        self.index_dirty.set(false);
        log::debug!("Rebuilt spatial index with {} shapes", index.len());
    }

    fn ensure_index(&self) {
        if self.index_dirty.get() {
            self.rebuild_index();
        }
    }

    fn paint_rank(&self) -> HashMap<&ShapeId, usize> {
        self.order.iter().enumerate().map(|(i, id)| (id, i)).collect()
    }

    fn sort_back_to_front(&self, ids: &mut [ShapeId]) {
        let rank = self.paint_rank();
        ids.sort_by_key(|id| rank.get(id).copied().unwrap_or(usize::MAX));
    }

    /// Index candidates at a world point, back to front. A superset of the
    /// shapes that actually hit, as of the last rebuild.
    pub fn query_point(&self, point: Point) -> Vec<ShapeId> {
        self.ensure_index();
        let mut ids = self.index.borrow().query_point(point);
        self.sort_back_to_front(&mut ids);
        ids
    }

    /// Index candidates touching a world region, back to front.
    pub fn query_region(&self, region: &Aabb) -> Vec<ShapeId> {
        self.ensure_index();
        let mut ids = self.index.borrow().query_region(region);
        self.sort_back_to_front(&mut ids);
        ids
    }

    // --- hit testing --------------------------------------------------------

    /// Exact hit test of one shape against a world point. Groups hit when any
    /// member hits. Invisible shapes never hit.
    pub fn hit_test(&self, id: &ShapeId, world_point: Point) -> SceneResult<bool> {
        Ok(self.hit_leaf(id, world_point)?.is_some())
    }

    /// The topmost leaf under the point within a shape's subtree.
    pub fn hit_leaf(&self, id: &ShapeId, world_point: Point) -> SceneResult<Option<ShapeId>> {
        let to_parent = try_invert(self.parent_world_transform(id)?)?;
        self.hit_in_parent_space(id, to_parent * world_point)
    }

    fn hit_in_parent_space(&self, id: &ShapeId, point: Point) -> SceneResult<Option<ShapeId>> {
        let shape = self.shape(id)?;
        if !shape.visible {
            return Ok(None);
        }
        let local = try_invert(shape.local_affine())? * point;
        match &shape.kind {
            ShapeKind::Group(group) => {
                // Nearest (last painted) member wins.
                for child in group.children().iter().rev() {
                    match self.hit_in_parent_space(child, local) {
                        Ok(Some(hit)) => return Ok(Some(hit)),
                        Ok(None) => {}
                        Err(SceneError::Geometry(err)) => {
                            log::debug!("Skipping {child} in hit test: {err}");
                        }
                        Err(err) => return Err(err),
                    }
                }
                Ok(None)
            }
            _ => Ok(shape
                .geometry()
                .filter(|g| g.hit_test(local, &shape.style, self.hit_tolerance))
                .map(|_| id.clone())),
        }
    }

    fn hit_or_skip(&self, id: &ShapeId, point: Point) -> bool {
        match self.hit_test(id, point) {
            Ok(hit) => hit,
            Err(err) => {
                log::debug!("Skipping {id} in hit test: {err}");
                false
            }
        }
    }

    /// Topmost top-level shape under a world point.
    pub fn shape_at(&self, point: Point) -> Option<ShapeId> {
        self.query_point(point)
            .into_iter()
            .rev()
            .find(|id| self.hit_or_skip(id, point))
    }

    /// Every top-level shape under a world point, front to back.
    pub fn shapes_at(&self, point: Point) -> Vec<ShapeId> {
        self.query_point(point)
            .into_iter()
            .rev()
            .filter(|id| self.hit_or_skip(id, point))
            .collect()
    }

    /// Topmost leaf under a world point, descending into groups.
    pub fn leaf_at(&self, point: Point) -> Option<ShapeId> {
        let root = self.shape_at(point)?;
        self.hit_leaf(&root, point).ok().flatten()
    }

    /// Top-level shapes whose world bounds intersect `rect`, back to front.
    pub fn shapes_in_rect(&self, rect: &Aabb) -> Vec<ShapeId> {
        self.query_region(rect)
            .into_iter()
            .filter(|id| {
                self.world_bounds(id)
                    .map(|b| b.intersects(rect))
                    .unwrap_or(false)
            })
            .collect()
    }

    // --- paint order --------------------------------------------------------

    fn resort_roots(&mut self) {
        let shapes = &self.shapes;
        self.order
            .sort_by_key(|id| shapes.get(id).map_or(0, |s| s.z_index));
    }

    fn resort_children(&mut self, group: &ShapeId) {
        let Some(mut children) = self
            .shapes
            .get_mut(group)
            .and_then(Shape::as_group_mut)
            .map(|g| std::mem::take(&mut g.children))
        else {
            return;
        };
        children.sort_by_key(|id| self.shapes.get(id).map_or(0, |s| s.z_index));
        if let Some(g) = self.shapes.get_mut(group).and_then(Shape::as_group_mut) {
            g.children = children;
        }
    }

    /// Change a shape's paint-order key and resort its container. Returns the
    /// previous key.
    pub fn set_z_index(&mut self, id: &ShapeId, z_index: i32) -> SceneResult<i32> {
        let shape = self
            .shapes
            .get_mut(id)
            .ok_or_else(|| SceneError::NotFound(id.clone()))?;
        let previous = std::mem::replace(&mut shape.z_index, z_index);
        match shape.parent.clone() {
            Some(parent) => self.resort_children(&parent),
            None => self.resort_roots(),
        }
        Ok(previous)
    }

    fn sibling_z_range(&self, id: &ShapeId) -> SceneResult<Option<(i32, i32)>> {
        let siblings: Vec<&ShapeId> = match &self.shape(id)?.parent {
            None => self.order.iter().collect(),
            Some(parent) => self
                .shape(parent)?
                .as_group()
                .map(|g| g.children().iter().collect())
                .unwrap_or_default(),
        };
        Ok(siblings
            .into_iter()
            .filter(|s| *s != id)
            .filter_map(|s| self.shapes.get(s).map(|s| s.z_index))
            .fold(None, |acc, z| match acc {
                None => Some((z, z)),
                Some((lo, hi)) => Some((lo.min(z), hi.max(z))),
            }))
    }

    /// Key that puts the shape above all its siblings.
    pub fn front_z_index(&self, id: &ShapeId) -> SceneResult<i32> {
        let current = self.shape(id)?.z_index;
        Ok(match self.sibling_z_range(id)? {
            Some((_, hi)) if hi >= current => hi.saturating_add(1),
            _ => current,
        })
    }

    /// Key that puts the shape below all its siblings.
    pub fn back_z_index(&self, id: &ShapeId) -> SceneResult<i32> {
        let current = self.shape(id)?.z_index;
        Ok(match self.sibling_z_range(id)? {
            Some((lo, _)) if lo <= current => lo.saturating_sub(1),
            _ => current,
        })
    }

    pub fn bring_to_front(&mut self, id: &ShapeId) -> SceneResult<i32> {
        let z = self.front_z_index(id)?;
        self.set_z_index(id, z)
    }

    pub fn send_to_back(&mut self, id: &ShapeId) -> SceneResult<i32> {
        let z = self.back_z_index(id)?;
        self.set_z_index(id, z)
    }

    // --- grouping -----------------------------------------------------------

    /// Wrap top-level shapes in a new group with an identity transform, so
    /// members keep their world positions. The group takes the paint slot of
    /// the topmost member.
    pub fn group_shapes(&mut self, ids: &[ShapeId], group_id: ShapeId) -> SceneResult<ShapeId> {
        if self.shapes.contains_key(&group_id) {
            return Err(SceneError::DuplicateId(group_id));
        }
        let mut members: Vec<ShapeId> = Vec::new();
        for id in ids {
            if self.shape(id)?.parent.is_some() {
                return Err(SceneError::NotTopLevel(id.clone()));
            }
            if !members.contains(id) {
                members.push(id.clone());
            }
        }
        if members.is_empty() {
            return Err(SceneError::NothingToGroup);
        }
        self.sort_back_to_front(&mut members);

        let top = members.last().cloned().ok_or(SceneError::NothingToGroup)?;
        let top_pos = self.order.iter().position(|x| *x == top).unwrap_or(self.order.len());
        let z_index = self.shape(&top)?.z_index;
        let group = Shape::with_id(group_id.clone(), ShapeKind::Group(Group::default()))
            .with_z_index(z_index);
        self.add_shape(group)?;
        for member in &members {
            self.add_child(&group_id, member)?;
        }

        // Members were all below or at `top_pos`.
        self.order.retain(|x| *x != group_id);
        let pos = (top_pos + 1).saturating_sub(members.len()).min(self.order.len());
        self.order.insert(pos, group_id.clone());
        self.resort_roots();
        Ok(group_id)
    }

    /// Dissolve a top-level group. Members move to the root list at the
    /// group's slot with the group transform folded into theirs, so they keep
    /// their world positions. Fails, leaving the scene unchanged, when a
    /// folded transform would need skew.
    pub fn ungroup(&mut self, group_id: &ShapeId) -> SceneResult<Vec<ShapeId>> {
        let group_shape = self.shape(group_id)?;
        if group_shape.parent.is_some() {
            return Err(SceneError::NotTopLevel(group_id.clone()));
        }
        let group = group_shape
            .as_group()
            .ok_or_else(|| SceneError::NotAGroup(group_id.clone()))?;
        let group_affine = group_shape.local_affine();
        let z_index = group_shape.z_index;

        let mut folded = Vec::with_capacity(group.len());
        for child_id in group.children() {
            let child = self.shape(child_id)?;
            let transform = LocalTransform::from_affine(compose(group_affine, child.local_affine()))
                .ok_or_else(|| SceneError::Skewed(child_id.clone()))?;
            folded.push(transform);
        }

        let (snapshot, placement) = self.take_tree(group_id)?;
        let mut ids = Vec::with_capacity(snapshot.children.len());
        for (i, (mut child, transform)) in snapshot.children.into_iter().zip(folded).enumerate() {
            child.shape.transform = transform;
            child.shape.z_index = z_index;
            let slot = Placement {
                parent: None,
                position: placement.position + i,
            };
            ids.push(self.restore_tree(child, &slot)?);
        }
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::affine_approx_eq;
    use crate::shapes::SerializableColor;
    use std::f64::consts::FRAC_PI_2;

    fn filled_rect(x: f64, y: f64, w: f64, h: f64) -> Shape {
        Shape::rect(x, y, w, h).filled(SerializableColor::white())
    }

    fn group_shape(id: &str) -> Shape {
        Shape::with_id(id.into(), ShapeKind::Group(Group::default()))
    }

    #[test]
    fn test_add_and_remove() {
        let mut scene = Scene::new();
        let id = scene.add_shape(filled_rect(0.0, 0.0, 10.0, 10.0)).unwrap();
        assert_eq!(scene.len(), 1);
        assert!(scene.get(&id).is_some());

        let removed = scene.remove_shape(&id).unwrap();
        assert_eq!(removed.id(), &id);
        assert!(scene.is_empty());
        assert!(scene.roots().is_empty());
        assert_eq!(
            scene.remove_shape(&id),
            Err(SceneError::NotFound(id.clone()))
        );
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let mut scene = Scene::new();
        let shape = filled_rect(0.0, 0.0, 10.0, 10.0);
        scene.add_shape(shape.clone()).unwrap();
        assert!(matches!(
            scene.add_shape(shape),
            Err(SceneError::DuplicateId(_))
        ));
        assert_eq!(scene.len(), 1);
    }

    #[test]
    fn test_paint_order_by_z_then_insertion() {
        let mut scene = Scene::new();
        let a = scene.add_shape(filled_rect(0.0, 0.0, 1.0, 1.0)).unwrap();
        let b = scene.add_shape(filled_rect(0.0, 0.0, 1.0, 1.0).with_z_index(-1)).unwrap();
        let c = scene.add_shape(filled_rect(0.0, 0.0, 1.0, 1.0)).unwrap();
        assert_eq!(scene.roots(), &[b.clone(), a.clone(), c.clone()]);

        scene.set_z_index(&b, 5).unwrap();
        assert_eq!(scene.roots(), &[a.clone(), c.clone(), b.clone()]);

        scene.send_to_back(&b).unwrap();
        assert_eq!(scene.roots()[0], b);
        scene.bring_to_front(&a).unwrap();
        assert_eq!(scene.roots().last(), Some(&a));
    }

    #[test]
    fn test_world_transform_composition() {
        let mut scene = Scene::new();
        let mut outer = group_shape("outer");
        outer.transform = LocalTransform {
            x: 10.0,
            y: 0.0,
            rotation: FRAC_PI_2,
            ..LocalTransform::default()
        };
        let mut inner = group_shape("inner");
        inner.transform = LocalTransform {
            x: 3.0,
            y: 4.0,
            scale_x: 2.0,
            scale_y: 0.5,
            ..LocalTransform::default()
        };
        let leaf = filled_rect(1.0, 1.0, 5.0, 5.0);
        let leaf_id = leaf.id().clone();

        let a1 = scene.add_shape(outer.clone()).unwrap();
        let a2 = scene.add_shape(inner.clone()).unwrap();
        scene.add_shape(leaf.clone()).unwrap();
        scene.add_child(&a2, &leaf_id).unwrap();
        scene.add_child(&a1, &a2).unwrap();

        assert_eq!(scene.ancestors(&leaf_id).unwrap(), vec![a1.clone(), a2.clone()]);
        let expected = compose(
            compose(outer.local_affine(), inner.local_affine()),
            leaf.local_affine(),
        );
        let world = scene.world_transform(&leaf_id).unwrap();
        assert!(affine_approx_eq(world, expected, 1e-9));
        assert!(affine_approx_eq(
            world,
            compose(scene.world_transform(&a2).unwrap(), leaf.local_affine()),
            1e-9
        ));
    }

    #[test]
    fn test_cycle_rejected() {
        let mut scene = Scene::new();
        let outer = scene.add_shape(group_shape("outer")).unwrap();
        let inner = scene.add_shape(group_shape("inner")).unwrap();
        scene.add_child(&outer, &inner).unwrap();

        assert!(matches!(
            scene.add_child(&inner, &outer),
            Err(SceneError::Cycle { .. })
        ));
        assert!(matches!(
            scene.add_child(&outer, &outer),
            Err(SceneError::Cycle { .. })
        ));
        let rect = scene.add_shape(filled_rect(0.0, 0.0, 1.0, 1.0)).unwrap();
        assert!(matches!(
            scene.add_child(&rect, &outer),
            Err(SceneError::NotAGroup(_))
        ));
    }

    #[test]
    fn test_detach_clears_parent() {
        let mut scene = Scene::new();
        let group = scene.add_shape(group_shape("g")).unwrap();
        let a = scene.add_shape(filled_rect(0.0, 0.0, 1.0, 1.0)).unwrap();
        let b = scene.add_shape(filled_rect(0.0, 0.0, 1.0, 1.0)).unwrap();
        scene.add_child(&group, &a).unwrap();
        scene.add_child(&group, &b).unwrap();
        assert_eq!(scene.roots(), &[group.clone()]);

        assert_eq!(scene.detach_child(&group, &a).unwrap(), 0);
        assert!(scene.get(&a).unwrap().parent().is_none());
        assert_eq!(scene.get(&group).unwrap().as_group().unwrap().children(), &[b]);
        assert!(scene.roots().contains(&a));
    }

    #[test]
    fn test_group_bounds_cache_invalidation() {
        let mut scene = Scene::new();
        let group = scene.add_shape(group_shape("g")).unwrap();
        let a = scene.add_shape(filled_rect(0.0, 0.0, 10.0, 10.0)).unwrap();
        let b = scene.add_shape(filled_rect(20.0, 20.0, 10.0, 10.0)).unwrap();
        scene.add_child(&group, &a).unwrap();
        scene.add_child(&group, &b).unwrap();
        assert_eq!(
            scene.local_bounds(&group).unwrap(),
            Aabb::new(0.0, 0.0, 30.0, 30.0)
        );

        scene.get_mut(&b).unwrap().transform.x = 90.0;
        assert_eq!(
            scene.local_bounds(&group).unwrap(),
            Aabb::new(0.0, 0.0, 100.0, 30.0)
        );

        scene.remove_shape(&b).unwrap();
        assert_eq!(
            scene.local_bounds(&group).unwrap(),
            Aabb::new(0.0, 0.0, 10.0, 10.0)
        );
    }

    #[test]
    fn test_world_bounds_rotated() {
        let mut scene = Scene::new();
        let mut rect = filled_rect(0.0, 0.0, 10.0, 20.0);
        rect.transform.rotation = FRAC_PI_2;
        let id = scene.add_shape(rect).unwrap();
        let bounds = scene.world_bounds(&id).unwrap();
        assert!((bounds.min_x + 20.0).abs() < 1e-9);
        assert!((bounds.max_x - 0.0).abs() < 1e-9);
        assert!((bounds.max_y - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_topmost_shape_wins() {
        let mut scene = Scene::new();
        let bottom = scene.add_shape(filled_rect(0.0, 0.0, 100.0, 100.0)).unwrap();
        let top = scene.add_shape(filled_rect(50.0, 50.0, 100.0, 100.0)).unwrap();

        assert_eq!(scene.shape_at(Point::new(75.0, 75.0)), Some(top.clone()));
        assert_eq!(scene.shape_at(Point::new(25.0, 25.0)), Some(bottom.clone()));
        assert_eq!(
            scene.shapes_at(Point::new(75.0, 75.0)),
            vec![top.clone(), bottom.clone()]
        );
        assert_eq!(scene.shape_at(Point::new(500.0, 500.0)), None);

        scene.set_z_index(&bottom, 10).unwrap();
        assert_eq!(scene.shape_at(Point::new(75.0, 75.0)), Some(bottom));
    }

    #[test]
    fn test_invisible_shapes_do_not_hit() {
        let mut scene = Scene::new();
        let mut shape = filled_rect(0.0, 0.0, 10.0, 10.0);
        shape.visible = false;
        scene.add_shape(shape).unwrap();
        assert_eq!(scene.shape_at(Point::new(5.0, 5.0)), None);
    }

    #[test]
    fn test_hit_in_group_descends() {
        let mut scene = Scene::new();
        let mut group = group_shape("g");
        group.transform = LocalTransform::at(100.0, 0.0);
        let group = scene.add_shape(group).unwrap();
        let a = scene.add_shape(filled_rect(0.0, 0.0, 10.0, 10.0)).unwrap();
        let b = scene.add_shape(filled_rect(5.0, 0.0, 10.0, 10.0)).unwrap();
        scene.add_child(&group, &a).unwrap();
        scene.add_child(&group, &b).unwrap();

        let point = Point::new(107.0, 5.0);
        assert_eq!(scene.shape_at(point), Some(group.clone()));
        assert_eq!(scene.leaf_at(point), Some(b));
        assert_eq!(scene.leaf_at(Point::new(101.0, 5.0)), Some(a));
        // Untransformed position no longer hits.
        assert_eq!(scene.shape_at(Point::new(7.0, 5.0)), None);
    }

    #[test]
    fn test_singular_shape_is_skipped() {
        let mut scene = Scene::new();
        let below = scene.add_shape(filled_rect(0.0, 0.0, 10.0, 10.0)).unwrap();
        let mut flat = filled_rect(0.0, 0.0, 10.0, 10.0);
        flat.transform.scale_x = 0.0;
        let flat = scene.add_shape(flat).unwrap();

        assert!(matches!(
            scene.hit_test(&flat, Point::new(0.0, 5.0)),
            Err(SceneError::Geometry(GeometryError::SingularMatrix { .. }))
        ));
        assert_eq!(scene.shape_at(Point::new(0.0, 5.0)), Some(below));
    }

    #[test]
    fn test_index_is_stale_after_direct_mutation() {
        let mut scene = Scene::new();
        let id = scene.add_shape(filled_rect(0.0, 0.0, 10.0, 10.0)).unwrap();
        assert_eq!(scene.shape_at(Point::new(5.0, 5.0)), Some(id.clone()));
        assert!(!scene.is_index_dirty());

        scene.get_mut(&id).unwrap().transform.x = 100.0;
        assert!(!scene.is_index_dirty());
        // Old candidate set: the moved shape is not found at its new place.
        assert!(scene.query_point(Point::new(105.0, 5.0)).is_empty());
        assert_eq!(scene.shape_at(Point::new(105.0, 5.0)), None);
        // The exact test still uses current geometry.
        assert_eq!(scene.shape_at(Point::new(5.0, 5.0)), None);

        scene.mark_index_dirty();
        assert_eq!(scene.shape_at(Point::new(105.0, 5.0)), Some(id));
    }

    #[test]
    fn test_region_query_matches_brute_force() {
        let mut scene = Scene::new();
        for i in 0..60 {
            let x = (i % 10) as f64 * 37.0;
            let y = (i / 10) as f64 * 41.0;
            scene.add_shape(filled_rect(x, y, 20.0, 15.0)).unwrap();
        }
        let region = Aabb::new(50.0, 40.0, 200.0, 130.0);
        let mut found = scene.shapes_in_rect(&region);
        found.sort();
        let mut expected: Vec<ShapeId> = scene
            .roots()
            .iter()
            .filter(|id| scene.world_bounds(id).unwrap().intersects(&region))
            .cloned()
            .collect();
        expected.sort();
        assert_eq!(found, expected);
        assert!(!found.is_empty());
    }

    #[test]
    fn test_take_and_restore_tree() {
        let mut scene = Scene::new();
        let group = scene.add_shape(group_shape("g")).unwrap();
        let a = scene.add_shape(filled_rect(0.0, 0.0, 1.0, 1.0)).unwrap();
        let b = scene.add_shape(filled_rect(2.0, 0.0, 1.0, 1.0)).unwrap();
        scene.add_child(&group, &a).unwrap();
        scene.add_child(&group, &b).unwrap();
        let before = scene.snapshot_tree(&group).unwrap();

        let (snapshot, placement) = scene.take_tree(&group).unwrap();
        assert_eq!(snapshot, before);
        assert!(scene.is_empty());

        scene.restore_tree(snapshot, &placement).unwrap();
        assert_eq!(scene.snapshot_tree(&group).unwrap(), before);
        assert_eq!(scene.get(&a).unwrap().parent(), Some(&group));

        // Restoring a child back into its slot.
        let (snapshot, placement) = scene.take_tree(&a).unwrap();
        assert_eq!(placement, Placement { parent: Some(group.clone()), position: 0 });
        scene.restore_tree(snapshot, &placement).unwrap();
        assert_eq!(scene.snapshot_tree(&group).unwrap(), before);
    }

    #[test]
    fn test_replace_tree_keeps_slot() {
        let mut scene = Scene::new();
        let a = scene.add_shape(filled_rect(0.0, 0.0, 1.0, 1.0)).unwrap();
        let b = scene.add_shape(filled_rect(0.0, 0.0, 1.0, 1.0)).unwrap();
        let mut updated = scene.snapshot_tree(&a).unwrap();
        updated.shape.transform.x = 42.0;

        let old = scene.replace_tree(updated).unwrap();
        assert_eq!(old.shape.transform.x, 0.0);
        assert_eq!(scene.get(&a).unwrap().transform.x, 42.0);
        assert_eq!(scene.roots(), &[a, b]);
    }

    #[test]
    fn test_group_and_ungroup_preserve_world_position() {
        let mut scene = Scene::new();
        let a = scene.add_shape(filled_rect(0.0, 0.0, 10.0, 10.0)).unwrap();
        let b = scene.add_shape(filled_rect(30.0, 0.0, 10.0, 10.0)).unwrap();
        let c = scene.add_shape(filled_rect(60.0, 0.0, 10.0, 10.0)).unwrap();

        let group = scene.group_shapes(&[b.clone(), a.clone()], "g".into()).unwrap();
        assert_eq!(scene.roots(), &[group.clone(), c.clone()]);
        assert_eq!(
            scene.get(&group).unwrap().as_group().unwrap().children(),
            &[a.clone(), b.clone()]
        );

        scene.get_mut(&group).unwrap().transform = LocalTransform {
            x: 5.0,
            y: 5.0,
            rotation: FRAC_PI_2,
            ..LocalTransform::default()
        };
        let world_before = scene.world_transform(&b).unwrap();

        let ids = scene.ungroup(&group).unwrap();
        assert_eq!(ids, vec![a.clone(), b.clone()]);
        assert!(scene.get(&group).is_none());
        assert!(affine_approx_eq(
            scene.world_transform(&b).unwrap(),
            world_before,
            1e-9
        ));
        assert_eq!(scene.roots(), &[a, b, c]);
    }

    #[test]
    fn test_group_rejects_nested_members() {
        let mut scene = Scene::new();
        let group = scene.add_shape(group_shape("g")).unwrap();
        let a = scene.add_shape(filled_rect(0.0, 0.0, 1.0, 1.0)).unwrap();
        scene.add_child(&group, &a).unwrap();
        assert_eq!(
            scene.group_shapes(&[a.clone()], "h".into()),
            Err(SceneError::NotTopLevel(a))
        );
        assert_eq!(
            scene.group_shapes(&[], "h".into()),
            Err(SceneError::NothingToGroup)
        );
    }

    #[test]
    fn test_scene_bounds() {
        let mut scene = Scene::new();
        assert_eq!(scene.bounds(), None);
        scene.add_shape(filled_rect(0.0, 0.0, 10.0, 10.0)).unwrap();
        scene.add_shape(Shape::circle(100.0, 100.0, 5.0)).unwrap();
        assert_eq!(scene.bounds(), Some(Aabb::new(0.0, 0.0, 105.0, 105.0)));
    }
}
