//! Quadtree over axis-aligned bounding boxes.
//!
//! A node holds up to `capacity` items. The first insertion past capacity
//! splits it once into four quadrants and pushes down every item that fits
//! entirely inside one of them; items that straddle a quadrant boundary stay
//! at the node. Nodes at `max_depth` accept overflow. Items whose box is not
//! contained by the root region stay at the root, so nothing is ever lost.
//!
//! The index knows nothing about shapes. It answers "which stored boxes
//! touch this point/region" and is only as fresh as its last rebuild.

use crate::geometry::Aabb;
use kurbo::Point;

pub const DEFAULT_CAPACITY: usize = 4;
pub const DEFAULT_MAX_DEPTH: usize = 8;

/// Statistics about the tree shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IndexStats {
    pub total_nodes: usize,
    pub total_items: usize,
    pub max_depth: usize,
}

#[derive(Debug, Clone)]
struct Node<T> {
    bounds: Aabb,
    depth: usize,
    items: Vec<(T, Aabb)>,
    children: Option<Box<[Node<T>; 4]>>,
}

impl<T: Clone> Node<T> {
    fn new(bounds: Aabb, depth: usize) -> Self {
        Self {
            bounds,
            depth,
            items: Vec::new(),
            children: None,
        }
    }

    fn insert(&mut self, item: T, bbox: Aabb, capacity: usize, max_depth: usize) {
        if self.children.is_none() {
            if self.items.len() < capacity || self.depth >= max_depth {
                self.items.push((item, bbox));
                return;
            }
            self.split(capacity, max_depth);
        }

        if let Some(children) = self.children.as_mut() {
            if let Some(child) = children.iter_mut().find(|c| c.bounds.contains(&bbox)) {
                child.insert(item, bbox, capacity, max_depth);
                return;
            }
        }
        self.items.push((item, bbox));
    }

    fn split(&mut self, capacity: usize, max_depth: usize) {
        let [nw, ne, sw, se] = self.bounds.quadrants();
        let depth = self.depth + 1;
        let mut children = Box::new([
            Node::new(nw, depth),
            Node::new(ne, depth),
            Node::new(sw, depth),
            Node::new(se, depth),
        ]);

        let mut kept = Vec::new();
        for (item, bbox) in self.items.drain(..) {
            match children.iter_mut().find(|c| c.bounds.contains(&bbox)) {
                Some(child) => child.insert(item, bbox, capacity, max_depth),
                None => kept.push((item, bbox)),
            }
        }
        self.items = kept;
        self.children = Some(children);
    }

    fn query(&self, region: &Aabb, out: &mut Vec<T>) {
        out.extend(
            self.items
                .iter()
                .filter(|(_, bbox)| bbox.intersects(region))
                .map(|(item, _)| item.clone()),
        );
        if let Some(children) = &self.children {
            for child in children.iter() {
                if child.bounds.intersects(region) {
                    child.query(region, out);
                }
            }
        }
    }

    fn collect_stats(&self, stats: &mut IndexStats) {
        stats.total_nodes += 1;
        stats.total_items += self.items.len();
        stats.max_depth = stats.max_depth.max(self.depth);
        if let Some(children) = &self.children {
            for child in children.iter() {
                child.collect_stats(stats);
            }
        }
    }
}

/// Region quadtree mapping bounding boxes to items of type `T`.
#[derive(Debug, Clone)]
pub struct SpatialIndex<T> {
    root: Node<T>,
    capacity: usize,
    max_depth: usize,
    len: usize,
}

impl<T: Clone> SpatialIndex<T> {
    /// Create an empty index covering `bounds`. A zero capacity is treated as one.
    pub fn new(bounds: Aabb, capacity: usize, max_depth: usize) -> Self {
        Self {
            root: Node::new(bounds, 0),
            capacity: capacity.max(1),
            max_depth,
            len: 0,
        }
    }

    pub fn with_defaults(bounds: Aabb) -> Self {
        Self::new(bounds, DEFAULT_CAPACITY, DEFAULT_MAX_DEPTH)
    }

    pub fn bounds(&self) -> Aabb {
        self.root.bounds
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Insert an item with its bounding box.
    pub fn insert(&mut self, item: T, bbox: Aabb) {
        self.len += 1;
        if !self.root.bounds.contains(&bbox) {
            // Outside the root region: parked at the root, always tested.
            self.root.items.push((item, bbox));
            return;
        }
        self.root.insert(item, bbox, self.capacity, self.max_depth);
    }

    /// Items whose box contains `point` (closed intervals).
    pub fn query_point(&self, point: Point) -> Vec<T> {
        self.query_region(&Aabb::new(point.x, point.y, point.x, point.y))
    }

    /// Items whose box intersects `region`.
    pub fn query_region(&self, region: &Aabb) -> Vec<T> {
        let mut out = Vec::new();
        if region.is_inverted() {
            return out;
        }
        // Root items are tested even when the region misses the root bounds.
        out.extend(
            self.root
                .items
                .iter()
                .filter(|(_, bbox)| bbox.intersects(region))
                .map(|(item, _)| item.clone()),
        );
        if let Some(children) = &self.root.children {
            for child in children.iter() {
                if child.bounds.intersects(region) {
                    child.query(region, &mut out);
                }
            }
        }
        out
    }

    /// Remove every item, keeping the root region and parameters.
    pub fn clear(&mut self) {
        self.root = Node::new(self.root.bounds, 0);
        self.len = 0;
    }

    /// Drop everything and adopt a new root region.
    pub fn reset(&mut self, bounds: Aabb) {
        self.root = Node::new(bounds, 0);
        self.len = 0;
    }

    pub fn stats(&self) -> IndexStats {
        let mut stats = IndexStats::default();
        self.root.collect_stats(&mut stats);
        stats
    }
}
