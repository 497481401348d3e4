//! Group shape for combining multiple shapes.

use super::ShapeId;

/// A group of shapes that can be manipulated as a single unit.
///
/// Children live in the scene arena; the group owns their lifecycle and keeps
/// them in paint order (first = bottom). Groups can contain other groups.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Group {
    pub(crate) children: Vec<ShapeId>,
}

impl Group {
    pub fn new(children: Vec<ShapeId>) -> Self {
        Self { children }
    }

    /// Get the children of this group, bottom to top.
    pub fn children(&self) -> &[ShapeId] {
        &self.children
    }

    pub fn contains(&self, id: &ShapeId) -> bool {
        self.children.contains(id)
    }

    pub fn len(&self) -> usize {
        self.children.len()
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    pub(crate) fn push(&mut self, id: ShapeId) {
        if !self.children.contains(&id) {
            self.children.push(id);
        }
    }

    /// Remove a child, returning its former position.
    pub(crate) fn remove(&mut self, id: &ShapeId) -> Option<usize> {
        let pos = self.children.iter().position(|c| c == id)?;
        self.children.remove(pos);
        Some(pos)
    }
}
