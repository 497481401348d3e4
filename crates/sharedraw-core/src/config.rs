//! Editor configuration.

use serde::{Deserialize, Serialize};

/// Tunables for an editing session. Every field has a default, so a partial
/// JSON object (or `{}`) deserializes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EditorConfig {
    /// Undo history depth.
    pub history_capacity: usize,
    /// Items per quadtree node before it splits.
    pub index_capacity: usize,
    /// Deepest quadtree level; nodes there accept overflow.
    pub index_max_depth: usize,
    /// Extra hit radius in local units, added to half the stroke width.
    pub hit_tolerance: f64,
    /// Shape count above which the render loop culls through the index.
    pub virtualize_threshold: usize,
    /// Outgoing messages held while the transport drains them.
    pub max_pending_outgoing: usize,
}

impl Default for EditorConfig {
    fn default() -> Self {
        Self {
            history_capacity: 100,
            index_capacity: crate::spatial::DEFAULT_CAPACITY,
            index_max_depth: crate::spatial::DEFAULT_MAX_DEPTH,
            hit_tolerance: 2.0,
            virtualize_threshold: 500,
            max_pending_outgoing: 1024,
        }
    }
}
