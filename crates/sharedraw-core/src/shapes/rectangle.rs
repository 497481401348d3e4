//! Rectangle shape.

use super::{ShapeGeometry, ShapeStyle};
use crate::geometry::Aabb;
use kurbo::{BezPath, Point, Rect, RoundedRect, Shape as KurboShape};

/// A rectangle with optional rounded corners, spanning `(0, 0)` to
/// `(width, height)` in local space.
#[derive(Debug, Clone, PartialEq)]
pub struct Rectangle {
    pub width: f64,
    pub height: f64,
    /// Corner radius (0 = sharp corners).
    pub corner_radius: f64,
}

impl Rectangle {
    pub fn new(width: f64, height: f64) -> Self {
        Self {
            width,
            height,
            corner_radius: 0.0,
        }
    }

    pub fn with_corner_radius(mut self, radius: f64) -> Self {
        self.corner_radius = radius;
        self
    }

    /// Get the rectangle as a kurbo Rect in local space.
    pub fn as_rect(&self) -> Rect {
        Rect::new(0.0, 0.0, self.width, self.height)
    }
}

impl ShapeGeometry for Rectangle {
    /// Negative sizes extend the box up or left of the origin.
    fn bounds(&self) -> Aabb {
        Aabb::from_corners(Point::ZERO, Point::new(self.width, self.height))
    }

    fn hit_test(&self, point: Point, style: &ShapeStyle, tolerance: f64) -> bool {
        let bounds = self.bounds();
        let reach = tolerance + style.half_stroke();
        if !bounds.inflate(reach, reach).contains_point(point) {
            return false;
        }
        if style.fill.is_some() {
            // Filled: hit anywhere inside
            return true;
        }
        // Outline only: hit on the border band
        let inner = bounds.inflate(-reach, -reach);
        inner.is_inverted() || !inner.contains_point(point)
    }

    fn to_path(&self) -> BezPath {
        let radius = self
            .corner_radius
            .min(self.width.abs() / 2.0)
            .min(self.height.abs() / 2.0);
        if radius > 0.0 {
            RoundedRect::from_rect(self.as_rect(), radius).to_path(0.1)
        } else {
            self.as_rect().to_path(0.1)
        }
    }
}
