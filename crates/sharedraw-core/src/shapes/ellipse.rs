//! Ellipse shape.

use super::{ShapeGeometry, ShapeStyle};
use crate::geometry::Aabb;
use kurbo::{BezPath, Circle, Point, Shape as KurboShape};

/// A circle of `radius` centred on the local origin. Non-uniform scale on the
/// owning shape's transform turns it into an ellipse.
#[derive(Debug, Clone, PartialEq)]
pub struct Ellipse {
    pub radius: f64,
}

impl Ellipse {
    pub fn new(radius: f64) -> Self {
        Self { radius }
    }
}

impl ShapeGeometry for Ellipse {
    fn bounds(&self) -> Aabb {
        let r = self.radius.abs();
        Aabb::new(-r, -r, r, r)
    }

    fn hit_test(&self, point: Point, style: &ShapeStyle, tolerance: f64) -> bool {
        let radius = self.radius.abs();
        let dist = point.to_vec2().hypot();
        let reach = tolerance + style.half_stroke();
        if dist > radius + reach {
            return false;
        }
        if style.fill.is_some() {
            return true;
        }
        // Outline only: reject if inside the inner circle
        dist >= radius - reach
    }

    fn to_path(&self) -> BezPath {
        Circle::new(Point::ZERO, self.radius.abs()).to_path(0.1)
    }
}
