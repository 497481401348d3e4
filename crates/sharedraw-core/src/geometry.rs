//! Geometry kernel: affine helpers and axis-aligned bounding boxes.
//!
//! Vectors, points and matrices are kurbo's `Vec2`, `Point` and `Affine`.
//! `Affine` composes by right-multiplication (`a * b` applies `b` first),
//! which is the convention the scene model relies on. kurbo's own
//! `Affine::inverse` silently yields non-finite coefficients for a singular
//! matrix, so every inversion in this crate goes through [`try_invert`].

use kurbo::{Affine, Point, Rect, Vec2};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Geometry errors.
#[derive(Debug, Clone, Copy, PartialEq, Error)]
pub enum GeometryError {
    #[error("Singular matrix (determinant {det})")]
    SingularMatrix { det: f64 },
}

/// Result type for geometry operations.
pub type GeometryResult<T> = Result<T, GeometryError>;

/// Apply `m` to `p` (homogeneous 2x3 multiplication).
#[inline]
pub fn transform_point(m: Affine, p: Point) -> Point {
    m * p
}

/// Compose two transforms. The result applies `inner` first, then `outer`.
#[inline]
pub fn compose(outer: Affine, inner: Affine) -> Affine {
    outer * inner
}

/// Invert an affine transform, failing when `a*d - b*c == 0`.
pub fn try_invert(m: Affine) -> GeometryResult<Affine> {
    let det = m.determinant();
    if det == 0.0 || !det.is_finite() {
        return Err(GeometryError::SingularMatrix { det });
    }
    Ok(m.inverse())
}

/// Unit vector in the direction of `v`, or zero for a zero-length vector.
pub fn normalize(v: Vec2) -> Vec2 {
    let len = v.hypot();
    if len < f64::EPSILON {
        Vec2::ZERO
    } else {
        v / len
    }
}

/// Approximate equality of two transforms, coefficient by coefficient.
pub fn affine_approx_eq(a: Affine, b: Affine, tolerance: f64) -> bool {
    a.as_coeffs()
        .iter()
        .zip(b.as_coeffs().iter())
        .all(|(x, y)| (x - y).abs() <= tolerance)
}

/// Axis-aligned bounding box.
///
/// Boxes are stored exactly as constructed: a box may be degenerate
/// (zero width or height) or inverted (`min > max`). An inverted box
/// intersects nothing and contains nothing.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Aabb {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

impl Aabb {
    pub const ZERO: Aabb = Aabb {
        min_x: 0.0,
        min_y: 0.0,
        max_x: 0.0,
        max_y: 0.0,
    };

    pub fn new(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> Self {
        Self {
            min_x,
            min_y,
            max_x,
            max_y,
        }
    }

    /// Create from origin and size.
    pub fn from_origin_size(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self::new(x, y, x + width, y + height)
    }

    /// Box spanned by two opposite corners, in either order.
    pub fn from_corners(a: Point, b: Point) -> Self {
        Self::new(a.x.min(b.x), a.y.min(b.y), a.x.max(b.x), a.y.max(b.y))
    }

    /// Smallest box enclosing every point, or `None` for an empty iterator.
    pub fn from_points<I: IntoIterator<Item = Point>>(points: I) -> Option<Self> {
        let mut iter = points.into_iter();
        let first = iter.next()?;
        let mut bbox = Self::new(first.x, first.y, first.x, first.y);
        for p in iter {
            bbox.min_x = bbox.min_x.min(p.x);
            bbox.min_y = bbox.min_y.min(p.y);
            bbox.max_x = bbox.max_x.max(p.x);
            bbox.max_y = bbox.max_y.max(p.y);
        }
        Some(bbox)
    }

    pub fn width(&self) -> f64 {
        self.max_x - self.min_x
    }

    pub fn height(&self) -> f64 {
        self.max_y - self.min_y
    }

    pub fn center(&self) -> Point {
        Point::new(
            (self.min_x + self.max_x) / 2.0,
            (self.min_y + self.max_y) / 2.0,
        )
    }

    /// True when `min > max` on either axis.
    pub fn is_inverted(&self) -> bool {
        self.min_x > self.max_x || self.min_y > self.max_y
    }

    /// True when the box has zero area (but is not inverted).
    pub fn is_degenerate(&self) -> bool {
        !self.is_inverted() && (self.width() == 0.0 || self.height() == 0.0)
    }

    /// Closed-interval point containment.
    pub fn contains_point(&self, p: Point) -> bool {
        p.x >= self.min_x && p.x <= self.max_x && p.y >= self.min_y && p.y <= self.max_y
    }

    /// True when `other` lies entirely inside `self` (edges may touch).
    pub fn contains(&self, other: &Aabb) -> bool {
        !other.is_inverted()
            && other.min_x >= self.min_x
            && other.max_x <= self.max_x
            && other.min_y >= self.min_y
            && other.max_y <= self.max_y
    }

    /// Closed-interval overlap test: boxes sharing an edge intersect.
    pub fn intersects(&self, other: &Aabb) -> bool {
        !self.is_inverted()
            && !other.is_inverted()
            && self.min_x <= other.max_x
            && self.max_x >= other.min_x
            && self.min_y <= other.max_y
            && self.max_y >= other.min_y
    }

    pub fn union(&self, other: &Aabb) -> Aabb {
        Aabb::new(
            self.min_x.min(other.min_x),
            self.min_y.min(other.min_y),
            self.max_x.max(other.max_x),
            self.max_y.max(other.max_y),
        )
    }

    /// Grow (or shrink, for negative values) the box on every side.
    pub fn inflate(&self, dx: f64, dy: f64) -> Aabb {
        Aabb::new(
            self.min_x - dx,
            self.min_y - dy,
            self.max_x + dx,
            self.max_y + dy,
        )
    }

    pub fn corners(&self) -> [Point; 4] {
        [
            Point::new(self.min_x, self.min_y),
            Point::new(self.max_x, self.min_y),
            Point::new(self.max_x, self.max_y),
            Point::new(self.min_x, self.max_y),
        ]
    }

    /// Enclosing box of the four transformed corners.
    pub fn transform(&self, m: Affine) -> Aabb {
        let corners = self.corners().map(|c| m * c);
        // Four corners are always present.
        Aabb::from_points(corners).unwrap_or(*self)
    }

    /// Split into quadrants: NW, NE, SW, SE.
    pub fn quadrants(&self) -> [Aabb; 4] {
        let c = self.center();
        [
            Aabb::new(self.min_x, self.min_y, c.x, c.y),
            Aabb::new(c.x, self.min_y, self.max_x, c.y),
            Aabb::new(self.min_x, c.y, c.x, self.max_y),
            Aabb::new(c.x, c.y, self.max_x, self.max_y),
        ]
    }

    pub fn to_rect(&self) -> Rect {
        Rect::new(self.min_x, self.min_y, self.max_x, self.max_y)
    }
}

impl From<Rect> for Aabb {
    fn from(rect: Rect) -> Self {
        Aabb::new(rect.x0, rect.y0, rect.x1, rect.y1)
    }
}
