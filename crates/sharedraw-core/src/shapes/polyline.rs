//! Polyline (pen / brush stroke) shape.

use super::{ShapeGeometry, ShapeStyle, point_to_segment_dist};
use crate::geometry::Aabb;
use kurbo::{BezPath, Point};
use serde::{Deserialize, Serialize};

/// Curve fitting applied when turning the point list into a render path.
/// Hit testing always uses the raw segments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Smoothing {
    /// Straight segments between points.
    #[default]
    None,
    /// Chaikin corner cutting (two iterations).
    Chaikin,
    /// Catmull-Rom spline through every point.
    CatmullRom,
}

/// An ordered point sequence in local space.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Polyline {
    pub points: Vec<Point>,
    pub smoothing: Smoothing,
    /// Connect the last point back to the first.
    pub closed: bool,
}

impl Polyline {
    pub fn new(points: Vec<Point>) -> Self {
        Self {
            points,
            smoothing: Smoothing::None,
            closed: false,
        }
    }

    pub fn with_smoothing(mut self, smoothing: Smoothing) -> Self {
        self.smoothing = smoothing;
        self
    }

    /// Add a point to the path.
    pub fn add_point(&mut self, point: Point) {
        self.points.push(point);
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Simplify the path by removing redundant points.
    pub fn simplify(&mut self, tolerance: f64) {
        if self.points.len() < 3 {
            return;
        }
        // Ramer-Douglas-Peucker algorithm
        self.points = rdp_simplify(&self.points, tolerance);
    }

    /// Segments to hit-test against, including the closing segment.
    fn segments(&self) -> impl Iterator<Item = (Point, Point)> + '_ {
        let closing = if self.closed && self.points.len() > 2 {
            self.points.last().copied().zip(self.points.first().copied())
        } else {
            None
        };
        self.points
            .windows(2)
            .map(|w| (w[0], w[1]))
            .chain(closing)
    }
}

/// Ramer-Douglas-Peucker line simplification.
fn rdp_simplify(points: &[Point], tolerance: f64) -> Vec<Point> {
    if points.len() < 3 {
        return points.to_vec();
    }

    let first = points[0];
    let last = points[points.len() - 1];

    let mut max_dist = 0.0;
    let mut max_index = 0;
    for (i, point) in points.iter().enumerate().skip(1).take(points.len() - 2) {
        let dist = point_to_segment_dist(*point, first, last);
        if dist > max_dist {
            max_dist = dist;
            max_index = i;
        }
    }

    if max_dist > tolerance {
        let mut left = rdp_simplify(&points[..=max_index], tolerance);
        let right = rdp_simplify(&points[max_index..], tolerance);
        // Junction point appears in both halves
        left.pop();
        left.extend(right);
        left
    } else {
        vec![first, last]
    }
}

/// One Chaikin pass: replace every segment with its 1/4 and 3/4 points.
fn chaikin(points: &[Point], closed: bool) -> Vec<Point> {
    if points.len() < 3 {
        return points.to_vec();
    }
    let n = points.len();
    let segs = if closed { n } else { n - 1 };
    let mut out = Vec::with_capacity(segs * 2 + 2);
    if !closed {
        out.push(points[0]);
    }
    for i in 0..segs {
        let a = points[i];
        let b = points[(i + 1) % n];
        out.push(a.lerp(b, 0.25));
        out.push(a.lerp(b, 0.75));
    }
    if !closed {
        out.push(points[n - 1]);
    }
    out
}

fn catmull_rom_path(points: &[Point], closed: bool) -> BezPath {
    let mut path = BezPath::new();
    let n = points.len();
    path.move_to(points[0]);
    let segs = if closed { n } else { n - 1 };
    let at = |i: isize| -> Point {
        if closed {
            points[i.rem_euclid(n as isize) as usize]
        } else {
            points[i.clamp(0, n as isize - 1) as usize]
        }
    };
    for i in 0..segs as isize {
        let (p0, p1, p2, p3) = (at(i - 1), at(i), at(i + 1), at(i + 2));
        let c1 = p1 + (p2 - p0) / 6.0;
        let c2 = p2 - (p3 - p1) / 6.0;
        path.curve_to(c1, c2, p2);
    }
    if closed {
        path.close_path();
    }
    path
}

impl ShapeGeometry for Polyline {
    fn bounds(&self) -> Aabb {
        Aabb::from_points(self.points.iter().copied()).unwrap_or(Aabb::ZERO)
    }

    fn hit_test(&self, point: Point, style: &ShapeStyle, tolerance: f64) -> bool {
        let threshold = tolerance + style.half_stroke();
        match self.points.as_slice() {
            [] => false,
            [only] => point.distance(*only) <= threshold,
            _ => self
                .segments()
                .any(|(a, b)| point_to_segment_dist(point, a, b) <= threshold),
        }
    }

    fn to_path(&self) -> BezPath {
        if self.points.len() > 2 {
            match self.smoothing {
                Smoothing::CatmullRom => return catmull_rom_path(&self.points, self.closed),
                Smoothing::Chaikin => {
                    let smoothed = chaikin(&chaikin(&self.points, self.closed), self.closed);
                    return polyline_path(&smoothed, self.closed);
                }
                Smoothing::None => {}
            }
        }
        polyline_path(&self.points, self.closed)
    }
}

fn polyline_path(points: &[Point], closed: bool) -> BezPath {
    let mut path = BezPath::new();
    let Some((first, rest)) = points.split_first() else {
        return path;
    };
    path.move_to(*first);
    for point in rest {
        path.line_to(*point);
    }
    if closed {
        path.close_path();
    }
    path
}
