//! Shape definitions for the canvas.
//!
//! A [`Shape`] carries the attributes every drawable shares (identity, local
//! transform, style, visibility, lock flag, paint order and an optional parent
//! back-reference) plus a closed [`ShapeKind`] union of variant geometry.
//! Leaf variants implement [`ShapeGeometry`] in their own local space; groups
//! only hold child ids, their geometry is resolved by the scene.

mod convert;
mod ellipse;
mod group;
mod polyline;
mod rectangle;
mod text;

pub use convert::{
    TYPE_CIRCLE, TYPE_GROUP, TYPE_PATH, TYPE_RECT, TYPE_TEXT, merge_fields, shape_from_json,
    shape_to_json,
};
pub use ellipse::Ellipse;
pub use group::Group;
pub use polyline::{Polyline, Smoothing};
pub use rectangle::Rectangle;
pub use text::Text;

use crate::geometry::Aabb;
use kurbo::{Affine, BezPath, Point, Vec2};
use peniko::Color;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Errors raised while building shapes from untrusted data.
#[derive(Debug, Error)]
pub enum ShapeError {
    #[error("Shape data must be a JSON object")]
    NotAnObject,
    #[error("Unknown shape type: {0}")]
    UnknownType(String),
    #[error("Missing required field: {0}")]
    MissingField(&'static str),
    #[error("Invalid value for field {field}: {reason}")]
    InvalidField { field: String, reason: String },
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Unique identifier for shapes, stable for the lifetime of a scene and
/// shared across every client of a room.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ShapeId(String);

impl ShapeId {
    /// Generate a fresh random identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ShapeId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ShapeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ShapeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ShapeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Serializable color representation (RGBA8), written as `#rrggbb[aa]` on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SerializableColor {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub a: u8,
}

impl SerializableColor {
    pub fn new(r: u8, g: u8, b: u8, a: u8) -> Self {
        Self { r, g, b, a }
    }

    pub fn black() -> Self {
        Self::new(0, 0, 0, 255)
    }

    pub fn white() -> Self {
        Self::new(255, 255, 255, 255)
    }

    pub fn transparent() -> Self {
        Self::new(0, 0, 0, 0)
    }

    /// Parse `#rgb`, `#rrggbb`, `#rrggbbaa` or `transparent`.
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("transparent") {
            return Some(Self::transparent());
        }
        let hex = s.strip_prefix('#')?;
        let channel = |i: usize| u8::from_str_radix(hex.get(i..i + 2)?, 16).ok();
        match hex.len() {
            3 => {
                let mut out = [0u8; 3];
                for (i, c) in hex.chars().enumerate() {
                    let v = c.to_digit(16)? as u8;
                    out[i] = v * 17;
                }
                Some(Self::new(out[0], out[1], out[2], 255))
            }
            6 => Some(Self::new(channel(0)?, channel(2)?, channel(4)?, 255)),
            8 => Some(Self::new(channel(0)?, channel(2)?, channel(4)?, channel(6)?)),
            _ => None,
        }
    }

    pub fn to_hex(&self) -> String {
        if self.a == 255 {
            format!("#{:02x}{:02x}{:02x}", self.r, self.g, self.b)
        } else {
            format!("#{:02x}{:02x}{:02x}{:02x}", self.r, self.g, self.b, self.a)
        }
    }
}

impl TryFrom<String> for SerializableColor {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value).ok_or_else(|| format!("invalid color: {value}"))
    }
}

impl From<SerializableColor> for String {
    fn from(color: SerializableColor) -> Self {
        color.to_hex()
    }
}

impl From<Color> for SerializableColor {
    fn from(color: Color) -> Self {
        let rgba = color.to_rgba8();
        Self {
            r: rgba.r,
            g: rgba.g,
            b: rgba.b,
            a: rgba.a,
        }
    }
}

impl From<SerializableColor> for Color {
    fn from(color: SerializableColor) -> Self {
        Color::from_rgba8(color.r, color.g, color.b, color.a)
    }
}

/// Stroke end cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LineCap {
    #[default]
    Butt,
    Round,
    Square,
}

/// Stroke corner join.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LineJoin {
    #[default]
    Miter,
    Round,
    Bevel,
}

/// Style properties for shapes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShapeStyle {
    /// Fill color (None = no fill).
    pub fill: Option<SerializableColor>,
    /// Stroke color.
    pub stroke: SerializableColor,
    /// Stroke width in local units.
    pub stroke_width: f64,
    /// Overall opacity (0.0 = fully transparent, 1.0 = fully opaque).
    pub opacity: f64,
    #[serde(default)]
    pub line_cap: LineCap,
    #[serde(default)]
    pub line_join: LineJoin,
    /// Dash pattern, empty for a solid stroke.
    #[serde(default)]
    pub dash: Vec<f64>,
}

impl ShapeStyle {
    /// Get the stroke color with opacity applied.
    pub fn stroke_with_opacity(&self) -> Color {
        with_opacity(self.stroke, self.opacity)
    }

    /// Get the fill color with opacity applied.
    pub fn fill_with_opacity(&self) -> Option<Color> {
        self.fill.map(|c| with_opacity(c, self.opacity))
    }

    /// Half the stroke width: how far a stroke paints outside the geometry.
    pub fn half_stroke(&self) -> f64 {
        self.stroke_width.max(0.0) / 2.0
    }
}

fn with_opacity(color: SerializableColor, opacity: f64) -> Color {
    let alpha = (color.a as f64 * opacity.clamp(0.0, 1.0)) as u8;
    Color::from_rgba8(color.r, color.g, color.b, alpha)
}

impl Default for ShapeStyle {
    fn default() -> Self {
        Self {
            fill: None,
            stroke: SerializableColor::black(),
            stroke_width: 2.0,
            opacity: 1.0,
            line_cap: LineCap::default(),
            line_join: LineJoin::default(),
            dash: Vec::new(),
        }
    }
}

/// Position, rotation and non-uniform scale of a shape relative to its parent.
///
/// The matrix form is `translate(x, y) * rotate(rotation) * scale(sx, sy)`,
/// so rotation and scale pivot around the shape's local origin.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalTransform {
    pub x: f64,
    pub y: f64,
    /// Rotation in radians.
    pub rotation: f64,
    pub scale_x: f64,
    pub scale_y: f64,
}

impl Default for LocalTransform {
    fn default() -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            rotation: 0.0,
            scale_x: 1.0,
            scale_y: 1.0,
        }
    }
}

impl LocalTransform {
    pub fn at(x: f64, y: f64) -> Self {
        Self {
            x,
            y,
            ..Self::default()
        }
    }

    pub fn to_affine(&self) -> Affine {
        Affine::translate((self.x, self.y))
            * Affine::rotate(self.rotation)
            * Affine::scale_non_uniform(self.scale_x, self.scale_y)
    }

    pub fn position(&self) -> Point {
        Point::new(self.x, self.y)
    }

    pub fn translate(&mut self, delta: Vec2) {
        self.x += delta.x;
        self.y += delta.y;
    }

    /// Decompose an affine matrix back into translate/rotate/scale form.
    /// Returns `None` for skewed or collapsed matrices, which this form
    /// cannot express.
    pub fn from_affine(m: Affine) -> Option<Self> {
        let [a, b, c, d, e, f] = m.as_coeffs();
        let scale_x = a.hypot(b);
        if scale_x < f64::EPSILON {
            return None;
        }
        let scale_y = (a * d - b * c) / scale_x;
        // Image of the x and y axes must stay perpendicular.
        let skew = a * c + b * d;
        if skew.abs() > 1e-9 * (scale_x * scale_y.abs()).max(1.0) {
            return None;
        }
        Some(Self {
            x: e,
            y: f,
            rotation: b.atan2(a),
            scale_x,
            scale_y,
        })
    }
}

/// Geometry of a leaf shape, expressed in its own local coordinate space.
pub trait ShapeGeometry {
    /// Local-space bounding box of the geometry itself (stroke excluded).
    fn bounds(&self) -> Aabb;

    /// Check if a local-space point hits this geometry.
    fn hit_test(&self, point: Point, style: &ShapeStyle, tolerance: f64) -> bool;

    /// Get the local-space path representation for rendering.
    fn to_path(&self) -> BezPath;
}

/// Closed set of shape variants.
#[derive(Debug, Clone, PartialEq)]
pub enum ShapeKind {
    Rect(Rectangle),
    Circle(Ellipse),
    Path(Polyline),
    Text(Text),
    Group(Group),
}

/// A drawable entity in the scene arena.
#[derive(Debug, Clone, PartialEq)]
pub struct Shape {
    pub(crate) id: ShapeId,
    pub transform: LocalTransform,
    pub style: ShapeStyle,
    pub visible: bool,
    pub locked: bool,
    /// Paint-order key; higher values paint later and win hit tests.
    pub z_index: i32,
    /// Owning group, used only to look up ancestor transforms.
    pub(crate) parent: Option<ShapeId>,
    pub kind: ShapeKind,
}

impl Shape {
    /// Create a shape with a fresh id at the origin.
    pub fn new(kind: ShapeKind) -> Self {
        Self::with_id(ShapeId::new(), kind)
    }

    pub fn with_id(id: ShapeId, kind: ShapeKind) -> Self {
        Self {
            id,
            transform: LocalTransform::default(),
            style: ShapeStyle::default(),
            visible: true,
            locked: false,
            z_index: 0,
            parent: None,
            kind,
        }
    }

    /// Convenience constructor: rectangle with its top-left corner at `(x, y)`.
    pub fn rect(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self::new(ShapeKind::Rect(Rectangle::new(width, height))).at(x, y)
    }

    /// Convenience constructor: circle centred at `(cx, cy)`.
    pub fn circle(cx: f64, cy: f64, radius: f64) -> Self {
        Self::new(ShapeKind::Circle(Ellipse::new(radius))).at(cx, cy)
    }

    /// Convenience constructor: polyline with points relative to `(x, y)`.
    pub fn path(x: f64, y: f64, points: Vec<Point>) -> Self {
        Self::new(ShapeKind::Path(Polyline::new(points))).at(x, y)
    }

    /// Convenience constructor: text block with its top-left corner at `(x, y)`.
    pub fn text(x: f64, y: f64, content: impl Into<String>) -> Self {
        Self::new(ShapeKind::Text(Text::new(content))).at(x, y)
    }

    /// Builder: move the shape to `(x, y)`.
    pub fn at(mut self, x: f64, y: f64) -> Self {
        self.transform.x = x;
        self.transform.y = y;
        self
    }

    /// Builder: set the fill color.
    pub fn filled(mut self, color: SerializableColor) -> Self {
        self.style.fill = Some(color);
        self
    }

    /// Builder: set the paint-order key.
    pub fn with_z_index(mut self, z_index: i32) -> Self {
        self.z_index = z_index;
        self
    }

    pub fn id(&self) -> &ShapeId {
        &self.id
    }

    pub fn parent(&self) -> Option<&ShapeId> {
        self.parent.as_ref()
    }

    /// Wire type tag for this variant.
    pub fn type_tag(&self) -> &'static str {
        match &self.kind {
            ShapeKind::Rect(_) => TYPE_RECT,
            ShapeKind::Circle(_) => TYPE_CIRCLE,
            ShapeKind::Path(_) => TYPE_PATH,
            ShapeKind::Text(_) => TYPE_TEXT,
            ShapeKind::Group(_) => TYPE_GROUP,
        }
    }

    pub fn local_affine(&self) -> Affine {
        self.transform.to_affine()
    }

    /// Leaf geometry, or `None` for groups.
    pub fn geometry(&self) -> Option<&dyn ShapeGeometry> {
        match &self.kind {
            ShapeKind::Rect(r) => Some(r as &dyn ShapeGeometry),
            ShapeKind::Circle(e) => Some(e as &dyn ShapeGeometry),
            ShapeKind::Path(p) => Some(p as &dyn ShapeGeometry),
            ShapeKind::Text(t) => Some(t as &dyn ShapeGeometry),
            ShapeKind::Group(_) => None,
        }
    }

    /// Check if this shape is a group.
    pub fn is_group(&self) -> bool {
        matches!(self.kind, ShapeKind::Group(_))
    }

    /// Get the group if this shape is a group.
    pub fn as_group(&self) -> Option<&Group> {
        match &self.kind {
            ShapeKind::Group(g) => Some(g),
            _ => None,
        }
    }

    /// Get the mutable group if this shape is a group.
    pub fn as_group_mut(&mut self) -> Option<&mut Group> {
        match &mut self.kind {
            ShapeKind::Group(g) => Some(g),
            _ => None,
        }
    }
}

/// A shape together with its owned descendants, detached from any scene.
///
/// This is the unit that travels through the shape factory, the command log
/// and the network: removing a group yields its whole subtree, re-adding the
/// snapshot restores it with identical ids.
#[derive(Debug, Clone, PartialEq)]
pub struct ShapeSnapshot {
    pub shape: Shape,
    pub children: Vec<ShapeSnapshot>,
}

impl ShapeSnapshot {
    pub fn leaf(shape: Shape) -> Self {
        Self {
            shape,
            children: Vec::new(),
        }
    }

    pub fn id(&self) -> &ShapeId {
        &self.shape.id
    }

    /// Ids of this shape and all descendants, depth first.
    pub fn all_ids(&self) -> Vec<ShapeId> {
        let mut ids = vec![self.shape.id.clone()];
        for child in &self.children {
            ids.extend(child.all_ids());
        }
        ids
    }
}

impl ShapeSnapshot {
    /// Wire JSON for this subtree.
    pub fn to_json(&self) -> serde_json::Value {
        shape_to_json(self)
    }

    pub fn from_json(value: &serde_json::Value) -> Result<Self, ShapeError> {
        shape_from_json(value)
    }
}

impl From<Shape> for ShapeSnapshot {
    fn from(shape: Shape) -> Self {
        Self::leaf(shape)
    }
}

/// Distance from a point to a line segment (a→b).
pub fn point_to_segment_dist(point: Point, a: Point, b: Point) -> f64 {
    let seg = b - a;
    let pv = point - a;
    let len_sq = seg.hypot2();
    if len_sq < f64::EPSILON {
        return pv.hypot();
    }
    let t = (pv.dot(seg) / len_sq).clamp(0.0, 1.0);
    let proj = a + seg * t;
    point.distance(proj)
}
