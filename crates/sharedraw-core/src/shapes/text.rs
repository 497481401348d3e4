//! Text shape.

use super::{ShapeGeometry, ShapeStyle};
use crate::geometry::Aabb;
use kurbo::{BezPath, Point, Shape as KurboShape};

/// A block of text whose top-left corner sits on the local origin.
///
/// Layout is owned by the renderer; bounds here use an average-glyph-width
/// approximation so hit testing and the spatial index work without fonts.
#[derive(Debug, Clone, PartialEq)]
pub struct Text {
    pub content: String,
    /// Font size in pixels.
    pub font_size: f64,
    pub font_family: String,
    /// Line height as a multiple of the font size.
    pub line_height: f64,
    pub bold: bool,
    pub italic: bool,
}

impl Text {
    pub const DEFAULT_FONT_SIZE: f64 = 16.0;
    pub const DEFAULT_FONT_FAMILY: &'static str = "sans-serif";
    pub const DEFAULT_LINE_HEIGHT: f64 = 1.2;
    /// Average glyph advance as a fraction of the font size.
    const CHAR_WIDTH_FACTOR: f64 = 0.55;

    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            font_size: Self::DEFAULT_FONT_SIZE,
            font_family: Self::DEFAULT_FONT_FAMILY.to_string(),
            line_height: Self::DEFAULT_LINE_HEIGHT,
            bold: false,
            italic: false,
        }
    }

    fn line_count(&self) -> usize {
        let count = self.content.lines().count().max(1);
        // lines() drops a trailing empty line
        if self.content.ends_with('\n') {
            count + 1
        } else {
            count
        }
    }

    pub fn approximate_width(&self) -> f64 {
        let widest = self
            .content
            .lines()
            .map(|line| line.chars().count())
            .max()
            .unwrap_or(0);
        let factor = if self.bold {
            Self::CHAR_WIDTH_FACTOR + 0.05
        } else {
            Self::CHAR_WIDTH_FACTOR
        };
        widest as f64 * self.font_size * factor
    }

    pub fn approximate_height(&self) -> f64 {
        self.line_count() as f64 * self.font_size * self.line_height
    }
}

impl ShapeGeometry for Text {
    fn bounds(&self) -> Aabb {
        Aabb::from_corners(
            Point::ZERO,
            Point::new(self.approximate_width(), self.approximate_height()),
        )
    }

    fn hit_test(&self, point: Point, _style: &ShapeStyle, tolerance: f64) -> bool {
        self.bounds().inflate(tolerance, tolerance).contains_point(point)
    }

    fn to_path(&self) -> BezPath {
        // Glyphs are drawn by the renderer; the path is the layout box.
        self.bounds().to_rect().to_path(0.1)
    }
}
