//! Camera module for pan/zoom transforms.

use crate::geometry::{Aabb, GeometryResult, try_invert};
use kurbo::{Affine, Point, Size, Vec2};
use serde::{Deserialize, Serialize};

/// Zoom level shown as "100%".
pub const BASE_ZOOM: f64 = 1.0;

/// Camera manages the view transform for the canvas.
///
/// It handles panning (translation) and zooming (scaling) operations,
/// converting between screen coordinates and world coordinates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Camera {
    /// Current translation offset (pan)
    pub offset: Vec2,
    /// Current zoom level
    pub zoom: f64,
    /// Minimum allowed zoom level
    pub min_zoom: f64,
    /// Maximum allowed zoom level
    pub max_zoom: f64,
}

impl Default for Camera {
    fn default() -> Self {
        Self {
            offset: Vec2::ZERO,
            zoom: BASE_ZOOM,
            min_zoom: 0.1,
            max_zoom: 10.0,
        }
    }
}

impl Camera {
    pub fn new() -> Self {
        Self::default()
    }

    /// World to screen.
    pub fn transform(&self) -> Affine {
        Affine::translate(self.offset) * Affine::scale(self.zoom)
    }

    /// Screen to world. Fails when the zoom has collapsed to zero.
    pub fn inverse_transform(&self) -> GeometryResult<Affine> {
        try_invert(self.transform())
    }

    /// Convert a screen point to world coordinates.
    pub fn screen_to_world(&self, screen_point: Point) -> GeometryResult<Point> {
        Ok(self.inverse_transform()? * screen_point)
    }

    /// Convert a world point to screen coordinates.
    pub fn world_to_screen(&self, world_point: Point) -> Point {
        self.transform() * world_point
    }

    /// World-space region covered by a viewport of the given size.
    pub fn visible_region(&self, viewport: Size) -> GeometryResult<Aabb> {
        let inverse = self.inverse_transform()?;
        Ok(Aabb::from_origin_size(0.0, 0.0, viewport.width, viewport.height).transform(inverse))
    }

    /// Pan the camera by a delta in screen coordinates.
    pub fn pan(&mut self, delta: Vec2) {
        self.offset += delta;
    }

    /// Zoom the camera, keeping the given screen point fixed.
    pub fn zoom_at(&mut self, screen_point: Point, factor: f64) -> GeometryResult<()> {
        let new_zoom = (self.zoom * factor).clamp(self.min_zoom, self.max_zoom);
        if (new_zoom - self.zoom).abs() < f64::EPSILON {
            return Ok(());
        }

        let world_point = self.screen_to_world(screen_point)?;
        self.zoom = new_zoom;

        // Keep world_point under screen_point.
        let new_screen = self.world_to_screen(world_point);
        self.offset += screen_point - new_screen;
        Ok(())
    }

    /// Reset camera to default position and zoom.
    pub fn reset(&mut self) {
        self.offset = Vec2::ZERO;
        self.zoom = BASE_ZOOM;
    }

    /// Fit the camera to show the given bounding box.
    pub fn fit_to_bounds(&mut self, bounds: Aabb, viewport: Size, padding: f64) {
        if bounds.is_degenerate() || bounds.is_inverted() {
            self.reset();
            return;
        }

        let padded_viewport = Size::new(
            (viewport.width - padding * 2.0).max(1.0),
            (viewport.height - padding * 2.0).max(1.0),
        );

        let scale_x = padded_viewport.width / bounds.width();
        let scale_y = padded_viewport.height / bounds.height();
        self.zoom = scale_x.min(scale_y).clamp(self.min_zoom, self.max_zoom);

        let bounds_center = bounds.center();
        let viewport_center = Point::new(viewport.width / 2.0, viewport.height / 2.0);

        self.offset = Vec2::new(
            viewport_center.x - bounds_center.x * self.zoom,
            viewport_center.y - bounds_center.y * self.zoom,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::GeometryError;

    #[test]
    fn test_default_camera() {
        let camera = Camera::new();
        assert_eq!(camera.offset, Vec2::ZERO);
        assert!((camera.zoom - BASE_ZOOM).abs() < f64::EPSILON);
    }

    #[test]
    fn test_screen_to_world_with_offset_and_zoom() {
        let mut camera = Camera::new();
        camera.offset = Vec2::new(50.0, 100.0);
        camera.zoom = 2.0;
        let world = camera.screen_to_world(Point::new(150.0, 300.0)).unwrap();
        assert!((world.x - 50.0).abs() < 1e-10);
        assert!((world.y - 100.0).abs() < 1e-10);
    }

    #[test]
    fn test_roundtrip_conversion() {
        let mut camera = Camera::new();
        camera.offset = Vec2::new(30.0, -20.0);
        camera.zoom = 1.5;

        let original = Point::new(123.0, 456.0);
        let world = camera.screen_to_world(original).unwrap();
        let back = camera.world_to_screen(world);

        assert!((back.x - original.x).abs() < 1e-10);
        assert!((back.y - original.y).abs() < 1e-10);
    }

    #[test]
    fn test_zero_zoom_is_singular() {
        let mut camera = Camera::new();
        camera.zoom = 0.0;
        assert!(matches!(
            camera.screen_to_world(Point::new(1.0, 1.0)),
            Err(GeometryError::SingularMatrix { .. })
        ));
        assert!(camera.zoom_at(Point::ZERO, 2.0).is_err());
    }

    #[test]
    fn test_zoom_at_keeps_anchor() {
        let mut camera = Camera::new();
        let anchor = Point::new(200.0, 100.0);
        let before = camera.screen_to_world(anchor).unwrap();
        camera.zoom_at(anchor, 2.0).unwrap();
        let after = camera.screen_to_world(anchor).unwrap();
        assert!((camera.zoom - 2.0).abs() < 1e-10);
        assert!((before.x - after.x).abs() < 1e-9);
        assert!((before.y - after.y).abs() < 1e-9);
    }

    #[test]
    fn test_zoom_clamp() {
        let mut camera = Camera::new();
        camera.zoom_at(Point::ZERO, 0.001).unwrap();
        assert!((camera.zoom - camera.min_zoom).abs() < f64::EPSILON);

        camera.zoom = 1.0;
        camera.zoom_at(Point::ZERO, 1000.0).unwrap();
        assert!((camera.zoom - camera.max_zoom).abs() < f64::EPSILON);
    }

    #[test]
    fn test_visible_region() {
        let mut camera = Camera::new();
        camera.offset = Vec2::new(-100.0, 0.0);
        camera.zoom = 2.0;
        let region = camera.visible_region(Size::new(400.0, 200.0)).unwrap();
        assert!((region.min_x - 50.0).abs() < 1e-10);
        assert!((region.max_x - 250.0).abs() < 1e-10);
        assert!((region.max_y - 100.0).abs() < 1e-10);
    }

    #[test]
    fn test_fit_to_bounds_centers() {
        let mut camera = Camera::new();
        let bounds = Aabb::new(0.0, 0.0, 100.0, 50.0);
        let viewport = Size::new(400.0, 400.0);
        camera.fit_to_bounds(bounds, viewport, 0.0);
        assert!((camera.zoom - 4.0).abs() < 1e-10);
        let center = camera.world_to_screen(bounds.center());
        assert!((center.x - 200.0).abs() < 1e-9);
        assert!((center.y - 200.0).abs() < 1e-9);
    }
}
