//! Refresh-driven draw pass over the scene.
//!
//! The host owns the display refresh and calls [`RenderLoop::on_frame`] from
//! its frame callback. Each call draws at most one frame through a
//! [`Painter`], which is whatever backend the host renders with.

use crate::camera::Camera;
use crate::config::EditorConfig;
use crate::scene::Scene;
use crate::shapes::{Shape, ShapeId};
use kurbo::{Affine, Size};
use peniko::Color;

/// Drawing backend.
pub trait Painter {
    /// Start a frame by filling the viewport.
    fn clear(&mut self, background: Color);

    /// Draw one leaf shape. `transform` maps its local space to the screen.
    fn draw_shape(&mut self, shape: &Shape, transform: Affine);
}

/// Inputs for a single frame.
pub struct RenderContext<'a> {
    pub scene: &'a Scene,
    pub camera: &'a Camera,
    /// Viewport size in screen units.
    pub viewport_size: Size,
    pub background_color: Color,
}

impl<'a> RenderContext<'a> {
    pub fn new(scene: &'a Scene, camera: &'a Camera, viewport_size: Size) -> Self {
        Self {
            scene,
            camera,
            viewport_size,
            background_color: Color::from_rgba8(250, 250, 250, 255),
        }
    }

    pub fn with_background(mut self, color: Color) -> Self {
        self.background_color = color;
        self
    }
}

/// Counters for the last drawn frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameStats {
    /// Frames drawn since the loop was created.
    pub frame: u64,
    /// Leaf shapes handed to the painter.
    pub drawn: usize,
    /// Top-level shapes skipped because they are off screen.
    pub culled: usize,
}

/// Frame driver.
#[derive(Debug, Clone)]
pub struct RenderLoop {
    running: bool,
    virtualize_threshold: usize,
    frames: u64,
    last: FrameStats,
}

impl Default for RenderLoop {
    fn default() -> Self {
        Self::new(EditorConfig::default().virtualize_threshold)
    }
}

impl RenderLoop {
    /// A stopped loop. Above `virtualize_threshold` shapes, frames only draw
    /// top-level shapes the spatial index reports inside the viewport.
    pub fn new(virtualize_threshold: usize) -> Self {
        Self {
            running: false,
            virtualize_threshold,
            frames: 0,
            last: FrameStats::default(),
        }
    }

    pub fn from_config(config: &EditorConfig) -> Self {
        Self::new(config.virtualize_threshold)
    }

    pub fn start(&mut self) {
        self.running = true;
    }

    /// Stop drawing; later callbacks are ignored until `start`.
    pub fn stop(&mut self) {
        self.running = false;
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn last_stats(&self) -> FrameStats {
        self.last
    }

    /// Host frame callback. Draws one frame if the loop is running.
    pub fn on_frame(&mut self, ctx: &RenderContext, painter: &mut dyn Painter) -> Option<FrameStats> {
        if !self.running {
            return None;
        }
        self.frames += 1;
        let mut stats = FrameStats {
            frame: self.frames,
            ..FrameStats::default()
        };

        painter.clear(ctx.background_color);
        let view = ctx.camera.transform();
        let roots = self.visible_roots(ctx);
        stats.culled = ctx.scene.roots().len().saturating_sub(roots.len());
        for id in &roots {
            draw_tree(ctx.scene, id, view, painter, &mut stats.drawn);
        }

        self.last = stats;
        Some(stats)
    }

    fn visible_roots(&self, ctx: &RenderContext) -> Vec<ShapeId> {
        if ctx.scene.len() <= self.virtualize_threshold {
            return ctx.scene.roots().to_vec();
        }
        match ctx.camera.visible_region(ctx.viewport_size) {
            Ok(region) => ctx.scene.query_region(&region),
            Err(err) => {
                log::debug!("Cannot cull against the viewport: {err}");
                ctx.scene.roots().to_vec()
            }
        }
    }
}

/// Draw a subtree in paint order. Hidden groups hide their members.
fn draw_tree(
    scene: &Scene,
    id: &ShapeId,
    parent: Affine,
    painter: &mut dyn Painter,
    drawn: &mut usize,
) {
    let Some(shape) = scene.get(id) else {
        return;
    };
    if !shape.visible {
        return;
    }
    let transform = parent * shape.local_affine();
    match shape.as_group() {
        Some(group) => {
            for child in group.children() {
                draw_tree(scene, child, transform, painter, drawn);
            }
        }
        None => {
            painter.draw_shape(shape, transform);
            *drawn += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shapes::{Group, ShapeKind};
    use kurbo::{Point, Vec2};

    #[derive(Default)]
    struct RecordingPainter {
        clears: usize,
        drawn: Vec<(ShapeId, Affine)>,
    }

    impl Painter for RecordingPainter {
        fn clear(&mut self, _background: Color) {
            self.clears += 1;
        }

        fn draw_shape(&mut self, shape: &Shape, transform: Affine) {
            self.drawn.push((shape.id().clone(), transform));
        }
    }

    #[test]
    fn test_stopped_loop_draws_nothing() {
        let scene = Scene::new();
        let camera = Camera::new();
        let ctx = RenderContext::new(&scene, &camera, Size::new(100.0, 100.0));
        let mut painter = RecordingPainter::default();
        let mut render = RenderLoop::default();

        assert_eq!(render.on_frame(&ctx, &mut painter), None);
        render.start();
        assert!(render.on_frame(&ctx, &mut painter).is_some());
        render.stop();
        assert_eq!(render.on_frame(&ctx, &mut painter), None);
        assert_eq!(painter.clears, 1);
    }

    #[test]
    fn test_paint_order_and_view_transform() {
        let mut scene = Scene::new();
        let top = scene.add_shape(Shape::rect(0.0, 0.0, 10.0, 10.0).with_z_index(2)).unwrap();
        let bottom = scene.add_shape(Shape::rect(5.0, 5.0, 10.0, 10.0)).unwrap();
        let mut hidden = Shape::rect(0.0, 0.0, 1.0, 1.0);
        hidden.visible = false;
        scene.add_shape(hidden).unwrap();

        let mut camera = Camera::new();
        camera.pan(Vec2::new(100.0, 0.0));
        let ctx = RenderContext::new(&scene, &camera, Size::new(800.0, 600.0));
        let mut painter = RecordingPainter::default();
        let mut render = RenderLoop::default();
        render.start();

        let stats = render.on_frame(&ctx, &mut painter).unwrap();
        assert_eq!(stats.drawn, 2);
        assert_eq!(stats.frame, 1);
        let ids: Vec<&ShapeId> = painter.drawn.iter().map(|(id, _)| id).collect();
        assert_eq!(ids, vec![&bottom, &top]);
        let origin = painter.drawn[0].1 * Point::ZERO;
        assert!((origin.x - 105.0).abs() < 1e-9);
        assert!((origin.y - 5.0).abs() < 1e-9);
    }

    #[test]
    fn test_group_members_drawn_with_composed_transform() {
        let mut scene = Scene::new();
        let group = Shape::with_id("g".into(), ShapeKind::Group(Group::default())).at(10.0, 10.0);
        scene.add_shape(group).unwrap();
        let child = scene.add_shape(Shape::rect(1.0, 2.0, 3.0, 3.0)).unwrap();
        scene.add_child(&"g".into(), &child).unwrap();

        let camera = Camera::new();
        let ctx = RenderContext::new(&scene, &camera, Size::new(100.0, 100.0));
        let mut painter = RecordingPainter::default();
        let mut render = RenderLoop::default();
        render.start();
        render.on_frame(&ctx, &mut painter);

        assert_eq!(painter.drawn.len(), 1);
        let origin = painter.drawn[0].1 * Point::ZERO;
        assert!((origin.x - 11.0).abs() < 1e-9);
        assert!((origin.y - 12.0).abs() < 1e-9);
    }

    #[test]
    fn test_culls_through_index_above_threshold() {
        let mut scene = Scene::new();
        for i in 0..20 {
            scene
                .add_shape(Shape::rect(i as f64 * 100.0, 0.0, 10.0, 10.0))
                .unwrap();
        }
        let camera = Camera::new();
        let ctx = RenderContext::new(&scene, &camera, Size::new(250.0, 100.0));
        let mut painter = RecordingPainter::default();
        let mut render = RenderLoop::new(5);
        render.start();

        let stats = render.on_frame(&ctx, &mut painter).unwrap();
        assert_eq!(stats.drawn, 3);
        assert_eq!(stats.culled, 17);

        let mut full = RenderLoop::new(100);
        full.start();
        let stats = full.on_frame(&ctx, &mut painter).unwrap();
        assert_eq!(stats.drawn, 20);
        assert_eq!(stats.culled, 0);
    }
}
