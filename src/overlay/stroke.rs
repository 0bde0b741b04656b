//! Stroke model and rasterisation
//!
//! Strokes live in overlay space, which is independent of the match video's
//! native resolution. The compositor rescales the raster at composite time.

use crate::capture::Resolution;
use crate::compositor::{Rgba, Surface};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised by the drawing overlay
#[derive(Error, Debug, Clone, PartialEq)]
pub enum OverlayError {
    #[error("Drawing is not active")]
    NotDrawing,

    #[error("Invalid stroke: {0}")]
    InvalidStroke(String),
}

/// A point in overlay pixel space
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StrokePoint {
    pub x: f32,
    pub y: f32,
}

impl StrokePoint {
    pub const fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}

/// One freehand stroke
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stroke {
    pub points: Vec<StrokePoint>,
    pub color: Rgba,
    pub width: f32,
}

impl Stroke {
    fn validate(&self) -> Result<(), OverlayError> {
        if self.points.is_empty() {
            return Err(OverlayError::InvalidStroke("no points".to_string()));
        }
        if !self.width.is_finite() || self.width <= 0.0 {
            return Err(OverlayError::InvalidStroke(format!(
                "width must be positive, got {}",
                self.width
            )));
        }
        if self
            .points
            .iter()
            .any(|p| !p.x.is_finite() || !p.y.is_finite())
        {
            return Err(OverlayError::InvalidStroke(
                "non-finite coordinate".to_string(),
            ));
        }
        Ok(())
    }

    fn radius(&self) -> f32 {
        (self.width / 2.0).max(0.5)
    }

    /// Stamp the stroke onto `surface`. Each covered pixel is blended once.
    fn rasterize(&self, surface: &mut Surface) {
        let r = self.radius();
        let (w, h) = (surface.width() as i64, surface.height() as i64);

        let (mut min_x, mut min_y) = (f32::MAX, f32::MAX);
        let (mut max_x, mut max_y) = (f32::MIN, f32::MIN);
        for p in &self.points {
            min_x = min_x.min(p.x);
            min_y = min_y.min(p.y);
            max_x = max_x.max(p.x);
            max_y = max_y.max(p.y);
        }

        let x0 = ((min_x - r).floor() as i64).max(0);
        let y0 = ((min_y - r).floor() as i64).max(0);
        let x1 = ((max_x + r).ceil() as i64).min(w - 1);
        let y1 = ((max_y + r).ceil() as i64).min(h - 1);
        if x0 > x1 || y0 > y1 {
            return;
        }

        let r2 = r * r;
        for y in y0..=y1 {
            for x in x0..=x1 {
                let c = StrokePoint::new(x as f32 + 0.5, y as f32 + 0.5);
                if self.distance_sq(c) <= r2 {
                    surface.blend_pixel(x as u32, y as u32, self.color);
                }
            }
        }
    }

    fn distance_sq(&self, p: StrokePoint) -> f32 {
        match self.points.as_slice() {
            [only] => dist_sq(p, *only),
            points => points
                .windows(2)
                .map(|seg| segment_dist_sq(p, seg[0], seg[1]))
                .fold(f32::MAX, f32::min),
        }
    }
}

fn dist_sq(a: StrokePoint, b: StrokePoint) -> f32 {
    let (dx, dy) = (a.x - b.x, a.y - b.y);
    dx * dx + dy * dy
}

fn segment_dist_sq(p: StrokePoint, a: StrokePoint, b: StrokePoint) -> f32 {
    let (abx, aby) = (b.x - a.x, b.y - a.y);
    let len_sq = abx * abx + aby * aby;
    if len_sq == 0.0 {
        return dist_sq(p, a);
    }
    let t = (((p.x - a.x) * abx + (p.y - a.y) * aby) / len_sq).clamp(0.0, 1.0);
    dist_sq(p, StrokePoint::new(a.x + t * abx, a.y + t * aby))
}

/// Ordered strokes plus the drawing flag
#[derive(Debug, Clone)]
pub struct StrokeOverlay {
    resolution: Resolution,
    strokes: Vec<Stroke>,
    drawing: bool,
    revision: u64,
}

impl StrokeOverlay {
    pub fn new(resolution: Resolution) -> Self {
        Self {
            resolution,
            strokes: Vec::new(),
            drawing: false,
            revision: 0,
        }
    }

    pub fn resolution(&self) -> Resolution {
        self.resolution
    }

    pub fn is_drawing(&self) -> bool {
        self.drawing
    }

    /// Bumped whenever the rendered raster would change
    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn strokes(&self) -> &[Stroke] {
        &self.strokes
    }

    /// Begin accepting strokes. Calling again while active does nothing.
    pub fn start_drawing(&mut self) {
        if self.drawing {
            return;
        }
        self.drawing = true;
        self.revision += 1;
    }

    /// Stop accepting strokes. Existing strokes are kept.
    pub fn stop_drawing(&mut self) {
        if !self.drawing {
            return;
        }
        self.drawing = false;
        self.revision += 1;
    }

    pub fn add_stroke(&mut self, stroke: Stroke) -> Result<(), OverlayError> {
        if !self.drawing {
            return Err(OverlayError::NotDrawing);
        }
        stroke.validate()?;
        self.strokes.push(stroke);
        self.revision += 1;
        Ok(())
    }

    /// Drop every stroke. Does nothing unless drawing is active.
    pub fn clear(&mut self) {
        if !self.drawing {
            return;
        }
        self.strokes.clear();
        self.revision += 1;
    }

    /// Render all strokes, in order, onto a transparent surface
    pub fn render(&self) -> Surface {
        let mut surface = Surface::new(self.resolution.width, self.resolution.height);
        for stroke in &self.strokes {
            stroke.rasterize(&mut surface);
        }
        surface
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(x0: f32, y0: f32, x1: f32, y1: f32, color: Rgba) -> Stroke {
        Stroke {
            points: vec![StrokePoint::new(x0, y0), StrokePoint::new(x1, y1)],
            color,
            width: 2.0,
        }
    }

    #[test]
    fn test_add_requires_drawing() {
        let mut overlay = StrokeOverlay::new(Resolution::new(10, 10));
        let result = overlay.add_stroke(line(0.0, 0.0, 5.0, 5.0, Rgba::WHITE));
        assert_eq!(result, Err(OverlayError::NotDrawing));
    }

    #[test]
    fn test_start_drawing_is_idempotent() {
        let mut overlay = StrokeOverlay::new(Resolution::new(10, 10));
        overlay.start_drawing();
        overlay.add_stroke(line(0.0, 0.0, 5.0, 5.0, Rgba::WHITE)).unwrap();
        let revision = overlay.revision();

        overlay.start_drawing();
        assert_eq!(overlay.revision(), revision);
        assert_eq!(overlay.strokes().len(), 1);
    }

    #[test]
    fn test_strokes_keep_call_order() {
        let mut overlay = StrokeOverlay::new(Resolution::new(10, 10));
        overlay.start_drawing();
        overlay.add_stroke(line(0.0, 5.0, 10.0, 5.0, Rgba::rgb(255, 0, 0))).unwrap();
        overlay.add_stroke(line(5.0, 0.0, 5.0, 10.0, Rgba::rgb(0, 0, 255))).unwrap();

        assert_eq!(overlay.strokes()[0].color, Rgba::rgb(255, 0, 0));
        // Later stroke paints over the earlier one at the crossing
        assert_eq!(overlay.render().pixel(5, 5), Some(Rgba::rgb(0, 0, 255)));
    }

    #[test]
    fn test_clear_noop_when_not_drawing() {
        let mut overlay = StrokeOverlay::new(Resolution::new(10, 10));
        overlay.start_drawing();
        overlay.add_stroke(line(0.0, 0.0, 5.0, 5.0, Rgba::WHITE)).unwrap();
        overlay.stop_drawing();

        overlay.clear();
        assert_eq!(overlay.strokes().len(), 1);

        overlay.start_drawing();
        overlay.clear();
        assert!(overlay.strokes().is_empty());
        assert_eq!(overlay.render(), Surface::new(10, 10));
    }

    #[test]
    fn test_invalid_strokes_rejected() {
        let mut overlay = StrokeOverlay::new(Resolution::new(10, 10));
        overlay.start_drawing();

        let empty = Stroke {
            points: vec![],
            color: Rgba::WHITE,
            width: 2.0,
        };
        assert!(matches!(
            overlay.add_stroke(empty),
            Err(OverlayError::InvalidStroke(_))
        ));

        let mut zero = line(0.0, 0.0, 1.0, 1.0, Rgba::WHITE);
        zero.width = 0.0;
        assert!(matches!(
            overlay.add_stroke(zero),
            Err(OverlayError::InvalidStroke(_))
        ));
    }

    #[test]
    fn test_single_point_draws_dot() {
        let mut overlay = StrokeOverlay::new(Resolution::new(10, 10));
        overlay.start_drawing();
        overlay
            .add_stroke(Stroke {
                points: vec![StrokePoint::new(4.5, 4.5)],
                color: Rgba::WHITE,
                width: 1.0,
            })
            .unwrap();

        let raster = overlay.render();
        assert_eq!(raster.pixel(4, 4), Some(Rgba::WHITE));
        assert_eq!(raster.pixel(0, 0), Some(Rgba::TRANSPARENT));
    }
}
