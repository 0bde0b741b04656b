//! Freehand drawing overlay
//!
//! `DrawingOverlay` is the shared handle the UI draws through and the
//! compositor reads from.

pub mod stroke;

pub use stroke::{OverlayError, Stroke, StrokeOverlay, StrokePoint};

use crate::capture::Resolution;
use crate::compositor::{Rgba, Surface};
use parking_lot::Mutex;
use std::sync::Arc;

/// Shared, cloneable handle to a stroke overlay
#[derive(Debug, Clone)]
pub struct DrawingOverlay {
    inner: Arc<Mutex<StrokeOverlay>>,
}

impl DrawingOverlay {
    pub fn new(resolution: Resolution) -> Self {
        Self {
            inner: Arc::new(Mutex::new(StrokeOverlay::new(resolution))),
        }
    }

    pub fn start_drawing(&self) {
        let mut overlay = self.inner.lock();
        if !overlay.is_drawing() {
            tracing::debug!("Drawing started");
        }
        overlay.start_drawing();
    }

    pub fn stop_drawing(&self) {
        self.inner.lock().stop_drawing();
    }

    pub fn is_drawing(&self) -> bool {
        self.inner.lock().is_drawing()
    }

    pub fn add_stroke(
        &self,
        points: Vec<StrokePoint>,
        color: Rgba,
        width: f32,
    ) -> Result<(), OverlayError> {
        self.inner.lock().add_stroke(Stroke {
            points,
            color,
            width,
        })
    }

    /// Same as `add_stroke` with a `#rrggbb[aa]` colour
    pub fn add_stroke_hex(
        &self,
        points: Vec<StrokePoint>,
        color: &str,
        width: f32,
    ) -> Result<(), OverlayError> {
        let color = Rgba::from_hex(color)
            .ok_or_else(|| OverlayError::InvalidStroke(format!("bad colour {:?}", color)))?;
        self.add_stroke(points, color, width)
    }

    pub fn clear(&self) {
        let mut overlay = self.inner.lock();
        if overlay.is_drawing() {
            tracing::debug!("Clearing {} strokes", overlay.strokes().len());
        }
        overlay.clear();
    }

    pub fn stroke_count(&self) -> usize {
        self.inner.lock().strokes().len()
    }

    pub fn strokes(&self) -> Vec<Stroke> {
        self.inner.lock().strokes().to_vec()
    }

    pub fn revision(&self) -> u64 {
        self.inner.lock().revision()
    }

    pub fn resolution(&self) -> Resolution {
        self.inner.lock().resolution()
    }

    pub fn render(&self) -> Surface {
        self.inner.lock().render()
    }

    /// Render only when the overlay changed after `seen_revision`
    pub fn render_if_changed(&self, seen_revision: Option<u64>) -> Option<(u64, Surface)> {
        let overlay = self.inner.lock();
        let revision = overlay.revision();
        if seen_revision == Some(revision) {
            return None;
        }
        Some((revision, overlay.render()))
    }
}
