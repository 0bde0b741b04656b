//! Composition geometry
//!
//! Maps the on-screen layout of the match video and the draggable camera
//! overlay into the match video's native pixel space.

use crate::capture::Resolution;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

/// Errors raised while compositing
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CompositeError {
    #[error("Match video metadata not loaded")]
    GeometryUnknown,

    #[error("Invalid layout: {0}")]
    InvalidLayout(String),

    #[error("Frame size mismatch: expected {expected} bytes, got {actual}")]
    FrameSize { expected: usize, actual: usize },

    #[error("PNG encode error: {0}")]
    Png(String),
}

/// Rectangle in display space (rendered CSS pixels)
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Rect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl Rect {
    pub const fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// True for zero, negative or non-finite extents
    pub fn is_empty(&self) -> bool {
        !(self.width.is_finite() && self.height.is_finite())
            || self.width <= 0.0
            || self.height <= 0.0
    }

    pub fn translated(&self, dx: f64, dy: f64) -> Self {
        Self::new(self.x + dx, self.y + dy, self.width, self.height)
    }
}

/// Rectangle in native match-video pixels
///
/// The origin may be negative or beyond the frame when the overlay is
/// dragged partially off the video; drawing clips it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NativeRect {
    pub x: i64,
    pub y: i64,
    pub width: u32,
    pub height: u32,
}

impl NativeRect {
    /// The whole frame
    pub fn full(resolution: Resolution) -> Self {
        Self {
            x: 0,
            y: 0,
            width: resolution.width,
            height: resolution.height,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// True when at least one pixel lands inside a frame of `resolution`
    pub fn intersects(&self, resolution: Resolution) -> bool {
        !self.is_empty()
            && self.x < resolution.width as i64
            && self.y < resolution.height as i64
            && self.x + self.width as i64 > 0
            && self.y + self.height as i64 > 0
    }
}

/// Display to native scale transform
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScaleTransform {
    /// Rendered origin of the match video
    pub origin_x: f64,
    pub origin_y: f64,
    /// Native pixels per display pixel
    pub scale_x: f64,
    pub scale_y: f64,
}

impl ScaleTransform {
    /// Build the transform from the match video's rendered box and native size
    pub fn between(rendered: Rect, native: Resolution) -> Result<Self, CompositeError> {
        if native.is_empty() {
            return Err(CompositeError::GeometryUnknown);
        }
        if rendered.is_empty() {
            return Err(CompositeError::InvalidLayout(format!(
                "match video box has no area: {:?}",
                rendered
            )));
        }

        Ok(Self {
            origin_x: rendered.x,
            origin_y: rendered.y,
            scale_x: native.width as f64 / rendered.width,
            scale_y: native.height as f64 / rendered.height,
        })
    }

    /// Map a display-space rectangle into native pixels
    pub fn map_rect(&self, rect: Rect) -> NativeRect {
        let x = ((rect.x - self.origin_x) * self.scale_x).round();
        let y = ((rect.y - self.origin_y) * self.scale_y).round();
        let width = (rect.width * self.scale_x).round().max(0.0);
        let height = (rect.height * self.scale_y).round().max(0.0);

        NativeRect {
            x: x as i64,
            y: y as i64,
            width: width.min(u32::MAX as f64) as u32,
            height: height.min(u32::MAX as f64) as u32,
        }
    }
}

/// One sample of the on-screen layout
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LayoutSnapshot {
    /// Rendered bounding box of the match video
    pub match_video_box: Rect,

    /// Rendered bounding box of the camera overlay, None when hidden
    pub camera_box: Option<Rect>,
}

/// Source of the current on-screen layout, queried once per tick
pub trait GeometryProvider: Send + Sync {
    fn snapshot(&self) -> LayoutSnapshot;
}

/// Fixed layout
#[derive(Debug, Clone, Copy)]
pub struct StaticLayout(pub LayoutSnapshot);

impl GeometryProvider for StaticLayout {
    fn snapshot(&self) -> LayoutSnapshot {
        self.0
    }
}

/// Layout pushed by the UI host as elements move
#[derive(Debug, Clone, Default)]
pub struct SharedLayout {
    inner: Arc<RwLock<LayoutSnapshot>>,
}

impl SharedLayout {
    pub fn new(initial: LayoutSnapshot) -> Self {
        Self {
            inner: Arc::new(RwLock::new(initial)),
        }
    }

    pub fn set_match_video_box(&self, rect: Rect) {
        self.inner.write().match_video_box = rect;
    }

    pub fn set_camera_box(&self, rect: Option<Rect>) {
        self.inner.write().camera_box = rect;
    }

    /// Drag the camera overlay by a display-space offset
    pub fn move_camera_by(&self, dx: f64, dy: f64) {
        let mut layout = self.inner.write();
        if let Some(camera) = layout.camera_box {
            layout.camera_box = Some(camera.translated(dx, dy));
        }
    }
}

impl GeometryProvider for SharedLayout {
    fn snapshot(&self) -> LayoutSnapshot {
        *self.inner.read()
    }
}

/// Geometry of a single composited frame
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompositionGeometry {
    /// Native match-video size, the size of every composited frame
    pub native: Resolution,

    pub transform: ScaleTransform,

    /// Camera overlay in native pixels, None when hidden or off-frame
    pub camera_rect: Option<NativeRect>,
}

impl CompositionGeometry {
    pub fn compute(native: Resolution, layout: &LayoutSnapshot) -> Result<Self, CompositeError> {
        let transform = ScaleTransform::between(layout.match_video_box, native)?;
        let camera_rect = layout
            .camera_box
            .filter(|r| !r.is_empty())
            .map(|r| transform.map_rect(r))
            .filter(|r| r.intersects(native));

        Ok(Self {
            native,
            transform,
            camera_rect,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout(camera: Option<Rect>) -> LayoutSnapshot {
        LayoutSnapshot {
            match_video_box: Rect::new(100.0, 50.0, 640.0, 360.0),
            camera_box: camera,
        }
    }

    #[test]
    fn test_scale_from_rendered_box() {
        let t = ScaleTransform::between(Rect::new(0.0, 0.0, 640.0, 360.0), Resolution::FULL_HD)
            .unwrap();
        assert_eq!(t.scale_x, 3.0);
        assert_eq!(t.scale_y, 3.0);
    }

    #[test]
    fn test_camera_rect_relative_to_video_origin() {
        let geometry = CompositionGeometry::compute(
            Resolution::HD,
            &layout(Some(Rect::new(420.0, 230.0, 160.0, 90.0))),
        )
        .unwrap();

        // 1280 / 640 = 2x
        assert_eq!(
            geometry.camera_rect,
            Some(NativeRect {
                x: 640,
                y: 360,
                width: 320,
                height: 180,
            })
        );
    }

    #[test]
    fn test_camera_off_frame_is_dropped() {
        let geometry = CompositionGeometry::compute(
            Resolution::HD,
            &layout(Some(Rect::new(900.0, 50.0, 100.0, 100.0))),
        )
        .unwrap();
        assert_eq!(geometry.camera_rect, None);
    }

    #[test]
    fn test_unknown_native_size() {
        let result = CompositionGeometry::compute(Resolution::new(0, 0), &layout(None));
        assert_eq!(result, Err(CompositeError::GeometryUnknown));
    }

    #[test]
    fn test_empty_video_box() {
        let snapshot = LayoutSnapshot {
            match_video_box: Rect::new(0.0, 0.0, 0.0, 360.0),
            camera_box: None,
        };
        assert!(matches!(
            CompositionGeometry::compute(Resolution::HD, &snapshot),
            Err(CompositeError::InvalidLayout(_))
        ));
    }

    #[test]
    fn test_shared_layout_drag() {
        let shared = SharedLayout::new(layout(Some(Rect::new(100.0, 50.0, 10.0, 10.0))));
        shared.move_camera_by(5.0, -5.0);
        assert_eq!(
            shared.snapshot().camera_box,
            Some(Rect::new(105.0, 45.0, 10.0, 10.0))
        );
    }
}
