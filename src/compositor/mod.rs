//! Compositing loop
//!
//! Merges the match video, the stroke overlay and the camera feed into one
//! frame per display refresh.

pub mod compositing;
pub mod geometry;
pub mod surface;

pub use compositing::{CompositedFrame, Compositor, CompositorHandle, CompositorInputs};
pub use geometry::{
    CompositeError, CompositionGeometry, GeometryProvider, LayoutSnapshot, NativeRect, Rect,
    ScaleTransform, SharedLayout, StaticLayout,
};
pub use surface::{Rgba, Surface};
