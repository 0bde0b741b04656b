//! Per-refresh compositing
//!
//! Each tick samples the layout once, redraws the match video frame, blends
//! the stroke raster when drawing is active and draws the camera on top.
//! Frames are published on a watch channel so readers always see the latest
//! one and never a backlog.

use super::geometry::{CompositeError, CompositionGeometry, GeometryProvider, NativeRect};
use super::surface::{Rgba, Surface};
use crate::capture::{CameraSlot, MatchVideo, MediaTrack, Resolution, VideoTrack};
use crate::overlay::DrawingOverlay;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Everything a tick reads from
#[derive(Clone)]
pub struct CompositorInputs {
    pub match_video: Arc<dyn MatchVideo>,
    pub camera: CameraSlot,
    pub overlay: DrawingOverlay,
    pub layout: Arc<dyn GeometryProvider>,
}

/// One merged frame
#[derive(Debug, Clone)]
pub struct CompositedFrame {
    /// Tick counter, starting at 1
    pub sequence: u64,
    pub surface: Arc<Surface>,
    pub geometry: CompositionGeometry,
    /// True when the camera layer was drawn
    pub camera_drawn: bool,
}

pub type FrameReceiver = watch::Receiver<Option<CompositedFrame>>;

pub struct Compositor {
    inputs: CompositorInputs,
    native: Resolution,
    sequence: u64,
    overlay_cache: Option<(u64, Surface)>,
    camera_generation: Option<u64>,
    failing: bool,
    frames: Arc<watch::Sender<Option<CompositedFrame>>>,
}

impl Compositor {
    /// Fails until the match video's native size is known
    pub fn new(inputs: CompositorInputs) -> Result<Self, CompositeError> {
        let native = inputs
            .match_video
            .native_resolution()
            .filter(|r| !r.is_empty())
            .ok_or(CompositeError::GeometryUnknown)?;

        let (frames, _) = watch::channel(None);
        Ok(Self {
            inputs,
            native,
            sequence: 0,
            overlay_cache: None,
            camera_generation: None,
            failing: false,
            frames: Arc::new(frames),
        })
    }

    pub fn native_resolution(&self) -> Resolution {
        self.native
    }

    pub fn subscribe(&self) -> FrameReceiver {
        self.frames.subscribe()
    }

    /// Compose and publish one frame
    pub fn tick(&mut self) -> Result<CompositedFrame, CompositeError> {
        // Geometry is sampled once; a drag during this tick lands on the next one
        let layout = self.inputs.layout.snapshot();
        let geometry = CompositionGeometry::compute(self.native, &layout)?;

        let mut surface = self.base_frame();

        if self.inputs.overlay.is_drawing() {
            let seen = self.overlay_cache.as_ref().map(|(rev, _)| *rev);
            if let Some(fresh) = self.inputs.overlay.render_if_changed(seen) {
                self.overlay_cache = Some(fresh);
            }
            if let Some((_, raster)) = &self.overlay_cache {
                surface.blend_scaled(raster, NativeRect::full(self.native));
            }
        }

        let camera_drawn = self.draw_camera(&mut surface, &geometry);

        self.sequence += 1;
        let frame = CompositedFrame {
            sequence: self.sequence,
            surface: Arc::new(surface),
            geometry,
            camera_drawn,
        };
        self.frames.send_replace(Some(frame.clone()));
        Ok(frame)
    }

    fn base_frame(&self) -> Surface {
        let mut surface = Surface::filled(self.native.width, self.native.height, Rgba::BLACK);
        if let Some(frame) = self.inputs.match_video.current_frame() {
            if frame.resolution() == self.native {
                return (*frame).clone();
            }
            surface.draw_scaled(&frame, NativeRect::full(self.native));
        }
        surface
    }

    fn draw_camera(&mut self, surface: &mut Surface, geometry: &CompositionGeometry) -> bool {
        let (generation, camera) = self.inputs.camera.subscribe();
        if self.camera_generation != Some(generation) {
            tracing::debug!(
                "Camera source changed (generation {}, present={})",
                generation,
                camera.is_some()
            );
            self.camera_generation = Some(generation);
        }

        // A stale or missing camera just skips the layer
        let Some(rect) = geometry.camera_rect else {
            return false;
        };
        let Some(track) = camera.filter(|t| t.is_live()) else {
            return false;
        };
        match track.latest_frame() {
            Some(frame) => {
                surface.draw_scaled(&frame, rect);
                true
            }
            None => false,
        }
    }

    /// Run the loop on the tokio runtime, one tick per `refresh`
    pub fn spawn(mut self, refresh: Duration) -> CompositorHandle {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let frames = Arc::clone(&self.frames);

        tracing::info!(
            "Compositing loop started at {} every {:?}",
            self.native,
            refresh
        );

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(refresh);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => self.run_tick(),
                }
            }

            tracing::debug!("Compositing loop stopped after {} frames", self.sequence);
            self.sequence
        });

        CompositorHandle {
            cancel,
            stopped: AtomicBool::new(false),
            task: Some(task),
            frames,
        }
    }

    fn run_tick(&mut self) {
        match self.tick() {
            Ok(_) if self.failing => {
                tracing::info!("Compositing recovered");
                self.failing = false;
            }
            Ok(_) => {}
            Err(e) => {
                if !self.failing {
                    tracing::warn!("Skipping composite frame: {}", e);
                }
                self.failing = true;
            }
        }
    }
}

/// Handle to a running compositing loop
pub struct CompositorHandle {
    cancel: CancellationToken,
    stopped: AtomicBool,
    task: Option<JoinHandle<u64>>,
    frames: Arc<watch::Sender<Option<CompositedFrame>>>,
}

impl CompositorHandle {
    /// Cancel the pending tick. Returns true only for the call that cancelled.
    pub fn stop(&self) -> bool {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.cancel.cancel();
        true
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub fn subscribe(&self) -> FrameReceiver {
        self.frames.subscribe()
    }

    pub fn latest(&self) -> Option<CompositedFrame> {
        self.frames.borrow().clone()
    }

    /// Wait for the loop to exit and return the number of frames produced
    pub async fn join(&mut self) -> u64 {
        let Some(task) = self.task.take() else {
            return 0;
        };
        match task.await {
            Ok(frames) => frames,
            Err(e) => {
                tracing::error!("Compositing task failed: {}", e);
                0
            }
        }
    }
}

impl Drop for CompositorHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compositor::{LayoutSnapshot, Rect, StaticLayout};
    use crate::mock::{MockVideoTrack, StillMatchVideo};
    use crate::overlay::StrokePoint;

    const NATIVE: Resolution = Resolution::new(64, 36);

    fn inputs(camera: CameraSlot, overlay: DrawingOverlay) -> CompositorInputs {
        CompositorInputs {
            match_video: Arc::new(StillMatchVideo::new(NATIVE, Rgba::rgb(0, 128, 0))),
            camera,
            overlay,
            layout: Arc::new(StaticLayout(LayoutSnapshot {
                match_video_box: Rect::new(0.0, 0.0, 32.0, 18.0),
                camera_box: Some(Rect::new(24.0, 12.0, 8.0, 6.0)),
            })),
        }
    }

    #[test]
    fn test_new_requires_metadata() {
        let mut i = inputs(CameraSlot::new(), DrawingOverlay::new(NATIVE));
        i.match_video = Arc::new(StillMatchVideo::without_metadata(Rgba::BLACK));
        assert!(matches!(
            Compositor::new(i),
            Err(CompositeError::GeometryUnknown)
        ));
    }

    #[test]
    fn test_ticks_are_deterministic() {
        let camera = CameraSlot::new();
        let track: Arc<dyn VideoTrack> =
            MockVideoTrack::new("cam-1", Resolution::new(16, 12), Rgba::rgb(200, 0, 0));
        camera.replace(Some(track));

        let mut compositor = Compositor::new(inputs(camera, DrawingOverlay::new(NATIVE))).unwrap();
        let a = compositor.tick().unwrap();
        let b = compositor.tick().unwrap();

        assert_eq!(a.surface.data(), b.surface.data());
        assert_eq!(b.sequence, 2);
        assert!(a.camera_drawn);
        // Camera box (24,12) at 2x lands on (48,24)
        assert_eq!(a.surface.pixel(50, 30), Some(Rgba::rgb(200, 0, 0)));
        assert_eq!(a.surface.pixel(10, 10), Some(Rgba::rgb(0, 128, 0)));
    }

    #[test]
    fn test_missing_camera_skips_layer() {
        let mut compositor =
            Compositor::new(inputs(CameraSlot::new(), DrawingOverlay::new(NATIVE))).unwrap();
        let frame = compositor.tick().unwrap();
        assert!(!frame.camera_drawn);
        assert_eq!(frame.surface.pixel(50, 30), Some(Rgba::rgb(0, 128, 0)));
    }

    #[test]
    fn test_clear_erases_strokes_next_tick() {
        let overlay = DrawingOverlay::new(Resolution::new(32, 18));
        let mut compositor = Compositor::new(inputs(CameraSlot::new(), overlay.clone())).unwrap();

        overlay.start_drawing();
        overlay
            .add_stroke(
                vec![StrokePoint::new(2.0, 2.0), StrokePoint::new(10.0, 2.0)],
                Rgba::WHITE,
                2.0,
            )
            .unwrap();
        let drawn = compositor.tick().unwrap();
        assert_eq!(drawn.surface.pixel(10, 4), Some(Rgba::WHITE));

        overlay.clear();
        let cleared = compositor.tick().unwrap();
        assert_eq!(cleared.surface.pixel(10, 4), Some(Rgba::rgb(0, 128, 0)));
    }

    #[test]
    fn test_strokes_hidden_when_not_drawing() {
        let overlay = DrawingOverlay::new(NATIVE);
        let mut compositor = Compositor::new(inputs(CameraSlot::new(), overlay.clone())).unwrap();

        overlay.start_drawing();
        overlay
            .add_stroke(vec![StrokePoint::new(5.0, 5.0)], Rgba::WHITE, 4.0)
            .unwrap();
        overlay.stop_drawing();

        let frame = compositor.tick().unwrap();
        assert_eq!(frame.surface.pixel(5, 5), Some(Rgba::rgb(0, 128, 0)));
    }

    #[tokio::test]
    async fn test_stop_cancels_once() {
        let compositor =
            Compositor::new(inputs(CameraSlot::new(), DrawingOverlay::new(NATIVE))).unwrap();
        let mut handle = compositor.spawn(Duration::from_millis(5));
        let mut frames = handle.subscribe();
        frames.changed().await.unwrap();

        assert!(handle.stop());
        assert!(!handle.stop());
        let produced = handle.join().await;
        assert!(produced >= 1);

        let last = handle.latest().map(|f| f.sequence);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(handle.latest().map(|f| f.sequence), last);
    }
}
