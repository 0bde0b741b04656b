use atelier_review::capture::{MediaTrack, VideoTrack};
use atelier_review::compositor::{LayoutSnapshot, Rect, Rgba, SharedLayout, Surface};
use atelier_review::mock::{MockEncoder, MockPlatform, MockUploader, StillMatchVideo};
use atelier_review::{
    ReviewConfig, ReviewSession, Resolution, SessionCollaborators, SessionEventKind,
    SessionPhase, StrokePoint, SwitchRequest,
};
use std::sync::Arc;
use std::time::Duration;

const NATIVE: Resolution = Resolution::new(48, 27);
const PITCH: Rgba = Rgba::rgb(10, 120, 30);

struct Rig {
    session: ReviewSession,
    platform: MockPlatform,
    layout: SharedLayout,
    uploader: MockUploader,
}

fn rig() -> Rig {
    atelier_review::init_tracing();

    let platform = MockPlatform::with_default_devices();
    let uploader = MockUploader::new();
    // Rendered at native size
    let layout = SharedLayout::new(LayoutSnapshot {
        match_video_box: Rect::new(100.0, 50.0, 48.0, 27.0),
        camera_box: Some(Rect::new(136.0, 65.0, 12.0, 12.0)),
    });
    let config = ReviewConfig {
        resolution: Resolution::VGA,
        refresh_hz: 100,
        timeslice_ms: 15,
        overlay_resolution: Resolution::new(96, 54),
        ..Default::default()
    };
    let session = ReviewSession::new(
        "atelier-7",
        config,
        SessionCollaborators {
            platform: Arc::new(platform.clone()),
            match_video: Arc::new(StillMatchVideo::new(NATIVE, PITCH)),
            layout: Arc::new(layout.clone()),
            encoder: Arc::new(MockEncoder::supporting(&["video/mp4"])),
            uploader: Arc::new(uploader.clone()),
        },
    )
    .unwrap();

    Rig {
        session,
        platform,
        layout,
        uploader,
    }
}

fn final_frame(data: &[u8]) -> Surface {
    let len = NATIVE.pixel_count() * 4;
    Surface::from_rgba(NATIVE.width, NATIVE.height, data[data.len() - len..].to_vec()).unwrap()
}

// ============================================================================
// Scenarios
// ============================================================================

#[tokio::test]
async fn switch_to_hd_before_recording_releases_vga_camera() {
    let mut rig = rig();
    let grant = rig.session.request_media().await.unwrap();
    let vga = grant.video.unwrap();
    assert_eq!(vga.resolution(), Some(Resolution::VGA));

    rig.session
        .switch_source(SwitchRequest {
            resolution: Some(Resolution::HD),
            ..Default::default()
        })
        .await
        .unwrap();
    assert!(!vga.is_live());
    assert_eq!(rig.platform.live_video_tracks(), 1);

    let camera = rig.session.media().camera_slot().current().unwrap();
    assert_eq!(camera.resolution(), Some(Resolution::HD));

    rig.session.start_recording().await.unwrap();
    tokio::time::sleep(Duration::from_millis(40)).await;
    let artifact = rig.session.stop_recording().await.unwrap();

    assert_eq!(artifact.mime_type(), "video/mp4");
    assert_eq!(artifact.len() % (NATIVE.pixel_count() * 4), 0);
    assert_eq!(rig.platform.overlap_violations(), 0);
}

#[tokio::test]
async fn cleared_strokes_do_not_reach_the_artifact() {
    let mut rig = rig();
    let overlay = rig.session.overlay();
    rig.session.request_media().await.unwrap();
    rig.session.start_recording().await.unwrap();

    // Overlay is twice the native size
    overlay.start_drawing();
    overlay
        .add_stroke_hex(
            vec![StrokePoint::new(4.0, 8.0), StrokePoint::new(40.0, 8.0)],
            "#ff0000",
            4.0,
        )
        .unwrap();
    overlay
        .add_stroke_hex(
            vec![StrokePoint::new(4.0, 20.0), StrokePoint::new(40.0, 20.0)],
            "#00ff00",
            4.0,
        )
        .unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;
    overlay.clear();
    overlay
        .add_stroke_hex(
            vec![StrokePoint::new(4.0, 40.0), StrokePoint::new(40.0, 40.0)],
            "#0000ff",
            4.0,
        )
        .unwrap();
    tokio::time::sleep(Duration::from_millis(40)).await;

    let artifact = rig.session.stop_recording().await.unwrap();
    let frame = final_frame(&artifact.data());
    assert_eq!(frame.pixel(10, 4), Some(PITCH));
    assert_eq!(frame.pixel(10, 10), Some(PITCH));
    assert_eq!(frame.pixel(10, 20), Some(Rgba::rgb(0, 0, 255)));
}

#[tokio::test]
async fn dragging_the_camera_moves_it_in_the_recording() {
    let mut rig = rig();
    rig.session.request_media().await.unwrap();
    rig.session.start_recording().await.unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;

    // (36, 15) natively; drag it to the top-left corner
    rig.layout.move_camera_by(-36.0, -15.0);
    tokio::time::sleep(Duration::from_millis(40)).await;

    let artifact = rig.session.stop_recording().await.unwrap();
    let frame = final_frame(&artifact.data());
    assert_ne!(frame.pixel(2, 2), Some(PITCH));
    assert_eq!(frame.pixel(40, 20), Some(PITCH));
}

#[tokio::test]
async fn full_review_is_submitted_once() {
    let mut rig = rig();
    let mut events = rig.session.subscribe();

    rig.session.request_media().await.unwrap();
    rig.session.start_recording().await.unwrap();
    tokio::time::sleep(Duration::from_millis(40)).await;
    rig.session.pump().unwrap();
    assert!(rig.session.status().chunk_count > 0);

    let artifact = rig.session.stop_recording().await.unwrap();
    rig.session.submit().await.unwrap();
    assert_eq!(rig.session.phase(), SessionPhase::Done);
    assert_eq!(rig.uploader.calls().len(), 1);
    assert_eq!(rig.uploader.calls()[0].bytes, artifact.len());

    let mut phases = Vec::new();
    while let Ok(event) = events.try_recv() {
        assert_eq!(event.session_id, rig.session.id());
        if let SessionEventKind::PhaseChanged { to, .. } = event.kind {
            phases.push(to);
        }
    }
    assert_eq!(
        phases,
        vec![
            SessionPhase::MediaRequested,
            SessionPhase::MediaGranted,
            SessionPhase::Recording,
            SessionPhase::RecordingComplete,
            SessionPhase::Submitting,
            SessionPhase::Done,
        ]
    );
}
