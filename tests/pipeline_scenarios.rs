//! End-to-end runs of `CameraInput` over the synthetic source.

mod common;

use std::thread;
use std::time::Duration;

use approx::assert_relative_eq;
use common::*;
use mirrorcap::capture::SyntheticSource;
use mirrorcap::landmarks::NUM_FACE_LANDMARKS;
use mirrorcap::{CameraInput, Collaborators, Error, Intrinsics, Lifecycle};

const SETTLE: Duration = Duration::from_secs(3);

#[test]
fn landmarks_are_lifted_with_constant_depth() {
    let config = test_config();
    let source = SyntheticSource::new().with_depth_mm(1000);
    let (detector, _control) = scripted_detector(FACE);

    let mut camera = CameraInput::start(
        &config,
        Box::new(source),
        Collaborators::default().with_detector(detector),
    )
    .unwrap();
    assert!(camera.capabilities().depth);
    assert!(camera.capabilities().landmarks);

    let state = camera.shared_state();
    assert!(wait_until(SETTLE, || state.latest_landmarks().is_some()));
    let landmarks = state.latest_landmarks().unwrap();
    camera.stop();

    let intr = Intrinsics::mirror_camera();
    assert_eq!(landmarks.len(), NUM_FACE_LANDMARKS);
    assert_eq!(landmarks.valid_count(), NUM_FACE_LANDMARKS);
    for (i, p) in landmarks.points_3d.iter().enumerate() {
        let p = p.expect("depth everywhere");
        let px = landmark_pixel(i);
        assert_relative_eq!(p.z, 1.0, epsilon = 1e-6);
        assert_relative_eq!(f64::from(p.x), (f64::from(px.x) - intr.cx) / intr.fx, epsilon = 1e-5);
        assert_relative_eq!(f64::from(p.y), (f64::from(px.y) - intr.cy) / intr.fy, epsilon = 1e-5);
    }
}

#[test]
fn zero_depth_keeps_2d_and_drops_3d() {
    let config = test_config();
    let source = SyntheticSource::new().with_depth_mm(0);
    let (detector, _control) = scripted_detector(FACE);

    let mut camera = CameraInput::start(
        &config,
        Box::new(source),
        Collaborators::default().with_detector(detector),
    )
    .unwrap();
    let state = camera.shared_state();
    assert!(wait_until(SETTLE, || state.latest_landmarks().is_some()));
    camera.stop();

    let landmarks = state.latest_landmarks().unwrap();
    assert_eq!(landmarks.points_2d.len(), NUM_FACE_LANDMARKS);
    assert_eq!(landmarks.points_3d.len(), NUM_FACE_LANDMARKS);
    assert_eq!(landmarks.valid_count(), 0);
}

#[test]
fn no_face_leaves_landmarks_unpublished() {
    let config = test_config();
    let (detector, control) = scripted_detector(NO_FACE);

    let mut camera = CameraInput::start(
        &config,
        Box::new(SyntheticSource::new().with_depth_mm(800)),
        Collaborators::default().with_detector(detector),
    )
    .unwrap();
    assert!(wait_until(SETTLE, || control.calls() >= 3));
    assert!(camera.shared_state().latest_landmarks().is_none());

    // A face appearing later is picked up, then kept while it is lost again
    control.set_mode(FACE);
    let state = camera.shared_state();
    assert!(wait_until(SETTLE, || state.latest_landmarks().is_some()));
    control.set_mode(NO_FACE);
    let kept = state.latest_landmarks().unwrap().frame_sequence;
    let calls = control.calls();
    assert!(wait_until(SETTLE, || control.calls() >= calls + 3));
    assert_eq!(state.latest_landmarks().unwrap().frame_sequence, kept);
    camera.stop();
}

#[test]
fn detector_errors_do_not_stop_the_pipeline() {
    let config = test_config();
    let (detector, control) = scripted_detector(FAIL);

    let mut camera = CameraInput::start(
        &config,
        Box::new(SyntheticSource::new().with_depth_mm(1000)),
        Collaborators::default().with_detector(detector),
    )
    .unwrap();
    assert!(wait_until(SETTLE, || camera.stats().detection.failures >= 3));
    assert!(camera.is_running());

    let frames_before = camera.stats().capture.published;
    assert!(wait_until(SETTLE, || camera.stats().capture.published > frames_before + 2));

    control.set_mode(FACE);
    let state = camera.shared_state();
    assert!(wait_until(SETTLE, || state.latest_landmarks().is_some()));
    camera.stop();
}

#[test]
fn stop_joins_and_releases_the_device() {
    let config = test_config();
    let source = SyntheticSource::new().with_depth_mm(1000);
    let probe = source.probe();
    let (detector, _control) = scripted_detector(FACE);

    let mut camera = CameraInput::start(
        &config,
        Box::new(source),
        Collaborators::default().with_detector(detector),
    )
    .unwrap();
    assert_eq!(camera.lifecycle(), Lifecycle::Running);
    assert!(probe.is_streaming());

    let state = camera.shared_state();
    assert!(wait_until(SETTLE, || state.latest_landmarks().is_some()));

    camera.stop();
    assert_eq!(camera.lifecycle(), Lifecycle::Stopped);
    assert!(!probe.is_streaming());
    assert_eq!(probe.stops(), 1);

    let writes = state.write_count();
    thread::sleep(Duration::from_millis(100));
    assert_eq!(state.write_count(), writes);

    // Second stop is a no-op
    camera.stop();
    assert_eq!(probe.stops(), 1);
    assert_eq!(camera.lifecycle(), Lifecycle::Stopped);
}

#[test]
fn drop_without_stop_still_releases() {
    let source = SyntheticSource::new();
    let probe = source.probe();
    let camera = CameraInput::start(&test_config(), Box::new(source), Collaborators::default()).unwrap();
    assert!(wait_until(SETTLE, || probe.frames() > 0));
    drop(camera);
    assert_eq!(probe.stops(), 1);
    assert!(!probe.is_streaming());
}

#[test]
fn start_failure_leaves_nothing_running() {
    let mut config = test_config();
    config.capture.fps = 0;
    let source = SyntheticSource::new();
    let probe = source.probe();

    let err = CameraInput::start(&config, Box::new(source), Collaborators::default()).unwrap_err();
    assert!(matches!(err, Error::Device(_)));
    thread::sleep(Duration::from_millis(20));
    assert_eq!(probe.polls(), 0);
}

#[test]
fn idle_capture_does_not_spin() {
    let config = test_config();
    let source = SyntheticSource::new().with_interval(Duration::from_millis(100));
    let probe = source.probe();

    let mut camera = CameraInput::start(&config, Box::new(source), Collaborators::default()).unwrap();
    thread::sleep(Duration::from_millis(500));
    camera.stop();

    // idle sleep is at least 1 ms, so well under one poll per millisecond
    assert!(probe.polls() < 600, "polled {} times", probe.polls());
    let stats = camera.stats();
    assert!(stats.capture.published >= 3);
    assert_eq!(stats.capture.published, probe.frames());
    assert!(stats.capture.idle > 0);
}

#[test]
fn render_tick_requests_drive_extrinsics() {
    let mut config = test_config();
    config.extrinsics.enabled = true;
    config.extrinsics.marker_size_m = 0.1;
    let intr = Intrinsics::mirror_camera();

    let mut camera = CameraInput::start(
        &config,
        Box::new(SyntheticSource::new()),
        Collaborators::default().with_marker_detector(FixedMarker::centred(&intr, 0.1, 0.5)),
    )
    .unwrap();
    assert!(camera.capabilities().extrinsics);

    let state = camera.shared_state();
    // No request, no update
    thread::sleep(Duration::from_millis(100));
    assert!(state.latest_extrinsics().is_none());

    assert!(wait_until(SETTLE, || {
        camera.request_extrinsics();
        state.latest_extrinsics().is_some()
    }));
    camera.stop();
    assert!(!camera.request_extrinsics());

    let ext = state.latest_extrinsics().unwrap();
    assert_eq!(ext.marker_id, 7);
    assert_relative_eq!(ext.matrix[(2, 3)], 0.5, epsilon = 1e-3);
    assert_relative_eq!(ext.matrix[(0, 3)], 0.0, epsilon = 1e-3);
    assert!(camera.stats().extrinsics.published >= 1);
}

#[test]
fn extrinsics_ignored_when_disabled() {
    let config = test_config();
    let intr = Intrinsics::mirror_camera();
    let mut camera = CameraInput::start(
        &config,
        Box::new(SyntheticSource::new()),
        Collaborators::default().with_marker_detector(FixedMarker::centred(&intr, 0.1, 0.5)),
    )
    .unwrap();
    assert!(!camera.capabilities().extrinsics);
    assert!(!camera.request_extrinsics());
    camera.stop();
}
