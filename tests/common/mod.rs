#![allow(dead_code)]

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use image::GrayImage;
use mirrorcap::capture::ColorImage;
use mirrorcap::fiducial::{MarkerDetection, MarkerDetector};
use mirrorcap::landmarks::{FaceBox, LandmarkDetector, NUM_FACE_LANDMARKS};
use mirrorcap::{Config, Error, Intrinsics, Result};
use nalgebra::{Point2, Point3};

pub const FACE: u8 = 0;
pub const NO_FACE: u8 = 1;
pub const FAIL: u8 = 2;

/// Detector double whose behaviour can be switched while the loop runs.
pub struct ScriptedDetector {
    mode: Arc<AtomicU8>,
    calls: Arc<AtomicU64>,
}

/// Handle kept by the test after the detector moves into the pipeline.
#[derive(Clone)]
pub struct DetectorControl {
    mode: Arc<AtomicU8>,
    calls: Arc<AtomicU64>,
}

impl DetectorControl {
    pub fn set_mode(&self, mode: u8) {
        self.mode.store(mode, Ordering::Release);
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Acquire)
    }
}

pub fn scripted_detector(mode: u8) -> (ScriptedDetector, DetectorControl) {
    let mode = Arc::new(AtomicU8::new(mode));
    let calls = Arc::new(AtomicU64::new(0));
    (
        ScriptedDetector {
            mode: Arc::clone(&mode),
            calls: Arc::clone(&calls),
        },
        DetectorControl { mode, calls },
    )
}

/// Landmark `i` sits at a fixed pixel inside a 640x480 image.
pub fn landmark_pixel(i: usize) -> Point2<f32> {
    Point2::new(200.0 + (i % 17) as f32 * 12.0, 150.0 + (i / 17) as f32 * 30.0)
}

impl LandmarkDetector for ScriptedDetector {
    fn detect(&mut self, _image: &ColorImage) -> Result<Vec<FaceBox>> {
        self.calls.fetch_add(1, Ordering::AcqRel);
        match self.mode.load(Ordering::Acquire) {
            FACE => Ok(vec![FaceBox::new(180.0, 130.0, 260.0, 260.0, 0.98)]),
            NO_FACE => Ok(vec![]),
            _ => Err(Error::Detection("scripted failure".into())),
        }
    }

    fn predict_landmarks(&mut self, _image: &ColorImage, _face: &FaceBox) -> Result<Vec<Point2<f32>>> {
        Ok((0..NUM_FACE_LANDMARKS).map(landmark_pixel).collect())
    }
}

/// Reports the same square marker on every frame.
pub struct FixedMarker {
    detection: MarkerDetection,
}

impl FixedMarker {
    /// Marker of side `size` m centred on the optical axis at `distance` m.
    pub fn centred(intrinsics: &Intrinsics, size: f64, distance: f64) -> Self {
        let h = size / 2.0;
        let corners = [(-h, -h), (h, -h), (h, h), (-h, h)].map(|(x, y)| {
            let p = intrinsics
                .project(&Point3::new(x, y, distance))
                .expect("marker in front of camera");
            Point2::new(p.x as f32, p.y as f32)
        });
        Self {
            detection: MarkerDetection {
                id: 7,
                corners,
                hamming: 0,
            },
        }
    }
}

impl MarkerDetector for FixedMarker {
    fn extract_markers(&mut self, _gray: &GrayImage) -> Result<Vec<MarkerDetection>> {
        Ok(vec![self.detection.clone()])
    }
}

/// 640x480 at 30 fps from the synthetic backend.
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.capture.width = 640;
    config.capture.height = 480;
    config.capture.fps = 30;
    config.pipeline.idle_sleep_ms = 2;
    config
}

/// Poll `f` until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut f: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if f() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    f()
}
