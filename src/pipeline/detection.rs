//! Detection thread: landmarks on the newest frame, lifted to 3D via depth.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use metrics::{counter, histogram};
use tracing::{debug, info, instrument, warn};

use super::state::SharedFrameState;
use super::stats::{FpsMeter, LoopCounters, PipelineCounters};
use crate::fitting::FaceFitter;
use crate::geometry::Intrinsics;
use crate::landmarks::{lift_to_3d, select_face, LandmarkDetector, Landmarks};
use crate::{DetectionConfig, Result};

/// What one detection step did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectionOutcome {
    /// Nothing captured yet
    NoFrame,
    /// Newest frame was already processed
    Stale,
    /// Frame processed, no face; previous landmarks kept
    NoFace,
    Published { valid_3d: usize },
}

/// Runs the detector collaborator against the shared state.
pub struct LandmarkWorker {
    detector: Box<dyn LandmarkDetector>,
    fitter: Option<Box<dyn FaceFitter>>,
    intrinsics: Intrinsics,
    min_confidence: f32,
    depth_scale_m: f64,
    depth_window: u32,
    last_sequence: Option<u64>,
}

impl LandmarkWorker {
    pub fn new(
        detector: Box<dyn LandmarkDetector>,
        fitter: Option<Box<dyn FaceFitter>>,
        intrinsics: Intrinsics,
        config: &DetectionConfig,
    ) -> Self {
        Self {
            detector,
            fitter,
            intrinsics,
            min_confidence: config.confidence_threshold,
            depth_scale_m: config.depth_scale_m,
            depth_window: config.depth_window.max(1),
            last_sequence: None,
        }
    }

    /// Process the newest frame once.
    ///
    /// A frame is attempted at most once, whether or not the detector
    /// succeeds on it.
    #[instrument(skip_all, level = "trace")]
    pub fn step(&mut self, state: &SharedFrameState) -> Result<DetectionOutcome> {
        let Some(frame) = state.latest_frame() else {
            return Ok(DetectionOutcome::NoFrame);
        };
        if self.last_sequence == Some(frame.sequence) {
            return Ok(DetectionOutcome::Stale);
        }
        self.last_sequence = Some(frame.sequence);

        let started = Instant::now();
        let faces = self.detector.detect(&frame.color)?;
        let Some(face) = select_face(&faces, self.min_confidence) else {
            return Ok(DetectionOutcome::NoFace);
        };

        let points_2d = self.detector.predict_landmarks(&frame.color, &face)?;
        let points_3d = lift_to_3d(
            &points_2d,
            frame.depth.as_ref(),
            &self.intrinsics,
            self.depth_scale_m,
            self.depth_window,
        );
        let landmarks = Landmarks {
            frame_sequence: frame.sequence,
            face,
            points_2d,
            points_3d,
            detected_at: Instant::now(),
        };
        let valid_3d = landmarks.valid_count();
        histogram!("detection_time_ms").record(started.elapsed().as_secs_f64() * 1000.0);

        // Fit before publishing so the clone is only paid when fitting is on
        let fit = match self.fitter.as_mut() {
            Some(fitter) => match fitter.fit(&landmarks) {
                Ok(fit) => fit,
                Err(e) => {
                    warn!("face fit failed: {}", e);
                    None
                }
            },
            None => None,
        };

        state.publish_landmarks(landmarks);
        if let Some(fit) = fit {
            state.publish_face_fit(fit);
        }
        debug!(sequence = frame.sequence, faces = faces.len(), valid_3d, "landmarks published");
        Ok(DetectionOutcome::Published { valid_3d })
    }
}

fn run(
    mut worker: LandmarkWorker,
    state: &SharedFrameState,
    running: &AtomicBool,
    stats: &LoopCounters,
    idle_sleep: Duration,
    fps_window: usize,
) {
    let mut fps = FpsMeter::new(fps_window);
    while running.load(Ordering::Acquire) {
        stats.record_iteration();
        match worker.step(state) {
            Ok(DetectionOutcome::NoFrame | DetectionOutcome::Stale) => {
                stats.record_idle();
                thread::sleep(idle_sleep);
            }
            Ok(DetectionOutcome::NoFace) => {}
            Ok(DetectionOutcome::Published { .. }) => {
                fps.tick(Instant::now());
                stats.set_rate(fps.fps());
                stats.record_published();
            }
            Err(e) => {
                warn!("detection failed: {}", e);
                stats.record_failure();
                counter!("detection_failures").increment(1);
                thread::sleep(idle_sleep);
            }
        }
    }
}

pub fn spawn(
    worker: LandmarkWorker,
    state: Arc<SharedFrameState>,
    running: Arc<AtomicBool>,
    counters: Arc<PipelineCounters>,
    idle_sleep: Duration,
    fps_window: usize,
) -> Result<JoinHandle<()>> {
    let handle = thread::Builder::new()
        .name("mirrorcap-detect".into())
        .spawn(move || {
            info!("detection loop started");
            run(worker, &state, &running, &counters.detection, idle_sleep, fps_window);
            info!(published = counters.detection.snapshot().published, "detection loop exited");
        })?;
    Ok(handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{ColorImage, DepthImage, FrameSample, PixelFormat};
    use crate::landmarks::{FaceBox, NUM_FACE_LANDMARKS};
    use crate::Error;
    use nalgebra::Point2;

    /// Returns one face when `faces` is set, fails when `fail` is set
    struct Scripted {
        faces: bool,
        fail: bool,
    }

    impl LandmarkDetector for Scripted {
        fn detect(&mut self, _image: &ColorImage) -> Result<Vec<FaceBox>> {
            if self.fail {
                return Err(Error::Detection("scripted failure".into()));
            }
            Ok(if self.faces {
                vec![FaceBox::new(200.0, 100.0, 200.0, 240.0, 0.99)]
            } else {
                vec![]
            })
        }

        fn predict_landmarks(&mut self, _image: &ColorImage, face: &FaceBox) -> Result<Vec<Point2<f32>>> {
            Ok((0..NUM_FACE_LANDMARKS)
                .map(|i| Point2::new(face.x + i as f32, face.y + i as f32))
                .collect())
        }
    }

    fn publish(state: &SharedFrameState, seq: u64, depth_mm: u16) {
        state.publish_frame(FrameSample {
            color: ColorImage::new(640, 480, PixelFormat::Rgb24, vec![0u8; 640 * 480 * 3]).unwrap(),
            depth: Some(DepthImage::filled(640, 480, depth_mm)),
            sequence: seq,
            captured_at: Instant::now(),
            device_timestamp: None,
        });
    }

    fn worker(faces: bool, fail: bool) -> LandmarkWorker {
        LandmarkWorker::new(
            Box::new(Scripted { faces, fail }),
            None,
            Intrinsics::mirror_camera(),
            &DetectionConfig::default(),
        )
    }

    #[test]
    fn each_frame_is_processed_once() {
        let state = SharedFrameState::new();
        let mut w = worker(true, false);
        assert_eq!(w.step(&state).unwrap(), DetectionOutcome::NoFrame);

        publish(&state, 1, 1000);
        assert_eq!(
            w.step(&state).unwrap(),
            DetectionOutcome::Published {
                valid_3d: NUM_FACE_LANDMARKS
            }
        );
        assert_eq!(w.step(&state).unwrap(), DetectionOutcome::Stale);
        assert_eq!(state.latest_landmarks().unwrap().frame_sequence, 1);
    }

    #[test]
    fn no_face_keeps_previous_landmarks() {
        let state = SharedFrameState::new();
        let mut w = worker(true, false);
        publish(&state, 1, 1000);
        w.step(&state).unwrap();

        let mut w = worker(false, false);
        publish(&state, 2, 1000);
        assert_eq!(w.step(&state).unwrap(), DetectionOutcome::NoFace);
        assert_eq!(state.latest_landmarks().unwrap().frame_sequence, 1);
    }

    #[test]
    fn failure_does_not_retry_the_same_frame() {
        let state = SharedFrameState::new();
        let mut w = worker(true, true);
        publish(&state, 1, 1000);
        assert!(w.step(&state).is_err());
        assert_eq!(w.step(&state).unwrap(), DetectionOutcome::Stale);
        assert!(state.latest_landmarks().is_none());
    }
}
