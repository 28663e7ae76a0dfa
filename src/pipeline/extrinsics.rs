//! Extrinsics thread: marker pose from the newest color frame.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use flume::{Receiver, RecvTimeoutError};
use metrics::{counter, histogram};
use tracing::{debug, info, warn};

use super::state::{Extrinsics, SharedFrameState};
use super::stats::{LoopCounters, PipelineCounters};
use crate::fiducial::{MarkerDetector, MarkerPose};
use crate::geometry::Intrinsics;
use crate::Result;

/// What one marker update did
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ExtrinsicsOutcome {
    NoFrame,
    /// Newest frame already examined
    Unchanged,
    /// No marker in view; previous extrinsics kept
    NoMarker,
    Updated(MarkerPose),
}

/// How updates are triggered
pub enum Trigger {
    /// One update per request from the render thread
    Requests(Receiver<()>),
    Interval(Duration),
}

pub struct ExtrinsicsTracker {
    detector: Box<dyn MarkerDetector>,
    intrinsics: Intrinsics,
    marker_size_m: f64,
    last_sequence: Option<u64>,
}

impl ExtrinsicsTracker {
    pub fn new(detector: Box<dyn MarkerDetector>, intrinsics: Intrinsics, marker_size_m: f64) -> Self {
        Self {
            detector,
            intrinsics,
            marker_size_m,
            last_sequence: None,
        }
    }

    /// Detect markers on the newest frame and publish the first one's pose.
    pub fn update(&mut self, state: &SharedFrameState) -> Result<ExtrinsicsOutcome> {
        let Some(frame) = state.latest_frame() else {
            return Ok(ExtrinsicsOutcome::NoFrame);
        };
        if self.last_sequence == Some(frame.sequence) {
            return Ok(ExtrinsicsOutcome::Unchanged);
        }
        self.last_sequence = Some(frame.sequence);

        let gray = frame.color.to_gray();
        let started = Instant::now();
        let markers = self.detector.extract_markers(&gray)?;
        let dt = started.elapsed();
        histogram!("marker_detection_ms").record(dt.as_secs_f64() * 1000.0);
        debug!("{} markers detected in {:.3} seconds", markers.len(), dt.as_secs_f64());

        let Some(first) = markers.first() else {
            return Ok(ExtrinsicsOutcome::NoMarker);
        };
        let pose = MarkerPose::from_detection(first, self.marker_size_m, &self.intrinsics)?;

        state.publish_extrinsics(Extrinsics {
            matrix: pose.to_matrix(),
            marker_id: pose.id,
            frame_sequence: frame.sequence,
            updated_at: Instant::now(),
        });

        let t = pose.translation;
        let (yaw, pitch, roll) = pose.yaw_pitch_roll();
        info!(
            marker = pose.id,
            "translation (x, y, z) = ({:.3}, {:.3}, {:.3}) m, (yaw, pitch, roll) = ({:.3}, {:.3}, {:.3}) rad",
            t.x,
            t.y,
            t.z,
            yaw,
            pitch,
            roll
        );
        Ok(ExtrinsicsOutcome::Updated(pose))
    }
}

fn record(outcome: Result<ExtrinsicsOutcome>, stats: &LoopCounters) {
    stats.record_iteration();
    match outcome {
        Ok(ExtrinsicsOutcome::Updated(_)) => stats.record_published(),
        Ok(ExtrinsicsOutcome::NoMarker) => debug!("no marker in view"),
        Ok(_) => stats.record_idle(),
        Err(e) => {
            warn!("marker pose failed: {}", e);
            stats.record_failure();
            counter!("extrinsics_failures").increment(1);
        }
    }
}

/// Poll period used to notice shutdown while waiting
const WAKE_PERIOD: Duration = Duration::from_millis(10);

fn run(
    mut tracker: ExtrinsicsTracker,
    trigger: Trigger,
    state: &SharedFrameState,
    running: &AtomicBool,
    stats: &LoopCounters,
) {
    match trigger {
        Trigger::Requests(rx) => {
            while running.load(Ordering::Acquire) {
                match rx.recv_timeout(WAKE_PERIOD) {
                    Ok(()) => record(tracker.update(state), stats),
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }
        }
        Trigger::Interval(period) => {
            let mut next = Instant::now();
            while running.load(Ordering::Acquire) {
                let now = Instant::now();
                if now >= next {
                    record(tracker.update(state), stats);
                    next = now + period;
                    continue;
                }
                thread::sleep((next - now).min(WAKE_PERIOD));
            }
        }
    }
}

pub fn spawn(
    tracker: ExtrinsicsTracker,
    trigger: Trigger,
    state: Arc<SharedFrameState>,
    running: Arc<AtomicBool>,
    counters: Arc<PipelineCounters>,
) -> Result<JoinHandle<()>> {
    let handle = thread::Builder::new()
        .name("mirrorcap-extrinsics".into())
        .spawn(move || {
            info!("extrinsics loop started");
            run(tracker, trigger, &state, &running, &counters.extrinsics);
            info!("extrinsics loop exited");
        })?;
    Ok(handle)
}
