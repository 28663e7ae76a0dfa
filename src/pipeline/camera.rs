//! `CameraInput`: owns the source and the loop threads for one camera.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use flume::{Sender, TrySendError};
use tracing::{error, info, warn};

use super::capture_loop::{self, CaptureLoopOptions};
use super::detection::{self, LandmarkWorker};
use super::extrinsics::{self, ExtrinsicsTracker, Trigger};
use super::state::{RenderSnapshot, SharedFrameState};
use super::stats::{PipelineCounters, PipelineStats};
use crate::capture::FrameSource;
use crate::fiducial::MarkerDetector;
use crate::fitting::FaceFitter;
use crate::geometry::Intrinsics;
use crate::landmarks::LandmarkDetector;
use crate::{Config, ExtrinsicsTrigger, Result};

/// Longest idle sleep any loop takes
pub const MAX_IDLE_SLEEP: Duration = Duration::from_millis(10);

/// Lifecycle of a [`CameraInput`]. Only moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Lifecycle {
    Constructing = 0,
    Running = 1,
    Stopping = 2,
    Stopped = 3,
}

impl Lifecycle {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Constructing,
            1 => Self::Running,
            2 => Self::Stopping,
            _ => Self::Stopped,
        }
    }
}

/// Optional external collaborators.
#[derive(Default)]
pub struct Collaborators {
    pub detector: Option<Box<dyn LandmarkDetector>>,
    pub face_fitter: Option<Box<dyn FaceFitter>>,
    pub marker_detector: Option<Box<dyn MarkerDetector>>,
}

impl Collaborators {
    pub fn with_detector(mut self, detector: impl LandmarkDetector + 'static) -> Self {
        self.detector = Some(Box::new(detector));
        self
    }

    pub fn with_face_fitter(mut self, fitter: impl FaceFitter + 'static) -> Self {
        self.face_fitter = Some(Box::new(fitter));
        self
    }

    pub fn with_marker_detector(mut self, detector: impl MarkerDetector + 'static) -> Self {
        self.marker_detector = Some(Box::new(detector));
        self
    }
}

/// What this camera instance is doing
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub depth: bool,
    pub landmarks: bool,
    pub face_fit: bool,
    pub extrinsics: bool,
}

/// One camera with its capture, detection and extrinsics threads.
///
/// Threads start in [`CameraInput::start`] and are joined by
/// [`CameraInput::stop`] or on drop; the device is released only after
/// every thread has exited.
pub struct CameraInput {
    state: Arc<SharedFrameState>,
    running: Arc<AtomicBool>,
    lifecycle: AtomicU8,
    counters: Arc<PipelineCounters>,

    capture: Option<JoinHandle<Box<dyn FrameSource>>>,
    detection: Option<JoinHandle<()>>,
    extrinsics: Option<JoinHandle<()>>,
    extrinsics_requests: Option<Sender<()>>,

    intrinsics: Intrinsics,
    capabilities: Capabilities,
}

impl CameraInput {
    /// Start the source, then the loops.
    ///
    /// Fails with [`crate::Error::Device`] if the source cannot start; in
    /// that case no thread is left behind.
    pub fn start(config: &Config, mut source: Box<dyn FrameSource>, collaborators: Collaborators) -> Result<Self> {
        let capture_cfg = &config.capture;
        source.start(capture_cfg.width, capture_cfg.height, capture_cfg.fps)?;
        let intrinsics = source.intrinsics();
        info!(
            source = source.name(),
            width = intrinsics.width,
            height = intrinsics.height,
            depth = source.has_depth(),
            "camera started"
        );

        let idle_sleep = Duration::from_millis(config.pipeline.idle_sleep_ms)
            .clamp(Duration::from_millis(1), MAX_IDLE_SLEEP);
        let fps_window = config.pipeline.fps_window;

        let Collaborators {
            detector,
            face_fitter,
            marker_detector,
        } = collaborators;
        let face_fitter = face_fitter.filter(|_| config.detection.enable_face_fit);
        let marker_detector = marker_detector.filter(|_| config.extrinsics.enabled);

        let mut camera = Self {
            state: Arc::new(SharedFrameState::new()),
            running: Arc::new(AtomicBool::new(true)),
            lifecycle: AtomicU8::new(Lifecycle::Constructing as u8),
            counters: Arc::new(PipelineCounters::default()),
            capture: None,
            detection: None,
            extrinsics: None,
            extrinsics_requests: None,
            intrinsics,
            capabilities: Capabilities {
                depth: source.has_depth(),
                landmarks: detector.is_some(),
                face_fit: detector.is_some() && face_fitter.is_some(),
                extrinsics: marker_detector.is_some(),
            },
        };

        // From here on, an early return drops `camera`, which joins whatever started
        camera.capture = Some(capture_loop::spawn(
            source,
            Arc::clone(&camera.state),
            Arc::clone(&camera.running),
            Arc::clone(&camera.counters),
            CaptureLoopOptions {
                idle_sleep,
                pin_core: config.pipeline.pin_capture_core,
                fps_window,
            },
        )?);
        camera.set_lifecycle(Lifecycle::Running);

        if let Some(detector) = detector {
            let worker = LandmarkWorker::new(detector, face_fitter, intrinsics, &config.detection);
            camera.detection = Some(detection::spawn(
                worker,
                Arc::clone(&camera.state),
                Arc::clone(&camera.running),
                Arc::clone(&camera.counters),
                idle_sleep,
                fps_window,
            )?);
        }

        if let Some(marker_detector) = marker_detector {
            let tracker = ExtrinsicsTracker::new(marker_detector, intrinsics, config.extrinsics.marker_size_m);
            let trigger = match config.extrinsics.trigger {
                ExtrinsicsTrigger::RenderTick => {
                    let (tx, rx) = flume::bounded(1);
                    camera.extrinsics_requests = Some(tx);
                    Trigger::Requests(rx)
                }
                ExtrinsicsTrigger::Interval => {
                    Trigger::Interval(Duration::from_millis(config.extrinsics.interval_ms.max(1)))
                }
            };
            camera.extrinsics = Some(extrinsics::spawn(
                tracker,
                trigger,
                Arc::clone(&camera.state),
                Arc::clone(&camera.running),
                Arc::clone(&camera.counters),
            )?);
        }

        Ok(camera)
    }

    fn set_lifecycle(&self, to: Lifecycle) {
        self.lifecycle.store(to as u8, Ordering::Release);
    }

    pub fn lifecycle(&self) -> Lifecycle {
        Lifecycle::from_u8(self.lifecycle.load(Ordering::Acquire))
    }

    pub fn is_running(&self) -> bool {
        self.lifecycle() == Lifecycle::Running
    }

    /// Ask the extrinsics thread for one update. Never blocks; a request
    /// already pending absorbs this one.
    pub fn request_extrinsics(&self) -> bool {
        match self.extrinsics_requests.as_ref().map(|tx| tx.try_send(())) {
            Some(Ok(())) => true,
            Some(Err(TrySendError::Full(()))) | None => false,
            Some(Err(TrySendError::Disconnected(()))) => false,
        }
    }

    /// Signal every loop, join them, then release the device. Idempotent.
    pub fn stop(&mut self) {
        if self.lifecycle() >= Lifecycle::Stopping && self.capture.is_none() {
            return;
        }
        self.set_lifecycle(Lifecycle::Stopping);
        self.running.store(false, Ordering::Release);
        self.extrinsics_requests = None;

        for (name, handle) in [("detection", self.detection.take()), ("extrinsics", self.extrinsics.take())] {
            if let Some(handle) = handle {
                if handle.join().is_err() {
                    error!("{name} thread panicked");
                }
            }
        }
        if let Some(handle) = self.capture.take() {
            match handle.join() {
                Ok(mut source) => source.stop(),
                Err(_) => error!("capture thread panicked; device released during unwind"),
            }
        }

        self.set_lifecycle(Lifecycle::Stopped);
        let stats = self.counters.snapshot();
        info!(
            frames = stats.capture.published,
            detections = stats.detection.published,
            "camera stopped"
        );
    }

    pub fn shared_state(&self) -> Arc<SharedFrameState> {
        Arc::clone(&self.state)
    }

    pub fn snapshot(&self) -> RenderSnapshot {
        self.state.snapshot()
    }

    pub fn stats(&self) -> PipelineStats {
        self.counters.snapshot()
    }

    pub fn intrinsics(&self) -> Intrinsics {
        self.intrinsics
    }

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }
}

impl Drop for CameraInput {
    fn drop(&mut self) {
        if self.lifecycle() != Lifecycle::Stopped {
            warn!("CameraInput dropped without stop(), shutting down");
            self.stop();
        }
    }
}

impl fmt::Debug for CameraInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CameraInput")
            .field("lifecycle", &self.lifecycle())
            .field("intrinsics", &self.intrinsics)
            .field("capabilities", &self.capabilities)
            .finish()
    }
}
