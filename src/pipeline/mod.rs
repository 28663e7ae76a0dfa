//! Free-running loop threads around a shared latest-value store.

pub mod camera;
pub mod capture_loop;
pub mod detection;
pub mod extrinsics;
pub mod state;
pub mod stats;

pub use camera::{CameraInput, Capabilities, Collaborators, Lifecycle, MAX_IDLE_SLEEP};
pub use detection::{DetectionOutcome, LandmarkWorker};
pub use extrinsics::{ExtrinsicsOutcome, ExtrinsicsTracker};
pub use state::{Extrinsics, RenderSnapshot, SharedFrameState};
pub use stats::{FpsMeter, LoopStats, PipelineStats};
