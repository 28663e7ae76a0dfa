//! Latest-value store shared by the loop threads and the render thread.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use arc_swap::ArcSwapOption;
use nalgebra::Matrix4;

use crate::capture::FrameSample;
use crate::fitting::FaceFit;
use crate::landmarks::Landmarks;

/// Marker -> camera transform from the most recent successful marker detection.
#[derive(Debug, Clone)]
pub struct Extrinsics {
    pub matrix: Matrix4<f64>,
    pub marker_id: u32,
    pub frame_sequence: u64,
    pub updated_at: Instant,
}

/// Everything a render tick needs, read without blocking any producer.
#[derive(Debug, Clone, Default)]
pub struct RenderSnapshot {
    pub frame: Option<Arc<FrameSample>>,
    pub landmarks: Option<Arc<Landmarks>>,
    pub extrinsics: Option<Arc<Extrinsics>>,
    pub face_fit: Option<Arc<FaceFit>>,
}

/// One slot per field, each with a single writer.
///
/// Writers build the value completely, then swap the pointer in; readers get
/// an `Arc` to a value that is never mutated afterwards. There is no queue:
/// each publish replaces the previous value.
#[derive(Debug)]
pub struct SharedFrameState {
    frame: ArcSwapOption<FrameSample>,
    landmarks: ArcSwapOption<Landmarks>,
    extrinsics: ArcSwapOption<Extrinsics>,
    face_fit: ArcSwapOption<FaceFit>,
    /// Bumped on every publish to any slot
    writes: AtomicU64,
}

impl SharedFrameState {
    pub fn new() -> Self {
        Self {
            frame: ArcSwapOption::empty(),
            landmarks: ArcSwapOption::empty(),
            extrinsics: ArcSwapOption::empty(),
            face_fit: ArcSwapOption::empty(),
            writes: AtomicU64::new(0),
        }
    }

    fn bump(&self) {
        self.writes.fetch_add(1, Ordering::Release);
    }

    pub fn publish_frame(&self, sample: FrameSample) {
        self.frame.store(Some(Arc::new(sample)));
        self.bump();
    }

    pub fn latest_frame(&self) -> Option<Arc<FrameSample>> {
        self.frame.load_full()
    }

    /// Sequence of the newest frame without cloning the `Arc`.
    pub fn latest_frame_sequence(&self) -> Option<u64> {
        let guard = self.frame.load();
        Option::as_ref(&*guard).map(|f| f.sequence)
    }

    pub fn publish_landmarks(&self, landmarks: Landmarks) {
        self.landmarks.store(Some(Arc::new(landmarks)));
        self.bump();
    }

    pub fn latest_landmarks(&self) -> Option<Arc<Landmarks>> {
        self.landmarks.load_full()
    }

    pub fn publish_extrinsics(&self, extrinsics: Extrinsics) {
        self.extrinsics.store(Some(Arc::new(extrinsics)));
        self.bump();
    }

    pub fn latest_extrinsics(&self) -> Option<Arc<Extrinsics>> {
        self.extrinsics.load_full()
    }

    pub fn publish_face_fit(&self, fit: FaceFit) {
        self.face_fit.store(Some(Arc::new(fit)));
        self.bump();
    }

    pub fn latest_face_fit(&self) -> Option<Arc<FaceFit>> {
        self.face_fit.load_full()
    }

    pub fn snapshot(&self) -> RenderSnapshot {
        RenderSnapshot {
            frame: self.latest_frame(),
            landmarks: self.latest_landmarks(),
            extrinsics: self.latest_extrinsics(),
            face_fit: self.latest_face_fit(),
        }
    }

    /// Total publishes across all slots
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Acquire)
    }
}

impl Default for SharedFrameState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{ColorImage, PixelFormat};

    fn sample(seq: u64) -> FrameSample {
        FrameSample {
            color: ColorImage::new(2, 1, PixelFormat::Rgb24, vec![seq as u8; 6]).unwrap(),
            depth: None,
            sequence: seq,
            captured_at: Instant::now(),
            device_timestamp: None,
        }
    }

    #[test]
    fn starts_empty() {
        let state = SharedFrameState::new();
        let snap = state.snapshot();
        assert!(snap.frame.is_none() && snap.landmarks.is_none());
        assert!(snap.extrinsics.is_none() && snap.face_fit.is_none());
        assert_eq!(state.write_count(), 0);
    }

    #[test]
    fn latest_write_wins_and_old_snapshots_stay_valid() {
        let state = SharedFrameState::new();
        state.publish_frame(sample(1));
        let held = state.latest_frame().unwrap();
        state.publish_frame(sample(2));

        assert_eq!(held.sequence, 1);
        assert_eq!(held.color.as_bytes(), &[1u8; 6]);
        assert_eq!(state.latest_frame_sequence(), Some(2));
        assert_eq!(state.write_count(), 2);
    }

    #[test]
    fn slots_are_independent() {
        let state = SharedFrameState::new();
        state.publish_extrinsics(Extrinsics {
            matrix: Matrix4::identity(),
            marker_id: 3,
            frame_sequence: 9,
            updated_at: Instant::now(),
        });
        assert!(state.latest_frame().is_none());
        assert_eq!(state.latest_extrinsics().unwrap().marker_id, 3);
    }
}
