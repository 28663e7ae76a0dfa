//! Camera boundary: anything that can hand out paired color + depth frames.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::{debug, info};

use super::frame::{ColorImage, DepthImage, FrameSample, PixelFormat};
use crate::geometry::Intrinsics;
use crate::{Error, Result};

/// A camera pipeline producing color frames and, optionally, aligned depth.
///
/// All methods are called from the capture thread only. `poll_frame` must
/// not block: it returns `Ok(None)` when the device has nothing new.
pub trait FrameSource: Send {
    /// Configure and start streaming. Failure is fatal for this source.
    fn start(&mut self, width: u32, height: u32, target_fps: u32) -> Result<()>;

    /// Newest unseen frame pair, or `None` if nothing arrived since the last call.
    fn poll_frame(&mut self) -> Result<Option<FrameSample>>;

    /// Release the device. Safe to call more than once.
    fn stop(&mut self);

    /// Intrinsics for the color stream at the negotiated resolution.
    fn intrinsics(&self) -> Intrinsics;

    fn has_depth(&self) -> bool {
        false
    }

    fn name(&self) -> &str {
        "camera"
    }
}

impl<T: FrameSource + ?Sized> FrameSource for Box<T> {
    fn start(&mut self, width: u32, height: u32, target_fps: u32) -> Result<()> {
        (**self).start(width, height, target_fps)
    }

    fn poll_frame(&mut self) -> Result<Option<FrameSample>> {
        (**self).poll_frame()
    }

    fn stop(&mut self) {
        (**self).stop()
    }

    fn intrinsics(&self) -> Intrinsics {
        (**self).intrinsics()
    }

    fn has_depth(&self) -> bool {
        (**self).has_depth()
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}

/// Counters shared between a [`SyntheticSource`] and whoever observes it.
#[derive(Debug, Default)]
pub struct SourceProbe {
    polls: AtomicU64,
    frames: AtomicU64,
    stops: AtomicU64,
    streaming: AtomicBool,
}

impl SourceProbe {
    pub fn polls(&self) -> u64 {
        self.polls.load(Ordering::Relaxed)
    }

    pub fn frames(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }

    /// Number of `stop` calls that actually released the stream
    pub fn stops(&self) -> u64 {
        self.stops.load(Ordering::Relaxed)
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming.load(Ordering::Acquire)
    }
}

/// Deterministic generated frames at a fixed rate.
///
/// Frame `n` is a uniform fill of value `n % 251` in every channel, so a
/// reader can check that a frame was not assembled from two writes. Depth,
/// when enabled, is a constant plane.
pub struct SyntheticSource {
    format: PixelFormat,
    depth_mm: Option<u16>,
    base_intrinsics: Intrinsics,
    interval: Option<Duration>,
    max_frames: Option<u64>,

    width: u32,
    height: u32,
    sequence: u64,
    next_due: Option<Instant>,
    probe: Arc<SourceProbe>,
}

impl SyntheticSource {
    pub fn new() -> Self {
        Self {
            format: PixelFormat::Rgb24,
            depth_mm: None,
            base_intrinsics: Intrinsics::mirror_camera(),
            interval: None,
            max_frames: None,
            width: 0,
            height: 0,
            sequence: 0,
            next_due: None,
            probe: Arc::new(SourceProbe::default()),
        }
    }

    pub fn with_depth_mm(mut self, depth_mm: u16) -> Self {
        self.depth_mm = Some(depth_mm);
        self
    }

    /// `Rgb24` or `Bgr24`
    pub fn with_format(mut self, format: PixelFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_intrinsics(mut self, intrinsics: Intrinsics) -> Self {
        self.base_intrinsics = intrinsics;
        self
    }

    /// Override the frame period implied by `target_fps`.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = Some(interval);
        self
    }

    /// Stop producing after `n` frames; later polls return `None`.
    pub fn with_max_frames(mut self, n: u64) -> Self {
        self.max_frames = Some(n);
        self
    }

    pub fn probe(&self) -> Arc<SourceProbe> {
        Arc::clone(&self.probe)
    }

    fn render(&self, sequence: u64) -> Result<FrameSample> {
        let fill = (sequence % 251) as u8;
        let len = self.width as usize * self.height as usize * 3;
        let color = ColorImage::new(self.width, self.height, self.format, Bytes::from(vec![fill; len]))?;
        let depth = self
            .depth_mm
            .map(|mm| DepthImage::filled(self.width, self.height, mm));
        Ok(FrameSample {
            color,
            depth,
            sequence,
            captured_at: Instant::now(),
            device_timestamp: None,
        })
    }
}

impl Default for SyntheticSource {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameSource for SyntheticSource {
    fn start(&mut self, width: u32, height: u32, target_fps: u32) -> Result<()> {
        if width == 0 || height == 0 || target_fps == 0 {
            return Err(Error::Device(format!(
                "synthetic source cannot stream {width}x{height} @ {target_fps} fps"
            )));
        }
        if !self.format.is_packed_color() {
            return Err(Error::Device(format!("synthetic source cannot emit {:?}", self.format)));
        }
        self.width = width;
        self.height = height;
        self.interval
            .get_or_insert(Duration::from_secs_f64(1.0 / f64::from(target_fps)));
        self.next_due = Some(Instant::now());
        self.probe.streaming.store(true, Ordering::Release);
        info!(width, height, target_fps, depth = ?self.depth_mm, "synthetic source started");
        Ok(())
    }

    fn poll_frame(&mut self) -> Result<Option<FrameSample>> {
        let Some(due) = self.next_due else {
            return Err(Error::Device("synthetic source not started".into()));
        };
        self.probe.polls.fetch_add(1, Ordering::Relaxed);

        if self.max_frames.is_some_and(|max| self.sequence >= max) {
            return Ok(None);
        }
        let now = Instant::now();
        if now < due {
            return Ok(None);
        }

        self.sequence += 1;
        let interval = self.interval.unwrap_or(Duration::from_millis(33));
        // Skip missed slots instead of bursting to catch up
        let mut next = due + interval;
        if next <= now && !interval.is_zero() {
            let missed = (now - next).as_nanos() / interval.as_nanos() + 1;
            next += interval * missed as u32;
        }
        self.next_due = Some(next);

        let sample = self.render(self.sequence)?;
        self.probe.frames.fetch_add(1, Ordering::Relaxed);
        Ok(Some(sample))
    }

    fn stop(&mut self) {
        if self.next_due.take().is_some() {
            self.probe.streaming.store(false, Ordering::Release);
            self.probe.stops.fetch_add(1, Ordering::Relaxed);
            debug!(frames = self.sequence, "synthetic source stopped");
        }
    }

    fn intrinsics(&self) -> Intrinsics {
        if self.width == 0 {
            return self.base_intrinsics;
        }
        self.base_intrinsics.scaled_to(self.width, self.height)
    }

    fn has_depth(&self) -> bool {
        self.depth_mm.is_some()
    }

    fn name(&self) -> &str {
        "synthetic"
    }
}
