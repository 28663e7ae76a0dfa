//! V4L2 capture: a color node plus an optional 16-bit depth node

use std::os::fd::BorrowedFd;
use std::time::{Duration, Instant};

use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use tracing::{debug, info, instrument, warn};
use v4l::buffer::Type;
use v4l::capability::Flags as CapFlags;
use v4l::io::traits::CaptureStream;
use v4l::prelude::MmapStream;
use v4l::video::Capture;
use v4l::Device;

use super::decoder::decode_frame;
use super::frame::{ColorImage, DepthImage, FrameSample, PixelFormat};
use super::source::FrameSource;
use crate::geometry::Intrinsics;
use crate::utils::{fourcc_for, pixel_format_from_fourcc, FoundDevice};
use crate::{Error, Result};

/// Blocking timeout for the first dequeue, which also starts the stream
const WARMUP_TIMEOUT: Duration = Duration::from_secs(2);

fn device_err(context: &str, e: std::io::Error) -> Error {
    Error::Device(format!("{context}: {e}"))
}

/// One opened, streaming node.
struct Node {
    // Field order matters: the stream must drop before the device
    stream: MmapStream<'static>,
    device: Device,
    format: PixelFormat,
    width: u32,
    height: u32,
    path: String,
}

impl Node {
    fn open(path: &str, wanted: PixelFormat, width: u32, height: u32, fps: u32, buffers: u32) -> Result<Self> {
        let device = Device::with_path(path).map_err(|e| device_err(path, e))?;

        let caps = device.query_caps().map_err(|e| device_err(path, e))?;
        info!("Device: {} ({}) at {}", caps.card, caps.driver, path);
        if !caps.capabilities.contains(CapFlags::VIDEO_CAPTURE) {
            return Err(Error::Device(format!("{path} doesn't support video capture")));
        }

        let mut fmt = device.format().map_err(|e| device_err(path, e))?;
        fmt.width = width;
        fmt.height = height;
        fmt.fourcc = fourcc_for(wanted);
        let fmt = device.set_format(&fmt).map_err(|e| device_err(path, e))?;

        // The driver may have picked something else
        let format = pixel_format_from_fourcc(fmt.fourcc)
            .ok_or_else(|| Error::Device(format!("{path}: unsupported fourcc {}", fmt.fourcc)))?;
        if (wanted == PixelFormat::Z16) != (format == PixelFormat::Z16) {
            return Err(Error::Device(format!(
                "{path}: asked for {wanted:?}, driver negotiated {format:?}"
            )));
        }
        if fmt.width != width || fmt.height != height {
            warn!(
                "{path}: requested {width}x{height}, driver negotiated {}x{}",
                fmt.width, fmt.height
            );
        }

        if fps > 0 {
            let mut params = device.params().map_err(|e| device_err(path, e))?;
            params.interval = v4l::Fraction::new(1, fps);
            if let Err(e) = device.set_params(&params) {
                warn!("{path}: could not set {fps} fps: {e}");
            }
        }

        let mut stream = MmapStream::with_buffers(&device, Type::VideoCapture, buffers)
            .map_err(|e| device_err(path, e))?;
        stream.set_timeout(WARMUP_TIMEOUT);

        Ok(Self {
            stream,
            device,
            format,
            width: fmt.width,
            height: fmt.height,
            path: path.to_owned(),
        })
    }

    /// Zero-timeout readiness check on the device fd.
    fn is_readable(&self) -> Result<bool> {
        let raw = self.device.handle().fd();
        // SAFETY: the fd is owned by `self.device`, which outlives this call
        let fd = unsafe { BorrowedFd::borrow_raw(raw) };
        let mut fds = [PollFd::new(fd, PollFlags::POLLIN)];
        match poll(&mut fds, PollTimeout::ZERO) {
            Ok(n) => Ok(n > 0
                && fds[0]
                    .revents()
                    .is_some_and(|r| r.contains(PollFlags::POLLIN))),
            Err(nix::errno::Errno::EINTR) => Ok(false),
            Err(e) => Err(Error::Device(format!("{}: poll failed: {e}", self.path))),
        }
    }

    fn dequeue(&mut self) -> Result<(&[u8], Option<Duration>)> {
        let (buf, meta) = self
            .stream
            .next()
            .map_err(|e| device_err(&self.path, e))?;
        let used = (meta.bytesused as usize).min(buf.len());
        let used = if used == 0 { buf.len() } else { used };
        let ts = Duration::from_secs(meta.timestamp.sec.max(0) as u64)
            + Duration::from_micros(meta.timestamp.usec.max(0) as u64);
        Ok((&buf[..used], Some(ts)))
    }
}

/// V4L2 camera with optional depth.
///
/// Color frames are decoded to RGB24 on the capture thread. Each color frame
/// is paired with the most recent depth frame seen on the depth node.
pub struct V4l2Source {
    device: FoundDevice,
    buffer_count: u32,
    base_intrinsics: Intrinsics,

    color: Option<Node>,
    depth: Option<Node>,
    latest_depth: Option<DepthImage>,
    /// Frame dequeued during warm-up, handed out by the first poll
    pending: Option<FrameSample>,
    intrinsics: Intrinsics,
    sequence: u64,
}

impl V4l2Source {
    pub fn new(device: FoundDevice, buffer_count: u32, intrinsics: Intrinsics) -> Self {
        Self {
            device,
            buffer_count: buffer_count.max(2),
            base_intrinsics: intrinsics,
            color: None,
            depth: None,
            latest_depth: None,
            pending: None,
            intrinsics,
            sequence: 0,
        }
    }

    fn read_color(&mut self) -> Result<FrameSample> {
        let node = self
            .color
            .as_mut()
            .ok_or_else(|| Error::Device("stream not started".into()))?;
        let captured_at = Instant::now();
        let (format, width, height) = (node.format, node.width, node.height);
        let (buf, device_timestamp) = node.dequeue()?;

        let color = match format {
            PixelFormat::Rgb24 | PixelFormat::Bgr24 => {
                let len = width as usize * height as usize * 3;
                let packed = buf
                    .get(..len)
                    .ok_or_else(|| Error::Decode(format!("short frame: {} < {len} bytes", buf.len())))?;
                ColorImage::copy_from_slice(width, height, format, packed)?
            }
            _ => {
                let rgb = decode_frame(buf, format, width, height)?;
                ColorImage::new(width, height, PixelFormat::Rgb24, rgb)?
            }
        };

        self.sequence += 1;
        Ok(FrameSample {
            color,
            depth: self.latest_depth.clone(),
            sequence: self.sequence,
            captured_at,
            device_timestamp,
        })
    }

    fn drain_depth(&mut self) -> Result<()> {
        let Some(node) = self.depth.as_mut() else {
            return Ok(());
        };
        if !node.is_readable()? {
            return Ok(());
        }
        let (width, height) = (node.width, node.height);
        let (buf, _) = node.dequeue()?;
        self.latest_depth = Some(DepthImage::from_le_bytes(width, height, buf)?);
        Ok(())
    }
}

impl FrameSource for V4l2Source {
    #[instrument(skip(self), fields(path = %self.device.path))]
    fn start(&mut self, width: u32, height: u32, target_fps: u32) -> Result<()> {
        if self.color.is_some() {
            return Ok(());
        }
        info!("Initializing V4L2 capture: {:?}", self.device);

        let color = Node::open(
            &self.device.path,
            self.device.format,
            width,
            height,
            target_fps,
            self.buffer_count,
        )?;
        self.intrinsics = self.base_intrinsics.scaled_to(color.width, color.height);
        self.color = Some(color);

        if let Some(depth_path) = self.device.depth_path.clone() {
            let (w, h) = self
                .color
                .as_ref()
                .map_or((width, height), |c| (c.width, c.height));
            match Node::open(&depth_path, PixelFormat::Z16, w, h, target_fps, self.buffer_count) {
                Ok(node) => self.depth = Some(node),
                Err(e) => warn!("depth node unavailable, continuing color-only: {e}"),
            }
        }

        // The first dequeue turns streaming on; it is the only blocking read
        if let Some(depth) = self.depth.as_mut() {
            let (w, h) = (depth.width, depth.height);
            match depth.dequeue() {
                Ok((buf, _)) => self.latest_depth = DepthImage::from_le_bytes(w, h, buf).ok(),
                Err(e) => warn!("depth warm-up failed: {e}"),
            }
        }
        let first = self.read_color()?;
        self.pending = Some(first);

        info!(
            width = self.intrinsics.width,
            height = self.intrinsics.height,
            depth = self.depth.is_some(),
            "Capture stream started with {} buffers",
            self.buffer_count
        );
        Ok(())
    }

    fn poll_frame(&mut self) -> Result<Option<FrameSample>> {
        if self.color.is_none() {
            return Err(Error::Device("stream not started".into()));
        }
        if let Err(e) = self.drain_depth() {
            debug!("depth read failed: {e}");
        }
        if let Some(first) = self.pending.take() {
            return Ok(Some(first));
        }

        let ready = match self.color.as_ref() {
            Some(node) => node.is_readable()?,
            None => false,
        };
        if !ready {
            return Ok(None);
        }
        self.read_color().map(Some)
    }

    fn stop(&mut self) {
        let had_stream = self.color.is_some();
        // Dropping the mmap stream issues STREAMOFF and unmaps the buffers
        self.pending = None;
        self.depth = None;
        self.color = None;
        self.latest_depth = None;
        if had_stream {
            info!(frames = self.sequence, "V4L2 capture stopped");
        }
    }

    fn intrinsics(&self) -> Intrinsics {
        self.intrinsics
    }

    fn has_depth(&self) -> bool {
        self.depth.is_some()
    }

    fn name(&self) -> &str {
        &self.device.path
    }
}

impl Drop for V4l2Source {
    fn drop(&mut self) {
        self.stop();
    }
}
