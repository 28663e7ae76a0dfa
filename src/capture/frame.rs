use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use image::{GrayImage, RgbImage};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Pixel formats we support
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    Rgb24,
    Bgr24,
    Yuyv4,
    Mjpeg,
    Nv12,
    /// 16-bit little-endian depth, one sample per pixel
    Z16,
}

impl PixelFormat {
    pub fn is_packed_color(self) -> bool {
        matches!(self, PixelFormat::Rgb24 | PixelFormat::Bgr24)
    }
}

/// Packed 8-bit, 3-channel color image.
///
/// The pixel data lives in [`Bytes`], so clones share the buffer instead of
/// copying it. Only `Rgb24` and `Bgr24` layouts are valid here; compressed or
/// planar formats are decoded before a `ColorImage` is built.
#[derive(Debug, Clone)]
pub struct ColorImage {
    data: Bytes,
    width: u32,
    height: u32,
    format: PixelFormat,
}

impl ColorImage {
    pub fn new(width: u32, height: u32, format: PixelFormat, data: impl Into<Bytes>) -> Result<Self> {
        if !format.is_packed_color() {
            return Err(Error::InvalidInput(format!(
                "color image must be RGB24 or BGR24, got {format:?}"
            )));
        }
        let data = data.into();
        let expected = width as usize * height as usize * 3;
        if data.len() != expected {
            return Err(Error::InvalidInput(format!(
                "color buffer is {} bytes, expected {expected} for {width}x{height}",
                data.len()
            )));
        }
        Ok(Self {
            data,
            width,
            height,
            format,
        })
    }

    /// Copy a driver-owned buffer into an owned image.
    pub fn copy_from_slice(width: u32, height: u32, format: PixelFormat, data: &[u8]) -> Result<Self> {
        Self::new(width, height, format, Bytes::copy_from_slice(data))
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Row pitch in bytes
    pub fn pitch(&self) -> usize {
        self.width as usize * 3
    }

    /// RGB value at (x, y), independent of channel order.
    pub fn rgb_at(&self, x: u32, y: u32) -> Option<[u8; 3]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let i = (y as usize * self.width as usize + x as usize) * 3;
        let px = &self.data[i..i + 3];
        Some(match self.format {
            PixelFormat::Bgr24 => [px[2], px[1], px[0]],
            _ => [px[0], px[1], px[2]],
        })
    }

    pub fn to_rgb_image(&self) -> RgbImage {
        let mut rgb = self.data.to_vec();
        if self.format == PixelFormat::Bgr24 {
            for px in rgb.chunks_exact_mut(3) {
                px.swap(0, 2);
            }
        }
        // Length is checked in `new`
        RgbImage::from_raw(self.width, self.height, rgb).unwrap_or_else(|| RgbImage::new(self.width, self.height))
    }

    /// Luma conversion used by the marker detector
    pub fn to_gray(&self) -> GrayImage {
        image::imageops::grayscale(&self.to_rgb_image())
    }
}

/// 16-bit depth image, raw sensor units (millimetres for Z16 devices).
#[derive(Debug, Clone)]
pub struct DepthImage {
    data: Arc<[u16]>,
    width: u32,
    height: u32,
}

impl DepthImage {
    pub fn new(width: u32, height: u32, data: Vec<u16>) -> Result<Self> {
        let expected = width as usize * height as usize;
        if data.len() != expected {
            return Err(Error::InvalidInput(format!(
                "depth buffer has {} samples, expected {expected} for {width}x{height}",
                data.len()
            )));
        }
        Ok(Self {
            data: data.into(),
            width,
            height,
        })
    }

    /// Build from a little-endian Z16 byte buffer
    pub fn from_le_bytes(width: u32, height: u32, bytes: &[u8]) -> Result<Self> {
        let samples = bytes
            .chunks_exact(2)
            .map(|b| u16::from_le_bytes([b[0], b[1]]))
            .collect();
        Self::new(width, height, samples)
    }

    pub fn filled(width: u32, height: u32, value: u16) -> Self {
        Self {
            data: vec![value; width as usize * height as usize].into(),
            width,
            height,
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn samples(&self) -> &[u16] {
        &self.data
    }

    pub fn get(&self, x: u32, y: u32) -> Option<u16> {
        if x >= self.width || y >= self.height {
            return None;
        }
        Some(self.data[y as usize * self.width as usize + x as usize])
    }
}

/// One capture tick: a color frame and, when the source has a depth stream,
/// the most recent depth frame.
#[derive(Debug, Clone)]
pub struct FrameSample {
    pub color: ColorImage,
    pub depth: Option<DepthImage>,

    /// Monotonic per-source counter, starts at 1
    pub sequence: u64,

    /// Capture timestamp for latency tracking
    pub captured_at: Instant,

    /// Hardware timestamp if available
    pub device_timestamp: Option<Duration>,
}

impl FrameSample {
    pub fn width(&self) -> u32 {
        self.color.width()
    }

    pub fn height(&self) -> u32 {
        self.color.height()
    }
}
