use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use v4l::{capability::Flags, video::Capture, Device, FourCC};

use crate::capture::frame::PixelFormat;
use crate::{Error, Result};

// Detected capture device info
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FoundDevice {
    pub path: String,
    pub format: PixelFormat,
    /// Companion node streaming 16-bit depth, if any
    pub depth_path: Option<String>,
}

impl FoundDevice {
    pub fn new(path: String, format: PixelFormat) -> Self {
        Self {
            path,
            format,
            depth_path: None,
        }
    }

    pub fn with_depth(mut self, depth_path: impl Into<String>) -> Self {
        self.depth_path = Some(depth_path.into());
        self
    }

    pub fn is_unset(&self) -> bool {
        self.path.is_empty()
    }
}

impl Default for FoundDevice {
    fn default() -> Self {
        Self::new(String::new(), PixelFormat::Mjpeg)
    }
}

/// Map a V4L2 fourcc to the formats we can consume.
pub fn pixel_format_from_fourcc(fourcc: FourCC) -> Option<PixelFormat> {
    match &fourcc.repr {
        b"MJPG" => Some(PixelFormat::Mjpeg),
        b"YUYV" => Some(PixelFormat::Yuyv4),
        b"RGB3" => Some(PixelFormat::Rgb24),
        b"BGR3" => Some(PixelFormat::Bgr24),
        b"NV12" => Some(PixelFormat::Nv12),
        b"Z16 " => Some(PixelFormat::Z16),
        _ => None,
    }
}

pub fn fourcc_for(format: PixelFormat) -> FourCC {
    FourCC::new(match format {
        PixelFormat::Mjpeg => b"MJPG",
        PixelFormat::Yuyv4 => b"YUYV",
        PixelFormat::Rgb24 => b"RGB3",
        PixelFormat::Bgr24 => b"BGR3",
        PixelFormat::Nv12 => b"NV12",
        PixelFormat::Z16 => b"Z16 ",
    })
}

/// Auto-detect best capture device
///
/// Picks the first node offering MJPEG (preferred) or YUYV for color, and
/// the first node offering `Z16 ` for depth.
pub fn auto_detect_device() -> Result<FoundDevice> {
    info!("Auto-detecting capture devices...");

    let mut color: Option<FoundDevice> = None;
    let mut depth: Option<String> = None;

    for i in 0..10 {
        let path = format!("/dev/video{}", i);
        if !Path::new(&path).exists() {
            continue;
        }

        let Ok(dev) = Device::with_path(&path) else {
            continue;
        };
        let Ok(caps) = dev.query_caps() else {
            continue;
        };
        if !caps.capabilities.contains(Flags::VIDEO_CAPTURE) {
            continue;
        }
        let Ok(formats) = dev.enum_formats() else {
            continue;
        };

        let offered: Vec<_> = formats
            .iter()
            .filter_map(|f| pixel_format_from_fourcc(f.fourcc))
            .collect();
        debug!(path = %path, card = %caps.card, ?offered, "probed capture node");

        if depth.is_none() && offered.contains(&PixelFormat::Z16) {
            info!("Found depth device: {} - {}", path, caps.card);
            depth = Some(path.clone());
            continue;
        }

        if color.is_none() {
            let format = if offered.contains(&PixelFormat::Mjpeg) {
                Some(PixelFormat::Mjpeg)
            } else if offered.contains(&PixelFormat::Yuyv4) {
                Some(PixelFormat::Yuyv4)
            } else {
                None
            };
            if let Some(format) = format {
                info!("Found {:?} device: {} - {}", format, path, caps.card);
                color = Some(FoundDevice::new(path, format));
            }
        }
    }

    let mut found =
        color.ok_or_else(|| Error::Device("No suitable capture device found".into()))?;
    found.depth_path = depth;
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fourcc_mapping_is_symmetric() {
        for format in [
            PixelFormat::Mjpeg,
            PixelFormat::Yuyv4,
            PixelFormat::Rgb24,
            PixelFormat::Bgr24,
            PixelFormat::Nv12,
            PixelFormat::Z16,
        ] {
            assert_eq!(pixel_format_from_fourcc(fourcc_for(format)), Some(format));
        }
        assert_eq!(pixel_format_from_fourcc(FourCC::new(b"H264")), None);
    }
}
