pub mod capture;
pub mod display;
pub mod error;
pub mod fiducial;
pub mod fitting;
pub mod geometry;
pub mod landmarks;
pub mod pipeline;
pub mod utils;

use std::path::{Path, PathBuf};

use capture::frame::PixelFormat;
use serde::{Deserialize, Serialize};

pub use error::{Error, Result};
pub use geometry::Intrinsics;
pub use pipeline::{CameraInput, Collaborators, Lifecycle, SharedFrameState};

use crate::utils::FoundDevice;

/// Environment variable naming an explicit config file
pub const CONFIG_PATH_ENV: &str = "MIRRORCAP_CONFIG";

/// System configuration
///
/// Built once at startup and handed to each component; nothing reads it
/// through a global.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub capture: CaptureConfig,
    pub detection: DetectionConfig,
    pub extrinsics: ExtrinsicsConfig,
    pub display: DisplayConfig,
    pub pipeline: PipelineConfig,
    #[cfg(feature = "gstreamer-pipeline")]
    pub gstreamer: GStreamerConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureBackend {
    V4l2,
    Gstreamer,
    /// Generated frames, no hardware
    Synthetic,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub backend: CaptureBackend,
    /// Empty path means auto-detect
    pub device: FoundDevice,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub buffer_count: u32,
    /// Calibration at its own resolution; rescaled to the stream size
    pub intrinsics: Intrinsics,
    /// Constant depth for the synthetic backend, 0 disables the depth stream
    pub synthetic_depth_mm: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    pub enabled: bool,
    pub face_model: PathBuf,
    pub landmark_model: PathBuf,
    /// Faces below this score are ignored
    pub confidence_threshold: f32,
    /// Metres per raw depth unit
    pub depth_scale_m: f64,
    /// Side of the square window used for the depth lookup; 1 reads a single pixel
    pub depth_window: u32,
    pub intra_threads: usize,
    pub enable_face_fit: bool,
    /// Reference landmark template, one `x y z` line per landmark
    pub face_template: Option<PathBuf>,
    /// Template units to metres
    pub template_scale: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtrinsicsTrigger {
    /// One detection per render tick request
    RenderTick,
    /// Fixed cadence, independent of rendering
    Interval,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtrinsicsConfig {
    pub enabled: bool,
    pub marker_size_m: f64,
    pub trigger: ExtrinsicsTrigger,
    pub interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplayConfig {
    pub width: u32,
    pub height: u32,
    /// Flip horizontally so the image behaves like a mirror
    pub mirror: bool,
    pub vsync: bool,
    pub start_in_debug: bool,
    pub near_m: f64,
    pub far_m: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Upper bound on the sleep of an idle loop iteration
    pub idle_sleep_ms: u64,
    pub pin_capture_core: Option<usize>,
    /// Number of frame timestamps in the FPS window
    pub fps_window: usize,
}

#[cfg(feature = "gstreamer-pipeline")]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GStreamerConfig {
    pub custom_pipeline: Option<String>,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            backend: CaptureBackend::V4l2,
            device: FoundDevice::new(String::new(), PixelFormat::Mjpeg),
            width: 640,
            height: 480,
            fps: 30,
            buffer_count: 4,
            intrinsics: Intrinsics::mirror_camera(),
            synthetic_depth_mm: 1000,
        }
    }
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            enabled: cfg!(feature = "onnx"),
            face_model: PathBuf::from("models/version-RFB-320.onnx"),
            landmark_model: PathBuf::from("models/face_landmarks_68.onnx"),
            confidence_threshold: 0.9,
            depth_scale_m: 0.001,
            depth_window: 1,
            intra_threads: 2,
            enable_face_fit: false,
            face_template: None,
            template_scale: 1.0,
        }
    }
}

impl Default for ExtrinsicsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            marker_size_m: 0.1,
            trigger: ExtrinsicsTrigger::RenderTick,
            interval_ms: 500,
        }
    }
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
            mirror: true,
            vsync: true,
            start_in_debug: false,
            near_m: 0.01,
            far_m: 10.0,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            idle_sleep_ms: 10,
            pin_capture_core: None,
            fps_window: 60,
        }
    }
}

impl Config {
    /// Layered load: defaults, then `path` (or `./mirrorcap.toml` if present),
    /// then `MIRRORCAP__SECTION__KEY` environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder =
            config::Config::builder().add_source(config::Config::try_from(&Config::default())?);

        builder = match path {
            Some(path) => builder.add_source(config::File::from(path)),
            None => builder.add_source(config::File::with_name("mirrorcap").required(false)),
        };

        let config = builder
            .add_source(
                config::Environment::with_prefix("MIRRORCAP")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        Ok(config)
    }

    /// Load using the file named by `MIRRORCAP_CONFIG`, if set.
    pub fn from_env() -> Result<Self> {
        let path = std::env::var_os(CONFIG_PATH_ENV).map(PathBuf::from);
        Self::load(path.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_survive_layered_load() {
        let cfg = Config::load(Some(Path::new("does-not-exist.toml")));
        // Explicit paths are required
        assert!(cfg.is_err());

        let cfg = Config::load(None).unwrap();
        assert_eq!(cfg.capture.width, 640);
        assert_eq!(cfg.pipeline.idle_sleep_ms, 10);
        assert_eq!(cfg.extrinsics.trigger, ExtrinsicsTrigger::RenderTick);
        assert!((cfg.detection.depth_scale_m - 0.001).abs() < 1e-12);
    }

    #[test]
    fn file_overrides_defaults() {
        let dir = std::env::temp_dir().join(format!("mirrorcap-cfg-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("override.toml");
        std::fs::write(
            &path,
            "[capture]\nbackend = \"synthetic\"\nwidth = 320\n\n[extrinsics]\nenabled = true\ntrigger = \"interval\"\n",
        )
        .unwrap();

        let cfg = Config::load(Some(&path)).unwrap();
        assert_eq!(cfg.capture.backend, CaptureBackend::Synthetic);
        assert_eq!(cfg.capture.width, 320);
        assert_eq!(cfg.capture.height, 480);
        assert!(cfg.extrinsics.enabled);
        assert_eq!(cfg.extrinsics.trigger, ExtrinsicsTrigger::Interval);
        assert!((cfg.capture.intrinsics.fx - 302.022_431_62).abs() < 1e-9);

        std::fs::remove_dir_all(&dir).ok();
    }
}
