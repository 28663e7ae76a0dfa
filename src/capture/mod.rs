pub mod decoder;
pub mod frame;
#[cfg(feature = "gstreamer-pipeline")]
pub mod gst_capture;
pub mod source;
pub mod v4l2;

pub use frame::{ColorImage, DepthImage, FrameSample, PixelFormat};
#[cfg(feature = "gstreamer-pipeline")]
pub use gst_capture::GstSource;
pub use source::{FrameSource, SourceProbe, SyntheticSource};
pub use v4l2::V4l2Source;

use crate::utils::{self, FoundDevice};
use crate::{CaptureBackend, Config, Result};

/// Build the frame source named by the config, auto-detecting the device
/// when no path is set.
pub fn open_source(config: &Config) -> Result<Box<dyn FrameSource>> {
    let capture = &config.capture;
    let resolve = |device: &FoundDevice| -> Result<FoundDevice> {
        if device.is_unset() {
            utils::auto_detect_device()
        } else {
            Ok(device.clone())
        }
    };

    match capture.backend {
        CaptureBackend::Synthetic => {
            let mut source = SyntheticSource::new().with_intrinsics(capture.intrinsics);
            if capture.synthetic_depth_mm > 0 {
                source = source.with_depth_mm(capture.synthetic_depth_mm);
            }
            Ok(Box::new(source))
        }
        CaptureBackend::V4l2 => {
            let device = resolve(&capture.device)?;
            Ok(Box::new(V4l2Source::new(
                device,
                capture.buffer_count,
                capture.intrinsics,
            )))
        }
        #[cfg(feature = "gstreamer-pipeline")]
        CaptureBackend::Gstreamer => {
            let device = resolve(&capture.device)?;
            Ok(Box::new(GstSource::new(
                device.path,
                device.format,
                config.gstreamer.custom_pipeline.clone(),
                capture.intrinsics,
            )))
        }
        #[cfg(not(feature = "gstreamer-pipeline"))]
        CaptureBackend::Gstreamer => Err(crate::Error::Device(
            "built without the gstreamer-pipeline feature".into(),
        )),
    }
}
