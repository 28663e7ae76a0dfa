//! GStreamer capture backend: `v4l2src ... ! appsink`, pulled without blocking

use std::time::Instant;

use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;
use tracing::{debug, info, warn};

use super::frame::{ColorImage, FrameSample, PixelFormat};
use super::source::FrameSource;
use crate::geometry::Intrinsics;
use crate::{Error, Result};

fn gst_err(context: &str, e: impl std::fmt::Display) -> Error {
    Error::Device(format!("{context}: {e}"))
}

/// Color-only source built on a GStreamer pipeline.
///
/// The pipeline always ends in packed RGB so frames need no decoding here.
pub struct GstSource {
    device_path: String,
    format: PixelFormat,
    custom_pipeline: Option<String>,
    base_intrinsics: Intrinsics,

    pipeline: Option<gst::Pipeline>,
    appsink: Option<gst_app::AppSink>,
    intrinsics: Intrinsics,
    sequence: u64,
}

impl GstSource {
    pub fn new(
        device_path: impl Into<String>,
        format: PixelFormat,
        custom_pipeline: Option<String>,
        intrinsics: Intrinsics,
    ) -> Self {
        Self {
            device_path: device_path.into(),
            format,
            custom_pipeline,
            base_intrinsics: intrinsics,
            pipeline: None,
            appsink: None,
            intrinsics,
            sequence: 0,
        }
    }

    fn build_pipeline_string(&self, width: u32, height: u32, fps: u32) -> Result<String> {
        if let Some(custom) = &self.custom_pipeline {
            return Ok(custom.clone());
        }
        let device = &self.device_path;

        let pipeline = match self.format {
            PixelFormat::Mjpeg => {
                let jpeg_decoder = Self::detect_jpeg_decoder();
                info!("Using JPEG decoder: {}", jpeg_decoder);
                format!(
                    "v4l2src device={device} ! \
                     image/jpeg,width={width},height={height},framerate={fps}/1 ! \
                     queue max-size-buffers=2 max-size-time=0 max-size-bytes=0 ! \
                     {jpeg_decoder} ! videoconvert ! video/x-raw,format=RGB ! \
                     appsink name=appsink"
                )
            }
            PixelFormat::Yuyv4 => format!(
                "v4l2src device={device} ! \
                 video/x-raw,format=YUY2,width={width},height={height},framerate={fps}/1 ! \
                 queue max-size-buffers=2 max-size-time=0 max-size-bytes=0 ! \
                 videoconvert ! video/x-raw,format=RGB ! appsink name=appsink"
            ),
            PixelFormat::Rgb24 => format!(
                "v4l2src device={device} ! \
                 video/x-raw,format=RGB,width={width},height={height},framerate={fps}/1 ! \
                 appsink name=appsink"
            ),
            other => {
                return Err(Error::Device(format!(
                    "GStreamer backend cannot capture {other:?}"
                )))
            }
        };
        Ok(pipeline)
    }

    /// Hardware decoders first, software fallback
    fn detect_jpeg_decoder() -> &'static str {
        for decoder in ["nvjpegdec", "vaapijpegdec", "v4l2jpegdec"] {
            if gst::ElementFactory::find(decoder).is_some() {
                debug!("Found decoder: {}", decoder);
                return decoder;
            }
        }
        warn!("No hardware JPEG decoder found, using software decoder");
        "jpegdec"
    }
}

impl FrameSource for GstSource {
    fn start(&mut self, width: u32, height: u32, target_fps: u32) -> Result<()> {
        if self.pipeline.is_some() {
            return Ok(());
        }
        gst::init().map_err(|e| gst_err("Failed to initialize GStreamer", e))?;

        let description = self.build_pipeline_string(width, height, target_fps)?;
        info!("Pipeline: {}", description);

        let pipeline = gst::parse::launch(&description)
            .map_err(|e| gst_err("Failed to parse pipeline", e))?
            .downcast::<gst::Pipeline>()
            .map_err(|_| Error::Device("Failed to create pipeline".into()))?;

        let appsink = pipeline
            .by_name("appsink")
            .ok_or_else(|| Error::Device("Failed to find appsink element".into()))?
            .downcast::<gst_app::AppSink>()
            .map_err(|_| Error::Device("Failed to cast to AppSink".into()))?;
        appsink.set_property("emit-signals", false);
        appsink.set_property("max-buffers", 1u32);
        appsink.set_property("drop", true);
        appsink.set_property("sync", false);

        pipeline
            .set_state(gst::State::Playing)
            .map_err(|e| gst_err("Failed to start pipeline", e))?;

        self.intrinsics = self.base_intrinsics.scaled_to(width, height);
        self.pipeline = Some(pipeline);
        self.appsink = Some(appsink);
        Ok(())
    }

    fn poll_frame(&mut self) -> Result<Option<FrameSample>> {
        let appsink = self
            .appsink
            .as_ref()
            .ok_or_else(|| Error::Device("pipeline not started".into()))?;

        let Some(sample) = appsink.try_pull_sample(gst::ClockTime::ZERO) else {
            if appsink.is_eos() {
                return Err(Error::Device("pipeline reached end of stream".into()));
            }
            return Ok(None);
        };
        let captured_at = Instant::now();

        let caps = sample
            .caps()
            .ok_or_else(|| Error::Decode("Sample has no caps".into()))?;
        let info = gst_video::VideoInfo::from_caps(caps)
            .map_err(|e| Error::Decode(format!("Failed to parse video info: {e}")))?;
        let buffer = sample
            .buffer()
            .ok_or_else(|| Error::Decode("Sample contains no buffer".into()))?;
        let map = buffer
            .map_readable()
            .map_err(|_| Error::Decode("Failed to map buffer".into()))?;

        let (width, height) = (info.width(), info.height());
        let row = width as usize * 3;
        let stride = info.stride()[0] as usize;
        let data = map.as_slice();
        // Rows may be padded to the stride
        let color = if stride == row {
            let packed = data
                .get(..row * height as usize)
                .ok_or_else(|| Error::Decode("short RGB buffer".into()))?;
            ColorImage::copy_from_slice(width, height, PixelFormat::Rgb24, packed)?
        } else {
            let mut packed = Vec::with_capacity(row * height as usize);
            for line in data.chunks(stride).take(height as usize) {
                packed.extend_from_slice(&line[..row.min(line.len())]);
            }
            ColorImage::new(width, height, PixelFormat::Rgb24, packed)?
        };

        self.sequence += 1;
        Ok(Some(FrameSample {
            color,
            depth: None,
            sequence: self.sequence,
            captured_at,
            device_timestamp: buffer.pts().map(|pts| pts.into()),
        }))
    }

    fn stop(&mut self) {
        self.appsink = None;
        if let Some(pipeline) = self.pipeline.take() {
            info!("Stopping GStreamer pipeline");
            if let Err(e) = pipeline.set_state(gst::State::Null) {
                warn!("Failed to stop pipeline: {:?}", e);
            }
        }
    }

    fn intrinsics(&self) -> Intrinsics {
        self.intrinsics
    }

    fn name(&self) -> &str {
        &self.device_path
    }
}

impl Drop for GstSource {
    fn drop(&mut self) {
        self.stop();
    }
}
