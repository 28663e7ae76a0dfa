//! mirrorcap: camera capture, landmarks and marker extrinsics behind an SDL2 mirror view

use color_eyre::{eyre::eyre, Result};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use mirrorcap::display::Sdl2Display;
use mirrorcap::{capture, CameraInput, Collaborators, Config};

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("mirrorcap=debug"));

    #[cfg(feature = "profiling")]
    {
        use tracing_subscriber::prelude::*;
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_timer(tracing_subscriber::fmt::time::uptime()))
            .with(tracing_tracy::TracyLayer::default())
            .init();
    }

    #[cfg(not(feature = "profiling"))]
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();
}

fn collaborators(config: &Config) -> Result<Collaborators> {
    let mut collaborators = Collaborators::default();

    if config.detection.enabled {
        #[cfg(feature = "onnx")]
        {
            let detector = mirrorcap::landmarks::onnx::OnnxLandmarkDetector::new(&config.detection)?;
            collaborators = collaborators.with_detector(detector);
        }
        #[cfg(not(feature = "onnx"))]
        warn!("detection enabled but built without the `onnx` feature, landmarks disabled");
    }

    if config.detection.enable_face_fit {
        match &config.detection.face_template {
            Some(path) => {
                let fitter = mirrorcap::fitting::RigidFaceFitter::from_file(path, config.detection.template_scale)?;
                collaborators = collaborators.with_face_fitter(fitter);
            }
            None => warn!("face fit enabled without a face_template, skipping"),
        }
    }

    if config.extrinsics.enabled && collaborators.marker_detector.is_none() {
        warn!("extrinsics enabled but no marker detector backend is available");
    }

    Ok(collaborators)
}

fn main() -> Result<()> {
    // Initialize error handling and logging
    color_eyre::install()?;
    init_tracing();

    info!("mirrorcap launching...");

    let config = Config::from_env()?;
    let source = capture::open_source(&config)?;
    let collaborators = collaborators(&config)?;

    let mut camera = CameraInput::start(&config, source, collaborators)?;
    info!(capabilities = ?camera.capabilities(), "pipeline running");

    let sdl_context = sdl2::init().map_err(|e| eyre!(e))?;
    let mut display = Sdl2Display::new(&sdl_context, &config.display, camera.intrinsics())?;
    let result = display.run(&sdl_context, &camera);

    camera.stop();
    let stats = camera.stats();
    info!(
        frames = stats.capture.published,
        detections = stats.detection.published,
        extrinsics = stats.extrinsics.published,
        "mirrorcap shutting down"
    );
    result.map_err(Into::into)
}
