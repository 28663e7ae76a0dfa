//! SDL2 Window Display Module
//! Shows the newest camera frame with the landmark and marker overlays.
//! The render thread only reads the shared state; it never waits on capture
//! or detection.

use std::thread;
use std::time::{Duration, Instant};

use metrics::histogram;
use sdl2::event::Event;
use sdl2::keyboard::Scancode;
use sdl2::pixels::{Color, PixelFormatEnum};
use sdl2::rect::{Point, Rect};
use sdl2::render::{Canvas, Texture, TextureCreator};
use sdl2::video::{Window, WindowContext};
use tracing::{debug, info};

use super::overlay::{build_overlay, mirror_x, LandmarkHistory, Overlay, OverlayOptions, LANDMARK_COLOR};
use crate::capture::{ColorImage, PixelFormat};
use crate::geometry::Intrinsics;
use crate::pipeline::{CameraInput, FpsMeter, RenderSnapshot};
use crate::{DisplayConfig, Error, Result};

const TITLE: &str = "mirrorcap";
const TITLE_REFRESH: Duration = Duration::from_millis(500);
/// Sleep when there is nothing to show yet
const EMPTY_TICK_SLEEP: Duration = Duration::from_millis(5);

fn display_err(e: impl ToString) -> Error {
    Error::Display(e.to_string())
}

/// Streaming texture reused across frames; reallocated only when the frame
/// size or format changes.
struct FrameTexture {
    texture: Option<Texture>,
    width: u32,
    height: u32,
    format: PixelFormatEnum,
}

impl FrameTexture {
    fn matches(&self, image: &ColorImage, format: PixelFormatEnum) -> bool {
        self.width == image.width() && self.height == image.height() && self.format == format
    }
}

impl Drop for FrameTexture {
    fn drop(&mut self) {
        if let Some(texture) = self.texture.take() {
            // SAFETY: declared before the canvas in `Sdl2Display`, so the
            // renderer is still alive here.
            unsafe { texture.destroy() };
        }
    }
}

/// What the previous tick drew, for the debug title.
#[derive(Debug, Default, Clone, Copy)]
struct TickInfo {
    landmarks: usize,
    valid_3d: usize,
    marker: Option<u32>,
}

/// SDL2 Window Display
/// Owns the window, the frame texture and the overlay history.
pub struct Sdl2Display {
    // Must drop before `canvas`
    texture: Option<FrameTexture>,
    canvas: Canvas<Window>,
    texture_creator: TextureCreator<WindowContext>,

    config: DisplayConfig,
    intrinsics: Intrinsics,
    debug: bool,
    history: LandmarkHistory,
    fps: FpsMeter,
    last_title: Instant,
    last_tick: TickInfo,
}

impl Sdl2Display {
    pub fn new(sdl_context: &sdl2::Sdl, config: &DisplayConfig, intrinsics: Intrinsics) -> Result<Self> {
        let video_subsystem = sdl_context.video().map_err(display_err)?;

        let window = video_subsystem
            .window(TITLE, config.width, config.height)
            .position_centered()
            .resizable()
            .build()
            .map_err(display_err)?;

        let mut canvas_builder = window.into_canvas().accelerated();
        if config.vsync {
            canvas_builder = canvas_builder.present_vsync();
        }
        let canvas = canvas_builder.build().map_err(display_err)?;
        let texture_creator = canvas.texture_creator();

        info!(
            width = config.width,
            height = config.height,
            mirror = config.mirror,
            vsync = config.vsync,
            "display opened"
        );

        Ok(Self {
            texture: None,
            canvas,
            texture_creator,
            config: config.clone(),
            intrinsics,
            debug: config.start_in_debug,
            history: LandmarkHistory::default(),
            fps: FpsMeter::new(60),
            last_title: Instant::now(),
            last_tick: TickInfo::default(),
        })
    }

    pub fn set_debug(&mut self, on: bool) {
        if self.debug != on {
            debug!(on, "debug overlay toggled");
        }
        self.debug = on;
        if !on {
            // Debug title is dropped straight away
            let _ = self.canvas.window_mut().set_title(TITLE);
        }
    }

    pub fn is_debug(&self) -> bool {
        self.debug
    }

    fn upload(&mut self, image: &ColorImage) -> Result<()> {
        let format = match image.format() {
            PixelFormat::Rgb24 => PixelFormatEnum::RGB24,
            PixelFormat::Bgr24 => PixelFormatEnum::BGR24,
            other => return Err(Error::Display(format!("cannot display {other:?} frames"))),
        };

        let reuse = self.texture.as_ref().is_some_and(|t| t.matches(image, format));
        if !reuse {
            // Old texture goes first
            self.texture = None;
            let texture = self
                .texture_creator
                .create_texture_streaming(format, image.width(), image.height())
                .map_err(display_err)?;
            debug!(width = image.width(), height = image.height(), "frame texture allocated");
            self.texture = Some(FrameTexture {
                texture: Some(texture),
                width: image.width(),
                height: image.height(),
                format,
            });
        }

        if let Some(texture) = self.texture.as_mut().and_then(|t| t.texture.as_mut()) {
            texture
                .update(None, image.as_bytes(), image.pitch())
                .map_err(display_err)?;
        }
        Ok(())
    }

    fn draw_overlay(&mut self, overlay: &Overlay, frame_width: u32, frame_height: u32) -> Result<()> {
        let (out_w, out_h) = self.canvas.output_size().map_err(display_err)?;
        let sx = out_w as f32 / frame_width.max(1) as f32;
        let sy = out_h as f32 / frame_height.max(1) as f32;
        let mirror = self.config.mirror;
        let to_screen = |x: f32, y: f32| {
            let x = if mirror { mirror_x(x, frame_width) } else { x };
            Point::new((x * sx).round() as i32, (y * sy).round() as i32)
        };

        for seg in &overlay.segments {
            let [r, g, b] = seg.color;
            self.canvas.set_draw_color(Color::RGB(r, g, b));
            self.canvas
                .draw_line(to_screen(seg.a.x, seg.a.y), to_screen(seg.b.x, seg.b.y))
                .map_err(display_err)?;
        }

        if !overlay.points.is_empty() {
            let rects: Vec<Rect> = overlay
                .points
                .iter()
                .map(|p| {
                    let c = to_screen(p.x, p.y);
                    Rect::new(c.x() - 1, c.y() - 1, 3, 3)
                })
                .collect();
            let [r, g, b] = LANDMARK_COLOR;
            self.canvas.set_draw_color(Color::RGB(r, g, b));
            self.canvas.fill_rects(&rects).map_err(display_err)?;
        }
        Ok(())
    }

    /// Draw one snapshot. Returns `false` when there is no frame yet.
    pub fn render_snapshot(&mut self, snapshot: &RenderSnapshot) -> Result<bool> {
        let started = Instant::now();
        let Some(frame) = snapshot.frame.as_ref() else {
            return Ok(false);
        };

        self.upload(&frame.color)?;

        self.canvas.set_draw_color(Color::RGB(0, 0, 0));
        self.canvas.clear();
        if let Some(texture) = self.texture.as_ref().and_then(|t| t.texture.as_ref()) {
            self.canvas
                .copy_ex(texture, None, None, 0.0, None, self.config.mirror, false)
                .map_err(display_err)?;
        }

        let opts = OverlayOptions {
            debug: self.debug,
            near_m: self.config.near_m,
            far_m: self.config.far_m,
            ..OverlayOptions::default()
        };
        let overlay = build_overlay(snapshot, &mut self.history, &self.intrinsics, &opts);
        self.draw_overlay(&overlay, frame.width(), frame.height())?;
        self.canvas.present();

        histogram!("render_time_us").record(started.elapsed().as_secs_f64() * 1e6);
        self.fps.tick(Instant::now());
        self.last_tick = TickInfo {
            landmarks: snapshot.landmarks.as_ref().map_or(0, |l| l.len()),
            valid_3d: snapshot.landmarks.as_ref().map_or(0, |l| l.valid_count()),
            marker: snapshot.extrinsics.as_ref().map(|e| e.marker_id),
        };
        Ok(true)
    }

    fn refresh_title(&mut self, camera: &CameraInput) {
        if !self.debug || self.last_title.elapsed() < TITLE_REFRESH {
            return;
        }
        self.last_title = Instant::now();
        let stats = camera.stats();
        let tick = self.last_tick;
        let marker = tick.marker.map_or_else(|| "none".to_string(), |id| id.to_string());
        let title = format!(
            "{TITLE} | render {:.1} fps | capture {:.1} fps | detect {:.1} fps | {} landmarks ({} 3D) | marker {}",
            self.fps.fps(),
            stats.capture.rate_hz,
            stats.detection.rate_hz,
            tick.landmarks,
            tick.valid_3d,
            marker
        );
        let _ = self.canvas.window_mut().set_title(&title);
    }

    /// One render tick: request an extrinsics update, then draw the newest
    /// state.
    pub fn render_tick(&mut self, camera: &CameraInput) -> Result<bool> {
        camera.request_extrinsics();
        let drawn = self.render_snapshot(&camera.snapshot())?;
        self.refresh_title(camera);
        Ok(drawn)
    }

    /// Event loop. Esc or closing the window quits; Space turns the debug
    /// overlay on and X turns it off.
    pub fn run(&mut self, sdl_context: &sdl2::Sdl, camera: &CameraInput) -> Result<()> {
        let mut event_pump = sdl_context.event_pump().map_err(display_err)?;

        'running: loop {
            for event in event_pump.poll_iter() {
                match event {
                    Event::Quit { .. }
                    | Event::KeyDown {
                        scancode: Some(Scancode::Escape),
                        ..
                    } => {
                        info!("Quit event received");
                        break 'running;
                    }
                    Event::KeyDown {
                        scancode: Some(Scancode::Space),
                        ..
                    } => self.set_debug(true),
                    Event::KeyDown {
                        scancode: Some(Scancode::X),
                        ..
                    } => self.set_debug(false),
                    _ => {}
                }
            }

            if !camera.is_running() {
                info!("camera no longer running, closing display");
                break;
            }

            if !self.render_tick(camera)? {
                thread::sleep(EMPTY_TICK_SLEEP);
            }
        }

        Ok(())
    }
}
