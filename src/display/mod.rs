pub mod overlay;

#[cfg(feature = "sdl-display")]
pub mod display;

#[cfg(feature = "sdl-display")]
pub use display::Sdl2Display;
pub use overlay::{build_overlay, LandmarkHistory, Overlay, OverlayOptions, Segment};
