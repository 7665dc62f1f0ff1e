//! Offscreen post-processing
//!
//! [`PostProcessor`] owns a color target sized to the swap output. Scene
//! draws are recorded between `begin_offscreen_pass` and `end_offscreen_pass`,
//! then `apply_effects` composites the target into the output framebuffer
//! with a single fullscreen triangle.

mod config;
mod processor;

pub use config::*;
pub use processor::*;
