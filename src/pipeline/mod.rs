//! Render pipeline stages

pub mod postprocess;

pub use postprocess::{PostProcessConfig, PostProcessState, PostProcessUniforms, PostProcessor};
