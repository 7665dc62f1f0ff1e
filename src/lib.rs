//! zero-render - Material, shader library and offscreen post-processing core
//!
//! The crate is generic over a graphics backend:
//! - **Headless**: in-memory backend that records commands, used by tests and tooling
//! - **Vulkan**: Direct Vulkan API via ash (native only, feature `vulkan-backend`)
//!
//! # Features
//! - Interleaved meshes with canonical cube and quad primitives
//! - Text shader descriptions with passes, defines and default properties
//! - Materials with a typed property bag and a packed 48-byte GPU block
//! - Persistently mapped bone palette for skinning
//! - Offscreen render target composited through a configurable effect stack

pub mod backend;
pub mod material;
pub mod pipeline;
pub mod renderer;
pub mod resources;
pub mod window;

use std::path::PathBuf;

use backend::TextureFormat;
use pipeline::PostProcessConfig;

pub use backend::HeadlessBackend;
#[cfg(all(feature = "vulkan-backend", not(target_arch = "wasm32")))]
pub use backend::vulkan::VulkanBackend;
pub use material::{Material, ShaderLibrary};
pub use pipeline::PostProcessor;
pub use renderer::{DrawItem, Overlay, Renderer, SceneLighting};
pub use window::Window;

/// Configuration for initializing the renderer
#[derive(Debug, Clone)]
pub struct RendererConfig {
    /// Window title
    pub title: String,
    /// Initial window width
    pub width: u32,
    /// Initial window height
    pub height: u32,
    /// Enable vsync
    pub vsync: bool,
    /// Format of the offscreen color target
    pub color_format: TextureFormat,
    /// Format of the offscreen depth target
    pub depth_format: TextureFormat,
    /// Directory scanned for `*.shader` descriptions at startup
    pub shader_dir: PathBuf,
    pub post_process: PostProcessConfig,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            title: "zero-render".to_string(),
            width: 1280,
            height: 720,
            vsync: true,
            color_format: TextureFormat::Rgba16Float,
            depth_format: TextureFormat::Depth32Float,
            shader_dir: PathBuf::from("shaders"),
            post_process: PostProcessConfig::default(),
        }
    }
}

/// Install `env_logger` with an `info` default that `RUST_LOG` overrides.
///
/// Safe to call more than once.
#[cfg(not(target_arch = "wasm32"))]
pub fn init_logging() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .try_init();
}
