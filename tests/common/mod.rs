//! Shared helpers for the integration tests.
//!
//! Everything runs against the headless backend, so no GPU is needed.

#![allow(dead_code)]

use std::path::{Path, PathBuf};

use zero_render::backend::{
    AttachmentDescription, AttachmentLoadOp, GraphicsBackend, HeadlessBackend, RenderPassHandle,
    RenderPassLayout, StoreOp, TextureFormat, TextureLayout,
};
use zero_render::material::PipelineTarget;

pub const OFFSCREEN_COLOR: TextureFormat = TextureFormat::Rgba16Float;
pub const OFFSCREEN_DEPTH: TextureFormat = TextureFormat::Depth32Float;
pub const SWAPCHAIN_FORMAT: TextureFormat = TextureFormat::Bgra8UnormSrgb;

/// The Terrain description used throughout the docs
pub const TERRAIN_SOURCE: &str = r#"shader "Terrain"
pass "Forward"
  vertex "shaders/terrain_vert.spv"
  fragment "shaders/terrain_frag.spv"
  define USE_NORMAL_MAP
end
property baseColor vec4 0.4 0.6 0.3 1
property metallic float 0
property roughness float 0.9
"#;

/// Install the test logger; repeated calls are harmless.
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Headless backend with a simulated 800x600 swapchain
pub fn surface_backend() -> HeadlessBackend {
    init_logging();
    HeadlessBackend::with_surface(800, 600, SWAPCHAIN_FORMAT)
}

/// Create a color + depth render pass like the offscreen one
pub fn scene_pass(backend: &mut HeadlessBackend) -> RenderPassHandle {
    backend
        .create_render_pass(&RenderPassLayout {
            label: Some("scene".into()),
            color_attachments: vec![AttachmentDescription {
                format: OFFSCREEN_COLOR,
                load_op: AttachmentLoadOp::Clear,
                store_op: StoreOp::Store,
                initial_layout: TextureLayout::Undefined,
                final_layout: TextureLayout::ColorAttachment,
            }],
            depth_attachment: Some(AttachmentDescription {
                format: OFFSCREEN_DEPTH,
                load_op: AttachmentLoadOp::Clear,
                store_op: StoreOp::Discard,
                initial_layout: TextureLayout::Undefined,
                final_layout: TextureLayout::DepthAttachment,
            }),
        })
        .expect("scene render pass")
}

/// Pipeline target for [`scene_pass`]
pub fn scene_target(backend: &mut HeadlessBackend) -> PipelineTarget {
    PipelineTarget {
        render_pass: scene_pass(backend),
        color_format: OFFSCREEN_COLOR,
        depth_format: Some(OFFSCREEN_DEPTH),
    }
}

/// Write a shader description into `dir` and return its path
pub fn write_shader(dir: &Path, file_name: &str, source: &str) -> PathBuf {
    let path = dir.join(file_name);
    std::fs::write(&path, source).expect("write shader description");
    path
}

/// Decode little-endian f32s
pub fn floats(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}
