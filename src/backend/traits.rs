//! Core backend abstraction traits
//!
//! These traits define the interface that the headless and Vulkan backends implement.
//! Every component of the crate is generic over [`GraphicsBackend`], so only one
//! backend is bound at a time.

use crate::backend::types::*;
use std::ops::Range;
use std::ptr::NonNull;
use thiserror::Error;

/// Backend error type
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("Failed to initialize backend: {0}")]
    InitializationFailed(String),
    #[error("Failed to create surface: {0}")]
    SurfaceCreationFailed(String),
    #[error("Failed to create device: {0}")]
    DeviceCreationFailed(String),
    #[error("Failed to create swapchain: {0}")]
    SwapchainCreationFailed(String),
    #[error("Failed to acquire next image: {0}")]
    AcquireImageFailed(String),
    #[error("Failed to present: {0}")]
    PresentFailed(String),
    #[error("Failed to create buffer: {0}")]
    BufferCreationFailed(String),
    #[error("Failed to create texture: {0}")]
    TextureCreationFailed(String),
    #[error("Failed to create pipeline: {0}")]
    PipelineCreationFailed(String),
    #[error("Failed to create shader: {0}")]
    ShaderCreationFailed(String),
    #[error("Failed to create descriptor: {0}")]
    DescriptorCreationFailed(String),
    #[error("Invalid {0} handle")]
    InvalidHandle(&'static str),
    #[error("Buffer is not host visible")]
    NotHostVisible,
    #[error("Write of {len} bytes at offset {offset} exceeds buffer size {size}")]
    OutOfBounds { offset: u64, len: u64, size: u64 },
    #[error("Surface lost")]
    SurfaceLost,
    #[error("Out of memory")]
    OutOfMemory,
    #[error("Device lost")]
    DeviceLost,
}

pub type BackendResult<T> = Result<T, BackendError>;

macro_rules! define_handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
        pub struct $name(pub(crate) u64);

        impl $name {
            /// The zero handle, never issued by a backend
            pub const NULL: Self = Self(0);

            pub fn is_null(&self) -> bool {
                self.0 == 0
            }

            pub fn raw(&self) -> u64 {
                self.0
            }
        }
    };
}

define_handle!(
    /// Handle to a GPU buffer
    BufferHandle
);
define_handle!(
    /// Handle to a GPU texture
    TextureHandle
);
define_handle!(
    /// Handle to a texture view
    TextureViewHandle
);
define_handle!(
    /// Handle to a sampler
    SamplerHandle
);
define_handle!(
    /// Handle to a render pass
    RenderPassHandle
);
define_handle!(
    /// Handle to a framebuffer
    FramebufferHandle
);
define_handle!(
    /// Handle to a bind group layout
    BindGroupLayoutHandle
);
define_handle!(
    /// Handle to a pool bind groups are allocated from
    BindGroupPoolHandle
);
define_handle!(
    /// Handle to a bind group
    BindGroupHandle
);
define_handle!(
    /// Handle to a pipeline layout
    PipelineLayoutHandle
);
define_handle!(
    /// Handle to a render pipeline
    RenderPipelineHandle
);

/// Bind group entry for filling bind groups
#[derive(Debug, Clone, PartialEq)]
pub enum BindGroupEntry {
    Buffer {
        buffer: BufferHandle,
        offset: u64,
        size: Option<u64>,
    },
    CombinedImageSampler {
        view: TextureViewHandle,
        sampler: SamplerHandle,
    },
}

/// Bind group layout entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindGroupLayoutEntry {
    pub binding: u32,
    pub visibility: ShaderStageFlags,
    pub ty: BindingType,
}

/// Binding type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingType {
    UniformBuffer,
    CombinedImageSampler,
}

/// Capacity of a bind group pool
#[derive(Debug, Clone)]
pub struct BindGroupPoolDescriptor {
    pub label: Option<String>,
    pub max_sets: u32,
    pub uniform_buffers: u32,
    pub combined_image_samplers: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PushConstantRange {
    pub stages: ShaderStageFlags,
    pub offset: u32,
    pub size: u32,
}

/// Pipeline layout descriptor
#[derive(Debug, Clone)]
pub struct PipelineLayoutDescriptor {
    pub label: Option<String>,
    pub bind_group_layouts: Vec<BindGroupLayoutHandle>,
    pub push_constant_ranges: Vec<PushConstantRange>,
}

/// Render pipeline descriptor
///
/// Shader stages are referenced by bytecode path. `defines` are carried along
/// for the backend that selects or specialises the module.
#[derive(Debug, Clone)]
pub struct RenderPipelineDescriptor {
    pub label: Option<String>,
    pub layout: PipelineLayoutHandle,
    pub render_pass: RenderPassHandle,
    pub vertex_shader: String,
    pub fragment_shader: String,
    pub defines: Vec<String>,
    pub vertex_layouts: Vec<VertexBufferLayout>,
    pub primitive_topology: PrimitiveTopology,
    pub front_face: FrontFace,
    pub cull_mode: Face,
    pub depth_stencil: Option<DepthStencilState>,
    pub blend: Option<BlendState>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DepthStencilState {
    pub format: TextureFormat,
    pub depth_test_enabled: bool,
    pub depth_write_enabled: bool,
    pub depth_compare: CompareFunction,
}

/// A single attachment of a render pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttachmentDescription {
    pub format: TextureFormat,
    pub load_op: AttachmentLoadOp,
    pub store_op: StoreOp,
    pub initial_layout: TextureLayout,
    pub final_layout: TextureLayout,
}

/// Single-subpass render pass layout
#[derive(Debug, Clone)]
pub struct RenderPassLayout {
    pub label: Option<String>,
    pub color_attachments: Vec<AttachmentDescription>,
    pub depth_attachment: Option<AttachmentDescription>,
}

/// Framebuffer descriptor; attachments are listed color first, depth last
#[derive(Debug, Clone)]
pub struct FramebufferDescriptor {
    pub label: Option<String>,
    pub render_pass: RenderPassHandle,
    pub attachments: Vec<TextureViewHandle>,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ClearValue {
    Color([f32; 4]),
    DepthStencil { depth: f32, stencil: u32 },
}

/// Arguments for beginning a render pass
#[derive(Debug, Clone)]
pub struct RenderPassBeginInfo {
    pub render_pass: RenderPassHandle,
    pub framebuffer: FramebufferHandle,
    pub width: u32,
    pub height: u32,
    pub clear_values: Vec<ClearValue>,
}

/// Frame context returned when beginning a frame
#[derive(Debug, Clone, Copy)]
pub struct FrameContext {
    pub render_pass: RenderPassHandle,
    pub framebuffer: FramebufferHandle,
    pub image_index: u32,
    pub width: u32,
    pub height: u32,
}

/// Resource creation and command recording
pub trait GraphicsBackend {
    // Buffers

    /// Create a buffer
    fn create_buffer(&mut self, desc: &BufferDescriptor) -> BackendResult<BufferHandle>;

    /// Write data to a buffer
    fn write_buffer(&mut self, buffer: BufferHandle, offset: u64, data: &[u8]) -> BackendResult<()>;

    /// Persistently mapped address of a host-visible buffer
    fn mapped_ptr(&self, buffer: BufferHandle) -> Option<NonNull<u8>>;

    /// Destroy a buffer, releasing its memory and mapping
    fn destroy_buffer(&mut self, buffer: BufferHandle);

    // Textures

    /// Create a texture
    fn create_texture(&mut self, desc: &TextureDescriptor) -> BackendResult<TextureHandle>;

    /// Create a texture view covering the whole texture
    fn create_texture_view(&mut self, texture: TextureHandle) -> BackendResult<TextureViewHandle>;

    fn destroy_texture_view(&mut self, view: TextureViewHandle);

    fn destroy_texture(&mut self, texture: TextureHandle);

    /// Create a sampler
    fn create_sampler(&mut self, desc: &SamplerDescriptor) -> BackendResult<SamplerHandle>;

    fn destroy_sampler(&mut self, sampler: SamplerHandle);

    // Render passes

    fn create_render_pass(&mut self, layout: &RenderPassLayout) -> BackendResult<RenderPassHandle>;

    fn destroy_render_pass(&mut self, render_pass: RenderPassHandle);

    fn create_framebuffer(&mut self, desc: &FramebufferDescriptor)
        -> BackendResult<FramebufferHandle>;

    fn destroy_framebuffer(&mut self, framebuffer: FramebufferHandle);

    // Descriptors

    /// Create a bind group layout
    fn create_bind_group_layout(
        &mut self,
        entries: &[BindGroupLayoutEntry],
    ) -> BackendResult<BindGroupLayoutHandle>;

    fn destroy_bind_group_layout(&mut self, layout: BindGroupLayoutHandle);

    /// Create a pool bind groups are allocated from
    fn create_bind_group_pool(
        &mut self,
        desc: &BindGroupPoolDescriptor,
    ) -> BackendResult<BindGroupPoolHandle>;

    /// Destroy a pool together with every bind group allocated from it
    fn destroy_bind_group_pool(&mut self, pool: BindGroupPoolHandle);

    fn allocate_bind_group(
        &mut self,
        pool: BindGroupPoolHandle,
        layout: BindGroupLayoutHandle,
    ) -> BackendResult<BindGroupHandle>;

    /// Return a single bind group to its pool
    fn free_bind_group(&mut self, pool: BindGroupPoolHandle, group: BindGroupHandle);

    /// Point bindings of a bind group at resources
    fn update_bind_group(&mut self, group: BindGroupHandle, entries: &[(u32, BindGroupEntry)]);

    // Pipelines

    fn create_pipeline_layout(
        &mut self,
        desc: &PipelineLayoutDescriptor,
    ) -> BackendResult<PipelineLayoutHandle>;

    fn destroy_pipeline_layout(&mut self, layout: PipelineLayoutHandle);

    /// Create a render pipeline
    fn create_render_pipeline(
        &mut self,
        desc: &RenderPipelineDescriptor,
    ) -> BackendResult<RenderPipelineHandle>;

    fn destroy_render_pipeline(&mut self, pipeline: RenderPipelineHandle);

    // Command recording

    /// Begin a render pass
    fn begin_render_pass(&mut self, info: &RenderPassBeginInfo);

    /// End the current render pass
    fn end_render_pass(&mut self);

    /// Record an image layout transition
    fn transition_texture(&mut self, texture: TextureHandle, from: TextureLayout, to: TextureLayout);

    /// Set the render pipeline
    fn set_render_pipeline(&mut self, pipeline: RenderPipelineHandle);

    /// Set a bind group
    fn set_bind_group(&mut self, layout: PipelineLayoutHandle, index: u32, group: BindGroupHandle);

    /// Upload push constants for the bound pipeline layout
    fn set_push_constants(
        &mut self,
        layout: PipelineLayoutHandle,
        stages: ShaderStageFlags,
        offset: u32,
        data: &[u8],
    );

    /// Set vertex buffer
    fn set_vertex_buffer(&mut self, slot: u32, buffer: BufferHandle, offset: u64);

    /// Set index buffer
    fn set_index_buffer(&mut self, buffer: BufferHandle, offset: u64, format: IndexFormat);

    /// Set viewport
    fn set_viewport(&mut self, x: f32, y: f32, width: f32, height: f32, min_depth: f32, max_depth: f32);

    /// Set scissor rect
    fn set_scissor_rect(&mut self, x: u32, y: u32, width: u32, height: u32);

    /// Draw primitives
    fn draw(&mut self, vertices: Range<u32>, instances: Range<u32>);

    /// Draw indexed primitives
    fn draw_indexed(&mut self, indices: Range<u32>, base_vertex: i32, instances: Range<u32>);
}

/// A backend that presents to a window surface
pub trait SurfaceBackend: GraphicsBackend {
    /// Get the actual surface size (may be clamped by device limits)
    fn surface_size(&self) -> (u32, u32);

    /// Get the swapchain format
    fn swapchain_format(&self) -> TextureFormat;

    /// Render pass every swapchain framebuffer is compatible with
    fn surface_render_pass(&self) -> RenderPassHandle;

    /// Resize the swapchain
    fn resize(&mut self, width: u32, height: u32) -> BackendResult<()>;

    /// Begin a new frame and start recording
    fn begin_frame(&mut self) -> BackendResult<FrameContext>;

    /// Submit recorded commands and present the frame
    fn end_frame(&mut self) -> BackendResult<()>;

    /// Block until the device has finished all submitted work
    fn wait_idle(&mut self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_handles() {
        assert!(BufferHandle::NULL.is_null());
        assert!(BufferHandle::default().is_null());
        assert!(!RenderPipelineHandle(3).is_null());
        assert_eq!(TextureHandle(7).raw(), 7);
    }

    #[test]
    fn test_error_display() {
        let err = BackendError::OutOfBounds {
            offset: 8,
            len: 16,
            size: 20,
        };
        assert_eq!(
            err.to_string(),
            "Write of 16 bytes at offset 8 exceeds buffer size 20"
        );
        assert_eq!(BackendError::InvalidHandle("buffer").to_string(), "Invalid buffer handle");
    }
}
