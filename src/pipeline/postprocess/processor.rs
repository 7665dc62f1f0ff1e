//! Offscreen color target and the composite pass that resolves it

use crate::backend::{
    AttachmentDescription, AttachmentLoadOp, BackendError, BackendResult, BindGroupEntry,
    BindGroupHandle, BindGroupLayoutEntry, BindGroupLayoutHandle, BindGroupPoolDescriptor,
    BindGroupPoolHandle, BindingType, BufferUsage, ClearValue, Face, FramebufferDescriptor,
    FramebufferHandle, FrontFace, GraphicsBackend, PipelineLayoutDescriptor, PipelineLayoutHandle,
    PrimitiveTopology, RenderPassBeginInfo, RenderPassHandle, RenderPassLayout,
    RenderPipelineDescriptor, RenderPipelineHandle, SamplerDescriptor, SamplerHandle,
    ShaderStageFlags, StoreOp, TextureDescriptor, TextureFormat, TextureHandle, TextureLayout,
    TextureUsage, TextureViewHandle,
};
use crate::material::PipelineTarget;
use crate::pipeline::postprocess::{PostProcessConfig, PostProcessUniforms};
use crate::resources::GpuBuffer;

/// Bytecode of the fullscreen triangle vertex stage
pub const FULLSCREEN_VERTEX_SHADER: &str = "shaders/fullscreen_vert.spv";

/// Bytecode of the composite fragment stage
pub const POST_FRAGMENT_SHADER: &str = "shaders/post_frag.spv";

/// Clear color of the offscreen target
pub const OFFSCREEN_CLEAR_COLOR: [f32; 4] = [0.0, 0.0, 0.0, 1.0];

const SOURCE_BINDING: u32 = 0;
const UNIFORM_BINDING: u32 = 1;

/// Lifecycle of a [`PostProcessor`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PostProcessState {
    #[default]
    Uninitialized,
    Ready,
    InOffscreenPass,
}

/// Redirects scene draws into an offscreen color target and composites that
/// target into an output framebuffer through the configured effect stack.
///
/// ```text
/// Uninitialized --init--> Ready --begin--> InOffscreenPass --end--> Ready
/// ```
///
/// `cleanup` is valid from any state. Calling `begin`, `end` or
/// `apply_effects` from the wrong state is a programming error and panics.
#[derive(Debug, Default)]
pub struct PostProcessor {
    pub config: PostProcessConfig,

    state: PostProcessState,
    width: u32,
    height: u32,
    formats: Option<(TextureFormat, TextureFormat)>,

    color_texture: TextureHandle,
    color_view: TextureViewHandle,
    depth_texture: TextureHandle,
    depth_view: TextureViewHandle,
    render_pass: RenderPassHandle,
    framebuffer: FramebufferHandle,
    sampler: SamplerHandle,
    bind_group_layout: BindGroupLayoutHandle,
    pool: BindGroupPoolHandle,
    bind_group: BindGroupHandle,
    uniforms: GpuBuffer,
    pipeline_layout: PipelineLayoutHandle,
    pipeline: RenderPipelineHandle,
    /// Render pass `pipeline` was built against
    output_pass: RenderPassHandle,
}

impl PostProcessor {
    pub fn new(config: PostProcessConfig) -> Self {
        Self {
            config,
            ..Default::default()
        }
    }

    /// Create the offscreen target and composite pipeline.
    ///
    /// The composite pipeline is built against `output_pass`, the pass
    /// [`PostProcessor::apply_effects`] will normally draw into. On failure
    /// everything created so far is released and the processor stays
    /// uninitialized.
    pub fn init<B: GraphicsBackend>(
        &mut self,
        backend: &mut B,
        width: u32,
        height: u32,
        color_format: TextureFormat,
        depth_format: TextureFormat,
        output_pass: RenderPassHandle,
    ) -> BackendResult<()> {
        if self.state != PostProcessState::Uninitialized {
            log::debug!("Post-processor re-initialized, releasing previous target");
            self.cleanup(backend);
        }
        if !depth_format.is_depth() {
            return Err(BackendError::TextureCreationFailed(format!(
                "{depth_format:?} is not a depth format"
            )));
        }

        self.width = width;
        self.height = height;
        self.formats = Some((color_format, depth_format));

        if let Err(e) = self.create_resources(backend, color_format, depth_format, output_pass) {
            log::error!("Failed to initialize post-processor ({width}x{height}): {e}");
            self.release(backend);
            return Err(e);
        }

        self.state = PostProcessState::Ready;
        log::info!("Post-processor initialized ({width}x{height}, {color_format:?})");
        Ok(())
    }

    fn create_resources<B: GraphicsBackend>(
        &mut self,
        backend: &mut B,
        color_format: TextureFormat,
        depth_format: TextureFormat,
        output_pass: RenderPassHandle,
    ) -> BackendResult<()> {
        self.color_texture = backend.create_texture(&TextureDescriptor {
            label: Some("offscreen_color".into()),
            width: self.width,
            height: self.height,
            format: color_format,
            usage: TextureUsage::RENDER_ATTACHMENT | TextureUsage::TEXTURE_BINDING,
        })?;
        self.color_view = backend.create_texture_view(self.color_texture)?;

        self.depth_texture = backend.create_texture(&TextureDescriptor {
            label: Some("offscreen_depth".into()),
            width: self.width,
            height: self.height,
            format: depth_format,
            usage: TextureUsage::RENDER_ATTACHMENT,
        })?;
        self.depth_view = backend.create_texture_view(self.depth_texture)?;

        self.render_pass = backend.create_render_pass(&RenderPassLayout {
            label: Some("offscreen".into()),
            color_attachments: vec![AttachmentDescription {
                format: color_format,
                load_op: AttachmentLoadOp::Clear,
                store_op: StoreOp::Store,
                initial_layout: TextureLayout::Undefined,
                final_layout: TextureLayout::ColorAttachment,
            }],
            depth_attachment: Some(AttachmentDescription {
                format: depth_format,
                load_op: AttachmentLoadOp::Clear,
                store_op: StoreOp::Discard,
                initial_layout: TextureLayout::Undefined,
                final_layout: TextureLayout::DepthAttachment,
            }),
        })?;

        self.framebuffer = backend.create_framebuffer(&FramebufferDescriptor {
            label: Some("offscreen".into()),
            render_pass: self.render_pass,
            attachments: vec![self.color_view, self.depth_view],
            width: self.width,
            height: self.height,
        })?;

        self.sampler = backend.create_sampler(&SamplerDescriptor {
            label: Some("offscreen_sampler".into()),
            ..Default::default()
        })?;

        self.bind_group_layout = backend.create_bind_group_layout(&[
            BindGroupLayoutEntry {
                binding: SOURCE_BINDING,
                visibility: ShaderStageFlags::FRAGMENT,
                ty: BindingType::CombinedImageSampler,
            },
            BindGroupLayoutEntry {
                binding: UNIFORM_BINDING,
                visibility: ShaderStageFlags::FRAGMENT,
                ty: BindingType::UniformBuffer,
            },
        ])?;

        self.pool = backend.create_bind_group_pool(&BindGroupPoolDescriptor {
            label: Some("post_process_pool".into()),
            max_sets: 1,
            uniform_buffers: 1,
            combined_image_samplers: 1,
        })?;
        self.bind_group = backend.allocate_bind_group(self.pool, self.bind_group_layout)?;

        let uniforms = self.config.uniforms(self.width, self.height);
        self.uniforms = GpuBuffer::create_init(
            backend,
            "post_process_uniforms",
            BufferUsage::UNIFORM | BufferUsage::COPY_DST,
            bytemuck::bytes_of(&uniforms),
            true,
        )?;

        backend.update_bind_group(
            self.bind_group,
            &[
                (
                    SOURCE_BINDING,
                    BindGroupEntry::CombinedImageSampler {
                        view: self.color_view,
                        sampler: self.sampler,
                    },
                ),
                (
                    UNIFORM_BINDING,
                    BindGroupEntry::Buffer {
                        buffer: self.uniforms.handle(),
                        offset: 0,
                        size: Some(self.uniforms.size()),
                    },
                ),
            ],
        );

        self.pipeline_layout = backend.create_pipeline_layout(&PipelineLayoutDescriptor {
            label: Some("post_process".into()),
            bind_group_layouts: vec![self.bind_group_layout],
            push_constant_ranges: vec![],
        })?;
        self.pipeline = self.build_pipeline(backend, output_pass)?;
        self.output_pass = output_pass;
        Ok(())
    }

    fn build_pipeline<B: GraphicsBackend>(
        &self,
        backend: &mut B,
        output_pass: RenderPassHandle,
    ) -> BackendResult<RenderPipelineHandle> {
        backend.create_render_pipeline(&RenderPipelineDescriptor {
            label: Some("post_process_composite".into()),
            layout: self.pipeline_layout,
            render_pass: output_pass,
            vertex_shader: FULLSCREEN_VERTEX_SHADER.into(),
            fragment_shader: POST_FRAGMENT_SHADER.into(),
            defines: vec![],
            vertex_layouts: vec![],
            primitive_topology: PrimitiveTopology::TriangleList,
            front_face: FrontFace::Ccw,
            cull_mode: Face::None,
            depth_stencil: None,
            blend: None,
        })
    }

    /// Start redirecting draws into the offscreen target
    pub fn begin_offscreen_pass<B: GraphicsBackend>(&mut self, backend: &mut B) {
        assert_eq!(
            self.state,
            PostProcessState::Ready,
            "begin_offscreen_pass requires a ready post-processor"
        );

        backend.begin_render_pass(&RenderPassBeginInfo {
            render_pass: self.render_pass,
            framebuffer: self.framebuffer,
            width: self.width,
            height: self.height,
            clear_values: vec![
                ClearValue::Color(OFFSCREEN_CLEAR_COLOR),
                ClearValue::DepthStencil {
                    depth: 1.0,
                    stencil: 0,
                },
            ],
        });
        backend.set_viewport(0.0, 0.0, self.width as f32, self.height as f32, 0.0, 1.0);
        backend.set_scissor_rect(0, 0, self.width, self.height);
        self.state = PostProcessState::InOffscreenPass;
    }

    /// Close the offscreen scope and make the target sampleable
    pub fn end_offscreen_pass<B: GraphicsBackend>(&mut self, backend: &mut B) {
        assert_eq!(
            self.state,
            PostProcessState::InOffscreenPass,
            "end_offscreen_pass requires an open offscreen pass"
        );

        backend.end_render_pass();
        backend.transition_texture(
            self.color_texture,
            TextureLayout::ColorAttachment,
            TextureLayout::ShaderReadOnly,
        );
        self.state = PostProcessState::Ready;
    }

    /// Composite the offscreen target into `framebuffer`.
    ///
    /// Begins and ends `render_pass` itself, so overlays record afterwards in
    /// a pass of their own. The composite pipeline is rebuilt when
    /// `render_pass` differs from the one it was built for; if the rebuild
    /// fails the previous pipeline is kept.
    pub fn apply_effects<B: GraphicsBackend>(
        &mut self,
        backend: &mut B,
        framebuffer: FramebufferHandle,
        render_pass: RenderPassHandle,
    ) -> BackendResult<()> {
        assert_eq!(
            self.state,
            PostProcessState::Ready,
            "apply_effects requires a ready post-processor outside the offscreen pass"
        );

        let uniforms = self.config.uniforms(self.width, self.height);
        self.uniforms
            .update(backend, 0, bytemuck::bytes_of(&uniforms))?;

        if render_pass != self.output_pass || self.pipeline.is_null() {
            log::debug!("Rebuilding composite pipeline for a new output pass");
            let pipeline = self.build_pipeline(backend, render_pass)?;
            let previous = std::mem::replace(&mut self.pipeline, pipeline);
            if !previous.is_null() {
                backend.destroy_render_pipeline(previous);
            }
            self.output_pass = render_pass;
        }

        backend.begin_render_pass(&RenderPassBeginInfo {
            render_pass,
            framebuffer,
            width: self.width,
            height: self.height,
            clear_values: vec![
                ClearValue::Color(OFFSCREEN_CLEAR_COLOR),
                ClearValue::DepthStencil {
                    depth: 1.0,
                    stencil: 0,
                },
            ],
        });
        backend.set_viewport(0.0, 0.0, self.width as f32, self.height as f32, 0.0, 1.0);
        backend.set_scissor_rect(0, 0, self.width, self.height);
        backend.set_render_pipeline(self.pipeline);
        backend.set_bind_group(self.pipeline_layout, 0, self.bind_group);
        // Fullscreen triangle, positions come from the vertex index
        backend.draw(0..3, 0..1);
        backend.end_render_pass();
        Ok(())
    }

    /// Recreate the target at a new size with the same formats and output pass
    pub fn resize<B: GraphicsBackend>(
        &mut self,
        backend: &mut B,
        width: u32,
        height: u32,
    ) -> BackendResult<()> {
        let Some((color_format, depth_format)) = self.formats else {
            return Err(BackendError::InitializationFailed(
                "post-processor resized before init".into(),
            ));
        };
        let output_pass = self.output_pass;
        self.cleanup(backend);
        self.init(backend, width, height, color_format, depth_format, output_pass)
    }

    /// Destroy every resource in reverse creation order. Valid from any state.
    pub fn cleanup<B: GraphicsBackend>(&mut self, backend: &mut B) {
        if self.state == PostProcessState::InOffscreenPass {
            log::warn!("Post-processor cleaned up inside its offscreen pass");
        }
        let was_initialized = self.state != PostProcessState::Uninitialized;
        self.release(backend);
        if was_initialized {
            log::debug!("Post-processor cleaned up");
        }
    }

    fn release<B: GraphicsBackend>(&mut self, backend: &mut B) {
        if !self.pipeline.is_null() {
            backend.destroy_render_pipeline(std::mem::take(&mut self.pipeline));
        }
        if !self.pipeline_layout.is_null() {
            backend.destroy_pipeline_layout(std::mem::take(&mut self.pipeline_layout));
        }
        self.uniforms.destroy(backend);
        // The set goes away with its pool
        self.bind_group = BindGroupHandle::NULL;
        if !self.pool.is_null() {
            backend.destroy_bind_group_pool(std::mem::take(&mut self.pool));
        }
        if !self.bind_group_layout.is_null() {
            backend.destroy_bind_group_layout(std::mem::take(&mut self.bind_group_layout));
        }
        if !self.sampler.is_null() {
            backend.destroy_sampler(std::mem::take(&mut self.sampler));
        }
        if !self.framebuffer.is_null() {
            backend.destroy_framebuffer(std::mem::take(&mut self.framebuffer));
        }
        if !self.render_pass.is_null() {
            backend.destroy_render_pass(std::mem::take(&mut self.render_pass));
        }
        if !self.depth_view.is_null() {
            backend.destroy_texture_view(std::mem::take(&mut self.depth_view));
        }
        if !self.depth_texture.is_null() {
            backend.destroy_texture(std::mem::take(&mut self.depth_texture));
        }
        if !self.color_view.is_null() {
            backend.destroy_texture_view(std::mem::take(&mut self.color_view));
        }
        if !self.color_texture.is_null() {
            backend.destroy_texture(std::mem::take(&mut self.color_texture));
        }
        self.state = PostProcessState::Uninitialized;
    }

    pub fn state(&self) -> PostProcessState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == PostProcessState::Ready
    }

    pub fn extent(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Target scene pipelines must be built against to draw in the offscreen scope
    pub fn offscreen_target(&self) -> Option<PipelineTarget> {
        let (color_format, depth_format) = self.formats?;
        if self.render_pass.is_null() {
            return None;
        }
        Some(PipelineTarget {
            render_pass: self.render_pass,
            color_format,
            depth_format: Some(depth_format),
        })
    }

    pub fn color_texture(&self) -> TextureHandle {
        self.color_texture
    }

    pub fn color_view(&self) -> TextureViewHandle {
        self.color_view
    }

    pub fn render_pass(&self) -> RenderPassHandle {
        self.render_pass
    }

    pub fn framebuffer(&self) -> FramebufferHandle {
        self.framebuffer
    }

    pub fn sampler(&self) -> SamplerHandle {
        self.sampler
    }

    pub fn bind_group(&self) -> BindGroupHandle {
        self.bind_group
    }

    pub fn pipeline(&self) -> RenderPipelineHandle {
        self.pipeline
    }

    pub fn uniform_buffer(&self) -> &GpuBuffer {
        &self.uniforms
    }

    /// Uniform block the next composite will upload
    pub fn uniforms(&self) -> PostProcessUniforms {
        self.config.uniforms(self.width, self.height)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{HeadlessBackend, RecordedCommand};

    fn output_pass(backend: &mut HeadlessBackend) -> RenderPassHandle {
        backend
            .create_render_pass(&RenderPassLayout {
                label: Some("output".into()),
                color_attachments: vec![AttachmentDescription {
                    format: TextureFormat::Bgra8Unorm,
                    load_op: AttachmentLoadOp::Clear,
                    store_op: StoreOp::Store,
                    initial_layout: TextureLayout::Undefined,
                    final_layout: TextureLayout::Present,
                }],
                depth_attachment: None,
            })
            .unwrap()
    }

    fn ready(backend: &mut HeadlessBackend) -> (PostProcessor, RenderPassHandle) {
        let pass = output_pass(backend);
        let mut post = PostProcessor::default();
        post.init(
            backend,
            800,
            600,
            TextureFormat::Rgba16Float,
            TextureFormat::Depth32Float,
            pass,
        )
        .unwrap();
        (post, pass)
    }

    #[test]
    fn test_init_creates_target() {
        let mut backend = HeadlessBackend::new();
        let (post, _) = ready(&mut backend);

        assert_eq!(post.state(), PostProcessState::Ready);
        let desc = backend.texture_descriptor(post.color_texture()).unwrap();
        assert_eq!((desc.width, desc.height), (800, 600));
        assert!(desc.usage.contains(TextureUsage::TEXTURE_BINDING | TextureUsage::RENDER_ATTACHMENT));

        let layout = backend.render_pass_layout(post.render_pass()).unwrap();
        assert_eq!(layout.color_attachments[0].format, TextureFormat::Rgba16Float);
        assert_eq!(
            layout.depth_attachment.map(|d| d.format),
            Some(TextureFormat::Depth32Float)
        );

        let entries = backend.bind_group_entries(post.bind_group()).unwrap();
        assert!(matches!(
            entries[&0],
            BindGroupEntry::CombinedImageSampler { view, .. } if view == post.color_view()
        ));
    }

    #[test]
    fn test_rejects_color_depth_format() {
        let mut backend = HeadlessBackend::new();
        let pass = output_pass(&mut backend);
        let mut post = PostProcessor::default();
        let result = post.init(
            &mut backend,
            800,
            600,
            TextureFormat::Rgba16Float,
            TextureFormat::Rgba8Unorm,
            pass,
        );
        assert!(result.is_err());
        assert_eq!(post.state(), PostProcessState::Uninitialized);
    }

    #[test]
    fn test_offscreen_scope_records() {
        let mut backend = HeadlessBackend::new();
        let (mut post, _) = ready(&mut backend);
        backend.clear_commands();

        post.begin_offscreen_pass(&mut backend);
        assert_eq!(post.state(), PostProcessState::InOffscreenPass);
        post.end_offscreen_pass(&mut backend);

        let commands = backend.take_commands();
        match &commands[0] {
            RecordedCommand::BeginRenderPass { clear_values, .. } => {
                assert_eq!(clear_values[0], ClearValue::Color([0.0, 0.0, 0.0, 1.0]));
                assert_eq!(
                    clear_values[1],
                    ClearValue::DepthStencil {
                        depth: 1.0,
                        stencil: 0
                    }
                );
            }
            other => panic!("unexpected first command {other:?}"),
        }
        assert_eq!(
            backend.texture_layout(post.color_texture()),
            Some(TextureLayout::ShaderReadOnly)
        );
    }

    #[test]
    fn test_apply_effects_draws_fullscreen_triangle() {
        let mut backend = HeadlessBackend::new();
        let (mut post, pass) = ready(&mut backend);
        backend.clear_commands();

        post.apply_effects(&mut backend, FramebufferHandle::NULL, pass).unwrap();
        let commands = backend.take_commands();
        assert!(commands.contains(&RecordedCommand::Draw {
            vertices: 0..3,
            instances: 0..1
        }));
        assert_eq!(commands.last(), Some(&RecordedCommand::EndRenderPass));
        assert!(!backend.is_recording_render_pass());
    }

    #[test]
    fn test_apply_effects_rebuilds_for_new_pass() {
        let mut backend = HeadlessBackend::new();
        let (mut post, _) = ready(&mut backend);
        let first = post.pipeline();

        let other = output_pass(&mut backend);
        post.apply_effects(&mut backend, FramebufferHandle::NULL, other).unwrap();
        assert_ne!(post.pipeline(), first);
        assert_eq!(backend.stats().pipelines, 1);
        assert_eq!(
            backend.pipeline_descriptor(post.pipeline()).unwrap().render_pass,
            other
        );
    }

    #[test]
    fn test_failed_rebuild_keeps_previous_pipeline() {
        let mut backend = HeadlessBackend::new();
        let (mut post, pass) = ready(&mut backend);
        let first = post.pipeline();
        let other = output_pass(&mut backend);

        backend.set_allocation_budget(Some(0));
        let result = post.apply_effects(&mut backend, FramebufferHandle::NULL, other);
        assert!(matches!(result, Err(BackendError::OutOfMemory)));
        assert!(!backend.is_recording_render_pass());
        assert_eq!(post.pipeline(), first);
        assert_eq!(backend.stats().pipelines, 1);

        backend.set_allocation_budget(None);
        backend.clear_commands();
        post.apply_effects(&mut backend, FramebufferHandle::NULL, pass).unwrap();
        let commands = backend.take_commands();
        assert!(commands.contains(&RecordedCommand::SetRenderPipeline(first)));
        assert!(!commands.contains(&RecordedCommand::SetRenderPipeline(
            RenderPipelineHandle::NULL
        )));
    }

    #[test]
    #[should_panic(expected = "end_offscreen_pass")]
    fn test_end_without_begin_panics() {
        let mut backend = HeadlessBackend::new();
        let (mut post, _) = ready(&mut backend);
        post.end_offscreen_pass(&mut backend);
    }

    #[test]
    #[should_panic(expected = "apply_effects")]
    fn test_apply_inside_scope_panics() {
        let mut backend = HeadlessBackend::new();
        let (mut post, pass) = ready(&mut backend);
        post.begin_offscreen_pass(&mut backend);
        let _ = post.apply_effects(&mut backend, FramebufferHandle::NULL, pass);
    }

    #[test]
    fn test_partial_failure_releases_everything() {
        // init creates 13 objects
        for budget in 0..13 {
            let mut backend = HeadlessBackend::new();
            let pass = output_pass(&mut backend);
            let baseline = backend.stats().total();
            backend.set_allocation_budget(Some(budget));

            let mut post = PostProcessor::default();
            let result = post.init(
                &mut backend,
                64,
                64,
                TextureFormat::Rgba16Float,
                TextureFormat::Depth32Float,
                pass,
            );
            assert!(result.is_err(), "budget {budget} should not be enough");
            assert_eq!(post.state(), PostProcessState::Uninitialized);
            assert_eq!(backend.stats().total(), baseline, "leak at budget {budget}");
        }
    }

    #[test]
    fn test_cleanup_is_idempotent() {
        let mut backend = HeadlessBackend::new();
        let (mut post, _) = ready(&mut backend);
        let baseline = 1;

        post.cleanup(&mut backend);
        post.cleanup(&mut backend);
        assert_eq!(post.state(), PostProcessState::Uninitialized);
        assert_eq!(backend.stats().total(), baseline);
    }

    #[test]
    fn test_resize() {
        let mut backend = HeadlessBackend::new();
        let (mut post, pass) = ready(&mut backend);
        post.resize(&mut backend, 1024, 768).unwrap();
        assert_eq!(post.extent(), (1024, 768));
        assert!(post.is_ready());
        assert_eq!(
            backend.pipeline_descriptor(post.pipeline()).unwrap().render_pass,
            pass
        );

        let mut fresh = PostProcessor::default();
        assert!(fresh.resize(&mut backend, 10, 10).is_err());
    }
}
