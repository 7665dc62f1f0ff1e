//! Frame orchestration
//!
//! [`Renderer`] ties a presenting backend to the shader library and the
//! post-processor. Each frame it opens the offscreen scope, draws the
//! submitted items with their materials, composites the result into the
//! swapchain image and hands the frame to an optional [`Overlay`].

use glam::{Mat4, Vec3};

use crate::backend::{
    BackendError, BackendResult, FrameContext, GraphicsBackend, ShaderStageFlags, SurfaceBackend,
};
use crate::material::{Material, PipelineTarget, ShaderLibrary};
use crate::pipeline::PostProcessor;
use crate::resources::{BoneBuffer, Mesh, MeshData, MeshFactory, ShadowLitPushConstants};
use crate::RendererConfig;

/// Camera and light state shared by every draw of a frame
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SceneLighting {
    pub view_proj: Mat4,
    pub light_view_proj: Mat4,
    pub light_dir: Vec3,
    pub ambient_strength: f32,
    pub light_color: Vec3,
    pub shadow_bias: f32,
}

impl Default for SceneLighting {
    fn default() -> Self {
        let block = ShadowLitPushConstants::default();
        Self {
            view_proj: block.view_proj,
            light_view_proj: block.light_view_proj,
            light_dir: block.light_dir,
            ambient_strength: block.ambient_strength,
            light_color: block.light_color,
            shadow_bias: block.shadow_bias,
        }
    }
}

impl SceneLighting {
    /// Push-constant block for one draw with the given model matrix
    pub fn push_constants(&self, model: Mat4) -> ShadowLitPushConstants {
        ShadowLitPushConstants {
            view_proj: self.view_proj,
            model,
            light_view_proj: self.light_view_proj,
            light_dir: self.light_dir,
            ambient_strength: self.ambient_strength,
            light_color: self.light_color,
            shadow_bias: self.shadow_bias,
        }
    }
}

/// A mesh drawn once with a material
#[derive(Debug, Clone, Copy)]
pub struct DrawItem<'a> {
    pub mesh: &'a Mesh,
    pub material: &'a Material,
    pub model: Mat4,
}

/// Something drawn on top of the composited frame, such as a GUI.
///
/// Overlays run after the composite pass has ended and record their own
/// render pass into `frame.framebuffer`.
pub trait Overlay<B: GraphicsBackend> {
    fn record(&mut self, backend: &mut B, frame: &FrameContext) -> BackendResult<()>;
}

/// Owns the backend, the shader library and the post-processor
pub struct Renderer<B: SurfaceBackend> {
    backend: B,
    library: ShaderLibrary,
    post: PostProcessor,
    config: RendererConfig,
    pending_resize: Option<(u32, u32)>,
    frame_count: u64,
    shut_down: bool,
}

impl<B: SurfaceBackend> Renderer<B> {
    /// Load the shader directory and create the offscreen target at the
    /// surface size
    pub fn new(mut backend: B, config: RendererConfig) -> BackendResult<Self> {
        let mut library = ShaderLibrary::new();
        let loaded = library.load_shader_dir(&config.shader_dir);
        log::info!(
            "Loaded {loaded} shader descriptions from {}, {} shaders registered",
            config.shader_dir.display(),
            library.len()
        );

        let (width, height) = backend.surface_size();
        let output_pass = backend.surface_render_pass();
        let mut post = PostProcessor::new(config.post_process);
        post.init(
            &mut backend,
            width,
            height,
            config.color_format,
            config.depth_format,
            output_pass,
        )?;

        Ok(Self {
            backend,
            library,
            post,
            config,
            pending_resize: None,
            frame_count: 0,
            shut_down: false,
        })
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn library(&self) -> &ShaderLibrary {
        &self.library
    }

    pub fn library_mut(&mut self) -> &mut ShaderLibrary {
        &mut self.library
    }

    pub fn post_processor(&self) -> &PostProcessor {
        &self.post
    }

    pub fn post_processor_mut(&mut self) -> &mut PostProcessor {
        &mut self.post
    }

    pub fn config(&self) -> &RendererConfig {
        &self.config
    }

    /// Frames submitted so far
    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    fn target(&self) -> BackendResult<PipelineTarget> {
        self.post.offscreen_target().ok_or_else(|| {
            BackendError::InitializationFailed("offscreen target is not initialized".into())
        })
    }

    /// Create a material whose pipelines draw into the offscreen scope.
    ///
    /// `bones` is bound for skinned shaders. Fails for an unknown shader.
    pub fn create_material(
        &mut self,
        shader_name: &str,
        material_name: Option<&str>,
        bones: Option<&BoneBuffer>,
    ) -> BackendResult<Material> {
        let target = self.target()?;
        let mut material = self.library.create_material(shader_name, material_name);
        self.library
            .bind_material(&mut self.backend, &mut material, &target)?;
        self.library
            .prepare_material(&mut self.backend, &mut material, bones)?;
        Ok(material)
    }

    /// Rebuild a material's pipelines after its state flags changed
    pub fn rebind_material(&mut self, material: &mut Material) -> BackendResult<()> {
        let target = self.target()?;
        self.library
            .bind_material(&mut self.backend, material, &target)?;
        material.upload(&mut self.backend)
    }

    pub fn create_mesh(&mut self, data: &MeshData) -> BackendResult<Mesh> {
        MeshFactory::create_from_data(&mut self.backend, data)
    }

    pub fn create_bone_buffer(&mut self) -> BackendResult<BoneBuffer> {
        BoneBuffer::create(&mut self.backend)
    }

    /// Release a material's buffer and bind group
    pub fn destroy_material(&mut self, material: &mut Material) {
        material.release(&mut self.backend);
    }

    pub fn destroy_mesh(&mut self, mesh: &mut Mesh) {
        MeshFactory::destroy_mesh(&mut self.backend, mesh);
    }

    /// Queue a framebuffer resize, applied at the start of the next frame.
    /// Zero-sized requests (minimized windows) are ignored.
    pub fn resize(&mut self, width: u32, height: u32) {
        if width == 0 || height == 0 {
            return;
        }
        self.pending_resize = Some((width, height));
    }

    fn apply_resize(&mut self, width: u32, height: u32) -> BackendResult<()> {
        self.backend.wait_idle();
        self.backend.resize(width, height)?;
        let (width, height) = self.backend.surface_size();
        self.post.resize(&mut self.backend, width, height)?;
        log::info!("Resized to {width}x{height}");
        Ok(())
    }

    /// Bring the offscreen target to the extent of the acquired image.
    ///
    /// The backend may recreate its swapchain while acquiring, and a resize
    /// that failed earlier leaves the post-processor uninitialized.
    fn match_frame_extent(&mut self, frame: &FrameContext) -> BackendResult<()> {
        let extent = (frame.width, frame.height);
        if self.post.is_ready() && self.post.extent() == extent {
            return Ok(());
        }
        if frame.width == 0 || frame.height == 0 {
            return Err(BackendError::SurfaceLost);
        }
        log::debug!(
            "Offscreen target {:?} does not match frame {}x{}, recreating",
            self.post.extent(),
            frame.width,
            frame.height
        );
        self.backend.wait_idle();
        self.post.resize(&mut self.backend, frame.width, frame.height)
    }

    /// Record and present one frame.
    ///
    /// A frame skipped because the surface is out of date returns `Ok`. When
    /// a queued resize fails it stays queued and is retried by the next call.
    pub fn render_frame(
        &mut self,
        items: &[DrawItem<'_>],
        lighting: &SceneLighting,
        overlay: Option<&mut dyn Overlay<B>>,
    ) -> BackendResult<()> {
        if let Some((width, height)) = self.pending_resize.take() {
            if let Err(e) = self.apply_resize(width, height) {
                log::warn!("Resize to {width}x{height} failed, retrying next frame: {e}");
                self.pending_resize = Some((width, height));
                return Err(e);
            }
        }

        let frame = match self.backend.begin_frame() {
            Ok(frame) => frame,
            Err(BackendError::SurfaceLost) => {
                log::debug!("Surface out of date, frame skipped");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let recorded = self
            .match_frame_extent(&frame)
            .and_then(|()| self.record_frame(&frame, items, lighting, overlay));
        let presented = self.backend.end_frame();
        if recorded.is_ok() && presented.is_ok() {
            self.frame_count += 1;
        }
        recorded.and(presented)
    }

    fn record_frame(
        &mut self,
        frame: &FrameContext,
        items: &[DrawItem<'_>],
        lighting: &SceneLighting,
        overlay: Option<&mut dyn Overlay<B>>,
    ) -> BackendResult<()> {
        self.post.begin_offscreen_pass(&mut self.backend);
        for item in items {
            self.draw_item(item, lighting);
        }
        self.post.end_offscreen_pass(&mut self.backend);

        self.post
            .apply_effects(&mut self.backend, frame.framebuffer, frame.render_pass)?;

        if let Some(overlay) = overlay {
            overlay.record(&mut self.backend, frame)?;
        }
        Ok(())
    }

    fn draw_item(&mut self, item: &DrawItem<'_>, lighting: &SceneLighting) {
        let Some(pass) = item
            .material
            .forward_pass()
            .filter(|pass| pass.is_materialized())
        else {
            log::warn!("Material '{}' has no pipeline, draw skipped", item.material.name);
            return;
        };

        let backend = &mut self.backend;
        backend.set_render_pipeline(pass.pipeline);
        if !item.material.bind_group().is_null() {
            backend.set_bind_group(pass.layout, 0, item.material.bind_group());
        }
        let constants = lighting.push_constants(item.model);
        backend.set_push_constants(
            pass.layout,
            ShaderStageFlags::VERTEX_FRAGMENT,
            0,
            bytemuck::bytes_of(&constants),
        );
        item.mesh.draw(backend, 1);
    }

    /// Wait for the device and release the post-processor and library.
    /// Called on drop; later calls do nothing.
    pub fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;
        self.backend.wait_idle();
        self.post.cleanup(&mut self.backend);
        self.library.teardown(&mut self.backend);
        log::info!("Renderer shut down after {} frames", self.frame_count);
    }
}

impl<B: SurfaceBackend> Drop for Renderer<B> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{HeadlessBackend, RecordedCommand, TextureFormat};
    use crate::pipeline::PostProcessState;

    fn renderer() -> Renderer<HeadlessBackend> {
        let backend = HeadlessBackend::with_surface(320, 240, TextureFormat::Bgra8UnormSrgb);
        let config = RendererConfig {
            shader_dir: "does-not-exist".into(),
            ..Default::default()
        };
        Renderer::new(backend, config).unwrap()
    }

    struct CountingOverlay {
        calls: usize,
    }

    impl Overlay<HeadlessBackend> for CountingOverlay {
        fn record(&mut self, backend: &mut HeadlessBackend, frame: &FrameContext) -> BackendResult<()> {
            assert!(!backend.is_recording_render_pass());
            assert_eq!((frame.width, frame.height), (320, 240));
            self.calls += 1;
            Ok(())
        }
    }

    #[test]
    fn test_new_initializes_post_processor() {
        let renderer = renderer();
        assert_eq!(renderer.post_processor().state(), PostProcessState::Ready);
        assert_eq!(renderer.post_processor().extent(), (320, 240));
        assert!(renderer.library().has_shader("Standard"));
    }

    #[test]
    fn test_frame_draws_items_between_scopes() {
        let mut renderer = renderer();
        let mesh = renderer.create_mesh(&MeshData::cube()).unwrap();
        let material = renderer.create_material("Standard", None, None).unwrap();
        renderer.backend_mut().clear_commands();

        let model = Mat4::from_translation(Vec3::new(0.0, 1.0, 0.0));
        let items = [DrawItem {
            mesh: &mesh,
            material: &material,
            model,
        }];
        let lighting = SceneLighting::default();
        renderer.render_frame(&items, &lighting, None).unwrap();

        let commands = renderer.backend().commands();
        let expected = RecordedCommand::SetPushConstants {
            layout: material.forward_pass().unwrap().layout,
            stages: ShaderStageFlags::VERTEX_FRAGMENT,
            offset: 0,
            data: bytemuck::bytes_of(&lighting.push_constants(model)).to_vec(),
        };
        assert!(commands.contains(&expected));
        assert!(commands.contains(&RecordedCommand::DrawIndexed {
            indices: 0..36,
            base_vertex: 0,
            instances: 0..1,
        }));
        let begins = commands
            .iter()
            .filter(|c| matches!(c, RecordedCommand::BeginRenderPass { .. }))
            .count();
        assert_eq!(begins, 2);
        assert_eq!(renderer.backend().frames_presented(), 1);
        assert_eq!(renderer.frame_count(), 1);
    }

    #[test]
    fn test_overlay_runs_after_composite() {
        let mut renderer = renderer();
        let mut overlay = CountingOverlay { calls: 0 };
        let lighting = SceneLighting::default();
        renderer
            .render_frame(&[], &lighting, Some(&mut overlay))
            .unwrap();
        renderer
            .render_frame(&[], &lighting, Some(&mut overlay))
            .unwrap();
        assert_eq!(overlay.calls, 2);
    }

    #[test]
    fn test_resize_is_deferred_to_next_frame() {
        let mut renderer = renderer();
        renderer.resize(640, 480);
        renderer.resize(0, 100);
        assert_eq!(renderer.post_processor().extent(), (320, 240));

        renderer
            .render_frame(&[], &SceneLighting::default(), None)
            .unwrap();
        assert_eq!(renderer.backend().surface_size(), (640, 480));
        assert_eq!(renderer.post_processor().extent(), (640, 480));
    }

    #[test]
    fn test_failed_resize_is_retried() {
        let mut renderer = renderer();
        let lighting = SceneLighting::default();
        renderer.resize(640, 480);

        renderer.backend_mut().set_allocation_budget(Some(0));
        assert!(matches!(
            renderer.render_frame(&[], &lighting, None),
            Err(BackendError::OutOfMemory)
        ));
        assert_eq!(renderer.post_processor().state(), PostProcessState::Uninitialized);
        assert_eq!(renderer.backend().frames_presented(), 0);

        renderer.backend_mut().set_allocation_budget(None);
        renderer.render_frame(&[], &lighting, None).unwrap();
        assert_eq!(renderer.post_processor().state(), PostProcessState::Ready);
        assert_eq!(renderer.post_processor().extent(), (640, 480));
        assert_eq!(renderer.frame_count(), 1);
    }

    #[test]
    fn test_swapchain_change_resizes_target() {
        let mut renderer = renderer();
        renderer.backend_mut().simulate_surface_change(200, 100);
        renderer.backend_mut().clear_commands();

        renderer
            .render_frame(&[], &SceneLighting::default(), None)
            .unwrap();

        assert_eq!(renderer.post_processor().extent(), (200, 100));
        let surface_pass = renderer.backend().surface_render_pass();
        let composite = renderer.backend().commands().iter().find_map(|c| match c {
            RecordedCommand::BeginRenderPass {
                render_pass,
                width,
                height,
                ..
            } if *render_pass == surface_pass => Some((*width, *height)),
            _ => None,
        });
        assert_eq!(composite, Some((200, 100)));
    }

    #[test]
    fn test_unknown_shader_material_fails() {
        let mut renderer = renderer();
        assert!(renderer.create_material("Missing", None, None).is_err());
    }

    #[test]
    fn test_shutdown_releases_gpu_objects() {
        let mut renderer = renderer();
        let mut mesh = renderer.create_mesh(&MeshData::quad()).unwrap();
        let mut material = renderer.create_material("Unlit", Some("flat"), None).unwrap();
        renderer.destroy_material(&mut material);
        renderer.destroy_mesh(&mut mesh);
        renderer.shutdown();
        assert_eq!(renderer.backend().stats().total(), 0);
        renderer.shutdown();
    }
}
