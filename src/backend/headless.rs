//! Headless GPU backend for testing and tooling.
//!
//! This backend keeps every resource in host memory and records commands
//! instead of executing them, so the rest of the crate can be exercised
//! without GPU hardware. Buffer contents are real bytes and host-visible
//! buffers hand out stable mapped pointers, exactly like a persistently
//! mapped device allocation.

use std::collections::{BTreeMap, HashMap};
use std::ops::Range;
use std::ptr::NonNull;

use crate::backend::traits::*;
use crate::backend::types::*;

/// A command captured by [`HeadlessBackend`]
#[derive(Debug, Clone, PartialEq)]
pub enum RecordedCommand {
    BeginRenderPass {
        render_pass: RenderPassHandle,
        framebuffer: FramebufferHandle,
        width: u32,
        height: u32,
        clear_values: Vec<ClearValue>,
    },
    EndRenderPass,
    TransitionTexture {
        texture: TextureHandle,
        from: TextureLayout,
        to: TextureLayout,
    },
    SetRenderPipeline(RenderPipelineHandle),
    SetBindGroup {
        layout: PipelineLayoutHandle,
        index: u32,
        group: BindGroupHandle,
    },
    SetPushConstants {
        layout: PipelineLayoutHandle,
        stages: ShaderStageFlags,
        offset: u32,
        data: Vec<u8>,
    },
    SetVertexBuffer {
        slot: u32,
        buffer: BufferHandle,
        offset: u64,
    },
    SetIndexBuffer {
        buffer: BufferHandle,
        offset: u64,
        format: IndexFormat,
    },
    SetViewport {
        x: f32,
        y: f32,
        width: f32,
        height: f32,
        min_depth: f32,
        max_depth: f32,
    },
    SetScissorRect {
        x: u32,
        y: u32,
        width: u32,
        height: u32,
    },
    Draw {
        vertices: Range<u32>,
        instances: Range<u32>,
    },
    DrawIndexed {
        indices: Range<u32>,
        base_vertex: i32,
        instances: Range<u32>,
    },
}

/// Number of live resources per kind
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourceStats {
    pub buffers: usize,
    pub textures: usize,
    pub texture_views: usize,
    pub samplers: usize,
    pub render_passes: usize,
    pub framebuffers: usize,
    pub bind_group_layouts: usize,
    pub bind_group_pools: usize,
    pub bind_groups: usize,
    pub pipeline_layouts: usize,
    pub pipelines: usize,
}

impl ResourceStats {
    pub fn total(&self) -> usize {
        self.buffers
            + self.textures
            + self.texture_views
            + self.samplers
            + self.render_passes
            + self.framebuffers
            + self.bind_group_layouts
            + self.bind_group_pools
            + self.bind_groups
            + self.pipeline_layouts
            + self.pipelines
    }
}

/// Heap block owned through a raw pointer so mapped pointers stay valid
/// while the backend itself is borrowed.
struct HostMemory {
    ptr: NonNull<u8>,
    len: usize,
}

impl HostMemory {
    fn zeroed(len: usize) -> Self {
        let boxed = vec![0u8; len].into_boxed_slice();
        let raw = Box::into_raw(boxed) as *mut u8;
        // Box never hands out a null pointer, even for empty slices.
        let ptr = NonNull::new(raw).unwrap_or(NonNull::dangling());
        Self { ptr, len }
    }

    fn as_slice(&self) -> &[u8] {
        // SAFETY: ptr/len describe the live allocation created in `zeroed`.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: ptr/len describe the live allocation created in `zeroed`.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for HostMemory {
    fn drop(&mut self) {
        // SAFETY: reconstructs the box leaked in `zeroed` exactly once.
        unsafe {
            let slice = std::ptr::slice_from_raw_parts_mut(self.ptr.as_ptr(), self.len);
            drop(Box::from_raw(slice));
        }
    }
}

struct HeadlessBuffer {
    desc: BufferDescriptor,
    memory: HostMemory,
}

struct HeadlessTexture {
    desc: TextureDescriptor,
    layout: TextureLayout,
}

struct HeadlessPool {
    desc: BindGroupPoolDescriptor,
    groups: Vec<u64>,
}

struct HeadlessBindGroup {
    pool: u64,
    layout: u64,
    entries: BTreeMap<u32, BindGroupEntry>,
}

struct HeadlessSurface {
    width: u32,
    height: u32,
    format: TextureFormat,
    render_pass: RenderPassHandle,
    framebuffers: Vec<FramebufferHandle>,
    current_image: u32,
    frame_active: bool,
    frames_presented: u64,
    /// Extent the swapchain is recreated at by the next `begin_frame`
    pending_extent: Option<(u32, u32)>,
}

const SURFACE_IMAGE_COUNT: usize = 2;

/// In-memory backend that records commands
pub struct HeadlessBackend {
    buffers: HashMap<u64, HeadlessBuffer>,
    textures: HashMap<u64, HeadlessTexture>,
    texture_views: HashMap<u64, u64>,
    samplers: HashMap<u64, SamplerDescriptor>,
    render_passes: HashMap<u64, RenderPassLayout>,
    framebuffers: HashMap<u64, FramebufferDescriptor>,
    bind_group_layouts: HashMap<u64, Vec<BindGroupLayoutEntry>>,
    bind_group_pools: HashMap<u64, HeadlessPool>,
    bind_groups: HashMap<u64, HeadlessBindGroup>,
    pipeline_layouts: HashMap<u64, PipelineLayoutDescriptor>,
    pipelines: HashMap<u64, RenderPipelineDescriptor>,

    next_id: u64,
    total_created: u64,
    allocation_budget: Option<usize>,

    commands: Vec<RecordedCommand>,
    in_render_pass: bool,
    surface: Option<HeadlessSurface>,
}

impl Default for HeadlessBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl HeadlessBackend {
    /// Create a backend without a presentation surface
    pub fn new() -> Self {
        Self {
            buffers: HashMap::new(),
            textures: HashMap::new(),
            texture_views: HashMap::new(),
            samplers: HashMap::new(),
            render_passes: HashMap::new(),
            framebuffers: HashMap::new(),
            bind_group_layouts: HashMap::new(),
            bind_group_pools: HashMap::new(),
            bind_groups: HashMap::new(),
            pipeline_layouts: HashMap::new(),
            pipelines: HashMap::new(),
            next_id: 1,
            total_created: 0,
            allocation_budget: None,
            commands: Vec::new(),
            in_render_pass: false,
            surface: None,
        }
    }

    /// Create a backend with a simulated swapchain
    pub fn with_surface(width: u32, height: u32, format: TextureFormat) -> Self {
        let mut backend = Self::new();
        let render_pass = RenderPassHandle(backend.issue_id());
        let framebuffers = (0..SURFACE_IMAGE_COUNT)
            .map(|_| FramebufferHandle(backend.issue_id()))
            .collect();
        backend.surface = Some(HeadlessSurface {
            width,
            height,
            format,
            render_pass,
            framebuffers,
            current_image: 0,
            frame_active: false,
            frames_presented: 0,
            pending_extent: None,
        });
        backend
    }

    /// Get the backend name.
    pub fn name(&self) -> &'static str {
        "Headless Backend"
    }

    /// Make the next `begin_frame` recreate the swapchain at a new extent,
    /// as a presentation engine does when the window changes size without
    /// the application being told.
    pub fn simulate_surface_change(&mut self, width: u32, height: u32) {
        if let Some(surface) = self.surface.as_mut() {
            surface.pending_extent = Some((width, height));
        }
    }

    /// Limit how many more resources can be created before creation fails
    /// with [`BackendError::OutOfMemory`]. `None` removes the limit.
    pub fn set_allocation_budget(&mut self, budget: Option<usize>) {
        self.allocation_budget = budget;
    }

    /// Live resources per kind (the simulated swapchain is not counted)
    pub fn stats(&self) -> ResourceStats {
        ResourceStats {
            buffers: self.buffers.len(),
            textures: self.textures.len(),
            texture_views: self.texture_views.len(),
            samplers: self.samplers.len(),
            render_passes: self.render_passes.len(),
            framebuffers: self.framebuffers.len(),
            bind_group_layouts: self.bind_group_layouts.len(),
            bind_group_pools: self.bind_group_pools.len(),
            bind_groups: self.bind_groups.len(),
            pipeline_layouts: self.pipeline_layouts.len(),
            pipelines: self.pipelines.len(),
        }
    }

    /// Number of successful creations since the backend was made
    pub fn total_created(&self) -> u64 {
        self.total_created
    }

    pub fn commands(&self) -> &[RecordedCommand] {
        &self.commands
    }

    pub fn take_commands(&mut self) -> Vec<RecordedCommand> {
        std::mem::take(&mut self.commands)
    }

    pub fn clear_commands(&mut self) {
        self.commands.clear();
    }

    /// Current contents of a buffer
    pub fn read_buffer(&self, buffer: BufferHandle) -> Option<&[u8]> {
        self.buffers.get(&buffer.0).map(|b| b.memory.as_slice())
    }

    pub fn buffer_descriptor(&self, buffer: BufferHandle) -> Option<&BufferDescriptor> {
        self.buffers.get(&buffer.0).map(|b| &b.desc)
    }

    pub fn texture_descriptor(&self, texture: TextureHandle) -> Option<&TextureDescriptor> {
        self.textures.get(&texture.0).map(|t| &t.desc)
    }

    /// Layout a texture was left in by the last recorded transition
    pub fn texture_layout(&self, texture: TextureHandle) -> Option<TextureLayout> {
        self.textures.get(&texture.0).map(|t| t.layout)
    }

    pub fn render_pass_layout(&self, render_pass: RenderPassHandle) -> Option<&RenderPassLayout> {
        self.render_passes.get(&render_pass.0)
    }

    pub fn pipeline_descriptor(
        &self,
        pipeline: RenderPipelineHandle,
    ) -> Option<&RenderPipelineDescriptor> {
        self.pipelines.get(&pipeline.0)
    }

    pub fn pipeline_layout_descriptor(
        &self,
        layout: PipelineLayoutHandle,
    ) -> Option<&PipelineLayoutDescriptor> {
        self.pipeline_layouts.get(&layout.0)
    }

    /// Bindings written into a bind group so far
    pub fn bind_group_entries(&self, group: BindGroupHandle) -> Option<&BTreeMap<u32, BindGroupEntry>> {
        self.bind_groups.get(&group.0).map(|g| &g.entries)
    }

    /// Layout a bind group was allocated with
    pub fn bind_group_layout_of(&self, group: BindGroupHandle) -> Option<BindGroupLayoutHandle> {
        self.bind_groups
            .get(&group.0)
            .map(|g| BindGroupLayoutHandle(g.layout))
    }

    pub fn is_recording_render_pass(&self) -> bool {
        self.in_render_pass
    }

    pub fn frames_presented(&self) -> u64 {
        self.surface.as_ref().map_or(0, |s| s.frames_presented)
    }

    fn issue_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn allocate_id(&mut self, kind: &str) -> BackendResult<u64> {
        if let Some(budget) = self.allocation_budget.as_mut() {
            if *budget == 0 {
                log::debug!("HeadlessBackend: allocation budget exhausted creating {kind}");
                return Err(BackendError::OutOfMemory);
            }
            *budget -= 1;
        }
        self.total_created += 1;
        let id = self.issue_id();
        log::trace!("HeadlessBackend: created {kind} #{id}");
        Ok(id)
    }

    fn is_known_render_pass(&self, render_pass: RenderPassHandle) -> bool {
        self.render_passes.contains_key(&render_pass.0)
            || self
                .surface
                .as_ref()
                .is_some_and(|s| s.render_pass == render_pass)
    }

    fn is_known_framebuffer(&self, framebuffer: FramebufferHandle) -> bool {
        self.framebuffers.contains_key(&framebuffer.0)
            || self
                .surface
                .as_ref()
                .is_some_and(|s| s.framebuffers.contains(&framebuffer))
    }

    fn record(&mut self, command: RecordedCommand) {
        log::trace!("HeadlessBackend: {:?}", command);
        self.commands.push(command);
    }
}

impl GraphicsBackend for HeadlessBackend {
    fn create_buffer(&mut self, desc: &BufferDescriptor) -> BackendResult<BufferHandle> {
        log::trace!(
            "HeadlessBackend: creating buffer {:?} (size: {})",
            desc.label,
            desc.size
        );
        if desc.size == 0 {
            return Err(BackendError::BufferCreationFailed("zero-sized buffer".into()));
        }
        let len = usize::try_from(desc.size)
            .map_err(|_| BackendError::BufferCreationFailed("size exceeds address space".into()))?;
        let id = self.allocate_id("buffer")?;
        self.buffers.insert(
            id,
            HeadlessBuffer {
                desc: desc.clone(),
                memory: HostMemory::zeroed(len),
            },
        );
        Ok(BufferHandle(id))
    }

    fn write_buffer(&mut self, buffer: BufferHandle, offset: u64, data: &[u8]) -> BackendResult<()> {
        let entry = self
            .buffers
            .get_mut(&buffer.0)
            .ok_or(BackendError::InvalidHandle("buffer"))?;
        let size = entry.desc.size;
        let len = data.len() as u64;
        if offset.checked_add(len).map_or(true, |end| end > size) {
            return Err(BackendError::OutOfBounds { offset, len, size });
        }
        let start = offset as usize;
        entry.memory.as_mut_slice()[start..start + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn mapped_ptr(&self, buffer: BufferHandle) -> Option<NonNull<u8>> {
        self.buffers
            .get(&buffer.0)
            .filter(|b| b.desc.host_visible)
            .map(|b| b.memory.ptr)
    }

    fn destroy_buffer(&mut self, buffer: BufferHandle) {
        if self.buffers.remove(&buffer.0).is_some() {
            log::trace!("HeadlessBackend: destroyed buffer #{}", buffer.0);
        }
    }

    fn create_texture(&mut self, desc: &TextureDescriptor) -> BackendResult<TextureHandle> {
        if desc.width == 0 || desc.height == 0 {
            return Err(BackendError::TextureCreationFailed(format!(
                "zero-sized texture {}x{}",
                desc.width, desc.height
            )));
        }
        let id = self.allocate_id("texture")?;
        self.textures.insert(
            id,
            HeadlessTexture {
                desc: desc.clone(),
                layout: TextureLayout::Undefined,
            },
        );
        Ok(TextureHandle(id))
    }

    fn create_texture_view(&mut self, texture: TextureHandle) -> BackendResult<TextureViewHandle> {
        if !self.textures.contains_key(&texture.0) {
            return Err(BackendError::InvalidHandle("texture"));
        }
        let id = self.allocate_id("texture view")?;
        self.texture_views.insert(id, texture.0);
        Ok(TextureViewHandle(id))
    }

    fn destroy_texture_view(&mut self, view: TextureViewHandle) {
        self.texture_views.remove(&view.0);
    }

    fn destroy_texture(&mut self, texture: TextureHandle) {
        self.textures.remove(&texture.0);
    }

    fn create_sampler(&mut self, desc: &SamplerDescriptor) -> BackendResult<SamplerHandle> {
        let id = self.allocate_id("sampler")?;
        self.samplers.insert(id, desc.clone());
        Ok(SamplerHandle(id))
    }

    fn destroy_sampler(&mut self, sampler: SamplerHandle) {
        self.samplers.remove(&sampler.0);
    }

    fn create_render_pass(&mut self, layout: &RenderPassLayout) -> BackendResult<RenderPassHandle> {
        if let Some(depth) = &layout.depth_attachment {
            if !depth.format.is_depth() {
                return Err(BackendError::PipelineCreationFailed(format!(
                    "depth attachment uses color format {:?}",
                    depth.format
                )));
            }
        }
        let id = self.allocate_id("render pass")?;
        self.render_passes.insert(id, layout.clone());
        Ok(RenderPassHandle(id))
    }

    fn destroy_render_pass(&mut self, render_pass: RenderPassHandle) {
        self.render_passes.remove(&render_pass.0);
    }

    fn create_framebuffer(
        &mut self,
        desc: &FramebufferDescriptor,
    ) -> BackendResult<FramebufferHandle> {
        if !self.is_known_render_pass(desc.render_pass) {
            return Err(BackendError::InvalidHandle("render pass"));
        }
        if let Some(missing) = desc
            .attachments
            .iter()
            .find(|v| !self.texture_views.contains_key(&v.0))
        {
            log::debug!("HeadlessBackend: framebuffer references unknown view #{}", missing.0);
            return Err(BackendError::InvalidHandle("texture view"));
        }
        let id = self.allocate_id("framebuffer")?;
        self.framebuffers.insert(id, desc.clone());
        Ok(FramebufferHandle(id))
    }

    fn destroy_framebuffer(&mut self, framebuffer: FramebufferHandle) {
        self.framebuffers.remove(&framebuffer.0);
    }

    fn create_bind_group_layout(
        &mut self,
        entries: &[BindGroupLayoutEntry],
    ) -> BackendResult<BindGroupLayoutHandle> {
        let id = self.allocate_id("bind group layout")?;
        self.bind_group_layouts.insert(id, entries.to_vec());
        Ok(BindGroupLayoutHandle(id))
    }

    fn destroy_bind_group_layout(&mut self, layout: BindGroupLayoutHandle) {
        self.bind_group_layouts.remove(&layout.0);
    }

    fn create_bind_group_pool(
        &mut self,
        desc: &BindGroupPoolDescriptor,
    ) -> BackendResult<BindGroupPoolHandle> {
        let id = self.allocate_id("bind group pool")?;
        self.bind_group_pools.insert(
            id,
            HeadlessPool {
                desc: desc.clone(),
                groups: Vec::new(),
            },
        );
        Ok(BindGroupPoolHandle(id))
    }

    fn destroy_bind_group_pool(&mut self, pool: BindGroupPoolHandle) {
        if let Some(pool) = self.bind_group_pools.remove(&pool.0) {
            for group in pool.groups {
                self.bind_groups.remove(&group);
            }
        }
    }

    fn allocate_bind_group(
        &mut self,
        pool: BindGroupPoolHandle,
        layout: BindGroupLayoutHandle,
    ) -> BackendResult<BindGroupHandle> {
        if !self.bind_group_layouts.contains_key(&layout.0) {
            return Err(BackendError::InvalidHandle("bind group layout"));
        }
        let exhausted = {
            let entry = self
                .bind_group_pools
                .get(&pool.0)
                .ok_or(BackendError::InvalidHandle("bind group pool"))?;
            entry.groups.len() >= entry.desc.max_sets as usize
        };
        if exhausted {
            return Err(BackendError::DescriptorCreationFailed(
                "bind group pool exhausted".into(),
            ));
        }
        let id = self.allocate_id("bind group")?;
        if let Some(entry) = self.bind_group_pools.get_mut(&pool.0) {
            entry.groups.push(id);
        }
        self.bind_groups.insert(
            id,
            HeadlessBindGroup {
                pool: pool.0,
                layout: layout.0,
                entries: BTreeMap::new(),
            },
        );
        Ok(BindGroupHandle(id))
    }

    fn free_bind_group(&mut self, pool: BindGroupPoolHandle, group: BindGroupHandle) {
        let Some(removed) = self.bind_groups.remove(&group.0) else {
            return;
        };
        if removed.pool != pool.0 {
            log::warn!(
                "HeadlessBackend: bind group #{} freed through pool #{} but belongs to #{}",
                group.0,
                pool.0,
                removed.pool
            );
        }
        if let Some(entry) = self.bind_group_pools.get_mut(&removed.pool) {
            entry.groups.retain(|&g| g != group.0);
        }
    }

    fn update_bind_group(&mut self, group: BindGroupHandle, entries: &[(u32, BindGroupEntry)]) {
        match self.bind_groups.get_mut(&group.0) {
            Some(target) => {
                for (binding, entry) in entries {
                    target.entries.insert(*binding, entry.clone());
                }
            }
            None => log::warn!("HeadlessBackend: update of unknown bind group #{}", group.0),
        }
    }

    fn create_pipeline_layout(
        &mut self,
        desc: &PipelineLayoutDescriptor,
    ) -> BackendResult<PipelineLayoutHandle> {
        if desc
            .bind_group_layouts
            .iter()
            .any(|l| !self.bind_group_layouts.contains_key(&l.0))
        {
            return Err(BackendError::InvalidHandle("bind group layout"));
        }
        let id = self.allocate_id("pipeline layout")?;
        self.pipeline_layouts.insert(id, desc.clone());
        Ok(PipelineLayoutHandle(id))
    }

    fn destroy_pipeline_layout(&mut self, layout: PipelineLayoutHandle) {
        self.pipeline_layouts.remove(&layout.0);
    }

    fn create_render_pipeline(
        &mut self,
        desc: &RenderPipelineDescriptor,
    ) -> BackendResult<RenderPipelineHandle> {
        if !self.pipeline_layouts.contains_key(&desc.layout.0) {
            return Err(BackendError::InvalidHandle("pipeline layout"));
        }
        if !self.is_known_render_pass(desc.render_pass) {
            return Err(BackendError::InvalidHandle("render pass"));
        }
        if desc.vertex_shader.is_empty() || desc.fragment_shader.is_empty() {
            return Err(BackendError::ShaderCreationFailed(format!(
                "pipeline {:?} is missing a shader stage",
                desc.label
            )));
        }
        let id = self.allocate_id("render pipeline")?;
        self.pipelines.insert(id, desc.clone());
        Ok(RenderPipelineHandle(id))
    }

    fn destroy_render_pipeline(&mut self, pipeline: RenderPipelineHandle) {
        self.pipelines.remove(&pipeline.0);
    }

    fn begin_render_pass(&mut self, info: &RenderPassBeginInfo) {
        if self.in_render_pass {
            log::warn!("HeadlessBackend: render pass begun inside another render pass");
        }
        if !self.is_known_render_pass(info.render_pass) || !self.is_known_framebuffer(info.framebuffer)
        {
            log::warn!("HeadlessBackend: render pass begun with unknown pass or framebuffer");
        }
        self.in_render_pass = true;
        self.record(RecordedCommand::BeginRenderPass {
            render_pass: info.render_pass,
            framebuffer: info.framebuffer,
            width: info.width,
            height: info.height,
            clear_values: info.clear_values.clone(),
        });
    }

    fn end_render_pass(&mut self) {
        if !self.in_render_pass {
            log::warn!("HeadlessBackend: end_render_pass without an active render pass");
        }
        self.in_render_pass = false;
        self.record(RecordedCommand::EndRenderPass);
    }

    fn transition_texture(&mut self, texture: TextureHandle, from: TextureLayout, to: TextureLayout) {
        if let Some(entry) = self.textures.get_mut(&texture.0) {
            entry.layout = to;
        }
        self.record(RecordedCommand::TransitionTexture { texture, from, to });
    }

    fn set_render_pipeline(&mut self, pipeline: RenderPipelineHandle) {
        self.record(RecordedCommand::SetRenderPipeline(pipeline));
    }

    fn set_bind_group(&mut self, layout: PipelineLayoutHandle, index: u32, group: BindGroupHandle) {
        self.record(RecordedCommand::SetBindGroup {
            layout,
            index,
            group,
        });
    }

    fn set_push_constants(
        &mut self,
        layout: PipelineLayoutHandle,
        stages: ShaderStageFlags,
        offset: u32,
        data: &[u8],
    ) {
        self.record(RecordedCommand::SetPushConstants {
            layout,
            stages,
            offset,
            data: data.to_vec(),
        });
    }

    fn set_vertex_buffer(&mut self, slot: u32, buffer: BufferHandle, offset: u64) {
        self.record(RecordedCommand::SetVertexBuffer {
            slot,
            buffer,
            offset,
        });
    }

    fn set_index_buffer(&mut self, buffer: BufferHandle, offset: u64, format: IndexFormat) {
        self.record(RecordedCommand::SetIndexBuffer {
            buffer,
            offset,
            format,
        });
    }

    fn set_viewport(&mut self, x: f32, y: f32, width: f32, height: f32, min_depth: f32, max_depth: f32) {
        self.record(RecordedCommand::SetViewport {
            x,
            y,
            width,
            height,
            min_depth,
            max_depth,
        });
    }

    fn set_scissor_rect(&mut self, x: u32, y: u32, width: u32, height: u32) {
        self.record(RecordedCommand::SetScissorRect {
            x,
            y,
            width,
            height,
        });
    }

    fn draw(&mut self, vertices: Range<u32>, instances: Range<u32>) {
        self.record(RecordedCommand::Draw {
            vertices,
            instances,
        });
    }

    fn draw_indexed(&mut self, indices: Range<u32>, base_vertex: i32, instances: Range<u32>) {
        self.record(RecordedCommand::DrawIndexed {
            indices,
            base_vertex,
            instances,
        });
    }
}

impl SurfaceBackend for HeadlessBackend {
    fn surface_size(&self) -> (u32, u32) {
        self.surface.as_ref().map_or((0, 0), |s| (s.width, s.height))
    }

    fn swapchain_format(&self) -> TextureFormat {
        self.surface
            .as_ref()
            .map_or(TextureFormat::Bgra8UnormSrgb, |s| s.format)
    }

    fn surface_render_pass(&self) -> RenderPassHandle {
        self.surface
            .as_ref()
            .map_or(RenderPassHandle::NULL, |s| s.render_pass)
    }

    fn resize(&mut self, width: u32, height: u32) -> BackendResult<()> {
        if width == 0 || height == 0 {
            return Ok(());
        }
        let framebuffers: Vec<FramebufferHandle> = (0..SURFACE_IMAGE_COUNT)
            .map(|_| FramebufferHandle(self.issue_id()))
            .collect();
        let surface = self.surface.as_mut().ok_or(BackendError::SurfaceLost)?;
        surface.width = width;
        surface.height = height;
        surface.framebuffers = framebuffers;
        surface.current_image = 0;
        log::debug!("HeadlessBackend: surface resized to {width}x{height}");
        Ok(())
    }

    fn begin_frame(&mut self) -> BackendResult<FrameContext> {
        let pending = self.surface.as_mut().and_then(|s| s.pending_extent.take());
        if let Some((width, height)) = pending {
            self.resize(width, height)?;
        }
        let surface = self.surface.as_mut().ok_or(BackendError::SurfaceLost)?;
        if surface.frame_active {
            return Err(BackendError::AcquireImageFailed(
                "previous frame was not ended".into(),
            ));
        }
        surface.frame_active = true;
        let image_index = surface.current_image;
        Ok(FrameContext {
            render_pass: surface.render_pass,
            framebuffer: surface.framebuffers[image_index as usize],
            image_index,
            width: surface.width,
            height: surface.height,
        })
    }

    fn end_frame(&mut self) -> BackendResult<()> {
        if self.in_render_pass {
            return Err(BackendError::PresentFailed(
                "frame ended inside a render pass".into(),
            ));
        }
        let surface = self.surface.as_mut().ok_or(BackendError::SurfaceLost)?;
        if !surface.frame_active {
            return Err(BackendError::PresentFailed("no frame in flight".into()));
        }
        surface.frame_active = false;
        surface.frames_presented += 1;
        surface.current_image = (surface.current_image + 1) % surface.framebuffers.len() as u32;
        Ok(())
    }

    fn wait_idle(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uniform_desc(size: u64, host_visible: bool) -> BufferDescriptor {
        BufferDescriptor {
            label: Some("test".into()),
            size,
            usage: BufferUsage::UNIFORM,
            host_visible,
        }
    }

    #[test]
    fn test_buffer_write_and_read() {
        let mut backend = HeadlessBackend::new();
        let buffer = backend.create_buffer(&uniform_desc(8, false)).unwrap();
        backend.write_buffer(buffer, 4, &[1, 2, 3, 4]).unwrap();
        assert_eq!(backend.read_buffer(buffer).unwrap(), &[0, 0, 0, 0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_buffer_write_out_of_bounds() {
        let mut backend = HeadlessBackend::new();
        let buffer = backend.create_buffer(&uniform_desc(4, true)).unwrap();
        let err = backend.write_buffer(buffer, 2, &[0; 4]).unwrap_err();
        assert!(matches!(err, BackendError::OutOfBounds { offset: 2, len: 4, size: 4 }));
    }

    #[test]
    fn test_mapped_ptr_only_for_host_visible() {
        let mut backend = HeadlessBackend::new();
        let device_local = backend.create_buffer(&uniform_desc(16, false)).unwrap();
        let mapped = backend.create_buffer(&uniform_desc(16, true)).unwrap();
        assert!(backend.mapped_ptr(device_local).is_none());

        let ptr = backend.mapped_ptr(mapped).unwrap();
        unsafe { ptr.as_ptr().write(42) };
        assert_eq!(backend.read_buffer(mapped).unwrap()[0], 42);
    }

    #[test]
    fn test_allocation_budget() {
        let mut backend = HeadlessBackend::new();
        backend.set_allocation_budget(Some(1));
        assert!(backend.create_sampler(&SamplerDescriptor::default()).is_ok());
        assert!(matches!(
            backend.create_sampler(&SamplerDescriptor::default()),
            Err(BackendError::OutOfMemory)
        ));
        backend.set_allocation_budget(None);
        assert!(backend.create_sampler(&SamplerDescriptor::default()).is_ok());
        assert_eq!(backend.total_created(), 2);
    }

    #[test]
    fn test_pool_destruction_frees_groups() {
        let mut backend = HeadlessBackend::new();
        let layout = backend
            .create_bind_group_layout(&[BindGroupLayoutEntry {
                binding: 0,
                visibility: ShaderStageFlags::FRAGMENT,
                ty: BindingType::UniformBuffer,
            }])
            .unwrap();
        let pool = backend
            .create_bind_group_pool(&BindGroupPoolDescriptor {
                label: None,
                max_sets: 1,
                uniform_buffers: 1,
                combined_image_samplers: 0,
            })
            .unwrap();
        backend.allocate_bind_group(pool, layout).unwrap();
        assert!(backend.allocate_bind_group(pool, layout).is_err());
        assert_eq!(backend.stats().bind_groups, 1);

        backend.destroy_bind_group_pool(pool);
        assert_eq!(backend.stats().bind_groups, 0);
    }

    #[test]
    fn test_surface_frames_rotate() {
        let mut backend = HeadlessBackend::with_surface(64, 32, TextureFormat::Bgra8UnormSrgb);
        let first = backend.begin_frame().unwrap();
        assert!(backend.begin_frame().is_err());
        backend.end_frame().unwrap();
        let second = backend.begin_frame().unwrap();
        backend.end_frame().unwrap();

        assert_eq!(first.render_pass, second.render_pass);
        assert_ne!(first.framebuffer, second.framebuffer);
        assert_eq!((first.width, first.height), (64, 32));
        assert_eq!(backend.frames_presented(), 2);
        assert_eq!(backend.stats().total(), 0);
    }

    #[test]
    fn test_zero_sized_buffer_rejected() {
        let mut backend = HeadlessBackend::new();
        assert!(matches!(
            backend.create_buffer(&uniform_desc(0, false)),
            Err(BackendError::BufferCreationFailed(_))
        ));
        assert_eq!(backend.total_created(), 0);
    }

    #[test]
    fn test_surface_change_applies_at_next_frame() {
        let mut backend = HeadlessBackend::with_surface(64, 32, TextureFormat::Bgra8UnormSrgb);
        let first = backend.begin_frame().unwrap();
        backend.end_frame().unwrap();

        backend.simulate_surface_change(48, 16);
        assert_eq!(backend.surface_size(), (64, 32));
        let second = backend.begin_frame().unwrap();
        backend.end_frame().unwrap();

        assert_eq!((second.width, second.height), (48, 16));
        assert_eq!(backend.surface_size(), (48, 16));
        assert_eq!(first.render_pass, second.render_pass);
        assert_ne!(first.framebuffer, second.framebuffer);
    }
}
