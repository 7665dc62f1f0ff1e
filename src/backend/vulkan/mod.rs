//! Vulkan backend implementation using ash
//!
//! Resources live in id-keyed maps, like the headless backend, and memory
//! comes from `gpu-allocator`. Host-visible buffers stay persistently mapped.
//! A single command buffer is recorded per frame and submitted in
//! [`SurfaceBackend::end_frame`].

mod conv;

use std::collections::HashMap;
use std::ffi::CStr;
use std::ops::Range;
use std::ptr::NonNull;
use std::sync::Arc;

use ash::khr::{surface, swapchain};
use ash::vk;
use gpu_allocator::vulkan::{
    Allocation, AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc,
};
use gpu_allocator::MemoryLocation;
use parking_lot::Mutex;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};

use crate::backend::traits::*;
use crate::backend::types::*;

const ENTRY_POINT: &CStr = c"main";

/// Vulkan backend implementation
pub struct VulkanBackend {
    _entry: ash::Entry,
    instance: ash::Instance,
    surface_fn: surface::Instance,
    swapchain_fn: swapchain::Device,
    surface: vk::SurfaceKHR,
    physical_device: vk::PhysicalDevice,
    device: ash::Device,
    graphics_queue: vk::Queue,
    allocator: Option<Arc<Mutex<Allocator>>>,

    // Swapchain
    swapchain: vk::SwapchainKHR,
    swapchain_images: Vec<vk::Image>,
    swapchain_image_views: Vec<vk::ImageView>,
    swapchain_format: vk::Format,
    swapchain_extent: vk::Extent2D,
    swapchain_framebuffers: Vec<u64>,
    surface_render_pass: u64,
    current_image_index: u32,
    needs_recreate: bool,
    vsync: bool,

    // Synchronization
    image_available_semaphore: vk::Semaphore,
    render_finished_semaphore: vk::Semaphore,
    in_flight_fence: vk::Fence,

    // Command pool and buffer
    command_pool: vk::CommandPool,
    command_buffer: vk::CommandBuffer,
    is_recording: bool,

    // Resource storage
    buffers: HashMap<u64, VkBuffer>,
    textures: HashMap<u64, VkTexture>,
    texture_views: HashMap<u64, vk::ImageView>,
    samplers: HashMap<u64, vk::Sampler>,
    render_passes: HashMap<u64, VkRenderPass>,
    framebuffers: HashMap<u64, vk::Framebuffer>,
    descriptor_set_layouts: HashMap<u64, vk::DescriptorSetLayout>,
    descriptor_pools: HashMap<u64, vk::DescriptorPool>,
    descriptor_sets: HashMap<u64, VkBindGroup>,
    pipeline_layouts: HashMap<u64, vk::PipelineLayout>,
    render_pipelines: HashMap<u64, vk::Pipeline>,

    next_id: u64,
}

struct VkBuffer {
    buffer: vk::Buffer,
    allocation: Allocation,
    size: u64,
}

struct VkTexture {
    image: vk::Image,
    allocation: Allocation,
    format: vk::Format,
}

struct VkRenderPass {
    render_pass: vk::RenderPass,
    color_attachments: usize,
}

struct VkBindGroup {
    set: vk::DescriptorSet,
    pool: u64,
}

impl VulkanBackend {
    /// Create instance, device, allocator and a swapchain for `window`
    pub fn new(window: Arc<winit::window::Window>, vsync: bool) -> BackendResult<Self> {
        unsafe {
            let entry = ash::Entry::load()
                .map_err(|e| BackendError::InitializationFailed(e.to_string()))?;

            let app_info = vk::ApplicationInfo::default()
                .application_name(c"zero-render")
                .application_version(vk::make_api_version(0, 0, 1, 0))
                .engine_name(c"zero-render")
                .engine_version(vk::make_api_version(0, 0, 1, 0))
                .api_version(vk::API_VERSION_1_2);

            let display_handle = window
                .display_handle()
                .map_err(|e| BackendError::InitializationFailed(e.to_string()))?;
            let window_handle = window
                .window_handle()
                .map_err(|e| BackendError::InitializationFailed(e.to_string()))?;

            let extensions = ash_window::enumerate_required_extensions(display_handle.as_raw())
                .map_err(|e| BackendError::InitializationFailed(e.to_string()))?
                .to_vec();

            let instance_info = vk::InstanceCreateInfo::default()
                .application_info(&app_info)
                .enabled_extension_names(&extensions);

            let instance = entry
                .create_instance(&instance_info, None)
                .map_err(|e| BackendError::InitializationFailed(e.to_string()))?;

            let surface_fn = surface::Instance::new(&entry, &instance);
            let surface = ash_window::create_surface(
                &entry,
                &instance,
                display_handle.as_raw(),
                window_handle.as_raw(),
                None,
            )
            .map_err(|e| BackendError::SurfaceCreationFailed(e.to_string()))?;

            let physical_devices = instance
                .enumerate_physical_devices()
                .map_err(|e| BackendError::InitializationFailed(e.to_string()))?;

            let (physical_device, graphics_queue_family) = physical_devices
                .into_iter()
                .find_map(|pd| {
                    Self::find_queue_family(&instance, pd, &surface_fn, surface)
                        .map(|family| (pd, family))
                })
                .ok_or_else(|| {
                    BackendError::InitializationFailed("No suitable physical device".into())
                })?;

            let device_name = CStr::from_ptr(
                instance
                    .get_physical_device_properties(physical_device)
                    .device_name
                    .as_ptr(),
            )
            .to_string_lossy()
            .into_owned();

            let queue_priorities = [1.0f32];
            let queue_info = vk::DeviceQueueCreateInfo::default()
                .queue_family_index(graphics_queue_family)
                .queue_priorities(&queue_priorities);

            let device_extensions = [swapchain::NAME.as_ptr()];
            let device_features = vk::PhysicalDeviceFeatures::default();

            let device_info = vk::DeviceCreateInfo::default()
                .queue_create_infos(std::slice::from_ref(&queue_info))
                .enabled_extension_names(&device_extensions)
                .enabled_features(&device_features);

            let device = instance
                .create_device(physical_device, &device_info, None)
                .map_err(|e| BackendError::DeviceCreationFailed(e.to_string()))?;

            let graphics_queue = device.get_device_queue(graphics_queue_family, 0);

            let allocator = Allocator::new(&AllocatorCreateDesc {
                instance: instance.clone(),
                device: device.clone(),
                physical_device,
                debug_settings: Default::default(),
                buffer_device_address: false,
                allocation_sizes: Default::default(),
            })
            .map_err(|e| BackendError::InitializationFailed(e.to_string()))?;

            let swapchain_fn = swapchain::Device::new(&instance, &device);

            let pool_info = vk::CommandPoolCreateInfo::default()
                .queue_family_index(graphics_queue_family)
                .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);

            let command_pool = device
                .create_command_pool(&pool_info, None)
                .map_err(|e| BackendError::InitializationFailed(e.to_string()))?;

            let alloc_info = vk::CommandBufferAllocateInfo::default()
                .command_pool(command_pool)
                .level(vk::CommandBufferLevel::PRIMARY)
                .command_buffer_count(1);

            let command_buffer = device
                .allocate_command_buffers(&alloc_info)
                .map_err(|e| BackendError::InitializationFailed(e.to_string()))?
                .first()
                .copied()
                .ok_or_else(|| BackendError::InitializationFailed("No command buffer".into()))?;

            let semaphore_info = vk::SemaphoreCreateInfo::default();
            let fence_info = vk::FenceCreateInfo::default().flags(vk::FenceCreateFlags::SIGNALED);

            let image_available_semaphore = device
                .create_semaphore(&semaphore_info, None)
                .map_err(|e| BackendError::InitializationFailed(e.to_string()))?;
            let render_finished_semaphore = device
                .create_semaphore(&semaphore_info, None)
                .map_err(|e| BackendError::InitializationFailed(e.to_string()))?;
            let in_flight_fence = device
                .create_fence(&fence_info, None)
                .map_err(|e| BackendError::InitializationFailed(e.to_string()))?;

            let mut backend = Self {
                _entry: entry,
                instance,
                surface_fn,
                swapchain_fn,
                surface,
                physical_device,
                device,
                graphics_queue,
                allocator: Some(Arc::new(Mutex::new(allocator))),
                swapchain: vk::SwapchainKHR::null(),
                swapchain_images: Vec::new(),
                swapchain_image_views: Vec::new(),
                swapchain_format: vk::Format::UNDEFINED,
                swapchain_extent: vk::Extent2D {
                    width: 0,
                    height: 0,
                },
                swapchain_framebuffers: Vec::new(),
                surface_render_pass: 0,
                current_image_index: 0,
                needs_recreate: false,
                vsync,
                image_available_semaphore,
                render_finished_semaphore,
                in_flight_fence,
                command_pool,
                command_buffer,
                is_recording: false,
                buffers: HashMap::new(),
                textures: HashMap::new(),
                texture_views: HashMap::new(),
                samplers: HashMap::new(),
                render_passes: HashMap::new(),
                framebuffers: HashMap::new(),
                descriptor_set_layouts: HashMap::new(),
                descriptor_pools: HashMap::new(),
                descriptor_sets: HashMap::new(),
                pipeline_layouts: HashMap::new(),
                render_pipelines: HashMap::new(),
                next_id: 1,
            };

            let size = window.inner_size();
            backend.create_swapchain(size.width.max(1), size.height.max(1))?;

            log::info!(
                "Vulkan backend created on {device_name} ({}x{}, {:?})",
                backend.swapchain_extent.width,
                backend.swapchain_extent.height,
                backend.swapchain_format
            );
            Ok(backend)
        }
    }

    /// Get the Vulkan instance
    pub fn instance(&self) -> &ash::Instance {
        &self.instance
    }

    /// Get the physical device
    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    /// Get the Vulkan device
    pub fn device(&self) -> &ash::Device {
        &self.device
    }

    /// Get the graphics queue
    pub fn graphics_queue(&self) -> vk::Queue {
        self.graphics_queue
    }

    /// Get the current command buffer (only valid during frame recording)
    pub fn command_buffer(&self) -> vk::CommandBuffer {
        self.command_buffer
    }

    /// Raw render pass behind a handle, for overlays that record directly
    pub fn raw_render_pass(&self, render_pass: RenderPassHandle) -> Option<vk::RenderPass> {
        self.render_passes
            .get(&render_pass.0)
            .map(|pass| pass.render_pass)
    }

    fn issue_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn allocator(&self) -> BackendResult<&Arc<Mutex<Allocator>>> {
        self.allocator.as_ref().ok_or(BackendError::DeviceLost)
    }

    /// Command buffer to record into, if a frame is being recorded
    fn recording(&self) -> Option<vk::CommandBuffer> {
        if self.is_recording {
            Some(self.command_buffer)
        } else {
            log::warn!("VulkanBackend: command recorded outside a frame, ignored");
            None
        }
    }

    fn find_queue_family(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        surface_fn: &surface::Instance,
        surface: vk::SurfaceKHR,
    ) -> Option<u32> {
        let queue_families =
            unsafe { instance.get_physical_device_queue_family_properties(physical_device) };

        queue_families
            .iter()
            .enumerate()
            .find(|(index, family)| {
                let supports_graphics = family.queue_flags.contains(vk::QueueFlags::GRAPHICS);
                let supports_surface = unsafe {
                    surface_fn
                        .get_physical_device_surface_support(physical_device, *index as u32, surface)
                        .unwrap_or(false)
                };
                supports_graphics && supports_surface
            })
            .map(|(index, _)| index as u32)
    }

    fn raw_render_pass_for(&self, layout: &RenderPassLayout) -> BackendResult<vk::RenderPass> {
        let attachments: Vec<vk::AttachmentDescription> = layout
            .color_attachments
            .iter()
            .chain(layout.depth_attachment.iter())
            .map(|a| {
                vk::AttachmentDescription::default()
                    .format(conv::format(a.format))
                    .samples(vk::SampleCountFlags::TYPE_1)
                    .load_op(conv::load_op(a.load_op))
                    .store_op(conv::store_op(a.store_op))
                    .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
                    .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
                    .initial_layout(conv::image_layout(a.initial_layout))
                    .final_layout(conv::image_layout(a.final_layout))
            })
            .collect();

        let color_refs: Vec<vk::AttachmentReference> = (0..layout.color_attachments.len())
            .map(|index| vk::AttachmentReference {
                attachment: index as u32,
                layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            })
            .collect();
        let depth_ref = vk::AttachmentReference {
            attachment: layout.color_attachments.len() as u32,
            layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        };

        let mut subpass = vk::SubpassDescription::default()
            .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
            .color_attachments(&color_refs);
        if layout.depth_attachment.is_some() {
            subpass = subpass.depth_stencil_attachment(&depth_ref);
        }

        let dependency = vk::SubpassDependency {
            src_subpass: vk::SUBPASS_EXTERNAL,
            dst_subpass: 0,
            src_stage_mask: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
                | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS,
            dst_stage_mask: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
                | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS,
            src_access_mask: vk::AccessFlags::empty(),
            dst_access_mask: vk::AccessFlags::COLOR_ATTACHMENT_WRITE
                | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
            dependency_flags: vk::DependencyFlags::empty(),
        };

        let info = vk::RenderPassCreateInfo::default()
            .attachments(&attachments)
            .subpasses(std::slice::from_ref(&subpass))
            .dependencies(std::slice::from_ref(&dependency));

        unsafe { self.device.create_render_pass(&info, None) }
            .map_err(|e| BackendError::PipelineCreationFailed(format!("render pass: {e}")))
    }

    fn surface_pass_layout(format: vk::Format) -> RenderPassLayout {
        RenderPassLayout {
            label: Some("surface".into()),
            color_attachments: vec![AttachmentDescription {
                format: conv::format_back(format),
                load_op: AttachmentLoadOp::Clear,
                store_op: StoreOp::Store,
                initial_layout: TextureLayout::Undefined,
                final_layout: TextureLayout::Present,
            }],
            depth_attachment: None,
        }
    }

    fn destroy_swapchain_framebuffers(&mut self) {
        for id in std::mem::take(&mut self.swapchain_framebuffers) {
            if let Some(framebuffer) = self.framebuffers.remove(&id) {
                unsafe { self.device.destroy_framebuffer(framebuffer, None) };
            }
        }
        for view in self.swapchain_image_views.drain(..) {
            unsafe { self.device.destroy_image_view(view, None) };
        }
    }

    fn create_swapchain(&mut self, width: u32, height: u32) -> BackendResult<()> {
        unsafe {
            self.device.device_wait_idle().ok();
            self.destroy_swapchain_framebuffers();

            let capabilities = self
                .surface_fn
                .get_physical_device_surface_capabilities(self.physical_device, self.surface)
                .map_err(|e| BackendError::SwapchainCreationFailed(e.to_string()))?;

            let formats = self
                .surface_fn
                .get_physical_device_surface_formats(self.physical_device, self.surface)
                .map_err(|e| BackendError::SwapchainCreationFailed(e.to_string()))?;

            let present_modes = self
                .surface_fn
                .get_physical_device_surface_present_modes(self.physical_device, self.surface)
                .map_err(|e| BackendError::SwapchainCreationFailed(e.to_string()))?;

            // Prefer SRGB
            let format = formats
                .iter()
                .find(|f| {
                    f.format == vk::Format::B8G8R8A8_SRGB
                        && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
                })
                .or_else(|| formats.first())
                .copied()
                .ok_or_else(|| {
                    BackendError::SwapchainCreationFailed("surface reports no formats".into())
                })?;

            let present_mode = if self.vsync {
                vk::PresentModeKHR::FIFO
            } else {
                present_modes
                    .iter()
                    .copied()
                    .find(|&m| m == vk::PresentModeKHR::MAILBOX)
                    .unwrap_or(vk::PresentModeKHR::FIFO)
            };

            let extent = if capabilities.current_extent.width != u32::MAX {
                capabilities.current_extent
            } else {
                vk::Extent2D {
                    width: width.clamp(
                        capabilities.min_image_extent.width,
                        capabilities.max_image_extent.width,
                    ),
                    height: height.clamp(
                        capabilities.min_image_extent.height,
                        capabilities.max_image_extent.height,
                    ),
                }
            };

            let image_count = (capabilities.min_image_count + 1).min(
                if capabilities.max_image_count > 0 {
                    capabilities.max_image_count
                } else {
                    u32::MAX
                },
            );

            let old_swapchain = self.swapchain;
            let swapchain_info = vk::SwapchainCreateInfoKHR::default()
                .surface(self.surface)
                .min_image_count(image_count)
                .image_format(format.format)
                .image_color_space(format.color_space)
                .image_extent(extent)
                .image_array_layers(1)
                .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
                .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
                .pre_transform(capabilities.current_transform)
                .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
                .present_mode(present_mode)
                .clipped(true)
                .old_swapchain(old_swapchain);

            self.swapchain = self
                .swapchain_fn
                .create_swapchain(&swapchain_info, None)
                .map_err(|e| BackendError::SwapchainCreationFailed(e.to_string()))?;
            if old_swapchain != vk::SwapchainKHR::null() {
                self.swapchain_fn.destroy_swapchain(old_swapchain, None);
            }

            self.swapchain_images = self
                .swapchain_fn
                .get_swapchain_images(self.swapchain)
                .map_err(|e| BackendError::SwapchainCreationFailed(e.to_string()))?;

            let format_changed = self.swapchain_format != format.format;
            self.swapchain_format = format.format;
            self.swapchain_extent = extent;

            self.swapchain_image_views = self
                .swapchain_images
                .iter()
                .map(|&image| {
                    let view_info = vk::ImageViewCreateInfo::default()
                        .image(image)
                        .view_type(vk::ImageViewType::TYPE_2D)
                        .format(format.format)
                        .subresource_range(vk::ImageSubresourceRange {
                            aspect_mask: vk::ImageAspectFlags::COLOR,
                            base_mip_level: 0,
                            level_count: 1,
                            base_array_layer: 0,
                            layer_count: 1,
                        });
                    self.device.create_image_view(&view_info, None)
                })
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| BackendError::SwapchainCreationFailed(e.to_string()))?;

            if format_changed || self.surface_render_pass == 0 {
                let render_pass =
                    self.raw_render_pass_for(&Self::surface_pass_layout(format.format))?;
                if let Some(old) = self.render_passes.remove(&self.surface_render_pass) {
                    self.device.destroy_render_pass(old.render_pass, None);
                }
                let id = self.issue_id();
                self.render_passes.insert(
                    id,
                    VkRenderPass {
                        render_pass,
                        color_attachments: 1,
                    },
                );
                self.surface_render_pass = id;
            }

            let render_pass = self
                .render_passes
                .get(&self.surface_render_pass)
                .map(|pass| pass.render_pass)
                .ok_or(BackendError::SurfaceLost)?;

            for index in 0..self.swapchain_image_views.len() {
                let attachments = [self.swapchain_image_views[index]];
                let info = vk::FramebufferCreateInfo::default()
                    .render_pass(render_pass)
                    .attachments(&attachments)
                    .width(extent.width)
                    .height(extent.height)
                    .layers(1);
                let framebuffer = self
                    .device
                    .create_framebuffer(&info, None)
                    .map_err(|e| BackendError::SwapchainCreationFailed(e.to_string()))?;
                let id = self.issue_id();
                self.framebuffers.insert(id, framebuffer);
                self.swapchain_framebuffers.push(id);
            }

            self.needs_recreate = false;
            log::debug!(
                "Swapchain created: {}x{}, {} images",
                extent.width,
                extent.height,
                self.swapchain_images.len()
            );
            Ok(())
        }
    }

    fn load_shader_module(&self, path: &str) -> BackendResult<vk::ShaderModule> {
        let mut file = std::fs::File::open(path)
            .map_err(|e| BackendError::ShaderCreationFailed(format!("{path}: {e}")))?;
        let code = ash::util::read_spv(&mut file)
            .map_err(|e| BackendError::ShaderCreationFailed(format!("{path}: {e}")))?;
        let info = vk::ShaderModuleCreateInfo::default().code(&code);
        unsafe { self.device.create_shader_module(&info, None) }
            .map_err(|e| BackendError::ShaderCreationFailed(format!("{path}: {e}")))
    }

    fn build_pipeline(
        &self,
        desc: &RenderPipelineDescriptor,
        vertex: vk::ShaderModule,
        fragment: vk::ShaderModule,
    ) -> BackendResult<vk::Pipeline> {
        let layout = *self
            .pipeline_layouts
            .get(&desc.layout.0)
            .ok_or(BackendError::InvalidHandle("pipeline layout"))?;
        let pass = self
            .render_passes
            .get(&desc.render_pass.0)
            .ok_or(BackendError::InvalidHandle("render pass"))?;

        let stages = [
            vk::PipelineShaderStageCreateInfo::default()
                .stage(vk::ShaderStageFlags::VERTEX)
                .module(vertex)
                .name(ENTRY_POINT),
            vk::PipelineShaderStageCreateInfo::default()
                .stage(vk::ShaderStageFlags::FRAGMENT)
                .module(fragment)
                .name(ENTRY_POINT),
        ];

        let bindings: Vec<vk::VertexInputBindingDescription> = desc
            .vertex_layouts
            .iter()
            .map(|layout| vk::VertexInputBindingDescription {
                binding: layout.binding,
                stride: layout.array_stride as u32,
                input_rate: conv::input_rate(layout.step_mode),
            })
            .collect();
        let attributes: Vec<vk::VertexInputAttributeDescription> = desc
            .vertex_layouts
            .iter()
            .flat_map(|layout| {
                layout
                    .attributes
                    .iter()
                    .map(move |attr| vk::VertexInputAttributeDescription {
                        location: attr.location,
                        binding: layout.binding,
                        format: conv::vertex_format(attr.format),
                        offset: attr.offset as u32,
                    })
            })
            .collect();

        let vertex_input = vk::PipelineVertexInputStateCreateInfo::default()
            .vertex_binding_descriptions(&bindings)
            .vertex_attribute_descriptions(&attributes);
        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::default()
            .topology(conv::topology(desc.primitive_topology));
        let viewport_state = vk::PipelineViewportStateCreateInfo::default()
            .viewport_count(1)
            .scissor_count(1);
        let rasterization = vk::PipelineRasterizationStateCreateInfo::default()
            .polygon_mode(vk::PolygonMode::FILL)
            .cull_mode(conv::cull_mode(desc.cull_mode))
            .front_face(conv::front_face(desc.front_face))
            .line_width(1.0);
        let multisample = vk::PipelineMultisampleStateCreateInfo::default()
            .rasterization_samples(vk::SampleCountFlags::TYPE_1);
        let depth_stencil = match desc.depth_stencil {
            Some(state) => vk::PipelineDepthStencilStateCreateInfo::default()
                .depth_test_enable(state.depth_test_enabled)
                .depth_write_enable(state.depth_write_enabled)
                .depth_compare_op(conv::compare_op(state.depth_compare)),
            None => vk::PipelineDepthStencilStateCreateInfo::default(),
        };
        let blend_attachments =
            vec![conv::color_blend_attachment(desc.blend); pass.color_attachments];
        let color_blend =
            vk::PipelineColorBlendStateCreateInfo::default().attachments(&blend_attachments);
        let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dynamic_state =
            vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states);

        let info = vk::GraphicsPipelineCreateInfo::default()
            .stages(&stages)
            .vertex_input_state(&vertex_input)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterization)
            .multisample_state(&multisample)
            .depth_stencil_state(&depth_stencil)
            .color_blend_state(&color_blend)
            .dynamic_state(&dynamic_state)
            .layout(layout)
            .render_pass(pass.render_pass)
            .subpass(0);

        let pipelines = unsafe {
            self.device
                .create_graphics_pipelines(vk::PipelineCache::null(), &[info], None)
        }
        .map_err(|(_, e)| BackendError::PipelineCreationFailed(e.to_string()))?;
        pipelines
            .first()
            .copied()
            .ok_or_else(|| BackendError::PipelineCreationFailed("no pipeline returned".into()))
    }

    /// Copy into a device-local buffer through a transient staging buffer
    fn upload_via_staging(&self, dst: vk::Buffer, offset: u64, data: &[u8]) -> BackendResult<()> {
        let size = data.len() as u64;
        let info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(vk::BufferUsageFlags::TRANSFER_SRC)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let staging = unsafe { self.device.create_buffer(&info, None) }
            .map_err(|e| BackendError::BufferCreationFailed(e.to_string()))?;
        let requirements = unsafe { self.device.get_buffer_memory_requirements(staging) };

        let allocator = self.allocator()?;
        let allocation = allocator.lock().allocate(&AllocationCreateDesc {
            name: "staging",
            requirements,
            location: MemoryLocation::CpuToGpu,
            linear: true,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        });
        let mut allocation = match allocation {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { self.device.destroy_buffer(staging, None) };
                return Err(BackendError::BufferCreationFailed(e.to_string()));
            }
        };

        let result = unsafe {
            self.device
                .bind_buffer_memory(staging, allocation.memory(), allocation.offset())
                .map_err(|e| BackendError::BufferCreationFailed(e.to_string()))
        }
        .and_then(|()| {
            let mapped = allocation
                .mapped_slice_mut()
                .ok_or(BackendError::NotHostVisible)?;
            mapped[..data.len()].copy_from_slice(data);
            self.submit_immediate(|device, cmd| unsafe {
                device.cmd_copy_buffer(
                    cmd,
                    staging,
                    dst,
                    &[vk::BufferCopy {
                        src_offset: 0,
                        dst_offset: offset,
                        size,
                    }],
                );
            })
        });

        unsafe { self.device.destroy_buffer(staging, None) };
        if let Err(e) = allocator.lock().free(allocation) {
            log::warn!("VulkanBackend: failed to free staging allocation: {e}");
        }
        result
    }

    /// Record and submit a one-off command buffer, waiting for completion
    fn submit_immediate(
        &self,
        record: impl FnOnce(&ash::Device, vk::CommandBuffer),
    ) -> BackendResult<()> {
        unsafe {
            let alloc_info = vk::CommandBufferAllocateInfo::default()
                .command_pool(self.command_pool)
                .level(vk::CommandBufferLevel::PRIMARY)
                .command_buffer_count(1);
            let cmd = self
                .device
                .allocate_command_buffers(&alloc_info)
                .map_err(|e| BackendError::BufferCreationFailed(e.to_string()))?
                .first()
                .copied()
                .ok_or_else(|| BackendError::BufferCreationFailed("no command buffer".into()))?;

            let begin_info = vk::CommandBufferBeginInfo::default()
                .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            let result = self
                .device
                .begin_command_buffer(cmd, &begin_info)
                .and_then(|()| {
                    record(&self.device, cmd);
                    self.device.end_command_buffer(cmd)
                })
                .and_then(|()| {
                    let submit_info =
                        vk::SubmitInfo::default().command_buffers(std::slice::from_ref(&cmd));
                    self.device
                        .queue_submit(self.graphics_queue, &[submit_info], vk::Fence::null())
                })
                .and_then(|()| self.device.queue_wait_idle(self.graphics_queue))
                .map_err(|e| BackendError::BufferCreationFailed(e.to_string()));

            self.device.free_command_buffers(self.command_pool, &[cmd]);
            result
        }
    }

    fn free_allocation(&self, allocation: Allocation) {
        if let Some(allocator) = &self.allocator {
            if let Err(e) = allocator.lock().free(allocation) {
                log::warn!("VulkanBackend: failed to free allocation: {e}");
            }
        }
    }
}

impl GraphicsBackend for VulkanBackend {
    fn create_buffer(&mut self, desc: &BufferDescriptor) -> BackendResult<BufferHandle> {
        if desc.size == 0 {
            return Err(BackendError::BufferCreationFailed("zero-sized buffer".into()));
        }
        let mut usage = conv::buffer_usage(desc.usage);
        if !desc.host_visible {
            usage |= vk::BufferUsageFlags::TRANSFER_DST;
        }

        let buffer_info = vk::BufferCreateInfo::default()
            .size(desc.size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer = unsafe { self.device.create_buffer(&buffer_info, None) }
            .map_err(|e| BackendError::BufferCreationFailed(e.to_string()))?;
        let requirements = unsafe { self.device.get_buffer_memory_requirements(buffer) };

        let location = if desc.host_visible {
            MemoryLocation::CpuToGpu
        } else {
            MemoryLocation::GpuOnly
        };

        let allocation = self.allocator()?.lock().allocate(&AllocationCreateDesc {
            name: desc.label.as_deref().unwrap_or("buffer"),
            requirements,
            location,
            linear: true,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        });
        let allocation = match allocation {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { self.device.destroy_buffer(buffer, None) };
                return Err(BackendError::BufferCreationFailed(e.to_string()));
            }
        };

        if let Err(e) =
            unsafe { self.device.bind_buffer_memory(buffer, allocation.memory(), allocation.offset()) }
        {
            unsafe { self.device.destroy_buffer(buffer, None) };
            self.free_allocation(allocation);
            return Err(BackendError::BufferCreationFailed(e.to_string()));
        }

        let id = self.issue_id();
        self.buffers.insert(
            id,
            VkBuffer {
                buffer,
                allocation,
                size: desc.size,
            },
        );
        Ok(BufferHandle(id))
    }

    fn write_buffer(&mut self, buffer: BufferHandle, offset: u64, data: &[u8]) -> BackendResult<()> {
        let vk_buffer = self
            .buffers
            .get_mut(&buffer.0)
            .ok_or(BackendError::InvalidHandle("buffer"))?;

        let len = data.len() as u64;
        if offset.checked_add(len).map_or(true, |end| end > vk_buffer.size) {
            return Err(BackendError::OutOfBounds {
                offset,
                len,
                size: vk_buffer.size,
            });
        }
        if data.is_empty() {
            return Ok(());
        }

        if let Some(mapped) = vk_buffer.allocation.mapped_slice_mut() {
            let start = offset as usize;
            mapped[start..start + data.len()].copy_from_slice(data);
            return Ok(());
        }

        let raw = vk_buffer.buffer;
        self.upload_via_staging(raw, offset, data)
    }

    fn mapped_ptr(&self, buffer: BufferHandle) -> Option<NonNull<u8>> {
        self.buffers
            .get(&buffer.0)?
            .allocation
            .mapped_ptr()
            .map(|ptr| ptr.cast::<u8>())
    }

    fn destroy_buffer(&mut self, buffer: BufferHandle) {
        if let Some(vk_buffer) = self.buffers.remove(&buffer.0) {
            unsafe { self.device.destroy_buffer(vk_buffer.buffer, None) };
            self.free_allocation(vk_buffer.allocation);
        }
    }

    fn create_texture(&mut self, desc: &TextureDescriptor) -> BackendResult<TextureHandle> {
        if desc.width == 0 || desc.height == 0 {
            return Err(BackendError::TextureCreationFailed(format!(
                "zero-sized texture {}x{}",
                desc.width, desc.height
            )));
        }
        let format = conv::format(desc.format);
        let image_info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .extent(vk::Extent3D {
                width: desc.width,
                height: desc.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .format(format)
            .tiling(vk::ImageTiling::OPTIMAL)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .usage(conv::image_usage(desc.usage, desc.format.is_depth()))
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .samples(vk::SampleCountFlags::TYPE_1);

        let image = unsafe { self.device.create_image(&image_info, None) }
            .map_err(|e| BackendError::TextureCreationFailed(e.to_string()))?;
        let requirements = unsafe { self.device.get_image_memory_requirements(image) };

        let allocation = self.allocator()?.lock().allocate(&AllocationCreateDesc {
            name: desc.label.as_deref().unwrap_or("texture"),
            requirements,
            location: MemoryLocation::GpuOnly,
            linear: false,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        });
        let allocation = match allocation {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { self.device.destroy_image(image, None) };
                return Err(BackendError::TextureCreationFailed(e.to_string()));
            }
        };

        if let Err(e) =
            unsafe { self.device.bind_image_memory(image, allocation.memory(), allocation.offset()) }
        {
            unsafe { self.device.destroy_image(image, None) };
            self.free_allocation(allocation);
            return Err(BackendError::TextureCreationFailed(e.to_string()));
        }

        let id = self.issue_id();
        self.textures.insert(
            id,
            VkTexture {
                image,
                allocation,
                format,
            },
        );
        Ok(TextureHandle(id))
    }

    fn create_texture_view(&mut self, texture: TextureHandle) -> BackendResult<TextureViewHandle> {
        let tex = self
            .textures
            .get(&texture.0)
            .ok_or(BackendError::InvalidHandle("texture"))?;

        let aspect_mask = if conv::is_depth_format(tex.format) {
            vk::ImageAspectFlags::DEPTH
        } else {
            vk::ImageAspectFlags::COLOR
        };

        let view_info = vk::ImageViewCreateInfo::default()
            .image(tex.image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(tex.format)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            });

        let view = unsafe { self.device.create_image_view(&view_info, None) }
            .map_err(|e| BackendError::TextureCreationFailed(e.to_string()))?;

        let id = self.issue_id();
        self.texture_views.insert(id, view);
        Ok(TextureViewHandle(id))
    }

    fn destroy_texture_view(&mut self, view: TextureViewHandle) {
        if let Some(view) = self.texture_views.remove(&view.0) {
            unsafe { self.device.destroy_image_view(view, None) };
        }
    }

    fn destroy_texture(&mut self, texture: TextureHandle) {
        if let Some(vk_texture) = self.textures.remove(&texture.0) {
            unsafe { self.device.destroy_image(vk_texture.image, None) };
            self.free_allocation(vk_texture.allocation);
        }
    }

    fn create_sampler(&mut self, desc: &SamplerDescriptor) -> BackendResult<SamplerHandle> {
        let sampler_info = vk::SamplerCreateInfo::default()
            .mag_filter(conv::filter(desc.mag_filter))
            .min_filter(conv::filter(desc.min_filter))
            .mipmap_mode(conv::mipmap_mode(desc.mipmap_filter))
            .address_mode_u(conv::address_mode(desc.address_mode_u))
            .address_mode_v(conv::address_mode(desc.address_mode_v))
            .address_mode_w(conv::address_mode(desc.address_mode_w))
            .compare_enable(desc.compare.is_some())
            .compare_op(desc.compare.map_or(vk::CompareOp::ALWAYS, conv::compare_op))
            .min_lod(0.0)
            .max_lod(vk::LOD_CLAMP_NONE)
            .border_color(vk::BorderColor::FLOAT_OPAQUE_BLACK);

        let sampler = unsafe { self.device.create_sampler(&sampler_info, None) }
            .map_err(|e| BackendError::TextureCreationFailed(e.to_string()))?;

        let id = self.issue_id();
        self.samplers.insert(id, sampler);
        Ok(SamplerHandle(id))
    }

    fn destroy_sampler(&mut self, sampler: SamplerHandle) {
        if let Some(sampler) = self.samplers.remove(&sampler.0) {
            unsafe { self.device.destroy_sampler(sampler, None) };
        }
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
        let render_pass = self.raw_render_pass_for(layout)?;
        let id = self.issue_id();
        self.render_passes.insert(
            id,
            VkRenderPass {
                render_pass,
                color_attachments: layout.color_attachments.len(),
            },
        );
        Ok(RenderPassHandle(id))
    }

    fn destroy_render_pass(&mut self, render_pass: RenderPassHandle) {
        if render_pass.0 == self.surface_render_pass {
            return;
        }
        if let Some(pass) = self.render_passes.remove(&render_pass.0) {
            unsafe { self.device.destroy_render_pass(pass.render_pass, None) };
        }
    }

    fn create_framebuffer(
        &mut self,
        desc: &FramebufferDescriptor,
    ) -> BackendResult<FramebufferHandle> {
        let render_pass = self
            .render_passes
            .get(&desc.render_pass.0)
            .ok_or(BackendError::InvalidHandle("render pass"))?
            .render_pass;
        let attachments = desc
            .attachments
            .iter()
            .map(|view| {
                self.texture_views
                    .get(&view.0)
                    .copied()
                    .ok_or(BackendError::InvalidHandle("texture view"))
            })
            .collect::<BackendResult<Vec<_>>>()?;

        let info = vk::FramebufferCreateInfo::default()
            .render_pass(render_pass)
            .attachments(&attachments)
            .width(desc.width)
            .height(desc.height)
            .layers(1);
        let framebuffer = unsafe { self.device.create_framebuffer(&info, None) }
            .map_err(|e| BackendError::TextureCreationFailed(format!("framebuffer: {e}")))?;

        let id = self.issue_id();
        self.framebuffers.insert(id, framebuffer);
        Ok(FramebufferHandle(id))
    }

    fn destroy_framebuffer(&mut self, framebuffer: FramebufferHandle) {
        if self.swapchain_framebuffers.contains(&framebuffer.0) {
            return;
        }
        if let Some(framebuffer) = self.framebuffers.remove(&framebuffer.0) {
            unsafe { self.device.destroy_framebuffer(framebuffer, None) };
        }
    }

    fn create_bind_group_layout(
        &mut self,
        entries: &[BindGroupLayoutEntry],
    ) -> BackendResult<BindGroupLayoutHandle> {
        let bindings: Vec<vk::DescriptorSetLayoutBinding> = entries
            .iter()
            .map(|e| {
                let descriptor_type = match e.ty {
                    BindingType::UniformBuffer => vk::DescriptorType::UNIFORM_BUFFER,
                    BindingType::CombinedImageSampler => {
                        vk::DescriptorType::COMBINED_IMAGE_SAMPLER
                    }
                };
                vk::DescriptorSetLayoutBinding::default()
                    .binding(e.binding)
                    .descriptor_type(descriptor_type)
                    .descriptor_count(1)
                    .stage_flags(conv::shader_stages(e.visibility))
            })
            .collect();

        let layout_info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&bindings);
        let layout = unsafe { self.device.create_descriptor_set_layout(&layout_info, None) }
            .map_err(|e| BackendError::DescriptorCreationFailed(e.to_string()))?;

        let id = self.issue_id();
        self.descriptor_set_layouts.insert(id, layout);
        Ok(BindGroupLayoutHandle(id))
    }

    fn destroy_bind_group_layout(&mut self, layout: BindGroupLayoutHandle) {
        if let Some(layout) = self.descriptor_set_layouts.remove(&layout.0) {
            unsafe { self.device.destroy_descriptor_set_layout(layout, None) };
        }
    }

    fn create_bind_group_pool(
        &mut self,
        desc: &BindGroupPoolDescriptor,
    ) -> BackendResult<BindGroupPoolHandle> {
        let pool_sizes: Vec<vk::DescriptorPoolSize> = [
            (vk::DescriptorType::UNIFORM_BUFFER, desc.uniform_buffers),
            (
                vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                desc.combined_image_samplers,
            ),
        ]
        .into_iter()
        .filter(|(_, count)| *count > 0)
        .map(|(ty, descriptor_count)| vk::DescriptorPoolSize {
            ty,
            descriptor_count,
        })
        .collect();

        let info = vk::DescriptorPoolCreateInfo::default()
            .flags(vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET)
            .max_sets(desc.max_sets.max(1))
            .pool_sizes(&pool_sizes);
        let pool = unsafe { self.device.create_descriptor_pool(&info, None) }
            .map_err(|e| BackendError::DescriptorCreationFailed(e.to_string()))?;

        let id = self.issue_id();
        self.descriptor_pools.insert(id, pool);
        Ok(BindGroupPoolHandle(id))
    }

    fn destroy_bind_group_pool(&mut self, pool: BindGroupPoolHandle) {
        if let Some(raw) = self.descriptor_pools.remove(&pool.0) {
            self.descriptor_sets.retain(|_, group| group.pool != pool.0);
            unsafe { self.device.destroy_descriptor_pool(raw, None) };
        }
    }

    fn allocate_bind_group(
        &mut self,
        pool: BindGroupPoolHandle,
        layout: BindGroupLayoutHandle,
    ) -> BackendResult<BindGroupHandle> {
        let raw_pool = *self
            .descriptor_pools
            .get(&pool.0)
            .ok_or(BackendError::InvalidHandle("bind group pool"))?;
        let raw_layout = *self
            .descriptor_set_layouts
            .get(&layout.0)
            .ok_or(BackendError::InvalidHandle("bind group layout"))?;

        let layouts = [raw_layout];
        let alloc_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(raw_pool)
            .set_layouts(&layouts);
        let set = unsafe { self.device.allocate_descriptor_sets(&alloc_info) }
            .map_err(|e| BackendError::DescriptorCreationFailed(e.to_string()))?
            .first()
            .copied()
            .ok_or_else(|| BackendError::DescriptorCreationFailed("no set returned".into()))?;

        let id = self.issue_id();
        self.descriptor_sets.insert(id, VkBindGroup { set, pool: pool.0 });
        Ok(BindGroupHandle(id))
    }

    fn free_bind_group(&mut self, pool: BindGroupPoolHandle, group: BindGroupHandle) {
        let Some(raw_pool) = self.descriptor_pools.get(&pool.0).copied() else {
            return;
        };
        if let Some(bind_group) = self.descriptor_sets.remove(&group.0) {
            if let Err(e) = unsafe { self.device.free_descriptor_sets(raw_pool, &[bind_group.set]) }
            {
                log::warn!("VulkanBackend: failed to free descriptor set: {e}");
            }
        }
    }

    fn update_bind_group(&mut self, group: BindGroupHandle, entries: &[(u32, BindGroupEntry)]) {
        let Some(set) = self.descriptor_sets.get(&group.0).map(|g| g.set) else {
            log::warn!("VulkanBackend: update of unknown bind group #{}", group.0);
            return;
        };

        let mut buffer_infos = Vec::new();
        let mut image_infos = Vec::new();
        for (_, entry) in entries {
            match entry {
                BindGroupEntry::Buffer {
                    buffer,
                    offset,
                    size,
                } => {
                    let raw = self
                        .buffers
                        .get(&buffer.0)
                        .map_or(vk::Buffer::null(), |b| b.buffer);
                    buffer_infos.push(vk::DescriptorBufferInfo {
                        buffer: raw,
                        offset: *offset,
                        range: size.unwrap_or(vk::WHOLE_SIZE),
                    });
                }
                BindGroupEntry::CombinedImageSampler { view, sampler } => {
                    image_infos.push(vk::DescriptorImageInfo {
                        sampler: self
                            .samplers
                            .get(&sampler.0)
                            .copied()
                            .unwrap_or(vk::Sampler::null()),
                        image_view: self
                            .texture_views
                            .get(&view.0)
                            .copied()
                            .unwrap_or(vk::ImageView::null()),
                        image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                    });
                }
            }
        }

        let mut buffer_iter = buffer_infos.iter();
        let mut image_iter = image_infos.iter();
        let mut writes = Vec::with_capacity(entries.len());
        for (binding, entry) in entries {
            let write = vk::WriteDescriptorSet::default()
                .dst_set(set)
                .dst_binding(*binding);
            let write = match entry {
                BindGroupEntry::Buffer { .. } => match buffer_iter.next() {
                    Some(info) => write
                        .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
                        .buffer_info(std::slice::from_ref(info)),
                    None => continue,
                },
                BindGroupEntry::CombinedImageSampler { .. } => match image_iter.next() {
                    Some(info) => write
                        .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
                        .image_info(std::slice::from_ref(info)),
                    None => continue,
                },
            };
            writes.push(write);
        }

        unsafe { self.device.update_descriptor_sets(&writes, &[]) };
    }

    fn create_pipeline_layout(
        &mut self,
        desc: &PipelineLayoutDescriptor,
    ) -> BackendResult<PipelineLayoutHandle> {
        let set_layouts = desc
            .bind_group_layouts
            .iter()
            .map(|h| {
                self.descriptor_set_layouts
                    .get(&h.0)
                    .copied()
                    .ok_or(BackendError::InvalidHandle("bind group layout"))
            })
            .collect::<BackendResult<Vec<_>>>()?;
        let ranges: Vec<vk::PushConstantRange> = desc
            .push_constant_ranges
            .iter()
            .map(|range| vk::PushConstantRange {
                stage_flags: conv::shader_stages(range.stages),
                offset: range.offset,
                size: range.size,
            })
            .collect();

        let info = vk::PipelineLayoutCreateInfo::default()
            .set_layouts(&set_layouts)
            .push_constant_ranges(&ranges);
        let layout = unsafe { self.device.create_pipeline_layout(&info, None) }
            .map_err(|e| BackendError::PipelineCreationFailed(e.to_string()))?;

        let id = self.issue_id();
        self.pipeline_layouts.insert(id, layout);
        Ok(PipelineLayoutHandle(id))
    }

    fn destroy_pipeline_layout(&mut self, layout: PipelineLayoutHandle) {
        if let Some(layout) = self.pipeline_layouts.remove(&layout.0) {
            unsafe { self.device.destroy_pipeline_layout(layout, None) };
        }
    }

    fn create_render_pipeline(
        &mut self,
        desc: &RenderPipelineDescriptor,
    ) -> BackendResult<RenderPipelineHandle> {
        if !desc.defines.is_empty() {
            log::debug!(
                "Pipeline {:?}: defines {:?} are resolved by the precompiled bytecode",
                desc.label,
                desc.defines
            );
        }

        let vertex = self.load_shader_module(&desc.vertex_shader)?;
        let fragment = match self.load_shader_module(&desc.fragment_shader) {
            Ok(module) => module,
            Err(e) => {
                unsafe { self.device.destroy_shader_module(vertex, None) };
                return Err(e);
            }
        };

        let pipeline = self.build_pipeline(desc, vertex, fragment);
        unsafe {
            self.device.destroy_shader_module(vertex, None);
            self.device.destroy_shader_module(fragment, None);
        }
        let pipeline = pipeline?;

        let id = self.issue_id();
        self.render_pipelines.insert(id, pipeline);
        Ok(RenderPipelineHandle(id))
    }

    fn destroy_render_pipeline(&mut self, pipeline: RenderPipelineHandle) {
        if let Some(pipeline) = self.render_pipelines.remove(&pipeline.0) {
            unsafe { self.device.destroy_pipeline(pipeline, None) };
        }
    }

    fn begin_render_pass(&mut self, info: &RenderPassBeginInfo) {
        let Some(cmd) = self.recording() else {
            return;
        };
        let (Some(pass), Some(&framebuffer)) = (
            self.render_passes.get(&info.render_pass.0),
            self.framebuffers.get(&info.framebuffer.0),
        ) else {
            log::warn!("VulkanBackend: render pass begun with unknown pass or framebuffer");
            return;
        };

        let clear_values: Vec<vk::ClearValue> =
            info.clear_values.iter().map(conv::clear_value).collect();
        let begin_info = vk::RenderPassBeginInfo::default()
            .render_pass(pass.render_pass)
            .framebuffer(framebuffer)
            .render_area(vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent: vk::Extent2D {
                    width: info.width,
                    height: info.height,
                },
            })
            .clear_values(&clear_values);

        unsafe {
            self.device
                .cmd_begin_render_pass(cmd, &begin_info, vk::SubpassContents::INLINE)
        };
    }

    fn end_render_pass(&mut self) {
        if let Some(cmd) = self.recording() {
            unsafe { self.device.cmd_end_render_pass(cmd) };
        }
    }

    fn transition_texture(&mut self, texture: TextureHandle, from: TextureLayout, to: TextureLayout) {
        let Some(cmd) = self.recording() else {
            return;
        };
        let Some(tex) = self.textures.get(&texture.0) else {
            return;
        };

        let aspect_mask = if conv::is_depth_format(tex.format) {
            vk::ImageAspectFlags::DEPTH
        } else {
            vk::ImageAspectFlags::COLOR
        };
        let (src_access, src_stage) = conv::layout_access(from);
        let (dst_access, dst_stage) = conv::layout_access(to);

        let barrier = vk::ImageMemoryBarrier::default()
            .old_layout(conv::image_layout(from))
            .new_layout(conv::image_layout(to))
            .src_access_mask(src_access)
            .dst_access_mask(dst_access)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(tex.image)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            });

        unsafe {
            self.device.cmd_pipeline_barrier(
                cmd,
                src_stage,
                dst_stage,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[barrier],
            )
        };
    }

    fn set_render_pipeline(&mut self, pipeline: RenderPipelineHandle) {
        let Some(cmd) = self.recording() else {
            return;
        };
        if let Some(&raw) = self.render_pipelines.get(&pipeline.0) {
            unsafe {
                self.device
                    .cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, raw)
            };
        }
    }

    fn set_bind_group(&mut self, layout: PipelineLayoutHandle, index: u32, group: BindGroupHandle) {
        let Some(cmd) = self.recording() else {
            return;
        };
        let (Some(&raw_layout), Some(bind_group)) = (
            self.pipeline_layouts.get(&layout.0),
            self.descriptor_sets.get(&group.0),
        ) else {
            return;
        };
        unsafe {
            self.device.cmd_bind_descriptor_sets(
                cmd,
                vk::PipelineBindPoint::GRAPHICS,
                raw_layout,
                index,
                &[bind_group.set],
                &[],
            )
        };
    }

    fn set_push_constants(
        &mut self,
        layout: PipelineLayoutHandle,
        stages: ShaderStageFlags,
        offset: u32,
        data: &[u8],
    ) {
        let Some(cmd) = self.recording() else {
            return;
        };
        if let Some(&raw_layout) = self.pipeline_layouts.get(&layout.0) {
            unsafe {
                self.device.cmd_push_constants(
                    cmd,
                    raw_layout,
                    conv::shader_stages(stages),
                    offset,
                    data,
                )
            };
        }
    }

    fn set_vertex_buffer(&mut self, slot: u32, buffer: BufferHandle, offset: u64) {
        let Some(cmd) = self.recording() else {
            return;
        };
        if let Some(vk_buffer) = self.buffers.get(&buffer.0) {
            unsafe {
                self.device
                    .cmd_bind_vertex_buffers(cmd, slot, &[vk_buffer.buffer], &[offset])
            };
        }
    }

    fn set_index_buffer(&mut self, buffer: BufferHandle, offset: u64, format: IndexFormat) {
        let Some(cmd) = self.recording() else {
            return;
        };
        if let Some(vk_buffer) = self.buffers.get(&buffer.0) {
            unsafe {
                self.device.cmd_bind_index_buffer(
                    cmd,
                    vk_buffer.buffer,
                    offset,
                    conv::index_type(format),
                )
            };
        }
    }

    fn set_viewport(&mut self, x: f32, y: f32, width: f32, height: f32, min_depth: f32, max_depth: f32) {
        let Some(cmd) = self.recording() else {
            return;
        };
        let viewport = vk::Viewport {
            x,
            y,
            width,
            height,
            min_depth,
            max_depth,
        };
        unsafe { self.device.cmd_set_viewport(cmd, 0, &[viewport]) };
    }

    fn set_scissor_rect(&mut self, x: u32, y: u32, width: u32, height: u32) {
        let Some(cmd) = self.recording() else {
            return;
        };
        let scissor = vk::Rect2D {
            offset: vk::Offset2D {
                x: x as i32,
                y: y as i32,
            },
            extent: vk::Extent2D { width, height },
        };
        unsafe { self.device.cmd_set_scissor(cmd, 0, &[scissor]) };
    }

    fn draw(&mut self, vertices: Range<u32>, instances: Range<u32>) {
        let Some(cmd) = self.recording() else {
            return;
        };
        unsafe {
            self.device.cmd_draw(
                cmd,
                vertices.end - vertices.start,
                instances.end - instances.start,
                vertices.start,
                instances.start,
            )
        };
    }

    fn draw_indexed(&mut self, indices: Range<u32>, base_vertex: i32, instances: Range<u32>) {
        let Some(cmd) = self.recording() else {
            return;
        };
        unsafe {
            self.device.cmd_draw_indexed(
                cmd,
                indices.end - indices.start,
                instances.end - instances.start,
                indices.start,
                base_vertex,
                instances.start,
            )
        };
    }
}

impl SurfaceBackend for VulkanBackend {
    fn surface_size(&self) -> (u32, u32) {
        (self.swapchain_extent.width, self.swapchain_extent.height)
    }

    fn swapchain_format(&self) -> TextureFormat {
        conv::format_back(self.swapchain_format)
    }

    fn surface_render_pass(&self) -> RenderPassHandle {
        RenderPassHandle(self.surface_render_pass)
    }

    fn resize(&mut self, width: u32, height: u32) -> BackendResult<()> {
        if width == 0 || height == 0 {
            return Ok(());
        }
        self.create_swapchain(width, height)
    }

    fn begin_frame(&mut self) -> BackendResult<FrameContext> {
        if self.is_recording {
            return Err(BackendError::AcquireImageFailed(
                "previous frame was not ended".into(),
            ));
        }
        if self.needs_recreate {
            let extent = self.swapchain_extent;
            self.create_swapchain(extent.width, extent.height)?;
        }

        unsafe {
            self.device
                .wait_for_fences(&[self.in_flight_fence], true, u64::MAX)
                .map_err(|e| BackendError::AcquireImageFailed(e.to_string()))?;

            let acquired = self.swapchain_fn.acquire_next_image(
                self.swapchain,
                u64::MAX,
                self.image_available_semaphore,
                vk::Fence::null(),
            );
            let image_index = match acquired {
                Ok((index, suboptimal)) => {
                    self.needs_recreate |= suboptimal;
                    index
                }
                Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                    self.needs_recreate = true;
                    return Err(BackendError::SurfaceLost);
                }
                Err(e) => return Err(BackendError::AcquireImageFailed(e.to_string())),
            };
            self.current_image_index = image_index;

            self.device
                .reset_fences(&[self.in_flight_fence])
                .map_err(|e| BackendError::AcquireImageFailed(e.to_string()))?;

            self.device
                .reset_command_buffer(self.command_buffer, vk::CommandBufferResetFlags::empty())
                .map_err(|e| BackendError::AcquireImageFailed(e.to_string()))?;

            let begin_info = vk::CommandBufferBeginInfo::default()
                .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            self.device
                .begin_command_buffer(self.command_buffer, &begin_info)
                .map_err(|e| BackendError::AcquireImageFailed(e.to_string()))?;
        }
        self.is_recording = true;

        let framebuffer = self
            .swapchain_framebuffers
            .get(self.current_image_index as usize)
            .copied()
            .ok_or(BackendError::SurfaceLost)?;

        Ok(FrameContext {
            render_pass: RenderPassHandle(self.surface_render_pass),
            framebuffer: FramebufferHandle(framebuffer),
            image_index: self.current_image_index,
            width: self.swapchain_extent.width,
            height: self.swapchain_extent.height,
        })
    }

    fn end_frame(&mut self) -> BackendResult<()> {
        if !self.is_recording {
            return Err(BackendError::PresentFailed("no frame in flight".into()));
        }
        self.is_recording = false;

        unsafe {
            self.device
                .end_command_buffer(self.command_buffer)
                .map_err(|e| BackendError::PresentFailed(e.to_string()))?;

            let wait_semaphores = [self.image_available_semaphore];
            let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
            let signal_semaphores = [self.render_finished_semaphore];
            let command_buffers = [self.command_buffer];

            let submit_info = vk::SubmitInfo::default()
                .wait_semaphores(&wait_semaphores)
                .wait_dst_stage_mask(&wait_stages)
                .command_buffers(&command_buffers)
                .signal_semaphores(&signal_semaphores);

            self.device
                .queue_submit(self.graphics_queue, &[submit_info], self.in_flight_fence)
                .map_err(|e| BackendError::PresentFailed(e.to_string()))?;

            let swapchains = [self.swapchain];
            let image_indices = [self.current_image_index];
            let present_info = vk::PresentInfoKHR::default()
                .wait_semaphores(&signal_semaphores)
                .swapchains(&swapchains)
                .image_indices(&image_indices);

            match self
                .swapchain_fn
                .queue_present(self.graphics_queue, &present_info)
            {
                Ok(suboptimal) => self.needs_recreate |= suboptimal,
                Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => self.needs_recreate = true,
                Err(e) => return Err(BackendError::PresentFailed(e.to_string())),
            }
        }
        Ok(())
    }

    fn wait_idle(&mut self) {
        if let Err(e) = unsafe { self.device.device_wait_idle() } {
            log::warn!("VulkanBackend: device_wait_idle failed: {e}");
        }
    }
}

impl Drop for VulkanBackend {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();

            for (_, pipeline) in self.render_pipelines.drain() {
                self.device.destroy_pipeline(pipeline, None);
            }
            for (_, layout) in self.pipeline_layouts.drain() {
                self.device.destroy_pipeline_layout(layout, None);
            }
            self.descriptor_sets.clear();
            for (_, pool) in self.descriptor_pools.drain() {
                self.device.destroy_descriptor_pool(pool, None);
            }
            for (_, layout) in self.descriptor_set_layouts.drain() {
                self.device.destroy_descriptor_set_layout(layout, None);
            }
            for (_, framebuffer) in self.framebuffers.drain() {
                self.device.destroy_framebuffer(framebuffer, None);
            }
            self.swapchain_framebuffers.clear();
            for (_, pass) in self.render_passes.drain() {
                self.device.destroy_render_pass(pass.render_pass, None);
            }
            for (_, sampler) in self.samplers.drain() {
                self.device.destroy_sampler(sampler, None);
            }
            for (_, view) in self.texture_views.drain() {
                self.device.destroy_image_view(view, None);
            }
            for view in self.swapchain_image_views.drain(..) {
                self.device.destroy_image_view(view, None);
            }

            if let Some(allocator) = self.allocator.take() {
                let mut allocator = allocator.lock();
                for (_, buffer) in self.buffers.drain() {
                    self.device.destroy_buffer(buffer.buffer, None);
                    let _ = allocator.free(buffer.allocation);
                }
                for (_, texture) in self.textures.drain() {
                    self.device.destroy_image(texture.image, None);
                    let _ = allocator.free(texture.allocation);
                }
            }

            self.device.destroy_command_pool(self.command_pool, None);
            self.device
                .destroy_semaphore(self.image_available_semaphore, None);
            self.device
                .destroy_semaphore(self.render_finished_semaphore, None);
            self.device.destroy_fence(self.in_flight_fence, None);

            self.swapchain_fn.destroy_swapchain(self.swapchain, None);
            self.device.destroy_device(None);
            self.surface_fn.destroy_surface(self.surface, None);
            self.instance.destroy_instance(None);
        }
    }
}
