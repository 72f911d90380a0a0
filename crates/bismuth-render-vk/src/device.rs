// SPDX-License-Identifier: CEPL-1.0
use crate::context::{self, DebugMessenger};
use crate::convert::{self, bool32, from_vk, to_vk, vk_err};
use crate::{surface as policy, VkDeviceConfig};
use ash::khr::{surface, swapchain};
use ash::{vk, Entry, Instance};
use bismuth_core::{EngineError, Result};
use bismuth_render::device::{
    self, Acquire, BufferUsage, ClearValues, CommandBuffer, DepthAttachment, Device, Fence, Format,
    Framebuffer, GpuBuffer, GraphicsPipelineDesc, Image, ImageView, PipelineLayout,
    PresentStatus, PushConstantRange, Rect2D, RenderPass, RenderPassBegin, Semaphore, ShaderModule,
    ShaderStages, Swapchain, SwapchainImages, Viewport,
};
use bismuth_render::pipeline::ViewportState;
use bismuth_render::RenderSize;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use std::io::Cursor;
use std::path::PathBuf;
use tracing::{debug, info, warn};

const SPIRV_MAGIC: u32 = 0x0723_0203;

/// One Vulkan instance, surface, logical device, graphics+present queue and
/// command pool.
///
/// Every object created through the [`Device`] trait is owned by the caller
/// and must be destroyed before this drops.
pub struct VkDevice {
    _entry: Entry,
    instance: Instance,
    debug: Option<DebugMessenger>,
    surface_loader: surface::Instance,
    surface: vk::SurfaceKHR,

    phys: vk::PhysicalDevice,
    memory_props: vk::PhysicalDeviceMemoryProperties,
    max_push_constants_size: u32,
    device: ash::Device,
    queue: vk::Queue,

    swapchain_loader: swapchain::Device,
    cmd_pool: vk::CommandPool,
    pipeline_cache: vk::PipelineCache,
    pipeline_cache_path: Option<PathBuf>,
    depth_format: vk::Format,
    config: VkDeviceConfig,
}

impl VkDevice {
    pub fn new(
        window: &dyn HasWindowHandle,
        display: &dyn HasDisplayHandle,
        config: VkDeviceConfig,
    ) -> Result<Self> {
        // STRICT ORDER: instance, then the surface from that instance, then a
        // device queried against that surface.
        let dh = display
            .display_handle()
            .map_err(|e| EngineError::device("display_handle", e))?
            .as_raw();
        let wh = window
            .window_handle()
            .map_err(|e| EngineError::device("window_handle", e))?
            .as_raw();

        unsafe {
            let entry = Entry::linked();
            let (instance, validation) = context::create_instance(&entry, dh)?;
            let debug = if validation {
                Some(DebugMessenger::new(&entry, &instance)?)
            } else {
                None
            };

            let surface_loader = surface::Instance::new(&entry, &instance);
            let surface = ash_window::create_surface(&entry, &instance, dh, wh, None)
                .map_err(vk_err("create_surface"))?;

            let (phys, queue_family) =
                context::pick_device_and_queue(&instance, &surface_loader, surface)?;
            let props = instance.get_physical_device_properties(phys);
            let memory_props = instance.get_physical_device_memory_properties(phys);

            let (device, queue) = context::create_logical_device(&instance, phys, queue_family)?;
            let swapchain_loader = swapchain::Device::new(&instance, &device);
            let cmd_pool = context::create_command_pool(&device, queue_family)?;

            let pipeline_cache_path = config
                .pipeline_cache_dir
                .as_ref()
                .map(|dir| dir.join(context::pipeline_cache_file_name(&props)));
            let pipeline_cache =
                context::create_or_load_pipeline_cache(&device, pipeline_cache_path.as_deref())?;

            let depth_format = context::pick_depth_format(&instance, phys);
            info!(
                "vulkan device ready (depth {:?}, push constants {} bytes, validation {})",
                depth_format, props.limits.max_push_constants_size, validation
            );

            Ok(Self {
                _entry: entry,
                instance,
                debug,
                surface_loader,
                surface,
                phys,
                memory_props,
                max_push_constants_size: props.limits.max_push_constants_size,
                device,
                queue,
                swapchain_loader,
                cmd_pool,
                pipeline_cache,
                pipeline_cache_path,
                depth_format,
                config,
            })
        }
    }

    pub fn config(&self) -> &VkDeviceConfig {
        &self.config
    }

    unsafe fn create_buffer_and_memory(
        &self,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        props: vk::MemoryPropertyFlags,
    ) -> Result<(vk::Buffer, vk::DeviceMemory)> {
        let bci = vk::BufferCreateInfo {
            s_type: vk::StructureType::BUFFER_CREATE_INFO,
            size,
            usage,
            sharing_mode: vk::SharingMode::EXCLUSIVE,
            ..Default::default()
        };
        let buf = self
            .device
            .create_buffer(&bci, None)
            .map_err(vk_err("create_buffer"))?;
        let req = self.device.get_buffer_memory_requirements(buf);
        match self.allocate(req, props) {
            Ok(mem) => match self.device.bind_buffer_memory(buf, mem, 0) {
                Ok(()) => Ok((buf, mem)),
                Err(e) => {
                    self.device.destroy_buffer(buf, None);
                    self.device.free_memory(mem, None);
                    Err(vk_err("bind_buffer_memory")(e))
                }
            },
            Err(e) => {
                self.device.destroy_buffer(buf, None);
                Err(e)
            }
        }
    }

    unsafe fn allocate(
        &self,
        req: vk::MemoryRequirements,
        props: vk::MemoryPropertyFlags,
    ) -> Result<vk::DeviceMemory> {
        let memory_type_index =
            context::find_memory_type(&self.memory_props, req.memory_type_bits, props)
                .ok_or_else(|| {
                    EngineError::device("allocate_memory", format!("no memory type with {props:?}"))
                })?;
        let mai = vk::MemoryAllocateInfo {
            s_type: vk::StructureType::MEMORY_ALLOCATE_INFO,
            allocation_size: req.size,
            memory_type_index,
            ..Default::default()
        };
        self.device
            .allocate_memory(&mai, None)
            .map_err(vk_err("allocate_memory"))
    }

    /// One-shot staging upload: host->staging, then staging->dst on the
    /// graphics queue. Waits until the copy is done.
    unsafe fn upload_via_staging(&self, dst: vk::Buffer, data: &[u8]) -> Result<()> {
        let size = data.len() as vk::DeviceSize;
        let (staging, staging_mem) = self.create_buffer_and_memory(
            size,
            vk::BufferUsageFlags::TRANSFER_SRC,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        )?;
        let result = self.copy_through_staging(staging, staging_mem, dst, data);
        self.device.destroy_buffer(staging, None);
        self.device.free_memory(staging_mem, None);
        result
    }

    unsafe fn copy_through_staging(
        &self,
        staging: vk::Buffer,
        staging_mem: vk::DeviceMemory,
        dst: vk::Buffer,
        data: &[u8],
    ) -> Result<()> {
        let size = data.len() as vk::DeviceSize;
        let ptr = self
            .device
            .map_memory(staging_mem, 0, size, vk::MemoryMapFlags::empty())
            .map_err(vk_err("map_memory"))?;
        std::ptr::copy_nonoverlapping(data.as_ptr(), ptr.cast::<u8>(), data.len());
        self.device.unmap_memory(staging_mem);

        let ai = vk::CommandBufferAllocateInfo {
            s_type: vk::StructureType::COMMAND_BUFFER_ALLOCATE_INFO,
            command_pool: self.cmd_pool,
            level: vk::CommandBufferLevel::PRIMARY,
            command_buffer_count: 1,
            ..Default::default()
        };
        let cmd = self
            .device
            .allocate_command_buffers(&ai)
            .map_err(vk_err("allocate_command_buffers"))?[0];

        let result = (|| {
            let bi = vk::CommandBufferBeginInfo {
                s_type: vk::StructureType::COMMAND_BUFFER_BEGIN_INFO,
                flags: vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT,
                ..Default::default()
            };
            self.device.begin_command_buffer(cmd, &bi)?;
            let region = vk::BufferCopy {
                src_offset: 0,
                dst_offset: 0,
                size,
            };
            self.device
                .cmd_copy_buffer(cmd, staging, dst, std::slice::from_ref(&region));
            self.device.end_command_buffer(cmd)?;

            let si = vk::SubmitInfo {
                s_type: vk::StructureType::SUBMIT_INFO,
                command_buffer_count: 1,
                p_command_buffers: &cmd,
                ..Default::default()
            };
            self.device
                .queue_submit(self.queue, std::slice::from_ref(&si), vk::Fence::null())?;
            self.device.queue_wait_idle(self.queue)
        })()
        .map_err(vk_err("upload_via_staging"));

        self.device
            .free_command_buffers(self.cmd_pool, std::slice::from_ref(&cmd));
        result
    }
}

fn vk_viewport(v: Viewport) -> vk::Viewport {
    vk::Viewport {
        x: v.x,
        y: v.y,
        width: v.width,
        height: v.height,
        min_depth: v.min_depth,
        max_depth: v.max_depth,
    }
}

fn vk_rect(r: Rect2D) -> vk::Rect2D {
    vk::Rect2D {
        offset: vk::Offset2D { x: r.x, y: r.y },
        extent: vk::Extent2D {
            width: r.width,
            height: r.height,
        },
    }
}

fn clear_values(clear: ClearValues) -> [vk::ClearValue; 2] {
    [
        vk::ClearValue {
            color: vk::ClearColorValue {
                float32: clear.color,
            },
        },
        vk::ClearValue {
            depth_stencil: vk::ClearDepthStencilValue {
                depth: clear.depth,
                stencil: clear.stencil,
            },
        },
    ]
}

impl Device for VkDevice {
    fn max_push_constants_size(&self) -> u32 {
        self.max_push_constants_size
    }

    fn create_shader_module(&self, code: &[u8]) -> Result<ShaderModule> {
        let words = ash::util::read_spv(&mut Cursor::new(code))
            .map_err(|e| EngineError::device("create_shader_module", e))?;
        if words.first() != Some(&SPIRV_MAGIC) {
            return Err(EngineError::device(
                "create_shader_module",
                "bytecode does not start with the SPIR-V magic number",
            ));
        }
        let ci = vk::ShaderModuleCreateInfo {
            s_type: vk::StructureType::SHADER_MODULE_CREATE_INFO,
            p_code: words.as_ptr(),
            code_size: words.len() * 4,
            ..Default::default()
        };
        unsafe {
            self.device
                .create_shader_module(&ci, None)
                .map(from_vk)
                .map_err(vk_err("create_shader_module"))
        }
    }

    fn destroy_shader_module(&self, module: ShaderModule) {
        unsafe { self.device.destroy_shader_module(to_vk(module), None) }
    }

    fn create_pipeline_layout(&self, push_constants: &[PushConstantRange]) -> Result<PipelineLayout> {
        let ranges: Vec<vk::PushConstantRange> = push_constants
            .iter()
            .map(|r| vk::PushConstantRange {
                stage_flags: convert::shader_stages(r.stages),
                offset: r.offset,
                size: r.size,
            })
            .collect();
        let layout_info = vk::PipelineLayoutCreateInfo {
            s_type: vk::StructureType::PIPELINE_LAYOUT_CREATE_INFO,
            push_constant_range_count: ranges.len() as u32,
            p_push_constant_ranges: ranges.as_ptr(),
            ..Default::default()
        };
        unsafe {
            self.device
                .create_pipeline_layout(&layout_info, None)
                .map(from_vk)
                .map_err(vk_err("create_pipeline_layout"))
        }
    }

    fn destroy_pipeline_layout(&self, layout: PipelineLayout) {
        unsafe { self.device.destroy_pipeline_layout(to_vk(layout), None) }
    }

    fn create_graphics_pipeline(&self, desc: &GraphicsPipelineDesc<'_>) -> Result<device::Pipeline> {
        let cfg = desc.config;

        let stages = [
            vk::PipelineShaderStageCreateInfo {
                s_type: vk::StructureType::PIPELINE_SHADER_STAGE_CREATE_INFO,
                stage: vk::ShaderStageFlags::VERTEX,
                module: to_vk(desc.vertex),
                p_name: desc.entry_point.as_ptr(),
                ..Default::default()
            },
            vk::PipelineShaderStageCreateInfo {
                s_type: vk::StructureType::PIPELINE_SHADER_STAGE_CREATE_INFO,
                stage: vk::ShaderStageFlags::FRAGMENT,
                module: to_vk(desc.fragment),
                p_name: desc.entry_point.as_ptr(),
                ..Default::default()
            },
        ];

        let bindings: Vec<vk::VertexInputBindingDescription> = cfg
            .vertex_input
            .bindings
            .iter()
            .map(|b| vk::VertexInputBindingDescription {
                binding: b.binding,
                stride: b.stride,
                input_rate: vk::VertexInputRate::VERTEX,
            })
            .collect();
        let attributes: Vec<vk::VertexInputAttributeDescription> = cfg
            .vertex_input
            .attributes
            .iter()
            .map(|a| vk::VertexInputAttributeDescription {
                location: a.location,
                binding: a.binding,
                format: convert::vertex_format(a.format),
                offset: a.offset,
            })
            .collect();
        let vertex_input = vk::PipelineVertexInputStateCreateInfo {
            s_type: vk::StructureType::PIPELINE_VERTEX_INPUT_STATE_CREATE_INFO,
            vertex_binding_description_count: bindings.len() as u32,
            p_vertex_binding_descriptions: bindings.as_ptr(),
            vertex_attribute_description_count: attributes.len() as u32,
            p_vertex_attribute_descriptions: attributes.as_ptr(),
            ..Default::default()
        };

        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo {
            s_type: vk::StructureType::PIPELINE_INPUT_ASSEMBLY_STATE_CREATE_INFO,
            topology: convert::topology(cfg.topology),
            primitive_restart_enable: bool32(cfg.primitive_restart),
            ..Default::default()
        };

        // Dynamic viewports are supplied per command buffer; the pointers are
        // only read for fixed state.
        let (viewport, scissor, dyn_states) = match cfg.viewport {
            ViewportState::Dynamic => (
                None,
                None,
                vec![vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR],
            ),
            ViewportState::Fixed { viewport, scissor } => {
                (Some(vk_viewport(viewport)), Some(vk_rect(scissor)), Vec::new())
            }
        };
        let viewport_state = vk::PipelineViewportStateCreateInfo {
            s_type: vk::StructureType::PIPELINE_VIEWPORT_STATE_CREATE_INFO,
            viewport_count: 1,
            p_viewports: viewport
                .as_ref()
                .map_or(std::ptr::null(), |v| v as *const vk::Viewport),
            scissor_count: 1,
            p_scissors: scissor
                .as_ref()
                .map_or(std::ptr::null(), |s| s as *const vk::Rect2D),
            ..Default::default()
        };
        let dynamic_state = vk::PipelineDynamicStateCreateInfo {
            s_type: vk::StructureType::PIPELINE_DYNAMIC_STATE_CREATE_INFO,
            dynamic_state_count: dyn_states.len() as u32,
            p_dynamic_states: dyn_states.as_ptr(),
            ..Default::default()
        };

        let r = &cfg.rasterization;
        let raster = vk::PipelineRasterizationStateCreateInfo {
            s_type: vk::StructureType::PIPELINE_RASTERIZATION_STATE_CREATE_INFO,
            depth_clamp_enable: bool32(r.depth_clamp),
            rasterizer_discard_enable: vk::FALSE,
            polygon_mode: convert::polygon_mode(r.polygon_mode),
            cull_mode: convert::cull_mode(r.cull_mode),
            front_face: convert::front_face(r.front_face),
            depth_bias_enable: vk::FALSE,
            line_width: r.line_width,
            ..Default::default()
        };

        let ms = &cfg.multisample;
        let multisample = vk::PipelineMultisampleStateCreateInfo {
            s_type: vk::StructureType::PIPELINE_MULTISAMPLE_STATE_CREATE_INFO,
            rasterization_samples: vk::SampleCountFlags::from_raw(ms.samples),
            sample_shading_enable: bool32(ms.sample_shading.is_some()),
            min_sample_shading: ms.sample_shading.unwrap_or(1.0),
            alpha_to_coverage_enable: bool32(ms.alpha_to_coverage),
            alpha_to_one_enable: vk::FALSE,
            ..Default::default()
        };

        let ds = &cfg.depth_stencil;
        let (min_bounds, max_bounds) = ds.depth_bounds.unwrap_or((0.0, 1.0));
        let depth_stencil = vk::PipelineDepthStencilStateCreateInfo {
            s_type: vk::StructureType::PIPELINE_DEPTH_STENCIL_STATE_CREATE_INFO,
            depth_test_enable: bool32(ds.depth_test),
            depth_write_enable: bool32(ds.depth_write),
            depth_compare_op: convert::compare_op(ds.compare_op),
            depth_bounds_test_enable: bool32(ds.depth_bounds.is_some()),
            min_depth_bounds: min_bounds,
            max_depth_bounds: max_bounds,
            stencil_test_enable: bool32(ds.stencil_test),
            ..Default::default()
        };

        let cb = &cfg.color_blend;
        let color_blend_att = vk::PipelineColorBlendAttachmentState {
            blend_enable: bool32(cb.blend_enable),
            src_color_blend_factor: convert::blend_factor(cb.src_color),
            dst_color_blend_factor: convert::blend_factor(cb.dst_color),
            color_blend_op: convert::blend_op(cb.color_op),
            src_alpha_blend_factor: convert::blend_factor(cb.src_alpha),
            dst_alpha_blend_factor: convert::blend_factor(cb.dst_alpha),
            alpha_blend_op: convert::blend_op(cb.alpha_op),
            color_write_mask: convert::color_write_mask(cb.write_mask),
        };
        let color_blend = vk::PipelineColorBlendStateCreateInfo {
            s_type: vk::StructureType::PIPELINE_COLOR_BLEND_STATE_CREATE_INFO,
            logic_op_enable: vk::FALSE,
            logic_op: vk::LogicOp::COPY,
            attachment_count: 1,
            p_attachments: &color_blend_att,
            blend_constants: [0.0; 4],
            ..Default::default()
        };

        let pipeline_info = vk::GraphicsPipelineCreateInfo {
            s_type: vk::StructureType::GRAPHICS_PIPELINE_CREATE_INFO,
            stage_count: stages.len() as u32,
            p_stages: stages.as_ptr(),
            p_vertex_input_state: &vertex_input,
            p_input_assembly_state: &input_assembly,
            p_viewport_state: &viewport_state,
            p_rasterization_state: &raster,
            p_multisample_state: &multisample,
            p_depth_stencil_state: &depth_stencil,
            p_color_blend_state: &color_blend,
            p_dynamic_state: &dynamic_state,
            layout: to_vk(cfg.layout),
            render_pass: to_vk(cfg.render_pass),
            subpass: cfg.subpass,
            base_pipeline_index: -1,
            ..Default::default()
        };

        let pipelines = unsafe {
            self.device.create_graphics_pipelines(
                self.pipeline_cache,
                std::slice::from_ref(&pipeline_info),
                None,
            )
        }
        .map_err(|(_, err)| EngineError::device("create_graphics_pipelines", err))?;
        pipelines
            .first()
            .copied()
            .map(from_vk)
            .ok_or_else(|| EngineError::device("create_graphics_pipelines", "no pipeline returned"))
    }

    fn destroy_pipeline(&self, pipeline: device::Pipeline) {
        unsafe { self.device.destroy_pipeline(to_vk(pipeline), None) }
    }

    fn create_swapchain(&self, extent: RenderSize, old: Swapchain) -> Result<SwapchainImages> {
        unsafe {
            let caps = self
                .surface_loader
                .get_physical_device_surface_capabilities(self.phys, self.surface)
                .map_err(vk_err("get_physical_device_surface_capabilities"))?;
            let formats = self
                .surface_loader
                .get_physical_device_surface_formats(self.phys, self.surface)
                .map_err(vk_err("get_physical_device_surface_formats"))?;
            let modes = self
                .surface_loader
                .get_physical_device_surface_present_modes(self.phys, self.surface)
                .map_err(vk_err("get_physical_device_surface_present_modes"))?;

            let (surf_format, pick_reason) = policy::pick_surface_format(&formats).ok_or_else(
                || EngineError::device("get_physical_device_surface_formats", "surface has no formats"),
            )?;
            let present_mode =
                policy::choose_present_mode(&modes, self.config.vsync, self.config.vsync_mode);
            let image_extent = policy::extent_from_caps(&caps, extent);
            if image_extent.width == 0 || image_extent.height == 0 {
                return Err(EngineError::device("create_swapchain", "surface has a zero extent"));
            }
            let min_image_count = policy::image_count(&caps);

            let swap_info = vk::SwapchainCreateInfoKHR {
                s_type: vk::StructureType::SWAPCHAIN_CREATE_INFO_KHR,
                surface: self.surface,
                min_image_count,
                image_format: surf_format.format,
                image_color_space: surf_format.color_space,
                image_extent,
                image_array_layers: 1,
                image_usage: vk::ImageUsageFlags::COLOR_ATTACHMENT,
                image_sharing_mode: vk::SharingMode::EXCLUSIVE,
                pre_transform: policy::pre_transform(&caps),
                composite_alpha: vk::CompositeAlphaFlagsKHR::OPAQUE,
                present_mode,
                clipped: vk::TRUE,
                old_swapchain: to_vk(old),
                ..Default::default()
            };

            let swapchain = self
                .swapchain_loader
                .create_swapchain(&swap_info, None)
                .map_err(vk_err("create_swapchain"))?;
            let images = match self.swapchain_loader.get_swapchain_images(swapchain) {
                Ok(images) => images,
                Err(e) => {
                    self.swapchain_loader.destroy_swapchain(swapchain, None);
                    return Err(vk_err("get_swapchain_images")(e));
                }
            };

            info!(
                "swapchain {}x{} ({} images, {:?} / {:?} [{:?}], {:?}, vsync={} mode={:?})",
                image_extent.width,
                image_extent.height,
                images.len(),
                surf_format.format,
                surf_format.color_space,
                pick_reason,
                present_mode,
                self.config.vsync,
                self.config.vsync_mode
            );

            Ok(SwapchainImages {
                swapchain: from_vk(swapchain),
                images: images.into_iter().map(from_vk).collect(),
                format: convert::from_vk_format(surf_format.format),
                extent: convert::render_size(image_extent),
            })
        }
    }

    fn destroy_swapchain(&self, swapchain: Swapchain) {
        unsafe {
            self.swapchain_loader
                .destroy_swapchain(to_vk(swapchain), None)
        }
    }

    fn create_color_view(&self, image: Image, format: Format) -> Result<ImageView> {
        let iv_info = vk::ImageViewCreateInfo {
            s_type: vk::StructureType::IMAGE_VIEW_CREATE_INFO,
            image: to_vk(image),
            view_type: vk::ImageViewType::TYPE_2D,
            format: convert::format(format),
            subresource_range: vk::ImageSubresourceRange {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            },
            ..Default::default()
        };
        unsafe {
            self.device
                .create_image_view(&iv_info, None)
                .map(from_vk)
                .map_err(vk_err("create_image_view"))
        }
    }

    fn destroy_image_view(&self, view: ImageView) {
        unsafe { self.device.destroy_image_view(to_vk(view), None) }
    }

    fn depth_format(&self) -> Format {
        convert::from_vk_format(self.depth_format)
    }

    fn create_depth_attachment(&self, extent: RenderSize, format: Format) -> Result<DepthAttachment> {
        let depth_format = convert::format(format);
        let img_ci = vk::ImageCreateInfo {
            s_type: vk::StructureType::IMAGE_CREATE_INFO,
            image_type: vk::ImageType::TYPE_2D,
            format: depth_format,
            extent: vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            },
            mip_levels: 1,
            array_layers: 1,
            samples: vk::SampleCountFlags::TYPE_1,
            tiling: vk::ImageTiling::OPTIMAL,
            usage: vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
            sharing_mode: vk::SharingMode::EXCLUSIVE,
            initial_layout: vk::ImageLayout::UNDEFINED,
            ..Default::default()
        };

        unsafe {
            let image = self
                .device
                .create_image(&img_ci, None)
                .map_err(vk_err("create_image"))?;
            let mem_req = self.device.get_image_memory_requirements(image);
            let memory = match self.allocate(mem_req, vk::MemoryPropertyFlags::DEVICE_LOCAL) {
                Ok(memory) => memory,
                Err(e) => {
                    self.device.destroy_image(image, None);
                    return Err(e);
                }
            };

            let mut aspect_mask = vk::ImageAspectFlags::DEPTH;
            if context::has_stencil(depth_format) {
                aspect_mask |= vk::ImageAspectFlags::STENCIL;
            }
            let view_ci = vk::ImageViewCreateInfo {
                s_type: vk::StructureType::IMAGE_VIEW_CREATE_INFO,
                image,
                view_type: vk::ImageViewType::TYPE_2D,
                format: depth_format,
                subresource_range: vk::ImageSubresourceRange {
                    aspect_mask,
                    base_mip_level: 0,
                    level_count: 1,
                    base_array_layer: 0,
                    layer_count: 1,
                },
                ..Default::default()
            };
            let view = self
                .device
                .bind_image_memory(image, memory, 0)
                .map_err(vk_err("bind_image_memory"))
                .and_then(|()| {
                    self.device
                        .create_image_view(&view_ci, None)
                        .map_err(vk_err("create_image_view"))
                });
            match view {
                Ok(view) => Ok(DepthAttachment {
                    image: from_vk(image),
                    memory: from_vk(memory),
                    view: from_vk(view),
                }),
                Err(e) => {
                    self.device.destroy_image(image, None);
                    self.device.free_memory(memory, None);
                    Err(e)
                }
            }
        }
    }

    fn destroy_depth_attachment(&self, depth: DepthAttachment) {
        unsafe {
            self.device.destroy_image_view(to_vk(depth.view), None);
            self.device.destroy_image(to_vk(depth.image), None);
            self.device.free_memory(to_vk(depth.memory), None);
        }
    }

    fn create_render_pass(&self, color: Format, depth: Format) -> Result<RenderPass> {
        let attachments = [
            vk::AttachmentDescription {
                format: convert::format(color),
                samples: vk::SampleCountFlags::TYPE_1,
                load_op: vk::AttachmentLoadOp::CLEAR,
                store_op: vk::AttachmentStoreOp::STORE,
                stencil_load_op: vk::AttachmentLoadOp::DONT_CARE,
                stencil_store_op: vk::AttachmentStoreOp::DONT_CARE,
                initial_layout: vk::ImageLayout::UNDEFINED,
                final_layout: vk::ImageLayout::PRESENT_SRC_KHR,
                ..Default::default()
            },
            vk::AttachmentDescription {
                format: convert::format(depth),
                samples: vk::SampleCountFlags::TYPE_1,
                load_op: vk::AttachmentLoadOp::CLEAR,
                store_op: vk::AttachmentStoreOp::DONT_CARE,
                stencil_load_op: vk::AttachmentLoadOp::DONT_CARE,
                stencil_store_op: vk::AttachmentStoreOp::DONT_CARE,
                initial_layout: vk::ImageLayout::UNDEFINED,
                final_layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
                ..Default::default()
            },
        ];
        let color_ref = vk::AttachmentReference {
            attachment: 0,
            layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        };
        let depth_ref = vk::AttachmentReference {
            attachment: 1,
            layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        };
        let subpass = vk::SubpassDescription {
            pipeline_bind_point: vk::PipelineBindPoint::GRAPHICS,
            color_attachment_count: 1,
            p_color_attachments: &color_ref,
            p_depth_stencil_attachment: &depth_ref,
            ..Default::default()
        };
        // The acquire semaphore only orders the color-output stage; make the
        // attachment writes wait for it too.
        let dependency = vk::SubpassDependency {
            src_subpass: vk::SUBPASS_EXTERNAL,
            dst_subpass: 0,
            src_stage_mask: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
                | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS,
            src_access_mask: vk::AccessFlags::empty(),
            dst_stage_mask: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
                | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS,
            dst_access_mask: vk::AccessFlags::COLOR_ATTACHMENT_WRITE
                | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
            ..Default::default()
        };

        let rp_info = vk::RenderPassCreateInfo {
            s_type: vk::StructureType::RENDER_PASS_CREATE_INFO,
            attachment_count: attachments.len() as u32,
            p_attachments: attachments.as_ptr(),
            subpass_count: 1,
            p_subpasses: &subpass,
            dependency_count: 1,
            p_dependencies: &dependency,
            ..Default::default()
        };
        unsafe {
            self.device
                .create_render_pass(&rp_info, None)
                .map(from_vk)
                .map_err(vk_err("create_render_pass"))
        }
    }

    fn destroy_render_pass(&self, render_pass: RenderPass) {
        unsafe { self.device.destroy_render_pass(to_vk(render_pass), None) }
    }

    fn create_framebuffer(
        &self,
        render_pass: RenderPass,
        attachments: &[ImageView],
        extent: RenderSize,
    ) -> Result<Framebuffer> {
        let views: Vec<vk::ImageView> = attachments.iter().map(|&v| to_vk(v)).collect();
        let fb_info = vk::FramebufferCreateInfo {
            s_type: vk::StructureType::FRAMEBUFFER_CREATE_INFO,
            render_pass: to_vk(render_pass),
            attachment_count: views.len() as u32,
            p_attachments: views.as_ptr(),
            width: extent.width,
            height: extent.height,
            layers: 1,
            ..Default::default()
        };
        unsafe {
            self.device
                .create_framebuffer(&fb_info, None)
                .map(from_vk)
                .map_err(vk_err("create_framebuffer"))
        }
    }

    fn destroy_framebuffer(&self, framebuffer: Framebuffer) {
        unsafe { self.device.destroy_framebuffer(to_vk(framebuffer), None) }
    }

    fn create_semaphore(&self) -> Result<Semaphore> {
        let ci = vk::SemaphoreCreateInfo {
            s_type: vk::StructureType::SEMAPHORE_CREATE_INFO,
            ..Default::default()
        };
        unsafe {
            self.device
                .create_semaphore(&ci, None)
                .map(from_vk)
                .map_err(vk_err("create_semaphore"))
        }
    }

    fn destroy_semaphore(&self, semaphore: Semaphore) {
        unsafe { self.device.destroy_semaphore(to_vk(semaphore), None) }
    }

    fn create_fence(&self, signaled: bool) -> Result<Fence> {
        let ci = vk::FenceCreateInfo {
            s_type: vk::StructureType::FENCE_CREATE_INFO,
            flags: if signaled {
                vk::FenceCreateFlags::SIGNALED
            } else {
                vk::FenceCreateFlags::empty()
            },
            ..Default::default()
        };
        unsafe {
            self.device
                .create_fence(&ci, None)
                .map(from_vk)
                .map_err(vk_err("create_fence"))
        }
    }

    fn destroy_fence(&self, fence: Fence) {
        unsafe { self.device.destroy_fence(to_vk(fence), None) }
    }

    fn wait_for_fence(&self, fence: Fence) -> Result<()> {
        unsafe {
            self.device
                .wait_for_fences(&[to_vk(fence)], true, u64::MAX)
                .map_err(vk_err("wait_for_fences"))
        }
    }

    fn reset_fence(&self, fence: Fence) -> Result<()> {
        unsafe {
            self.device
                .reset_fences(&[to_vk(fence)])
                .map_err(vk_err("reset_fences"))
        }
    }

    fn acquire_next_image(&self, swapchain: Swapchain, signal: Semaphore) -> Result<Acquire> {
        let result = unsafe {
            self.swapchain_loader.acquire_next_image(
                to_vk(swapchain),
                u64::MAX,
                to_vk(signal),
                vk::Fence::null(),
            )
        };
        match result {
            Ok((index, suboptimal)) => Ok(Acquire::Image { index, suboptimal }),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                debug!("acquire: swapchain out of date");
                Ok(Acquire::OutOfDate)
            }
            Err(e) => Err(vk_err("acquire_next_image")(e)),
        }
    }

    fn submit(
        &self,
        cmd: CommandBuffer,
        wait: Semaphore,
        signal: Semaphore,
        fence: Fence,
    ) -> Result<()> {
        let wait = [to_vk::<vk::Semaphore, _>(wait)];
        let stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let signal = [to_vk::<vk::Semaphore, _>(signal)];
        let cmds = [to_vk::<vk::CommandBuffer, _>(cmd)];
        let submit = vk::SubmitInfo {
            s_type: vk::StructureType::SUBMIT_INFO,
            wait_semaphore_count: wait.len() as u32,
            p_wait_semaphores: wait.as_ptr(),
            p_wait_dst_stage_mask: stages.as_ptr(),
            command_buffer_count: cmds.len() as u32,
            p_command_buffers: cmds.as_ptr(),
            signal_semaphore_count: signal.len() as u32,
            p_signal_semaphores: signal.as_ptr(),
            ..Default::default()
        };
        unsafe {
            self.device
                .queue_submit(self.queue, std::slice::from_ref(&submit), to_vk(fence))
                .map_err(vk_err("queue_submit"))
        }
    }

    fn present(&self, swapchain: Swapchain, image_index: u32, wait: Semaphore) -> Result<PresentStatus> {
        let wait = [to_vk::<vk::Semaphore, _>(wait)];
        let swapchains = [to_vk::<vk::SwapchainKHR, _>(swapchain)];
        let indices = [image_index];
        let present = vk::PresentInfoKHR {
            s_type: vk::StructureType::PRESENT_INFO_KHR,
            wait_semaphore_count: wait.len() as u32,
            p_wait_semaphores: wait.as_ptr(),
            swapchain_count: swapchains.len() as u32,
            p_swapchains: swapchains.as_ptr(),
            p_image_indices: indices.as_ptr(),
            ..Default::default()
        };
        match unsafe { self.swapchain_loader.queue_present(self.queue, &present) } {
            Ok(false) => Ok(PresentStatus::Optimal),
            Ok(true) => Ok(PresentStatus::Suboptimal),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(PresentStatus::OutOfDate),
            Err(e) => Err(vk_err("queue_present")(e)),
        }
    }

    fn wait_idle(&self) -> Result<()> {
        unsafe {
            self.device
                .device_wait_idle()
                .map_err(vk_err("device_wait_idle"))
        }
    }

    fn allocate_command_buffers(&self, count: u32) -> Result<Vec<CommandBuffer>> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let alloc_info = vk::CommandBufferAllocateInfo {
            s_type: vk::StructureType::COMMAND_BUFFER_ALLOCATE_INFO,
            command_pool: self.cmd_pool,
            level: vk::CommandBufferLevel::PRIMARY,
            command_buffer_count: count,
            ..Default::default()
        };
        let bufs = unsafe {
            self.device
                .allocate_command_buffers(&alloc_info)
                .map_err(vk_err("allocate_command_buffers"))?
        };
        Ok(bufs.into_iter().map(from_vk).collect())
    }

    fn free_command_buffers(&self, buffers: &[CommandBuffer]) {
        if buffers.is_empty() {
            return;
        }
        let bufs: Vec<vk::CommandBuffer> = buffers.iter().map(|&b| to_vk(b)).collect();
        unsafe { self.device.free_command_buffers(self.cmd_pool, &bufs) }
    }

    fn begin_command_buffer(&self, cmd: CommandBuffer) -> Result<()> {
        let begin = vk::CommandBufferBeginInfo {
            s_type: vk::StructureType::COMMAND_BUFFER_BEGIN_INFO,
            ..Default::default()
        };
        unsafe {
            self.device
                .begin_command_buffer(to_vk(cmd), &begin)
                .map_err(vk_err("begin_command_buffer"))
        }
    }

    fn end_command_buffer(&self, cmd: CommandBuffer) -> Result<()> {
        unsafe {
            self.device
                .end_command_buffer(to_vk(cmd))
                .map_err(vk_err("end_command_buffer"))
        }
    }

    fn cmd_begin_render_pass(&self, cmd: CommandBuffer, begin: &RenderPassBegin) {
        let clears = clear_values(begin.clear);
        let rp_begin = vk::RenderPassBeginInfo {
            s_type: vk::StructureType::RENDER_PASS_BEGIN_INFO,
            render_pass: to_vk(begin.render_pass),
            framebuffer: to_vk(begin.framebuffer),
            render_area: vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent: convert::extent(begin.extent),
            },
            clear_value_count: clears.len() as u32,
            p_clear_values: clears.as_ptr(),
            ..Default::default()
        };
        unsafe {
            self.device
                .cmd_begin_render_pass(to_vk(cmd), &rp_begin, vk::SubpassContents::INLINE)
        }
    }

    fn cmd_end_render_pass(&self, cmd: CommandBuffer) {
        unsafe { self.device.cmd_end_render_pass(to_vk(cmd)) }
    }

    fn cmd_set_viewport(&self, cmd: CommandBuffer, viewport: Viewport) {
        unsafe {
            self.device
                .cmd_set_viewport(to_vk(cmd), 0, &[vk_viewport(viewport)])
        }
    }

    fn cmd_set_scissor(&self, cmd: CommandBuffer, scissor: Rect2D) {
        unsafe { self.device.cmd_set_scissor(to_vk(cmd), 0, &[vk_rect(scissor)]) }
    }

    fn cmd_bind_pipeline(&self, cmd: CommandBuffer, pipeline: device::Pipeline) {
        unsafe {
            self.device.cmd_bind_pipeline(
                to_vk(cmd),
                vk::PipelineBindPoint::GRAPHICS,
                to_vk(pipeline),
            )
        }
    }

    fn cmd_push_constants(
        &self,
        cmd: CommandBuffer,
        layout: PipelineLayout,
        stages: ShaderStages,
        data: &[u8],
    ) {
        unsafe {
            self.device.cmd_push_constants(
                to_vk(cmd),
                to_vk(layout),
                convert::shader_stages(stages),
                0,
                data,
            )
        }
    }

    fn cmd_bind_vertex_buffer(&self, cmd: CommandBuffer, buffer: device::Buffer) {
        unsafe {
            self.device
                .cmd_bind_vertex_buffers(to_vk(cmd), 0, &[to_vk(buffer)], &[0])
        }
    }

    fn cmd_bind_index_buffer(&self, cmd: CommandBuffer, buffer: device::Buffer) {
        unsafe {
            self.device
                .cmd_bind_index_buffer(to_vk(cmd), to_vk(buffer), 0, vk::IndexType::UINT32)
        }
    }

    fn cmd_draw(&self, cmd: CommandBuffer, vertex_count: u32) {
        unsafe { self.device.cmd_draw(to_vk(cmd), vertex_count, 1, 0, 0) }
    }

    fn cmd_draw_indexed(&self, cmd: CommandBuffer, index_count: u32) {
        unsafe { self.device.cmd_draw_indexed(to_vk(cmd), index_count, 1, 0, 0, 0) }
    }

    fn create_buffer(&self, usage: BufferUsage, data: &[u8]) -> Result<GpuBuffer> {
        if data.is_empty() {
            return Err(EngineError::precondition("cannot create an empty buffer"));
        }
        let size = data.len() as vk::DeviceSize;
        unsafe {
            let (buffer, memory) = self.create_buffer_and_memory(
                size,
                convert::buffer_usage(usage) | vk::BufferUsageFlags::TRANSFER_DST,
                vk::MemoryPropertyFlags::DEVICE_LOCAL,
            )?;
            if let Err(e) = self.upload_via_staging(buffer, data) {
                self.device.destroy_buffer(buffer, None);
                self.device.free_memory(memory, None);
                return Err(e);
            }
            Ok(GpuBuffer {
                buffer: from_vk(buffer),
                memory: from_vk(memory),
                size,
            })
        }
    }

    fn destroy_buffer(&self, buffer: GpuBuffer) {
        unsafe {
            self.device.destroy_buffer(to_vk(buffer.buffer), None);
            self.device.free_memory(to_vk(buffer.memory), None);
        }
    }
}

// STRICT TEARDOWN ORDER:
// - Everything created through `Device` (pipelines, swapchains, views,
//   framebuffers, sync objects, command buffers, buffers) is owned elsewhere
//   and holds an `Arc` to this device, so it is already gone here
// - device_wait_idle()
// - Save + destroy the pipeline cache, then the command pool
// - Destroy device, then surface, then debug messenger; instance last
impl Drop for VkDevice {
    fn drop(&mut self) {
        unsafe {
            if let Err(e) = self.device.device_wait_idle() {
                warn!("device_wait_idle during teardown: {e}");
            }

            if let Some(path) = &self.pipeline_cache_path {
                context::save_pipeline_cache(&self.device, self.pipeline_cache, path);
            }
            self.device.destroy_pipeline_cache(self.pipeline_cache, None);
            self.device.destroy_command_pool(self.cmd_pool, None);

            self.device.destroy_device(None);
            self.surface_loader.destroy_surface(self.surface, None);
            if let Some(debug) = &self.debug {
                debug.destroy();
            }
            self.instance.destroy_instance(None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clear_values_carry_color_then_depth() {
        let clears = clear_values(ClearValues {
            color: [0.1, 0.2, 0.3, 1.0],
            depth: 1.0,
            stencil: 0,
        });
        unsafe {
            assert_eq!(clears[0].color.float32, [0.1, 0.2, 0.3, 1.0]);
            assert_eq!(clears[1].depth_stencil.depth, 1.0);
            assert_eq!(clears[1].depth_stencil.stencil, 0);
        }
    }

    #[test]
    fn viewport_and_scissor_cover_the_extent() {
        let extent = RenderSize::new(640, 480);
        let vp = vk_viewport(Viewport::covering(extent));
        assert_eq!((vp.width, vp.height, vp.max_depth), (640.0, 480.0, 1.0));
        let sc = vk_rect(Rect2D::covering(extent));
        assert_eq!((sc.extent.width, sc.extent.height), (640, 480));
        assert_eq!((sc.offset.x, sc.offset.y), (0, 0));
    }
}
