// Backend implementation for VulkanDevice
//
// Sync1 pipeline barriers, dynamic rendering, timeline semaphores for both
// fences and semaphores, one command pool per command list.

use anyhow::{ensure, Context, Result};
use ash::vk;
use std::ffi::CString;
use std::time::Duration;

use super::{
    conv, VulkanAccelerationStructure, VulkanBindingLayout, VulkanBuffer, VulkanCommandList,
    VulkanDescriptorPool, VulkanDescriptorSet, VulkanDevice, VulkanMemory, VulkanPipeline,
    VulkanQueryHeap, VulkanTexture, VulkanTimeline, ADDRESS_ALIGNMENT, ALIASED_BLOCK_ALIGNMENT,
};
use crate::backend::{
    AccelerationStructureInput, AccelerationStructureLevel, AccelerationStructureSizes, Backend,
    BackendKind, BufferCopy, BufferTextureCopy, Capabilities, ClockCalibration,
    DescriptorResource, GraphicsPipelineDesc, InstanceRecord, PipelineDesc, PipelineKind,
    RayTracingPipelineDesc, RenderingDesc, SbtRegion, SbtRegions, ShaderBinary, ShaderGroupInfo,
    TextureBarrier,
};
use crate::config::Config;
use crate::types::{
    BufferDesc, DescriptorBinding, DescriptorCategory, Extent3d, Format, IndexType, QueueType,
    SamplerDesc, ShaderStages, TextureDesc,
};
use gpu_allocator::MemoryLocation;

/// Shader modules and entry point names kept alive until pipeline creation returns
#[derive(Default)]
struct StageScratch {
    modules: Vec<vk::ShaderModule>,
    names: Vec<CString>,
}

impl VulkanDevice {
    fn shader_stage(
        &self,
        shader: &ShaderBinary<'_>,
        scratch: &mut StageScratch,
    ) -> Result<vk::PipelineShaderStageCreateInfo> {
        let module = self.create_shader_module(shader.code)?;
        scratch.modules.push(module);
        let name = CString::new(shader.entry_point)?;
        let info = vk::PipelineShaderStageCreateInfo::builder()
            .stage(conv::shader_stages(shader.stage))
            .module(module)
            .name(&name)
            .build();
        // CString contents do not move with the Vec
        scratch.names.push(name);
        Ok(info)
    }

    fn create_graphics_pipeline(
        &self,
        desc: &GraphicsPipelineDesc<'_>,
        layout: vk::PipelineLayout,
        scratch: &mut StageScratch,
    ) -> Result<vk::Pipeline> {
        let mut stages = vec![self.shader_stage(&desc.vertex, scratch)?];
        if let Some(fragment) = &desc.fragment {
            stages.push(self.shader_stage(fragment, scratch)?);
        }

        let bindings: Vec<_> = desc
            .vertex_buffers
            .iter()
            .enumerate()
            .map(|(i, layout)| vk::VertexInputBindingDescription {
                binding: i as u32,
                stride: layout.stride,
                input_rate: vk::VertexInputRate::VERTEX,
            })
            .collect();
        let attributes: Vec<_> = desc
            .vertex_buffers
            .iter()
            .enumerate()
            .flat_map(|(i, layout)| {
                layout
                    .attributes
                    .iter()
                    .map(move |attr| vk::VertexInputAttributeDescription {
                        location: attr.location,
                        binding: i as u32,
                        format: conv::format(attr.format),
                        offset: attr.offset,
                    })
            })
            .collect();

        let vertex_input = vk::PipelineVertexInputStateCreateInfo::builder()
            .vertex_binding_descriptions(&bindings)
            .vertex_attribute_descriptions(&attributes);

        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::builder()
            .topology(conv::topology(desc.topology))
            .primitive_restart_enable(false);

        // Viewport and scissor are dynamic
        let viewport_state = vk::PipelineViewportStateCreateInfo::builder()
            .viewport_count(1)
            .scissor_count(1);

        let rasterizer = vk::PipelineRasterizationStateCreateInfo::builder()
            .polygon_mode(vk::PolygonMode::FILL)
            .cull_mode(conv::cull_mode(desc.cull_mode))
            .front_face(vk::FrontFace::COUNTER_CLOCKWISE)
            .line_width(1.0);

        let multisampling = vk::PipelineMultisampleStateCreateInfo::builder()
            .rasterization_samples(vk::SampleCountFlags::TYPE_1);

        let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::builder()
            .depth_test_enable(desc.depth_test)
            .depth_write_enable(desc.depth_test)
            .depth_compare_op(vk::CompareOp::LESS_OR_EQUAL);

        let blend_attachments: Vec<_> = desc
            .color_formats
            .iter()
            .map(|_| {
                vk::PipelineColorBlendAttachmentState::builder()
                    .color_write_mask(vk::ColorComponentFlags::RGBA)
                    .blend_enable(false)
                    .build()
            })
            .collect();
        let color_blending =
            vk::PipelineColorBlendStateCreateInfo::builder().attachments(&blend_attachments);

        let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dynamic_state =
            vk::PipelineDynamicStateCreateInfo::builder().dynamic_states(&dynamic_states);

        let color_formats: Vec<_> = desc.color_formats.iter().map(|f| conv::format(*f)).collect();
        let mut rendering = vk::PipelineRenderingCreateInfo::builder()
            .color_attachment_formats(&color_formats)
            .depth_attachment_format(desc.depth_format.map_or(vk::Format::UNDEFINED, conv::format));

        let create_info = vk::GraphicsPipelineCreateInfo::builder()
            .stages(&stages)
            .vertex_input_state(&vertex_input)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterizer)
            .multisample_state(&multisampling)
            .depth_stencil_state(&depth_stencil)
            .color_blend_state(&color_blending)
            .dynamic_state(&dynamic_state)
            .layout(layout)
            .push_next(&mut rendering);

        let pipelines = unsafe {
            self.device
                .create_graphics_pipelines(vk::PipelineCache::null(), &[create_info.build()], None)
        }
        .map_err(|(_, e)| e)
        .context("Failed to create graphics pipeline")?;
        pipelines
            .into_iter()
            .next()
            .context("Driver returned no graphics pipeline")
    }

    fn create_compute_pipeline(
        &self,
        shader: &ShaderBinary<'_>,
        layout: vk::PipelineLayout,
        scratch: &mut StageScratch,
    ) -> Result<vk::Pipeline> {
        let stage = self.shader_stage(shader, scratch)?;
        let create_info = vk::ComputePipelineCreateInfo::builder()
            .stage(stage)
            .layout(layout);

        let pipelines = unsafe {
            self.device
                .create_compute_pipelines(vk::PipelineCache::null(), &[create_info.build()], None)
        }
        .map_err(|(_, e)| e)
        .context("Failed to create compute pipeline")?;
        pipelines
            .into_iter()
            .next()
            .context("Driver returned no compute pipeline")
    }

    fn create_ray_tracing_pipeline(
        &self,
        desc: &RayTracingPipelineDesc<'_>,
        layout: vk::PipelineLayout,
        scratch: &mut StageScratch,
    ) -> Result<vk::Pipeline> {
        let rt = self.ray_tracing();
        let mut stages = Vec::new();
        let mut groups = Vec::new();

        let general = |index: usize| {
            vk::RayTracingShaderGroupCreateInfoKHR::builder()
                .ty(vk::RayTracingShaderGroupTypeKHR::GENERAL)
                .general_shader(index as u32)
                .closest_hit_shader(vk::SHADER_UNUSED_KHR)
                .any_hit_shader(vk::SHADER_UNUSED_KHR)
                .intersection_shader(vk::SHADER_UNUSED_KHR)
                .build()
        };

        stages.push(self.shader_stage(&desc.raygen, scratch)?);
        groups.push(general(0));

        for miss in desc.miss {
            groups.push(general(stages.len()));
            stages.push(self.shader_stage(miss, scratch)?);
        }

        for hit in desc.hit_groups {
            let mut stage_index = |shader: &Option<ShaderBinary<'_>>| -> Result<u32> {
                match shader {
                    Some(shader) => {
                        stages.push(self.shader_stage(shader, scratch)?);
                        Ok(stages.len() as u32 - 1)
                    }
                    None => Ok(vk::SHADER_UNUSED_KHR),
                }
            };
            let closest_hit = stage_index(&hit.closest_hit)?;
            let any_hit = stage_index(&hit.any_hit)?;
            groups.push(
                vk::RayTracingShaderGroupCreateInfoKHR::builder()
                    .ty(vk::RayTracingShaderGroupTypeKHR::TRIANGLES_HIT_GROUP)
                    .general_shader(vk::SHADER_UNUSED_KHR)
                    .closest_hit_shader(closest_hit)
                    .any_hit_shader(any_hit)
                    .intersection_shader(vk::SHADER_UNUSED_KHR)
                    .build(),
            );
        }

        let create_info = vk::RayTracingPipelineCreateInfoKHR::builder()
            .stages(&stages)
            .groups(&groups)
            .max_pipeline_ray_recursion_depth(desc.max_recursion_depth)
            .layout(layout);

        let pipelines = unsafe {
            rt.pipeline.create_ray_tracing_pipelines(
                vk::DeferredOperationKHR::null(),
                vk::PipelineCache::null(),
                &[create_info.build()],
                None,
            )
        }
        .context("Failed to create ray tracing pipeline")?;
        pipelines
            .into_iter()
            .next()
            .context("Driver returned no ray tracing pipeline")
    }

    fn buffer_address(buffer: &VulkanBuffer) -> u64 {
        debug_assert!(buffer.address.is_some(), "buffer has no device address");
        buffer.address.unwrap_or(0)
    }

    /// Native geometry descriptions plus one build range per geometry
    fn accel_geometry(
        &self,
        input: &AccelerationStructureInput<'_, Self>,
    ) -> (
        vk::AccelerationStructureTypeKHR,
        Vec<vk::AccelerationStructureGeometryKHR>,
        Vec<vk::AccelerationStructureBuildRangeInfoKHR>,
    ) {
        let range = |primitive_count: u32| vk::AccelerationStructureBuildRangeInfoKHR {
            primitive_count,
            primitive_offset: 0,
            first_vertex: 0,
            transform_offset: 0,
        };

        match input {
            AccelerationStructureInput::Triangles(list) => {
                let geometries = list
                    .iter()
                    .map(|g| {
                        let (index_type, index_address) = match g.indices {
                            Some((buffer, offset, ty)) => {
                                (conv::index_type(ty), Self::buffer_address(buffer) + offset)
                            }
                            None => (vk::IndexType::NONE_KHR, 0),
                        };
                        let triangles = vk::AccelerationStructureGeometryTrianglesDataKHR::builder()
                            .vertex_format(conv::format(g.vertex_format))
                            .vertex_data(vk::DeviceOrHostAddressConstKHR {
                                device_address: Self::buffer_address(g.vertex_buffer)
                                    + g.vertex_offset,
                            })
                            .vertex_stride(g.vertex_stride)
                            .max_vertex(g.vertex_count.saturating_sub(1))
                            .index_type(index_type)
                            .index_data(vk::DeviceOrHostAddressConstKHR {
                                device_address: index_address,
                            })
                            .build();
                        vk::AccelerationStructureGeometryKHR::builder()
                            .geometry_type(vk::GeometryTypeKHR::TRIANGLES)
                            .geometry(vk::AccelerationStructureGeometryDataKHR { triangles })
                            .flags(conv::geometry_flags(g.flags))
                            .build()
                    })
                    .collect();
                let ranges = list.iter().map(|g| range(g.primitive_count)).collect();
                (vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL, geometries, ranges)
            }
            AccelerationStructureInput::Instances { buffer, count } => {
                let instances = vk::AccelerationStructureGeometryInstancesDataKHR::builder()
                    .array_of_pointers(false)
                    .data(vk::DeviceOrHostAddressConstKHR {
                        device_address: Self::buffer_address(buffer),
                    })
                    .build();
                let geometry = vk::AccelerationStructureGeometryKHR::builder()
                    .geometry_type(vk::GeometryTypeKHR::INSTANCES)
                    .geometry(vk::AccelerationStructureGeometryDataKHR { instances })
                    .build();
                (
                    vk::AccelerationStructureTypeKHR::TOP_LEVEL,
                    vec![geometry],
                    vec![range(*count)],
                )
            }
        }
    }

    fn full_range(texture: &VulkanTexture) -> vk::ImageSubresourceRange {
        vk::ImageSubresourceRange {
            aspect_mask: texture.aspect,
            base_mip_level: 0,
            level_count: texture.mip_levels,
            base_array_layer: 0,
            layer_count: 1,
        }
    }

    fn copy_layers(texture: &VulkanTexture, mip_level: u32) -> vk::ImageSubresourceLayers {
        // Copies touch one aspect; depth for depth/stencil formats
        let aspect_mask = if texture.aspect.contains(vk::ImageAspectFlags::DEPTH) {
            vk::ImageAspectFlags::DEPTH
        } else {
            vk::ImageAspectFlags::COLOR
        };
        vk::ImageSubresourceLayers {
            aspect_mask,
            mip_level,
            base_array_layer: 0,
            layer_count: 1,
        }
    }

    fn mip_extent(texture: &VulkanTexture, mip_level: u32) -> vk::Extent3D {
        vk::Extent3D {
            width: (texture.extent.width >> mip_level).max(1),
            height: (texture.extent.height >> mip_level).max(1),
            depth: (texture.extent.depth >> mip_level).max(1),
        }
    }

    fn create_view(
        &self,
        image: vk::Image,
        format: Format,
        extent: Extent3d,
        mip_levels: u32,
    ) -> Result<vk::ImageView> {
        let view_type = if extent.depth > 1 {
            vk::ImageViewType::TYPE_3D
        } else {
            vk::ImageViewType::TYPE_2D
        };
        // Views sample and attach the depth aspect only
        let aspect_mask = if format.is_depth() {
            vk::ImageAspectFlags::DEPTH
        } else {
            vk::ImageAspectFlags::COLOR
        };
        let create_info = vk::ImageViewCreateInfo::builder()
            .image(image)
            .view_type(view_type)
            .format(conv::format(format))
            .components(vk::ComponentMapping::default())
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask,
                base_mip_level: 0,
                level_count: mip_levels,
                base_array_layer: 0,
                layer_count: 1,
            });
        unsafe { self.device.create_image_view(&create_info, None) }
            .context("Failed to create image view")
    }

    /// Bind `image` either to a fresh allocation or into an aliased block
    fn bind_image(
        &self,
        name: &str,
        image: vk::Image,
        placement: Option<(&VulkanMemory, u64)>,
    ) -> Result<Option<gpu_allocator::vulkan::Allocation>> {
        let requirements = unsafe { self.device.get_image_memory_requirements(image) };
        match placement {
            None => {
                let allocation =
                    self.allocate(name, requirements, MemoryLocation::GpuOnly, false)?;
                let bound = unsafe {
                    self.device
                        .bind_image_memory(image, allocation.memory(), allocation.offset())
                };
                if let Err(e) = bound {
                    self.free(allocation);
                    return Err(e).context("Failed to bind image memory");
                }
                Ok(Some(allocation))
            }
            Some((memory, offset)) => {
                ensure!(
                    offset % requirements.alignment == 0,
                    "placement offset {} is not aligned to {}",
                    offset,
                    requirements.alignment
                );
                ensure!(
                    offset + requirements.size <= memory.size,
                    "texture needs {} bytes at offset {} but the block holds {}",
                    requirements.size,
                    offset,
                    memory.size
                );
                unsafe {
                    self.device.bind_image_memory(
                        image,
                        memory.allocation.memory(),
                        memory.allocation.offset() + offset,
                    )
                }
                .context("Failed to bind placed image memory")?;
                Ok(None)
            }
        }
    }
}

impl Backend for VulkanDevice {
    type Buffer = VulkanBuffer;
    type Texture = VulkanTexture;
    type Sampler = vk::Sampler;
    type Memory = VulkanMemory;
    type ExternalImage = vk::Image;
    type CommandList = VulkanCommandList;
    type Timeline = VulkanTimeline;
    type QueryHeap = VulkanQueryHeap;
    type DescriptorPool = VulkanDescriptorPool;
    type DescriptorSet = VulkanDescriptorSet;
    type BindingLayout = VulkanBindingLayout;
    type Pipeline = VulkanPipeline;
    type AccelerationStructure = VulkanAccelerationStructure;

    const KIND: BackendKind = BackendKind::Vulkan;

    // -- device ------------------------------------------------------------

    fn open(config: &Config) -> Result<Self> {
        Self::create(config, None)
    }

    fn capabilities(&self) -> &Capabilities {
        &self.caps
    }

    /// One timestamp written on the graphics queue, paired with the CPU
    /// clock sampled around the submission
    fn calibrate_clocks(&self) -> Result<ClockCalibration> {
        let family = self.caps.queue_families.graphics;
        let pool_info = vk::CommandPoolCreateInfo::builder()
            .queue_family_index(family)
            .flags(vk::CommandPoolCreateFlags::TRANSIENT);
        let pool = unsafe { self.device.create_command_pool(&pool_info, None) }
            .context("Failed to create calibration command pool")?;
        let query_info = vk::QueryPoolCreateInfo::builder()
            .query_type(vk::QueryType::TIMESTAMP)
            .query_count(1);
        let query_pool = match unsafe { self.device.create_query_pool(&query_info, None) } {
            Ok(query_pool) => query_pool,
            Err(e) => {
                unsafe { self.device.destroy_command_pool(pool, None) };
                return Err(e).context("Failed to create calibration query pool");
            }
        };
        let fence = match unsafe {
            self.device
                .create_fence(&vk::FenceCreateInfo::default(), None)
        } {
            Ok(fence) => fence,
            Err(e) => {
                unsafe {
                    self.device.destroy_query_pool(query_pool, None);
                    self.device.destroy_command_pool(pool, None);
                }
                return Err(e).context("Failed to create calibration fence");
            }
        };

        let result = (|| -> Result<ClockCalibration> {
            let alloc_info = vk::CommandBufferAllocateInfo::builder()
                .command_pool(pool)
                .level(vk::CommandBufferLevel::PRIMARY)
                .command_buffer_count(1);
            let cmd = unsafe { self.device.allocate_command_buffers(&alloc_info) }?
                .into_iter()
                .next()
                .context("No calibration command buffer")?;

            unsafe {
                self.device.begin_command_buffer(
                    cmd,
                    &vk::CommandBufferBeginInfo::builder()
                        .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT),
                )?;
                self.device.cmd_reset_query_pool(cmd, query_pool, 0, 1);
                self.device.cmd_write_timestamp(
                    cmd,
                    vk::PipelineStageFlags::TOP_OF_PIPE,
                    query_pool,
                    0,
                );
                self.device.end_command_buffer(cmd)?;
            }

            let command_buffers = [cmd];
            let submit = vk::SubmitInfo::builder().command_buffers(&command_buffers);
            let before = self.now_ns();
            self.with_queue(QueueType::Graphics, |queue| unsafe {
                self.device.queue_submit(queue, &[submit.build()], fence)
            })?;
            unsafe { self.device.wait_for_fences(&[fence], true, u64::MAX) }?;
            let after = self.now_ns();

            let mut ticks = [0u64; 1];
            unsafe {
                self.device.get_query_pool_results(
                    query_pool,
                    0,
                    1,
                    &mut ticks,
                    vk::QueryResultFlags::TYPE_64 | vk::QueryResultFlags::WAIT,
                )
            }?;
            Ok(ClockCalibration {
                cpu_ns: before + (after - before) / 2,
                gpu_ticks: ticks[0],
            })
        })();

        unsafe {
            self.device.destroy_fence(fence, None);
            self.device.destroy_query_pool(query_pool, None);
            self.device.destroy_command_pool(pool, None);
        }
        result.context("Clock calibration failed")
    }

    fn wait_idle(&self) -> Result<()> {
        let _guard = self.submit_lock.lock();
        unsafe { self.device.device_wait_idle() }.context("device_wait_idle failed")
    }

    fn queue_wait_idle(&self, queue: QueueType) -> Result<()> {
        self.with_queue(queue, |raw| unsafe { self.device.queue_wait_idle(raw) })
            .with_context(|| format!("{:?} queue_wait_idle failed", queue))
    }

    /// Size of the native descriptor write record per category
    fn descriptor_stride(&self, category: DescriptorCategory) -> u32 {
        let size = match category {
            DescriptorCategory::Uniform | DescriptorCategory::Storage => {
                std::mem::size_of::<vk::DescriptorBufferInfo>()
            }
            DescriptorCategory::Sampler | DescriptorCategory::Image => {
                std::mem::size_of::<vk::DescriptorImageInfo>()
            }
            DescriptorCategory::AccelerationStructure => {
                std::mem::size_of::<vk::AccelerationStructureKHR>()
            }
        };
        size as u32
    }

    // -- resources ---------------------------------------------------------

    fn create_buffer(&self, desc: &BufferDesc) -> Result<VulkanBuffer> {
        let wants_address = desc.usage.needs_device_address() && self.caps.ray_tracing;
        let mut usage = conv::buffer_usage(desc.usage);
        if wants_address {
            usage |= vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS;
        }

        let create_info = vk::BufferCreateInfo::builder()
            .size(desc.size.max(1))
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let raw = unsafe { self.device.create_buffer(&create_info, None) }
            .with_context(|| format!("Failed to create buffer '{}'", desc.name))?;

        let mut requirements = unsafe { self.device.get_buffer_memory_requirements(raw) };
        if wants_address {
            requirements.alignment = requirements.alignment.max(ADDRESS_ALIGNMENT);
        }
        let location = conv::memory_location(desc.residency);
        let allocation = match self.allocate(desc.name, requirements, location, true) {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { self.device.destroy_buffer(raw, None) };
                return Err(e);
            }
        };
        if let Err(e) =
            unsafe { self.device.bind_buffer_memory(raw, allocation.memory(), allocation.offset()) }
        {
            self.free(allocation);
            unsafe { self.device.destroy_buffer(raw, None) };
            return Err(e).context("Failed to bind buffer memory");
        }

        let address = wants_address.then(|| unsafe {
            self.device
                .get_buffer_device_address(&vk::BufferDeviceAddressInfo::builder().buffer(raw))
        });

        self.set_name(raw, desc.name);
        Ok(VulkanBuffer {
            raw,
            allocation,
            size: desc.size,
            address,
        })
    }

    fn destroy_buffer(&self, buffer: VulkanBuffer) {
        unsafe { self.device.destroy_buffer(buffer.raw, None) };
        self.free(buffer.allocation);
    }

    fn buffer_device_address(&self, buffer: &VulkanBuffer) -> Option<u64> {
        buffer.address
    }

    fn write_buffer(&self, buffer: &VulkanBuffer, offset: u64, data: &[u8]) -> Result<()> {
        ensure!(
            offset + data.len() as u64 <= buffer.size,
            "write of {} bytes at {} overflows buffer of {}",
            data.len(),
            offset,
            buffer.size
        );
        let ptr = buffer
            .allocation
            .mapped_ptr()
            .context("Buffer is not host visible")?;
        unsafe {
            std::ptr::copy_nonoverlapping(
                data.as_ptr(),
                (ptr.as_ptr() as *mut u8).add(offset as usize),
                data.len(),
            );
        }
        Ok(())
    }

    fn read_buffer(&self, buffer: &VulkanBuffer, offset: u64, out: &mut [u8]) -> Result<()> {
        ensure!(
            offset + out.len() as u64 <= buffer.size,
            "read of {} bytes at {} overflows buffer of {}",
            out.len(),
            offset,
            buffer.size
        );
        let ptr = buffer
            .allocation
            .mapped_ptr()
            .context("Buffer is not host visible")?;
        unsafe {
            std::ptr::copy_nonoverlapping(
                (ptr.as_ptr() as *const u8).add(offset as usize),
                out.as_mut_ptr(),
                out.len(),
            );
        }
        Ok(())
    }

    fn create_memory(&self, name: &str, size: u64) -> Result<VulkanMemory> {
        let requirements = vk::MemoryRequirements {
            size,
            alignment: ALIASED_BLOCK_ALIGNMENT,
            memory_type_bits: self.device_local_type_bits(),
        };
        let allocation = self.allocate(name, requirements, MemoryLocation::GpuOnly, false)?;
        Ok(VulkanMemory { allocation, size })
    }

    fn destroy_memory(&self, memory: VulkanMemory) {
        self.free(memory.allocation);
    }

    fn create_texture(
        &self,
        desc: &TextureDesc,
        placement: Option<(&VulkanMemory, u64)>,
    ) -> Result<VulkanTexture> {
        let create_info = image_create_info(desc);
        let (extent, mip_levels) = (create_info.extent, create_info.mip_levels);
        let raw = unsafe { self.device.create_image(&create_info, None) }
            .with_context(|| format!("Failed to create image '{}'", desc.name))?;

        let allocation = match self.bind_image(desc.name, raw, placement) {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { self.device.destroy_image(raw, None) };
                return Err(e);
            }
        };

        let view = match self.create_view(raw, desc.format, desc.extent, mip_levels) {
            Ok(view) => view,
            Err(e) => {
                unsafe { self.device.destroy_image(raw, None) };
                if let Some(allocation) = allocation {
                    self.free(allocation);
                }
                return Err(e);
            }
        };

        self.set_name(raw, desc.name);
        self.set_name(view, &format!("{}_view", desc.name));
        Ok(VulkanTexture {
            raw,
            view,
            allocation,
            owns_image: true,
            aspect: conv::aspect_mask(desc.format),
            extent,
            mip_levels,
        })
    }

    fn wrap_external_image(
        &self,
        name: &str,
        image: vk::Image,
        extent: Extent3d,
        format: Format,
    ) -> Result<VulkanTexture> {
        ensure!(extent.depth == 1, "backbuffers are 2D");
        let view = self.create_view(image, format, extent, 1)?;
        self.set_name(view, &format!("{}_view", name));
        Ok(VulkanTexture {
            raw: image,
            view,
            allocation: None,
            owns_image: false,
            aspect: conv::aspect_mask(format),
            extent: vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            },
            mip_levels: 1,
        })
    }

    fn destroy_texture(&self, texture: VulkanTexture) {
        unsafe {
            self.device.destroy_image_view(texture.view, None);
            if texture.owns_image {
                self.device.destroy_image(texture.raw, None);
            }
        }
        if let Some(allocation) = texture.allocation {
            self.free(allocation);
        }
    }

    fn create_sampler(&self, desc: &SamplerDesc) -> Result<vk::Sampler> {
        let (filter, mipmap_mode) = conv::filter(desc.filter);
        let address_mode = conv::address_mode(desc.address_mode);
        let max_anisotropy = desc
            .max_anisotropy
            .unwrap_or(1.0)
            .min(self.properties.limits.max_sampler_anisotropy);

        let create_info = vk::SamplerCreateInfo::builder()
            .mag_filter(filter)
            .min_filter(filter)
            .mipmap_mode(mipmap_mode)
            .address_mode_u(address_mode)
            .address_mode_v(address_mode)
            .address_mode_w(address_mode)
            .anisotropy_enable(desc.max_anisotropy.is_some())
            .max_anisotropy(max_anisotropy)
            .min_lod(0.0)
            .max_lod(vk::LOD_CLAMP_NONE);
        let sampler = unsafe { self.device.create_sampler(&create_info, None) }
            .with_context(|| format!("Failed to create sampler '{}'", desc.name))?;
        self.set_name(sampler, desc.name);
        Ok(sampler)
    }

    fn destroy_sampler(&self, sampler: vk::Sampler) {
        unsafe { self.device.destroy_sampler(sampler, None) };
    }

    // -- descriptors and pipelines -----------------------------------------

    fn create_binding_layout(
        &self,
        name: &str,
        bindings: &[DescriptorBinding],
    ) -> Result<VulkanBindingLayout> {
        let native: Vec<_> = bindings
            .iter()
            .map(|b| {
                vk::DescriptorSetLayoutBinding::builder()
                    .binding(b.binding)
                    .descriptor_type(conv::descriptor_type(b.category))
                    .descriptor_count(b.count)
                    .stage_flags(conv::shader_stages(b.stages))
                    .build()
            })
            .collect();
        let create_info = vk::DescriptorSetLayoutCreateInfo::builder().bindings(&native);
        let raw = unsafe { self.device.create_descriptor_set_layout(&create_info, None) }
            .with_context(|| format!("Failed to create binding layout '{}'", name))?;
        self.set_name(raw, name);
        Ok(VulkanBindingLayout {
            raw,
            bindings: bindings.to_vec(),
        })
    }

    fn destroy_binding_layout(&self, layout: VulkanBindingLayout) {
        unsafe { self.device.destroy_descriptor_set_layout(layout.raw, None) };
    }

    fn create_descriptor_pool(
        &self,
        name: &str,
        capacities: &[u32; 5],
        max_sets: u32,
    ) -> Result<VulkanDescriptorPool> {
        let sizes: Vec<_> = DescriptorCategory::ALL
            .iter()
            .filter(|c| capacities[c.index()] > 0)
            .filter(|c| **c != DescriptorCategory::AccelerationStructure || self.caps.ray_tracing)
            .map(|c| vk::DescriptorPoolSize {
                ty: conv::descriptor_type(*c),
                descriptor_count: capacities[c.index()],
            })
            .collect();
        let create_info = vk::DescriptorPoolCreateInfo::builder()
            .max_sets(max_sets)
            .pool_sizes(&sizes);
        let raw = unsafe { self.device.create_descriptor_pool(&create_info, None) }
            .with_context(|| format!("Failed to create descriptor pool '{}'", name))?;
        self.set_name(raw, name);
        Ok(VulkanDescriptorPool { raw })
    }

    fn destroy_descriptor_pool(&self, pool: VulkanDescriptorPool) {
        unsafe { self.device.destroy_descriptor_pool(pool.raw, None) };
    }

    fn reset_descriptor_pool(&self, pool: &VulkanDescriptorPool) -> Result<()> {
        unsafe {
            self.device
                .reset_descriptor_pool(pool.raw, vk::DescriptorPoolResetFlags::empty())
        }
        .context("Failed to reset descriptor pool")
    }

    fn allocate_descriptor_set(
        &self,
        pool: &VulkanDescriptorPool,
        layout: &VulkanBindingLayout,
    ) -> Result<VulkanDescriptorSet> {
        let layouts = [layout.raw];
        let alloc_info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(pool.raw)
            .set_layouts(&layouts);
        let raw = unsafe { self.device.allocate_descriptor_sets(&alloc_info) }
            .context("Failed to allocate descriptor set")?
            .into_iter()
            .next()
            .context("Driver returned no descriptor set")?;
        Ok(VulkanDescriptorSet { raw })
    }

    fn write_descriptor(
        &self,
        set: &VulkanDescriptorSet,
        binding: &DescriptorBinding,
        array_index: u32,
        resource: DescriptorResource<'_, Self>,
    ) {
        let write = vk::WriteDescriptorSet::builder()
            .dst_set(set.raw)
            .dst_binding(binding.binding)
            .dst_array_element(array_index)
            .descriptor_type(conv::descriptor_type(binding.category));

        match resource {
            DescriptorResource::Buffer {
                buffer,
                offset,
                range,
            } => {
                let info = [vk::DescriptorBufferInfo {
                    buffer: buffer.raw,
                    offset,
                    range,
                }];
                let write = write.buffer_info(&info).build();
                unsafe { self.device.update_descriptor_sets(&[write], &[]) };
            }
            DescriptorResource::Texture(texture) => {
                let info = [vk::DescriptorImageInfo {
                    sampler: vk::Sampler::null(),
                    image_view: texture.view,
                    image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                }];
                let write = write.image_info(&info).build();
                unsafe { self.device.update_descriptor_sets(&[write], &[]) };
            }
            DescriptorResource::Sampler(sampler) => {
                let info = [vk::DescriptorImageInfo {
                    sampler: *sampler,
                    image_view: vk::ImageView::null(),
                    image_layout: vk::ImageLayout::UNDEFINED,
                }];
                let write = write.image_info(&info).build();
                unsafe { self.device.update_descriptor_sets(&[write], &[]) };
            }
            DescriptorResource::AccelerationStructure(accel) => {
                let structures = [accel.raw];
                let mut accel_info = vk::WriteDescriptorSetAccelerationStructureKHR::builder()
                    .acceleration_structures(&structures);
                let mut write = write.push_next(&mut accel_info).build();
                // Count is not derived from a pNext payload
                write.descriptor_count = 1;
                unsafe { self.device.update_descriptor_sets(&[write], &[]) };
            }
        }
    }

    fn create_pipeline(&self, desc: &PipelineDesc<'_, Self>) -> Result<VulkanPipeline> {
        let (bind_point, push_stages, group_count) = match &desc.kind {
            PipelineKind::Graphics(g) => {
                let mut stages = ShaderStages::VERTEX;
                if g.fragment.is_some() {
                    stages |= ShaderStages::FRAGMENT;
                }
                (vk::PipelineBindPoint::GRAPHICS, stages, 0)
            }
            PipelineKind::Compute(_) => (vk::PipelineBindPoint::COMPUTE, ShaderStages::COMPUTE, 0),
            PipelineKind::RayTracing(rt) => (
                vk::PipelineBindPoint::RAY_TRACING_KHR,
                ShaderStages::ALL_RAY_TRACING,
                1 + rt.miss.len() as u32 + rt.hit_groups.len() as u32,
            ),
        };
        let push_stages = conv::shader_stages(push_stages);

        let set_layouts: Vec<_> = desc.binding_layouts.iter().map(|l| l.raw).collect();
        let push_ranges: Vec<_> = (desc.push_constant_size > 0)
            .then(|| vk::PushConstantRange {
                stage_flags: push_stages,
                offset: 0,
                size: desc.push_constant_size,
            })
            .into_iter()
            .collect();
        let layout_info = vk::PipelineLayoutCreateInfo::builder()
            .set_layouts(&set_layouts)
            .push_constant_ranges(&push_ranges);
        let layout = unsafe { self.device.create_pipeline_layout(&layout_info, None) }
            .with_context(|| format!("Failed to create layout for pipeline '{}'", desc.name))?;

        let mut scratch = StageScratch::default();
        let result = match &desc.kind {
            PipelineKind::Graphics(g) => self.create_graphics_pipeline(g, layout, &mut scratch),
            PipelineKind::Compute(cs) => self.create_compute_pipeline(cs, layout, &mut scratch),
            PipelineKind::RayTracing(rt) => {
                self.create_ray_tracing_pipeline(rt, layout, &mut scratch)
            }
        };
        for module in scratch.modules {
            unsafe { self.device.destroy_shader_module(module, None) };
        }

        let raw = match result {
            Ok(raw) => raw,
            Err(e) => {
                unsafe { self.device.destroy_pipeline_layout(layout, None) };
                return Err(e.context(format!("Failed to create pipeline '{}'", desc.name)));
            }
        };

        self.set_name(raw, desc.name);
        self.set_name(layout, &format!("{}_layout", desc.name));
        log::debug!("Created {:?} pipeline '{}'", bind_point, desc.name);
        Ok(VulkanPipeline {
            raw,
            layout,
            bind_point,
            push_stages,
            group_count,
        })
    }

    fn destroy_pipeline(&self, pipeline: VulkanPipeline) {
        unsafe {
            self.device.destroy_pipeline(pipeline.raw, None);
            self.device.destroy_pipeline_layout(pipeline.layout, None);
        }
    }

    fn shader_group_info(&self) -> ShaderGroupInfo {
        self.ray_tracing().shader_groups
    }

    fn shader_group_handles(&self, pipeline: &VulkanPipeline) -> Result<Vec<u8>> {
        ensure!(
            pipeline.bind_point == vk::PipelineBindPoint::RAY_TRACING_KHR,
            "shader group handles of a non ray tracing pipeline"
        );
        let rt = self.ray_tracing();
        let size = pipeline.group_count as usize * rt.shader_groups.handle_size as usize;
        unsafe {
            rt.pipeline.get_ray_tracing_shader_group_handles(
                pipeline.raw,
                0,
                pipeline.group_count,
                size,
            )
        }
        .context("Failed to read shader group handles")
    }

    // -- acceleration structures -------------------------------------------

    fn acceleration_structure_sizes(
        &self,
        input: &AccelerationStructureInput<'_, Self>,
        allow_update: bool,
    ) -> AccelerationStructureSizes {
        let rt = self.ray_tracing();
        let (ty, geometries, ranges) = self.accel_geometry(input);
        let build_info = vk::AccelerationStructureBuildGeometryInfoKHR::builder()
            .ty(ty)
            .flags(build_flags(allow_update))
            .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
            .geometries(&geometries);
        let max_primitive_counts: Vec<u32> = ranges.iter().map(|r| r.primitive_count).collect();

        let sizes = unsafe {
            rt.accel.get_acceleration_structure_build_sizes(
                vk::AccelerationStructureBuildTypeKHR::DEVICE,
                &build_info,
                &max_primitive_counts,
            )
        };
        AccelerationStructureSizes {
            structure_size: sizes.acceleration_structure_size,
            build_scratch_size: sizes.build_scratch_size,
            update_scratch_size: if allow_update {
                sizes.update_scratch_size
            } else {
                0
            },
        }
    }

    fn create_acceleration_structure(
        &self,
        name: &str,
        level: AccelerationStructureLevel,
        buffer: &VulkanBuffer,
        size: u64,
    ) -> Result<VulkanAccelerationStructure> {
        let ty = match level {
            AccelerationStructureLevel::Bottom => vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL,
            AccelerationStructureLevel::Top => vk::AccelerationStructureTypeKHR::TOP_LEVEL,
        };
        let create_info = vk::AccelerationStructureCreateInfoKHR::builder()
            .buffer(buffer.raw)
            .offset(0)
            .size(size)
            .ty(ty);
        let raw = unsafe {
            self.ray_tracing()
                .accel
                .create_acceleration_structure(&create_info, None)
        }
        .with_context(|| format!("Failed to create acceleration structure '{}'", name))?;
        self.set_name(raw, name);
        Ok(VulkanAccelerationStructure { raw, level })
    }

    fn destroy_acceleration_structure(&self, accel: VulkanAccelerationStructure) {
        unsafe {
            self.ray_tracing()
                .accel
                .destroy_acceleration_structure(accel.raw, None)
        };
    }

    fn acceleration_structure_address(&self, accel: &VulkanAccelerationStructure) -> u64 {
        let info = vk::AccelerationStructureDeviceAddressInfoKHR::builder()
            .acceleration_structure(accel.raw);
        unsafe {
            self.ray_tracing()
                .accel
                .get_acceleration_structure_device_address(&info)
        }
    }

    fn instance_size(&self) -> u64 {
        std::mem::size_of::<vk::AccelerationStructureInstanceKHR>() as u64
    }

    fn encode_instance(&self, instance: &InstanceRecord, out: &mut Vec<u8>) {
        let mut matrix = [0.0f32; 12];
        for (row, values) in instance.transform.iter().enumerate() {
            matrix[row * 4..row * 4 + 4].copy_from_slice(values);
        }
        let flags = conv::instance_flags(instance.flags).as_raw() as u8;
        let native = vk::AccelerationStructureInstanceKHR {
            transform: vk::TransformMatrixKHR { matrix },
            instance_custom_index_and_mask: vk::Packed24_8::new(
                instance.custom_index & 0x00FF_FFFF,
                instance.mask,
            ),
            instance_shader_binding_table_record_offset_and_flags: vk::Packed24_8::new(
                instance.hit_group_offset & 0x00FF_FFFF,
                flags,
            ),
            acceleration_structure_reference: vk::AccelerationStructureReferenceKHR {
                device_handle: instance.blas_address,
            },
        };
        let bytes = unsafe {
            std::slice::from_raw_parts(
                &native as *const vk::AccelerationStructureInstanceKHR as *const u8,
                std::mem::size_of::<vk::AccelerationStructureInstanceKHR>(),
            )
        };
        out.extend_from_slice(bytes);
    }

    // -- synchronization and queries ---------------------------------------

    fn create_timeline(&self, name: &str, initial_value: u64) -> Result<VulkanTimeline> {
        let mut type_info = vk::SemaphoreTypeCreateInfo::builder()
            .semaphore_type(vk::SemaphoreType::TIMELINE)
            .initial_value(initial_value);
        let create_info = vk::SemaphoreCreateInfo::builder().push_next(&mut type_info);
        let raw = unsafe { self.device.create_semaphore(&create_info, None) }
            .with_context(|| format!("Failed to create timeline semaphore '{}'", name))?;
        self.set_name(raw, name);
        Ok(VulkanTimeline { raw })
    }

    fn destroy_timeline(&self, timeline: VulkanTimeline) {
        unsafe { self.device.destroy_semaphore(timeline.raw, None) };
    }

    fn timeline_value(&self, timeline: &VulkanTimeline) -> Result<u64> {
        unsafe { self.device.get_semaphore_counter_value(timeline.raw) }
            .context("Failed to read timeline value")
    }

    fn wait_timeline(&self, timeline: &VulkanTimeline, value: u64, timeout: Duration) -> Result<bool> {
        let semaphores = [timeline.raw];
        let values = [value];
        let wait_info = vk::SemaphoreWaitInfo::builder()
            .semaphores(&semaphores)
            .values(&values);
        let timeout_ns = u64::try_from(timeout.as_nanos()).unwrap_or(u64::MAX);
        match unsafe { self.device.wait_semaphores(&wait_info, timeout_ns) } {
            Ok(()) => Ok(true),
            Err(vk::Result::TIMEOUT) => Ok(false),
            Err(e) => Err(e).context("wait_semaphores failed"),
        }
    }

    fn create_query_heap(&self, name: &str, capacity: u32) -> Result<VulkanQueryHeap> {
        let create_info = vk::QueryPoolCreateInfo::builder()
            .query_type(vk::QueryType::TIMESTAMP)
            .query_count(capacity.max(1));
        let raw = unsafe { self.device.create_query_pool(&create_info, None) }
            .with_context(|| format!("Failed to create query pool '{}'", name))?;
        self.set_name(raw, name);
        Ok(VulkanQueryHeap { raw, capacity })
    }

    fn destroy_query_heap(&self, heap: VulkanQueryHeap) {
        unsafe { self.device.destroy_query_pool(heap.raw, None) };
    }

    fn read_queries(&self, heap: &VulkanQueryHeap, first: u32, count: u32) -> Result<Vec<u64>> {
        if count == 0 {
            return Ok(Vec::new());
        }
        ensure!(
            first + count <= heap.capacity,
            "queries {}..{} outside pool of {}",
            first,
            first + count,
            heap.capacity
        );
        let mut results = vec![0u64; count as usize];
        unsafe {
            self.device.get_query_pool_results(
                heap.raw,
                first,
                count,
                &mut results,
                vk::QueryResultFlags::TYPE_64 | vk::QueryResultFlags::WAIT,
            )
        }
        .context("Failed to read query results")?;
        Ok(results)
    }

    // -- command lists -----------------------------------------------------

    fn create_command_list(&self, name: &str, queue: QueueType) -> Result<VulkanCommandList> {
        let pool_info = vk::CommandPoolCreateInfo::builder()
            .queue_family_index(self.caps.queue_families.family(queue))
            .flags(vk::CommandPoolCreateFlags::TRANSIENT);
        let pool = unsafe { self.device.create_command_pool(&pool_info, None) }
            .with_context(|| format!("Failed to create command pool for '{}'", name))?;

        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let raw = match unsafe { self.device.allocate_command_buffers(&alloc_info) } {
            Ok(buffers) if !buffers.is_empty() => buffers[0],
            Ok(_) | Err(_) => {
                unsafe { self.device.destroy_command_pool(pool, None) };
                anyhow::bail!("Failed to allocate command buffer '{}'", name);
            }
        };

        self.set_name(pool, &format!("{}_pool", name));
        self.set_name(raw, name);
        Ok(VulkanCommandList { pool, raw, queue })
    }

    fn destroy_command_list(&self, list: VulkanCommandList) {
        unsafe { self.device.destroy_command_pool(list.pool, None) };
    }

    fn reset_command_list(&self, list: &mut VulkanCommandList) -> Result<()> {
        unsafe {
            self.device
                .reset_command_pool(list.pool, vk::CommandPoolResetFlags::empty())
        }
        .context("Failed to reset command pool")
    }

    fn begin_command_list(&self, list: &mut VulkanCommandList) -> Result<()> {
        let begin_info = vk::CommandBufferBeginInfo::builder()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe { self.device.begin_command_buffer(list.raw, &begin_info) }
            .context("Failed to begin command buffer")
    }

    fn end_command_list(&self, list: &mut VulkanCommandList) -> Result<()> {
        unsafe { self.device.end_command_buffer(list.raw) }.context("Failed to end command buffer")
    }

    fn submit(
        &self,
        queue: QueueType,
        list: &VulkanCommandList,
        waits: &[(&VulkanTimeline, u64)],
        signals: &[(&VulkanTimeline, u64)],
    ) -> Result<()> {
        debug_assert_eq!(queue, list.queue, "command list submitted to the wrong queue");

        let wait_semaphores: Vec<_> = waits.iter().map(|(t, _)| t.raw).collect();
        let wait_values: Vec<_> = waits.iter().map(|(_, v)| *v).collect();
        let wait_stages = vec![vk::PipelineStageFlags::ALL_COMMANDS; waits.len()];
        let signal_semaphores: Vec<_> = signals.iter().map(|(t, _)| t.raw).collect();
        let signal_values: Vec<_> = signals.iter().map(|(_, v)| *v).collect();

        let mut timeline_info = vk::TimelineSemaphoreSubmitInfo::builder()
            .wait_semaphore_values(&wait_values)
            .signal_semaphore_values(&signal_values);
        let command_buffers = [list.raw];
        let submit_info = vk::SubmitInfo::builder()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores)
            .push_next(&mut timeline_info);

        self.with_queue(queue, |raw| unsafe {
            self.device
                .queue_submit(raw, &[submit_info.build()], vk::Fence::null())
        })
        .with_context(|| format!("{:?} queue submit failed", queue))
    }

    fn cmd_texture_barriers(&self, list: &mut VulkanCommandList, barriers: &[TextureBarrier<'_, Self>]) {
        if barriers.is_empty() {
            return;
        }
        let mut src_stages = vk::PipelineStageFlags::empty();
        let mut dst_stages = vk::PipelineStageFlags::empty();
        let native: Vec<_> = barriers
            .iter()
            .map(|b| {
                let before = conv::state_info(b.before);
                let after = conv::state_info(b.after);
                src_stages |= before.stages;
                dst_stages |= after.stages;
                vk::ImageMemoryBarrier::builder()
                    .src_access_mask(before.access)
                    .dst_access_mask(after.access)
                    .old_layout(before.layout)
                    .new_layout(after.layout)
                    .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .image(b.texture.raw)
                    .subresource_range(Self::full_range(b.texture))
                    .build()
            })
            .collect();

        unsafe {
            self.device.cmd_pipeline_barrier(
                list.raw,
                src_stages,
                dst_stages,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &native,
            )
        };
    }

    fn cmd_buffer_barrier(&self, list: &mut VulkanCommandList, buffer: &VulkanBuffer) {
        let barrier = vk::BufferMemoryBarrier::builder()
            .src_access_mask(vk::AccessFlags::MEMORY_WRITE)
            .dst_access_mask(vk::AccessFlags::MEMORY_READ | vk::AccessFlags::MEMORY_WRITE)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .buffer(buffer.raw)
            .offset(0)
            .size(vk::WHOLE_SIZE)
            .build();
        unsafe {
            self.device.cmd_pipeline_barrier(
                list.raw,
                vk::PipelineStageFlags::ALL_COMMANDS,
                vk::PipelineStageFlags::ALL_COMMANDS,
                vk::DependencyFlags::empty(),
                &[],
                &[barrier],
                &[],
            )
        };
    }

    fn cmd_copy_buffer(
        &self,
        list: &mut VulkanCommandList,
        src: &VulkanBuffer,
        dst: &VulkanBuffer,
        region: BufferCopy,
    ) {
        let copy = vk::BufferCopy {
            src_offset: region.src_offset,
            dst_offset: region.dst_offset,
            size: region.size,
        };
        unsafe { self.device.cmd_copy_buffer(list.raw, src.raw, dst.raw, &[copy]) };
    }

    fn cmd_copy_buffer_to_texture(
        &self,
        list: &mut VulkanCommandList,
        src: &VulkanBuffer,
        dst: &VulkanTexture,
        region: BufferTextureCopy,
    ) {
        let copy = vk::BufferImageCopy {
            buffer_offset: region.buffer_offset,
            buffer_row_length: 0,
            buffer_image_height: 0,
            image_subresource: Self::copy_layers(dst, region.mip_level),
            image_offset: vk::Offset3D::default(),
            image_extent: Self::mip_extent(dst, region.mip_level),
        };
        unsafe {
            self.device.cmd_copy_buffer_to_image(
                list.raw,
                src.raw,
                dst.raw,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[copy],
            )
        };
    }

    fn cmd_copy_texture_to_buffer(
        &self,
        list: &mut VulkanCommandList,
        src: &VulkanTexture,
        dst: &VulkanBuffer,
        region: BufferTextureCopy,
    ) {
        let copy = vk::BufferImageCopy {
            buffer_offset: region.buffer_offset,
            buffer_row_length: 0,
            buffer_image_height: 0,
            image_subresource: Self::copy_layers(src, region.mip_level),
            image_offset: vk::Offset3D::default(),
            image_extent: Self::mip_extent(src, region.mip_level),
        };
        unsafe {
            self.device.cmd_copy_image_to_buffer(
                list.raw,
                src.raw,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                dst.raw,
                &[copy],
            )
        };
    }

    fn cmd_begin_rendering(&self, list: &mut VulkanCommandList, desc: &RenderingDesc<'_, Self>) {
        let colors: Vec<_> = desc
            .colors
            .iter()
            .map(|c| {
                vk::RenderingAttachmentInfo::builder()
                    .image_view(c.texture.view)
                    .image_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
                    .load_op(conv::load_op(c.load))
                    .store_op(vk::AttachmentStoreOp::STORE)
                    .clear_value(vk::ClearValue {
                        color: vk::ClearColorValue { float32: c.clear },
                    })
                    .build()
            })
            .collect();
        let depth = desc.depth.as_ref().map(|d| {
            vk::RenderingAttachmentInfo::builder()
                .image_view(d.texture.view)
                .image_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)
                .load_op(conv::load_op(d.load))
                .store_op(vk::AttachmentStoreOp::STORE)
                .clear_value(vk::ClearValue {
                    depth_stencil: vk::ClearDepthStencilValue {
                        depth: d.clear_depth,
                        stencil: 0,
                    },
                })
                .build()
        });

        let render_area = vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent: vk::Extent2D {
                width: desc.width,
                height: desc.height,
            },
        };
        let mut rendering_info = vk::RenderingInfo::builder()
            .render_area(render_area)
            .layer_count(1)
            .color_attachments(&colors);
        if let Some(depth) = depth.as_ref() {
            rendering_info = rendering_info.depth_attachment(depth);
        }

        unsafe { self.device.cmd_begin_rendering(list.raw, &rendering_info) };
    }

    fn cmd_end_rendering(&self, list: &mut VulkanCommandList) {
        unsafe { self.device.cmd_end_rendering(list.raw) };
    }

    fn cmd_set_viewport(&self, list: &mut VulkanCommandList, x: f32, y: f32, width: f32, height: f32) {
        let viewport = vk::Viewport {
            x,
            y,
            width,
            height,
            min_depth: 0.0,
            max_depth: 1.0,
        };
        unsafe { self.device.cmd_set_viewport(list.raw, 0, &[viewport]) };
    }

    fn cmd_set_scissor(&self, list: &mut VulkanCommandList, x: i32, y: i32, width: u32, height: u32) {
        let scissor = vk::Rect2D {
            offset: vk::Offset2D { x, y },
            extent: vk::Extent2D { width, height },
        };
        unsafe { self.device.cmd_set_scissor(list.raw, 0, &[scissor]) };
    }

    fn cmd_bind_pipeline(&self, list: &mut VulkanCommandList, pipeline: &VulkanPipeline) {
        unsafe {
            self.device
                .cmd_bind_pipeline(list.raw, pipeline.bind_point, pipeline.raw)
        };
    }

    fn cmd_bind_descriptor_sets(
        &self,
        list: &mut VulkanCommandList,
        pipeline: &VulkanPipeline,
        first_set: u32,
        sets: &[&VulkanDescriptorSet],
    ) {
        let raw: Vec<_> = sets.iter().map(|s| s.raw).collect();
        unsafe {
            self.device.cmd_bind_descriptor_sets(
                list.raw,
                pipeline.bind_point,
                pipeline.layout,
                first_set,
                &raw,
                &[],
            )
        };
    }

    fn cmd_push_constants(
        &self,
        list: &mut VulkanCommandList,
        pipeline: &VulkanPipeline,
        offset: u32,
        data: &[u8],
    ) {
        unsafe {
            self.device.cmd_push_constants(
                list.raw,
                pipeline.layout,
                pipeline.push_stages,
                offset,
                data,
            )
        };
    }

    fn cmd_bind_vertex_buffers(
        &self,
        list: &mut VulkanCommandList,
        first_binding: u32,
        buffers: &[(&VulkanBuffer, u64)],
    ) {
        let raw: Vec<_> = buffers.iter().map(|(b, _)| b.raw).collect();
        let offsets: Vec<_> = buffers.iter().map(|(_, offset)| *offset).collect();
        unsafe {
            self.device
                .cmd_bind_vertex_buffers(list.raw, first_binding, &raw, &offsets)
        };
    }

    fn cmd_bind_index_buffer(
        &self,
        list: &mut VulkanCommandList,
        buffer: &VulkanBuffer,
        offset: u64,
        index_type: IndexType,
    ) {
        unsafe {
            self.device.cmd_bind_index_buffer(
                list.raw,
                buffer.raw,
                offset,
                conv::index_type(index_type),
            )
        };
    }

    fn cmd_draw(
        &self,
        list: &mut VulkanCommandList,
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    ) {
        unsafe {
            self.device.cmd_draw(
                list.raw,
                vertex_count,
                instance_count,
                first_vertex,
                first_instance,
            )
        };
    }

    fn cmd_draw_indexed(
        &self,
        list: &mut VulkanCommandList,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    ) {
        unsafe {
            self.device.cmd_draw_indexed(
                list.raw,
                index_count,
                instance_count,
                first_index,
                vertex_offset,
                first_instance,
            )
        };
    }

    fn cmd_dispatch(&self, list: &mut VulkanCommandList, x: u32, y: u32, z: u32) {
        unsafe { self.device.cmd_dispatch(list.raw, x, y, z) };
    }

    fn cmd_trace_rays(
        &self,
        list: &mut VulkanCommandList,
        sbt: &VulkanBuffer,
        regions: &SbtRegions,
        width: u32,
        height: u32,
        depth: u32,
    ) {
        let base = Self::buffer_address(sbt);
        let region = |r: &SbtRegion| vk::StridedDeviceAddressRegionKHR {
            device_address: if r.size == 0 { 0 } else { base + r.offset },
            stride: r.stride,
            size: r.size,
        };
        let callable = vk::StridedDeviceAddressRegionKHR::default();
        unsafe {
            self.ray_tracing().pipeline.cmd_trace_rays(
                list.raw,
                &region(&regions.raygen),
                &region(&regions.miss),
                &region(&regions.hit),
                &callable,
                width,
                height,
                depth,
            )
        };
    }

    fn cmd_reset_queries(&self, list: &mut VulkanCommandList, heap: &VulkanQueryHeap, first: u32, count: u32) {
        if count == 0 {
            return;
        }
        unsafe {
            self.device
                .cmd_reset_query_pool(list.raw, heap.raw, first, count)
        };
    }

    fn cmd_write_timestamp(&self, list: &mut VulkanCommandList, heap: &VulkanQueryHeap, index: u32) {
        unsafe {
            self.device.cmd_write_timestamp(
                list.raw,
                vk::PipelineStageFlags::BOTTOM_OF_PIPE,
                heap.raw,
                index,
            )
        };
    }

    fn cmd_build_acceleration_structure(
        &self,
        list: &mut VulkanCommandList,
        dst: &VulkanAccelerationStructure,
        input: &AccelerationStructureInput<'_, Self>,
        scratch: &VulkanBuffer,
        allow_update: bool,
        update: bool,
    ) {
        debug_assert_eq!(input.level(), dst.level);
        let (ty, geometries, ranges) = self.accel_geometry(input);
        let (mode, src) = if update {
            (vk::BuildAccelerationStructureModeKHR::UPDATE, dst.raw)
        } else {
            (
                vk::BuildAccelerationStructureModeKHR::BUILD,
                vk::AccelerationStructureKHR::null(),
            )
        };
        let build_info = vk::AccelerationStructureBuildGeometryInfoKHR::builder()
            .ty(ty)
            .flags(build_flags(allow_update))
            .mode(mode)
            .src_acceleration_structure(src)
            .dst_acceleration_structure(dst.raw)
            .geometries(&geometries)
            .scratch_data(vk::DeviceOrHostAddressKHR {
                device_address: Self::buffer_address(scratch),
            })
            .build();

        unsafe {
            self.ray_tracing().accel.cmd_build_acceleration_structures(
                list.raw,
                &[build_info],
                &[&ranges],
            )
        };
    }
}

/// Owned, non-array image for `desc`; zero mip levels means one
fn image_create_info(desc: &TextureDesc) -> vk::ImageCreateInfo {
    let image_type = if desc.extent.depth > 1 {
        vk::ImageType::TYPE_3D
    } else {
        vk::ImageType::TYPE_2D
    };
    vk::ImageCreateInfo::builder()
        .image_type(image_type)
        .format(conv::format(desc.format))
        .extent(vk::Extent3D {
            width: desc.extent.width,
            height: desc.extent.height,
            depth: desc.extent.depth,
        })
        .mip_levels(desc.mip_levels.max(1))
        .array_layers(1)
        .samples(vk::SampleCountFlags::TYPE_1)
        .tiling(vk::ImageTiling::OPTIMAL)
        .usage(conv::texture_usage(desc.usage))
        .sharing_mode(vk::SharingMode::EXCLUSIVE)
        .initial_layout(vk::ImageLayout::UNDEFINED)
        .build()
}

fn build_flags(allow_update: bool) -> vk::BuildAccelerationStructureFlagsKHR {
    let mut flags = vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE;
    if allow_update {
        flags |= vk::BuildAccelerationStructureFlagsKHR::ALLOW_UPDATE;
    }
    flags
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn update_capable_builds_set_allow_update() {
        assert!(build_flags(true).contains(vk::BuildAccelerationStructureFlagsKHR::ALLOW_UPDATE));
        assert!(!build_flags(false).contains(vk::BuildAccelerationStructureFlagsKHR::ALLOW_UPDATE));
    }

    #[test]
    fn zero_mip_levels_create_one() {
        use crate::types::{ResourceState, TextureUsage};
        let desc = |mip_levels| TextureDesc {
            name: "albedo",
            extent: Extent3d::new_2d(64, 64),
            format: Format::Rgba8Unorm,
            usage: TextureUsage::SAMPLED,
            mip_levels,
            initial_state: ResourceState::ReadOnly,
        };
        assert_eq!(image_create_info(&desc(0)).mip_levels, 1);
        assert_eq!(image_create_info(&desc(7)).mip_levels, 7);
        assert_eq!(image_create_info(&desc(1)).image_type, vk::ImageType::TYPE_2D);
    }

    #[test]
    fn native_instance_record_is_64_bytes() {
        assert_eq!(std::mem::size_of::<vk::AccelerationStructureInstanceKHR>(), 64);
    }
}
