mod common;

use my_rhi::{
    AddressMode, Backend, BufferDesc, BufferUsage, ColorTarget, CommandPool, DepthTarget,
    DescriptorBinding, DescriptorCategory, DescriptorPool, DescriptorWrite, Extent3d, Fence,
    Filter, Format, LoadOp, MemoryResidency, QueueType, ResourceState, SamplerDesc, ShaderStages,
    StagingManager, TextureDesc, TextureOrigin, TextureUsage,
};

use my_rhi::backend::{PipelineKind, ShaderBinary};
use my_rhi::{BindingLayout, HeadlessDevice, Pipeline};

use common::{device, readback_buffer, TestDevice};

fn binding(binding: u32, category: DescriptorCategory, count: u32) -> DescriptorBinding {
    DescriptorBinding {
        binding,
        category,
        count,
        stages: ShaderStages::ALL_GRAPHICS,
    }
}

#[test]
fn descriptor_sets_get_disjoint_heap_ranges() {
    let device = device();
    let config = common::config();
    let layout = device
        .create_binding_layout(
            "material",
            &[
                binding(0, DescriptorCategory::Uniform, 2),
                binding(1, DescriptorCategory::Image, 3),
                binding(2, DescriptorCategory::Sampler, 1),
            ],
        )
        .unwrap();
    let mut pool = DescriptorPool::new(&device, "materials", &config.descriptors).unwrap();

    let first = pool.allocate_set(&layout).unwrap();
    let second = pool.allocate_set(&layout).unwrap();
    assert_eq!(first.pool_id(), pool.id());

    let uniform_stride = device.raw().descriptor_stride(DescriptorCategory::Uniform) as u64;
    let image_stride = device.raw().descriptor_stride(DescriptorCategory::Image) as u64;
    assert_eq!(second.slots()[0].first_slot, 2);
    assert_eq!(second.slots()[0].offset, 2 * uniform_stride);
    assert_eq!(second.slots()[1].first_slot, 3);
    assert_eq!(second.slots()[1].offset, 3 * image_stride);
    assert_eq!(pool.heap(DescriptorCategory::Uniform).used(), 4);
    assert_eq!(pool.heap(DescriptorCategory::Image).used(), 6);
    assert_eq!(pool.heap(DescriptorCategory::Storage).used(), 0);

    drop((first, second));
    pool.reset().unwrap();
    let again = pool.allocate_set(&layout).unwrap();
    assert!(again.slots().iter().all(|h| h.first_slot == 0 && h.offset == 0));
}

#[test]
#[should_panic(expected = "descriptor heap exhausted")]
fn descriptor_heap_overflow_is_fatal() {
    let device = device();
    let mut config = common::config();
    config.descriptors.sampler_capacity = 2;
    let layout = device
        .create_binding_layout("samplers", &[binding(0, DescriptorCategory::Sampler, 1)])
        .unwrap();
    let mut pool = DescriptorPool::new(&device, "tiny", &config.descriptors).unwrap();
    let _sets: Vec<_> = (0..3).map(|_| pool.allocate_set(&layout).unwrap()).collect();
}

#[test]
fn written_sets_become_bindable() {
    let device = device();
    let config = common::config();
    let layout = device
        .create_binding_layout(
            "lit",
            &[
                binding(0, DescriptorCategory::Uniform, 1),
                binding(1, DescriptorCategory::Image, 1),
                binding(2, DescriptorCategory::Sampler, 1),
                binding(3, DescriptorCategory::Storage, 1),
            ],
        )
        .unwrap();
    let constants = device
        .create_buffer(&BufferDesc {
            name: "constants",
            size: 256,
            usage: BufferUsage::CONSTANT_BUFFER,
            residency: MemoryResidency::CpuToGpu,
        })
        .unwrap();
    let lights = device
        .create_buffer(&BufferDesc {
            name: "lights",
            size: 1024,
            usage: BufferUsage::STORAGE_BUFFER,
            residency: MemoryResidency::GpuOnly,
        })
        .unwrap();
    let texture = device
        .create_texture(&TextureDesc {
            name: "base_color",
            extent: Extent3d::new_2d(2, 2),
            format: Format::Rgba8Srgb,
            usage: TextureUsage::SAMPLED,
            mip_levels: 1,
            initial_state: ResourceState::ReadOnly,
        })
        .unwrap();
    let sampler = device
        .create_sampler(&SamplerDesc {
            name: "linear_repeat",
            filter: Filter::Linear,
            address_mode: AddressMode::Repeat,
            max_anisotropy: Some(8.0),
        })
        .unwrap();

    let mut pool = DescriptorPool::new(&device, "frame_sets", &config.descriptors).unwrap();
    let mut set = pool.allocate_set(&layout).unwrap();
    set.write(0, 0, DescriptorWrite::Buffer(&constants));
    set.write(1, 0, DescriptorWrite::Texture(&texture));
    set.write(2, 0, DescriptorWrite::Sampler(&sampler));
    assert!(!set.is_updated());
    set.write(
        3,
        0,
        DescriptorWrite::BufferRange {
            buffer: &lights,
            offset: 256,
            size: 512,
        },
    );
    set.mark_updated();
    assert!(set.is_updated());

    // Rewriting a slot makes the set stale until marked again
    set.write(0, 0, DescriptorWrite::Buffer(&constants));
    assert!(!set.is_updated());
}

#[test]
fn placed_textures_share_memory() {
    let device = device();
    let memory = device.create_aliased_memory("transient", 4096).unwrap();
    let desc = |name: &'static str| TextureDesc {
        name,
        extent: Extent3d::new_2d(4, 4),
        format: Format::Rgba8Unorm,
        usage: TextureUsage::TRANSFER_DST | TextureUsage::TRANSFER_SRC | TextureUsage::STORAGE,
        mip_levels: 1,
        initial_state: ResourceState::None,
    };
    let gbuffer = device.create_placed_texture(&desc("gbuffer"), &memory, 0).unwrap();
    let bloom = device.create_placed_texture(&desc("bloom"), &memory, 0).unwrap();
    let offset = device.create_placed_texture(&desc("offset"), &memory, 1024).unwrap();
    assert_eq!(gbuffer.origin(), TextureOrigin::Placed { offset: 0 });
    assert_eq!(offset.origin(), TextureOrigin::Placed { offset: 1024 });

    let mut staging = StagingManager::new(&device, &common::config().staging).unwrap();
    staging
        .upload_texture(&gbuffer, &[0x5A; 64], ResourceState::None, ResourceState::ReadOnly)
        .unwrap();
    staging.submit_all_pending_upload().unwrap();

    let readback = readback_buffer(&device, "aliased", 128);
    device
        .one_time_command_submit(QueueType::Graphics, |cmd| {
            cmd.texture_barrier(&bloom, ResourceState::None, ResourceState::TransferSrc);
            cmd.texture_barrier(&offset, ResourceState::None, ResourceState::TransferSrc);
            cmd.copy_texture_to_buffer(&bloom, 0, &readback, 0);
            cmd.copy_texture_to_buffer(&offset, 0, &readback, 64);
        })
        .unwrap();

    let bytes = readback.read_to_vec().unwrap();
    assert!(bytes[..64].iter().all(|&b| b == 0x5A), "bloom aliases gbuffer");
    assert!(bytes[64..].iter().all(|&b| b == 0), "offset placement is disjoint");
}

#[test]
fn placement_past_the_end_fails() {
    let device = device();
    let memory = device.create_aliased_memory("small", 4096).unwrap();
    let result = device.create_placed_texture(
        &TextureDesc {
            name: "too_big",
            extent: Extent3d::new_2d(64, 64),
            format: Format::Rgba8Unorm,
            usage: TextureUsage::SAMPLED,
            mip_levels: 1,
            initial_state: ResourceState::None,
        },
        &memory,
        1024,
    );
    assert!(result.is_err());
}

#[test]
fn backbuffer_clear_is_visible_after_copy() {
    let device = device();
    let extent = Extent3d::new_2d(8, 8);
    let image = device
        .raw()
        .create_backbuffer_image("swapchain_0", extent, Format::Bgra8Unorm);
    let backbuffer = device
        .wrap_backbuffer("backbuffer_0", image, extent, Format::Bgra8Unorm)
        .unwrap();
    assert_eq!(backbuffer.origin(), TextureOrigin::Backbuffer);
    assert!(backbuffer.usage().contains(TextureUsage::COLOR_ATTACHMENT));

    let depth = device
        .create_texture(&TextureDesc {
            name: "depth",
            extent,
            format: Format::D32Float,
            usage: TextureUsage::DEPTH_ATTACHMENT | TextureUsage::TRANSFER_SRC,
            mip_levels: 1,
            initial_state: ResourceState::DepthAttachment,
        })
        .unwrap();

    let size = backbuffer.mip_size(0);
    let readback = readback_buffer(&device, "screenshot", size * 2);
    device
        .one_time_command_submit(QueueType::Graphics, |cmd| {
            cmd.texture_barrier(&backbuffer, ResourceState::None, ResourceState::ColorAttachment);
            cmd.begin_render_pass(
                &[ColorTarget {
                    texture: &backbuffer,
                    load: LoadOp::Clear,
                    clear: [1.0, 0.0, 0.0, 1.0],
                }],
                Some(DepthTarget {
                    texture: &depth,
                    load: LoadOp::Clear,
                    clear_depth: 1.0,
                }),
            );
            cmd.set_viewport(0.0, 0.0, 8.0, 8.0);
            cmd.set_scissor(0, 0, 8, 8);
            cmd.end_render_pass();
            cmd.texture_barrier(&backbuffer, ResourceState::ColorAttachment, ResourceState::TransferSrc);
            cmd.texture_barrier(&depth, ResourceState::DepthAttachment, ResourceState::TransferSrc);
            cmd.copy_texture_to_buffer(&backbuffer, 0, &readback, 0);
            cmd.copy_texture_to_buffer(&depth, 0, &readback, size);
        })
        .unwrap();

    let bytes = readback.read_to_vec().unwrap();
    let (color, depth) = bytes.split_at(size as usize);
    assert!(color.chunks_exact(4).all(|texel| texel == [0, 0, 255, 255]));
    assert!(depth.chunks_exact(4).all(|texel| texel == 1.0f32.to_le_bytes()));
}

#[test]
fn command_pool_recycles_across_frames() {
    let device = device();
    let mut pool = CommandPool::new(&device, "frame");
    let mut fence = Fence::new(&device, "frame_fence").unwrap();

    for frame in 0..4 {
        for _ in 0..3 {
            let cmd = pool.get_command_buffer(QueueType::Graphics).unwrap();
            cmd.begin().unwrap();
            cmd.end().unwrap();
        }
        let last = pool.get_command_buffer(QueueType::Compute).unwrap();
        last.begin().unwrap();
        last.end().unwrap();
        last.submit(Some(&fence), None, None).unwrap();
        assert!(fence.is_signaled().unwrap(), "frame {}", frame);

        assert_eq!(pool.in_use(QueueType::Graphics), 3);
        pool.reset().unwrap();
        fence.reset();
    }
    assert_eq!(pool.len(QueueType::Graphics), 3);
    assert_eq!(pool.len(QueueType::Compute), 1);
    assert_eq!(pool.len(QueueType::Transfer), 0);
    assert_eq!(device.raw().stats().submissions, 4);
}

#[test]
#[should_panic(expected = "zero size")]
fn zero_sized_buffers_are_rejected() {
    let device = device();
    let _ = device.create_buffer(&BufferDesc {
        name: "empty",
        size: 0,
        usage: BufferUsage::STORAGE_BUFFER,
        residency: MemoryResidency::GpuOnly,
    });
}

#[test]
fn host_visible_buffers_round_trip_pod_data() {
    let device = device();
    let buffer = device
        .create_buffer(&BufferDesc {
            name: "instances",
            size: 64,
            usage: BufferUsage::STORAGE_BUFFER,
            residency: MemoryResidency::CpuToGpu,
        })
        .unwrap();
    assert!(buffer.device_address().is_some());

    buffer.write_pod(16, &[1.5f32, -2.0, 4.25]).unwrap();
    let mut floats = [0f32; 3];
    buffer.read(16, bytemuck::cast_slice_mut(&mut floats)).unwrap();
    assert_eq!(floats, [1.5, -2.0, 4.25]);
}

fn storage_layout(device: &TestDevice) -> BindingLayout<HeadlessDevice> {
    device
        .create_binding_layout(
            "storage",
            &[DescriptorBinding {
                binding: 0,
                category: DescriptorCategory::Storage,
                count: 1,
                stages: ShaderStages::COMPUTE,
            }],
        )
        .unwrap()
}

fn compute_pipeline(device: &TestDevice, layout: &BindingLayout<HeadlessDevice>) -> Pipeline<HeadlessDevice> {
    device
        .create_pipeline(
            "cull",
            &[layout, layout],
            0,
            PipelineKind::Compute(ShaderBinary {
                stage: ShaderStages::COMPUTE,
                code: &[0x03, 0x02, 0x23, 0x07],
                entry_point: "main",
            }),
        )
        .unwrap()
}

#[test]
#[cfg(debug_assertions)]
#[should_panic(expected = "must share a pool")]
fn sets_from_different_pools_cannot_be_bound_together() {
    let device = device();
    let config = common::config();
    let layout = storage_layout(&device);
    let pipeline = compute_pipeline(&device, &layout);
    let buffer = readback_buffer(&device, "visible", 64);

    let mut sets = Vec::new();
    for name in ["frame_0", "frame_1"] {
        let mut pool = DescriptorPool::new(&device, name, &config.descriptors).unwrap();
        let mut set = pool.allocate_set(&layout).unwrap();
        set.write(0, 0, DescriptorWrite::Buffer(&buffer));
        set.mark_updated();
        sets.push((pool, set));
    }

    let _ = device.one_time_command_submit(QueueType::Compute, |cmd| {
        cmd.bind_pipeline(&pipeline);
        cmd.bind_descriptor_sets(&pipeline, 0, &[&sets[0].1, &sets[1].1]);
    });
}

#[test]
#[cfg(debug_assertions)]
#[should_panic(expected = "not marked updated")]
fn unwritten_set_cannot_be_bound() {
    let device = device();
    let layout = storage_layout(&device);
    let pipeline = compute_pipeline(&device, &layout);
    let mut pool = DescriptorPool::new(&device, "stale", &common::config().descriptors).unwrap();
    let set = pool.allocate_set(&layout).unwrap();

    let _ = device.one_time_command_submit(QueueType::Compute, |cmd| {
        cmd.bind_pipeline(&pipeline);
        cmd.bind_descriptor_sets(&pipeline, 0, &[&set]);
    });
}
