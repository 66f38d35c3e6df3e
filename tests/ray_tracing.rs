mod common;

use glam::{Affine3A, Vec3};
use my_rhi::backend::{HitGroup, PipelineKind, RayTracingPipelineDesc, ShaderBinary};
use my_rhi::{
    Blas, Buffer, BufferUsage, DescriptorBinding, DescriptorCategory, DescriptorPool,
    DescriptorWrite, Format, GeometryFlags, HeadlessDevice, IndexData, IndexType, InstanceFlags,
    PipelineType, QueueType, ShaderBindingTable, ShaderStages, StagingManager, Tlas, TlasInstance,
    TriangleGeometryDesc,
};

use common::{device, read_gpu_buffer, TestDevice};

/// Two 32-bit words; the headless backend only checks shape
const SHADER_CODE: &[u8] = &[0x03, 0x02, 0x23, 0x07, 0x00, 0x00, 0x01, 0x00];

fn shader(stage: ShaderStages) -> ShaderBinary<'static> {
    ShaderBinary {
        stage,
        code: SHADER_CODE,
        entry_point: "main",
    }
}

fn triangle_buffers(device: &TestDevice) -> (Buffer<HeadlessDevice>, Buffer<HeadlessDevice>) {
    let positions: [[f32; 3]; 3] = [[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]];
    let vertices = device
        .create_buffer_with_data(
            "triangle_vertices",
            BufferUsage::VERTEX_BUFFER | BufferUsage::ACCEL_STRUCTURE_INPUT,
            bytemuck::cast_slice(&positions),
        )
        .unwrap();
    let indices = device
        .create_buffer_with_data(
            "triangle_indices",
            BufferUsage::INDEX_BUFFER | BufferUsage::ACCEL_STRUCTURE_INPUT,
            bytemuck::cast_slice(&[0u32, 1, 2]),
        )
        .unwrap();
    (vertices, indices)
}

fn triangle<'a>(
    vertices: &'a Buffer<HeadlessDevice>,
    indices: &'a Buffer<HeadlessDevice>,
) -> TriangleGeometryDesc<'a, HeadlessDevice> {
    TriangleGeometryDesc {
        vertex_buffer: vertices,
        vertex_offset: 0,
        vertex_stride: 12,
        vertex_count: 3,
        vertex_format: Format::Rgb32Float,
        indices: Some(IndexData {
            buffer: indices,
            offset: 0,
            index_type: IndexType::U32,
            count: 3,
        }),
        flags: GeometryFlags::OPAQUE,
    }
}

fn instance(blas: &Blas<HeadlessDevice>, transform: Affine3A) -> TlasInstance<'_, HeadlessDevice> {
    TlasInstance {
        blas,
        transform,
        instance_id: 0,
        mask: 0xFF,
        hit_group_offset: 0,
        flags: InstanceFlags::TRIANGLE_CULL_DISABLE,
    }
}

fn u32_at(bytes: &[u8], at: usize) -> u32 {
    u32::from_le_bytes(bytes[at..at + 4].try_into().unwrap())
}

fn f32_at(bytes: &[u8], at: usize) -> f32 {
    f32::from_le_bytes(bytes[at..at + 4].try_into().unwrap())
}

#[test]
fn single_triangle_scene_traces() {
    let device = device();
    let config = common::config();
    let mut staging = StagingManager::new(&device, &config.staging).unwrap();

    let (vertices, indices) = triangle_buffers(&device);
    let blas = Blas::build(&mut staging, "triangle_blas", &[triangle(&vertices, &indices)], false).unwrap();
    let tlas = Tlas::build(
        &mut staging,
        "scene_tlas",
        &[instance(&blas, Affine3A::IDENTITY)],
        false,
    )
    .unwrap();
    staging.submit_all_pending_upload().unwrap();

    assert_eq!(tlas.instance_count(), 1);
    assert_ne!(tlas.device_address(), 0);
    assert!(tlas.buffer().size() > 0);
    let header = read_gpu_buffer(&device, tlas.buffer());
    assert_eq!(&header[..4], b"HLAS");
    assert_eq!(u32_at(&header, 8), 1, "primitive count");
    assert_eq!(u32_at(&header, 12), 1, "instance count");

    let layout = device
        .create_binding_layout(
            "scene_layout",
            &[DescriptorBinding {
                binding: 0,
                category: DescriptorCategory::AccelerationStructure,
                count: 1,
                stages: ShaderStages::RAYGEN | ShaderStages::CLOSEST_HIT,
            }],
        )
        .unwrap();
    let miss = [shader(ShaderStages::MISS)];
    let hit_groups = [HitGroup {
        closest_hit: Some(shader(ShaderStages::CLOSEST_HIT)),
        any_hit: None,
    }];
    let pipeline = device
        .create_pipeline(
            "primary_rays",
            &[&layout],
            0,
            PipelineKind::RayTracing(RayTracingPipelineDesc {
                raygen: shader(ShaderStages::RAYGEN),
                miss: &miss,
                hit_groups: &hit_groups,
                max_recursion_depth: 1,
            }),
        )
        .unwrap();
    assert_eq!(
        pipeline.pipeline_type(),
        PipelineType::RayTracing {
            miss_count: 1,
            hit_count: 1
        }
    );
    let sbt = ShaderBindingTable::new(&device, &pipeline).unwrap();

    let mut pool = DescriptorPool::new(&device, "scene_sets", &config.descriptors).unwrap();
    let mut set = pool.allocate_set(&layout).unwrap();
    set.write(0, 0, DescriptorWrite::AccelerationStructure(&tlas));
    set.mark_updated();

    device
        .one_time_command_submit(QueueType::Graphics, |cmd| {
            cmd.bind_pipeline(&pipeline);
            cmd.bind_descriptor_sets(&pipeline, 0, &[&set]);
            cmd.trace_rays(&sbt, 16, 8, 1);
        })
        .unwrap();

    let stats = device.raw().stats();
    assert_eq!(stats.trace_rays, 1);
    assert_eq!(stats.rays, 16 * 8);
    assert_eq!(stats.accel_builds, 2);
}

#[test]
fn binding_table_regions_are_aligned() {
    let device = device();
    let miss = [shader(ShaderStages::MISS), shader(ShaderStages::MISS)];
    let hit_groups = [
        HitGroup {
            closest_hit: Some(shader(ShaderStages::CLOSEST_HIT)),
            any_hit: None,
        },
        HitGroup {
            closest_hit: None,
            any_hit: Some(shader(ShaderStages::ANY_HIT)),
        },
        HitGroup {
            closest_hit: Some(shader(ShaderStages::CLOSEST_HIT)),
            any_hit: Some(shader(ShaderStages::ANY_HIT)),
        },
    ];
    let pipeline = device
        .create_pipeline(
            "many_groups",
            &[],
            0,
            PipelineKind::RayTracing(RayTracingPipelineDesc {
                raygen: shader(ShaderStages::RAYGEN),
                miss: &miss,
                hit_groups: &hit_groups,
                max_recursion_depth: 2,
            }),
        )
        .unwrap();
    let sbt = ShaderBindingTable::new(&device, &pipeline).unwrap();

    let base = sbt.buffer().device_address().unwrap() + sbt.regions().raygen.offset;
    assert_eq!(base % 64, 0);
    for region in [sbt.regions().raygen, sbt.regions().miss, sbt.regions().hit] {
        assert_eq!(region.offset % 64, sbt.regions().raygen.offset % 64);
        assert!(region.stride >= 32);
    }
    assert!(sbt.regions().miss.size >= 2 * sbt.regions().miss.stride);
    assert!(sbt.regions().hit.size >= 3 * sbt.regions().hit.stride);
    assert!(sbt.regions().hit.offset >= sbt.regions().miss.offset + sbt.regions().miss.size);
}

#[test]
fn empty_hit_group_is_rejected() {
    let device = device();
    let hit_groups = [HitGroup {
        closest_hit: None,
        any_hit: None,
    }];
    let result = device.create_pipeline(
        "broken",
        &[],
        0,
        PipelineKind::RayTracing(RayTracingPipelineDesc {
            raygen: shader(ShaderStages::RAYGEN),
            miss: &[],
            hit_groups: &hit_groups,
            max_recursion_depth: 1,
        }),
    );
    assert!(result.is_err());
}

#[test]
fn tracing_before_the_build_is_submitted_fails() {
    let device = device();
    let config = common::config();
    let mut staging = StagingManager::new(&device, &config.staging).unwrap();

    let (vertices, indices) = triangle_buffers(&device);
    let blas = Blas::build(&mut staging, "pending_blas", &[triangle(&vertices, &indices)], false).unwrap();
    let tlas = Tlas::build(&mut staging, "pending_tlas", &[instance(&blas, Affine3A::IDENTITY)], false).unwrap();

    let layout = device
        .create_binding_layout(
            "pending_layout",
            &[DescriptorBinding {
                binding: 0,
                category: DescriptorCategory::AccelerationStructure,
                count: 1,
                stages: ShaderStages::RAYGEN,
            }],
        )
        .unwrap();
    let pipeline = device
        .create_pipeline(
            "pending_rays",
            &[&layout],
            0,
            PipelineKind::RayTracing(RayTracingPipelineDesc {
                raygen: shader(ShaderStages::RAYGEN),
                miss: &[],
                hit_groups: &[],
                max_recursion_depth: 1,
            }),
        )
        .unwrap();
    let sbt = ShaderBindingTable::new(&device, &pipeline).unwrap();
    let mut pool = DescriptorPool::new(&device, "pending_sets", &config.descriptors).unwrap();
    let mut set = pool.allocate_set(&layout).unwrap();
    set.write(0, 0, DescriptorWrite::AccelerationStructure(&tlas));
    set.mark_updated();

    let result = device.one_time_command_submit(QueueType::Graphics, |cmd| {
        cmd.bind_pipeline(&pipeline);
        cmd.bind_descriptor_sets(&pipeline, 0, &[&set]);
        cmd.trace_rays(&sbt, 1, 1, 1);
    });
    assert!(result.is_err());
    assert_eq!(device.raw().stats().trace_rays, 0);
}

#[test]
fn blas_refit_follows_moved_vertices() {
    let device = device();
    let mut staging = StagingManager::new(&device, &common::config().staging).unwrap();

    let (vertices, indices) = triangle_buffers(&device);
    let blas = Blas::build(&mut staging, "dynamic_blas", &[triangle(&vertices, &indices)], true).unwrap();
    staging.submit_all_pending_upload().unwrap();
    assert!(blas.sizes().update_scratch_size > 0);

    let header = read_gpu_buffer(&device, blas.buffer());
    // bounds_max.x sits after magic, level, two counts and bounds_min
    assert_eq!(f32_at(&header, 28), 1.0);

    vertices.write_pod(12, &[5.0f32, 0.0, 0.0]).unwrap();
    blas.update(&mut staging, &[triangle(&vertices, &indices)]).unwrap();
    staging.submit_all_pending_upload().unwrap();

    let header = read_gpu_buffer(&device, blas.buffer());
    assert_eq!(f32_at(&header, 28), 5.0);
    assert_eq!(device.raw().stats().accel_builds, 2);
}

#[test]
fn tlas_update_moves_instance_bounds() {
    let device = device();
    let mut staging = StagingManager::new(&device, &common::config().staging).unwrap();

    let (vertices, indices) = triangle_buffers(&device);
    let blas = Blas::build(&mut staging, "static_blas", &[triangle(&vertices, &indices)], false).unwrap();
    let tlas = Tlas::build(&mut staging, "moving_tlas", &[instance(&blas, Affine3A::IDENTITY)], true).unwrap();
    staging.submit_all_pending_upload().unwrap();

    let moved = Affine3A::from_translation(Vec3::new(10.0, 0.0, 0.0));
    tlas.update(&mut staging, &[instance(&blas, moved)]).unwrap();
    staging.submit_all_pending_upload().unwrap();

    let header = read_gpu_buffer(&device, tlas.buffer());
    assert_eq!(f32_at(&header, 16), 10.0, "bounds_min.x");
    assert_eq!(f32_at(&header, 28), 11.0, "bounds_max.x");
}

#[test]
fn each_refit_in_a_batch_borrows_its_own_scratch() {
    let device = device();
    let mut staging = StagingManager::new(&device, &common::config().staging).unwrap();

    let (vertices, indices) = triangle_buffers(&device);
    let blas = Blas::build(&mut staging, "animated_blas", &[triangle(&vertices, &indices)], true).unwrap();
    assert_eq!(staging.scratch_pool_len(), 1);
    staging.submit_all_pending_upload().unwrap();

    blas.update(&mut staging, &[triangle(&vertices, &indices)]).unwrap();
    blas.update(&mut staging, &[triangle(&vertices, &indices)]).unwrap();
    assert_eq!(staging.scratch_pool_len(), 2);
    assert_eq!(staging.available_scratch(), 0);

    staging.submit_all_pending_upload().unwrap();
    assert_eq!(device.raw().stats().accel_builds, 3);
}
