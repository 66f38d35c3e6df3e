// Portable -> Vulkan translation tables
//
// Every table lists each portable value exactly once. Bit-flag sets map
// flag by flag and are OR-ed together.

use ash::vk;
use gpu_allocator::MemoryLocation;

use crate::types::{
    AddressMode, BufferUsage, CullMode, DescriptorCategory, Filter, Format, GeometryFlags,
    IndexType, InstanceFlags, LoadOp, MemoryResidency, PrimitiveTopology,
    ResourceState, ShaderStages, TextureUsage,
};

pub const BUFFER_USAGE: [(BufferUsage, vk::BufferUsageFlags); 10] = [
    (BufferUsage::VERTEX_BUFFER, vk::BufferUsageFlags::VERTEX_BUFFER),
    (BufferUsage::INDEX_BUFFER, vk::BufferUsageFlags::INDEX_BUFFER),
    (BufferUsage::CONSTANT_BUFFER, vk::BufferUsageFlags::UNIFORM_BUFFER),
    (BufferUsage::STORAGE_BUFFER, vk::BufferUsageFlags::STORAGE_BUFFER),
    (BufferUsage::TRANSFER_SRC, vk::BufferUsageFlags::TRANSFER_SRC),
    (BufferUsage::TRANSFER_DST, vk::BufferUsageFlags::TRANSFER_DST),
    (
        BufferUsage::ACCEL_STRUCTURE_INPUT,
        vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR,
    ),
    (
        BufferUsage::ACCEL_STRUCTURE_STORAGE,
        vk::BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR,
    ),
    (BufferUsage::INDIRECT_BUFFER, vk::BufferUsageFlags::INDIRECT_BUFFER),
    (
        BufferUsage::SHADER_BINDING_TABLE,
        vk::BufferUsageFlags::SHADER_BINDING_TABLE_KHR,
    ),
];

pub const TEXTURE_USAGE: [(TextureUsage, vk::ImageUsageFlags); 6] = [
    (TextureUsage::SAMPLED, vk::ImageUsageFlags::SAMPLED),
    (TextureUsage::STORAGE, vk::ImageUsageFlags::STORAGE),
    (TextureUsage::COLOR_ATTACHMENT, vk::ImageUsageFlags::COLOR_ATTACHMENT),
    (TextureUsage::DEPTH_ATTACHMENT, vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT),
    (TextureUsage::TRANSFER_SRC, vk::ImageUsageFlags::TRANSFER_SRC),
    (TextureUsage::TRANSFER_DST, vk::ImageUsageFlags::TRANSFER_DST),
];

pub const FORMATS: [(Format, vk::Format); 19] = [
    (Format::R8Unorm, vk::Format::R8_UNORM),
    (Format::Rg8Unorm, vk::Format::R8G8_UNORM),
    (Format::Rgba8Unorm, vk::Format::R8G8B8A8_UNORM),
    (Format::Rgba8Srgb, vk::Format::R8G8B8A8_SRGB),
    (Format::Bgra8Unorm, vk::Format::B8G8R8A8_UNORM),
    (Format::Bgra8Srgb, vk::Format::B8G8R8A8_SRGB),
    (Format::R16Float, vk::Format::R16_SFLOAT),
    (Format::Rg16Float, vk::Format::R16G16_SFLOAT),
    (Format::Rgba16Float, vk::Format::R16G16B16A16_SFLOAT),
    (Format::R32Uint, vk::Format::R32_UINT),
    (Format::R32Float, vk::Format::R32_SFLOAT),
    (Format::Rg32Float, vk::Format::R32G32_SFLOAT),
    (Format::Rgb32Float, vk::Format::R32G32B32_SFLOAT),
    (Format::Rgba32Float, vk::Format::R32G32B32A32_SFLOAT),
    (Format::Rgb10a2Unorm, vk::Format::A2B10G10R10_UNORM_PACK32),
    (Format::Rg11b10Float, vk::Format::B10G11R11_UFLOAT_PACK32),
    (Format::D32Float, vk::Format::D32_SFLOAT),
    (Format::D24UnormS8Uint, vk::Format::D24_UNORM_S8_UINT),
    (Format::D32FloatS8Uint, vk::Format::D32_SFLOAT_S8_UINT),
];

pub const RESIDENCY: [(MemoryResidency, MemoryLocation); 4] = [
    // No host-only heap in gpu-allocator; host-visible upload memory is closest
    (MemoryResidency::CpuOnly, MemoryLocation::CpuToGpu),
    (MemoryResidency::GpuOnly, MemoryLocation::GpuOnly),
    (MemoryResidency::GpuToCpu, MemoryLocation::GpuToCpu),
    (MemoryResidency::CpuToGpu, MemoryLocation::CpuToGpu),
];

/// Layout plus the access/stage scope a texture has while in a state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateInfo {
    pub layout: vk::ImageLayout,
    pub access: vk::AccessFlags,
    pub stages: vk::PipelineStageFlags,
}

const fn state(
    layout: vk::ImageLayout,
    access: vk::AccessFlags,
    stages: vk::PipelineStageFlags,
) -> StateInfo {
    StateInfo {
        layout,
        access,
        stages,
    }
}

pub const STATES: [(ResourceState, StateInfo); 8] = [
    (
        ResourceState::None,
        state(
            vk::ImageLayout::UNDEFINED,
            vk::AccessFlags::empty(),
            vk::PipelineStageFlags::TOP_OF_PIPE,
        ),
    ),
    (
        ResourceState::ColorAttachment,
        state(
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            vk::AccessFlags::from_raw(
                vk::AccessFlags::COLOR_ATTACHMENT_READ.as_raw()
                    | vk::AccessFlags::COLOR_ATTACHMENT_WRITE.as_raw(),
            ),
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
        ),
    ),
    (
        ResourceState::DepthAttachment,
        state(
            vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
            vk::AccessFlags::from_raw(
                vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ.as_raw()
                    | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE.as_raw(),
            ),
            vk::PipelineStageFlags::from_raw(
                vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS.as_raw()
                    | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS.as_raw(),
            ),
        ),
    ),
    (
        ResourceState::ReadOnly,
        state(
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            vk::AccessFlags::SHADER_READ,
            vk::PipelineStageFlags::ALL_COMMANDS,
        ),
    ),
    (
        ResourceState::ReadWrite,
        state(
            vk::ImageLayout::GENERAL,
            vk::AccessFlags::from_raw(
                vk::AccessFlags::SHADER_READ.as_raw() | vk::AccessFlags::SHADER_WRITE.as_raw(),
            ),
            vk::PipelineStageFlags::ALL_COMMANDS,
        ),
    ),
    (
        ResourceState::Present,
        state(
            vk::ImageLayout::PRESENT_SRC_KHR,
            vk::AccessFlags::empty(),
            vk::PipelineStageFlags::BOTTOM_OF_PIPE,
        ),
    ),
    (
        ResourceState::TransferSrc,
        state(
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            vk::AccessFlags::TRANSFER_READ,
            vk::PipelineStageFlags::TRANSFER,
        ),
    ),
    (
        ResourceState::TransferDst,
        state(
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::AccessFlags::TRANSFER_WRITE,
            vk::PipelineStageFlags::TRANSFER,
        ),
    ),
];

pub const DESCRIPTOR_TYPES: [(DescriptorCategory, vk::DescriptorType); 5] = [
    (DescriptorCategory::Uniform, vk::DescriptorType::UNIFORM_BUFFER),
    (DescriptorCategory::Storage, vk::DescriptorType::STORAGE_BUFFER),
    (DescriptorCategory::Sampler, vk::DescriptorType::SAMPLER),
    (
        DescriptorCategory::AccelerationStructure,
        vk::DescriptorType::ACCELERATION_STRUCTURE_KHR,
    ),
    (DescriptorCategory::Image, vk::DescriptorType::SAMPLED_IMAGE),
];

pub const SHADER_STAGES: [(ShaderStages, vk::ShaderStageFlags); 9] = [
    (ShaderStages::VERTEX, vk::ShaderStageFlags::VERTEX),
    (ShaderStages::FRAGMENT, vk::ShaderStageFlags::FRAGMENT),
    (ShaderStages::COMPUTE, vk::ShaderStageFlags::COMPUTE),
    (ShaderStages::RAYGEN, vk::ShaderStageFlags::RAYGEN_KHR),
    (ShaderStages::MISS, vk::ShaderStageFlags::MISS_KHR),
    (ShaderStages::CLOSEST_HIT, vk::ShaderStageFlags::CLOSEST_HIT_KHR),
    (ShaderStages::ANY_HIT, vk::ShaderStageFlags::ANY_HIT_KHR),
    (ShaderStages::MESH, vk::ShaderStageFlags::MESH_EXT),
    (ShaderStages::TASK, vk::ShaderStageFlags::TASK_EXT),
];

pub fn buffer_usage(usage: BufferUsage) -> vk::BufferUsageFlags {
    BUFFER_USAGE
        .iter()
        .filter(|(portable, _)| usage.contains(*portable))
        .fold(vk::BufferUsageFlags::empty(), |acc, (_, native)| acc | *native)
}

pub fn texture_usage(usage: TextureUsage) -> vk::ImageUsageFlags {
    TEXTURE_USAGE
        .iter()
        .filter(|(portable, _)| usage.contains(*portable))
        .fold(vk::ImageUsageFlags::empty(), |acc, (_, native)| acc | *native)
}

pub fn shader_stages(stages: ShaderStages) -> vk::ShaderStageFlags {
    SHADER_STAGES
        .iter()
        .filter(|(portable, _)| stages.contains(*portable))
        .fold(vk::ShaderStageFlags::empty(), |acc, (_, native)| acc | *native)
}

pub fn format(format: Format) -> vk::Format {
    FORMATS
        .iter()
        .find(|(portable, _)| *portable == format)
        .map_or(vk::Format::UNDEFINED, |(_, native)| *native)
}

pub fn format_from_vk(native: vk::Format) -> Option<Format> {
    FORMATS
        .iter()
        .find(|(_, n)| *n == native)
        .map(|(portable, _)| *portable)
}

pub fn memory_location(residency: MemoryResidency) -> MemoryLocation {
    RESIDENCY
        .iter()
        .find(|(portable, _)| *portable == residency)
        .map_or(MemoryLocation::Unknown, |(_, native)| *native)
}

pub fn state_info(resource_state: ResourceState) -> StateInfo {
    STATES
        .iter()
        .find(|(portable, _)| *portable == resource_state)
        .map(|(_, info)| *info)
        .unwrap_or(StateInfo {
            layout: vk::ImageLayout::UNDEFINED,
            access: vk::AccessFlags::empty(),
            stages: vk::PipelineStageFlags::ALL_COMMANDS,
        })
}

pub fn descriptor_type(category: DescriptorCategory) -> vk::DescriptorType {
    DESCRIPTOR_TYPES
        .iter()
        .find(|(portable, _)| *portable == category)
        .map_or(vk::DescriptorType::UNIFORM_BUFFER, |(_, native)| *native)
}

pub fn aspect_mask(format: Format) -> vk::ImageAspectFlags {
    match (format.is_depth(), format.has_stencil()) {
        (true, true) => vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL,
        (true, false) => vk::ImageAspectFlags::DEPTH,
        _ => vk::ImageAspectFlags::COLOR,
    }
}

pub fn index_type(ty: IndexType) -> vk::IndexType {
    match ty {
        IndexType::U16 => vk::IndexType::UINT16,
        IndexType::U32 => vk::IndexType::UINT32,
    }
}

pub fn load_op(op: LoadOp) -> vk::AttachmentLoadOp {
    match op {
        LoadOp::Load => vk::AttachmentLoadOp::LOAD,
        LoadOp::Clear => vk::AttachmentLoadOp::CLEAR,
        LoadOp::DontCare => vk::AttachmentLoadOp::DONT_CARE,
    }
}

pub fn filter(filter: Filter) -> (vk::Filter, vk::SamplerMipmapMode) {
    match filter {
        Filter::Nearest => (vk::Filter::NEAREST, vk::SamplerMipmapMode::NEAREST),
        Filter::Linear => (vk::Filter::LINEAR, vk::SamplerMipmapMode::LINEAR),
    }
}

pub fn address_mode(mode: AddressMode) -> vk::SamplerAddressMode {
    match mode {
        AddressMode::Repeat => vk::SamplerAddressMode::REPEAT,
        AddressMode::MirroredRepeat => vk::SamplerAddressMode::MIRRORED_REPEAT,
        AddressMode::ClampToEdge => vk::SamplerAddressMode::CLAMP_TO_EDGE,
    }
}

pub fn topology(topology: PrimitiveTopology) -> vk::PrimitiveTopology {
    match topology {
        PrimitiveTopology::TriangleList => vk::PrimitiveTopology::TRIANGLE_LIST,
        PrimitiveTopology::TriangleStrip => vk::PrimitiveTopology::TRIANGLE_STRIP,
        PrimitiveTopology::LineList => vk::PrimitiveTopology::LINE_LIST,
        PrimitiveTopology::PointList => vk::PrimitiveTopology::POINT_LIST,
    }
}

pub fn cull_mode(mode: CullMode) -> vk::CullModeFlags {
    match mode {
        CullMode::None => vk::CullModeFlags::NONE,
        CullMode::Front => vk::CullModeFlags::FRONT,
        CullMode::Back => vk::CullModeFlags::BACK,
    }
}

pub fn geometry_flags(flags: GeometryFlags) -> vk::GeometryFlagsKHR {
    let mut native = vk::GeometryFlagsKHR::empty();
    if flags.contains(GeometryFlags::OPAQUE) {
        native |= vk::GeometryFlagsKHR::OPAQUE;
    }
    if flags.contains(GeometryFlags::NO_DUPLICATE_ANY_HIT) {
        native |= vk::GeometryFlagsKHR::NO_DUPLICATE_ANY_HIT_INVOCATION;
    }
    native
}

pub fn instance_flags(flags: InstanceFlags) -> vk::GeometryInstanceFlagsKHR {
    let mut native = vk::GeometryInstanceFlagsKHR::empty();
    if flags.contains(InstanceFlags::TRIANGLE_CULL_DISABLE) {
        native |= vk::GeometryInstanceFlagsKHR::TRIANGLE_FACING_CULL_DISABLE;
    }
    if flags.contains(InstanceFlags::TRIANGLE_FRONT_COUNTERCLOCKWISE) {
        native |= vk::GeometryInstanceFlagsKHR::TRIANGLE_FLIP_FACING;
    }
    if flags.contains(InstanceFlags::FORCE_OPAQUE) {
        native |= vk::GeometryInstanceFlagsKHR::FORCE_OPAQUE;
    }
    if flags.contains(InstanceFlags::FORCE_NO_OPAQUE) {
        native |= vk::GeometryInstanceFlagsKHR::FORCE_NO_OPAQUE;
    }
    native
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn buffer_usage_is_or_of_single_flags() {
        let bits = BufferUsage::all().bits();
        // Every subset of the defined flags
        let mut subset = bits;
        loop {
            let usage = BufferUsage::from_bits_truncate(subset);
            let expected = usage
                .iter()
                .map(buffer_usage)
                .fold(vk::BufferUsageFlags::empty(), |acc, f| acc | f);
            let native = buffer_usage(usage);
            assert_eq!(native, expected, "{:?}", usage);

            for (portable, mapped) in BUFFER_USAGE {
                assert_eq!(
                    usage.contains(portable),
                    native.contains(mapped),
                    "{:?} in {:?}",
                    portable,
                    usage
                );
            }

            if subset == 0 {
                break;
            }
            subset = (subset - 1) & bits;
        }
    }

    #[test]
    fn every_buffer_flag_has_one_entry() {
        for flag in BufferUsage::all().iter() {
            let entries = BUFFER_USAGE.iter().filter(|(p, _)| *p == flag).count();
            assert_eq!(entries, 1, "{:?}", flag);
        }
        let natives: HashSet<_> = BUFFER_USAGE.iter().map(|(_, n)| n.as_raw()).collect();
        assert_eq!(natives.len(), BUFFER_USAGE.len());
    }

    #[test]
    fn texture_usage_is_or_of_single_flags() {
        for subset in 0..=TextureUsage::all().bits() {
            let usage = TextureUsage::from_bits_truncate(subset);
            let native = texture_usage(usage);
            for (portable, mapped) in TEXTURE_USAGE {
                assert_eq!(usage.contains(portable), native.contains(mapped));
            }
        }
    }

    #[test]
    fn format_round_trips_without_collisions() {
        let mut seen = HashSet::new();
        for f in Format::ALL {
            let entries = FORMATS.iter().filter(|(p, _)| *p == f).count();
            assert_eq!(entries, 1, "{:?}", f);

            let native = format(f);
            assert_ne!(native, vk::Format::UNDEFINED, "{:?}", f);
            assert!(seen.insert(native), "{:?} collides", f);
            assert_eq!(format_from_vk(native), Some(f));
        }
        assert_eq!(format_from_vk(vk::Format::UNDEFINED), None);
    }

    #[test]
    fn every_state_has_one_distinct_layout() {
        let mut layouts = HashSet::new();
        for s in ResourceState::ALL {
            let entries = STATES.iter().filter(|(p, _)| *p == s).count();
            assert_eq!(entries, 1, "{:?}", s);
            assert!(layouts.insert(state_info(s).layout), "{:?}", s);
        }
    }

    #[test]
    fn every_residency_and_category_is_mapped() {
        for residency in [
            MemoryResidency::CpuOnly,
            MemoryResidency::GpuOnly,
            MemoryResidency::GpuToCpu,
            MemoryResidency::CpuToGpu,
        ] {
            assert_eq!(RESIDENCY.iter().filter(|(p, _)| *p == residency).count(), 1);
            assert_ne!(memory_location(residency), MemoryLocation::Unknown);
        }
        let mut types = HashSet::new();
        for category in DescriptorCategory::ALL {
            assert_eq!(DESCRIPTOR_TYPES.iter().filter(|(p, _)| *p == category).count(), 1);
            assert!(types.insert(descriptor_type(category)));
        }
    }

    #[test]
    fn shader_stage_groups_expand() {
        let native = shader_stages(ShaderStages::ALL_RAY_TRACING);
        assert!(native.contains(vk::ShaderStageFlags::RAYGEN_KHR));
        assert!(native.contains(vk::ShaderStageFlags::ANY_HIT_KHR));
        assert!(!native.contains(vk::ShaderStageFlags::VERTEX));
    }

    #[test]
    fn depth_stencil_formats_get_both_aspects() {
        assert_eq!(aspect_mask(Format::D32Float), vk::ImageAspectFlags::DEPTH);
        assert!(aspect_mask(Format::D24UnormS8Uint).contains(vk::ImageAspectFlags::STENCIL));
        assert_eq!(aspect_mask(Format::Rgba8Unorm), vk::ImageAspectFlags::COLOR);
    }
}
