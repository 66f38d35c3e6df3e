// Portable resource vocabulary
//
// Everything higher-level code names when it asks for GPU work. Backends
// translate these into their native equivalents (see backend/vulkan/conv.rs).

use bitflags::bitflags;

/// Hardware queue a command buffer is recorded for and submitted on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueType {
    Graphics,
    Compute,
    Transfer,
}

impl QueueType {
    pub const ALL: [QueueType; 3] = [QueueType::Graphics, QueueType::Compute, QueueType::Transfer];

    pub fn index(self) -> usize {
        match self {
            QueueType::Graphics => 0,
            QueueType::Compute => 1,
            QueueType::Transfer => 2,
        }
    }
}

/// Where a buffer's memory lives and who can touch it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryResidency {
    CpuOnly,
    GpuOnly,
    GpuToCpu,
    CpuToGpu,
}

impl MemoryResidency {
    pub fn is_host_visible(self) -> bool {
        !matches!(self, MemoryResidency::GpuOnly)
    }
}

bitflags! {
    /// Buffer usage. Any combination is legal.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BufferUsage: u32 {
        const VERTEX_BUFFER = 1 << 0;
        const INDEX_BUFFER = 1 << 1;
        const CONSTANT_BUFFER = 1 << 2;
        const STORAGE_BUFFER = 1 << 3;
        const TRANSFER_SRC = 1 << 4;
        const TRANSFER_DST = 1 << 5;
        const ACCEL_STRUCTURE_INPUT = 1 << 6;
        const ACCEL_STRUCTURE_STORAGE = 1 << 7;
        const INDIRECT_BUFFER = 1 << 8;
        const SHADER_BINDING_TABLE = 1 << 9;
    }
}

impl BufferUsage {
    /// Usages that are consumed through a raw device address
    pub fn needs_device_address(self) -> bool {
        self.intersects(
            BufferUsage::STORAGE_BUFFER
                | BufferUsage::ACCEL_STRUCTURE_INPUT
                | BufferUsage::ACCEL_STRUCTURE_STORAGE
                | BufferUsage::SHADER_BINDING_TABLE,
        )
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct TextureUsage: u32 {
        const SAMPLED = 1 << 0;
        const STORAGE = 1 << 1;
        const COLOR_ATTACHMENT = 1 << 2;
        const DEPTH_ATTACHMENT = 1 << 3;
        const TRANSFER_SRC = 1 << 4;
        const TRANSFER_DST = 1 << 5;
    }
}

/// Texel formats understood by every backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Format {
    R8Unorm,
    Rg8Unorm,
    Rgba8Unorm,
    Rgba8Srgb,
    Bgra8Unorm,
    Bgra8Srgb,
    R16Float,
    Rg16Float,
    Rgba16Float,
    R32Uint,
    R32Float,
    Rg32Float,
    Rgb32Float,
    Rgba32Float,
    Rgb10a2Unorm,
    Rg11b10Float,
    D32Float,
    D24UnormS8Uint,
    D32FloatS8Uint,
}

impl Format {
    pub const ALL: [Format; 19] = [
        Format::R8Unorm,
        Format::Rg8Unorm,
        Format::Rgba8Unorm,
        Format::Rgba8Srgb,
        Format::Bgra8Unorm,
        Format::Bgra8Srgb,
        Format::R16Float,
        Format::Rg16Float,
        Format::Rgba16Float,
        Format::R32Uint,
        Format::R32Float,
        Format::Rg32Float,
        Format::Rgb32Float,
        Format::Rgba32Float,
        Format::Rgb10a2Unorm,
        Format::Rg11b10Float,
        Format::D32Float,
        Format::D24UnormS8Uint,
        Format::D32FloatS8Uint,
    ];

    /// Bytes per texel in a tightly packed copy
    pub fn texel_size(self) -> u32 {
        match self {
            Format::R8Unorm => 1,
            Format::Rg8Unorm | Format::R16Float => 2,
            Format::Rgba8Unorm
            | Format::Rgba8Srgb
            | Format::Bgra8Unorm
            | Format::Bgra8Srgb
            | Format::Rg16Float
            | Format::R32Uint
            | Format::R32Float
            | Format::Rgb10a2Unorm
            | Format::Rg11b10Float
            | Format::D32Float
            | Format::D24UnormS8Uint => 4,
            Format::Rgba16Float | Format::Rg32Float | Format::D32FloatS8Uint => 8,
            Format::Rgb32Float => 12,
            Format::Rgba32Float => 16,
        }
    }

    pub fn is_depth(self) -> bool {
        matches!(self, Format::D32Float | Format::D24UnormS8Uint | Format::D32FloatS8Uint)
    }

    pub fn has_stencil(self) -> bool {
        matches!(self, Format::D24UnormS8Uint | Format::D32FloatS8Uint)
    }
}

/// Current GPU-visible access mode of a texture.
///
/// Not tracked by the RHI: every transition names both sides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceState {
    None,
    ColorAttachment,
    DepthAttachment,
    ReadOnly,
    ReadWrite,
    Present,
    TransferSrc,
    TransferDst,
}

impl ResourceState {
    pub const ALL: [ResourceState; 8] = [
        ResourceState::None,
        ResourceState::ColorAttachment,
        ResourceState::DepthAttachment,
        ResourceState::ReadOnly,
        ResourceState::ReadWrite,
        ResourceState::Present,
        ResourceState::TransferSrc,
        ResourceState::TransferDst,
    ];
}

/// Descriptor heap categories, one heap each
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DescriptorCategory {
    Uniform,
    Storage,
    Sampler,
    AccelerationStructure,
    Image,
}

impl DescriptorCategory {
    pub const ALL: [DescriptorCategory; 5] = [
        DescriptorCategory::Uniform,
        DescriptorCategory::Storage,
        DescriptorCategory::Sampler,
        DescriptorCategory::AccelerationStructure,
        DescriptorCategory::Image,
    ];

    pub fn index(self) -> usize {
        match self {
            DescriptorCategory::Uniform => 0,
            DescriptorCategory::Storage => 1,
            DescriptorCategory::Sampler => 2,
            DescriptorCategory::AccelerationStructure => 3,
            DescriptorCategory::Image => 4,
        }
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ShaderStages: u32 {
        const VERTEX = 1 << 0;
        const FRAGMENT = 1 << 1;
        const COMPUTE = 1 << 2;
        const RAYGEN = 1 << 3;
        const MISS = 1 << 4;
        const CLOSEST_HIT = 1 << 5;
        const ANY_HIT = 1 << 6;
        const MESH = 1 << 7;
        const TASK = 1 << 8;
        const ALL_GRAPHICS = Self::VERTEX.bits() | Self::FRAGMENT.bits();
        const ALL_RAY_TRACING = Self::RAYGEN.bits()
            | Self::MISS.bits()
            | Self::CLOSEST_HIT.bits()
            | Self::ANY_HIT.bits();
    }
}

bitflags! {
    /// Per-geometry build flags for bottom-level structures
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct GeometryFlags: u32 {
        const OPAQUE = 1 << 0;
        const NO_DUPLICATE_ANY_HIT = 1 << 1;
    }
}

bitflags! {
    /// Per-instance flags for top-level structures
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct InstanceFlags: u32 {
        const TRIANGLE_CULL_DISABLE = 1 << 0;
        const TRIANGLE_FRONT_COUNTERCLOCKWISE = 1 << 1;
        const FORCE_OPAQUE = 1 << 2;
        const FORCE_NO_OPAQUE = 1 << 3;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexType {
    U16,
    U32,
}

impl IndexType {
    pub fn size(self) -> u64 {
        match self {
            IndexType::U16 => 2,
            IndexType::U32 => 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LoadOp {
    Load,
    Clear,
    DontCare,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Filter {
    Nearest,
    Linear,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressMode {
    Repeat,
    MirroredRepeat,
    ClampToEdge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrimitiveTopology {
    TriangleList,
    TriangleStrip,
    LineList,
    PointList,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CullMode {
    None,
    Front,
    Back,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Extent3d {
    pub width: u32,
    pub height: u32,
    pub depth: u32,
}

impl Extent3d {
    pub fn new_2d(width: u32, height: u32) -> Self {
        Self { width, height, depth: 1 }
    }

    pub fn texel_count(&self) -> u64 {
        self.width as u64 * self.height as u64 * self.depth as u64
    }
}

/// Everything needed to create a buffer
#[derive(Debug, Clone)]
pub struct BufferDesc<'a> {
    pub name: &'a str,
    pub size: u64,
    pub usage: BufferUsage,
    pub residency: MemoryResidency,
}

/// Everything needed to create an owned or placed texture
#[derive(Debug, Clone)]
pub struct TextureDesc<'a> {
    pub name: &'a str,
    pub extent: Extent3d,
    pub format: Format,
    pub usage: TextureUsage,
    pub mip_levels: u32,
    /// State the texture is transitioned into right after creation
    pub initial_state: ResourceState,
}

#[derive(Debug, Clone)]
pub struct SamplerDesc<'a> {
    pub name: &'a str,
    pub filter: Filter,
    pub address_mode: AddressMode,
    pub max_anisotropy: Option<f32>,
}

/// One reflected descriptor binding, as produced by the shader compiler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorBinding {
    pub binding: u32,
    pub category: DescriptorCategory,
    pub count: u32,
    pub stages: ShaderStages,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn format_table_lists_every_format_once() {
        let unique: HashSet<_> = Format::ALL.iter().collect();
        assert_eq!(unique.len(), Format::ALL.len());
    }

    #[test]
    fn depth_formats_are_flagged() {
        assert!(Format::D32Float.is_depth());
        assert!(!Format::D32Float.has_stencil());
        assert!(Format::D24UnormS8Uint.has_stencil());
        assert!(!Format::Rgba8Unorm.is_depth());
    }

    #[test]
    fn device_address_usages() {
        assert!(BufferUsage::ACCEL_STRUCTURE_INPUT.needs_device_address());
        assert!(!(BufferUsage::VERTEX_BUFFER | BufferUsage::TRANSFER_DST).needs_device_address());
    }
}
