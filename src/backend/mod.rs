// Backend module - native graphics API abstraction
//
// Design: one capability trait, two implementations chosen at startup
// - VulkanDevice:   command-buffer model (ash + gpu-allocator)
// - HeadlessDevice: host-memory emulation of a command-list model
//
// The portable layer (device.rs, command.rs, staging.rs, ...) owns all
// pooling/recycling/counter logic once and only calls down into these
// native primitives.

pub mod headless;
pub mod vulkan;

pub use headless::HeadlessDevice;
pub use vulkan::VulkanDevice;

use anyhow::Result;
use serde::Deserialize;
use std::fmt;
use std::time::Duration;

use crate::config::Config;
use crate::types::{
    BufferDesc, CullMode, DescriptorBinding, DescriptorCategory, Extent3d, Format, GeometryFlags,
    IndexType, InstanceFlags, LoadOp, PrimitiveTopology, QueueType, ResourceState, SamplerDesc,
    ShaderStages, TextureDesc,
};

/// Which native backend to open, read from config
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Vulkan,
    Headless,
}

/// Queue family indices picked at device creation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueFamilies {
    pub graphics: u32,
    pub compute: u32,
    pub transfer: u32,
}

impl QueueFamilies {
    pub fn family(&self, queue: QueueType) -> u32 {
        match queue {
            QueueType::Graphics => self.graphics,
            QueueType::Compute => self.compute,
            QueueType::Transfer => self.transfer,
        }
    }
}

/// Optional features and adapter facts, fixed for the device lifetime.
///
/// Callers branch on these before touching ray tracing or mesh shading;
/// there is no software fallback.
#[derive(Debug, Clone, Default)]
pub struct Capabilities {
    pub adapter_name: String,
    pub queue_families: QueueFamilies,
    pub ray_tracing: bool,
    pub mesh_shading: bool,
    pub debug_names: bool,
    pub calibrated_timestamps: bool,
    /// Nanoseconds per timestamp tick
    pub timestamp_period: f32,
}

/// A CPU timestamp and a GPU timestamp taken as close together as possible
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockCalibration {
    pub cpu_ns: u64,
    pub gpu_ticks: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferCopy {
    pub src_offset: u64,
    pub dst_offset: u64,
    pub size: u64,
}

/// Buffer <-> texture copy of one whole mip level, tightly packed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferTextureCopy {
    pub buffer_offset: u64,
    pub mip_level: u32,
}

pub struct TextureBarrier<'a, B: Backend> {
    pub texture: &'a B::Texture,
    pub before: ResourceState,
    pub after: ResourceState,
}

pub struct ColorAttachment<'a, B: Backend> {
    pub texture: &'a B::Texture,
    pub load: LoadOp,
    pub clear: [f32; 4],
}

pub struct DepthAttachment<'a, B: Backend> {
    pub texture: &'a B::Texture,
    pub load: LoadOp,
    pub clear_depth: f32,
}

pub struct RenderingDesc<'a, B: Backend> {
    pub width: u32,
    pub height: u32,
    pub colors: &'a [ColorAttachment<'a, B>],
    pub depth: Option<DepthAttachment<'a, B>>,
}

/// What a descriptor slot points at
pub enum DescriptorResource<'a, B: Backend> {
    Buffer {
        buffer: &'a B::Buffer,
        offset: u64,
        range: u64,
    },
    Texture(&'a B::Texture),
    Sampler(&'a B::Sampler),
    AccelerationStructure(&'a B::AccelerationStructure),
}

/// Triangle geometry fed to a bottom-level build
pub struct TriangleGeometry<'a, B: Backend> {
    pub vertex_buffer: &'a B::Buffer,
    pub vertex_offset: u64,
    pub vertex_stride: u64,
    pub vertex_count: u32,
    pub vertex_format: Format,
    pub indices: Option<(&'a B::Buffer, u64, IndexType)>,
    pub primitive_count: u32,
    pub flags: GeometryFlags,
}

pub enum AccelerationStructureInput<'a, B: Backend> {
    Triangles(&'a [TriangleGeometry<'a, B>]),
    Instances {
        buffer: &'a B::Buffer,
        count: u32,
    },
}

impl<B: Backend> AccelerationStructureInput<'_, B> {
    pub fn level(&self) -> AccelerationStructureLevel {
        match self {
            AccelerationStructureInput::Triangles(_) => AccelerationStructureLevel::Bottom,
            AccelerationStructureInput::Instances { .. } => AccelerationStructureLevel::Top,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccelerationStructureLevel {
    Bottom,
    Top,
}

/// Driver-reported worst-case sizes for a build
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AccelerationStructureSizes {
    pub structure_size: u64,
    pub build_scratch_size: u64,
    pub update_scratch_size: u64,
}

/// Portable top-level instance record; backends encode it field by field
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InstanceRecord {
    /// Row-major 3x4 object-to-world transform
    pub transform: [[f32; 4]; 3],
    /// 24 bits
    pub custom_index: u32,
    pub mask: u8,
    /// 24 bits
    pub hit_group_offset: u32,
    pub flags: InstanceFlags,
    pub blas_address: u64,
}

/// Compiled shader bytecode for one stage, produced by an external compiler
#[derive(Debug, Clone, Copy)]
pub struct ShaderBinary<'a> {
    pub stage: ShaderStages,
    pub code: &'a [u8],
    pub entry_point: &'a str,
}

#[derive(Debug, Clone, Copy)]
pub struct VertexAttribute {
    pub location: u32,
    pub format: Format,
    pub offset: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct VertexBufferLayout<'a> {
    pub stride: u32,
    pub attributes: &'a [VertexAttribute],
}

#[derive(Debug, Clone, Copy)]
pub struct GraphicsPipelineDesc<'a> {
    pub vertex: ShaderBinary<'a>,
    pub fragment: Option<ShaderBinary<'a>>,
    pub vertex_buffers: &'a [VertexBufferLayout<'a>],
    pub topology: PrimitiveTopology,
    pub cull_mode: CullMode,
    pub color_formats: &'a [Format],
    pub depth_format: Option<Format>,
    pub depth_test: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct HitGroup<'a> {
    pub closest_hit: Option<ShaderBinary<'a>>,
    pub any_hit: Option<ShaderBinary<'a>>,
}

#[derive(Debug, Clone, Copy)]
pub struct RayTracingPipelineDesc<'a> {
    pub raygen: ShaderBinary<'a>,
    pub miss: &'a [ShaderBinary<'a>],
    pub hit_groups: &'a [HitGroup<'a>],
    pub max_recursion_depth: u32,
}

#[derive(Debug, Clone, Copy)]
pub enum PipelineKind<'a> {
    Graphics(GraphicsPipelineDesc<'a>),
    Compute(ShaderBinary<'a>),
    RayTracing(RayTracingPipelineDesc<'a>),
}

pub struct PipelineDesc<'a, B: Backend> {
    pub name: &'a str,
    pub binding_layouts: &'a [&'a B::BindingLayout],
    pub push_constant_size: u32,
    pub kind: PipelineKind<'a>,
}

/// Shader-group handle sizes needed to lay out a binding table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShaderGroupInfo {
    pub handle_size: u32,
    pub handle_alignment: u32,
    pub base_alignment: u32,
}

/// One region of a shader binding table buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SbtRegion {
    pub offset: u64,
    pub stride: u64,
    pub size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SbtRegions {
    pub raygen: SbtRegion,
    pub miss: SbtRegion,
    pub hit: SbtRegion,
}

/// Native primitives a graphics API must provide.
///
/// Implemented by the native device object itself. Every `cmd_*` call only
/// records; nothing executes until `submit`.
pub trait Backend: Sized + Send + Sync + 'static {
    type Buffer: fmt::Debug + Send + Sync;
    type Texture: fmt::Debug + Send + Sync;
    type Sampler: fmt::Debug + Send + Sync;
    /// Raw memory block textures can be placed into (aliasing)
    type Memory: fmt::Debug + Send + Sync;
    /// Image owned by someone else, e.g. a swapchain backbuffer
    type ExternalImage;
    /// One native command buffer together with its allocator
    type CommandList: Send;
    /// Monotonic 64-bit GPU counter backing both fences and semaphores
    type Timeline: fmt::Debug + Send + Sync;
    type QueryHeap: fmt::Debug + Send + Sync;
    type DescriptorPool: fmt::Debug + Send + Sync;
    type DescriptorSet: fmt::Debug + Send + Sync;
    type BindingLayout: fmt::Debug + Send + Sync;
    type Pipeline: fmt::Debug + Send + Sync;
    type AccelerationStructure: fmt::Debug + Send + Sync;

    const KIND: BackendKind;

    // -- device ------------------------------------------------------------

    fn open(config: &Config) -> Result<Self>;
    fn capabilities(&self) -> &Capabilities;
    fn calibrate_clocks(&self) -> Result<ClockCalibration>;
    fn wait_idle(&self) -> Result<()>;
    fn queue_wait_idle(&self, queue: QueueType) -> Result<()>;
    /// Bytes between consecutive descriptors of one category in a heap
    fn descriptor_stride(&self, category: DescriptorCategory) -> u32;

    // -- resources ---------------------------------------------------------

    fn create_buffer(&self, desc: &BufferDesc) -> Result<Self::Buffer>;
    fn destroy_buffer(&self, buffer: Self::Buffer);
    fn buffer_device_address(&self, buffer: &Self::Buffer) -> Option<u64>;
    /// Host write into a host-visible buffer
    fn write_buffer(&self, buffer: &Self::Buffer, offset: u64, data: &[u8]) -> Result<()>;
    /// Host read from a host-visible buffer
    fn read_buffer(&self, buffer: &Self::Buffer, offset: u64, out: &mut [u8]) -> Result<()>;

    fn create_memory(&self, name: &str, size: u64) -> Result<Self::Memory>;
    fn destroy_memory(&self, memory: Self::Memory);

    fn create_texture(
        &self,
        desc: &TextureDesc,
        placement: Option<(&Self::Memory, u64)>,
    ) -> Result<Self::Texture>;
    fn wrap_external_image(
        &self,
        name: &str,
        image: Self::ExternalImage,
        extent: Extent3d,
        format: Format,
    ) -> Result<Self::Texture>;
    fn destroy_texture(&self, texture: Self::Texture);

    fn create_sampler(&self, desc: &SamplerDesc) -> Result<Self::Sampler>;
    fn destroy_sampler(&self, sampler: Self::Sampler);

    // -- descriptors and pipelines -----------------------------------------

    fn create_binding_layout(
        &self,
        name: &str,
        bindings: &[DescriptorBinding],
    ) -> Result<Self::BindingLayout>;
    fn destroy_binding_layout(&self, layout: Self::BindingLayout);
    fn create_descriptor_pool(
        &self,
        name: &str,
        capacities: &[u32; 5],
        max_sets: u32,
    ) -> Result<Self::DescriptorPool>;
    fn destroy_descriptor_pool(&self, pool: Self::DescriptorPool);
    fn reset_descriptor_pool(&self, pool: &Self::DescriptorPool) -> Result<()>;
    fn allocate_descriptor_set(
        &self,
        pool: &Self::DescriptorPool,
        layout: &Self::BindingLayout,
    ) -> Result<Self::DescriptorSet>;
    fn write_descriptor(
        &self,
        set: &Self::DescriptorSet,
        binding: &DescriptorBinding,
        array_index: u32,
        resource: DescriptorResource<'_, Self>,
    );

    fn create_pipeline(&self, desc: &PipelineDesc<'_, Self>) -> Result<Self::Pipeline>;
    fn destroy_pipeline(&self, pipeline: Self::Pipeline);
    fn shader_group_info(&self) -> ShaderGroupInfo;
    fn shader_group_handles(&self, pipeline: &Self::Pipeline) -> Result<Vec<u8>>;

    // -- acceleration structures -------------------------------------------

    fn acceleration_structure_sizes(
        &self,
        input: &AccelerationStructureInput<'_, Self>,
        allow_update: bool,
    ) -> AccelerationStructureSizes;
    fn create_acceleration_structure(
        &self,
        name: &str,
        level: AccelerationStructureLevel,
        buffer: &Self::Buffer,
        size: u64,
    ) -> Result<Self::AccelerationStructure>;
    fn destroy_acceleration_structure(&self, accel: Self::AccelerationStructure);
    fn acceleration_structure_address(&self, accel: &Self::AccelerationStructure) -> u64;
    /// Size in bytes of one encoded top-level instance
    fn instance_size(&self) -> u64;
    fn encode_instance(&self, instance: &InstanceRecord, out: &mut Vec<u8>);

    // -- synchronization and queries ---------------------------------------

    fn create_timeline(&self, name: &str, initial_value: u64) -> Result<Self::Timeline>;
    fn destroy_timeline(&self, timeline: Self::Timeline);
    fn timeline_value(&self, timeline: &Self::Timeline) -> Result<u64>;
    /// Returns false if `timeout` expired first. Never cancels GPU work.
    fn wait_timeline(&self, timeline: &Self::Timeline, value: u64, timeout: Duration)
        -> Result<bool>;

    fn create_query_heap(&self, name: &str, capacity: u32) -> Result<Self::QueryHeap>;
    fn destroy_query_heap(&self, heap: Self::QueryHeap);
    /// Blocking read of `count` 64-bit results starting at `first`
    fn read_queries(&self, heap: &Self::QueryHeap, first: u32, count: u32) -> Result<Vec<u64>>;

    // -- command lists -----------------------------------------------------

    fn create_command_list(&self, name: &str, queue: QueueType) -> Result<Self::CommandList>;
    fn destroy_command_list(&self, list: Self::CommandList);
    fn reset_command_list(&self, list: &mut Self::CommandList) -> Result<()>;
    fn begin_command_list(&self, list: &mut Self::CommandList) -> Result<()>;
    fn end_command_list(&self, list: &mut Self::CommandList) -> Result<()>;
    fn submit(
        &self,
        queue: QueueType,
        list: &Self::CommandList,
        waits: &[(&Self::Timeline, u64)],
        signals: &[(&Self::Timeline, u64)],
    ) -> Result<()>;

    fn cmd_texture_barriers(&self, list: &mut Self::CommandList, barriers: &[TextureBarrier<'_, Self>]);
    /// Full write -> read/write visibility barrier on a buffer (UAV barrier)
    fn cmd_buffer_barrier(&self, list: &mut Self::CommandList, buffer: &Self::Buffer);
    fn cmd_copy_buffer(
        &self,
        list: &mut Self::CommandList,
        src: &Self::Buffer,
        dst: &Self::Buffer,
        region: BufferCopy,
    );
    fn cmd_copy_buffer_to_texture(
        &self,
        list: &mut Self::CommandList,
        src: &Self::Buffer,
        dst: &Self::Texture,
        region: BufferTextureCopy,
    );
    fn cmd_copy_texture_to_buffer(
        &self,
        list: &mut Self::CommandList,
        src: &Self::Texture,
        dst: &Self::Buffer,
        region: BufferTextureCopy,
    );
    fn cmd_begin_rendering(&self, list: &mut Self::CommandList, desc: &RenderingDesc<'_, Self>);
    fn cmd_end_rendering(&self, list: &mut Self::CommandList);
    fn cmd_set_viewport(&self, list: &mut Self::CommandList, x: f32, y: f32, width: f32, height: f32);
    fn cmd_set_scissor(&self, list: &mut Self::CommandList, x: i32, y: i32, width: u32, height: u32);
    fn cmd_bind_pipeline(&self, list: &mut Self::CommandList, pipeline: &Self::Pipeline);
    fn cmd_bind_descriptor_sets(
        &self,
        list: &mut Self::CommandList,
        pipeline: &Self::Pipeline,
        first_set: u32,
        sets: &[&Self::DescriptorSet],
    );
    fn cmd_push_constants(
        &self,
        list: &mut Self::CommandList,
        pipeline: &Self::Pipeline,
        offset: u32,
        data: &[u8],
    );
    fn cmd_bind_vertex_buffers(
        &self,
        list: &mut Self::CommandList,
        first_binding: u32,
        buffers: &[(&Self::Buffer, u64)],
    );
    fn cmd_bind_index_buffer(
        &self,
        list: &mut Self::CommandList,
        buffer: &Self::Buffer,
        offset: u64,
        index_type: IndexType,
    );
    fn cmd_draw(
        &self,
        list: &mut Self::CommandList,
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    );
    fn cmd_draw_indexed(
        &self,
        list: &mut Self::CommandList,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    );
    fn cmd_dispatch(&self, list: &mut Self::CommandList, x: u32, y: u32, z: u32);
    fn cmd_trace_rays(
        &self,
        list: &mut Self::CommandList,
        sbt: &Self::Buffer,
        regions: &SbtRegions,
        width: u32,
        height: u32,
        depth: u32,
    );
    fn cmd_reset_queries(&self, list: &mut Self::CommandList, heap: &Self::QueryHeap, first: u32, count: u32);
    fn cmd_write_timestamp(&self, list: &mut Self::CommandList, heap: &Self::QueryHeap, index: u32);
    fn cmd_build_acceleration_structure(
        &self,
        list: &mut Self::CommandList,
        dst: &Self::AccelerationStructure,
        input: &AccelerationStructureInput<'_, Self>,
        scratch: &Self::Buffer,
        allow_update: bool,
        update: bool,
    );
}
