// my-rhi - portable rendering hardware interface
//
// Architecture:
// - backend/:      native primitives behind the `Backend` trait (Vulkan, headless)
// - device.rs:     device handle, queue family selection, one-time submits
// - resource.rs:   buffers, textures, samplers, aliased memory
// - command.rs:    command buffers, pooled recycling, recording API
// - sync.rs:       fences and semaphores over 64-bit timeline counters
// - staging.rs:    staging buffer reuse for uploads/readbacks
// - descriptor.rs: linear per-category heaps, reset as a whole; descriptor sets
// - pipeline.rs:   graphics/compute/ray tracing pipelines, binding tables
// - accel.rs:      bottom/top level acceleration structures
// - query.rs:      timestamp queries
// - config.rs:     TOML configuration

pub mod accel;
pub mod backend;
pub mod command;
pub mod config;
pub mod descriptor;
pub mod device;
pub mod pipeline;
pub mod query;
pub mod resource;
pub mod staging;
pub mod sync;
pub mod types;

pub use accel::{Blas, IndexData, Tlas, TlasInstance, TriangleGeometryDesc};
pub use backend::{Backend, BackendKind, Capabilities, HeadlessDevice, VulkanDevice};
pub use command::{ColorTarget, CommandBuffer, CommandPool, DepthTarget, RecordState};
pub use config::Config;
pub use descriptor::{
    BindingLayout, DescriptorAllocator, DescriptorHandle, DescriptorPool, DescriptorSet,
    DescriptorWrite,
};
pub use device::Device;
pub use pipeline::{Pipeline, PipelineType, ShaderBindingTable};
pub use query::QueryPool;
pub use resource::{AliasedMemory, Buffer, Sampler, Texture, TextureOrigin};
pub use staging::StagingManager;
pub use sync::{Fence, Semaphore, WaitStatus};
pub use types::*;
