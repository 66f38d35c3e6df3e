// Host-memory stand-ins for native objects
//
// Handles are thin Arc wrappers so recorded commands can keep what they
// reference alive until the submission that uses them has executed.

use parking_lot::{Condvar, Mutex, RwLock};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::backend::AccelerationStructureLevel;
use crate::types::{
    AddressMode, BufferUsage, DescriptorBinding, Extent3d, Filter, Format, ResourceState,
    TextureUsage,
};

pub struct BufferStorage {
    pub name: String,
    pub usage: BufferUsage,
    pub address: u64,
    pub data: RwLock<Vec<u8>>,
}

impl BufferStorage {
    pub fn size(&self) -> u64 {
        self.data.read().len() as u64
    }
}

impl fmt::Debug for BufferStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferStorage")
            .field("name", &self.name)
            .field("size", &self.size())
            .field("address", &format_args!("{:#x}", self.address))
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct HeadlessBuffer(pub(crate) Arc<BufferStorage>);

#[derive(Debug, Clone)]
pub struct HeadlessMemory {
    pub(crate) name: String,
    pub(crate) bytes: Arc<RwLock<Vec<u8>>>,
}

/// Where a texture's texels live
pub enum TexelMemory {
    Owned(RwLock<Vec<u8>>),
    Placed {
        bytes: Arc<RwLock<Vec<u8>>>,
        offset: usize,
    },
}

pub struct TextureStorage {
    pub name: String,
    pub extent: Extent3d,
    pub format: Format,
    pub usage: TextureUsage,
    pub mip_levels: u32,
    pub memory: TexelMemory,
    /// State as of the last recorded barrier; only used to check callers
    pub recorded_state: Mutex<ResourceState>,
}

impl TextureStorage {
    pub fn mip_size(&self, mip: u32) -> usize {
        let w = (self.extent.width >> mip).max(1) as usize;
        let h = (self.extent.height >> mip).max(1) as usize;
        let d = (self.extent.depth >> mip).max(1) as usize;
        w * h * d * self.format.texel_size() as usize
    }

    pub fn mip_offset(&self, mip: u32) -> usize {
        (0..mip).map(|m| self.mip_size(m)).sum()
    }

    pub fn total_size(&self) -> usize {
        self.mip_offset(self.mip_levels)
    }

    /// Run `f` over the bytes of one mip level
    pub fn with_mip<R>(&self, mip: u32, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let start = self.mip_offset(mip);
        let len = self.mip_size(mip);
        match &self.memory {
            TexelMemory::Owned(bytes) => f(&mut bytes.write()[start..start + len]),
            TexelMemory::Placed { bytes, offset } => {
                f(&mut bytes.write()[offset + start..offset + start + len])
            }
        }
    }
}

impl fmt::Debug for TextureStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TextureStorage")
            .field("name", &self.name)
            .field("extent", &self.extent)
            .field("format", &self.format)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct HeadlessTexture(pub(crate) Arc<TextureStorage>);

/// Image handed to `wrap_external_image`, e.g. a fake swapchain image
#[derive(Debug, Clone)]
pub struct HeadlessImage(pub(crate) Arc<TextureStorage>);

#[derive(Debug, Clone, Copy)]
pub struct HeadlessSampler {
    pub filter: Filter,
    pub address_mode: AddressMode,
    pub max_anisotropy: Option<f32>,
}

/// What a build left behind in an acceleration structure
#[derive(Debug, Clone, Copy, Default)]
pub struct AccelContents {
    pub built: bool,
    pub builds: u32,
    pub primitive_count: u32,
    pub instance_count: u32,
    pub bounds_min: [f32; 3],
    pub bounds_max: [f32; 3],
}

#[derive(Debug)]
pub struct AccelStorage {
    pub name: String,
    pub level: AccelerationStructureLevel,
    pub buffer: Arc<BufferStorage>,
    pub size: u64,
    pub contents: Mutex<AccelContents>,
}

#[derive(Debug, Clone)]
pub struct HeadlessAccelerationStructure(pub(crate) Arc<AccelStorage>);

impl HeadlessAccelerationStructure {
    pub fn contents(&self) -> AccelContents {
        *self.0.contents.lock()
    }
}

#[derive(Debug)]
pub struct TimelineStorage {
    pub name: String,
    pub value: Mutex<u64>,
    pub reached: Condvar,
}

impl TimelineStorage {
    pub fn signal(&self, value: u64) {
        let mut current = self.value.lock();
        debug_assert!(
            *current < value,
            "timeline '{}' signaled to {} but already at {}",
            self.name,
            value,
            *current
        );
        *current = value.max(*current);
        self.reached.notify_all();
    }

    pub fn get(&self) -> u64 {
        *self.value.lock()
    }
}

#[derive(Debug, Clone)]
pub struct HeadlessTimeline(pub(crate) Arc<TimelineStorage>);

#[derive(Debug)]
pub struct QueryStorage {
    pub name: String,
    /// None until written after the last reset
    pub slots: Mutex<Vec<Option<u64>>>,
    /// Notified whenever a submission writes a slot
    pub written: Condvar,
}

#[derive(Debug, Clone)]
pub struct HeadlessQueryHeap(pub(crate) Arc<QueryStorage>);

#[derive(Debug, Clone)]
pub struct HeadlessBindingLayout {
    pub(crate) bindings: Vec<DescriptorBinding>,
}

#[derive(Debug)]
pub struct HeadlessDescriptorPool {
    pub(crate) name: String,
    pub(crate) capacities: [u32; 5],
    pub(crate) generation: Mutex<u64>,
}

#[derive(Debug, Clone)]
pub enum BoundResource {
    Buffer {
        buffer: Arc<BufferStorage>,
        offset: u64,
        range: u64,
    },
    Texture(Arc<TextureStorage>),
    Sampler(HeadlessSampler),
    AccelerationStructure(Arc<AccelStorage>),
}

#[derive(Debug)]
pub struct SetStorage {
    pub generation: u64,
    pub bindings: Vec<DescriptorBinding>,
    pub entries: Mutex<HashMap<(u32, u32), BoundResource>>,
}

#[derive(Debug, Clone)]
pub struct HeadlessDescriptorSet(pub(crate) Arc<SetStorage>);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineClass {
    Graphics,
    Compute,
    RayTracing { group_count: u32 },
}

#[derive(Debug)]
pub struct PipelineStorage {
    pub id: u64,
    pub name: String,
    pub class: PipelineClass,
    pub set_count: u32,
    pub push_constant_size: u32,
}

#[derive(Debug, Clone)]
pub struct HeadlessPipeline(pub(crate) Arc<PipelineStorage>);
