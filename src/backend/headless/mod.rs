// Headless backend - command-list model emulated in host memory
//
// Commands are recorded into plain lists and replayed when submitted.
// Queue waits are honored: a submission whose timeline waits are not yet
// satisfied stays queued, and blocks the submissions behind it on the
// same queue, until another submission signals what it needs.

mod exec;
mod resources;

pub use resources::{
    AccelContents, HeadlessAccelerationStructure, HeadlessBindingLayout, HeadlessBuffer,
    HeadlessDescriptorPool, HeadlessDescriptorSet, HeadlessImage, HeadlessMemory,
    HeadlessPipeline, HeadlessQueryHeap, HeadlessSampler, HeadlessTexture, HeadlessTimeline,
};

use anyhow::{bail, ensure, Context, Result};
use parking_lot::{Condvar, Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use self::exec::{BuildInput, ClearValue, Executor, Op, TriangleSnapshot};
use self::resources::{
    AccelStorage, BoundResource, BufferStorage, PipelineClass, PipelineStorage, QueryStorage,
    SetStorage, TexelMemory, TextureStorage, TimelineStorage,
};
use super::{
    AccelerationStructureInput, AccelerationStructureLevel, AccelerationStructureSizes, Backend,
    BackendKind, BufferCopy, BufferTextureCopy, Capabilities, ClockCalibration, DescriptorResource,
    InstanceRecord, PipelineDesc, PipelineKind, RenderingDesc, SbtRegions, ShaderBinary,
    ShaderGroupInfo, TextureBarrier,
};
use crate::config::Config;
use crate::device::{select_queue_families, QueueCaps, QueueFamilyInfo};
use crate::types::{
    BufferDesc, BufferUsage, DescriptorBinding, DescriptorCategory, Extent3d, Format, IndexType,
    LoadOp, QueueType, ResourceState, SamplerDesc, TextureDesc, TextureUsage,
};

/// Bytes per encoded top-level instance, same layout as the Vulkan record
pub(crate) const INSTANCE_SIZE: u64 = 64;
const HANDLE_SIZE: usize = 32;
const ADDRESS_ALIGNMENT: u64 = 256;

/// Deterministic shader-group handle: pipeline id, group index, filler
pub(crate) fn group_handle(pipeline_id: u64, group: u32) -> [u8; HANDLE_SIZE] {
    let mut handle = [0xA5u8; HANDLE_SIZE];
    handle[..8].copy_from_slice(&pipeline_id.to_le_bytes());
    handle[8..12].copy_from_slice(&group.to_le_bytes());
    handle
}

fn build_sizes(primitives: u64, allow_update: bool) -> AccelerationStructureSizes {
    let primitives = primitives.max(1);
    AccelerationStructureSizes {
        structure_size: 256 + primitives * 64,
        build_scratch_size: 128 + primitives * 32,
        update_scratch_size: if allow_update { 64 + primitives * 16 } else { 0 },
    }
}

fn timeline_pairs(pairs: &[(&HeadlessTimeline, u64)]) -> Vec<(Arc<TimelineStorage>, u64)> {
    pairs
        .iter()
        .map(|(timeline, value)| (Arc::clone(&timeline.0), *value))
        .collect()
}

#[derive(Default)]
pub(crate) struct Counters {
    submissions: AtomicU64,
    copies: AtomicU64,
    draws: AtomicU64,
    vertices: AtomicU64,
    dispatches: AtomicU64,
    workgroups: AtomicU64,
    trace_rays: AtomicU64,
    rays: AtomicU64,
    accel_builds: AtomicU64,
}

impl Counters {
    fn bump(&self, counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }
}

/// What the emulated GPU has executed so far
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeadlessStats {
    pub submissions: u64,
    pub copies: u64,
    pub draws: u64,
    pub vertices: u64,
    pub dispatches: u64,
    pub workgroups: u64,
    pub trace_rays: u64,
    pub rays: u64,
    pub accel_builds: u64,
}

/// Commands recorded on the host, replayed at submit
pub struct HeadlessCommandList {
    name: String,
    queue: QueueType,
    ops: Vec<Op>,
    recording: bool,
}

struct Submission {
    name: String,
    ops: Vec<Op>,
    waits: Vec<(Arc<TimelineStorage>, u64)>,
    signals: Vec<(Arc<TimelineStorage>, u64)>,
}

impl Submission {
    fn ready(&self) -> bool {
        self.waits.iter().all(|(timeline, value)| timeline.get() >= *value)
    }

    fn writes_queries(&self, heap: &Arc<QueryStorage>, range: &std::ops::Range<u32>) -> bool {
        self.ops.iter().any(|op| {
            matches!(op, Op::WriteTimestamp { heap: written, index }
                if Arc::ptr_eq(written, heap) && range.contains(index))
        })
    }
}

pub struct HeadlessDevice {
    caps: Capabilities,
    epoch: Instant,
    next_address: AtomicU64,
    next_pipeline_id: AtomicU64,
    accels: Mutex<HashMap<u64, Weak<AccelStorage>>>,
    queues: Mutex<[VecDeque<Submission>; 3]>,
    pub(crate) counters: Counters,
}

impl HeadlessDevice {
    pub fn stats(&self) -> HeadlessStats {
        let c = &self.counters;
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        HeadlessStats {
            submissions: load(&c.submissions),
            copies: load(&c.copies),
            draws: load(&c.draws),
            vertices: load(&c.vertices),
            dispatches: load(&c.dispatches),
            workgroups: load(&c.workgroups),
            trace_rays: load(&c.trace_rays),
            rays: load(&c.rays),
            accel_builds: load(&c.accel_builds),
        }
    }

    /// Submissions still waiting on a timeline value nobody has signaled
    pub fn pending_submissions(&self) -> usize {
        self.queues.lock().iter().map(VecDeque::len).sum()
    }

    /// An image owned outside the RHI, for `Device::wrap_backbuffer`
    pub fn create_backbuffer_image(&self, name: &str, extent: Extent3d, format: Format) -> HeadlessImage {
        let size = extent.texel_count() as usize * format.texel_size() as usize;
        HeadlessImage(Arc::new(TextureStorage {
            name: name.to_string(),
            extent,
            format,
            usage: TextureUsage::COLOR_ATTACHMENT | TextureUsage::TRANSFER_DST | TextureUsage::TRANSFER_SRC,
            mip_levels: 1,
            memory: TexelMemory::Owned(RwLock::new(vec![0; size])),
            recorded_state: Mutex::new(ResourceState::None),
        }))
    }

    pub(crate) fn now_ticks(&self) -> u64 {
        self.epoch.elapsed().as_nanos() as u64
    }

    pub(crate) fn lookup_accel(&self, address: u64) -> Option<Arc<AccelStorage>> {
        self.accels.lock().get(&address).and_then(Weak::upgrade)
    }

    fn allocate_address(&self, size: u64) -> u64 {
        let span = size.div_ceil(ADDRESS_ALIGNMENT).max(1) * ADDRESS_ALIGNMENT;
        self.next_address.fetch_add(span, Ordering::Relaxed)
    }

    /// Run every queued submission whose waits are satisfied, until none is
    fn pump(&self, queues: &mut [VecDeque<Submission>; 3]) -> Result<()> {
        loop {
            let mut progressed = false;
            for queue in queues.iter_mut() {
                while queue.front().is_some_and(Submission::ready) {
                    let Some(submission) = queue.pop_front() else {
                        break;
                    };
                    Executor::new(self)
                        .run(&submission.ops)
                        .with_context(|| format!("Executing '{}'", submission.name))?;
                    for (timeline, value) in &submission.signals {
                        timeline.signal(*value);
                    }
                    self.counters.bump(&self.counters.submissions, 1);
                    progressed = true;
                }
            }
            if !progressed {
                return Ok(());
            }
        }
    }

    fn validate_shader(shader: &ShaderBinary<'_>) -> Result<()> {
        ensure!(
            !shader.code.is_empty() && shader.code.len() % 4 == 0,
            "{:?} shader is not a whole number of 32-bit words",
            shader.stage
        );
        ensure!(!shader.entry_point.is_empty(), "{:?} shader has no entry point", shader.stage);
        Ok(())
    }
}

impl Backend for HeadlessDevice {
    type Buffer = HeadlessBuffer;
    type Texture = HeadlessTexture;
    type Sampler = HeadlessSampler;
    type Memory = HeadlessMemory;
    type ExternalImage = HeadlessImage;
    type CommandList = HeadlessCommandList;
    type Timeline = HeadlessTimeline;
    type QueryHeap = HeadlessQueryHeap;
    type DescriptorPool = HeadlessDescriptorPool;
    type DescriptorSet = HeadlessDescriptorSet;
    type BindingLayout = HeadlessBindingLayout;
    type Pipeline = HeadlessPipeline;
    type AccelerationStructure = HeadlessAccelerationStructure;

    const KIND: BackendKind = BackendKind::Headless;

    fn open(config: &Config) -> Result<Self> {
        let families = [
            QueueFamilyInfo {
                caps: QueueCaps::all(),
                queue_count: 1,
            },
            QueueFamilyInfo {
                caps: QueueCaps::COMPUTE | QueueCaps::TRANSFER,
                queue_count: 1,
            },
            QueueFamilyInfo {
                caps: QueueCaps::TRANSFER,
                queue_count: 1,
            },
        ];
        let queue_families =
            select_queue_families(&families, |_| true).context("No graphics queue family")?;

        log::info!("Opening headless device ({})", config.device.app_name);
        Ok(Self {
            caps: Capabilities {
                adapter_name: "Headless".to_string(),
                queue_families,
                ray_tracing: config.device.enable_ray_tracing,
                mesh_shading: config.device.enable_mesh_shading,
                debug_names: true,
                calibrated_timestamps: true,
                timestamp_period: 1.0,
            },
            epoch: Instant::now(),
            next_address: AtomicU64::new(0x1000_0000),
            next_pipeline_id: AtomicU64::new(1),
            accels: Mutex::new(HashMap::new()),
            queues: Mutex::new([VecDeque::new(), VecDeque::new(), VecDeque::new()]),
            counters: Counters::default(),
        })
    }

    fn capabilities(&self) -> &Capabilities {
        &self.caps
    }

    fn calibrate_clocks(&self) -> Result<ClockCalibration> {
        let now = self.now_ticks();
        Ok(ClockCalibration {
            cpu_ns: now,
            gpu_ticks: now,
        })
    }

    fn wait_idle(&self) -> Result<()> {
        let pending = self.pending_submissions();
        ensure!(pending == 0, "{} submissions wait on timelines that are never signaled", pending);
        Ok(())
    }

    fn queue_wait_idle(&self, queue: QueueType) -> Result<()> {
        let pending = self.queues.lock()[queue.index()].len();
        ensure!(pending == 0, "{:?} queue is stuck behind {} submissions", queue, pending);
        Ok(())
    }

    fn descriptor_stride(&self, category: DescriptorCategory) -> u32 {
        match category {
            DescriptorCategory::Uniform | DescriptorCategory::Storage => 16,
            DescriptorCategory::Sampler | DescriptorCategory::Image => 32,
            DescriptorCategory::AccelerationStructure => 8,
        }
    }

    // -- resources ---------------------------------------------------------

    fn create_buffer(&self, desc: &BufferDesc) -> Result<HeadlessBuffer> {
        Ok(HeadlessBuffer(Arc::new(BufferStorage {
            name: desc.name.to_string(),
            usage: desc.usage,
            address: self.allocate_address(desc.size),
            data: RwLock::new(vec![0; desc.size as usize]),
        })))
    }

    fn destroy_buffer(&self, _buffer: HeadlessBuffer) {}

    fn buffer_device_address(&self, buffer: &HeadlessBuffer) -> Option<u64> {
        Some(buffer.0.address)
    }

    fn write_buffer(&self, buffer: &HeadlessBuffer, offset: u64, data: &[u8]) -> Result<()> {
        let mut bytes = buffer.0.data.write();
        let start = offset as usize;
        let Some(dst) = bytes.get_mut(start..start + data.len()) else {
            bail!("write past the end of '{}'", buffer.0.name);
        };
        dst.copy_from_slice(data);
        Ok(())
    }

    fn read_buffer(&self, buffer: &HeadlessBuffer, offset: u64, out: &mut [u8]) -> Result<()> {
        let bytes = buffer.0.data.read();
        let start = offset as usize;
        let Some(src) = bytes.get(start..start + out.len()) else {
            bail!("read past the end of '{}'", buffer.0.name);
        };
        out.copy_from_slice(src);
        Ok(())
    }

    fn create_memory(&self, name: &str, size: u64) -> Result<HeadlessMemory> {
        Ok(HeadlessMemory {
            name: name.to_string(),
            bytes: Arc::new(RwLock::new(vec![0; size as usize])),
        })
    }

    fn destroy_memory(&self, _memory: HeadlessMemory) {}

    fn create_texture(
        &self,
        desc: &TextureDesc,
        placement: Option<(&HeadlessMemory, u64)>,
    ) -> Result<HeadlessTexture> {
        ensure!(desc.extent.texel_count() > 0, "texture '{}' has an empty extent", desc.name);
        let mut storage = TextureStorage {
            name: desc.name.to_string(),
            extent: desc.extent,
            format: desc.format,
            usage: desc.usage,
            mip_levels: desc.mip_levels.max(1),
            memory: TexelMemory::Owned(RwLock::new(Vec::new())),
            recorded_state: Mutex::new(ResourceState::None),
        };
        let size = storage.total_size();
        storage.memory = match placement {
            None => TexelMemory::Owned(RwLock::new(vec![0; size])),
            Some((memory, offset)) => {
                let capacity = memory.bytes.read().len();
                ensure!(
                    offset as usize + size <= capacity,
                    "texture '{}' ({} bytes at {}) does not fit in '{}' ({} bytes)",
                    desc.name,
                    size,
                    offset,
                    memory.name,
                    capacity
                );
                TexelMemory::Placed {
                    bytes: Arc::clone(&memory.bytes),
                    offset: offset as usize,
                }
            }
        };
        Ok(HeadlessTexture(Arc::new(storage)))
    }

    fn wrap_external_image(
        &self,
        name: &str,
        image: HeadlessImage,
        extent: Extent3d,
        format: Format,
    ) -> Result<HeadlessTexture> {
        ensure!(
            image.0.extent == extent && image.0.format == format,
            "backbuffer '{}' is {:?} {:?}, not {:?} {:?}",
            name,
            image.0.extent,
            image.0.format,
            extent,
            format
        );
        Ok(HeadlessTexture(image.0))
    }

    fn destroy_texture(&self, _texture: HeadlessTexture) {}

    fn create_sampler(&self, desc: &SamplerDesc) -> Result<HeadlessSampler> {
        Ok(HeadlessSampler {
            filter: desc.filter,
            address_mode: desc.address_mode,
            max_anisotropy: desc.max_anisotropy,
        })
    }

    fn destroy_sampler(&self, _sampler: HeadlessSampler) {}

    // -- descriptors and pipelines -----------------------------------------

    fn create_binding_layout(
        &self,
        name: &str,
        bindings: &[DescriptorBinding],
    ) -> Result<HeadlessBindingLayout> {
        for (i, binding) in bindings.iter().enumerate() {
            ensure!(
                bindings[..i].iter().all(|b| b.binding != binding.binding),
                "layout '{}' declares binding {} twice",
                name,
                binding.binding
            );
        }
        Ok(HeadlessBindingLayout {
            bindings: bindings.to_vec(),
        })
    }

    fn destroy_binding_layout(&self, _layout: HeadlessBindingLayout) {}

    fn create_descriptor_pool(
        &self,
        name: &str,
        capacities: &[u32; 5],
        _max_sets: u32,
    ) -> Result<HeadlessDescriptorPool> {
        Ok(HeadlessDescriptorPool {
            name: name.to_string(),
            capacities: *capacities,
            generation: Mutex::new(0),
        })
    }

    fn destroy_descriptor_pool(&self, _pool: HeadlessDescriptorPool) {}

    fn reset_descriptor_pool(&self, pool: &HeadlessDescriptorPool) -> Result<()> {
        *pool.generation.lock() += 1;
        log::trace!("Descriptor pool '{}' reset {:?}", pool.name, pool.capacities);
        Ok(())
    }

    fn allocate_descriptor_set(
        &self,
        pool: &HeadlessDescriptorPool,
        layout: &HeadlessBindingLayout,
    ) -> Result<HeadlessDescriptorSet> {
        Ok(HeadlessDescriptorSet(Arc::new(SetStorage {
            generation: *pool.generation.lock(),
            bindings: layout.bindings.clone(),
            entries: Mutex::new(HashMap::new()),
        })))
    }

    fn write_descriptor(
        &self,
        set: &HeadlessDescriptorSet,
        binding: &DescriptorBinding,
        array_index: u32,
        resource: DescriptorResource<'_, Self>,
    ) {
        debug_assert!(set.0.bindings.contains(binding));
        let bound = match resource {
            DescriptorResource::Buffer {
                buffer,
                offset,
                range,
            } => BoundResource::Buffer {
                buffer: Arc::clone(&buffer.0),
                offset,
                range,
            },
            DescriptorResource::Texture(texture) => BoundResource::Texture(Arc::clone(&texture.0)),
            DescriptorResource::Sampler(sampler) => BoundResource::Sampler(*sampler),
            DescriptorResource::AccelerationStructure(accel) => {
                BoundResource::AccelerationStructure(Arc::clone(&accel.0))
            }
        };
        set.0
            .entries
            .lock()
            .insert((binding.binding, array_index), bound);
    }

    fn create_pipeline(&self, desc: &PipelineDesc<'_, Self>) -> Result<HeadlessPipeline> {
        let class = match &desc.kind {
            PipelineKind::Graphics(graphics) => {
                Self::validate_shader(&graphics.vertex)?;
                if let Some(fragment) = &graphics.fragment {
                    Self::validate_shader(fragment)?;
                }
                PipelineClass::Graphics
            }
            PipelineKind::Compute(shader) => {
                Self::validate_shader(shader)?;
                PipelineClass::Compute
            }
            PipelineKind::RayTracing(rt) => {
                Self::validate_shader(&rt.raygen)?;
                for shader in rt.miss {
                    Self::validate_shader(shader)?;
                }
                for group in rt.hit_groups {
                    ensure!(
                        group.closest_hit.is_some() || group.any_hit.is_some(),
                        "empty hit group in '{}'",
                        desc.name
                    );
                    for shader in group.closest_hit.iter().chain(group.any_hit.iter()) {
                        Self::validate_shader(shader)?;
                    }
                }
                PipelineClass::RayTracing {
                    group_count: 1 + rt.miss.len() as u32 + rt.hit_groups.len() as u32,
                }
            }
        };
        Ok(HeadlessPipeline(Arc::new(PipelineStorage {
            id: self.next_pipeline_id.fetch_add(1, Ordering::Relaxed),
            name: desc.name.to_string(),
            class,
            set_count: desc.binding_layouts.len() as u32,
            push_constant_size: desc.push_constant_size,
        })))
    }

    fn destroy_pipeline(&self, _pipeline: HeadlessPipeline) {}

    fn shader_group_info(&self) -> ShaderGroupInfo {
        ShaderGroupInfo {
            handle_size: HANDLE_SIZE as u32,
            handle_alignment: 32,
            base_alignment: 64,
        }
    }

    fn shader_group_handles(&self, pipeline: &HeadlessPipeline) -> Result<Vec<u8>> {
        let PipelineClass::RayTracing { group_count } = pipeline.0.class else {
            bail!("'{}' is not a ray tracing pipeline", pipeline.0.name);
        };
        Ok((0..group_count)
            .flat_map(|group| group_handle(pipeline.0.id, group))
            .collect())
    }

    // -- acceleration structures -------------------------------------------

    fn acceleration_structure_sizes(
        &self,
        input: &AccelerationStructureInput<'_, Self>,
        allow_update: bool,
    ) -> AccelerationStructureSizes {
        let primitives = match input {
            AccelerationStructureInput::Triangles(geometry) => {
                geometry.iter().map(|g| g.primitive_count as u64).sum()
            }
            AccelerationStructureInput::Instances { count, .. } => *count as u64,
        };
        build_sizes(primitives, allow_update)
    }

    fn create_acceleration_structure(
        &self,
        name: &str,
        level: AccelerationStructureLevel,
        buffer: &HeadlessBuffer,
        size: u64,
    ) -> Result<HeadlessAccelerationStructure> {
        ensure!(
            buffer.0.usage.contains(BufferUsage::ACCEL_STRUCTURE_STORAGE),
            "'{}' is not acceleration structure storage",
            buffer.0.name
        );
        ensure!(buffer.0.size() >= size, "'{}' is smaller than {} bytes", buffer.0.name, size);
        let storage = Arc::new(AccelStorage {
            name: name.to_string(),
            level,
            buffer: Arc::clone(&buffer.0),
            size,
            contents: Mutex::new(AccelContents::default()),
        });
        self.accels
            .lock()
            .insert(buffer.0.address, Arc::downgrade(&storage));
        Ok(HeadlessAccelerationStructure(storage))
    }

    fn destroy_acceleration_structure(&self, accel: HeadlessAccelerationStructure) {
        self.accels.lock().remove(&accel.0.buffer.address);
    }

    fn acceleration_structure_address(&self, accel: &HeadlessAccelerationStructure) -> u64 {
        accel.0.buffer.address
    }

    fn instance_size(&self) -> u64 {
        INSTANCE_SIZE
    }

    fn encode_instance(&self, instance: &InstanceRecord, out: &mut Vec<u8>) {
        for row in &instance.transform {
            for v in row {
                out.extend_from_slice(&v.to_le_bytes());
            }
        }
        let id_and_mask = (instance.custom_index & 0x00FF_FFFF) | (instance.mask as u32) << 24;
        let offset_and_flags =
            (instance.hit_group_offset & 0x00FF_FFFF) | (instance.flags.bits() & 0xFF) << 24;
        out.extend_from_slice(&id_and_mask.to_le_bytes());
        out.extend_from_slice(&offset_and_flags.to_le_bytes());
        out.extend_from_slice(&instance.blas_address.to_le_bytes());
    }

    // -- synchronization and queries ---------------------------------------

    fn create_timeline(&self, name: &str, initial_value: u64) -> Result<HeadlessTimeline> {
        Ok(HeadlessTimeline(Arc::new(TimelineStorage {
            name: name.to_string(),
            value: Mutex::new(initial_value),
            reached: Condvar::new(),
        })))
    }

    fn destroy_timeline(&self, _timeline: HeadlessTimeline) {}

    fn timeline_value(&self, timeline: &HeadlessTimeline) -> Result<u64> {
        Ok(timeline.0.get())
    }

    fn wait_timeline(&self, timeline: &HeadlessTimeline, value: u64, timeout: Duration) -> Result<bool> {
        let deadline = Instant::now().checked_add(timeout);
        let mut current = timeline.0.value.lock();
        while *current < value {
            match deadline {
                Some(deadline) => {
                    if timeline.0.reached.wait_until(&mut current, deadline).timed_out() {
                        return Ok(*current >= value);
                    }
                }
                None => timeline.0.reached.wait(&mut current),
            }
        }
        Ok(true)
    }

    fn create_query_heap(&self, name: &str, capacity: u32) -> Result<HeadlessQueryHeap> {
        Ok(HeadlessQueryHeap(Arc::new(QueryStorage {
            name: name.to_string(),
            slots: Mutex::new(vec![None; capacity as usize]),
            written: Condvar::new(),
        })))
    }

    fn destroy_query_heap(&self, _heap: HeadlessQueryHeap) {}

    /// Blocks while a queued submission still has to write one of the
    /// slots; fails for slots nothing will ever write.
    fn read_queries(&self, heap: &HeadlessQueryHeap, first: u32, count: u32) -> Result<Vec<u64>> {
        let range = first..first + count;
        loop {
            let pending = {
                let mut queues = self.queues.lock();
                self.pump(&mut queues)?;
                queues
                    .iter()
                    .flatten()
                    .any(|s| s.writes_queries(&heap.0, &range))
            };

            let mut slots = heap.0.slots.lock();
            let missing = range.clone().find(|&i| slots[i as usize].is_none());
            match missing {
                None => return Ok(range.filter_map(|i| slots[i as usize]).collect()),
                Some(i) if !pending => {
                    bail!("query {} of '{}' holds no result", i, heap.0.name)
                }
                Some(_) => heap.0.written.wait(&mut slots),
            }
        }
    }

    // -- command lists -----------------------------------------------------

    fn create_command_list(&self, name: &str, queue: QueueType) -> Result<HeadlessCommandList> {
        Ok(HeadlessCommandList {
            name: name.to_string(),
            queue,
            ops: Vec::new(),
            recording: false,
        })
    }

    fn destroy_command_list(&self, _list: HeadlessCommandList) {}

    fn reset_command_list(&self, list: &mut HeadlessCommandList) -> Result<()> {
        list.ops.clear();
        list.recording = false;
        Ok(())
    }

    fn begin_command_list(&self, list: &mut HeadlessCommandList) -> Result<()> {
        ensure!(!list.recording, "'{}' is already recording", list.name);
        list.ops.clear();
        list.recording = true;
        Ok(())
    }

    fn end_command_list(&self, list: &mut HeadlessCommandList) -> Result<()> {
        ensure!(list.recording, "'{}' is not recording", list.name);
        list.recording = false;
        Ok(())
    }

    fn submit(
        &self,
        queue: QueueType,
        list: &HeadlessCommandList,
        waits: &[(&HeadlessTimeline, u64)],
        signals: &[(&HeadlessTimeline, u64)],
    ) -> Result<()> {
        ensure!(!list.recording, "'{}' submitted while recording", list.name);
        debug_assert_eq!(list.queue, queue);
        let submission = Submission {
            name: list.name.clone(),
            ops: list.ops.clone(),
            waits: timeline_pairs(waits),
            signals: timeline_pairs(signals),
        };

        let mut queues = self.queues.lock();
        queues[queue.index()].push_back(submission);
        self.pump(&mut queues)
    }

    fn cmd_texture_barriers(&self, list: &mut HeadlessCommandList, barriers: &[TextureBarrier<'_, Self>]) {
        for barrier in barriers {
            let texture = &barrier.texture.0;
            let mut state = texture.recorded_state.lock();
            // None as the old state discards contents and is always accepted
            debug_assert!(
                barrier.before == ResourceState::None || *state == barrier.before,
                "texture '{}' is in {:?}, barrier claims {:?}",
                texture.name,
                *state,
                barrier.before
            );
            *state = barrier.after;
        }
        list.ops.push(Op::Barrier);
    }

    fn cmd_buffer_barrier(&self, list: &mut HeadlessCommandList, _buffer: &HeadlessBuffer) {
        list.ops.push(Op::Barrier);
    }

    fn cmd_copy_buffer(
        &self,
        list: &mut HeadlessCommandList,
        src: &HeadlessBuffer,
        dst: &HeadlessBuffer,
        region: BufferCopy,
    ) {
        list.ops.push(Op::CopyBuffer {
            src: Arc::clone(&src.0),
            dst: Arc::clone(&dst.0),
            region,
        });
    }

    fn cmd_copy_buffer_to_texture(
        &self,
        list: &mut HeadlessCommandList,
        src: &HeadlessBuffer,
        dst: &HeadlessTexture,
        region: BufferTextureCopy,
    ) {
        debug_assert_eq!(*dst.0.recorded_state.lock(), ResourceState::TransferDst);
        list.ops.push(Op::CopyBufferToTexture {
            src: Arc::clone(&src.0),
            dst: Arc::clone(&dst.0),
            region,
        });
    }

    fn cmd_copy_texture_to_buffer(
        &self,
        list: &mut HeadlessCommandList,
        src: &HeadlessTexture,
        dst: &HeadlessBuffer,
        region: BufferTextureCopy,
    ) {
        debug_assert_eq!(*src.0.recorded_state.lock(), ResourceState::TransferSrc);
        list.ops.push(Op::CopyTextureToBuffer {
            src: Arc::clone(&src.0),
            dst: Arc::clone(&dst.0),
            region,
        });
    }

    fn cmd_begin_rendering(&self, list: &mut HeadlessCommandList, desc: &RenderingDesc<'_, Self>) {
        let mut clears = Vec::new();
        for color in desc.colors {
            debug_assert_eq!(*color.texture.0.recorded_state.lock(), ResourceState::ColorAttachment);
            if color.load == LoadOp::Clear {
                clears.push((Arc::clone(&color.texture.0), ClearValue::Color(color.clear)));
            }
        }
        if let Some(depth) = &desc.depth {
            debug_assert_eq!(*depth.texture.0.recorded_state.lock(), ResourceState::DepthAttachment);
            if depth.load == LoadOp::Clear {
                clears.push((Arc::clone(&depth.texture.0), ClearValue::Depth(depth.clear_depth)));
            }
        }
        list.ops.push(Op::BeginRendering { clears });
    }

    fn cmd_end_rendering(&self, list: &mut HeadlessCommandList) {
        list.ops.push(Op::EndRendering);
    }

    fn cmd_set_viewport(&self, _list: &mut HeadlessCommandList, _x: f32, _y: f32, _width: f32, _height: f32) {}

    fn cmd_set_scissor(&self, _list: &mut HeadlessCommandList, _x: i32, _y: i32, _width: u32, _height: u32) {}

    fn cmd_bind_pipeline(&self, list: &mut HeadlessCommandList, pipeline: &HeadlessPipeline) {
        list.ops.push(Op::BindPipeline(Arc::clone(&pipeline.0)));
    }

    fn cmd_bind_descriptor_sets(
        &self,
        list: &mut HeadlessCommandList,
        _pipeline: &HeadlessPipeline,
        first_set: u32,
        sets: &[&HeadlessDescriptorSet],
    ) {
        list.ops.push(Op::BindDescriptorSets {
            first_set,
            sets: sets.iter().map(|s| Arc::clone(&s.0)).collect(),
        });
    }

    fn cmd_push_constants(
        &self,
        _list: &mut HeadlessCommandList,
        pipeline: &HeadlessPipeline,
        offset: u32,
        data: &[u8],
    ) {
        debug_assert!(offset as usize + data.len() <= pipeline.0.push_constant_size as usize);
    }

    fn cmd_bind_vertex_buffers(
        &self,
        _list: &mut HeadlessCommandList,
        _first_binding: u32,
        buffers: &[(&HeadlessBuffer, u64)],
    ) {
        debug_assert!(buffers
            .iter()
            .all(|(b, _)| b.0.usage.contains(BufferUsage::VERTEX_BUFFER)));
    }

    fn cmd_bind_index_buffer(
        &self,
        _list: &mut HeadlessCommandList,
        buffer: &HeadlessBuffer,
        _offset: u64,
        _index_type: IndexType,
    ) {
        debug_assert!(buffer.0.usage.contains(BufferUsage::INDEX_BUFFER));
    }

    fn cmd_draw(
        &self,
        list: &mut HeadlessCommandList,
        vertex_count: u32,
        instance_count: u32,
        _first_vertex: u32,
        _first_instance: u32,
    ) {
        list.ops.push(Op::Draw {
            vertices: vertex_count as u64 * instance_count as u64,
        });
    }

    fn cmd_draw_indexed(
        &self,
        list: &mut HeadlessCommandList,
        index_count: u32,
        instance_count: u32,
        _first_index: u32,
        _vertex_offset: i32,
        _first_instance: u32,
    ) {
        list.ops.push(Op::Draw {
            vertices: index_count as u64 * instance_count as u64,
        });
    }

    fn cmd_dispatch(&self, list: &mut HeadlessCommandList, x: u32, y: u32, z: u32) {
        list.ops.push(Op::Dispatch {
            groups: x as u64 * y as u64 * z as u64,
        });
    }

    fn cmd_trace_rays(
        &self,
        list: &mut HeadlessCommandList,
        sbt: &HeadlessBuffer,
        regions: &SbtRegions,
        width: u32,
        height: u32,
        depth: u32,
    ) {
        list.ops.push(Op::TraceRays {
            sbt: Arc::clone(&sbt.0),
            regions: *regions,
            rays: width as u64 * height as u64 * depth as u64,
        });
    }

    fn cmd_reset_queries(&self, list: &mut HeadlessCommandList, heap: &HeadlessQueryHeap, first: u32, count: u32) {
        list.ops.push(Op::ResetQueries {
            heap: Arc::clone(&heap.0),
            first,
            count,
        });
    }

    fn cmd_write_timestamp(&self, list: &mut HeadlessCommandList, heap: &HeadlessQueryHeap, index: u32) {
        list.ops.push(Op::WriteTimestamp {
            heap: Arc::clone(&heap.0),
            index,
        });
    }

    fn cmd_build_acceleration_structure(
        &self,
        list: &mut HeadlessCommandList,
        dst: &HeadlessAccelerationStructure,
        input: &AccelerationStructureInput<'_, Self>,
        scratch: &HeadlessBuffer,
        allow_update: bool,
        update: bool,
    ) {
        let sizes = self.acceleration_structure_sizes(input, allow_update);
        let input = match input {
            AccelerationStructureInput::Triangles(geometry) => BuildInput::Triangles(
                geometry
                    .iter()
                    .map(|g| TriangleSnapshot {
                        vertices: Arc::clone(&g.vertex_buffer.0),
                        vertex_offset: g.vertex_offset,
                        vertex_stride: g.vertex_stride,
                        vertex_count: g.vertex_count,
                        vertex_format: g.vertex_format,
                        indices: g
                            .indices
                            .map(|(buffer, offset, ty)| (Arc::clone(&buffer.0), offset, ty)),
                        primitive_count: g.primitive_count,
                    })
                    .collect(),
            ),
            AccelerationStructureInput::Instances { buffer, count } => BuildInput::Instances {
                buffer: Arc::clone(&buffer.0),
                count: *count,
            },
        };
        list.ops.push(Op::BuildAccel {
            dst: Arc::clone(&dst.0),
            input,
            scratch: Arc::clone(&scratch.0),
            scratch_needed: if update {
                sizes.update_scratch_size
            } else {
                sizes.build_scratch_size
            },
            update,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instances_encode_to_64_bytes() {
        let device = HeadlessDevice::open(&Config::headless()).unwrap();
        let mut out = Vec::new();
        device.encode_instance(
            &InstanceRecord {
                transform: [[1.0, 0.0, 0.0, 0.0], [0.0, 1.0, 0.0, 0.0], [0.0, 0.0, 1.0, 0.0]],
                custom_index: 7,
                mask: 0xFF,
                hit_group_offset: 2,
                flags: crate::types::InstanceFlags::FORCE_OPAQUE,
                blas_address: 0xDEAD_BEEF,
            },
            &mut out,
        );
        assert_eq!(out.len() as u64, device.instance_size());
        assert_eq!(u32::from_le_bytes(out[48..52].try_into().unwrap()), 7 | 0xFF << 24);
        assert_eq!(u32::from_le_bytes(out[52..56].try_into().unwrap()), 2 | 4 << 24);
        assert_eq!(u64::from_le_bytes(out[56..64].try_into().unwrap()), 0xDEAD_BEEF);
    }

    #[test]
    fn device_addresses_do_not_overlap() {
        let device = HeadlessDevice::open(&Config::headless()).unwrap();
        let desc = |size| BufferDesc {
            name: "b",
            size,
            usage: BufferUsage::STORAGE_BUFFER,
            residency: crate::types::MemoryResidency::GpuOnly,
        };
        let a = device.create_buffer(&desc(1000)).unwrap();
        let b = device.create_buffer(&desc(10)).unwrap();
        let (a, b) = (a.0.address, b.0.address);
        assert!(a + 1000 <= b);
        assert_eq!(a % ADDRESS_ALIGNMENT, 0);
        assert_eq!(b % ADDRESS_ALIGNMENT, 0);
    }

    #[test]
    fn group_handles_are_distinct_per_group() {
        assert_ne!(group_handle(1, 0), group_handle(1, 1));
        assert_ne!(group_handle(1, 0), group_handle(2, 0));
    }
}
