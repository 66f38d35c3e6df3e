// Command recording and pooling
//
// CommandPool keeps a growable list per queue type plus a cursor. Buffers are
// recycled by rewinding the cursor, never freed while the pool lives.

use anyhow::{Context, Result};
use std::mem::ManuallyDrop;
use std::sync::Arc;

use crate::backend::{
    AccelerationStructureInput, Backend, BufferCopy, BufferTextureCopy, ColorAttachment,
    DepthAttachment, RenderingDesc, TextureBarrier,
};
use crate::descriptor::DescriptorSet;
use crate::device::Device;
use crate::pipeline::{Pipeline, ShaderBindingTable};
use crate::query::QueryPool;
use crate::resource::{Buffer, Texture};
use crate::sync::{Fence, Semaphore};
use crate::types::{IndexType, LoadOp, QueueType, ResourceState, TextureUsage};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordState {
    Initial,
    Recording,
    Executable,
}

pub struct ColorTarget<'a, B: Backend> {
    pub texture: &'a Texture<B>,
    pub load: LoadOp,
    pub clear: [f32; 4],
}

pub struct DepthTarget<'a, B: Backend> {
    pub texture: &'a Texture<B>,
    pub load: LoadOp,
    pub clear_depth: f32,
}

/// One native command buffer + allocator, bound to a queue type
pub struct CommandBuffer<B: Backend> {
    device: Arc<B>,
    list: ManuallyDrop<B::CommandList>,
    queue: QueueType,
    name: String,
    index: usize,
    state: RecordState,
    in_render_pass: bool,
    /// Query pools written in this recording; flipped to not-ready at end()
    query_owners: Vec<Arc<QueryPool<B>>>,
}

impl<B: Backend> CommandBuffer<B> {
    pub(crate) fn new(device: &Device<B>, name: &str, queue: QueueType, index: usize) -> Result<Self> {
        let list = device
            .raw()
            .create_command_list(name, queue)
            .with_context(|| format!("Failed to create command buffer '{}'", name))?;
        Ok(Self {
            device: device.shared(),
            list: ManuallyDrop::new(list),
            queue,
            name: name.to_string(),
            index,
            state: RecordState::Initial,
            in_render_pass: false,
            query_owners: Vec::new(),
        })
    }

    pub fn raw(&self) -> &B::CommandList {
        &self.list
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn queue_type(&self) -> QueueType {
        self.queue
    }

    /// Position of this buffer in its pool list
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn state(&self) -> RecordState {
        self.state
    }

    pub fn is_recording(&self) -> bool {
        self.state == RecordState::Recording
    }

    pub fn begin(&mut self) -> Result<()> {
        debug_assert_ne!(self.state, RecordState::Recording, "'{}' already recording", self.name);
        self.device.begin_command_list(&mut self.list)?;
        self.state = RecordState::Recording;
        Ok(())
    }

    pub fn end(&mut self) -> Result<()> {
        debug_assert_eq!(self.state, RecordState::Recording);
        debug_assert!(!self.in_render_pass, "'{}' ended inside a render pass", self.name);
        self.device.end_command_list(&mut self.list)?;
        for pool in self.query_owners.drain(..) {
            pool.set_ready(false);
        }
        self.state = RecordState::Executable;
        Ok(())
    }

    /// Native list/allocator reset; the buffer can be recorded again
    pub fn reset(&mut self) -> Result<()> {
        self.device.reset_command_list(&mut self.list)?;
        for pool in self.query_owners.drain(..) {
            pool.set_ready(false);
        }
        self.state = RecordState::Initial;
        self.in_render_pass = false;
        Ok(())
    }

    /// Execute on this buffer's queue. Returns once the work is queued.
    ///
    /// `wait` delays execution until the semaphore reaches its value;
    /// `fence` and `signal` are signaled to their values on completion.
    pub fn submit(
        &mut self,
        fence: Option<&Fence<B>>,
        wait: Option<&Semaphore<B>>,
        signal: Option<&Semaphore<B>>,
    ) -> Result<()> {
        debug_assert_eq!(self.state, RecordState::Executable, "'{}' submitted unfinished", self.name);

        let waits: Vec<_> = wait.map(|s| s.wait_target()).into_iter().collect();
        let mut signals = Vec::with_capacity(2);
        if let Some(fence) = fence {
            signals.push(fence.signal_target());
        }
        if let Some(semaphore) = signal {
            signals.push(semaphore.signal_target());
        }

        self.device
            .submit(self.queue, &self.list, &waits, &signals)
            .with_context(|| format!("Failed to submit '{}'", self.name))
    }

    // -- barriers and copies -------------------------------------------------

    /// Transition `texture` from `before` to `after`. `before` must be the
    /// state it is really in; nothing checks that in release builds.
    pub fn texture_barrier(&mut self, texture: &Texture<B>, before: ResourceState, after: ResourceState) {
        self.texture_barriers(&[texture.barrier(before, after)]);
    }

    pub fn texture_barriers(&mut self, barriers: &[TextureBarrier<'_, B>]) {
        self.debug_assert_recording();
        self.device.cmd_texture_barriers(&mut self.list, barriers);
    }

    /// Make prior writes to `buffer` visible to later reads and writes
    pub fn buffer_barrier(&mut self, buffer: &Buffer<B>) {
        self.debug_assert_recording();
        self.device.cmd_buffer_barrier(&mut self.list, buffer.raw());
    }

    pub fn copy_buffer(
        &mut self,
        src: &Buffer<B>,
        src_offset: u64,
        dst: &Buffer<B>,
        dst_offset: u64,
        size: u64,
    ) {
        self.debug_assert_recording();
        assert!(src_offset + size <= src.size(), "copy overruns '{}'", src.name());
        assert!(dst_offset + size <= dst.size(), "copy overruns '{}'", dst.name());
        self.device.cmd_copy_buffer(
            &mut self.list,
            src.raw(),
            dst.raw(),
            BufferCopy {
                src_offset,
                dst_offset,
                size,
            },
        );
    }

    /// Copy one tightly packed mip level; `dst` must be in TransferDst
    pub fn copy_buffer_to_texture(
        &mut self,
        src: &Buffer<B>,
        buffer_offset: u64,
        dst: &Texture<B>,
        mip_level: u32,
    ) {
        self.debug_assert_recording();
        assert!(buffer_offset + dst.mip_size(mip_level) <= src.size());
        self.device.cmd_copy_buffer_to_texture(
            &mut self.list,
            src.raw(),
            dst.raw(),
            BufferTextureCopy {
                buffer_offset,
                mip_level,
            },
        );
    }

    /// Copy one mip level out; `src` must be in TransferSrc
    pub fn copy_texture_to_buffer(
        &mut self,
        src: &Texture<B>,
        mip_level: u32,
        dst: &Buffer<B>,
        buffer_offset: u64,
    ) {
        self.debug_assert_recording();
        assert!(buffer_offset + src.mip_size(mip_level) <= dst.size());
        self.device.cmd_copy_texture_to_buffer(
            &mut self.list,
            src.raw(),
            dst.raw(),
            BufferTextureCopy {
                buffer_offset,
                mip_level,
            },
        );
    }

    // -- rendering -----------------------------------------------------------

    /// Begin rendering into attachments already in ColorAttachment/DepthAttachment
    pub fn begin_render_pass(&mut self, colors: &[ColorTarget<'_, B>], depth: Option<DepthTarget<'_, B>>) {
        self.debug_assert_recording();
        debug_assert!(!self.in_render_pass);
        let extent = colors
            .first()
            .map(|c| c.texture.extent())
            .or_else(|| depth.as_ref().map(|d| d.texture.extent()))
            .expect("render pass without attachments");
        debug_assert!(colors
            .iter()
            .all(|c| c.texture.usage().contains(TextureUsage::COLOR_ATTACHMENT)));
        debug_assert!(depth
            .as_ref()
            .map_or(true, |d| d.texture.usage().contains(TextureUsage::DEPTH_ATTACHMENT)));

        let color_attachments: Vec<_> = colors
            .iter()
            .map(|c| ColorAttachment {
                texture: c.texture.raw(),
                load: c.load,
                clear: c.clear,
            })
            .collect();
        let desc = RenderingDesc {
            width: extent.width,
            height: extent.height,
            colors: &color_attachments,
            depth: depth.map(|d| DepthAttachment {
                texture: d.texture.raw(),
                load: d.load,
                clear_depth: d.clear_depth,
            }),
        };
        self.device.cmd_begin_rendering(&mut self.list, &desc);
        self.in_render_pass = true;
    }

    pub fn end_render_pass(&mut self) {
        debug_assert!(self.in_render_pass, "end_render_pass without begin");
        self.device.cmd_end_rendering(&mut self.list);
        self.in_render_pass = false;
    }

    pub fn set_viewport(&mut self, x: f32, y: f32, width: f32, height: f32) {
        self.device.cmd_set_viewport(&mut self.list, x, y, width, height);
    }

    pub fn set_scissor(&mut self, x: i32, y: i32, width: u32, height: u32) {
        self.device.cmd_set_scissor(&mut self.list, x, y, width, height);
    }

    // -- binding -------------------------------------------------------------

    pub fn bind_pipeline(&mut self, pipeline: &Pipeline<B>) {
        self.debug_assert_recording();
        self.device.cmd_bind_pipeline(&mut self.list, pipeline.raw());
    }

    /// Bind sets starting at `first_set`. All sets must come from one pool
    /// and be marked updated.
    pub fn bind_descriptor_sets(&mut self, pipeline: &Pipeline<B>, first_set: u32, sets: &[&DescriptorSet<B>]) {
        self.debug_assert_recording();
        debug_assert!(
            sets.windows(2).all(|w| w[0].pool_id() == w[1].pool_id()),
            "descriptor sets bound together must share a pool"
        );
        debug_assert!(
            sets.iter().all(|s| s.is_updated()),
            "binding a descriptor set that was not marked updated"
        );
        let raw: Vec<_> = sets.iter().map(|s| s.raw()).collect();
        self.device
            .cmd_bind_descriptor_sets(&mut self.list, pipeline.raw(), first_set, &raw);
    }

    pub fn push_constants(&mut self, pipeline: &Pipeline<B>, offset: u32, data: &[u8]) {
        debug_assert!(offset as usize + data.len() <= pipeline.push_constant_size() as usize);
        self.device
            .cmd_push_constants(&mut self.list, pipeline.raw(), offset, data);
    }

    pub fn bind_vertex_buffers(&mut self, first_binding: u32, buffers: &[(&Buffer<B>, u64)]) {
        let raw: Vec<_> = buffers.iter().map(|(b, offset)| (b.raw(), *offset)).collect();
        self.device
            .cmd_bind_vertex_buffers(&mut self.list, first_binding, &raw);
    }

    pub fn bind_index_buffer(&mut self, buffer: &Buffer<B>, offset: u64, index_type: IndexType) {
        self.device
            .cmd_bind_index_buffer(&mut self.list, buffer.raw(), offset, index_type);
    }

    // -- work ----------------------------------------------------------------

    pub fn draw(&mut self, vertex_count: u32, instance_count: u32, first_vertex: u32, first_instance: u32) {
        debug_assert!(self.in_render_pass, "draw outside a render pass");
        self.device.cmd_draw(
            &mut self.list,
            vertex_count,
            instance_count,
            first_vertex,
            first_instance,
        );
    }

    pub fn draw_indexed(
        &mut self,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    ) {
        debug_assert!(self.in_render_pass, "draw outside a render pass");
        self.device.cmd_draw_indexed(
            &mut self.list,
            index_count,
            instance_count,
            first_index,
            vertex_offset,
            first_instance,
        );
    }

    pub fn dispatch(&mut self, x: u32, y: u32, z: u32) {
        debug_assert!(!self.in_render_pass);
        self.device.cmd_dispatch(&mut self.list, x, y, z);
    }

    /// Launch a ray-tracing pipeline bound earlier with `bind_pipeline`
    pub fn trace_rays(&mut self, sbt: &ShaderBindingTable<B>, width: u32, height: u32, depth: u32) {
        self.debug_assert_recording();
        self.device.cmd_trace_rays(
            &mut self.list,
            sbt.buffer().raw(),
            sbt.regions(),
            width,
            height,
            depth,
        );
    }

    // -- queries -------------------------------------------------------------

    /// Reset every slot of `pool`; required before writing it in this recording
    pub fn reset_query_pool(&mut self, pool: &Arc<QueryPool<B>>) {
        self.debug_assert_recording();
        self.device
            .cmd_reset_queries(&mut self.list, pool.raw(), 0, pool.capacity());
        pool.set_ready(true);
    }

    pub fn write_timestamp(&mut self, pool: &Arc<QueryPool<B>>, index: u32) {
        self.debug_assert_recording();
        debug_assert!(pool.is_ready(), "query pool '{}' written before reset", pool.name());
        assert!(index < pool.capacity(), "timestamp index {} out of range", index);
        self.device.cmd_write_timestamp(&mut self.list, pool.raw(), index);
        if !self.query_owners.iter().any(|p| Arc::ptr_eq(p, pool)) {
            self.query_owners.push(Arc::clone(pool));
        }
    }

    // -- acceleration structures ---------------------------------------------

    pub(crate) fn build_acceleration_structure(
        &mut self,
        dst: &B::AccelerationStructure,
        input: &AccelerationStructureInput<'_, B>,
        scratch: &Buffer<B>,
        allow_update: bool,
        update: bool,
    ) {
        self.debug_assert_recording();
        self.device.cmd_build_acceleration_structure(
            &mut self.list,
            dst,
            input,
            scratch.raw(),
            allow_update,
            update,
        );
    }

    fn debug_assert_recording(&self) {
        debug_assert_eq!(
            self.state,
            RecordState::Recording,
            "'{}' is not recording",
            self.name
        );
    }
}

impl<B: Backend> Drop for CommandBuffer<B> {
    fn drop(&mut self) {
        // SAFETY: not used after this
        let list = unsafe { ManuallyDrop::take(&mut self.list) };
        self.device.destroy_command_list(list);
    }
}

/// Recycling command buffer pool, one list and cursor per queue type.
///
/// Not internally synchronized: one pool per recording thread.
pub struct CommandPool<B: Backend> {
    device: Device<B>,
    name: String,
    lists: [Vec<CommandBuffer<B>>; 3],
    cursors: [usize; 3],
}

impl<B: Backend> CommandPool<B> {
    pub fn new(device: &Device<B>, name: &str) -> Self {
        Self {
            device: device.clone(),
            name: name.to_string(),
            lists: [Vec::new(), Vec::new(), Vec::new()],
            cursors: [0; 3],
        }
    }

    /// Next free buffer for `queue`; allocates only when every existing
    /// buffer has been handed out since the last reset.
    pub fn get_command_buffer(&mut self, queue: QueueType) -> Result<&mut CommandBuffer<B>> {
        let q = queue.index();
        let cursor = self.cursors[q];
        if cursor == self.lists[q].len() {
            let name = format!("{}_{:?}_{}", self.name, queue, cursor);
            let buffer = CommandBuffer::new(&self.device, &name, queue, cursor)?;
            log::debug!("Command pool '{}' grew to {} {:?} buffers", self.name, cursor + 1, queue);
            self.lists[q].push(buffer);
        }
        self.cursors[q] = cursor + 1;
        Ok(&mut self.lists[q][cursor])
    }

    /// Reset every buffer handed out since the last reset and rewind.
    /// The lists never shrink.
    pub fn reset(&mut self) -> Result<()> {
        for q in 0..3 {
            let cursor = self.cursors[q];
            for buffer in &mut self.lists[q][..cursor] {
                buffer.reset()?;
            }
            self.cursors[q] = 0;
        }
        Ok(())
    }

    /// Number of buffers ever allocated for `queue`
    pub fn len(&self, queue: QueueType) -> usize {
        self.lists[queue.index()].len()
    }

    pub fn is_empty(&self) -> bool {
        self.lists.iter().all(Vec::is_empty)
    }

    /// Buffers handed out for `queue` since the last reset
    pub fn in_use(&self, queue: QueueType) -> usize {
        self.cursors[queue.index()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::HeadlessDevice;
    use crate::config::Config;

    fn device() -> Device<HeadlessDevice> {
        Device::new(&Config::headless()).unwrap()
    }

    #[test]
    fn reset_recycles_without_growing() {
        let device = device();
        let mut pool = CommandPool::new(&device, "frame");

        let first = pool.get_command_buffer(QueueType::Graphics).unwrap().index();
        pool.reset().unwrap();
        let again = pool.get_command_buffer(QueueType::Graphics).unwrap().index();

        assert_eq!(first, again);
        assert_eq!(pool.len(QueueType::Graphics), 1);
    }

    #[test]
    fn grows_only_when_cursor_reaches_end() {
        let device = device();
        let mut pool = CommandPool::new(&device, "frame");

        for expected in 0..3 {
            let cmd = pool.get_command_buffer(QueueType::Compute).unwrap();
            assert_eq!(cmd.index(), expected);
        }
        assert_eq!(pool.len(QueueType::Compute), 3);
        assert_eq!(pool.len(QueueType::Graphics), 0);

        pool.reset().unwrap();
        assert_eq!(pool.in_use(QueueType::Compute), 0);
        pool.get_command_buffer(QueueType::Compute).unwrap();
        pool.get_command_buffer(QueueType::Compute).unwrap();
        assert_eq!(pool.len(QueueType::Compute), 3);
    }

    #[test]
    fn reset_returns_buffers_to_initial_state() {
        let device = device();
        let mut pool = CommandPool::new(&device, "frame");
        {
            let cmd = pool.get_command_buffer(QueueType::Transfer).unwrap();
            cmd.begin().unwrap();
            cmd.end().unwrap();
            assert_eq!(cmd.state(), RecordState::Executable);
        }
        pool.reset().unwrap();
        let cmd = pool.get_command_buffer(QueueType::Transfer).unwrap();
        assert_eq!(cmd.state(), RecordState::Initial);
    }

    #[test]
    fn queue_types_have_independent_cursors() {
        let device = device();
        let mut pool = CommandPool::new(&device, "frame");
        pool.get_command_buffer(QueueType::Graphics).unwrap();
        let cmd = pool.get_command_buffer(QueueType::Transfer).unwrap();
        assert_eq!(cmd.index(), 0);
        assert_eq!(cmd.queue_type(), QueueType::Transfer);
    }
}
