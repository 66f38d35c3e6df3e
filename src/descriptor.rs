// Descriptors - heaps, pools, binding layouts and sets
//
// A pool owns one fixed-capacity heap per category. Sets carve contiguous
// slot ranges out of those heaps and hand them back only on pool reset.

use anyhow::{Context, Result};
use std::mem::ManuallyDrop;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::accel::Tlas;
use crate::backend::{Backend, DescriptorResource};
use crate::config::DescriptorConfig;
use crate::device::Device;
use crate::resource::{Buffer, Sampler, Texture};
use crate::types::{DescriptorBinding, DescriptorCategory};

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

/// A contiguous run of descriptor slots in one heap
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorHandle {
    pub category: DescriptorCategory,
    /// Byte offset of the first slot in the heap
    pub offset: u64,
    pub first_slot: u32,
    pub count: u32,
}

/// Linear allocator over one fixed-capacity heap.
///
/// Handles are never reused until `reset`, which invalidates all of them.
#[derive(Debug, Clone)]
pub struct DescriptorAllocator {
    category: DescriptorCategory,
    capacity: u32,
    stride: u32,
    next_slot: u32,
}

impl DescriptorAllocator {
    pub fn new(category: DescriptorCategory, capacity: u32, stride: u32) -> Self {
        Self {
            category,
            capacity,
            stride,
            next_slot: 0,
        }
    }

    pub fn category(&self) -> DescriptorCategory {
        self.category
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn used(&self) -> u32 {
        self.next_slot
    }

    /// Byte offset the next handle will start at
    pub fn offset(&self) -> u64 {
        self.next_slot as u64 * self.stride as u64
    }

    /// Hand out `count` slots. Running out of heap is fatal.
    pub fn request_handle(&mut self, count: u32) -> DescriptorHandle {
        assert!(
            self.next_slot as u64 + count as u64 <= self.capacity as u64,
            "{:?} descriptor heap exhausted: {} + {} > {}",
            self.category,
            self.next_slot,
            count,
            self.capacity
        );
        let handle = DescriptorHandle {
            category: self.category,
            offset: self.offset(),
            first_slot: self.next_slot,
            count,
        };
        self.next_slot += count;
        handle
    }

    pub fn reset(&mut self) {
        self.next_slot = 0;
    }
}

/// Descriptor set layout built from shader reflection data
pub struct BindingLayout<B: Backend> {
    device: Arc<B>,
    raw: ManuallyDrop<B::BindingLayout>,
    bindings: Vec<DescriptorBinding>,
}

impl<B: Backend> BindingLayout<B> {
    pub fn raw(&self) -> &B::BindingLayout {
        &self.raw
    }

    pub fn bindings(&self) -> &[DescriptorBinding] {
        &self.bindings
    }
}

impl<B: Backend> Drop for BindingLayout<B> {
    fn drop(&mut self) {
        // SAFETY: not used after this
        let raw = unsafe { ManuallyDrop::take(&mut self.raw) };
        self.device.destroy_binding_layout(raw);
    }
}

impl<B: Backend> Device<B> {
    pub fn create_binding_layout(
        &self,
        name: &str,
        bindings: &[DescriptorBinding],
    ) -> Result<BindingLayout<B>> {
        let raw = self
            .raw()
            .create_binding_layout(name, bindings)
            .with_context(|| format!("Failed to create binding layout '{}'", name))?;
        Ok(BindingLayout {
            device: self.shared(),
            raw: ManuallyDrop::new(raw),
            bindings: bindings.to_vec(),
        })
    }
}

/// Device-visible descriptor pool with one heap per category.
///
/// Not internally synchronized: one pool per recording thread.
pub struct DescriptorPool<B: Backend> {
    device: Arc<B>,
    raw: ManuallyDrop<B::DescriptorPool>,
    id: u64,
    name: String,
    heaps: Vec<DescriptorAllocator>,
    max_sets: u32,
    allocated_sets: u32,
}

impl<B: Backend> DescriptorPool<B> {
    pub fn new(device: &Device<B>, name: &str, config: &DescriptorConfig) -> Result<Self> {
        let capacities = config.capacities();
        let raw = device
            .raw()
            .create_descriptor_pool(name, &capacities, config.max_sets)
            .with_context(|| format!("Failed to create descriptor pool '{}'", name))?;
        let heaps = DescriptorCategory::ALL
            .iter()
            .map(|&category| {
                DescriptorAllocator::new(
                    category,
                    capacities[category.index()],
                    device.raw().descriptor_stride(category),
                )
            })
            .collect();

        log::info!("Created descriptor pool '{}' {:?}", name, capacities);
        Ok(Self {
            device: device.shared(),
            raw: ManuallyDrop::new(raw),
            id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
            name: name.to_string(),
            heaps,
            max_sets: config.max_sets,
            allocated_sets: 0,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn heap(&self, category: DescriptorCategory) -> &DescriptorAllocator {
        &self.heaps[category.index()]
    }

    /// Allocate a set for `layout`, reserving its slots in each heap
    pub fn allocate_set(&mut self, layout: &BindingLayout<B>) -> Result<DescriptorSet<B>> {
        assert!(
            self.allocated_sets < self.max_sets,
            "descriptor pool '{}' is out of sets ({})",
            self.name,
            self.max_sets
        );
        let slots = layout
            .bindings
            .iter()
            .map(|b| self.heaps[b.category.index()].request_handle(b.count))
            .collect();
        let raw = self
            .device
            .allocate_descriptor_set(&self.raw, &layout.raw)
            .with_context(|| format!("Failed to allocate set from '{}'", self.name))?;
        self.allocated_sets += 1;

        Ok(DescriptorSet {
            device: Arc::clone(&self.device),
            raw,
            pool_id: self.id,
            bindings: layout.bindings.clone(),
            written: vec![false; layout.bindings.len()],
            slots,
            updated: false,
        })
    }

    /// Return every set to the pool. Sets allocated earlier are stale after this.
    pub fn reset(&mut self) -> Result<()> {
        self.device.reset_descriptor_pool(&self.raw)?;
        for heap in &mut self.heaps {
            heap.reset();
        }
        self.allocated_sets = 0;
        Ok(())
    }
}

impl<B: Backend> Drop for DescriptorPool<B> {
    fn drop(&mut self) {
        // SAFETY: not used after this
        let raw = unsafe { ManuallyDrop::take(&mut self.raw) };
        self.device.destroy_descriptor_pool(raw);
    }
}

/// Resource written into one descriptor slot
pub enum DescriptorWrite<'a, B: Backend> {
    Buffer(&'a Buffer<B>),
    BufferRange {
        buffer: &'a Buffer<B>,
        offset: u64,
        size: u64,
    },
    Texture(&'a Texture<B>),
    Sampler(&'a Sampler<B>),
    AccelerationStructure(&'a Tlas<B>),
}

/// A set of descriptor slots from one pool.
///
/// Only bindable after `mark_updated`, once every binding has been written.
pub struct DescriptorSet<B: Backend> {
    device: Arc<B>,
    raw: B::DescriptorSet,
    pool_id: u64,
    bindings: Vec<DescriptorBinding>,
    written: Vec<bool>,
    slots: Vec<DescriptorHandle>,
    updated: bool,
}

impl<B: Backend> DescriptorSet<B> {
    pub fn raw(&self) -> &B::DescriptorSet {
        &self.raw
    }

    pub fn pool_id(&self) -> u64 {
        self.pool_id
    }

    pub fn is_updated(&self) -> bool {
        self.updated
    }

    /// Heap ranges reserved for each binding, in layout order
    pub fn slots(&self) -> &[DescriptorHandle] {
        &self.slots
    }

    pub fn write(&mut self, binding: u32, array_index: u32, resource: DescriptorWrite<'_, B>) {
        let index = self
            .bindings
            .iter()
            .position(|b| b.binding == binding)
            .unwrap_or_else(|| panic!("binding {} is not in this set's layout", binding));
        let layout = self.bindings[index];
        assert!(array_index < layout.count, "array index {} out of range", array_index);

        let native = match resource {
            DescriptorWrite::Buffer(buffer) => {
                debug_assert!(matches!(
                    layout.category,
                    DescriptorCategory::Uniform | DescriptorCategory::Storage
                ));
                DescriptorResource::Buffer {
                    buffer: buffer.raw(),
                    offset: 0,
                    range: buffer.size(),
                }
            }
            DescriptorWrite::BufferRange {
                buffer,
                offset,
                size,
            } => {
                debug_assert!(offset + size <= buffer.size());
                DescriptorResource::Buffer {
                    buffer: buffer.raw(),
                    offset,
                    range: size,
                }
            }
            DescriptorWrite::Texture(texture) => {
                debug_assert_eq!(layout.category, DescriptorCategory::Image);
                DescriptorResource::Texture(texture.raw())
            }
            DescriptorWrite::Sampler(sampler) => {
                debug_assert_eq!(layout.category, DescriptorCategory::Sampler);
                DescriptorResource::Sampler(sampler.raw())
            }
            DescriptorWrite::AccelerationStructure(tlas) => {
                debug_assert_eq!(layout.category, DescriptorCategory::AccelerationStructure);
                DescriptorResource::AccelerationStructure(tlas.raw())
            }
        };

        self.device.write_descriptor(&self.raw, &layout, array_index, native);
        self.written[index] = true;
        self.updated = false;
    }

    /// Declare the set complete and bindable
    pub fn mark_updated(&mut self) {
        debug_assert!(
            self.written.iter().all(|&w| w),
            "descriptor set marked updated with unwritten bindings"
        );
        self.updated = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handles_never_overlap_until_reset() {
        let mut heap = DescriptorAllocator::new(DescriptorCategory::Storage, 64, 32);
        let a = heap.request_handle(4);
        let b = heap.request_handle(10);
        let c = heap.request_handle(1);

        assert_eq!(a.offset, 0);
        assert_eq!(b.offset, 4 * 32);
        assert_eq!(c.offset, 14 * 32);
        assert!(a.first_slot + a.count <= b.first_slot);
        assert!(b.first_slot + b.count <= c.first_slot);
        assert_eq!(heap.used(), 15);
    }

    #[test]
    fn reset_starts_from_zero() {
        let mut heap = DescriptorAllocator::new(DescriptorCategory::Uniform, 8, 16);
        heap.request_handle(5);
        heap.reset();
        let handle = heap.request_handle(3);
        assert_eq!(handle.offset, 0);
        assert_eq!(handle.first_slot, 0);
    }

    #[test]
    fn filling_the_heap_exactly_is_allowed() {
        let mut heap = DescriptorAllocator::new(DescriptorCategory::Sampler, 4, 8);
        heap.request_handle(2);
        heap.request_handle(2);
        assert_eq!(heap.used(), heap.capacity());
    }

    #[test]
    #[should_panic(expected = "descriptor heap exhausted")]
    fn overflowing_the_heap_is_fatal() {
        let mut heap = DescriptorAllocator::new(DescriptorCategory::Image, 4, 8);
        heap.request_handle(3);
        heap.request_handle(2);
    }
}
