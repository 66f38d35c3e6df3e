// GPU timestamp queries
//
// A pool must be reset inside a recording before its slots are written.
// The command buffer that writes it flips it back to "not ready" at end().

use anyhow::{Context, Result};
use std::mem::ManuallyDrop;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::backend::Backend;
use crate::device::Device;

pub struct QueryPool<B: Backend> {
    device: Arc<B>,
    raw: ManuallyDrop<B::QueryHeap>,
    name: String,
    capacity: u32,
    ready: AtomicBool,
}

impl<B: Backend> QueryPool<B> {
    pub fn new(device: &Device<B>, name: &str, capacity: u32) -> Result<Arc<Self>> {
        let raw = device
            .raw()
            .create_query_heap(name, capacity)
            .with_context(|| format!("Failed to create query pool '{}'", name))?;
        Ok(Arc::new(Self {
            device: device.shared(),
            raw: ManuallyDrop::new(raw),
            name: name.to_string(),
            capacity,
            ready: AtomicBool::new(false),
        }))
    }

    pub fn raw(&self) -> &B::QueryHeap {
        &self.raw
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// True between a recorded reset and the end of the recording that wrote it
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    pub(crate) fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::Release);
    }

    /// Blocking read of raw 64-bit values. Ticks, not nanoseconds.
    pub fn results(&self, first: u32, count: u32) -> Result<Vec<u64>> {
        if count == 0 {
            return Ok(Vec::new());
        }
        assert!(
            first as u64 + count as u64 <= self.capacity as u64,
            "query range {}..{} outside pool '{}' ({})",
            first,
            first + count,
            self.name,
            self.capacity
        );
        self.device.read_queries(&self.raw, first, count)
    }
}

impl<B: Backend> Drop for QueryPool<B> {
    fn drop(&mut self) {
        // SAFETY: not used after this
        let raw = unsafe { ManuallyDrop::take(&mut self.raw) };
        self.device.destroy_query_heap(raw);
    }
}
