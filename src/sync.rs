// Synchronization primitives
//
// Fence (CPU waits for GPU) and Semaphore (GPU waits for GPU), both built on
// a monotonic 64-bit counter. The expected value starts at 1 and only grows.

use anyhow::Result;
use std::mem::ManuallyDrop;
use std::sync::Arc;
use std::time::Duration;

use crate::backend::Backend;
use crate::device::Device;

/// Outcome of a host wait. A timeout leaves the GPU work running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStatus {
    Signaled,
    TimedOut,
}

/// Host-observable GPU completion counter
pub struct Fence<B: Backend> {
    device: Arc<B>,
    timeline: ManuallyDrop<B::Timeline>,
    value: u64,
}

impl<B: Backend> Fence<B> {
    pub fn new(device: &Device<B>, name: &str) -> Result<Self> {
        let timeline = device.raw().create_timeline(name, 0)?;
        Ok(Self {
            device: device.shared(),
            timeline: ManuallyDrop::new(timeline),
            value: 1,
        })
    }

    /// Value the next signal will write and `wait` waits for
    pub fn value(&self) -> u64 {
        self.value
    }

    /// Value the GPU has actually reached
    pub fn completed_value(&self) -> Result<u64> {
        self.device.timeline_value(&self.timeline)
    }

    pub fn is_signaled(&self) -> Result<bool> {
        Ok(self.completed_value()? >= self.value)
    }

    /// Block until the expected value is reached or `timeout` runs out.
    ///
    /// Returns immediately when already signaled.
    pub fn wait(&self, timeout: Duration) -> Result<WaitStatus> {
        if self.is_signaled()? {
            return Ok(WaitStatus::Signaled);
        }
        if self.device.wait_timeline(&self.timeline, self.value, timeout)? {
            Ok(WaitStatus::Signaled)
        } else {
            log::debug!("Fence wait for value {} timed out", self.value);
            Ok(WaitStatus::TimedOut)
        }
    }

    /// Arm the fence for its next use
    pub fn reset(&mut self) {
        self.value += 1;
        debug_assert!(
            self.completed_value().map_or(true, |v| v != self.value),
            "fence already at value {} after reset",
            self.value
        );
    }

    /// Target for a queue signal; the value must not have been reached yet
    pub(crate) fn signal_target(&self) -> (&B::Timeline, u64) {
        debug_assert!(
            self.completed_value().map_or(true, |v| v < self.value),
            "fence signaled twice without reset (value {})",
            self.value
        );
        (&self.timeline, self.value)
    }
}

impl<B: Backend> Drop for Fence<B> {
    fn drop(&mut self) {
        // SAFETY: the timeline is not touched again after this point
        let timeline = unsafe { ManuallyDrop::take(&mut self.timeline) };
        self.device.destroy_timeline(timeline);
    }
}

/// GPU-only ordering primitive between queue submissions
pub struct Semaphore<B: Backend> {
    device: Arc<B>,
    timeline: ManuallyDrop<B::Timeline>,
    value: u64,
}

impl<B: Backend> Semaphore<B> {
    pub fn new(device: &Device<B>, name: &str) -> Result<Self> {
        let timeline = device.raw().create_timeline(name, 0)?;
        Ok(Self {
            device: device.shared(),
            timeline: ManuallyDrop::new(timeline),
            value: 1,
        })
    }

    pub fn value(&self) -> u64 {
        self.value
    }

    /// Arm the semaphore for its next signal/wait pair
    pub fn reset(&mut self) {
        self.value += 1;
    }

    pub(crate) fn signal_target(&self) -> (&B::Timeline, u64) {
        debug_assert!(
            self.device
                .timeline_value(&self.timeline)
                .map_or(true, |v| v < self.value),
            "semaphore signaled twice without reset (value {})",
            self.value
        );
        (&self.timeline, self.value)
    }

    pub(crate) fn wait_target(&self) -> (&B::Timeline, u64) {
        (&self.timeline, self.value)
    }
}

impl<B: Backend> Drop for Semaphore<B> {
    fn drop(&mut self) {
        // SAFETY: the timeline is not touched again after this point
        let timeline = unsafe { ManuallyDrop::take(&mut self.timeline) };
        self.device.destroy_timeline(timeline);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::HeadlessDevice;
    use crate::command::CommandPool;
    use crate::config::Config;
    use crate::types::QueueType;

    fn device() -> Device<HeadlessDevice> {
        Device::new(&Config::headless()).unwrap()
    }

    /// Record and submit an empty list on the graphics queue
    fn submit_empty(
        pool: &mut CommandPool<HeadlessDevice>,
        fence: Option<&Fence<HeadlessDevice>>,
        signal: Option<&Semaphore<HeadlessDevice>>,
    ) {
        let cmd = pool.get_command_buffer(QueueType::Graphics).unwrap();
        cmd.begin().unwrap();
        cmd.end().unwrap();
        cmd.submit(fence, None, signal).unwrap();
    }

    #[test]
    fn signaled_fence_stays_signaled_until_reset() {
        let device = device();
        let mut pool = CommandPool::new(&device, "waits");
        let mut fence = Fence::new(&device, "frame").unwrap();
        submit_empty(&mut pool, Some(&fence), None);

        for _ in 0..3 {
            assert_eq!(fence.wait(Duration::ZERO).unwrap(), WaitStatus::Signaled);
        }
        fence.reset();
        assert_eq!(fence.wait(Duration::ZERO).unwrap(), WaitStatus::TimedOut);
    }

    #[test]
    fn semaphore_values_only_grow() {
        let device = device();
        let mut semaphore = Semaphore::new(&device, "ordering").unwrap();
        assert_eq!(semaphore.value(), 1);
        semaphore.reset();
        semaphore.reset();
        assert_eq!(semaphore.value(), 3);
        assert_eq!(semaphore.wait_target().1, 3);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "fence signaled twice without reset")]
    fn fence_signaled_twice_without_reset() {
        let device = device();
        let mut pool = CommandPool::new(&device, "double_signal");
        let fence = Fence::new(&device, "frame").unwrap();
        submit_empty(&mut pool, Some(&fence), None);
        submit_empty(&mut pool, Some(&fence), None);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "after reset")]
    fn reset_onto_a_value_already_reached() {
        let device = device();
        let mut fence = Fence::new(&device, "frame").unwrap();
        // Completion ran ahead of the expected value
        fence.timeline.0.signal(2);
        fence.reset();
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "semaphore signaled twice without reset")]
    fn semaphore_signaled_twice_without_reset() {
        let device = device();
        let mut pool = CommandPool::new(&device, "double_signal");
        let semaphore = Semaphore::new(&device, "ordering").unwrap();
        submit_empty(&mut pool, None, Some(&semaphore));
        submit_empty(&mut pool, None, Some(&semaphore));
    }
}
