// Staging / scratch buffer manager
//
// Host->device uploads and acceleration-structure builds all record into one
// dedicated command buffer. Transient buffers are reused at batch
// granularity: `submit_all_pending_upload` drains the GPU and then marks
// every pool entry available again, used in that batch or not.

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;

use crate::backend::Backend;
use crate::command::CommandBuffer;
use crate::config::StagingConfig;
use crate::device::Device;
use crate::resource::{Buffer, Texture};
use crate::sync::{Fence, WaitStatus};
use crate::types::{BufferDesc, BufferUsage, MemoryResidency, QueueType, ResourceState};

struct PoolEntry<B: Backend> {
    buffer: Arc<Buffer<B>>,
    available: bool,
}

/// Which transient pool a request goes to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PoolKind {
    Staging,
    Scratch,
}

pub struct StagingManager<B: Backend> {
    device: Device<B>,
    command_buffer: CommandBuffer<B>,
    staging: Vec<PoolEntry<B>>,
    scratch: Vec<PoolEntry<B>>,
    staging_block_size: u64,
    max_pool_entries: usize,
    batches_submitted: u64,
}

impl<B: Backend> StagingManager<B> {
    pub fn new(device: &Device<B>, config: &StagingConfig) -> Result<Self> {
        let command_buffer = CommandBuffer::new(device, "staging_upload", QueueType::Graphics, 0)?;
        log::info!(
            "Staging manager: {} byte blocks, at most {} per pool",
            config.staging_block_size,
            config.max_pool_entries
        );
        Ok(Self {
            device: device.clone(),
            command_buffer,
            staging: Vec::new(),
            scratch: Vec::new(),
            staging_block_size: config.staging_block_size,
            max_pool_entries: config.max_pool_entries,
            batches_submitted: 0,
        })
    }

    pub fn device(&self) -> &Device<B> {
        &self.device
    }

    /// The upload recording, opened on first use after each submission
    pub fn command_buffer(&mut self) -> Result<&mut CommandBuffer<B>> {
        if !self.command_buffer.is_recording() {
            self.command_buffer.begin()?;
        }
        Ok(&mut self.command_buffer)
    }

    /// Host-visible buffer of at least `min_size` bytes, valid until the
    /// next `submit_all_pending_upload`
    pub fn get_staging_buffer(&mut self, min_size: u64) -> Result<Arc<Buffer<B>>> {
        self.acquire(PoolKind::Staging, min_size)
    }

    /// Device-local build scratch of at least `min_size` bytes, valid until
    /// the next `submit_all_pending_upload`
    pub fn get_scratch_buffer(&mut self, min_size: u64) -> Result<Arc<Buffer<B>>> {
        self.acquire(PoolKind::Scratch, min_size)
    }

    pub fn staging_pool_len(&self) -> usize {
        self.staging.len()
    }

    pub fn scratch_pool_len(&self) -> usize {
        self.scratch.len()
    }

    pub fn available_staging(&self) -> usize {
        self.staging.iter().filter(|e| e.available).count()
    }

    pub fn available_scratch(&self) -> usize {
        self.scratch.iter().filter(|e| e.available).count()
    }

    pub fn batches_submitted(&self) -> u64 {
        self.batches_submitted
    }

    fn acquire(&mut self, kind: PoolKind, min_size: u64) -> Result<Arc<Buffer<B>>> {
        let (pool, max) = match kind {
            PoolKind::Staging => (&mut self.staging, self.max_pool_entries),
            PoolKind::Scratch => (&mut self.scratch, self.max_pool_entries),
        };

        if let Some(entry) = pool
            .iter_mut()
            .find(|e| e.available && e.buffer.size() >= min_size)
        {
            entry.available = false;
            return Ok(Arc::clone(&entry.buffer));
        }

        // At the cap, an idle entry that is too small makes room for a bigger one
        let replaced = if pool.len() < max {
            None
        } else {
            let idle = pool.iter().position(|e| e.available);
            assert!(
                idle.is_some(),
                "{:?} pool exhausted ({} entries in flight); submit pending uploads more often",
                kind,
                pool.len()
            );
            idle
        };

        let index = replaced.unwrap_or(pool.len());
        let name = format!("{:?}_{}", kind, index).to_lowercase();
        let desc = match kind {
            PoolKind::Staging => BufferDesc {
                name: &name,
                size: min_size.max(self.staging_block_size),
                usage: BufferUsage::TRANSFER_SRC,
                residency: MemoryResidency::CpuToGpu,
            },
            PoolKind::Scratch => BufferDesc {
                name: &name,
                size: min_size,
                usage: BufferUsage::STORAGE_BUFFER,
                residency: MemoryResidency::GpuOnly,
            },
        };
        let buffer = Arc::new(self.device.create_buffer(&desc)?);
        let entry = PoolEntry {
            buffer: Arc::clone(&buffer),
            available: false,
        };
        match replaced {
            Some(slot) => {
                log::debug!("{:?} entry {} replaced ({} bytes)", kind, slot, desc.size);
                pool[slot] = entry;
            }
            None => {
                log::debug!("{:?} pool grew to {} ({} bytes)", kind, index + 1, desc.size);
                pool.push(entry);
            }
        }
        Ok(buffer)
    }

    /// Close the upload recording, run it on the graphics queue and block
    /// until it is done; then every staging and scratch entry is available.
    pub fn submit_all_pending_upload(&mut self) -> Result<()> {
        if self.command_buffer.is_recording() {
            self.command_buffer.end()?;
            let fence = Fence::new(&self.device, "staging_upload_fence")?;
            self.command_buffer.submit(Some(&fence), None, None)?;
            if fence.wait(Duration::MAX)? == WaitStatus::TimedOut {
                anyhow::bail!("Upload batch never completed");
            }
            self.command_buffer.reset()?;
            self.batches_submitted += 1;
        }

        for entry in self.staging.iter_mut().chain(self.scratch.iter_mut()) {
            entry.available = true;
        }
        Ok(())
    }

    /// Stage `data` and record a copy into `dst` at `offset`
    pub fn upload_buffer(&mut self, dst: &Buffer<B>, offset: u64, data: &[u8]) -> Result<()> {
        let staging = self.get_staging_buffer(data.len() as u64)?;
        staging.write(0, data)?;
        self.command_buffer()?
            .copy_buffer(&staging, 0, dst, offset, data.len() as u64);
        Ok(())
    }

    /// Stage tightly packed texel bytes for mip 0 and record
    /// `before` -> TransferDst -> copy -> `after`
    pub fn upload_texture(
        &mut self,
        texture: &Texture<B>,
        data: &[u8],
        before: ResourceState,
        after: ResourceState,
    ) -> Result<()> {
        assert_eq!(
            data.len() as u64,
            texture.mip_size(0),
            "pixel data for '{}' does not match its size",
            texture.name()
        );
        let staging = self.get_staging_buffer(data.len() as u64)?;
        staging.write(0, data)?;

        let cmd = self.command_buffer()?;
        cmd.texture_barrier(texture, before, ResourceState::TransferDst);
        cmd.copy_buffer_to_texture(&staging, 0, texture, 0);
        cmd.texture_barrier(texture, ResourceState::TransferDst, after);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::HeadlessDevice;
    use crate::config::Config;

    fn manager(block_size: u64, max_pool_entries: usize) -> StagingManager<HeadlessDevice> {
        let device = Device::new(&Config::headless()).unwrap();
        StagingManager::new(
            &device,
            &StagingConfig {
                staging_block_size: block_size,
                max_pool_entries,
            },
        )
        .unwrap()
    }

    #[test]
    fn first_fit_skips_entries_that_are_too_small() {
        let mut staging = manager(256, 4);
        let small = staging.get_scratch_buffer(100).unwrap();
        let large = staging.get_scratch_buffer(1000).unwrap();
        drop((small, large));
        staging.submit_all_pending_upload().unwrap();

        let fit = staging.get_scratch_buffer(500).unwrap();
        assert_eq!(fit.size(), 1000);
        assert_eq!(staging.scratch_pool_len(), 2);
        assert_eq!(staging.available_scratch(), 1);
    }

    #[test]
    fn idle_entry_is_replaced_at_the_cap() {
        let mut staging = manager(256, 2);
        staging.get_scratch_buffer(100).unwrap();
        staging.get_scratch_buffer(200).unwrap();
        staging.submit_all_pending_upload().unwrap();

        let bigger = staging.get_scratch_buffer(300).unwrap();
        assert_eq!(bigger.size(), 300);
        assert_eq!(staging.scratch_pool_len(), 2);
        assert_eq!(staging.available_scratch(), 1);
    }

    #[test]
    #[should_panic(expected = "Scratch pool exhausted")]
    fn cap_is_fatal_only_with_every_entry_in_flight() {
        let mut staging = manager(256, 2);
        staging.get_scratch_buffer(100).unwrap();
        staging.submit_all_pending_upload().unwrap();
        staging.get_scratch_buffer(100).unwrap();
        staging.get_scratch_buffer(300).unwrap();
        let _ = staging.get_scratch_buffer(400);
    }

    #[test]
    fn submit_frees_entries_never_recorded_into() {
        let mut staging = manager(256, 4);
        let dst = staging
            .device()
            .create_buffer(&BufferDesc {
                name: "dst",
                size: 64,
                usage: BufferUsage::TRANSFER_DST,
                residency: MemoryResidency::GpuOnly,
            })
            .unwrap();
        staging.upload_buffer(&dst, 0, &[1; 64]).unwrap();
        let _unused = staging.get_staging_buffer(16).unwrap();
        assert_eq!(staging.available_staging(), 0);

        staging.submit_all_pending_upload().unwrap();
        assert_eq!(staging.available_staging(), 2);
        assert_eq!(staging.batches_submitted(), 1);
    }
}
