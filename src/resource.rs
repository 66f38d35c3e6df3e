// Resource factory - buffers, textures, samplers, aliasable memory
//
// Every wrapper owns its native object and releases it on drop, on every
// exit path. The device outlives them through a shared handle.

use anyhow::{Context, Result};
use std::mem::ManuallyDrop;
use std::sync::Arc;

use crate::backend::{Backend, TextureBarrier};
use crate::device::Device;
use crate::types::{
    BufferDesc, BufferUsage, Extent3d, Format, MemoryResidency, QueueType, ResourceState,
    SamplerDesc, TextureDesc, TextureUsage,
};

/// GPU buffer with its size, usage and optional device address
pub struct Buffer<B: Backend> {
    device: Arc<B>,
    raw: ManuallyDrop<B::Buffer>,
    name: String,
    size: u64,
    usage: BufferUsage,
    residency: MemoryResidency,
    device_address: Option<u64>,
}

impl<B: Backend> Buffer<B> {
    pub fn raw(&self) -> &B::Buffer {
        &self.raw
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn usage(&self) -> BufferUsage {
        self.usage
    }

    pub fn residency(&self) -> MemoryResidency {
        self.residency
    }

    /// Present only when the usage needs one and the device supports it
    pub fn device_address(&self) -> Option<u64> {
        self.device_address
    }

    /// Copy `data` into the mapped buffer at `offset`
    pub fn write(&self, offset: u64, data: &[u8]) -> Result<()> {
        assert!(
            self.residency.is_host_visible(),
            "buffer '{}' is not host visible",
            self.name
        );
        assert!(
            offset + data.len() as u64 <= self.size,
            "write of {} bytes at {} overruns buffer '{}' ({} bytes)",
            data.len(),
            offset,
            self.name,
            self.size
        );
        self.device.write_buffer(&self.raw, offset, data)
    }

    /// Typed convenience over `write`
    pub fn write_pod<T: bytemuck::Pod>(&self, offset: u64, data: &[T]) -> Result<()> {
        self.write(offset, bytemuck::cast_slice(data))
    }

    /// Copy mapped bytes starting at `offset` into `out`
    pub fn read(&self, offset: u64, out: &mut [u8]) -> Result<()> {
        assert!(
            self.residency.is_host_visible(),
            "buffer '{}' is not host visible",
            self.name
        );
        assert!(offset + out.len() as u64 <= self.size);
        self.device.read_buffer(&self.raw, offset, out)
    }

    pub fn read_to_vec(&self) -> Result<Vec<u8>> {
        let mut out = vec![0u8; self.size as usize];
        self.read(0, &mut out)?;
        Ok(out)
    }
}

impl<B: Backend> Drop for Buffer<B> {
    fn drop(&mut self) {
        // SAFETY: not used after this
        let raw = unsafe { ManuallyDrop::take(&mut self.raw) };
        self.device.destroy_buffer(raw);
    }
}

impl<B: Backend> std::fmt::Debug for Buffer<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("name", &self.name)
            .field("size", &self.size)
            .field("usage", &self.usage)
            .field("residency", &self.residency)
            .finish()
    }
}

/// How a texture's memory came to be
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextureOrigin {
    /// Swapchain image owned elsewhere; only views are ours
    Backbuffer,
    Owned,
    /// Bound into caller-supplied memory at an offset
    Placed { offset: u64 },
}

/// Image plus views. The current state is the caller's to remember.
pub struct Texture<B: Backend> {
    device: Arc<B>,
    raw: ManuallyDrop<B::Texture>,
    name: String,
    extent: Extent3d,
    format: Format,
    usage: TextureUsage,
    mip_levels: u32,
    origin: TextureOrigin,
}

impl<B: Backend> Texture<B> {
    pub fn raw(&self) -> &B::Texture {
        &self.raw
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn extent(&self) -> Extent3d {
        self.extent
    }

    pub fn format(&self) -> Format {
        self.format
    }

    pub fn usage(&self) -> TextureUsage {
        self.usage
    }

    pub fn mip_levels(&self) -> u32 {
        self.mip_levels
    }

    pub fn origin(&self) -> TextureOrigin {
        self.origin
    }

    /// Bytes for one tightly packed mip level
    pub fn mip_size(&self, mip_level: u32) -> u64 {
        let w = (self.extent.width >> mip_level).max(1) as u64;
        let h = (self.extent.height >> mip_level).max(1) as u64;
        let d = (self.extent.depth >> mip_level).max(1) as u64;
        w * h * d * self.format.texel_size() as u64
    }

    pub fn barrier(&self, before: ResourceState, after: ResourceState) -> TextureBarrier<'_, B> {
        TextureBarrier {
            texture: &self.raw,
            before,
            after,
        }
    }
}

impl<B: Backend> Drop for Texture<B> {
    fn drop(&mut self) {
        // SAFETY: not used after this
        let raw = unsafe { ManuallyDrop::take(&mut self.raw) };
        self.device.destroy_texture(raw);
    }
}

impl<B: Backend> std::fmt::Debug for Texture<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Texture")
            .field("name", &self.name)
            .field("extent", &self.extent)
            .field("format", &self.format)
            .field("origin", &self.origin)
            .finish()
    }
}

pub struct Sampler<B: Backend> {
    device: Arc<B>,
    raw: ManuallyDrop<B::Sampler>,
}

impl<B: Backend> Sampler<B> {
    pub fn raw(&self) -> &B::Sampler {
        &self.raw
    }
}

impl<B: Backend> Drop for Sampler<B> {
    fn drop(&mut self) {
        // SAFETY: not used after this
        let raw = unsafe { ManuallyDrop::take(&mut self.raw) };
        self.device.destroy_sampler(raw);
    }
}

/// Device-local memory block for placing aliased textures
pub struct AliasedMemory<B: Backend> {
    device: Arc<B>,
    raw: ManuallyDrop<B::Memory>,
    size: u64,
}

impl<B: Backend> AliasedMemory<B> {
    pub fn size(&self) -> u64 {
        self.size
    }
}

impl<B: Backend> Drop for AliasedMemory<B> {
    fn drop(&mut self) {
        // SAFETY: not used after this
        let raw = unsafe { ManuallyDrop::take(&mut self.raw) };
        self.device.destroy_memory(raw);
    }
}

impl<B: Backend> Device<B> {
    pub fn create_buffer(&self, desc: &BufferDesc) -> Result<Buffer<B>> {
        assert!(desc.size > 0, "buffer '{}' has zero size", desc.name);
        let raw = self
            .raw()
            .create_buffer(desc)
            .with_context(|| format!("Failed to create buffer '{}'", desc.name))?;
        let device_address = if desc.usage.needs_device_address() {
            self.raw().buffer_device_address(&raw)
        } else {
            None
        };
        log::debug!(
            "Created buffer '{}' ({} bytes, {:?}, {:?})",
            desc.name,
            desc.size,
            desc.usage,
            desc.residency
        );
        Ok(Buffer {
            device: self.shared(),
            raw: ManuallyDrop::new(raw),
            name: desc.name.to_string(),
            size: desc.size,
            usage: desc.usage,
            residency: desc.residency,
            device_address,
        })
    }

    /// Create a host-visible buffer already holding `data`
    pub fn create_buffer_with_data(
        &self,
        name: &str,
        usage: BufferUsage,
        data: &[u8],
    ) -> Result<Buffer<B>> {
        let buffer = self.create_buffer(&BufferDesc {
            name,
            size: data.len() as u64,
            usage,
            residency: MemoryResidency::CpuToGpu,
        })?;
        buffer.write(0, data)?;
        Ok(buffer)
    }

    /// Owned texture, transitioned into `desc.initial_state` before returning
    pub fn create_texture(&self, desc: &TextureDesc) -> Result<Texture<B>> {
        let raw = self
            .raw()
            .create_texture(desc, None)
            .with_context(|| format!("Failed to create texture '{}'", desc.name))?;
        self.finish_texture(desc, raw, TextureOrigin::Owned)
    }

    /// Texture bound into `memory` at `offset` bytes. Several placed textures
    /// may overlap; only one of them holds meaningful contents at a time.
    pub fn create_placed_texture(
        &self,
        desc: &TextureDesc,
        memory: &AliasedMemory<B>,
        offset: u64,
    ) -> Result<Texture<B>> {
        assert!(offset < memory.size, "placement offset outside memory block");
        let raw = self
            .raw()
            .create_texture(desc, Some((&memory.raw, offset)))
            .with_context(|| format!("Failed to place texture '{}'", desc.name))?;
        self.finish_texture(desc, raw, TextureOrigin::Placed { offset })
    }

    /// View-only texture over an image someone else allocated
    pub fn wrap_backbuffer(
        &self,
        name: &str,
        image: B::ExternalImage,
        extent: Extent3d,
        format: Format,
    ) -> Result<Texture<B>> {
        let raw = self
            .raw()
            .wrap_external_image(name, image, extent, format)
            .with_context(|| format!("Failed to wrap backbuffer '{}'", name))?;
        Ok(Texture {
            device: self.shared(),
            raw: ManuallyDrop::new(raw),
            name: name.to_string(),
            extent,
            format,
            usage: TextureUsage::COLOR_ATTACHMENT | TextureUsage::TRANSFER_DST,
            mip_levels: 1,
            origin: TextureOrigin::Backbuffer,
        })
    }

    pub fn create_aliased_memory(&self, name: &str, size: u64) -> Result<AliasedMemory<B>> {
        let raw = self
            .raw()
            .create_memory(name, size)
            .with_context(|| format!("Failed to allocate memory block '{}'", name))?;
        Ok(AliasedMemory {
            device: self.shared(),
            raw: ManuallyDrop::new(raw),
            size,
        })
    }

    pub fn create_sampler(&self, desc: &SamplerDesc) -> Result<Sampler<B>> {
        let raw = self
            .raw()
            .create_sampler(desc)
            .with_context(|| format!("Failed to create sampler '{}'", desc.name))?;
        Ok(Sampler {
            device: self.shared(),
            raw: ManuallyDrop::new(raw),
        })
    }

    fn finish_texture(
        &self,
        desc: &TextureDesc,
        raw: B::Texture,
        origin: TextureOrigin,
    ) -> Result<Texture<B>> {
        let texture = Texture {
            device: self.shared(),
            raw: ManuallyDrop::new(raw),
            name: desc.name.to_string(),
            extent: desc.extent,
            format: desc.format,
            usage: desc.usage,
            mip_levels: desc.mip_levels.max(1),
            origin,
        };

        if desc.initial_state != ResourceState::None {
            self.one_time_command_submit(QueueType::Graphics, |cmd| {
                cmd.texture_barrier(&texture, ResourceState::None, desc.initial_state);
            })?;
        }

        log::debug!(
            "Created texture '{}' {}x{}x{} {:?} ({:?})",
            desc.name,
            desc.extent.width,
            desc.extent.height,
            desc.extent.depth,
            desc.format,
            origin
        );
        Ok(texture)
    }
}
