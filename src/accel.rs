// Ray-tracing acceleration structures
//
// Two-phase protocol: ask the driver for worst-case sizes, allocate the
// result buffer and borrow scratch, then record the build into the staging
// manager's command buffer. Nothing runs until submit_all_pending_upload.

use anyhow::{Context, Result};
use glam::Affine3A;
use std::mem::ManuallyDrop;
use std::sync::Arc;

use crate::backend::{
    AccelerationStructureInput, AccelerationStructureLevel, AccelerationStructureSizes, Backend,
    InstanceRecord, TriangleGeometry,
};
use crate::device::Device;
use crate::resource::Buffer;
use crate::staging::StagingManager;
use crate::types::{BufferDesc, BufferUsage, Format, GeometryFlags, IndexType, InstanceFlags, MemoryResidency};

/// Index data for a triangle geometry
pub struct IndexData<'a, B: Backend> {
    pub buffer: &'a Buffer<B>,
    pub offset: u64,
    pub index_type: IndexType,
    pub count: u32,
}

/// Triangle geometry referencing caller-owned vertex/index buffers
pub struct TriangleGeometryDesc<'a, B: Backend> {
    pub vertex_buffer: &'a Buffer<B>,
    pub vertex_offset: u64,
    pub vertex_stride: u64,
    pub vertex_count: u32,
    pub vertex_format: Format,
    pub indices: Option<IndexData<'a, B>>,
    pub flags: GeometryFlags,
}

impl<'a, B: Backend> TriangleGeometryDesc<'a, B> {
    pub fn primitive_count(&self) -> u32 {
        match &self.indices {
            Some(indices) => indices.count / 3,
            None => self.vertex_count / 3,
        }
    }

    fn to_native(&self) -> TriangleGeometry<'a, B> {
        debug_assert!(self
            .vertex_buffer
            .usage()
            .contains(BufferUsage::ACCEL_STRUCTURE_INPUT));
        TriangleGeometry {
            vertex_buffer: self.vertex_buffer.raw(),
            vertex_offset: self.vertex_offset,
            vertex_stride: self.vertex_stride,
            vertex_count: self.vertex_count,
            vertex_format: self.vertex_format,
            indices: self
                .indices
                .as_ref()
                .map(|i| (i.buffer.raw(), i.offset, i.index_type)),
            primitive_count: self.primitive_count(),
            flags: self.flags,
        }
    }
}

fn assert_ray_tracing<B: Backend>(staging: &StagingManager<B>) {
    assert!(
        staging.device().capabilities().ray_tracing,
        "acceleration structures need a ray tracing capable device"
    );
}

/// Result buffer plus native handle, shared by both levels
struct BuiltStructure<B: Backend> {
    device: Arc<B>,
    raw: ManuallyDrop<B::AccelerationStructure>,
    buffer: Buffer<B>,
    sizes: AccelerationStructureSizes,
    address: u64,
    allow_update: bool,
}

impl<B: Backend> BuiltStructure<B> {
    fn build(
        staging: &mut StagingManager<B>,
        name: &str,
        input: &AccelerationStructureInput<'_, B>,
        allow_update: bool,
    ) -> Result<Self> {
        let device = staging.device().clone();
        let sizes = device.raw().acceleration_structure_sizes(input, allow_update);
        let level = input.level();

        let buffer = device.create_buffer(&BufferDesc {
            name,
            size: sizes.structure_size,
            usage: BufferUsage::ACCEL_STRUCTURE_STORAGE,
            residency: MemoryResidency::GpuOnly,
        })?;
        let raw = device
            .raw()
            .create_acceleration_structure(name, level, buffer.raw(), sizes.structure_size)
            .with_context(|| format!("Failed to create acceleration structure '{}'", name))?;
        let address = device.raw().acceleration_structure_address(&raw);

        let built = Self {
            device: device.shared(),
            raw: ManuallyDrop::new(raw),
            buffer,
            sizes,
            address,
            allow_update,
        };
        built.record(staging, input, false)?;

        log::debug!(
            "Recorded {:?} build '{}' ({} bytes, {} scratch)",
            level,
            name,
            sizes.structure_size,
            sizes.build_scratch_size
        );
        Ok(built)
    }

    fn record(
        &self,
        staging: &mut StagingManager<B>,
        input: &AccelerationStructureInput<'_, B>,
        update: bool,
    ) -> Result<()> {
        let scratch_size = if update {
            self.sizes.update_scratch_size
        } else {
            self.sizes.build_scratch_size
        };
        let scratch = staging.get_scratch_buffer(scratch_size.max(1))?;
        let cmd = staging.command_buffer()?;
        cmd.build_acceleration_structure(&self.raw, input, &scratch, self.allow_update, update);
        cmd.buffer_barrier(&self.buffer);
        Ok(())
    }
}

impl<B: Backend> Drop for BuiltStructure<B> {
    fn drop(&mut self) {
        // SAFETY: not used after this
        let raw = unsafe { ManuallyDrop::take(&mut self.raw) };
        self.device.destroy_acceleration_structure(raw);
    }
}

/// Bottom-level structure over triangle geometry
pub struct Blas<B: Backend> {
    inner: BuiltStructure<B>,
}

impl<B: Backend> Blas<B> {
    /// Record a build of `geometries` into the staging recording
    pub fn build(
        staging: &mut StagingManager<B>,
        name: &str,
        geometries: &[TriangleGeometryDesc<'_, B>],
        allow_update: bool,
    ) -> Result<Self> {
        assert_ray_tracing(staging);
        assert!(!geometries.is_empty(), "Blas '{}' without geometry", name);
        let native: Vec<_> = geometries.iter().map(|g| g.to_native()).collect();
        let input = AccelerationStructureInput::Triangles(&native);
        Ok(Self {
            inner: BuiltStructure::build(staging, name, &input, allow_update)?,
        })
    }

    /// Refit in place after vertex positions changed. Topology must match the build.
    pub fn update(
        &self,
        staging: &mut StagingManager<B>,
        geometries: &[TriangleGeometryDesc<'_, B>],
    ) -> Result<()> {
        assert!(self.inner.allow_update, "Blas was not built update-capable");
        let native: Vec<_> = geometries.iter().map(|g| g.to_native()).collect();
        self.inner
            .record(staging, &AccelerationStructureInput::Triangles(&native), true)
    }

    pub fn raw(&self) -> &B::AccelerationStructure {
        &self.inner.raw
    }

    pub fn buffer(&self) -> &Buffer<B> {
        &self.inner.buffer
    }

    pub fn device_address(&self) -> u64 {
        self.inner.address
    }

    pub fn sizes(&self) -> AccelerationStructureSizes {
        self.inner.sizes
    }
}

/// One placement of a Blas in the top-level structure
pub struct TlasInstance<'a, B: Backend> {
    pub blas: &'a Blas<B>,
    pub transform: Affine3A,
    /// 24 bits, visible to shaders
    pub instance_id: u32,
    pub mask: u8,
    /// 24 bits
    pub hit_group_offset: u32,
    pub flags: InstanceFlags,
}

impl<B: Backend> TlasInstance<'_, B> {
    fn to_record(&self) -> InstanceRecord {
        let m = self.transform.matrix3;
        let t = self.transform.translation;
        debug_assert!(self.instance_id < (1 << 24) && self.hit_group_offset < (1 << 24));
        InstanceRecord {
            transform: [
                [m.x_axis.x, m.y_axis.x, m.z_axis.x, t.x],
                [m.x_axis.y, m.y_axis.y, m.z_axis.y, t.y],
                [m.x_axis.z, m.y_axis.z, m.z_axis.z, t.z],
            ],
            custom_index: self.instance_id,
            mask: self.mask,
            hit_group_offset: self.hit_group_offset,
            flags: self.flags,
            blas_address: self.blas.device_address(),
        }
    }
}

/// Top-level structure plus its host-written instance buffer
pub struct Tlas<B: Backend> {
    inner: BuiltStructure<B>,
    instance_buffer: Buffer<B>,
    instance_count: u32,
}

impl<B: Backend> Tlas<B> {
    pub fn build(
        staging: &mut StagingManager<B>,
        name: &str,
        instances: &[TlasInstance<'_, B>],
        allow_update: bool,
    ) -> Result<Self> {
        assert_ray_tracing(staging);
        let device = staging.device().clone();
        let instance_size = device.raw().instance_size();
        let instance_buffer = device.create_buffer(&BufferDesc {
            name: &format!("{}_instances", name),
            size: instance_size * instances.len().max(1) as u64,
            usage: BufferUsage::ACCEL_STRUCTURE_INPUT,
            residency: MemoryResidency::CpuToGpu,
        })?;
        Self::write_instances(&device, &instance_buffer, instances)?;

        let input = AccelerationStructureInput::Instances {
            buffer: instance_buffer.raw(),
            count: instances.len() as u32,
        };
        let inner = BuiltStructure::build(staging, name, &input, allow_update)?;
        Ok(Self {
            inner,
            instance_buffer,
            instance_count: instances.len() as u32,
        })
    }

    /// Rewrite instance data and refit. Submit any batch still reading the
    /// previous instances first.
    pub fn update(&self, staging: &mut StagingManager<B>, instances: &[TlasInstance<'_, B>]) -> Result<()> {
        assert!(self.inner.allow_update, "Tlas was not built update-capable");
        assert_eq!(instances.len() as u32, self.instance_count);
        let device = staging.device().clone();
        Self::write_instances(&device, &self.instance_buffer, instances)?;
        let input = AccelerationStructureInput::Instances {
            buffer: self.instance_buffer.raw(),
            count: self.instance_count,
        };
        self.inner.record(staging, &input, true)
    }

    fn write_instances(
        device: &Device<B>,
        buffer: &Buffer<B>,
        instances: &[TlasInstance<'_, B>],
    ) -> Result<()> {
        let mut bytes = Vec::with_capacity(buffer.size() as usize);
        for instance in instances {
            device.raw().encode_instance(&instance.to_record(), &mut bytes);
        }
        if !bytes.is_empty() {
            buffer.write(0, &bytes)?;
        }
        Ok(())
    }

    pub fn raw(&self) -> &B::AccelerationStructure {
        &self.inner.raw
    }

    pub fn buffer(&self) -> &Buffer<B> {
        &self.inner.buffer
    }

    pub fn instance_buffer(&self) -> &Buffer<B> {
        &self.instance_buffer
    }

    pub fn instance_count(&self) -> u32 {
        self.instance_count
    }

    pub fn device_address(&self) -> u64 {
        self.inner.address
    }

    pub fn level(&self) -> AccelerationStructureLevel {
        AccelerationStructureLevel::Top
    }
}
