// Pipelines built from externally compiled shader binaries
//
// Shader compilation and reflection happen elsewhere; this module only
// receives bytecode per stage plus descriptor binding layouts.

use anyhow::{Context, Result};
use std::mem::ManuallyDrop;
use std::sync::Arc;

use crate::backend::{Backend, PipelineDesc, PipelineKind, SbtRegion, SbtRegions, ShaderGroupInfo};
use crate::descriptor::BindingLayout;
use crate::device::Device;
use crate::resource::Buffer;
use crate::types::{BufferDesc, BufferUsage, MemoryResidency};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineType {
    Graphics,
    Compute,
    RayTracing { miss_count: u32, hit_count: u32 },
}

pub struct Pipeline<B: Backend> {
    device: Arc<B>,
    raw: ManuallyDrop<B::Pipeline>,
    name: String,
    ty: PipelineType,
    push_constant_size: u32,
}

impl<B: Backend> Pipeline<B> {
    pub fn raw(&self) -> &B::Pipeline {
        &self.raw
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pipeline_type(&self) -> PipelineType {
        self.ty
    }

    pub fn push_constant_size(&self) -> u32 {
        self.push_constant_size
    }
}

impl<B: Backend> Drop for Pipeline<B> {
    fn drop(&mut self) {
        // SAFETY: not used after this
        let raw = unsafe { ManuallyDrop::take(&mut self.raw) };
        self.device.destroy_pipeline(raw);
    }
}

impl<B: Backend> Device<B> {
    pub fn create_pipeline(
        &self,
        name: &str,
        binding_layouts: &[&BindingLayout<B>],
        push_constant_size: u32,
        kind: PipelineKind<'_>,
    ) -> Result<Pipeline<B>> {
        let ty = match &kind {
            PipelineKind::Graphics(_) => PipelineType::Graphics,
            PipelineKind::Compute(_) => PipelineType::Compute,
            PipelineKind::RayTracing(desc) => {
                assert!(
                    self.capabilities().ray_tracing,
                    "ray tracing pipeline '{}' on a device without ray tracing",
                    name
                );
                PipelineType::RayTracing {
                    miss_count: desc.miss.len() as u32,
                    hit_count: desc.hit_groups.len() as u32,
                }
            }
        };
        let layouts: Vec<_> = binding_layouts.iter().map(|l| l.raw()).collect();
        let raw = self
            .raw()
            .create_pipeline(&PipelineDesc {
                name,
                binding_layouts: &layouts,
                push_constant_size,
                kind,
            })
            .with_context(|| format!("Failed to create pipeline '{}'", name))?;

        log::debug!("Created {:?} pipeline '{}'", ty, name);
        Ok(Pipeline {
            device: self.shared(),
            raw: ManuallyDrop::new(raw),
            name: name.to_string(),
            ty,
            push_constant_size,
        })
    }
}

fn align_up(value: u64, alignment: u64) -> u64 {
    if alignment <= 1 {
        value
    } else {
        value.div_ceil(alignment) * alignment
    }
}

/// Region layout for raygen, miss and hit groups, relative to an aligned base
pub fn sbt_layout(info: ShaderGroupInfo, miss_count: u32, hit_count: u32) -> SbtRegions {
    let base = info.base_alignment as u64;
    let handle_stride = align_up(info.handle_size as u64, info.handle_alignment as u64);

    let raygen_stride = align_up(handle_stride, base);
    let raygen = SbtRegion {
        offset: 0,
        stride: raygen_stride,
        size: raygen_stride,
    };
    let miss = SbtRegion {
        offset: align_up(raygen.size, base),
        stride: handle_stride,
        size: align_up(miss_count as u64 * handle_stride, base),
    };
    let hit = SbtRegion {
        offset: align_up(miss.offset + miss.size, base),
        stride: handle_stride,
        size: align_up(hit_count as u64 * handle_stride, base),
    };
    SbtRegions { raygen, miss, hit }
}

/// Host-visible buffer of shader group handles for `trace_rays`
pub struct ShaderBindingTable<B: Backend> {
    buffer: Buffer<B>,
    regions: SbtRegions,
}

impl<B: Backend> ShaderBindingTable<B> {
    pub fn new(device: &Device<B>, pipeline: &Pipeline<B>) -> Result<Self> {
        let (miss_count, hit_count) = match pipeline.pipeline_type() {
            PipelineType::RayTracing {
                miss_count,
                hit_count,
            } => (miss_count, hit_count),
            other => panic!("shader binding table for a {:?} pipeline", other),
        };
        let info = device.raw().shader_group_info();
        let handles = device
            .raw()
            .shader_group_handles(pipeline.raw())
            .with_context(|| format!("Failed to read group handles of '{}'", pipeline.name()))?;

        let mut regions = sbt_layout(info, miss_count, hit_count);
        let base = info.base_alignment as u64;
        let total = regions.hit.offset + regions.hit.size;

        // Over-allocate so the table start can be aligned inside the buffer.
        let buffer = device.create_buffer(&BufferDesc {
            name: &format!("{}_sbt", pipeline.name()),
            size: total + base,
            usage: BufferUsage::SHADER_BINDING_TABLE | BufferUsage::TRANSFER_SRC,
            residency: MemoryResidency::CpuToGpu,
        })?;
        let address = buffer.device_address().unwrap_or(0);
        let pad = align_up(address, base) - address;
        for region in [&mut regions.raygen, &mut regions.miss, &mut regions.hit] {
            region.offset += pad;
        }

        let handle_size = info.handle_size as usize;
        let mut data = vec![0u8; (total + base) as usize];
        let mut place = |group: usize, dst: u64| {
            let src = &handles[group * handle_size..(group + 1) * handle_size];
            data[dst as usize..dst as usize + handle_size].copy_from_slice(src);
        };
        place(0, regions.raygen.offset);
        for i in 0..miss_count as usize {
            place(1 + i, regions.miss.offset + i as u64 * regions.miss.stride);
        }
        for i in 0..hit_count as usize {
            place(
                1 + miss_count as usize + i,
                regions.hit.offset + i as u64 * regions.hit.stride,
            );
        }
        buffer.write(0, &data)?;

        Ok(Self { buffer, regions })
    }

    pub fn buffer(&self) -> &Buffer<B> {
        &self.buffer
    }

    pub fn regions(&self) -> &SbtRegions {
        &self.regions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn regions_are_aligned_and_disjoint() {
        let info = ShaderGroupInfo {
            handle_size: 32,
            handle_alignment: 32,
            base_alignment: 64,
        };
        let regions = sbt_layout(info, 2, 3);

        assert_eq!(regions.raygen.offset, 0);
        assert_eq!(regions.raygen.size, regions.raygen.stride);
        for region in [regions.raygen, regions.miss, regions.hit] {
            assert_eq!(region.offset % 64, 0);
        }
        assert!(regions.raygen.offset + regions.raygen.size <= regions.miss.offset);
        assert!(regions.miss.offset + regions.miss.size <= regions.hit.offset);
        assert!(regions.miss.size >= 2 * 32);
        assert!(regions.hit.size >= 3 * 32);
    }

    #[test]
    fn handle_stride_respects_handle_alignment() {
        let info = ShaderGroupInfo {
            handle_size: 20,
            handle_alignment: 32,
            base_alignment: 64,
        };
        let regions = sbt_layout(info, 1, 1);
        assert_eq!(regions.miss.stride, 32);
        assert_eq!(regions.hit.stride, 32);
    }
}
