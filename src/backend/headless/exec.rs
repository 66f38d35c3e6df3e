// Recorded commands and their execution at submit time

use anyhow::{bail, ensure, Result};
use std::sync::Arc;

use super::resources::{
    AccelContents, AccelStorage, BoundResource, BufferStorage, PipelineClass, PipelineStorage,
    QueryStorage, SetStorage, TextureStorage,
};
use super::{group_handle, HeadlessDevice, INSTANCE_SIZE};
use crate::backend::{AccelerationStructureLevel, BufferCopy, BufferTextureCopy, SbtRegions};
use crate::types::{Format, IndexType};

#[derive(Debug, Clone, Copy)]
pub enum ClearValue {
    Color([f32; 4]),
    Depth(f32),
}

#[derive(Debug, Clone)]
pub struct TriangleSnapshot {
    pub vertices: Arc<BufferStorage>,
    pub vertex_offset: u64,
    pub vertex_stride: u64,
    pub vertex_count: u32,
    pub vertex_format: Format,
    pub indices: Option<(Arc<BufferStorage>, u64, IndexType)>,
    pub primitive_count: u32,
}

#[derive(Debug, Clone)]
pub enum BuildInput {
    Triangles(Vec<TriangleSnapshot>),
    Instances { buffer: Arc<BufferStorage>, count: u32 },
}

#[derive(Debug, Clone)]
pub enum Op {
    Barrier,
    CopyBuffer {
        src: Arc<BufferStorage>,
        dst: Arc<BufferStorage>,
        region: BufferCopy,
    },
    CopyBufferToTexture {
        src: Arc<BufferStorage>,
        dst: Arc<TextureStorage>,
        region: BufferTextureCopy,
    },
    CopyTextureToBuffer {
        src: Arc<TextureStorage>,
        dst: Arc<BufferStorage>,
        region: BufferTextureCopy,
    },
    BeginRendering {
        clears: Vec<(Arc<TextureStorage>, ClearValue)>,
    },
    EndRendering,
    BindPipeline(Arc<PipelineStorage>),
    BindDescriptorSets {
        first_set: u32,
        sets: Vec<Arc<SetStorage>>,
    },
    Draw {
        vertices: u64,
    },
    Dispatch {
        groups: u64,
    },
    TraceRays {
        sbt: Arc<BufferStorage>,
        regions: SbtRegions,
        rays: u64,
    },
    ResetQueries {
        heap: Arc<QueryStorage>,
        first: u32,
        count: u32,
    },
    WriteTimestamp {
        heap: Arc<QueryStorage>,
        index: u32,
    },
    BuildAccel {
        dst: Arc<AccelStorage>,
        input: BuildInput,
        scratch: Arc<BufferStorage>,
        scratch_needed: u64,
        update: bool,
    },
}

/// Bind state while replaying one submission
pub struct Executor<'a> {
    device: &'a HeadlessDevice,
    pipeline: Option<Arc<PipelineStorage>>,
    sets: Vec<Option<Arc<SetStorage>>>,
}

impl<'a> Executor<'a> {
    pub fn new(device: &'a HeadlessDevice) -> Self {
        Self {
            device,
            pipeline: None,
            sets: Vec::new(),
        }
    }

    pub fn run(&mut self, ops: &[Op]) -> Result<()> {
        for op in ops {
            self.execute(op)?;
        }
        Ok(())
    }

    fn execute(&mut self, op: &Op) -> Result<()> {
        let counters = &self.device.counters;
        match op {
            Op::Barrier | Op::EndRendering => {}
            Op::CopyBuffer { src, dst, region } => {
                let (s, d, n) = (
                    region.src_offset as usize,
                    region.dst_offset as usize,
                    region.size as usize,
                );
                if Arc::ptr_eq(src, dst) {
                    dst.data.write().copy_within(s..s + n, d);
                } else {
                    let src_bytes = src.data.read();
                    dst.data.write()[d..d + n].copy_from_slice(&src_bytes[s..s + n]);
                }
                counters.bump(&counters.copies, 1);
            }
            Op::CopyBufferToTexture { src, dst, region } => {
                let offset = region.buffer_offset as usize;
                let src_bytes = src.data.read();
                dst.with_mip(region.mip_level, |texels| {
                    let n = texels.len();
                    texels.copy_from_slice(&src_bytes[offset..offset + n]);
                });
                counters.bump(&counters.copies, 1);
            }
            Op::CopyTextureToBuffer { src, dst, region } => {
                let offset = region.buffer_offset as usize;
                let mut dst_bytes = dst.data.write();
                src.with_mip(region.mip_level, |texels| {
                    dst_bytes[offset..offset + texels.len()].copy_from_slice(texels);
                });
                counters.bump(&counters.copies, 1);
            }
            Op::BeginRendering { clears } => {
                for (texture, value) in clears {
                    let texel = encode_clear(texture.format, *value);
                    texture.with_mip(0, |texels| {
                        for chunk in texels.chunks_exact_mut(texel.len()) {
                            chunk.copy_from_slice(&texel);
                        }
                    });
                }
            }
            Op::BindPipeline(pipeline) => self.pipeline = Some(Arc::clone(pipeline)),
            Op::BindDescriptorSets { first_set, sets } => {
                let end = *first_set as usize + sets.len();
                if self.sets.len() < end {
                    self.sets.resize(end, None);
                }
                for (i, set) in sets.iter().enumerate() {
                    self.sets[*first_set as usize + i] = Some(Arc::clone(set));
                }
            }
            Op::Draw { vertices } => {
                self.require_pipeline(PipelineClass::Graphics, "draw")?;
                counters.bump(&counters.draws, 1);
                counters.bump(&counters.vertices, *vertices);
            }
            Op::Dispatch { groups } => {
                self.require_pipeline(PipelineClass::Compute, "dispatch")?;
                counters.bump(&counters.dispatches, 1);
                counters.bump(&counters.workgroups, *groups);
            }
            Op::TraceRays { sbt, regions, rays } => {
                self.trace_rays(sbt, regions)?;
                counters.bump(&counters.trace_rays, 1);
                counters.bump(&counters.rays, *rays);
            }
            Op::ResetQueries { heap, first, count } => {
                let mut slots = heap.slots.lock();
                for slot in &mut slots[*first as usize..(*first + *count) as usize] {
                    *slot = None;
                }
            }
            Op::WriteTimestamp { heap, index } => {
                heap.slots.lock()[*index as usize] = Some(self.device.now_ticks());
                heap.written.notify_all();
            }
            Op::BuildAccel {
                dst,
                input,
                scratch,
                scratch_needed,
                update,
            } => {
                ensure!(
                    scratch.size() >= *scratch_needed,
                    "scratch '{}' too small for '{}': {} < {}",
                    scratch.name,
                    dst.name,
                    scratch.size(),
                    scratch_needed
                );
                let mut contents = match input {
                    BuildInput::Triangles(geometry) => build_triangles(geometry)?,
                    BuildInput::Instances { buffer, count } => {
                        self.build_instances(buffer, *count)?
                    }
                };
                let mut current = dst.contents.lock();
                if *update {
                    ensure!(current.built, "update of never-built structure '{}'", dst.name);
                }
                contents.built = true;
                contents.builds = current.builds + 1;
                *current = contents;
                write_header(dst, &contents);
                counters.bump(&counters.accel_builds, 1);
            }
        }
        Ok(())
    }

    fn require_pipeline(&self, class: PipelineClass, what: &str) -> Result<&Arc<PipelineStorage>> {
        let Some(pipeline) = &self.pipeline else {
            bail!("{} without a bound pipeline", what);
        };
        let matches = match (class, pipeline.class) {
            (PipelineClass::RayTracing { .. }, PipelineClass::RayTracing { .. }) => true,
            (a, b) => a == b,
        };
        ensure!(matches, "{} with {:?} pipeline '{}'", what, pipeline.class, pipeline.name);
        Ok(pipeline)
    }

    fn trace_rays(&self, sbt: &BufferStorage, regions: &SbtRegions) -> Result<()> {
        let pipeline = self.require_pipeline(PipelineClass::RayTracing { group_count: 0 }, "trace_rays")?;

        let expected = group_handle(pipeline.id, 0);
        let table = sbt.data.read();
        let start = regions.raygen.offset as usize;
        ensure!(
            table.get(start..start + expected.len()) == Some(&expected[..]),
            "shader binding table '{}' does not hold the raygen handle of '{}'",
            sbt.name,
            pipeline.name
        );

        for set in self.sets.iter().take(pipeline.set_count as usize) {
            let Some(set) = set else {
                bail!("trace_rays with an unbound descriptor set on '{}'", pipeline.name);
            };
            for resource in set.entries.lock().values() {
                if let BoundResource::AccelerationStructure(accel) = resource {
                    let contents = accel.contents.lock();
                    ensure!(
                        contents.built && accel.level == AccelerationStructureLevel::Top,
                        "trace_rays against unbuilt or bottom-level structure '{}'",
                        accel.name
                    );
                }
            }
        }
        Ok(())
    }

    fn build_instances(&self, buffer: &BufferStorage, count: u32) -> Result<AccelContents> {
        let bytes = buffer.data.read();
        ensure!(
            bytes.len() as u64 >= count as u64 * INSTANCE_SIZE,
            "instance buffer '{}' holds fewer than {} instances",
            buffer.name,
            count
        );

        let mut contents = AccelContents {
            instance_count: count,
            bounds_min: [f32::MAX; 3],
            bounds_max: [f32::MIN; 3],
            ..Default::default()
        };
        for record in bytes.chunks_exact(INSTANCE_SIZE as usize).take(count as usize) {
            let mut transform = [[0f32; 4]; 3];
            for (i, value) in record[..48].chunks_exact(4).enumerate() {
                transform[i / 4][i % 4] = f32::from_le_bytes(value.try_into()?);
            }
            let address = u64::from_le_bytes(record[56..64].try_into()?);
            let Some(blas) = self.device.lookup_accel(address) else {
                bail!("instance references unknown acceleration structure {:#x}", address);
            };
            let blas = *blas.contents.lock();
            ensure!(blas.built, "instance references a structure that was never built");
            contents.primitive_count += blas.primitive_count;

            for corner in 0..8 {
                let p = [
                    if corner & 1 == 0 { blas.bounds_min[0] } else { blas.bounds_max[0] },
                    if corner & 2 == 0 { blas.bounds_min[1] } else { blas.bounds_max[1] },
                    if corner & 4 == 0 { blas.bounds_min[2] } else { blas.bounds_max[2] },
                ];
                for (axis, row) in transform.iter().enumerate() {
                    let v = row[0] * p[0] + row[1] * p[1] + row[2] * p[2] + row[3];
                    contents.bounds_min[axis] = contents.bounds_min[axis].min(v);
                    contents.bounds_max[axis] = contents.bounds_max[axis].max(v);
                }
            }
        }
        Ok(contents)
    }
}

fn read_position(bytes: &[u8], at: usize, format: Format) -> Result<[f32; 3]> {
    let component = |i: usize| -> Result<f32> {
        let start = at + i * 4;
        let Some(raw) = bytes.get(start..start + 4) else {
            bail!("vertex read past the end of its buffer");
        };
        Ok(f32::from_le_bytes(raw.try_into()?))
    };
    match format {
        Format::Rg32Float => Ok([component(0)?, component(1)?, 0.0]),
        Format::Rgb32Float | Format::Rgba32Float => Ok([component(0)?, component(1)?, component(2)?]),
        other => bail!("unsupported vertex format {:?}", other),
    }
}

fn build_triangles(geometry: &[TriangleSnapshot]) -> Result<AccelContents> {
    let mut contents = AccelContents {
        bounds_min: [f32::MAX; 3],
        bounds_max: [f32::MIN; 3],
        ..Default::default()
    };
    for g in geometry {
        let vertices = g.vertices.data.read();
        for v in 0..g.vertex_count as usize {
            let at = g.vertex_offset as usize + v * g.vertex_stride as usize;
            let p = read_position(&vertices, at, g.vertex_format)?;
            for axis in 0..3 {
                contents.bounds_min[axis] = contents.bounds_min[axis].min(p[axis]);
                contents.bounds_max[axis] = contents.bounds_max[axis].max(p[axis]);
            }
        }

        if let Some((buffer, offset, index_type)) = &g.indices {
            let indices = buffer.data.read();
            let size = index_type.size() as usize;
            let needed = g.primitive_count as usize * 3;
            let start = *offset as usize;
            let Some(raw) = indices.get(start..start + needed * size) else {
                bail!("index data of '{}' is shorter than {} indices", buffer.name, needed);
            };
            for chunk in raw.chunks_exact(size) {
                let index = match index_type {
                    IndexType::U16 => u16::from_le_bytes([chunk[0], chunk[1]]) as u32,
                    IndexType::U32 => u32::from_le_bytes(chunk.try_into()?),
                };
                ensure!(
                    index < g.vertex_count,
                    "index {} out of range for {} vertices",
                    index,
                    g.vertex_count
                );
            }
        }
        contents.primitive_count += g.primitive_count;
    }
    Ok(contents)
}

/// Small summary at the start of the result buffer
fn write_header(dst: &AccelStorage, contents: &AccelContents) {
    let mut header = Vec::with_capacity(40);
    header.extend_from_slice(b"HLAS");
    header.extend_from_slice(&(dst.level as u32).to_le_bytes());
    header.extend_from_slice(&contents.primitive_count.to_le_bytes());
    header.extend_from_slice(&contents.instance_count.to_le_bytes());
    for v in contents.bounds_min.iter().chain(&contents.bounds_max) {
        header.extend_from_slice(&v.to_le_bytes());
    }
    let mut bytes = dst.buffer.data.write();
    let n = header.len().min(bytes.len());
    bytes[..n].copy_from_slice(&header[..n]);
}

/// One texel of `format` holding `value`
pub fn encode_clear(format: Format, value: ClearValue) -> Vec<u8> {
    let unorm = |v: f32| (v.clamp(0.0, 1.0) * 255.0).round() as u8;
    let floats = |n: usize, c: [f32; 4]| -> Vec<u8> { c[..n].iter().flat_map(|v| v.to_le_bytes()).collect() };
    match (format, value) {
        (Format::R8Unorm, ClearValue::Color(c)) => vec![unorm(c[0])],
        (Format::Rg8Unorm, ClearValue::Color(c)) => vec![unorm(c[0]), unorm(c[1])],
        (Format::Rgba8Unorm | Format::Rgba8Srgb, ClearValue::Color(c)) => c.map(unorm).to_vec(),
        (Format::Bgra8Unorm | Format::Bgra8Srgb, ClearValue::Color(c)) => {
            vec![unorm(c[2]), unorm(c[1]), unorm(c[0]), unorm(c[3])]
        }
        (Format::R32Float, ClearValue::Color(c)) => floats(1, c),
        (Format::Rg32Float, ClearValue::Color(c)) => floats(2, c),
        (Format::Rgb32Float, ClearValue::Color(c)) => floats(3, c),
        (Format::Rgba32Float, ClearValue::Color(c)) => floats(4, c),
        (Format::R32Uint, ClearValue::Color(c)) => (c[0] as u32).to_le_bytes().to_vec(),
        (Format::D32Float, ClearValue::Depth(d)) => d.to_le_bytes().to_vec(),
        (Format::D32FloatS8Uint, ClearValue::Depth(d)) => {
            let mut texel = d.to_le_bytes().to_vec();
            texel.extend_from_slice(&[0; 4]);
            texel
        }
        (other, _) => {
            log::trace!("Clearing {:?} to zero", other);
            vec![0; other.texel_size() as usize]
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clear_values_match_texel_size() {
        for format in Format::ALL {
            let value = if format.is_depth() {
                ClearValue::Depth(1.0)
            } else {
                ClearValue::Color([1.0, 0.5, 0.0, 1.0])
            };
            assert_eq!(encode_clear(format, value).len(), format.texel_size() as usize, "{:?}", format);
        }
    }

    #[test]
    fn bgra_swizzles_red_and_blue() {
        let texel = encode_clear(Format::Bgra8Unorm, ClearValue::Color([1.0, 0.0, 0.0, 1.0]));
        assert_eq!(texel, vec![0, 0, 255, 255]);
    }
}
