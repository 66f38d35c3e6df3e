// Device - the one object everything else borrows
//
// Responsibilities:
// - Open the configured backend once
// - Queue retrieval by type, capability flags, timestamp period
// - One-shot command submission for internal initial transitions

use anyhow::{Context, Result};
use bitflags::bitflags;
use std::sync::Arc;
use std::time::Duration;

use crate::backend::{Backend, Capabilities, ClockCalibration};
use crate::command::CommandBuffer;
use crate::config::Config;
use crate::sync::{Fence, WaitStatus};
use crate::types::QueueType;

bitflags! {
    /// What a queue family can do, in portable terms
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct QueueCaps: u32 {
        const GRAPHICS = 1 << 0;
        const COMPUTE = 1 << 1;
        const TRANSFER = 1 << 2;
    }
}

/// Queue family as reported by the adapter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFamilyInfo {
    pub caps: QueueCaps,
    pub queue_count: u32,
}

/// Pick graphics, compute and transfer families.
///
/// Graphics must also present; without one there is no usable device.
/// Compute prefers a family without graphics. Transfer prefers one with
/// neither graphics nor compute, then one without graphics. Both fall back
/// to the graphics family.
pub fn select_queue_families(
    families: &[QueueFamilyInfo],
    supports_present: impl Fn(u32) -> bool,
) -> Option<crate::backend::QueueFamilies> {
    let usable = |info: &QueueFamilyInfo| info.queue_count > 0;

    let graphics = families
        .iter()
        .enumerate()
        .find(|(i, info)| {
            usable(info) && info.caps.contains(QueueCaps::GRAPHICS) && supports_present(*i as u32)
        })
        .map(|(i, _)| i as u32)?;

    let compute = families
        .iter()
        .enumerate()
        .find(|(_, info)| {
            usable(info)
                && info.caps.contains(QueueCaps::COMPUTE)
                && !info.caps.contains(QueueCaps::GRAPHICS)
        })
        .map(|(i, _)| i as u32)
        .unwrap_or(graphics);

    let transfer_without = |excluded: QueueCaps| {
        families
            .iter()
            .enumerate()
            .find(|(_, info)| {
                usable(info)
                    && info.caps.contains(QueueCaps::TRANSFER)
                    && !info.caps.intersects(excluded)
            })
            .map(|(i, _)| i as u32)
    };
    let transfer = transfer_without(QueueCaps::GRAPHICS | QueueCaps::COMPUTE)
        .or_else(|| transfer_without(QueueCaps::GRAPHICS))
        .unwrap_or(graphics);

    Some(crate::backend::QueueFamilies {
        graphics,
        compute,
        transfer,
    })
}

/// Portable device handle. Cheap to clone; every clone shares one native device.
pub struct Device<B: Backend> {
    raw: Arc<B>,
}

impl<B: Backend> Clone for Device<B> {
    fn clone(&self) -> Self {
        Self {
            raw: Arc::clone(&self.raw),
        }
    }
}

/// A queue of one type on a device
pub struct Queue<'a, B: Backend> {
    device: &'a Device<B>,
    ty: QueueType,
}

impl<B: Backend> Queue<'_, B> {
    pub fn queue_type(&self) -> QueueType {
        self.ty
    }

    pub fn family_index(&self) -> u32 {
        self.device.capabilities().queue_families.family(self.ty)
    }

    pub fn wait_idle(&self) -> Result<()> {
        self.device.raw.queue_wait_idle(self.ty)
    }
}

impl<B: Backend> Device<B> {
    /// Open the backend `B`. Failure here is fatal for the caller.
    pub fn new(config: &Config) -> Result<Self> {
        let raw = B::open(config).with_context(|| format!("Failed to open {:?} device", B::KIND))?;
        Ok(Self::from_raw(raw))
    }

    pub fn from_raw(raw: B) -> Self {
        let caps = raw.capabilities();
        log::info!(
            "Device ready: {} (ray tracing: {}, mesh shading: {}, debug names: {})",
            caps.adapter_name,
            caps.ray_tracing,
            caps.mesh_shading,
            caps.debug_names
        );
        Self { raw: Arc::new(raw) }
    }

    pub fn raw(&self) -> &B {
        &self.raw
    }

    pub(crate) fn shared(&self) -> Arc<B> {
        Arc::clone(&self.raw)
    }

    pub fn capabilities(&self) -> &Capabilities {
        self.raw.capabilities()
    }

    pub fn queue(&self, ty: QueueType) -> Queue<'_, B> {
        Queue { device: self, ty }
    }

    /// Nanoseconds per GPU timestamp tick
    pub fn timestamp_period(&self) -> f32 {
        self.capabilities().timestamp_period
    }

    /// CPU/GPU timestamp pair for correlating the two clocks
    pub fn calibrate_clocks(&self) -> Result<ClockCalibration> {
        self.raw.calibrate_clocks()
    }

    pub fn wait_idle(&self) -> Result<()> {
        self.raw.wait_idle()
    }

    /// Record `work` into a throwaway command buffer, submit it and block
    /// until the GPU has finished it.
    pub fn one_time_command_submit<F>(&self, queue: QueueType, work: F) -> Result<()>
    where
        F: FnOnce(&mut CommandBuffer<B>),
    {
        let mut cmd = CommandBuffer::new(self, "one_time_submit", queue, 0)?;
        cmd.begin()?;
        work(&mut cmd);
        cmd.end()?;

        let fence = Fence::new(self, "one_time_submit_fence")?;
        cmd.submit(Some(&fence), None, None)?;
        match fence.wait(Duration::MAX)? {
            WaitStatus::Signaled => Ok(()),
            WaitStatus::TimedOut => anyhow::bail!("One-time submit never completed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn family(caps: QueueCaps) -> QueueFamilyInfo {
        QueueFamilyInfo {
            caps,
            queue_count: 1,
        }
    }

    #[test]
    fn dedicated_families_are_preferred() {
        let families = [
            family(QueueCaps::all()),
            family(QueueCaps::COMPUTE | QueueCaps::TRANSFER),
            family(QueueCaps::TRANSFER),
        ];
        let picked = select_queue_families(&families, |_| true).unwrap();
        assert_eq!(picked.graphics, 0);
        assert_eq!(picked.compute, 1);
        assert_eq!(picked.transfer, 2);
    }

    #[test]
    fn transfer_prefers_async_compute_over_graphics() {
        let families = [
            family(QueueCaps::all()),
            family(QueueCaps::COMPUTE | QueueCaps::TRANSFER),
        ];
        let picked = select_queue_families(&families, |_| true).unwrap();
        assert_eq!(picked.compute, 1);
        assert_eq!(picked.transfer, 1);
    }

    #[test]
    fn shared_family_is_the_fallback() {
        let families = [family(QueueCaps::all())];
        let picked = select_queue_families(&families, |_| true).unwrap();
        assert_eq!(picked.graphics, 0);
        assert_eq!(picked.compute, 0);
        assert_eq!(picked.transfer, 0);
    }

    #[test]
    fn graphics_family_must_present() {
        let families = [family(QueueCaps::all()), family(QueueCaps::all())];
        let picked = select_queue_families(&families, |i| i == 1).unwrap();
        assert_eq!(picked.graphics, 1);
        assert!(select_queue_families(&families, |_| false).is_none());
    }

    #[test]
    fn no_graphics_family_means_no_device() {
        let families = [family(QueueCaps::COMPUTE | QueueCaps::TRANSFER)];
        assert!(select_queue_families(&families, |_| true).is_none());
    }

    #[test]
    fn empty_families_are_skipped() {
        let families = [
            QueueFamilyInfo {
                caps: QueueCaps::all(),
                queue_count: 0,
            },
            family(QueueCaps::all()),
        ];
        let picked = select_queue_families(&families, |_| true).unwrap();
        assert_eq!(picked.graphics, 1);
    }
}
