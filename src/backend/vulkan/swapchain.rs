// Swapchain - Window presentation
//
// Chain of images rendered to and presented on the surface the device was
// opened with. Backbuffers are wrapped as portable textures so rendering
// code treats them like any other color target.
//
// Acquire and present cannot take timeline semaphores, so acquire waits on
// a binary fence on the host and present expects the caller to have waited
// on its frame fence first.

use anyhow::{Context, Result};
use ash::extensions::khr;
use ash::vk;
use std::time::Duration;

use super::{conv, VulkanDevice};
use crate::device::Device;
use crate::resource::Texture;
use crate::types::{Extent3d, QueueType};

pub struct Swapchain {
    backbuffers: Vec<Texture<VulkanDevice>>,
    raw: vk::SwapchainKHR,
    loader: khr::Swapchain,
    acquire_fence: vk::Fence,
    format: vk::Format,
    extent: vk::Extent2D,
    device: Device<VulkanDevice>,
}

/// Outcome of acquiring a backbuffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireStatus {
    Ready { index: u32, suboptimal: bool },
    TimedOut,
    /// Surface changed; recreate the swapchain
    OutOfDate,
}

impl Swapchain {
    pub fn new(device: &Device<VulkanDevice>, width: u32, height: u32) -> Result<Self> {
        log::info!("Creating swapchain: {}x{}", width, height);

        let raw_device = device.raw();
        let (surface_loader, surface) = raw_device
            .surface()
            .context("Device was opened without a surface")?;
        let physical_device = raw_device.physical_device();

        let surface_caps = unsafe {
            surface_loader.get_physical_device_surface_capabilities(physical_device, surface)
        }?;
        let formats = unsafe {
            surface_loader.get_physical_device_surface_formats(physical_device, surface)
        }?;
        let present_modes = unsafe {
            surface_loader.get_physical_device_surface_present_modes(physical_device, surface)
        }?;

        // Prefer SRGB; anything else must still map to a portable format
        let surface_format = formats
            .iter()
            .find(|f| {
                f.format == vk::Format::B8G8R8A8_SRGB
                    && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
            })
            .or_else(|| {
                formats
                    .iter()
                    .find(|f| conv::format_from_vk(f.format).is_some())
            })
            .copied()
            .context("No suitable surface format")?;
        let portable_format = conv::format_from_vk(surface_format.format)
            .context("Surface format has no portable equivalent")?;

        // MAILBOX: no tearing, lowest latency without vsync
        // FIFO: vsync, always supported
        let present_mode = present_modes
            .iter()
            .copied()
            .find(|&mode| mode == vk::PresentModeKHR::MAILBOX)
            .unwrap_or(vk::PresentModeKHR::FIFO);
        log::info!("Present mode: {:?}", present_mode);

        let extent = if surface_caps.current_extent.width != u32::MAX {
            surface_caps.current_extent
        } else {
            vk::Extent2D {
                width: width.clamp(
                    surface_caps.min_image_extent.width,
                    surface_caps.max_image_extent.width,
                ),
                height: height.clamp(
                    surface_caps.min_image_extent.height,
                    surface_caps.max_image_extent.height,
                ),
            }
        };

        let mut image_count = surface_caps.min_image_count + 1;
        if surface_caps.max_image_count > 0 && image_count > surface_caps.max_image_count {
            image_count = surface_caps.max_image_count;
        }

        let loader = khr::Swapchain::new(raw_device.raw_instance(), raw_device.raw_device());
        let create_info = vk::SwapchainCreateInfoKHR::builder()
            .surface(surface)
            .min_image_count(image_count)
            .image_format(surface_format.format)
            .image_color_space(surface_format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_DST)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(surface_caps.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true);
        let raw = unsafe { loader.create_swapchain(&create_info, None) }
            .context("Failed to create swapchain")?;

        let acquire_fence = match unsafe {
            raw_device
                .raw_device()
                .create_fence(&vk::FenceCreateInfo::default(), None)
        } {
            Ok(fence) => fence,
            Err(e) => {
                unsafe { loader.destroy_swapchain(raw, None) };
                return Err(e).context("Failed to create acquire fence");
            }
        };

        // From here on Drop cleans up whatever was created
        let mut swapchain = Self {
            backbuffers: Vec::new(),
            raw,
            loader,
            acquire_fence,
            format: surface_format.format,
            extent,
            device: device.clone(),
        };

        let images = unsafe { swapchain.loader.get_swapchain_images(raw) }?;
        for (i, image) in images.into_iter().enumerate() {
            let texture = device.wrap_backbuffer(
                &format!("backbuffer_{}", i),
                image,
                Extent3d::new_2d(extent.width, extent.height),
                portable_format,
            )?;
            swapchain.backbuffers.push(texture);
        }

        log::info!(
            "Created swapchain with {} images ({:?})",
            swapchain.backbuffers.len(),
            surface_format.format
        );
        Ok(swapchain)
    }

    pub fn backbuffers(&self) -> &[Texture<VulkanDevice>] {
        &self.backbuffers
    }

    pub fn backbuffer(&self, index: u32) -> &Texture<VulkanDevice> {
        &self.backbuffers[index as usize]
    }

    pub fn extent(&self) -> (u32, u32) {
        (self.extent.width, self.extent.height)
    }

    pub fn native_format(&self) -> vk::Format {
        self.format
    }

    /// Block until the next backbuffer is ready for rendering
    pub fn acquire_next_image(&self, timeout: Duration) -> Result<AcquireStatus> {
        let device = self.device.raw().raw_device();
        let timeout_ns = u64::try_from(timeout.as_nanos()).unwrap_or(u64::MAX);

        let result = unsafe {
            self.loader.acquire_next_image(
                self.raw,
                timeout_ns,
                vk::Semaphore::null(),
                self.acquire_fence,
            )
        };
        let (index, suboptimal) = match result {
            Ok(acquired) => acquired,
            Err(vk::Result::TIMEOUT) | Err(vk::Result::NOT_READY) => {
                return Ok(AcquireStatus::TimedOut)
            }
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => return Ok(AcquireStatus::OutOfDate),
            Err(e) => return Err(e).context("Failed to acquire swapchain image"),
        };

        unsafe {
            device.wait_for_fences(&[self.acquire_fence], true, timeout_ns)?;
            device.reset_fences(&[self.acquire_fence])?;
        }
        Ok(AcquireStatus::Ready { index, suboptimal })
    }

    /// Queue `index` for presentation on the graphics queue.
    ///
    /// Returns true when the swapchain should be recreated.
    pub fn present(&self, index: u32) -> Result<bool> {
        let swapchains = [self.raw];
        let image_indices = [index];
        let present_info = vk::PresentInfoKHR::builder()
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        let result = self
            .device
            .raw()
            .with_queue(QueueType::Graphics, |queue| unsafe {
                self.loader.queue_present(queue, &present_info)
            });
        match result {
            Ok(suboptimal) => Ok(suboptimal),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(true),
            Err(e) => Err(e).context("Failed to present"),
        }
    }
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        if let Err(e) = self.device.queue(QueueType::Graphics).wait_idle() {
            log::error!("Graphics queue wait failed before swapchain teardown: {}", e);
        }
        // Views go first; the images belong to the swapchain
        self.backbuffers.clear();
        unsafe {
            self.device
                .raw()
                .raw_device()
                .destroy_fence(self.acquire_fence, None);
            self.loader.destroy_swapchain(self.raw, None);
        }
    }
}
