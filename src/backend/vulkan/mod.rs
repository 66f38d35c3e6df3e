// Vulkan backend - ash + gpu-allocator
//
// - instance.rs:  instance, validation messenger, adapter pick, logical device
// - device.rs:    the Backend implementation
// - swapchain.rs: presentation over a caller-supplied surface
// - conv.rs:      portable -> Vulkan tables
//
// Requires Vulkan 1.3 (dynamic rendering, timeline semaphores). Ray tracing
// and mesh shading are enabled only when requested and supported.

mod conv;
mod device;
mod instance;
pub mod swapchain;

pub use instance::SurfaceFactory;
pub use swapchain::{AcquireStatus, Swapchain};

use ash::extensions::{ext, khr};
use ash::{vk, Entry};
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme, Allocator};
use gpu_allocator::MemoryLocation;
use parking_lot::Mutex;
use std::ffi::{CStr, CString};
use std::mem::ManuallyDrop;
use std::time::Instant;

use anyhow::{Context, Result};

use crate::backend::{AccelerationStructureLevel, Capabilities, ShaderGroupInfo};
use crate::types::{DescriptorBinding, QueueType};

#[derive(Debug)]
pub struct VulkanBuffer {
    raw: vk::Buffer,
    allocation: Allocation,
    size: u64,
    address: Option<u64>,
}

impl VulkanBuffer {
    pub fn raw(&self) -> vk::Buffer {
        self.raw
    }
}

#[derive(Debug)]
pub struct VulkanTexture {
    raw: vk::Image,
    view: vk::ImageView,
    /// None for placed textures and wrapped swapchain images
    allocation: Option<Allocation>,
    owns_image: bool,
    aspect: vk::ImageAspectFlags,
    extent: vk::Extent3D,
    mip_levels: u32,
}

impl VulkanTexture {
    pub fn raw(&self) -> vk::Image {
        self.raw
    }

    pub fn view(&self) -> vk::ImageView {
        self.view
    }
}

/// Device-local block that placed textures alias into
#[derive(Debug)]
pub struct VulkanMemory {
    allocation: Allocation,
    size: u64,
}

pub struct VulkanCommandList {
    pool: vk::CommandPool,
    raw: vk::CommandBuffer,
    queue: QueueType,
}

impl VulkanCommandList {
    pub fn raw(&self) -> vk::CommandBuffer {
        self.raw
    }
}

/// Timeline semaphore
#[derive(Debug)]
pub struct VulkanTimeline {
    raw: vk::Semaphore,
}

#[derive(Debug)]
pub struct VulkanQueryHeap {
    raw: vk::QueryPool,
    capacity: u32,
}

#[derive(Debug)]
pub struct VulkanDescriptorPool {
    raw: vk::DescriptorPool,
}

#[derive(Debug)]
pub struct VulkanDescriptorSet {
    raw: vk::DescriptorSet,
}

#[derive(Debug)]
pub struct VulkanBindingLayout {
    raw: vk::DescriptorSetLayout,
    #[allow(dead_code)]
    bindings: Vec<DescriptorBinding>,
}

#[derive(Debug)]
pub struct VulkanPipeline {
    raw: vk::Pipeline,
    layout: vk::PipelineLayout,
    bind_point: vk::PipelineBindPoint,
    push_stages: vk::ShaderStageFlags,
    group_count: u32,
}

#[derive(Debug)]
pub struct VulkanAccelerationStructure {
    raw: vk::AccelerationStructureKHR,
    level: AccelerationStructureLevel,
}

/// Ray tracing extension loaders, present only when the feature is on
struct RayTracingLoaders {
    accel: khr::AccelerationStructure,
    pipeline: khr::RayTracingPipeline,
    shader_groups: ShaderGroupInfo,
}

/// Vulkan device. Owns the instance, the logical device and the allocator;
/// every other native object is owned by a portable wrapper that destroys
/// it through this device.
pub struct VulkanDevice {
    caps: Capabilities,
    allocator: ManuallyDrop<Mutex<Allocator>>,
    device: ash::Device,
    physical_device: vk::PhysicalDevice,
    instance: ash::Instance,
    _entry: Entry,

    /// Indexed by `QueueType::index`; families may coincide
    queues: [vk::Queue; 3],
    /// Serializes vkQueueSubmit/vkQueuePresent/vkQueueWaitIdle
    submit_lock: Mutex<()>,

    debug_utils: Option<ext::DebugUtils>,
    messenger: Option<vk::DebugUtilsMessengerEXT>,
    surface: Option<(khr::Surface, vk::SurfaceKHR)>,
    ray_tracing: Option<RayTracingLoaders>,

    properties: vk::PhysicalDeviceProperties,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    epoch: Instant,
}

/// Device addresses of buffers feeding acceleration structures and SBTs
const ADDRESS_ALIGNMENT: u64 = 256;
const ALIASED_BLOCK_ALIGNMENT: u64 = 64 * 1024;

impl VulkanDevice {
    pub fn raw_device(&self) -> &ash::Device {
        &self.device
    }

    pub fn raw_instance(&self) -> &ash::Instance {
        &self.instance
    }

    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    pub fn raw_queue(&self, queue: QueueType) -> vk::Queue {
        self.queues[queue.index()]
    }

    pub fn surface(&self) -> Option<(&khr::Surface, vk::SurfaceKHR)> {
        self.surface.as_ref().map(|(loader, surface)| (loader, *surface))
    }

    pub fn limits(&self) -> &vk::PhysicalDeviceLimits {
        &self.properties.limits
    }

    /// Run `f` while holding the queue lock
    pub(crate) fn with_queue<R>(&self, queue: QueueType, f: impl FnOnce(vk::Queue) -> R) -> R {
        let _guard = self.submit_lock.lock();
        f(self.queues[queue.index()])
    }

    fn now_ns(&self) -> u64 {
        self.epoch.elapsed().as_nanos() as u64
    }

    /// Attach a debug name to a native object; no-op without debug utils
    fn set_name<H: vk::Handle>(&self, handle: H, name: &str) {
        let Some(debug_utils) = &self.debug_utils else {
            return;
        };
        let Ok(name) = CString::new(name) else {
            return;
        };
        let info = vk::DebugUtilsObjectNameInfoEXT::builder()
            .object_type(H::TYPE)
            .object_handle(handle.as_raw())
            .object_name(&name);
        if let Err(e) =
            unsafe { debug_utils.set_debug_utils_object_name(self.device.handle(), &info) }
        {
            log::warn!("Failed to name {:?} '{}': {}", H::TYPE, name.to_string_lossy(), e);
        }
    }

    fn allocate(
        &self,
        name: &str,
        requirements: vk::MemoryRequirements,
        location: MemoryLocation,
        linear: bool,
    ) -> Result<Allocation> {
        self.allocator
            .lock()
            .allocate(&AllocationCreateDesc {
                name,
                requirements,
                location,
                linear,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })
            .with_context(|| format!("Failed to allocate memory for '{}'", name))
    }

    fn free(&self, allocation: Allocation) {
        if let Err(e) = self.allocator.lock().free(allocation) {
            log::error!("Failed to free allocation: {}", e);
        }
    }

    fn device_local_type_bits(&self) -> u32 {
        let props = &self.memory_properties;
        props.memory_types[..props.memory_type_count as usize]
            .iter()
            .enumerate()
            .filter(|(_, ty)| {
                ty.property_flags
                    .contains(vk::MemoryPropertyFlags::DEVICE_LOCAL)
            })
            .fold(0, |bits, (i, _)| bits | (1 << i))
    }

    fn create_shader_module(&self, code: &[u8]) -> Result<vk::ShaderModule> {
        let words = ash::util::read_spv(&mut std::io::Cursor::new(code))
            .context("Shader bytecode is not valid SPIR-V")?;
        let create_info = vk::ShaderModuleCreateInfo::builder().code(&words);
        unsafe { self.device.create_shader_module(&create_info, None) }
            .context("Failed to create shader module")
    }

    fn ray_tracing(&self) -> &RayTracingLoaders {
        match &self.ray_tracing {
            Some(loaders) => loaders,
            None => panic!("ray tracing used on a device without ray tracing support"),
        }
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        log::info!("Destroying Vulkan device...");

        if let Err(e) = unsafe { self.device.device_wait_idle() } {
            log::error!("device_wait_idle failed during teardown: {}", e);
        }

        unsafe {
            // Allocator frees its memory blocks through the device
            ManuallyDrop::drop(&mut self.allocator);
            self.device.destroy_device(None);

            if let Some((loader, surface)) = self.surface.take() {
                loader.destroy_surface(surface, None);
            }
            if let (Some(debug_utils), Some(messenger)) = (&self.debug_utils, self.messenger.take())
            {
                debug_utils.destroy_debug_utils_messenger(messenger, None);
            }
            self.instance.destroy_instance(None);
        }
    }
}

// Validation layer output is routed into `log`
unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _p_user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    if p_callback_data.is_null() || (*p_callback_data).p_message.is_null() {
        return vk::FALSE;
    }
    let message = CStr::from_ptr((*p_callback_data).p_message).to_string_lossy();

    match message_severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => {
            log::error!("[Vulkan {:?}] {}", message_type, message);
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => {
            log::warn!("[Vulkan {:?}] {}", message_type, message);
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::INFO => {
            log::debug!("[Vulkan] {}", message);
        }
        _ => {
            log::trace!("[Vulkan] {}", message);
        }
    }

    vk::FALSE
}
