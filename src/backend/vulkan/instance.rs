// Opening the Vulkan device
//
// - Instance creation with optional validation layer and debug utils
// - Physical device scoring (discrete preferred unless configured otherwise)
// - Queue family selection, extension and feature enabling
// - Memory allocator setup

use anyhow::{bail, Context, Result};
use ash::extensions::{ext, khr};
use ash::{vk, Entry};
use parking_lot::Mutex;
use std::ffi::{CStr, CString};
use std::mem::ManuallyDrop;
use std::time::Instant;

use super::{debug_callback, RayTracingLoaders, VulkanDevice};
use crate::backend::{Capabilities, QueueFamilies, ShaderGroupInfo};
use crate::config::Config;
use crate::device::{select_queue_families, QueueCaps, QueueFamilyInfo};
use crate::types::QueueType;

/// Core device features every adapter must have
const REQUIRED_DEVICE_FEATURES: vk::PhysicalDeviceFeatures = vk::PhysicalDeviceFeatures {
    sampler_anisotropy: vk::TRUE,
    ..unsafe { std::mem::zeroed() }
};

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";
const MESH_SHADER_EXTENSION: &CStr = c"VK_EXT_mesh_shader";

/// Window-system hook: the instance extensions a surface needs and a
/// callback creating the surface once the instance exists.
pub struct SurfaceFactory<'a> {
    pub instance_extensions: &'a [&'a CStr],
    pub create: Box<dyn FnOnce(&Entry, &ash::Instance) -> Result<vk::SurfaceKHR> + 'a>,
}

/// What the chosen adapter can do beyond the baseline
#[derive(Debug, Clone, Copy, Default)]
struct AdapterSupport {
    ray_tracing: bool,
    mesh_shading: bool,
}

struct Candidate {
    physical_device: vk::PhysicalDevice,
    families: QueueFamilies,
    support: AdapterSupport,
    score: u32,
}

impl VulkanDevice {
    /// Open a device that can present to the surface `factory` creates
    pub fn open_with_surface(config: &Config, factory: SurfaceFactory<'_>) -> Result<Self> {
        Self::create(config, Some(factory))
    }

    pub(super) fn create(config: &Config, factory: Option<SurfaceFactory<'_>>) -> Result<Self> {
        log::info!("Creating Vulkan device: {}", config.device.app_name);

        let entry = unsafe { Entry::load() }
            .context("Failed to load Vulkan library. Is Vulkan installed?")?;

        let extra_extensions = factory.as_ref().map_or(&[][..], |f| f.instance_extensions);
        let (instance, debug_utils_enabled, validation) =
            create_instance(&entry, config, extra_extensions)?;
        let mut teardown = Teardown::default();
        {
            let instance = instance.clone();
            teardown.push(move || unsafe { instance.destroy_instance(None) });
        }

        let debug_utils = debug_utils_enabled.then(|| ext::DebugUtils::new(&entry, &instance));
        let messenger = match (&debug_utils, validation) {
            (Some(debug_utils), true) => {
                let messenger = setup_debug_messenger(debug_utils)?;
                let debug_utils = debug_utils.clone();
                teardown.push(move || unsafe {
                    debug_utils.destroy_debug_utils_messenger(messenger, None)
                });
                Some(messenger)
            }
            _ => None,
        };

        let surface = match factory {
            Some(factory) => {
                let loader = khr::Surface::new(&entry, &instance);
                let surface = (factory.create)(&entry, &instance)
                    .context("Failed to create presentation surface")?;
                let destroy = loader.clone();
                teardown.push(move || unsafe { destroy.destroy_surface(surface, None) });
                Some((loader, surface))
            }
            None => None,
        };

        let candidate = pick_physical_device(&instance, config, surface.as_ref())?;
        let physical_device = candidate.physical_device;
        let properties = unsafe { instance.get_physical_device_properties(physical_device) };
        let memory_properties =
            unsafe { instance.get_physical_device_memory_properties(physical_device) };

        let adapter_name = unsafe { CStr::from_ptr(properties.device_name.as_ptr()) }
            .to_string_lossy()
            .into_owned();
        log::info!("Selected GPU: {}", adapter_name);
        log::info!(
            "API Version: {}.{}.{}",
            vk::api_version_major(properties.api_version),
            vk::api_version_minor(properties.api_version),
            vk::api_version_patch(properties.api_version)
        );
        log::info!("Queue families: {:?}", candidate.families);

        let device = create_logical_device(
            &instance,
            physical_device,
            candidate.families,
            candidate.support,
            surface.is_some(),
        )?;
        {
            let device = device.clone();
            teardown.push(move || unsafe { device.destroy_device(None) });
        }

        let queues = QueueType::ALL
            .map(|queue| unsafe { device.get_device_queue(candidate.families.family(queue), 0) });

        let allocator = gpu_allocator::vulkan::Allocator::new(
            &gpu_allocator::vulkan::AllocatorCreateDesc {
                instance: instance.clone(),
                device: device.clone(),
                physical_device,
                debug_settings: Default::default(),
                buffer_device_address: candidate.support.ray_tracing,
                allocation_sizes: Default::default(),
            },
        )
        .context("Failed to create memory allocator")?;
        teardown.disarm();

        let ray_tracing = candidate.support.ray_tracing.then(|| {
            let props = unsafe { khr::RayTracingPipeline::get_properties(&instance, physical_device) };
            RayTracingLoaders {
                accel: khr::AccelerationStructure::new(&instance, &device),
                pipeline: khr::RayTracingPipeline::new(&instance, &device),
                shader_groups: ShaderGroupInfo {
                    handle_size: props.shader_group_handle_size,
                    handle_alignment: props.shader_group_handle_alignment,
                    base_alignment: props.shader_group_base_alignment,
                },
            }
        });

        let caps = Capabilities {
            adapter_name,
            queue_families: candidate.families,
            ray_tracing: candidate.support.ray_tracing,
            mesh_shading: candidate.support.mesh_shading,
            debug_names: debug_utils.is_some(),
            calibrated_timestamps: false,
            timestamp_period: properties.limits.timestamp_period,
        };
        log::info!(
            "Capabilities: ray_tracing={} mesh_shading={} debug_names={}",
            caps.ray_tracing,
            caps.mesh_shading,
            caps.debug_names
        );

        let vulkan = Self {
            caps,
            allocator: ManuallyDrop::new(Mutex::new(allocator)),
            device,
            physical_device,
            instance,
            _entry: entry,
            queues,
            submit_lock: Mutex::new(()),
            debug_utils,
            messenger,
            surface,
            ray_tracing,
            properties,
            memory_properties,
            epoch: Instant::now(),
        };
        for queue in QueueType::ALL {
            vulkan.set_name(vulkan.raw_queue(queue), &format!("{:?}Queue", queue));
        }
        Ok(vulkan)
    }
}

/// Undo steps for a partially opened device, run newest first on drop.
/// Disarmed once the device owns everything.
#[derive(Default)]
struct Teardown {
    steps: Vec<Box<dyn FnOnce()>>,
}

impl Teardown {
    fn push(&mut self, step: impl FnOnce() + 'static) {
        self.steps.push(Box::new(step));
    }

    fn disarm(mut self) {
        self.steps.clear();
    }
}

impl Drop for Teardown {
    fn drop(&mut self) {
        while let Some(step) = self.steps.pop() {
            step();
        }
    }
}

fn has_extension(available: &[vk::ExtensionProperties], name: &CStr) -> bool {
    available
        .iter()
        .any(|props| unsafe { CStr::from_ptr(props.extension_name.as_ptr()) } == name)
}

/// Returns the instance plus whether debug utils and validation got enabled
fn create_instance(
    entry: &Entry,
    config: &Config,
    extra_extensions: &[&CStr],
) -> Result<(ash::Instance, bool, bool)> {
    let app_name = CString::new(config.device.app_name.as_str())?;
    let engine_name = CString::new("my-rhi")?;

    let app_info = vk::ApplicationInfo::builder()
        .application_name(&app_name)
        .application_version(vk::make_api_version(0, 0, 1, 0))
        .engine_name(&engine_name)
        .engine_version(vk::make_api_version(0, 0, 1, 0))
        .api_version(vk::API_VERSION_1_3);

    let available = entry
        .enumerate_instance_extension_properties(None)
        .context("Failed to enumerate instance extensions")?;
    let debug_utils = has_extension(&available, ext::DebugUtils::name());

    let mut extensions: Vec<*const std::ffi::c_char> =
        extra_extensions.iter().map(|name| name.as_ptr()).collect();
    if debug_utils {
        extensions.push(ext::DebugUtils::name().as_ptr());
    }

    let validation = config.device.validation_layers && debug_utils && {
        let layers = entry
            .enumerate_instance_layer_properties()
            .context("Failed to enumerate instance layers")?;
        let found = layers
            .iter()
            .any(|layer| unsafe { CStr::from_ptr(layer.layer_name.as_ptr()) } == VALIDATION_LAYER);
        if !found {
            log::warn!("Validation requested but VK_LAYER_KHRONOS_validation is not installed");
        }
        found
    };
    let layer_names = if validation {
        vec![VALIDATION_LAYER.as_ptr()]
    } else {
        vec![]
    };

    let create_info = vk::InstanceCreateInfo::builder()
        .application_info(&app_info)
        .enabled_extension_names(&extensions)
        .enabled_layer_names(&layer_names);

    let instance = unsafe { entry.create_instance(&create_info, None) }
        .context("Failed to create Vulkan instance")?;

    Ok((instance, debug_utils, validation))
}

fn setup_debug_messenger(debug_utils: &ext::DebugUtils) -> Result<vk::DebugUtilsMessengerEXT> {
    let create_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
        .message_severity(
            vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
        )
        .message_type(
            vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
        )
        .pfn_user_callback(Some(debug_callback));

    unsafe { debug_utils.create_debug_utils_messenger(&create_info, None) }
        .context("Failed to create debug messenger")
}

fn queue_caps(flags: vk::QueueFlags) -> QueueCaps {
    let mut caps = QueueCaps::empty();
    if flags.contains(vk::QueueFlags::GRAPHICS) {
        // Graphics implies transfer even when the bit is not reported
        caps |= QueueCaps::GRAPHICS | QueueCaps::TRANSFER;
    }
    if flags.contains(vk::QueueFlags::COMPUTE) {
        caps |= QueueCaps::COMPUTE | QueueCaps::TRANSFER;
    }
    if flags.contains(vk::QueueFlags::TRANSFER) {
        caps |= QueueCaps::TRANSFER;
    }
    caps
}

fn query_support(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    extensions: &[vk::ExtensionProperties],
    config: &Config,
) -> Option<AdapterSupport> {
    let rt_extensions = [
        khr::AccelerationStructure::name(),
        khr::RayTracingPipeline::name(),
        khr::DeferredHostOperations::name(),
    ]
    .iter()
    .all(|name| has_extension(extensions, name));
    let mesh_extension = has_extension(extensions, MESH_SHADER_EXTENSION);

    let mut features12 = vk::PhysicalDeviceVulkan12Features::default();
    let mut features13 = vk::PhysicalDeviceVulkan13Features::default();
    let mut accel_features = vk::PhysicalDeviceAccelerationStructureFeaturesKHR::default();
    let mut rt_features = vk::PhysicalDeviceRayTracingPipelineFeaturesKHR::default();
    let mut mesh_features = vk::PhysicalDeviceMeshShaderFeaturesEXT::default();

    let mut features = vk::PhysicalDeviceFeatures2::builder()
        .push_next(&mut features12)
        .push_next(&mut features13);
    if rt_extensions {
        features = features
            .push_next(&mut accel_features)
            .push_next(&mut rt_features);
    }
    if mesh_extension {
        features = features.push_next(&mut mesh_features);
    }
    unsafe { instance.get_physical_device_features2(physical_device, &mut features) };
    let base = features.features;

    if base.sampler_anisotropy != vk::TRUE
        || features12.timeline_semaphore != vk::TRUE
        || features13.dynamic_rendering != vk::TRUE
    {
        return None;
    }

    let ray_tracing_available = rt_extensions
        && accel_features.acceleration_structure == vk::TRUE
        && rt_features.ray_tracing_pipeline == vk::TRUE
        && features12.buffer_device_address == vk::TRUE;
    let mesh_available = mesh_extension && mesh_features.mesh_shader == vk::TRUE;

    Some(AdapterSupport {
        ray_tracing: config.device.enable_ray_tracing && ray_tracing_available,
        mesh_shading: config.device.enable_mesh_shading && mesh_available,
    })
}

fn pick_physical_device(
    instance: &ash::Instance,
    config: &Config,
    surface: Option<&(khr::Surface, vk::SurfaceKHR)>,
) -> Result<Candidate> {
    let devices = unsafe { instance.enumerate_physical_devices() }?;

    if devices.is_empty() {
        bail!("No Vulkan-capable GPU found");
    }

    let mut best: Option<Candidate> = None;

    for physical_device in devices {
        let props = unsafe { instance.get_physical_device_properties(physical_device) };
        let name = unsafe { CStr::from_ptr(props.device_name.as_ptr()) }.to_string_lossy();

        if props.api_version < vk::API_VERSION_1_3 {
            log::debug!("Skipping {}: Vulkan 1.3 required", name);
            continue;
        }

        let extensions =
            unsafe { instance.enumerate_device_extension_properties(physical_device) }?;
        if surface.is_some() && !has_extension(&extensions, khr::Swapchain::name()) {
            log::debug!("Skipping {}: no swapchain support", name);
            continue;
        }

        let Some(support) = query_support(instance, physical_device, &extensions, config) else {
            log::debug!("Skipping {}: missing required features", name);
            continue;
        };

        let family_props =
            unsafe { instance.get_physical_device_queue_family_properties(physical_device) };
        let families: Vec<QueueFamilyInfo> = family_props
            .iter()
            .map(|family| QueueFamilyInfo {
                caps: queue_caps(family.queue_flags),
                queue_count: family.queue_count,
            })
            .collect();

        let supports_present = |index: u32| match surface {
            Some((loader, surface)) => unsafe {
                loader
                    .get_physical_device_surface_support(physical_device, index, *surface)
                    .unwrap_or(false)
            },
            None => true,
        };
        let Some(families) = select_queue_families(&families, supports_present) else {
            log::debug!("Skipping {}: no graphics queue that can present", name);
            continue;
        };

        let (discrete, integrated) = if config.device.prefer_discrete_gpu {
            (1000, 100)
        } else {
            (100, 1000)
        };
        let mut score = match props.device_type {
            vk::PhysicalDeviceType::DISCRETE_GPU => discrete,
            vk::PhysicalDeviceType::INTEGRATED_GPU => integrated,
            _ => 1,
        };
        if support.ray_tracing {
            score += 50;
        }

        log::debug!("Candidate {} ({:?}) score {}", name, props.device_type, score);
        if best.as_ref().map_or(true, |b| score > b.score) {
            best = Some(Candidate {
                physical_device,
                families,
                support,
                score,
            });
        }
    }

    best.context("No suitable GPU found (Vulkan 1.3 with dynamic rendering and timeline semaphores)")
}

fn create_logical_device(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    families: QueueFamilies,
    support: AdapterSupport,
    present: bool,
) -> Result<ash::Device> {
    let mut unique = vec![families.graphics, families.compute, families.transfer];
    unique.sort_unstable();
    unique.dedup();

    let queue_priorities = [1.0];
    let queue_infos: Vec<_> = unique
        .iter()
        .map(|&family| {
            vk::DeviceQueueCreateInfo::builder()
                .queue_family_index(family)
                .queue_priorities(&queue_priorities)
                .build()
        })
        .collect();

    let mut extensions = Vec::new();
    if present {
        extensions.push(khr::Swapchain::name().as_ptr());
    }
    if support.ray_tracing {
        extensions.push(khr::AccelerationStructure::name().as_ptr());
        extensions.push(khr::RayTracingPipeline::name().as_ptr());
        extensions.push(khr::DeferredHostOperations::name().as_ptr());
    }
    if support.mesh_shading {
        extensions.push(MESH_SHADER_EXTENSION.as_ptr());
    }

    let mut features12 = vk::PhysicalDeviceVulkan12Features::builder()
        .timeline_semaphore(true)
        .buffer_device_address(support.ray_tracing)
        .build();
    let mut features13 = vk::PhysicalDeviceVulkan13Features::builder()
        .dynamic_rendering(true)
        .build();
    let mut accel_features = vk::PhysicalDeviceAccelerationStructureFeaturesKHR::builder()
        .acceleration_structure(true)
        .build();
    let mut rt_features = vk::PhysicalDeviceRayTracingPipelineFeaturesKHR::builder()
        .ray_tracing_pipeline(true)
        .build();
    let mut mesh_features = vk::PhysicalDeviceMeshShaderFeaturesEXT::builder()
        .mesh_shader(true)
        .build();

    let mut create_info = vk::DeviceCreateInfo::builder()
        .queue_create_infos(&queue_infos)
        .enabled_extension_names(&extensions)
        .enabled_features(&REQUIRED_DEVICE_FEATURES)
        .push_next(&mut features12)
        .push_next(&mut features13);
    if support.ray_tracing {
        create_info = create_info
            .push_next(&mut accel_features)
            .push_next(&mut rt_features);
    }
    if support.mesh_shading {
        create_info = create_info.push_next(&mut mesh_features);
    }

    let device = unsafe { instance.create_device(physical_device, &create_info, None) }
        .context("Failed to create logical device")?;
    Ok(device)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn graphics_and_compute_families_imply_transfer() {
        assert!(queue_caps(vk::QueueFlags::GRAPHICS).contains(QueueCaps::TRANSFER));
        assert!(queue_caps(vk::QueueFlags::COMPUTE).contains(QueueCaps::TRANSFER));
        assert_eq!(queue_caps(vk::QueueFlags::TRANSFER), QueueCaps::TRANSFER);
        assert_eq!(queue_caps(vk::QueueFlags::SPARSE_BINDING), QueueCaps::empty());
    }

    #[test]
    fn teardown_undoes_newest_first() {
        let order = std::sync::Arc::new(Mutex::new(Vec::new()));
        {
            let mut teardown = Teardown::default();
            for step in ["instance", "messenger", "surface", "device"] {
                let order = order.clone();
                teardown.push(move || order.lock().push(step));
            }
        }
        assert_eq!(*order.lock(), ["device", "surface", "messenger", "instance"]);
    }

    #[test]
    fn disarmed_teardown_does_nothing() {
        let ran = std::sync::Arc::new(Mutex::new(false));
        let mut teardown = Teardown::default();
        let flag = ran.clone();
        teardown.push(move || *flag.lock() = true);
        teardown.disarm();
        assert!(!*ran.lock());
    }
}
