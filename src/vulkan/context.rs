use std::{
    ffi::CStr,
    mem::ManuallyDrop,
    sync::{Mutex, MutexGuard, PoisonError},
};

use ash::{
    extensions::khr::{AccelerationStructure, BufferDeviceAddress},
    vk::{self, ApplicationInfo, DeviceCreateInfo, DeviceQueueCreateInfo, InstanceCreateInfo},
};
use gpu_allocator::vulkan::{Allocator, AllocatorCreateDesc};
use raw_window_handle::{HasRawDisplayHandle, HasRawWindowHandle};
use winit::{event_loop::EventLoop, window::Window};

use crate::error::{RenderError, RenderResult};

/// The device and everything that lives exactly as long as it.
pub struct Context {
    allocator: ManuallyDrop<Mutex<Allocator>>,

    _entry: ash::Entry,
    pub instance: ash::Instance,

    pub surface_loader: ash::extensions::khr::Surface,
    pub surface: vk::SurfaceKHR,

    pub context_raytracing: ContextRaytracing,

    pub physical_device: vk::PhysicalDevice,
    pub queue_family_index: u32,

    pub device: ash::Device,
    pub queue: vk::Queue,

    pub buffer_device_address: BufferDeviceAddress,
}

pub struct ContextRaytracing {
    pub acceleration_structure: AccelerationStructure,
    pub physical_device_acceleration_structure_properties_khr:
        vk::PhysicalDeviceAccelerationStructurePropertiesKHR,
}

impl Context {
    pub fn new(event_loop: &EventLoop<()>, window: &Window) -> RenderResult<Self> {
        let entry = unsafe { ash::Entry::load() }
            .map_err(|err| RenderError::UnsupportedFeature(format!("Vulkan loader: {err}")))?;

        let instance = {
            let surface_extension =
                ash_window::enumerate_required_extensions(event_loop.raw_display_handle())
                    .map_err(RenderError::creating("instance"))?;

            let app_info = ApplicationInfo::builder().api_version(vk::API_VERSION_1_3);
            let create_info = InstanceCreateInfo::builder()
                .application_info(&app_info)
                .enabled_extension_names(surface_extension);
            unsafe { entry.create_instance(&create_info, None) }
                .map_err(RenderError::creating("instance"))?
        };

        let surface_loader = ash::extensions::khr::Surface::new(&entry, &instance);
        let surface = unsafe {
            ash_window::create_surface(
                &entry,
                &instance,
                window.raw_display_handle(),
                window.raw_window_handle(),
                None,
            )
        }
        .map_err(RenderError::creating("surface"))?;

        let (physical_device, queue_family_index) =
            find_physical_device(&instance, &surface, &surface_loader)?;

        let device = create_logical_device(&instance, &physical_device, queue_family_index)?;

        let queue = unsafe { device.get_device_queue(queue_family_index, 0) };

        let acceleration_structure = AccelerationStructure::new(&instance, &device);
        let physical_device_acceleration_structure_properties_khr =
            unsafe { AccelerationStructure::get_properties(&instance, physical_device) };

        let buffer_device_address = BufferDeviceAddress::new(&instance, &device);

        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.clone(),
            device: device.clone(),
            physical_device,
            debug_settings: Default::default(),
            buffer_device_address: true,
            allocation_sizes: Default::default(),
        })?;

        let properties = unsafe { instance.get_physical_device_properties(physical_device) };
        let device_name = unsafe { CStr::from_ptr(properties.device_name.as_ptr()) };
        log::info!(
            "Using {:?} (queue family {})",
            device_name,
            queue_family_index
        );

        Ok(Self {
            allocator: ManuallyDrop::new(Mutex::new(allocator)),
            _entry: entry,
            instance,

            surface,
            surface_loader,

            context_raytracing: ContextRaytracing {
                acceleration_structure,
                physical_device_acceleration_structure_properties_khr,
            },

            physical_device,
            queue_family_index,

            device,
            queue,
            buffer_device_address,
        })
    }

    pub fn allocator(&self) -> MutexGuard<'_, Allocator> {
        self.allocator
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn wait_idle(&self) -> RenderResult<()> {
        unsafe { self.device.device_wait_idle() }.map_err(RenderError::creating("idle device"))
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        // The allocator frees its memory blocks through the device.
        unsafe { ManuallyDrop::drop(&mut self.allocator) };

        unsafe { self.device.destroy_device(None) };

        unsafe { self.surface_loader.destroy_surface(self.surface, None) };

        unsafe { self.instance.destroy_instance(None) };
    }
}

fn required_device_extensions() -> [&'static CStr; 4] {
    [
        ash::extensions::khr::Swapchain::name(),
        ash::extensions::khr::AccelerationStructure::name(),
        ash::extensions::khr::DeferredHostOperations::name(),
        ash::extensions::khr::BufferDeviceAddress::name(),
    ]
}

fn find_physical_device(
    instance: &ash::Instance,
    surface: &vk::SurfaceKHR,
    surface_loader: &ash::extensions::khr::Surface,
) -> RenderResult<(vk::PhysicalDevice, u32)> {
    let physical_devices = unsafe { instance.enumerate_physical_devices() }
        .map_err(RenderError::creating("physical device list"))?;

    physical_devices
        .into_iter()
        .filter(|pd| {
            let Ok(extension_properties) =
                (unsafe { instance.enumerate_device_extension_properties(*pd) })
            else {
                return false;
            };
            let supported_extensions: Vec<&CStr> = extension_properties
                .iter()
                .map(|property| unsafe { CStr::from_ptr(property.extension_name.as_ptr()) })
                .collect();

            required_device_extensions()
                .iter()
                .all(|ext| supported_extensions.contains(ext))
        })
        .filter_map(|pd| {
            unsafe { instance.get_physical_device_queue_family_properties(pd) }
                .iter()
                .enumerate()
                .position(|(index, info)| {
                    let supports_graphics = info.queue_flags.contains(vk::QueueFlags::GRAPHICS);
                    let supports_surface = unsafe {
                        surface_loader.get_physical_device_surface_support(
                            pd,
                            index as u32,
                            *surface,
                        )
                    }
                    .unwrap_or(false);

                    supports_graphics && supports_surface
                })
                .map(|i| (pd, i as u32))
        })
        .min_by_key(|(pd, _)| {
            let device_type = unsafe { instance.get_physical_device_properties(*pd) }.device_type;

            match device_type {
                vk::PhysicalDeviceType::DISCRETE_GPU => 0,
                vk::PhysicalDeviceType::INTEGRATED_GPU => 1,
                vk::PhysicalDeviceType::VIRTUAL_GPU => 2,
                vk::PhysicalDeviceType::CPU => 3,
                vk::PhysicalDeviceType::OTHER => 4,
                _ => 5,
            }
        })
        .ok_or_else(|| {
            RenderError::UnsupportedFeature(
                "no device supports presentation and acceleration structures".to_string(),
            )
        })
}

fn create_logical_device(
    instance: &ash::Instance,
    physical_device: &vk::PhysicalDevice,
    queue_family_index: u32,
) -> RenderResult<ash::Device> {
    let device_extensions = required_device_extensions().map(|ext| ext.as_ptr());

    let queue_priorities = [1.0];
    let queue_create_info = DeviceQueueCreateInfo::builder()
        .queue_family_index(queue_family_index)
        .queue_priorities(&queue_priorities);

    let mut physical_device_vulkan13_features = vk::PhysicalDeviceVulkan13Features {
        synchronization2: vk::TRUE,
        dynamic_rendering: vk::TRUE,
        ..vk::PhysicalDeviceVulkan13Features::default()
    };

    let mut enabled_buffer_device_address_features =
        vk::PhysicalDeviceBufferDeviceAddressFeatures {
            buffer_device_address: vk::TRUE,
            ..vk::PhysicalDeviceBufferDeviceAddressFeatures::default()
        };

    let mut enabled_acceleration_structure_features =
        vk::PhysicalDeviceAccelerationStructureFeaturesKHR {
            acceleration_structure: vk::TRUE,
            ..vk::PhysicalDeviceAccelerationStructureFeaturesKHR::default()
        };

    let create_info = DeviceCreateInfo::builder()
        .queue_create_infos(std::slice::from_ref(&queue_create_info))
        .enabled_extension_names(&device_extensions)
        .push_next(&mut physical_device_vulkan13_features)
        .push_next(&mut enabled_buffer_device_address_features)
        .push_next(&mut enabled_acceleration_structure_features);

    unsafe { instance.create_device(*physical_device, &create_info, None) }
        .map_err(RenderError::creating("logical device"))
}
