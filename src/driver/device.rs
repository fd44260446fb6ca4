use {
    super::{
        physical_device::required_extension_names, DriverError, Instance, PhysicalDevice, Queue,
        QueueSelection,
    },
    ash::{extensions::khr, vk},
    gpu_allocator::{
        vulkan::{Allocator, AllocatorCreateDesc},
        AllocatorDebugSettings,
    },
    log::{error, info, warn},
    parking_lot::Mutex,
    std::{
        fmt::{Debug, Formatter},
        iter::repeat,
        mem::forget,
        ops::Deref,
        sync::Arc,
        thread::panicking,
    },
};

/// Opaque handle to a device object.
///
/// Owns the logical device, its memory allocator and the two queues used by the frame loops.
pub struct Device {
    pub(crate) accel_struct_ext: khr::AccelerationStructure,
    pub(crate) allocator: Option<Mutex<Allocator>>,
    device: ash::Device,

    /// The queue used for ray dispatch work.
    pub dispatch_queue: Queue,

    /// Vulkan instance pointer, which includes useful functions.
    pub(crate) instance: Arc<Instance>,

    /// The physical device, which contains useful property and limit data.
    pub physical_device: PhysicalDevice,

    /// The queue used for copy and present work. May be a clone of `dispatch_queue`.
    pub present_queue: Queue,

    pub(crate) ray_tracing_pipeline_ext: khr::RayTracingPipeline,
    pub(crate) surface_ext: khr::Surface,
    pub(crate) swapchain_ext: khr::Swapchain,
}

impl Device {
    /// Creates the logical device with every feature the frame pipeline uses enabled.
    ///
    /// Fails with [`DriverError::FeatureUnsupported`] if the physical device lacks any of them.
    #[profiling::function]
    pub fn create(
        instance: &Arc<Instance>,
        physical_device: PhysicalDevice,
        queues: QueueSelection,
        debug: bool,
    ) -> Result<Self, DriverError> {
        if let Some(missing) = physical_device.support.missing_feature() {
            warn!("{physical_device:?} does not support {missing}");

            return Err(DriverError::FeatureUnsupported);
        }

        let instance = Arc::clone(instance);
        let enabled_ext_names = required_extension_names().map(|name| name.as_ptr());

        let family_queue_counts = queues.family_queue_counts();
        let priorities = family_queue_counts
            .iter()
            .map(|&(_, count)| repeat(1.0).take(count as _).collect::<Box<[f32]>>())
            .collect::<Box<[_]>>();
        let queue_infos = family_queue_counts
            .iter()
            .zip(priorities.iter())
            .map(|(&(family, _), priorities)| {
                vk::DeviceQueueCreateInfo::builder()
                    .queue_family_index(family)
                    .queue_priorities(priorities)
                    .build()
            })
            .collect::<Box<[_]>>();

        let features = vk::PhysicalDeviceFeatures::builder()
            .shader_int64(true)
            .shader_storage_image_write_without_format(true);
        let mut vulkan_1_2_features = vk::PhysicalDeviceVulkan12Features::builder()
            .buffer_device_address(true)
            .scalar_block_layout(true)
            .timeline_semaphore(true);
        let mut accel_struct_features =
            vk::PhysicalDeviceAccelerationStructureFeaturesKHR::builder()
                .acceleration_structure(true);
        let mut ray_tracing_features =
            vk::PhysicalDeviceRayTracingPipelineFeaturesKHR::builder().ray_tracing_pipeline(true);

        let device_create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(&queue_infos)
            .enabled_extension_names(&enabled_ext_names)
            .enabled_features(&features)
            .push_next(&mut vulkan_1_2_features)
            .push_next(&mut accel_struct_features)
            .push_next(&mut ray_tracing_features);

        let device = unsafe {
            instance
                .create_device(*physical_device, &device_create_info, None)
                .map_err(|err| {
                    error!("unable to create device: {err}");

                    if err == vk::Result::ERROR_FEATURE_NOT_PRESENT
                        || err == vk::Result::ERROR_EXTENSION_NOT_PRESENT
                    {
                        DriverError::FeatureUnsupported
                    } else {
                        DriverError::DeviceUnavailable
                    }
                })?
        };

        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: (**instance).clone(),
            device: device.clone(),
            physical_device: *physical_device,
            debug_settings: AllocatorDebugSettings {
                log_leaks_on_shutdown: debug,
                log_memory_information: debug,
                log_allocations: false,
                ..Default::default()
            },
            buffer_device_address: true,
        })
        .map_err(|err| {
            warn!("{err}");

            unsafe {
                device.destroy_device(None);
            }

            DriverError::ResourceCreationFailed
        })?;

        let dispatch_queue = Queue::new(queues.dispatch.family, unsafe {
            device.get_device_queue(queues.dispatch.family, queues.dispatch.index)
        });
        let present_queue = if queues.is_shared() {
            dispatch_queue.clone()
        } else {
            Queue::new(queues.present.family, unsafe {
                device.get_device_queue(queues.present.family, queues.present.index)
            })
        };

        info!("Queues: {queues:?}");

        let accel_struct_ext = khr::AccelerationStructure::new(&instance, &device);
        let ray_tracing_pipeline_ext = khr::RayTracingPipeline::new(&instance, &device);
        let surface_ext = khr::Surface::new(&instance.entry, &instance);
        let swapchain_ext = khr::Swapchain::new(&instance, &device);

        Ok(Self {
            accel_struct_ext,
            allocator: Some(Mutex::new(allocator)),
            device,
            dispatch_queue,
            instance,
            physical_device,
            present_queue,
            ray_tracing_pipeline_ext,
            surface_ext,
            swapchain_ext,
        })
    }

    pub(crate) fn allocator(this: &Self) -> &Mutex<Allocator> {
        // Only taken during drop
        match &this.allocator {
            Some(allocator) => allocator,
            None => unreachable!(),
        }
    }

    /// Returns `true` if the device supports `usage` for optimally tiled images of `format`.
    pub fn supports_format_features(
        this: &Self,
        format: vk::Format,
        features: vk::FormatFeatureFlags,
    ) -> bool {
        let props = unsafe {
            this.instance
                .get_physical_device_format_properties(*this.physical_device, format)
        };

        props.optimal_tiling_features.contains(features)
    }
}

impl Debug for Device {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str("Device")
    }
}

impl Deref for Device {
    type Target = ash::Device;

    fn deref(&self) -> &Self::Target {
        &self.device
    }
}

impl Drop for Device {
    #[profiling::function]
    fn drop(&mut self) {
        if panicking() {
            // When panicking we don't want the GPU allocator to complain about leaks
            if let Some(allocator) = self.allocator.take() {
                forget(allocator);
            }

            return;
        }

        let res = unsafe { self.device.device_wait_idle() };

        if let Err(err) = res {
            warn!("device_wait_idle() failed: {err}");
        }

        self.allocator.take();

        unsafe {
            self.device.destroy_device(None);
        }
    }
}
