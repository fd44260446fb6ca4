use {
    super::Instance,
    ash::vk,
    log::debug,
    std::{
        collections::HashSet,
        ffi::CStr,
        fmt::{Debug, Formatter},
        ops::Deref,
    },
};

/// Device extensions which the frame pipeline cannot run without.
pub(super) fn required_extension_names() -> [&'static CStr; 4] {
    [
        vk::KhrAccelerationStructureFn::name(),
        vk::KhrDeferredHostOperationsFn::name(),
        vk::KhrRayTracingPipelineFn::name(),
        vk::KhrSwapchainFn::name(),
    ]
}

#[derive(Copy, Clone, Debug, Eq, Hash, PartialEq)]
pub struct QueueFamily {
    pub idx: u32,
    pub queue_flags: vk::QueueFlags,
    pub queue_count: u32,
}

/// Capabilities of a physical device which ray tracing depends on.
///
/// Each flag is `true` when the device reports the matching extension or feature bit.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct DeviceSupport {
    pub swapchain_ext: bool,
    pub ray_tracing_exts: bool,
    pub buffer_device_address: bool,
    pub timeline_semaphore: bool,
    pub scalar_block_layout: bool,
    pub shader_int64: bool,
    pub storage_image_write_without_format: bool,
    pub acceleration_structure: bool,
    pub ray_tracing_pipeline: bool,
}

impl DeviceSupport {
    /// Returns `true` if the device has the extensions needed to be considered at all.
    pub fn is_candidate(&self) -> bool {
        self.swapchain_ext
    }

    /// Returns the name of the first missing ray tracing capability, if any.
    pub fn missing_feature(&self) -> Option<&'static str> {
        [
            (self.ray_tracing_exts, "ray tracing extensions"),
            (self.buffer_device_address, "buffer device address"),
            (self.timeline_semaphore, "timeline semaphore"),
            (self.scalar_block_layout, "scalar block layout"),
            (self.shader_int64, "shader int64"),
            (
                self.storage_image_write_without_format,
                "storage image write without format",
            ),
            (self.acceleration_structure, "acceleration structure"),
            (self.ray_tracing_pipeline, "ray tracing pipeline"),
        ]
        .into_iter()
        .find_map(|(supported, name)| (!supported).then_some(name))
    }
}

/// Shader binding table and acceleration structure limits of a device.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct RayTracingProperties {
    pub shader_group_handle_size: u32,
    pub shader_group_handle_alignment: u32,
    pub shader_group_base_alignment: u32,
    pub max_ray_recursion_depth: u32,
    pub min_accel_struct_scratch_offset_alignment: u32,
}

#[derive(Clone)]
pub struct PhysicalDevice {
    physical_device: vk::PhysicalDevice,
    pub props: vk::PhysicalDeviceProperties,
    queue_families: Vec<QueueFamily>,
    pub ray_tracing: RayTracingProperties,
    pub support: DeviceSupport,
}

impl PhysicalDevice {
    pub(super) fn new(instance: &Instance, physical_device: vk::PhysicalDevice) -> Self {
        let queue_families = unsafe {
            instance.get_physical_device_queue_family_properties(physical_device)
        }
        .into_iter()
        .enumerate()
        .map(|(idx, props)| QueueFamily {
            idx: idx as _,
            queue_flags: props.queue_flags,
            queue_count: props.queue_count,
        })
        .collect();

        let supported_exts = unsafe {
            instance
                .enumerate_device_extension_properties(physical_device)
                .unwrap_or_default()
        }
        .iter()
        .map(|prop| unsafe { CStr::from_ptr(prop.extension_name.as_ptr()) }.to_owned())
        .collect::<HashSet<_>>();
        let [accel_struct_ext, deferred_ext, ray_tracing_ext, swapchain_ext] =
            required_extension_names().map(|name| supported_exts.contains(name));
        let ray_tracing_exts = accel_struct_ext && deferred_ext && ray_tracing_ext;

        let mut vulkan_1_2_features = vk::PhysicalDeviceVulkan12Features::default();
        let mut accel_struct_features = vk::PhysicalDeviceAccelerationStructureFeaturesKHR::default();
        let mut ray_tracing_features = vk::PhysicalDeviceRayTracingPipelineFeaturesKHR::default();
        let mut features = vk::PhysicalDeviceFeatures2::builder()
            .push_next(&mut vulkan_1_2_features)
            .push_next(&mut accel_struct_features)
            .push_next(&mut ray_tracing_features)
            .build();

        let mut accel_struct_props = vk::PhysicalDeviceAccelerationStructurePropertiesKHR::default();
        let mut ray_tracing_props = vk::PhysicalDeviceRayTracingPipelinePropertiesKHR::default();
        let mut props = vk::PhysicalDeviceProperties2::builder()
            .push_next(&mut accel_struct_props)
            .push_next(&mut ray_tracing_props)
            .build();

        unsafe {
            instance.get_physical_device_features2(physical_device, &mut features);
            instance.get_physical_device_properties2(physical_device, &mut props);
        }

        let support = DeviceSupport {
            swapchain_ext,
            ray_tracing_exts,
            buffer_device_address: vulkan_1_2_features.buffer_device_address == vk::TRUE,
            timeline_semaphore: vulkan_1_2_features.timeline_semaphore == vk::TRUE,
            scalar_block_layout: vulkan_1_2_features.scalar_block_layout == vk::TRUE,
            shader_int64: features.features.shader_int64 == vk::TRUE,
            storage_image_write_without_format: features
                .features
                .shader_storage_image_write_without_format
                == vk::TRUE,
            acceleration_structure: accel_struct_features.acceleration_structure == vk::TRUE,
            ray_tracing_pipeline: ray_tracing_features.ray_tracing_pipeline == vk::TRUE,
        };
        let ray_tracing = RayTracingProperties {
            shader_group_handle_size: ray_tracing_props.shader_group_handle_size,
            shader_group_handle_alignment: ray_tracing_props.shader_group_handle_alignment,
            shader_group_base_alignment: ray_tracing_props.shader_group_base_alignment,
            max_ray_recursion_depth: ray_tracing_props.max_ray_recursion_depth,
            min_accel_struct_scratch_offset_alignment: accel_struct_props
                .min_acceleration_structure_scratch_offset_alignment,
        };

        let res = Self {
            physical_device,
            props: props.properties,
            queue_families,
            ray_tracing,
            support,
        };

        debug!("{res:?}: {support:?}");

        res
    }

    pub fn queue_families(this: &Self) -> &[QueueFamily] {
        &this.queue_families
    }

    /// Ranks devices so that ray tracing capable devices always win, then discrete over
    /// integrated over virtual.
    pub fn score(this: &Self) -> usize {
        let ray_tracing = if this.support.missing_feature().is_none() {
            10_000
        } else {
            0
        };

        ray_tracing + Self::score_device_type(this)
    }

    pub(super) fn score_device_type(this: &Self) -> usize {
        match this.props.device_type {
            vk::PhysicalDeviceType::DISCRETE_GPU => 1000,
            vk::PhysicalDeviceType::INTEGRATED_GPU => 200,
            vk::PhysicalDeviceType::VIRTUAL_GPU => 1,
            _ => 0,
        }
    }
}

impl Debug for PhysicalDevice {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        unsafe {
            write!(
                f,
                "{:?} ({:?})",
                CStr::from_ptr(self.props.device_name.as_ptr()),
                self.props.device_type
            )
        }
    }
}

impl Deref for PhysicalDevice {
    type Target = vk::PhysicalDevice;

    fn deref(&self) -> &Self::Target {
        &self.physical_device
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full_support() -> DeviceSupport {
        DeviceSupport {
            swapchain_ext: true,
            ray_tracing_exts: true,
            buffer_device_address: true,
            timeline_semaphore: true,
            scalar_block_layout: true,
            shader_int64: true,
            storage_image_write_without_format: true,
            acceleration_structure: true,
            ray_tracing_pipeline: true,
        }
    }

    #[test]
    pub fn full_support_has_nothing_missing() {
        assert_eq!(full_support().missing_feature(), None);
        assert!(full_support().is_candidate());
    }

    #[test]
    pub fn reports_first_missing_feature() {
        let support = DeviceSupport {
            timeline_semaphore: false,
            ray_tracing_pipeline: false,
            ..full_support()
        };

        assert_eq!(support.missing_feature(), Some("timeline semaphore"));
    }

    #[test]
    pub fn ray_tracing_extensions_are_checked_first() {
        let support = DeviceSupport {
            ray_tracing_exts: false,
            ..full_support()
        };

        assert_eq!(support.missing_feature(), Some("ray tracing extensions"));
        assert!(support.is_candidate());
    }

    #[test]
    pub fn no_swapchain_is_not_a_candidate() {
        let support = DeviceSupport {
            swapchain_ext: false,
            ..full_support()
        };

        assert!(!support.is_candidate());
    }
}
