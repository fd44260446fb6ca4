use {
    super::{DriverError, Instance, PhysicalDevice},
    ash::{extensions::khr, vk},
    log::warn,
    raw_window_handle::{HasRawDisplayHandle, HasRawWindowHandle},
    std::{
        fmt::{Debug, Formatter},
        ops::Deref,
        sync::Arc,
        thread::panicking,
    },
};

/// Smart pointer handle to a window surface.
pub struct Surface {
    _instance: Arc<Instance>,
    surface: vk::SurfaceKHR,
    surface_ext: khr::Surface,
}

impl Surface {
    #[profiling::function]
    pub fn create(
        instance: &Arc<Instance>,
        window: &(impl HasRawDisplayHandle + HasRawWindowHandle),
    ) -> Result<Self, DriverError> {
        let instance = Arc::clone(instance);
        let surface_ext = khr::Surface::new(&instance.entry, &instance);
        let surface = unsafe {
            ash_window::create_surface(
                &instance.entry,
                &instance,
                window.raw_display_handle(),
                window.raw_window_handle(),
                None,
            )
        }
        .map_err(|err| {
            warn!("{err}");

            DriverError::DeviceUnavailable
        })?;

        Ok(Self {
            _instance: instance,
            surface,
            surface_ext,
        })
    }

    /// Returns one entry per queue family of `physical_device`: `true` if it can present here.
    pub fn present_support(this: &Self, physical_device: &PhysicalDevice) -> Vec<bool> {
        PhysicalDevice::queue_families(physical_device)
            .iter()
            .map(|family| unsafe {
                this.surface_ext
                    .get_physical_device_surface_support(
                        **physical_device,
                        family.idx,
                        this.surface,
                    )
                    .unwrap_or_default()
            })
            .collect()
    }

    /// Lists the formats the surface can be presented with.
    pub fn formats(
        this: &Self,
        physical_device: &PhysicalDevice,
    ) -> Result<Vec<vk::SurfaceFormatKHR>, DriverError> {
        unsafe {
            this.surface_ext
                .get_physical_device_surface_formats(**physical_device, this.surface)
        }
        .map_err(|err| {
            warn!("{err}");

            DriverError::DeviceUnavailable
        })
    }
}

impl Debug for Surface {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str("Surface")
    }
}

impl Deref for Surface {
    type Target = vk::SurfaceKHR;

    fn deref(&self) -> &Self::Target {
        &self.surface
    }
}

impl Drop for Surface {
    fn drop(&mut self) {
        if panicking() {
            return;
        }

        unsafe {
            self.surface_ext.destroy_surface(self.surface, None);
        }
    }
}
