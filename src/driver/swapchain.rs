use {
    super::{Device, DriverError, Queue, Surface},
    crate::barrier::TrackedImage,
    ash::vk,
    derive_builder::Builder,
    log::{debug, info, warn},
    std::{slice::from_ref, sync::Arc, thread::panicking, time::Duration},
};

/// Picks the surface format used by both the swapchain and the ray traced output images.
///
/// `B8G8R8A8_UNORM` is preferred; any other format is accepted only if `storage` reports that
/// shaders may write it as a storage image.
pub fn pick_surface_format(
    formats: &[vk::SurfaceFormatKHR],
    storage: impl Fn(vk::Format) -> bool,
) -> Option<vk::SurfaceFormatKHR> {
    let preferred = [vk::Format::B8G8R8A8_UNORM, vk::Format::R8G8B8A8_UNORM];

    preferred
        .iter()
        .find_map(|&fmt| {
            formats
                .iter()
                .find(|format| format.format == fmt && storage(fmt))
                .copied()
        })
        .or_else(|| formats.iter().find(|format| storage(format.format)).copied())
}

/// Returns the swapchain extent for a surface, or `None` while the surface has no area.
///
/// `width` and `height` are used only when the surface lets the swapchain decide its size.
pub fn surface_extent(
    capabilities: &vk::SurfaceCapabilitiesKHR,
    width: u32,
    height: u32,
) -> Option<vk::Extent2D> {
    let extent = match capabilities.current_extent.width {
        u32::MAX => vk::Extent2D {
            width: width.clamp(
                capabilities.min_image_extent.width,
                capabilities.max_image_extent.width,
            ),
            height: height.clamp(
                capabilities.min_image_extent.height,
                capabilities.max_image_extent.height,
            ),
        },
        _ => capabilities.current_extent,
    };

    (extent.width > 0 && extent.height > 0).then_some(extent)
}

/// Reasons [`Swapchain::acquire`] did not return an image.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AcquireError {
    /// No image became available within the timeout; try again.
    Timeout,

    /// The swapchain was recreated; try again.
    OutOfDate,

    /// The device was lost.
    DeviceLost,

    /// The surface was lost and the swapchain cannot be recreated.
    SurfaceLost,
}

/// An acquired presentable image.
#[derive(Clone, Copy, Debug)]
pub struct SwapchainImage {
    /// Signalled by the presentation engine once the image may be written.
    pub acquired: vk::Semaphore,
    pub extent: vk::Extent2D,
    pub idx: u32,
    pub image: vk::Image,

    /// Signalled by the copy submission; presentation waits on it.
    pub rendered: vk::Semaphore,
}

/// The presentable surface: owns the surface, its swapchain and per-image sync objects.
#[derive(Debug)]
pub struct Swapchain {
    acquired_semaphores: Vec<vk::Semaphore>,
    device: Arc<Device>,
    extent: vk::Extent2D,
    images: Vec<TrackedImage>,
    pub info: SwapchainInfo,
    rendered_semaphores: Vec<vk::Semaphore>,
    suboptimal: bool,
    surface: Surface,
    swapchain: vk::SwapchainKHR,
}

impl Swapchain {
    /// Creates the swapchain; `acquire_slots` acquire semaphores are created, one per frame slot.
    #[profiling::function]
    pub fn create(
        device: &Arc<Device>,
        surface: Surface,
        info: impl Into<SwapchainInfo>,
        acquire_slots: usize,
    ) -> Result<Self, DriverError> {
        let device = Arc::clone(device);
        let info = info.into();
        let mut res = Self {
            acquired_semaphores: vec![],
            device,
            extent: vk::Extent2D {
                width: info.width,
                height: info.height,
            },
            images: vec![],
            info,
            rendered_semaphores: vec![],
            suboptimal: false,
            surface,
            swapchain: vk::SwapchainKHR::null(),
        };

        for _ in 0..acquire_slots {
            let semaphore = Self::create_semaphore(&res.device)?;
            res.acquired_semaphores.push(semaphore);
        }

        if !res.recreate()? {
            warn!("surface has no area");

            return Err(DriverError::ResourceCreationFailed);
        }

        Ok(res)
    }

    fn create_semaphore(device: &Device) -> Result<vk::Semaphore, DriverError> {
        unsafe { device.create_semaphore(&vk::SemaphoreCreateInfo::default(), None) }.map_err(
            |err| {
                warn!("{err}");

                DriverError::ResourceCreationFailed
            },
        )
    }

    /// Returns the index of the next presentable image (`GetCurrentSlotIndex`).
    ///
    /// `slot` selects the acquire semaphore; the previous submission which waited on it must
    /// have completed.
    #[profiling::function]
    pub fn acquire(
        this: &mut Self,
        slot: usize,
        timeout: Duration,
    ) -> Result<SwapchainImage, AcquireError> {
        if this.suboptimal {
            Self::recreate_on_queue(this)?;

            return Err(AcquireError::OutOfDate);
        }

        let acquired = this.acquired_semaphores[slot];
        let res = unsafe {
            this.device.swapchain_ext.acquire_next_image(
                this.swapchain,
                timeout.as_nanos() as u64,
                acquired,
                vk::Fence::null(),
            )
        };

        match res {
            Ok((idx, suboptimal)) => {
                if suboptimal {
                    // Use the image; recreate after it is presented
                    this.suboptimal = true;
                }

                Ok(SwapchainImage {
                    acquired,
                    extent: this.extent,
                    idx,
                    image: *this.images[idx as usize],
                    rendered: this.rendered_semaphores[idx as usize],
                })
            }
            Err(err) if err == vk::Result::TIMEOUT || err == vk::Result::NOT_READY => {
                Err(AcquireError::Timeout)
            }
            Err(err)
                if err == vk::Result::ERROR_OUT_OF_DATE_KHR
                    || err == vk::Result::ERROR_FULL_SCREEN_EXCLUSIVE_MODE_LOST_EXT =>
            {
                this.suboptimal = true;

                Err(AcquireError::OutOfDate)
            }
            Err(err) if err == vk::Result::ERROR_DEVICE_LOST => Err(AcquireError::DeviceLost),
            Err(err) => {
                warn!("unable to acquire image: {err}");

                Err(AcquireError::SurfaceLost)
            }
        }
    }

    fn destroy(&mut self) {
        for semaphore in self.rendered_semaphores.drain(..) {
            unsafe {
                self.device.destroy_semaphore(semaphore, None);
            }
        }

        if self.swapchain != vk::SwapchainKHR::null() {
            unsafe {
                self.device
                    .swapchain_ext
                    .destroy_swapchain(self.swapchain, None);
            }

            self.swapchain = vk::SwapchainKHR::null();
        }

        self.images.clear();
    }

    pub fn extent(this: &Self) -> vk::Extent2D {
        this.extent
    }

    /// Queues `image` for presentation once its rendered semaphore is signalled.
    #[profiling::function]
    pub fn present(this: &mut Self, queue: &Queue, image: SwapchainImage) -> Result<(), DriverError> {
        let present_info = vk::PresentInfoKHR::builder()
            .wait_semaphores(from_ref(&image.rendered))
            .swapchains(from_ref(&this.swapchain))
            .image_indices(from_ref(&image.idx));
        let res = {
            let queue = Queue::lock(queue);

            unsafe {
                this.device
                    .swapchain_ext
                    .queue_present(*queue, &present_info)
            }
        };

        match res {
            Ok(false) => Ok(()),
            Ok(true) => {
                this.suboptimal = true;

                Ok(())
            }
            Err(err)
                if err == vk::Result::ERROR_OUT_OF_DATE_KHR
                    || err == vk::Result::ERROR_FULL_SCREEN_EXCLUSIVE_MODE_LOST_EXT =>
            {
                // Handled by the next acquire
                this.suboptimal = true;

                Ok(())
            }
            Err(err) => {
                warn!("unable to present: {err}");

                Err(DriverError::from_submit_err(err))
            }
        }
    }

    fn recreate_on_queue(this: &mut Self) -> Result<(), AcquireError> {
        let device = Arc::clone(&this.device);

        Queue::wait_idle(&device.present_queue, &device).map_err(|_| AcquireError::DeviceLost)?;

        match this.recreate() {
            Ok(true) => Ok(()),
            Ok(false) => Err(AcquireError::Timeout),
            Err(_) => Err(AcquireError::SurfaceLost),
        }
    }

    /// Replaces the swapchain with one matching the current surface.
    ///
    /// Returns `Ok(false)` and keeps the current swapchain while the surface has no area, as when
    /// the window is minimized.
    fn recreate(&mut self) -> Result<bool, DriverError> {
        let surface_capabilities = unsafe {
            self.device
                .surface_ext
                .get_physical_device_surface_capabilities(
                    *self.device.physical_device,
                    *self.surface,
                )
        }
        .map_err(|err| {
            warn!("{err}");

            DriverError::ResourceCreationFailed
        })?;

        let extent = surface_extent(&surface_capabilities, self.info.width, self.info.height);
        let Some(extent) = extent else {
            debug!("surface has no area");

            return Ok(false);
        };

        self.destroy();

        let mut desired_image_count = self
            .info
            .desired_image_count
            .max(surface_capabilities.min_image_count);
        if surface_capabilities.max_image_count != 0 {
            desired_image_count = desired_image_count.min(surface_capabilities.max_image_count);
        }

        info!("Swapchain image count: {}", desired_image_count);

        let present_mode_preference = if self.info.sync_display {
            vec![vk::PresentModeKHR::FIFO_RELAXED, vk::PresentModeKHR::FIFO]
        } else {
            vec![vk::PresentModeKHR::MAILBOX, vk::PresentModeKHR::IMMEDIATE]
        };

        let present_modes = unsafe {
            self.device
                .surface_ext
                .get_physical_device_surface_present_modes(
                    *self.device.physical_device,
                    *self.surface,
                )
        }
        .map_err(|err| {
            warn!("{err}");

            DriverError::ResourceCreationFailed
        })?;

        let present_mode = present_mode_preference
            .into_iter()
            .find(|mode| present_modes.contains(mode))
            .unwrap_or(vk::PresentModeKHR::FIFO);

        info!("Presentation mode: {:?}", present_mode);

        let pre_transform = if surface_capabilities
            .supported_transforms
            .contains(vk::SurfaceTransformFlagsKHR::IDENTITY)
        {
            vk::SurfaceTransformFlagsKHR::IDENTITY
        } else {
            surface_capabilities.current_transform
        };

        let swapchain_create_info = vk::SwapchainCreateInfoKHR::builder()
            .surface(*self.surface)
            .min_image_count(desired_image_count)
            .image_color_space(self.info.format.color_space)
            .image_format(self.info.format.format)
            .image_extent(extent)
            .image_usage(vk::ImageUsageFlags::TRANSFER_DST | vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(pre_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true)
            .image_array_layers(1);
        let swapchain = unsafe {
            self.device
                .swapchain_ext
                .create_swapchain(&swapchain_create_info, None)
        }
        .map_err(|err| {
            warn!("unable to create swapchain: {err}");

            DriverError::ResourceCreationFailed
        })?;
        self.swapchain = swapchain;

        let images = unsafe { self.device.swapchain_ext.get_swapchain_images(swapchain) }
            .map_err(|err| {
                warn!("{err}");

                DriverError::ResourceCreationFailed
            })?;

        for _ in 0..images.len() {
            let semaphore = Self::create_semaphore(&self.device)?;
            self.rendered_semaphores.push(semaphore);
        }

        debug!("swapchain {}x{} with {} images", extent.width, extent.height, images.len());

        self.extent = extent;
        self.images = images.into_iter().map(TrackedImage::new).collect();
        self.suboptimal = false;

        Ok(true)
    }

    /// Returns the barrier state tracker of the image at `idx`.
    pub fn tracked_image_mut(this: &mut Self, idx: u32) -> &mut TrackedImage {
        &mut this.images[idx as usize]
    }
}

impl Drop for Swapchain {
    #[profiling::function]
    fn drop(&mut self) {
        if panicking() {
            return;
        }

        self.destroy();

        for semaphore in self.acquired_semaphores.drain(..) {
            unsafe {
                self.device.destroy_semaphore(semaphore, None);
            }
        }
    }
}

#[derive(Builder, Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[builder(
    build_fn(private, name = "fallible_build"),
    derive(Debug),
    pattern = "owned"
)]
pub struct SwapchainInfo {
    #[builder(default = "2")]
    pub desired_image_count: u32,
    pub format: vk::SurfaceFormatKHR,
    pub width: u32,
    pub height: u32,
    #[builder(default = "true")]
    pub sync_display: bool,
}

impl SwapchainInfo {
    #[allow(clippy::new_ret_no_self)]
    pub fn new(width: u32, height: u32, format: vk::SurfaceFormatKHR) -> SwapchainInfoBuilder {
        SwapchainInfoBuilder::default()
            .width(width)
            .height(height)
            .format(format)
    }
}

// HACK: https://github.com/colin-kiegel/rust-derive-builder/issues/56
impl SwapchainInfoBuilder {
    pub fn build(self) -> SwapchainInfo {
        self.fallible_build()
            .expect("All required fields set at initialization")
    }
}

impl From<SwapchainInfoBuilder> for SwapchainInfo {
    fn from(info: SwapchainInfoBuilder) -> Self {
        info.build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn format(format: vk::Format) -> vk::SurfaceFormatKHR {
        vk::SurfaceFormatKHR {
            format,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        }
    }

    #[test]
    pub fn prefers_bgra_unorm() {
        let formats = [
            format(vk::Format::B8G8R8A8_SRGB),
            format(vk::Format::R8G8B8A8_UNORM),
            format(vk::Format::B8G8R8A8_UNORM),
        ];

        assert_eq!(
            pick_surface_format(&formats, |_| true),
            Some(format(vk::Format::B8G8R8A8_UNORM))
        );
    }

    #[test]
    pub fn skips_formats_without_storage() {
        let formats = [
            format(vk::Format::B8G8R8A8_UNORM),
            format(vk::Format::A2B10G10R10_UNORM_PACK32),
        ];
        let storage = |fmt| fmt == vk::Format::A2B10G10R10_UNORM_PACK32;

        assert_eq!(
            pick_surface_format(&formats, storage),
            Some(format(vk::Format::A2B10G10R10_UNORM_PACK32))
        );
        assert_eq!(pick_surface_format(&formats, |_| false), None);
    }

    fn capabilities(current: (u32, u32)) -> vk::SurfaceCapabilitiesKHR {
        vk::SurfaceCapabilitiesKHR {
            current_extent: vk::Extent2D {
                width: current.0,
                height: current.1,
            },
            min_image_extent: vk::Extent2D {
                width: 1,
                height: 1,
            },
            max_image_extent: vk::Extent2D {
                width: 4096,
                height: 4096,
            },
            ..Default::default()
        }
    }

    #[test]
    pub fn minimized_surface_has_no_extent() {
        assert_eq!(surface_extent(&capabilities((0, 0)), 1920, 1080), None);
        assert_eq!(surface_extent(&capabilities((800, 0)), 1920, 1080), None);
        assert_eq!(surface_extent(&capabilities((0, 600)), 1920, 1080), None);
    }

    #[test]
    pub fn surface_extent_follows_the_surface() {
        assert_eq!(
            surface_extent(&capabilities((800, 600)), 1920, 1080),
            Some(vk::Extent2D {
                width: 800,
                height: 600
            })
        );
    }

    #[test]
    pub fn undefined_surface_extent_clamps_requested_size() {
        assert_eq!(
            surface_extent(&capabilities((u32::MAX, u32::MAX)), 8192, 1080),
            Some(vk::Extent2D {
                width: 4096,
                height: 1080
            })
        );
    }

    #[test]
    pub fn swapchain_info_defaults() {
        let info = SwapchainInfo::new(640, 480, format(vk::Format::B8G8R8A8_UNORM)).build();

        assert_eq!(info.desired_image_count, 2);
        assert!(info.sync_display);
    }
}
