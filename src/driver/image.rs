use {
    super::{Device, DriverError},
    ash::vk,
    derive_builder::Builder,
    gpu_allocator::{
        vulkan::{Allocation, AllocationCreateDesc, AllocationScheme},
        MemoryLocation,
    },
    log::{trace, warn},
    std::{
        fmt::{Debug, Formatter},
        ops::Deref,
        sync::Arc,
        thread::panicking,
    },
};

/// Full color subresource range of a single-mip, single-layer image.
pub const COLOR_SUBRESOURCE_RANGE: vk::ImageSubresourceRange = vk::ImageSubresourceRange {
    aspect_mask: vk::ImageAspectFlags::COLOR,
    base_mip_level: 0,
    level_count: 1,
    base_array_layer: 0,
    layer_count: 1,
};

/// Smart pointer handle to a 2D image object, its memory and a default view.
pub struct Image {
    allocation: Option<Allocation>,
    device: Arc<Device>,
    image: vk::Image,
    pub info: ImageInfo,
    view: vk::ImageView,
}

impl Image {
    #[profiling::function]
    pub fn create(device: &Arc<Device>, info: impl Into<ImageInfo>) -> Result<Self, DriverError> {
        let info: ImageInfo = info.into();

        trace!("create: {:?}", info);

        let device = Arc::clone(device);
        let queue_family_indices = info.queue_family_indices.unwrap_or_default();
        let mut create_info = vk::ImageCreateInfo::builder()
            .image_type(vk::ImageType::TYPE_2D)
            .format(info.fmt)
            .extent(vk::Extent3D {
                width: info.width,
                height: info.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(info.usage)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        create_info = if info.queue_family_indices.is_some() {
            create_info
                .sharing_mode(vk::SharingMode::CONCURRENT)
                .queue_family_indices(&queue_family_indices)
        } else {
            create_info.sharing_mode(vk::SharingMode::EXCLUSIVE)
        };

        let image = unsafe {
            device.create_image(&create_info, None).map_err(|err| {
                warn!("unable to create image: {err}");

                DriverError::ResourceCreationFailed
            })?
        };
        let requirements = unsafe { device.get_image_memory_requirements(image) };
        let allocation = {
            profiling::scope!("allocate");

            let mut allocator = Device::allocator(&device).lock();

            allocator
                .allocate(&AllocationCreateDesc {
                    name: "image",
                    requirements,
                    location: MemoryLocation::GpuOnly,
                    linear: false,
                    allocation_scheme: AllocationScheme::GpuAllocatorManaged,
                })
                .map_err(|err| {
                    warn!("unable to allocate image memory: {err}");

                    unsafe {
                        device.destroy_image(image, None);
                    }

                    DriverError::ResourceCreationFailed
                })
                .and_then(|allocation| {
                    if let Err(err) = unsafe {
                        device.bind_image_memory(image, allocation.memory(), allocation.offset())
                    } {
                        warn!("unable to bind image memory: {err}");

                        if let Err(err) = allocator.free(allocation) {
                            warn!("unable to free image allocation: {err}")
                        }

                        unsafe {
                            device.destroy_image(image, None);
                        }

                        Err(DriverError::ResourceCreationFailed)
                    } else {
                        Ok(allocation)
                    }
                })
        }?;

        let view_info = vk::ImageViewCreateInfo::builder()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(info.fmt)
            .subresource_range(COLOR_SUBRESOURCE_RANGE);
        let view = match unsafe { device.create_image_view(&view_info, None) } {
            Ok(view) => view,
            Err(err) => {
                warn!("unable to create image view: {err}");

                Device::allocator(&device)
                    .lock()
                    .free(allocation)
                    .unwrap_or_else(|_| warn!("unable to free image allocation"));

                unsafe {
                    device.destroy_image(image, None);
                }

                return Err(DriverError::ResourceCreationFailed);
            }
        };

        debug_assert_ne!(image, vk::Image::null());

        Ok(Self {
            allocation: Some(allocation),
            device,
            image,
            info,
            view,
        })
    }

    pub fn extent(this: &Self) -> vk::Extent2D {
        vk::Extent2D {
            width: this.info.width,
            height: this.info.height,
        }
    }

    pub fn view(this: &Self) -> vk::ImageView {
        this.view
    }
}

impl Debug for Image {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?} {}x{}", self.image, self.info.width, self.info.height)
    }
}

impl Deref for Image {
    type Target = vk::Image;

    fn deref(&self) -> &Self::Target {
        &self.image
    }
}

impl Drop for Image {
    #[profiling::function]
    fn drop(&mut self) {
        if panicking() {
            return;
        }

        unsafe {
            self.device.destroy_image_view(self.view, None);
        }

        if let Some(allocation) = self.allocation.take() {
            Device::allocator(&self.device)
                .lock()
                .free(allocation)
                .unwrap_or_else(|_| warn!("unable to free image allocation"));
        }

        unsafe {
            self.device.destroy_image(self.image, None);
        }
    }
}

/// Information used to create an [`Image`].
#[derive(Builder, Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[builder(
    build_fn(private, name = "fallible_build"),
    derive(Debug),
    pattern = "owned"
)]
pub struct ImageInfo {
    pub width: u32,
    pub height: u32,
    pub fmt: vk::Format,
    pub usage: vk::ImageUsageFlags,

    /// When set the image is shared concurrently between these two queue families.
    #[builder(default, setter(strip_option))]
    pub queue_family_indices: Option<[u32; 2]>,
}

impl ImageInfo {
    /// Specifies a storage image which ray dispatch writes and transfer reads.
    #[allow(clippy::new_ret_no_self)]
    pub fn new_output(width: u32, height: u32, fmt: vk::Format) -> ImageInfoBuilder {
        ImageInfoBuilder::default()
            .width(width)
            .height(height)
            .fmt(fmt)
            .usage(vk::ImageUsageFlags::STORAGE | vk::ImageUsageFlags::TRANSFER_SRC)
    }
}

// HACK: https://github.com/colin-kiegel/rust-derive-builder/issues/56
impl ImageInfoBuilder {
    pub fn build(self) -> ImageInfo {
        self.fallible_build()
            .expect("All required fields set at initialization")
    }
}

impl From<ImageInfoBuilder> for ImageInfo {
    fn from(info: ImageInfoBuilder) -> Self {
        info.build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    pub fn output_image_info() {
        let info = ImageInfo::new_output(320, 200, vk::Format::B8G8R8A8_UNORM).build();

        assert_eq!(info.width, 320);
        assert_eq!(info.height, 200);
        assert!(info.usage.contains(vk::ImageUsageFlags::STORAGE));
        assert!(info.usage.contains(vk::ImageUsageFlags::TRANSFER_SRC));
        assert_eq!(info.queue_family_indices, None);
    }

    #[test]
    pub fn concurrent_output_image_info() {
        let info = ImageInfo::new_output(1, 1, vk::Format::R8G8B8A8_UNORM)
            .queue_family_indices([0, 2])
            .build();

        assert_eq!(info.queue_family_indices, Some([0, 2]));
    }
}
