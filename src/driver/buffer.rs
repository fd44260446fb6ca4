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

/// Smart pointer handle to a buffer object and its memory.
///
/// Methods are associated functions (`Buffer::device_address(&buf)`) so they do not clash with
/// the methods of the dereferenced `vk::Buffer`.
pub struct Buffer {
    allocation: Option<Allocation>,
    buffer: vk::Buffer,
    device: Arc<Device>,
    pub info: BufferInfo,
    pub name: Option<&'static str>,
}

impl Buffer {
    #[profiling::function]
    pub fn create(device: &Arc<Device>, info: impl Into<BufferInfo>) -> Result<Self, DriverError> {
        let info = info.into();

        trace!("create: {:?}", info);

        let device = Arc::clone(device);
        let buffer_info = vk::BufferCreateInfo {
            size: info.size,
            usage: info.usage,
            sharing_mode: vk::SharingMode::EXCLUSIVE,
            ..Default::default()
        };
        let buffer = unsafe {
            device.create_buffer(&buffer_info, None).map_err(|err| {
                warn!("{err}");

                DriverError::ResourceCreationFailed
            })?
        };
        let mut requirements = unsafe { device.get_buffer_memory_requirements(buffer) };
        requirements.alignment = requirements.alignment.max(info.alignment);

        let memory_location = if info.can_map {
            MemoryLocation::CpuToGpu
        } else {
            MemoryLocation::GpuOnly
        };
        let allocation = Device::allocator(&device)
            .lock()
            .allocate(&AllocationCreateDesc {
                name: "buffer",
                requirements,
                location: memory_location,
                linear: true, // Buffers are always linear
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })
            .map_err(|err| {
                warn!("{err}");

                unsafe {
                    device.destroy_buffer(buffer, None);
                }

                DriverError::ResourceCreationFailed
            })?;

        // Bind memory to the buffer
        if let Err(err) =
            unsafe { device.bind_buffer_memory(buffer, allocation.memory(), allocation.offset()) }
        {
            warn!("{err}");

            Device::allocator(&device)
                .lock()
                .free(allocation)
                .unwrap_or_else(|_| warn!("Unable to free buffer allocation"));

            unsafe {
                device.destroy_buffer(buffer, None);
            }

            return Err(DriverError::ResourceCreationFailed);
        }

        Ok(Self {
            allocation: Some(allocation),
            buffer,
            device,
            info,
            name: None,
        })
    }

    /// Creates a host-visible buffer holding a copy of `data`.
    pub fn create_from_slice(
        device: &Arc<Device>,
        usage: vk::BufferUsageFlags,
        data: &[u8],
    ) -> Result<Self, DriverError> {
        let mut buffer = Self::create(
            device,
            BufferInfo::new_mappable(data.len() as _, usage),
        )?;
        Self::copy_from_slice(&mut buffer, 0, data)?;

        Ok(buffer)
    }

    /// Writes `slice` into host-visible memory at `offset`.
    pub fn copy_from_slice(
        this: &mut Self,
        offset: vk::DeviceSize,
        slice: &[u8],
    ) -> Result<(), DriverError> {
        let start = offset as usize;
        let end = start + slice.len();
        let dst = Self::mapped_slice_mut(this)?;

        if end > dst.len() {
            warn!("write of {} bytes at {start} overflows buffer", slice.len());

            return Err(DriverError::ResourceCreationFailed);
        }

        dst[start..end].copy_from_slice(slice);

        Ok(())
    }

    pub fn device_address(this: &Self) -> vk::DeviceAddress {
        unsafe {
            this.device.get_buffer_device_address(
                &vk::BufferDeviceAddressInfo::builder().buffer(this.buffer),
            )
        }
    }

    /// Returns the mapped memory if the buffer is host visible.
    pub fn mapped_slice(this: &Self) -> Result<&[u8], DriverError> {
        this.allocation
            .as_ref()
            .and_then(|allocation| allocation.mapped_slice())
            .map(|slice| &slice[0..this.info.size as usize])
            .ok_or_else(|| {
                warn!("buffer is not host visible");

                DriverError::ResourceCreationFailed
            })
    }

    /// Returns the mapped memory if the buffer is host visible.
    pub fn mapped_slice_mut(this: &mut Self) -> Result<&mut [u8], DriverError> {
        let size = this.info.size as usize;

        this.allocation
            .as_mut()
            .and_then(|allocation| allocation.mapped_slice_mut())
            .map(|slice| &mut slice[0..size])
            .ok_or_else(|| {
                warn!("buffer is not host visible");

                DriverError::ResourceCreationFailed
            })
    }
}

impl Debug for Buffer {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if let Some(name) = &self.name {
            write!(f, "{} ({:?})", name, self.buffer)
        } else {
            write!(f, "{:?}", self.buffer)
        }
    }
}

impl Deref for Buffer {
    type Target = vk::Buffer;

    fn deref(&self) -> &Self::Target {
        &self.buffer
    }
}

impl Drop for Buffer {
    #[profiling::function]
    fn drop(&mut self) {
        if panicking() {
            return;
        }

        if let Some(allocation) = self.allocation.take() {
            Device::allocator(&self.device)
                .lock()
                .free(allocation)
                .unwrap_or_else(|_| warn!("Unable to free buffer allocation"));
        }

        unsafe {
            self.device.destroy_buffer(self.buffer, None);
        }
    }
}

#[derive(Builder, Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[builder(
    build_fn(private, name = "fallible_build"),
    derive(Debug),
    pattern = "owned"
)]
pub struct BufferInfo {
    pub size: vk::DeviceSize,
    pub usage: vk::BufferUsageFlags,

    /// Minimum alignment of the buffer memory, on top of what the device requires.
    #[builder(default = "1")]
    pub alignment: vk::DeviceSize,

    /// Specifies a buffer whose memory is host visible.
    #[builder(default)]
    pub can_map: bool,
}

impl BufferInfo {
    #[allow(clippy::new_ret_no_self)]
    pub fn new(size: vk::DeviceSize, usage: vk::BufferUsageFlags) -> BufferInfoBuilder {
        BufferInfoBuilder::default()
            .size(size)
            .usage(usage | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS)
    }

    pub fn new_mappable(size: vk::DeviceSize, usage: vk::BufferUsageFlags) -> BufferInfoBuilder {
        Self::new(size, usage).can_map(true)
    }
}

// HACK: https://github.com/colin-kiegel/rust-derive-builder/issues/56
impl BufferInfoBuilder {
    pub fn build(self) -> BufferInfo {
        self.fallible_build()
            .expect("All required fields set at initialization")
    }
}

impl From<BufferInfoBuilder> for BufferInfo {
    fn from(info: BufferInfoBuilder) -> Self {
        info.build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    pub fn buffer_info_defaults() {
        let info = BufferInfo::new(64, vk::BufferUsageFlags::STORAGE_BUFFER).build();

        assert_eq!(info.size, 64);
        assert_eq!(info.alignment, 1);
        assert!(!info.can_map);
        assert!(info
            .usage
            .contains(vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS));
    }

    #[test]
    pub fn mappable_buffer_info() {
        let info = BufferInfo::new_mappable(16, vk::BufferUsageFlags::SHADER_BINDING_TABLE_KHR)
            .alignment(64)
            .build();

        assert!(info.can_map);
        assert_eq!(info.alignment, 64);
    }

    #[test]
    #[should_panic(expected = "All required fields set at initialization")]
    pub fn buffer_info_builder_uninit_size() {
        BufferInfoBuilder::default().build();
    }
}
