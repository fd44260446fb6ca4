//! Acceleration structure resource types and the builders for both levels.
//!
//! Bottom-level structures are built once per mesh part during setup. The single top-level
//! structure is rebuilt by the dispatch loop every frame from an instance table whose length
//! never changes.

mod blas;
mod tlas;

pub use self::{
    blas::BottomLevel,
    tlas::{Instance, InstanceTable, TopLevel},
};

use {
    crate::driver::{Buffer, BufferInfo, Device, DriverError},
    ash::vk,
    log::{debug, warn},
    std::{
        fmt::{Debug, Formatter},
        ops::Deref,
        sync::Arc,
        thread::panicking,
    },
};

/// Smart pointer handle to an acceleration structure object and its backing buffer.
///
/// Methods are associated functions (`AccelerationStructure::device_address(&accel_struct)`).
pub struct AccelerationStructure {
    accel_struct: vk::AccelerationStructureKHR,

    /// Backing storage buffer for this object.
    pub buffer: Buffer,

    device: Arc<Device>,
    pub ty: vk::AccelerationStructureTypeKHR,
}

impl AccelerationStructure {
    #[profiling::function]
    pub fn create(
        device: &Arc<Device>,
        ty: vk::AccelerationStructureTypeKHR,
        size: vk::DeviceSize,
    ) -> Result<Self, DriverError> {
        let buffer = Buffer::create(
            device,
            BufferInfo::new(size, vk::BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR),
        )?;

        let create_info = vk::AccelerationStructureCreateInfoKHR::builder()
            .ty(ty)
            .buffer(*buffer)
            .size(size);
        let accel_struct = unsafe {
            device
                .accel_struct_ext
                .create_acceleration_structure(&create_info, None)
                .map_err(|err| {
                    warn!("{err}");

                    DriverError::ResourceCreationFailed
                })?
        };

        debug!("created {ty:?} acceleration structure ({size} bytes)");

        Ok(Self {
            accel_struct,
            buffer,
            device: Arc::clone(device),
            ty,
        })
    }

    pub fn device_address(this: &Self) -> vk::DeviceAddress {
        unsafe {
            this.device
                .accel_struct_ext
                .get_acceleration_structure_device_address(
                    &vk::AccelerationStructureDeviceAddressInfoKHR::builder()
                        .acceleration_structure(this.accel_struct),
                )
        }
    }

    /// Queries the sizes needed to build `geometry_info` with `max_primitive_counts`.
    #[profiling::function]
    pub fn size_of(
        device: &Device,
        geometry_info: &vk::AccelerationStructureBuildGeometryInfoKHR,
        max_primitive_counts: &[u32],
    ) -> Result<AccelerationStructureSize, DriverError> {
        let sizes = unsafe {
            device
                .accel_struct_ext
                .get_acceleration_structure_build_sizes(
                    vk::AccelerationStructureBuildTypeKHR::DEVICE,
                    geometry_info,
                    max_primitive_counts,
                )
        };

        if sizes.acceleration_structure_size == 0 {
            warn!("device reported an empty acceleration structure");

            return Err(DriverError::ResourceCreationFailed);
        }

        Ok(AccelerationStructureSize {
            build_size: sizes.build_scratch_size,
            create_size: sizes.acceleration_structure_size,
        })
    }
}

impl Debug for AccelerationStructure {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?} {:?}", self.ty, self.accel_struct)
    }
}

impl Deref for AccelerationStructure {
    type Target = vk::AccelerationStructureKHR;

    fn deref(&self) -> &Self::Target {
        &self.accel_struct
    }
}

impl Drop for AccelerationStructure {
    #[profiling::function]
    fn drop(&mut self) {
        if panicking() {
            return;
        }

        unsafe {
            self.device
                .accel_struct_ext
                .destroy_acceleration_structure(self.accel_struct, None);
        }
    }
}

/// Holds the results of [`AccelerationStructure::size_of`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct AccelerationStructureSize {
    /// Size of the scratch buffer needed by a build.
    pub build_size: vk::DeviceSize,

    /// Size of the backing buffer passed to [`AccelerationStructure::create`].
    pub create_size: vk::DeviceSize,
}

/// Creates a device-local scratch buffer of `size` bytes for acceleration structure builds.
pub(crate) fn create_scratch(
    device: &Arc<Device>,
    size: vk::DeviceSize,
) -> Result<Buffer, DriverError> {
    let alignment = device
        .physical_device
        .ray_tracing
        .min_accel_struct_scratch_offset_alignment as vk::DeviceSize;

    Buffer::create(
        device,
        BufferInfo::new(size.max(1), vk::BufferUsageFlags::STORAGE_BUFFER)
            .alignment(alignment.max(1)),
    )
}
