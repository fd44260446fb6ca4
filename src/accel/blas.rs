use {
    super::{create_scratch, AccelerationStructure},
    crate::{
        driver::{Buffer, CommandBuffer, Device, DriverError},
        scene::{MeshPart, Vertex},
    },
    ash::vk,
    log::{debug, warn},
    std::{mem::size_of, slice::from_ref, sync::Arc},
};

/// Usage of geometry buffers which are read by builds and by closest hit shaders.
const GEOMETRY_USAGE: vk::BufferUsageFlags = vk::BufferUsageFlags::from_raw(
    vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR.as_raw()
        | vk::BufferUsageFlags::STORAGE_BUFFER.as_raw(),
);

/// A bottom-level acceleration structure over the triangles of one mesh part.
///
/// Owns the vertex and index buffers it was built from; mirror hit records read them by address.
#[derive(Debug)]
pub struct BottomLevel {
    pub accel_struct: AccelerationStructure,
    pub indices: Buffer,
    pub primitive_count: u32,
    pub vertices: Buffer,
}

impl BottomLevel {
    /// Uploads `part` and builds its structure, blocking until the device has finished.
    ///
    /// `cmd_buf` must belong to the dispatch queue family and be idle.
    #[profiling::function]
    pub fn build(
        device: &Arc<Device>,
        cmd_buf: &mut CommandBuffer,
        part: &MeshPart,
    ) -> Result<Self, DriverError> {
        let primitive_count = part.primitive_count();
        if primitive_count == 0 {
            warn!("mesh part has no triangles");

            return Err(DriverError::ResourceCreationFailed);
        }

        let vertices =
            Buffer::create_from_slice(device, GEOMETRY_USAGE, bytemuck::cast_slice(&part.vertices))?;
        let indices =
            Buffer::create_from_slice(device, GEOMETRY_USAGE, bytemuck::cast_slice(&part.indices))?;

        let geometry = triangle_geometry(
            Buffer::device_address(&vertices),
            Buffer::device_address(&indices),
            part.max_vertex(),
        );
        let mut geometry_info = vk::AccelerationStructureBuildGeometryInfoKHR::builder()
            .ty(vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL)
            .flags(vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE)
            .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
            .geometries(from_ref(&geometry))
            .build();
        let sizes = AccelerationStructure::size_of(device, &geometry_info, &[primitive_count])?;

        debug!(
            "bottom-level size: {}, scratch size: {}",
            sizes.create_size, sizes.build_size
        );

        let accel_struct = AccelerationStructure::create(
            device,
            vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL,
            sizes.create_size,
        )?;
        let scratch = create_scratch(device, sizes.build_size)?;

        geometry_info.dst_acceleration_structure = *accel_struct;
        geometry_info.scratch_data = vk::DeviceOrHostAddressKHR {
            device_address: Buffer::device_address(&scratch),
        };

        let build_range = vk::AccelerationStructureBuildRangeInfoKHR::builder()
            .primitive_count(primitive_count)
            .build();

        CommandBuffer::begin(cmd_buf, 0)?;

        unsafe {
            device.accel_struct_ext.cmd_build_acceleration_structures(
                **cmd_buf,
                from_ref(&geometry_info),
                &[from_ref(&build_range)],
            );
        }

        CommandBuffer::end(cmd_buf)?;
        CommandBuffer::submit_and_wait(cmd_buf, &device.dispatch_queue)?;

        // The scratch buffer is dropped here, after the build has completed

        Ok(Self {
            accel_struct,
            indices,
            primitive_count,
            vertices,
        })
    }
}

fn triangle_geometry(
    vertex_address: vk::DeviceAddress,
    index_address: vk::DeviceAddress,
    max_vertex: u32,
) -> vk::AccelerationStructureGeometryKHR {
    vk::AccelerationStructureGeometryKHR::builder()
        .geometry_type(vk::GeometryTypeKHR::TRIANGLES)
        .geometry(vk::AccelerationStructureGeometryDataKHR {
            triangles: vk::AccelerationStructureGeometryTrianglesDataKHR::builder()
                .vertex_data(vk::DeviceOrHostAddressConstKHR {
                    device_address: vertex_address,
                })
                .vertex_stride(size_of::<Vertex>() as _)
                .max_vertex(max_vertex)
                .vertex_format(vk::Format::R32G32B32_SFLOAT)
                .index_data(vk::DeviceOrHostAddressConstKHR {
                    device_address: index_address,
                })
                .index_type(vk::IndexType::UINT32)
                .build(),
        })
        .flags(vk::GeometryFlagsKHR::OPAQUE)
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    pub fn triangle_geometry_layout() {
        let geometry = triangle_geometry(0x1000, 0x2000, 2);

        assert_eq!(geometry.geometry_type, vk::GeometryTypeKHR::TRIANGLES);
        assert!(geometry.flags.contains(vk::GeometryFlagsKHR::OPAQUE));

        let triangles = unsafe { geometry.geometry.triangles };
        assert_eq!(triangles.vertex_stride, 32);
        assert_eq!(triangles.max_vertex, 2);
        assert_eq!(triangles.index_type, vk::IndexType::UINT32);
        assert_eq!(triangles.vertex_format, vk::Format::R32G32B32_SFLOAT);
        assert_eq!(unsafe { triangles.vertex_data.device_address }, 0x1000);
        assert_eq!(unsafe { triangles.index_data.device_address }, 0x2000);
    }

    #[test]
    pub fn geometry_buffers_are_build_inputs() {
        assert!(GEOMETRY_USAGE
            .contains(vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR));
        assert!(GEOMETRY_USAGE.contains(vk::BufferUsageFlags::STORAGE_BUFFER));
    }
}
