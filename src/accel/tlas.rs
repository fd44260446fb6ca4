use {
    super::{create_scratch, AccelerationStructure, BottomLevel},
    crate::{
        barrier::record_global,
        driver::{AccessType, Buffer, BufferInfo, CommandBuffer, Device, DriverError},
    },
    ash::vk,
    bytemuck::{Pod, Zeroable},
    log::{debug, error},
    std::{mem::size_of, slice::from_ref, sync::Arc},
};

/// One `VkAccelerationStructureInstanceKHR`, laid out for direct upload.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct Instance {
    transform: [f32; 12],
    instance_id_and_mask: u32,
    instance_shader_table_offset_and_flags: u32,
    blas_address: vk::DeviceAddress,
}

impl Instance {
    pub fn new(
        transform: [f32; 12],
        id: u32,
        mask: u8,
        shader_table_offset: u32,
        flags: vk::GeometryInstanceFlagsKHR,
        blas_address: vk::DeviceAddress,
    ) -> Self {
        let mut res = Self {
            transform,
            instance_id_and_mask: 0,
            instance_shader_table_offset_and_flags: 0,
            blas_address,
        };
        res.set_id(id);
        res.set_mask(mask);
        res.set_shader_table_offset(shader_table_offset);
        res.set_flags(flags);

        res
    }

    pub fn id(&self) -> u32 {
        self.instance_id_and_mask & 0x00ff_ffff
    }

    pub fn mask(&self) -> u8 {
        (self.instance_id_and_mask >> 24) as u8
    }

    pub fn shader_table_offset(&self) -> u32 {
        self.instance_shader_table_offset_and_flags & 0x00ff_ffff
    }

    pub fn flags(&self) -> vk::GeometryInstanceFlagsKHR {
        vk::GeometryInstanceFlagsKHR::from_raw((self.instance_shader_table_offset_and_flags >> 24) as _)
    }

    pub fn transform(&self) -> &[f32; 12] {
        &self.transform
    }

    fn set_id(&mut self, id: u32) {
        let id = id & 0x00ff_ffff;
        self.instance_id_and_mask |= id;
    }

    fn set_mask(&mut self, mask: u8) {
        let mask = mask as u32;
        self.instance_id_and_mask |= mask << 24;
    }

    fn set_shader_table_offset(&mut self, offset: u32) {
        let offset = offset & 0x00ff_ffff;
        self.instance_shader_table_offset_and_flags |= offset;
    }

    fn set_flags(&mut self, flags: vk::GeometryInstanceFlagsKHR) {
        let flags = flags.as_raw() as u32;
        self.instance_shader_table_offset_and_flags |= flags << 24;
    }
}

/// The fixed-length list of instances, one per mesh part.
///
/// Instance `i` references bottom-level structure `i` and hit group record `i`; only the
/// transforms change after creation.
#[derive(Clone, Debug)]
pub struct InstanceTable {
    instances: Vec<Instance>,
}

impl InstanceTable {
    const FLAGS: vk::GeometryInstanceFlagsKHR = vk::GeometryInstanceFlagsKHR::from_raw(
        vk::GeometryInstanceFlagsKHR::TRIANGLE_FACING_CULL_DISABLE.as_raw()
            | vk::GeometryInstanceFlagsKHR::FORCE_OPAQUE.as_raw(),
    );

    const IDENTITY: [f32; 12] = [
        1.0, 0.0, 0.0, 0.0, //
        0.0, 1.0, 0.0, 0.0, //
        0.0, 0.0, 1.0, 0.0,
    ];

    pub fn new(blas_addresses: &[vk::DeviceAddress]) -> Self {
        let instances = blas_addresses
            .iter()
            .enumerate()
            .map(|(idx, &blas_address)| {
                Instance::new(
                    Self::IDENTITY,
                    idx as _,
                    0xff,
                    idx as _,
                    Self::FLAGS,
                    blas_address,
                )
            })
            .collect();

        Self { instances }
    }

    pub fn as_bytes(this: &Self) -> &[u8] {
        bytemuck::cast_slice(&this.instances)
    }

    pub fn instances(this: &Self) -> &[Instance] {
        &this.instances
    }

    pub fn len(this: &Self) -> usize {
        this.instances.len()
    }

    /// Replaces every transform; `transforms` must hold exactly one entry per instance.
    pub fn set_transforms(this: &mut Self, transforms: &[[f32; 12]]) -> Result<(), DriverError> {
        if transforms.len() != this.instances.len() {
            error!(
                "instance count changed from {} to {}",
                this.instances.len(),
                transforms.len()
            );

            return Err(DriverError::ResourceCreationFailed);
        }

        for (instance, transform) in this.instances.iter_mut().zip(transforms) {
            instance.transform = *transform;
        }

        Ok(())
    }
}

/// The top-level acceleration structure and the buffers used to rebuild it.
///
/// The result and scratch buffers are shared by both frame slots; builds recorded on the dispatch
/// queue are ordered by barriers. Each slot writes its own host-visible instance buffer, which is
/// never in use by the device while the slot is being recorded.
#[derive(Debug)]
pub struct TopLevel {
    pub accel_struct: AccelerationStructure,
    device: Arc<Device>,
    instance_buffers: Vec<Buffer>,
    scratch: Buffer,
    table: InstanceTable,
}

impl TopLevel {
    /// Allocates every buffer needed to build over `blas` with `slot_count` frame slots.
    #[profiling::function]
    pub fn create(
        device: &Arc<Device>,
        blas: &[BottomLevel],
        slot_count: usize,
    ) -> Result<Self, DriverError> {
        let blas_addresses = blas
            .iter()
            .map(|blas| AccelerationStructure::device_address(&blas.accel_struct))
            .collect::<Box<_>>();
        let table = InstanceTable::new(&blas_addresses);
        let instance_count = InstanceTable::len(&table) as u32;

        let instance_buffers = (0..slot_count)
            .map(|_| {
                Buffer::create(
                    device,
                    BufferInfo::new_mappable(
                        (size_of::<Instance>() * InstanceTable::len(&table)) as _,
                        vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR,
                    )
                    .alignment(16),
                )
            })
            .collect::<Result<Vec<_>, _>>()?;

        let geometry = instances_geometry(0);
        let geometry_info = build_info(&geometry);
        let sizes = AccelerationStructure::size_of(device, &geometry_info, &[instance_count])?;

        debug!(
            "top-level size: {}, scratch size: {}",
            sizes.create_size, sizes.build_size
        );

        let accel_struct = AccelerationStructure::create(
            device,
            vk::AccelerationStructureTypeKHR::TOP_LEVEL,
            sizes.create_size,
        )?;
        let scratch = create_scratch(device, sizes.build_size)?;

        Ok(Self {
            accel_struct,
            device: Arc::clone(device),
            instance_buffers,
            scratch,
            table,
        })
    }

    pub fn instance_count(this: &Self) -> usize {
        InstanceTable::len(&this.table)
    }

    /// Writes `transforms` into the instance buffer of `slot` and records a rebuild.
    ///
    /// The recorded commands wait for earlier traces and builds to finish with the shared buffers,
    /// and make the result visible to ray tracing shaders recorded afterwards.
    #[profiling::function]
    pub fn record_build(
        this: &mut Self,
        cmd_buf: &CommandBuffer,
        slot: usize,
        transforms: &[[f32; 12]],
    ) -> Result<(), DriverError> {
        InstanceTable::set_transforms(&mut this.table, transforms)?;

        let instance_buffer = &mut this.instance_buffers[slot];
        Buffer::copy_from_slice(instance_buffer, 0, InstanceTable::as_bytes(&this.table))?;

        let geometry = instances_geometry(Buffer::device_address(instance_buffer));
        let mut geometry_info = build_info(&geometry);
        geometry_info.dst_acceleration_structure = *this.accel_struct;
        geometry_info.scratch_data = vk::DeviceOrHostAddressKHR {
            device_address: Buffer::device_address(&this.scratch),
        };

        let build_range = vk::AccelerationStructureBuildRangeInfoKHR::builder()
            .primitive_count(InstanceTable::len(&this.table) as _)
            .build();

        record_global(
            &this.device,
            **cmd_buf,
            &[
                AccessType::RayTracingShaderReadAccelerationStructure,
                AccessType::AccelerationStructureBuildWrite,
            ],
            &[AccessType::AccelerationStructureBuildWrite],
        );

        unsafe {
            this.device.accel_struct_ext.cmd_build_acceleration_structures(
                **cmd_buf,
                from_ref(&geometry_info),
                &[from_ref(&build_range)],
            );
        }

        record_global(
            &this.device,
            **cmd_buf,
            &[AccessType::AccelerationStructureBuildWrite],
            &[AccessType::RayTracingShaderReadAccelerationStructure],
        );

        Ok(())
    }
}

fn instances_geometry(data: vk::DeviceAddress) -> vk::AccelerationStructureGeometryKHR {
    vk::AccelerationStructureGeometryKHR::builder()
        .geometry_type(vk::GeometryTypeKHR::INSTANCES)
        .geometry(vk::AccelerationStructureGeometryDataKHR {
            instances: vk::AccelerationStructureGeometryInstancesDataKHR::builder()
                .data(vk::DeviceOrHostAddressConstKHR {
                    device_address: data,
                })
                .build(),
        })
        .build()
}

fn build_info(
    geometry: &vk::AccelerationStructureGeometryKHR,
) -> vk::AccelerationStructureBuildGeometryInfoKHR {
    vk::AccelerationStructureBuildGeometryInfoKHR::builder()
        .ty(vk::AccelerationStructureTypeKHR::TOP_LEVEL)
        .flags(vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_BUILD)
        .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
        .geometries(from_ref(geometry))
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    pub fn instance_is_vulkan_sized() {
        assert_eq!(
            size_of::<Instance>(),
            size_of::<vk::AccelerationStructureInstanceKHR>()
        );
    }

    #[test]
    pub fn instance_bit_packing() {
        let instance = Instance::new(
            [0.0; 12],
            0x0123_4567,
            0xab,
            0x00fe_dcba,
            vk::GeometryInstanceFlagsKHR::FORCE_OPAQUE,
            0xdead_beef,
        );

        assert_eq!(instance.id(), 0x0023_4567);
        assert_eq!(instance.mask(), 0xab);
        assert_eq!(instance.shader_table_offset(), 0x00fe_dcba);
        assert_eq!(instance.flags(), vk::GeometryInstanceFlagsKHR::FORCE_OPAQUE);
    }

    #[test]
    pub fn table_indexes_hit_groups_in_part_order() {
        let table = InstanceTable::new(&[0x100, 0x200]);
        let instances = InstanceTable::instances(&table);

        assert_eq!(InstanceTable::len(&table), 2);

        for (idx, instance) in instances.iter().enumerate() {
            assert_eq!(instance.id(), idx as u32);
            assert_eq!(instance.shader_table_offset(), idx as u32);
            assert_eq!(instance.mask(), 0xff);
        }

        assert_eq!(instances[0].blas_address, 0x100);
        assert_eq!(instances[1].blas_address, 0x200);
        assert_eq!(InstanceTable::as_bytes(&table).len(), 128);
    }

    #[test]
    pub fn transforms_keep_instance_count() {
        let mut table = InstanceTable::new(&[0x100, 0x200]);
        let mut transform = InstanceTable::IDENTITY;
        transform[3] = 5.0;

        InstanceTable::set_transforms(&mut table, &[transform, InstanceTable::IDENTITY]).unwrap();

        assert_eq!(InstanceTable::instances(&table)[0].transform()[3], 5.0);
        assert_eq!(InstanceTable::len(&table), 2);

        assert_eq!(
            InstanceTable::set_transforms(&mut table, &[transform]),
            Err(DriverError::ResourceCreationFailed)
        );
        assert_eq!(InstanceTable::len(&table), 2);
    }

    #[test]
    pub fn identical_transforms_rebuild_identically() {
        let mut first = InstanceTable::new(&[0x100, 0x200]);
        let mut second = first.clone();
        let transforms = [[0.5; 12], [0.25; 12]];

        InstanceTable::set_transforms(&mut first, &transforms).unwrap();
        InstanceTable::set_transforms(&mut second, &transforms).unwrap();
        InstanceTable::set_transforms(&mut second, &transforms).unwrap();

        assert_eq!(
            InstanceTable::as_bytes(&first),
            InstanceTable::as_bytes(&second)
        );
    }
}
