use {
    super::{RayTracePipeline, ShaderGroup},
    crate::driver::{align_up, Buffer, BufferInfo, Device, DriverError, RayTracingProperties},
    ash::vk,
    log::{debug, error},
    std::sync::Arc,
};

/// One shader table record: the shader group it selects plus that group's local data.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ShaderRecord {
    /// Writes the slot's output image, `outputs[output_slot]`.
    RayGen { output_slot: u32 },

    Miss,

    /// Reflects rays; carries the device addresses of the part's vertex and index buffers.
    Mirror {
        vertices: vk::DeviceAddress,
        indices: vk::DeviceAddress,
    },

    /// Returns a constant color.
    Edge { color: [f32; 4] },
}

impl ShaderRecord {
    pub fn group(&self) -> ShaderGroup {
        match self {
            Self::RayGen { .. } => ShaderGroup::RayGen,
            Self::Miss => ShaderGroup::Miss,
            Self::Mirror { .. } => ShaderGroup::MirrorHit,
            Self::Edge { .. } => ShaderGroup::EdgeHit,
        }
    }

    /// Size in bytes of the local data which follows the shader identifier.
    pub fn local_size(&self) -> usize {
        match self {
            Self::RayGen { .. } => 4,
            Self::Miss => 0,
            Self::Mirror { .. } => 16,
            Self::Edge { .. } => 16,
        }
    }

    fn write_local(&self, dst: &mut [u8]) {
        match self {
            Self::RayGen { output_slot } => dst[0..4].copy_from_slice(&output_slot.to_ne_bytes()),
            Self::Miss => (),
            Self::Mirror { vertices, indices } => {
                dst[0..8].copy_from_slice(&vertices.to_ne_bytes());
                dst[8..16].copy_from_slice(&indices.to_ne_bytes());
            }
            Self::Edge { color } => dst[0..16].copy_from_slice(bytemuck::bytes_of(color)),
        }
    }
}

/// Which table a record is placed in.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum TableKind {
    RayGen,
    Miss,
    Hit,
}

impl From<ShaderGroup> for TableKind {
    fn from(group: ShaderGroup) -> Self {
        match group {
            ShaderGroup::RayGen => Self::RayGen,
            ShaderGroup::Miss => Self::Miss,
            ShaderGroup::MirrorHit | ShaderGroup::EdgeHit => Self::Hit,
        }
    }
}

/// Shader group handle sizes and alignments reported by the device.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct TableLayout {
    pub handle_size: u64,
    pub handle_alignment: u64,
    pub base_alignment: u64,
}

impl From<&RayTracingProperties> for TableLayout {
    fn from(props: &RayTracingProperties) -> Self {
        Self {
            handle_size: props.shader_group_handle_size as _,
            handle_alignment: props.shader_group_handle_alignment as _,
            base_alignment: props.shader_group_base_alignment as _,
        }
    }
}

/// Location of one table within the table buffer.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct TableRegion {
    pub offset: u64,
    pub stride: u64,
    pub count: u64,
}

impl TableRegion {
    pub fn size(&self) -> u64 {
        self.stride * self.count
    }

    /// The byte range of record `idx`.
    pub fn record(&self, idx: u64) -> std::ops::Range<usize> {
        let start = self.offset + idx * self.stride;

        start as usize..(start + self.stride) as usize
    }
}

/// Host copy of every table, ready to be uploaded.
#[derive(Clone, Debug, PartialEq)]
pub struct TableData {
    pub data: Vec<u8>,
    pub hit: TableRegion,
    pub miss: TableRegion,
    pub raygen: TableRegion,
}

impl TableData {
    /// Lays out and fills the ray generation, miss and hit tables.
    ///
    /// `handles` holds the identifier of every shader group, tightly packed in group order.
    /// Each table starts at a base-aligned offset and uses the largest record of that table to
    /// size its stride. Ray generation records are addressed directly by each dispatch, so their
    /// stride is also base-aligned.
    pub fn new(
        layout: TableLayout,
        handles: &[u8],
        raygen: &[ShaderRecord],
        miss: &[ShaderRecord],
        hit: &[ShaderRecord],
    ) -> Result<Self, DriverError> {
        if !layout.handle_alignment.is_power_of_two() || !layout.base_alignment.is_power_of_two()
        {
            error!("invalid shader table alignment: {layout:?}");

            return Err(DriverError::ShaderTableBuildFailed);
        }

        let tables = [
            (TableKind::RayGen, raygen, layout.base_alignment),
            (TableKind::Miss, miss, layout.handle_alignment),
            (TableKind::Hit, hit, layout.handle_alignment),
        ];

        let mut regions = [TableRegion::default(); 3];
        let mut offset = 0;

        for ((kind, records, stride_alignment), region) in tables.iter().zip(regions.iter_mut()) {
            if records.is_empty() {
                error!("{kind:?} table has no records");

                return Err(DriverError::ShaderTableBuildFailed);
            }

            if let Some(record) = records
                .iter()
                .find(|record| TableKind::from(record.group()) != *kind)
            {
                error!("{record:?} does not belong in the {kind:?} table");

                return Err(DriverError::ShaderTableBuildFailed);
            }

            let max_local_size = records
                .iter()
                .map(ShaderRecord::local_size)
                .max()
                .unwrap_or_default() as u64;

            offset = align_up(offset, layout.base_alignment);
            *region = TableRegion {
                offset,
                stride: align_up(layout.handle_size + max_local_size, *stride_alignment),
                count: records.len() as _,
            };
            offset += region.size();
        }

        let mut data = vec![0u8; offset as usize];

        for ((_, records, _), region) in tables.iter().zip(regions.iter()) {
            for (idx, record) in records.iter().enumerate() {
                let handle = group_handle(layout, handles, record.group())?;
                let dst = &mut data[region.record(idx as _)];
                let (dst_handle, dst_local) = dst.split_at_mut(layout.handle_size as usize);

                dst_handle.copy_from_slice(handle);
                record.write_local(dst_local);
            }
        }

        let [raygen, miss, hit] = regions;

        debug!(
            "shader tables: raygen {raygen:?}, miss {miss:?}, hit {hit:?} ({} bytes)",
            data.len()
        );

        Ok(Self {
            data,
            hit,
            miss,
            raygen,
        })
    }
}

fn group_handle(layout: TableLayout, handles: &[u8], group: ShaderGroup) -> Result<&[u8], DriverError> {
    let start = group as usize * layout.handle_size as usize;
    let end = start + layout.handle_size as usize;

    handles.get(start..end).ok_or_else(|| {
        error!("missing handle for {group:?}");

        DriverError::ShaderTableBuildFailed
    })
}

/// The uploaded shader tables.
///
/// Rebuilt only when the pipeline or a referenced resource is recreated.
#[derive(Debug)]
pub struct ShaderTables {
    address: vk::DeviceAddress,
    buffer: Buffer,
    hit: TableRegion,
    miss: TableRegion,
    raygen: TableRegion,
}

impl ShaderTables {
    /// Builds one ray generation record per frame slot, one miss record, and `hit` in instance
    /// order.
    #[profiling::function]
    pub fn build(
        device: &Arc<Device>,
        pipeline: &RayTracePipeline,
        slot_count: usize,
        hit: &[ShaderRecord],
    ) -> Result<Self, DriverError> {
        let layout = TableLayout::from(&device.physical_device.ray_tracing);
        let raygen = (0..slot_count)
            .map(|output_slot| ShaderRecord::RayGen {
                output_slot: output_slot as _,
            })
            .collect::<Box<_>>();
        let tables = TableData::new(
            layout,
            RayTracePipeline::group_handles(pipeline),
            &raygen,
            &[ShaderRecord::Miss],
            hit,
        )?;

        let mut buffer = Buffer::create(
            device,
            BufferInfo::new_mappable(
                tables.data.len() as _,
                vk::BufferUsageFlags::SHADER_BINDING_TABLE_KHR,
            )
            .alignment(layout.base_alignment),
        )
        .map_err(|_| DriverError::ShaderTableBuildFailed)?;
        Buffer::copy_from_slice(&mut buffer, 0, &tables.data)
            .map_err(|_| DriverError::ShaderTableBuildFailed)?;
        buffer.name = Some("shader tables");

        let address = Buffer::device_address(&buffer);

        Ok(Self {
            address,
            buffer,
            hit: tables.hit,
            miss: tables.miss,
            raygen: tables.raygen,
        })
    }

    fn region(&self, region: TableRegion) -> vk::StridedDeviceAddressRegionKHR {
        vk::StridedDeviceAddressRegionKHR {
            device_address: self.address + region.offset,
            stride: region.stride,
            size: region.size(),
        }
    }

    /// The ray generation record of `slot`; its size equals its stride.
    pub fn raygen_region(this: &Self, slot: usize) -> vk::StridedDeviceAddressRegionKHR {
        vk::StridedDeviceAddressRegionKHR {
            device_address: this.address + this.raygen.offset + slot as u64 * this.raygen.stride,
            stride: this.raygen.stride,
            size: this.raygen.stride,
        }
    }

    pub fn miss_region(this: &Self) -> vk::StridedDeviceAddressRegionKHR {
        this.region(this.miss)
    }

    pub fn hit_region(this: &Self) -> vk::StridedDeviceAddressRegionKHR {
        this.region(this.hit)
    }

    pub fn hit_record_count(this: &Self) -> u64 {
        this.hit.count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LAYOUT: TableLayout = TableLayout {
        handle_size: 32,
        handle_alignment: 32,
        base_alignment: 64,
    };

    /// Four distinct 32 byte handles; every byte of handle `n` is `n + 1`.
    fn handles() -> Vec<u8> {
        (0..4u8).flat_map(|group| [group + 1; 32]).collect()
    }

    fn hit_records() -> [ShaderRecord; 2] {
        [
            ShaderRecord::Mirror {
                vertices: 0x1000,
                indices: 0x2000,
            },
            ShaderRecord::Edge {
                color: [1.0, 0.5, 0.25, 1.0],
            },
        ]
    }

    fn tables() -> TableData {
        TableData::new(
            LAYOUT,
            &handles(),
            &[
                ShaderRecord::RayGen { output_slot: 0 },
                ShaderRecord::RayGen { output_slot: 1 },
            ],
            &[ShaderRecord::Miss],
            &hit_records(),
        )
        .unwrap()
    }

    #[test]
    pub fn strides_fit_largest_record() {
        let tables = tables();

        // 32 + 4 rounded up to the base alignment
        assert_eq!(tables.raygen.stride, 64);
        assert_eq!(tables.miss.stride, 32);

        // 32 + 16 rounded up to the handle alignment
        assert_eq!(tables.hit.stride, 64);

        for region in [tables.raygen, tables.miss, tables.hit] {
            assert_eq!(region.offset % LAYOUT.base_alignment, 0);
            assert_eq!(region.stride % LAYOUT.handle_alignment, 0);
        }

        assert_eq!(tables.raygen.offset, 0);
        assert_eq!(tables.miss.offset, 128);
        assert_eq!(tables.hit.offset, 192);
        assert_eq!(tables.data.len(), 320);
    }

    #[test]
    pub fn records_start_with_group_handles() {
        let tables = tables();
        let handles = handles();
        let handle = |group: ShaderGroup| group_handle(LAYOUT, &handles, group).unwrap();

        for idx in 0..2 {
            let record = &tables.data[tables.raygen.record(idx)];
            assert_eq!(&record[0..32], handle(ShaderGroup::RayGen));
            assert_eq!(&record[32..36], &(idx as u32).to_ne_bytes());
        }

        let miss = &tables.data[tables.miss.record(0)];
        assert_eq!(&miss[0..32], handle(ShaderGroup::Miss));
    }

    #[test]
    pub fn hit_table_follows_instance_order() {
        let tables = tables();

        assert_eq!(tables.hit.count, 2);

        let mirror = &tables.data[tables.hit.record(0)];
        assert!(mirror[0..32].iter().all(|&byte| byte == 3));
        assert_eq!(&mirror[32..40], &0x1000u64.to_ne_bytes());
        assert_eq!(&mirror[40..48], &0x2000u64.to_ne_bytes());

        let edge = &tables.data[tables.hit.record(1)];
        assert!(edge[0..32].iter().all(|&byte| byte == 4));
        assert_eq!(
            &edge[32..48],
            bytemuck::bytes_of(&[1.0f32, 0.5, 0.25, 1.0])
        );
    }

    #[test]
    pub fn empty_table_fails() {
        assert_eq!(
            TableData::new(LAYOUT, &handles(), &[], &[ShaderRecord::Miss], &hit_records()),
            Err(DriverError::ShaderTableBuildFailed)
        );
    }

    #[test]
    pub fn misplaced_record_fails() {
        assert_eq!(
            TableData::new(
                LAYOUT,
                &handles(),
                &[ShaderRecord::RayGen { output_slot: 0 }],
                &[ShaderRecord::Miss],
                &[ShaderRecord::Miss],
            ),
            Err(DriverError::ShaderTableBuildFailed)
        );
    }

    #[test]
    pub fn missing_handles_fail() {
        assert_eq!(
            TableData::new(
                LAYOUT,
                &handles()[0..64],
                &[ShaderRecord::RayGen { output_slot: 0 }],
                &[ShaderRecord::Miss],
                &hit_records(),
            ),
            Err(DriverError::ShaderTableBuildFailed)
        );
    }
}
