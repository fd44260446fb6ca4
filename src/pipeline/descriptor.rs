use {
    super::RayTracePipeline,
    crate::{
        accel::AccelerationStructure,
        driver::{Device, DriverError, Image},
    },
    ash::vk,
    log::{trace, warn},
    std::{ops::Deref, slice::from_ref, sync::Arc, thread::panicking},
};

/// Binding of the top-level acceleration structure.
pub const TLAS_BINDING: u32 = 0;

/// Binding of the output image array; element `n` is the output of frame slot `n`.
pub const OUTPUT_BINDING: u32 = 1;

const STAGES: vk::ShaderStageFlags = vk::ShaderStageFlags::from_raw(
    vk::ShaderStageFlags::RAYGEN_KHR.as_raw() | vk::ShaderStageFlags::CLOSEST_HIT_KHR.as_raw(),
);

/// The single descriptor set shared by every dispatch, and the pool it came from.
#[derive(Debug)]
pub struct DescriptorBindings {
    descriptor_pool: vk::DescriptorPool,
    descriptor_set: vk::DescriptorSet,
    device: Arc<Device>,
}

impl DescriptorBindings {
    pub(super) fn create_layout(device: &Device) -> Result<vk::DescriptorSetLayout, DriverError> {
        let bindings = [
            vk::DescriptorSetLayoutBinding::builder()
                .binding(TLAS_BINDING)
                .descriptor_type(vk::DescriptorType::ACCELERATION_STRUCTURE_KHR)
                .descriptor_count(1)
                .stage_flags(STAGES)
                .build(),
            vk::DescriptorSetLayoutBinding::builder()
                .binding(OUTPUT_BINDING)
                .descriptor_type(vk::DescriptorType::STORAGE_IMAGE)
                .descriptor_count(crate::scheduler::SLOT_COUNT as _)
                .stage_flags(vk::ShaderStageFlags::RAYGEN_KHR)
                .build(),
        ];

        unsafe {
            device.create_descriptor_set_layout(
                &vk::DescriptorSetLayoutCreateInfo::builder().bindings(&bindings),
                None,
            )
        }
        .map_err(|err| {
            warn!("{err}");

            DriverError::PipelineCompilationFailed
        })
    }

    /// Allocates the set and writes the acceleration structure plus one output image per slot.
    #[profiling::function]
    pub fn create(
        device: &Arc<Device>,
        pipeline: &RayTracePipeline,
        tlas: &AccelerationStructure,
        outputs: &[Image],
    ) -> Result<Self, DriverError> {
        let pool_sizes = [
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::ACCELERATION_STRUCTURE_KHR,
                descriptor_count: 1,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::STORAGE_IMAGE,
                descriptor_count: outputs.len() as _,
            },
        ];
        let descriptor_pool = unsafe {
            device.create_descriptor_pool(
                &vk::DescriptorPoolCreateInfo::builder()
                    .max_sets(1)
                    .pool_sizes(&pool_sizes),
                None,
            )
        }
        .map_err(|err| {
            warn!("{err}");

            DriverError::ResourceCreationFailed
        })?;

        // The pool is owned from here on so failures below release it
        let mut res = Self {
            descriptor_pool,
            descriptor_set: vk::DescriptorSet::null(),
            device: Arc::clone(device),
        };

        let layout = RayTracePipeline::descriptor_set_layout(pipeline);

        trace!("allocate_descriptor_sets");

        res.descriptor_set = unsafe {
            device.allocate_descriptor_sets(
                &vk::DescriptorSetAllocateInfo::builder()
                    .descriptor_pool(descriptor_pool)
                    .set_layouts(from_ref(&layout)),
            )
        }
        .map_err(|err| {
            warn!("{err}");

            DriverError::ResourceCreationFailed
        })?
        .into_iter()
        .next()
        .ok_or(DriverError::ResourceCreationFailed)?;

        let accel_structs = [**tlas];
        let mut accel_struct_write = vk::WriteDescriptorSetAccelerationStructureKHR::builder()
            .acceleration_structures(&accel_structs);
        let image_infos = outputs
            .iter()
            .map(|image| vk::DescriptorImageInfo {
                sampler: vk::Sampler::null(),
                image_view: Image::view(image),
                image_layout: vk::ImageLayout::GENERAL,
            })
            .collect::<Box<_>>();

        let mut tlas_write = vk::WriteDescriptorSet::builder()
            .dst_set(res.descriptor_set)
            .dst_binding(TLAS_BINDING)
            .descriptor_type(vk::DescriptorType::ACCELERATION_STRUCTURE_KHR)
            .push_next(&mut accel_struct_write)
            .build();
        tlas_write.descriptor_count = 1;

        let output_write = vk::WriteDescriptorSet::builder()
            .dst_set(res.descriptor_set)
            .dst_binding(OUTPUT_BINDING)
            .descriptor_type(vk::DescriptorType::STORAGE_IMAGE)
            .image_info(&image_infos)
            .build();

        unsafe {
            device.update_descriptor_sets(&[tlas_write, output_write], &[]);
        }

        Ok(res)
    }
}

impl Deref for DescriptorBindings {
    type Target = vk::DescriptorSet;

    fn deref(&self) -> &Self::Target {
        &self.descriptor_set
    }
}

impl Drop for DescriptorBindings {
    fn drop(&mut self) {
        if panicking() {
            return;
        }

        unsafe {
            self.device
                .destroy_descriptor_pool(self.descriptor_pool, None);
        }
    }
}
