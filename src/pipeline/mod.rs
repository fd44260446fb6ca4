//! The ray tracing pipeline, its global arguments, and its shader tables.

mod descriptor;
mod shader_table;

pub use self::{
    descriptor::DescriptorBindings,
    shader_table::{ShaderRecord, ShaderTables, TableData, TableKind, TableLayout, TableRegion},
};

use {
    crate::driver::{
        Device, DriverError, EntryPoint, ShaderCompiler, ShaderLibrary, ShaderStage,
    },
    ash::vk,
    bytemuck::{Pod, Zeroable},
    log::{info, warn},
    std::{
        ffi::CStr,
        fmt::{Debug, Formatter},
        mem::size_of,
        ops::Deref,
        slice::from_ref,
        sync::Arc,
        thread::panicking,
    },
};

/// Every entry point of the ray tracing source, in shader stage order.
pub const ENTRY_POINTS: [EntryPoint; 4] = [
    EntryPoint::new("rayGen", ShaderStage::RayGen),
    EntryPoint::new("miss", ShaderStage::Miss),
    EntryPoint::new("closestHit_mirror", ShaderStage::ClosestHit),
    EntryPoint::new("closestHit_edges", ShaderStage::ClosestHit),
];

/// The shader groups of the pipeline; the discriminant is the group index.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum ShaderGroup {
    RayGen = 0,
    Miss = 1,
    MirrorHit = 2,
    EdgeHit = 3,
}

impl ShaderGroup {
    pub const ALL: [Self; 4] = [Self::RayGen, Self::Miss, Self::MirrorHit, Self::EdgeHit];

    pub fn name(self) -> &'static str {
        match self {
            Self::RayGen => "rayGen",
            Self::Miss => "miss",
            Self::MirrorHit => "HitGroup_Mirror",
            Self::EdgeHit => "HitGroup_edges",
        }
    }

    /// Index of the stage within [`ENTRY_POINTS`] used by this group.
    fn stage_index(self) -> u32 {
        self as u32
    }

    fn create_info(self) -> vk::RayTracingShaderGroupCreateInfoKHR {
        let builder = vk::RayTracingShaderGroupCreateInfoKHR::builder()
            .general_shader(vk::SHADER_UNUSED_KHR)
            .closest_hit_shader(vk::SHADER_UNUSED_KHR)
            .any_hit_shader(vk::SHADER_UNUSED_KHR)
            .intersection_shader(vk::SHADER_UNUSED_KHR);

        match self {
            Self::RayGen | Self::Miss => builder
                .ty(vk::RayTracingShaderGroupTypeKHR::GENERAL)
                .general_shader(self.stage_index()),
            Self::MirrorHit | Self::EdgeHit => builder
                .ty(vk::RayTracingShaderGroupTypeKHR::TRIANGLES_HIT_GROUP)
                .closest_hit_shader(self.stage_index()),
        }
        .build()
    }
}

/// Push constants shared by the whole dispatch.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct GlobalConstants {
    pub tint: [f32; 4],
    pub eye: [f32; 4],
    pub max_depth: u32,
    pub frame: u32,
    pub _pad: [u32; 2],
}

impl GlobalConstants {
    pub const STAGES: vk::ShaderStageFlags = vk::ShaderStageFlags::from_raw(
        vk::ShaderStageFlags::RAYGEN_KHR.as_raw()
            | vk::ShaderStageFlags::MISS_KHR.as_raw()
            | vk::ShaderStageFlags::CLOSEST_HIT_KHR.as_raw(),
    );
}

/// Smart pointer handle to a ray tracing pipeline, its layout and its group handles.
pub struct RayTracePipeline {
    descriptor_set_layout: vk::DescriptorSetLayout,
    device: Arc<Device>,
    layout: vk::PipelineLayout,
    pub max_recursion_depth: u32,
    pipeline: vk::Pipeline,
    shader_group_handles: Vec<u8>,
}

impl RayTracePipeline {
    /// Compiles `source` and creates the pipeline (`CompilePipeline`).
    ///
    /// `max_recursion_depth` is clamped to what the device supports.
    #[profiling::function]
    pub fn compile(
        device: &Arc<Device>,
        source: &str,
        source_name: &str,
        max_recursion_depth: u32,
    ) -> Result<Self, DriverError> {
        let compiler = ShaderCompiler::new()?;
        let library = ShaderCompiler::compile(&compiler, source, source_name, &ENTRY_POINTS)?;

        Self::create(device, &library, max_recursion_depth)
    }

    pub fn create(
        device: &Arc<Device>,
        library: &ShaderLibrary,
        max_recursion_depth: u32,
    ) -> Result<Self, DriverError> {
        let device_max_depth = device.physical_device.ray_tracing.max_ray_recursion_depth;
        let max_recursion_depth = if max_recursion_depth > device_max_depth {
            warn!("ray recursion depth {max_recursion_depth} limited to {device_max_depth}");

            device_max_depth
        } else {
            max_recursion_depth
        }
        .max(1);

        let descriptor_set_layout = DescriptorBindings::create_layout(device)?;
        let push_constant_range = vk::PushConstantRange {
            stage_flags: GlobalConstants::STAGES,
            offset: 0,
            size: size_of::<GlobalConstants>() as _,
        };
        let layout = unsafe {
            device.create_pipeline_layout(
                &vk::PipelineLayoutCreateInfo::builder()
                    .set_layouts(from_ref(&descriptor_set_layout))
                    .push_constant_ranges(from_ref(&push_constant_range)),
                None,
            )
        }
        .map_err(|err| {
            warn!("{err}");

            unsafe {
                device.destroy_descriptor_set_layout(descriptor_set_layout, None);
            }

            DriverError::PipelineCompilationFailed
        })?;

        let destroy_layouts = || unsafe {
            device.destroy_pipeline_layout(layout, None);
            device.destroy_descriptor_set_layout(descriptor_set_layout, None);
        };

        let mut shader_modules = Vec::with_capacity(ENTRY_POINTS.len());
        for entry in &ENTRY_POINTS {
            let module = ShaderLibrary::index_of(library, entry.name)
                .map(|idx| &library.shaders[idx])
                .filter(|shader| shader.entry.stage == entry.stage)
                .and_then(|shader| {
                    unsafe {
                        device.create_shader_module(
                            &vk::ShaderModuleCreateInfo::builder().code(&shader.spirv),
                            None,
                        )
                    }
                    .map_err(|err| warn!("{err}"))
                    .ok()
                });

            match module {
                Some(module) => shader_modules.push(module),
                None => {
                    warn!("unable to create {} shader module", entry.name);

                    for module in shader_modules {
                        unsafe {
                            device.destroy_shader_module(module, None);
                        }
                    }

                    destroy_layouts();

                    return Err(DriverError::PipelineCompilationFailed);
                }
            }
        }

        // Each stage's code is compiled with its own defines, so every module uses "main"
        const MAIN: &CStr = unsafe { CStr::from_bytes_with_nul_unchecked(b"main\0") };

        let stages = ENTRY_POINTS
            .iter()
            .zip(shader_modules.iter())
            .map(|(entry, &module)| {
                vk::PipelineShaderStageCreateInfo::builder()
                    .stage(entry.stage.flags())
                    .module(module)
                    .name(MAIN)
                    .build()
            })
            .collect::<Box<_>>();
        let groups = ShaderGroup::ALL
            .iter()
            .map(|group| group.create_info())
            .collect::<Box<_>>();

        let pipeline = unsafe {
            device.ray_tracing_pipeline_ext.create_ray_tracing_pipelines(
                vk::DeferredOperationKHR::null(),
                vk::PipelineCache::null(),
                &[vk::RayTracingPipelineCreateInfoKHR::builder()
                    .stages(&stages)
                    .groups(&groups)
                    .max_pipeline_ray_recursion_depth(max_recursion_depth)
                    .layout(layout)
                    .build()],
                None,
            )
        };

        for module in shader_modules {
            unsafe {
                device.destroy_shader_module(module, None);
            }
        }

        let pipeline = match pipeline.map(|pipelines| pipelines.into_iter().next()) {
            Ok(Some(pipeline)) => pipeline,
            Ok(None) | Err(_) => {
                warn!("unable to create ray tracing pipeline");

                destroy_layouts();

                return Err(DriverError::PipelineCompilationFailed);
            }
        };

        let handle_size = device.physical_device.ray_tracing.shader_group_handle_size as usize;
        let group_count = ShaderGroup::ALL.len();
        let shader_group_handles = unsafe {
            device
                .ray_tracing_pipeline_ext
                .get_ray_tracing_shader_group_handles(
                    pipeline,
                    0,
                    group_count as _,
                    group_count * handle_size,
                )
        }
        .map_err(|err| {
            warn!("{err}");

            unsafe {
                device.destroy_pipeline(pipeline, None);
            }

            destroy_layouts();

            DriverError::PipelineCompilationFailed
        })?;

        for group in ShaderGroup::ALL {
            info!("Shader group {}: {}", group as u32, group.name());
        }

        Ok(Self {
            descriptor_set_layout,
            device: Arc::clone(device),
            layout,
            max_recursion_depth,
            pipeline,
            shader_group_handles,
        })
    }

    pub fn descriptor_set_layout(this: &Self) -> vk::DescriptorSetLayout {
        this.descriptor_set_layout
    }

    /// Returns the identifiers of every group, tightly packed in group order.
    pub fn group_handles(this: &Self) -> &[u8] {
        &this.shader_group_handles
    }

    pub fn layout(this: &Self) -> vk::PipelineLayout {
        this.layout
    }
}

impl Debug for RayTracePipeline {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "RayTracePipeline({:?})", self.pipeline)
    }
}

impl Deref for RayTracePipeline {
    type Target = vk::Pipeline;

    fn deref(&self) -> &Self::Target {
        &self.pipeline
    }
}

impl Drop for RayTracePipeline {
    #[profiling::function]
    fn drop(&mut self) {
        if panicking() {
            return;
        }

        unsafe {
            self.device.destroy_pipeline(self.pipeline, None);
            self.device.destroy_pipeline_layout(self.layout, None);
            self.device
                .destroy_descriptor_set_layout(self.descriptor_set_layout, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    pub fn groups_pair_with_entry_points() {
        for group in ShaderGroup::ALL {
            let entry = ENTRY_POINTS[group.stage_index() as usize];
            let info = group.create_info();

            match group {
                ShaderGroup::RayGen | ShaderGroup::Miss => {
                    assert_eq!(info.ty, vk::RayTracingShaderGroupTypeKHR::GENERAL);
                    assert_eq!(info.general_shader, group.stage_index());
                    assert_eq!(info.closest_hit_shader, vk::SHADER_UNUSED_KHR);
                    assert_ne!(entry.stage, ShaderStage::ClosestHit);
                }
                ShaderGroup::MirrorHit | ShaderGroup::EdgeHit => {
                    assert_eq!(
                        info.ty,
                        vk::RayTracingShaderGroupTypeKHR::TRIANGLES_HIT_GROUP
                    );
                    assert_eq!(info.general_shader, vk::SHADER_UNUSED_KHR);
                    assert_eq!(info.closest_hit_shader, group.stage_index());
                    assert_eq!(entry.stage, ShaderStage::ClosestHit);
                }
            }
        }
    }

    #[test]
    pub fn hit_group_names() {
        assert_eq!(ShaderGroup::MirrorHit.name(), "HitGroup_Mirror");
        assert_eq!(ShaderGroup::EdgeHit.name(), "HitGroup_edges");
        assert_eq!(ENTRY_POINTS[2].name, "closestHit_mirror");
        assert_eq!(ENTRY_POINTS[3].name, "closestHit_edges");
    }

    #[test]
    pub fn global_constants_layout() {
        assert_eq!(size_of::<GlobalConstants>(), 48);
        assert_eq!(size_of::<GlobalConstants>() % 16, 0);
    }
}
