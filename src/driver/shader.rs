use {
    super::DriverError,
    ash::vk,
    log::{error, info, trace},
    shaderc::{CompileOptions, Compiler, EnvVersion, ShaderKind, SpirvVersion, TargetEnv},
    std::fmt::{Debug, Formatter},
};

/// The ray tracing stage a shader entry point runs on.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum ShaderStage {
    RayGen,
    Miss,
    ClosestHit,
}

impl ShaderStage {
    fn kind(self) -> ShaderKind {
        match self {
            Self::RayGen => ShaderKind::RayGeneration,
            Self::Miss => ShaderKind::Miss,
            Self::ClosestHit => ShaderKind::ClosestHit,
        }
    }

    pub fn flags(self) -> vk::ShaderStageFlags {
        match self {
            Self::RayGen => vk::ShaderStageFlags::RAYGEN_KHR,
            Self::Miss => vk::ShaderStageFlags::MISS_KHR,
            Self::ClosestHit => vk::ShaderStageFlags::CLOSEST_HIT_KHR,
        }
    }
}

/// A named entry point within a shader source file.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct EntryPoint {
    pub name: &'static str,
    pub stage: ShaderStage,
}

impl EntryPoint {
    pub const fn new(name: &'static str, stage: ShaderStage) -> Self {
        Self { name, stage }
    }

    /// The preprocessor define which selects this entry point's code in the shared source.
    pub fn define(&self) -> String {
        format!("ENTRY_{}", self.name)
    }
}

/// SPIR-V produced for one entry point.
#[derive(Clone)]
pub struct CompiledShader {
    pub entry: EntryPoint,
    pub spirv: Vec<u32>,
}

impl Debug for CompiledShader {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} ({:?}, {} words)",
            self.entry.name,
            self.entry.stage,
            self.spirv.len()
        )
    }
}

/// All entry points compiled from one source, in the order they were requested.
#[derive(Clone, Debug, Default)]
pub struct ShaderLibrary {
    pub shaders: Vec<CompiledShader>,
}

impl ShaderLibrary {
    /// Returns the position of `name` within the library.
    pub fn index_of(this: &Self, name: &str) -> Option<usize> {
        this.shaders
            .iter()
            .position(|shader| shader.entry.name == name)
    }
}

/// Turns GLSL source text plus entry points into a [`ShaderLibrary`].
pub struct ShaderCompiler {
    compiler: Compiler,
}

impl ShaderCompiler {
    pub fn new() -> Result<Self, DriverError> {
        let compiler = Compiler::new().ok_or_else(|| {
            error!("unable to initialize shaderc");

            DriverError::PipelineCompilationFailed
        })?;

        Ok(Self { compiler })
    }

    /// Compiles every entry in `entries` out of `source`.
    ///
    /// Each entry is built separately with its `ENTRY_<name>` define set and `main` as the
    /// SPIR-V entry point.
    #[profiling::function]
    pub fn compile(
        this: &Self,
        source: &str,
        source_name: &str,
        entries: &[EntryPoint],
    ) -> Result<ShaderLibrary, DriverError> {
        let mut shaders = Vec::with_capacity(entries.len());

        for &entry in entries {
            let mut options = CompileOptions::new().ok_or_else(|| {
                error!("unable to create shaderc options");

                DriverError::PipelineCompilationFailed
            })?;
            options.set_target_env(TargetEnv::Vulkan, EnvVersion::Vulkan1_2 as u32);
            options.set_target_spirv(SpirvVersion::V1_4);
            options.add_macro_definition(&entry.define(), None);

            trace!("compiling {}", entry.name);

            let artifact = this
                .compiler
                .compile_into_spirv(source, entry.stage.kind(), source_name, "main", Some(&options))
                .map_err(|err| {
                    error!("unable to compile {} from {source_name}: {err}", entry.name);

                    DriverError::PipelineCompilationFailed
                })?;

            if artifact.get_num_warnings() > 0 {
                info!("{}: {}", entry.name, artifact.get_warning_messages());
            }

            shaders.push(CompiledShader {
                entry,
                spirv: artifact.as_binary().to_vec(),
            });
        }

        Ok(ShaderLibrary { shaders })
    }
}

impl Debug for ShaderCompiler {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str("ShaderCompiler")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    pub fn entry_point_define() {
        let entry = EntryPoint::new("closestHit_mirror", ShaderStage::ClosestHit);

        assert_eq!(entry.define(), "ENTRY_closestHit_mirror");
        assert_eq!(
            entry.stage.flags(),
            vk::ShaderStageFlags::CLOSEST_HIT_KHR
        );
    }

    #[test]
    pub fn library_lookup() {
        let library = ShaderLibrary {
            shaders: vec![
                CompiledShader {
                    entry: EntryPoint::new("rayGen", ShaderStage::RayGen),
                    spirv: vec![0x0723_0203],
                },
                CompiledShader {
                    entry: EntryPoint::new("miss", ShaderStage::Miss),
                    spirv: vec![0x0723_0203],
                },
            ],
        };

        assert_eq!(ShaderLibrary::index_of(&library, "miss"), Some(1));
        assert_eq!(ShaderLibrary::index_of(&library, "closestHit_edges"), None);
    }
}
