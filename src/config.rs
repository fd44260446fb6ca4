use {
    crate::scene::Material,
    derive_builder::Builder,
    log::{info, warn},
    serde::Deserialize,
    std::{
        fs::read_to_string,
        io::ErrorKind,
        path::{Path, PathBuf},
        time::Duration,
    },
};

/// The name of the optional config file while in debug mode
#[cfg(debug_assertions)]
pub const CONFIG_FILENAME: &str = "infinity-mirror-debug.toml";

/// The name of the optional config file while in release mode
#[cfg(not(debug_assertions))]
pub const CONFIG_FILENAME: &str = "infinity-mirror.toml";

/// Everything the renderer needs to know before setup begins.
#[derive(Builder, Clone, Debug, PartialEq)]
#[builder(
    build_fn(private, name = "fallible_build"),
    derive(Debug),
    pattern = "owned"
)]
pub struct MirrorConfig {
    /// Radians the edge instances spin per dispatched frame.
    #[builder(default = "0.01")]
    pub animation_step: f32,

    /// Enables the validation layer and forwards its messages to the log.
    #[builder(default = "cfg!(debug_assertions)")]
    pub debug: bool,

    /// How long a frame loop blocks on a fence before re-checking for shutdown.
    #[builder(default = "Duration::from_millis(1000)")]
    pub fence_timeout: Duration,

    #[builder(default = "1080")]
    pub height: u32,

    /// One material per mesh part, in part order.
    #[builder(default = "MirrorConfig::default_materials()")]
    pub materials: Vec<Material>,

    /// Clamped to the device limit during setup.
    #[builder(default = "31")]
    pub max_ray_recursion_depth: u32,

    /// Number of mesh parts, and so instances and hit records, the model must contain.
    #[builder(default = "2")]
    pub mesh_parts: usize,

    /// A glTF model; when unset the built-in mirror box is used.
    #[builder(default, setter(strip_option))]
    pub model_path: Option<PathBuf>,

    #[builder(default = "PathBuf::from(\"shaders/infinity_mirror.glsl\")")]
    pub shader_path: PathBuf,

    #[builder(default = "2")]
    pub swapchain_image_count: u32,

    /// Wait for vertical blank when presenting.
    #[builder(default = "true")]
    pub sync_display: bool,

    /// Multiplies the colour of each mirror bounce.
    #[builder(default = "[0.9, 0.9, 0.95, 1.0]")]
    pub tint: [f32; 4],

    #[builder(default = "String::from(\"Infinimirror\")")]
    pub title: String,

    #[builder(default = "1920")]
    pub width: u32,
}

impl MirrorConfig {
    #[allow(clippy::new_ret_no_self)]
    pub fn new() -> MirrorConfigBuilder {
        MirrorConfigBuilder::default()
    }

    fn default_materials() -> Vec<Material> {
        vec![
            Material::Mirror,
            Material::Edge {
                color: [0.1, 0.8, 1.0, 1.0],
            },
        ]
    }

    /// Reads `path`, falling back to defaults for anything missing.
    ///
    /// A missing file is not an error. An unreadable or malformed file is logged and ignored.
    pub fn read(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        let data = match read_to_string(path) {
            Ok(toml) => toml::from_str(&toml).unwrap_or_else(|err| {
                warn!("ignoring malformed config file {}: {err}", path.display());

                Data::default()
            }),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                info!("Config file {} not found, using defaults", path.display());

                Data::default()
            }
            Err(err) => {
                warn!("unable to read config file {}: {err}", path.display());

                Data::default()
            }
        };

        data.into_config()
    }

    /// Parses TOML config text; unset keys keep their defaults.
    pub fn from_toml(toml: &str) -> Result<Self, toml::de::Error> {
        toml::from_str::<Data>(toml).map(Data::into_config)
    }
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self::new().build()
    }
}

// HACK: https://github.com/colin-kiegel/rust-derive-builder/issues/56
impl MirrorConfigBuilder {
    pub fn build(self) -> MirrorConfig {
        self.fallible_build()
            .expect("All required fields set at initialization")
    }
}

impl From<MirrorConfigBuilder> for MirrorConfig {
    fn from(config: MirrorConfigBuilder) -> Self {
        config.build()
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct Data {
    animation_step: Option<f32>,
    debug: Option<bool>,
    fence_timeout_ms: Option<u64>,
    materials: Option<Vec<Material>>,
    max_ray_recursion_depth: Option<u32>,
    mesh_parts: Option<usize>,
    model_path: Option<PathBuf>,
    shader_path: Option<PathBuf>,
    swapchain_image_count: Option<u32>,
    sync_display: Option<bool>,
    tint: Option<[f32; 4]>,
    title: Option<String>,
    window_dimensions: Option<(u32, u32)>,
}

impl Data {
    fn into_config(self) -> MirrorConfig {
        let mut config = MirrorConfig::new();

        if let Some(animation_step) = self.animation_step {
            config = config.animation_step(animation_step);
        }

        if let Some(debug) = self.debug {
            config = config.debug(debug);
        }

        if let Some(fence_timeout_ms) = self.fence_timeout_ms {
            config = config.fence_timeout(Duration::from_millis(fence_timeout_ms.max(1)));
        }

        if let Some(materials) = self.materials {
            config = config.materials(materials);
        }

        if let Some(max_ray_recursion_depth) = self.max_ray_recursion_depth {
            config = config.max_ray_recursion_depth(max_ray_recursion_depth.max(1));
        }

        if let Some(mesh_parts) = self.mesh_parts {
            config = config.mesh_parts(mesh_parts);
        }

        if let Some(model_path) = self.model_path {
            config = config.model_path(model_path);
        }

        if let Some(shader_path) = self.shader_path {
            config = config.shader_path(shader_path);
        }

        if let Some(swapchain_image_count) = self.swapchain_image_count {
            config = config.swapchain_image_count(swapchain_image_count.clamp(2, 3));
        }

        if let Some(sync_display) = self.sync_display {
            config = config.sync_display(sync_display);
        }

        if let Some(tint) = self.tint {
            config = config.tint(tint);
        }

        if let Some(title) = self.title {
            config = config.title(title);
        }

        if let Some((width, height)) = self.window_dimensions {
            config = config.width(width.max(1)).height(height.max(1));
        }

        config.build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    pub fn defaults() {
        let config = MirrorConfig::default();

        assert_eq!(config.title, "Infinimirror");
        assert_eq!((config.width, config.height), (1920, 1080));
        assert_eq!(config.swapchain_image_count, 2);
        assert_eq!(config.max_ray_recursion_depth, 31);
        assert_eq!(config.fence_timeout, Duration::from_millis(1000));
        assert_eq!(config.mesh_parts, 2);
        assert_eq!(config.materials.len(), config.mesh_parts);
        assert_eq!(config.model_path, None);
        assert!(config.sync_display);
    }

    #[test]
    pub fn empty_toml_is_default() {
        assert_eq!(MirrorConfig::from_toml("").unwrap(), MirrorConfig::default());
    }

    #[test]
    pub fn toml_overrides() {
        let config = MirrorConfig::from_toml(
            r#"
            fence_timeout_ms = 250
            max_ray_recursion_depth = 8
            model_path = "assets/mirror.glb"
            window_dimensions = [1280, 720]
            materials = [{ type = "mirror" }, { type = "mirror" }, { type = "edge", color = [1.0, 0.0, 0.0, 1.0] }]
            mesh_parts = 3
            "#,
        )
        .unwrap();

        assert_eq!(config.fence_timeout, Duration::from_millis(250));
        assert_eq!(config.max_ray_recursion_depth, 8);
        assert_eq!(config.model_path, Some(PathBuf::from("assets/mirror.glb")));
        assert_eq!((config.width, config.height), (1280, 720));
        assert_eq!(config.mesh_parts, 3);
        assert_eq!(config.materials.len(), 3);
        assert_eq!(config.title, "Infinimirror");
    }

    #[test]
    pub fn toml_values_are_clamped() {
        let config = MirrorConfig::from_toml(
            r#"
            fence_timeout_ms = 0
            max_ray_recursion_depth = 0
            swapchain_image_count = 8
            "#,
        )
        .unwrap();

        assert_eq!(config.fence_timeout, Duration::from_millis(1));
        assert_eq!(config.max_ray_recursion_depth, 1);
        assert_eq!(config.swapchain_image_count, 3);
    }

    #[test]
    pub fn unknown_keys_are_rejected() {
        assert!(MirrorConfig::from_toml("fullscreen = true").is_err());
    }

    #[test]
    pub fn missing_file_is_default() {
        assert_eq!(
            MirrorConfig::read("does/not/exist.toml"),
            MirrorConfig::default()
        );
    }
}
