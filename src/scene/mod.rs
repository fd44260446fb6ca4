//! Scene content: mesh parts, their materials, and the per-frame instance animation.

mod mesh;
mod transform;

pub use self::{
    mesh::{load_mesh, MeshPart, Vertex},
    transform::{AngleUnit, Mode, Orientation, Transform},
};

use {
    crate::driver::DriverError,
    glam::{vec3, Vec3},
    log::warn,
    serde::Deserialize,
    std::f32::consts::TAU,
};

/// How rays hitting a mesh part are shaded.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Material {
    /// Reflects rays about the surface until the recursion depth runs out.
    Mirror,

    /// Returns a constant color.
    Edge { color: [f32; 4] },
}

/// A rotation angle which advances once per frame and wraps at a full turn.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Animation {
    pub angle: f32,
    pub step: f32,
}

impl Animation {
    pub fn new(step: f32) -> Self {
        Self { angle: 0.0, step }
    }

    /// Moves to the next frame and returns its angle, in `[0, TAU)`.
    pub fn advance(&mut self) -> f32 {
        self.angle = (self.angle + self.step).rem_euclid(TAU);
        self.angle
    }
}

/// Placement of one mesh part: a base transform plus a spin rate around each axis.
///
/// Spin rates are whole turns per turn of the animation angle, so the wrap at `TAU` is seamless.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SceneInstance {
    pub base: Transform,
    pub spin: Vec3,
}

impl SceneInstance {
    /// Returns the transform of this instance when the animation is at `angle` radians.
    pub fn transform_at(&self, angle: f32) -> Transform {
        let mut transform = self.base;
        transform.rotate(
            self.spin * angle,
            AngleUnit::Radians,
            Orientation::Local,
            Mode::Append,
        );

        transform
    }
}

/// Mesh parts with one material and one instance each, in instance order.
#[derive(Clone, Debug)]
pub struct Scene {
    pub eye: Vec3,
    pub instances: Vec<SceneInstance>,
    pub materials: Vec<Material>,
    pub parts: Vec<MeshPart>,
}

impl Scene {
    /// Camera position inside the mirror box, looking at the origin.
    pub const EYE: Vec3 = vec3(0.3, 0.2, 0.8);

    const EDGE_SPIN: Vec3 = vec3(1.0, 2.0, 0.0);

    /// Pairs `parts` with `materials`; both must have `part_count` entries.
    ///
    /// Edge parts spin around the origin, mirror parts stay in place.
    pub fn new(
        parts: Vec<MeshPart>,
        materials: Vec<Material>,
        part_count: usize,
    ) -> Result<Self, DriverError> {
        if parts.len() != part_count {
            warn!("expected {part_count} mesh parts, found {}", parts.len());

            return Err(DriverError::AssetLoadFailed);
        }

        if materials.len() != part_count {
            warn!(
                "expected {part_count} materials, found {}",
                materials.len()
            );

            return Err(DriverError::AssetLoadFailed);
        }

        let instances = materials
            .iter()
            .map(|material| SceneInstance {
                base: Transform::IDENTITY,
                spin: match material {
                    Material::Mirror => Vec3::ZERO,
                    Material::Edge { .. } => Self::EDGE_SPIN,
                },
            })
            .collect();

        Ok(Self {
            eye: Self::EYE,
            instances,
            materials,
            parts,
        })
    }

    /// Two facing mirror panels at `z = ±1` and a small cube between them.
    pub fn mirror_box() -> Vec<MeshPart> {
        let mut panel_vertices = vec![];
        let mut panel_indices = vec![];

        for z in [-1.0f32, 1.0] {
            let base = panel_vertices.len() as u32;
            let normal = [0.0, 0.0, -z];

            for (x, y) in [(-1.0, -1.0), (1.0, -1.0), (1.0, 1.0), (-1.0, 1.0)] {
                panel_vertices.push(Vertex::new(
                    [x, y, z],
                    normal,
                    [(x + 1.0) * 0.5, (y + 1.0) * 0.5],
                ));
            }

            panel_indices.extend([0, 1, 2, 0, 2, 3].map(|idx| base + idx));
        }

        const HALF: f32 = 0.2;

        let cube_vertices = (0..8)
            .map(|corner| {
                let position = vec3(
                    if corner & 1 == 0 { -HALF } else { HALF },
                    if corner & 2 == 0 { -HALF } else { HALF },
                    if corner & 4 == 0 { -HALF } else { HALF },
                );

                Vertex::new(
                    position.to_array(),
                    position.normalize().to_array(),
                    [0.0, 0.0],
                )
            })
            .collect();
        let cube_indices = vec![
            0, 2, 1, 1, 2, 3, // -z
            4, 5, 6, 5, 7, 6, // +z
            0, 1, 4, 1, 5, 4, // -y
            2, 6, 3, 3, 6, 7, // +y
            0, 4, 2, 2, 4, 6, // -x
            1, 3, 5, 3, 7, 5, // +x
        ];

        vec![
            MeshPart {
                vertices: panel_vertices,
                indices: panel_indices,
            },
            MeshPart {
                vertices: cube_vertices,
                indices: cube_indices,
            },
        ]
    }

    /// Returns the row-major instance matrices of every part at `angle`.
    pub fn instance_matrices(&self, angle: f32) -> Vec<[f32; 12]> {
        self.instances
            .iter()
            .map(|instance| instance.transform_at(angle).to_instance_matrix())
            .collect()
    }
}
