use {
    crate::driver::DriverError,
    bytemuck::{Pod, Zeroable},
    gltf::{import, mesh::Mode},
    log::{info, warn},
    std::path::Path,
};

/// Vertex layout shared by the acceleration structure builds and the closest hit shaders.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct Vertex {
    pub position: [f32; 3],
    pub normal: [f32; 3],
    pub uv: [f32; 2],
}

impl Vertex {
    pub const fn new(position: [f32; 3], normal: [f32; 3], uv: [f32; 2]) -> Self {
        Self {
            position,
            normal,
            uv,
        }
    }
}

/// Indexed triangle list geometry of one mesh part.
#[derive(Clone, Debug, PartialEq)]
pub struct MeshPart {
    pub vertices: Vec<Vertex>,
    pub indices: Vec<u32>,
}

impl MeshPart {
    /// Checks that the geometry is a non-empty triangle list whose indices are all in range.
    pub fn new(vertices: Vec<Vertex>, indices: Vec<u32>) -> Result<Self, DriverError> {
        if vertices.is_empty() || indices.is_empty() {
            warn!("empty mesh part");

            return Err(DriverError::AssetLoadFailed);
        }

        if indices.len() % 3 != 0 {
            warn!("index count {} is not a triangle list", indices.len());

            return Err(DriverError::AssetLoadFailed);
        }

        if let Some(idx) = indices.iter().find(|&&idx| idx as usize >= vertices.len()) {
            warn!("index {idx} out of range ({} vertices)", vertices.len());

            return Err(DriverError::AssetLoadFailed);
        }

        Ok(Self { vertices, indices })
    }

    pub fn primitive_count(&self) -> u32 {
        (self.indices.len() / 3) as _
    }

    /// The highest vertex index addressed by the part.
    pub fn max_vertex(&self) -> u32 {
        self.indices.iter().copied().max().unwrap_or_default()
    }
}

/// Imports a `.gltf` or `.glb` file; each mesh primitive becomes one part, in document order.
#[profiling::function]
pub fn load_mesh(path: impl AsRef<Path>) -> Result<Vec<MeshPart>, DriverError> {
    let path = path.as_ref();

    info!("Loading mesh: {}", path.display());

    let (doc, bufs, _) = import(path).map_err(|err| {
        warn!("failed importing {}: {err}", path.display());

        DriverError::AssetLoadFailed
    })?;

    let mut parts = vec![];

    for (mesh_idx, mesh) in doc.meshes().enumerate() {
        for primitive in mesh.primitives() {
            if primitive.mode() != Mode::Triangles {
                warn!(
                    "failed parsing mesh {mesh_idx} of {}: unsupported primitive mode {:?}",
                    path.display(),
                    primitive.mode()
                );

                return Err(DriverError::AssetLoadFailed);
            }

            let data = primitive.reader(|buf| bufs.get(buf.index()).map(|data| &*data.0));
            let (Some(positions), Some(indices)) = (data.read_positions(), data.read_indices())
            else {
                warn!(
                    "failed parsing mesh {mesh_idx} of {}: missing positions or indices",
                    path.display()
                );

                return Err(DriverError::AssetLoadFailed);
            };

            if data.read_tex_coords(1).is_some() {
                warn!(
                    "parsing mesh {mesh_idx} of {}: unutilized UV channels",
                    path.display()
                );
            }

            let positions = positions.collect::<Vec<_>>();
            let mut normals = data
                .read_normals()
                .map(|normals| normals.collect::<Vec<_>>())
                .unwrap_or_default();
            normals.resize(positions.len(), [0.0; 3]);
            let mut uvs = data
                .read_tex_coords(0)
                .map(|uvs| uvs.into_f32().collect::<Vec<_>>())
                .unwrap_or_default();
            uvs.resize(positions.len(), [0.0; 2]);

            let vertices = positions
                .into_iter()
                .zip(normals)
                .zip(uvs)
                .map(|((position, normal), uv)| Vertex::new(position, normal, uv))
                .collect();
            let indices = indices.into_u32().collect();

            parts.push(MeshPart::new(vertices, indices).map_err(|err| {
                warn!("failed parsing mesh {mesh_idx} of {}", path.display());

                err
            })?);
        }
    }

    if parts.is_empty() {
        warn!("{} contains no meshes", path.display());

        return Err(DriverError::AssetLoadFailed);
    }

    info!("Loaded {} mesh parts", parts.len());

    Ok(parts)
}

#[cfg(test)]
mod tests {
    use {super::*, std::mem::size_of};

    fn triangle() -> Vec<Vertex> {
        vec![
            Vertex::new([0.0, 0.0, 0.0], [0.0, 0.0, 1.0], [0.0, 0.0]),
            Vertex::new([1.0, 0.0, 0.0], [0.0, 0.0, 1.0], [1.0, 0.0]),
            Vertex::new([0.0, 1.0, 0.0], [0.0, 0.0, 1.0], [0.0, 1.0]),
        ]
    }

    #[test]
    pub fn vertex_is_32_bytes() {
        assert_eq!(size_of::<Vertex>(), 32);
    }

    #[test]
    pub fn single_triangle_part() {
        let part = MeshPart::new(triangle(), vec![0, 1, 2]).unwrap();

        assert_eq!(part.primitive_count(), 1);
        assert_eq!(part.max_vertex(), 2);
    }

    #[test]
    pub fn rejects_empty_parts() {
        assert_eq!(
            MeshPart::new(vec![], vec![]),
            Err(DriverError::AssetLoadFailed)
        );
        assert_eq!(
            MeshPart::new(triangle(), vec![]),
            Err(DriverError::AssetLoadFailed)
        );
    }

    #[test]
    pub fn rejects_partial_triangles() {
        assert_eq!(
            MeshPart::new(triangle(), vec![0, 1]),
            Err(DriverError::AssetLoadFailed)
        );
    }

    #[test]
    pub fn rejects_out_of_range_indices() {
        assert_eq!(
            MeshPart::new(triangle(), vec![0, 1, 3]),
            Err(DriverError::AssetLoadFailed)
        );
    }

    #[test]
    pub fn missing_file_fails_to_load() {
        assert_eq!(
            load_mesh("does/not/exist.gltf"),
            Err(DriverError::AssetLoadFailed)
        );
    }
}
