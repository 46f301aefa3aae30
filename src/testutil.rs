//! Synthetic in-memory models for tests.

use std::path::PathBuf;

use gltf_json as json;
use json::validation::{Checked, USize64};
use serde_json::Map;
use sha2::{Digest, Sha256};

use crate::loader::LoadedModel;
use crate::EXT_MESH_GPU_INSTANCING;

pub const CUBE_POSITIONS: [[f32; 3]; 8] = [
    [-0.5, -0.5, -0.5],
    [0.5, -0.5, -0.5],
    [0.5, 0.5, -0.5],
    [-0.5, 0.5, -0.5],
    [-0.5, -0.5, 0.5],
    [0.5, -0.5, 0.5],
    [0.5, 0.5, 0.5],
    [-0.5, 0.5, 0.5],
];

pub const CUBE_INDICES: [u16; 36] = [
    0, 1, 2, 0, 2, 3, //
    4, 6, 5, 4, 7, 6, //
    0, 3, 7, 0, 7, 4, //
    1, 5, 6, 1, 6, 2, //
    0, 4, 5, 0, 5, 1, //
    3, 2, 6, 3, 6, 7,
];

const INV_SQRT3: f32 = 0.577_350_3;

fn cube_normals() -> [[f32; 3]; 8] {
    CUBE_POSITIONS.map(|p| p.map(|c| c.signum() * INV_SQRT3))
}

fn cube_uvs() -> [[f32; 2]; 8] {
    [
        [0.0, 0.0],
        [1.0, 0.0],
        [1.0, 1.0],
        [0.0, 1.0],
        [0.0, 0.0],
        [1.0, 0.0],
        [1.0, 1.0],
        [0.0, 1.0],
    ]
}

/// Variations applied to the synthetic cube, all deterministic.
#[derive(Debug, Clone, Copy, Default)]
pub struct CubeSpec {
    pub position_jitter: f32,
    pub normal_jitter: f32,
    pub uv_jitter: f32,
    /// Uniform scale on the positions; zero means 1.0.
    pub scale: f32,
    pub second_material: bool,
    pub drop_last_vertex: bool,
    pub omit_position_min_max: bool,
}

pub struct ModelBuilder {
    pub root: json::Root,
    pub bin: Vec<u8>,
}

impl Default for ModelBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ModelBuilder {
    pub fn new() -> Self {
        let mut root = json::Root::default();
        root.asset = json::Asset {
            version: "2.0".to_string(),
            generator: Some("glbinstance-tests".to_string()),
            ..Default::default()
        };
        root.push(json::Buffer {
            byte_length: USize64(0),
            uri: None,
            name: None,
            extensions: Default::default(),
            extras: Default::default(),
        });
        Self {
            root,
            bin: Vec::new(),
        }
    }

    pub fn push_view(
        &mut self,
        bytes: &[u8],
        byte_stride: Option<usize>,
        target: Option<json::buffer::Target>,
    ) -> json::Index<json::buffer::View> {
        while self.bin.len() % 4 != 0 {
            self.bin.push(0);
        }
        let byte_offset = self.bin.len();
        self.bin.extend_from_slice(bytes);
        self.root.push(json::buffer::View {
            buffer: json::Index::new(0),
            byte_length: USize64::from(bytes.len()),
            byte_offset: Some(USize64::from(byte_offset)),
            byte_stride: byte_stride.map(json::buffer::Stride),
            target: target.map(Checked::Valid),
            name: None,
            extensions: Default::default(),
            extras: Default::default(),
        })
    }

    #[allow(clippy::too_many_arguments)]
    pub fn push_accessor(
        &mut self,
        view: Option<json::Index<json::buffer::View>>,
        byte_offset: usize,
        count: usize,
        component_type: json::accessor::ComponentType,
        type_: json::accessor::Type,
        min: Option<serde_json::Value>,
        max: Option<serde_json::Value>,
    ) -> json::Index<json::Accessor> {
        self.root.push(json::Accessor {
            buffer_view: view,
            byte_offset: Some(USize64::from(byte_offset)),
            count: USize64::from(count),
            component_type: Checked::Valid(json::accessor::GenericComponentType(component_type)),
            type_: Checked::Valid(type_),
            min,
            max,
            name: None,
            normalized: false,
            sparse: None,
            extensions: Default::default(),
            extras: Default::default(),
        })
    }

    pub fn push_f32_accessor(
        &mut self,
        values: &[f32],
        type_: json::accessor::Type,
        target: Option<json::buffer::Target>,
        min_max: Option<(serde_json::Value, serde_json::Value)>,
    ) -> json::Index<json::Accessor> {
        let count = values.len() / type_.multiplicity();
        let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        let view = self.push_view(&bytes, None, target);
        let (min, max) = match min_max {
            Some((min, max)) => (Some(min), Some(max)),
            None => (None, None),
        };
        self.push_accessor(
            Some(view),
            0,
            count,
            json::accessor::ComponentType::F32,
            type_,
            min,
            max,
        )
    }

    pub fn add_material(&mut self, name: &str) -> json::Index<json::Material> {
        self.root.push(json::Material {
            name: Some(name.to_string()),
            ..Default::default()
        })
    }

    pub fn add_mesh(
        &mut self,
        name: Option<&str>,
        primitives: Vec<json::mesh::Primitive>,
    ) -> json::Index<json::Mesh> {
        self.root.push(json::Mesh {
            name: name.map(str::to_string),
            primitives,
            weights: None,
            extensions: Default::default(),
            extras: Default::default(),
        })
    }

    pub fn add_node(
        &mut self,
        mesh: Option<json::Index<json::Mesh>>,
        translation: Option<[f32; 3]>,
    ) -> json::Index<json::Node> {
        self.root.push(json::Node {
            mesh,
            translation,
            ..Default::default()
        })
    }

    pub fn add_parent_node(
        &mut self,
        children: Vec<json::Index<json::Node>>,
        translation: Option<[f32; 3]>,
    ) -> json::Index<json::Node> {
        self.root.push(json::Node {
            children: Some(children),
            translation,
            ..Default::default()
        })
    }

    /// A node carrying `EXT_mesh_gpu_instancing` with the given per-instance
    /// streams. Rotations are `[x, y, z, w]`.
    pub fn add_instanced_node(
        &mut self,
        mesh: json::Index<json::Mesh>,
        translations: &[[f32; 3]],
        rotations: Option<&[[f32; 4]]>,
        scales: Option<&[[f32; 3]]>,
    ) -> json::Index<json::Node> {
        let mut attributes = Map::new();
        let flat: Vec<f32> = translations.iter().flatten().copied().collect();
        let translation =
            self.push_f32_accessor(&flat, json::accessor::Type::Vec3, None, None);
        attributes.insert(
            "TRANSLATION".to_string(),
            serde_json::json!(translation.value()),
        );
        if let Some(rotations) = rotations {
            let flat: Vec<f32> = rotations.iter().flatten().copied().collect();
            let rotation = self.push_f32_accessor(&flat, json::accessor::Type::Vec4, None, None);
            attributes.insert("ROTATION".to_string(), serde_json::json!(rotation.value()));
        }
        if let Some(scales) = scales {
            let flat: Vec<f32> = scales.iter().flatten().copied().collect();
            let scale = self.push_f32_accessor(&flat, json::accessor::Type::Vec3, None, None);
            attributes.insert("SCALE".to_string(), serde_json::json!(scale.value()));
        }

        let mut others = Map::new();
        others.insert(
            EXT_MESH_GPU_INSTANCING.to_string(),
            serde_json::json!({ "attributes": attributes }),
        );
        self.root.extensions_used.push(EXT_MESH_GPU_INSTANCING.to_string());

        self.root.push(json::Node {
            mesh: Some(mesh),
            extensions: Some(json::extensions::scene::Node { others }),
            ..Default::default()
        })
    }

    pub fn set_scene(&mut self, nodes: Vec<json::Index<json::Node>>) {
        let scene = self.root.push(json::Scene {
            nodes,
            name: None,
            extensions: Default::default(),
            extras: Default::default(),
        });
        self.root.scene = Some(scene);
    }

    /// A cube mesh with POSITION/NORMAL/TEXCOORD_0 in separate packed views.
    pub fn add_cube_mesh(&mut self, spec: CubeSpec) -> json::Index<json::Mesh> {
        let scale = if spec.scale == 0.0 { 1.0 } else { spec.scale };
        let mut positions: Vec<f32> = CUBE_POSITIONS
            .iter()
            .flatten()
            .map(|c| c * scale + spec.position_jitter)
            .collect();
        if spec.drop_last_vertex {
            positions.truncate(positions.len() - 3);
        }
        let vertex_count = positions.len() / 3;
        let normals: Vec<f32> = cube_normals()
            .iter()
            .flatten()
            .take(vertex_count * 3)
            .map(|c| c + spec.normal_jitter)
            .collect();
        let uvs: Vec<f32> = cube_uvs()
            .iter()
            .flatten()
            .take(vertex_count * 2)
            .map(|c| c + spec.uv_jitter)
            .collect();

        let half = 0.5 * scale;
        let min_max = (!spec.omit_position_min_max).then(|| {
            (
                serde_json::json!([
                    -half + spec.position_jitter,
                    -half + spec.position_jitter,
                    -half + spec.position_jitter
                ]),
                serde_json::json!([
                    half + spec.position_jitter,
                    half + spec.position_jitter,
                    half + spec.position_jitter
                ]),
            )
        });

        let position = self.push_f32_accessor(
            &positions,
            json::accessor::Type::Vec3,
            Some(json::buffer::Target::ArrayBuffer),
            min_max,
        );
        let normal = self.push_f32_accessor(
            &normals,
            json::accessor::Type::Vec3,
            Some(json::buffer::Target::ArrayBuffer),
            None,
        );
        let uv = self.push_f32_accessor(
            &uvs,
            json::accessor::Type::Vec2,
            Some(json::buffer::Target::ArrayBuffer),
            None,
        );

        let index_bytes: Vec<u8> = CUBE_INDICES.iter().flat_map(|i| i.to_le_bytes()).collect();
        let index_view = self.push_view(
            &index_bytes,
            None,
            Some(json::buffer::Target::ElementArrayBuffer),
        );
        let indices = self.push_accessor(
            Some(index_view),
            0,
            CUBE_INDICES.len(),
            json::accessor::ComponentType::U16,
            json::accessor::Type::Scalar,
            None,
            None,
        );

        let material = if spec.second_material {
            self.add_material("placeholder");
            self.add_material("cube-alt")
        } else {
            self.add_material("cube")
        };

        let mut attributes = std::collections::BTreeMap::new();
        attributes.insert(
            Checked::Valid(json::mesh::Semantic::Positions),
            position,
        );
        attributes.insert(Checked::Valid(json::mesh::Semantic::Normals), normal);
        attributes.insert(Checked::Valid(json::mesh::Semantic::TexCoords(0)), uv);

        let primitive = json::mesh::Primitive {
            attributes,
            indices: Some(indices),
            material: Some(material),
            mode: Checked::Valid(json::mesh::Mode::Triangles),
            targets: None,
            extensions: Default::default(),
            extras: Default::default(),
        };
        self.add_mesh(Some("cube"), vec![primitive])
    }

    /// A cube whose POSITION and NORMAL interleave in one view with
    /// byteStride 24.
    pub fn add_interleaved_cube_mesh(&mut self) -> json::Index<json::Mesh> {
        let normals = cube_normals();
        let mut interleaved = Vec::new();
        for (position, normal) in CUBE_POSITIONS.iter().zip(normals.iter()) {
            for c in position {
                interleaved.extend_from_slice(&c.to_le_bytes());
            }
            for c in normal {
                interleaved.extend_from_slice(&c.to_le_bytes());
            }
        }
        let view = self.push_view(
            &interleaved,
            Some(24),
            Some(json::buffer::Target::ArrayBuffer),
        );
        let position = self.push_accessor(
            Some(view),
            0,
            CUBE_POSITIONS.len(),
            json::accessor::ComponentType::F32,
            json::accessor::Type::Vec3,
            Some(serde_json::json!([-0.5, -0.5, -0.5])),
            Some(serde_json::json!([0.5, 0.5, 0.5])),
        );
        let normal = self.push_accessor(
            Some(view),
            12,
            CUBE_POSITIONS.len(),
            json::accessor::ComponentType::F32,
            json::accessor::Type::Vec3,
            None,
            None,
        );

        let uvs: Vec<f32> = cube_uvs().iter().flatten().copied().collect();
        let uv = self.push_f32_accessor(
            &uvs,
            json::accessor::Type::Vec2,
            Some(json::buffer::Target::ArrayBuffer),
            None,
        );

        let index_bytes: Vec<u8> = CUBE_INDICES.iter().flat_map(|i| i.to_le_bytes()).collect();
        let index_view = self.push_view(
            &index_bytes,
            None,
            Some(json::buffer::Target::ElementArrayBuffer),
        );
        let indices = self.push_accessor(
            Some(index_view),
            0,
            CUBE_INDICES.len(),
            json::accessor::ComponentType::U16,
            json::accessor::Type::Scalar,
            None,
            None,
        );

        let material = self.add_material("cube");
        let mut attributes = std::collections::BTreeMap::new();
        attributes.insert(Checked::Valid(json::mesh::Semantic::Positions), position);
        attributes.insert(Checked::Valid(json::mesh::Semantic::Normals), normal);
        attributes.insert(Checked::Valid(json::mesh::Semantic::TexCoords(0)), uv);

        let primitive = json::mesh::Primitive {
            attributes,
            indices: Some(indices),
            material: Some(material),
            mode: Checked::Valid(json::mesh::Mode::Triangles),
            targets: None,
            extensions: Default::default(),
            extras: Default::default(),
        };
        self.add_mesh(Some("cube"), vec![primitive])
    }

    pub fn build(mut self, id: u32) -> LoadedModel {
        self.root.buffers[0].byte_length = USize64::from(self.bin.len());
        let json_string = json::serialize::to_string(&self.root).expect("serializable test root");
        let mut hasher = Sha256::new();
        hasher.update(json_string.as_bytes());
        hasher.update(&self.bin);
        let digest = hex::encode(hasher.finalize());
        LoadedModel {
            id,
            path: PathBuf::from(format!("model_{id}.glb")),
            digest,
            document: self.root,
            blob: self.bin,
        }
    }
}

impl LoadedModel {
    /// Serialize back to GLB bytes, for tests that need real files.
    pub fn to_glb_bytes(&self) -> Vec<u8> {
        let json_string = json::serialize::to_string(&self.document).expect("serializable root");
        let mut bin = self.blob.clone();
        while bin.len() % 4 != 0 {
            bin.push(0);
        }
        let glb = gltf::binary::Glb {
            header: gltf::binary::Header {
                magic: *b"glTF",
                version: 2,
                length: 0,
            },
            json: std::borrow::Cow::Owned(json_string.into_bytes()),
            bin: (!bin.is_empty()).then_some(std::borrow::Cow::Owned(bin)),
        };
        glb.to_vec().expect("serializable GLB")
    }
}

/// One cube mesh instantiated by two plain nodes at the origin and at
/// `(10, 0, 0)`.
pub fn two_cube_model(id: u32) -> LoadedModel {
    let mut builder = ModelBuilder::new();
    let mesh = builder.add_cube_mesh(CubeSpec::default());
    let a = builder.add_node(Some(mesh), None);
    let b = builder.add_node(Some(mesh), Some([10.0, 0.0, 0.0]));
    builder.set_scene(vec![a, b]);
    builder.build(id)
}

/// One cube mesh referenced by a single node at the origin.
pub fn cube_model_with(id: u32, spec: CubeSpec) -> LoadedModel {
    let mut builder = ModelBuilder::new();
    let mesh = builder.add_cube_mesh(spec);
    let node = builder.add_node(Some(mesh), None);
    builder.set_scene(vec![node]);
    builder.build(id)
}

/// Cube with interleaved POSITION/NORMAL, one node.
pub fn interleaved_cube_model(id: u32) -> LoadedModel {
    let mut builder = ModelBuilder::new();
    let mesh = builder.add_interleaved_cube_mesh();
    let node = builder.add_node(Some(mesh), None);
    builder.set_scene(vec![node]);
    builder.build(id)
}

/// Cube instanced through `EXT_mesh_gpu_instancing` translations.
pub fn instanced_cube_model(id: u32, translations: &[[f32; 3]]) -> LoadedModel {
    let mut builder = ModelBuilder::new();
    let mesh = builder.add_cube_mesh(CubeSpec::default());
    let node = builder.add_instanced_node(mesh, translations, None, None);
    builder.set_scene(vec![node]);
    builder.build(id)
}

/// Index of the POSITION accessor of a primitive.
pub fn position_accessor(primitive: &json::mesh::Primitive) -> usize {
    primitive
        .attributes
        .iter()
        .find_map(|(semantic, index)| {
            matches!(
                semantic,
                Checked::Valid(json::mesh::Semantic::Positions)
            )
            .then(|| index.value())
        })
        .expect("primitive has POSITION")
}
