//! Content signatures for mesh primitives.
//!
//! A signature is a 64-bit hash of a primitive's equivalence class. In exact
//! mode two primitives share a signature only if material reference, mode,
//! indices and every attribute's packed data agree byte for byte. In
//! tolerance mode POSITION data is left out (the vertex count still counts),
//! optional attributes can be exempted, and NORMAL data may be hashed in
//! quantized form; actual equivalence is then witnessed later by bounding-box
//! similarity.
//!
//! Hashing is FNV-1a over little-endian canonical bytes with boost-style
//! mixing, so signatures are deterministic across runs and architectures.
//! They are never persisted.

use std::collections::BTreeSet;

use gltf_json as json;
use json::validation::Checked;
use tracing::warn;

use crate::access;
use crate::loader::LoadedModel;
use crate::math::Aabb;

/// Tolerances at or below this are treated as exact matching.
pub const TOLERANCE_EPSILON: f64 = 1e-9;

/// Knobs controlling how primitive signatures are computed.
#[derive(Debug, Clone, Default)]
pub struct SignatureOptions {
    /// POSITION tolerance. Zero selects exact mode.
    pub tolerance: f64,
    /// Quantization step for NORMAL data in tolerance mode.
    pub normal_tolerance: f64,
    /// Attribute names whose data hash is skipped in tolerance mode
    /// (their element counts still contribute).
    pub skip_attribute_data: BTreeSet<String>,
}

impl SignatureOptions {
    pub fn exact() -> Self {
        Self::default()
    }

    pub fn tolerance_mode(&self) -> bool {
        self.tolerance > TOLERANCE_EPSILON
    }

    fn normal_quantization(&self) -> Option<f64> {
        (self.normal_tolerance > TOLERANCE_EPSILON).then_some(self.normal_tolerance)
    }
}

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

fn fnv1a(bytes: &[u8]) -> u64 {
    bytes
        .iter()
        .fold(FNV_OFFSET, |hash, byte| (hash ^ u64::from(*byte)).wrapping_mul(FNV_PRIME))
}

fn combine(seed: &mut u64, hash: u64) {
    *seed ^= hash
        .wrapping_add(0x9e37_79b9_7f4a_7c15)
        .wrapping_add(*seed << 6)
        .wrapping_add(*seed >> 2);
}

fn combine_i64(seed: &mut u64, value: i64) {
    combine(seed, value as u64);
}

fn combine_bytes(seed: &mut u64, bytes: &[u8]) {
    combine(seed, fnv1a(bytes));
}

/// The glTF attribute name for a semantic, used to fix hashing order.
fn semantic_name(semantic: &json::mesh::Semantic) -> String {
    use json::mesh::Semantic;
    match semantic {
        Semantic::Positions => "POSITION".to_string(),
        Semantic::Normals => "NORMAL".to_string(),
        Semantic::Tangents => "TANGENT".to_string(),
        Semantic::Colors(set) => format!("COLOR_{set}"),
        Semantic::TexCoords(set) => format!("TEXCOORD_{set}"),
        Semantic::Joints(set) => format!("JOINTS_{set}"),
        Semantic::Weights(set) => format!("WEIGHTS_{set}"),
        Semantic::Extras(name) => format!("_{name}"),
    }
}

fn type_ordinal(accessor: &json::Accessor) -> i64 {
    match accessor.type_ {
        Checked::Valid(type_) => type_ as i64,
        Checked::Invalid => -1,
    }
}

fn component_ordinal(accessor: &json::Accessor) -> i64 {
    match accessor.component_type {
        Checked::Valid(component) => component.0 as i64,
        Checked::Invalid => -1,
    }
}

fn combine_accessor_meta(seed: &mut u64, accessor: &json::Accessor) {
    combine_i64(seed, type_ordinal(accessor));
    combine_i64(seed, component_ordinal(accessor));
    combine_i64(seed, accessor.count.0 as i64);
    combine_i64(seed, i64::from(accessor.normalized));
}

/// Hash an accessor's packed data. Accessors without a buffer view fall back
/// to hashing their metadata (including min/max) so they still discriminate.
fn accessor_data_hash(model: &LoadedModel, accessor_index: usize) -> u64 {
    match access::packed_bytes(model, accessor_index) {
        Ok(Some(bytes)) => fnv1a(&bytes),
        Ok(None) => {
            let accessor = &model.document.accessors[accessor_index];
            let mut seed = 0u64;
            combine_accessor_meta(&mut seed, accessor);
            for bound in [&accessor.min, &accessor.max] {
                match bound {
                    Some(value) => combine_bytes(&mut seed, value.to_string().as_bytes()),
                    None => combine_i64(&mut seed, -1),
                }
            }
            seed
        }
        Err(err) => {
            warn!(
                "cannot hash accessor {accessor_index} of {}: {err}",
                model.path.display()
            );
            let mut seed = 0u64;
            combine_i64(&mut seed, -1);
            combine_i64(&mut seed, accessor_index as i64);
            seed
        }
    }
}

/// Hash VEC3/F32 data with each component divided by `step` and rounded to
/// the nearest integer, so near-parallel normals land in one bucket.
/// Returns `None` when the accessor does not have that layout.
fn quantized_vec3_hash(model: &LoadedModel, accessor_index: usize, step: f64) -> Option<u64> {
    let accessor = model.document.accessors.get(accessor_index)?;
    let float = matches!(
        accessor.component_type,
        Checked::Valid(json::accessor::GenericComponentType(
            json::accessor::ComponentType::F32
        ))
    );
    if !float || !matches!(accessor.type_, Checked::Valid(json::accessor::Type::Vec3)) {
        return None;
    }
    let resolved = access::resolve(model, accessor_index).ok()??;
    let mut seed = 0u64;
    for element in 0..resolved.count {
        let bytes = resolved.element(element);
        for component in 0..3 {
            let at = component * 4;
            let value = f32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]]);
            let quantized = (f64::from(value) / step).round() as i64;
            combine_i64(&mut seed, quantized);
        }
    }
    Some(seed)
}

fn accessor_index(index: Option<json::Index<json::Accessor>>, model: &LoadedModel) -> Option<usize> {
    let index = index?.value();
    (index < model.document.accessors.len()).then_some(index)
}

/// Attributes of a primitive as `(name, accessor index)` in strict
/// lexicographic name order.
fn sorted_attributes(primitive: &json::mesh::Primitive) -> Vec<(String, usize)> {
    let mut attributes: Vec<(String, usize)> = primitive
        .attributes
        .iter()
        .filter_map(|(semantic, index)| match semantic {
            Checked::Valid(semantic) => Some((semantic_name(semantic), index.value())),
            Checked::Invalid => {
                warn!("skipping attribute with unrecognized semantic");
                None
            }
        })
        .collect();
    attributes.sort();
    attributes
}

/// Morph-target attributes in lexicographic name order.
fn target_attributes(target: &json::mesh::MorphTarget) -> Vec<(&'static str, json::Index<json::Accessor>)> {
    let mut attributes = Vec::new();
    if let Some(index) = target.normals {
        attributes.push(("NORMAL", index));
    }
    if let Some(index) = target.positions {
        attributes.push(("POSITION", index));
    }
    if let Some(index) = target.tangents {
        attributes.push(("TANGENT", index));
    }
    attributes
}

fn combine_indices(seed: &mut u64, model: &LoadedModel, primitive: &json::mesh::Primitive) {
    match accessor_index(primitive.indices, model) {
        Some(index) => {
            let accessor = &model.document.accessors[index];
            combine_i64(seed, type_ordinal(accessor));
            combine_i64(seed, component_ordinal(accessor));
            combine_i64(seed, accessor.count.0 as i64);
            combine(seed, accessor_data_hash(model, index));
        }
        None => {
            combine_i64(seed, -1);
            combine_i64(seed, -1);
            combine_i64(seed, 0);
            combine_i64(seed, -1);
        }
    }
}

fn combine_morph_targets(seed: &mut u64, model: &LoadedModel, primitive: &json::mesh::Primitive) {
    let Some(targets) = &primitive.targets else {
        return;
    };
    for target in targets {
        for (name, index) in target_attributes(target) {
            combine_bytes(seed, name.as_bytes());
            match accessor_index(Some(index), model) {
                Some(index) => {
                    let accessor = &model.document.accessors[index];
                    combine_accessor_meta(seed, accessor);
                    combine(seed, accessor_data_hash(model, index));
                }
                None => combine_i64(seed, -1),
            }
        }
    }
}

fn primitive_signature_exact(model: &LoadedModel, primitive: &json::mesh::Primitive) -> u64 {
    let mut seed = 0u64;
    combine_i64(
        &mut seed,
        primitive.material.map(|index| index.value() as i64).unwrap_or(-1),
    );
    combine_i64(
        &mut seed,
        match primitive.mode {
            Checked::Valid(mode) => mode as i64,
            Checked::Invalid => -1,
        },
    );
    combine_indices(&mut seed, model, primitive);

    for (name, index) in sorted_attributes(primitive) {
        combine_bytes(&mut seed, name.as_bytes());
        if index < model.document.accessors.len() {
            let accessor = &model.document.accessors[index];
            combine_accessor_meta(&mut seed, accessor);
            combine(&mut seed, accessor_data_hash(model, index));
        } else {
            combine_i64(&mut seed, -1);
        }
    }

    combine_morph_targets(&mut seed, model, primitive);
    seed
}

fn primitive_signature_tolerance(
    model: &LoadedModel,
    primitive: &json::mesh::Primitive,
    options: &SignatureOptions,
) -> u64 {
    let mut seed = 0u64;
    combine_i64(
        &mut seed,
        primitive.material.map(|index| index.value() as i64).unwrap_or(-1),
    );
    combine_i64(
        &mut seed,
        match primitive.mode {
            Checked::Valid(mode) => mode as i64,
            Checked::Invalid => -1,
        },
    );
    combine_indices(&mut seed, model, primitive);

    for (name, index) in sorted_attributes(primitive) {
        combine_bytes(&mut seed, name.as_bytes());
        if index >= model.document.accessors.len() {
            combine_i64(&mut seed, -1);
            continue;
        }
        let accessor = &model.document.accessors[index];
        combine_accessor_meta(&mut seed, accessor);

        // POSITION is compared through bounding boxes instead of data;
        // caller-listed attributes are exempt as well.
        if name == "POSITION" || options.skip_attribute_data.contains(&name) {
            continue;
        }
        if name == "NORMAL" {
            if let Some(step) = options.normal_quantization() {
                if let Some(hash) = quantized_vec3_hash(model, index, step) {
                    combine(&mut seed, hash);
                    continue;
                }
                warn!(
                    "NORMAL accessor {index} of {} is not VEC3/F32; hashing exactly",
                    model.path.display()
                );
            }
        }
        combine(&mut seed, accessor_data_hash(model, index));
    }

    combine_morph_targets(&mut seed, model, primitive);
    seed
}

/// Signature of one primitive under the given options.
pub fn primitive_signature(
    model: &LoadedModel,
    primitive: &json::mesh::Primitive,
    options: &SignatureOptions,
) -> u64 {
    if options.tolerance_mode() {
        primitive_signature_tolerance(model, primitive, options)
    } else {
        primitive_signature_exact(model, primitive)
    }
}

/// Signature of a mesh: its primitive signatures combined in source order.
pub fn mesh_signature(model: &LoadedModel, mesh_index: usize, options: &SignatureOptions) -> u64 {
    let mut seed = 0u64;
    if let Some(mesh) = model.document.meshes.get(mesh_index) {
        for primitive in &mesh.primitives {
            combine(&mut seed, primitive_signature(model, primitive, options));
        }
    }
    seed
}

/// Local-space bounding box of a primitive, taken from the POSITION
/// accessor's min/max when present and otherwise computed from the data.
pub fn primitive_bounds(model: &LoadedModel, primitive: &json::mesh::Primitive) -> Aabb {
    let mut bounds = Aabb::empty();
    let position = primitive.attributes.iter().find_map(|(semantic, index)| {
        matches!(semantic, Checked::Valid(json::mesh::Semantic::Positions)).then(|| index.value())
    });
    let Some(position) = position else {
        return bounds;
    };
    let Some(accessor) = model.document.accessors.get(position) else {
        return bounds;
    };

    if let (Some(min), Some(max)) = (
        accessor.min.as_ref().and_then(json_vec3),
        accessor.max.as_ref().and_then(json_vec3),
    ) {
        bounds.min = min.into();
        bounds.max = max.into();
        return bounds;
    }

    let count = accessor.count.0 as usize;
    for element in 0..count {
        match access::read_vec3_f32(model, position, element) {
            Ok(value) => bounds.include(glam::DVec3::new(
                f64::from(value[0]),
                f64::from(value[1]),
                f64::from(value[2]),
            )),
            Err(err) => {
                warn!(
                    "cannot read POSITION accessor {position} of {}: {err}",
                    model.path.display()
                );
                return Aabb::empty();
            }
        }
    }
    bounds
}

pub fn mesh_bounds(model: &LoadedModel, mesh_index: usize) -> Aabb {
    let mut bounds = Aabb::empty();
    if let Some(mesh) = model.document.meshes.get(mesh_index) {
        for primitive in &mesh.primitives {
            bounds.merge(&primitive_bounds(model, primitive));
        }
    }
    bounds
}

fn json_vec3(value: &serde_json::Value) -> Option<[f64; 3]> {
    let array = value.as_array()?;
    if array.len() < 3 {
        return None;
    }
    Some([
        array[0].as_f64()?,
        array[1].as_f64()?,
        array[2].as_f64()?,
    ])
}
