//! Output assembly.
//!
//! Drives the three output variants against a detection result: one GLB with
//! every instanced group as a GPU-instanced node, one GLB with the residual
//! plain nodes, and (optionally) one GLB per source mesh. Each variant owns a
//! fresh [`remap::OutputBuilder`], so variants never share mutable state.
//!
//! A failed mesh copy abandons that mesh and degrades the output; source data
//! that cannot be resolved at all (external or out-of-bounds buffers) aborts
//! the variant. Files are fully serialized in memory before anything touches
//! disk, so a failing variant leaves no partial output behind.

mod prune;
pub(crate) mod remap;

pub use remap::WriteError;

use std::path::{Path, PathBuf};

use gltf_json as json;
use json::validation::{Checked, USize64};
use rootcause::Report;
use serde_json::Map;
use tracing::{error, info};

use crate::detector::{node_instancing, Detection, MeshInstance};
use crate::loader::LoadedModel;
use crate::math::{Aabb, Trs};
use crate::signature;
use crate::EXT_MESH_GPU_INSTANCING;
use remap::{is_fatal, AccessorUsage, OutputBuilder};

/// Result of one output-variant emission.
pub struct WriteOutcome {
    pub path: PathBuf,
    /// World-space box enclosing everything the variant emitted. Invalid
    /// when the output is empty.
    pub bounds: Aabb,
    /// True when at least one mesh had to be abandoned.
    pub degraded: bool,
}

fn model_by_id(models: &[LoadedModel], id: u32) -> Option<&LoadedModel> {
    models.iter().find(|model| model.id == id)
}

fn push_instance_accessor(
    builder: &mut OutputBuilder,
    bytes: &[u8],
    type_: json::accessor::Type,
    count: usize,
) -> json::Index<json::Accessor> {
    let view = builder.add_data(bytes, None, None);
    builder.root.push(json::Accessor {
        buffer_view: Some(view),
        byte_offset: Some(USize64(0)),
        count: USize64::from(count),
        component_type: Checked::Valid(json::accessor::GenericComponentType(
            json::accessor::ComponentType::F32,
        )),
        type_: Checked::Valid(type_),
        min: None,
        max: None,
        name: None,
        normalized: false,
        sparse: None,
        extensions: Default::default(),
        extras: Default::default(),
    })
}

/// Emit a node whose per-instance transforms live in
/// `EXT_mesh_gpu_instancing` TRS accessors, packed in group order.
fn instanced_node(
    builder: &mut OutputBuilder,
    mesh: json::Index<json::Mesh>,
    instances: &[MeshInstance],
    name: Option<&str>,
) -> json::Index<json::Node> {
    let translations: Vec<[f32; 3]> = instances
        .iter()
        .map(|instance| {
            let t = instance.transform.translation;
            [t.x as f32, t.y as f32, t.z as f32]
        })
        .collect();
    let rotations: Vec<[f32; 4]> = instances
        .iter()
        .map(|instance| {
            let q = instance.transform.rotation;
            [q.x as f32, q.y as f32, q.z as f32, q.w as f32]
        })
        .collect();
    let scales: Vec<[f32; 3]> = instances
        .iter()
        .map(|instance| {
            let s = instance.transform.scale;
            [s.x as f32, s.y as f32, s.z as f32]
        })
        .collect();

    let translation = push_instance_accessor(
        builder,
        bytemuck::cast_slice(&translations),
        json::accessor::Type::Vec3,
        instances.len(),
    );
    let rotation = push_instance_accessor(
        builder,
        bytemuck::cast_slice(&rotations),
        json::accessor::Type::Vec4,
        instances.len(),
    );
    let scale = push_instance_accessor(
        builder,
        bytemuck::cast_slice(&scales),
        json::accessor::Type::Vec3,
        instances.len(),
    );

    let mut attributes = Map::new();
    attributes.insert(
        "TRANSLATION".to_string(),
        serde_json::json!(translation.value()),
    );
    attributes.insert("ROTATION".to_string(), serde_json::json!(rotation.value()));
    attributes.insert("SCALE".to_string(), serde_json::json!(scale.value()));
    let mut others = Map::new();
    others.insert(
        EXT_MESH_GPU_INSTANCING.to_string(),
        serde_json::json!({ "attributes": attributes }),
    );
    builder.note_extension_used(EXT_MESH_GPU_INSTANCING);

    let name = name
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| format!("instanced_node_mesh_{}", mesh.value()));
    builder.root.push(json::Node {
        mesh: Some(mesh),
        name: Some(name),
        extensions: Some(json::extensions::scene::Node { others }),
        ..Default::default()
    })
}

/// Emit a plain node with local TRS, leaving out components within 1e-10 of
/// identity.
fn plain_node(
    builder: &mut OutputBuilder,
    mesh: json::Index<json::Mesh>,
    transform: &Trs,
) -> json::Index<json::Node> {
    const EPSILON: f64 = 1e-10;
    let t = transform.translation;
    let translation = (t.x.abs() > EPSILON || t.y.abs() > EPSILON || t.z.abs() > EPSILON)
        .then(|| [t.x as f32, t.y as f32, t.z as f32]);
    let q = transform.rotation;
    let rotation = (q.x.abs() > EPSILON
        || q.y.abs() > EPSILON
        || q.z.abs() > EPSILON
        || (q.w - 1.0).abs() > EPSILON)
        .then(|| {
            json::scene::UnitQuaternion([q.x as f32, q.y as f32, q.z as f32, q.w as f32])
        });
    let s = transform.scale;
    let scale = ((s.x - 1.0).abs() > EPSILON
        || (s.y - 1.0).abs() > EPSILON
        || (s.z - 1.0).abs() > EPSILON)
        .then(|| [s.x as f32, s.y as f32, s.z as f32]);

    builder.root.push(json::Node {
        mesh: Some(mesh),
        translation,
        rotation,
        scale,
        ..Default::default()
    })
}

fn set_default_scene(builder: &mut OutputBuilder, roots: Vec<json::Index<json::Node>>) {
    if roots.is_empty() {
        return;
    }
    let scene = builder.root.push(json::Scene {
        nodes: roots,
        name: None,
        extensions: Default::default(),
        extras: Default::default(),
    });
    builder.root.scene = Some(scene);
}

/// Prune, finalize the buffer, serialize to a GLB byte stream and write it.
fn finish_glb(mut builder: OutputBuilder, path: &Path) -> Result<(), WriteError> {
    prune::prune_unused(&mut builder.root);

    let buffer_used = !builder.root.buffer_views.is_empty()
        || builder
            .root
            .images
            .iter()
            .any(|image| image.buffer_view.is_some());
    if buffer_used {
        if let Some(buffer) = builder.root.buffers.first_mut() {
            buffer.byte_length = USize64::from(builder.bin.len());
        }
    } else {
        builder.root.buffers.clear();
        builder.bin.clear();
    }

    let json_string = json::serialize::to_string(&builder.root)
        .map_err(|err| WriteError::Serialize(err.to_string()))?;
    let mut bin = builder.bin;
    while bin.len() % 4 != 0 {
        bin.push(0);
    }

    let glb = gltf::binary::Glb {
        header: gltf::binary::Header {
            magic: *b"glTF",
            version: 2,
            length: 0, // computed during serialization
        },
        json: std::borrow::Cow::Owned(json_string.into_bytes()),
        bin: if bin.is_empty() {
            None
        } else {
            Some(std::borrow::Cow::Owned(bin))
        },
    };
    let bytes = glb
        .to_vec()
        .map_err(|err| WriteError::Serialize(err.to_string()))?;
    std::fs::write(path, bytes).map_err(|err| WriteError::Io(err.to_string()))?;
    Ok(())
}

/// Variant A: every instanced group as one GPU-instanced node.
pub fn write_instanced_glb(
    models: &[LoadedModel],
    detection: &Detection,
    path: &Path,
) -> Result<WriteOutcome, Report<WriteError>> {
    info!("writing instanced output: {}", path.display());
    let mut builder = OutputBuilder::new();
    let mut roots = Vec::new();
    let mut bounds = Aabb::empty();
    let mut degraded = false;

    for group in &detection.groups {
        if group.instances.is_empty() {
            continue;
        }
        let Some(representative) = model_by_id(models, group.model_id) else {
            error!("group references unknown model {}", group.model_id);
            degraded = true;
            continue;
        };
        let mesh = match builder.copy_mesh(representative, group.mesh_index) {
            Ok(mesh) => mesh,
            Err(err) if is_fatal(&err) => return Err(Report::new(err)),
            Err(err) => {
                error!(
                    "abandoning mesh {} of {}: {err}",
                    group.mesh_index,
                    representative.path.display()
                );
                degraded = true;
                continue;
            }
        };
        let node = instanced_node(
            &mut builder,
            mesh,
            &group.instances,
            group.mesh_name.as_deref(),
        );
        roots.push(node);

        let local = signature::mesh_bounds(representative, group.mesh_index);
        if local.is_valid() {
            for instance in &group.instances {
                bounds.merge(&local.transformed(&instance.transform.matrix()));
            }
        }
    }

    set_default_scene(&mut builder, roots);
    finish_glb(builder, path).map_err(Report::new)?;
    info!("wrote instanced output: {}", path.display());
    Ok(WriteOutcome {
        path: path.to_path_buf(),
        bounds,
        degraded,
    })
}

/// Variant B: the residual non-instanced meshes as plain nodes.
pub fn write_non_instanced_glb(
    models: &[LoadedModel],
    detection: &Detection,
    path: &Path,
) -> Result<WriteOutcome, Report<WriteError>> {
    info!("writing non-instanced output: {}", path.display());
    let mut builder = OutputBuilder::new();
    let mut roots = Vec::new();
    let mut bounds = Aabb::empty();
    let mut degraded = false;

    for entry in &detection.non_instanced {
        let Some(model) = model_by_id(models, entry.model_id) else {
            error!("non-instanced entry references unknown model {}", entry.model_id);
            degraded = true;
            continue;
        };
        let mesh = match builder.copy_mesh(model, entry.mesh_index) {
            Ok(mesh) => mesh,
            Err(err) if is_fatal(&err) => return Err(Report::new(err)),
            Err(err) => {
                error!(
                    "abandoning mesh {} of {}: {err}",
                    entry.mesh_index,
                    model.path.display()
                );
                degraded = true;
                continue;
            }
        };
        let node = plain_node(&mut builder, mesh, &entry.transform);
        roots.push(node);

        let local = signature::mesh_bounds(model, entry.mesh_index);
        if local.is_valid() {
            bounds.merge(&local.transformed(&entry.transform.matrix()));
        }
    }

    set_default_scene(&mut builder, roots);
    finish_glb(builder, path).map_err(Report::new)?;
    info!("wrote non-instanced output: {}", path.display());
    Ok(WriteOutcome {
        path: path.to_path_buf(),
        bounds,
        degraded,
    })
}

fn sanitize_component(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

fn write_single_mesh_glb(
    model: &LoadedModel,
    mesh_index: usize,
    output_dir: &Path,
) -> Result<PathBuf, WriteError> {
    let mut builder = OutputBuilder::new();
    let mesh = builder.copy_mesh(model, mesh_index)?;

    let source_mesh = &model.document.meshes[mesh_index];
    let mesh_name = source_mesh.name.clone().filter(|name| !name.is_empty());
    let stem = model
        .path
        .file_stem()
        .and_then(|stem| stem.to_str())
        .unwrap_or("model")
        .to_string();

    let mut node = json::Node {
        mesh: Some(mesh),
        ..Default::default()
    };
    node.name = Some(
        mesh_name
            .clone()
            .unwrap_or_else(|| format!("{stem}_mesh_{mesh_index}")),
    );

    // A source node instancing this mesh wins over plain TRS sources; its
    // per-instance accessors are re-emitted through the remapper.
    let references_mesh =
        |node: &&json::Node| node.mesh.map(|mesh| mesh.value()) == Some(mesh_index);
    let instancing_payload = model
        .document
        .nodes
        .iter()
        .filter(|node| references_mesh(node))
        .find_map(|node| node_instancing(node).cloned());
    if let Some(payload) = instancing_payload {
        let mut attributes = Map::new();
        if let Some(entries) = payload.get("attributes").and_then(|value| value.as_object()) {
            for (name, value) in entries {
                match value.as_u64() {
                    Some(accessor) => {
                        let copied = builder.copy_accessor(
                            model,
                            accessor as usize,
                            AccessorUsage::Instance,
                        )?;
                        attributes.insert(name.clone(), serde_json::json!(copied.value()));
                    }
                    None => error!(
                        "instancing attribute {name} on mesh {mesh_index} of {} is not an \
                         accessor index; skipping it",
                        model.path.display()
                    ),
                }
            }
        }
        if !attributes.is_empty() {
            let mut others = Map::new();
            others.insert(
                EXT_MESH_GPU_INSTANCING.to_string(),
                serde_json::json!({ "attributes": attributes }),
            );
            node.extensions = Some(json::extensions::scene::Node { others });
            builder.note_extension_used(EXT_MESH_GPU_INSTANCING);
            if model
                .document
                .extensions_required
                .iter()
                .any(|required| required == EXT_MESH_GPU_INSTANCING)
            {
                builder.note_extension_required(EXT_MESH_GPU_INSTANCING);
            }
        }
    } else if let Some(source_node) = model.document.nodes.iter().find(references_mesh) {
        node.translation = source_node.translation;
        node.rotation = source_node.rotation;
        node.scale = source_node.scale;
        node.matrix = source_node.matrix;
    }

    let node = builder.root.push(node);
    let scene_name = mesh_name
        .as_deref()
        .map(|name| format!("scene_for_{name}"))
        .unwrap_or_else(|| format!("scene_for_mesh_{mesh_index}"));
    let scene = builder.root.push(json::Scene {
        nodes: vec![node],
        name: Some(scene_name),
        extensions: Default::default(),
        extras: Default::default(),
    });
    builder.root.scene = Some(scene);

    let mesh_part = mesh_name
        .map(|name| sanitize_component(&name))
        .unwrap_or_else(|| format!("mesh_{mesh_index}"));
    let path = output_dir.join(format!("{stem}_{mesh_part}.glb"));
    finish_glb(builder, &path)?;
    Ok(path)
}

/// Variant C: one GLB per mesh of every source model. Returns the number of
/// files written; per-mesh failures are logged and skipped.
pub fn write_segmented_glbs(
    models: &[LoadedModel],
    output_dir: &Path,
) -> Result<usize, Report<WriteError>> {
    std::fs::create_dir_all(output_dir)
        .map_err(|err| Report::new(WriteError::Io(err.to_string())))?;

    let mut written = 0usize;
    for model in models {
        if model.document.meshes.is_empty() {
            info!("{} has no meshes to segment", model.path.display());
            continue;
        }
        info!("segmenting meshes from {}", model.path.display());
        for mesh_index in 0..model.document.meshes.len() {
            match write_single_mesh_glb(model, mesh_index, output_dir) {
                Ok(path) => {
                    written += 1;
                    info!("wrote segmented GLB: {}", path.display());
                }
                Err(err) => error!(
                    "failed to segment mesh {mesh_index} of {}: {err}",
                    model.path.display()
                ),
            }
        }
    }
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access;
    use crate::detector::{instancing_attribute, Detector};
    use crate::loader;
    use crate::signature::SignatureOptions;
    use crate::testutil::{
        instanced_cube_model, interleaved_cube_model, two_cube_model, CUBE_POSITIONS,
    };
    use glam::DVec3;

    fn reload(path: &Path) -> LoadedModel {
        loader::read_model(path, 0).unwrap()
    }

    fn detect(models: &[LoadedModel], limit: usize) -> Detection {
        Detector::new(SignatureOptions::exact(), limit).detect(models)
    }

    #[test]
    fn two_cubes_collapse_into_one_instanced_node() {
        let dir = tempfile::tempdir().unwrap();
        let models = vec![two_cube_model(0)];
        let detection = detect(&models, 2);

        let instanced = dir.path().join("instanced_meshes.glb");
        let outcome = write_instanced_glb(&models, &detection, &instanced).unwrap();
        assert!(!outcome.degraded);
        // Bounding box encloses both instances of the unit cube.
        assert!((outcome.bounds.min - DVec3::new(-0.5, -0.5, -0.5)).length() < 1e-9);
        assert!((outcome.bounds.max - DVec3::new(10.5, 0.5, 0.5)).length() < 1e-9);

        let output = reload(&instanced);
        assert_eq!(output.document.meshes.len(), 1);
        assert_eq!(output.document.nodes.len(), 1);
        assert!(output
            .document
            .extensions_used
            .iter()
            .any(|ext| ext == EXT_MESH_GPU_INSTANCING));

        let node = &output.document.nodes[0];
        let payload = node_instancing(node).expect("instancing extension on output node");
        let translation = instancing_attribute(payload, "TRANSLATION").unwrap();
        assert_eq!(output.document.accessors[translation].count.0, 2);
        assert_eq!(
            access::read_vec3_f32(&output, translation, 0).unwrap(),
            [0.0, 0.0, 0.0]
        );
        assert_eq!(
            access::read_vec3_f32(&output, translation, 1).unwrap(),
            [10.0, 0.0, 0.0]
        );
        let rotation = instancing_attribute(payload, "ROTATION").unwrap();
        assert_eq!(
            access::read_vec4_f32(&output, rotation, 0).unwrap(),
            [0.0, 0.0, 0.0, 1.0]
        );

        // No geometry is lost: rendered vertices = instances × mesh vertices.
        let rendered: usize = output
            .document
            .nodes
            .iter()
            .filter_map(|node| {
                let payload = node_instancing(node)?;
                let count = instancing_attribute(payload, "TRANSLATION")
                    .map(|idx| output.document.accessors[idx].count.0 as usize)?;
                let mesh = node.mesh?.value();
                let verts: usize = output.document.meshes[mesh]
                    .primitives
                    .iter()
                    .map(|p| {
                        crate::testutil::position_accessor(p)
                    })
                    .map(|idx| output.document.accessors[idx].count.0 as usize)
                    .sum();
                Some(count * verts)
            })
            .sum();
        assert_eq!(rendered, 2 * CUBE_POSITIONS.len());

        // The non-instanced variant is empty.
        let non_instanced = dir.path().join("non_instanced_meshes.glb");
        let outcome = write_non_instanced_glb(&models, &detection, &non_instanced).unwrap();
        assert!(!outcome.bounds.is_valid());
        let output = reload(&non_instanced);
        assert!(output.document.nodes.is_empty());
        assert!(output.document.meshes.is_empty());
        assert!(output.document.buffers.is_empty());
    }

    #[test]
    fn below_limit_groups_emit_plain_nodes_sharing_one_mesh() {
        let dir = tempfile::tempdir().unwrap();
        let models = vec![two_cube_model(0)];
        let detection = detect(&models, 3);

        let instanced = dir.path().join("instanced_meshes.glb");
        write_instanced_glb(&models, &detection, &instanced).unwrap();
        assert!(reload(&instanced).document.nodes.is_empty());

        let non_instanced = dir.path().join("non_instanced_meshes.glb");
        let outcome = write_non_instanced_glb(&models, &detection, &non_instanced).unwrap();
        let output = reload(&non_instanced);
        assert_eq!(output.document.nodes.len(), 2);
        // The shared mesh is copied once through the remap cache.
        assert_eq!(output.document.meshes.len(), 1);
        assert_eq!(output.document.nodes[0].translation, None);
        assert_eq!(
            output.document.nodes[1].translation,
            Some([10.0, 0.0, 0.0])
        );
        // Identity rotation and scale are omitted entirely.
        assert!(output.document.nodes[1].rotation.is_none());
        assert!(output.document.nodes[1].scale.is_none());
        assert!((outcome.bounds.max - DVec3::new(10.5, 0.5, 0.5)).length() < 1e-9);
    }

    #[test]
    fn interleaved_sources_are_deinterleaved_in_the_output() {
        let dir = tempfile::tempdir().unwrap();
        let models = vec![interleaved_cube_model(0)];
        let detection = detect(&models, 2);
        assert_eq!(detection.non_instanced.len(), 1);

        let path = dir.path().join("non_instanced_meshes.glb");
        write_non_instanced_glb(&models, &detection, &path).unwrap();
        let output = reload(&path);
        assert_eq!(output.document.nodes.len(), 1);
        assert_eq!(output.document.meshes.len(), 1);

        for (index, accessor) in output.document.accessors.iter().enumerate() {
            assert_eq!(accessor.byte_offset.unwrap_or_default().0, 0);
            let element_len = access::element_byte_length(accessor).unwrap();
            let view = &output.document.buffer_views[accessor.buffer_view.unwrap().value()];
            assert_eq!(
                view.byte_length.0 as usize,
                accessor.count.0 as usize * element_len,
                "accessor {index} view length"
            );
            match view.target {
                Some(Checked::Valid(json::buffer::Target::ArrayBuffer)) => {
                    assert_eq!(view.byte_stride.map(|s| s.0), Some(element_len));
                }
                Some(Checked::Valid(json::buffer::Target::ElementArrayBuffer)) => {
                    assert_eq!(view.byte_stride, None);
                }
                _ => {}
            }
        }

        // Vertex data survives byte-for-byte under the packed walk.
        let source = &models[0];
        let mesh = &output.document.meshes[0];
        let out_pos = crate::testutil::position_accessor(&mesh.primitives[0]);
        let src_pos =
            crate::testutil::position_accessor(&source.document.meshes[0].primitives[0]);
        assert_eq!(
            access::packed_bytes(&output, out_pos).unwrap().unwrap(),
            access::packed_bytes(source, src_pos).unwrap().unwrap()
        );

        // Buffer invariants: views lie inside the buffer, offsets do not
        // decrease in creation order.
        let buffer_len = output.document.buffers[0].byte_length.0 as usize;
        assert_eq!(buffer_len, output.blob.len());
        let mut last_offset = 0;
        for view in &output.document.buffer_views {
            let offset = view.byte_offset.unwrap_or_default().0 as usize;
            assert!(offset + view.byte_length.0 as usize <= buffer_len);
            assert!(offset >= last_offset);
            last_offset = offset;
        }
    }

    #[test]
    fn segmentation_reemits_instancing_extensions() {
        let dir = tempfile::tempdir().unwrap();
        let translations: Vec<[f32; 3]> = (0..5).map(|i| [i as f32, 0.0, 0.0]).collect();
        let models = vec![instanced_cube_model(0, &translations)];

        let written = write_segmented_glbs(&models, dir.path()).unwrap();
        assert_eq!(written, 1);

        let path = dir.path().join("model_0_cube.glb");
        let output = reload(&path);
        assert_eq!(output.document.meshes.len(), 1);
        let node = &output.document.nodes[0];
        let payload = node_instancing(node).expect("re-emitted instancing extension");
        let translation = instancing_attribute(payload, "TRANSLATION").unwrap();
        assert_eq!(output.document.accessors[translation].count.0, 5);
        assert_eq!(
            access::read_vec3_f32(&output, translation, 4).unwrap(),
            [4.0, 0.0, 0.0]
        );
        // Instance streams carry neither stride nor target.
        let view = &output.document.buffer_views
            [output.document.accessors[translation].buffer_view.unwrap().value()];
        assert_eq!(view.byte_stride, None);
        assert!(view.target.is_none());
    }

    #[test]
    fn segmentation_copies_plain_node_transforms() {
        let dir = tempfile::tempdir().unwrap();
        let models = vec![two_cube_model(0)];
        let written = write_segmented_glbs(&models, dir.path()).unwrap();
        assert_eq!(written, 1);
        let output = reload(&dir.path().join("model_0_cube.glb"));
        // The first node referencing the mesh provides the transform; in the
        // two-cube model that node sits at the origin with no TRS at all.
        assert_eq!(output.document.nodes.len(), 1);
        assert_eq!(output.document.nodes[0].translation, None);
        assert_eq!(
            output.document.nodes[0].name.as_deref(),
            Some("cube")
        );
    }
}
