//! Scene traversal and instance grouping.
//!
//! Walks every loaded model's default scene accumulating world transforms,
//! buckets mesh-bearing nodes by content signature, expands nodes that
//! already carry `EXT_mesh_gpu_instancing`, and finally demotes groups that
//! fall short of the configured instance limit.

use std::collections::{BTreeMap, HashMap};

use glam::{DMat4, DQuat, DVec3};
use gltf_json as json;
use tracing::{debug, error, info, warn};

use crate::loader::LoadedModel;
use crate::math::{Aabb, Trs};
use crate::signature::{self, SignatureOptions};
use crate::EXT_MESH_GPU_INSTANCING;

/// One use of a mesh somewhere in the input, with its world transform.
#[derive(Debug, Clone)]
pub struct MeshInstance {
    pub model_id: u32,
    pub node_index: usize,
    pub mesh_index: usize,
    pub transform: Trs,
}

/// A set of mesh uses that share a signature (and, in tolerance mode,
/// similar bounding boxes). Emitted as a single instanced node.
#[derive(Debug, Clone)]
pub struct InstanceGroup {
    pub signature: u64,
    /// Representative source model and mesh for the group's geometry.
    pub model_id: u32,
    pub mesh_index: usize,
    pub mesh_name: Option<String>,
    pub instances: Vec<MeshInstance>,
    /// Per-primitive representative bounds; populated in tolerance mode only.
    pub primitive_bounds: Vec<Aabb>,
}

/// A mesh use that did not qualify for instancing.
#[derive(Debug, Clone)]
pub struct NonInstancedMesh {
    pub model_id: u32,
    pub mesh_index: usize,
    pub node_index: usize,
    pub transform: Trs,
}

#[derive(Debug, Default)]
pub struct Detection {
    /// Sorted by signature for reproducible output order.
    pub groups: Vec<InstanceGroup>,
    pub non_instanced: Vec<NonInstancedMesh>,
}

/// Local transform of a node: `T·R·S` when any TRS field is present, else
/// the explicit column-major matrix, else identity.
pub(crate) fn node_local_matrix(node: &json::Node) -> DMat4 {
    if node.translation.is_some() || node.rotation.is_some() || node.scale.is_some() {
        let translation = node
            .translation
            .map(|t| DVec3::new(f64::from(t[0]), f64::from(t[1]), f64::from(t[2])))
            .unwrap_or(DVec3::ZERO);
        let rotation = node
            .rotation
            .map(|q| {
                DQuat::from_xyzw(
                    f64::from(q.0[0]),
                    f64::from(q.0[1]),
                    f64::from(q.0[2]),
                    f64::from(q.0[3]),
                )
                .normalize()
            })
            .unwrap_or(DQuat::IDENTITY);
        let scale = node
            .scale
            .map(|s| DVec3::new(f64::from(s[0]), f64::from(s[1]), f64::from(s[2])))
            .unwrap_or(DVec3::ONE);
        DMat4::from_scale_rotation_translation(scale, rotation, translation)
    } else if let Some(matrix) = node.matrix {
        DMat4::from_cols_array(&matrix.map(f64::from))
    } else {
        DMat4::IDENTITY
    }
}

/// The node's `EXT_mesh_gpu_instancing` payload, if any, as generic JSON.
pub(crate) fn node_instancing(node: &json::Node) -> Option<&serde_json::Value> {
    node.extensions
        .as_ref()?
        .others
        .get(EXT_MESH_GPU_INSTANCING)
}

/// Look up a per-instance attribute accessor index inside an instancing
/// payload. Missing or non-integer entries read as "attribute absent".
pub(crate) fn instancing_attribute(payload: &serde_json::Value, name: &str) -> Option<usize> {
    payload
        .get("attributes")?
        .get(name)?
        .as_u64()
        .map(|index| index as usize)
}

#[derive(Default)]
struct TraverseState {
    groups: BTreeMap<u64, InstanceGroup>,
    non_instanced: Vec<NonInstancedMesh>,
    signatures: HashMap<(u32, usize), u64>,
}

enum Placement {
    New,
    Matched,
    Rejected,
}

pub struct Detector {
    options: SignatureOptions,
    instance_limit: usize,
}

impl Detector {
    pub fn new(options: SignatureOptions, instance_limit: usize) -> Self {
        let instance_limit = instance_limit.max(1);
        if options.tolerance_mode() {
            info!(
                tolerance = options.tolerance,
                normal_tolerance = options.normal_tolerance,
                "matching meshes with geometric tolerance"
            );
            if !options.skip_attribute_data.is_empty() {
                info!(
                    "skipping data hash for attributes: {}",
                    options
                        .skip_attribute_data
                        .iter()
                        .cloned()
                        .collect::<Vec<_>>()
                        .join(", ")
                );
            }
        } else {
            info!("matching meshes exactly");
        }
        info!(instance_limit, "minimum group size for instancing");
        Self {
            options,
            instance_limit,
        }
    }

    pub fn detect(&self, models: &[LoadedModel]) -> Detection {
        // Byte-identical inputs collapse onto the first model with that
        // digest, so groups see a single canonical source.
        let mut digest_to_rep: HashMap<&str, u32> = HashMap::new();
        let mut rep_of: HashMap<u32, u32> = HashMap::new();
        for model in models {
            match digest_to_rep.get(model.digest.as_str()) {
                Some(rep) => {
                    info!(
                        "{} is byte-identical to model {rep}; treating its meshes as instances",
                        model.path.display()
                    );
                    rep_of.insert(model.id, *rep);
                }
                None => {
                    digest_to_rep.insert(model.digest.as_str(), model.id);
                    rep_of.insert(model.id, model.id);
                }
            }
        }

        let mut state = TraverseState::default();
        for model in models {
            if model.document.scenes.is_empty() {
                warn!("{} has no scenes; skipping traversal", model.path.display());
                continue;
            }
            let scene_index = model.document.scene.map(|s| s.value()).unwrap_or(0);
            let Some(scene) = model.document.scenes.get(scene_index) else {
                error!(
                    "{} has an invalid default scene index {scene_index}",
                    model.path.display()
                );
                continue;
            };
            for root in &scene.nodes {
                self.traverse_node(model, root.value(), DMat4::IDENTITY, &mut state);
            }
        }

        let rep = |id: u32| rep_of.get(&id).copied().unwrap_or(id);
        let mut detection = Detection {
            groups: Vec::new(),
            non_instanced: state.non_instanced,
        };
        for (signature, mut group) in state.groups {
            if group.instances.len() >= self.instance_limit {
                group.model_id = rep(group.model_id);
                for instance in &mut group.instances {
                    instance.model_id = rep(instance.model_id);
                }
                detection.groups.push(group);
            } else {
                debug!(
                    signature,
                    count = group.instances.len(),
                    limit = self.instance_limit,
                    "group below instance limit; demoting to non-instanced"
                );
                for instance in group.instances {
                    detection.non_instanced.push(NonInstancedMesh {
                        model_id: rep(instance.model_id),
                        mesh_index: instance.mesh_index,
                        node_index: instance.node_index,
                        transform: instance.transform,
                    });
                }
            }
        }

        info!(
            groups = detection.groups.len(),
            non_instanced = detection.non_instanced.len(),
            "instancing detection complete"
        );
        detection
    }

    fn mesh_signature_cached(
        &self,
        model: &LoadedModel,
        mesh_index: usize,
        state: &mut TraverseState,
    ) -> u64 {
        *state
            .signatures
            .entry((model.id, mesh_index))
            .or_insert_with(|| signature::mesh_signature(model, mesh_index, &self.options))
    }

    fn group_entry<'s>(
        &self,
        state: &'s mut TraverseState,
        signature: u64,
        model: &LoadedModel,
        mesh_index: usize,
    ) -> &'s mut InstanceGroup {
        state.groups.entry(signature).or_insert_with(|| {
            let mesh = &model.document.meshes[mesh_index];
            let primitive_bounds = if self.options.tolerance_mode() {
                mesh.primitives
                    .iter()
                    .map(|primitive| signature::primitive_bounds(model, primitive))
                    .collect()
            } else {
                Vec::new()
            };
            InstanceGroup {
                signature,
                model_id: model.id,
                mesh_index,
                mesh_name: mesh.name.clone(),
                instances: Vec::new(),
                primitive_bounds,
            }
        })
    }

    fn traverse_node(
        &self,
        model: &LoadedModel,
        node_index: usize,
        parent_world: DMat4,
        state: &mut TraverseState,
    ) {
        let Some(node) = model.document.nodes.get(node_index) else {
            error!(
                "invalid node index {node_index} in {}",
                model.path.display()
            );
            return;
        };
        let world = parent_world * node_local_matrix(node);

        if let Some(mesh_index) = node.mesh.map(|mesh| mesh.value()) {
            if mesh_index < model.document.meshes.len() {
                match node_instancing(node) {
                    Some(payload) => self.expand_instanced_node(
                        model, node_index, mesh_index, world, payload, state,
                    ),
                    None => self.record_plain_node(model, node_index, mesh_index, world, state),
                }
            } else {
                error!(
                    "node {node_index} in {} references invalid mesh index {mesh_index}",
                    model.path.display()
                );
            }
        }

        if let Some(children) = &node.children {
            for child in children {
                self.traverse_node(model, child.value(), world, state);
            }
        }
    }

    /// Expand a node that already carries `EXT_mesh_gpu_instancing` into
    /// per-instance TRS entries of the mesh's group.
    fn expand_instanced_node(
        &self,
        model: &LoadedModel,
        node_index: usize,
        mesh_index: usize,
        node_world: DMat4,
        payload: &serde_json::Value,
        state: &mut TraverseState,
    ) {
        let translation = instancing_attribute(payload, "TRANSLATION");
        let rotation = instancing_attribute(payload, "ROTATION");
        let scale = instancing_attribute(payload, "SCALE");

        let count = [translation, rotation, scale]
            .iter()
            .flatten()
            .find_map(|index| {
                model
                    .document
                    .accessors
                    .get(*index)
                    .map(|accessor| accessor.count.0 as usize)
            });
        let Some(count) = count else {
            error!(
                "node {node_index} in {} has {EXT_MESH_GPU_INSTANCING} but no usable \
                 per-instance accessor",
                model.path.display()
            );
            return;
        };

        let signature = self.mesh_signature_cached(model, mesh_index, state);
        for element in 0..count {
            let translation = match translation {
                Some(index) => match crate::access::read_vec3_f32(model, index, element) {
                    Ok(value) => DVec3::new(
                        f64::from(value[0]),
                        f64::from(value[1]),
                        f64::from(value[2]),
                    ),
                    Err(err) => {
                        if element == 0 {
                            warn!("unreadable per-instance TRANSLATION on node {node_index}: {err}");
                        }
                        DVec3::ZERO
                    }
                },
                None => DVec3::ZERO,
            };
            let rotation = match rotation {
                Some(index) => match crate::access::read_vec4_f32(model, index, element) {
                    Ok(value) => DQuat::from_xyzw(
                        f64::from(value[0]),
                        f64::from(value[1]),
                        f64::from(value[2]),
                        f64::from(value[3]),
                    )
                    .normalize(),
                    Err(err) => {
                        if element == 0 {
                            warn!("unreadable per-instance ROTATION on node {node_index}: {err}");
                        }
                        DQuat::IDENTITY
                    }
                },
                None => DQuat::IDENTITY,
            };
            let scale = match scale {
                Some(index) => match crate::access::read_vec3_f32(model, index, element) {
                    Ok(value) => DVec3::new(
                        f64::from(value[0]),
                        f64::from(value[1]),
                        f64::from(value[2]),
                    ),
                    Err(err) => {
                        if element == 0 {
                            warn!("unreadable per-instance SCALE on node {node_index}: {err}");
                        }
                        DVec3::ONE
                    }
                },
                None => DVec3::ONE,
            };

            let local = DMat4::from_scale_rotation_translation(scale, rotation, translation);
            let world = node_world * local;
            let Some(transform) = Trs::from_matrix(&world) else {
                error!(
                    "instance {element} of node {node_index} in {} has a degenerate transform; \
                     dropping it",
                    model.path.display()
                );
                continue;
            };
            self.group_entry(state, signature, model, mesh_index)
                .instances
                .push(MeshInstance {
                    model_id: model.id,
                    node_index,
                    mesh_index,
                    transform,
                });
        }
    }

    fn record_plain_node(
        &self,
        model: &LoadedModel,
        node_index: usize,
        mesh_index: usize,
        world: DMat4,
        state: &mut TraverseState,
    ) {
        let signature = self.mesh_signature_cached(model, mesh_index, state);
        let Some(transform) = Trs::from_matrix(&world) else {
            error!(
                "node {node_index} in {} has a degenerate world transform; dropping it",
                model.path.display()
            );
            return;
        };
        let instance = MeshInstance {
            model_id: model.id,
            node_index,
            mesh_index,
            transform,
        };

        if !self.options.tolerance_mode() {
            self.group_entry(state, signature, model, mesh_index)
                .instances
                .push(instance);
            return;
        }

        // Tolerance mode: a signature match is only a candidate; bounding
        // boxes decide. A mismatch keeps the existing representative and
        // records this node as non-instanced.
        let mesh = &model.document.meshes[mesh_index];
        let placement = match state.groups.get(&signature) {
            None => Placement::New,
            Some(group) => {
                let similar = group.primitive_bounds.len() == mesh.primitives.len()
                    && mesh
                        .primitives
                        .iter()
                        .zip(&group.primitive_bounds)
                        .all(|(primitive, representative)| {
                            signature::primitive_bounds(model, primitive)
                                .similar_to(representative, self.options.tolerance)
                        });
                if similar {
                    Placement::Matched
                } else {
                    Placement::Rejected
                }
            }
        };
        match placement {
            Placement::New | Placement::Matched => {
                self.group_entry(state, signature, model, mesh_index)
                    .instances
                    .push(instance);
            }
            Placement::Rejected => {
                debug!(
                    signature,
                    node_index, "bounding boxes diverge from group representative"
                );
                state.non_instanced.push(NonInstancedMesh {
                    model_id: instance.model_id,
                    mesh_index,
                    node_index,
                    transform: instance.transform,
                });
            }
        }
    }
}
