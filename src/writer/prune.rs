//! Removal of accessors and buffer views that an abandoned mesh copy left
//! unreferenced, with full index rewriting. The consolidated buffer's bytes
//! are left alone; only the JSON graph is compacted.

use gltf_json as json;

use crate::EXT_MESH_GPU_INSTANCING;

fn mark(used: &mut [bool], index: usize) {
    if let Some(slot) = used.get_mut(index) {
        *slot = true;
    }
}

fn remap_of(used: &[bool]) -> Vec<Option<u32>> {
    let mut next = 0u32;
    used.iter()
        .map(|used| {
            used.then(|| {
                let index = next;
                next += 1;
                index
            })
        })
        .collect()
}

pub(crate) fn prune_unused(root: &mut json::Root) {
    let mut used_accessors = vec![false; root.accessors.len()];

    for mesh in &root.meshes {
        for primitive in &mesh.primitives {
            for accessor in primitive.attributes.values() {
                mark(&mut used_accessors, accessor.value());
            }
            if let Some(indices) = primitive.indices {
                mark(&mut used_accessors, indices.value());
            }
            for target in primitive.targets.iter().flatten() {
                for accessor in [target.positions, target.normals, target.tangents]
                    .into_iter()
                    .flatten()
                {
                    mark(&mut used_accessors, accessor.value());
                }
            }
        }
    }
    for node in &root.nodes {
        let Some(extensions) = &node.extensions else {
            continue;
        };
        let Some(attributes) = extensions
            .others
            .get(EXT_MESH_GPU_INSTANCING)
            .and_then(|payload| payload.get("attributes"))
            .and_then(|attributes| attributes.as_object())
        else {
            continue;
        };
        for value in attributes.values() {
            if let Some(index) = value.as_u64() {
                mark(&mut used_accessors, index as usize);
            }
        }
    }

    let mut used_views = vec![false; root.buffer_views.len()];
    for (accessor, used) in root.accessors.iter().zip(&used_accessors) {
        if *used {
            if let Some(view) = accessor.buffer_view {
                mark(&mut used_views, view.value());
            }
        }
    }
    for image in &root.images {
        if let Some(view) = image.buffer_view {
            mark(&mut used_views, view.value());
        }
    }

    if used_accessors.iter().all(|used| *used) && used_views.iter().all(|used| *used) {
        return;
    }

    let accessor_remap = remap_of(&used_accessors);
    let view_remap = remap_of(&used_views);

    let mut keep_accessor = used_accessors.iter();
    root.accessors.retain(|_| *keep_accessor.next().unwrap_or(&false));
    let mut keep_view = used_views.iter();
    root.buffer_views.retain(|_| *keep_view.next().unwrap_or(&false));

    let map_accessor = |index: json::Index<json::Accessor>| {
        accessor_remap
            .get(index.value())
            .copied()
            .flatten()
            .map(json::Index::new)
    };
    let map_view = |index: json::Index<json::buffer::View>| {
        view_remap
            .get(index.value())
            .copied()
            .flatten()
            .map(json::Index::new)
    };

    for accessor in &mut root.accessors {
        accessor.buffer_view = accessor.buffer_view.and_then(map_view);
    }
    for image in &mut root.images {
        image.buffer_view = image.buffer_view.and_then(map_view);
    }
    for mesh in &mut root.meshes {
        for primitive in &mut mesh.primitives {
            primitive.attributes = primitive
                .attributes
                .iter()
                .filter_map(|(semantic, accessor)| {
                    map_accessor(*accessor).map(|mapped| (semantic.clone(), mapped))
                })
                .collect();
            primitive.indices = primitive.indices.and_then(map_accessor);
            if let Some(targets) = &mut primitive.targets {
                for target in targets {
                    target.positions = target.positions.and_then(map_accessor);
                    target.normals = target.normals.and_then(map_accessor);
                    target.tangents = target.tangents.and_then(map_accessor);
                }
            }
        }
    }
    for node in &mut root.nodes {
        let Some(extensions) = node.extensions.as_mut() else {
            continue;
        };
        let Some(attributes) = extensions
            .others
            .get_mut(EXT_MESH_GPU_INSTANCING)
            .and_then(|payload| payload.get_mut("attributes"))
            .and_then(|attributes| attributes.as_object_mut())
        else {
            continue;
        };
        for value in attributes.values_mut() {
            if let Some(old) = value.as_u64() {
                if let Some(new) = accessor_remap.get(old as usize).copied().flatten() {
                    *value = serde_json::json!(new);
                }
            }
        }
    }

}
