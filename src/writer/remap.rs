//! Resource remapping into a fresh output document.
//!
//! `OutputBuilder` owns the glTF document and consolidated binary buffer of
//! one output emission. Copies descend mesh → primitive → (material, indices,
//! attributes, morph targets) → buffer bytes, caching every copied resource
//! under `(source model id, source index)` so shared resources are written
//! once. Accessor data is always repacked through the stride-aware walk, so
//! interleaved inputs come out de-interleaved.

use std::collections::HashMap;

use gltf_json as json;
use json::validation::{Checked, USize64};
use thiserror::Error;
use tracing::warn;

use crate::access::{self, AccessError};
use crate::loader::LoadedModel;

#[derive(Debug, Error)]
pub enum WriteError {
    #[error("buffer {buffer} is external or has no embedded data")]
    ExternalBuffer { buffer: usize },
    #[error(
        "buffer view {view} (offset {offset}, length {length}) extends beyond a buffer of {available} bytes"
    )]
    ViewOutOfBounds {
        view: usize,
        offset: usize,
        length: usize,
        available: usize,
    },
    #[error("invalid {kind} index {index}")]
    InvalidReference { kind: &'static str, index: usize },
    #[error(transparent)]
    Access(#[from] AccessError),
    #[error("source model {0} is not loaded")]
    MissingModel(u32),
    #[error("glTF serialization error: {0}")]
    Serialize(String),
    #[error("I/O error: {0}")]
    Io(String),
}

/// Errors that abort the whole output variant rather than just the mesh
/// being copied: unresolvable or out-of-bounds source data.
pub(crate) fn is_fatal(error: &WriteError) -> bool {
    matches!(
        error,
        WriteError::ExternalBuffer { .. }
            | WriteError::ViewOutOfBounds { .. }
            | WriteError::Access(AccessError::ExternalBuffer { .. })
            | WriteError::Access(AccessError::OutOfBounds { .. })
    )
}

/// How a copied accessor will be consumed, which fixes the stride and
/// target of its packed output view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AccessorUsage {
    /// Vertex attribute: stride = element length, `ARRAY_BUFFER`.
    Attribute,
    /// Index stream: no stride, `ELEMENT_ARRAY_BUFFER`.
    Index,
    /// Per-instance TRS stream: no stride, no target.
    Instance,
}

#[derive(Default)]
struct RemapTable {
    buffer_views: HashMap<(u32, usize), json::Index<json::buffer::View>>,
    accessors: HashMap<(u32, usize), json::Index<json::Accessor>>,
    materials: HashMap<(u32, usize), json::Index<json::Material>>,
    textures: HashMap<(u32, usize), json::Index<json::Texture>>,
    samplers: HashMap<(u32, usize), json::Index<json::texture::Sampler>>,
    images: HashMap<(u32, usize), json::Index<json::Image>>,
    meshes: HashMap<(u32, usize), json::Index<json::Mesh>>,
}

/// Builder for one output document plus its consolidated binary buffer.
pub(crate) struct OutputBuilder {
    pub root: json::Root,
    pub bin: Vec<u8>,
    remap: RemapTable,
}

impl OutputBuilder {
    pub fn new() -> Self {
        let mut root = json::Root::default();
        root.asset = json::Asset {
            version: "2.0".to_string(),
            generator: Some("glbinstance".to_string()),
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
            remap: RemapTable::default(),
        }
    }

    pub fn note_extension_used(&mut self, name: &str) {
        if !self.root.extensions_used.iter().any(|used| used == name) {
            self.root.extensions_used.push(name.to_string());
        }
    }

    pub fn note_extension_required(&mut self, name: &str) {
        if !self.root.extensions_required.iter().any(|req| req == name) {
            self.root.extensions_required.push(name.to_string());
        }
    }

    /// Append a payload to the consolidated buffer, 4-byte aligned, and
    /// create a buffer view for it. Offsets are strictly non-decreasing in
    /// call order.
    pub fn add_data(
        &mut self,
        data: &[u8],
        byte_stride: Option<usize>,
        target: Option<json::buffer::Target>,
    ) -> json::Index<json::buffer::View> {
        while self.bin.len() % 4 != 0 {
            self.bin.push(0);
        }
        let byte_offset = self.bin.len();
        self.bin.extend_from_slice(data);
        self.root.push(json::buffer::View {
            buffer: json::Index::new(0),
            byte_length: USize64::from(data.len()),
            byte_offset: Some(USize64::from(byte_offset)),
            byte_stride: byte_stride.map(json::buffer::Stride),
            target: target.map(Checked::Valid),
            name: None,
            extensions: Default::default(),
            extras: Default::default(),
        })
    }

    /// Copy a raw buffer-view byte range. Used for image data; accessor data
    /// goes through [`Self::copy_accessor`] instead so it can de-interleave.
    fn copy_buffer_view(
        &mut self,
        model: &LoadedModel,
        view_index: usize,
    ) -> Result<json::Index<json::buffer::View>, WriteError> {
        if let Some(mapped) = self.remap.buffer_views.get(&(model.id, view_index)) {
            return Ok(*mapped);
        }
        let view = model.document.buffer_views.get(view_index).ok_or(
            WriteError::InvalidReference {
                kind: "buffer view",
                index: view_index,
            },
        )?;
        let buffer = view.buffer.value();
        let bytes = model
            .buffer_bytes(buffer)
            .ok_or(WriteError::ExternalBuffer { buffer })?;
        let offset = view.byte_offset.unwrap_or_default().0 as usize;
        let length = view.byte_length.0 as usize;
        if offset + length > bytes.len() {
            return Err(WriteError::ViewOutOfBounds {
                view: view_index,
                offset,
                length,
                available: bytes.len(),
            });
        }

        let target = match view.target {
            Some(Checked::Valid(target)) => Some(target),
            _ => None,
        };
        // Index views never keep a stride.
        let stride = match target {
            Some(json::buffer::Target::ElementArrayBuffer) => None,
            _ => view.byte_stride.map(|stride| stride.0),
        };
        let mapped = self.add_data(&bytes[offset..offset + length], stride, target);
        self.remap.buffer_views.insert((model.id, view_index), mapped);
        Ok(mapped)
    }

    /// Copy an accessor, repacking its data into a fresh packed view.
    pub fn copy_accessor(
        &mut self,
        model: &LoadedModel,
        accessor_index: usize,
        usage: AccessorUsage,
    ) -> Result<json::Index<json::Accessor>, WriteError> {
        if let Some(mapped) = self.remap.accessors.get(&(model.id, accessor_index)) {
            return Ok(*mapped);
        }
        let source = model.document.accessors.get(accessor_index).ok_or(
            WriteError::InvalidReference {
                kind: "accessor",
                index: accessor_index,
            },
        )?;
        let mut accessor = source.clone();
        if accessor.sparse.take().is_some() {
            warn!(
                "accessor {accessor_index} of {} uses sparse storage, which is not preserved",
                model.path.display()
            );
        }

        if accessor.buffer_view.is_some() {
            let packed = access::packed_bytes(model, accessor_index)?
                .unwrap_or(std::borrow::Cow::Owned(Vec::new()));
            let element_len =
                access::element_byte_length(source).ok_or(AccessError::InvalidLayout {
                    accessor: accessor_index,
                })?;
            let (stride, target) = match usage {
                AccessorUsage::Attribute => (
                    Some(element_len),
                    Some(json::buffer::Target::ArrayBuffer),
                ),
                AccessorUsage::Index => (None, Some(json::buffer::Target::ElementArrayBuffer)),
                AccessorUsage::Instance => (None, None),
            };
            let view = self.add_data(&packed, stride, target);
            accessor.buffer_view = Some(view);
            accessor.byte_offset = Some(USize64(0));
        }

        let mapped = self.root.push(accessor);
        self.remap.accessors.insert((model.id, accessor_index), mapped);
        Ok(mapped)
    }

    fn copy_sampler(
        &mut self,
        model: &LoadedModel,
        sampler_index: usize,
    ) -> Result<json::Index<json::texture::Sampler>, WriteError> {
        if let Some(mapped) = self.remap.samplers.get(&(model.id, sampler_index)) {
            return Ok(*mapped);
        }
        let sampler = model.document.samplers.get(sampler_index).ok_or(
            WriteError::InvalidReference {
                kind: "sampler",
                index: sampler_index,
            },
        )?;
        let mapped = self.root.push(sampler.clone());
        self.remap.samplers.insert((model.id, sampler_index), mapped);
        Ok(mapped)
    }

    fn copy_image(
        &mut self,
        model: &LoadedModel,
        image_index: usize,
    ) -> Result<json::Index<json::Image>, WriteError> {
        if let Some(mapped) = self.remap.images.get(&(model.id, image_index)) {
            return Ok(*mapped);
        }
        let source = model.document.images.get(image_index).ok_or(
            WriteError::InvalidReference {
                kind: "image",
                index: image_index,
            },
        )?;
        let mut image = source.clone();
        if let Some(view) = image.buffer_view {
            image.buffer_view = Some(self.copy_buffer_view(model, view.value())?);
        } else if let Some(uri) = &image.uri {
            warn!(
                "image {image_index} of {} references external URI {uri}; keeping the URI as-is",
                model.path.display()
            );
        }
        let mapped = self.root.push(image);
        self.remap.images.insert((model.id, image_index), mapped);
        Ok(mapped)
    }

    fn copy_texture(
        &mut self,
        model: &LoadedModel,
        texture_index: usize,
    ) -> Result<json::Index<json::Texture>, WriteError> {
        if let Some(mapped) = self.remap.textures.get(&(model.id, texture_index)) {
            return Ok(*mapped);
        }
        let source = model.document.textures.get(texture_index).ok_or(
            WriteError::InvalidReference {
                kind: "texture",
                index: texture_index,
            },
        )?;
        let mut texture = source.clone();
        if let Some(sampler) = texture.sampler {
            texture.sampler = Some(self.copy_sampler(model, sampler.value())?);
        }
        texture.source = self.copy_image(model, source.source.value())?;
        let mapped = self.root.push(texture);
        self.remap.textures.insert((model.id, texture_index), mapped);
        Ok(mapped)
    }

    fn copy_material(
        &mut self,
        model: &LoadedModel,
        material_index: usize,
    ) -> Result<json::Index<json::Material>, WriteError> {
        if let Some(mapped) = self.remap.materials.get(&(model.id, material_index)) {
            return Ok(*mapped);
        }
        let source = model.document.materials.get(material_index).ok_or(
            WriteError::InvalidReference {
                kind: "material",
                index: material_index,
            },
        )?;
        let mut material = source.clone();

        // Any extension on a copied material must be declared on the output.
        if let Some(extensions) = &material.extensions {
            for name in extensions.others.keys() {
                self.note_extension_used(name);
            }
        }

        if let Some(info) = material.pbr_metallic_roughness.base_color_texture.as_mut() {
            info.index = self.copy_texture(model, info.index.value())?;
        }
        if let Some(info) = material
            .pbr_metallic_roughness
            .metallic_roughness_texture
            .as_mut()
        {
            info.index = self.copy_texture(model, info.index.value())?;
        }
        if let Some(info) = material.normal_texture.as_mut() {
            info.index = self.copy_texture(model, info.index.value())?;
        }
        if let Some(info) = material.occlusion_texture.as_mut() {
            info.index = self.copy_texture(model, info.index.value())?;
        }
        if let Some(info) = material.emissive_texture.as_mut() {
            info.index = self.copy_texture(model, info.index.value())?;
        }

        let mapped = self.root.push(material);
        self.remap.materials.insert((model.id, material_index), mapped);
        Ok(mapped)
    }

    /// Copy a mesh definition (primitives, materials, accessors, morph
    /// targets) from a source model. Repeated copies of the same mesh
    /// return the cached output index.
    pub fn copy_mesh(
        &mut self,
        model: &LoadedModel,
        mesh_index: usize,
    ) -> Result<json::Index<json::Mesh>, WriteError> {
        if let Some(mapped) = self.remap.meshes.get(&(model.id, mesh_index)) {
            return Ok(*mapped);
        }
        let source = model.document.meshes.get(mesh_index).ok_or(
            WriteError::InvalidReference {
                kind: "mesh",
                index: mesh_index,
            },
        )?;

        let mut primitives = Vec::with_capacity(source.primitives.len());
        for primitive in &source.primitives {
            let material = match primitive.material {
                Some(material) => Some(self.copy_material(model, material.value())?),
                None => None,
            };
            let indices = match primitive.indices {
                Some(indices) => {
                    Some(self.copy_accessor(model, indices.value(), AccessorUsage::Index)?)
                }
                None => None,
            };

            let mut attributes = std::collections::BTreeMap::new();
            for (semantic, accessor) in &primitive.attributes {
                let copied =
                    self.copy_accessor(model, accessor.value(), AccessorUsage::Attribute)?;
                attributes.insert(semantic.clone(), copied);
            }

            let targets = match &primitive.targets {
                Some(source_targets) => {
                    let mut targets = Vec::with_capacity(source_targets.len());
                    for target in source_targets {
                        let positions = match target.positions {
                            Some(index) => Some(self.copy_accessor(
                                model,
                                index.value(),
                                AccessorUsage::Attribute,
                            )?),
                            None => None,
                        };
                        let normals = match target.normals {
                            Some(index) => Some(self.copy_accessor(
                                model,
                                index.value(),
                                AccessorUsage::Attribute,
                            )?),
                            None => None,
                        };
                        let tangents = match target.tangents {
                            Some(index) => Some(self.copy_accessor(
                                model,
                                index.value(),
                                AccessorUsage::Attribute,
                            )?),
                            None => None,
                        };
                        targets.push(json::mesh::MorphTarget {
                            positions,
                            normals,
                            tangents,
                        });
                    }
                    Some(targets)
                }
                None => None,
            };

            primitives.push(json::mesh::Primitive {
                attributes,
                indices,
                material,
                mode: primitive.mode,
                targets,
                extensions: Default::default(),
                extras: Default::default(),
            });
        }

        let mapped = self.root.push(json::Mesh {
            name: source.name.clone(),
            primitives,
            weights: source.weights.clone(),
            extensions: Default::default(),
            extras: Default::default(),
        });
        self.remap.meshes.insert((model.id, mesh_index), mapped);
        Ok(mapped)
    }
}
