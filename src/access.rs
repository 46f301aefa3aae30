//! Stride-aware accessor data access.
//!
//! Everything that touches accessor bytes (fingerprinting, per-instance
//! transform expansion, data repacking) goes through this module. Accessor
//! data is never exposed as one flat byte view: interleaved buffer views make
//! that wrong, so reads always walk `count` elements at the source stride and
//! take `element_byte_length` bytes per element.

use std::borrow::Cow;

use gltf_json as json;
use json::validation::Checked;
use thiserror::Error;

use crate::loader::LoadedModel;

#[derive(Debug, Error)]
pub enum AccessError {
    #[error("accessor index {0} out of range")]
    InvalidAccessor(usize),
    #[error("buffer view index {0} out of range")]
    InvalidBufferView(usize),
    #[error("accessor {accessor} has an invalid type or component type")]
    InvalidLayout { accessor: usize },
    #[error("buffer {buffer} is external or has no embedded data")]
    ExternalBuffer { buffer: usize },
    #[error(
        "accessor {accessor} data ({start}..{end}) is out of bounds for a buffer of {len} bytes"
    )]
    OutOfBounds {
        accessor: usize,
        start: usize,
        end: usize,
        len: usize,
    },
    #[error("accessor {accessor} is not {expected}")]
    UnexpectedLayout {
        accessor: usize,
        expected: &'static str,
    },
}

/// Byte length of one element: component size times component count.
pub fn element_byte_length(accessor: &json::Accessor) -> Option<usize> {
    let component = match accessor.component_type {
        Checked::Valid(component_type) => component_type.0.size(),
        Checked::Invalid => return None,
    };
    let multiplicity = match accessor.type_ {
        Checked::Valid(type_) => type_.multiplicity(),
        Checked::Invalid => return None,
    };
    Some(component * multiplicity)
}

/// An accessor resolved against its buffer view and the model's embedded
/// binary chunk, with the full walk bounds-checked up front.
pub(crate) struct ResolvedAccessor<'a> {
    pub element_len: usize,
    pub stride: usize,
    pub count: usize,
    bytes: &'a [u8],
    start: usize,
}

impl<'a> ResolvedAccessor<'a> {
    pub fn element(&self, index: usize) -> &'a [u8] {
        let at = self.start + index * self.stride;
        &self.bytes[at..at + self.element_len]
    }
}

/// Resolve an accessor's data region. `Ok(None)` means the accessor has no
/// buffer view (metadata-only, e.g. a zero-filled or compressed accessor).
pub(crate) fn resolve<'a>(
    model: &'a LoadedModel,
    accessor_index: usize,
) -> Result<Option<ResolvedAccessor<'a>>, AccessError> {
    let accessor = model
        .document
        .accessors
        .get(accessor_index)
        .ok_or(AccessError::InvalidAccessor(accessor_index))?;
    let Some(view_index) = accessor.buffer_view else {
        return Ok(None);
    };
    let view = model
        .document
        .buffer_views
        .get(view_index.value())
        .ok_or(AccessError::InvalidBufferView(view_index.value()))?;

    let element_len = element_byte_length(accessor).filter(|len| *len > 0).ok_or(
        AccessError::InvalidLayout {
            accessor: accessor_index,
        },
    )?;
    let stride = view.byte_stride.map(|stride| stride.0).unwrap_or(element_len);
    let count = accessor.count.0 as usize;

    let buffer = view.buffer.value();
    let bytes = model
        .buffer_bytes(buffer)
        .ok_or(AccessError::ExternalBuffer { buffer })?;

    let start = view.byte_offset.unwrap_or_default().0 as usize
        + accessor.byte_offset.unwrap_or_default().0 as usize;
    let end = if count == 0 {
        start
    } else {
        start + (count - 1) * stride + element_len
    };
    if end > bytes.len() {
        return Err(AccessError::OutOfBounds {
            accessor: accessor_index,
            start,
            end,
            len: bytes.len(),
        });
    }

    Ok(Some(ResolvedAccessor {
        element_len,
        stride,
        count,
        bytes,
        start,
    }))
}

/// The accessor's data as a contiguous packed byte run.
///
/// Contiguous sources are borrowed; interleaved sources are de-interleaved
/// element by element into a fresh buffer. `Ok(None)` mirrors [`resolve`].
pub fn packed_bytes<'a>(
    model: &'a LoadedModel,
    accessor_index: usize,
) -> Result<Option<Cow<'a, [u8]>>, AccessError> {
    let Some(resolved) = resolve(model, accessor_index)? else {
        return Ok(None);
    };
    if resolved.count == 0 {
        return Ok(Some(Cow::Owned(Vec::new())));
    }
    if resolved.stride == resolved.element_len {
        let start = resolved.start;
        let end = start + resolved.count * resolved.element_len;
        return Ok(Some(Cow::Borrowed(&resolved.bytes[start..end])));
    }
    let mut packed = Vec::with_capacity(resolved.count * resolved.element_len);
    for element in 0..resolved.count {
        packed.extend_from_slice(resolved.element(element));
    }
    Ok(Some(Cow::Owned(packed)))
}

fn read_f32s<const N: usize>(
    model: &LoadedModel,
    accessor_index: usize,
    element: usize,
) -> Result<[f32; N], AccessError> {
    let accessor = model
        .document
        .accessors
        .get(accessor_index)
        .ok_or(AccessError::InvalidAccessor(accessor_index))?;
    let float = matches!(
        accessor.component_type,
        Checked::Valid(json::accessor::GenericComponentType(
            json::accessor::ComponentType::F32
        ))
    );
    let multiplicity = match accessor.type_ {
        Checked::Valid(type_) => type_.multiplicity(),
        Checked::Invalid => 0,
    };
    if !float || multiplicity != N {
        return Err(AccessError::UnexpectedLayout {
            accessor: accessor_index,
            expected: "float with the expected component count",
        });
    }
    let resolved = resolve(model, accessor_index)?.ok_or(AccessError::UnexpectedLayout {
        accessor: accessor_index,
        expected: "backed by a buffer view",
    })?;
    if element >= resolved.count {
        return Err(AccessError::OutOfBounds {
            accessor: accessor_index,
            start: element,
            end: element + 1,
            len: resolved.count,
        });
    }
    let bytes = resolved.element(element);
    let mut out = [0.0f32; N];
    for (component, value) in out.iter_mut().enumerate() {
        let at = component * 4;
        *value = f32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]]);
    }
    Ok(out)
}

pub fn read_vec3_f32(
    model: &LoadedModel,
    accessor_index: usize,
    element: usize,
) -> Result<[f32; 3], AccessError> {
    read_f32s::<3>(model, accessor_index, element)
}

pub fn read_vec4_f32(
    model: &LoadedModel,
    accessor_index: usize,
    element: usize,
) -> Result<[f32; 4], AccessError> {
    read_f32s::<4>(model, accessor_index, element)
}
