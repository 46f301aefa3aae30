//! Collapse repeated geometry across GLB scenes into GPU-instanced draws.
//!
//! The pipeline discovers GLB inputs (directory walk plus tileset manifest
//! expansion), fingerprints every mesh primitive, groups nodes whose
//! fingerprints agree into instance sets, and re-emits the scene as two GLB
//! files: one with instanced meshes (geometry plus per-instance transforms
//! via `EXT_mesh_gpu_instancing`) and one with the residual plain meshes.

/// Stride-aware accessor byte access
pub mod access;
/// Instancing statistics and CSV reporting
pub mod analysis;
/// Run configuration and config-file loading
pub mod config;
/// Scene traversal and instance grouping
pub mod detector;
/// Input discovery and GLB parsing
pub mod loader;
/// Transform and bounding-box math
pub mod math;
/// Run orchestration
pub mod pipeline;
/// Primitive/mesh content signatures
pub mod signature;
/// Hand-off contract for the external tileset emitter
pub mod tileset;
/// Output assembly and resource remapping
pub mod writer;

#[cfg(test)]
pub(crate) mod testutil;

/// Node-level glTF extension carrying per-instance TRANSLATION / ROTATION /
/// SCALE accessors next to a single mesh reference.
pub const EXT_MESH_GPU_INSTANCING: &str = "EXT_mesh_gpu_instancing";
