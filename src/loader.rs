//! Input discovery and model loading.
//!
//! Discovery walks the input directory for `.glb` files and expands any
//! `tileset.json` manifests it finds along the way. Each surviving path is
//! parsed into an in-memory glTF document plus its binary chunk, and gets a
//! run-scoped id and a SHA-256 digest of the raw bytes so that byte-identical
//! inputs can later collapse onto one representative.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use gltf_json as json;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("not a GLB container: {0}")]
    Glb(String),
    #[error("malformed glTF JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// A parsed input model, read-only for the rest of the run.
pub struct LoadedModel {
    /// Run-scoped id, assigned in discovery order.
    pub id: u32,
    pub path: PathBuf,
    /// Hex SHA-256 of the raw file bytes.
    pub digest: String,
    pub document: json::Root,
    /// The GLB BIN chunk. Empty for `.gltf` inputs.
    pub blob: Vec<u8>,
}

impl LoadedModel {
    /// Raw bytes backing a glTF buffer. Only the embedded BIN chunk
    /// (buffer 0 without a URI) is resolvable; everything else counts as
    /// external.
    pub fn buffer_bytes(&self, buffer: usize) -> Option<&[u8]> {
        let def = self.document.buffers.get(buffer)?;
        if buffer == 0 && def.uri.is_none() {
            Some(&self.blob)
        } else {
            None
        }
    }
}

fn canonical(path: &Path) -> PathBuf {
    fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

/// Recursively collect `uri`/`url` string values that end in `.glb` or
/// `.gltf`, resolved against `base`.
fn collect_content_uris(value: &serde_json::Value, base: &Path, out: &mut BTreeSet<PathBuf>) {
    match value {
        serde_json::Value::Object(map) => {
            for (key, entry) in map {
                if let ("uri" | "url", Some(uri)) = (key.as_str(), entry.as_str()) {
                    let lower = uri.to_ascii_lowercase();
                    if lower.ends_with(".glb") || lower.ends_with(".gltf") {
                        out.insert(base.join(uri));
                    }
                } else {
                    collect_content_uris(entry, base, out);
                }
            }
        }
        serde_json::Value::Array(items) => {
            for item in items {
                collect_content_uris(item, base, out);
            }
        }
        _ => {}
    }
}

/// Extract GLB/glTF paths referenced by a tileset manifest.
fn tileset_content_paths(manifest: &Path) -> Vec<PathBuf> {
    let bytes = match fs::read(manifest) {
        Ok(bytes) => bytes,
        Err(err) => {
            error!("could not read tileset manifest {}: {err}", manifest.display());
            return Vec::new();
        }
    };
    let value: serde_json::Value = match serde_json::from_slice(&bytes) {
        Ok(value) => value,
        Err(err) => {
            error!("malformed tileset manifest {}: {err}", manifest.display());
            return Vec::new();
        }
    };
    let base = manifest.parent().unwrap_or_else(|| Path::new("."));
    let mut uris = BTreeSet::new();
    collect_content_uris(&value, base, &mut uris);
    if !uris.is_empty() {
        debug!(
            "tileset {} references {} model file(s)",
            manifest.display(),
            uris.len()
        );
    }
    uris.into_iter().collect()
}

/// Recursively discover model files under `input_dir`.
///
/// Paths are deduplicated by canonical form and returned sorted, which fixes
/// the id assignment order for the whole run.
pub fn discover_model_paths(input_dir: &Path) -> Vec<PathBuf> {
    let mut found = BTreeSet::new();
    for entry in WalkDir::new(input_dir).follow_links(false) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                warn!("skipping unreadable directory entry: {err}");
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        let ext = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.to_ascii_lowercase());
        match ext.as_deref() {
            Some("glb") => {
                found.insert(canonical(path));
            }
            Some("json") => {
                let name = path.file_name().and_then(|name| name.to_str()).unwrap_or("");
                if name.ends_with("tileset.json") {
                    for referenced in tileset_content_paths(path) {
                        if referenced.exists() {
                            found.insert(canonical(&referenced));
                        } else {
                            warn!(
                                "model referenced by {} does not exist: {}",
                                path.display(),
                                referenced.display()
                            );
                        }
                    }
                }
            }
            _ => {}
        }
    }
    info!("discovered {} unique model file(s)", found.len());
    found.into_iter().collect()
}

/// Parse one model file.
pub fn read_model(path: &Path, id: u32) -> Result<LoadedModel, LoadError> {
    debug!("reading {}", path.display());
    let bytes = fs::read(path)?;

    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let digest = hex::encode(hasher.finalize());

    let (document, blob) = if bytes.starts_with(b"glTF") {
        let glb =
            gltf::binary::Glb::from_slice(&bytes).map_err(|err| LoadError::Glb(err.to_string()))?;
        let document = json::deserialize::from_slice(&glb.json)?;
        let blob = glb.bin.map(|bin| bin.into_owned()).unwrap_or_default();
        (document, blob)
    } else {
        // Plain JSON glTF. Its buffers stay external and unresolvable.
        (json::deserialize::from_slice(&bytes)?, Vec::new())
    };

    Ok(LoadedModel {
        id,
        path: path.to_path_buf(),
        digest,
        document,
        blob,
    })
}

/// Load every discovered path, skipping (and logging) unreadable or
/// malformed files. Ids follow the order of `paths`.
pub fn load_models(paths: &[PathBuf]) -> Vec<LoadedModel> {
    let mut models: Vec<LoadedModel> = Vec::with_capacity(paths.len());
    for path in paths {
        let id = models.len() as u32;
        match read_model(path, id) {
            Ok(model) => {
                info!("loaded {} (digest {})", path.display(), &model.digest[..12]);
                models.push(model);
            }
            Err(err) => error!("failed to load {}: {err}", path.display()),
        }
    }
    models
}
