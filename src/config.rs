//! Run configuration: the tuning knobs of the pipeline plus a `key = value`
//! configuration-file loader. Command-line flags are applied on top by the
//! binary, so CLI values win over file values.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::signature::SignatureOptions;

pub const DEFAULT_INSTANCE_LIMIT: usize = 2;

#[derive(Debug, Clone)]
pub struct Config {
    /// Directory scanned for input models.
    pub input_directory: PathBuf,
    /// Output directory; `<input>/processed_output` when unset.
    pub output_directory: Option<PathBuf>,
    /// POSITION tolerance; 0 selects exact matching.
    pub tolerance: f64,
    /// NORMAL quantization step in tolerance mode.
    pub normal_tolerance: f64,
    /// Attributes exempt from data hashing in tolerance mode.
    pub skip_attribute_data_hash: BTreeSet<String>,
    /// Minimum group size that still becomes an instanced group.
    pub instance_limit: usize,
    /// Merge all GLB outputs into a single file per variant. The output
    /// document shape is identical either way.
    pub merge_all_glb: bool,
    /// Write each mesh of the stage-1 outputs to its own GLB.
    pub mesh_segmentation: bool,
}

impl Config {
    pub fn new(input_directory: impl Into<PathBuf>) -> Self {
        Self {
            input_directory: input_directory.into(),
            output_directory: None,
            tolerance: 0.0,
            normal_tolerance: 0.0,
            skip_attribute_data_hash: BTreeSet::new(),
            instance_limit: DEFAULT_INSTANCE_LIMIT,
            merge_all_glb: false,
            mesh_segmentation: false,
        }
    }

    pub fn output_directory(&self) -> PathBuf {
        self.output_directory
            .clone()
            .unwrap_or_else(|| self.input_directory.join("processed_output"))
    }

    pub fn signature_options(&self) -> SignatureOptions {
        SignatureOptions {
            tolerance: self.tolerance.max(0.0),
            normal_tolerance: self.normal_tolerance.max(0.0),
            skip_attribute_data: self.skip_attribute_data_hash.clone(),
        }
    }

    /// Apply settings from a `key = value` file. Lines starting with `#` or
    /// `;` are comments. Invalid values warn and keep the previous setting.
    pub fn apply_file(&mut self, path: &Path) -> std::io::Result<()> {
        let text = fs::read_to_string(path)?;
        for (number, raw) in text.lines().enumerate() {
            let line = raw.trim();
            let number = number + 1;
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                warn!("malformed line {number} in {}: {line}", path.display());
                continue;
            };
            let key = key.trim();
            let value = value.trim();
            match key {
                "input_directory" => self.input_directory = PathBuf::from(value),
                "output_directory" => self.output_directory = Some(PathBuf::from(value)),
                "tolerance" | "geometry_tolerance" => match value.parse::<f64>() {
                    Ok(tolerance) => self.tolerance = tolerance,
                    Err(err) => warn!("invalid {key} on line {number}: {value} ({err})"),
                },
                "normal_tolerance" => match value.parse::<f64>() {
                    Ok(tolerance) if tolerance >= 0.0 => self.normal_tolerance = tolerance,
                    Ok(_) => {
                        warn!("negative normal_tolerance on line {number}; using 0");
                        self.normal_tolerance = 0.0;
                    }
                    Err(err) => warn!("invalid normal_tolerance on line {number}: {value} ({err})"),
                },
                "skip_attribute_data_hash" => {
                    self.skip_attribute_data_hash = parse_attribute_list(value);
                }
                "merge_all_glb" => match parse_bool(value) {
                    Some(flag) => self.merge_all_glb = flag,
                    None => warn!("invalid boolean for merge_all_glb on line {number}: {value}"),
                },
                "instance_limit" => match value.parse::<usize>() {
                    Ok(limit) if limit >= 1 => self.instance_limit = limit,
                    _ => {
                        warn!(
                            "invalid instance_limit on line {number}: {value}; \
                             using default {DEFAULT_INSTANCE_LIMIT}"
                        );
                        self.instance_limit = DEFAULT_INSTANCE_LIMIT;
                    }
                },
                "mesh_segmentation" => match parse_bool(value) {
                    Some(flag) => self.mesh_segmentation = flag,
                    None => {
                        warn!("invalid boolean for mesh_segmentation on line {number}: {value}")
                    }
                },
                _ => warn!("unknown configuration key on line {number}: {key}"),
            }
        }
        Ok(())
    }
}

/// Split a comma-separated attribute list, trimming whitespace.
pub fn parse_attribute_list(list: &str) -> BTreeSet<String> {
    list.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Some(true),
        "false" | "0" | "no" => Some(false),
        _ => None,
    }
}
