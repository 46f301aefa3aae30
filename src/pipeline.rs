//! Run orchestration: discover → load → detect → analyze → write output
//! variants → optional segmentation stage.
//!
//! A failing output variant is logged and the run continues with the
//! remaining variants; an empty input directory is a successful no-op.

use std::fs;
use std::path::PathBuf;

use rootcause::prelude::*;
use tracing::{error, info};

use crate::analysis::{self, Analysis};
use crate::config::Config;
use crate::detector::Detector;
use crate::loader;
use crate::tileset::{self, RootBoundingVolume};
use crate::writer;

/// Per-output hand-off to the external tileset emitter.
#[derive(Debug, Clone)]
pub struct EmitterInput {
    pub glb_path: PathBuf,
    pub volume: RootBoundingVolume,
    pub geometric_error: f64,
}

/// What a run produced.
#[derive(Debug, Default)]
pub struct RunSummary {
    pub models_loaded: usize,
    pub analysis: Option<Analysis>,
    pub instanced: Option<EmitterInput>,
    pub non_instanced: Option<EmitterInput>,
    pub segmented_written: usize,
}

fn emitter_input(outcome: &writer::WriteOutcome) -> Option<EmitterInput> {
    let volume = RootBoundingVolume::from_bounds(&outcome.bounds)?;
    Some(EmitterInput {
        glb_path: outcome.path.clone(),
        volume,
        geometric_error: tileset::root_geometric_error(&outcome.bounds),
    })
}

pub fn run(config: &Config) -> Result<RunSummary, Report> {
    let mut summary = RunSummary::default();

    if !config.input_directory.is_dir() {
        return Err(rootcause::report!(
            "input directory does not exist or is not a directory: {}",
            config.input_directory.display()
        ));
    }
    let output_dir = config.output_directory();
    fs::create_dir_all(&output_dir).map_err(|err| {
        rootcause::report!(
            "failed to create output directory {}: {err}",
            output_dir.display()
        )
    })?;

    let paths = loader::discover_model_paths(&config.input_directory);
    if paths.is_empty() {
        info!("no model files found in the input directory; nothing to do");
        return Ok(summary);
    }
    let models = loader::load_models(&paths);
    if models.is_empty() {
        return Err(rootcause::report!(
            "failed to load any of the {} discovered model file(s)",
            paths.len()
        ));
    }
    summary.models_loaded = models.len();

    let detector = Detector::new(config.signature_options(), config.instance_limit);
    let detection = detector.detect(&models);

    let analysis = analysis::analyze(&models, &detection);
    analysis.log_summary();
    let csv_path = output_dir.join("instancing_analysis.csv");
    match analysis.write_csv(&csv_path) {
        Ok(()) => info!("wrote {}", csv_path.display()),
        Err(err) => error!("failed to write {}: {err}", csv_path.display()),
    }
    summary.analysis = Some(analysis);

    if detection.groups.is_empty() && detection.non_instanced.is_empty() {
        info!("no mesh-bearing nodes survived detection; outputs will be empty");
    }

    // Both packaging modes currently produce one combined file per variant,
    // so merge_all_glb does not change the document shape.
    let mut stage1_outputs = Vec::new();

    let instanced_path = output_dir.join("instanced_meshes.glb");
    match writer::write_instanced_glb(&models, &detection, &instanced_path) {
        Ok(outcome) => {
            match emitter_input(&outcome) {
                Some(input) => summary.instanced = Some(input),
                None => info!("instanced output is empty; nothing for the tileset emitter"),
            }
            stage1_outputs.push(outcome.path);
        }
        Err(err) => error!("failed to write the instanced output: {err:?}"),
    }

    let non_instanced_path = output_dir.join("non_instanced_meshes.glb");
    match writer::write_non_instanced_glb(&models, &detection, &non_instanced_path) {
        Ok(outcome) => {
            match emitter_input(&outcome) {
                Some(input) => summary.non_instanced = Some(input),
                None => info!("non-instanced output is empty; nothing for the tileset emitter"),
            }
            stage1_outputs.push(outcome.path);
        }
        Err(err) => error!("failed to write the non-instanced output: {err:?}"),
    }

    if config.mesh_segmentation {
        if stage1_outputs.is_empty() {
            info!("no stage-1 outputs were produced; skipping mesh segmentation");
        } else {
            // The segmentation stage operates on the files just written, so
            // it reads them back rather than reusing in-memory state.
            let segmented_dir = output_dir.join("segmented_glb_output");
            let reloaded = loader::load_models(&stage1_outputs);
            if reloaded.is_empty() {
                error!("could not reload any stage-1 output for segmentation");
            } else {
                match writer::write_segmented_glbs(&reloaded, &segmented_dir) {
                    Ok(written) => {
                        summary.segmented_written = written;
                        info!("mesh segmentation wrote {written} file(s)");
                    }
                    Err(err) => error!("mesh segmentation failed: {err:?}"),
                }
            }
        }
    }

    info!("pipeline finished");
    Ok(summary)
}
