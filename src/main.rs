use std::path::PathBuf;

use clap::Parser;
use rootcause::prelude::*;
use tracing_subscriber::EnvFilter;

use glbinstance::config::{parse_attribute_list, Config};
use glbinstance::pipeline;

/// Collapse repeated geometry across GLB scenes into GPU-instanced draws.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Directory containing GLB files to process.
    #[arg(long)]
    input_directory: Option<PathBuf>,

    /// Directory for the processed outputs. Defaults to
    /// `<input>/processed_output`.
    #[arg(long)]
    output_directory: Option<PathBuf>,

    /// Configuration file with `key = value` lines; command-line flags win.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Geometric tolerance for POSITION comparison; 0 matches exactly.
    #[arg(long)]
    tolerance: Option<f64>,

    /// Tolerance for NORMAL comparison when matching with tolerance.
    #[arg(long)]
    normal_tolerance: Option<f64>,

    /// Comma-separated attributes (e.g. NORMAL,TEXCOORD_0) to exempt from
    /// data hashing in tolerance mode.
    #[arg(long, value_name = "ATTRS")]
    skip_attribute_data_hash: Option<String>,

    /// Minimum number of matching instances that form an instanced group.
    #[arg(long)]
    instance_limit: Option<usize>,

    /// Merge all GLB outputs into a single file per variant.
    #[arg(long)]
    merge_all_glb: bool,

    /// Write each mesh of the stage-1 outputs to a separate GLB.
    #[arg(long)]
    mesh_segmentation: bool,

    /// Log filter used when RUST_LOG is unset.
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() -> Result<(), Report> {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(args.log_level.clone())),
        )
        .init();

    let mut config = Config::new(PathBuf::new());
    if let Some(path) = &args.config {
        config.apply_file(path).map_err(|err| {
            rootcause::report!("failed to load configuration file {}: {err}", path.display())
        })?;
    }

    if let Some(input) = args.input_directory {
        config.input_directory = input;
    }
    if let Some(output) = args.output_directory {
        config.output_directory = Some(output);
    }
    if let Some(tolerance) = args.tolerance {
        config.tolerance = tolerance;
    }
    if let Some(tolerance) = args.normal_tolerance {
        if tolerance < 0.0 {
            tracing::warn!("normal tolerance cannot be negative; using 0");
            config.normal_tolerance = 0.0;
        } else {
            config.normal_tolerance = tolerance;
        }
    }
    if let Some(attrs) = &args.skip_attribute_data_hash {
        config.skip_attribute_data_hash = parse_attribute_list(attrs);
    }
    if let Some(limit) = args.instance_limit {
        config.instance_limit = limit.max(1);
    }
    if args.merge_all_glb {
        config.merge_all_glb = true;
    }
    if args.mesh_segmentation {
        config.mesh_segmentation = true;
    }

    if config.input_directory.as_os_str().is_empty() {
        return Err(rootcause::report!(
            "--input-directory is required (or set input_directory in the config file)"
        ));
    }

    pipeline::run(&config)?;
    Ok(())
}
