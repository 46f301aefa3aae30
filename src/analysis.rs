//! Before/after instancing statistics and the `instancing_analysis.csv`
//! report.

use std::fmt::Write as _;
use std::path::Path;

use tracing::info;

use crate::detector::{instancing_attribute, node_instancing, Detection};
use crate::loader::LoadedModel;

#[derive(Debug, Clone, PartialEq)]
pub struct Analysis {
    pub input_models: usize,
    pub initial_nodes: usize,
    pub initial_meshes: usize,
    /// Instances already present on input via `EXT_mesh_gpu_instancing`.
    pub initial_instances: usize,
    pub instanced_groups: usize,
    pub final_instances: usize,
    pub non_instanced: usize,
    pub final_nodes: usize,
    pub final_meshes: usize,
    /// Instances plus non-instanced meshes: what a renderer ends up drawing.
    pub total_displayed: usize,
    pub node_reduction_pct: f64,
    pub initial_ratio_pct: f64,
    pub final_ratio_pct: f64,
    pub increase_pct: f64,
}

pub fn analyze(models: &[LoadedModel], detection: &Detection) -> Analysis {
    let input_models = models.len();
    let initial_nodes: usize = models.iter().map(|m| m.document.nodes.len()).sum();
    let initial_meshes: usize = models.iter().map(|m| m.document.meshes.len()).sum();
    let initial_instances: usize = models
        .iter()
        .flat_map(|model| {
            model.document.nodes.iter().filter_map(|node| {
                let payload = node_instancing(node)?;
                let accessor = instancing_attribute(payload, "TRANSLATION")?;
                Some(model.document.accessors.get(accessor)?.count.0 as usize)
            })
        })
        .sum();

    let instanced_groups = detection.groups.len();
    let final_instances: usize = detection
        .groups
        .iter()
        .map(|group| group.instances.len())
        .sum();
    let non_instanced = detection.non_instanced.len();
    // One node (and one copied mesh) per group plus one per residual mesh.
    let final_nodes = instanced_groups + non_instanced;
    let final_meshes = instanced_groups + non_instanced;
    let total_displayed = final_instances + non_instanced;

    let node_reduction_pct = if initial_nodes > 0 {
        100.0 * (initial_nodes as f64 - final_nodes as f64) / initial_nodes as f64
    } else {
        0.0
    };
    let (initial_ratio_pct, final_ratio_pct) = if total_displayed > 0 {
        (
            100.0 * initial_instances as f64 / total_displayed as f64,
            100.0 * final_instances as f64 / total_displayed as f64,
        )
    } else {
        (0.0, 0.0)
    };
    let increase_pct = final_ratio_pct - initial_ratio_pct;

    Analysis {
        input_models,
        initial_nodes,
        initial_meshes,
        initial_instances,
        instanced_groups,
        final_instances,
        non_instanced,
        final_nodes,
        final_meshes,
        total_displayed,
        node_reduction_pct,
        initial_ratio_pct,
        final_ratio_pct,
        increase_pct,
    }
}

impl Analysis {
    pub fn log_summary(&self) {
        info!("--- instancing analysis ---");
        info!(
            "input: {} model(s), {} node(s), {} mesh(es), {} pre-instanced instance(s)",
            self.input_models, self.initial_nodes, self.initial_meshes, self.initial_instances
        );
        info!(
            "detected: {} instanced group(s) covering {} instance(s), {} non-instanced mesh(es)",
            self.instanced_groups, self.final_instances, self.non_instanced
        );
        info!(
            "output: {} node(s), {} mesh(es), {} displayed mesh(es)",
            self.final_nodes, self.final_meshes, self.total_displayed
        );
        info!(
            "node reduction {:.2}%, instancing ratio {:.2}% -> {:.2}% ({:+.2}%)",
            self.node_reduction_pct,
            self.initial_ratio_pct,
            self.final_ratio_pct,
            self.increase_pct
        );
    }

    /// Single header row plus single data row; percentages fixed to two
    /// decimal places.
    pub fn to_csv(&self) -> String {
        let mut csv = String::from(
            "Input Models,Initial Nodes,Initial Meshes,Initial Instances,\
             Instanced Groups,Final Instances,Non-instanced Meshes,\
             Final Nodes,Final Meshes,Total Displayed Meshes,Node Reduction (%),\
             Initial Instancing Ratio (%),Final Instancing Ratio (%),Instancing Increase (%)\n",
        );
        let _ = writeln!(
            csv,
            "{},{},{},{},{},{},{},{},{},{},{:.2},{:.2},{:.2},{:.2}",
            self.input_models,
            self.initial_nodes,
            self.initial_meshes,
            self.initial_instances,
            self.instanced_groups,
            self.final_instances,
            self.non_instanced,
            self.final_nodes,
            self.final_meshes,
            self.total_displayed,
            self.node_reduction_pct,
            self.initial_ratio_pct,
            self.final_ratio_pct,
            self.increase_pct,
        );
        csv
    }

    pub fn write_csv(&self, path: &Path) -> std::io::Result<()> {
        std::fs::write(path, self.to_csv())
    }
}
