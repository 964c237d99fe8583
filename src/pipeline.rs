//! Batch segmentation run: normalize, aggregate, scale, cluster, summarize, persist

use std::path::PathBuf;
use std::time::Instant;

use anyhow::Context;
use ndarray::Array2;
use tracing::{debug, info};

use crate::config::PipelineSettings;
use crate::data::{load_raw_transactions, normalize_transactions, RawTable};
use crate::features::{aggregate_customers, feature_matrix, CustomerProfiles};
use crate::model::{fit_kmeans, KMeansModel, SegmentModel};
use crate::scaler::FeatureScaler;
use crate::summary::{profile_segments, summarize_profiles, SegmentProfile, SegmentSummary};
use crate::table::{write_customer_table, write_summary_table};
use crate::viz;

pub const CUSTOMERS_FILE: &str = "clientes_segmentados.csv";
pub const SUMMARY_FILE: &str = "cluster_summary.csv";
pub const MODEL_FILE: &str = "segment_model.json";
pub const SCATTER_FILE: &str = "segment_scatter.svg";
pub const SIZES_FILE: &str = "segment_sizes.svg";

/// Everything one run produces
#[derive(Debug, Clone)]
pub struct PipelineOutput {
    /// Transactions kept after normalization
    pub transactions: usize,
    /// Transactions dropped for an unparseable timestamp
    pub dropped: usize,
    /// Transactions dropped for a blank customer id
    pub missing_customer: usize,
    pub profiles: CustomerProfiles,
    pub scaler: FeatureScaler,
    /// Standardized feature matrix, rows aligned with `profiles`
    pub scaled: Array2<f64>,
    pub model: KMeansModel,
    pub summary: Vec<SegmentSummary>,
    pub segment_profiles: Vec<SegmentProfile>,
    pub silhouette: f64,
    pub seed: u64,
}

impl PipelineOutput {
    pub fn labels(&self) -> Vec<usize> {
        self.model.labels.to_vec()
    }

    pub fn segment_model(&self) -> SegmentModel {
        SegmentModel::new(&self.scaler, &self.model, self.seed)
    }
}

/// Files written by [`persist`]
#[derive(Debug, Clone, PartialEq)]
pub struct PersistedPaths {
    pub customers: PathBuf,
    pub summary: PathBuf,
    pub model: PathBuf,
    pub plots: Option<(PathBuf, PathBuf)>,
}

/// Run the whole segmentation over an already loaded raw table
pub fn run_pipeline(raw: &RawTable, settings: &PipelineSettings) -> crate::Result<PipelineOutput> {
    let normalized = normalize_transactions(raw, settings.format)?;
    let profiles = aggregate_customers(&normalized)?;

    let features = feature_matrix(&profiles.profiles)?;
    let (scaler, scaled) = FeatureScaler::fit_transform(&features)?;
    debug!(mean = ?scaler.mean, scale = ?scaler.scale, "features standardized");

    let model = fit_kmeans(&scaled, &settings.kmeans)?;
    let labels = model.labels.to_vec();

    let silhouette =
        model.compute_silhouette_sample(&scaled, settings.silhouette_sample, settings.kmeans.seed);
    info!(silhouette, inertia = model.inertia, "segmentation quality");

    let summary = summarize_profiles(&profiles.profiles, &labels)?;
    let segment_profiles = profile_segments(&profiles.profiles, &labels)?;

    Ok(PipelineOutput {
        transactions: normalized.len(),
        dropped: normalized.dropped,
        missing_customer: normalized.missing_customer,
        profiles,
        scaler,
        scaled,
        model,
        summary,
        segment_profiles,
        silhouette,
        seed: settings.kmeans.seed,
    })
}

/// Write the customer table, summary, model parameters and optional charts
pub fn persist(
    output: &PipelineOutput,
    settings: &PipelineSettings,
) -> crate::Result<PersistedPaths> {
    let dir = &settings.output_dir;
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create output directory {:?}", dir))?;

    let customers = dir.join(CUSTOMERS_FILE);
    write_customer_table(&customers, &output.profiles.profiles, &output.labels())?;

    let summary = dir.join(SUMMARY_FILE);
    write_summary_table(&summary, &output.summary)?;

    let model = dir.join(MODEL_FILE);
    std::fs::write(&model, output.segment_model().to_json()?)
        .with_context(|| format!("Failed to write model parameters to {:?}", model))?;

    let plots = if settings.plots {
        let scatter = dir.join(SCATTER_FILE);
        let sizes = dir.join(SIZES_FILE);
        viz::generate_visualization_report(&output.scaled, &output.model, &scatter, &sizes)?;
        Some((scatter, sizes))
    } else {
        None
    };

    info!(dir = %dir.display(), plots = plots.is_some(), "pipeline output persisted");
    Ok(PersistedPaths {
        customers,
        summary,
        model,
        plots,
    })
}

/// Load the configured source, run and persist
pub fn run_from_settings(
    settings: &PipelineSettings,
) -> crate::Result<(PipelineOutput, PersistedPaths)> {
    let start = Instant::now();
    let path = &settings.transactions_path;
    let raw = load_raw_transactions(path, settings.format)
        .with_context(|| format!("Failed to load transactions from {:?}", path))?;
    info!(rows = raw.height(), path = %path.display(), "transactions loaded");

    let output = run_pipeline(&raw, settings)?;
    let paths = persist(&output, settings)?;
    info!(elapsed_ms = start.elapsed().as_millis() as u64, "pipeline complete");
    Ok((output, paths))
}
