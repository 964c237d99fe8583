//! Run configuration: CLI values, optionally overridden by a TOML file

use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use serde::Deserialize;

use crate::data::SourceFormat;
use crate::model::{
    KMeansParams, DEFAULT_CLUSTERS, DEFAULT_MAX_ITERS, DEFAULT_SEED, DEFAULT_TOLERANCE,
};
use crate::service::StoreSources;

/// Default number of customers sampled for the silhouette diagnostic
pub const DEFAULT_SILHOUETTE_SAMPLE: usize = 2_000;

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct FileConfig {
    pub transactions_path: Option<String>,
    pub separator: Option<String>,
    pub decimal: Option<String>,
    pub output_dir: Option<String>,
    /// Persisted customer table served by `query`
    pub customers_path: Option<String>,
    pub plots: Option<bool>,

    pub clustering: Option<ClusteringConfig>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct ClusteringConfig {
    pub n_clusters: Option<usize>,
    pub seed: Option<u64>,
    /// Overrides the size-based restart count
    pub restarts: Option<usize>,
    pub max_iters: Option<usize>,
    pub tolerance: Option<f64>,
    pub silhouette_sample: Option<usize>,
}

impl FileConfig {
    pub fn load(path: &Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        toml::from_str(&content).with_context(|| format!("Failed to parse config file: {:?}", path))
    }
}

/// CLI values that a config file may override
#[derive(Debug, Clone)]
pub struct CliConfig {
    pub transactions_path: Option<PathBuf>,
    pub separator: String,
    pub decimal: String,
    pub output_dir: PathBuf,
    pub customers_path: PathBuf,
    pub n_clusters: usize,
    pub seed: u64,
    pub restarts: Option<usize>,
    pub max_iters: usize,
    pub tolerance: f64,
    pub silhouette_sample: usize,
    pub plots: bool,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            transactions_path: None,
            separator: ",".to_string(),
            decimal: ".".to_string(),
            output_dir: PathBuf::from("."),
            customers_path: PathBuf::from("clientes_segmentados.csv"),
            n_clusters: DEFAULT_CLUSTERS,
            seed: DEFAULT_SEED,
            restarts: None,
            max_iters: DEFAULT_MAX_ITERS,
            tolerance: DEFAULT_TOLERANCE,
            silhouette_sample: DEFAULT_SILHOUETTE_SAMPLE,
            plots: false,
        }
    }
}

/// Fully resolved pipeline settings
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineSettings {
    pub transactions_path: PathBuf,
    pub format: SourceFormat,
    pub output_dir: PathBuf,
    pub kmeans: KMeansParams,
    pub silhouette_sample: usize,
    pub plots: bool,
}

/// Parse a field separator; accepts a single ASCII character or `\t`/`tab`
pub fn parse_separator(text: &str) -> crate::Result<u8> {
    match text {
        "\\t" | "tab" | "\t" => Ok(b'\t'),
        other if other.len() == 1 && other.is_ascii() => Ok(other.as_bytes()[0]),
        other => bail!("Separator must be a single ASCII character, got {:?}", other),
    }
}

/// Parse a decimal separator, either `.` or `,`
pub fn parse_decimal(text: &str) -> crate::Result<char> {
    match text.trim() {
        "." => Ok('.'),
        "," => Ok(','),
        other => bail!("Decimal separator must be '.' or ',', got {:?}", other),
    }
}

impl PipelineSettings {
    /// Resolve from CLI and an optional file; file values win where present
    pub fn resolve(cli: &CliConfig, file_config: Option<FileConfig>) -> crate::Result<Self> {
        let file = file_config.unwrap_or_default();

        let transactions_path = file
            .transactions_path
            .map(PathBuf::from)
            .or_else(|| cli.transactions_path.clone())
            .ok_or_else(|| {
                anyhow::anyhow!(
                    "transactions path must be specified via --transactions, TRANS_CSV_PATH or in config file"
                )
            })?;

        let format = resolve_format(cli, file.separator, file.decimal)?;

        let output_dir = file
            .output_dir
            .map(PathBuf::from)
            .unwrap_or_else(|| cli.output_dir.clone());

        let clustering = file.clustering.unwrap_or_default();
        let kmeans = KMeansParams {
            n_clusters: clustering.n_clusters.unwrap_or(cli.n_clusters),
            seed: clustering.seed.unwrap_or(cli.seed),
            restarts: clustering.restarts.or(cli.restarts),
            max_iters: clustering.max_iters.unwrap_or(cli.max_iters),
            tolerance: clustering.tolerance.unwrap_or(cli.tolerance),
        };
        if kmeans.n_clusters == 0 {
            bail!("Number of clusters must be at least 1");
        }
        if kmeans.restarts == Some(0) {
            bail!("Number of restarts must be at least 1");
        }

        Ok(Self {
            transactions_path,
            format,
            output_dir,
            kmeans,
            silhouette_sample: clustering.silhouette_sample.unwrap_or(cli.silhouette_sample),
            plots: file.plots.unwrap_or(cli.plots),
        })
    }
}

fn resolve_format(
    cli: &CliConfig,
    separator: Option<String>,
    decimal: Option<String>,
) -> crate::Result<SourceFormat> {
    let separator = separator.unwrap_or_else(|| cli.separator.clone());
    let decimal = decimal.unwrap_or_else(|| cli.decimal.clone());
    Ok(SourceFormat {
        separator: parse_separator(&separator)?,
        decimal: parse_decimal(&decimal)?,
    })
}

/// Resolve the tables served by the query service
pub fn resolve_store_sources(
    cli: &CliConfig,
    file_config: Option<FileConfig>,
) -> crate::Result<StoreSources> {
    let file = file_config.unwrap_or_default();
    let customers_path = file
        .customers_path
        .map(PathBuf::from)
        .unwrap_or_else(|| cli.customers_path.clone());
    let transactions_path = file
        .transactions_path
        .map(PathBuf::from)
        .or_else(|| cli.transactions_path.clone());
    let transaction_format = resolve_format(cli, file.separator, file.decimal)?;

    Ok(StoreSources {
        customers_path,
        transactions_path,
        transaction_format,
    })
}
