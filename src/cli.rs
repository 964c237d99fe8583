//! Command-line interface definitions and argument parsing

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::config::{CliConfig, DEFAULT_SILHOUETTE_SAMPLE};
use crate::features::{FEATURE_NAMES, N_FEATURES};
use crate::model::{DEFAULT_CLUSTERS, DEFAULT_MAX_ITERS, DEFAULT_SEED, DEFAULT_TOLERANCE};
use crate::service::CustomerQuery;

/// Customer segmentation of ticket purchases with K-Means
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// TOML config file; its values override the command line
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Segment customers from a transaction file and persist the tables
    Run(RunArgs),
    /// Assign a segment to one customer's raw feature values
    Predict(PredictArgs),
    /// Read the persisted tables
    Query(QueryArgs),
}

/// Transaction source location and format
#[derive(clap::Args, Debug, Clone)]
pub struct SourceArgs {
    /// Transaction CSV file
    #[arg(short, long, env = "TRANS_CSV_PATH")]
    pub transactions: Option<PathBuf>,

    /// Field separator of the transaction file
    #[arg(long, env = "TRANS_SEP", default_value = ",")]
    pub separator: String,

    /// Decimal separator of the transaction file
    #[arg(long, env = "TRANS_DEC", default_value = ".")]
    pub decimal: String,
}

#[derive(clap::Args, Debug, Clone)]
pub struct RunArgs {
    #[command(flatten)]
    pub source: SourceArgs,

    /// Directory receiving the output tables
    #[arg(short, long, default_value = ".")]
    pub output_dir: PathBuf,

    /// Number of segments
    #[arg(short = 'k', long, default_value_t = DEFAULT_CLUSTERS)]
    pub clusters: usize,

    #[arg(long, default_value_t = DEFAULT_SEED)]
    pub seed: u64,

    /// Independent initializations; derived from the customer count if unset
    #[arg(long)]
    pub restarts: Option<usize>,

    /// Maximum iterations for K-Means algorithm
    #[arg(long, default_value_t = DEFAULT_MAX_ITERS)]
    pub max_iters: usize,

    /// Tolerance for K-Means convergence
    #[arg(long, default_value_t = DEFAULT_TOLERANCE)]
    pub tolerance: f64,

    /// Customers sampled for the silhouette score
    #[arg(long, default_value_t = DEFAULT_SILHOUETTE_SAMPLE)]
    pub silhouette_sample: usize,

    /// Also render SVG charts
    #[arg(long)]
    pub plots: bool,
}

#[derive(clap::Args, Debug, Clone)]
pub struct PredictArgs {
    /// Model parameters written by `run`
    #[arg(short, long, default_value = "segment_model.json")]
    pub model: PathBuf,

    /// Comma separated feature values:
    /// recency,frequency,monetary,avg_tickets,round_trip_share
    /// Example: --values "30,4,1250.5,1.5,0.25"
    #[arg(long)]
    pub values: String,
}

#[derive(clap::Args, Debug, Clone)]
pub struct QueryArgs {
    /// Persisted customer table
    #[arg(long, env = "CSV_PATH", default_value = "clientes_segmentados.csv")]
    pub customers: PathBuf,

    #[command(flatten)]
    pub source: SourceArgs,

    #[command(subcommand)]
    pub view: QueryView,
}

#[derive(Subcommand, Debug, Clone)]
pub enum QueryView {
    /// Customer rows
    Customers {
        /// Segment id; ignored when not an integer
        #[arg(long, alias = "segmento")]
        segment: Option<String>,
        /// Comma separated columns to keep
        #[arg(long)]
        columns: Option<String>,
        /// Random sample of N rows
        #[arg(long)]
        sample: Option<usize>,
        #[arg(long)]
        limit: Option<usize>,
        #[arg(long)]
        offset: Option<usize>,
    },
    /// Per-segment summary
    Summary {
        /// Extra keys: monetario_total,pct_clientes,persona
        #[arg(long)]
        extra: Option<String>,
        /// Reload the tables before answering
        #[arg(long)]
        refresh: bool,
    },
    Kpis,
    /// Monthly sales with forecast and target
    Trend,
    Funnel,
    /// Top regions of origin
    Regions,
    /// Purchases per hour of day
    Hourly,
    Health,
    Schema,
}

impl QueryView {
    /// Customer filters of a `customers` view
    pub fn customer_query(&self) -> Option<CustomerQuery> {
        match self {
            QueryView::Customers {
                segment,
                columns,
                sample,
                limit,
                offset,
            } => Some(CustomerQuery {
                segment: segment.clone(),
                columns: columns.clone(),
                sample: *sample,
                limit: *limit,
                offset: *offset,
            }),
            _ => None,
        }
    }
}

impl RunArgs {
    pub fn cli_config(&self) -> CliConfig {
        CliConfig {
            transactions_path: self.source.transactions.clone(),
            separator: self.source.separator.clone(),
            decimal: self.source.decimal.clone(),
            output_dir: self.output_dir.clone(),
            n_clusters: self.clusters,
            seed: self.seed,
            restarts: self.restarts,
            max_iters: self.max_iters,
            tolerance: self.tolerance,
            silhouette_sample: self.silhouette_sample,
            plots: self.plots,
            ..Default::default()
        }
    }
}

impl QueryArgs {
    pub fn cli_config(&self) -> CliConfig {
        CliConfig {
            transactions_path: self.source.transactions.clone(),
            separator: self.source.separator.clone(),
            decimal: self.source.decimal.clone(),
            customers_path: self.customers.clone(),
            ..Default::default()
        }
    }
}

impl PredictArgs {
    /// Parse the raw feature values, in feature order
    pub fn parse_feature_values(&self) -> crate::Result<[f64; N_FEATURES]> {
        let parts: Vec<&str> = self.values.split(',').collect();
        if parts.len() != N_FEATURES {
            anyhow::bail!(
                "Predict values must be in format '{}'",
                FEATURE_NAMES.join(",")
            );
        }

        let mut values = [0.0; N_FEATURES];
        for ((value, part), name) in values.iter_mut().zip(&parts).zip(FEATURE_NAMES) {
            *value = part
                .trim()
                .parse()
                .map_err(|_| anyhow::anyhow!("Invalid {} value: {}", name, part))?;
        }
        Ok(values)
    }
}
