//! ClickSegmenta: customer segmentation of ticket-purchase transactions
//!
//! Raw transactions are normalized, aggregated into per-customer behavioral
//! profiles, standardized and partitioned with K-Means. The resulting tables
//! are persisted and served read-only through [`service::SegmentStore`].

pub mod cli;
pub mod config;
pub mod data;
pub mod datetime;
pub mod features;
pub mod model;
pub mod pipeline;
pub mod scaler;
pub mod service;
pub mod summary;
pub mod table;
pub mod viz;

// Re-export public items for easier access
pub use cli::Args;
pub use data::{
    load_raw_transactions, normalize_transactions, NormalizedTransactions, RawTable, SourceFormat,
};
pub use features::{aggregate_customers, CustomerProfile};
pub use model::{fit_kmeans, KMeansModel, KMeansParams, SegmentModel};
pub use pipeline::{persist, run_pipeline, PipelineOutput};
pub use scaler::FeatureScaler;
pub use service::{SegmentStore, Snapshot};
pub use summary::{summarize_segments, SegmentSummary};
pub use table::{load_customer_table, TableError};

/// Common result type used throughout the application
pub type Result<T> = anyhow::Result<T>;
