//! ClickSegmenta: customer segmentation CLI over ticket-purchase transactions
//!
//! `run` executes the batch pipeline, `predict` scores one customer against a
//! persisted model and `query` reads the persisted tables.

use std::time::Instant;

use anyhow::{Context, Result};
use clap::Parser;
use clicksegmenta::cli::{Args, Command, PredictArgs, QueryArgs, QueryView, RunArgs};
use clicksegmenta::config::{resolve_store_sources, FileConfig, PipelineSettings};
use clicksegmenta::model::SegmentModel;
use clicksegmenta::pipeline::run_from_settings;
use clicksegmenta::service::SegmentStore;
use clicksegmenta::summary::persona_for;
use clicksegmenta::viz;
use serde::Serialize;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Logs go to stderr so query output on stdout stays machine readable
fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_env("LOG_LEVEL")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();

    let file_config = match &args.config {
        Some(path) => Some(FileConfig::load(path)?),
        None => None,
    };

    match &args.command {
        Command::Run(run) => run_pipeline(run, file_config),
        Command::Predict(predict) => run_prediction(predict),
        Command::Query(query) => run_query(query, file_config),
    }
}

/// Run full segmentation pipeline
fn run_pipeline(run: &RunArgs, file_config: Option<FileConfig>) -> Result<()> {
    println!("=== ClickSegmenta Pipeline ===\n");
    let start_time = Instant::now();

    let settings = PipelineSettings::resolve(&run.cli_config(), file_config)?;
    let (output, paths) = run_from_settings(&settings)?;

    println!(
        "✓ Data loaded: {} transactions, {} customers",
        output.transactions,
        output.profiles.len()
    );
    if output.dropped > 0 {
        println!("  {} rows removed because of invalid purchase date/time", output.dropped);
    }
    if output.missing_customer > 0 {
        println!("  {} rows removed because of a blank customer id", output.missing_customer);
    }
    viz::print_segment_statistics(&output);

    println!("\n=== Pipeline Complete ===");
    println!("Total processing time: {:.2}s", start_time.elapsed().as_secs_f64());
    println!("Customer table saved to: {}", paths.customers.display());
    println!("Segment summary saved to: {}", paths.summary.display());
    println!("Model parameters saved to: {}", paths.model.display());
    if let Some((scatter, sizes)) = &paths.plots {
        println!("Charts saved to: {} and {}", scatter.display(), sizes.display());
    }
    Ok(())
}

/// Score one customer with persisted model parameters
fn run_prediction(predict: &PredictArgs) -> Result<()> {
    let values = predict.parse_feature_values()?;
    let text = std::fs::read_to_string(&predict.model)
        .with_context(|| format!("Failed to read model parameters from {:?}", predict.model))?;
    let model = SegmentModel::from_json(&text)?;

    let segment = model.predict_raw(&values)?;
    println!("✓ Predicted segment: {}", segment);
    if let Some(persona) = persona_for(segment) {
        println!("  Persona: {}", persona);
    }
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Answer one read-only view over the persisted tables
fn run_query(query: &QueryArgs, file_config: Option<FileConfig>) -> Result<()> {
    let sources = resolve_store_sources(&query.cli_config(), file_config)?;
    let store = SegmentStore::open(sources)?;
    let snapshot = store.snapshot();

    match &query.view {
        QueryView::Customers { .. } => {
            let filters = query.view.customer_query().unwrap_or_default();
            print_json(&snapshot.customers(&filters))
        }
        QueryView::Summary { extra, refresh } => {
            print_json(&store.summary(extra.as_deref(), *refresh)?)
        }
        QueryView::Kpis => print_json(&snapshot.kpis()),
        QueryView::Trend => print_json(&snapshot.sales_trend()?),
        QueryView::Funnel => print_json(&snapshot.funnel()?),
        QueryView::Regions => print_json(&snapshot.regions()?),
        QueryView::Hourly => print_json(&snapshot.hourly()?),
        QueryView::Health => print_json(&snapshot.health()),
        QueryView::Schema => print_json(&snapshot.schema()),
    }
}
