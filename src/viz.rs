//! SVG charts of the segmentation using Plotters

use std::path::Path;

use ndarray::Array2;
use plotters::prelude::*;
use tracing::info;

use crate::features::FEATURE_NAMES;
use crate::model::KMeansModel;
use crate::pipeline::PipelineOutput;
use crate::summary::persona_for;

/// Segment palette, one color per default segment
const SEGMENT_COLORS: [RGBColor; 6] = [
    RGBColor(0x0E, 0xA5, 0xE9),
    RGBColor(0xF5, 0x9E, 0x0B),
    RGBColor(0x8B, 0x5C, 0xF6),
    RGBColor(0x10, 0xB9, 0x81),
    RGBColor(0x6B, 0x72, 0x80),
    RGBColor(0xEF, 0x44, 0x44),
];

/// Standardized features drawn by the scatter plot
const SCATTER_X: usize = 1;
const SCATTER_Y: usize = 2;

fn segment_color(segment: usize) -> RGBColor {
    SEGMENT_COLORS.get(segment).copied().unwrap_or(BLACK)
}

fn segment_label(segment: usize) -> String {
    match persona_for(segment) {
        Some(persona) => format!("Segmento {} - {}", segment, persona),
        None => format!("Segmento {}", segment),
    }
}

fn padded_range(values: impl Iterator<Item = f64> + Clone) -> std::ops::Range<f64> {
    let min = values.clone().fold(f64::INFINITY, f64::min);
    let max = values.fold(f64::NEG_INFINITY, f64::max);
    if min.is_finite() && max.is_finite() {
        (min - 0.5)..(max + 0.5)
    } else {
        -1.0..1.0
    }
}

/// Scatter of frequency against monetary value, colored by segment
pub fn create_segment_scatter(
    scaled: &Array2<f64>,
    model: &KMeansModel,
    output_path: &Path,
    plot_title: Option<&str>,
) -> crate::Result<()> {
    if scaled.ncols() <= SCATTER_Y {
        anyhow::bail!("Scatter plot needs at least {} features", SCATTER_Y + 1);
    }
    if scaled.nrows() != model.labels.len() {
        anyhow::bail!("Got {} rows but {} segment labels", scaled.nrows(), model.labels.len());
    }
    let title = plot_title.unwrap_or("Segmentos: frequência x valor monetário");

    let x_range = padded_range(scaled.column(SCATTER_X).iter().copied());
    let y_range = padded_range(scaled.column(SCATTER_Y).iter().copied());

    let root = SVGBackend::new(output_path, (900, 640)).into_drawing_area();
    root.fill(&WHITE)?;

    let mut chart = ChartBuilder::on(&root)
        .caption(title, ("sans-serif", 26))
        .margin(10)
        .x_label_area_size(50)
        .y_label_area_size(60)
        .build_cartesian_2d(x_range, y_range)?;

    chart
        .configure_mesh()
        .x_desc(format!("{} (padronizado)", FEATURE_NAMES[SCATTER_X]))
        .y_desc(format!("{} (padronizado)", FEATURE_NAMES[SCATTER_Y]))
        .axis_desc_style(("sans-serif", 15))
        .draw()?;

    for segment in 0..model.n_clusters {
        let color = segment_color(segment);
        let points = scaled
            .outer_iter()
            .zip(model.labels.iter())
            .filter(|(_, &label)| label == segment)
            .map(|(row, _)| Circle::new((row[SCATTER_X], row[SCATTER_Y]), 3, color.filled()));

        chart
            .draw_series(points)?
            .label(segment_label(segment))
            .legend(move |(x, y)| Rectangle::new([(x, y - 5), (x + 10, y + 5)], color.filled()));
    }

    // Centroids as outlined squares
    chart.draw_series(model.centroids.outer_iter().enumerate().map(|(segment, centroid)| {
        let (x, y) = (centroid[SCATTER_X], centroid[SCATTER_Y]);
        Rectangle::new(
            [(x - 0.08, y - 0.08), (x + 0.08, y + 0.08)],
            segment_color(segment).stroke_width(2),
        )
    }))?;

    chart
        .configure_series_labels()
        .background_style(WHITE.mix(0.8))
        .border_style(BLACK)
        .draw()?;

    root.present()?;
    info!(path = %output_path.display(), "segment scatter written");
    Ok(())
}

/// Bar chart of customers per segment
pub fn create_segment_size_chart(model: &KMeansModel, output_path: &Path) -> crate::Result<()> {
    let sizes = model.cluster_sizes();
    let max_size = sizes.iter().copied().max().unwrap_or(1).max(1) as f64;

    let root = SVGBackend::new(output_path, (640, 420)).into_drawing_area();
    root.fill(&WHITE)?;

    let mut chart = ChartBuilder::on(&root)
        .caption("Clientes por segmento", ("sans-serif", 26))
        .margin(10)
        .x_label_area_size(40)
        .y_label_area_size(60)
        .build_cartesian_2d(-0.5f64..(model.n_clusters as f64 - 0.5), 0f64..(max_size * 1.1))?;

    chart
        .configure_mesh()
        .x_desc("Segmento")
        .y_desc("Clientes")
        .axis_desc_style(("sans-serif", 15))
        .draw()?;

    chart.draw_series(sizes.iter().enumerate().map(|(segment, &size)| {
        let x = segment as f64;
        Rectangle::new([(x - 0.4, 0.0), (x + 0.4, size as f64)], segment_color(segment).filled())
    }))?;

    root.present()?;
    info!(path = %output_path.display(), "segment size chart written");
    Ok(())
}

/// Print segment statistics to the console
pub fn print_segment_statistics(output: &PipelineOutput) {
    println!("\n=== Segment Statistics ===");
    println!(
        "Transactions kept: {} (dropped: {} bad date/time, {} blank id)",
        output.transactions, output.dropped, output.missing_customer
    );
    println!("Customers: {}", output.profiles.len());
    println!("Segments: {}", output.model.n_clusters);
    println!("Within-cluster sum of squares (inertia): {:.2}", output.model.inertia);
    println!("Silhouette score (sample): {:.3}", output.silhouette);

    println!("\nSegment summary:");
    println!("  Segmento | Clientes |      % | Ticket médio | Persona");
    println!("  ---------|----------|--------|--------------|--------");
    for segment in &output.summary {
        println!(
            "  {:8} | {:8} | {:6.2} | {:12.2} | {}",
            segment.segment,
            segment.size,
            segment.population_share,
            segment.mean_monetary,
            segment.persona.as_deref().unwrap_or("-")
        );
    }

    println!("\nSegment profiles (feature means):");
    println!("  Segmento | {}", FEATURE_NAMES.join(" | "));
    for profile in &output.segment_profiles {
        let means: Vec<String> = FEATURE_NAMES
            .iter()
            .map(|name| format!("{:.2}", profile.means.get(*name).copied().unwrap_or(0.0)))
            .collect();
        println!("  {:8} | {}", profile.segment, means.join(" | "));
    }
}

/// Write both charts
pub fn generate_visualization_report(
    scaled: &Array2<f64>,
    model: &KMeansModel,
    scatter_path: &Path,
    sizes_path: &Path,
) -> crate::Result<()> {
    create_segment_scatter(scaled, model, scatter_path, None)?;
    create_segment_size_chart(model, sizes_path)?;
    Ok(())
}
