//! Per-segment statistics and persona labels

use std::collections::BTreeMap;

use polars::prelude::*;
use serde::{Deserialize, Serialize};

use crate::features::{CustomerProfile, FEATURE_NAMES, N_FEATURES};

/// Human-readable names for segment ids
const PERSONAS: [(usize, &str); 6] = [
    (0, "Trecho Único Recorrente"),
    (1, "Planejadores Ida & Volta"),
    (2, "Ultra-VIP / Corporativo"),
    (3, "Super-Frequentes Recentes"),
    (4, "Inativos Econômicos"),
    (5, "Regulares de Alto Valor"),
];

pub fn persona_for(segment: usize) -> Option<&'static str> {
    PERSONAS
        .iter()
        .find(|(id, _)| *id == segment)
        .map(|(_, name)| *name)
}

/// Round half away from zero to `places` decimals
pub fn round_to(value: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    (value * factor).round() / factor
}

/// Descriptive statistics of one occupied segment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentSummary {
    #[serde(rename = "segmento")]
    pub segment: usize,
    #[serde(rename = "tamanho_grupo")]
    pub size: usize,
    /// Mean monetary value, 2 decimals
    #[serde(rename = "ticket_medio")]
    pub mean_monetary: f64,
    /// Total monetary value, 2 decimals
    #[serde(rename = "monetario_total")]
    pub total_monetary: f64,
    /// Share of all customers in percent, 2 decimals
    #[serde(rename = "pct_clientes")]
    pub population_share: f64,
    pub persona: Option<String>,
}

/// Summarize `(segment, monetary value)` pairs, one per customer.
///
/// Missing monetary values count towards the segment size but not towards
/// its mean or total. Output is sorted by segment id.
pub fn summarize_segments<I>(members: I) -> crate::Result<Vec<SegmentSummary>>
where
    I: IntoIterator<Item = (usize, Option<f64>)>,
{
    let (segments, monetary): (Vec<u64>, Vec<Option<f64>>) = members
        .into_iter()
        .map(|(segment, value)| (segment as u64, value.filter(|v| v.is_finite())))
        .unzip();
    let population = segments.len();
    if population == 0 {
        return Ok(Vec::new());
    }

    let grouped = df!(
        "segmento" => segments,
        "monetario" => monetary
    )?
    .lazy()
    .group_by([col("segmento")])
    .agg([
        len().alias("tamanho_grupo"),
        col("monetario").mean().alias("ticket_medio"),
        col("monetario").sum().alias("monetario_total"),
    ])
    .sort(["segmento"], SortMultipleOptions::default())
    .collect()?;

    let ids = grouped.column("segmento")?.u64()?;
    let sizes = grouped.column("tamanho_grupo")?.cast(&DataType::UInt64)?;
    let means = grouped.column("ticket_medio")?.f64()?;
    let totals = grouped.column("monetario_total")?.f64()?;

    Ok(ids
        .into_iter()
        .zip(sizes.u64()?)
        .zip(means)
        .zip(totals)
        .filter_map(|(((segment, size), mean), total)| {
            let segment = segment? as usize;
            let size = size? as usize;
            Some(SegmentSummary {
                segment,
                size,
                mean_monetary: round_to(mean.unwrap_or(0.0), 2),
                total_monetary: round_to(total.unwrap_or(0.0), 2),
                population_share: round_to(size as f64 / population as f64 * 100.0, 2),
                persona: persona_for(segment).map(str::to_string),
            })
        })
        .collect())
}

/// Summaries for pipeline profiles and their assigned segments
pub fn summarize_profiles(
    profiles: &[CustomerProfile],
    labels: &[usize],
) -> crate::Result<Vec<SegmentSummary>> {
    summarize_segments(
        profiles
            .iter()
            .zip(labels)
            .map(|(profile, &segment)| (segment, Some(profile.monetary_total))),
    )
}

/// Mean raw feature values of one segment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentProfile {
    pub segment: usize,
    pub size: usize,
    /// Keyed by feature name
    pub means: BTreeMap<String, f64>,
}

/// Per-segment feature means, used to name and compare personas
pub fn profile_segments(
    profiles: &[CustomerProfile],
    labels: &[usize],
) -> crate::Result<Vec<SegmentProfile>> {
    let members: Vec<(u64, [f64; N_FEATURES])> = profiles
        .iter()
        .zip(labels)
        .map(|(profile, &segment)| (segment as u64, profile.feature_vector()))
        .collect();
    if members.is_empty() {
        return Ok(Vec::new());
    }

    let mut columns = vec![Series::new(
        "segmento",
        members.iter().map(|(segment, _)| *segment).collect::<Vec<u64>>(),
    )];
    for (i, name) in FEATURE_NAMES.iter().enumerate() {
        let values: Vec<f64> = members.iter().map(|(_, features)| features[i]).collect();
        columns.push(Series::new(name, values));
    }

    let mut aggregations = vec![len().alias("tamanho")];
    aggregations.extend(FEATURE_NAMES.iter().map(|name| col(name).mean()));
    let grouped = DataFrame::new(columns)?
        .lazy()
        .group_by([col("segmento")])
        .agg(aggregations)
        .sort(["segmento"], SortMultipleOptions::default())
        .collect()?;

    let ids = grouped.column("segmento")?.u64()?;
    let sizes = grouped.column("tamanho")?.cast(&DataType::UInt64)?;
    let sizes = sizes.u64()?;
    let means = FEATURE_NAMES
        .iter()
        .map(|name| grouped.column(name)?.f64().cloned())
        .collect::<PolarsResult<Vec<Float64Chunked>>>()?;

    Ok((0..grouped.height())
        .filter_map(|row| {
            Some(SegmentProfile {
                segment: ids.get(row)? as usize,
                size: sizes.get(row)? as usize,
                means: FEATURE_NAMES
                    .iter()
                    .zip(&means)
                    .map(|(name, values)| (name.to_string(), values.get(row).unwrap_or(0.0)))
                    .collect(),
            })
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile(id: &str, monetary: f64, recency: i64) -> CustomerProfile {
        CustomerProfile {
            customer_id: id.to_string(),
            recency_days: recency,
            frequency: 1,
            monetary_total: monetary,
            avg_tickets_per_order: Some(1.0),
            round_trip_share: 0.0,
        }
    }

    #[test]
    fn test_summary_statistics() {
        let summary = summarize_segments(vec![
            (0, Some(100.0)),
            (0, Some(50.0)),
            (2, Some(10.0)),
            (2, None),
        ])
        .unwrap();

        assert_eq!(summary.len(), 2);
        assert_eq!(summary[0].segment, 0);
        assert_eq!(summary[0].size, 2);
        assert_eq!(summary[0].mean_monetary, 75.0);
        assert_eq!(summary[0].total_monetary, 150.0);
        assert_eq!(summary[0].population_share, 50.0);

        assert_eq!(summary[1].segment, 2);
        assert_eq!(summary[1].size, 2);
        assert_eq!(summary[1].mean_monetary, 10.0);
        assert_eq!(summary[1].persona.as_deref(), Some("Ultra-VIP / Corporativo"));
    }

    #[test]
    fn test_shares_sum_to_one_hundred() {
        let members: Vec<(usize, Option<f64>)> = (0..7).map(|i| (i % 3, Some(i as f64))).collect();
        let summary = summarize_segments(members).unwrap();

        let share: f64 = summary.iter().map(|s| s.population_share).sum();
        let size: usize = summary.iter().map(|s| s.size).sum();
        assert!((share - 100.0).abs() <= 0.01 * summary.len() as f64);
        assert_eq!(size, 7);
        // 3/7 rounded to two decimals
        assert_eq!(summary[0].population_share, 42.86);
    }

    #[test]
    fn test_unknown_segment_has_no_persona() {
        assert_eq!(persona_for(4), Some("Inativos Econômicos"));
        assert_eq!(persona_for(6), None);

        let summary = summarize_segments(vec![(9, Some(1.0))]).unwrap();
        assert_eq!(summary[0].persona, None);
        assert_eq!(summary[0].population_share, 100.0);
    }

    #[test]
    fn test_summary_serializes_with_table_keys() {
        let summary = summarize_segments(vec![(1, Some(12.346))]).unwrap();
        let json = serde_json::to_value(&summary[0]).unwrap();
        assert_eq!(json["segmento"], 1);
        assert_eq!(json["tamanho_grupo"], 1);
        assert_eq!(json["ticket_medio"], 12.35);
        assert_eq!(json["persona"], "Planejadores Ida & Volta");
    }

    #[test]
    fn test_profile_segments_means() {
        let profiles = vec![profile("a", 10.0, 2), profile("b", 30.0, 4), profile("c", 5.0, 9)];
        let segments = profile_segments(&profiles, &[1, 1, 0]).unwrap();

        assert_eq!(segments.len(), 2);
        assert_eq!(segments[1].segment, 1);
        assert_eq!(segments[1].size, 2);
        assert_eq!(segments[1].means["valor_monetario_total"], 20.0);
        assert_eq!(segments[1].means["recencia_dias"], 3.0);
        assert_eq!(segments[0].means["valor_monetario_total"], 5.0);
    }

    #[test]
    fn test_segment_with_no_present_value_has_zero_mean() {
        let members = vec![(3, None), (3, Some(f64::NAN)), (5, Some(8.0))];
        let summary = summarize_segments(members).unwrap();
        assert_eq!(summary[0].segment, 3);
        assert_eq!(summary[0].size, 2);
        assert_eq!(summary[0].mean_monetary, 0.0);
        assert_eq!(summary[0].total_monetary, 0.0);
        assert!(summarize_segments(Vec::new()).unwrap().is_empty());
    }

    #[test]
    fn test_summarize_profiles_totals() {
        let profiles = vec![profile("C1", 350.5, 1), profile("C2", 50.0, 3)];
        let summary = summarize_profiles(&profiles, &[0, 3]).unwrap();
        let total: f64 = summary.iter().map(|s| s.total_monetary).sum();
        assert!((total - 400.5).abs() < 1e-9);
    }
}
