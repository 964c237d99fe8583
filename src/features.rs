//! Per-customer behavioral profile computation using Polars

use chrono::{Duration, NaiveDateTime};
use ndarray::Array2;
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::data::{
    NormalizedTransactions, TX_AMOUNT, TX_CUSTOMER, TX_ORDER, TX_ROUND_TRIP, TX_TICKETS,
    TX_TIMESTAMP,
};

/// Number of behavioral features per customer
pub const N_FEATURES: usize = 5;

/// Feature names, in matrix column order
pub const FEATURE_NAMES: [&str; N_FEATURES] = [
    "recencia_dias",
    "frequencia",
    "valor_monetario_total",
    "media_passagens_por_compra",
    "pct_viagens_ida_volta",
];

const MICROS_PER_DAY: i64 = 86_400_000_000;

/// Behavioral profile of one customer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomerProfile {
    pub customer_id: String,
    /// Whole days between the dataset reference time and the latest purchase
    pub recency_days: i64,
    /// Distinct orders, or transaction rows when orders are not identified
    pub frequency: u64,
    pub monetary_total: f64,
    /// Missing when none of the customer's ticket quantities were readable
    pub avg_tickets_per_order: Option<f64>,
    pub round_trip_share: f64,
}

impl CustomerProfile {
    /// Feature vector in [`FEATURE_NAMES`] order, missing values as 0
    pub fn feature_vector(&self) -> [f64; N_FEATURES] {
        [
            self.recency_days as f64,
            self.frequency as f64,
            self.monetary_total,
            self.avg_tickets_per_order.unwrap_or(0.0),
            self.round_trip_share,
        ]
    }
}

/// Customer profiles of one pipeline run
#[derive(Debug, Clone, PartialEq)]
pub struct CustomerProfiles {
    /// Sorted by customer id
    pub profiles: Vec<CustomerProfile>,
    /// One day after the latest purchase in the dataset
    pub reference_now: NaiveDateTime,
}

impl CustomerProfiles {
    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }
}

/// Group normalized transactions by customer and compute the five features
pub fn aggregate_customers(batch: &NormalizedTransactions) -> crate::Result<CustomerProfiles> {
    let latest = match batch.latest_purchase()? {
        Some(latest) => latest,
        None => anyhow::bail!("No valid transactions found after normalization"),
    };
    let reference_now = latest + Duration::days(1);
    let reference_micros = reference_now.and_utc().timestamp_micros();

    let frequency = if batch.has_order_ids() {
        col(TX_ORDER).drop_nulls().n_unique()
    } else {
        col(TX_CUSTOMER).count()
    };

    let grouped = batch
        .frame
        .clone()
        .lazy()
        .group_by([col(TX_CUSTOMER)])
        .agg([
            // Recency is derived from the latest purchase below
            col(TX_TIMESTAMP).max().cast(DataType::Int64).alias("ultima_compra"),
            frequency.alias("frequencia"),
            col(TX_AMOUNT).sum().alias("valor_monetario_total"),
            col(TX_TICKETS).mean().alias("media_passagens_por_compra"),
            col(TX_ROUND_TRIP)
                .cast(DataType::Float64)
                .mean()
                .alias("pct_viagens_ida_volta"),
        ])
        .sort([TX_CUSTOMER], SortMultipleOptions::default())
        .collect()?;

    let customer_ids: Vec<String> = grouped
        .column(TX_CUSTOMER)?
        .str()?
        .into_iter()
        .map(|v| v.unwrap_or_default().to_string())
        .collect();
    let last_purchase: Vec<i64> = grouped
        .column("ultima_compra")?
        .i64()?
        .into_iter()
        .map(|v| v.unwrap_or(reference_micros))
        .collect();
    let frequency: Vec<u64> = grouped
        .column("frequencia")?
        .cast(&DataType::UInt64)?
        .u64()?
        .into_iter()
        .map(|v| v.unwrap_or(0))
        .collect();
    let monetary: Vec<f64> = grouped
        .column("valor_monetario_total")?
        .f64()?
        .into_iter()
        .map(|v| v.unwrap_or(0.0))
        .collect();
    let avg_tickets: Vec<Option<f64>> = grouped
        .column("media_passagens_por_compra")?
        .f64()?
        .into_iter()
        .collect();
    let round_trip_share: Vec<f64> = grouped
        .column("pct_viagens_ida_volta")?
        .f64()?
        .into_iter()
        .map(|v| v.unwrap_or(0.0))
        .collect();

    let profiles: Vec<CustomerProfile> = customer_ids
        .into_iter()
        .enumerate()
        .map(|(i, customer_id)| CustomerProfile {
            customer_id,
            recency_days: (reference_micros - last_purchase[i]).div_euclid(MICROS_PER_DAY),
            frequency: frequency[i],
            monetary_total: monetary[i],
            avg_tickets_per_order: avg_tickets[i],
            round_trip_share: round_trip_share[i],
        })
        .collect();

    info!(customers = profiles.len(), reference_now = %reference_now, "customer profiles computed");

    Ok(CustomerProfiles {
        profiles,
        reference_now,
    })
}

/// Raw feature matrix `(n_customers, N_FEATURES)`
pub fn feature_matrix(profiles: &[CustomerProfile]) -> crate::Result<Array2<f64>> {
    let mut raw = Vec::with_capacity(profiles.len() * N_FEATURES);
    for profile in profiles {
        raw.extend_from_slice(&profile.feature_vector());
    }
    Ok(Array2::from_shape_vec((profiles.len(), N_FEATURES), raw)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{normalize_transactions, RawTable, SourceFormat, TX_RETURN_ORIGIN};
    use proptest::prelude::*;

    const HEADER: [&str; 7] = [
        "fk_contact",
        "nk_ota_localizer_id",
        "date_purchase",
        "time_purchase",
        "gmv_success",
        "total_tickets_quantity_success",
        "place_origin_return",
    ];

    /// Comma separated cells, an empty cell is missing
    fn cells(line: &str) -> Vec<Option<&str>> {
        line.split(',').map(|c| Some(c).filter(|c| !c.is_empty())).collect()
    }

    fn profiles_for(lines: &[&str]) -> CustomerProfiles {
        let rows: Vec<Vec<Option<&str>>> = lines.iter().map(|line| cells(line)).collect();
        let raw = RawTable::from_rows(&HEADER, &rows).unwrap();
        let normalized = normalize_transactions(&raw, SourceFormat::default()).unwrap();
        aggregate_customers(&normalized).unwrap()
    }

    fn find<'a>(profiles: &'a CustomerProfiles, id: &str) -> &'a CustomerProfile {
        profiles
            .profiles
            .iter()
            .find(|p| p.customer_id == id)
            .unwrap()
    }

    /// Write normalized transactions back as a strict, plain-decimal source
    fn render_as_source(batch: &NormalizedTransactions) -> RawTable {
        let frame = batch
            .frame
            .clone()
            .lazy()
            .select([
                col(TX_CUSTOMER).alias("fk_contact"),
                col(TX_ORDER).alias("nk_ota_localizer_id"),
                col(TX_TIMESTAMP)
                    .dt()
                    .to_string("%Y-%m-%d %H:%M:%S")
                    .alias("purchase_datetime"),
                col(TX_AMOUNT).cast(DataType::String).alias("gmv_success"),
                col(TX_TICKETS)
                    .cast(DataType::String)
                    .alias("total_tickets_quantity_success"),
                col(TX_RETURN_ORIGIN).alias("place_origin_return"),
            ])
            .collect()
            .unwrap();
        RawTable::from_frame(frame).unwrap()
    }

    #[test]
    fn test_profiles_aggregate_per_customer() {
        let profiles = profiles_for(&[
            "C1,L1,2019-01-01,10:00:00,100.00,2,0",
            "C1,L1,2019-01-05,10:00:00,250.50,1,SP",
            "C1,L2,2019-01-10,10:00:00,,3,0",
            "C2,L3,2019-01-20,12:00:00,50.00,4,RJ",
        ]);

        assert_eq!(profiles.len(), 2);
        let c1 = find(&profiles, "C1");
        assert_eq!(c1.frequency, 2);
        assert!((c1.monetary_total - 350.5).abs() < 1e-9);
        assert_eq!(c1.avg_tickets_per_order, Some(2.0));
        assert!((c1.round_trip_share - 1.0 / 3.0).abs() < 1e-12);
        assert_eq!(c1.recency_days, 11);

        let c2 = find(&profiles, "C2");
        assert_eq!(c2.recency_days, 1);
        assert_eq!(c2.frequency, 1);
        assert_eq!(c2.avg_tickets_per_order, Some(4.0));
        assert_eq!(c2.round_trip_share, 1.0);
    }

    #[test]
    fn test_frequency_counts_rows_without_order_ids() {
        let raw = RawTable::from_rows(
            &["fk_contact", "date_purchase"],
            &[
                cells("C1,2019-01-01"),
                cells("C1,2019-01-02"),
                cells("C1,2019-01-03"),
            ],
        )
        .unwrap();
        let normalized = normalize_transactions(&raw, SourceFormat::default()).unwrap();
        let profiles = aggregate_customers(&normalized).unwrap();
        assert_eq!(profiles.profiles[0].frequency, 3);
        assert_eq!(profiles.profiles[0].monetary_total, 0.0);
    }

    #[test]
    fn test_blank_ids_do_not_form_a_customer() {
        let raw = RawTable::from_rows(
            &["fk_contact", "date_purchase", "gmv_success"],
            &[
                cells("C1,2019-01-01,10"),
                cells(",2019-01-02,500"),
                cells(" ,2019-01-03,700"),
            ],
        )
        .unwrap();
        let normalized = normalize_transactions(&raw, SourceFormat::default()).unwrap();
        let profiles = aggregate_customers(&normalized).unwrap();

        assert_eq!(profiles.len(), 1);
        assert_eq!(profiles.profiles[0].customer_id, "C1");
        assert_eq!(profiles.profiles[0].monetary_total, 10.0);
        assert_eq!(profiles.profiles[0].frequency, 1);
    }

    #[test]
    fn test_reference_now_is_global() {
        let profiles = profiles_for(&[
            "A,L1,2019-03-01,08:00:00,1,1,0",
            "B,L2,2019-03-31,08:00:00,1,1,0",
        ]);
        let expected =
            NaiveDateTime::parse_from_str("2019-04-01 08:00:00", "%Y-%m-%d %H:%M:%S").unwrap();
        assert_eq!(profiles.reference_now, expected);
        assert_eq!(find(&profiles, "A").recency_days, 31);
        assert_eq!(find(&profiles, "B").recency_days, 1);
    }

    #[test]
    fn test_missing_tickets_stay_missing() {
        let profiles = profiles_for(&["C1,L1,2019-01-01,10:00:00,10,,0"]);
        assert_eq!(profiles.profiles[0].avg_tickets_per_order, None);
        assert_eq!(profiles.profiles[0].feature_vector()[3], 0.0);
    }

    #[test]
    fn test_recency_is_monotonic_in_last_purchase() {
        let profiles = profiles_for(&[
            "early,L1,2019-01-01,10:00:00,1,1,0",
            "late,L2,2019-02-01,09:00:00,1,1,0",
            "last,L3,2019-02-15,23:59:59,1,1,0",
        ]);
        let early = find(&profiles, "early").recency_days;
        let late = find(&profiles, "late").recency_days;
        let last = find(&profiles, "last").recency_days;
        assert!(early >= late);
        assert!(late >= last);
    }

    #[test]
    fn test_empty_batch_is_an_error() {
        let raw = RawTable::from_rows(&["fk_contact", "date_purchase"], &[cells("C1,??")]).unwrap();
        let normalized = normalize_transactions(&raw, SourceFormat::default()).unwrap();
        assert!(aggregate_customers(&normalized).is_err());
    }

    #[test]
    fn test_feature_matrix_shape() {
        let profiles = profiles_for(&[
            "C1,L1,2019-01-01,10:00:00,1,1,0",
            "C2,L2,2019-01-02,10:00:00,2,1,0",
        ]);
        let matrix = feature_matrix(&profiles.profiles).unwrap();
        assert_eq!(matrix.shape(), &[2, N_FEATURES]);
        assert_eq!(matrix[[1, 2]], 2.0);
    }

    fn source_line() -> impl Strategy<Value = String> {
        (
            0u8..4,
            0u8..6,
            (1u32..=28, 0u32..24, 0u32..60),
            proptest::option::of(0u32..500_000),
            proptest::option::of(1u8..6),
            prop::sample::select(vec!["0", "SP", "RJ"]),
        )
            .prop_map(|(customer, order, (day, hour, minute), cents, tickets, marker)| {
                // Amounts use the Brazilian decimal comma
                let amount = cents
                    .map(|c| format!("{},{:02}", c / 100, c % 100))
                    .unwrap_or_default();
                let tickets = tickets.map(|t| t.to_string()).unwrap_or_default();
                format!(
                    "C{},L{},2021-04-{:02},{:02}:{:02}:00,{},{},{}",
                    customer, order, day, hour, minute, amount, tickets, marker
                )
            })
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn prop_normalized_data_aggregates_identically(
            lines in prop::collection::vec(source_line(), 1..12)
        ) {
            let rows: Vec<Vec<Option<&str>>> = lines.iter().map(|line| cells(line)).collect();
            let raw = RawTable::from_rows(&HEADER, &rows).unwrap();
            let first = normalize_transactions(&raw, SourceFormat::default()).unwrap();
            let profiles = aggregate_customers(&first).unwrap();

            let rendered = render_as_source(&first);
            let again = normalize_transactions(&rendered, SourceFormat::default()).unwrap();
            prop_assert_eq!(again.dropped, 0);
            prop_assert_eq!(aggregate_customers(&again).unwrap(), profiles);
        }
    }
}
