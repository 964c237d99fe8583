//! Read-only query service over the persisted segmentation tables.
//!
//! Tables live in an immutable [`Snapshot`]. A reload builds a whole new
//! generation and swaps it in atomically, so a reader holding an
//! `Arc<Snapshot>` always sees one consistent generation.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Context;
use arc_swap::ArcSwap;
use polars::prelude::*;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{info, warn};

use crate::data::{
    load_raw_transactions, normalize_transactions, NormalizedTransactions, SourceField,
    SourceFormat, ONE_WAY_MARKER, TX_AMOUNT, TX_CUSTOMER, TX_ORIGIN, TX_RETURN_ORIGIN,
    TX_ROUND_TRIP, TX_STATUS, TX_TIMESTAMP,
};
use crate::summary::{round_to, summarize_segments, SegmentSummary};
use crate::table::{load_customer_table, CustomerRecord, CustomerTable, COL_CUSTOMER};

/// Seed used for the customer sampling query
pub const SAMPLE_SEED: u64 = 42;
/// Placeholder retention rate reported by the KPI view
pub const PLACEHOLDER_RETENTION: f64 = 87.3;
/// Placeholder seven-day forecast reported by the KPI view
pub const PLACEHOLDER_FORECAST_7D: u64 = 1247;
/// Number of regions in the regional breakdown
pub const TOP_REGIONS: usize = 8;
/// Window of the moving averages in the trend and hourly views
const ROLLING_WINDOW: usize = 3;
/// Status value counted as a paid order by the funnel
const PAID_STATUS: &str = "pago";
/// Funnel shares assumed when the data cannot tell
const PAID_SHARE: f64 = 0.42;
const ROUND_TRIP_SHARE: f64 = 0.28;
const INTERESTED_SHARE: f64 = 0.75;

const MONTH_LABELS: [&str; 12] = [
    "Jan", "Fev", "Mar", "Abr", "Mai", "Jun", "Jul", "Ago", "Set", "Out", "Nov", "Dez",
];

const SUMMARY_BASE_KEYS: [&str; 3] = ["segmento", "tamanho_grupo", "ticket_medio"];
const SUMMARY_EXTRA_KEYS: [&str; 3] = ["monetario_total", "pct_clientes", "persona"];

/// Where a store loads its tables from
#[derive(Debug, Clone, PartialEq)]
pub struct StoreSources {
    pub customers_path: PathBuf,
    pub transactions_path: Option<PathBuf>,
    pub transaction_format: SourceFormat,
}

/// One immutable generation of the served tables
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub generation: u64,
    pub customers: CustomerTable,
    pub summary: Vec<SegmentSummary>,
    /// `None` when no source is configured or it could not be loaded
    pub transactions: Option<NormalizedTransactions>,
}

/// Filters of the customer listing, all optional
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CustomerQuery {
    /// Segment id as text; non-integer values are ignored
    pub segment: Option<String>,
    /// Comma separated column names to project
    pub columns: Option<String>,
    /// Random sample of this many rows
    pub sample: Option<usize>,
    pub limit: Option<usize>,
    /// Only applied together with `limit`
    pub offset: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Kpis {
    #[serde(rename = "totalClientes")]
    pub total_customers: usize,
    #[serde(rename = "ticketMedio")]
    pub mean_ticket: f64,
    #[serde(rename = "taxaRetencao")]
    pub retention_rate: f64,
    #[serde(rename = "previsao7dias")]
    pub forecast_7d: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrendPoint {
    /// Portuguese month abbreviation and two-digit year, e.g. `Mai/23`
    pub label: String,
    pub year: i32,
    #[serde(rename = "vendas")]
    pub sales: f64,
    #[serde(rename = "previsao")]
    pub forecast: f64,
    pub meta: f64,
    #[serde(rename = "clientes")]
    pub customers: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FunnelStage {
    pub stage: &'static str,
    pub value: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RegionShare {
    #[serde(rename = "regiao")]
    pub region: String,
    #[serde(rename = "clientes")]
    pub customers: usize,
    #[serde(rename = "participacao")]
    pub share: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HourlyCount {
    pub label: String,
    #[serde(rename = "qtd")]
    pub count: usize,
    #[serde(rename = "media")]
    pub moving_average: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Health {
    pub status: &'static str,
    pub rows: usize,
    pub generation: u64,
    pub segments: usize,
    pub transactions: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TableSchema {
    pub columns: Vec<String>,
    pub transaction_columns: Vec<String>,
}

/// Trailing mean over at most `window` values, starting from the first one
fn rolling_mean(values: &[f64], window: usize) -> Vec<f64> {
    (0..values.len())
        .map(|i| {
            let start = (i + 1).saturating_sub(window);
            let slice = &values[start..=i];
            slice.iter().sum::<f64>() / slice.len() as f64
        })
        .collect()
}

fn counts(frame: &DataFrame, name: &str) -> crate::Result<Vec<u64>> {
    Ok(frame
        .column(name)?
        .cast(&DataType::UInt64)?
        .u64()?
        .into_iter()
        .map(|v| v.unwrap_or(0))
        .collect())
}

fn integers(frame: &DataFrame, name: &str) -> crate::Result<Vec<i32>> {
    Ok(frame
        .column(name)?
        .cast(&DataType::Int32)?
        .i32()?
        .into_iter()
        .map(|v| v.unwrap_or(0))
        .collect())
}

/// Funnel stages, with the placeholder shares standing in for unknown counts
fn funnel_stages(total: u64, paid: Option<u64>, round_trips: Option<u64>) -> Vec<FunnelStage> {
    let share = |ratio: f64| (total as f64 * ratio) as u64;
    let paid = paid.unwrap_or_else(|| share(PAID_SHARE));
    let round_trips = round_trips.unwrap_or_else(|| share(ROUND_TRIP_SHARE));

    vec![
        FunnelStage {
            stage: "Visitantes",
            value: total.max(paid),
        },
        FunnelStage {
            stage: "Interessados",
            value: share(INTERESTED_SHARE),
        },
        FunnelStage {
            stage: "Consideração",
            value: paid,
        },
        FunnelStage {
            stage: "Intenção",
            value: round_trips,
        },
        FunnelStage {
            stage: "Compra",
            value: paid,
        },
    ]
}

/// Rank `region` values of `frame` by distinct non-null `customer` ids
fn rank_regions(frame: LazyFrame, region: Expr, customer: &str) -> crate::Result<Vec<RegionShare>> {
    let ranked = frame
        .select([region.alias("regiao"), col(customer)])
        .filter(col("regiao").is_not_null())
        .group_by([col("regiao")])
        .agg([col(customer).drop_nulls().n_unique().alias("clientes")])
        .sort(
            ["clientes", "regiao"],
            SortMultipleOptions::default().with_order_descending_multi([true, false]),
        )
        .limit(TOP_REGIONS as IdxSize)
        .collect()?;

    let customers = counts(&ranked, "clientes")?;
    let total: u64 = customers.iter().sum();
    Ok(ranked
        .column("regiao")?
        .str()?
        .into_iter()
        .zip(customers)
        .filter_map(|(region, customers)| {
            Some(RegionShare {
                region: region?.to_string(),
                customers: customers as usize,
                share: round_to(customers as f64 / total.max(1) as f64 * 100.0, 1),
            })
        })
        .collect())
}

/// Region text without the one-way marker
fn return_region(text: Expr) -> Expr {
    when(text.clone().neq(lit(ONE_WAY_MARKER)))
        .then(text)
        .otherwise(lit(NULL).cast(DataType::String))
}

fn load_transactions(path: &Path, format: SourceFormat) -> crate::Result<NormalizedTransactions> {
    let raw = load_raw_transactions(path, format)
        .with_context(|| format!("Failed to load transactions from {:?}", path))?;
    normalize_transactions(&raw, format)
}

impl Snapshot {
    pub fn new(
        generation: u64,
        customers: CustomerTable,
        transactions: Option<NormalizedTransactions>,
    ) -> crate::Result<Self> {
        let summary = summarize_segments(customers.segment_members())?;
        Ok(Self {
            generation,
            customers,
            summary,
            transactions,
        })
    }

    /// Load every table of one generation from disk.
    ///
    /// Only the customer table is required: an unusable transaction source
    /// is logged and leaves the temporal views empty.
    pub fn load(generation: u64, sources: &StoreSources) -> crate::Result<Self> {
        let customers = load_customer_table(&sources.customers_path)?;
        let transactions = match &sources.transactions_path {
            Some(path) => match load_transactions(path, sources.transaction_format) {
                Ok(batch) => Some(batch),
                Err(err) => {
                    warn!(
                        path = %path.display(),
                        error = %format!("{:#}", err),
                        "transactions unavailable, temporal views will be empty"
                    );
                    None
                }
            },
            None => None,
        };
        Self::new(generation, customers, transactions)
    }

    /// Customer rows after filtering, sampling, projection and pagination
    pub fn customers(&self, query: &CustomerQuery) -> Vec<Map<String, Value>> {
        let mut rows: Vec<&CustomerRecord> = self.customers.records.iter().collect();

        if let Some(segment) = query
            .segment
            .as_deref()
            .and_then(|s| s.trim().parse::<i64>().ok())
        {
            rows.retain(|r| r.segment.map(|s| s as i64) == Some(segment));
        }

        if let Some(n) = query.sample.filter(|&n| n > 0) {
            let mut rng = StdRng::seed_from_u64(SAMPLE_SEED);
            let amount = n.min(rows.len());
            rows = rand::seq::index::sample(&mut rng, rows.len(), amount)
                .into_iter()
                .map(|i| rows[i])
                .collect();
        }

        let requested: Vec<String> = query
            .columns
            .as_deref()
            .map(|columns| {
                columns
                    .split(',')
                    .map(str::trim)
                    .filter(|c| self.customers.has_column(c))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        let columns = if requested.is_empty() {
            &self.customers.columns
        } else {
            &requested
        };

        if let Some(limit) = query.limit {
            let offset = query.offset.unwrap_or(0);
            rows = rows.into_iter().skip(offset).take(limit).collect();
        }

        rows.iter().map(|r| r.to_record(columns)).collect()
    }

    /// Segment summary with the base keys plus any requested extra keys
    pub fn summary_records(&self, extra: Option<&str>) -> Vec<Map<String, Value>> {
        let mut keys: Vec<&str> = SUMMARY_BASE_KEYS.to_vec();
        for key in extra.unwrap_or_default().split(',').map(str::trim) {
            if SUMMARY_EXTRA_KEYS.contains(&key) && !keys.contains(&key) {
                keys.push(key);
            }
        }

        self.summary
            .iter()
            .map(|segment| {
                let full = match serde_json::to_value(segment) {
                    Ok(Value::Object(map)) => map,
                    _ => Map::new(),
                };
                keys.iter()
                    .map(|key| (key.to_string(), full.get(*key).cloned().unwrap_or(Value::Null)))
                    .collect()
            })
            .collect()
    }

    pub fn kpis(&self) -> Kpis {
        let distinct: HashSet<&str> = self
            .customers
            .records
            .iter()
            .map(|r| r.customer_id.as_str())
            .collect();
        let values: Vec<f64> = self
            .customers
            .records
            .iter()
            .filter_map(|r| r.monetary_total)
            .collect();
        let mean = if values.is_empty() {
            0.0
        } else {
            values.iter().sum::<f64>() / values.len() as f64
        };

        Kpis {
            total_customers: distinct.len(),
            mean_ticket: round_to(mean, 2),
            retention_rate: PLACEHOLDER_RETENTION,
            forecast_7d: PLACEHOLDER_FORECAST_7D,
        }
    }

    /// Monthly sales with a moving-average forecast and a +10% target.
    ///
    /// Empty without transactions or without an amount column.
    pub fn sales_trend(&self) -> crate::Result<Vec<TrendPoint>> {
        let Some(batch) = &self.transactions else {
            return Ok(Vec::new());
        };
        if !batch.schema.has(SourceField::Amount) {
            return Ok(Vec::new());
        }

        let monthly = batch
            .frame
            .clone()
            .lazy()
            .group_by([
                col(TX_TIMESTAMP).dt().year().alias("ano"),
                col(TX_TIMESTAMP).dt().month().alias("mes"),
            ])
            .agg([
                col(TX_AMOUNT).sum().alias("vendas"),
                col(TX_CUSTOMER).n_unique().alias("clientes"),
            ])
            .sort(["ano", "mes"], SortMultipleOptions::default())
            .collect()?;

        let years = integers(&monthly, "ano")?;
        let months = integers(&monthly, "mes")?;
        let customers = counts(&monthly, "clientes")?;
        let sales: Vec<f64> = monthly
            .column("vendas")?
            .f64()?
            .into_iter()
            .map(|v| v.unwrap_or(0.0))
            .collect();
        let forecast = rolling_mean(&sales, ROLLING_WINDOW);

        Ok((0..monthly.height())
            .map(|i| {
                let month = MONTH_LABELS[(months[i] as usize).clamp(1, 12) - 1];
                let forecast = round_to(forecast[i], 2);
                TrendPoint {
                    label: format!("{}/{:02}", month, years[i].rem_euclid(100)),
                    year: years[i],
                    sales: sales[i],
                    forecast,
                    meta: round_to(forecast * 1.10, 2),
                    customers: customers[i] as usize,
                }
            })
            .collect())
    }

    /// Conversion funnel proxy built from order counts.
    ///
    /// Without transactions the customer table rows stand in for orders.
    pub fn funnel(&self) -> crate::Result<Vec<FunnelStage>> {
        let Some(batch) = &self.transactions else {
            return Ok(self.customer_funnel());
        };

        let totals = batch
            .frame
            .clone()
            .lazy()
            .select([
                len().cast(DataType::UInt64).alias("pedidos"),
                col(TX_STATUS)
                    .eq(lit(PAID_STATUS))
                    .sum()
                    .cast(DataType::UInt64)
                    .alias("pagos"),
                col(TX_ROUND_TRIP).sum().cast(DataType::UInt64).alias("ida_volta"),
            ])
            .collect()?;

        let total = counts(&totals, "pedidos")?.first().copied().unwrap_or(0);
        let paid = counts(&totals, "pagos")?.first().copied();
        let round_trips = counts(&totals, "ida_volta")?.first().copied();

        Ok(funnel_stages(
            total,
            paid.filter(|_| batch.schema.has(SourceField::PaymentStatus)),
            round_trips.filter(|_| batch.schema.has_round_trip_info()),
        ))
    }

    fn customer_funnel(&self) -> Vec<FunnelStage> {
        let records = &self.customers.records;
        let total = records.iter().filter(|r| !r.customer_id.is_empty()).count() as u64;
        let column_count = |field: SourceField, accept: &dyn Fn(&str) -> bool| -> Option<u64> {
            let column = field.column_names()[0];
            self.customers.has_column(column).then(|| {
                records
                    .iter()
                    .filter_map(|r| r.extra.get(column)?.as_deref())
                    .filter(|v| accept(v.trim()))
                    .count() as u64
            })
        };

        let paid = column_count(SourceField::PaymentStatus, &|v| v == PAID_STATUS);
        let round_trips = column_count(SourceField::RoundTrip, &|v| v.parse::<f64>() == Ok(1.0));
        funnel_stages(total, paid, round_trips)
    }

    /// Top regions of origin by distinct customers.
    ///
    /// Without transactions the customer table's own region column is used.
    pub fn regions(&self) -> crate::Result<Vec<RegionShare>> {
        let Some(batch) = &self.transactions else {
            return self.customer_regions();
        };

        let region = if batch.schema.has(SourceField::Origin) {
            col(TX_ORIGIN)
        } else if batch.schema.has(SourceField::ReturnOrigin) {
            return_region(col(TX_RETURN_ORIGIN))
        } else {
            return Ok(Vec::new());
        };
        rank_regions(batch.frame.clone().lazy(), region, TX_CUSTOMER)
    }

    fn customer_regions(&self) -> crate::Result<Vec<RegionShare>> {
        let origin = SourceField::Origin.column_names()[0];
        let return_origin = SourceField::ReturnOrigin.column_names()[0];
        let (column, one_way) = if self.customers.has_column(origin) {
            (origin, false)
        } else if self.customers.has_column(return_origin) {
            (return_origin, true)
        } else {
            return Ok(Vec::new());
        };

        let records = &self.customers.records;
        let ids: Vec<Option<&str>> = records
            .iter()
            .map(|r| Some(r.customer_id.as_str()).filter(|id| !id.is_empty()))
            .collect();
        let regions: Vec<Option<&str>> = records
            .iter()
            .map(|r| r.extra.get(column).and_then(|v| v.as_deref()))
            .collect();

        let frame = df!(
            COL_CUSTOMER => ids,
            column => regions
        )?;
        let region = if one_way {
            return_region(col(column))
        } else {
            col(column)
        };
        rank_regions(frame.lazy(), region, COL_CUSTOMER)
    }

    /// Purchases per hour of day, for the hours that have any
    pub fn hourly(&self) -> crate::Result<Vec<HourlyCount>> {
        let Some(batch) = &self.transactions else {
            return Ok(Vec::new());
        };

        let hourly = batch
            .frame
            .clone()
            .lazy()
            .group_by([col(TX_TIMESTAMP).dt().hour().alias("hora")])
            .agg([len().alias("qtd")])
            .sort(["hora"], SortMultipleOptions::default())
            .collect()?;

        let hours = integers(&hourly, "hora")?;
        let quantities = counts(&hourly, "qtd")?;
        let values: Vec<f64> = quantities.iter().map(|&n| n as f64).collect();
        let moving = rolling_mean(&values, ROLLING_WINDOW);

        Ok(hours
            .into_iter()
            .zip(quantities)
            .zip(moving)
            .map(|((hour, count), average)| HourlyCount {
                label: format!("{:02}h", hour),
                count: count as usize,
                moving_average: round_to(average, 1),
            })
            .collect())
    }

    pub fn health(&self) -> Health {
        Health {
            status: "ok",
            rows: self.customers.len(),
            generation: self.generation,
            segments: self.summary.len(),
            transactions: self.transactions.as_ref().map(NormalizedTransactions::len),
        }
    }

    pub fn schema(&self) -> TableSchema {
        TableSchema {
            columns: self.customers.columns.clone(),
            transaction_columns: self
                .transactions
                .as_ref()
                .map(|t| t.schema.present_columns().into_iter().map(str::to_string).collect())
                .unwrap_or_default(),
        }
    }
}

/// Owner of the current snapshot
pub struct SegmentStore {
    sources: StoreSources,
    current: ArcSwap<Snapshot>,
    next_generation: AtomicU64,
}

impl SegmentStore {
    /// Load the first generation; fails if the customer table is unusable
    pub fn open(sources: StoreSources) -> crate::Result<Self> {
        let snapshot = Snapshot::load(1, &sources)?;
        info!(
            generation = 1,
            rows = snapshot.customers.len(),
            columns = ?snapshot.customers.columns,
            "segment store opened"
        );
        Ok(Self {
            sources,
            current: ArcSwap::from_pointee(snapshot),
            next_generation: AtomicU64::new(2),
        })
    }

    /// Current generation; stays valid even if a reload happens meanwhile
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.current.load_full()
    }

    /// Rebuild every table and publish them as a new generation.
    ///
    /// On failure the previous generation keeps being served.
    pub fn reload(&self) -> crate::Result<Arc<Snapshot>> {
        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
        match Snapshot::load(generation, &self.sources) {
            Ok(snapshot) => {
                let snapshot = Arc::new(snapshot);
                self.current.store(Arc::clone(&snapshot));
                info!(generation, rows = snapshot.customers.len(), "segment store reloaded");
                Ok(snapshot)
            }
            Err(err) => {
                warn!(generation, error = %err, "reload failed, keeping previous generation");
                Err(err)
            }
        }
    }

    /// Segment summary, optionally reloading the tables first
    pub fn summary(
        &self,
        extra: Option<&str>,
        refresh: bool,
    ) -> crate::Result<Vec<Map<String, Value>>> {
        let snapshot = if refresh { self.reload()? } else { self.snapshot() };
        Ok(snapshot.summary_records(extra))
    }
}
