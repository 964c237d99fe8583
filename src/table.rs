//! Persisted customer table: `;`-separated, `,` as decimal separator

use std::collections::BTreeMap;
use std::fs::File;
use std::path::Path;

use anyhow::Context;
use polars::prelude::*;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::info;

use crate::data::{clean_text, numeric_column, read_text_frame, RawTable};
use crate::features::CustomerProfile;
use crate::summary::{round_to, SegmentSummary};

pub const TABLE_SEPARATOR: u8 = b';';
pub const TABLE_DECIMAL: char = ',';

pub const COL_CUSTOMER: &str = "id_cliente";
pub const COL_SEGMENT: &str = "segmento";
pub const COL_MONETARY: &str = "valor_monetario_total";
pub const COL_RECENCY: &str = "recencia_dias";
pub const COL_FREQUENCY: &str = "frequencia";
pub const COL_AVG_TICKETS: &str = "media_passagens_por_compra";
pub const COL_ROUND_TRIP: &str = "pct_viagens_ida_volta";

/// Columns every persisted customer table must carry
pub const REQUIRED_COLUMNS: [&str; 3] = [COL_CUSTOMER, COL_SEGMENT, COL_MONETARY];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TableError {
    #[error("customer table is missing required columns: {}", .0.join(", "))]
    MissingColumns(Vec<String>),
}

/// One persisted customer row
#[derive(Debug, Clone, PartialEq)]
pub struct CustomerRecord {
    pub customer_id: String,
    /// Missing when the cell is not a non-negative integer
    pub segment: Option<usize>,
    pub monetary_total: Option<f64>,
    pub recency_days: Option<f64>,
    pub frequency: Option<f64>,
    pub avg_tickets_per_order: Option<f64>,
    pub round_trip_share: Option<f64>,
    /// Columns the loader does not interpret, kept as text
    pub extra: BTreeMap<String, Option<String>>,
}

impl CustomerRecord {
    fn field(&self, column: &str) -> Value {
        match column {
            COL_CUSTOMER => Value::from(self.customer_id.clone()),
            COL_SEGMENT => self.segment.map_or(Value::Null, Value::from),
            COL_MONETARY => number_value(self.monetary_total),
            COL_RECENCY => number_value(self.recency_days),
            COL_FREQUENCY => number_value(self.frequency),
            COL_AVG_TICKETS => number_value(self.avg_tickets_per_order),
            COL_ROUND_TRIP => number_value(self.round_trip_share),
            other => match self.extra.get(other) {
                Some(Some(text)) => Value::from(text.clone()),
                _ => Value::Null,
            },
        }
    }

    /// Row-oriented record restricted to `columns`
    pub fn to_record<S: AsRef<str>>(&self, columns: &[S]) -> Map<String, Value> {
        columns
            .iter()
            .map(|column| (column.as_ref().to_string(), self.field(column.as_ref())))
            .collect()
    }
}

/// Integral values become JSON integers, missing values `null`
fn number_value(value: Option<f64>) -> Value {
    match value {
        Some(v) if v.fract() == 0.0 && v.abs() < 9.0e15 => Value::from(v as i64),
        Some(v) => serde_json::Number::from_f64(v).map_or(Value::Null, Value::Number),
        None => Value::Null,
    }
}

/// The loaded customer table
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CustomerTable {
    /// Column names in file order
    pub columns: Vec<String>,
    pub records: Vec<CustomerRecord>,
}

impl CustomerTable {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.columns.iter().any(|c| c == name)
    }

    /// Build from a raw text table, validating the required columns once
    pub fn from_raw(raw: &RawTable) -> crate::Result<Self> {
        let columns = raw.columns();
        let missing: Vec<String> = REQUIRED_COLUMNS
            .iter()
            .filter(|required| !columns.iter().any(|c| c == *required))
            .map(|required| required.to_string())
            .collect();
        if !missing.is_empty() {
            return Err(TableError::MissingColumns(missing).into());
        }

        let frame = raw.frame();
        let numeric = |name: &str| -> crate::Result<Expr> {
            let number = if raw.has_column(name) {
                numeric_column(frame, name, TABLE_DECIMAL)?
            } else {
                lit(NULL).cast(DataType::Float64)
            };
            Ok(number.alias(name))
        };
        let typed = frame
            .clone()
            .lazy()
            .select([
                clean_text(col(COL_CUSTOMER)).fill_null(lit("")).alias(COL_CUSTOMER),
                numeric(COL_SEGMENT)?,
                numeric(COL_MONETARY)?,
                numeric(COL_RECENCY)?,
                numeric(COL_FREQUENCY)?,
                numeric(COL_AVG_TICKETS)?,
                numeric(COL_ROUND_TRIP)?,
            ])
            .collect()?;

        let floats = |name: &str| -> crate::Result<Vec<Option<f64>>> {
            Ok(typed.column(name)?.f64()?.into_iter().collect())
        };
        let segments = floats(COL_SEGMENT)?;
        let monetary = floats(COL_MONETARY)?;
        let recency = floats(COL_RECENCY)?;
        let frequency = floats(COL_FREQUENCY)?;
        let avg_tickets = floats(COL_AVG_TICKETS)?;
        let round_trip = floats(COL_ROUND_TRIP)?;

        let known = [
            COL_CUSTOMER,
            COL_SEGMENT,
            COL_MONETARY,
            COL_RECENCY,
            COL_FREQUENCY,
            COL_AVG_TICKETS,
            COL_ROUND_TRIP,
        ];
        let extra_columns = columns
            .iter()
            .filter(|c| !known.contains(&c.as_str()))
            .map(|name| Ok((name.as_str(), frame.column(name)?.str()?)))
            .collect::<crate::Result<Vec<(&str, &StringChunked)>>>()?;

        let records = typed
            .column(COL_CUSTOMER)?
            .str()?
            .into_iter()
            .enumerate()
            .map(|(i, id)| CustomerRecord {
                customer_id: id.unwrap_or_default().to_string(),
                segment: segments[i]
                    .filter(|s| s.fract() == 0.0 && *s >= 0.0)
                    .map(|s| s as usize),
                monetary_total: monetary[i],
                recency_days: recency[i],
                frequency: frequency[i],
                avg_tickets_per_order: avg_tickets[i],
                round_trip_share: round_trip[i],
                extra: extra_columns
                    .iter()
                    .map(|(name, values)| (name.to_string(), values.get(i).map(str::to_string)))
                    .collect(),
            })
            .collect();

        Ok(Self { columns, records })
    }

    /// `(segment, monetary)` for every row with a valid segment id
    pub fn segment_members(&self) -> impl Iterator<Item = (usize, Option<f64>)> + '_ {
        self.records
            .iter()
            .filter_map(|r| r.segment.map(|segment| (segment, r.monetary_total)))
    }
}

/// Load a persisted customer table
pub fn load_customer_table(path: &Path) -> crate::Result<CustomerTable> {
    let df = read_text_frame(path, TABLE_SEPARATOR)
        .with_context(|| format!("Failed to read customer table {:?}", path))?;
    let raw = RawTable::from_frame(df)?;
    let table = CustomerTable::from_raw(&raw)?;
    info!(rows = table.len(), columns = ?table.columns, "customer table loaded");
    Ok(table)
}

fn decimal_text(value: f64, places: i32) -> String {
    round_to(value, places).to_string().replace('.', ",")
}

/// Write profiles and their segments in the persisted table layout
pub fn write_customer_table(
    path: &Path,
    profiles: &[CustomerProfile],
    labels: &[usize],
) -> crate::Result<()> {
    if profiles.len() != labels.len() {
        anyhow::bail!(
            "Got {} profiles but {} segment assignments",
            profiles.len(),
            labels.len()
        );
    }

    let ids: Vec<&str> = profiles.iter().map(|p| p.customer_id.as_str()).collect();
    let recency: Vec<i64> = profiles.iter().map(|p| p.recency_days).collect();
    let frequency: Vec<u64> = profiles.iter().map(|p| p.frequency).collect();
    let monetary: Vec<String> = profiles
        .iter()
        .map(|p| decimal_text(p.monetary_total, 2))
        .collect();
    let avg_tickets: Vec<Option<String>> = profiles
        .iter()
        .map(|p| p.avg_tickets_per_order.map(|v| decimal_text(v, 2)))
        .collect();
    let round_trip: Vec<String> = profiles
        .iter()
        .map(|p| decimal_text(p.round_trip_share, 4))
        .collect();
    let segments: Vec<u64> = labels.iter().map(|&l| l as u64).collect();

    let mut df = df!(
        COL_CUSTOMER => ids,
        COL_RECENCY => recency,
        COL_FREQUENCY => frequency,
        COL_MONETARY => monetary,
        COL_AVG_TICKETS => avg_tickets,
        COL_ROUND_TRIP => round_trip,
        COL_SEGMENT => segments
    )?;

    let mut file = File::create(path).with_context(|| format!("Failed to create {:?}", path))?;
    CsvWriter::new(&mut file)
        .include_header(true)
        .with_separator(TABLE_SEPARATOR)
        .finish(&mut df)?;
    info!(path = %path.display(), rows = df.height(), "customer table written");
    Ok(())
}

/// Write the segment summary as a comma separated file
pub fn write_summary_table(path: &Path, summary: &[SegmentSummary]) -> crate::Result<()> {
    let segments: Vec<u64> = summary.iter().map(|s| s.segment as u64).collect();
    let sizes: Vec<u64> = summary.iter().map(|s| s.size as u64).collect();
    let means: Vec<f64> = summary.iter().map(|s| s.mean_monetary).collect();
    let totals: Vec<f64> = summary.iter().map(|s| s.total_monetary).collect();
    let shares: Vec<f64> = summary.iter().map(|s| s.population_share).collect();
    let personas: Vec<Option<&str>> = summary.iter().map(|s| s.persona.as_deref()).collect();

    let mut df = df!(
        "segmento" => segments,
        "tamanho_grupo" => sizes,
        "ticket_medio" => means,
        "monetario_total" => totals,
        "pct_clientes" => shares,
        "persona" => personas
    )?;

    let mut file = File::create(path).with_context(|| format!("Failed to create {:?}", path))?;
    CsvWriter::new(&mut file).include_header(true).finish(&mut df)?;
    Ok(())
}
