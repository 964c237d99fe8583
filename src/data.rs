//! Raw transaction loading and record normalization using Polars

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, NaiveDateTime};
use polars::prelude::*;
use tracing::{debug, info, warn};

use crate::datetime::{purchase_timestamp_exprs, ParseStrategy};

/// Identity used when the source carries no customer column
pub const UNKNOWN_CUSTOMER: &str = "cliente_desconhecido";
/// Text substituted for a missing purchase date before parsing
pub const DEFAULT_DATE: &str = "1900-01-01";
/// Text substituted for a missing purchase time before parsing
pub const DEFAULT_TIME: &str = "00:00:00";
/// Return-leg marker meaning "one-way trip"
pub const ONE_WAY_MARKER: &str = "0";
/// Cell texts read as missing after trimming
const TEXT_NULLS: [&str; 3] = ["", "nan", "NaN"];

pub const TX_CUSTOMER: &str = "id_cliente";
pub const TX_TIMESTAMP: &str = "momento_compra";
pub const TX_STRATEGY: &str = "estrategia_data";
pub const TX_ORDER: &str = "pedido";
pub const TX_AMOUNT: &str = "gmv";
pub const TX_TICKETS: &str = "passagens";
pub const TX_RETURN_ORIGIN: &str = "origem_retorno";
pub const TX_ROUND_TRIP: &str = "ida_volta";
pub const TX_ORIGIN: &str = "origem";
pub const TX_STATUS: &str = "status_pagamento";

/// Delimiter and decimal convention of a delimited source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceFormat {
    pub separator: u8,
    pub decimal: char,
}

impl Default for SourceFormat {
    fn default() -> Self {
        Self {
            separator: b',',
            decimal: '.',
        }
    }
}

/// Every column the normalizer knows about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SourceField {
    Customer,
    Date,
    Time,
    DateTime,
    Order,
    Amount,
    Tickets,
    ReturnOrigin,
    Origin,
    RoundTrip,
    PaymentStatus,
}

impl SourceField {
    pub const ALL: [SourceField; 11] = [
        SourceField::Customer,
        SourceField::Date,
        SourceField::Time,
        SourceField::DateTime,
        SourceField::Order,
        SourceField::Amount,
        SourceField::Tickets,
        SourceField::ReturnOrigin,
        SourceField::Origin,
        SourceField::RoundTrip,
        SourceField::PaymentStatus,
    ];

    /// Accepted column names, in order of preference
    pub fn column_names(&self) -> &'static [&'static str] {
        match self {
            SourceField::Customer => &["fk_contact", "id_cliente"],
            SourceField::Date => &["date_purchase"],
            SourceField::Time => &["time_purchase"],
            SourceField::DateTime => &["purchase_datetime"],
            SourceField::Order => &["nk_ota_localizer_id"],
            SourceField::Amount => &["gmv_success"],
            SourceField::Tickets => &["total_tickets_quantity_success"],
            SourceField::ReturnOrigin => &["place_origin_return"],
            SourceField::Origin => &["place_origin"],
            SourceField::RoundTrip => &["is_round_trip"],
            SourceField::PaymentStatus => &["status_pagamento"],
        }
    }
}

/// Which optional fields a source provides, resolved once per load.
///
/// Every field is optional; absence selects the documented default
/// (sentinel identity, default date/time text, `0.0` amounts, one-way marker).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceSchema {
    columns: BTreeMap<SourceField, String>,
}

impl SourceSchema {
    pub fn detect<S: AsRef<str>>(column_names: &[S]) -> Self {
        let mut columns = BTreeMap::new();
        for field in SourceField::ALL {
            let found = field
                .column_names()
                .iter()
                .find(|candidate| column_names.iter().any(|name| name.as_ref() == **candidate));
            if let Some(name) = found {
                columns.insert(field, (*name).to_string());
            }
        }
        Self { columns }
    }

    pub fn has(&self, field: SourceField) -> bool {
        self.columns.contains_key(&field)
    }

    pub fn column(&self, field: SourceField) -> Option<&str> {
        self.columns.get(&field).map(String::as_str)
    }

    /// Names of the recognized columns present in the source
    pub fn present_columns(&self) -> Vec<&str> {
        self.columns.values().map(String::as_str).collect()
    }

    /// Whether timestamps come from separate date/time columns (true) or a
    /// combined datetime column (false)
    fn uses_split_datetime(&self) -> bool {
        self.has(SourceField::Date)
            || self.has(SourceField::Time)
            || !self.has(SourceField::DateTime)
    }

    /// Whether the round-trip flag is backed by any source column
    pub fn has_round_trip_info(&self) -> bool {
        self.has(SourceField::ReturnOrigin) || self.has(SourceField::RoundTrip)
    }
}

/// A raw delimited table with every cell kept as text
#[derive(Debug, Clone)]
pub struct RawTable {
    frame: DataFrame,
}

impl RawTable {
    /// Build a table from a header and rows of optional cells
    pub fn from_rows<S: AsRef<str>>(
        header: &[S],
        rows: &[Vec<Option<&str>>],
    ) -> crate::Result<Self> {
        let mismatched = rows
            .iter()
            .enumerate()
            .find(|(_, row)| row.len() != header.len());
        if let Some((line, row)) = mismatched {
            anyhow::bail!(
                "Row {} has {} cells but the header has {} columns",
                line,
                row.len(),
                header.len()
            );
        }

        let columns: Vec<Series> = header
            .iter()
            .enumerate()
            .map(|(i, name)| {
                let values: Vec<Option<&str>> = rows.iter().map(|row| row[i]).collect();
                Series::new(name.as_ref(), values)
            })
            .collect();
        Ok(Self {
            frame: DataFrame::new(columns)?,
        })
    }

    /// Wrap a DataFrame, casting every column to text
    pub fn from_frame(df: DataFrame) -> crate::Result<Self> {
        let columns = df
            .get_columns()
            .iter()
            .map(|series| series.cast(&DataType::String))
            .collect::<PolarsResult<Vec<_>>>()?;
        Ok(Self {
            frame: DataFrame::new(columns)?,
        })
    }

    pub fn columns(&self) -> Vec<String> {
        self.frame
            .get_column_names()
            .iter()
            .map(|name| name.to_string())
            .collect()
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.frame.get_column_names().contains(&name)
    }

    pub fn height(&self) -> usize {
        self.frame.height()
    }

    pub fn frame(&self) -> &DataFrame {
        &self.frame
    }
}

/// Read a delimited file keeping every column as text
pub fn read_text_frame(path: &Path, separator: u8) -> crate::Result<DataFrame> {
    let df = CsvReadOptions::default()
        .with_has_header(true)
        .with_infer_schema_length(Some(0))
        .map_parse_options(|options| options.with_separator(separator))
        .try_into_reader_with_file_path(Some(path.to_path_buf()))?
        .finish()?;
    Ok(df)
}

/// Load a raw transaction source
pub fn load_raw_transactions(path: &Path, format: SourceFormat) -> crate::Result<RawTable> {
    let df = read_text_frame(path, format.separator)?;
    debug!(rows = df.height(), columns = df.width(), "read transaction source");
    RawTable::from_frame(df)
}

/// Output of the record normalizer.
///
/// `frame` holds one row per retained transaction with the `TX_*` columns:
/// customer id (never null), microsecond purchase timestamp, the strategy
/// that parsed it, order id, amount, tickets, return-leg marker, round-trip
/// flag, origin and payment status.
#[derive(Debug, Clone)]
pub struct NormalizedTransactions {
    pub schema: SourceSchema,
    pub frame: DataFrame,
    /// Rows discarded because no strategy could parse their timestamp
    pub dropped: usize,
    /// Rows discarded because their customer id cell was blank
    pub missing_customer: usize,
}

impl NormalizedTransactions {
    pub fn len(&self) -> usize {
        self.frame.height()
    }

    pub fn is_empty(&self) -> bool {
        self.frame.height() == 0
    }

    pub fn has_order_ids(&self) -> bool {
        self.schema.has(SourceField::Order)
    }

    /// Latest purchase in the batch, `None` when it is empty
    pub fn latest_purchase(&self) -> crate::Result<Option<NaiveDateTime>> {
        let latest = self
            .frame
            .column(TX_TIMESTAMP)?
            .cast(&DataType::Int64)?
            .i64()?
            .max();
        Ok(latest
            .and_then(DateTime::from_timestamp_micros)
            .map(|stamp| stamp.naive_utc()))
    }

    /// Rows parsed by each strategy
    pub fn strategy_counts(&self) -> crate::Result<BTreeMap<ParseStrategy, usize>> {
        let counts = self
            .frame
            .clone()
            .lazy()
            .group_by([col(TX_STRATEGY)])
            .agg([len().alias("linhas")])
            .collect()?;

        let names = counts.column(TX_STRATEGY)?.str()?;
        let rows = counts.column("linhas")?.cast(&DataType::UInt64)?;
        let rows = rows.u64()?;
        Ok(names
            .into_iter()
            .zip(rows)
            .filter_map(|(name, n)| Some((ParseStrategy::from_name(name?)?, n? as usize)))
            .collect())
    }
}

/// Trimmed text with empty cells and textual NaN as missing
pub fn clean_text(text: Expr) -> Expr {
    let trimmed = text
        .cast(DataType::String)
        .str()
        .strip_chars(lit(NULL).cast(DataType::String));
    let blank = TEXT_NULLS
        .iter()
        .fold(lit(false), |acc, null| acc.or(trimmed.clone().eq(lit(*null))));
    when(blank)
        .then(lit(NULL).cast(DataType::String))
        .otherwise(trimmed)
}

fn finite(number: Expr) -> Expr {
    when(number.clone().is_finite())
        .then(number)
        .otherwise(lit(NULL).cast(DataType::Float64))
}

/// Number written with the source's own decimal convention
fn plain_number(text: Expr, decimal: char) -> Expr {
    if decimal == '.' {
        return finite(text.cast(DataType::Float64));
    }
    let converted = text
        .clone()
        .str()
        .replace_all(lit(decimal.to_string()), lit("."), true)
        .cast(DataType::Float64);
    when(text.str().contains_literal(lit(".")))
        .then(lit(NULL).cast(DataType::Float64))
        .otherwise(finite(converted))
}

/// Number written with `.` as thousands and `,` as decimal separator
pub fn brazilian_number(text: Expr) -> Expr {
    finite(
        text.str()
            .replace_all(lit("."), lit(""), true)
            .str()
            .replace_all(lit(","), lit("."), true)
            .cast(DataType::Float64),
    )
}

/// Numeric reading of a text column of `frame`.
///
/// A column whose every present value is a plain number is read as-is.
/// Otherwise the column is textual and each value is read with the Brazilian
/// convention; values that still fail become missing.
pub fn numeric_column(frame: &DataFrame, column: &str, decimal: char) -> crate::Result<Expr> {
    let text = clean_text(col(column));
    let counts = frame
        .clone()
        .lazy()
        .select([
            text.clone().null_count().alias("ausentes"),
            plain_number(text.clone(), decimal).null_count().alias("invalidos"),
        ])
        .collect()?;

    let missing = counts.column("ausentes")?.cast(&DataType::UInt64)?.u64()?.get(0);
    let invalid = counts.column("invalidos")?.cast(&DataType::UInt64)?.u64()?.get(0);
    if missing == invalid {
        Ok(plain_number(text, decimal))
    } else {
        Ok(brazilian_number(text))
    }
}

fn text_or(schema: &SourceSchema, field: SourceField, default: &str) -> Expr {
    match schema.column(field) {
        Some(name) => clean_text(col(name)).fill_null(lit(default.to_string())),
        None => lit(default.to_string()),
    }
}

fn optional_text(schema: &SourceSchema, field: SourceField) -> Expr {
    match schema.column(field) {
        Some(name) => clean_text(col(name)),
        None => lit(NULL).cast(DataType::String),
    }
}

fn number_or_zero(
    frame: &DataFrame,
    schema: &SourceSchema,
    field: SourceField,
    decimal: char,
) -> crate::Result<Expr> {
    match schema.column(field) {
        Some(name) => numeric_column(frame, name, decimal),
        None => Ok(lit(0.0)),
    }
}

/// Normalize a raw table into typed transactions
pub fn normalize_transactions(
    raw: &RawTable,
    format: SourceFormat,
) -> crate::Result<NormalizedTransactions> {
    let schema = SourceSchema::detect(&raw.columns());
    let source = raw.frame();

    let customer = match schema.column(SourceField::Customer) {
        Some(name) => clean_text(col(name)),
        None => lit(UNKNOWN_CUSTOMER),
    };

    let timestamp_text = if schema.uses_split_datetime() {
        concat_str(
            [
                text_or(&schema, SourceField::Date, DEFAULT_DATE),
                text_or(&schema, SourceField::Time, DEFAULT_TIME),
            ],
            " ",
            false,
        )
    } else {
        text_or(
            &schema,
            SourceField::DateTime,
            &format!("{} {}", DEFAULT_DATE, DEFAULT_TIME),
        )
    };
    let (timestamp, strategy) = purchase_timestamp_exprs(timestamp_text);

    let return_origin = match (
        schema.column(SourceField::ReturnOrigin),
        schema.column(SourceField::RoundTrip),
    ) {
        (Some(name), _) => clean_text(col(name)).fill_null(lit(ONE_WAY_MARKER)),
        (None, Some(name)) => {
            let flag = numeric_column(source, name, format.decimal)?;
            when(flag.neq(lit(0.0)))
                .then(lit("1"))
                .otherwise(lit(ONE_WAY_MARKER))
        }
        (None, None) => lit(ONE_WAY_MARKER),
    };

    let amount = number_or_zero(source, &schema, SourceField::Amount, format.decimal)?;
    let tickets = number_or_zero(source, &schema, SourceField::Tickets, format.decimal)?;

    let staged = source
        .clone()
        .lazy()
        .with_columns([
            customer.alias(TX_CUSTOMER),
            timestamp.alias(TX_TIMESTAMP),
            strategy.alias(TX_STRATEGY),
            optional_text(&schema, SourceField::Order).alias(TX_ORDER),
            amount.alias(TX_AMOUNT),
            tickets.alias(TX_TICKETS),
            return_origin.alias(TX_RETURN_ORIGIN),
            optional_text(&schema, SourceField::Origin).alias(TX_ORIGIN),
            optional_text(&schema, SourceField::PaymentStatus).alias(TX_STATUS),
        ])
        .select([
            col(TX_CUSTOMER),
            col(TX_TIMESTAMP),
            col(TX_STRATEGY),
            col(TX_ORDER),
            col(TX_AMOUNT),
            col(TX_TICKETS),
            col(TX_RETURN_ORIGIN),
            col(TX_RETURN_ORIGIN).neq(lit(ONE_WAY_MARKER)).alias(TX_ROUND_TRIP),
            col(TX_ORIGIN),
            col(TX_STATUS),
        ])
        .collect()?;

    let dropped = staged.column(TX_TIMESTAMP)?.null_count();
    let parsed = staged
        .lazy()
        .filter(col(TX_TIMESTAMP).is_not_null())
        .collect()?;
    // Only a present id column can leave blank ids behind
    let missing_customer = parsed.column(TX_CUSTOMER)?.null_count();
    let frame = parsed
        .lazy()
        .filter(col(TX_CUSTOMER).is_not_null())
        .collect()?;

    if dropped > 0 {
        warn!(dropped, "rows removed because of invalid purchase date/time");
    }
    if missing_customer > 0 {
        warn!(missing_customer, "rows removed because of a blank customer id");
    }

    let normalized = NormalizedTransactions {
        schema,
        frame,
        dropped,
        missing_customer,
    };
    info!(
        rows = normalized.len(),
        dropped,
        missing_customer,
        order_ids = normalized.has_order_ids(),
        strategies = ?normalized.strategy_counts()?,
        "transactions normalized"
    );
    Ok(normalized)
}
