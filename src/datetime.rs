//! Purchase timestamp parsing with ordered fallback strategies

use chrono::format::ParseErrorKind;
use chrono::{NaiveDate, NaiveDateTime};
use polars::prelude::*;

/// A named way of reading a purchase timestamp.
///
/// Strategies are tried in [`ParseStrategy::ORDER`]; the first one that
/// accepts the text wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ParseStrategy {
    /// `YYYY-MM-DD HH:MM:SS`
    Strict,
    /// Flexible layouts reading an ambiguous date as month before day
    MonthFirst,
    /// Flexible layouts reading an ambiguous date as day before month
    DayFirst,
}

impl ParseStrategy {
    pub const ORDER: [ParseStrategy; 3] = [
        ParseStrategy::Strict,
        ParseStrategy::MonthFirst,
        ParseStrategy::DayFirst,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            ParseStrategy::Strict => "strict",
            ParseStrategy::MonthFirst => "month_first",
            ParseStrategy::DayFirst => "day_first",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ORDER.into_iter().find(|strategy| strategy.name() == name)
    }

    /// Layouts accepted by this strategy, in order. A layout without a time
    /// part reads as midnight.
    pub fn formats(&self) -> &'static [&'static str] {
        match self {
            ParseStrategy::Strict => &["%Y-%m-%d %H:%M:%S"],
            ParseStrategy::MonthFirst => &[
                "%Y-%m-%d %H:%M:%S%.f",
                "%Y-%m-%dT%H:%M:%S%.f",
                "%Y-%m-%d %H:%M",
                "%Y-%m-%dT%H:%M",
                "%Y/%m/%d %H:%M:%S%.f",
                "%Y/%m/%d %H:%M",
                "%m/%d/%Y %H:%M:%S%.f",
                "%m/%d/%Y %H:%M",
                "%m-%d-%Y %H:%M:%S%.f",
                "%m-%d-%Y %H:%M",
                "%m.%d.%Y %H:%M:%S%.f",
                "%m/%d/%y %H:%M:%S%.f",
                "%m/%d/%y %H:%M",
                "%Y-%m-%d",
                "%Y/%m/%d",
                "%m/%d/%Y",
                "%m-%d-%Y",
            ],
            ParseStrategy::DayFirst => &[
                "%d/%m/%Y %H:%M:%S%.f",
                "%d/%m/%Y %H:%M",
                "%d-%m-%Y %H:%M:%S%.f",
                "%d-%m-%Y %H:%M",
                "%d.%m.%Y %H:%M:%S%.f",
                "%d.%m.%Y %H:%M",
                "%d/%m/%y %H:%M:%S%.f",
                "%d/%m/%y %H:%M",
                "%d/%m/%Y",
                "%d-%m-%Y",
                "%d.%m.%Y",
            ],
        }
    }

    /// Try this single strategy against `text`.
    pub fn parse(&self, text: &str) -> Option<NaiveDateTime> {
        let text = text.trim();
        if text.is_empty() {
            return None;
        }
        self.formats().iter().find_map(|format| parse_with(text, format))
    }

    /// Column version of [`ParseStrategy::parse`]: a microsecond datetime,
    /// null where no layout matches
    pub fn parse_expr(&self, text: Expr) -> Expr {
        let attempts: Vec<Expr> = self
            .formats()
            .iter()
            .map(|format| {
                text.clone().str().to_datetime(
                    Some(TimeUnit::Microseconds),
                    None,
                    StrptimeOptions {
                        format: Some((*format).into()),
                        strict: false,
                        exact: true,
                        cache: true,
                    },
                    lit("raise"),
                )
            })
            .collect();
        coalesce(&attempts)
    }
}

fn parse_with(text: &str, format: &str) -> Option<NaiveDateTime> {
    match NaiveDateTime::parse_from_str(text, format) {
        Ok(parsed) => Some(parsed),
        Err(err) if err.kind() == ParseErrorKind::NotEnough => {
            NaiveDate::parse_from_str(text, format)
                .ok()
                .and_then(|date| date.and_hms_opt(0, 0, 0))
        }
        Err(_) => None,
    }
}

/// Parse a purchase timestamp, returning the value and the strategy that
/// accepted it. `None` means every strategy rejected the text.
pub fn parse_purchase_timestamp(text: &str) -> Option<(NaiveDateTime, ParseStrategy)> {
    ParseStrategy::ORDER
        .iter()
        .find_map(|strategy| strategy.parse(text).map(|parsed| (parsed, *strategy)))
}

/// Parse a trimmed text column with every strategy in order.
///
/// Returns the timestamp expression and one naming the strategy that
/// matched; both are null when every strategy rejects the row.
pub fn purchase_timestamp_exprs(text: Expr) -> (Expr, Expr) {
    let [strict, month_first, day_first] =
        ParseStrategy::ORDER.map(|strategy| strategy.parse_expr(text.clone()));

    let strategy = when(strict.clone().is_not_null())
        .then(lit(ParseStrategy::Strict.name()))
        .when(month_first.clone().is_not_null())
        .then(lit(ParseStrategy::MonthFirst.name()))
        .when(day_first.clone().is_not_null())
        .then(lit(ParseStrategy::DayFirst.name()))
        .otherwise(lit(NULL).cast(DataType::String));

    (coalesce(&[strict, month_first, day_first]), strategy)
}
