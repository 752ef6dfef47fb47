//! Error types for the tickbar engine.
//!
//! Two layers: [`Error`] is fatal for a unit of work (one input file), while
//! [`RecordError`]/[`RejectReason`] describe a single rejected row or tick and
//! are counted rather than propagated.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Unit-level error type for the tickbar engine.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Data error (inconsistent or missing data).
    #[error("Data error: {0}")]
    Data(String),

    /// Input layout does not match the declared tick format.
    #[error("Format error: {0}")]
    Format(String),

    /// No session class covers the symbol's product.
    #[error("No session calendar configured for symbol {symbol} (product {product})")]
    CalendarConfigMissing { symbol: String, product: String },

    /// Sink write failed after all retries.
    #[error("Sink write failed for {partition} after {attempts} attempt(s): {message}")]
    SinkWrite {
        partition: String,
        attempts: usize,
        message: String,
    },

    /// Database error.
    #[error("Database error: {0}")]
    Database(String),

    /// Database locked or busy; the same write may succeed later.
    #[error("Database busy: {0}")]
    Busy(String),

    /// Delimited-file error.
    #[error("CSV error: {0}")]
    Csv(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic error with message.
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Create a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Create a data error.
    pub fn data(msg: impl Into<String>) -> Self {
        Error::Data(msg.into())
    }

    /// Create a format error.
    pub fn format(msg: impl Into<String>) -> Self {
        Error::Format(msg.into())
    }

    /// Create a missing-calendar error.
    pub fn calendar_missing(symbol: impl Into<String>, product: impl Into<String>) -> Self {
        Error::CalendarConfigMissing {
            symbol: symbol.into(),
            product: product.into(),
        }
    }

    /// Create a database error.
    pub fn database(msg: impl Into<String>) -> Self {
        Error::Database(msg.into())
    }

    /// Create a busy-database error.
    pub fn busy(msg: impl Into<String>) -> Self {
        Error::Busy(msg.into())
    }

    /// Create a CSV error.
    pub fn csv(msg: impl Into<String>) -> Self {
        Error::Csv(msg.into())
    }

    /// Whether a retry of the same operation could succeed. Only lock
    /// contention and I/O failures qualify; schema, constraint and encoding
    /// errors fail the same way every time.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Busy(_) | Error::Io(_))
    }
}

/// Why a single row or tick was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    /// A required field is missing or empty.
    MalformedRecord,
    /// A timestamp, price or volume could not be parsed.
    Parse,
    /// Symbol is not part of the run's symbol filter.
    UnknownSymbol,
    /// Price is zero or negative.
    InvalidPrice,
    /// Price moved further than the configured maximum relative jump.
    PriceJumpRejected,
    /// Same symbol, timestamp, cumulative volume and price as an accepted tick.
    DuplicateTick,
    /// Timestamp not after the previous accepted tick.
    OutOfOrder,
    /// Cumulative volume and turnover moved in opposite directions.
    NegativeDerivedVolume,
    /// Timestamp falls outside every session window.
    OutOfSession,
}

impl RejectReason {
    /// Stable snake_case label used in logs and reports.
    pub fn as_str(self) -> &'static str {
        match self {
            RejectReason::MalformedRecord => "malformed_record",
            RejectReason::Parse => "parse",
            RejectReason::UnknownSymbol => "unknown_symbol",
            RejectReason::InvalidPrice => "invalid_price",
            RejectReason::PriceJumpRejected => "price_jump_rejected",
            RejectReason::DuplicateTick => "duplicate_tick",
            RejectReason::OutOfOrder => "out_of_order",
            RejectReason::NegativeDerivedVolume => "negative_derived_volume",
            RejectReason::OutOfSession => "out_of_session",
        }
    }

    /// Whether the rejection points at damaged input rather than routine feed
    /// content (filtered symbols, repeats, auction or after-close prints).
    pub fn is_data_fault(self) -> bool {
        !matches!(
            self,
            RejectReason::UnknownSymbol | RejectReason::DuplicateTick | RejectReason::OutOfSession
        )
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A rejected row or tick with a human-readable detail.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{reason}: {detail}")]
pub struct RecordError {
    pub reason: RejectReason,
    pub detail: String,
}

impl RecordError {
    pub fn new(reason: RejectReason, detail: impl Into<String>) -> Self {
        Self {
            reason,
            detail: detail.into(),
        }
    }

    pub fn malformed(detail: impl Into<String>) -> Self {
        Self::new(RejectReason::MalformedRecord, detail)
    }

    pub fn parse(detail: impl Into<String>) -> Self {
        Self::new(RejectReason::Parse, detail)
    }

    pub fn unknown_symbol(symbol: &str) -> Self {
        Self::new(RejectReason::UnknownSymbol, format!("symbol {symbol} not in filter"))
    }
}

/// Per-reason reject counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RejectCounts(BTreeMap<RejectReason, u64>);

impl RejectCounts {
    /// Count one rejection.
    pub fn record(&mut self, reason: RejectReason) {
        *self.0.entry(reason).or_insert(0) += 1;
    }

    /// Count for a single reason.
    pub fn get(&self, reason: RejectReason) -> u64 {
        self.0.get(&reason).copied().unwrap_or(0)
    }

    /// Total rejections across all reasons.
    pub fn total(&self) -> u64 {
        self.0.values().sum()
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }

    /// Rejections that point at damaged input.
    pub fn faults(&self) -> u64 {
        self.iter()
            .filter(|(reason, _)| reason.is_data_fault())
            .map(|(_, count)| count)
            .sum()
    }

    /// Add another set of counters into this one.
    pub fn merge(&mut self, other: &RejectCounts) {
        for (reason, count) in &other.0 {
            *self.0.entry(*reason).or_insert(0) += count;
        }
    }

    /// Iterate non-zero counters in reporting order.
    pub fn iter(&self) -> impl Iterator<Item = (RejectReason, u64)> + '_ {
        self.0.iter().map(|(r, c)| (*r, *c)).filter(|(_, c)| *c > 0)
    }
}

impl fmt::Display for RejectCounts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("none");
        }
        let mut first = true;
        for (reason, count) in self.iter() {
            if !first {
                f.write_str(", ")?;
            }
            write!(f, "{reason}={count}")?;
            first = false;
        }
        Ok(())
    }
}
