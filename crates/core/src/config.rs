//! Configuration structures for the tickbar engine.
//!
//! Every section has a `Default`, and every field is `#[serde(default)]`, so a
//! JSON config file only needs to name what it changes.

use crate::error::{Error, Result};
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Main configuration for a run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Input parsing.
    pub ingest: IngestConfig,
    /// Tick cleaning.
    pub cleaner: CleanerConfig,
    /// Trading-session tables.
    pub calendar: CalendarConfig,
    /// Bar aggregation.
    pub aggregation: AggregationConfig,
    /// Output sink.
    pub sink: SinkConfig,
    /// Worker pool.
    pub run: RunConfig,
}

impl Config {
    /// Load a configuration from a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&text)
    }

    /// Parse a configuration from JSON text.
    pub fn from_json_str(text: &str) -> Result<Self> {
        let config: Config = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.cleaner.max_price_jump <= Decimal::ZERO {
            return Err(Error::config("cleaner.max_price_jump must be positive"));
        }
        if self.sink.retry.max_attempts == 0 {
            return Err(Error::config("sink.retry.max_attempts must be at least 1"));
        }
        if let Some(default_class) = &self.calendar.default_class {
            if !self.calendar.classes.contains_key(default_class) {
                return Err(Error::config(format!(
                    "calendar.default_class {default_class} is not a configured class"
                )));
            }
        }
        Ok(())
    }
}

/// Raw tick layout of an input file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TickFormat {
    /// TAQ Level-2 export (`TradingTime`, `LastPrice`, `TotalVolume`, ...).
    #[default]
    TaqL2,
    /// CTP depth-market-data dump (`InstrumentID`, `UpdateTime`, `UpdateMillisec`, ...).
    Ctp,
}

impl fmt::Display for TickFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TickFormat::TaqL2 => f.write_str("taq-l2"),
            TickFormat::Ctp => f.write_str("ctp"),
        }
    }
}

impl FromStr for TickFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "taq-l2" | "taq" => Ok(TickFormat::TaqL2),
            "ctp" => Ok(TickFormat::Ctp),
            other => Err(Error::config(format!("unknown tick format: {other}"))),
        }
    }
}

/// Input parsing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// Tick layout of the input files.
    pub format: TickFormat,
    /// Field delimiter.
    pub delimiter: char,
    /// Symbols to keep; empty keeps everything.
    pub symbols: Vec<String>,
    /// Symbol for files whose rows do not carry one.
    pub contract: Option<String>,
    /// Trading day for rows whose timestamps carry no date.
    pub trading_day: Option<NaiveDate>,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            format: TickFormat::TaqL2,
            delimiter: ',',
            symbols: Vec::new(),
            contract: None,
            trading_day: None,
        }
    }
}

/// Tick cleaning configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CleanerConfig {
    /// Maximum relative move from the previous accepted price (0.2 = 20%).
    pub max_price_jump: Decimal,
    /// Number of recently accepted ticks checked for duplicates.
    pub dedup_window: usize,
}

impl Default for CleanerConfig {
    fn default() -> Self {
        Self {
            max_price_jump: Decimal::new(2, 1),
            dedup_window: 16,
        }
    }
}

/// One session window, as `HH:MM[:SS]` exchange-local times.
///
/// A window whose end is not after its start runs past midnight.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionWindowConfig {
    pub start: String,
    pub end: String,
    /// Whole window lies on the calendar day after the trading day.
    #[serde(default)]
    pub next_day: bool,
}

impl SessionWindowConfig {
    pub fn new(start: &str, end: &str) -> Self {
        Self {
            start: start.to_string(),
            end: end.to_string(),
            next_day: false,
        }
    }
}

/// Session windows in force from a given trading day.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionVersionConfig {
    /// First trading day the windows apply to; `None` means since forever.
    #[serde(default)]
    pub effective_from: Option<NaiveDate>,
    pub windows: Vec<SessionWindowConfig>,
}

/// A product class: the history of its trading hours.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionClassConfig {
    pub versions: Vec<SessionVersionConfig>,
}

impl SessionClassConfig {
    fn single(windows: Vec<SessionWindowConfig>) -> Self {
        Self {
            versions: vec![SessionVersionConfig {
                effective_from: None,
                windows,
            }],
        }
    }
}

/// Trading-session tables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CalendarConfig {
    /// Session classes by name.
    pub classes: BTreeMap<String, SessionClassConfig>,
    /// Product code (e.g. `IF`, `RB`) to class name.
    pub products: BTreeMap<String, String>,
    /// Class for products missing from `products`.
    pub default_class: Option<String>,
    /// Ticks this close before a window opens or at/after it closes are folded
    /// into the window's first/last bucket. 0 disables folding.
    pub edge_grace_secs: u32,
}

impl Default for CalendarConfig {
    fn default() -> Self {
        Self::china_futures()
    }
}

impl CalendarConfig {
    /// Trading hours of the Chinese futures exchanges.
    pub fn china_futures() -> Self {
        let day = || {
            vec![
                SessionWindowConfig::new("09:00", "10:15"),
                SessionWindowConfig::new("10:30", "11:30"),
                SessionWindowConfig::new("13:30", "15:00"),
            ]
        };
        let with_night = |end: &str| {
            let mut windows = day();
            windows.push(SessionWindowConfig::new("21:00", end));
            SessionClassConfig::single(windows)
        };

        let mut classes = BTreeMap::new();
        classes.insert(
            "cffex_index".to_string(),
            SessionClassConfig::single(vec![
                SessionWindowConfig::new("09:30", "11:30"),
                SessionWindowConfig::new("13:00", "15:00"),
            ]),
        );
        classes.insert(
            "cffex_bond".to_string(),
            SessionClassConfig {
                versions: vec![
                    SessionVersionConfig {
                        effective_from: None,
                        windows: vec![
                            SessionWindowConfig::new("09:15", "11:30"),
                            SessionWindowConfig::new("13:00", "15:15"),
                        ],
                    },
                    SessionVersionConfig {
                        effective_from: NaiveDate::from_ymd_opt(2020, 7, 20),
                        windows: vec![
                            SessionWindowConfig::new("09:30", "11:30"),
                            SessionWindowConfig::new("13:00", "15:15"),
                        ],
                    },
                ],
            },
        );
        classes.insert("commodity".to_string(), SessionClassConfig::single(day()));
        classes.insert("commodity_night_2300".to_string(), with_night("23:00"));
        classes.insert("commodity_night_0100".to_string(), with_night("01:00"));
        classes.insert("commodity_night_0230".to_string(), with_night("02:30"));

        let table: [(&str, &[&str]); 6] = [
            ("cffex_index", &["IF", "IH", "IC", "IM"]),
            ("cffex_bond", &["T", "TF", "TS", "TL"]),
            ("commodity", &["AP", "CJ", "JD", "LH", "WR", "PK", "SI", "LC"]),
            (
                "commodity_night_2300",
                &[
                    "RB", "HC", "BU", "RU", "FU", "SP", "NR", "LU", "BR", "A", "B", "M", "Y", "P",
                    "C", "CS", "I", "J", "JM", "L", "V", "PP", "EG", "EB", "PG", "RR", "TA", "MA",
                    "SR", "CF", "RM", "OI", "FG", "SA", "ZC", "SF", "SM", "UR", "PF", "PX", "SH",
                ],
            ),
            (
                "commodity_night_0100",
                &["CU", "AL", "ZN", "PB", "NI", "SN", "SS", "AO", "BC"],
            ),
            ("commodity_night_0230", &["AU", "AG", "SC"]),
        ];
        let mut products = BTreeMap::new();
        for (class, codes) in table {
            for code in codes {
                products.insert(code.to_string(), class.to_string());
            }
        }

        Self {
            classes,
            products,
            default_class: None,
            edge_grace_secs: 0,
        }
    }
}

/// What to do with in-session minutes that received no ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EmptyBucketPolicy {
    /// Emit a flat zero-volume bar at the previous close.
    #[default]
    ForwardFill,
    /// Emit nothing.
    Omit,
}

impl FromStr for EmptyBucketPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "forward-fill" | "ffill" => Ok(EmptyBucketPolicy::ForwardFill),
            "omit" => Ok(EmptyBucketPolicy::Omit),
            other => Err(Error::config(format!("unknown empty-bucket policy: {other}"))),
        }
    }
}

/// Bar aggregation configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregationConfig {
    pub empty_bucket_policy: EmptyBucketPolicy,
}

/// Where bars are written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SinkKind {
    /// One CSV file per symbol and trading day.
    #[default]
    Csv,
    /// SQLite table keyed by (symbol, bar_start).
    Sqlite,
}

/// Retry policy for sink writes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: usize,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 100,
            max_delay_ms: 2_000,
        }
    }
}

/// Output sink configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SinkConfig {
    pub kind: SinkKind,
    /// Directory for CSV output.
    pub output_dir: PathBuf,
    /// SQLite database file.
    pub database_path: PathBuf,
    /// How long SQLite waits on a locked database (ms).
    pub busy_timeout_ms: u64,
    pub retry: RetryConfig,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            kind: SinkKind::Csv,
            output_dir: PathBuf::from("."),
            database_path: PathBuf::from("bars.db"),
            busy_timeout_ms: 5_000,
            retry: RetryConfig::default(),
        }
    }
}

/// Worker pool configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Number of parallel workers (0 = auto).
    pub workers: usize,
}
