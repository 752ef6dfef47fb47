//! Bar buffering and persistence.
//!
//! The emitter collects a unit's bars per (symbol, trading day) partition and
//! writes each partition through a [`BarSink`] as one replace over the span the
//! unit covers: stored bars of the partition from the unit's first bar start to
//! its last are removed and the new bars inserted. Re-running a file never
//! duplicates rows, and a partition split across files (a day session in one,
//! the night session in another) keeps both halves whatever the flush order.

use crate::retry::RetryPolicy;
use anyhow::Context;
use parking_lot::Mutex;
use rusqlite::{params, Connection, ErrorCode, OpenFlags};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use rust_decimal::Decimal;
use tickbar_core::{Bar, Error, PartitionKey, Result};
use tracing::{debug, info};

/// Destination for finished partitions. Must be safe to share across workers.
pub trait BarSink: Send + Sync {
    /// Replace the stored bars of `key` that start within
    /// `[bars[0].bar_start, bars[last].bar_start]` with `bars`; stored bars of
    /// the partition outside that span are kept. `bars` is ascending by start.
    /// Returns rows written.
    fn replace_span(&self, key: &PartitionKey, bars: &[Bar]) -> Result<usize>;

    fn name(&self) -> &'static str;
}

/// Totals of one flush.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushSummary {
    pub partitions: usize,
    pub rows: usize,
}

/// Per-unit bar buffer.
#[derive(Debug, Default)]
pub struct Emitter {
    partitions: BTreeMap<PartitionKey, Vec<Bar>>,
}

impl Emitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffer a bar. Bars of one partition must arrive in strictly ascending
    /// start order and satisfy the OHLC invariant.
    pub fn emit(&mut self, bar: Bar) -> Result<()> {
        if !bar.is_consistent() {
            return Err(Error::data(format!(
                "inconsistent bar {} at {}: O={} H={} L={} C={}",
                bar.symbol, bar.bar_start, bar.open, bar.high, bar.low, bar.close
            )));
        }
        let bars = self.partitions.entry(bar.key()).or_default();
        if let Some(last) = bars.last() {
            if bar.bar_start <= last.bar_start {
                return Err(Error::data(format!(
                    "bar {} at {} does not follow {}",
                    bar.symbol, bar.bar_start, last.bar_start
                )));
            }
        }
        bars.push(bar);
        Ok(())
    }

    pub fn partition_count(&self) -> usize {
        self.partitions.len()
    }

    pub fn bar_count(&self) -> usize {
        self.partitions.values().map(Vec::len).sum()
    }

    /// Write every partition in key order.
    pub fn flush(self, sink: &dyn BarSink, retry: &RetryPolicy) -> Result<FlushSummary> {
        let mut summary = FlushSummary::default();
        for (key, bars) in &self.partitions {
            let rows = retry
                .run(|_| sink.replace_span(key, bars))
                .map_err(|exhausted| Error::SinkWrite {
                    partition: key.to_string(),
                    attempts: exhausted.attempts,
                    message: exhausted.error.to_string(),
                })?;
            debug!(sink = sink.name(), partition = %key, rows, "Partition written");
            summary.partitions += 1;
            summary.rows += rows;
        }
        Ok(summary)
    }
}

/// `stored` bars outside the span of `bars`, merged with `bars` in start order.
fn merge_span(mut stored: Vec<Bar>, bars: &[Bar]) -> Vec<Bar> {
    let (Some(first), Some(last)) = (bars.first(), bars.last()) else {
        return stored;
    };
    let (from, to) = (first.bar_start, last.bar_start);
    stored.retain(|bar| bar.bar_start < from || bar.bar_start > to);
    stored.extend_from_slice(bars);
    stored.sort_by_key(|bar| bar.bar_start);
    stored
}

fn csv_err(e: csv::Error) -> Error {
    if !e.is_io_error() {
        return Error::csv(e.to_string());
    }
    match e.into_kind() {
        csv::ErrorKind::Io(io) => Error::Io(io),
        other => Error::csv(format!("{other:?}")),
    }
}

/// One CSV file per partition: `{dir}/{SYMBOL}_{YYYYMMDD}_1min.csv`.
///
/// Writes merge with the file already on disk, so they are serialized through
/// one lock per sink.
#[derive(Debug)]
pub struct CsvSink {
    output_dir: PathBuf,
    write_lock: Mutex<()>,
}

static TEMP_SEQ: AtomicU64 = AtomicU64::new(0);

impl CsvSink {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn partition_path(&self, key: &PartitionKey) -> PathBuf {
        self.output_dir.join(format!(
            "{}_{}_1min.csv",
            key.symbol.to_ascii_uppercase(),
            key.trading_day.format("%Y%m%d")
        ))
    }

    /// Bars stored for a partition, empty when it has no file yet.
    pub fn read_partition(&self, key: &PartitionKey) -> Result<Vec<Bar>> {
        let path = self.partition_path(key);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let mut reader = csv::Reader::from_path(&path).map_err(csv_err)?;
        let bars = reader
            .deserialize()
            .collect::<std::result::Result<Vec<Bar>, _>>()
            .map_err(|e| Error::csv(format!("{}: {e}", path.display())))?;
        Ok(bars)
    }

    fn write_file(path: &Path, bars: &[Bar]) -> Result<()> {
        let mut writer = csv::Writer::from_path(path).map_err(csv_err)?;
        for bar in bars {
            writer.serialize(bar).map_err(csv_err)?;
        }
        writer.flush()?;
        Ok(())
    }
}

impl BarSink for CsvSink {
    fn replace_span(&self, key: &PartitionKey, bars: &[Bar]) -> Result<usize> {
        let _guard = self.write_lock.lock();
        std::fs::create_dir_all(&self.output_dir)?;
        let path = self.partition_path(key);
        let merged = merge_span(self.read_partition(key)?, bars);
        let temp = self.output_dir.join(format!(
            ".{}.{}.{}.tmp",
            key,
            std::process::id(),
            TEMP_SEQ.fetch_add(1, Ordering::Relaxed)
        ));

        if let Err(e) = Self::write_file(&temp, &merged) {
            let _ = std::fs::remove_file(&temp);
            return Err(e);
        }
        std::fs::rename(&temp, &path)?;
        Ok(bars.len())
    }

    fn name(&self) -> &'static str {
        "csv"
    }
}

const BAR_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS bar_1min (
    symbol TEXT NOT NULL,
    trading_day TEXT NOT NULL,
    bar_start TEXT NOT NULL,
    open TEXT NOT NULL,
    high TEXT NOT NULL,
    low TEXT NOT NULL,
    close TEXT NOT NULL,
    volume INTEGER NOT NULL,
    turnover TEXT NOT NULL,
    tick_count INTEGER NOT NULL,
    buy_volume INTEGER NOT NULL,
    sell_volume INTEGER NOT NULL,
    total_volume INTEGER NOT NULL,
    total_turnover TEXT,
    open_interest INTEGER,
    position_change INTEGER,
    bid_price1 TEXT,
    bid_price2 TEXT,
    bid_price3 TEXT,
    bid_price4 TEXT,
    bid_price5 TEXT,
    bid_volume1 INTEGER,
    bid_volume2 INTEGER,
    bid_volume3 INTEGER,
    bid_volume4 INTEGER,
    bid_volume5 INTEGER,
    ask_price1 TEXT,
    ask_price2 TEXT,
    ask_price3 TEXT,
    ask_price4 TEXT,
    ask_price5 TEXT,
    ask_volume1 INTEGER,
    ask_volume2 INTEGER,
    ask_volume3 INTEGER,
    ask_volume4 INTEGER,
    ask_volume5 INTEGER,
    order_diff INTEGER NOT NULL,
    order_rate TEXT NOT NULL,
    is_night INTEGER NOT NULL,
    filled INTEGER NOT NULL,
    UNIQUE (symbol, bar_start)
);

CREATE INDEX IF NOT EXISTS idx_bar_1min_partition ON bar_1min(symbol, trading_day);
"#;

const INSERT_BAR: &str = "INSERT INTO bar_1min (
    symbol, trading_day, bar_start, open, high, low, close, volume, turnover,
    tick_count, buy_volume, sell_volume, total_volume, total_turnover,
    open_interest, position_change,
    bid_price1, bid_price2, bid_price3, bid_price4, bid_price5,
    bid_volume1, bid_volume2, bid_volume3, bid_volume4, bid_volume5,
    ask_price1, ask_price2, ask_price3, ask_price4, ask_price5,
    ask_volume1, ask_volume2, ask_volume3, ask_volume4, ask_volume5,
    order_diff, order_rate, is_night, filled
) VALUES (
    ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16,
    ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26,
    ?27, ?28, ?29, ?30, ?31, ?32, ?33, ?34, ?35, ?36,
    ?37, ?38, ?39, ?40
)";

const DAY_FORMAT: &str = "%Y-%m-%d";
const TS_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Lock contention maps to the retryable [`Error::Busy`]; everything else
/// fails the write outright.
fn db_err(e: rusqlite::Error) -> Error {
    match e.sqlite_error_code() {
        Some(ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) => Error::busy(e.to_string()),
        _ => Error::database(e.to_string()),
    }
}

fn text(d: Option<Decimal>) -> Option<String> {
    d.map(|d| d.to_string())
}

fn int(v: Option<u64>) -> Option<i64> {
    v.map(|v| v as i64)
}

/// SQLite table `bar_1min`, unique on (symbol, bar_start).
pub struct SqliteSink {
    conn: Mutex<Connection>,
}

impl SqliteSink {
    /// Open or create the database at `path`.
    pub fn open(path: &Path, busy_timeout: Duration) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.exists() && !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        let conn = Connection::open_with_flags(path, flags)
            .with_context(|| format!("Failed to open bar database: {}", path.display()))?;
        conn.busy_timeout(busy_timeout)?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;")?;
        conn.execute_batch(BAR_SCHEMA)?;

        info!(path = %path.display(), "Bar database opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn open_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(BAR_SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Rows and total volume stored for a partition.
    pub fn partition_totals(&self, key: &PartitionKey) -> Result<(usize, u64)> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(volume), 0) FROM bar_1min
             WHERE symbol = ?1 AND trading_day = ?2",
            params![key.symbol, key.trading_day.format(DAY_FORMAT).to_string()],
            |row| Ok((row.get::<_, i64>(0)? as usize, row.get::<_, i64>(1)? as u64)),
        )
        .map_err(db_err)
    }

    /// Close prices of a partition in time order.
    pub fn partition_closes(&self, key: &PartitionKey) -> Result<Vec<(String, String)>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT bar_start, close FROM bar_1min
                 WHERE symbol = ?1 AND trading_day = ?2 ORDER BY bar_start",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map(
                params![key.symbol, key.trading_day.format(DAY_FORMAT).to_string()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }
}

impl BarSink for SqliteSink {
    fn replace_span(&self, key: &PartitionKey, bars: &[Bar]) -> Result<usize> {
        let (Some(first), Some(last)) = (bars.first(), bars.last()) else {
            return Ok(0);
        };
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(db_err)?;
        let day = key.trading_day.format(DAY_FORMAT).to_string();

        // TS_FORMAT sorts lexicographically in time order
        tx.execute(
            "DELETE FROM bar_1min
             WHERE symbol = ?1 AND trading_day = ?2 AND bar_start BETWEEN ?3 AND ?4",
            params![
                key.symbol,
                day,
                first.bar_start.format(TS_FORMAT).to_string(),
                last.bar_start.format(TS_FORMAT).to_string(),
            ],
        )
        .map_err(db_err)?;

        {
            let mut stmt = tx.prepare_cached(INSERT_BAR).map_err(db_err)?;
            for bar in bars {
                stmt.execute(params![
                    bar.symbol,
                    day,
                    bar.bar_start.format(TS_FORMAT).to_string(),
                    bar.open.to_string(),
                    bar.high.to_string(),
                    bar.low.to_string(),
                    bar.close.to_string(),
                    bar.volume as i64,
                    bar.turnover.to_string(),
                    bar.tick_count,
                    bar.buy_volume as i64,
                    bar.sell_volume as i64,
                    bar.total_volume as i64,
                    text(bar.total_turnover),
                    int(bar.open_interest),
                    bar.position_change,
                    text(bar.bid_price1),
                    text(bar.bid_price2),
                    text(bar.bid_price3),
                    text(bar.bid_price4),
                    text(bar.bid_price5),
                    int(bar.bid_volume1),
                    int(bar.bid_volume2),
                    int(bar.bid_volume3),
                    int(bar.bid_volume4),
                    int(bar.bid_volume5),
                    text(bar.ask_price1),
                    text(bar.ask_price2),
                    text(bar.ask_price3),
                    text(bar.ask_price4),
                    text(bar.ask_price5),
                    int(bar.ask_volume1),
                    int(bar.ask_volume2),
                    int(bar.ask_volume3),
                    int(bar.ask_volume4),
                    int(bar.ask_volume5),
                    bar.order_diff,
                    bar.order_rate.to_string(),
                    bar.is_night,
                    bar.filled,
                ])
                .map_err(db_err)?;
            }
        }

        tx.commit().map_err(db_err)?;
        Ok(bars.len())
    }

    fn name(&self) -> &'static str {
        "sqlite"
    }
}

/// In-process sink.
#[derive(Debug, Default)]
pub struct MemorySink {
    partitions: Mutex<BTreeMap<PartitionKey, Vec<Bar>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn partition(&self, key: &PartitionKey) -> Option<Vec<Bar>> {
        self.partitions.lock().get(key).cloned()
    }

    pub fn keys(&self) -> Vec<PartitionKey> {
        self.partitions.lock().keys().cloned().collect()
    }

    pub fn bar_count(&self) -> usize {
        self.partitions.lock().values().map(Vec::len).sum()
    }
}

impl BarSink for MemorySink {
    fn replace_span(&self, key: &PartitionKey, bars: &[Bar]) -> Result<usize> {
        let mut partitions = self.partitions.lock();
        let stored = partitions.remove(key).unwrap_or_default();
        partitions.insert(key.clone(), merge_span(stored, bars));
        Ok(bars.len())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
