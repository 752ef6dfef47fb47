//! One unit of work: a tick file read, cleaned, aggregated and written.

use crate::emitter::{BarSink, Emitter};
use crate::retry::RetryPolicy;
use serde::Serialize;
use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tickbar_calendar::SessionCalendar;
use tickbar_core::{Bar, Config, RejectCounts, Result, Tick};
use tickbar_ingestion::{BarBuilder, ParseContext, TickCleaner, TickReader};
use tracing::{debug, info, warn};

/// An input file and the symbol its rows default to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnitSpec {
    pub path: PathBuf,
    pub symbol: Option<String>,
}

/// Outcome of a unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitStatus {
    /// Written with no damaged rows.
    Success,
    /// Written, but some rows were rejected as damaged.
    Partial,
    /// Nothing written.
    Failed,
}

/// Counts reported for a unit.
#[derive(Debug, Clone, Default, Serialize)]
pub struct UnitStats {
    pub rows_read: u64,
    pub ticks_parsed: u64,
    pub ticks_accepted: u64,
    pub counter_resets: u64,
    /// Exchange day boundaries crossed inside the file.
    pub day_starts: u64,
    pub bars_emitted: u64,
    pub bars_filled: u64,
    pub rejects: RejectCounts,
    pub partitions: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct UnitReport {
    pub path: PathBuf,
    pub symbol: Option<String>,
    pub status: UnitStatus,
    pub error: Option<String>,
    pub stats: UnitStats,
    pub elapsed_ms: u64,
}

/// Shared, read-only resources a unit runs against.
pub struct UnitEnv<'a> {
    pub config: &'a Config,
    pub calendar: &'a Arc<SessionCalendar>,
    /// Upper-cased symbol filter; empty keeps everything.
    pub symbols: &'a BTreeSet<String>,
    pub sink: &'a dyn BarSink,
    pub retry: &'a RetryPolicy,
}

/// Cleaner and bar builder of one symbol.
pub struct SymbolPipeline {
    cleaner: TickCleaner,
    builder: BarBuilder,
}

impl SymbolPipeline {
    pub fn new(symbol: &str, env: &UnitEnv<'_>) -> Result<Self> {
        let sessions = env.calendar.class_for(symbol)?;
        Ok(Self {
            cleaner: TickCleaner::new(&env.config.cleaner).with_sessions(sessions),
            builder: BarBuilder::new(
                symbol,
                Arc::clone(env.calendar),
                env.config.aggregation.empty_bucket_policy,
            )?,
        })
    }

    pub fn push(&mut self, tick: Tick, out: &mut Vec<Bar>) {
        if let Ok(cleaned) = self.cleaner.clean(tick) {
            self.builder.push(&cleaned, out);
        }
    }

    pub fn finish(&mut self, out: &mut Vec<Bar>) {
        self.builder.finish(out);
    }

    fn collect_stats(&self, stats: &mut UnitStats) {
        let cleaner = self.cleaner.stats();
        let builder = self.builder.stats();
        stats.ticks_accepted += cleaner.accepted;
        stats.counter_resets += cleaner.counter_resets;
        stats.day_starts += cleaner.day_starts;
        stats.bars_emitted += builder.bars_emitted;
        stats.bars_filled += builder.bars_filled;
        stats.rejects.merge(&cleaner.rejects);
        stats.rejects.merge(&builder.rejects);
    }
}

/// Run one unit to completion. Never panics on bad input; failures land in
/// the report.
pub fn process_unit(spec: &UnitSpec, env: &UnitEnv<'_>) -> UnitReport {
    let started = Instant::now();
    let mut stats = UnitStats::default();
    let result = run_unit(spec, env, &mut stats);

    let status = match &result {
        Err(_) => UnitStatus::Failed,
        Ok(()) if stats.rejects.faults() > 0 => UnitStatus::Partial,
        Ok(()) => UnitStatus::Success,
    };
    let elapsed_ms = started.elapsed().as_millis() as u64;

    match &result {
        Ok(()) => info!(
            path = %spec.path.display(),
            ?status,
            rows = stats.rows_read,
            parsed = stats.ticks_parsed,
            accepted = stats.ticks_accepted,
            resets = stats.counter_resets,
            day_starts = stats.day_starts,
            bars = stats.bars_emitted,
            filled = stats.bars_filled,
            partitions = stats.partitions,
            rejects = %stats.rejects,
            elapsed_ms,
            "Unit finished"
        ),
        Err(e) => warn!(
            path = %spec.path.display(),
            error = %e,
            rows = stats.rows_read,
            rejects = %stats.rejects,
            "Unit failed"
        ),
    }

    UnitReport {
        path: spec.path.clone(),
        symbol: spec.symbol.clone(),
        status,
        error: result.err().map(|e| e.to_string()),
        stats,
        elapsed_ms,
    }
}

fn run_unit(spec: &UnitSpec, env: &UnitEnv<'_>, stats: &mut UnitStats) -> Result<()> {
    let mut reader = TickReader::open(&spec.path, &env.config.ingest)?;
    debug!(path = %spec.path.display(), format = %reader.normalizer().format(), "Reading ticks");

    let ctx = ParseContext {
        default_symbol: spec.symbol.as_deref(),
        trading_day: env.config.ingest.trading_day,
        symbols: env.symbols,
        calendar: env.calendar,
    };

    let mut pipelines: BTreeMap<String, SymbolPipeline> = BTreeMap::new();
    let mut emitter = Emitter::new();
    let read = read_ticks(&mut reader, &ctx, env, &mut pipelines, &mut emitter, stats);

    // counts are reported for failed units too
    stats.rows_read = reader.rows_read();
    for pipeline in pipelines.values() {
        pipeline.collect_stats(stats);
    }
    read?;

    let summary = emitter.flush(env.sink, env.retry)?;
    stats.partitions = summary.partitions;
    Ok(())
}

/// Drive every row of the file through its symbol's pipeline into `emitter`.
fn read_ticks(
    reader: &mut TickReader,
    ctx: &ParseContext<'_>,
    env: &UnitEnv<'_>,
    pipelines: &mut BTreeMap<String, SymbolPipeline>,
    emitter: &mut Emitter,
    stats: &mut UnitStats,
) -> Result<()> {
    let mut bars = Vec::new();
    while let Some(row) = reader.next_tick(ctx)? {
        let tick = match row {
            Ok(tick) => tick,
            Err(e) => {
                debug!(reason = %e.reason, detail = %e.detail, "Row rejected");
                stats.rejects.record(e.reason);
                continue;
            }
        };
        stats.ticks_parsed += 1;

        let pipeline = match pipelines.entry(tick.symbol.clone()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => entry.insert(SymbolPipeline::new(&tick.symbol, env)?),
        };
        pipeline.push(tick, &mut bars);
        for bar in bars.drain(..) {
            emitter.emit(bar)?;
        }
    }

    for pipeline in pipelines.values_mut() {
        pipeline.finish(&mut bars);
        for bar in bars.drain(..) {
            emitter.emit(bar)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emitter::MemorySink;
    use chrono::NaiveDate;
    use std::io::Write;
    use tickbar_core::{PartitionKey, RejectReason};

    fn write_file(dir: &std::path::Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(body.as_bytes()).unwrap();
        path
    }

    fn run(path: PathBuf, symbol: Option<&str>, config: &Config, sink: &MemorySink) -> UnitReport {
        let calendar = Arc::new(SessionCalendar::from_config(&config.calendar).unwrap());
        let symbols = BTreeSet::new();
        let env = UnitEnv {
            config,
            calendar: &calendar,
            symbols: &symbols,
            sink,
            retry: &RetryPolicy::none(),
        };
        process_unit(
            &UnitSpec {
                path,
                symbol: symbol.map(str::to_string),
            },
            &env,
        )
    }

    #[test]
    fn test_unit_success() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(
            dir.path(),
            "TAQ_IF2309_202309.csv",
            "TradingDate,TradingTime,LastPrice,TotalVolume\n\
             20230901,09:30:00,4000,10\n\
             20230901,09:30:45,4002,15\n\
             20230901,09:31:10,3999,20\n\
             20230901,09:31:10,3999,20\n\
             20230901,12:00:00,3999,21\n",
        );
        let mut config = Config::default();
        config.aggregation.empty_bucket_policy = tickbar_core::config::EmptyBucketPolicy::Omit;
        let sink = MemorySink::new();
        let report = run(path, Some("IF2309"), &config, &sink);

        assert_eq!(report.status, UnitStatus::Success, "{:?}", report.error);
        assert_eq!(report.stats.rows_read, 5);
        assert_eq!(report.stats.ticks_parsed, 5);
        assert_eq!(report.stats.ticks_accepted, 4);
        assert_eq!(report.stats.bars_emitted, 2);
        assert_eq!(report.stats.rejects.get(RejectReason::DuplicateTick), 1);
        assert_eq!(report.stats.rejects.get(RejectReason::OutOfSession), 1);
        assert_eq!(report.stats.partitions, 1);

        let key = PartitionKey::new("IF2309", NaiveDate::from_ymd_opt(2023, 9, 1).unwrap());
        let bars = sink.partition(&key).unwrap();
        assert_eq!(bars.len(), 2);
        assert_eq!(bars[0].volume, 5);
        assert_eq!(bars[1].volume, 5);
    }

    #[test]
    fn test_unit_partial_on_damaged_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(
            dir.path(),
            "ticks.csv",
            "Symbol,TradingDate,TradingTime,LastPrice,TotalVolume\n\
             IF2309,20230901,09:30:00,4000,10\n\
             IF2309,20230901,09:30:10,x,11\n\
             IF2309,20230901,09:30:20,4001,12\n",
        );
        let sink = MemorySink::new();
        let report = run(path, None, &Config::default(), &sink);
        assert_eq!(report.status, UnitStatus::Partial);
        assert_eq!(report.stats.rejects.get(RejectReason::Parse), 1);
        assert_eq!(sink.bar_count(), report.stats.bars_emitted as usize);
    }

    #[test]
    fn test_unit_fails_without_calendar() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(
            dir.path(),
            "ticks.csv",
            "Symbol,TradingDate,TradingTime,LastPrice,TotalVolume\n\
             IF2309,20230901,09:30:00,4000,10\n\
             ZZ2401,20230901,09:30:00,10,1\n",
        );
        let sink = MemorySink::new();
        let report = run(path, None, &Config::default(), &sink);
        assert_eq!(report.status, UnitStatus::Failed);
        assert!(report.error.unwrap().contains("ZZ2401"));
        // nothing of the unit is written, but its counts are reported
        assert_eq!(sink.bar_count(), 0);
        assert_eq!(report.stats.rows_read, 2);
        assert_eq!(report.stats.ticks_accepted, 1);
    }

    #[test]
    fn test_unit_restarts_volume_each_exchange_day() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(
            dir.path(),
            "TAQ_IF2309_202309.csv",
            "TradingDate,TradingTime,LastPrice,TotalVolume\n\
             20230901,09:30:00,4000,10\n\
             20230901,14:59:00,4002,40\n\
             20230904,09:30:00,4003,55\n\
             20230904,09:31:00,4004,60\n",
        );
        let mut config = Config::default();
        config.aggregation.empty_bucket_policy = tickbar_core::config::EmptyBucketPolicy::Omit;
        let sink = MemorySink::new();
        let report = run(path, None, &config, &sink);
        assert_eq!(report.status, UnitStatus::Success, "{:?}", report.error);
        assert_eq!(report.stats.day_starts, 1);
        assert_eq!(report.stats.counter_resets, 0);

        let key = PartitionKey::new("IF2309", NaiveDate::from_ymd_opt(2023, 9, 4).unwrap());
        let volumes: Vec<u64> = sink.partition(&key).unwrap().iter().map(|b| b.volume).collect();
        assert_eq!(volumes, [55, 5]);
    }

    #[test]
    fn test_unit_fails_on_missing_file() {
        let sink = MemorySink::new();
        let report = run(PathBuf::from("/nonexistent/ticks.csv"), None, &Config::default(), &sink);
        assert_eq!(report.status, UnitStatus::Failed);
    }
}
