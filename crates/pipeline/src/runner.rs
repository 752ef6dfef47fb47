//! Batch execution of units on a bounded worker pool.

use crate::emitter::{BarSink, CsvSink, SqliteSink};
use crate::retry::RetryPolicy;
use crate::unit::{process_unit, UnitEnv, UnitReport, UnitSpec, UnitStatus};
use anyhow::Context;
use rayon::prelude::*;
use serde::Serialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tickbar_calendar::SessionCalendar;
use tickbar_core::config::{SinkConfig, SinkKind};
use tickbar_core::{Config, Error, RejectCounts, Result};
use tickbar_ingestion::symbol_from_path;
use tracing::{info, warn};

/// Worst outcome across the units of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    PartialFailure,
    HardFailure,
}

impl RunStatus {
    pub fn from_units(units: &[UnitReport]) -> Self {
        if units.is_empty() || units.iter().all(|u| u.status == UnitStatus::Failed) {
            RunStatus::HardFailure
        } else if units.iter().any(|u| u.status != UnitStatus::Success) {
            RunStatus::PartialFailure
        } else {
            RunStatus::Success
        }
    }

    /// Process exit code: 0 success, 2 partial failure, 1 hard failure.
    pub fn exit_code(self) -> i32 {
        match self {
            RunStatus::Success => 0,
            RunStatus::PartialFailure => 2,
            RunStatus::HardFailure => 1,
        }
    }
}

/// Counts summed over every unit of a run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunTotals {
    pub units: usize,
    pub succeeded: usize,
    pub partial: usize,
    pub failed: usize,
    pub rows_read: u64,
    pub ticks_accepted: u64,
    pub bars_emitted: u64,
    pub bars_filled: u64,
    pub partitions: usize,
    pub rejects: RejectCounts,
}

impl RunTotals {
    fn from_units(units: &[UnitReport]) -> Self {
        let mut totals = RunTotals {
            units: units.len(),
            ..RunTotals::default()
        };
        for unit in units {
            match unit.status {
                UnitStatus::Success => totals.succeeded += 1,
                UnitStatus::Partial => totals.partial += 1,
                UnitStatus::Failed => totals.failed += 1,
            }
            totals.rows_read += unit.stats.rows_read;
            totals.ticks_accepted += unit.stats.ticks_accepted;
            totals.bars_emitted += unit.stats.bars_emitted;
            totals.bars_filled += unit.stats.bars_filled;
            totals.partitions += unit.stats.partitions;
            totals.rejects.merge(&unit.stats.rejects);
        }
        totals
    }
}

/// Result of a run, units in input order.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub status: RunStatus,
    pub totals: RunTotals,
    pub elapsed_ms: u64,
    pub units: Vec<UnitReport>,
}

impl RunReport {
    pub fn write_json(&self, path: &Path) -> anyhow::Result<()> {
        let text = serde_json::to_string_pretty(self)?;
        std::fs::write(path, text)
            .with_context(|| format!("Failed to write run report: {}", path.display()))?;
        Ok(())
    }
}

/// One unit per input file. The unit symbol is `contract` if given, else
/// whatever the file name names.
pub fn unit_specs(files: &[PathBuf], contract: Option<&str>) -> Vec<UnitSpec> {
    files
        .iter()
        .map(|path| UnitSpec {
            path: path.clone(),
            symbol: contract
                .map(str::to_string)
                .or_else(|| symbol_from_path(path)),
        })
        .collect()
}

/// Open the sink a configuration names.
pub fn build_sink(config: &SinkConfig) -> anyhow::Result<Arc<dyn BarSink>> {
    let sink: Arc<dyn BarSink> = match config.kind {
        SinkKind::Csv => Arc::new(CsvSink::new(&config.output_dir)),
        SinkKind::Sqlite => Arc::new(SqliteSink::open(
            &config.database_path,
            Duration::from_millis(config.busy_timeout_ms),
        )?),
    };
    Ok(sink)
}

/// Runs units in parallel against one calendar and one sink.
pub struct BatchRunner {
    config: Config,
    calendar: Arc<SessionCalendar>,
    sink: Arc<dyn BarSink>,
    retry: RetryPolicy,
    symbols: BTreeSet<String>,
}

impl BatchRunner {
    pub fn new(config: Config, sink: Arc<dyn BarSink>) -> Result<Self> {
        config.validate()?;
        let calendar = Arc::new(SessionCalendar::from_config(&config.calendar)?);
        let retry = RetryPolicy::from_config(&config.sink.retry);
        let symbols = config
            .ingest
            .symbols
            .iter()
            .map(|s| s.trim().to_ascii_uppercase())
            .filter(|s| !s.is_empty())
            .collect();

        Ok(Self {
            config,
            calendar,
            sink,
            retry,
            symbols,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn effective_workers(&self, units: usize) -> usize {
        let workers = match self.config.run.workers {
            0 => std::thread::available_parallelism().map_or(1, |n| n.get()),
            n => n,
        };
        workers.min(units).max(1)
    }

    /// Process every unit. A failing unit never stops the others.
    pub fn run(&self, units: &[UnitSpec]) -> Result<RunReport> {
        let started = Instant::now();
        let workers = self.effective_workers(units.len());
        info!(
            units = units.len(),
            workers,
            sink = self.sink.name(),
            "Starting run"
        );

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("tickbar-worker-{i}"))
            .build()
            .map_err(|e| Error::config(format!("cannot build worker pool: {e}")))?;

        let env = UnitEnv {
            config: &self.config,
            calendar: &self.calendar,
            symbols: &self.symbols,
            sink: self.sink.as_ref(),
            retry: &self.retry,
        };
        let reports: Vec<UnitReport> =
            pool.install(|| units.par_iter().map(|spec| process_unit(spec, &env)).collect());

        let status = RunStatus::from_units(&reports);
        let totals = RunTotals::from_units(&reports);
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match status {
            RunStatus::Success => info!(
                units = totals.units,
                bars = totals.bars_emitted,
                partitions = totals.partitions,
                elapsed_ms,
                "Run complete"
            ),
            _ => warn!(
                ?status,
                units = totals.units,
                failed = totals.failed,
                partial = totals.partial,
                bars = totals.bars_emitted,
                elapsed_ms,
                "Run complete with failures"
            ),
        }

        Ok(RunReport {
            status,
            totals,
            elapsed_ms,
            units: reports,
        })
    }
}
