//! `tickbar`: aggregate futures L2 tick files into 1-minute bars.
//!
//! Usage:
//!   tickbar --file data/TAQ_IF2309_202309.csv --output-dir bars/
//!   tickbar --file data/ctp/ --format ctp --to-db --db bars.db --workers 4
//!   tickbar --file ticks.csv --contract rb2401 --date 20240102 --fill-policy omit
//!
//! Exit status: 0 success, 2 partial failure, 1 hard failure.

use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use clap::Parser;
use std::path::PathBuf;
use tickbar_core::config::{EmptyBucketPolicy, SinkKind, TickFormat};
use tickbar_core::Config;
use tickbar_pipeline::{build_sink, unit_specs, BatchRunner};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "tickbar", version)]
#[command(about = "Aggregate futures Level-2 tick files into 1-minute OHLCV bars")]
struct Cli {
    /// Tick file or directory of *.csv files (repeatable)
    #[arg(short, long = "file", value_name = "PATH", required = true)]
    files: Vec<PathBuf>,

    /// Trading day for rows whose timestamps carry no date (YYYYMMDD)
    #[arg(short, long, value_parser = parse_day)]
    date: Option<NaiveDate>,

    /// Only keep these symbols (repeatable, comma separated)
    #[arg(short, long = "symbol", value_name = "CODE", value_delimiter = ',')]
    symbols: Vec<String>,

    /// Symbol for files whose rows do not carry one
    #[arg(long, value_name = "CODE")]
    contract: Option<String>,

    /// Tick layout: taq-l2 or ctp
    #[arg(long)]
    format: Option<TickFormat>,

    /// Write bars to SQLite instead of CSV files
    #[arg(long)]
    to_db: bool,

    /// SQLite database path
    #[arg(long, value_name = "PATH", env = "TICKBAR_DB")]
    db: Option<PathBuf>,

    /// Directory for CSV output
    #[arg(short, long, value_name = "DIR")]
    output_dir: Option<PathBuf>,

    /// JSON configuration file
    #[arg(short, long, value_name = "JSON", env = "TICKBAR_CONFIG")]
    config: Option<PathBuf>,

    /// Parallel workers (0 = one per CPU)
    #[arg(short, long)]
    workers: Option<usize>,

    /// Empty minutes: forward-fill or omit
    #[arg(long, value_name = "POLICY")]
    fill_policy: Option<EmptyBucketPolicy>,

    /// Write the JSON run report here
    #[arg(long, value_name = "PATH")]
    report: Option<PathBuf>,

    /// Debug logging
    #[arg(long)]
    debug: bool,
}

fn parse_day(s: &str) -> std::result::Result<NaiveDate, String> {
    NaiveDate::parse_from_str(s, "%Y%m%d")
        .or_else(|_| NaiveDate::parse_from_str(s, "%Y-%m-%d"))
        .map_err(|e| format!("expected YYYYMMDD: {e}"))
}

impl Cli {
    /// Config file (or defaults) with command-line overrides applied.
    fn load_config(&self) -> Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::from_json_file(path)
                .with_context(|| format!("Failed to load config: {}", path.display()))?,
            None => Config::default(),
        };

        if let Some(format) = self.format {
            config.ingest.format = format;
        }
        if let Some(day) = self.date {
            config.ingest.trading_day = Some(day);
        }
        if !self.symbols.is_empty() {
            config.ingest.symbols = self.symbols.clone();
        }
        if let Some(contract) = &self.contract {
            config.ingest.contract = Some(contract.clone());
        }
        if let Some(policy) = self.fill_policy {
            config.aggregation.empty_bucket_policy = policy;
        }
        if let Some(workers) = self.workers {
            config.run.workers = workers;
        }
        if self.to_db {
            config.sink.kind = SinkKind::Sqlite;
        }
        if let Some(db) = &self.db {
            config.sink.database_path = db.clone();
        }
        if let Some(dir) = &self.output_dir {
            config.sink.output_dir = dir.clone();
        }

        config.validate()?;
        Ok(config)
    }
}

fn init_logging(debug: bool) {
    let default = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn run(cli: &Cli) -> Result<i32> {
    let config = cli.load_config()?;
    let files = tickbar_ingestion::expand_inputs(&cli.files).context("Failed to list input files")?;
    if files.is_empty() {
        bail!("no input files found");
    }
    let specs = unit_specs(&files, config.ingest.contract.as_deref());

    let sink = build_sink(&config.sink)?;
    info!(
        files = files.len(),
        format = %config.ingest.format,
        sink = sink.name(),
        "Aggregating ticks"
    );

    let runner = BatchRunner::new(config, sink)?;
    let report = runner.run(&specs)?;

    for unit in &report.units {
        if let Some(err) = &unit.error {
            error!(path = %unit.path.display(), error = %err, "Unit failed");
        }
    }
    if let Some(path) = &cli.report {
        report.write_json(path)?;
        info!(path = %path.display(), "Run report written");
    }

    Ok(report.status.exit_code())
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.debug);

    let code = match run(&cli) {
        Ok(code) => code,
        Err(e) => {
            error!("{e:#}");
            1
        }
    };
    std::process::exit(code);
}
