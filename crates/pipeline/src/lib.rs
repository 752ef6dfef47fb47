//! Unit processing and bar persistence for the tickbar engine.
//!
//! A unit is one input file. Units run in parallel; each reads, cleans and
//! aggregates its ticks on its own, then replaces its partitions in the sink.

pub mod emitter;
pub mod retry;
pub mod runner;
pub mod unit;

pub use emitter::{BarSink, CsvSink, Emitter, FlushSummary, MemorySink, SqliteSink};
pub use retry::{Exhausted, RetryPolicy};
pub use runner::{build_sink, unit_specs, BatchRunner, RunReport, RunStatus, RunTotals};
pub use unit::{process_unit, SymbolPipeline, UnitEnv, UnitReport, UnitSpec, UnitStats, UnitStatus};
