//! Data ingestion and normalization for the tickbar engine.
//!
//! This crate handles:
//! - Reading delimited tick files
//! - Normalizing exchange row layouts into canonical ticks
//! - Tick cleaning and per-tick volume derivation
//! - Minute bar building against the session calendar

pub mod bar_builder;
pub mod cleaner;
pub mod normalizer;
pub mod reader;

pub use bar_builder::{BarBuilder, BuilderStats};
pub use cleaner::{CleanedTick, CleanerStats, TickCleaner};
pub use normalizer::{CtpParser, Normalizer, ParseContext, ParseTick, TaqL2Parser};
pub use reader::{expand_inputs, symbol_from_path, TickReader};
