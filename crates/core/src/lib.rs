//! Core types and configuration for the tickbar engine.
//!
//! This crate provides shared types used across all other crates:
//! - Canonical ticks and 1-minute bars
//! - Configuration structures
//! - The unit-level error type and per-row reject taxonomy

pub mod config;
pub mod error;
pub mod types;

pub use config::Config;
pub use error::{Error, RecordError, RejectCounts, RejectReason, Result};
pub use types::*;
