//! Trading-session calendar for the tickbar engine.
//!
//! This crate handles:
//! - Session classes with versioned trading-hour templates
//! - Product code to session class resolution
//! - Locating a timestamp in its trading day and 1-minute bucket
//! - Enumerating the buckets of a trading day

pub mod session;

pub use session::{BucketLocation, Location, SessionClass, SessionTemplate, SessionWindow};

use chrono::{Datelike, Duration, NaiveDate, NaiveDateTime, NaiveTime, Weekday};
use std::collections::BTreeMap;
use std::sync::Arc;
use tickbar_core::config::CalendarConfig;
use tickbar_core::{product_code, Error, Result};
use tracing::debug;

/// Read-only session tables shared by every unit of a run.
#[derive(Debug, Clone)]
pub struct SessionCalendar {
    classes: BTreeMap<String, Arc<SessionClass>>,
    /// Upper-cased product code to class name.
    products: BTreeMap<String, String>,
    default_class: Option<String>,
    grace_ms: i64,
}

impl SessionCalendar {
    /// Build and validate the calendar.
    pub fn from_config(config: &CalendarConfig) -> Result<Self> {
        let mut classes = BTreeMap::new();
        for (name, class_config) in &config.classes {
            let class = SessionClass::from_config(name, class_config)?;
            classes.insert(name.clone(), Arc::new(class));
        }

        let mut products = BTreeMap::new();
        for (product, class) in &config.products {
            if !classes.contains_key(class) {
                return Err(Error::config(format!(
                    "product {product} maps to unknown session class {class}"
                )));
            }
            products.insert(product.to_ascii_uppercase(), class.clone());
        }

        if let Some(default_class) = &config.default_class {
            if !classes.contains_key(default_class) {
                return Err(Error::config(format!(
                    "default session class {default_class} is not configured"
                )));
            }
        }

        debug!(
            classes = classes.len(),
            products = products.len(),
            grace_secs = config.edge_grace_secs,
            "Session calendar built"
        );

        Ok(Self {
            classes,
            products,
            default_class: config.default_class.clone(),
            grace_ms: config.edge_grace_secs as i64 * 1_000,
        })
    }

    /// Class by name.
    pub fn class(&self, name: &str) -> Option<Arc<SessionClass>> {
        self.classes.get(name).cloned()
    }

    /// Session class of a symbol, through its product code.
    pub fn class_for(&self, symbol: &str) -> Result<Arc<SessionClass>> {
        let product = product_code(symbol);
        self.products
            .get(&product)
            .or(self.default_class.as_ref())
            .and_then(|name| self.class(name))
            .ok_or_else(|| Error::calendar_missing(symbol, product))
    }

    /// Locate a timestamp within an already resolved class.
    pub fn locate_in(&self, class: &SessionClass, ts: NaiveDateTime) -> Location {
        class.locate(ts, self.grace_ms)
    }

    /// Locate a timestamp for a class given by name.
    pub fn locate(&self, class: &str, ts: NaiveDateTime) -> Result<Location> {
        let class = self.named(class)?;
        Ok(self.locate_in(&class, ts))
    }

    /// Every bucket of a trading day for a class given by name.
    pub fn enumerate(&self, class: &str, trading_day: NaiveDate) -> Result<Vec<BucketLocation>> {
        Ok(self.named(class)?.enumerate(trading_day))
    }

    /// Complete a time-only timestamp for a class given by name.
    pub fn resolve_time(
        &self,
        class: &str,
        trading_day: NaiveDate,
        time: NaiveTime,
    ) -> Result<NaiveDateTime> {
        Ok(self.named(class)?.resolve_time(trading_day, time, self.grace_ms))
    }

    /// Complete a time-only timestamp for a symbol. Symbols without a class
    /// keep the trading day's date; the unit fails later when it needs buckets.
    pub fn resolve_time_for(
        &self,
        symbol: &str,
        trading_day: NaiveDate,
        time: NaiveTime,
    ) -> NaiveDateTime {
        match self.class_for(symbol) {
            Ok(class) => class.resolve_time(trading_day, time, self.grace_ms),
            Err(_) => trading_day.and_time(time),
        }
    }

    /// Calendar timestamp of a night-session time that was reported against
    /// the exchange day, the business day after the session opened. `None`
    /// when `time` is outside every night window of the symbol's class.
    pub fn night_time_for(
        &self,
        symbol: &str,
        exchange_day: NaiveDate,
        time: NaiveTime,
    ) -> Option<NaiveDateTime> {
        let class = self.class_for(symbol).ok()?;
        let opened = previous_weekday(exchange_day);
        let ts = class.resolve_time(opened, time, self.grace_ms);
        match class.locate(ts, self.grace_ms) {
            Location::InSession(loc) if loc.night && loc.trading_day == opened => Some(ts),
            _ => None,
        }
    }

    fn named(&self, class: &str) -> Result<Arc<SessionClass>> {
        self.class(class)
            .ok_or_else(|| Error::config(format!("unknown session class {class}")))
    }
}

fn previous_weekday(day: NaiveDate) -> NaiveDate {
    let back = match day.weekday() {
        Weekday::Mon => 3,
        Weekday::Sun => 2,
        _ => 1,
    };
    day - Duration::days(back)
}
