//! Minute bar building from cleaned ticks.
//!
//! Builds 1-minute OHLCV bars aligned to the symbol's session windows, with
//! the cumulative counters, open interest and 5-level book snapshotted at
//! close.
//! One bucket is open at a time; a bar is emitted as soon as a tick lands in
//! a later bucket.

use crate::cleaner::CleanedTick;
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::Arc;
use tickbar_calendar::{BucketLocation, Location, SessionCalendar, SessionClass};
use tickbar_core::config::EmptyBucketPolicy;
use tickbar_core::{Bar, DepthLevel, RejectCounts, RejectReason, Result, TradeSide};
use tracing::{debug, trace};

/// Statistics about bar building.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BuilderStats {
    /// Ticks folded into a bar.
    pub ticks_aggregated: u64,
    /// Volume folded into bars.
    pub volume: u64,
    /// Bars emitted, filled ones included.
    pub bars_emitted: u64,
    /// Forward-filled bars emitted.
    pub bars_filled: u64,
    /// Trading days finished.
    pub days: u64,
    /// Ticks dropped by the builder.
    pub rejects: RejectCounts,
}

/// A bar that's currently being built.
#[derive(Debug, Clone)]
struct BarInProgress {
    location: BucketLocation,
    open: Decimal,
    high: Decimal,
    low: Decimal,
    close: Decimal,
    volume: u64,
    turnover: Decimal,
    tick_count: u32,
    buy_volume: u64,
    sell_volume: u64,
    total_volume: u64,
    total_turnover: Option<Decimal>,
    open_interest: Option<u64>,
    bids: Vec<DepthLevel>,
    asks: Vec<DepthLevel>,
}

impl BarInProgress {
    fn new(location: BucketLocation, tick: &CleanedTick) -> Self {
        let price = tick.tick.price;
        let mut bar = Self {
            location,
            open: price,
            high: price,
            low: price,
            close: price,
            volume: 0,
            turnover: Decimal::ZERO,
            tick_count: 0,
            buy_volume: 0,
            sell_volume: 0,
            total_volume: 0,
            total_turnover: None,
            open_interest: None,
            bids: Vec::new(),
            asks: Vec::new(),
        };
        bar.add_tick(tick);
        bar
    }

    fn add_tick(&mut self, cleaned: &CleanedTick) {
        let tick = &cleaned.tick;
        self.high = self.high.max(tick.price);
        self.low = self.low.min(tick.price);
        self.close = tick.price;
        self.volume += cleaned.volume;
        self.turnover += cleaned.turnover;
        self.tick_count += 1;

        let (buy, sell) = tick.side.unwrap_or(TradeSide::Ambiguous).split(cleaned.volume);
        self.buy_volume += buy;
        self.sell_volume += sell;

        self.total_volume = tick.cum_volume;
        self.total_turnover = tick.cum_turnover.or(self.total_turnover);
        self.open_interest = tick.open_interest.or(self.open_interest);
        if !tick.bids.is_empty() || !tick.asks.is_empty() {
            self.bids.clone_from(&tick.bids);
            self.asks.clone_from(&tick.asks);
        }
    }

    /// The finished bar; `prev` is the day's previous bar, if any.
    fn to_bar(&self, symbol: &str, prev: Option<&Bar>) -> Bar {
        let position_change = self.open_interest.map(|oi| {
            prev.and_then(|p| p.open_interest)
                .map_or(0, |before| oi as i64 - before as i64)
        });
        let mut bar = Bar {
            symbol: symbol.to_string(),
            trading_day: self.location.trading_day,
            bar_start: self.location.start,
            open: self.open,
            high: self.high,
            low: self.low,
            close: self.close,
            volume: self.volume,
            turnover: self.turnover,
            tick_count: self.tick_count,
            buy_volume: self.buy_volume,
            sell_volume: self.sell_volume,
            total_volume: self.total_volume,
            total_turnover: self.total_turnover,
            open_interest: self.open_interest,
            position_change,
            is_night: self.location.night,
            filled: false,
            ..Bar::default()
        };
        bar.set_book(&self.bids, &self.asks);
        bar
    }
}

#[derive(Debug, Clone)]
enum BucketState {
    NoBucketOpen,
    BucketOpen(BarInProgress),
}

/// Builder for one symbol's 1-minute bars.
pub struct BarBuilder {
    symbol: String,
    calendar: Arc<SessionCalendar>,
    class: Arc<SessionClass>,
    policy: EmptyBucketPolicy,
    state: BucketState,
    /// Bucket index and bar last emitted for the current trading day.
    last_bar: Option<(u32, Bar)>,
    stats: BuilderStats,
}

impl BarBuilder {
    /// Create a builder for `symbol`. Fails when no session class covers it.
    pub fn new(
        symbol: &str,
        calendar: Arc<SessionCalendar>,
        policy: EmptyBucketPolicy,
    ) -> Result<Self> {
        let class = calendar.class_for(symbol)?;
        debug!(symbol, class = %class.name, ?policy, "Bar builder created");
        Ok(Self {
            symbol: symbol.to_string(),
            calendar,
            class,
            policy,
            state: BucketState::NoBucketOpen,
            last_bar: None,
            stats: BuilderStats::default(),
        })
    }

    /// Add a cleaned tick. Completed bars are appended to `out`.
    ///
    /// Returns whether the tick was folded into a bar.
    pub fn push(&mut self, cleaned: &CleanedTick, out: &mut Vec<Bar>) -> bool {
        let location = match self.calendar.locate_in(&self.class, cleaned.tick.ts) {
            Location::InSession(location) => location,
            Location::OutOfSession => {
                trace!(symbol = %self.symbol, ts = %cleaned.tick.ts, "Tick outside session");
                self.stats.rejects.record(RejectReason::OutOfSession);
                return false;
            }
        };

        let state = std::mem::replace(&mut self.state, BucketState::NoBucketOpen);
        self.state = match state {
            BucketState::NoBucketOpen => self.open_bucket(location, cleaned, out),
            BucketState::BucketOpen(mut bar) => {
                let open = &bar.location;
                if location.trading_day == open.trading_day && location.index == open.index {
                    bar.add_tick(cleaned);
                    BucketState::BucketOpen(bar)
                } else if location.trading_day < open.trading_day
                    || (location.trading_day == open.trading_day && location.index < open.index)
                {
                    self.stats.rejects.record(RejectReason::OutOfOrder);
                    self.state = BucketState::BucketOpen(bar);
                    return false;
                } else {
                    self.close_bucket(&bar, out);
                    if location.trading_day != bar.location.trading_day {
                        self.finish_day(out);
                    }
                    self.open_bucket(location, cleaned, out)
                }
            }
        };

        self.stats.ticks_aggregated += 1;
        self.stats.volume += cleaned.volume;
        true
    }

    /// Close the open bucket and the trading day. Call once at end of input.
    pub fn finish(&mut self, out: &mut Vec<Bar>) {
        if let BucketState::BucketOpen(bar) =
            std::mem::replace(&mut self.state, BucketState::NoBucketOpen)
        {
            self.close_bucket(&bar, out);
            self.finish_day(out);
        }
    }

    /// Get bar building statistics.
    pub fn stats(&self) -> &BuilderStats {
        &self.stats
    }

    /// Open a bucket, filling the skipped buckets since the last bar of the day.
    fn open_bucket(
        &mut self,
        location: BucketLocation,
        cleaned: &CleanedTick,
        out: &mut Vec<Bar>,
    ) -> BucketState {
        let from = self
            .last_bar
            .as_ref()
            .filter(|(_, prev)| prev.trading_day == location.trading_day)
            .map(|(index, _)| index + 1);
        if let Some(from) = from {
            self.fill(from, location.index, out);
        }
        BucketState::BucketOpen(BarInProgress::new(location, cleaned))
    }

    fn close_bucket(&mut self, bar: &BarInProgress, out: &mut Vec<Bar>) {
        let prev = self
            .last_bar
            .as_ref()
            .map(|(_, prev)| prev)
            .filter(|prev| prev.trading_day == bar.location.trading_day);
        let closed = bar.to_bar(&self.symbol, prev);
        self.emit(bar.location.index, closed, out);
    }

    /// Fill through the end of the window holding the day's last bar.
    fn finish_day(&mut self, out: &mut Vec<Bar>) {
        if let Some((index, prev)) = self.last_bar.clone() {
            let template = self.class.template_on(prev.trading_day);
            if let Some((_, window)) = template.window_of(index) {
                self.fill(index + 1, window.last_bucket() + 1, out);
            }
            debug!(
                symbol = %self.symbol,
                trading_day = %prev.trading_day,
                bars = self.stats.bars_emitted,
                "Trading day finished"
            );
        }
        self.last_bar = None;
        self.stats.days += 1;
    }

    /// Emit flat bars for buckets `[from, to)` of the current day.
    fn fill(&mut self, from: u32, to: u32, out: &mut Vec<Bar>) {
        if self.policy != EmptyBucketPolicy::ForwardFill {
            return;
        }
        for index in from..to {
            let Some((_, prev)) = &self.last_bar else {
                return;
            };
            let Some(bucket) = self.class.bucket(prev.trading_day, index) else {
                return;
            };
            let filled = Bar::forward_fill(prev, bucket.start, bucket.night);
            self.stats.bars_filled += 1;
            self.emit(index, filled, out);
        }
    }

    fn emit(&mut self, index: u32, bar: Bar, out: &mut Vec<Bar>) {
        self.stats.bars_emitted += 1;
        self.last_bar = Some((index, bar.clone()));
        out.push(bar);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cleaner::TickCleaner;
    use chrono::{NaiveDate, NaiveDateTime};
    use tickbar_core::config::{CalendarConfig, CleanerConfig};
    use tickbar_core::{DepthLevel, Tick};

    fn make_ts(d: u32, h: u32, m: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2023, 9, d)
            .unwrap()
            .and_hms_opt(h, m, s)
            .unwrap()
    }

    fn make_tick(symbol: &str, ts: NaiveDateTime, price: i64, cum_volume: u64) -> Tick {
        Tick {
            symbol: symbol.to_string(),
            ts,
            price: Decimal::from(price),
            cum_volume,
            cum_turnover: None,
            open_interest: Some(9000),
            side: None,
            bids: vec![DepthLevel {
                price: Decimal::from(price - 1),
                size: 1,
            }],
            asks: vec![DepthLevel {
                price: Decimal::from(price + 1),
                size: 1,
            }],
        }
    }

    fn calendar() -> Arc<SessionCalendar> {
        Arc::new(SessionCalendar::from_config(&CalendarConfig::default()).unwrap())
    }

    /// Clean and aggregate a tick stream.
    fn run(symbol: &str, ticks: Vec<Tick>, policy: EmptyBucketPolicy) -> (Vec<Bar>, BarBuilder) {
        let mut cleaner = TickCleaner::new(&CleanerConfig::default());
        let mut builder = BarBuilder::new(symbol, calendar(), policy).unwrap();
        let mut bars = Vec::new();
        for tick in ticks {
            if let Ok(cleaned) = cleaner.clean(tick) {
                builder.push(&cleaned, &mut bars);
            }
        }
        builder.finish(&mut bars);
        (bars, builder)
    }

    #[test]
    fn test_scenario_two_bars() {
        let ticks = vec![
            make_tick("IF2309", make_ts(1, 9, 30, 0), 4000, 10),
            make_tick("IF2309", make_ts(1, 9, 30, 45), 4002, 15),
            make_tick("IF2309", make_ts(1, 9, 31, 10), 3999, 20),
        ];
        let (bars, _) = run("IF2309", ticks, EmptyBucketPolicy::Omit);

        assert_eq!(bars.len(), 2);
        assert_eq!(bars[0].bar_start, make_ts(1, 9, 30, 0));
        assert_eq!(bars[0].open, Decimal::from(4000));
        assert_eq!(bars[0].high, Decimal::from(4002));
        assert_eq!(bars[0].low, Decimal::from(4000));
        assert_eq!(bars[0].close, Decimal::from(4002));
        assert_eq!(bars[0].volume, 5);
        assert_eq!(bars[0].tick_count, 2);
        assert_eq!(bars[0].total_volume, 15);

        assert_eq!(bars[1].bar_start, make_ts(1, 9, 31, 0));
        assert_eq!(bars[1].open, Decimal::from(3999));
        assert_eq!(bars[1].high, Decimal::from(3999));
        assert_eq!(bars[1].low, Decimal::from(3999));
        assert_eq!(bars[1].close, Decimal::from(3999));
        assert_eq!(bars[1].volume, 5);
        assert_eq!(bars[1].bid_price1, Some(Decimal::from(3998)));
        assert_eq!(bars[1].ask_price1, Some(Decimal::from(4000)));
        assert_eq!(bars[1].order_diff, 0);
    }

    #[test]
    fn test_position_change_and_book_snapshot() {
        let mut first = make_tick("IF2309", make_ts(1, 9, 30, 0), 4000, 10);
        first.bids = vec![
            DepthLevel { price: Decimal::from(3999), size: 7 },
            DepthLevel { price: Decimal::from(3998), size: 3 },
        ];
        first.asks = vec![DepthLevel { price: Decimal::from(4001), size: 2 }];
        let second = make_tick("IF2309", make_ts(1, 9, 31, 5), 4001, 11);
        let mut depthless = make_tick("IF2309", make_ts(1, 9, 31, 30), 4002, 12);
        depthless.open_interest = Some(9012);
        depthless.bids.clear();
        depthless.asks.clear();
        let mut third = make_tick("IF2309", make_ts(1, 9, 32, 5), 4001, 14);
        third.open_interest = None;

        let ticks = vec![first, second, depthless, third];
        let (bars, _) = run("IF2309", ticks, EmptyBucketPolicy::Omit);
        assert_eq!(bars.len(), 3);

        assert_eq!(bars[0].position_change, Some(0));
        assert_eq!(bars[0].bid_volume1, Some(7));
        assert_eq!(bars[0].bid_price2, Some(Decimal::from(3998)));
        assert_eq!(bars[0].ask_price2, None);
        assert_eq!(bars[0].order_diff, 8);

        // a depthless tick keeps the bucket's last book
        assert_eq!(bars[1].position_change, Some(12));
        assert_eq!(bars[1].close, Decimal::from(4002));
        assert_eq!(bars[1].bid_price1, Some(Decimal::from(4000)));
        assert_eq!(bars[1].order_diff, 0);

        assert_eq!(bars[2].position_change, None);
    }

    #[test]
    fn test_forward_fill_through_window_end() {
        let ticks = vec![
            make_tick("IF2309", make_ts(1, 11, 26, 0), 4000, 10),
            make_tick("IF2309", make_ts(1, 11, 28, 5), 4001, 12),
        ];
        let (bars, builder) = run("IF2309", ticks, EmptyBucketPolicy::ForwardFill);

        // 11:26, 11:27 (filled), 11:28, 11:29 (filled)
        assert_eq!(bars.len(), 4);
        assert!(!bars[0].filled);
        assert!(bars[1].filled);
        assert_eq!(bars[1].bar_start, make_ts(1, 11, 27, 0));
        assert_eq!(bars[1].open, bars[0].close);
        assert_eq!(bars[1].volume, 0);
        assert!(!bars[2].filled);
        assert!(bars[3].filled);
        assert_eq!(bars[3].close, Decimal::from(4001));
        assert_eq!(builder.stats().bars_filled, 2);
        assert_eq!(builder.stats().bars_emitted, 4);
    }

    #[test]
    fn test_fill_across_lunch_break() {
        let ticks = vec![
            make_tick("IF2309", make_ts(1, 11, 29, 0), 4000, 10),
            make_tick("IF2309", make_ts(1, 13, 1, 0), 4001, 12),
        ];
        let (bars, _) = run("IF2309", ticks, EmptyBucketPolicy::ForwardFill);
        let starts: Vec<_> = bars.iter().map(|b| b.bar_start).collect();
        assert_eq!(starts[0], make_ts(1, 11, 29, 0));
        assert_eq!(starts[1], make_ts(1, 13, 0, 0));
        assert_eq!(starts[2], make_ts(1, 13, 1, 0));
        // afternoon window filled to 14:59
        assert_eq!(*starts.last().unwrap(), make_ts(1, 14, 59, 0));
        assert_eq!(bars.len(), 1 + 120);
    }

    #[test]
    fn test_gap_free_session_matches_enumeration() {
        let cal = calendar();
        let class = cal.class_for("IF2309").unwrap();
        let day = NaiveDate::from_ymd_opt(2023, 9, 1).unwrap();
        let buckets = class.enumerate(day);

        let mut ticks = vec![make_tick("IF2309", make_ts(1, 9, 30, 0), 4000, 1)];
        ticks.push(make_tick("IF2309", make_ts(1, 14, 59, 30), 4003, 50));
        let (bars, _) = run("IF2309", ticks, EmptyBucketPolicy::ForwardFill);

        let starts: Vec<_> = bars.iter().map(|b| b.bar_start).collect();
        let expected: Vec<_> = buckets.iter().map(|b| b.start).collect();
        assert_eq!(starts, expected);
        assert!(bars.iter().all(Bar::is_consistent));
    }

    #[test]
    fn test_lunch_tick_excluded_bucket_untouched() {
        let ticks = vec![
            make_tick("IF2309", make_ts(1, 11, 29, 10), 4000, 10),
            make_tick("IF2309", make_ts(1, 11, 29, 20), 4001, 11),
            make_tick("IF2309", make_ts(1, 12, 0, 0), 4100, 20),
            make_tick("IF2309", make_ts(1, 11, 29, 50), 3999, 21),
        ];
        let (bars, builder) = run("IF2309", ticks, EmptyBucketPolicy::Omit);

        // the 11:29:50 tick is out of order for the cleaner (after 12:00)
        assert_eq!(bars.len(), 1);
        assert_eq!(bars[0].high, Decimal::from(4001));
        assert_eq!(bars[0].close, Decimal::from(4001));
        assert_eq!(bars[0].volume, 1);
        assert_eq!(builder.stats().rejects.get(RejectReason::OutOfSession), 1);
    }

    #[test]
    fn test_night_session_spans_midnight() {
        let ticks = vec![
            make_tick("ag2312", make_ts(1, 23, 59, 30), 6000, 10),
            make_tick("ag2312", make_ts(2, 0, 0, 30), 6001, 12),
        ];
        let (bars, _) = run("ag2312", ticks, EmptyBucketPolicy::Omit);
        assert_eq!(bars.len(), 2);
        let day = NaiveDate::from_ymd_opt(2023, 9, 1).unwrap();
        assert!(bars.iter().all(|b| b.trading_day == day && b.is_night));
        assert_eq!(bars[1].bar_start, make_ts(2, 0, 0, 0));
    }

    #[test]
    fn test_day_change_finishes_previous_day() {
        let ticks = vec![
            make_tick("IF2309", make_ts(1, 14, 58, 0), 4000, 100),
            make_tick("IF2309", make_ts(4, 9, 30, 0), 4010, 2),
            make_tick("IF2309", make_ts(4, 9, 30, 30), 4011, 5),
        ];
        let (bars, builder) = run("IF2309", ticks, EmptyBucketPolicy::ForwardFill);

        let first_day = NaiveDate::from_ymd_opt(2023, 9, 1).unwrap();
        let second_day = NaiveDate::from_ymd_opt(2023, 9, 4).unwrap();
        let day1: Vec<_> = bars.iter().filter(|b| b.trading_day == first_day).collect();
        let day2: Vec<_> = bars.iter().filter(|b| b.trading_day == second_day).collect();

        assert_eq!(day1.len(), 2);
        assert!(day1[1].filled);
        // 09:30 plus the morning window filled to 11:29
        assert_eq!(day2.len(), 120);
        assert!(!day2[0].filled);
        // the reset tick carries its full cumulative volume
        assert_eq!(day2[0].volume, 5);
        assert_eq!(builder.stats().days, 2);
    }

    #[test]
    fn test_volume_conservation() {
        let mut ticks = Vec::new();
        let mut cum = 0;
        for i in 0..90u32 {
            cum += (i % 7) as u64;
            let ts = make_ts(1, 9, 30, 0) + chrono::Duration::seconds(i as i64 * 37);
            ticks.push(make_tick("IF2309", ts, 4000 + (i % 5) as i64, cum));
        }
        let mut cleaner = TickCleaner::new(&CleanerConfig::default());
        let mut builder =
            BarBuilder::new("IF2309", calendar(), EmptyBucketPolicy::ForwardFill).unwrap();
        let mut bars = Vec::new();
        for tick in ticks {
            let cleaned = cleaner.clean(tick).unwrap();
            builder.push(&cleaned, &mut bars);
        }
        builder.finish(&mut bars);

        let bar_volume: u64 = bars.iter().map(|b| b.volume).sum();
        assert_eq!(bar_volume, cleaner.stats().derived_volume);
        assert!(bars.iter().all(Bar::is_consistent));
        assert!(bars.windows(2).all(|p| p[0].bar_start < p[1].bar_start));
    }

    #[test]
    fn test_unknown_product_fails() {
        assert!(BarBuilder::new("ZZ2401", calendar(), EmptyBucketPolicy::Omit).is_err());
    }
}
