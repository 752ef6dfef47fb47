//! Tick cleaning and volume derivation.
//!
//! Feeds report cumulative day counters. The cleaner turns them into
//! per-tick volume and turnover, and rejects ticks that would corrupt bars:
//! non-positive prices, duplicates, ticks going back in time, implausible
//! price jumps and counters moving in opposite directions.
//!
//! Given the symbol's session class, the cleaner also knows where the exchange
//! restarts its counters, so a new exchange day is derived from zero even when
//! its first cumulative value is above the previous day's close.

use chrono::NaiveDateTime;
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use tickbar_calendar::SessionClass;
use tickbar_core::config::CleanerConfig;
use tickbar_core::{RecordError, RejectCounts, RejectReason, Tick};
use tracing::{debug, info};

/// A tick that passed cleaning, with the volume it traded on its own.
#[derive(Debug, Clone, PartialEq)]
pub struct CleanedTick {
    pub tick: Tick,
    /// Volume traded since the previous accepted tick.
    pub volume: u64,
    /// Turnover since the previous accepted tick.
    pub turnover: Decimal,
    /// The cumulative counters restarted at this tick.
    pub reset: bool,
    /// First tick of a new exchange day.
    pub day_start: bool,
}

/// Statistics about cleaning.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CleanerStats {
    /// Ticks offered to the cleaner.
    pub ticks_in: u64,
    /// Ticks accepted.
    pub accepted: u64,
    /// Cumulative counter resets seen.
    pub counter_resets: u64,
    /// Exchange days started after the first one.
    pub day_starts: u64,
    /// Volume derived over accepted ticks.
    pub derived_volume: u64,
    /// Rejections by reason.
    pub rejects: RejectCounts,
}

/// Last accepted tick, the reference for the next one.
#[derive(Debug, Clone)]
struct Baseline {
    ts: NaiveDateTime,
    price: Decimal,
    cum_volume: u64,
    cum_turnover: Option<Decimal>,
    epoch: Option<NaiveDateTime>,
}

/// Identity of a tick for duplicate detection.
type TickKey = (NaiveDateTime, u64, Decimal);

/// Per-symbol tick cleaner. Expects the symbol's ticks in file order.
pub struct TickCleaner {
    /// Maximum relative price move between accepted ticks.
    max_price_jump: Decimal,
    /// Recently accepted ticks for duplicate detection.
    recent: VecDeque<TickKey>,
    /// Number of recent ticks to keep.
    dedup_window: usize,
    /// Source of exchange-day boundaries; without it only counter
    /// decreases restart the baseline.
    sessions: Option<Arc<SessionClass>>,
    baseline: Option<Baseline>,
    stats: CleanerStats,
}

impl TickCleaner {
    /// Create a new tick cleaner.
    pub fn new(config: &CleanerConfig) -> Self {
        Self {
            max_price_jump: config.max_price_jump,
            recent: VecDeque::with_capacity(config.dedup_window),
            dedup_window: config.dedup_window,
            sessions: None,
            baseline: None,
            stats: CleanerStats::default(),
        }
    }

    /// Restart the baseline at the exchange-day boundaries of `class`.
    pub fn with_sessions(mut self, class: Arc<SessionClass>) -> Self {
        self.sessions = Some(class);
        self
    }

    /// Clean one tick. Rejections are counted and returned; they never move
    /// the baseline.
    pub fn clean(&mut self, tick: Tick) -> Result<CleanedTick, RecordError> {
        self.stats.ticks_in += 1;
        let epoch = self
            .sessions
            .as_ref()
            .and_then(|class| class.counter_epoch(tick.ts));
        match self.check(tick, epoch) {
            Ok(cleaned) => {
                self.accept(&cleaned, epoch);
                Ok(cleaned)
            }
            Err(err) => {
                debug!(reason = %err.reason, detail = %err.detail, "Tick rejected");
                self.stats.rejects.record(err.reason);
                Err(err)
            }
        }
    }

    fn check(&self, tick: Tick, epoch: Option<NaiveDateTime>) -> Result<CleanedTick, RecordError> {
        if tick.price <= Decimal::ZERO {
            return Err(RecordError::new(
                RejectReason::InvalidPrice,
                format!("{} price {} at {}", tick.symbol, tick.price, tick.ts),
            ));
        }

        let key: TickKey = (tick.ts, tick.cum_volume, tick.price);
        if self.recent.contains(&key) {
            return Err(RecordError::new(
                RejectReason::DuplicateTick,
                format!("{} duplicate at {}", tick.symbol, tick.ts),
            ));
        }

        let Some(prev) = &self.baseline else {
            // Nothing is known about what traded before the first tick.
            return Ok(CleanedTick {
                tick,
                volume: 0,
                turnover: Decimal::ZERO,
                reset: false,
                day_start: false,
            });
        };

        if tick.ts <= prev.ts {
            return Err(RecordError::new(
                RejectReason::OutOfOrder,
                format!("{} at {} not after {}", tick.symbol, tick.ts, prev.ts),
            ));
        }

        let jump = (tick.price - prev.price).abs() / prev.price;
        if jump > self.max_price_jump {
            return Err(RecordError::new(
                RejectReason::PriceJumpRejected,
                format!(
                    "{} moved {} -> {} at {}",
                    tick.symbol, prev.price, tick.price, tick.ts
                ),
            ));
        }

        if epoch != prev.epoch {
            // counters restarted from zero with the exchange day
            let volume = tick.cum_volume;
            let turnover = tick
                .cum_turnover
                .unwrap_or_else(|| tick.price * Decimal::from(volume));
            return Ok(CleanedTick {
                tick,
                volume,
                turnover,
                reset: false,
                day_start: true,
            });
        }

        let volume_down = tick.cum_volume < prev.cum_volume;
        let turnover_down = match (tick.cum_turnover, prev.cum_turnover) {
            (Some(now), Some(before)) => Some(now < before),
            _ => None,
        };

        match (volume_down, turnover_down) {
            (true, Some(true)) | (true, None) => {
                let volume = tick.cum_volume;
                let turnover = tick
                    .cum_turnover
                    .unwrap_or_else(|| tick.price * Decimal::from(volume));
                Ok(CleanedTick {
                    tick,
                    volume,
                    turnover,
                    reset: true,
                    day_start: false,
                })
            }
            (true, Some(false)) | (false, Some(true)) => Err(RecordError::new(
                RejectReason::NegativeDerivedVolume,
                format!(
                    "{} volume {} -> {}, turnover {:?} -> {:?} at {}",
                    tick.symbol,
                    prev.cum_volume,
                    tick.cum_volume,
                    prev.cum_turnover,
                    tick.cum_turnover,
                    tick.ts
                ),
            )),
            (false, _) => {
                let volume = tick.cum_volume - prev.cum_volume;
                let turnover = match (tick.cum_turnover, prev.cum_turnover) {
                    (Some(now), Some(before)) => now - before,
                    _ => tick.price * Decimal::from(volume),
                };
                Ok(CleanedTick {
                    tick,
                    volume,
                    turnover,
                    reset: false,
                    day_start: false,
                })
            }
        }
    }

    fn accept(&mut self, cleaned: &CleanedTick, epoch: Option<NaiveDateTime>) {
        let tick = &cleaned.tick;
        if cleaned.reset {
            self.stats.counter_resets += 1;
            info!(
                symbol = %tick.symbol,
                ts = %tick.ts,
                previous = self.baseline.as_ref().map_or(0, |b| b.cum_volume),
                volume = tick.cum_volume,
                "Cumulative counters reset"
            );
        }
        if cleaned.day_start {
            self.stats.day_starts += 1;
            debug!(symbol = %tick.symbol, ts = %tick.ts, volume = tick.cum_volume, "Exchange day started");
        }

        if self.dedup_window > 0 {
            while self.recent.len() >= self.dedup_window {
                self.recent.pop_front();
            }
            self.recent.push_back((tick.ts, tick.cum_volume, tick.price));
        }

        self.baseline = Some(Baseline {
            ts: tick.ts,
            price: tick.price,
            cum_volume: tick.cum_volume,
            cum_turnover: tick.cum_turnover,
            epoch,
        });
        self.stats.accepted += 1;
        self.stats.derived_volume += cleaned.volume;
    }

    /// Get cleaning statistics.
    pub fn stats(&self) -> &CleanerStats {
        &self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn make_tick(h: u32, m: u32, s: u32, price: i64, cum_volume: u64) -> Tick {
        Tick {
            symbol: "IF2309".to_string(),
            ts: NaiveDate::from_ymd_opt(2023, 9, 1)
                .unwrap()
                .and_hms_opt(h, m, s)
                .unwrap(),
            price: Decimal::from(price),
            cum_volume,
            cum_turnover: None,
            open_interest: None,
            side: None,
            bids: Vec::new(),
            asks: Vec::new(),
        }
    }

    fn with_turnover(mut tick: Tick, turnover: i64) -> Tick {
        tick.cum_turnover = Some(Decimal::from(turnover));
        tick
    }

    fn cleaner() -> TickCleaner {
        TickCleaner::new(&CleanerConfig::default())
    }

    #[test]
    fn test_first_tick_sets_baseline() {
        let mut c = cleaner();
        let first = c.clean(make_tick(9, 30, 0, 4000, 10)).unwrap();
        assert_eq!(first.volume, 0);
        assert_eq!(first.turnover, Decimal::ZERO);

        let second = c.clean(make_tick(9, 30, 45, 4002, 15)).unwrap();
        assert_eq!(second.volume, 5);
        assert_eq!(second.turnover, Decimal::from(4002 * 5));
    }

    #[test]
    fn test_turnover_difference() {
        let mut c = cleaner();
        c.clean(with_turnover(make_tick(9, 30, 0, 4000, 10), 1_000)).unwrap();
        let t = c
            .clean(with_turnover(make_tick(9, 30, 1, 4000, 12), 1_750))
            .unwrap();
        assert_eq!(t.volume, 2);
        assert_eq!(t.turnover, Decimal::from(750));
    }

    #[test]
    fn test_invalid_price() {
        let mut c = cleaner();
        let err = c.clean(make_tick(9, 30, 0, 0, 10)).unwrap_err();
        assert_eq!(err.reason, RejectReason::InvalidPrice);
        assert_eq!(c.stats().rejects.get(RejectReason::InvalidPrice), 1);
        assert_eq!(c.stats().accepted, 0);
    }

    #[test]
    fn test_duplicate_counted_once() {
        let mut c = cleaner();
        c.clean(make_tick(9, 30, 0, 4000, 10)).unwrap();
        c.clean(make_tick(9, 30, 1, 4001, 13)).unwrap();
        let err = c.clean(make_tick(9, 30, 1, 4001, 13)).unwrap_err();
        assert_eq!(err.reason, RejectReason::DuplicateTick);

        let next = c.clean(make_tick(9, 30, 2, 4001, 14)).unwrap();
        assert_eq!(next.volume, 1);
        assert_eq!(c.stats().derived_volume, 4);
    }

    #[test]
    fn test_out_of_order_rejected_not_reordered() {
        let mut c = cleaner();
        c.clean(make_tick(9, 30, 5, 4000, 10)).unwrap();
        let err = c.clean(make_tick(9, 30, 4, 4000, 11)).unwrap_err();
        assert_eq!(err.reason, RejectReason::OutOfOrder);
        let same_ts = c.clean(make_tick(9, 30, 5, 4000, 12)).unwrap_err();
        assert_eq!(same_ts.reason, RejectReason::OutOfOrder);

        // baseline unchanged by the rejects
        let next = c.clean(make_tick(9, 30, 6, 4000, 12)).unwrap();
        assert_eq!(next.volume, 2);
    }

    #[test]
    fn test_price_jump_rejected() {
        let mut c = cleaner();
        c.clean(make_tick(9, 30, 0, 4000, 10)).unwrap();
        let err = c.clean(make_tick(9, 30, 1, 4900, 11)).unwrap_err();
        assert_eq!(err.reason, RejectReason::PriceJumpRejected);
        // exactly 20% is allowed
        assert!(c.clean(make_tick(9, 30, 2, 4800, 11)).is_ok());
    }

    #[test]
    fn test_counter_reset() {
        let mut c = cleaner();
        c.clean(with_turnover(make_tick(14, 59, 0, 4000, 900), 3_600_000)).unwrap();
        let reset = c
            .clean(with_turnover(make_tick(15, 0, 0, 4000, 3), 12_000))
            .unwrap();
        assert!(reset.reset);
        assert_eq!(reset.volume, 3);
        assert_eq!(reset.turnover, Decimal::from(12_000));
        assert_eq!(c.stats().counter_resets, 1);
    }

    #[test]
    fn test_counter_reset_without_turnover() {
        let mut c = cleaner();
        c.clean(make_tick(14, 59, 0, 4000, 900)).unwrap();
        let reset = c.clean(make_tick(15, 0, 0, 4000, 2)).unwrap();
        assert!(reset.reset);
        assert_eq!(reset.turnover, Decimal::from(8000));
    }

    #[test]
    fn test_counters_disagree() {
        let mut c = cleaner();
        c.clean(with_turnover(make_tick(9, 30, 0, 4000, 10), 40_000)).unwrap();
        let err = c
            .clean(with_turnover(make_tick(9, 30, 1, 4000, 9), 44_000))
            .unwrap_err();
        assert_eq!(err.reason, RejectReason::NegativeDerivedVolume);
        let err = c
            .clean(with_turnover(make_tick(9, 30, 2, 4000, 10), 39_000))
            .unwrap_err();
        assert_eq!(err.reason, RejectReason::NegativeDerivedVolume);
        assert_eq!(c.stats().rejects.total(), 2);
    }

    #[test]
    fn test_duplicate_outside_window_is_out_of_order() {
        let mut c = TickCleaner::new(&CleanerConfig {
            dedup_window: 1,
            ..CleanerConfig::default()
        });
        c.clean(make_tick(9, 30, 0, 4000, 10)).unwrap();
        c.clean(make_tick(9, 30, 1, 4000, 11)).unwrap();
        let err = c.clean(make_tick(9, 30, 0, 4000, 10)).unwrap_err();
        assert_eq!(err.reason, RejectReason::OutOfOrder);
    }

    fn session_cleaner(symbol: &str) -> TickCleaner {
        let calendar = tickbar_calendar::SessionCalendar::from_config(
            &tickbar_core::config::CalendarConfig::default(),
        )
        .unwrap();
        cleaner().with_sessions(calendar.class_for(symbol).unwrap())
    }

    fn at(mut tick: Tick, y: i32, mo: u32, d: u32) -> Tick {
        tick.ts = NaiveDate::from_ymd_opt(y, mo, d)
            .unwrap()
            .and_time(tick.ts.time());
        tick
    }

    #[test]
    fn test_new_day_restarts_baseline_above_prior_close() {
        let mut c = session_cleaner("IF2309");
        c.clean(make_tick(9, 30, 0, 4000, 10)).unwrap();
        c.clean(make_tick(14, 59, 0, 4000, 20)).unwrap();

        // Monday opens above Friday's close of 20
        let open = c.clean(at(make_tick(9, 30, 0, 4010, 50), 2023, 9, 4)).unwrap();
        assert!(open.day_start);
        assert!(!open.reset);
        assert_eq!(open.volume, 50);
        let next = c.clean(at(make_tick(9, 30, 5, 4010, 55), 2023, 9, 4)).unwrap();
        assert_eq!(next.volume, 5);

        assert_eq!(c.stats().day_starts, 1);
        assert_eq!(c.stats().counter_resets, 0);
        assert_eq!(c.stats().derived_volume, 10 + 55);
    }

    #[test]
    fn test_night_session_opens_new_exchange_day() {
        let mut c = session_cleaner("rb2405");
        let tick = |d, h, m, cum| at(make_tick(h, m, 0, 3900, cum), 2024, 1, d);

        c.clean(tick(2, 14, 59, 1_000)).unwrap();
        let night = c.clean(tick(2, 21, 0, 1_200)).unwrap();
        assert!(night.day_start);
        assert_eq!(night.volume, 1_200);
        // next morning continues the night's counters
        let morning = c.clean(tick(3, 9, 0, 1_500)).unwrap();
        assert!(!morning.day_start);
        assert_eq!(morning.volume, 300);

        // Friday night carries into Monday
        c.clean(tick(5, 21, 0, 100)).unwrap();
        let monday = c.clean(tick(8, 9, 0, 150)).unwrap();
        assert!(!monday.day_start);
        assert_eq!(monday.volume, 50);
    }

    #[test]
    fn test_no_day_boundaries_without_sessions() {
        let mut c = cleaner();
        c.clean(make_tick(14, 59, 0, 4000, 20)).unwrap();
        let next = c.clean(at(make_tick(9, 30, 0, 4010, 50), 2023, 9, 4)).unwrap();
        assert!(!next.day_start);
        assert_eq!(next.volume, 30);
    }
}
