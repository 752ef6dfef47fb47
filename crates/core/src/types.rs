//! Core data types for the tickbar engine.

use chrono::{NaiveDate, NaiveDateTime};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Width of one bar.
pub const BAR_SECONDS: i64 = 60;

/// Maximum number of depth levels carried per side.
pub const MAX_DEPTH: usize = 5;

/// Product code of an instrument: its leading letters, upper-cased.
///
/// `IF2309` -> `IF`, `rb2401` -> `RB`, `T1803` -> `T`.
pub fn product_code(symbol: &str) -> String {
    symbol
        .chars()
        .take_while(|c| c.is_ascii_alphabetic())
        .collect::<String>()
        .to_ascii_uppercase()
}

/// Aggressor side reported by the exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(i8)]
pub enum TradeSide {
    /// Buyer-initiated.
    Buy = 1,
    /// Seller-initiated.
    Sell = -1,
    /// Not attributable to either side.
    Ambiguous = 0,
}

impl TradeSide {
    /// Parse an exchange side flag (`B`/`S`, case-insensitive). Anything else is ambiguous.
    pub fn from_flag(flag: &str) -> Self {
        match flag.trim() {
            f if f.eq_ignore_ascii_case("b") => TradeSide::Buy,
            f if f.eq_ignore_ascii_case("s") => TradeSide::Sell,
            _ => TradeSide::Ambiguous,
        }
    }

    /// Split a traded volume into (buy, sell) parts.
    ///
    /// Ambiguous volume is split evenly, the odd lot going to the buy side.
    #[inline]
    pub fn split(self, volume: u64) -> (u64, u64) {
        match self {
            TradeSide::Buy => (volume, 0),
            TradeSide::Sell => (0, volume),
            TradeSide::Ambiguous => {
                let sell = volume / 2;
                (volume - sell, sell)
            }
        }
    }
}

/// One price level of the order book.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepthLevel {
    pub price: Decimal,
    pub size: u64,
}

/// Canonical tick, independent of the exchange format it was read from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tick {
    /// Exchange instrument code.
    pub symbol: String,
    /// Exchange-local timestamp.
    pub ts: NaiveDateTime,
    /// Last traded price.
    pub price: Decimal,
    /// Cumulative traded volume for the trading day.
    pub cum_volume: u64,
    /// Cumulative turnover for the trading day, when the feed reports it.
    pub cum_turnover: Option<Decimal>,
    /// Open interest.
    pub open_interest: Option<u64>,
    /// Aggressor side of the last trade.
    pub side: Option<TradeSide>,
    /// Bid levels, best first.
    pub bids: Vec<DepthLevel>,
    /// Ask levels, best first.
    pub asks: Vec<DepthLevel>,
}

/// Granularity at which bars are persisted and replaced.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PartitionKey {
    pub symbol: String,
    pub trading_day: NaiveDate,
}

impl PartitionKey {
    pub fn new(symbol: impl Into<String>, trading_day: NaiveDate) -> Self {
        Self {
            symbol: symbol.into(),
            trading_day,
        }
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.symbol, self.trading_day.format("%Y%m%d"))
    }
}

/// 1-minute OHLCV bar.
///
/// Flat so it serializes directly to a CSV row. The book columns hold the
/// last depth snapshot seen in the bucket, level 1 first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bar {
    pub symbol: String,
    /// Logical trading day the bar is filed under.
    pub trading_day: NaiveDate,
    /// Bucket start, exchange-local.
    pub bar_start: NaiveDateTime,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    /// Sum of derived tick volumes in the bucket.
    pub volume: u64,
    /// Sum of derived tick turnover in the bucket.
    pub turnover: Decimal,
    pub tick_count: u32,
    pub buy_volume: u64,
    pub sell_volume: u64,
    /// Cumulative day volume as of the bucket's last tick.
    pub total_volume: u64,
    /// Cumulative day turnover as of the bucket's last tick.
    pub total_turnover: Option<Decimal>,
    pub open_interest: Option<u64>,
    /// Open interest change against the previous bar of the day; 0 for the
    /// day's first bar.
    pub position_change: Option<i64>,
    pub bid_price1: Option<Decimal>,
    pub bid_price2: Option<Decimal>,
    pub bid_price3: Option<Decimal>,
    pub bid_price4: Option<Decimal>,
    pub bid_price5: Option<Decimal>,
    pub bid_volume1: Option<u64>,
    pub bid_volume2: Option<u64>,
    pub bid_volume3: Option<u64>,
    pub bid_volume4: Option<u64>,
    pub bid_volume5: Option<u64>,
    pub ask_price1: Option<Decimal>,
    pub ask_price2: Option<Decimal>,
    pub ask_price3: Option<Decimal>,
    pub ask_price4: Option<Decimal>,
    pub ask_price5: Option<Decimal>,
    pub ask_volume1: Option<u64>,
    pub ask_volume2: Option<u64>,
    pub ask_volume3: Option<u64>,
    pub ask_volume4: Option<u64>,
    pub ask_volume5: Option<u64>,
    /// Summed bid size minus summed ask size of the book at close.
    pub order_diff: i64,
    /// `order_diff` over the summed size of both sides, in `[-1, 1]`.
    pub order_rate: Decimal,
    /// Bucket lies in a night session window.
    pub is_night: bool,
    /// Bar was forward-filled for a bucket without ticks.
    pub filled: bool,
}

impl Bar {
    pub fn key(&self) -> PartitionKey {
        PartitionKey::new(self.symbol.clone(), self.trading_day)
    }

    /// `low <= min(open, close) <= max(open, close) <= high`.
    pub fn is_consistent(&self) -> bool {
        self.low <= self.open.min(self.close) && self.open.max(self.close) <= self.high
    }

    /// Copy a depth snapshot into the book columns and derive the order
    /// imbalance from it. Levels past [`MAX_DEPTH`] are ignored.
    pub fn set_book(&mut self, bids: &[DepthLevel], asks: &[DepthLevel]) {
        let level = |side: &[DepthLevel], n: usize| side.get(n).copied();
        let bid: [Option<DepthLevel>; MAX_DEPTH] = std::array::from_fn(|n| level(bids, n));
        let ask: [Option<DepthLevel>; MAX_DEPTH] = std::array::from_fn(|n| level(asks, n));

        [
            &mut self.bid_price1,
            &mut self.bid_price2,
            &mut self.bid_price3,
            &mut self.bid_price4,
            &mut self.bid_price5,
        ]
        .into_iter()
        .zip(bid)
        .for_each(|(slot, l)| *slot = l.map(|l| l.price));
        [
            &mut self.bid_volume1,
            &mut self.bid_volume2,
            &mut self.bid_volume3,
            &mut self.bid_volume4,
            &mut self.bid_volume5,
        ]
        .into_iter()
        .zip(bid)
        .for_each(|(slot, l)| *slot = l.map(|l| l.size));
        [
            &mut self.ask_price1,
            &mut self.ask_price2,
            &mut self.ask_price3,
            &mut self.ask_price4,
            &mut self.ask_price5,
        ]
        .into_iter()
        .zip(ask)
        .for_each(|(slot, l)| *slot = l.map(|l| l.price));
        [
            &mut self.ask_volume1,
            &mut self.ask_volume2,
            &mut self.ask_volume3,
            &mut self.ask_volume4,
            &mut self.ask_volume5,
        ]
        .into_iter()
        .zip(ask)
        .for_each(|(slot, l)| *slot = l.map(|l| l.size));

        let total = |side: &[Option<DepthLevel>]| -> i64 {
            side.iter().flatten().map(|l| l.size as i64).sum()
        };
        let (bid_total, ask_total) = (total(&bid[..]), total(&ask[..]));
        self.order_diff = bid_total - ask_total;
        self.order_rate = if bid_total + ask_total == 0 {
            Decimal::ZERO
        } else {
            (Decimal::from(self.order_diff) / Decimal::from(bid_total + ask_total))
                .round_dp(4)
                .clamp(-Decimal::ONE, Decimal::ONE)
        };
    }

    /// Flat, zero-volume bar carrying the previous bar's close and snapshot forward.
    pub fn forward_fill(prev: &Bar, bar_start: NaiveDateTime, is_night: bool) -> Bar {
        Bar {
            bar_start,
            open: prev.close,
            high: prev.close,
            low: prev.close,
            volume: 0,
            turnover: Decimal::ZERO,
            tick_count: 0,
            buy_volume: 0,
            sell_volume: 0,
            position_change: prev.open_interest.map(|_| 0),
            is_night,
            filled: true,
            ..prev.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;

    fn make_bar(open: i64, high: i64, low: i64, close: i64) -> Bar {
        Bar {
            symbol: "IF2309".to_string(),
            trading_day: NaiveDate::from_ymd_opt(2023, 9, 1).unwrap(),
            bar_start: NaiveDate::from_ymd_opt(2023, 9, 1)
                .unwrap()
                .and_hms_opt(9, 30, 0)
                .unwrap(),
            open: Decimal::from(open),
            high: Decimal::from(high),
            low: Decimal::from(low),
            close: Decimal::from(close),
            volume: 12,
            turnover: Decimal::from(14_400_000),
            tick_count: 3,
            buy_volume: 7,
            sell_volume: 5,
            total_volume: 112,
            total_turnover: None,
            open_interest: Some(9000),
            position_change: Some(-3),
            bid_price1: Some(Decimal::from(close - 1)),
            ask_price1: Some(Decimal::from(close + 1)),
            ..Bar::default()
        }
    }

    #[test]
    fn test_product_code() {
        assert_eq!(product_code("IF2309"), "IF");
        assert_eq!(product_code("rb2401"), "RB");
        assert_eq!(product_code("T1803"), "T");
        assert_eq!(product_code("2309"), "");
    }

    #[test]
    fn test_trade_side_split() {
        assert_eq!(TradeSide::Buy.split(7), (7, 0));
        assert_eq!(TradeSide::Sell.split(7), (0, 7));
        assert_eq!(TradeSide::Ambiguous.split(7), (4, 3));
        assert_eq!(TradeSide::from_flag(" b "), TradeSide::Buy);
        assert_eq!(TradeSide::from_flag("S"), TradeSide::Sell);
        assert_eq!(TradeSide::from_flag("N"), TradeSide::Ambiguous);
    }

    #[test]
    fn test_bar_consistency() {
        assert!(make_bar(4000, 4002, 3998, 4001).is_consistent());
        assert!(!make_bar(4000, 3999, 3998, 4001).is_consistent());
        assert!(!make_bar(3997, 4002, 3998, 4001).is_consistent());
    }

    #[test]
    fn test_forward_fill_is_flat() {
        let prev = make_bar(4000, 4002, 3998, 4001);
        let start = prev.bar_start + chrono::Duration::seconds(BAR_SECONDS);
        let filled = Bar::forward_fill(&prev, start, false);

        assert_eq!(filled.open, Decimal::from(4001));
        assert_eq!(filled.high, filled.low);
        assert_eq!(filled.volume, 0);
        assert_eq!(filled.tick_count, 0);
        assert_eq!(filled.total_volume, 112);
        assert_eq!(filled.open_interest, Some(9000));
        assert_eq!(filled.position_change, Some(0));
        assert_eq!(filled.bid_price1, Some(Decimal::from(4000)));
        assert!(filled.filled);
        assert!(filled.is_consistent());
    }

    #[test]
    fn test_partition_key_display() {
        let key = PartitionKey::new("IF2309", NaiveDate::from_ymd_opt(2023, 9, 1).unwrap());
        assert_eq!(key.to_string(), "IF2309@20230901");
    }

    #[test]
    fn test_set_book_levels_and_imbalance() {
        let level = |price: i64, size: u64| DepthLevel {
            price: Decimal::from(price),
            size,
        };
        let mut bar = make_bar(4000, 4002, 3998, 4001);
        let bids = [level(4000, 10), level(3999, 20), level(3998, 5)];
        let asks = [level(4001, 3), level(4002, 2)];
        bar.set_book(&bids, &asks);

        assert_eq!(bar.bid_price1, Some(Decimal::from(4000)));
        assert_eq!(bar.bid_volume3, Some(5));
        assert_eq!(bar.bid_price4, None);
        assert_eq!(bar.ask_volume2, Some(2));
        assert_eq!(bar.ask_price3, None);
        assert_eq!(bar.order_diff, 30);
        // 30 / 40
        assert_eq!(bar.order_rate, Decimal::new(75, 2));

        bar.set_book(&[], &[level(4001, 7)]);
        assert_eq!(bar.order_diff, -7);
        assert_eq!(bar.order_rate, -Decimal::ONE);
        assert_eq!(bar.bid_price1, None);

        bar.set_book(&[], &[]);
        assert_eq!(bar.order_rate, Decimal::ZERO);
    }
}
