//! Tick normalization from exchange-specific row layouts.
//!
//! Each supported layout is a parser bound to one file header. Column lookup
//! is case-insensitive. Missing required columns fail the whole file; a bad
//! row only rejects that row.

use chrono::{NaiveDate, NaiveDateTime, NaiveTime, Timelike};
use csv::StringRecord;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::collections::{BTreeSet, HashMap};
use std::str::FromStr;
use tickbar_calendar::SessionCalendar;
use tickbar_core::config::TickFormat;
use tickbar_core::{DepthLevel, Error, RecordError, Result, Tick, TradeSide, MAX_DEPTH};

type RowResult<T> = std::result::Result<T, RecordError>;

/// Per-file context a parser needs beyond the row itself.
#[derive(Debug, Clone, Copy)]
pub struct ParseContext<'a> {
    /// Symbol for rows that do not carry one.
    pub default_symbol: Option<&'a str>,
    /// Trading day for time-only timestamps without a date column.
    pub trading_day: Option<NaiveDate>,
    /// Upper-cased symbols to keep; empty keeps everything.
    pub symbols: &'a BTreeSet<String>,
    pub calendar: &'a SessionCalendar,
}

impl ParseContext<'_> {
    fn check_symbol(&self, symbol: &str) -> RowResult<()> {
        if self.symbols.is_empty() || self.symbols.contains(&symbol.to_ascii_uppercase()) {
            Ok(())
        } else {
            Err(RecordError::unknown_symbol(symbol))
        }
    }

    /// Complete a time-of-day with the row's trading date or the file's.
    fn complete(
        &self,
        symbol: &str,
        row_day: Option<NaiveDate>,
        time: NaiveTime,
    ) -> RowResult<NaiveDateTime> {
        let day = row_day
            .or(self.trading_day)
            .ok_or_else(|| RecordError::malformed("time-only timestamp and no trading date"))?;
        Ok(self.calendar.resolve_time_for(symbol, day, time))
    }
}

/// Turns one raw row into a canonical tick.
pub trait ParseTick {
    fn parse(&self, record: &StringRecord, ctx: &ParseContext<'_>) -> RowResult<Tick>;
}

/// The closed set of supported layouts.
#[derive(Debug, Clone)]
pub enum Normalizer {
    TaqL2(TaqL2Parser),
    Ctp(CtpParser),
}

impl Normalizer {
    /// Bind the parser for `format` to a file header.
    pub fn new(format: TickFormat, header: &StringRecord) -> Result<Self> {
        let columns = Columns::new(header);
        Ok(match format {
            TickFormat::TaqL2 => Normalizer::TaqL2(TaqL2Parser::bind(&columns)?),
            TickFormat::Ctp => Normalizer::Ctp(CtpParser::bind(&columns)?),
        })
    }

    pub fn format(&self) -> TickFormat {
        match self {
            Normalizer::TaqL2(_) => TickFormat::TaqL2,
            Normalizer::Ctp(_) => TickFormat::Ctp,
        }
    }
}

impl ParseTick for Normalizer {
    fn parse(&self, record: &StringRecord, ctx: &ParseContext<'_>) -> RowResult<Tick> {
        match self {
            Normalizer::TaqL2(parser) => parser.parse(record, ctx),
            Normalizer::Ctp(parser) => parser.parse(record, ctx),
        }
    }
}

/// Header name to position, lower-cased.
struct Columns(HashMap<String, usize>);

impl Columns {
    fn new(header: &StringRecord) -> Self {
        let map = header
            .iter()
            .enumerate()
            .map(|(i, name)| (name.trim().trim_start_matches('\u{feff}').to_ascii_lowercase(), i))
            .collect();
        Self(map)
    }

    fn get(&self, name: &str) -> Option<usize> {
        self.0.get(&name.to_ascii_lowercase()).copied()
    }

    fn require(&self, name: &str, format: TickFormat) -> Result<usize> {
        self.get(name)
            .ok_or_else(|| Error::format(format!("{format} input has no {name} column")))
    }

    /// Price/size column pairs for depth levels 1..=5, stopping at the first
    /// level without a price column.
    fn depth(&self, price: impl Fn(usize) -> String, size: impl Fn(usize) -> String) -> Vec<DepthColumns> {
        (1..=MAX_DEPTH)
            .map_while(|level| {
                self.get(&price(level)).map(|price| DepthColumns {
                    price,
                    size: self.get(&size(level)),
                })
            })
            .collect()
    }
}

#[derive(Debug, Clone, Copy)]
struct DepthColumns {
    price: usize,
    size: Option<usize>,
}

fn field(record: &StringRecord, index: usize) -> Option<&str> {
    record.get(index).map(str::trim).filter(|v| !v.is_empty())
}

fn required<'r>(record: &'r StringRecord, index: usize, name: &str) -> RowResult<&'r str> {
    field(record, index).ok_or_else(|| RecordError::malformed(format!("{name} is empty")))
}

fn parse_decimal(value: &str, name: &str) -> RowResult<Decimal> {
    Decimal::from_str(value)
        .or_else(|_| Decimal::from_scientific(value))
        .map_err(|_| RecordError::parse(format!("{name} {value:?} is not a number")))
}

/// Counters are integral but often exported as `123.0`.
fn parse_count(value: &str, name: &str) -> RowResult<u64> {
    if let Ok(n) = value.parse::<u64>() {
        return Ok(n);
    }
    Some(parse_decimal(value, name)?)
        .filter(|d| d.fract().is_zero())
        .and_then(|d| d.to_u64())
        .ok_or_else(|| RecordError::parse(format!("{name} {value:?} is not a count")))
}

fn parse_optional<T>(
    record: &StringRecord,
    index: Option<usize>,
    name: &str,
    parse: impl Fn(&str, &str) -> RowResult<T>,
) -> RowResult<Option<T>> {
    index
        .and_then(|i| field(record, i))
        .map(|v| parse(v, name))
        .transpose()
}

/// Book levels up to the first one missing or non-positive.
fn parse_depth(record: &StringRecord, columns: &[DepthColumns]) -> Vec<DepthLevel> {
    columns
        .iter()
        .map_while(|col| {
            let price = field(record, col.price).and_then(|v| parse_decimal(v, "").ok())?;
            if price <= Decimal::ZERO || price > Decimal::from(1_000_000_000u64) {
                return None;
            }
            let size = col
                .size
                .and_then(|i| field(record, i))
                .and_then(|v| parse_count(v, "").ok())
                .unwrap_or(0);
            Some(DepthLevel { price, size })
        })
        .collect()
}

fn parse_date(value: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(value, "%Y%m%d")
        .or_else(|_| NaiveDate::parse_from_str(value, "%Y-%m-%d"))
        .ok()
}

/// `HH:MM:SS[.fff]`, `HHMMSS` or `HHMMSSfff`.
fn parse_time_of_day(value: &str) -> Option<NaiveTime> {
    if value.contains(':') {
        return NaiveTime::parse_from_str(value, "%H:%M:%S%.f").ok();
    }
    if !value.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    match value.len() {
        6 => NaiveTime::parse_from_str(value, "%H%M%S").ok(),
        9 => {
            let millis = value[6..].parse::<u32>().ok()?;
            with_millis(NaiveTime::parse_from_str(&value[..6], "%H%M%S").ok()?, millis)
        }
        _ => None,
    }
}

fn with_millis(time: NaiveTime, millis: u32) -> Option<NaiveTime> {
    if millis > 999 {
        return None;
    }
    time.with_nanosecond(millis * 1_000_000)
}

/// CSMAR-style TAQ Level-2 futures export.
#[derive(Debug, Clone)]
pub struct TaqL2Parser {
    trading_time: usize,
    last_price: usize,
    total_volume: usize,
    total_amount: Option<usize>,
    total_position: Option<usize>,
    symbol: Option<usize>,
    trading_date: Option<usize>,
    buy_or_sell: Option<usize>,
    bids: Vec<DepthColumns>,
    asks: Vec<DepthColumns>,
}

impl TaqL2Parser {
    fn bind(columns: &Columns) -> Result<Self> {
        let format = TickFormat::TaqL2;
        Ok(Self {
            trading_time: columns.require("TradingTime", format)?,
            last_price: columns.require("LastPrice", format)?,
            total_volume: columns.require("TotalVolume", format)?,
            total_amount: columns.get("TotalAmount"),
            total_position: columns.get("TotalPosition"),
            symbol: columns.get("Symbol"),
            trading_date: columns.get("TradingDate"),
            buy_or_sell: columns.get("BuyOrSell"),
            bids: columns.depth(|n| format!("BuyPrice0{n}"), |n| format!("BuyVolume0{n}")),
            asks: columns.depth(|n| format!("SellPrice0{n}"), |n| format!("SellVolume0{n}")),
        })
    }

    fn timestamp(
        &self,
        record: &StringRecord,
        symbol: &str,
        ctx: &ParseContext<'_>,
    ) -> RowResult<NaiveDateTime> {
        let value = required(record, self.trading_time, "TradingTime")?;
        let bad = || RecordError::parse(format!("TradingTime {value:?} is not a timestamp"));

        if value.len() > 12 && value.contains('-') {
            return NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S%.f").map_err(|_| bad());
        }

        let time = parse_time_of_day(value).ok_or_else(bad)?;
        let row_day = match self.trading_date.and_then(|i| field(record, i)) {
            Some(v) => Some(
                parse_date(v)
                    .ok_or_else(|| RecordError::parse(format!("TradingDate {v:?} is not a date")))?,
            ),
            None => None,
        };
        ctx.complete(symbol, row_day, time)
    }
}

impl ParseTick for TaqL2Parser {
    fn parse(&self, record: &StringRecord, ctx: &ParseContext<'_>) -> RowResult<Tick> {
        let symbol = match self.symbol.and_then(|i| field(record, i)) {
            Some(s) => s,
            None => ctx
                .default_symbol
                .ok_or_else(|| RecordError::malformed("no Symbol column value and no contract"))?,
        };
        ctx.check_symbol(symbol)?;

        let ts = self.timestamp(record, symbol, ctx)?;
        let price = parse_decimal(required(record, self.last_price, "LastPrice")?, "LastPrice")?;
        let cum_volume = parse_count(
            required(record, self.total_volume, "TotalVolume")?,
            "TotalVolume",
        )?;

        Ok(Tick {
            symbol: symbol.to_string(),
            ts,
            price,
            cum_volume,
            cum_turnover: parse_optional(record, self.total_amount, "TotalAmount", parse_decimal)?,
            open_interest: parse_optional(record, self.total_position, "TotalPosition", parse_count)?,
            side: self
                .buy_or_sell
                .and_then(|i| field(record, i))
                .map(TradeSide::from_flag),
            bids: parse_depth(record, &self.bids),
            asks: parse_depth(record, &self.asks),
        })
    }
}

/// CTP depth-market-data dump.
#[derive(Debug, Clone)]
pub struct CtpParser {
    instrument: usize,
    update_time: usize,
    last_price: usize,
    volume: usize,
    update_millisec: Option<usize>,
    action_day: Option<usize>,
    trading_day: Option<usize>,
    turnover: Option<usize>,
    open_interest: Option<usize>,
    bids: Vec<DepthColumns>,
    asks: Vec<DepthColumns>,
}

impl CtpParser {
    fn bind(columns: &Columns) -> Result<Self> {
        let format = TickFormat::Ctp;
        Ok(Self {
            instrument: columns.require("InstrumentID", format)?,
            update_time: columns.require("UpdateTime", format)?,
            last_price: columns.require("LastPrice", format)?,
            volume: columns.require("Volume", format)?,
            update_millisec: columns.get("UpdateMillisec"),
            action_day: columns.get("ActionDay"),
            trading_day: columns.get("TradingDay"),
            turnover: columns.get("Turnover"),
            open_interest: columns.get("OpenInterest"),
            bids: columns.depth(|n| format!("BidPrice{n}"), |n| format!("BidVolume{n}")),
            asks: columns.depth(|n| format!("AskPrice{n}"), |n| format!("AskVolume{n}")),
        })
    }

    fn date_field(record: &StringRecord, index: Option<usize>, name: &str) -> RowResult<Option<NaiveDate>> {
        match index.and_then(|i| field(record, i)) {
            Some(v) => parse_date(v)
                .map(Some)
                .ok_or_else(|| RecordError::parse(format!("{name} {v:?} is not a date"))),
            None => Ok(None),
        }
    }

    fn timestamp(
        &self,
        record: &StringRecord,
        symbol: &str,
        ctx: &ParseContext<'_>,
    ) -> RowResult<NaiveDateTime> {
        let value = required(record, self.update_time, "UpdateTime")?;
        let mut time = parse_time_of_day(value)
            .ok_or_else(|| RecordError::parse(format!("UpdateTime {value:?} is not a time")))?;

        if let Some(ms) = self.update_millisec.and_then(|i| field(record, i)) {
            let millis = ms
                .parse::<u32>()
                .ok()
                .and_then(|m| with_millis(time, m))
                .ok_or_else(|| RecordError::parse(format!("UpdateMillisec {ms:?} is invalid")))?;
            time = millis;
        }

        let action_day = Self::date_field(record, self.action_day, "ActionDay")?;
        let trading_day = Self::date_field(record, self.trading_day, "TradingDay")?;
        match action_day {
            // Dalian night ticks carry the exchange day in ActionDay too
            Some(day) if trading_day == Some(day) => Ok(ctx
                .calendar
                .night_time_for(symbol, day, time)
                .unwrap_or_else(|| day.and_time(time))),
            Some(day) => Ok(day.and_time(time)),
            None => ctx.complete(symbol, trading_day, time),
        }
    }
}

impl ParseTick for CtpParser {
    fn parse(&self, record: &StringRecord, ctx: &ParseContext<'_>) -> RowResult<Tick> {
        let symbol = required(record, self.instrument, "InstrumentID")?;
        ctx.check_symbol(symbol)?;

        let ts = self.timestamp(record, symbol, ctx)?;
        let price = parse_decimal(required(record, self.last_price, "LastPrice")?, "LastPrice")?;
        let cum_volume = parse_count(required(record, self.volume, "Volume")?, "Volume")?;

        Ok(Tick {
            symbol: symbol.to_string(),
            ts,
            price,
            cum_volume,
            cum_turnover: parse_optional(record, self.turnover, "Turnover", parse_decimal)?,
            open_interest: parse_optional(record, self.open_interest, "OpenInterest", parse_count)?,
            side: None,
            bids: parse_depth(record, &self.bids),
            asks: parse_depth(record, &self.asks),
        })
    }
}
