//! Session windows, versioned session templates and bucket location.
//!
//! All window bounds are millisecond offsets from midnight of the *trading
//! day*. A night window that starts at 21:00 and ends at 02:30 is
//! `[75_600_000, 95_400_000)`: its after-midnight part keeps belonging to the
//! trading day the window opened on.

use chrono::{Datelike, Duration, NaiveDate, NaiveDateTime, NaiveTime, Timelike, Weekday};
use serde::Serialize;
use tickbar_core::config::{SessionClassConfig, SessionVersionConfig, SessionWindowConfig};
use tickbar_core::{Error, Result, BAR_SECONDS};

pub(crate) const MINUTE_MS: i64 = BAR_SECONDS * 1_000;
pub(crate) const DAY_MS: i64 = 86_400_000;

/// Windows starting at or after this time of day are night sessions.
const NIGHT_START_MS: i64 = 18 * 3_600_000;

/// Milliseconds since midnight, ignoring leap-second representation.
pub(crate) fn ms_of_day(time: NaiveTime) -> i64 {
    let millis = (time.nanosecond() / 1_000_000).min(999);
    time.num_seconds_from_midnight() as i64 * 1_000 + millis as i64
}

fn parse_time(value: &str) -> Result<NaiveTime> {
    let value = value.trim();
    NaiveTime::parse_from_str(value, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(value, "%H:%M"))
        .map_err(|e| Error::config(format!("invalid session time {value:?}: {e}")))
}

/// One contiguous trading window of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionWindow {
    /// Inclusive start offset (ms from trading-day midnight).
    pub start_ms: i64,
    /// Exclusive end offset.
    pub end_ms: i64,
    pub night: bool,
    /// Index of this window's first bucket within the trading day.
    pub first_bucket: u32,
    pub bucket_count: u32,
}

impl SessionWindow {
    fn from_config(config: &SessionWindowConfig) -> Result<Self> {
        let start = ms_of_day(parse_time(&config.start)?);
        let end = ms_of_day(parse_time(&config.end)?);

        let (start_ms, end_ms) = if config.next_day {
            let end = if end <= start { end + DAY_MS } else { end };
            (start + DAY_MS, end + DAY_MS)
        } else if end <= start {
            (start, end + DAY_MS)
        } else {
            (start, end)
        };

        let night = config.next_day || end_ms > DAY_MS || start_ms >= NIGHT_START_MS;
        let bucket_count = ((end_ms - start_ms + MINUTE_MS - 1) / MINUTE_MS) as u32;

        Ok(Self {
            start_ms,
            end_ms,
            night,
            first_bucket: 0,
            bucket_count,
        })
    }

    #[inline]
    pub fn contains(&self, offset_ms: i64) -> bool {
        offset_ms >= self.start_ms && offset_ms < self.end_ms
    }

    #[inline]
    pub fn last_bucket(&self) -> u32 {
        self.first_bucket + self.bucket_count - 1
    }

    fn bucket_at(&self, offset_ms: i64) -> u32 {
        let within = ((offset_ms - self.start_ms).max(0) / MINUTE_MS) as u32;
        self.first_bucket + within.min(self.bucket_count - 1)
    }
}

/// The windows of one trading day, valid from `effective_from` on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionTemplate {
    pub effective_from: Option<NaiveDate>,
    windows: Vec<SessionWindow>,
    bucket_count: u32,
}

impl SessionTemplate {
    pub fn from_config(config: &SessionVersionConfig) -> Result<Self> {
        if config.windows.is_empty() {
            return Err(Error::config("session version has no windows"));
        }

        let mut windows = config
            .windows
            .iter()
            .map(SessionWindow::from_config)
            .collect::<Result<Vec<_>>>()?;
        windows.sort_by_key(|w| w.start_ms);

        for pair in windows.windows(2) {
            if pair[0].end_ms > pair[1].start_ms {
                return Err(Error::config(format!(
                    "session windows overlap at offset {}ms",
                    pair[1].start_ms
                )));
            }
        }
        if let (Some(first), Some(last)) = (windows.first(), windows.last()) {
            if last.end_ms - first.start_ms > DAY_MS {
                return Err(Error::config("session windows span more than 24 hours"));
            }
        }

        let mut next = 0u32;
        for window in &mut windows {
            window.first_bucket = next;
            next += window.bucket_count;
        }

        Ok(Self {
            effective_from: config.effective_from,
            windows,
            bucket_count: next,
        })
    }

    pub fn windows(&self) -> &[SessionWindow] {
        &self.windows
    }

    /// Number of 1-minute buckets in one trading day.
    pub fn bucket_count(&self) -> u32 {
        self.bucket_count
    }

    /// Window and bucket index strictly containing the offset.
    pub fn find_exact(&self, offset_ms: i64) -> Option<(usize, u32)> {
        self.windows
            .iter()
            .position(|w| w.contains(offset_ms))
            .map(|i| (i, self.windows[i].bucket_at(offset_ms)))
    }

    /// Window edge the offset is within `grace_ms` of, folded to the edge bucket.
    pub fn find_near_edge(&self, offset_ms: i64, grace_ms: i64) -> Option<(usize, u32)> {
        if grace_ms <= 0 {
            return None;
        }
        self.windows.iter().enumerate().find_map(|(i, w)| {
            if offset_ms >= w.start_ms - grace_ms && offset_ms < w.start_ms {
                Some((i, w.first_bucket))
            } else if offset_ms >= w.end_ms && offset_ms < w.end_ms + grace_ms {
                Some((i, w.last_bucket()))
            } else {
                None
            }
        })
    }

    /// Window holding a bucket index.
    pub fn window_of(&self, index: u32) -> Option<(usize, &SessionWindow)> {
        self.windows
            .iter()
            .enumerate()
            .find(|(_, w)| index >= w.first_bucket && index <= w.last_bucket())
    }

    /// Night window opening on the evening of the trading day, after the
    /// day windows.
    fn evening_window(&self) -> Option<usize> {
        self.windows
            .iter()
            .position(|w| w.night && w.start_ms >= NIGHT_START_MS && w.start_ms < DAY_MS)
            .filter(|&i| i > 0)
    }

    /// Bucket start as an offset from trading-day midnight.
    pub fn bucket_offset(&self, index: u32) -> Option<i64> {
        self.window_of(index)
            .map(|(_, w)| w.start_ms + (index - w.first_bucket) as i64 * MINUTE_MS)
    }
}

/// Where a timestamp falls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Location {
    InSession(BucketLocation),
    OutOfSession,
}

impl Location {
    pub fn in_session(self) -> Option<BucketLocation> {
        match self {
            Location::InSession(loc) => Some(loc),
            Location::OutOfSession => None,
        }
    }
}

/// A bucket of one trading day.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BucketLocation {
    pub trading_day: NaiveDate,
    /// Bucket index within the trading day.
    pub index: u32,
    /// Index of the owning window.
    pub window: usize,
    /// Bucket start, exchange-local.
    pub start: NaiveDateTime,
    pub night: bool,
}

/// A product class: its session templates in effective-date order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionClass {
    pub name: String,
    versions: Vec<SessionTemplate>,
}

impl SessionClass {
    pub fn from_config(name: &str, config: &SessionClassConfig) -> Result<Self> {
        if config.versions.is_empty() {
            return Err(Error::config(format!("session class {name} has no versions")));
        }
        let mut versions = config
            .versions
            .iter()
            .map(SessionTemplate::from_config)
            .collect::<Result<Vec<_>>>()
            .map_err(|e| Error::config(format!("session class {name}: {e}")))?;
        // None sorts first
        versions.sort_by_key(|v| v.effective_from);

        Ok(Self {
            name: name.to_string(),
            versions,
        })
    }

    /// Template in force on a trading day. Days before the first
    /// `effective_from` use the earliest template.
    pub fn template_on(&self, trading_day: NaiveDate) -> &SessionTemplate {
        self.versions
            .iter()
            .rev()
            .find(|v| v.effective_from.map_or(true, |from| from <= trading_day))
            .unwrap_or(&self.versions[0])
    }

    /// Locate a timestamp. The trading day is the calendar date itself or, for
    /// the after-midnight part of a night window, the day before.
    pub fn locate(&self, ts: NaiveDateTime, grace_ms: i64) -> Location {
        let date = ts.date();
        let ms = ms_of_day(ts.time());
        let candidates = [(date, ms), (date - Duration::days(1), ms + DAY_MS)];

        let exact = candidates.iter().find_map(|&(day, offset)| {
            self.template_on(day)
                .find_exact(offset)
                .map(|hit| (day, hit))
        });
        let hit = exact.or_else(|| {
            candidates.iter().find_map(|&(day, offset)| {
                self.template_on(day)
                    .find_near_edge(offset, grace_ms)
                    .map(|hit| (day, hit))
            })
        });

        match hit {
            Some((day, (window, index))) => {
                let template = self.template_on(day);
                match self.location(template, day, window, index) {
                    Some(loc) => Location::InSession(loc),
                    None => Location::OutOfSession,
                }
            }
            None => Location::OutOfSession,
        }
    }

    fn location(
        &self,
        template: &SessionTemplate,
        trading_day: NaiveDate,
        window: usize,
        index: u32,
    ) -> Option<BucketLocation> {
        let offset = template.bucket_offset(index)?;
        let start = trading_day.and_time(NaiveTime::MIN) + Duration::milliseconds(offset);
        Some(BucketLocation {
            trading_day,
            index,
            window,
            start,
            night: template.windows()[window].night,
        })
    }

    /// Bucket by index on a trading day.
    pub fn bucket(&self, trading_day: NaiveDate, index: u32) -> Option<BucketLocation> {
        let template = self.template_on(trading_day);
        let (window, _) = template.window_of(index)?;
        self.location(template, trading_day, window, index)
    }

    /// Every bucket of a trading day, in time order.
    pub fn enumerate(&self, trading_day: NaiveDate) -> Vec<BucketLocation> {
        let template = self.template_on(trading_day);
        (0..template.bucket_count())
            .filter_map(|index| self.bucket(trading_day, index))
            .collect()
    }

    /// Instant around which the exchange restarts its cumulative counters
    /// for `day`, if it does. The restart sits midway through the break
    /// before the evening window for classes that trade at night (such an
    /// exchange day carries on into the next weekday's day windows), and
    /// midway through the overnight break otherwise.
    fn counter_restart(&self, day: NaiveDate) -> Option<NaiveDateTime> {
        let template = self.template_on(day);
        let midnight = day.and_time(NaiveTime::MIN);

        let offset = match template.evening_window() {
            Some(_) if matches!(day.weekday(), Weekday::Sat | Weekday::Sun) => return None,
            Some(i) => (template.windows[i - 1].end_ms + template.windows[i].start_ms) / 2,
            None => {
                let prev = self.template_on(day - Duration::days(1));
                if prev.evening_window().is_some() {
                    return None;
                }
                let prev_close = prev.windows.last()?.end_ms - DAY_MS;
                (prev_close + template.windows.first()?.start_ms) / 2
            }
        };
        Some(midnight + Duration::milliseconds(offset))
    }

    /// Start of the exchange day whose cumulative counters `ts` reports
    /// against. Two timestamps with different epochs never share a counter.
    pub fn counter_epoch(&self, ts: NaiveDateTime) -> Option<NaiveDateTime> {
        let date = ts.date();
        (-1..=7)
            .map(|back| date - Duration::days(back))
            .filter_map(|day| self.counter_restart(day))
            .find(|&restart| restart <= ts)
    }

    /// Complete a time-of-day reported for a trading day into a calendar
    /// timestamp: after-midnight night times move to the next calendar date.
    pub fn resolve_time(&self, trading_day: NaiveDate, time: NaiveTime, grace_ms: i64) -> NaiveDateTime {
        let template = self.template_on(trading_day);
        let offset = ms_of_day(time);
        let next_day = template.find_exact(offset).is_none()
            && (template.find_exact(offset + DAY_MS).is_some()
                || (template.find_near_edge(offset, grace_ms).is_none()
                    && template.find_near_edge(offset + DAY_MS, grace_ms).is_some()));
        if next_day {
            (trading_day + Duration::days(1)).and_time(time)
        } else {
            trading_day.and_time(time)
        }
    }
}
