//! Market clock: IST time helpers and qualification math.
//!
//! Every time-dependent decision (trading date, cutoff, lookback) goes
//! through a [`Clock`] so tests can pin the current instant.

use chrono::{DateTime, Datelike, Duration, FixedOffset, NaiveDate, NaiveTime, Utc, Weekday};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex};

// ============================================================================
// Timezone
// ============================================================================

/// India Standard Time (UTC+5:30).
///
/// SAFETY: 19800 seconds is always within valid FixedOffset range
/// (which supports -23:59:59 to +23:59:59).
pub fn ist() -> FixedOffset {
    FixedOffset::east_opt(5 * 3600 + 30 * 60).expect("UTC+5:30 is a valid timezone offset")
}

/// Convert a UTC instant to IST.
pub fn to_ist(now: DateTime<Utc>) -> DateTime<FixedOffset> {
    now.with_timezone(&ist())
}

/// The IST calendar date for an instant.
pub fn trading_date(now: DateTime<Utc>) -> NaiveDate {
    to_ist(now).date_naive()
}

pub fn is_weekend(date: NaiveDate) -> bool {
    matches!(date.weekday(), Weekday::Sat | Weekday::Sun)
}

/// True once the IST wall clock has reached `cutoff` on its own day.
pub fn is_past_cutoff(now: DateTime<Utc>, cutoff: NaiveTime) -> bool {
    to_ist(now).time() >= cutoff
}

// ============================================================================
// Qualification Math
// ============================================================================

/// Unrounded percent change from `previous` to `current`. Thresholds are
/// tested against this value.
///
/// Returns 0 when there is no previous value to compare against.
pub fn raw_percent_change(current: f64, previous: f64) -> f64 {
    if previous == 0.0 || !previous.is_finite() || !current.is_finite() {
        return 0.0;
    }
    (current - previous) / previous * 100.0
}

/// [`raw_percent_change`] rounded to two decimals, for stored records.
pub fn percent_change(current: f64, previous: f64) -> f64 {
    round2(raw_percent_change(current, previous))
}

pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// `|pct| >= threshold`
pub fn is_qualifying(percent: f64, threshold: f64) -> bool {
    percent.abs() >= threshold
}

/// Direction of a move.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Direction {
    Up,
    Down,
    Neutral,
}

impl Direction {
    pub fn from_percent(percent: f64) -> Self {
        if percent > 0.0 {
            Self::Up
        } else if percent < 0.0 {
            Self::Down
        } else {
            Self::Neutral
        }
    }

    pub fn to_db_string(&self) -> &'static str {
        match self {
            Self::Up => "UP",
            Self::Down => "DOWN",
            Self::Neutral => "NEUTRAL",
        }
    }

    pub fn from_db_string(s: &str) -> Self {
        match s {
            "UP" => Self::Up,
            "DOWN" => Self::Down,
            _ => Self::Neutral,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.to_db_string())
    }
}

// ============================================================================
// Clock
// ============================================================================

/// Source of the current instant.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Settable clock for tests and replays.
#[derive(Debug)]
pub struct FixedClock {
    now: Mutex<DateTime<Utc>>,
}

impl FixedClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    /// Build from an IST wall-clock time.
    pub fn at_ist(date: NaiveDate, time: NaiveTime) -> Self {
        Self::new(ist_to_utc(date, time))
    }

    pub fn set(&self, now: DateTime<Utc>) {
        if let Ok(mut guard) = self.now.lock() {
            *guard = now;
        }
    }

    pub fn set_ist(&self, date: NaiveDate, time: NaiveTime) {
        self.set(ist_to_utc(date, time));
    }

    pub fn advance(&self, by: Duration) {
        if let Ok(mut guard) = self.now.lock() {
            *guard += by;
        }
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.now.lock().map(|guard| *guard).unwrap_or_else(|_| Utc::now())
    }
}

fn ist_to_utc(date: NaiveDate, time: NaiveTime) -> DateTime<Utc> {
    (date.and_time(time) - Duration::seconds(i64::from(ist().local_minus_utc()))).and_utc()
}

/// Clock plus the configured cutoff.
#[derive(Clone)]
pub struct MarketClock {
    clock: Arc<dyn Clock>,
    cutoff: NaiveTime,
}

impl MarketClock {
    pub fn new(clock: Arc<dyn Clock>, cutoff: NaiveTime) -> Self {
        Self { clock, cutoff }
    }

    pub fn system(cutoff: NaiveTime) -> Self {
        Self::new(Arc::new(SystemClock), cutoff)
    }

    /// The underlying clock, for collaborators that only need `now()`.
    pub fn clock(&self) -> Arc<dyn Clock> {
        Arc::clone(&self.clock)
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Today's IST date.
    pub fn today(&self) -> NaiveDate {
        trading_date(self.now())
    }

    pub fn cutoff(&self) -> NaiveTime {
        self.cutoff
    }

    pub fn is_past_cutoff(&self) -> bool {
        is_past_cutoff(self.now(), self.cutoff)
    }
}

impl fmt::Debug for MarketClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MarketClock")
            .field("now", &self.now())
            .field("cutoff", &self.cutoff)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn time(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    #[test]
    fn test_percent_change_example() {
        let pct = percent_change(1012.0, 1000.0);
        assert!((pct - 1.2).abs() < 1e-9);
        assert_eq!(Direction::from_percent(pct), Direction::Up);
        assert!(is_qualifying(pct, 1.0));
    }

    #[test]
    fn test_qualification_threshold() {
        assert!(is_qualifying(1.5, 1.0));
        assert_eq!(Direction::from_percent(1.5), Direction::Up);
        assert!(!is_qualifying(-0.5, 1.0));
        assert!(is_qualifying(-1.0, 1.0));
        assert_eq!(Direction::from_percent(-0.5), Direction::Down);
        assert_eq!(Direction::from_percent(0.0), Direction::Neutral);
    }

    #[test]
    fn test_threshold_uses_unrounded_change() {
        // 0.996% rounds to 1.00 but is below a 1% gate
        let raw = raw_percent_change(1009.96, 1000.0);
        assert_eq!(percent_change(1009.96, 1000.0), 1.0);
        assert!(!is_qualifying(raw, 1.0));
        assert!(is_qualifying(raw_percent_change(1010.0, 1000.0), 1.0));

        let oi = raw_percent_change(106_996.0, 100_000.0);
        assert!(!is_qualifying(oi, 7.0));
        assert!(is_qualifying(raw_percent_change(107_000.0, 100_000.0), 7.0));
    }

    #[test]
    fn test_percent_change_zero_previous() {
        assert_eq!(percent_change(100.0, 0.0), 0.0);
    }

    #[test]
    fn test_trading_date_crosses_midnight_utc() {
        // 20:00 UTC on the 5th is 01:30 IST on the 6th
        let now = date(2024, 3, 5).and_hms_opt(20, 0, 0).unwrap().and_utc();
        assert_eq!(trading_date(now), date(2024, 3, 6));
    }

    #[test]
    fn test_is_weekend() {
        assert!(is_weekend(date(2024, 3, 9)));
        assert!(is_weekend(date(2024, 3, 10)));
        assert!(!is_weekend(date(2024, 3, 8)));
    }

    #[test]
    fn test_cutoff_in_ist() {
        let clock = FixedClock::at_ist(date(2024, 3, 11), time(9, 24));
        assert!(!is_past_cutoff(clock.now(), time(9, 25)));

        clock.advance(Duration::minutes(1));
        assert!(is_past_cutoff(clock.now(), time(9, 25)));

        // 03:55 UTC == 09:25 IST
        assert_eq!(clock.now(), date(2024, 3, 11).and_hms_opt(3, 55, 0).unwrap().and_utc());
    }

    #[test]
    fn test_market_clock_today() {
        let fixed = Arc::new(FixedClock::at_ist(date(2024, 3, 11), time(23, 50)));
        let clock = MarketClock::new(fixed.clone(), time(9, 25));
        assert_eq!(clock.today(), date(2024, 3, 11));
        assert!(clock.is_past_cutoff());

        fixed.advance(Duration::minutes(20));
        assert_eq!(clock.today(), date(2024, 3, 12));
        assert!(!clock.is_past_cutoff());
    }

    #[test]
    fn test_direction_db_roundtrip() {
        for d in [Direction::Up, Direction::Down, Direction::Neutral] {
            assert_eq!(Direction::from_db_string(d.to_db_string()), d);
        }
        assert_eq!(serde_json::to_string(&Direction::Up).unwrap(), "\"UP\"");
    }
}
