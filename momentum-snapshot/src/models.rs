//! Domain types: reference data, qualification records and snapshots.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::clock::{is_qualifying, raw_percent_change, round2, Direction};
use crate::data::{DailyOhlc, Quote};

// ============================================================================
// Reference Data
// ============================================================================

/// A market sector tracked through its index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sector {
    pub id: i64,
    pub name: String,
    pub symbol: String,
    /// Index security id on `IDX_I`
    pub index_security_id: Option<u64>,
    pub is_active: bool,
}

/// A sector constituent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stock {
    pub id: i64,
    pub symbol: String,
    pub name: String,
    /// Cash security id on `NSE_EQ`
    pub spot_security_id: Option<u64>,
    /// Current-month future on `NSE_FNO`
    pub derivative_security_id: Option<u64>,
    pub is_fo_eligible: bool,
    /// Written by the pre-market job, never by the engines
    pub previous_day_oi: Option<i64>,
    pub oi_updated_at: Option<DateTime<Utc>>,
}

// ============================================================================
// Qualification Records
// ============================================================================

/// Sector with its live index move.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SectorQuote {
    pub sector_id: i64,
    pub name: String,
    pub symbol: String,
    pub current_value: f64,
    pub previous_close: f64,
    pub change: f64,
    pub percent_change: f64,
    pub direction: Direction,
    pub is_qualifying: bool,
}

impl SectorQuote {
    pub fn from_quote(sector: &Sector, quote: &Quote, threshold: f64) -> Self {
        let raw = raw_percent_change(quote.last_price, quote.previous_close);
        let percent = round2(raw);
        Self {
            sector_id: sector.id,
            name: sector.name.clone(),
            symbol: sector.symbol.clone(),
            current_value: quote.last_price,
            previous_close: quote.previous_close,
            change: quote.change,
            percent_change: percent,
            direction: Direction::from_percent(percent),
            is_qualifying: is_qualifying(raw, threshold),
        }
    }

    /// Zeroed record for a sector without a usable quote.
    pub fn placeholder(sector: &Sector) -> Self {
        Self {
            sector_id: sector.id,
            name: sector.name.clone(),
            symbol: sector.symbol.clone(),
            current_value: 0.0,
            previous_close: 0.0,
            change: 0.0,
            percent_change: 0.0,
            direction: Direction::Neutral,
            is_qualifying: false,
        }
    }
}

/// Stock with its live spot move and derivative OI.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StockQuote {
    pub stock_id: i64,
    pub symbol: String,
    pub name: String,
    pub spot_security_id: Option<u64>,
    pub ltp: f64,
    pub previous_close: f64,
    pub change: f64,
    pub percent_change: f64,
    pub direction: Direction,
    pub volume: i64,
    /// From the derivative quote; `None` when it was missing
    pub current_oi: Option<i64>,
    pub previous_day_oi: Option<i64>,
    pub is_fo_eligible: bool,
    /// Stage A: price threshold met and F&O-eligible
    pub is_qualifying: bool,
}

impl StockQuote {
    pub fn build(stock: &Stock, spot: Option<&Quote>, derivative: Option<&Quote>, threshold: f64) -> Self {
        let (ltp, previous_close, change, volume) = spot
            .map(|q| (q.last_price, q.previous_close, q.change, q.volume))
            .unwrap_or((0.0, 0.0, 0.0, 0));
        let raw = raw_percent_change(ltp, previous_close);
        let percent = round2(raw);

        Self {
            stock_id: stock.id,
            symbol: stock.symbol.clone(),
            name: stock.name.clone(),
            spot_security_id: stock.spot_security_id,
            ltp,
            previous_close,
            change,
            percent_change: percent,
            direction: Direction::from_percent(percent),
            volume,
            current_oi: derivative.and_then(|q| q.open_interest),
            previous_day_oi: stock.previous_day_oi,
            is_fo_eligible: stock.is_fo_eligible,
            is_qualifying: is_qualifying(raw, threshold) && stock.is_fo_eligible,
        }
    }
}

/// Breakout classification against the previous session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BreakoutSignal {
    Breakout,
    Breakdown,
    None,
}

impl BreakoutSignal {
    pub fn classify(ltp: f64, previous: &DailyOhlc) -> Self {
        if ltp > previous.high {
            Self::Breakout
        } else if ltp < previous.low {
            Self::Breakdown
        } else {
            Self::None
        }
    }

    pub fn to_db_string(&self) -> &'static str {
        match self {
            Self::Breakout => "BREAKOUT",
            Self::Breakdown => "BREAKDOWN",
            Self::None => "NONE",
        }
    }

    pub fn from_db_string(s: &str) -> Option<Self> {
        match s {
            "BREAKOUT" => Some(Self::Breakout),
            "BREAKDOWN" => Some(Self::Breakdown),
            "NONE" => Some(Self::None),
            _ => None,
        }
    }
}

/// Previous session levels and the resulting signal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakoutInfo {
    pub previous_date: NaiveDate,
    pub previous_high: f64,
    pub previous_low: f64,
    pub previous_close: f64,
    pub signal: BreakoutSignal,
}

impl BreakoutInfo {
    pub fn from_ohlc(ltp: f64, previous: &DailyOhlc) -> Self {
        Self {
            previous_date: previous.date,
            previous_high: previous.high,
            previous_low: previous.low,
            previous_close: previous.close,
            signal: BreakoutSignal::classify(ltp, previous),
        }
    }
}

/// Stage-A stock after the open-interest stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OiQualifiedStock {
    #[serde(flatten)]
    pub stock: StockQuote,
    pub oi_change_percent: Option<f64>,
    /// Previous-day OI was zero or unknown, so the OI stage was skipped
    pub oi_bypassed: bool,
    /// Passed the OI stage (or bypassed it)
    pub oi_qualifying: bool,
    pub breakout: Option<BreakoutInfo>,
}

impl OiQualifiedStock {
    pub fn evaluate(stock: StockQuote, oi_threshold: f64) -> Self {
        let (oi_change_percent, oi_bypassed, oi_qualifying) =
            match (stock.previous_day_oi, stock.current_oi) {
                (None, _) | (Some(0), _) => (None, true, true),
                (Some(_), None) => (None, false, false),
                (Some(previous), Some(current)) => {
                    let raw = raw_percent_change(current as f64, previous as f64);
                    (Some(round2(raw)), false, is_qualifying(raw, oi_threshold))
                }
            };

        Self {
            stock,
            oi_change_percent,
            oi_bypassed,
            oi_qualifying,
            breakout: None,
        }
    }
}

/// Stage-A stocks split by the OI stage. The two lists are disjoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OiPartition {
    pub qualifying: Vec<OiQualifiedStock>,
    pub watchlist: Vec<OiQualifiedStock>,
}

impl OiPartition {
    pub fn from_stocks(stocks: Vec<OiQualifiedStock>) -> Self {
        let (qualifying, watchlist) = stocks.into_iter().partition(|s| s.oi_qualifying);
        Self {
            qualifying,
            watchlist,
        }
    }

    pub fn len(&self) -> usize {
        self.qualifying.len() + self.watchlist.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ============================================================================
// Snapshots
// ============================================================================

/// Snapshot lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SnapshotStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl SnapshotStatus {
    pub fn to_db_string(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Processing => "PROCESSING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }

    pub fn from_db_string(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(Self::Pending),
            "PROCESSING" => Some(Self::Processing),
            "COMPLETED" => Some(Self::Completed),
            "FAILED" => Some(Self::Failed),
            _ => None,
        }
    }

    /// COMPLETED is terminal; a FAILED or stale PROCESSING run may be restarted.
    pub fn can_transition_to(&self, next: SnapshotStatus) -> bool {
        use SnapshotStatus::*;
        matches!(
            (self, next),
            (Pending, Processing)
                | (Pending, Failed)
                | (Processing, Processing)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Failed, Processing)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed)
    }
}

impl fmt::Display for SnapshotStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.to_db_string())
    }
}

/// One row per trading date.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: i64,
    pub trading_date: NaiveDate,
    pub snapshot_time: DateTime<Utc>,
    pub status: SnapshotStatus,
    pub total_sectors: u32,
    pub bullish_sectors: u32,
    pub bearish_sectors: u32,
    pub total_stocks: u32,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Aggregate counts written when a snapshot completes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotCounts {
    pub total_sectors: u32,
    pub bullish_sectors: u32,
    pub bearish_sectors: u32,
    pub total_stocks: u32,
}

/// Frozen sector values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SectorSnapshotRow {
    pub snapshot_id: i64,
    pub sector_id: i64,
    pub name: String,
    pub symbol: String,
    pub current_value: f64,
    pub previous_close: f64,
    pub change: f64,
    pub percent_change: f64,
    pub direction: Direction,
    pub is_qualifying: bool,
}

impl SectorSnapshotRow {
    pub fn from_quote(snapshot_id: i64, sector: &SectorQuote) -> Self {
        Self {
            snapshot_id,
            sector_id: sector.sector_id,
            name: sector.name.clone(),
            symbol: sector.symbol.clone(),
            current_value: sector.current_value,
            previous_close: sector.previous_close,
            change: sector.change,
            percent_change: sector.percent_change,
            direction: sector.direction,
            is_qualifying: sector.is_qualifying,
        }
    }

    /// Rebuild the live-shaped record.
    pub fn to_quote(&self) -> SectorQuote {
        SectorQuote {
            sector_id: self.sector_id,
            name: self.name.clone(),
            symbol: self.symbol.clone(),
            current_value: self.current_value,
            previous_close: self.previous_close,
            change: self.change,
            percent_change: self.percent_change,
            direction: self.direction,
            is_qualifying: self.is_qualifying,
        }
    }
}

/// Frozen stock values. `is_qualifying` separates qualifying from watchlist.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StockSnapshotRow {
    pub snapshot_id: i64,
    pub stock_id: i64,
    pub sector_id: i64,
    pub symbol: String,
    pub name: String,
    pub ltp: f64,
    pub previous_close: f64,
    pub change: f64,
    pub percent_change: f64,
    pub direction: Direction,
    pub volume: i64,
    pub current_oi: Option<i64>,
    pub previous_day_oi: Option<i64>,
    pub oi_change_percent: Option<f64>,
    pub oi_bypassed: bool,
    pub breakout_signal: Option<BreakoutSignal>,
    pub is_qualifying: bool,
}

impl StockSnapshotRow {
    pub fn from_stock(snapshot_id: i64, sector_id: i64, stock: &OiQualifiedStock) -> Self {
        Self {
            snapshot_id,
            stock_id: stock.stock.stock_id,
            sector_id,
            symbol: stock.stock.symbol.clone(),
            name: stock.stock.name.clone(),
            ltp: stock.stock.ltp,
            previous_close: stock.stock.previous_close,
            change: stock.stock.change,
            percent_change: stock.stock.percent_change,
            direction: stock.stock.direction,
            volume: stock.stock.volume,
            current_oi: stock.stock.current_oi,
            previous_day_oi: stock.stock.previous_day_oi,
            oi_change_percent: stock.oi_change_percent,
            oi_bypassed: stock.oi_bypassed,
            breakout_signal: stock.breakout.as_ref().map(|b| b.signal),
            is_qualifying: stock.oi_qualifying,
        }
    }
}

/// A snapshot with all of its rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotData {
    pub snapshot: Snapshot,
    pub sectors: Vec<SectorSnapshotRow>,
    pub stocks: Vec<StockSnapshotRow>,
}

impl SnapshotData {
    pub fn qualifying_stocks(&self) -> impl Iterator<Item = &StockSnapshotRow> {
        self.stocks.iter().filter(|s| s.is_qualifying)
    }

    pub fn watchlist_stocks(&self) -> impl Iterator<Item = &StockSnapshotRow> {
        self.stocks.iter().filter(|s| !s.is_qualifying)
    }

    pub fn stocks_in_sector(&self, sector_id: i64) -> impl Iterator<Item = &StockSnapshotRow> {
        self.stocks.iter().filter(move |s| s.sector_id == sector_id)
    }
}
