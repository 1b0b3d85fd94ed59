//! Upstream wire types and their normalization into [`Quote`] / [`DailyOhlc`].

use chrono::NaiveDate;
use serde::Deserialize;
use std::collections::HashMap;
use tracing::{debug, warn};

use super::{DailyOhlc, ExchangeSegment, Quote, QuoteBatch};
use crate::clock::{percent_change, round2};
use crate::error::{Error, Result};

// ============================================================================
// Quote Response
// ============================================================================

/// Response from `POST /v2/marketfeed/quote`.
///
/// `data` is namespaced by segment, then keyed by security id as a string.
#[derive(Debug, Clone, Deserialize)]
pub struct QuoteResponse {
    #[serde(default)]
    pub data: HashMap<String, HashMap<String, WireQuote>>,
    #[serde(default)]
    pub status: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WireOhlc {
    #[serde(default)]
    pub open: f64,
    #[serde(default)]
    pub close: f64,
    #[serde(default)]
    pub high: f64,
    #[serde(default)]
    pub low: f64,
}

/// Per-instrument quote payload. Fields vary by segment, so most are optional.
#[derive(Debug, Clone, Deserialize)]
pub struct WireQuote {
    #[serde(default)]
    pub last_price: f64,
    #[serde(default)]
    pub ohlc: Option<WireOhlc>,
    #[serde(default, alias = "prev_close")]
    pub previous_close: Option<f64>,
    #[serde(default)]
    pub volume: Option<i64>,
    #[serde(default)]
    pub oi: Option<i64>,
    #[serde(default)]
    pub net_change: Option<f64>,
}

/// Flatten a namespaced quote response into a [`QuoteBatch`].
///
/// Entries under unknown segments or with non-numeric ids are skipped.
pub fn normalize_quotes(response: QuoteResponse) -> Result<QuoteBatch> {
    if response.status.eq_ignore_ascii_case("failure") {
        return Err(Error::Upstream {
            status: 200,
            message: "quote response reported failure".into(),
        });
    }

    let mut batch = QuoteBatch::new();

    for (segment_key, entries) in response.data {
        let segment = match segment_key.parse::<ExchangeSegment>() {
            Ok(segment) => segment,
            Err(_) => {
                debug!(segment = %segment_key, "Skipping unknown segment in quote response");
                continue;
            }
        };

        for (id_key, wire) in entries {
            let security_id = match id_key.parse::<u64>() {
                Ok(id) => id,
                Err(_) => {
                    warn!(segment = %segment, id = %id_key, "Skipping non-numeric security id");
                    continue;
                }
            };
            batch.insert(normalize_quote(segment, security_id, wire));
        }
    }

    Ok(batch)
}

fn normalize_quote(segment: ExchangeSegment, security_id: u64, wire: WireQuote) -> Quote {
    let ohlc = wire.ohlc.unwrap_or_default();

    let previous_close = match wire.previous_close {
        Some(prev) if prev > 0.0 => prev,
        _ => ohlc.close,
    };

    let (change, change_percent) = if previous_close > 0.0 {
        (
            round2(wire.last_price - previous_close),
            percent_change(wire.last_price, previous_close),
        )
    } else {
        (0.0, 0.0)
    };

    Quote {
        segment,
        security_id,
        last_price: wire.last_price,
        open: ohlc.open,
        high: ohlc.high,
        low: ohlc.low,
        close: ohlc.close,
        previous_close,
        volume: wire.volume.unwrap_or(0),
        open_interest: wire.oi,
        change,
        change_percent,
    }
}

// ============================================================================
// Intraday Charts
// ============================================================================

/// Response from `POST /v2/charts/intraday` (parallel arrays).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CandleResponse {
    #[serde(default)]
    pub open: Vec<f64>,
    #[serde(default)]
    pub high: Vec<f64>,
    #[serde(default)]
    pub low: Vec<f64>,
    #[serde(default)]
    pub close: Vec<f64>,
    #[serde(default)]
    pub volume: Vec<i64>,
    #[serde(default)]
    pub timestamp: Vec<i64>,
}

/// Collapse one session's intraday candles into a daily bar.
///
/// Returns `None` when the session has no candles.
pub fn aggregate_candles(date: NaiveDate, candles: &CandleResponse) -> Option<DailyOhlc> {
    let n = candles
        .open
        .len()
        .min(candles.high.len())
        .min(candles.low.len())
        .min(candles.close.len());
    if n == 0 {
        return None;
    }

    let high = candles.high[..n].iter().copied().fold(f64::MIN, f64::max);
    let low = candles.low[..n].iter().copied().fold(f64::MAX, f64::min);

    Some(DailyOhlc {
        date,
        open: candles.open[0],
        high,
        low,
        close: candles.close[n - 1],
        volume: candles.volume.iter().sum(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(value: serde_json::Value) -> QuoteResponse {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_normalize_namespaced_response() {
        let response = parse(json!({
            "data": {
                "IDX_I": {
                    "13": { "last_price": 1012.0, "ohlc": { "open": 1001.0, "close": 1000.0, "high": 1015.0, "low": 998.0 } }
                },
                "NSE_FNO": {
                    "52023": { "last_price": 250.5, "oi": 120000, "volume": 5000,
                               "ohlc": { "open": 248.0, "close": 245.0, "high": 251.0, "low": 247.0 } }
                }
            },
            "status": "success"
        }));

        let batch = normalize_quotes(response).unwrap();
        assert_eq!(batch.len(), 2);

        let index = batch.get(ExchangeSegment::IdxI, 13).unwrap();
        assert_eq!(index.previous_close, 1000.0);
        assert_eq!(index.change, 12.0);
        assert!((index.change_percent - 1.2).abs() < 1e-9);
        assert_eq!(index.open_interest, None);

        let future = batch.get(ExchangeSegment::NseFno, 52023).unwrap();
        assert_eq!(future.open_interest, Some(120_000));
        assert_eq!(future.volume, 5000);
    }

    #[test]
    fn test_explicit_previous_close_wins() {
        let response = parse(json!({
            "data": { "NSE_EQ": { "1": { "last_price": 102.0, "previous_close": 100.0,
                                         "ohlc": { "open": 0, "close": 90.0, "high": 0, "low": 0 } } } },
            "status": "success"
        }));
        let quote = normalize_quotes(response)
            .unwrap()
            .get(ExchangeSegment::NseEq, 1)
            .cloned()
            .unwrap();
        assert_eq!(quote.previous_close, 100.0);
        assert!((quote.change_percent - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_missing_close_yields_zero_change() {
        let response = parse(json!({
            "data": { "NSE_EQ": { "7": { "last_price": 50.0 } } },
            "status": "success"
        }));
        let batch = normalize_quotes(response).unwrap();
        let quote = batch.get(ExchangeSegment::NseEq, 7).unwrap();
        assert_eq!(quote.change, 0.0);
        assert_eq!(quote.change_percent, 0.0);
    }

    #[test]
    fn test_unknown_segments_and_ids_skipped() {
        let response = parse(json!({
            "data": {
                "BSE_EQ": { "1": { "last_price": 1.0 } },
                "NSE_EQ": { "abc": { "last_price": 1.0 }, "2": { "last_price": 1.0 } }
            },
            "status": "success"
        }));
        let batch = normalize_quotes(response).unwrap();
        assert_eq!(batch.len(), 1);
        assert!(batch.get(ExchangeSegment::NseEq, 2).is_some());
    }

    #[test]
    fn test_failure_status_is_error() {
        let response = parse(json!({ "data": {}, "status": "failure" }));
        assert!(matches!(
            normalize_quotes(response),
            Err(Error::Upstream { .. })
        ));
    }

    #[test]
    fn test_aggregate_candles() {
        let candles = CandleResponse {
            open: vec![100.0, 101.0, 99.0],
            high: vec![102.0, 105.0, 101.0],
            low: vec![99.5, 100.0, 97.0],
            close: vec![101.0, 99.5, 100.5],
            volume: vec![10, 20, 30],
            timestamp: vec![1, 2, 3],
        };
        let date = NaiveDate::from_ymd_opt(2024, 3, 8).unwrap();
        let day = aggregate_candles(date, &candles).unwrap();

        assert_eq!(day.open, 100.0);
        assert_eq!(day.high, 105.0);
        assert_eq!(day.low, 97.0);
        assert_eq!(day.close, 100.5);
        assert_eq!(day.volume, 60);
        assert_eq!(day.date, date);
    }

    #[test]
    fn test_aggregate_empty_is_none() {
        let date = NaiveDate::from_ymd_opt(2024, 3, 8).unwrap();
        assert!(aggregate_candles(date, &CandleResponse::default()).is_none());
    }
}
