//! Market data layer for NSE equities, stock futures and indices.
//!
//! The [`MarketDataClient`] talks to the upstream quote and chart API.
//! Engines depend only on the [`MarketDataSource`] trait so they can be
//! exercised against fakes.

mod client;
mod credentials;
mod normalize;
mod provider;
mod rate_limiter;
mod single_flight;

pub use client::{MarketDataClient, CHARTS_INTRADAY_ENDPOINT, QUOTE_ENDPOINT};
pub use credentials::{
    CredentialProvider, Credentials, StaticCredentialProvider, StoredCredentialProvider,
};
pub use normalize::{aggregate_candles, normalize_quotes, CandleResponse, QuoteResponse};
pub use provider::MarketDataSource;
pub use rate_limiter::{shared_gate, RateGate, SharedRateGate};
pub use single_flight::{signature, SingleFlight};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;

// ============================================================================
// Exchange Segments
// ============================================================================

/// Instrument namespace used by the upstream API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ExchangeSegment {
    /// Cash equities
    #[serde(rename = "NSE_EQ")]
    NseEq,
    /// Futures & options
    #[serde(rename = "NSE_FNO")]
    NseFno,
    /// Indices
    #[serde(rename = "IDX_I")]
    IdxI,
}

impl ExchangeSegment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NseEq => "NSE_EQ",
            Self::NseFno => "NSE_FNO",
            Self::IdxI => "IDX_I",
        }
    }

    /// Instrument type sent with chart requests.
    pub fn instrument(&self) -> &'static str {
        match self {
            Self::NseEq => "EQUITY",
            Self::NseFno => "FUTSTK",
            Self::IdxI => "INDEX",
        }
    }
}

impl fmt::Display for ExchangeSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExchangeSegment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "NSE_EQ" => Ok(Self::NseEq),
            "NSE_FNO" => Ok(Self::NseFno),
            "IDX_I" => Ok(Self::IdxI),
            other => Err(format!("Unknown exchange segment: {}", other)),
        }
    }
}

/// A single instrument on a segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstrumentRef {
    pub segment: ExchangeSegment,
    pub security_id: u64,
}

impl InstrumentRef {
    pub fn new(segment: ExchangeSegment, security_id: u64) -> Self {
        Self {
            segment,
            security_id,
        }
    }
}

impl fmt::Display for InstrumentRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.segment, self.security_id)
    }
}

// ============================================================================
// Core Data Types
// ============================================================================

/// Normalized quote for one instrument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    pub segment: ExchangeSegment,
    pub security_id: u64,
    pub last_price: f64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub previous_close: f64,
    pub volume: i64,
    /// Only present on derivative quotes
    pub open_interest: Option<i64>,
    pub change: f64,
    pub change_percent: f64,
}

/// Aggregated daily bar for a past session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyOhlc {
    pub date: NaiveDate,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: i64,
}

/// Set of instruments to quote, grouped by segment.
///
/// Segments and ids are kept sorted so the same set of instruments always
/// produces the same request body and signature.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QuoteRequest {
    ids: BTreeMap<ExchangeSegment, BTreeSet<u64>>,
}

impl QuoteRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, segment: ExchangeSegment, security_id: u64) -> &mut Self {
        self.ids.entry(segment).or_default().insert(security_id);
        self
    }

    pub fn with(mut self, segment: ExchangeSegment, security_id: u64) -> Self {
        self.add(segment, security_id);
        self
    }

    /// Number of (segment, id) pairs.
    pub fn len(&self) -> usize {
        self.ids.values().map(BTreeSet::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Flattened pairs in segment order, then id order.
    pub fn pairs(&self) -> impl Iterator<Item = InstrumentRef> + '_ {
        self.ids.iter().flat_map(|(segment, ids)| {
            ids.iter()
                .map(move |id| InstrumentRef::new(*segment, *id))
        })
    }

    /// Split into requests of at most `size` pairs each.
    pub fn chunks(&self, size: usize) -> Vec<QuoteRequest> {
        let size = size.max(1);
        let pairs: Vec<InstrumentRef> = self.pairs().collect();
        pairs
            .chunks(size)
            .map(|chunk| {
                let mut request = QuoteRequest::new();
                for pair in chunk {
                    request.add(pair.segment, pair.security_id);
                }
                request
            })
            .collect()
    }

    /// Upstream body: `{"NSE_EQ": [..], "NSE_FNO": [..]}`.
    pub fn to_body(&self) -> BTreeMap<&'static str, Vec<u64>> {
        self.ids
            .iter()
            .filter(|(_, ids)| !ids.is_empty())
            .map(|(segment, ids)| (segment.as_str(), ids.iter().copied().collect()))
            .collect()
    }

    /// Canonical parameter string used to build the request signature.
    pub fn canonical_params(&self) -> String {
        self.ids
            .iter()
            .filter(|(_, ids)| !ids.is_empty())
            .map(|(segment, ids)| {
                let ids: Vec<String> = ids.iter().map(u64::to_string).collect();
                format!("{}={}", segment.as_str(), ids.join(","))
            })
            .collect::<Vec<_>>()
            .join("&")
    }
}

/// Quotes keyed by segment and security id.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QuoteBatch {
    quotes: HashMap<ExchangeSegment, HashMap<u64, Quote>>,
}

impl QuoteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, quote: Quote) {
        self.quotes
            .entry(quote.segment)
            .or_default()
            .insert(quote.security_id, quote);
    }

    pub fn get(&self, segment: ExchangeSegment, security_id: u64) -> Option<&Quote> {
        self.quotes.get(&segment).and_then(|ids| ids.get(&security_id))
    }

    /// All quotes for one segment.
    pub fn segment(&self, segment: ExchangeSegment) -> impl Iterator<Item = &Quote> {
        self.quotes.get(&segment).into_iter().flat_map(HashMap::values)
    }

    pub fn merge(&mut self, other: QuoteBatch) {
        for (segment, ids) in other.quotes {
            self.quotes.entry(segment).or_default().extend(ids);
        }
    }

    pub fn len(&self) -> usize {
        self.quotes.values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_segment_parse() {
        assert_eq!("NSE_FNO".parse::<ExchangeSegment>().unwrap(), ExchangeSegment::NseFno);
        assert!("BSE_EQ".parse::<ExchangeSegment>().is_err());
        assert_eq!(ExchangeSegment::IdxI.to_string(), "IDX_I");
    }

    #[test]
    fn test_request_is_canonical() {
        let a = QuoteRequest::new()
            .with(ExchangeSegment::NseFno, 9)
            .with(ExchangeSegment::NseEq, 3)
            .with(ExchangeSegment::NseEq, 1);
        let b = QuoteRequest::new()
            .with(ExchangeSegment::NseEq, 1)
            .with(ExchangeSegment::NseEq, 3)
            .with(ExchangeSegment::NseFno, 9);

        assert_eq!(a, b);
        assert_eq!(a.canonical_params(), "NSE_EQ=1,3&NSE_FNO=9");
        assert_eq!(a.len(), 3);
    }

    #[test]
    fn test_request_body_shape() {
        let request = QuoteRequest::new()
            .with(ExchangeSegment::IdxI, 13)
            .with(ExchangeSegment::NseEq, 2885);
        let body = serde_json::to_value(request.to_body()).unwrap();
        assert_eq!(body, serde_json::json!({ "NSE_EQ": [2885], "IDX_I": [13] }));
    }

    #[test]
    fn test_chunks_respect_size() {
        let mut request = QuoteRequest::new();
        for id in 0..1500 {
            request.add(ExchangeSegment::NseEq, id);
        }
        for id in 0..700 {
            request.add(ExchangeSegment::NseFno, id);
        }

        let chunks = request.chunks(1000);
        assert_eq!(chunks.len(), 3);
        assert!(chunks.iter().all(|c| c.len() <= 1000));
        assert_eq!(chunks.iter().map(QuoteRequest::len).sum::<usize>(), 2200);
        // second chunk straddles both segments
        assert_eq!(chunks[1].to_body().len(), 2);
    }

    #[test]
    fn test_batch_merge_and_get() {
        let quote = |segment, id, ltp| Quote {
            segment,
            security_id: id,
            last_price: ltp,
            open: 0.0,
            high: 0.0,
            low: 0.0,
            close: 0.0,
            previous_close: 0.0,
            volume: 0,
            open_interest: None,
            change: 0.0,
            change_percent: 0.0,
        };

        let mut a = QuoteBatch::new();
        a.insert(quote(ExchangeSegment::NseEq, 1, 10.0));
        let mut b = QuoteBatch::new();
        b.insert(quote(ExchangeSegment::NseFno, 1, 11.0));

        a.merge(b);
        assert_eq!(a.len(), 2);
        assert_eq!(a.get(ExchangeSegment::NseFno, 1).unwrap().last_price, 11.0);
        assert!(a.get(ExchangeSegment::IdxI, 1).is_none());
        assert_eq!(a.segment(ExchangeSegment::NseEq).count(), 1);
    }
}
