//! Market data source abstraction.
//!
//! Engines depend on this trait rather than on the HTTP client so they can
//! run against in-process fakes.

use async_trait::async_trait;
use chrono::NaiveDate;

use super::{DailyOhlc, InstrumentRef, QuoteBatch, QuoteRequest};
use crate::error::Result;

/// Anything that can serve quotes and previous-session bars.
#[async_trait]
pub trait MarketDataSource: Send + Sync {
    /// Fetch quotes for every instrument in the request.
    ///
    /// Instruments the upstream does not know are simply absent from the batch.
    async fn fetch_quotes(&self, request: &QuoteRequest) -> Result<QuoteBatch>;

    /// Daily bar for the most recent session before `today`.
    ///
    /// Returns `Error::NotFound` when no session is found within the lookback.
    async fn previous_day_ohlc(&self, instrument: InstrumentRef, today: NaiveDate)
        -> Result<DailyOhlc>;
}
