//! Stock engine: two-stage qualification of sector constituents.
//!
//! Stage A keeps F&O-eligible stocks whose spot move meets the price
//! threshold. Stage B compares the derivative's live open interest against
//! the previous day's and splits Stage-A stocks into qualifying and
//! watchlist. When enrichment is enabled every Stage-A stock gets a breakout
//! signal against the previous session's range before the split.

use anyhow::{Context, Result};
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use momentum_common::{CacheConfig, QualificationConfig};

use crate::cache::TwoTierCache;
use crate::clock::MarketClock;
use crate::data::{DailyOhlc, ExchangeSegment, InstrumentRef, MarketDataSource, QuoteRequest};
use crate::error::Error;
use crate::models::{BreakoutInfo, OiPartition, OiQualifiedStock, Stock, StockQuote};
use crate::storage::Database;

fn sector_cache_key(sector_id: i64) -> String {
    format!("stocks:sector:{}", sector_id)
}

fn ohlc_cache_key(instrument: InstrumentRef, date: chrono::NaiveDate) -> String {
    format!("ohlc:{}:{}:{}", instrument.segment, instrument.security_id, date)
}

/// Combined spot and derivative request for a set of stocks.
fn stock_request(stocks: &[Stock]) -> QuoteRequest {
    let mut request = QuoteRequest::new();
    for stock in stocks {
        if let Some(id) = stock.spot_security_id {
            request.add(ExchangeSegment::NseEq, id);
        }
        if let Some(id) = stock.derivative_security_id {
            request.add(ExchangeSegment::NseFno, id);
        }
    }
    request
}

/// Stock qualification over the market data source.
pub struct StockEngine {
    db: Database,
    source: Arc<dyn MarketDataSource>,
    cache: Arc<TwoTierCache>,
    clock: MarketClock,
    price_threshold: f64,
    oi_threshold: f64,
    breakout_enrichment: bool,
    stocks_ttl: Duration,
    ohlc_ttl: Duration,
}

impl StockEngine {
    pub fn new(
        db: Database,
        source: Arc<dyn MarketDataSource>,
        cache: Arc<TwoTierCache>,
        clock: MarketClock,
        qualification: &QualificationConfig,
        cache_config: &CacheConfig,
    ) -> Self {
        Self {
            db,
            source,
            cache,
            clock,
            price_threshold: qualification.price_threshold_pct,
            oi_threshold: qualification.oi_threshold_pct,
            breakout_enrichment: qualification.breakout_enrichment,
            stocks_ttl: cache_config.stocks_ttl(),
            ohlc_ttl: cache_config.ohlc_ttl(),
        }
    }

    /// Every constituent of a sector with its live move and OI.
    pub async fn get_stocks_in_sector(&self, sector_id: i64, force_refresh: bool) -> Result<Vec<StockQuote>> {
        let key = sector_cache_key(sector_id);
        if !force_refresh {
            if let Some(cached) = self.cache.get_json::<Vec<StockQuote>>(&key).await {
                debug!(sector_id, count = cached.len(), "Stocks served from cache");
                return Ok(cached);
            }
        }

        if self.db.get_sector(sector_id).await?.is_none() {
            return Err(Error::NotFound(format!("Sector {}", sector_id)).into());
        }

        let stocks = self
            .db
            .sector_stocks(sector_id)
            .await
            .with_context(|| format!("Failed to load constituents of sector {}", sector_id))?;

        let request = stock_request(&stocks);
        let batch = self
            .source
            .fetch_quotes(&request)
            .await
            .with_context(|| format!("Failed to fetch quotes for sector {}", sector_id))?;

        let records: Vec<StockQuote> = stocks
            .iter()
            .map(|stock| {
                let spot = stock
                    .spot_security_id
                    .and_then(|id| batch.get(ExchangeSegment::NseEq, id));
                let derivative = stock
                    .derivative_security_id
                    .and_then(|id| batch.get(ExchangeSegment::NseFno, id));
                StockQuote::build(stock, spot, derivative, self.price_threshold)
            })
            .collect();

        self.cache.set_json(&key, &records, Some(self.stocks_ttl)).await;

        debug!(
            sector_id,
            stocks = records.len(),
            quotes = batch.len(),
            "Sector stocks refreshed"
        );
        Ok(records)
    }

    /// Stage-A survivors.
    pub async fn get_qualifying_stocks(&self, sector_id: i64, force_refresh: bool) -> Result<Vec<StockQuote>> {
        let stocks = self.get_stocks_in_sector(sector_id, force_refresh).await?;
        Ok(stocks.into_iter().filter(|s| s.is_qualifying).collect())
    }

    /// Stage-A survivors split by the OI stage.
    pub async fn get_price_qualified_stocks_with_oi(
        &self,
        sector_id: i64,
        force_refresh: bool,
    ) -> Result<OiPartition> {
        let stage_a = self.get_qualifying_stocks(sector_id, force_refresh).await?;
        let mut evaluated: Vec<OiQualifiedStock> = stage_a
            .into_iter()
            .map(|stock| OiQualifiedStock::evaluate(stock, self.oi_threshold))
            .collect();

        if self.breakout_enrichment && !evaluated.is_empty() {
            self.enrich_breakouts(&mut evaluated).await;
        }

        let partition = OiPartition::from_stocks(evaluated);
        info!(
            sector_id,
            qualifying = partition.qualifying.len(),
            watchlist = partition.watchlist.len(),
            "OI stage complete"
        );
        Ok(partition)
    }

    /// Live quote for one stock.
    pub async fn get_stock_by_symbol(&self, symbol: &str) -> Result<StockQuote> {
        let stock = self
            .db
            .stock_by_symbol(symbol)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Stock {}", symbol)))?;

        let request = stock_request(std::slice::from_ref(&stock));
        let batch = self
            .source
            .fetch_quotes(&request)
            .await
            .with_context(|| format!("Failed to fetch quotes for {}", stock.symbol))?;

        let spot = stock
            .spot_security_id
            .and_then(|id| batch.get(ExchangeSegment::NseEq, id));
        let derivative = stock
            .derivative_security_id
            .and_then(|id| batch.get(ExchangeSegment::NseFno, id));
        Ok(StockQuote::build(&stock, spot, derivative, self.price_threshold))
    }

    // ========================================================================
    // Breakout Enrichment
    // ========================================================================

    /// Attach previous-session levels to every stock with a spot id.
    ///
    /// One task per stock; a failed lookup leaves that stock unenriched.
    async fn enrich_breakouts(&self, stocks: &mut [OiQualifiedStock]) {
        let today = self.clock.today();
        let mut indices = Vec::new();
        let mut handles = Vec::new();

        for (index, stock) in stocks.iter().enumerate() {
            let Some(security_id) = stock.stock.spot_security_id else {
                continue;
            };
            let instrument = InstrumentRef::new(ExchangeSegment::NseEq, security_id);
            let source = Arc::clone(&self.source);
            let cache = Arc::clone(&self.cache);
            let ttl = self.ohlc_ttl;

            indices.push(index);
            handles.push(tokio::spawn(async move {
                previous_ohlc_cached(source, cache, instrument, today, ttl).await
            }));
        }

        let results = join_all(handles).await;
        let mut enriched = 0usize;
        for (index, result) in indices.into_iter().zip(results) {
            let stock = &mut stocks[index];
            match result {
                Ok(Ok(ohlc)) => {
                    stock.breakout = Some(BreakoutInfo::from_ohlc(stock.stock.ltp, &ohlc));
                    enriched += 1;
                }
                Ok(Err(e)) => {
                    warn!(symbol = %stock.stock.symbol, error = %e, "Breakout enrichment failed");
                }
                Err(e) => {
                    warn!(symbol = %stock.stock.symbol, error = %e, "Breakout task aborted");
                }
            }
        }

        debug!(enriched, total = stocks.len(), "Breakout enrichment complete");
    }
}

async fn previous_ohlc_cached(
    source: Arc<dyn MarketDataSource>,
    cache: Arc<TwoTierCache>,
    instrument: InstrumentRef,
    today: chrono::NaiveDate,
    ttl: Duration,
) -> crate::error::Result<DailyOhlc> {
    let key = ohlc_cache_key(instrument, today);
    if let Some(cached) = cache.get_json::<DailyOhlc>(&key).await {
        return Ok(cached);
    }

    let ohlc = source.previous_day_ohlc(instrument, today).await?;
    cache.set_json(&key, &ohlc, Some(ttl)).await;
    Ok(ohlc)
}
