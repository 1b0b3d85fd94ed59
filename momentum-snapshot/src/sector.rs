//! Sector engine: live index moves for every active sector.

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use momentum_common::{CacheConfig, QualificationConfig};

use crate::cache::TwoTierCache;
use crate::data::{ExchangeSegment, MarketDataSource, QuoteRequest};
use crate::error::Error;
use crate::models::SectorQuote;
use crate::storage::Database;

/// Cache key for the full sector list
pub const SECTORS_CACHE_KEY: &str = "sectors:all";

/// Computes sector qualification from index quotes.
pub struct SectorEngine {
    db: Database,
    source: Arc<dyn MarketDataSource>,
    cache: Arc<TwoTierCache>,
    price_threshold: f64,
    ttl: Duration,
}

impl SectorEngine {
    pub fn new(
        db: Database,
        source: Arc<dyn MarketDataSource>,
        cache: Arc<TwoTierCache>,
        qualification: &QualificationConfig,
        cache_config: &CacheConfig,
    ) -> Self {
        Self {
            db,
            source,
            cache,
            price_threshold: qualification.price_threshold_pct,
            ttl: cache_config.sectors_ttl(),
        }
    }

    /// Every active sector with its live move.
    ///
    /// Sectors without an index id, or whose index is missing from the
    /// response, come back as neutral placeholders.
    pub async fn get_all_sectors(&self, force_refresh: bool) -> Result<Vec<SectorQuote>> {
        if !force_refresh {
            if let Some(cached) = self.cache.get_json::<Vec<SectorQuote>>(SECTORS_CACHE_KEY).await {
                debug!(count = cached.len(), "Sectors served from cache");
                return Ok(cached);
            }
        }

        let sectors = self
            .db
            .active_sectors()
            .await
            .context("Failed to load sectors")?;

        let mut request = QuoteRequest::new();
        for sector in &sectors {
            if let Some(id) = sector.index_security_id {
                request.add(ExchangeSegment::IdxI, id);
            }
        }

        let batch = self
            .source
            .fetch_quotes(&request)
            .await
            .context("Failed to fetch sector index quotes")?;

        let records: Vec<SectorQuote> = sectors
            .iter()
            .map(|sector| {
                match sector
                    .index_security_id
                    .and_then(|id| batch.get(ExchangeSegment::IdxI, id))
                {
                    Some(quote) => SectorQuote::from_quote(sector, quote, self.price_threshold),
                    None => SectorQuote::placeholder(sector),
                }
            })
            .collect();

        self.cache
            .set_json(SECTORS_CACHE_KEY, &records, Some(self.ttl))
            .await;

        info!(
            sectors = records.len(),
            qualifying = records.iter().filter(|s| s.is_qualifying).count(),
            "Sectors refreshed"
        );
        Ok(records)
    }

    pub async fn get_qualifying_sectors(&self, force_refresh: bool) -> Result<Vec<SectorQuote>> {
        let sectors = self.get_all_sectors(force_refresh).await?;
        Ok(sectors.into_iter().filter(|s| s.is_qualifying).collect())
    }

    /// One sector from the cached or fresh list.
    pub async fn get_sector_by_id(&self, sector_id: i64, force_refresh: bool) -> Result<SectorQuote> {
        self.get_all_sectors(force_refresh)
            .await?
            .into_iter()
            .find(|s| s.sector_id == sector_id)
            .ok_or_else(|| Error::NotFound(format!("Sector {}", sector_id)).into())
    }
}
