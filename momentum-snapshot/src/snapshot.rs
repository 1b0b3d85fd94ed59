//! Daily snapshot engine.
//!
//! Once per trading date the engine recomputes every sector and its stock
//! partitions and persists the result as an immutable snapshot. After the
//! cutoff a COMPLETED snapshot for today becomes the answer every reader
//! gets instead of live data.
//!
//! Lifecycle: PENDING -> PROCESSING -> COMPLETED | FAILED. A FAILED run may
//! be retried; COMPLETED is final.

use anyhow::Result;
use chrono::{Duration as ChronoDuration, NaiveDate};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use momentum_common::{CacheConfig, SnapshotConfig};

use crate::cache::TwoTierCache;
use crate::clock::{Direction, MarketClock};
use crate::models::{
    OiPartition, SectorQuote, SectorSnapshotRow, Snapshot, SnapshotCounts, SnapshotData,
    SnapshotStatus, StockSnapshotRow,
};
use crate::sector::SectorEngine;
use crate::stock::StockEngine;
use crate::storage::Database;

/// Cache key for the most recent completed snapshot
pub const LATEST_SNAPSHOT_KEY: &str = "snapshot:latest";

fn snapshot_data_key(date: NaiveDate) -> String {
    format!("snapshot:data:{}", date)
}

// ============================================================================
// Frozen vs Live
// ============================================================================

/// Result of a gated read: persisted snapshot rows after the freeze, live
/// engine output before it.
#[derive(Debug, Clone, PartialEq)]
pub enum MarketView<F, L = F> {
    Frozen(F),
    Live(L),
}

impl<F, L> MarketView<F, L> {
    pub fn is_frozen(&self) -> bool {
        matches!(self, Self::Frozen(_))
    }
}

// ============================================================================
// Snapshot Engine
// ============================================================================

pub struct SnapshotEngine {
    db: Database,
    cache: Arc<TwoTierCache>,
    sectors: Arc<SectorEngine>,
    stocks: Arc<StockEngine>,
    clock: MarketClock,
    retention_days: u32,
    snapshot_ttl: Duration,
    /// Serialises overlapping create calls within the process
    creation: Mutex<()>,
}

impl SnapshotEngine {
    pub fn new(
        db: Database,
        cache: Arc<TwoTierCache>,
        sectors: Arc<SectorEngine>,
        stocks: Arc<StockEngine>,
        clock: MarketClock,
        snapshot_config: &SnapshotConfig,
        cache_config: &CacheConfig,
    ) -> Self {
        Self {
            db,
            cache,
            sectors,
            stocks,
            clock,
            retention_days: snapshot_config.retention_days,
            snapshot_ttl: cache_config.snapshot_ttl(),
            creation: Mutex::new(()),
        }
    }

    /// Freeze today's qualification results.
    ///
    /// Returns the existing snapshot unchanged when today's is already
    /// COMPLETED. Any failure while computing marks the row FAILED and is
    /// returned to the caller.
    pub async fn create_snapshot(&self) -> Result<Snapshot> {
        let _guard = self.creation.lock().await;
        let today = self.clock.today();

        if let Some(existing) = self.db.get_snapshot_by_date(today).await? {
            if existing.status.is_terminal() {
                info!(date = %today, snapshot_id = existing.id, "Snapshot already completed");
                return Ok(existing);
            }
        }

        let started = self.db.begin_snapshot(today, self.clock.now()).await?;
        if started.status.is_terminal() {
            return Ok(started);
        }

        info!(date = %today, snapshot_id = started.id, "Creating snapshot");

        match self.build_snapshot(started.id).await {
            Ok(counts) => {
                let snapshot = self
                    .db
                    .get_snapshot_by_date(today)
                    .await?
                    .ok_or_else(|| anyhow::anyhow!("Snapshot for {} vanished after completion", today))?;

                self.cache.del(LATEST_SNAPSHOT_KEY).await;
                if let Err(e) = self.cache_snapshot_data(&snapshot).await {
                    warn!(error = %e, "Failed to cache snapshot data");
                }

                info!(
                    date = %today,
                    snapshot_id = snapshot.id,
                    sectors = counts.total_sectors,
                    bullish = counts.bullish_sectors,
                    bearish = counts.bearish_sectors,
                    stocks = counts.total_stocks,
                    "Snapshot completed"
                );
                Ok(snapshot)
            }
            Err(e) => {
                let message = format!("{:#}", e);
                error!(date = %today, snapshot_id = started.id, error = %message, "Snapshot failed");
                if let Err(mark_err) = self.db.fail_snapshot(started.id, &message, self.clock.now()).await {
                    error!(error = %mark_err, "Failed to mark snapshot FAILED");
                }
                Err(e)
            }
        }
    }

    /// Recompute everything, write the rows and flip to COMPLETED.
    async fn build_snapshot(&self, snapshot_id: i64) -> Result<SnapshotCounts> {
        let sectors = self.sectors.get_all_sectors(true).await?;

        let mut sector_rows = Vec::with_capacity(sectors.len());
        let mut stock_rows = Vec::new();
        let mut counts = SnapshotCounts {
            total_sectors: sectors.len() as u32,
            ..SnapshotCounts::default()
        };

        for sector in &sectors {
            sector_rows.push(SectorSnapshotRow::from_quote(snapshot_id, sector));
            if sector.is_qualifying {
                match sector.direction {
                    Direction::Up => counts.bullish_sectors += 1,
                    Direction::Down => counts.bearish_sectors += 1,
                    Direction::Neutral => {}
                }
            }

            let partition = self
                .stocks
                .get_price_qualified_stocks_with_oi(sector.sector_id, true)
                .await?;
            counts.total_stocks += partition.qualifying.len() as u32;

            for stock in partition.qualifying.iter().chain(partition.watchlist.iter()) {
                stock_rows.push(StockSnapshotRow::from_stock(snapshot_id, sector.sector_id, stock));
            }
        }

        self.db
            .write_snapshot_rows(snapshot_id, &sector_rows, &stock_rows)
            .await?;
        self.db
            .complete_snapshot(snapshot_id, counts, self.clock.now())
            .await?;
        Ok(counts)
    }

    async fn cache_snapshot_data(&self, snapshot: &Snapshot) -> Result<SnapshotData> {
        let data = SnapshotData {
            snapshot: snapshot.clone(),
            sectors: self.db.sector_snapshot_rows(snapshot.id).await?,
            stocks: self.db.stock_snapshot_rows(snapshot.id, None).await?,
        };
        self.cache
            .set_json(&snapshot_data_key(snapshot.trading_date), &data, Some(self.snapshot_ttl))
            .await;
        Ok(data)
    }

    /// True once the cutoff has passed and today's snapshot is COMPLETED.
    pub async fn is_snapshot_frozen(&self) -> Result<bool> {
        if !self.clock.is_past_cutoff() {
            return Ok(false);
        }
        let today = self.clock.today();
        Ok(self
            .db
            .get_snapshot_by_date(today)
            .await?
            .map(|s| s.status == SnapshotStatus::Completed)
            .unwrap_or(false))
    }

    /// Most recent COMPLETED snapshot.
    pub async fn get_latest_snapshot(&self) -> Result<Option<Snapshot>> {
        if let Some(cached) = self.cache.get_json::<Snapshot>(LATEST_SNAPSHOT_KEY).await {
            return Ok(Some(cached));
        }

        let latest = self.db.latest_completed_snapshot().await?;
        if let Some(snapshot) = &latest {
            self.cache
                .set_json(LATEST_SNAPSHOT_KEY, snapshot, Some(self.snapshot_ttl))
                .await;
        }
        Ok(latest)
    }

    /// A COMPLETED snapshot with its rows. Defaults to today.
    pub async fn get_snapshot_data(&self, date: Option<NaiveDate>) -> Result<Option<SnapshotData>> {
        let date = date.unwrap_or_else(|| self.clock.today());
        if let Some(cached) = self.cache.get_json::<SnapshotData>(&snapshot_data_key(date)).await {
            debug!(date = %date, "Snapshot data served from cache");
            return Ok(Some(cached));
        }

        match self.db.get_snapshot_by_date(date).await? {
            Some(snapshot) if snapshot.status == SnapshotStatus::Completed => {
                Ok(Some(self.cache_snapshot_data(&snapshot).await?))
            }
            _ => Ok(None),
        }
    }

    /// Fully qualifying stock rows of a snapshot.
    pub async fn get_snapshot_stocks(&self, date: Option<NaiveDate>) -> Result<Vec<StockSnapshotRow>> {
        Ok(self
            .get_snapshot_data(date)
            .await?
            .map(|data| data.qualifying_stocks().cloned().collect())
            .unwrap_or_default())
    }

    /// Watchlist stock rows of a snapshot.
    pub async fn get_snapshot_watchlist_stocks(&self, date: Option<NaiveDate>) -> Result<Vec<StockSnapshotRow>> {
        Ok(self
            .get_snapshot_data(date)
            .await?
            .map(|data| data.watchlist_stocks().cloned().collect())
            .unwrap_or_default())
    }

    /// Drop snapshots older than the retention window.
    pub async fn cleanup_old_snapshots(&self) -> Result<usize> {
        let cutoff = self.clock.today() - ChronoDuration::days(i64::from(self.retention_days));
        let purged = self.db.delete_snapshots_before(cutoff).await?;
        for date in &purged {
            self.cache.del(&snapshot_data_key(*date)).await;
        }
        if !purged.is_empty() {
            self.cache.del(LATEST_SNAPSHOT_KEY).await;
        }
        let deleted = purged.len();
        info!(deleted, before = %cutoff, retention_days = self.retention_days, "Snapshot cleanup finished");
        Ok(deleted)
    }

    // ========================================================================
    // Gated Reads
    // ========================================================================

    /// Sectors from today's snapshot once frozen, live otherwise.
    pub async fn current_sectors(&self) -> Result<MarketView<Vec<SectorQuote>>> {
        if self.is_snapshot_frozen().await? {
            if let Some(data) = self.get_snapshot_data(None).await? {
                return Ok(MarketView::Frozen(
                    data.sectors.iter().map(SectorSnapshotRow::to_quote).collect(),
                ));
            }
        }
        Ok(MarketView::Live(self.sectors.get_all_sectors(false).await?))
    }

    /// A sector's stocks from today's snapshot once frozen, live otherwise.
    pub async fn current_stocks(
        &self,
        sector_id: i64,
    ) -> Result<MarketView<Vec<StockSnapshotRow>, OiPartition>> {
        if self.is_snapshot_frozen().await? {
            if let Some(data) = self.get_snapshot_data(None).await? {
                return Ok(MarketView::Frozen(
                    data.stocks_in_sector(sector_id).cloned().collect(),
                ));
            }
        }
        Ok(MarketView::Live(
            self.stocks
                .get_price_qualified_stocks_with_oi(sector_id, false)
                .await?,
        ))
    }
}
