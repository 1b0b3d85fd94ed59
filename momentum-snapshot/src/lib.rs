//! Momentum Snapshot Library
//!
//! Sector and stock momentum qualification over live NSE quotes, frozen once
//! per trading day into an auditable snapshot.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        SnapshotEngine                           │
//! │        (PENDING -> PROCESSING -> COMPLETED | FAILED)            │
//! ├────────────────────────────┬────────────────────────────────────┤
//! │       SectorEngine         │           StockEngine              │
//! │   index quotes per sector  │  Stage A price, Stage B OI,        │
//! │                            │  breakout enrichment               │
//! ├────────────────────────────┴────────────────────────────────────┤
//! │  MarketDataClient (rate gate, retry, single-flight, batching)   │
//! │  TwoTierCache (LRU + Redis)          Database (SQLite)          │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Qualification
//!
//! - **Stage A**: |spot % change| >= price threshold and F&O eligible
//! - **Stage B**: |OI % change vs previous day| >= OI threshold
//! - Stage-A stocks failing Stage B form the watchlist
//!
//! # Freeze
//!
//! After the cutoff (09:25 IST by default) a COMPLETED snapshot for today is
//! served in place of live data.

#![warn(clippy::all)]
#![allow(clippy::pedantic)]

pub mod cache;
pub mod clock;
pub mod data;
pub mod error;
pub mod models;
pub mod sector;
pub mod snapshot;
pub mod stock;
pub mod storage;

use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::{info, warn};

use momentum_common::Config;

use crate::cache::{NullStore, RedisStore, RemoteStore, TwoTierCache};
use crate::clock::MarketClock;
use crate::data::{MarketDataClient, MarketDataSource, StoredCredentialProvider};
use crate::sector::SectorEngine;
use crate::snapshot::SnapshotEngine;
use crate::stock::StockEngine;
use crate::storage::Database;

pub use crate::error::Error;

/// Every engine, constructed once at start-up.
#[derive(Clone)]
pub struct MomentumServices {
    pub config: Arc<Config>,
    pub db: Database,
    pub clock: MarketClock,
    pub cache: Arc<TwoTierCache>,
    pub sectors: Arc<SectorEngine>,
    pub stocks: Arc<StockEngine>,
    pub snapshots: Arc<SnapshotEngine>,
}

impl MomentumServices {
    /// Wire the production stack: SQLite, the upstream client and Redis
    /// when configured.
    pub async fn from_config(config: Config) -> Result<Self> {
        config.validate()?;

        let db = Database::open(&config.storage.db_path)
            .with_context(|| format!("Failed to open database {}", config.storage.db_path.display()))?;
        let clock = MarketClock::system(config.snapshot.cutoff()?);

        let credentials = Arc::new(StoredCredentialProvider::new(
            db.clone(),
            clock.clock(),
            config.credentials.cache_ttl(),
        ));
        let client = MarketDataClient::new(&config.market_data, credentials)?;

        let remote: Arc<dyn RemoteStore> = match &config.cache.redis_url {
            Some(url) => match RedisStore::connect(url, config.cache.l2_timeout()).await {
                Ok(store) => Arc::new(store),
                Err(e) => {
                    warn!(error = %e, "Redis unavailable, running with in-process cache only");
                    Arc::new(NullStore)
                }
            },
            None => {
                info!("No Redis configured, running with in-process cache only");
                Arc::new(NullStore)
            }
        };

        Ok(Self::with_parts(config, db, clock, Arc::new(client), remote))
    }

    /// Wire the engines over explicit parts.
    pub fn with_parts(
        config: Config,
        db: Database,
        clock: MarketClock,
        source: Arc<dyn MarketDataSource>,
        remote: Arc<dyn RemoteStore>,
    ) -> Self {
        let cache = Arc::new(TwoTierCache::new(&config.cache, remote));

        let sectors = Arc::new(SectorEngine::new(
            db.clone(),
            Arc::clone(&source),
            Arc::clone(&cache),
            &config.qualification,
            &config.cache,
        ));
        let stocks = Arc::new(StockEngine::new(
            db.clone(),
            source,
            Arc::clone(&cache),
            clock.clone(),
            &config.qualification,
            &config.cache,
        ));
        let snapshots = Arc::new(SnapshotEngine::new(
            db.clone(),
            Arc::clone(&cache),
            Arc::clone(&sectors),
            Arc::clone(&stocks),
            clock.clone(),
            &config.snapshot,
            &config.cache,
        ));

        Self {
            config: Arc::new(config),
            db,
            clock,
            cache,
            sectors,
            stocks,
            snapshots,
        }
    }
}
