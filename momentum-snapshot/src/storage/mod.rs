//! SQLite storage for reference data, snapshots, the trading calendar and
//! persisted credentials.
//!
//! Reference data (sectors, stocks, membership, previous-day OI) is owned by
//! external seeding and pre-market jobs; the helpers here exist for them and
//! for tests. Snapshot tables are owned by the snapshot engine.

mod snapshots;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::clock::is_weekend;
use crate::data::Credentials;
use crate::models::{Sector, Stock};

// ============================================================================
// Database Schema
// ============================================================================

const CREATE_TABLES_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS sectors (
    id INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    symbol TEXT NOT NULL UNIQUE,
    index_security_id INTEGER,
    is_active INTEGER NOT NULL DEFAULT 1
);

CREATE TABLE IF NOT EXISTS stocks (
    id INTEGER PRIMARY KEY,
    symbol TEXT NOT NULL UNIQUE,
    name TEXT NOT NULL,
    spot_security_id INTEGER,
    derivative_security_id INTEGER,
    is_fo_eligible INTEGER NOT NULL DEFAULT 0,
    previous_day_oi INTEGER,
    oi_updated_at TEXT
);

CREATE TABLE IF NOT EXISTS sector_stocks (
    sector_id INTEGER NOT NULL REFERENCES sectors(id),
    stock_id INTEGER NOT NULL REFERENCES stocks(id),
    PRIMARY KEY (sector_id, stock_id)
);

CREATE TABLE IF NOT EXISTS snapshots (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    trading_date TEXT NOT NULL UNIQUE,
    snapshot_time TEXT NOT NULL,
    status TEXT NOT NULL,
    total_sectors INTEGER NOT NULL DEFAULT 0,
    bullish_sectors INTEGER NOT NULL DEFAULT 0,
    bearish_sectors INTEGER NOT NULL DEFAULT 0,
    total_stocks INTEGER NOT NULL DEFAULT 0,
    error_message TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS sector_snapshots (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    snapshot_id INTEGER NOT NULL REFERENCES snapshots(id),
    sector_id INTEGER NOT NULL,
    name TEXT NOT NULL,
    symbol TEXT NOT NULL,
    current_value REAL NOT NULL,
    previous_close REAL NOT NULL,
    change REAL NOT NULL,
    percent_change REAL NOT NULL,
    direction TEXT NOT NULL,
    is_qualifying INTEGER NOT NULL,
    UNIQUE(snapshot_id, sector_id)
);

CREATE TABLE IF NOT EXISTS stock_snapshots (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    snapshot_id INTEGER NOT NULL REFERENCES snapshots(id),
    stock_id INTEGER NOT NULL,
    sector_id INTEGER NOT NULL,
    symbol TEXT NOT NULL,
    name TEXT NOT NULL,
    ltp REAL NOT NULL,
    previous_close REAL NOT NULL,
    change REAL NOT NULL,
    percent_change REAL NOT NULL,
    direction TEXT NOT NULL,
    volume INTEGER NOT NULL,
    current_oi INTEGER,
    previous_day_oi INTEGER,
    oi_change_percent REAL,
    oi_bypassed INTEGER NOT NULL DEFAULT 0,
    breakout_signal TEXT,
    is_qualifying INTEGER NOT NULL,
    UNIQUE(snapshot_id, stock_id, sector_id)
);

CREATE INDEX IF NOT EXISTS idx_stock_snapshots_snapshot
ON stock_snapshots(snapshot_id, is_qualifying);

CREATE TABLE IF NOT EXISTS trading_calendar (
    date TEXT PRIMARY KEY,
    is_holiday INTEGER NOT NULL DEFAULT 1,
    description TEXT
);

CREATE TABLE IF NOT EXISTS credentials (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    access_token TEXT NOT NULL,
    expiry_time TEXT,
    client_id TEXT NOT NULL,
    client_name TEXT,
    updated_at TEXT NOT NULL
);
"#;

/// Date format stored in TEXT columns
const DATE_FORMAT: &str = "%Y-%m-%d";

/// Shared handle to the SQLite database.
///
/// Cloning is cheap; clones share one connection.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open or create the database at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database at {}", path.display()))?;
        let db = Self::from_connection(conn)?;

        info!(path = %path.display(), "Database opened");
        Ok(db)
    }

    /// Create an in-memory database (for testing)
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self::from_connection(conn)?;

        debug!("In-memory database created");
        Ok(db)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(CREATE_TABLES_SQL)
            .context("Failed to initialize schema")?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    // ========================================================================
    // Reference Data
    // ========================================================================

    pub async fn upsert_sector(&self, sector: &Sector) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            r#"
            INSERT INTO sectors (id, name, symbol, index_security_id, is_active)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                symbol = excluded.symbol,
                index_security_id = excluded.index_security_id,
                is_active = excluded.is_active
            "#,
            params![
                sector.id,
                sector.name,
                sector.symbol,
                sector.index_security_id.map(to_db_id),
                sector.is_active,
            ],
        )?;
        Ok(())
    }

    /// Insert or update a stock. `previous_day_oi` is left untouched on update.
    pub async fn upsert_stock(&self, stock: &Stock) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            r#"
            INSERT INTO stocks (id, symbol, name, spot_security_id, derivative_security_id,
                                is_fo_eligible, previous_day_oi, oi_updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ON CONFLICT(id) DO UPDATE SET
                symbol = excluded.symbol,
                name = excluded.name,
                spot_security_id = excluded.spot_security_id,
                derivative_security_id = excluded.derivative_security_id,
                is_fo_eligible = excluded.is_fo_eligible
            "#,
            params![
                stock.id,
                stock.symbol,
                stock.name,
                stock.spot_security_id.map(to_db_id),
                stock.derivative_security_id.map(to_db_id),
                stock.is_fo_eligible,
                stock.previous_day_oi,
                stock.oi_updated_at.map(|t| t.to_rfc3339()),
            ],
        )?;
        Ok(())
    }

    pub async fn add_sector_stock(&self, sector_id: i64, stock_id: i64) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT OR IGNORE INTO sector_stocks (sector_id, stock_id) VALUES (?1, ?2)",
            params![sector_id, stock_id],
        )?;
        Ok(())
    }

    /// Record previous-session OI (pre-market job).
    pub async fn update_previous_oi(&self, stock_id: i64, oi: i64, at: DateTime<Utc>) -> Result<()> {
        let conn = self.conn.lock().await;
        let updated = conn.execute(
            "UPDATE stocks SET previous_day_oi = ?1, oi_updated_at = ?2 WHERE id = ?3",
            params![oi, at.to_rfc3339(), stock_id],
        )?;
        if updated == 0 {
            anyhow::bail!("Stock {} not found", stock_id);
        }
        Ok(())
    }

    pub async fn active_sectors(&self) -> Result<Vec<Sector>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, name, symbol, index_security_id, is_active FROM sectors WHERE is_active = 1 ORDER BY id",
        )?;
        let sectors = stmt
            .query_map([], row_to_sector)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(sectors)
    }

    pub async fn get_sector(&self, id: i64) -> Result<Option<Sector>> {
        let conn = self.conn.lock().await;
        let sector = conn
            .query_row(
                "SELECT id, name, symbol, index_security_id, is_active FROM sectors WHERE id = ?1",
                params![id],
                row_to_sector,
            )
            .optional()?;
        Ok(sector)
    }

    /// Constituents of a sector, ordered by symbol.
    pub async fn sector_stocks(&self, sector_id: i64) -> Result<Vec<Stock>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            r#"
            SELECT s.id, s.symbol, s.name, s.spot_security_id, s.derivative_security_id,
                   s.is_fo_eligible, s.previous_day_oi, s.oi_updated_at
            FROM stocks s
            JOIN sector_stocks ss ON ss.stock_id = s.id
            WHERE ss.sector_id = ?1
            ORDER BY s.symbol
            "#,
        )?;
        let stocks = stmt
            .query_map(params![sector_id], row_to_stock)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(stocks)
    }

    pub async fn stock_by_symbol(&self, symbol: &str) -> Result<Option<Stock>> {
        let conn = self.conn.lock().await;
        let stock = conn
            .query_row(
                r#"
                SELECT id, symbol, name, spot_security_id, derivative_security_id,
                       is_fo_eligible, previous_day_oi, oi_updated_at
                FROM stocks WHERE symbol = ?1 COLLATE NOCASE
                "#,
                params![symbol],
                row_to_stock,
            )
            .optional()?;
        Ok(stock)
    }

    // ========================================================================
    // Trading Calendar
    // ========================================================================

    pub async fn set_holiday(&self, date: NaiveDate, description: Option<&str>) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            r#"
            INSERT INTO trading_calendar (date, is_holiday, description) VALUES (?1, 1, ?2)
            ON CONFLICT(date) DO UPDATE SET is_holiday = 1, description = excluded.description
            "#,
            params![date.format(DATE_FORMAT).to_string(), description],
        )?;
        Ok(())
    }

    /// A weekday that is not marked as a holiday.
    pub async fn is_trading_day(&self, date: NaiveDate) -> Result<bool> {
        if is_weekend(date) {
            return Ok(false);
        }

        let conn = self.conn.lock().await;
        let holiday: Option<bool> = conn
            .query_row(
                "SELECT is_holiday FROM trading_calendar WHERE date = ?1",
                params![date.format(DATE_FORMAT).to_string()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(!holiday.unwrap_or(false))
    }

    // ========================================================================
    // Credentials
    // ========================================================================

    pub async fn save_credentials(&self, credentials: &Credentials) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            r#"
            INSERT INTO credentials (id, access_token, expiry_time, client_id, client_name, updated_at)
            VALUES (1, ?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(id) DO UPDATE SET
                access_token = excluded.access_token,
                expiry_time = excluded.expiry_time,
                client_id = excluded.client_id,
                client_name = excluded.client_name,
                updated_at = excluded.updated_at
            "#,
            params![
                credentials.access_token,
                credentials.expiry_time.map(|t| t.to_rfc3339()),
                credentials.client_id,
                credentials.client_name,
                Utc::now().to_rfc3339(),
            ],
        )?;
        debug!(client_id = %credentials.client_id, "Credentials saved");
        Ok(())
    }

    pub async fn load_credentials(&self) -> Result<Option<Credentials>> {
        let conn = self.conn.lock().await;
        let credentials = conn
            .query_row(
                "SELECT access_token, expiry_time, client_id, client_name FROM credentials WHERE id = 1",
                [],
                |row| {
                    let expiry: Option<String> = row.get(1)?;
                    Ok(Credentials {
                        access_token: row.get(0)?,
                        expiry_time: expiry.as_deref().and_then(parse_timestamp),
                        client_id: row.get(2)?,
                        client_name: row.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(credentials)
    }
}

// ============================================================================
// Row Mapping
// ============================================================================

fn to_db_id(id: u64) -> i64 {
    id as i64
}

fn from_db_id(id: Option<i64>) -> Option<u64> {
    id.and_then(|v| u64::try_from(v).ok())
}

fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
}

fn parse_date(s: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(s, DATE_FORMAT).ok()
}

fn row_to_sector(row: &rusqlite::Row) -> Result<Sector, rusqlite::Error> {
    Ok(Sector {
        id: row.get(0)?,
        name: row.get(1)?,
        symbol: row.get(2)?,
        index_security_id: from_db_id(row.get(3)?),
        is_active: row.get(4)?,
    })
}

fn row_to_stock(row: &rusqlite::Row) -> Result<Stock, rusqlite::Error> {
    let oi_updated_at: Option<String> = row.get(7)?;
    Ok(Stock {
        id: row.get(0)?,
        symbol: row.get(1)?,
        name: row.get(2)?,
        spot_security_id: from_db_id(row.get(3)?),
        derivative_security_id: from_db_id(row.get(4)?),
        is_fo_eligible: row.get(5)?,
        previous_day_oi: row.get(6)?,
        oi_updated_at: oi_updated_at.as_deref().and_then(parse_timestamp),
    })
}
