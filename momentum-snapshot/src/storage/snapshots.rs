//! Snapshot tables.
//!
//! Every status change is checked against [`SnapshotStatus::can_transition_to`]
//! while the connection lock is held. The UPDATEs repeat the guard in SQL for
//! writers in other processes sharing the file.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, OptionalExtension};
use tracing::{debug, info};

use super::{parse_date, parse_timestamp, Database, DATE_FORMAT};
use crate::clock::Direction;
use crate::models::{
    BreakoutSignal, SectorSnapshotRow, Snapshot, SnapshotCounts, SnapshotStatus, StockSnapshotRow,
};

const SNAPSHOT_COLUMNS: &str = "id, trading_date, snapshot_time, status, total_sectors, \
     bullish_sectors, bearish_sectors, total_stocks, error_message, created_at, updated_at";

impl Database {
    pub async fn get_snapshot_by_date(&self, date: NaiveDate) -> Result<Option<Snapshot>> {
        let conn = self.conn.lock().await;
        let snapshot = conn
            .query_row(
                &format!("SELECT {} FROM snapshots WHERE trading_date = ?1", SNAPSHOT_COLUMNS),
                params![date.format(DATE_FORMAT).to_string()],
                row_to_snapshot,
            )
            .optional()?;
        Ok(snapshot)
    }

    /// Most recent COMPLETED snapshot.
    pub async fn latest_completed_snapshot(&self) -> Result<Option<Snapshot>> {
        let conn = self.conn.lock().await;
        let snapshot = conn
            .query_row(
                &format!(
                    "SELECT {} FROM snapshots WHERE status = 'COMPLETED' ORDER BY trading_date DESC LIMIT 1",
                    SNAPSHOT_COLUMNS
                ),
                [],
                row_to_snapshot,
            )
            .optional()?;
        Ok(snapshot)
    }

    /// Upsert the day's row into PROCESSING and return it.
    ///
    /// A row that cannot move to PROCESSING (COMPLETED) is returned untouched.
    pub async fn begin_snapshot(&self, date: NaiveDate, now: DateTime<Utc>) -> Result<Snapshot> {
        let conn = self.conn.lock().await;
        let date_str = date.format(DATE_FORMAT).to_string();
        let now_str = now.to_rfc3339();
        let select = format!("SELECT {} FROM snapshots WHERE trading_date = ?1", SNAPSHOT_COLUMNS);

        let existing = conn
            .query_row(&select, params![date_str], row_to_snapshot)
            .optional()?;
        if let Some(existing) = existing {
            if !existing.status.can_transition_to(SnapshotStatus::Processing) {
                debug!(snapshot_id = existing.id, status = %existing.status, "Snapshot not restartable");
                return Ok(existing);
            }
        }

        conn.execute(
            r#"
            INSERT INTO snapshots (trading_date, snapshot_time, status, created_at, updated_at)
            VALUES (?1, ?2, 'PROCESSING', ?2, ?2)
            ON CONFLICT(trading_date) DO UPDATE SET
                status = 'PROCESSING',
                snapshot_time = excluded.snapshot_time,
                error_message = NULL,
                updated_at = excluded.updated_at
            WHERE snapshots.status != 'COMPLETED'
            "#,
            params![date_str, now_str],
        )?;

        let snapshot = conn
            .query_row(&select, params![date_str], row_to_snapshot)
            .context("Snapshot row missing after upsert")?;

        debug!(snapshot_id = snapshot.id, date = %date, status = %snapshot.status, "Snapshot started");
        Ok(snapshot)
    }

    /// Replace a snapshot's child rows in one transaction.
    pub async fn write_snapshot_rows(
        &self,
        snapshot_id: i64,
        sectors: &[SectorSnapshotRow],
        stocks: &[StockSnapshotRow],
    ) -> Result<()> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;

        match snapshot_status(&tx, snapshot_id)? {
            SnapshotStatus::Processing => {}
            other => bail!("Snapshot {} is {}, not PROCESSING", snapshot_id, other),
        }

        // rows left by an earlier failed attempt
        tx.execute("DELETE FROM stock_snapshots WHERE snapshot_id = ?1", params![snapshot_id])?;
        tx.execute("DELETE FROM sector_snapshots WHERE snapshot_id = ?1", params![snapshot_id])?;

        {
            let mut stmt = tx.prepare(
                r#"
                INSERT INTO sector_snapshots (snapshot_id, sector_id, name, symbol, current_value,
                    previous_close, change, percent_change, direction, is_qualifying)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                ON CONFLICT(snapshot_id, sector_id) DO UPDATE SET
                    name = excluded.name,
                    symbol = excluded.symbol,
                    current_value = excluded.current_value,
                    previous_close = excluded.previous_close,
                    change = excluded.change,
                    percent_change = excluded.percent_change,
                    direction = excluded.direction,
                    is_qualifying = excluded.is_qualifying
                "#,
            )?;
            for row in sectors {
                stmt.execute(params![
                    snapshot_id,
                    row.sector_id,
                    row.name,
                    row.symbol,
                    row.current_value,
                    row.previous_close,
                    row.change,
                    row.percent_change,
                    row.direction.to_db_string(),
                    row.is_qualifying,
                ])?;
            }
        }

        {
            let mut stmt = tx.prepare(
                r#"
                INSERT INTO stock_snapshots (snapshot_id, stock_id, sector_id, symbol, name, ltp,
                    previous_close, change, percent_change, direction, volume, current_oi,
                    previous_day_oi, oi_change_percent, oi_bypassed, breakout_signal, is_qualifying)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)
                ON CONFLICT(snapshot_id, stock_id, sector_id) DO UPDATE SET
                    symbol = excluded.symbol,
                    name = excluded.name,
                    ltp = excluded.ltp,
                    previous_close = excluded.previous_close,
                    change = excluded.change,
                    percent_change = excluded.percent_change,
                    direction = excluded.direction,
                    volume = excluded.volume,
                    current_oi = excluded.current_oi,
                    previous_day_oi = excluded.previous_day_oi,
                    oi_change_percent = excluded.oi_change_percent,
                    oi_bypassed = excluded.oi_bypassed,
                    breakout_signal = excluded.breakout_signal,
                    is_qualifying = excluded.is_qualifying
                "#,
            )?;
            for row in stocks {
                stmt.execute(params![
                    snapshot_id,
                    row.stock_id,
                    row.sector_id,
                    row.symbol,
                    row.name,
                    row.ltp,
                    row.previous_close,
                    row.change,
                    row.percent_change,
                    row.direction.to_db_string(),
                    row.volume,
                    row.current_oi,
                    row.previous_day_oi,
                    row.oi_change_percent,
                    row.oi_bypassed,
                    row.breakout_signal.map(|s| s.to_db_string()),
                    row.is_qualifying,
                ])?;
            }
        }

        tx.commit()?;
        debug!(
            snapshot_id,
            sectors = sectors.len(),
            stocks = stocks.len(),
            "Snapshot rows written"
        );
        Ok(())
    }

    /// PROCESSING -> COMPLETED with the final counts.
    pub async fn complete_snapshot(
        &self,
        snapshot_id: i64,
        counts: SnapshotCounts,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let conn = self.conn.lock().await;
        ensure_transition(&conn, snapshot_id, SnapshotStatus::Completed)?;
        let updated = conn.execute(
            r#"
            UPDATE snapshots SET
                status = 'COMPLETED',
                total_sectors = ?1,
                bullish_sectors = ?2,
                bearish_sectors = ?3,
                total_stocks = ?4,
                error_message = NULL,
                updated_at = ?5
            WHERE id = ?6 AND status = 'PROCESSING'
            "#,
            params![
                counts.total_sectors,
                counts.bullish_sectors,
                counts.bearish_sectors,
                counts.total_stocks,
                now.to_rfc3339(),
                snapshot_id,
            ],
        )?;

        if updated == 0 {
            bail!("Snapshot {} left PROCESSING before it could complete", snapshot_id);
        }
        Ok(())
    }

    /// Mark a run FAILED. Errors, leaving the row alone, when it is COMPLETED.
    pub async fn fail_snapshot(&self, snapshot_id: i64, message: &str, now: DateTime<Utc>) -> Result<()> {
        let conn = self.conn.lock().await;
        ensure_transition(&conn, snapshot_id, SnapshotStatus::Failed)?;
        conn.execute(
            r#"
            UPDATE snapshots SET status = 'FAILED', error_message = ?1, updated_at = ?2
            WHERE id = ?3 AND status != 'COMPLETED'
            "#,
            params![message, now.to_rfc3339(), snapshot_id],
        )?;
        Ok(())
    }

    pub async fn sector_snapshot_rows(&self, snapshot_id: i64) -> Result<Vec<SectorSnapshotRow>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            r#"
            SELECT snapshot_id, sector_id, name, symbol, current_value, previous_close, change,
                   percent_change, direction, is_qualifying
            FROM sector_snapshots WHERE snapshot_id = ?1 ORDER BY sector_id
            "#,
        )?;
        let rows = stmt
            .query_map(params![snapshot_id], |row| {
                let direction: String = row.get(8)?;
                Ok(SectorSnapshotRow {
                    snapshot_id: row.get(0)?,
                    sector_id: row.get(1)?,
                    name: row.get(2)?,
                    symbol: row.get(3)?,
                    current_value: row.get(4)?,
                    previous_close: row.get(5)?,
                    change: row.get(6)?,
                    percent_change: row.get(7)?,
                    direction: Direction::from_db_string(&direction),
                    is_qualifying: row.get(9)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Stock rows, optionally filtered by the qualifying flag.
    pub async fn stock_snapshot_rows(
        &self,
        snapshot_id: i64,
        qualifying: Option<bool>,
    ) -> Result<Vec<StockSnapshotRow>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            r#"
            SELECT snapshot_id, stock_id, sector_id, symbol, name, ltp, previous_close, change,
                   percent_change, direction, volume, current_oi, previous_day_oi,
                   oi_change_percent, oi_bypassed, breakout_signal, is_qualifying
            FROM stock_snapshots
            WHERE snapshot_id = ?1 AND (?2 IS NULL OR is_qualifying = ?2)
            ORDER BY sector_id, symbol
            "#,
        )?;
        let rows = stmt
            .query_map(params![snapshot_id, qualifying], |row| {
                let direction: String = row.get(9)?;
                let breakout: Option<String> = row.get(15)?;
                Ok(StockSnapshotRow {
                    snapshot_id: row.get(0)?,
                    stock_id: row.get(1)?,
                    sector_id: row.get(2)?,
                    symbol: row.get(3)?,
                    name: row.get(4)?,
                    ltp: row.get(5)?,
                    previous_close: row.get(6)?,
                    change: row.get(7)?,
                    percent_change: row.get(8)?,
                    direction: Direction::from_db_string(&direction),
                    volume: row.get(10)?,
                    current_oi: row.get(11)?,
                    previous_day_oi: row.get(12)?,
                    oi_change_percent: row.get(13)?,
                    oi_bypassed: row.get(14)?,
                    breakout_signal: breakout.as_deref().and_then(BreakoutSignal::from_db_string),
                    is_qualifying: row.get(16)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Delete snapshots (and their rows) for trading dates before `date`.
    /// Returns the trading dates removed.
    pub async fn delete_snapshots_before(&self, date: NaiveDate) -> Result<Vec<NaiveDate>> {
        let mut conn = self.conn.lock().await;
        let date_str = date.format(DATE_FORMAT).to_string();
        let tx = conn.transaction()?;

        let doomed: Vec<String> = {
            let mut stmt = tx.prepare("SELECT trading_date FROM snapshots WHERE trading_date < ?1")?;
            let rows = stmt.query_map(params![date_str], |row| row.get(0))?;
            rows.collect::<Result<_, _>>()?
        };

        tx.execute(
            "DELETE FROM stock_snapshots WHERE snapshot_id IN (SELECT id FROM snapshots WHERE trading_date < ?1)",
            params![date_str],
        )?;
        tx.execute(
            "DELETE FROM sector_snapshots WHERE snapshot_id IN (SELECT id FROM snapshots WHERE trading_date < ?1)",
            params![date_str],
        )?;
        tx.execute(
            "DELETE FROM snapshots WHERE trading_date < ?1",
            params![date_str],
        )?;
        tx.commit()?;

        let deleted: Vec<NaiveDate> = doomed.iter().filter_map(|d| parse_date(d)).collect();
        info!(deleted = deleted.len(), before = %date, "Cleaned up old snapshots");
        Ok(deleted)
    }
}

fn snapshot_status(conn: &rusqlite::Connection, snapshot_id: i64) -> Result<SnapshotStatus> {
    let status: Option<String> = conn
        .query_row(
            "SELECT status FROM snapshots WHERE id = ?1",
            params![snapshot_id],
            |row| row.get(0),
        )
        .optional()?;
    let Some(status) = status else {
        bail!("Snapshot {} not found", snapshot_id);
    };
    SnapshotStatus::from_db_string(&status)
        .with_context(|| format!("Snapshot {} has unknown status {}", snapshot_id, status))
}

fn ensure_transition(conn: &rusqlite::Connection, snapshot_id: i64, next: SnapshotStatus) -> Result<()> {
    let current = snapshot_status(conn, snapshot_id)?;
    if !current.can_transition_to(next) {
        bail!("Snapshot {} cannot move from {} to {}", snapshot_id, current, next);
    }
    Ok(())
}

fn row_to_snapshot(row: &rusqlite::Row) -> Result<Snapshot, rusqlite::Error> {
    let date_str: String = row.get(1)?;
    let snapshot_time: String = row.get(2)?;
    let status: String = row.get(3)?;
    let created_at: String = row.get(9)?;
    let updated_at: String = row.get(10)?;

    let trading_date = parse_date(&date_str).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            1,
            rusqlite::types::Type::Text,
            format!("invalid trading_date: {}", date_str).into(),
        )
    })?;

    Ok(Snapshot {
        id: row.get(0)?,
        trading_date,
        snapshot_time: parse_timestamp(&snapshot_time).unwrap_or_else(Utc::now),
        status: SnapshotStatus::from_db_string(&status).unwrap_or(SnapshotStatus::Failed),
        total_sectors: row.get(4)?,
        bullish_sectors: row.get(5)?,
        bearish_sectors: row.get(6)?,
        total_stocks: row.get(7)?,
        error_message: row.get(8)?,
        created_at: parse_timestamp(&created_at).unwrap_or_else(Utc::now),
        updated_at: parse_timestamp(&updated_at).unwrap_or_else(Utc::now),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn date(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, d).unwrap()
    }

    fn sector_row(snapshot_id: i64, sector_id: i64) -> SectorSnapshotRow {
        SectorSnapshotRow {
            snapshot_id,
            sector_id,
            name: "Bank".into(),
            symbol: "BANKNIFTY".into(),
            current_value: 1012.0,
            previous_close: 1000.0,
            change: 12.0,
            percent_change: 1.2,
            direction: Direction::Up,
            is_qualifying: true,
        }
    }

    fn stock_row(snapshot_id: i64, stock_id: i64, qualifying: bool) -> StockSnapshotRow {
        StockSnapshotRow {
            snapshot_id,
            stock_id,
            sector_id: 1,
            symbol: format!("S{}", stock_id),
            name: format!("Stock {}", stock_id),
            ltp: 102.0,
            previous_close: 100.0,
            change: 2.0,
            percent_change: 2.0,
            direction: Direction::Up,
            volume: 1000,
            current_oi: Some(110_000),
            previous_day_oi: Some(100_000),
            oi_change_percent: Some(10.0),
            oi_bypassed: false,
            breakout_signal: Some(BreakoutSignal::Breakout),
            is_qualifying: qualifying,
        }
    }

    #[tokio::test]
    async fn test_begin_is_unique_per_date() {
        let db = Database::in_memory().unwrap();
        let now = Utc::now();

        let first = db.begin_snapshot(date(11), now).await.unwrap();
        let second = db.begin_snapshot(date(11), now).await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(second.status, SnapshotStatus::Processing);
    }

    #[tokio::test]
    async fn test_completed_is_never_revisited() {
        let db = Database::in_memory().unwrap();
        let now = Utc::now();

        let snap = db.begin_snapshot(date(11), now).await.unwrap();
        db.complete_snapshot(snap.id, SnapshotCounts::default(), now)
            .await
            .unwrap();

        let again = db.begin_snapshot(date(11), now).await.unwrap();
        assert_eq!(again.status, SnapshotStatus::Completed);

        let late = db.fail_snapshot(snap.id, "late failure", now).await.unwrap_err();
        assert!(late.to_string().contains("COMPLETED to FAILED"));
        let loaded = db.get_snapshot_by_date(date(11)).await.unwrap().unwrap();
        assert_eq!(loaded.status, SnapshotStatus::Completed);
        assert!(loaded.error_message.is_none());

        assert!(db.write_snapshot_rows(snap.id, &[], &[]).await.is_err());
        assert!(db
            .complete_snapshot(snap.id, SnapshotCounts::default(), now)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_failed_run_can_restart() {
        let db = Database::in_memory().unwrap();
        let now = Utc::now();

        let snap = db.begin_snapshot(date(11), now).await.unwrap();
        db.fail_snapshot(snap.id, "upstream down", now).await.unwrap();
        let failed = db.get_snapshot_by_date(date(11)).await.unwrap().unwrap();
        assert_eq!(failed.status, SnapshotStatus::Failed);
        assert_eq!(failed.error_message.as_deref(), Some("upstream down"));

        let restarted = db.begin_snapshot(date(11), now).await.unwrap();
        assert_eq!(restarted.id, snap.id);
        assert_eq!(restarted.status, SnapshotStatus::Processing);
        assert!(restarted.error_message.is_none());
    }

    #[tokio::test]
    async fn test_failed_run_cannot_complete_without_restart() {
        let db = Database::in_memory().unwrap();
        let now = Utc::now();

        let snap = db.begin_snapshot(date(11), now).await.unwrap();
        db.fail_snapshot(snap.id, "upstream down", now).await.unwrap();

        let err = db
            .complete_snapshot(snap.id, SnapshotCounts::default(), now)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("FAILED to COMPLETED"));
        assert!(db.fail_snapshot(snap.id, "again", now).await.is_err());
        assert!(db.complete_snapshot(999, SnapshotCounts::default(), now).await.is_err());

        db.begin_snapshot(date(11), now).await.unwrap();
        db.complete_snapshot(snap.id, SnapshotCounts::default(), now)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_rows_replace_previous_attempt() {
        let db = Database::in_memory().unwrap();
        let snap = db.begin_snapshot(date(11), Utc::now()).await.unwrap();

        db.write_snapshot_rows(
            snap.id,
            &[sector_row(snap.id, 1)],
            &[stock_row(snap.id, 1, true), stock_row(snap.id, 2, false)],
        )
        .await
        .unwrap();
        db.write_snapshot_rows(snap.id, &[sector_row(snap.id, 1)], &[stock_row(snap.id, 1, true)])
            .await
            .unwrap();

        assert_eq!(db.sector_snapshot_rows(snap.id).await.unwrap().len(), 1);
        let all = db.stock_snapshot_rows(snap.id, None).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0], stock_row(snap.id, 1, true));
        assert!(db.stock_snapshot_rows(snap.id, Some(false)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stock_rows_filter() {
        let db = Database::in_memory().unwrap();
        let snap = db.begin_snapshot(date(11), Utc::now()).await.unwrap();
        db.write_snapshot_rows(
            snap.id,
            &[],
            &[stock_row(snap.id, 1, true), stock_row(snap.id, 2, false), stock_row(snap.id, 3, false)],
        )
        .await
        .unwrap();

        assert_eq!(db.stock_snapshot_rows(snap.id, Some(true)).await.unwrap().len(), 1);
        assert_eq!(db.stock_snapshot_rows(snap.id, Some(false)).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_latest_completed_and_cleanup() {
        let db = Database::in_memory().unwrap();
        let now = Utc::now();

        for d in [1, 4, 11] {
            let snap = db.begin_snapshot(date(d), now).await.unwrap();
            db.write_snapshot_rows(snap.id, &[sector_row(snap.id, 1)], &[stock_row(snap.id, 1, true)])
                .await
                .unwrap();
            db.complete_snapshot(snap.id, SnapshotCounts::default(), now + Duration::seconds(1))
                .await
                .unwrap();
        }
        // in-progress row for a later date is not "latest"
        db.begin_snapshot(date(12), now).await.unwrap();

        let latest = db.latest_completed_snapshot().await.unwrap().unwrap();
        assert_eq!(latest.trading_date, date(11));

        let deleted = db.delete_snapshots_before(date(4)).await.unwrap();
        assert_eq!(deleted, vec![date(1)]);
        assert!(db.get_snapshot_by_date(date(1)).await.unwrap().is_none());
        assert!(db.get_snapshot_by_date(date(4)).await.unwrap().is_some());
    }
}
