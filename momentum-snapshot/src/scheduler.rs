//! Daily trigger for snapshot creation and cleanup.
//!
//! Cron expressions are evaluated in IST. Tasks only run on trading days
//! according to the calendar table.
//!
//! ```json
//! {
//!   "snapshot": {
//!     "create_cron": "0 25 9 * * 1-5",
//!     "cleanup_cron": "0 0 18 * * *"
//!   }
//! }
//! ```

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use cron::Schedule;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::{watch, RwLock};
use tokio::time::{interval, Duration};
use tracing::{debug, error, info};

use momentum_common::SnapshotConfig;
use momentum_snapshot::clock::{ist, MarketClock};
use momentum_snapshot::snapshot::SnapshotEngine;
use momentum_snapshot::storage::Database;

/// Scheduled task type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScheduledTask {
    CreateSnapshot,
    CleanupSnapshots,
}

impl ScheduledTask {
    pub fn name(&self) -> &'static str {
        match self {
            Self::CreateSnapshot => "create_snapshot",
            Self::CleanupSnapshots => "cleanup_snapshots",
        }
    }
}

struct ParsedSchedule {
    task: ScheduledTask,
    schedule: Schedule,
}

pub struct SnapshotScheduler {
    snapshots: Arc<SnapshotEngine>,
    db: Database,
    clock: MarketClock,
    schedules: Vec<ParsedSchedule>,
    last_executions: RwLock<HashMap<ScheduledTask, DateTime<Utc>>>,
    max_retries: u32,
}

impl SnapshotScheduler {
    pub fn new(
        config: &SnapshotConfig,
        snapshots: Arc<SnapshotEngine>,
        db: Database,
        clock: MarketClock,
    ) -> Result<Self> {
        let schedules = vec![
            ParsedSchedule {
                task: ScheduledTask::CreateSnapshot,
                schedule: Schedule::from_str(&config.create_cron)
                    .with_context(|| format!("Invalid create_cron: {}", config.create_cron))?,
            },
            ParsedSchedule {
                task: ScheduledTask::CleanupSnapshots,
                schedule: Schedule::from_str(&config.cleanup_cron)
                    .with_context(|| format!("Invalid cleanup_cron: {}", config.cleanup_cron))?,
            },
        ];

        info!(
            create = %config.create_cron,
            cleanup = %config.cleanup_cron,
            "Scheduler configured"
        );

        Ok(Self {
            snapshots,
            db,
            clock,
            schedules,
            last_executions: RwLock::new(HashMap::new()),
            max_retries: 3,
        })
    }

    /// Run until `shutdown` flips to true.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!("Scheduler started");

        // Check every 10 seconds
        let mut check_interval = interval(Duration::from_secs(10));

        loop {
            tokio::select! {
                _ = check_interval.tick() => {
                    if let Err(e) = self.check_and_execute().await {
                        error!(error = %e, "Scheduler check failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Scheduler stopped");
        Ok(())
    }

    async fn check_and_execute(&self) -> Result<()> {
        let now = self.clock.now();
        let today = self.clock.today();

        let mut due = Vec::new();
        for parsed in &self.schedules {
            if self.should_execute(parsed.task, &parsed.schedule, now).await {
                due.push(parsed.task);
            }
        }
        if due.is_empty() {
            return Ok(());
        }

        if !self.db.is_trading_day(today).await? {
            debug!(date = %today, "Not a trading day, skipping scheduled tasks");
            let mut executions = self.last_executions.write().await;
            for task in due {
                executions.insert(task, now);
            }
            return Ok(());
        }

        for task in due {
            self.execute_task(task, now).await;
        }
        Ok(())
    }

    /// True when a fire time fell within the last minute and has not run yet.
    async fn should_execute(&self, task: ScheduledTask, schedule: &Schedule, now: DateTime<Utc>) -> bool {
        let last_exec = self.last_executions.read().await.get(&task).copied();
        let after = last_exec.unwrap_or_else(|| now - chrono::Duration::hours(1));

        is_due(schedule, last_exec, after, now)
    }

    async fn execute_task(&self, task: ScheduledTask, now: DateTime<Utc>) {
        info!(task = task.name(), "Executing scheduled task");
        self.last_executions.write().await.insert(task, now);

        for attempt in 1..=self.max_retries {
            let result = match task {
                ScheduledTask::CreateSnapshot => self
                    .snapshots
                    .create_snapshot()
                    .await
                    .map(|s| info!(snapshot_id = s.id, status = %s.status, "Scheduled snapshot done")),
                ScheduledTask::CleanupSnapshots => self
                    .snapshots
                    .cleanup_old_snapshots()
                    .await
                    .map(|deleted| info!(deleted, "Scheduled cleanup done")),
            };

            match result {
                Ok(()) => return,
                Err(e) if attempt < self.max_retries => {
                    let backoff_ms = 1000 * (1u64 << (attempt - 1));
                    debug!(task = task.name(), attempt, backoff_ms, error = %e, "Task failed, retrying...");
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                }
                Err(e) => {
                    error!(
                        task = task.name(),
                        error = %e,
                        max_retries = self.max_retries,
                        "Task execution failed after all retries"
                    );
                }
            }
        }
    }
}

fn is_due(
    schedule: &Schedule,
    last_exec: Option<DateTime<Utc>>,
    after: DateTime<Utc>,
    now: DateTime<Utc>,
) -> bool {
    let after_ist = after.with_timezone(&ist());

    for scheduled in schedule.after(&after_ist).take(10) {
        let scheduled = scheduled.with_timezone(&Utc);
        if scheduled > now {
            break;
        }
        if now.signed_duration_since(scheduled) < chrono::Duration::seconds(60) {
            if matches!(last_exec, Some(last) if last >= scheduled) {
                continue;
            }
            return true;
        }
    }

    false
}
