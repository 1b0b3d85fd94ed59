//! Remote key-value stores backing the cache's L2 tier.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use redis::aio::ConnectionManagerConfig;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

/// Keys scanned per SCAN round trip
const SCAN_COUNT: usize = 200;

/// Minimal remote KV surface used by the cache.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    fn name(&self) -> &str;

    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;

    async fn del(&self, key: &str) -> Result<()>;

    /// Delete every key starting with `prefix`. Returns how many were removed.
    async fn del_prefix(&self, prefix: &str) -> Result<u64>;
}

// ============================================================================
// Redis
// ============================================================================

/// Redis-backed store.
///
/// The connection manager reconnects on its own; it is cheap to clone per
/// command.
pub struct RedisStore {
    conn: redis::aio::ConnectionManager,
}

impl RedisStore {
    /// Connect to Redis. `timeout` bounds both connecting and each response.
    pub async fn connect(url: &str, timeout: Duration) -> Result<Self> {
        let client = redis::Client::open(url).context("Invalid Redis URL")?;
        let manager_config = ConnectionManagerConfig::new()
            .set_connection_timeout(timeout)
            .set_response_timeout(timeout);
        let conn = tokio::time::timeout(
            timeout * 4,
            client.get_connection_manager_with_config(manager_config),
        )
        .await
        .context("Timed out connecting to Redis")?
        .context("Failed to connect to Redis")?;

        tracing::info!("Connected to Redis cache tier");
        Ok(Self { conn })
    }

    /// PING the server.
    pub async fn ping(&self) -> bool {
        let mut conn = self.conn.clone();
        matches!(
            redis::cmd("PING").query_async::<String>(&mut conn).await,
            Ok(ref pong) if pong == "PONG"
        )
    }
}

#[async_trait]
impl RemoteStore for RedisStore {
    fn name(&self) -> &str {
        "redis"
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        let value = redis::cmd("GET")
            .arg(key)
            .query_async::<Option<String>>(&mut conn)
            .await?;
        Ok(value)
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.conn.clone();
        redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(ttl.as_millis().max(1) as u64)
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        redis::cmd("DEL")
            .arg(key)
            .query_async::<i64>(&mut conn)
            .await?;
        Ok(())
    }

    async fn del_prefix(&self, prefix: &str) -> Result<u64> {
        let mut conn = self.conn.clone();
        let pattern = format!("{}*", prefix);
        let mut cursor: u64 = 0;
        let mut removed = 0u64;

        loop {
            let (next, keys) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_COUNT)
                .query_async::<(u64, Vec<String>)>(&mut conn)
                .await?;

            if !keys.is_empty() {
                let n = redis::cmd("DEL")
                    .arg(&keys)
                    .query_async::<i64>(&mut conn)
                    .await?;
                removed += n.max(0) as u64;
            }

            if next == 0 {
                break;
            }
            cursor = next;
        }

        Ok(removed)
    }
}

// ============================================================================
// In-memory
// ============================================================================

/// Call counters for an [`InMemoryStore`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreCalls {
    pub gets: u64,
    pub sets: u64,
    pub dels: u64,
}

/// Process-local store that counts calls and can be told to fail.
#[derive(Default)]
pub struct InMemoryStore {
    entries: Mutex<HashMap<String, (String, Instant)>>,
    gets: AtomicU64,
    sets: AtomicU64,
    dels: AtomicU64,
    failing: AtomicBool,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> StoreCalls {
        StoreCalls {
            gets: self.gets.load(Ordering::SeqCst),
            sets: self.sets.load(Ordering::SeqCst),
            dels: self.dels.load(Ordering::SeqCst),
        }
    }

    /// Make every subsequent call return an error.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries
            .lock()
            .map(|entries| {
                entries
                    .get(key)
                    .map(|(_, expires_at)| *expires_at > Instant::now())
                    .unwrap_or(false)
            })
            .unwrap_or(false)
    }

    fn check(&self) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            bail!("in-memory store unavailable");
        }
        Ok(())
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, HashMap<String, (String, Instant)>> {
        match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[async_trait]
impl RemoteStore for InMemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        self.check()?;

        let mut entries = self.entries();
        match entries.get(key) {
            Some((value, expires_at)) if *expires_at > Instant::now() => Ok(Some(value.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        self.sets.fetch_add(1, Ordering::SeqCst);
        self.check()?;
        self.entries()
            .insert(key.to_string(), (value.to_string(), Instant::now() + ttl));
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<()> {
        self.dels.fetch_add(1, Ordering::SeqCst);
        self.check()?;
        self.entries().remove(key);
        Ok(())
    }

    async fn del_prefix(&self, prefix: &str) -> Result<u64> {
        self.dels.fetch_add(1, Ordering::SeqCst);
        self.check()?;
        let mut entries = self.entries();
        let before = entries.len();
        entries.retain(|key, _| !key.starts_with(prefix));
        Ok((before - entries.len()) as u64)
    }
}

// ============================================================================
// Null
// ============================================================================

/// Store used when no L2 is configured: remembers nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullStore;

#[async_trait]
impl RemoteStore for NullStore {
    fn name(&self) -> &str {
        "null"
    }

    async fn get(&self, _key: &str) -> Result<Option<String>> {
        Ok(None)
    }

    async fn set_ex(&self, _key: &str, _value: &str, _ttl: Duration) -> Result<()> {
        Ok(())
    }

    async fn del(&self, _key: &str) -> Result<()> {
        Ok(())
    }

    async fn del_prefix(&self, _prefix: &str) -> Result<u64> {
        Ok(0)
    }
}
