//! Upstream API credentials.
//!
//! The access token is rotated out-of-band by an external OAuth flow which
//! writes it to the `credentials` table. The provider re-reads the store on a
//! short TTL so a rotated token is picked up without a restart.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::storage::Database;

/// Environment fallback for the access token
pub const ACCESS_TOKEN_ENV: &str = "MOMENTUM_ACCESS_TOKEN";
/// Environment fallback for the client id
pub const CLIENT_ID_ENV: &str = "MOMENTUM_CLIENT_ID";

/// Access credentials for the upstream API.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct Credentials {
    pub access_token: String,
    pub expiry_time: Option<DateTime<Utc>>,
    pub client_id: String,
    pub client_name: Option<String>,
}

impl Credentials {
    pub fn new(access_token: impl Into<String>, client_id: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            expiry_time: None,
            client_id: client_id.into(),
            client_name: None,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expiry_time.map(|expiry| expiry <= now).unwrap_or(false)
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("access_token", &"***")
            .field("expiry_time", &self.expiry_time)
            .field("client_id", &self.client_id)
            .field("client_name", &self.client_name)
            .finish()
    }
}

/// Source of credentials for outbound calls.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// Credentials to use for the next call.
    async fn current(&self) -> Result<Credentials>;

    /// Drop anything cached and resolve again.
    async fn refresh(&self) -> Result<Credentials>;
}

// ============================================================================
// Stored Provider
// ============================================================================

/// Resolves credentials from the database, falling back to the environment.
pub struct StoredCredentialProvider {
    db: Database,
    clock: Arc<dyn Clock>,
    ttl: Duration,
    cached: Mutex<Option<(Credentials, Instant)>>,
}

impl StoredCredentialProvider {
    pub fn new(db: Database, clock: Arc<dyn Clock>, ttl: Duration) -> Self {
        Self {
            db,
            clock,
            ttl,
            cached: Mutex::new(None),
        }
    }

    async fn resolve(&self) -> Result<Credentials> {
        let now = self.clock.now();

        match self.db.load_credentials().await {
            Ok(Some(stored)) if !stored.is_expired(now) => {
                debug!(client_id = %stored.client_id, "Using stored credentials");
                return Ok(stored);
            }
            Ok(Some(stored)) => {
                warn!(
                    client_id = %stored.client_id,
                    expiry = ?stored.expiry_time,
                    "Stored credentials expired, trying environment"
                );
            }
            Ok(None) => {}
            Err(e) => {
                warn!(error = %e, "Failed to read credential store, trying environment");
            }
        }

        match (std::env::var(ACCESS_TOKEN_ENV), std::env::var(CLIENT_ID_ENV)) {
            (Ok(token), Ok(client_id)) if !token.is_empty() && !client_id.is_empty() => {
                debug!(client_id = %client_id, "Using environment credentials");
                Ok(Credentials::new(token, client_id))
            }
            _ => Err(Error::Configuration(format!(
                "No valid credentials in store and {} / {} not set",
                ACCESS_TOKEN_ENV, CLIENT_ID_ENV
            ))),
        }
    }
}

#[async_trait]
impl CredentialProvider for StoredCredentialProvider {
    async fn current(&self) -> Result<Credentials> {
        let mut cached = self.cached.lock().await;

        if let Some((credentials, resolved_at)) = cached.as_ref() {
            if resolved_at.elapsed() < self.ttl && !credentials.is_expired(self.clock.now()) {
                return Ok(credentials.clone());
            }
        }

        let credentials = self.resolve().await?;
        *cached = Some((credentials.clone(), Instant::now()));
        Ok(credentials)
    }

    async fn refresh(&self) -> Result<Credentials> {
        self.cached.lock().await.take();
        self.current().await
    }
}

// ============================================================================
// Static Provider
// ============================================================================

/// Fixed credentials, for tests and one-off tools.
pub struct StaticCredentialProvider {
    credentials: Credentials,
    refreshes: AtomicU32,
}

impl StaticCredentialProvider {
    pub fn new(credentials: Credentials) -> Self {
        Self {
            credentials,
            refreshes: AtomicU32::new(0),
        }
    }

    /// How many times `refresh` was called.
    pub fn refresh_count(&self) -> u32 {
        self.refreshes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CredentialProvider for StaticCredentialProvider {
    async fn current(&self) -> Result<Credentials> {
        Ok(self.credentials.clone())
    }

    async fn refresh(&self) -> Result<Credentials> {
        self.refreshes.fetch_add(1, Ordering::SeqCst);
        Ok(self.credentials.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use chrono::Duration as ChronoDuration;

    fn clock() -> Arc<FixedClock> {
        Arc::new(FixedClock::new(Utc::now()))
    }

    #[test]
    fn test_expiry() {
        let now = Utc::now();
        let mut creds = Credentials::new("t", "c");
        assert!(!creds.is_expired(now));

        creds.expiry_time = Some(now - ChronoDuration::minutes(1));
        assert!(creds.is_expired(now));

        creds.expiry_time = Some(now + ChronoDuration::hours(1));
        assert!(!creds.is_expired(now));
    }

    #[test]
    fn test_debug_hides_token() {
        let creds = Credentials::new("secret-token", "client");
        let printed = format!("{:?}", creds);
        assert!(!printed.contains("secret-token"));
    }

    #[tokio::test]
    async fn test_stored_credentials_preferred() {
        let db = Database::in_memory().unwrap();
        db.save_credentials(&Credentials::new("db-token", "db-client"))
            .await
            .unwrap();

        let provider = StoredCredentialProvider::new(db, clock(), Duration::from_secs(60));
        let creds = provider.current().await.unwrap();
        assert_eq!(creds.access_token, "db-token");
    }

    #[tokio::test]
    async fn test_rotated_token_seen_after_refresh() {
        let db = Database::in_memory().unwrap();
        db.save_credentials(&Credentials::new("old", "c")).await.unwrap();

        let provider =
            StoredCredentialProvider::new(db.clone(), clock(), Duration::from_secs(3600));
        assert_eq!(provider.current().await.unwrap().access_token, "old");

        db.save_credentials(&Credentials::new("new", "c")).await.unwrap();
        // still cached
        assert_eq!(provider.current().await.unwrap().access_token, "old");
        assert_eq!(provider.refresh().await.unwrap().access_token, "new");
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_expiry_rereads_store() {
        let db = Database::in_memory().unwrap();
        db.save_credentials(&Credentials::new("old", "c")).await.unwrap();

        let provider = StoredCredentialProvider::new(db.clone(), clock(), Duration::from_secs(60));
        assert_eq!(provider.current().await.unwrap().access_token, "old");

        db.save_credentials(&Credentials::new("new", "c")).await.unwrap();
        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(provider.current().await.unwrap().access_token, "new");
    }

    #[tokio::test]
    async fn test_static_provider_counts_refreshes() {
        let provider = StaticCredentialProvider::new(Credentials::new("t", "c"));
        provider.refresh().await.unwrap();
        provider.refresh().await.unwrap();
        assert_eq!(provider.refresh_count(), 2);
    }
}
