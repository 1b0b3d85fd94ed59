//! In-flight request deduplication.
//!
//! Concurrent callers presenting the same key share one underlying call.
//! The first caller (the leader) owns a guard that removes the entry when it
//! finishes, fails or is dropped, so a settled call never lingers.

use futures::future::{BoxFuture, FutureExt, Shared};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use tracing::debug;

use crate::error::Result;

type SharedCall<T> = Shared<BoxFuture<'static, Result<T>>>;

/// Registry of in-flight calls keyed by request signature.
pub struct SingleFlight<T: Clone> {
    inflight: Arc<Mutex<HashMap<String, SharedCall<T>>>>,
}

impl<T: Clone> Default for SingleFlight<T> {
    fn default() -> Self {
        Self {
            inflight: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl<T> SingleFlight<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `call` unless an identical call is already in flight, in which
    /// case wait for that one and return a clone of its result.
    pub async fn run<F, Fut>(&self, key: String, call: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let (shared, guard) = {
            let mut inflight = match self.inflight.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };

            if let Some(existing) = inflight.get(&key) {
                debug!(key = %short(&key), "Joining in-flight request");
                (existing.clone(), None)
            } else {
                let shared = call().boxed().shared();
                inflight.insert(key.clone(), shared.clone());
                let guard = InflightGuard {
                    inflight: Arc::clone(&self.inflight),
                    key,
                };
                (shared, Some(guard))
            }
        };

        let result = shared.await;
        drop(guard);
        result
    }

    /// Number of calls currently in flight.
    pub fn in_flight(&self) -> usize {
        self.inflight.lock().map(|m| m.len()).unwrap_or(0)
    }
}

struct InflightGuard<T: Clone> {
    inflight: Arc<Mutex<HashMap<String, SharedCall<T>>>>,
    key: String,
}

impl<T: Clone> Drop for InflightGuard<T> {
    fn drop(&mut self) {
        let mut inflight = match self.inflight.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        inflight.remove(&self.key);
    }
}

/// SHA-256 hex signature of a request.
///
/// `params` must already be in canonical (sorted) form.
pub fn signature(method: &str, path: &str, params: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(method.to_ascii_uppercase().as_bytes());
    hasher.update(b"\n");
    hasher.update(path.as_bytes());
    hasher.update(b"\n");
    hasher.update(params.as_bytes());
    hex::encode(hasher.finalize())
}

fn short(key: &str) -> &str {
    &key[..key.len().min(12)]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    #[test]
    fn test_signature_is_stable() {
        let a = signature("POST", "/v2/marketfeed/quote", "NSE_EQ=1,2");
        let b = signature("post", "/v2/marketfeed/quote", "NSE_EQ=1,2");
        let c = signature("POST", "/v2/marketfeed/quote", "NSE_EQ=1,3");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_calls_share_one_execution() {
        let flight: Arc<SingleFlight<u32>> = Arc::new(SingleFlight::new());
        let calls = Arc::new(AtomicU32::new(0));

        let spawn_call = || {
            let flight = flight.clone();
            let calls = calls.clone();
            tokio::spawn(async move {
                flight
                    .run("k".into(), move || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        Ok(7)
                    })
                    .await
            })
        };

        let a = spawn_call();
        let b = spawn_call();
        assert_eq!(a.await.unwrap().unwrap(), 7);
        assert_eq!(b.await.unwrap().unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(flight.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_failure_is_shared_and_cleared() {
        let flight: SingleFlight<u32> = SingleFlight::new();

        let err = flight
            .run("k".into(), || async { Err(Error::Network("reset".into())) })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Network(_)));
        assert_eq!(flight.in_flight(), 0);

        // a later call runs fresh
        let ok = flight.run("k".into(), || async { Ok(1) }).await.unwrap();
        assert_eq!(ok, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_leader_clears_entry() {
        let flight: Arc<SingleFlight<u32>> = Arc::new(SingleFlight::new());

        let leader = {
            let flight = flight.clone();
            tokio::spawn(async move {
                flight
                    .run("k".into(), || async {
                        tokio::time::sleep(Duration::from_secs(60)).await;
                        Ok(1)
                    })
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(flight.in_flight(), 1);

        leader.abort();
        let _ = leader.await;
        assert_eq!(flight.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_distinct_keys_run_independently() {
        let flight: SingleFlight<&'static str> = SingleFlight::new();
        let (a, b) = tokio::join!(
            flight.run("a".into(), || async { Ok("a") }),
            flight.run("b".into(), || async { Ok("b") }),
        );
        assert_eq!(a.unwrap(), "a");
        assert_eq!(b.unwrap(), "b");
    }
}
