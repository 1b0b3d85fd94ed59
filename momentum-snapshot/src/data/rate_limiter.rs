//! Minimum-interval pacing gate for upstream calls.
//!
//! Unlike a token bucket there is no burst allowance: every call waits until
//! at least `interval` has passed since the previous one. Pacing is per
//! process.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

/// Gate that spaces consecutive calls by a fixed interval.
#[derive(Debug)]
pub struct RateGate {
    /// Minimum spacing between calls
    interval: Duration,
    /// When the previous call was let through
    last_call: Mutex<Option<Instant>>,
    /// Name for logging
    name: String,
}

impl RateGate {
    pub fn new(name: impl Into<String>, interval: Duration) -> Self {
        Self {
            interval,
            last_call: Mutex::new(None),
            name: name.into(),
        }
    }

    /// Wait for this caller's turn, then stamp the call time.
    ///
    /// The lock is held while sleeping so waiters are released one at a time,
    /// each `interval` apart.
    pub async fn wait(&self) {
        let mut last_call = self.last_call.lock().await;

        if let Some(previous) = *last_call {
            let elapsed = previous.elapsed();
            if elapsed < self.interval {
                let wait_time = self.interval - elapsed;
                debug!(
                    gate = %self.name,
                    wait_ms = wait_time.as_millis() as u64,
                    "Rate gated, waiting"
                );
                tokio::time::sleep(wait_time).await;
            }
        }

        *last_call = Some(Instant::now());
    }
}

/// A shareable rate gate.
pub type SharedRateGate = Arc<RateGate>;

/// Create a new shared rate gate.
pub fn shared_gate(name: impl Into<String>, interval: Duration) -> SharedRateGate {
    Arc::new(RateGate::new(name, interval))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_first_call_passes_immediately() {
        let gate = RateGate::new("test", Duration::from_millis(1100));
        let start = Instant::now();
        gate.wait().await;
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_consecutive_calls_are_spaced() {
        let gate = RateGate::new("test", Duration::from_millis(1100));
        let mut stamps = Vec::new();

        for _ in 0..4 {
            gate.wait().await;
            stamps.push(Instant::now());
        }

        for pair in stamps.windows(2) {
            assert!(pair[1] - pair[0] >= Duration::from_millis(1100));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_time_counts_toward_interval() {
        let gate = RateGate::new("test", Duration::from_millis(1000));
        gate.wait().await;
        tokio::time::sleep(Duration::from_millis(600)).await;

        let start = Instant::now();
        gate.wait().await;
        assert_eq!(start.elapsed(), Duration::from_millis(400));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_waiters_are_serialized() {
        let gate = shared_gate("test", Duration::from_millis(500));
        let start = Instant::now();

        let handles: Vec<_> = (0..3)
            .map(|_| {
                let gate = gate.clone();
                tokio::spawn(async move {
                    gate.wait().await;
                    Instant::now()
                })
            })
            .collect();

        let mut stamps = Vec::new();
        for handle in handles {
            stamps.push(handle.await.unwrap());
        }
        stamps.sort();

        assert_eq!(stamps[0] - start, Duration::ZERO);
        assert!(stamps[1] - stamps[0] >= Duration::from_millis(500));
        assert!(stamps[2] - stamps[1] >= Duration::from_millis(500));
    }
}
