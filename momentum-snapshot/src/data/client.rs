//! HTTP client for the upstream quote and chart API.
//!
//! # Call Path
//! Every outbound call goes through, in order:
//! 1. In-flight deduplication keyed by request signature
//! 2. A bounded retry loop (5xx and transport errors only)
//! 3. The rate gate, awaited before every attempt
//!
//! # Rate Limits
//! - Quote class: ~1 request/second, paced at 1.1s by default
//! - Charts: paced separately, 250ms by default

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, NaiveDate};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use momentum_common::MarketDataConfig;

use super::credentials::CredentialProvider;
use super::normalize::{aggregate_candles, normalize_quotes, CandleResponse, QuoteResponse};
use super::provider::MarketDataSource;
use super::rate_limiter::{shared_gate, SharedRateGate};
use super::single_flight::{signature, SingleFlight};
use super::{DailyOhlc, InstrumentRef, QuoteBatch, QuoteRequest};
use crate::clock::is_weekend;
use crate::error::{Error, Result};

// ============================================================================
// Constants
// ============================================================================

/// Full market quote endpoint
pub const QUOTE_ENDPOINT: &str = "/v2/marketfeed/quote";

/// Intraday candles endpoint
pub const CHARTS_INTRADAY_ENDPOINT: &str = "/v2/charts/intraday";

/// Session bounds used for single-day intraday requests
const SESSION_OPEN: &str = "09:15:00";
const SESSION_CLOSE: &str = "15:30:00";

/// Which pacing class a call belongs to.
#[derive(Debug, Clone, Copy)]
enum CallClass {
    Quote,
    Historical,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct IntradayRequest {
    security_id: String,
    exchange_segment: &'static str,
    instrument: &'static str,
    interval: String,
    from_date: String,
    to_date: String,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default, alias = "errorMessage", alias = "error")]
    message: Option<String>,
}

// ============================================================================
// Client
// ============================================================================

struct ClientInner {
    http: reqwest::Client,
    base_url: String,
    credentials: Arc<dyn CredentialProvider>,
    quote_gate: SharedRateGate,
    historical_gate: SharedRateGate,
    max_attempts: u32,
    backoff_base: Duration,
}

/// Rate-limited, retrying, deduplicating market data client.
pub struct MarketDataClient {
    inner: Arc<ClientInner>,
    quote_flight: SingleFlight<QuoteBatch>,
    candle_flight: SingleFlight<Option<DailyOhlc>>,
    batch_size: usize,
    lookback_days: u32,
    intraday_interval: String,
}

impl MarketDataClient {
    /// Create a client from configuration.
    pub fn new(config: &MarketDataConfig, credentials: Arc<dyn CredentialProvider>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| Error::Configuration(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            inner: Arc::new(ClientInner {
                http,
                base_url: config.base_url.trim_end_matches('/').to_string(),
                credentials,
                quote_gate: shared_gate("quote", config.quote_interval()),
                historical_gate: shared_gate("historical", config.historical_interval()),
                max_attempts: config.max_attempts.max(1),
                backoff_base: config.backoff_base(),
            }),
            quote_flight: SingleFlight::new(),
            candle_flight: SingleFlight::new(),
            batch_size: config.batch_size.max(1),
            lookback_days: config.lookback_days,
            intraday_interval: config.intraday_interval.clone(),
        })
    }

    async fn fetch_quote_chunk(&self, chunk: QuoteRequest) -> Result<QuoteBatch> {
        let key = signature("POST", QUOTE_ENDPOINT, &chunk.canonical_params());
        let inner = Arc::clone(&self.inner);

        self.quote_flight
            .run(key, move || async move {
                let body = chunk.to_body();
                let response: QuoteResponse = inner
                    .post_with_retry(CallClass::Quote, QUOTE_ENDPOINT, &body)
                    .await?;
                normalize_quotes(response)
            })
            .await
    }

    /// Intraday candles for one session, aggregated. `None` when the session is empty.
    async fn session_ohlc(&self, instrument: InstrumentRef, day: NaiveDate) -> Result<Option<DailyOhlc>> {
        let day_str = day.format("%Y-%m-%d").to_string();
        let request = IntradayRequest {
            security_id: instrument.security_id.to_string(),
            exchange_segment: instrument.segment.as_str(),
            instrument: instrument.segment.instrument(),
            interval: self.intraday_interval.clone(),
            from_date: format!("{} {}", day_str, SESSION_OPEN),
            to_date: format!("{} {}", day_str, SESSION_CLOSE),
        };

        let params = format!(
            "securityId={}&exchangeSegment={}&interval={}&date={}",
            request.security_id, request.exchange_segment, request.interval, day_str
        );
        let key = signature("POST", CHARTS_INTRADAY_ENDPOINT, &params);
        let inner = Arc::clone(&self.inner);

        self.candle_flight
            .run(key, move || async move {
                let candles: CandleResponse = inner
                    .post_with_retry(CallClass::Historical, CHARTS_INTRADAY_ENDPOINT, &request)
                    .await?;
                Ok(aggregate_candles(day, &candles))
            })
            .await
    }
}

impl ClientInner {
    fn gate(&self, class: CallClass) -> &SharedRateGate {
        match class {
            CallClass::Quote => &self.quote_gate,
            CallClass::Historical => &self.historical_gate,
        }
    }

    /// Calculate backoff delay for a given retry (0-based).
    fn backoff_delay(&self, retry: u32) -> Duration {
        let delay_ms = (self.backoff_base.as_millis() as u64)
            .saturating_mul(2_u64.saturating_pow(retry));
        Duration::from_millis(delay_ms)
    }

    async fn post_with_retry<B, R>(&self, class: CallClass, path: &str, body: &B) -> Result<R>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let mut attempt = 0;

        loop {
            attempt += 1;
            self.gate(class).wait().await;

            match self.post_once(path, body).await {
                Ok(response) => return Ok(response),
                Err(err) if err.is_retryable() && attempt < self.max_attempts => {
                    let delay = self.backoff_delay(attempt - 1);
                    warn!(
                        path,
                        attempt,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Upstream call failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    if attempt > 1 {
                        warn!(path, attempt, error = %err, "Upstream call failed, giving up");
                    }
                    return Err(err);
                }
            }
        }
    }

    async fn post_once<B, R>(&self, path: &str, body: &B) -> Result<R>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let credentials = self.credentials.current().await?;
        let url = format!("{}{}", self.base_url, path);

        debug!(url = %url, "Upstream request");

        let response = self
            .http
            .post(&url)
            .header("access-token", &credentials.access_token)
            .header("client-id", &credentials.client_id)
            .header("Accept", "application/json")
            .json(body)
            .send()
            .await?;

        let status = response.status();

        if status == reqwest::StatusCode::UNAUTHORIZED {
            // Pick up a rotated token on the next call
            if let Err(e) = self.credentials.refresh().await {
                warn!(error = %e, "Credential refresh after 401 failed");
            }
            let message = error_message(response).await;
            return Err(Error::Upstream {
                status: status.as_u16(),
                message,
            });
        }

        if !status.is_success() {
            let message = error_message(response).await;
            return Err(Error::Upstream {
                status: status.as_u16(),
                message,
            });
        }

        // a body cut off mid-read is a transport failure; only bad JSON is Decode
        let bytes = response.bytes().await?;
        Ok(serde_json::from_slice::<R>(&bytes)?)
    }
}

async fn error_message(response: reqwest::Response) -> String {
    let status = response.status();
    let text = response.text().await.unwrap_or_default();

    serde_json::from_str::<ErrorBody>(&text)
        .ok()
        .and_then(|body| body.message)
        .unwrap_or_else(|| {
            if text.is_empty() {
                status.to_string()
            } else {
                text
            }
        })
}

#[async_trait]
impl MarketDataSource for MarketDataClient {
    async fn fetch_quotes(&self, request: &QuoteRequest) -> Result<QuoteBatch> {
        if request.is_empty() {
            return Ok(QuoteBatch::new());
        }

        let chunks = request.chunks(self.batch_size);
        let chunk_count = chunks.len();
        let mut batch = QuoteBatch::new();

        for chunk in chunks {
            batch.merge(self.fetch_quote_chunk(chunk).await?);
        }

        debug!(
            requested = request.len(),
            returned = batch.len(),
            chunks = chunk_count,
            "Fetched quotes"
        );

        Ok(batch)
    }

    async fn previous_day_ohlc(&self, instrument: InstrumentRef, today: NaiveDate) -> Result<DailyOhlc> {
        for offset in 1..=i64::from(self.lookback_days) {
            let day = today - ChronoDuration::days(offset);
            if is_weekend(day) {
                continue;
            }

            if let Some(ohlc) = self.session_ohlc(instrument, day).await? {
                debug!(instrument = %instrument, date = %day, "Found previous session");
                return Ok(ohlc);
            }
        }

        info!(
            instrument = %instrument,
            lookback_days = self.lookback_days,
            "No previous session found"
        );
        Err(Error::NotFound(format!(
            "No session for {} in the {} days before {}",
            instrument, self.lookback_days, today
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{Credentials, StaticCredentialProvider};

    fn client(config: MarketDataConfig) -> MarketDataClient {
        let credentials = Arc::new(StaticCredentialProvider::new(Credentials::new("t", "c")));
        MarketDataClient::new(&config, credentials).unwrap()
    }

    #[test]
    fn test_backoff_doubles() {
        let client = client(MarketDataConfig::default());
        assert_eq!(client.inner.backoff_delay(0), Duration::from_secs(1));
        assert_eq!(client.inner.backoff_delay(1), Duration::from_secs(2));
        assert_eq!(client.inner.backoff_delay(2), Duration::from_secs(4));
    }

    #[test]
    fn test_base_url_trimmed() {
        let client = client(MarketDataConfig {
            base_url: "http://localhost:9000/".into(),
            ..Default::default()
        });
        assert_eq!(client.inner.base_url, "http://localhost:9000");
    }

    #[test]
    fn test_intraday_request_shape() {
        let request = IntradayRequest {
            security_id: "2885".into(),
            exchange_segment: "NSE_EQ",
            instrument: "EQUITY",
            interval: "1".into(),
            from_date: "2024-03-08 09:15:00".into(),
            to_date: "2024-03-08 15:30:00".into(),
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["securityId"], "2885");
        assert_eq!(value["exchangeSegment"], "NSE_EQ");
        assert_eq!(value["fromDate"], "2024-03-08 09:15:00");
    }

    #[tokio::test]
    async fn test_empty_request_makes_no_call() {
        // unroutable base url: any call would fail
        let client = client(MarketDataConfig {
            base_url: "http://127.0.0.1:1".into(),
            ..Default::default()
        });
        let batch = client.fetch_quotes(&QuoteRequest::new()).await.unwrap();
        assert!(batch.is_empty());
    }

    #[tokio::test]
    #[ignore = "Requires live API credentials"]
    async fn test_live_index_quote() {
        let token = std::env::var("MOMENTUM_ACCESS_TOKEN").unwrap();
        let client_id = std::env::var("MOMENTUM_CLIENT_ID").unwrap();
        let credentials = Arc::new(StaticCredentialProvider::new(Credentials::new(token, client_id)));
        let client = MarketDataClient::new(&MarketDataConfig::default(), credentials).unwrap();

        let request = QuoteRequest::new().with(crate::data::ExchangeSegment::IdxI, 13);
        let batch = client.fetch_quotes(&request).await.unwrap();
        println!("{:?}", batch);
    }
}
