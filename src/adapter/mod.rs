//! Platform adapter client (spec.md §4.2, §4.12): the boundary between the
//! Runner/Inventory Loader and whatever upstream data vendor is connected.
//!
//! `PlatformAdapterClient` is the one trait in this crate — the Runner needs
//! to swap between a live HTTP-backed implementation and a deterministic
//! fake in tests, so a trait object earns its keep here the way a concrete
//! struct wouldn't. Grounded on `scrapers/dome.rs`'s `execute_with_retry`:
//! exponential backoff, capped retries, a request timeout per attempt.
//! Per spec.md §4.2 the client classifies nothing beyond transient vs.
//! permanent — the Runner's policy decides what to do with that.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::Client;
use tokio::time::{sleep, timeout};
use tracing::{error, info, warn};

use crate::error::AdapterError;
use crate::model::{IntDate, PriceBars, UpstreamInstrument};

const MAX_RETRIES: u32 = 5;
const INITIAL_BACKOFF_MS: u64 = 100;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[async_trait]
pub trait PlatformAdapterClient: Send + Sync {
    /// Enumerates everything the upstream platform currently offers for a
    /// root symbol, on behalf of a specific user connection (spec.md §4.2
    /// `ListInstruments(user, connectionCode, root)`).
    async fn list_instruments(&self, user: &str, connection_code: &str, root: &str) -> Result<Vec<UpstreamInstrument>, AdapterError>;

    /// Fetches one day's bars for a symbol, acquiring a user-scoped token
    /// for `user`/`connection_code` (spec.md §4.2 `GetBars(user,
    /// connectionCode, symbol, intDate)`).
    async fn get_bars(&self, user: &str, connection_code: &str, symbol: &str, day: IntDate) -> Result<PriceBars, AdapterError>;
}

/// Live adapter backed by an HTTP platform API.
pub struct HttpPlatformAdapterClient {
    client: Client,
    base_url: String,
    api_key: String,
}

impl HttpPlatformAdapterClient {
    pub fn new(base_url: String, api_key: String) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_else(|_| Client::new());
        HttpPlatformAdapterClient {
            client,
            base_url,
            api_key,
        }
    }

    async fn execute_with_retry<F, Fut>(&self, request_fn: F) -> Result<reqwest::Response, AdapterError>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = reqwest::Result<reqwest::Response>>,
    {
        let mut backoff = INITIAL_BACKOFF_MS;

        for attempt in 0..MAX_RETRIES {
            match timeout(REQUEST_TIMEOUT, request_fn()).await {
                Ok(Ok(response)) => {
                    if response.status().is_success() {
                        return Ok(response);
                    } else if response.status().as_u16() == 429 {
                        warn!("platform adapter rate limited, backing off");
                        sleep(Duration::from_millis(backoff * 10)).await;
                    } else if response.status().is_client_error() {
                        error!(status = %response.status(), "platform adapter rejected request");
                        return Err(AdapterError::Permanent(format!(
                            "upstream returned {}",
                            response.status()
                        )));
                    } else {
                        warn!(status = %response.status(), attempt, "platform adapter transient error");
                    }
                }
                Ok(Err(e)) => {
                    warn!(attempt, error = %e, "platform adapter request failed");
                }
                Err(_) => {
                    warn!(attempt, "platform adapter request timed out");
                }
            }

            if attempt < MAX_RETRIES - 1 {
                info!(backoff_ms = backoff, "retrying platform adapter request");
                sleep(Duration::from_millis(backoff)).await;
                backoff = (backoff * 2).min(30_000);
            }
        }

        Err(AdapterError::Transient(
            "max retries exceeded for platform adapter request".to_string(),
        ))
    }
}

#[async_trait]
impl PlatformAdapterClient for HttpPlatformAdapterClient {
    async fn list_instruments(&self, user: &str, connection_code: &str, root: &str) -> Result<Vec<UpstreamInstrument>, AdapterError> {
        let url = format!("{}/instruments", self.base_url);
        let client = self.client.clone();
        let api_key = self.api_key.clone();
        let user = user.to_string();
        let connection_code = connection_code.to_string();
        let root = root.to_string();

        let response = self
            .execute_with_retry(|| {
                let url = url.clone();
                let api_key = api_key.clone();
                let client = client.clone();
                let user = user.clone();
                let connection_code = connection_code.clone();
                let root = root.clone();
                async move {
                    client
                        .get(&url)
                        .header("Authorization", format!("Bearer {}", api_key))
                        .query(&[("user", user), ("connectionCode", connection_code), ("root", root)])
                        .send()
                        .await
                }
            })
            .await?;

        response
            .json()
            .await
            .map_err(|e| AdapterError::Permanent(format!("bad instrument list payload: {e}")))
    }

    async fn get_bars(&self, user: &str, connection_code: &str, symbol: &str, day: IntDate) -> Result<PriceBars, AdapterError> {
        let url = format!("{}/bars", self.base_url);
        let client = self.client.clone();
        let api_key = self.api_key.clone();
        let user = user.to_string();
        let connection_code = connection_code.to_string();
        let symbol = symbol.to_string();

        let response = self
            .execute_with_retry(|| {
                let url = url.clone();
                let api_key = api_key.clone();
                let client = client.clone();
                let user = user.clone();
                let connection_code = connection_code.clone();
                let symbol = symbol.clone();
                async move {
                    client
                        .get(&url)
                        .header("Authorization", format!("Bearer {}", api_key))
                        .query(&[
                            ("user", user),
                            ("connectionCode", connection_code),
                            ("symbol", symbol),
                            ("day", day.0.to_string()),
                        ])
                        .send()
                        .await
                }
            })
            .await?;

        response
            .json()
            .await
            .map_err(|e| AdapterError::Permanent(format!("bad bars payload: {e}")))
    }
}

/// Deterministic in-memory adapter for tests: instruments and bars are
/// seeded up front, `get_bars` reports `no_data` for any day not seeded.
#[derive(Default)]
pub struct FakeAdapterClient {
    instruments: Mutex<HashMap<String, Vec<UpstreamInstrument>>>,
    bars: Mutex<HashMap<(String, IntDate), PriceBars>>,
    fail_next: Mutex<Option<AdapterError>>,
}

impl FakeAdapterClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed_instruments(&self, root: &str, instruments: Vec<UpstreamInstrument>) {
        self.instruments.lock().insert(root.to_string(), instruments);
    }

    pub fn seed_bars(&self, bars: PriceBars) {
        self.bars
            .lock()
            .insert((bars.symbol.clone(), bars.date), bars);
    }

    /// Makes the next call return this error instead of the seeded data —
    /// used to exercise the Runner's transient/permanent handling.
    pub fn fail_next_call(&self, err: AdapterError) {
        *self.fail_next.lock() = Some(err);
    }

    fn take_failure(&self) -> Option<AdapterError> {
        self.fail_next.lock().take()
    }
}

#[async_trait]
impl PlatformAdapterClient for FakeAdapterClient {
    async fn list_instruments(&self, _user: &str, _connection_code: &str, root: &str) -> Result<Vec<UpstreamInstrument>, AdapterError> {
        if let Some(err) = self.take_failure() {
            return Err(err);
        }
        Ok(self.instruments.lock().get(root).cloned().unwrap_or_default())
    }

    async fn get_bars(&self, _user: &str, _connection_code: &str, symbol: &str, day: IntDate) -> Result<PriceBars, AdapterError> {
        if let Some(err) = self.take_failure() {
            return Err(err);
        }
        Ok(self
            .bars
            .lock()
            .get(&(symbol.to_string(), day))
            .cloned()
            .unwrap_or(PriceBars {
                symbol: symbol.to_string(),
                date: day,
                bars: Vec::new(),
                no_data: true,
            }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fake_adapter_reports_no_data_for_unseeded_day() {
        let adapter = FakeAdapterClient::new();
        let bars = adapter.get_bars("trader", "conn-1", "ESH24", IntDate(20240102)).await.unwrap();
        assert!(bars.no_data);
        assert!(bars.bars.is_empty());
    }

    #[tokio::test]
    async fn fake_adapter_returns_seeded_bars() {
        let adapter = FakeAdapterClient::new();
        adapter.seed_bars(PriceBars {
            symbol: "ESH24".to_string(),
            date: IntDate(20240102),
            bars: vec![],
            no_data: false,
        });
        let bars = adapter.get_bars("trader", "conn-1", "ESH24", IntDate(20240102)).await.unwrap();
        assert!(!bars.no_data);
    }

    #[tokio::test]
    async fn fake_adapter_honors_injected_failure_once() {
        let adapter = FakeAdapterClient::new();
        adapter.fail_next_call(AdapterError::Transient("boom".to_string()));
        let err = adapter.get_bars("trader", "conn-1", "ESH24", IntDate(20240102)).await.unwrap_err();
        assert!(err.is_transient());
        let ok = adapter.get_bars("trader", "conn-1", "ESH24", IntDate(20240102)).await;
        assert!(ok.is_ok());
    }
}
