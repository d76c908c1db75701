/// Raw OHLCV fetch client
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tracing::debug;

use crate::config::FetcherSettings;
use crate::error::{PipelineError, Result};
use crate::types::RawBar;
use crate::utils::RateLimiter;

/// Source of raw bars. Failures surface as `Network` or `RateLimit`.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Rows covering `period` (e.g. "5d") at `interval` (e.g. "5m")
    async fn get_historical(&self, pair: &str, period: &str, interval: &str)
        -> Result<Vec<RawBar>>;

    /// Most recent row, if the upstream has one
    async fn get_latest(&self, pair: &str) -> Result<Option<RawBar>>;
}

#[derive(Debug, Deserialize)]
struct CandleResponse {
    status: bool,
    #[serde(default)]
    message: String,
    #[serde(default)]
    data: Vec<RawBar>,
}

/// JSON-over-HTTP fetcher for a candle service exposing
/// `GET /candles?pair=&period=&interval=` and `GET /latest?pair=`
pub struct HttpFetcher {
    client: Client,
    base_url: String,
    limiter: RateLimiter,
}

impl HttpFetcher {
    pub fn new(settings: &FetcherSettings) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(settings.timeout_seconds))
            .build()
            .map_err(|e| PipelineError::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(HttpFetcher {
            client,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            limiter: RateLimiter::new(settings.requests_per_second),
        })
    }

    async fn request(&self, path: &str, query: &[(&str, &str)]) -> Result<CandleResponse> {
        self.limiter.acquire().await;

        let url = format!("{}{}", self.base_url, path);
        debug!("Fetching {} {:?}", url, query);

        let response = self
            .client
            .get(&url)
            .query(query)
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| PipelineError::Network(format!("{}: {}", url, e)))?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(PipelineError::RateLimit(format!("{} returned 429", url)));
        }
        if !status.is_success() {
            return Err(PipelineError::Network(format!("{} returned {}", url, status)));
        }

        let body = response.text().await?;
        let candles: CandleResponse = serde_json::from_str(&body)
            .map_err(|e| PipelineError::Network(format!("Malformed candle payload: {}", e)))?;

        if !candles.status {
            return Err(PipelineError::Network(format!(
                "Candle fetch failed: {}",
                candles.message
            )));
        }

        Ok(candles)
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn get_historical(
        &self,
        pair: &str,
        period: &str,
        interval: &str,
    ) -> Result<Vec<RawBar>> {
        let response = self
            .request(
                "/candles",
                &[("pair", pair), ("period", period), ("interval", interval)],
            )
            .await?;
        Ok(response.data)
    }

    async fn get_latest(&self, pair: &str) -> Result<Option<RawBar>> {
        let response = self.request("/latest", &[("pair", pair)]).await?;
        Ok(response.data.into_iter().max_by_key(|bar| bar.timestamp))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_candle_payload_with_missing_prices() {
        let body = r#"{
            "status": true,
            "data": [
                {"timestamp": "2025-03-03T10:00:00Z", "open": "1.0850", "high": "1.0870",
                 "low": "1.0840", "close": "1.0860", "volume": 120},
                {"timestamp": "2025-03-03T10:05:00Z", "open": null, "high": "1.0870",
                 "low": "1.0840", "close": "1.0860"}
            ]
        }"#;

        let parsed: CandleResponse = serde_json::from_str(body).unwrap();
        assert!(parsed.status);
        assert_eq!(parsed.data.len(), 2);
        assert!(parsed.data[1].open.is_none());
        assert!(parsed.data[1].volume.is_none());
    }

    #[test]
    fn test_base_url_trailing_slash_trimmed() {
        let settings = FetcherSettings {
            base_url: "http://localhost:9000/".to_string(),
            ..FetcherSettings::default()
        };
        let fetcher = HttpFetcher::new(&settings).unwrap();
        assert_eq!(fetcher.base_url, "http://localhost:9000");
    }
}
