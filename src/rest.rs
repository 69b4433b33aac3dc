//! One-shot REST price lookups used to warm new subscriptions up while the
//! stream is still connecting. Best effort only: the stream is the long-term
//! source of truth, so failures here are logged and swallowed by the caller.

use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

use crate::errors::FeedError;

#[async_trait]
pub trait SpotPriceSource: Send + Sync {
    async fn current_price(&self, symbol: &str) -> Result<f64, FeedError>;
}

pub struct RestPriceClient {
    client: reqwest::Client,
    rest_base_url: String,
}

#[derive(Debug, Deserialize)]
struct TickerPriceResponse {
    price: String,
}

impl RestPriceClient {
    pub fn new(rest_base_url: String, timeout: Duration) -> Result<Self, FeedError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| {
                FeedError::Internal(format!("failed to build warm-up HTTP client: {err}"))
            })?;

        Ok(Self {
            client,
            rest_base_url: rest_base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl SpotPriceSource for RestPriceClient {
    async fn current_price(&self, symbol: &str) -> Result<f64, FeedError> {
        let url = format!("{}/api/v3/ticker/price?symbol={symbol}", self.rest_base_url);

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|err| FeedError::WarmupRequest(err.to_string()))?;

        if !response.status().is_success() {
            return Err(FeedError::WarmupRequest(format!(
                "warm-up fetch for `{symbol}` returned {}",
                response.status()
            )));
        }

        let ticker = response
            .json::<TickerPriceResponse>()
            .await
            .map_err(|err| FeedError::WarmupData(err.to_string()))?;

        let price = ticker.price.trim().parse::<f64>().map_err(|err| {
            FeedError::WarmupData(format!(
                "failed to parse price `{}` for `{symbol}`: {err}",
                ticker.price
            ))
        })?;

        if !price.is_finite() || price <= 0.0 {
            return Err(FeedError::WarmupData(format!(
                "non-positive price `{price}` for `{symbol}`"
            )));
        }

        Ok(price)
    }
}
