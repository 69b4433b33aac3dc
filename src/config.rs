use anyhow::{Context, Result};

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub stream_base_url: String,
    pub rest_base_url: String,
    pub reconnect_delay_ms: u64,
    pub warmup_timeout_ms: u64,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let host = std::env::var("HOST")
            .unwrap_or_else(|_| "0.0.0.0".to_string())
            .trim()
            .to_string();

        let port = match std::env::var("PORT") {
            Ok(value) => value
                .trim()
                .parse::<u16>()
                .with_context(|| format!("invalid PORT value: {value}"))?,
            Err(_) => 8080,
        };

        let stream_base_url = std::env::var("STREAM_BASE_URL")
            .unwrap_or_else(|_| "wss://stream.binance.com:9443".to_string())
            .trim()
            .trim_end_matches('/')
            .to_string();

        let rest_base_url = std::env::var("REST_BASE_URL")
            .unwrap_or_else(|_| "https://api.binance.com".to_string())
            .trim()
            .trim_end_matches('/')
            .to_string();

        let reconnect_delay_ms = match std::env::var("RECONNECT_DELAY_MS") {
            Ok(value) => value
                .trim()
                .parse::<u64>()
                .with_context(|| format!("invalid RECONNECT_DELAY_MS value: {value}"))?,
            Err(_) => 5_000,
        };

        let warmup_timeout_ms = match std::env::var("WARMUP_TIMEOUT_MS") {
            Ok(value) => value
                .trim()
                .parse::<u64>()
                .with_context(|| format!("invalid WARMUP_TIMEOUT_MS value: {value}"))?,
            Err(_) => 3_000,
        };

        Ok(Self {
            host,
            port,
            stream_base_url,
            rest_base_url,
            reconnect_delay_ms,
            warmup_timeout_ms,
        })
    }
}
