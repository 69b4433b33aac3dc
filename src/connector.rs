//! Upstream stream connector.
//!
//! Owns the single multiplexed kline connection covering the union of all
//! subscribed canonical symbols. The transport sits behind [`StreamRunner`]
//! so the reconnect policy and the registry can be exercised without network
//! I/O; [`KlineStreamRunner`] is the real implementation.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::{sync::watch, time::sleep};
use tokio_tungstenite::{connect_async, tungstenite::Message as TungsteniteMessage};

use crate::models::{PriceTick, StreamState};

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Where validated ticks and connection-state transitions land. Implemented
/// by the feed's shared core; fakes implement it directly in tests.
pub trait TickSink: Send + Sync {
    fn deliver(&self, tick: PriceTick);
    fn stream_state_changed(&self, state: StreamState);
}

/// Drives one streaming session for a fixed symbol set until `shutdown`
/// fires. The transport has no incremental subscribe primitive: whenever the
/// symbol set changes the feed stops the current runner and starts a fresh
/// one covering the updated set.
#[async_trait]
pub trait StreamRunner: Send + Sync {
    async fn run(
        &self,
        symbols: Vec<String>,
        sink: Arc<dyn TickSink>,
        shutdown: watch::Receiver<bool>,
    );
}

enum ConnectionOutcome {
    Stop,
    Reconnect,
}

/// Real upstream transport: a combined-stream WebSocket of 1-minute kline
/// sub-streams, one per canonical symbol.
pub struct KlineStreamRunner {
    stream_base_url: String,
    reconnect_delay: Duration,
}

impl KlineStreamRunner {
    pub fn new(stream_base_url: String, reconnect_delay: Duration) -> Self {
        Self {
            stream_base_url: stream_base_url.trim_end_matches('/').to_string(),
            reconnect_delay,
        }
    }

    fn stream_url(&self, symbols: &[String]) -> String {
        let streams = symbols
            .iter()
            .map(|symbol| format!("{}@kline_1m", symbol.to_ascii_lowercase()))
            .collect::<Vec<_>>()
            .join("/");
        format!("{}/stream?streams={streams}", self.stream_base_url)
    }
}

#[async_trait]
impl StreamRunner for KlineStreamRunner {
    async fn run(
        &self,
        symbols: Vec<String>,
        sink: Arc<dyn TickSink>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        if symbols.is_empty() {
            return;
        }

        let ws_endpoint = self.stream_url(&symbols);

        loop {
            if *shutdown.borrow() {
                return;
            }

            sink.stream_state_changed(StreamState::Connecting);
            let outcome =
                run_single_connection(&ws_endpoint, sink.as_ref(), &mut shutdown).await;

            match outcome {
                ConnectionOutcome::Stop => return,
                ConnectionOutcome::Reconnect => {
                    // Exactly one reconnect attempt per close, re-armed on
                    // every close. The feed stops this runner outright once
                    // the registry is empty, so there is no reconnect storm
                    // after the last unsubscribe.
                    sink.stream_state_changed(StreamState::Reconnecting);

                    tokio::select! {
                        changed = shutdown.changed() => {
                            if changed.is_ok() && *shutdown.borrow() {
                                return;
                            }
                        }
                        _ = sleep(self.reconnect_delay) => {}
                    }
                }
            }
        }
    }
}

async fn run_single_connection(
    ws_endpoint: &str,
    sink: &dyn TickSink,
    shutdown: &mut watch::Receiver<bool>,
) -> ConnectionOutcome {
    let Ok((mut stream, _response)) = connect_async(ws_endpoint).await else {
        // Blocked or refused connections are expected (firewalls, ad
        // blockers); subscribers keep working off the warm-up REST path.
        tracing::warn!(ws_endpoint = %ws_endpoint, "failed to connect upstream price stream");
        return ConnectionOutcome::Reconnect;
    };

    tracing::info!(ws_endpoint = %ws_endpoint, "connected upstream price stream");
    sink.stream_state_changed(StreamState::Connected);

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_ok() && *shutdown.borrow() {
                    let _ = stream.close(None).await;
                    return ConnectionOutcome::Stop;
                }
            }
            message = stream.next() => {
                match message {
                    Some(Ok(TungsteniteMessage::Text(text))) => {
                        forward_tick(text.as_ref(), sink);
                    }
                    Some(Ok(TungsteniteMessage::Binary(binary))) => {
                        if let Ok(text) = String::from_utf8(binary.to_vec()) {
                            forward_tick(&text, sink);
                        }
                    }
                    Some(Ok(TungsteniteMessage::Ping(payload))) => {
                        if send_pong(&mut stream, payload).await.is_err() {
                            return ConnectionOutcome::Reconnect;
                        }
                    }
                    Some(Ok(TungsteniteMessage::Close(_))) => {
                        return ConnectionOutcome::Reconnect;
                    }
                    Some(Err(err)) => {
                        tracing::warn!(error = %err, "upstream price stream error");
                        return ConnectionOutcome::Reconnect;
                    }
                    None => {
                        return ConnectionOutcome::Reconnect;
                    }
                    _ => {}
                }
            }
        }
    }
}

async fn send_pong(
    stream: &mut WsStream,
    payload: tokio_tungstenite::tungstenite::Bytes,
) -> Result<(), tokio_tungstenite::tungstenite::Error> {
    stream.send(TungsteniteMessage::Pong(payload)).await
}

fn forward_tick(payload: &str, sink: &dyn TickSink) {
    if let Some(tick) = parse_stream_tick(payload) {
        sink.deliver(tick);
    }
}

/// Parse and validate one combined-stream payload.
///
/// The price is the close of the current candle (`k.c`), taken whether or
/// not the candle is final (`k.x`): the chart display is candle-based and
/// must match it exactly. Malformed envelopes and non-positive or
/// non-finite prices are dropped here so they never reach subscribers.
pub fn parse_stream_tick(payload: &str) -> Option<PriceTick> {
    let Ok(value) = serde_json::from_str::<Value>(payload) else {
        tracing::debug!("dropping unparseable stream payload");
        return None;
    };

    let data = value.get("data").unwrap_or(&value);
    if data.get("e").and_then(Value::as_str).unwrap_or_default() != "kline" {
        return None;
    }

    let symbol = data
        .get("s")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|symbol| !symbol.is_empty())?;

    let Some(price) = data.get("k").and_then(|kline| kline.get("c")).and_then(parse_f64_lossy)
    else {
        tracing::debug!(symbol = %symbol, "dropping kline tick without close price");
        return None;
    };

    if !price.is_finite() || price <= 0.0 {
        tracing::debug!(symbol = %symbol, price, "dropping kline tick with invalid price");
        return None;
    }

    Some(PriceTick {
        symbol: symbol.to_string(),
        price,
    })
}

pub fn parse_f64_lossy(value: &Value) -> Option<f64> {
    value
        .as_f64()
        .or_else(|| value.as_i64().map(|numeric| numeric as f64))
        .or_else(|| value.as_u64().map(|numeric| numeric as f64))
        .or_else(|| value.as_str().and_then(|text| text.parse::<f64>().ok()))
}
