use std::{collections::HashMap, sync::Arc};

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    response::IntoResponse,
    Json,
};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::{
    mpsc::{channel, error::TrySendError, Sender},
    Notify,
};
use tracing::warn;

use crate::{
    errors::ApiError,
    feed::{PriceFeed, PriceSubscription},
    models::{HealthResponse, PriceSnapshot},
    symbol::normalize_symbol,
};

#[derive(Clone)]
pub struct AppState {
    feed: Arc<PriceFeed>,
}

impl AppState {
    pub fn new(feed: Arc<PriceFeed>) -> Self {
        Self { feed }
    }
}

pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

/// Pure cache read: `0.0` means "no observation yet", never an error.
pub async fn price(
    State(state): State<AppState>,
    Path(raw_symbol): Path<String>,
) -> Result<Json<PriceSnapshot>, ApiError> {
    if raw_symbol.trim().is_empty() {
        return Err(ApiError::Validation("`symbol` cannot be empty".to_string()));
    }

    let symbol = normalize_symbol(&raw_symbol);
    let price = state.feed.current_price(&raw_symbol);
    Ok(Json(PriceSnapshot { symbol, price }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClientStreamCommand {
    op: String,
    symbol: Option<String>,
}

enum ParsedStreamCommand {
    Subscribe(String),
    Unsubscribe(String),
    Ping,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WsErrorMessage {
    #[serde(rename = "type")]
    message_type: &'static str,
    code: &'static str,
    message: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WsAckMessage<'a> {
    #[serde(rename = "type")]
    message_type: &'static str,
    op: &'static str,
    symbol: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WsPriceUpdate<'a> {
    #[serde(rename = "type")]
    message_type: &'static str,
    symbol: &'a str,
    price: f64,
}

#[derive(Serialize)]
struct WsPongMessage {
    #[serde(rename = "type")]
    message_type: &'static str,
}

const CLIENT_OUTGOING_QUEUE_CAPACITY: usize = 256;

pub async fn price_stream_ws(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_price_stream_socket(socket, state))
}

async fn handle_price_stream_socket(socket: WebSocket, state: AppState) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (outgoing_sender, mut outgoing_receiver) =
        channel::<Message>(CLIENT_OUTGOING_QUEUE_CAPACITY);
    let close_signal = Arc::new(Notify::new());

    let writer_task = tokio::spawn(async move {
        while let Some(message) = outgoing_receiver.recv().await {
            if ws_sender.send(message).await.is_err() {
                break;
            }
        }
    });

    let mut subscriptions: HashMap<String, PriceSubscription> = HashMap::new();

    loop {
        let next_message = tokio::select! {
            _ = close_signal.notified() => {
                warn!("closing websocket client after forwarder backpressure");
                break;
            }
            next_message = ws_receiver.next() => next_message,
        };

        let Some(next_message) = next_message else {
            break;
        };

        let message = match next_message {
            Ok(message) => message,
            Err(err) => {
                warn!(error = %err, "client websocket read error");
                break;
            }
        };

        match message {
            Message::Ping(payload) => {
                if outgoing_sender.try_send(Message::Pong(payload)).is_err() {
                    break;
                }
            }
            Message::Close(_) => {
                break;
            }
            other => {
                let text = match ws_message_to_text(other) {
                    Ok(Some(text)) => text,
                    Ok(None) => continue,
                    Err(err) => {
                        if !send_ws_error(&outgoing_sender, "INVALID_MESSAGE", err) {
                            break;
                        }
                        continue;
                    }
                };

                let command = match parse_stream_command(&text) {
                    Ok(command) => command,
                    Err(err) => {
                        if !send_ws_error(&outgoing_sender, "INVALID_COMMAND", err) {
                            break;
                        }
                        continue;
                    }
                };

                if !handle_stream_command(
                    &state,
                    command,
                    &outgoing_sender,
                    &close_signal,
                    &mut subscriptions,
                ) {
                    break;
                }
            }
        }
    }

    for (_, subscription) in subscriptions {
        state.feed.unsubscribe(subscription);
    }

    drop(outgoing_sender);
    let _ = writer_task.await;
}

fn handle_stream_command(
    state: &AppState,
    command: ParsedStreamCommand,
    outgoing_sender: &Sender<Message>,
    close_signal: &Arc<Notify>,
    subscriptions: &mut HashMap<String, PriceSubscription>,
) -> bool {
    match command {
        ParsedStreamCommand::Ping => send_ws_json(
            outgoing_sender,
            &WsPongMessage {
                message_type: "pong",
            },
        ),
        ParsedStreamCommand::Subscribe(raw_symbol) => {
            let symbol = normalize_symbol(&raw_symbol);

            if subscriptions.contains_key(&symbol) {
                return send_ws_json(
                    outgoing_sender,
                    &WsAckMessage {
                        message_type: "alreadySubscribed",
                        op: "subscribe",
                        symbol: &symbol,
                    },
                );
            }

            let forwarder = price_forwarder(
                symbol.clone(),
                outgoing_sender.clone(),
                close_signal.clone(),
            );
            let subscription = state.feed.subscribe(&raw_symbol, forwarder);

            let acked = send_ws_json(
                outgoing_sender,
                &WsAckMessage {
                    message_type: "subscribed",
                    op: "subscribe",
                    symbol: subscription.symbol(),
                },
            );
            subscriptions.insert(symbol, subscription);
            acked
        }
        ParsedStreamCommand::Unsubscribe(raw_symbol) => {
            let symbol = normalize_symbol(&raw_symbol);

            let Some(subscription) = subscriptions.remove(&symbol) else {
                return send_ws_error(
                    outgoing_sender,
                    "NOT_SUBSCRIBED",
                    "symbol is not currently subscribed on this connection",
                );
            };

            state.feed.unsubscribe(subscription);

            send_ws_json(
                outgoing_sender,
                &WsAckMessage {
                    message_type: "unsubscribed",
                    op: "unsubscribe",
                    symbol: &symbol,
                },
            )
        }
    }
}

/// Callback handed to the feed for one client subscription: serializes the
/// update and pushes it onto the client's bounded outgoing queue. A full
/// queue flags the connection for close instead of blocking the fan-out.
fn price_forwarder(
    symbol: String,
    outgoing_sender: Sender<Message>,
    close_signal: Arc<Notify>,
) -> impl Fn(f64) + Send + Sync + 'static {
    move |price| {
        let update = WsPriceUpdate {
            message_type: "price",
            symbol: &symbol,
            price,
        };
        if !send_ws_json(&outgoing_sender, &update) {
            close_signal.notify_one();
        }
    }
}

fn parse_stream_command(payload: &str) -> Result<ParsedStreamCommand, String> {
    let command = serde_json::from_str::<ClientStreamCommand>(payload)
        .map_err(|err| format!("invalid JSON command: {err}"))?;

    let op = command.op.trim().to_ascii_lowercase();
    match op.as_str() {
        "ping" => Ok(ParsedStreamCommand::Ping),
        "subscribe" | "unsubscribe" => {
            let symbol = command.symbol.unwrap_or_default().trim().to_string();
            if symbol.is_empty() {
                return Err("`symbol` is required for subscribe and unsubscribe".to_string());
            }

            if op == "subscribe" {
                Ok(ParsedStreamCommand::Subscribe(symbol))
            } else {
                Ok(ParsedStreamCommand::Unsubscribe(symbol))
            }
        }
        other => Err(format!(
            "unsupported op `{other}`; expected `subscribe`, `unsubscribe`, or `ping`"
        )),
    }
}

fn ws_message_to_text(message: Message) -> Result<Option<String>, String> {
    match message {
        Message::Text(text) => Ok(Some(text.to_string())),
        Message::Binary(binary) => String::from_utf8(binary.to_vec())
            .map(Some)
            .map_err(|err| format!("invalid UTF-8 websocket payload: {err}")),
        Message::Ping(_) | Message::Pong(_) | Message::Close(_) => Ok(None),
    }
}

fn send_ws_error(
    outgoing_sender: &Sender<Message>,
    code: &'static str,
    message: impl Into<String>,
) -> bool {
    send_ws_json(
        outgoing_sender,
        &WsErrorMessage {
            message_type: "error",
            code,
            message: message.into(),
        },
    )
}

fn send_ws_json<T: Serialize>(outgoing_sender: &Sender<Message>, payload: &T) -> bool {
    let encoded = match serde_json::to_string(payload) {
        Ok(encoded) => encoded,
        Err(err) => {
            warn!(error = %err, "failed to serialize websocket message");
            return false;
        }
    };

    match outgoing_sender.try_send(Message::Text(encoded.into())) {
        Ok(()) => true,
        Err(TrySendError::Full(_)) => {
            warn!("closing websocket client: outgoing queue is full");
            false
        }
        Err(TrySendError::Closed(_)) => false,
    }
}
