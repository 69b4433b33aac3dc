use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use axum::{
    extract::{
        ws::{Message as AxumWsMessage, WebSocket, WebSocketUpgrade},
        Query, RawQuery, State,
    },
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use price_feed_backend::{
    config::Config,
    feed::PriceFeed,
    web::{self, AppState},
};
use serde_json::{json, Value};
use tokio::{
    net::TcpListener,
    sync::{broadcast, oneshot},
    task::JoinHandle,
    time::timeout,
};
use tokio_tungstenite::{connect_async, tungstenite::Message as TungsteniteMessage};

#[derive(Clone)]
struct MockUpstreamState {
    connection_count: Arc<AtomicUsize>,
    active_connections: Arc<AtomicUsize>,
    stream_params: Arc<Mutex<Vec<String>>>,
    warmup_requests: Arc<Mutex<Vec<String>>>,
    warmup_price: Option<String>,
    outbound_ticks: broadcast::Sender<String>,
    force_close: broadcast::Sender<()>,
}

struct MockUpstream {
    bind: String,
    state: MockUpstreamState,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

async fn spawn_server(app: Router) -> (String, oneshot::Sender<()>, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("listener should bind");
    let addr = listener
        .local_addr()
        .expect("listener should expose address");
    let (shutdown_sender, shutdown_receiver) = oneshot::channel::<()>();

    let task = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_receiver.await;
            })
            .await
            .expect("server should run");
    });

    (format!("127.0.0.1:{}", addr.port()), shutdown_sender, task)
}

async fn spawn_upstream(warmup_price: Option<&str>) -> MockUpstream {
    let (outbound_ticks, _) = broadcast::channel::<String>(32);
    let (force_close, _) = broadcast::channel::<()>(4);

    let state = MockUpstreamState {
        connection_count: Arc::new(AtomicUsize::new(0)),
        active_connections: Arc::new(AtomicUsize::new(0)),
        stream_params: Arc::new(Mutex::new(Vec::new())),
        warmup_requests: Arc::new(Mutex::new(Vec::new())),
        warmup_price: warmup_price.map(str::to_string),
        outbound_ticks,
        force_close,
    };

    let app = Router::new()
        .route("/stream", get(upstream_stream_route))
        .route("/api/v3/ticker/price", get(upstream_ticker_price))
        .with_state(state.clone());

    let (bind, shutdown, task) = spawn_server(app).await;

    MockUpstream {
        bind,
        state,
        shutdown,
        task,
    }
}

async fn upstream_stream_route(
    ws: WebSocketUpgrade,
    RawQuery(query): RawQuery,
    State(state): State<MockUpstreamState>,
) -> impl IntoResponse {
    state.stream_params.lock().push(query.unwrap_or_default());
    ws.on_upgrade(move |socket| upstream_stream_handler(socket, state))
}

async fn upstream_stream_handler(socket: WebSocket, state: MockUpstreamState) {
    state.connection_count.fetch_add(1, Ordering::SeqCst);
    state.active_connections.fetch_add(1, Ordering::SeqCst);

    let (mut sender, mut receiver) = socket.split();
    let mut outbound_ticks = state.outbound_ticks.subscribe();
    let mut force_close = state.force_close.subscribe();

    loop {
        tokio::select! {
            payload = outbound_ticks.recv() => {
                let Ok(payload) = payload else { break };
                if sender.send(AxumWsMessage::Text(payload.into())).await.is_err() {
                    break;
                }
            }
            _ = force_close.recv() => break,
            message = receiver.next() => {
                match message {
                    Some(Ok(AxumWsMessage::Close(_))) | Some(Err(_)) | None => break,
                    _ => {}
                }
            }
        }
    }

    state.active_connections.fetch_sub(1, Ordering::SeqCst);
}

async fn upstream_ticker_price(
    Query(params): Query<HashMap<String, String>>,
    State(state): State<MockUpstreamState>,
) -> impl IntoResponse {
    let symbol = params.get("symbol").cloned().unwrap_or_default();
    state.warmup_requests.lock().push(symbol.clone());

    match state.warmup_price {
        Some(price) => {
            (StatusCode::OK, Json(json!({"symbol": symbol, "price": price}))).into_response()
        }
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

fn test_config(upstream_bind: &str) -> Config {
    Config {
        host: "127.0.0.1".to_string(),
        port: 0,
        stream_base_url: format!("ws://{upstream_bind}"),
        rest_base_url: format!("http://{upstream_bind}"),
        reconnect_delay_ms: 50,
        warmup_timeout_ms: 1_000,
    }
}

fn kline_payload(symbol: &str, close: &str) -> String {
    json!({
        "stream": format!("{}@kline_1m", symbol.to_ascii_lowercase()),
        "data": {
            "e": "kline",
            "s": symbol,
            "k": {"c": close, "x": false}
        }
    })
    .to_string()
}

async fn wait_until(description: &str, mut condition: impl FnMut() -> bool) {
    timeout(Duration::from_secs(3), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {description}"));
}

async fn recv_message_of_type(
    stream: &mut tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
    expected_type: &str,
) -> Value {
    timeout(Duration::from_secs(3), async {
        loop {
            let message = stream
                .next()
                .await
                .expect("websocket should stay open")
                .expect("websocket frame should decode");

            let text = match message {
                TungsteniteMessage::Text(text) => text.to_string(),
                TungsteniteMessage::Binary(binary) => {
                    String::from_utf8(binary.to_vec()).expect("binary frame should be utf8")
                }
                TungsteniteMessage::Ping(payload) => {
                    stream
                        .send(TungsteniteMessage::Pong(payload))
                        .await
                        .expect("pong should send");
                    continue;
                }
                TungsteniteMessage::Pong(_) => continue,
                TungsteniteMessage::Close(_) => panic!("websocket closed before expected message"),
                _ => continue,
            };

            let value = serde_json::from_str::<Value>(&text).expect("ws payload should be JSON");
            if value
                .get("type")
                .and_then(Value::as_str)
                .is_some_and(|value| value == expected_type)
            {
                return value;
            }
        }
    })
    .await
    .expect("timed out waiting for websocket message")
}

#[tokio::test]
async fn warmup_fetch_populates_cache_before_first_tick() {
    let upstream = spawn_upstream(Some("68000.12")).await;
    let feed = PriceFeed::new(&test_config(&upstream.bind)).expect("feed should build");

    let received = Arc::new(Mutex::new(Vec::<f64>::new()));
    let subscription = {
        let received = received.clone();
        feed.subscribe("btc", move |price| {
            received.lock().push(price);
        })
    };

    wait_until("warm-up price delivery", || !received.lock().is_empty()).await;
    assert_eq!(*received.lock(), vec![68000.12]);
    assert_eq!(feed.current_price("btc"), 68000.12);
    assert_eq!(*upstream.state.warmup_requests.lock(), vec!["BTCUSDT"]);

    feed.unsubscribe(subscription);
    feed.shutdown();
    let _ = upstream.shutdown.send(());
    let _ = upstream.task.await;
}

#[tokio::test]
async fn subscribers_share_one_upstream_connection() {
    let upstream = spawn_upstream(None).await;
    let feed = PriceFeed::new(&test_config(&upstream.bind)).expect("feed should build");

    let prices_a = Arc::new(Mutex::new(Vec::<f64>::new()));
    let prices_b = Arc::new(Mutex::new(Vec::<f64>::new()));

    let subscription_a = {
        let prices_a = prices_a.clone();
        feed.subscribe("btc", move |price| prices_a.lock().push(price))
    };
    let subscription_b = {
        let prices_b = prices_b.clone();
        feed.subscribe("BTCUSDT", move |price| prices_b.lock().push(price))
    };

    wait_until("upstream connection", || {
        upstream.state.active_connections.load(Ordering::SeqCst) == 1
    })
    .await;
    assert_eq!(upstream.state.connection_count.load(Ordering::SeqCst), 1);
    assert_eq!(
        *upstream.state.stream_params.lock(),
        vec!["streams=btcusdt@kline_1m"]
    );

    upstream
        .state
        .outbound_ticks
        .send(kline_payload("BTCUSDT", "68123.5"))
        .expect("mock upstream should broadcast tick");

    wait_until("tick fan-out", || {
        !prices_a.lock().is_empty() && !prices_b.lock().is_empty()
    })
    .await;
    assert_eq!(*prices_a.lock(), vec![68123.5]);
    assert_eq!(*prices_b.lock(), vec![68123.5]);
    assert_eq!(feed.current_price("btc"), 68123.5);

    feed.unsubscribe(subscription_a);
    feed.unsubscribe(subscription_b);
    feed.shutdown();
    let _ = upstream.shutdown.send(());
    let _ = upstream.task.await;
}

#[tokio::test]
async fn stream_reconnects_with_same_symbol_set_after_upstream_close() {
    let upstream = spawn_upstream(None).await;
    let feed = PriceFeed::new(&test_config(&upstream.bind)).expect("feed should build");

    let received = Arc::new(Mutex::new(Vec::<f64>::new()));
    let subscription = {
        let received = received.clone();
        feed.subscribe("eth", move |price| received.lock().push(price))
    };

    wait_until("first upstream connection", || {
        upstream.state.active_connections.load(Ordering::SeqCst) == 1
    })
    .await;

    let _ = upstream.state.force_close.send(());

    wait_until("reconnect", || {
        upstream.state.connection_count.load(Ordering::SeqCst) == 2
            && upstream.state.active_connections.load(Ordering::SeqCst) == 1
    })
    .await;

    {
        let stream_params = upstream.state.stream_params.lock();
        assert_eq!(
            *stream_params,
            vec!["streams=ethusdt@kline_1m", "streams=ethusdt@kline_1m"]
        );
    }

    upstream
        .state
        .outbound_ticks
        .send(kline_payload("ETHUSDT", "3500.5"))
        .expect("mock upstream should broadcast tick");

    wait_until("tick after reconnect", || !received.lock().is_empty()).await;
    assert_eq!(feed.current_price("eth"), 3500.5);

    feed.unsubscribe(subscription);
    feed.shutdown();
    let _ = upstream.shutdown.send(());
    let _ = upstream.task.await;
}

#[tokio::test]
async fn last_unsubscribe_tears_down_upstream_connection() {
    let upstream = spawn_upstream(None).await;
    let feed = PriceFeed::new(&test_config(&upstream.bind)).expect("feed should build");

    let subscription = feed.subscribe("btc", |_| {});

    wait_until("upstream connection", || {
        upstream.state.active_connections.load(Ordering::SeqCst) == 1
    })
    .await;

    feed.unsubscribe(subscription);

    wait_until("upstream teardown", || {
        upstream.state.active_connections.load(Ordering::SeqCst) == 0
    })
    .await;

    // Longer than the reconnect delay; the closed stream must stay closed.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(upstream.state.connection_count.load(Ordering::SeqCst), 1);
    assert_eq!(feed.current_price("btc"), 0.0);

    feed.shutdown();
    let _ = upstream.shutdown.send(());
    let _ = upstream.task.await;
}

#[tokio::test]
async fn websocket_clients_receive_price_updates_end_to_end() {
    let upstream = spawn_upstream(None).await;
    let feed = PriceFeed::new(&test_config(&upstream.bind)).expect("feed should build");

    let app = Router::new()
        .route("/healthz", get(web::health))
        .route("/v1/price/{symbol}", get(web::price))
        .route("/v1/stream", get(web::price_stream_ws))
        .with_state(AppState::new(feed.clone()));
    let (backend_bind, backend_shutdown, backend_task) = spawn_server(app).await;

    let backend_ws_url = format!("ws://{backend_bind}/v1/stream");
    let (mut client_a, _) = connect_async(&backend_ws_url)
        .await
        .expect("first client should connect");
    let (mut client_b, _) = connect_async(&backend_ws_url)
        .await
        .expect("second client should connect");

    let subscribe = json!({"op": "subscribe", "symbol": "btc"}).to_string();
    client_a
        .send(TungsteniteMessage::Text(subscribe.clone().into()))
        .await
        .expect("first subscribe should send");
    client_b
        .send(TungsteniteMessage::Text(subscribe.into()))
        .await
        .expect("second subscribe should send");

    let ack_a = recv_message_of_type(&mut client_a, "subscribed").await;
    let _ack_b = recv_message_of_type(&mut client_b, "subscribed").await;
    assert_eq!(
        ack_a.get("symbol").and_then(Value::as_str),
        Some("BTCUSDT")
    );

    wait_until("upstream connection", || {
        upstream.state.active_connections.load(Ordering::SeqCst) == 1
    })
    .await;
    assert_eq!(upstream.state.connection_count.load(Ordering::SeqCst), 1);

    upstream
        .state
        .outbound_ticks
        .send(kline_payload("BTCUSDT", "68123.5"))
        .expect("mock upstream should broadcast tick");

    let update_a = recv_message_of_type(&mut client_a, "price").await;
    let update_b = recv_message_of_type(&mut client_b, "price").await;
    for update in [&update_a, &update_b] {
        assert_eq!(update.get("symbol").and_then(Value::as_str), Some("BTCUSDT"));
        assert_eq!(update.get("price").and_then(Value::as_f64), Some(68123.5));
    }

    let snapshot = reqwest::get(format!("http://{backend_bind}/v1/price/btc"))
        .await
        .expect("price request should succeed")
        .json::<Value>()
        .await
        .expect("price response should be JSON");
    assert_eq!(snapshot.get("symbol").and_then(Value::as_str), Some("BTCUSDT"));
    assert_eq!(snapshot.get("price").and_then(Value::as_f64), Some(68123.5));

    let unsubscribe = json!({"op": "unsubscribe", "symbol": "BTCUSDT"}).to_string();
    client_a
        .send(TungsteniteMessage::Text(unsubscribe.into()))
        .await
        .expect("unsubscribe should send");
    let _ = recv_message_of_type(&mut client_a, "unsubscribed").await;

    let _ = client_a.close(None).await;
    let _ = client_b.close(None).await;

    wait_until("upstream teardown after last client", || {
        upstream.state.active_connections.load(Ordering::SeqCst) == 0
    })
    .await;

    feed.shutdown();
    let _ = backend_shutdown.send(());
    let _ = backend_task.await;
    let _ = upstream.shutdown.send(());
    let _ = upstream.task.await;
}
