//! Subscription registry and fan-out.
//!
//! [`PriceFeed`] is an explicit, constructible service object: the
//! composition root creates one, hands out subscriptions, and calls
//! [`PriceFeed::shutdown`] on exit. It owns the subscriber map and the
//! last-price cache; the stream connector owns the connection handle. All
//! map mutation happens under short `parking_lot` critical sections with a
//! fixed lock order (subscribers, then prices), and callbacks are always
//! invoked on a snapshot with no lock held, so a callback may re-enter
//! `subscribe`/`unsubscribe` freely.

use std::{
    collections::HashMap,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use parking_lot::Mutex;
use tokio::{runtime::Handle, sync::watch};

use crate::{
    config::Config,
    connector::{KlineStreamRunner, StreamRunner, TickSink},
    errors::FeedError,
    models::{PriceTick, StreamState},
    rest::{RestPriceClient, SpotPriceSource},
    symbol::normalize_symbol,
};

pub type PriceCallback = Arc<dyn Fn(f64) + Send + Sync>;

/// Opaque handle minted at subscribe time; pass it back to
/// [`PriceFeed::unsubscribe`] to remove the callback.
#[derive(Debug)]
pub struct PriceSubscription {
    symbol: String,
    subscriber_id: u64,
}

impl PriceSubscription {
    /// The canonical symbol this subscription resolved to.
    pub fn symbol(&self) -> &str {
        &self.symbol
    }
}

pub struct PriceFeed {
    shared: Arc<FeedShared>,
    runner: Arc<dyn StreamRunner>,
    warmup: Arc<dyn SpotPriceSource>,
    /// Shutdown sender for the currently-spawned stream runner, if any.
    active_stream: Mutex<Option<watch::Sender<bool>>>,
    runtime: Handle,
}

struct FeedShared {
    /// Canonical symbol -> subscriber id -> callback. A key exists iff the
    /// symbol has at least one live callback.
    subscribers: Mutex<HashMap<String, HashMap<u64, PriceCallback>>>,
    /// Canonical symbol -> most recent observed price. Entries live only
    /// while the symbol has subscribers.
    last_prices: Mutex<HashMap<String, f64>>,
    next_subscriber_id: AtomicU64,
    stream_state: watch::Sender<StreamState>,
    state_receiver: watch::Receiver<StreamState>,
}

impl TickSink for FeedShared {
    fn deliver(&self, tick: PriceTick) {
        let callbacks: Vec<PriceCallback> = {
            let subscribers = self.subscribers.lock();
            let Some(entries) = subscribers.get(&tick.symbol) else {
                // A late tick for a symbol whose last subscriber already
                // left; caching it would leak a stale price into an
                // unrelated future subscription.
                return;
            };
            self.last_prices.lock().insert(tick.symbol.clone(), tick.price);
            entries.values().cloned().collect()
        };

        for callback in &callbacks {
            invoke_isolated(callback, tick.price, &tick.symbol);
        }
    }

    fn stream_state_changed(&self, state: StreamState) {
        let _ = self.stream_state.send_replace(state);
    }
}

fn invoke_isolated(callback: &PriceCallback, price: f64, symbol: &str) {
    if catch_unwind(AssertUnwindSafe(|| callback(price))).is_err() {
        tracing::warn!(symbol = %symbol, "price subscriber panicked during fan-out, continuing");
    }
}

impl PriceFeed {
    /// Build a feed against the real upstream transports described by
    /// `config`.
    ///
    /// Must be called from within a Tokio runtime: the feed captures the
    /// current runtime handle to spawn stream and warm-up tasks.
    pub fn new(config: &Config) -> Result<Arc<Self>, FeedError> {
        let runner = KlineStreamRunner::new(
            config.stream_base_url.clone(),
            Duration::from_millis(config.reconnect_delay_ms),
        );
        let warmup = RestPriceClient::new(
            config.rest_base_url.clone(),
            Duration::from_millis(config.warmup_timeout_ms),
        )?;

        Ok(Self::with_sources(Arc::new(runner), Arc::new(warmup)))
    }

    /// Build a feed with injected transports. Lets tests (and embedders)
    /// run multiple independent instances without touching the network.
    pub fn with_sources(
        runner: Arc<dyn StreamRunner>,
        warmup: Arc<dyn SpotPriceSource>,
    ) -> Arc<Self> {
        let (state_sender, state_receiver) = watch::channel(StreamState::Disconnected);

        Arc::new(Self {
            shared: Arc::new(FeedShared {
                subscribers: Mutex::new(HashMap::new()),
                last_prices: Mutex::new(HashMap::new()),
                next_subscriber_id: AtomicU64::new(1),
                stream_state: state_sender,
                state_receiver,
            }),
            runner,
            warmup,
            active_stream: Mutex::new(None),
            runtime: Handle::current(),
        })
    }

    /// Register `callback` for price updates on `raw_symbol`.
    ///
    /// The callback is invoked zero or more times until the returned handle
    /// is passed to [`PriceFeed::unsubscribe`]. A one-shot warm-up fetch is
    /// scheduled immediately so the caller usually sees a price before the
    /// first stream tick; the fetch is best effort and its failure is
    /// silent. The first subscriber for a new symbol triggers a full-set
    /// stream resubscribe.
    pub fn subscribe(
        &self,
        raw_symbol: &str,
        callback: impl Fn(f64) + Send + Sync + 'static,
    ) -> PriceSubscription {
        let symbol = normalize_symbol(raw_symbol);
        let callback: PriceCallback = Arc::new(callback);
        let subscriber_id = self.shared.next_subscriber_id.fetch_add(1, Ordering::Relaxed);

        let first_for_symbol = {
            let mut subscribers = self.shared.subscribers.lock();
            let entries = subscribers.entry(symbol.clone()).or_default();
            entries.insert(subscriber_id, callback.clone());
            entries.len() == 1
        };

        self.spawn_warmup_fetch(symbol.clone(), subscriber_id, callback);

        if first_for_symbol {
            self.resync_stream();
        }

        tracing::debug!(symbol = %symbol, subscriber_id, "price subscription added");
        PriceSubscription {
            symbol,
            subscriber_id,
        }
    }

    /// Remove a subscription. When the symbol's last subscriber leaves, its
    /// cached price is dropped and the stream is resized; when the registry
    /// becomes empty the connection is torn down entirely.
    pub fn unsubscribe(&self, subscription: PriceSubscription) {
        let PriceSubscription {
            symbol,
            subscriber_id,
        } = subscription;

        let removed_last_for_symbol = {
            let mut subscribers = self.shared.subscribers.lock();
            let Some(entries) = subscribers.get_mut(&symbol) else {
                return;
            };
            entries.remove(&subscriber_id);
            if entries.is_empty() {
                subscribers.remove(&symbol);
                self.shared.last_prices.lock().remove(&symbol);
                true
            } else {
                false
            }
        };

        if removed_last_for_symbol {
            self.resync_stream();
        }

        tracing::debug!(symbol = %symbol, subscriber_id, "price subscription removed");
    }

    /// Last observed price for `raw_symbol`, or `0.0` when nothing has been
    /// observed yet. Pure read: never triggers I/O.
    pub fn current_price(&self, raw_symbol: &str) -> f64 {
        let symbol = normalize_symbol(raw_symbol);
        self.shared
            .last_prices
            .lock()
            .get(&symbol)
            .copied()
            .unwrap_or(0.0)
    }

    pub fn stream_state(&self) -> StreamState {
        *self.shared.state_receiver.borrow()
    }

    /// Stop the stream and drop all subscriptions and cached prices.
    pub fn shutdown(&self) {
        if let Some(previous) = self.active_stream.lock().take() {
            let _ = previous.send(true);
        }

        self.shared.subscribers.lock().clear();
        self.shared.last_prices.lock().clear();
        self.shared.stream_state_changed(StreamState::Disconnected);
        tracing::info!("price feed shut down");
    }

    /// Re-issue the stream for the current symbol union. The transport has
    /// no incremental subscribe, so any set change tears the connection down
    /// and reopens it with the full updated set, accepting a brief tick gap.
    fn resync_stream(&self) {
        let symbols = {
            let subscribers = self.shared.subscribers.lock();
            let mut symbols = subscribers.keys().cloned().collect::<Vec<_>>();
            symbols.sort();
            symbols
        };

        let mut active_stream = self.active_stream.lock();
        if let Some(previous) = active_stream.take() {
            let _ = previous.send(true);
        }

        if symbols.is_empty() {
            self.shared.stream_state_changed(StreamState::Disconnected);
            return;
        }

        let (shutdown_sender, shutdown_receiver) = watch::channel(false);
        let runner = self.runner.clone();
        let sink: Arc<dyn TickSink> = self.shared.clone();

        self.runtime.spawn(async move {
            runner.run(symbols, sink, shutdown_receiver).await;
        });

        *active_stream = Some(shutdown_sender);
    }

    fn spawn_warmup_fetch(&self, symbol: String, subscriber_id: u64, callback: PriceCallback) {
        let warmup = self.warmup.clone();
        let shared = self.shared.clone();

        self.runtime.spawn(async move {
            match warmup.current_price(&symbol).await {
                Ok(price) => {
                    // The fetch may outlive the subscription that requested
                    // it. The cache still takes the observation while the
                    // symbol has any subscriber, but the callback fires only
                    // if this exact subscription is still registered.
                    let subscription_live = {
                        let subscribers = shared.subscribers.lock();
                        let Some(entries) = subscribers.get(&symbol) else {
                            return;
                        };
                        shared.last_prices.lock().insert(symbol.clone(), price);
                        entries.contains_key(&subscriber_id)
                    };
                    if subscription_live {
                        invoke_isolated(&callback, price, &symbol);
                    }
                }
                Err(err) => {
                    tracing::debug!(symbol = %symbol, error = %err, "warm-up price fetch failed");
                }
            }
        });
    }

    #[cfg(test)]
    fn inject_tick(&self, tick: PriceTick) {
        self.shared.deliver(tick);
    }

    #[cfg(test)]
    fn active_symbol_count(&self) -> usize {
        self.shared.subscribers.lock().len()
    }
}
