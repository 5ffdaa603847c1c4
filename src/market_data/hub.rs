// =============================================================================
// Market-Data Hub — single upstream websocket, many in-process subscribers
// =============================================================================
//
// The hub task is the single owner of the upstream connection and of the
// subscriber table. All interaction goes through a command channel, so
// subscription state can never race with fan-out.
//
// Reference counting: a downstream subscribe forwards an upstream subscribe
// only on the 0 -> 1 transition for its canonical channel key; an unsubscribe
// (or a dropped subscriber) forwards the upstream unsubscribe on 1 -> 0.
//
// Reconnect: exponential backoff capped at 30 s; on reconnect every key with
// at least one reference is re-subscribed exactly once. A ping is sent every
// 30 s while connected.
//
// Slow consumers: each subscriber has a bounded queue. A subscriber that
// cannot accept a frame is dropped and logged — upstream ingest never blocks.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::indicators::IndicatorEngine;
use crate::market_data::frames::{
    normalize_symbol, parse_upstream_message, ChannelKey, ChannelKind, MarketFrame,
};

/// Bounded per-subscriber delivery queue.
const SUBSCRIBER_QUEUE: usize = 256;
/// Upstream heartbeat interval.
const PING_INTERVAL: Duration = Duration::from_secs(30);
/// Reconnect backoff bounds.
const BACKOFF_INITIAL: Duration = Duration::from_secs(1);
const BACKOFF_MAX: Duration = Duration::from_secs(30);

// ---------------------------------------------------------------------------
// Commands and handles
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(pub u64);

enum HubCommand {
    Subscribe {
        key: ChannelKey,
        decorated: String,
        id: SubscriberId,
        tx: mpsc::Sender<MarketFrame>,
    },
    Unsubscribe {
        key: ChannelKey,
        id: SubscriberId,
    },
    /// Keep an upstream channel alive with no delivery target (indicator
    /// engine feeding).
    Pin {
        key: ChannelKey,
    },
    Unpin {
        key: ChannelKey,
    },
}

/// A live downstream subscription. Dropping it releases the reference.
pub struct Subscription {
    pub rx: mpsc::Receiver<MarketFrame>,
    key: ChannelKey,
    id: SubscriberId,
    cmd_tx: mpsc::UnboundedSender<HubCommand>,
}

impl Subscription {
    pub fn key(&self) -> &ChannelKey {
        &self.key
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let _ = self.cmd_tx.send(HubCommand::Unsubscribe {
            key: self.key.clone(),
            id: self.id,
        });
    }
}

// ---------------------------------------------------------------------------
// Hub facade
// ---------------------------------------------------------------------------

/// Public handle to the hub task.
pub struct MarketDataHub {
    cmd_tx: mpsc::UnboundedSender<HubCommand>,
    next_id: AtomicU64,
    connected: Arc<AtomicBool>,
}

impl MarketDataHub {
    /// Spawn the hub task against the given upstream URL. Candle frames are
    /// additionally fed into the indicator engine.
    pub fn start(ws_url: String, engine: Arc<IndicatorEngine>) -> Arc<Self> {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let connected = Arc::new(AtomicBool::new(false));

        let flag = connected.clone();
        tokio::spawn(async move {
            run_hub(ws_url, cmd_rx, engine, flag).await;
        });

        Arc::new(Self {
            cmd_tx,
            next_id: AtomicU64::new(1),
            connected,
        })
    }

    /// Subscribe with a possibly decorated symbol; frames are delivered with
    /// the subscriber's own spelling.
    pub fn subscribe(
        &self,
        kind: ChannelKind,
        decorated_symbol: &str,
        interval: Option<&str>,
    ) -> Subscription {
        let coin = normalize_symbol(decorated_symbol);
        let key = ChannelKey {
            kind,
            coin,
            interval: interval.map(str::to_string),
        };

        let id = SubscriberId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE);

        let _ = self.cmd_tx.send(HubCommand::Subscribe {
            key: key.clone(),
            decorated: decorated_symbol.to_string(),
            id,
            tx,
        });

        Subscription {
            rx,
            key,
            id,
            cmd_tx: self.cmd_tx.clone(),
        }
    }

    /// Keep candles flowing for a series without a delivery channel.
    pub fn pin_candles(&self, coin: &str, interval: &str) {
        let key = ChannelKey::candle(normalize_symbol(coin), interval);
        let _ = self.cmd_tx.send(HubCommand::Pin { key });
    }

    pub fn unpin_candles(&self, coin: &str, interval: &str) {
        let key = ChannelKey::candle(normalize_symbol(coin), interval);
        let _ = self.cmd_tx.send(HubCommand::Unpin { key });
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for MarketDataHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MarketDataHub")
            .field("connected", &self.is_connected())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Subscriber table (pure bookkeeping, separately testable)
// ---------------------------------------------------------------------------

struct Downstream {
    id: SubscriberId,
    decorated: String,
    tx: mpsc::Sender<MarketFrame>,
}

#[derive(Default)]
struct SubscriberTable {
    subs: HashMap<ChannelKey, Vec<Downstream>>,
    pins: HashMap<ChannelKey, usize>,
}

impl SubscriberTable {
    fn refcount(&self, key: &ChannelKey) -> usize {
        self.subs.get(key).map_or(0, Vec::len) + self.pins.get(key).copied().unwrap_or(0)
    }

    /// Returns true when this add is the 0 -> 1 transition.
    fn add(&mut self, key: ChannelKey, downstream: Downstream) -> bool {
        let was_zero = self.refcount(&key) == 0;
        self.subs.entry(key).or_default().push(downstream);
        was_zero
    }

    /// Returns true when this remove is the 1 -> 0 transition.
    fn remove(&mut self, key: &ChannelKey, id: SubscriberId) -> bool {
        if let Some(list) = self.subs.get_mut(key) {
            list.retain(|d| d.id != id);
            if list.is_empty() {
                self.subs.remove(key);
            }
        }
        self.refcount(key) == 0
    }

    fn pin(&mut self, key: ChannelKey) -> bool {
        let was_zero = self.refcount(&key) == 0;
        *self.pins.entry(key).or_insert(0) += 1;
        was_zero
    }

    fn unpin(&mut self, key: &ChannelKey) -> bool {
        if let Some(count) = self.pins.get_mut(key) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.pins.remove(key);
            }
        }
        self.refcount(key) == 0
    }

    /// Every key with at least one reference (for resubscribe-on-reconnect).
    fn active_keys(&self) -> Vec<ChannelKey> {
        let mut keys: Vec<ChannelKey> = self.subs.keys().cloned().collect();
        for key in self.pins.keys() {
            if !self.subs.contains_key(key) {
                keys.push(key.clone());
            }
        }
        keys
    }

    /// Fan one channel's frames out to its subscribers, re-decorated per
    /// subscriber. Slow or closed subscribers are removed; returns the keys
    /// whose refcount dropped to zero as a result.
    fn fan_out(&mut self, key: &ChannelKey, frames: &[MarketFrame]) -> Vec<ChannelKey> {
        let mut dead: Vec<SubscriberId> = Vec::new();

        if let Some(list) = self.subs.get(key) {
            for downstream in list {
                for frame in frames {
                    let delivery = if downstream.decorated == frame.symbol() {
                        frame.clone()
                    } else {
                        frame.with_symbol(&downstream.decorated)
                    };
                    match downstream.tx.try_send(delivery) {
                        Ok(()) => {}
                        Err(mpsc::error::TrySendError::Full(_)) => {
                            warn!(
                                channel = %key,
                                subscriber = downstream.id.0,
                                "subscriber queue full — dropping subscriber"
                            );
                            dead.push(downstream.id);
                            break;
                        }
                        Err(mpsc::error::TrySendError::Closed(_)) => {
                            dead.push(downstream.id);
                            break;
                        }
                    }
                }
            }
        }

        let mut released = Vec::new();
        for id in dead {
            if self.remove(key, id) {
                released.push(key.clone());
            }
        }
        released
    }
}

// ---------------------------------------------------------------------------
// Wire helpers
// ---------------------------------------------------------------------------

fn subscription_body(key: &ChannelKey) -> serde_json::Value {
    match &key.interval {
        Some(interval) => json!({
            "type": key.kind.as_wire(),
            "coin": key.coin,
            "interval": interval
        }),
        None => json!({
            "type": key.kind.as_wire(),
            "coin": key.coin
        }),
    }
}

fn subscribe_message(key: &ChannelKey) -> String {
    json!({ "method": "subscribe", "subscription": subscription_body(key) }).to_string()
}

fn unsubscribe_message(key: &ChannelKey) -> String {
    json!({ "method": "unsubscribe", "subscription": subscription_body(key) }).to_string()
}

fn ping_message() -> String {
    json!({ "method": "ping" }).to_string()
}

// ---------------------------------------------------------------------------
// Hub task
// ---------------------------------------------------------------------------

async fn run_hub(
    ws_url: String,
    mut cmd_rx: mpsc::UnboundedReceiver<HubCommand>,
    engine: Arc<IndicatorEngine>,
    connected: Arc<AtomicBool>,
) {
    let mut table = SubscriberTable::default();
    let mut backoff = BACKOFF_INITIAL;

    loop {
        match connect_async(&ws_url).await {
            Ok((stream, _)) => {
                info!(url = %ws_url, "market-data upstream connected");
                connected.store(true, Ordering::Relaxed);
                backoff = BACKOFF_INITIAL;

                let (mut write, mut read) = stream.split();

                // Replay one subscribe per active key.
                for key in table.active_keys() {
                    debug!(channel = %key, "re-subscribing upstream");
                    if write
                        .send(Message::Text(subscribe_message(&key)))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }

                let mut ping = tokio::time::interval(PING_INTERVAL);
                ping.tick().await; // the first tick is immediate

                loop {
                    tokio::select! {
                        msg = read.next() => {
                            match msg {
                                Some(Ok(Message::Text(text))) => {
                                    if let Some((key, frames)) = parse_upstream_message(&text) {
                                        for frame in &frames {
                                            if let MarketFrame::Candle(candle) = frame {
                                                engine.on_candle(candle);
                                            }
                                        }
                                        for key in table.fan_out(&key, &frames) {
                                            let _ = write
                                                .send(Message::Text(unsubscribe_message(&key)))
                                                .await;
                                        }
                                    }
                                }
                                Some(Ok(Message::Ping(data))) => {
                                    let _ = write.send(Message::Pong(data)).await;
                                }
                                Some(Ok(Message::Close(_))) | None => {
                                    warn!("market-data upstream closed");
                                    break;
                                }
                                Some(Ok(_)) => {}
                                Some(Err(e)) => {
                                    error!(error = %e, "market-data upstream read error");
                                    break;
                                }
                            }
                        }

                        cmd = cmd_rx.recv() => {
                            match cmd {
                                Some(cmd) => {
                                    if let Some(outbound) = apply_command(&mut table, cmd) {
                                        if write.send(Message::Text(outbound)).await.is_err() {
                                            break;
                                        }
                                    }
                                }
                                None => {
                                    info!("hub command channel closed — shutting down hub");
                                    connected.store(false, Ordering::Relaxed);
                                    return;
                                }
                            }
                        }

                        _ = ping.tick() => {
                            if write.send(Message::Text(ping_message())).await.is_err() {
                                break;
                            }
                        }
                    }
                }

                connected.store(false, Ordering::Relaxed);
            }
            Err(e) => {
                error!(error = %e, url = %ws_url, "market-data upstream connect failed");
            }
        }

        // Keep subscription state current while disconnected.
        let deadline = tokio::time::sleep(backoff);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = &mut deadline => break,
                cmd = cmd_rx.recv() => {
                    match cmd {
                        // No upstream to talk to; bookkeeping only.
                        Some(cmd) => { apply_command(&mut table, cmd); }
                        None => return,
                    }
                }
            }
        }
        backoff = (backoff * 2).min(BACKOFF_MAX);
    }
}

/// Apply one command to the table; returns the upstream message to send, if
/// this command crossed a refcount boundary.
fn apply_command(table: &mut SubscriberTable, cmd: HubCommand) -> Option<String> {
    match cmd {
        HubCommand::Subscribe {
            key,
            decorated,
            id,
            tx,
        } => {
            let first = table.add(key.clone(), Downstream { id, decorated, tx });
            first.then(|| subscribe_message(&key))
        }
        HubCommand::Unsubscribe { key, id } => {
            let last = table.remove(&key, id);
            last.then(|| unsubscribe_message(&key))
        }
        HubCommand::Pin { key } => {
            let first = table.pin(key.clone());
            first.then(|| subscribe_message(&key))
        }
        HubCommand::Unpin { key } => {
            let last = table.unpin(&key);
            last.then(|| unsubscribe_message(&key))
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::market_data::frames::TradeFrame;
    use crate::types::TradeSide;

    fn downstream(id: u64, decorated: &str) -> (Downstream, mpsc::Receiver<MarketFrame>) {
        let (tx, rx) = mpsc::channel(4);
        (
            Downstream {
                id: SubscriberId(id),
                decorated: decorated.to_string(),
                tx,
            },
            rx,
        )
    }

    fn trade(symbol: &str, tid: u64) -> MarketFrame {
        MarketFrame::Trade(TradeFrame {
            symbol: symbol.into(),
            side: TradeSide::Buy,
            px: 100.0,
            sz: 1.0,
            time_ms: tid as i64,
            tid,
        })
    }

    #[test]
    fn refcount_transitions() {
        let mut table = SubscriberTable::default();
        let key = ChannelKey::book("BTC");

        let (d1, _rx1) = downstream(1, "BTC");
        let (d2, _rx2) = downstream(2, "BTC-PERP");

        assert!(table.add(key.clone(), d1)); // 0 -> 1: subscribe upstream
        assert!(!table.add(key.clone(), d2)); // 1 -> 2: no upstream traffic

        assert!(!table.remove(&key, SubscriberId(1))); // 2 -> 1
        assert!(table.remove(&key, SubscriberId(2))); // 1 -> 0: unsubscribe
    }

    #[test]
    fn pins_count_as_references() {
        let mut table = SubscriberTable::default();
        let key = ChannelKey::candle("BTC", "1m");

        assert!(table.pin(key.clone()));
        assert!(!table.pin(key.clone()));

        let (d, _rx) = downstream(1, "BTC");
        assert!(!table.add(key.clone(), d));

        assert!(!table.unpin(&key));
        assert!(!table.unpin(&key)); // subscriber still holds a reference
        assert!(table.remove(&key, SubscriberId(1)));
    }

    #[test]
    fn active_keys_covers_subs_and_pins() {
        let mut table = SubscriberTable::default();
        let (d, _rx) = downstream(1, "BTC");
        table.add(ChannelKey::book("BTC"), d);
        table.pin(ChannelKey::candle("ETH", "1h"));

        let mut keys = table.active_keys();
        keys.sort_by_key(|k| k.to_string());
        assert_eq!(keys.len(), 2);
        assert_eq!(keys[0], ChannelKey::candle("ETH", "1h"));
        assert_eq!(keys[1], ChannelKey::book("BTC"));
    }

    #[test]
    fn fan_out_redecorates_per_subscriber() {
        let mut table = SubscriberTable::default();
        let key = ChannelKey::trades("BTC");
        let (d1, mut rx1) = downstream(1, "BTC");
        let (d2, mut rx2) = downstream(2, "BTC-PERP");
        table.add(key.clone(), d1);
        table.add(key.clone(), d2);

        let released = table.fan_out(&key, &[trade("BTC", 1)]);
        assert!(released.is_empty());

        assert_eq!(rx1.try_recv().unwrap().symbol(), "BTC");
        assert_eq!(rx2.try_recv().unwrap().symbol(), "BTC-PERP");
    }

    #[test]
    fn fan_out_preserves_order_per_subscriber() {
        let mut table = SubscriberTable::default();
        let key = ChannelKey::trades("BTC");
        let (d, mut rx) = downstream(1, "BTC");
        table.add(key.clone(), d);

        let frames: Vec<MarketFrame> = (0..4).map(|i| trade("BTC", i)).collect();
        table.fan_out(&key, &frames);

        for expected in 0..4u64 {
            match rx.try_recv().unwrap() {
                MarketFrame::Trade(t) => assert_eq!(t.tid, expected),
                other => panic!("unexpected frame {other:?}"),
            }
        }
    }

    #[test]
    fn slow_subscriber_is_dropped_without_blocking_others() {
        let mut table = SubscriberTable::default();
        let key = ChannelKey::trades("BTC");

        // Queue capacity 1: the second frame overflows.
        let (slow_tx, _slow_rx) = mpsc::channel(1);
        table.add(
            key.clone(),
            Downstream {
                id: SubscriberId(1),
                decorated: "BTC".into(),
                tx: slow_tx,
            },
        );
        let (healthy, mut healthy_rx) = downstream(2, "BTC");
        table.add(key.clone(), healthy);

        let frames: Vec<MarketFrame> = (0..3).map(|i| trade("BTC", i)).collect();
        let released = table.fan_out(&key, &frames);
        assert!(released.is_empty()); // healthy subscriber still holds a ref

        // Slow subscriber gone; healthy one received everything in order.
        assert_eq!(table.refcount(&key), 1);
        for expected in 0..3u64 {
            match healthy_rx.try_recv().unwrap() {
                MarketFrame::Trade(t) => assert_eq!(t.tid, expected),
                other => panic!("unexpected frame {other:?}"),
            }
        }
    }

    #[test]
    fn dropping_last_subscriber_releases_key() {
        let mut table = SubscriberTable::default();
        let key = ChannelKey::trades("BTC");
        let (slow_tx, _slow_rx) = mpsc::channel(1);
        table.add(
            key.clone(),
            Downstream {
                id: SubscriberId(1),
                decorated: "BTC".into(),
                tx: slow_tx,
            },
        );

        let frames: Vec<MarketFrame> = (0..3).map(|i| trade("BTC", i)).collect();
        let released = table.fan_out(&key, &frames);
        assert_eq!(released, vec![key.clone()]);
        assert_eq!(table.refcount(&key), 0);
    }

    #[test]
    fn wire_messages_match_venue_shape() {
        let msg = subscribe_message(&ChannelKey::candle("BTC", "1h"));
        let parsed: serde_json::Value = serde_json::from_str(&msg).unwrap();
        assert_eq!(parsed["method"], "subscribe");
        assert_eq!(parsed["subscription"]["type"], "candle");
        assert_eq!(parsed["subscription"]["coin"], "BTC");
        assert_eq!(parsed["subscription"]["interval"], "1h");

        let msg = unsubscribe_message(&ChannelKey::book("ETH"));
        let parsed: serde_json::Value = serde_json::from_str(&msg).unwrap();
        assert_eq!(parsed["method"], "unsubscribe");
        assert_eq!(parsed["subscription"]["type"], "l2Book");
        assert!(parsed["subscription"].get("interval").is_none());

        let ping: serde_json::Value = serde_json::from_str(&ping_message()).unwrap();
        assert_eq!(ping["method"], "ping");
    }

    #[test]
    fn apply_command_emits_upstream_traffic_at_boundaries() {
        let mut table = SubscriberTable::default();
        let key = ChannelKey::book("BTC");

        let (tx, _rx) = mpsc::channel(4);
        let first = apply_command(
            &mut table,
            HubCommand::Subscribe {
                key: key.clone(),
                decorated: "BTC-USD".into(),
                id: SubscriberId(1),
                tx,
            },
        );
        assert!(first.unwrap().contains("subscribe"));

        let (tx2, _rx2) = mpsc::channel(4);
        let second = apply_command(
            &mut table,
            HubCommand::Subscribe {
                key: key.clone(),
                decorated: "BTC".into(),
                id: SubscriberId(2),
                tx: tx2,
            },
        );
        assert!(second.is_none());

        assert!(apply_command(
            &mut table,
            HubCommand::Unsubscribe {
                key: key.clone(),
                id: SubscriberId(1)
            }
        )
        .is_none());
        let last = apply_command(
            &mut table,
            HubCommand::Unsubscribe {
                key,
                id: SubscriberId(2),
            },
        );
        assert!(last.unwrap().contains("unsubscribe"));
    }
}
