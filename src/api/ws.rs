// =============================================================================
// WebSocket bridge — engine state push + market-data fan-out
// =============================================================================
//
// /api/v1/ws (authenticated): an immediate full snapshot on connect, then a
// fresh snapshot whenever the state version changes (checked every 500 ms).
//
// /market-data: a downstream subscriber of the market-data hub. Client frames
// {"action": "subscribe"|"unsubscribe", "type": "trades"|"l2Book"|"candle",
// "coin", "interval"?}; server frames {"type": ..., "data": ...}. A client
// too slow to drain its frames is dropped by the hub like any other
// subscriber.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::time::{interval, Duration};
use tracing::{debug, info, warn};

use crate::api::auth::query_token_valid;
use crate::app_state::AppState;
use crate::market_data::{ChannelKind, MarketFrame};

// =============================================================================
// Engine state feed
// =============================================================================

#[derive(Deserialize)]
pub struct WsQuery {
    token: Option<String>,
}

pub async fn state_feed_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(query): Query<WsQuery>,
) -> impl IntoResponse {
    let token = query.token.unwrap_or_default();
    if !query_token_valid(&token) {
        warn!("state feed connection rejected: invalid token");
        return (
            axum::http::StatusCode::FORBIDDEN,
            "Invalid or missing token",
        )
            .into_response();
    }

    ws.on_upgrade(move |socket| handle_state_feed(socket, state))
        .into_response()
}

async fn handle_state_feed(socket: WebSocket, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();

    if send_snapshot(&mut sender, &state).await.is_err() {
        return;
    }
    let mut last_sent_version = state.telemetry.current_version();

    let mut push_interval = interval(Duration::from_millis(500));

    loop {
        tokio::select! {
            _ = push_interval.tick() => {
                let current = state.telemetry.current_version();
                if current != last_sent_version {
                    if send_snapshot(&mut sender, &state).await.is_err() {
                        break;
                    }
                    last_sent_version = current;
                }
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(error = %e, "state feed receive error");
                        break;
                    }
                }
            }
        }
    }

    info!("state feed connection closed");
}

async fn send_snapshot<S>(sender: &mut S, state: &Arc<AppState>) -> Result<(), axum::Error>
where
    S: futures_util::Sink<Message, Error = axum::Error> + Unpin,
{
    state
        .telemetry
        .ws_sequence_number
        .fetch_add(1, std::sync::atomic::Ordering::Relaxed);

    let snapshot = state.build_snapshot();
    match serde_json::to_string(&snapshot) {
        Ok(json) => sender.send(Message::Text(json)).await,
        Err(e) => {
            warn!(error = %e, "failed to serialise snapshot");
            Ok(())
        }
    }
}

// =============================================================================
// Market-data feed
// =============================================================================

#[derive(Debug, Deserialize)]
struct ClientFrame {
    action: String,
    #[serde(rename = "type")]
    kind: String,
    coin: String,
    #[serde(default)]
    interval: Option<String>,
}

pub async fn market_data_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_market_data(socket, state))
}

async fn handle_market_data(socket: WebSocket, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();

    // All hub subscriptions forward into one outbound queue; the forwarding
    // task for a subscription owns it, so aborting the task releases the
    // hub reference.
    let (out_tx, mut out_rx) = mpsc::channel::<MarketFrame>(256);
    let mut forwards: HashMap<String, tokio::task::JoinHandle<()>> = HashMap::new();

    loop {
        tokio::select! {
            frame = out_rx.recv() => {
                let Some(frame) = frame else { break };
                let Ok(json) = serde_json::to_string(&frame) else { continue };
                if sender.send(Message::Text(json)).await.is_err() {
                    break;
                }
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let Ok(client) = serde_json::from_str::<ClientFrame>(&text) else {
                            debug!(msg = %text, "unparseable market-data client frame");
                            continue;
                        };
                        let Some(kind) = ChannelKind::parse(&client.kind) else {
                            debug!(kind = %client.kind, "unknown market-data channel type");
                            continue;
                        };

                        let sub_key = format!(
                            "{}:{}:{}",
                            client.kind,
                            client.coin,
                            client.interval.as_deref().unwrap_or("")
                        );

                        match client.action.as_str() {
                            "subscribe" => {
                                if forwards.contains_key(&sub_key) {
                                    continue;
                                }
                                let mut subscription = state.hub.subscribe(
                                    kind,
                                    &client.coin,
                                    client.interval.as_deref(),
                                );
                                let tx = out_tx.clone();
                                let handle = tokio::spawn(async move {
                                    while let Some(frame) = subscription.rx.recv().await {
                                        if tx.send(frame).await.is_err() {
                                            break;
                                        }
                                    }
                                });
                                forwards.insert(sub_key, handle);
                            }
                            "unsubscribe" => {
                                if let Some(handle) = forwards.remove(&sub_key) {
                                    handle.abort();
                                }
                            }
                            other => {
                                debug!(action = %other, "unknown market-data action");
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(error = %e, "market-data receive error");
                        break;
                    }
                }
            }
        }
    }

    // Disconnect releases every reference this client held.
    for (_, handle) in forwards {
        handle.abort();
    }
    info!("market-data bridge connection closed");
}
