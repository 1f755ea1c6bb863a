//! WebSocket Session Layer
//!
//! One task per client: a subscription set, the two bus receivers, and a
//! ping deadline. Subscribe and unsubscribe are idempotent; a session that
//! misses the pong deadline is closed and its subscriptions released.

use axum::extract::ws::{Message, WebSocket};
use chrono::Utc;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;

use crate::events::{Envelope, Event};
use crate::models::Venue;
use crate::AppState;

/// Close a session with no inbound traffic (including pongs) for this long.
const PONG_DEADLINE: Duration = Duration::from_secs(30);
const PING_INTERVAL: Duration = Duration::from_secs(5);
const SNAPSHOT_DEPTH: usize = 20;

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientMessage {
    Subscribe { channel: String },
    Unsubscribe { channel: String },
    Ping,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerMessage {
    Subscribed { channel: String },
    Unsubscribed { channel: String },
    Pong,
    Error { code: String, message: String },
}

/// Topic families a session may subscribe to.
fn is_known_topic(channel: &str) -> bool {
    channel == "notifications"
        || channel == "system"
        || channel
            .strip_prefix("orderbook:")
            .map(|s| !s.is_empty())
            .unwrap_or(false)
        || channel
            .strip_prefix("trades:")
            .map(|s| !s.is_empty())
            .unwrap_or(false)
}

/// Uppercase the symbol part so `orderbook:aapl` lands on the published
/// `orderbook:AAPL` channel.
fn canonical_topic(channel: &str) -> String {
    match channel.split_once(':') {
        Some((family, symbol)) => format!("{}:{}", family, symbol.to_uppercase()),
        None => channel.to_string(),
    }
}

pub async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();

    let mut subscriptions: HashSet<String> = HashSet::new();
    let mut snapshot_rx = state.bus.subscribe_snapshots();
    let mut reliable_rx = state.bus.subscribe_reliable();
    let mut last_seen = Instant::now();
    let mut ping_interval = tokio::time::interval(PING_INTERVAL);

    loop {
        tokio::select! {
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        last_seen = Instant::now();
                        if let Err(response) = handle_client_message(
                            &text,
                            &mut subscriptions,
                            &state,
                            &mut sender,
                        ).await {
                            let _ = send_json(&mut sender, &response).await;
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        last_seen = Instant::now();
                        let _ = sender.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Pong(_))) => {
                        last_seen = Instant::now();
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        break;
                    }
                    Some(Err(e)) => {
                        // Reset without a closing handshake is normal.
                        tracing::warn!("WebSocket disconnected: {}", e);
                        break;
                    }
                    _ => {}
                }
            }

            // Trades and notifications: must not be silently lost.
            envelope = reliable_rx.recv() => {
                match envelope {
                    Ok(envelope) => {
                        if subscriptions.contains(&envelope.channel) {
                            let _ = send_json(&mut sender, &envelope).await;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!("Session lagged {} reliable events", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }

            // Snapshots: drop-oldest under lag by design.
            envelope = snapshot_rx.recv() => {
                match envelope {
                    Ok(envelope) => {
                        if subscriptions.contains(&envelope.channel) {
                            let _ = send_json(&mut sender, &envelope).await;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::debug!("Session dropped {} stale snapshots", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }

            _ = ping_interval.tick() => {
                if last_seen.elapsed() > PONG_DEADLINE {
                    tracing::info!("Closing session: no pong within {:?}", PONG_DEADLINE);
                    break;
                }
                let _ = sender.send(Message::Ping(Vec::new())).await;
            }
        }
    }

    // Disconnect releases the subscriptions; reconnection is a fresh session.
    for topic in &subscriptions {
        state.bus.unregister_topic(topic);
    }
    tracing::info!(
        "WebSocket session closed ({} subscriptions released)",
        subscriptions.len()
    );
}

async fn handle_client_message(
    text: &str,
    subscriptions: &mut HashSet<String>,
    state: &Arc<AppState>,
    sender: &mut SplitSink<WebSocket, Message>,
) -> Result<(), ServerMessage> {
    let client_msg: ClientMessage = serde_json::from_str(text).map_err(|e| ServerMessage::Error {
        code: "VALIDATION".to_string(),
        message: format!("failed to parse message: {}", e),
    })?;

    match client_msg {
        ClientMessage::Subscribe { channel } => {
            if !is_known_topic(&channel) {
                return Err(ServerMessage::Error {
                    code: "VALIDATION".to_string(),
                    message: format!("unknown channel: {}", channel),
                });
            }
            let channel = canonical_topic(&channel);

            // Second subscribe to the same topic is a no-op.
            if subscriptions.insert(channel.clone()) {
                state.bus.register_topic(&channel);
            }
            tracing::debug!(
                "Session subscribed to '{}' ({} total)",
                channel,
                subscriptions.len()
            );
            let _ = send_json(sender, &ServerMessage::Subscribed { channel: channel.clone() }).await;

            // Seed new orderbook subscribers with a full snapshot.
            if let Some(symbol) = channel.strip_prefix("orderbook:") {
                let snapshot = state.engine.book_snapshot(symbol, Venue::Lit, SNAPSHOT_DEPTH);
                let envelope = Envelope {
                    channel: channel.clone(),
                    timestamp: Utc::now().timestamp_millis(),
                    event: Event::Orderbook {
                        symbol: snapshot.symbol,
                        venue: snapshot.venue,
                        bids: snapshot.bids,
                        asks: snapshot.asks,
                    },
                };
                let _ = send_json(sender, &envelope).await;
            }
        }

        ClientMessage::Unsubscribe { channel } => {
            let channel = canonical_topic(&channel);
            if subscriptions.remove(&channel) {
                state.bus.unregister_topic(&channel);
            }
            let _ = send_json(sender, &ServerMessage::Unsubscribed { channel }).await;
        }

        ClientMessage::Ping => {
            let _ = send_json(sender, &ServerMessage::Pong).await;
        }
    }

    Ok(())
}

async fn send_json<T: Serialize>(
    sender: &mut SplitSink<WebSocket, Message>,
    value: &T,
) -> Result<(), axum::Error> {
    match serde_json::to_string(value) {
        Ok(json) => sender.send(Message::Text(json)).await,
        Err(e) => {
            tracing::error!("Failed to serialize outbound message: {}", e);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonical_topic() {
        assert_eq!(canonical_topic("orderbook:aapl"), "orderbook:AAPL");
        assert_eq!(canonical_topic("trades:AAPL"), "trades:AAPL");
        assert_eq!(canonical_topic("notifications"), "notifications");
    }

    #[test]
    fn test_known_topics() {
        assert!(is_known_topic("orderbook:AAPL"));
        assert!(is_known_topic("trades:AAPL"));
        assert!(is_known_topic("notifications"));
        assert!(is_known_topic("system"));
        assert!(!is_known_topic("orderbook:"));
        assert!(!is_known_topic("kline:AAPL"));
        assert!(!is_known_topic(""));
    }

    #[test]
    fn test_client_message_wire_shapes() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"subscribe","channel":"trades:AAPL"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::Subscribe { channel } if channel == "trades:AAPL"));

        let msg: ClientMessage = serde_json::from_str(r#"{"type":"ping"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::Ping));

        assert!(serde_json::from_str::<ClientMessage>(r#"{"type":"auth"}"#).is_err());
    }

    #[test]
    fn test_server_message_wire_shapes() {
        let json = serde_json::to_value(ServerMessage::Subscribed {
            channel: "orderbook:AAPL".into(),
        })
        .unwrap();
        assert_eq!(json["type"], "subscribed");
        assert_eq!(json["channel"], "orderbook:AAPL");

        let json = serde_json::to_value(ServerMessage::Pong).unwrap();
        assert_eq!(json["type"], "pong");
    }
}
