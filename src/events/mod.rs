//! Event Bus
//!
//! Topic-based fanout for order-book snapshots, trade executions, and
//! notifications. Two broadcast lanes back every topic: a small ring for
//! snapshot-style traffic where a lagging subscriber just loses the oldest
//! frames, and a large ring for trades and notifications, sized so nothing
//! is dropped in practice. Publishers never block on a slow subscriber.
//!
//! Envelopes are also forwarded, serialized, onto the in-process store's
//! channel of the same name, so per-channel consumers (and the external
//! mirror) can attach at the store level.

use chrono::Utc;
use dashmap::DashMap;
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::models::{Order, Trade, Venue};
use crate::services::matching::DepthLevel;
use crate::store::MemoryStore;

/// Snapshot lane: drop-oldest under lag is acceptable.
const SNAPSHOT_LANE_CAPACITY: usize = 256;
/// Reliable lane: trades and order notifications must survive bursts.
const RELIABLE_LANE_CAPACITY: usize = 16384;

/// Payload of a published message. Serializes with a `type` tag per the
/// wire contract.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    Orderbook {
        symbol: String,
        venue: Venue,
        bids: Vec<DepthLevel>,
        asks: Vec<DepthLevel>,
    },
    Trade {
        #[serde(flatten)]
        trade: Trade,
    },
    TradeExecuted {
        account_id: String,
        order_id: Uuid,
        symbol: String,
        price: Decimal,
        quantity: Decimal,
        remaining_quantity: Decimal,
    },
    OrdersUpdated {
        account_id: String,
        order: Order,
    },
    Latency {
        server_time: i64,
    },
    Toast {
        level: String,
        message: String,
    },
    Error {
        code: String,
        message: String,
    },
}

impl Event {
    /// Snapshot-style events may be dropped under backpressure; everything
    /// else rides the reliable lane.
    fn is_snapshot(&self) -> bool {
        matches!(self, Event::Orderbook { .. } | Event::Latency { .. })
    }
}

/// Message envelope: `{type, timestamp, ...payload}` plus the channel it
/// was published on.
#[derive(Debug, Clone, Serialize)]
pub struct Envelope {
    pub channel: String,
    pub timestamp: i64,
    #[serde(flatten)]
    pub event: Event,
}

pub struct EventBus {
    store: Arc<MemoryStore>,
    snapshots: broadcast::Sender<Envelope>,
    reliable: broadcast::Sender<Envelope>,
    /// Live subscriber count per topic; drives the snapshot broadcaster.
    topic_subscribers: DashMap<String, usize>,
}

impl EventBus {
    pub fn new(store: Arc<MemoryStore>) -> Self {
        let (snapshots, _) = broadcast::channel(SNAPSHOT_LANE_CAPACITY);
        let (reliable, _) = broadcast::channel(RELIABLE_LANE_CAPACITY);
        Self {
            store,
            snapshots,
            reliable,
            topic_subscribers: DashMap::new(),
        }
    }

    /// Publish an event on a topic. Never blocks; a send with no receivers
    /// is not an error.
    pub fn publish(&self, topic: &str, event: Event) {
        let envelope = Envelope {
            channel: topic.to_string(),
            timestamp: Utc::now().timestamp_millis(),
            event,
        };

        if let Ok(json) = serde_json::to_string(&envelope) {
            self.store.publish(topic, &json);
        }

        let lane = if envelope.event.is_snapshot() {
            &self.snapshots
        } else {
            &self.reliable
        };
        let _ = lane.send(envelope);
    }

    pub fn subscribe_snapshots(&self) -> broadcast::Receiver<Envelope> {
        self.snapshots.subscribe()
    }

    pub fn subscribe_reliable(&self) -> broadcast::Receiver<Envelope> {
        self.reliable.subscribe()
    }

    /// Record a session's interest in a topic.
    pub fn register_topic(&self, topic: &str) {
        *self.topic_subscribers.entry(topic.to_string()).or_insert(0) += 1;
    }

    /// Drop a session's interest in a topic.
    pub fn unregister_topic(&self, topic: &str) {
        if let Some(mut count) = self.topic_subscribers.get_mut(topic) {
            *count = count.saturating_sub(1);
        }
    }

    pub fn has_subscribers(&self, topic: &str) -> bool {
        self.topic_subscribers.get(topic).map(|c| *c > 0).unwrap_or(false)
    }

    /// Symbols with at least one `orderbook:{symbol}` subscriber.
    pub fn watched_symbols(&self) -> Vec<String> {
        self.topic_subscribers
            .iter()
            .filter(|entry| *entry.value() > 0)
            .filter_map(|entry| entry.key().strip_prefix("orderbook:").map(str::to_string))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn bus() -> EventBus {
        EventBus::new(Arc::new(MemoryStore::new()))
    }

    #[tokio::test]
    async fn test_publish_reaches_both_bus_and_store_channel() {
        let bus = bus();
        let mut lane_rx = bus.subscribe_reliable();
        let mut store_rx = bus.store.subscribe("trades:AAPL");

        let trade = Trade::new(
            "AAPL",
            dec!(150),
            dec!(5),
            Uuid::new_v4(),
            Uuid::new_v4(),
            "buyer",
            "seller",
            Venue::Lit,
        );
        bus.publish("trades:AAPL", Event::Trade { trade });

        let envelope = lane_rx.recv().await.unwrap();
        assert_eq!(envelope.channel, "trades:AAPL");

        let raw = store_rx.recv().await.unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["type"], "trade");
        assert_eq!(value["symbol"], "AAPL");
        assert!(value["timestamp"].is_i64());
    }

    #[tokio::test]
    async fn test_lane_routing() {
        let bus = bus();
        let mut snap_rx = bus.subscribe_snapshots();
        let mut rel_rx = bus.subscribe_reliable();

        bus.publish(
            "orderbook:AAPL",
            Event::Orderbook {
                symbol: "AAPL".into(),
                venue: Venue::Lit,
                bids: vec![],
                asks: vec![],
            },
        );
        bus.publish(
            "notifications",
            Event::Toast {
                level: "info".into(),
                message: "hi".into(),
            },
        );

        assert_eq!(snap_rx.recv().await.unwrap().channel, "orderbook:AAPL");
        assert_eq!(rel_rx.recv().await.unwrap().channel, "notifications");
    }

    #[test]
    fn test_topic_registration_counts() {
        let bus = bus();
        assert!(!bus.has_subscribers("orderbook:AAPL"));

        bus.register_topic("orderbook:AAPL");
        bus.register_topic("orderbook:AAPL");
        bus.register_topic("trades:AAPL");
        assert!(bus.has_subscribers("orderbook:AAPL"));
        assert_eq!(bus.watched_symbols(), vec!["AAPL"]);

        bus.unregister_topic("orderbook:AAPL");
        assert!(bus.has_subscribers("orderbook:AAPL"));
        bus.unregister_topic("orderbook:AAPL");
        assert!(!bus.has_subscribers("orderbook:AAPL"));
        // Unregistering below zero saturates.
        bus.unregister_topic("orderbook:AAPL");
        assert!(!bus.has_subscribers("orderbook:AAPL"));
    }

    #[tokio::test]
    async fn test_snapshot_lane_drops_oldest_under_lag() {
        let bus = bus();
        let mut rx = bus.subscribe_snapshots();

        for _ in 0..SNAPSHOT_LANE_CAPACITY + 10 {
            bus.publish(
                "orderbook:AAPL",
                Event::Orderbook {
                    symbol: "AAPL".into(),
                    venue: Venue::Lit,
                    bids: vec![],
                    asks: vec![],
                },
            );
        }

        // The slow subscriber lost the oldest snapshots, not the newest.
        match rx.recv().await {
            Err(broadcast::error::RecvError::Lagged(n)) => assert!(n >= 10),
            other => panic!("expected lag, got {:?}", other.map(|e| e.channel)),
        }
    }
}
