//! Key and channel naming
//!
//! One place for every key format so the persisted layout stays greppable.

use uuid::Uuid;

use crate::models::{OrderSide, Venue};

pub struct StoreKey;

impl StoreKey {
    pub const NOTIFICATIONS: &'static str = "notifications";
    pub const SYSTEM: &'static str = "system";

    /// `order:{id}` — full order record hash
    pub fn order(id: Uuid) -> String {
        format!("order:{}", id)
    }

    /// `book:{venue}:{symbol}:bids|asks` — price-ordered set of order ids
    pub fn book(venue: Venue, symbol: &str, side: OrderSide) -> String {
        let shelf = match side {
            OrderSide::Buy => "bids",
            OrderSide::Sell => "asks",
        };
        format!("book:{}:{}:{}", venue, symbol, shelf)
    }

    /// `account:{id}` — account record hash
    pub fn account(id: &str) -> String {
        format!("account:{}", id)
    }

    /// `positions:{account_id}` — per-symbol position hash
    pub fn positions(account_id: &str) -> String {
        format!("positions:{}", account_id)
    }

    /// `txn:{account_id}` — append-only transaction list
    pub fn transactions(account_id: &str) -> String {
        format!("txn:{}", account_id)
    }

    /// `orders:{account_id}` — order-id index list
    pub fn account_orders(account_id: &str) -> String {
        format!("orders:{}", account_id)
    }

    /// `orderbook:{symbol}` — snapshot/delta topic
    pub fn channel_orderbook(symbol: &str) -> String {
        format!("orderbook:{}", symbol)
    }

    /// `trades:{symbol}` — execution topic
    pub fn channel_trades(symbol: &str) -> String {
        format!("trades:{}", symbol)
    }
}
