//! Order Matching Module
//!
//! Dual-venue continuous double auction with price-time priority.
//!
//! ```text
//! API / WebSocket
//!   ↓
//! MatchingEngine (per-symbol writer lock)
//!   ├→ OrderBook (lit + dark sorted sets over the store)
//!   ├→ AccountLedger (reserve / apply_fill / release)
//!   └→ EventBus (trades, book deltas, notifications)
//! ```
//!
//! Matching prefers the dark pool on every crossing step and falls back to
//! the lit book only when no dark liquidity crosses. The trade prints at
//! the resting order's price.

mod book;
mod engine;
mod types;

#[cfg(test)]
mod tests;

pub use book::OrderBook;
pub use engine::{EngineStats, MatchingEngine, NewOrder};
pub use types::*;
