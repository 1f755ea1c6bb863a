//! Matching engine types and DTOs

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{Order, OrderSide, OrderStatus, Trade, Venue};

// ============================================================================
// Price Key
// ============================================================================

/// Price scaled to a fixed 8-decimal integer for exact ordering in the
/// store's sorted sets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PriceKey(i64);

const PRICE_SCALE: i64 = 100_000_000;

impl PriceKey {
    pub fn from_decimal(price: Decimal) -> Self {
        let scaled = price * Decimal::from(PRICE_SCALE);
        let truncated = scaled.trunc();
        let value = truncated.mantissa() / 10i128.pow(truncated.scale());
        PriceKey(value as i64)
    }

    pub fn to_decimal(&self) -> Decimal {
        Decimal::from(self.0) / Decimal::from(PRICE_SCALE)
    }

    /// Sorted-set score: negated for bids so a single forward range scan
    /// returns best-first on both sides.
    pub fn score(side: OrderSide, price: Decimal) -> i64 {
        let key = Self::from_decimal(price).0;
        match side {
            OrderSide::Buy => -key,
            OrderSide::Sell => key,
        }
    }
}

// ============================================================================
// Depth
// ============================================================================

/// One aggregated price level of a depth query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DepthLevel {
    pub price: Decimal,
    pub quantity: Decimal,
    pub order_count: usize,
}

/// Aggregated view of one side pair of a book.
#[derive(Debug, Clone, Serialize)]
pub struct BookSnapshot {
    pub symbol: String,
    pub venue: Venue,
    pub bids: Vec<DepthLevel>,
    pub asks: Vec<DepthLevel>,
    pub timestamp: i64,
}

// ============================================================================
// Match Result
// ============================================================================

/// Outcome of submitting, amending, or ticking an order through the engine.
#[derive(Debug, Clone, Serialize)]
pub struct MatchResult {
    pub order_id: Uuid,
    pub status: OrderStatus,
    pub filled_quantity: Decimal,
    pub remaining_quantity: Decimal,
    pub average_price: Option<Decimal>,
    pub trades: Vec<Trade>,
}

impl MatchResult {
    pub fn for_order(order: &Order, trades: Vec<Trade>) -> Self {
        let filled: Decimal = trades.iter().map(|t| t.quantity).sum();
        let notional: Decimal = trades.iter().map(|t| t.notional()).sum();
        let average_price = if filled.is_zero() {
            None
        } else {
            Some(notional / filled)
        };
        Self {
            order_id: order.id,
            status: order.status,
            filled_quantity: filled,
            remaining_quantity: order.remaining_quantity,
            average_price,
            trades,
        }
    }
}

// ============================================================================
// Fees
// ============================================================================

/// Maker/taker fee schedule; zero by default.
#[derive(Debug, Clone)]
pub struct FeeConfig {
    pub maker_rate: Decimal,
    pub taker_rate: Decimal,
}

impl Default for FeeConfig {
    fn default() -> Self {
        Self {
            maker_rate: Decimal::ZERO,
            taker_rate: Decimal::ZERO,
        }
    }
}

impl FeeConfig {
    pub fn fee_for(&self, notional: Decimal, is_taker: bool) -> Decimal {
        let rate = if is_taker { self.taker_rate } else { self.maker_rate };
        notional * rate
    }
}
