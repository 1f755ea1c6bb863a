use chrono::Utc;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::order::Venue;

/// Immutable execution record. Price is always the resting order's price.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub id: Uuid,
    pub symbol: String,
    pub price: Decimal,
    pub quantity: Decimal,
    pub buy_order_id: Uuid,
    pub sell_order_id: Uuid,
    pub buy_account_id: String,
    pub sell_account_id: String,
    /// Venue of the resting order that supplied the liquidity
    pub venue: Venue,
    pub timestamp: i64,
}

impl Trade {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        symbol: &str,
        price: Decimal,
        quantity: Decimal,
        buy_order_id: Uuid,
        sell_order_id: Uuid,
        buy_account_id: &str,
        sell_account_id: &str,
        venue: Venue,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            symbol: symbol.to_string(),
            price,
            quantity,
            buy_order_id,
            sell_order_id,
            buy_account_id: buy_account_id.to_string(),
            sell_account_id: sell_account_id.to_string(),
            venue,
            timestamp: Utc::now().timestamp_millis(),
        }
    }

    pub fn notional(&self) -> Decimal {
        self.price * self.quantity
    }
}
