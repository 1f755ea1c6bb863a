use chrono::Utc;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::OesError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn opposite(&self) -> OrderSide {
        match self {
            OrderSide::Buy => OrderSide::Sell,
            OrderSide::Sell => OrderSide::Buy,
        }
    }
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "buy"),
            OrderSide::Sell => write!(f, "sell"),
        }
    }
}

impl FromStr for OrderSide {
    type Err = OesError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "buy" => Ok(OrderSide::Buy),
            "sell" => Ok(OrderSide::Sell),
            other => Err(OesError::Validation(format!("invalid side: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderType {
    Limit,
    Market,
}

impl fmt::Display for OrderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderType::Limit => write!(f, "limit"),
            OrderType::Market => write!(f, "market"),
        }
    }
}

impl FromStr for OrderType {
    type Err = OesError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "limit" => Ok(OrderType::Limit),
            "market" => Ok(OrderType::Market),
            other => Err(OesError::Validation(format!("invalid order type: {}", other))),
        }
    }
}

/// Time in force
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeInForce {
    /// Rests until the end-of-session sweep
    Day,
    /// Good till cancel
    Gtc,
    /// Immediate or cancel
    Ioc,
    /// Fill or kill
    Fok,
}

impl Default for TimeInForce {
    fn default() -> Self {
        TimeInForce::Gtc
    }
}

impl fmt::Display for TimeInForce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeInForce::Day => write!(f, "day"),
            TimeInForce::Gtc => write!(f, "gtc"),
            TimeInForce::Ioc => write!(f, "ioc"),
            TimeInForce::Fok => write!(f, "fok"),
        }
    }
}

impl FromStr for TimeInForce {
    type Err = OesError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "day" => Ok(TimeInForce::Day),
            "gtc" => Ok(TimeInForce::Gtc),
            "ioc" => Ok(TimeInForce::Ioc),
            "fok" => Ok(TimeInForce::Fok),
            other => Err(OesError::Validation(format!("invalid time in force: {}", other))),
        }
    }
}

/// Execution venue. The dark pool matches with priority but is excluded
/// from public depth queries unless asked for explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Venue {
    Lit,
    Dark,
}

impl Default for Venue {
    fn default() -> Self {
        Venue::Lit
    }
}

impl fmt::Display for Venue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Venue::Lit => write!(f, "lit"),
            Venue::Dark => write!(f, "dark"),
        }
    }
}

impl FromStr for Venue {
    type Err = OesError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "lit" => Ok(Venue::Lit),
            "dark" => Ok(Venue::Dark),
            other => Err(OesError::Validation(format!("invalid venue: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    New,
    Open,
    PartiallyFilled,
    Filled,
    Cancelled,
    Rejected,
}

impl OrderStatus {
    /// Terminal states never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled | OrderStatus::Cancelled | OrderStatus::Rejected
        )
    }

    /// An order is in the book iff it is open or partially filled.
    pub fn is_resting(&self) -> bool {
        matches!(self, OrderStatus::Open | OrderStatus::PartiallyFilled)
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderStatus::New => write!(f, "new"),
            OrderStatus::Open => write!(f, "open"),
            OrderStatus::PartiallyFilled => write!(f, "partially_filled"),
            OrderStatus::Filled => write!(f, "filled"),
            OrderStatus::Cancelled => write!(f, "cancelled"),
            OrderStatus::Rejected => write!(f, "rejected"),
        }
    }
}

impl FromStr for OrderStatus {
    type Err = OesError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "new" => Ok(OrderStatus::New),
            "open" => Ok(OrderStatus::Open),
            "partially_filled" => Ok(OrderStatus::PartiallyFilled),
            "filled" => Ok(OrderStatus::Filled),
            "cancelled" => Ok(OrderStatus::Cancelled),
            "rejected" => Ok(OrderStatus::Rejected),
            other => Err(OesError::Validation(format!("invalid order status: {}", other))),
        }
    }
}

/// Full order record, stored as the `order:{id}` hash.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: Uuid,
    pub account_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    /// Absent for unprotected market orders; a cap otherwise.
    pub price: Option<Decimal>,
    pub original_quantity: Decimal,
    pub remaining_quantity: Decimal,
    pub venue: Venue,
    pub time_in_force: TimeInForce,
    pub status: OrderStatus,
    /// Book insertion sequence; re-assigned when time priority is forfeited.
    pub sequence: u64,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Order {
    pub fn new(
        account_id: &str,
        symbol: &str,
        side: OrderSide,
        order_type: OrderType,
        price: Option<Decimal>,
        quantity: Decimal,
        venue: Venue,
        time_in_force: TimeInForce,
    ) -> Self {
        let now = Utc::now().timestamp_millis();
        Self {
            id: Uuid::new_v4(),
            account_id: account_id.to_string(),
            symbol: symbol.to_uppercase(),
            side,
            order_type,
            price,
            original_quantity: quantity,
            remaining_quantity: quantity,
            venue,
            time_in_force,
            status: OrderStatus::New,
            sequence: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn executed_quantity(&self) -> Decimal {
        self.original_quantity - self.remaining_quantity
    }

    /// Flatten into the `order:{id}` hash field layout.
    pub fn to_fields(&self) -> Vec<(String, String)> {
        vec![
            ("id".into(), self.id.to_string()),
            ("account_id".into(), self.account_id.clone()),
            ("symbol".into(), self.symbol.clone()),
            ("side".into(), self.side.to_string()),
            ("order_type".into(), self.order_type.to_string()),
            (
                "price".into(),
                self.price.map(|p| p.to_string()).unwrap_or_default(),
            ),
            ("original_quantity".into(), self.original_quantity.to_string()),
            ("remaining_quantity".into(), self.remaining_quantity.to_string()),
            ("venue".into(), self.venue.to_string()),
            ("time_in_force".into(), self.time_in_force.to_string()),
            ("status".into(), self.status.to_string()),
            ("sequence".into(), self.sequence.to_string()),
            ("created_at".into(), self.created_at.to_string()),
            ("updated_at".into(), self.updated_at.to_string()),
        ]
    }

    /// Rebuild from a stored hash. Fails with `INTERNAL` on a mangled record.
    pub fn from_fields(fields: &HashMap<String, String>) -> Result<Self, OesError> {
        let get = |name: &str| -> Result<&String, OesError> {
            fields
                .get(name)
                .ok_or_else(|| OesError::Internal(format!("order record missing field {}", name)))
        };

        let price_raw = get("price")?;
        let price = if price_raw.is_empty() {
            None
        } else {
            Some(parse_decimal(price_raw, "price")?)
        };

        Ok(Self {
            id: Uuid::parse_str(get("id")?)
                .map_err(|e| OesError::Internal(format!("order record bad id: {}", e)))?,
            account_id: get("account_id")?.clone(),
            symbol: get("symbol")?.clone(),
            side: get("side")?.parse()?,
            order_type: get("order_type")?.parse()?,
            price,
            original_quantity: parse_decimal(get("original_quantity")?, "original_quantity")?,
            remaining_quantity: parse_decimal(get("remaining_quantity")?, "remaining_quantity")?,
            venue: get("venue")?.parse()?,
            time_in_force: get("time_in_force")?.parse()?,
            status: get("status")?.parse()?,
            sequence: parse_int(get("sequence")?, "sequence")?,
            created_at: parse_int(get("created_at")?, "created_at")?,
            updated_at: parse_int(get("updated_at")?, "updated_at")?,
        })
    }
}

/// Order as presented over HTTP.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderResponse {
    pub order_id: Uuid,
    pub account_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub price: Option<Decimal>,
    pub original_quantity: Decimal,
    pub filled_quantity: Decimal,
    pub remaining_quantity: Decimal,
    pub venue: Venue,
    pub time_in_force: TimeInForce,
    pub status: OrderStatus,
    pub created_at: i64,
    pub updated_at: i64,
}

impl From<Order> for OrderResponse {
    fn from(order: Order) -> Self {
        Self {
            order_id: order.id,
            account_id: order.account_id.clone(),
            symbol: order.symbol.clone(),
            side: order.side,
            order_type: order.order_type,
            price: order.price,
            original_quantity: order.original_quantity,
            filled_quantity: order.executed_quantity(),
            remaining_quantity: order.remaining_quantity,
            venue: order.venue,
            time_in_force: order.time_in_force,
            status: order.status,
            created_at: order.created_at,
            updated_at: order.updated_at,
        }
    }
}

fn parse_decimal(raw: &str, field: &str) -> Result<Decimal, OesError> {
    Decimal::from_str(raw)
        .map_err(|e| OesError::Internal(format!("order record bad {}: {}", field, e)))
}

fn parse_int<T: FromStr>(raw: &str, field: &str) -> Result<T, OesError>
where
    T::Err: fmt::Display,
{
    raw.parse::<T>()
        .map_err(|e| OesError::Internal(format!("order record bad {}: {}", field, e)))
}
