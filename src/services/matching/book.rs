//! Order Book
//!
//! Price-time ordered resting orders over the store: one sorted set per
//! (venue, symbol, side) holding order ids scored by price, and one
//! `order:{id}` hash per record. An order id is in a sorted set iff its
//! hash status is open or partially_filled; the per-symbol writer lock in
//! the engine keeps the pair consistent, and `consume` is a single
//! check-then-mutate step so a racing reader can only lose with `STALE`.

use chrono::Utc;
use rust_decimal::Decimal;
use std::collections::BTreeSet;
use std::sync::Arc;
use uuid::Uuid;

use super::types::{DepthLevel, PriceKey};
use crate::error::OesError;
use crate::models::{Order, OrderSide, OrderStatus, Venue};
use crate::store::{MemoryStore, StoreKey};

pub struct OrderBook {
    store: Arc<MemoryStore>,
}

impl OrderBook {
    pub fn new(store: Arc<MemoryStore>) -> Self {
        Self { store }
    }

    pub fn load_order(&self, order_id: Uuid) -> Result<Order, OesError> {
        let fields = self
            .store
            .hgetall(&StoreKey::order(order_id))
            .ok_or(OesError::UnknownOrder(order_id))?;
        Order::from_fields(&fields)
    }

    pub fn save_order(&self, order: &Order) {
        self.store
            .hset_all(&StoreKey::order(order.id), &order.to_fields());
    }

    /// Append a resting order to its venue's sorted set and persist the
    /// record. The caller sets a resting status first.
    pub fn insert(&self, order: &mut Order) -> Result<(), OesError> {
        if order.remaining_quantity <= Decimal::ZERO {
            return Err(OesError::Validation("order has no remaining quantity to rest".into()));
        }
        let price = order
            .price
            .ok_or_else(|| OesError::Validation("market orders never rest".into()))?;

        let key = StoreKey::book(order.venue, &order.symbol, order.side);
        let score = PriceKey::score(order.side, price);
        order.sequence = self.store.zadd(&key, score, &order.id.to_string());
        order.updated_at = Utc::now().timestamp_millis();
        self.save_order(order);
        Ok(())
    }

    /// Head order at the best price, or nothing. Entries whose record has
    /// gone non-resting are healed out of the set on the way past.
    pub fn peek_best(
        &self,
        symbol: &str,
        side: OrderSide,
        venue: Venue,
    ) -> Result<Option<Order>, OesError> {
        let key = StoreKey::book(venue, symbol, side);
        loop {
            let head = self.store.zrange(&key, 0, 0);
            let Some(member) = head.first() else {
                return Ok(None);
            };
            let order_id = Uuid::parse_str(member)
                .map_err(|e| OesError::Internal(format!("bad member in {}: {}", key, e)))?;

            match self.store.hgetall(&StoreKey::order(order_id)) {
                Some(fields) => {
                    let order = Order::from_fields(&fields)?;
                    if order.status.is_resting() && order.remaining_quantity > Decimal::ZERO {
                        return Ok(Some(order));
                    }
                    self.store.zrem(&key, member);
                }
                None => {
                    self.store.zrem(&key, member);
                }
            }
        }
    }

    /// Atomically decrement an order's remaining quantity. Fails with
    /// `STALE` when the record no longer covers `quantity`; removes the
    /// order from its sorted set when it fills out.
    pub fn consume(&self, order_id: Uuid, quantity: Decimal) -> Result<Order, OesError> {
        let now = Utc::now().timestamp_millis();
        let order = self
            .store
            .hupdate(&StoreKey::order(order_id), |fields| -> Result<Order, OesError> {
                let mut order = Order::from_fields(fields)?;
                if !order.status.is_resting() || order.remaining_quantity < quantity {
                    return Err(OesError::Stale);
                }
                order.remaining_quantity -= quantity;
                order.status = if order.remaining_quantity.is_zero() {
                    OrderStatus::Filled
                } else {
                    OrderStatus::PartiallyFilled
                };
                order.updated_at = now;
                fields.clear();
                fields.extend(order.to_fields());
                Ok(order)
            })
            .ok_or(OesError::UnknownOrder(order_id))??;

        if order.remaining_quantity.is_zero() {
            let key = StoreKey::book(order.venue, &order.symbol, order.side);
            self.store.zrem(&key, &order.id.to_string());
        }
        Ok(order)
    }

    /// Roll a consume back to a prior snapshot, restoring the original
    /// time priority.
    pub fn restore(&self, prior: &Order) -> Result<(), OesError> {
        self.save_order(prior);
        if prior.status.is_resting() {
            let price = prior
                .price
                .ok_or_else(|| OesError::Internal("resting order without price".into()))?;
            let key = StoreKey::book(prior.venue, &prior.symbol, prior.side);
            let score = PriceKey::score(prior.side, price);
            self.store
                .zadd_at(&key, score, prior.sequence, &prior.id.to_string());
        }
        Ok(())
    }

    /// Amend price and/or quantity. A quantity-only decrease keeps time
    /// priority; any price change or quantity increase re-inserts with a
    /// fresh sequence. Returns the updated order and whether priority was
    /// forfeited.
    pub fn amend(
        &self,
        order_id: Uuid,
        new_price: Option<Decimal>,
        new_quantity: Option<Decimal>,
    ) -> Result<(Order, bool), OesError> {
        let mut order = self.load_order(order_id)?;
        if order.status.is_terminal() {
            return Err(OesError::AlreadyTerminal(order_id));
        }

        let executed = order.executed_quantity();
        let target_quantity = new_quantity.unwrap_or(order.original_quantity);
        if target_quantity <= executed {
            return Err(OesError::InvalidAmend(format!(
                "quantity {} does not exceed already-executed {}",
                target_quantity, executed
            )));
        }
        if let Some(price) = new_price {
            if price <= Decimal::ZERO {
                return Err(OesError::InvalidAmend(format!("price {} must be positive", price)));
            }
        }

        // An explicit price equal to the current one is a no-op change.
        let price_changed = match (new_price, order.price) {
            (Some(new), Some(old)) => new != old,
            (Some(_), None) => true,
            (None, _) => false,
        };
        let quantity_increased = target_quantity > order.original_quantity;
        let lost_priority = price_changed || quantity_increased;

        order.original_quantity = target_quantity;
        order.remaining_quantity = target_quantity - executed;
        if let Some(price) = new_price {
            order.price = Some(price);
        }
        order.updated_at = Utc::now().timestamp_millis();

        let key = StoreKey::book(order.venue, &order.symbol, order.side);
        if lost_priority {
            let price = order
                .price
                .ok_or_else(|| OesError::InvalidAmend("amended order needs a price".into()))?;
            self.store.zrem(&key, &order.id.to_string());
            order.sequence = self
                .store
                .zadd(&key, PriceKey::score(order.side, price), &order.id.to_string());
        }
        self.save_order(&order);
        Ok((order, lost_priority))
    }

    /// Remove from the book and mark cancelled. Returns the final record
    /// plus whether the order was already terminal (idempotent path).
    pub fn cancel(&self, order_id: Uuid) -> Result<(Order, bool), OesError> {
        let mut order = self.load_order(order_id)?;
        if order.status.is_terminal() {
            return Ok((order, true));
        }

        let key = StoreKey::book(order.venue, &order.symbol, order.side);
        self.store.zrem(&key, &order.id.to_string());
        order.status = OrderStatus::Cancelled;
        order.updated_at = Utc::now().timestamp_millis();
        self.save_order(&order);
        Ok((order, false))
    }

    /// All resting orders of one side, best price first.
    pub fn side_orders(&self, symbol: &str, side: OrderSide, venue: Venue) -> Vec<Order> {
        let key = StoreKey::book(venue, symbol, side);
        self.store
            .zrange(&key, 0, -1)
            .iter()
            .filter_map(|member| Uuid::parse_str(member).ok())
            .filter_map(|id| self.load_order(id).ok())
            .filter(|o| o.status.is_resting() && o.remaining_quantity > Decimal::ZERO)
            .collect()
    }

    /// Up to `levels` aggregated price levels per side.
    pub fn depth(
        &self,
        symbol: &str,
        venue: Venue,
        levels: usize,
    ) -> (Vec<DepthLevel>, Vec<DepthLevel>) {
        (
            self.side_depth(symbol, OrderSide::Buy, venue, levels),
            self.side_depth(symbol, OrderSide::Sell, venue, levels),
        )
    }

    fn side_depth(&self, symbol: &str, side: OrderSide, venue: Venue, levels: usize) -> Vec<DepthLevel> {
        let mut out: Vec<DepthLevel> = Vec::new();
        for order in self.side_orders(symbol, side, venue) {
            let Some(price) = order.price else { continue };
            match out.last_mut() {
                Some(level) if level.price == price => {
                    level.quantity += order.remaining_quantity;
                    level.order_count += 1;
                }
                _ => {
                    if out.len() == levels {
                        break;
                    }
                    out.push(DepthLevel {
                        price,
                        quantity: order.remaining_quantity,
                        order_count: 1,
                    });
                }
            }
        }
        out
    }

    /// Every symbol with at least one book key.
    pub fn symbols(&self) -> Vec<String> {
        let mut symbols = BTreeSet::new();
        for key in self.store.keys("book:*") {
            if let Some(symbol) = key.split(':').nth(2) {
                symbols.insert(symbol.to_string());
            }
        }
        symbols.into_iter().collect()
    }
}
