//! Matching Engine
//!
//! Continuous crossing across the dark and lit venues with a single writer
//! lock per symbol. Each crossing step consumes the resting order through
//! the store's atomic primitive, settles both accounts through the ledger,
//! and emits events; a ledger failure rolls the consume back, so a trade
//! either lands everywhere or nowhere.

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use tokio::sync::broadcast;
use uuid::Uuid;

use super::book::OrderBook;
use super::types::{BookSnapshot, FeeConfig, MatchResult};
use crate::error::OesError;
use crate::events::{Event, EventBus};
use crate::models::{
    Order, OrderSide, OrderStatus, OrderType, TimeInForce, Trade, Venue,
};
use crate::services::ledger::AccountLedger;
use crate::store::{MemoryStore, StoreKey};

/// Bounded retries for a crossing step that keeps losing the consume race.
const MAX_MATCH_RETRIES: u32 = 8;

const TRADE_CHANNEL_CAPACITY: usize = 4096;

/// Order entry request as it arrives from the API layer.
#[derive(Debug, Clone)]
pub struct NewOrder {
    pub account_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub price: Option<Decimal>,
    pub quantity: Decimal,
    pub venue: Venue,
    pub time_in_force: TimeInForce,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct EngineStats {
    pub orders_submitted: u64,
    pub trades_executed: u64,
    pub symbols: Vec<String>,
}

pub struct MatchingEngine {
    store: Arc<MemoryStore>,
    book: OrderBook,
    ledger: Arc<AccountLedger>,
    bus: Arc<EventBus>,
    fees: FeeConfig,
    symbol_locks: DashMap<String, Arc<Mutex<()>>>,
    trade_sender: broadcast::Sender<Trade>,
    orders_submitted: AtomicU64,
    trades_executed: AtomicU64,
}

impl MatchingEngine {
    pub fn new(
        store: Arc<MemoryStore>,
        ledger: Arc<AccountLedger>,
        bus: Arc<EventBus>,
        fees: FeeConfig,
    ) -> Self {
        let (trade_sender, _) = broadcast::channel(TRADE_CHANNEL_CAPACITY);
        let book = OrderBook::new(Arc::clone(&store));
        Self {
            store,
            book,
            ledger,
            bus,
            fees,
            symbol_locks: DashMap::new(),
            trade_sender,
            orders_submitted: AtomicU64::new(0),
            trades_executed: AtomicU64::new(0),
        }
    }

    /// Typed trade feed for in-process workers.
    pub fn subscribe_trades(&self) -> broadcast::Receiver<Trade> {
        self.trade_sender.subscribe()
    }

    pub fn book(&self) -> &OrderBook {
        &self.book
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            orders_submitted: self.orders_submitted.load(AtomicOrdering::Relaxed),
            trades_executed: self.trades_executed.load(AtomicOrdering::Relaxed),
            symbols: self.book.symbols(),
        }
    }

    fn symbol_lock(&self, symbol: &str) -> Arc<Mutex<()>> {
        self.symbol_locks
            .entry(symbol.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    // ========================================================================
    // Order Entry
    // ========================================================================

    /// Validate, reserve, match, then rest or cancel the remainder per the
    /// time in force. Validation and reservation failures return an error
    /// with nothing persisted; a FOK that cannot fill persists a rejected
    /// order and reports it via the event channel.
    pub fn submit_order(&self, request: NewOrder) -> Result<MatchResult, OesError> {
        let request = self.validate(request)?;
        let account = self.ledger.get_account(&request.account_id)?;
        if !account.active {
            return Err(OesError::Validation(format!(
                "account {} is deactivated",
                account.id
            )));
        }

        let mut order = Order::new(
            &request.account_id,
            &request.symbol,
            request.side,
            request.order_type,
            request.price,
            request.quantity,
            request.venue,
            request.time_in_force,
        );

        let lock = self.symbol_lock(&order.symbol);
        let _guard = lock.lock();

        if order.time_in_force == TimeInForce::Fok {
            let fillable = self.fillable_quantity(&order.symbol, order.side, order.price);
            if fillable < order.original_quantity {
                order.status = OrderStatus::Rejected;
                self.persist_terminal(&order);
                self.publish_order_update(&order);
                self.bus.publish(
                    StoreKey::NOTIFICATIONS,
                    Event::Error {
                        code: "NOT_FILLABLE".into(),
                        message: format!(
                            "order {} cannot be fully filled ({} of {} available)",
                            order.id, fillable, order.original_quantity
                        ),
                    },
                );
                tracing::info!("FOK order rejected: id={}, fillable={}", order.id, fillable);
                return Ok(MatchResult::for_order(&order, Vec::new()));
            }
        }

        let cash_needed = match order.side {
            OrderSide::Buy => match order.price {
                Some(price) => order.original_quantity * price,
                None => self.walk_cost(&order.symbol, order.original_quantity),
            },
            OrderSide::Sell => Decimal::ZERO,
        };
        self.ledger.reserve(&order, cash_needed)?;
        self.orders_submitted.fetch_add(1, AtomicOrdering::Relaxed);

        let trades = match self.cross_incoming(&mut order) {
            Ok(trades) => trades,
            Err(e) => {
                // The reservation must not outlive a failed submission, and
                // any fills that already settled stay on the record.
                let _ = self.ledger.release_order(order.id);
                order.status = OrderStatus::Cancelled;
                self.persist_terminal(&order);
                self.publish_order_update(&order);
                return Err(e);
            }
        };

        if order.remaining_quantity.is_zero() {
            order.status = OrderStatus::Filled;
            self.persist_terminal(&order);
        } else if order.order_type == OrderType::Limit
            && matches!(order.time_in_force, TimeInForce::Day | TimeInForce::Gtc)
        {
            order.status = if trades.is_empty() {
                OrderStatus::Open
            } else {
                OrderStatus::PartiallyFilled
            };
            self.book.insert(&mut order)?;
            self.store
                .rpush(&StoreKey::account_orders(&order.account_id), &order.id.to_string());
        } else {
            // IOC and market remainders cancel; their hold comes back.
            self.ledger.release_order(order.id)?;
            order.status = OrderStatus::Cancelled;
            self.persist_terminal(&order);
        }

        self.publish_order_update(&order);
        self.publish_book(&order.symbol);

        tracing::info!(
            "Order processed: id={}, status={}, filled={}",
            order.id,
            order.status,
            order.executed_quantity()
        );
        Ok(MatchResult::for_order(&order, trades))
    }

    fn validate(&self, mut request: NewOrder) -> Result<NewOrder, OesError> {
        request.symbol = request.symbol.trim().to_uppercase();
        if request.symbol.is_empty() || !request.symbol.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(OesError::Validation(format!("invalid symbol: {:?}", request.symbol)));
        }
        if request.quantity <= Decimal::ZERO {
            return Err(OesError::Validation("quantity must be positive".into()));
        }
        if let Some(price) = request.price {
            if price <= Decimal::ZERO {
                return Err(OesError::Validation("price must be positive".into()));
            }
        }
        if request.order_type == OrderType::Limit && request.price.is_none() {
            return Err(OesError::Validation("limit orders require a price".into()));
        }
        Ok(request)
    }

    /// The crossing loop for one incoming order. Caller holds the symbol
    /// lock. The incoming order's book state is carried in `order`; only
    /// resting counterparties live in the store while this runs.
    fn cross_incoming(&self, order: &mut Order) -> Result<Vec<Trade>, OesError> {
        let mut trades = Vec::new();
        let mut attempts = 0u32;

        while order.remaining_quantity > Decimal::ZERO {
            let Some(resting) = self.find_crossing(order)? else {
                break;
            };
            let fill_quantity = order.remaining_quantity.min(resting.remaining_quantity);
            let fill_price = resting
                .price
                .ok_or_else(|| OesError::Internal("resting order without price".into()))?;

            let prior = resting.clone();
            match self.book.consume(resting.id, fill_quantity) {
                Ok(resting_after) => {
                    let trade = self.make_trade(order, &resting, fill_price, fill_quantity);
                    if let Err(e) = self.ledger.apply_fill(&trade, order.side, &self.fees) {
                        self.book.restore(&prior)?;
                        return Err(e);
                    }
                    order.remaining_quantity -= fill_quantity;
                    order.updated_at = Utc::now().timestamp_millis();
                    attempts = 0;
                    self.trades_executed.fetch_add(1, AtomicOrdering::Relaxed);
                    self.publish_trade(&trade, order, &resting_after);
                    self.publish_order_update(&resting_after);
                    trades.push(trade);
                }
                Err(OesError::Stale) => {
                    attempts += 1;
                    if attempts >= MAX_MATCH_RETRIES {
                        return Err(OesError::Internal(format!(
                            "matching retries exhausted for order {}",
                            order.id
                        )));
                    }
                }
                Err(e) => return Err(e),
            }
        }
        Ok(trades)
    }

    /// Best crossing counterparty, dark pool first. The lit book is only
    /// consulted when no dark liquidity crosses.
    fn find_crossing(&self, order: &Order) -> Result<Option<Order>, OesError> {
        let opposite = order.side.opposite();
        for venue in [Venue::Dark, Venue::Lit] {
            if let Some(best) = self.book.peek_best(&order.symbol, opposite, venue)? {
                let Some(best_price) = best.price else { continue };
                if crosses(order.side, order.price, best_price) {
                    return Ok(Some(best));
                }
            }
        }
        Ok(None)
    }

    fn make_trade(&self, incoming: &Order, resting: &Order, price: Decimal, quantity: Decimal) -> Trade {
        let (buy, sell) = match incoming.side {
            OrderSide::Buy => (incoming, resting),
            OrderSide::Sell => (resting, incoming),
        };
        Trade::new(
            &incoming.symbol,
            price,
            quantity,
            buy.id,
            sell.id,
            &buy.account_id,
            &sell.account_id,
            resting.venue,
        )
    }

    // ========================================================================
    // Amend / Cancel
    // ========================================================================

    /// Amend price and/or quantity. The hold is swapped before the book is
    /// touched; if the new hold cannot be placed the original one is
    /// restored and the book is left unchanged. A price change can make the
    /// order marketable, so the symbol is re-crossed afterwards.
    pub fn amend_order(
        &self,
        order_id: Uuid,
        new_price: Option<Decimal>,
        new_quantity: Option<Decimal>,
    ) -> Result<MatchResult, OesError> {
        let current = self.book.load_order(order_id)?;
        let lock = self.symbol_lock(&current.symbol);
        let _guard = lock.lock();

        // Re-load under the lock; a racing fill may have advanced it.
        let current = self.book.load_order(order_id)?;
        if current.status.is_terminal() {
            return Err(OesError::AlreadyTerminal(order_id));
        }
        let executed = current.executed_quantity();
        let target_quantity = new_quantity.unwrap_or(current.original_quantity);
        if target_quantity <= executed {
            return Err(OesError::InvalidAmend(format!(
                "quantity {} does not exceed already-executed {}",
                target_quantity, executed
            )));
        }

        // Swap the hold to the amended terms.
        let mut amended = current.clone();
        amended.remaining_quantity = target_quantity - executed;
        amended.original_quantity = target_quantity;
        if let Some(price) = new_price {
            amended.price = Some(price);
        }
        let cash_needed = match amended.side {
            OrderSide::Buy => {
                let price = amended
                    .price
                    .ok_or_else(|| OesError::InvalidAmend("amended order needs a price".into()))?;
                amended.remaining_quantity * price
            }
            OrderSide::Sell => Decimal::ZERO,
        };
        self.ledger.release_order(order_id)?;
        if let Err(e) = self.ledger.reserve(&amended, cash_needed) {
            // Put the original hold back; the book was not touched.
            let original_cash = match current.side {
                OrderSide::Buy => {
                    current.remaining_quantity * current.price.unwrap_or(Decimal::ZERO)
                }
                OrderSide::Sell => Decimal::ZERO,
            };
            self.ledger.reserve(&current, original_cash)?;
            return Err(e);
        }

        let (order, lost_priority) = self.book.amend(order_id, new_price, new_quantity)?;
        tracing::info!(
            "Order amended: id={}, price={:?}, quantity={}, lost_priority={}",
            order.id,
            order.price,
            order.original_quantity,
            lost_priority
        );
        self.publish_order_update(&order);

        // The amended order may now cross resting liquidity.
        self.match_symbol_locked(&order.symbol)?;
        self.publish_book(&order.symbol);

        let final_order = self.book.load_order(order_id)?;
        Ok(MatchResult::for_order(&final_order, Vec::new()))
    }

    /// Cancel an order. Idempotent: cancelling a terminal order returns its
    /// final state unchanged.
    pub fn cancel_order(&self, order_id: Uuid) -> Result<Order, OesError> {
        let current = self.book.load_order(order_id)?;
        let lock = self.symbol_lock(&current.symbol);
        let _guard = lock.lock();

        let (order, already_terminal) = self.book.cancel(order_id)?;
        if already_terminal {
            tracing::debug!("Cancel of terminal order {} is a no-op", order_id);
            return Ok(order);
        }

        self.ledger.release_order(order_id)?;
        self.publish_order_update(&order);
        self.publish_book(&order.symbol);
        tracing::info!(
            "Order cancelled: id={}, remaining={}",
            order.id,
            order.remaining_quantity
        );
        Ok(order)
    }

    /// Cancel every resting day order (end-of-session sweep).
    pub fn sweep_day_orders(&self) -> Result<usize, OesError> {
        let mut swept = 0;
        for symbol in self.book.symbols() {
            for side in [OrderSide::Buy, OrderSide::Sell] {
                for venue in [Venue::Lit, Venue::Dark] {
                    for order in self.book.side_orders(&symbol, side, venue) {
                        if order.time_in_force == TimeInForce::Day {
                            self.cancel_order(order.id)?;
                            swept += 1;
                        }
                    }
                }
            }
        }
        if swept > 0 {
            tracing::info!("End-of-session sweep cancelled {} day orders", swept);
        }
        Ok(swept)
    }

    // ========================================================================
    // Periodic Tick
    // ========================================================================

    /// Cross any symbol whose consolidated book is locked or crossed.
    /// Recovers from dropped wake-ups and admin book reloads.
    pub fn run_tick(&self) -> Result<(), OesError> {
        for symbol in self.book.symbols() {
            let lock = self.symbol_lock(&symbol);
            let _guard = lock.lock();
            let traded = self.match_symbol_locked(&symbol)?;
            if traded {
                self.publish_book(&symbol);
            }
        }
        Ok(())
    }

    /// Cross resting liquidity until the consolidated book uncrosses.
    /// Caller holds the symbol lock. The older order is the maker and sets
    /// the price. Returns whether any trade printed.
    fn match_symbol_locked(&self, symbol: &str) -> Result<bool, OesError> {
        let mut traded = false;
        let mut attempts = 0u32;

        loop {
            let Some(bid) = self.best_resting(symbol, OrderSide::Buy)? else {
                break;
            };
            let Some(ask) = self.best_resting(symbol, OrderSide::Sell)? else {
                break;
            };
            let (Some(bid_price), Some(ask_price)) = (bid.price, ask.price) else {
                break;
            };
            if bid_price < ask_price {
                break;
            }

            let (maker, taker) = if bid.sequence <= ask.sequence {
                (&bid, &ask)
            } else {
                (&ask, &bid)
            };
            let fill_price = maker
                .price
                .ok_or_else(|| OesError::Internal("resting order without price".into()))?;
            let fill_quantity = bid.remaining_quantity.min(ask.remaining_quantity);
            let taker_side = taker.side;
            let venue = maker.venue;

            let bid_prior = bid.clone();
            let ask_prior = ask.clone();
            let bid_after = match self.book.consume(bid.id, fill_quantity) {
                Ok(order) => order,
                Err(OesError::Stale) => {
                    attempts += 1;
                    if attempts >= MAX_MATCH_RETRIES {
                        return Err(OesError::Internal(format!(
                            "tick matching retries exhausted for {}",
                            symbol
                        )));
                    }
                    continue;
                }
                Err(e) => return Err(e),
            };
            let ask_after = match self.book.consume(ask.id, fill_quantity) {
                Ok(order) => order,
                Err(OesError::Stale) => {
                    self.book.restore(&bid_prior)?;
                    attempts += 1;
                    if attempts >= MAX_MATCH_RETRIES {
                        return Err(OesError::Internal(format!(
                            "tick matching retries exhausted for {}",
                            symbol
                        )));
                    }
                    continue;
                }
                Err(e) => {
                    self.book.restore(&bid_prior)?;
                    return Err(e);
                }
            };

            let trade = Trade::new(
                symbol,
                fill_price,
                fill_quantity,
                bid.id,
                ask.id,
                &bid.account_id,
                &ask.account_id,
                venue,
            );
            if let Err(e) = self.ledger.apply_fill(&trade, taker_side, &self.fees) {
                self.book.restore(&bid_prior)?;
                self.book.restore(&ask_prior)?;
                return Err(e);
            }

            attempts = 0;
            traded = true;
            self.trades_executed.fetch_add(1, AtomicOrdering::Relaxed);
            self.publish_trade(&trade, &bid_after, &ask_after);
            self.publish_order_update(&bid_after);
            self.publish_order_update(&ask_after);
        }
        Ok(traded)
    }

    /// Best resting order across venues; the dark pool wins price ties.
    fn best_resting(&self, symbol: &str, side: OrderSide) -> Result<Option<Order>, OesError> {
        let dark = self.book.peek_best(symbol, side, Venue::Dark)?;
        let lit = self.book.peek_best(symbol, side, Venue::Lit)?;
        Ok(match (dark, lit) {
            (Some(dark), Some(lit)) => {
                let dark_price = dark.price.unwrap_or(Decimal::ZERO);
                let lit_price = lit.price.unwrap_or(Decimal::ZERO);
                let dark_wins = match side {
                    OrderSide::Buy => dark_price >= lit_price,
                    OrderSide::Sell => dark_price <= lit_price,
                };
                Some(if dark_wins { dark } else { lit })
            }
            (dark, lit) => dark.or(lit),
        })
    }

    // ========================================================================
    // Fillability / Reservation Estimates
    // ========================================================================

    /// Non-mutating walk of both opposite books: total quantity that
    /// crosses the given price cap.
    fn fillable_quantity(&self, symbol: &str, side: OrderSide, cap: Option<Decimal>) -> Decimal {
        let opposite = side.opposite();
        let mut total = Decimal::ZERO;
        for venue in [Venue::Dark, Venue::Lit] {
            for order in self.book.side_orders(symbol, opposite, venue) {
                if let Some(price) = order.price {
                    if crosses(side, cap, price) {
                        total += order.remaining_quantity;
                    }
                }
            }
        }
        total
    }

    /// Estimated cash to fill `quantity`; backs the hold for an
    /// unprotected market buy. Walks the opposite books in the same
    /// dark-then-lit order the crossing loop consumes them, because an
    /// uncapped buy takes dark liquidity first even when the dark price is
    /// worse than the lit one.
    fn walk_cost(&self, symbol: &str, quantity: Decimal) -> Decimal {
        let mut needed = quantity;
        let mut cost = Decimal::ZERO;
        for venue in [Venue::Dark, Venue::Lit] {
            for order in self.book.side_orders(symbol, OrderSide::Sell, venue) {
                if needed.is_zero() {
                    return cost;
                }
                let Some(price) = order.price else { continue };
                let take = needed.min(order.remaining_quantity);
                cost += take * price;
                needed -= take;
            }
        }
        cost
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub fn get_order(&self, order_id: Uuid) -> Result<Order, OesError> {
        self.book.load_order(order_id)
    }

    pub fn account_orders(&self, account_id: &str) -> Vec<Order> {
        self.store
            .lrange(&StoreKey::account_orders(account_id), 0, -1)
            .iter()
            .filter_map(|raw| Uuid::parse_str(raw).ok())
            .filter_map(|id| self.book.load_order(id).ok())
            .collect()
    }

    pub fn book_snapshot(&self, symbol: &str, venue: Venue, depth: usize) -> BookSnapshot {
        let symbol = symbol.to_uppercase();
        let (bids, asks) = self.book.depth(&symbol, venue, depth);
        BookSnapshot {
            symbol,
            venue,
            bids,
            asks,
            timestamp: Utc::now().timestamp_millis(),
        }
    }

    // ========================================================================
    // Event Publication
    // ========================================================================

    /// Trade first, then the parties' notifications; a subscriber sees the
    /// execution before the resulting status transition.
    fn publish_trade(&self, trade: &Trade, first: &Order, second: &Order) {
        let _ = self.trade_sender.send(trade.clone());
        self.bus.publish(
            &StoreKey::channel_trades(&trade.symbol),
            Event::Trade { trade: trade.clone() },
        );

        let (buy_remaining, sell_remaining) = if first.side == OrderSide::Buy {
            (first.remaining_quantity, second.remaining_quantity)
        } else {
            (second.remaining_quantity, first.remaining_quantity)
        };
        self.bus.publish(
            StoreKey::NOTIFICATIONS,
            Event::TradeExecuted {
                account_id: trade.buy_account_id.clone(),
                order_id: trade.buy_order_id,
                symbol: trade.symbol.clone(),
                price: trade.price,
                quantity: trade.quantity,
                remaining_quantity: buy_remaining,
            },
        );
        self.bus.publish(
            StoreKey::NOTIFICATIONS,
            Event::TradeExecuted {
                account_id: trade.sell_account_id.clone(),
                order_id: trade.sell_order_id,
                symbol: trade.symbol.clone(),
                price: trade.price,
                quantity: trade.quantity,
                remaining_quantity: sell_remaining,
            },
        );
    }

    fn publish_order_update(&self, order: &Order) {
        self.bus.publish(
            StoreKey::NOTIFICATIONS,
            Event::OrdersUpdated {
                account_id: order.account_id.clone(),
                order: order.clone(),
            },
        );
    }

    /// Public book delta: the lit venue only.
    pub fn publish_book(&self, symbol: &str) {
        let snapshot = self.book_snapshot(symbol, Venue::Lit, 20);
        self.bus.publish(
            &StoreKey::channel_orderbook(symbol),
            Event::Orderbook {
                symbol: snapshot.symbol,
                venue: snapshot.venue,
                bids: snapshot.bids,
                asks: snapshot.asks,
            },
        );
    }

    fn persist_terminal(&self, order: &Order) {
        self.book.save_order(order);
        self.store
            .rpush(&StoreKey::account_orders(&order.account_id), &order.id.to_string());
    }
}

/// Whether a price crosses the incoming order's cap. No cap means an
/// unprotected market order: anything crosses.
fn crosses(side: OrderSide, cap: Option<Decimal>, resting_price: Decimal) -> bool {
    match (side, cap) {
        (_, None) => true,
        (OrderSide::Buy, Some(cap)) => resting_price <= cap,
        (OrderSide::Sell, Some(cap)) => resting_price >= cap,
    }
}

