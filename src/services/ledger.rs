//! Account Ledger
//!
//! Accounts, positions, and the append-only transaction log, with
//! reservation semantics for open orders. All mutations for a given
//! account run under that account's lock; `apply_fill` locks both parties
//! in id order. Every path validates before it writes, so a failed call
//! leaves no partial state behind.

use dashmap::DashMap;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::OesError;
use crate::models::{
    Account, AccountType, Order, OrderSide, Position, RiskLevel, Trade, Transaction, TransactionKind,
};
use crate::services::matching::FeeConfig;
use crate::store::{MemoryStore, StoreKey};

/// A hold on account cash (buys) or position units (sells), taken when an
/// order enters the book and consumed proportionally as it fills.
#[derive(Debug, Clone)]
pub struct Reservation {
    pub id: Uuid,
    pub order_id: Uuid,
    pub account_id: String,
    pub symbol: String,
    pub side: OrderSide,
    /// Units still covered by this hold
    pub quantity: Decimal,
    /// Cash still held; zero for sell-side holds
    pub cash: Decimal,
}

pub struct AccountLedger {
    store: Arc<MemoryStore>,
    locks: DashMap<String, Arc<Mutex<()>>>,
    reservations: DashMap<Uuid, Reservation>,
    by_order: DashMap<Uuid, Uuid>,
}

impl AccountLedger {
    pub fn new(store: Arc<MemoryStore>) -> Self {
        Self {
            store,
            locks: DashMap::new(),
            reservations: DashMap::new(),
            by_order: DashMap::new(),
        }
    }

    fn lock_for(&self, account_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(account_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    // ==================== Accounts ====================

    pub fn create_account(
        &self,
        name: &str,
        initial_balance: Decimal,
        account_type: AccountType,
        risk_level: RiskLevel,
    ) -> Result<Account, OesError> {
        if name.trim().is_empty() {
            return Err(OesError::Validation("account name must not be empty".into()));
        }
        if initial_balance < Decimal::ZERO {
            return Err(OesError::Validation("initial balance must not be negative".into()));
        }

        let account = Account {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            balance: initial_balance,
            reserved: Decimal::ZERO,
            account_type,
            risk_level,
            active: true,
            created_at: chrono::Utc::now().timestamp_millis(),
        };

        let lock = self.lock_for(&account.id);
        let _guard = lock.lock();
        self.save_account(&account);
        self.write_txn(
            &account.id,
            TransactionKind::Deposit,
            initial_balance,
            account.balance,
            "opening deposit".to_string(),
        );

        tracing::info!("Account created: id={}, name={}", account.id, account.name);
        Ok(account)
    }

    pub fn get_account(&self, account_id: &str) -> Result<Account, OesError> {
        let fields = self
            .store
            .hgetall(&StoreKey::account(account_id))
            .ok_or_else(|| OesError::Validation(format!("unknown account: {}", account_id)))?;
        Account::from_fields(&fields)
    }

    pub fn list_accounts(&self) -> Vec<Account> {
        let mut accounts: Vec<Account> = self
            .store
            .keys("account:*")
            .iter()
            .filter_map(|key| self.store.hgetall(key))
            .filter_map(|fields| Account::from_fields(&fields).ok())
            .collect();
        accounts.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        accounts
    }

    /// Accounts are never deleted, only deactivated.
    pub fn deactivate_account(&self, account_id: &str) -> Result<Account, OesError> {
        let lock = self.lock_for(account_id);
        let _guard = lock.lock();
        let mut account = self.get_account(account_id)?;
        account.active = false;
        self.save_account(&account);
        Ok(account)
    }

    // ==================== Cash Movements ====================

    pub fn deposit(&self, account_id: &str, amount: Decimal, description: &str) -> Result<Transaction, OesError> {
        if amount <= Decimal::ZERO {
            return Err(OesError::Validation("deposit amount must be positive".into()));
        }
        let lock = self.lock_for(account_id);
        let _guard = lock.lock();
        let mut account = self.get_account(account_id)?;
        account.balance += amount;
        self.save_account(&account);
        Ok(self.write_txn(
            account_id,
            TransactionKind::Deposit,
            amount,
            account.balance,
            description.to_string(),
        ))
    }

    pub fn withdraw(&self, account_id: &str, amount: Decimal, description: &str) -> Result<Transaction, OesError> {
        if amount <= Decimal::ZERO {
            return Err(OesError::Validation("withdrawal amount must be positive".into()));
        }
        let lock = self.lock_for(account_id);
        let _guard = lock.lock();
        let mut account = self.get_account(account_id)?;
        if account.balance < amount && !account.is_margin() {
            return Err(OesError::InsufficientFunds(format!(
                "balance {} < withdrawal {}",
                account.balance, amount
            )));
        }
        account.balance -= amount;
        self.save_account(&account);
        Ok(self.write_txn(
            account_id,
            TransactionKind::Withdrawal,
            -amount,
            account.balance,
            description.to_string(),
        ))
    }

    // ==================== Reservations ====================

    /// Place a hold for an order before it enters the book. Buys hold
    /// `quantity * price` cash (for a market buy, `price` is the estimated
    /// walk cost per unit); sells hold position units. Shorting and
    /// negative cash are allowed only for high-risk accounts.
    pub fn reserve(&self, order: &Order, cash_needed: Decimal) -> Result<Reservation, OesError> {
        let lock = self.lock_for(&order.account_id);
        let _guard = lock.lock();

        let mut account = self.get_account(&order.account_id)?;
        if !account.active {
            return Err(OesError::Validation(format!(
                "account {} is deactivated",
                account.id
            )));
        }

        let reservation = match order.side {
            OrderSide::Buy => {
                if account.balance < cash_needed && !account.is_margin() {
                    return Err(OesError::InsufficientFunds(format!(
                        "balance {} < required {}",
                        account.balance, cash_needed
                    )));
                }
                account.balance -= cash_needed;
                account.reserved += cash_needed;
                self.save_account(&account);
                if cash_needed > Decimal::ZERO {
                    self.write_txn(
                        &account.id,
                        TransactionKind::Reservation,
                        -cash_needed,
                        account.balance,
                        format!("hold for order {}", order.id),
                    );
                }
                Reservation {
                    id: Uuid::new_v4(),
                    order_id: order.id,
                    account_id: account.id.clone(),
                    symbol: order.symbol.clone(),
                    side: OrderSide::Buy,
                    quantity: order.remaining_quantity,
                    cash: cash_needed,
                }
            }
            OrderSide::Sell => {
                let mut position = self.load_position(&account.id, &order.symbol);
                if position.available_quantity() < order.remaining_quantity && !account.is_margin() {
                    return Err(OesError::InsufficientPosition(format!(
                        "available {} < required {}",
                        position.available_quantity(),
                        order.remaining_quantity
                    )));
                }
                position.reserved_quantity += order.remaining_quantity;
                self.save_position(&position);
                Reservation {
                    id: Uuid::new_v4(),
                    order_id: order.id,
                    account_id: account.id.clone(),
                    symbol: order.symbol.clone(),
                    side: OrderSide::Sell,
                    quantity: order.remaining_quantity,
                    cash: Decimal::ZERO,
                }
            }
        };

        self.by_order.insert(order.id, reservation.id);
        self.reservations.insert(reservation.id, reservation.clone());
        Ok(reservation)
    }

    /// Undo whatever remains of an order's hold. Idempotent: releasing an
    /// unknown or fully consumed reservation is a no-op.
    pub fn release_order(&self, order_id: Uuid) -> Result<(), OesError> {
        let Some((_, reservation_id)) = self.by_order.remove(&order_id) else {
            return Ok(());
        };
        let Some((_, reservation)) = self.reservations.remove(&reservation_id) else {
            return Ok(());
        };
        self.release(reservation)
    }

    fn release(&self, reservation: Reservation) -> Result<(), OesError> {
        let lock = self.lock_for(&reservation.account_id);
        let _guard = lock.lock();

        match reservation.side {
            OrderSide::Buy => {
                if reservation.cash > Decimal::ZERO {
                    let mut account = self.get_account(&reservation.account_id)?;
                    account.reserved -= reservation.cash;
                    account.balance += reservation.cash;
                    self.save_account(&account);
                    self.write_txn(
                        &reservation.account_id,
                        TransactionKind::Release,
                        reservation.cash,
                        account.balance,
                        format!("release hold for order {}", reservation.order_id),
                    );
                }
            }
            OrderSide::Sell => {
                let mut position = self.load_position(&reservation.account_id, &reservation.symbol);
                position.reserved_quantity =
                    (position.reserved_quantity - reservation.quantity).max(Decimal::ZERO);
                self.save_position(&position);
            }
        }
        Ok(())
    }

    // ==================== Settlement ====================

    /// Settle one trade on both accounts: consume the proportional
    /// reservations, move cash, adjust positions, append transactions.
    /// Validates both parties before the first write so a failure leaves
    /// nothing half-applied. `taker_side` names the incoming side for fee
    /// attribution.
    pub fn apply_fill(&self, trade: &Trade, taker_side: OrderSide, fees: &FeeConfig) -> Result<(), OesError> {
        // Lock both parties in id order; a self-trade takes one lock.
        let (first, second) = if trade.buy_account_id <= trade.sell_account_id {
            (&trade.buy_account_id, &trade.sell_account_id)
        } else {
            (&trade.sell_account_id, &trade.buy_account_id)
        };
        let first_lock = self.lock_for(first);
        let second_lock = self.lock_for(second);
        let _first_guard = first_lock.lock();
        let _second_guard = if first != second {
            Some(second_lock.lock())
        } else {
            None
        };

        let mut buyer = self.get_account(&trade.buy_account_id)?;
        let mut seller = self.get_account(&trade.sell_account_id)?;
        let cost = trade.notional();

        // Only margin accounts may go negative. Checked before the first
        // write so a rejected fill leaves nothing half-applied.
        if !buyer.is_margin() {
            let releasable = self.reserved_share_for(trade.buy_order_id, trade.quantity);
            if buyer.balance + releasable < cost {
                return Err(OesError::InsufficientFunds(format!(
                    "account {} cannot cover {} for trade {}",
                    buyer.id, cost, trade.id
                )));
            }
        }

        // Buyer: hand back the proportional hold, then debit the actual cost.
        let released = self.consume_reservation(trade.buy_order_id, trade.quantity);
        buyer.reserved -= released;
        buyer.balance += released;
        if released > Decimal::ZERO {
            self.write_txn(
                &buyer.id,
                TransactionKind::Release,
                released,
                buyer.balance,
                format!("settle hold for order {}", trade.buy_order_id),
            );
        }
        buyer.balance -= cost;
        self.write_txn(
            &buyer.id,
            TransactionKind::TradeBuy,
            -cost,
            buyer.balance,
            format!("buy {} {} @ {}", trade.quantity, trade.symbol, trade.price),
        );
        let buyer_fee = fees.fee_for(cost, taker_side == OrderSide::Buy);
        if buyer_fee > Decimal::ZERO {
            buyer.balance -= buyer_fee;
            self.write_txn(
                &buyer.id,
                TransactionKind::Fee,
                -buyer_fee,
                buyer.balance,
                format!("fee for trade {}", trade.id),
            );
        }
        let mut buyer_position = self.load_position(&buyer.id, &trade.symbol);
        apply_position_delta(&mut buyer_position, trade.quantity, trade.price);
        self.save_position(&buyer_position);
        self.save_account(&buyer);

        // Seller: consume the unit hold, credit the proceeds.
        self.consume_reservation(trade.sell_order_id, trade.quantity);
        let mut seller_position = self.load_position(&seller.id, &trade.symbol);
        seller_position.reserved_quantity =
            (seller_position.reserved_quantity - trade.quantity).max(Decimal::ZERO);
        apply_position_delta(&mut seller_position, -trade.quantity, trade.price);
        self.save_position(&seller_position);

        seller.balance += cost;
        self.write_txn(
            &seller.id,
            TransactionKind::TradeSell,
            cost,
            seller.balance,
            format!("sell {} {} @ {}", trade.quantity, trade.symbol, trade.price),
        );
        let seller_fee = fees.fee_for(cost, taker_side == OrderSide::Sell);
        if seller_fee > Decimal::ZERO {
            seller.balance -= seller_fee;
            self.write_txn(
                &seller.id,
                TransactionKind::Fee,
                -seller_fee,
                seller.balance,
                format!("fee for trade {}", trade.id),
            );
        }
        self.save_account(&seller);

        Ok(())
    }

    /// Consume `quantity` units of an order's reservation; returns the cash
    /// released by that share (zero for sell-side or unreserved orders).
    fn consume_reservation(&self, order_id: Uuid, quantity: Decimal) -> Decimal {
        let Some(reservation_id) = self.by_order.get(&order_id).map(|r| *r) else {
            return Decimal::ZERO;
        };
        let Some(mut reservation) = self.reservations.get_mut(&reservation_id) else {
            return Decimal::ZERO;
        };

        let released = reserved_share(&reservation, quantity);
        reservation.cash -= released;
        reservation.quantity = (reservation.quantity - quantity).max(Decimal::ZERO);
        let exhausted = reservation.quantity.is_zero();
        drop(reservation);

        if exhausted {
            self.reservations.remove(&reservation_id);
            self.by_order.remove(&order_id);
        }
        released
    }

    /// The cash a fill of `quantity` would release from an order's hold,
    /// without consuming anything.
    fn reserved_share_for(&self, order_id: Uuid, quantity: Decimal) -> Decimal {
        let Some(reservation_id) = self.by_order.get(&order_id).map(|r| *r) else {
            return Decimal::ZERO;
        };
        self.reservations
            .get(&reservation_id)
            .map(|r| reserved_share(&r, quantity))
            .unwrap_or(Decimal::ZERO)
    }

    /// Remaining hold for an order, if any. Used by tests and /status.
    pub fn reservation_for(&self, order_id: Uuid) -> Option<Reservation> {
        let reservation_id = self.by_order.get(&order_id).map(|r| *r)?;
        self.reservations.get(&reservation_id).map(|r| r.clone())
    }

    // ==================== Queries ====================

    pub fn positions(&self, account_id: &str) -> Vec<Position> {
        let Some(fields) = self.store.hgetall(&StoreKey::positions(account_id)) else {
            return Vec::new();
        };
        let mut positions: Vec<Position> = fields
            .values()
            .filter_map(|raw| serde_json::from_str(raw).ok())
            .collect();
        positions.sort_by(|a: &Position, b: &Position| a.symbol.cmp(&b.symbol));
        positions
    }

    pub fn position(&self, account_id: &str, symbol: &str) -> Position {
        self.load_position(account_id, symbol)
    }

    pub fn transactions(&self, account_id: &str) -> Vec<Transaction> {
        self.store
            .lrange(&StoreKey::transactions(account_id), 0, -1)
            .iter()
            .filter_map(|raw| serde_json::from_str(raw).ok())
            .collect()
    }

    // ==================== Internals ====================

    fn save_account(&self, account: &Account) {
        self.store
            .hset_all(&StoreKey::account(&account.id), &account.to_fields());
    }

    fn load_position(&self, account_id: &str, symbol: &str) -> Position {
        self.store
            .hget(&StoreKey::positions(account_id), symbol)
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_else(|| Position::flat(account_id, symbol))
    }

    pub(crate) fn save_position(&self, position: &Position) {
        if let Ok(json) = serde_json::to_string(position) {
            self.store.hset_all(
                &StoreKey::positions(&position.account_id),
                &[(position.symbol.clone(), json)],
            );
        }
    }

    fn write_txn(
        &self,
        account_id: &str,
        kind: TransactionKind,
        amount: Decimal,
        balance_after: Decimal,
        description: String,
    ) -> Transaction {
        let txn = Transaction::new(account_id, kind, amount, balance_after, description);
        if let Ok(json) = serde_json::to_string(&txn) {
            self.store.rpush(&StoreKey::transactions(account_id), &json);
        }
        txn
    }
}

/// The cash share of a hold that a fill of `quantity` unlocks. The final
/// fill takes whatever is left so rounding never strands cash.
fn reserved_share(reservation: &Reservation, quantity: Decimal) -> Decimal {
    if quantity >= reservation.quantity {
        reservation.cash
    } else {
        reservation.cash * quantity / reservation.quantity
    }
}

/// Fold a signed fill into a position, maintaining the volume-weighted
/// average price: adding exposure re-weights, reducing keeps the vwap,
/// crossing through zero restarts it at the fill price.
fn apply_position_delta(position: &mut Position, delta: Decimal, price: Decimal) {
    let old_qty = position.quantity;
    let new_qty = old_qty + delta;

    if old_qty.is_zero() {
        position.avg_price = price;
    } else if (old_qty > Decimal::ZERO) == (delta > Decimal::ZERO) {
        position.avg_price = (old_qty.abs() * position.avg_price + delta.abs() * price)
            / (old_qty.abs() + delta.abs());
    } else if new_qty.is_zero() {
        position.avg_price = Decimal::ZERO;
    } else if (new_qty > Decimal::ZERO) != (old_qty > Decimal::ZERO) {
        position.avg_price = price;
    }
    // else: reduced exposure, vwap unchanged

    position.quantity = new_qty;
}
