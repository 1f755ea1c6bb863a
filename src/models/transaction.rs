use chrono::Utc;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Transaction kind. `reservation` and `release` mirror cash moving into
/// and out of the held bucket, so the signed running sum over the log
/// always equals the live balance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    Deposit,
    Withdrawal,
    TradeBuy,
    TradeSell,
    Fee,
    Reservation,
    Release,
}

impl fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransactionKind::Deposit => write!(f, "deposit"),
            TransactionKind::Withdrawal => write!(f, "withdrawal"),
            TransactionKind::TradeBuy => write!(f, "trade_buy"),
            TransactionKind::TradeSell => write!(f, "trade_sell"),
            TransactionKind::Fee => write!(f, "fee"),
            TransactionKind::Reservation => write!(f, "reservation"),
            TransactionKind::Release => write!(f, "release"),
        }
    }
}

/// Append-only ledger entry; never mutated after write.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub id: Uuid,
    pub account_id: String,
    pub kind: TransactionKind,
    /// Signed cash delta applied to the available balance
    pub amount: Decimal,
    pub balance_after: Decimal,
    pub description: String,
    pub timestamp: i64,
}

impl Transaction {
    pub fn new(
        account_id: &str,
        kind: TransactionKind,
        amount: Decimal,
        balance_after: Decimal,
        description: String,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            account_id: account_id.to_string(),
            kind,
            amount,
            balance_after,
            description,
            timestamp: Utc::now().timestamp_millis(),
        }
    }
}
