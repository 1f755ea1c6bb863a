use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use crate::error::OesError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountType {
    Personal,
    Standard,
    Institutional,
}

impl Default for AccountType {
    fn default() -> Self {
        AccountType::Standard
    }
}

impl fmt::Display for AccountType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccountType::Personal => write!(f, "personal"),
            AccountType::Standard => write!(f, "standard"),
            AccountType::Institutional => write!(f, "institutional"),
        }
    }
}

impl FromStr for AccountType {
    type Err = OesError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "personal" => Ok(AccountType::Personal),
            "standard" => Ok(AccountType::Standard),
            "institutional" => Ok(AccountType::Institutional),
            other => Err(OesError::Validation(format!("invalid account type: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl Default for RiskLevel {
    fn default() -> Self {
        RiskLevel::Low
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RiskLevel::Low => write!(f, "low"),
            RiskLevel::Medium => write!(f, "medium"),
            RiskLevel::High => write!(f, "high"),
        }
    }
}

impl FromStr for RiskLevel {
    type Err = OesError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(RiskLevel::Low),
            "medium" => Ok(RiskLevel::Medium),
            "high" => Ok(RiskLevel::High),
            other => Err(OesError::Validation(format!("invalid risk level: {}", other))),
        }
    }
}

/// Account record, stored as the `account:{id}` hash.
///
/// `balance` is available cash; `reserved` is cash held against open buy
/// orders. A reservation moves value between the two, never out of the
/// account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: String,
    pub name: String,
    pub balance: Decimal,
    pub reserved: Decimal,
    pub account_type: AccountType,
    pub risk_level: RiskLevel,
    pub active: bool,
    pub created_at: i64,
}

impl Account {
    /// High-risk accounts may short and may run a negative cash balance.
    pub fn is_margin(&self) -> bool {
        self.risk_level == RiskLevel::High
    }

    pub fn to_fields(&self) -> Vec<(String, String)> {
        vec![
            ("id".into(), self.id.clone()),
            ("name".into(), self.name.clone()),
            ("balance".into(), self.balance.to_string()),
            ("reserved".into(), self.reserved.to_string()),
            ("account_type".into(), self.account_type.to_string()),
            ("risk_level".into(), self.risk_level.to_string()),
            ("active".into(), if self.active { "1" } else { "0" }.into()),
            ("created_at".into(), self.created_at.to_string()),
        ]
    }

    pub fn from_fields(fields: &HashMap<String, String>) -> Result<Self, OesError> {
        let get = |name: &str| -> Result<&String, OesError> {
            fields
                .get(name)
                .ok_or_else(|| OesError::Internal(format!("account record missing field {}", name)))
        };

        Ok(Self {
            id: get("id")?.clone(),
            name: get("name")?.clone(),
            balance: Decimal::from_str(get("balance")?)
                .map_err(|e| OesError::Internal(format!("account record bad balance: {}", e)))?,
            reserved: Decimal::from_str(get("reserved")?)
                .map_err(|e| OesError::Internal(format!("account record bad reserved: {}", e)))?,
            account_type: get("account_type")?.parse()?,
            risk_level: get("risk_level")?.parse()?,
            active: get("active")? == "1",
            created_at: get("created_at")?
                .parse()
                .map_err(|_| OesError::Internal("account record bad created_at".into()))?,
        })
    }
}

/// Per-symbol position, stored as one field of the `positions:{account_id}`
/// hash. Quantity is signed; shorts are negative.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub account_id: String,
    pub symbol: String,
    pub quantity: Decimal,
    /// Volume-weighted average entry price
    pub avg_price: Decimal,
    /// Units held against open sell orders
    pub reserved_quantity: Decimal,
}

impl Position {
    pub fn flat(account_id: &str, symbol: &str) -> Self {
        Self {
            account_id: account_id.to_string(),
            symbol: symbol.to_string(),
            quantity: Decimal::ZERO,
            avg_price: Decimal::ZERO,
            reserved_quantity: Decimal::ZERO,
        }
    }

    /// Units available to sell without shorting.
    pub fn available_quantity(&self) -> Decimal {
        self.quantity - self.reserved_quantity
    }
}
