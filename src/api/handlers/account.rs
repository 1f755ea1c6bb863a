//! Account API Handlers

use axum::{
    extract::{Path, State},
    Json,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::OesError;
use crate::models::{
    Account, AccountType, OrderResponse, Position, RiskLevel, Transaction,
};
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct CreateAccountRequest {
    pub name: String,
    #[serde(default)]
    pub initial_balance: Decimal,
    #[serde(default)]
    pub account_type: AccountType,
    #[serde(default)]
    pub risk_level: RiskLevel,
}

#[derive(Debug, Serialize)]
pub struct AccountResponse {
    pub account_id: String,
    pub name: String,
    pub balance: Decimal,
    pub reserved: Decimal,
    pub account_type: AccountType,
    pub risk_level: RiskLevel,
    pub active: bool,
    pub created_at: i64,
}

impl From<Account> for AccountResponse {
    fn from(account: Account) -> Self {
        Self {
            account_id: account.id,
            name: account.name,
            balance: account.balance,
            reserved: account.reserved,
            account_type: account.account_type,
            risk_level: account.risk_level,
            active: account.active,
            created_at: account.created_at,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateTransactionRequest {
    pub amount: Decimal,
    pub transaction_type: String,
    #[serde(default)]
    pub description: String,
}

/// List all accounts
/// GET /accounts
pub async fn list_accounts(State(state): State<Arc<AppState>>) -> Json<Vec<AccountResponse>> {
    Json(
        state
            .ledger
            .list_accounts()
            .into_iter()
            .map(AccountResponse::from)
            .collect(),
    )
}

/// Create an account with an opening deposit
/// POST /accounts
pub async fn create_account(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateAccountRequest>,
) -> Result<Json<AccountResponse>, OesError> {
    let account = state.ledger.create_account(
        &req.name,
        req.initial_balance,
        req.account_type,
        req.risk_level,
    )?;
    Ok(Json(account.into()))
}

/// GET /accounts/{id}
pub async fn get_account(
    State(state): State<Arc<AppState>>,
    Path(account_id): Path<String>,
) -> Result<Json<AccountResponse>, OesError> {
    let account = state.ledger.get_account(&account_id)?;
    Ok(Json(account.into()))
}

/// GET /accounts/{id}/positions
pub async fn get_positions(
    State(state): State<Arc<AppState>>,
    Path(account_id): Path<String>,
) -> Result<Json<Vec<Position>>, OesError> {
    state.ledger.get_account(&account_id)?;
    Ok(Json(state.ledger.positions(&account_id)))
}

/// GET /accounts/{id}/transactions
pub async fn get_transactions(
    State(state): State<Arc<AppState>>,
    Path(account_id): Path<String>,
) -> Result<Json<Vec<Transaction>>, OesError> {
    state.ledger.get_account(&account_id)?;
    Ok(Json(state.ledger.transactions(&account_id)))
}

/// GET /accounts/{id}/orders
pub async fn get_orders(
    State(state): State<Arc<AppState>>,
    Path(account_id): Path<String>,
) -> Result<Json<Vec<OrderResponse>>, OesError> {
    state.ledger.get_account(&account_id)?;
    Ok(Json(
        state
            .engine
            .account_orders(&account_id)
            .into_iter()
            .map(OrderResponse::from)
            .collect(),
    ))
}

/// Cash movement independent of trading
/// POST /accounts/{id}/transactions
pub async fn create_transaction(
    State(state): State<Arc<AppState>>,
    Path(account_id): Path<String>,
    Json(req): Json<CreateTransactionRequest>,
) -> Result<Json<Transaction>, OesError> {
    let txn = match req.transaction_type.as_str() {
        "deposit" => state.ledger.deposit(&account_id, req.amount, &req.description)?,
        "withdrawal" => state.ledger.withdraw(&account_id, req.amount, &req.description)?,
        other => {
            return Err(OesError::Validation(format!(
                "invalid transaction_type: {} (expected deposit or withdrawal)",
                other
            )))
        }
    };
    Ok(Json(txn))
}
