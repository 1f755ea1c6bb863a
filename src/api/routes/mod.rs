use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;

use crate::api::handlers;
use crate::AppState;

pub fn create_router(_state: Arc<AppState>) -> Router<Arc<AppState>> {
    Router::new()
        // Orders
        .route("/orders", post(handlers::order::create_order))
        .route("/orders/:order_id", get(handlers::order::get_order))
        .route("/orders/:order_id/edit", post(handlers::order::edit_order))
        .route("/orders/:order_id/cancel", post(handlers::order::cancel_order))
        // Orderbook
        .route("/orderbook/:symbol", get(handlers::orderbook::get_orderbook))
        // Accounts
        .route("/accounts", get(handlers::account::list_accounts))
        .route("/accounts", post(handlers::account::create_account))
        .route("/accounts/:account_id", get(handlers::account::get_account))
        .route("/accounts/:account_id/positions", get(handlers::account::get_positions))
        .route(
            "/accounts/:account_id/transactions",
            get(handlers::account::get_transactions),
        )
        .route(
            "/accounts/:account_id/transactions",
            post(handlers::account::create_transaction),
        )
        .route("/accounts/:account_id/orders", get(handlers::account::get_orders))
        // Status
        .route("/status", get(handlers::status::get_status))
}
