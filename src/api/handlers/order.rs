//! Order API Handlers
//!
//! Entry, amend, and cancel. Every accepted request returns an id and a
//! status even when the engine rejects the order moments later; the event
//! channel carries the rest.

use axum::{
    extract::{Path, State},
    Json,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

use crate::error::OesError;
use crate::models::{OrderResponse, OrderSide, OrderStatus, OrderType, TimeInForce, Venue};
use crate::services::matching::NewOrder;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct CreateOrderRequest {
    /// Order direction; the wire calls this `type`
    #[serde(rename = "type")]
    pub side: OrderSide,
    pub symbol: String,
    pub price: Option<Decimal>,
    pub quantity: Decimal,
    pub account_id: String,
    pub order_type: Option<OrderType>,
    pub tif: Option<TimeInForce>,
    pub venue: Option<Venue>,
}

#[derive(Debug, Serialize)]
pub struct CreateOrderResponse {
    pub order_id: Uuid,
    pub status: OrderStatus,
    pub latency_ms: f64,
}

#[derive(Debug, Deserialize)]
pub struct EditOrderRequest {
    pub price: Option<Decimal>,
    pub quantity: Option<Decimal>,
}

/// Create a new order
/// POST /orders
pub async fn create_order(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateOrderRequest>,
) -> Result<Json<CreateOrderResponse>, OesError> {
    let started = Instant::now();

    // A price-less request without an explicit type is a market order.
    let order_type = req.order_type.unwrap_or(if req.price.is_some() {
        OrderType::Limit
    } else {
        OrderType::Market
    });

    let result = state.engine.submit_order(NewOrder {
        account_id: req.account_id,
        symbol: req.symbol,
        side: req.side,
        order_type,
        price: req.price,
        quantity: req.quantity,
        venue: req.venue.unwrap_or_default(),
        time_in_force: req.tif.unwrap_or_default(),
    })?;

    Ok(Json(CreateOrderResponse {
        order_id: result.order_id,
        status: result.status,
        latency_ms: started.elapsed().as_secs_f64() * 1000.0,
    }))
}

/// Get a single order
/// GET /orders/{id}
pub async fn get_order(
    State(state): State<Arc<AppState>>,
    Path(order_id): Path<Uuid>,
) -> Result<Json<OrderResponse>, OesError> {
    let order = state.engine.get_order(order_id)?;
    Ok(Json(order.into()))
}

/// Amend price and/or quantity
/// POST /orders/{id}/edit
pub async fn edit_order(
    State(state): State<Arc<AppState>>,
    Path(order_id): Path<Uuid>,
    Json(req): Json<EditOrderRequest>,
) -> Result<Json<OrderResponse>, OesError> {
    if req.price.is_none() && req.quantity.is_none() {
        return Err(OesError::Validation("amend requires a price or a quantity".into()));
    }
    state.engine.amend_order(order_id, req.price, req.quantity)?;
    let order = state.engine.get_order(order_id)?;
    Ok(Json(order.into()))
}

/// Cancel an order; idempotent on terminal orders
/// POST /orders/{id}/cancel
pub async fn cancel_order(
    State(state): State<Arc<AppState>>,
    Path(order_id): Path<Uuid>,
) -> Result<Json<OrderResponse>, OesError> {
    let order = state.engine.cancel_order(order_id)?;
    Ok(Json(order.into()))
}
