//! Orderbook Depth Handler

use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::Deserialize;
use std::sync::Arc;

use crate::error::OesError;
use crate::models::Venue;
use crate::services::matching::BookSnapshot;
use crate::AppState;

const DEFAULT_DEPTH: usize = 10;
const MAX_DEPTH: usize = 100;

#[derive(Debug, Deserialize)]
pub struct DepthQuery {
    pub depth: Option<usize>,
    /// Dark depth only when asked for explicitly.
    pub venue: Option<Venue>,
}

/// Aggregated depth for one venue of a symbol
/// GET /orderbook/{symbol}?depth=N[&venue=lit|dark]
pub async fn get_orderbook(
    State(state): State<Arc<AppState>>,
    Path(symbol): Path<String>,
    Query(query): Query<DepthQuery>,
) -> Result<Json<BookSnapshot>, OesError> {
    let depth = query.depth.unwrap_or(DEFAULT_DEPTH).clamp(1, MAX_DEPTH);
    let venue = query.venue.unwrap_or(Venue::Lit);
    Ok(Json(state.engine.book_snapshot(&symbol, venue, depth)))
}
