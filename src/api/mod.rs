//! Thin HTTP surface (SPEC_FULL.md §4.14). spec.md places the HTTP layer,
//! auth, and marshalling out of scope as a feature surface; this module
//! exists only to give the ambient logging/error-mapping stack something to
//! run against, the way the teacher always pairs an internal engine with a
//! thin axum layer. No auth, no user accounts.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::{Json, Router};
use axum::routing::get;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::model::DataProduct;
use crate::query_planner::QueryPlanner;
use crate::store::SqliteMetadataStore;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<SqliteMetadataStore>,
    pub query_planner: Arc<QueryPlanner>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/v1/products", get(list_products))
        .route("/api/v1/products/:id/virtual", get(read_virtual_instrument))
        .with_state(state)
}

async fn health() -> &'static str {
    "collector operational"
}

/// Maps a [`StoreError`] onto the standard HTTP error classes spec.md §7
/// names: not-found, bad-request, server-error.
impl IntoResponse for StoreError {
    fn into_response(self) -> Response {
        let status = match &self {
            StoreError::NotFound(_) => StatusCode::NOT_FOUND,
            StoreError::TransactionAborted(_) => StatusCode::BAD_REQUEST,
            StoreError::Sqlite(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, self.to_string()).into_response()
    }
}

async fn list_products(State(state): State<AppState>) -> Result<Json<Vec<DataProduct>>, StoreError> {
    let products = state.store.list_products().await?;
    Ok(Json(products))
}

#[derive(Debug, Deserialize)]
struct VirtualReadQuery {
    from: DateTime<Utc>,
    to: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
struct VirtualReadResponse {
    bars: Vec<crate::model::Bar>,
}

async fn read_virtual_instrument(
    State(state): State<AppState>,
    Path(product_id): Path<i64>,
    Query(range): Query<VirtualReadQuery>,
) -> Result<Json<VirtualReadResponse>, StatusCode> {
    let bars = state
        .query_planner
        .read_virtual(product_id, range.from, range.to)
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
        .ok_or(StatusCode::NOT_FOUND)?;
    Ok(Json(VirtualReadResponse { bars }))
}
