// src/handlers/mod.rs
pub mod driver_handler;
pub mod order_handler;
pub mod wallet_handler;
pub mod ws_handler;

use axum::{
    extract::{Request, State},
    middleware::{self, Next},
    response::Response,
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use std::sync::Arc;

use crate::{
    errors::{DispatchError, DispatchResult},
    models::Role,
    state::AppState,
};

pub type SharedState = Arc<AppState>;

pub fn create_router(state: SharedState) -> Router {
    let operator = Router::new()
        .route("/orders", post(order_handler::create_order))
        .route("/orders/:id", get(order_handler::get_order))
        .route("/orders/:id/history", get(order_handler::get_order_history))
        .route("/orders/:id/assign", post(order_handler::assign_driver))
        .route("/orders/:id/status", post(order_handler::update_status))
        .route("/drivers/eligible", get(driver_handler::eligible_drivers))
        .route("/sessions", get(driver_handler::active_sessions))
        .route("/wallets/:user_id", get(wallet_handler::get_wallet))
        .route("/wallets/:user_id/transactions", get(wallet_handler::get_transactions))
        .route("/wallets/:user_id/top-up", post(wallet_handler::top_up))
        .layer(middleware::from_fn_with_state(state.clone(), operator_auth));

    Router::new()
        .route("/health", get(health))
        .route("/ws", get(ws_handler::connect))
        .merge(operator)
        .with_state(state)
}

/// Requires an operator bearer token; the identity lands in request extensions
pub async fn operator_auth(
    State(state): State<SharedState>,
    mut request: Request,
    next: Next,
) -> DispatchResult<Response> {
    let token = request
        .headers()
        .get("Authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or_else(|| DispatchError::unauthorized("missing bearer token"))?;

    let identity = state.auth.require_role(token, Role::Operator).await?;
    request.extensions_mut().insert(identity);
    Ok(next.run(request).await)
}

pub async fn health(State(state): State<SharedState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "connections": state.realtime.counts().await,
        "acceptance_timeout_secs": state.config.dispatch.acceptance_timeout.as_secs(),
    }))
}
