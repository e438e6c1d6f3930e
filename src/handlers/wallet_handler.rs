// src/handlers/wallet_handler.rs
use axum::{
    extract::{Path, State},
    http::StatusCode,
    Extension, Json,
};
use serde::Deserialize;
use tracing;
use uuid::Uuid;

use super::SharedState;
use crate::{
    errors::DispatchResult,
    models::{Identity, Transaction, Wallet},
};

#[derive(Debug, Deserialize)]
pub struct TopUpRequest {
    pub amount: i64,
    /// Client-chosen key, unique per wallet; a retried request credits once
    pub idempotency_key: Option<String>,
    pub description: Option<String>,
}

pub async fn get_wallet(
    State(state): State<SharedState>,
    Path(user_id): Path<String>,
) -> DispatchResult<Json<Wallet>> {
    Ok(Json(state.wallet_service.get_wallet(&user_id).await?))
}

pub async fn get_transactions(
    State(state): State<SharedState>,
    Path(user_id): Path<String>,
) -> DispatchResult<Json<Vec<Transaction>>> {
    Ok(Json(state.wallet_service.transactions(&user_id).await?))
}

pub async fn top_up(
    State(state): State<SharedState>,
    Extension(identity): Extension<Identity>,
    Path(user_id): Path<String>,
    Json(request): Json<TopUpRequest>,
) -> DispatchResult<(StatusCode, Json<Transaction>)> {
    let key = request
        .idempotency_key
        .unwrap_or_else(|| format!("topup:{}", Uuid::new_v4()));
    let description = request
        .description
        .or_else(|| Some(format!("top-up by operator {}", identity.actor_id)));

    let tx = state
        .wallet_service
        .top_up(&user_id, request.amount, &key, description)
        .await?;
    tracing::info!("Wallet {} topped up by {} ({})", user_id, request.amount, identity.actor_id);
    Ok((StatusCode::CREATED, Json(tx)))
}
