// src/handlers/order_handler.rs
use axum::{
    extract::{Path, State},
    http::StatusCode,
    Extension, Json,
};

use super::SharedState;
use crate::{
    errors::DispatchResult,
    models::{
        AssignDriverRequest, CreateOrderRequest, Identity, Order, OrderStatusHistory,
        StatusUpdateRequest,
    },
    services::dispatch_service::OrderOperations,
};

pub async fn create_order(
    State(state): State<SharedState>,
    Extension(identity): Extension<Identity>,
    Json(request): Json<CreateOrderRequest>,
) -> DispatchResult<(StatusCode, Json<Order>)> {
    let order = state.dispatch.create_order(request, identity.as_actor()).await?;
    Ok((StatusCode::CREATED, Json(order)))
}

pub async fn get_order(
    State(state): State<SharedState>,
    Path(order_id): Path<String>,
) -> DispatchResult<Json<Order>> {
    Ok(Json(state.dispatch.get_order(&order_id).await?))
}

pub async fn get_order_history(
    State(state): State<SharedState>,
    Path(order_id): Path<String>,
) -> DispatchResult<Json<Vec<OrderStatusHistory>>> {
    Ok(Json(state.dispatch.order_history(&order_id).await?))
}

pub async fn assign_driver(
    State(state): State<SharedState>,
    Extension(identity): Extension<Identity>,
    Path(order_id): Path<String>,
    Json(request): Json<AssignDriverRequest>,
) -> DispatchResult<Json<Order>> {
    let reason = request.reason.as_deref().unwrap_or("assigned by operator");
    let order = state
        .dispatch
        .assign_driver(
            &order_id,
            &request.driver_id,
            &request.vehicle_id,
            reason,
            identity.as_actor(),
        )
        .await?;
    Ok(Json(order))
}

pub async fn update_status(
    State(state): State<SharedState>,
    Extension(identity): Extension<Identity>,
    Path(order_id): Path<String>,
    Json(request): Json<StatusUpdateRequest>,
) -> DispatchResult<Json<Order>> {
    let order = state
        .dispatch
        .update_status(
            &order_id,
            request.status,
            &request.reason,
            identity.as_actor(),
            request.metadata,
        )
        .await?;
    Ok(Json(order))
}
