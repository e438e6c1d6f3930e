// src/handlers/driver_handler.rs
use axum::{
    extract::{Query, State},
    Json,
};
use serde::{Deserialize, Serialize};

use super::SharedState;
use crate::{
    errors::{DispatchError, DispatchResult},
    models::{ConnectionCounts, GeoPoint, VehicleClass},
    services::{geo_matcher::DriverMatch, realtime_service::SessionSummary},
    utils::validation::validate_coordinates,
};

#[derive(Debug, Deserialize)]
pub struct EligibleQuery {
    pub vehicle_class: VehicleClass,
    pub latitude: f64,
    pub longitude: f64,
    pub radius_km: Option<f64>,
}

#[derive(Debug, Serialize)]
pub struct SessionsResponse {
    pub counts: ConnectionCounts,
    pub sessions: Vec<SessionSummary>,
}

/// Matcher preview for a pickup point
pub async fn eligible_drivers(
    State(state): State<SharedState>,
    Query(query): Query<EligibleQuery>,
) -> DispatchResult<Json<Vec<DriverMatch>>> {
    let pickup = GeoPoint::new(query.latitude, query.longitude);
    validate_coordinates(&pickup)?;

    let radius_km = query.radius_km.unwrap_or(state.config.dispatch.match_radius_km);
    if !(radius_km > 0.0 && radius_km.is_finite()) {
        return Err(DispatchError::validation_error("radius_km", "radius must be positive"));
    }

    let matches = state
        .realtime
        .eligible_drivers(query.vehicle_class, &pickup, radius_km)
        .await;
    Ok(Json(matches))
}

pub async fn active_sessions(State(state): State<SharedState>) -> Json<SessionsResponse> {
    Json(SessionsResponse {
        counts: state.realtime.counts().await,
        sessions: state.realtime.active_sessions().await,
    })
}
