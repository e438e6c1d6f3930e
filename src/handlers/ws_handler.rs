// src/handlers/ws_handler.rs
// GET /ws?token=... ; browsers cannot set headers on a websocket upgrade,
// so the session token rides in the query string.
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::Response,
};
use futures::{stream::SplitSink, SinkExt, StreamExt};
use serde::Deserialize;
use tracing;

use super::SharedState;
use crate::{
    errors::{DispatchError, DispatchResult},
    models::{GeoPoint, InboundEvent, OutboundEvent, Role},
    services::{dispatch_service::OrderOperations, realtime_service::DriverProfile},
    state::AppState,
};

#[derive(Debug, Deserialize)]
pub struct WsAuthQuery {
    token: String,
}

pub async fn connect(
    State(state): State<SharedState>,
    Query(query): Query<WsAuthQuery>,
    ws: WebSocketUpgrade,
) -> DispatchResult<Response> {
    let identity = state.auth.authenticate(&query.token).await.map_err(|e| {
        tracing::debug!("Realtime handshake rejected: {}", e);
        e
    })?;

    match identity.role {
        Role::Driver => {
            let profile = state.dispatch.driver_profile(&identity.actor_id).await?;
            Ok(ws.on_upgrade(move |socket| driver_session(socket, state, profile)))
        }
        Role::Operator => {
            Ok(ws.on_upgrade(move |socket| operator_session(socket, state, identity.actor_id)))
        }
    }
}

async fn driver_session(socket: WebSocket, state: SharedState, profile: DriverProfile) {
    let driver_id = profile.driver_id.clone();
    let (session_id, mut events) = state.realtime.register_driver(profile).await;
    let (mut sink, mut stream) = socket.split();
    tracing::info!("Driver {} connected, session {}", driver_id, session_id);

    loop {
        tokio::select! {
            event = events.recv() => {
                // Queue closes when a newer session replaced this one
                let Some(event) = event else { break };
                if send_event(&mut sink, &event).await.is_err() {
                    break;
                }
            }

            msg = stream.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        state.realtime.touch(&session_id).await;
                        let reply = match serde_json::from_str::<InboundEvent>(&text) {
                            Ok(event) => handle_driver_event(&state, &driver_id, event).await,
                            Err(e) => Some(OutboundEvent::Error {
                                code: "bad_message".to_string(),
                                message: e.to_string(),
                            }),
                        };
                        if let Some(reply) = reply
                            && send_event(&mut sink, &reply).await.is_err()
                        {
                            break;
                        }
                    }
                    Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {
                        state.realtime.touch(&session_id).await;
                    }
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    _ => {}
                }
            }
        }
    }

    state.realtime.unregister_driver(&driver_id, &session_id).await;
    tracing::info!("Driver {} disconnected, session {}", driver_id, session_id);
}

async fn operator_session(socket: WebSocket, state: SharedState, operator_id: String) {
    let (session_id, mut events) = state.realtime.register_operator(&operator_id).await;
    let (mut sink, mut stream) = socket.split();
    tracing::info!("Operator {} connected, session {}", operator_id, session_id);

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                if send_event(&mut sink, &event).await.is_err() {
                    break;
                }
            }

            msg = stream.next() => {
                match msg {
                    // Operators act over HTTP; any frame just proves liveness
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => state.realtime.touch(&session_id).await,
                }
            }
        }
    }

    state.realtime.unregister_operator(&session_id).await;
    tracing::info!("Operator {} disconnected, session {}", operator_id, session_id);
}

async fn send_event(
    sink: &mut SplitSink<WebSocket, Message>,
    event: &OutboundEvent,
) -> Result<(), axum::Error> {
    match serde_json::to_string(event) {
        Ok(text) => sink.send(Message::Text(text)).await,
        Err(e) => {
            tracing::error!("Could not encode outbound event: {}", e);
            Ok(())
        }
    }
}

fn error_event(err: DispatchError) -> OutboundEvent {
    OutboundEvent::Error {
        code: err.code().to_string(),
        message: err.to_string(),
    }
}

fn response_rejected(order_id: String, err: DispatchError) -> OutboundEvent {
    if !err.is_client_error() {
        tracing::error!("Driver response on {} failed: {}", order_id, err);
    }
    OutboundEvent::ResponseRejected {
        order_id,
        code: err.code().to_string(),
        message: err.to_string(),
    }
}

/// Applies one driver frame; the returned event goes back to that driver only
pub(crate) async fn handle_driver_event(
    state: &AppState,
    driver_id: &str,
    event: InboundEvent,
) -> Option<OutboundEvent> {
    match event {
        InboundEvent::LocationUpdate { latitude, longitude, heading, speed } => state
            .realtime
            .update_location(driver_id, GeoPoint::new(latitude, longitude), heading, speed)
            .await
            .err()
            .map(error_event),
        InboundEvent::StatusChange { status } => state
            .realtime
            .set_availability(driver_id, status)
            .await
            .err()
            .map(error_event),
        InboundEvent::OrderResponse { order_id, decision } => {
            match state.dispatch.driver_response(driver_id, &order_id, decision).await {
                Ok(_) => None,
                Err(e) => Some(response_rejected(order_id, e)),
            }
        }
        InboundEvent::TripUpdate { order_id, phase } => {
            match state.dispatch.trip_update(driver_id, &order_id, phase).await {
                Ok(_) => None,
                Err(e) => Some(response_rejected(order_id, e)),
            }
        }
        InboundEvent::Emergency { order_id, message, latitude, longitude } => {
            let reported = latitude
                .zip(longitude)
                .map(|(lat, lng)| GeoPoint::new(lat, lng));
            state.realtime.emergency(driver_id, order_id, message, reported).await;
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Actor, OrderDecision, OrderStatus, VehicleClass};
    use crate::services::realtime_service::fixtures::{drain, profile};
    use crate::state::fixtures::app_state;
    use crate::utils::validation::fixtures::order_request;

    #[tokio::test]
    async fn test_unknown_order_response_is_rejected_to_driver() {
        let state = app_state().await;
        let reply = handle_driver_event(
            &state,
            "drv-1",
            InboundEvent::OrderResponse {
                order_id: "ord-missing".into(),
                decision: OrderDecision::Accept,
            },
        )
        .await;

        match reply {
            Some(OutboundEvent::ResponseRejected { order_id, code, .. }) => {
                assert_eq!(order_id, "ord-missing");
                assert_eq!(code, "not_found");
            }
            other => panic!("unexpected reply {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_location_from_unregistered_driver_errors() {
        let state = app_state().await;
        let reply = handle_driver_event(
            &state,
            "drv-1",
            InboundEvent::LocationUpdate {
                latitude: -8.7,
                longitude: 115.2,
                heading: None,
                speed: None,
            },
        )
        .await;
        assert!(matches!(reply, Some(OutboundEvent::Error { code, .. }) if code == "realtime_error"));
    }

    #[tokio::test]
    async fn test_accept_frame_moves_order() {
        let state = app_state().await;
        let order = state
            .dispatch
            .create_order(order_request(), Actor::Operator("op-1".into()))
            .await
            .unwrap();
        state
            .dispatch
            .assign_driver(&order.id, "drv-1", "veh-1", "pick", Actor::System)
            .await
            .unwrap();

        let reply = handle_driver_event(
            &state,
            "drv-1",
            InboundEvent::OrderResponse {
                order_id: order.id.clone(),
                decision: OrderDecision::Accept,
            },
        )
        .await;
        assert_eq!(reply, None);
        assert_eq!(
            state.dispatch.get_order(&order.id).await.unwrap().status,
            OrderStatus::DriverAccepted
        );
    }

    #[tokio::test]
    async fn test_emergency_frame_reaches_operators() {
        let state = app_state().await;
        let (_op, mut operator) = state.realtime.register_operator("op-1").await;
        let (_s, _driver) = state
            .realtime
            .register_driver(profile("drv-1", "veh-1", VehicleClass::Standard))
            .await;

        let reply = handle_driver_event(
            &state,
            "drv-1",
            InboundEvent::Emergency {
                order_id: None,
                message: Some("passenger unwell".into()),
                latitude: Some(-8.70),
                longitude: Some(115.20),
            },
        )
        .await;
        assert_eq!(reply, None);

        let events = drain(&mut operator);
        assert!(events.iter().any(|e| matches!(
            e,
            OutboundEvent::Emergency { location: Some(_), message: Some(m), .. } if m == "passenger unwell"
        )));
    }
}
