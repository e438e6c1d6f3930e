// src/models/messages.rs
// Realtime wire events. Every frame is JSON `{ "event": <name>, "data": {...} }`.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::driver::{Availability, DriverPosition};
use super::order::{GeoPoint, Order, OrderStatus};

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OrderDecision {
    Accept,
    Reject,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TripPhase {
    Arriving,
    Arrived,
    Started,
    Completed,
}

impl TripPhase {
    /// Status the phase maps to; `Arrived` is a notice only
    pub fn target_status(&self) -> Option<OrderStatus> {
        match self {
            TripPhase::Arriving => Some(OrderStatus::DriverArriving),
            TripPhase::Arrived => None,
            TripPhase::Started => Some(OrderStatus::InProgress),
            TripPhase::Completed => Some(OrderStatus::Completed),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum InboundEvent {
    LocationUpdate {
        latitude: f64,
        longitude: f64,
        heading: Option<f64>,
        speed: Option<f64>,
    },
    StatusChange {
        status: Availability,
    },
    OrderResponse {
        order_id: String,
        decision: OrderDecision,
    },
    TripUpdate {
        order_id: String,
        phase: TripPhase,
    },
    Emergency {
        order_id: Option<String>,
        message: Option<String>,
        latitude: Option<f64>,
        longitude: Option<f64>,
    },
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ConnectionCounts {
    pub drivers: usize,
    pub idle_drivers: usize,
    pub operators: usize,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(tag = "event", content = "data")]
pub enum OutboundEvent {
    #[serde(rename = "order:new_assignment")]
    NewAssignment {
        order: Box<Order>,
        respond_within_seconds: u64,
    },
    #[serde(rename = "order:available")]
    OrderAvailable {
        order: Box<Order>,
        distance_km: f64,
    },
    #[serde(rename = "order:status_updated")]
    OrderStatusUpdated {
        order_id: String,
        order_number: String,
        from: OrderStatus,
        to: OrderStatus,
        driver_id: Option<String>,
        reason: String,
    },
    #[serde(rename = "order:driver_arrived")]
    DriverArrived {
        order_id: String,
        driver_id: String,
    },
    #[serde(rename = "order:response_rejected")]
    ResponseRejected {
        order_id: String,
        code: String,
        message: String,
    },
    #[serde(rename = "driver:status_changed")]
    DriverStatusChanged {
        driver_id: String,
        status: Availability,
        current_order_id: Option<String>,
    },
    #[serde(rename = "driver:location")]
    DriverLocation {
        driver_id: String,
        position: DriverPosition,
    },
    #[serde(rename = "driver:disconnected")]
    DriverDisconnected {
        driver_id: String,
        current_order_id: Option<String>,
    },
    #[serde(rename = "emergency")]
    Emergency {
        driver_id: String,
        order_id: Option<String>,
        message: Option<String>,
        location: Option<GeoPoint>,
        raised_at: DateTime<Utc>,
    },
    #[serde(rename = "system:heartbeat")]
    Heartbeat {
        counts: ConnectionCounts,
        at: DateTime<Utc>,
    },
    #[serde(rename = "system:ping")]
    Ping {
        at: DateTime<Utc>,
    },
    #[serde(rename = "system:error")]
    Error {
        code: String,
        message: String,
    },
}
