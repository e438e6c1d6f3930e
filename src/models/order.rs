// src/models/order.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::driver::VehicleClass;

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    Pending,            // Created, no driver yet
    DriverAssigned,     // Pushed to a driver, waiting for accept/reject
    DriverAccepted,     // Driver took the ride
    DriverArriving,     // Driver heading to pickup
    InProgress,         // Passenger on board
    Completed,
    NoDriverAvailable,  // Matching found nobody, operator may assign later
    Expired,            // Driver did not answer in time, reassignable
    CancelledByDriver,
    CancelledByCustomer,
    CancelledBySystem,
}

impl OrderStatus {
    /// Legal next states; an empty slice marks a terminal state
    pub fn allowed_next(&self) -> &'static [OrderStatus] {
        use OrderStatus::*;
        match self {
            Pending => &[DriverAssigned, NoDriverAvailable, CancelledBySystem],
            DriverAssigned => &[DriverAccepted, CancelledByDriver, Expired],
            DriverAccepted => &[DriverArriving, CancelledByDriver, CancelledByCustomer],
            DriverArriving => &[InProgress, CancelledByDriver, CancelledByCustomer],
            InProgress => &[Completed, CancelledByDriver],
            NoDriverAvailable => &[DriverAssigned, CancelledBySystem],
            Expired => &[DriverAssigned],
            Completed | CancelledByDriver | CancelledByCustomer | CancelledBySystem => &[],
        }
    }

    pub fn can_transition_to(&self, next: OrderStatus) -> bool {
        self.allowed_next().contains(&next)
    }

    pub fn is_terminal(&self) -> bool {
        self.allowed_next().is_empty()
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(
            self,
            OrderStatus::CancelledByDriver
                | OrderStatus::CancelledByCustomer
                | OrderStatus::CancelledBySystem
        )
    }

    /// States in which a new driver may be assigned
    pub fn is_assignable(&self) -> bool {
        matches!(
            self,
            OrderStatus::Pending | OrderStatus::NoDriverAvailable | OrderStatus::Expired
        )
    }

    /// States after which the assigned driver goes back to idle
    pub fn releases_driver(&self) -> bool {
        self.is_terminal() || *self == OrderStatus::Expired
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "PENDING",
            OrderStatus::DriverAssigned => "DRIVER_ASSIGNED",
            OrderStatus::DriverAccepted => "DRIVER_ACCEPTED",
            OrderStatus::DriverArriving => "DRIVER_ARRIVING",
            OrderStatus::InProgress => "IN_PROGRESS",
            OrderStatus::Completed => "COMPLETED",
            OrderStatus::NoDriverAvailable => "NO_DRIVER_AVAILABLE",
            OrderStatus::Expired => "EXPIRED",
            OrderStatus::CancelledByDriver => "CANCELLED_BY_DRIVER",
            OrderStatus::CancelledByCustomer => "CANCELLED_BY_CUSTOMER",
            OrderStatus::CancelledBySystem => "CANCELLED_BY_SYSTEM",
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TripType {
    Instant,
    Scheduled,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    Cash,
    Wallet,
    Card,
    Corporate,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

impl GeoPoint {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self { latitude, longitude }
    }

    pub fn is_valid(&self) -> bool {
        (-90.0..=90.0).contains(&self.latitude) && (-180.0..=180.0).contains(&self.longitude)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Place {
    pub address: String,
    pub location: GeoPoint,
}

/// Fare parts in minor currency units
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub struct FareBreakdown {
    pub base_fare: i64,
    pub distance_fare: i64,
    pub airport_fare: i64,
    pub total_fare: i64,
}

impl FareBreakdown {
    /// `None` when the parts do not fit in an `i64`
    pub fn sum_of_parts(&self) -> Option<i64> {
        self.base_fare
            .checked_add(self.distance_fare)?
            .checked_add(self.airport_fare)
    }

    pub fn is_consistent(&self, tolerance: i64) -> bool {
        self.total_fare > 0
            && self
                .sum_of_parts()
                .is_some_and(|sum| sum.abs_diff(self.total_fare) <= tolerance.max(0) as u64)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FeeStatus {
    NotApplicable, // No payer wallet on the order
    Pending,
    Charged,
    Failed,        // Needs manual reconciliation
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct OperationalFee {
    pub status: FeeStatus,
    pub amount: Option<i64>,
    pub transaction_id: Option<String>,
}

impl OperationalFee {
    pub fn for_payer(payer_id: Option<&str>) -> Self {
        Self {
            status: if payer_id.is_some() { FeeStatus::Pending } else { FeeStatus::NotApplicable },
            amount: None,
            transaction_id: None,
        }
    }

    pub fn charged(amount: i64, transaction_id: String) -> Self {
        Self {
            status: FeeStatus::Charged,
            amount: Some(amount),
            transaction_id: Some(transaction_id),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct PhaseTimestamps {
    pub assigned_at: Option<DateTime<Utc>>,
    pub accepted_at: Option<DateTime<Utc>>,
    pub arriving_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Order {
    pub id: String,
    pub order_number: String,
    pub trip_type: TripType,
    pub passenger_name: String,
    pub passenger_phone: String,
    pub pickup: Place,
    pub dropoff: Place,
    pub vehicle_class: VehicleClass,
    pub distance_meters: u32,
    pub estimated_duration_seconds: u32,
    pub actual_duration_seconds: Option<i64>,
    pub fare: FareBreakdown,
    pub payment_method: PaymentMethod,
    pub payer_id: Option<String>,
    pub driver_id: Option<String>,
    pub vehicle_id: Option<String>,
    pub status: OrderStatus,
    pub timestamps: PhaseTimestamps,
    pub operational_fee: OperationalFee,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    /// Stamp the phase timestamp belonging to `status`
    pub fn stamp_phase(&mut self, status: OrderStatus, at: DateTime<Utc>) {
        let ts = &mut self.timestamps;
        match status {
            OrderStatus::DriverAssigned => ts.assigned_at = Some(at),
            OrderStatus::DriverAccepted => ts.accepted_at = Some(at),
            OrderStatus::DriverArriving => ts.arriving_at = Some(at),
            OrderStatus::InProgress => ts.started_at = Some(at),
            OrderStatus::Completed => {
                ts.completed_at = Some(at);
                self.actual_duration_seconds =
                    ts.started_at.map(|started| (at - started).num_seconds().max(0));
            }
            s if s.is_cancelled() => ts.cancelled_at = Some(at),
            _ => {}
        }
        self.updated_at = at;
    }
}

/// Who caused a transition
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum Actor {
    System,
    Operator(String),
    Driver(String),
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Actor::System => write!(f, "system"),
            Actor::Operator(id) => write!(f, "operator:{}", id),
            Actor::Driver(id) => write!(f, "driver:{}", id),
        }
    }
}

/// Append-only log row, one per transition
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct OrderStatusHistory {
    pub id: String,
    pub order_id: String,
    pub from_status: Option<OrderStatus>,
    pub to_status: OrderStatus,
    pub reason: String,
    pub actor: Actor,
    pub metadata: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

// Request/Response Models
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct CreateOrderRequest {
    pub trip_type: TripType,
    pub passenger_name: String,
    pub passenger_phone: String,
    pub pickup: Place,
    pub dropoff: Place,
    pub vehicle_class: VehicleClass,
    pub distance_meters: u32,
    pub estimated_duration_seconds: u32,
    pub fare: FareBreakdown,
    pub payment_method: PaymentMethod,
    pub payer_id: Option<String>,
    pub scheduled_at: Option<DateTime<Utc>>,
    /// Pre-selected driver/vehicle; when absent the matcher runs
    pub driver_id: Option<String>,
    pub vehicle_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AssignDriverRequest {
    pub driver_id: String,
    pub vehicle_id: String,
    pub reason: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct StatusUpdateRequest {
    pub status: OrderStatus,
    pub reason: String,
    pub metadata: Option<serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [OrderStatus; 11] = [
        OrderStatus::Pending,
        OrderStatus::DriverAssigned,
        OrderStatus::DriverAccepted,
        OrderStatus::DriverArriving,
        OrderStatus::InProgress,
        OrderStatus::Completed,
        OrderStatus::NoDriverAvailable,
        OrderStatus::Expired,
        OrderStatus::CancelledByDriver,
        OrderStatus::CancelledByCustomer,
        OrderStatus::CancelledBySystem,
    ];

    #[test]
    fn test_pending_cannot_jump_to_completed() {
        assert!(!OrderStatus::Pending.can_transition_to(OrderStatus::Completed));
        assert!(OrderStatus::Pending.can_transition_to(OrderStatus::DriverAssigned));
    }

    #[test]
    fn test_terminal_states_have_no_exit() {
        for status in ALL {
            let terminal = matches!(
                status,
                OrderStatus::Completed
                    | OrderStatus::CancelledByDriver
                    | OrderStatus::CancelledByCustomer
                    | OrderStatus::CancelledBySystem
            );
            assert_eq!(status.is_terminal(), terminal, "{}", status);
        }
        // Expired stays reassignable
        assert!(OrderStatus::Expired.can_transition_to(OrderStatus::DriverAssigned));
    }

    #[test]
    fn test_status_wire_names() {
        for status in ALL {
            let json = serde_json::to_string(&status).unwrap();
            assert_eq!(json, format!("\"{}\"", status.as_str()));
        }
    }

    #[test]
    fn test_fare_tolerance() {
        let fare = FareBreakdown {
            base_fare: 6_000_000,
            distance_fare: 500_000,
            airport_fare: 0,
            total_fare: 6_500_000,
        };
        assert!(fare.is_consistent(100));

        let off = FareBreakdown { total_fare: 9_000_000, ..fare };
        assert!(!off.is_consistent(100));

        let rounding = FareBreakdown { total_fare: 6_500_050, ..fare };
        assert!(rounding.is_consistent(100));

        let huge = FareBreakdown { base_fare: i64::MAX, distance_fare: 1, airport_fare: 0, total_fare: 1 };
        assert_eq!(huge.sum_of_parts(), None);
        assert!(!huge.is_consistent(100));
    }

    #[test]
    fn test_completion_computes_duration() {
        let started = Utc::now();
        let mut timestamps = PhaseTimestamps::default();
        timestamps.started_at = Some(started);
        let mut order = Order {
            id: "ord-231207-a1b2c".into(),
            order_number: "TX-20231207-0001".into(),
            trip_type: TripType::Instant,
            passenger_name: "Ayu".into(),
            passenger_phone: "+62811000000".into(),
            pickup: Place { address: "A".into(), location: GeoPoint::new(-8.65, 115.21) },
            dropoff: Place { address: "B".into(), location: GeoPoint::new(-8.70, 115.17) },
            vehicle_class: VehicleClass::Standard,
            distance_meters: 7_000,
            estimated_duration_seconds: 900,
            actual_duration_seconds: None,
            fare: FareBreakdown { base_fare: 1, distance_fare: 1, airport_fare: 0, total_fare: 2 },
            payment_method: PaymentMethod::Cash,
            payer_id: None,
            driver_id: None,
            vehicle_id: None,
            status: OrderStatus::InProgress,
            timestamps,
            operational_fee: OperationalFee::for_payer(None),
            scheduled_at: None,
            created_at: started,
            updated_at: started,
        };

        order.stamp_phase(OrderStatus::Completed, started + chrono::Duration::seconds(640));
        assert_eq!(order.actual_duration_seconds, Some(640));
    }
}
