// src/utils/validation.rs
use crate::errors::{DispatchError, ValidationError};
use crate::models::{CreateOrderRequest, FareBreakdown, GeoPoint, Place};
use crate::utils::geo::ServiceRegion;

/// Collects field errors so callers see every problem in one response
#[derive(Debug, Default)]
pub struct Validator {
    errors: Vec<ValidationError>,
}

impl Validator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn check(&mut self, ok: bool, field: &str, message: impl Into<String>) -> &mut Self {
        if !ok {
            self.errors.push(ValidationError {
                field: field.to_string(),
                message: message.into(),
            });
        }
        self
    }

    pub fn finish(self) -> Result<(), DispatchError> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(DispatchError::ValidationFailed(self.errors))
        }
    }
}

pub fn validate_coordinates(point: &GeoPoint) -> Result<(), DispatchError> {
    let mut v = Validator::new();
    v.check(
        (-90.0..=90.0).contains(&point.latitude),
        "latitude",
        format!("{} is outside [-90, 90]", point.latitude),
    )
    .check(
        (-180.0..=180.0).contains(&point.longitude),
        "longitude",
        format!("{} is outside [-180, 180]", point.longitude),
    );
    v.finish()
}

fn check_place(v: &mut Validator, field: &str, place: &Place, region: &ServiceRegion) {
    v.check(!place.address.trim().is_empty(), field, "address is required");
    if !place.location.is_valid() {
        v.check(false, field, "coordinates are out of range");
    } else {
        v.check(
            region.contains(&place.location),
            field,
            "location is outside the service region",
        );
    }
}

fn check_fare(v: &mut Validator, fare: &FareBreakdown, tolerance: i64) {
    v.check(fare.total_fare > 0, "fare.total_fare", "total fare must be positive")
        .check(
            fare.base_fare >= 0 && fare.distance_fare >= 0 && fare.airport_fare >= 0,
            "fare",
            "fare parts must not be negative",
        );
    match fare.sum_of_parts() {
        None => {
            v.check(false, "fare", "fare parts are too large");
        }
        Some(sum) if fare.total_fare > 0 => {
            v.check(
                fare.is_consistent(tolerance),
                "fare.total_fare",
                format!(
                    "parts sum to {} but total is {} (tolerance {})",
                    sum, fare.total_fare, tolerance
                ),
            );
        }
        Some(_) => {}
    }
}

/// Everything that must hold before an order is written
pub fn validate_create_order(
    request: &CreateOrderRequest,
    region: &ServiceRegion,
    fare_tolerance: i64,
) -> Result<(), DispatchError> {
    let mut v = Validator::new();

    v.check(
        !request.passenger_name.trim().is_empty(),
        "passenger_name",
        "passenger name is required",
    )
    .check(
        request.passenger_phone.chars().filter(|c| c.is_ascii_digit()).count() >= 6,
        "passenger_phone",
        "passenger phone looks invalid",
    )
    .check(request.distance_meters > 0, "distance_meters", "distance must be positive")
    .check(
        request.estimated_duration_seconds > 0,
        "estimated_duration_seconds",
        "duration must be positive",
    )
    .check(
        request.driver_id.is_some() == request.vehicle_id.is_some(),
        "vehicle_id",
        "driver and vehicle must be given together",
    );

    check_place(&mut v, "pickup", &request.pickup, region);
    check_place(&mut v, "dropoff", &request.dropoff, region);
    check_fare(&mut v, &request.fare, fare_tolerance);

    v.finish()
}

#[cfg(test)]
pub mod fixtures {
    use crate::models::*;

    /// Valid instant order inside the default region
    pub fn order_request() -> CreateOrderRequest {
        CreateOrderRequest {
            trip_type: TripType::Instant,
            passenger_name: "Made Wirawan".to_string(),
            passenger_phone: "+62 811 3800 123".to_string(),
            pickup: Place {
                address: "Jl. Raya Kuta 12".to_string(),
                location: GeoPoint::new(-8.7180, 115.1720),
            },
            dropoff: Place {
                address: "Ngurah Rai Airport".to_string(),
                location: GeoPoint::new(-8.7482, 115.1675),
            },
            vehicle_class: VehicleClass::Standard,
            distance_meters: 7_000,
            estimated_duration_seconds: 1_200,
            fare: FareBreakdown {
                base_fare: 6_000_000,
                distance_fare: 500_000,
                airport_fare: 0,
                total_fare: 6_500_000,
            },
            payment_method: PaymentMethod::Cash,
            payer_id: None,
            scheduled_at: None,
            driver_id: None,
            vehicle_id: None,
        }
    }
}
