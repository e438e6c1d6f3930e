// src/models/driver.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::order::GeoPoint;

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum VehicleClass {
    Economy,
    Standard,
    Premium,
    Van,       // Six seats and up
}

impl fmt::Display for VehicleClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            VehicleClass::Economy => "economy",
            VehicleClass::Standard => "standard",
            VehicleClass::Premium => "premium",
            VehicleClass::Van => "van",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Vehicle {
    pub id: String,
    pub license_plate: String,
    pub vehicle_class: VehicleClass,
    pub is_active: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Driver {
    pub id: String,
    pub full_name: String,
    pub phone_number: String,
    pub is_active: bool,
    pub is_verified: bool,
    pub current_vehicle_id: Option<String>, // Vehicle the driver is bound to today
    pub current_order_id: Option<String>,   // Set while busy with an order
    pub rating: f32,                        // Average rating (0-5)
    pub total_trips: u32,                   // Completed trips
    pub cancelled_trips: u32,               // Trips cancelled by the driver
    pub updated_at: DateTime<Utc>,
}

impl Driver {
    pub fn is_busy(&self) -> bool {
        self.current_order_id.is_some()
    }

    pub fn release(&mut self, at: DateTime<Utc>) {
        self.current_order_id = None;
        self.updated_at = at;
    }
}

/// Last position a connected driver reported
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq)]
pub struct DriverPosition {
    pub location: GeoPoint,
    pub heading: Option<f64>, // Degrees (0-360)
    pub speed: Option<f64>,   // km/h
    pub timestamp: DateTime<Utc>,
}

/// Self-reported availability sent over the realtime channel
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Availability {
    Idle,
    Busy,
}
