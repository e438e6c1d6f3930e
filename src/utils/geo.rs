// src/utils/geo.rs
use serde::{Deserialize, Serialize};

use crate::models::GeoPoint;

const EARTH_RADIUS_KM: f64 = 6371.0;

/// Great-circle distance in kilometres
pub fn haversine_km(from: &GeoPoint, to: &GeoPoint) -> f64 {
    let lat1_rad = from.latitude.to_radians();
    let lat2_rad = to.latitude.to_radians();
    let delta_lat = (to.latitude - from.latitude).to_radians();
    let delta_lon = (to.longitude - from.longitude).to_radians();

    let a = (delta_lat / 2.0).sin().powi(2)
        + lat1_rad.cos() * lat2_rad.cos() * (delta_lon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());

    EARTH_RADIUS_KM * c
}

/// Rectangular service area
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ServiceRegion {
    pub min_latitude: f64,
    pub min_longitude: f64,
    pub max_latitude: f64,
    pub max_longitude: f64,
}

impl ServiceRegion {
    pub fn contains(&self, point: &GeoPoint) -> bool {
        (self.min_latitude..=self.max_latitude).contains(&point.latitude)
            && (self.min_longitude..=self.max_longitude).contains(&point.longitude)
    }
}

impl Default for ServiceRegion {
    // Bali
    fn default() -> Self {
        Self {
            min_latitude: -8.95,
            min_longitude: 114.40,
            max_latitude: -8.05,
            max_longitude: 115.75,
        }
    }
}

/// Point `km` kilometres due north of `origin`
#[cfg(test)]
pub fn north_of(origin: &GeoPoint, km: f64) -> GeoPoint {
    GeoPoint::new(origin.latitude + (km / EARTH_RADIUS_KM).to_degrees(), origin.longitude)
}
