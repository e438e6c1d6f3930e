// src/services/geo_matcher.rs
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

use crate::models::{GeoPoint, VehicleClass};
use crate::utils::geo::haversine_km;

/// What the matcher needs to know about one connected driver
#[derive(Debug, Clone)]
pub struct MatchCandidate {
    pub driver_id: String,
    pub vehicle_class: Option<VehicleClass>,
    pub rating: f32,
    pub position: Option<GeoPoint>,
    pub is_idle: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DriverMatch {
    pub driver_id: String,
    pub distance_km: f64,
    pub rating: f32,
}

impl DriverMatch {
    // Bands are fixed at whole kilometres from the pickup, not relative to
    // each other: 2.95 km and 3.05 km fall in different bands and rank by
    // distance. Within one band the higher rating wins.
    fn band(&self) -> i64 {
        self.distance_km.floor() as i64
    }

    fn rank(&self, other: &Self) -> Ordering {
        self.band()
            .cmp(&other.band())
            .then_with(|| other.rating.total_cmp(&self.rating))
            .then_with(|| self.distance_km.total_cmp(&other.distance_km))
            .then_with(|| self.driver_id.cmp(&other.driver_id))
    }
}

/// Idle drivers of `vehicle_class` within `radius_km` of `pickup`, best first.
///
/// Linear scan; an empty result means nobody qualifies, not a failure.
pub fn find_eligible_drivers<'a, I>(
    candidates: I,
    vehicle_class: VehicleClass,
    pickup: &GeoPoint,
    radius_km: f64,
) -> Vec<DriverMatch>
where
    I: IntoIterator<Item = &'a MatchCandidate>,
{
    let mut matches: Vec<DriverMatch> = candidates
        .into_iter()
        .filter(|c| c.is_idle && c.vehicle_class == Some(vehicle_class))
        .filter_map(|c| {
            let position = c.position?;
            let distance_km = haversine_km(&position, pickup);
            (distance_km <= radius_km).then(|| DriverMatch {
                driver_id: c.driver_id.clone(),
                distance_km,
                rating: c.rating,
            })
        })
        .collect();

    matches.sort_by(|a, b| a.rank(b));
    matches
}
