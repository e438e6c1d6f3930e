// src/config.rs
use std::env;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use crate::models::{FeeSchedule, FeeTier};
use crate::utils::geo::ServiceRegion;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {var}: {reason}")]
    InvalidValue { var: &'static str, reason: String },
}

/// Rules the dispatch engine enforces
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    pub acceptance_timeout: Duration,
    pub fare_tolerance: i64,       // Minor units
    pub match_radius_km: f64,
    pub service_region: ServiceRegion,
    pub fee_schedule: FeeSchedule,
    pub fee_retry_limit: u32,      // Extra attempts after a version conflict
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            acceptance_timeout: Duration::from_secs(120),
            fare_tolerance: 100,
            match_radius_km: 5.0,
            service_region: ServiceRegion::default(),
            fee_schedule: FeeSchedule::default(),
            fee_retry_limit: 1,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RealtimeConfig {
    pub heartbeat_interval: Duration,
    pub session_idle_after: Duration,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            session_idle_after: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: String,
    pub redis_url: Option<String>,
    pub auth_service_url: Option<String>,
    pub store_timeout: Duration,
    pub dispatch: DispatchConfig,
    pub realtime: RealtimeConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:3000".to_string(),
            redis_url: None,
            auth_service_url: None,
            store_timeout: Duration::from_secs(5),
            dispatch: DispatchConfig::default(),
            realtime: RealtimeConfig::default(),
        }
    }
}

impl AppConfig {
    /// Defaults overridden by whatever is set in the environment
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(addr) = env::var("BIND_ADDR") {
            config.bind_addr = addr;
        }
        config.redis_url = env::var("REDIS_URL").ok().filter(|v| !v.is_empty());
        config.auth_service_url = env::var("AUTH_SERVICE_URL").ok().filter(|v| !v.is_empty());

        if let Some(secs) = parse_var::<u64>("STORE_TIMEOUT_SECS")? {
            config.store_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_var::<u64>("ACCEPTANCE_TIMEOUT_SECS")? {
            config.dispatch.acceptance_timeout = Duration::from_secs(secs);
        }
        if let Some(tolerance) = parse_var::<i64>("FARE_TOLERANCE_MINOR")? {
            config.dispatch.fare_tolerance = tolerance;
        }
        if let Some(radius) = parse_var::<f64>("MATCH_RADIUS_KM")? {
            config.dispatch.match_radius_km = radius;
        }
        if let Ok(raw) = env::var("SERVICE_REGION") {
            config.dispatch.service_region = parse_region(&raw)?;
        }
        if let Ok(raw) = env::var("OPERATIONAL_FEE_TIERS") {
            config.dispatch.fee_schedule.tiers = parse_fee_tiers(&raw)?;
        }
        if let Some(units) = parse_var::<i64>("MINOR_UNITS_PER_COIN")? {
            if units <= 0 {
                return Err(invalid("MINOR_UNITS_PER_COIN", "must be positive"));
            }
            config.dispatch.fee_schedule.minor_units_per_coin = units;
        }
        if let Some(secs) = parse_var::<u64>("HEARTBEAT_INTERVAL_SECS")? {
            config.realtime.heartbeat_interval = Duration::from_secs(secs.max(1));
        }
        if let Some(secs) = parse_var::<u64>("SESSION_IDLE_SECS")? {
            config.realtime.session_idle_after = Duration::from_secs(secs);
        }

        Ok(config)
    }
}

fn invalid(var: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue { var, reason: reason.into() }
}

fn parse_var<T: FromStr>(var: &'static str) -> Result<Option<T>, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match env::var(var) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| invalid(var, e.to_string())),
        Err(_) => Ok(None),
    }
}

/// `min_lat,min_lng,max_lat,max_lng`
pub fn parse_region(raw: &str) -> Result<ServiceRegion, ConfigError> {
    let values = raw
        .split(',')
        .map(|part| part.trim().parse::<f64>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| invalid("SERVICE_REGION", e.to_string()))?;

    match values.as_slice() {
        [min_lat, min_lng, max_lat, max_lng] if min_lat < max_lat && min_lng < max_lng => {
            Ok(ServiceRegion {
                min_latitude: *min_lat,
                min_longitude: *min_lng,
                max_latitude: *max_lat,
                max_longitude: *max_lng,
            })
        }
        _ => Err(invalid("SERVICE_REGION", "expected min_lat,min_lng,max_lat,max_lng")),
    }
}

/// `3000:5,10000:8,*:10`; breakpoints must increase and `*` may only come last
pub fn parse_fee_tiers(raw: &str) -> Result<Vec<FeeTier>, ConfigError> {
    let mut tiers: Vec<FeeTier> = Vec::new();

    for part in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (bound, percent) = part
            .split_once(':')
            .ok_or_else(|| invalid("OPERATIONAL_FEE_TIERS", format!("'{}' lacks ':'", part)))?;
        let percent = percent
            .trim()
            .parse::<u32>()
            .map_err(|e| invalid("OPERATIONAL_FEE_TIERS", e.to_string()))?;
        if percent > 100 {
            return Err(invalid("OPERATIONAL_FEE_TIERS", "percent above 100"));
        }

        let max_distance_meters = match bound.trim() {
            "*" => None,
            other => Some(
                other
                    .parse::<u32>()
                    .map_err(|e| invalid("OPERATIONAL_FEE_TIERS", e.to_string()))?,
            ),
        };

        if let Some(last) = tiers.last() {
            match (last.max_distance_meters, max_distance_meters) {
                (None, _) => {
                    return Err(invalid("OPERATIONAL_FEE_TIERS", "'*' must be the last tier"));
                }
                (Some(prev), Some(next)) if next <= prev => {
                    return Err(invalid("OPERATIONAL_FEE_TIERS", "breakpoints must increase"));
                }
                _ => {}
            }
        }
        tiers.push(FeeTier { max_distance_meters, percent });
    }

    if tiers.is_empty() {
        return Err(invalid("OPERATIONAL_FEE_TIERS", "no tiers given"));
    }
    Ok(tiers)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_fee_tiers() {
        let tiers = parse_fee_tiers("2000:4, 8000:7, *:12").unwrap();
        assert_eq!(
            tiers,
            vec![
                FeeTier { max_distance_meters: Some(2_000), percent: 4 },
                FeeTier { max_distance_meters: Some(8_000), percent: 7 },
                FeeTier { max_distance_meters: None, percent: 12 },
            ]
        );
    }

    #[test]
    fn test_rejects_malformed_tiers() {
        assert!(parse_fee_tiers("").is_err());
        assert!(parse_fee_tiers("*:5,3000:8").is_err());
        assert!(parse_fee_tiers("5000:5,3000:8").is_err());
        assert!(parse_fee_tiers("3000-5").is_err());
        assert!(parse_fee_tiers("3000:150").is_err());
    }

    #[test]
    fn test_parse_region() {
        let region = parse_region("-8.95,114.40,-8.05,115.75").unwrap();
        assert_eq!(region, ServiceRegion::default());
        assert!(parse_region("1,2,3").is_err());
        assert!(parse_region("5,5,1,1").is_err());
    }
}
