// src/services/realtime_service.rs
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing;

use crate::{
    config::RealtimeConfig,
    errors::{DispatchError, DispatchResult},
    models::{
        Availability, ConnectionCounts, DriverPosition, GeoPoint, OutboundEvent, Role,
        VehicleClass,
    },
    services::geo_matcher::{find_eligible_drivers, DriverMatch, MatchCandidate},
    utils::{
        id_generator::{IdGenerator, IdType},
        validation::validate_coordinates,
    },
};

pub type EventSender = mpsc::UnboundedSender<OutboundEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<OutboundEvent>;

/// Stored facts about a driver, loaded when the session opens
#[derive(Debug, Clone)]
pub struct DriverProfile {
    pub driver_id: String,
    pub vehicle_id: Option<String>,
    pub vehicle_class: Option<VehicleClass>,
    pub rating: f32,
    pub current_order_id: Option<String>,
}

struct DriverSession {
    session_id: String,
    profile: DriverProfile,
    position: Option<DriverPosition>,
    availability: Availability,
    connected_at: DateTime<Utc>,
    last_seen: Instant,
    last_seen_at: DateTime<Utc>,
    sender: EventSender,
}

struct OperatorSession {
    operator_id: String,
    connected_at: DateTime<Utc>,
    last_seen: Instant,
    last_seen_at: DateTime<Utc>,
    sender: EventSender,
}

#[derive(Default)]
struct Registry {
    drivers: HashMap<String, DriverSession>,     // driver_id -> session
    operators: HashMap<String, OperatorSession>, // session_id -> session
}

impl Registry {
    fn counts(&self) -> ConnectionCounts {
        ConnectionCounts {
            drivers: self.drivers.len(),
            idle_drivers: self
                .drivers
                .values()
                .filter(|s| s.availability == Availability::Idle)
                .count(),
            operators: self.operators.len(),
        }
    }

    fn broadcast_operators(&self, event: &OutboundEvent) -> usize {
        self.operators
            .values()
            .filter(|op| op.sender.send(event.clone()).is_ok())
            .count()
    }
}

/// Dashboard view of one live connection
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub role: Role,
    pub actor_id: String,
    pub availability: Option<Availability>,
    pub current_order_id: Option<String>,
    pub position: Option<DriverPosition>,
    pub connected_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

/// Live driver and operator sessions. All registry mutation goes through
/// these methods under one lock; events are pushed into per-session queues
/// and never awaited on.
#[derive(Clone)]
pub struct RealtimeHub {
    registry: Arc<RwLock<Registry>>,
    config: RealtimeConfig,
}

impl RealtimeHub {
    pub fn new(config: RealtimeConfig) -> Self {
        Self {
            registry: Arc::new(RwLock::new(Registry::default())),
            config,
        }
    }

    /// Opens a driver session; a second connection replaces the first
    pub async fn register_driver(&self, profile: DriverProfile) -> (String, EventReceiver) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let session_id = IdGenerator::generate(IdType::Session);
        let now = Utc::now();
        let availability = if profile.current_order_id.is_some() {
            Availability::Busy
        } else {
            Availability::Idle
        };
        let driver_id = profile.driver_id.clone();
        let current_order_id = profile.current_order_id.clone();

        let mut registry = self.registry.write().await;
        let replaced = registry.drivers.insert(
            driver_id.clone(),
            DriverSession {
                session_id: session_id.clone(),
                profile,
                position: None,
                availability,
                connected_at: now,
                last_seen: Instant::now(),
                last_seen_at: now,
                sender,
            },
        );
        registry.broadcast_operators(&OutboundEvent::DriverStatusChanged {
            driver_id: driver_id.clone(),
            status: availability,
            current_order_id,
        });
        drop(registry);

        if let Some(old) = replaced {
            tracing::info!("Driver {} reconnected, closing session {}", driver_id, old.session_id);
        }
        tracing::info!("Driver {} connected as {}", driver_id, session_id);
        (session_id, receiver)
    }

    pub async fn register_operator(&self, operator_id: &str) -> (String, EventReceiver) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let session_id = IdGenerator::generate(IdType::Session);
        let now = Utc::now();

        self.registry.write().await.operators.insert(
            session_id.clone(),
            OperatorSession {
                operator_id: operator_id.to_string(),
                connected_at: now,
                last_seen: Instant::now(),
                last_seen_at: now,
                sender,
            },
        );
        tracing::info!("Operator {} connected as {}", operator_id, session_id);
        (session_id, receiver)
    }

    /// Drops the driver session. The driver's order is left alone; operators
    /// only get told it went dark.
    pub async fn unregister_driver(&self, driver_id: &str, session_id: &str) {
        let mut registry = self.registry.write().await;
        let owns_slot = registry
            .drivers
            .get(driver_id)
            .is_some_and(|s| s.session_id == session_id);
        if !owns_slot {
            return;
        }

        if let Some(session) = registry.drivers.remove(driver_id) {
            registry.broadcast_operators(&OutboundEvent::DriverDisconnected {
                driver_id: driver_id.to_string(),
                current_order_id: session.profile.current_order_id.clone(),
            });
            match &session.profile.current_order_id {
                Some(order_id) => tracing::warn!(
                    "Driver {} disconnected while on order {}",
                    driver_id,
                    order_id
                ),
                None => tracing::info!("Driver {} disconnected", driver_id),
            }
        }
    }

    pub async fn unregister_operator(&self, session_id: &str) {
        if let Some(session) = self.registry.write().await.operators.remove(session_id) {
            tracing::info!("Operator {} disconnected", session.operator_id);
        }
    }

    /// Any inbound frame counts as a sign of life
    pub async fn touch(&self, session_id: &str) {
        let mut registry = self.registry.write().await;
        let now = Utc::now();
        if let Some(op) = registry.operators.get_mut(session_id) {
            op.last_seen = Instant::now();
            op.last_seen_at = now;
            return;
        }
        if let Some(driver) = registry
            .drivers
            .values_mut()
            .find(|d| d.session_id == session_id)
        {
            driver.last_seen = Instant::now();
            driver.last_seen_at = now;
        }
    }

    pub async fn update_location(
        &self,
        driver_id: &str,
        location: GeoPoint,
        heading: Option<f64>,
        speed: Option<f64>,
    ) -> DispatchResult<DriverPosition> {
        validate_coordinates(&location)?;
        let position = DriverPosition {
            location,
            heading,
            speed,
            timestamp: Utc::now(),
        };

        let mut registry = self.registry.write().await;
        let session = registry
            .drivers
            .get_mut(driver_id)
            .ok_or_else(|| DispatchError::Realtime(format!("driver {} is not connected", driver_id)))?;
        session.position = Some(position);
        session.last_seen = Instant::now();
        session.last_seen_at = position.timestamp;

        registry.broadcast_operators(&OutboundEvent::DriverLocation {
            driver_id: driver_id.to_string(),
            position,
        });
        Ok(position)
    }

    /// Driver-reported idle/busy. Going idle while holding an order is refused.
    pub async fn set_availability(&self, driver_id: &str, status: Availability) -> DispatchResult<()> {
        let mut registry = self.registry.write().await;
        let session = registry
            .drivers
            .get_mut(driver_id)
            .ok_or_else(|| DispatchError::Realtime(format!("driver {} is not connected", driver_id)))?;

        if status == Availability::Idle {
            if let Some(order_id) = &session.profile.current_order_id {
                return Err(DispatchError::precondition(format!(
                    "driver is still on order {}",
                    order_id
                )));
            }
        }
        session.availability = status;
        let current_order_id = session.profile.current_order_id.clone();

        registry.broadcast_operators(&OutboundEvent::DriverStatusChanged {
            driver_id: driver_id.to_string(),
            status,
            current_order_id,
        });
        tracing::debug!("Driver {} is now {:?}", driver_id, status);
        Ok(())
    }

    /// Mirrors an assignment or release made by the engine into the session
    pub async fn mark_driver_order(&self, driver_id: &str, order_id: Option<&str>) {
        let mut registry = self.registry.write().await;
        let Some(session) = registry.drivers.get_mut(driver_id) else {
            return;
        };
        session.profile.current_order_id = order_id.map(str::to_string);
        session.availability = if order_id.is_some() {
            Availability::Busy
        } else {
            Availability::Idle
        };
        let status = session.availability;

        registry.broadcast_operators(&OutboundEvent::DriverStatusChanged {
            driver_id: driver_id.to_string(),
            status,
            current_order_id: order_id.map(str::to_string),
        });
    }

    /// Best effort; `false` when the driver has no live session
    pub async fn send_to_driver(&self, driver_id: &str, event: OutboundEvent) -> bool {
        let registry = self.registry.read().await;
        match registry.drivers.get(driver_id) {
            Some(session) => session.sender.send(event).is_ok(),
            None => false,
        }
    }

    /// Returns how many operator sessions took the event
    pub async fn broadcast_operators(&self, event: OutboundEvent) -> usize {
        self.registry.read().await.broadcast_operators(&event)
    }

    pub async fn eligible_drivers(
        &self,
        vehicle_class: VehicleClass,
        pickup: &GeoPoint,
        radius_km: f64,
    ) -> Vec<DriverMatch> {
        let candidates: Vec<MatchCandidate> = {
            let registry = self.registry.read().await;
            registry
                .drivers
                .values()
                .map(|s| MatchCandidate {
                    driver_id: s.profile.driver_id.clone(),
                    vehicle_class: s.profile.vehicle_class,
                    rating: s.profile.rating,
                    position: s.position.map(|p| p.location),
                    is_idle: s.availability == Availability::Idle
                        && s.profile.current_order_id.is_none(),
                })
                .collect()
        };
        find_eligible_drivers(&candidates, vehicle_class, pickup, radius_km)
    }

    /// Pushed to every operator at once and logged on its own target
    pub async fn emergency(
        &self,
        driver_id: &str,
        order_id: Option<String>,
        message: Option<String>,
        reported: Option<GeoPoint>,
    ) -> usize {
        let (location, reached) = {
            let registry = self.registry.read().await;
            let location = reported.filter(GeoPoint::is_valid).or_else(|| {
                registry
                    .drivers
                    .get(driver_id)
                    .and_then(|s| s.position.map(|p| p.location))
            });
            let event = OutboundEvent::Emergency {
                driver_id: driver_id.to_string(),
                order_id: order_id.clone(),
                message: message.clone(),
                location,
                raised_at: Utc::now(),
            };
            (location, registry.broadcast_operators(&event))
        };

        tracing::warn!(
            target: "taxi_dispatch::emergency",
            driver_id,
            order_id = order_id.as_deref().unwrap_or("-"),
            latitude = location.map(|l| l.latitude),
            longitude = location.map(|l| l.longitude),
            operators_reached = reached,
            "EMERGENCY: {}",
            message.as_deref().unwrap_or("no message")
        );
        reached
    }

    pub async fn counts(&self) -> ConnectionCounts {
        self.registry.read().await.counts()
    }

    pub async fn is_driver_connected(&self, driver_id: &str) -> bool {
        self.registry.read().await.drivers.contains_key(driver_id)
    }

    pub async fn active_sessions(&self) -> Vec<SessionSummary> {
        let registry = self.registry.read().await;
        let drivers = registry.drivers.values().map(|s| SessionSummary {
            session_id: s.session_id.clone(),
            role: Role::Driver,
            actor_id: s.profile.driver_id.clone(),
            availability: Some(s.availability),
            current_order_id: s.profile.current_order_id.clone(),
            position: s.position,
            connected_at: s.connected_at,
            last_seen_at: s.last_seen_at,
        });
        let operators = registry.operators.iter().map(|(id, s)| SessionSummary {
            session_id: id.clone(),
            role: Role::Operator,
            actor_id: s.operator_id.clone(),
            availability: None,
            current_order_id: None,
            position: None,
            connected_at: s.connected_at,
            last_seen_at: s.last_seen_at,
        });
        let mut sessions: Vec<_> = drivers.chain(operators).collect();
        sessions.sort_by(|a, b| a.connected_at.cmp(&b.connected_at));
        sessions
    }

    /// One heartbeat round: ping quiet sessions, drop dead queues, report counts
    pub async fn heartbeat_tick(&self) -> ConnectionCounts {
        let now = Instant::now();
        let idle_after = self.config.session_idle_after;
        let ping = OutboundEvent::Ping { at: Utc::now() };

        let mut registry = self.registry.write().await;
        let mut gone = Vec::new();
        registry.drivers.retain(|id, s| {
            if s.sender.is_closed() {
                tracing::debug!("Pruning closed driver session {}", id);
                gone.push(OutboundEvent::DriverDisconnected {
                    driver_id: id.clone(),
                    current_order_id: s.profile.current_order_id.clone(),
                });
                return false;
            }
            if now.duration_since(s.last_seen) > idle_after {
                let _ = s.sender.send(ping.clone());
            }
            true
        });
        registry.operators.retain(|id, s| {
            if s.sender.is_closed() {
                tracing::debug!("Pruning closed operator session {}", id);
                return false;
            }
            if now.duration_since(s.last_seen) > idle_after {
                let _ = s.sender.send(ping.clone());
            }
            true
        });

        for notice in &gone {
            registry.broadcast_operators(notice);
        }

        let counts = registry.counts();
        registry.broadcast_operators(&OutboundEvent::Heartbeat {
            counts: counts.clone(),
            at: Utc::now(),
        });
        counts
    }

    /// Runs heartbeat rounds until `shutdown` fires
    pub async fn run_heartbeat(self, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.heartbeat_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("Heartbeat stopped");
                    break;
                }
                _ = interval.tick() => {
                    let counts = self.heartbeat_tick().await;
                    tracing::debug!(
                        "Heartbeat: {} drivers ({} idle), {} operators",
                        counts.drivers,
                        counts.idle_drivers,
                        counts.operators
                    );
                }
            }
        }
    }
}

#[cfg(test)]
pub mod fixtures {
    use super::*;

    pub fn profile(driver_id: &str, vehicle_id: &str, class: VehicleClass) -> DriverProfile {
        DriverProfile {
            driver_id: driver_id.to_string(),
            vehicle_id: Some(vehicle_id.to_string()),
            vehicle_class: Some(class),
            rating: 4.5,
            current_order_id: None,
        }
    }

    /// Everything queued so far, without waiting
    pub fn drain(receiver: &mut EventReceiver) -> Vec<OutboundEvent> {
        let mut events = Vec::new();
        while let Ok(event) = receiver.try_recv() {
            events.push(event);
        }
        events
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;
    use crate::utils::geo::north_of;
    use std::time::Duration;

    fn hub() -> RealtimeHub {
        RealtimeHub::new(RealtimeConfig::default())
    }

    #[tokio::test]
    async fn test_location_is_validated_and_forwarded() {
        let hub = hub();
        let (_op, mut operator) = hub.register_operator("op-1").await;
        let (_s, _driver) = hub
            .register_driver(profile("drv-1", "veh-1", VehicleClass::Standard))
            .await;
        drain(&mut operator);

        let err = hub
            .update_location("drv-1", GeoPoint::new(91.0, 115.2), None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::ValidationFailed(_)));
        assert!(drain(&mut operator).is_empty());

        hub.update_location("drv-1", GeoPoint::new(-8.65, 115.21), Some(90.0), Some(30.0))
            .await
            .unwrap();
        let events = drain(&mut operator);
        assert!(matches!(
            events.as_slice(),
            [OutboundEvent::DriverLocation { driver_id, .. }] if driver_id == "drv-1"
        ));
    }

    #[tokio::test]
    async fn test_matcher_sees_only_idle_positioned_sessions() {
        let hub = hub();
        let pickup = GeoPoint::new(-8.65, 115.21);
        for (id, km) in [("drv-a", 1.0), ("drv-b", 4.0), ("drv-c", 9.0)] {
            hub.register_driver(profile(id, "veh", VehicleClass::Standard)).await;
            hub.update_location(id, north_of(&pickup, km), None, None).await.unwrap();
        }
        hub.register_driver(profile("drv-nowhere", "veh", VehicleClass::Standard)).await;

        let found = hub.eligible_drivers(VehicleClass::Standard, &pickup, 5.0).await;
        let ids: Vec<_> = found.iter().map(|m| m.driver_id.as_str()).collect();
        assert_eq!(ids, vec!["drv-a", "drv-b"]);

        hub.mark_driver_order("drv-a", Some("ord-1")).await;
        let found = hub.eligible_drivers(VehicleClass::Standard, &pickup, 5.0).await;
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].driver_id, "drv-b");
    }

    #[tokio::test]
    async fn test_disconnect_mid_order_notifies_operators() {
        let hub = hub();
        let (_op, mut operator) = hub.register_operator("op-1").await;
        let (session, _driver) = hub
            .register_driver(profile("drv-1", "veh-1", VehicleClass::Standard))
            .await;
        hub.mark_driver_order("drv-1", Some("ord-7")).await;
        drain(&mut operator);

        // A stale session id must not evict the live one
        hub.unregister_driver("drv-1", "ses-000000-stale").await;
        assert!(hub.is_driver_connected("drv-1").await);

        hub.unregister_driver("drv-1", &session).await;
        let events = drain(&mut operator);
        assert!(matches!(
            events.as_slice(),
            [OutboundEvent::DriverDisconnected { current_order_id: Some(order), .. }] if order == "ord-7"
        ));
        assert_eq!(hub.counts().await.drivers, 0);
    }

    #[tokio::test]
    async fn test_cannot_go_idle_while_on_order() {
        let hub = hub();
        hub.register_driver(profile("drv-1", "veh-1", VehicleClass::Standard)).await;
        hub.mark_driver_order("drv-1", Some("ord-1")).await;

        let err = hub.set_availability("drv-1", Availability::Idle).await.unwrap_err();
        assert!(matches!(err, DispatchError::PreconditionFailed(_)));
        assert_eq!(hub.counts().await.idle_drivers, 0);
    }

    #[tokio::test]
    async fn test_emergency_reaches_every_operator() {
        let hub = hub();
        let (_a, mut first) = hub.register_operator("op-1").await;
        let (_b, mut second) = hub.register_operator("op-2").await;
        hub.register_driver(profile("drv-1", "veh-1", VehicleClass::Standard)).await;
        drain(&mut first);
        drain(&mut second);

        let reached = hub
            .emergency("drv-1", Some("ord-1".into()), Some("accident".into()), None)
            .await;
        assert_eq!(reached, 2);
        for rx in [&mut first, &mut second] {
            assert!(matches!(
                drain(rx).as_slice(),
                [OutboundEvent::Emergency { driver_id, .. }] if driver_id == "drv-1"
            ));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_pings_only_quiet_sessions() {
        let hub = hub();
        let (op_session, mut operator) = hub.register_operator("op-1").await;
        let (_s, mut driver) = hub
            .register_driver(profile("drv-1", "veh-1", VehicleClass::Standard))
            .await;
        drain(&mut operator);

        tokio::time::advance(Duration::from_secs(301)).await;
        hub.touch(&op_session).await;
        let counts = hub.heartbeat_tick().await;
        assert_eq!((counts.drivers, counts.operators), (1, 1));

        assert!(matches!(drain(&mut driver).as_slice(), [OutboundEvent::Ping { .. }]));
        assert!(matches!(
            drain(&mut operator).as_slice(),
            [OutboundEvent::Heartbeat { .. }]
        ));
    }

    #[tokio::test]
    async fn test_heartbeat_prunes_closed_sessions() {
        let hub = hub();
        let (_s, driver) = hub
            .register_driver(profile("drv-1", "veh-1", VehicleClass::Standard))
            .await;
        drop(driver);

        let counts = hub.heartbeat_tick().await;
        assert_eq!(counts.drivers, 0);
        assert!(hub.active_sessions().await.is_empty());
    }

    #[tokio::test]
    async fn test_pruned_driver_is_reported_to_operators() {
        let hub = hub();
        let (_op, mut operator) = hub.register_operator("op-1").await;
        let (_s, driver) = hub
            .register_driver(profile("drv-1", "veh-1", VehicleClass::Standard))
            .await;
        hub.mark_driver_order("drv-1", Some("ord-9")).await;
        drain(&mut operator);
        drop(driver);

        hub.heartbeat_tick().await;
        let events = drain(&mut operator);
        assert!(matches!(
            events.as_slice(),
            [
                OutboundEvent::DriverDisconnected { driver_id, current_order_id: Some(order) },
                OutboundEvent::Heartbeat { .. },
            ] if driver_id == "drv-1" && order == "ord-9"
        ));
    }
}
