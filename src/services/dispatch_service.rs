// src/services/dispatch_service.rs
use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use tracing;

use crate::{
    config::DispatchConfig,
    errors::{DispatchError, DispatchResult},
    models::{
        Actor, CreateOrderRequest, Driver, FeeStatus, OperationalFee, Order, OrderDecision,
        OrderStatus, OrderStatusHistory, OutboundEvent, PhaseTimestamps, TripPhase, TripType,
    },
    services::{
        acceptance_timer::AcceptanceTimers,
        geo_matcher::DriverMatch,
        realtime_service::{DriverProfile, RealtimeHub},
        store::{DispatchStore, TransitionCommit},
        wallet_service::WalletService,
    },
    utils::{
        id_generator::{IdGenerator, IdType},
        validation::validate_create_order,
    },
};

const MAX_ORDER_ID_ATTEMPTS: u32 = 3;

#[async_trait]
pub trait OrderOperations: Send + Sync {
    async fn create_order(&self, request: CreateOrderRequest, actor: Actor) -> DispatchResult<Order>;
    async fn get_order(&self, order_id: &str) -> DispatchResult<Order>;
    async fn order_history(&self, order_id: &str) -> DispatchResult<Vec<OrderStatusHistory>>;
    async fn assign_driver(
        &self,
        order_id: &str,
        driver_id: &str,
        vehicle_id: &str,
        reason: &str,
        actor: Actor,
    ) -> DispatchResult<Order>;
    async fn update_status(
        &self,
        order_id: &str,
        new_status: OrderStatus,
        reason: &str,
        actor: Actor,
        metadata: Option<serde_json::Value>,
    ) -> DispatchResult<Order>;
    async fn driver_response(
        &self,
        driver_id: &str,
        order_id: &str,
        decision: OrderDecision,
    ) -> DispatchResult<Order>;
    async fn trip_update(&self, driver_id: &str, order_id: &str, phase: TripPhase) -> DispatchResult<Order>;
    async fn expire_assignment(&self, order_id: &str);
}

/// Owns the order lifecycle: creation, assignment, and every status change
#[derive(Clone)]
pub struct DispatchService {
    store: Arc<dyn DispatchStore>,
    wallets: Arc<WalletService>,
    realtime: RealtimeHub,
    timers: AcceptanceTimers,
    config: Arc<DispatchConfig>,
}

impl DispatchService {
    pub fn new(
        store: Arc<dyn DispatchStore>,
        wallets: Arc<WalletService>,
        realtime: RealtimeHub,
        timers: AcceptanceTimers,
        config: DispatchConfig,
    ) -> Self {
        Self {
            store,
            wallets,
            realtime,
            timers,
            config: Arc::new(config),
        }
    }

    /// Session profile for a connecting driver
    pub async fn driver_profile(&self, driver_id: &str) -> DispatchResult<DriverProfile> {
        let driver = self.load_driver(driver_id).await?;
        if !driver.is_active {
            return Err(DispatchError::Forbidden(format!("driver {} is not active", driver_id)));
        }
        let vehicle = match &driver.current_vehicle_id {
            Some(vehicle_id) => self.store.get_vehicle(vehicle_id).await?,
            None => None,
        };

        Ok(DriverProfile {
            driver_id: driver.id,
            vehicle_id: vehicle.as_ref().map(|v| v.id.clone()),
            vehicle_class: vehicle.filter(|v| v.is_active).map(|v| v.vehicle_class),
            rating: driver.rating,
            current_order_id: driver.current_order_id,
        })
    }

    async fn load_driver(&self, driver_id: &str) -> DispatchResult<Driver> {
        self.store
            .get_driver(driver_id)
            .await?
            .ok_or_else(|| DispatchError::driver_not_found(driver_id))
    }

    fn history_row(
        order: &Order,
        from: Option<OrderStatus>,
        reason: &str,
        actor: Actor,
        metadata: Option<serde_json::Value>,
    ) -> OrderStatusHistory {
        OrderStatusHistory {
            id: IdGenerator::generate(IdType::History),
            order_id: order.id.clone(),
            from_status: from,
            to_status: order.status,
            reason: reason.to_string(),
            actor,
            metadata,
            created_at: order.updated_at,
        }
    }

    /// Offer a fresh order to nearby idle drivers, or park it when nobody fits
    async fn offer_order(&self, order: Order) -> DispatchResult<Order> {
        let matches = self
            .realtime
            .eligible_drivers(order.vehicle_class, &order.pickup.location, self.config.match_radius_km)
            .await;

        if matches.is_empty() {
            tracing::info!("No eligible drivers for order {}", order.order_number);
            return self
                .update_status(
                    &order.id,
                    OrderStatus::NoDriverAvailable,
                    "no eligible drivers",
                    Actor::System,
                    None,
                )
                .await;
        }

        let mut delivered = 0;
        for DriverMatch { driver_id, distance_km, .. } in &matches {
            let event = OutboundEvent::OrderAvailable {
                order: Box::new(order.clone()),
                distance_km: *distance_km,
            };
            if self.realtime.send_to_driver(driver_id, event).await {
                delivered += 1;
            }
        }
        tracing::info!(
            "Order {} offered to {} of {} eligible drivers",
            order.order_number,
            delivered,
            matches.len()
        );
        Ok(order)
    }

    /// Charge the payer once; a second conflict marks the fee failed instead
    /// of undoing the assignment
    async fn charge_fee(&self, order: &Order) {
        let Some(payer_id) = order.payer_id.as_deref() else {
            return;
        };

        let mut retries = 0;
        loop {
            let result = self
                .wallets
                .deduct_operational_fee(
                    payer_id,
                    &order.id,
                    order.fare.base_fare,
                    order.fare.distance_fare,
                    order.distance_meters,
                )
                .await;

            match result {
                Ok(receipt) => {
                    if receipt.replayed {
                        tracing::debug!("Fee for {} was already charged", order.order_number);
                    }
                    return;
                }
                Err(DispatchError::ConcurrencyConflict(msg)) if retries < self.config.fee_retry_limit => {
                    retries += 1;
                    tracing::debug!("Retrying fee for {} after conflict: {}", order.order_number, msg);
                }
                Err(e) => {
                    tracing::warn!(
                        "Operational fee for order {} failed, needs reconciliation: {}",
                        order.order_number,
                        e
                    );
                    let failed = OperationalFee {
                        status: FeeStatus::Failed,
                        amount: Some(self.wallets.anticipated_fee(
                            order.fare.base_fare,
                            order.fare.distance_fare,
                            order.distance_meters,
                        )),
                        transaction_id: None,
                    };
                    if let Err(e) = self.store.set_operational_fee(&order.id, &failed).await {
                        tracing::error!("Could not mark fee failed on {}: {}", order.order_number, e);
                    }
                    return;
                }
            }
        }
    }

    async fn arm_acceptance_timer(&self, order_id: &str) {
        let engine = self.clone();
        let id = order_id.to_string();
        self.timers
            .arm(order_id, self.config.acceptance_timeout, move || async move {
                engine.expire_assignment(&id).await;
            })
            .await;
    }

    fn ensure_assigned_to(order: &Order, driver_id: &str) -> DispatchResult<()> {
        if order.driver_id.as_deref() == Some(driver_id) {
            Ok(())
        } else {
            Err(DispatchError::Forbidden(format!(
                "order {} is not assigned to driver {}",
                order.order_number, driver_id
            )))
        }
    }
}

#[async_trait]
impl OrderOperations for DispatchService {
    async fn create_order(&self, request: CreateOrderRequest, actor: Actor) -> DispatchResult<Order> {
        validate_create_order(&request, &self.config.service_region, self.config.fare_tolerance)?;

        if let Some(payer_id) = &request.payer_id {
            let fee = self.wallets.anticipated_fee(
                request.fare.base_fare,
                request.fare.distance_fare,
                request.distance_meters,
            );
            self.wallets.ensure_can_cover(payer_id, fee).await?;
        }

        let now = Utc::now();
        let sequence = self.store.next_order_sequence(now.date_naive()).await?;
        let mut order = Order {
            id: IdGenerator::generate(IdType::Order),
            order_number: IdGenerator::order_number(now.date_naive(), sequence),
            trip_type: request.trip_type,
            passenger_name: request.passenger_name.trim().to_string(),
            passenger_phone: request.passenger_phone.trim().to_string(),
            pickup: request.pickup,
            dropoff: request.dropoff,
            vehicle_class: request.vehicle_class,
            distance_meters: request.distance_meters,
            estimated_duration_seconds: request.estimated_duration_seconds,
            actual_duration_seconds: None,
            fare: request.fare,
            payment_method: request.payment_method,
            operational_fee: OperationalFee::for_payer(request.payer_id.as_deref()),
            payer_id: request.payer_id,
            driver_id: None,
            vehicle_id: None,
            status: OrderStatus::Pending,
            timestamps: PhaseTimestamps::default(),
            scheduled_at: request.scheduled_at,
            created_at: now,
            updated_at: now,
        };

        // The order number is already drawn; only the id is retried
        let mut attempt = 1;
        loop {
            let history = Self::history_row(&order, None, "order created", actor.clone(), None);
            match self.store.insert_order(&order, &history).await {
                Ok(()) => break,
                Err(DispatchError::Duplicate { id, .. }) if attempt < MAX_ORDER_ID_ATTEMPTS => {
                    tracing::warn!("Order id {} already taken, drawing another", id);
                    attempt += 1;
                    order.id = IdGenerator::generate(IdType::Order);
                }
                Err(e) => return Err(e),
            }
        }
        tracing::info!(
            "Created order {} ({}) for {}, {} class",
            order.order_number,
            order.id,
            order.passenger_name,
            order.vehicle_class
        );

        if let (Some(driver_id), Some(vehicle_id)) = (&request.driver_id, &request.vehicle_id) {
            match self
                .assign_driver(&order.id, driver_id, vehicle_id, "pre-selected at creation", actor)
                .await
            {
                Ok(assigned) => return Ok(assigned),
                Err(e) => tracing::warn!(
                    "Pre-selected driver {} not assigned to {}: {}",
                    driver_id,
                    order.order_number,
                    e
                ),
            }
        }

        if order.trip_type == TripType::Scheduled {
            // Left pending for an operator to assign closer to pickup time
            return Ok(order);
        }
        self.offer_order(order).await
    }

    async fn get_order(&self, order_id: &str) -> DispatchResult<Order> {
        self.store
            .get_order(order_id)
            .await?
            .ok_or_else(|| DispatchError::order_not_found(order_id))
    }

    async fn order_history(&self, order_id: &str) -> DispatchResult<Vec<OrderStatusHistory>> {
        self.get_order(order_id).await?;
        self.store.order_history(order_id).await
    }

    async fn assign_driver(
        &self,
        order_id: &str,
        driver_id: &str,
        vehicle_id: &str,
        reason: &str,
        actor: Actor,
    ) -> DispatchResult<Order> {
        let order = self.get_order(order_id).await?;
        if !order.status.is_assignable() {
            return Err(DispatchError::precondition(format!(
                "order {} is {} and cannot take a driver",
                order.order_number, order.status
            )));
        }

        let driver = self.load_driver(driver_id).await?;
        let vehicle = self
            .store
            .get_vehicle(vehicle_id)
            .await?
            .ok_or_else(|| DispatchError::vehicle_not_found(vehicle_id))?;

        if !driver.is_active || !driver.is_verified {
            return Err(DispatchError::precondition(format!(
                "driver {} is not active and verified",
                driver_id
            )));
        }
        if driver.current_vehicle_id.as_deref() != Some(vehicle_id) {
            return Err(DispatchError::precondition(format!(
                "driver {} is not bound to vehicle {}",
                driver_id, vehicle_id
            )));
        }
        if driver.is_busy() {
            return Err(DispatchError::precondition(format!(
                "driver {} is busy with another order",
                driver_id
            )));
        }
        if !vehicle.is_active {
            return Err(DispatchError::precondition(format!("vehicle {} is not active", vehicle_id)));
        }
        if vehicle.vehicle_class != order.vehicle_class {
            return Err(DispatchError::precondition(format!(
                "vehicle {} is {}, order needs {}",
                vehicle_id, vehicle.vehicle_class, order.vehicle_class
            )));
        }

        let now = Utc::now();
        let mut next = order.clone();
        next.status = OrderStatus::DriverAssigned;
        next.driver_id = Some(driver_id.to_string());
        next.vehicle_id = Some(vehicle_id.to_string());
        next.stamp_phase(OrderStatus::DriverAssigned, now);

        let mut busy = driver;
        busy.current_order_id = Some(order.id.clone());
        busy.updated_at = now;

        let metadata = json!({ "driver_id": driver_id, "vehicle_id": vehicle_id });
        self.store
            .commit_transition(TransitionCommit {
                history: Self::history_row(&next, Some(order.status), reason, actor, Some(metadata)),
                order: next.clone(),
                expected_status: order.status,
                driver: Some(busy),
                require_driver_idle: true,
            })
            .await?;
        tracing::info!("Assigned driver {} to order {}", driver_id, next.order_number);

        self.realtime.mark_driver_order(driver_id, Some(&next.id)).await;
        self.charge_fee(&next).await;
        let next = self.get_order(&next.id).await?;

        let pushed = self
            .realtime
            .send_to_driver(
                driver_id,
                OutboundEvent::NewAssignment {
                    order: Box::new(next.clone()),
                    respond_within_seconds: self.config.acceptance_timeout.as_secs(),
                },
            )
            .await;
        if !pushed {
            tracing::warn!("Driver {} is offline; assignment for {} not pushed", driver_id, next.order_number);
        }

        self.realtime
            .broadcast_operators(OutboundEvent::OrderStatusUpdated {
                order_id: next.id.clone(),
                order_number: next.order_number.clone(),
                from: order.status,
                to: next.status,
                driver_id: next.driver_id.clone(),
                reason: reason.to_string(),
            })
            .await;

        self.arm_acceptance_timer(&next.id).await;
        Ok(next)
    }

    async fn update_status(
        &self,
        order_id: &str,
        new_status: OrderStatus,
        reason: &str,
        actor: Actor,
        metadata: Option<serde_json::Value>,
    ) -> DispatchResult<Order> {
        let order = self.get_order(order_id).await?;
        if !order.status.can_transition_to(new_status) {
            return Err(DispatchError::InvalidTransition {
                from: order.status.to_string(),
                to: new_status.to_string(),
            });
        }
        if new_status == OrderStatus::DriverAssigned {
            return Err(DispatchError::precondition(
                "drivers are assigned through the assignment operation",
            ));
        }

        let now = Utc::now();
        let mut next = order.clone();
        next.status = new_status;
        next.stamp_phase(new_status, now);

        let mut released = None;
        let driver = match order.driver_id.as_deref() {
            Some(driver_id) => {
                let mut driver = self.load_driver(driver_id).await?;
                match new_status {
                    OrderStatus::Completed => driver.total_trips += 1,
                    OrderStatus::CancelledByDriver => driver.cancelled_trips += 1,
                    _ => {}
                }
                if new_status.releases_driver()
                    && driver.current_order_id.as_deref() == Some(order.id.as_str())
                {
                    driver.release(now);
                    released = Some(driver.id.clone());
                }
                Some(driver)
            }
            None => None,
        };
        if new_status == OrderStatus::Expired {
            next.driver_id = None;
            next.vehicle_id = None;
        }

        self.store
            .commit_transition(TransitionCommit {
                history: Self::history_row(&next, Some(order.status), reason, actor.clone(), metadata),
                order: next.clone(),
                expected_status: order.status,
                driver,
                require_driver_idle: false,
            })
            .await?;

        if order.status == OrderStatus::DriverAssigned {
            self.timers.cancel(&order.id).await;
        }
        if let Some(driver_id) = &released {
            self.realtime.mark_driver_order(driver_id, None).await;
        }

        if new_status == OrderStatus::Expired {
            tracing::info!("Order {} expired: {}", next.order_number, reason);
        } else {
            tracing::info!(
                "Order {} {} -> {} by {}: {}",
                next.order_number,
                order.status,
                new_status,
                actor,
                reason
            );
        }

        let event = OutboundEvent::OrderStatusUpdated {
            order_id: next.id.clone(),
            order_number: next.order_number.clone(),
            from: order.status,
            to: new_status,
            driver_id: order.driver_id.clone(),
            reason: reason.to_string(),
        };
        if let Some(driver_id) = &order.driver_id {
            self.realtime.send_to_driver(driver_id, event.clone()).await;
        }
        self.realtime.broadcast_operators(event).await;

        Ok(next)
    }

    async fn driver_response(
        &self,
        driver_id: &str,
        order_id: &str,
        decision: OrderDecision,
    ) -> DispatchResult<Order> {
        let order = self.get_order(order_id).await?;
        let actor = Actor::Driver(driver_id.to_string());

        match decision {
            OrderDecision::Accept
                if matches!(order.status, OrderStatus::Pending | OrderStatus::NoDriverAvailable) =>
            {
                // Claim of a broadcast offer
                let driver = self.load_driver(driver_id).await?;
                let vehicle_id = driver.current_vehicle_id.ok_or_else(|| {
                    DispatchError::precondition(format!("driver {} has no vehicle bound", driver_id))
                })?;
                self.assign_driver(order_id, driver_id, &vehicle_id, "claimed from offer", actor.clone())
                    .await?;
                self.update_status(order_id, OrderStatus::DriverAccepted, "accepted by driver", actor, None)
                    .await
            }
            OrderDecision::Accept => {
                Self::ensure_assigned_to(&order, driver_id)?;
                self.update_status(order_id, OrderStatus::DriverAccepted, "accepted by driver", actor, None)
                    .await
            }
            OrderDecision::Reject => {
                Self::ensure_assigned_to(&order, driver_id)?;
                self.update_status(order_id, OrderStatus::Expired, "rejected by driver", actor, None)
                    .await
            }
        }
    }

    async fn trip_update(&self, driver_id: &str, order_id: &str, phase: TripPhase) -> DispatchResult<Order> {
        let order = self.get_order(order_id).await?;
        Self::ensure_assigned_to(&order, driver_id)?;

        match phase.target_status() {
            Some(status) => {
                let reason = format!("driver reported {:?}", phase).to_lowercase();
                self.update_status(order_id, status, &reason, Actor::Driver(driver_id.to_string()), None)
                    .await
            }
            None => {
                self.realtime
                    .broadcast_operators(OutboundEvent::DriverArrived {
                        order_id: order.id.clone(),
                        driver_id: driver_id.to_string(),
                    })
                    .await;
                tracing::info!("Driver {} arrived at pickup for {}", driver_id, order.order_number);
                Ok(order)
            }
        }
    }

    async fn expire_assignment(&self, order_id: &str) {
        match self
            .update_status(order_id, OrderStatus::Expired, "no response", Actor::System, None)
            .await
        {
            Ok(_) => {}
            // The driver answered first
            Err(DispatchError::InvalidTransition { from, .. }) => {
                tracing::debug!("Acceptance timer for {} fired after {}; ignored", order_id, from);
            }
            Err(e) => tracing::error!("Could not expire order {}: {}", order_id, e),
        }
    }
}
