// src/services/store.rs
use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use std::collections::HashMap;
use tokio::sync::Mutex;

use crate::{
    errors::{DispatchError, DispatchResult},
    models::{
        ledger_key, Driver, OperationalFee, Order, OrderStatus, OrderStatusHistory, Transaction,
        TransactionType, Vehicle, Wallet,
    },
};

/// One guarded order transition, written all or nothing
#[derive(Debug, Clone)]
pub struct TransitionCommit {
    pub order: Order,
    /// Status the stored order must still be in
    pub expected_status: OrderStatus,
    pub history: OrderStatusHistory,
    pub driver: Option<Driver>,
    /// Refuse the commit if the stored driver already holds an order
    pub require_driver_idle: bool,
}

/// Versioned wallet write plus its ledger row
#[derive(Debug, Clone)]
pub struct WalletMutation {
    pub expected_version: u64,
    pub wallet: Wallet,
    pub transaction: Transaction,
    /// Order whose operational fee is annotated in the same commit
    pub order_fee: Option<(String, OperationalFee)>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CommitOutcome {
    Applied,
    /// The idempotency key was used before; nothing was written
    AlreadyApplied(Transaction),
}

#[async_trait]
pub trait DispatchStore: Send + Sync {
    async fn next_order_sequence(&self, day: NaiveDate) -> DispatchResult<u64>;
    /// `Duplicate` when the order id is already taken
    async fn insert_order(&self, order: &Order, history: &OrderStatusHistory) -> DispatchResult<()>;
    async fn get_order(&self, order_id: &str) -> DispatchResult<Option<Order>>;
    async fn order_history(&self, order_id: &str) -> DispatchResult<Vec<OrderStatusHistory>>;
    /// Writes status, driver and history; the stored operational fee is kept
    async fn commit_transition(&self, commit: TransitionCommit) -> DispatchResult<()>;
    async fn set_operational_fee(&self, order_id: &str, fee: &OperationalFee) -> DispatchResult<()>;

    async fn get_driver(&self, driver_id: &str) -> DispatchResult<Option<Driver>>;
    async fn put_driver(&self, driver: &Driver) -> DispatchResult<()>;
    async fn get_vehicle(&self, vehicle_id: &str) -> DispatchResult<Option<Vehicle>>;
    async fn put_vehicle(&self, vehicle: &Vehicle) -> DispatchResult<()>;

    async fn get_wallet(&self, user_id: &str) -> DispatchResult<Option<Wallet>>;
    async fn put_wallet(&self, wallet: &Wallet) -> DispatchResult<()>;
    async fn wallet_transactions(&self, user_id: &str) -> DispatchResult<Vec<Transaction>>;
    async fn transaction_by_key(
        &self,
        user_id: &str,
        transaction_type: TransactionType,
        idempotency_key: &str,
    ) -> DispatchResult<Option<Transaction>>;
    async fn commit_wallet_mutation(&self, mutation: WalletMutation) -> DispatchResult<CommitOutcome>;
}

#[derive(Default)]
struct Tables {
    sequences: HashMap<NaiveDate, u64>,
    orders: HashMap<String, Order>,
    history: HashMap<String, Vec<OrderStatusHistory>>,
    drivers: HashMap<String, Driver>,
    vehicles: HashMap<String, Vehicle>,
    wallets: HashMap<String, Wallet>,
    transactions: HashMap<String, Vec<Transaction>>,
    transactions_by_key: HashMap<String, Transaction>,
}

/// Every table behind one lock, so each call is serializable
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DispatchStore for MemoryStore {
    async fn next_order_sequence(&self, day: NaiveDate) -> DispatchResult<u64> {
        let mut tables = self.tables.lock().await;
        let seq = tables.sequences.entry(day).or_insert(0);
        *seq += 1;
        Ok(*seq)
    }

    async fn insert_order(&self, order: &Order, history: &OrderStatusHistory) -> DispatchResult<()> {
        let mut tables = self.tables.lock().await;
        if tables.orders.contains_key(&order.id) {
            return Err(DispatchError::Duplicate { entity: "Order", id: order.id.clone() });
        }
        tables.orders.insert(order.id.clone(), order.clone());
        tables.history.insert(order.id.clone(), vec![history.clone()]);
        Ok(())
    }

    async fn get_order(&self, order_id: &str) -> DispatchResult<Option<Order>> {
        Ok(self.tables.lock().await.orders.get(order_id).cloned())
    }

    async fn order_history(&self, order_id: &str) -> DispatchResult<Vec<OrderStatusHistory>> {
        Ok(self
            .tables
            .lock()
            .await
            .history
            .get(order_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn commit_transition(&self, commit: TransitionCommit) -> DispatchResult<()> {
        let mut tables = self.tables.lock().await;

        let stored = tables
            .orders
            .get(&commit.order.id)
            .ok_or_else(|| DispatchError::order_not_found(&commit.order.id))?;
        if stored.status != commit.expected_status {
            return Err(DispatchError::InvalidTransition {
                from: stored.status.to_string(),
                to: commit.order.status.to_string(),
            });
        }

        if let Some(driver) = &commit.driver {
            if commit.require_driver_idle {
                let busy = tables
                    .drivers
                    .get(&driver.id)
                    .is_some_and(|stored| stored.is_busy());
                if busy {
                    return Err(DispatchError::precondition(format!(
                        "driver {} is busy with another order",
                        driver.id
                    )));
                }
            }
            tables.drivers.insert(driver.id.clone(), driver.clone());
        }

        let mut order = commit.order;
        if let Some(stored) = tables.orders.get(&order.id) {
            order.operational_fee = stored.operational_fee.clone();
        }
        tables.history.entry(order.id.clone()).or_default().push(commit.history);
        tables.orders.insert(order.id.clone(), order);
        Ok(())
    }

    async fn set_operational_fee(&self, order_id: &str, fee: &OperationalFee) -> DispatchResult<()> {
        let mut tables = self.tables.lock().await;
        let order = tables
            .orders
            .get_mut(order_id)
            .ok_or_else(|| DispatchError::order_not_found(order_id))?;
        order.operational_fee = fee.clone();
        order.updated_at = Utc::now();
        Ok(())
    }

    async fn get_driver(&self, driver_id: &str) -> DispatchResult<Option<Driver>> {
        Ok(self.tables.lock().await.drivers.get(driver_id).cloned())
    }

    async fn put_driver(&self, driver: &Driver) -> DispatchResult<()> {
        self.tables.lock().await.drivers.insert(driver.id.clone(), driver.clone());
        Ok(())
    }

    async fn get_vehicle(&self, vehicle_id: &str) -> DispatchResult<Option<Vehicle>> {
        Ok(self.tables.lock().await.vehicles.get(vehicle_id).cloned())
    }

    async fn put_vehicle(&self, vehicle: &Vehicle) -> DispatchResult<()> {
        self.tables.lock().await.vehicles.insert(vehicle.id.clone(), vehicle.clone());
        Ok(())
    }

    async fn get_wallet(&self, user_id: &str) -> DispatchResult<Option<Wallet>> {
        Ok(self.tables.lock().await.wallets.get(user_id).cloned())
    }

    async fn put_wallet(&self, wallet: &Wallet) -> DispatchResult<()> {
        self.tables.lock().await.wallets.insert(wallet.user_id.clone(), wallet.clone());
        Ok(())
    }

    async fn wallet_transactions(&self, user_id: &str) -> DispatchResult<Vec<Transaction>> {
        Ok(self
            .tables
            .lock()
            .await
            .transactions
            .get(user_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn transaction_by_key(
        &self,
        user_id: &str,
        transaction_type: TransactionType,
        idempotency_key: &str,
    ) -> DispatchResult<Option<Transaction>> {
        let key = ledger_key(user_id, transaction_type, idempotency_key);
        Ok(self.tables.lock().await.transactions_by_key.get(&key).cloned())
    }

    async fn commit_wallet_mutation(&self, mutation: WalletMutation) -> DispatchResult<CommitOutcome> {
        let mut tables = self.tables.lock().await;

        let key = mutation.transaction.ledger_key();
        if let Some(existing) = tables.transactions_by_key.get(&key) {
            return Ok(CommitOutcome::AlreadyApplied(existing.clone()));
        }

        let current_version = tables
            .wallets
            .get(&mutation.wallet.user_id)
            .map(|w| w.version)
            .unwrap_or(0);
        if current_version != mutation.expected_version {
            return Err(DispatchError::ConcurrencyConflict(format!(
                "wallet {} is at version {}, expected {}",
                mutation.wallet.user_id, current_version, mutation.expected_version
            )));
        }

        if let Some((order_id, fee)) = &mutation.order_fee {
            let order = tables
                .orders
                .get_mut(order_id)
                .ok_or_else(|| DispatchError::order_not_found(order_id))?;
            order.operational_fee = fee.clone();
            order.updated_at = mutation.transaction.created_at;
        }

        let tx = mutation.transaction;
        tables.transactions_by_key.insert(key, tx.clone());
        tables.transactions.entry(tx.user_id.clone()).or_default().push(tx);
        tables
            .wallets
            .insert(mutation.wallet.user_id.clone(), mutation.wallet);
        Ok(CommitOutcome::Applied)
    }
}

#[cfg(test)]
pub mod fixtures {
    use chrono::Utc;

    use crate::models::*;
    use crate::utils::validation::fixtures::order_request;

    /// Pending order built from the standard request fixture
    pub fn order(id: &str) -> Order {
        let req = order_request();
        let now = Utc::now();
        Order {
            id: id.to_string(),
            order_number: "TX-20261019-0001".to_string(),
            trip_type: req.trip_type,
            passenger_name: req.passenger_name,
            passenger_phone: req.passenger_phone,
            pickup: req.pickup,
            dropoff: req.dropoff,
            vehicle_class: req.vehicle_class,
            distance_meters: req.distance_meters,
            estimated_duration_seconds: req.estimated_duration_seconds,
            actual_duration_seconds: None,
            fare: req.fare,
            payment_method: req.payment_method,
            payer_id: None,
            driver_id: None,
            vehicle_id: None,
            status: OrderStatus::Pending,
            timestamps: PhaseTimestamps::default(),
            operational_fee: OperationalFee::for_payer(None),
            scheduled_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn driver(id: &str, vehicle_id: &str) -> Driver {
        Driver {
            id: id.to_string(),
            full_name: format!("Driver {}", id),
            phone_number: "+62811000111".to_string(),
            is_active: true,
            is_verified: true,
            current_vehicle_id: Some(vehicle_id.to_string()),
            current_order_id: None,
            rating: 4.5,
            total_trips: 0,
            cancelled_trips: 0,
            updated_at: Utc::now(),
        }
    }

    pub fn vehicle(id: &str, class: VehicleClass) -> Vehicle {
        Vehicle {
            id: id.to_string(),
            license_plate: "DK 1234 AB".to_string(),
            vehicle_class: class,
            is_active: true,
        }
    }

    pub fn wallet(user_id: &str, balance: i64) -> Wallet {
        Wallet {
            balance,
            total_topup: balance,
            ..Wallet::new(user_id)
        }
    }
}
