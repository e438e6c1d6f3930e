// src/services/redis_store.rs
use async_trait::async_trait;
use chrono::NaiveDate;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, RedisResult, Script};
use serde::{de::DeserializeOwned, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing;

use crate::{
    errors::{DispatchError, DispatchResult},
    models::{
        ledger_key, Driver, OperationalFee, Order, OrderStatusHistory, Transaction, TransactionType,
        Vehicle, Wallet,
    },
    services::store::{CommitOutcome, DispatchStore, TransitionCommit, WalletMutation},
};

// Day counters outlive their day by one so late reads still resolve
const SEQUENCE_TTL_SECS: usize = 2 * 24 * 60 * 60;

mod keys {
    use chrono::NaiveDate;

    pub fn sequence(day: NaiveDate) -> String {
        format!("orders:seq:{}", day.format("%Y%m%d"))
    }

    pub fn order(id: &str) -> String {
        format!("order:{}", id)
    }

    pub fn order_history(id: &str) -> String {
        format!("order:{}:history", id)
    }

    pub fn order_fee(id: &str) -> String {
        format!("order:{}:fee", id)
    }

    pub fn driver(id: &str) -> String {
        format!("driver:{}", id)
    }

    pub fn vehicle(id: &str) -> String {
        format!("vehicle:{}", id)
    }

    pub fn wallet(user_id: &str) -> String {
        format!("wallet:{}", user_id)
    }

    pub fn wallet_transactions(user_id: &str) -> String {
        format!("wallet:{}:transactions", user_id)
    }

    /// Takes a `ledger_key`, already scoped by wallet and kind
    pub fn transaction_key(ledger_key: &str) -> String {
        format!("txkey:{}", ledger_key)
    }
}

const INSERT_ORDER: &str = r#"
    if redis.call("EXISTS", KEYS[1]) == 1 then
        return {"exists"}
    end
    redis.call("SET", KEYS[1], ARGV[1])
    redis.call("RPUSH", KEYS[2], ARGV[2])
    return {"ok"}
"#;

// KEYS: order, history, driver  ARGV: expected status, order, history row,
// driver ("" for none), require idle ("1"/"0")
const COMMIT_TRANSITION: &str = r#"
    local raw = redis.call("GET", KEYS[1])
    if not raw then
        return {"missing"}
    end
    local stored = cjson.decode(raw)["status"]
    if stored ~= ARGV[1] then
        return {"status", stored}
    end
    if ARGV[4] ~= "" then
        if ARGV[5] == "1" then
            local current = redis.call("GET", KEYS[3])
            if current then
                local order_id = cjson.decode(current)["current_order_id"]
                if order_id ~= nil and order_id ~= cjson.null then
                    return {"busy"}
                end
            end
        end
        redis.call("SET", KEYS[3], ARGV[4])
    end
    redis.call("SET", KEYS[1], ARGV[2])
    redis.call("RPUSH", KEYS[2], ARGV[3])
    return {"ok"}
"#;

// KEYS: idempotency key, wallet, wallet transactions, order, order fee
// ARGV: expected version, wallet, transaction, fee ("" for none)
const COMMIT_WALLET: &str = r#"
    local existing = redis.call("GET", KEYS[1])
    if existing then
        return {"replayed", existing}
    end
    local version = 0
    local raw = redis.call("GET", KEYS[2])
    if raw then
        version = tonumber(cjson.decode(raw)["version"])
    end
    if version ~= tonumber(ARGV[1]) then
        return {"conflict", tostring(version)}
    end
    if ARGV[4] ~= "" then
        if redis.call("EXISTS", KEYS[4]) == 0 then
            return {"missing_order"}
        end
        redis.call("SET", KEYS[5], ARGV[4])
    end
    redis.call("SET", KEYS[1], ARGV[3])
    redis.call("RPUSH", KEYS[3], ARGV[3])
    redis.call("SET", KEYS[2], ARGV[2])
    return {"applied"}
"#;

/// JSON documents in Redis; multi-key writes run as Lua scripts
pub struct RedisStore {
    conn: MultiplexedConnection,
    timeout: Duration,
    insert_order: Script,
    commit_transition: Script,
    commit_wallet: Script,
}

impl RedisStore {
    pub async fn connect(redis_url: &str, timeout: Duration) -> DispatchResult<Self> {
        let client = redis::Client::open(redis_url)?;
        let conn = tokio::time::timeout(timeout, client.get_multiplexed_tokio_connection()).await??;
        tracing::info!("Connected to Redis store");

        Ok(Self {
            conn,
            timeout,
            insert_order: Script::new(INSERT_ORDER),
            commit_transition: Script::new(COMMIT_TRANSITION),
            commit_wallet: Script::new(COMMIT_WALLET),
        })
    }

    /// Bounds one round-trip by the store timeout
    async fn bounded<T, F>(&self, op: F) -> DispatchResult<T>
    where
        F: Future<Output = RedisResult<T>>,
    {
        Ok(tokio::time::timeout(self.timeout, op).await??)
    }

    async fn get_json<T: DeserializeOwned>(&self, key: &str) -> DispatchResult<Option<T>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = self.bounded(conn.get(key)).await?;
        raw.map(|s| serde_json::from_str(&s)).transpose().map_err(Into::into)
    }

    async fn put_json<T: Serialize>(&self, key: &str, value: &T) -> DispatchResult<()> {
        let mut conn = self.conn.clone();
        let raw = serde_json::to_string(value)?;
        self.bounded(conn.set::<_, _, ()>(key, raw)).await
    }

    async fn list_json<T: DeserializeOwned>(&self, key: &str) -> DispatchResult<Vec<T>> {
        let mut conn = self.conn.clone();
        let rows: Vec<String> = self.bounded(conn.lrange(key, 0, -1)).await?;
        rows.iter()
            .map(|row| serde_json::from_str(row).map_err(Into::into))
            .collect()
    }
}

fn transition_reply(reply: &[String], commit: &TransitionCommit) -> DispatchResult<()> {
    match reply.first().map(String::as_str) {
        Some("ok") => Ok(()),
        Some("missing") => Err(DispatchError::order_not_found(&commit.order.id)),
        Some("status") => Err(DispatchError::InvalidTransition {
            from: reply.get(1).cloned().unwrap_or_default(),
            to: commit.order.status.to_string(),
        }),
        Some("busy") => Err(DispatchError::precondition(format!(
            "driver {} is busy with another order",
            commit.driver.as_ref().map(|d| d.id.as_str()).unwrap_or_default()
        ))),
        other => Err(DispatchError::Store(format!("unexpected transition reply {:?}", other))),
    }
}

fn wallet_reply(reply: &[String], mutation: &WalletMutation) -> DispatchResult<CommitOutcome> {
    match reply.first().map(String::as_str) {
        Some("applied") => Ok(CommitOutcome::Applied),
        Some("replayed") => {
            let raw = reply
                .get(1)
                .ok_or_else(|| DispatchError::Store("replayed reply without transaction".to_string()))?;
            Ok(CommitOutcome::AlreadyApplied(serde_json::from_str(raw)?))
        }
        Some("conflict") => Err(DispatchError::ConcurrencyConflict(format!(
            "wallet {} is at version {}, expected {}",
            mutation.wallet.user_id,
            reply.get(1).map(String::as_str).unwrap_or("?"),
            mutation.expected_version
        ))),
        Some("missing_order") => {
            let order_id = mutation.order_fee.as_ref().map(|(id, _)| id.as_str()).unwrap_or_default();
            Err(DispatchError::order_not_found(order_id))
        }
        other => Err(DispatchError::Store(format!("unexpected wallet reply {:?}", other))),
    }
}

#[async_trait]
impl DispatchStore for RedisStore {
    async fn next_order_sequence(&self, day: NaiveDate) -> DispatchResult<u64> {
        let key = keys::sequence(day);
        let mut conn = self.conn.clone();
        let (sequence,): (u64,) = self
            .bounded(
                redis::pipe()
                    .atomic()
                    .incr(&key, 1)
                    .expire(&key, SEQUENCE_TTL_SECS)
                    .ignore()
                    .query_async(&mut conn),
            )
            .await?;
        Ok(sequence)
    }

    async fn insert_order(&self, order: &Order, history: &OrderStatusHistory) -> DispatchResult<()> {
        let mut conn = self.conn.clone();
        let mut invocation = self.insert_order.prepare_invoke();
        invocation
            .key(keys::order(&order.id))
            .key(keys::order_history(&order.id))
            .arg(serde_json::to_string(order)?)
            .arg(serde_json::to_string(history)?);

        let reply: Vec<String> = self.bounded(invocation.invoke_async(&mut conn)).await?;
        match reply.first().map(String::as_str) {
            Some("ok") => Ok(()),
            Some("exists") => Err(DispatchError::Duplicate { entity: "Order", id: order.id.clone() }),
            other => Err(DispatchError::Store(format!("unexpected insert reply {:?}", other))),
        }
    }

    async fn get_order(&self, order_id: &str) -> DispatchResult<Option<Order>> {
        let mut conn = self.conn.clone();
        let (raw, fee): (Option<String>, Option<String>) = self
            .bounded(
                redis::cmd("MGET")
                    .arg(keys::order(order_id))
                    .arg(keys::order_fee(order_id))
                    .query_async(&mut conn),
            )
            .await?;

        let Some(raw) = raw else {
            return Ok(None);
        };
        let mut order: Order = serde_json::from_str(&raw)?;
        if let Some(fee) = fee {
            order.operational_fee = serde_json::from_str(&fee)?;
        }
        Ok(Some(order))
    }

    async fn order_history(&self, order_id: &str) -> DispatchResult<Vec<OrderStatusHistory>> {
        self.list_json(&keys::order_history(order_id)).await
    }

    async fn commit_transition(&self, commit: TransitionCommit) -> DispatchResult<()> {
        let order_key = keys::order(&commit.order.id);
        let (driver_key, driver_json) = match &commit.driver {
            Some(driver) => (keys::driver(&driver.id), serde_json::to_string(driver)?),
            None => (order_key.clone(), String::new()),
        };

        let mut conn = self.conn.clone();
        let mut invocation = self.commit_transition.prepare_invoke();
        invocation
            .key(&order_key)
            .key(keys::order_history(&commit.order.id))
            .key(driver_key)
            .arg(commit.expected_status.as_str())
            .arg(serde_json::to_string(&commit.order)?)
            .arg(serde_json::to_string(&commit.history)?)
            .arg(driver_json)
            .arg(if commit.require_driver_idle { "1" } else { "0" });

        let reply: Vec<String> = self.bounded(invocation.invoke_async(&mut conn)).await?;
        transition_reply(&reply, &commit)
    }

    async fn set_operational_fee(&self, order_id: &str, fee: &OperationalFee) -> DispatchResult<()> {
        let mut conn = self.conn.clone();
        let exists: bool = self.bounded(conn.exists(keys::order(order_id))).await?;
        if !exists {
            return Err(DispatchError::order_not_found(order_id));
        }
        self.put_json(&keys::order_fee(order_id), fee).await
    }

    async fn get_driver(&self, driver_id: &str) -> DispatchResult<Option<Driver>> {
        self.get_json(&keys::driver(driver_id)).await
    }

    async fn put_driver(&self, driver: &Driver) -> DispatchResult<()> {
        self.put_json(&keys::driver(&driver.id), driver).await
    }

    async fn get_vehicle(&self, vehicle_id: &str) -> DispatchResult<Option<Vehicle>> {
        self.get_json(&keys::vehicle(vehicle_id)).await
    }

    async fn put_vehicle(&self, vehicle: &Vehicle) -> DispatchResult<()> {
        self.put_json(&keys::vehicle(&vehicle.id), vehicle).await
    }

    async fn get_wallet(&self, user_id: &str) -> DispatchResult<Option<Wallet>> {
        self.get_json(&keys::wallet(user_id)).await
    }

    async fn put_wallet(&self, wallet: &Wallet) -> DispatchResult<()> {
        self.put_json(&keys::wallet(&wallet.user_id), wallet).await
    }

    async fn wallet_transactions(&self, user_id: &str) -> DispatchResult<Vec<Transaction>> {
        self.list_json(&keys::wallet_transactions(user_id)).await
    }

    async fn transaction_by_key(
        &self,
        user_id: &str,
        transaction_type: TransactionType,
        idempotency_key: &str,
    ) -> DispatchResult<Option<Transaction>> {
        let key = ledger_key(user_id, transaction_type, idempotency_key);
        self.get_json(&keys::transaction_key(&key)).await
    }

    async fn commit_wallet_mutation(&self, mutation: WalletMutation) -> DispatchResult<CommitOutcome> {
        let user_id = &mutation.wallet.user_id;
        let (order_id, fee_json) = match &mutation.order_fee {
            Some((order_id, fee)) => (order_id.as_str(), serde_json::to_string(fee)?),
            None => ("", String::new()),
        };

        let mut conn = self.conn.clone();
        let mut invocation = self.commit_wallet.prepare_invoke();
        invocation
            .key(keys::transaction_key(&mutation.transaction.ledger_key()))
            .key(keys::wallet(user_id))
            .key(keys::wallet_transactions(user_id))
            .key(keys::order(order_id))
            .key(keys::order_fee(order_id))
            .arg(mutation.expected_version)
            .arg(serde_json::to_string(&mutation.wallet)?)
            .arg(serde_json::to_string(&mutation.transaction)?)
            .arg(fee_json);

        let reply: Vec<String> = self.bounded(invocation.invoke_async(&mut conn)).await?;
        wallet_reply(&reply, &mutation)
    }
}
