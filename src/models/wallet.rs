// src/models/wallet.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Wallet {
    pub user_id: String,
    pub balance: i64,                // Coins
    pub total_topup: i64,
    pub total_spent: i64,
    pub total_operational_fees: i64,
    pub version: u64,                // Bumped once per committed mutation
    pub is_frozen: bool,
    pub updated_at: DateTime<Utc>,
}

impl Wallet {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            balance: 0,
            total_topup: 0,
            total_spent: 0,
            total_operational_fees: 0,
            version: 0,
            is_frozen: false,
            updated_at: Utc::now(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionType {
    TopUp,
    OperationalFee,
    ManualAdjustment,
}

impl TransactionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionType::TopUp => "TOP_UP",
            TransactionType::OperationalFee => "OPERATIONAL_FEE",
            TransactionType::ManualAdjustment => "MANUAL_ADJUSTMENT",
        }
    }
}

/// Idempotency keys are unique per wallet and movement kind, never globally
pub fn ledger_key(user_id: &str, transaction_type: TransactionType, idempotency_key: &str) -> String {
    format!("{}:{}:{}", user_id, transaction_type.as_str(), idempotency_key)
}

/// One immutable ledger movement
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Transaction {
    pub id: String,
    pub user_id: String,
    pub transaction_type: TransactionType,
    pub amount: i64, // Signed: negative for debits
    pub balance_before: i64,
    pub balance_after: i64,
    pub order_id: Option<String>,
    pub idempotency_key: String,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Transaction {
    pub fn ledger_key(&self) -> String {
        ledger_key(&self.user_id, self.transaction_type, &self.idempotency_key)
    }
}

/// Result of a fee deduction as seen by the caller
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct FeeReceipt {
    pub transaction_id: String,
    pub fee: i64,
    pub new_balance: i64,
    pub replayed: bool, // True when the same order was charged before
}

/// One band of the operational fee schedule
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub struct FeeTier {
    /// Inclusive upper bound; `None` covers everything above the previous band
    pub max_distance_meters: Option<u32>,
    pub percent: u32,
}

/// Distance-tiered fee percentages, ordered by breakpoint
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct FeeSchedule {
    pub tiers: Vec<FeeTier>,
    pub minor_units_per_coin: i64,
}

impl FeeSchedule {
    pub fn percent_for(&self, distance_meters: u32) -> u32 {
        self.tiers
            .iter()
            .find(|tier| tier.max_distance_meters.is_none_or(|max| distance_meters <= max))
            .or_else(|| self.tiers.last())
            .map(|tier| tier.percent)
            .unwrap_or(0)
    }

    /// Fee in coins, rounded up so a non-zero fare never yields a zero fee.
    /// Computed in `i128` and saturated, so absurd fares cannot wrap.
    pub fn fee_for(&self, base_fare: i64, distance_fare: i64, distance_meters: u32) -> i64 {
        let fare = (base_fare as i128 + distance_fare as i128).max(0);
        let percent = self.percent_for(distance_meters) as i128;
        let divisor = 100 * self.minor_units_per_coin.max(1) as i128;
        let fee = (fare * percent + divisor - 1) / divisor;
        i64::try_from(fee).unwrap_or(i64::MAX)
    }
}

impl Default for FeeSchedule {
    fn default() -> Self {
        Self {
            tiers: vec![
                FeeTier { max_distance_meters: Some(3_000), percent: 5 },
                FeeTier { max_distance_meters: Some(10_000), percent: 8 },
                FeeTier { max_distance_meters: None, percent: 10 },
            ],
            minor_units_per_coin: 100,
        }
    }
}
