// src/services/wallet_service.rs
use chrono::Utc;
use std::sync::Arc;
use tracing;

use crate::{
    errors::{DispatchError, DispatchResult},
    models::{FeeReceipt, FeeSchedule, OperationalFee, Transaction, TransactionType, Wallet},
    services::store::{CommitOutcome, DispatchStore, WalletMutation},
    utils::id_generator::{IdGenerator, IdType, FEE_KEY_PREFIX},
};

// Attempts for top-ups and adjustments before a conflict is surfaced
const MAX_WALLET_ATTEMPTS: u32 = 3;

pub struct WalletService {
    store: Arc<dyn DispatchStore>,
    schedule: FeeSchedule,
}

impl WalletService {
    pub fn new(store: Arc<dyn DispatchStore>, schedule: FeeSchedule) -> Self {
        Self { store, schedule }
    }

    pub fn anticipated_fee(&self, base_fare: i64, distance_fare: i64, distance_meters: u32) -> i64 {
        self.schedule.fee_for(base_fare, distance_fare, distance_meters)
    }

    pub async fn get_wallet(&self, user_id: &str) -> DispatchResult<Wallet> {
        self.store
            .get_wallet(user_id)
            .await?
            .ok_or_else(|| DispatchError::wallet_not_found(user_id))
    }

    pub async fn transactions(&self, user_id: &str) -> DispatchResult<Vec<Transaction>> {
        self.get_wallet(user_id).await?;
        let mut txs = self.store.wallet_transactions(user_id).await?;
        txs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(txs)
    }

    /// Fail fast when `user_id` could not pay `amount` right now
    pub async fn ensure_can_cover(&self, user_id: &str, amount: i64) -> DispatchResult<()> {
        let wallet = self.get_wallet(user_id).await?;
        check_debit(&wallet, amount)
    }

    /// Charge the operational fee of one order, at most once per order.
    ///
    /// A single attempt: a `ConcurrencyConflict` is returned to the caller,
    /// which decides whether to re-read and retry.
    pub async fn deduct_operational_fee(
        &self,
        user_id: &str,
        order_id: &str,
        base_fare: i64,
        distance_fare: i64,
        distance_meters: u32,
    ) -> DispatchResult<FeeReceipt> {
        let kind = TransactionType::OperationalFee;
        let key = IdGenerator::fee_key(order_id);

        if let Some(existing) = self.store.transaction_by_key(user_id, kind, &key).await? {
            let existing = replay_of(existing, user_id, kind)?;
            tracing::debug!("Fee for order {} already charged as {}", order_id, existing.id);
            return Ok(replayed_receipt(existing));
        }

        let wallet = self.get_wallet(user_id).await?;
        let fee = self.anticipated_fee(base_fare, distance_fare, distance_meters);
        check_debit(&wallet, fee)?;

        let mut mutation = build_mutation(
            &wallet,
            kind,
            -fee,
            key,
            Some(order_id.to_string()),
            Some(format!(
                "Operational fee {}% for order {}",
                self.schedule.percent_for(distance_meters),
                order_id
            )),
        )?;
        mutation.order_fee = Some((
            order_id.to_string(),
            OperationalFee::charged(fee, mutation.transaction.id.clone()),
        ));

        let receipt = FeeReceipt {
            transaction_id: mutation.transaction.id.clone(),
            fee,
            new_balance: mutation.wallet.balance,
            replayed: false,
        };

        match self.store.commit_wallet_mutation(mutation).await? {
            CommitOutcome::Applied => {
                tracing::info!(
                    "Charged operational fee {} to {} for order {}, balance now {}",
                    fee,
                    user_id,
                    order_id,
                    receipt.new_balance
                );
                Ok(receipt)
            }
            CommitOutcome::AlreadyApplied(existing) => {
                Ok(replayed_receipt(replay_of(existing, user_id, kind)?))
            }
        }
    }

    /// Credit coins; creates the wallet on first top-up
    pub async fn top_up(
        &self,
        user_id: &str,
        amount: i64,
        idempotency_key: &str,
        description: Option<String>,
    ) -> DispatchResult<Transaction> {
        if amount <= 0 {
            return Err(DispatchError::validation_error("amount", "top-up amount must be positive"));
        }
        check_client_key(idempotency_key)?;

        let kind = TransactionType::TopUp;
        self.apply_with_retry(user_id, kind, idempotency_key, true, |wallet| {
            if wallet.is_frozen {
                return Err(DispatchError::WalletFrozen(wallet.user_id.clone()));
            }
            build_mutation(
                wallet,
                kind,
                amount,
                idempotency_key.to_string(),
                None,
                description.clone(),
            )
        })
        .await
    }

    /// Signed manual correction; never takes the balance below zero
    pub async fn adjust(
        &self,
        user_id: &str,
        amount: i64,
        reason: &str,
        idempotency_key: &str,
    ) -> DispatchResult<Transaction> {
        if amount == 0 {
            return Err(DispatchError::validation_error("amount", "adjustment must not be zero"));
        }
        if reason.trim().is_empty() {
            return Err(DispatchError::validation_error("reason", "adjustment needs a reason"));
        }
        check_client_key(idempotency_key)?;

        let kind = TransactionType::ManualAdjustment;
        self.apply_with_retry(user_id, kind, idempotency_key, false, |wallet| {
            if amount < 0 {
                check_debit(wallet, amount.saturating_neg())?;
            }
            build_mutation(
                wallet,
                kind,
                amount,
                idempotency_key.to_string(),
                None,
                Some(reason.to_string()),
            )
        })
        .await
    }

    async fn apply_with_retry<F>(
        &self,
        user_id: &str,
        kind: TransactionType,
        idempotency_key: &str,
        create_missing: bool,
        build: F,
    ) -> DispatchResult<Transaction>
    where
        F: Fn(&Wallet) -> DispatchResult<WalletMutation>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;

            if let Some(existing) = self.store.transaction_by_key(user_id, kind, idempotency_key).await? {
                return replay_of(existing, user_id, kind);
            }

            let wallet = match self.store.get_wallet(user_id).await? {
                Some(wallet) => wallet,
                None if create_missing => Wallet::new(user_id),
                None => return Err(DispatchError::wallet_not_found(user_id)),
            };

            let mutation = build(&wallet)?;
            let tx = mutation.transaction.clone();

            match self.store.commit_wallet_mutation(mutation).await {
                Ok(CommitOutcome::Applied) => {
                    tracing::info!(
                        "Wallet {} {:?} {} -> balance {}",
                        user_id,
                        tx.transaction_type,
                        tx.amount,
                        tx.balance_after
                    );
                    return Ok(tx);
                }
                Ok(CommitOutcome::AlreadyApplied(existing)) => return replay_of(existing, user_id, kind),
                Err(DispatchError::ConcurrencyConflict(msg)) if attempt < MAX_WALLET_ATTEMPTS => {
                    tracing::debug!("Retrying wallet {} after conflict: {}", user_id, msg);
                }
                Err(e) => return Err(e),
            }
        }
    }
}

fn check_debit(wallet: &Wallet, amount: i64) -> DispatchResult<()> {
    if wallet.is_frozen {
        return Err(DispatchError::WalletFrozen(wallet.user_id.clone()));
    }
    if wallet.balance < amount {
        return Err(DispatchError::InsufficientBalance {
            required: amount,
            available: wallet.balance,
        });
    }
    Ok(())
}

/// Operator-chosen keys must not look like fee keys
fn check_client_key(idempotency_key: &str) -> DispatchResult<()> {
    if idempotency_key.trim().is_empty() {
        return Err(DispatchError::validation_error("idempotency_key", "key must not be empty"));
    }
    if idempotency_key.starts_with(FEE_KEY_PREFIX) {
        return Err(DispatchError::validation_error(
            "idempotency_key",
            format!("keys starting with '{}' are reserved", FEE_KEY_PREFIX),
        ));
    }
    Ok(())
}

/// A replayed movement must belong to the same wallet and kind as the request
fn replay_of(existing: Transaction, user_id: &str, kind: TransactionType) -> DispatchResult<Transaction> {
    if existing.user_id != user_id || existing.transaction_type != kind {
        return Err(DispatchError::Duplicate {
            entity: "Idempotency key",
            id: existing.idempotency_key,
        });
    }
    Ok(existing)
}

fn build_mutation(
    wallet: &Wallet,
    transaction_type: TransactionType,
    amount: i64,
    idempotency_key: String,
    order_id: Option<String>,
    description: Option<String>,
) -> DispatchResult<WalletMutation> {
    let too_large = || DispatchError::validation_error("amount", "amount overflows the wallet totals");
    let now = Utc::now();
    let mut next = wallet.clone();
    next.balance = next.balance.checked_add(amount).ok_or_else(too_large)?;
    match transaction_type {
        TransactionType::TopUp => {
            next.total_topup = next.total_topup.checked_add(amount).ok_or_else(too_large)?;
        }
        TransactionType::OperationalFee => {
            next.total_spent = next.total_spent.checked_sub(amount).ok_or_else(too_large)?;
            next.total_operational_fees =
                next.total_operational_fees.checked_sub(amount).ok_or_else(too_large)?;
        }
        TransactionType::ManualAdjustment => {}
    }
    next.version = wallet.version + 1;
    next.updated_at = now;

    Ok(WalletMutation {
        expected_version: wallet.version,
        transaction: Transaction {
            id: IdGenerator::generate(IdType::Transaction),
            user_id: wallet.user_id.clone(),
            transaction_type,
            amount,
            balance_before: wallet.balance,
            balance_after: next.balance,
            order_id,
            idempotency_key,
            description,
            created_at: now,
        },
        wallet: next,
        order_fee: None,
    })
}

fn replayed_receipt(tx: Transaction) -> FeeReceipt {
    FeeReceipt {
        transaction_id: tx.id,
        fee: -tx.amount,
        new_balance: tx.balance_after,
        replayed: true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Actor, FeeStatus, OrderStatusHistory};
    use crate::services::store::{fixtures, MemoryStore};

    async fn insert_paid_order(store: &MemoryStore, order_id: &str) {
        let mut order = fixtures::order(order_id);
        order.payer_id = Some("usr-1".to_string());
        order.operational_fee = OperationalFee::for_payer(Some("usr-1"));
        store
            .insert_order(&order, &OrderStatusHistory {
                id: format!("his-{}", order_id),
                order_id: order_id.into(),
                from_status: None,
                to_status: order.status,
                reason: "created".into(),
                actor: Actor::System,
                metadata: None,
                created_at: Utc::now(),
            })
            .await
            .unwrap();
    }

    async fn setup(balance: i64) -> (Arc<MemoryStore>, WalletService) {
        let store = Arc::new(MemoryStore::new());
        store.put_wallet(&fixtures::wallet("usr-1", balance)).await.unwrap();
        insert_paid_order(&store, "ord-1").await;
        let service = WalletService::new(store.clone(), FeeSchedule::default());
        (store, service)
    }

    #[tokio::test]
    async fn test_fee_deduction_annotates_order() {
        let (store, wallets) = setup(10_000).await;

        let receipt = wallets
            .deduct_operational_fee("usr-1", "ord-1", 6_000_000, 500_000, 7_000)
            .await
            .unwrap();
        assert_eq!(receipt.fee, 5_200);
        assert_eq!(receipt.new_balance, 4_800);
        assert!(!receipt.replayed);

        let wallet = wallets.get_wallet("usr-1").await.unwrap();
        assert_eq!(wallet.version, 1);
        assert_eq!(wallet.total_operational_fees, 5_200);
        assert_eq!(wallet.total_spent, 5_200);

        let order = store.get_order("ord-1").await.unwrap().unwrap();
        assert_eq!(order.operational_fee.status, FeeStatus::Charged);
        assert_eq!(order.operational_fee.amount, Some(5_200));
        assert_eq!(order.operational_fee.transaction_id, Some(receipt.transaction_id));
    }

    #[tokio::test]
    async fn test_insufficient_balance_writes_nothing() {
        let (_store, wallets) = setup(1_000).await;

        let err = wallets
            .deduct_operational_fee("usr-1", "ord-1", 6_000_000, 500_000, 7_000)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            DispatchError::InsufficientBalance { required: 5_200, available: 1_000 }
        ));
        let wallet = wallets.get_wallet("usr-1").await.unwrap();
        assert_eq!((wallet.balance, wallet.version), (1_000, 0));
        assert!(wallets.transactions("usr-1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_frozen_wallet_rejected() {
        let (store, wallets) = setup(10_000).await;
        let mut wallet = store.get_wallet("usr-1").await.unwrap().unwrap();
        wallet.is_frozen = true;
        store.put_wallet(&wallet).await.unwrap();

        let err = wallets
            .deduct_operational_fee("usr-1", "ord-1", 6_000_000, 500_000, 7_000)
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::WalletFrozen(_)));
        assert!(matches!(
            wallets.top_up("usr-1", 10, "t1", None).await.unwrap_err(),
            DispatchError::WalletFrozen(_)
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_same_order_charged_once_under_concurrency() {
        let (_store, wallets) = setup(100_000).await;
        let wallets = Arc::new(wallets);

        let attempts: Vec<_> = (0..8)
            .map(|_| {
                let wallets = wallets.clone();
                tokio::spawn(async move {
                    wallets
                        .deduct_operational_fee("usr-1", "ord-1", 6_000_000, 500_000, 7_000)
                        .await
                })
            })
            .collect();

        let mut fresh = 0;
        for attempt in attempts {
            match attempt.await.unwrap() {
                Ok(receipt) if !receipt.replayed => fresh += 1,
                Ok(_) => {}
                // Lost the version race before the key was visible; still no effect
                Err(DispatchError::ConcurrencyConflict(_)) => {}
                Err(e) => panic!("unexpected error {:?}", e),
            }
        }

        assert_eq!(fresh, 1);
        let txs = wallets.transactions("usr-1").await.unwrap();
        assert_eq!(txs.len(), 1);
        let wallet = wallets.get_wallet("usr-1").await.unwrap();
        assert_eq!(wallet.balance, 100_000 - 5_200);
        assert_eq!(wallet.version, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_balance_never_negative_under_contention() {
        let (_store, wallets) = setup(5_000).await;
        let wallets = Arc::new(wallets);

        // Each adjustment alone is affordable, together they are not
        let attempts: Vec<_> = (0..6)
            .map(|i| {
                let wallets = wallets.clone();
                tokio::spawn(async move {
                    wallets.adjust("usr-1", -2_000, "penalty", &format!("adj-{}", i)).await
                })
            })
            .collect();

        let mut applied = 0;
        for attempt in attempts {
            match attempt.await.unwrap() {
                Ok(_) => applied += 1,
                Err(DispatchError::InsufficientBalance { .. })
                | Err(DispatchError::ConcurrencyConflict(_)) => {}
                Err(e) => panic!("unexpected error {:?}", e),
            }
        }

        let wallet = wallets.get_wallet("usr-1").await.unwrap();
        assert!(wallet.balance >= 0);
        assert_eq!(wallet.balance, 5_000 - 2_000 * applied);
        assert_eq!(wallet.version, applied as u64);
    }

    #[tokio::test]
    async fn test_top_up_creates_wallet_and_is_idempotent() {
        let store = Arc::new(MemoryStore::new());
        let wallets = WalletService::new(store, FeeSchedule::default());

        let first = wallets.top_up("usr-9", 500, "topup-1", None).await.unwrap();
        let again = wallets.top_up("usr-9", 500, "topup-1", None).await.unwrap();
        assert_eq!(first.id, again.id);

        let wallet = wallets.get_wallet("usr-9").await.unwrap();
        assert_eq!((wallet.balance, wallet.total_topup, wallet.version), (500, 500, 1));
    }

    #[tokio::test]
    async fn test_fee_deductions_from_one_read_conflict() {
        let (store, wallets) = setup(20_000).await;
        insert_paid_order(&store, "ord-2").await;

        // Both deductions were built from version 0
        let wallet = wallets.get_wallet("usr-1").await.unwrap();
        let fee = wallets.anticipated_fee(6_000_000, 500_000, 7_000);
        let charge = |order_id: &str| {
            let mut mutation = build_mutation(
                &wallet,
                TransactionType::OperationalFee,
                -fee,
                IdGenerator::fee_key(order_id),
                Some(order_id.to_string()),
                None,
            )
            .unwrap();
            mutation.order_fee = Some((
                order_id.to_string(),
                OperationalFee::charged(fee, mutation.transaction.id.clone()),
            ));
            mutation
        };

        let first = store.commit_wallet_mutation(charge("ord-1")).await;
        let second = store.commit_wallet_mutation(charge("ord-2")).await;
        assert_eq!(first.unwrap(), CommitOutcome::Applied);
        assert!(matches!(second, Err(DispatchError::ConcurrencyConflict(_))));

        let wallet = wallets.get_wallet("usr-1").await.unwrap();
        assert_eq!((wallet.balance, wallet.version), (20_000 - 5_200, 1));
        let loser = store.get_order("ord-2").await.unwrap().unwrap();
        assert_eq!(loser.operational_fee.status, FeeStatus::Pending);

        // A fresh read lets the second order through
        let receipt = wallets
            .deduct_operational_fee("usr-1", "ord-2", 6_000_000, 500_000, 7_000)
            .await
            .unwrap();
        assert_eq!(receipt.new_balance, 20_000 - 2 * 5_200);
    }

    #[tokio::test]
    async fn test_receipt_key_reused_by_another_wallet_credits_it() {
        let store = Arc::new(MemoryStore::new());
        let wallets = WalletService::new(store, FeeSchedule::default());

        let alice = wallets.top_up("usr-a", 500, "receipt-1", None).await.unwrap();
        let bob = wallets.top_up("usr-b", 700, "receipt-1", None).await.unwrap();

        assert_ne!(alice.id, bob.id);
        assert_eq!((bob.user_id.as_str(), bob.amount), ("usr-b", 700));
        assert_eq!(wallets.get_wallet("usr-a").await.unwrap().balance, 500);
        assert_eq!(wallets.get_wallet("usr-b").await.unwrap().balance, 700);
    }

    #[tokio::test]
    async fn test_fee_prefixed_key_cannot_preempt_fee() {
        let (_store, wallets) = setup(10_000).await;

        let err = wallets.top_up("usr-1", 1, "opfee:ord-1", None).await.unwrap_err();
        assert_eq!(err.code(), "validation_failed");
        let err = wallets.adjust("usr-1", 5, "bonus", "opfee:ord-1").await.unwrap_err();
        assert_eq!(err.code(), "validation_failed");

        let receipt = wallets
            .deduct_operational_fee("usr-1", "ord-1", 6_000_000, 500_000, 7_000)
            .await
            .unwrap();
        assert!(!receipt.replayed);
        assert_eq!(receipt.fee, 5_200);
        assert_eq!(wallets.get_wallet("usr-1").await.unwrap().balance, 4_800);
    }

    #[test]
    fn test_replay_from_other_wallet_or_kind_is_duplicate() {
        let tx = build_mutation(
            &fixtures::wallet("usr-a", 0),
            TransactionType::TopUp,
            500,
            "receipt-1".into(),
            None,
            None,
        )
        .unwrap()
        .transaction;

        assert!(replay_of(tx.clone(), "usr-a", TransactionType::TopUp).is_ok());
        assert!(matches!(
            replay_of(tx.clone(), "usr-b", TransactionType::TopUp),
            Err(DispatchError::Duplicate { .. })
        ));
        assert!(matches!(
            replay_of(tx, "usr-a", TransactionType::ManualAdjustment),
            Err(DispatchError::Duplicate { .. })
        ));
    }

    #[tokio::test]
    async fn test_top_up_that_would_overflow_is_refused() {
        let (_store, wallets) = setup(10).await;
        let err = wallets.top_up("usr-1", i64::MAX, "big", None).await.unwrap_err();
        assert_eq!(err.code(), "validation_failed");
        assert_eq!(wallets.get_wallet("usr-1").await.unwrap().balance, 10);
    }

    #[tokio::test]
    async fn test_adjustment_cannot_overdraw() {
        let (_store, wallets) = setup(300).await;
        assert!(matches!(
            wallets.adjust("usr-1", -301, "correction", "adj-1").await.unwrap_err(),
            DispatchError::InsufficientBalance { .. }
        ));
        let tx = wallets.adjust("usr-1", -300, "correction", "adj-2").await.unwrap();
        assert_eq!(tx.balance_after, 0);
        assert!(wallets.adjust("usr-9", 10, "correction", "adj-3").await.is_err());
    }
}
