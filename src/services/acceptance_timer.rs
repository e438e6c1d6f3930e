// src/services/acceptance_timer.rs
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing;

struct ArmedTimer {
    generation: u64,
    token: CancellationToken,
}

#[derive(Default)]
struct TimerTable {
    next_generation: u64,
    armed: HashMap<String, ArmedTimer>,
}

/// One cancellable deadline per assigned order.
///
/// Every timer is a child of `shutdown`, so cancelling the root stops all of
/// them. Re-arming an order cancels its previous timer.
#[derive(Clone)]
pub struct AcceptanceTimers {
    table: Arc<Mutex<TimerTable>>,
    shutdown: CancellationToken,
}

impl AcceptanceTimers {
    pub fn new(shutdown: CancellationToken) -> Self {
        Self {
            table: Arc::new(Mutex::new(TimerTable::default())),
            shutdown,
        }
    }

    /// Runs `on_expire` after `after` unless the timer is cancelled first
    pub async fn arm<F, Fut>(&self, order_id: &str, after: Duration, on_expire: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let token = self.shutdown.child_token();
        let generation = {
            let mut table = self.table.lock().await;
            table.next_generation += 1;
            let generation = table.next_generation;
            let previous = table.armed.insert(
                order_id.to_string(),
                ArmedTimer { generation, token: token.clone() },
            );
            if let Some(previous) = previous {
                previous.token.cancel();
            }
            generation
        };

        let table = self.table.clone();
        let order_id = order_id.to_string();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {
                    tracing::debug!("Acceptance timer for {} cancelled", order_id);
                }
                _ = tokio::time::sleep(after) => {
                    {
                        let mut table = table.lock().await;
                        let ours = table
                            .armed
                            .get(&order_id)
                            .is_some_and(|t| t.generation == generation);
                        if !ours {
                            return;
                        }
                        table.armed.remove(&order_id);
                    }
                    on_expire().await;
                }
            }
        });
    }

    /// `true` if a timer was pending for the order
    pub async fn cancel(&self, order_id: &str) -> bool {
        match self.table.lock().await.armed.remove(order_id) {
            Some(timer) => {
                timer.token.cancel();
                true
            }
            None => false,
        }
    }

    #[cfg(test)]
    pub async fn is_armed(&self, order_id: &str) -> bool {
        self.table.lock().await.armed.contains_key(order_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn bump(fired: &Arc<AtomicUsize>) -> impl FnOnce() -> std::future::Ready<()> + Send + 'static {
        let fired = fired.clone();
        move || {
            fired.fetch_add(1, Ordering::SeqCst);
            std::future::ready(())
        }
    }

    async fn settle() {
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_fires_once_after_deadline() {
        let timers = AcceptanceTimers::new(CancellationToken::new());
        let fired = Arc::new(AtomicUsize::new(0));

        timers.arm("ord-1", Duration::from_secs(120), bump(&fired)).await;
        settle().await;

        tokio::time::advance(Duration::from_millis(119_999)).await;
        settle().await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        tokio::time::advance(Duration::from_millis(2)).await;
        settle().await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!timers.is_armed("ord-1").await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_prevents_firing() {
        let timers = AcceptanceTimers::new(CancellationToken::new());
        let fired = Arc::new(AtomicUsize::new(0));

        timers.arm("ord-1", Duration::from_secs(120), bump(&fired)).await;
        settle().await;
        tokio::time::advance(Duration::from_millis(119_999)).await;
        assert!(timers.cancel("ord-1").await);

        tokio::time::advance(Duration::from_secs(5)).await;
        settle().await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert!(!timers.cancel("ord-1").await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rearm_replaces_previous_timer() {
        let timers = AcceptanceTimers::new(CancellationToken::new());
        let fired = Arc::new(AtomicUsize::new(0));

        timers.arm("ord-1", Duration::from_secs(120), bump(&fired)).await;
        settle().await;
        tokio::time::advance(Duration::from_secs(60)).await;
        timers.arm("ord-1", Duration::from_secs(120), bump(&fired)).await;
        settle().await;

        tokio::time::advance(Duration::from_secs(61)).await;
        settle().await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        tokio::time::advance(Duration::from_secs(60)).await;
        settle().await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_cancels_everything() {
        let root = CancellationToken::new();
        let timers = AcceptanceTimers::new(root.clone());
        let fired = Arc::new(AtomicUsize::new(0));

        timers.arm("ord-1", Duration::from_secs(120), bump(&fired)).await;
        timers.arm("ord-2", Duration::from_secs(120), bump(&fired)).await;
        root.cancel();

        tokio::time::advance(Duration::from_secs(200)).await;
        settle().await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
