//! Per-trade mutation serialization.
//!
//! Three execution contexts (inbound commands, the push-event consumer, the
//! stale-order sweeper) can target the same trade concurrently. Every
//! read-modify-write sequence on a trade must run under that trade's lock,
//! acquired here. Two key spaces exist:
//!
//! - `trade:{id}` serializes all mutations of one trade;
//! - `entry:{symbol}:{side}` serializes create-trade's flatten-then-place
//!   sequence, so two concurrent creates for the same symbol and direction
//!   cannot both leave exposure.
//!
//! Locks are acquired at engine entry points only; internal helpers assume
//! the guard is already held and never re-acquire, which is how the
//! non-reentrant mutex cannot deadlock against itself. tokio's mutex queues
//! waiters FIFO, so acquisition is fair. Read-only lookups bypass the map.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::domain::entities::trade::Side;

/// Keyed mutex map handing out owned per-key guards.
#[derive(Default)]
pub struct TradeLocks {
    inner: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl TradeLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serialize mutations of one trade.
    pub async fn lock_trade(&self, trade_id: i64) -> OwnedMutexGuard<()> {
        self.lock_key(format!("trade:{trade_id}")).await
    }

    /// Serialize trade creation for one symbol + direction.
    pub async fn lock_entry(&self, symbol: &str, side: Side) -> OwnedMutexGuard<()> {
        self.lock_key(format!("entry:{symbol}:{side}")).await
    }

    async fn lock_key(&self, key: String) -> OwnedMutexGuard<()> {
        let slot = {
            let mut map = self.inner.lock().await;
            // Drop map entries nobody is holding or waiting on.
            map.retain(|_, m| Arc::strong_count(m) > 1);
            map.entry(key).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
        };
        slot.lock_owned().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_key_serializes() {
        let locks = Arc::new(TradeLocks::new());
        let running = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let locks = locks.clone();
            let running = running.clone();
            let max_seen = max_seen.clone();
            handles.push(tokio::spawn(async move {
                let _guard = locks.lock_trade(42).await;
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                running.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_distinct_keys_do_not_block() {
        let locks = Arc::new(TradeLocks::new());
        let _a = locks.lock_trade(1).await;
        // A different trade id must be acquirable while the first is held.
        let acquired = tokio::time::timeout(Duration::from_millis(100), locks.lock_trade(2)).await;
        assert!(acquired.is_ok());
    }

    #[tokio::test]
    async fn test_entry_key_covers_symbol_and_side() {
        let locks = Arc::new(TradeLocks::new());
        let _buy = locks.lock_entry("BTCUSDT", Side::Buy).await;
        // Opposite direction on the same symbol is an independent key.
        let sell =
            tokio::time::timeout(Duration::from_millis(100), locks.lock_entry("BTCUSDT", Side::Sell))
                .await;
        assert!(sell.is_ok());
        // Same direction must wait.
        let blocked =
            tokio::time::timeout(Duration::from_millis(50), locks.lock_entry("BTCUSDT", Side::Buy))
                .await;
        assert!(blocked.is_err());
    }

    #[tokio::test]
    async fn test_released_entries_are_cleaned_up() {
        let locks = TradeLocks::new();
        drop(locks.lock_trade(7).await);
        // Next acquisition prunes the idle slot before inserting again.
        drop(locks.lock_trade(8).await);
        let map = locks.inner.lock().await;
        assert!(map.len() <= 1);
    }
}
