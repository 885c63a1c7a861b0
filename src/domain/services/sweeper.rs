//! Stale Order Sweeper
//!
//! Periodically cancels entry orders that never filled within the
//! configured age budget. One trade failing to cancel is logged and does
//! not interrupt the rest of the batch; sweeping the same trade twice is
//! safe because the second pass finds it no longer OPEN.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::domain::errors::EngineError;
use crate::domain::services::lifecycle::LifecycleEngine;
use crate::persistence::repository::TradeRepository;

/// Outcome of one sweep pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepSummary {
    pub examined: usize,
    pub cancelled: usize,
    pub skipped: usize,
    pub failed: usize,
}

pub struct StaleOrderSweeper {
    engine: Arc<LifecycleEngine>,
    trades: TradeRepository,
    interval: Duration,
    max_age: chrono::Duration,
}

impl StaleOrderSweeper {
    pub fn new(
        engine: Arc<LifecycleEngine>,
        trades: TradeRepository,
        interval: Duration,
        max_age: chrono::Duration,
    ) -> Self {
        Self {
            engine,
            trades,
            interval,
            max_age,
        }
    }

    /// Timer loop, running until the shutdown flag flips.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            "StaleOrderSweeper started (every {:?}, cutoff {} minutes)",
            self.interval,
            self.max_age.num_minutes()
        );
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick of `interval` fires immediately; consume it so the
        // first sweep happens one full period after startup.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.sweep_once().await {
                        Ok(summary) if summary.examined > 0 => {
                            info!(
                                "Sweep finished: {} examined, {} cancelled, {} skipped, {} failed",
                                summary.examined, summary.cancelled, summary.skipped, summary.failed
                            );
                        }
                        Ok(_) => {}
                        Err(e) => error!("Sweep pass failed: {}", e),
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("StaleOrderSweeper received shutdown signal");
                        break;
                    }
                }
            }
        }

        info!("StaleOrderSweeper stopped");
    }

    /// Cancel every OPEN trade older than the cutoff. Failures on
    /// individual trades do not interrupt the batch.
    pub async fn sweep_once(&self) -> Result<SweepSummary, EngineError> {
        let cutoff = Utc::now() - self.max_age;
        let stale = self.trades.open_older_than(cutoff).await?;

        let mut summary = SweepSummary {
            examined: stale.len(),
            ..Default::default()
        };

        for trade in stale {
            match self.engine.cancel_stale_entry(trade.id).await {
                Ok(true) => summary.cancelled += 1,
                Ok(false) => summary.skipped += 1,
                Err(e) => {
                    warn!("Failed to sweep trade {}: {}", trade.id, e);
                    summary.failed += 1;
                }
            }
        }

        Ok(summary)
    }
}

// Sweep semantics (double-run safety, per-trade failure isolation) are
// exercised in tests/trade_lifecycle_e2e.rs against a mock gateway.
