//! Trade Lifecycle Engine
//!
//! Owns trade creation, take-profit ladder placement, stop-loss ratcheting
//! and partial/full close logic. Every mutating operation acquires the
//! trade's lock (or the symbol+side entry lock for creation) before its
//! read-modify-write sequence; internal helpers assume the guard is held.
//!
//! Money arithmetic runs in fixed-point `Decimal` end to end. The engine
//! pushes protective stops to the exchange before persisting them, so the
//! local record never claims protection that is not live.

use std::sync::Arc;

use chrono::Utc;
use rust_decimal::{Decimal, RoundingStrategy};
use tracing::{debug, info, warn};

use crate::config::TradingConfig;
use crate::domain::entities::order_event::TriggerKind;
use crate::domain::entities::signal::{ExecutionMode, OrderIntent};
use crate::domain::entities::trade::{OrderRole, Trade, TradeStatus};
use crate::domain::errors::EngineError;
use crate::domain::repositories::exchange_gateway::{
    ExchangeGateway, GatewayError, OrderKind, OrderRequest,
};
use crate::domain::services::sizing::{self, QTY_SCALE};
use crate::domain::services::trade_locks::TradeLocks;
use crate::persistence::models::{NewTrade, NewTradeUpdate, TradeFilter};
use crate::persistence::repository::{TradeRepository, TradeUpdateLogRepository};

/// A close counts as full once the requested percentage is within rounding
/// noise of 1.
fn is_full_close(percentage: Decimal) -> bool {
    percentage >= Decimal::new(99_999, 5)
}

fn percent_of(pnl: Decimal, position_size: Decimal) -> Decimal {
    if position_size > Decimal::ZERO {
        (pnl / position_size) * Decimal::ONE_HUNDRED
    } else {
        Decimal::ZERO
    }
}

/// Result of a successful trade creation.
#[derive(Debug, Clone)]
pub struct CreatedTrade {
    pub trade_id: i64,
    pub order_id: String,
    pub status: TradeStatus,
}

/// Result of a price-trigger evaluation.
#[derive(Debug, Clone)]
pub enum TriggerOutcome {
    Unchanged { status: TradeStatus, pnl: Decimal },
    Tp1Ratcheted { pnl: Decimal },
    Tp2Ratcheted { pnl: Decimal },
    ClosedAtStop { pnl: Decimal },
}

pub struct LifecycleEngine {
    gateway: Arc<dyn ExchangeGateway>,
    trades: TradeRepository,
    journal: TradeUpdateLogRepository,
    locks: Arc<TradeLocks>,
    config: Arc<TradingConfig>,
}

impl LifecycleEngine {
    pub fn new(
        gateway: Arc<dyn ExchangeGateway>,
        trades: TradeRepository,
        journal: TradeUpdateLogRepository,
        locks: Arc<TradeLocks>,
        config: Arc<TradingConfig>,
    ) -> Self {
        Self {
            gateway,
            trades,
            journal,
            locks,
            config,
        }
    }

    /// Open a new position from a validated intent.
    ///
    /// Flattens any pre-existing exposure for the same symbol+direction,
    /// cancels resting same-direction orders, aligns leverage, then submits
    /// the entry order sized from the configured notional and rounded down
    /// to the instrument step. Nothing is persisted on rejection.
    pub async fn create_trade(&self, intent: OrderIntent) -> Result<CreatedTrade, EngineError> {
        let _entry_guard = self.locks.lock_entry(&intent.symbol, intent.side).await;

        self.flatten_existing_exposure(&intent).await;
        self.cancel_resting_orders(&intent).await;
        self.ensure_leverage(&intent).await;

        let step = self.gateway.instrument_step(&intent.symbol).await?;
        let quantity = sizing::quantity_for_notional(intent.notional, intent.entry, step);
        if quantity <= Decimal::ZERO {
            return Err(EngineError::validation(format!(
                "notional {} at entry {} rounds to zero quantity (step {})",
                intent.notional, intent.entry, step
            )));
        }

        let (kind, price) = match intent.mode {
            ExecutionMode::Market => (OrderKind::Market, None),
            ExecutionMode::Limit => (OrderKind::Limit, Some(intent.entry)),
        };
        let request = OrderRequest::entry(
            &intent.symbol,
            intent.side,
            kind,
            quantity,
            price,
            intent.stop_loss,
        );
        let receipt = self.gateway.place_order(&request).await?;

        let now = Utc::now();
        let mut entry_price = intent.entry;
        let (status, filled_at) = match intent.mode {
            ExecutionMode::Market => {
                // Market entries executed immediately; adopt the reported
                // fill price when the exchange provides one.
                if let Some(avg) = receipt.avg_price.filter(|p| *p > Decimal::ZERO) {
                    entry_price = avg;
                }
                (TradeStatus::Filled, Some(now))
            }
            ExecutionMode::Limit => (TradeStatus::Open, None),
        };

        let record = NewTrade {
            order_id: receipt.order_id.clone(),
            symbol: intent.symbol.clone(),
            side: intent.side,
            entry_price,
            quantity,
            position_size: intent.notional,
            leverage: intent.leverage,
            tp1_price: Some(intent.tp1),
            tp2_price: Some(intent.tp2),
            tp3_price: intent.tp3,
            sl_price: intent.stop_loss,
            strategy_type: intent.strategy_type.clone(),
            status,
            bot_name: intent.bot_name.clone(),
            filled_at,
        };
        let trade_id = self.trades.insert(&record).await?;
        info!(
            "Trade {} created: {} {} {} @ {} [{}] (order {})",
            trade_id, intent.side, quantity, intent.symbol, entry_price, status, receipt.order_id
        );
        self.audit(
            NewTradeUpdate::new(trade_id, status)
                .price(entry_price)
                .stop(intent.stop_loss)
                .note("entry order placed"),
        )
        .await;

        if status == TradeStatus::Filled {
            let trade = self.must_get(trade_id).await?;
            if let Err(e) = self.place_tp_ladder(&trade).await {
                warn!("Trade {}: take-profit ladder incomplete: {}", trade_id, e);
            }
        }

        Ok(CreatedTrade {
            trade_id,
            order_id: receipt.order_id,
            status,
        })
    }

    /// Place the reduce-only take-profit ladder for a filled trade.
    ///
    /// Legs are sized from fixed notional allocations and placed
    /// independently: a rejected leg is recorded as absent and does not
    /// prevent the others. Caller holds the trade lock.
    pub async fn place_tp_ladder(&self, trade: &Trade) -> Result<(), EngineError> {
        let step = self.gateway.instrument_step(&trade.symbol).await?;
        let [tp1_notional, tp2_notional, tp3_notional] = self.config.ladder_notionals();
        let legs = [
            (OrderRole::Tp1, trade.tp1_price, tp1_notional, &trade.tp1_order_id),
            (OrderRole::Tp2, trade.tp2_price, tp2_notional, &trade.tp2_order_id),
            (OrderRole::Tp3, trade.tp3_price, tp3_notional, &trade.tp3_order_id),
        ];

        for (role, price, notional, existing) in legs {
            let Some(price) = price else { continue };
            if notional <= Decimal::ZERO {
                continue;
            }
            if existing.is_some() {
                // Leg already placed; tp order ids are write-once.
                debug!("Trade {}: {:?} leg already recorded", trade.id, role);
                continue;
            }

            let quantity = sizing::quantity_for_notional(notional, trade.entry_price, step);
            if quantity <= Decimal::ZERO {
                warn!(
                    "Trade {}: {:?} allocation {} rounds to zero quantity, leg skipped",
                    trade.id, role, notional
                );
                continue;
            }

            let request = OrderRequest::reduce_limit(&trade.symbol, trade.side, quantity, price);
            match self.gateway.place_order(&request).await {
                Ok(receipt) => {
                    self.trades
                        .set_tp_order_id(trade.id, role, &receipt.order_id)
                        .await?;
                    info!(
                        "Trade {}: {:?} leg placed, qty {} @ {} (order {})",
                        trade.id, role, quantity, price, receipt.order_id
                    );
                    self.audit(
                        NewTradeUpdate::new(trade.id, trade.status)
                            .price(price)
                            .note(format!("{role:?} leg placed ({})", receipt.order_id)),
                    )
                    .await;
                }
                Err(e) => {
                    warn!("Trade {}: failed to place {:?} leg: {}", trade.id, role, e);
                }
            }
        }

        Ok(())
    }

    /// Direction-aware evaluation of tp1/tp2/stop-loss against a price.
    pub async fn evaluate_price_trigger(
        &self,
        trade_id: i64,
        current_price: Decimal,
    ) -> Result<TriggerOutcome, EngineError> {
        if current_price <= Decimal::ZERO {
            return Err(EngineError::validation("current price must be positive"));
        }

        let _guard = self.locks.lock_trade(trade_id).await;
        let trade = self.must_get(trade_id).await?;

        if trade.status.is_terminal() {
            return Ok(TriggerOutcome::Unchanged {
                status: trade.status,
                pnl: trade.pnl,
            });
        }
        if trade.filled_at.is_none() {
            return Err(EngineError::validation(format!(
                "trade {trade_id} has no fill yet (status {})",
                trade.status
            )));
        }

        let pnl = trade.unrealized_pnl(current_price);
        let pnl_percent = percent_of(pnl, trade.position_size);

        if trade.hit_stop_loss(current_price) {
            self.close_locked(&trade, Decimal::ONE, current_price).await?;
            info!(
                "Trade {}: stop-loss crossed at {}, position closed",
                trade_id, current_price
            );
            return Ok(TriggerOutcome::ClosedAtStop { pnl });
        }

        if trade.status == TradeStatus::Filled && trade.hit_tp1(current_price) {
            self.ratchet_stop(&trade, trade.entry_price).await?;
            let advanced = self
                .trades
                .record_ratchet(
                    trade.id,
                    TradeStatus::Filled,
                    TradeStatus::Tp1Hit,
                    trade.entry_price,
                    trade.tp1_price,
                    pnl,
                    pnl_percent,
                )
                .await?;
            if advanced {
                info!("Trade {}: TP1 hit, stop moved to entry", trade_id);
                self.audit(
                    NewTradeUpdate::new(trade_id, TradeStatus::Tp1Hit)
                        .price(current_price)
                        .stop(trade.entry_price)
                        .pnl(pnl)
                        .note("tp1 crossed, stop ratcheted to entry"),
                )
                .await;
            }
            return Ok(TriggerOutcome::Tp1Ratcheted { pnl });
        }

        if trade.status == TradeStatus::Tp1Hit && trade.hit_tp2(current_price) {
            let Some(tp1) = trade.tp1_price else {
                return Ok(TriggerOutcome::Unchanged {
                    status: trade.status,
                    pnl,
                });
            };
            self.ratchet_stop(&trade, tp1).await?;
            let advanced = self
                .trades
                .record_ratchet(
                    trade.id,
                    TradeStatus::Tp1Hit,
                    TradeStatus::Tp2Hit,
                    tp1,
                    trade.tp2_price,
                    pnl,
                    pnl_percent,
                )
                .await?;
            if advanced {
                info!("Trade {}: TP2 hit, stop moved to TP1", trade_id);
                self.audit(
                    NewTradeUpdate::new(trade_id, TradeStatus::Tp2Hit)
                        .price(current_price)
                        .stop(tp1)
                        .pnl(pnl)
                        .note("tp2 crossed, stop ratcheted to tp1"),
                )
                .await;
            }
            return Ok(TriggerOutcome::Tp2Ratcheted { pnl });
        }

        Ok(TriggerOutcome::Unchanged {
            status: trade.status,
            pnl,
        })
    }

    /// Close `percentage` of the position at `current_price`.
    pub async fn close_position(
        &self,
        trade_id: i64,
        percentage: Decimal,
        current_price: Decimal,
    ) -> Result<TradeStatus, EngineError> {
        if percentage <= Decimal::ZERO || percentage > Decimal::ONE {
            return Err(EngineError::validation(
                "percentage must be within (0, 1]",
            ));
        }
        if current_price <= Decimal::ZERO {
            return Err(EngineError::validation("current price must be positive"));
        }

        let _guard = self.locks.lock_trade(trade_id).await;
        let trade = self.must_get(trade_id).await?;
        if trade.status.is_terminal() {
            debug!("Trade {}: already {}, close skipped", trade_id, trade.status);
            return Ok(trade.status);
        }

        self.close_locked(&trade, percentage, current_price).await
    }

    /// Close logic under an already-held trade lock.
    async fn close_locked(
        &self,
        trade: &Trade,
        percentage: Decimal,
        exit_price: Decimal,
    ) -> Result<TradeStatus, EngineError> {
        let close_qty = (trade.quantity * percentage)
            .round_dp_with_strategy(QTY_SCALE, RoundingStrategy::ToZero);

        // Clamp to what the exchange actually holds; an over-close gets
        // rejected outright.
        let positions = self.gateway.positions(&trade.symbol).await?;
        let open = positions
            .into_iter()
            .find(|p| p.side == trade.side && p.size > Decimal::ZERO);
        let Some(position) = open else {
            return self
                .force_closed(trade, exit_price, "position already flat on exchange")
                .await;
        };
        let close_qty = close_qty.min(position.size);
        if close_qty <= Decimal::ZERO {
            return self
                .force_closed(trade, exit_price, "nothing left to close")
                .await;
        }

        let request = OrderRequest::reduce_market(&trade.symbol, trade.side, close_qty);
        match self.gateway.place_order(&request).await {
            Ok(_) => {}
            Err(GatewayError::PositionAlreadyZero) => {
                return self
                    .force_closed(trade, exit_price, "position already flat on exchange")
                    .await;
            }
            Err(e) => return Err(e.into()),
        }

        let realized =
            sizing::realized_pnl(trade.side, trade.entry_price, exit_price, close_qty, trade.leverage);
        let new_pnl = trade.pnl + realized;
        let remaining_factor = Decimal::ONE - percentage;
        let remaining_qty = (trade.quantity * remaining_factor)
            .round_dp_with_strategy(QTY_SCALE, RoundingStrategy::ToZero);
        let remaining_size = (trade.position_size * remaining_factor)
            .round_dp_with_strategy(QTY_SCALE, RoundingStrategy::ToZero);
        let pnl_percent = percent_of(new_pnl, trade.position_size);

        // Full closes are terminal; partial closes leave status to the
        // tp1/tp2 triggers.
        let (status, closed_at) = if is_full_close(percentage) {
            (TradeStatus::Closed, Some(Utc::now()))
        } else {
            (trade.status, None)
        };

        self.trades
            .apply_close(
                trade.id,
                remaining_qty,
                remaining_size,
                new_pnl,
                pnl_percent,
                status,
                closed_at,
            )
            .await?;
        info!(
            "Trade {}: closed {}% at {} (realized {}, total pnl {})",
            trade.id,
            percentage * Decimal::ONE_HUNDRED,
            exit_price,
            realized,
            new_pnl
        );
        self.audit(
            NewTradeUpdate::new(trade.id, status)
                .price(exit_price)
                .pnl(new_pnl)
                .note(format!("closed {}% of position", percentage * Decimal::ONE_HUNDRED)),
        )
        .await;

        Ok(status)
    }

    /// The exchange reports no position: reconcile the local record to
    /// CLOSED instead of failing.
    async fn force_closed(
        &self,
        trade: &Trade,
        exit_price: Decimal,
        reason: &str,
    ) -> Result<TradeStatus, EngineError> {
        warn!("Trade {}: {}, forcing CLOSED", trade.id, reason);
        self.trades
            .apply_close(
                trade.id,
                Decimal::ZERO,
                Decimal::ZERO,
                trade.pnl,
                trade.pnl_percent,
                TradeStatus::Closed,
                Some(Utc::now()),
            )
            .await?;
        self.audit(
            NewTradeUpdate::new(trade.id, TradeStatus::Closed)
                .price(exit_price)
                .note(reason),
        )
        .await;
        Ok(TradeStatus::Closed)
    }

    /// Move the protective stop. The exchange is updated first; the local
    /// record only follows a confirmed exchange call, and the stop may only
    /// tighten.
    pub async fn update_stop_loss(&self, trade_id: i64, new_stop: Decimal) -> Result<(), EngineError> {
        if new_stop <= Decimal::ZERO {
            return Err(EngineError::validation("stop-loss must be positive"));
        }

        let _guard = self.locks.lock_trade(trade_id).await;
        let trade = self.must_get(trade_id).await?;
        if trade.status.is_terminal() {
            return Err(EngineError::validation(format!(
                "trade {trade_id} is already {}",
                trade.status
            )));
        }
        if !trade.stop_tightens(new_stop) {
            return Err(EngineError::validation(format!(
                "stop-loss may only move toward profit (current {}, requested {})",
                trade.current_sl, new_stop
            )));
        }

        self.ratchet_stop(&trade, new_stop).await?;
        self.trades.update_stop(trade_id, new_stop).await?;
        info!("Trade {}: stop-loss updated to {}", trade_id, new_stop);
        self.audit(
            NewTradeUpdate::new(trade_id, trade.status)
                .stop(new_stop)
                .note("stop-loss updated"),
        )
        .await;
        Ok(())
    }

    /// Entry order filled on the exchange. Idempotent: a duplicate event
    /// finds the fill timestamp already set and does nothing.
    pub async fn record_entry_fill(&self, trade_id: i64) -> Result<bool, EngineError> {
        let _guard = self.locks.lock_trade(trade_id).await;
        let trade = self.must_get(trade_id).await?;
        if trade.filled_at.is_some() {
            debug!("Trade {}: duplicate fill event ignored", trade_id);
            return Ok(false);
        }
        if !self.trades.mark_filled(trade_id, Utc::now()).await? {
            return Ok(false);
        }
        info!("Trade {}: entry order filled", trade_id);
        self.audit(
            NewTradeUpdate::new(trade_id, TradeStatus::Filled)
                .price(trade.entry_price)
                .note("entry order filled"),
        )
        .await;

        let filled = self.must_get(trade_id).await?;
        if let Err(e) = self.place_tp_ladder(&filled).await {
            warn!("Trade {}: take-profit ladder incomplete: {}", trade_id, e);
        }
        Ok(true)
    }

    /// A take-profit leg filled on the exchange: ratchet the stop and
    /// advance the ladder. Out-of-sequence or repeated fills are no-ops.
    pub async fn record_tp_fill(&self, trade_id: i64, role: OrderRole) -> Result<bool, EngineError> {
        let _guard = self.locks.lock_trade(trade_id).await;
        let trade = self.must_get(trade_id).await?;

        let (expected, next, new_stop, level_price) = match role {
            OrderRole::Tp1 if trade.status == TradeStatus::Filled => (
                TradeStatus::Filled,
                TradeStatus::Tp1Hit,
                trade.entry_price,
                trade.tp1_price,
            ),
            OrderRole::Tp2 if trade.status == TradeStatus::Tp1Hit => {
                let Some(tp1) = trade.tp1_price else {
                    return Ok(false);
                };
                (TradeStatus::Tp1Hit, TradeStatus::Tp2Hit, tp1, trade.tp2_price)
            }
            _ => {
                debug!(
                    "Trade {}: {:?} fill in status {} is a no-op",
                    trade_id, role, trade.status
                );
                return Ok(false);
            }
        };

        let pnl = level_price
            .map(|p| trade.unrealized_pnl(p))
            .unwrap_or(trade.pnl);
        let pnl_percent = percent_of(pnl, trade.position_size);

        self.ratchet_stop(&trade, new_stop).await?;
        let advanced = self
            .trades
            .record_ratchet(trade_id, expected, next, new_stop, level_price, pnl, pnl_percent)
            .await?;
        if advanced {
            info!(
                "Trade {}: {:?} filled, status {} and stop ratcheted to {}",
                trade_id, role, next, new_stop
            );
            let mut entry = NewTradeUpdate::new(trade_id, next)
                .stop(new_stop)
                .pnl(pnl)
                .note(format!("{role:?} order filled"));
            if let Some(level) = level_price {
                entry = entry.tp(level);
            }
            self.audit(entry).await;
        }
        Ok(advanced)
    }

    /// Entry order cancelled on the exchange.
    pub async fn record_entry_cancelled(&self, trade_id: i64) -> Result<bool, EngineError> {
        let _guard = self.locks.lock_trade(trade_id).await;
        let trade = self.must_get(trade_id).await?;
        if !trade.status.can_transition_to(TradeStatus::Cancelled) {
            debug!(
                "Trade {}: cancel event in status {} is a no-op",
                trade_id, trade.status
            );
            return Ok(false);
        }
        let changed = self
            .trades
            .transition(trade_id, trade.status, TradeStatus::Cancelled, Some(Utc::now()))
            .await?;
        if changed {
            info!("Trade {}: entry order cancelled", trade_id);
            self.audit(
                NewTradeUpdate::new(trade_id, TradeStatus::Cancelled)
                    .note("entry order cancelled by exchange"),
            )
            .await;
        }
        Ok(changed)
    }

    /// A protective order fired on the exchange: force the matching
    /// terminal status. Idempotent and graph-bound.
    pub async fn force_trigger(&self, trade_id: i64, kind: TriggerKind) -> Result<bool, EngineError> {
        let target = match kind {
            TriggerKind::StopLoss => TradeStatus::StopLoss,
            TriggerKind::TakeProfit => TradeStatus::TakeProfit,
        };

        let _guard = self.locks.lock_trade(trade_id).await;
        let trade = self.must_get(trade_id).await?;
        if trade.status == target {
            return Ok(false);
        }
        if !trade.status.can_transition_to(target) {
            debug!(
                "Trade {}: {:?} trigger in status {} is a no-op",
                trade_id, kind, trade.status
            );
            return Ok(false);
        }
        let changed = self
            .trades
            .transition(trade_id, trade.status, target, Some(Utc::now()))
            .await?;
        if changed {
            info!("Trade {}: {} forced by exchange trigger", trade_id, target);
            self.audit(
                NewTradeUpdate::new(trade_id, target).note("protective order triggered on exchange"),
            )
            .await;
        }
        Ok(changed)
    }

    /// Cancel a stale OPEN entry order and mark the trade CANCELLED. A
    /// second pass finds the status changed and skips.
    pub async fn cancel_stale_entry(&self, trade_id: i64) -> Result<bool, EngineError> {
        let _guard = self.locks.lock_trade(trade_id).await;
        let trade = self.must_get(trade_id).await?;
        if trade.status != TradeStatus::Open {
            debug!(
                "Trade {}: no longer OPEN ({}), sweep skipped",
                trade_id, trade.status
            );
            return Ok(false);
        }

        self.gateway.cancel_order(&trade.symbol, &trade.order_id).await?;
        let changed = self
            .trades
            .transition(trade_id, TradeStatus::Open, TradeStatus::Cancelled, Some(Utc::now()))
            .await?;
        if changed {
            info!("Trade {}: stale entry order cancelled", trade_id);
            self.audit(
                NewTradeUpdate::new(trade_id, TradeStatus::Cancelled)
                    .note("stale entry order cancelled by sweeper"),
            )
            .await;
        }
        Ok(changed)
    }

    /// Direct order cancellation passthrough for the command surface.
    pub async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<(), EngineError> {
        self.gateway.cancel_order(symbol, order_id).await?;
        info!("Cancelled order {} for {}", order_id, symbol);
        Ok(())
    }

    /// Read-only lookup; no lock needed.
    pub async fn get_trade(&self, trade_id: i64) -> Result<Option<Trade>, EngineError> {
        Ok(self.trades.get(trade_id).await?)
    }

    /// Read-only listing; no lock needed.
    pub async fn list_trades(&self, filter: &TradeFilter) -> Result<Vec<Trade>, EngineError> {
        Ok(self.trades.list(filter).await?)
    }

    async fn must_get(&self, trade_id: i64) -> Result<Trade, EngineError> {
        self.trades
            .get(trade_id)
            .await?
            .ok_or(EngineError::TradeNotFound(trade_id))
    }

    /// Push a tightened stop to the exchange. Persistence follows at the
    /// caller once the call succeeded.
    async fn ratchet_stop(&self, trade: &Trade, new_stop: Decimal) -> Result<(), EngineError> {
        self.gateway
            .set_stop_loss(&trade.symbol, trade.side, new_stop)
            .await?;
        Ok(())
    }

    /// Reduce-only close any open position matching the intent's direction.
    /// Failures are tolerated; the entry order itself decides the outcome.
    async fn flatten_existing_exposure(&self, intent: &OrderIntent) {
        match self.gateway.positions(&intent.symbol).await {
            Ok(positions) => {
                for position in positions
                    .iter()
                    .filter(|p| p.side == intent.side && p.size > Decimal::ZERO)
                {
                    let request =
                        OrderRequest::reduce_market(&intent.symbol, position.side, position.size);
                    match self.gateway.place_order(&request).await {
                        Ok(_) => info!(
                            "Flattened existing {} {} position of {}",
                            intent.symbol, position.side, position.size
                        ),
                        Err(GatewayError::PositionAlreadyZero) => {}
                        Err(e) => warn!(
                            "Could not flatten existing position for {}: {}",
                            intent.symbol, e
                        ),
                    }
                }
            }
            Err(e) => warn!("Could not query positions for {}: {}", intent.symbol, e),
        }
    }

    async fn cancel_resting_orders(&self, intent: &OrderIntent) {
        match self
            .gateway
            .open_orders(&intent.symbol, Some(intent.side))
            .await
        {
            Ok(orders) => {
                for order in orders {
                    match self.gateway.cancel_order(&intent.symbol, &order.order_id).await {
                        Ok(_) => info!(
                            "Cancelled resting order {} for {} {}",
                            order.order_id, intent.symbol, intent.side
                        ),
                        Err(e) => warn!(
                            "Failed to cancel resting order {}: {}",
                            order.order_id, e
                        ),
                    }
                }
            }
            Err(e) => warn!("Could not query open orders for {}: {}", intent.symbol, e),
        }
    }

    async fn ensure_leverage(&self, intent: &OrderIntent) {
        let current = match self.gateway.positions(&intent.symbol).await {
            Ok(positions) => positions.first().map(|p| p.leverage),
            Err(e) => {
                warn!("Could not read leverage for {}: {}", intent.symbol, e);
                None
            }
        };
        if current == Some(intent.leverage) {
            debug!("Leverage already at {}x for {}", intent.leverage, intent.symbol);
            return;
        }
        match self.gateway.set_leverage(&intent.symbol, intent.leverage).await {
            Ok(_) => info!("Leverage set to {}x for {}", intent.leverage, intent.symbol),
            Err(e) => warn!("Failed to set leverage for {}: {}", intent.symbol, e),
        }
    }

    /// Audit-log append. The log is forensic; a failed append is logged and
    /// never fails the operation it describes.
    async fn audit(&self, entry: NewTradeUpdate) {
        let trade_id = entry.trade_id;
        if let Err(e) = self.journal.append(&entry).await {
            warn!("Failed to append audit entry for trade {}: {}", trade_id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::{init_database, RetryPolicy};
    use async_trait::async_trait;
    use rust_decimal_macros::dec;
    use tokio::sync::Mutex;

    use crate::domain::entities::trade::Side;
    use crate::domain::repositories::exchange_gateway::{
        GatewayResult, OpenOrderView, OrderReceipt, PositionView,
    };

    #[derive(Default)]
    struct MockState {
        next_id: u64,
        placed: Vec<OrderRequest>,
        positions: Vec<PositionView>,
        stops: Vec<(String, f64)>,
        cancelled: Vec<String>,
        reject_limit_prices: Vec<Decimal>,
        reduce_reports_zero: bool,
        avg_fill_price: Option<Decimal>,
    }

    struct MockGateway {
        state: Mutex<MockState>,
    }

    impl MockGateway {
        fn new() -> Self {
            Self {
                state: Mutex::new(MockState::default()),
            }
        }

        async fn with_positions(self, positions: Vec<PositionView>) -> Self {
            self.state.lock().await.positions = positions;
            self
        }
    }

    #[async_trait]
    impl ExchangeGateway for MockGateway {
        fn name(&self) -> &str {
            "MockExchange"
        }

        async fn place_order(&self, request: &OrderRequest) -> GatewayResult<OrderReceipt> {
            let mut state = self.state.lock().await;
            if request.reduce_only && request.kind == OrderKind::Market && state.reduce_reports_zero
            {
                return Err(GatewayError::PositionAlreadyZero);
            }
            if let Some(price) = request.price {
                if state.reject_limit_prices.contains(&price) {
                    return Err(GatewayError::Rejected {
                        code: 110007,
                        message: "insufficient available balance".to_string(),
                    });
                }
            }
            state.next_id += 1;
            let order_id = format!("mock-{}", state.next_id);
            let avg_price = if request.kind == OrderKind::Market && !request.reduce_only {
                state.avg_fill_price
            } else {
                None
            };
            state.placed.push(request.clone());
            Ok(OrderReceipt { order_id, avg_price })
        }

        async fn cancel_order(&self, _symbol: &str, order_id: &str) -> GatewayResult<()> {
            self.state.lock().await.cancelled.push(order_id.to_string());
            Ok(())
        }

        async fn positions(&self, _symbol: &str) -> GatewayResult<Vec<PositionView>> {
            Ok(self.state.lock().await.positions.clone())
        }

        async fn open_orders(
            &self,
            _symbol: &str,
            _side: Option<Side>,
        ) -> GatewayResult<Vec<OpenOrderView>> {
            Ok(Vec::new())
        }

        async fn set_leverage(&self, _symbol: &str, _leverage: u32) -> GatewayResult<()> {
            Ok(())
        }

        async fn set_stop_loss(&self, symbol: &str, _side: Side, stop: Decimal) -> GatewayResult<()> {
            use rust_decimal::prelude::ToPrimitive;
            self.state
                .lock()
                .await
                .stops
                .push((symbol.to_string(), stop.to_f64().unwrap_or(0.0)));
            Ok(())
        }

        async fn instrument_step(&self, _symbol: &str) -> GatewayResult<Decimal> {
            Ok(dec!(0.001))
        }
    }

    async fn engine_with(gateway: MockGateway) -> (LifecycleEngine, Arc<MockGateway>) {
        let pool = init_database("sqlite::memory:").await.unwrap();
        let gateway = Arc::new(gateway);
        let engine = LifecycleEngine::new(
            gateway.clone(),
            TradeRepository::new(pool.clone(), RetryPolicy::default()),
            TradeUpdateLogRepository::new(pool, RetryPolicy::default()),
            Arc::new(TradeLocks::new()),
            Arc::new(TradingConfig::default()),
        );
        (engine, gateway)
    }

    fn intent(mode: ExecutionMode) -> OrderIntent {
        OrderIntent {
            symbol: "BTCUSDT".to_string(),
            side: Side::Buy,
            entry: dec!(50000),
            leverage: 5,
            tp1: dec!(51000),
            tp2: dec!(52000),
            tp3: None,
            stop_loss: dec!(49000),
            notional: dec!(300),
            strategy_type: "strategy1".to_string(),
            bot_name: "test-bot".to_string(),
            mode,
        }
    }

    #[tokio::test]
    async fn test_market_create_fills_and_places_ladder() {
        let (engine, gateway) = engine_with(MockGateway::new()).await;
        let created = engine.create_trade(intent(ExecutionMode::Market)).await.unwrap();
        assert_eq!(created.status, TradeStatus::Filled);

        let trade = engine.get_trade(created.trade_id).await.unwrap().unwrap();
        assert!(trade.filled_at.is_some());
        assert!(trade.tp1_order_id.is_some());
        assert!(trade.tp2_order_id.is_some());
        // tp3 allocation defaults to zero: modeled, never placed
        assert!(trade.tp3_order_id.is_none());

        let state = gateway.state.lock().await;
        // entry + two ladder legs
        assert_eq!(state.placed.len(), 3);
        assert!(state.placed[1].reduce_only && state.placed[2].reduce_only);
    }

    #[tokio::test]
    async fn test_limit_create_stays_open_without_ladder() {
        let (engine, gateway) = engine_with(MockGateway::new()).await;
        let created = engine.create_trade(intent(ExecutionMode::Limit)).await.unwrap();
        assert_eq!(created.status, TradeStatus::Open);

        let trade = engine.get_trade(created.trade_id).await.unwrap().unwrap();
        assert!(trade.filled_at.is_none());
        assert!(trade.tp1_order_id.is_none());
        assert_eq!(gateway.state.lock().await.placed.len(), 1);
    }

    #[tokio::test]
    async fn test_entry_quantity_rounds_down_to_step() {
        let (engine, gateway) = engine_with(MockGateway::new()).await;
        engine.create_trade(intent(ExecutionMode::Market)).await.unwrap();
        let state = gateway.state.lock().await;
        // 300 / 50000 = 0.006 exactly on the 0.001 step
        assert_eq!(state.placed[0].quantity, dec!(0.006));
    }

    #[tokio::test]
    async fn test_tp2_rejection_does_not_lose_tp1() {
        let gateway = MockGateway::new();
        gateway.state.lock().await.reject_limit_prices = vec![dec!(52000)];
        let (engine, _) = engine_with(gateway).await;

        let created = engine.create_trade(intent(ExecutionMode::Market)).await.unwrap();
        let trade = engine.get_trade(created.trade_id).await.unwrap().unwrap();
        assert!(trade.tp1_order_id.is_some());
        assert!(trade.tp2_order_id.is_none());
        assert_eq!(trade.status, TradeStatus::Filled);
    }

    #[tokio::test]
    async fn test_flattens_existing_same_direction_position() {
        let gateway = MockGateway::new()
            .with_positions(vec![PositionView {
                symbol: "BTCUSDT".to_string(),
                side: Side::Buy,
                size: dec!(0.004),
                leverage: 5,
            }])
            .await;
        let (engine, gateway) = engine_with(gateway).await;

        engine.create_trade(intent(ExecutionMode::Limit)).await.unwrap();
        let state = gateway.state.lock().await;
        // first placed order is the reduce-only flatten, then the entry
        assert!(state.placed[0].reduce_only);
        assert_eq!(state.placed[0].side, Side::Sell);
        assert_eq!(state.placed[0].quantity, dec!(0.004));
        assert!(!state.placed[1].reduce_only);
    }

    #[tokio::test]
    async fn test_full_close_realizes_pnl_and_terminates() {
        let gateway = MockGateway::new()
            .with_positions(vec![PositionView {
                symbol: "BTCUSDT".to_string(),
                side: Side::Buy,
                size: dec!(1),
                leverage: 5,
            }])
            .await;
        let (engine, _) = engine_with(gateway).await;

        // entry 100, qty 1, leverage 5
        let mut it = intent(ExecutionMode::Market);
        it.entry = dec!(100);
        it.tp1 = dec!(110);
        it.tp2 = dec!(120);
        it.stop_loss = dec!(90);
        it.notional = dec!(100);
        let created = engine.create_trade(it).await.unwrap();

        let status = engine
            .close_position(created.trade_id, dec!(1), dec!(110))
            .await
            .unwrap();
        assert_eq!(status, TradeStatus::Closed);

        let trade = engine.get_trade(created.trade_id).await.unwrap().unwrap();
        assert_eq!(trade.status, TradeStatus::Closed);
        assert_eq!(trade.quantity, Decimal::ZERO);
        // (110 - 100) * 1 * 5 = 50
        assert_eq!(trade.pnl, dec!(50));
        assert!(trade.closed_at.is_some());
    }

    #[tokio::test]
    async fn test_partial_close_keeps_status() {
        let gateway = MockGateway::new()
            .with_positions(vec![PositionView {
                symbol: "BTCUSDT".to_string(),
                side: Side::Buy,
                size: dec!(1),
                leverage: 5,
            }])
            .await;
        let (engine, _) = engine_with(gateway).await;

        let mut it = intent(ExecutionMode::Market);
        it.entry = dec!(100);
        it.notional = dec!(100);
        let created = engine.create_trade(it).await.unwrap();

        let status = engine
            .close_position(created.trade_id, dec!(0.5), dec!(110))
            .await
            .unwrap();
        assert_eq!(status, TradeStatus::Filled);

        let trade = engine.get_trade(created.trade_id).await.unwrap().unwrap();
        assert_eq!(trade.status, TradeStatus::Filled);
        assert_eq!(trade.quantity, dec!(0.5));
        assert!(trade.closed_at.is_none());
    }

    #[tokio::test]
    async fn test_close_with_flat_exchange_forces_closed() {
        let (engine, _) = engine_with(MockGateway::new()).await;

        let created = engine.create_trade(intent(ExecutionMode::Market)).await.unwrap();
        // mock reports no positions at all
        let status = engine
            .close_position(created.trade_id, dec!(1), dec!(50000))
            .await
            .unwrap();
        assert_eq!(status, TradeStatus::Closed);

        let trade = engine.get_trade(created.trade_id).await.unwrap().unwrap();
        assert_eq!(trade.status, TradeStatus::Closed);
        assert_eq!(trade.quantity, Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_stop_loss_ratchet_rejects_regression() {
        let (engine, _) = engine_with(MockGateway::new()).await;
        let created = engine.create_trade(intent(ExecutionMode::Market)).await.unwrap();

        // tighten is fine
        engine
            .update_stop_loss(created.trade_id, dec!(49500))
            .await
            .unwrap();
        // loosening is rejected before any exchange call
        let err = engine
            .update_stop_loss(created.trade_id, dec!(49000))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));

        let trade = engine.get_trade(created.trade_id).await.unwrap().unwrap();
        assert_eq!(trade.current_sl, dec!(49500));
    }

    #[tokio::test]
    async fn test_evaluate_trigger_walks_the_ladder() {
        let gateway = MockGateway::new()
            .with_positions(vec![PositionView {
                symbol: "BTCUSDT".to_string(),
                side: Side::Buy,
                size: dec!(1),
                leverage: 5,
            }])
            .await;
        let (engine, gateway) = engine_with(gateway).await;

        let mut it = intent(ExecutionMode::Market);
        it.entry = dec!(100);
        it.tp1 = dec!(110);
        it.tp2 = dec!(120);
        it.stop_loss = dec!(90);
        it.notional = dec!(100);
        let created = engine.create_trade(it).await.unwrap();

        let outcome = engine
            .evaluate_price_trigger(created.trade_id, dec!(111))
            .await
            .unwrap();
        assert!(matches!(outcome, TriggerOutcome::Tp1Ratcheted { .. }));
        let trade = engine.get_trade(created.trade_id).await.unwrap().unwrap();
        assert_eq!(trade.status, TradeStatus::Tp1Hit);
        assert_eq!(trade.current_sl, dec!(100));

        let outcome = engine
            .evaluate_price_trigger(created.trade_id, dec!(121))
            .await
            .unwrap();
        assert!(matches!(outcome, TriggerOutcome::Tp2Ratcheted { .. }));
        let trade = engine.get_trade(created.trade_id).await.unwrap().unwrap();
        assert_eq!(trade.status, TradeStatus::Tp2Hit);
        assert_eq!(trade.current_sl, dec!(110));

        // ratchets were pushed to the exchange
        let state = gateway.state.lock().await;
        assert_eq!(state.stops.len(), 2);
    }

    #[tokio::test]
    async fn test_evaluate_trigger_closes_at_stop() {
        let gateway = MockGateway::new()
            .with_positions(vec![PositionView {
                symbol: "BTCUSDT".to_string(),
                side: Side::Buy,
                size: dec!(1),
                leverage: 5,
            }])
            .await;
        let (engine, _) = engine_with(gateway).await;

        let mut it = intent(ExecutionMode::Market);
        it.entry = dec!(100);
        it.stop_loss = dec!(90);
        it.notional = dec!(100);
        let created = engine.create_trade(it).await.unwrap();

        let outcome = engine
            .evaluate_price_trigger(created.trade_id, dec!(89))
            .await
            .unwrap();
        assert!(matches!(outcome, TriggerOutcome::ClosedAtStop { .. }));
        let trade = engine.get_trade(created.trade_id).await.unwrap().unwrap();
        assert_eq!(trade.status, TradeStatus::Closed);

        // terminal trades are never evaluated further
        let outcome = engine
            .evaluate_price_trigger(created.trade_id, dec!(80))
            .await
            .unwrap();
        assert!(matches!(outcome, TriggerOutcome::Unchanged { .. }));
    }

    #[tokio::test]
    async fn test_record_entry_fill_is_idempotent() {
        let (engine, gateway) = engine_with(MockGateway::new()).await;
        let created = engine.create_trade(intent(ExecutionMode::Limit)).await.unwrap();

        assert!(engine.record_entry_fill(created.trade_id).await.unwrap());
        let after_first = gateway.state.lock().await.placed.len();
        assert!(!engine.record_entry_fill(created.trade_id).await.unwrap());
        // the duplicate placed no further orders
        assert_eq!(gateway.state.lock().await.placed.len(), after_first);

        let trade = engine.get_trade(created.trade_id).await.unwrap().unwrap();
        assert_eq!(trade.status, TradeStatus::Filled);
        assert!(trade.tp1_order_id.is_some());
    }

    #[tokio::test]
    async fn test_force_trigger_respects_graph() {
        let (engine, _) = engine_with(MockGateway::new()).await;
        let created = engine.create_trade(intent(ExecutionMode::Market)).await.unwrap();

        assert!(engine
            .force_trigger(created.trade_id, TriggerKind::StopLoss)
            .await
            .unwrap());
        // repeat is a no-op
        assert!(!engine
            .force_trigger(created.trade_id, TriggerKind::StopLoss)
            .await
            .unwrap());
        // and a conflicting trigger cannot leave the terminal state
        assert!(!engine
            .force_trigger(created.trade_id, TriggerKind::TakeProfit)
            .await
            .unwrap());

        let trade = engine.get_trade(created.trade_id).await.unwrap().unwrap();
        assert_eq!(trade.status, TradeStatus::StopLoss);
    }
}
