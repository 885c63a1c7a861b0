//! Trade Repository
//!
//! Data access for trade rows and the append-only audit log. Mutating
//! queries that implement a status transition are guarded by the expected
//! current status, so a read-modify-write that raced another writer becomes
//! a no-op (`Ok(false)`) instead of a lost update. The per-trade lock makes
//! such races unreachable in practice; the guard keeps them harmless even
//! if a caller slips past it.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tracing::debug;

use super::models::{
    to_f64, NewTrade, NewTradeUpdate, TradeFilter, TradeRecord, TradeUpdateLogRecord,
};
use super::{with_retry, DatabaseError, DbPool, RetryPolicy};
use crate::domain::entities::trade::{OrderRole, Trade, TradeStatus};

/// Repository for trade rows.
#[derive(Clone)]
pub struct TradeRepository {
    pool: DbPool,
    policy: RetryPolicy,
}

impl TradeRepository {
    pub fn new(pool: DbPool, policy: RetryPolicy) -> Self {
        Self { pool, policy }
    }

    /// Insert a new trade and return its store-assigned id.
    pub async fn insert(&self, trade: &NewTrade) -> Result<i64, DatabaseError> {
        let now = Utc::now();
        let id = with_retry(&self.policy, "insert trade", || {
            sqlx::query_scalar::<_, i64>(
                r#"
                INSERT INTO trades (
                    order_id, symbol, side, entry_price, quantity, position_size,
                    leverage, tp1_price, tp2_price, tp3_price, sl_price,
                    current_sl, current_tp, strategy_type, status, bot_name,
                    filled_at, created_at, updated_at
                )
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?11, ?8, ?12, ?13, ?14, ?15, ?16, ?16)
                RETURNING id
                "#,
            )
            .bind(trade.order_id.clone())
            .bind(trade.symbol.clone())
            .bind(trade.side.as_str())
            .bind(to_f64(trade.entry_price))
            .bind(to_f64(trade.quantity))
            .bind(to_f64(trade.position_size))
            .bind(trade.leverage as i64)
            .bind(trade.tp1_price.map(to_f64))
            .bind(trade.tp2_price.map(to_f64))
            .bind(trade.tp3_price.map(to_f64))
            .bind(to_f64(trade.sl_price))
            .bind(trade.strategy_type.clone())
            .bind(trade.status.as_str())
            .bind(trade.bot_name.clone())
            .bind(trade.filled_at)
            .bind(now)
            .fetch_one(&self.pool)
        })
        .await?;

        debug!("Inserted trade {} for {}", id, trade.symbol);
        Ok(id)
    }

    pub async fn get(&self, id: i64) -> Result<Option<Trade>, DatabaseError> {
        let record = with_retry(&self.policy, "get trade", || {
            sqlx::query_as::<_, TradeRecord>("SELECT * FROM trades WHERE id = ?1")
                .bind(id)
                .fetch_optional(&self.pool)
        })
        .await?;

        record.map(TradeRecord::into_domain).transpose()
    }

    /// Resolve the trade owning an exchange order id: the entry order or any
    /// take-profit leg.
    pub async fn find_by_order_id(&self, order_id: &str) -> Result<Option<Trade>, DatabaseError> {
        let record = with_retry(&self.policy, "find trade by order id", || {
            sqlx::query_as::<_, TradeRecord>(
                r#"
                SELECT * FROM trades
                WHERE order_id = ?1
                   OR tp1_order_id = ?1
                   OR tp2_order_id = ?1
                   OR tp3_order_id = ?1
                "#,
            )
            .bind(order_id.to_string())
            .fetch_optional(&self.pool)
        })
        .await?;

        record.map(TradeRecord::into_domain).transpose()
    }

    /// List trades, optionally filtered by bot name substring and status.
    pub async fn list(&self, filter: &TradeFilter) -> Result<Vec<Trade>, DatabaseError> {
        let bot_pattern = filter.bot_name.as_ref().map(|b| format!("%{b}%"));
        let status = filter.status.map(|s| s.as_str());

        let records = with_retry(&self.policy, "list trades", || {
            match (&bot_pattern, status) {
                (Some(bot), Some(status)) => sqlx::query_as::<_, TradeRecord>(
                    "SELECT * FROM trades WHERE bot_name LIKE ?1 AND status = ?2 ORDER BY created_at DESC",
                )
                .bind(bot.clone())
                .bind(status)
                .fetch_all(&self.pool),
                (Some(bot), None) => sqlx::query_as::<_, TradeRecord>(
                    "SELECT * FROM trades WHERE bot_name LIKE ?1 ORDER BY created_at DESC",
                )
                .bind(bot.clone())
                .fetch_all(&self.pool),
                (None, Some(status)) => sqlx::query_as::<_, TradeRecord>(
                    "SELECT * FROM trades WHERE status = ?1 ORDER BY created_at DESC",
                )
                .bind(status)
                .fetch_all(&self.pool),
                (None, None) => sqlx::query_as::<_, TradeRecord>(
                    "SELECT * FROM trades ORDER BY created_at DESC",
                )
                .fetch_all(&self.pool),
            }
        })
        .await?;

        records.into_iter().map(TradeRecord::into_domain).collect()
    }

    /// OPEN trades created at or before `cutoff` — the sweeper's work list.
    pub async fn open_older_than(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Trade>, DatabaseError> {
        let records = with_retry(&self.policy, "select stale open trades", || {
            sqlx::query_as::<_, TradeRecord>(
                "SELECT * FROM trades WHERE status = 'OPEN' AND created_at <= ?1",
            )
            .bind(cutoff)
            .fetch_all(&self.pool)
        })
        .await?;

        records.into_iter().map(TradeRecord::into_domain).collect()
    }

    /// Stamp the entry fill. Returns false when the trade is not OPEN or the
    /// fill was already recorded (duplicate event).
    pub async fn mark_filled(&self, id: i64, at: DateTime<Utc>) -> Result<bool, DatabaseError> {
        let rows = with_retry(&self.policy, "mark trade filled", || {
            sqlx::query(
                r#"
                UPDATE trades SET status = 'FILLED', filled_at = ?1, updated_at = ?1
                WHERE id = ?2 AND status = 'OPEN' AND filled_at IS NULL
                "#,
            )
            .bind(at)
            .bind(id)
            .execute(&self.pool)
        })
        .await?
        .rows_affected();

        Ok(rows > 0)
    }

    /// Guarded status transition: applies only while the row still carries
    /// `from`. Returns false when another writer got there first.
    pub async fn transition(
        &self,
        id: i64,
        from: TradeStatus,
        to: TradeStatus,
        closed_at: Option<DateTime<Utc>>,
    ) -> Result<bool, DatabaseError> {
        let now = Utc::now();
        let rows = with_retry(&self.policy, "transition trade status", || {
            sqlx::query(
                r#"
                UPDATE trades
                SET status = ?1, closed_at = COALESCE(?2, closed_at), updated_at = ?3
                WHERE id = ?4 AND status = ?5
                "#,
            )
            .bind(to.as_str())
            .bind(closed_at)
            .bind(now)
            .bind(id)
            .bind(from.as_str())
            .execute(&self.pool)
        })
        .await?
        .rows_affected();

        Ok(rows > 0)
    }

    /// Record a take-profit leg's order id. A leg is placed at most once:
    /// the column is written only while still NULL.
    pub async fn set_tp_order_id(
        &self,
        id: i64,
        role: OrderRole,
        order_id: &str,
    ) -> Result<bool, DatabaseError> {
        let column = match role {
            OrderRole::Tp1 => "tp1_order_id",
            OrderRole::Tp2 => "tp2_order_id",
            OrderRole::Tp3 => "tp3_order_id",
            OrderRole::Entry => {
                return Err(DatabaseError::QueryError(
                    "entry order id is immutable".to_string(),
                ))
            }
        };
        let sql = format!(
            "UPDATE trades SET {column} = ?1, updated_at = ?2 WHERE id = ?3 AND {column} IS NULL"
        );
        let now = Utc::now();
        let rows = with_retry(&self.policy, "record tp order id", || {
            sqlx::query(&sql)
                .bind(order_id.to_string())
                .bind(now)
                .bind(id)
                .execute(&self.pool)
        })
        .await?
        .rows_affected();

        Ok(rows > 0)
    }

    /// Persist a ratcheted stop after the exchange accepted it.
    pub async fn update_stop(&self, id: i64, new_stop: Decimal) -> Result<(), DatabaseError> {
        let now = Utc::now();
        with_retry(&self.policy, "update current stop", || {
            sqlx::query("UPDATE trades SET current_sl = ?1, updated_at = ?2 WHERE id = ?3")
                .bind(to_f64(new_stop))
                .bind(now)
                .bind(id)
                .execute(&self.pool)
        })
        .await?;
        Ok(())
    }

    /// Apply a take-profit ratchet: advance status, tighten the stop, record
    /// the active tp level and the pnl snapshot — guarded by the expected
    /// current status.
    #[allow(clippy::too_many_arguments)]
    pub async fn record_ratchet(
        &self,
        id: i64,
        expected: TradeStatus,
        to: TradeStatus,
        new_stop: Decimal,
        current_tp: Option<Decimal>,
        pnl: Decimal,
        pnl_percent: Decimal,
    ) -> Result<bool, DatabaseError> {
        let now = Utc::now();
        let rows = with_retry(&self.policy, "record tp ratchet", || {
            sqlx::query(
                r#"
                UPDATE trades
                SET status = ?1, current_sl = ?2, current_tp = ?3,
                    pnl = ?4, pnl_percent = ?5, updated_at = ?6
                WHERE id = ?7 AND status = ?8
                "#,
            )
            .bind(to.as_str())
            .bind(to_f64(new_stop))
            .bind(current_tp.map(to_f64))
            .bind(to_f64(pnl))
            .bind(to_f64(pnl_percent))
            .bind(now)
            .bind(id)
            .bind(expected.as_str())
            .execute(&self.pool)
        })
        .await?
        .rows_affected();

        Ok(rows > 0)
    }

    /// Persist the result of a partial or full close.
    #[allow(clippy::too_many_arguments)]
    pub async fn apply_close(
        &self,
        id: i64,
        remaining_quantity: Decimal,
        remaining_size: Decimal,
        pnl: Decimal,
        pnl_percent: Decimal,
        status: TradeStatus,
        closed_at: Option<DateTime<Utc>>,
    ) -> Result<(), DatabaseError> {
        let now = Utc::now();
        with_retry(&self.policy, "apply close", || {
            sqlx::query(
                r#"
                UPDATE trades
                SET quantity = ?1, position_size = ?2, status = ?3,
                    closed_at = COALESCE(?4, closed_at), pnl = ?5, pnl_percent = ?6,
                    updated_at = ?7
                WHERE id = ?8
                "#,
            )
            .bind(to_f64(remaining_quantity))
            .bind(to_f64(remaining_size))
            .bind(status.as_str())
            .bind(closed_at)
            .bind(to_f64(pnl))
            .bind(to_f64(pnl_percent))
            .bind(now)
            .bind(id)
            .execute(&self.pool)
        })
        .await?;
        Ok(())
    }
}

/// Append-only repository for the trade audit trail. No update or delete
/// path exists; entries are kept for forensic replay.
#[derive(Clone)]
pub struct TradeUpdateLogRepository {
    pool: DbPool,
    policy: RetryPolicy,
}

impl TradeUpdateLogRepository {
    pub fn new(pool: DbPool, policy: RetryPolicy) -> Self {
        Self { pool, policy }
    }

    pub async fn append(&self, entry: &NewTradeUpdate) -> Result<(), DatabaseError> {
        let now = Utc::now();
        // Note length is capped the way the original schema caps it.
        let notes = entry.notes.as_ref().map(|n| {
            let mut n = n.clone();
            n.truncate(255);
            n
        });
        with_retry(&self.policy, "append trade update", || {
            sqlx::query(
                r#"
                INSERT INTO trade_updates (trade_id, status, price, sl_price, tp_price, pnl, notes, created_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                "#,
            )
            .bind(entry.trade_id)
            .bind(entry.status.as_str())
            .bind(entry.price.map(to_f64))
            .bind(entry.sl_price.map(to_f64))
            .bind(entry.tp_price.map(to_f64))
            .bind(entry.pnl.map(to_f64))
            .bind(notes.clone())
            .bind(now)
            .execute(&self.pool)
        })
        .await?;
        Ok(())
    }

    pub async fn for_trade(&self, trade_id: i64) -> Result<Vec<TradeUpdateLogRecord>, DatabaseError> {
        with_retry(&self.policy, "list trade updates", || {
            sqlx::query_as::<_, TradeUpdateLogRecord>(
                "SELECT * FROM trade_updates WHERE trade_id = ?1 ORDER BY id ASC",
            )
            .bind(trade_id)
            .fetch_all(&self.pool)
        })
        .await
    }
}
