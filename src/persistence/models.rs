//! Database Models
//!
//! Row-level structures for the trades table and the append-only
//! trade_updates audit log. SQLite stores money columns as REAL; the domain
//! works in fixed-point `Decimal`, converted at this boundary.

use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use sqlx::FromRow;

use super::DatabaseError;
use crate::domain::entities::trade::{Side, Trade, TradeStatus};

pub(crate) fn to_f64(value: Decimal) -> f64 {
    value.to_f64().unwrap_or(0.0)
}

pub(crate) fn to_decimal(value: f64) -> Decimal {
    Decimal::from_f64_retain(value).unwrap_or(Decimal::ZERO)
}

/// Trade row as stored.
#[derive(Debug, Clone, FromRow)]
pub struct TradeRecord {
    pub id: i64,
    pub order_id: String,
    pub symbol: String,
    pub side: String,
    pub entry_price: f64,
    pub quantity: f64,
    pub position_size: f64,
    pub leverage: i64,
    pub tp1_price: Option<f64>,
    pub tp2_price: Option<f64>,
    pub tp3_price: Option<f64>,
    pub sl_price: f64,
    pub current_sl: f64,
    pub current_tp: Option<f64>,
    pub tp1_order_id: Option<String>,
    pub tp2_order_id: Option<String>,
    pub tp3_order_id: Option<String>,
    pub strategy_type: String,
    pub status: String,
    pub bot_name: String,
    pub pnl: f64,
    pub pnl_percent: f64,
    pub filled_at: Option<DateTime<Utc>>,
    pub closed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TradeRecord {
    pub fn into_domain(self) -> Result<Trade, DatabaseError> {
        let side = Side::parse(&self.side).ok_or_else(|| {
            DatabaseError::QueryError(format!("trade {}: unknown side '{}'", self.id, self.side))
        })?;
        let status = TradeStatus::parse(&self.status).ok_or_else(|| {
            DatabaseError::QueryError(format!(
                "trade {}: unknown status '{}'",
                self.id, self.status
            ))
        })?;

        Ok(Trade {
            id: self.id,
            order_id: self.order_id,
            symbol: self.symbol,
            side,
            entry_price: to_decimal(self.entry_price),
            quantity: to_decimal(self.quantity),
            position_size: to_decimal(self.position_size),
            leverage: self.leverage.max(1) as u32,
            tp1_price: self.tp1_price.map(to_decimal),
            tp2_price: self.tp2_price.map(to_decimal),
            tp3_price: self.tp3_price.map(to_decimal),
            sl_price: to_decimal(self.sl_price),
            current_sl: to_decimal(self.current_sl),
            current_tp: self.current_tp.map(to_decimal),
            tp1_order_id: self.tp1_order_id,
            tp2_order_id: self.tp2_order_id,
            tp3_order_id: self.tp3_order_id,
            strategy_type: self.strategy_type,
            status,
            bot_name: self.bot_name,
            pnl: to_decimal(self.pnl),
            pnl_percent: to_decimal(self.pnl_percent),
            filled_at: self.filled_at,
            closed_at: self.closed_at,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

/// Input for inserting a new trade.
#[derive(Debug, Clone)]
pub struct NewTrade {
    pub order_id: String,
    pub symbol: String,
    pub side: Side,
    pub entry_price: Decimal,
    pub quantity: Decimal,
    pub position_size: Decimal,
    pub leverage: u32,
    pub tp1_price: Option<Decimal>,
    pub tp2_price: Option<Decimal>,
    pub tp3_price: Option<Decimal>,
    pub sl_price: Decimal,
    pub strategy_type: String,
    pub status: TradeStatus,
    pub bot_name: String,
    pub filled_at: Option<DateTime<Utc>>,
}

/// Append-only audit log row.
#[derive(Debug, Clone, FromRow)]
pub struct TradeUpdateLogRecord {
    pub id: i64,
    pub trade_id: i64,
    pub status: String,
    pub price: Option<f64>,
    pub sl_price: Option<f64>,
    pub tp_price: Option<f64>,
    pub pnl: Option<f64>,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Input for one audit log entry.
#[derive(Debug, Clone)]
pub struct NewTradeUpdate {
    pub trade_id: i64,
    pub status: TradeStatus,
    pub price: Option<Decimal>,
    pub sl_price: Option<Decimal>,
    pub tp_price: Option<Decimal>,
    pub pnl: Option<Decimal>,
    pub notes: Option<String>,
}

impl NewTradeUpdate {
    pub fn new(trade_id: i64, status: TradeStatus) -> Self {
        NewTradeUpdate {
            trade_id,
            status,
            price: None,
            sl_price: None,
            tp_price: None,
            pnl: None,
            notes: None,
        }
    }

    pub fn price(mut self, price: Decimal) -> Self {
        self.price = Some(price);
        self
    }

    pub fn stop(mut self, sl_price: Decimal) -> Self {
        self.sl_price = Some(sl_price);
        self
    }

    pub fn tp(mut self, tp_price: Decimal) -> Self {
        self.tp_price = Some(tp_price);
        self
    }

    pub fn pnl(mut self, pnl: Decimal) -> Self {
        self.pnl = Some(pnl);
        self
    }

    pub fn note(mut self, notes: impl Into<String>) -> Self {
        self.notes = Some(notes.into());
        self
    }
}

/// Filter for trade listings.
#[derive(Debug, Clone, Default)]
pub struct TradeFilter {
    pub bot_name: Option<String>,
    pub status: Option<TradeStatus>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_decimal_boundary_conversions() {
        assert_eq!(to_decimal(1.5), dec!(1.5));
        assert_eq!(to_f64(dec!(1.5)), 1.5);
        assert_eq!(to_decimal(f64::NAN), Decimal::ZERO);
    }

    #[test]
    fn test_record_into_domain_rejects_unknown_status() {
        let now = Utc::now();
        let record = TradeRecord {
            id: 1,
            order_id: "o".to_string(),
            symbol: "BTCUSDT".to_string(),
            side: "Buy".to_string(),
            entry_price: 100.0,
            quantity: 1.0,
            position_size: 300.0,
            leverage: 5,
            tp1_price: None,
            tp2_price: None,
            tp3_price: None,
            sl_price: 90.0,
            current_sl: 90.0,
            current_tp: None,
            tp1_order_id: None,
            tp2_order_id: None,
            tp3_order_id: None,
            strategy_type: "strategy1".to_string(),
            status: "GARBAGE".to_string(),
            bot_name: "bot".to_string(),
            pnl: 0.0,
            pnl_percent: 0.0,
            filled_at: None,
            closed_at: None,
            created_at: now,
            updated_at: now,
        };
        assert!(record.into_domain().is_err());
    }

    #[test]
    fn test_update_builder() {
        let update = NewTradeUpdate::new(7, TradeStatus::Tp1Hit)
            .price(dec!(110))
            .stop(dec!(100))
            .pnl(dec!(50))
            .note("tp1 filled");
        assert_eq!(update.trade_id, 7);
        assert_eq!(update.price, Some(dec!(110)));
        assert_eq!(update.notes.as_deref(), Some("tp1 filled"));
    }
}
