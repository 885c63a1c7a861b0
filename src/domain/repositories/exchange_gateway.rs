//! Exchange Gateway Trait
//!
//! Defines the `ExchangeGateway` trait, the seam between the lifecycle
//! engine and the concrete exchange integration. The engine only ever talks
//! to this interface, which keeps the transition logic testable against a
//! mock and independent of exchange plumbing.
//!
//! Order placement and cancellation are not idempotent and must never be
//! auto-retried; only the read calls (`positions`, `open_orders`,
//! `instrument_step`) are safe to retry.

use async_trait::async_trait;
use rust_decimal::Decimal;
use thiserror::Error;

use crate::domain::entities::trade::Side;

pub type GatewayResult<T> = Result<T, GatewayError>;

/// Errors that can occur talking to the exchange.
#[derive(Debug, Error, Clone)]
pub enum GatewayError {
    /// Exchange returned a non-success retCode.
    #[error("exchange rejected request (retCode {code}): {message}")]
    Rejected { code: i64, message: String },

    /// A close was attempted but the exchange reports no open position.
    /// Callers treat this as "already closed", not a failure.
    #[error("position already closed on exchange")]
    PositionAlreadyZero,

    #[error("network error: {0}")]
    Network(String),

    #[error("request timed out")]
    Timeout,

    #[error("authentication error: {0}")]
    Auth(String),

    #[error("malformed exchange response: {0}")]
    BadResponse(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderKind {
    Market,
    Limit,
}

/// Parameters for a single order placement.
#[derive(Debug, Clone)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: Side,
    pub kind: OrderKind,
    pub quantity: Decimal,
    pub price: Option<Decimal>,
    pub reduce_only: bool,
    pub stop_loss: Option<Decimal>,
    pub position_idx: u8,
}

impl OrderRequest {
    /// An entry order opening exposure, with the protective stop attached.
    pub fn entry(
        symbol: &str,
        side: Side,
        kind: OrderKind,
        quantity: Decimal,
        price: Option<Decimal>,
        stop_loss: Decimal,
    ) -> Self {
        OrderRequest {
            symbol: symbol.to_string(),
            side,
            kind,
            quantity,
            price,
            reduce_only: false,
            stop_loss: Some(stop_loss),
            position_idx: side.position_idx(),
        }
    }

    /// A reduce-only market order shrinking an existing position. The order
    /// is placed on the opposite side but indexed by the position it reduces.
    pub fn reduce_market(symbol: &str, position_side: Side, quantity: Decimal) -> Self {
        OrderRequest {
            symbol: symbol.to_string(),
            side: position_side.opposite(),
            kind: OrderKind::Market,
            quantity,
            price: None,
            reduce_only: true,
            stop_loss: None,
            position_idx: position_side.position_idx(),
        }
    }

    /// A reduce-only limit order: one take-profit ladder leg.
    pub fn reduce_limit(symbol: &str, position_side: Side, quantity: Decimal, price: Decimal) -> Self {
        OrderRequest {
            symbol: symbol.to_string(),
            side: position_side.opposite(),
            kind: OrderKind::Limit,
            quantity,
            price: Some(price),
            reduce_only: true,
            stop_loss: None,
            position_idx: position_side.position_idx(),
        }
    }
}

/// Exchange acknowledgement of an accepted order.
#[derive(Debug, Clone)]
pub struct OrderReceipt {
    pub order_id: String,
    /// Average fill price, when the exchange reports an immediate execution.
    pub avg_price: Option<Decimal>,
}

/// A live position as reported by the exchange.
#[derive(Debug, Clone)]
pub struct PositionView {
    pub symbol: String,
    pub side: Side,
    pub size: Decimal,
    pub leverage: u32,
}

/// A resting order as reported by the exchange.
#[derive(Debug, Clone)]
pub struct OpenOrderView {
    pub order_id: String,
    pub symbol: String,
    pub side: Side,
}

/// Gateway to the single configured exchange.
#[async_trait]
pub trait ExchangeGateway: Send + Sync {
    /// Name of the exchange, for logging.
    fn name(&self) -> &str;

    /// Place an order. Not retryable: a duplicate submission duplicates
    /// exposure.
    async fn place_order(&self, request: &OrderRequest) -> GatewayResult<OrderReceipt>;

    /// Cancel a resting order. Not retryable.
    async fn cancel_order(&self, symbol: &str, order_id: &str) -> GatewayResult<()>;

    /// Open positions for a symbol. Idempotent read.
    async fn positions(&self, symbol: &str) -> GatewayResult<Vec<PositionView>>;

    /// Resting orders for a symbol, optionally filtered by side. Idempotent
    /// read.
    async fn open_orders(&self, symbol: &str, side: Option<Side>) -> GatewayResult<Vec<OpenOrderView>>;

    /// Set position leverage for a symbol.
    async fn set_leverage(&self, symbol: &str, leverage: u32) -> GatewayResult<()>;

    /// Move the protective stop for the position on `side`.
    async fn set_stop_loss(&self, symbol: &str, side: Side, stop: Decimal) -> GatewayResult<()>;

    /// The exchange-mandated quantity granularity for a symbol. Idempotent
    /// read.
    async fn instrument_step(&self, symbol: &str) -> GatewayResult<Decimal>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_reduce_market_flips_side_keeps_index() {
        let req = OrderRequest::reduce_market("BTCUSDT", Side::Buy, dec!(0.5));
        assert_eq!(req.side, Side::Sell);
        assert_eq!(req.position_idx, 1);
        assert!(req.reduce_only);
        assert_eq!(req.kind, OrderKind::Market);
    }

    #[test]
    fn test_entry_carries_stop() {
        let req = OrderRequest::entry(
            "ETHUSDT",
            Side::Sell,
            OrderKind::Limit,
            dec!(1.5),
            Some(dec!(2000)),
            dec!(2100),
        );
        assert_eq!(req.stop_loss, Some(dec!(2100)));
        assert_eq!(req.position_idx, 2);
        assert!(!req.reduce_only);
    }

    #[test]
    fn test_rejected_display() {
        let err = GatewayError::Rejected {
            code: 10001,
            message: "params error".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "exchange rejected request (retCode 10001): params error"
        );
    }
}
