use thiserror::Error;

use crate::domain::repositories::exchange_gateway::GatewayError;
use crate::persistence::DatabaseError;

/// Errors surfaced by the trade lifecycle engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Malformed or inconsistent input, rejected before any external call.
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("trade not found: {0}")]
    TradeNotFound(i64),

    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error(transparent)]
    Store(#[from] DatabaseError),
}

impl EngineError {
    pub fn validation(msg: impl Into<String>) -> Self {
        EngineError::Validation(msg.into())
    }
}
