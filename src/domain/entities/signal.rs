//! Signal Intake
//!
//! Validates and normalizes an inbound trade signal into an [`OrderIntent`]
//! the lifecycle engine can act on. Validation happens before any external
//! call; a rejected signal persists nothing.

use rust_decimal::Decimal;
use serde::Deserialize;

use crate::config::TradingConfig;
use crate::domain::entities::trade::Side;
use crate::domain::errors::EngineError;

/// Raw trade signal as delivered by an upstream bot.
#[derive(Debug, Clone, Deserialize)]
pub struct TradeSignal {
    pub symbol: String,
    /// "LONG"/"SHORT" (or "Buy"/"Sell").
    pub position: String,
    pub entry: f64,
    pub strategy_type: String,
    #[serde(default)]
    pub leverage: Option<u32>,
    pub tp1: f64,
    pub tp2: f64,
    #[serde(default)]
    pub tp3: Option<f64>,
    pub stoploss: f64,
    pub bot: String,
}

/// How the entry order is submitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    /// Immediate market entry; the trade starts life FILLED.
    Market,
    /// Resting limit entry at the signalled price; the trade starts OPEN.
    Limit,
}

/// A validated, normalized order intent.
#[derive(Debug, Clone)]
pub struct OrderIntent {
    pub symbol: String,
    pub side: Side,
    pub entry: Decimal,
    pub leverage: u32,
    pub tp1: Decimal,
    pub tp2: Decimal,
    pub tp3: Option<Decimal>,
    pub stop_loss: Decimal,
    /// Quote-currency notional to deploy, selected by strategy tag.
    pub notional: Decimal,
    pub strategy_type: String,
    pub bot_name: String,
    pub mode: ExecutionMode,
}

fn positive_decimal(field: &str, value: f64) -> Result<Decimal, EngineError> {
    let dec = Decimal::from_f64_retain(value)
        .ok_or_else(|| EngineError::validation(format!("{field} is not a finite number")))?;
    if dec <= Decimal::ZERO {
        return Err(EngineError::validation(format!("{field} must be positive")));
    }
    Ok(dec)
}

impl OrderIntent {
    pub fn try_from_signal(
        signal: &TradeSignal,
        mode: ExecutionMode,
        config: &TradingConfig,
    ) -> Result<OrderIntent, EngineError> {
        if signal.symbol.trim().is_empty() {
            return Err(EngineError::validation("symbol is required"));
        }

        let side = Side::parse(&signal.position).ok_or_else(|| {
            EngineError::validation(format!(
                "position '{}' is not one of LONG/SHORT/Buy/Sell",
                signal.position
            ))
        })?;

        let notional = config.notional_for(&signal.strategy_type).ok_or_else(|| {
            EngineError::validation(format!("unknown strategy_type '{}'", signal.strategy_type))
        })?;

        let leverage = signal.leverage.unwrap_or(config.default_leverage);
        if leverage == 0 || leverage > 100 {
            return Err(EngineError::validation(format!(
                "leverage {leverage} out of range (1-100)"
            )));
        }

        let entry = positive_decimal("entry", signal.entry)?;
        let tp1 = positive_decimal("tp1", signal.tp1)?;
        let tp2 = positive_decimal("tp2", signal.tp2)?;
        let stop_loss = positive_decimal("stoploss", signal.stoploss)?;
        let tp3 = match signal.tp3 {
            Some(v) if v > 0.0 => Some(positive_decimal("tp3", v)?),
            _ => None,
        };

        Ok(OrderIntent {
            symbol: signal.symbol.trim().to_string(),
            side,
            entry,
            leverage,
            tp1,
            tp2,
            tp3,
            stop_loss,
            notional,
            strategy_type: signal.strategy_type.clone(),
            bot_name: signal.bot.clone(),
            mode,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn sample_signal() -> TradeSignal {
        TradeSignal {
            symbol: "BTCUSDT".to_string(),
            position: "LONG".to_string(),
            entry: 50000.0,
            strategy_type: "strategy1".to_string(),
            leverage: Some(5),
            tp1: 51000.0,
            tp2: 52000.0,
            tp3: Some(53000.0),
            stoploss: 49000.0,
            bot: "ema-cross".to_string(),
        }
    }

    #[test]
    fn test_valid_signal_normalizes() {
        let config = TradingConfig::default();
        let intent =
            OrderIntent::try_from_signal(&sample_signal(), ExecutionMode::Market, &config).unwrap();
        assert_eq!(intent.side, Side::Buy);
        assert_eq!(intent.entry, dec!(50000));
        assert_eq!(intent.leverage, 5);
        assert_eq!(intent.tp3, Some(dec!(53000)));
        assert!(intent.notional > Decimal::ZERO);
    }

    #[test]
    fn test_short_position_parses_to_sell() {
        let config = TradingConfig::default();
        let mut signal = sample_signal();
        signal.position = "SHORT".to_string();
        let intent =
            OrderIntent::try_from_signal(&signal, ExecutionMode::Limit, &config).unwrap();
        assert_eq!(intent.side, Side::Sell);
        assert_eq!(intent.mode, ExecutionMode::Limit);
    }

    #[test]
    fn test_unknown_strategy_rejected() {
        let config = TradingConfig::default();
        let mut signal = sample_signal();
        signal.strategy_type = "mystery".to_string();
        let err = OrderIntent::try_from_signal(&signal, ExecutionMode::Market, &config)
            .unwrap_err();
        assert!(err.to_string().contains("strategy_type"));
    }

    #[test]
    fn test_bad_side_rejected() {
        let config = TradingConfig::default();
        let mut signal = sample_signal();
        signal.position = "SIDEWAYS".to_string();
        assert!(OrderIntent::try_from_signal(&signal, ExecutionMode::Market, &config).is_err());
    }

    #[test]
    fn test_non_positive_entry_rejected() {
        let config = TradingConfig::default();
        let mut signal = sample_signal();
        signal.entry = 0.0;
        assert!(OrderIntent::try_from_signal(&signal, ExecutionMode::Market, &config).is_err());
    }

    #[test]
    fn test_leverage_default_and_bounds() {
        let config = TradingConfig::default();
        let mut signal = sample_signal();
        signal.leverage = None;
        let intent =
            OrderIntent::try_from_signal(&signal, ExecutionMode::Market, &config).unwrap();
        assert_eq!(intent.leverage, config.default_leverage);

        signal.leverage = Some(101);
        assert!(OrderIntent::try_from_signal(&signal, ExecutionMode::Market, &config).is_err());
    }

    #[test]
    fn test_zero_tp3_treated_as_absent() {
        let config = TradingConfig::default();
        let mut signal = sample_signal();
        signal.tp3 = Some(0.0);
        let intent =
            OrderIntent::try_from_signal(&signal, ExecutionMode::Market, &config).unwrap();
        assert_eq!(intent.tp3, None);
    }
}
