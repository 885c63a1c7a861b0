use std::collections::HashMap;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

/// Runtime configuration for the trading engine.
#[derive(Debug, Clone)]
pub struct TradingConfig {
    pub database_url: String,
    pub listen_addr: String,

    pub bybit_api_key: String,
    pub bybit_api_secret: String,
    pub testnet: bool,

    pub default_leverage: u32,
    /// Quote-currency notional deployed per strategy tag.
    pub strategy_notionals: HashMap<String, Decimal>,
    /// Fixed notional allocation per take-profit leg. Legs are reduce-only,
    /// so an allocation larger than the remaining position cannot over-close.
    pub tp1_notional: Decimal,
    pub tp2_notional: Decimal,
    /// Third ladder leg; zero means modeled but never placed.
    pub tp3_notional: Decimal,

    pub sweep_interval_secs: u64,
    /// OPEN trades older than this are swept and cancelled.
    pub stale_order_max_age_mins: i64,

    pub gateway_timeout_ms: u64,

    pub store_retry_attempts: u32,
    pub store_retry_base_delay_ms: u64,

    /// Lookup retries while an event's trade row may not be visible yet.
    pub event_lookup_attempts: u32,
    pub event_lookup_delay_ms: u64,
}

impl Default for TradingConfig {
    fn default() -> Self {
        let mut strategy_notionals = HashMap::new();
        strategy_notionals.insert("strategy1".to_string(), dec!(300));
        strategy_notionals.insert("strategy2".to_string(), dec!(100));

        TradingConfig {
            database_url: "sqlite://data/echelon.db".to_string(),
            listen_addr: "127.0.0.1:5001".to_string(),
            bybit_api_key: String::new(),
            bybit_api_secret: String::new(),
            testnet: true,
            default_leverage: 5,
            strategy_notionals,
            tp1_notional: dec!(150),
            tp2_notional: dec!(90),
            tp3_notional: Decimal::ZERO,
            sweep_interval_secs: 600,
            stale_order_max_age_mins: 60,
            gateway_timeout_ms: 10_000,
            store_retry_attempts: 3,
            store_retry_base_delay_ms: 500,
            event_lookup_attempts: 3,
            event_lookup_delay_ms: 250,
        }
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_decimal_or(key: &str, default: Decimal) -> Decimal {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl TradingConfig {
    /// Load configuration from environment variables, falling back to
    /// defaults for anything unset.
    pub fn from_env() -> TradingConfig {
        let defaults = TradingConfig::default();

        let mut strategy_notionals = defaults.strategy_notionals.clone();
        if let Some(v) = std::env::var("STRATEGY1_NOTIONAL").ok().and_then(|v| v.parse().ok()) {
            strategy_notionals.insert("strategy1".to_string(), v);
        }
        if let Some(v) = std::env::var("STRATEGY2_NOTIONAL").ok().and_then(|v| v.parse().ok()) {
            strategy_notionals.insert("strategy2".to_string(), v);
        }

        TradingConfig {
            database_url: std::env::var("DATABASE_URL").unwrap_or(defaults.database_url),
            listen_addr: std::env::var("LISTEN_ADDR").unwrap_or(defaults.listen_addr),
            bybit_api_key: std::env::var("BYBIT_API_KEY").unwrap_or_default(),
            bybit_api_secret: std::env::var("BYBIT_API_SECRET").unwrap_or_default(),
            testnet: std::env::var("EVN").map(|v| v != "mainnet").unwrap_or(true),
            default_leverage: env_or("DEFAULT_LEVERAGE", defaults.default_leverage),
            strategy_notionals,
            tp1_notional: env_decimal_or("TP1_NOTIONAL", defaults.tp1_notional),
            tp2_notional: env_decimal_or("TP2_NOTIONAL", defaults.tp2_notional),
            tp3_notional: env_decimal_or("TP3_NOTIONAL", defaults.tp3_notional),
            sweep_interval_secs: env_or("SWEEP_INTERVAL_SECS", defaults.sweep_interval_secs),
            stale_order_max_age_mins: env_or(
                "STALE_ORDER_MAX_AGE_MINS",
                defaults.stale_order_max_age_mins,
            ),
            gateway_timeout_ms: env_or("GATEWAY_TIMEOUT_MS", defaults.gateway_timeout_ms),
            store_retry_attempts: env_or("STORE_RETRY_ATTEMPTS", defaults.store_retry_attempts),
            store_retry_base_delay_ms: env_or(
                "STORE_RETRY_BASE_DELAY_MS",
                defaults.store_retry_base_delay_ms,
            ),
            event_lookup_attempts: env_or("EVENT_LOOKUP_ATTEMPTS", defaults.event_lookup_attempts),
            event_lookup_delay_ms: env_or("EVENT_LOOKUP_DELAY_MS", defaults.event_lookup_delay_ms),
        }
    }

    /// Notional configured for a strategy tag, if the tag is known.
    pub fn notional_for(&self, strategy_type: &str) -> Option<Decimal> {
        self.strategy_notionals.get(strategy_type).copied()
    }

    /// Ladder legs as (index, allocation) pairs; zero allocations are
    /// skipped at placement time.
    pub fn ladder_notionals(&self) -> [Decimal; 3] {
        [self.tp1_notional, self.tp2_notional, self.tp3_notional]
    }
}
