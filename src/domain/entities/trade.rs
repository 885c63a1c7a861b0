use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

/// Direction of a trade, in exchange terms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "Buy",
            Side::Sell => "Sell",
        }
    }

    pub fn opposite(&self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }

    /// Hedge-mode position index used by the exchange (1 = Buy, 2 = Sell).
    pub fn position_idx(&self) -> u8 {
        match self {
            Side::Buy => 1,
            Side::Sell => 2,
        }
    }

    pub fn parse(value: &str) -> Option<Side> {
        match value.to_ascii_uppercase().as_str() {
            "BUY" | "LONG" => Some(Side::Buy),
            "SELL" | "SHORT" => Some(Side::Sell),
            _ => None,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Lifecycle status of a trade.
///
/// `Closed`, `Cancelled`, `StopLoss` and `TakeProfit` are terminal: once a
/// trade carries one of them, only the audit log may still grow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TradeStatus {
    Open,
    Filled,
    Tp1Hit,
    Tp2Hit,
    Closed,
    Cancelled,
    StopLoss,
    TakeProfit,
}

impl TradeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeStatus::Open => "OPEN",
            TradeStatus::Filled => "FILLED",
            TradeStatus::Tp1Hit => "TP1_HIT",
            TradeStatus::Tp2Hit => "TP2_HIT",
            TradeStatus::Closed => "CLOSED",
            TradeStatus::Cancelled => "CANCELLED",
            TradeStatus::StopLoss => "STOPLOSS",
            TradeStatus::TakeProfit => "TAKEPROFIT",
        }
    }

    pub fn parse(value: &str) -> Option<TradeStatus> {
        match value {
            "OPEN" => Some(TradeStatus::Open),
            "FILLED" => Some(TradeStatus::Filled),
            "TP1_HIT" => Some(TradeStatus::Tp1Hit),
            "TP2_HIT" => Some(TradeStatus::Tp2Hit),
            "CLOSED" => Some(TradeStatus::Closed),
            "CANCELLED" => Some(TradeStatus::Cancelled),
            "STOPLOSS" => Some(TradeStatus::StopLoss),
            "TAKEPROFIT" => Some(TradeStatus::TakeProfit),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TradeStatus::Closed
                | TradeStatus::Cancelled
                | TradeStatus::StopLoss
                | TradeStatus::TakeProfit
        )
    }

    /// Whether `next` is a legal successor of `self` in the lifecycle graph.
    pub fn can_transition_to(&self, next: TradeStatus) -> bool {
        use TradeStatus::*;
        match self {
            Open => matches!(next, Filled | Cancelled),
            Filled => matches!(next, Tp1Hit | Closed | Cancelled | StopLoss | TakeProfit),
            Tp1Hit => matches!(next, Tp2Hit | Closed | StopLoss),
            Tp2Hit => matches!(next, Closed | StopLoss),
            Closed | Cancelled | StopLoss | TakeProfit => false,
        }
    }
}

impl std::fmt::Display for TradeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Which of a trade's exchange orders an order id refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderRole {
    Entry,
    Tp1,
    Tp2,
    Tp3,
}

/// One opened position attempt, as tracked in the store.
#[derive(Debug, Clone)]
pub struct Trade {
    pub id: i64,
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
    pub current_sl: Decimal,
    pub current_tp: Option<Decimal>,
    pub tp1_order_id: Option<String>,
    pub tp2_order_id: Option<String>,
    pub tp3_order_id: Option<String>,
    pub strategy_type: String,
    pub status: TradeStatus,
    pub bot_name: String,
    pub pnl: Decimal,
    pub pnl_percent: Decimal,
    pub filled_at: Option<DateTime<Utc>>,
    pub closed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Trade {
    /// Resolve which of this trade's orders `order_id` belongs to, if any.
    pub fn order_role(&self, order_id: &str) -> Option<OrderRole> {
        if self.order_id == order_id {
            return Some(OrderRole::Entry);
        }
        if self.tp1_order_id.as_deref() == Some(order_id) {
            return Some(OrderRole::Tp1);
        }
        if self.tp2_order_id.as_deref() == Some(order_id) {
            return Some(OrderRole::Tp2);
        }
        if self.tp3_order_id.as_deref() == Some(order_id) {
            return Some(OrderRole::Tp3);
        }
        None
    }

    pub fn hit_tp1(&self, price: Decimal) -> bool {
        match (self.tp1_price, self.side) {
            (Some(tp), Side::Buy) => price >= tp,
            (Some(tp), Side::Sell) => price <= tp,
            (None, _) => false,
        }
    }

    pub fn hit_tp2(&self, price: Decimal) -> bool {
        match (self.tp2_price, self.side) {
            (Some(tp), Side::Buy) => price >= tp,
            (Some(tp), Side::Sell) => price <= tp,
            (None, _) => false,
        }
    }

    pub fn hit_stop_loss(&self, price: Decimal) -> bool {
        match self.side {
            Side::Buy => price <= self.current_sl,
            Side::Sell => price >= self.current_sl,
        }
    }

    /// Unrealized pnl at `price`: (exit - entry) * quantity * leverage,
    /// sign-flipped for Sell.
    pub fn unrealized_pnl(&self, price: Decimal) -> Decimal {
        let diff = match self.side {
            Side::Buy => price - self.entry_price,
            Side::Sell => self.entry_price - price,
        };
        diff * self.quantity * Decimal::from(self.leverage)
    }

    /// Whether `new_stop` locks in at least as much profit as the current
    /// stop for this trade's direction.
    pub fn stop_tightens(&self, new_stop: Decimal) -> bool {
        match self.side {
            Side::Buy => new_stop >= self.current_sl,
            Side::Sell => new_stop <= self.current_sl,
        }
    }
}
