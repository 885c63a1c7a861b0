//! Order sizing and pnl arithmetic.
//!
//! All money math runs in fixed-point `Decimal`; binary floating point never
//! touches a quantity or a pnl figure.

use rust_decimal::{Decimal, RoundingStrategy};

use crate::domain::entities::trade::Side;

/// Decimal places quantities are carried at, matching the exchange's
/// maximum precision.
pub const QTY_SCALE: u32 = 8;

/// Round `quantity` down to a multiple of the instrument's quantity step.
/// A non-positive step leaves the quantity unchanged.
pub fn round_down_to_step(quantity: Decimal, step: Decimal) -> Decimal {
    if step <= Decimal::ZERO {
        return quantity;
    }
    (quantity / step).floor() * step
}

/// Order quantity for a quote-currency notional at `entry`, rounded down to
/// the instrument step. Returns zero when the notional is too small for one
/// step (callers reject zero-quantity orders).
pub fn quantity_for_notional(notional: Decimal, entry: Decimal, step: Decimal) -> Decimal {
    if entry <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    let raw = (notional / entry).round_dp_with_strategy(QTY_SCALE, RoundingStrategy::ToZero);
    round_down_to_step(raw, step)
}

/// Realized pnl for closing `quantity` at `exit`:
/// (exit - entry) * quantity * leverage, sign-flipped for Sell.
pub fn realized_pnl(side: Side, entry: Decimal, exit: Decimal, quantity: Decimal, leverage: u32) -> Decimal {
    let diff = match side {
        Side::Buy => exit - entry,
        Side::Sell => entry - exit,
    };
    diff * quantity * Decimal::from(leverage)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_round_down_to_step() {
        assert_eq!(round_down_to_step(dec!(0.1234), dec!(0.01)), dec!(0.12));
        assert_eq!(round_down_to_step(dec!(0.1299), dec!(0.01)), dec!(0.12));
        assert_eq!(round_down_to_step(dec!(5), dec!(1)), dec!(5));
        // degenerate step leaves quantity untouched
        assert_eq!(round_down_to_step(dec!(0.1234), Decimal::ZERO), dec!(0.1234));
    }

    #[test]
    fn test_quantity_for_notional() {
        // 300 USDT at 50000 with 0.001 step: 0.006
        assert_eq!(
            quantity_for_notional(dec!(300), dec!(50000), dec!(0.001)),
            dec!(0.006)
        );
        // notional smaller than one step rounds to zero
        assert_eq!(
            quantity_for_notional(dec!(10), dec!(50000), dec!(0.001)),
            dec!(0.000)
        );
        assert_eq!(quantity_for_notional(dec!(300), Decimal::ZERO, dec!(0.001)), Decimal::ZERO);
    }

    #[test]
    fn test_realized_pnl_long() {
        // entry 100, close 110, qty 1, leverage 5 => 50
        assert_eq!(
            realized_pnl(Side::Buy, dec!(100), dec!(110), dec!(1), 5),
            dec!(50)
        );
    }

    #[test]
    fn test_realized_pnl_short() {
        // entry 2000, close 1900, qty 0.5, leverage 3 => 150
        assert_eq!(
            realized_pnl(Side::Sell, dec!(2000), dec!(1900), dec!(0.5), 3),
            dec!(150)
        );
    }

    #[test]
    fn test_realized_pnl_loss() {
        assert_eq!(
            realized_pnl(Side::Buy, dec!(100), dec!(95), dec!(2), 4),
            dec!(-40)
        );
    }
}
