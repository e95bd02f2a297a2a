//! Decimal arithmetic utilities for price and balance calculations.

use rust_decimal::{Decimal, RoundingStrategy};
use rust_decimal_macros::dec;

/// Smallest order volume step accepted for the spot pairs we trade.
pub const VOLUME_STEP: Decimal = dec!(0.00000001);

/// Percent change from `from` to `to` (e.g. 100 -> 97 = -3).
///
/// Returns zero when `from` is zero.
pub fn pct_change(from: Decimal, to: Decimal) -> Decimal {
    if from == Decimal::ZERO {
        return Decimal::ZERO;
    }
    (to - from) / from * dec!(100)
}

/// Truncate a USD amount to whole cents, never rounding up.
pub fn floor_cents(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(2, RoundingStrategy::ToZero)
}

/// Round down to lot size (quantity precision).
pub fn round_down_to_lot(value: Decimal, lot_size: Decimal) -> Decimal {
    if lot_size == Decimal::ZERO {
        return value;
    }
    (value / lot_size).floor() * lot_size
}

/// Safe division that returns zero if divisor is zero.
pub fn safe_div(numerator: Decimal, denominator: Decimal) -> Decimal {
    if denominator == Decimal::ZERO {
        Decimal::ZERO
    } else {
        numerator / denominator
    }
}
