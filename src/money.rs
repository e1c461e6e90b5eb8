use super::common::Cents;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};

/// Convert an external amount to minor units.
///
/// The outside world deals in decimal currency, everything behind the public
/// API is integer hundredths. Values are rounded half-to-even to two decimals
/// before scaling, so `2.005` lands on `200` and `2.015` on `202`. Negative
/// amounts and amounts that do not fit the internal representation are
/// invalid.
pub fn parse(amount: Decimal) -> Option<Cents> {
    if amount.is_sign_negative() {
        return None;
    }
    amount
        .round_dp_with_strategy(2, RoundingStrategy::MidpointNearestEven)
        .checked_mul(Decimal::ONE_HUNDRED)?
        .to_i64()
}

/// Convert minor units back to a two-decimal external amount. Exact.
pub fn format(minor: Cents) -> Decimal {
    Decimal::new(minor, 2)
}
