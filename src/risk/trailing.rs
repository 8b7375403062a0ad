//! Progressive trailing stop.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use super::sizing::direction;
use crate::models::{Position, Side};

/// Fraction of the trailing step kept at a given unrealized profit (percent).
/// The trail tightens as profit grows.
pub fn trail_factor(profit_pct: Decimal) -> Decimal {
    if profit_pct < dec!(0.5) {
        dec!(1.0)
    } else if profit_pct < dec!(1.0) {
        dec!(0.9)
    } else if profit_pct < dec!(2.0) {
        dec!(0.7)
    } else if profit_pct < dec!(3.0) {
        dec!(0.5)
    } else {
        dec!(0.3)
    }
}

/// Advance the trailing stop for the current price.
///
/// Arms once price crosses the activation price, then moves the stop
/// only in the favorable direction and ratchets the activation price
/// with it. Returns true if the position changed.
pub fn advance_trailing(position: &mut Position, price: Decimal, now: DateTime<Utc>) -> bool {
    let crossed = match position.side {
        Side::Long => price >= position.trailing.activation_price,
        Side::Short => price <= position.trailing.activation_price,
    };
    if !crossed {
        return false;
    }

    let mut changed = false;
    if !position.trailing.armed {
        position.trailing.armed = true;
        changed = true;
    }

    let factor = trail_factor(position.profit_pct(price));
    let sign = direction(position.side);
    let distance = position.trailing.step_pct * factor / dec!(100);
    let candidate = price * (Decimal::ONE - sign * distance);

    let improves = match position.side {
        Side::Long => candidate > position.stop_loss,
        Side::Short => candidate < position.stop_loss,
    };

    if improves {
        position.stop_loss = candidate;
        position.trailing.activation_price =
            price * (Decimal::ONE + sign * position.trailing.step_pct / dec!(100));
        position.trailing.factor = Some(factor);
        position.trailing.updated_at = Some(now);
        changed = true;
    }

    changed
}
