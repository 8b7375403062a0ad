//! Exit conditions and realized P&L.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::trace;

use crate::models::{CloseReason, Side};

/// Realized outcome of a round trip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PnL {
    pub pnl: Decimal,
    /// Percent of entry notional
    pub return_pct: Decimal,
}

/// P&L of closing `quantity` at `exit` after entering at `entry`.
pub fn pnl(entry: Decimal, exit: Decimal, quantity: Decimal, side: Side) -> PnL {
    let diff = match side {
        Side::Long => exit - entry,
        Side::Short => entry - exit,
    };
    let pnl = diff * quantity;
    let basis = entry * quantity;
    let return_pct = if basis.is_zero() {
        Decimal::ZERO
    } else {
        pnl / basis * dec!(100)
    };
    PnL { pnl, return_pct }
}

/// Exit check against stop and target.
///
/// Longs close when price falls to the stop or rises to the target;
/// shorts are the mirror image.
pub fn should_close(
    price: Decimal,
    entry: Decimal,
    stop: Decimal,
    target: Decimal,
    side: Side,
) -> Option<CloseReason> {
    trace!(%price, %entry, %stop, %target, %side, "Evaluating exit");
    match side {
        Side::Long if price <= stop => Some(CloseReason::StopLoss),
        Side::Long if price >= target => Some(CloseReason::TakeProfit),
        Side::Short if price >= stop => Some(CloseReason::StopLoss),
        Side::Short if price <= target => Some(CloseReason::TakeProfit),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pnl_long_and_short() {
        let long = pnl(dec!(100), dec!(110), dec!(1), Side::Long);
        assert_eq!(long.pnl, dec!(10));
        assert_eq!(long.return_pct, dec!(10));

        let short = pnl(dec!(100), dec!(110), dec!(1), Side::Short);
        assert_eq!(short.pnl, dec!(-10));
        assert_eq!(short.return_pct, dec!(-10));
    }

    #[test]
    fn test_pnl_zero_quantity() {
        let p = pnl(dec!(100), dec!(110), Decimal::ZERO, Side::Long);
        assert_eq!(p.pnl, Decimal::ZERO);
        assert_eq!(p.return_pct, Decimal::ZERO);
    }

    #[test]
    fn test_long_exits() {
        assert_eq!(should_close(dec!(98), dec!(100), dec!(98.5), dec!(103), Side::Long), Some(CloseReason::StopLoss));
        assert_eq!(should_close(dec!(103), dec!(100), dec!(98.5), dec!(103), Side::Long), Some(CloseReason::TakeProfit));
        assert_eq!(should_close(dec!(101), dec!(100), dec!(98.5), dec!(103), Side::Long), None);
    }

    #[test]
    fn test_short_exits() {
        assert_eq!(should_close(dec!(102), dec!(100), dec!(101.5), dec!(97), Side::Short), Some(CloseReason::StopLoss));
        assert_eq!(should_close(dec!(96), dec!(100), dec!(101.5), dec!(97), Side::Short), Some(CloseReason::TakeProfit));
        assert_eq!(should_close(dec!(99), dec!(100), dec!(101.5), dec!(97), Side::Short), None);
    }

    #[test]
    fn test_mirror_antisymmetry() {
        let entry = dec!(100);
        let levels = [dec!(90), dec!(95), dec!(98.5), dec!(100), dec!(101), dec!(103), dec!(110)];
        let mirror = |x: Decimal| dec!(2) * entry - x;

        for &p in &levels {
            for &s in &levels {
                for &t in &levels {
                    let long = should_close(p, entry, s, t, Side::Long);
                    let short = should_close(mirror(p), entry, mirror(s), mirror(t), Side::Short);
                    assert_eq!(long, short, "price={} stop={} target={}", p, s, t);
                }
            }
        }
    }
}
