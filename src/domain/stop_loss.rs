// =============================================================================
// StopLossPosition — per-(strategy, symbol) stop-loss/take-profit/trailing
// state tracked independently of the authoritative `Position`
// =============================================================================
//
// A strategy instance's exits are computed against this lightweight record
// rather than the shared `Position`, since several strategy instances for
// different users may share a symbol with independent stop levels.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::Side;

/// Which side of the market a stop-loss/take-profit closes — i.e. the side a
/// closing order must take, not the side of the open position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopLossSide {
    Buy,
    Sell,
}

impl From<Side> for StopLossSide {
    /// The closing side is the opposite of the position's opening side.
    fn from(position_side: Side) -> Self {
        match position_side.opposite() {
            Side::Buy => Self::Buy,
            Side::Sell => Self::Sell,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopLossPosition {
    pub strategy_id: String,
    pub symbol: String,
    pub side: Side,
    pub entry_price: f64,
    pub current_price: f64,
    pub stop_loss: f64,
    pub take_profit: Option<f64>,
    pub trailing_enabled: bool,
    pub trailing_offset_pct: f64,
    /// Highest price seen for a long (lowest for a short) since entry; the
    /// trailing stop is anchored to this, never to `current_price` directly.
    pub peak_price: f64,
    pub updated_at: DateTime<Utc>,
}

impl StopLossPosition {
    pub fn new(
        strategy_id: impl Into<String>,
        symbol: impl Into<String>,
        side: Side,
        entry_price: f64,
        stop_loss: f64,
        take_profit: Option<f64>,
    ) -> Self {
        Self {
            strategy_id: strategy_id.into(),
            symbol: symbol.into(),
            side,
            entry_price,
            current_price: entry_price,
            stop_loss,
            take_profit,
            trailing_enabled: false,
            trailing_offset_pct: 0.0,
            peak_price: entry_price,
            updated_at: Utc::now(),
        }
    }

    pub fn with_trailing(mut self, offset_pct: f64) -> Self {
        self.trailing_enabled = true;
        self.trailing_offset_pct = offset_pct;
        self
    }

    /// Update the tracked price and, if trailing is enabled, ratchet the
    /// stop toward the new peak. The peak itself only ever moves in the
    /// position's favorable direction — this is the monotonicity invariant.
    pub fn update_price(&mut self, price: f64) {
        self.current_price = price;
        self.updated_at = Utc::now();

        match self.side {
            Side::Buy => {
                if price > self.peak_price {
                    self.peak_price = price;
                    if self.trailing_enabled {
                        let candidate = self.peak_price * (1.0 - self.trailing_offset_pct);
                        if candidate > self.stop_loss {
                            self.stop_loss = candidate;
                        }
                    }
                }
            }
            Side::Sell => {
                if price < self.peak_price {
                    self.peak_price = price;
                    if self.trailing_enabled {
                        let candidate = self.peak_price * (1.0 + self.trailing_offset_pct);
                        if candidate < self.stop_loss {
                            self.stop_loss = candidate;
                        }
                    }
                }
            }
        }
    }

    /// Returns the side a closing order must take and the trigger reason if
    /// the current price has breached the stop-loss or take-profit level,
    /// else `None`. Take-profit is checked first: if both would trigger on
    /// the same tick, take-profit wins.
    pub fn check_exit(&self) -> Option<(StopLossSide, &'static str)> {
        let side_to_close = StopLossSide::from(self.side);
        match self.side {
            Side::Buy => {
                if let Some(tp) = self.take_profit {
                    if self.current_price >= tp {
                        return Some((side_to_close, "TAKE_PROFIT"));
                    }
                }
                if self.current_price <= self.stop_loss {
                    return Some((side_to_close, "STOP_LOSS"));
                }
            }
            Side::Sell => {
                if let Some(tp) = self.take_profit {
                    if self.current_price <= tp {
                        return Some((side_to_close, "TAKE_PROFIT"));
                    }
                }
                if self.current_price >= self.stop_loss {
                    return Some((side_to_close, "STOP_LOSS"));
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn long_stop_loss_triggers_on_breach() {
        let mut sl = StopLossPosition::new("s1", "BTCUSDT", Side::Buy, 100.0, 90.0, Some(120.0));
        sl.update_price(89.0);
        assert_eq!(sl.check_exit(), Some((StopLossSide::Sell, "STOP_LOSS")));
    }

    #[test]
    fn long_take_profit_triggers_on_breach() {
        let mut sl = StopLossPosition::new("s1", "BTCUSDT", Side::Buy, 100.0, 90.0, Some(120.0));
        sl.update_price(121.0);
        assert_eq!(sl.check_exit(), Some((StopLossSide::Sell, "TAKE_PROFIT")));
    }

    #[test]
    fn short_stop_loss_triggers_on_breach() {
        let mut sl = StopLossPosition::new("s1", "ETHUSDT", Side::Sell, 100.0, 110.0, Some(80.0));
        sl.update_price(111.0);
        assert_eq!(sl.check_exit(), Some((StopLossSide::Buy, "STOP_LOSS")));
    }

    #[test]
    fn take_profit_wins_tie_break_when_both_would_trigger() {
        // A degenerate config where stop_loss and take_profit overlap such
        // that a single price breaches both; take-profit must win.
        let mut sl = StopLossPosition::new("s1", "BTCUSDT", Side::Buy, 100.0, 130.0, Some(120.0));
        sl.update_price(125.0);
        assert_eq!(sl.check_exit(), Some((StopLossSide::Sell, "TAKE_PROFIT")));
    }

    #[test]
    fn no_exit_while_price_inside_band() {
        let mut sl = StopLossPosition::new("s1", "BTCUSDT", Side::Buy, 100.0, 90.0, Some(120.0));
        sl.update_price(105.0);
        assert_eq!(sl.check_exit(), None);
    }

    #[test]
    fn trailing_stop_ratchets_up_but_never_down() {
        let mut sl = StopLossPosition::new("s1", "BTCUSDT", Side::Buy, 100.0, 90.0, None)
            .with_trailing(0.05);
        sl.update_price(110.0);
        let raised_stop = sl.stop_loss;
        assert!(raised_stop > 90.0);

        sl.update_price(105.0); // pullback must not lower the stop
        assert_eq!(sl.stop_loss, raised_stop);
        assert_eq!(sl.peak_price, 110.0);
    }

    #[test]
    fn trailing_stop_for_short_ratchets_down_but_never_up() {
        let mut sl = StopLossPosition::new("s1", "ETHUSDT", Side::Sell, 100.0, 110.0, None)
            .with_trailing(0.05);
        sl.update_price(90.0);
        let lowered_stop = sl.stop_loss;
        assert!(lowered_stop < 110.0);

        sl.update_price(95.0); // bounce must not raise the stop back up
        assert_eq!(sl.stop_loss, lowered_stop);
        assert_eq!(sl.peak_price, 90.0);
    }
}
