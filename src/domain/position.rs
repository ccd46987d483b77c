// =============================================================================
// Position — authoritative signed-quantity position the engine tracks
// per (user_id, symbol), independent of exchange-reported position state
// =============================================================================
//
// Quantity is signed: positive is long, negative is short, zero is flat.
// Fills are folded in with quantity-weighted average-price math; a fill that
// crosses zero resets the average entry price to the crossing fill's price
// (see `apply_fill`).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::Side;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub user_id: String,
    pub symbol: String,
    /// Signed quantity: > 0 long, < 0 short, == 0 flat.
    pub qty: f64,
    pub avg_entry_price: f64,
    pub updated_at: DateTime<Utc>,
}

impl Position {
    pub fn flat(user_id: impl Into<String>, symbol: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            symbol: symbol.into(),
            qty: 0.0,
            avg_entry_price: 0.0,
            updated_at: Utc::now(),
        }
    }

    pub fn is_flat(&self) -> bool {
        self.qty == 0.0
    }

    pub fn side(&self) -> Option<Side> {
        if self.qty > 0.0 {
            Some(Side::Buy)
        } else if self.qty < 0.0 {
            Some(Side::Sell)
        } else {
            None
        }
    }

    /// Fold a fill into this position. `side` is the fill's side (not the
    /// position's); a BUY fill adds to `qty`, a SELL fill subtracts.
    ///
    /// - Same-direction fill (or opening from flat): quantity-weighted average
    ///   of `avg_entry_price` and the fill price.
    /// - Reducing fill that does not cross zero: `avg_entry_price` unchanged.
    /// - Fill that crosses zero: the position flips sign and `avg_entry_price`
    ///   resets to the fill price for the residual quantity on the new side.
    pub fn apply_fill(&mut self, side: Side, fill_qty: f64, fill_price: f64) {
        debug_assert!(fill_qty > 0.0);
        let signed_fill = side.sign() * fill_qty;
        let new_qty = self.qty + signed_fill;

        let same_direction = self.qty == 0.0 || self.qty.signum() == signed_fill.signum();

        if same_direction {
            let total_abs = self.qty.abs() + fill_qty;
            self.avg_entry_price = if total_abs > 0.0 {
                (self.avg_entry_price * self.qty.abs() + fill_price * fill_qty) / total_abs
            } else {
                fill_price
            };
        } else if new_qty.signum() != self.qty.signum() && new_qty != 0.0 {
            // Crossed zero: residual quantity opens a fresh position on the
            // opposite side at the fill price.
            self.avg_entry_price = fill_price;
        } else if new_qty == 0.0 {
            self.avg_entry_price = 0.0;
        }
        // else: pure reduction, avg_entry_price unchanged.

        self.qty = new_qty;
        self.updated_at = Utc::now();
    }

    pub fn unrealized_pnl(&self, mark_price: f64) -> f64 {
        (mark_price - self.avg_entry_price) * self.qty
    }
}
