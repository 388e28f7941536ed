//! Lot-size grid arithmetic

use crate::models::LotSize;

/// Slack for quotients like 0.3 / 0.1 that land just under an integer
const GRID_EPSILON: f64 = 1e-9;

/// Floor `quantity` onto the `step` grid
///
/// A non-positive step means the symbol has no grid and the quantity is
/// returned as is.
pub fn normalize_quantity(quantity: f64, step: f64) -> f64 {
    if !quantity.is_finite() || quantity <= 0.0 {
        return 0.0;
    }
    if !step.is_finite() || step <= 0.0 {
        return quantity;
    }

    let steps = (quantity / step + GRID_EPSILON).floor();
    let floored = round_to(steps * step, step_decimals(step));
    if floored > quantity {
        // Epsilon pushed us over; drop one step
        round_to((steps - 1.0).max(0.0) * step, step_decimals(step))
    } else {
        floored
    }
}

/// Normalize and clamp to the symbol limits; 0 when below the minimum
pub fn order_quantity(quantity: f64, lot_size: &LotSize) -> f64 {
    let normalized = normalize_quantity(quantity.min(lot_size.max_quantity), lot_size.step_size);
    if normalized < lot_size.min_quantity {
        0.0
    } else {
        normalized
    }
}

fn step_decimals(step: f64) -> i32 {
    let mut decimals = 0;
    let mut scaled = step;
    while decimals < 12 && (scaled - scaled.round()).abs() > GRID_EPSILON {
        scaled *= 10.0;
        decimals += 1;
    }
    decimals
}

fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}
