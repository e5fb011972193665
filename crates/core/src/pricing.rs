//! Order totals.
//!
//! Prices are integer cents throughout. Flat-rate shipping applies below
//! the free-shipping threshold; totals are computed server-side from the
//! product rows read in the placement transaction, never from client input.

use serde::{Deserialize, Serialize};

use crate::types::OrderItem;

/// Flat shipping charge, in cents.
pub const FLAT_SHIPPING_CENTS: i64 = 495;

/// Subtotal at or above which shipping is free, in cents.
pub const FREE_SHIPPING_THRESHOLD_CENTS: i64 = 5000;

/// Monetary breakdown of a placed order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderTotals {
    pub subtotal_cents: i64,
    pub shipping_cents: i64,
    pub total_cents: i64,
}

/// Computes subtotal, shipping and total for a set of order items.
pub fn compute_totals(items: &[OrderItem]) -> OrderTotals {
    let subtotal_cents: i64 = items
        .iter()
        .map(|item| item.unit_price_cents * item.quantity)
        .sum();
    let shipping_cents = shipping_for(subtotal_cents);

    OrderTotals {
        subtotal_cents,
        shipping_cents,
        total_cents: subtotal_cents + shipping_cents,
    }
}

fn shipping_for(subtotal_cents: i64) -> i64 {
    if subtotal_cents >= FREE_SHIPPING_THRESHOLD_CENTS {
        0
    } else {
        FLAT_SHIPPING_CENTS
    }
}
