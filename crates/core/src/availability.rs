//! Availability arithmetic for the stock ledger.
//!
//! Available stock is the authoritative on-hand count minus every active
//! unconfirmed claim. The storage layer produces the two numbers; the
//! arithmetic and the shortage reporting live here.

use serde::{Deserialize, Serialize};

/// How much of a product can still be claimed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Availability {
    /// The product does not track stock; any quantity is accepted.
    Unlimited,
    /// On-hand count minus active unconfirmed reservations.
    Limited(i64),
}

impl Availability {
    /// Computes availability from the on-hand count and the summed active
    /// unconfirmed reservation quantity.
    pub fn tracked(stock: i64, reserved: i64) -> Self {
        Self::Limited(stock - reserved)
    }

    /// Whether the requested quantity fits.
    pub fn satisfies(&self, requested: i64) -> bool {
        match self {
            Self::Unlimited => true,
            Self::Limited(count) => *count >= requested,
        }
    }

    /// The buyer-facing count: unlimited availability never produces a
    /// shortage, and a corrupted negative balance reads as zero.
    pub fn reportable_count(&self) -> Option<i64> {
        match self {
            Self::Unlimited => None,
            Self::Limited(count) => Some((*count).max(0)),
        }
    }
}

/// One insufficient line item, reported with the shortfall context the
/// buyer needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shortage {
    pub name: String,
    pub requested: i64,
    pub available: i64,
}

impl Shortage {
    pub fn new(name: impl Into<String>, requested: i64, availability: Availability) -> Self {
        Self {
            name: name.into(),
            requested,
            available: availability.reportable_count().unwrap_or(requested),
        }
    }

    /// Shortage entry for a product that no longer exists.
    pub fn missing_product(name: impl Into<String>, requested: i64) -> Self {
        Self {
            name: name.into(),
            requested,
            available: 0,
        }
    }
}

/// Outcome of checking a whole cart: every short line item, not just the
/// first one, so the buyer sees the complete picture.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailabilityReport {
    pub shortages: Vec<Shortage>,
}

impl AvailabilityReport {
    pub fn record(&mut self, shortage: Shortage) {
        self.shortages.push(shortage);
    }

    pub fn is_available(&self) -> bool {
        self.shortages.is_empty()
    }
}

/// Renders a shortage list into the single user-facing message the
/// checkout surfaces.
pub fn describe_shortages(shortages: &[Shortage]) -> String {
    let lines: Vec<String> = shortages
        .iter()
        .map(|s| format!("{}: requested {}, available {}", s.name, s.requested, s.available))
        .collect();
    format!("insufficient stock: {}", lines.join("; "))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracked_availability_subtracts_active_claims() {
        let availability = Availability::tracked(5, 3);
        assert_eq!(availability, Availability::Limited(2));
        assert!(availability.satisfies(2));
        assert!(!availability.satisfies(3));
    }

    #[test]
    fn unlimited_availability_always_satisfies() {
        assert!(Availability::Unlimited.satisfies(i64::MAX));
        assert_eq!(Availability::Unlimited.reportable_count(), None);
    }

    #[test]
    fn negative_balance_reports_as_zero() {
        let shortage = Shortage::new("Charizard Holo", 1, Availability::tracked(5, 7));
        assert_eq!(shortage.available, 0);
    }

    #[test]
    fn report_collects_every_shortage() {
        let mut report = AvailabilityReport::default();
        assert!(report.is_available());

        report.record(Shortage::missing_product("gone-card", 2));
        report.record(Shortage::new("Pikachu Promo", 4, Availability::tracked(3, 1)));
        assert!(!report.is_available());
        assert_eq!(report.shortages.len(), 2);
        assert_eq!(report.shortages[0].available, 0);
        assert_eq!(report.shortages[1].available, 2);
    }

    #[test]
    fn shortage_message_lists_each_item() {
        let shortages = vec![
            Shortage::missing_product("gone-card", 2),
            Shortage::new("Pikachu Promo", 4, Availability::tracked(3, 1)),
        ];
        let message = describe_shortages(&shortages);
        assert!(message.contains("gone-card: requested 2, available 0"));
        assert!(message.contains("Pikachu Promo: requested 4, available 2"));
    }
}
