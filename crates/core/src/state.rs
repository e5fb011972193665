//! The order lifecycle as an explicit, validated state pair.
//!
//! An order carries two persisted enums (fulfilment status and payment
//! status). Rather than letting every call site guard the pair by hand,
//! [`OrderState`] owns the combination: constructors reject nonsense pairs
//! and the checkout transitions are methods that either produce the next
//! state or a typed refusal.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{OrderStatus, PaymentStatus};

/// Validated (fulfilment, payment) status pair for an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "StatusPair", into = "StatusPair")]
pub struct OrderState {
    status: OrderStatus,
    payment: PaymentStatus,
}

/// Raw serialized shape of an [`OrderState`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct StatusPair {
    pub status: OrderStatus,
    pub payment_status: PaymentStatus,
}

impl OrderState {
    /// State of a freshly placed order awaiting buyer payment.
    pub const fn pending() -> Self {
        Self {
            status: OrderStatus::Pending,
            payment: PaymentStatus::Pending,
        }
    }

    /// Builds a state from its two persisted halves, rejecting combinations
    /// that cannot describe a real order.
    pub fn new(status: OrderStatus, payment: PaymentStatus) -> Result<Self, IllegalState> {
        let legal = match (status, payment) {
            (OrderStatus::Cancelled, p) => {
                matches!(p, PaymentStatus::Cancelled | PaymentStatus::Refunded)
            }
            (s, PaymentStatus::Cancelled) => s == OrderStatus::Cancelled,
            (OrderStatus::Refunded, p) => p == PaymentStatus::Refunded,
            _ => true,
        };

        if legal {
            Ok(Self { status, payment })
        } else {
            Err(IllegalState { status, payment })
        }
    }

    pub fn status(&self) -> OrderStatus {
        self.status
    }

    pub fn payment(&self) -> PaymentStatus {
        self.payment
    }

    /// Whether the order sits in a terminal fulfilment state that checkout
    /// may never cancel.
    pub fn is_shipped_or_delivered(&self) -> bool {
        matches!(self.status, OrderStatus::Shipped | OrderStatus::Delivered)
    }

    /// Buyer reports payment complete: moves the payment leg to
    /// `PROCESSING` pending manual verification.
    pub fn begin_payment_processing(self) -> Result<Self, TransitionError> {
        if self.status == OrderStatus::Cancelled {
            return Err(TransitionError::OrderCancelled);
        }
        match self.payment {
            PaymentStatus::Processing | PaymentStatus::Completed => {
                Err(TransitionError::PaymentAlreadyUnderway)
            }
            _ => Ok(Self {
                status: self.status,
                payment: PaymentStatus::Processing,
            }),
        }
    }

    /// Cancels the order. Shipped and delivered orders are out of reach.
    pub fn cancel(self) -> Result<Self, TransitionError> {
        if self.status == OrderStatus::Cancelled {
            return Err(TransitionError::AlreadyCancelled);
        }
        if self.is_shipped_or_delivered() {
            return Err(TransitionError::AlreadyFulfilled(self.status));
        }
        Ok(Self {
            status: OrderStatus::Cancelled,
            payment: PaymentStatus::Cancelled,
        })
    }
}

impl TryFrom<StatusPair> for OrderState {
    type Error = IllegalState;

    fn try_from(pair: StatusPair) -> Result<Self, Self::Error> {
        Self::new(pair.status, pair.payment_status)
    }
}

impl From<OrderState> for StatusPair {
    fn from(state: OrderState) -> Self {
        Self {
            status: state.status,
            payment_status: state.payment,
        }
    }
}

/// A (status, payment) pair that cannot describe a real order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("illegal order state: status {} with payment {}", .status.as_str(), .payment.as_str())]
pub struct IllegalState {
    pub status: OrderStatus,
    pub payment: PaymentStatus,
}

/// A checkout transition refused by the current order state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("order has been cancelled")]
    OrderCancelled,
    #[error("order is already cancelled")]
    AlreadyCancelled,
    #[error("payment is already being processed for this order")]
    PaymentAlreadyUnderway,
    #[error("order has already been {}", .0.as_str().to_lowercase())]
    AlreadyFulfilled(OrderStatus),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancelled_order_requires_cancelled_or_refunded_payment() {
        assert!(OrderState::new(OrderStatus::Cancelled, PaymentStatus::Cancelled).is_ok());
        assert!(OrderState::new(OrderStatus::Cancelled, PaymentStatus::Refunded).is_ok());
        assert!(OrderState::new(OrderStatus::Cancelled, PaymentStatus::Completed).is_err());
        assert!(OrderState::new(OrderStatus::Pending, PaymentStatus::Cancelled).is_err());
    }

    #[test]
    fn refunded_order_requires_refunded_payment() {
        assert!(OrderState::new(OrderStatus::Refunded, PaymentStatus::Refunded).is_ok());
        assert!(OrderState::new(OrderStatus::Refunded, PaymentStatus::Pending).is_err());
    }

    #[test]
    fn payment_processing_transition_guards() {
        let state = OrderState::pending();
        let next = state.begin_payment_processing().expect("transition");
        assert_eq!(next.payment(), PaymentStatus::Processing);
        assert_eq!(next.status(), OrderStatus::Pending);

        assert_eq!(
            next.begin_payment_processing().unwrap_err(),
            TransitionError::PaymentAlreadyUnderway
        );

        let completed = OrderState::new(OrderStatus::Pending, PaymentStatus::Completed)
            .expect("legal state");
        assert_eq!(
            completed.begin_payment_processing().unwrap_err(),
            TransitionError::PaymentAlreadyUnderway
        );

        let cancelled = OrderState::new(OrderStatus::Cancelled, PaymentStatus::Cancelled)
            .expect("legal state");
        assert_eq!(
            cancelled.begin_payment_processing().unwrap_err(),
            TransitionError::OrderCancelled
        );
    }

    #[test]
    fn cancel_transition_guards() {
        let cancelled = OrderState::pending().cancel().expect("cancel");
        assert_eq!(cancelled.status(), OrderStatus::Cancelled);
        assert_eq!(cancelled.payment(), PaymentStatus::Cancelled);

        assert_eq!(
            cancelled.cancel().unwrap_err(),
            TransitionError::AlreadyCancelled
        );

        let shipped = OrderState::new(OrderStatus::Shipped, PaymentStatus::Completed)
            .expect("legal state");
        assert_eq!(
            shipped.cancel().unwrap_err(),
            TransitionError::AlreadyFulfilled(OrderStatus::Shipped)
        );

        let delivered = OrderState::new(OrderStatus::Delivered, PaymentStatus::Completed)
            .expect("legal state");
        assert!(matches!(
            delivered.cancel().unwrap_err(),
            TransitionError::AlreadyFulfilled(OrderStatus::Delivered)
        ));
    }

    #[test]
    fn serde_rejects_illegal_pairs() {
        let raw = r#"{"status":"CANCELLED","payment_status":"COMPLETED"}"#;
        assert!(serde_json::from_str::<OrderState>(raw).is_err());

        let raw = r#"{"status":"PENDING","payment_status":"PENDING"}"#;
        let state: OrderState = serde_json::from_str(raw).expect("legal pair");
        assert_eq!(state, OrderState::pending());
    }
}
