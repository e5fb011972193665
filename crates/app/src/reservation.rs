//! Time-boxed stock claims.
//!
//! All three operations run against a transaction owned by the caller, so
//! the availability read and the write it gates serialize around the same
//! product rows. An error from any operation leaves the transaction poised
//! for rollback; nothing here commits.

use chrono::{DateTime, Utc};
use sqlx::{Sqlite, Transaction};
use thiserror::Error;

use cardstall_core::availability::Shortage;
use cardstall_storage::{
    Database, NewReservation, ProductError, ProductRepository, ReservationError,
    ReservationRepository,
};

/// Creates, confirms and releases reservations against the stock ledger.
#[derive(Clone)]
pub struct ReservationManager {
    products: ProductRepository,
    reservations: ReservationRepository,
}

/// One line item to reserve, resolved from the product row inside the same
/// transaction the reservation is written in.
#[derive(Debug, Clone)]
pub struct ReserveItem {
    pub product_id: String,
    pub name: String,
    pub quantity: i64,
    pub track_stock: bool,
}

/// What a release actually undid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReleaseOutcome {
    pub rows_deleted: u64,
    pub quantity_restored: i64,
}

impl ReservationManager {
    pub fn new(database: &Database) -> Self {
        Self {
            products: database.products(),
            reservations: database.reservations(),
        }
    }

    /// Claims stock for every tracked line item of an order.
    ///
    /// Availability is re-read here, inside the caller's transaction; an
    /// advisory check made before the transaction opened proves nothing
    /// once concurrent buyers enter the picture. The first short item
    /// aborts the whole call.
    pub async fn reserve(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        order_number: &str,
        items: &[ReserveItem],
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<u32, StockError> {
        let mut created = 0;
        for item in items {
            if !item.track_stock {
                continue;
            }

            let row = self
                .products
                .fetch_with_reserved_in_tx(tx, &item.product_id, now)
                .await?
                .ok_or_else(|| {
                    StockError::Insufficient(Shortage::missing_product(&item.name, item.quantity))
                })?;

            let availability = row.availability();
            if !availability.satisfies(item.quantity) {
                return Err(StockError::Insufficient(Shortage::new(
                    row.name,
                    item.quantity,
                    availability,
                )));
            }

            self.reservations
                .insert(
                    tx,
                    &NewReservation {
                        product_id: &item.product_id,
                        order_number,
                        quantity: item.quantity,
                        expires_at,
                        created_at: now,
                    },
                )
                .await?;
            created += 1;
        }

        Ok(created)
    }

    /// Confirms every unconfirmed reservation of an order, decrementing
    /// the on-hand count in the same breath.
    ///
    /// The on-hand re-check guards against counts edited underneath an
    /// outstanding claim; if any item fails it, the caller rolls the whole
    /// transaction back and no stock moves for any item.
    pub async fn confirm(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        order_number: &str,
        now: DateTime<Utc>,
    ) -> Result<u32, StockError> {
        let rows = self
            .reservations
            .list_unconfirmed_for_order(tx, order_number)
            .await?;

        let mut confirmed = 0;
        for row in rows {
            let product = self
                .products
                .fetch_with_reserved_in_tx(tx, &row.product_id, now)
                .await?
                .ok_or_else(|| {
                    StockError::Insufficient(Shortage::missing_product(
                        &row.product_id,
                        row.quantity,
                    ))
                })?;

            if product.stock < row.quantity {
                return Err(StockError::Insufficient(Shortage {
                    name: product.name,
                    requested: row.quantity,
                    available: product.stock.max(0),
                }));
            }

            self.products
                .decrement_stock(tx, &row.product_id, row.quantity, now)
                .await?;
            self.reservations.mark_confirmed(tx, &row.id).await?;
            confirmed += 1;
        }

        Ok(confirmed)
    }

    /// Releases every reservation of an order, restoring stock for the
    /// confirmed ones and deleting all rows.
    ///
    /// Calling this twice is safe: the second call finds no rows and
    /// restores nothing.
    pub async fn release(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        order_number: &str,
        now: DateTime<Utc>,
    ) -> Result<ReleaseOutcome, StockError> {
        let rows = self.reservations.list_for_order(tx, order_number).await?;

        let mut quantity_restored = 0;
        for row in &rows {
            if row.is_confirmed() {
                self.products
                    .restore_stock(tx, &row.product_id, row.quantity, now)
                    .await?;
                quantity_restored += row.quantity;
            }
        }

        let rows_deleted = self
            .reservations
            .delete_for_order(tx, order_number)
            .await?;

        Ok(ReleaseOutcome {
            rows_deleted,
            quantity_restored,
        })
    }
}

/// Errors raised while claiming or settling stock.
#[derive(Debug, Error)]
pub enum StockError {
    #[error("insufficient stock for {}: requested {}, available {}", .0.name, .0.requested, .0.available)]
    Insufficient(Shortage),
    #[error("product error: {0}")]
    Product(#[from] ProductError),
    #[error("reservation error: {0}")]
    Reservation(#[from] ReservationError),
}
