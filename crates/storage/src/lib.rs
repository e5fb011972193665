use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::{
    migrate::MigrateError, sqlite::SqlitePoolOptions, Row, Sqlite, SqlitePool, Transaction,
};
use thiserror::Error;
use uuid::Uuid;

use cardstall_core::availability::Availability;
use cardstall_core::state::{IllegalState, OrderState};
use cardstall_core::types::{
    Order, OrderItem, ShippingAddress, StockReservation, UnknownStatus,
};

/// Top-level database handle that owns the SQLite connection pool.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Establishes a new SQLite connection pool for the provided connection string.
    pub async fn connect(database_url: &str) -> Result<Self, StorageError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .map_err(StorageError::Connect)?;

        apply_pragmas(&pool).await?;

        Ok(Self { pool })
    }

    /// Applies migrations located under `migrations/`.
    pub async fn run_migrations(&self) -> Result<(), StorageError> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(StorageError::Migration)?;
        Ok(())
    }

    /// Begins a SQLite transaction. Every read-then-write sequence that
    /// touches availability must run inside one of these.
    pub async fn begin(&self) -> Result<Transaction<'_, Sqlite>, sqlx::Error> {
        self.pool.begin().await
    }

    /// Returns a handle to operate on product stock.
    pub fn products(&self) -> ProductRepository {
        ProductRepository {
            pool: self.pool.clone(),
        }
    }

    /// Returns a handle to operate on stock reservations.
    pub fn reservations(&self) -> ReservationRepository {
        ReservationRepository {
            pool: self.pool.clone(),
        }
    }

    /// Returns a handle to operate on orders and their line items.
    pub fn orders(&self) -> OrderRepository {
        OrderRepository {
            pool: self.pool.clone(),
        }
    }

    /// Returns a handle to operate on customers and their addresses.
    pub fn customers(&self) -> CustomerRepository {
        CustomerRepository {
            pool: self.pool.clone(),
        }
    }

    /// Runs a truncating WAL checkpoint, returning the frame statistics.
    pub async fn wal_checkpoint_truncate(&self) -> Result<CheckpointStats, sqlx::Error> {
        let row = sqlx::query("PRAGMA wal_checkpoint(TRUNCATE);")
            .fetch_one(&self.pool)
            .await?;

        Ok(CheckpointStats {
            busy_frames: row.get::<i64, _>(0),
            log_frames: row.get::<i64, _>(1),
            checkpointed_frames: row.get::<i64, _>(2),
        })
    }

    /// Exposes the inner pool when lower level access is required.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

async fn apply_pragmas(pool: &SqlitePool) -> Result<(), StorageError> {
    sqlx::query("PRAGMA foreign_keys = ON;")
        .execute(pool)
        .await
        .map_err(StorageError::Pragma)?;

    sqlx::query("PRAGMA journal_mode = WAL;")
        .fetch_one(pool)
        .await
        .map_err(StorageError::Pragma)?;

    sqlx::query("PRAGMA synchronous = NORMAL;")
        .execute(pool)
        .await
        .map_err(StorageError::Pragma)?;

    sqlx::query("PRAGMA busy_timeout = 5000;")
        .execute(pool)
        .await
        .map_err(StorageError::Pragma)?;

    Ok(())
}

/// WAL checkpoint frame counts reported by SQLite.
#[derive(Debug, Clone, Copy)]
pub struct CheckpointStats {
    pub busy_frames: i64,
    pub log_frames: i64,
    pub checkpointed_frames: i64,
}

/// General storage level errors.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("failed to connect to sqlite: {0}")]
    Connect(sqlx::Error),
    #[error("failed to apply pragma: {0}")]
    Pragma(sqlx::Error),
    #[error("failed to run database migrations: {0}")]
    Migration(MigrateError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Repository owning product rows and the authoritative stock count.
#[derive(Clone)]
pub struct ProductRepository {
    pool: SqlitePool,
}

/// A product row together with the summed quantity of its active
/// unconfirmed reservations at the queried instant.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ProductWithReserved {
    pub id: String,
    pub name: String,
    pub price_cents: i64,
    pub stock: i64,
    pub track_stock: i64,
    pub reserved: i64,
}

impl ProductWithReserved {
    /// Availability derived from the row: untracked products never run out.
    pub fn availability(&self) -> Availability {
        if self.track_stock == 0 {
            Availability::Unlimited
        } else {
            Availability::tracked(self.stock, self.reserved)
        }
    }

    pub fn tracks_stock(&self) -> bool {
        self.track_stock != 0
    }
}

const PRODUCT_WITH_RESERVED_SQL: &str = r#"
SELECT p.id,
       p.name,
       p.price_cents,
       p.stock,
       p.track_stock,
       COALESCE((SELECT SUM(r.quantity)
                   FROM stock_reservations AS r
                  WHERE r.product_id = p.id
                    AND r.confirmed = 0
                    AND r.expires_at > ?), 0) AS reserved
  FROM products AS p
 WHERE p.id = ?
"#;

impl ProductRepository {
    /// Loads a product and its active reservation total. Pool-scoped;
    /// suitable only for advisory reads.
    pub async fn fetch_with_reserved(
        &self,
        product_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<ProductWithReserved>, ProductError> {
        let row = sqlx::query_as::<_, ProductWithReserved>(PRODUCT_WITH_RESERVED_SQL)
            .bind(to_rfc3339(now))
            .bind(product_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    /// Transaction-scoped variant of [`Self::fetch_with_reserved`]. Any
    /// decision that leads to a write must use this one so the read and the
    /// write serialize around the same product row.
    pub async fn fetch_with_reserved_in_tx(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        product_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<ProductWithReserved>, ProductError> {
        let row = sqlx::query_as::<_, ProductWithReserved>(PRODUCT_WITH_RESERVED_SQL)
            .bind(to_rfc3339(now))
            .bind(product_id)
            .fetch_optional(&mut **tx)
            .await?;
        Ok(row)
    }

    /// Decrements the on-hand count, guarded so the count never goes
    /// negative even if a caller's earlier read was stale.
    pub async fn decrement_stock(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        product_id: &str,
        quantity: i64,
        now: DateTime<Utc>,
    ) -> Result<i64, ProductError> {
        let row = sqlx::query(
            "UPDATE products \
             SET stock = stock - ?, updated_at = ? \
             WHERE id = ? AND stock >= ? \
             RETURNING stock",
        )
        .bind(quantity)
        .bind(to_rfc3339(now))
        .bind(product_id)
        .bind(quantity)
        .fetch_optional(&mut **tx)
        .await?;

        let Some(row) = row else {
            return Err(ProductError::StockConflict);
        };
        Ok(row.get("stock"))
    }

    /// Adds quantity back to the on-hand count when a confirmed
    /// reservation is released.
    pub async fn restore_stock(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        product_id: &str,
        quantity: i64,
        now: DateTime<Utc>,
    ) -> Result<i64, ProductError> {
        let row = sqlx::query(
            "UPDATE products \
             SET stock = stock + ?, updated_at = ? \
             WHERE id = ? \
             RETURNING stock",
        )
        .bind(quantity)
        .bind(to_rfc3339(now))
        .bind(product_id)
        .fetch_optional(&mut **tx)
        .await?;

        let Some(row) = row else {
            return Err(ProductError::NotFound);
        };
        Ok(row.get("stock"))
    }
}

/// Errors that can occur while reading or mutating product stock.
#[derive(Debug, Error)]
pub enum ProductError {
    #[error("product not found")]
    NotFound,
    #[error("stock update rejected: on-hand count would go negative")]
    StockConflict,
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Repository for stock reservation rows.
#[derive(Clone)]
pub struct ReservationRepository {
    pool: SqlitePool,
}

/// Parameters required to insert a reservation.
pub struct NewReservation<'a> {
    pub product_id: &'a str,
    pub order_number: &'a str,
    pub quantity: i64,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// Raw reservation row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ReservationRow {
    pub id: String,
    pub product_id: String,
    pub order_number: String,
    pub quantity: i64,
    pub expires_at: DateTime<Utc>,
    pub confirmed: i64,
}

impl ReservationRow {
    /// Converts the database row into the domain reservation.
    pub fn into_domain(self) -> StockReservation {
        StockReservation {
            id: self.id,
            product_id: self.product_id,
            order_number: self.order_number,
            quantity: self.quantity,
            expires_at: self.expires_at,
            confirmed: self.confirmed != 0,
        }
    }

    pub fn is_confirmed(&self) -> bool {
        self.confirmed != 0
    }
}

impl ReservationRepository {
    /// Inserts a new unconfirmed reservation.
    pub async fn insert(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        reservation: &NewReservation<'_>,
    ) -> Result<String, ReservationError> {
        let id = Uuid::new_v4().to_string();
        sqlx::query(
            "INSERT INTO stock_reservations \
             (id, product_id, order_number, quantity, expires_at, confirmed, created_at) \
             VALUES (?, ?, ?, ?, ?, 0, ?)",
        )
        .bind(&id)
        .bind(reservation.product_id)
        .bind(reservation.order_number)
        .bind(reservation.quantity)
        .bind(to_rfc3339(reservation.expires_at))
        .bind(to_rfc3339(reservation.created_at))
        .execute(&mut **tx)
        .await?;

        Ok(id)
    }

    /// Loads every reservation belonging to an order, any state.
    pub async fn list_for_order(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        order_number: &str,
    ) -> Result<Vec<ReservationRow>, ReservationError> {
        let rows = sqlx::query_as::<_, ReservationRow>(
            "SELECT id, product_id, order_number, quantity, expires_at, confirmed \
             FROM stock_reservations WHERE order_number = ? ORDER BY created_at ASC",
        )
        .bind(order_number)
        .fetch_all(&mut **tx)
        .await?;
        Ok(rows)
    }

    /// Loads the unconfirmed reservations belonging to an order.
    pub async fn list_unconfirmed_for_order(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        order_number: &str,
    ) -> Result<Vec<ReservationRow>, ReservationError> {
        let rows = sqlx::query_as::<_, ReservationRow>(
            "SELECT id, product_id, order_number, quantity, expires_at, confirmed \
             FROM stock_reservations WHERE order_number = ? AND confirmed = 0 \
             ORDER BY created_at ASC",
        )
        .bind(order_number)
        .fetch_all(&mut **tx)
        .await?;
        Ok(rows)
    }

    /// Flips a reservation to confirmed.
    pub async fn mark_confirmed(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        reservation_id: &str,
    ) -> Result<(), ReservationError> {
        let result = sqlx::query("UPDATE stock_reservations SET confirmed = 1 WHERE id = ?")
            .bind(reservation_id)
            .execute(&mut **tx)
            .await?;

        if result.rows_affected() == 0 {
            return Err(ReservationError::Missing);
        }
        Ok(())
    }

    /// Deletes every reservation belonging to an order, returning the row
    /// count. Safe to call again; the second call deletes nothing.
    pub async fn delete_for_order(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        order_number: &str,
    ) -> Result<u64, ReservationError> {
        let result = sqlx::query("DELETE FROM stock_reservations WHERE order_number = ?")
            .bind(order_number)
            .execute(&mut **tx)
            .await?;
        Ok(result.rows_affected())
    }

    /// Deletes one batch of unconfirmed reservations whose window closed
    /// before the threshold. Used by the maintenance sweeper.
    pub async fn delete_expired_batch(
        &self,
        threshold: DateTime<Utc>,
        limit: i64,
    ) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            "DELETE FROM stock_reservations \
             WHERE id IN (SELECT id FROM stock_reservations \
                          WHERE confirmed = 0 AND expires_at < ? LIMIT ?)",
        )
        .bind(to_rfc3339(threshold))
        .bind(limit)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

/// Errors that can occur while mutating reservations.
#[derive(Debug, Error)]
pub enum ReservationError {
    #[error("reservation row is missing")]
    Missing,
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Repository for orders and their line items.
#[derive(Clone)]
pub struct OrderRepository {
    pool: SqlitePool,
}

/// Data required to create a new order with its items.
pub struct NewOrder<'a> {
    pub id: String,
    pub order_number: &'a str,
    pub customer_id: &'a str,
    pub items: &'a [OrderItem],
    pub subtotal_cents: i64,
    pub shipping_cents: i64,
    pub total_cents: i64,
    pub state: OrderState,
    pub reservation_expires_at: DateTime<Utc>,
    pub shipping_address: Option<&'a ShippingAddress>,
    pub created_at: DateTime<Utc>,
}

/// Result of attempting to insert an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderInsertOutcome {
    Inserted,
    DuplicateOrderNumber,
}

impl OrderInsertOutcome {
    pub fn is_duplicate(self) -> bool {
        matches!(self, Self::DuplicateOrderNumber)
    }
}

/// Raw order row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct OrderRow {
    pub id: String,
    pub order_number: String,
    pub customer_id: String,
    pub subtotal_cents: i64,
    pub shipping_cents: i64,
    pub total_cents: i64,
    pub status: String,
    pub payment_status: String,
    pub reservation_expires_at: Option<DateTime<Utc>>,
    pub shipping_address_json: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
struct OrderItemRow {
    product_id: String,
    product_name: String,
    quantity: i64,
    unit_price_cents: i64,
}

impl OrderRow {
    /// Converts the database row into the domain order, validating the
    /// persisted status pair.
    fn into_domain(self, items: Vec<OrderItem>) -> Result<Order, OrderError> {
        let status = self.status.parse().map_err(OrderError::UnknownStatus)?;
        let payment = self
            .payment_status
            .parse()
            .map_err(OrderError::UnknownStatus)?;
        let state = OrderState::new(status, payment)?;

        let shipping_address = match self.shipping_address_json {
            Some(raw) => Some(serde_json::from_str(&raw)?),
            None => None,
        };

        Ok(Order {
            id: self.id,
            order_number: self.order_number,
            customer_id: self.customer_id,
            items,
            subtotal_cents: self.subtotal_cents,
            shipping_cents: self.shipping_cents,
            total_cents: self.total_cents,
            state,
            reservation_expires_at: self.reservation_expires_at,
            shipping_address,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

const ORDER_SELECT_SQL: &str = "SELECT id, order_number, customer_id, subtotal_cents, \
     shipping_cents, total_cents, status, payment_status, reservation_expires_at, \
     shipping_address_json, created_at, updated_at \
     FROM orders WHERE order_number = ?";

const ORDER_ITEMS_SELECT_SQL: &str = "SELECT product_id, product_name, quantity, \
     unit_price_cents FROM order_items WHERE order_id = ? ORDER BY created_at ASC, id ASC";

impl OrderRepository {
    /// Inserts an order and its line items. A duplicate order number is
    /// reported as an outcome so the caller can regenerate and retry.
    pub async fn insert(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        order: &NewOrder<'_>,
    ) -> Result<OrderInsertOutcome, OrderError> {
        let shipping_address_json = order
            .shipping_address
            .map(serde_json::to_string)
            .transpose()?;
        let created_at = to_rfc3339(order.created_at);

        let result = sqlx::query(
            "INSERT INTO orders \
             (id, order_number, customer_id, subtotal_cents, shipping_cents, total_cents, \
              status, payment_status, reservation_expires_at, shipping_address_json, \
              created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&order.id)
        .bind(order.order_number)
        .bind(order.customer_id)
        .bind(order.subtotal_cents)
        .bind(order.shipping_cents)
        .bind(order.total_cents)
        .bind(order.state.status().as_str())
        .bind(order.state.payment().as_str())
        .bind(to_rfc3339(order.reservation_expires_at))
        .bind(&shipping_address_json)
        .bind(&created_at)
        .bind(&created_at)
        .execute(&mut **tx)
        .await;

        if let Err(sqlx::Error::Database(db_err)) = &result {
            if db_err.code().as_deref() == Some("2067") {
                return Ok(OrderInsertOutcome::DuplicateOrderNumber);
            }
        }
        result?;

        for item in order.items {
            sqlx::query(
                "INSERT INTO order_items \
                 (id, order_id, product_id, product_name, quantity, unit_price_cents, created_at) \
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(Uuid::new_v4().to_string())
            .bind(&order.id)
            .bind(&item.product_id)
            .bind(&item.product_name)
            .bind(item.quantity)
            .bind(item.unit_price_cents)
            .bind(&created_at)
            .execute(&mut **tx)
            .await?;
        }

        Ok(OrderInsertOutcome::Inserted)
    }

    /// Loads an order with its items. Pool-scoped.
    pub async fn fetch_by_number(
        &self,
        order_number: &str,
    ) -> Result<Option<Order>, OrderError> {
        let row = sqlx::query_as::<_, OrderRow>(ORDER_SELECT_SQL)
            .bind(order_number)
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let items = sqlx::query_as::<_, OrderItemRow>(ORDER_ITEMS_SELECT_SQL)
            .bind(&row.id)
            .fetch_all(&self.pool)
            .await?;

        Ok(Some(row.into_domain(items_to_domain(items))?))
    }

    /// Transaction-scoped order load, used by workflow operations so the
    /// state they guard on cannot change underneath the write.
    pub async fn fetch_by_number_in_tx(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        order_number: &str,
    ) -> Result<Option<Order>, OrderError> {
        let row = sqlx::query_as::<_, OrderRow>(ORDER_SELECT_SQL)
            .bind(order_number)
            .fetch_optional(&mut **tx)
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let items = sqlx::query_as::<_, OrderItemRow>(ORDER_ITEMS_SELECT_SQL)
            .bind(&row.id)
            .fetch_all(&mut **tx)
            .await?;

        Ok(Some(row.into_domain(items_to_domain(items))?))
    }

    /// Writes a new state pair and reservation window onto an order.
    pub async fn update_state(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        order_number: &str,
        state: OrderState,
        reservation_expires_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<(), OrderError> {
        let result = sqlx::query(
            "UPDATE orders \
             SET status = ?, payment_status = ?, reservation_expires_at = ?, updated_at = ? \
             WHERE order_number = ?",
        )
        .bind(state.status().as_str())
        .bind(state.payment().as_str())
        .bind(reservation_expires_at.map(to_rfc3339))
        .bind(to_rfc3339(now))
        .bind(order_number)
        .execute(&mut **tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(OrderError::NotFound);
        }
        Ok(())
    }
}

fn items_to_domain(items: Vec<OrderItemRow>) -> Vec<OrderItem> {
    items
        .into_iter()
        .map(|row| OrderItem {
            product_id: row.product_id,
            product_name: row.product_name,
            quantity: row.quantity,
            unit_price_cents: row.unit_price_cents,
        })
        .collect()
}

/// Errors that can occur while reading or mutating orders.
#[derive(Debug, Error)]
pub enum OrderError {
    #[error("order not found")]
    NotFound,
    #[error("persisted status is not recognised: {0}")]
    UnknownStatus(UnknownStatus),
    #[error("persisted state pair is illegal: {0}")]
    IllegalState(#[from] IllegalState),
    #[error("failed to decode shipping address: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Repository for customers and their saved addresses.
#[derive(Clone)]
pub struct CustomerRepository {
    pool: SqlitePool,
}

/// Customer row resolved at order placement.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct CustomerRow {
    pub id: String,
    pub email: String,
    pub name: String,
}

/// Parameters for saving a new default shipping address.
pub struct NewAddress<'a> {
    pub customer_id: &'a str,
    pub address: &'a ShippingAddress,
    pub saved_at: DateTime<Utc>,
}

impl CustomerRepository {
    /// Resolves a buyer account by e-mail.
    pub async fn find_by_email(&self, email: &str) -> Result<CustomerRow, CustomerError> {
        let row = sqlx::query_as::<_, CustomerRow>(
            "SELECT id, email, name FROM customers WHERE email = ?",
        )
        .bind(email)
        .fetch_optional(&self.pool)
        .await?;

        row.ok_or(CustomerError::NotFound)
    }

    /// Saves a shipping address as the customer's new default, demoting
    /// whatever was default before.
    pub async fn set_default_address(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        new_address: &NewAddress<'_>,
    ) -> Result<(), CustomerError> {
        let saved_at = to_rfc3339(new_address.saved_at);
        sqlx::query(
            "UPDATE addresses SET is_default = 0, updated_at = ? \
             WHERE customer_id = ? AND is_default = 1",
        )
        .bind(&saved_at)
        .bind(new_address.customer_id)
        .execute(&mut **tx)
        .await?;

        let address = new_address.address;
        sqlx::query(
            "INSERT INTO addresses \
             (id, customer_id, recipient, line1, line2, city, postal_code, country, \
              is_default, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, 1, ?, ?)",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(new_address.customer_id)
        .bind(&address.recipient)
        .bind(&address.line1)
        .bind(&address.line2)
        .bind(&address.city)
        .bind(&address.postal_code)
        .bind(&address.country)
        .bind(&saved_at)
        .bind(&saved_at)
        .execute(&mut **tx)
        .await?;

        Ok(())
    }
}

/// Errors that can occur while resolving customers or saving addresses.
#[derive(Debug, Error)]
pub enum CustomerError {
    #[error("customer not found")]
    NotFound,
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

fn to_rfc3339(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Millis, true)
}
