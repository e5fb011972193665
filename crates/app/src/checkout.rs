use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use metrics::counter;
use rand::Rng;
use serde::Deserialize;
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

use cardstall_core::availability::{describe_shortages, AvailabilityReport, Shortage};
use cardstall_core::pricing;
use cardstall_core::state::{OrderState, TransitionError};
use cardstall_core::types::{CartItem, Order, OrderItem, ShippingAddress};
use cardstall_mailer::{InvoiceEmail, InvoiceLine, MailerClient};
use cardstall_storage::{
    CustomerError, CustomerRow, Database, NewAddress, NewOrder, OrderError, OrderInsertOutcome,
    ProductError, ReservationError,
};

use crate::reservation::{ReservationManager, ReserveItem, StockError};

/// Attempts made to allocate a unique order number before giving up.
const ORDER_NUMBER_ATTEMPTS: usize = 3;

const CURRENCY: &str = "EUR";

/// Orchestrates order placement, payment confirmation and cancellation.
///
/// Every multi-step mutation runs inside a single transaction: an error
/// anywhere aborts the whole operation with no partial state persisted.
#[derive(Clone)]
pub struct CheckoutService {
    database: Database,
    reservations: ReservationManager,
    mailer: Option<MailerClient>,
    clock: Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>,
    reservation_ttl: Duration,
}

/// Buyer request to place an order.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateOrderRequest {
    pub email: String,
    pub items: Vec<CartItem>,
    #[serde(default)]
    pub shipping_address: Option<ShippingAddress>,
}

impl CheckoutService {
    pub fn new(
        database: Database,
        mailer: Option<MailerClient>,
        reservation_ttl_minutes: i64,
    ) -> Self {
        let reservations = ReservationManager::new(&database);
        Self {
            database,
            reservations,
            mailer,
            clock: Arc::new(Utc::now),
            reservation_ttl: Duration::minutes(reservation_ttl_minutes),
        }
    }

    #[cfg(test)]
    pub fn with_clock(mut self, clock: Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>) -> Self {
        self.clock = clock;
        self
    }

    fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }

    /// Advisory availability check for the whole cart.
    ///
    /// Reports every short item so the buyer sees the complete picture.
    /// This read is not a guarantee; `reserve` re-checks inside the
    /// placement transaction.
    pub async fn check_availability(
        &self,
        items: &[CartItem],
    ) -> Result<AvailabilityReport, CheckoutError> {
        let now = self.now();
        let products = self.database.products();
        let mut report = AvailabilityReport::default();

        for item in items {
            match products.fetch_with_reserved(&item.product_id, now).await? {
                None => report.record(Shortage::missing_product(&item.product_id, item.quantity)),
                Some(row) => {
                    let availability = row.availability();
                    if !availability.satisfies(item.quantity) {
                        report.record(Shortage::new(row.name, item.quantity, availability));
                    }
                }
            }
        }

        Ok(report)
    }

    /// Places an order: reserves stock for every item, creates the order
    /// row and optionally saves the shipping address, all in one
    /// transaction.
    pub async fn create_order(&self, request: &CreateOrderRequest) -> Result<Order, CheckoutError> {
        if request.items.is_empty() {
            return Err(CheckoutError::EmptyCart);
        }
        if request.items.iter().any(|item| item.quantity <= 0) {
            return Err(CheckoutError::InvalidQuantity);
        }

        let customer = self.resolve_customer(&request.email).await?;

        let report = self.check_availability(&request.items).await?;
        if !report.is_available() {
            counter!("stock_shortage_total").increment(1);
            return Err(CheckoutError::StockShortage(report.shortages));
        }

        let now = self.now();
        let expires_at = now + self.reservation_ttl;

        for _attempt in 0..ORDER_NUMBER_ATTEMPTS {
            let order_number = generate_order_number(now);
            let mut tx = self.database.begin().await?;

            let (order_items, reserve_items) =
                self.resolve_items(&mut tx, &request.items, now).await?;

            self.reservations
                .reserve(&mut tx, &order_number, &reserve_items, expires_at, now)
                .await?;

            let totals = pricing::compute_totals(&order_items);
            let order = Order {
                id: Uuid::new_v4().to_string(),
                order_number: order_number.clone(),
                customer_id: customer.id.clone(),
                items: order_items,
                subtotal_cents: totals.subtotal_cents,
                shipping_cents: totals.shipping_cents,
                total_cents: totals.total_cents,
                state: OrderState::pending(),
                reservation_expires_at: Some(expires_at),
                shipping_address: request.shipping_address.clone(),
                created_at: now,
                updated_at: now,
            };

            let outcome = self
                .database
                .orders()
                .insert(
                    &mut tx,
                    &NewOrder {
                        id: order.id.clone(),
                        order_number: &order.order_number,
                        customer_id: &customer.id,
                        items: &order.items,
                        subtotal_cents: order.subtotal_cents,
                        shipping_cents: order.shipping_cents,
                        total_cents: order.total_cents,
                        state: order.state,
                        reservation_expires_at: expires_at,
                        shipping_address: order.shipping_address.as_ref(),
                        created_at: now,
                    },
                )
                .await?;

            if outcome == OrderInsertOutcome::DuplicateOrderNumber {
                // Collision on the random suffix; roll back and try a
                // fresh number.
                drop(tx);
                warn!(stage = "checkout", %order_number, "order number collision, retrying");
                continue;
            }

            if let Some(address) = &request.shipping_address {
                self.database
                    .customers()
                    .set_default_address(
                        &mut tx,
                        &NewAddress {
                            customer_id: &customer.id,
                            address,
                            saved_at: now,
                        },
                    )
                    .await
                    .map_err(CheckoutError::Customer)?;
            }

            tx.commit().await?;

            counter!("orders_created_total").increment(1);
            info!(
                stage = "checkout",
                order_number = %order.order_number,
                customer_id = %customer.id,
                total_cents = order.total_cents,
                expires_at = %expires_at.to_rfc3339(),
                "order placed"
            );

            self.send_invoice(&customer, &order).await;

            return Ok(order);
        }

        Err(CheckoutError::OrderNumberExhausted)
    }

    /// Buyer reports payment complete: confirms the reservations
    /// (decrementing real stock) and moves the payment leg to processing.
    pub async fn confirm_payment(&self, order_number: &str) -> Result<Order, CheckoutError> {
        let now = self.now();
        let mut tx = self.database.begin().await?;

        let order = self
            .database
            .orders()
            .fetch_by_number_in_tx(&mut tx, order_number)
            .await?
            .ok_or_else(|| CheckoutError::OrderNotFound(order_number.to_string()))?;

        let next = order.state.begin_payment_processing()?;

        if let Some(expires_at) = order.reservation_expires_at {
            if now > expires_at {
                counter!("reservation_expired_total").increment(1);
                return Err(CheckoutError::ReservationExpired);
            }
        }

        self.reservations.confirm(&mut tx, order_number, now).await?;
        self.database
            .orders()
            .update_state(&mut tx, order_number, next, None, now)
            .await?;
        tx.commit().await?;

        counter!("payments_confirmed_total").increment(1);
        info!(stage = "checkout", %order_number, "payment confirmed, stock committed");

        Ok(Order {
            state: next,
            reservation_expires_at: None,
            updated_at: now,
            ..order
        })
    }

    /// Cancels an order, releasing its reservations and restoring any
    /// stock that had already been committed.
    pub async fn cancel_order(&self, order_number: &str) -> Result<Order, CheckoutError> {
        let now = self.now();
        let mut tx = self.database.begin().await?;

        let order = self
            .database
            .orders()
            .fetch_by_number_in_tx(&mut tx, order_number)
            .await?
            .ok_or_else(|| CheckoutError::OrderNotFound(order_number.to_string()))?;

        let next = order.state.cancel()?;

        let outcome = self.reservations.release(&mut tx, order_number, now).await?;
        self.database
            .orders()
            .update_state(&mut tx, order_number, next, None, now)
            .await?;
        tx.commit().await?;

        counter!("orders_cancelled_total").increment(1);
        info!(
            stage = "checkout",
            %order_number,
            reservations_deleted = outcome.rows_deleted,
            stock_restored = outcome.quantity_restored,
            "order cancelled"
        );

        Ok(Order {
            state: next,
            reservation_expires_at: None,
            updated_at: now,
            ..order
        })
    }

    async fn resolve_customer(&self, email: &str) -> Result<CustomerRow, CheckoutError> {
        self.database
            .customers()
            .find_by_email(email)
            .await
            .map_err(|err| match err {
                CustomerError::NotFound => CheckoutError::CustomerNotFound(email.to_string()),
                other => CheckoutError::Customer(other),
            })
    }

    /// Loads the product row for every cart item inside the placement
    /// transaction, snapshotting name and price onto the order.
    async fn resolve_items(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        items: &[CartItem],
        now: DateTime<Utc>,
    ) -> Result<(Vec<OrderItem>, Vec<ReserveItem>), CheckoutError> {
        let products = self.database.products();
        let mut order_items = Vec::with_capacity(items.len());
        let mut reserve_items = Vec::with_capacity(items.len());

        for item in items {
            let row = products
                .fetch_with_reserved_in_tx(tx, &item.product_id, now)
                .await?
                .ok_or_else(|| {
                    CheckoutError::StockShortage(vec![Shortage::missing_product(
                        &item.product_id,
                        item.quantity,
                    )])
                })?;

            order_items.push(OrderItem {
                product_id: row.id.clone(),
                product_name: row.name.clone(),
                quantity: item.quantity,
                unit_price_cents: row.price_cents,
            });
            let track_stock = row.tracks_stock();
            reserve_items.push(ReserveItem {
                product_id: row.id,
                name: row.name,
                quantity: item.quantity,
                track_stock,
            });
        }

        Ok((order_items, reserve_items))
    }

    /// Best-effort invoice delivery after the placement transaction has
    /// committed. A failed send never fails the order.
    async fn send_invoice(&self, customer: &CustomerRow, order: &Order) {
        let Some(mailer) = &self.mailer else {
            return;
        };

        let lines: Vec<InvoiceLine> = order
            .items
            .iter()
            .map(|item| InvoiceLine {
                name: item.product_name.clone(),
                quantity: item.quantity,
                unit_price_cents: item.unit_price_cents,
            })
            .collect();

        let invoice = InvoiceEmail {
            to: &customer.email,
            order_number: &order.order_number,
            customer_name: &customer.name,
            items: &lines,
            subtotal_cents: order.subtotal_cents,
            shipping_cents: order.shipping_cents,
            total_cents: order.total_cents,
            currency: CURRENCY,
        };

        match mailer.send_invoice(&invoice).await {
            Ok(receipt) => {
                counter!("invoice_email_total", "result" => "ok").increment(1);
                info!(
                    stage = "mailer",
                    order_number = %order.order_number,
                    message_id = %receipt.message_id,
                    "invoice e-mail sent"
                );
            }
            Err(err) => {
                counter!("invoice_email_total", "result" => "error").increment(1);
                error!(
                    stage = "mailer",
                    order_number = %order.order_number,
                    error = %err,
                    "invoice e-mail failed; order stands"
                );
            }
        }
    }
}

fn generate_order_number(now: DateTime<Utc>) -> String {
    // Unambiguous alphabet: no 0/O, 1/I/L.
    const ALPHABET: &[u8] = b"ABCDEFGHJKMNPQRSTUVWXYZ23456789";
    let mut rng = rand::thread_rng();
    let suffix: String = (0..6)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect();
    format!("ORD-{}-{}", now.format("%Y%m%d"), suffix)
}

/// Everything that can go wrong inside the checkout workflow.
///
/// Domain variants carry the message shown to the buyer; infrastructure
/// variants are logged in full and surfaced as a generic failure.
#[derive(Debug, Error)]
pub enum CheckoutError {
    #[error("your cart is empty")]
    EmptyCart,
    #[error("item quantities must be positive")]
    InvalidQuantity,
    #[error("no account found for {0}")]
    CustomerNotFound(String),
    #[error("order {0} was not found")]
    OrderNotFound(String),
    #[error("{}", describe_shortages(.0))]
    StockShortage(Vec<Shortage>),
    #[error("{0}")]
    InvalidState(#[from] TransitionError),
    #[error("the reservation for this order has expired; please restart checkout")]
    ReservationExpired,
    #[error("could not allocate a unique order number")]
    OrderNumberExhausted,
    #[error("product storage error: {0}")]
    Product(#[from] ProductError),
    #[error("reservation storage error: {0}")]
    Reservation(#[from] ReservationError),
    #[error("order storage error: {0}")]
    Order(#[from] OrderError),
    #[error("customer storage error: {0}")]
    Customer(CustomerError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl From<StockError> for CheckoutError {
    fn from(err: StockError) -> Self {
        match err {
            StockError::Insufficient(shortage) => Self::StockShortage(vec![shortage]),
            StockError::Product(err) => Self::Product(err),
            StockError::Reservation(err) => Self::Reservation(err),
        }
    }
}

impl CheckoutError {
    /// Infrastructure failures are never shown to the buyer verbatim.
    pub fn is_internal(&self) -> bool {
        matches!(
            self,
            Self::OrderNumberExhausted
                | Self::Product(_)
                | Self::Reservation(_)
                | Self::Order(_)
                | Self::Customer(_)
                | Self::Database(_)
        )
    }

    /// The message the UI displays next to `success: false`.
    pub fn user_message(&self) -> String {
        if self.is_internal() {
            "something went wrong while processing your order; please try again".to_string()
        } else {
            self.to_string()
        }
    }

    /// Per-item shortage detail, when this failure carries one.
    pub fn shortages(&self) -> Option<&[Shortage]> {
        match self {
            Self::StockShortage(shortages) => Some(shortages),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry;
    use cardstall_core::types::{OrderStatus, PaymentStatus};
    use httpmock::prelude::*;
    use reqwest::Client;
    use tempfile::TempDir;
    use url::Url;

    const FIXED_NOW: &str = "2026-03-01T12:00:00Z";

    fn fixed_now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(FIXED_NOW)
            .expect("fixed time")
            .with_timezone(&Utc)
    }

    async fn setup_db() -> (Database, TempDir) {
        telemetry::init_metrics().expect("metrics");
        let dir = tempfile::tempdir().expect("tempdir");
        let url = format!(
            "sqlite://{}?mode=rwc",
            dir.path().join("cardstall.db").display()
        );
        let db = Database::connect(&url).await.expect("connect");
        db.run_migrations().await.expect("migrations");
        sqlx::query(
            "INSERT INTO customers (id, email, name, created_at, updated_at) \
             VALUES ('c-1', 'ash@example.com', 'Ash Ketchum', ?, ?)",
        )
        .bind(FIXED_NOW)
        .bind(FIXED_NOW)
        .execute(db.pool())
        .await
        .expect("insert customer");
        seed_product(&db, "card-1", "Charizard Holo", 1500, 5, true).await;
        seed_product(&db, "card-2", "Pikachu Promo", 900, 2, true).await;
        seed_product(&db, "digital-1", "Online Code Card", 500, 0, false).await;
        (db, dir)
    }

    async fn seed_product(
        db: &Database,
        id: &str,
        name: &str,
        price_cents: i64,
        stock: i64,
        tracked: bool,
    ) {
        sqlx::query(
            "INSERT INTO products (id, name, price_cents, stock, track_stock, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(id)
        .bind(name)
        .bind(price_cents)
        .bind(stock)
        .bind(tracked as i64)
        .bind(FIXED_NOW)
        .bind(FIXED_NOW)
        .execute(db.pool())
        .await
        .expect("insert product");
    }

    fn service_at(db: &Database, now: DateTime<Utc>) -> CheckoutService {
        CheckoutService::new(db.clone(), None, 30).with_clock(Arc::new(move || now))
    }

    fn request(items: Vec<CartItem>) -> CreateOrderRequest {
        CreateOrderRequest {
            email: "ash@example.com".to_string(),
            items,
            shipping_address: None,
        }
    }

    fn cart(product_id: &str, quantity: i64) -> CartItem {
        CartItem {
            product_id: product_id.to_string(),
            quantity,
        }
    }

    async fn stock_of(db: &Database, id: &str) -> i64 {
        let row: (i64,) = sqlx::query_as("SELECT stock FROM products WHERE id = ?")
            .bind(id)
            .fetch_one(db.pool())
            .await
            .expect("stock");
        row.0
    }

    async fn reservation_count(db: &Database) -> i64 {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM stock_reservations")
            .fetch_one(db.pool())
            .await
            .expect("count");
        row.0
    }

    #[tokio::test]
    async fn placed_order_reduces_availability_but_not_stock() {
        let (db, _dir) = setup_db().await;
        let now = fixed_now();
        let service = service_at(&db, now);

        let order = service
            .create_order(&request(vec![cart("card-1", 3)]))
            .await
            .expect("order placed");

        assert_eq!(order.state.status(), OrderStatus::Pending);
        assert_eq!(order.state.payment(), PaymentStatus::Pending);
        assert_eq!(
            order.reservation_expires_at,
            Some(now + Duration::minutes(30))
        );
        assert_eq!(order.subtotal_cents, 4500);
        assert_eq!(order.shipping_cents, 495);
        assert_eq!(order.total_cents, 4995);
        assert!(order.order_number.starts_with("ORD-20260301-"));

        // The authoritative count is untouched; only availability moves.
        assert_eq!(stock_of(&db, "card-1").await, 5);
        let row = db
            .products()
            .fetch_with_reserved("card-1", now)
            .await
            .expect("fetch")
            .expect("product");
        assert_eq!(row.availability().reportable_count(), Some(2));
    }

    #[tokio::test]
    async fn fully_reserved_product_rejects_further_orders() {
        let (db, _dir) = setup_db().await;
        let now = fixed_now();
        let service = service_at(&db, now);

        service
            .create_order(&request(vec![cart("card-1", 5)]))
            .await
            .expect("first order");

        let err = service
            .create_order(&request(vec![cart("card-1", 1)]))
            .await
            .unwrap_err();

        let shortages = err.shortages().expect("shortage detail");
        assert_eq!(shortages.len(), 1);
        assert_eq!(shortages[0].name, "Charizard Holo");
        assert_eq!(shortages[0].requested, 1);
        assert_eq!(shortages[0].available, 0);

        // No second order or reservation survived.
        assert_eq!(reservation_count(&db).await, 1);
    }

    #[tokio::test]
    async fn shortage_report_covers_every_item() {
        let (db, _dir) = setup_db().await;
        let service = service_at(&db, fixed_now());

        let err = service
            .create_order(&request(vec![
                cart("card-1", 9),
                cart("card-2", 3),
                cart("gone-card", 1),
            ]))
            .await
            .unwrap_err();

        let shortages = err.shortages().expect("shortage detail");
        assert_eq!(shortages.len(), 3);
        assert_eq!(shortages[0].available, 5);
        assert_eq!(shortages[1].available, 2);
        assert_eq!(shortages[2].name, "gone-card");
        assert_eq!(shortages[2].available, 0);

        let message = err.user_message();
        assert!(message.contains("Charizard Holo: requested 9, available 5"));
        assert!(message.contains("gone-card: requested 1, available 0"));
    }

    #[tokio::test]
    async fn untracked_items_never_reserve_or_run_out() {
        let (db, _dir) = setup_db().await;
        let now = fixed_now();
        let service = service_at(&db, now);

        let order = service
            .create_order(&request(vec![cart("digital-1", 40)]))
            .await
            .expect("order placed");

        assert_eq!(order.items[0].quantity, 40);
        assert_eq!(reservation_count(&db).await, 0);
    }

    #[tokio::test]
    async fn empty_cart_and_bad_quantities_are_rejected() {
        let (db, _dir) = setup_db().await;
        let service = service_at(&db, fixed_now());

        let err = service.create_order(&request(vec![])).await.unwrap_err();
        assert!(matches!(err, CheckoutError::EmptyCart));

        let err = service
            .create_order(&request(vec![cart("card-1", 0)]))
            .await
            .unwrap_err();
        assert!(matches!(err, CheckoutError::InvalidQuantity));

        assert_eq!(reservation_count(&db).await, 0);
    }

    #[tokio::test]
    async fn unknown_buyer_is_rejected_before_any_write() {
        let (db, _dir) = setup_db().await;
        let service = service_at(&db, fixed_now());

        let err = service
            .create_order(&CreateOrderRequest {
                email: "misty@example.com".to_string(),
                items: vec![cart("card-1", 1)],
                shipping_address: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, CheckoutError::CustomerNotFound(_)));
        assert_eq!(reservation_count(&db).await, 0);
    }

    #[tokio::test]
    async fn shipping_address_becomes_new_default() {
        let (db, _dir) = setup_db().await;
        let service = service_at(&db, fixed_now());

        let address = ShippingAddress {
            recipient: "Ash Ketchum".to_string(),
            line1: "1 Pallet Town Way".to_string(),
            line2: None,
            city: "Pallet Town".to_string(),
            postal_code: "00001".to_string(),
            country: "JP".to_string(),
        };
        let order = service
            .create_order(&CreateOrderRequest {
                email: "ash@example.com".to_string(),
                items: vec![cart("card-1", 1)],
                shipping_address: Some(address.clone()),
            })
            .await
            .expect("order placed");
        assert_eq!(order.shipping_address, Some(address));

        let row: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM addresses WHERE customer_id = 'c-1' AND is_default = 1",
        )
        .fetch_one(db.pool())
        .await
        .expect("count");
        assert_eq!(row.0, 1);
    }

    #[tokio::test]
    async fn confirm_payment_commits_stock_and_clears_window() {
        let (db, _dir) = setup_db().await;
        let now = fixed_now();
        let service = service_at(&db, now);

        let order = service
            .create_order(&request(vec![cart("card-1", 2)]))
            .await
            .expect("order placed");

        let confirmed = service
            .confirm_payment(&order.order_number)
            .await
            .expect("payment confirmed");

        assert_eq!(confirmed.state.payment(), PaymentStatus::Processing);
        assert_eq!(confirmed.state.status(), OrderStatus::Pending);
        assert!(confirmed.reservation_expires_at.is_none());
        assert_eq!(stock_of(&db, "card-1").await, 3);

        let stored = db
            .orders()
            .fetch_by_number(&order.order_number)
            .await
            .expect("fetch")
            .expect("order");
        assert_eq!(stored.state.payment(), PaymentStatus::Processing);
        assert!(stored.reservation_expires_at.is_none());
    }

    #[tokio::test]
    async fn confirm_payment_rejects_double_confirmation() {
        let (db, _dir) = setup_db().await;
        let service = service_at(&db, fixed_now());

        let order = service
            .create_order(&request(vec![cart("card-1", 2)]))
            .await
            .expect("order placed");
        service
            .confirm_payment(&order.order_number)
            .await
            .expect("first confirmation");

        let err = service
            .confirm_payment(&order.order_number)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CheckoutError::InvalidState(TransitionError::PaymentAlreadyUnderway)
        ));
        // Stock decremented exactly once.
        assert_eq!(stock_of(&db, "card-1").await, 3);
    }

    #[tokio::test]
    async fn confirm_payment_rejects_expired_reservation() {
        let (db, _dir) = setup_db().await;
        let now = fixed_now();
        let service = service_at(&db, now);

        let order = service
            .create_order(&request(vec![cart("card-1", 2)]))
            .await
            .expect("order placed");

        // One second past the window.
        let late = service_at(&db, now + Duration::minutes(30) + Duration::seconds(1));
        let err = late.confirm_payment(&order.order_number).await.unwrap_err();
        assert!(matches!(err, CheckoutError::ReservationExpired));

        // Nothing moved.
        assert_eq!(stock_of(&db, "card-1").await, 5);
        let stored = db
            .orders()
            .fetch_by_number(&order.order_number)
            .await
            .expect("fetch")
            .expect("order");
        assert_eq!(stored.state.payment(), PaymentStatus::Pending);
    }

    #[tokio::test]
    async fn confirm_payment_rejects_unknown_and_cancelled_orders() {
        let (db, _dir) = setup_db().await;
        let service = service_at(&db, fixed_now());

        let err = service.confirm_payment("ORD-MISSING").await.unwrap_err();
        assert!(matches!(err, CheckoutError::OrderNotFound(_)));

        let order = service
            .create_order(&request(vec![cart("card-1", 1)]))
            .await
            .expect("order placed");
        service
            .cancel_order(&order.order_number)
            .await
            .expect("cancelled");

        let err = service
            .confirm_payment(&order.order_number)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CheckoutError::InvalidState(TransitionError::OrderCancelled)
        ));
    }

    #[tokio::test]
    async fn cancel_after_confirmation_restores_stock() {
        let (db, _dir) = setup_db().await;
        let service = service_at(&db, fixed_now());

        let order = service
            .create_order(&request(vec![cart("card-1", 2)]))
            .await
            .expect("order placed");
        service
            .confirm_payment(&order.order_number)
            .await
            .expect("payment confirmed");
        assert_eq!(stock_of(&db, "card-1").await, 3);

        let cancelled = service
            .cancel_order(&order.order_number)
            .await
            .expect("cancelled");

        assert_eq!(cancelled.state.status(), OrderStatus::Cancelled);
        assert_eq!(cancelled.state.payment(), PaymentStatus::Cancelled);
        assert_eq!(stock_of(&db, "card-1").await, 5);
        assert_eq!(reservation_count(&db).await, 0);
    }

    #[tokio::test]
    async fn cancel_before_confirmation_only_releases_the_claim() {
        let (db, _dir) = setup_db().await;
        let now = fixed_now();
        let service = service_at(&db, now);

        let order = service
            .create_order(&request(vec![cart("card-1", 4)]))
            .await
            .expect("order placed");
        service
            .cancel_order(&order.order_number)
            .await
            .expect("cancelled");

        assert_eq!(stock_of(&db, "card-1").await, 5);
        assert_eq!(reservation_count(&db).await, 0);
        let row = db
            .products()
            .fetch_with_reserved("card-1", now)
            .await
            .expect("fetch")
            .expect("product");
        assert_eq!(row.availability().reportable_count(), Some(5));
    }

    #[tokio::test]
    async fn cancel_rejects_shipped_and_repeated_cancellation() {
        let (db, _dir) = setup_db().await;
        let service = service_at(&db, fixed_now());

        let order = service
            .create_order(&request(vec![cart("card-1", 1)]))
            .await
            .expect("order placed");

        sqlx::query(
            "UPDATE orders SET status = 'SHIPPED', payment_status = 'COMPLETED' \
             WHERE order_number = ?",
        )
        .bind(&order.order_number)
        .execute(db.pool())
        .await
        .expect("mark shipped");

        let err = service.cancel_order(&order.order_number).await.unwrap_err();
        assert!(matches!(
            err,
            CheckoutError::InvalidState(TransitionError::AlreadyFulfilled(OrderStatus::Shipped))
        ));
        // The claim is still there; nothing was released.
        assert_eq!(reservation_count(&db).await, 1);

        let other = service
            .create_order(&request(vec![cart("card-2", 1)]))
            .await
            .expect("order placed");
        service
            .cancel_order(&other.order_number)
            .await
            .expect("cancelled");
        let err = service.cancel_order(&other.order_number).await.unwrap_err();
        assert!(matches!(
            err,
            CheckoutError::InvalidState(TransitionError::AlreadyCancelled)
        ));
    }

    #[tokio::test]
    async fn invoice_failure_does_not_fail_the_order() {
        let (db, _dir) = setup_db().await;
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/messages");
            then.status(500).body("mail provider down");
        });

        let mailer = MailerClient::new(
            Url::parse(&server.base_url()).expect("url"),
            "key",
            "orders@cardstall.test",
            Client::new(),
        );
        let now = fixed_now();
        let service = CheckoutService::new(db.clone(), Some(mailer), 30)
            .with_clock(Arc::new(move || now));

        let order = service
            .create_order(&request(vec![cart("card-1", 1)]))
            .await
            .expect("order placed despite mail failure");

        let stored = db
            .orders()
            .fetch_by_number(&order.order_number)
            .await
            .expect("fetch")
            .expect("order persisted");
        assert_eq!(stored.order_number, order.order_number);
    }

    #[tokio::test]
    async fn invoice_success_carries_order_payload() {
        let (db, _dir) = setup_db().await;
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST)
                .path("/messages")
                .json_body_partial(r#"{"to": "ash@example.com", "currency": "EUR"}"#);
            then.status(200).body(r#"{"id": "msg-1"}"#);
        });

        let mailer = MailerClient::new(
            Url::parse(&server.base_url()).expect("url"),
            "key",
            "orders@cardstall.test",
            Client::new(),
        );
        let now = fixed_now();
        let service = CheckoutService::new(db.clone(), Some(mailer), 30)
            .with_clock(Arc::new(move || now));

        service
            .create_order(&request(vec![cart("card-1", 1)]))
            .await
            .expect("order placed");
        mock.assert();
    }

    #[tokio::test]
    async fn order_numbers_use_date_and_unambiguous_suffix() {
        let number = generate_order_number(fixed_now());
        assert_eq!(number.len(), "ORD-20260301-XXXXXX".len());
        assert!(number.starts_with("ORD-20260301-"));
        let suffix = &number["ORD-20260301-".len()..];
        assert!(suffix
            .chars()
            .all(|c| "ABCDEFGHJKMNPQRSTUVWXYZ23456789".contains(c)));
    }
}
