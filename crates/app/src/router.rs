use std::{sync::Arc, time::Instant};

use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, patch, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use metrics::histogram;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use tracing::error;

use cardstall_core::availability::Shortage;
use cardstall_core::types::{CartItem, Order};
use cardstall_mailer::MailerClient;
use cardstall_storage::Database;

use crate::checkout::{CheckoutError, CheckoutService, CreateOrderRequest};
use crate::problem::ProblemResponse;
use crate::{admin, telemetry};

#[derive(Clone)]
pub struct AppState {
    metrics: PrometheusHandle,
    storage: Database,
    checkout: CheckoutService,
    admin_token_digest: Option<[u8; 32]>,
    clock: Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>,
}

impl AppState {
    pub fn new(
        metrics: PrometheusHandle,
        storage: Database,
        mailer: Option<MailerClient>,
        reservation_ttl_minutes: i64,
        admin_token_digest: Option<[u8; 32]>,
    ) -> Self {
        let checkout = CheckoutService::new(storage.clone(), mailer, reservation_ttl_minutes);
        Self {
            metrics,
            storage,
            checkout,
            admin_token_digest,
            clock: Arc::new(Utc::now),
        }
    }

    #[cfg(test)]
    pub fn with_clock(mut self, clock: Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>) -> Self {
        self.clock = clock.clone();
        self.checkout = self.checkout.with_clock(clock);
        self
    }

    pub fn metrics(&self) -> &PrometheusHandle {
        &self.metrics
    }

    pub fn storage(&self) -> &Database {
        &self.storage
    }

    pub fn checkout(&self) -> &CheckoutService {
        &self.checkout
    }

    pub fn admin_token_digest(&self) -> Option<&[u8; 32]> {
        self.admin_token_digest.as_ref()
    }

    pub fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }
}

pub fn app_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        .route("/stock/availability", post(check_availability))
        .route("/orders", post(create_order))
        .route("/orders/:order_number", get(fetch_order))
        .route("/orders/:order_number/payment", post(confirm_payment))
        .route("/orders/:order_number/cancel", post(cancel_order))
        .route("/admin/orders/:order_number", patch(admin::patch_order))
        .with_state(state)
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}

async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    let body = telemetry::render_metrics(state.metrics());
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/plain; version=0.0.4")
        .body(Body::from(body))
        .unwrap()
}

/// Uniform result body for checkout workflow actions. Callers branch on
/// `success` and display `message`; internal detail never leaves the
/// server.
#[derive(Debug, Serialize)]
struct ActionResponse {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    order: Option<Order>,
    #[serde(skip_serializing_if = "Option::is_none")]
    shortages: Option<Vec<Shortage>>,
}

impl ActionResponse {
    fn completed(order: Order) -> Self {
        Self {
            success: true,
            message: None,
            order: Some(order),
            shortages: None,
        }
    }

    fn failed(err: &CheckoutError) -> Self {
        if err.is_internal() {
            error!(stage = "checkout", error = %err, "checkout operation failed");
        }
        Self {
            success: false,
            message: Some(err.user_message()),
            order: None,
            shortages: err.shortages().map(<[Shortage]>::to_vec),
        }
    }
}

async fn create_order(
    State(state): State<AppState>,
    Json(request): Json<CreateOrderRequest>,
) -> Json<ActionResponse> {
    let start = Instant::now();
    let result = state.checkout().create_order(&request).await;
    histogram!("checkout_latency_seconds", "op" => "create").record(start.elapsed().as_secs_f64());

    Json(match result {
        Ok(order) => ActionResponse::completed(order),
        Err(err) => ActionResponse::failed(&err),
    })
}

async fn confirm_payment(
    State(state): State<AppState>,
    Path(order_number): Path<String>,
) -> Json<ActionResponse> {
    let start = Instant::now();
    let result = state.checkout().confirm_payment(&order_number).await;
    histogram!("checkout_latency_seconds", "op" => "confirm").record(start.elapsed().as_secs_f64());

    Json(match result {
        Ok(order) => ActionResponse::completed(order),
        Err(err) => ActionResponse::failed(&err),
    })
}

async fn cancel_order(
    State(state): State<AppState>,
    Path(order_number): Path<String>,
) -> Json<ActionResponse> {
    let start = Instant::now();
    let result = state.checkout().cancel_order(&order_number).await;
    histogram!("checkout_latency_seconds", "op" => "cancel").record(start.elapsed().as_secs_f64());

    Json(match result {
        Ok(order) => ActionResponse::completed(order),
        Err(err) => ActionResponse::failed(&err),
    })
}

/// Order lookup used by the payment page to drive its reservation
/// countdown.
async fn fetch_order(
    State(state): State<AppState>,
    Path(order_number): Path<String>,
) -> Result<Json<Order>, ProblemResponse> {
    let order = state
        .storage()
        .orders()
        .fetch_by_number(&order_number)
        .await
        .map_err(|err| {
            error!(stage = "checkout", error = %err, "failed to load order");
            ProblemResponse::internal("storage_error")
        })?;

    order.map(Json).ok_or_else(|| {
        ProblemResponse::not_found(
            "order_not_found",
            format!("order {order_number} does not exist"),
        )
    })
}

#[derive(Debug, Deserialize)]
struct AvailabilityRequest {
    items: Vec<CartItem>,
}

#[derive(Debug, Serialize)]
struct AvailabilityResponse {
    available: bool,
    shortages: Vec<Shortage>,
}

/// Advisory cart check for fast buyer feedback before checkout opens a
/// transaction.
async fn check_availability(
    State(state): State<AppState>,
    Json(request): Json<AvailabilityRequest>,
) -> Result<Json<AvailabilityResponse>, ProblemResponse> {
    let report = state
        .checkout()
        .check_availability(&request.items)
        .await
        .map_err(|err| {
            error!(stage = "checkout", error = %err, "availability check failed");
            ProblemResponse::internal("storage_error")
        })?;

    Ok(Json(AvailabilityResponse {
        available: report.is_available(),
        shortages: report.shortages,
    }))
}
