//! Back-office order patching.
//!
//! The admin console writes `status`/`payment_status` directly, outside the
//! checkout transition guards, e.g. to mark a manually verified bank
//! transfer as completed. Combinations the state type rejects outright are
//! still refused.

use axum::{
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    Json,
};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tracing::{error, info};

use cardstall_core::state::OrderState;
use cardstall_core::types::{Order, OrderStatus, PaymentStatus};

use crate::problem::ProblemResponse;
use crate::router::AppState;

#[derive(Debug, Deserialize)]
pub struct AdminOrderPatch {
    #[serde(default)]
    pub status: Option<OrderStatus>,
    #[serde(default)]
    pub payment_status: Option<PaymentStatus>,
}

pub async fn patch_order(
    State(state): State<AppState>,
    Path(order_number): Path<String>,
    headers: HeaderMap,
    Json(patch): Json<AdminOrderPatch>,
) -> Result<Json<Order>, ProblemResponse> {
    authorize(&state, &headers)?;

    if patch.status.is_none() && patch.payment_status.is_none() {
        return Err(ProblemResponse::new(
            StatusCode::BAD_REQUEST,
            "empty_patch",
            "provide status and/or payment_status",
        ));
    }

    let now = state.now();
    let orders = state.storage().orders();
    let mut tx = state.storage().begin().await.map_err(|err| {
        error!(stage = "admin", error = %err, "failed to open transaction");
        ProblemResponse::internal("storage_error")
    })?;

    let order = orders
        .fetch_by_number_in_tx(&mut tx, &order_number)
        .await
        .map_err(|err| {
            error!(stage = "admin", error = %err, "failed to load order");
            ProblemResponse::internal("storage_error")
        })?
        .ok_or_else(|| {
            ProblemResponse::not_found(
                "order_not_found",
                format!("order {order_number} does not exist"),
            )
        })?;

    let status = patch.status.unwrap_or_else(|| order.state.status());
    let payment = patch.payment_status.unwrap_or_else(|| order.state.payment());
    let next = OrderState::new(status, payment).map_err(|err| {
        ProblemResponse::new(
            StatusCode::UNPROCESSABLE_ENTITY,
            "illegal_state",
            err.to_string(),
        )
    })?;

    orders
        .update_state(&mut tx, &order_number, next, order.reservation_expires_at, now)
        .await
        .map_err(|err| {
            error!(stage = "admin", error = %err, "failed to patch order");
            ProblemResponse::internal("storage_error")
        })?;
    tx.commit().await.map_err(|err| {
        error!(stage = "admin", error = %err, "failed to commit patch");
        ProblemResponse::internal("storage_error")
    })?;

    info!(
        stage = "admin",
        %order_number,
        status = next.status().as_str(),
        payment_status = next.payment().as_str(),
        "back-office status patch applied"
    );

    Ok(Json(Order {
        state: next,
        updated_at: now,
        ..order
    }))
}

fn authorize(state: &AppState, headers: &HeaderMap) -> Result<(), ProblemResponse> {
    let Some(expected) = state.admin_token_digest() else {
        return Err(ProblemResponse::new(
            StatusCode::UNAUTHORIZED,
            "admin_disabled",
            "no back-office token is configured",
        ));
    };

    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .ok_or_else(|| {
            ProblemResponse::new(
                StatusCode::UNAUTHORIZED,
                "missing_token",
                "Authorization: Bearer <token> required",
            )
        })?;

    let digest = Sha256::digest(token.as_bytes());
    if digest.as_slice().ct_eq(&expected[..]).into() {
        Ok(())
    } else {
        Err(ProblemResponse::new(
            StatusCode::FORBIDDEN,
            "invalid_token",
            "token mismatch",
        ))
    }
}
