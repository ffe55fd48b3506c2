use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use uuid::Uuid;

use crate::handlers::Actor;
use crate::models::{OrderLine, PaymentMethod};
use crate::routes::AppState;
use crate::ticketing::{OrderRequest, PaymentOutcome};
use crate::utils::error::AppError;
use crate::utils::response::{created, success};

#[derive(Debug, Deserialize)]
pub struct PlaceOrderRequest {
    pub event_id: Uuid,
    pub payment_method: PaymentMethod,
    pub lines: Vec<OrderLine>,
    pub referral_code: Option<String>,
    pub access_token: Option<String>,
}

pub async fn place_order(
    State(state): State<AppState>,
    Actor(buyer_id): Actor,
    Json(body): Json<PlaceOrderRequest>,
) -> Result<Response, AppError> {
    let request = OrderRequest {
        event_id: body.event_id,
        payment_method: body.payment_method,
        lines: body.lines,
        referral_code: body.referral_code,
        access_token: body.access_token,
    };
    let placed = state.boxoffice.place_order(buyer_id, request).await?;
    Ok(created(placed, "Order placed").into_response())
}

/// Header carrying the provider's callback signature.
pub const PAYMENT_SIGNATURE_HEADER: &str = "x-payment-signature";

fn verify_callback(
    state: &AppState,
    headers: &HeaderMap,
    order_id: Uuid,
    outcome: PaymentOutcome,
) -> Result<(), AppError> {
    let signature = headers
        .get(PAYMENT_SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| AppError::AuthError(format!("missing {PAYMENT_SIGNATURE_HEADER} header")))?;
    if !state.callbacks.verify(order_id, outcome, signature) {
        return Err(AppError::AuthError(
            "payment callback signature does not match".to_string(),
        ));
    }
    Ok(())
}

pub async fn payment_confirmed(
    State(state): State<AppState>,
    Path(order_id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    verify_callback(&state, &headers, order_id, PaymentOutcome::Confirmed)?;
    let tickets = state.boxoffice.confirm_payment(order_id).await?;
    Ok(success(tickets, "Payment confirmed").into_response())
}

pub async fn payment_failed(
    State(state): State<AppState>,
    Path(order_id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    verify_callback(&state, &headers, order_id, PaymentOutcome::Failed)?;
    let order = state.boxoffice.fail_payment(order_id).await?;
    Ok(success(order, "Payment failed").into_response())
}
