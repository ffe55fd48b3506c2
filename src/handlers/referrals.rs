use axum::extract::{Path, State};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use uuid::Uuid;

use crate::handlers::Actor;
use crate::routes::AppState;
use crate::utils::error::AppError;
use crate::utils::response::{created, empty_success};

#[derive(Debug, Default, Deserialize)]
pub struct CreateReferralRequest {
    pub code: Option<String>,
}

pub async fn create_referral(
    State(state): State<AppState>,
    Actor(vendor_id): Actor,
    Path(event_id): Path<Uuid>,
    Json(body): Json<CreateReferralRequest>,
) -> Result<Response, AppError> {
    let referral = state
        .boxoffice
        .create_referral(vendor_id, event_id, body.code)
        .await?;
    Ok(created(referral, "Referral created").into_response())
}

pub async fn record_click(
    State(state): State<AppState>,
    Path(code): Path<String>,
) -> Result<Response, AppError> {
    state.boxoffice.record_click(&code).await?;
    Ok(empty_success("Click recorded").into_response())
}
