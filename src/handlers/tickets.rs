use axum::extract::{Path, State};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use uuid::Uuid;

use crate::handlers::Actor;
use crate::models::TicketView;
use crate::routes::AppState;
use crate::utils::error::AppError;
use crate::utils::response::success;

#[derive(Debug, Deserialize)]
pub struct EmailTransferRequest {
    pub recipient_email: String,
}

#[derive(Debug, Deserialize)]
pub struct PersonalCodeTransferRequest {
    pub personal_qr: String,
}

#[derive(Debug, Deserialize)]
pub struct ValidateRequest {
    pub qr_payload: String,
}

pub async fn my_tickets(
    State(state): State<AppState>,
    Actor(user_id): Actor,
) -> Result<Response, AppError> {
    let tickets = state.boxoffice.tickets_for(user_id).await?;
    Ok(success(tickets, "Tickets").into_response())
}

pub async fn ownership_history(
    State(state): State<AppState>,
    Actor(actor): Actor,
    Path(ticket_id): Path<Uuid>,
) -> Result<Response, AppError> {
    let history = state.boxoffice.ownership_history(actor, ticket_id).await?;
    Ok(success(history, "Ownership history").into_response())
}

pub async fn transfer_by_email(
    State(state): State<AppState>,
    Actor(actor): Actor,
    Path(ticket_id): Path<Uuid>,
    Json(body): Json<EmailTransferRequest>,
) -> Result<Response, AppError> {
    let ticket = state
        .boxoffice
        .transfer_by_email(actor, ticket_id, &body.recipient_email)
        .await?;
    Ok(success(TicketView::transferred_out(&ticket), "Ticket transferred").into_response())
}

pub async fn transfer_by_personal_code(
    State(state): State<AppState>,
    Actor(actor): Actor,
    Path(ticket_id): Path<Uuid>,
    Json(body): Json<PersonalCodeTransferRequest>,
) -> Result<Response, AppError> {
    let ticket = state
        .boxoffice
        .transfer_by_personal_code(actor, ticket_id, &body.personal_qr)
        .await?;
    Ok(success(TicketView::transferred_out(&ticket), "Ticket transferred").into_response())
}

/// Door scan. Rejections are a normal outcome here, not an HTTP error.
pub async fn validate(
    State(state): State<AppState>,
    Actor(validator): Actor,
    Json(body): Json<ValidateRequest>,
) -> Result<Response, AppError> {
    let outcome = state
        .boxoffice
        .validate(&body.qr_payload, &validator.to_string())
        .await?;
    let message = if outcome.valid {
        "Ticket accepted"
    } else {
        "Ticket rejected"
    };
    Ok(success(outcome, message).into_response())
}
