use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::handlers::Actor;
use crate::routes::AppState;
use crate::utils::error::AppError;
use crate::utils::response::{created, success};

#[derive(Debug, Deserialize)]
pub struct RegisterUserRequest {
    pub name: String,
    pub email: String,
}

#[derive(Serialize)]
struct PersonalCodePayload {
    personal_qr: String,
}

pub async fn register_user(
    State(state): State<AppState>,
    Json(body): Json<RegisterUserRequest>,
) -> Result<Response, AppError> {
    let user = state.boxoffice.register_user(&body.name, &body.email).await?;
    Ok(created(user, "User registered").into_response())
}

pub async fn personal_code(
    State(state): State<AppState>,
    Actor(user_id): Actor,
) -> Result<Response, AppError> {
    let personal_qr = state.boxoffice.personal_code(user_id).await?;
    Ok(success(PersonalCodePayload { personal_qr }, "Personal code").into_response())
}
