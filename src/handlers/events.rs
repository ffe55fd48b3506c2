use axum::extract::{Path, Query, State};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::handlers::Actor;
use crate::models::Event;
use crate::routes::AppState;
use crate::ticketing::{CatalogEdit, EventDraft};
use crate::utils::error::AppError;
use crate::utils::response::{created, success};

#[derive(Debug, Deserialize)]
pub struct PricingQuery {
    pub access_token: Option<String>,
}

/// What the organizer gets back: the event plus the private-event token,
/// which is otherwise never serialized.
#[derive(Serialize)]
struct OrganizerEvent {
    #[serde(flatten)]
    event: Event,
    access_token: Option<String>,
}

impl From<Event> for OrganizerEvent {
    fn from(event: Event) -> Self {
        let access_token = event.access_token.clone();
        Self {
            event,
            access_token,
        }
    }
}

pub async fn create_event(
    State(state): State<AppState>,
    Actor(organizer_id): Actor,
    Json(draft): Json<EventDraft>,
) -> Result<Response, AppError> {
    let event = state.boxoffice.create_event(organizer_id, draft).await?;
    Ok(created(OrganizerEvent::from(event), "Event created").into_response())
}

pub async fn update_tiers(
    State(state): State<AppState>,
    Actor(actor): Actor,
    Path(event_id): Path<Uuid>,
    Json(edit): Json<CatalogEdit>,
) -> Result<Response, AppError> {
    let event = state.boxoffice.update_tiers(actor, event_id, edit).await?;
    Ok(success(OrganizerEvent::from(event), "Tiers updated").into_response())
}

pub async fn pricing(
    State(state): State<AppState>,
    Path(event_id): Path<Uuid>,
    Query(query): Query<PricingQuery>,
) -> Result<Response, AppError> {
    let sheet = state
        .boxoffice
        .quote(event_id, query.access_token.as_deref())
        .await?;
    Ok(success(sheet, "Current pricing").into_response())
}
