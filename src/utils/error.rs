use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;
use tracing::{error, info};

use crate::store::StoreError;
use crate::ticketing::TicketingError;
use crate::utils::response::error as error_response;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Authentication error: {0}")]
    AuthError(String),

    #[error(transparent)]
    Ticketing(#[from] TicketingError),
}

impl AppError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::AuthError(_) => StatusCode::UNAUTHORIZED,
            AppError::Ticketing(e) => ticketing_status(e),
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            AppError::AuthError(_) => "AUTH_ERROR",
            AppError::Ticketing(e) => e.reason(),
        }
    }

    fn log(&self) {
        match self {
            AppError::AuthError(msg) => {
                info!(code = self.code(), message = %msg, "Request rejected");
            }
            AppError::Ticketing(e) if e.is_infrastructure() => {
                error!(code = self.code(), error = ?e, "Infrastructure error");
            }
            AppError::Ticketing(e) => {
                info!(code = self.code(), error = %e, "Request refused");
            }
        }
    }
}

fn ticketing_status(err: &TicketingError) -> StatusCode {
    match err {
        TicketingError::OutOfStock { .. }
        | TicketingError::InvalidState { .. }
        | TicketingError::DestructiveEdit(_)
        | TicketingError::AlreadyExists { .. } => StatusCode::CONFLICT,
        TicketingError::NotOwner { .. } | TicketingError::PrivateEvent(_) => StatusCode::FORBIDDEN,
        TicketingError::NotRegistered { .. }
        | TicketingError::MisconfiguredTiers(_)
        | TicketingError::AllocationMismatch { .. }
        | TicketingError::InvalidCatalog(_) => StatusCode::UNPROCESSABLE_ENTITY,
        TicketingError::InvalidCode
        | TicketingError::InvalidSignature
        | TicketingError::InvalidInput(_)
        | TicketingError::SelfTransfer => StatusCode::BAD_REQUEST,
        TicketingError::ExpiredWindow { .. } => StatusCode::GONE,
        TicketingError::NotFound { .. } => StatusCode::NOT_FOUND,
        TicketingError::PaymentProvider(_) => StatusCode::BAD_GATEWAY,
        TicketingError::Store(StoreError::Conflict { .. } | StoreError::Unavailable(_)) => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        TicketingError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let code = self.code();

        self.log();

        // Storage and provider faults never reach the client verbatim.
        let public_message = match &self {
            AppError::AuthError(msg) => msg.clone(),
            AppError::Ticketing(TicketingError::Store(_)) => {
                "A storage error occurred, please retry".to_string()
            }
            AppError::Ticketing(TicketingError::PaymentProvider(_)) => {
                "The payment provider is unavailable".to_string()
            }
            AppError::Ticketing(e) => e.to_string(),
        };

        let details = match &self {
            AppError::Ticketing(TicketingError::OutOfStock {
                ticket_type_id,
                tier_id,
                requested,
                available,
            }) => Some(json!({
                "ticket_type_id": ticket_type_id,
                "tier_id": tier_id,
                "requested": requested,
                "available": available,
            })),
            AppError::Ticketing(TicketingError::ExpiredWindow { window, deadline }) => {
                Some(json!({ "window": window, "deadline": deadline }))
            }
            _ => None,
        };

        error_response(code, public_message, details, status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_domain_errors_map_to_client_statuses() {
        let cases = [
            (
                TicketingError::OutOfStock {
                    ticket_type_id: Uuid::nil(),
                    tier_id: None,
                    requested: 2,
                    available: 0,
                },
                StatusCode::CONFLICT,
            ),
            (TicketingError::InvalidSignature, StatusCode::BAD_REQUEST),
            (
                TicketingError::NotRegistered {
                    email: "x@example.com".to_string(),
                },
                StatusCode::UNPROCESSABLE_ENTITY,
            ),
            (TicketingError::not_found("ticket", Uuid::nil()), StatusCode::NOT_FOUND),
        ];
        for (err, status) in cases {
            let app = AppError::from(err);
            assert_eq!(app.status_code(), status);
        }
    }

    #[test]
    fn test_storage_errors_are_retryable_server_errors() {
        let conflict = AppError::from(TicketingError::from(StoreError::Conflict {
            entity: "ticket",
            id: Uuid::nil(),
        }));
        assert_eq!(conflict.status_code(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(conflict.code(), "STORAGE_ERROR");

        let corrupt = AppError::from(TicketingError::from(StoreError::Corrupt("bad row".into())));
        assert_eq!(corrupt.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
