use axum::routing::{get, post, put};
use axum::Router;
use tower_http::trace::TraceLayer;

use crate::config::{create_cors_layer, create_security_headers_layer, HttpSettings};
use crate::handlers::{events, health_check, orders, referrals, tickets, users};
use crate::ticketing::{Boxoffice, CallbackSigner};

#[derive(Clone)]
pub struct AppState {
    pub boxoffice: Boxoffice,
    /// Verifies payment provider callbacks.
    pub callbacks: CallbackSigner,
}

pub fn create_routes(state: AppState, http: &HttpSettings) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/users", post(users::register_user))
        .route("/me/personal-code", get(users::personal_code))
        .route("/me/tickets", get(tickets::my_tickets))
        .route("/events", post(events::create_event))
        .route("/events/:id/tiers", put(events::update_tiers))
        .route("/events/:id/pricing", get(events::pricing))
        .route("/events/:id/referrals", post(referrals::create_referral))
        .route("/orders", post(orders::place_order))
        .route("/payments/:order_id/confirmed", post(orders::payment_confirmed))
        .route("/payments/:order_id/failed", post(orders::payment_failed))
        .route("/tickets/:id/history", get(tickets::ownership_history))
        .route("/tickets/:id/transfer", post(tickets::transfer_by_email))
        .route(
            "/tickets/:id/transfer/personal-code",
            post(tickets::transfer_by_personal_code),
        )
        .route("/validate", post(tickets::validate))
        .route("/referrals/:code/click", post(referrals::record_click))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(create_security_headers_layer(http.production))
        .layer(create_cors_layer(http.cors_allowed_origins.as_deref()))
}
