#![allow(dead_code)]

use chrono::{DateTime, Duration, TimeZone, Utc};
use rust_decimal::Decimal;
use std::sync::Arc;

use boxoffice_server::clock::FixedClock;
use boxoffice_server::models::{Event, OrderLine, PaymentMethod, Ticket, User};
use boxoffice_server::store::MemoryStore;
use boxoffice_server::ticketing::catalog::{AllocationDraft, TicketTypeDraft, TierDraft};
use boxoffice_server::ticketing::{
    Boxoffice, EventDraft, HmacQrCodec, HostedCheckout, LogNotifier, OrderRequest, Services,
    Settings,
};

pub const SECRET: &str = "integration-test-secret";

pub struct TestApp {
    pub boxoffice: Boxoffice,
    pub store: Arc<MemoryStore>,
    pub clock: Arc<FixedClock>,
}

/// Monday 2 March 2026, 10:00 UTC. "Day 0" of every scenario.
pub fn day0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 2, 10, 0, 0).unwrap()
}

pub fn day(n: i64) -> DateTime<Utc> {
    day0() + Duration::days(n)
}

pub fn app() -> TestApp {
    app_with(Settings::default())
}

pub fn app_with(settings: Settings) -> TestApp {
    let store = Arc::new(MemoryStore::new());
    let clock = Arc::new(FixedClock::new(day0()));
    let services = Services {
        clock: clock.clone(),
        codec: Arc::new(HmacQrCodec::new(SECRET).unwrap()),
        payments: Arc::new(HostedCheckout::new("https://pay.test/checkout")),
        notifier: Arc::new(LogNotifier),
    };
    TestApp {
        boxoffice: Boxoffice::new(store.clone(), services, settings),
        store,
        clock,
    }
}

pub fn tier(name: &str, window: Option<(i64, i64)>, allocations: &[(&str, i64, u32)]) -> TierDraft {
    TierDraft {
        id: None,
        name: name.to_string(),
        starts_at: window.map(|(start, _)| day(start)),
        ends_at: window.map(|(_, end)| day(end)),
        is_active: false,
        allocations: allocations
            .iter()
            .map(|(ticket_type, price, quantity)| AllocationDraft {
                ticket_type: ticket_type.to_string(),
                price: Decimal::from(*price),
                quantity: *quantity,
            })
            .collect(),
    }
}

pub fn draft(ticket_types: &[(&str, u32)], tiers: Vec<TierDraft>) -> EventDraft {
    EventDraft {
        title: "Noche de Rock".to_string(),
        description: Some("Three bands, one night".to_string()),
        category: "music".to_string(),
        venue: "Arena".to_string(),
        address: "Calle 5".to_string(),
        city: "Monterrey".to_string(),
        starts_at: day(60),
        is_public: true,
        ticket_types: ticket_types
            .iter()
            .map(|(name, total)| TicketTypeDraft {
                name: name.to_string(),
                total_quantity: *total,
            })
            .collect(),
        tiers,
    }
}

impl TestApp {
    pub async fn user(&self, name: &str) -> User {
        self.boxoffice
            .register_user(name, &format!("{}@example.com", name.to_lowercase()))
            .await
            .unwrap()
    }

    pub async fn event(&self, organizer: &User, draft: EventDraft) -> Event {
        self.boxoffice.create_event(organizer.id, draft).await.unwrap()
    }

    /// One "General" type, one unbounded tier of `quantity` at 100.
    pub async fn simple_event(&self, organizer: &User, quantity: u32) -> Event {
        self.event(
            organizer,
            draft(
                &[("General", quantity)],
                vec![tier("Única", None, &[("General", 100, quantity)])],
            ),
        )
        .await
    }

    pub fn order(event: &Event, method: PaymentMethod, quantity: u32) -> OrderRequest {
        OrderRequest {
            event_id: event.id,
            payment_method: method,
            lines: vec![OrderLine {
                ticket_type_id: event.ticket_types[0].id,
                quantity,
            }],
            referral_code: None,
            access_token: None,
        }
    }

    /// Card purchase, paid immediately.
    pub async fn buy(&self, buyer: &User, event: &Event, quantity: u32) -> Vec<Ticket> {
        let placed = self
            .boxoffice
            .place_order(buyer.id, Self::order(event, PaymentMethod::Card, quantity))
            .await
            .unwrap();
        self.boxoffice.confirm_payment(placed.order.id).await.unwrap()
    }
}
