//! The ticketing engine: pricing, inventory, lifecycle, transfers and the
//! door gate, wired together behind [`Boxoffice`].

pub mod calendar;
pub mod catalog;
pub mod error;
pub mod inventory;
pub mod lifecycle;
pub mod notify;
pub mod orders;
pub mod payment;
pub mod pricing;
pub mod qr;
pub mod transfer;
pub mod validation;

use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::models::user::normalize_email;
use crate::models::{Event, Order, OwnershipRecord, Referral, Ticket, TicketView, User};
use crate::store::{CatalogChange, Store};

pub use catalog::{CatalogEdit, EventDraft};
pub use error::TicketingError;
pub use inventory::{ExpiredInventoryPolicy, InventoryLedger};
pub use lifecycle::TicketLifecycle;
pub use notify::{LogNotifier, Notifier};
pub use orders::{HoldWindows, OrderDesk, OrderRequest, PlacedOrder};
pub use payment::{CallbackSigner, HostedCheckout, PaymentOutcome, PaymentProvider};
pub use pricing::{PriceSheet, PricingTierResolver, TierOverlapPolicy};
pub use qr::{HmacQrCodec, QrCodec};
pub use transfer::TransferProtocol;
pub use validation::{RejectReason, ValidationGate, ValidationOutcome};

#[derive(Debug, Clone, Copy)]
pub struct Settings {
    pub holds: HoldWindows,
    pub validity_business_days: u32,
    pub overlap_policy: TierOverlapPolicy,
    pub expired_inventory: ExpiredInventoryPolicy,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            holds: HoldWindows::default(),
            validity_business_days: 48,
            overlap_policy: TierOverlapPolicy::default(),
            expired_inventory: ExpiredInventoryPolicy::default(),
        }
    }
}

/// External services the engine talks to.
#[derive(Clone)]
pub struct Services {
    pub clock: Arc<dyn Clock>,
    pub codec: Arc<dyn QrCodec>,
    pub payments: Arc<dyn PaymentProvider>,
    pub notifier: Arc<dyn Notifier>,
}

/// Entry point for every ticketing operation.
///
/// Time always comes from the injected clock; no operation takes "now" from
/// its caller.
#[derive(Clone)]
pub struct Boxoffice {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    codec: Arc<dyn QrCodec>,
    resolver: PricingTierResolver,
    ledger: InventoryLedger,
    lifecycle: TicketLifecycle,
    orders: OrderDesk,
    transfers: TransferProtocol,
    gate: ValidationGate,
}

impl Boxoffice {
    pub fn new(store: Arc<dyn Store>, services: Services, settings: Settings) -> Self {
        let resolver = PricingTierResolver::new(settings.overlap_policy);
        let ledger = InventoryLedger::new(store.clone(), settings.expired_inventory);
        let lifecycle = TicketLifecycle::new(
            store.clone(),
            ledger.clone(),
            services.codec.clone(),
            settings.validity_business_days,
        );
        let orders = OrderDesk::new(
            store.clone(),
            ledger.clone(),
            resolver,
            lifecycle.clone(),
            services.payments,
            services.notifier.clone(),
            settings.holds,
        );
        let transfers = TransferProtocol::new(
            store.clone(),
            lifecycle.clone(),
            services.codec.clone(),
            services.notifier,
        );
        let gate = ValidationGate::new(store.clone(), services.codec.clone());
        Self {
            store,
            clock: services.clock,
            codec: services.codec,
            resolver,
            ledger,
            lifecycle,
            orders,
            transfers,
            gate,
        }
    }

    // --- users -------------------------------------------------------------

    pub async fn register_user(&self, name: &str, email: &str) -> Result<User, TicketingError> {
        let email = normalize_email(email);
        if name.trim().is_empty() || !email.contains('@') {
            return Err(TicketingError::InvalidInput(
                "a name and a valid email are required".to_string(),
            ));
        }
        if self.store.user_by_email(&email).await?.is_some() {
            return Err(TicketingError::AlreadyExists {
                entity: "user",
                id: email,
            });
        }
        let now = self.clock.now();
        let user = User {
            id: Uuid::new_v4(),
            name: name.trim().to_string(),
            email,
            personal_code: qr::generate_personal_code(),
            created_at: now,
            updated_at: now,
        };
        self.store.insert_user(&user).await?;
        info!(user_id = %user.id, "User registered");
        Ok(user)
    }

    async fn user(&self, id: Uuid) -> Result<User, TicketingError> {
        self.store
            .user(id)
            .await?
            .ok_or_else(|| TicketingError::not_found("user", id))
    }

    /// The user's personal QR, signed. Others scan it to send them a ticket.
    pub async fn personal_code(&self, user_id: Uuid) -> Result<String, TicketingError> {
        let user = self.user(user_id).await?;
        Ok(self.codec.sign_personal(&user.personal_code))
    }

    // --- catalog -----------------------------------------------------------

    pub async fn create_event(
        &self,
        organizer_id: Uuid,
        draft: EventDraft,
    ) -> Result<Event, TicketingError> {
        self.user(organizer_id).await?;
        let event = catalog::build_event(organizer_id, draft, self.clock.now())?;
        self.store.insert_event(&event).await?;
        info!(
            event_id = %event.id,
            %organizer_id,
            tiers = event.tiers.len(),
            "Event created"
        );
        Ok(event)
    }

    pub async fn event(&self, event_id: Uuid) -> Result<Event, TicketingError> {
        self.store
            .event(event_id)
            .await?
            .ok_or_else(|| TicketingError::not_found("event", event_id))
    }

    pub async fn update_tiers(
        &self,
        actor: Uuid,
        event_id: Uuid,
        edit: CatalogEdit,
    ) -> Result<Event, TicketingError> {
        let event = self.event(event_id).await?;
        if event.organizer_id != actor {
            return Err(TicketingError::NotOwner {
                subject: format!("event {event_id}"),
                actor,
            });
        }
        let usage = self.ledger.usage_for_event(event_id).await?;
        let edited = catalog::apply_edit(&event, &edit, &usage, self.clock.now())?;
        // Sales may have landed since `usage` was read; the store checks again.
        if let CatalogChange::Refused(shortfall) = self.store.replace_catalog(&edited).await? {
            return Err(TicketingError::DestructiveEdit(catalog::describe_shortfall(
                &event, &shortfall,
            )));
        }
        info!(%event_id, tiers = edited.tiers.len(), "Tiers updated");
        Ok(edited)
    }

    /// Current prices and availability, resolved with the server clock.
    pub async fn quote(
        &self,
        event_id: Uuid,
        access_token: Option<&str>,
    ) -> Result<PriceSheet, TicketingError> {
        let event = self.event(event_id).await?;
        if !event.grants_access(access_token) {
            return Err(TicketingError::PrivateEvent(event_id));
        }
        let usage = self.ledger.usage_for_event(event_id).await?;
        self.resolver
            .quote(&event, self.clock.now(), &usage, self.ledger.policy())
    }

    // --- orders ------------------------------------------------------------

    pub async fn place_order(
        &self,
        buyer_id: Uuid,
        request: OrderRequest,
    ) -> Result<PlacedOrder, TicketingError> {
        self.orders
            .place_order(buyer_id, request, self.clock.now())
            .await
    }

    pub async fn confirm_payment(&self, order_id: Uuid) -> Result<Vec<Ticket>, TicketingError> {
        self.orders.confirm_payment(order_id, self.clock.now()).await
    }

    pub async fn fail_payment(&self, order_id: Uuid) -> Result<Order, TicketingError> {
        self.orders.fail_payment(order_id, self.clock.now()).await
    }

    pub async fn sweep_expired(&self) -> Result<usize, TicketingError> {
        self.orders.sweep_expired(self.clock.now()).await
    }

    // --- tickets -----------------------------------------------------------

    /// Tickets the user holds, with expirations applied, followed by the
    /// ones they transferred away.
    pub async fn tickets_for(&self, user_id: Uuid) -> Result<Vec<TicketView>, TicketingError> {
        let now = self.clock.now();
        let owned = self.store.tickets_owned_by(user_id).await?;
        let owned = self.lifecycle.refresh_all(owned, now).await?;
        let given = self.store.tickets_transferred_from(user_id).await?;

        Ok(owned
            .iter()
            .map(TicketView::owned)
            .chain(given.iter().map(TicketView::transferred_out))
            .collect())
    }

    pub async fn ticket(&self, actor: Uuid, ticket_id: Uuid) -> Result<Ticket, TicketingError> {
        let ticket = self.lifecycle.load(ticket_id, self.clock.now()).await?;
        if ticket.owner_id != actor {
            return Err(TicketingError::NotOwner {
                subject: format!("ticket {ticket_id}"),
                actor,
            });
        }
        Ok(ticket)
    }

    /// Ownership audit trail, oldest first. Only the current owner may read it.
    pub async fn ownership_history(
        &self,
        actor: Uuid,
        ticket_id: Uuid,
    ) -> Result<Vec<OwnershipRecord>, TicketingError> {
        self.ticket(actor, ticket_id).await?;
        let mut history = self.store.ownership_history(ticket_id).await?;
        history.sort_by_key(|r| r.transferred_at);
        Ok(history)
    }

    pub async fn transfer_by_email(
        &self,
        actor: Uuid,
        ticket_id: Uuid,
        recipient_email: &str,
    ) -> Result<Ticket, TicketingError> {
        self.transfers
            .transfer_by_email(ticket_id, actor, recipient_email, self.clock.now())
            .await
    }

    pub async fn transfer_by_personal_code(
        &self,
        actor: Uuid,
        ticket_id: Uuid,
        personal_qr: &str,
    ) -> Result<Ticket, TicketingError> {
        self.transfers
            .transfer_by_personal_code(ticket_id, actor, personal_qr, self.clock.now())
            .await
    }

    pub async fn validate(
        &self,
        qr_payload: &str,
        validator: &str,
    ) -> Result<ValidationOutcome, TicketingError> {
        self.gate
            .validate(qr_payload, validator, self.clock.now())
            .await
    }

    // --- referrals ---------------------------------------------------------

    pub async fn create_referral(
        &self,
        vendor_id: Uuid,
        event_id: Uuid,
        code: Option<String>,
    ) -> Result<Referral, TicketingError> {
        self.user(vendor_id).await?;
        self.event(event_id).await?;
        let code = match code.map(|c| c.trim().to_string()) {
            Some(c) if c.is_empty() => {
                return Err(TicketingError::InvalidInput("referral code is empty".to_string()))
            }
            Some(c) => c,
            None => Uuid::new_v4().simple().to_string()[..8].to_uppercase(),
        };
        if self.store.referral_by_code(&code).await?.is_some() {
            return Err(TicketingError::AlreadyExists {
                entity: "referral",
                id: code,
            });
        }
        let referral = Referral {
            id: Uuid::new_v4(),
            vendor_id,
            event_id,
            code,
            clicks: 0,
            conversions: 0,
            created_at: self.clock.now(),
        };
        self.store.insert_referral(&referral).await?;
        info!(code = %referral.code, %event_id, %vendor_id, "Referral created");
        Ok(referral)
    }

    pub async fn record_click(&self, code: &str) -> Result<(), TicketingError> {
        if self.store.record_referral_click(code.trim()).await? {
            Ok(())
        } else {
            warn!(code, "Click for unknown referral code");
            Err(TicketingError::not_found("referral", code))
        }
    }

    pub async fn referral(&self, code: &str) -> Result<Referral, TicketingError> {
        self.store
            .referral_by_code(code.trim())
            .await?
            .ok_or_else(|| TicketingError::not_found("referral", code))
    }
}

#[cfg(test)]
pub(crate) mod fixture {
    use super::*;
    use crate::clock::FixedClock;
    use crate::store::MemoryStore;
    use crate::ticketing::notify::recording::RecordingNotifier;
    use chrono::{DateTime, Utc};

    pub struct Harness {
        pub boxoffice: Boxoffice,
        pub store: Arc<MemoryStore>,
        pub clock: Arc<FixedClock>,
        pub notifier: Arc<RecordingNotifier>,
    }

    pub fn harness(start: DateTime<Utc>, settings: Settings) -> Harness {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(FixedClock::new(start));
        let notifier = Arc::new(RecordingNotifier::default());
        let services = Services {
            clock: clock.clone(),
            codec: Arc::new(HmacQrCodec::new("unit-test-secret").expect("valid key")),
            payments: Arc::new(HostedCheckout::new("https://pay.test/checkout")),
            notifier: notifier.clone(),
        };
        Harness {
            boxoffice: Boxoffice::new(store.clone(), services, settings),
            store,
            clock,
            notifier,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fixture::harness;
    use super::*;
    use crate::models::{OrderLine, PaymentMethod};
    use crate::store::testing::seed_event;
    use chrono::{TimeZone, Utc};

    fn start() -> chrono::DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 10, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn test_register_user_rejects_duplicate_email() {
        let h = harness(start(), Settings::default());
        let ana = h.boxoffice.register_user("Ana", " Ana@Example.com ").await.unwrap();
        assert_eq!(ana.email, "ana@example.com");

        let err = h
            .boxoffice
            .register_user("Other Ana", "ANA@example.com")
            .await
            .unwrap_err();
        assert_eq!(err.reason(), "ALREADY_EXISTS");
        assert!(matches!(
            h.boxoffice.register_user("", "x@example.com").await,
            Err(TicketingError::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn test_referral_counts_clicks_and_conversions() {
        let h = harness(start(), Settings::default());
        let vendor = h.boxoffice.register_user("Vendor", "vendor@example.com").await.unwrap();
        let buyer = h.boxoffice.register_user("Buyer", "buyer@example.com").await.unwrap();
        let event = seed_event(&h.store, start(), 10).await;

        let referral = h
            .boxoffice
            .create_referral(vendor.id, event.id, Some("PROMO".to_string()))
            .await
            .unwrap();
        h.boxoffice.record_click("PROMO").await.unwrap();
        h.boxoffice.record_click("PROMO").await.unwrap();
        assert!(h.boxoffice.record_click("NOPE").await.is_err());

        let placed = h
            .boxoffice
            .place_order(
                buyer.id,
                OrderRequest {
                    event_id: event.id,
                    payment_method: PaymentMethod::Card,
                    lines: vec![OrderLine {
                        ticket_type_id: event.ticket_types[0].id,
                        quantity: 1,
                    }],
                    referral_code: Some(referral.code.clone()),
                    access_token: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(placed.order.referral_code.as_deref(), Some("PROMO"));
        h.boxoffice.confirm_payment(placed.order.id).await.unwrap();

        let referral = h.boxoffice.referral("PROMO").await.unwrap();
        assert_eq!((referral.clicks, referral.conversions), (2, 1));

        assert!(matches!(
            h.boxoffice
                .create_referral(vendor.id, event.id, Some("PROMO".to_string()))
                .await,
            Err(TicketingError::AlreadyExists { .. })
        ));
    }

    #[tokio::test]
    async fn test_unknown_referral_code_is_dropped() {
        let h = harness(start(), Settings::default());
        let buyer = h.boxoffice.register_user("Buyer", "buyer@example.com").await.unwrap();
        let event = seed_event(&h.store, start(), 10).await;

        let placed = h
            .boxoffice
            .place_order(
                buyer.id,
                OrderRequest {
                    event_id: event.id,
                    payment_method: PaymentMethod::Card,
                    lines: vec![OrderLine {
                        ticket_type_id: event.ticket_types[0].id,
                        quantity: 2,
                    }],
                    referral_code: Some("GHOST".to_string()),
                    access_token: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(placed.order.referral_code, None);
        assert_eq!(placed.order.total_amount, rust_decimal::Decimal::from(200));
    }

    #[tokio::test]
    async fn test_issue_and_transfer_are_notified() {
        let h = harness(start(), Settings::default());
        let ana = h.boxoffice.register_user("Ana", "ana@example.com").await.unwrap();
        let beto = h.boxoffice.register_user("Beto", "beto@example.com").await.unwrap();
        let event = seed_event(&h.store, start(), 10).await;

        let placed = h
            .boxoffice
            .place_order(
                ana.id,
                OrderRequest {
                    event_id: event.id,
                    payment_method: PaymentMethod::Card,
                    lines: vec![OrderLine {
                        ticket_type_id: event.ticket_types[0].id,
                        quantity: 2,
                    }],
                    referral_code: None,
                    access_token: None,
                },
            )
            .await
            .unwrap();
        let tickets = h.boxoffice.confirm_payment(placed.order.id).await.unwrap();
        assert_eq!(h.notifier.issued.lock().unwrap().len(), 2);

        h.boxoffice
            .transfer_by_email(ana.id, tickets[0].id, "beto@example.com")
            .await
            .unwrap();
        assert_eq!(
            *h.notifier.transferred.lock().unwrap(),
            vec![(tickets[0].id, ana.id, beto.id)]
        );

        // A refused transfer sends nothing.
        assert!(h
            .boxoffice
            .transfer_by_email(ana.id, tickets[0].id, "beto@example.com")
            .await
            .is_err());
        assert_eq!(h.notifier.transferred.lock().unwrap().len(), 1);
    }
}
