//! Persistence seam for the ticketing engine.
//!
//! Each method is a single atomic unit: an implementation must never let a
//! concurrent caller observe half of it. Ledger counters and ticket versions
//! are only ever changed through these primitives.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::models::{
    Event, Order, OwnershipRecord, PaymentStatus, Referral, Reservation, Ticket, User,
};
use crate::ticketing::inventory::{AllocationUsage, Shortfall};

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

#[derive(Debug, Error)]
pub enum StoreError {
    /// Compare-and-swap lost against a concurrent writer.
    #[error("{entity} {id} was modified concurrently")]
    Conflict { entity: &'static str, id: Uuid },

    #[error("{entity} {id} already exists")]
    Duplicate { entity: &'static str, id: String },

    #[error("corrupt record: {0}")]
    Corrupt(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("Database error")]
    Database(#[from] sqlx::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HoldOutcome {
    Held,
    Insufficient { available: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CatalogChange {
    Replaced,
    /// Nothing was written: the new catalog no longer covers what is sold or held.
    Refused(Shortfall),
}

/// Everything a confirmed payment writes, applied by
/// [`Store::complete_order`] as one unit.
#[derive(Debug, Clone, Copy)]
pub struct Completion<'a> {
    pub order_id: Uuid,
    /// Card orders: tickets minted at confirmation.
    pub minted: &'a [Ticket],
    /// Offline orders: pending tickets moved to `ACTIVE`, each paired with
    /// the version it was read at.
    pub activated: &'a [(Ticket, i64)],
    pub now: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionOutcome {
    Completed,
    /// The order had already left `PENDING`; nothing was written.
    AlreadySettled(PaymentStatus),
    Lapsed {
        reservation_id: Uuid,
        expired_at: DateTime<Utc>,
    },
    Released { reservation_id: Uuid },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    Failed,
    AlreadySettled(PaymentStatus),
}

#[async_trait]
pub trait Store: Send + Sync {
    // catalog
    async fn insert_event(&self, event: &Event) -> Result<(), StoreError>;
    /// Replaces ticket types, tiers and allocations. Counters of surviving
    /// allocations are kept. Refused, without writing, if an allocation
    /// with holds or sales would be removed or shrunk below them.
    async fn replace_catalog(&self, event: &Event) -> Result<CatalogChange, StoreError>;
    async fn event(&self, id: Uuid) -> Result<Option<Event>, StoreError>;

    // users
    async fn insert_user(&self, user: &User) -> Result<(), StoreError>;
    async fn user(&self, id: Uuid) -> Result<Option<User>, StoreError>;
    async fn user_by_email(&self, email: &str) -> Result<Option<User>, StoreError>;
    async fn user_by_personal_code(&self, code: &str) -> Result<Option<User>, StoreError>;

    // ledger
    async fn allocation_usage(
        &self,
        ticket_type_id: Uuid,
        tier_id: Uuid,
    ) -> Result<Option<AllocationUsage>, StoreError>;
    async fn usage_for_event(&self, event_id: Uuid) -> Result<Vec<AllocationUsage>, StoreError>;
    /// Records the reservation iff enough units remain.
    async fn try_hold(
        &self,
        reservation: &Reservation,
        resell_returned: bool,
    ) -> Result<HoldOutcome, StoreError>;
    /// `true` if the reservation was held and is now released.
    async fn release_hold(&self, reservation_id: Uuid) -> Result<bool, StoreError>;
    async fn lapsed_holds(&self, now: DateTime<Utc>) -> Result<Vec<Reservation>, StoreError>;
    async fn reservation(&self, id: Uuid) -> Result<Option<Reservation>, StoreError>;
    async fn return_slot(&self, ticket_type_id: Uuid, tier_id: Uuid) -> Result<(), StoreError>;

    // orders
    /// Stores the order together with any tickets minted at placement.
    async fn insert_order(&self, order: &Order, tickets: &[Ticket]) -> Result<(), StoreError>;
    async fn order(&self, id: Uuid) -> Result<Option<Order>, StoreError>;
    /// Settles a `PENDING` order as paid: commits its holds, marks it
    /// `COMPLETED`, writes its tickets and counts the referral conversion.
    /// Either all of it happens or none of it.
    async fn complete_order(
        &self,
        completion: &Completion<'_>,
    ) -> Result<CompletionOutcome, StoreError>;
    /// Settles a `PENDING` order as unpaid: marks it `FAILED`, releases its
    /// holds and expires its `PENDING_PAYMENT` tickets, as one unit.
    async fn fail_order(&self, order_id: Uuid, now: DateTime<Utc>)
        -> Result<FailOutcome, StoreError>;

    // tickets
    async fn ticket(&self, id: Uuid) -> Result<Option<Ticket>, StoreError>;
    async fn tickets_for_order(&self, order_id: Uuid) -> Result<Vec<Ticket>, StoreError>;
    async fn tickets_owned_by(&self, user_id: Uuid) -> Result<Vec<Ticket>, StoreError>;
    /// Stores `ticket` with `version = expected_version + 1`, or `Conflict`.
    async fn update_ticket(&self, ticket: &Ticket, expected_version: i64)
        -> Result<Ticket, StoreError>;
    /// `update_ticket` plus the audit record, atomically.
    async fn transfer_ticket(
        &self,
        ticket: &Ticket,
        expected_version: i64,
        record: &OwnershipRecord,
    ) -> Result<Ticket, StoreError>;
    async fn ownership_history(&self, ticket_id: Uuid) -> Result<Vec<OwnershipRecord>, StoreError>;
    async fn tickets_transferred_from(&self, user_id: Uuid) -> Result<Vec<Ticket>, StoreError>;

    // referrals
    async fn insert_referral(&self, referral: &Referral) -> Result<(), StoreError>;
    async fn referral_by_code(&self, code: &str) -> Result<Option<Referral>, StoreError>;
    async fn record_referral_click(&self, code: &str) -> Result<bool, StoreError>;
    async fn record_referral_conversion(&self, code: &str) -> Result<bool, StoreError>;
}

#[cfg(test)]
pub(crate) mod testing {
    use chrono::{DateTime, Utc};
    use rust_decimal::Decimal;
    use uuid::Uuid;

    use super::{MemoryStore, Store};
    use crate::models::{Event, TicketType, Tier, TierAllocation};

    /// [`event_with_quantity`], stored.
    pub async fn seed_event(store: &MemoryStore, now: DateTime<Utc>, quantity: u32) -> Event {
        let event = event_with_quantity(now, quantity);
        store
            .insert_event(&event)
            .await
            .expect("seed event should insert");
        event
    }

    /// One public event, one "General" type, one unbounded tier of `quantity` at 100.
    pub fn event_with_quantity(now: DateTime<Utc>, quantity: u32) -> Event {
        let event_id = Uuid::new_v4();
        let ticket_type_id = Uuid::new_v4();
        let tier_id = Uuid::new_v4();
        Event {
            id: event_id,
            organizer_id: Uuid::new_v4(),
            title: "Seeded".to_string(),
            description: None,
            category: "music".to_string(),
            venue: "Hall".to_string(),
            address: "Street 1".to_string(),
            city: "Monterrey".to_string(),
            starts_at: now + chrono::Duration::days(30),
            is_public: true,
            access_token: None,
            ticket_types: vec![TicketType {
                id: ticket_type_id,
                event_id,
                name: "General".to_string(),
                total_quantity: quantity,
            }],
            tiers: vec![Tier {
                id: tier_id,
                event_id,
                name: "Única".to_string(),
                starts_at: None,
                ends_at: None,
                is_active: true,
                allocations: vec![TierAllocation {
                    tier_id,
                    ticket_type_id,
                    price: Decimal::from(100),
                    quantity,
                }],
                created_at: now,
            }],
            created_at: now,
            updated_at: now,
        }
    }
}
