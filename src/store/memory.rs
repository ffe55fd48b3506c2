//! In-process store. One mutex guards everything, so every trait method is
//! trivially atomic. Used by the test suite and when no database is configured.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

use super::{
    CatalogChange, Completion, CompletionOutcome, FailOutcome, HoldOutcome, Store, StoreError,
};
use crate::models::user::normalize_email;
use crate::models::{
    Event, Order, OwnershipRecord, PaymentStatus, Referral, Reservation, ReservationState,
    Ticket, TicketStatus, User,
};
use crate::ticketing::inventory::{find_shortfall, AllocationUsage, ExpiredInventoryPolicy};

#[derive(Default)]
struct Inner {
    events: HashMap<Uuid, Event>,
    /// Keyed by `(ticket type, tier)`.
    usage: HashMap<(Uuid, Uuid), AllocationUsage>,
    users: HashMap<Uuid, User>,
    reservations: HashMap<Uuid, Reservation>,
    orders: HashMap<Uuid, Order>,
    tickets: HashMap<Uuid, Ticket>,
    ownership: Vec<OwnershipRecord>,
    referrals: HashMap<String, Referral>,
}

impl Inner {
    fn sync_usage(&mut self, event: &Event) {
        let tier_ids: Vec<Uuid> = event.tiers.iter().map(|t| t.id).collect();
        let mut live = Vec::new();
        for tier in &event.tiers {
            for allocation in &tier.allocations {
                let key = (allocation.ticket_type_id, tier.id);
                live.push(key);
                self.usage
                    .entry(key)
                    .and_modify(|u| u.quantity = allocation.quantity)
                    .or_insert_with(|| {
                        AllocationUsage::empty(allocation.ticket_type_id, tier.id, allocation.quantity)
                    });
            }
        }
        let event_types: Vec<Uuid> = event.ticket_types.iter().map(|t| t.id).collect();
        self.usage.retain(|key, _| {
            let belongs = tier_ids.contains(&key.1) || event_types.contains(&key.0);
            !belongs || live.contains(key)
        });
    }

    /// Moves a held reservation to `state`, taking it off the held counter.
    /// `false` if it was not held.
    fn settle_hold(&mut self, reservation_id: Uuid, state: ReservationState) -> bool {
        let Some(reservation) = self.reservations.get_mut(&reservation_id) else {
            return false;
        };
        if reservation.state != ReservationState::Held {
            return false;
        }
        reservation.state = state;
        let (key, quantity) = (
            (reservation.ticket_type_id, reservation.tier_id),
            reservation.quantity,
        );
        if let Some(usage) = self.usage.get_mut(&key) {
            usage.held = usage.held.saturating_sub(quantity);
            if state == ReservationState::Committed {
                usage.sold += quantity;
            }
        }
        true
    }

    fn pending_order(&self, order_id: Uuid) -> Result<Result<&Order, PaymentStatus>, StoreError> {
        let order = self
            .orders
            .get(&order_id)
            .ok_or_else(|| StoreError::Corrupt(format!("order {order_id} does not exist")))?;
        Ok(match order.payment_status {
            PaymentStatus::Pending => Ok(order),
            settled => Err(settled),
        })
    }

    fn update_ticket(&mut self, ticket: &Ticket, expected_version: i64) -> Result<Ticket, StoreError> {
        let current = self
            .tickets
            .get_mut(&ticket.id)
            .ok_or_else(|| StoreError::Corrupt(format!("ticket {} does not exist", ticket.id)))?;
        if current.version != expected_version {
            return Err(StoreError::Conflict {
                entity: "ticket",
                id: ticket.id,
            });
        }
        let mut stored = ticket.clone();
        stored.version = expected_version + 1;
        *current = stored.clone();
        Ok(stored)
    }
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn insert_event(&self, event: &Event) -> Result<(), StoreError> {
        let mut inner = self.lock();
        if inner.events.contains_key(&event.id) {
            return Err(StoreError::Duplicate {
                entity: "event",
                id: event.id.to_string(),
            });
        }
        inner.sync_usage(event);
        inner.events.insert(event.id, event.clone());
        Ok(())
    }

    async fn replace_catalog(&self, event: &Event) -> Result<CatalogChange, StoreError> {
        let mut inner = self.lock();
        let current = inner
            .events
            .get(&event.id)
            .ok_or_else(|| StoreError::Corrupt(format!("event {} does not exist", event.id)))?;
        let usage = current.tiers.iter().flat_map(|tier| {
            tier.allocations
                .iter()
                .filter_map(|a| inner.usage.get(&(a.ticket_type_id, tier.id)))
        });
        if let Some(shortfall) = find_shortfall(usage, event) {
            return Ok(CatalogChange::Refused(shortfall));
        }
        inner.sync_usage(event);
        inner.events.insert(event.id, event.clone());
        Ok(CatalogChange::Replaced)
    }

    async fn event(&self, id: Uuid) -> Result<Option<Event>, StoreError> {
        Ok(self.lock().events.get(&id).cloned())
    }

    async fn insert_user(&self, user: &User) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let email = normalize_email(&user.email);
        if inner
            .users
            .values()
            .any(|u| u.id == user.id || normalize_email(&u.email) == email)
        {
            return Err(StoreError::Duplicate {
                entity: "user",
                id: email,
            });
        }
        inner.users.insert(user.id, user.clone());
        Ok(())
    }

    async fn user(&self, id: Uuid) -> Result<Option<User>, StoreError> {
        Ok(self.lock().users.get(&id).cloned())
    }

    async fn user_by_email(&self, email: &str) -> Result<Option<User>, StoreError> {
        let email = normalize_email(email);
        Ok(self
            .lock()
            .users
            .values()
            .find(|u| normalize_email(&u.email) == email)
            .cloned())
    }

    async fn user_by_personal_code(&self, code: &str) -> Result<Option<User>, StoreError> {
        Ok(self
            .lock()
            .users
            .values()
            .find(|u| u.personal_code == code)
            .cloned())
    }

    async fn allocation_usage(
        &self,
        ticket_type_id: Uuid,
        tier_id: Uuid,
    ) -> Result<Option<AllocationUsage>, StoreError> {
        Ok(self.lock().usage.get(&(ticket_type_id, tier_id)).copied())
    }

    async fn usage_for_event(&self, event_id: Uuid) -> Result<Vec<AllocationUsage>, StoreError> {
        let inner = self.lock();
        let Some(event) = inner.events.get(&event_id) else {
            return Ok(Vec::new());
        };
        Ok(event
            .tiers
            .iter()
            .flat_map(|tier| {
                tier.allocations
                    .iter()
                    .filter_map(|a| inner.usage.get(&(a.ticket_type_id, tier.id)).copied())
            })
            .collect())
    }

    async fn try_hold(
        &self,
        reservation: &Reservation,
        resell_returned: bool,
    ) -> Result<HoldOutcome, StoreError> {
        let mut inner = self.lock();
        let policy = if resell_returned {
            ExpiredInventoryPolicy::Resell
        } else {
            ExpiredInventoryPolicy::Retire
        };
        let Some(usage) = inner
            .usage
            .get_mut(&(reservation.ticket_type_id, reservation.tier_id))
        else {
            return Ok(HoldOutcome::Insufficient { available: 0 });
        };
        let available = usage.available(policy);
        if available < reservation.quantity {
            return Ok(HoldOutcome::Insufficient { available });
        }
        usage.held += reservation.quantity;
        inner.reservations.insert(reservation.id, reservation.clone());
        Ok(HoldOutcome::Held)
    }

    async fn release_hold(&self, reservation_id: Uuid) -> Result<bool, StoreError> {
        Ok(self
            .lock()
            .settle_hold(reservation_id, ReservationState::Released))
    }

    async fn lapsed_holds(&self, now: DateTime<Utc>) -> Result<Vec<Reservation>, StoreError> {
        Ok(self
            .lock()
            .reservations
            .values()
            .filter(|r| r.has_lapsed(now))
            .cloned()
            .collect())
    }

    async fn reservation(&self, id: Uuid) -> Result<Option<Reservation>, StoreError> {
        Ok(self.lock().reservations.get(&id).cloned())
    }

    async fn return_slot(&self, ticket_type_id: Uuid, tier_id: Uuid) -> Result<(), StoreError> {
        let mut inner = self.lock();
        if let Some(usage) = inner.usage.get_mut(&(ticket_type_id, tier_id)) {
            if usage.returned < usage.sold {
                usage.returned += 1;
            }
        }
        Ok(())
    }

    async fn insert_order(&self, order: &Order, tickets: &[Ticket]) -> Result<(), StoreError> {
        let mut inner = self.lock();
        if inner.orders.contains_key(&order.id) {
            return Err(StoreError::Duplicate {
                entity: "order",
                id: order.id.to_string(),
            });
        }
        if let Some(dup) = tickets.iter().find(|t| inner.tickets.contains_key(&t.id)) {
            return Err(StoreError::Duplicate {
                entity: "ticket",
                id: dup.id.to_string(),
            });
        }
        inner.orders.insert(order.id, order.clone());
        for ticket in tickets {
            inner.tickets.insert(ticket.id, ticket.clone());
        }
        Ok(())
    }

    async fn order(&self, id: Uuid) -> Result<Option<Order>, StoreError> {
        Ok(self.lock().orders.get(&id).cloned())
    }

    async fn complete_order(
        &self,
        completion: &Completion<'_>,
    ) -> Result<CompletionOutcome, StoreError> {
        let mut inner = self.lock();
        let order = match inner.pending_order(completion.order_id)? {
            Ok(order) => order.clone(),
            Err(settled) => return Ok(CompletionOutcome::AlreadySettled(settled)),
        };

        // Check everything before the first write.
        for line in &order.lines {
            let reservation = inner.reservations.get(&line.reservation_id).ok_or_else(|| {
                StoreError::Corrupt(format!("reservation {} does not exist", line.reservation_id))
            })?;
            match reservation.state {
                ReservationState::Committed => {}
                ReservationState::Released => {
                    return Ok(CompletionOutcome::Released {
                        reservation_id: reservation.id,
                    })
                }
                ReservationState::Held if reservation.has_lapsed(completion.now) => {
                    return Ok(CompletionOutcome::Lapsed {
                        reservation_id: reservation.id,
                        expired_at: reservation.expires_at,
                    })
                }
                ReservationState::Held => {}
            }
        }
        for (ticket, version) in completion.activated {
            match inner.tickets.get(&ticket.id) {
                Some(current) if current.version == *version => {}
                Some(_) => {
                    return Err(StoreError::Conflict {
                        entity: "ticket",
                        id: ticket.id,
                    })
                }
                None => {
                    return Err(StoreError::Corrupt(format!("ticket {} does not exist", ticket.id)))
                }
            }
        }
        if let Some(dup) = completion
            .minted
            .iter()
            .find(|t| inner.tickets.contains_key(&t.id))
        {
            return Err(StoreError::Duplicate {
                entity: "ticket",
                id: dup.id.to_string(),
            });
        }

        for line in &order.lines {
            inner.settle_hold(line.reservation_id, ReservationState::Committed);
        }
        if let Some(stored) = inner.orders.get_mut(&order.id) {
            stored.payment_status = PaymentStatus::Completed;
            stored.updated_at = completion.now;
        }
        for ticket in completion.minted {
            inner.tickets.insert(ticket.id, ticket.clone());
        }
        for (ticket, version) in completion.activated {
            inner.update_ticket(ticket, *version)?;
        }
        if let Some(referral) = order
            .referral_code
            .as_deref()
            .and_then(|code| inner.referrals.get_mut(code))
        {
            referral.conversions += 1;
        }
        Ok(CompletionOutcome::Completed)
    }

    async fn fail_order(
        &self,
        order_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<FailOutcome, StoreError> {
        let mut inner = self.lock();
        let order = match inner.pending_order(order_id)? {
            Ok(order) => order.clone(),
            Err(settled) => return Ok(FailOutcome::AlreadySettled(settled)),
        };

        if let Some(stored) = inner.orders.get_mut(&order_id) {
            stored.payment_status = PaymentStatus::Failed;
            stored.updated_at = now;
        }
        for line in &order.lines {
            inner.settle_hold(line.reservation_id, ReservationState::Released);
        }
        for ticket in inner
            .tickets
            .values_mut()
            .filter(|t| t.order_id == order_id && t.status == TicketStatus::PendingPayment)
        {
            ticket.status = TicketStatus::Expired;
            ticket.updated_at = now;
            ticket.version += 1;
        }
        Ok(FailOutcome::Failed)
    }

    async fn ticket(&self, id: Uuid) -> Result<Option<Ticket>, StoreError> {
        Ok(self.lock().tickets.get(&id).cloned())
    }

    async fn tickets_for_order(&self, order_id: Uuid) -> Result<Vec<Ticket>, StoreError> {
        let mut tickets: Vec<Ticket> = self
            .lock()
            .tickets
            .values()
            .filter(|t| t.order_id == order_id)
            .cloned()
            .collect();
        tickets.sort_by_key(|t| (t.purchased_at, t.id));
        Ok(tickets)
    }

    async fn tickets_owned_by(&self, user_id: Uuid) -> Result<Vec<Ticket>, StoreError> {
        let mut tickets: Vec<Ticket> = self
            .lock()
            .tickets
            .values()
            .filter(|t| t.owner_id == user_id)
            .cloned()
            .collect();
        tickets.sort_by_key(|t| (t.purchased_at, t.id));
        Ok(tickets)
    }

    async fn update_ticket(
        &self,
        ticket: &Ticket,
        expected_version: i64,
    ) -> Result<Ticket, StoreError> {
        self.lock().update_ticket(ticket, expected_version)
    }

    async fn transfer_ticket(
        &self,
        ticket: &Ticket,
        expected_version: i64,
        record: &OwnershipRecord,
    ) -> Result<Ticket, StoreError> {
        let mut inner = self.lock();
        let stored = inner.update_ticket(ticket, expected_version)?;
        inner.ownership.push(record.clone());
        Ok(stored)
    }

    async fn ownership_history(&self, ticket_id: Uuid) -> Result<Vec<OwnershipRecord>, StoreError> {
        Ok(self
            .lock()
            .ownership
            .iter()
            .filter(|r| r.ticket_id == ticket_id)
            .cloned()
            .collect())
    }

    async fn tickets_transferred_from(&self, user_id: Uuid) -> Result<Vec<Ticket>, StoreError> {
        let inner = self.lock();
        let mut ids: Vec<Uuid> = inner
            .ownership
            .iter()
            .filter(|r| r.from_user_id == user_id)
            .map(|r| r.ticket_id)
            .collect();
        ids.sort();
        ids.dedup();
        Ok(ids
            .iter()
            .filter_map(|id| inner.tickets.get(id))
            .filter(|t| t.owner_id != user_id)
            .cloned()
            .collect())
    }

    async fn insert_referral(&self, referral: &Referral) -> Result<(), StoreError> {
        let mut inner = self.lock();
        if inner.referrals.contains_key(&referral.code) {
            return Err(StoreError::Duplicate {
                entity: "referral",
                id: referral.code.clone(),
            });
        }
        inner.referrals.insert(referral.code.clone(), referral.clone());
        Ok(())
    }

    async fn referral_by_code(&self, code: &str) -> Result<Option<Referral>, StoreError> {
        Ok(self.lock().referrals.get(code).cloned())
    }

    async fn record_referral_click(&self, code: &str) -> Result<bool, StoreError> {
        Ok(match self.lock().referrals.get_mut(code) {
            Some(referral) => {
                referral.clicks += 1;
                true
            }
            None => false,
        })
    }

    async fn record_referral_conversion(&self, code: &str) -> Result<bool, StoreError> {
        Ok(match self.lock().referrals.get_mut(code) {
            Some(referral) => {
                referral.conversions += 1;
                true
            }
            None => false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{PaymentMethod, PricedLine};
    use crate::store::testing::seed_event;
    use rust_decimal::Decimal;

    fn ticket(order: &Order, now: DateTime<Utc>) -> Ticket {
        let line = &order.lines[0];
        Ticket {
            id: Uuid::new_v4(),
            order_id: order.id,
            event_id: order.event_id,
            ticket_type_id: line.ticket_type_id,
            tier_id: line.tier_id,
            reservation_id: Some(line.reservation_id),
            owner_id: order.buyer_id,
            price_paid: line.unit_price,
            qr_payload: None,
            status: TicketStatus::PendingPayment,
            purchased_at: now,
            expires_at: now,
            payment_due_at: Some(now),
            scanned_at: None,
            validated_by: None,
            version: 0,
            updated_at: now,
        }
    }

    /// Holds `quantity` of the seeded event and builds the matching pending order.
    async fn held_order(store: &MemoryStore, event: &Event, quantity: u32, now: DateTime<Utc>) -> Order {
        let order_id = Uuid::new_v4();
        let hold = Reservation {
            id: Uuid::new_v4(),
            order_id,
            ticket_type_id: event.ticket_types[0].id,
            tier_id: event.tiers[0].id,
            quantity,
            state: ReservationState::Held,
            expires_at: now + chrono::Duration::minutes(15),
            created_at: now,
        };
        assert_eq!(store.try_hold(&hold, false).await.unwrap(), HoldOutcome::Held);
        Order {
            id: order_id,
            buyer_id: Uuid::new_v4(),
            event_id: event.id,
            payment_method: PaymentMethod::Cash,
            lines: vec![PricedLine {
                ticket_type_id: hold.ticket_type_id,
                tier_id: hold.tier_id,
                quantity,
                unit_price: Decimal::from(100),
                reservation_id: hold.id,
            }],
            total_amount: Decimal::from(100 * quantity),
            payment_status: PaymentStatus::Pending,
            referral_code: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn test_update_ticket_is_compare_and_swap() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let event = seed_event(&store, now, 4).await;
        let order = held_order(&store, &event, 1, now).await;
        let t = ticket(&order, now);
        store.insert_order(&order, std::slice::from_ref(&t)).await.unwrap();

        let mut used = t.clone();
        used.status = TicketStatus::Used;
        let stored = store.update_ticket(&used, 0).await.unwrap();
        assert_eq!(stored.version, 1);

        let stale = store.update_ticket(&used, 0).await.unwrap_err();
        assert!(matches!(stale, StoreError::Conflict { entity: "ticket", .. }));
    }

    #[tokio::test]
    async fn test_insert_order_writes_nothing_on_duplicate_ticket() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let event = seed_event(&store, now, 4).await;
        let first = held_order(&store, &event, 1, now).await;
        let t = ticket(&first, now);
        store.insert_order(&first, std::slice::from_ref(&t)).await.unwrap();

        let second = held_order(&store, &event, 1, now).await;
        let clash = Ticket {
            order_id: second.id,
            ..t.clone()
        };
        assert!(matches!(
            store.insert_order(&second, &[clash]).await,
            Err(StoreError::Duplicate { entity: "ticket", .. })
        ));
        assert!(store.order(second.id).await.unwrap().is_none());
        assert_eq!(store.ticket(t.id).await.unwrap().unwrap().order_id, first.id);
    }

    #[tokio::test]
    async fn test_complete_order_conflict_writes_nothing() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let event = seed_event(&store, now, 4).await;
        let order = held_order(&store, &event, 1, now).await;
        let pending = ticket(&order, now);
        store.insert_order(&order, std::slice::from_ref(&pending)).await.unwrap();

        let mut active = pending.clone();
        active.status = TicketStatus::Active;
        let stale = [(active, 7)];
        let completion = Completion {
            order_id: order.id,
            minted: &[],
            activated: &stale,
            now,
        };
        assert!(matches!(
            store.complete_order(&completion).await,
            Err(StoreError::Conflict { entity: "ticket", .. })
        ));

        let (tt, tier) = (event.ticket_types[0].id, event.tiers[0].id);
        let usage = store.allocation_usage(tt, tier).await.unwrap().unwrap();
        assert_eq!((usage.held, usage.sold), (1, 0));
        let stored = store.order(order.id).await.unwrap().unwrap();
        assert_eq!(stored.payment_status, PaymentStatus::Pending);
        let stored = store.ticket(pending.id).await.unwrap().unwrap();
        assert_eq!((stored.status, stored.version), (TicketStatus::PendingPayment, 0));
    }

    #[tokio::test]
    async fn test_settled_order_cannot_be_settled_again() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let event = seed_event(&store, now, 4).await;
        let order = held_order(&store, &event, 2, now).await;
        let pending = ticket(&order, now);
        store.insert_order(&order, std::slice::from_ref(&pending)).await.unwrap();

        assert_eq!(store.fail_order(order.id, now).await.unwrap(), FailOutcome::Failed);
        let expired = store.ticket(pending.id).await.unwrap().unwrap();
        assert_eq!((expired.status, expired.version), (TicketStatus::Expired, 1));

        let completion = Completion {
            order_id: order.id,
            minted: &[],
            activated: &[],
            now,
        };
        assert_eq!(
            store.complete_order(&completion).await.unwrap(),
            CompletionOutcome::AlreadySettled(PaymentStatus::Failed)
        );
        assert_eq!(
            store.fail_order(order.id, now).await.unwrap(),
            FailOutcome::AlreadySettled(PaymentStatus::Failed)
        );

        let (tt, tier) = (event.ticket_types[0].id, event.tiers[0].id);
        let usage = store.allocation_usage(tt, tier).await.unwrap().unwrap();
        assert_eq!((usage.held, usage.sold), (0, 0));
    }

    #[tokio::test]
    async fn test_catalog_replace_keeps_counters() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let mut event = seed_event(&store, now, 10).await;
        let (tt, tier) = (event.ticket_types[0].id, event.tiers[0].id);
        held_order(&store, &event, 4, now).await;

        event.tiers[0].allocations[0].quantity = 12;
        event.ticket_types[0].total_quantity = 12;
        assert_eq!(store.replace_catalog(&event).await.unwrap(), CatalogChange::Replaced);

        let usage = store.allocation_usage(tt, tier).await.unwrap().unwrap();
        assert_eq!((usage.quantity, usage.held), (12, 4));
    }

    #[tokio::test]
    async fn test_catalog_replace_refuses_to_shrink_below_holds() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let event = seed_event(&store, now, 10).await;
        let (tt, tier) = (event.ticket_types[0].id, event.tiers[0].id);

        // Edited against an idle snapshot, stored after a hold landed.
        let mut shrunk = event.clone();
        shrunk.tiers[0].allocations[0].quantity = 3;
        shrunk.ticket_types[0].total_quantity = 3;
        held_order(&store, &event, 4, now).await;

        assert!(matches!(
            store.replace_catalog(&shrunk).await.unwrap(),
            CatalogChange::Refused(shortfall) if shortfall.new_quantity == Some(3)
        ));
        let usage = store.allocation_usage(tt, tier).await.unwrap().unwrap();
        assert_eq!((usage.quantity, usage.held), (10, 4));
        let stored = store.event(event.id).await.unwrap().unwrap();
        assert_eq!(stored.tiers[0].allocations[0].quantity, 10);
    }

    #[tokio::test]
    async fn test_emails_are_unique_case_insensitively() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let user = User {
            id: Uuid::new_v4(),
            name: "Ana".to_string(),
            email: "Ana@Example.com".to_string(),
            personal_code: "code-1".to_string(),
            created_at: now,
            updated_at: now,
        };
        store.insert_user(&user).await.unwrap();

        let clash = User {
            id: Uuid::new_v4(),
            email: "ana@example.com ".to_string(),
            personal_code: "code-2".to_string(),
            ..user.clone()
        };
        assert!(matches!(
            store.insert_user(&clash).await,
            Err(StoreError::Duplicate { entity: "user", .. })
        ));
        assert_eq!(
            store.user_by_email("ANA@example.com").await.unwrap().map(|u| u.id),
            Some(user.id)
        );
    }
}
