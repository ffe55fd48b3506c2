//! Inventory ledger: per `(ticket type, tier)` counters and the holds against them.
//!
//! The counters are the only contended resource in the system. Every change
//! goes through the atomic primitives on [`Store`]; nothing here sums tickets
//! to work out what is left.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::models::{Event, Reservation, ReservationState, Ticket};
use crate::store::{HoldOutcome, Store};
use crate::ticketing::error::TicketingError;

/// What happens to the slot of a ticket that expired unused.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpiredInventoryPolicy {
    /// Counted as returned; never sold again.
    #[default]
    Retire,
    /// Counted as returned and offered again under the same tier at its current price.
    Resell,
}

impl ExpiredInventoryPolicy {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "retire" => Some(Self::Retire),
            "resell" => Some(Self::Resell),
            _ => None,
        }
    }
}

/// Counters for one `(ticket type, tier)` allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationUsage {
    pub ticket_type_id: Uuid,
    pub tier_id: Uuid,
    /// Carved-out quantity from the allocation.
    pub quantity: u32,
    /// Held by uncommitted reservations.
    pub held: u32,
    /// Committed by paid orders.
    pub sold: u32,
    /// Sold tickets that later expired unused.
    pub returned: u32,
}

impl AllocationUsage {
    pub fn empty(ticket_type_id: Uuid, tier_id: Uuid, quantity: u32) -> Self {
        Self {
            ticket_type_id,
            tier_id,
            quantity,
            held: 0,
            sold: 0,
            returned: 0,
        }
    }

    pub fn available(&self, policy: ExpiredInventoryPolicy) -> u32 {
        let consumed = match policy {
            ExpiredInventoryPolicy::Retire => self.held + self.sold,
            ExpiredInventoryPolicy::Resell => self.held + self.sold.saturating_sub(self.returned),
        };
        self.quantity.saturating_sub(consumed)
    }

    /// Anything other than a fresh allocation.
    pub fn has_activity(&self) -> bool {
        self.held > 0 || self.sold > 0
    }
}

/// An allocation with holds or sales that a catalog would drop, or shrink
/// below what is spoken for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Shortfall {
    pub usage: AllocationUsage,
    /// `None` when the allocation is gone.
    pub new_quantity: Option<u32>,
}

impl Shortfall {
    pub fn spoken_for(&self) -> u32 {
        self.usage.sold + self.usage.held
    }
}

/// First counter row in `usage` that the catalog of `event` no longer covers.
pub fn find_shortfall<'a>(
    usage: impl IntoIterator<Item = &'a AllocationUsage>,
    event: &Event,
) -> Option<Shortfall> {
    usage
        .into_iter()
        .filter(|u| u.has_activity())
        .find_map(|u| {
            let new_quantity = event
                .tier(u.tier_id)
                .and_then(|t| t.allocation_for(u.ticket_type_id))
                .map(|a| a.quantity);
            match new_quantity {
                Some(quantity) if quantity >= u.sold + u.held => None,
                _ => Some(Shortfall {
                    usage: *u,
                    new_quantity,
                }),
            }
        })
}

#[derive(Clone)]
pub struct InventoryLedger {
    store: Arc<dyn Store>,
    policy: ExpiredInventoryPolicy,
}

impl InventoryLedger {
    pub fn new(store: Arc<dyn Store>, policy: ExpiredInventoryPolicy) -> Self {
        Self { store, policy }
    }

    pub fn policy(&self) -> ExpiredInventoryPolicy {
        self.policy
    }

    pub async fn usage(
        &self,
        ticket_type_id: Uuid,
        tier_id: Uuid,
    ) -> Result<Option<AllocationUsage>, TicketingError> {
        Ok(self.store.allocation_usage(ticket_type_id, tier_id).await?)
    }

    pub async fn usage_for_event(
        &self,
        event_id: Uuid,
    ) -> Result<Vec<AllocationUsage>, TicketingError> {
        Ok(self.store.usage_for_event(event_id).await?)
    }

    /// Holds `quantity` units until `expires_at`, or fails with `OutOfStock`.
    pub async fn reserve(
        &self,
        order_id: Uuid,
        ticket_type_id: Uuid,
        tier_id: Uuid,
        quantity: u32,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Reservation, TicketingError> {
        if quantity == 0 {
            return Err(TicketingError::InvalidCatalog(
                "reservation quantity must be positive".to_string(),
            ));
        }

        let reservation = Reservation {
            id: Uuid::new_v4(),
            order_id,
            ticket_type_id,
            tier_id,
            quantity,
            state: ReservationState::Held,
            expires_at,
            created_at: now,
        };

        match self
            .store
            .try_hold(&reservation, self.policy == ExpiredInventoryPolicy::Resell)
            .await?
        {
            HoldOutcome::Held => {
                debug!(
                    reservation_id = %reservation.id,
                    %order_id,
                    %ticket_type_id,
                    %tier_id,
                    quantity,
                    "Inventory held"
                );
                Ok(reservation)
            }
            HoldOutcome::Insufficient { available } => {
                info!(
                    %ticket_type_id,
                    %tier_id,
                    requested = quantity,
                    available,
                    "Reservation refused: out of stock"
                );
                Err(TicketingError::OutOfStock {
                    ticket_type_id,
                    tier_id: Some(tier_id),
                    requested: quantity,
                    available,
                })
            }
        }
    }

    /// Returns a held reservation to the pool. `false` if it was not held.
    pub async fn release(&self, reservation_id: Uuid) -> Result<bool, TicketingError> {
        let released = self.store.release_hold(reservation_id).await?;
        if released {
            debug!(%reservation_id, "Hold released");
        }
        Ok(released)
    }

    pub async fn lapsed(&self, now: DateTime<Utc>) -> Result<Vec<Reservation>, TicketingError> {
        Ok(self.store.lapsed_holds(now).await?)
    }

    /// Books the slot of an expired ticket as returned.
    pub async fn return_expired(&self, ticket: &Ticket) -> Result<(), TicketingError> {
        self.store
            .return_slot(ticket.ticket_type_id, ticket.tier_id)
            .await?;
        info!(
            ticket_id = %ticket.id,
            tier_id = %ticket.tier_id,
            policy = ?self.policy,
            "Expired ticket slot returned to ledger"
        );
        Ok(())
    }
}
