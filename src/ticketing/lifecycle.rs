//! Ticket lifecycle state machine.
//!
//! ```text
//! PENDING_PAYMENT ──pay──▶ ACTIVE ──scan──▶ USED
//!        │                   │ └──transfer──▶ TRANSFERRED_OUT (sender's view)
//!        └──────window──────▶ EXPIRED ◀──validity──┘
//! ```
//!
//! `USED` and `EXPIRED` are terminal. Transitions are pure mutations on a
//! [`Ticket`]; [`TicketLifecycle`] persists them with a version check so no
//! transition is ever applied against a stale read.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::models::{Order, PricedLine, Ticket, TicketStatus};
use crate::store::{FailOutcome, Store, StoreError};
use crate::ticketing::calendar::add_business_days;
use crate::ticketing::error::TicketingError;
use crate::ticketing::inventory::InventoryLedger;
use crate::ticketing::qr::{QrCodec, TicketClaims};

pub const MAX_CAS_ATTEMPTS: usize = 5;

impl TicketStatus {
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Used | Self::Expired | Self::TransferredOut)
    }

    pub const fn can_transition_to(&self, next: TicketStatus) -> bool {
        matches!(
            (self, next),
            (Self::PendingPayment, Self::Active)
                | (Self::PendingPayment, Self::Expired)
                | (Self::Active, Self::Used)
                | (Self::Active, Self::Expired)
                | (Self::Active, Self::TransferredOut)
        )
    }
}

fn check(ticket: &Ticket, next: TicketStatus, action: &'static str) -> Result<(), TicketingError> {
    if ticket.status.can_transition_to(next) {
        Ok(())
    } else {
        Err(TicketingError::InvalidState {
            action,
            current: ticket.status.to_string(),
        })
    }
}

/// Whether a lazy read at `now` must move the ticket to `EXPIRED`.
pub fn is_due_for_expiry(ticket: &Ticket, now: DateTime<Utc>) -> bool {
    match ticket.status {
        TicketStatus::Active => now > ticket.expires_at,
        TicketStatus::PendingPayment => ticket.payment_due_at.is_some_and(|due| now > due),
        _ => false,
    }
}

pub fn activate(ticket: &mut Ticket, qr_payload: String, now: DateTime<Utc>) -> Result<(), TicketingError> {
    check(ticket, TicketStatus::Active, "activate ticket")?;
    ticket.status = TicketStatus::Active;
    ticket.qr_payload = Some(qr_payload);
    ticket.payment_due_at = None;
    ticket.updated_at = now;
    Ok(())
}

pub fn expire(ticket: &mut Ticket, now: DateTime<Utc>) -> Result<(), TicketingError> {
    check(ticket, TicketStatus::Expired, "expire ticket")?;
    ticket.status = TicketStatus::Expired;
    ticket.updated_at = now;
    Ok(())
}

pub fn mark_used(
    ticket: &mut Ticket,
    scanned_at: DateTime<Utc>,
    validator: &str,
) -> Result<(), TicketingError> {
    check(ticket, TicketStatus::Used, "validate ticket")?;
    ticket.status = TicketStatus::Used;
    ticket.scanned_at = Some(scanned_at);
    ticket.validated_by = Some(validator.to_string());
    ticket.updated_at = scanned_at;
    Ok(())
}

/// Hands an active ticket to `new_owner`. The record itself stays `ACTIVE`;
/// the previous owner sees it as `TRANSFERRED_OUT` through the audit trail.
pub fn reassign(
    ticket: &mut Ticket,
    new_owner: Uuid,
    qr_payload: String,
    now: DateTime<Utc>,
) -> Result<(), TicketingError> {
    check(ticket, TicketStatus::TransferredOut, "transfer ticket")?;
    ticket.owner_id = new_owner;
    ticket.qr_payload = Some(qr_payload);
    ticket.updated_at = now;
    Ok(())
}

#[derive(Clone)]
pub struct TicketLifecycle {
    store: Arc<dyn Store>,
    ledger: InventoryLedger,
    codec: Arc<dyn QrCodec>,
    validity_business_days: u32,
}

impl TicketLifecycle {
    pub fn new(
        store: Arc<dyn Store>,
        ledger: InventoryLedger,
        codec: Arc<dyn QrCodec>,
        validity_business_days: u32,
    ) -> Self {
        Self {
            store,
            ledger,
            codec,
            validity_business_days,
        }
    }

    pub fn expires_at(&self, purchased_at: DateTime<Utc>) -> DateTime<Utc> {
        add_business_days(purchased_at, self.validity_business_days)
    }

    pub fn sign_for(&self, ticket_id: Uuid, owner_id: Uuid, now: DateTime<Utc>) -> String {
        self.codec
            .sign_ticket(&TicketClaims::new(ticket_id, owner_id, now))
    }

    /// Tickets for one priced line. With `payment_due` they start in
    /// `PENDING_PAYMENT` without a QR; otherwise `ACTIVE` and signed.
    pub fn mint(
        &self,
        order: &Order,
        line: &PricedLine,
        now: DateTime<Utc>,
        payment_due: Option<DateTime<Utc>>,
    ) -> Vec<Ticket> {
        (0..line.quantity)
            .map(|_| {
                let id = Uuid::new_v4();
                let (status, qr_payload) = match payment_due {
                    Some(_) => (TicketStatus::PendingPayment, None),
                    None => (
                        TicketStatus::Active,
                        Some(self.sign_for(id, order.buyer_id, now)),
                    ),
                };
                Ticket {
                    id,
                    order_id: order.id,
                    event_id: order.event_id,
                    ticket_type_id: line.ticket_type_id,
                    tier_id: line.tier_id,
                    reservation_id: payment_due.map(|_| line.reservation_id),
                    owner_id: order.buyer_id,
                    price_paid: line.unit_price,
                    qr_payload,
                    status,
                    purchased_at: now,
                    expires_at: self.expires_at(now),
                    payment_due_at: payment_due,
                    scanned_at: None,
                    validated_by: None,
                    version: 0,
                    updated_at: now,
                }
            })
            .collect()
    }

    /// A pending ticket moved to `ACTIVE` with a fresh QR, paired with the
    /// version it was read at. Nothing is stored.
    pub fn prepare_activation(
        &self,
        ticket: &Ticket,
        now: DateTime<Utc>,
    ) -> Result<(Ticket, i64), TicketingError> {
        let mut activated = ticket.clone();
        let qr = self.sign_for(ticket.id, ticket.owner_id, now);
        activate(&mut activated, qr, now)?;
        Ok((activated, ticket.version))
    }

    async fn fetch(&self, ticket_id: Uuid) -> Result<Ticket, TicketingError> {
        self.store
            .ticket(ticket_id)
            .await?
            .ok_or_else(|| TicketingError::not_found("ticket", ticket_id))
    }

    /// Reads a ticket and applies any expiration that is due at `now`.
    pub async fn load(&self, ticket_id: Uuid, now: DateTime<Utc>) -> Result<Ticket, TicketingError> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let ticket = self.fetch(ticket_id).await?;
            if !is_due_for_expiry(&ticket, now) {
                return Ok(ticket);
            }

            // An unpaid ticket takes its whole order down with it.
            if ticket.status == TicketStatus::PendingPayment
                && self.store.fail_order(ticket.order_id, now).await? == FailOutcome::Failed
            {
                info!(%ticket_id, order_id = %ticket.order_id, "Payment window elapsed");
                continue;
            }

            let prior = ticket.status;
            let version = ticket.version;
            let mut expired = ticket;
            expire(&mut expired, now)?;
            match self.store.update_ticket(&expired, version).await {
                Ok(stored) => {
                    if prior == TicketStatus::Active {
                        info!(%ticket_id, expires_at = %stored.expires_at, "Ticket expired");
                        self.ledger.return_expired(&stored).await?;
                    }
                    return Ok(stored);
                }
                Err(StoreError::Conflict { .. }) => {
                    debug!(%ticket_id, "Lost expiry race, re-reading ticket");
                    continue;
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(StoreError::Conflict {
            entity: "ticket",
            id: ticket_id,
        }
        .into())
    }

    /// `load` for every ticket in `tickets` that is due.
    pub async fn refresh_all(
        &self,
        tickets: Vec<Ticket>,
        now: DateTime<Utc>,
    ) -> Result<Vec<Ticket>, TicketingError> {
        let mut refreshed = Vec::with_capacity(tickets.len());
        for ticket in tickets {
            if is_due_for_expiry(&ticket, now) {
                refreshed.push(self.load(ticket.id, now).await?);
            } else {
                refreshed.push(ticket);
            }
        }
        Ok(refreshed)
    }
}
