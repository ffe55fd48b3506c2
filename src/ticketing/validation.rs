//! At-the-door validation.
//!
//! Checks run in a fixed order: signature, existence, state, then freshness
//! of the payload. Only a fully successful scan writes anything, and it
//! does so with a version check, so concurrent scans of one ticket produce
//! exactly one success.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::models::{Ticket, TicketStatus, TicketSummary};
use crate::store::{Store, StoreError};
use crate::ticketing::error::TicketingError;
use crate::ticketing::lifecycle::{is_due_for_expiry, mark_used, MAX_CAS_ATTEMPTS};
use crate::ticketing::qr::QrCodec;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RejectReason {
    InvalidSignature,
    NotFound,
    AlreadyUsed,
    Expired,
    /// Signed correctly but replaced by a newer QR (the ticket was transferred).
    Superseded,
    /// Still waiting for payment.
    NotActive,
}

#[derive(Debug, Clone, Serialize)]
pub struct ValidationOutcome {
    pub valid: bool,
    pub reason: Option<RejectReason>,
    pub ticket: Option<TicketSummary>,
}

impl ValidationOutcome {
    fn accepted(ticket: TicketSummary) -> Self {
        Self {
            valid: true,
            reason: None,
            ticket: Some(ticket),
        }
    }

    fn rejected(reason: RejectReason, ticket: Option<TicketSummary>) -> Self {
        Self {
            valid: false,
            reason: Some(reason),
            ticket,
        }
    }
}

#[derive(Clone)]
pub struct ValidationGate {
    store: Arc<dyn Store>,
    codec: Arc<dyn QrCodec>,
}

impl ValidationGate {
    pub fn new(store: Arc<dyn Store>, codec: Arc<dyn QrCodec>) -> Self {
        Self { store, codec }
    }

    /// Domain rejections come back as `Ok` with `valid: false`; `Err` is
    /// reserved for storage faults.
    pub async fn validate(
        &self,
        qr_payload: &str,
        validator: &str,
        now: DateTime<Utc>,
    ) -> Result<ValidationOutcome, TicketingError> {
        let Ok(claims) = self.codec.verify_ticket(qr_payload) else {
            warn!(validator, "Scan rejected: bad signature");
            return Ok(ValidationOutcome::rejected(RejectReason::InvalidSignature, None));
        };

        for _ in 0..MAX_CAS_ATTEMPTS {
            let Some(ticket) = self.store.ticket(claims.ticket_id).await? else {
                warn!(ticket_id = %claims.ticket_id, validator, "Scan rejected: unknown ticket");
                return Ok(ValidationOutcome::rejected(RejectReason::NotFound, None));
            };

            if let Some(reason) = rejection(&ticket, qr_payload, now) {
                warn!(
                    ticket_id = %ticket.id,
                    status = %ticket.status,
                    ?reason,
                    validator,
                    "Scan rejected"
                );
                let summary = match reason {
                    RejectReason::AlreadyUsed | RejectReason::Expired => {
                        Some(self.summarize(&ticket).await?)
                    }
                    _ => None,
                };
                return Ok(ValidationOutcome::rejected(reason, summary));
            }

            let version = ticket.version;
            let mut used = ticket;
            mark_used(&mut used, now, validator)?;
            match self.store.update_ticket(&used, version).await {
                Ok(stored) => {
                    info!(ticket_id = %stored.id, validator, "Ticket validated");
                    return Ok(ValidationOutcome::accepted(self.summarize(&stored).await?));
                }
                Err(StoreError::Conflict { .. }) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(StoreError::Conflict {
            entity: "ticket",
            id: claims.ticket_id,
        }
        .into())
    }

    async fn summarize(&self, ticket: &Ticket) -> Result<TicketSummary, TicketingError> {
        let event = self
            .store
            .event(ticket.event_id)
            .await?
            .ok_or_else(|| TicketingError::not_found("event", ticket.event_id))?;
        let owner_name = self
            .store
            .user(ticket.owner_id)
            .await?
            .map(|u| u.name)
            .unwrap_or_default();
        let ticket_type = event
            .ticket_type(ticket.ticket_type_id)
            .map(|tt| tt.name.clone())
            .unwrap_or_default();
        Ok(TicketSummary {
            ticket_id: ticket.id,
            event_id: event.id,
            event_title: event.title,
            ticket_type,
            owner_id: ticket.owner_id,
            owner_name,
            scanned_at: ticket.scanned_at,
        })
    }
}

fn rejection(ticket: &Ticket, qr_payload: &str, now: DateTime<Utc>) -> Option<RejectReason> {
    match ticket.status {
        TicketStatus::Used => return Some(RejectReason::AlreadyUsed),
        TicketStatus::Expired => return Some(RejectReason::Expired),
        TicketStatus::PendingPayment if is_due_for_expiry(ticket, now) => {
            return Some(RejectReason::Expired)
        }
        TicketStatus::PendingPayment | TicketStatus::TransferredOut => {
            return Some(RejectReason::NotActive)
        }
        TicketStatus::Active => {}
    }
    if is_due_for_expiry(ticket, now) {
        return Some(RejectReason::Expired);
    }
    if ticket.qr_payload.as_deref() != Some(qr_payload.trim()) {
        return Some(RejectReason::Superseded);
    }
    None
}
