//! Ticket transfers between registered users.
//!
//! A transfer is a single ownership mutation plus one audit record, applied
//! together under the ticket's version check. The ticket is re-signed, so
//! the sender's cached QR stops validating the moment the transfer lands.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::models::{OwnershipRecord, Ticket, TicketStatus, TransferChannel};
use crate::store::{Store, StoreError};
use crate::ticketing::error::TicketingError;
use crate::ticketing::lifecycle::{reassign, TicketLifecycle, MAX_CAS_ATTEMPTS};
use crate::ticketing::notify::Notifier;
use crate::ticketing::qr::QrCodec;

#[derive(Clone)]
pub struct TransferProtocol {
    store: Arc<dyn Store>,
    lifecycle: TicketLifecycle,
    codec: Arc<dyn QrCodec>,
    notifier: Arc<dyn Notifier>,
}

impl TransferProtocol {
    pub fn new(
        store: Arc<dyn Store>,
        lifecycle: TicketLifecycle,
        codec: Arc<dyn QrCodec>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            store,
            lifecycle,
            codec,
            notifier,
        }
    }

    /// Unknown recipients fail closed with `NotRegistered`; nothing is parked
    /// for a future sign-up.
    pub async fn transfer_by_email(
        &self,
        ticket_id: Uuid,
        actor: Uuid,
        recipient_email: &str,
        now: DateTime<Utc>,
    ) -> Result<Ticket, TicketingError> {
        self.check_owner(ticket_id, actor, now).await?;
        let recipient = self
            .store
            .user_by_email(recipient_email)
            .await?
            .ok_or_else(|| TicketingError::NotRegistered {
                email: recipient_email.trim().to_string(),
            })?;
        self.transfer_to(ticket_id, actor, recipient.id, TransferChannel::Email, now)
            .await
    }

    pub async fn transfer_by_personal_code(
        &self,
        ticket_id: Uuid,
        actor: Uuid,
        personal_qr: &str,
        now: DateTime<Utc>,
    ) -> Result<Ticket, TicketingError> {
        self.check_owner(ticket_id, actor, now).await?;
        let code = self.codec.verify_personal(personal_qr)?;
        let recipient = self
            .store
            .user_by_personal_code(&code)
            .await?
            .ok_or(TicketingError::InvalidCode)?;
        self.transfer_to(
            ticket_id,
            actor,
            recipient.id,
            TransferChannel::PersonalCode,
            now,
        )
        .await
    }

    /// Refuses non-owners before any recipient lookup, so the outcome of a
    /// transfer attempt never reveals whether an address is registered.
    async fn check_owner(
        &self,
        ticket_id: Uuid,
        actor: Uuid,
        now: DateTime<Utc>,
    ) -> Result<(), TicketingError> {
        let ticket = self.lifecycle.load(ticket_id, now).await?;
        if ticket.owner_id != actor {
            warn!(%ticket_id, %actor, "Transfer refused: not the owner");
            return Err(TicketingError::NotOwner {
                subject: format!("ticket {ticket_id}"),
                actor,
            });
        }
        Ok(())
    }

    async fn transfer_to(
        &self,
        ticket_id: Uuid,
        actor: Uuid,
        recipient: Uuid,
        channel: TransferChannel,
        now: DateTime<Utc>,
    ) -> Result<Ticket, TicketingError> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let ticket = self.lifecycle.load(ticket_id, now).await?;
            if ticket.owner_id != actor {
                warn!(%ticket_id, %actor, "Transfer refused: not the owner");
                return Err(TicketingError::NotOwner {
                    subject: format!("ticket {ticket_id}"),
                    actor,
                });
            }
            if ticket.status != TicketStatus::Active {
                return Err(TicketingError::InvalidState {
                    action: "transfer ticket",
                    current: ticket.status.to_string(),
                });
            }
            if recipient == actor {
                return Err(TicketingError::SelfTransfer);
            }

            let version = ticket.version;
            let mut moved = ticket;
            let qr = self.lifecycle.sign_for(moved.id, recipient, now);
            reassign(&mut moved, recipient, qr, now)?;
            let record = OwnershipRecord {
                id: Uuid::new_v4(),
                ticket_id,
                from_user_id: actor,
                to_user_id: recipient,
                channel,
                transferred_at: now,
            };

            match self.store.transfer_ticket(&moved, version, &record).await {
                Ok(stored) => {
                    info!(
                        %ticket_id,
                        from = %actor,
                        to = %recipient,
                        channel = channel.as_str(),
                        "Ticket transferred"
                    );
                    self.notifier
                        .ticket_transferred(&stored, actor, recipient)
                        .await;
                    return Ok(stored);
                }
                Err(StoreError::Conflict { .. }) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(StoreError::Conflict {
            entity: "ticket",
            id: ticket_id,
        }
        .into())
    }
}
