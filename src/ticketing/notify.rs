//! Outbound notifications. Delivery is best effort: a failed notification
//! never rolls back the state change that triggered it.

use async_trait::async_trait;
use tracing::info;
use uuid::Uuid;

use crate::models::Ticket;

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn ticket_issued(&self, ticket: &Ticket);
    async fn ticket_transferred(&self, ticket: &Ticket, from: Uuid, to: Uuid);
}

/// Writes notifications to the log instead of sending them.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn ticket_issued(&self, ticket: &Ticket) {
        info!(
            ticket_id = %ticket.id,
            owner_id = %ticket.owner_id,
            event_id = %ticket.event_id,
            "Notify: ticket issued"
        );
    }

    async fn ticket_transferred(&self, ticket: &Ticket, from: Uuid, to: Uuid) {
        info!(
            ticket_id = %ticket.id,
            %from,
            %to,
            "Notify: ticket transferred"
        );
    }
}
