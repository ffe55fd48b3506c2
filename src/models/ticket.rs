use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Lifecycle state of a purchased ticket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TicketStatus {
    /// Reserved against an offline payment that has not arrived yet. Has no QR.
    PendingPayment,
    Active,
    /// Consumed at the door. Terminal.
    Used,
    /// Validity or payment window elapsed. Terminal.
    Expired,
    /// Seen from the previous owner's side after a transfer. Terminal for them.
    TransferredOut,
}

impl TicketStatus {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::PendingPayment => "PENDING_PAYMENT",
            Self::Active => "ACTIVE",
            Self::Used => "USED",
            Self::Expired => "EXPIRED",
            Self::TransferredOut => "TRANSFERRED_OUT",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING_PAYMENT" => Some(Self::PendingPayment),
            "ACTIVE" => Some(Self::Active),
            "USED" => Some(Self::Used),
            "EXPIRED" => Some(Self::Expired),
            "TRANSFERRED_OUT" => Some(Self::TransferredOut),
            _ => None,
        }
    }
}

impl fmt::Display for TicketStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ticket {
    pub id: Uuid,
    pub order_id: Uuid,
    pub event_id: Uuid,
    pub ticket_type_id: Uuid,
    /// Tier the ticket was priced under at purchase time.
    pub tier_id: Uuid,
    /// Hold backing a pending-payment ticket.
    pub reservation_id: Option<Uuid>,
    pub owner_id: Uuid,
    pub price_paid: Decimal,
    pub qr_payload: Option<String>,
    pub status: TicketStatus,
    pub purchased_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub payment_due_at: Option<DateTime<Utc>>,
    pub scanned_at: Option<DateTime<Utc>>,
    pub validated_by: Option<String>,
    /// Optimistic concurrency token, bumped on every persisted transition.
    pub version: i64,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransferChannel {
    Email,
    PersonalCode,
}

impl TransferChannel {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Email => "EMAIL",
            Self::PersonalCode => "PERSONAL_CODE",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "EMAIL" => Some(Self::Email),
            "PERSONAL_CODE" => Some(Self::PersonalCode),
            _ => None,
        }
    }
}

/// One hop in a ticket's ownership audit trail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnershipRecord {
    pub id: Uuid,
    pub ticket_id: Uuid,
    pub from_user_id: Uuid,
    pub to_user_id: Uuid,
    pub channel: TransferChannel,
    pub transferred_at: DateTime<Utc>,
}

/// A ticket as shown to one particular user.
#[derive(Debug, Clone, Serialize)]
pub struct TicketView {
    pub ticket_id: Uuid,
    pub event_id: Uuid,
    pub ticket_type_id: Uuid,
    pub status: TicketStatus,
    pub price_paid: Decimal,
    pub qr_payload: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub scanned_at: Option<DateTime<Utc>>,
}

impl TicketView {
    pub fn owned(ticket: &Ticket) -> Self {
        Self {
            ticket_id: ticket.id,
            event_id: ticket.event_id,
            ticket_type_id: ticket.ticket_type_id,
            status: ticket.status,
            price_paid: ticket.price_paid,
            qr_payload: ticket.qr_payload.clone(),
            expires_at: ticket.expires_at,
            scanned_at: ticket.scanned_at,
        }
    }

    /// The sender's side of a transfer: terminal, and without the QR.
    pub fn transferred_out(ticket: &Ticket) -> Self {
        Self {
            status: TicketStatus::TransferredOut,
            qr_payload: None,
            scanned_at: None,
            ..Self::owned(ticket)
        }
    }
}

/// What the door staff sees after a successful scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TicketSummary {
    pub ticket_id: Uuid,
    pub event_id: Uuid,
    pub event_title: String,
    pub ticket_type: String,
    pub owner_id: Uuid,
    pub owner_name: String,
    pub scanned_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trips_through_str() {
        for status in [
            TicketStatus::PendingPayment,
            TicketStatus::Active,
            TicketStatus::Used,
            TicketStatus::Expired,
            TicketStatus::TransferredOut,
        ] {
            assert_eq!(TicketStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(TicketStatus::parse("active"), None);
    }

    #[test]
    fn test_status_serializes_screaming_snake() {
        let json = serde_json::to_string(&TicketStatus::PendingPayment).unwrap();
        assert_eq!(json, "\"PENDING_PAYMENT\"");
    }
}
