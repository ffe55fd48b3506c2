use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentMethod {
    Card,
    Cash,
    BankTransfer,
}

impl PaymentMethod {
    /// Offline methods settle outside the checkout redirect, so their
    /// tickets are minted up front in `PENDING_PAYMENT`.
    pub const fn is_offline(&self) -> bool {
        matches!(self, Self::Cash | Self::BankTransfer)
    }

    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Card => "CARD",
            Self::Cash => "CASH",
            Self::BankTransfer => "BANK_TRANSFER",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "CARD" => Some(Self::Card),
            "CASH" => Some(Self::Cash),
            "BANK_TRANSFER" => Some(Self::BankTransfer),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentStatus {
    Pending,
    Completed,
    Failed,
}

impl PaymentStatus {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(Self::Pending),
            "COMPLETED" => Some(Self::Completed),
            "FAILED" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// A requested `(ticket type, quantity)` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderLine {
    pub ticket_type_id: Uuid,
    pub quantity: u32,
}

/// An order line frozen at the price of the tier active when the order was placed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PricedLine {
    pub ticket_type_id: Uuid,
    pub tier_id: Uuid,
    pub quantity: u32,
    pub unit_price: Decimal,
    pub reservation_id: Uuid,
}

impl PricedLine {
    pub fn subtotal(&self) -> Decimal {
        self.unit_price * Decimal::from(self.quantity)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub id: Uuid,
    pub buyer_id: Uuid,
    pub event_id: Uuid,
    pub payment_method: PaymentMethod,
    pub lines: Vec<PricedLine>,
    pub total_amount: Decimal,
    pub payment_status: PaymentStatus,
    pub referral_code: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReservationState {
    Held,
    Committed,
    Released,
}

impl ReservationState {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Held => "HELD",
            Self::Committed => "COMMITTED",
            Self::Released => "RELEASED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "HELD" => Some(Self::Held),
            "COMMITTED" => Some(Self::Committed),
            "RELEASED" => Some(Self::Released),
            _ => None,
        }
    }
}

/// Inventory held against one `(ticket type, tier)` pair for one order line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Uuid,
    pub order_id: Uuid,
    pub ticket_type_id: Uuid,
    pub tier_id: Uuid,
    pub quantity: u32,
    pub state: ReservationState,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl Reservation {
    pub fn has_lapsed(&self, now: DateTime<Utc>) -> bool {
        self.state == ReservationState::Held && now > self.expires_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;

    #[test]
    fn test_offline_methods() {
        assert!(!PaymentMethod::Card.is_offline());
        assert!(PaymentMethod::Cash.is_offline());
        assert!(PaymentMethod::BankTransfer.is_offline());
    }

    #[test]
    fn test_line_subtotal() {
        let line = PricedLine {
            ticket_type_id: Uuid::new_v4(),
            tier_id: Uuid::new_v4(),
            quantity: 3,
            unit_price: Decimal::new(12050, 2),
            reservation_id: Uuid::new_v4(),
        };
        assert_eq!(line.subtotal(), Decimal::new(36150, 2));
    }

    #[test]
    fn test_reservation_lapses_only_while_held() {
        let now = Utc::now();
        let mut reservation = Reservation {
            id: Uuid::new_v4(),
            order_id: Uuid::new_v4(),
            ticket_type_id: Uuid::new_v4(),
            tier_id: Uuid::new_v4(),
            quantity: 1,
            state: ReservationState::Held,
            expires_at: now,
            created_at: now,
        };

        assert!(!reservation.has_lapsed(now));
        assert!(reservation.has_lapsed(now + chrono::Duration::seconds(1)));

        reservation.state = ReservationState::Committed;
        assert!(!reservation.has_lapsed(now + chrono::Duration::days(1)));
    }
}
