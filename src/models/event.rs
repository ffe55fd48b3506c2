use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub organizer_id: Uuid,
    pub title: String,
    pub description: Option<String>,
    pub category: String,
    pub venue: String,
    pub address: String,
    pub city: String,
    pub starts_at: DateTime<Utc>,
    pub is_public: bool,
    #[serde(skip_serializing)]
    pub access_token: Option<String>,
    pub ticket_types: Vec<TicketType>,
    /// Kept in creation order.
    pub tiers: Vec<Tier>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Event {
    pub fn ticket_type(&self, id: Uuid) -> Option<&TicketType> {
        self.ticket_types.iter().find(|t| t.id == id)
    }

    pub fn tier(&self, id: Uuid) -> Option<&Tier> {
        self.tiers.iter().find(|t| t.id == id)
    }

    /// Public events are open to everyone; private ones only to holders of the access token.
    pub fn grants_access(&self, token: Option<&str>) -> bool {
        if self.is_public {
            return true;
        }
        match (self.access_token.as_deref(), token) {
            (Some(expected), Some(given)) => expected == given,
            _ => false,
        }
    }
}

/// A category of ticket ("General", "VIP"). Prices live on tier allocations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TicketType {
    pub id: Uuid,
    pub event_id: Uuid,
    pub name: String,
    pub total_quantity: u32,
}

/// A sale tier (tanda). A missing bound is unbounded on that side.
///
/// Windows are half-open: `starts_at <= at < ends_at`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tier {
    pub id: Uuid,
    pub event_id: Uuid,
    pub name: String,
    pub starts_at: Option<DateTime<Utc>>,
    pub ends_at: Option<DateTime<Utc>>,
    pub is_active: bool,
    pub allocations: Vec<TierAllocation>,
    pub created_at: DateTime<Utc>,
}

impl Tier {
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        let after_start = self.starts_at.map_or(true, |start| start <= at);
        let before_end = self.ends_at.map_or(true, |end| at < end);
        after_start && before_end
    }

    /// Width of the window, or `None` when either side is open.
    pub fn window_width(&self) -> Option<Duration> {
        match (self.starts_at, self.ends_at) {
            (Some(start), Some(end)) => Some(end - start),
            _ => None,
        }
    }

    pub fn is_unbounded(&self) -> bool {
        self.starts_at.is_none() && self.ends_at.is_none()
    }

    pub fn allocation_for(&self, ticket_type_id: Uuid) -> Option<&TierAllocation> {
        self.allocations
            .iter()
            .find(|a| a.ticket_type_id == ticket_type_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierAllocation {
    pub tier_id: Uuid,
    pub ticket_type_id: Uuid,
    pub price: Decimal,
    pub quantity: u32,
}
