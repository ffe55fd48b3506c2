use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A vendor's tracking code for one event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Referral {
    pub id: Uuid,
    pub vendor_id: Uuid,
    pub event_id: Uuid,
    pub code: String,
    pub clicks: u64,
    pub conversions: u64,
    pub created_at: DateTime<Utc>,
}
