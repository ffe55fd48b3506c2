//! Organizer-side catalog: events, ticket types, tiers and allocations.
//!
//! Every catalog write is validated as a whole. Once an allocation has
//! holds or sales, edits may grow it but never take away what is already
//! spoken for.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

use crate::models::{Event, TicketType, Tier, TierAllocation};
use crate::ticketing::error::TicketingError;
use crate::ticketing::inventory::{find_shortfall, AllocationUsage, Shortfall};

/// Largest quantity a ticket type, allocation or order line may carry.
/// Counters are stored as Postgres `INTEGER`.
pub const MAX_QUANTITY: u32 = i32::MAX as u32;

#[derive(Debug, Clone, Deserialize)]
pub struct EventDraft {
    pub title: String,
    pub description: Option<String>,
    pub category: String,
    pub venue: String,
    pub address: String,
    pub city: String,
    pub starts_at: DateTime<Utc>,
    #[serde(default = "default_public")]
    pub is_public: bool,
    pub ticket_types: Vec<TicketTypeDraft>,
    #[serde(default)]
    pub tiers: Vec<TierDraft>,
}

fn default_public() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct TicketTypeDraft {
    pub name: String,
    pub total_quantity: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TierDraft {
    /// Set when editing an existing tier; absent for a new one.
    #[serde(default)]
    pub id: Option<Uuid>,
    pub name: String,
    pub starts_at: Option<DateTime<Utc>>,
    pub ends_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub is_active: bool,
    pub allocations: Vec<AllocationDraft>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AllocationDraft {
    /// Ticket type name within the same catalog.
    pub ticket_type: String,
    pub price: Decimal,
    pub quantity: u32,
}

/// Full replacement of an event's ticket types and tiers.
#[derive(Debug, Clone, Deserialize)]
pub struct CatalogEdit {
    pub ticket_types: Vec<TicketTypeDraft>,
    pub tiers: Vec<TierDraft>,
}

fn type_key(name: &str) -> String {
    name.trim().to_lowercase()
}

/// Checks a catalog on its own, without looking at sales.
pub fn validate_catalog(
    ticket_types: &[TicketTypeDraft],
    tiers: &[TierDraft],
) -> Result<(), TicketingError> {
    if ticket_types.is_empty() {
        return Err(TicketingError::InvalidCatalog(
            "an event needs at least one ticket type".to_string(),
        ));
    }

    let mut declared: HashMap<String, (&str, u32)> = HashMap::new();
    for tt in ticket_types {
        if tt.name.trim().is_empty() {
            return Err(TicketingError::InvalidCatalog(
                "ticket type name is empty".to_string(),
            ));
        }
        if tt.total_quantity == 0 {
            return Err(TicketingError::InvalidCatalog(format!(
                "ticket type '{}' has no tickets",
                tt.name
            )));
        }
        if tt.total_quantity > MAX_QUANTITY {
            return Err(TicketingError::InvalidCatalog(format!(
                "ticket type '{}' exceeds {MAX_QUANTITY} tickets",
                tt.name
            )));
        }
        if declared
            .insert(type_key(&tt.name), (tt.name.as_str(), tt.total_quantity))
            .is_some()
        {
            return Err(TicketingError::InvalidCatalog(format!(
                "ticket type '{}' is declared twice",
                tt.name
            )));
        }
    }

    let mut allocated: HashMap<String, u32> = HashMap::new();
    let mut tier_names = HashSet::new();
    for tier in tiers {
        if tier.name.trim().is_empty() {
            return Err(TicketingError::InvalidCatalog("tier name is empty".to_string()));
        }
        if !tier_names.insert(tier.name.trim().to_lowercase()) {
            return Err(TicketingError::InvalidCatalog(format!(
                "tier '{}' is declared twice",
                tier.name
            )));
        }
        if let (Some(start), Some(end)) = (tier.starts_at, tier.ends_at) {
            if start >= end {
                return Err(TicketingError::MisconfiguredTiers(format!(
                    "tier '{}' starts at {start} but ends at {end}",
                    tier.name
                )));
            }
        }

        let mut seen = HashSet::new();
        for allocation in &tier.allocations {
            let key = type_key(&allocation.ticket_type);
            if !declared.contains_key(&key) {
                return Err(TicketingError::InvalidCatalog(format!(
                    "tier '{}' allocates unknown ticket type '{}'",
                    tier.name, allocation.ticket_type
                )));
            }
            if !seen.insert(key.clone()) {
                return Err(TicketingError::InvalidCatalog(format!(
                    "tier '{}' allocates '{}' twice",
                    tier.name, allocation.ticket_type
                )));
            }
            if allocation.quantity == 0 {
                return Err(TicketingError::InvalidCatalog(format!(
                    "tier '{}' allocates no '{}' tickets",
                    tier.name, allocation.ticket_type
                )));
            }
            if allocation.price.is_sign_negative() {
                return Err(TicketingError::InvalidCatalog(format!(
                    "tier '{}' prices '{}' below zero",
                    tier.name, allocation.ticket_type
                )));
            }
            let sum = allocated.entry(key).or_default();
            *sum = sum
                .checked_add(allocation.quantity)
                .filter(|total| *total <= MAX_QUANTITY)
                .ok_or_else(|| {
                    TicketingError::InvalidCatalog(format!(
                        "allocations of '{}' exceed {MAX_QUANTITY} tickets",
                        allocation.ticket_type
                    ))
                })?;
        }
    }

    // Total of a type is exactly what its tiers carve out.
    for (key, (name, total)) in &declared {
        let sum = allocated.get(key).copied().unwrap_or(0);
        if sum != *total {
            return Err(TicketingError::AllocationMismatch {
                ticket_type: (*name).to_string(),
                declared: *total,
                allocated: sum,
            });
        }
    }
    Ok(())
}

fn materialize(
    event_id: Uuid,
    drafts: &[TicketTypeDraft],
    tiers: &[TierDraft],
    existing: Option<&Event>,
    now: DateTime<Utc>,
) -> Result<(Vec<TicketType>, Vec<Tier>), TicketingError> {
    let ticket_types: Vec<TicketType> = drafts
        .iter()
        .map(|draft| {
            let id = existing
                .and_then(|e| {
                    e.ticket_types
                        .iter()
                        .find(|tt| type_key(&tt.name) == type_key(&draft.name))
                })
                .map_or_else(Uuid::new_v4, |tt| tt.id);
            TicketType {
                id,
                event_id,
                name: draft.name.trim().to_string(),
                total_quantity: draft.total_quantity,
            }
        })
        .collect();
    let type_ids: HashMap<String, Uuid> = ticket_types
        .iter()
        .map(|tt| (type_key(&tt.name), tt.id))
        .collect();

    let mut built = Vec::with_capacity(tiers.len());
    for draft in tiers {
        let (id, created_at) = match draft.id {
            Some(id) => {
                let tier = existing
                    .and_then(|e| e.tier(id))
                    .ok_or_else(|| TicketingError::not_found("tier", id))?;
                (tier.id, tier.created_at)
            }
            None => (Uuid::new_v4(), now),
        };
        let allocations = draft
            .allocations
            .iter()
            .filter_map(|a| {
                type_ids.get(&type_key(&a.ticket_type)).map(|&ticket_type_id| TierAllocation {
                    tier_id: id,
                    ticket_type_id,
                    price: a.price,
                    quantity: a.quantity,
                })
            })
            .collect();
        built.push(Tier {
            id,
            event_id,
            name: draft.name.trim().to_string(),
            starts_at: draft.starts_at,
            ends_at: draft.ends_at,
            is_active: draft.is_active,
            allocations,
            created_at,
        });
    }
    Ok((ticket_types, built))
}

/// Builds a new event owned by `organizer_id`. Private events get an access token.
pub fn build_event(
    organizer_id: Uuid,
    draft: EventDraft,
    now: DateTime<Utc>,
) -> Result<Event, TicketingError> {
    if draft.title.trim().is_empty() {
        return Err(TicketingError::InvalidCatalog("event title is empty".to_string()));
    }
    validate_catalog(&draft.ticket_types, &draft.tiers)?;

    let id = Uuid::new_v4();
    let (ticket_types, tiers) = materialize(id, &draft.ticket_types, &draft.tiers, None, now)?;
    Ok(Event {
        id,
        organizer_id,
        title: draft.title.trim().to_string(),
        description: draft.description,
        category: draft.category,
        venue: draft.venue,
        address: draft.address,
        city: draft.city,
        starts_at: draft.starts_at,
        is_public: draft.is_public,
        access_token: (!draft.is_public).then(|| Uuid::new_v4().simple().to_string()),
        ticket_types,
        tiers,
        created_at: now,
        updated_at: now,
    })
}

/// Applies `edit` to `event`, refusing anything that would drop below what
/// `usage` shows as held or sold.
pub fn apply_edit(
    event: &Event,
    edit: &CatalogEdit,
    usage: &[AllocationUsage],
    now: DateTime<Utc>,
) -> Result<Event, TicketingError> {
    validate_catalog(&edit.ticket_types, &edit.tiers)?;
    let (ticket_types, tiers) =
        materialize(event.id, &edit.ticket_types, &edit.tiers, Some(event), now)?;

    let edited = Event {
        ticket_types,
        tiers,
        updated_at: now,
        ..event.clone()
    };
    match find_shortfall(usage, &edited) {
        Some(shortfall) => Err(TicketingError::DestructiveEdit(describe_shortfall(
            event, &shortfall,
        ))),
        None => Ok(edited),
    }
}

/// Human-readable reason for refusing an edit, named after the catalog
/// as it was before the edit.
pub fn describe_shortfall(event: &Event, shortfall: &Shortfall) -> String {
    let used = &shortfall.usage;
    let tier = event.tier(used.tier_id).map_or("?", |t| t.name.as_str());
    let tt = event
        .ticket_type(used.ticket_type_id)
        .map_or("?", |t| t.name.as_str());
    let spoken_for = shortfall.spoken_for();
    match shortfall.new_quantity {
        None => format!(
            "'{tt}' in tier '{tier}' has {spoken_for} tickets sold or held and cannot be removed"
        ),
        Some(quantity) => format!(
            "'{tt}' in tier '{tier}' cannot shrink to {quantity} below the {spoken_for} already sold or held"
        ),
    }
}
