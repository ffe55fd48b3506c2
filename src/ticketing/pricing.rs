//! Tiered pricing resolution.
//!
//! One resolver decides which tier is on sale at a given instant and what
//! each ticket type costs under it. Every screen and every order goes
//! through here, always with the server's clock.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use crate::models::{Event, Tier};
use crate::ticketing::error::TicketingError;
use crate::ticketing::inventory::{AllocationUsage, ExpiredInventoryPolicy};

/// How to treat several tiers whose windows all contain the same instant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TierOverlapPolicy {
    /// Narrowest defined window wins, then the most recently created tier.
    #[default]
    TieBreak,
    /// Refuse to price with `MisconfiguredTiers`.
    Reject,
}

impl TierOverlapPolicy {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "tie_break" | "tiebreak" => Some(Self::TieBreak),
            "reject" => Some(Self::Reject),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionBasis {
    /// Exactly one window contains the instant.
    Window,
    /// Several windows overlapped; the tie-break picked one.
    TieBreak,
    /// No window matched; fell back to the active flag or creation order.
    Fallback,
}

#[derive(Debug, Clone, Copy)]
pub struct ActiveTier<'a> {
    pub tier: &'a Tier,
    pub basis: ResolutionBasis,
}

#[derive(Debug, Clone, Serialize)]
pub struct PriceEntry {
    pub ticket_type_id: Uuid,
    pub name: String,
    pub price: Decimal,
    pub available: u32,
    /// `false` when the active tier has no allocation or nothing is left.
    pub purchasable: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct PriceSheet {
    pub event_id: Uuid,
    pub tier_id: Option<Uuid>,
    pub tier_name: Option<String>,
    pub basis: Option<ResolutionBasis>,
    pub quoted_at: DateTime<Utc>,
    pub entries: Vec<PriceEntry>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PricingTierResolver {
    overlap_policy: TierOverlapPolicy,
}

impl PricingTierResolver {
    pub fn new(overlap_policy: TierOverlapPolicy) -> Self {
        Self { overlap_policy }
    }

    /// Picks the tier on sale at `at`, or `None` when the event has no tiers.
    pub fn resolve<'a>(
        &self,
        event: &'a Event,
        at: DateTime<Utc>,
    ) -> Result<Option<ActiveTier<'a>>, TicketingError> {
        let candidates: Vec<(usize, &Tier)> = event
            .tiers
            .iter()
            .enumerate()
            .filter(|(_, tier)| tier.contains(at))
            .collect();

        match candidates.as_slice() {
            [] => Ok(Self::fallback(event).map(|tier| ActiveTier {
                tier,
                basis: ResolutionBasis::Fallback,
            })),
            [(_, only)] => Ok(Some(ActiveTier {
                tier: *only,
                basis: ResolutionBasis::Window,
            })),
            many => {
                let names: Vec<&str> = many.iter().map(|(_, t)| t.name.as_str()).collect();
                if self.overlap_policy == TierOverlapPolicy::Reject {
                    return Err(TicketingError::MisconfiguredTiers(format!(
                        "tiers {} overlap at {}",
                        names.join(", "),
                        at
                    )));
                }
                warn!(
                    event_id = %event.id,
                    %at,
                    tiers = ?names,
                    "Overlapping tier windows, applying tie-break"
                );
                let winner = many
                    .iter()
                    .copied()
                    .min_by(|(ia, a), (ib, b)| {
                        // Open-ended windows are wider than any closed one.
                        let width = |t: &Tier| t.window_width().map_or((1, 0), |w| (0, w.num_seconds()));
                        width(a)
                            .cmp(&width(b))
                            .then_with(|| b.created_at.cmp(&a.created_at))
                            .then_with(|| ib.cmp(ia))
                    })
                    .map(|(_, tier)| tier);
                Ok(winner.map(|tier| ActiveTier {
                    tier,
                    basis: ResolutionBasis::TieBreak,
                }))
            }
        }
    }

    fn fallback(event: &Event) -> Option<&Tier> {
        event
            .tiers
            .iter()
            .find(|t| t.is_active)
            .or_else(|| event.tiers.first())
    }

    pub fn resolve_active_tier<'a>(
        &self,
        event: &'a Event,
        at: DateTime<Utc>,
    ) -> Result<Option<&'a Tier>, TicketingError> {
        Ok(self.resolve(event, at)?.map(|active| active.tier))
    }

    /// Price of one ticket of `ticket_type_id` at `at`.
    ///
    /// Zero when the active tier carries no allocation for the type; callers
    /// must read that together with availability as "sold out for this tier".
    pub fn price_for(
        &self,
        event: &Event,
        ticket_type_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<Decimal, TicketingError> {
        Ok(self
            .resolve_active_tier(event, at)?
            .and_then(|tier| tier.allocation_for(ticket_type_id))
            .map_or(Decimal::ZERO, |allocation| allocation.price))
    }

    /// Units of `ticket_type_id` still purchasable at `at`.
    pub fn available_for(
        &self,
        event: &Event,
        ticket_type_id: Uuid,
        at: DateTime<Utc>,
        usage: &[AllocationUsage],
        policy: ExpiredInventoryPolicy,
    ) -> Result<u32, TicketingError> {
        let Some(tier) = self.resolve_active_tier(event, at)? else {
            return Ok(0);
        };
        Ok(available_in_tier(tier, ticket_type_id, usage, policy))
    }

    /// Full price sheet for an event at `at`.
    pub fn quote(
        &self,
        event: &Event,
        at: DateTime<Utc>,
        usage: &[AllocationUsage],
        policy: ExpiredInventoryPolicy,
    ) -> Result<PriceSheet, TicketingError> {
        let active = self.resolve(event, at)?;
        let entries = event
            .ticket_types
            .iter()
            .map(|tt| {
                let (price, available) = match active {
                    Some(ActiveTier { tier, .. }) => (
                        tier.allocation_for(tt.id)
                            .map_or(Decimal::ZERO, |a| a.price),
                        available_in_tier(tier, tt.id, usage, policy),
                    ),
                    None => (Decimal::ZERO, 0),
                };
                PriceEntry {
                    ticket_type_id: tt.id,
                    name: tt.name.clone(),
                    price,
                    available,
                    purchasable: available > 0,
                }
            })
            .collect();

        Ok(PriceSheet {
            event_id: event.id,
            tier_id: active.map(|a| a.tier.id),
            tier_name: active.map(|a| a.tier.name.clone()),
            basis: active.map(|a| a.basis),
            quoted_at: at,
            entries,
        })
    }
}

fn available_in_tier(
    tier: &Tier,
    ticket_type_id: Uuid,
    usage: &[AllocationUsage],
    policy: ExpiredInventoryPolicy,
) -> u32 {
    let Some(allocation) = tier.allocation_for(ticket_type_id) else {
        return 0;
    };
    usage
        .iter()
        .find(|u| u.ticket_type_id == ticket_type_id && u.tier_id == tier.id)
        .map_or(allocation.quantity, |u| u.available(policy))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{TicketType, TierAllocation};
    use chrono::{Duration, TimeZone};
    use proptest::prelude::*;

    fn day(d: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 6, 1, 0, 0, 0).unwrap() + Duration::days(d)
    }

    struct Builder {
        event: Event,
        general: Uuid,
    }

    impl Builder {
        fn new() -> Self {
            let event_id = Uuid::new_v4();
            let general = Uuid::new_v4();
            let event = Event {
                id: event_id,
                organizer_id: Uuid::new_v4(),
                title: "Festival".to_string(),
                description: None,
                category: "music".to_string(),
                venue: "Arena".to_string(),
                address: "Av. 1".to_string(),
                city: "GDL".to_string(),
                starts_at: day(30),
                is_public: true,
                access_token: None,
                ticket_types: vec![TicketType {
                    id: general,
                    event_id,
                    name: "General".to_string(),
                    total_quantity: 0,
                }],
                tiers: vec![],
                created_at: day(-1),
                updated_at: day(-1),
            };
            Self { event, general }
        }

        fn tier(
            mut self,
            name: &str,
            window: (Option<i64>, Option<i64>),
            price: i64,
            quantity: u32,
            created: i64,
        ) -> Self {
            let tier_id = Uuid::new_v4();
            self.event.tiers.push(Tier {
                id: tier_id,
                event_id: self.event.id,
                name: name.to_string(),
                starts_at: window.0.map(day),
                ends_at: window.1.map(day),
                is_active: false,
                allocations: vec![TierAllocation {
                    tier_id,
                    ticket_type_id: self.general,
                    price: Decimal::from(price),
                    quantity,
                }],
                created_at: day(created),
            });
            self.event.ticket_types[0].total_quantity += quantity;
            self
        }
    }

    fn scenario() -> Builder {
        Builder::new()
            .tier("A", (Some(0), Some(10)), 100, 50, -10)
            .tier("B", (Some(10), Some(20)), 150, 30, -9)
    }

    #[test]
    fn test_scenario_resolves_by_window() {
        let b = scenario();
        let resolver = PricingTierResolver::default();

        let at5 = resolver.resolve(&b.event, day(5)).unwrap().unwrap();
        assert_eq!(at5.tier.name, "A");
        assert_eq!(at5.basis, ResolutionBasis::Window);
        assert_eq!(resolver.price_for(&b.event, b.general, day(5)).unwrap(), Decimal::from(100));

        let at15 = resolver.resolve_active_tier(&b.event, day(15)).unwrap().unwrap();
        assert_eq!(at15.name, "B");
        assert_eq!(resolver.price_for(&b.event, b.general, day(15)).unwrap(), Decimal::from(150));
    }

    #[test]
    fn test_boundaries_belong_to_the_later_tier() {
        let b = scenario();
        let resolver = PricingTierResolver::default();

        let at0 = resolver.resolve(&b.event, day(0)).unwrap().unwrap();
        assert_eq!((at0.tier.name.as_str(), at0.basis), ("A", ResolutionBasis::Window));

        let at10 = resolver.resolve(&b.event, day(10)).unwrap().unwrap();
        assert_eq!((at10.tier.name.as_str(), at10.basis), ("B", ResolutionBasis::Window));

        let just_before = day(10) - Duration::seconds(1);
        assert_eq!(resolver.resolve_active_tier(&b.event, just_before).unwrap().unwrap().name, "A");
    }

    #[test]
    fn test_no_window_falls_back_to_first_created() {
        let b = scenario();
        let resolver = PricingTierResolver::default();

        let at25 = resolver.resolve(&b.event, day(25)).unwrap().unwrap();
        assert_eq!(at25.tier.name, "A");
        assert_eq!(at25.basis, ResolutionBasis::Fallback);
    }

    #[test]
    fn test_fallback_prefers_active_flag() {
        let mut b = scenario();
        b.event.tiers[1].is_active = true;
        let resolver = PricingTierResolver::default();

        assert_eq!(resolver.resolve_active_tier(&b.event, day(25)).unwrap().unwrap().name, "B");
    }

    #[test]
    fn test_no_tiers_means_nothing_on_sale() {
        let b = Builder::new();
        let resolver = PricingTierResolver::default();

        assert!(resolver.resolve(&b.event, day(1)).unwrap().is_none());
        assert_eq!(resolver.price_for(&b.event, b.general, day(1)).unwrap(), Decimal::ZERO);

        let sheet = resolver
            .quote(&b.event, day(1), &[], ExpiredInventoryPolicy::Retire)
            .unwrap();
        assert!(sheet.tier_id.is_none());
        assert!(sheet.entries.iter().all(|e| !e.purchasable && e.available == 0));
    }

    #[test]
    fn test_overlap_prefers_narrowest_window() {
        let b = Builder::new()
            .tier("Season", (Some(0), Some(30)), 90, 10, -10)
            .tier("Flash", (Some(5), Some(7)), 50, 10, -20);
        let resolver = PricingTierResolver::default();

        let active = resolver.resolve(&b.event, day(6)).unwrap().unwrap();
        assert_eq!(active.tier.name, "Flash");
        assert_eq!(active.basis, ResolutionBasis::TieBreak);
    }

    #[test]
    fn test_overlap_tie_goes_to_most_recent() {
        let b = Builder::new()
            .tier("Old", (Some(0), Some(10)), 90, 10, -10)
            .tier("New", (Some(2), Some(12)), 80, 10, -5);
        let resolver = PricingTierResolver::default();

        assert_eq!(resolver.resolve_active_tier(&b.event, day(5)).unwrap().unwrap().name, "New");
    }

    #[test]
    fn test_bounded_window_supersedes_unbounded_tier() {
        let b = Builder::new()
            .tier("Always", (None, None), 200, 10, -30)
            .tier("Presale", (Some(0), Some(3)), 120, 10, -30);
        let resolver = PricingTierResolver::default();

        assert_eq!(resolver.resolve_active_tier(&b.event, day(1)).unwrap().unwrap().name, "Presale");
        let later = resolver.resolve(&b.event, day(4)).unwrap().unwrap();
        assert_eq!((later.tier.name.as_str(), later.basis), ("Always", ResolutionBasis::Window));
    }

    #[test]
    fn test_reject_policy_reports_overlap() {
        let b = Builder::new()
            .tier("X", (Some(0), Some(10)), 90, 10, -10)
            .tier("Y", (Some(5), Some(15)), 80, 10, -5);
        let resolver = PricingTierResolver::new(TierOverlapPolicy::Reject);

        let err = resolver.resolve(&b.event, day(6)).unwrap_err();
        assert!(matches!(err, TicketingError::MisconfiguredTiers(_)));
        assert!(resolver.resolve(&b.event, day(1)).unwrap().is_some());
    }

    #[test]
    fn test_missing_allocation_is_free_and_unavailable() {
        let mut b = scenario();
        let vip = Uuid::new_v4();
        b.event.ticket_types.push(TicketType {
            id: vip,
            event_id: b.event.id,
            name: "VIP".to_string(),
            total_quantity: 0,
        });
        let resolver = PricingTierResolver::default();

        assert_eq!(resolver.price_for(&b.event, vip, day(5)).unwrap(), Decimal::ZERO);
        assert_eq!(
            resolver
                .available_for(&b.event, vip, day(5), &[], ExpiredInventoryPolicy::Retire)
                .unwrap(),
            0
        );
    }

    #[test]
    fn test_quote_uses_ledger_counters() {
        let b = scenario();
        let tier_a = b.event.tiers[0].id;
        let usage = vec![AllocationUsage {
            ticket_type_id: b.general,
            tier_id: tier_a,
            quantity: 50,
            held: 4,
            sold: 40,
            returned: 3,
        }];
        let resolver = PricingTierResolver::default();

        let sheet = resolver
            .quote(&b.event, day(5), &usage, ExpiredInventoryPolicy::Retire)
            .unwrap();
        assert_eq!(sheet.tier_id, Some(tier_a));
        assert_eq!(sheet.entries[0].available, 6);
        assert_eq!(sheet.entries[0].price, Decimal::from(100));

        let resell = resolver
            .available_for(&b.event, b.general, day(5), &usage, ExpiredInventoryPolicy::Resell)
            .unwrap();
        assert_eq!(resell, 9);

        // Tier B has no usage row yet: full allocation.
        let sheet_b = resolver
            .quote(&b.event, day(12), &usage, ExpiredInventoryPolicy::Retire)
            .unwrap();
        assert_eq!(sheet_b.entries[0].available, 30);
    }

    #[test]
    fn test_overlap_policy_parse() {
        assert_eq!(TierOverlapPolicy::parse("tie_break"), Some(TierOverlapPolicy::TieBreak));
        assert_eq!(TierOverlapPolicy::parse("REJECT"), Some(TierOverlapPolicy::Reject));
        assert_eq!(TierOverlapPolicy::parse("newest"), None);
    }

    proptest! {
        #[test]
        fn prop_contiguous_tiers_resolve_to_their_own_window(
            widths in prop::collection::vec(1i64..15, 1..6),
            offset_seconds in 0i64..86_400,
        ) {
            let mut b = Builder::new();
            let mut start = 0;
            for (i, w) in widths.iter().enumerate() {
                b = b.tier(&format!("T{i}"), (Some(start), Some(start + w)), 10 * (i as i64 + 1), 5, -50 + i as i64);
                start += w;
            }
            let resolver = PricingTierResolver::new(TierOverlapPolicy::Reject);

            let mut start = 0;
            for (i, w) in widths.iter().enumerate() {
                let name = format!("T{i}");
                // opening boundary
                let at_open = resolver.resolve(&b.event, day(start)).unwrap().unwrap();
                prop_assert_eq!(&at_open.tier.name, &name);
                prop_assert_eq!(at_open.basis, ResolutionBasis::Window);
                // somewhere inside
                let inside = day(start) + Duration::seconds(offset_seconds % (w * 86_400));
                prop_assert_eq!(&resolver.resolve_active_tier(&b.event, inside).unwrap().unwrap().name, &name);
                // last second before the closing boundary
                let closing = day(start + w) - Duration::seconds(1);
                prop_assert_eq!(&resolver.resolve_active_tier(&b.event, closing).unwrap().unwrap().name, &name);
                start += w;
            }
        }
    }
}
