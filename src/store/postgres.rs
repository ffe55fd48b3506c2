//! Postgres store.
//!
//! Ledger counters live on the `allocations` rows and only move through
//! conditional `UPDATE`s, so two sessions can never both take the last
//! seat. Tickets are updated with `WHERE version = $n`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgRow};
use sqlx::types::Json;
use sqlx::{Postgres, Row, Transaction};
use uuid::Uuid;

use super::{
    CatalogChange, Completion, CompletionOutcome, FailOutcome, HoldOutcome, Store, StoreError,
};
use crate::models::user::normalize_email;
use crate::models::{
    Event, Order, OwnershipRecord, PaymentMethod, PaymentStatus, PricedLine, Referral,
    Reservation, ReservationState, Ticket, TicketStatus, TicketType, Tier, TierAllocation,
    TransferChannel, User,
};
use crate::ticketing::inventory::{find_shortfall, AllocationUsage, ExpiredInventoryPolicy};

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn count(value: i32, column: &str) -> Result<u32, StoreError> {
    u32::try_from(value).map_err(|_| StoreError::Corrupt(format!("{column} is negative: {value}")))
}

fn counter(value: i64, column: &str) -> Result<u64, StoreError> {
    u64::try_from(value).map_err(|_| StoreError::Corrupt(format!("{column} is negative: {value}")))
}

fn db_count(value: u32) -> Result<i32, StoreError> {
    i32::try_from(value)
        .map_err(|_| StoreError::Corrupt(format!("count {value} does not fit an INTEGER column")))
}

fn parse_with<T>(raw: &str, parse: fn(&str) -> Option<T>, column: &str) -> Result<T, StoreError> {
    parse(raw).ok_or_else(|| StoreError::Corrupt(format!("unknown {column}: {raw}")))
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.code().as_deref() == Some("23505"))
}

fn user_from_row(row: &PgRow) -> Result<User, StoreError> {
    Ok(User {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        email: row.try_get("email")?,
        personal_code: row.try_get("personal_code")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn usage_from_row(row: &PgRow) -> Result<AllocationUsage, StoreError> {
    Ok(AllocationUsage {
        ticket_type_id: row.try_get("ticket_type_id")?,
        tier_id: row.try_get("tier_id")?,
        quantity: count(row.try_get("quantity")?, "quantity")?,
        held: count(row.try_get("held")?, "held")?,
        sold: count(row.try_get("sold")?, "sold")?,
        returned: count(row.try_get("returned")?, "returned")?,
    })
}

fn reservation_from_row(row: &PgRow) -> Result<Reservation, StoreError> {
    let state: String = row.try_get("state")?;
    Ok(Reservation {
        id: row.try_get("id")?,
        order_id: row.try_get("order_id")?,
        ticket_type_id: row.try_get("ticket_type_id")?,
        tier_id: row.try_get("tier_id")?,
        quantity: count(row.try_get("quantity")?, "quantity")?,
        state: parse_with(&state, ReservationState::parse, "reservation state")?,
        expires_at: row.try_get("expires_at")?,
        created_at: row.try_get("created_at")?,
    })
}

fn order_from_row(row: &PgRow) -> Result<Order, StoreError> {
    let method: String = row.try_get("payment_method")?;
    let status: String = row.try_get("payment_status")?;
    let Json(lines): Json<Vec<PricedLine>> = row.try_get("lines")?;
    Ok(Order {
        id: row.try_get("id")?,
        buyer_id: row.try_get("buyer_id")?,
        event_id: row.try_get("event_id")?,
        payment_method: parse_with(&method, PaymentMethod::parse, "payment method")?,
        lines,
        total_amount: row.try_get("total_amount")?,
        payment_status: parse_with(&status, PaymentStatus::parse, "payment status")?,
        referral_code: row.try_get("referral_code")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn ticket_from_row(row: &PgRow) -> Result<Ticket, StoreError> {
    let status: String = row.try_get("status")?;
    Ok(Ticket {
        id: row.try_get("id")?,
        order_id: row.try_get("order_id")?,
        event_id: row.try_get("event_id")?,
        ticket_type_id: row.try_get("ticket_type_id")?,
        tier_id: row.try_get("tier_id")?,
        reservation_id: row.try_get("reservation_id")?,
        owner_id: row.try_get("owner_id")?,
        price_paid: row.try_get("price_paid")?,
        qr_payload: row.try_get("qr_payload")?,
        status: parse_with(&status, TicketStatus::parse, "ticket status")?,
        purchased_at: row.try_get("purchased_at")?,
        expires_at: row.try_get("expires_at")?,
        payment_due_at: row.try_get("payment_due_at")?,
        scanned_at: row.try_get("scanned_at")?,
        validated_by: row.try_get("validated_by")?,
        version: row.try_get("version")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn ownership_from_row(row: &PgRow) -> Result<OwnershipRecord, StoreError> {
    let channel: String = row.try_get("channel")?;
    Ok(OwnershipRecord {
        id: row.try_get("id")?,
        ticket_id: row.try_get("ticket_id")?,
        from_user_id: row.try_get("from_user_id")?,
        to_user_id: row.try_get("to_user_id")?,
        channel: parse_with(&channel, TransferChannel::parse, "transfer channel")?,
        transferred_at: row.try_get("transferred_at")?,
    })
}

fn referral_from_row(row: &PgRow) -> Result<Referral, StoreError> {
    Ok(Referral {
        id: row.try_get("id")?,
        vendor_id: row.try_get("vendor_id")?,
        event_id: row.try_get("event_id")?,
        code: row.try_get("code")?,
        clicks: counter(row.try_get("clicks")?, "clicks")?,
        conversions: counter(row.try_get("conversions")?, "conversions")?,
        created_at: row.try_get("created_at")?,
    })
}

const TICKET_COLUMNS: &str = "id, order_id, event_id, ticket_type_id, tier_id, reservation_id, \
     owner_id, price_paid, qr_payload, status, purchased_at, expires_at, payment_due_at, \
     scanned_at, validated_by, version, updated_at";

/// Writes ticket types, tiers and allocations for `event`. Allocation
/// counters of rows that already exist are left alone.
async fn write_catalog(tx: &mut Transaction<'_, Postgres>, event: &Event) -> Result<(), StoreError> {
    for (position, tt) in event.ticket_types.iter().enumerate() {
        sqlx::query(
            r"
            INSERT INTO ticket_types (id, event_id, name, total_quantity, position)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (id) DO UPDATE
            SET name = EXCLUDED.name,
                total_quantity = EXCLUDED.total_quantity,
                position = EXCLUDED.position
            ",
        )
        .bind(tt.id)
        .bind(event.id)
        .bind(&tt.name)
        .bind(db_count(tt.total_quantity)?)
        .bind(position as i32)
        .execute(&mut **tx)
        .await?;
    }

    for (position, tier) in event.tiers.iter().enumerate() {
        sqlx::query(
            r"
            INSERT INTO tiers (id, event_id, name, starts_at, ends_at, is_active, created_at, position)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (id) DO UPDATE
            SET name = EXCLUDED.name,
                starts_at = EXCLUDED.starts_at,
                ends_at = EXCLUDED.ends_at,
                is_active = EXCLUDED.is_active,
                position = EXCLUDED.position
            ",
        )
        .bind(tier.id)
        .bind(event.id)
        .bind(&tier.name)
        .bind(tier.starts_at)
        .bind(tier.ends_at)
        .bind(tier.is_active)
        .bind(tier.created_at)
        .bind(position as i32)
        .execute(&mut **tx)
        .await?;

        for allocation in &tier.allocations {
            sqlx::query(
                r"
                INSERT INTO allocations (ticket_type_id, tier_id, price, quantity)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT (ticket_type_id, tier_id) DO UPDATE
                SET price = EXCLUDED.price,
                    quantity = EXCLUDED.quantity
                ",
            )
            .bind(allocation.ticket_type_id)
            .bind(tier.id)
            .bind(allocation.price)
            .bind(db_count(allocation.quantity)?)
            .execute(&mut **tx)
            .await?;
        }
    }
    Ok(())
}

#[async_trait]
impl Store for PgStore {
    async fn insert_event(&self, event: &Event) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        let inserted = sqlx::query(
            r"
            INSERT INTO events (id, organizer_id, title, description, category, venue, address,
                                city, starts_at, is_public, access_token, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            ",
        )
        .bind(event.id)
        .bind(event.organizer_id)
        .bind(&event.title)
        .bind(&event.description)
        .bind(&event.category)
        .bind(&event.venue)
        .bind(&event.address)
        .bind(&event.city)
        .bind(event.starts_at)
        .bind(event.is_public)
        .bind(&event.access_token)
        .bind(event.created_at)
        .bind(event.updated_at)
        .execute(&mut *tx)
        .await;
        if let Err(e) = inserted {
            return Err(if is_unique_violation(&e) {
                StoreError::Duplicate {
                    entity: "event",
                    id: event.id.to_string(),
                }
            } else {
                e.into()
            });
        }
        write_catalog(&mut tx, event).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn replace_catalog(&self, event: &Event) -> Result<CatalogChange, StoreError> {
        let mut tx = self.pool.begin().await?;
        let updated = sqlx::query("UPDATE events SET updated_at = $2 WHERE id = $1")
            .bind(event.id)
            .bind(event.updated_at)
            .execute(&mut *tx)
            .await?;
        if updated.rows_affected() == 0 {
            return Err(StoreError::Corrupt(format!("event {} does not exist", event.id)));
        }

        // Holds and sales wait on these row locks until the edit commits.
        let usage = sqlx::query(
            r"
            SELECT a.*
            FROM allocations a
            JOIN tiers t ON t.id = a.tier_id
            WHERE t.event_id = $1
            ORDER BY a.ticket_type_id, a.tier_id
            FOR UPDATE OF a
            ",
        )
        .bind(event.id)
        .fetch_all(&mut *tx)
        .await?
        .iter()
        .map(usage_from_row)
        .collect::<Result<Vec<_>, StoreError>>()?;
        if let Some(shortfall) = find_shortfall(&usage, event) {
            tx.rollback().await?;
            return Ok(CatalogChange::Refused(shortfall));
        }

        write_catalog(&mut tx, event).await?;

        let tier_ids: Vec<Uuid> = event.tiers.iter().map(|t| t.id).collect();
        let type_ids: Vec<Uuid> = event.ticket_types.iter().map(|t| t.id).collect();
        let (alloc_types, alloc_tiers): (Vec<Uuid>, Vec<Uuid>) = event
            .tiers
            .iter()
            .flat_map(|t| t.allocations.iter().map(move |a| (a.ticket_type_id, t.id)))
            .unzip();

        sqlx::query(
            r"
            DELETE FROM allocations a
            USING tiers t
            WHERE a.tier_id = t.id
              AND t.event_id = $1
              AND (a.ticket_type_id, a.tier_id) NOT IN (
                  SELECT * FROM UNNEST($2::uuid[], $3::uuid[])
              )
            ",
        )
        .bind(event.id)
        .bind(&alloc_types)
        .bind(&alloc_tiers)
        .execute(&mut *tx)
        .await?;
        sqlx::query("DELETE FROM tiers WHERE event_id = $1 AND NOT (id = ANY($2))")
            .bind(event.id)
            .bind(&tier_ids)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM ticket_types WHERE event_id = $1 AND NOT (id = ANY($2))")
            .bind(event.id)
            .bind(&type_ids)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(CatalogChange::Replaced)
    }

    async fn event(&self, id: Uuid) -> Result<Option<Event>, StoreError> {
        let Some(row) = sqlx::query("SELECT * FROM events WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
        else {
            return Ok(None);
        };

        let ticket_types = sqlx::query(
            "SELECT id, name, total_quantity FROM ticket_types WHERE event_id = $1 ORDER BY position",
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(|r| {
            Ok(TicketType {
                id: r.try_get("id")?,
                event_id: id,
                name: r.try_get("name")?,
                total_quantity: count(r.try_get("total_quantity")?, "total_quantity")?,
            })
        })
        .collect::<Result<Vec<_>, StoreError>>()?;

        let allocations = sqlx::query(
            r"
            SELECT a.ticket_type_id, a.tier_id, a.price, a.quantity
            FROM allocations a
            JOIN tiers t ON t.id = a.tier_id
            WHERE t.event_id = $1
            ",
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(|r| {
            Ok(TierAllocation {
                tier_id: r.try_get("tier_id")?,
                ticket_type_id: r.try_get("ticket_type_id")?,
                price: r.try_get("price")?,
                quantity: count(r.try_get("quantity")?, "quantity")?,
            })
        })
        .collect::<Result<Vec<_>, StoreError>>()?;

        let tiers = sqlx::query("SELECT * FROM tiers WHERE event_id = $1 ORDER BY position")
            .bind(id)
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(|r| {
                let tier_id: Uuid = r.try_get("id")?;
                Ok(Tier {
                    id: tier_id,
                    event_id: id,
                    name: r.try_get("name")?,
                    starts_at: r.try_get("starts_at")?,
                    ends_at: r.try_get("ends_at")?,
                    is_active: r.try_get("is_active")?,
                    allocations: allocations
                        .iter()
                        .filter(|a| a.tier_id == tier_id)
                        .cloned()
                        .collect(),
                    created_at: r.try_get("created_at")?,
                })
            })
            .collect::<Result<Vec<_>, StoreError>>()?;

        Ok(Some(Event {
            id,
            organizer_id: row.try_get("organizer_id")?,
            title: row.try_get("title")?,
            description: row.try_get("description")?,
            category: row.try_get("category")?,
            venue: row.try_get("venue")?,
            address: row.try_get("address")?,
            city: row.try_get("city")?,
            starts_at: row.try_get("starts_at")?,
            is_public: row.try_get("is_public")?,
            access_token: row.try_get("access_token")?,
            ticket_types,
            tiers,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        }))
    }

    async fn insert_user(&self, user: &User) -> Result<(), StoreError> {
        sqlx::query(
            r"
            INSERT INTO users (id, name, email, personal_code, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ",
        )
        .bind(user.id)
        .bind(&user.name)
        .bind(normalize_email(&user.email))
        .bind(&user.personal_code)
        .bind(user.created_at)
        .bind(user.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                StoreError::Duplicate {
                    entity: "user",
                    id: normalize_email(&user.email),
                }
            } else {
                e.into()
            }
        })?;
        Ok(())
    }

    async fn user(&self, id: Uuid) -> Result<Option<User>, StoreError> {
        sqlx::query("SELECT * FROM users WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(user_from_row)
            .transpose()
    }

    async fn user_by_email(&self, email: &str) -> Result<Option<User>, StoreError> {
        sqlx::query("SELECT * FROM users WHERE LOWER(email) = $1")
            .bind(normalize_email(email))
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(user_from_row)
            .transpose()
    }

    async fn user_by_personal_code(&self, code: &str) -> Result<Option<User>, StoreError> {
        sqlx::query("SELECT * FROM users WHERE personal_code = $1")
            .bind(code)
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(user_from_row)
            .transpose()
    }

    async fn allocation_usage(
        &self,
        ticket_type_id: Uuid,
        tier_id: Uuid,
    ) -> Result<Option<AllocationUsage>, StoreError> {
        sqlx::query("SELECT * FROM allocations WHERE ticket_type_id = $1 AND tier_id = $2")
            .bind(ticket_type_id)
            .bind(tier_id)
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(usage_from_row)
            .transpose()
    }

    async fn usage_for_event(&self, event_id: Uuid) -> Result<Vec<AllocationUsage>, StoreError> {
        sqlx::query(
            r"
            SELECT a.*
            FROM allocations a
            JOIN tiers t ON t.id = a.tier_id
            WHERE t.event_id = $1
            ",
        )
        .bind(event_id)
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(usage_from_row)
        .collect()
    }

    async fn try_hold(
        &self,
        reservation: &Reservation,
        resell_returned: bool,
    ) -> Result<HoldOutcome, StoreError> {
        let mut tx = self.pool.begin().await?;
        let taken = sqlx::query(
            r"
            UPDATE allocations
            SET held = held + $3
            WHERE ticket_type_id = $1
              AND tier_id = $2
              AND quantity - held - sold + CASE WHEN $4 THEN returned ELSE 0 END >= $3
            ",
        )
        .bind(reservation.ticket_type_id)
        .bind(reservation.tier_id)
        .bind(db_count(reservation.quantity)?)
        .bind(resell_returned)
        .execute(&mut *tx)
        .await?;

        if taken.rows_affected() == 0 {
            tx.rollback().await?;
            let available = self
                .allocation_usage(reservation.ticket_type_id, reservation.tier_id)
                .await?
                .map_or(0, |u| {
                    u.available(if resell_returned {
                        ExpiredInventoryPolicy::Resell
                    } else {
                        ExpiredInventoryPolicy::Retire
                    })
                });
            return Ok(HoldOutcome::Insufficient { available });
        }

        sqlx::query(
            r"
            INSERT INTO reservations (id, order_id, ticket_type_id, tier_id, quantity, state,
                                      expires_at, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ",
        )
        .bind(reservation.id)
        .bind(reservation.order_id)
        .bind(reservation.ticket_type_id)
        .bind(reservation.tier_id)
        .bind(db_count(reservation.quantity)?)
        .bind(reservation.state.as_str())
        .bind(reservation.expires_at)
        .bind(reservation.created_at)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(HoldOutcome::Held)
    }

    async fn release_hold(&self, reservation_id: Uuid) -> Result<bool, StoreError> {
        let mut tx = self.pool.begin().await?;
        let Some(row) = sqlx::query(
            r"
            UPDATE reservations SET state = $2
            WHERE id = $1 AND state = $3
            RETURNING ticket_type_id, tier_id, quantity
            ",
        )
        .bind(reservation_id)
        .bind(ReservationState::Released.as_str())
        .bind(ReservationState::Held.as_str())
        .fetch_optional(&mut *tx)
        .await?
        else {
            return Ok(false);
        };

        sqlx::query(
            r"
            UPDATE allocations
            SET held = GREATEST(held - $3, 0)
            WHERE ticket_type_id = $1 AND tier_id = $2
            ",
        )
        .bind(row.try_get::<Uuid, _>("ticket_type_id")?)
        .bind(row.try_get::<Uuid, _>("tier_id")?)
        .bind(row.try_get::<i32, _>("quantity")?)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(true)
    }

    async fn lapsed_holds(&self, now: DateTime<Utc>) -> Result<Vec<Reservation>, StoreError> {
        sqlx::query("SELECT * FROM reservations WHERE state = $1 AND expires_at < $2")
            .bind(ReservationState::Held.as_str())
            .bind(now)
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(reservation_from_row)
            .collect()
    }

    async fn reservation(&self, id: Uuid) -> Result<Option<Reservation>, StoreError> {
        sqlx::query("SELECT * FROM reservations WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(reservation_from_row)
            .transpose()
    }

    async fn return_slot(&self, ticket_type_id: Uuid, tier_id: Uuid) -> Result<(), StoreError> {
        sqlx::query(
            r"
            UPDATE allocations SET returned = returned + 1
            WHERE ticket_type_id = $1 AND tier_id = $2 AND returned < sold
            ",
        )
        .bind(ticket_type_id)
        .bind(tier_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn insert_order(&self, order: &Order, tickets: &[Ticket]) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r"
            INSERT INTO orders (id, buyer_id, event_id, payment_method, lines, total_amount,
                                payment_status, referral_code, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ",
        )
        .bind(order.id)
        .bind(order.buyer_id)
        .bind(order.event_id)
        .bind(order.payment_method.as_str())
        .bind(Json(&order.lines))
        .bind(order.total_amount)
        .bind(order.payment_status.as_str())
        .bind(&order.referral_code)
        .bind(order.created_at)
        .bind(order.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                StoreError::Duplicate {
                    entity: "order",
                    id: order.id.to_string(),
                }
            } else {
                e.into()
            }
        })?;
        for ticket in tickets {
            insert_ticket_in(&mut tx, ticket).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn order(&self, id: Uuid) -> Result<Option<Order>, StoreError> {
        sqlx::query("SELECT * FROM orders WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(order_from_row)
            .transpose()
    }

    async fn complete_order(
        &self,
        completion: &Completion<'_>,
    ) -> Result<CompletionOutcome, StoreError> {
        let mut tx = self.pool.begin().await?;
        let order = lock_order(&mut tx, completion.order_id).await?;
        if order.payment_status != PaymentStatus::Pending {
            tx.rollback().await?;
            return Ok(CompletionOutcome::AlreadySettled(order.payment_status));
        }

        let reservation_ids: Vec<Uuid> = order.lines.iter().map(|l| l.reservation_id).collect();
        let mut reservations = sqlx::query(
            "SELECT * FROM reservations WHERE id = ANY($1) ORDER BY id FOR UPDATE",
        )
        .bind(&reservation_ids)
        .fetch_all(&mut *tx)
        .await?
        .iter()
        .map(reservation_from_row)
        .collect::<Result<Vec<_>, StoreError>>()?;
        if let Some(missing) = reservation_ids
            .iter()
            .find(|id| !reservations.iter().any(|r| r.id == **id))
        {
            return Err(StoreError::Corrupt(format!("reservation {missing} does not exist")));
        }
        for reservation in &reservations {
            let refused = match reservation.state {
                ReservationState::Committed => None,
                ReservationState::Released => Some(CompletionOutcome::Released {
                    reservation_id: reservation.id,
                }),
                ReservationState::Held if reservation.has_lapsed(completion.now) => {
                    Some(CompletionOutcome::Lapsed {
                        reservation_id: reservation.id,
                        expired_at: reservation.expires_at,
                    })
                }
                ReservationState::Held => None,
            };
            if let Some(outcome) = refused {
                tx.rollback().await?;
                return Ok(outcome);
            }
        }

        // Allocation rows are always locked in key order.
        reservations.sort_by_key(|r| (r.ticket_type_id, r.tier_id));
        for reservation in reservations
            .iter()
            .filter(|r| r.state == ReservationState::Held)
        {
            sqlx::query("UPDATE reservations SET state = $2 WHERE id = $1")
                .bind(reservation.id)
                .bind(ReservationState::Committed.as_str())
                .execute(&mut *tx)
                .await?;
            sqlx::query(
                r"
                UPDATE allocations
                SET held = GREATEST(held - $3, 0), sold = sold + $3
                WHERE ticket_type_id = $1 AND tier_id = $2
                ",
            )
            .bind(reservation.ticket_type_id)
            .bind(reservation.tier_id)
            .bind(db_count(reservation.quantity)?)
            .execute(&mut *tx)
            .await?;
        }

        set_payment_status(&mut tx, order.id, PaymentStatus::Completed, completion.now).await?;
        for ticket in completion.minted {
            insert_ticket_in(&mut tx, ticket).await?;
        }
        for (ticket, version) in completion.activated {
            update_ticket_in(&mut tx, ticket, *version).await?;
        }
        if let Some(code) = &order.referral_code {
            sqlx::query("UPDATE referrals SET conversions = conversions + 1 WHERE code = $1")
                .bind(code)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(CompletionOutcome::Completed)
    }

    async fn fail_order(
        &self,
        order_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<FailOutcome, StoreError> {
        let mut tx = self.pool.begin().await?;
        let order = lock_order(&mut tx, order_id).await?;
        if order.payment_status != PaymentStatus::Pending {
            tx.rollback().await?;
            return Ok(FailOutcome::AlreadySettled(order.payment_status));
        }

        set_payment_status(&mut tx, order_id, PaymentStatus::Failed, now).await?;
        let mut released = sqlx::query(
            r"
            UPDATE reservations SET state = $2
            WHERE order_id = $1 AND state = $3
            RETURNING ticket_type_id, tier_id, quantity
            ",
        )
        .bind(order_id)
        .bind(ReservationState::Released.as_str())
        .bind(ReservationState::Held.as_str())
        .fetch_all(&mut *tx)
        .await?
        .iter()
        .map(|row| {
            Ok((
                row.try_get::<Uuid, _>("ticket_type_id")?,
                row.try_get::<Uuid, _>("tier_id")?,
                row.try_get::<i32, _>("quantity")?,
            ))
        })
        .collect::<Result<Vec<_>, StoreError>>()?;
        released.sort_unstable();
        for (ticket_type_id, tier_id, quantity) in released {
            sqlx::query(
                r"
                UPDATE allocations
                SET held = GREATEST(held - $3, 0)
                WHERE ticket_type_id = $1 AND tier_id = $2
                ",
            )
            .bind(ticket_type_id)
            .bind(tier_id)
            .bind(quantity)
            .execute(&mut *tx)
            .await?;
        }
        sqlx::query(
            r"
            UPDATE tickets
            SET status = $2, updated_at = $3, version = version + 1
            WHERE order_id = $1 AND status = $4
            ",
        )
        .bind(order_id)
        .bind(TicketStatus::Expired.as_str())
        .bind(now)
        .bind(TicketStatus::PendingPayment.as_str())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(FailOutcome::Failed)
    }

    async fn ticket(&self, id: Uuid) -> Result<Option<Ticket>, StoreError> {
        sqlx::query(&format!("SELECT {TICKET_COLUMNS} FROM tickets WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(ticket_from_row)
            .transpose()
    }

    async fn tickets_for_order(&self, order_id: Uuid) -> Result<Vec<Ticket>, StoreError> {
        sqlx::query(&format!(
            "SELECT {TICKET_COLUMNS} FROM tickets WHERE order_id = $1 ORDER BY purchased_at, id"
        ))
        .bind(order_id)
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(ticket_from_row)
        .collect()
    }

    async fn tickets_owned_by(&self, user_id: Uuid) -> Result<Vec<Ticket>, StoreError> {
        sqlx::query(&format!(
            "SELECT {TICKET_COLUMNS} FROM tickets WHERE owner_id = $1 ORDER BY purchased_at, id"
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(ticket_from_row)
        .collect()
    }

    async fn update_ticket(
        &self,
        ticket: &Ticket,
        expected_version: i64,
    ) -> Result<Ticket, StoreError> {
        let mut tx = self.pool.begin().await?;
        let stored = update_ticket_in(&mut tx, ticket, expected_version).await?;
        tx.commit().await?;
        Ok(stored)
    }

    async fn transfer_ticket(
        &self,
        ticket: &Ticket,
        expected_version: i64,
        record: &OwnershipRecord,
    ) -> Result<Ticket, StoreError> {
        let mut tx = self.pool.begin().await?;
        let stored = update_ticket_in(&mut tx, ticket, expected_version).await?;
        sqlx::query(
            r"
            INSERT INTO ownership_records (id, ticket_id, from_user_id, to_user_id, channel, transferred_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ",
        )
        .bind(record.id)
        .bind(record.ticket_id)
        .bind(record.from_user_id)
        .bind(record.to_user_id)
        .bind(record.channel.as_str())
        .bind(record.transferred_at)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(stored)
    }

    async fn ownership_history(&self, ticket_id: Uuid) -> Result<Vec<OwnershipRecord>, StoreError> {
        sqlx::query("SELECT * FROM ownership_records WHERE ticket_id = $1 ORDER BY transferred_at")
            .bind(ticket_id)
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(ownership_from_row)
            .collect()
    }

    async fn tickets_transferred_from(&self, user_id: Uuid) -> Result<Vec<Ticket>, StoreError> {
        sqlx::query(
            r"
            SELECT t.*
            FROM tickets t
            WHERE t.owner_id <> $1
              AND EXISTS (
                  SELECT 1 FROM ownership_records o
                  WHERE o.ticket_id = t.id AND o.from_user_id = $1
              )
            ORDER BY t.id
            ",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(ticket_from_row)
        .collect()
    }

    async fn insert_referral(&self, referral: &Referral) -> Result<(), StoreError> {
        sqlx::query(
            r"
            INSERT INTO referrals (id, vendor_id, event_id, code, clicks, conversions, created_at)
            VALUES ($1, $2, $3, $4, 0, 0, $5)
            ",
        )
        .bind(referral.id)
        .bind(referral.vendor_id)
        .bind(referral.event_id)
        .bind(&referral.code)
        .bind(referral.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                StoreError::Duplicate {
                    entity: "referral",
                    id: referral.code.clone(),
                }
            } else {
                e.into()
            }
        })?;
        Ok(())
    }

    async fn referral_by_code(&self, code: &str) -> Result<Option<Referral>, StoreError> {
        sqlx::query("SELECT * FROM referrals WHERE code = $1")
            .bind(code)
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(referral_from_row)
            .transpose()
    }

    async fn record_referral_click(&self, code: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("UPDATE referrals SET clicks = clicks + 1 WHERE code = $1")
            .bind(code)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn record_referral_conversion(&self, code: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("UPDATE referrals SET conversions = conversions + 1 WHERE code = $1")
            .bind(code)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }
}

async fn update_ticket_in(
    tx: &mut Transaction<'_, Postgres>,
    ticket: &Ticket,
    expected_version: i64,
) -> Result<Ticket, StoreError> {
    let row = sqlx::query(&format!(
        r"
        UPDATE tickets
        SET owner_id = $3, qr_payload = $4, status = $5, payment_due_at = $6,
            scanned_at = $7, validated_by = $8, updated_at = $9, version = version + 1
        WHERE id = $1 AND version = $2
        RETURNING {TICKET_COLUMNS}
        "
    ))
    .bind(ticket.id)
    .bind(expected_version)
    .bind(ticket.owner_id)
    .bind(&ticket.qr_payload)
    .bind(ticket.status.as_str())
    .bind(ticket.payment_due_at)
    .bind(ticket.scanned_at)
    .bind(&ticket.validated_by)
    .bind(ticket.updated_at)
    .fetch_optional(&mut **tx)
    .await?;

    match row {
        Some(row) => ticket_from_row(&row),
        None => {
            let exists = sqlx::query("SELECT 1 FROM tickets WHERE id = $1")
                .bind(ticket.id)
                .fetch_optional(&mut **tx)
                .await?
                .is_some();
            Err(if exists {
                StoreError::Conflict {
                    entity: "ticket",
                    id: ticket.id,
                }
            } else {
                StoreError::Corrupt(format!("ticket {} does not exist", ticket.id))
            })
        }
    }
}

async fn lock_order(tx: &mut Transaction<'_, Postgres>, order_id: Uuid) -> Result<Order, StoreError> {
    let row = sqlx::query("SELECT * FROM orders WHERE id = $1 FOR UPDATE")
        .bind(order_id)
        .fetch_optional(&mut **tx)
        .await?
        .ok_or_else(|| StoreError::Corrupt(format!("order {order_id} does not exist")))?;
    order_from_row(&row)
}

async fn set_payment_status(
    tx: &mut Transaction<'_, Postgres>,
    order_id: Uuid,
    status: PaymentStatus,
    now: DateTime<Utc>,
) -> Result<(), StoreError> {
    sqlx::query("UPDATE orders SET payment_status = $2, updated_at = $3 WHERE id = $1")
        .bind(order_id)
        .bind(status.as_str())
        .bind(now)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

async fn insert_ticket_in(tx: &mut Transaction<'_, Postgres>, ticket: &Ticket) -> Result<(), StoreError> {
    sqlx::query(&format!(
        "INSERT INTO tickets ({TICKET_COLUMNS}) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)"
    ))
    .bind(ticket.id)
    .bind(ticket.order_id)
    .bind(ticket.event_id)
    .bind(ticket.ticket_type_id)
    .bind(ticket.tier_id)
    .bind(ticket.reservation_id)
    .bind(ticket.owner_id)
    .bind(ticket.price_paid)
    .bind(&ticket.qr_payload)
    .bind(ticket.status.as_str())
    .bind(ticket.purchased_at)
    .bind(ticket.expires_at)
    .bind(ticket.payment_due_at)
    .bind(ticket.scanned_at)
    .bind(&ticket.validated_by)
    .bind(ticket.version)
    .bind(ticket.updated_at)
    .execute(&mut **tx)
    .await
    .map_err(|e| {
        if is_unique_violation(&e) {
            StoreError::Duplicate {
                entity: "ticket",
                id: ticket.id.to_string(),
            }
        } else {
            e.into()
        }
    })?;
    Ok(())
}
