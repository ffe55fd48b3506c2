//! Orders and payment callbacks.
//!
//! Placing an order freezes each line at the price of the tier active at
//! that moment and holds its inventory. Card orders wait for the provider
//! callback; cash and bank transfer orders get `PENDING_PAYMENT` tickets
//! straight away and a long hold.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::models::{
    Event, Order, OrderLine, PaymentMethod, PaymentStatus, PricedLine, Reservation, Ticket,
    TicketStatus, Tier,
};
use crate::store::{Completion, CompletionOutcome, FailOutcome, Store, StoreError};
use crate::ticketing::catalog::MAX_QUANTITY;
use crate::ticketing::error::TicketingError;
use crate::ticketing::inventory::InventoryLedger;
use crate::ticketing::lifecycle::{TicketLifecycle, MAX_CAS_ATTEMPTS};
use crate::ticketing::notify::Notifier;
use crate::ticketing::payment::PaymentProvider;
use crate::ticketing::pricing::PricingTierResolver;

/// How long inventory stays held while a payment is outstanding.
#[derive(Debug, Clone, Copy)]
pub struct HoldWindows {
    pub online: Duration,
    pub offline: Duration,
}

impl Default for HoldWindows {
    fn default() -> Self {
        Self {
            online: Duration::minutes(15),
            offline: Duration::days(7),
        }
    }
}

impl HoldWindows {
    pub fn for_method(&self, method: PaymentMethod) -> Duration {
        if method.is_offline() {
            self.offline
        } else {
            self.online
        }
    }
}

#[derive(Debug, Clone)]
pub struct OrderRequest {
    pub event_id: Uuid,
    pub payment_method: PaymentMethod,
    pub lines: Vec<OrderLine>,
    pub referral_code: Option<String>,
    pub access_token: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PlacedOrder {
    pub order: Order,
    /// Card orders only: where to send the buyer to pay.
    pub redirect_url: Option<String>,
    pub hold_expires_at: DateTime<Utc>,
    /// Offline orders only: the `PENDING_PAYMENT` tickets.
    pub tickets: Vec<Ticket>,
}

#[derive(Clone)]
pub struct OrderDesk {
    store: Arc<dyn Store>,
    ledger: InventoryLedger,
    resolver: PricingTierResolver,
    lifecycle: TicketLifecycle,
    payments: Arc<dyn PaymentProvider>,
    notifier: Arc<dyn Notifier>,
    windows: HoldWindows,
}

impl OrderDesk {
    pub fn new(
        store: Arc<dyn Store>,
        ledger: InventoryLedger,
        resolver: PricingTierResolver,
        lifecycle: TicketLifecycle,
        payments: Arc<dyn PaymentProvider>,
        notifier: Arc<dyn Notifier>,
        windows: HoldWindows,
    ) -> Self {
        Self {
            store,
            ledger,
            resolver,
            lifecycle,
            payments,
            notifier,
            windows,
        }
    }

    pub async fn place_order(
        &self,
        buyer_id: Uuid,
        request: OrderRequest,
        now: DateTime<Utc>,
    ) -> Result<PlacedOrder, TicketingError> {
        check_lines(&request.lines)?;
        if self.store.user(buyer_id).await?.is_none() {
            return Err(TicketingError::not_found("user", buyer_id));
        }
        let event = self
            .store
            .event(request.event_id)
            .await?
            .ok_or_else(|| TicketingError::not_found("event", request.event_id))?;
        if !event.grants_access(request.access_token.as_deref()) {
            return Err(TicketingError::PrivateEvent(event.id));
        }

        let tier = self.resolver.resolve_active_tier(&event, now)?;
        let order_id = Uuid::new_v4();
        let hold_expires_at = now + self.windows.for_method(request.payment_method);

        let mut held: Vec<Reservation> = Vec::with_capacity(request.lines.len());
        let mut lines = Vec::with_capacity(request.lines.len());
        for line in &request.lines {
            let priced = match self
                .hold_line(&event, tier, order_id, line, hold_expires_at, now)
                .await
            {
                Ok(priced) => priced,
                Err(e) => {
                    self.release_all(held.iter().map(|r| r.id)).await;
                    return Err(e);
                }
            };
            held.push(priced.0);
            lines.push(priced.1);
        }

        let referral_code = match request.referral_code {
            Some(code) => self.accept_referral(code, event.id).await?,
            None => None,
        };
        let total_amount: Decimal = lines.iter().map(PricedLine::subtotal).sum();
        let order = Order {
            id: order_id,
            buyer_id,
            event_id: event.id,
            payment_method: request.payment_method,
            lines,
            total_amount,
            payment_status: PaymentStatus::Pending,
            referral_code,
            created_at: now,
            updated_at: now,
        };

        let tickets: Vec<Ticket> = if request.payment_method.is_offline() {
            order
                .lines
                .iter()
                .flat_map(|line| self.lifecycle.mint(&order, line, now, Some(hold_expires_at)))
                .collect()
        } else {
            Vec::new()
        };
        if let Err(e) = self.store.insert_order(&order, &tickets).await {
            self.release_all(held.iter().map(|r| r.id)).await;
            return Err(e.into());
        }

        let redirect_url = if request.payment_method.is_offline() {
            None
        } else {
            match self.payments.create_payment_intent(&order).await {
                Ok(url) => Some(url),
                Err(e) => {
                    error!(%order_id, error = %e, "Payment intent failed, abandoning order");
                    self.fail_payment(order_id, now).await?;
                    return Err(e);
                }
            }
        };

        info!(
            %order_id,
            %buyer_id,
            event_id = %order.event_id,
            method = order.payment_method.as_str(),
            total = %order.total_amount,
            "Order placed"
        );
        Ok(PlacedOrder {
            order,
            redirect_url,
            hold_expires_at,
            tickets,
        })
    }

    async fn hold_line(
        &self,
        event: &Event,
        tier: Option<&Tier>,
        order_id: Uuid,
        line: &OrderLine,
        hold_expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(Reservation, PricedLine), TicketingError> {
        if event.ticket_type(line.ticket_type_id).is_none() {
            return Err(TicketingError::not_found("ticket type", line.ticket_type_id));
        }
        let out_of_stock = || TicketingError::OutOfStock {
            ticket_type_id: line.ticket_type_id,
            tier_id: tier.map(|t| t.id),
            requested: line.quantity,
            available: 0,
        };
        let tier = tier.ok_or_else(out_of_stock)?;
        let allocation = tier
            .allocation_for(line.ticket_type_id)
            .ok_or_else(out_of_stock)?;

        let reservation = self
            .ledger
            .reserve(
                order_id,
                line.ticket_type_id,
                tier.id,
                line.quantity,
                hold_expires_at,
                now,
            )
            .await?;
        let priced = PricedLine {
            ticket_type_id: line.ticket_type_id,
            tier_id: tier.id,
            quantity: line.quantity,
            unit_price: allocation.price,
            reservation_id: reservation.id,
        };
        Ok((reservation, priced))
    }

    async fn accept_referral(
        &self,
        code: String,
        event_id: Uuid,
    ) -> Result<Option<String>, TicketingError> {
        match self.store.referral_by_code(code.trim()).await? {
            Some(referral) if referral.event_id == event_id => Ok(Some(referral.code)),
            _ => {
                warn!(code = %code, %event_id, "Dropping unknown referral code");
                Ok(None)
            }
        }
    }

    async fn release_all(&self, reservation_ids: impl Iterator<Item = Uuid>) {
        for id in reservation_ids {
            if let Err(e) = self.ledger.release(id).await {
                error!(reservation_id = %id, error = %e, "Failed to release hold");
            }
        }
    }

    async fn fetch(&self, order_id: Uuid) -> Result<Order, TicketingError> {
        self.store
            .order(order_id)
            .await?
            .ok_or_else(|| TicketingError::not_found("order", order_id))
    }

    /// Provider callback for a successful payment. Repeating it is harmless,
    /// and it never interleaves with [`Self::fail_payment`]: whichever
    /// settles the order first wins.
    pub async fn confirm_payment(
        &self,
        order_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Vec<Ticket>, TicketingError> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let order = self.fetch(order_id).await?;
            match order.payment_status {
                PaymentStatus::Completed => {
                    return Ok(self.store.tickets_for_order(order_id).await?)
                }
                PaymentStatus::Failed => return Err(refused("confirm payment", PaymentStatus::Failed)),
                PaymentStatus::Pending => {}
            }

            let (minted, activated) = if order.payment_method.is_offline() {
                let mut activated = Vec::new();
                for pending in self.store.tickets_for_order(order_id).await? {
                    if pending.status == TicketStatus::PendingPayment {
                        activated.push(self.lifecycle.prepare_activation(&pending, now)?);
                    }
                }
                (Vec::new(), activated)
            } else {
                let minted: Vec<Ticket> = order
                    .lines
                    .iter()
                    .flat_map(|line| self.lifecycle.mint(&order, line, now, None))
                    .collect();
                (minted, Vec::new())
            };

            let completion = Completion {
                order_id,
                minted: &minted,
                activated: &activated,
                now,
            };
            match self.store.complete_order(&completion).await {
                Ok(CompletionOutcome::Completed) => {
                    let tickets = self.store.tickets_for_order(order_id).await?;
                    for ticket in &tickets {
                        self.notifier.ticket_issued(ticket).await;
                    }
                    info!(%order_id, tickets = tickets.len(), "Payment confirmed");
                    return Ok(tickets);
                }
                // Settled or touched concurrently; re-read and report that.
                Ok(CompletionOutcome::AlreadySettled(_)) | Err(StoreError::Conflict { .. }) => {
                    debug!(%order_id, "Order changed under confirmation, re-reading");
                    continue;
                }
                Ok(CompletionOutcome::Lapsed {
                    reservation_id,
                    expired_at,
                }) => {
                    warn!(%order_id, %reservation_id, %expired_at, "Hold lapsed before payment");
                    self.fail_payment(order_id, now).await?;
                    return Err(TicketingError::ExpiredWindow {
                        window: "payment",
                        deadline: expired_at,
                    });
                }
                Ok(CompletionOutcome::Released { reservation_id }) => {
                    warn!(%order_id, %reservation_id, "Hold was released before payment");
                    self.fail_payment(order_id, now).await?;
                    return Err(TicketingError::InvalidState {
                        action: "confirm payment",
                        current: "hold already released".to_string(),
                    });
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(StoreError::Conflict {
            entity: "order",
            id: order_id,
        }
        .into())
    }

    /// Provider callback for a failed payment: holds go back to the pool and
    /// pending tickets expire, together with the order.
    pub async fn fail_payment(
        &self,
        order_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Order, TicketingError> {
        self.fetch(order_id).await?;
        match self.store.fail_order(order_id, now).await? {
            FailOutcome::Failed => info!(%order_id, "Order failed"),
            FailOutcome::AlreadySettled(PaymentStatus::Completed) => {
                return Err(refused("fail payment", PaymentStatus::Completed))
            }
            FailOutcome::AlreadySettled(_) => {}
        }
        self.fetch(order_id).await
    }

    /// Fails every order with a hold past its window. Returns how many orders were failed.
    pub async fn sweep_expired(&self, now: DateTime<Utc>) -> Result<usize, TicketingError> {
        let order_ids: BTreeSet<Uuid> = self
            .ledger
            .lapsed(now)
            .await?
            .into_iter()
            .map(|r| r.order_id)
            .collect();

        let mut failed = 0;
        for order_id in order_ids {
            match self.fail_payment(order_id, now).await {
                Ok(_) => failed += 1,
                Err(e) if e.is_infrastructure() => return Err(e),
                Err(e) => warn!(%order_id, error = %e, "Skipping lapsed order"),
            }
        }
        if failed > 0 {
            info!(failed, "Swept lapsed orders");
        }
        Ok(failed)
    }
}

fn refused(action: &'static str, status: PaymentStatus) -> TicketingError {
    TicketingError::InvalidState {
        action,
        current: status.as_str().to_string(),
    }
}

fn check_lines(lines: &[OrderLine]) -> Result<(), TicketingError> {
    if lines.is_empty() {
        return Err(TicketingError::InvalidInput(
            "an order needs at least one line".to_string(),
        ));
    }
    let mut seen = BTreeSet::new();
    for line in lines {
        if line.quantity == 0 {
            return Err(TicketingError::InvalidInput(
                "line quantity must be positive".to_string(),
            ));
        }
        if line.quantity > MAX_QUANTITY {
            return Err(TicketingError::InvalidInput(format!(
                "line quantity must not exceed {MAX_QUANTITY}"
            )));
        }
        if !seen.insert(line.ticket_type_id) {
            return Err(TicketingError::InvalidInput(format!(
                "ticket type {} appears on more than one line",
                line.ticket_type_id
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hold_windows_by_method() {
        let windows = HoldWindows::default();
        assert_eq!(windows.for_method(PaymentMethod::Card), Duration::minutes(15));
        assert_eq!(windows.for_method(PaymentMethod::Cash), Duration::days(7));
        assert_eq!(windows.for_method(PaymentMethod::BankTransfer), Duration::days(7));
    }

    #[test]
    fn test_check_lines() {
        assert!(check_lines(&[]).is_err());
        let tt = Uuid::new_v4();
        assert!(check_lines(&[OrderLine { ticket_type_id: tt, quantity: 0 }]).is_err());
        assert!(check_lines(&[
            OrderLine { ticket_type_id: tt, quantity: 1 },
            OrderLine { ticket_type_id: tt, quantity: 2 },
        ])
        .is_err());
        assert!(check_lines(&[OrderLine { ticket_type_id: tt, quantity: u32::MAX }]).is_err());
        assert!(check_lines(&[OrderLine { ticket_type_id: tt, quantity: 2 }]).is_ok());
    }
}
