mod common;

use std::sync::Arc;

use boxoffice_server::models::{PaymentMethod, PaymentStatus, TicketStatus};
use boxoffice_server::store::Store;
use boxoffice_server::ticketing::{RejectReason, TicketingError};
use common::{app, TestApp};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_buyers_never_oversell() {
    const POOL: u32 = 5;
    const BUYERS: usize = 24;

    let app = Arc::new(app());
    let organizer = app.user("Org").await;
    let event = app.simple_event(&organizer, POOL).await;

    let mut buyers = Vec::with_capacity(BUYERS);
    for i in 0..BUYERS {
        buyers.push(app.user(&format!("buyer{i}")).await);
    }

    let handles: Vec<_> = buyers
        .into_iter()
        .map(|buyer| {
            let app = app.clone();
            let request = TestApp::order(&event, PaymentMethod::Card, 1);
            tokio::spawn(async move { app.boxoffice.place_order(buyer.id, request).await })
        })
        .collect();

    let mut placed = 0;
    let mut sold_out = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => placed += 1,
            Err(TicketingError::OutOfStock { .. }) => sold_out += 1,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(placed, POOL as usize);
    assert_eq!(sold_out, BUYERS - POOL as usize);

    let usage = app.store.usage_for_event(event.id).await.unwrap();
    assert_eq!(usage[0].held, POOL);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_scans_admit_once() {
    let app = Arc::new(app());
    let organizer = app.user("Org").await;
    let buyer = app.user("Buyer").await;
    let event = app.simple_event(&organizer, 3).await;
    let ticket = app.buy(&buyer, &event, 1).await.remove(0);
    let qr = ticket.qr_payload.clone().unwrap();

    let handles: Vec<_> = (0..16)
        .map(|gate| {
            let app = app.clone();
            let qr = qr.clone();
            tokio::spawn(async move { app.boxoffice.validate(&qr, &format!("gate-{gate}")).await })
        })
        .collect();

    let mut admitted = 0;
    for handle in handles {
        let outcome = handle.await.unwrap().unwrap();
        if outcome.valid {
            admitted += 1;
        } else {
            assert_eq!(outcome.reason, Some(RejectReason::AlreadyUsed));
        }
    }
    assert_eq!(admitted, 1);

    let stored = app.store.ticket(ticket.id).await.unwrap().unwrap();
    assert_eq!(stored.status, TicketStatus::Used);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_duplicate_payment_callbacks_mint_once() {
    let app = Arc::new(app());
    let organizer = app.user("Org").await;
    let buyer = app.user("Buyer").await;
    let event = app.simple_event(&organizer, 10).await;
    let placed = app
        .boxoffice
        .place_order(buyer.id, TestApp::order(&event, PaymentMethod::Card, 3))
        .await
        .unwrap();

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let app = app.clone();
            let order_id = placed.order.id;
            tokio::spawn(async move { app.boxoffice.confirm_payment(order_id).await })
        })
        .collect();
    for handle in handles {
        assert_eq!(handle.await.unwrap().unwrap().len(), 3);
    }

    let tickets = app.store.tickets_for_order(placed.order.id).await.unwrap();
    assert_eq!(tickets.len(), 3);
    let usage = app.store.usage_for_event(event.id).await.unwrap();
    assert_eq!((usage[0].held, usage[0].sold), (0, 3));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_racing_confirm_and_fail_settle_one_way() {
    for method in [PaymentMethod::Card, PaymentMethod::Cash] {
        for _ in 0..20 {
            let app = Arc::new(app());
            let organizer = app.user("Org").await;
            let buyer = app.user("Buyer").await;
            let event = app.simple_event(&organizer, 10).await;
            let placed = app
                .boxoffice
                .place_order(buyer.id, TestApp::order(&event, method, 3))
                .await
                .unwrap();
            let order_id = placed.order.id;

            let confirm = {
                let app = app.clone();
                tokio::spawn(async move { app.boxoffice.confirm_payment(order_id).await })
            };
            let fail = {
                let app = app.clone();
                tokio::spawn(async move { app.boxoffice.fail_payment(order_id).await })
            };
            let confirmed = confirm.await.unwrap();
            let failed = fail.await.unwrap();
            // Exactly one callback wins; the other is refused.
            assert_ne!(confirmed.is_ok(), failed.is_ok());

            let order = app.store.order(order_id).await.unwrap().unwrap();
            let tickets = app.store.tickets_for_order(order_id).await.unwrap();
            let usage = app.store.usage_for_event(event.id).await.unwrap();
            assert_eq!(usage[0].held, 0);
            match order.payment_status {
                PaymentStatus::Completed => {
                    assert!(confirmed.is_ok());
                    assert_eq!(usage[0].sold, 3);
                    assert_eq!(tickets.len(), 3);
                    assert!(tickets.iter().all(|t| t.status == TicketStatus::Active));
                }
                PaymentStatus::Failed => {
                    assert!(matches!(confirmed, Err(TicketingError::InvalidState { .. })));
                    assert_eq!(usage[0].sold, 0);
                    assert!(tickets.iter().all(|t| t.status == TicketStatus::Expired));
                }
                PaymentStatus::Pending => panic!("order {order_id} left pending"),
            }
        }
    }
}
