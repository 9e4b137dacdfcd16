mod common;

use assert_matches::assert_matches;
use chrono::{Duration, Utc};
use common::TestApp;
use futures::future::join_all;
use marketplace_api::{
    db::{OrderFilter, OrderQuery, OrderSortField, SortDirection},
    entities::{checkout_session, order, OrderStatus, SessionStatus},
    errors::ServiceError,
};
use rust_decimal_macros::dec;
use sea_orm::{sea_query::Expr, ColumnTrait, EntityTrait, PaginatorTrait, QueryFilter};

#[tokio::test]
async fn confirm_creates_order_matching_the_session() {
    let app = TestApp::new().await;
    let mug = app.seed_variant("MUG-10", dec!(100), 10).await;
    let tee = app.seed_variant("TEE-10", dec!(200), 4).await;
    let details = app.guest_session("guest-10", &[(mug.id, 3), (tee.id, 2)]).await;

    let confirmed = app
        .state
        .services
        .orders
        .confirm_session(&details.session.external_id)
        .await
        .expect("confirm");

    assert!(confirmed.external_id.starts_with("ord_"));
    assert!(confirmed.invoice_number.starts_with("INV-"));
    assert_eq!(confirmed.checkout_session_id, details.session.id);
    assert_eq!(confirmed.total, details.session.total);
    assert_eq!(confirmed.currency, "USD");

    let order = app
        .state
        .services
        .orders
        .get_order(confirmed.order_id)
        .await
        .expect("load order");
    assert_eq!(order.order.status, OrderStatus::PendingPayment);
    assert_eq!(order.order.subtotal, dec!(700));
    assert_eq!(order.items.len(), 2);
    assert_eq!(order.items[0].variant_id, mug.id);
    assert_eq!(order.items[0].quantity, 3);
    assert!(order.payments.is_empty());

    assert_eq!(app.stock_of(mug.id).await, 7);
    assert_eq!(app.stock_of(tee.id).await, 2);

    let session = app
        .state
        .services
        .checkout_sessions
        .get_session(&details.session.external_id)
        .await
        .expect("reload session");
    assert!(session.session.confirmed_at.is_some());
    assert_eq!(session.session.status, SessionStatus::Pending);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_confirms_of_one_session_create_one_order() {
    let app = TestApp::with_pool_size(4).await;
    let mug = app.seed_variant("MUG-11", dec!(100), 10).await;
    let details = app.guest_session("guest-11", &[(mug.id, 2)]).await;
    let external_id = details.session.external_id.clone();

    let orders = app.state.services.orders.clone();
    let attempts: Vec<_> = join_all((0..5).map(|_| {
        let orders = orders.clone();
        let external_id = external_id.clone();
        tokio::spawn(async move { orders.confirm_session(&external_id).await })
    }))
    .await
    .into_iter()
    .map(|joined| joined.expect("confirm task panicked"))
    .collect();

    let succeeded = attempts.iter().filter(|r| r.is_ok()).count();
    assert_eq!(succeeded, 1);
    for result in attempts.iter().filter(|r| r.is_err()) {
        assert_matches!(result, Err(ServiceError::AlreadyConfirmed(_)));
    }

    let count = order::Entity::find()
        .filter(order::Column::CheckoutSessionId.eq(details.session.id))
        .count(app.db())
        .await
        .expect("count orders");
    assert_eq!(count, 1);
    assert_eq!(app.stock_of(mug.id).await, 8);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stock_never_goes_negative_under_contention() {
    let app = TestApp::with_pool_size(4).await;
    let mug = app.seed_variant("MUG-12", dec!(100), 3).await;

    let mut sessions = Vec::new();
    for i in 0..6 {
        let details = app.guest_session(&format!("buyer-{}", i), &[(mug.id, 1)]).await;
        sessions.push(details.session.external_id);
    }

    let orders = app.state.services.orders.clone();
    let attempts: Vec<_> = join_all(sessions.into_iter().map(|external_id| {
        let orders = orders.clone();
        tokio::spawn(async move { orders.confirm_session(&external_id).await })
    }))
    .await
    .into_iter()
    .map(|joined| joined.expect("confirm task panicked"))
    .collect();

    let succeeded = attempts.iter().filter(|r| r.is_ok()).count();
    assert_eq!(succeeded, 3);
    for result in attempts.iter().filter(|r| r.is_err()) {
        assert_matches!(result, Err(ServiceError::InsufficientStock(_)));
    }
    assert_eq!(app.stock_of(mug.id).await, 0);

    // Losers get their claim back and stay pending.
    let released = checkout_session::Entity::find()
        .filter(checkout_session::Column::ConfirmedAt.is_null())
        .filter(checkout_session::Column::Status.eq(SessionStatus::Pending))
        .count(app.db())
        .await
        .expect("count released sessions");
    assert_eq!(released, 3);
}

#[tokio::test]
async fn multi_item_confirmation_is_all_or_nothing() {
    let app = TestApp::new().await;
    let mug = app.seed_variant("MUG-13", dec!(100), 5).await;
    let tee = app.seed_variant("TEE-13", dec!(100), 1).await;
    let details = app.guest_session("guest-13", &[(mug.id, 2), (tee.id, 1)]).await;

    // Someone else buys the last tee first.
    let rival = app.guest_session("rival-13", &[(tee.id, 1)]).await;
    app.state
        .services
        .orders
        .confirm_session(&rival.session.external_id)
        .await
        .expect("rival confirm");

    let result = app
        .state
        .services
        .orders
        .confirm_session(&details.session.external_id)
        .await;
    assert_matches!(result, Err(ServiceError::InsufficientStock(_)));
    assert_eq!(app.stock_of(mug.id).await, 5);
    assert_eq!(app.stock_of(tee.id).await, 0);

    let session = app
        .state
        .services
        .checkout_sessions
        .get_session(&details.session.external_id)
        .await
        .expect("reload session");
    assert!(session.session.confirmed_at.is_none());
}

#[tokio::test]
async fn expired_session_cannot_be_confirmed() {
    let app = TestApp::new().await;
    let mug = app.seed_variant("MUG-14", dec!(100), 5).await;
    let details = app.guest_session("guest-14", &[(mug.id, 1)]).await;

    checkout_session::Entity::update_many()
        .col_expr(
            checkout_session::Column::ExpiresAt,
            Expr::value(Utc::now() - Duration::minutes(1)),
        )
        .filter(checkout_session::Column::Id.eq(details.session.id))
        .exec(app.db())
        .await
        .expect("backdate session");

    let result = app
        .state
        .services
        .orders
        .confirm_session(&details.session.external_id)
        .await;
    assert_matches!(result, Err(ServiceError::SessionNotPending(_)));
    assert_eq!(app.stock_of(mug.id).await, 5);
}

#[tokio::test]
async fn admin_cancellation_restocks_unpaid_orders() {
    let app = TestApp::new().await;
    let mug = app.seed_variant("MUG-15", dec!(100), 5).await;
    let details = app.guest_session("guest-15", &[(mug.id, 2)]).await;
    let orders = &app.state.services.orders;
    let confirmed = orders
        .confirm_session(&details.session.external_id)
        .await
        .expect("confirm");
    assert_eq!(app.stock_of(mug.id).await, 3);

    let cancelled = orders
        .update_order_status(confirmed.order_id, OrderStatus::Cancelled)
        .await
        .expect("cancel");
    assert_eq!(cancelled.order.status, OrderStatus::Cancelled);
    assert_eq!(app.stock_of(mug.id).await, 5);

    let session = app
        .state
        .services
        .checkout_sessions
        .get_session(&details.session.external_id)
        .await
        .expect("reload session");
    assert_eq!(session.session.status, SessionStatus::Cancelled);

    // Repeating the same status is a no-op and does not restock twice.
    orders
        .update_order_status(confirmed.order_id, OrderStatus::Cancelled)
        .await
        .expect("repeat cancel");
    assert_eq!(app.stock_of(mug.id).await, 5);

    assert_matches!(
        orders
            .update_order_status(confirmed.order_id, OrderStatus::Paid)
            .await,
        Err(ServiceError::InvalidStatusTransition {
            from: OrderStatus::Cancelled,
            to: OrderStatus::Paid
        })
    );
}

#[tokio::test]
async fn list_orders_filters_sorts_and_paginates() {
    let app = TestApp::new().await;
    let mug = app.seed_variant("MUG-16", dec!(100), 50).await;
    let orders = &app.state.services.orders;

    let mut ids = Vec::new();
    for qty in 1..=3 {
        let details = app.guest_session(&format!("lister-{}", qty), &[(mug.id, qty)]).await;
        let confirmed = orders
            .confirm_session(&details.session.external_id)
            .await
            .expect("confirm");
        ids.push(confirmed.order_id);
    }
    orders
        .update_order_status(ids[0], OrderStatus::Cancelled)
        .await
        .expect("cancel first");

    let pending = orders
        .list_orders(&OrderQuery {
            filter: OrderFilter {
                status: Some(OrderStatus::PendingPayment),
                ..Default::default()
            },
            sort: OrderSortField::Total,
            direction: SortDirection::Desc,
            page: 1,
            limit: 1,
        })
        .await
        .expect("list");
    assert_eq!(pending.total, 2);
    assert_eq!(pending.orders.len(), 1);
    assert_eq!(pending.orders[0].id, ids[2]);

    let second_page = orders
        .list_orders(&OrderQuery {
            filter: OrderFilter {
                status: Some(OrderStatus::PendingPayment),
                ..Default::default()
            },
            sort: OrderSortField::Total,
            direction: SortDirection::Desc,
            page: 2,
            limit: 1,
        })
        .await
        .expect("list page 2");
    assert_eq!(second_page.orders[0].id, ids[1]);

    let everything = orders.list_orders(&OrderQuery::default()).await.expect("list all");
    assert_eq!(everything.total, 3);
}

#[tokio::test]
async fn unknown_order_is_not_found() {
    let app = TestApp::new().await;
    assert_matches!(
        app.state
            .services
            .orders
            .get_order_by_external_id("ord_missing")
            .await,
        Err(ServiceError::OrderNotFound(_))
    );
}
