mod common;

use assert_matches::assert_matches;
use chrono::Utc;
use common::TestApp;
use marketplace_api::{
    entities::SessionStatus,
    errors::ServiceError,
    services::{
        checkout_sessions::{CartItemInput, CreateSessionInput},
        pricing::Discount,
    },
};
use rust_decimal_macros::dec;
use uuid::Uuid;

#[tokio::test]
async fn create_session_snapshots_items_and_prices_without_shipping() {
    let app = TestApp::new().await;
    let mug = app.seed_variant("MUG-1", dec!(100), 10).await;
    let tee = app.seed_variant("TEE-1", dec!(200), 5).await;

    let details = app.guest_session("guest-1", &[(mug.id, 2), (tee.id, 1)]).await;

    assert!(details.session.external_id.starts_with("cs_"));
    assert_eq!(details.session.status, SessionStatus::Pending);
    assert_eq!(details.session.guest_id.as_deref(), Some("guest-1"));
    assert!(details.session.user_id.is_none());
    assert!(details.session.expires_at > Utc::now());
    assert_eq!(details.items.len(), 2);
    assert_eq!(details.items[0].variant_id, mug.id);
    assert_eq!(details.items[0].product_name, "Product MUG-1");
    assert_eq!(details.items[0].subtotal, dec!(200));

    let pricing = details.pricing();
    assert_eq!(pricing.subtotal, dec!(400));
    assert_eq!(pricing.tax, dec!(44));
    assert_eq!(pricing.shipping_fee, dec!(0));
    assert_eq!(pricing.total, dec!(444));

    // Creation never reserves stock.
    assert_eq!(app.stock_of(mug.id).await, 10);
}

#[tokio::test]
async fn snapshots_survive_catalog_price_changes() {
    use sea_orm::{ActiveModelTrait, Set};

    let app = TestApp::new().await;
    let mug = app.seed_variant("MUG-2", dec!(100), 10).await;
    let details = app.guest_session("guest-2", &[(mug.id, 1)]).await;

    let mut active: marketplace_api::entities::variant::ActiveModel = mug.clone().into();
    active.price = Set(dec!(300));
    active.update(app.db()).await.expect("reprice variant");

    let reloaded = app
        .state
        .services
        .checkout_sessions
        .get_session(&details.session.external_id)
        .await
        .expect("get session");
    assert_eq!(reloaded.items[0].unit_price, dec!(100));
    assert_eq!(reloaded.session.subtotal, dec!(100));
}

#[tokio::test]
async fn create_session_rejects_bad_carts() {
    let app = TestApp::new().await;
    let mug = app.seed_variant("MUG-3", dec!(100), 2).await;
    let sessions = &app.state.services.checkout_sessions;

    let empty = sessions
        .create_session(CreateSessionInput {
            guest_id: Some("g".into()),
            ..Default::default()
        })
        .await;
    assert_matches!(empty, Err(ServiceError::InvalidInput(_)));

    let duplicate = sessions
        .create_session(CreateSessionInput {
            items: vec![
                CartItemInput { variant_id: mug.id, quantity: 1 },
                CartItemInput { variant_id: mug.id, quantity: 1 },
            ],
            guest_id: Some("g".into()),
            ..Default::default()
        })
        .await;
    assert_matches!(duplicate, Err(ServiceError::InvalidInput(_)));

    let zero = sessions
        .create_session(CreateSessionInput {
            items: vec![CartItemInput { variant_id: mug.id, quantity: 0 }],
            guest_id: Some("g".into()),
            ..Default::default()
        })
        .await;
    assert_matches!(zero, Err(ServiceError::InvalidInput(_)));

    let unknown = sessions
        .create_session(CreateSessionInput {
            items: vec![CartItemInput { variant_id: Uuid::new_v4(), quantity: 1 }],
            guest_id: Some("g".into()),
            ..Default::default()
        })
        .await;
    assert_matches!(unknown, Err(ServiceError::VariantNotFound(_)));

    let too_many = sessions
        .create_session(CreateSessionInput {
            items: vec![CartItemInput { variant_id: mug.id, quantity: 3 }],
            guest_id: Some("g".into()),
            ..Default::default()
        })
        .await;
    assert_matches!(too_many, Err(ServiceError::InsufficientStock(_)));

    let anonymous = sessions
        .create_session(CreateSessionInput {
            items: vec![CartItemInput { variant_id: mug.id, quantity: 1 }],
            ..Default::default()
        })
        .await;
    assert_matches!(anonymous, Err(ServiceError::InvalidInput(_)));
}

#[tokio::test]
async fn discount_is_applied_before_tax() {
    let app = TestApp::new().await;
    let mug = app.seed_variant("MUG-4", dec!(100), 10).await;

    let details = app
        .state
        .services
        .checkout_sessions
        .create_session(CreateSessionInput {
            items: vec![CartItemInput { variant_id: mug.id, quantity: 2 }],
            guest_id: Some("guest-4".into()),
            discount: Discount::Percentage(dec!(50)),
            ..Default::default()
        })
        .await
        .expect("create session");

    let pricing = details.pricing();
    assert_eq!(pricing.subtotal, dec!(200));
    assert_eq!(pricing.discount, dec!(100));
    assert_eq!(pricing.tax, dec!(11));
    assert_eq!(pricing.total, dec!(111));
}

#[tokio::test]
async fn address_update_reprices_shipping_by_country() {
    let app = TestApp::new().await;
    let mug = app.seed_variant("MUG-5", dec!(100), 10).await;
    let details = app.guest_session("guest-5", &[(mug.id, 1)]).await;
    let external_id = details.session.external_id.clone();
    let sessions = &app.state.services.checkout_sessions;

    let domestic = app.seed_address(None, Some("guest-5"), "US").await;
    let updated = sessions
        .update_session_address(&external_id, domestic.id)
        .await
        .expect("domestic address");
    assert_eq!(updated.session.shipping_address_id, Some(domestic.id));
    assert_eq!(updated.session.shipping_fee, dec!(5));
    assert_eq!(updated.session.total, dec!(116));

    let abroad = app.seed_address(None, Some("guest-5"), "DE").await;
    let updated = sessions
        .update_session_address(&external_id, abroad.id)
        .await
        .expect("international address");
    assert_eq!(updated.session.shipping_fee, dec!(20));
    assert_eq!(updated.session.total, dec!(131));
}

#[tokio::test]
async fn address_must_belong_to_the_session_owner() {
    let app = TestApp::new().await;
    let mug = app.seed_variant("MUG-6", dec!(100), 10).await;
    let details = app.guest_session("guest-6", &[(mug.id, 1)]).await;

    let someone_else = app.seed_address(Some(Uuid::new_v4()), None, "US").await;
    let result = app
        .state
        .services
        .checkout_sessions
        .update_session_address(&details.session.external_id, someone_else.id)
        .await;
    assert_matches!(result, Err(ServiceError::AddressNotFound(_)));

    let missing = app
        .state
        .services
        .checkout_sessions
        .update_session_address(&details.session.external_id, Uuid::new_v4())
        .await;
    assert_matches!(missing, Err(ServiceError::AddressNotFound(_)));
}

#[tokio::test]
async fn cancelled_session_is_no_longer_mutable() {
    let app = TestApp::new().await;
    let mug = app.seed_variant("MUG-7", dec!(100), 10).await;
    let details = app.guest_session("guest-7", &[(mug.id, 1)]).await;
    let external_id = details.session.external_id.clone();
    let sessions = &app.state.services.checkout_sessions;

    let cancelled = sessions.cancel_session(&external_id).await.expect("cancel");
    assert_eq!(cancelled.session.status, SessionStatus::Cancelled);

    assert_matches!(
        sessions.cancel_session(&external_id).await,
        Err(ServiceError::SessionNotPending(_))
    );

    let address = app.seed_address(None, Some("guest-7"), "US").await;
    assert_matches!(
        sessions.update_session_address(&external_id, address.id).await,
        Err(ServiceError::SessionNotPending(_))
    );

    assert_matches!(
        app.state.services.orders.confirm_session(&external_id).await,
        Err(ServiceError::SessionNotPending(_))
    );
}

#[tokio::test]
async fn unknown_session_is_not_found() {
    let app = TestApp::new().await;
    assert_matches!(
        app.state.services.checkout_sessions.get_session("cs_missing").await,
        Err(ServiceError::SessionNotFound(_))
    );
}
