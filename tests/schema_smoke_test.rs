mod common;

use marketplace_api::{
    db,
    entities::{checkout_session, order, payment, variant},
};
use rust_decimal_macros::dec;
use sea_orm::{EntityTrait, PaginatorTrait};

#[tokio::test]
async fn schema_smoke_test() {
    let app = common::TestApp::new().await;
    let conn = app.db();

    // Migrations already ran in the harness; a second run is a no-op.
    db::run_migrations(conn).await.expect("re-run migrations");
    db::check_connection(conn).await.expect("database reachable");

    assert_eq!(order::Entity::find().count(conn).await.expect("orders table"), 0);
    assert_eq!(payment::Entity::find().count(conn).await.expect("payments table"), 0);
    assert_eq!(
        checkout_session::Entity::find()
            .count(conn)
            .await
            .expect("checkout sessions table"),
        0
    );

    let seeded = app.seed_variant("SMOKE-1", dec!(2500), 7).await;
    let stored = variant::Entity::find_by_id(seeded.id)
        .one(conn)
        .await
        .expect("load variant")
        .expect("variant exists");
    assert_eq!(stored.price, dec!(2500));
    assert_eq!(stored.stock, 7);

    let details = app.guest_session("smoke-buyer", &[(seeded.id, 2)]).await;
    assert_eq!(details.session.subtotal, dec!(5000));
}
