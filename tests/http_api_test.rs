mod common;

use std::time::Duration;

use axum::http::{Method, StatusCode};
use chrono::Utc;
use common::{body_json, TestApp, ADMIN_TOKEN, WEBHOOK_SECRET};
use marketplace_api::{
    handlers::payment_webhooks::{sign_payload, SIGNATURE_HEADER, TIMESTAMP_HEADER},
    rate_limiter::{RateLimitConfig, RateLimiter},
};
use rust_decimal_macros::dec;
use serde_json::{json, Value};

async fn signed_webhook(app: &TestApp, payload: Value) -> axum::response::Response {
    let body = serde_json::to_vec(&payload).expect("serialize webhook");
    let ts = Utc::now().timestamp();
    let signature = sign_payload(WEBHOOK_SECRET, ts, &body).expect("sign");
    let ts = ts.to_string();
    app.request_raw(
        Method::POST,
        "/api/v1/payments/webhook",
        body,
        &[(TIMESTAMP_HEADER, ts.as_str()), (SIGNATURE_HEADER, signature.as_str())],
    )
    .await
}

/// Creates and confirms a session over HTTP, returning the confirm response data.
async fn checkout(app: &TestApp, sku: &str) -> Value {
    let variant = app.seed_variant(sku, dec!(100), 10).await;
    let response = app
        .request(
            Method::POST,
            "/api/v1/checkout/sessions",
            Some(json!({
                "items": [{ "variant_id": variant.id, "quantity": 2 }],
                "guest_id": format!("http-{}", sku),
            })),
            &[],
        )
        .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    let created = body_json(response).await;
    assert_eq!(created["success"], true);
    let external_id = created["data"]["external_id"]
        .as_str()
        .expect("session external id")
        .to_string();
    assert_eq!(created["data"]["status"], "pending");
    assert_eq!(created["data"]["items"].as_array().map(Vec::len), Some(1));

    let response = app
        .request(
            Method::POST,
            &format!("/api/v1/checkout/sessions/{}/confirm", external_id),
            None,
            &[],
        )
        .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    body_json(response).await["data"].clone()
}

#[tokio::test]
async fn health_reports_database_up() {
    let app = TestApp::new().await;
    let response = app.request(Method::GET, "/health", None, &[]).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "up");
    assert_eq!(body["database"], "up");
}

#[tokio::test]
async fn responses_carry_a_request_id() {
    let app = TestApp::new().await;
    let response = app
        .request(Method::GET, "/health", None, &[("x-request-id", "req-abc")])
        .await;
    assert_eq!(
        response
            .headers()
            .get("x-request-id")
            .and_then(|v| v.to_str().ok()),
        Some("req-abc")
    );
}

#[tokio::test]
async fn checkout_confirm_and_paid_webhook_end_to_end() {
    let app = TestApp::new().await;
    let confirmed = checkout(&app, "HTTP-1").await;

    let order_external_id = confirmed["order"]["external_id"]
        .as_str()
        .expect("order external id")
        .to_string();
    let payment_request_id = confirmed["payment"]["payment_request_id"]
        .as_str()
        .expect("payment initiated after confirm")
        .to_string();
    assert_eq!(confirmed["payment"]["status"], "pending");

    let payload = json!({
        "reference_id": order_external_id,
        "payment_request_id": payment_request_id,
        "provider_payment_id": "py_http",
        "status": "PAID",
    });
    let response = signed_webhook(&app, payload.clone()).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["result"], "applied");

    let response = signed_webhook(&app, payload).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["result"], "already_applied");

    let response = app
        .request(
            Method::GET,
            &format!("/api/v1/orders/external/{}", order_external_id),
            None,
            &[],
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let order = body_json(response).await;
    assert_eq!(order["data"]["status"], "paid");
    assert_eq!(order["data"]["payments"][0]["status"], "paid");

    // A late failure for a paid order is acknowledged but changes nothing.
    let response = signed_webhook(
        &app,
        json!({
            "reference_id": order_external_id,
            "payment_request_id": payment_request_id,
            "status": "FAILED",
        }),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["result"], "ignored");
}

#[tokio::test]
async fn second_confirm_is_a_conflict() {
    let app = TestApp::new().await;
    let variant = app.seed_variant("HTTP-2", dec!(100), 10).await;
    let details = app.guest_session("http-2", &[(variant.id, 1)]).await;
    let uri = format!(
        "/api/v1/checkout/sessions/{}/confirm",
        details.session.external_id
    );

    let first = app.request(Method::POST, &uri, None, &[]).await;
    assert_eq!(first.status(), StatusCode::CREATED);

    let second = app.request(Method::POST, &uri, None, &[]).await;
    assert_eq!(second.status(), StatusCode::CONFLICT);
    assert_eq!(body_json(second).await["code"], "already_confirmed");
}

#[tokio::test]
async fn errors_use_stable_codes() {
    let app = TestApp::new().await;

    let missing = app
        .request(Method::GET, "/api/v1/checkout/sessions/cs_nope", None, &[])
        .await;
    assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    assert_eq!(body_json(missing).await["code"], "session_not_found");

    let variant = app.seed_variant("HTTP-3", dec!(100), 1).await;
    let short = app
        .request(
            Method::POST,
            "/api/v1/checkout/sessions",
            Some(json!({
                "items": [{ "variant_id": variant.id, "quantity": 5 }],
                "guest_id": "http-3",
            })),
            &[],
        )
        .await;
    assert_eq!(short.status(), StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body_json(short).await["code"], "insufficient_stock");

    let bad_filter = app
        .request(Method::GET, "/api/v1/orders?status=shipped", None, &[])
        .await;
    assert_eq!(bad_filter.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn webhook_rejects_bad_signatures() {
    let app = TestApp::new().await;
    let body = serde_json::to_vec(&json!({
        "reference_id": "ord_x",
        "payment_request_id": "pr_x",
        "status": "PAID",
    }))
    .expect("serialize");
    let ts = Utc::now().timestamp().to_string();

    let response = app
        .request_raw(
            Method::POST,
            "/api/v1/payments/webhook",
            body.clone(),
            &[(TIMESTAMP_HEADER, ts.as_str()), (SIGNATURE_HEADER, "deadbeef")],
        )
        .await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let unsigned = app
        .request_raw(Method::POST, "/api/v1/payments/webhook", body, &[])
        .await;
    assert_eq!(unsigned.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn webhook_for_unknown_order_asks_for_redelivery() {
    let app = TestApp::new().await;
    let response = signed_webhook(
        &app,
        json!({
            "reference_id": "ord_unknown",
            "payment_request_id": "pr_unknown",
            "status": "PAID",
        }),
    )
    .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let ignored = signed_webhook(
        &app,
        json!({
            "reference_id": "ord_unknown",
            "payment_request_id": "pr_unknown",
            "status": "PENDING",
        }),
    )
    .await;
    assert_eq!(ignored.status(), StatusCode::OK);
    assert_eq!(body_json(ignored).await["result"], "ignored");
}

#[tokio::test]
async fn admin_status_update_requires_token() {
    let app = TestApp::new().await;
    let confirmed = checkout(&app, "HTTP-4").await;
    let uri = format!(
        "/api/v1/orders/{}/status",
        confirmed["order"]["order_id"].as_str().expect("order id")
    );

    let anonymous = app
        .request(Method::PUT, &uri, Some(json!({ "status": "cancelled" })), &[])
        .await;
    assert_eq!(anonymous.status(), StatusCode::UNAUTHORIZED);

    let wrong = app
        .request(
            Method::PUT,
            &uri,
            Some(json!({ "status": "cancelled" })),
            &[("authorization", "Bearer nope")],
        )
        .await;
    assert_eq!(wrong.status(), StatusCode::UNAUTHORIZED);

    let bearer = format!("Bearer {}", ADMIN_TOKEN);
    let response = app
        .request(
            Method::PUT,
            &uri,
            Some(json!({ "status": "cancelled" })),
            &[("authorization", bearer.as_str())],
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["data"]["status"], "cancelled");

    let response = app
        .request(
            Method::PUT,
            &uri,
            Some(json!({ "status": "paid" })),
            &[("authorization", bearer.as_str())],
        )
        .await;
    assert_eq!(response.status(), StatusCode::CONFLICT);
    assert_eq!(body_json(response).await["code"], "invalid_status_transition");
}

#[tokio::test]
async fn rate_limiter_returns_429_but_spares_health_checks() {
    let limiter = RateLimiter::new(RateLimitConfig {
        requests_per_window: 2,
        window_duration: Duration::from_secs(3600),
        ..Default::default()
    });
    let app = TestApp::with(|_| {}, Some(limiter)).await;

    for _ in 0..2 {
        let response = app.request(Method::GET, "/api/v1/orders", None, &[]).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().contains_key("x-ratelimit-remaining"));
    }

    let limited = app.request(Method::GET, "/api/v1/orders", None, &[]).await;
    assert_eq!(limited.status(), StatusCode::TOO_MANY_REQUESTS);
    assert!(limited.headers().contains_key("retry-after"));
    assert_eq!(body_json(limited).await["code"], "rate_limited");

    let health = app.request(Method::GET, "/health", None, &[]).await;
    assert_eq!(health.status(), StatusCode::OK);
}
