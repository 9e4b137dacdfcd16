#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{Method, Request},
    Router,
};
use chrono::Utc;
use marketplace_api::{
    build_app,
    config::AppConfig,
    db,
    entities::{address, product, variant},
    errors::ServiceError,
    events::{self, EventSender},
    handlers::AppServices,
    rate_limiter::RateLimiter,
    services::{
        checkout_sessions::{CartItemInput, CheckoutSessionDetails, CreateSessionInput},
        payments::{PaymentGateway, PaymentRequest, PaymentRequestCreated},
    },
    AppState,
};
use rust_decimal::Decimal;
use sea_orm::{ActiveModelTrait, DatabaseConnection, EntityTrait, Set};
use serde_json::Value;
use tempfile::TempDir;
use tower::ServiceExt;
use uuid::Uuid;

pub const ADMIN_TOKEN: &str = "test-admin-token";
pub const WEBHOOK_SECRET: &str = "whsec_test";

/// Payment provider double that hands out sequential request IDs.
#[derive(Default)]
pub struct StubGateway {
    calls: AtomicUsize,
    delay: Duration,
}

impl StubGateway {
    /// A provider that takes `delay` to answer each request.
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            delay,
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PaymentGateway for StubGateway {
    async fn create_payment_request(
        &self,
        request: &PaymentRequest,
    ) -> Result<PaymentRequestCreated, ServiceError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        Ok(PaymentRequestCreated {
            payment_request_id: format!("pr_{}_{}", request.reference_id, n),
            payment_url: Some(format!("https://pay.example.test/{}", n)),
        })
    }
}

/// Helper harness for spinning up an application backed by a throwaway SQLite database.
pub struct TestApp {
    router: Router,
    pub state: AppState,
    pub gateway: Arc<StubGateway>,
    _db_dir: TempDir,
    _event_task: tokio::task::JoinHandle<()>,
}

impl TestApp {
    pub async fn new() -> Self {
        Self::with(|_| {}, None).await
    }

    /// Like `new`, with a pool of `size` connections so concurrent callers really overlap.
    pub async fn with_pool_size(size: u32) -> Self {
        Self::with(|cfg| cfg.db_max_connections = size, None).await
    }

    /// Builds the app after `configure` adjusts the test configuration.
    pub async fn with(
        configure: impl FnOnce(&mut AppConfig),
        rate_limiter: Option<RateLimiter>,
    ) -> Self {
        let db_dir = tempfile::tempdir().expect("create temp dir");
        let db_path = db_dir.path().join("marketplace_test.db");

        let mut cfg = AppConfig::new(
            format!("sqlite://{}?mode=rwc", db_path.display()),
            "127.0.0.1".to_string(),
            18_080,
            "test".to_string(),
        );
        // One connection unless a test widens it. SQLite fails a transaction
        // that read before writing if another writer committed in between,
        // where Postgres would wait on the row lock.
        cfg.db_max_connections = 1;
        cfg.db_min_connections = 1;
        cfg.rate_limit_enabled = false;
        cfg.admin_api_token = Some(ADMIN_TOKEN.to_string());
        cfg.payment_webhook_secret = Some(WEBHOOK_SECRET.to_string());
        configure(&mut cfg);

        let pool = db::establish_connection_from_app_config(&cfg)
            .await
            .expect("failed to create test database");
        db::run_migrations(&pool)
            .await
            .expect("failed to run migrations in tests");

        let db_arc = Arc::new(pool);
        let (event_sender, event_rx) = EventSender::channel(cfg.event_channel_capacity);
        let event_sender = Arc::new(event_sender);
        let event_task = tokio::spawn(events::process_events(event_rx));

        let gateway = Arc::new(StubGateway::default());
        let services = AppServices::with_gateway(
            db_arc.clone(),
            event_sender.clone(),
            &cfg,
            Some(gateway.clone() as Arc<dyn PaymentGateway>),
        )
        .expect("build services");

        let state = AppState {
            db: db_arc,
            config: Arc::new(cfg),
            event_sender,
            services,
        };
        let router = build_app(state.clone(), rate_limiter);

        Self {
            router,
            state,
            gateway,
            _db_dir: db_dir,
            _event_task: event_task,
        }
    }

    pub fn db(&self) -> &DatabaseConnection {
        &self.state.db
    }

    /// Send a JSON request through the full middleware stack.
    pub async fn request(
        &self,
        method: Method,
        uri: &str,
        body: Option<Value>,
        headers: &[(&str, &str)],
    ) -> axum::response::Response {
        let mut builder = Request::builder().method(method).uri(uri);
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }

        let body = if let Some(json) = body {
            builder = builder.header("content-type", "application/json");
            Body::from(serde_json::to_vec(&json).expect("failed to serialize json request body"))
        } else {
            Body::empty()
        };

        let request = builder.body(body).expect("failed to build request");
        self.router
            .clone()
            .oneshot(request)
            .await
            .expect("router error during test request")
    }

    /// Send a raw body, for callers that sign exact bytes.
    pub async fn request_raw(
        &self,
        method: Method,
        uri: &str,
        body: Vec<u8>,
        headers: &[(&str, &str)],
    ) -> axum::response::Response {
        let mut builder = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json");
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        let request = builder.body(Body::from(body)).expect("failed to build request");
        self.router
            .clone()
            .oneshot(request)
            .await
            .expect("router error during test request")
    }

    pub async fn seed_variant(&self, sku: &str, price: Decimal, stock: i32) -> variant::Model {
        let now = Utc::now();
        let product = product::ActiveModel {
            id: Set(Uuid::new_v4()),
            name: Set(format!("Product {}", sku)),
            created_at: Set(now),
        }
        .insert(self.db())
        .await
        .expect("seed product");

        variant::ActiveModel {
            id: Set(Uuid::new_v4()),
            product_id: Set(product.id),
            sku: Set(sku.to_string()),
            name: Set(format!("Variant {}", sku)),
            image_url: Set(None),
            unit_type: Set("piece".to_string()),
            price: Set(price),
            stock: Set(stock),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(self.db())
        .await
        .expect("seed variant")
    }

    pub async fn seed_address(
        &self,
        user_id: Option<Uuid>,
        guest_id: Option<&str>,
        country_code: &str,
    ) -> address::Model {
        address::ActiveModel {
            id: Set(Uuid::new_v4()),
            user_id: Set(user_id),
            guest_id: Set(guest_id.map(str::to_string)),
            recipient_name: Set("Test Buyer".to_string()),
            line1: Set("1 Market St".to_string()),
            line2: Set(None),
            city: Set("Springfield".to_string()),
            region: Set(None),
            postal_code: Set("12345".to_string()),
            country_code: Set(country_code.to_string()),
            created_at: Set(Utc::now()),
        }
        .insert(self.db())
        .await
        .expect("seed address")
    }

    pub async fn stock_of(&self, variant_id: Uuid) -> i32 {
        variant::Entity::find_by_id(variant_id)
            .one(self.db())
            .await
            .expect("load variant")
            .expect("variant exists")
            .stock
    }

    /// Creates a pending session for a guest.
    pub async fn guest_session(
        &self,
        guest_id: &str,
        items: &[(Uuid, i32)],
    ) -> CheckoutSessionDetails {
        self.state
            .services
            .checkout_sessions
            .create_session(CreateSessionInput {
                items: items
                    .iter()
                    .map(|(variant_id, quantity)| CartItemInput {
                        variant_id: *variant_id,
                        quantity: *quantity,
                    })
                    .collect(),
                guest_id: Some(guest_id.to_string()),
                ..Default::default()
            })
            .await
            .expect("create session")
    }
}

impl Drop for TestApp {
    fn drop(&mut self) {
        self._event_task.abort();
    }
}

pub async fn body_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("read response body");
    serde_json::from_slice(&bytes).expect("response body is json")
}
