//! Marketplace API Library
//!
//! Checkout sessions, stock-deducting order confirmation and payment reconciliation.
#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![allow(elided_lifetimes_in_paths)]
#![warn(clippy::all, clippy::perf, clippy::dbg_macro)]

// Core modules
pub mod config;
pub mod db;
pub mod entities;
pub mod errors;
pub mod events;
pub mod handlers;
pub mod middleware_helpers;
pub mod rate_limiter;
pub mod services;
pub mod tracing;

use std::sync::Arc;
use std::time::Duration;

use axum::{
    routing::{get, post, put},
    Router,
};
use sea_orm::DatabaseConnection;
use tower_http::{
    compression::CompressionLayer,
    cors::{Any, CorsLayer},
    timeout::TimeoutLayer,
};

pub use handlers::common::{ApiResponse, PaginatedResponse};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

// App state definition
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<DatabaseConnection>,
    pub config: Arc<config::AppConfig>,
    pub event_sender: Arc<events::EventSender>,
    pub services: handlers::AppServices,
}

pub fn api_v1_routes() -> Router<AppState> {
    let checkout = Router::new()
        .route("/sessions", post(handlers::checkout::create_session))
        .route("/sessions/:external_id", get(handlers::checkout::get_session))
        .route(
            "/sessions/:external_id/address",
            put(handlers::checkout::update_session_address),
        )
        .route(
            "/sessions/:external_id/cancel",
            post(handlers::checkout::cancel_session),
        )
        .route(
            "/sessions/:external_id/confirm",
            post(handlers::checkout::confirm_session),
        );

    let orders = Router::new()
        .route("/", get(handlers::orders::list_orders))
        .route("/:id", get(handlers::orders::get_order))
        .route("/:id/status", put(handlers::orders::update_order_status))
        .route(
            "/external/:external_id",
            get(handlers::orders::get_order_by_external_id),
        )
        .route(
            "/external/:external_id/payment",
            post(handlers::orders::initiate_payment),
        );

    let payments = Router::new().route(
        "/webhook",
        post(handlers::payment_webhooks::payment_webhook),
    );

    Router::new()
        .nest("/checkout", checkout)
        .nest("/orders", orders)
        .nest("/payments", payments)
}

/// Full HTTP application with its middleware stack.
///
/// The request-id layer is outermost so the trace span and any error body
/// see the same ID; the rate limiter, when given, sits outside both.
pub fn build_app(state: AppState, rate_limiter: Option<rate_limiter::RateLimiter>) -> Router {
    let app = Router::new()
        .route("/health", get(handlers::health::health_check))
        .nest("/api/v1", api_v1_routes())
        // HTTP tracing layer for consistent request/response telemetry
        .layer(crate::tracing::configure_http_tracing())
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
        .layer(CompressionLayer::new())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        // Ensure every request carries a request id for traceability
        .layer(axum::middleware::from_fn(
            middleware_helpers::request_id::request_id_middleware,
        ))
        .with_state(state);

    match rate_limiter {
        Some(limiter) => app.layer(rate_limiter::RateLimitLayer::new(limiter)),
        None => app,
    }
}

pub mod prelude {
    pub use crate::config::AppConfig;
    pub use crate::db::*;
    pub use crate::entities::{OrderStatus, PaymentStatus, SessionStatus};
    pub use crate::errors::*;
    pub use crate::events::*;
    pub use crate::rate_limiter::{RateLimitConfig, RateLimitLayer, RateLimiter};
    pub use crate::services::{
        checkout_sessions::*, orders::*, orphaned_confirmations::*, payment_reconciliation::*,
        payments::*, pricing::*, session_expiry::*,
    };
    pub use crate::{build_app, AppState};
}
