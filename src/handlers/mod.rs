pub mod checkout;
pub mod common;
pub mod health;
pub mod orders;
pub mod payment_webhooks;

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::{
    config::AppConfig,
    db::DbPool,
    errors::ServiceError,
    events::EventSender,
    services::{
        checkout_sessions::{CheckoutSessionService, CheckoutSettings},
        orders::OrderService,
        payment_reconciliation::PaymentReconciliationService,
        payments::{HttpPaymentGateway, PaymentGateway, PaymentService},
        pricing::PricingCalculator,
    },
};

// Re-export AppState so handler modules can import it as crate::handlers::AppState
pub use crate::AppState;

/// Services layer that encapsulates business logic used by HTTP handlers
#[derive(Clone)]
pub struct AppServices {
    pub checkout_sessions: Arc<CheckoutSessionService>,
    pub orders: Arc<OrderService>,
    pub payments: Arc<PaymentService>,
    pub reconciliation: Arc<PaymentReconciliationService>,
}

impl AppServices {
    /// Builds every service from configuration, including the HTTP payment gateway when a provider URL is set.
    pub fn new(
        db_pool: Arc<DbPool>,
        event_sender: Arc<EventSender>,
        config: &AppConfig,
    ) -> Result<Self, ServiceError> {
        let gateway: Option<Arc<dyn PaymentGateway>> = match config.payment_provider_url.as_deref() {
            Some(url) if !url.trim().is_empty() => {
                info!(provider = %url, "Payment provider configured");
                Some(Arc::new(HttpPaymentGateway::new(
                    url,
                    config.payment_provider_api_key.clone(),
                    Duration::from_secs(config.payment_provider_timeout_secs),
                )?))
            }
            _ => {
                info!("Payment provider not configured; payment initiation disabled");
                None
            }
        };
        Self::with_gateway(db_pool, event_sender, config, gateway)
    }

    pub fn with_gateway(
        db_pool: Arc<DbPool>,
        event_sender: Arc<EventSender>,
        config: &AppConfig,
        gateway: Option<Arc<dyn PaymentGateway>>,
    ) -> Result<Self, ServiceError> {
        let policy = config
            .pricing_policy()
            .map_err(|e| ServiceError::InternalError(e.to_string()))?;
        let settings = CheckoutSettings {
            currency: config.default_currency.to_ascii_uppercase(),
            session_ttl: chrono::Duration::seconds(config.checkout_session_ttl_secs as i64),
        };

        Ok(Self {
            checkout_sessions: Arc::new(CheckoutSessionService::new(
                db_pool.clone(),
                event_sender.clone(),
                PricingCalculator::new(policy),
                settings,
            )),
            orders: Arc::new(OrderService::new(db_pool.clone(), event_sender.clone())),
            payments: Arc::new(
                PaymentService::new(db_pool.clone(), event_sender.clone(), gateway)
                    .with_claim_ttl(Duration::from_secs(config.payment_provider_timeout_secs * 2)),
            ),
            reconciliation: Arc::new(PaymentReconciliationService::new(db_pool, event_sender)),
        })
    }
}
