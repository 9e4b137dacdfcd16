//! Payment initiation against the external provider.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SubsecRound, Utc};
use metrics::counter;
use rust_decimal::Decimal;
use sea_orm::{
    sea_query::Expr, ActiveModelTrait, ColumnTrait, Condition, ConnectionTrait, EntityTrait,
    QueryFilter, Set,
};
use serde::{Deserialize, Serialize};
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::{
    db::DbPool,
    entities::{order, payment, OrderStatus, PaymentStatus},
    errors::ServiceError,
    events::{Event, EventSender},
    services::orders::find_order_by_external_id,
};

/// What we ask the provider to collect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentRequest {
    /// The order's external ID; echoed back on provider callbacks.
    pub reference_id: String,
    pub amount: Decimal,
    pub currency: String,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentRequestCreated {
    pub payment_request_id: String,
    #[serde(default)]
    pub payment_url: Option<String>,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn create_payment_request(
        &self,
        request: &PaymentRequest,
    ) -> Result<PaymentRequestCreated, ServiceError>;
}

/// JSON-over-HTTPS provider client.
pub struct HttpPaymentGateway {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl HttpPaymentGateway {
    pub fn new(
        base_url: impl Into<String>,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, ServiceError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ServiceError::InternalError(format!("payment client: {}", e)))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
        })
    }
}

#[async_trait]
impl PaymentGateway for HttpPaymentGateway {
    #[instrument(skip(self, request), fields(reference_id = %request.reference_id))]
    async fn create_payment_request(
        &self,
        request: &PaymentRequest,
    ) -> Result<PaymentRequestCreated, ServiceError> {
        let mut builder = self
            .client
            .post(format!("{}/payment_requests", self.base_url))
            .json(request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().await.map_err(|e| {
            warn!(error = %e, "Payment provider request failed");
            ServiceError::ExternalServiceError(e.to_string())
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(%status, %body, "Payment provider rejected request");
            return Err(ServiceError::ExternalServiceError(format!(
                "provider returned {}",
                status
            )));
        }

        response
            .json::<PaymentRequestCreated>()
            .await
            .map_err(|e| ServiceError::ExternalServiceError(format!("malformed provider response: {}", e)))
    }
}

/// How long an initiation claim blocks other callers when its holder never finishes.
const DEFAULT_CLAIM_TTL_SECS: i64 = 60;

#[derive(Clone)]
pub struct PaymentService {
    db_pool: Arc<DbPool>,
    event_sender: Arc<EventSender>,
    gateway: Option<Arc<dyn PaymentGateway>>,
    claim_ttl: chrono::Duration,
}

impl PaymentService {
    pub fn new(
        db_pool: Arc<DbPool>,
        event_sender: Arc<EventSender>,
        gateway: Option<Arc<dyn PaymentGateway>>,
    ) -> Self {
        Self {
            db_pool,
            event_sender,
            gateway,
            claim_ttl: chrono::Duration::seconds(DEFAULT_CLAIM_TTL_SECS),
        }
    }

    pub fn with_claim_ttl(mut self, ttl: Duration) -> Self {
        self.claim_ttl = chrono::Duration::from_std(ttl)
            .unwrap_or_else(|_| chrono::Duration::seconds(DEFAULT_CLAIM_TTL_SECS));
        self
    }

    /// Opens a payment request for an unpaid order.
    ///
    /// An order that already has a pending request gets that request back
    /// instead of a second one. The provider is only called by the caller
    /// holding the order's initiation claim; a concurrent caller gets the
    /// recorded request if it has landed, otherwise a conflict to retry.
    #[instrument(skip(self))]
    pub async fn initiate_payment(&self, order_external_id: &str) -> Result<payment::Model, ServiceError> {
        let db = &*self.db_pool;
        let order = find_order_by_external_id(db, order_external_id).await?;
        if order.status != OrderStatus::PendingPayment {
            return Err(ServiceError::Conflict(format!(
                "order {} is {} and cannot accept payment",
                order.external_id, order.status
            )));
        }

        if let Some(existing) = find_pending_payment(db, order.id).await? {
            return Ok(existing);
        }

        let gateway = self.gateway.as_ref().ok_or_else(|| {
            ServiceError::ExternalServiceError("payment provider is not configured".to_string())
        })?;

        // Stored timestamps carry microseconds; the release matches on this value.
        let claimed_at = Utc::now().trunc_subsecs(6);
        if !self.claim_initiation(order.id, claimed_at).await? {
            return match find_pending_payment(db, order.id).await? {
                Some(existing) => Ok(existing),
                None => {
                    counter!("marketplace_payment_initiation_contended_total", 1);
                    Err(ServiceError::Conflict(format!(
                        "payment for order {} is already being initiated",
                        order.external_id
                    )))
                }
            };
        }

        let result = self.open_payment_request(gateway.as_ref(), &order).await;
        if let Err(release_err) = self.release_initiation(order.id, claimed_at).await {
            warn!(order = %order.external_id, error = %release_err, "Failed to release payment claim");
        }
        let record = result?;

        info!(
            order = %order.external_id,
            payment_request_id = %record.payment_request_id,
            "Payment initiated"
        );
        counter!("marketplace_payments_initiated_total", 1);
        self.event_sender
            .publish(Event::PaymentInitiated {
                order_id: order.id,
                payment_request_id: record.payment_request_id.clone(),
            })
            .await;

        Ok(record)
    }

    /// Marks the order as having a payment request in flight; a stale claim may be taken over.
    async fn claim_initiation(&self, order_id: Uuid, now: DateTime<Utc>) -> Result<bool, ServiceError> {
        let stale_before = now - self.claim_ttl;
        let result = order::Entity::update_many()
            .col_expr(order::Column::PaymentClaimedAt, Expr::value(Some(now)))
            .filter(order::Column::Id.eq(order_id))
            .filter(order::Column::Status.eq(OrderStatus::PendingPayment))
            .filter(
                Condition::any()
                    .add(order::Column::PaymentClaimedAt.is_null())
                    .add(order::Column::PaymentClaimedAt.lt(stale_before)),
            )
            .exec(&*self.db_pool)
            .await?;
        Ok(result.rows_affected > 0)
    }

    async fn release_initiation(&self, order_id: Uuid, claimed_at: DateTime<Utc>) -> Result<(), ServiceError> {
        order::Entity::update_many()
            .col_expr(
                order::Column::PaymentClaimedAt,
                Expr::value(Option::<DateTime<Utc>>::None),
            )
            .filter(order::Column::Id.eq(order_id))
            .filter(order::Column::PaymentClaimedAt.eq(claimed_at))
            .exec(&*self.db_pool)
            .await?;
        Ok(())
    }

    async fn open_payment_request(
        &self,
        gateway: &dyn PaymentGateway,
        order: &order::Model,
    ) -> Result<payment::Model, ServiceError> {
        let db = &*self.db_pool;
        let created = gateway
            .create_payment_request(&PaymentRequest {
                reference_id: order.external_id.clone(),
                amount: order.total,
                currency: order.currency.clone(),
                description: format!("Invoice {}", order.invoice_number),
            })
            .await
            .map_err(|e| {
                counter!("marketplace_payment_initiation_failures_total", 1);
                e
            })?;

        let now = Utc::now();
        let inserted = payment::ActiveModel {
            id: Set(Uuid::new_v4()),
            order_id: Set(order.id),
            reference_id: Set(order.external_id.clone()),
            payment_request_id: Set(created.payment_request_id.clone()),
            provider_payment_id: Set(None),
            status: Set(PaymentStatus::Pending),
            amount: Set(order.total),
            currency: Set(order.currency.clone()),
            payment_url: Set(created.payment_url.clone()),
            paid_at: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(db)
        .await;

        match inserted {
            Ok(record) => Ok(record),
            Err(insert_err) => {
                // Either a callback for this request recorded it first, or another
                // pending request already holds the order's slot.
                let by_request = payment::Entity::find()
                    .filter(payment::Column::PaymentRequestId.eq(created.payment_request_id.as_str()))
                    .one(db)
                    .await?;
                let existing = match by_request {
                    Some(record) => Some(record),
                    None => find_pending_payment(db, order.id).await?,
                };
                existing.ok_or_else(|| {
                    error!(error = %insert_err, "Failed to record payment request");
                    insert_err.into()
                })
            }
        }
    }
}

async fn find_pending_payment<C: ConnectionTrait>(
    db: &C,
    order_id: Uuid,
) -> Result<Option<payment::Model>, ServiceError> {
    Ok(payment::Entity::find()
        .filter(payment::Column::OrderId.eq(order_id))
        .filter(payment::Column::Status.eq(PaymentStatus::Pending))
        .one(db)
        .await?)
}
