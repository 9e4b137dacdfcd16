//! Applies provider payment outcomes to orders.
//!
//! The order row is locked for the duration of the transaction and every
//! requested change is checked against `OrderStatus::transition_to`, so a
//! redelivered callback is a no-op and a late callback cannot overwrite a
//! final status.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use metrics::counter;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseTransaction, EntityTrait, QueryFilter, QuerySelect, Set,
    TransactionTrait,
};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::{
    db::DbPool,
    entities::{order, payment, OrderStatus, PaymentStatus, Transition},
    errors::ServiceError,
    events::{Event, EventSender},
    services::orders::apply_status_change,
};

/// Identifiers carried by a provider callback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentCallback {
    /// The order's external ID.
    pub reference_id: String,
    pub payment_request_id: String,
    pub provider_payment_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconcileOutcome {
    Applied,
    AlreadyApplied,
}

#[derive(Clone)]
pub struct PaymentReconciliationService {
    db_pool: Arc<DbPool>,
    event_sender: Arc<EventSender>,
}

impl PaymentReconciliationService {
    pub fn new(db_pool: Arc<DbPool>, event_sender: Arc<EventSender>) -> Self {
        Self {
            db_pool,
            event_sender,
        }
    }

    #[instrument(skip(self), fields(reference_id = %callback.reference_id))]
    pub async fn mark_as_paid(&self, callback: &PaymentCallback) -> Result<ReconcileOutcome, ServiceError> {
        self.reconcile(callback, OrderStatus::Paid).await
    }

    #[instrument(skip(self), fields(reference_id = %callback.reference_id))]
    pub async fn mark_as_failed(&self, callback: &PaymentCallback) -> Result<ReconcileOutcome, ServiceError> {
        self.reconcile(callback, OrderStatus::Failed).await
    }

    async fn reconcile(
        &self,
        callback: &PaymentCallback,
        target: OrderStatus,
    ) -> Result<ReconcileOutcome, ServiceError> {
        let now = Utc::now();
        let txn = self.db_pool.begin().await?;

        let applied = match reconcile_in(&txn, callback, target, now).await {
            Ok(applied) => applied,
            Err(err) => {
                if let Err(rollback_err) = txn.rollback().await {
                    warn!(error = %rollback_err, "Rollback after failed reconciliation errored");
                }
                if let ServiceError::InvalidStatusTransition { from, to } = &err {
                    warn!(
                        reference_id = %callback.reference_id,
                        payment_request_id = %callback.payment_request_id,
                        %from,
                        %to,
                        "Payment callback conflicts with final order status; needs manual review"
                    );
                    counter!("marketplace_payment_callbacks_rejected_total", 1);
                }
                return Err(err);
            }
        };

        txn.commit().await?;

        let Some((order, previous)) = applied else {
            counter!("marketplace_payment_callbacks_duplicate_total", 1);
            info!(
                reference_id = %callback.reference_id,
                status = %target,
                "Payment callback already applied"
            );
            return Ok(ReconcileOutcome::AlreadyApplied);
        };

        info!(
            order = %order.external_id,
            from = %previous,
            to = %target,
            payment_request_id = %callback.payment_request_id,
            "Payment reconciled"
        );
        counter!("marketplace_payments_reconciled_total", 1, "status" => target.to_string());
        self.event_sender
            .publish(Event::OrderStatusChanged {
                order_id: order.id,
                old_status: previous,
                new_status: target,
            })
            .await;
        self.event_sender
            .publish(Event::PaymentReconciled {
                order_id: order.id,
                payment_request_id: callback.payment_request_id.clone(),
                status: payment_status_for(target),
            })
            .await;

        Ok(ReconcileOutcome::Applied)
    }
}

fn payment_status_for(status: OrderStatus) -> PaymentStatus {
    match status {
        OrderStatus::Paid => PaymentStatus::Paid,
        OrderStatus::Failed | OrderStatus::Cancelled => PaymentStatus::Failed,
        OrderStatus::PendingPayment => PaymentStatus::Pending,
    }
}

/// Returns the order and its previous status when a change was applied, `None` for a repeat.
async fn reconcile_in(
    txn: &DatabaseTransaction,
    callback: &PaymentCallback,
    target: OrderStatus,
    now: DateTime<Utc>,
) -> Result<Option<(order::Model, OrderStatus)>, ServiceError> {
    let current = order::Entity::find()
        .filter(order::Column::ExternalId.eq(callback.reference_id.as_str()))
        .lock_exclusive()
        .one(txn)
        .await?
        .ok_or_else(|| ServiceError::OrderNotFound(callback.reference_id.clone()))?;

    let previous = current.status;
    match previous.transition_to(target) {
        Transition::NoOp => return Ok(None),
        Transition::Reject => {
            return Err(ServiceError::InvalidStatusTransition {
                from: previous,
                to: target,
            })
        }
        Transition::Apply => {}
    }

    apply_status_change(txn, &current, target, now).await?;
    record_payment(txn, &current, callback, target, now).await?;

    Ok(Some((current, previous)))
}

async fn record_payment(
    txn: &DatabaseTransaction,
    order: &order::Model,
    callback: &PaymentCallback,
    target: OrderStatus,
    now: DateTime<Utc>,
) -> Result<(), ServiceError> {
    let status = payment_status_for(target);
    let paid_at = (status == PaymentStatus::Paid).then_some(now);

    let existing = payment::Entity::find()
        .filter(payment::Column::PaymentRequestId.eq(callback.payment_request_id.as_str()))
        .one(txn)
        .await?;

    match existing {
        Some(record) => {
            if record.order_id != order.id {
                return Err(ServiceError::Conflict(format!(
                    "payment request {} belongs to another order",
                    callback.payment_request_id
                )));
            }
            let mut active: payment::ActiveModel = record.into();
            active.status = Set(status);
            if callback.provider_payment_id.is_some() {
                active.provider_payment_id = Set(callback.provider_payment_id.clone());
            }
            active.paid_at = Set(paid_at);
            active.update(txn).await?;
        }
        None => {
            payment::ActiveModel {
                id: Set(Uuid::new_v4()),
                order_id: Set(order.id),
                reference_id: Set(order.external_id.clone()),
                payment_request_id: Set(callback.payment_request_id.clone()),
                provider_payment_id: Set(callback.provider_payment_id.clone()),
                status: Set(status),
                amount: Set(order.total),
                currency: Set(order.currency.clone()),
                payment_url: Set(None),
                paid_at: Set(paid_at),
                created_at: Set(now),
                updated_at: Set(now),
            }
            .insert(txn)
            .await?;
        }
    }
    Ok(())
}
