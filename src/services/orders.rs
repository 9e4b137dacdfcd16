//! Order creation from confirmed checkout sessions, plus order reads and admin status changes.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use metrics::{counter, histogram};
use rust_decimal::Decimal;
use sea_orm::{
    sea_query::Expr, ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseTransaction,
    EntityTrait, QueryFilter, QueryOrder, QuerySelect, Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::{
    db::{DbPool, OrderQuery},
    entities::{
        checkout_session, checkout_session_item, order, order_item, payment, variant, OrderStatus,
        SessionStatus, Transition,
    },
    errors::ServiceError,
    events::{Event, EventSender},
    services::checkout_sessions::{find_session_by_external_id, load_session_items, pricing_of},
};

/// Result of a successful confirmation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfirmedOrder {
    pub order_id: Uuid,
    pub external_id: String,
    pub invoice_number: String,
    pub checkout_session_id: Uuid,
    pub total: Decimal,
    pub currency: String,
}

impl From<&order::Model> for ConfirmedOrder {
    fn from(order: &order::Model) -> Self {
        Self {
            order_id: order.id,
            external_id: order.external_id.clone(),
            invoice_number: order.invoice_number.clone(),
            checkout_session_id: order.checkout_session_id,
            total: order.total,
            currency: order.currency.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderDetails {
    #[serde(flatten)]
    pub order: order::Model,
    pub items: Vec<order_item::Model>,
    pub payments: Vec<payment::Model>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderPage {
    pub orders: Vec<order::Model>,
    pub total: u64,
    pub page: u64,
    pub limit: u64,
}

/// Why order creation failed, split by whether the transaction is known to have rolled back.
#[derive(Debug)]
pub(crate) enum OrderCreationError {
    /// Nothing was written.
    RolledBack(ServiceError),
    /// The commit itself failed; the outcome is unknown.
    CommitFailed(ServiceError),
}

pub(crate) fn new_order_external_id() -> String {
    format!("ord_{}", Uuid::new_v4().simple())
}

/// `INV-YYYYMMDD-XXXXXXXX`, the suffix being eight random uppercase hex digits.
pub(crate) fn new_invoice_number(now: DateTime<Utc>) -> String {
    let suffix: String = Uuid::new_v4().simple().to_string()[..8].to_ascii_uppercase();
    format!("INV-{}-{}", now.format("%Y%m%d"), suffix)
}

/// Applies a status change that `transition_to` already accepted.
///
/// The compare-and-set on the previous status makes a concurrent writer lose
/// with `Conflict` instead of silently overwriting. The linked session follows
/// the order, and deducted stock is returned when the change restocks.
pub(crate) async fn apply_status_change(
    txn: &DatabaseTransaction,
    current: &order::Model,
    next: OrderStatus,
    now: DateTime<Utc>,
) -> Result<(), ServiceError> {
    let updated = order::Entity::update_many()
        .col_expr(order::Column::Status, Expr::value(next))
        .col_expr(order::Column::UpdatedAt, Expr::value(now))
        .filter(order::Column::Id.eq(current.id))
        .filter(order::Column::Status.eq(current.status))
        .exec(txn)
        .await?;
    if updated.rows_affected == 0 {
        return Err(ServiceError::Conflict(format!(
            "order {} changed concurrently",
            current.external_id
        )));
    }

    checkout_session::Entity::update_many()
        .col_expr(
            checkout_session::Column::Status,
            Expr::value(next.session_status()),
        )
        .col_expr(checkout_session::Column::UpdatedAt, Expr::value(now))
        .filter(checkout_session::Column::Id.eq(current.checkout_session_id))
        .exec(txn)
        .await?;

    if current.status.restocks_on(next) {
        let items = order_item::Entity::find()
            .filter(order_item::Column::OrderId.eq(current.id))
            .order_by_asc(order_item::Column::VariantId)
            .all(txn)
            .await?;
        for item in items {
            variant::Entity::update_many()
                .col_expr(
                    variant::Column::Stock,
                    Expr::col(variant::Column::Stock).add(item.quantity),
                )
                .col_expr(variant::Column::UpdatedAt, Expr::value(now))
                .filter(variant::Column::Id.eq(item.variant_id))
                .exec(txn)
                .await?;
        }
        info!(order = %current.external_id, "Stock returned for cancelled order");
    }
    Ok(())
}

#[derive(Clone)]
pub struct OrderService {
    db_pool: Arc<DbPool>,
    event_sender: Arc<EventSender>,
}

impl OrderService {
    pub fn new(db_pool: Arc<DbPool>, event_sender: Arc<EventSender>) -> Self {
        Self {
            db_pool,
            event_sender,
        }
    }

    /// Turns a pending checkout session into an order, deducting stock.
    ///
    /// The session is first claimed by setting `confirmed_at` with a conditional
    /// update; only the caller that wins the claim proceeds. Order rows and
    /// stock deductions then commit together or not at all. A clean rollback
    /// releases the claim so the buyer can retry; a failed commit keeps it and
    /// leaves the session for the orphan sweeper.
    #[instrument(skip(self))]
    pub async fn confirm_session(&self, external_id: &str) -> Result<ConfirmedOrder, ServiceError> {
        let started = Instant::now();
        let db = &*self.db_pool;
        let now = Utc::now();
        let session = find_session_by_external_id(db, external_id).await?;

        let claimed = checkout_session::Entity::update_many()
            .col_expr(checkout_session::Column::ConfirmedAt, Expr::value(Some(now)))
            .col_expr(checkout_session::Column::UpdatedAt, Expr::value(now))
            .filter(checkout_session::Column::Id.eq(session.id))
            .filter(checkout_session::Column::ConfirmedAt.is_null())
            .filter(checkout_session::Column::Status.eq(SessionStatus::Pending))
            .filter(checkout_session::Column::ExpiresAt.gt(now))
            .exec(db)
            .await?;

        if claimed.rows_affected == 0 {
            counter!("marketplace_checkout_confirm_rejected_total", 1);
            let current = find_session_by_external_id(db, external_id).await?;
            return Err(if current.confirmed_at.is_some() {
                ServiceError::AlreadyConfirmed(external_id.to_string())
            } else {
                ServiceError::SessionNotPending(external_id.to_string())
            });
        }

        let session = checkout_session::Model {
            confirmed_at: Some(now),
            ..session
        };

        match self.create_order_for_session(&session).await {
            Ok(order) => {
                histogram!("marketplace_checkout_confirm_duration", started.elapsed());
                Ok(ConfirmedOrder::from(&order))
            }
            Err(OrderCreationError::RolledBack(err)) => {
                if let Err(release_err) = self.release_confirmation(session.id).await {
                    error!(
                        session = %external_id,
                        error = %release_err,
                        "Failed to release confirmation claim; orphan sweeper will resolve it"
                    );
                }
                Err(err)
            }
            Err(OrderCreationError::CommitFailed(err)) => {
                error!(
                    session = %external_id,
                    error = %err,
                    "Order commit failed with unknown outcome; leaving session claimed"
                );
                Err(err)
            }
        }
    }

    /// Creates the order, its items and the stock deductions for an already claimed session.
    pub(crate) async fn create_order_for_session(
        &self,
        session: &checkout_session::Model,
    ) -> Result<order::Model, OrderCreationError> {
        let db = &*self.db_pool;
        let items = load_session_items(db, session.id)
            .await
            .map_err(OrderCreationError::RolledBack)?;

        let pricing = pricing_of(session);
        if items.is_empty() || !pricing.is_consistent_with(items.iter().map(|i| i.subtotal)) {
            error!(
                session = %session.external_id,
                subtotal = %session.subtotal,
                total = %session.total,
                "Stored session total does not match its components"
            );
            return Err(OrderCreationError::RolledBack(ServiceError::InternalError(
                format!("pricing mismatch for session {}", session.external_id),
            )));
        }

        let txn = db
            .begin()
            .await
            .map_err(|e| OrderCreationError::RolledBack(e.into()))?;

        let order = match insert_order_with_stock(&txn, session, &items).await {
            Ok(order) => order,
            Err(err) => {
                if let Err(rollback_err) = txn.rollback().await {
                    warn!(error = %rollback_err, "Rollback after failed order creation errored");
                }
                return Err(OrderCreationError::RolledBack(err));
            }
        };

        txn.commit()
            .await
            .map_err(|e| OrderCreationError::CommitFailed(e.into()))?;

        info!(
            order = %order.external_id,
            invoice = %order.invoice_number,
            session = %session.external_id,
            total = %order.total,
            "Order created"
        );
        counter!("marketplace_orders_created_total", 1);
        self.event_sender
            .publish(Event::OrderCreated {
                order_id: order.id,
                external_id: order.external_id.clone(),
                checkout_session_id: session.id,
                total: order.total,
            })
            .await;

        Ok(order)
    }

    /// Clears a confirmation claim on a session that never produced an order.
    pub(crate) async fn release_confirmation(&self, session_id: Uuid) -> Result<bool, ServiceError> {
        let result = checkout_session::Entity::update_many()
            .col_expr(
                checkout_session::Column::ConfirmedAt,
                Expr::value(Option::<DateTime<Utc>>::None),
            )
            .col_expr(checkout_session::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(checkout_session::Column::Id.eq(session_id))
            .filter(checkout_session::Column::Status.eq(SessionStatus::Pending))
            .filter(checkout_session::Column::ConfirmedAt.is_not_null())
            .exec(&*self.db_pool)
            .await?;
        Ok(result.rows_affected > 0)
    }

    #[instrument(skip(self))]
    pub async fn get_order(&self, id: Uuid) -> Result<OrderDetails, ServiceError> {
        let order = order::Entity::find_by_id(id)
            .one(&*self.db_pool)
            .await?
            .ok_or_else(|| ServiceError::OrderNotFound(id.to_string()))?;
        self.with_details(order).await
    }

    #[instrument(skip(self))]
    pub async fn get_order_by_external_id(&self, external_id: &str) -> Result<OrderDetails, ServiceError> {
        let order = find_order_by_external_id(&*self.db_pool, external_id).await?;
        self.with_details(order).await
    }

    #[instrument(skip(self))]
    pub async fn list_orders(&self, query: &OrderQuery) -> Result<OrderPage, ServiceError> {
        let (orders, total) = query.builder().execute(&*self.db_pool).await?;
        Ok(OrderPage {
            orders,
            total,
            page: query.page,
            limit: query.limit,
        })
    }

    /// Administrative status change, subject to the same transition table as payments.
    #[instrument(skip(self))]
    pub async fn update_order_status(
        &self,
        id: Uuid,
        next: OrderStatus,
    ) -> Result<OrderDetails, ServiceError> {
        let now = Utc::now();
        let txn = self.db_pool.begin().await?;

        let current = order::Entity::find_by_id(id)
            .lock_exclusive()
            .one(&txn)
            .await?
            .ok_or_else(|| ServiceError::OrderNotFound(id.to_string()))?;

        let previous = current.status;
        match previous.transition_to(next) {
            Transition::NoOp => {
                txn.commit().await?;
                return self.with_details(current).await;
            }
            Transition::Reject => {
                txn.rollback().await?;
                return Err(ServiceError::InvalidStatusTransition {
                    from: previous,
                    to: next,
                });
            }
            Transition::Apply => {}
        }

        if let Err(err) = apply_status_change(&txn, &current, next, now).await {
            txn.rollback().await?;
            return Err(err);
        }
        txn.commit().await?;

        info!(order = %current.external_id, from = %previous, to = %next, "Order status updated");
        counter!("marketplace_order_status_changes_total", 1, "status" => next.to_string());
        self.event_sender
            .publish(Event::OrderStatusChanged {
                order_id: current.id,
                old_status: previous,
                new_status: next,
            })
            .await;

        self.get_order(id).await
    }

    async fn with_details(&self, order: order::Model) -> Result<OrderDetails, ServiceError> {
        let db = &*self.db_pool;
        let items = order_item::Entity::find()
            .filter(order_item::Column::OrderId.eq(order.id))
            .order_by_asc(order_item::Column::Position)
            .all(db)
            .await?;
        let payments = payment::Entity::find()
            .filter(payment::Column::OrderId.eq(order.id))
            .order_by_asc(payment::Column::CreatedAt)
            .all(db)
            .await?;
        Ok(OrderDetails {
            order,
            items,
            payments,
        })
    }
}

pub(crate) async fn find_order_by_external_id<C: ConnectionTrait>(
    db: &C,
    external_id: &str,
) -> Result<order::Model, ServiceError> {
    order::Entity::find()
        .filter(order::Column::ExternalId.eq(external_id))
        .one(db)
        .await?
        .ok_or_else(|| ServiceError::OrderNotFound(external_id.to_string()))
}

async fn insert_order_with_stock(
    txn: &DatabaseTransaction,
    session: &checkout_session::Model,
    items: &[checkout_session_item::Model],
) -> Result<order::Model, ServiceError> {
    let now = Utc::now();
    let order_id = Uuid::new_v4();

    let order = order::ActiveModel {
        id: Set(order_id),
        external_id: Set(new_order_external_id()),
        invoice_number: Set(new_invoice_number(now)),
        user_id: Set(session.user_id),
        checkout_session_id: Set(session.id),
        currency: Set(session.currency.clone()),
        subtotal: Set(session.subtotal),
        tax: Set(session.tax),
        shipping_fee: Set(session.shipping_fee),
        discount: Set(session.discount),
        total: Set(session.total),
        status: Set(OrderStatus::PendingPayment),
        shipping_address_id: Set(session.shipping_address_id),
        payment_claimed_at: Set(None),
        created_at: Set(now),
        updated_at: Set(now),
    }
    .insert(txn)
    .await?;

    for item in items {
        order_item::ActiveModel {
            id: Set(Uuid::new_v4()),
            order_id: Set(order_id),
            position: Set(item.position),
            variant_id: Set(item.variant_id),
            variant_name: Set(item.variant_name.clone()),
            product_name: Set(item.product_name.clone()),
            image_url: Set(item.image_url.clone()),
            quantity: Set(item.quantity),
            unit_type: Set(item.unit_type.clone()),
            unit_price: Set(item.unit_price),
            subtotal: Set(item.subtotal),
        }
        .insert(txn)
        .await?;
    }

    // Deduct in variant order so concurrent confirmations lock rows in the same order.
    let mut deductions: Vec<&checkout_session_item::Model> = items.iter().collect();
    deductions.sort_by_key(|i| i.variant_id);
    for item in deductions {
        let result = variant::Entity::update_many()
            .col_expr(
                variant::Column::Stock,
                Expr::col(variant::Column::Stock).sub(item.quantity),
            )
            .col_expr(variant::Column::UpdatedAt, Expr::value(now))
            .filter(variant::Column::Id.eq(item.variant_id))
            .filter(variant::Column::Stock.gte(item.quantity))
            .exec(txn)
            .await?;
        if result.rows_affected == 0 {
            counter!("marketplace_stock_deduction_failures_total", 1);
            return Err(ServiceError::InsufficientStock(format!(
                "variant {} cannot cover {} units",
                item.variant_id, item.quantity
            )));
        }
    }

    Ok(order)
}
