//! Resolves sessions that were claimed for confirmation but never produced an order.
//!
//! This happens when an order commit fails with an unknown outcome or the
//! claim release itself fails. After a grace period the session is either
//! released for the buyer to confirm again or the order is created again,
//! depending on the configured policy.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use metrics::counter;
use sea_orm::{ColumnTrait, EntityTrait, QueryFilter, QueryOrder, QuerySelect, RelationTrait};
use sea_orm::JoinType;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use crate::{
    config::OrphanPolicy,
    db::DbPool,
    entities::{checkout_session, order, SessionStatus},
    errors::ServiceError,
    events::{Event, EventSender},
    services::orders::{OrderCreationError, OrderService},
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OrphanReport {
    pub examined: usize,
    pub orders_created: usize,
    pub reverted: usize,
    pub failed: usize,
}

#[derive(Clone)]
pub struct OrphanedConfirmationSweeper {
    db_pool: Arc<DbPool>,
    orders: OrderService,
    event_sender: Arc<EventSender>,
    policy: OrphanPolicy,
    grace_period: Duration,
    batch_size: u64,
}

impl OrphanedConfirmationSweeper {
    pub fn new(
        db_pool: Arc<DbPool>,
        orders: OrderService,
        event_sender: Arc<EventSender>,
        policy: OrphanPolicy,
        grace_period: Duration,
        batch_size: u64,
    ) -> Self {
        Self {
            db_pool,
            orders,
            event_sender,
            policy,
            grace_period,
            batch_size: batch_size.max(1),
        }
    }

    pub async fn sweep_once(&self) -> Result<OrphanReport, ServiceError> {
        let grace = chrono::Duration::from_std(self.grace_period)
            .map_err(|e| ServiceError::InternalError(format!("orphan grace period: {}", e)))?;
        let cutoff = Utc::now() - grace;

        let orphans = checkout_session::Entity::find()
            .join(JoinType::LeftJoin, checkout_session::Relation::Order.def())
            .filter(order::Column::Id.is_null())
            .filter(checkout_session::Column::Status.eq(SessionStatus::Pending))
            .filter(checkout_session::Column::ConfirmedAt.lt(cutoff))
            .order_by_asc(checkout_session::Column::ConfirmedAt)
            .limit(self.batch_size)
            .all(&*self.db_pool)
            .await?;

        let mut report = OrphanReport {
            examined: orphans.len(),
            ..OrphanReport::default()
        };

        for session in orphans {
            warn!(session = %session.external_id, policy = ?self.policy, "Resolving orphaned confirmation");
            match self.resolve(&session).await {
                Ok(order_created) => {
                    if order_created {
                        report.orders_created += 1;
                    } else {
                        report.reverted += 1;
                    }
                    self.event_sender
                        .publish(Event::OrphanedSessionResolved {
                            session_id: session.id,
                            order_created,
                        })
                        .await;
                }
                Err(e) => {
                    report.failed += 1;
                    error!(session = %session.external_id, error = %e, "Failed to resolve orphaned confirmation");
                }
            }
        }

        if report.examined > 0 {
            info!(
                examined = report.examined,
                orders_created = report.orders_created,
                reverted = report.reverted,
                failed = report.failed,
                "Orphaned confirmation sweep finished"
            );
            counter!("marketplace_orphaned_sessions_total", report.examined as u64);
        }
        Ok(report)
    }

    /// Returns whether an order now exists for the session.
    async fn resolve(&self, session: &checkout_session::Model) -> Result<bool, ServiceError> {
        if self.policy == OrphanPolicy::Retry {
            match self.orders.create_order_for_session(session).await {
                Ok(_) => return Ok(true),
                Err(OrderCreationError::RolledBack(reason)) => {
                    info!(session = %session.external_id, %reason, "Retry rolled back; reverting confirmation");
                }
                // Outcome unknown: the order may exist, so the claim stays.
                Err(OrderCreationError::CommitFailed(err)) => return Err(err),
            }
        }

        if self.orders.release_confirmation(session.id).await? {
            Ok(false)
        } else {
            Err(ServiceError::Conflict(format!(
                "session {} changed while resolving",
                session.external_id
            )))
        }
    }

    pub fn spawn(self, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(interval_secs = interval.as_secs(), policy = ?self.policy, "Starting orphaned confirmation sweeper");
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if let Err(e) = self.sweep_once().await {
                    error!(error = %e, "Orphaned confirmation sweep failed");
                }
            }
        })
    }
}
