use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use metrics::{counter, gauge};
use sea_orm::{ColumnTrait, EntityTrait, QueryFilter, QueryOrder, QuerySelect};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::{
    db::DbPool,
    entities::{checkout_session, SessionStatus},
    errors::ServiceError,
    services::checkout_sessions::CheckoutSessionService,
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub examined: usize,
    pub expired: usize,
    pub failed: usize,
}

/// Marks pending sessions past their expiry as expired.
///
/// Sessions holding a confirmation claim are skipped; they belong to the order
/// path or the orphan sweeper.
#[derive(Clone)]
pub struct SessionExpirySweeper {
    db_pool: Arc<DbPool>,
    sessions: CheckoutSessionService,
    batch_size: u64,
}

impl SessionExpirySweeper {
    pub fn new(db_pool: Arc<DbPool>, sessions: CheckoutSessionService, batch_size: u64) -> Self {
        Self {
            db_pool,
            sessions,
            batch_size: batch_size.max(1),
        }
    }

    pub async fn sweep_once(&self) -> Result<SweepReport, ServiceError> {
        let now = Utc::now();
        let candidates = checkout_session::Entity::find()
            .filter(checkout_session::Column::Status.eq(SessionStatus::Pending))
            .filter(checkout_session::Column::ExpiresAt.lt(now))
            .filter(checkout_session::Column::ConfirmedAt.is_null())
            .order_by_asc(checkout_session::Column::ExpiresAt)
            .limit(self.batch_size)
            .all(&*self.db_pool)
            .await?;

        let mut report = SweepReport {
            examined: candidates.len(),
            ..SweepReport::default()
        };

        for session in candidates {
            match self.sessions.mark_expired(session.id).await {
                Ok(true) => report.expired += 1,
                Ok(false) => debug!(session = %session.external_id, "Session left pending before expiry"),
                Err(e) => {
                    report.failed += 1;
                    warn!(session = %session.external_id, error = %e, "Failed to expire session");
                }
            }
        }

        if report.examined > 0 {
            info!(
                examined = report.examined,
                expired = report.expired,
                failed = report.failed,
                "Session expiry sweep finished"
            );
        }
        gauge!("marketplace_session_sweep_last_expired", report.expired as f64);
        if report.failed > 0 {
            counter!("marketplace_session_sweep_failures_total", report.failed as u64);
        }
        Ok(report)
    }

    pub fn spawn(self, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(interval_secs = interval.as_secs(), "Starting session expiry sweeper");
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if let Err(e) = self.sweep_once().await {
                    error!(error = %e, "Session expiry sweep failed");
                }
            }
        })
    }
}
