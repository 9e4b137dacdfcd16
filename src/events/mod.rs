//! Post-commit domain events.
//!
//! Services publish onto a bounded channel only after their transaction has
//! committed; a failed send never undoes the write that produced the event.

use metrics::counter;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::entities::{OrderStatus, PaymentStatus};

#[derive(Debug, Error)]
#[error("event channel closed")]
pub struct EventChannelClosed;

#[derive(Clone, Debug)]
pub struct EventSender {
    sender: mpsc::Sender<Event>,
}

impl EventSender {
    pub fn new(sender: mpsc::Sender<Event>) -> Self {
        Self { sender }
    }

    /// Creates a sender with its receiving half, sized for `capacity` in-flight events.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self::new(tx), rx)
    }

    pub async fn send(&self, event: Event) -> Result<(), EventChannelClosed> {
        self.sender.send(event).await.map_err(|_| EventChannelClosed)
    }

    /// Sends and logs on failure; used after commits where the event is advisory.
    pub async fn publish(&self, event: Event) {
        let kind = event.kind();
        if self.send(event).await.is_err() {
            warn!(event = kind, "Dropping event: channel closed");
            counter!("marketplace_events_dropped_total", 1, "event" => kind);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    CheckoutSessionCreated {
        session_id: Uuid,
        external_id: String,
        total: Decimal,
    },
    CheckoutSessionExpired {
        session_id: Uuid,
    },
    CheckoutSessionCancelled {
        session_id: Uuid,
    },
    OrderCreated {
        order_id: Uuid,
        external_id: String,
        checkout_session_id: Uuid,
        total: Decimal,
    },
    OrderStatusChanged {
        order_id: Uuid,
        old_status: OrderStatus,
        new_status: OrderStatus,
    },
    PaymentInitiated {
        order_id: Uuid,
        payment_request_id: String,
    },
    PaymentReconciled {
        order_id: Uuid,
        payment_request_id: String,
        status: PaymentStatus,
    },
    OrphanedSessionResolved {
        session_id: Uuid,
        order_created: bool,
    },
}

impl Event {
    pub fn kind(&self) -> &'static str {
        match self {
            Event::CheckoutSessionCreated { .. } => "checkout_session_created",
            Event::CheckoutSessionExpired { .. } => "checkout_session_expired",
            Event::CheckoutSessionCancelled { .. } => "checkout_session_cancelled",
            Event::OrderCreated { .. } => "order_created",
            Event::OrderStatusChanged { .. } => "order_status_changed",
            Event::PaymentInitiated { .. } => "payment_initiated",
            Event::PaymentReconciled { .. } => "payment_reconciled",
            Event::OrphanedSessionResolved { .. } => "orphaned_session_resolved",
        }
    }
}

/// Drains the channel, logging each event. Returns when every sender is dropped.
pub async fn process_events(mut rx: mpsc::Receiver<Event>) {
    info!("Starting event processing loop");

    while let Some(event) = rx.recv().await {
        let kind = event.kind();
        counter!("marketplace_events_total", 1, "event" => kind);
        match serde_json::to_string(&event) {
            Ok(payload) => info!(event = kind, %payload, "domain event"),
            Err(e) => warn!(event = kind, error = %e, "Failed to serialize event"),
        }
    }

    info!("Event processing loop stopped");
}
