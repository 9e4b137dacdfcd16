use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::{entity::prelude::*, Set};
use serde::{Deserialize, Serialize};

use super::checkout_session::SessionStatus;

#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    EnumIter,
    DeriveActiveEnum,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(32))")]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum OrderStatus {
    #[sea_orm(string_value = "pending_payment")]
    PendingPayment,
    #[sea_orm(string_value = "paid")]
    Paid,
    #[sea_orm(string_value = "failed")]
    Failed,
    #[sea_orm(string_value = "cancelled")]
    Cancelled,
}

/// Outcome of evaluating a requested status change against the current status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Apply,
    NoOp,
    Reject,
}

impl OrderStatus {
    /// Guarded transition table shared by payment reconciliation and admin updates.
    ///
    /// Repeating the current status is a no-op. `Paid` and `Cancelled` are final,
    /// and nothing returns to `PendingPayment`.
    pub fn transition_to(self, next: OrderStatus) -> Transition {
        use OrderStatus::*;
        if self == next {
            return Transition::NoOp;
        }
        match (self, next) {
            (PendingPayment, Paid | Failed | Cancelled) => Transition::Apply,
            (Failed, Cancelled) => Transition::Apply,
            _ => Transition::Reject,
        }
    }

    /// Session status that mirrors this order status.
    pub fn session_status(self) -> SessionStatus {
        match self {
            OrderStatus::PendingPayment => SessionStatus::Pending,
            OrderStatus::Paid => SessionStatus::Paid,
            OrderStatus::Failed | OrderStatus::Cancelled => SessionStatus::Cancelled,
        }
    }

    /// Whether stock deducted at confirmation should be returned when entering `next`.
    pub fn restocks_on(self, next: OrderStatus) -> bool {
        next == OrderStatus::Cancelled
            && matches!(self, OrderStatus::PendingPayment | OrderStatus::Failed)
    }
}

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "orders")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    #[sea_orm(unique)]
    pub external_id: String,
    #[sea_orm(unique)]
    pub invoice_number: String,
    pub user_id: Option<Uuid>,
    #[sea_orm(unique)]
    pub checkout_session_id: Uuid,
    pub currency: String,
    #[sea_orm(column_type = "Decimal(Some((19, 4)))")]
    pub subtotal: Decimal,
    #[sea_orm(column_type = "Decimal(Some((19, 4)))")]
    pub tax: Decimal,
    #[sea_orm(column_type = "Decimal(Some((19, 4)))")]
    pub shipping_fee: Decimal,
    #[sea_orm(column_type = "Decimal(Some((19, 4)))")]
    pub discount: Decimal,
    #[sea_orm(column_type = "Decimal(Some((19, 4)))")]
    pub total: Decimal,
    pub status: OrderStatus,
    pub shipping_address_id: Option<Uuid>,
    /// Set while a payment request is being opened; cleared once it is recorded.
    #[serde(skip_serializing)]
    pub payment_claimed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::order_item::Entity")]
    OrderItems,
    #[sea_orm(has_many = "super::payment::Entity")]
    Payments,
    #[sea_orm(
        belongs_to = "super::checkout_session::Entity",
        from = "Column::CheckoutSessionId",
        to = "super::checkout_session::Column::Id"
    )]
    CheckoutSession,
}

impl Related<super::order_item::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::OrderItems.def()
    }
}

impl Related<super::payment::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Payments.def()
    }
}

impl Related<super::checkout_session::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::CheckoutSession.def()
    }
}

#[async_trait]
impl ActiveModelBehavior for ActiveModel {
    async fn before_save<C>(mut self, _db: &C, insert: bool) -> Result<Self, DbErr>
    where
        C: ConnectionTrait,
    {
        if !insert {
            self.updated_at = Set(Utc::now());
        }
        Ok(self)
    }
}
