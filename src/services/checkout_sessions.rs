//! Checkout session lifecycle: creation, address updates, expiry and cancellation.
//!
//! Every mutation after creation is a single conditional `UPDATE` gated on the
//! session still being pending, unconfirmed and unexpired. Zero affected rows
//! means the session moved on under us and the caller gets `SessionNotPending`.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use metrics::counter;
use sea_orm::{
    sea_query::Expr, ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter,
    QueryOrder, Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use tracing::{error, info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

use crate::{
    db::DbPool,
    entities::{
        address, checkout_session, checkout_session_item, product, variant, SessionStatus,
    },
    errors::ServiceError,
    events::{Event, EventSender},
    services::pricing::{Destination, Discount, PriceLine, PricingBreakdown, PricingCalculator},
};

pub const MAX_SESSION_ITEMS: usize = 100;

/// Who a session belongs to. Sessions are never shared between the two.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "snake_case")]
pub enum SessionOwner {
    User(Uuid),
    Guest(String),
}

impl SessionOwner {
    /// Exactly one of the two identifiers must be present.
    pub fn from_parts(user_id: Option<Uuid>, guest_id: Option<String>) -> Result<Self, ServiceError> {
        match (user_id, guest_id) {
            (Some(user_id), None) => Ok(SessionOwner::User(user_id)),
            (None, Some(guest_id)) if !guest_id.trim().is_empty() => Ok(SessionOwner::Guest(guest_id)),
            (None, Some(_)) => Err(ServiceError::InvalidInput(
                "guest_id cannot be blank".to_string(),
            )),
            (None, None) => Err(ServiceError::InvalidInput(
                "either user_id or guest_id is required".to_string(),
            )),
            (Some(_), Some(_)) => Err(ServiceError::InvalidInput(
                "user_id and guest_id are mutually exclusive".to_string(),
            )),
        }
    }

    fn of_session(session: &checkout_session::Model) -> Option<Self> {
        Self::from_parts(session.user_id, session.guest_id.clone()).ok()
    }

    fn owns(&self, address: &address::Model) -> bool {
        match self {
            SessionOwner::User(id) => address.user_id == Some(*id),
            SessionOwner::Guest(id) => address.guest_id.as_deref() == Some(id.as_str()),
        }
    }

    fn user_id(&self) -> Option<Uuid> {
        match self {
            SessionOwner::User(id) => Some(*id),
            SessionOwner::Guest(_) => None,
        }
    }

    fn guest_id(&self) -> Option<String> {
        match self {
            SessionOwner::User(_) => None,
            SessionOwner::Guest(id) => Some(id.clone()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct CartItemInput {
    pub variant_id: Uuid,
    #[validate(range(max = 10000, message = "Quantity too large"))]
    pub quantity: i32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
pub struct CreateSessionInput {
    pub items: Vec<CartItemInput>,
    pub user_id: Option<Uuid>,
    #[validate(length(min = 1, max = 128, message = "guest_id must be 1-128 characters"))]
    pub guest_id: Option<String>,
    #[serde(default)]
    pub discount: Discount,
}

/// A session with its item snapshots.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckoutSessionDetails {
    #[serde(flatten)]
    pub session: checkout_session::Model,
    pub items: Vec<checkout_session_item::Model>,
}

impl CheckoutSessionDetails {
    pub fn pricing(&self) -> PricingBreakdown {
        pricing_of(&self.session)
    }
}

pub(crate) fn pricing_of(session: &checkout_session::Model) -> PricingBreakdown {
    PricingBreakdown {
        subtotal: session.subtotal,
        tax: session.tax,
        shipping_fee: session.shipping_fee,
        discount: session.discount,
        total: session.total,
    }
}

pub(crate) fn new_session_external_id() -> String {
    format!("cs_{}", Uuid::new_v4().simple())
}

pub(crate) async fn find_session_by_external_id<C: ConnectionTrait>(
    db: &C,
    external_id: &str,
) -> Result<checkout_session::Model, ServiceError> {
    checkout_session::Entity::find()
        .filter(checkout_session::Column::ExternalId.eq(external_id))
        .one(db)
        .await?
        .ok_or_else(|| ServiceError::SessionNotFound(external_id.to_string()))
}

pub(crate) async fn load_session_items<C: ConnectionTrait>(
    db: &C,
    session_id: Uuid,
) -> Result<Vec<checkout_session_item::Model>, ServiceError> {
    Ok(checkout_session_item::Entity::find()
        .filter(checkout_session_item::Column::CheckoutSessionId.eq(session_id))
        .order_by_asc(checkout_session_item::Column::Position)
        .all(db)
        .await?)
}

/// Currency and lifetime applied to newly created sessions.
#[derive(Debug, Clone)]
pub struct CheckoutSettings {
    pub currency: String,
    pub session_ttl: Duration,
}

impl Default for CheckoutSettings {
    fn default() -> Self {
        Self {
            currency: "USD".to_string(),
            session_ttl: Duration::seconds(3600),
        }
    }
}

#[derive(Clone)]
pub struct CheckoutSessionService {
    db_pool: Arc<DbPool>,
    event_sender: Arc<EventSender>,
    pricing: PricingCalculator,
    settings: CheckoutSettings,
}

impl CheckoutSessionService {
    pub fn new(
        db_pool: Arc<DbPool>,
        event_sender: Arc<EventSender>,
        pricing: PricingCalculator,
        settings: CheckoutSettings,
    ) -> Self {
        Self {
            db_pool,
            event_sender,
            pricing,
            settings,
        }
    }

    /// Prices a cart against current catalog prices and persists it as a pending session.
    ///
    /// Stock is checked here only to fail early; nothing is reserved until
    /// confirmation.
    #[instrument(skip(self, input), fields(items = input.items.len()))]
    pub async fn create_session(
        &self,
        input: CreateSessionInput,
    ) -> Result<CheckoutSessionDetails, ServiceError> {
        if input.items.is_empty() {
            return Err(ServiceError::InvalidInput(
                "checkout requires at least one item".to_string(),
            ));
        }
        if input.items.len() > MAX_SESSION_ITEMS {
            return Err(ServiceError::InvalidInput(format!(
                "checkout accepts at most {} items",
                MAX_SESSION_ITEMS
            )));
        }
        let mut seen = HashSet::with_capacity(input.items.len());
        for item in &input.items {
            if item.quantity <= 0 {
                return Err(ServiceError::InvalidInput(format!(
                    "quantity for variant {} must be positive",
                    item.variant_id
                )));
            }
            if !seen.insert(item.variant_id) {
                return Err(ServiceError::InvalidInput(format!(
                    "variant {} appears more than once",
                    item.variant_id
                )));
            }
            item.validate()?;
        }
        input.validate()?;
        let owner = SessionOwner::from_parts(input.user_id, input.guest_id.clone())?;

        let db = &*self.db_pool;
        let variant_ids: Vec<Uuid> = input.items.iter().map(|i| i.variant_id).collect();
        let catalog: HashMap<Uuid, (variant::Model, Option<product::Model>)> =
            variant::Entity::find()
                .filter(variant::Column::Id.is_in(variant_ids))
                .find_also_related(product::Entity)
                .all(db)
                .await?
                .into_iter()
                .map(|(v, p)| (v.id, (v, p)))
                .collect();

        let mut lines = Vec::with_capacity(input.items.len());
        for item in &input.items {
            let (variant, _) = catalog
                .get(&item.variant_id)
                .ok_or_else(|| ServiceError::VariantNotFound(item.variant_id.to_string()))?;
            if variant.stock < item.quantity {
                return Err(ServiceError::InsufficientStock(format!(
                    "variant {} has {} in stock, {} requested",
                    variant.id, variant.stock, item.quantity
                )));
            }
            lines.push(PriceLine::new(variant.price, item.quantity));
        }

        let pricing = self.pricing.calculate(&lines, None, input.discount)?;
        let now = Utc::now();
        let session_id = Uuid::new_v4();
        let external_id = new_session_external_id();

        let txn = db.begin().await?;

        let session = checkout_session::ActiveModel {
            id: Set(session_id),
            external_id: Set(external_id.clone()),
            status: Set(SessionStatus::Pending),
            user_id: Set(owner.user_id()),
            guest_id: Set(owner.guest_id()),
            shipping_address_id: Set(None),
            currency: Set(self.settings.currency.clone()),
            subtotal: Set(pricing.subtotal),
            tax: Set(pricing.tax),
            shipping_fee: Set(pricing.shipping_fee),
            discount: Set(pricing.discount),
            total: Set(pricing.total),
            expires_at: Set(now + self.settings.session_ttl),
            confirmed_at: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&txn)
        .await
        .map_err(|e| {
            error!(error = %e, "Failed to insert checkout session");
            ServiceError::DatabaseError(e)
        })?;

        let mut items = Vec::with_capacity(input.items.len());
        for (position, (item, line)) in input.items.iter().zip(&lines).enumerate() {
            let Some((variant, product)) = catalog.get(&item.variant_id) else {
                continue;
            };
            let snapshot = checkout_session_item::ActiveModel {
                id: Set(Uuid::new_v4()),
                checkout_session_id: Set(session_id),
                position: Set(position as i32),
                variant_id: Set(variant.id),
                variant_name: Set(variant.name.clone()),
                product_name: Set(product
                    .as_ref()
                    .map(|p| p.name.clone())
                    .unwrap_or_default()),
                image_url: Set(variant.image_url.clone()),
                quantity: Set(item.quantity),
                unit_type: Set(variant.unit_type.clone()),
                unit_price: Set(line.unit_price),
                subtotal: Set(line.subtotal()),
            }
            .insert(&txn)
            .await?;
            items.push(snapshot);
        }

        txn.commit().await?;

        info!(
            session_id = %session.id,
            external_id = %session.external_id,
            total = %session.total,
            "Checkout session created"
        );
        counter!("marketplace_checkout_sessions_created_total", 1);
        self.event_sender
            .publish(Event::CheckoutSessionCreated {
                session_id: session.id,
                external_id: session.external_id.clone(),
                total: session.total,
            })
            .await;

        Ok(CheckoutSessionDetails { session, items })
    }

    #[instrument(skip(self))]
    pub async fn get_session(&self, external_id: &str) -> Result<CheckoutSessionDetails, ServiceError> {
        let db = &*self.db_pool;
        let session = find_session_by_external_id(db, external_id).await?;
        let items = load_session_items(db, session.id).await?;
        Ok(CheckoutSessionDetails { session, items })
    }

    /// Attaches an owned address and reprices shipping and tax for its country.
    #[instrument(skip(self))]
    pub async fn update_session_address(
        &self,
        external_id: &str,
        address_id: Uuid,
    ) -> Result<CheckoutSessionDetails, ServiceError> {
        let db = &*self.db_pool;
        let now = Utc::now();
        let session = find_session_by_external_id(db, external_id).await?;
        if !session.is_mutable_at(now) {
            return Err(ServiceError::SessionNotPending(external_id.to_string()));
        }

        let address = address::Entity::find_by_id(address_id)
            .one(db)
            .await?
            .ok_or_else(|| ServiceError::AddressNotFound(address_id.to_string()))?;
        let owned = SessionOwner::of_session(&session)
            .map(|owner| owner.owns(&address))
            .unwrap_or(false);
        if !owned {
            warn!(session = %external_id, address_id = %address_id, "Address belongs to another owner");
            return Err(ServiceError::AddressNotFound(address_id.to_string()));
        }

        let items = load_session_items(db, session.id).await?;
        let lines: Vec<PriceLine> = items
            .iter()
            .map(|i| PriceLine::new(i.unit_price, i.quantity))
            .collect();
        // The discount was resolved to an amount at creation; keep it fixed.
        let pricing = self.pricing.calculate(
            &lines,
            Some(&Destination::new(address.country_code.clone())),
            Discount::Fixed(session.discount),
        )?;

        let result = checkout_session::Entity::update_many()
            .col_expr(
                checkout_session::Column::ShippingAddressId,
                Expr::value(Some(address.id)),
            )
            .col_expr(checkout_session::Column::Subtotal, Expr::value(pricing.subtotal))
            .col_expr(checkout_session::Column::Tax, Expr::value(pricing.tax))
            .col_expr(
                checkout_session::Column::ShippingFee,
                Expr::value(pricing.shipping_fee),
            )
            .col_expr(checkout_session::Column::Discount, Expr::value(pricing.discount))
            .col_expr(checkout_session::Column::Total, Expr::value(pricing.total))
            .col_expr(checkout_session::Column::UpdatedAt, Expr::value(now))
            .filter(checkout_session::Column::Id.eq(session.id))
            .filter(checkout_session::Column::Status.eq(SessionStatus::Pending))
            .filter(checkout_session::Column::ConfirmedAt.is_null())
            .filter(checkout_session::Column::ExpiresAt.gt(now))
            .exec(db)
            .await?;

        if result.rows_affected == 0 {
            return Err(ServiceError::SessionNotPending(external_id.to_string()));
        }

        info!(session = %external_id, total = %pricing.total, "Checkout session address updated");
        self.get_session(external_id).await
    }

    /// Moves a pending, unconfirmed session to `Expired`.
    ///
    /// Returns `false` when the session was already past pending or has been
    /// claimed by a confirmation; neither is an error.
    #[instrument(skip(self))]
    pub async fn mark_expired(&self, session_id: Uuid) -> Result<bool, ServiceError> {
        let changed = self
            .transition_pending(session_id, SessionStatus::Expired, Utc::now())
            .await?;
        if changed {
            counter!("marketplace_checkout_sessions_expired_total", 1);
            self.event_sender
                .publish(Event::CheckoutSessionExpired { session_id })
                .await;
        }
        Ok(changed)
    }

    /// Buyer-initiated abandonment of a pending session.
    #[instrument(skip(self))]
    pub async fn cancel_session(&self, external_id: &str) -> Result<CheckoutSessionDetails, ServiceError> {
        let db = &*self.db_pool;
        let session = find_session_by_external_id(db, external_id).await?;
        let changed = self
            .transition_pending(session.id, SessionStatus::Cancelled, Utc::now())
            .await?;
        if !changed {
            return Err(ServiceError::SessionNotPending(external_id.to_string()));
        }

        info!(session = %external_id, "Checkout session cancelled");
        self.event_sender
            .publish(Event::CheckoutSessionCancelled {
                session_id: session.id,
            })
            .await;
        self.get_session(external_id).await
    }

    async fn transition_pending(
        &self,
        session_id: Uuid,
        status: SessionStatus,
        now: DateTime<Utc>,
    ) -> Result<bool, ServiceError> {
        let result = checkout_session::Entity::update_many()
            .col_expr(checkout_session::Column::Status, Expr::value(status))
            .col_expr(checkout_session::Column::UpdatedAt, Expr::value(now))
            .filter(checkout_session::Column::Id.eq(session_id))
            .filter(checkout_session::Column::Status.eq(SessionStatus::Pending))
            .filter(checkout_session::Column::ConfirmedAt.is_null())
            .exec(&*self.db_pool)
            .await?;
        Ok(result.rows_affected > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn owner_requires_exactly_one_identity() {
        let user = Uuid::new_v4();
        assert_eq!(
            SessionOwner::from_parts(Some(user), None).unwrap(),
            SessionOwner::User(user)
        );
        assert_eq!(
            SessionOwner::from_parts(None, Some("g-1".into())).unwrap(),
            SessionOwner::Guest("g-1".into())
        );
        assert_matches!(
            SessionOwner::from_parts(None, None),
            Err(ServiceError::InvalidInput(_))
        );
        assert_matches!(
            SessionOwner::from_parts(Some(user), Some("g-1".into())),
            Err(ServiceError::InvalidInput(_))
        );
        assert_matches!(
            SessionOwner::from_parts(None, Some("  ".into())),
            Err(ServiceError::InvalidInput(_))
        );
    }

    #[test]
    fn guest_cannot_use_user_address() {
        let user = Uuid::new_v4();
        let address = address::Model {
            id: Uuid::new_v4(),
            user_id: Some(user),
            guest_id: None,
            recipient_name: "A".into(),
            line1: "1 Main St".into(),
            line2: None,
            city: "Springfield".into(),
            region: None,
            postal_code: "12345".into(),
            country_code: "US".into(),
            created_at: Utc::now(),
        };
        assert!(SessionOwner::User(user).owns(&address));
        assert!(!SessionOwner::Guest(user.to_string()).owns(&address));
        assert!(!SessionOwner::User(Uuid::new_v4()).owns(&address));
    }

    #[test]
    fn external_ids_are_prefixed() {
        let id = new_session_external_id();
        assert!(id.starts_with("cs_"));
        assert_eq!(id.len(), 35);
    }
}
